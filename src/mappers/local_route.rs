use super::{check_name, check_prefix_family, check_rule, mismatch, quote, MapperTable};
use crate::error::{CoreError, CoreResult};
use crate::models::{CommandModel, LocalRouteIntent, LocalRouteRule, Operation};

const MAX_RULE: u32 = 99999;
const MAX_TABLE: u32 = 200;

pub fn base() -> MapperTable {
    MapperTable::new()
        .with(Operation::AddRule, add_rule)
        .with(Operation::RemoveRule, remove_rule)
        .with(Operation::RemovePolicy, remove_policy)
}

/// VyOS 1.3 puts the source/destination prefix directly on the rule node
/// and has no VRF target.
pub fn v1_3() -> MapperTable {
    MapperTable::new().with(Operation::AddRule, add_rule_v1_3)
}

/// Per-release spelling of the selector leaves
struct Syntax {
    source: &'static str,
    destination: &'static str,
    vrf: bool,
}

const V1_4: Syntax = Syntax {
    source: "source address",
    destination: "destination address",
    vrf: true,
};

const V1_3: Syntax = Syntax {
    source: "source",
    destination: "destination",
    vrf: false,
};

fn intent(model: &CommandModel, op: Operation) -> CoreResult<&LocalRouteIntent> {
    match model {
        CommandModel::LocalRoute(intent) => Ok(intent),
        other => Err(mismatch(other, op)),
    }
}

fn add_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    let LocalRouteIntent::AddRule(rule) = intent(model, Operation::AddRule)? else {
        return Err(mismatch(model, Operation::AddRule));
    };
    render_rule(rule, &V1_4)
}

fn add_rule_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    let LocalRouteIntent::AddRule(rule) = intent(model, Operation::AddRule)? else {
        return Err(mismatch(model, Operation::AddRule));
    };
    render_rule(rule, &V1_3)
}

fn remove_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    let LocalRouteIntent::RemoveRule { rule } = intent(model, Operation::RemoveRule)? else {
        return Err(mismatch(model, Operation::RemoveRule));
    };
    check_rule(*rule, MAX_RULE)?;
    Ok(vec![format!("delete policy local-route rule {}", rule)])
}

fn remove_policy(model: &CommandModel) -> CoreResult<Vec<String>> {
    let LocalRouteIntent::RemovePolicy = intent(model, Operation::RemovePolicy)? else {
        return Err(mismatch(model, Operation::RemovePolicy));
    };
    Ok(vec!["delete policy local-route".to_string()])
}

fn render_rule(rule: &LocalRouteRule, syntax: &Syntax) -> CoreResult<Vec<String>> {
    check_rule(rule.rule, MAX_RULE)?;
    let prefix = format!("set policy local-route rule {}", rule.rule);

    let target = match (rule.table, &rule.vrf) {
        (Some(table), None) => {
            if table == 0 || table > MAX_TABLE {
                return Err(CoreError::invalid(format!(
                    "routing table {} is outside 1-{}",
                    table, MAX_TABLE
                )));
            }
            format!("{} set table {}", prefix, quote(table))
        }
        (None, Some(vrf)) if syntax.vrf => {
            check_name("vrf", vrf)?;
            format!("{} set vrf {}", prefix, quote(vrf))
        }
        (None, Some(_)) => {
            return Err(CoreError::invalid(
                "local-route VRF targets require VyOS 1.4 or newer",
            ))
        }
        _ => {
            return Err(CoreError::invalid(
                "local-route rule needs exactly one of table or vrf",
            ))
        }
    };
    let mut commands = vec![target];

    if let Some(source) = &rule.source {
        check_prefix_family(source, false)?;
        commands.push(format!("{} {} {}", prefix, syntax.source, quote(source)));
    }
    if let Some(destination) = &rule.destination {
        check_prefix_family(destination, false)?;
        commands.push(format!(
            "{} {} {}",
            prefix,
            syntax.destination,
            quote(destination)
        ));
    }
    if let Some(iface) = &rule.inbound_interface {
        check_name("inbound-interface", iface)?;
        commands.push(format!("{} inbound-interface {}", prefix, quote(iface)));
    }
    if let Some(mark) = rule.fwmark {
        commands.push(format!("{} fwmark {}", prefix, quote(mark)));
    }
    if let Some(protocol) = &rule.protocol {
        check_name("protocol", protocol)?;
        commands.push(format!("{} protocol {}", prefix, quote(protocol)));
    }

    Ok(commands)
}
