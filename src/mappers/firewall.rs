use super::{check_name, check_rule, check_text, mismatch, quote, MapperTable};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    CommandModel, ConnectionState, FirewallFamily, FirewallIntent, FirewallRule, Operation,
};

const MAX_RULE: u32 = 999_999;

pub fn base() -> MapperTable {
    table(add_rule, remove_rule, set_default_action, remove_policy)
}

/// VyOS 1.3 predates the `firewall ipv4|ipv6` tree: rulesets live under
/// `firewall name` / `firewall ipv6-name` and state/log leaves take `enable`.
pub fn v1_3() -> MapperTable {
    table(
        add_rule_v1_3,
        remove_rule_v1_3,
        set_default_action_v1_3,
        remove_policy_v1_3,
    )
}

fn table(
    add: super::RenderFn,
    remove: super::RenderFn,
    default_action: super::RenderFn,
    drop: super::RenderFn,
) -> MapperTable {
    MapperTable::new()
        .with(Operation::AddRule, add)
        .with(Operation::RemoveRule, remove)
        .with(Operation::SetDefaultAction, default_action)
        .with(Operation::RemovePolicy, drop)
}

struct Syntax {
    root: fn(FirewallFamily, &str) -> String,
    state: fn(ConnectionState) -> String,
    log: &'static str,
}

const V1_4: Syntax = Syntax {
    root: root_v1_4,
    state: state_v1_4,
    log: "log",
};

const V1_3: Syntax = Syntax {
    root: root_v1_3,
    state: state_v1_3,
    log: "log 'enable'",
};

fn root_v1_4(family: FirewallFamily, name: &str) -> String {
    match family {
        FirewallFamily::Ipv4 => format!("firewall ipv4 name {}", name),
        FirewallFamily::Ipv6 => format!("firewall ipv6 name {}", name),
    }
}

fn root_v1_3(family: FirewallFamily, name: &str) -> String {
    match family {
        FirewallFamily::Ipv4 => format!("firewall name {}", name),
        FirewallFamily::Ipv6 => format!("firewall ipv6-name {}", name),
    }
}

fn state_v1_4(state: ConnectionState) -> String {
    format!("state {}", quote(state.as_str()))
}

fn state_v1_3(state: ConnectionState) -> String {
    format!("state {} 'enable'", state.as_str())
}

fn intent(model: &CommandModel, op: Operation) -> CoreResult<&FirewallIntent> {
    match model {
        CommandModel::Firewall(intent) => Ok(intent),
        other => Err(mismatch(other, op)),
    }
}

fn add_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_add(model, &V1_4)
}

fn add_rule_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_add(model, &V1_3)
}

fn remove_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_remove_rule(model, &V1_4)
}

fn remove_rule_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_remove_rule(model, &V1_3)
}

fn set_default_action(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_default_action(model, &V1_4)
}

fn set_default_action_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_default_action(model, &V1_3)
}

fn remove_policy(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_remove_policy(model, &V1_4)
}

fn remove_policy_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    render_remove_policy(model, &V1_3)
}

fn render_add(model: &CommandModel, syntax: &Syntax) -> CoreResult<Vec<String>> {
    let FirewallIntent::AddRule(rule) = intent(model, Operation::AddRule)? else {
        return Err(mismatch(model, Operation::AddRule));
    };
    render_rule(rule, syntax)
}

fn render_remove_rule(model: &CommandModel, syntax: &Syntax) -> CoreResult<Vec<String>> {
    let FirewallIntent::RemoveRule { name, family, rule } = intent(model, Operation::RemoveRule)?
    else {
        return Err(mismatch(model, Operation::RemoveRule));
    };
    check_name("ruleset name", name)?;
    check_rule(*rule, MAX_RULE)?;
    Ok(vec![format!("delete {} rule {}", (syntax.root)(*family, name), rule)])
}

fn render_default_action(model: &CommandModel, syntax: &Syntax) -> CoreResult<Vec<String>> {
    let FirewallIntent::SetDefaultAction {
        name,
        family,
        action,
    } = intent(model, Operation::SetDefaultAction)?
    else {
        return Err(mismatch(model, Operation::SetDefaultAction));
    };
    check_name("ruleset name", name)?;
    Ok(vec![format!(
        "set {} default-action {}",
        (syntax.root)(*family, name),
        quote(action.as_str())
    )])
}

fn render_remove_policy(model: &CommandModel, syntax: &Syntax) -> CoreResult<Vec<String>> {
    let FirewallIntent::RemovePolicy { name, family } = intent(model, Operation::RemovePolicy)?
    else {
        return Err(mismatch(model, Operation::RemovePolicy));
    };
    check_name("ruleset name", name)?;
    Ok(vec![format!("delete {}", (syntax.root)(*family, name))])
}

fn render_rule(rule: &FirewallRule, syntax: &Syntax) -> CoreResult<Vec<String>> {
    check_name("ruleset name", &rule.name)?;
    check_rule(rule.rule, MAX_RULE)?;
    if rule.destination_port.is_some() && rule.protocol.is_none() {
        return Err(CoreError::invalid(
            "destination port matching requires a protocol",
        ));
    }

    let prefix = format!("set {} rule {}", (syntax.root)(rule.family, &rule.name), rule.rule);
    let mut commands = vec![format!("{} action {}", prefix, quote(rule.action.as_str()))];

    if let Some(description) = &rule.description {
        check_text("description", description)?;
        commands.push(format!("{} description {}", prefix, quote(description)));
    }
    if let Some(protocol) = &rule.protocol {
        check_name("protocol", protocol)?;
        commands.push(format!("{} protocol {}", prefix, quote(protocol)));
    }
    if let Some(source) = &rule.source {
        check_name("source address", source)?;
        commands.push(format!("{} source address {}", prefix, quote(source)));
    }
    if let Some(destination) = &rule.destination {
        check_name("destination address", destination)?;
        commands.push(format!("{} destination address {}", prefix, quote(destination)));
    }
    if let Some(port) = &rule.destination_port {
        check_name("destination port", port)?;
        commands.push(format!("{} destination port {}", prefix, quote(port)));
    }
    for state in &rule.states {
        commands.push(format!("{} {}", prefix, (syntax.state)(*state)));
    }
    if rule.log {
        commands.push(format!("{} {}", prefix, syntax.log));
    }

    Ok(commands)
}
