use super::{check_name, check_prefix_family, check_rule, check_text, mismatch, quote, MapperTable};
use crate::error::{CoreError, CoreResult};
use crate::models::{CommandModel, Operation, PrefixListIntent, PrefixListRule};

const MAX_RULE: u32 = 4_294_967_294;

pub fn base() -> MapperTable {
    MapperTable::new()
        .with(Operation::AddRule, add_rule)
        .with(Operation::RemoveRule, remove_rule)
        .with(Operation::SetDescription, set_description)
        .with(Operation::RemovePolicy, remove_policy)
}

fn node(ipv6: bool) -> &'static str {
    if ipv6 {
        "prefix-list6"
    } else {
        "prefix-list"
    }
}

fn intent(model: &CommandModel, op: Operation) -> CoreResult<&PrefixListIntent> {
    match model {
        CommandModel::PrefixList(intent) => Ok(intent),
        other => Err(mismatch(other, op)),
    }
}

fn add_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    let PrefixListIntent::AddRule(rule) = intent(model, Operation::AddRule)? else {
        return Err(mismatch(model, Operation::AddRule));
    };
    render_rule(rule)
}

fn remove_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    let PrefixListIntent::RemoveRule { name, rule, ipv6 } = intent(model, Operation::RemoveRule)?
    else {
        return Err(mismatch(model, Operation::RemoveRule));
    };
    check_name("prefix-list name", name)?;
    check_rule(*rule, MAX_RULE)?;
    Ok(vec![format!("delete policy {} {} rule {}", node(*ipv6), name, rule)])
}

fn set_description(model: &CommandModel) -> CoreResult<Vec<String>> {
    let PrefixListIntent::SetDescription {
        name,
        description,
        ipv6,
    } = intent(model, Operation::SetDescription)?
    else {
        return Err(mismatch(model, Operation::SetDescription));
    };
    check_name("prefix-list name", name)?;
    check_text("description", description)?;
    Ok(vec![format!(
        "set policy {} {} description {}",
        node(*ipv6),
        name,
        quote(description)
    )])
}

fn remove_policy(model: &CommandModel) -> CoreResult<Vec<String>> {
    let PrefixListIntent::RemovePolicy { name, ipv6 } = intent(model, Operation::RemovePolicy)?
    else {
        return Err(mismatch(model, Operation::RemovePolicy));
    };
    check_name("prefix-list name", name)?;
    Ok(vec![format!("delete policy {} {}", node(*ipv6), name)])
}

fn render_rule(rule: &PrefixListRule) -> CoreResult<Vec<String>> {
    check_name("prefix-list name", &rule.name)?;
    check_rule(rule.rule, MAX_RULE)?;
    check_prefix_family(&rule.prefix, rule.ipv6)?;

    let max_len: u8 = if rule.ipv6 { 128 } else { 32 };
    for (label, bound) in [("ge", rule.ge), ("le", rule.le)] {
        if let Some(len) = bound {
            if len == 0 || len > max_len {
                return Err(CoreError::invalid(format!(
                    "{} {} is outside 1-{}",
                    label, len, max_len
                )));
            }
        }
    }
    if let (Some(ge), Some(le)) = (rule.ge, rule.le) {
        if ge > le {
            return Err(CoreError::invalid(format!("ge {} is greater than le {}", ge, le)));
        }
    }

    let prefix = format!("set policy {} {} rule {}", node(rule.ipv6), rule.name, rule.rule);
    let mut commands = vec![
        format!("{} action {}", prefix, quote(rule.action.as_str())),
        format!("{} prefix {}", prefix, quote(&rule.prefix)),
    ];
    if let Some(ge) = rule.ge {
        commands.push(format!("{} ge {}", prefix, quote(ge)));
    }
    if let Some(le) = rule.le {
        commands.push(format!("{} le {}", prefix, quote(le)));
    }
    if let Some(description) = &rule.description {
        check_text("description", description)?;
        commands.push(format!("{} description {}", prefix, quote(description)));
    }
    Ok(commands)
}
