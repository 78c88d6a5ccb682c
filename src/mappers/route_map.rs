use super::{check_name, check_rule, check_text, mismatch, quote, MapperTable};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    CommandModel, CommunityAction, CommunityMode, MatchClause, OnMatch, Operation,
    RouteMapIntent, RouteMapRule, SetClause,
};

const MAX_RULE: u32 = 65535;

pub fn base() -> MapperTable {
    MapperTable::new()
        .with(Operation::AddRule, add_rule)
        .with(Operation::RemoveRule, remove_rule)
        .with(Operation::SetDescription, set_description)
        .with(Operation::RemovePolicy, remove_policy)
}

/// VyOS 1.3 spells `as-path-prepend` as one word and uses the
/// single-value `community '<list> additive'` form.
pub fn v1_3() -> MapperTable {
    MapperTable::new().with(Operation::AddRule, add_rule_v1_3)
}

fn intent(model: &CommandModel, op: Operation) -> CoreResult<&RouteMapIntent> {
    match model {
        CommandModel::RouteMap(intent) => Ok(intent),
        other => Err(mismatch(other, op)),
    }
}

fn add_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    let RouteMapIntent::AddRule(rule) = intent(model, Operation::AddRule)? else {
        return Err(mismatch(model, Operation::AddRule));
    };
    render_rule(rule, set_clause)
}

fn add_rule_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    let RouteMapIntent::AddRule(rule) = intent(model, Operation::AddRule)? else {
        return Err(mismatch(model, Operation::AddRule));
    };
    render_rule(rule, set_clause_v1_3)
}

fn remove_rule(model: &CommandModel) -> CoreResult<Vec<String>> {
    let RouteMapIntent::RemoveRule { name, rule } = intent(model, Operation::RemoveRule)? else {
        return Err(mismatch(model, Operation::RemoveRule));
    };
    check_name("route-map name", name)?;
    check_rule(*rule, MAX_RULE)?;
    Ok(vec![format!("delete policy route-map {} rule {}", name, rule)])
}

fn set_description(model: &CommandModel) -> CoreResult<Vec<String>> {
    let RouteMapIntent::SetDescription { name, description } = intent(model, Operation::SetDescription)? else {
        return Err(mismatch(model, Operation::SetDescription));
    };
    check_name("route-map name", name)?;
    check_text("description", description)?;
    Ok(vec![format!(
        "set policy route-map {} description {}",
        name,
        quote(description)
    )])
}

fn remove_policy(model: &CommandModel) -> CoreResult<Vec<String>> {
    let RouteMapIntent::RemovePolicy { name } = intent(model, Operation::RemovePolicy)? else {
        return Err(mismatch(model, Operation::RemovePolicy));
    };
    check_name("route-map name", name)?;
    Ok(vec![format!("delete policy route-map {}", name)])
}

fn render_rule(
    rule: &RouteMapRule,
    set_syntax: fn(&SetClause) -> CoreResult<Vec<String>>,
) -> CoreResult<Vec<String>> {
    check_name("route-map name", &rule.name)?;
    check_rule(rule.rule, MAX_RULE)?;

    let prefix = format!("set policy route-map {} rule {}", rule.name, rule.rule);
    let mut commands = vec![format!("{} action {}", prefix, quote(rule.action.as_str()))];

    if let Some(description) = &rule.description {
        check_text("description", description)?;
        commands.push(format!("{} description {}", prefix, quote(description)));
    }

    // Clause order is significant inside a transaction; keep the caller's.
    for clause in &rule.matches {
        commands.push(format!("{} {}", prefix, match_clause(clause)?));
    }
    for clause in &rule.sets {
        for body in set_syntax(clause)? {
            commands.push(format!("{} {}", prefix, body));
        }
    }

    match rule.on_match {
        Some(OnMatch::Next) => commands.push(format!("{} on-match next", prefix)),
        Some(OnMatch::Goto(target)) => {
            check_rule(target, MAX_RULE)?;
            commands.push(format!("{} on-match goto {}", prefix, quote(target)));
        }
        None => {}
    }
    if let Some(call) = &rule.call {
        check_name("call target", call)?;
        commands.push(format!("{} call {}", prefix, quote(call)));
    }
    if let Some(target) = rule.continue_to {
        check_rule(target, MAX_RULE)?;
        commands.push(format!("{} continue {}", prefix, quote(target)));
    }

    Ok(commands)
}

fn match_clause(clause: &MatchClause) -> CoreResult<String> {
    let body = match clause {
        MatchClause::PrefixList(name) => {
            check_name("prefix-list", name)?;
            format!("match ip address prefix-list {}", quote(name))
        }
        MatchClause::PrefixList6(name) => {
            check_name("prefix-list6", name)?;
            format!("match ipv6 address prefix-list {}", quote(name))
        }
        MatchClause::AsPath(name) => {
            check_name("as-path list", name)?;
            format!("match as-path {}", quote(name))
        }
        MatchClause::CommunityList(name) => {
            check_name("community-list", name)?;
            format!("match community community-list {}", quote(name))
        }
        MatchClause::LargeCommunityList(name) => {
            check_name("large-community-list", name)?;
            format!("match large-community large-community-list {}", quote(name))
        }
        MatchClause::Interface(name) => {
            check_name("interface", name)?;
            format!("match interface {}", quote(name))
        }
        MatchClause::Metric(metric) => format!("match metric {}", quote(metric)),
        MatchClause::Peer(peer) => {
            check_name("peer", peer)?;
            format!("match peer {}", quote(peer))
        }
        MatchClause::Tag(tag) => format!("match tag {}", quote(tag)),
        MatchClause::Rpki(state) => format!("match rpki {}", quote(state.as_str())),
    };
    Ok(body)
}

/// Set clauses common to every supported release
fn set_clause_common(clause: &SetClause) -> CoreResult<Option<String>> {
    let body = match clause {
        SetClause::LocalPreference(pref) => format!("set local-preference {}", quote(pref)),
        SetClause::Metric(metric) => {
            check_name("metric", metric)?;
            format!("set metric {}", quote(metric))
        }
        SetClause::IpNextHop(addr) => {
            check_name("next-hop", addr)?;
            format!("set ip-next-hop {}", quote(addr))
        }
        SetClause::Tag(tag) => format!("set tag {}", quote(tag)),
        SetClause::Weight(weight) => format!("set weight {}", quote(weight)),
        SetClause::AsPathPrepend(_) | SetClause::Community(_) | SetClause::LargeCommunity(_) => {
            return Ok(None)
        }
    };
    Ok(Some(body))
}

fn set_clause(clause: &SetClause) -> CoreResult<Vec<String>> {
    if let Some(body) = set_clause_common(clause)? {
        return Ok(vec![body]);
    }
    match clause {
        SetClause::AsPathPrepend(path) => {
            check_text("as-path prepend", path)?;
            Ok(vec![format!("set as-path prepend {}", quote(path))])
        }
        SetClause::Community(action) => community(action, "community"),
        SetClause::LargeCommunity(action) => community(action, "large-community"),
        _ => Ok(Vec::new()),
    }
}

/// `set community <add|replace|delete> '<value>'` takes one value per command
fn community(action: &CommunityAction, node: &str) -> CoreResult<Vec<String>> {
    let verb = match action.mode {
        CommunityMode::Clear => return Ok(vec![format!("set {} none", node)]),
        CommunityMode::Add => "add",
        CommunityMode::Replace => "replace",
        CommunityMode::Delete => "delete",
    };
    if action.values.is_empty() {
        return Err(CoreError::invalid(format!("{} {} requires values", node, verb)));
    }
    action
        .values
        .iter()
        .map(|value| {
            check_name(node, value)?;
            Ok(format!("set {} {} {}", node, verb, quote(value)))
        })
        .collect()
}

fn set_clause_v1_3(clause: &SetClause) -> CoreResult<Vec<String>> {
    if let Some(body) = set_clause_common(clause)? {
        return Ok(vec![body]);
    }
    match clause {
        SetClause::AsPathPrepend(path) => {
            check_text("as-path prepend", path)?;
            Ok(vec![format!("set as-path-prepend {}", quote(path))])
        }
        SetClause::Community(action) => community_v1_3(action, "community"),
        SetClause::LargeCommunity(action) => community_v1_3(action, "large-community"),
        _ => Ok(Vec::new()),
    }
}

fn community_v1_3(action: &CommunityAction, node: &str) -> CoreResult<Vec<String>> {
    for value in &action.values {
        check_name(node, value)?;
    }
    let joined = action.values.join(" ");
    let body = match action.mode {
        CommunityMode::Clear => format!("set {} 'none'", node),
        CommunityMode::Replace if !joined.is_empty() => format!("set {} {}", node, quote(joined)),
        CommunityMode::Add if !joined.is_empty() => {
            format!("set {} {}", node, quote(format!("{} additive", joined)))
        }
        CommunityMode::Delete => {
            return Err(CoreError::invalid(format!(
                "{} delete requires VyOS 1.4 or newer",
                node
            )))
        }
        _ => return Err(CoreError::invalid(format!("{} requires values", node))),
    };
    Ok(vec![body])
}
