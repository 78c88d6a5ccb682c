use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// FeatureArea is a VyOS configuration domain with its own command family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureArea {
    RouteMap,
    LocalRoute,
    PrefixList,
    StaticRoute,
    Firewall,
}

impl FeatureArea {
    pub const ALL: [FeatureArea; 5] = [
        FeatureArea::RouteMap,
        FeatureArea::LocalRoute,
        FeatureArea::PrefixList,
        FeatureArea::StaticRoute,
        FeatureArea::Firewall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureArea::RouteMap => "route-map",
            FeatureArea::LocalRoute => "local-route",
            FeatureArea::PrefixList => "prefix-list",
            FeatureArea::StaticRoute => "static-route",
            FeatureArea::Firewall => "firewall",
        }
    }
}

impl fmt::Display for FeatureArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureArea {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureArea::ALL
            .into_iter()
            .find(|area| area.as_str() == s)
            .ok_or_else(|| CoreError::UnsupportedFeatureArea(s.to_string()))
    }
}

/// Operation names one rendering entry point within a feature area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    AddRule,
    RemoveRule,
    SetDescription,
    SetDefaultAction,
    RemovePolicy,
    AddRoute,
    RemoveRoute,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::AddRule => "add_rule",
            Operation::RemoveRule => "remove_rule",
            Operation::SetDescription => "set_description",
            Operation::SetDefaultAction => "set_default_action",
            Operation::RemovePolicy => "remove_policy",
            Operation::AddRoute => "add_route",
            Operation::RemoveRoute => "remove_route",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permit/deny action shared by route-map and prefix-list rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Permit,
    Deny,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Permit => "permit",
            RuleAction::Deny => "deny",
        }
    }
}

// ── Route-map ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpkiState {
    Valid,
    Invalid,
    Notfound,
}

impl RpkiState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpkiState::Valid => "valid",
            RpkiState::Invalid => "invalid",
            RpkiState::Notfound => "notfound",
        }
    }
}

/// A single route-map match condition. Clauses render in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MatchClause {
    PrefixList(String),
    PrefixList6(String),
    AsPath(String),
    CommunityList(String),
    LargeCommunityList(String),
    Interface(String),
    Metric(u32),
    Peer(String),
    Tag(u32),
    Rpki(RpkiState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunityMode {
    Add,
    Replace,
    Delete,
    #[serde(rename = "none")]
    Clear,
}

/// Community manipulation; `values` is ignored for `none`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityAction {
    pub mode: CommunityMode,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A single route-map set action. Clauses render in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SetClause {
    LocalPreference(u32),
    Metric(String),
    AsPathPrepend(String),
    IpNextHop(String),
    Tag(u32),
    Weight(u32),
    Community(CommunityAction),
    LargeCommunity(CommunityAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMatch {
    Next,
    Goto(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMapRule {
    pub name: String,
    pub rule: u32,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub matches: Vec<MatchClause>,
    #[serde(default)]
    pub sets: Vec<SetClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_match: Option<OnMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
    #[serde(default, rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_to: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RouteMapIntent {
    AddRule(RouteMapRule),
    RemoveRule { name: String, rule: u32 },
    SetDescription { name: String, description: String },
    RemovePolicy { name: String },
}

// ── Local-route ──────────────────────────────────────────────────

/// Policy-based routing rule for locally originated traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRouteRule {
    pub rule: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LocalRouteIntent {
    AddRule(LocalRouteRule),
    RemoveRule { rule: u32 },
    RemovePolicy,
}

// ── Prefix-list ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixListRule {
    pub name: String,
    pub rule: u32,
    pub action: RuleAction,
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ge: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub le: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PrefixListIntent {
    AddRule(PrefixListRule),
    RemoveRule {
        name: String,
        rule: u32,
        #[serde(default)]
        ipv6: bool,
    },
    SetDescription {
        name: String,
        description: String,
        #[serde(default)]
        ipv6: bool,
    },
    RemovePolicy {
        name: String,
        #[serde(default)]
        ipv6: bool,
    },
}

// ── Static route ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHop {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub prefix: String,
    #[serde(default)]
    pub next_hops: Vec<NextHop>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub blackhole: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StaticRoute {
    pub fn is_ipv6(&self) -> bool {
        self.prefix.contains(':')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StaticRouteIntent {
    AddRoute(StaticRoute),
    RemoveRoute { prefix: String },
}

// ── Firewall ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallFamily {
    #[default]
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Accept,
    Drop,
    Reject,
    Return,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Accept => "accept",
            FirewallAction::Drop => "drop",
            FirewallAction::Reject => "reject",
            FirewallAction::Return => "return",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Established,
    Related,
    New,
    Invalid,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Established => "established",
            ConnectionState::Related => "related",
            ConnectionState::New => "new",
            ConnectionState::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    #[serde(default)]
    pub family: FirewallFamily,
    pub rule: u32,
    pub action: FirewallAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<String>,
    #[serde(default)]
    pub states: Vec<ConnectionState>,
    #[serde(default)]
    pub log: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FirewallIntent {
    AddRule(FirewallRule),
    RemoveRule {
        name: String,
        #[serde(default)]
        family: FirewallFamily,
        rule: u32,
    },
    SetDefaultAction {
        name: String,
        #[serde(default)]
        family: FirewallFamily,
        action: FirewallAction,
    },
    RemovePolicy {
        name: String,
        #[serde(default)]
        family: FirewallFamily,
    },
}

// ── Command model ────────────────────────────────────────────────

/// CommandModel is a version-independent configuration intent.
///
/// The variant is the feature area tag; the payload carries the operation and
/// its ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "area", content = "intent", rename_all = "kebab-case")]
pub enum CommandModel {
    RouteMap(RouteMapIntent),
    LocalRoute(LocalRouteIntent),
    PrefixList(PrefixListIntent),
    StaticRoute(StaticRouteIntent),
    Firewall(FirewallIntent),
}

impl CommandModel {
    pub fn feature_area(&self) -> FeatureArea {
        match self {
            CommandModel::RouteMap(_) => FeatureArea::RouteMap,
            CommandModel::LocalRoute(_) => FeatureArea::LocalRoute,
            CommandModel::PrefixList(_) => FeatureArea::PrefixList,
            CommandModel::StaticRoute(_) => FeatureArea::StaticRoute,
            CommandModel::Firewall(_) => FeatureArea::Firewall,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            CommandModel::RouteMap(intent) => match intent {
                RouteMapIntent::AddRule(_) => Operation::AddRule,
                RouteMapIntent::RemoveRule { .. } => Operation::RemoveRule,
                RouteMapIntent::SetDescription { .. } => Operation::SetDescription,
                RouteMapIntent::RemovePolicy { .. } => Operation::RemovePolicy,
            },
            CommandModel::LocalRoute(intent) => match intent {
                LocalRouteIntent::AddRule(_) => Operation::AddRule,
                LocalRouteIntent::RemoveRule { .. } => Operation::RemoveRule,
                LocalRouteIntent::RemovePolicy => Operation::RemovePolicy,
            },
            CommandModel::PrefixList(intent) => match intent {
                PrefixListIntent::AddRule(_) => Operation::AddRule,
                PrefixListIntent::RemoveRule { .. } => Operation::RemoveRule,
                PrefixListIntent::SetDescription { .. } => Operation::SetDescription,
                PrefixListIntent::RemovePolicy { .. } => Operation::RemovePolicy,
            },
            CommandModel::StaticRoute(intent) => match intent {
                StaticRouteIntent::AddRoute(_) => Operation::AddRoute,
                StaticRouteIntent::RemoveRoute { .. } => Operation::RemoveRoute,
            },
            CommandModel::Firewall(intent) => match intent {
                FirewallIntent::AddRule(_) => Operation::AddRule,
                FirewallIntent::RemoveRule { .. } => Operation::RemoveRule,
                FirewallIntent::SetDefaultAction { .. } => Operation::SetDefaultAction,
                FirewallIntent::RemovePolicy { .. } => Operation::RemovePolicy,
            },
        }
    }

    /// Parse an operation body (`{"op": "...", ...}`) for the given feature area
    pub fn from_json(area: FeatureArea, body: serde_json::Value) -> Result<Self, CoreError> {
        let parsed = match area {
            FeatureArea::RouteMap => serde_json::from_value(body).map(CommandModel::RouteMap),
            FeatureArea::LocalRoute => serde_json::from_value(body).map(CommandModel::LocalRoute),
            FeatureArea::PrefixList => serde_json::from_value(body).map(CommandModel::PrefixList),
            FeatureArea::StaticRoute => {
                serde_json::from_value(body).map(CommandModel::StaticRoute)
            }
            FeatureArea::Firewall => serde_json::from_value(body).map(CommandModel::Firewall),
        };
        parsed.map_err(|e| CoreError::invalid(format!("{} intent: {}", area, e)))
    }
}
