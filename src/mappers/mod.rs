//! Version-aware rendering of command models into VyOS `set`/`delete` commands.
//!
//! Each feature area registers a base table of render functions, one per
//! operation. A (feature area, version) pair may register an override table
//! that replaces individual operations; every operation it leaves out falls
//! through to the base table. An empty override table and a missing override
//! resolve identically.
//!
//! The registry is built once at startup through [`MapperRegistryBuilder`]
//! and is immutable afterwards, so resolution needs no locking.

pub mod firewall;
pub mod local_route;
pub mod prefix_list;
pub mod route_map;
pub mod static_route;

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::models::{CommandModel, FeatureArea, Operation};

/// Renders one operation of one feature area
pub type RenderFn = fn(&CommandModel) -> CoreResult<Vec<String>>;

/// Operation → render function table
#[derive(Clone, Default)]
pub struct MapperTable {
    ops: HashMap<Operation, RenderFn>,
}

impl MapperTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: Operation, render: RenderFn) -> Self {
        self.ops.insert(op, render);
        self
    }

    pub fn get(&self, op: Operation) -> Option<RenderFn> {
        self.ops.get(&op).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = Operation> + '_ {
        self.ops.keys().copied()
    }
}

/// Mapper resolved for a single (feature area, version) pair.
///
/// Cheap to clone; shares its tables with the registry.
#[derive(Clone)]
pub struct Mapper {
    area: FeatureArea,
    version: String,
    base: Arc<MapperTable>,
    overrides: Option<Arc<MapperTable>>,
}

impl Mapper {
    /// True when this version replaces the base rendering of `op`
    pub fn is_specialized(&self, op: Operation) -> bool {
        self.overrides
            .as_ref()
            .is_some_and(|table| table.get(op).is_some())
    }

    pub fn render(&self, model: &CommandModel) -> CoreResult<Vec<String>> {
        if model.feature_area() != self.area {
            return Err(CoreError::invalid(format!(
                "{} intent submitted to the {} mapper",
                model.feature_area(),
                self.area
            )));
        }

        let op = model.operation();
        let render = self
            .overrides
            .as_ref()
            .and_then(|table| table.get(op))
            .or_else(|| self.base.get(op))
            .ok_or_else(|| {
                CoreError::invalid(format!("{} has no {} operation", self.area, op))
            })?;

        let commands = render(model)?;
        tracing::debug!(
            "Rendered {} {} for VyOS {} ({}) into {} commands",
            self.area,
            op,
            self.version,
            if self.is_specialized(op) { "override" } else { "base" },
            commands.len()
        );
        Ok(commands)
    }
}

/// Registry of base mappers and per-version overrides
pub struct MapperRegistry {
    bases: HashMap<FeatureArea, Arc<MapperTable>>,
    overrides: HashMap<(FeatureArea, String), Arc<MapperTable>>,
    versions: BTreeSet<String>,
}

impl MapperRegistry {
    pub fn builder() -> MapperRegistryBuilder {
        MapperRegistryBuilder::default()
    }

    /// Stock registry for the VyOS releases this control plane knows.
    ///
    /// Base syntax is VyOS 1.4. 1.3 predates the firewall tree rework and
    /// several policy syntax changes; 1.5 shares 1.4 syntax.
    pub fn vyos() -> CoreResult<Self> {
        Self::builder()
            .declare_version("1.3")
            .declare_version("1.4")
            .declare_version("1.5")
            .base(FeatureArea::RouteMap, route_map::base())
            .base(FeatureArea::LocalRoute, local_route::base())
            .base(FeatureArea::PrefixList, prefix_list::base())
            .base(FeatureArea::StaticRoute, static_route::base())
            .base(FeatureArea::Firewall, firewall::base())
            .override_version(FeatureArea::RouteMap, "1.3", route_map::v1_3())
            .override_version(FeatureArea::LocalRoute, "1.3", local_route::v1_3())
            .override_version(FeatureArea::StaticRoute, "1.3", static_route::v1_3())
            .override_version(FeatureArea::Firewall, "1.3", firewall::v1_3())
            .override_version(FeatureArea::RouteMap, "1.5", MapperTable::new())
            .override_version(FeatureArea::LocalRoute, "1.5", MapperTable::new())
            .build()
    }

    /// Resolve the mapper for a feature area at a device version
    pub fn resolve(&self, area: FeatureArea, version: &str) -> CoreResult<Mapper> {
        let base = self
            .bases
            .get(&area)
            .ok_or_else(|| CoreError::UnsupportedFeatureArea(area.to_string()))?;

        if !self.versions.contains(version) {
            return Err(CoreError::unsupported_version(area, version));
        }

        Ok(Mapper {
            area,
            version: version.to_string(),
            base: base.clone(),
            overrides: self.overrides.get(&(area, version.to_string())).cloned(),
        })
    }

    pub fn render(
        &self,
        area: FeatureArea,
        version: &str,
        model: &CommandModel,
    ) -> CoreResult<Vec<String>> {
        self.resolve(area, version)?.render(model)
    }

    /// Versions a feature area can render for
    pub fn supported_versions(&self, area: FeatureArea) -> CoreResult<BTreeSet<String>> {
        if !self.bases.contains_key(&area) {
            return Err(CoreError::UnsupportedFeatureArea(area.to_string()));
        }
        Ok(self.versions.clone())
    }

    pub fn declared_versions(&self) -> &BTreeSet<String> {
        &self.versions
    }

    pub fn feature_areas(&self) -> Vec<FeatureArea> {
        let mut areas: Vec<FeatureArea> = self.bases.keys().copied().collect();
        areas.sort();
        areas
    }
}

/// Collects mapper registrations before the registry is frozen
#[derive(Default)]
pub struct MapperRegistryBuilder {
    bases: HashMap<FeatureArea, MapperTable>,
    overrides: Vec<(FeatureArea, String, MapperTable)>,
    versions: BTreeSet<String>,
}

impl MapperRegistryBuilder {
    pub fn declare_version(mut self, version: impl Into<String>) -> Self {
        self.versions.insert(version.into());
        self
    }

    pub fn base(mut self, area: FeatureArea, table: MapperTable) -> Self {
        self.bases.insert(area, table);
        self
    }

    /// Register an override for one version; also declares that version
    pub fn override_version(
        mut self,
        area: FeatureArea,
        version: impl Into<String>,
        table: MapperTable,
    ) -> Self {
        let version = version.into();
        self.versions.insert(version.clone());
        self.overrides.push((area, version, table));
        self
    }

    pub fn build(self) -> CoreResult<MapperRegistry> {
        let mut overrides = HashMap::new();
        for (area, version, table) in self.overrides {
            if !self.bases.contains_key(&area) {
                return Err(CoreError::UnsupportedFeatureArea(area.to_string()));
            }
            // empty tables resolve exactly like a missing override
            if table.is_empty() {
                continue;
            }
            tracing::debug!(
                "{} {} overrides {:?}",
                area,
                version,
                table.operations().collect::<Vec<_>>()
            );
            overrides.insert((area, version), Arc::new(table));
        }

        let bases: HashMap<FeatureArea, Arc<MapperTable>> = self
            .bases
            .into_iter()
            .map(|(area, table)| (area, Arc::new(table)))
            .collect();

        tracing::info!(
            "Mapper registry ready: {} feature areas, {} overrides, versions {:?}",
            bases.len(),
            overrides.len(),
            self.versions
        );

        Ok(MapperRegistry {
            bases,
            overrides,
            versions: self.versions,
        })
    }
}

// ── Syntax helpers shared by the feature area mappers ────────────

/// Quote a leaf value the way `show configuration commands` prints it
pub(crate) fn quote(value: impl std::fmt::Display) -> String {
    format!("'{}'", value)
}

/// Tag-node names: policy names, interface names, addresses
pub(crate) fn check_name(kind: &str, value: &str) -> CoreResult<()> {
    if value.is_empty() {
        return Err(CoreError::invalid(format!("{} must not be empty", kind)));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c == '\'' || c == '"' || c.is_control())
    {
        return Err(CoreError::invalid(format!(
            "{} '{}' must not contain whitespace or quotes",
            kind, value
        )));
    }
    Ok(())
}

/// Free-text leaf values such as descriptions
pub(crate) fn check_text(kind: &str, value: &str) -> CoreResult<()> {
    if value.contains('\'') || value.chars().any(char::is_control) {
        return Err(CoreError::invalid(format!(
            "{} must not contain single quotes or control characters",
            kind
        )));
    }
    Ok(())
}

pub(crate) fn check_rule(rule: u32, max: u32) -> CoreResult<()> {
    if rule == 0 || rule > max {
        return Err(CoreError::invalid(format!(
            "rule number {} is outside 1-{}",
            rule, max
        )));
    }
    Ok(())
}

pub(crate) fn check_prefix(prefix: &str) -> CoreResult<()> {
    check_name("prefix", prefix)?;
    match prefix.split_once('/') {
        Some((addr, len)) if !addr.is_empty() && len.parse::<u8>().is_ok() => Ok(()),
        _ => Err(CoreError::invalid(format!(
            "prefix '{}' must be in address/length form",
            prefix
        ))),
    }
}

/// `check_prefix`, plus the address and length must belong to one family
pub(crate) fn check_prefix_family(prefix: &str, ipv6: bool) -> CoreResult<()> {
    check_prefix(prefix)?;
    let (addr, len) = prefix.split_once('/').unwrap_or((prefix, ""));
    let (family, max_len) = if ipv6 { ("IPv6", 128) } else { ("IPv4", 32) };
    let addr_ok = if ipv6 {
        addr.parse::<Ipv6Addr>().is_ok()
    } else {
        addr.parse::<Ipv4Addr>().is_ok()
    };
    match len.parse::<u8>() {
        Ok(len) if addr_ok && len <= max_len => Ok(()),
        _ => Err(CoreError::invalid(format!(
            "prefix '{}' is not an {} prefix",
            prefix, family
        ))),
    }
}

/// Error for a render function handed an intent of another operation
pub(crate) fn mismatch(model: &CommandModel, expected: Operation) -> CoreError {
    CoreError::invalid(format!(
        "{} {} intent routed to {} renderer",
        model.feature_area(),
        model.operation(),
        expected
    ))
}
