//! In-memory registry of managed VyOS instances.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::error::{CoreError, CoreResult};
use crate::models::{Endpoint, Instance, Liveness};
use crate::utils;

/// InstanceRegistry maps instance ids to their endpoint, version and liveness
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Instance>>,
    supported: BTreeSet<String>,
}

impl InstanceRegistry {
    /// `supported` is the version set the mapper registry can render for
    pub fn new(supported: BTreeSet<String>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            supported,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Instance>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Instance>> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new instance. Any version string is accepted; rendering
    /// for an unsupported one fails later with `UnsupportedVersion`.
    pub fn register(
        &self,
        id: impl Into<String>,
        endpoint: Endpoint,
        version: impl Into<String>,
    ) -> CoreResult<Instance> {
        let id = id.into();
        if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
            return Err(CoreError::invalid(format!("invalid instance id '{}'", id)));
        }
        if !utils::is_valid_host(&endpoint.host) {
            return Err(CoreError::invalid(format!(
                "instance '{}' has invalid host '{}'",
                id, endpoint.host
            )));
        }

        let version = version.into();
        let mut instances = self.write();
        if instances.contains_key(&id) {
            return Err(CoreError::DuplicateInstance(id));
        }

        if !self.supported.contains(&version) {
            tracing::warn!(
                "Instance {} registered with unsupported VyOS version {}",
                id,
                version
            );
        }

        let now = Utc::now();
        let instance = Instance {
            id: id.clone(),
            endpoint,
            version,
            liveness: Liveness::Unknown,
            registered_at: now,
            updated_at: now,
        };
        instances.insert(id, instance.clone());
        tracing::info!(
            "Registered instance {} at {}:{} (VyOS {})",
            instance.id,
            instance.endpoint.host,
            instance.endpoint.port,
            instance.version
        );
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> CoreResult<Instance> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownInstance(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn deregister(&self, id: &str) -> CoreResult<Instance> {
        let removed = self
            .write()
            .remove(id)
            .ok_or_else(|| CoreError::UnknownInstance(id.to_string()))?;
        tracing::info!("Deregistered instance {}", id);
        Ok(removed)
    }

    /// All instances, sorted by id
    pub fn list(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self.read().values().cloned().collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Record a detected version. Returns true when it changed.
    pub fn update_version(&self, id: &str, version: &str) -> CoreResult<bool> {
        let mut instances = self.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownInstance(id.to_string()))?;
        if instance.version == version {
            return Ok(false);
        }
        tracing::info!(
            "Instance {} reports VyOS {} (was {})",
            id,
            version,
            instance.version
        );
        instance.version = version.to_string();
        instance.updated_at = Utc::now();
        Ok(true)
    }

    pub fn set_liveness(&self, id: &str, liveness: Liveness) -> CoreResult<()> {
        let mut instances = self.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownInstance(id.to_string()))?;
        if instance.liveness != liveness {
            tracing::debug!("Instance {} is now {:?}", id, liveness);
            instance.liveness = liveness;
            instance.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn supported_versions(&self) -> &BTreeSet<String> {
        &self.supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(["1.3", "1.4", "1.5"].iter().map(|v| v.to_string()).collect())
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("192.0.2.10", "vyos", "vyos")
    }

    #[test]
    fn test_register_and_get() {
        let reg = registry();
        let created = reg.register("r1", endpoint(), "1.4").unwrap();
        assert_eq!(created.liveness, Liveness::Unknown);

        let fetched = reg.get("r1").unwrap();
        assert_eq!(fetched.version, "1.4");
        assert_eq!(fetched.endpoint.host, "192.0.2.10");
    }

    #[test]
    fn test_duplicate_registration() {
        let reg = registry();
        reg.register("r1", endpoint(), "1.4").unwrap();
        assert_eq!(
            reg.register("r1", endpoint(), "1.5").unwrap_err(),
            CoreError::DuplicateInstance("r1".into())
        );
        assert_eq!(reg.get("r1").unwrap().version, "1.4");
    }

    #[test]
    fn test_unknown_instance() {
        let reg = registry();
        assert_eq!(
            reg.get("ghost").unwrap_err(),
            CoreError::UnknownInstance("ghost".into())
        );
        assert!(matches!(
            reg.deregister("ghost"),
            Err(CoreError::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_unsupported_version_still_registers() {
        let reg = registry();
        reg.register("r9", endpoint(), "2.0").unwrap();
        assert_eq!(reg.get("r9").unwrap().version, "2.0");
        assert!(!reg.supported_versions().contains("2.0"));
    }

    #[test]
    fn test_deregister_then_reregister() {
        let reg = registry();
        reg.register("r1", endpoint(), "1.4").unwrap();
        reg.deregister("r1").unwrap();
        assert!(!reg.contains("r1"));
        reg.register("r1", endpoint(), "1.5").unwrap();
        assert_eq!(reg.get("r1").unwrap().version, "1.5");
    }

    #[test]
    fn test_update_version_and_liveness() {
        let reg = registry();
        reg.register("r1", endpoint(), "1.4").unwrap();
        assert!(!reg.update_version("r1", "1.4").unwrap());
        assert!(reg.update_version("r1", "1.5").unwrap());
        reg.set_liveness("r1", Liveness::Reachable).unwrap();

        let instance = reg.get("r1").unwrap();
        assert_eq!(instance.version, "1.5");
        assert_eq!(instance.liveness, Liveness::Reachable);
    }

    #[test]
    fn test_list_sorted_and_validation() {
        let reg = registry();
        reg.register("r2", endpoint(), "1.4").unwrap();
        reg.register("r1", endpoint(), "1.4").unwrap();
        let ids: Vec<String> = reg.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["r1", "r2"]);

        assert!(matches!(
            reg.register("bad id", endpoint(), "1.4"),
            Err(CoreError::InvalidIntent(_))
        ));
    }
}
