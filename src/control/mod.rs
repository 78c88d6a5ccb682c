//! Control plane facade: intent in, per-command results out.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::error::{CoreError, CoreResult};
use crate::instances::InstanceRegistry;
use crate::mappers::MapperRegistry;
use crate::models::{
    ApplyResult, CommandModel, Endpoint, FeatureArea, Instance, RegisterInstanceRequest,
};
use crate::session::{ApplyOptions, SessionManager};
use crate::ws::Hub;

/// ControlPlane composes the mapper registry, instance registry and
/// session manager
pub struct ControlPlane {
    mappers: Arc<MapperRegistry>,
    instances: Arc<InstanceRegistry>,
    sessions: Arc<SessionManager>,
    ws_hub: Option<Arc<Hub>>,
}

impl ControlPlane {
    pub fn new(
        mappers: Arc<MapperRegistry>,
        instances: Arc<InstanceRegistry>,
        sessions: Arc<SessionManager>,
        ws_hub: Option<Arc<Hub>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mappers,
            instances,
            sessions,
            ws_hub,
        })
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Resolve and render an intent for the instance's current version.
    /// No device I/O.
    pub fn preview_intent(
        &self,
        instance_id: &str,
        area: FeatureArea,
        model: &CommandModel,
    ) -> CoreResult<Vec<String>> {
        let instance = self.instances.get(instance_id)?;
        self.mappers.render(area, &instance.version, model)
    }

    /// Render an intent and apply it as one transaction.
    ///
    /// Resolution and validation failures return `Err` before any
    /// transport call; device-side outcomes come back per command.
    pub async fn apply_intent(
        &self,
        instance_id: &str,
        area: FeatureArea,
        model: &CommandModel,
        options: ApplyOptions,
    ) -> CoreResult<Vec<ApplyResult>> {
        let commands = self.preview_intent(instance_id, area, model)?;
        let operation = model.operation();
        tracing::info!(
            "Applying {} {} to {} ({} commands)",
            area,
            operation,
            instance_id,
            commands.len()
        );

        let results = self.sessions.apply(instance_id, commands, options).await?;

        let applied = results.iter().filter(|r| r.is_applied()).count();
        if applied == results.len() {
            tracing::info!("{} {} applied on {}", area, operation, instance_id);
        } else {
            tracing::warn!(
                "{} {} on {}: {} of {} commands applied",
                area,
                operation,
                instance_id,
                applied,
                results.len()
            );
        }
        if let Some(hub) = &self.ws_hub {
            hub.broadcast_intent_outcome(instance_id, area, operation, &results)
                .await;
        }
        Ok(results)
    }

    pub fn list_supported_versions(&self, area: FeatureArea) -> CoreResult<BTreeSet<String>> {
        self.mappers.supported_versions(area)
    }

    pub fn feature_areas(&self) -> Vec<FeatureArea> {
        self.mappers.feature_areas()
    }

    pub async fn register_instance(
        &self,
        instance_id: &str,
        endpoint: Endpoint,
        version: &str,
    ) -> CoreResult<Instance> {
        let instance = self.instances.register(instance_id, endpoint, version)?;
        if let Some(hub) = &self.ws_hub {
            hub.broadcast_instance_registered(&instance).await;
        }
        Ok(instance)
    }

    /// Close any live session, then forget the instance
    pub async fn deregister_instance(&self, instance_id: &str) -> CoreResult<()> {
        if !self.instances.contains(instance_id) {
            return Err(CoreError::UnknownInstance(instance_id.to_string()));
        }
        self.sessions.retire(instance_id).await?;
        if let Some(hub) = &self.ws_hub {
            hub.broadcast_instance_removed(instance_id).await;
        }
        Ok(())
    }

    /// Register instances listed in a JSON seed file.
    /// Instances already registered are skipped with a warning.
    pub async fn load_seed(&self, path: &Path, default_port: u16) -> anyhow::Result<usize> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading instance seed {}", path.display()))?;
        let requests: Vec<RegisterInstanceRequest> = serde_json::from_str(&data)
            .with_context(|| format!("parsing instance seed {}", path.display()))?;

        let mut loaded = 0;
        for req in requests {
            match self
                .register_instance(&req.id, req.endpoint(default_port), &req.version)
                .await
            {
                Ok(_) => loaded += 1,
                Err(CoreError::DuplicateInstance(id)) => {
                    tracing::warn!("Seed instance {} already registered, skipping", id)
                }
                Err(e) => return Err(e).context(format!("registering seed instance {}", req.id)),
            }
        }
        tracing::info!("Loaded {} instances from {}", loaded, path.display());
        Ok(loaded)
    }
}
