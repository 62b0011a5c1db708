use crate::{Error, Result};
use async_trait::async_trait;
use common::{ClusterContext, ConfigDecoder, Extension, ExampleConfig};
use kube::ResourceExt;
use tracing::{info, instrument};

/// The five phases every extension implementation has to provide.
///
/// Each call is expected to be idempotent: the controller retries a failed
/// phase with backoff and may call a phase again after a resync.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Create or update whatever the extension manages
    async fn reconcile(&self, ext: &Extension, cluster: &ClusterContext) -> Result<()>;
    /// Clean up; the cluster may already be gone
    async fn delete(&self, ext: &Extension, cluster: Option<&ClusterContext>) -> Result<()>;
    /// Best effort cleanup when the shoot is force-deleted
    async fn force_delete(&self, ext: &Extension, cluster: Option<&ClusterContext>) -> Result<()>;
    async fn restore(&self, ext: &Extension, cluster: &ClusterContext) -> Result<()>;
    async fn migrate(&self, ext: &Extension, cluster: &ClusterContext) -> Result<()>;
}

/// Actuator of the `example` extension type
#[derive(Clone, Debug, Default)]
pub struct ExampleActuator {
    decoder: ConfigDecoder,
}

impl ExampleActuator {
    #[must_use]
    pub fn new(decoder: ConfigDecoder) -> Self {
        Self { decoder }
    }

    /// Decode the provider config carried by the extension, if any
    pub fn provider_config(&self, ext: &Extension) -> Result<Option<ExampleConfig>> {
        ext.spec
            .provider_config
            .as_ref()
            .map(|raw| {
                self.decoder
                    .decode(raw)
                    .map_err(|e| Error::ExtensionError(common::Error::InvalidExtensionConfig(e)))
            })
            .transpose()
    }
}

#[async_trait]
impl Actuator for ExampleActuator {
    #[instrument(skip_all, fields(extension = %ext.name_any(), cluster = %cluster.name))]
    async fn reconcile(&self, ext: &Extension, cluster: &ClusterContext) -> Result<()> {
        let cfg = self.provider_config(ext)?;
        info!(
            seed = cluster.seed_name().unwrap_or_default(),
            foo = cfg.as_ref().map(|c| c.foo.as_str()).unwrap_or_default(),
            "reconciling example extension"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(extension = %ext.name_any()))]
    async fn delete(&self, ext: &Extension, cluster: Option<&ClusterContext>) -> Result<()> {
        info!(cluster_present = cluster.is_some(), "deleting example extension");
        Ok(())
    }

    #[instrument(skip_all, fields(extension = %ext.name_any()))]
    async fn force_delete(&self, ext: &Extension, cluster: Option<&ClusterContext>) -> Result<()> {
        info!(cluster_present = cluster.is_some(), "force deleting example extension");
        Ok(())
    }

    async fn restore(&self, ext: &Extension, cluster: &ClusterContext) -> Result<()> {
        info!("restoring example extension {}", ext.name_any());
        self.reconcile(ext, cluster).await
    }

    async fn migrate(&self, ext: &Extension, cluster: &ClusterContext) -> Result<()> {
        info!("migrating example extension {}", ext.name_any());
        self.reconcile(ext, cluster).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{cluster_context, extension};
    use serde_json::json;

    #[tokio::test]
    async fn reconcile_decodes_provider_config() {
        let act = ExampleActuator::default();
        let mut ext = extension("example", "shoot--local--local");
        ext.spec.provider_config = Some(json!({"foo": "bar"}));
        assert_eq!(
            act.provider_config(&ext).unwrap(),
            Some(ExampleConfig { foo: "bar".into() })
        );
        act.reconcile(&ext, &cluster_context("shoot--local--local")).await.unwrap();
        act.migrate(&ext, &cluster_context("shoot--local--local")).await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_rejects_unknown_fields() {
        let act = ExampleActuator::default();
        let mut ext = extension("example", "shoot--local--local");
        ext.spec.provider_config = Some(json!({"foo": "bar", "bar": "baz"}));
        let err = act
            .restore(&ext, &cluster_context("shoot--local--local"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid extension config"));
    }

    #[tokio::test]
    async fn delete_works_without_cluster() {
        let act = ExampleActuator::default();
        let ext = extension("example", "shoot--local--local");
        act.delete(&ext, None).await.unwrap();
        act.force_delete(&ext, None).await.unwrap();
    }
}
