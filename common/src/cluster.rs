use crate::{extension::raw_extension, Error, Result, Shoot};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Bundle of the documents describing the shoot an extension belongs to
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Cluster",
    group = "extensions.gardener.cloud",
    version = "v1alpha1"
)]
#[kube(doc = "Cluster-scoped resource bundling cloud profile, seed and shoot of a shoot namespace")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[schemars(schema_with = "raw_extension")]
    pub cloud_profile: serde_json::Value,
    #[schemars(schema_with = "raw_extension")]
    pub seed: serde_json::Value,
    #[schemars(schema_with = "raw_extension")]
    pub shoot: serde_json::Value,
}

/// Decoded view of a `Cluster`, handed read-only to actuators
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterContext {
    pub name: String,
    pub cloud_profile: serde_json::Value,
    pub seed: serde_json::Value,
    pub shoot: Shoot,
}

impl ClusterContext {
    pub fn seed_name(&self) -> Option<&str> {
        self.seed.pointer("/metadata/name").and_then(|v| v.as_str())
    }
}

impl TryFrom<&Cluster> for ClusterContext {
    type Error = Error;

    fn try_from(cluster: &Cluster) -> Result<Self> {
        let name = cluster.name_any();
        let invalid = |reason: &str| Error::InvalidCluster {
            name: name.clone(),
            reason: reason.to_string(),
        };
        if !cluster.spec.cloud_profile.is_object() {
            return Err(invalid("no cloud profile"));
        }
        if !cluster.spec.seed.is_object() {
            return Err(invalid("no seed"));
        }
        let shoot = Shoot::from_value(cluster.spec.shoot.clone()).map_err(|_| invalid("invalid shoot"))?;
        Ok(ClusterContext {
            name,
            cloud_profile: cluster.spec.cloud_profile.clone(),
            seed: cluster.spec.seed.clone(),
            shoot,
        })
    }
}
