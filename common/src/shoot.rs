use crate::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Subset of a gardener `Shoot` the extension needs; unknown fields are ignored
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shoot {
    pub api_version: Option<String>,
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: Option<ShootSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    pub seed_name: Option<String>,
    pub region: Option<String>,
    pub provider: Option<ShootProvider>,
    /// Extensions enabled for this shoot
    #[serde(default)]
    pub extensions: Vec<ShootExtension>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootProvider {
    #[serde(rename = "type")]
    pub provider_type: String,
}

/// One entry of `spec.extensions`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootExtension {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub provider_config: Option<serde_json::Value>,
    pub disabled: Option<bool>,
}

impl ShootExtension {
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }
}

impl Shoot {
    /// Decode a shoot out of an arbitrary json document
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidShoot);
        }
        let shoot: Shoot = serde_json::from_value(value).map_err(|_| Error::InvalidShoot)?;
        if let Some(kind) = shoot.kind.as_deref() {
            if kind != "Shoot" {
                return Err(Error::InvalidShoot);
            }
        }
        Ok(shoot)
    }

    /// First extension entry of the given type
    #[must_use]
    pub fn extension(&self, extension_type: &str) -> Option<&ShootExtension> {
        self.spec
            .as_ref()?
            .extensions
            .iter()
            .find(|e| e.extension_type == extension_type)
    }
}
