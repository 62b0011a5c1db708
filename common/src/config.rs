//! Provider configuration of the example extension.
//!
//! The payload embedded in `providerConfig` is versioned like any API object:
//! `apiVersion`/`kind` select the schema, decoding is strict (unknown fields are
//! rejected) and every version converts into the internal [`ExampleConfig`].
use crate::validation::{self, ErrorList};
use serde::Deserialize;
use thiserror::Error;

pub static CONFIG_GROUP: &str = "example.extensions.gardener.cloud";
pub static CONFIG_KIND: &str = "ExampleConfig";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no provider config specified")]
    Missing,

    #[error("invalid provider spec configuration: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid provider spec configuration: unsupported apiVersion {0}")]
    UnsupportedVersion(String),

    #[error("invalid provider spec configuration: unexpected kind {0}")]
    UnexpectedKind(String),

    #[error("{0}")]
    Invalid(#[source] ErrorList),
}

/// Internal, version independent, provider configuration
#[derive(Eq, PartialEq, Clone, Debug, Default)]
pub struct ExampleConfig {
    pub foo: String,
}

pub mod v1alpha1 {
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    pub static VERSION: &str = "v1alpha1";

    /// ExampleConfig is the schema for the exampleconfigs API
    #[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct ExampleConfig {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub kind: Option<String>,
        /// Foo is foo
        #[serde(default)]
        pub foo: String,
    }

    impl From<ExampleConfig> for super::ExampleConfig {
        fn from(cfg: ExampleConfig) -> Self {
            super::ExampleConfig { foo: cfg.foo }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    api_version: Option<String>,
    kind: Option<String>,
}

/// Strict decoder for the versioned provider configuration
#[derive(Clone, Debug)]
pub struct ConfigDecoder {
    versions: Vec<String>,
}

impl Default for ConfigDecoder {
    fn default() -> Self {
        ConfigDecoder {
            versions: vec![format!("{CONFIG_GROUP}/{}", v1alpha1::VERSION)],
        }
    }
}

impl ConfigDecoder {
    /// Decoder knowing no version at all, only useful to exercise constructors
    #[must_use]
    pub fn empty() -> Self {
        ConfigDecoder { versions: vec![] }
    }

    #[must_use]
    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    /// Decode a raw payload; an absent apiVersion selects the oldest known version
    pub fn decode(&self, raw: &serde_json::Value) -> Result<ExampleConfig, ConfigError> {
        let meta: TypeMeta = serde_json::from_value(raw.clone()).map_err(ConfigError::Decode)?;
        if let Some(kind) = meta.kind {
            if kind != CONFIG_KIND {
                return Err(ConfigError::UnexpectedKind(kind));
            }
        }
        let api_version = match meta.api_version {
            Some(v) => v,
            None => self
                .versions
                .first()
                .cloned()
                .ok_or_else(|| ConfigError::UnsupportedVersion(String::new()))?,
        };
        if !self.versions.contains(&api_version) {
            return Err(ConfigError::UnsupportedVersion(api_version));
        }
        // only one version is served for now, every known apiVersion maps onto it
        let cfg: v1alpha1::ExampleConfig =
            serde_json::from_value(raw.clone()).map_err(ConfigError::Decode)?;
        Ok(cfg.into())
    }

    /// Decode then run the semantic validation
    pub fn decode_and_validate(&self, raw: &serde_json::Value) -> Result<ExampleConfig, ConfigError> {
        let cfg = self.decode(raw)?;
        validation::validate(&cfg).map_err(ConfigError::Invalid)?;
        Ok(cfg)
    }
}
