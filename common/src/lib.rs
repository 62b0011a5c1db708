use thiserror::Error;

/// Everything that can go wrong while decoding or validating extension resources
#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid shoot resource provided")]
    InvalidShoot,

    #[error("extension {0} not found in shoot spec")]
    ExtensionNotFound(String),

    #[error("invalid extension config: {0}")]
    InvalidExtensionConfig(#[source] config::ConfigError),

    #[error("invalid validator: {0}")]
    InvalidValidator(String),

    #[error("invalid cluster {name}: {reason}")]
    InvalidCluster { name: String, reason: String },
}
impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}")
            .split(|c: char| c == '(' || c == ' ' || c == '{')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod cluster;
pub mod config;
pub mod context;
pub mod extension;
pub mod shoot;
pub mod validation;

pub use cluster::{Cluster, ClusterContext};
pub use config::{ConfigDecoder, ExampleConfig};
pub use extension::{Extension, ExtensionClass, ExtensionSpec, ExtensionStatus};
pub use shoot::Shoot;

/// Type of the extension resources handled by this repository
pub static EXTENSION_TYPE: &str = "example";
/// Name of the extension, used for leases, webhook names and field managers
pub static EXTENSION_NAME: &str = "gardener-extension-example";
/// Suffix appended to `extensions.gardener.cloud/` to build the finalizer
pub static FINALIZER_SUFFIX: &str = "example";
/// Annotation carrying one-shot operation requests
pub static OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Label carried by shoots having this extension enabled
#[must_use]
pub fn extension_label(extension_type: &str) -> String {
    format!("extensions.extensions.gardener.cloud/{extension_type}")
}

/// Full finalizer name for a given suffix
#[must_use]
pub fn finalizer_name(suffix: &str) -> String {
    format!("extensions.gardener.cloud/{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_label_keeps_variant_name_only() {
        assert_eq!(Error::InvalidShoot.metric_label(), "invalidshoot");
        assert_eq!(
            Error::ExtensionNotFound("example".into()).metric_label(),
            "extensionnotfound"
        );
        let e = Error::InvalidCluster {
            name: "shoot--a--b".into(),
            reason: "missing".into(),
        };
        assert_eq!(e.metric_label(), "invalidcluster");
    }

    #[test]
    fn labels_and_finalizers() {
        assert_eq!(
            extension_label(EXTENSION_TYPE),
            "extensions.extensions.gardener.cloud/example"
        );
        assert_eq!(finalizer_name(FINALIZER_SUFFIX), "extensions.gardener.cloud/example");
    }
}
