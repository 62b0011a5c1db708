use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("{0}")]
    ExtensionError(#[source] common::Error),

    #[error("Conflict while writing {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("{operation} failed: {reason}")]
    ActuatorError { operation: String, reason: String },

    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("TLS Error: {0}")]
    TlsError(String),

    #[error("IO Error: {0}")]
    IoError(#[source] std::io::Error),

    #[error("leadership lost")]
    LeadershipLost,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        format!("{self:?}")
            .split(|c: char| c == '(' || c == ' ' || c == '{')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Map a kube error, turning 409 answers into `Conflict`
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(ref e) if e.code == 409 => Error::Conflict(what.to_string()),
            kube::Error::Api(ref e) if e.code == 404 => Error::NotFound(what.to_string()),
            e => Error::KubeError(e),
        }
    }
}

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        Error::ExtensionError(e)
    }
}

/// Phases an extension implementation provides
pub mod actuator;
pub use actuator::{Actuator, ExampleActuator};

/// Admission validation of the shoot provider config
pub mod admission;
pub mod webhook;

pub mod backoff;
pub mod controller;
pub mod events;
pub mod health;
pub mod heartbeat;
pub mod leader;
pub mod options;
pub mod store;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::{Context, Manager};

/// Log integrations
pub mod telemetry;

/// Metrics
pub mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod mock;
