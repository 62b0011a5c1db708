use crate::OPERATION_ANNOTATION;
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Control-plane tier owning an extension
#[derive(Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionClass {
    Garden,
    Seed,
    #[default]
    Shoot,
}

impl fmt::Display for ExtensionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionClass::Garden => write!(f, "garden"),
            ExtensionClass::Seed => write!(f, "seed"),
            ExtensionClass::Shoot => write!(f, "shoot"),
        }
    }
}

impl FromStr for ExtensionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "garden" => Ok(ExtensionClass::Garden),
            "seed" => Ok(ExtensionClass::Seed),
            "shoot" => Ok(ExtensionClass::Shoot),
            other => Err(format!(
                "invalid extension class specified: {other} (expected garden, seed or shoot)"
            )),
        }
    }
}

/// Schema for opaque embedded documents (the RawExtension of the Go API)
pub(crate) fn raw_extension(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions
        .insert("x-kubernetes-preserve-unknown-fields".into(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

/// Describe an extension enabled for a shoot
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Extension",
    status = "ExtensionStatus",
    shortname = "ext",
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing an extension enabled for a shoot",
    printcolumn = r#"
    {"name":"Type",   "type":"string", "description":"Extension type", "jsonPath":".spec.type"},
    {"name":"Class",  "type":"string", "description":"Extension class", "jsonPath":".spec.class"},
    {"name":"Status", "type":"string", "description":"Last operation state", "jsonPath":".status.lastOperation.state"},
    {"name":"Age",    "type":"date",   "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Extension type, immutable once created
    #[serde(rename = "type")]
    pub extension_type: String,
    /// Tier owning this extension, shoot when unset
    pub class: Option<ExtensionClass>,
    /// Type specific configuration
    #[schemars(schema_with = "raw_extension")]
    pub provider_config: Option<serde_json::Value>,
    /// Acknowledge the extension without acting upon it
    pub disabled: Option<bool>,
}

/// Kind of the last operation run against an extension
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

impl fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    Error,
}

/// LastOperation is the outcome of the last phase run by the controller
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Human readable description of the operation outcome
    pub description: String,
    pub last_update_time: DateTime<Utc>,
    /// Progress in percent
    pub progress: i32,
    pub state: LastOperationState,
    #[serde(rename = "type")]
    pub operation_type: LastOperationType,
}

impl LastOperation {
    #[must_use]
    pub fn new(operation_type: LastOperationType, state: LastOperationState, description: &str) -> Self {
        let progress = match state {
            LastOperationState::Processing => 1,
            LastOperationState::Succeeded => 100,
            LastOperationState::Error => 50,
        };
        LastOperation {
            description: description.to_string(),
            last_update_time: Utc::now(),
            progress,
            state,
            operation_type,
        }
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// The status object of `Extension`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub last_operation: Option<LastOperation>,
    pub last_error: Option<LastError>,
    /// Last spec generation successfully processed
    pub observed_generation: Option<i64>,
}

/// Value of the operation annotation, a one-shot request consumed by the controller
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum OperationAnnotation {
    Reconcile,
    Restore,
    Migrate,
    ForceDelete,
}

impl FromStr for OperationAnnotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile" => Ok(OperationAnnotation::Reconcile),
            "restore" => Ok(OperationAnnotation::Restore),
            "migrate" => Ok(OperationAnnotation::Migrate),
            "force-delete" => Ok(OperationAnnotation::ForceDelete),
            other => Err(format!("unknown operation {other}")),
        }
    }
}

impl Extension {
    #[must_use]
    pub fn class(&self) -> ExtensionClass {
        self.spec.class.unwrap_or_default()
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.spec.disabled.unwrap_or(false)
    }

    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Raw annotation value, if any
    #[must_use]
    pub fn raw_operation(&self) -> Option<&str> {
        self.annotations().get(OPERATION_ANNOTATION).map(String::as_str)
    }

    /// Parsed annotation; unknown values are treated as absent
    #[must_use]
    pub fn operation(&self) -> Option<OperationAnnotation> {
        self.raw_operation().and_then(|v| v.parse().ok())
    }

    #[must_use]
    pub fn last_operation(&self) -> Option<&LastOperation> {
        self.status.as_ref().and_then(|s| s.last_operation.as_ref())
    }

    #[must_use]
    pub fn last_operation_succeeded(&self) -> bool {
        self.last_operation()
            .is_some_and(|op| op.state == LastOperationState::Succeeded)
    }

    #[must_use]
    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }

    /// True when the current spec generation has already been processed
    #[must_use]
    pub fn generation_observed(&self) -> bool {
        match (self.metadata.generation, self.observed_generation()) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}
