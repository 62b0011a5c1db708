use async_trait::async_trait;
use common::extension::LastOperationType;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};

pub mod reasons {
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
}

#[must_use]
pub fn from_success(op: LastOperationType, name: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: reasons::SUCCEEDED.to_string(),
        note: Some(format!("{op} of extension `{name}` succeeded")),
        action: op.to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn from_failure(op: LastOperationType, name: &str, error: &str) -> Event {
    Event {
        type_: EventType::Warning,
        reason: reasons::FAILED.to_string(),
        note: Some(format!("{op} of extension `{name}` failed: {error}")),
        action: op.to_string(),
        secondary: None,
    }
}

/// Event sink; publishing never fails the reconciliation
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, reference: &ObjectReference, event: Event);
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: common::context::get_reporter(),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, reference: &ObjectReference, event: Event) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        let reason = event.reason.clone();
        if let Err(e) = recorder.publish(event).await {
            tracing::warn!(reason = %reason, error = %e, "Ignoring error while sending an event");
        }
    }
}
