//! Warning events attached to Instances
//!
//! Events are fire-and-forget: a failure to publish is logged and never
//! affects the reconciliation outcome.

use crate::crd::Instance;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

pub const REASON_TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
pub const REASON_TENANT_NOT_FOUND: &str = "TenantNotFound";
pub const REASON_ENVIRONMENT_ENFORCEMENT_FAILED: &str = "EnvironmentEnforcementFailed";

const REPORTER: &str = "instance-operator";

/// Destination of the events emitted during reconciliation
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warn(&self, instance: &Instance, reason: &str, note: String);
}

/// Publishes events through the Kubernetes events API.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn warn(&self, instance: &Instance, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &instance.object_ref(&())).await {
            warn!(error = %e, reason = %reason, "failed to publish event");
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps the emitted events in memory.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        pub fn reasons(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn warn(&self, _instance: &Instance, reason: &str, note: String) {
            self.events.lock().unwrap().push((reason.to_string(), note));
        }
    }
}
