//! Kubernetes Event recording for kommit controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers can
//! emit Events visible via `kubectl describe` while tests stay offline.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Reporting component on every Event kommit emits
pub const CONTROLLER_NAME: &str = "kommit-controller";

/// Publishes Kubernetes Events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A RemoteUserBinding resolved a RemoteUser for every host
    pub const ALL_BOUND: &str = "AllBound";
    /// Some RemoteUsers of a binding are missing or unbound
    pub const PARTIALLY_BOUND: &str = "PartiallyBound";
    /// No RemoteUser of a binding is usable
    pub const NONE_BOUND: &str = "NoneBound";
    /// Two referenced RemoteUsers point at the same Git host
    pub const DUPLICATE_HOST: &str = "DuplicateHost";
    /// A RemoteSyncer's webhook entry was installed or refreshed
    pub const WEBHOOK_INSTALLED: &str = "WebhookInstalled";
    /// Installing a RemoteSyncer's webhook entry failed
    pub const WEBHOOK_FAILED: &str = "WebhookInstallFailed";
    /// A RemoteSyncer's webhook entry was removed on deletion
    pub const WEBHOOK_REMOVED: &str = "WebhookRemoved";
    /// Target pattern annotations could not be applied
    pub const TARGET_PATTERN_FAILED: &str = "TargetPatternFailed";
}

/// Event actions
pub mod actions {
    /// Regular reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Cleanup before deletion
    pub const CLEANUP: &str = "Cleanup";
}
