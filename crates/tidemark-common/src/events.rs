//! Kubernetes Event recording for the Tidemark controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that the reconciler can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SuccessfulRescale")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
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
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A new replica count was written to the target's scale subresource
    pub const SUCCESSFUL_RESCALE: &str = "SuccessfulRescale";
    /// Writing the new replica count failed
    pub const FAILED_RESCALE: &str = "FailedRescale";
    /// A decision was computed but enactment was withheld
    pub const NOT_SCALING: &str = "NotScaling";
    /// The autoscaler spec failed validation
    pub const FAILED_SPEC_CHECK: &str = "FailedSpecCheck";
    /// The external metrics service could not provide samples
    pub const FAILED_GET_EXTERNAL_METRIC: &str = "FailedGetExternalMetric";
    /// The resource metrics service could not provide samples
    pub const FAILED_GET_RESOURCE_METRIC: &str = "FailedGetResourceMetric";
    /// The status subresource could not be updated
    pub const FAILED_UPDATE_STATUS: &str = "FailedUpdateStatus";
    /// The replica count in status could not be updated
    pub const FAILED_UPDATE_REPLICAS: &str = "FailedUpdateReplicas";
    /// No replica proposal could be derived from the metric specs
    pub const FAILED_COMPUTE_METRICS_REPLICAS: &str = "FailedComputeMetricsReplicas";
    /// The reconciliation pipeline failed before a decision was reached
    pub const FAILED_PROCESS_AUTOSCALER: &str = "FailedProcessAutoscaler";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::SUCCESSFUL_RESCALE, "SuccessfulRescale");
        assert_eq!(reasons::FAILED_SPEC_CHECK, "FailedSpecCheck");
        assert_eq!(reasons::FAILED_GET_EXTERNAL_METRIC, "FailedGetExternalMetric");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::SUCCESSFUL_RESCALE,
                Some("New size: 3".to_string()),
            )
            .await;
    }
}
