//! WatermarkAutoscaler reconciliation driver.
//!
//! Per-policy top-level loop: fetch the target's scale, run the metric
//! aggregation pipeline, normalize the proposal, gate it on the cooldown
//! windows, then either write the scale subresource or record a dry-run.
//! The final status write is the single commit point of a reconciliation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::{Client, Resource, ResourceExt};
use tracing::{error, info, instrument, warn};

use tidemark_common::crd::quantity::{from_milli, milli_value};
use tidemark_common::crd::{
    set_condition, ConditionStatus, ConditionType, MetricSpec, MetricSourceType, MetricStatus,
    WatermarkAutoscaler, WatermarkAutoscalerStatus,
};
use tidemark_common::events::{reasons, EventPublisher, KubeEventPublisher};
use tidemark_common::metrics::{
    clear_autoscaler_series, clear_replica_proposal, set_replica_bounds, set_replica_effective,
    set_replica_proposal, set_watermarks, AutoscalerLabels,
};
use tidemark_common::{Error, CLEANUP_FINALIZER, ERROR_RETRY_DELAY_SECS};

use crate::calculator::{autoscaler_labels, ReplicaCalculator};
use crate::cooldown::{should_scale, CooldownStatus};
use crate::metrics_client::RestMetricsClient;
use crate::normalizer::normalize;
use crate::pods::PodLister;
use crate::scale::{
    AutoscalerClient, KubeAutoscalerClient, KubeScaleClient, ScaleClient, ScaleTarget,
};

/// Controller context shared by every reconciliation
pub struct Context {
    /// Kubernetes client, used for finalizer bookkeeping
    pub client: Client,
    /// Write access to the autoscaler object
    pub autoscalers: Arc<dyn AutoscalerClient>,
    /// Access to the target's scale subresource
    pub scales: Arc<dyn ScaleClient>,
    /// The decision engine
    pub calculator: ReplicaCalculator,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Interval between two reconciliations of the same autoscaler
    pub sync_period: StdDuration,
}

impl Context {
    /// Build a production context around the given client
    pub fn new(client: Client, sync_period: StdDuration, pod_lister: Arc<dyn PodLister>) -> Self {
        let metrics_client = Arc::new(RestMetricsClient::new(client.clone()));
        Self {
            autoscalers: Arc::new(KubeAutoscalerClient::new(client.clone())),
            scales: Arc::new(KubeScaleClient::new(client.clone())),
            calculator: ReplicaCalculator::new(metrics_client, pod_lister),
            events: Arc::new(KubeEventPublisher::new(client.clone(), "tidemark-controller")),
            client,
            sync_period,
        }
    }
}

/// Reconcile a WatermarkAutoscaler.
///
/// Wraps the actual work in a finalizer so per-policy metric series are
/// removed before the object disappears.
#[instrument(skip(wma, ctx), fields(namespace = %wma.namespace().unwrap_or_default(), name = %wma.name_any()))]
pub async fn reconcile(
    wma: Arc<WatermarkAutoscaler>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let namespace = wma.namespace().unwrap_or_default();
    let api: Api<WatermarkAutoscaler> = Api::namespaced(ctx.client.clone(), &namespace);
    match finalizer(&api, CLEANUP_FINALIZER, wma, move |event| async move {
        match event {
            FinalizerEvent::Apply(wma) => apply(&wma, &ctx).await,
            FinalizerEvent::Cleanup(wma) => cleanup(&wma).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(FinalizerError::ApplyFailed(err)) | Err(FinalizerError::CleanupFailed(err)) => Err(err),
        Err(e) => Err(Error::internal_with_context("finalizer", e.to_string())),
    }
}

/// Error policy for the controller runtime
pub fn error_policy(_wma: Arc<WatermarkAutoscaler>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(error = %error, "Reconciliation error, will retry");
        Action::requeue(StdDuration::from_secs(30))
    } else {
        warn!(error = %error, "Permanent reconciliation error, waiting for a spec change");
        Action::await_change()
    }
}

/// Deletion path: drop every metric series labeled with this autoscaler
async fn cleanup(wma: &WatermarkAutoscaler) -> Result<Action, Error> {
    let labels = autoscaler_labels(wma);
    clear_autoscaler_series(&labels, wma.spec.metrics.iter().map(|m| m.metric_name()));
    info!("Cleaned up metric series for deleted autoscaler");
    Ok(Action::await_change())
}

async fn apply(wma: &WatermarkAutoscaler, ctx: &Context) -> Result<Action, Error> {
    // Persist defaults first so the running configuration is visible in the
    // spec; the write re-enqueues the object.
    if !wma.spec.is_defaulted() {
        info!("Some configuration options are missing, falling back to the default ones");
        ctx.autoscalers
            .apply_defaults(wma, &wma.spec.with_defaults())
            .await?;
        return Ok(Action::requeue(StdDuration::ZERO));
    }

    let status_original = wma.status.clone().unwrap_or_default();
    let mut status = status_original.clone();
    let obj_ref = wma.object_ref(&());

    if let Err(e) = wma.spec.validate(&wma.name_any()) {
        info!(error = %e, "Got an invalid autoscaler spec");
        ctx.events
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::FAILED_SPEC_CHECK,
                Some(e.to_string()),
            )
            .await;
        set_condition(
            &mut status.conditions,
            ConditionType::AbleToScale,
            ConditionStatus::False,
            reasons::FAILED_SPEC_CHECK,
            format!("Invalid autoscaler specification: {e}"),
        );
        update_status_if_needed(wma, ctx, &status_original, &status).await?;
        // a spec update will re-enqueue the object
        return Ok(Action::await_change());
    }

    if wma.spec.dry_run {
        set_condition(
            &mut status.conditions,
            ConditionType::DryRun,
            ConditionStatus::True,
            "DryRunEnabled",
            "Scaling changes won't be applied",
        );
    } else {
        set_condition(
            &mut status.conditions,
            ConditionType::DryRun,
            ConditionStatus::False,
            "DryRunDisabled",
            "Scaling changes can be applied",
        );
    }

    // Programmer errors in the pipeline must not tear down the process; a
    // panicking reconciliation ends without mutating status.
    let outcome =
        AssertUnwindSafe(reconcile_autoscaler(wma, ctx, &status_original, &mut status))
            .catch_unwind()
            .await;
    match outcome {
        Err(panic) => {
            error!(
                panic = panic_message(panic.as_ref()),
                "Runtime panic in the reconciliation pipeline"
            );
            Ok(Action::requeue(ctx.sync_period))
        }
        Ok(Err(e @ Error::TargetNotFound { .. })) => {
            warn!(error = %e, "Scale target not found; waiting for a spec change");
            Ok(Action::await_change())
        }
        Ok(Err(e)) => {
            info!(error = %e, "Error during autoscaler reconciliation");
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::FAILED_PROCESS_AUTOSCALER,
                    Some(e.to_string()),
                )
                .await;
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                ConditionStatus::False,
                reasons::FAILED_PROCESS_AUTOSCALER,
                "Error happened while processing the autoscaler",
            );
            update_status_if_needed(wma, ctx, &status_original, &status).await?;
            Ok(Action::requeue(StdDuration::from_secs(ERROR_RETRY_DELAY_SECS)))
        }
        Ok(Ok(())) => Ok(Action::requeue(ctx.sync_period)),
    }
}

/// The core pipeline of one reconciliation.
async fn reconcile_autoscaler(
    wma: &WatermarkAutoscaler,
    ctx: &Context,
    status_original: &WatermarkAutoscalerStatus,
    status: &mut WatermarkAutoscalerStatus,
) -> Result<(), Error> {
    let target = ScaleTarget::from_autoscaler(wma);
    let scale = ctx.scales.get_scale(&target).await?;
    let current_replicas = scale.status.as_ref().map(|s| s.replicas).unwrap_or_default();
    let spec_replicas = scale
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or_default();
    info!(replicas = current_replicas, "Fetched the target's scale");

    let labels = autoscaler_labels(wma);
    let obj_ref = wma.object_ref(&());
    let reference = format!("{}/{}/{}", target.kind, target.namespace, target.name);
    let min_replicas = wma.spec.min_replicas();

    set_condition(
        &mut status.conditions,
        ConditionType::AbleToScale,
        ConditionStatus::True,
        "SucceededGetScale",
        "the controller was able to get the target's current scale",
    );

    let mut metric_statuses = status_original.current_metrics.clone();
    let mut desired_replicas = 0;
    let mut rescale_reason = String::new();
    let mut now = Utc::now();
    let mut rescale = true;

    if spec_replicas == 0 {
        // autoscaling is disabled while the target is parked at zero
        desired_replicas = 0;
        rescale = false;
        set_condition(
            &mut status.conditions,
            ConditionType::ScalingActive,
            ConditionStatus::False,
            "ScalingDisabled",
            "scaling is disabled since the replica count of the target is zero",
        );
    } else if current_replicas > wma.spec.max_replicas {
        rescale_reason = "Current number of replicas above Spec.MaxReplicas".to_string();
        desired_replicas = wma.spec.max_replicas;
    } else if current_replicas < min_replicas {
        rescale_reason = "Current number of replicas below Spec.MinReplicas".to_string();
        desired_replicas = min_replicas;
    } else if current_replicas == 0 {
        rescale_reason = "Current number of replicas must be greater than 0".to_string();
        desired_replicas = 1;
    } else {
        let computation = match compute_replicas_for_metrics(wma, ctx, &scale, &labels, status).await
        {
            Ok(computation) => computation,
            Err(e) => {
                status.current_replicas = current_replicas;
                status.desired_replicas = status_original.desired_replicas;
                if let Err(update_err) =
                    update_status_if_needed(wma, ctx, status_original, status).await
                {
                    ctx.events
                        .publish(
                            &obj_ref,
                            EventType::Warning,
                            reasons::FAILED_UPDATE_REPLICAS,
                            Some(update_err.to_string()),
                        )
                        .await;
                    set_condition(
                        &mut status.conditions,
                        ConditionType::AbleToScale,
                        ConditionStatus::False,
                        reasons::FAILED_UPDATE_REPLICAS,
                        format!(
                            "the controller was unable to update the number of replicas: {update_err}"
                        ),
                    );
                    return Ok(());
                }
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Warning,
                        reasons::FAILED_COMPUTE_METRICS_REPLICAS,
                        Some(e.to_string()),
                    )
                    .await;
                info!(
                    reference,
                    error = %e,
                    "Failed to compute desired number of replicas based on listed metrics"
                );
                return Ok(());
            }
        };

        metric_statuses = computation.statuses;
        info!(
            proposed = computation.replicas,
            metric = %computation.metric_name,
            reference,
            "Proposing replicas"
        );

        let mut rescale_metric = String::new();
        if computation.replicas > desired_replicas {
            desired_replicas = computation.replicas;
            now = computation.timestamp;
            rescale_metric = computation.metric_name;
        }
        if desired_replicas > current_replicas {
            rescale_reason = format!("{rescale_metric} above target");
        }
        if desired_replicas < current_replicas {
            rescale_reason = "All metrics below target".to_string();
        }

        let normalization = normalize(
            &labels,
            min_replicas,
            wma.spec.max_replicas,
            wma.spec.scale_up_limit_factor(),
            wma.spec.scale_down_limit_factor(),
            current_replicas,
            desired_replicas,
        );
        set_condition(
            &mut status.conditions,
            ConditionType::ScalingLimited,
            if normalization.limited {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            normalization.reason,
            normalization.message,
        );
        desired_replicas = normalization.replicas;
        info!(desired = desired_replicas, "Normalized replicas");

        let decision = should_scale(
            &labels,
            status_original.last_scale_time,
            wma.spec.upscale_forbidden_window(),
            wma.spec.downscale_forbidden_window(),
            current_replicas,
            desired_replicas,
            now,
        );
        match decision.status {
            CooldownStatus::BackoffBoth => set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                ConditionStatus::False,
                "BackoffBoth",
                "the time since the previous scale is still within both the downscale and upscale forbidden windows",
            ),
            CooldownStatus::BackoffUpscale => set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                ConditionStatus::False,
                "BackoffUpscale",
                "the time since the previous scale is still within the upscale forbidden window",
            ),
            CooldownStatus::BackoffDownscale => set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                ConditionStatus::False,
                "BackoffDownscale",
                "the time since the previous scale is still within the downscale forbidden window",
            ),
            CooldownStatus::ReadyForScale => {}
        }
        rescale = decision.allowed;
    }

    if rescale {
        set_condition(
            &mut status.conditions,
            ConditionType::AbleToScale,
            ConditionStatus::True,
            "ReadyForScale",
            "the last scaling time was sufficiently old as to warrant a new scale",
        );

        if wma.spec.dry_run {
            info!(
                current_replicas,
                desired_replicas, "Dry-run mode: scaling change was inhibited"
            );
            // the decision is recorded, but the commit point is skipped and
            // the last scale time stays untouched
            set_status(status, current_replicas, desired_replicas, metric_statuses, false);
            return update_status_if_needed(wma, ctx, status_original, status).await;
        }

        if let Err(e) = ctx.scales.update_replicas(&target, desired_replicas).await {
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::FAILED_RESCALE,
                    Some(format!(
                        "New size: {desired_replicas}; reason: {rescale_reason}; error: {e}"
                    )),
                )
                .await;
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                ConditionStatus::False,
                "FailedUpdateScale",
                format!("the controller was unable to update the target scale: {e}"),
            );
            status.current_replicas = current_replicas;
            status.desired_replicas = status_original.desired_replicas;
            if let Err(update_err) =
                update_status_if_needed(wma, ctx, status_original, status).await
            {
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Warning,
                        reasons::FAILED_UPDATE_REPLICAS,
                        Some(update_err.to_string()),
                    )
                    .await;
            }
            return Ok(());
        }

        set_condition(
            &mut status.conditions,
            ConditionType::AbleToScale,
            ConditionStatus::True,
            "SucceededRescale",
            format!("the controller was able to update the target scale to {desired_replicas}"),
        );
        ctx.events
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::SUCCESSFUL_RESCALE,
                Some(format!(
                    "New size: {desired_replicas}; reason: {rescale_reason}"
                )),
            )
            .await;
        info!(
            current_replicas,
            desired_replicas,
            reason = %rescale_reason,
            "Successful rescale"
        );
    } else {
        ctx.events
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::NOT_SCALING,
                Some(format!(
                    "Decided not to scale {reference} to {desired_replicas} (last scale time was {:?})",
                    status.last_scale_time
                )),
            )
            .await;
        desired_replicas = current_replicas;
    }

    set_replica_effective(&labels, desired_replicas);
    set_status(status, current_replicas, desired_replicas, metric_statuses, rescale);
    update_status_if_needed(wma, ctx, status_original, status).await
}

/// Aggregation across metric specs: the largest proposal wins.
struct MetricsComputation {
    replicas: i32,
    metric_name: String,
    statuses: Vec<MetricStatus>,
    timestamp: DateTime<Utc>,
}

async fn compute_replicas_for_metrics(
    wma: &WatermarkAutoscaler,
    ctx: &Context,
    scale: &Scale,
    labels: &AutoscalerLabels,
    status: &mut WatermarkAutoscalerStatus,
) -> Result<MetricsComputation, Error> {
    set_replica_bounds(labels, wma.spec.min_replicas(), wma.spec.max_replicas);

    let obj_ref = wma.object_ref(&());
    let mut statuses = Vec::with_capacity(wma.spec.metrics.len());
    let mut replicas = 0;
    let mut metric_name = String::new();
    let mut timestamp = Utc::now();

    for metric in &wma.spec.metrics {
        let failure_reason = match metric.source_type() {
            MetricSourceType::External => reasons::FAILED_GET_EXTERNAL_METRIC,
            MetricSourceType::Resource => reasons::FAILED_GET_RESOURCE_METRIC,
        };

        let (low, high) = metric.watermarks();
        let (Some(low), Some(high)) = (low, high) else {
            let message = match metric.source_type() {
                MetricSourceType::External => {
                    "invalid external metric source: the high watermark and the low watermark are required"
                }
                MetricSourceType::Resource => {
                    "invalid resource metric source: the high watermark and the low watermark are required"
                }
            };
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    failure_reason,
                    Some(message.to_string()),
                )
                .await;
            set_condition(
                &mut status.conditions,
                ConditionType::ScalingActive,
                ConditionStatus::False,
                failure_reason,
                message,
            );
            return Err(Error::validation_for(wma.name_any(), message));
        };

        let calculation = match metric {
            MetricSpec::External {
                metric_name: name,
                metric_selector,
                ..
            } => {
                ctx.calculator
                    .external_metric_replicas(wma, scale, name, metric_selector.as_ref(), low, high)
                    .await
            }
            MetricSpec::Resource {
                name,
                metric_selector,
                ..
            } => {
                ctx.calculator
                    .resource_replicas(wma, scale, name, metric_selector.as_ref(), low, high)
                    .await
            }
        };

        let calculation = match calculation {
            Ok(calculation) => calculation,
            Err(e) => {
                clear_replica_proposal(labels);
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Warning,
                        failure_reason,
                        Some(e.to_string()),
                    )
                    .await;
                set_condition(
                    &mut status.conditions,
                    ConditionType::ScalingActive,
                    ConditionStatus::False,
                    failure_reason,
                    format!("the controller was unable to compute the replica count: {e}"),
                );
                return Err(e);
            }
        };

        set_watermarks(
            labels,
            metric.metric_name(),
            milli_value(low)?,
            milli_value(high)?,
        );
        set_replica_proposal(labels, calculation.proposed_replicas);
        statuses.push(MetricStatus {
            type_: metric.source_type(),
            name: metric.metric_name().to_string(),
            current_value: from_milli(calculation.utilization_milli),
        });

        if replicas == 0 || calculation.proposed_replicas > replicas {
            replicas = calculation.proposed_replicas;
            metric_name = metric.metric_name().to_string();
            timestamp = calculation.timestamp;
        }
    }

    set_condition(
        &mut status.conditions,
        ConditionType::ScalingActive,
        ConditionStatus::True,
        "ValidMetricFound",
        format!(
            "the controller was able to successfully calculate a replica count from {metric_name}"
        ),
    );

    Ok(MetricsComputation {
        replicas,
        metric_name,
        statuses,
        timestamp,
    })
}

/// Recreate the replica-related fields of the status; the last scale time
/// moves only when a scale was actually written.
fn set_status(
    status: &mut WatermarkAutoscalerStatus,
    current_replicas: i32,
    desired_replicas: i32,
    metric_statuses: Vec<MetricStatus>,
    rescaled: bool,
) {
    status.current_replicas = current_replicas;
    status.desired_replicas = desired_replicas;
    status.current_metrics = metric_statuses;
    if rescaled {
        status.last_scale_time = Some(Utc::now());
    }
}

/// Write the status only when it differs from the snapshot the
/// reconciliation began with.
async fn update_status_if_needed(
    wma: &WatermarkAutoscaler,
    ctx: &Context,
    original: &WatermarkAutoscalerStatus,
    current: &WatermarkAutoscalerStatus,
) -> Result<(), Error> {
    if original == current {
        return Ok(());
    }
    ctx.autoscalers.patch_status(wma, current).await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
