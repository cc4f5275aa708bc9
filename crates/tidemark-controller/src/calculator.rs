//! Replica calculation from metric samples.
//!
//! Wraps the metric clients, applies the readiness filter, normalizes the
//! usage scalar and compares it against the tolerance-adjusted watermarks.
//!
//! The scaling base differs per metric kind on purpose: external metrics
//! are workload-wide, so the base is the observed ready-pod count; resource
//! metrics are per-pod aggregates, so the base is the replica count the
//! orchestrator records on the scale subresource.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::{info, warn};

use tidemark_common::crd::quantity::milli_value;
use tidemark_common::crd::{selector_to_query, ScalingAlgorithm, WatermarkAutoscaler};
use tidemark_common::metrics::{
    clear_metric_series, set_restricted_scaling, set_usage, AutoscalerLabels, RestrictionReason,
};
use tidemark_common::Error;

use crate::metrics_client::MetricsClient;
use crate::pods::{
    group_pods, ready_pods_count, remove_samples_for, PodLister, TargetSelector,
};

/// Outcome of evaluating one metric spec
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaCalculation {
    /// Replica count proposed by the watermark evaluator
    pub proposed_replicas: i32,
    /// Usage scalar the proposal was derived from, in milli-units
    pub utilization_milli: i64,
    /// Timestamp of the metric samples
    pub timestamp: DateTime<Utc>,
}

/// Converts metric samples into replica proposals
pub struct ReplicaCalculator {
    metrics_client: Arc<dyn MetricsClient>,
    pod_lister: Arc<dyn PodLister>,
}

impl ReplicaCalculator {
    /// Build a calculator over the given metric and pod sources
    pub fn new(metrics_client: Arc<dyn MetricsClient>, pod_lister: Arc<dyn PodLister>) -> Self {
        Self {
            metrics_client,
            pod_lister,
        }
    }

    /// Desired replica count from an external (workload-wide) metric.
    ///
    /// The ready-pod count is resolved first; a selector that matches no
    /// ready pod fails the whole evaluation even under the absolute
    /// algorithm.
    pub async fn external_metric_replicas(
        &self,
        wma: &WatermarkAutoscaler,
        scale: &Scale,
        metric_name: &str,
        selector: Option<&LabelSelector>,
        low: &Quantity,
        high: &Quantity,
    ) -> Result<ReplicaCalculation, Error> {
        let namespace = wma.namespace().unwrap_or_default();
        let labels = autoscaler_labels(wma);

        // The scale selector is produced by the orchestrator; set-based
        // requirements it may contain are tolerated by matching everything,
        // the readiness count still bounds the result.
        let target_selector = match TargetSelector::parse(scale_selector(scale)) {
            Ok(selector) => selector,
            Err(e) => {
                warn!(error = %e, "Could not parse the labels of the target");
                TargetSelector::default()
            }
        };
        let pods = self.pod_lister.list(&namespace, &target_selector)?;
        let ready_replicas =
            ready_pods_count(&pods, wma.spec.readiness_delay(), &target_selector)?;

        let averaged = match wma.spec.algorithm() {
            ScalingAlgorithm::Average => ready_replicas as f64,
            ScalingAlgorithm::Absolute => 1.0,
        };

        let selector_query = selector_to_query(selector)?;
        let (values, timestamp) = self
            .metrics_client
            .get_external_metric(metric_name, &namespace, &selector_query)
            .await
            .map_err(|e| {
                clear_metric_series(&labels, metric_name);
                Error::metrics_fetch(wma.name_any(), metric_name, e.to_string())
            })?;

        let raw_usage: i64 = values.iter().sum();
        let adjusted_usage = raw_usage as f64 / averaged;

        let (proposed_replicas, utilization_milli) = watermark_replica_count(
            ready_replicas,
            wma.spec.tolerance(),
            &labels,
            metric_name,
            adjusted_usage,
            milli_value(low)?,
            milli_value(high)?,
        );
        Ok(ReplicaCalculation {
            proposed_replicas,
            utilization_milli,
            timestamp,
        })
    }

    /// Desired replica count from a per-pod resource metric.
    pub async fn resource_replicas(
        &self,
        wma: &WatermarkAutoscaler,
        scale: &Scale,
        resource: &str,
        selector: Option<&LabelSelector>,
        low: &Quantity,
        high: &Quantity,
    ) -> Result<ReplicaCalculation, Error> {
        let namespace = wma.namespace().unwrap_or_default();
        let labels = autoscaler_labels(wma);

        let selector_query = selector_to_query(selector)?;
        let (mut samples, timestamp) = self
            .metrics_client
            .get_resource_metric(resource, &namespace, &selector_query)
            .await
            .map_err(|e| {
                clear_metric_series(&labels, resource);
                Error::metrics_fetch(wma.name_any(), resource, e.to_string())
            })?;

        let target_selector = TargetSelector::parse(scale_selector(scale)).map_err(|e| {
            Error::internal_with_context(
                "replica-calculator",
                format!("could not parse the labels of the target: {e}"),
            )
        })?;
        let pods = self.pod_lister.list(&namespace, &target_selector)?;
        if pods.is_empty() {
            return Err(Error::NoPodsMatched {
                selector: target_selector.to_string(),
            });
        }

        let groups = group_pods(&pods, &samples, wma.spec.readiness_delay());
        if groups.ready.is_empty() {
            return Err(Error::NoReadyPods {
                selector: target_selector.to_string(),
                pod_count: pods.len(),
            });
        }
        remove_samples_for(&mut samples, &groups.ignored);
        if samples.is_empty() {
            return Err(Error::NoMetricsForReadyPods);
        }

        let averaged = match wma.spec.algorithm() {
            ScalingAlgorithm::Average => groups.ready.len() as f64,
            ScalingAlgorithm::Absolute => 1.0,
        };

        let raw_usage: i64 = samples.values().map(|s| s.value_milli).sum();
        let adjusted_usage = raw_usage as f64 / averaged;

        let current_replicas = scale.status.as_ref().map(|s| s.replicas).unwrap_or_default();
        let (proposed_replicas, utilization_milli) = watermark_replica_count(
            current_replicas,
            wma.spec.tolerance(),
            &labels,
            resource,
            adjusted_usage,
            milli_value(low)?,
            milli_value(high)?,
        );
        Ok(ReplicaCalculation {
            proposed_replicas,
            utilization_milli,
            timestamp,
        })
    }
}

/// Compare the usage scalar against the tolerance-adjusted watermarks and
/// emit a proposed replica count.
///
/// The division is by the raw watermark, not the adjusted one, so the
/// post-scale target sits strictly inside the band; the floor combined with
/// `max(1)` guarantees progress without oscillation when usage is tiny.
pub fn watermark_replica_count(
    current_replicas: i32,
    tolerance: f64,
    labels: &AutoscalerLabels,
    metric_name: &str,
    adjusted_usage: f64,
    low_milli: i64,
    high_milli: i64,
) -> (i32, i64) {
    let utilization_milli = adjusted_usage as i64;
    let adjusted_high = high_milli as f64 * (1.0 + tolerance);
    let adjusted_low = low_milli as f64 * (1.0 - tolerance);

    let proposed = if adjusted_usage > adjusted_high {
        let proposed =
            ((current_replicas as f64) * adjusted_usage / (high_milli as f64)).ceil() as i32;
        info!(
            usage_milli = utilization_milli,
            replica_count = proposed,
            "Value is above the high watermark"
        );
        proposed
    } else if adjusted_usage < adjusted_low {
        let proposed =
            ((current_replicas as f64) * adjusted_usage / (low_milli as f64)).floor() as i32;
        let proposed = proposed.max(1);
        info!(
            usage_milli = utilization_milli,
            replica_count = proposed,
            "Value is below the low watermark"
        );
        proposed
    } else {
        set_restricted_scaling(labels, RestrictionReason::WithinBounds, true);
        set_usage(labels, metric_name, adjusted_usage);
        info!(
            usage_milli = utilization_milli,
            low_milli,
            high_milli,
            tolerance,
            "Within bounds of the watermarks"
        );
        return (current_replicas, utilization_milli);
    };

    set_restricted_scaling(labels, RestrictionReason::WithinBounds, false);
    set_usage(labels, metric_name, adjusted_usage);
    (proposed, utilization_milli)
}

/// Label set identifying an autoscaler and its target on every gauge
pub fn autoscaler_labels(wma: &WatermarkAutoscaler) -> AutoscalerLabels {
    AutoscalerLabels::new(
        wma.name_any(),
        wma.namespace().unwrap_or_default(),
        &wma.spec.scale_target_ref.name,
        &wma.spec.scale_target_ref.kind,
    )
}

fn scale_selector(scale: &Scale) -> &str {
    scale
        .status
        .as_ref()
        .and_then(|s| s.selector.as_deref())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Duration;
    use k8s_openapi::api::autoscaling::v1::{ScaleSpec, ScaleStatus};
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use tidemark_common::crd::{MetricSpec, ScaleTargetRef, WatermarkAutoscalerSpec};

    use crate::metrics_client::{MockMetricsClient, PodSample};
    use crate::pods::MockPodLister;

    fn quantity(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn autoscaler(algorithm: ScalingAlgorithm, tolerance: f64) -> WatermarkAutoscaler {
        let spec = WatermarkAutoscalerSpec {
            scale_target_ref: ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "web".to_string(),
            },
            min_replicas: Some(1),
            max_replicas: 100,
            algorithm: Some(algorithm),
            tolerance: Some(tolerance),
            scale_up_limit_factor: Some(50.0),
            scale_down_limit_factor: Some(20.0),
            upscale_forbidden_window_seconds: Some(60),
            downscale_forbidden_window_seconds: Some(300),
            readiness_delay_seconds: Some(10),
            dry_run: false,
            metrics: vec![MetricSpec::External {
                metric_name: "queue_depth".to_string(),
                metric_selector: None,
                low_watermark: Some(quantity("5")),
                high_watermark: Some(quantity("8")),
            }],
        };
        let mut wma = WatermarkAutoscaler::new("web", spec);
        wma.metadata.namespace = Some("default".to_string());
        wma
    }

    fn scale(replicas: i32) -> Scale {
        Scale {
            metadata: Default::default(),
            spec: Some(ScaleSpec {
                replicas: Some(replicas),
            }),
            status: Some(ScaleStatus {
                replicas,
                selector: Some("app=web".to_string()),
            }),
        }
    }

    fn ready_pod(name: &str) -> Pod {
        let now = Utc::now();
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            start_time: Some(Time(now - Duration::seconds(600))),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Time(now - Duration::seconds(500))),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn lister_with(pods: Vec<Pod>) -> Arc<MockPodLister> {
        let mut lister = MockPodLister::new();
        lister.expect_list().returning(move |_, _| Ok(pods.clone()));
        Arc::new(lister)
    }

    #[tokio::test]
    async fn external_upscale_above_high_watermark() {
        // 10 ready pods, samples summing to 90000m, band [5000m, 8000m],
        // tolerance 0.1: usage 9000 > 8800 so 10 * 9000 / 8000 rounds up
        // to 12.
        let pods: Vec<Pod> = (0..10).map(|i| ready_pod(&format!("web-{i}"))).collect();
        let mut metrics = MockMetricsClient::new();
        metrics
            .expect_get_external_metric()
            .returning(|_, _, _| Ok((vec![45_000, 45_000], Utc::now())));

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Average, 0.1);
        let result = calc
            .external_metric_replicas(
                &wma,
                &scale(10),
                "queue_depth",
                None,
                &quantity("5"),
                &quantity("8"),
            )
            .await
            .unwrap();

        assert_eq!(result.proposed_replicas, 12);
        assert_eq!(result.utilization_milli, 9_000);
    }

    #[tokio::test]
    async fn external_dead_band_holds_replicas() {
        // Same setup but samples sum to 82000m: usage 8200 is inside the
        // tolerance band, so the ready count is proposed unchanged.
        let pods: Vec<Pod> = (0..10).map(|i| ready_pod(&format!("web-{i}"))).collect();
        let mut metrics = MockMetricsClient::new();
        metrics
            .expect_get_external_metric()
            .returning(|_, _, _| Ok((vec![82_000], Utc::now())));

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Average, 0.1);
        let result = calc
            .external_metric_replicas(
                &wma,
                &scale(10),
                "queue_depth",
                None,
                &quantity("5"),
                &quantity("8"),
            )
            .await
            .unwrap();

        assert_eq!(result.proposed_replicas, 10);
        assert_eq!(result.utilization_milli, 8_200);
    }

    #[tokio::test]
    async fn external_absolute_algorithm_skips_averaging() {
        // 7 ready pods, absolute algorithm: sum 60000m compared directly
        // against the 50000m high watermark, 7 * 60000 / 50000 = 8.4 -> 9.
        let pods: Vec<Pod> = (0..7).map(|i| ready_pod(&format!("web-{i}"))).collect();
        let mut metrics = MockMetricsClient::new();
        metrics
            .expect_get_external_metric()
            .returning(|_, _, _| Ok((vec![60_000_000], Utc::now())));

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Absolute, 0.0);
        let result = calc
            .external_metric_replicas(
                &wma,
                &scale(7),
                "queue_depth",
                None,
                &quantity("40000"),
                &quantity("50000"),
            )
            .await
            .unwrap();

        assert_eq!(result.proposed_replicas, 9);
    }

    #[tokio::test]
    async fn external_fetch_error_surfaces_as_metrics_fetch() {
        let pods = vec![ready_pod("web-0")];
        let mut metrics = MockMetricsClient::new();
        metrics.expect_get_external_metric().returning(|_, _, _| {
            Err(Error::internal_with_context("test", "connection refused"))
        });

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Average, 0.1);
        let err = calc
            .external_metric_replicas(
                &wma,
                &scale(1),
                "queue_depth",
                None,
                &quantity("5"),
                &quantity("8"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MetricsFetch { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn external_without_ready_pods_fails_even_for_absolute() {
        // The ready-pod count is resolved before the fetch; its failure
        // aborts the whole evaluation.
        let mut metrics = MockMetricsClient::new();
        metrics.expect_get_external_metric().never();

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(vec![]));
        let wma = autoscaler(ScalingAlgorithm::Absolute, 0.0);
        let err = calc
            .external_metric_replicas(
                &wma,
                &scale(3),
                "queue_depth",
                None,
                &quantity("5"),
                &quantity("8"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPodsMatched { .. }));
    }

    #[tokio::test]
    async fn resource_path_scales_on_status_replicas() {
        // 3 ready pods at 600m each, average: usage 600m sits inside
        // [200m, 800m], so the recorded replica count (5) is held, not the
        // ready-pod count.
        let pods: Vec<Pod> = (0..3).map(|i| ready_pod(&format!("web-{i}"))).collect();
        let mut metrics = MockMetricsClient::new();
        metrics.expect_get_resource_metric().returning(|_, _, _| {
            let samples: HashMap<String, PodSample> = (0..3)
                .map(|i| {
                    (
                        format!("web-{i}"),
                        PodSample {
                            value_milli: 600,
                            timestamp: Utc::now(),
                        },
                    )
                })
                .collect();
            Ok((samples, Utc::now()))
        });

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Average, 0.0);
        let result = calc
            .resource_replicas(
                &wma,
                &scale(5),
                "cpu",
                None,
                &quantity("200m"),
                &quantity("800m"),
            )
            .await
            .unwrap();

        assert_eq!(result.proposed_replicas, 5);
        assert_eq!(result.utilization_milli, 600);
    }

    #[tokio::test]
    async fn resource_path_ignores_unready_pod_samples() {
        // One warming-up pod with a huge sample is ignored; only the two
        // ready pods drive the decision.
        let now = Utc::now();
        let mut warming = ready_pod("web-2");
        warming.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            start_time: Some(Time(now - Duration::seconds(3))),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                last_transition_time: Some(Time(now - Duration::seconds(1))),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let pods = vec![ready_pod("web-0"), ready_pod("web-1"), warming];

        let mut metrics = MockMetricsClient::new();
        metrics.expect_get_resource_metric().returning(|_, _, _| {
            let mut samples = HashMap::new();
            for (name, value) in [("web-0", 400), ("web-1", 400), ("web-2", 90_000)] {
                samples.insert(
                    name.to_string(),
                    PodSample {
                        value_milli: value,
                        timestamp: Utc::now(),
                    },
                );
            }
            Ok((samples, Utc::now()))
        });

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Average, 0.0);
        let result = calc
            .resource_replicas(
                &wma,
                &scale(2),
                "cpu",
                None,
                &quantity("200m"),
                &quantity("800m"),
            )
            .await
            .unwrap();

        // (400 + 400) / 2 = 400m, within the band
        assert_eq!(result.utilization_milli, 400);
        assert_eq!(result.proposed_replicas, 2);
    }

    #[tokio::test]
    async fn resource_path_without_metrics_for_ready_pods_fails() {
        let pods = vec![ready_pod("web-0")];
        let mut metrics = MockMetricsClient::new();
        metrics
            .expect_get_resource_metric()
            .returning(|_, _, _| Ok((HashMap::new(), Utc::now())));

        let calc = ReplicaCalculator::new(Arc::new(metrics), lister_with(pods));
        let wma = autoscaler(ScalingAlgorithm::Average, 0.0);
        let err = calc
            .resource_replicas(
                &wma,
                &scale(1),
                "cpu",
                None,
                &quantity("200m"),
                &quantity("800m"),
            )
            .await
            .unwrap_err();
        // the only pod has no sample, so the ready set is empty
        assert!(matches!(err, Error::NoReadyPods { .. }));
    }

    mod evaluator {
        use super::*;

        fn labels() -> AutoscalerLabels {
            AutoscalerLabels::new("eval", "default", "web", "Deployment")
        }

        #[test]
        fn downscale_floors_at_one_replica() {
            // Usage 100m far below the 5000m low watermark:
            // floor(3 * 100 / 5000) = 0, floored to 1.
            let (proposed, utilization) =
                watermark_replica_count(3, 0.0, &labels(), "m", 100.0, 5_000, 8_000);
            assert_eq!(proposed, 1);
            assert_eq!(utilization, 100);
        }

        #[test]
        fn tolerance_widens_the_band_symmetrically() {
            // t = 0.1 over [5000, 8000]: the band is [4500, 8800].
            let (at_top, _) = watermark_replica_count(10, 0.1, &labels(), "m", 8_800.0, 5_000, 8_000);
            assert_eq!(at_top, 10);
            let (above, _) = watermark_replica_count(10, 0.1, &labels(), "m", 8_801.0, 5_000, 8_000);
            assert_eq!(above, 12);
            let (at_bottom, _) =
                watermark_replica_count(10, 0.1, &labels(), "m", 4_500.0, 5_000, 8_000);
            assert_eq!(at_bottom, 10);
            let (below, _) = watermark_replica_count(10, 0.1, &labels(), "m", 4_499.0, 5_000, 8_000);
            assert_eq!(below, 8);
        }

        #[test]
        fn division_is_by_the_raw_watermark() {
            // Above the band the divisor is H, not H', keeping the
            // post-scale usage strictly inside the band.
            let (proposed, _) =
                watermark_replica_count(10, 0.1, &labels(), "m", 9_000.0, 5_000, 8_000);
            assert_eq!(proposed, 12); // ceil(10 * 9000 / 8000), not / 8800
        }
    }
}
