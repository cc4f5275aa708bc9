//! Prometheus gauges describing every autoscaler decision.
//!
//! All per-policy series are labeled with the autoscaler identity and must
//! be deleted when a metric spec disappears, a fetch fails, or the object
//! is removed. Stale series would otherwise keep reporting the last
//! computed value forever, so label cleanup is part of the error paths,
//! not an afterthought.
//!
//! Values tracking metric usage and watermarks are expressed in milli-units
//! to match the decision engine's fixed-point arithmetic.

use once_cell::sync::Lazy;
use prometheus::{GaugeVec, Opts, Registry};

/// Metric namespace every gauge is registered under
const NAMESPACE: &str = "tidemark_controller";

/// Label carrying the autoscaler name
pub const WPA_NAME_LABEL: &str = "wpa_name";
/// Label carrying the namespace of the scale target
pub const RESOURCE_NAMESPACE_LABEL: &str = "resource_namespace";
/// Label carrying the name of the scale target
pub const RESOURCE_NAME_LABEL: &str = "resource_name";
/// Label carrying the kind of the scale target
pub const RESOURCE_KIND_LABEL: &str = "resource_kind";
/// Label carrying the metric name on per-metric series
pub const METRIC_NAME_LABEL: &str = "metric_name";
/// Label carrying the restriction reason on `restricted_scaling`
pub const REASON_LABEL: &str = "reason";
/// Label carrying the scale direction on `transition_countdown`
pub const TRANSITION_LABEL: &str = "transition";

const BASE_LABELS: &[&str] = &[
    WPA_NAME_LABEL,
    RESOURCE_NAMESPACE_LABEL,
    RESOURCE_NAME_LABEL,
    RESOURCE_KIND_LABEL,
];
const METRIC_LABELS: &[&str] = &[
    WPA_NAME_LABEL,
    RESOURCE_NAMESPACE_LABEL,
    RESOURCE_NAME_LABEL,
    RESOURCE_KIND_LABEL,
    METRIC_NAME_LABEL,
];
const REASON_LABELS: &[&str] = &[
    WPA_NAME_LABEL,
    RESOURCE_NAMESPACE_LABEL,
    RESOURCE_NAME_LABEL,
    RESOURCE_KIND_LABEL,
    REASON_LABEL,
];
const TRANSITION_LABELS: &[&str] = &[
    WPA_NAME_LABEL,
    RESOURCE_NAMESPACE_LABEL,
    RESOURCE_NAME_LABEL,
    RESOURCE_KIND_LABEL,
    TRANSITION_LABEL,
];

/// Registry holding every Tidemark gauge, gathered by the /metrics endpoint
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static VALUE: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "value",
        "Observed usage scalar in milli-units",
        METRIC_LABELS,
    )
});
static LOW_WATERMARK: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "low_watermark",
        "Low watermark in milli-units",
        METRIC_LABELS,
    )
});
static HIGH_WATERMARK: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "high_watermark",
        "High watermark in milli-units",
        METRIC_LABELS,
    )
});
static REPLICA_PROPOSAL: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "replica_proposal",
        "Replica count proposed by the watermark evaluator",
        BASE_LABELS,
    )
});
static REPLICA_MIN: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "replica_min",
        "Lower replica bound from the autoscaler spec",
        BASE_LABELS,
    )
});
static REPLICA_MAX: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "replica_max",
        "Upper replica bound from the autoscaler spec",
        BASE_LABELS,
    )
});
static REPLICA_EFFECTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "replica_effective",
        "Replica count the reconciliation settled on",
        BASE_LABELS,
    )
});
static TRANSITION_COUNTDOWN: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "transition_countdown",
        "Seconds until the forbidden window for a direction reopens",
        TRANSITION_LABELS,
    )
});
static RESTRICTED_SCALING: Lazy<GaugeVec> = Lazy::new(|| {
    gauge_vec(
        "restricted_scaling",
        "Whether the decision was restricted for the labeled reason",
        REASON_LABELS,
    )
});

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .expect("static gauge definition is valid");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("static gauge is registered exactly once");
    gauge
}

/// Identity of an autoscaler, used as the label set on every series
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoscalerLabels {
    /// Autoscaler object name
    pub wpa_name: String,
    /// Namespace of the scale target
    pub resource_namespace: String,
    /// Name of the scale target
    pub resource_name: String,
    /// Kind of the scale target
    pub resource_kind: String,
}

impl AutoscalerLabels {
    /// Build the label set for an autoscaler and its target
    pub fn new(
        wpa_name: impl Into<String>,
        namespace: impl Into<String>,
        target_name: impl Into<String>,
        target_kind: impl Into<String>,
    ) -> Self {
        Self {
            wpa_name: wpa_name.into(),
            resource_namespace: namespace.into(),
            resource_name: target_name.into(),
            resource_kind: target_kind.into(),
        }
    }

    fn base(&self) -> [&str; 4] {
        [
            &self.wpa_name,
            &self.resource_namespace,
            &self.resource_name,
            &self.resource_kind,
        ]
    }

    fn with_metric<'a>(&'a self, metric_name: &'a str) -> [&'a str; 5] {
        [
            &self.wpa_name,
            &self.resource_namespace,
            &self.resource_name,
            &self.resource_kind,
            metric_name,
        ]
    }
}

/// Restriction reasons reported on the `restricted_scaling` gauge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestrictionReason {
    /// Usage sits inside the tolerance-adjusted watermark band
    WithinBounds,
    /// The upscale rate limit capped the proposal
    UpscaleCapping,
    /// The downscale rate limit capped the proposal
    DownscaleCapping,
}

impl RestrictionReason {
    /// Label value for this reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WithinBounds => "within_bounds",
            Self::UpscaleCapping => "upscale_capping",
            Self::DownscaleCapping => "downscale_capping",
        }
    }

    const ALL: [RestrictionReason; 3] = [
        Self::WithinBounds,
        Self::UpscaleCapping,
        Self::DownscaleCapping,
    ];
}

/// Scale directions reported on the `transition_countdown` gauge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Growing the workload
    Upscale,
    /// Shrinking the workload
    Downscale,
}

impl Transition {
    /// Label value for this direction
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upscale => "upscale",
            Self::Downscale => "downscale",
        }
    }

    const ALL: [Transition; 2] = [Self::Upscale, Self::Downscale];
}

/// Record the observed usage for a metric, in milli-units
pub fn set_usage(labels: &AutoscalerLabels, metric_name: &str, usage_milli: f64) {
    VALUE
        .with_label_values(&labels.with_metric(metric_name))
        .set(usage_milli);
}

/// Record the watermark band for a metric, in milli-units
pub fn set_watermarks(
    labels: &AutoscalerLabels,
    metric_name: &str,
    low_milli: i64,
    high_milli: i64,
) {
    LOW_WATERMARK
        .with_label_values(&labels.with_metric(metric_name))
        .set(low_milli as f64);
    HIGH_WATERMARK
        .with_label_values(&labels.with_metric(metric_name))
        .set(high_milli as f64);
}

/// Record the pre-normalization replica proposal
pub fn set_replica_proposal(labels: &AutoscalerLabels, replicas: i32) {
    REPLICA_PROPOSAL
        .with_label_values(&labels.base())
        .set(replicas as f64);
}

/// Record the replica bounds from the spec
pub fn set_replica_bounds(labels: &AutoscalerLabels, min: i32, max: i32) {
    REPLICA_MIN.with_label_values(&labels.base()).set(min as f64);
    REPLICA_MAX.with_label_values(&labels.base()).set(max as f64);
}

/// Record the replica count the reconciliation settled on
pub fn set_replica_effective(labels: &AutoscalerLabels, replicas: i32) {
    REPLICA_EFFECTIVE
        .with_label_values(&labels.base())
        .set(replicas as f64);
}

/// Record the seconds left in a direction's forbidden window (0 when open)
pub fn set_transition_countdown(labels: &AutoscalerLabels, transition: Transition, seconds: f64) {
    let mut values = labels.base().to_vec();
    values.push(transition.as_str());
    TRANSITION_COUNTDOWN.with_label_values(&values).set(seconds);
}

/// Record whether scaling is currently restricted for the given reason
pub fn set_restricted_scaling(labels: &AutoscalerLabels, reason: RestrictionReason, active: bool) {
    let mut values = labels.base().to_vec();
    values.push(reason.as_str());
    RESTRICTED_SCALING
        .with_label_values(&values)
        .set(if active { 1.0 } else { 0.0 });
}

/// Drop the series tied to a single metric spec.
///
/// Called when a fetch fails or the spec disappears, so no stale usage or
/// watermark samples survive.
pub fn clear_metric_series(labels: &AutoscalerLabels, metric_name: &str) {
    let with_metric = labels.with_metric(metric_name);
    let _ = VALUE.remove_label_values(&with_metric);
    let _ = LOW_WATERMARK.remove_label_values(&with_metric);
    let _ = HIGH_WATERMARK.remove_label_values(&with_metric);
    for reason in RestrictionReason::ALL {
        let mut values = labels.base().to_vec();
        values.push(reason.as_str());
        let _ = RESTRICTED_SCALING.remove_label_values(&values);
    }
}

/// Drop the pre-normalization proposal series
pub fn clear_replica_proposal(labels: &AutoscalerLabels) {
    let _ = REPLICA_PROPOSAL.remove_label_values(&labels.base());
}

/// Drop every series tied to an autoscaler.
///
/// Called from the deletion finalizer with the metric names the spec
/// declared.
pub fn clear_autoscaler_series<'a>(
    labels: &AutoscalerLabels,
    metric_names: impl IntoIterator<Item = &'a str>,
) {
    for metric_name in metric_names {
        clear_metric_series(labels, metric_name);
    }
    let base = labels.base();
    let _ = REPLICA_PROPOSAL.remove_label_values(&base);
    let _ = REPLICA_MIN.remove_label_values(&base);
    let _ = REPLICA_MAX.remove_label_values(&base);
    let _ = REPLICA_EFFECTIVE.remove_label_values(&base);
    for transition in Transition::ALL {
        let mut values = base.to_vec();
        values.push(transition.as_str());
        let _ = TRANSITION_COUNTDOWN.remove_label_values(&values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(name: &str) -> AutoscalerLabels {
        AutoscalerLabels::new(name, "default", "web", "Deployment")
    }

    // The registry is process-wide and tests run in parallel, so counts are
    // scoped to the autoscaler name owned by each test.
    fn series_count_for(wpa_name: &str) -> usize {
        REGISTRY
            .gather()
            .iter()
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .filter(|metric| {
                        metric.get_label().iter().any(|label| {
                            label.get_name() == WPA_NAME_LABEL && label.get_value() == wpa_name
                        })
                    })
                    .count()
            })
            .sum()
    }

    #[test]
    fn set_and_clear_metric_series() {
        let labels = labels("wma-metric-series");

        set_usage(&labels, "queue_depth", 9_000.0);
        set_watermarks(&labels, "queue_depth", 5_000, 8_000);
        set_restricted_scaling(&labels, RestrictionReason::WithinBounds, false);
        assert!(series_count_for("wma-metric-series") > 0);

        clear_metric_series(&labels, "queue_depth");
        assert_eq!(series_count_for("wma-metric-series"), 0);
    }

    #[test]
    fn clear_autoscaler_series_removes_everything() {
        let labels = labels("wma-full-cleanup");

        set_usage(&labels, "cpu", 600.0);
        set_watermarks(&labels, "cpu", 200, 800);
        set_replica_proposal(&labels, 4);
        set_replica_bounds(&labels, 1, 10);
        set_replica_effective(&labels, 4);
        set_transition_countdown(&labels, Transition::Downscale, 42.0);
        set_restricted_scaling(&labels, RestrictionReason::DownscaleCapping, true);
        assert!(series_count_for("wma-full-cleanup") > 0);

        clear_autoscaler_series(&labels, ["cpu"]);
        assert_eq!(series_count_for("wma-full-cleanup"), 0);
    }

    #[test]
    fn reason_and_transition_label_values() {
        assert_eq!(RestrictionReason::WithinBounds.as_str(), "within_bounds");
        assert_eq!(RestrictionReason::UpscaleCapping.as_str(), "upscale_capping");
        assert_eq!(
            RestrictionReason::DownscaleCapping.as_str(),
            "downscale_capping"
        );
        assert_eq!(Transition::Upscale.as_str(), "upscale");
        assert_eq!(Transition::Downscale.as_str(), "downscale");
    }
}
