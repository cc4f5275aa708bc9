//! WatermarkAutoscaler Custom Resource Definition
//!
//! A WatermarkAutoscaler drives the replica count of a target workload
//! toward keeping an observed metric between a low and a high watermark,
//! with rate limits on growth/shrinkage and per-direction cooldown windows.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::quantity::milli_value;
use super::types::{Condition, MetricSpec, MetricStatus, ScaleTargetRef, ScalingAlgorithm};
use crate::error::Error;

/// Lower replica bound applied when `minReplicas` is unset
pub const DEFAULT_MIN_REPLICAS: i32 = 1;
/// Fractional dead band applied around each watermark
pub const DEFAULT_TOLERANCE: f64 = 0.1;
/// Percentage of current replicas a single step may add
pub const DEFAULT_SCALE_UP_LIMIT_FACTOR: f64 = 50.0;
/// Percentage of current replicas a single step may remove
pub const DEFAULT_SCALE_DOWN_LIMIT_FACTOR: f64 = 20.0;
/// Cooldown after any scale before another upscale
pub const DEFAULT_UPSCALE_FORBIDDEN_WINDOW_SECONDS: i32 = 60;
/// Cooldown after any scale before another downscale
pub const DEFAULT_DOWNSCALE_FORBIDDEN_WINDOW_SECONDS: i32 = 300;
/// Grace period for pods still warming up
pub const DEFAULT_READINESS_DELAY_SECONDS: i32 = 10;

/// Specification for a WatermarkAutoscaler
///
/// Optional fields left unset by the user are filled in by the controller's
/// defaulting pass and persisted, so what is running is always visible in
/// the spec.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tidemark.dev",
    version = "v1alpha1",
    kind = "WatermarkAutoscaler",
    plural = "watermarkautoscalers",
    shortname = "wma",
    status = "WatermarkAutoscalerStatus",
    namespaced,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.scaleTargetRef.name"}"#,
    printcolumn = r#"{"name":"Min","type":"integer","jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Max","type":"integer","jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkAutoscalerSpec {
    /// The workload whose scale subresource is manipulated
    pub scale_target_ref: ScaleTargetRef,

    /// Lower bound on the desired replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound on the desired replica count
    pub max_replicas: i32,

    /// Whether the aggregated metric is divided by the ready-pod count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<ScalingAlgorithm>,

    /// Fractional dead band around each watermark, within [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,

    /// Percentage of current replicas bounding one step's growth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_limit_factor: Option<f64>,

    /// Percentage of current replicas bounding one step's shrinkage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_limit_factor: Option<f64>,

    /// Seconds after a scale during which upscales are forbidden
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscale_forbidden_window_seconds: Option<i32>,

    /// Seconds after a scale during which downscales are forbidden
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downscale_forbidden_window_seconds: Option<i32>,

    /// Grace period for pods still warming up (image pull included)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_delay_seconds: Option<i32>,

    /// Compute and publish decisions without enacting them
    #[serde(default)]
    pub dry_run: bool,

    /// Metric sources; the spec demanding the most replicas wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

impl WatermarkAutoscalerSpec {
    /// Whether every defaultable field has been filled in
    pub fn is_defaulted(&self) -> bool {
        self.min_replicas.is_some()
            && self.algorithm.is_some()
            && self.tolerance.is_some()
            && self.scale_up_limit_factor.is_some()
            && self.scale_down_limit_factor.is_some()
            && self.upscale_forbidden_window_seconds.is_some()
            && self.downscale_forbidden_window_seconds.is_some()
            && self.readiness_delay_seconds.is_some()
    }

    /// Copy of this spec with every unset defaultable field filled in
    pub fn with_defaults(&self) -> Self {
        Self {
            min_replicas: Some(self.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS)),
            algorithm: Some(self.algorithm.unwrap_or_default()),
            tolerance: Some(self.tolerance.unwrap_or(DEFAULT_TOLERANCE)),
            scale_up_limit_factor: Some(
                self.scale_up_limit_factor
                    .unwrap_or(DEFAULT_SCALE_UP_LIMIT_FACTOR),
            ),
            scale_down_limit_factor: Some(
                self.scale_down_limit_factor
                    .unwrap_or(DEFAULT_SCALE_DOWN_LIMIT_FACTOR),
            ),
            upscale_forbidden_window_seconds: Some(
                self.upscale_forbidden_window_seconds
                    .unwrap_or(DEFAULT_UPSCALE_FORBIDDEN_WINDOW_SECONDS),
            ),
            downscale_forbidden_window_seconds: Some(
                self.downscale_forbidden_window_seconds
                    .unwrap_or(DEFAULT_DOWNSCALE_FORBIDDEN_WINDOW_SECONDS),
            ),
            readiness_delay_seconds: Some(
                self.readiness_delay_seconds
                    .unwrap_or(DEFAULT_READINESS_DELAY_SECONDS),
            ),
            ..self.clone()
        }
    }

    /// Effective minimum replica count
    pub fn min_replicas(&self) -> i32 {
        self.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS)
    }

    /// Effective scaling algorithm
    pub fn algorithm(&self) -> ScalingAlgorithm {
        self.algorithm.unwrap_or_default()
    }

    /// Effective tolerance
    pub fn tolerance(&self) -> f64 {
        self.tolerance.unwrap_or(DEFAULT_TOLERANCE)
    }

    /// Effective upscale rate-limit factor (percent)
    pub fn scale_up_limit_factor(&self) -> f64 {
        self.scale_up_limit_factor
            .unwrap_or(DEFAULT_SCALE_UP_LIMIT_FACTOR)
    }

    /// Effective downscale rate-limit factor (percent)
    pub fn scale_down_limit_factor(&self) -> f64 {
        self.scale_down_limit_factor
            .unwrap_or(DEFAULT_SCALE_DOWN_LIMIT_FACTOR)
    }

    /// Effective upscale forbidden window
    pub fn upscale_forbidden_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.upscale_forbidden_window_seconds
                .unwrap_or(DEFAULT_UPSCALE_FORBIDDEN_WINDOW_SECONDS) as i64,
        )
    }

    /// Effective downscale forbidden window
    pub fn downscale_forbidden_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.downscale_forbidden_window_seconds
                .unwrap_or(DEFAULT_DOWNSCALE_FORBIDDEN_WINDOW_SECONDS) as i64,
        )
    }

    /// Effective readiness grace period
    pub fn readiness_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.readiness_delay_seconds
                .unwrap_or(DEFAULT_READINESS_DELAY_SECONDS) as i64,
        )
    }

    /// Validate the autoscaler specification
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if self.scale_target_ref.name.is_empty() || self.scale_target_ref.kind.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.scaleTargetRef",
                "kind and name are required",
            ));
        }
        if self.max_replicas < 1 {
            return Err(Error::validation_for_field(
                name,
                "spec.maxReplicas",
                "must be at least 1",
            ));
        }
        if let Some(min) = self.min_replicas {
            if min < 0 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.minReplicas",
                    "must be non-negative",
                ));
            }
            if min > self.max_replicas {
                return Err(Error::validation_for_field(
                    name,
                    "spec.minReplicas",
                    "must not exceed maxReplicas",
                ));
            }
        }
        if let Some(tolerance) = self.tolerance {
            if !(0.0..=1.0).contains(&tolerance) {
                return Err(Error::validation_for_field(
                    name,
                    "spec.tolerance",
                    "must be within [0, 1]",
                ));
            }
        }
        for (field, factor) in [
            ("spec.scaleUpLimitFactor", self.scale_up_limit_factor),
            ("spec.scaleDownLimitFactor", self.scale_down_limit_factor),
        ] {
            if let Some(factor) = factor {
                if !(factor > 0.0 && factor <= 100.0) {
                    return Err(Error::validation_for_field(
                        name,
                        field,
                        "must be within (0, 100]",
                    ));
                }
            }
        }
        for (field, window) in [
            (
                "spec.upscaleForbiddenWindowSeconds",
                self.upscale_forbidden_window_seconds,
            ),
            (
                "spec.downscaleForbiddenWindowSeconds",
                self.downscale_forbidden_window_seconds,
            ),
            ("spec.readinessDelaySeconds", self.readiness_delay_seconds),
        ] {
            if window.is_some_and(|w| w < 0) {
                return Err(Error::validation_for_field(name, field, "must be non-negative"));
            }
        }
        if self.metrics.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.metrics",
                "at least one metric is required",
            ));
        }
        for metric in &self.metrics {
            let (low, high) = metric.watermarks();
            let (Some(low), Some(high)) = (low, high) else {
                return Err(Error::validation_for_field(
                    name,
                    "spec.metrics",
                    format!(
                        "metric {:?}: the high watermark and the low watermark are required",
                        metric.metric_name()
                    ),
                ));
            };
            let low = milli_value(low)?;
            let high = milli_value(high)?;
            if low > high {
                return Err(Error::validation_for_field(
                    name,
                    "spec.metrics",
                    format!(
                        "metric {:?}: the low watermark must not exceed the high watermark",
                        metric.metric_name()
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Status for a WatermarkAutoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkAutoscalerStatus {
    /// Replica count of the target observed during the last reconciliation
    #[serde(default)]
    pub current_replicas: i32,

    /// Replica count the controller decided on
    #[serde(default)]
    pub desired_replicas: i32,

    /// Last observed state of each metric spec
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_metrics: Vec<MetricStatus>,

    /// When the controller last wrote a new replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,

    /// Conditions representing the autoscaler state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
