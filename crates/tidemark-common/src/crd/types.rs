//! Supporting types for the WatermarkAutoscaler CRD

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Reference to the workload whose scale subresource is manipulated
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// API version of the target (e.g., "apps/v1")
    pub api_version: String,

    /// Kind of the target (e.g., "Deployment")
    pub kind: String,

    /// Name of the target
    pub name: String,
}

/// Scaling algorithm: whether the aggregated metric value is divided by the
/// ready-pod count before watermark comparison
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingAlgorithm {
    /// Divide the aggregated value by the number of ready pods
    #[default]
    Average,
    /// Compare the aggregated value directly against the watermarks
    Absolute,
}

impl std::fmt::Display for ScalingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Average => write!(f, "average"),
            Self::Absolute => write!(f, "absolute"),
        }
    }
}

/// A single metric source driving the autoscaler.
///
/// External metrics are workload-wide values served by an external metrics
/// provider; resource metrics are per-pod usage aggregates served by the
/// resource metrics service.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "type")]
pub enum MetricSpec {
    /// Workload-wide metric from the external metrics service
    #[serde(rename_all = "camelCase")]
    External {
        /// Name of the external metric
        metric_name: String,

        /// Label selector restricting the metric series
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metric_selector: Option<LabelSelector>,

        /// Low watermark; usage below it proposes a downscale
        #[serde(default, skip_serializing_if = "Option::is_none")]
        low_watermark: Option<Quantity>,

        /// High watermark; usage above it proposes an upscale
        #[serde(default, skip_serializing_if = "Option::is_none")]
        high_watermark: Option<Quantity>,
    },

    /// Per-pod resource usage from the resource metrics service
    #[serde(rename_all = "camelCase")]
    Resource {
        /// Resource name (e.g., "cpu")
        name: String,

        /// Label selector restricting the pods considered
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metric_selector: Option<LabelSelector>,

        /// Low watermark; usage below it proposes a downscale
        #[serde(default, skip_serializing_if = "Option::is_none")]
        low_watermark: Option<Quantity>,

        /// High watermark; usage above it proposes an upscale
        #[serde(default, skip_serializing_if = "Option::is_none")]
        high_watermark: Option<Quantity>,
    },
}

impl MetricSpec {
    /// Metric or resource name of this spec
    pub fn metric_name(&self) -> &str {
        match self {
            Self::External { metric_name, .. } => metric_name,
            Self::Resource { name, .. } => name,
        }
    }

    /// Low and high watermarks, when both are present
    pub fn watermarks(&self) -> (Option<&Quantity>, Option<&Quantity>) {
        match self {
            Self::External {
                low_watermark,
                high_watermark,
                ..
            }
            | Self::Resource {
                low_watermark,
                high_watermark,
                ..
            } => (low_watermark.as_ref(), high_watermark.as_ref()),
        }
    }

    /// Source type of this spec
    pub fn source_type(&self) -> MetricSourceType {
        match self {
            Self::External { .. } => MetricSourceType::External,
            Self::Resource { .. } => MetricSourceType::Resource,
        }
    }
}

/// Kind of metric source, as reported in status
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MetricSourceType {
    /// From the external metrics service
    External,
    /// From the resource metrics service
    Resource,
}

/// Observed state of a single metric, recorded in status for every spec
/// that was successfully evaluated
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricStatus {
    /// Source type of the metric
    #[serde(rename = "type")]
    pub type_: MetricSourceType,

    /// Metric or resource name
    pub name: String,

    /// Usage scalar observed during the last evaluation
    pub current_value: Quantity,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition types reported by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// Whether the controller may enact a scale right now
    AbleToScale,
    /// Whether metrics could be fetched and a proposal computed
    ScalingActive,
    /// Whether the proposal was clamped by min/max or rate limits
    ScalingLimited,
    /// Whether dry-run mode is inhibiting enactment
    DryRun,
}

impl ConditionType {
    /// Condition type string as persisted in status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbleToScale => "AbleToScale",
            Self::ScalingActive => "ScalingActive",
            Self::ScalingLimited => "ScalingLimited",
            Self::DryRun => "DryRun",
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (AbleToScale, ScalingActive, ScalingLimited, DryRun)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition's status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

/// Set a condition in the list, keeping at most one entry per type.
///
/// `lastTransitionTime` is touched only when the status actually changes,
/// so repeated reconciliations with a stable outcome keep stable timestamps.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_.as_str()) {
        if existing.status != status {
            existing.last_transition_time = Utc::now();
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message;
        return;
    }
    conditions.push(Condition {
        type_: type_.as_str().to_string(),
        status,
        reason: reason.to_string(),
        message,
        last_transition_time: Utc::now(),
    });
}

/// Render a label selector as the query string accepted by the metrics
/// services (`k=v,k2 in (a,b),!k3`).
pub fn selector_to_query(selector: Option<&LabelSelector>) -> Result<String, Error> {
    let Some(selector) = selector else {
        return Ok(String::new());
    };

    let mut parts = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (k, v) in labels {
            parts.push(format!("{k}={v}"));
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let values = || expr.values.clone().unwrap_or_default().join(",");
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expr.key, values())),
                "NotIn" => parts.push(format!("{} notin ({})", expr.key, values())),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                op => {
                    return Err(Error::validation(format!(
                        "unsupported selector operator {op:?} for key {}",
                        expr.key
                    )))
                }
            }
        }
    }
    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn metric_spec_accessors() {
        let spec = MetricSpec::External {
            metric_name: "queue_depth".to_string(),
            metric_selector: None,
            low_watermark: Some(Quantity("5".to_string())),
            high_watermark: Some(Quantity("8".to_string())),
        };
        assert_eq!(spec.metric_name(), "queue_depth");
        assert_eq!(spec.source_type(), MetricSourceType::External);
        let (low, high) = spec.watermarks();
        assert_eq!(low.unwrap().0, "5");
        assert_eq!(high.unwrap().0, "8");
    }

    #[test]
    fn metric_spec_serde_uses_type_tag() {
        let spec = MetricSpec::Resource {
            name: "cpu".to_string(),
            metric_selector: None,
            low_watermark: Some(Quantity("200m".to_string())),
            high_watermark: Some(Quantity("800m".to_string())),
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""type":"Resource""#));
        assert!(json.contains(r#""lowWatermark":"200m""#));
        let parsed: MetricSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }

    #[test]
    fn metric_spec_tolerates_missing_watermarks() {
        let json = r#"{"type":"External","metricName":"rps"}"#;
        let parsed: MetricSpec = serde_json::from_str(json).unwrap();
        let (low, high) = parsed.watermarks();
        assert!(low.is_none());
        assert!(high.is_none());
    }

    #[test]
    fn set_condition_keeps_one_entry_per_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ConditionType::AbleToScale,
            ConditionStatus::True,
            "ReadyForScale",
            "ok",
        );
        set_condition(
            &mut conditions,
            ConditionType::AbleToScale,
            ConditionStatus::False,
            "BackoffUpscale",
            "too soon",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "BackoffUpscale");
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn set_condition_preserves_transition_time_when_status_stable() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ConditionType::ScalingActive,
            ConditionStatus::True,
            "ValidMetricFound",
            "first",
        );
        let first_transition = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            ConditionType::ScalingActive,
            ConditionStatus::True,
            "ValidMetricFound",
            "second pass, same status",
        );
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message, "second pass, same status");

        set_condition(
            &mut conditions,
            ConditionType::ScalingActive,
            ConditionStatus::False,
            "FailedGetExternalMetric",
            "flipped",
        );
        assert!(conditions[0].last_transition_time >= first_transition);
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn selector_query_from_match_labels_and_expressions() {
        assert_eq!(selector_to_query(None).unwrap(), "");

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        let selector = LabelSelector {
            match_labels: Some(labels),
            match_expressions: Some(vec![
                k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["a".to_string(), "b".to_string()]),
                },
            ]),
        };
        assert_eq!(
            selector_to_query(Some(&selector)).unwrap(),
            "app=web,tier in (a,b)"
        );
    }
}
