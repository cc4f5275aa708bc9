//! Error types for the Tidemark controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like the autoscaler name,
//! the metric involved, and the underlying cause.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Tidemark operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for an autoscaler spec
    #[error("validation error for {autoscaler}: {message}")]
    Validation {
        /// Name of the autoscaler with the invalid configuration
        autoscaler: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.maxReplicas")
        field: Option<String>,
    },

    /// Failure fetching samples from a metrics service
    #[error("unable to get metric {metric} for {autoscaler}: {message}")]
    MetricsFetch {
        /// Name of the autoscaler the fetch was made for
        autoscaler: String,
        /// Metric name that could not be fetched
        metric: String,
        /// Description of what failed
        message: String,
    },

    /// The selector matched pods but none of them is ready
    #[error("among the {pod_count} pods matching {selector}, none is ready")]
    NoReadyPods {
        /// Selector used to list the pods
        selector: String,
        /// Number of pods the selector matched
        pod_count: usize,
    },

    /// The selector matched no pods at all
    #[error("no pods returned by selector {selector} while calculating replica count")]
    NoPodsMatched {
        /// Selector used to list the pods
        selector: String,
    },

    /// Metric samples were received, but not for any ready pod
    #[error("did not receive metrics for any ready pods")]
    NoMetricsForReadyPods,

    /// The scale subresource of the target could not be resolved
    #[error("unable to resolve scale for {kind}: {message}")]
    ScaleResolution {
        /// Kind of the scale target
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// The scale target does not exist in any candidate mapping
    #[error("scale target {kind}/{name} not found")]
    TargetNotFound {
        /// Kind of the scale target
        kind: String,
        /// Name of the scale target
        name: String,
    },

    /// A quantity string could not be parsed into milli-units
    #[error("invalid quantity {value:?}: {message}")]
    Quantity {
        /// The offending quantity string
        value: String,
        /// Description of what's wrong with it
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "finalizer")
        context: String,
    },
}

impl Error {
    /// Create a validation error without autoscaler context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            autoscaler: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with autoscaler context
    pub fn validation_for(autoscaler: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            autoscaler: autoscaler.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with autoscaler context and field path
    pub fn validation_for_field(
        autoscaler: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            autoscaler: autoscaler.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a metrics fetch error
    pub fn metrics_fetch(
        autoscaler: impl Into<String>,
        metric: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::MetricsFetch {
            autoscaler: autoscaler.into(),
            metric: metric.into(),
            message: msg.into(),
        }
    }

    /// Create a scale resolution error
    pub fn scale_resolution(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ScaleResolution {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a quantity parse error
    pub fn quantity(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Quantity {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and quantity errors are not retryable (require a spec fix).
    /// Metric fetches and pod readiness are expected to recover on their own.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::MetricsFetch { .. } => true,
            Error::NoReadyPods { .. } => true,
            Error::NoPodsMatched { .. } => true,
            Error::NoMetricsForReadyPods => true,
            Error::ScaleResolution { .. } => true,
            // the policy may be reassociated later on spec change
            Error::TargetNotFound { .. } => false,
            Error::Quantity { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the autoscaler name if this error is associated with one
    pub fn autoscaler(&self) -> Option<&str> {
        match self {
            Error::Validation { autoscaler, .. } => Some(autoscaler),
            Error::MetricsFetch { autoscaler, .. } => Some(autoscaler),
            _ => None,
        }
    }
}
