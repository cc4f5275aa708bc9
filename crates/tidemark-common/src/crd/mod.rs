//! Custom Resource Definitions for Tidemark

mod autoscaler;
pub mod quantity;
mod types;

pub use autoscaler::{
    WatermarkAutoscaler, WatermarkAutoscalerSpec, WatermarkAutoscalerStatus,
    DEFAULT_DOWNSCALE_FORBIDDEN_WINDOW_SECONDS, DEFAULT_MIN_REPLICAS,
    DEFAULT_READINESS_DELAY_SECONDS, DEFAULT_SCALE_DOWN_LIMIT_FACTOR,
    DEFAULT_SCALE_UP_LIMIT_FACTOR, DEFAULT_TOLERANCE, DEFAULT_UPSCALE_FORBIDDEN_WINDOW_SECONDS,
};
pub use types::{
    selector_to_query, set_condition, Condition, ConditionStatus, ConditionType, MetricSourceType,
    MetricSpec, MetricStatus, ScaleTargetRef, ScalingAlgorithm,
};
