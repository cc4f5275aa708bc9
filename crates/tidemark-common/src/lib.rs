//! Common types for Tidemark: the WatermarkAutoscaler CRD, errors, events
//! and observability.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for server-side apply patches
pub const FIELD_MANAGER: &str = "tidemark-controller";

/// Finalizer added to WatermarkAutoscaler objects so per-policy metric
/// series can be removed before the object disappears
pub const CLEANUP_FINALIZER: &str = "wma.tidemark.dev/cleanup";

/// Default interval between two reconciliations of the same autoscaler
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 15;

/// Requeue delay after a transient reconciliation error
pub const ERROR_RETRY_DELAY_SECS: u64 = 1;
