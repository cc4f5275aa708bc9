//! Decision engine and reconciliation driver for the WatermarkAutoscaler.
//!
//! The pipeline per reconciliation:
//! policy + current scale → aggregator → (per metric: calculator →
//! watermark evaluator) → proposal → normalizer → cooldown gate →
//! {enact | skip} → status update.

#![deny(missing_docs)]

pub mod calculator;
pub mod controller;
pub mod cooldown;
pub mod metrics_client;
pub mod normalizer;
pub mod pods;
pub mod scale;

pub use controller::{error_policy, reconcile, Context};
