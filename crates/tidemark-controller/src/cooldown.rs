//! Cooldown gating.
//!
//! Blocks enactment inside the per-direction forbidden windows relative to
//! the last successful scale, and publishes the remaining countdowns.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use tidemark_common::metrics::{set_transition_countdown, AutoscalerLabels, Transition};

/// Cooldown state reported alongside the gating decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownStatus {
    /// Both directions are open
    ReadyForScale,
    /// Only upscales are still inside the forbidden window
    BackoffUpscale,
    /// Only downscales are still inside the forbidden window
    BackoffDownscale,
    /// Both directions are still inside their forbidden windows
    BackoffBoth,
}

/// Whether the proposal may be enacted now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScaleDecision {
    /// True when the scale write may happen
    pub allowed: bool,
    /// Cooldown state driving the `AbleToScale` condition
    pub status: CooldownStatus,
}

/// Decide whether the proposal may be enacted at `timestamp`.
///
/// A policy that never scaled has no window to respect. Otherwise each
/// direction is blocked until its forbidden window since the last scale has
/// elapsed, and a proposal equal to the current count never scales.
pub fn should_scale(
    labels: &AutoscalerLabels,
    last_scale_time: Option<DateTime<Utc>>,
    upscale_window: Duration,
    downscale_window: Duration,
    current_replicas: i32,
    desired_replicas: i32,
    timestamp: DateTime<Utc>,
) -> ScaleDecision {
    let Some(last_scale) = last_scale_time else {
        info!("No timestamp for the last scale event");
        return ScaleDecision {
            allowed: true,
            status: CooldownStatus::ReadyForScale,
        };
    };

    let downscale_countdown = seconds_until(last_scale + downscale_window, timestamp);
    let backoff_down = downscale_countdown > 0.0;
    set_transition_countdown(
        labels,
        Transition::Downscale,
        downscale_countdown.max(0.0),
    );
    if backoff_down {
        info!(
            last_scale = %last_scale,
            next_downscale = %(last_scale + downscale_window),
            "Too early to downscale"
        );
    }

    let upscale_countdown = seconds_until(last_scale + upscale_window, timestamp);
    let backoff_up = upscale_countdown > 0.0;
    set_transition_countdown(labels, Transition::Upscale, upscale_countdown.max(0.0));
    if backoff_up {
        info!(
            last_scale = %last_scale,
            next_upscale = %(last_scale + upscale_window),
            "Too early to upscale"
        );
    }

    let status = match (backoff_up, backoff_down) {
        (true, true) => CooldownStatus::BackoffBoth,
        (true, false) => CooldownStatus::BackoffUpscale,
        (false, true) => CooldownStatus::BackoffDownscale,
        (false, false) => CooldownStatus::ReadyForScale,
    };
    let allowed = can_scale(backoff_up, backoff_down, current_replicas, desired_replicas);
    ScaleDecision { allowed, status }
}

/// A proposal equal to the current count never scales; otherwise the
/// matching direction must be out of its forbidden window.
fn can_scale(backoff_up: bool, backoff_down: bool, current: i32, desired: i32) -> bool {
    if desired == current {
        info!("Will not scale: number of replicas has not changed");
        return false;
    }
    (!backoff_up && desired > current) || (!backoff_down && desired < current)
}

fn seconds_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (deadline - now).num_milliseconds() as f64 / 1_000.0
}
