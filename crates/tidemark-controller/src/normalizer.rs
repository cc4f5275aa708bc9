//! Proposal normalization.
//!
//! Clamps the evaluator's proposal by the absolute min/max bounds and by
//! the per-reconciliation rate limits, and reports which rule fired so the
//! driver can surface it as the `ScalingLimited` condition.

use tracing::info;

use tidemark_common::metrics::{set_restricted_scaling, AutoscalerLabels, RestrictionReason};

/// Outcome of normalizing a proposal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Normalization {
    /// Replica count after clamping
    pub replicas: i32,
    /// Whether clamping changed the proposal
    pub limited: bool,
    /// Machine-readable reason for the applied rule
    pub reason: &'static str,
    /// Human-readable description of the applied rule
    pub message: &'static str,
}

/// How many replicas a single step may scale up TO (not BY)
pub fn scale_up_limit(factor: f64, current_replicas: i32) -> i32 {
    (current_replicas as f64 + (factor / 100.0 * current_replicas as f64).floor().max(1.0)) as i32
}

/// How many replicas a single step may scale down TO (not BY)
pub fn scale_down_limit(factor: f64, current_replicas: i32) -> i32 {
    (current_replicas as f64 - (factor / 100.0 * current_replicas as f64).floor().max(1.0)) as i32
}

/// Clamp a proposal by the absolute bounds and the rate limits.
///
/// Rules are applied in order, first match wins:
/// 1. a zero `min_replicas` lifts the lower bound to 1,
/// 2. proposals shrinking faster than the downscale rate are capped,
/// 3. proposals below the minimum are raised to it,
/// 4. proposals growing faster than the upscale rate are capped,
/// 5. proposals above the maximum are lowered to it.
#[allow(clippy::too_many_arguments)]
pub fn normalize(
    labels: &AutoscalerLabels,
    min_replicas: i32,
    max_replicas: i32,
    up_factor: f64,
    down_factor: f64,
    current_replicas: i32,
    desired_replicas: i32,
) -> Normalization {
    let down_limit = scale_down_limit(down_factor, current_replicas);

    let (minimum_allowed, mut reason, mut message) = if min_replicas == 0 {
        (1, "TooFewReplicas", MSG_TOO_FEW)
    } else if desired_replicas < down_limit {
        set_restricted_scaling(labels, RestrictionReason::DownscaleCapping, true);
        info!(
            down_factor,
            min_replicas,
            minimum_allowed = down_limit.max(min_replicas),
            "Downscale rate exceeds the scale-down limit factor, capping"
        );
        (down_limit.max(min_replicas), "ScaleDownLimit", MSG_DOWN_LIMIT)
    } else {
        set_restricted_scaling(labels, RestrictionReason::DownscaleCapping, false);
        (min_replicas, "TooFewReplicas", MSG_TOO_FEW)
    };

    if desired_replicas < minimum_allowed {
        return Normalization {
            replicas: minimum_allowed,
            limited: minimum_allowed != desired_replicas,
            reason,
            message,
        };
    }

    let up_limit = scale_up_limit(up_factor, current_replicas);
    let maximum_allowed = if desired_replicas > up_limit {
        set_restricted_scaling(labels, RestrictionReason::UpscaleCapping, true);
        info!(
            up_factor,
            max_replicas,
            maximum_allowed = up_limit.min(max_replicas),
            "Upscale rate exceeds the scale-up limit factor, capping"
        );
        reason = "ScaleUpLimit";
        message = MSG_UP_LIMIT;
        up_limit.min(max_replicas)
    } else {
        set_restricted_scaling(labels, RestrictionReason::UpscaleCapping, false);
        reason = "TooManyReplicas";
        message = MSG_TOO_MANY;
        max_replicas
    };

    if desired_replicas > maximum_allowed {
        return Normalization {
            replicas: maximum_allowed,
            limited: true,
            reason,
            message,
        };
    }

    Normalization {
        replicas: desired_replicas,
        limited: false,
        reason: "DesiredWithinRange",
        message: MSG_WITHIN_RANGE,
    }
}

const MSG_DOWN_LIMIT: &str = "the desired replica count is decreasing faster than the maximum scale rate";
const MSG_TOO_FEW: &str = "the desired replica count is below the minimum replica count";
const MSG_UP_LIMIT: &str = "the desired replica count is increasing faster than the maximum scale rate";
const MSG_TOO_MANY: &str = "the desired replica count is above the maximum replica count";
const MSG_WITHIN_RANGE: &str = "the desired count is within the acceptable range";

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> AutoscalerLabels {
        AutoscalerLabels::new("norm", "default", "web", "Deployment")
    }

    #[test]
    fn rate_limits_scale_to_not_by() {
        // 50% of 10 is 5, so one step may reach 15; 20% of 10 is 2, so one
        // step may reach 8.
        assert_eq!(scale_up_limit(50.0, 10), 15);
        assert_eq!(scale_down_limit(20.0, 10), 8);
        // the limits always allow at least one replica of movement
        assert_eq!(scale_up_limit(10.0, 3), 4);
        assert_eq!(scale_down_limit(10.0, 3), 2);
    }

    #[test]
    fn unclamped_proposal_passes_through() {
        let n = normalize(&labels(), 1, 20, 50.0, 20.0, 10, 12);
        assert_eq!(n.replicas, 12);
        assert!(!n.limited);
        assert_eq!(n.reason, "DesiredWithinRange");
    }

    #[test]
    fn upscale_capped_by_rate_limit() {
        // cap = 10 + 5 = 15 < desired 30
        let n = normalize(&labels(), 1, 100, 50.0, 20.0, 10, 30);
        assert_eq!(n.replicas, 15);
        assert!(n.limited);
        assert_eq!(n.reason, "ScaleUpLimit");
    }

    #[test]
    fn upscale_capped_by_max_replicas() {
        // rate cap is 15 but maxReplicas 12 is tighter
        let n = normalize(&labels(), 1, 12, 50.0, 20.0, 10, 30);
        assert_eq!(n.replicas, 12);
        assert!(n.limited);
        assert_eq!(n.reason, "ScaleUpLimit");
    }

    #[test]
    fn proposal_above_max_without_rate_violation() {
        // desired 14 is under the rate cap 15 but above maxReplicas 12
        let n = normalize(&labels(), 1, 12, 50.0, 20.0, 10, 14);
        assert_eq!(n.replicas, 12);
        assert!(n.limited);
        assert_eq!(n.reason, "TooManyReplicas");
    }

    #[test]
    fn downscale_cap_can_sit_below_min_replicas() {
        // fDown=100 on 3 replicas gives a cap of 0, resolved against
        // minReplicas=1: the write lands on 1.
        let n = normalize(&labels(), 1, 10, 50.0, 100.0, 3, 1);
        assert_eq!(n.replicas, 1);
        // proposal already was 1: no clamping happened
        assert!(!n.limited);
    }

    #[test]
    fn downscale_capped_by_rate_limit() {
        // cap = 10 - 2 = 8 > desired 2
        let n = normalize(&labels(), 1, 20, 50.0, 20.0, 10, 2);
        assert_eq!(n.replicas, 8);
        assert!(n.limited);
        assert_eq!(n.reason, "ScaleDownLimit");
    }

    #[test]
    fn proposal_below_min_is_raised() {
        // desired 4 is above the rate cap 8? No: desired 4 < cap 8 triggers
        // ScaleDownLimit with max(cap, min). With min=6 the floor is 8.
        let n = normalize(&labels(), 6, 20, 50.0, 20.0, 10, 4);
        assert_eq!(n.replicas, 8);
        assert!(n.limited);
        assert_eq!(n.reason, "ScaleDownLimit");

        // within the rate cap but below min: raised to min
        let n = normalize(&labels(), 9, 20, 50.0, 20.0, 10, 8);
        assert_eq!(n.replicas, 9);
        assert!(n.limited);
        assert_eq!(n.reason, "TooFewReplicas");
    }

    #[test]
    fn zero_min_replicas_lifts_lower_bound_to_one() {
        let n = normalize(&labels(), 0, 20, 50.0, 100.0, 2, 0);
        assert_eq!(n.replicas, 1);
        assert!(n.limited);
        assert_eq!(n.reason, "TooFewReplicas");
    }
}
