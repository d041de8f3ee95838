//! Pure planning functions: failover weight redistribution, desired-count
//! computation, and the current/desired diff that becomes an [`UpdatePlan`].
//!
//! Nothing here touches health state or driver I/O directly; callers pass in
//! an `available` predicate (normally `HealthRegistry::available`) so this
//! crate stays deterministic and trivially testable.

#![forbid(unsafe_code)]

use spread_proto::{MulticloudStack, UpdatePlan, WeightMap};
use std::collections::HashMap;

/// Sum of weights belonging to currently-unavailable clouds, divided evenly
/// across the currently-available ones. Zero if none are available (there is
/// nowhere to redistribute to).
pub fn failover_share(stack: &MulticloudStack, available: &dyn Fn(&str) -> bool) -> f64 {
    let mut unavailable_weight = 0.0;
    let mut healthy_count: u32 = 0;

    for (cloud, weight) in &stack.weights {
        if available(cloud) {
            healthy_count += 1;
        } else {
            unavailable_weight += weight;
        }
    }

    if healthy_count == 0 {
        0.0
    } else {
        unavailable_weight / f64::from(healthy_count)
    }
}

/// Round-half-to-even at 3 decimal places, damping floating point drift
/// between ticks so a tick that already converged does not flap.
fn round3(x: f64) -> f64 {
    (x * 1000.0).round_ties_even() / 1000.0
}

/// Desired instance count per cloud in `stack.weights`, in insertion order.
/// Unavailable clouds get 0; available clouds get their configured weight
/// plus their share of `failover_share`, ceil'd against `stack.count`.
pub fn desired_counts(stack: &MulticloudStack, available: &dyn Fn(&str) -> bool) -> WeightCounts {
    let share = failover_share(stack, available);
    let mut desired = WeightCounts::new();

    for (cloud, weight) in &stack.weights {
        if !available(cloud) {
            desired.insert(cloud.clone(), 0);
            continue;
        }

        let effective = round3(weight + share);
        let count = (stack.count as f64 * effective).ceil() as u64;
        desired.insert(cloud.clone(), count);
    }

    desired
}

/// Per-cloud desired counts, insertion-ordered to match `stack.weights`.
pub type WeightCounts = indexmap::IndexMap<String, u64>;

/// A cloud's currently observed instance count, or `None` if it could not be
/// determined this tick (driver call failed, or the cloud was already
/// unavailable before it was queried).
pub type CurrentCounts = HashMap<String, Option<u64>>;

/// Diff `current` against the desired counts this stack's weights and the
/// given availability imply. Unavailable clouds and clouds with an unknown
/// current count are skipped entirely — never placed in either side of the
/// plan. A cloud never appears on both sides.
pub fn diff(
    stack: &MulticloudStack,
    current: &CurrentCounts,
    available: &dyn Fn(&str) -> bool,
) -> UpdatePlan {
    let desired = desired_counts(stack, available);
    let mut plan = UpdatePlan::default();

    for cloud in stack.weights.keys() {
        if !available(cloud) {
            continue;
        }

        let Some(Some(cur)) = current.get(cloud) else {
            continue;
        };
        let des = desired[cloud];

        if des == *cur {
            continue;
        } else if *cur < des {
            plan.scale_up.insert(cloud.clone(), (*cur, des));
        } else {
            plan.scale_down.insert(cloud.clone(), (*cur, des));
        }
    }

    plan
}
