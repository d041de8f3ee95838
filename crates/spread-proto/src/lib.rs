//! Core data types for the multicloud workload spreader.
//!
//! A [`MulticloudStack`] describes one logical workload: a total desired
//! instance count, the name of the count parameter understood by each
//! cloud's orchestration API, and an ordered weight split across clouds.

#![forbid(unsafe_code)]

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered cloud-name -> weight map. Insertion order matters: the
/// reconciler iterates clouds in this order so plans and logs are
/// deterministic across ticks.
pub type WeightMap = IndexMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MulticloudStack {
    pub stack_name: String,
    pub count: u64,
    pub count_parameter: String,
    #[serde(default)]
    pub weights: WeightMap,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("stack_name must not be empty")]
    EmptyStackName,

    #[error("count_parameter must not be empty")]
    EmptyCountParameter,

    #[error("total cloud weight over 1 (total weight: {0})")]
    WeightOverOne(f64),

    #[error("weight for cloud {cloud:?} must be finite and within [0, 1], got {weight}")]
    WeightOutOfRange { cloud: String, weight: f64 },
}

impl MulticloudStack {
    pub fn new(
        stack_name: impl Into<String>,
        count: u64,
        count_parameter: impl Into<String>,
        weights: WeightMap,
    ) -> Self {
        Self {
            stack_name: stack_name.into(),
            count,
            count_parameter: count_parameter.into(),
            weights,
        }
    }

    /// Validate stack invariants: non-empty name and count parameter,
    /// per-cloud weights within [0, 1], and total weight not exceeding 1.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stack_name.is_empty() {
            return Err(ValidationError::EmptyStackName);
        }

        if self.count_parameter.is_empty() {
            return Err(ValidationError::EmptyCountParameter);
        }

        let mut total = 0.0;
        for (cloud, &weight) in &self.weights {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(ValidationError::WeightOutOfRange {
                    cloud: cloud.clone(),
                    weight,
                });
            }
            total += weight;
        }

        if total > 1.0 {
            return Err(ValidationError::WeightOverOne(total));
        }

        Ok(())
    }
}

/// Per-cloud (current, desired) pair, produced by the planner and consumed
/// by the reconciler. Each cloud name appears in at most one of
/// `scale_up` / `scale_down`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePlan {
    pub scale_up: CountPairMap,
    pub scale_down: CountPairMap,
}

/// Insertion-ordered map of cloud name -> (current, desired) count pair.
pub type CountPairMap = IndexMap<String, (u64, u64)>;

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.scale_up.is_empty() && self.scale_down.is_empty()
    }
}
