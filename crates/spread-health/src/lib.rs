//! Per-cloud and per-stack health tracking.
//!
//! [`HealthRegistry`] is the sole source of truth the planner consults via
//! [`HealthRegistry::available`]. It is written only by the reconciler (through
//! [`HealthRegistry::set_cloud_status`] / [`HealthRegistry::set_stack_status`])
//! after classifying the outcome of a driver call. Wrap it in an `Arc` to share
//! it between the scheduler's tick loop and whatever reads health snapshots.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudHealth {
    #[default]
    NotChecked,
    Healthy,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackHealth {
    #[default]
    NotChecked,
    Healthy,
    NotFound,
    MissingCountParameter,
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    clouds: RwLock<HashMap<String, CloudHealth>>,
    stacks: RwLock<HashMap<(String, String), StackHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cloud_status(&self, cloud: &str) -> CloudHealth {
        self.clouds.read().get(cloud).copied().unwrap_or_default()
    }

    pub fn set_cloud_status(&self, cloud: &str, status: CloudHealth) {
        let mut clouds = self.clouds.write();
        let prev = clouds.insert(cloud.to_string(), status);
        if prev != Some(status) {
            info!(cloud_name = cloud, ?status, "cloud health updated");
        }
    }

    pub fn stack_status(&self, cloud: &str, stack: &str) -> StackHealth {
        self.stacks
            .read()
            .get(&(cloud.to_string(), stack.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_stack_status(&self, cloud: &str, stack: &str, status: StackHealth) {
        let key = (cloud.to_string(), stack.to_string());
        let mut stacks = self.stacks.write();
        let prev = stacks.insert(key, status);
        if prev != Some(status) {
            info!(cloud_name = cloud, stack_name = stack, ?status, "stack health updated");
        }
    }

    /// A stack is available on a cloud only once the cloud itself has been
    /// seen healthy and the stack on that cloud has too. Either map being
    /// empty (never observed) counts as unavailable.
    pub fn available(&self, stack: &str, cloud: &str) -> bool {
        self.cloud_status(cloud) == CloudHealth::Healthy
            && self.stack_status(cloud, stack) == StackHealth::Healthy
    }
}
