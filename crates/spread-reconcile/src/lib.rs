//! The reconciliation core: [`StackAction`]'s uniform call classification,
//! the per-stack [`Reconciler`], and the tick-driving [`Scheduler`].

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use spread_driver::{CloudStackDriver, DriverError};
use spread_health::{CloudHealth, HealthRegistry, StackHealth};
use spread_planner::CurrentCounts;
use spread_proto::MulticloudStack;
use spread_store::StackStore;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

pub type DriverMap = IndexMap<String, Arc<dyn CloudStackDriver>>;

// ─── StackAction ───────────────────────────────────────────────────────────────

/// Errors a reconciler-level call can fail with, beyond what the driver
/// itself raises. `MissingCountParameter` is detected after a successful
/// `get` once the requested parameter turns out to be absent or unparsable.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("count parameter missing or unparsable")]
    MissingCountParameter,
}

/// Runs `fut`, classifies its outcome, and updates `health` accordingly.
/// Success marks both the cloud and the stack-on-cloud healthy; a classified
/// failure marks only the health dimension it speaks to, and the call
/// produces no value.
pub async fn stack_action<T, Fut>(
    health: &HealthRegistry,
    cloud: &str,
    stack: &str,
    fut: Fut,
) -> Option<T>
where
    Fut: Future<Output = Result<T, ActionError>>,
{
    match fut.await {
        Ok(value) => {
            health.set_cloud_status(cloud, CloudHealth::Healthy);
            health.set_stack_status(cloud, stack, StackHealth::Healthy);
            Some(value)
        }
        Err(ActionError::Driver(DriverError::NotFound(_))) => {
            warn!(cloud_name = cloud, stack_name = stack, "stack not found");
            health.set_stack_status(cloud, stack, StackHealth::NotFound);
            None
        }
        Err(ActionError::MissingCountParameter) => {
            warn!(cloud_name = cloud, stack_name = stack, "stack missing count parameter");
            health.set_stack_status(cloud, stack, StackHealth::MissingCountParameter);
            None
        }
        Err(ActionError::Driver(DriverError::Unreachable(e))) => {
            warn!(cloud_name = cloud, error = %e, "cloud unreachable");
            health.set_cloud_status(cloud, CloudHealth::Unreachable);
            None
        }
        Err(ActionError::Driver(DriverError::Other(e))) => {
            warn!(cloud_name = cloud, error = %e, "unclassified driver error, treating as unreachable");
            health.set_cloud_status(cloud, CloudHealth::Unreachable);
            None
        }
    }
}

// ─── Bounded driver worker pool ────────────────────────────────────────────────

/// Bounds how many driver calls run concurrently and keeps abort handles
/// around so `Scheduler::force_stop` can cancel outstanding calls without
/// waiting for them.
struct DriverPool {
    semaphore: Semaphore,
    handles: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl DriverPool {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Semaphore::new(size.max(1)),
            handles: Mutex::new(Vec::new()),
        }
    }

    async fn run<F>(&self, fut: F) -> Result<F::Output, tokio::task::JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("driver pool semaphore never closes");

        let handle = tokio::spawn(fut);
        let abort = handle.abort_handle();
        self.handles.lock().push(abort);

        let result = handle.await;
        self.handles.lock().retain(|h| !h.is_finished());
        result
    }

    fn abort_all(&self) {
        for handle in self.handles.lock().iter() {
            handle.abort();
        }
    }
}

// ─── Reconciler ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct ReconcileOutcome {
    pub stack_name: String,
    pub plan: spread_proto::UpdatePlan,
}

pub struct Reconciler {
    health: Arc<HealthRegistry>,
    drivers: Arc<DriverMap>,
    pool: Arc<DriverPool>,
    logged_config_errors: Mutex<HashSet<(String, String)>>,
}

impl Reconciler {
    pub fn new(health: Arc<HealthRegistry>, drivers: Arc<DriverMap>, driver_pool_size: usize) -> Self {
        Self {
            health,
            drivers,
            pool: Arc::new(DriverPool::new(driver_pool_size)),
            logged_config_errors: Mutex::new(HashSet::new()),
        }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    fn force_stop(&self) {
        self.pool.abort_all();
    }

    fn log_config_error_once(&self, cloud: &str, stack: &str) {
        let key = (cloud.to_string(), stack.to_string());
        let mut seen = self.logged_config_errors.lock();
        if seen.insert(key) {
            warn!(cloud_name = cloud, stack_name = stack, "cloud not configured, skipping");
        }
    }

    /// Gathers current counts and computes the plan a tick would apply,
    /// without applying it. Used both by `reconcile` and by callers that
    /// only want a dry-run preview (e.g. the `spreaderd plan` subcommand).
    pub async fn plan(&self, stack: &MulticloudStack, running: &AtomicBool) -> (CurrentCounts, spread_proto::UpdatePlan) {
        let mut current: CurrentCounts = HashMap::new();

        for cloud in stack.weights.keys() {
            if !running.load(Ordering::SeqCst) {
                return (current, Default::default());
            }
            let count = self.get_current_count(stack, cloud).await;
            current.insert(cloud.clone(), count);
        }

        let health = self.health.clone();
        let stack_name = stack.stack_name.clone();
        let available = move |cloud: &str| health.available(&stack_name, cloud);
        let desired = spread_planner::desired_counts(stack, &available);
        let plan = spread_planner::diff(stack, &current, &available);

        for cloud in stack.weights.keys() {
            let Some(&des) = desired.get(cloud) else {
                continue;
            };
            match current.get(cloud).copied().flatten() {
                Some(cur) if cur == des => {
                    info!(stack_name = %stack.stack_name, cloud_name = cloud, count_current = cur, count_desired = des, "satisfied");
                }
                Some(cur) => {
                    info!(stack_name = %stack.stack_name, cloud_name = cloud, count_current = cur, count_desired = des, "unsatisfied");
                }
                None => {
                    debug!(stack_name = %stack.stack_name, cloud_name = cloud, count_desired = des, "current count unknown");
                }
            }
        }

        (current, plan)
    }

    /// Gather current counts, plan, and apply. Returns early (with whatever
    /// has already been applied) if `running` is cleared between steps.
    pub async fn reconcile(&self, stack: &MulticloudStack, running: &AtomicBool) -> ReconcileOutcome {
        let (_, plan) = self.plan(stack, running).await;

        for (cloud, (cur, desired)) in &plan.scale_up {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            info!(stack_name = %stack.stack_name, cloud_name = cloud, count_current = cur, count_desired = desired, "scale_up");
            self.update_stack(stack, cloud, *desired).await;
        }

        for (cloud, (cur, desired)) in &plan.scale_down {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            info!(stack_name = %stack.stack_name, cloud_name = cloud, count_current = cur, count_desired = desired, "scale_down");
            self.update_stack(stack, cloud, *desired).await;
        }

        ReconcileOutcome { stack_name: stack.stack_name.clone(), plan }
    }

    async fn get_current_count(&self, stack: &MulticloudStack, cloud: &str) -> Option<u64> {
        let Some(driver) = self.drivers.get(cloud).cloned() else {
            self.log_config_error_once(cloud, &stack.stack_name);
            return None;
        };

        let stack_name = stack.stack_name.clone();
        let count_parameter = stack.count_parameter.clone();
        let pool = self.pool.clone();

        let call = async move {
            let params = driver.get(&stack_name).await?;
            params
                .get(&count_parameter)
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(ActionError::MissingCountParameter)
        };

        stack_action(&self.health, cloud, &stack.stack_name, async move {
            pool.run(call)
                .await
                .unwrap_or_else(|_| Err(ActionError::Driver(DriverError::Other("driver call aborted".to_string()))))
        })
        .await
    }

    async fn update_stack(&self, stack: &MulticloudStack, cloud: &str, desired: u64) {
        let Some(driver) = self.drivers.get(cloud).cloned() else {
            self.log_config_error_once(cloud, &stack.stack_name);
            return;
        };

        let stack_name = stack.stack_name.clone();
        let count_parameter = stack.count_parameter.clone();
        let pool = self.pool.clone();

        let call = async move {
            let mut params = HashMap::new();
            params.insert(count_parameter, desired.to_string());
            driver.update(&stack_name, params).await?;
            Ok(())
        };

        let _: Option<()> = stack_action(&self.health, cloud, &stack.stack_name, async move {
            pool.run(call)
                .await
                .unwrap_or_else(|_| Err(ActionError::Driver(DriverError::Other("driver call aborted".to_string()))))
        })
        .await;
    }
}

// ─── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    ForceStopped,
}

pub struct Scheduler {
    store: Arc<dyn StackStore>,
    reconciler: Arc<Reconciler>,
    update_frequency: Duration,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    state: RwLock<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StackStore>,
        drivers: DriverMap,
        update_frequency: Duration,
        driver_pool_size: usize,
    ) -> Self {
        let health = Arc::new(HealthRegistry::new());
        let reconciler = Arc::new(Reconciler::new(health, Arc::new(drivers), driver_pool_size));

        Self {
            store,
            reconciler,
            update_frequency,
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            state: RwLock::new(SchedulerState::Idle),
        }
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.reconciler.health().clone()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    /// Runs the tick loop until `stop`/`force_stop` is called. Returns once
    /// the loop has observed the stop request and exited cleanly.
    pub async fn run(&self) {
        *self.state.write() = SchedulerState::Running;
        self.running.store(true, Ordering::SeqCst);
        info!("scheduler_start");

        while self.running.load(Ordering::SeqCst) {
            match self.store.list().await {
                Ok(stacks) => {
                    for stack in &stacks {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }
                        let outcome = self.reconciler.reconcile(stack, &self.running).await;
                        debug!(
                            stack_name = %outcome.stack_name,
                            scale_up = outcome.plan.scale_up.len(),
                            scale_down = outcome.plan.scale_down.len(),
                            "tick_complete"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stack_store_list_failed, retrying next tick");
                }
            }

            self.sleep_interruptible().await;
        }

        let mut state = self.state.write();
        if *state != SchedulerState::ForceStopped {
            *state = SchedulerState::Stopped;
        }
        info!("scheduler_stop_complete");
    }

    async fn sleep_interruptible(&self) {
        debug!("scheduler_sleep_start");

        // `notified()` must be constructed before the running re-check: it
        // captures the Notify's current generation synchronously, so a
        // `stop()` racing in anywhere after this line is still observed
        // when the future is polled below. `notify_waiters` stores no
        // permit for a `Notified` that doesn't exist yet, so checking
        // `running` first and constructing this afterward can silently
        // drop the wakeup and sleep the full `update_frequency`.
        let notified = self.stop_notify.notified();
        if !self.running.load(Ordering::SeqCst) {
            debug!("scheduler_sleep_cancelled");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.update_frequency) => {}
            _ = notified => {
                debug!("scheduler_sleep_cancelled");
            }
        }
        debug!("scheduler_sleep_end");
    }

    /// Requests a graceful stop: the sleep is cancelled, the current
    /// iteration finishes, and `run` returns once the loop observes it.
    pub fn stop(&self) {
        info!("scheduler_stop_requested");
        *self.state.write() = SchedulerState::Stopping;
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    /// Stops gracefully, then aborts any in-flight driver calls instead of
    /// waiting for them.
    pub fn force_stop(&self) {
        self.stop();
        *self.state.write() = SchedulerState::ForceStopped;
        self.reconciler.force_stop();
    }
}
