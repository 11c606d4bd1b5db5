//! Scheduler implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::dispatch::TaskDispatcher;

use super::config::SchedulerConfig;
use super::queue::{ActiveRegistry, QueueState, ScheduleResult, SchedulerStats};

/// State shared between the scheduler handle and its spawned workers
struct Shared {
    dispatcher: Arc<TaskDispatcher>,
    registry: Mutex<ActiveRegistry>,
    permits: Arc<Semaphore>,
    idle: Notify,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, ActiveRegistry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_started(&self, endpoint: &str) {
        if let Some(waited) = self.registry().mark_started(endpoint) {
            debug!(%endpoint, ?waited, "TaskScheduler: dispatcher started");
        }
    }

    /// Returns true when another cycle was requested while this one ran
    fn finish_cycle(&self, endpoint: &str, permit: &mut Option<OwnedSemaphorePermit>) -> bool {
        let mut registry = self.registry();
        if registry.rerun_or_release(endpoint) {
            return true;
        }
        // Endpoint already left the active set; the slot goes back under the same lock
        permit.take();
        if registry.active.is_empty() {
            self.idle.notify_waiters();
        }
        false
    }

    fn record_result(&self, completed: bool) {
        let mut registry = self.registry();
        if completed {
            registry.stats.total_completed += 1;
        } else {
            registry.stats.total_failed += 1;
        }
    }
}

/// Bounded worker pool with at most one dispatcher per endpoint
pub struct TaskScheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, dispatcher: Arc<TaskDispatcher>) -> Self {
        debug!(?config, "TaskScheduler::new: called");
        let pool_size = config.pool_size.max(1);
        Self {
            config,
            shared: Arc::new(Shared {
                dispatcher,
                registry: Mutex::new(ActiveRegistry::default()),
                permits: Arc::new(Semaphore::new(pool_size)),
                idle: Notify::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Request a dispatch cycle for an endpoint
    ///
    /// Must be called from within a tokio runtime. A request for an endpoint
    /// that already has a dispatcher does not start a second one; it asks the
    /// running dispatcher for one more cycle.
    pub fn schedule(&self, endpoint: &str) -> ScheduleResult {
        debug!(%endpoint, "TaskScheduler::schedule: called");
        if self.closed.load(Ordering::SeqCst) {
            debug!(%endpoint, "TaskScheduler::schedule: closed, rejecting");
            return ScheduleResult::Rejected {
                reason: "Scheduler is shutting down".to_string(),
            };
        }

        let mut registry = self.shared.registry();
        if !registry.claim(endpoint) {
            debug!(%endpoint, "TaskScheduler::schedule: already active, rerun requested");
            return ScheduleResult::AlreadyActive;
        }

        // Every active endpoint holds at most one permit
        let pool_size = self.config.pool_size.max(1);
        let result = if registry.active.len() <= pool_size {
            ScheduleResult::Ready
        } else {
            ScheduleResult::Queued {
                position: registry.active.len() - pool_size,
            }
        };

        let shared = self.shared.clone();
        let owned = endpoint.to_string();
        tokio::spawn(async move { service_endpoint(shared, owned).await });
        drop(registry);

        debug!(%endpoint, ?result, "TaskScheduler::schedule: spawned dispatcher");
        result
    }

    /// Stop accepting new requests
    pub fn close(&self) {
        debug!("TaskScheduler::close: called");
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.shared.registry().active.is_empty()
    }

    /// Wait until no endpoint is being serviced
    pub async fn wait_idle(&self) {
        debug!("TaskScheduler::wait_idle: called");
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Close the scheduler and wait up to `timeout` for active cycles
    ///
    /// Cycles are never cancelled; returns false if some were still running
    /// when the timeout expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        debug!(?timeout, "TaskScheduler::shutdown: called");
        self.close();
        let state = self.queue_state();
        info!(active = state.active.len(), "Shutting down scheduler");

        match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => {
                info!("Scheduler shutdown complete");
                true
            }
            Err(_) => {
                let state = self.queue_state();
                warn!(active = ?state.active, "Scheduler shutdown timed out with active dispatchers");
                false
            }
        }
    }

    /// Get current occupancy snapshot
    pub fn queue_state(&self) -> QueueState {
        self.shared.registry().snapshot()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.registry().stats.clone()
    }
}

/// Worker body: hold a pool slot and run cycles until no rerun is pending
async fn service_endpoint(shared: Arc<Shared>, endpoint: String) {
    let mut permit = match shared.permits.clone().acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(e) => {
            error!(%endpoint, error = %e, "service_endpoint: pool closed");
            shared.finish_cycle(&endpoint, &mut None);
            return;
        }
    };
    shared.mark_started(&endpoint);

    loop {
        let dispatcher = shared.dispatcher.clone();
        let cycle_endpoint = endpoint.clone();
        // A panic inside the cycle surfaces here as a JoinError
        let outcome = tokio::spawn(async move { dispatcher.run_cycle(&cycle_endpoint).await }).await;

        match outcome {
            Ok(Ok(report)) => {
                debug!(%endpoint, cycle_id = %report.cycle_id, "service_endpoint: cycle completed");
                shared.record_result(true);
            }
            Ok(Err(e)) => {
                error!(%endpoint, error = %e, "Dispatch cycle failed");
                shared.record_result(false);
            }
            Err(e) => {
                error!(%endpoint, error = %e, "Dispatch cycle panicked");
                shared.record_result(false);
            }
        }

        if !shared.finish_cycle(&endpoint, &mut permit) {
            break;
        }
        debug!(%endpoint, "service_endpoint: rerun requested, cycling again");
    }
}
