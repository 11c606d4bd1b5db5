//! Poller - periodic trigger for the scheduler

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::{ActionStore, StoreResult};

use super::core::TaskScheduler;
use super::queue::ScheduleResult;

/// Asks the store for endpoints with due work and schedules them
pub struct Poller {
    store: Arc<dyn ActionStore>,
    scheduler: Arc<TaskScheduler>,
}

impl Poller {
    pub fn new(store: Arc<dyn ActionStore>, scheduler: Arc<TaskScheduler>) -> Self {
        debug!("Poller::new: called");
        Self { store, scheduler }
    }

    /// Schedule every endpoint with due work at `now`
    ///
    /// Returns the number of endpoints that got a new dispatcher.
    pub fn poll_once(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        debug!(%now, "Poller::poll_once: called");
        let mut endpoints: BTreeSet<String> = self.store.due_endpoints(now)?.into_iter().collect();
        if self.scheduler.config().checkin_idle {
            endpoints.extend(self.store.endpoints()?.into_iter().map(|e| e.id));
        }

        let mut started = 0;
        for endpoint in &endpoints {
            match self.scheduler.schedule(endpoint) {
                ScheduleResult::Ready | ScheduleResult::Queued { .. } => started += 1,
                ScheduleResult::AlreadyActive => {}
                ScheduleResult::Rejected { reason } => {
                    debug!(%endpoint, %reason, "Poller::poll_once: rejected");
                }
            }
        }
        debug!(candidates = endpoints.len(), started, "Poller::poll_once: complete");
        Ok(started)
    }

    /// Poll on an interval until a shutdown signal arrives
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let config = self.scheduler.config().clone();
        info!(
            pool_size = config.pool_size,
            poll_interval_secs = config.poll_interval_secs,
            "Poller starting"
        );

        // First tick fires immediately
        let mut interval = tokio::time::interval(config.poll_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()) {
                        warn!(error = %e, "Poller: poll failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if !self.scheduler.shutdown(config.shutdown_timeout()).await {
            warn!("Exiting with dispatch cycles still running");
        }
        debug!("Poller::run: complete");
        Ok(())
    }
}
