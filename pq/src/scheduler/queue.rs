//! Queue types for the scheduler

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Result of a scheduling request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleResult {
    /// A dispatcher was started and has a pool slot
    Ready,

    /// A dispatcher was started and waits for a pool slot
    Queued { position: usize },

    /// The endpoint already has a dispatcher; one more cycle will follow it
    AlreadyActive,

    /// Request rejected (scheduler closed)
    Rejected { reason: String },
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub deferred_duplicates: u64,
    pub total_reruns: u64,
    pub peak_concurrent: usize,
}

/// Snapshot of scheduler occupancy
#[derive(Debug, Clone)]
pub struct QueueState {
    /// Endpoints with a dispatcher, running or waiting for a slot
    pub active: Vec<String>,
    pub running: usize,
    pub waiting: usize,
    pub stats: SchedulerStats,
}

#[derive(Debug, Clone)]
pub(super) struct ActiveEntry {
    pub submitted_at: Instant,
    pub started_at: Option<Instant>,
}

/// The set of endpoints currently being serviced
///
/// Lives behind the scheduler's single mutex; every spawn and release
/// decision is made while holding it.
#[derive(Debug, Default)]
pub(super) struct ActiveRegistry {
    pub active: HashMap<String, ActiveEntry>,
    pub reruns: HashSet<String>,
    pub running: usize,
    pub stats: SchedulerStats,
}

impl ActiveRegistry {
    /// Claim an endpoint; false if it is already being serviced
    pub fn claim(&mut self, endpoint: &str) -> bool {
        if self.active.contains_key(endpoint) {
            self.reruns.insert(endpoint.to_string());
            self.stats.deferred_duplicates += 1;
            return false;
        }
        self.active.insert(
            endpoint.to_string(),
            ActiveEntry {
                submitted_at: Instant::now(),
                started_at: None,
            },
        );
        self.stats.total_scheduled += 1;
        true
    }

    pub fn mark_started(&mut self, endpoint: &str) -> Option<Duration> {
        let entry = self.active.get_mut(endpoint)?;
        let now = Instant::now();
        entry.started_at = Some(now);
        self.running += 1;
        self.stats.peak_concurrent = self.stats.peak_concurrent.max(self.running);
        Some(now - entry.submitted_at)
    }

    /// Consume a pending rerun request, or release the endpoint
    ///
    /// Returns true when another cycle must run.
    pub fn rerun_or_release(&mut self, endpoint: &str) -> bool {
        if self.reruns.remove(endpoint) {
            self.stats.total_reruns += 1;
            return true;
        }
        if let Some(entry) = self.active.remove(endpoint) {
            if entry.started_at.is_some() {
                self.running -= 1;
            }
        }
        false
    }

    pub fn snapshot(&self) -> QueueState {
        let mut active: Vec<String> = self.active.keys().cloned().collect();
        active.sort();
        QueueState {
            waiting: self.active.len() - self.running,
            running: self.running,
            active,
            stats: self.stats.clone(),
        }
    }
}
