//! In-memory ActionStore
//!
//! Transactions work on a private copy of the state and swap it in on commit.
//! The store mutex is held for the lifetime of a transaction, which gives
//! serializable isolation. Nothing is persisted; the crate's unit tests use it
//! as the store double, with inspection helpers compiled in only for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Action, ActionId, Endpoint, ExecutionRecord, ExecutionStatus, NewAction};
use crate::queue::PendingRecord;

use super::{ActionStore, StoreError, StoreResult, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_action_id: ActionId,
    actions: BTreeMap<ActionId, Action>,
    records: BTreeMap<(ActionId, String), ExecutionRecord>,
    endpoints: BTreeMap<String, Endpoint>,
    checkins: HashMap<String, usize>,
}

/// ActionStore kept entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Make every following commit fail with a backend error
    pub fn set_fail_commits(&self, fail: bool) {
        debug!(fail, "MemoryStore::set_fail_commits: called");
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Committed record for an action on an endpoint
    pub fn record(&self, action_id: ActionId, endpoint: &str) -> Option<ExecutionRecord> {
        self.lock()
            .ok()
            .and_then(|state| state.records.get(&(action_id, endpoint.to_string())).cloned())
    }

    /// Committed endpoint state
    pub fn endpoint(&self, id: &str) -> Option<Endpoint> {
        self.lock().ok().and_then(|state| state.endpoints.get(id).cloned())
    }

    /// Committed actions, in id order
    pub fn actions(&self) -> Vec<Action> {
        self.lock()
            .map(|state| state.actions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of committed check-ins for an endpoint
    pub fn checkin_count(&self, endpoint: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.checkins.get(endpoint).copied())
            .unwrap_or(0)
    }
}

impl ActionStore for MemoryStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let guard = self.lock()?;
        let staged = (*guard).clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        }))
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, MemoryState>,
    staged: MemoryState,
    fail_commit: bool,
}

impl MemoryTransaction<'_> {
    fn endpoint_mut(&mut self, id: &str) -> &mut Endpoint {
        self.staged
            .endpoints
            .entry(id.to_string())
            .or_insert_with(|| Endpoint::new(id))
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn load_pending_execution_records(&mut self, endpoint: &str) -> StoreResult<Vec<PendingRecord>> {
        let mut pending = Vec::new();
        for ((action_id, ep), record) in &self.staged.records {
            if ep != endpoint || record.status != ExecutionStatus::Queued {
                continue;
            }
            let action = self
                .staged
                .actions
                .get(action_id)
                .ok_or_else(|| StoreError::NotFound(format!("Action {}", action_id)))?;
            pending.push(PendingRecord {
                record: record.clone(),
                action_name: action.name.clone(),
                scheduled_at: action.scheduled_at,
            });
        }
        pending.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.action_id().cmp(&b.action_id()))
        });
        Ok(pending)
    }

    fn load_action(&mut self, id: ActionId) -> StoreResult<Action> {
        self.staged
            .actions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Action {}", id)))
    }

    fn load_record(&mut self, action_id: ActionId, endpoint: &str) -> StoreResult<Option<ExecutionRecord>> {
        Ok(self.staged.records.get(&(action_id, endpoint.to_string())).cloned())
    }

    fn save(&mut self, record: &ExecutionRecord) -> StoreResult<()> {
        let key = (record.action_id, record.endpoint.clone());
        match self.staged.records.get_mut(&key) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "Execution record for action {} on {}",
                record.action_id, record.endpoint
            ))),
        }
    }

    fn load_endpoint(&mut self, id: &str) -> StoreResult<Endpoint> {
        Ok(self.staged.endpoints.get(id).cloned().unwrap_or_else(|| Endpoint::new(id)))
    }

    fn save_endpoint(&mut self, endpoint: &Endpoint) -> StoreResult<()> {
        self.staged.endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(())
    }

    fn record_checkin(&mut self, endpoint: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.endpoint_mut(endpoint).record_checkin(at);
        *self.staged.checkins.entry(endpoint.to_string()).or_default() += 1;
        Ok(())
    }

    fn insert_action(&mut self, action: NewAction) -> StoreResult<Action> {
        if let Some(prereq) = action.prerequisite {
            if !self.staged.actions.contains_key(&prereq) {
                return Err(StoreError::NotFound(format!("Prerequisite action {}", prereq)));
            }
        }

        self.staged.next_action_id += 1;
        let id = self.staged.next_action_id;
        let created = Action {
            id,
            name: action.name,
            scheduled_at: action.scheduled_at,
            prerequisite: action.prerequisite,
            procedure: action.procedure,
            created_at: Utc::now(),
        };
        self.staged.actions.insert(id, created.clone());

        for endpoint in action.endpoints {
            self.endpoint_mut(&endpoint);
            self.staged.records.insert(
                (id, endpoint.clone()),
                ExecutionRecord::new(id, endpoint, action.retries),
            );
        }
        Ok(created)
    }

    fn due_endpoints(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut due: Vec<String> = self
            .staged
            .records
            .values()
            .filter(|r| r.status == ExecutionStatus::Queued)
            .filter(|r| {
                self.staged
                    .actions
                    .get(&r.action_id)
                    .is_some_and(|a| a.is_due(now))
            })
            .map(|r| r.endpoint.clone())
            .chain(
                self.staged
                    .endpoints
                    .values()
                    .filter(|e| e.needs_refresh)
                    .map(|e| e.id.clone()),
            )
            .collect();
        due.sort();
        due.dedup();
        Ok(due)
    }

    fn list_endpoints(&mut self) -> StoreResult<Vec<Endpoint>> {
        Ok(self.staged.endpoints.values().cloned().collect())
    }

    fn list_records(
        &mut self,
        endpoint: Option<&str>,
        status: Option<ExecutionStatus>,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        Ok(self
            .staged
            .records
            .values()
            .filter(|r| endpoint.is_none_or(|e| r.endpoint == e))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut guard,
            staged,
            fail_commit,
        } = *self;
        if fail_commit {
            debug!("MemoryTransaction::commit: injected failure");
            return Err(StoreError::Backend("commit failed".to_string()));
        }
        *guard = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!("MemoryTransaction::rollback: called");
        Ok(())
    }
}
