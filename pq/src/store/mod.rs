//! Transactional action storage
//!
//! The dispatcher reaches persisted state only through a [`StoreTransaction`]
//! obtained from [`ActionStore::begin`]. A transaction that is dropped without
//! [`StoreTransaction::commit`] rolls back, so every exit path of a cycle
//! (including `?` and panics) leaves the store consistent.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::domain::{Action, ActionId, Endpoint, ExecutionRecord, ExecutionStatus, NewAction};
use crate::queue::PendingRecord;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Backend(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::InvalidData(e.to_string())
    }
}

/// Result of store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent home of actions, execution records and endpoint flags
pub trait ActionStore: Send + Sync {
    /// Start a transaction
    ///
    /// The returned transaction must not be held across an `.await`; it may
    /// own a lock on the backing connection.
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;

    /// Endpoints with at least one Queued record due at `now`, or a pending refresh
    fn due_endpoints(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        debug!(%now, "ActionStore::due_endpoints: called");
        let mut tx = self.begin()?;
        let endpoints = tx.due_endpoints(now)?;
        tx.commit()?;
        Ok(endpoints)
    }

    /// Every endpoint known to the store
    fn endpoints(&self) -> StoreResult<Vec<Endpoint>> {
        let mut tx = self.begin()?;
        let endpoints = tx.list_endpoints()?;
        tx.commit()?;
        Ok(endpoints)
    }

    /// Create an action and its execution records in one transaction
    fn create_action(&self, action: NewAction) -> StoreResult<Action> {
        debug!(name = %action.name, endpoints = ?action.endpoints, "ActionStore::create_action: called");
        let mut tx = self.begin()?;
        let created = tx.insert_action(action)?;
        tx.commit()?;
        Ok(created)
    }

    /// Execution records, optionally filtered
    fn records(&self, endpoint: Option<&str>, status: Option<ExecutionStatus>) -> StoreResult<Vec<ExecutionRecord>> {
        let mut tx = self.begin()?;
        let records = tx.list_records(endpoint, status)?;
        tx.commit()?;
        Ok(records)
    }
}

/// A unit of work against an [`ActionStore`]
pub trait StoreTransaction {
    /// Queued records for an endpoint, ascending by schedule time then action id
    fn load_pending_execution_records(&mut self, endpoint: &str) -> StoreResult<Vec<PendingRecord>>;

    fn load_action(&mut self, id: ActionId) -> StoreResult<Action>;

    fn load_record(&mut self, action_id: ActionId, endpoint: &str) -> StoreResult<Option<ExecutionRecord>>;

    /// Persist an existing execution record
    fn save(&mut self, record: &ExecutionRecord) -> StoreResult<()>;

    /// Load an endpoint, returning a fresh one if the store has never seen it
    fn load_endpoint(&mut self, id: &str) -> StoreResult<Endpoint>;

    fn save_endpoint(&mut self, endpoint: &Endpoint) -> StoreResult<()>;

    /// Refresh endpoint metadata after a successful contact
    fn record_checkin(&mut self, endpoint: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Insert an action with one Queued record per target endpoint
    fn insert_action(&mut self, action: NewAction) -> StoreResult<Action>;

    fn due_endpoints(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<String>>;

    fn list_endpoints(&mut self) -> StoreResult<Vec<Endpoint>>;

    fn list_records(
        &mut self,
        endpoint: Option<&str>,
        status: Option<ExecutionStatus>,
    ) -> StoreResult<Vec<ExecutionRecord>>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

pub(crate) fn millis_to_datetime(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::InvalidData(format!("timestamp out of range: {}", ms)))
}
