//! SQLite-backed ActionStore

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::domain::{Action, ActionId, Endpoint, ExecutionRecord, ExecutionStatus, NewAction, ProcedureDescriptor};
use crate::queue::PendingRecord;

use super::{ActionStore, StoreError, StoreResult, StoreTransaction, millis_to_datetime};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS endpoints (
    id              TEXT PRIMARY KEY,
    needs_refresh   INTEGER NOT NULL DEFAULT 0,
    last_checkin_ms INTEGER
);

CREATE TABLE IF NOT EXISTS actions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    procedure       TEXT NOT NULL,
    scheduled_at_ms INTEGER NOT NULL,
    prerequisite_id INTEGER REFERENCES actions(id),
    created_at_ms   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_records (
    action_id       INTEGER NOT NULL REFERENCES actions(id),
    endpoint_id     TEXT NOT NULL REFERENCES endpoints(id),
    status          TEXT NOT NULL,
    remaining_tries INTEGER NOT NULL,
    result_code     INTEGER,
    result_msg      TEXT,
    completed_at_ms INTEGER,
    PRIMARY KEY (action_id, endpoint_id)
);

CREATE INDEX IF NOT EXISTS idx_records_endpoint_status ON execution_records(endpoint_id, status);
";

const RECORD_COLUMNS: &str =
    "r.action_id, r.endpoint_id, r.status, r.remaining_tries, r.result_code, r.result_msg, r.completed_at_ms";

/// ActionStore persisted in a single SQLite database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        debug!(path = %path.as_ref().display(), "SqliteStore::open: called");
        let conn = Connection::open(path.as_ref())?;
        let store = Self::init(conn)?;
        info!(path = %path.as_ref().display(), "Opened action store");
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("SqliteStore::open_in_memory: called");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl ActionStore for SqliteStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction { conn, finished: false }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("SqliteTransaction::drop: rolling back unfinished transaction");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back transaction");
            }
        }
    }
}

struct RecordRow {
    action_id: ActionId,
    endpoint: String,
    status: String,
    remaining_tries: i64,
    result_code: Option<i64>,
    result_msg: Option<String>,
    completed_at_ms: Option<i64>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            action_id: row.get(0)?,
            endpoint: row.get(1)?,
            status: row.get(2)?,
            remaining_tries: row.get(3)?,
            result_code: row.get(4)?,
            result_msg: row.get(5)?,
            completed_at_ms: row.get(6)?,
        })
    }

    fn into_record(self) -> StoreResult<ExecutionRecord> {
        let status: ExecutionStatus = self.status.parse().map_err(StoreError::InvalidData)?;
        let remaining_tries = u32::try_from(self.remaining_tries)
            .map_err(|_| StoreError::InvalidData(format!("remaining_tries out of range: {}", self.remaining_tries)))?;
        Ok(ExecutionRecord {
            action_id: self.action_id,
            endpoint: self.endpoint,
            status,
            remaining_tries,
            result_code: self.result_code,
            result_msg: self.result_msg,
            completed_at: self.completed_at_ms.map(millis_to_datetime).transpose()?,
        })
    }
}

struct ActionRow {
    id: ActionId,
    name: String,
    procedure: String,
    scheduled_at_ms: i64,
    prerequisite: Option<ActionId>,
    created_at_ms: i64,
}

impl ActionRow {
    fn into_action(self) -> StoreResult<Action> {
        let procedure: ProcedureDescriptor = serde_json::from_str(&self.procedure)?;
        Ok(Action {
            id: self.id,
            name: self.name,
            scheduled_at: millis_to_datetime(self.scheduled_at_ms)?,
            prerequisite: self.prerequisite,
            procedure,
            created_at: millis_to_datetime(self.created_at_ms)?,
        })
    }
}

fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<(String, bool, Option<i64>)> {
    Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?))
}

fn into_endpoint((id, needs_refresh, last_checkin_ms): (String, bool, Option<i64>)) -> StoreResult<Endpoint> {
    Ok(Endpoint {
        id,
        needs_refresh,
        last_checkin: last_checkin_ms.map(millis_to_datetime).transpose()?,
    })
}

impl SqliteTransaction<'_> {
    fn ensure_endpoint(&self, id: &str) -> StoreResult<()> {
        self.conn
            .execute("INSERT OR IGNORE INTO endpoints (id) VALUES (?1)", params![id])?;
        Ok(())
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn load_pending_execution_records(&mut self, endpoint: &str) -> StoreResult<Vec<PendingRecord>> {
        let sql = format!(
            "SELECT {}, a.name, a.scheduled_at_ms
             FROM execution_records r JOIN actions a ON a.id = r.action_id
             WHERE r.endpoint_id = ?1 AND r.status = 'queued'
             ORDER BY a.scheduled_at_ms ASC, a.id ASC",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![endpoint], |row| {
            Ok((RecordRow::from_row(row)?, row.get::<_, String>(7)?, row.get::<_, i64>(8)?))
        })?;

        let mut pending = Vec::new();
        for row in rows {
            let (record, action_name, scheduled_at_ms) = row?;
            pending.push(PendingRecord {
                record: record.into_record()?,
                action_name,
                scheduled_at: millis_to_datetime(scheduled_at_ms)?,
            });
        }
        Ok(pending)
    }

    fn load_action(&mut self, id: ActionId) -> StoreResult<Action> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, procedure, scheduled_at_ms, prerequisite_id, created_at_ms
                 FROM actions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ActionRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        procedure: row.get(2)?,
                        scheduled_at_ms: row.get(3)?,
                        prerequisite: row.get(4)?,
                        created_at_ms: row.get(5)?,
                    })
                },
            )
            .optional()?;
        row.ok_or_else(|| StoreError::NotFound(format!("Action {}", id)))?
            .into_action()
    }

    fn load_record(&mut self, action_id: ActionId, endpoint: &str) -> StoreResult<Option<ExecutionRecord>> {
        let sql = format!(
            "SELECT {} FROM execution_records r WHERE r.action_id = ?1 AND r.endpoint_id = ?2",
            RECORD_COLUMNS
        );
        self.conn
            .query_row(&sql, params![action_id, endpoint], RecordRow::from_row)
            .optional()?
            .map(RecordRow::into_record)
            .transpose()
    }

    fn save(&mut self, record: &ExecutionRecord) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE execution_records
             SET status = ?3, remaining_tries = ?4, result_code = ?5, result_msg = ?6, completed_at_ms = ?7
             WHERE action_id = ?1 AND endpoint_id = ?2",
            params![
                record.action_id,
                record.endpoint,
                record.status.to_string(),
                record.remaining_tries as i64,
                record.result_code,
                record.result_msg,
                record.completed_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "Execution record for action {} on {}",
                record.action_id, record.endpoint
            )));
        }
        Ok(())
    }

    fn load_endpoint(&mut self, id: &str) -> StoreResult<Endpoint> {
        let row = self
            .conn
            .query_row(
                "SELECT id, needs_refresh, last_checkin_ms FROM endpoints WHERE id = ?1",
                params![id],
                endpoint_from_row,
            )
            .optional()?;
        match row {
            Some(row) => into_endpoint(row),
            None => Ok(Endpoint::new(id)),
        }
    }

    fn save_endpoint(&mut self, endpoint: &Endpoint) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO endpoints (id, needs_refresh, last_checkin_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET needs_refresh = excluded.needs_refresh,
                                           last_checkin_ms = excluded.last_checkin_ms",
            params![
                endpoint.id,
                endpoint.needs_refresh as i64,
                endpoint.last_checkin.map(|t| t.timestamp_millis())
            ],
        )?;
        Ok(())
    }

    fn record_checkin(&mut self, endpoint: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.ensure_endpoint(endpoint)?;
        self.conn.execute(
            "UPDATE endpoints SET last_checkin_ms = ?2 WHERE id = ?1",
            params![endpoint, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn insert_action(&mut self, action: NewAction) -> StoreResult<Action> {
        if let Some(prereq) = action.prerequisite {
            let exists: Option<i64> = self
                .conn
                .query_row("SELECT id FROM actions WHERE id = ?1", params![prereq], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("Prerequisite action {}", prereq)));
            }
        }

        let now = Utc::now();
        let procedure = serde_json::to_string(&action.procedure)?;
        self.conn.execute(
            "INSERT INTO actions (name, procedure, scheduled_at_ms, prerequisite_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                action.name,
                procedure,
                action.scheduled_at.timestamp_millis(),
                action.prerequisite,
                now.timestamp_millis()
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        for endpoint in &action.endpoints {
            self.ensure_endpoint(endpoint)?;
            self.conn.execute(
                "INSERT INTO execution_records (action_id, endpoint_id, status, remaining_tries)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, endpoint, ExecutionStatus::Queued.to_string(), action.retries as i64],
            )?;
        }
        debug!(id, name = %action.name, "SqliteTransaction::insert_action: inserted");

        // Round-trip through millis so the returned value matches a later load
        Ok(Action {
            id,
            name: action.name,
            scheduled_at: millis_to_datetime(action.scheduled_at.timestamp_millis())?,
            prerequisite: action.prerequisite,
            procedure: action.procedure,
            created_at: millis_to_datetime(now.timestamp_millis())?,
        })
    }

    fn due_endpoints(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.endpoint_id FROM execution_records r JOIN actions a ON a.id = r.action_id
             WHERE r.status = 'queued' AND a.scheduled_at_ms <= ?1
             UNION
             SELECT id FROM endpoints WHERE needs_refresh != 0
             ORDER BY 1",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis()], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_endpoints(&mut self) -> StoreResult<Vec<Endpoint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, needs_refresh, last_checkin_ms FROM endpoints ORDER BY id")?;
        let rows = stmt.query_map([], endpoint_from_row)?;
        let mut endpoints = Vec::new();
        for row in rows {
            endpoints.push(into_endpoint(row?)?);
        }
        Ok(endpoints)
    }

    fn list_records(
        &mut self,
        endpoint: Option<&str>,
        status: Option<ExecutionStatus>,
    ) -> StoreResult<Vec<ExecutionRecord>> {
        let sql = format!(
            "SELECT {} FROM execution_records r
             WHERE (?1 IS NULL OR r.endpoint_id = ?1) AND (?2 IS NULL OR r.status = ?2)
             ORDER BY r.action_id, r.endpoint_id",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![endpoint, status.map(|s| s.to_string())], RecordRow::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn install(name: &str, at: DateTime<Utc>) -> NewAction {
        NewAction::new(name, ProcedureDescriptor::new("pkg.install").with_arg(name), at)
    }

    #[test]
    fn test_action_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store
            .create_action(install("vim", Utc::now()).for_endpoint("web-1").with_retries(4))
            .unwrap();

        let mut tx = store.begin().unwrap();
        let loaded = tx.load_action(created.id).unwrap();
        assert_eq!(loaded, created);

        let record = tx.load_record(created.id, "web-1").unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Queued);
        assert_eq!(record.remaining_tries, 4);
        assert!(tx.load_record(created.id, "web-2").unwrap().is_none());
    }

    #[test]
    fn test_pending_records_ordered_by_schedule() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let late = store.create_action(install("late", now).for_endpoint("web-1")).unwrap();
        let early = store
            .create_action(install("early", now - Duration::hours(1)).for_endpoint("web-1"))
            .unwrap();
        store.create_action(install("other", now).for_endpoint("web-2")).unwrap();

        let mut tx = store.begin().unwrap();
        let pending = tx.load_pending_execution_records("web-1").unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.action_id()).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert_eq!(pending[0].action_name, "early");
    }

    #[test]
    fn test_save_and_filter_records() {
        let store = SqliteStore::open_in_memory().unwrap();
        let action = store.create_action(install("vim", Utc::now()).for_endpoint("web-1")).unwrap();

        let mut tx = store.begin().unwrap();
        let mut record = tx.load_record(action.id, "web-1").unwrap().unwrap();
        record.fail(-1, "boom", Utc::now()).unwrap();
        tx.save(&record).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.records(None, Some(ExecutionStatus::Failed)).unwrap().len(), 1);
        assert!(store.records(Some("web-1"), Some(ExecutionStatus::Queued)).unwrap().is_empty());
        let failed = &store.records(Some("web-1"), None).unwrap()[0];
        assert_eq!(failed.result_msg.as_deref(), Some("boom"));
    }

    #[test]
    fn test_uncommitted_transaction_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let mut tx = store.begin().unwrap();
            tx.insert_action(install("vim", Utc::now()).for_endpoint("web-1")).unwrap();
        }
        assert!(store.records(None, None).unwrap().is_empty());
        assert!(store.endpoints().unwrap().is_empty());
    }

    #[test]
    fn test_endpoint_flags_and_due_endpoints() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .create_action(install("soon", now + Duration::minutes(5)).for_endpoint("web-1"))
            .unwrap();
        store.create_action(install("now", now).for_endpoint("web-2")).unwrap();

        let mut tx = store.begin().unwrap();
        let mut endpoint = tx.load_endpoint("web-3").unwrap();
        endpoint.mark_refresh_needed();
        tx.save_endpoint(&endpoint).unwrap();
        tx.record_checkin("web-1", now).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.due_endpoints(now).unwrap(), vec!["web-2", "web-3"]);
        let endpoints = store.endpoints().unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(
            endpoints[0].last_checkin.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("actions.db");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store.create_action(install("vim", Utc::now()).for_endpoint("web-1")).unwrap().id
        };

        let store = SqliteStore::open(&path).unwrap();
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.load_action(id).unwrap().name, "vim");
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .create_action(install("vim", Utc::now()).for_endpoint("web-1").after(99))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
