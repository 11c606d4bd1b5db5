//! ExecutionRecord domain type
//!
//! Per-(action, endpoint) status and retry bookkeeping. Status is monotone:
//! a Completed or Failed record never goes back to Queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::action::ActionId;

/// Remote execution succeeded
pub const RESULT_SUCCESS: i64 = 0;
/// Remote execution reported an error
pub const RESULT_REMOTE_ERROR: i64 = -1;
/// The prerequisite action failed on the same endpoint
pub const RESULT_PREREQUISITE_FAILED: i64 = -100;
/// The retry budget ran out before a successful transaction
pub const RESULT_RETRIES_EXHAUSTED: i64 = -101;

pub const PREREQUISITE_FAILED_MSG: &str = "Prerequisite failed.";
pub const RETRIES_EXHAUSTED_MSG: &str = "Action has been picked up multiple times without a successful transaction; \
     this action is now failed for this endpoint.";

/// Upper bound on stored result messages
pub const MAX_RESULT_MSG_LEN: usize = 1024;

/// Execution record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Queued,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown execution status: {}", s)),
        }
    }
}

/// Rejected status transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Action {action_id} on {endpoint} is already {status}")]
    AlreadyTerminal {
        action_id: ActionId,
        endpoint: String,
        status: ExecutionStatus,
    },

    #[error("Action {action_id} on {endpoint} has no attempts left")]
    NoAttemptsLeft { action_id: ActionId, endpoint: String },
}

/// Execution state of one action on one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub action_id: ActionId,
    pub endpoint: String,
    pub status: ExecutionStatus,

    /// Dispatch attempts left before the record fails permanently
    pub remaining_tries: u32,

    pub result_code: Option<i64>,
    pub result_msg: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a queued record with the given retry budget
    pub fn new(action_id: ActionId, endpoint: impl Into<String>, remaining_tries: u32) -> Self {
        Self {
            action_id,
            endpoint: endpoint.into(),
            status: ExecutionStatus::Queued,
            remaining_tries,
            result_code: None,
            result_msg: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_queued(&self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                action_id: self.action_id,
                endpoint: self.endpoint.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Consume one dispatch attempt, returning the attempts left afterwards
    pub fn consume_attempt(&mut self) -> Result<u32, TransitionError> {
        debug!(action_id = self.action_id, endpoint = %self.endpoint, remaining = self.remaining_tries, "ExecutionRecord::consume_attempt: called");
        self.ensure_queued()?;
        if self.remaining_tries < 1 {
            return Err(TransitionError::NoAttemptsLeft {
                action_id: self.action_id,
                endpoint: self.endpoint.clone(),
            });
        }
        self.remaining_tries -= 1;
        Ok(self.remaining_tries)
    }

    /// Mark the record completed
    pub fn complete(&mut self, code: i64, msg: impl Into<String>, at: DateTime<Utc>) -> Result<(), TransitionError> {
        debug!(action_id = self.action_id, endpoint = %self.endpoint, code, "ExecutionRecord::complete: called");
        self.finish(ExecutionStatus::Completed, code, msg.into(), at)
    }

    /// Mark the record failed
    pub fn fail(&mut self, code: i64, msg: impl Into<String>, at: DateTime<Utc>) -> Result<(), TransitionError> {
        debug!(action_id = self.action_id, endpoint = %self.endpoint, code, "ExecutionRecord::fail: called");
        self.finish(ExecutionStatus::Failed, code, msg.into(), at)
    }

    fn finish(
        &mut self,
        status: ExecutionStatus,
        code: i64,
        msg: String,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_queued()?;
        self.status = status;
        self.result_code = Some(code);
        self.result_msg = Some(truncate_msg(msg));
        self.completed_at = Some(at);
        Ok(())
    }
}

fn truncate_msg(msg: String) -> String {
    if msg.chars().count() <= MAX_RESULT_MSG_LEN {
        return msg;
    }
    msg.chars().take(MAX_RESULT_MSG_LEN).collect()
}
