//! Result mapping and per-cycle reporting

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::channel::StructuredResult;
use crate::domain::{ActionId, ExecutionStatus, ProcedureDescriptor, RESULT_REMOTE_ERROR, RESULT_SUCCESS};

/// Terminal status, code and message derived from a remote result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: ExecutionStatus,
    pub code: i64,
    pub message: String,
}

/// Map a present remote result onto a terminal record status
pub fn map_result(procedure: &ProcedureDescriptor, result: &StructuredResult) -> Verdict {
    let failing_state = if procedure.is_state_apply() {
        first_failing_state(&result.ret)
    } else {
        None
    };

    if result.success && result.retcode == 0 && failing_state.is_none() {
        let message = if procedure.is_state_apply() {
            let states: Vec<String> = procedure.args.iter().map(render_arg).collect();
            if states.is_empty() {
                "Successfully applied highstate".to_string()
            } else {
                format!("Successfully applied state(s): {}", states.join(", "))
            }
        } else {
            format!("{} succeeded", procedure.function)
        };
        return Verdict {
            status: ExecutionStatus::Completed,
            code: RESULT_SUCCESS,
            message,
        };
    }

    let mut message = format!("{} failed with return code {}", procedure.function, result.retcode);
    match failing_state {
        Some(comment) => {
            message.push_str(": ");
            message.push_str(&comment);
        }
        None => {
            if let Some(detail) = error_detail(&result.ret) {
                message.push_str(": ");
                message.push_str(&detail);
            }
        }
    }
    Verdict {
        status: ExecutionStatus::Failed,
        code: RESULT_REMOTE_ERROR,
        message,
    }
}

fn render_arg(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Comment of the first state entry that did not report `"result": true`
///
/// A state run that returned a list instead of a map failed to render; its
/// entries are the error strings.
fn first_failing_state(ret: &Value) -> Option<String> {
    match ret {
        Value::Object(states) => states.iter().find_map(|(id, state)| {
            if state.get("result").and_then(Value::as_bool) == Some(true) {
                return None;
            }
            let comment = state
                .get("comment")
                .map(render_arg)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| id.clone());
            Some(comment)
        }),
        Value::Array(errors) if !errors.is_empty() => {
            Some(errors.iter().map(render_arg).collect::<Vec<_>>().join("; "))
        }
        _ => None,
    }
}

fn error_detail(ret: &Value) -> Option<String> {
    match ret {
        Value::Null | Value::Bool(_) => None,
        Value::String(s) if s.is_empty() => None,
        other => Some(render_arg(other)),
    }
}

/// What happened to one execution record during a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Record was already Completed or Failed
    Skipped { action_id: ActionId, status: ExecutionStatus },
    /// Prerequisite is still Queued on this endpoint
    Held { action_id: ActionId, prerequisite: ActionId },
    PrerequisiteFailed { action_id: ActionId },
    RetriesExhausted { action_id: ActionId },
    Completed { action_id: ActionId, remaining_tries: u32 },
    Failed { action_id: ActionId, remaining_tries: u32, message: String },
    /// The call went through but returned nothing
    NoResult { action_id: ActionId, remaining_tries: u32 },
    /// Per-record error; the record keeps its status
    Error { action_id: ActionId, error: String },
}

impl RecordOutcome {
    pub fn action_id(&self) -> ActionId {
        match self {
            Self::Skipped { action_id, .. }
            | Self::Held { action_id, .. }
            | Self::PrerequisiteFailed { action_id }
            | Self::RetriesExhausted { action_id }
            | Self::Completed { action_id, .. }
            | Self::Failed { action_id, .. }
            | Self::NoResult { action_id, .. }
            | Self::Error { action_id, .. } => *action_id,
        }
    }

    /// Short label for terminal output
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Held { .. } => "held",
            Self::PrerequisiteFailed { .. } => "prerequisite-failed",
            Self::RetriesExhausted { .. } => "retries-exhausted",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::NoResult { .. } => "no-result",
            Self::Error { .. } => "error",
        }
    }
}

/// Result of the standalone liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Endpoint answered; a check-in was recorded
    Alive,
    /// No positive answer
    Silent,
    Unreachable(String),
}

/// Summary of one dispatch cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<RecordOutcome>,

    /// Id of the synthesized package-list refresh action, if one ran
    pub checkpoint: Option<ActionId>,

    pub probe: Option<ProbeOutcome>,

    /// Remote invocations issued, excluding the probe
    pub remote_calls: usize,

    /// Records left in the backlog because they are not yet due
    pub deferred: usize,
}

impl CycleReport {
    pub fn new(endpoint: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::now_v7(),
            endpoint: endpoint.into(),
            started_at,
            outcomes: Vec::new(),
            checkpoint: None,
            probe: None,
            remote_calls: 0,
            deferred: 0,
        }
    }

    /// Whether any due record was dequeued this cycle, with or without a call
    pub fn visited_any(&self) -> bool {
        !self.outcomes.is_empty()
    }

    pub fn outcome_for(&self, action_id: ActionId) -> Option<&RecordOutcome> {
        self.outcomes.iter().find(|o| o.action_id() == action_id)
    }
}
