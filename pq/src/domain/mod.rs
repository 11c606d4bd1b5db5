//! Domain types for pushqueue
//!
//! Core domain types: Action, ExecutionRecord, Endpoint.
//! Actions are created externally; the dispatcher only moves execution
//! records from Queued to a terminal status and touches endpoint flags.

mod action;
mod endpoint;
mod record;

pub use action::{Action, ActionId, NewAction, PACKAGE_REFRESH_NAME, PACKAGE_REFRESH_STATE, ProcedureDescriptor};
pub use endpoint::Endpoint;
pub use record::{
    ExecutionRecord, ExecutionStatus, MAX_RESULT_MSG_LEN, PREREQUISITE_FAILED_MSG, RESULT_PREREQUISITE_FAILED,
    RESULT_REMOTE_ERROR, RESULT_RETRIES_EXHAUSTED, RESULT_SUCCESS, RETRIES_EXHAUSTED_MSG, TransitionError,
};
