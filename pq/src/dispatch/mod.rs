//! Per-endpoint dispatch
//!
//! A [`TaskDispatcher`] owns one endpoint for the duration of a cycle. It
//! drains the endpoint's backlog in schedule order, moves execution records
//! to a terminal status, and finishes with either a package-list refresh
//! checkpoint or a standalone liveness probe.

mod classify;
mod dispatcher;
mod outcome;

use thiserror::Error;

use crate::channel::TransportError;
use crate::domain::TransitionError;
use crate::store::StoreError;

pub use classify::{DefaultRefreshClassifier, PACKAGE_FUNCTIONS, PACKAGE_STATE_PREFIXES, RefreshClassifier};
pub use dispatcher::{DEFAULT_RETRIES, TaskDispatcher};
pub use outcome::{CycleReport, ProbeOutcome, RecordOutcome, Verdict, map_result};

/// Errors raised while dispatching
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),
}

impl DispatchError {
    /// Whether the error aborts the whole cycle rather than one record
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
