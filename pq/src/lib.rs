//! pushqueue - per-endpoint remote execution queue
//!
//! pushqueue drives scheduled actions (package installs, state runs,
//! check-ins) out to managed endpoints over a remote call channel. Every
//! action has a schedule time, an optional prerequisite and a retry budget;
//! each endpoint is serviced by at most one dispatcher at a time.
//!
//! # Core Concepts
//!
//! - **Execution records**: one per (action, endpoint), Queued until it
//!   reaches Completed or Failed, never re-queued
//! - **Cycles**: a dispatcher drains an endpoint's due backlog in schedule
//!   order, then runs a package-list refresh or a liveness probe
//! - **Scoped transactions**: no store transaction is open while a remote call
//!   is in flight
//! - **Bounded pool**: the scheduler caps concurrent cycles and coalesces
//!   duplicate requests for a busy endpoint into one rerun
//!
//! # Modules
//!
//! - [`domain`] - Actions, execution records, endpoints
//! - [`store`] - Transactional storage (SQLite and in-memory)
//! - [`queue`] - Per-endpoint ordered backlog
//! - [`channel`] - Remote call channel trait and subprocess implementation
//! - [`dispatch`] - Dispatch cycle state machine
//! - [`scheduler`] - Worker pool and poller
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod queue;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use channel::{CommandChannel, CommandChannelConfig, RemoteCallChannel, StructuredResult, TransportError};
pub use config::Config;
pub use dispatch::{
    CycleReport, DefaultRefreshClassifier, DispatchError, ProbeOutcome, RecordOutcome, RefreshClassifier,
    TaskDispatcher,
};
pub use domain::{
    Action, ActionId, Endpoint, ExecutionRecord, ExecutionStatus, NewAction, ProcedureDescriptor, TransitionError,
};
pub use queue::{EndpointQueue, PendingRecord};
pub use scheduler::{Poller, QueueState, ScheduleResult, SchedulerConfig, SchedulerStats, TaskScheduler};
pub use store::{ActionStore, MemoryStore, SqliteStore, StoreError, StoreResult, StoreTransaction};
