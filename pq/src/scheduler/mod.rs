//! Scheduler for dispatch cycles
//!
//! Bounds how many dispatch cycles run at once, keeps at most one dispatcher
//! per endpoint, and polls the store for endpoints with due work.

mod config;
mod core;
mod poller;
mod queue;

pub use config::SchedulerConfig;
pub use core::TaskScheduler;
pub use poller::Poller;
pub use queue::{QueueState, ScheduleResult, SchedulerStats};
