//! Batch scheduler: bounded runs over the opportunity backlog.
//!
//! - `run`: the run loop, `RunSummary`, cancellation
//! - `notify`: high-value alerts
//! - `ticker`: recurring runs on a cron schedule

pub mod notify;
pub mod run;
pub mod ticker;

pub use notify::{HIGH_VALUE_SCORE, HighValueAlert, alert_channel, spawn_alert_logger};
pub use run::{BatchScheduler, CancelSignal, ItemFailure, RunOptions, RunSummary};
pub use ticker::{parse_schedule, spawn_scheduled_runs};
