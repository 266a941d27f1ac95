//! Recurring runs on a cron schedule.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{error, info};

use crate::admission::Policy;
use crate::error::ConfigError;
use crate::scheduler::run::{BatchScheduler, CancelSignal, RunOptions};

/// Parse a cron expression (seconds field first, as the `cron` crate expects).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "PROPOSAL_PILOT_SCHEDULE".to_string(),
        message: format!("invalid cron: {e}"),
    })
}

/// Next fire time after now, if the schedule has one.
pub fn next_fire(schedule: &Schedule) -> Option<DateTime<Utc>> {
    schedule.upcoming(Utc).next()
}

/// Fire a run at every scheduled time until `cancel` is set or the schedule
/// runs out. A failed run is logged and the ticker keeps going.
pub fn spawn_scheduled_runs(
    scheduler: Arc<BatchScheduler>,
    schedule: Schedule,
    policy: Arc<Policy>,
    options: RunOptions,
    cancel: CancelSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = next_fire(&schedule) else {
                info!("Schedule has no further fire times, stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    info!("Ticker cancelled while waiting");
                    break;
                }
            }

            match scheduler.execute_run(&policy, &options, &cancel).await {
                Ok(summary) => info!(
                    tenant_id = scheduler.tenant_id(),
                    processed = summary.items_processed,
                    drafts = summary.drafts_generated,
                    errors = summary.errors.len(),
                    "Scheduled run complete"
                ),
                Err(e) => error!(tenant_id = scheduler.tenant_id(), "Scheduled run failed: {e}"),
            }

            if cancel.is_cancelled() {
                break;
            }
        }
    })
}
