//! High-value opportunity alerts.
//!
//! The scheduler pushes alerts onto a bounded mpsc channel and never waits on
//! it; a full or closed channel drops the alert with a warning.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::admission::Action;

/// Weighted score at or above which an opportunity counts as high value.
pub const HIGH_VALUE_SCORE: f64 = 80.0;

/// An opportunity that scored high enough to be worth a human look.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighValueAlert {
    pub tenant_id: String,
    pub user_id: String,
    pub opportunity_id: String,
    pub title: String,
    pub score: f64,
    pub action: Action,
}

/// Create an alert channel.
pub fn alert_channel(capacity: usize) -> (mpsc::Sender<HighValueAlert>, mpsc::Receiver<HighValueAlert>) {
    mpsc::channel(capacity)
}

/// Send without blocking the run.
pub(crate) fn publish(tx: &mpsc::Sender<HighValueAlert>, alert: HighValueAlert) {
    if let Err(e) = tx.try_send(alert) {
        warn!("Dropping high-value alert: {e}");
    }
}

/// Drain alerts into the log until every sender is dropped.
pub fn spawn_alert_logger(mut rx: mpsc::Receiver<HighValueAlert>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            info!(
                tenant_id = %alert.tenant_id,
                opportunity_id = %alert.opportunity_id,
                score = alert.score,
                action = alert.action.label(),
                "High-value opportunity: {}",
                alert.title
            );
        }
    })
}
