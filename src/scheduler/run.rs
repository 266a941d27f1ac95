//! Batch scheduler: drains the opportunity backlog one item at a time.
//!
//! Each item is decided by the admission engine, optionally dispatched to the
//! draft composer, and then marked processed with the decision attached.
//! Item failures land in `RunSummary::errors` and the run moves on; only a
//! failure to start (store unreachable, invalid policy) aborts a run.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{Action, Decision, Policy, decide, engine::QUOTA_REASON};
use crate::composer::DraftComposer;
use crate::error::{DatabaseError, EngineError, ItemError, RunError};
use crate::opportunities::{DispatchState, Opportunity};
use crate::scheduler::notify::{HIGH_VALUE_SCORE, HighValueAlert, publish};
use crate::store::{
    BacklogQuery, OpportunityStore, PilotStore, QuotaStore, RunLog, RunOutcome, RunRecord,
    SubmissionStore,
};

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_items: usize,
    /// Dispatch decisions (compose drafts). Off means decide and record only.
    pub auto_process: bool,
    pub notify_on_high_value: bool,
    /// Return failed dispatches to the backlog.
    pub retry_failed: bool,
    pub max_dispatch_attempts: u32,
    pub custom_instructions: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_items: 20,
            auto_process: false,
            notify_on_high_value: true,
            retry_failed: true,
            max_dispatch_attempts: 3,
            custom_instructions: None,
        }
    }
}

/// How long a claim protects an item before another run may take it over.
pub const CLAIM_TTL_MINUTES: i64 = 15;

/// Cooperative cancellation, checked before each item. Waiters parked in
/// `cancelled()` wake as soon as `cancel()` is called.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once `cancel()` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One failed item, with enough detail for a manual retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub opportunity_id: String,
    pub message: String,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub items_processed: u32,
    pub high_value_count: u32,
    pub drafts_generated: u32,
    pub auto_submit_count: u32,
    pub approval_request_count: u32,
    /// Items skipped because the daily quota was used up.
    pub quota_skipped_count: u32,
    pub errors: Vec<ItemFailure>,
    pub cancelled: bool,
}

impl RunSummary {
    fn record_failure(&mut self, opportunity_id: &str, message: impl Into<String>) {
        self.errors.push(ItemFailure {
            opportunity_id: opportunity_id.to_string(),
            message: message.into(),
        });
    }
}

/// Result of handling one item that did not raise.
struct ItemOutcome {
    decision: Decision,
    dispatch: DispatchState,
    /// False when a concurrent run marked the item first.
    marked: bool,
}

/// Drives runs for one (tenant, user).
pub struct BatchScheduler {
    store: Arc<dyn PilotStore>,
    composer: Arc<DraftComposer>,
    tenant_id: String,
    user_id: String,
    store_timeout: Duration,
    alerts: Option<mpsc::Sender<HighValueAlert>>,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn PilotStore>,
        composer: Arc<DraftComposer>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            composer,
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            store_timeout,
            alerts: None,
        }
    }

    /// Send high-value alerts to `tx` when a run asks for them.
    pub fn with_alerts(mut self, tx: mpsc::Sender<HighValueAlert>) -> Self {
        self.alerts = Some(tx);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Run over up to `options.max_items` pending opportunities.
    pub async fn execute_run(
        &self,
        policy: &Policy,
        options: &RunOptions,
        cancel: &CancelSignal,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let result = self.drain_backlog(run_id, policy, options, cancel).await;
        self.log_run(run_id, started_at, &result).await;
        result
    }

    async fn drain_backlog(
        &self,
        run_id: Uuid,
        policy: &Policy,
        options: &RunOptions,
        cancel: &CancelSignal,
    ) -> Result<RunSummary, RunError> {
        policy.validate()?;

        let query = BacklogQuery {
            limit: options.max_items,
            retry_below_attempts: options.retry_failed.then_some(options.max_dispatch_attempts),
            reclaim_before: Some(claim_cutoff()),
        };
        let backlog = match tokio::time::timeout(
            self.store_timeout,
            self.store.fetch_unprocessed(&self.tenant_id, query),
        )
        .await
        {
            Ok(Ok(items)) => items,
            Ok(Err(source)) => {
                return Err(RunError::StoreUnavailable {
                    operation: "fetch_unprocessed",
                    source,
                });
            }
            Err(_) => {
                return Err(RunError::StoreTimeout {
                    operation: "fetch_unprocessed",
                    timeout: self.store_timeout,
                });
            }
        };

        info!(
            %run_id,
            tenant_id = %self.tenant_id,
            backlog = backlog.len(),
            auto_process = options.auto_process,
            "Run started"
        );

        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();
        for opportunity in &backlog {
            if cancel.is_cancelled() {
                info!(%run_id, "Run cancelled, returning partial summary");
                summary.cancelled = true;
                break;
            }
            if !seen.insert(opportunity.id.as_str()) {
                continue;
            }
            self.run_item(opportunity, policy, options, &mut summary).await;
        }

        info!(
            %run_id,
            processed = summary.items_processed,
            drafts = summary.drafts_generated,
            errors = summary.errors.len(),
            "Run finished"
        );
        Ok(summary)
    }

    /// Re-evaluate a single opportunity by id.
    pub async fn process_one(
        &self,
        opportunity_id: &str,
        policy: &Policy,
        options: &RunOptions,
    ) -> Result<RunSummary, RunError> {
        policy.validate()?;

        let found = match tokio::time::timeout(
            self.store_timeout,
            self.store.fetch_by_id(&self.tenant_id, opportunity_id),
        )
        .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(source)) => {
                return Err(RunError::StoreUnavailable {
                    operation: "fetch_by_id",
                    source,
                });
            }
            Err(_) => {
                return Err(RunError::StoreTimeout {
                    operation: "fetch_by_id",
                    timeout: self.store_timeout,
                });
            }
        };

        let mut summary = RunSummary::default();
        match found {
            None => {
                let err = ItemError::Engine(EngineError::NotFound {
                    id: opportunity_id.to_string(),
                });
                summary.record_failure(opportunity_id, err.to_string());
            }
            Some(opportunity) if !opportunity.is_pending() => {
                info!(opportunity_id, "Already processed, nothing to do");
            }
            Some(opportunity) => {
                self.run_item(&opportunity, policy, options, &mut summary)
                    .await;
            }
        }
        Ok(summary)
    }

    /// Handle one item and fold the result into `summary`.
    async fn run_item(
        &self,
        opportunity: &Opportunity,
        policy: &Policy,
        options: &RunOptions,
        summary: &mut RunSummary,
    ) {
        match self.process_item(opportunity, policy, options).await {
            Ok(None) => {
                debug!(opportunity_id = %opportunity.id, "Claimed by another run, skipping");
            }
            Ok(Some(outcome)) => {
                let decision = &outcome.decision;
                if decision.weighted_score >= HIGH_VALUE_SCORE {
                    summary.high_value_count += 1;
                }
                if decision.quota_limited {
                    summary.quota_skipped_count += 1;
                }
                match &outcome.dispatch {
                    DispatchState::Dispatched { .. } => {
                        summary.drafts_generated += 1;
                        match decision.action {
                            Action::AutoSubmit => summary.auto_submit_count += 1,
                            Action::RequestApproval => summary.approval_request_count += 1,
                            Action::Skip => {}
                        }
                    }
                    DispatchState::Failed { error } => {
                        summary.record_failure(&opportunity.id, error.clone());
                    }
                    DispatchState::NotRequired | DispatchState::Deferred => {}
                }
                if outcome.marked {
                    summary.items_processed += 1;
                }
            }
            Err(e) => {
                warn!(opportunity_id = %opportunity.id, error = %e, "Item failed");
                summary.record_failure(&opportunity.id, e.to_string());
            }
        }
    }

    /// Claim, decide, dispatch, and mark one item. `None` means another run
    /// holds the claim.
    async fn process_item(
        &self,
        opportunity: &Opportunity,
        policy: &Policy,
        options: &RunOptions,
    ) -> Result<Option<ItemOutcome>, ItemError> {
        let claimed = self
            .store_call(
                "claim",
                self.store
                    .claim(&self.tenant_id, &opportunity.id, claim_cutoff()),
            )
            .await?;
        if !claimed {
            return Ok(None);
        }

        match self.decide_and_dispatch(opportunity, policy, options).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                // Undecided items go back to the backlog for the next run.
                if let Err(release_err) = self
                    .store_call("release_claim", self.store.release_claim(&opportunity.id))
                    .await
                {
                    warn!(
                        opportunity_id = %opportunity.id,
                        error = %release_err,
                        "Failed to release claim"
                    );
                }
                Err(e)
            }
        }
    }

    async fn decide_and_dispatch(
        &self,
        opportunity: &Opportunity,
        policy: &Policy,
        options: &RunOptions,
    ) -> Result<ItemOutcome, ItemError> {
        let today = Utc::now().date_naive();
        let used = self
            .store_call(
                "count_today",
                self.store.count_today(&self.tenant_id, &self.user_id, today),
            )
            .await?;

        let mut decision = decide(opportunity, policy, used)?;
        info!(
            opportunity_id = %opportunity.id,
            action = decision.action.label(),
            score = decision.weighted_score,
            confidence = decision.confidence,
            "Decision made"
        );

        if options.notify_on_high_value && decision.weighted_score >= HIGH_VALUE_SCORE {
            if let Some(tx) = &self.alerts {
                publish(
                    tx,
                    HighValueAlert {
                        tenant_id: self.tenant_id.clone(),
                        user_id: self.user_id.clone(),
                        opportunity_id: opportunity.id.clone(),
                        title: opportunity.title.clone(),
                        score: decision.weighted_score,
                        action: decision.action,
                    },
                );
            }
        }

        let dispatch = if !decision.action.drafts() {
            DispatchState::NotRequired
        } else if !options.auto_process {
            DispatchState::Deferred
        } else {
            self.dispatch(opportunity, policy, options, &mut decision, today)
                .await
        };

        let metadata = decision.to_metadata(dispatch.clone(), Utc::now());
        let marked = self
            .store_call(
                "mark_processed",
                self.store.mark_processed(&opportunity.id, &metadata),
            )
            .await?;
        if !marked {
            warn!(opportunity_id = %opportunity.id, "Already marked by a concurrent run");
        }

        Ok(ItemOutcome {
            decision,
            dispatch,
            marked,
        })
    }

    /// Compose, consume quota, and store the draft.
    ///
    /// Every failure from composition onward becomes `DispatchState::Failed`, so the
    /// item is still marked and stays retryable. Quota spent on a draft that
    /// could not be stored is given back. Losing the quota race downgrades
    /// the decision to SKIP and discards the draft.
    async fn dispatch(
        &self,
        opportunity: &Opportunity,
        policy: &Policy,
        options: &RunOptions,
        decision: &mut Decision,
        today: chrono::NaiveDate,
    ) -> DispatchState {
        let composed = match self
            .composer
            .compose(
                opportunity,
                &self.user_id,
                options.custom_instructions.as_deref(),
            )
            .await
        {
            Ok(composed) => composed,
            Err(e) => return dispatch_failed(opportunity, ItemError::from(e)),
        };

        let consumes = policy.consumes_quota(decision.action);
        if consumes {
            let granted = self
                .store_call(
                    "try_consume",
                    self.store.try_consume(
                        &self.tenant_id,
                        &self.user_id,
                        today,
                        policy.daily_quota_cap,
                    ),
                )
                .await;
            match granted {
                Ok(true) => {}
                Ok(false) => {
                    debug!(opportunity_id = %opportunity.id, "Quota exhausted during dispatch");
                    downgrade_for_quota(decision);
                    return DispatchState::NotRequired;
                }
                Err(e) => return dispatch_failed(opportunity, e),
            }
        }

        let metadata = composed.metadata(decision.action, self.composer.model_name());
        let stored = self
            .store_call(
                "insert_draft",
                self.store.insert_draft(
                    &self.tenant_id,
                    &self.user_id,
                    &opportunity.id,
                    &composed.draft,
                    &metadata,
                ),
            )
            .await;
        match stored {
            Ok(draft_id) => DispatchState::Dispatched { draft_id },
            Err(e) => {
                if consumes {
                    self.refund_quota(&opportunity.id, today).await;
                }
                dispatch_failed(opportunity, e)
            }
        }
    }

    async fn refund_quota(&self, opportunity_id: &str, today: chrono::NaiveDate) {
        let released = self
            .store_call(
                "release_quota",
                self.store.release(&self.tenant_id, &self.user_id, today),
            )
            .await;
        if let Err(e) = released {
            warn!(opportunity_id, error = %e, "Failed to give back quota");
        }
    }

    /// Await a store call under the per-call timeout.
    async fn store_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, ItemError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ItemError::Store { operation, source }),
            Err(_) => Err(ItemError::StoreTimeout {
                operation,
                timeout: self.store_timeout,
            }),
        }
    }

    async fn log_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        result: &Result<RunSummary, RunError>,
    ) {
        let (outcome, summary) = match result {
            Ok(s) if s.cancelled => (
                RunOutcome::Cancelled,
                serde_json::to_value(s).unwrap_or_default(),
            ),
            Ok(s) => (
                RunOutcome::Completed,
                serde_json::to_value(s).unwrap_or_default(),
            ),
            Err(e) => (
                RunOutcome::Failed,
                serde_json::json!({ "error": e.to_string() }),
            ),
        };
        let record = RunRecord {
            id: run_id,
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            summary,
        };
        match tokio::time::timeout(self.store_timeout, self.store.record_run(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%run_id, "Failed to record run: {e}"),
            Err(_) => warn!(%run_id, "Recording run timed out"),
        }
    }
}

fn claim_cutoff() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(CLAIM_TTL_MINUTES)
}

fn dispatch_failed(opportunity: &Opportunity, error: ItemError) -> DispatchState {
    warn!(opportunity_id = %opportunity.id, error = %error, "Dispatch failed");
    DispatchState::Failed {
        error: error.to_string(),
    }
}

fn downgrade_for_quota(decision: &mut Decision) {
    decision.action = Action::Skip;
    decision.confidence = 100.0;
    decision.reasoning = vec![QUOTA_REASON.to_string()];
    decision.quota_limited = true;
}
