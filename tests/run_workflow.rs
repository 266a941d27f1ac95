//! End-to-end runs over a real libSQL store with a canned LLM.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;

use proposal_pilot::admission::{Action, Policy};
use proposal_pilot::composer::DraftComposer;
use proposal_pilot::error::LlmError;
use proposal_pilot::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use proposal_pilot::opportunities::{Budget, Counterpart, DispatchState, Opportunity, ProcessingStatus};
use proposal_pilot::scheduler::{BatchScheduler, CancelSignal, RunOptions, alert_channel};
use proposal_pilot::store::{
    BacklogQuery, LibSqlBackend, OpportunityStore, OutcomeStatus, QuotaStore, RunLog, RunOutcome,
    SubmissionStore,
};

struct CannedLlm {
    calls: AtomicUsize,
    delay: Duration,
}

impl CannedLlm {
    fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl LlmProvider for CannedLlm {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(CompletionResponse {
            content: "I understand your goals. My solution is a typed react dashboard, \
                      and the result is a faster team."
                .into(),
            input_tokens: 10,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

fn scheduler(store: Arc<LibSqlBackend>, llm: Arc<CannedLlm>) -> BatchScheduler {
    let composer = Arc::new(DraftComposer::new(
        llm,
        store.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    BatchScheduler::new(store, composer, "acme", "alice", Duration::from_secs(5))
}

fn promising(id: &str) -> Opportunity {
    Opportunity::new(id, "acme", format!("React dashboard {id}"), "Typed dashboard rebuild")
        .with_budget(Budget::usd(dec!(6000)))
        .with_skills(["react", "typescript"])
        .with_counterpart(Counterpart {
            rating: 4.9,
            total_spent: dec!(50000),
            verified: true,
            competing_bids: 2,
        })
        .with_quality_score(85.0)
}

fn policy() -> Policy {
    Policy {
        preferred_skills: vec!["react".into(), "typescript".into()],
        ..Policy::default()
    }
}

#[tokio::test]
async fn full_run_then_idempotent_rerun() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let llm = CannedLlm::new();
    let (tx, mut rx) = alert_channel(16);
    let scheduler = scheduler(store.clone(), llm.clone()).with_alerts(tx);

    store.upsert_opportunity(&promising("p1")).await.unwrap();
    store
        .upsert_opportunity(&Opportunity::new("junk", "acme", "Quick thing", "asap"))
        .await
        .unwrap();

    let options = RunOptions {
        auto_process: true,
        ..RunOptions::default()
    };
    let cancel = CancelSignal::new();

    let first = scheduler.execute_run(&policy(), &options, &cancel).await.unwrap();
    assert_eq!(first.items_processed, 2);
    assert_eq!(first.drafts_generated, 1);
    assert!(first.errors.is_empty());
    assert!(!first.cancelled);

    let alert = rx.try_recv().expect("high-value alert");
    assert_eq!(alert.opportunity_id, "p1");

    let p1 = store.fetch_by_id("acme", "p1").await.unwrap().unwrap();
    assert_eq!(p1.status, ProcessingStatus::Processed);
    let draft_id = match p1.processing.as_ref().map(|m| &m.dispatch) {
        Some(DispatchState::Dispatched { draft_id }) => draft_id.clone(),
        other => panic!("expected a dispatched draft, got {other:?}"),
    };

    let junk = store.fetch_by_id("acme", "junk").await.unwrap().unwrap();
    assert_eq!(junk.processing.unwrap().action, Action::Skip);

    let second = scheduler.execute_run(&policy(), &options, &cancel).await.unwrap();
    assert_eq!(second.items_processed, 0);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    let runs = store.recent_runs("acme", 5).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.outcome == RunOutcome::Completed));

    // A won draft becomes history for the next composition.
    store.update_outcome(&draft_id, OutcomeStatus::Won).await.unwrap();
    let won = store.fetch_terminal_won("alice", 10).await.unwrap();
    assert_eq!(won.len(), 1);
    assert_eq!(won[0].opportunity_id, "p1");
}

#[tokio::test]
async fn deferred_run_leaves_no_drafts() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let llm = CannedLlm::new();
    let scheduler = scheduler(store.clone(), llm.clone());
    store.upsert_opportunity(&promising("p1")).await.unwrap();

    let summary = scheduler
        .execute_run(&policy(), &RunOptions::default(), &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.drafts_generated, 0);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    let p1 = store.fetch_by_id("acme", "p1").await.unwrap().unwrap();
    assert_eq!(p1.processing.unwrap().dispatch, DispatchState::Deferred);
    assert_eq!(
        store.count_today("acme", "alice", Utc::now().date_naive()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn concurrent_runs_share_the_quota() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LibSqlBackend::new_local(&dir.path().join("pilot.db")).await.unwrap());
    let llm = CannedLlm::new();
    for i in 0..6 {
        store.upsert_opportunity(&promising(&format!("p{i}"))).await.unwrap();
    }

    let capped = Arc::new(Policy {
        daily_quota_cap: 3,
        ..policy()
    });
    let options = RunOptions {
        auto_process: true,
        ..RunOptions::default()
    };

    let mut handles = Vec::new();
    for _ in 0..2 {
        let s = scheduler(store.clone(), llm.clone());
        let policy = capped.clone();
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            s.execute_run(&policy, &options, &CancelSignal::new()).await.unwrap()
        }));
    }

    let mut processed = 0;
    let mut drafts = 0;
    for handle in handles {
        let summary = handle.await.unwrap();
        processed += summary.items_processed;
        drafts += summary.drafts_generated;
    }

    assert_eq!(processed, 6);
    assert!(drafts <= 3);
    assert_eq!(
        store.count_today("acme", "alice", Utc::now().date_naive()).await.unwrap(),
        3
    );
    let backlog = store
        .fetch_unprocessed(
            "acme",
            BacklogQuery {
                limit: 10,
                retry_below_attempts: None,
                reclaim_before: None,
            },
        )
        .await
        .unwrap();
    assert!(backlog.is_empty());

    let mut stored = 0;
    for i in 0..6 {
        let drafts = store.fetch_for_opportunity(&format!("p{i}")).await.unwrap();
        assert!(drafts.len() <= 1, "p{i} has {} drafts", drafts.len());
        stored += drafts.len();
    }
    assert_eq!(stored as u32, drafts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_runs_draft_an_opportunity_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LibSqlBackend::new_local(&dir.path().join("pilot.db")).await.unwrap());
    let llm = CannedLlm::slow(Duration::from_millis(200));
    store.upsert_opportunity(&promising("p0")).await.unwrap();

    let options = RunOptions {
        auto_process: true,
        ..RunOptions::default()
    };
    let mut handles = Vec::new();
    for _ in 0..2 {
        let s = scheduler(store.clone(), llm.clone());
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            s.execute_run(&policy(), &options, &CancelSignal::new()).await.unwrap()
        }));
    }

    let mut drafts = 0;
    let mut processed = 0;
    for handle in handles {
        let summary = handle.await.unwrap();
        drafts += summary.drafts_generated;
        processed += summary.items_processed;
    }

    assert_eq!(drafts, 1);
    assert_eq!(processed, 1);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.fetch_for_opportunity("p0").await.unwrap().len(), 1);
    assert_eq!(
        store.count_today("acme", "alice", Utc::now().date_naive()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn cancelled_run_stops_before_work() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let llm = CannedLlm::new();
    let scheduler = scheduler(store.clone(), llm);
    store.upsert_opportunity(&promising("p1")).await.unwrap();

    let cancel = CancelSignal::new();
    cancel.cancel();
    let summary = scheduler
        .execute_run(&policy(), &RunOptions::default(), &cancel)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.items_processed, 0);
    let runs = store.recent_runs("acme", 1).await.unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Cancelled);
}
