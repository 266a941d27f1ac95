//! Store traits: the contracts the core needs from persistence.
//!
//! One trait per external store, plus `PilotStore` which bundles them so the
//! scheduler can hold a single `Arc<dyn PilotStore>`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::opportunities::{Opportunity, ProcessingMetadata};

/// Outcome status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Draft,
    Submitted,
    Viewed,
    Interview,
    Won,
    Declined,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Viewed => "viewed",
            Self::Interview => "interview",
            Self::Won => "won",
            Self::Declined => "declined",
        }
    }
}

impl std::str::FromStr for OutcomeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "submitted" => Ok(Self::Submitted),
            "viewed" => Ok(Self::Viewed),
            "interview" => Ok(Self::Interview),
            "won" => Ok(Self::Won),
            "declined" => Ok(Self::Declined),
            _ => Err(format!("Unknown outcome status: {}", s)),
        }
    }
}

/// A historical draft and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub opportunity_id: String,
    pub text: String,
    pub status: OutcomeStatus,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown run outcome: {}", s)),
        }
    }
}

/// One entry in the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Serialized `RunSummary`, or the fatal error for failed runs.
    pub summary: serde_json::Value,
}

/// Which items the backlog query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogQuery {
    pub limit: usize,
    /// When set, items whose dispatch failed are returned again while their
    /// attempt count is below this cap.
    pub retry_below_attempts: Option<u32>,
    /// When set, items claimed before this instant are treated as abandoned
    /// and returned again.
    pub reclaim_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Pending items for a tenant, newest ingestion first.
    async fn fetch_unprocessed(
        &self,
        tenant_id: &str,
        query: BacklogQuery,
    ) -> Result<Vec<Opportunity>, DatabaseError>;

    async fn fetch_by_id(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<Opportunity>, DatabaseError>;

    /// Atomically take an item for processing. Succeeds for unprocessed and
    /// failed-dispatch items, and for items whose claim is older than
    /// `reclaim_before`. Returns false when another run holds or finished it.
    async fn claim(
        &self,
        tenant_id: &str,
        id: &str,
        reclaim_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Hand a claimed item back without recording a decision.
    async fn release_claim(&self, id: &str) -> Result<(), DatabaseError>;

    /// Attach decision metadata. Returns false if the item was already
    /// processed (a concurrent run got there first) or does not exist.
    async fn mark_processed(
        &self,
        id: &str,
        metadata: &ProcessingMetadata,
    ) -> Result<bool, DatabaseError>;

    /// Insert an opportunity, or refresh its content fields if it exists.
    /// Processing state of an existing row is left alone.
    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Most recent submissions with outcome `won`.
    async fn fetch_terminal_won(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SubmissionRecord>, DatabaseError>;

    /// Store a new draft in `draft` status. Returns its id.
    async fn insert_draft(
        &self,
        tenant_id: &str,
        user_id: &str,
        opportunity_id: &str,
        text: &str,
        metadata: &serde_json::Value,
    ) -> Result<String, DatabaseError>;

    /// Every stored submission for an opportunity, oldest first.
    async fn fetch_for_opportunity(
        &self,
        opportunity_id: &str,
    ) -> Result<Vec<SubmissionRecord>, DatabaseError>;

    /// External outcome update.
    async fn update_outcome(&self, id: &str, status: OutcomeStatus) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Quota consumed by a (tenant, user) on a UTC day.
    async fn count_today(
        &self,
        tenant_id: &str,
        user_id: &str,
        day: NaiveDate,
    ) -> Result<u32, DatabaseError>;

    /// Atomically consume one unit if the count is below `cap`.
    /// Returns false when the cap is already reached.
    async fn try_consume(
        &self,
        tenant_id: &str,
        user_id: &str,
        day: NaiveDate,
        cap: u32,
    ) -> Result<bool, DatabaseError>;

    /// Give back one unit consumed earlier the same day. Never goes below zero.
    async fn release(
        &self,
        tenant_id: &str,
        user_id: &str,
        day: NaiveDate,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait RunLog: Send + Sync {
    async fn record_run(&self, run: &RunRecord) -> Result<(), DatabaseError>;

    /// Most recent runs for a tenant, newest first.
    async fn recent_runs(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>, DatabaseError>;
}

/// Everything the scheduler needs from persistence.
pub trait PilotStore: OpportunityStore + SubmissionStore + QuotaStore + RunLog {}

impl<T> PilotStore for T where T: OpportunityStore + SubmissionStore + QuotaStore + RunLog {}
