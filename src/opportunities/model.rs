//! Opportunity data model: budgets, counterpart info, and processing metadata.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::admission::Action;

/// A posted budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub amount: Decimal,
    pub currency: String,
}

impl Budget {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    /// Budget in US dollars.
    pub fn usd(amount: Decimal) -> Self {
        Self::new(amount, "USD")
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Information about the party that posted the opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterpart {
    /// Rating on a 0–5 scale.
    pub rating: f64,
    /// Total historical spend on the platform.
    pub total_spent: Decimal,
    pub verified: bool,
    /// Number of proposals already submitted by others.
    pub competing_bids: u32,
}

impl Default for Counterpart {
    fn default() -> Self {
        Self {
            rating: 0.0,
            total_spent: Decimal::ZERO,
            verified: false,
            competing_bids: 0,
        }
    }
}

/// Processing status of an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Not yet decided on.
    Unprocessed,
    /// Claimed by a run that is deciding or dispatching it.
    InProgress,
    /// Decided, and any required action was dispatched.
    Processed,
    /// Decided, but dispatching the action failed. Retryable.
    DispatchFailed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unprocessed => write!(f, "unprocessed"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Processed => write!(f, "processed"),
            Self::DispatchFailed => write!(f, "dispatch_failed"),
        }
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprocessed" => Ok(Self::Unprocessed),
            "in_progress" => Ok(Self::InProgress),
            "processed" => Ok(Self::Processed),
            "dispatch_failed" => Ok(Self::DispatchFailed),
            _ => Err(format!("Unknown processing status: {}", s)),
        }
    }
}

/// Outcome of dispatching a decision's action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    /// SKIP needs no action.
    NotRequired,
    /// The run was not asked to act (auto-processing off).
    Deferred,
    /// A draft was generated and stored.
    Dispatched { draft_id: String },
    /// Drafting or storing failed; the item stays in the retry backlog.
    Failed { error: String },
}

impl DispatchState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Summary of a decision, persisted onto the opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub action: Action,
    pub confidence: f64,
    pub score: f64,
    pub reasoning: Vec<String>,
    pub processed_at: DateTime<Utc>,
    pub dispatch: DispatchState,
}

impl ProcessingMetadata {
    /// Status the opportunity should be stored with.
    pub fn status(&self) -> ProcessingStatus {
        if self.dispatch.is_failed() {
            ProcessingStatus::DispatchFailed
        } else {
            ProcessingStatus::Processed
        }
    }
}

/// One discoverable work item eligible for a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub description: String,
    pub budget: Option<Budget>,
    pub skills: BTreeSet<String>,
    pub counterpart: Counterpart,
    /// Upstream quality score, 0–100. Opaque to the pilot.
    pub base_quality_score: f64,
    pub status: ProcessingStatus,
    pub processing: Option<ProcessingMetadata>,
    pub dispatch_attempts: u32,
    pub ingested_at: DateTime<Utc>,
}

impl Opportunity {
    /// Create an unprocessed opportunity with no budget, skills, or counterpart data.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            title: title.into(),
            description: description.into(),
            budget: None,
            skills: BTreeSet::new(),
            counterpart: Counterpart::default(),
            base_quality_score: 0.0,
            status: ProcessingStatus::Unprocessed,
            processing: None,
            dispatch_attempts: 0,
            ingested_at: Utc::now(),
        }
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_counterpart(mut self, counterpart: Counterpart) -> Self {
        self.counterpart = counterpart;
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.base_quality_score = score;
        self
    }

    pub fn with_ingested_at(mut self, at: DateTime<Utc>) -> Self {
        self.ingested_at = at;
        self
    }

    /// Whether this opportunity still needs a decision or a dispatch retry.
    pub fn is_pending(&self) -> bool {
        self.status != ProcessingStatus::Processed
    }
}
