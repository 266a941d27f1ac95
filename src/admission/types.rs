//! Decision types produced by the admission engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::opportunities::{DispatchState, ProcessingMetadata};

/// What to do with an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Draft and submit without asking.
    AutoSubmit,
    /// Draft, then hold for human approval.
    RequestApproval,
    /// Do nothing.
    Skip,
}

impl Action {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AutoSubmit => "auto_submit",
            Self::RequestApproval => "request_approval",
            Self::Skip => "skip",
        }
    }

    /// Whether this action produces a draft when dispatched.
    pub fn drafts(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Component scores, each on a 0–100 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub budget_alignment: f64,
    pub counterpart_quality: f64,
    pub skills_match: f64,
    pub competition: f64,
}

/// Policy-dependent analysis of one opportunity, before the quota check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub sub_scores: SubScores,
    pub risk_factors: Vec<String>,
    /// Clamped to 0–100.
    pub weighted_score: f64,
    pub competing_bids: u32,
    pub verified: bool,
}

/// The engine's classification of one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub opportunity_id: String,
    pub action: Action,
    pub confidence: f64,
    pub weighted_score: f64,
    pub sub_scores: SubScores,
    pub reasoning: Vec<String>,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
    pub estimated_success_rate: f64,
    /// True when the daily quota short-circuited the threshold logic.
    pub quota_limited: bool,
}

impl Decision {
    /// Summary fields to persist onto the opportunity.
    pub fn to_metadata(&self, dispatch: DispatchState, at: DateTime<Utc>) -> ProcessingMetadata {
        ProcessingMetadata {
            action: self.action,
            confidence: self.confidence,
            score: self.weighted_score,
            reasoning: self.reasoning.clone(),
            processed_at: at,
            dispatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_screaming() {
        assert_eq!(
            serde_json::to_value(Action::RequestApproval).unwrap(),
            "REQUEST_APPROVAL"
        );
        let parsed: Action = serde_json::from_str("\"AUTO_SUBMIT\"").unwrap();
        assert_eq!(parsed, Action::AutoSubmit);
    }

    #[test]
    fn only_skip_does_not_draft() {
        assert!(Action::AutoSubmit.drafts());
        assert!(Action::RequestApproval.drafts());
        assert!(!Action::Skip.drafts());
    }
}
