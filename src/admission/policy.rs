//! Admission policy: thresholds, quota, and filters for one tenant/user.
//!
//! A `Policy` is built once per run from `Policy::default()` plus an optional
//! `PolicyOverrides` layer, validated, and then never mutated.

use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::admission::Action;
use crate::error::PolicyError;

/// How much risk the user is willing to accept on auto-submitted work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Low,
    #[default]
    Medium,
    High,
}

/// Which actions count against the daily quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaConsumption {
    AutoSubmitOnly,
    #[default]
    AutoSubmitAndApproval,
}

impl QuotaConsumption {
    pub fn consumes(&self, action: Action) -> bool {
        match (self, action) {
            (_, Action::AutoSubmit) => true,
            (Self::AutoSubmitAndApproval, Action::RequestApproval) => true,
            _ => false,
        }
    }
}

/// Validated admission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub auto_submit_threshold: f64,
    pub approval_threshold: f64,
    pub skip_threshold: f64,
    pub daily_quota_cap: u32,
    pub min_budget: Decimal,
    pub max_budget: Decimal,
    pub client_rating_minimum: f64,
    /// Competing-bid count above which competition is a risk factor.
    pub competition_threshold: u32,
    pub preferred_skills: Vec<String>,
    pub excluded_keywords: Vec<String>,
    pub risk_tolerance: RiskTolerance,
    pub quota_consumption: QuotaConsumption,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            auto_submit_threshold: 85.0,
            approval_threshold: 65.0,
            skip_threshold: 40.0,
            daily_quota_cap: 10,
            min_budget: Decimal::from(500),
            max_budget: Decimal::from(50_000),
            client_rating_minimum: 4.0,
            competition_threshold: 20,
            preferred_skills: Vec::new(),
            excluded_keywords: Vec::new(),
            risk_tolerance: RiskTolerance::default(),
            quota_consumption: QuotaConsumption::default(),
        }
    }
}

/// Partial policy, as stored by the settings layer. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub auto_submit_threshold: Option<f64>,
    pub approval_threshold: Option<f64>,
    pub skip_threshold: Option<f64>,
    pub daily_quota_cap: Option<u32>,
    pub min_budget: Option<Decimal>,
    pub max_budget: Option<Decimal>,
    pub client_rating_minimum: Option<f64>,
    pub competition_threshold: Option<u32>,
    pub preferred_skills: Option<Vec<String>>,
    pub excluded_keywords: Option<Vec<String>>,
    pub risk_tolerance: Option<RiskTolerance>,
    pub quota_consumption: Option<QuotaConsumption>,
}

impl Policy {
    /// Merge overrides over the defaults and validate the result.
    pub fn from_overrides(overrides: PolicyOverrides) -> Result<Self, PolicyError> {
        let d = Self::default();
        let policy = Self {
            auto_submit_threshold: overrides
                .auto_submit_threshold
                .unwrap_or(d.auto_submit_threshold),
            approval_threshold: overrides.approval_threshold.unwrap_or(d.approval_threshold),
            skip_threshold: overrides.skip_threshold.unwrap_or(d.skip_threshold),
            daily_quota_cap: overrides.daily_quota_cap.unwrap_or(d.daily_quota_cap),
            min_budget: overrides.min_budget.unwrap_or(d.min_budget),
            max_budget: overrides.max_budget.unwrap_or(d.max_budget),
            client_rating_minimum: overrides
                .client_rating_minimum
                .unwrap_or(d.client_rating_minimum),
            competition_threshold: overrides
                .competition_threshold
                .unwrap_or(d.competition_threshold),
            preferred_skills: normalize_terms(
                overrides.preferred_skills.unwrap_or(d.preferred_skills),
            ),
            excluded_keywords: normalize_terms(
                overrides.excluded_keywords.unwrap_or(d.excluded_keywords),
            ),
            risk_tolerance: overrides.risk_tolerance.unwrap_or(d.risk_tolerance),
            quota_consumption: overrides.quota_consumption.unwrap_or(d.quota_consumption),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Parse a JSON overrides document and build a policy from it.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let overrides: PolicyOverrides =
            serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Self::from_overrides(overrides)
    }

    /// Load a JSON overrides file and build a policy from it.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (field, value) in [
            ("auto_submit_threshold", self.auto_submit_threshold),
            ("approval_threshold", self.approval_threshold),
            ("skip_threshold", self.skip_threshold),
        ] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside 0-100")));
            }
        }
        if self.approval_threshold > self.auto_submit_threshold {
            return Err(invalid(
                "approval_threshold",
                "must not exceed auto_submit_threshold".into(),
            ));
        }
        if self.skip_threshold > self.approval_threshold {
            return Err(invalid(
                "skip_threshold",
                "must not exceed approval_threshold".into(),
            ));
        }
        if self.min_budget > self.max_budget {
            return Err(invalid(
                "min_budget",
                format!("{} exceeds max_budget {}", self.min_budget, self.max_budget),
            ));
        }
        if !self.client_rating_minimum.is_finite()
            || !(0.0..=5.0).contains(&self.client_rating_minimum)
        {
            return Err(invalid(
                "client_rating_minimum",
                format!("{} is outside 0-5", self.client_rating_minimum),
            ));
        }
        Ok(())
    }

    /// Whether a decision with this action counts against the daily quota.
    pub fn consumes_quota(&self, action: Action) -> bool {
        self.quota_consumption.consumes(action)
    }
}

fn invalid(field: &str, reason: String) -> PolicyError {
    PolicyError::InvalidField {
        field: field.to_string(),
        reason,
    }
}

/// Trim entries and drop empty ones; an empty term would match everything.
fn normalize_terms(terms: Vec<String>) -> Vec<String> {
    terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_policy_is_valid() {
        assert!(Policy::default().validate().is_ok());
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let policy = Policy::from_json(
            r#"{"auto_submit_threshold": 90, "preferred_skills": ["rust", "  ", "tokio"]}"#,
        )
        .unwrap();
        assert_eq!(policy.auto_submit_threshold, 90.0);
        assert_eq!(policy.approval_threshold, 65.0);
        assert_eq!(policy.preferred_skills, vec!["rust", "tokio"]);
        assert_eq!(policy.min_budget, dec!(500));
    }

    #[test]
    fn budget_bounds_accept_strings_and_numbers() {
        let policy = Policy::from_json(r#"{"min_budget": "250.50", "max_budget": 1000}"#).unwrap();
        assert_eq!(policy.min_budget, dec!(250.50));
        assert_eq!(policy.max_budget, dec!(1000));
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let err = Policy::from_json(r#"{"approval_threshold": 95}"#).unwrap_err();
        assert!(err.to_string().contains("approval_threshold"));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        assert!(Policy::from_json(r#"{"auto_submit_threshold": 140}"#).is_err());
    }

    #[test]
    fn inverted_budget_rejected() {
        assert!(Policy::from_json(r#"{"min_budget": 9000, "max_budget": 100}"#).is_err());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            Policy::from_json("{not json"),
            Err(PolicyError::Parse(_))
        ));
    }

    #[test]
    fn quota_consumption_per_action() {
        let both = QuotaConsumption::AutoSubmitAndApproval;
        assert!(both.consumes(Action::AutoSubmit));
        assert!(both.consumes(Action::RequestApproval));
        assert!(!both.consumes(Action::Skip));

        let auto_only = QuotaConsumption::AutoSubmitOnly;
        assert!(auto_only.consumes(Action::AutoSubmit));
        assert!(!auto_only.consumes(Action::RequestApproval));
    }
}
