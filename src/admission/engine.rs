//! Admission control engine: scores one opportunity and picks an action.
//!
//! `decide()` is pure apart from the quota count the caller passes in:
//! 1. `analyze()` computes sub-scores, risk factors, and the weighted score
//! 2. `classify()` applies the quota short-circuit, then the thresholds

use tracing::debug;

use crate::admission::policy::{Policy, RiskTolerance};
use crate::admission::types::{Action, Analysis, Decision, SubScores};
use crate::error::EngineError;
use crate::opportunities::Opportunity;

const WEIGHT_BASE_QUALITY: f64 = 0.30;
const WEIGHT_COUNTERPART: f64 = 0.25;
const WEIGHT_BUDGET: f64 = 0.20;
const WEIGHT_SKILLS: f64 = 0.15;
const WEIGHT_COMPETITION: f64 = 0.10;

/// Score deducted per risk factor.
const RISK_PENALTY: f64 = 5.0;

const BUDGET_BELOW_MIN: f64 = 20.0;
const BUDGET_ABOVE_MAX: f64 = 60.0;
const BUDGET_IN_RANGE: f64 = 90.0;

/// Competition score lost per competing bid.
const COMPETITION_PER_BID: f64 = 3.0;

/// Auto-submit tolerates at most this many risk factors.
const MAX_AUTO_SUBMIT_RISKS: usize = 1;

/// Reasoning emitted when the daily quota blocks a decision.
pub const QUOTA_REASON: &str = "daily limit reached";

/// Score and classify one opportunity.
pub fn decide(
    opportunity: &Opportunity,
    policy: &Policy,
    quota_count_today: u32,
) -> Result<Decision, EngineError> {
    let analysis = analyze(opportunity, policy)?;
    let decision = classify(&opportunity.id, &analysis, policy, quota_count_today);
    debug!(
        opportunity_id = %opportunity.id,
        action = decision.action.label(),
        score = decision.weighted_score,
        risks = decision.risk_factors.len(),
        "Admission decision"
    );
    Ok(decision)
}

/// Compute sub-scores, risk factors, and the clamped weighted score.
pub fn analyze(opportunity: &Opportunity, policy: &Policy) -> Result<Analysis, EngineError> {
    validate(opportunity)?;

    let counterpart = &opportunity.counterpart;
    let sub_scores = SubScores {
        budget_alignment: budget_alignment(opportunity, policy),
        counterpart_quality: (counterpart.rating * 20.0).clamp(0.0, 100.0),
        skills_match: skills_match(opportunity, policy),
        competition: (100.0 - counterpart.competing_bids as f64 * COMPETITION_PER_BID).max(0.0),
    };

    let risk_factors = risk_factors(opportunity, policy);
    let base = opportunity.base_quality_score.clamp(0.0, 100.0);

    let raw = WEIGHT_BASE_QUALITY * base
        + WEIGHT_COUNTERPART * sub_scores.counterpart_quality
        + WEIGHT_BUDGET * sub_scores.budget_alignment
        + WEIGHT_SKILLS * sub_scores.skills_match
        + WEIGHT_COMPETITION * sub_scores.competition
        - RISK_PENALTY * risk_factors.len() as f64;

    Ok(Analysis {
        sub_scores,
        risk_factors,
        weighted_score: raw.clamp(0.0, 100.0),
        competing_bids: counterpart.competing_bids,
        verified: counterpart.verified,
    })
}

/// Turn an analysis into a decision. Deterministic in its inputs.
pub fn classify(
    opportunity_id: &str,
    analysis: &Analysis,
    policy: &Policy,
    quota_count_today: u32,
) -> Decision {
    let score = analysis.weighted_score;
    let recommendations = recommendations(analysis, policy);
    let estimated_success_rate = estimated_success_rate(analysis);

    if quota_count_today >= policy.daily_quota_cap {
        return Decision {
            opportunity_id: opportunity_id.to_string(),
            action: Action::Skip,
            confidence: 100.0,
            weighted_score: score,
            sub_scores: analysis.sub_scores,
            reasoning: vec![QUOTA_REASON.to_string()],
            risk_factors: analysis.risk_factors.clone(),
            recommendations,
            estimated_success_rate,
            quota_limited: true,
        };
    }

    let risks = analysis.risk_factors.len();
    let mut reasoning = vec![format!("weighted score {score:.1}")];

    let (action, confidence) = if score >= policy.auto_submit_threshold
        && risks <= MAX_AUTO_SUBMIT_RISKS
    {
        reasoning.push(format!(
            "meets auto-submit threshold {:.1} with {risks} risk factor(s)",
            policy.auto_submit_threshold
        ));
        (
            Action::AutoSubmit,
            (70.0 + (score - policy.auto_submit_threshold)).min(95.0),
        )
    } else if score >= policy.approval_threshold {
        if score >= policy.auto_submit_threshold {
            reasoning.push(format!(
                "meets auto-submit threshold but has {risks} risk factors; needs review"
            ));
        } else {
            reasoning.push(format!(
                "meets approval threshold {:.1}",
                policy.approval_threshold
            ));
        }
        (
            Action::RequestApproval,
            (50.0 + (score - policy.approval_threshold)).min(85.0),
        )
    } else {
        reasoning.push(format!(
            "below approval threshold {:.1}",
            policy.approval_threshold
        ));
        (
            Action::Skip,
            (60.0 + (policy.skip_threshold - score)).min(90.0),
        )
    };

    reasoning.extend(analysis.risk_factors.iter().map(|r| format!("risk: {r}")));

    Decision {
        opportunity_id: opportunity_id.to_string(),
        action,
        confidence: confidence.clamp(0.0, 100.0),
        weighted_score: score,
        sub_scores: analysis.sub_scores,
        reasoning,
        risk_factors: analysis.risk_factors.clone(),
        recommendations,
        estimated_success_rate,
        quota_limited: false,
    }
}

fn validate(opportunity: &Opportunity) -> Result<(), EngineError> {
    let fail = |reason: &str| EngineError::Validation {
        id: opportunity.id.clone(),
        reason: reason.to_string(),
    };

    if opportunity.id.trim().is_empty() {
        return Err(fail("missing id"));
    }
    if opportunity.title.trim().is_empty() {
        return Err(fail("missing title"));
    }
    if !opportunity.base_quality_score.is_finite() {
        return Err(fail("base quality score is not a number"));
    }
    if !opportunity.counterpart.rating.is_finite() {
        return Err(fail("counterpart rating is not a number"));
    }
    Ok(())
}

fn budget_alignment(opportunity: &Opportunity, policy: &Policy) -> f64 {
    match &opportunity.budget {
        None => 0.0,
        Some(b) if b.amount < policy.min_budget => BUDGET_BELOW_MIN,
        Some(b) if b.amount > policy.max_budget => BUDGET_ABOVE_MAX,
        Some(_) => BUDGET_IN_RANGE,
    }
}

fn skills_match(opportunity: &Opportunity, policy: &Policy) -> f64 {
    if opportunity.skills.is_empty() {
        return 0.0;
    }
    let preferred: Vec<String> = policy
        .preferred_skills
        .iter()
        .map(|s| s.to_lowercase())
        .collect();
    let matching = opportunity
        .skills
        .iter()
        .filter(|skill| {
            let skill = skill.to_lowercase();
            preferred.iter().any(|p| skill.contains(p.as_str()))
        })
        .count();
    matching as f64 / opportunity.skills.len() as f64 * 100.0
}

fn risk_factors(opportunity: &Opportunity, policy: &Policy) -> Vec<String> {
    let mut risks = Vec::new();
    let counterpart = &opportunity.counterpart;

    if let Some(budget) = &opportunity.budget {
        if budget.amount < policy.min_budget {
            risks.push(format!(
                "budget {} below minimum {}",
                budget.amount, policy.min_budget
            ));
        } else if budget.amount > policy.max_budget {
            risks.push(format!(
                "budget {} above maximum {} (possibly unrealistic)",
                budget.amount, policy.max_budget
            ));
        }
    }

    if counterpart.rating < policy.client_rating_minimum {
        risks.push(format!(
            "client rating {:.1} below minimum {:.1}",
            counterpart.rating, policy.client_rating_minimum
        ));
    }

    if !counterpart.verified {
        risks.push("client payment unverified".to_string());
    }

    let description = opportunity.description.to_lowercase();
    let found: Vec<&str> = policy
        .excluded_keywords
        .iter()
        .filter(|k| description.contains(&k.to_lowercase()))
        .map(String::as_str)
        .collect();
    if !found.is_empty() {
        risks.push(format!("excluded keywords in description: {}", found.join(", ")));
    }

    if counterpart.competing_bids > policy.competition_threshold {
        risks.push(format!(
            "high competition: {} bids (cap {})",
            counterpart.competing_bids, policy.competition_threshold
        ));
    }

    risks
}

fn estimated_success_rate(analysis: &Analysis) -> f64 {
    let s = &analysis.sub_scores;
    let mut rate = 15.0;
    if s.counterpart_quality >= 80.0 {
        rate += 10.0;
    }
    if s.budget_alignment >= 80.0 {
        rate += 8.0;
    }
    if s.skills_match >= 70.0 {
        rate += 12.0;
    }
    if analysis.competing_bids > 0 && analysis.competing_bids < 10 {
        rate += 15.0;
    }
    rate -= 3.0 * analysis.risk_factors.len() as f64;
    rate.clamp(5.0, 85.0)
}

fn recommendations(analysis: &Analysis, policy: &Policy) -> Vec<String> {
    let s = &analysis.sub_scores;
    let mut out = Vec::new();

    if s.budget_alignment == BUDGET_BELOW_MIN {
        out.push("Lead with a scoped-down offer that fits the posted budget".to_string());
    } else if s.budget_alignment == BUDGET_ABOVE_MAX {
        out.push("Clarify scope before committing to the posted budget".to_string());
    } else if s.budget_alignment == 0.0 {
        out.push("Ask for a budget range before quoting".to_string());
    }
    if s.skills_match < 50.0 {
        out.push("Highlight transferable experience for unmatched skills".to_string());
    }
    if analysis.competing_bids > policy.competition_threshold {
        out.push("Differentiate clearly from the existing bids".to_string());
    } else if analysis.competing_bids < 5 {
        out.push("Respond early while competition is low".to_string());
    }
    if !analysis.verified {
        out.push("Confirm payment verification before starting work".to_string());
    }
    if policy.risk_tolerance == RiskTolerance::Low && !analysis.risk_factors.is_empty() {
        out.push("Review flagged risks manually before responding".to_string());
    }
    out
}
