//! Draft composer: mine history, prompt the model, then bound and score the output.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::admission::Action;
use crate::composer::patterns::{Pattern, PatternMiner, word_count};
use crate::composer::prompt::build_request;
use crate::error::ComposeError;
use crate::llm::LlmProvider;
use crate::opportunities::Opportunity;
use crate::store::SubmissionStore;

/// Winning submissions mined per composition.
pub const HISTORY_LIMIT: usize = 50;

/// Hard ceiling on draft length, in characters, marker included.
pub const MAX_DRAFT_CHARS: usize = 4800;

/// Appended when a draft is cut to fit.
pub const TRUNCATION_MARKER: &str = "\n\n[truncated]";

const BASE_CONFIDENCE: f64 = 60.0;
const LENGTH_BONUS: f64 = 15.0;
const PHRASE_BONUS: f64 = 20.0;
const SKILL_BONUS: f64 = 15.0;
const QUALITY_BONUS: f64 = 10.0;
const IDEAL_WORDS: std::ops::RangeInclusive<usize> = 100..=300;

/// A generated draft plus what went into it.
#[derive(Debug, Clone, Serialize)]
pub struct ComposedDraft {
    pub draft: String,
    /// 0–100.
    pub confidence: f64,
    pub reasoning: Vec<String>,
    /// Every pattern considered, best first.
    pub patterns: Vec<Pattern>,
    pub word_count: usize,
    /// Label of the pattern the prompt followed.
    pub pattern_label: String,
    pub truncated: bool,
}

impl ComposedDraft {
    /// Metadata stored alongside the draft.
    pub fn metadata(&self, action: Action, model: &str) -> serde_json::Value {
        serde_json::json!({
            "action": action,
            "confidence": self.confidence,
            "pattern": self.pattern_label,
            "word_count": self.word_count,
            "truncated": self.truncated,
            "model": model,
        })
    }
}

/// Produces drafts for opportunities.
pub struct DraftComposer {
    llm: Arc<dyn LlmProvider>,
    history: Arc<dyn SubmissionStore>,
    miner: PatternMiner,
    llm_timeout: Duration,
    store_timeout: Duration,
}

impl DraftComposer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        history: Arc<dyn SubmissionStore>,
        llm_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            history,
            miner: PatternMiner::default(),
            llm_timeout,
            store_timeout,
        }
    }

    /// Replace the pattern miner (e.g. with a different structure classifier).
    pub fn with_miner(mut self, miner: PatternMiner) -> Self {
        self.miner = miner;
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Compose a draft for `opportunity` on behalf of `user_id`.
    pub async fn compose(
        &self,
        opportunity: &Opportunity,
        user_id: &str,
        custom_instructions: Option<&str>,
    ) -> Result<ComposedDraft, ComposeError> {
        let history = tokio::time::timeout(
            self.store_timeout,
            self.history.fetch_terminal_won(user_id, HISTORY_LIMIT),
        )
        .await
        .map_err(|_| ComposeError::HistoryTimeout(self.store_timeout))??;

        let patterns = self.miner.mine(&history);
        let best = patterns.first().cloned().unwrap_or_else(|| Pattern {
            label: "Freeform".into(),
            key_phrases: Vec::new(),
            target_length: 150,
            success_rate: 0.0,
        });
        debug!(
            opportunity_id = %opportunity.id,
            history = history.len(),
            pattern = %best.label,
            "Patterns mined"
        );

        let request = build_request(opportunity, &best, custom_instructions);
        let response = tokio::time::timeout(self.llm_timeout, self.llm.complete(request))
            .await
            .map_err(|_| ComposeError::Timeout(self.llm_timeout))??;

        let raw = response.content.trim();
        if raw.is_empty() {
            return Err(ComposeError::EmptyDraft);
        }

        let (draft, truncated) = enforce_length(raw);
        let words = word_count(&draft);
        let (confidence, mut reasoning) = score_confidence(&draft, &best, opportunity);
        reasoning.insert(
            0,
            format!(
                "followed {} ({:.0}% of winning history, {} samples)",
                best.label,
                best.success_rate,
                history.len()
            ),
        );
        if truncated {
            reasoning.push(format!("cut to {MAX_DRAFT_CHARS} characters"));
        }

        info!(
            opportunity_id = %opportunity.id,
            words,
            confidence,
            truncated,
            "Draft composed"
        );

        Ok(ComposedDraft {
            draft,
            confidence,
            reasoning,
            patterns,
            word_count: words,
            pattern_label: best.label,
            truncated,
        })
    }
}

/// Cut `text` so that it, plus the marker, fits in `MAX_DRAFT_CHARS`.
pub fn enforce_length(text: &str) -> (String, bool) {
    if text.chars().count() <= MAX_DRAFT_CHARS {
        return (text.to_string(), false);
    }
    let keep = MAX_DRAFT_CHARS - TRUNCATION_MARKER.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Confidence in a draft, 0–100, with the factors that contributed.
pub fn score_confidence(
    draft: &str,
    pattern: &Pattern,
    opportunity: &Opportunity,
) -> (f64, Vec<String>) {
    let lower = draft.to_lowercase();
    let mut score = BASE_CONFIDENCE;
    let mut reasoning = Vec::new();

    let words = word_count(draft);
    if IDEAL_WORDS.contains(&words) {
        score += LENGTH_BONUS;
        reasoning.push(format!("{words} words is within the ideal range"));
    } else {
        reasoning.push(format!("{words} words is outside the ideal range"));
    }

    let phrase_hits = pattern
        .key_phrases
        .iter()
        .filter(|p| lower.contains(&p.to_lowercase()))
        .count();
    let phrase_share = fraction(phrase_hits, pattern.key_phrases.len());
    score += PHRASE_BONUS * phrase_share;
    if !pattern.key_phrases.is_empty() {
        reasoning.push(format!(
            "uses {phrase_hits}/{} proven phrases",
            pattern.key_phrases.len()
        ));
    }

    let skill_hits = opportunity
        .skills
        .iter()
        .filter(|s| lower.contains(&s.to_lowercase()))
        .count();
    score += SKILL_BONUS * fraction(skill_hits, opportunity.skills.len());
    if !opportunity.skills.is_empty() {
        reasoning.push(format!(
            "mentions {skill_hits}/{} required skills",
            opportunity.skills.len()
        ));
    }

    let quality = if opportunity.base_quality_score.is_finite() {
        opportunity.base_quality_score.clamp(0.0, 100.0)
    } else {
        0.0
    };
    score += QUALITY_BONUS * quality / 100.0;

    (score.clamp(0.0, 100.0), reasoning)
}

fn fraction(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
