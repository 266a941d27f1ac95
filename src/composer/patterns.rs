//! Pattern mining over historically successful submissions.
//!
//! A `Pattern` pairs a named structure with mined key phrases, a target
//! length, and the share of winning history that followed the structure.
//! Structure detection sits behind `StructureClassifier` so the marker-word
//! heuristic can be swapped for something smarter.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::SubmissionRecord;

/// Key phrases kept per mining pass.
pub const MAX_KEY_PHRASES: usize = 10;

const MIN_NGRAM: usize = 2;
const MAX_NGRAM: usize = 4;

/// Phrases shorter than this (in characters) are fragments, not phrases.
const MIN_PHRASE_CHARS: usize = 8;

/// Words that may not start or end a phrase.
const COMMON_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "i",
    "in", "is", "it", "its", "me", "my", "of", "on", "or", "our", "so", "that", "the", "this",
    "to", "was", "we", "will", "with", "you", "your",
];

/// Mined (or canned) guidance for a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub label: String,
    pub key_phrases: Vec<String>,
    /// Target length in words.
    pub target_length: usize,
    /// Percent of winning history that used this structure, 0–100.
    pub success_rate: f64,
}

/// Assigns a structure label to a piece of text.
pub trait StructureClassifier: Send + Sync {
    /// Every label this classifier can return, in priority order.
    fn labels(&self) -> Vec<String>;

    fn classify(&self, text: &str) -> Option<String>;
}

/// A named structure recognised by the co-occurrence of marker terms.
#[derive(Debug, Clone)]
pub struct MarkerStructure {
    pub label: String,
    /// All must match for the structure to apply.
    pub markers: Vec<Regex>,
}

/// Classifies text by marker-term co-occurrence. First matching structure wins.
#[derive(Debug, Clone)]
pub struct MarkerStructureClassifier {
    structures: Vec<MarkerStructure>,
}

impl MarkerStructureClassifier {
    /// The built-in English structures.
    pub fn default_structures() -> Self {
        let mut classifier = Self::empty();
        classifier.add_terms("Problem-Solution-Result", &["understand", "solution", "result"]);
        classifier.add_terms("Experience-Approach-Timeline", &["experience", "approach", "timeline"]);
        classifier.add_terms("Credentials-Portfolio-Call", &["years", "portfolio", "discuss"]);
        classifier
    }

    pub fn empty() -> Self {
        Self {
            structures: Vec::new(),
        }
    }

    /// Add a structure from raw regex markers.
    pub fn add_structure(&mut self, label: &str, markers: &[&str]) -> Result<(), regex::Error> {
        let markers = markers
            .iter()
            .map(|m| Regex::new(&format!("(?i){m}")))
            .collect::<Result<Vec<_>, _>>()?;
        self.structures.push(MarkerStructure {
            label: label.to_string(),
            markers,
        });
        Ok(())
    }

    /// Add a structure whose markers are plain word prefixes.
    fn add_terms(&mut self, label: &str, terms: &[&str]) {
        let markers = terms
            .iter()
            .filter_map(|t| Regex::new(&format!(r"(?i)\b{}", regex::escape(t))).ok())
            .collect();
        self.structures.push(MarkerStructure {
            label: label.to_string(),
            markers,
        });
    }
}

impl StructureClassifier for MarkerStructureClassifier {
    fn labels(&self) -> Vec<String> {
        self.structures.iter().map(|s| s.label.clone()).collect()
    }

    fn classify(&self, text: &str) -> Option<String> {
        self.structures
            .iter()
            .find(|s| !s.markers.is_empty() && s.markers.iter().all(|m| m.is_match(text)))
            .map(|s| s.label.clone())
    }
}

/// Canned patterns used when there is no winning history yet.
pub fn default_patterns() -> Vec<Pattern> {
    vec![
        Pattern {
            label: "Problem-Solution-Result".into(),
            key_phrases: vec![
                "I understand you need".into(),
                "my solution would be".into(),
                "the end result".into(),
                "proven track record".into(),
            ],
            target_length: 150,
            success_rate: 75.0,
        },
        Pattern {
            label: "Experience-Approach-Timeline".into(),
            key_phrases: vec![
                "years of experience".into(),
                "my approach would".into(),
                "clear timeline".into(),
                "happy to discuss".into(),
            ],
            target_length: 180,
            success_rate: 70.0,
        },
    ]
}

/// Word count by whitespace.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn is_common(word: &str) -> bool {
    COMMON_WORDS.contains(&word)
}

/// Most frequent 2–4 word phrases across `texts`, ranked by frequency.
///
/// A phrase may not start or end with a common word, and must be at least
/// a few characters long. Ties break alphabetically.
pub fn extract_phrases<'a, I>(texts: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        let words = tokenize(text);
        for n in MIN_NGRAM..=MAX_NGRAM {
            for window in words.windows(n) {
                let (first, last) = (&window[0], &window[n - 1]);
                if is_common(first) || is_common(last) {
                    continue;
                }
                let phrase = window.join(" ");
                if phrase.len() < MIN_PHRASE_CHARS {
                    continue;
                }
                *counts.entry(phrase).or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(p, _)| p).collect()
}

/// Derives patterns from winning history.
pub struct PatternMiner {
    classifier: Box<dyn StructureClassifier>,
}

impl PatternMiner {
    pub fn new(classifier: Box<dyn StructureClassifier>) -> Self {
        Self { classifier }
    }

    /// Patterns ordered by success rate, best first.
    ///
    /// With no history the canned defaults are returned. With history but no
    /// recognised structure, the defaults are returned carrying the mined
    /// phrases and target length.
    pub fn mine(&self, history: &[SubmissionRecord]) -> Vec<Pattern> {
        if history.is_empty() {
            return default_patterns();
        }

        let total = history.len() as f64;
        let key_phrases = extract_phrases(history.iter().map(|s| s.text.as_str()), MAX_KEY_PHRASES);
        let target_length =
            (history.iter().map(|s| word_count(&s.text)).sum::<usize>() as f64 / total).round()
                as usize;

        let mut frequencies: HashMap<String, usize> = HashMap::new();
        for record in history {
            if let Some(label) = self.classifier.classify(&record.text) {
                *frequencies.entry(label).or_insert(0) += 1;
            }
        }

        let mut patterns: Vec<Pattern> = if frequencies.is_empty() {
            default_patterns()
                .into_iter()
                .map(|p| Pattern {
                    key_phrases: if key_phrases.is_empty() {
                        p.key_phrases
                    } else {
                        key_phrases.clone()
                    },
                    target_length,
                    ..p
                })
                .collect()
        } else {
            self.classifier
                .labels()
                .into_iter()
                .filter_map(|label| {
                    let hits = *frequencies.get(&label)?;
                    Some(Pattern {
                        label,
                        key_phrases: key_phrases.clone(),
                        target_length,
                        success_rate: hits as f64 / total * 100.0,
                    })
                })
                .collect()
        };

        patterns.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        patterns
    }
}

impl Default for PatternMiner {
    fn default() -> Self {
        Self::new(Box::new(MarkerStructureClassifier::default_structures()))
    }
}
