//! Generation prompt construction.

use crate::composer::patterns::Pattern;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::opportunities::Opportunity;

/// Description characters passed to the model.
pub const DESCRIPTION_LIMIT: usize = 1000;

/// Key phrases offered to the model.
pub const PROMPT_PHRASES: usize = 8;

const MAX_TOKENS: u32 = 1200;
const TEMPERATURE: f32 = 0.7;

const SYSTEM_PROMPT: &str = "You write concise, specific proposals for freelance work opportunities. \
Write in the first person, address the client's actual needs, and never invent credentials. \
Return only the proposal text with no preamble or headings.";

/// Build the completion request for one opportunity.
pub fn build_request(
    opportunity: &Opportunity,
    pattern: &Pattern,
    custom_instructions: Option<&str>,
) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(build_user_prompt(opportunity, pattern, custom_instructions)),
    ])
    .with_max_tokens(MAX_TOKENS)
    .with_temperature(TEMPERATURE)
}

fn build_user_prompt(
    opportunity: &Opportunity,
    pattern: &Pattern,
    custom_instructions: Option<&str>,
) -> String {
    let budget = opportunity
        .budget
        .as_ref()
        .map(|b| b.to_string())
        .unwrap_or_else(|| "not specified".to_string());
    let skills = if opportunity.skills.is_empty() {
        "not specified".to_string()
    } else {
        opportunity
            .skills
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut prompt = format!(
        "Write a proposal for this opportunity.\n\n\
         Title: {title}\n\
         Description: {description}\n\
         Budget: {budget}\n\
         Required skills: {skills}\n\
         Client rating: {rating:.1}/5\n\n\
         Follow the {structure} structure, which has worked in {rate:.0}% of past winning proposals.\n\
         Aim for about {target} words.",
        title = opportunity.title,
        description = truncate_chars(&opportunity.description, DESCRIPTION_LIMIT),
        rating = opportunity.counterpart.rating,
        structure = pattern.label,
        rate = pattern.success_rate,
        target = pattern.target_length,
    );

    let phrases: Vec<&str> = pattern
        .key_phrases
        .iter()
        .take(PROMPT_PHRASES)
        .map(String::as_str)
        .collect();
    if !phrases.is_empty() {
        prompt.push_str("\nWhere natural, use phrasing like: ");
        prompt.push_str(
            &phrases
                .iter()
                .map(|p| format!("\"{p}\""))
                .collect::<Vec<_>>()
                .join(", "),
        );
        prompt.push('.');
    }

    if let Some(extra) = custom_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\nAdditional instructions: ");
        prompt.push_str(extra);
    }

    prompt
}

/// First `max` characters of `s`, with an ellipsis when cut.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::patterns::default_patterns;
    use crate::llm::Role;
    use crate::opportunities::{Budget, Counterpart};
    use rust_decimal_macros::dec;

    fn opportunity() -> Opportunity {
        Opportunity::new("o-1", "t", "React dashboard", "x".repeat(3000))
            .with_budget(Budget::usd(dec!(5000)))
            .with_skills(["react", "typescript"])
            .with_counterpart(Counterpart {
                rating: 4.8,
                ..Counterpart::default()
            })
    }

    fn user_text(request: &CompletionRequest) -> &str {
        &request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .unwrap()
            .content
    }

    #[test]
    fn prompt_carries_opportunity_and_pattern() {
        let pattern = &default_patterns()[0];
        let request = build_request(&opportunity(), pattern, Some("Mention my Rust work."));
        let text = user_text(&request);

        assert!(text.contains("Title: React dashboard"));
        assert!(text.contains("Budget: 5000 USD"));
        assert!(text.contains("react, typescript"));
        assert!(text.contains("4.8/5"));
        assert!(text.contains("Problem-Solution-Result"));
        assert!(text.contains("about 150 words"));
        assert!(text.contains("Mention my Rust work."));
        assert_eq!(request.max_tokens, Some(MAX_TOKENS));
    }

    #[test]
    fn description_is_truncated() {
        let request = build_request(&opportunity(), &default_patterns()[0], None);
        let text = user_text(&request);
        assert!(!text.contains(&"x".repeat(DESCRIPTION_LIMIT + 1)));
        assert!(text.contains(&format!("{}...", "x".repeat(DESCRIPTION_LIMIT))));
        assert!(!text.contains("Additional instructions"));
    }

    #[test]
    fn at_most_eight_phrases() {
        let mut pattern = default_patterns()[0].clone();
        pattern.key_phrases = (0..12).map(|i| format!("phrase number {i}")).collect();
        let request = build_request(&opportunity(), &pattern, None);
        let text = user_text(&request);
        assert!(text.contains("\"phrase number 7\""));
        assert!(!text.contains("\"phrase number 8\""));
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
