//! Format and reasoning quality signals extracted from model outputs.

use crate::trajectory::types::{Action, LlmCall};

/// Responses at least this long earn partial format credit.
const LONG_RESPONSE_CHARS: usize = 200;
/// Responses at least this long earn minimal format credit.
const MEDIUM_RESPONSE_CHARS: usize = 50;
/// Reasoning text length that earns full length credit.
const FULL_REASONING_CHARS: usize = 500;
/// Distinct vocabulary hits that earn full vocabulary credit.
const FULL_VOCAB_HITS: usize = 5;

const STRUCTURED_DELIMITERS: &[(&str, &str)] = &[
    ("<thinking>", "</thinking>"),
    ("<think>", "</think>"),
    ("<analysis>", "</analysis>"),
    ("<reasoning>", "</reasoning>"),
];

const TRADING_VOCAB: &[&str] = &[
    "price", "market", "trend", "risk", "position", "momentum", "volatility", "support",
    "resistance", "sentiment", "profit", "loss", "exposure", "hedge", "liquidity", "volume",
    "stop", "target", "because", "therefore",
];

const DEGEN_VOCAB: &[&str] = &[
    "pump", "moon", "leverage", "yolo", "momentum", "breakout", "volume", "ape", "risk",
    "upside",
];

const ANALYST_VOCAB: &[&str] = &[
    "fundamental", "valuation", "earnings", "outlook", "evidence", "probability", "expected",
    "thesis", "catalyst", "downside", "compare", "data",
];

const SOCIAL_VOCAB: &[&str] = &[
    "community", "post", "reply", "follow", "engagement", "audience", "group", "discussion",
    "reputation", "network",
];

/// External adjustments applied on top of the text heuristics, e.g. from a
/// judge that reviewed the step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Feedback {
    pub format_adjustment: f64,
    pub reasoning_adjustment: f64,
}

/// Domain vocabulary for an agent archetype. Unknown archetypes use the
/// generic trading vocabulary.
fn vocabulary(archetype: Option<&str>) -> &'static [&'static str] {
    match archetype.map(|a| a.to_ascii_lowercase()).as_deref() {
        Some("degen") | Some("gambler") | Some("momentum") => DEGEN_VOCAB,
        Some("analyst") | Some("researcher") | Some("value") => ANALYST_VOCAB,
        Some("social") | Some("influencer") | Some("socialite") => SOCIAL_VOCAB,
        _ => TRADING_VOCAB,
    }
}

/// Format score for one response: full credit for delimited reasoning,
/// partial credit for length alone.
pub fn format_score(response: &str) -> f64 {
    let lower = response.to_ascii_lowercase();
    let delimited = STRUCTURED_DELIMITERS.iter().any(|(open, close)| {
        lower
            .find(open)
            .is_some_and(|start| lower[start + open.len()..].contains(close))
    });
    if delimited {
        return 1.0;
    }

    let len = response.trim().chars().count();
    if len >= LONG_RESPONSE_CHARS {
        0.5
    } else if len >= MEDIUM_RESPONSE_CHARS {
        0.2
    } else {
        0.0
    }
}

/// Reasoning score for one piece of text: mostly domain vocabulary, with a
/// smaller length component.
pub fn reasoning_score(text: &str, archetype: Option<&str>) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let lower = trimmed.to_ascii_lowercase();
    let hits = vocabulary(archetype)
        .iter()
        .filter(|term| lower.contains(*term))
        .count();
    let vocab = (hits as f64 / FULL_VOCAB_HITS as f64).min(1.0);
    let length = (trimmed.chars().count() as f64 / FULL_REASONING_CHARS as f64).min(1.0);
    0.7 * vocab + 0.3 * length
}

/// Format and reasoning quality of one step, both in `[0, 1]`.
///
/// Scores are averaged over the step's calls. The action's own reasoning
/// text, when present, counts as one more piece of reasoning. Returns
/// `(0.0, 0.0)` for a step without calls.
pub fn quality(
    llm_calls: &[LlmCall],
    action: Option<&Action>,
    feedback: Option<&Feedback>,
    archetype: Option<&str>,
) -> (f64, f64) {
    if llm_calls.is_empty() {
        return (0.0, 0.0);
    }

    let n = llm_calls.len() as f64;
    let format = llm_calls.iter().map(|c| format_score(&c.response)).sum::<f64>() / n;

    let mut reasoning_total: f64 = llm_calls
        .iter()
        .map(|c| reasoning_score(c.reasoning_text(), archetype))
        .sum();
    let mut reasoning_count = n;
    if let Some(text) = action.and_then(|a| a.reasoning.as_deref()) {
        if !text.trim().is_empty() {
            reasoning_total += reasoning_score(text, archetype);
            reasoning_count += 1.0;
        }
    }
    let reasoning = reasoning_total / reasoning_count;

    let (fa, ra) = feedback.map_or((0.0, 0.0), |f| (f.format_adjustment, f.reasoning_adjustment));
    (unit(format + fa), unit(reasoning + ra))
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
