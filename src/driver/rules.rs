//! Built-in rule-based driver
//!
//! Deterministic stand-in for a model backend: ranking uses keyword tiers, redaction
//! uses regular expressions, and generation echoes the prompt back as tool input.
//! Identical input always produces identical output, independent of load.

use super::{Driver, ModelHandle, Ranking};
use crate::errors::DriverError;
use crate::task::Priority;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Token budget used when a task does not set `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 256;

static CRITICAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(urgent|emergency|outage|down|production|prod|data loss|security breach|breach|sev ?1|all customers|ssn|social security)\b",
    )
    .expect("valid regex")
});

static HIGH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(not working|doesn't work|broken|bug|error|errors|fail|fails|failed|failing|crash|crashes|crashed|cannot|can't|unable)\b",
    )
    .expect("valid regex")
});

static LOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(maybe|someday|some day|eventually|nice to have|would be nice|no rush|whenever|low priority|fun|easter egg)\b",
    )
    .expect("valid regex")
});

/// Placeholder substitutions, applied in order. Earlier patterns win where matches
/// could overlap (an SSN also looks like part of a card number).
static REDACTIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "[EMAIL]"),
        (r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]"),
        (r"\b\d(?:[ -]?\d){12,18}\b", "[CARD]"),
        (
            r"(?:\+?1[ .-]?)?(?:\(\d{3}\)\s?|\b\d{3}[ .-])\d{3}[ .-]\d{4}\b",
            "[PHONE]",
        ),
        (
            r"\b\d{1,5}\s+(?:[A-Z][a-z]+\s+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl)\b\.?",
            "[ADDRESS]",
        ),
        (
            r"\b(?:Mr|Mrs|Ms|Miss|Dr|Prof)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?",
            "[NAME]",
        ),
    ]
    .into_iter()
    .map(|(pattern, token)| (Regex::new(pattern).expect("valid regex"), token))
    .collect()
});

/// Full names introduced by a cue word ("to Jane Smith", "contact John Doe").
static CUED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b((?i:to|contact|call|email|named|from|ask|tell|cc|with)\s+)[A-Z][a-z]+\s+[A-Z][a-z]+\b",
    )
    .expect("valid regex")
});

/// Urgency tier for `text`. Tiers are checked from most to least urgent, so an
/// outage report that also mentions a bug is still critical.
pub fn classify(text: &str) -> Priority {
    if CRITICAL.is_match(text) {
        Priority::Critical
    } else if HIGH.is_match(text) {
        Priority::High
    } else if LOW.is_match(text) {
        Priority::Low
    } else {
        Priority::Normal
    }
}

/// Replace recognised PII with category placeholders. Idempotent: no placeholder
/// matches any of the patterns.
pub fn redact(text: &str) -> String {
    let mut out = REDACTIONS
        .iter()
        .fold(text.to_string(), |acc, (pattern, token)| {
            pattern.replace_all(&acc, *token).into_owned()
        });
    out = CUED_NAME.replace_all(&out, "${1}[NAME]").into_owned();
    out
}

/// Rank and redact in one pass. Redaction never lowers urgency: the tier is the
/// higher of the original and redacted classifications.
pub fn rank(text: &str) -> Ranking {
    let redacted = redact(text);
    let priority = classify(text).max(classify(&redacted));
    Ranking { priority, redacted }
}

/// The driver registered as `rules`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RulesDriver;

impl Driver for RulesDriver {
    fn name(&self) -> &str {
        "rules"
    }

    fn description(&self) -> &str {
        "deterministic keyword ranking, regex PII redaction, echo generation"
    }

    fn load(&self, path: &Path) -> Result<Box<dyn ModelHandle>, DriverError> {
        if !path.is_file() {
            return Err(DriverError::Load {
                path: path.to_path_buf(),
                reason: "not a readable model file".to_string(),
            });
        }
        debug!(path = %path.display(), "Loaded rules model");
        Ok(Box::new(RulesModel {
            path: path.to_path_buf(),
        }))
    }
}

struct RulesModel {
    path: PathBuf,
}

impl ModelHandle for RulesModel {
    fn generate(&mut self, text: &str, max_tokens: Option<u32>) -> Result<String, DriverError> {
        let limit = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS) as usize;
        let tokens: Vec<&str> = text.split_whitespace().take(limit).collect();
        serde_json::to_string(&json!({
            "prompt": text,
            "completion": tokens.join(" "),
            "tokens": tokens.len(),
        }))
        .map_err(|e| DriverError::Generate(e.to_string()))
    }

    fn rank_and_redact(&mut self, text: &str) -> Result<Ranking, DriverError> {
        Ok(rank(text))
    }

    fn unload(&mut self) {
        debug!(path = %self.path.display(), "Unloaded rules model");
    }
}
