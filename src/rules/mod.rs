pub mod conversion;
pub mod sentiment;
pub mod upsell;

pub use conversion::*;
pub use sentiment::*;
pub use upsell::*;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Cents, Sentiment};

/// Rule tables for conversion, upsell and sentiment extraction.
///
/// All patterns are written against normalized text: lower case, contractions
/// expanded, punctuation stripped except currency symbols and digit separators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Phrase patterns (regex) signalling a completed sale
    pub conversion_patterns: Vec<String>,
    /// Phrase patterns (regex) marking an upsell offer
    pub upsell_indicators: Vec<String>,
    /// Words that turn a bare number into an amount ("50 dollars")
    pub money_suffixes: Vec<String>,
    /// Tokens on each side of an upsell indicator in which amounts count
    pub upsell_window_tokens: usize,
    /// Positive keyword -> weight
    pub positive_keywords: BTreeMap<String, i64>,
    /// Negative keyword -> weight
    pub negative_keywords: BTreeMap<String, i64>,
    pub negation_terms: Vec<String>,
    /// Tokens before a keyword searched for a negation term
    pub negation_window_tokens: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let weighted = |items: &[&str]| {
            items
                .iter()
                .map(|s| (s.to_string(), 1))
                .collect::<BTreeMap<_, _>>()
        };

        Self {
            conversion_patterns: strings(&[
                r"\byes(?: \S+){0,5} (?:book|booking|appointment|schedule)\b",
                r"\bsign me up\b",
                r"\blet us (?:proceed|move forward|do it|get started)\b",
                r"\bi would like to (?:move forward|proceed|sign up|go ahead)\b",
                r"\bi (?:will|would) (?:take|buy|purchase)\b",
                r"\bi am ready to (?:buy|purchase|sign up|proceed|go)\b",
                r"\bi am (?:very |really )?interested\b",
                r"\bcount me in\b",
                r"\bsounds (?:perfect|great|good)(?: \S+){0,3} (?:do it|proceed)\b",
                r"\bgo ahead and (?:book|sign|process|place)\b",
            ]),
            upsell_indicators: strings(&[
                r"\b(?:premium|deluxe|pro|professional) (?:package|version|tier|plan|support|features?)\b",
                r"\b(?:extended|additional) (?:warranty|coverage|protection)\b",
                r"\b(?:extra|additional)\b",
                r"\bupgrade\b",
                r"\badd on\b",
                r"\b(?:express|priority) (?:delivery|shipping|service)\b",
                r"\b(?:maintenance|support) (?:plan|package)\b",
                r"\binsurance (?:package|coverage)\b",
                r"\binstallation service\b",
            ]),
            money_suffixes: strings(&["dollars", "dollar", "bucks"]),
            upsell_window_tokens: 6,
            positive_keywords: weighted(&[
                "excellent", "fantastic", "great", "wonderful", "amazing", "perfect",
                "outstanding", "impressive", "impressed", "satisfied", "happy", "helpful",
                "professional", "recommend", "pleased", "delighted", "love", "awesome",
                "brilliant", "superb", "terrific", "exceptional",
            ]),
            negative_keywords: weighted(&[
                "terrible", "horrible", "awful", "disappointed", "frustrated", "frustrating",
                "unacceptable", "poor", "bad", "worst", "angry", "upset", "unhappy",
                "unsatisfied", "ridiculous", "waste", "useless", "unprofessional", "rude",
                "incompetent", "disgusted", "pathetic", "hate", "furious",
            ]),
            negation_terms: strings(&["not", "no", "never", "neither", "nor", "cannot", "without"]),
            negation_window_tokens: 2,
        }
    }
}

impl RuleConfig {
    /// Load a rule table from a JSON file; omitted fields keep their defaults
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule file: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse rule file: {:?}", path))
    }
}

/// Errors raised while compiling a [`RuleConfig`]
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("keyword {0:?} is both positive and negative")]
    OverlappingKeyword(String),

    #[error("keyword {keyword:?} has non-positive weight {weight}")]
    InvalidWeight { keyword: String, weight: i64 },

    #[error("keyword {0:?} must be a single word")]
    MultiWordKeyword(String),
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<regex::Regex, RuleError> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Compiled, immutable rule set. Build once and share by reference.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub conversion: ConversionRules,
    pub upsell: UpsellRules,
    pub sentiment: SentimentRules,
}

impl RuleSet {
    pub fn compile(config: &RuleConfig) -> Result<Self, RuleError> {
        Ok(Self {
            conversion: ConversionRules::compile(config)?,
            upsell: UpsellRules::compile(config)?,
            sentiment: SentimentRules::compile(config)?,
        })
    }

    /// Apply every rule to a normalized transcript
    pub fn extract(&self, cleaned_text: &str) -> Extraction {
        let tokens = split_tokens(cleaned_text);
        let conversion = self.conversion.detect(cleaned_text);
        let upsell = self.upsell.extract(cleaned_text, &tokens);
        let sentiment = self.sentiment.classify(&tokens);

        Extraction {
            is_conversion: conversion.is_some(),
            conversion_phrase: conversion,
            upsell_amount: upsell.amount,
            upsell_product: upsell.product,
            sentiment_label: sentiment.label,
            sentiment_confidence: sentiment.confidence(),
            positive_hits: sentiment.positive_hits,
            negative_hits: sentiment.negative_hits,
        }
    }
}

/// Everything the rules extract from one transcript
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub is_conversion: bool,
    pub conversion_phrase: Option<String>,
    pub upsell_amount: Cents,
    pub upsell_product: Option<String>,
    pub sentiment_label: Sentiment,
    /// 0.0 to 1.0, saturating at 20 keyword hits
    pub sentiment_confidence: f64,
    pub positive_hits: i64,
    pub negative_hits: i64,
}

/// A whitespace-delimited token with its byte range in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span<'a> {
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

pub(crate) fn split_tokens(text: &str) -> Vec<Span<'_>> {
    let mut spans = Vec::new();
    let mut start = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push(Span {
                    text: &text[s..i],
                    start: s,
                    end: i,
                });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }

    if let Some(s) = start {
        spans.push(Span {
            text: &text[s..],
            start: s,
            end: text.len(),
        });
    }

    spans
}
