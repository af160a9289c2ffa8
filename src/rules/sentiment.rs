use std::collections::{HashMap, HashSet};

use super::{RuleConfig, RuleError, Span};
use crate::models::Sentiment;

/// Weighted keyword lexicons with negation handling
#[derive(Debug, Clone)]
pub struct SentimentRules {
    /// Signed weight per keyword: positive keywords > 0, negative < 0
    lexicon: HashMap<String, i64>,
    negations: HashSet<String>,
    negation_window: usize,
}

/// Sentiment score breakdown for one transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentimentScore {
    pub label: Sentiment,
    pub positive_hits: i64,
    pub negative_hits: i64,
}

/// Keyword hits at which confidence saturates
const CONFIDENT_HITS: f64 = 20.0;

impl SentimentScore {
    pub fn score(&self) -> i64 {
        self.positive_hits - self.negative_hits
    }

    /// Share of `CONFIDENT_HITS` reached by all keyword hits, capped at 1.0
    /// and rounded to two decimals
    pub fn confidence(&self) -> f64 {
        let hits = (self.positive_hits + self.negative_hits) as f64;
        ((hits / CONFIDENT_HITS).min(1.0) * 100.0).round() / 100.0
    }
}

impl SentimentRules {
    pub fn compile(config: &RuleConfig) -> Result<Self, RuleError> {
        let mut lexicon = HashMap::new();

        for (keyword, &weight) in &config.positive_keywords {
            check_keyword(keyword, weight)?;
            lexicon.insert(keyword.to_lowercase(), weight);
        }
        for (keyword, &weight) in &config.negative_keywords {
            check_keyword(keyword, weight)?;
            if lexicon.insert(keyword.to_lowercase(), -weight).is_some() {
                return Err(RuleError::OverlappingKeyword(keyword.clone()));
            }
        }

        if let Some(term) = config.negation_terms.iter().find(|t| !is_single_word(t)) {
            return Err(RuleError::MultiWordKeyword(term.clone()));
        }

        Ok(Self {
            lexicon,
            negations: config.negation_terms.iter().map(|s| s.to_lowercase()).collect(),
            negation_window: config.negation_window_tokens,
        })
    }

    /// Score `positive_hits - negative_hits` over the tokens.
    ///
    /// A keyword preceded by a negation term within the window contributes
    /// with the opposite sign ("not satisfied" counts as negative).
    pub(crate) fn classify(&self, tokens: &[Span<'_>]) -> SentimentScore {
        let mut positive_hits = 0i64;
        let mut negative_hits = 0i64;

        for (i, token) in tokens.iter().enumerate() {
            let Some(&weight) = self.lexicon.get(token.text) else {
                continue;
            };

            let contribution = if self.is_negated(tokens, i) {
                -weight
            } else {
                weight
            };

            if contribution > 0 {
                positive_hits += contribution;
            } else {
                negative_hits += -contribution;
            }
        }

        let label = match (positive_hits - negative_hits).signum() {
            1 => Sentiment::Positive,
            -1 => Sentiment::Negative,
            _ => Sentiment::Neutral,
        };

        SentimentScore {
            label,
            positive_hits,
            negative_hits,
        }
    }

    fn is_negated(&self, tokens: &[Span<'_>], index: usize) -> bool {
        tokens[index.saturating_sub(self.negation_window)..index]
            .iter()
            .any(|t| self.negations.contains(t.text))
    }
}

/// Lookups are per token, so a keyword must be exactly one token
fn is_single_word(keyword: &str) -> bool {
    !keyword.is_empty() && !keyword.contains(char::is_whitespace)
}

fn check_keyword(keyword: &str, weight: i64) -> Result<(), RuleError> {
    if !is_single_word(keyword) {
        return Err(RuleError::MultiWordKeyword(keyword.to_string()));
    }
    if weight <= 0 {
        return Err(RuleError::InvalidWeight {
            keyword: keyword.to_string(),
            weight,
        });
    }
    Ok(())
}
