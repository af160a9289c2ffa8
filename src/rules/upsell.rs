use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use tracing::debug;

use super::{compile_pattern, RuleConfig, RuleError, Span};
use crate::models::Cents;

/// Upsell found in one transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsellMatch {
    pub amount: Cents,
    /// Title-cased indicator phrase whose window first held a valid amount
    pub product: Option<String>,
}

/// Upsell indicator phrases and the token window in which amounts count
#[derive(Debug, Clone)]
pub struct UpsellRules {
    indicators: Vec<Regex>,
    money_suffixes: HashSet<String>,
    window: usize,
}

impl UpsellRules {
    pub fn compile(config: &RuleConfig) -> Result<Self, RuleError> {
        let indicators = config
            .upsell_indicators
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            indicators,
            money_suffixes: config.money_suffixes.iter().map(|s| s.to_lowercase()).collect(),
            window: config.upsell_window_tokens,
        })
    }

    /// Sum every monetary mention inside an upsell context window.
    ///
    /// Each amount counts once even if several windows cover it. Amounts that
    /// look monetary but fail to parse contribute nothing.
    pub(crate) fn extract(&self, cleaned_text: &str, tokens: &[Span<'_>]) -> UpsellMatch {
        let amounts = monetary_tokens(tokens, &self.money_suffixes);
        if amounts.is_empty() {
            return UpsellMatch {
                amount: Cents::ZERO,
                product: None,
            };
        }

        let mut counted: HashSet<usize> = HashSet::new();
        let mut product: Option<&str> = None;

        for indicator in &self.indicators {
            for m in indicator.find_iter(cleaned_text) {
                let Some((first, last)) = token_range(tokens, m.start(), m.end()) else {
                    continue;
                };
                let lo = first.saturating_sub(self.window);
                let hi = last.saturating_add(self.window);

                if product.is_none() && amounts.range(lo..=hi).any(|(_, amount)| amount.is_some()) {
                    product = Some(m.as_str());
                }
                for &index in amounts.range(lo..=hi).map(|(i, _)| i) {
                    counted.insert(index);
                }
            }
        }

        let total: Cents = counted
            .iter()
            .filter_map(|i| amounts.get(i).copied().flatten())
            .sum();

        debug!(
            mentions = amounts.len(),
            in_context = counted.len(),
            total = %total,
            "Upsell extraction"
        );

        UpsellMatch {
            amount: total,
            product: product.filter(|_| !total.is_zero()).map(title_case),
        }
    }
}

fn title_case(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Indices of monetary tokens, mapped to their parsed amount (None if malformed).
///
/// A token is monetary when it carries a currency symbol (`$50`) or is a
/// number followed by a money word (`50 dollars`).
fn monetary_tokens(tokens: &[Span<'_>], suffixes: &HashSet<String>) -> BTreeMap<usize, Option<Cents>> {
    let mut amounts = BTreeMap::new();

    for (i, token) in tokens.iter().enumerate() {
        let text = token.text;
        let symbol = text.starts_with(['$', '€', '£'])
            && text.chars().nth(1).is_some_and(|c| c.is_ascii_digit());
        let suffixed = text.starts_with(|c: char| c.is_ascii_digit())
            && tokens
                .get(i + 1)
                .is_some_and(|next| suffixes.contains(next.text));

        if symbol || suffixed {
            amounts.insert(i, Cents::parse(text));
        }
    }

    amounts
}

/// First and last token index overlapping the byte range `[start, end)`
fn token_range(tokens: &[Span<'_>], start: usize, end: usize) -> Option<(usize, usize)> {
    let first = tokens.iter().position(|t| t.end > start)?;
    let last = tokens.iter().rposition(|t| t.start < end)?;
    (first <= last).then_some((first, last))
}
