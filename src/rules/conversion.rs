use regex::Regex;

use super::{compile_pattern, RuleConfig, RuleError};

/// Maximum length kept for a matched conversion phrase
const MAX_PHRASE_LEN: usize = 255;

/// Ordered conversion phrase patterns.
///
/// Detection is an OR over all patterns; order only decides which phrase is
/// reported when several match.
#[derive(Debug, Clone)]
pub struct ConversionRules {
    patterns: Vec<Regex>,
}

impl ConversionRules {
    pub fn compile(config: &RuleConfig) -> Result<Self, RuleError> {
        let patterns = config
            .conversion_patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Return the first matching conversion phrase, if any
    pub fn detect(&self, cleaned_text: &str) -> Option<String> {
        self.patterns.iter().find_map(|pattern| {
            pattern.find(cleaned_text).map(|m| {
                let phrase = m.as_str();
                match phrase.char_indices().nth(MAX_PHRASE_LEN) {
                    Some((cut, _)) => phrase[..cut].to_string(),
                    None => phrase.to_string(),
                }
            })
        })
    }

    pub fn is_conversion(&self, cleaned_text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(cleaned_text))
    }
}
