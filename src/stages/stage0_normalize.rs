use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::PipelineError;
use crate::models::{CleanedRecord, RawRecord};

/// Currency symbols preserved through normalization
const CURRENCY_SYMBOLS: [char; 3] = ['$', '€', '£'];

/// Agent name used when the raw record carries none
pub const UNKNOWN_AGENT: &str = "Unknown Agent";

/// Why a transcript could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("transcript is empty")]
    Empty,
    #[error("transcript has no text left after cleaning")]
    NoContent,
}

/// Perform Stage 0: text normalization
///
/// This stage:
/// 1. Lower-cases the text and folds smart quotes to `'`
/// 2. Replaces punctuation with spaces, keeping currency symbols, digits and
///    `.`/`,` between digits (`$1,250.50` survives intact)
/// 3. Drops control characters
/// 4. Expands contractions from a fixed table and strips leftover apostrophes
/// 5. Collapses whitespace to single spaces
///
/// The result is a pure function of the input, and normalizing already
/// normalized text returns it unchanged.
pub fn normalize(raw_text: &str) -> Result<String, NormalizeError> {
    if raw_text.trim().is_empty() {
        return Err(NormalizeError::Empty);
    }

    let chars: Vec<char> = raw_text
        .to_lowercase()
        .chars()
        .map(fold_quote)
        .collect();

    let mut stripped = String::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() || c == '\'' || CURRENCY_SYMBOLS.contains(&c) {
            stripped.push(c);
        } else if (c == '.' || c == ',')
            && i > 0
            && is_digit_at(&chars, i - 1)
            && is_digit_at(&chars, i + 1)
        {
            stripped.push(c);
        } else if c.is_control() && !c.is_whitespace() {
            continue;
        } else {
            stripped.push(' ');
        }
    }

    let mut words: Vec<String> = Vec::new();
    for word in stripped.split_whitespace() {
        let word = word.trim_matches('\'');
        if word.is_empty() {
            continue;
        }
        match expand_contraction(word) {
            Some(expansion) => words.push(expansion.to_string()),
            None => words.push(word.chars().filter(|&c| c != '\'').collect()),
        }
    }

    if words.is_empty() {
        return Err(NormalizeError::NoContent);
    }

    Ok(words.join(" "))
}

fn is_digit_at(chars: &[char], index: usize) -> bool {
    chars.get(index).is_some_and(|c| c.is_ascii_digit())
}

fn fold_quote(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201B}' | '`' | '\u{00B4}' => '\'',
        other => other,
    }
}

fn expand_contraction(word: &str) -> Option<&'static str> {
    let expansion = match word {
        "i'm" => "i am",
        "i'll" => "i will",
        "i'd" => "i would",
        "i've" => "i have",
        "you're" => "you are",
        "you'll" => "you will",
        "you've" => "you have",
        "you'd" => "you would",
        "we're" => "we are",
        "we'll" => "we will",
        "we've" => "we have",
        "we'd" => "we would",
        "they're" => "they are",
        "they'll" => "they will",
        "they've" => "they have",
        "they'd" => "they would",
        "he's" => "he is",
        "she's" => "she is",
        "it's" => "it is",
        "that's" => "that is",
        "there's" => "there is",
        "what's" => "what is",
        "let's" => "let us",
        "can't" => "cannot",
        "won't" => "will not",
        "don't" => "do not",
        "doesn't" => "does not",
        "didn't" => "did not",
        "isn't" => "is not",
        "aren't" => "are not",
        "wasn't" => "was not",
        "weren't" => "were not",
        "haven't" => "have not",
        "hasn't" => "has not",
        "hadn't" => "had not",
        "wouldn't" => "would not",
        "shouldn't" => "should not",
        "couldn't" => "could not",
        _ => return None,
    };
    Some(expansion)
}

/// Reject keys that cannot serve as a stable record key
pub fn validate_call_id(call_id: &str) -> Result<(), PipelineError> {
    let reason = if call_id.is_empty() {
        "call_id is empty"
    } else if call_id.len() > 128 {
        "call_id longer than 128 bytes"
    } else if call_id == "." || call_id == ".." {
        "call_id is a reserved name"
    } else if !call_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        "call_id may only contain ASCII letters, digits, '_', '-' and '.'"
    } else {
        return Ok(());
    };
    Err(PipelineError::invalid_input(call_id, reason))
}

/// Collapse whitespace and title-case an agent name
pub fn normalize_agent_name(agent_name: &str) -> String {
    let words: Vec<String> = agent_name
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        UNKNOWN_AGENT.to_string()
    } else {
        words.join(" ")
    }
}

/// Derive the cleaned record for a raw record
pub fn clean_record(raw: &RawRecord, processed_at: DateTime<Utc>) -> Result<CleanedRecord, PipelineError> {
    validate_call_id(&raw.call_id)?;

    let cleaned_transcript = normalize(&raw.transcript_text)
        .map_err(|e| PipelineError::invalid_input(&raw.call_id, e.to_string()))?;

    Ok(CleanedRecord {
        call_id: raw.call_id.clone(),
        agent_name: normalize_agent_name(&raw.agent_name),
        timestamp: raw.timestamp,
        cleaned_transcript,
        processed_at,
    })
}
