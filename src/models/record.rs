use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A transcript as delivered by data acquisition. Never modified after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Natural key shared by every stage
    pub call_id: String,
    pub agent_name: String,
    /// Source timestamp of the call, used as the incremental watermark axis
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub transcript_text: String,
}

/// A raw record after text normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub call_id: String,
    /// Whitespace-collapsed, title-cased agent name
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    pub cleaned_transcript: String,
    pub processed_at: DateTime<Utc>,
}

impl CleanedRecord {
    /// Compare everything except `processed_at`
    pub fn same_content(&self, other: &Self) -> bool {
        self.call_id == other.call_id
            && self.agent_name == other.agent_name
            && self.timestamp == other.timestamp
            && self.cleaned_transcript == other.cleaned_transcript
    }
}

/// Business metrics derived from a cleaned record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub call_id: String,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    pub is_conversion: bool,
    /// First conversion phrase matched, if any
    #[serde(default)]
    pub conversion_phrase: Option<String>,
    pub upsell_amount: Cents,
    /// Indicator phrase the upsell amount was found next to
    #[serde(default)]
    pub upsell_product: Option<String>,
    pub sentiment_label: Sentiment,
    #[serde(default)]
    pub sentiment_confidence: f64,
    #[serde(default)]
    pub positive_hits: i64,
    #[serde(default)]
    pub negative_hits: i64,
    /// Length of the cleaned transcript in characters
    #[serde(default)]
    pub transcript_length: usize,
    #[serde(default)]
    pub estimated_duration_seconds: u64,
    pub processed_at: DateTime<Utc>,
}

impl MetricsRecord {
    /// Compare everything except `processed_at`
    pub fn same_content(&self, other: &Self) -> bool {
        let mut a = self.clone();
        a.processed_at = other.processed_at;
        a == *other
    }
}

/// Sentiment label assigned to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        };
        f.write_str(label)
    }
}

/// Non-negative monetary amount in integer cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub u64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Parse a currency string such as `$1,250.50`, `25` or `$7.5`.
    ///
    /// Returns `None` for anything that is not a plain non-negative amount
    /// with at most two decimal places.
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.trim().trim_start_matches(['$', '€', '£']).replace(',', "");
        if digits.is_empty() {
            return None;
        }

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits.as_str(), ""),
        };

        if whole.is_empty()
            || frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let whole: u64 = whole.parse().ok()?;
        let frac: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().ok()? * 10,
            _ => frac.parse().ok()?,
        };

        whole.checked_mul(100)?.checked_add(frac).map(Cents)
    }

    pub fn as_dollars(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::Add for Cents {
    type Output = Cents;

    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_add(rhs.0))
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Self {
        iter.fold(Cents::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse RFC 3339 or a naive timestamp (taken as UTC)
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_timestamp(&text)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_parse() {
        assert_eq!(Cents::parse("$50"), Some(Cents(5_000)));
        assert_eq!(Cents::parse("$1,250.50"), Some(Cents(125_050)));
        assert_eq!(Cents::parse("7.5"), Some(Cents(750)));
        assert_eq!(Cents::parse("$"), None);
        assert_eq!(Cents::parse("$12.345"), None);
        assert_eq!(Cents::parse("$1.2.3"), None);
        assert_eq!(Cents::parse("$abc"), None);
        assert_eq!(Cents(7_500).to_string(), "75.00");
    }

    #[test]
    fn test_raw_record_accepts_naive_timestamp() {
        let json = r#"{
            "call_id": "CALL_0001",
            "agent_name": "Sarah Johnson",
            "timestamp": "2024-03-15T14:30:00",
            "transcript_text": "Hello"
        }"#;

        let record: RawRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.timestamp.to_rfc3339(), "2024-03-15T14:30:00+00:00");
    }

    #[test]
    fn test_raw_record_rejects_bad_timestamp() {
        let json = r#"{
            "call_id": "CALL_0001",
            "agent_name": "Sarah Johnson",
            "timestamp": "yesterday",
            "transcript_text": "Hello"
        }"#;

        assert!(serde_json::from_str::<RawRecord>(json).is_err());
    }

    #[test]
    fn test_sentiment_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Sentiment::Negative).unwrap(), "\"negative\"");
        assert_eq!(Sentiment::Positive.to_string(), "positive");
    }
}
