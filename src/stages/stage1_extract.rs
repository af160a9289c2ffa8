use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{CleanedRecord, MetricsRecord};
use crate::rules::RuleSet;

/// Assumed speaking rate for duration estimates
const WORDS_PER_MINUTE: f64 = 150.0;
/// Allowance for pauses and hold time on top of speaking time
const PAUSE_FACTOR: f64 = 1.3;

/// Perform Stage 1: business metric extraction
///
/// Applies conversion detection, upsell extraction and sentiment
/// classification to the cleaned transcript. Pure apart from the supplied
/// `processed_at`.
pub fn extract_metrics(
    cleaned: &CleanedRecord,
    rules: &RuleSet,
    processed_at: DateTime<Utc>,
) -> MetricsRecord {
    let extraction = rules.extract(&cleaned.cleaned_transcript);

    debug!(
        call_id = %cleaned.call_id,
        is_conversion = extraction.is_conversion,
        upsell = %extraction.upsell_amount,
        sentiment = %extraction.sentiment_label,
        "Extracted metrics"
    );

    MetricsRecord {
        call_id: cleaned.call_id.clone(),
        agent_name: cleaned.agent_name.clone(),
        timestamp: cleaned.timestamp,
        is_conversion: extraction.is_conversion,
        conversion_phrase: extraction.conversion_phrase,
        upsell_amount: extraction.upsell_amount,
        upsell_product: extraction.upsell_product,
        sentiment_label: extraction.sentiment_label,
        sentiment_confidence: extraction.sentiment_confidence,
        positive_hits: extraction.positive_hits,
        negative_hits: extraction.negative_hits,
        transcript_length: cleaned.cleaned_transcript.chars().count(),
        estimated_duration_seconds: estimate_duration_seconds(&cleaned.cleaned_transcript),
        processed_at,
    }
}

/// Rough call length from word count
pub fn estimate_duration_seconds(text: &str) -> u64 {
    let words = text.split_whitespace().count() as f64;
    (words / WORDS_PER_MINUTE * PAUSE_FACTOR * 60.0) as u64
}
