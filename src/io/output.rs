use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::models::{Cents, MetricsRecord, Sentiment};

/// Calls per sentiment label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentDistribution {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

impl SentimentDistribution {
    fn add(&mut self, label: Sentiment) {
        match label {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Neutral => self.neutral += 1,
            Sentiment::Negative => self.negative += 1,
        }
    }
}

/// Per-agent KPIs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub agent_name: String,
    pub total_calls: usize,
    pub conversions: usize,
    /// Percentage, two decimals
    pub conversion_rate: f64,
    pub upsell_revenue: Cents,
    pub avg_upsell_per_call: Cents,
    pub sentiment: SentimentDistribution,
}

/// KPIs for the calls of one UTC calendar day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMetrics {
    pub date: NaiveDate,
    pub total_calls: usize,
    pub conversions: usize,
    /// Percentage, two decimals
    pub conversion_rate: f64,
    pub upsell_revenue: Cents,
    /// Mean sentiment confidence, two decimals
    pub avg_sentiment_confidence: f64,
    pub sentiment: SentimentDistribution,
}

/// KPI summary over the metrics store
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub total_calls: usize,
    pub total_conversions: usize,
    /// Percentage, two decimals
    pub conversion_rate: f64,
    pub total_upsell: Cents,
    pub avg_upsell_per_call: Cents,
    pub sentiment: SentimentDistribution,
    /// Ordered by conversion rate, then upsell revenue, both descending
    pub agents: Vec<AgentStats>,
    /// One entry per call date, oldest first
    pub daily: Vec<DailyMetrics>,
}

impl PerformanceReport {
    pub fn from_metrics(metrics: &[MetricsRecord], generated_at: DateTime<Utc>) -> Self {
        let mut sentiment = SentimentDistribution::default();
        let mut by_agent: BTreeMap<&str, Vec<&MetricsRecord>> = BTreeMap::new();
        let mut by_day: BTreeMap<NaiveDate, Vec<&MetricsRecord>> = BTreeMap::new();
        for record in metrics {
            sentiment.add(record.sentiment_label);
            by_agent.entry(record.agent_name.as_str()).or_default().push(record);
            by_day.entry(record.timestamp.date_naive()).or_default().push(record);
        }

        let total_conversions = metrics.iter().filter(|m| m.is_conversion).count();
        let total_upsell: Cents = metrics.iter().map(|m| m.upsell_amount).sum();

        let mut agents: Vec<AgentStats> = by_agent
            .into_iter()
            .map(|(agent_name, calls)| agent_stats(agent_name, &calls))
            .collect();
        agents.sort_by(|a, b| {
            b.conversion_rate
                .total_cmp(&a.conversion_rate)
                .then_with(|| b.upsell_revenue.cmp(&a.upsell_revenue))
                .then_with(|| a.agent_name.cmp(&b.agent_name))
        });

        Self {
            generated_at,
            total_calls: metrics.len(),
            total_conversions,
            conversion_rate: percentage(total_conversions, metrics.len()),
            total_upsell,
            avg_upsell_per_call: average(total_upsell, metrics.len()),
            sentiment,
            agents,
            daily: by_day
                .into_iter()
                .map(|(date, calls)| daily_metrics(date, &calls))
                .collect(),
        }
    }

    /// Write to a JSON file
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;
        serde_json::to_writer_pretty(file, self).context("Failed to write JSON")?;
        Ok(())
    }

    /// Format the report as human-readable text
    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str("Performance Report\n");
        out.push_str("==================\n");
        out.push_str(&format!("Generated: {}\n", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")));
        out.push_str(&format!("Total calls: {}\n", self.total_calls));
        out.push_str(&format!(
            "Conversions: {} ({:.2}%)\n",
            self.total_conversions, self.conversion_rate
        ));
        out.push_str(&format!("Upsell revenue: ${}\n", self.total_upsell));
        out.push_str(&format!("Avg upsell per call: ${}\n", self.avg_upsell_per_call));
        out.push_str(&format!(
            "Sentiment: {} positive, {} neutral, {} negative\n",
            self.sentiment.positive, self.sentiment.neutral, self.sentiment.negative
        ));

        if !self.agents.is_empty() {
            out.push('\n');
            out.push_str("Agents\n");
            out.push_str("------\n");
            for agent in &self.agents {
                out.push_str(&format!(
                    "{:<24} {:>4} calls  {:>4} conv ({:>6.2}%)  ${:>10}  +{} / -{}\n",
                    agent.agent_name,
                    agent.total_calls,
                    agent.conversions,
                    agent.conversion_rate,
                    agent.upsell_revenue.to_string(),
                    agent.sentiment.positive,
                    agent.sentiment.negative
                ));
            }
        }

        if !self.daily.is_empty() {
            out.push('\n');
            out.push_str("Daily\n");
            out.push_str("-----\n");
            for day in &self.daily {
                out.push_str(&format!(
                    "{}  {:>4} calls  {:>4} conv ({:>6.2}%)  ${:>10}  confidence {:.2}\n",
                    day.date,
                    day.total_calls,
                    day.conversions,
                    day.conversion_rate,
                    day.upsell_revenue.to_string(),
                    day.avg_sentiment_confidence
                ));
            }
        }

        out
    }

    /// Write to a text file
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;
        write!(file, "{}", self.format())?;
        Ok(())
    }
}

fn agent_stats(agent_name: &str, calls: &[&MetricsRecord]) -> AgentStats {
    let conversions = calls.iter().filter(|m| m.is_conversion).count();
    let upsell_revenue: Cents = calls.iter().map(|m| m.upsell_amount).sum();
    let mut sentiment = SentimentDistribution::default();
    for call in calls {
        sentiment.add(call.sentiment_label);
    }

    AgentStats {
        agent_name: agent_name.to_string(),
        total_calls: calls.len(),
        conversions,
        conversion_rate: percentage(conversions, calls.len()),
        upsell_revenue,
        avg_upsell_per_call: average(upsell_revenue, calls.len()),
        sentiment,
    }
}

fn daily_metrics(date: NaiveDate, calls: &[&MetricsRecord]) -> DailyMetrics {
    let conversions = calls.iter().filter(|m| m.is_conversion).count();
    let mut sentiment = SentimentDistribution::default();
    for call in calls {
        sentiment.add(call.sentiment_label);
    }
    let confidence: f64 = calls.iter().map(|m| m.sentiment_confidence).sum();

    DailyMetrics {
        date,
        total_calls: calls.len(),
        conversions,
        conversion_rate: percentage(conversions, calls.len()),
        upsell_revenue: calls.iter().map(|m| m.upsell_amount).sum(),
        avg_sentiment_confidence: (confidence * 100.0 / calls.len().max(1) as f64).round() / 100.0,
        sentiment,
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

/// Mean amount, rounded half up to the cent
fn average(total: Cents, count: usize) -> Cents {
    if count == 0 {
        return Cents::ZERO;
    }
    let count = count as u64;
    Cents((total.0 + count / 2) / count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metrics(agent: &str, conversion: bool, upsell: u64, sentiment: Sentiment) -> MetricsRecord {
        MetricsRecord {
            call_id: format!("CALL_{agent}_{upsell}"),
            agent_name: agent.to_string(),
            timestamp: Utc::now(),
            is_conversion: conversion,
            conversion_phrase: None,
            upsell_amount: Cents(upsell),
            upsell_product: None,
            sentiment_label: sentiment,
            sentiment_confidence: 0.0,
            positive_hits: 0,
            negative_hits: 0,
            transcript_length: 0,
            estimated_duration_seconds: 0,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_totals() {
        let records = vec![
            metrics("Emily Rodriguez", true, 5_000, Sentiment::Positive),
            metrics("Emily Rodriguez", false, 0, Sentiment::Neutral),
            metrics("James Brown", true, 12_000, Sentiment::Positive),
            metrics("James Brown", true, 2_500, Sentiment::Negative),
            metrics("James Brown", false, 0, Sentiment::Negative),
        ];

        let report = PerformanceReport::from_metrics(&records, Utc::now());

        assert_eq!(report.total_calls, 5);
        assert_eq!(report.total_conversions, 3);
        assert_eq!(report.conversion_rate, 60.0);
        assert_eq!(report.total_upsell, Cents(19_500));
        assert_eq!(report.avg_upsell_per_call, Cents(3_900));
        assert_eq!(
            report.sentiment,
            SentimentDistribution {
                positive: 2,
                neutral: 1,
                negative: 2
            }
        );

        assert_eq!(report.agents[0].agent_name, "James Brown");
        assert_eq!(report.agents[0].conversion_rate, 66.67);
        assert_eq!(report.agents[1].conversion_rate, 50.0);
        assert!(report.format().contains("Conversions: 3 (60.00%)"));
    }

    #[test]
    fn test_daily_rollup() {
        let day = |d: u32, hour: u32| Utc.with_ymd_and_hms(2024, 3, d, hour, 0, 0).unwrap();
        let mut first = metrics("Emily Rodriguez", true, 5_000, Sentiment::Positive);
        first.timestamp = day(2, 9);
        first.sentiment_confidence = 0.2;
        let mut second = metrics("James Brown", false, 1_000, Sentiment::Negative);
        second.timestamp = day(2, 17);
        second.sentiment_confidence = 0.1;
        let mut earlier = metrics("James Brown", true, 0, Sentiment::Neutral);
        earlier.timestamp = day(1, 23);

        let report = PerformanceReport::from_metrics(&[first, second, earlier], Utc::now());

        assert_eq!(report.daily.len(), 2);
        assert_eq!(report.daily[0].date, day(1, 0).date_naive());
        assert_eq!(report.daily[0].total_calls, 1);

        let busy = &report.daily[1];
        assert_eq!(busy.total_calls, 2);
        assert_eq!(busy.conversion_rate, 50.0);
        assert_eq!(busy.upsell_revenue, Cents(6_000));
        assert_eq!(busy.avg_sentiment_confidence, 0.15);
        assert_eq!(busy.sentiment.negative, 1);
        assert!(report.format().contains("2024-03-02"));
    }

    #[test]
    fn test_write_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let report = PerformanceReport::from_metrics(
            &[metrics("Lisa Thompson", true, 7_500, Sentiment::Positive)],
            Utc::now(),
        );

        report.write_file(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), report.format());
    }

    #[test]
    fn test_empty_report() {
        let report = PerformanceReport::from_metrics(&[], Utc::now());
        assert_eq!(report.total_calls, 0);
        assert_eq!(report.conversion_rate, 0.0);
        assert_eq!(report.avg_upsell_per_call, Cents::ZERO);
        assert!(report.agents.is_empty());
        assert!(report.daily.is_empty());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = PerformanceReport::from_metrics(
            &[metrics("Lisa Thompson", true, 7_500, Sentiment::Positive)],
            Utc::now(),
        );

        report.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["total_upsell"], 7_500);
        assert_eq!(value["agents"][0]["agent_name"], "Lisa Thompson");
    }
}
