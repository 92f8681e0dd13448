use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::models::{NormalizedRecord, SentimentLabel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentCounts {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

impl SentimentCounts {
    pub fn record(&mut self, label: SentimentLabel) {
        match label {
            SentimentLabel::Positive => self.positive += 1,
            SentimentLabel::Neutral => self.neutral += 1,
            SentimentLabel::Negative => self.negative += 1,
        }
    }

    pub fn get(&self, label: SentimentLabel) -> usize {
        match label {
            SentimentLabel::Positive => self.positive,
            SentimentLabel::Neutral => self.neutral,
            SentimentLabel::Negative => self.negative,
        }
    }

    pub fn total(&self) -> usize {
        self.positive + self.neutral + self.negative
    }
}

/// Per-month score accumulator. Only ever created holding one score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthBucket {
    month: String,
    total_score: i64,
    scores: Vec<i8>,
}

impl MonthBucket {
    fn new(month: String, first: i8) -> Self {
        Self {
            month,
            total_score: first as i64,
            scores: vec![first],
        }
    }

    fn push(&mut self, score: i8) {
        self.total_score += score as i64;
        self.scores.push(score);
    }

    pub fn month(&self) -> &str {
        &self.month
    }

    pub fn total_score(&self) -> i64 {
        self.total_score
    }

    pub fn count(&self) -> usize {
        self.scores.len()
    }

    pub fn scores(&self) -> &[i8] {
        &self.scores
    }

    pub fn average(&self) -> f64 {
        self.total_score as f64 / self.count() as f64
    }

    /// Population variance; a single sample has none.
    pub fn variance(&self) -> f64 {
        let avg = self.average();
        let sum_sq: f64 = self
            .scores
            .iter()
            .map(|&s| (s as f64 - avg).powi(2))
            .sum();
        sum_sq / self.count() as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregation {
    pub sentiment_counts: SentimentCounts,
    pub monthly: Vec<MonthBucket>, // first-seen order, not chronological
}

impl Aggregation {
    pub fn bucket(&self, month: &str) -> Option<&MonthBucket> {
        self.monthly.iter().find(|b| b.month == month)
    }
}

/// Count labels and bucket scores by month in a single pass.
pub fn aggregate_by_month(records: &[NormalizedRecord]) -> Aggregation {
    let mut agg = Aggregation::default();
    let mut slot: HashMap<&str, usize> = HashMap::new();

    for r in records {
        agg.sentiment_counts.record(r.label);
        match slot.get(r.month.as_str()) {
            Some(&i) => agg.monthly[i].push(r.score),
            None => {
                slot.insert(r.month.as_str(), agg.monthly.len());
                agg.monthly.push(MonthBucket::new(r.month.clone(), r.score));
            }
        }
    }

    debug!(
        "Aggregated records - records={}, months={}",
        records.len(),
        agg.monthly.len()
    );
    agg
}
