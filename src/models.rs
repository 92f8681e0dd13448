use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One survey answer with its metadata, in the canonical in-memory shape.
///
/// Produced by the ingestion adapter in `api_types`; never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawComment {
    pub user: String, // email
    pub prompt: String,
    pub answer: String,
    pub sentiment_label: Option<String>, // raw, locale-specific ("positivo", "Neutro", ...)
    pub timestamp: Option<String>,       // ISO-ish, parsed during normalize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 3] = [Self::Positive, Self::Neutral, Self::Negative];

    /// Numeric encoding used by the monthly statistics.
    pub fn score(self) -> i8 {
        match self {
            Self::Positive => 1,
            Self::Neutral => 0,
            Self::Negative => -1,
        }
    }

    /// Label shown on dashboard charts.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Positive => "Positivo",
            Self::Neutral => "Neutral",
            Self::Negative => "Negativo",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        };
        f.write_str(s)
    }
}

/// Derived view of a `RawComment` that made it through normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub user: String,
    pub month: String, // "2024-March"
    pub year: i32,
    pub label: SentimentLabel,
    pub score: i8,
    pub timestamp: DateTime<Tz>,
}

/// Roster entry joined against comments for age-cohort filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    pub name: Option<String>,
    pub age: Option<f64>, // None when the backend value is missing or not a number
}

/// One captured intake answer, paired with the prompt it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub prompt: String,
    pub answer: String,
}
