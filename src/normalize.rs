use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::models::{NormalizedRecord, RawComment, SentimentLabel};

const POSITIVE_TOKEN: &str = "positivo";
const NEUTRAL_TOKEN: &str = "neutro";

/// Why a raw comment was left out of aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    #[error("missing sentiment label")]
    MissingLabel,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("unparseable timestamp")]
    UnparseableTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record {index} from {user:?} excluded: {reason}")]
pub struct MalformedRecord {
    pub index: usize, // position in the fetched snapshot
    pub user: String,
    pub reason: MalformedReason,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<NormalizedRecord>,
    pub malformed: Vec<MalformedRecord>,
}

/// Map a raw label onto the three canonical sentiments.
///
/// Only `positivo` and `neutro` are recognised (case, surrounding whitespace
/// and Unicode composition ignored); everything else is negative.
pub fn classify_label(raw: &str) -> SentimentLabel {
    let canon = raw.trim().nfc().collect::<String>().to_lowercase();
    match canon.as_str() {
        POSITIVE_TOKEN => SentimentLabel::Positive,
        NEUTRAL_TOKEN => SentimentLabel::Neutral,
        _ => SentimentLabel::Negative,
    }
}

/// Parse the timestamp formats the backend has been seen to emit.
///
/// Offset-carrying values keep their instant; naive date-times are read as
/// wall-clock time in `tz`; bare dates are local midnight in `tz`, so they
/// keep their calendar day.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&tz));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return tz.from_local_datetime(&naive).earliest();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        // midnight can be skipped by a DST jump; fall back to the first hour that exists
        return tz.from_local_datetime(&midnight).earliest().or_else(|| {
            (1..=3)
                .filter_map(|h| date.and_hms_opt(h, 0, 0))
                .find_map(|t| tz.from_local_datetime(&t).earliest())
        });
    }
    None
}

/// Month bucket key, e.g. `2024-March`.
pub fn month_key(ts: &DateTime<Tz>) -> String {
    format!("{}-{}", ts.year(), ts.format("%B"))
}

fn normalize_one(comment: &RawComment, tz: Tz) -> Result<NormalizedRecord, MalformedReason> {
    let label = comment
        .sentiment_label
        .as_deref()
        .filter(|l| !l.trim().is_empty())
        .map(classify_label)
        .ok_or(MalformedReason::MissingLabel)?;
    let raw_ts = comment
        .timestamp
        .as_deref()
        .ok_or(MalformedReason::MissingTimestamp)?;
    let timestamp = parse_timestamp(raw_ts, tz).ok_or(MalformedReason::UnparseableTimestamp)?;

    Ok(NormalizedRecord {
        user: comment.user.clone(),
        month: month_key(&timestamp),
        year: timestamp.year(),
        label,
        score: label.score(),
        timestamp,
    })
}

/// Turn a fetched snapshot into scored records.
///
/// Pure over its input; malformed comments are dropped from `records` and
/// listed in `malformed` instead of failing the batch.
pub fn normalize(comments: &[RawComment], tz: Tz) -> Normalized {
    let mut out = Normalized {
        records: Vec::with_capacity(comments.len()),
        malformed: Vec::new(),
    };

    for (index, c) in comments.iter().enumerate() {
        match normalize_one(c, tz) {
            Ok(rec) => out.records.push(rec),
            Err(reason) => {
                debug!("Excluding record - index={}, user={}, reason={}", index, c.user, reason);
                out.malformed.push(MalformedRecord {
                    index,
                    user: c.user.clone(),
                    reason,
                });
            }
        }
    }

    if !out.malformed.is_empty() {
        warn!(
            "Normalization excluded malformed records - excluded={}, kept={}",
            out.malformed.len(),
            out.records.len()
        );
    }
    out
}
