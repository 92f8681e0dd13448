// src/render.rs
use serde::Serialize;
use serde_json::{json, Value};

use crate::aggregate::{Aggregation, MonthBucket, SentimentCounts};
use crate::filter::AgeCohort;
use crate::models::SentimentLabel;

/// Chart slots owned by the dashboard. Each holds at most one live chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartTarget {
    SentimentDistribution,
    AverageByMonth,
    VarianceByMonth,
    PositiveTrend,
    UsersByCohort,
}

impl ChartTarget {
    pub const ALL: [ChartTarget; 5] = [
        Self::SentimentDistribution,
        Self::AverageByMonth,
        Self::VarianceByMonth,
        Self::PositiveTrend,
        Self::UsersByCohort,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Self::SentimentDistribution => "sentiment",
            Self::AverageByMonth => "avg",
            Self::VarianceByMonth => "var",
            Self::PositiveTrend => "trend",
            Self::UsersByCohort => "users",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Pie,
    Line,
    Bar,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub label: Option<String>,
    pub data: Vec<f64>,
    pub colors: Vec<String>,
}

/// Everything a sink needs to draw one chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSpec {
    pub target: ChartTarget,
    pub kind: ChartKind,
    pub labels: Vec<String>,
    pub series: Vec<Series>,
    pub options: Value,
}

/// Render-ready result of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub filter_summary: String,
    pub aggregation: Aggregation,
    pub cohort_counts: Vec<(AgeCohort, usize)>,
    pub total_users: usize,
    pub records_total: usize,
    pub records_in_view: usize,
    pub malformed: usize,
}

fn month_labels(monthly: &[MonthBucket]) -> Vec<String> {
    monthly.iter().map(|b| b.month().to_string()).collect()
}

fn colors(cs: &[&str]) -> Vec<String> {
    cs.iter().map(|c| c.to_string()).collect()
}

pub fn sentiment_distribution(counts: &SentimentCounts) -> ChartSpec {
    let labels = SentimentLabel::ALL
        .iter()
        .map(|l| l.display_name().to_string())
        .collect();
    let data = SentimentLabel::ALL
        .iter()
        .map(|&l| counts.get(l) as f64)
        .collect();
    ChartSpec {
        target: ChartTarget::SentimentDistribution,
        kind: ChartKind::Pie,
        labels,
        series: vec![Series {
            label: None,
            data,
            colors: colors(&["#4CAF50", "#FFC107", "#F44336"]),
        }],
        options: json!({
            "responsive": true,
            "plugins": { "legend": { "position": "top" } }
        }),
    }
}

pub fn average_by_month(monthly: &[MonthBucket]) -> ChartSpec {
    ChartSpec {
        target: ChartTarget::AverageByMonth,
        kind: ChartKind::Line,
        labels: month_labels(monthly),
        series: vec![Series {
            label: Some("Sentimiento Promedio".into()),
            data: monthly.iter().map(MonthBucket::average).collect(),
            colors: colors(&["#1E90FF"]),
        }],
        options: json!({
            "responsive": true,
            "scales": { "y": { "beginAtZero": true, "suggestedMin": -2, "suggestedMax": 2 } }
        }),
    }
}

pub fn variance_by_month(monthly: &[MonthBucket]) -> ChartSpec {
    ChartSpec {
        target: ChartTarget::VarianceByMonth,
        kind: ChartKind::Bar,
        labels: month_labels(monthly),
        series: vec![Series {
            label: Some("Varianza del Sentimiento".into()),
            data: monthly.iter().map(MonthBucket::variance).collect(),
            colors: colors(&["#FF6347"]),
        }],
        options: json!({
            "responsive": true,
            "scales": { "y": { "beginAtZero": true, "suggestedMax": 2 } }
        }),
    }
}

/// Monthly average clipped at zero: only net-positive months show height.
pub fn positive_trend(monthly: &[MonthBucket]) -> ChartSpec {
    ChartSpec {
        target: ChartTarget::PositiveTrend,
        kind: ChartKind::Line,
        labels: month_labels(monthly),
        series: vec![Series {
            label: Some("Tendencia de Comentarios Positivos".into()),
            data: monthly.iter().map(|b| b.average().max(0.0)).collect(),
            colors: colors(&["#4CAF50"]),
        }],
        options: json!({
            "responsive": true,
            "scales": { "y": { "beginAtZero": true } }
        }),
    }
}

pub fn users_by_cohort(cohort_counts: &[(AgeCohort, usize)], total_users: usize) -> ChartSpec {
    ChartSpec {
        target: ChartTarget::UsersByCohort,
        kind: ChartKind::Bar,
        labels: cohort_counts.iter().map(|(c, _)| c.label().to_string()).collect(),
        series: vec![Series {
            label: Some("Cantidad de Usuarios".into()),
            data: cohort_counts.iter().map(|&(_, n)| n as f64).collect(),
            colors: colors(&["#4B0082", "#1E90FF", "#FF6347", "#FFC107", "#A9A9A9"]),
        }],
        options: json!({
            "responsive": true,
            "scales": { "y": { "beginAtZero": true } },
            "plugins": {
                "legend": { "position": "top" },
                "title": { "display": true, "text": format!("Total Usuarios: {}", total_users) }
            }
        }),
    }
}

/// One spec per [`ChartTarget`], in `ChartTarget::ALL` order.
pub fn build_charts(view: &DashboardView) -> Vec<ChartSpec> {
    let monthly = &view.aggregation.monthly;
    vec![
        sentiment_distribution(&view.aggregation.sentiment_counts),
        average_by_month(monthly),
        variance_by_month(monthly),
        positive_trend(monthly),
        users_by_cohort(&view.cohort_counts, view.total_users),
    ]
}

pub fn render_summary_text(view: &DashboardView, stale: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(&format!("Filters: {}\n", view.filter_summary));
    out.push_str(&format!(
        "Records: {} in view / {} fetched ({} malformed)\n",
        view.records_in_view, view.records_total, view.malformed
    ));
    if let Some(reason) = stale {
        out.push_str(&format!("!! Showing stale data: {}\n", reason));
    }

    let c = &view.aggregation.sentiment_counts;
    out.push_str(&format!(
        "\nSentiment: positive={} neutral={} negative={}\n",
        c.positive, c.neutral, c.negative
    ));

    if !view.aggregation.monthly.is_empty() {
        out.push_str("\nBy month:\n");
        for b in &view.aggregation.monthly {
            out.push_str(&format!(
                "- {}: n={} avg={:+.2} var={:.2}\n",
                b.month(),
                b.count(),
                b.average(),
                b.variance()
            ));
        }
    }

    if view.total_users > 0 {
        out.push_str(&format!("\nUsers ({} total):\n", view.total_users));
        for (cohort, n) in &view.cohort_counts {
            out.push_str(&format!("- {}: {}\n", cohort, n));
        }
    }

    out
}
