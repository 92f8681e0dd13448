use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::models::{NormalizedRecord, SentimentLabel, UserProfile};

/// Dashboard age bands. The upper band is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgeCohort {
    #[serde(rename = "18-25")]
    From18To25,
    #[serde(rename = "26-35")]
    From26To35,
    #[serde(rename = "36-45")]
    From36To45,
    #[serde(rename = "46-60")]
    From46To60,
    #[serde(rename = "60+")]
    Over60,
}

impl AgeCohort {
    pub const ALL: [AgeCohort; 5] = [
        Self::From18To25,
        Self::From26To35,
        Self::From36To45,
        Self::From46To60,
        Self::Over60,
    ];

    /// Band containing `age`, if any. Ages between bands (25.5) or under 18 have none.
    pub fn for_age(age: f64) -> Option<Self> {
        if !age.is_finite() {
            return None;
        }
        if (18.0..=25.0).contains(&age) {
            Some(Self::From18To25)
        } else if (26.0..=35.0).contains(&age) {
            Some(Self::From26To35)
        } else if (36.0..=45.0).contains(&age) {
            Some(Self::From36To45)
        } else if (46.0..=60.0).contains(&age) {
            Some(Self::From46To60)
        } else if age > 60.0 {
            Some(Self::Over60)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::From18To25 => "18-25",
            Self::From26To35 => "26-35",
            Self::From36To45 => "36-45",
            Self::From46To60 => "46-60",
            Self::Over60 => "60+",
        }
    }
}

impl fmt::Display for AgeCohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Email → cohort lookup built from the user roster.
#[derive(Debug, Clone, Default)]
pub struct UserRoster {
    cohorts: HashMap<String, Option<AgeCohort>>,
}

impl UserRoster {
    pub fn new(users: &[UserProfile]) -> Self {
        let cohorts = users
            .iter()
            .map(|u| (u.email.clone(), u.age.and_then(AgeCohort::for_age)))
            .collect();
        Self { cohorts }
    }

    /// `None` both for unknown users and for users without a usable age.
    pub fn cohort_of(&self, email: &str) -> Option<AgeCohort> {
        self.cohorts.get(email).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.cohorts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty()
    }
}

/// A single user-driven change to the selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEvent {
    ToggleYear(String),
    ToggleCohort(AgeCohort),
    ToggleSentiment(SentimentLabel),
}

/// Current dashboard selection.
///
/// An empty year or cohort set lets nothing through, so construct it with
/// [`FilterState::all`] rather than `Default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterState {
    selected_years: BTreeSet<String>,
    selected_cohorts: BTreeSet<AgeCohort>,
    selected_sentiment: Option<SentimentLabel>,
}

impl FilterState {
    /// Everything selected, no sentiment restriction.
    pub fn all<I, S>(known_years: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selected_years: known_years.into_iter().map(Into::into).collect(),
            selected_cohorts: AgeCohort::ALL.into_iter().collect(),
            selected_sentiment: None,
        }
    }

    pub fn selected_years(&self) -> impl Iterator<Item = &str> {
        self.selected_years.iter().map(String::as_str)
    }

    pub fn selected_cohorts(&self) -> impl Iterator<Item = AgeCohort> + '_ {
        self.selected_cohorts.iter().copied()
    }

    pub fn selected_sentiment(&self) -> Option<SentimentLabel> {
        self.selected_sentiment
    }

    pub fn is_year_selected(&self, year: &str) -> bool {
        self.selected_years.contains(year)
    }

    pub fn is_cohort_selected(&self, cohort: AgeCohort) -> bool {
        self.selected_cohorts.contains(&cohort)
    }

    /// Returns whether the year is selected afterwards.
    pub fn toggle_year(&mut self, year: &str) -> bool {
        if self.selected_years.remove(year) {
            false
        } else {
            self.selected_years.insert(year.to_string());
            true
        }
    }

    pub fn toggle_cohort(&mut self, cohort: AgeCohort) -> bool {
        if self.selected_cohorts.remove(&cohort) {
            false
        } else {
            self.selected_cohorts.insert(cohort);
            true
        }
    }

    /// Radio semantics: picking the active label clears the sentiment filter.
    pub fn toggle_sentiment(&mut self, label: SentimentLabel) -> Option<SentimentLabel> {
        self.selected_sentiment = match self.selected_sentiment {
            Some(current) if current == label => None,
            _ => Some(label),
        };
        self.selected_sentiment
    }

    pub fn apply(&mut self, event: &FilterEvent) {
        match event {
            FilterEvent::ToggleYear(y) => {
                self.toggle_year(y);
            }
            FilterEvent::ToggleCohort(c) => {
                self.toggle_cohort(*c);
            }
            FilterEvent::ToggleSentiment(l) => {
                self.toggle_sentiment(*l);
            }
        }
    }

    /// Whether a single record passes every active dimension.
    pub fn admits(&self, record: &NormalizedRecord, roster: &UserRoster) -> bool {
        if !self.selected_years.contains(&record.year.to_string()) {
            return false;
        }
        if let Some(wanted) = self.selected_sentiment {
            if record.label != wanted {
                return false;
            }
        }
        roster
            .cohort_of(&record.user)
            .is_some_and(|c| self.selected_cohorts.contains(&c))
    }

    pub fn describe(&self) -> String {
        let sentiment = self
            .selected_sentiment
            .map(|l| l.to_string())
            .unwrap_or_else(|| "any".to_string());
        format!(
            "years=[{}] cohorts=[{}] sentiment={}",
            self.selected_years.iter().join(","),
            self.selected_cohorts.iter().join(","),
            sentiment
        )
    }
}

/// Records passing `filter`, in input order. Input is left untouched.
pub fn apply_filters(
    records: &[NormalizedRecord],
    filter: &FilterState,
    roster: &UserRoster,
) -> Vec<NormalizedRecord> {
    records
        .iter()
        .filter(|r| filter.admits(r, roster))
        .cloned()
        .collect()
}

/// Roster rows visible under the cohort selection (the users table).
pub fn visible_users<'a>(users: &'a [UserProfile], filter: &FilterState) -> Vec<&'a UserProfile> {
    users
        .iter()
        .filter(|u| {
            u.age
                .and_then(AgeCohort::for_age)
                .is_some_and(|c| filter.is_cohort_selected(c))
        })
        .collect()
}
