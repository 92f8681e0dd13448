//! Survey intake and sentiment dashboard.
//!
//! `intake` collects one user's answers to a fixed script and submits them
//! for classification. `dashboard` pulls the classified comments back,
//! filters and aggregates them by month, and keeps a set of charts current.

pub mod aggregate;
pub mod api_types;
pub mod config;
pub mod dashboard;
pub mod fetch;
pub mod filter;
pub mod intake;
pub mod models;
pub mod normalize;
pub mod prompts;
pub mod remote;
pub mod render;
pub mod viz_export;

pub use config::AppConfig;
pub use dashboard::{compute_view, spawn_auto_refresh, DashboardController, RefreshOutcome};
pub use fetch::HttpBackend;
pub use filter::{AgeCohort, FilterEvent, FilterState};
pub use intake::{IntakeError, IntakeEvent, IntakeState, ResponseCollector};
pub use models::{RawComment, SentimentLabel, SurveyResponse, UserProfile};
pub use remote::{IdentityService, RecordSource, RemoteError, SubmissionService};
