//! Contracts for the collaborators that live on the other side of the network.
//!
//! The intake and dashboard only see these traits; [`crate::fetch::HttpBackend`]
//! is the production implementation and tests provide in-memory fakes.

use async_trait::async_trait;

use crate::models::{RawComment, SurveyResponse, UserProfile};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("{url} answered {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Whether `email` belongs to a registered user.
    async fn check_identity(&self, email: &str) -> Result<bool, RemoteError>;
}

#[async_trait]
pub trait SubmissionService: Send + Sync {
    /// Hand the completed, ordered response list over for classification.
    async fn submit(&self, email: &str, responses: &[SurveyResponse]) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_comments(&self) -> Result<Vec<RawComment>, RemoteError>;

    async fn fetch_users(&self) -> Result<Vec<UserProfile>, RemoteError>;
}
