use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::api_types::{ApiCheckUser, ApiComment, ApiErrorBody, ApiSubmission, ApiUser};
use crate::models::{RawComment, SurveyResponse, UserProfile};
use crate::remote::{IdentityService, RecordSource, RemoteError, SubmissionService};

/// HTTP client for the survey backend (`/check_user`, `/sentiment_analysis`,
/// `/comments`, `/users`).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, mut base: Url) -> Self {
        // Url::join drops the last path segment unless it ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, name: &str) -> Result<Url, RemoteError> {
        self.base.join(name).map_err(|e| RemoteError::Http {
            url: format!("{}{}", self.base, name),
            message: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, RemoteError> {
        let url = self.endpoint(name)?;
        let start = std::time::Instant::now();
        debug!("Fetching - url={}", url);

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| http_error(&url, e))?;
        let resp = ensure_success(&url, resp).await?;
        let body = resp.json::<T>().await.map_err(|e| RemoteError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        debug!(
            "Fetch completed - url={}, duration={:.2}s",
            url,
            start.elapsed().as_secs_f32()
        );
        Ok(body)
    }
}

fn http_error(url: &Url, e: reqwest::Error) -> RemoteError {
    RemoteError::Http {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// Turn a non-2xx response into a `RemoteError`, using the backend's
/// `{"error": ...}` body when it has one.
async fn ensure_success(url: &Url, resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());

    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(message));
    }
    Err(RemoteError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl IdentityService for HttpBackend {
    async fn check_identity(&self, email: &str) -> Result<bool, RemoteError> {
        let url = self.endpoint("check_user")?;
        let resp = self
            .client
            .post(url.clone())
            .json(&ApiCheckUser {
                email: email.to_string(),
            })
            .send()
            .await
            .map_err(|e| http_error(&url, e))?;

        match ensure_success(&url, resp).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(reason)) => {
                debug!("Identity unknown - email={}, reason={}", email, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SubmissionService for HttpBackend {
    async fn submit(&self, email: &str, responses: &[SurveyResponse]) -> Result<(), RemoteError> {
        let url = self.endpoint("sentiment_analysis")?;
        let start = std::time::Instant::now();
        let resp = self
            .client
            .post(url.clone())
            .json(&ApiSubmission::new(email, responses))
            .send()
            .await
            .map_err(|e| http_error(&url, e))?;
        ensure_success(&url, resp).await?;

        info!(
            "Responses submitted - email={}, answers={}, duration={:.2}s",
            email,
            responses.len(),
            start.elapsed().as_secs_f32()
        );
        Ok(())
    }
}

#[async_trait]
impl RecordSource for HttpBackend {
    async fn fetch_comments(&self) -> Result<Vec<RawComment>, RemoteError> {
        let api: Vec<serde_json::Value> = self.get_json("comments").await?;
        let comments: Vec<RawComment> = api
            .into_iter()
            .map(|v| ApiComment::from_value(v).into_raw())
            .collect();
        let unlabeled = comments.iter().filter(|c| c.sentiment_label.is_none()).count();
        if unlabeled > 0 {
            warn!("Comments without sentiment label - count={}", unlabeled);
        }
        info!("Comments fetched - count={}", comments.len());
        Ok(comments)
    }

    async fn fetch_users(&self) -> Result<Vec<UserProfile>, RemoteError> {
        let api: Vec<ApiUser> = self.get_json("users").await?;
        let users: Vec<UserProfile> = api.into_iter().map(ApiUser::into_profile).collect();
        info!("Users fetched - count={}", users.len());
        Ok(users)
    }
}
