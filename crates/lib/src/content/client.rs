//! HTTP client for the content service (http://127.0.0.1:8000 by default).

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::types::{AnswerRecord, GameData, SessionCreateRequest, SessionCreateResponse};

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("content service api error: {0}")]
    Api(String),
}

/// Calls the coordinator makes against the content service.
#[async_trait]
pub trait ContentService: Send + Sync {
    /// Load a game and its ordered questions.
    async fn fetch_game(&self, game_id: i64) -> Result<GameData, ContentError>;

    /// Register a new session record; the response carries the session code.
    async fn create_session(
        &self,
        request: &SessionCreateRequest,
    ) -> Result<SessionCreateResponse, ContentError>;

    /// Persist one team answer.
    async fn submit_answer(&self, record: &AnswerRecord) -> Result<(), ContentError>;

    /// Persist a session status transition ("active", "scoring", "completed").
    async fn update_session_status(&self, session_id: i64, status: &str) -> Result<(), ContentError>;
}

/// reqwest-backed [`ContentService`].
#[derive(Clone)]
pub struct HttpContentClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpContentClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ContentError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ContentError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(ContentError::Api(format!("{} {}", status, body)))
}

#[async_trait]
impl ContentService for HttpContentClient {
    /// GET /quiz/api/games/{id}/questions/
    async fn fetch_game(&self, game_id: i64) -> Result<GameData, ContentError> {
        let url = format!("{}/quiz/api/games/{}/questions/", self.base_url, game_id);
        let res = check_status(self.client.get(&url).send().await?).await?;
        Ok(res.json().await?)
    }

    /// POST /quiz/api/sessions/create/
    async fn create_session(
        &self,
        request: &SessionCreateRequest,
    ) -> Result<SessionCreateResponse, ContentError> {
        let url = format!("{}/quiz/api/sessions/create/", self.base_url);
        let res = check_status(self.client.post(&url).json(request).send().await?).await?;
        Ok(res.json().await?)
    }

    /// POST /quiz/api/answers/submit/ (200 or 201).
    async fn submit_answer(&self, record: &AnswerRecord) -> Result<(), ContentError> {
        let url = format!("{}/quiz/api/answers/submit/", self.base_url);
        check_status(self.client.post(&url).json(record).send().await?).await?;
        Ok(())
    }

    /// PATCH /quiz/api/sessions/{id}/status/
    async fn update_session_status(&self, session_id: i64, status: &str) -> Result<(), ContentError> {
        let url = format!("{}/quiz/api/sessions/{}/status/", self.base_url, session_id);
        check_status(
            self.client
                .patch(&url)
                .json(&json!({ "status": status }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}
