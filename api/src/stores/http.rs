//! JSON-over-HTTP adapters for collaborators that run as separate services.

use async_trait::async_trait;
use serde::Deserialize;
use twin_core::actions::ActionDraft;
use twin_core::evidence::{EvidenceRow, EvidenceSearch};

use super::{ActionConnector, EvidenceStore, StepOutcome, StoreError};

/// `POST {base_url}/search` with an [`EvidenceSearch`] body, answered by
/// `{"rows": [EvidenceRow, ...]}`.
pub struct HttpEvidenceStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEvidenceStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<EvidenceRow>,
}

#[async_trait]
impl EvidenceStore for HttpEvidenceStore {
    async fn search(&self, request: &EvidenceSearch) -> Result<Vec<EvidenceRow>, StoreError> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Upstream(format!(
                "evidence search returned {}",
                response.status()
            )));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(body
            .rows
            .into_iter()
            .map(|row| EvidenceRow {
                score: row.score.clamp(0.0, 1.0),
                ..row
            })
            .collect())
    }
}

/// `POST {base_url}/actions/step` with `{"draft": ..., "step": n}`, answered
/// by `{"done": bool}`.
pub struct HttpActionConnector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpActionConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct StepResponse {
    done: bool,
}

#[async_trait]
impl ActionConnector for HttpActionConnector {
    async fn execute_step(
        &self,
        draft: &ActionDraft,
        step: u32,
    ) -> Result<StepOutcome, StoreError> {
        let response = self
            .client
            .post(format!("{}/actions/step", self.base_url))
            .json(&serde_json::json!({ "draft": draft, "step": step }))
            .send()
            .await
            .map_err(|e| StoreError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Upstream(format!(
                "action connector returned {}",
                response.status()
            )));
        }
        let body: StepResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(if body.done {
            StepOutcome::Done
        } else {
            StepOutcome::Continue
        })
    }
}

/// Stands in when no connector service is configured; every step fails.
pub struct UnconfiguredConnector;

#[async_trait]
impl ActionConnector for UnconfiguredConnector {
    async fn execute_step(
        &self,
        _draft: &ActionDraft,
        _step: u32,
    ) -> Result<StepOutcome, StoreError> {
        Err(StoreError::Upstream(
            "no action connector configured".to_string(),
        ))
    }
}
