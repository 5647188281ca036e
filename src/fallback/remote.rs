//! Remote AI-vision liveness analysis, the last fallback tier.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::{DetectorOutcome, LayerTier, SignalDetector};
use crate::collaborators::{CollaboratorError, LivenessChallenge};

/// Structured answer from a vision service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionVerdict {
    /// 0..1; absent when the service could not judge the image
    #[serde(default)]
    pub liveness_score: Option<f64>,
    #[serde(default)]
    pub is_live: Option<bool>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn analyze_liveness(
        &self,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> Result<VisionVerdict, CollaboratorError>;
}

#[derive(Debug, Serialize)]
struct VisionRequest<'a> {
    task: &'static str,
    image_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<&'a str>,
}

/// JSON-over-HTTP vision client
#[derive(Debug, Clone)]
pub struct HttpVisionClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpVisionClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Unavailable(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// `IDV_VISION_ENDPOINT` (required) and `IDV_VISION_API_KEY` (optional).
    /// Returns `None` when no endpoint is configured.
    pub fn from_env(timeout: Duration) -> Option<Result<Self, CollaboratorError>> {
        let endpoint = std::env::var("IDV_VISION_ENDPOINT").ok()?;
        let api_key = std::env::var("IDV_VISION_API_KEY").ok();
        Some(Self::new(endpoint, api_key, timeout))
    }
}

#[async_trait]
impl VisionClient for HttpVisionClient {
    async fn analyze_liveness(
        &self,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> Result<VisionVerdict, CollaboratorError> {
        let body = VisionRequest {
            task: "liveness",
            image_base64: STANDARD.encode(image),
            challenge: challenge.map(|c| c.instruction.as_str()),
        };

        debug!(endpoint = %self.endpoint, bytes = image.len(), "sending vision liveness request");

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Failed(format!("vision request timed out: {}", e))
            } else {
                CollaboratorError::Unavailable(format!("vision request failed: {}", e))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;

        if !status.is_success() {
            error!(%status, "vision service error");
            return Err(CollaboratorError::Failed(format!("HTTP {}: {}", status, text)));
        }

        serde_json::from_str(&text)
            .map_err(|e| CollaboratorError::InvalidOutput(format!("vision response: {}", e)))
    }
}

/// Adapts a [`VisionClient`] as a remote layer
pub struct RemoteVisionLayer {
    client: Arc<dyn VisionClient>,
}

impl RemoteVisionLayer {
    pub fn new(client: Arc<dyn VisionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignalDetector for RemoteVisionLayer {
    fn name(&self) -> &str {
        "remote_vision"
    }

    fn tier(&self) -> LayerTier {
        LayerTier::Remote
    }

    async fn detect(
        &self,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> Result<DetectorOutcome, CollaboratorError> {
        let verdict = self.client.analyze_liveness(image, challenge).await?;

        // A bare boolean is too coarse to average against model scores
        Ok(match verdict.liveness_score {
            Some(score) => DetectorOutcome::Signal(score),
            None => DetectorOutcome::Unavailable(if verdict.notes.is_empty() {
                "vision service returned no score".to_string()
            } else {
                verdict.notes.join("; ")
            }),
        })
    }
}
