//! HTTP client for the remote synthesis endpoint

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::types::NarrationError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_id: Option<&'a str>,
}

/// Audio plus newline-delimited JSON speech marks
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResponse {
    /// Base64 encoded audio
    pub audio_content: String,
    #[serde(default)]
    pub speech_marks: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Clone)]
pub struct SynthesisClient {
    http: Client,
    endpoint: String,
}

impl SynthesisClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
    ) -> Result<SynthesisResponse, NarrationError> {
        info!(endpoint = %self.endpoint, "Requesting synthesis");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&SynthesisRequest { text, voice_id })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| {
                    format!("Proxy error: {}", status.canonical_reason().unwrap_or("unknown"))
                });
            return Err(NarrationError::Synthesis {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}
