//! Image-generation provider client
//!
//! The provider is a black box: sketch bytes plus parameters in, rendered
//! image bytes or a structured error out. Payloads travel as base64 inside
//! JSON. The orchestrator wraps the call in its own hard timeout; the
//! client carries a matching reqwest timeout so a dead connection cannot
//! outlive it.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use sketchforge_ledger::{
    GeneratedImage, GenerationRequest, ImageGenerator, LedgerError, LedgerResult,
};

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    image: String,
    mime_type: &'a str,
    prompt: &'a str,
    aspect_ratio: &'a str,
    resolution: u32,
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    image: String,
    #[serde(default = "default_mime")]
    mime_type: String,
}

fn default_mime() -> String {
    "image/png".to_string()
}

#[derive(Debug, Deserialize)]
struct RenderError {
    error: RenderErrorBody,
}

#[derive(Debug, Deserialize)]
struct RenderErrorBody {
    message: String,
}

pub struct HttpImageGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpImageGenerator {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> LedgerResult<GeneratedImage> {
        let body = RenderRequest {
            image: BASE64.encode(&request.image),
            mime_type: &request.mime_type,
            prompt: &request.prompt,
            aspect_ratio: &request.aspect_ratio,
            resolution: request.resolution,
        };

        let response = self
            .client
            .post(format!("{}/v1/renderings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::ProviderFailed(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RenderError>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("provider returned {status}"));
            return Err(LedgerError::ProviderFailed(message));
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::ProviderFailed(format!("bad response body: {e}")))?;

        let bytes = BASE64
            .decode(rendered.image.as_bytes())
            .map_err(|e| LedgerError::ProviderFailed(format!("undecodable image payload: {e}")))?;

        if bytes.is_empty() {
            return Err(LedgerError::ProviderFailed(
                "provider returned no usable output".to_string(),
            ));
        }

        Ok(GeneratedImage {
            bytes,
            mime_type: rendered.mime_type,
        })
    }
}
