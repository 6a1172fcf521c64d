//! Abstract image-generation collaborator.
//!
//! Mirrors [`crate::llm::HttpCompleter`]'s shape: one HTTP-backed
//! implementation against a generic image-generation endpoint, kept
//! behind a trait so the pipeline never depends on a specific vendor.

use crate::error::{GenerationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageQuality {
    Standard,
    Hd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const SQUARE: ImageSize = ImageSize { width: 1024, height: 1024 };
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageUsage {
    pub images_generated: u32,
}

/// Abstract image-generation collaborator.
pub trait ImageGen: Send + Sync + 'static {
    fn generate(
        &self,
        prompt: &str,
        quality: ImageQuality,
        size: ImageSize,
        reference_image: Option<&[u8]>,
    ) -> impl std::future::Future<Output = Result<GeneratedImage>> + Send;
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    quality: &'static str,
    size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_image_b64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: String,
}

pub struct HttpImageGen {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpImageGen {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build image generation http client");
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl ImageGen for HttpImageGen {
    async fn generate(
        &self,
        prompt: &str,
        quality: ImageQuality,
        size: ImageSize,
        reference_image: Option<&[u8]>,
    ) -> Result<GeneratedImage> {
        use base64::Engine as _;

        let body = ImageRequest {
            model: &self.model,
            prompt,
            quality: match quality {
                ImageQuality::Standard => "standard",
                ImageQuality::Hd => "hd",
            },
            size: format!("{}x{}", size.width, size.height),
            reference_image_b64: reference_image.map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::UpstreamTransient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(GenerationError::RateLimited.into());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::UpstreamRefused(format!("{status}: {text}")).into());
        }

        let parsed: ImageResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::UpstreamTransient(e.to_string()))?;
        let datum = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::UpstreamRefused("empty image data".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(datum.b64_json)
            .map_err(|e| GenerationError::UpstreamRefused(format!("invalid base64 image payload: {e}")))?;

        tracing::info!(bytes = bytes.len(), "image generated");

        Ok(GeneratedImage {
            bytes,
            usage: ImageUsage { images_generated: 1 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn reference_image_round_trips_through_base64() {
        let input = b"hello, celebration!";
        let encoded = base64::engine::general_purpose::STANDARD.encode(input);
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, input);
    }
}
