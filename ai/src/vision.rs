//! Vision-language client, used by ingest to caption extracted images.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use corpora_config::ModelConfig;
use corpora_models::conversation::TokenUsage;
use corpora_models::{CoreError, CoreResult};

use crate::limits::{with_retries, ClientLimits};
use crate::usage::{UsageRecord, UsageSink};

/// Image description contract: bounded image size, supported formats only.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn describe_image(&self, image: &[u8], prompt: &str) -> CoreResult<String>;
}

/// Sniff the handful of formats the vision service accepts.
pub fn image_format(image: &[u8]) -> Option<&'static str> {
    if image.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("png")
    } else if image.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpeg")
    } else if image.len() >= 12 && &image[0..4] == b"RIFF" && &image[8..12] == b"WEBP" {
        Some("webp")
    } else if image.starts_with(b"GIF87a") || image.starts_with(b"GIF89a") {
        Some("gif")
    } else {
        None
    }
}

#[derive(Debug, Serialize)]
struct VisionRequestBody<'a> {
    image_base64: String,
    prompt: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct VisionResponseBody {
    content: String,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

pub struct HttpVisionModel {
    client: Client,
    url: String,
    model: String,
    max_image_bytes: usize,
    limits: ClientLimits,
    usage: Arc<dyn UsageSink>,
}

impl HttpVisionModel {
    pub fn new(
        url: impl Into<String>,
        config: &ModelConfig,
        limits: ClientLimits,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            model: config.vision_model.clone(),
            max_image_bytes: config.vision_max_image_bytes,
            limits,
            usage,
        }
    }

    async fn request(&self, image_base64: &str, prompt: &str) -> CoreResult<VisionResponseBody> {
        let body = VisionRequestBody {
            image_base64: image_base64.to_string(),
            prompt,
            model: &self.model,
        };
        let response = self
            .client
            .post(format!("{}/describe", self.url))
            .timeout(self.limits.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::transient(format!("vision service unreachable: {}", e))
                } else {
                    CoreError::dependency("vision", e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::transient(format!("vision status {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::dependency(
                "vision",
                format!("status {}: {}", status, text),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| CoreError::dependency("vision", e.to_string()))
    }
}

#[async_trait]
impl VisionModel for HttpVisionModel {
    async fn describe_image(&self, image: &[u8], prompt: &str) -> CoreResult<String> {
        if image.len() > self.max_image_bytes {
            return Err(CoreError::InvalidInput(format!(
                "image of {} bytes exceeds limit {}",
                image.len(),
                self.max_image_bytes
            )));
        }
        if image_format(image).is_none() {
            return Err(CoreError::Permanent("unsupported image format".into()));
        }

        let _permit = self.limits.acquire().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let start = Instant::now();
        let result =
            with_retries(self.limits.retries, "describe_image", || self.request(&encoded, prompt))
                .await?;

        let usage = result.usage.unwrap_or_default();
        self.usage.record(UsageRecord {
            model: self.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms: start.elapsed().as_millis() as u64,
        });
        Ok(result.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::NoopUsageSink;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn vision(url: String, max_bytes: usize) -> HttpVisionModel {
        let config = ModelConfig {
            vision_max_image_bytes: max_bytes,
            ..ModelConfig::default()
        };
        HttpVisionModel::new(
            url,
            &config,
            ClientLimits::new(2, 4, Duration::from_secs(2), 0),
            Arc::new(NoopUsageSink),
        )
    }

    #[test]
    fn format_sniffing() {
        assert_eq!(image_format(&PNG_HEADER), Some("png"));
        assert_eq!(image_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("jpeg"));
        assert_eq!(image_format(b"GIF89a...."), Some("gif"));
        assert_eq!(image_format(b"plain text"), None);
    }

    #[tokio::test]
    async fn oversized_image_is_invalid_input() {
        let err = vision("http://localhost:1".into(), 4)
            .describe_image(&PNG_HEADER, "caption")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn unsupported_format_is_permanent() {
        let err = vision("http://localhost:1".into(), 1024)
            .describe_image(b"not an image", "caption")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permanent");
    }

    #[tokio::test]
    async fn caption_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/describe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": "A bar chart of quarterly revenue.",
                "usage": { "prompt_tokens": 90, "completion_tokens": 12 }
            })))
            .mount(&server)
            .await;

        let caption = vision(server.uri(), 1024)
            .describe_image(&PNG_HEADER, "Describe this image")
            .await
            .unwrap();
        assert!(caption.contains("bar chart"));
    }
}
