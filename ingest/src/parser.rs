//! Document parser clients.
//!
//! The external parser service turns arbitrary files into markdown-ish text
//! plus extracted images and tables; plain text and markdown bypass it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use corpora_models::{CoreError, CoreResult};

/// An image extracted from a document, ready for captioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedImage {
    /// Position marker inside the markdown, e.g. the n-th image.
    pub index: usize,
    pub bytes: Vec<u8>,
    pub page_number: Option<u32>,
}

/// Parser output: markdown-like text plus structure the chunker preserves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub markdown: String,
    #[serde(default)]
    pub images: Vec<ParsedImage>,
    #[serde(default)]
    pub tables: Vec<String>,
    pub page_count: u32,
    pub word_count: u32,
}

/// Parsing contract. Parsers may run for minutes on large inputs; callers
/// hold a worker-pool slot for the duration.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, bytes: &[u8], content_type: &str) -> CoreResult<ParsedDocument>;
}

/// Passthrough for already-textual content.
pub struct PlainTextParser;

impl PlainTextParser {
    pub fn handles(content_type: &str) -> bool {
        matches!(
            content_type,
            "text/plain" | "text/markdown" | "text/x-markdown" | "text/csv"
        )
    }
}

#[async_trait]
impl DocumentParser for PlainTextParser {
    async fn parse(&self, bytes: &[u8], _content_type: &str) -> CoreResult<ParsedDocument> {
        let markdown = String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::Permanent("file is not valid UTF-8 text".into()))?;
        let word_count = markdown.split_whitespace().count() as u32;
        Ok(ParsedDocument {
            markdown,
            images: Vec::new(),
            tables: Vec::new(),
            page_count: 1,
            word_count,
        })
    }
}

// ============================================================================
// HTTP parser service
// ============================================================================

#[derive(Debug, Serialize)]
struct ParseRequestBody<'a> {
    file_bytes: String,
    content_type: &'a str,
    options: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ParseResponseBody {
    markdown: String,
    #[serde(default)]
    images: Vec<ParseResponseImage>,
    #[serde(default)]
    tables: Vec<String>,
    #[serde(default)]
    page_count: u32,
    #[serde(default)]
    word_count: u32,
}

#[derive(Debug, Deserialize)]
struct ParseResponseImage {
    #[serde(default)]
    index: usize,
    data_base64: String,
    #[serde(default)]
    page_number: Option<u32>,
}

pub struct HttpParserClient {
    client: Client,
    url: String,
    /// Parser calls run in a bounded worker pool; large PDFs take minutes.
    workers: Arc<Semaphore>,
}

impl HttpParserClient {
    pub fn new(url: impl Into<String>, worker_pool_size: usize) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            workers: Arc::new(Semaphore::new(worker_pool_size.max(1))),
        }
    }
}

#[async_trait]
impl DocumentParser for HttpParserClient {
    async fn parse(&self, bytes: &[u8], content_type: &str) -> CoreResult<ParsedDocument> {
        let _slot = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Cancelled("parser pool shut down".into()))?;

        let body = ParseRequestBody {
            file_bytes: base64::engine::general_purpose::STANDARD.encode(bytes),
            content_type,
            options: serde_json::json!({}),
        };

        let response = self
            .client
            .post(format!("{}/parse", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::transient(format!("parser unreachable: {}", e))
                } else {
                    CoreError::dependency("parser", e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::transient(format!("parser status {}", status)));
        }
        if status.as_u16() == 422 {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Permanent(format!("unparseable document: {}", text)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::dependency(
                "parser",
                format!("status {}: {}", status, text),
            ));
        }

        let parsed: ParseResponseBody = response
            .json()
            .await
            .map_err(|e| CoreError::dependency("parser", e.to_string()))?;

        let mut images = Vec::new();
        for image in parsed.images {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&image.data_base64)
                .map_err(|e| CoreError::Permanent(format!("malformed image payload: {}", e)))?;
            images.push(ParsedImage {
                index: image.index,
                bytes,
                page_number: image.page_number,
            });
        }

        debug!(
            pages = parsed.page_count,
            words = parsed.word_count,
            images = images.len(),
            "document parsed"
        );
        Ok(ParsedDocument {
            markdown: parsed.markdown,
            images,
            tables: parsed.tables,
            page_count: parsed.page_count,
            word_count: parsed.word_count,
        })
    }
}
