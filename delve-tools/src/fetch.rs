//! HTTP content fetcher.
//!
//! Downloads a page, follows at most five redirects and turns HTML into
//! plain text. Plain text and JSON bodies pass through unchanged; other
//! content types (PDF, images, archives) are rejected.

use crate::engines::USER_AGENT;
use crate::html::{extract_text, extract_title};
use async_trait::async_trait;
use delve_core::error::FetchError;
use delve_core::research::fetch::{ContentFetcher, FetchedDocument};
use reqwest::Client;
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::debug;
use url::Url;

const MAX_REDIRECTS: usize = 5;

/// Fetches pages over HTTP(S) with a shared connection pool.
pub struct HttpContentFetcher {
    client: Client,
}

#[derive(Debug, PartialEq)]
enum BodyKind {
    Html,
    Text,
    Unsupported,
}

fn body_kind(content_type: &str) -> BodyKind {
    let ct = content_type.to_ascii_lowercase();
    if ct.is_empty() || ct.contains("text/html") || ct.contains("application/xhtml") {
        BodyKind::Html
    } else if ct.starts_with("text/") || ct.contains("json") || ct.contains("xml") {
        BodyKind::Text
    } else {
        BodyKind::Unsupported
    }
}

/// Only absolute http(s) URLs are fetched.
pub fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let invalid = || FetchError::InvalidUrl {
        url: raw.to_string(),
    };
    let url = Url::parse(raw).map_err(|_| invalid())?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(invalid()),
    }
}

/// Build a document from a response body.
pub fn document_from_body(url: &str, content_type: &str, body: &str) -> Result<FetchedDocument, FetchError> {
    match body_kind(content_type) {
        BodyKind::Html => {
            let title = extract_title(body).unwrap_or_default();
            Ok(FetchedDocument::new(url, title, extract_text(body)))
        }
        BodyKind::Text => Ok(FetchedDocument::new(url, String::new(), body.trim())),
        BodyKind::Unsupported => Err(FetchError::Body {
            url: url.to_string(),
            message: format!("unsupported content type '{content_type}'"),
        }),
    }
}

impl HttpContentFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedDocument, FetchError> {
        let parsed = validate_url(url)?;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_secs: timeout.as_secs(),
                }
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if body_kind(&content_type) == BodyKind::Unsupported {
            return Err(FetchError::Body {
                url: url.to_string(),
                message: format!("unsupported content type '{content_type}'"),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                map_err(e)
            } else {
                FetchError::Body {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;
        let doc = document_from_body(url, &content_type, &body)?;
        debug!(url, words = doc.word_count, "Page fetched");
        Ok(doc)
    }
}
