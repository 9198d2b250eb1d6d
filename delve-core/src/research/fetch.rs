//! Bounded-concurrency content fetching.
//!
//! [`fetch_all`] owns the concurrency gate and the hard per-URL timeout, so
//! any [`ContentFetcher`] gets the same limits whether or not it enforces
//! its own.

use super::search::truncate_chars;
use crate::error::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Text extracted from one URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchedDocument {
    pub url: String,
    pub title: String,
    pub text: String,
    pub word_count: usize,
}

impl FetchedDocument {
    pub fn new(url: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            url: url.into(),
            title: title.into(),
            word_count: text.split_whitespace().count(),
            text,
        }
    }

    /// Cut the text down to `max_chars` chars and recount words.
    pub fn truncated(mut self, max_chars: usize) -> Self {
        if self.text.chars().count() > max_chars {
            self.text = truncate_chars(&self.text, max_chars);
            self.word_count = self.text.split_whitespace().count();
        }
        self
    }
}

/// A URL that could not be fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchFailure {
    pub url: String,
    pub error: String,
}

/// Output of the fetching phase.
///
/// `documents.len() + errors.len()` equals the number of attempted URLs;
/// attempted plus `skipped` equals the unique URLs offered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FetchReport {
    /// Successful fetches in discovery order.
    pub documents: Vec<FetchedDocument>,
    /// Failed fetches in discovery order.
    pub errors: Vec<FetchFailure>,
    /// URLs beyond the source cap, never attempted.
    pub skipped: Vec<String>,
}

impl FetchReport {
    pub fn attempted(&self) -> usize {
        self.documents.len() + self.errors.len()
    }
}

/// Retrieves the readable text of a URL.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedDocument, FetchError>;
}

/// Limits applied by [`fetch_all`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Maximum fetches in flight.
    pub concurrency: usize,
    /// Hard per-URL timeout.
    pub timeout: Duration,
    /// Maximum chars of text kept per document.
    pub max_chars: usize,
    /// Maximum URLs attempted.
    pub max_sources: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 20,
            timeout: Duration::from_secs(15),
            max_chars: 50_000,
            max_sources: 50,
        }
    }
}

enum FetchOutcome {
    Document(FetchedDocument),
    Failure(FetchFailure),
}

/// Fetch `urls` (already unique, in discovery order) under the settings' limits.
pub async fn fetch_all(
    fetcher: Arc<dyn ContentFetcher>,
    urls: Vec<String>,
    settings: &FetchSettings,
) -> FetchReport {
    let mut urls = urls;
    let skipped = if urls.len() > settings.max_sources {
        urls.split_off(settings.max_sources)
    } else {
        Vec::new()
    };

    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut handles = Vec::with_capacity(urls.len());

    for url in urls {
        let fetcher = fetcher.clone();
        let sem = semaphore.clone();
        let timeout = settings.timeout;
        let max_chars = settings.max_chars;
        let task_url = url.clone();

        let handle = tokio::spawn(async move {
            let url = task_url;
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    return FetchOutcome::Failure(FetchFailure {
                        url,
                        error: format!("fetch gate closed: {e}"),
                    });
                }
            };
            match tokio::time::timeout(timeout, fetcher.fetch(&url, timeout)).await {
                Ok(Ok(doc)) => FetchOutcome::Document(doc.truncated(max_chars)),
                Ok(Err(e)) => FetchOutcome::Failure(FetchFailure {
                    url,
                    error: e.to_string(),
                }),
                Err(_) => FetchOutcome::Failure(FetchFailure {
                    error: FetchError::Timeout {
                        url: url.clone(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .to_string(),
                    url,
                }),
            }
        });
        handles.push((url, handle));
    }

    let mut report = FetchReport {
        skipped,
        ..FetchReport::default()
    };
    for (url, handle) in handles {
        match handle.await {
            Ok(FetchOutcome::Document(doc)) => {
                debug!(url = doc.url.as_str(), words = doc.word_count, "Fetched");
                report.documents.push(doc);
            }
            Ok(FetchOutcome::Failure(failure)) => {
                warn!(url = failure.url.as_str(), error = failure.error.as_str(), "Fetch failed");
                report.errors.push(failure);
            }
            Err(e) => {
                warn!(url = url.as_str(), error = %e, "Fetch task panicked");
                report.errors.push(FetchFailure {
                    url,
                    error: format!("fetch task failed: {e}"),
                });
            }
        }
    }

    info!(
        documents = report.documents.len(),
        errors = report.errors.len(),
        skipped = report.skipped.len(),
        "Fetch complete"
    );
    report
}

/// A scripted fetcher for tests and offline runs. Tracks the peak number of
/// concurrent calls.
pub struct MockContentFetcher {
    pages: HashMap<String, (String, String)>,
    default_page: Option<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl MockContentFetcher {
    /// Unknown URLs fail with a 404 status.
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            default_page: None,
            delay: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page(
        mut self,
        url: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.pages.insert(url.into(), (title.into(), text.into()));
        self
    }

    /// Serve `text` for every URL without an explicit page.
    pub fn with_default_page(mut self, text: impl Into<String>) -> Self {
        self.default_page = Some(text.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls currently running. Cancelled calls are not counted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MockContentFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one slot of an in-flight counter until dropped, so a fetch that is
/// cancelled mid-await still releases it.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    now: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, now }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentFetcher for MockContentFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedDocument, FetchError> {
        self.requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        let guard = InFlight::enter(&self.in_flight);
        self.peak_in_flight.fetch_max(guard.now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        drop(guard);

        if let Some((title, text)) = self.pages.get(url) {
            return Ok(FetchedDocument::new(url, title.clone(), text.clone()));
        }
        match &self.default_page {
            Some(text) => Ok(FetchedDocument::new(url, url, text.clone())),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}
