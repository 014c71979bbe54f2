use crate::types::{Candidate, CapabilityError, FetchConfig, PageFailure, PageFetcher, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

/// Page fetcher over HTTP with retries and per-host spacing.
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn map_error(&self, e: reqwest::Error) -> CapabilityError {
        if e.is_timeout() {
            CapabilityError::Timeout(Duration::from_secs(self.config.timeout_seconds))
        } else {
            CapabilityError::Transport(e.to_string())
        }
    }

    async fn apply_rate_limit(&self, url: &str) -> std::result::Result<(), CapabilityError> {
        let parsed_url = Url::parse(url).map_err(|e| CapabilityError::Transport(format!("invalid url {}: {}", url, e)))?;
        let host = parsed_url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.min_host_interval_ms);

        // Reserve the next slot for this host, then sleep outside the lock.
        let wait_time = {
            let mut rate_limiter = self.rate_limiter.write().await;
            let now = Instant::now();
            let slot = match rate_limiter.get(&host) {
                Some(last_request) if now.duration_since(*last_request) < min_interval => *last_request + min_interval,
                _ => now,
            };
            rate_limiter.insert(host.clone(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait_time.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait_time);
            tokio::time::sleep(wait_time).await;
        }
        Ok(())
    }

    async fn get_once(&self, url: &str) -> std::result::Result<String, CapabilityError> {
        self.apply_rate_limit(url).await?;

        let response = self.client.get(url).send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::Status {
                status: status.as_u16(),
                body: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        response.text().await.map_err(|e| self.map_error(e))
    }
}

fn is_retryable(error: &CapabilityError) -> bool {
    match error {
        CapabilityError::Timeout(_) | CapabilityError::Transport(_) => true,
        CapabilityError::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn head(&self, url: &str) -> std::result::Result<u16, CapabilityError> {
        let response = self.client.head(url).send().await.map_err(|e| self.map_error(e))?;
        Ok(response.status().as_u16())
    }

    async fn get(&self, url: &str) -> std::result::Result<String, CapabilityError> {
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: retry_delay,
            initial_interval: retry_delay,
            max_interval: retry_delay * 16,
            multiplier: 2.0,
            max_elapsed_time: Some(retry_delay * 60),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.get_once(url).await {
                Ok(body) => {
                    debug!("Fetched {} ({} bytes)", url, body.len());
                    return Ok(body);
                }
                Err(e) if attempt < self.config.max_retries && is_retryable(&e) => {
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!("Attempt {} failed for {}, retrying in {:?}: {}", attempt + 1, url, delay, e);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Downloaded pages of one run, keyed by candidate id.
#[derive(Debug, Clone, Default)]
pub struct PageCache {
    pages: HashMap<u32, String>,
    failures: Vec<PageFailure>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u32, html: String) {
        self.pages.insert(id, html);
    }

    pub fn record_failure(&mut self, id: u32, url: &str, error: &str) {
        self.failures.push(PageFailure {
            id,
            url: url.to_string(),
            error: error.to_string(),
        });
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.pages.get(&id).map(|html| html.as_str())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn failures(&self) -> &[PageFailure] {
        &self.failures
    }

    /// Whether the download step already gave up on this page.
    pub fn has_failed(&self, id: u32) -> bool {
        self.failures.iter().any(|failure| failure.id == id)
    }
}

/// Step 4: download each shortlisted page in order, pausing between requests.
pub async fn download_pages(fetcher: &dyn PageFetcher, candidates: &[Candidate], delay: Duration) -> PageCache {
    let mut cache = PageCache::new();

    for (index, candidate) in candidates.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match fetcher.get(&candidate.url).await {
            Ok(html) => cache.insert(candidate.id, html),
            Err(e) => {
                error!("Failed to download page {} ({}): {}", candidate.id, candidate.url, e);
                cache.record_failure(candidate.id, &candidate.url, &e.to_string());
            }
        }
    }

    info!("Downloaded {} of {} pages", cache.len(), candidates.len());
    cache
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::baseline::CannedPages;
    use interfaces::defs::{PublishMeta, RawHit};

    fn candidate(id: u32, url: &str) -> Candidate {
        Candidate::from_hit(
            id,
            RawHit {
                title: format!("title {}", id),
                content: "snippet".to_string(),
                url: url.to_string(),
                engine: "test".to_string(),
                meta: PublishMeta::default(),
            },
        )
    }

    #[tokio::test]
    async fn download_records_failures_without_aborting() {
        let pages = CannedPages::new()
            .with_page("https://a.example/1", "<p>one</p>")
            .with_status("https://a.example/2", 500)
            .with_page("https://a.example/3", "<p>three</p>");
        let candidates = vec![
            candidate(1, "https://a.example/1"),
            candidate(2, "https://a.example/2"),
            candidate(3, "https://a.example/3"),
        ];

        let cache = download_pages(&pages, &candidates, Duration::ZERO).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(3), Some("<p>three</p>"));
        assert!(cache.get(2).is_none());
        assert_eq!(cache.failures().len(), 1);
        assert_eq!(cache.failures()[0].id, 2);
    }

    #[test]
    fn only_transient_errors_are_retried() {
        assert!(is_retryable(&CapabilityError::Status { status: 503, body: String::new() }));
        assert!(is_retryable(&CapabilityError::Status { status: 429, body: String::new() }));
        assert!(!is_retryable(&CapabilityError::Status { status: 404, body: String::new() }));
        assert!(is_retryable(&CapabilityError::Transport("reset".to_string())));
        assert!(!is_retryable(&CapabilityError::Malformed("bad".to_string())));
    }
}
