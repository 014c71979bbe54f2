use crate::types::{Candidate, CapabilityError, PublishMeta, RawHit, Result, SearchBackend, VerifierError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Full URL of the SearXNG `/search` endpoint.
    pub api_url: String,
    pub pages: u32,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8888/search".to_string(),
            pages: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngResult>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    title: Option<String>,
    content: Option<String>,
    url: Option<String>,
    engine: Option<String>,
    #[serde(rename = "publishedDate")]
    published_date: Option<String>,
    img_src: Option<String>,
    thumbnail: Option<String>,
    category: Option<String>,
    score: Option<f64>,
}

impl From<SearxngResult> for RawHit {
    fn from(result: SearxngResult) -> Self {
        Self {
            title: result.title.unwrap_or_default(),
            content: result.content.unwrap_or_default(),
            url: result.url.unwrap_or_default(),
            engine: result.engine.unwrap_or_default(),
            meta: PublishMeta {
                published_date: result.published_date.filter(|s| !s.is_empty()),
                img_src: result.img_src.filter(|s| !s.is_empty()),
                thumbnail: result.thumbnail.filter(|s| !s.is_empty()),
                category: result.category.filter(|s| !s.is_empty()),
                score: result.score,
            },
        }
    }
}

/// News search against a SearXNG instance.
pub struct SearxngBackend {
    client: Client,
    api_url: String,
    timeout: Duration,
}

impl SearxngBackend {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl SearchBackend for SearxngBackend {
    fn backend_name(&self) -> String {
        "searxng".to_string()
    }

    async fn search(&self, query: &str, page: u32) -> std::result::Result<Vec<RawHit>, CapabilityError> {
        let page_param = page.to_string();
        let response = self
            .client
            .get(&self.api_url)
            .query(&[("q", query), ("categories", "news"), ("format", "json"), ("pageno", page_param.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Timeout(self.timeout)
                } else {
                    CapabilityError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Status { status: status.as_u16(), body });
        }

        let parsed: SearxngResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Malformed(e.to_string()))?;

        Ok(parsed.results.into_iter().map(RawHit::from).collect())
    }
}

/// Step 1: collect search hits over several pages and number them.
pub struct SearchProvider {
    backend: Arc<dyn SearchBackend>,
    pages: u32,
}

impl SearchProvider {
    pub fn new(backend: Arc<dyn SearchBackend>, pages: u32) -> Self {
        Self { backend, pages: pages.max(1) }
    }

    /// Query every page in order, tolerating individual page failures.
    ///
    /// Hits without a title or url are dropped; survivors get 1-based ids in
    /// merge order. Fails only when every page failed.
    pub async fn collect(&self, query: &str) -> Result<Vec<Candidate>> {
        let mut hits = Vec::new();
        let mut failed_pages = 0;

        for page in 1..=self.pages {
            match self.backend.search(query, page).await {
                Ok(page_hits) => {
                    debug!("Search page {} for '{}' returned {} hits", page, query, page_hits.len());
                    hits.extend(page_hits);
                }
                Err(e) => {
                    warn!("Search page {} for '{}' failed on {}: {}", page, query, self.backend.backend_name(), e);
                    failed_pages += 1;
                }
            }
        }

        if failed_pages == self.pages {
            return Err(VerifierError::SearchExhausted { pages: self.pages });
        }

        let candidates: Vec<Candidate> = hits
            .into_iter()
            .filter(|hit| !hit.title.trim().is_empty() && !hit.url.trim().is_empty())
            .enumerate()
            .map(|(index, hit)| Candidate::from_hit(index as u32 + 1, hit))
            .collect();

        info!("Search for '{}' collected {} candidates ({} of {} pages failed)", query, candidates.len(), failed_pages, self.pages);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::baseline::CannedSearch;

    fn hit(title: &str, url: &str) -> RawHit {
        RawHit {
            title: title.to_string(),
            content: format!("snippet for {}", title),
            url: url.to_string(),
            engine: "bing news".to_string(),
            meta: PublishMeta::default(),
        }
    }

    #[tokio::test]
    async fn merges_pages_in_order_and_numbers_survivors() {
        let backend = CannedSearch::new()
            .with_page(1, vec![hit("a", "https://a.example"), hit("", "https://blank.example")])
            .with_page(2, vec![hit("b", "https://b.example"), hit("no url", "")])
            .with_page(3, vec![hit("c", "https://c.example")]);
        let provider = SearchProvider::new(Arc::new(backend), 3);

        let candidates = provider.collect("query").await.unwrap();
        let ids: Vec<u32> = candidates.iter().map(|c| c.id).collect();
        let titles: Vec<&str> = candidates.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(titles, vec!["a", "b", "c"]);
        assert_eq!(candidates[0].snippet, candidates[0].body);
    }

    #[tokio::test]
    async fn tolerates_partial_page_failure() {
        let backend = CannedSearch::new()
            .with_page(1, vec![hit("a", "https://a.example")])
            .failing_page(2);
        let provider = SearchProvider::new(Arc::new(backend), 2);

        let candidates = provider.collect("query").await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn fails_when_every_page_fails() {
        let backend = CannedSearch::new().failing_page(1).failing_page(2);
        let provider = SearchProvider::new(Arc::new(backend), 2);

        let err = provider.collect("query").await.unwrap_err();
        assert!(matches!(err, VerifierError::SearchExhausted { pages: 2 }));
    }
}
