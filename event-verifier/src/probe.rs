use crate::types::{Candidate, PageFetcher};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Step 2: concurrent existence checks over candidate urls.
pub struct ReachabilityProber {
    fetcher: Arc<dyn PageFetcher>,
    config: ProbeConfig,
}

impl ReachabilityProber {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: ProbeConfig) -> Self {
        Self { fetcher, config }
    }

    /// Probe every url with at most `concurrency` checks in flight.
    ///
    /// A url is reachable when its check answers 2xx or 3xx within the
    /// timeout. Any error or timeout counts as unreachable.
    pub async fn probe(&self, urls: &[String]) -> HashMap<String, bool> {
        let timeout = self.config.timeout;
        let fetcher = &self.fetcher;

        let results: Vec<(String, bool)> = stream::iter(urls.iter().cloned())
            .map(|url| async move {
                let reachable = match tokio::time::timeout(timeout, fetcher.head(&url)).await {
                    Ok(Ok(status)) => (200..400).contains(&status),
                    Ok(Err(e)) => {
                        debug!("Probe failed for {}: {}", url, e);
                        false
                    }
                    Err(_) => {
                        debug!("Probe timed out for {} after {:?}", url, timeout);
                        false
                    }
                };
                (url, reachable)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Probe the candidates and keep the reachable ones in their original order.
    pub async fn retain_reachable(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let urls: Vec<String> = candidates.iter().map(|c| c.url.clone()).collect();
        let reachability = self.probe(&urls).await;
        let total = candidates.len();

        let survivors: Vec<Candidate> = candidates
            .into_iter()
            .filter_map(|mut candidate| {
                let reachable = reachability.get(&candidate.url).copied().unwrap_or(false);
                candidate.reachable = Some(reachable);
                reachable.then_some(candidate)
            })
            .collect();

        info!("Reachability: {} of {} candidates accessible", survivors.len(), total);
        survivors
    }
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
                title: format!("t{}", id),
                content: String::new(),
                url: url.to_string(),
                engine: String::new(),
                meta: PublishMeta::default(),
            },
        )
    }

    #[tokio::test]
    async fn classifies_statuses_errors_and_timeouts() {
        let pages = CannedPages::new()
            .with_status("https://ok.example", 200)
            .with_status("https://moved.example", 301)
            .with_status("https://gone.example", 404)
            .unreachable("https://down.example")
            .slow("https://slow.example", Duration::from_millis(500));
        let prober = ReachabilityProber::new(
            Arc::new(pages),
            ProbeConfig { concurrency: 2, timeout: Duration::from_millis(50) },
        );

        let urls: Vec<String> = ["https://ok.example", "https://moved.example", "https://gone.example", "https://down.example", "https://slow.example"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = prober.probe(&urls).await;

        assert_eq!(result.len(), 5);
        assert_eq!(result["https://ok.example"], true);
        assert_eq!(result["https://moved.example"], true);
        assert_eq!(result["https://gone.example"], false);
        assert_eq!(result["https://down.example"], false);
        assert_eq!(result["https://slow.example"], false);
    }

    #[tokio::test]
    async fn survivors_keep_relative_order() {
        let pages = CannedPages::new()
            .with_status("https://a.example", 200)
            .unreachable("https://b.example")
            .with_status("https://c.example", 200)
            .with_status("https://d.example", 200);
        let prober = ReachabilityProber::new(Arc::new(pages), ProbeConfig::default());

        let candidates = vec![
            candidate(1, "https://a.example"),
            candidate(2, "https://b.example"),
            candidate(3, "https://c.example"),
            candidate(4, "https://d.example"),
        ];
        let survivors = prober.retain_reachable(candidates).await;
        let ids: Vec<u32> = survivors.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert!(survivors.iter().all(|c| c.reachable == Some(true)));
    }
}
