use async_trait::async_trait;

use crate::defs::CapabilityError;
use crate::defs::CompletionProvider;
use crate::defs::CompletionRequest;
use crate::defs::PageFetcher;
use crate::defs::RawHit;
use crate::defs::SearchBackend;

pub struct EmptySearch;

#[async_trait]
impl SearchBackend for EmptySearch {
    fn backend_name(&self) -> String {
        "empty".to_owned()
    }

    async fn search(&self, _query: &str, _page: u32) -> Result<Vec<RawHit>, CapabilityError> {
        // Nothing is ever found.
        Ok(vec![])
    }
}

pub struct NullFetcher;

#[async_trait]
impl PageFetcher for NullFetcher {
    async fn head(&self, url: &str) -> Result<u16, CapabilityError> {
        Err(CapabilityError::Transport(format!("no network for {}", url)))
    }

    async fn get(&self, url: &str) -> Result<String, CapabilityError> {
        Err(CapabilityError::Transport(format!("no network for {}", url)))
    }
}

pub struct UnavailableProvider;

#[async_trait]
impl CompletionProvider for UnavailableProvider {
    fn provider_name(&self) -> String {
        "unavailable".to_owned()
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, CapabilityError> {
        Err(CapabilityError::MissingCredentials("unavailable".to_owned()))
    }
}
