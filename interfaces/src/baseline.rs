use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::defs::CapabilityError;
use crate::defs::CompletionProvider;
use crate::defs::CompletionRequest;
use crate::defs::PageFetcher;
use crate::defs::RawHit;
use crate::defs::SearchBackend;

/// Search backend serving fixed pages of hits. Pages that were never
/// registered come back empty.
#[derive(Default)]
pub struct CannedSearch {
    pages: HashMap<u32, Vec<RawHit>>,
    failing: HashSet<u32>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl CannedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, page: u32, hits: Vec<RawHit>) -> Self {
        self.pages.insert(page, hits);
        self
    }

    pub fn failing_page(mut self, page: u32) -> Self {
        self.failing.insert(page);
        self
    }

    /// Every `(query, page)` pair requested so far, in order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchBackend for CannedSearch {
    fn backend_name(&self) -> String {
        "canned".to_owned()
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<RawHit>, CapabilityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((query.to_owned(), page));
        }
        if self.failing.contains(&page) {
            return Err(CapabilityError::Transport(format!("page {} unavailable", page)));
        }
        Ok(self.pages.get(&page).cloned().unwrap_or_default())
    }
}

/// Fetcher answering from in-process tables. Unknown urls answer 404.
#[derive(Default)]
pub struct CannedPages {
    statuses: HashMap<String, u16>,
    bodies: HashMap<String, String>,
    unreachable: HashSet<String>,
    slow: HashMap<String, Duration>,
    head_calls: Mutex<Vec<String>>,
    get_calls: Mutex<Vec<String>>,
}

impl CannedPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a page answering 200 with the given body.
    pub fn with_page(mut self, url: &str, body: &str) -> Self {
        self.statuses.insert(url.to_owned(), 200);
        self.bodies.insert(url.to_owned(), body.to_owned());
        self
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_owned(), status);
        self
    }

    /// Requests to `url` fail at the transport level.
    pub fn unreachable(mut self, url: &str) -> Self {
        self.unreachable.insert(url.to_owned());
        self
    }

    /// Requests to `url` take `delay` before answering.
    pub fn slow(mut self, url: &str, delay: Duration) -> Self {
        self.slow.insert(url.to_owned(), delay);
        self
    }

    pub fn head_calls(&self) -> Vec<String> {
        self.head_calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.get_calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    async fn answer(&self, url: &str) -> Result<u16, CapabilityError> {
        if let Some(delay) = self.slow.get(url) {
            tokio::time::sleep(*delay).await;
        }
        if self.unreachable.contains(url) {
            return Err(CapabilityError::Transport(format!("connection refused: {}", url)));
        }
        Ok(self.statuses.get(url).copied().unwrap_or(404))
    }
}

#[async_trait]
impl PageFetcher for CannedPages {
    async fn head(&self, url: &str) -> Result<u16, CapabilityError> {
        if let Ok(mut calls) = self.head_calls.lock() {
            calls.push(url.to_owned());
        }
        self.answer(url).await
    }

    async fn get(&self, url: &str) -> Result<String, CapabilityError> {
        if let Ok(mut calls) = self.get_calls.lock() {
            calls.push(url.to_owned());
        }
        let status = self.answer(url).await?;
        if !(200..400).contains(&status) {
            return Err(CapabilityError::Status { status, body: String::new() });
        }
        Ok(self.bodies.get(url).cloned().unwrap_or_default())
    }
}

/// Completion provider returning scripted replies.
///
/// By default every call returns the same reply. A queue of replies can be
/// given instead, which is consumed front to back and then falls back to the
/// default reply.
pub struct ScriptedCompletion {
    name: String,
    reply: String,
    queue: Mutex<Vec<Result<String, CapabilityError>>>,
    fail_markers: Vec<String>,
    prompts: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_owned(),
            reply: reply.to_owned(),
            queue: Mutex::new(Vec::new()),
            fail_markers: Vec::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A provider that fails every call.
    pub fn failing(name: &str) -> Self {
        Self::new(name, "").fail_when_prompt_contains("")
    }

    /// Calls whose prompt contains `marker` fail with a server error.
    pub fn fail_when_prompt_contains(mut self, marker: &str) -> Self {
        self.fail_markers.push(marker.to_owned());
        self
    }

    pub fn with_sequence(self, replies: Vec<Result<String, CapabilityError>>) -> Self {
        let mut reversed = replies;
        reversed.reverse();
        if let Ok(mut queue) = self.queue.lock() {
            *queue = reversed;
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|prompts| prompts.len()).unwrap_or(0)
    }

    pub fn prompts(&self) -> Vec<CompletionRequest> {
        self.prompts.lock().map(|prompts| prompts.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    fn provider_name(&self) -> String {
        self.name.clone()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, CapabilityError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.clone());
        }
        if self.fail_markers.iter().any(|marker| request.prompt.contains(marker.as_str())) {
            return Err(CapabilityError::Status { status: 500, body: format!("{} refused the prompt", self.name) });
        }
        let queued = self.queue.lock().ok().and_then(|mut queue| queue.pop());
        match queued {
            Some(reply) => reply,
            None => Ok(self.reply.clone()),
        }
    }
}
