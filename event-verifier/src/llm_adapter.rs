use crate::types::{CapabilityError, CompletionProvider, CompletionRequest, Result, VerifierError};
use async_trait::async_trait;
use interfaces::baseline::ScriptedCompletion;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection details of one OpenAI-compatible chat endpoint.
#[derive(Clone)]
pub struct ProviderConfig {
    pub name: String,
    /// Base URL; `/chat/completions` is appended.
    pub api_url: String,
    pub api_key: Option<String>,
    pub model_id: String,
    pub timeout: Duration,
}

// Keeps the API key out of debug output and logs.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model_id", &self.model_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Chat-completions client for GLM, DeepSeek and other compatible endpoints.
pub struct OpenAiCompatibleProvider {
    http: Client,
    config: ProviderConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn headers(&self) -> std::result::Result<HeaderMap, CapabilityError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| CapabilityError::MissingCredentials(self.config.name.clone()))?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| CapabilityError::MissingCredentials(format!("{} (invalid key)", self.config.name)))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn map_error(&self, e: reqwest::Error) -> CapabilityError {
        if e.is_timeout() {
            CapabilityError::Timeout(self.config.timeout)
        } else if e.is_decode() {
            CapabilityError::Malformed(e.to_string())
        } else {
            CapabilityError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn provider_name(&self) -> String {
        self.config.name.clone()
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<String, CapabilityError> {
        let headers = self.headers()?;
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));

        let mut messages = Vec::new();
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: &request.prompt });

        let body = ChatRequest {
            model: &self.config.model_id,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!("{} chat request to {} ({} prompt chars)", self.config.name, url, request.prompt.chars().count());

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Status { status: status.as_u16(), body: error_text });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| self.map_error(e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| CapabilityError::Malformed(format!("{} returned no message content", self.config.name)))
    }
}

/// Ordered list of providers tried one after another until one succeeds.
#[derive(Clone, Default)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn CompletionProvider>>,
}

impl ProviderChain {
    pub fn new() -> Self {
        Self { providers: Vec::new() }
    }

    pub fn push(&mut self, provider: Arc<dyn CompletionProvider>) {
        info!("Registering completion provider: {}", provider.provider_name());
        self.providers.push(provider);
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The first provider, used for single-provider calls.
    pub fn primary(&self) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.first().cloned()
    }

    /// Try every provider in order; returns the first successful text and the
    /// name of the provider that produced it.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<(String, String)> {
        let mut failures = Vec::new();

        for provider in &self.providers {
            let name = provider.provider_name();
            match provider.complete(request).await {
                Ok(text) => {
                    if !failures.is_empty() {
                        info!("Provider {} succeeded after {} failure(s)", name, failures.len());
                    }
                    return Ok((text, name));
                }
                Err(e) => {
                    warn!("Provider {} failed: {}", name, e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            return Err(VerifierError::AllProvidersFailed("no providers configured".to_string()));
        }
        Err(VerifierError::AllProvidersFailed(failures.join("; ")))
    }
}

/// Builder for provider chains.
pub struct ProviderChainBuilder {
    chain: ProviderChain,
}

impl ProviderChainBuilder {
    pub fn new() -> Self {
        Self { chain: ProviderChain::new() }
    }

    pub fn add_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.chain.push(provider);
        self
    }

    /// Adds an HTTP provider; providers without an API key are skipped.
    pub fn add_http_provider(mut self, config: ProviderConfig) -> Result<Self> {
        if config.api_key.is_none() {
            warn!("Skipping provider {}: no API key configured", config.name);
            return Ok(self);
        }
        self.chain.push(Arc::new(OpenAiCompatibleProvider::new(config)?));
        Ok(self)
    }

    pub fn add_scripted_provider(mut self, name: &str, reply: &str) -> Self {
        self.chain.push(Arc::new(ScriptedCompletion::new(name, reply)));
        self
    }

    pub fn build(self) -> ProviderChain {
        self.chain
    }
}

impl Default for ProviderChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}
