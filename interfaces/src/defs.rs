use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type EventId = i64;
pub type UserId = i64;

/// Publish metadata reported by the search engine for a hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishMeta {
    pub published_date: Option<String>,
    pub img_src: Option<String>,
    pub thumbnail: Option<String>,
    pub category: Option<String>,
    pub score: Option<f64>,
}

/// One search hit as returned by a search backend, before any filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHit {
    pub title: String,
    pub content: String,
    pub url: String,
    pub engine: String,
    pub meta: PublishMeta,
}

/// Dominant script of a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
    Ja,
    Ko,
    Other,
}

impl Language {
    /// Tie-break rank used when ordering candidates, lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            Language::Zh => 1,
            Language::En => 2,
            Language::Ja => 3,
            Language::Ko => 4,
            Language::Other => 5,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
            Language::Ja => "ja",
            Language::Ko => "ko",
            Language::Other => "other",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A search-derived item tracked through every stage of a verification run.
///
/// Later stages fill in the optional fields; nothing is ever removed from a
/// candidate once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// 1-based, stable for the whole run.
    pub id: u32,
    pub title: String,
    /// Snippet from search, replaced by the article text once extracted.
    pub body: String,
    /// The search snippet, kept verbatim.
    pub snippet: String,
    pub url: String,
    pub engine: String,
    pub meta: PublishMeta,
    pub reachable: Option<bool>,
    pub language: Option<Language>,
    pub relevance_score: Option<f64>,
    pub extracted: bool,
    pub analysis: Option<String>,
    pub analysis_success: bool,
}

impl Candidate {
    pub fn from_hit(id: u32, hit: RawHit) -> Self {
        Self {
            id,
            title: hit.title,
            body: hit.content.clone(),
            snippet: hit.content,
            url: hit.url,
            engine: hit.engine,
            meta: hit.meta,
            reachable: None,
            language: None,
            relevance_score: None,
            extracted: false,
            analysis: None,
            analysis_success: false,
        }
    }
}

/// Item counts recorded at each stage of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub raw: usize,
    pub accessible: usize,
    pub relevant: usize,
    pub fetched: usize,
    pub extracted: usize,
    /// Items actually sent to the analysis model.
    pub attempted: usize,
    /// Items whose analysis succeeded.
    pub analyzed: usize,
}

impl StageCounts {
    /// True when no stage ever produced anything usable.
    pub fn is_empty(&self) -> bool {
        self.raw == 0 && self.accessible == 0 && self.relevant == 0 && self.analyzed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Reliable,
    Questionable,
    Unreliable,
    Insufficient,
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Reliability::Reliable => "reliable",
            Reliability::Questionable => "questionable",
            Reliability::Unreliable => "unreliable",
            Reliability::Insufficient => "insufficient",
        };
        f.write_str(tag)
    }
}

/// How the summary text of a verdict was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Aggregated by a model from per-item analyses.
    Pipeline,
    /// Synthesized locally from counts and titles; no model involved.
    Statistical,
    /// Single model call on the raw query text, lower confidence.
    DirectFallback,
}

/// Final outcome of a verification run. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub reliability: Reliability,
    pub summary: String,
    pub counts: StageCounts,
    pub mode: GenerationMode,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Nominated,
    Processing,
    Voting,
    Confirmed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventStatus::Pending => "pending",
            EventStatus::Nominated => "nominated",
            EventStatus::Processing => "processing",
            EventStatus::Voting => "voting",
            EventStatus::Confirmed => "confirmed",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Support,
    Oppose,
}

/// Failure of an external capability (search, fetch, model call).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("missing credentials for {0}")]
    MissingCredentials(String),
}

/// Paginated web search.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn backend_name(&self) -> String;

    /// Fetch one page (1-based) of results for `query`.
    async fn search(&self, query: &str, page: u32) -> Result<Vec<RawHit>, CapabilityError>;
}

/// Raw page access: `fetch(url) -> bytes`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Lightweight existence check, returns the final HTTP status.
    async fn head(&self, url: &str) -> Result<u16, CapabilityError>;

    /// Full page body as text.
    async fn get(&self, url: &str) -> Result<String, CapabilityError>;
}

/// A single text-completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// AI text completion: `summarize(prompt) -> text | error`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn provider_name(&self) -> String;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, CapabilityError>;
}
