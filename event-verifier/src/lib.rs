pub mod types;
pub mod config;
pub mod search;
pub mod probe;
pub mod relevance;
pub mod fetcher;
pub mod extract;
pub mod llm_adapter;
pub mod summarizer;
pub mod rating;
pub mod state;
pub mod pipeline;
pub mod lifecycle;
pub mod worker;

pub use types::*;
pub use config::{Settings, ThresholdHandle, Thresholds};
pub use search::{SearchProvider, SearxngBackend};
pub use probe::ReachabilityProber;
pub use relevance::RelevanceRanker;
pub use fetcher::{HttpFetcher, PageCache};
pub use extract::ContentExtractor;
pub use llm_adapter::{OpenAiCompatibleProvider, ProviderChain, ProviderChainBuilder};
pub use summarizer::Summarizer;
pub use rating::ReliabilityBands;
pub use state::{MemoryProgressStore, PgProgressStore, ProgressStore};
pub use pipeline::{PipelineBuilder, PipelineRunner};
pub use lifecycle::{EventLifecycle, EventRecord, EventStore, MemoryEventStore, VoteStats};
pub use worker::{AnalysisQueue, AnalysisWorker, TriggerAck, WorkerHandle};
