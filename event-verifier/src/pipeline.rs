use crate::extract::{ContentExtractor, ExtractionLimits};
use crate::fetcher::{download_pages, PageCache};
use crate::llm_adapter::ProviderChain;
use crate::probe::{ProbeConfig, ReachabilityProber};
use crate::rating::ReliabilityBands;
use crate::relevance::{detect_language, RelevanceRanker, RelevanceWeights};
use crate::search::SearchProvider;
use crate::state::ProgressStore;
use crate::summarizer::{Summarizer, SummarizerConfig};
use crate::types::{Candidate, CompletionProvider, EventId, GenerationMode, PageFetcher, PipelineStep, ProgressView, Reliability, Result, RunReport, RunState, SearchBackend, StageCounts, Verdict, VerifierError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Values handed from one stage to the next within a single run.
#[derive(Default)]
struct RunContext {
    candidates: Vec<Candidate>,
    pages: Option<PageCache>,
    counts: StageCounts,
}

enum PathOutcome {
    Finished(Verdict),
    /// A stage left nothing to work with.
    NoCandidates(PipelineStep),
}

/// Runs the seven verification steps for one query and records progress.
pub struct PipelineRunner {
    search: SearchProvider,
    prober: ReachabilityProber,
    ranker: RelevanceRanker,
    fetcher: Arc<dyn PageFetcher>,
    fetch_delay: Duration,
    extractor: ContentExtractor,
    summarizer: Summarizer,
    bands: ReliabilityBands,
    store: Arc<dyn ProgressStore>,
}

impl PipelineRunner {
    pub fn store(&self) -> Arc<dyn ProgressStore> {
        self.store.clone()
    }

    /// Current progress of an event, `idle` if it was never analyzed.
    pub async fn status(&self, event_id: EventId) -> Result<ProgressView> {
        self.store.progress(event_id).await
    }

    /// Start and run a fresh verification for `query`.
    pub async fn run_query(&self, event_id: EventId, query: &str) -> Result<RunState> {
        let state = RunState::started(event_id, Uuid::new_v4(), query);
        self.store.save_snapshot(&state).await?;
        self.execute(state).await
    }

    /// Run the pipeline from an already recorded `started` snapshot.
    ///
    /// Returns the final snapshot, which is either completed or failed. Only
    /// a storage failure is returned as an error.
    pub async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let query = state.query.clone();
        info!("Verification run {} started for event {}: '{}'", state.run_id, state.event_id, query);

        let mut ctx = RunContext::default();
        let outcome = self.normal_path(&mut state, &mut ctx, &query).await;

        let fallback_reason = match outcome {
            Ok(PathOutcome::Finished(verdict)) => {
                return self.finish(state, ctx, verdict).await;
            }
            Ok(PathOutcome::NoCandidates(step)) => format!("no usable sources after {}", step),
            Err(e) if e.is_missing_artifact() || matches!(e, VerifierError::SearchExhausted { .. } | VerifierError::AllProvidersFailed(_)) => e.to_string(),
            Err(VerifierError::Database(e)) => return Err(VerifierError::Database(e)),
            Err(e) => {
                error!("Verification run {} failed: {}", state.run_id, e);
                state.fail(&e.to_string());
                self.store.save_snapshot(&state).await?;
                return Ok(state);
            }
        };

        warn!("Run {} falls back to direct analysis: {}", state.run_id, fallback_reason);
        state.advance(PipelineStep::DirectAi, ctx.counts);
        self.store.save_snapshot(&state).await?;

        match self.summarizer.direct(&query).await {
            Ok(outcome) => {
                let verdict = Verdict {
                    reliability: Reliability::Insufficient,
                    summary: outcome.text,
                    counts: ctx.counts,
                    mode: GenerationMode::DirectFallback,
                    generated_at: Utc::now(),
                };
                self.finish(state, ctx, verdict).await
            }
            Err(e) => {
                error!("Direct analysis for run {} failed: {}", state.run_id, e);
                state.fail(&format!("{}; direct analysis failed: {}", fallback_reason, e));
                self.store.save_snapshot(&state).await?;
                Ok(state)
            }
        }
    }

    async fn checkpoint(&self, state: &mut RunState, step: PipelineStep, counts: StageCounts) -> Result<()> {
        state.advance(step, counts);
        self.store.save_snapshot(state).await?;
        info!("Run {} at {} (raw={}, accessible={}, relevant={}, analyzed={})", state.run_id, step, counts.raw, counts.accessible, counts.relevant, counts.analyzed);
        Ok(())
    }

    async fn normal_path(&self, state: &mut RunState, ctx: &mut RunContext, query: &str) -> Result<PathOutcome> {
        self.checkpoint(state, PipelineStep::Step1Search, ctx.counts).await?;
        ctx.candidates = self.search.collect(query).await?;
        for candidate in ctx.candidates.iter_mut() {
            candidate.language = Some(detect_language(&format!("{} {}", candidate.title, candidate.body)));
        }
        ctx.counts.raw = ctx.candidates.len();
        if ctx.candidates.is_empty() {
            return Ok(PathOutcome::NoCandidates(PipelineStep::Step1Search));
        }

        self.checkpoint(state, PipelineStep::Step2Probe, ctx.counts).await?;
        ctx.candidates = self.prober.retain_reachable(std::mem::take(&mut ctx.candidates)).await;
        ctx.counts.accessible = ctx.candidates.len();
        if ctx.candidates.is_empty() {
            return Ok(PathOutcome::NoCandidates(PipelineStep::Step2Probe));
        }

        self.checkpoint(state, PipelineStep::Step3Rank, ctx.counts).await?;
        ctx.candidates = self.ranker.rank(query, std::mem::take(&mut ctx.candidates));
        ctx.counts.relevant = ctx.candidates.len();
        if ctx.candidates.is_empty() {
            return Ok(PathOutcome::NoCandidates(PipelineStep::Step3Rank));
        }

        self.checkpoint(state, PipelineStep::Step4Fetch, ctx.counts).await?;
        let pages = download_pages(self.fetcher.as_ref(), &ctx.candidates, self.fetch_delay).await;
        ctx.counts.fetched = pages.len();
        ctx.pages = Some(pages);

        self.checkpoint(state, PipelineStep::Step5Extract, ctx.counts).await?;
        ctx.counts.extracted = self
            .extractor
            .extract_all(&mut ctx.candidates, ctx.pages.as_ref(), self.fetcher.as_ref())
            .await?;

        self.checkpoint(state, PipelineStep::Step6Analyze, ctx.counts).await?;
        let tally = self.summarizer.analyze_all(&mut ctx.candidates).await;
        ctx.counts.attempted = tally.attempted;
        ctx.counts.analyzed = tally.succeeded;

        self.checkpoint(state, PipelineStep::Step7Summarize, ctx.counts).await?;
        let summary = self.summarizer.summarize(query, &ctx.candidates).await?;

        Ok(PathOutcome::Finished(Verdict {
            reliability: self.bands.rate(&ctx.counts),
            summary: summary.text,
            counts: ctx.counts,
            mode: summary.mode,
            generated_at: Utc::now(),
        }))
    }

    async fn finish(&self, mut state: RunState, ctx: RunContext, verdict: Verdict) -> Result<RunState> {
        let report = RunReport {
            run_id: state.run_id,
            event_id: state.event_id,
            query: state.query.clone(),
            candidates: ctx.candidates,
            fetch_failures: ctx.pages.map(|pages| pages.failures().to_vec()).unwrap_or_default(),
            counts: verdict.counts,
            verdict: verdict.clone(),
            generated_at: verdict.generated_at,
        };
        self.store.save_report(&report).await?;

        info!("Run {} completed: {} ({:?})", state.run_id, verdict.reliability, verdict.mode);
        state.complete(verdict);
        self.store.save_snapshot(&state).await?;
        Ok(state)
    }
}

/// Builder for [`PipelineRunner`].
pub struct PipelineBuilder {
    search_backend: Option<Arc<dyn SearchBackend>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    analyst: Option<Arc<dyn CompletionProvider>>,
    aggregators: ProviderChain,
    direct: ProviderChain,
    store: Option<Arc<dyn ProgressStore>>,
    search_pages: u32,
    probe: ProbeConfig,
    relevance_limit: usize,
    relevance_weights: RelevanceWeights,
    fetch_delay: Duration,
    extraction: ExtractionLimits,
    summarizer: SummarizerConfig,
    bands: ReliabilityBands,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            search_backend: None,
            fetcher: None,
            analyst: None,
            aggregators: ProviderChain::new(),
            direct: ProviderChain::new(),
            store: None,
            search_pages: 5,
            probe: ProbeConfig::default(),
            relevance_limit: 15,
            relevance_weights: RelevanceWeights::default(),
            fetch_delay: Duration::from_millis(1000),
            extraction: ExtractionLimits::default(),
            summarizer: SummarizerConfig::default(),
            bands: ReliabilityBands::default(),
        }
    }

    pub fn search_backend(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search_backend = Some(backend);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Provider for per-item analysis.
    pub fn analyst(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.analyst = Some(provider);
        self
    }

    /// Providers for the final report, tried in order.
    pub fn aggregators(mut self, chain: ProviderChain) -> Self {
        self.aggregators = chain;
        self
    }

    /// Providers for the direct fallback, tried in order.
    pub fn direct(mut self, chain: ProviderChain) -> Self {
        self.direct = chain;
        self
    }

    pub fn store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn search_pages(mut self, pages: u32) -> Self {
        self.search_pages = pages;
        self
    }

    pub fn probe(mut self, config: ProbeConfig) -> Self {
        self.probe = config;
        self
    }

    pub fn relevance_limit(mut self, limit: usize) -> Self {
        self.relevance_limit = limit;
        self
    }

    pub fn relevance_weights(mut self, weights: RelevanceWeights) -> Self {
        self.relevance_weights = weights;
        self
    }

    pub fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn extraction(mut self, limits: ExtractionLimits) -> Self {
        self.extraction = limits;
        self
    }

    pub fn summarizer(mut self, config: SummarizerConfig) -> Self {
        self.summarizer = config;
        self
    }

    pub fn bands(mut self, bands: ReliabilityBands) -> Self {
        self.bands = bands;
        self
    }

    pub fn build(self) -> Result<PipelineRunner> {
        let backend = self.search_backend.ok_or_else(|| VerifierError::Config("pipeline needs a search backend".to_string()))?;
        let fetcher = self.fetcher.ok_or_else(|| VerifierError::Config("pipeline needs a page fetcher".to_string()))?;
        let store = self.store.ok_or_else(|| VerifierError::Config("pipeline needs a progress store".to_string()))?;
        let analyst = match self.analyst.or_else(|| self.aggregators.primary()) {
            Some(analyst) => analyst,
            None => return Err(VerifierError::Config("pipeline needs an analysis provider".to_string())),
        };

        info!("Building pipeline: search via {}, aggregators {:?}, direct {:?}", backend.backend_name(), self.aggregators.provider_names(), self.direct.provider_names());

        Ok(PipelineRunner {
            search: SearchProvider::new(backend, self.search_pages),
            prober: ReachabilityProber::new(fetcher.clone(), self.probe),
            ranker: RelevanceRanker::new(self.relevance_limit).with_weights(self.relevance_weights),
            fetcher,
            fetch_delay: self.fetch_delay,
            extractor: ContentExtractor::new(self.extraction),
            summarizer: Summarizer::new(analyst, self.aggregators, self.direct, self.summarizer),
            bands: self.bands,
            store,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
