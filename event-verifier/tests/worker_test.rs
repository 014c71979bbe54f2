use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use event_verifier::summarizer::SummarizerConfig;
use event_verifier::{
    AnalysisQueue, AnalysisWorker, EventLifecycle, EventStatus, GenerationMode, MemoryEventStore, MemoryProgressStore, PipelineBuilder, PipelineRunner, ProgressStore, ProviderChainBuilder, RawHit,
    Result, RunStatus, ThresholdHandle, Thresholds, VerifierError,
};
use interfaces::baseline::{CannedPages, CannedSearch, ScriptedCompletion};
use interfaces::{CapabilityError, SearchBackend};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).try_init();
}

struct PanickingSearch;

#[async_trait]
impl SearchBackend for PanickingSearch {
    fn backend_name(&self) -> String {
        "panicking".to_string()
    }

    async fn search(&self, _query: &str, _page: u32) -> std::result::Result<Vec<RawHit>, CapabilityError> {
        panic!("search backend crashed");
    }
}

fn canned_runner(search: Arc<dyn SearchBackend>, store: Arc<dyn ProgressStore>) -> Result<PipelineRunner> {
    let mut pages = CannedPages::new();
    for n in 1..=4 {
        let paragraph = format!("Claim {} was confirmed by the ministry in a written statement published on its website this morning, officials said.", n);
        pages = pages.with_page(&format!("https://site{}.example/story", n), &format!("<html><body><article><p>{}</p><p>{}</p></article></body></html>", paragraph, paragraph));
    }

    PipelineBuilder::new()
        .search_backend(search)
        .fetcher(Arc::new(pages))
        .analyst(Arc::new(ScriptedCompletion::new("glm", "The statement is official and consistent across outlets.")))
        .aggregators(ProviderChainBuilder::new().add_scripted_provider("glm", "The claim is supported by the ministry statement.").build())
        .store(store)
        .search_pages(1)
        .fetch_delay(Duration::ZERO)
        .summarizer(SummarizerConfig {
            analysis_delay: Duration::ZERO,
            ..Default::default()
        })
        .build()
}

fn canned_search() -> CannedSearch {
    let hits = (1..=4)
        .map(|n| RawHit {
            title: format!("Ministry confirms claim {}", n),
            content: format!("Claim {} snippet", n),
            url: format!("https://site{}.example/story", n),
            engine: "canned".to_string(),
            ..Default::default()
        })
        .collect();
    CannedSearch::new().with_page(1, hits)
}

async fn wait_for<F>(mut done: F) -> Result<()>
where
    F: FnMut() -> BoxFuture<'static, Result<bool>>,
{
    for _ in 0..200 {
        if done().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(VerifierError::General("condition not reached in time".to_string()))
}

#[tokio::test]
async fn worker_runs_job_and_opens_voting() -> Result<()> {
    init_tracing();
    let progress: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let runner = Arc::new(canned_runner(Arc::new(canned_search()), progress.clone())?);
    let thresholds = ThresholdHandle::new(Thresholds { interest_threshold: 2, vote_threshold: 20, victory_margin: 0.5 });

    let (queue, jobs) = AnalysisQueue::channel(progress.clone());
    let lifecycle = Arc::new(EventLifecycle::new(Arc::new(MemoryEventStore::new()), thresholds, true).with_queue(queue));
    let worker = AnalysisWorker::new(jobs, runner).with_lifecycle(lifecycle.clone()).spawn();

    lifecycle.create_event(1, "Ministry", "confirms claim").await?;
    lifecycle.add_interest(1, 1).await?;
    lifecycle.add_interest(1, 2).await?;

    let polled = lifecycle.clone();
    wait_for(move || {
        let lifecycle = polled.clone();
        async move { Ok::<bool, VerifierError>(lifecycle.event(1).await?.status == EventStatus::Voting) }.boxed()
    })
    .await?;

    let event = lifecycle.event(1).await?;
    assert_eq!(event.summary.as_deref(), Some("The claim is supported by the ministry statement."));
    assert!(event.reliability.is_some());

    let snapshot = progress.load_snapshot(1).await?.expect("snapshot");
    assert_eq!(snapshot.status, RunStatus::Completed);
    let verdict = snapshot.verdict.expect("inline verdict");
    assert_eq!(verdict.mode, GenerationMode::Pipeline);
    assert_eq!(verdict.counts.raw, 4);

    let report = progress.load_report(snapshot.run_id).await?.expect("report");
    assert_eq!(report.candidates.len(), 4);

    worker.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn panicking_run_is_recorded_as_failed() -> Result<()> {
    init_tracing();
    let progress: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let runner = Arc::new(canned_runner(Arc::new(PanickingSearch), progress.clone())?);

    let (queue, jobs) = AnalysisQueue::channel(progress.clone());
    let worker = AnalysisWorker::new(jobs, runner).spawn();

    let ack = queue.submit(4, "Anything at all").await?;
    assert_eq!(ack.status, RunStatus::Started);

    let polled = progress.clone();
    wait_for(move || {
        let progress = polled.clone();
        async move { Ok::<bool, VerifierError>(progress.progress(4).await?.status == RunStatus::Failed) }.boxed()
    })
    .await?;

    let snapshot = progress.load_snapshot(4).await?.expect("snapshot");
    assert_eq!(snapshot.run_id, ack.run_id);
    assert!(snapshot.error.unwrap_or_default().contains("analysis task aborted"));

    worker.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_finishes_queued_jobs() -> Result<()> {
    init_tracing();
    let progress: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let runner = Arc::new(canned_runner(Arc::new(canned_search()), progress.clone())?);

    let (queue, jobs) = AnalysisQueue::channel(progress.clone());
    let worker = AnalysisWorker::new(jobs, runner).spawn();

    for event_id in 20..23 {
        queue.submit(event_id, "Ministry confirms claim").await?;
    }
    worker.shutdown().await?;

    for event_id in 20..23 {
        assert_eq!(progress.progress(event_id).await?.status, RunStatus::Completed);
    }

    let refused = queue.submit(30, "Too late").await;
    assert!(refused.is_err());
    assert_eq!(progress.progress(30).await?.status, RunStatus::Failed);
    Ok(())
}
