use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use event_verifier::config::Settings;
use event_verifier::{
    AnalysisQueue, AnalysisWorker, EventLifecycle, EventRecord, EventStatus, HttpFetcher, MemoryEventStore, MemoryProgressStore, OpenAiCompatibleProvider, PgProgressStore, PipelineBuilder,
    PipelineRunner, ProgressStore, ProviderChainBuilder, RawHit, RunStatus, SearxngBackend, Stance, ThresholdHandle,
};
use interfaces::baseline::{CannedPages, CannedSearch, ScriptedCompletion};
use interfaces::empty::UnavailableProvider;
use interfaces::CompletionProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "event-verifier", about = "Verify news events against search results and open them for voting")]
struct Cli {
    /// Use built-in search results, pages and model replies instead of the network
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify one event and print the verdict as JSON
    Run {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 1)]
        event_id: i64,
    },
    /// Print the progress snapshot of one event, or of every analyzed event
    Status { event_id: Option<i64> },
    /// Drive a demo event through interest, analysis and voting
    Simulate {
        #[arg(long, default_value = "NVIDIA")]
        title: String,
        #[arg(long, default_value = "quarterly earnings")]
        description: String,
        #[arg(long, default_value_t = 20)]
        voters: u64,
        /// Share of voters supporting the event
        #[arg(long, default_value_t = 0.9)]
        support: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("invalid configuration")?;
    let store = open_progress_store(&settings).await?;

    match cli.command {
        Command::Run { title, description, event_id } => {
            let query = EventRecord::new(event_id, &title, &description).query();
            let runner = build_pipeline(&settings, store, cli.offline, &query)?;
            let state = runner.run_query(event_id, &query).await?;

            match (&state.status, &state.verdict) {
                (RunStatus::Completed, Some(verdict)) => println!("{}", serde_json::to_string_pretty(verdict)?),
                _ => bail!("verification of event {} failed: {}", event_id, state.error.unwrap_or_default()),
            }
        }
        Command::Status { event_id: Some(event_id) } => {
            let view = store.progress(event_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Status { event_id: None } => {
            let snapshots = store.list_snapshots().await?;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
        Command::Simulate { title, description, voters, support } => {
            simulate(&settings, store, cli.offline, &title, &description, voters, support).await?;
        }
    }

    Ok(())
}

async fn open_progress_store(settings: &Settings) -> anyhow::Result<Arc<dyn ProgressStore>> {
    match &settings.database_url {
        Some(database_url) => {
            let store = PgProgressStore::new(database_url).await.context("failed to connect to the progress database")?;
            store.migrate().await?;
            info!("Using PostgreSQL progress store");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set, progress is kept in memory");
            Ok(Arc::new(MemoryProgressStore::new()))
        }
    }
}

fn build_pipeline(settings: &Settings, store: Arc<dyn ProgressStore>, offline: bool, query: &str) -> anyhow::Result<PipelineRunner> {
    let builder = PipelineBuilder::new()
        .store(store)
        .search_pages(settings.search.pages)
        .probe(settings.probe.clone())
        .relevance_limit(settings.relevance_limit);

    let runner = if offline {
        let (search, pages) = offline_sources(query);
        let mut summarizer = settings.summarizer.clone();
        summarizer.analysis_delay = Duration::ZERO;

        builder
            .search_backend(Arc::new(search))
            .fetcher(Arc::new(pages))
            .fetch_delay(Duration::ZERO)
            .summarizer(summarizer)
            .analyst(Arc::new(ScriptedCompletion::new("offline-analyst", "The article reports the event with named sources and consistent figures.")))
            .aggregators(ProviderChainBuilder::new().add_scripted_provider("offline-summary", &format!("Offline report for '{}': sources agree on the main facts.", query)).build())
            .direct(ProviderChainBuilder::new().add_scripted_provider("offline-direct", "No sources were available; the claim cannot be checked offline.").build())
            .build()?
    } else {
        let analyst: Arc<dyn CompletionProvider> = if settings.primary.api_key.is_some() {
            Arc::new(OpenAiCompatibleProvider::new(settings.primary.clone())?)
        } else {
            warn!("GLM_API_KEY not set, per-item analysis will fail and only statistical summaries are produced");
            Arc::new(UnavailableProvider)
        };

        let aggregators = ProviderChainBuilder::new()
            .add_http_provider(settings.primary.clone())?
            .add_http_provider(settings.secondary.clone())?
            .build();
        let direct = ProviderChainBuilder::new()
            .add_http_provider(settings.secondary.clone())?
            .add_http_provider(settings.primary.clone())?
            .build();

        builder
            .search_backend(Arc::new(SearxngBackend::new(&settings.search)?))
            .fetcher(Arc::new(HttpFetcher::new(settings.fetch.clone())?))
            .fetch_delay(Duration::from_millis(settings.fetch.delay_between_ms))
            .summarizer(settings.summarizer.clone())
            .analyst(analyst)
            .aggregators(aggregators)
            .direct(direct)
            .build()?
    };

    Ok(runner)
}

/// Canned search results and pages around `query` for the offline mode.
fn offline_sources(query: &str) -> (CannedSearch, CannedPages) {
    let outlets = ["wire", "daily", "tribune", "herald", "chronicle", "observer"];
    let mut hits = Vec::new();
    let mut pages = CannedPages::new();

    for (n, outlet) in outlets.iter().enumerate() {
        let url = format!("https://{}.offline.example/news/{}", outlet, n + 1);
        hits.push(RawHit {
            title: format!("{} coverage: {}", outlet, query),
            content: format!("Short summary of {} from the {}.", query, outlet),
            url: url.clone(),
            engine: "offline".to_string(),
            ..Default::default()
        });

        if n == outlets.len() - 1 {
            pages = pages.unreachable(&url);
            continue;
        }
        let paragraph = format!(
            "According to people familiar with the matter, {} was confirmed by several independent sources on Monday. \
             The {} reviewed the published figures and found them consistent with earlier statements.",
            query, outlet
        );
        let html = format!("<html><body><nav>Home | World</nav><article><p>{}</p><p>{}</p></article></body></html>", paragraph, paragraph);
        pages = pages.with_page(&url, &html);
    }

    (CannedSearch::new().with_page(1, hits), pages)
}

async fn simulate(settings: &Settings, store: Arc<dyn ProgressStore>, offline: bool, title: &str, description: &str, voters: u64, support: f64) -> anyhow::Result<()> {
    let thresholds = ThresholdHandle::new(settings.thresholds);
    let mut current = thresholds.current();
    if current.vote_threshold > voters {
        info!("Lowering vote threshold from {} to {} for the simulation", current.vote_threshold, voters);
        current.vote_threshold = voters;
        thresholds.update(current);
    }

    let event_id = 1;
    let query = EventRecord::new(event_id, title, description).query();
    let runner = Arc::new(build_pipeline(settings, store.clone(), offline, &query)?);
    let (queue, jobs) = AnalysisQueue::channel(store.clone());
    let lifecycle = Arc::new(EventLifecycle::new(Arc::new(MemoryEventStore::new()), thresholds.clone(), settings.auto_process).with_queue(queue));
    let worker = AnalysisWorker::new(jobs, runner).with_lifecycle(lifecycle.clone()).spawn();

    lifecycle.create_event(event_id, title, description).await?;
    for user in 1..=current.interest_threshold as i64 {
        lifecycle.add_interest(event_id, user).await?;
    }
    if !settings.auto_process {
        lifecycle.start_processing(event_id).await?;
    }

    wait_for_voting(&lifecycle, store.as_ref(), event_id).await?;

    let supporters = (voters as f64 * support.clamp(0.0, 1.0)).round() as u64;
    for user in 1..=voters {
        let stance = if user <= supporters { Stance::Support } else { Stance::Oppose };
        lifecycle.add_vote(event_id, user as i64, stance).await?;
    }

    let event = lifecycle.event(event_id).await?;
    info!("Event {} finished the simulation in status {}", event_id, event.status);
    println!("{}", serde_json::to_string_pretty(&event)?);
    println!("{}", serde_json::to_string_pretty(&lifecycle.vote_stats(event_id).await?)?);

    worker.shutdown().await?;
    Ok(())
}

async fn wait_for_voting(lifecycle: &EventLifecycle, store: &dyn ProgressStore, event_id: i64) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);

    loop {
        ticker.tick().await;
        if lifecycle.event(event_id).await?.status >= EventStatus::Voting {
            return Ok(());
        }

        let view = store.progress(event_id).await?;
        if view.status == RunStatus::Failed {
            let reason = view.snapshot.and_then(|s| s.error).unwrap_or_default();
            bail!("analysis of event {} failed: {}", event_id, reason);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("analysis of event {} did not finish in time", event_id);
        }
    }
}
