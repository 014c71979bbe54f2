use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
// Use the interfaces crate for core types
pub use interfaces::defs::{Candidate, EventId, GenerationMode, Language, PublishMeta, RawHit, Reliability, StageCounts, Verdict};
pub use interfaces::defs::{CapabilityError, CompletionProvider, CompletionRequest, EventStatus, PageFetcher, SearchBackend, Stance, UserId};

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Pause between consecutive page downloads of one run.
    pub delay_between_ms: u64,
    /// Minimum spacing between two requests to the same host.
    pub min_host_interval_ms: u64,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            timeout_seconds: 30,
            max_retries: 2,
            retry_delay_ms: 500,
            delay_between_ms: 1000,
            min_host_interval_ms: 1000,
            max_redirects: 5,
        }
    }
}

/// Terminal and in-flight states of a verification run as seen by a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// No run was ever recorded for the event.
    Idle,
    Started,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Started => "started",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Started,
    Step1Search,
    Step2Probe,
    Step3Rank,
    Step4Fetch,
    Step5Extract,
    Step6Analyze,
    Step7Summarize,
    DirectAi,
    Completed,
    Failed,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Started => "started",
            PipelineStep::Step1Search => "step1_search",
            PipelineStep::Step2Probe => "step2_probe",
            PipelineStep::Step3Rank => "step3_rank",
            PipelineStep::Step4Fetch => "step4_fetch",
            PipelineStep::Step5Extract => "step5_extract",
            PipelineStep::Step6Analyze => "step6_analyze",
            PipelineStep::Step7Summarize => "step7_summarize",
            PipelineStep::DirectAi => "direct_ai",
            PipelineStep::Completed => "completed",
            PipelineStep::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot of one run, persisted after every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub event_id: EventId,
    /// Key of the detailed [`RunReport`] once the run completes.
    pub run_id: Uuid,
    pub query: String,
    pub status: RunStatus,
    pub step: PipelineStep,
    pub counts: StageCounts,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub verdict: Option<Verdict>,
    pub error: Option<String>,
}

impl RunState {
    pub fn started(event_id: EventId, run_id: Uuid, query: &str) -> Self {
        let now = Utc::now();
        Self {
            event_id,
            run_id,
            query: query.to_string(),
            status: RunStatus::Started,
            step: PipelineStep::Started,
            counts: StageCounts::default(),
            started_at: now,
            updated_at: now,
            finished_at: None,
            verdict: None,
            error: None,
        }
    }

    pub fn advance(&mut self, step: PipelineStep, counts: StageCounts) {
        self.status = RunStatus::Running;
        self.step = step;
        self.counts = counts;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, verdict: Verdict) {
        let now = Utc::now();
        self.status = RunStatus::Completed;
        self.step = PipelineStep::Completed;
        self.counts = verdict.counts;
        self.verdict = Some(verdict);
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, error: &str) {
        let now = Utc::now();
        self.status = RunStatus::Failed;
        self.step = PipelineStep::Failed;
        self.error = Some(error.to_string());
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

/// What a poller sees for an event, including events never analyzed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub event_id: EventId,
    pub status: RunStatus,
    pub snapshot: Option<RunState>,
}

impl ProgressView {
    pub fn from_snapshot(event_id: EventId, snapshot: Option<RunState>) -> Self {
        match snapshot {
            Some(state) => Self { event_id, status: state.status, snapshot: Some(state) },
            None => Self { event_id, status: RunStatus::Idle, snapshot: None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub id: u32,
    pub url: String,
    pub error: String,
}

/// Detailed result of a finished run, stored separately from the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub event_id: EventId,
    pub query: String,
    pub candidates: Vec<Candidate>,
    pub fetch_failures: Vec<PageFailure>,
    pub counts: StageCounts,
    pub verdict: Verdict,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event not found: {id}")]
    EventNotFound { id: EventId },

    #[error("Analysis rejected for event {id}: {reason}")]
    AnalysisRejected { id: EventId, reason: String },

    #[error("Event {id} is not open for voting (status {status})")]
    VotingClosed { id: EventId, status: EventStatus },

    #[error("Event {id} already exists")]
    DuplicateEvent { id: EventId },

    #[error("Missing intermediate output: {0}")]
    MissingArtifact(String),

    #[error("All {pages} search pages failed")]
    SearchExhausted { pages: u32 },

    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("General error: {0}")]
    General(String),
}

impl VerifierError {
    /// Errors meaning a stage's input was never produced.
    pub fn is_missing_artifact(&self) -> bool {
        matches!(self, VerifierError::MissingArtifact(_))
    }
}

pub type Result<T> = std::result::Result<T, VerifierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_tags_match_serialized_form() {
        for step in [PipelineStep::Step1Search, PipelineStep::Step7Summarize, PipelineStep::DirectAi] {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
        }
    }

    #[test]
    fn absent_snapshot_reads_as_idle() {
        let view = ProgressView::from_snapshot(7, None);
        assert_eq!(view.status, RunStatus::Idle);
        assert!(view.snapshot.is_none());
    }

    #[test]
    fn snapshot_lifecycle_sets_timestamps() {
        let mut state = RunState::started(1, Uuid::new_v4(), "NVIDIA");
        assert_eq!(state.status, RunStatus::Started);
        assert!(state.finished_at.is_none());

        state.advance(PipelineStep::Step2Probe, StageCounts { raw: 3, ..Default::default() });
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.counts.raw, 3);

        state.fail("boom");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.finished_at.is_some());
        assert!(state.status.is_terminal());
    }
}
