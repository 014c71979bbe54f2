use crate::lifecycle::EventLifecycle;
use crate::pipeline::PipelineRunner;
use crate::state::ProgressStore;
use crate::types::{EventId, Result, RunState, RunStatus, VerifierError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One queued verification run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisJob {
    pub event_id: EventId,
    pub run_id: Uuid,
    pub query: String,
    pub submitted_at: DateTime<Utc>,
}

impl AnalysisJob {
    /// The `started` snapshot written when the job was queued.
    pub fn initial_state(&self) -> RunState {
        let mut state = RunState::started(self.event_id, self.run_id, &self.query);
        state.started_at = self.submitted_at;
        state.updated_at = self.submitted_at;
        state
    }
}

/// Immediate answer to a trigger; the outcome is only visible by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub event_id: EventId,
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// Sending half of the analysis queue.
#[derive(Clone)]
pub struct AnalysisQueue {
    sender: mpsc::UnboundedSender<AnalysisJob>,
    progress: Arc<dyn ProgressStore>,
}

impl AnalysisQueue {
    pub fn channel(progress: Arc<dyn ProgressStore>) -> (Self, mpsc::UnboundedReceiver<AnalysisJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, progress }, receiver)
    }

    /// Acknowledgment of the event's current run, if one is still pending.
    pub async fn in_flight(&self, event_id: EventId) -> Result<Option<TriggerAck>> {
        let ack = self.progress.load_snapshot(event_id).await?.filter(|state| !state.status.is_terminal()).map(|state| TriggerAck {
            event_id,
            run_id: state.run_id,
            status: state.status,
        });
        Ok(ack)
    }

    /// Record a `started` snapshot and queue the run.
    pub async fn submit(&self, event_id: EventId, query: &str) -> Result<TriggerAck> {
        let job = AnalysisJob {
            event_id,
            run_id: Uuid::new_v4(),
            query: query.to_string(),
            submitted_at: Utc::now(),
        };
        let mut state = job.initial_state();
        self.progress.save_snapshot(&state).await?;

        let run_id = job.run_id;
        if self.sender.send(job).is_err() {
            state.fail("analysis queue closed");
            self.progress.save_snapshot(&state).await?;
            return Err(VerifierError::General("analysis queue closed".to_string()));
        }

        info!("Queued run {} for event {}", run_id, event_id);
        Ok(TriggerAck {
            event_id,
            run_id,
            status: RunStatus::Started,
        })
    }
}

/// Handle to a spawned worker. Dropping it also stops the worker.
pub struct WorkerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop accepting jobs, then wait for queued and in-flight runs to finish.
    pub async fn shutdown(self) -> Result<()> {
        // the worker may already have stopped on its own
        let _ = self.shutdown.send(());
        self.task.await.map_err(|e| VerifierError::General(format!("analysis worker panicked: {}", e)))
    }
}

/// Consumes the analysis queue, running each job in its own supervised task.
pub struct AnalysisWorker {
    receiver: mpsc::UnboundedReceiver<AnalysisJob>,
    runner: Arc<PipelineRunner>,
    lifecycle: Option<Arc<EventLifecycle>>,
}

impl AnalysisWorker {
    pub fn new(receiver: mpsc::UnboundedReceiver<AnalysisJob>, runner: Arc<PipelineRunner>) -> Self {
        Self {
            receiver,
            runner,
            lifecycle: None,
        }
    }

    /// Attach verdicts of completed runs to their events.
    pub fn with_lifecycle(mut self, lifecycle: Arc<EventLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle { shutdown, task }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!("Analysis worker started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                job = self.receiver.recv() => match job {
                    Some(job) => self.dispatch(&mut in_flight, job),
                    None => break,
                },
                _ = &mut shutdown => {
                    self.receiver.close();
                    while let Some(job) = self.receiver.recv().await {
                        self.dispatch(&mut in_flight, job);
                    }
                    break;
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!("Analysis worker stopped");
    }

    fn dispatch(&self, in_flight: &mut JoinSet<()>, job: AnalysisJob) {
        let runner = self.runner.clone();
        let lifecycle = self.lifecycle.clone();
        in_flight.spawn(supervise(job, runner, lifecycle));
    }
}

async fn supervise(job: AnalysisJob, runner: Arc<PipelineRunner>, lifecycle: Option<Arc<EventLifecycle>>) {
    let store = runner.store();
    let state = job.initial_state();
    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.execute(state).await }
    });

    match task.await {
        Ok(Ok(finished)) => {
            let verdict = match (&finished.status, &finished.verdict) {
                (RunStatus::Completed, Some(verdict)) => verdict,
                _ => return,
            };
            if let Some(lifecycle) = lifecycle {
                match lifecycle.attach_verdict(job.event_id, verdict).await {
                    Ok(true) => info!("Verdict of run {} attached to event {}", job.run_id, job.event_id),
                    Ok(false) => warn!("Event {} was not processing; verdict of run {} kept in the report only", job.event_id, job.run_id),
                    Err(e) => error!("Failed to attach verdict to event {}: {}", job.event_id, e),
                }
            }
        }
        Ok(Err(e)) => record_failure(store.as_ref(), &job, &e.to_string()).await,
        Err(join_error) => record_failure(store.as_ref(), &job, &format!("analysis task aborted: {}", join_error)).await,
    }
}

async fn record_failure(store: &dyn ProgressStore, job: &AnalysisJob, reason: &str) {
    error!("Run {} for event {} failed: {}", job.run_id, job.event_id, reason);

    let mut state = match store.load_snapshot(job.event_id).await {
        Ok(Some(state)) if state.run_id == job.run_id => state,
        _ => job.initial_state(),
    };
    state.fail(reason);
    if let Err(e) = store.save_snapshot(&state).await {
        error!("Could not record failure of run {}: {}", job.run_id, e);
    }
}
