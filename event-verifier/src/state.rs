use crate::config::mask_database_url;
use crate::types::{EventId, ProgressView, Result, RunReport, RunState};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Storage for progress snapshots and run reports.
///
/// Snapshots are overwritten in place, one per event, so a poller always sees
/// the latest step.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save_snapshot(&self, state: &RunState) -> Result<()>;

    async fn load_snapshot(&self, event_id: EventId) -> Result<Option<RunState>>;

    async fn save_report(&self, report: &RunReport) -> Result<()>;

    async fn load_report(&self, run_id: Uuid) -> Result<Option<RunReport>>;

    /// Snapshots of every analyzed event, most recently updated first.
    async fn list_snapshots(&self) -> Result<Vec<RunState>>;

    /// Snapshot of an event, reading as idle when none exists.
    async fn progress(&self, event_id: EventId) -> Result<ProgressView> {
        Ok(ProgressView::from_snapshot(event_id, self.load_snapshot(event_id).await?))
    }
}

/// In-process store for tests and offline runs.
#[derive(Default)]
pub struct MemoryProgressStore {
    snapshots: Mutex<HashMap<EventId, RunState>>,
    reports: Mutex<HashMap<Uuid, RunReport>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn save_snapshot(&self, state: &RunState) -> Result<()> {
        lock(&self.snapshots).insert(state.event_id, state.clone());
        Ok(())
    }

    async fn load_snapshot(&self, event_id: EventId) -> Result<Option<RunState>> {
        Ok(lock(&self.snapshots).get(&event_id).cloned())
    }

    async fn save_report(&self, report: &RunReport) -> Result<()> {
        lock(&self.reports).insert(report.run_id, report.clone());
        Ok(())
    }

    async fn load_report(&self, run_id: Uuid) -> Result<Option<RunReport>> {
        Ok(lock(&self.reports).get(&run_id).cloned())
    }

    async fn list_snapshots(&self) -> Result<Vec<RunState>> {
        let mut snapshots: Vec<RunState> = lock(&self.snapshots).values().cloned().collect();
        snapshots.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(snapshots)
    }
}

/// Postgres-backed store.
pub struct PgProgressStore {
    db: Pool<Postgres>,
}

impl PgProgressStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting progress store to {}", mask_database_url(database_url));
        let db = PgPool::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_pool(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// Create the snapshot and report tables if needed.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("Progress store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn save_snapshot(&self, state: &RunState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_runs (event_id, run_id, status, step, snapshot, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO UPDATE
            SET run_id = EXCLUDED.run_id,
                status = EXCLUDED.status,
                step = EXCLUDED.step,
                snapshot = EXCLUDED.snapshot,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.event_id)
        .bind(state.run_id)
        .bind(state.status.as_str())
        .bind(state.step.as_str())
        .bind(Json(state))
        .bind(state.updated_at)
        .execute(&self.db)
        .await?;

        debug!("Saved snapshot for event {} at {}", state.event_id, state.step);
        Ok(())
    }

    async fn load_snapshot(&self, event_id: EventId) -> Result<Option<RunState>> {
        let row = sqlx::query("SELECT snapshot FROM verification_runs WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let Json(state): Json<RunState> = row.try_get("snapshot")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save_report(&self, report: &RunReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_reports (run_id, event_id, report, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id) DO UPDATE SET report = EXCLUDED.report
            "#,
        )
        .bind(report.run_id)
        .bind(report.event_id)
        .bind(Json(report))
        .bind(report.generated_at)
        .execute(&self.db)
        .await?;

        info!("Stored report {} for event {}", report.run_id, report.event_id);
        Ok(())
    }

    async fn load_report(&self, run_id: Uuid) -> Result<Option<RunReport>> {
        let row = sqlx::query("SELECT report FROM verification_reports WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let Json(report): Json<RunReport> = row.try_get("report")?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    async fn list_snapshots(&self) -> Result<Vec<RunState>> {
        let rows = sqlx::query("SELECT snapshot FROM verification_runs ORDER BY updated_at DESC")
            .fetch_all(&self.db)
            .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(state): Json<RunState> = row.try_get("snapshot")?;
            snapshots.push(state);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PipelineStep, RunStatus, StageCounts};

    #[tokio::test]
    async fn memory_store_overwrites_and_lists_latest_first() {
        let store = MemoryProgressStore::new();
        let mut first = RunState::started(1, Uuid::new_v4(), "first");
        store.save_snapshot(&first).await.unwrap();

        let second = RunState::started(2, Uuid::new_v4(), "second");
        store.save_snapshot(&second).await.unwrap();

        first.advance(PipelineStep::Step3Rank, StageCounts { raw: 4, ..Default::default() });
        store.save_snapshot(&first).await.unwrap();

        let loaded = store.load_snapshot(1).await.unwrap().unwrap();
        assert_eq!(loaded.step, PipelineStep::Step3Rank);

        let listed = store.list_snapshots().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].event_id, 1);
    }

    #[tokio::test]
    async fn absent_event_reads_idle() {
        let store = MemoryProgressStore::new();
        let view = store.progress(42).await.unwrap();
        assert_eq!(view.status, RunStatus::Idle);
    }
}
