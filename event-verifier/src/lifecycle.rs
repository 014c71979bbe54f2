use crate::config::{ThresholdHandle, Thresholds};
use crate::types::{EventId, EventStatus, Reliability, Result, Stance, UserId, Verdict, VerifierError};
use crate::worker::{AnalysisQueue, TriggerAck};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub title: String,
    pub description: String,
    pub status: EventStatus,
    /// Set by an administrator; lets analysis start below the interest threshold.
    pub approved: bool,
    pub interested: BTreeSet<UserId>,
    pub votes: BTreeMap<UserId, Stance>,
    pub reliability: Option<Reliability>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(id: EventId, title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.to_string(),
            description: description.to_string(),
            status: EventStatus::Pending,
            approved: false,
            interested: BTreeSet::new(),
            votes: BTreeMap::new(),
            reliability: None,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn interest_count(&self) -> u64 {
        self.interested.len() as u64
    }

    pub fn vote_stats(&self) -> VoteStats {
        let support = self.votes.values().filter(|stance| **stance == Stance::Support).count() as u64;
        let oppose = self.votes.len() as u64 - support;
        VoteStats::from_counts(support, oppose)
    }

    /// Search query for the event: title and description joined by a space.
    pub fn query(&self) -> String {
        format!("{} {}", self.title.trim(), self.description.trim()).trim().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoteStats {
    pub support: u64,
    pub oppose: u64,
    pub total: u64,
    pub support_pct: f64,
    pub oppose_pct: f64,
}

impl VoteStats {
    pub fn from_counts(support: u64, oppose: u64) -> Self {
        let total = support + oppose;
        let pct = |n: u64| if total == 0 { 0.0 } else { n as f64 * 100.0 / total as f64 };
        Self {
            support,
            oppose,
            total,
            support_pct: pct(support),
            oppose_pct: pct(oppose),
        }
    }

    /// Gap between the two shares in percentage points.
    pub fn margin_pct(&self) -> f64 {
        (self.support_pct - self.oppose_pct).abs()
    }
}

/// Result of one mutation applied to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Whether the counters or flags actually changed.
    pub changed: bool,
    pub from: EventStatus,
    pub to: EventStatus,
}

impl Applied {
    /// True exactly once per event: when it first reaches PROCESSING.
    pub fn entered_processing(&self) -> bool {
        self.from < EventStatus::Processing && self.to >= EventStatus::Processing
    }
}

pub type Mutation<'a> = Box<dyn FnOnce(&mut EventRecord) -> Result<Applied> + Send + 'a>;

/// Event records with one exclusive read-modify-write operation.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, record: EventRecord) -> Result<()>;

    async fn get(&self, id: EventId) -> Result<EventRecord>;

    /// Run `mutation` while the record is exclusively held and return the
    /// updated record. A failing mutation must leave the record unchanged.
    async fn modify<'a>(&self, id: EventId, mutation: Mutation<'a>) -> Result<(EventRecord, Applied)>;
}

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<EventId, EventRecord>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, record: EventRecord) -> Result<()> {
        let mut events = lock(&self.events);
        if events.contains_key(&record.id) {
            return Err(VerifierError::DuplicateEvent { id: record.id });
        }
        events.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: EventId) -> Result<EventRecord> {
        lock(&self.events).get(&id).cloned().ok_or(VerifierError::EventNotFound { id })
    }

    async fn modify<'a>(&self, id: EventId, mutation: Mutation<'a>) -> Result<(EventRecord, Applied)> {
        let mut events = lock(&self.events);
        let record = events.get_mut(&id).ok_or(VerifierError::EventNotFound { id })?;

        let mut working = record.clone();
        let applied = mutation(&mut working)?;
        if applied.changed || applied.from != applied.to {
            working.updated_at = Utc::now();
        }
        *record = working.clone();
        Ok((working, applied))
    }
}

fn confirmation_reached(stats: &VoteStats, thresholds: &Thresholds) -> bool {
    stats.total >= thresholds.vote_threshold && stats.margin_pct() > thresholds.victory_margin * 100.0
}

/// Move the record forward as far as the current counters allow.
///
/// Statuses only ever advance, so evaluating twice is the same as once.
pub fn evaluate_transitions(record: &mut EventRecord, thresholds: &Thresholds, auto_process: bool) {
    if record.status == EventStatus::Pending && record.interest_count() >= thresholds.interest_threshold {
        record.status = EventStatus::Nominated;
    }
    if record.status == EventStatus::Nominated && auto_process {
        record.status = EventStatus::Processing;
    }
    if record.status == EventStatus::Voting && confirmation_reached(&record.vote_stats(), thresholds) {
        record.status = EventStatus::Confirmed;
    }
}

fn ensure_voting_open(record: &EventRecord) -> Result<()> {
    match record.status {
        EventStatus::Voting | EventStatus::Confirmed => Ok(()),
        status => Err(VerifierError::VotingClosed { id: record.id, status }),
    }
}

/// Interest, votes and status transitions of events.
pub struct EventLifecycle {
    events: Arc<dyn EventStore>,
    thresholds: ThresholdHandle,
    auto_process: bool,
    queue: Option<AnalysisQueue>,
}

impl EventLifecycle {
    pub fn new(events: Arc<dyn EventStore>, thresholds: ThresholdHandle, auto_process: bool) -> Self {
        Self {
            events,
            thresholds,
            auto_process,
            queue: None,
        }
    }

    /// Queue receiving a job whenever an event enters PROCESSING.
    pub fn with_queue(mut self, queue: AnalysisQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn thresholds(&self) -> &ThresholdHandle {
        &self.thresholds
    }

    /// Insert a PENDING event, then run the transition table once so a zero
    /// interest threshold takes effect immediately.
    pub async fn create_event(&self, id: EventId, title: &str, description: &str) -> Result<EventRecord> {
        self.events.insert(EventRecord::new(id, title, description)).await?;
        info!("Created event {}: {}", id, title);
        let (record, _, _) = self.apply(id, |_| Ok(false)).await?;
        Ok(record)
    }

    pub async fn event(&self, id: EventId) -> Result<EventRecord> {
        self.events.get(id).await
    }

    /// Apply `op` and re-evaluate the transition table in one exclusive step.
    async fn apply<F>(&self, id: EventId, op: F) -> Result<(EventRecord, Applied, Option<TriggerAck>)>
    where
        F: FnOnce(&mut EventRecord) -> Result<bool> + Send + 'static,
    {
        let thresholds = self.thresholds.clone();
        let auto_process = self.auto_process;

        let (record, applied) = self
            .events
            .modify(
                id,
                Box::new(move |record: &mut EventRecord| {
                    let from = record.status;
                    let changed = op(record)?;
                    evaluate_transitions(record, &thresholds.current(), auto_process);
                    Ok(Applied { changed, from, to: record.status })
                }),
            )
            .await?;

        if applied.from != applied.to {
            info!("Event {} moved {} -> {}", id, applied.from, applied.to);
        }
        let ack = if applied.entered_processing() { self.schedule(&record).await? } else { None };
        Ok((record, applied, ack))
    }

    async fn schedule(&self, record: &EventRecord) -> Result<Option<TriggerAck>> {
        match &self.queue {
            Some(queue) => {
                let ack = queue.submit(record.id, &record.query()).await?;
                Ok(Some(ack))
            }
            None => {
                warn!("Event {} is processing but no analysis queue is attached", record.id);
                Ok(None)
            }
        }
    }

    /// Register a user's interest; false if they were already interested.
    pub async fn add_interest(&self, id: EventId, user: UserId) -> Result<bool> {
        let (_, applied, _) = self.apply(id, move |record| Ok(record.interested.insert(user))).await?;
        debug!("Interest of user {} in event {}: changed={}", user, id, applied.changed);
        Ok(applied.changed)
    }

    pub async fn remove_interest(&self, id: EventId, user: UserId) -> Result<bool> {
        let (_, applied, _) = self.apply(id, move |record| Ok(record.interested.remove(&user))).await?;
        Ok(applied.changed)
    }

    /// Cast a first vote; false if the user already voted.
    pub async fn add_vote(&self, id: EventId, user: UserId, stance: Stance) -> Result<bool> {
        let (_, applied, _) = self
            .apply(id, move |record| {
                ensure_voting_open(record)?;
                if record.votes.contains_key(&user) {
                    return Ok(false);
                }
                record.votes.insert(user, stance);
                Ok(true)
            })
            .await?;
        Ok(applied.changed)
    }

    /// Switch an existing vote; false if there is none or the stance is the same.
    pub async fn change_vote(&self, id: EventId, user: UserId, stance: Stance) -> Result<bool> {
        let (_, applied, _) = self
            .apply(id, move |record| {
                ensure_voting_open(record)?;
                match record.votes.get_mut(&user) {
                    Some(current) if *current != stance => {
                        *current = stance;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await?;
        Ok(applied.changed)
    }

    pub async fn delete_vote(&self, id: EventId, user: UserId) -> Result<bool> {
        let (_, applied, _) = self
            .apply(id, move |record| {
                ensure_voting_open(record)?;
                Ok(record.votes.remove(&user).is_some())
            })
            .await?;
        Ok(applied.changed)
    }

    pub async fn vote_stats(&self, id: EventId) -> Result<VoteStats> {
        Ok(self.events.get(id).await?.vote_stats())
    }

    /// Administrative approval: PENDING events are nominated regardless of interest.
    pub async fn approve(&self, id: EventId) -> Result<EventStatus> {
        let (record, _, _) = self
            .apply(id, |record| {
                let changed = !record.approved;
                record.approved = true;
                if record.status == EventStatus::Pending {
                    record.status = EventStatus::Nominated;
                }
                Ok(changed)
            })
            .await?;
        info!("Event {} approved, now {}", id, record.status);
        Ok(record.status)
    }

    /// Administrative NOMINATED -> PROCESSING; a no-op in any other status.
    pub async fn start_processing(&self, id: EventId) -> Result<bool> {
        let (_, applied, _) = self
            .apply(id, |record| {
                if record.status == EventStatus::Nominated {
                    record.status = EventStatus::Processing;
                }
                Ok(false)
            })
            .await?;
        Ok(applied.entered_processing())
    }

    /// Store a verdict on a processing event and open voting.
    ///
    /// Returns false when the event is not processing, e.g. a verdict was
    /// already attached.
    pub async fn attach_verdict(&self, id: EventId, verdict: &Verdict) -> Result<bool> {
        let reliability = verdict.reliability;
        let summary = verdict.summary.clone();
        let (_, applied, _) = self
            .apply(id, move |record| {
                if record.status != EventStatus::Processing {
                    return Ok(false);
                }
                record.reliability = Some(reliability);
                record.summary = Some(summary);
                record.status = EventStatus::Voting;
                Ok(true)
            })
            .await?;

        if !applied.changed {
            debug!("Verdict for event {} ignored in status {}", id, applied.to);
        }
        Ok(applied.changed)
    }

    /// Explicit request to analyze an event.
    ///
    /// Rejected when the event has too little interest and was never approved,
    /// or once a verdict is attached. A nominated event moves to PROCESSING and
    /// a run is queued. A processing event answers with its pending run, and
    /// only gets a new one after the previous run finished.
    pub async fn trigger_analysis(&self, id: EventId) -> Result<TriggerAck> {
        let record = self.events.get(id).await?;
        let thresholds = self.thresholds.current();
        if record.interest_count() < thresholds.interest_threshold && !record.approved {
            return Err(VerifierError::AnalysisRejected {
                id,
                reason: format!("interest {} below threshold {} and not approved", record.interest_count(), thresholds.interest_threshold),
            });
        }

        let (record, _, ack) = self
            .apply(id, |record| {
                if record.status == EventStatus::Nominated {
                    record.status = EventStatus::Processing;
                }
                Ok(false)
            })
            .await?;
        if let Some(ack) = ack {
            return Ok(ack);
        }

        let queue = self.queue.as_ref().ok_or_else(|| VerifierError::Config("no analysis queue attached".to_string()))?;
        match record.status {
            EventStatus::Processing => {}
            status @ (EventStatus::Voting | EventStatus::Confirmed) => {
                return Err(VerifierError::AnalysisRejected {
                    id,
                    reason: format!("verdict already attached (status {})", status),
                });
            }
            status => {
                return Err(VerifierError::AnalysisRejected {
                    id,
                    reason: format!("event is {}", status),
                });
            }
        }
        if let Some(ack) = queue.in_flight(id).await? {
            debug!("Event {} already has run {} pending", id, ack.run_id);
            return Ok(ack);
        }

        match self.schedule(&record).await? {
            Some(ack) => Ok(ack),
            None => Err(VerifierError::Config("no analysis queue attached".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(interest: u64, votes: u64, margin: f64) -> ThresholdHandle {
        ThresholdHandle::new(Thresholds {
            interest_threshold: interest,
            vote_threshold: votes,
            victory_margin: margin,
        })
    }

    #[test]
    fn vote_stats_percentages() {
        let stats = VoteStats::from_counts(18, 2);
        assert_eq!(stats.total, 20);
        assert!((stats.support_pct - 90.0).abs() < 1e-9);
        assert!((stats.margin_pct() - 80.0).abs() < 1e-9);
        assert_eq!(VoteStats::from_counts(0, 0).margin_pct(), 0.0);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let limits = Thresholds { interest_threshold: 2, vote_threshold: 1, victory_margin: 0.5 };
        let mut record = EventRecord::new(1, "t", "d");
        record.interested.extend([1, 2]);

        evaluate_transitions(&mut record, &limits, false);
        assert_eq!(record.status, EventStatus::Nominated);
        evaluate_transitions(&mut record, &limits, false);
        assert_eq!(record.status, EventStatus::Nominated);

        evaluate_transitions(&mut record, &limits, true);
        assert_eq!(record.status, EventStatus::Processing);
    }

    #[tokio::test]
    async fn interest_is_deduplicated_per_user() {
        let lifecycle = EventLifecycle::new(Arc::new(MemoryEventStore::new()), thresholds(10, 10, 0.5), false);
        lifecycle.create_event(1, "title", "description").await.unwrap();

        assert!(lifecycle.add_interest(1, 7).await.unwrap());
        assert!(!lifecycle.add_interest(1, 7).await.unwrap());
        assert!(lifecycle.remove_interest(1, 7).await.unwrap());
        assert!(!lifecycle.remove_interest(1, 7).await.unwrap());
        assert_eq!(lifecycle.event(1).await.unwrap().interest_count(), 0);
    }

    #[tokio::test]
    async fn votes_rejected_before_voting() {
        let lifecycle = EventLifecycle::new(Arc::new(MemoryEventStore::new()), thresholds(10, 10, 0.5), false);
        lifecycle.create_event(1, "title", "description").await.unwrap();

        let err = lifecycle.add_vote(1, 1, Stance::Support).await.unwrap_err();
        assert!(matches!(err, VerifierError::VotingClosed { status: EventStatus::Pending, .. }));
        assert!(lifecycle.event(1).await.unwrap().votes.is_empty());
    }

    #[tokio::test]
    async fn approval_without_auto_process_waits_for_admin() {
        let lifecycle = EventLifecycle::new(Arc::new(MemoryEventStore::new()), thresholds(10, 10, 0.5), false);
        lifecycle.create_event(3, "title", "description").await.unwrap();

        assert_eq!(lifecycle.approve(3).await.unwrap(), EventStatus::Nominated);
        assert!(lifecycle.start_processing(3).await.unwrap());
        assert!(!lifecycle.start_processing(3).await.unwrap());
        assert_eq!(lifecycle.event(3).await.unwrap().status, EventStatus::Processing);
    }

    #[tokio::test]
    async fn trigger_rejected_below_interest() {
        let lifecycle = EventLifecycle::new(Arc::new(MemoryEventStore::new()), thresholds(10, 10, 0.5), false);
        lifecycle.create_event(4, "title", "description").await.unwrap();
        lifecycle.add_interest(4, 1).await.unwrap();

        let err = lifecycle.trigger_analysis(4).await.unwrap_err();
        assert!(matches!(err, VerifierError::AnalysisRejected { id: 4, .. }));
        assert_eq!(lifecycle.event(4).await.unwrap().status, EventStatus::Pending);
    }

    #[test]
    fn query_joins_title_and_description() {
        let record = EventRecord::new(1, " NVIDIA ", "earnings beat ");
        assert_eq!(record.query(), "NVIDIA earnings beat");
    }
}
