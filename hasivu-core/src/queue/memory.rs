use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::{QueueConfig, RetryConfig},
    error::{CoreError, Result},
    events::{JobEvent, JobEventPayload, JobEventPublisher},
    types::{LeaseId, SchoolId},
};

use super::{
    backoff::Backoff,
    job::{EnqueueRequest, JobHandle, JobId, JobPriority, JobRecord, JobState, QueueName},
    lease::{DequeueRequest, JobLease, LeaseRenewal},
    scheduler::ReadyCountEntry,
    service::{
        DeadLetterStore, LeaseExpiryScanner, QueueInstrumentation, QueueService, QueueSnapshot,
    },
};

type ReadyKey = (JobPriority, DateTime<Utc>, u64);
type WaitKey = (DateTime<Utc>, u64);

struct StoredJob {
    record: JobRecord,
    seq: u64,
    lease: Option<LeaseId>,
}

impl StoredJob {
    fn ready_key(&self) -> ReadyKey {
        (self.record.priority, self.record.available_at, self.seq)
    }

    fn wait_key(&self) -> WaitKey {
        (self.record.available_at, self.seq)
    }
}

struct LeaseEntry {
    job_id: JobId,
    owner: String,
    expires_at: DateTime<Utc>,
    renewals: u32,
}

/// Per-queue indexes. `waiting` holds delayed jobs and jobs backing off
/// after a failed attempt, ordered by the instant they become due.
/// `ready_counts` mirrors `ready` grouped by (school, priority).
#[derive(Default)]
struct Lane {
    ready: BTreeMap<ReadyKey, JobId>,
    ready_counts: HashMap<(SchoolId, JobPriority), usize>,
    waiting: BTreeMap<WaitKey, JobId>,
    completed: u64,
    dequeues: VecDeque<DateTime<Utc>>,
}

impl Lane {
    fn push_ready(&mut self, stored: &StoredJob, job_id: JobId) {
        if self.ready.insert(stored.ready_key(), job_id).is_none() {
            *self
                .ready_counts
                .entry((stored.record.school_id, stored.record.priority))
                .or_insert(0) += 1;
        }
    }

    fn pull_ready(&mut self, key: &ReadyKey, school_id: SchoolId) -> Option<JobId> {
        let job_id = self.ready.remove(key)?;
        let bucket = (school_id, key.0);
        if let Some(count) = self.ready_counts.get_mut(&bucket) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ready_counts.remove(&bucket);
            }
        }
        Some(job_id)
    }

    fn record_dequeue(&mut self, now: DateTime<Utc>) {
        self.dequeues.push_back(now);
        let horizon = now - chrono::Duration::seconds(60);
        while self.dequeues.front().is_some_and(|ts| *ts < horizon) {
            self.dequeues.pop_front();
        }
    }

    fn dequeues_last_minute(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - chrono::Duration::seconds(60);
        self.dequeues.iter().filter(|ts| **ts >= horizon).count()
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, StoredJob>,
    leases: HashMap<LeaseId, LeaseEntry>,
    lanes: HashMap<QueueName, Lane>,
    dedupe: HashMap<(QueueName, String), JobId>,
    next_seq: u64,
}

impl QueueState {
    fn place(&mut self, job_id: JobId) {
        let Some(stored) = self.jobs.get(&job_id) else {
            return;
        };
        let lane = self.lanes.entry(stored.record.queue.clone()).or_default();
        match stored.record.state {
            JobState::Ready => lane.push_ready(stored, job_id),
            JobState::Deferred | JobState::Failed => {
                lane.waiting.insert(stored.wait_key(), job_id);
            }
            _ => {}
        }
    }

    fn unplace(&mut self, job_id: JobId) {
        let Some(stored) = self.jobs.get(&job_id) else {
            return;
        };
        if let Some(lane) = self.lanes.get_mut(&stored.record.queue) {
            match stored.record.state {
                JobState::Ready => {
                    lane.pull_ready(&stored.ready_key(), stored.record.school_id);
                }
                JobState::Deferred | JobState::Failed => {
                    lane.waiting.remove(&stored.wait_key());
                }
                _ => {}
            }
        }
    }

    fn release_dedupe(&mut self, job_id: JobId) {
        let Some(stored) = self.jobs.get(&job_id) else {
            return;
        };
        if let Some(key) = &stored.record.dedupe_key {
            let index_key = (stored.record.queue.clone(), key.clone());
            if self.dedupe.get(&index_key) == Some(&job_id) {
                self.dedupe.remove(&index_key);
            }
        }
    }

    fn active_duplicate(&self, queue: &QueueName, key: &str) -> Option<JobId> {
        let job_id = self.dedupe.get(&(queue.clone(), key.to_string()))?;
        self.jobs
            .get(job_id)
            .filter(|stored| stored.record.state.is_active())
            .map(|stored| stored.record.id)
    }

    fn promote_due(&mut self, queue: &QueueName, now: DateTime<Utc>) {
        let Some(lane) = self.lanes.get_mut(queue) else {
            return;
        };
        let due: Vec<WaitKey> = lane
            .waiting
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            let Some(job_id) = lane.waiting.remove(&key) else {
                continue;
            };
            if let Some(stored) = self.jobs.get_mut(&job_id) {
                stored.record.state = JobState::Ready;
                stored.record.updated_at = now;
                lane.push_ready(stored, job_id);
            }
        }
    }

    fn take_lease(&mut self, lease_id: LeaseId) -> Result<(LeaseEntry, JobId)> {
        let entry = self
            .leases
            .remove(&lease_id)
            .ok_or_else(|| CoreError::NotFound(format!("lease {lease_id} not found")))?;
        let job_id = entry.job_id;
        let stored = self.jobs.get_mut(&job_id).ok_or_else(|| {
            CoreError::Internal(format!("lease {lease_id} points at missing job {job_id}"))
        })?;
        stored.lease = None;
        stored.record.lease_owner = None;
        stored.record.lease_expires_at = None;
        Ok((entry, job_id))
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut JobRecord> {
        self.jobs
            .get_mut(&job_id)
            .map(|stored| &mut stored.record)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id} not found")))
    }

    fn lane_mut(&mut self, queue: &QueueName) -> &mut Lane {
        self.lanes.entry(queue.clone()).or_default()
    }
}

/// Single-process queue backend: priority lanes per named queue, leases,
/// backoff retries and a dead-letter store.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    backoff: Backoff,
    max_delay: Duration,
    events: Option<Arc<dyn JobEventPublisher>>,
}

impl fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryQueue");
        debug.field("retry", self.backoff.config());
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("job_count", &state.jobs.len())
                    .field("lease_count", &state.leases.len())
                    .field("queue_count", &state.lanes.len());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.field("events", &self.events.is_some()).finish()
    }
}

impl InMemoryQueue {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            backoff: Backoff::new(retry),
            max_delay: QueueConfig::default().max_delay(),
            events: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current view of an active or dead-lettered job.
    pub fn job(&self, job_id: JobId) -> Option<JobRecord> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .map(|stored| stored.record.clone())
    }

    async fn publish(&self, events: Vec<JobEvent>) {
        let Some(bus) = &self.events else {
            return;
        };
        for event in events {
            if let Err(err) = bus.publish(event).await {
                warn!(target: "hasivu::queue", error = %err, "failed to publish job event");
            }
        }
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let (handle, event) = {
            let mut state = self.state.lock();
            let now = Utc::now();

            let duplicate = match (&request.dedupe_key, request.allow_merge) {
                (Some(key), true) => state.active_duplicate(&request.queue, key),
                _ => None,
            };

            if let Some(existing) = duplicate {
                state.unplace(existing);
                let record = state.job_mut(existing)?;
                record.priority = record.priority.elevate(request.priority);
                record.updated_at = now;
                let record = record.clone();
                state.place(existing);
                debug!(
                    target: "hasivu::queue",
                    queue = %record.queue,
                    job = %existing,
                    priority = ?record.priority,
                    "merged enqueue into active job"
                );
                let event = JobEvent::from_job(
                    &record,
                    JobEventPayload::Merged {
                        existing_job_id: existing,
                        queue: record.queue.clone(),
                        priority: record.priority,
                    },
                );
                (JobHandle::merged(&record), event)
            } else {
                let record =
                    JobRecord::new(request, self.backoff.config().max_attempts, self.max_delay)?;
                let job_id = record.id;
                let seq = state.next_seq;
                state.next_seq += 1;
                if let Some(key) = &record.dedupe_key {
                    state
                        .dedupe
                        .insert((record.queue.clone(), key.clone()), job_id);
                }
                let handle = JobHandle::accepted(&record);
                let event = JobEvent::from_job(
                    &record,
                    JobEventPayload::Enqueued {
                        job_id,
                        queue: record.queue.clone(),
                        priority: record.priority,
                    },
                );
                state.jobs.insert(
                    job_id,
                    StoredJob {
                        record,
                        seq,
                        lease: None,
                    },
                );
                state.place(job_id);
                debug!(
                    target: "hasivu::queue",
                    queue = %handle.queue,
                    job = %job_id,
                    school = %handle.school_id,
                    priority = ?handle.priority,
                    "job enqueued"
                );
                (handle, event)
            }
        };

        self.publish(vec![event]).await;
        Ok(handle)
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        state.promote_due(&request.queue, now);

        let QueueState {
            jobs,
            leases,
            lanes,
            ..
        } = &mut *state;
        let Some(lane) = lanes.get_mut(&request.queue) else {
            return Ok(None);
        };

        let picked = lane
            .ready
            .iter()
            .filter(|(key, _)| request.selector.is_none_or(|s| s.priority == key.0))
            .find_map(|(key, job_id)| {
                let stored = jobs.get(job_id)?;
                request
                    .selector
                    .is_none_or(|selector| selector.matches(&stored.record))
                    .then_some((*key, stored.record.school_id))
            });

        let Some((key, school_id)) = picked else {
            return Ok(None);
        };
        let Some(job_id) = lane.pull_ready(&key, school_id) else {
            return Ok(None);
        };
        lane.record_dequeue(now);

        let Some(stored) = jobs.get_mut(&job_id) else {
            return Err(CoreError::Internal(format!(
                "ready index points at missing job {job_id}"
            )));
        };
        let lease_id = LeaseId::new();
        let expires_at = now + request.lease_ttl;
        stored.record.state = JobState::Leased;
        stored.record.lease_owner = Some(request.worker_id.clone());
        stored.record.lease_expires_at = Some(expires_at);
        stored.record.updated_at = now;
        stored.lease = Some(lease_id);

        leases.insert(
            lease_id,
            LeaseEntry {
                job_id,
                owner: request.worker_id.clone(),
                expires_at,
                renewals: 0,
            },
        );

        Ok(Some(JobLease {
            lease_id,
            job: stored.record.clone(),
            lease_owner: request.worker_id,
            expires_at,
            renewals: 0,
        }))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let QueueState { jobs, leases, .. } = &mut *state;

        let entry = leases.get_mut(&renewal.lease_id).ok_or_else(|| {
            CoreError::NotFound(format!("lease {} not found", renewal.lease_id))
        })?;
        if entry.owner != renewal.worker_id {
            return Err(CoreError::Conflict(format!(
                "lease {} is owned by {}",
                renewal.lease_id, entry.owner
            )));
        }
        if entry.expires_at <= now {
            return Err(CoreError::Conflict(format!(
                "lease {} expired at {}",
                renewal.lease_id, entry.expires_at
            )));
        }

        entry.expires_at = now + renewal.extend_by;
        entry.renewals += 1;

        let stored = jobs
            .get_mut(&entry.job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {} not found", entry.job_id)))?;
        stored.record.lease_expires_at = Some(entry.expires_at);
        stored.record.updated_at = now;

        Ok(JobLease {
            lease_id: renewal.lease_id,
            job: stored.record.clone(),
            lease_owner: entry.owner.clone(),
            expires_at: entry.expires_at,
            renewals: entry.renewals,
        })
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        let (_, job_id) = state.take_lease(lease_id)?;
        state.release_dedupe(job_id);
        if let Some(stored) = state.jobs.remove(&job_id) {
            state.lane_mut(&stored.record.queue).completed += 1;
            debug!(
                target: "hasivu::queue",
                queue = %stored.record.queue,
                job = %job_id,
                attempts = stored.record.attempts,
                "job completed"
            );
        }
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let (_, job_id) = state.take_lease(lease_id)?;
        let record = state.job_mut(job_id)?;
        record.attempts = record.attempts.saturating_add(1);
        record.last_error = error;
        record.updated_at = now;

        if retryable && record.attempts < record.max_attempts {
            let delay = self.backoff.delay(record.attempts, job_id);
            record.state = JobState::Failed;
            record.available_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            debug!(
                target: "hasivu::queue",
                queue = %record.queue,
                job = %job_id,
                attempts = record.attempts,
                delay_ms = delay.as_millis() as u64,
                "job failed; scheduled retry"
            );
            state.place(job_id);
        } else {
            record.state = JobState::DeadLetter;
            warn!(
                target: "hasivu::queue",
                queue = %record.queue,
                job = %job_id,
                attempts = record.attempts,
                retryable,
                error = record.last_error.as_deref().unwrap_or("unknown"),
                "job moved to dead-letter queue"
            );
            state.release_dedupe(job_id);
        }
        Ok(())
    }

    async fn dead_letter(&self, lease_id: LeaseId, error: Option<String>) -> Result<()> {
        let mut state = self.state.lock();
        let (_, job_id) = state.take_lease(lease_id)?;
        let record = state.job_mut(job_id)?;
        record.attempts = record.attempts.saturating_add(1);
        record.last_error = error;
        record.state = JobState::DeadLetter;
        record.updated_at = Utc::now();
        warn!(
            target: "hasivu::queue",
            queue = %record.queue,
            job = %job_id,
            error = record.last_error.as_deref().unwrap_or("unknown"),
            "job dead-lettered"
        );
        state.release_dedupe(job_id);
        Ok(())
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            let (job_state, lease) = state
                .jobs
                .get(&job_id)
                .map(|stored| (stored.record.state, stored.lease))
                .ok_or_else(|| CoreError::NotFound(format!("job {job_id} not found")))?;

            if let Some(lease_id) = lease {
                state.leases.remove(&lease_id);
            }
            state.unplace(job_id);
            state.release_dedupe(job_id);
            let Some(stored) = state.jobs.remove(&job_id) else {
                return Err(CoreError::NotFound(format!("job {job_id} not found")));
            };
            info!(target: "hasivu::queue", job = %job_id, state = ?job_state, "job cancelled");
            JobEvent::from_job(
                &stored.record,
                JobEventPayload::Cancelled {
                    job_id,
                    queue: stored.record.queue.clone(),
                    priority: stored.record.priority,
                    previous: job_state,
                },
            )
        };
        self.publish(vec![event]).await;
        Ok(())
    }

    async fn queue_depth(&self, queue: &QueueName) -> Result<usize> {
        let state = self.state.lock();
        Ok(state
            .lanes
            .get(queue)
            .map(|lane| lane.ready.len() + lane.waiting.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl LeaseExpiryScanner for InMemoryQueue {
    async fn scan_expired_leases(&self) -> Result<u64> {
        let (resurrected, events) = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let expired: Vec<LeaseId> = state
                .leases
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(lease_id, _)| *lease_id)
                .collect();

            let mut resurrected = 0u64;
            let mut events = Vec::with_capacity(expired.len());
            for lease_id in expired {
                let (_, job_id) = state.take_lease(lease_id)?;
                let record = state.job_mut(job_id)?;
                record.attempts = record.attempts.saturating_add(1);
                record.updated_at = now;

                let revived = record.attempts < record.max_attempts;
                if revived {
                    let delay = self.backoff.delay(record.attempts, job_id);
                    record.state = JobState::Failed;
                    record.last_error = Some("lease expired".to_string());
                    record.available_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    resurrected += 1;
                } else {
                    record.state = JobState::DeadLetter;
                    record.last_error = Some("lease expired (max attempts)".to_string());
                }

                let record = record.clone();
                if revived {
                    state.place(job_id);
                } else {
                    state.release_dedupe(job_id);
                }
                warn!(
                    target: "hasivu::queue",
                    queue = %record.queue,
                    job = %job_id,
                    lease = %lease_id,
                    attempts = record.attempts,
                    resurrected = revived,
                    "lease expired"
                );
                events.push(JobEvent::from_job(
                    &record,
                    JobEventPayload::LeaseExpired {
                        job_id,
                        queue: record.queue.clone(),
                        priority: record.priority,
                        lease_id,
                        resurrected: revived,
                    },
                ));
            }
            (resurrected, events)
        };

        self.publish(events).await;
        Ok(resurrected)
    }
}

#[async_trait]
impl QueueInstrumentation for InMemoryQueue {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let state = self.state.lock();
        let now = Utc::now();
        let mut snapshot = QueueSnapshot::new(now);

        for (queue, lane) in &state.lanes {
            let entry = snapshot.entry_mut(queue.clone());
            entry.completed = lane.completed;
            entry.dequeue_per_minute = lane.dequeues_last_minute(now) as f64;
        }

        for stored in state.jobs.values() {
            let entry = snapshot.entry_mut(stored.record.queue.clone());
            match stored.record.state {
                JobState::Ready => entry.ready += 1,
                JobState::Deferred => entry.deferred += 1,
                JobState::Leased => entry.leased += 1,
                JobState::Failed => entry.failed += 1,
                JobState::DeadLetter => entry.dead_letter += 1,
                JobState::Completed | JobState::Cancelled => {}
            }
        }

        Ok(snapshot)
    }

    async fn ready_counts(&self, queue: &QueueName) -> Result<Vec<ReadyCountEntry>> {
        let mut state = self.state.lock();
        state.promote_due(queue, Utc::now());
        let Some(lane) = state.lanes.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(lane
            .ready_counts
            .iter()
            .map(|((school_id, priority), count)| ReadyCountEntry {
                school_id: *school_id,
                priority: *priority,
                count: *count,
            })
            .collect())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryQueue {
    async fn dead_letters(&self, queue: &QueueName) -> Result<Vec<JobRecord>> {
        let state = self.state.lock();
        let mut records: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|stored| {
                &stored.record.queue == queue && stored.record.state == JobState::DeadLetter
            })
            .map(|stored| stored.record.clone())
            .collect();
        records.sort_by_key(|record| record.updated_at);
        Ok(records)
    }

    async fn replay_dead_letter(&self, job_id: JobId) -> Result<JobHandle> {
        let (handle, event) = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let record = state.job_mut(job_id)?;
            if record.state != JobState::DeadLetter {
                return Err(CoreError::Conflict(format!(
                    "job {job_id} is {:?}, not dead-lettered",
                    record.state
                )));
            }
            if let Some(key) = record.dedupe_key.clone() {
                let queue = record.queue.clone();
                if let Some(active) = state.active_duplicate(&queue, &key) {
                    return Err(CoreError::Conflict(format!(
                        "job {active} with dedupe key '{key}' is already active in {queue}"
                    )));
                }
            }
            let record = state.job_mut(job_id)?;
            record.state = JobState::Ready;
            record.attempts = 0;
            record.last_error = None;
            record.available_at = now;
            record.updated_at = now;
            let record = record.clone();

            if let Some(key) = &record.dedupe_key {
                state
                    .dedupe
                    .insert((record.queue.clone(), key.clone()), job_id);
            }
            state.place(job_id);
            info!(target: "hasivu::queue", queue = %record.queue, job = %job_id, "dead letter replayed");

            let event = JobEvent::from_job(
                &record,
                JobEventPayload::Replayed {
                    job_id,
                    queue: record.queue.clone(),
                    priority: record.priority,
                },
            );
            (JobHandle::accepted(&record), event)
        };

        self.publish(vec![event]).await;
        Ok(handle)
    }

    async fn purge_dead_letters(&self, queue: &QueueName) -> Result<usize> {
        let events: Vec<JobEvent> = {
            let mut state = self.state.lock();
            let doomed: Vec<JobId> = state
                .jobs
                .values()
                .filter(|stored| {
                    &stored.record.queue == queue && stored.record.state == JobState::DeadLetter
                })
                .map(|stored| stored.record.id)
                .collect();
            doomed
                .into_iter()
                .filter_map(|job_id| state.jobs.remove(&job_id))
                .map(|stored| {
                    JobEvent::from_job(
                        &stored.record,
                        JobEventPayload::Purged {
                            job_id: stored.record.id,
                            queue: stored.record.queue.clone(),
                        },
                    )
                })
                .collect()
        };
        let purged = events.len();
        if purged > 0 {
            info!(target: "hasivu::queue", queue = %queue, purged, "dead letters purged");
        }
        self.publish(events).await;
        Ok(purged)
    }
}
