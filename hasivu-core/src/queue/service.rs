use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Result, types::LeaseId};

use super::{
    job::{EnqueueRequest, JobHandle, JobId, JobRecord, QueueName},
    lease::{DequeueRequest, JobLease, LeaseRenewal},
    scheduler::ReadyCountEntry,
};

/// Abstracts the queue backend consumed by worker pools and pipelines.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>>;

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease>;

    async fn complete(&self, lease_id: LeaseId) -> Result<()>;

    async fn fail(&self, lease_id: LeaseId, retryable: bool, error: Option<String>)
    -> Result<()>;

    async fn dead_letter(&self, lease_id: LeaseId, error: Option<String>) -> Result<()>;

    async fn cancel_job(&self, job_id: JobId) -> Result<()>;

    /// Jobs waiting to run (ready, delayed or backing off).
    async fn queue_depth(&self, queue: &QueueName) -> Result<usize>;

    /// Enqueue multiple jobs. Default implementation issues jobs one-by-one.
    async fn enqueue_many(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<JobHandle>> {
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            out.push(self.enqueue(req).await?);
        }
        Ok(out)
    }
}

/// Scans and resurrects expired leases.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Returns number of jobs transitioned back to the queue.
    async fn scan_expired_leases(&self) -> Result<u64>;
}

/// Observability hooks for queue implementations.
#[async_trait]
pub trait QueueInstrumentation: Send + Sync {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot>;

    /// Leasable jobs per (school, priority) right now. Due delayed and
    /// backing-off jobs are promoted first.
    async fn ready_counts(&self, queue: &QueueName) -> Result<Vec<ReadyCountEntry>>;
}

/// Inspection and recovery of dead-lettered jobs.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn dead_letters(&self, queue: &QueueName) -> Result<Vec<JobRecord>>;

    /// Moves a dead-lettered job back to ready with a fresh attempt budget.
    async fn replay_dead_letter(&self, job_id: JobId) -> Result<JobHandle>;

    /// Drops every dead-lettered job of a queue; returns how many were removed.
    async fn purge_dead_letters(&self, queue: &QueueName) -> Result<usize>;
}

/// Aggregated metrics for all queues at a specific instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: BTreeMap<QueueName, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: BTreeMap::new(),
        }
    }

    pub fn entry_mut(&mut self, queue: QueueName) -> &mut QueueSnapshotEntry {
        self.queues.entry(queue).or_default()
    }

    pub fn total_dead_letters(&self) -> usize {
        self.queues.values().map(|entry| entry.dead_letter).sum()
    }
}

/// Per-queue counters plus instantaneous throughput measurements.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub ready: usize,
    pub leased: usize,
    pub deferred: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub completed: u64,
    #[serde(default)]
    pub dequeue_per_minute: f64,
}

impl QueueSnapshotEntry {
    pub fn depth(&self) -> usize {
        self.ready + self.deferred + self.failed
    }
}
