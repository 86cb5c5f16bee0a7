//! Priority job queue with leases, retry/backoff and a dead-letter store.
//!
//! [`InMemoryQueue`] implements the [`QueueService`] family of traits;
//! [`QueueWorkerPool`] drives [`JobHandler`]s against any implementation,
//! sharing work fairly across schools through a [`WeightedFairScheduler`].

pub mod backoff;
pub mod job;
pub mod lease;
pub mod memory;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use backoff::Backoff;
pub use job::{EnqueueRequest, JobHandle, JobId, JobPriority, JobRecord, JobState, QueueName};
pub use lease::{DequeueRequest, JobLease, LeaseRenewal, QueueSelector};
pub use memory::InMemoryQueue;
pub use scheduler::{ReadyCountEntry, SchedulingReservation, SchoolLoad, WeightedFairScheduler};
pub use service::{
    DeadLetterStore, LeaseExpiryScanner, QueueInstrumentation, QueueService, QueueSnapshot,
    QueueSnapshotEntry,
};
pub use worker::{JobHandler, JobOutcome, QueueWorkerPool};

pub use crate::types::LeaseId;
