use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Result,
    integration::{HealthStatus, LifecycleState},
    pipeline::{Phase, RunStatus},
    queue::{JobId, JobPriority, JobRecord, JobState, QueueName},
    types::{LeaseId, PipelineId, RunId, SchoolId},
};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub school_id: SchoolId,
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        correlation_id: Option<Uuid>,
        school_id: SchoolId,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            school_id,
            emitted_at: Utc::now(),
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventPayload {
    Enqueued {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
    },
    Merged {
        existing_job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
    },
    Dequeued {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
        lease_id: LeaseId,
    },
    LeaseRenewed {
        job_id: JobId,
        lease_id: LeaseId,
        renewals: u32,
    },
    LeaseExpired {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
        lease_id: LeaseId,
        /// False when the expiry exhausted the attempts and the job was dead-lettered.
        resurrected: bool,
    },
    Completed {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
    },
    Failed {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
        retryable: bool,
    },
    DeadLettered {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
    },
    Replayed {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
    },
    Cancelled {
        job_id: JobId,
        queue: QueueName,
        priority: JobPriority,
        previous: JobState,
    },
    Purged {
        job_id: JobId,
        queue: QueueName,
    },
}

/// Fully qualified job event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn from_job(job: &JobRecord, payload: JobEventPayload) -> Self {
        let meta = EventMeta::new(
            Some(job.correlation_id),
            job.school_id,
            job.idempotency_key(),
        );
        Self { meta, payload }
    }

    pub fn queue(&self) -> Option<&QueueName> {
        match &self.payload {
            JobEventPayload::Enqueued { queue, .. }
            | JobEventPayload::Merged { queue, .. }
            | JobEventPayload::Dequeued { queue, .. }
            | JobEventPayload::LeaseExpired { queue, .. }
            | JobEventPayload::Completed { queue, .. }
            | JobEventPayload::Failed { queue, .. }
            | JobEventPayload::DeadLettered { queue, .. }
            | JobEventPayload::Replayed { queue, .. }
            | JobEventPayload::Cancelled { queue, .. }
            | JobEventPayload::Purged { queue, .. } => Some(queue),
            JobEventPayload::LeaseRenewed { .. } => None,
        }
    }
}

/// Progress notifications from the data-flow orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        pipeline_id: PipelineId,
        run_id: RunId,
        resumed: bool,
    },
    BatchLoaded {
        pipeline_id: PipelineId,
        run_id: RunId,
        batch: u64,
        loaded: usize,
        rejected: usize,
    },
    CheckpointSaved {
        pipeline_id: PipelineId,
        run_id: RunId,
        batches_completed: u64,
    },
    PhaseRetry {
        pipeline_id: PipelineId,
        run_id: RunId,
        phase: Phase,
        attempt: u16,
        delay_ms: u64,
        error: String,
    },
    RunFinished {
        pipeline_id: PipelineId,
        run_id: RunId,
        status: RunStatus,
    },
}

/// Component lifecycle and health transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        component: String,
        from: LifecycleState,
        to: LifecycleState,
        at: DateTime<Utc>,
    },
    HealthChanged {
        component: String,
        from: HealthStatus,
        to: HealthStatus,
        at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    async fn publish(&self, event: JobEvent) -> Result<()>;
}

#[async_trait]
pub trait PipelineEventPublisher: Send + Sync {
    async fn publish_pipeline_event(&self, event: PipelineEvent) -> Result<()>;
}

#[async_trait]
pub trait LifecycleEventPublisher: Send + Sync {
    async fn publish_lifecycle_event(&self, event: LifecycleEvent) -> Result<()>;
}
