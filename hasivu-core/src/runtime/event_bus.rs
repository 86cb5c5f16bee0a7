use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::{
    JobEvent, JobEventPublisher, LifecycleEvent, LifecycleEventPublisher, PipelineEvent,
    PipelineEventPublisher,
};

/// In-process fan-out of runtime notifications. Sends never fail: events
/// published without subscribers are dropped.
pub struct InProcEventBus {
    jobs: broadcast::Sender<JobEvent>,
    pipelines: broadcast::Sender<PipelineEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("job_subscribers", &self.jobs.receiver_count())
            .field("pipeline_subscribers", &self.pipelines.receiver_count())
            .field("lifecycle_subscribers", &self.lifecycle.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (jobs, _) = broadcast::channel(capacity);
        let (pipelines, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity);
        Self {
            jobs,
            pipelines,
            lifecycle,
            capacity,
        }
    }

    pub fn subscribe_pipelines(&self) -> broadcast::Receiver<PipelineEvent> {
        self.pipelines.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        let _ = self.jobs.send(event);
        Ok(())
    }
}

#[async_trait]
impl PipelineEventPublisher for InProcEventBus {
    async fn publish_pipeline_event(&self, event: PipelineEvent) -> Result<()> {
        let _ = self.pipelines.send(event);
        Ok(())
    }
}

#[async_trait]
impl LifecycleEventPublisher for InProcEventBus {
    async fn publish_lifecycle_event(&self, event: LifecycleEvent) -> Result<()> {
        let _ = self.lifecycle.send(event);
        Ok(())
    }
}

/// Lets generic runtimes subscribe to job events without naming the bus type.
pub trait JobEventStream {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

impl JobEventStream for InProcEventBus {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs.subscribe()
    }
}
