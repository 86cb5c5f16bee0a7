use std::{fmt, sync::Arc};

use anyhow::Context;
use tracing::{info, warn};

use hasivu_core::{
    events::{JobEventPublisher, LifecycleEventPublisher, PipelineEventPublisher},
    integration::{
        HttpServiceComponent, IntegrationOrchestrator, PipelineComponent, QueueComponent,
        StartReport,
    },
    monitoring::{AnomalyDetector, PerformanceAnalytics},
    pipeline::{
        CheckpointStore, ConnectorFactory, DataFlowOrchestrator, FileCheckpointStore,
        InMemoryCheckpointStore, MemoryDatasets,
    },
    queue::{InMemoryQueue, QueueService, QueueWorkerPool},
    resilience::CircuitBreakerRegistry,
    runtime::InProcEventBus,
};

use crate::infra::{config::Config, webhook::WebhookJobHandler};

pub const QUEUE_COMPONENT: &str = "queue";
pub const PIPELINE_COMPONENT: &str = "pipelines";

pub type WorkerPool = QueueWorkerPool<InMemoryQueue, InProcEventBus>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub events: Arc<InProcEventBus>,
    pub queue: Arc<InMemoryQueue>,
    pub workers: Arc<WorkerPool>,
    pub pipelines: Arc<DataFlowOrchestrator>,
    pub integration: Arc<IntegrationOrchestrator>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub detector: Arc<AnomalyDetector>,
    pub analytics: Arc<PerformanceAnalytics>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires every subsystem together without starting background tasks.
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let orchestrator = &config.orchestrator;
        let events = Arc::new(InProcEventBus::new(orchestrator.event_capacity()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            orchestrator.integration.circuit_breaker.clone(),
        ));

        let queue = Arc::new(
            InMemoryQueue::new(orchestrator.retry)
                .with_max_delay(orchestrator.queue.max_delay())
                .with_events(Arc::clone(&events) as Arc<dyn JobEventPublisher>),
        );
        let workers = Arc::new(QueueWorkerPool::new(
            orchestrator,
            Arc::clone(&queue),
            Arc::clone(&events),
        ));

        let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir.clone())),
            None => {
                warn!("checkpoint_dir not set; pipeline checkpoints are kept in memory only");
                Arc::new(InMemoryCheckpointStore::new())
            }
        };
        let connectors = ConnectorFactory::new(MemoryDatasets::new())
            .with_queue(Arc::clone(&queue) as Arc<dyn QueueService>);
        let pipelines = Arc::new(
            DataFlowOrchestrator::new(orchestrator.pipeline, connectors, checkpoints)
                .with_events(Arc::clone(&events) as Arc<dyn PipelineEventPublisher>),
        );
        for definition in &config.pipelines {
            pipelines
                .register(definition.clone())
                .with_context(|| format!("failed to register pipeline {}", definition.id))?;
        }

        let integration = Arc::new(
            IntegrationOrchestrator::new(orchestrator.integration.clone(), Arc::clone(&breakers))
                .with_events(Arc::clone(&events) as Arc<dyn LifecycleEventPublisher>),
        );
        integration.register(
            Arc::new(QueueComponent::new(QUEUE_COMPONENT, Arc::clone(&queue))),
            Vec::<String>::new(),
        )?;
        integration.register(
            Arc::new(PipelineComponent::new(
                PIPELINE_COMPONENT,
                Arc::clone(&pipelines),
            )),
            [QUEUE_COMPONENT],
        )?;
        for spec in &config.integrations {
            let mut component = HttpServiceComponent::new(spec.name.clone(), spec.base_url.clone())?;
            if let Some(path) = &spec.health_path {
                component = component.with_health_path(path.clone());
            }
            if let Some(path) = &spec.sync_path {
                component = component.with_sync_path(path.clone());
            }
            if let Some(threshold) = spec.slow_threshold {
                component = component.with_slow_threshold(threshold);
            }
            integration.register(Arc::new(component), spec.depends_on.clone())?;
        }
        // Unknown dependencies and cycles fail here.
        integration.start_order()?;

        Ok(Self {
            detector: Arc::new(AnomalyDetector::new(orchestrator.monitoring.clone())),
            analytics: Arc::new(PerformanceAnalytics::default()),
            config: Arc::new(config),
            events,
            queue,
            workers,
            pipelines,
            integration,
            breakers,
        })
    }

    /// Spawns configured workers, connects components and starts monitoring.
    pub async fn start(&self) -> anyhow::Result<StartReport> {
        for spec in &self.config.workers {
            let breaker = self.breakers.get_or_create(&format!("webhook.{}", spec.queue));
            let handler = WebhookJobHandler::new(spec.webhook.clone(), spec.timeout, breaker)?;
            self.workers
                .spawn_queue(spec.queue.clone(), Arc::new(handler), spec.parallelism)
                .await
                .with_context(|| format!("failed to start workers for {}", spec.queue))?;
            info!(queue = %spec.queue, webhook = %spec.webhook, "queue workers started");
        }
        self.workers.spawn_housekeeper().await;

        let report = self.integration.start_all().await?;
        for failure in &report.failed {
            warn!(component = %failure.name, error = %failure.error, "component failed to start");
        }
        self.integration.spawn_health_monitor().await;
        Ok(report)
    }

    /// Stops monitoring and schedulers first, then drains runs and workers.
    pub async fn shutdown(&self) {
        let grace = self.config.server.shutdown_timeout;
        let drain = async {
            self.integration.shutdown().await;
            self.pipelines.shutdown().await;
            self.workers.shutdown().await;
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "shutdown did not finish within grace period");
        }
    }
}
