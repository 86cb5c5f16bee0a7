use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::pipeline::{DataFlowOrchestrator, RunStatus};
use crate::queue::{LeaseExpiryScanner, QueueInstrumentation, QueueService};

use super::component::{ComponentHealth, ComponentKind, IntegrationComponent, SyncReport};

/// Exposes a queue backend as a managed component. Syncing sweeps expired
/// leases back to ready.
pub struct QueueComponent<Q> {
    name: String,
    queue: Arc<Q>,
    dead_letter_threshold: usize,
    backlog_threshold: usize,
}

impl<Q> fmt::Debug for QueueComponent<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueComponent")
            .field("name", &self.name)
            .field("dead_letter_threshold", &self.dead_letter_threshold)
            .field("backlog_threshold", &self.backlog_threshold)
            .finish_non_exhaustive()
    }
}

impl<Q> QueueComponent<Q>
where
    Q: QueueService + QueueInstrumentation + LeaseExpiryScanner + 'static,
{
    pub fn new(name: impl Into<String>, queue: Arc<Q>) -> Self {
        Self {
            name: name.into(),
            queue,
            dead_letter_threshold: 100,
            backlog_threshold: 10_000,
        }
    }

    pub fn with_thresholds(mut self, dead_letters: usize, backlog: usize) -> Self {
        self.dead_letter_threshold = dead_letters;
        self.backlog_threshold = backlog;
        self
    }
}

#[async_trait]
impl<Q> IntegrationComponent for QueueComponent<Q>
where
    Q: QueueService + QueueInstrumentation + LeaseExpiryScanner + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Queue
    }

    async fn connect(&self) -> Result<()> {
        let snapshot = self.queue.queue_snapshot().await?;
        debug!(target: "hasivu::integration", component = %self.name, queues = snapshot.queues.len(), "queue reachable");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<SyncReport> {
        let recovered = self.queue.scan_expired_leases().await?;
        if recovered > 0 {
            info!(target: "hasivu::integration", component = %self.name, recovered, "expired leases returned to ready");
        }
        Ok(SyncReport::new(recovered).with_message(format!("{recovered} expired leases recovered")))
    }

    async fn health(&self) -> ComponentHealth {
        let started = Instant::now();
        let snapshot = match self.queue.queue_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => return ComponentHealth::unhealthy(err.to_string()),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let dead_letters = snapshot.total_dead_letters();
        let backlog: usize = snapshot.queues.values().map(|entry| entry.depth()).sum();
        let health = if dead_letters >= self.dead_letter_threshold {
            ComponentHealth::degraded(format!("{dead_letters} dead-lettered jobs"))
        } else if backlog >= self.backlog_threshold {
            ComponentHealth::degraded(format!("backlog of {backlog} jobs"))
        } else {
            ComponentHealth::healthy()
        };
        health.with_latency(latency_ms)
    }
}

/// Wraps the data-flow orchestrator. Connecting starts its cron scheduler
/// and syncing runs every enabled pipeline once.
#[derive(Debug)]
pub struct PipelineComponent {
    name: String,
    orchestrator: Arc<DataFlowOrchestrator>,
}

impl PipelineComponent {
    pub fn new(name: impl Into<String>, orchestrator: Arc<DataFlowOrchestrator>) -> Self {
        Self {
            name: name.into(),
            orchestrator,
        }
    }
}

#[async_trait]
impl IntegrationComponent for PipelineComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Pipeline
    }

    async fn connect(&self) -> Result<()> {
        if self.orchestrator.is_shutting_down() {
            return Err(CoreError::Unavailable("pipeline orchestrator is shut down".into()));
        }
        self.orchestrator.start().await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.orchestrator.stop_scheduler().await;
        Ok(())
    }

    async fn sync(&self) -> Result<SyncReport> {
        let mut loaded = 0u64;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;

        for summary in self.orchestrator.list() {
            if !summary.definition.enabled {
                continue;
            }
            match self.orchestrator.run(&summary.definition.id).await {
                Ok(run) if run.status == RunStatus::Succeeded => {
                    succeeded += 1;
                    loaded += run.metrics.loaded;
                }
                Ok(_) => failed += 1,
                Err(CoreError::Conflict(_)) => skipped += 1,
                Err(err) => return Err(err),
            }
        }

        Ok(SyncReport::new(loaded).with_message(format!(
            "{succeeded} succeeded, {failed} failed, {skipped} already running"
        )))
    }

    async fn health(&self) -> ComponentHealth {
        if self.orchestrator.is_shutting_down() {
            return ComponentHealth::unhealthy("pipeline orchestrator is shut down");
        }
        if !self.orchestrator.scheduler_running().await {
            return ComponentHealth::degraded("pipeline scheduler is not running");
        }
        let failing: Vec<String> = self
            .orchestrator
            .list()
            .into_iter()
            .filter(|summary| summary.last_status == Some(RunStatus::Failed))
            .map(|summary| summary.definition.id.to_string())
            .collect();
        if failing.is_empty() {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::degraded(format!("last run failed for: {}", failing.join(", ")))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    items_processed: u64,
    #[serde(default)]
    message: Option<String>,
}

/// An external HTTP service probed through a health endpoint.
#[derive(Debug, Clone)]
pub struct HttpServiceComponent {
    name: String,
    client: reqwest::Client,
    base_url: String,
    health_path: String,
    sync_path: Option<String>,
    slow_threshold: Duration,
}

impl HttpServiceComponent {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| CoreError::Internal(format!("http client: {err}")))?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: "/health".to_string(),
            sync_path: None,
            slow_threshold: Duration::from_secs(2),
        })
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Endpoint that is POSTed on sync.
    pub fn with_sync_path(mut self, path: impl Into<String>) -> Self {
        self.sync_path = Some(path.into());
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    async fn probe(&self) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(self.url(&self.health_path))
            .send()
            .await
            .map_err(|err| map_http_error(&self.name, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Unavailable(format!(
                "{} health endpoint returned {status}",
                self.name
            )));
        }
        Ok(started.elapsed())
    }
}

fn map_http_error(name: &str, err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::Timeout(format!("{name}: {err}"))
    } else {
        CoreError::Unavailable(format!("{name}: {err}"))
    }
}

#[async_trait]
impl IntegrationComponent for HttpServiceComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::HttpService
    }

    async fn connect(&self) -> Result<()> {
        self.probe().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<SyncReport> {
        let Some(path) = &self.sync_path else {
            return Ok(SyncReport::new(0).with_message("no sync endpoint configured"));
        };
        let response = self
            .client
            .post(self.url(path))
            .send()
            .await
            .map_err(|err| map_http_error(&self.name, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Unavailable(format!(
                "{} sync endpoint returned {status}",
                self.name
            )));
        }
        let body: SyncResponse = response.json().await.unwrap_or_default();
        let mut report = SyncReport::new(body.items_processed);
        report.message = body.message;
        Ok(report)
    }

    async fn health(&self) -> ComponentHealth {
        match self.probe().await {
            Ok(elapsed) => {
                let latency_ms = elapsed.as_millis() as u64;
                let health = if elapsed >= self.slow_threshold {
                    ComponentHealth::degraded(format!("responded in {latency_ms}ms"))
                } else {
                    ComponentHealth::healthy()
                };
                health.with_latency(latency_ms)
            }
            Err(err) => ComponentHealth::unhealthy(err.to_string()),
        }
    }
}
