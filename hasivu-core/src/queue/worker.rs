use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{LeaseConfig, OrchestratorConfig, PriorityWeights, QueueConfig},
    error::{CoreError, Result},
    events::{JobEvent, JobEventPayload, JobEventPublisher},
    types::SchoolId,
};

use super::{
    job::QueueName,
    lease::{DequeueRequest, JobLease, LeaseRenewal},
    scheduler::{SchoolLoad, WeightedFairScheduler},
    service::{LeaseExpiryScanner, QueueInstrumentation, QueueService},
};

/// What a handler decided about one leased job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    /// Transient failure; retried with backoff until attempts run out.
    Retry(String),
    Fatal(String),
}

/// Executes leased jobs for one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, lease: &JobLease) -> JobOutcome;
}

/// Spawns worker tasks per named queue, keeps their leases alive while a
/// handler runs and reports outcomes back to the queue.
pub struct QueueWorkerPool<Q, E> {
    queue_config: QueueConfig,
    lease_config: LeaseConfig,
    priority_weights: PriorityWeights,
    queue: Arc<Q>,
    events: Arc<E>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    schedulers: Mutex<HashMap<QueueName, WeightedFairScheduler>>,
}

impl<Q, E> fmt::Debug for QueueWorkerPool<Q, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("QueueWorkerPool");
        debug
            .field("lease_config", &self.lease_config)
            .field("shutdown", &self.shutdown.is_cancelled());
        match self.handles.try_lock() {
            Ok(handles) => {
                debug.field("task_count", &handles.len());
            }
            Err(_) => {
                debug.field("handles", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl<Q, E> QueueWorkerPool<Q, E>
where
    Q: QueueService + QueueInstrumentation + LeaseExpiryScanner + 'static,
    E: JobEventPublisher + 'static,
{
    pub fn new(config: &OrchestratorConfig, queue: Arc<Q>, events: Arc<E>) -> Self {
        Self {
            queue_config: config.queue.clone(),
            lease_config: config.lease,
            priority_weights: config.priority_weights,
            queue,
            events,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn running_queues(&self) -> Vec<QueueName> {
        let schedulers = self.schedulers.lock().await;
        let mut names: Vec<QueueName> = schedulers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Leased and reserved work per school, for every queue with workers.
    pub async fn school_load(&self) -> BTreeMap<QueueName, HashMap<SchoolId, SchoolLoad>> {
        self.schedulers
            .lock()
            .await
            .iter()
            .map(|(queue, scheduler)| (queue.clone(), scheduler.load()))
            .collect()
    }

    /// Starts `parallelism` workers (config default when `None`) for `queue`.
    pub async fn spawn_queue(
        &self,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
        parallelism: Option<usize>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Cancelled("worker pool is shut down".into()));
        }

        let scheduler = {
            let mut schedulers = self.schedulers.lock().await;
            if schedulers.contains_key(&queue) {
                return Err(CoreError::Conflict(format!(
                    "workers already running for queue {queue}"
                )));
            }
            let scheduler = WeightedFairScheduler::new(&self.queue_config, self.priority_weights);
            schedulers.insert(queue.clone(), scheduler.clone());
            scheduler
        };

        let parallelism = parallelism
            .unwrap_or(self.queue_config.default_workers)
            .max(1);

        let mut handles = self.handles.lock().await;
        for index in 0..parallelism {
            let worker = Worker {
                id: format!("{}-{}-w{}", queue, std::process::id(), index),
                queue_name: queue.clone(),
                queue: Arc::clone(&self.queue),
                events: Arc::clone(&self.events),
                handler: Arc::clone(&handler),
                scheduler: scheduler.clone(),
                lease: self.lease_config,
                idle_poll: self.queue_config.idle_poll(),
                shutdown: self.shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        info!(
            target: "hasivu::queue",
            queue = %queue,
            workers = parallelism,
            "worker pool started"
        );
        Ok(())
    }

    /// Periodically resurrects jobs whose workers stopped renewing.
    pub async fn spawn_housekeeper(&self) {
        let queue = Arc::clone(&self.queue);
        let interval = Duration::from_millis(self.lease_config.housekeeper_interval_ms.max(10));
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "hasivu::queue", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match queue.scan_expired_leases().await {
                            Ok(0) => {}
                            Ok(count) => info!(target: "hasivu::queue", count, "expired leases resurrected"),
                            Err(err) => warn!(target: "hasivu::queue", error = %err, "expired lease scan failed"),
                        }
                    }
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    pub async fn shutdown(&self) {
        info!(target: "hasivu::queue", "stopping worker pool");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "hasivu::queue", error = %err, "worker task failed"),
                Err(_) => warn!(target: "hasivu::queue", "worker task timed out during shutdown"),
            }
        }
    }
}

struct Worker<Q, E> {
    id: String,
    queue_name: QueueName,
    queue: Arc<Q>,
    events: Arc<E>,
    handler: Arc<dyn JobHandler>,
    scheduler: WeightedFairScheduler,
    lease: LeaseConfig,
    idle_poll: Duration,
    shutdown: CancellationToken,
}

impl<Q, E> Worker<Q, E>
where
    Q: QueueService + QueueInstrumentation + 'static,
    E: JobEventPublisher + 'static,
{
    async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!(target: "hasivu::queue", worker = %self.id, "worker shutting down");
                break;
            }

            let ready = match self.queue.ready_counts(&self.queue_name).await {
                Ok(ready) => ready,
                Err(err) => {
                    error!(target: "hasivu::queue", worker = %self.id, error = %err, "ready count lookup failed");
                    self.idle().await;
                    continue;
                }
            };
            let Some(reservation) = self.scheduler.reserve(&ready) else {
                self.idle().await;
                continue;
            };

            let request =
                DequeueRequest::any(self.queue_name.clone(), self.id.clone(), self.lease.ttl())
                    .reserved(&reservation);

            match self.queue.dequeue(request).await {
                Ok(Some(lease)) => {
                    self.scheduler.confirm(reservation.id);
                    trace!(
                        target: "hasivu::queue",
                        worker = %self.id,
                        school = %reservation.school_id,
                        priority = ?reservation.priority,
                        job = %lease.job.id,
                        "scheduler reservation confirmed"
                    );
                    self.process(lease).await;
                }
                Ok(None) => {
                    self.scheduler.cancel(reservation.id);
                    self.idle().await;
                }
                Err(err) => {
                    self.scheduler.cancel(reservation.id);
                    error!(target: "hasivu::queue", worker = %self.id, error = %err, "dequeue failed");
                    self.idle().await;
                }
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.idle_poll) => {}
        }
    }

    async fn process(&self, lease: JobLease) {
        let job = &lease.job;
        self.emit(JobEvent::from_job(
            job,
            JobEventPayload::Dequeued {
                job_id: job.id,
                queue: job.queue.clone(),
                priority: job.priority,
                lease_id: lease.lease_id,
            },
        ))
        .await;

        let renewal_stop = CancellationToken::new();
        let renewer = self.spawn_renewer(&lease, renewal_stop.clone());
        let outcome = self.handler.handle(&lease).await;
        renewal_stop.cancel();
        let _ = renewer.await;

        let (result, payload) = match &outcome {
            JobOutcome::Success => (
                self.queue.complete(lease.lease_id).await,
                JobEventPayload::Completed {
                    job_id: job.id,
                    queue: job.queue.clone(),
                    priority: job.priority,
                },
            ),
            JobOutcome::Retry(message) => (
                self.queue
                    .fail(lease.lease_id, true, Some(message.clone()))
                    .await,
                JobEventPayload::Failed {
                    job_id: job.id,
                    queue: job.queue.clone(),
                    priority: job.priority,
                    retryable: true,
                },
            ),
            JobOutcome::Fatal(message) => (
                self.queue
                    .dead_letter(lease.lease_id, Some(message.clone()))
                    .await,
                JobEventPayload::DeadLettered {
                    job_id: job.id,
                    queue: job.queue.clone(),
                    priority: job.priority,
                },
            ),
        };

        self.scheduler.release(job.school_id);

        match result {
            Ok(()) => {
                self.emit(JobEvent::from_job(job, payload)).await;
            }
            // The housekeeper reclaimed the lease while the handler ran.
            Err(CoreError::NotFound(_)) => {
                warn!(
                    target: "hasivu::queue",
                    worker = %self.id,
                    job = %job.id,
                    "lease lost before outcome could be recorded"
                );
            }
            Err(err) => {
                error!(
                    target: "hasivu::queue",
                    worker = %self.id,
                    job = %job.id,
                    error = %err,
                    "failed to record job outcome"
                );
            }
        }
    }

    fn spawn_renewer(&self, lease: &JobLease, stop: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let events = Arc::clone(&self.events);
        let worker_id = self.id.clone();
        let lease_id = lease.lease_id;
        let ttl = self.lease.ttl();
        let renew_margin = Duration::from_millis(self.lease.renew_min_margin_ms);
        let renew_fraction = self.lease.renew_at_fraction.clamp(0.05, 0.95);
        let mut current = lease.clone();

        tokio::spawn(async move {
            loop {
                let now = chrono::Utc::now();
                let mut sleep_for = Duration::from_millis(500);
                if !current.is_expired(now) {
                    let ttl_total = ttl.to_std().unwrap_or(Duration::from_secs(30));
                    let target = ttl_total.mul_f32(1.0 - renew_fraction);
                    let remaining = current.remaining(now).to_std().unwrap_or(Duration::ZERO);
                    sleep_for = if remaining > target {
                        remaining - target
                    } else if remaining > renew_margin {
                        remaining - renew_margin
                    } else {
                        Duration::ZERO
                    };
                }

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = stop.cancelled() => break,
                }

                let renewal = LeaseRenewal {
                    lease_id,
                    worker_id: worker_id.clone(),
                    extend_by: ttl,
                };
                match queue.renew(renewal).await {
                    Ok(updated) => {
                        let event = JobEvent::from_job(
                            &updated.job,
                            JobEventPayload::LeaseRenewed {
                                job_id: updated.job.id,
                                lease_id,
                                renewals: updated.renewals,
                            },
                        );
                        current = updated;
                        if let Err(err) = events.publish(event).await {
                            warn!(target: "hasivu::queue", error = %err, "publish renew event failed");
                        }
                    }
                    Err(CoreError::NotFound(_)) => {
                        trace!(target: "hasivu::queue", lease = %lease_id, "lease renew skipped (completed or released)");
                        break;
                    }
                    Err(err) => {
                        warn!(target: "hasivu::queue", lease = %lease_id, error = %err, "lease renew failed");
                        // Back off briefly; the housekeeper reclaims the lease if it really expired.
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                            _ = stop.cancelled() => break,
                        }
                    }
                }
            }
        })
    }

    async fn emit(&self, event: JobEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(target: "hasivu::queue", worker = %self.id, error = %err, "publish job event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        config::RetryConfig,
        queue::{EnqueueRequest, InMemoryQueue, JobId, JobPriority},
        runtime::{InProcEventBus, JobEventStream},
    };

    #[derive(Debug, Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        seen: parking_lot::Mutex<HashMap<JobId, usize>>,
        fail_first: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, lease: &JobLease) -> JobOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut seen = self.seen.lock();
            let count = seen.entry(lease.job.id).or_default();
            *count += 1;
            if self.fail_first && *count == 1 {
                JobOutcome::Retry("ETIMEDOUT".into())
            } else if lease.job.payload["fatal"] == json!(true) {
                JobOutcome::Fatal("malformed order".into())
            } else {
                JobOutcome::Success
            }
        }
    }

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.queue.idle_poll_ms = 5;
        config.retry = RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            jitter_ratio: 0.0,
            jitter_min_ms: 0,
        };
        config
    }

    async fn wait_for_completed(queue: &InMemoryQueue, name: &QueueName, expected: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = queue.queue_snapshot().await.unwrap();
            let completed = snapshot.queues.get(name).map(|e| e.completed).unwrap_or(0);
            if completed >= expected {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for jobs");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn workers_drain_queue_and_retry_transient_failures() {
        let config = config();
        let bus = Arc::new(InProcEventBus::new(256));
        let queue = Arc::new(InMemoryQueue::new(config.retry).with_events(bus.clone()));
        let name = QueueName::new("kitchen.orders").unwrap();

        for n in 0..3 {
            queue
                .enqueue(EnqueueRequest::new(name.clone(), json!({ "n": n })))
                .await
                .unwrap();
        }

        let handler = Arc::new(CountingHandler {
            fail_first: true,
            ..Default::default()
        });
        let pool = QueueWorkerPool::new(&config, queue.clone(), bus.clone());
        pool.spawn_queue(name.clone(), handler.clone(), Some(2))
            .await
            .unwrap();

        queue
            .enqueue(EnqueueRequest::new(name.clone(), json!({ "n": 3 })))
            .await
            .unwrap();

        wait_for_completed(&queue, &name, 4).await;
        pool.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
        assert_eq!(queue.queue_depth(&name).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fatal_outcomes_are_dead_lettered() {
        let config = config();
        let bus = Arc::new(InProcEventBus::new(256));
        let queue = Arc::new(InMemoryQueue::new(config.retry).with_events(bus.clone()));
        let name = QueueName::new("payments.reconcile").unwrap();
        let mut events = bus.subscribe_jobs();

        let pool = QueueWorkerPool::new(&config, queue.clone(), bus.clone());
        pool.spawn_queue(name.clone(), Arc::new(CountingHandler::default()), Some(1))
            .await
            .unwrap();
        assert!(matches!(
            pool.spawn_queue(name.clone(), Arc::new(CountingHandler::default()), None)
                .await,
            Err(CoreError::Conflict(_))
        ));

        queue
            .enqueue(EnqueueRequest::new(name.clone(), json!({ "fatal": true })))
            .await
            .unwrap();

        let dead = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(JobEvent {
                    payload: JobEventPayload::DeadLettered { job_id, .. },
                    ..
                }) = events.recv().await
                {
                    return job_id;
                }
            }
        })
        .await
        .unwrap();
        pool.shutdown().await;

        let record = queue.job(dead).unwrap();
        assert_eq!(record.last_error.as_deref(), Some("malformed order"));
    }

    #[tokio::test]
    async fn delayed_job_elevated_by_merge_is_still_served() {
        let config = config();
        let bus = Arc::new(InProcEventBus::new(256));
        let queue = Arc::new(InMemoryQueue::new(config.retry).with_events(bus.clone()));
        let name = QueueName::new("menu.sync").unwrap();
        let handler = Arc::new(CountingHandler::default());

        let pool = QueueWorkerPool::new(&config, queue.clone(), bus.clone());
        pool.spawn_queue(name.clone(), handler.clone(), Some(2))
            .await
            .unwrap();

        let original = queue
            .enqueue(
                EnqueueRequest::new(name.clone(), json!({ "menu": "week-42" }))
                    .with_priority(JobPriority::P3)
                    .with_dedupe_key("week-42")
                    .delayed(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let merged = queue
            .enqueue(
                EnqueueRequest::new(name.clone(), json!({ "menu": "week-42" }))
                    .with_priority(JobPriority::P0)
                    .with_dedupe_key("week-42"),
            )
            .await
            .unwrap();
        assert_eq!(merged.merged_into, Some(original.job_id));

        wait_for_completed(&queue, &name, 1).await;
        pool.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.ready_counts(&name).await.unwrap().is_empty());
        let load = pool.school_load().await;
        assert!(load[&name].values().all(|l| *l == SchoolLoad::default()));
    }
}
