use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::config::PipelineDefaults;
use crate::error::{CoreError, Result};
use crate::events::{PipelineEvent, PipelineEventPublisher};
use crate::queue::Backoff;
use crate::types::{PipelineId, RunId};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::connector::ConnectorFactory;
use super::error::{ErrorKind, PipelineError};
use super::model::{Cursor, Phase, PipelineDefinition, PipelineRun, RunStatus, RunTrigger};
use super::schedule::CronSchedule;
use super::transform::Transformer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Registered pipeline plus its scheduling state.
struct RegisteredPipeline {
    definition: PipelineDefinition,
    schedule: Option<CronSchedule>,
    /// Schedule evaluation resumes after this instant.
    last_checked: DateTime<Utc>,
}

struct ActiveRun {
    cancel: CancellationToken,
    snapshot: PipelineRun,
}

#[derive(Default)]
struct RunBook {
    active: HashMap<PipelineId, ActiveRun>,
    /// Newest first.
    history: HashMap<PipelineId, VecDeque<PipelineRun>>,
}

impl RunBook {
    /// Moves a run out of `active` (if it is still the active one) into history.
    fn retire(&mut self, run: PipelineRun, history_limit: usize) {
        if self
            .active
            .get(&run.pipeline_id)
            .is_some_and(|active| active.snapshot.run_id == run.run_id)
        {
            self.active.remove(&run.pipeline_id);
        }
        let history = self.history.entry(run.pipeline_id.clone()).or_default();
        history.push_front(run);
        history.truncate(history_limit.max(1));
    }
}

struct RunTicket {
    definition: PipelineDefinition,
    run: PipelineRun,
    cancel: CancellationToken,
}

/// Retires the run as cancelled if its future is dropped before settling,
/// e.g. when an inline caller times out or disconnects.
struct AbandonGuard<'a> {
    runs: &'a Mutex<RunBook>,
    pipeline_id: PipelineId,
    run_id: RunId,
    cancel: CancellationToken,
    history_limit: usize,
    armed: bool,
}

impl AbandonGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        let mut runs = self.runs.lock();
        let Some(mut run) = runs
            .active
            .get(&self.pipeline_id)
            .filter(|active| active.snapshot.run_id == self.run_id)
            .map(|active| active.snapshot.clone())
        else {
            return;
        };
        run.finish(RunStatus::Cancelled, None);
        runs.retire(run, self.history_limit);
        warn!(
            target: "hasivu::pipeline",
            pipeline = %self.pipeline_id,
            run = %self.run_id,
            "run abandoned by its caller; marked cancelled"
        );
    }
}

enum RunEnd {
    Completed,
    Cancelled,
    Failed(PipelineError),
}

struct RetryScope<'a> {
    pipeline_id: &'a PipelineId,
    run_id: RunId,
    batch: u64,
    backoff: &'a Backoff,
    cancel: &'a CancellationToken,
}

/// Listing entry returned by [`DataFlowOrchestrator::list`].
#[derive(Clone, Debug, Serialize)]
pub struct PipelineSummary {
    #[serde(flatten)]
    pub definition: PipelineDefinition,
    pub next_run_at: Option<DateTime<Utc>>,
    pub active_run: Option<RunId>,
    pub last_status: Option<RunStatus>,
}

/// Registers pipeline definitions and drives extract → transform → load runs
/// with per-phase retries, checkpoint/resume and cron triggers.
pub struct DataFlowOrchestrator {
    defaults: PipelineDefaults,
    connectors: ConnectorFactory,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Option<Arc<dyn PipelineEventPublisher>>,
    pipelines: RwLock<HashMap<PipelineId, RegisteredPipeline>>,
    runs: Mutex<RunBook>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    scheduler: tokio::sync::Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl fmt::Debug for DataFlowOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DataFlowOrchestrator");
        debug
            .field("defaults", &self.defaults)
            .field("connectors", &self.connectors)
            .field("available_permits", &self.permits.available_permits())
            .field("shutdown", &self.shutdown.is_cancelled());
        match self.pipelines.try_read() {
            Some(pipelines) => {
                debug.field("pipeline_count", &pipelines.len());
            }
            None => {
                debug.field("pipelines", &"<locked>");
            }
        }
        match self.runs.try_lock() {
            Some(runs) => {
                debug.field("active_runs", &runs.active.len());
            }
            None => {
                debug.field("runs", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl DataFlowOrchestrator {
    pub fn new(
        defaults: PipelineDefaults,
        connectors: ConnectorFactory,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(defaults.max_concurrent_runs.max(1))),
            defaults,
            connectors,
            checkpoints,
            events: None,
            pipelines: RwLock::new(HashMap::new()),
            runs: Mutex::new(RunBook::default()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn PipelineEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn connectors(&self) -> &ConnectorFactory {
        &self.connectors
    }

    pub fn register(&self, definition: PipelineDefinition) -> Result<()> {
        let schedule = definition.validate()?;
        self.connectors
            .validate(&definition.source, &definition.sink)?;

        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&definition.id) {
            return Err(CoreError::Conflict(format!(
                "pipeline '{}' is already registered",
                definition.id
            )));
        }
        info!(
            target: "hasivu::pipeline",
            pipeline = %definition.id,
            schedule = definition.schedule.as_deref().unwrap_or("-"),
            "pipeline registered"
        );
        pipelines.insert(
            definition.id.clone(),
            RegisteredPipeline {
                definition,
                schedule,
                last_checked: Utc::now(),
            },
        );
        Ok(())
    }

    /// Removes a pipeline, its history and its checkpoint. Refused while a
    /// run is active.
    pub async fn unregister(&self, id: &PipelineId) -> Result<PipelineDefinition> {
        let removed = {
            let mut runs = self.runs.lock();
            if runs.active.contains_key(id) {
                return Err(CoreError::Conflict(format!(
                    "pipeline '{id}' has an active run"
                )));
            }
            let removed = self
                .pipelines
                .write()
                .remove(id)
                .ok_or_else(|| CoreError::NotFound(format!("pipeline '{id}'")))?;
            runs.history.remove(id);
            removed
        };
        if let Err(err) = self.checkpoints.clear(id).await {
            warn!(target: "hasivu::pipeline", pipeline = %id, error = %err, "failed to clear checkpoint");
        }
        info!(target: "hasivu::pipeline", pipeline = %id, "pipeline unregistered");
        Ok(removed.definition)
    }

    pub fn definition(&self, id: &PipelineId) -> Option<PipelineDefinition> {
        self.pipelines
            .read()
            .get(id)
            .map(|entry| entry.definition.clone())
    }

    pub fn list(&self) -> Vec<PipelineSummary> {
        let now = Utc::now();
        let pipelines = self.pipelines.read();
        let runs = self.runs.lock();
        let mut summaries: Vec<PipelineSummary> = pipelines
            .values()
            .map(|entry| {
                let id = &entry.definition.id;
                PipelineSummary {
                    definition: entry.definition.clone(),
                    next_run_at: entry
                        .schedule
                        .as_ref()
                        .filter(|_| entry.definition.enabled)
                        .and_then(|schedule| schedule.next_after(now)),
                    active_run: runs.active.get(id).map(|active| active.snapshot.run_id),
                    last_status: runs
                        .history
                        .get(id)
                        .and_then(|history| history.front())
                        .map(|run| run.status),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.definition.id.cmp(&b.definition.id));
        summaries
    }

    /// Runs the pipeline to completion on the caller's task.
    pub async fn run(&self, id: &PipelineId) -> Result<PipelineRun> {
        let ticket = self.admit(id, RunTrigger::Manual)?;
        Ok(self.execute(ticket).await)
    }

    /// Starts a run in the background and returns its id.
    pub fn trigger(self: &Arc<Self>, id: &PipelineId) -> Result<RunId> {
        self.spawn_run(id, RunTrigger::Manual)
    }

    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let runs = self.runs.lock();
        let active = runs
            .active
            .values()
            .find(|active| active.snapshot.run_id == run_id)
            .ok_or_else(|| CoreError::NotFound(format!("active run {run_id}")))?;
        active.cancel.cancel();
        info!(
            target: "hasivu::pipeline",
            pipeline = %active.snapshot.pipeline_id,
            run = %run_id,
            "run cancellation requested"
        );
        Ok(())
    }

    /// Active run (if any) followed by finished runs, newest first.
    pub fn runs(&self, id: &PipelineId) -> Result<Vec<PipelineRun>> {
        if !self.pipelines.read().contains_key(id) {
            return Err(CoreError::NotFound(format!("pipeline '{id}'")));
        }
        let runs = self.runs.lock();
        let active = runs.active.get(id).map(|active| active.snapshot.clone());
        let history = runs.history.get(id).into_iter().flatten().cloned();
        Ok(active.into_iter().chain(history).collect())
    }

    pub fn run_status(&self, run_id: RunId) -> Option<PipelineRun> {
        let runs = self.runs.lock();
        runs.active
            .values()
            .map(|active| &active.snapshot)
            .chain(runs.history.values().flatten())
            .find(|run| run.run_id == run_id)
            .cloned()
    }

    pub fn active_runs(&self) -> Vec<PipelineRun> {
        self.runs
            .lock()
            .active
            .values()
            .map(|active| active.snapshot.clone())
            .collect()
    }

    pub async fn checkpoint(&self, id: &PipelineId) -> Result<Option<Checkpoint>> {
        if !self.pipelines.read().contains_key(id) {
            return Err(CoreError::NotFound(format!("pipeline '{id}'")));
        }
        self.checkpoints.latest(id).await
    }

    /// Starts runs for every enabled pipeline whose cron schedule fired
    /// between its last evaluation and `now`.
    pub fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<RunId> {
        let due: Vec<PipelineId> = {
            let mut pipelines = self.pipelines.write();
            pipelines
                .values_mut()
                .filter_map(|entry| {
                    let schedule = entry.schedule.as_ref()?;
                    if !entry.definition.enabled {
                        entry.last_checked = now;
                        return None;
                    }
                    if !schedule.due(entry.last_checked, now) {
                        return None;
                    }
                    entry.last_checked = now;
                    Some(entry.definition.id.clone())
                })
                .collect()
        };

        due.into_iter()
            .filter_map(|id| match self.spawn_run(&id, RunTrigger::Schedule) {
                Ok(run_id) => Some(run_id),
                Err(CoreError::Conflict(reason)) => {
                    debug!(target: "hasivu::pipeline", pipeline = %id, %reason, "scheduled run skipped");
                    None
                }
                Err(err) => {
                    warn!(target: "hasivu::pipeline", pipeline = %id, error = %err, "scheduled run failed to start");
                    None
                }
            })
            .collect()
    }

    /// Spawns the cron loop. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return;
        }

        let tick = Duration::from_millis(self.defaults.scheduler_tick_ms.max(100));
        let token = self.shutdown.child_token();
        let stop = token.clone();
        let this = Arc::clone(self);
        info!(target: "hasivu::pipeline", tick_ms = tick.as_millis() as u64, "pipeline scheduler started");

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(target: "hasivu::pipeline", "pipeline scheduler stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let started = this.run_due(Utc::now());
                        if !started.is_empty() {
                            info!(target: "hasivu::pipeline", count = started.len(), "scheduled runs started");
                        }
                    }
                }
            }
        });
        *slot = Some((handle, stop));
    }

    /// Stops the cron loop without touching active runs. `start` may be
    /// called again afterwards.
    pub async fn stop_scheduler(&self) {
        let Some((handle, stop)) = self.scheduler.lock().await.take() else {
            return;
        };
        stop.cancel();
        if let Err(err) = handle.await {
            warn!(target: "hasivu::pipeline", error = %err, "scheduler task failed");
        }
    }

    pub async fn scheduler_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    /// Stops the cron loop and cancels active runs at their next batch boundary.
    pub async fn shutdown(&self) {
        info!(target: "hasivu::pipeline", "stopping data-flow orchestrator");
        self.shutdown.cancel();
        self.stop_scheduler().await;

        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(target: "hasivu::pipeline", "pipeline runs still active after shutdown grace period");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn spawn_run(self: &Arc<Self>, id: &PipelineId, trigger: RunTrigger) -> Result<RunId> {
        let ticket = self.admit(id, trigger)?;
        let run_id = ticket.run.run_id;
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.execute(ticket).await;
        });
        Ok(run_id)
    }

    fn admit(&self, id: &PipelineId, trigger: RunTrigger) -> Result<RunTicket> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Unavailable(
                "data-flow orchestrator is shutting down".into(),
            ));
        }

        let definition = self
            .definition(id)
            .ok_or_else(|| CoreError::NotFound(format!("pipeline '{id}'")))?;
        if !definition.enabled {
            return Err(CoreError::Conflict(format!("pipeline '{id}' is disabled")));
        }

        let mut runs = self.runs.lock();
        if let Some(active) = runs.active.get(id) {
            return Err(CoreError::Conflict(format!(
                "pipeline '{id}' is already running ({})",
                active.snapshot.run_id
            )));
        }

        let run = PipelineRun::pending(id.clone(), RunId::new(), trigger);
        let cancel = self.shutdown.child_token();
        runs.active.insert(
            id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                snapshot: run.clone(),
            },
        );
        Ok(RunTicket {
            definition,
            run,
            cancel,
        })
    }

    async fn execute(&self, ticket: RunTicket) -> PipelineRun {
        let RunTicket {
            definition,
            mut run,
            cancel,
        } = ticket;
        let guard = AbandonGuard {
            runs: &self.runs,
            pipeline_id: run.pipeline_id.clone(),
            run_id: run.run_id,
            cancel: cancel.clone(),
            history_limit: self.defaults.run_history_limit,
            armed: true,
        };

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        let Some(_permit) = permit else {
            run.finish(RunStatus::Cancelled, None);
            guard.disarm();
            return self.settle(run).await;
        };

        run.status = RunStatus::Running;
        run.started_at = Utc::now();
        self.update_snapshot(&run);

        match self.drive(&definition, &mut run, &cancel).await {
            RunEnd::Completed => run.finish(RunStatus::Succeeded, None),
            RunEnd::Cancelled => run.finish(RunStatus::Cancelled, None),
            RunEnd::Failed(err) => run.finish(RunStatus::Failed, Some(err)),
        }
        guard.disarm();
        self.settle(run).await
    }

    async fn drive(
        &self,
        definition: &PipelineDefinition,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> RunEnd {
        let pipeline_id = &definition.id;
        let extractor = match self.connectors.extractor(&definition.source) {
            Ok(extractor) => extractor,
            Err(err) => return RunEnd::Failed(PipelineError::from_core(Phase::Extract, err)),
        };
        let loader = match self.connectors.loader(&definition.sink, definition.school_id) {
            Ok(loader) => loader,
            Err(err) => return RunEnd::Failed(PipelineError::from_core(Phase::Load, err)),
        };
        let transformer = Transformer::new(definition.transforms.clone());
        let backoff = Backoff::new(definition.effective_retry(&self.defaults));
        let batch_size = definition.effective_batch_size(&self.defaults);
        let checkpoint_every = definition.effective_checkpoint_every(&self.defaults);

        let resume = match self.checkpoints.latest(pipeline_id).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(target: "hasivu::pipeline", pipeline = %pipeline_id, error = %err, "checkpoint unreadable; starting from scratch");
                None
            }
        };
        let mut progress = Progress {
            cursor: resume.as_ref().and_then(|checkpoint| checkpoint.cursor.clone()),
            batches_completed: resume.as_ref().map_or(0, |c| c.batches_completed),
            records_loaded: resume.as_ref().map_or(0, |c| c.records_loaded),
            unsaved_batches: 0,
        };
        run.resumed_from = progress.cursor.clone();

        info!(
            target: "hasivu::pipeline",
            pipeline = %pipeline_id,
            run = %run.run_id,
            resumed_from = progress.cursor.as_ref().map(Cursor::as_str).unwrap_or("-"),
            "pipeline run started"
        );
        self.publish(PipelineEvent::RunStarted {
            pipeline_id: pipeline_id.clone(),
            run_id: run.run_id,
            resumed: resume.is_some(),
        })
        .await;

        let end = loop {
            if cancel.is_cancelled() {
                break RunEnd::Cancelled;
            }

            let scope = RetryScope {
                pipeline_id,
                run_id: run.run_id,
                batch: progress.batches_completed,
                backoff: &backoff,
                cancel,
            };

            let cursor = progress.cursor.clone();
            let batch = match self
                .with_retry(&scope, Phase::Extract, &mut run.metrics.retries, || {
                    extractor.extract(cursor.as_ref(), batch_size)
                })
                .await
            {
                Ok(batch) => batch,
                Err(err) => break interrupted(err),
            };

            let extracted = batch.records.len();
            run.metrics.extracted += extracted as u64;
            let output = transformer.apply(batch.records, Utc::now());
            run.metrics.filtered += output.filtered as u64;
            run.metrics.rejected += output.rejected.len() as u64;
            run.metrics.transformed += output.records.len() as u64;

            if let Some(first) = output.rejected.first() {
                debug!(
                    target: "hasivu::pipeline",
                    pipeline = %pipeline_id,
                    rejected = output.rejected.len(),
                    reason = %first.reason,
                    "records rejected"
                );
            }
            if let Some(limit) = definition.max_reject_ratio
                && output.reject_ratio() > limit
            {
                let reason = output
                    .rejected
                    .first()
                    .map(|rejection| rejection.reason.as_str())
                    .unwrap_or_default();
                break RunEnd::Failed(PipelineError::new(
                    Phase::Transform,
                    ErrorKind::InvalidData,
                    format!(
                        "{} of {} transformed records rejected, limit {:.0}%: {reason}",
                        output.rejected.len(),
                        output.records.len() + output.rejected.len(),
                        limit * 100.0
                    ),
                ));
            }

            let loaded = if output.records.is_empty() {
                0
            } else {
                match self
                    .with_retry(&scope, Phase::Load, &mut run.metrics.retries, || {
                        loader.load(&output.records)
                    })
                    .await
                {
                    Ok(report) => report.written,
                    Err(err) => break interrupted(err),
                }
            };

            run.metrics.loaded += loaded as u64;
            run.metrics.batches += 1;
            progress.records_loaded += loaded as u64;
            progress.batches_completed += 1;
            progress.unsaved_batches += 1;
            if let Some(next) = batch.next_cursor {
                progress.cursor = Some(next);
            }

            self.publish(PipelineEvent::BatchLoaded {
                pipeline_id: pipeline_id.clone(),
                run_id: run.run_id,
                batch: progress.batches_completed,
                loaded,
                rejected: output.rejected.len(),
            })
            .await;
            self.update_snapshot(run);

            if batch.exhausted || extracted == 0 {
                if !batch.exhausted {
                    warn!(target: "hasivu::pipeline", pipeline = %pipeline_id, "extractor returned an empty batch; treating source as exhausted");
                }
                break RunEnd::Completed;
            }
            if progress.unsaved_batches >= checkpoint_every {
                self.save_checkpoint(run, &mut progress).await;
            }
        };

        match end {
            RunEnd::Completed => {
                if let Err(err) = loader.flush().await {
                    return RunEnd::Failed(PipelineError::from_core(Phase::Load, err));
                }
                if let Err(err) = self.checkpoints.clear(pipeline_id).await {
                    warn!(target: "hasivu::pipeline", pipeline = %pipeline_id, error = %err, "failed to clear checkpoint");
                }
                RunEnd::Completed
            }
            other => {
                if progress.unsaved_batches > 0 {
                    self.save_checkpoint(run, &mut progress).await;
                }
                other
            }
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        scope: &RetryScope<'_>,
        phase: Phase,
        retries: &mut u64,
        mut op: F,
    ) -> std::result::Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u16 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => PipelineError::from_core(phase, err),
            };
            attempt = attempt.saturating_add(1);
            if !err.is_retryable() || !scope.backoff.allows_retry(attempt) {
                return Err(err);
            }

            let delay_ms = scope.backoff.delay_ms(
                attempt,
                (scope.pipeline_id, scope.run_id, phase, scope.batch),
            );
            *retries += 1;
            warn!(
                target: "hasivu::pipeline",
                pipeline = %scope.pipeline_id,
                run = %scope.run_id,
                %phase,
                attempt,
                delay_ms,
                error = %err.message,
                "phase failed; retrying"
            );
            self.publish(PipelineEvent::PhaseRetry {
                pipeline_id: scope.pipeline_id.clone(),
                run_id: scope.run_id,
                phase,
                attempt,
                delay_ms,
                error: err.message.clone(),
            })
            .await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = scope.cancel.cancelled() => {
                    return Err(PipelineError::new(
                        phase,
                        ErrorKind::Cancelled,
                        "run cancelled during retry backoff",
                    ));
                }
            }
        }
    }

    async fn save_checkpoint(&self, run: &mut PipelineRun, progress: &mut Progress) {
        let checkpoint = Checkpoint {
            pipeline_id: run.pipeline_id.clone(),
            run_id: run.run_id,
            cursor: progress.cursor.clone(),
            batches_completed: progress.batches_completed,
            records_loaded: progress.records_loaded,
            created_at: Utc::now(),
        };
        match self.checkpoints.save(&checkpoint).await {
            Ok(()) => {
                progress.unsaved_batches = 0;
                run.metrics.checkpoints += 1;
                self.publish(PipelineEvent::CheckpointSaved {
                    pipeline_id: run.pipeline_id.clone(),
                    run_id: run.run_id,
                    batches_completed: progress.batches_completed,
                })
                .await;
            }
            Err(err) => {
                warn!(target: "hasivu::pipeline", pipeline = %run.pipeline_id, error = %err, "checkpoint save failed");
            }
        }
    }

    fn update_snapshot(&self, run: &PipelineRun) {
        let mut runs = self.runs.lock();
        if let Some(active) = runs.active.get_mut(&run.pipeline_id)
            && active.snapshot.run_id == run.run_id
        {
            active.snapshot = run.clone();
        }
    }

    async fn settle(&self, run: PipelineRun) -> PipelineRun {
        self.runs
            .lock()
            .retire(run.clone(), self.defaults.run_history_limit);

        match (&run.status, &run.error) {
            (RunStatus::Failed, Some(err)) => warn!(
                target: "hasivu::pipeline",
                pipeline = %run.pipeline_id,
                run = %run.run_id,
                phase = %err.phase,
                kind = ?err.kind,
                error = %err.message,
                "pipeline run failed"
            ),
            (status, _) => info!(
                target: "hasivu::pipeline",
                pipeline = %run.pipeline_id,
                run = %run.run_id,
                status = ?status,
                loaded = run.metrics.loaded,
                batches = run.metrics.batches,
                duration_ms = run.duration_ms().unwrap_or_default(),
                "pipeline run finished"
            ),
        }

        self.publish(PipelineEvent::RunFinished {
            pipeline_id: run.pipeline_id.clone(),
            run_id: run.run_id,
            status: run.status,
        })
        .await;
        run
    }

    async fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events
            && let Err(err) = events.publish_pipeline_event(event).await
        {
            warn!(target: "hasivu::pipeline", error = %err, "publish pipeline event failed");
        }
    }
}

struct Progress {
    cursor: Option<Cursor>,
    batches_completed: u64,
    records_loaded: u64,
    unsaved_batches: u32,
}

fn interrupted(err: PipelineError) -> RunEnd {
    if err.kind == ErrorKind::Cancelled {
        RunEnd::Cancelled
    } else {
        RunEnd::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::RetryConfig;
    use crate::pipeline::{
        ExtractBatch, Extractor, InMemoryCheckpointStore, LoadReport, Loader, MemoryDatasets,
        MemorySink, MemorySource, Record, SinkSpec, SourceSpec, TransformStep,
    };

    fn rows(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| json!({ "id": i, "kind": if i % 2 == 0 { "veg" } else { "meat" } }))
            .map(|value| value.as_object().cloned().unwrap())
            .collect()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            jitter_ratio: 0.0,
            jitter_min_ms: 0,
        }
    }

    fn orchestrator(datasets: &MemoryDatasets) -> Arc<DataFlowOrchestrator> {
        Arc::new(DataFlowOrchestrator::new(
            PipelineDefaults::default(),
            ConnectorFactory::new(datasets.clone()),
            Arc::new(InMemoryCheckpointStore::new()),
        ))
    }

    fn memory_pipeline(id: &str, source: &str, sink: &str) -> PipelineDefinition {
        PipelineDefinition::new(
            id,
            id,
            SourceSpec::Memory {
                dataset: source.into(),
            },
            SinkSpec::Memory {
                dataset: sink.into(),
            },
        )
        .with_batch_size(2)
        .with_retry(fast_retry())
    }

    async fn wait_for_terminal(orchestrator: &DataFlowOrchestrator, run_id: RunId) -> PipelineRun {
        for _ in 0..500 {
            if let Some(run) = orchestrator.run_status(run_id)
                && run.status.is_terminal()
            {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} never finished");
    }

    struct FlakyExtractor {
        inner: MemorySource,
        failures: AtomicUsize,
        message: &'static str,
    }

    #[async_trait]
    impl Extractor for FlakyExtractor {
        async fn extract(&self, cursor: Option<&Cursor>, limit: usize) -> Result<ExtractBatch> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CoreError::Internal(self.message.into()));
            }
            self.inner.extract(cursor, limit).await
        }
    }

    /// Rejects any batch containing `id == 4` while `broken` is set.
    struct BrittleLoader {
        inner: MemorySink,
        broken: AtomicBool,
    }

    #[async_trait]
    impl Loader for BrittleLoader {
        async fn load(&self, records: &[Record]) -> Result<LoadReport> {
            if self.broken.load(Ordering::SeqCst) && records.iter().any(|r| r["id"] == json!(4)) {
                return Err(CoreError::InvalidInput("schema mismatch on column id".into()));
            }
            self.inner.load(records).await
        }
    }

    struct GatedExtractor {
        entered: Arc<Notify>,
        gate: Arc<Notify>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extractor for GatedExtractor {
        async fn extract(&self, _cursor: Option<&Cursor>, _limit: usize) -> Result<ExtractBatch> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(ExtractBatch {
                records: rows(1),
                next_cursor: Some(Cursor::from_offset(call as u64 + 1)),
                exhausted: false,
            })
        }
    }

    #[tokio::test]
    async fn runs_memory_pipeline_with_transforms() {
        let datasets = MemoryDatasets::new();
        datasets.insert("meals", rows(5));
        let orchestrator = orchestrator(&datasets);
        let definition = memory_pipeline("veg-only", "meals", "veg").with_transforms(vec![
            TransformStep::Filter {
                field: "kind".into(),
                op: crate::pipeline::FilterOp::Eq,
                value: json!("veg"),
            },
        ]);
        orchestrator.register(definition).unwrap();

        let id = PipelineId::new("veg-only");
        let run = orchestrator.run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.metrics.extracted, 5);
        assert_eq!(run.metrics.filtered, 2);
        assert_eq!(run.metrics.loaded, 3);
        assert_eq!(run.metrics.batches, 3);
        assert_eq!(datasets.len("veg"), 3);
        assert!(orchestrator.checkpoint(&id).await.unwrap().is_none());
        assert_eq!(orchestrator.runs(&id).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_extract_errors_are_retried() {
        let datasets = MemoryDatasets::new();
        datasets.insert("orders", rows(3));
        let orchestrator = orchestrator(&datasets);
        orchestrator.connectors().register_extractor(
            "flaky",
            Arc::new(FlakyExtractor {
                inner: MemorySource::new(datasets.clone(), "orders"),
                failures: AtomicUsize::new(2),
                message: "connection reset by peer",
            }),
        );
        let mut definition = memory_pipeline("flaky-orders", "orders", "orders_out");
        definition.source = SourceSpec::Custom {
            name: "flaky".into(),
        };
        orchestrator.register(definition).unwrap();

        let run = orchestrator
            .run(&PipelineId::new("flaky-orders"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.metrics.retries, 2);
        assert_eq!(datasets.len("orders_out"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_extract_phase() {
        let datasets = MemoryDatasets::new();
        datasets.insert("orders", rows(3));
        let orchestrator = orchestrator(&datasets);
        orchestrator.connectors().register_extractor(
            "down",
            Arc::new(FlakyExtractor {
                inner: MemorySource::new(datasets.clone(), "orders"),
                failures: AtomicUsize::new(10),
                message: "upstream returned 503",
            }),
        );
        let mut definition = memory_pipeline("down", "orders", "out");
        definition.source = SourceSpec::Custom {
            name: "down".into(),
        };
        orchestrator.register(definition).unwrap();

        let run = orchestrator.run(&PipelineId::new("down")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.phase, Phase::Extract);
        assert_eq!(error.kind, ErrorKind::Transient);
        assert_eq!(run.metrics.retries, 2);
    }

    #[tokio::test]
    async fn failed_load_keeps_checkpoint_and_next_run_resumes() {
        let datasets = MemoryDatasets::new();
        datasets.insert("students", rows(10));
        let orchestrator = orchestrator(&datasets);
        let loader = Arc::new(BrittleLoader {
            inner: MemorySink::new(datasets.clone(), "roster"),
            broken: AtomicBool::new(true),
        });
        orchestrator
            .connectors()
            .register_loader("brittle", loader.clone());
        let mut definition = memory_pipeline("roster", "students", "unused");
        definition.sink = SinkSpec::Custom {
            name: "brittle".into(),
        };
        orchestrator.register(definition).unwrap();
        let id = PipelineId::new("roster");

        let failed = orchestrator.run(&id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        let error = failed.error.clone().unwrap();
        assert_eq!(error.phase, Phase::Load);
        assert_eq!(error.kind, ErrorKind::InvalidData);
        assert_eq!(failed.metrics.retries, 0);

        let checkpoint = orchestrator.checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(checkpoint.cursor, Some(Cursor::from_offset(4)));
        assert_eq!(checkpoint.batches_completed, 2);

        loader.broken.store(false, Ordering::SeqCst);
        let resumed = orchestrator.run(&id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Succeeded);
        assert_eq!(resumed.resumed_from, Some(Cursor::from_offset(4)));
        assert_eq!(resumed.metrics.loaded, 6);
        assert_eq!(datasets.len("roster"), 10);
        assert!(orchestrator.checkpoint(&id).await.unwrap().is_none());

        let history = orchestrator.runs(&id).unwrap();
        assert_eq!(history[0].run_id, resumed.run_id);
        assert_eq!(history[1].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn concurrent_runs_conflict_and_cancel_stops_between_batches() {
        let datasets = MemoryDatasets::new();
        let orchestrator = orchestrator(&datasets);
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        orchestrator.connectors().register_extractor(
            "gated",
            Arc::new(GatedExtractor {
                entered: entered.clone(),
                gate: gate.clone(),
                calls: AtomicUsize::new(0),
            }),
        );
        let mut definition = memory_pipeline("gated", "unused", "gated_out");
        definition.source = SourceSpec::Custom {
            name: "gated".into(),
        };
        orchestrator.register(definition).unwrap();
        let id = PipelineId::new("gated");

        let run_id = orchestrator.trigger(&id).unwrap();
        entered.notified().await;
        assert!(matches!(
            orchestrator.run(&id).await,
            Err(CoreError::Conflict(_))
        ));
        assert_eq!(
            orchestrator.run_status(run_id).unwrap().status,
            RunStatus::Running
        );

        orchestrator.cancel(run_id).unwrap();
        gate.notify_one();

        let finished = wait_for_terminal(&orchestrator, run_id).await;
        assert_eq!(finished.status, RunStatus::Cancelled);
        assert_eq!(finished.metrics.loaded, 1);
        assert!(orchestrator.active_runs().is_empty());
        assert!(orchestrator.checkpoint(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reject_ratio_fails_transform_phase() {
        let datasets = MemoryDatasets::new();
        datasets.insert("menu", rows(4));
        let orchestrator = orchestrator(&datasets);
        let mut definition = memory_pipeline("menu", "menu", "menu_out").with_transforms(vec![
            TransformStep::Require {
                fields: vec!["price".into()],
            },
        ]);
        definition.max_reject_ratio = Some(0.5);
        orchestrator.register(definition).unwrap();

        let run = orchestrator.run(&PipelineId::new("menu")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap().phase, Phase::Transform);
        assert_eq!(datasets.len("menu_out"), 0);
    }

    #[tokio::test]
    async fn filtered_records_do_not_dilute_the_reject_ratio() {
        let datasets = MemoryDatasets::new();
        let mut menu: Vec<Record> = (0..8)
            .map(|i| json!({ "id": i, "kind": "meat", "price": 4 }))
            .map(|value| value.as_object().cloned().unwrap())
            .collect();
        menu.push(json!({ "id": 8, "kind": "veg", "price": 3 }).as_object().cloned().unwrap());
        menu.push(json!({ "id": 9, "kind": "veg" }).as_object().cloned().unwrap());
        datasets.insert("menu", menu);
        let orchestrator = orchestrator(&datasets);
        let mut definition = memory_pipeline("veg", "menu", "veg_out")
            .with_batch_size(10)
            .with_transforms(vec![
                TransformStep::Filter {
                    field: "kind".into(),
                    op: crate::pipeline::FilterOp::Eq,
                    value: json!("veg"),
                },
                TransformStep::Require {
                    fields: vec!["price".into()],
                },
            ]);
        definition.max_reject_ratio = Some(0.4);
        orchestrator.register(definition).unwrap();

        let run = orchestrator.run(&PipelineId::new("veg")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.metrics.filtered, 8);
        assert_eq!(run.error.unwrap().phase, Phase::Transform);
    }

    #[tokio::test]
    async fn dropped_inline_run_is_marked_cancelled() {
        let datasets = MemoryDatasets::new();
        let orchestrator = orchestrator(&datasets);
        let gate = Arc::new(Notify::new());
        orchestrator.connectors().register_extractor(
            "stalled",
            Arc::new(GatedExtractor {
                entered: Arc::new(Notify::new()),
                gate: gate.clone(),
                calls: AtomicUsize::new(0),
            }),
        );
        let mut definition = memory_pipeline("stalled", "unused", "stalled_out");
        definition.source = SourceSpec::Custom {
            name: "stalled".into(),
        };
        orchestrator.register(definition).unwrap();
        let id = PipelineId::new("stalled");

        let inline = tokio::time::timeout(Duration::from_millis(50), orchestrator.run(&id)).await;
        assert!(inline.is_err());
        assert!(orchestrator.active_runs().is_empty());
        let history = orchestrator.runs(&id).unwrap();
        assert_eq!(history[0].status, RunStatus::Cancelled);

        let run_id = orchestrator.trigger(&id).unwrap();
        orchestrator.cancel(run_id).unwrap();
        gate.notify_one();
        let finished = wait_for_terminal(&orchestrator, run_id).await;
        assert_eq!(finished.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn registration_is_validated() {
        let datasets = MemoryDatasets::new();
        let orchestrator = orchestrator(&datasets);
        orchestrator
            .register(memory_pipeline("a", "in", "out"))
            .unwrap();
        assert!(matches!(
            orchestrator.register(memory_pipeline("a", "in", "out")),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            orchestrator.register(memory_pipeline("b", "in", "out").with_schedule("* * *")),
            Err(CoreError::InvalidInput(_))
        ));

        let mut queue_sink = memory_pipeline("c", "in", "out");
        queue_sink.sink = SinkSpec::Queue {
            queue: crate::queue::QueueName::new("jobs").unwrap(),
            priority: Default::default(),
            dedupe_field: None,
        };
        assert!(orchestrator.register(queue_sink).is_err());

        let removed = orchestrator.unregister(&PipelineId::new("a")).await.unwrap();
        assert_eq!(removed.name, "a");
        assert!(orchestrator.definition(&PipelineId::new("a")).is_none());
        assert!(matches!(
            orchestrator.run(&PipelineId::new("a")).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn due_schedules_trigger_runs() {
        let datasets = MemoryDatasets::new();
        datasets.insert("attendance", rows(3));
        let orchestrator = orchestrator(&datasets);
        orchestrator
            .register(
                memory_pipeline("nightly", "attendance", "attendance_out")
                    .with_schedule("* * * * *"),
            )
            .unwrap();
        orchestrator
            .register(memory_pipeline("manual", "attendance", "other"))
            .unwrap();

        let started = orchestrator.run_due(Utc::now() + chrono::Duration::minutes(2));
        assert_eq!(started.len(), 1);
        let run = wait_for_terminal(&orchestrator, started[0]).await;
        assert_eq!(run.trigger, RunTrigger::Schedule);
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(datasets.len("attendance_out"), 3);

        let listed = orchestrator.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].definition.id.as_str(), "nightly");
        assert!(listed[1].next_run_at.is_some());
        assert_eq!(listed[1].last_status, Some(RunStatus::Succeeded));

        orchestrator.shutdown().await;
        assert!(matches!(
            orchestrator.run(&PipelineId::new("manual")).await,
            Err(CoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn scheduler_loop_can_restart() {
        let orchestrator = orchestrator(&MemoryDatasets::new());
        orchestrator.start().await;
        orchestrator.start().await;
        assert!(orchestrator.scheduler_running().await);

        orchestrator.stop_scheduler().await;
        assert!(!orchestrator.scheduler_running().await);

        orchestrator.start().await;
        assert!(orchestrator.scheduler_running().await);
        orchestrator.shutdown().await;
        assert!(!orchestrator.scheduler_running().await);
    }
}
