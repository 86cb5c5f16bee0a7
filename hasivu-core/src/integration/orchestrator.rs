use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IntegrationConfig;
use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, LifecycleEventPublisher};
use crate::resilience::{CircuitBreaker, CircuitBreakerRegistry};

use super::component::{
    ComponentHealth, ComponentKind, HealthStatus, IntegrationComponent, LifecycleState, SyncReport,
};

struct Registered {
    component: Arc<dyn IntegrationComponent>,
    depends_on: Vec<String>,
    state: LifecycleState,
    health: Option<ComponentHealth>,
    last_error: Option<String>,
    last_sync: Option<SyncReport>,
}

impl Registered {
    fn name(&self) -> &str {
        self.component.name()
    }

    fn report(&self) -> ComponentReport {
        ComponentReport {
            name: self.name().to_string(),
            kind: self.component.kind(),
            state: self.state,
            depends_on: self.depends_on.clone(),
            health: self.health.clone(),
            last_error: self.last_error.clone(),
            last_sync: self.last_sync.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub kind: ComponentKind,
    pub state: LifecycleState,
    pub depends_on: Vec<String>,
    pub health: Option<ComponentHealth>,
    pub last_error: Option<String>,
    pub last_sync: Option<SyncReport>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub components: Vec<ComponentReport>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentFailure {
    pub name: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StartReport {
    pub connected: Vec<String>,
    pub failed: Vec<ComponentFailure>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncOutcome {
    pub component: String,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
}

/// Owns the lifecycle of integration components: dependency-ordered
/// start-up, reverse shutdown, syncs, health aggregation and reconnects.
pub struct IntegrationOrchestrator {
    config: IntegrationConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Option<Arc<dyn LifecycleEventPublisher>>,
    /// Registration order.
    components: RwLock<Vec<Registered>>,
    shutdown: CancellationToken,
    monitor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for IntegrationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("IntegrationOrchestrator");
        debug.field("config", &self.config);
        match self.components.try_read() {
            Some(components) => {
                let names: Vec<&str> = components.iter().map(Registered::name).collect();
                debug.field("components", &names);
            }
            None => {
                debug.field("components", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

fn breaker_name(component: &str) -> String {
    format!("integration.{component}")
}

impl IntegrationOrchestrator {
    pub fn new(config: IntegrationConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            config,
            breakers,
            events: None,
            components: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn LifecycleEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Dependencies are resolved at start time, so they may be registered later.
    pub fn register<I, S>(&self, component: Arc<dyn IntegrationComponent>, depends_on: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = component.name().to_string();
        if name.trim().is_empty() {
            return Err(CoreError::InvalidInput("component name must not be empty".into()));
        }
        let depends_on: Vec<String> = depends_on.into_iter().map(Into::into).collect();
        if depends_on.iter().any(|dep| *dep == name) {
            return Err(CoreError::InvalidInput(format!(
                "component '{name}' cannot depend on itself"
            )));
        }

        let mut components = self.components.write();
        if components.iter().any(|entry| entry.name() == name) {
            return Err(CoreError::Conflict(format!(
                "component '{name}' is already registered"
            )));
        }
        info!(
            target: "hasivu::integration",
            component = %name,
            kind = ?component.kind(),
            depends_on = ?depends_on,
            "component registered"
        );
        components.push(Registered {
            component,
            depends_on,
            state: LifecycleState::Registered,
            health: None,
            last_error: None,
            last_sync: None,
        });
        Ok(())
    }

    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.components
            .read()
            .iter()
            .find(|entry| entry.name() == name)
            .map(|entry| entry.state)
    }

    /// Dependency-first order. Ties keep registration order.
    pub fn start_order(&self) -> Result<Vec<String>> {
        let components = self.components.read();
        for entry in components.iter() {
            if let Some(missing) = entry
                .depends_on
                .iter()
                .find(|dep| !components.iter().any(|other| other.name() == dep.as_str()))
            {
                return Err(CoreError::InvalidInput(format!(
                    "component '{}' depends on unknown component '{missing}'",
                    entry.name()
                )));
            }
        }

        let mut remaining: Vec<&Registered> = components.iter().collect();
        let mut order: Vec<String> = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|entry| entry.depends_on.iter().all(|dep| order.contains(dep)));
            match ready {
                Some(index) => order.push(remaining.remove(index).name().to_string()),
                None => {
                    let cycle: Vec<&str> = remaining.iter().map(|entry| entry.name()).collect();
                    return Err(CoreError::InvalidInput(format!(
                        "dependency cycle among components: {}",
                        cycle.join(", ")
                    )));
                }
            }
        }
        Ok(order)
    }

    fn ordered_names(&self) -> Vec<String> {
        self.start_order().unwrap_or_else(|_| {
            self.components
                .read()
                .iter()
                .map(|entry| entry.name().to_string())
                .collect()
        })
    }

    pub async fn start_all(&self) -> Result<StartReport> {
        let order = self.start_order()?;
        info!(target: "hasivu::integration", components = order.len(), "starting integration components");

        let mut report = StartReport::default();
        for name in order {
            let Some((component, state)) = self.entry(&name) else {
                continue;
            };
            if state == LifecycleState::Connected {
                report.connected.push(name);
                continue;
            }
            if let Some(blocked) = self.unavailable_dependency(&name) {
                let error = format!("dependency '{blocked}' is not connected");
                warn!(target: "hasivu::integration", component = %name, %error, "component not started");
                self.set_state(&name, LifecycleState::Failed, Some(error.clone()))
                    .await;
                report.failed.push(ComponentFailure { name, error });
                continue;
            }
            match self.connect_one(component).await {
                Ok(()) => report.connected.push(name),
                Err(err) => report.failed.push(ComponentFailure {
                    name,
                    error: err.to_string(),
                }),
            }
        }

        info!(
            target: "hasivu::integration",
            connected = report.connected.len(),
            failed = report.failed.len(),
            "integration start finished"
        );
        Ok(report)
    }

    /// Disconnects in reverse dependency order. Errors are logged only.
    pub async fn stop_all(&self) {
        let mut order = self.ordered_names();
        order.reverse();
        for name in order {
            let Some((component, state)) = self.entry(&name) else {
                continue;
            };
            if !matches!(state, LifecycleState::Connected | LifecycleState::Connecting) {
                continue;
            }
            self.disconnect_one(&name, component).await;
        }
    }

    pub async fn sync(&self, name: &str) -> Result<SyncReport> {
        let (component, state) = self
            .entry(name)
            .ok_or_else(|| CoreError::NotFound(format!("component '{name}'")))?;
        if state != LifecycleState::Connected {
            return Err(CoreError::Unavailable(format!(
                "component '{name}' is {state}"
            )));
        }

        let breaker = self.breaker(name);
        let started = Instant::now();
        let result = breaker
            .call_within(self.config.operation_timeout(), component.sync())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut components = self.components.write();
        let entry = components.iter_mut().find(|entry| entry.name() == name);
        match result {
            Ok(mut report) => {
                report.duration_ms = duration_ms;
                info!(
                    target: "hasivu::integration",
                    component = %name,
                    items = report.items_processed,
                    duration_ms,
                    "component synced"
                );
                if let Some(entry) = entry {
                    entry.last_sync = Some(report.clone());
                }
                Ok(report)
            }
            Err(err) => {
                warn!(target: "hasivu::integration", component = %name, error = %err, "component sync failed");
                if let Some(entry) = entry {
                    entry.last_error = Some(err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Syncs every connected component in dependency order.
    pub async fn sync_all(&self) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::new();
        for name in self.ordered_names() {
            if self.state(&name) != Some(LifecycleState::Connected) {
                continue;
            }
            let outcome = match self.sync(&name).await {
                Ok(report) => SyncOutcome {
                    component: name,
                    report: Some(report),
                    error: None,
                },
                Err(err) => SyncOutcome {
                    component: name,
                    report: None,
                    error: Some(err.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Cached view of every component, in dependency order.
    pub fn components(&self) -> Vec<ComponentReport> {
        let order = self.ordered_names();
        let components = self.components.read();
        order
            .iter()
            .filter_map(|name| components.iter().find(|entry| entry.name() == name))
            .map(Registered::report)
            .collect()
    }

    /// Probes connected components; anything not connected is unhealthy.
    pub async fn health(&self) -> SystemHealth {
        let targets: Vec<(Arc<dyn IntegrationComponent>, LifecycleState)> = self
            .components
            .read()
            .iter()
            .map(|entry| (Arc::clone(&entry.component), entry.state))
            .collect();

        for (component, state) in targets {
            let health = if state == LifecycleState::Connected {
                match tokio::time::timeout(self.config.operation_timeout(), component.health()).await {
                    Ok(health) => health,
                    Err(_) => ComponentHealth::unhealthy("health check timed out"),
                }
            } else {
                ComponentHealth::unhealthy(format!("component is {state}"))
            };
            self.record_health(component.name(), health).await;
        }

        let components = self.components();
        let status = components
            .iter()
            .filter_map(|report| report.health.as_ref().map(|health| health.status))
            .max()
            .unwrap_or(HealthStatus::Healthy);
        SystemHealth {
            status,
            checked_at: Utc::now(),
            components,
        }
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let (component, state) = self
            .entry(name)
            .ok_or_else(|| CoreError::NotFound(format!("component '{name}'")))?;
        info!(target: "hasivu::integration", component = %name, %state, "restarting component");

        if matches!(state, LifecycleState::Connected | LifecycleState::Connecting) {
            self.disconnect_one(name, Arc::clone(&component)).await;
        }
        if let Some(blocked) = self.unavailable_dependency(name) {
            let error = format!("dependency '{blocked}' is not connected");
            self.set_state(name, LifecycleState::Failed, Some(error.clone()))
                .await;
            return Err(CoreError::Unavailable(error));
        }
        self.connect_one(component).await
    }

    /// One monitoring pass: refresh health, then reconnect failed or
    /// unhealthy components when auto-reconnect is enabled.
    pub async fn monitor_tick(&self) -> SystemHealth {
        let health = self.health().await;
        if !self.config.auto_reconnect {
            return health;
        }

        let mut recovered = false;
        for report in &health.components {
            let needs_restart = match report.state {
                LifecycleState::Failed => true,
                LifecycleState::Connected => report
                    .health
                    .as_ref()
                    .is_some_and(|health| health.status == HealthStatus::Unhealthy),
                _ => false,
            };
            if !needs_restart {
                continue;
            }
            match self.restart(&report.name).await {
                Ok(()) => {
                    recovered = true;
                    info!(target: "hasivu::integration", component = %report.name, "component reconnected");
                }
                Err(err) => {
                    debug!(target: "hasivu::integration", component = %report.name, error = %err, "reconnect attempt failed");
                }
            }
        }

        if recovered {
            self.health().await
        } else {
            health
        }
    }

    /// Spawns the periodic health monitor. Calling it twice is a no-op.
    pub async fn spawn_health_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return;
        }
        let period = self.config.health_check_interval();
        let token = self.shutdown.clone();
        let this = Arc::clone(self);
        info!(target: "hasivu::integration", interval_ms = period.as_millis() as u64, "health monitor started");

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(target: "hasivu::integration", "health monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let health = this.monitor_tick().await;
                        debug!(target: "hasivu::integration", status = %health.status, "health check completed");
                    }
                }
            }
        }));
    }

    /// Stops the health monitor and disconnects every component.
    pub async fn shutdown(&self) {
        info!(target: "hasivu::integration", "stopping integration orchestrator");
        self.shutdown.cancel();
        if let Some(handle) = self.monitor.lock().await.take()
            && let Err(err) = handle.await
        {
            warn!(target: "hasivu::integration", error = %err, "health monitor task failed");
        }
        self.stop_all().await;
    }

    fn entry(&self, name: &str) -> Option<(Arc<dyn IntegrationComponent>, LifecycleState)> {
        self.components
            .read()
            .iter()
            .find(|entry| entry.name() == name)
            .map(|entry| (Arc::clone(&entry.component), entry.state))
    }

    fn unavailable_dependency(&self, name: &str) -> Option<String> {
        let components = self.components.read();
        let entry = components.iter().find(|entry| entry.name() == name)?;
        entry
            .depends_on
            .iter()
            .find(|dep| {
                components
                    .iter()
                    .find(|other| other.name() == dep.as_str())
                    .is_none_or(|other| other.state != LifecycleState::Connected)
            })
            .cloned()
    }

    fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .get_or_create_with(&breaker_name(name), self.config.circuit_breaker.clone())
    }

    async fn bounded<T, F>(&self, name: &str, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.config.operation_timeout();
        tokio::time::timeout(limit, future).await.map_err(|_| {
            CoreError::Timeout(format!("{operation} of '{name}' exceeded {limit:?}"))
        })?
    }

    async fn connect_one(&self, component: Arc<dyn IntegrationComponent>) -> Result<()> {
        let name = component.name().to_string();
        self.set_state(&name, LifecycleState::Connecting, None).await;

        let breaker = self.breaker(&name);
        let result = breaker
            .call_within(self.config.operation_timeout(), component.connect())
            .await;
        match &result {
            Ok(()) => {
                info!(target: "hasivu::integration", component = %name, "component connected");
                self.set_state(&name, LifecycleState::Connected, None).await;
            }
            Err(err) => {
                warn!(target: "hasivu::integration", component = %name, error = %err, "component failed to connect");
                self.set_state(&name, LifecycleState::Failed, Some(err.to_string()))
                    .await;
            }
        }
        result
    }

    async fn disconnect_one(&self, name: &str, component: Arc<dyn IntegrationComponent>) {
        match self.bounded(name, "disconnect", component.disconnect()).await {
            Ok(()) => info!(target: "hasivu::integration", component = %name, "component disconnected"),
            Err(err) => {
                warn!(target: "hasivu::integration", component = %name, error = %err, "component disconnect failed")
            }
        }
        self.set_state(name, LifecycleState::Disconnected, None).await;
    }

    async fn set_state(&self, name: &str, to: LifecycleState, error: Option<String>) {
        let from = {
            let mut components = self.components.write();
            let Some(entry) = components.iter_mut().find(|entry| entry.name() == name) else {
                return;
            };
            let from = entry.state;
            entry.state = to;
            if to == LifecycleState::Connected {
                entry.last_error = None;
            }
            if error.is_some() {
                entry.last_error = error;
            }
            from
        };
        if from == to {
            return;
        }
        debug!(target: "hasivu::integration", component = %name, %from, %to, "lifecycle transition");
        self.publish(LifecycleEvent::StateChanged {
            component: name.to_string(),
            from,
            to,
            at: Utc::now(),
        })
        .await;
    }

    async fn record_health(&self, name: &str, health: ComponentHealth) {
        let previous = {
            let mut components = self.components.write();
            let Some(entry) = components.iter_mut().find(|entry| entry.name() == name) else {
                return;
            };
            let previous = entry.health.as_ref().map(|health| health.status);
            entry.health = Some(health.clone());
            previous
        };
        if let Some(from) = previous
            && from != health.status
        {
            info!(
                target: "hasivu::integration",
                component = %name,
                %from,
                to = %health.status,
                message = health.message.as_deref().unwrap_or(""),
                "component health changed"
            );
            self.publish(LifecycleEvent::HealthChanged {
                component: name.to_string(),
                from,
                to: health.status,
                at: health.checked_at,
            })
            .await;
        }
    }

    async fn publish(&self, event: LifecycleEvent) {
        if let Some(events) = &self.events
            && let Err(err) = events.publish_lifecycle_event(event).await
        {
            warn!(target: "hasivu::integration", error = %err, "publish lifecycle event failed");
        }
    }
}
