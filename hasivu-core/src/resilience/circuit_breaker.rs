use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Samples considered by the error-rate trip condition.
const ERROR_RATE_SPAN: usize = 20;
const ERROR_RATE_MIN_SAMPLES: usize = 10;
/// Samples considered by the latency trip condition.
const LATENCY_SPAN: usize = 10;
const LATENCY_MIN_SAMPLES: usize = 5;
const LATENCY_WINDOW: usize = 50;
/// Samples needed before thresholds adapt.
const ADAPT_SPAN: usize = 50;
const HIGH_TRAFFIC: usize = 40;
const MAX_ADAPTIVE_FAILURE_THRESHOLD: u32 = 10;
const MIN_LATENCY_THRESHOLD: Duration = Duration::from_secs(1);
const MAX_LATENCY_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive-ish failures (successes decay the count) that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    pub recovery_timeout_ms: u64,
    /// Probe calls admitted while half-open.
    pub half_open_max_requests: u32,
    /// Probe successes required to close again.
    pub success_threshold: u32,
    pub call_timeout_ms: u64,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: u64,
    pub window_size: usize,
    pub adaptive: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_requests: 3,
            success_threshold: 3,
            call_timeout_ms: 30_000,
            error_rate_threshold: 0.5,
            latency_threshold_ms: 5_000,
            window_size: 100,
            adaptive: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    /// Opened by an operator; only `force_close` leaves this state.
    ForcedOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::ForcedOpen => "forced_open",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub timeouts: u64,
    pub state_changes: u64,
    pub adaptive_adjustments: u64,
    pub last_trip_at: Option<DateTime<Utc>>,
    pub last_trip_reason: Option<String>,
    /// Time from the last trip until the breaker closed again.
    pub last_recovery_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveThresholds {
    pub failure_threshold: u32,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub state_changed_at: DateTime<Utc>,
    pub failure_count: u32,
    pub success_count: u32,
    pub thresholds: AdaptiveThresholds,
    pub window_len: usize,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub stats: CircuitStats,
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    success: bool,
    latency: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    changed_at: Instant,
    changed_at_wall: DateTime<Utc>,
    failure_count: u32,
    success_count: u32,
    half_open_admitted: u32,
    window: VecDeque<Sample>,
    latencies: VecDeque<Duration>,
    failure_threshold: u32,
    latency_threshold: Duration,
    trip_instant: Option<Instant>,
    stats: CircuitStats,
}

impl BreakerState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            changed_at: Instant::now(),
            changed_at_wall: Utc::now(),
            failure_count: 0,
            success_count: 0,
            half_open_admitted: 0,
            window: VecDeque::with_capacity(config.window_size.max(1)),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            failure_threshold: config.failure_threshold.max(1),
            latency_threshold: config.latency_threshold(),
            trip_instant: None,
            stats: CircuitStats::default(),
        }
    }

    fn record(&mut self, sample: Sample, window_size: usize) {
        if self.window.len() >= window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        if self.latencies.len() >= LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(sample.latency);
    }

    fn error_rate(&self, span: usize) -> f64 {
        let recent = self.window.iter().rev().take(span);
        let (count, failures) = recent.fold((0usize, 0usize), |(count, failures), sample| {
            (count + 1, failures + usize::from(!sample.success))
        });
        if count == 0 {
            0.0
        } else {
            failures as f64 / count as f64
        }
    }

    fn mean_latency(&self, span: usize) -> Option<Duration> {
        let recent: Vec<Duration> = self.latencies.iter().rev().take(span).copied().collect();
        if recent.is_empty() {
            return None;
        }
        let total: Duration = recent.iter().sum();
        Some(total / recent.len() as u32)
    }
}

/// Guards calls to one dependency. Trips on failure count, recent error rate
/// or recent mean latency; probes again after the recovery timeout.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CircuitBreaker");
        debug.field("name", &self.name);
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("state", &state.state)
                    .field("failure_count", &state.failure_count);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let state = Mutex::new(BreakerState::new(&config));
        Self {
            name: name.into(),
            config,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Runs `operation` unless the breaker rejects it. Calls exceeding the
    /// configured timeout fail with [`CoreError::Timeout`] and count as failures.
    pub async fn call<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.call_within(self.config.call_timeout(), operation).await
    }

    /// Like [`call`](Self::call) with the timeout capped at `deadline`.
    ///
    /// Dropping the returned future mid-call records a failure and frees the
    /// half-open probe slot the call held.
    pub async fn call_within<T, F>(&self, deadline: Duration, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit()?;
        let in_flight = InFlight {
            breaker: self,
            started: Instant::now(),
            settled: false,
        };
        let timeout = deadline.min(self.config.call_timeout());
        match tokio::time::timeout(timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success(in_flight.settle());
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(in_flight.settle(), false);
                Err(err)
            }
            Err(_) => {
                self.record_failure(in_flight.settle(), true);
                Err(CoreError::Timeout(format!(
                    "call through circuit '{}' exceeded {timeout:?}",
                    self.name
                )))
            }
        }
    }

    fn admit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let admitted = match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.changed_at.elapsed() >= self.config.recovery_timeout() {
                    self.transition(&mut state, CircuitState::HalfOpen, "recovery probe");
                    state.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_admitted < self.config.half_open_max_requests.max(1) {
                    state.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::ForcedOpen => false,
        };

        if admitted {
            return Ok(());
        }
        state.stats.rejected_requests += 1;
        debug!(target: "hasivu::resilience", circuit = %self.name, state = %state.state, "call rejected");
        Err(CoreError::CircuitOpen(format!(
            "circuit '{}' is {}",
            self.name, state.state
        )))
    }

    fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.stats.total_requests += 1;
        state.stats.successful_requests += 1;
        state.success_count += 1;
        state.failure_count = state.failure_count.saturating_sub(1);
        state.record(
            Sample {
                success: true,
                latency,
            },
            self.config.window_size,
        );

        if state.state == CircuitState::HalfOpen
            && state.success_count >= self.config.success_threshold.max(1)
        {
            self.transition(&mut state, CircuitState::Closed, "probes succeeded");
        }
        if self.config.adaptive {
            self.adapt(&mut state);
        }
    }

    fn record_failure(&self, latency: Duration, timed_out: bool) {
        let mut state = self.state.lock();
        state.stats.total_requests += 1;
        state.stats.failed_requests += 1;
        if timed_out {
            state.stats.timeouts += 1;
        }
        state.failure_count += 1;
        state.success_count = 0;
        state.record(
            Sample {
                success: false,
                latency,
            },
            self.config.window_size,
        );

        match state.state {
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open, "probe failed");
            }
            CircuitState::Closed => {
                if let Some(reason) = self.trip_reason(&state) {
                    self.transition(&mut state, CircuitState::Open, &reason);
                }
            }
            CircuitState::Open | CircuitState::ForcedOpen => {}
        }
    }

    fn trip_reason(&self, state: &BreakerState) -> Option<String> {
        if state.failure_count >= state.failure_threshold {
            return Some(format!(
                "failure count {} >= {}",
                state.failure_count, state.failure_threshold
            ));
        }
        if state.window.len() >= ERROR_RATE_MIN_SAMPLES {
            let rate = state.error_rate(ERROR_RATE_SPAN);
            if rate >= self.config.error_rate_threshold {
                return Some(format!(
                    "error rate {rate:.2} >= {:.2}",
                    self.config.error_rate_threshold
                ));
            }
        }
        if state.latencies.len() >= LATENCY_MIN_SAMPLES
            && let Some(mean) = state.mean_latency(LATENCY_SPAN)
            && mean >= state.latency_threshold
        {
            return Some(format!(
                "mean latency {mean:?} >= {:?}",
                state.latency_threshold
            ));
        }
        None
    }

    fn adapt(&self, state: &mut BreakerState) {
        if state.window.len() < ADAPT_SPAN {
            return;
        }
        let recent: Vec<Sample> = state.window.iter().rev().take(ADAPT_SPAN).copied().collect();
        let base = self.config.failure_threshold.max(1);
        let failure_threshold = if recent.len() > HIGH_TRAFFIC {
            (base + 2).min(MAX_ADAPTIVE_FAILURE_THRESHOLD)
        } else {
            base
        };

        let mean = recent.iter().map(|s| s.latency).sum::<Duration>() / recent.len() as u32;
        let current = state.latency_threshold;
        let latency_threshold = if mean < current / 2 {
            current.mul_f64(0.9).max(MIN_LATENCY_THRESHOLD)
        } else if mean > current.mul_f64(1.5) {
            current.mul_f64(1.2).min(MAX_LATENCY_THRESHOLD)
        } else {
            current
        };

        let mut changed = false;
        if failure_threshold != state.failure_threshold {
            info!(
                target: "hasivu::resilience",
                circuit = %self.name,
                from = state.failure_threshold,
                to = failure_threshold,
                "failure threshold adjusted"
            );
            state.failure_threshold = failure_threshold;
            changed = true;
        }
        if latency_threshold.abs_diff(current) >= Duration::from_millis(500) {
            info!(
                target: "hasivu::resilience",
                circuit = %self.name,
                from_ms = current.as_millis() as u64,
                to_ms = latency_threshold.as_millis() as u64,
                "latency threshold adjusted"
            );
            state.latency_threshold = latency_threshold;
            changed = true;
        }
        if changed {
            state.stats.adaptive_adjustments += 1;
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, reason: &str) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        state.changed_at = Instant::now();
        state.changed_at_wall = Utc::now();
        state.stats.state_changes += 1;

        match to {
            CircuitState::Open | CircuitState::ForcedOpen => {
                state.trip_instant = Some(state.changed_at);
                state.stats.last_trip_at = Some(state.changed_at_wall);
                state.stats.last_trip_reason = Some(reason.to_string());
                state.half_open_admitted = 0;
                warn!(target: "hasivu::resilience", circuit = %self.name, %from, %to, reason, "circuit opened");
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                state.half_open_admitted = 0;
                info!(target: "hasivu::resilience", circuit = %self.name, %from, %to, reason, "circuit half-open");
            }
            CircuitState::Closed => {
                state.failure_count = 0;
                state.success_count = 0;
                state.half_open_admitted = 0;
                if let Some(tripped) = state.trip_instant.take() {
                    state.stats.last_recovery_ms = Some(tripped.elapsed().as_millis() as u64);
                }
                info!(target: "hasivu::resilience", circuit = %self.name, %from, %to, reason, "circuit closed");
            }
        }
    }

    pub fn force_open(&self, reason: &str) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::ForcedOpen, &format!("forced: {reason}"));
    }

    pub fn force_close(&self, reason: &str) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Closed, &format!("forced: {reason}"));
        state.failure_count = 0;
        state.success_count = 0;
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let state = self.state.lock();
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: state.state,
            state_changed_at: state.changed_at_wall,
            failure_count: state.failure_count,
            success_count: state.success_count,
            thresholds: AdaptiveThresholds {
                failure_threshold: state.failure_threshold,
                error_rate_threshold: self.config.error_rate_threshold,
                latency_threshold_ms: state.latency_threshold.as_millis() as u64,
            },
            window_len: state.window.len(),
            error_rate: state.error_rate(state.window.len()),
            average_latency_ms: state
                .mean_latency(state.latencies.len())
                .map_or(0.0, |mean| mean.as_secs_f64() * 1_000.0),
            stats: state.stats.clone(),
        }
    }
}

struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    started: Instant,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self) -> Duration {
        self.settled = true;
        self.started.elapsed()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(target: "hasivu::resilience", circuit = %self.breaker.name, "call abandoned mid-flight");
        self.breaker.record_failure(self.started.elapsed(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 1_000,
            half_open_max_requests: 2,
            success_threshold: 2,
            call_timeout_ms: 500,
            adaptive: false,
            ..CircuitBreakerConfig::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(async { Err::<(), _>(CoreError::Unavailable("down".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_threshold_and_recovers_through_half_open() {
        let breaker = CircuitBreaker::new("vendor-api", config());
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(CoreError::Unavailable(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(CoreError::CircuitOpen(_))));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let status = breaker.status();
        assert_eq!(status.stats.rejected_requests, 1);
        assert_eq!(status.stats.state_changes, 3);
        assert!(status.stats.last_recovery_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("kitchen", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_probe_budget() {
        let mut cfg = config();
        cfg.success_threshold = 5;
        let breaker = CircuitBreaker::new("auth", cfg);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert!(matches!(succeed(&breaker).await, Err(CoreError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_count_as_failures() {
        let breaker = CircuitBreaker::new("slow", config());
        let result = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
        let status = breaker.status();
        assert_eq!(status.stats.timeouts, 1);
        assert_eq!(status.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_caps_the_call_timeout() {
        let breaker = CircuitBreaker::new("menu-vendor", config());
        let result = breaker
            .call_within(Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
        assert_eq!(breaker.status().stats.timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_half_open_call_reopens_and_frees_its_slot() {
        let breaker = CircuitBreaker::new("inventory", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        let pending = breaker.call(std::future::pending::<Result<()>>());
        let outer = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(outer.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().stats.failed_requests, 4);

        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_trips_even_when_failures_are_interleaved() {
        let mut cfg = config();
        cfg.failure_threshold = 100;
        let breaker = CircuitBreaker::new("payments", cfg);
        for _ in 0..5 {
            succeed(&breaker).await.unwrap();
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(
            breaker
                .status()
                .stats
                .last_trip_reason
                .unwrap()
                .starts_with("error rate")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn high_latency_trips() {
        let mut cfg = config();
        cfg.failure_threshold = 100;
        cfg.error_rate_threshold = 1.1;
        cfg.latency_threshold_ms = 100;
        cfg.call_timeout_ms = 10_000;
        let breaker = CircuitBreaker::new("analytics", cfg);
        for _ in 0..4 {
            breaker
                .call(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_open_rejects_until_forced_close() {
        let breaker = CircuitBreaker::new("maintenance", config());
        breaker.force_open("db migration");
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(matches!(succeed(&breaker).await, Err(CoreError::CircuitOpen(_))));
        breaker.force_close("done");
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_thresholds_follow_traffic() {
        let cfg = CircuitBreakerConfig {
            adaptive: true,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("busy", cfg);
        for _ in 0..50 {
            succeed(&breaker).await.unwrap();
        }
        let status = breaker.status();
        assert_eq!(status.thresholds.failure_threshold, 7);
        assert_eq!(status.thresholds.latency_threshold_ms, 4_500);
        assert_eq!(status.stats.adaptive_adjustments, 1);
    }
}
