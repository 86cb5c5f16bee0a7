use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::PriorityWeights,
    error::{CoreError, Result},
    types::SchoolId,
};

/// Unique identifier for queued jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Name of a logical queue, e.g. `notifications` or `etl.load`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 128
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(CoreError::InvalidInput(format!(
                "invalid queue name '{name}'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for QueueName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        QueueName::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl FromStr for QueueName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        QueueName::new(s)
    }
}

/// Priority bands. `P0` is critical work and always drains first.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum JobPriority {
    #[serde(alias = "critical")]
    P0 = 0,
    #[serde(alias = "high")]
    P1 = 1,
    #[default]
    #[serde(alias = "normal")]
    P2 = 2,
    #[serde(alias = "low")]
    P3 = 3,
}

impl JobPriority {
    pub fn weight(&self, weights: &PriorityWeights) -> u8 {
        match self {
            JobPriority::P0 => weights.p0,
            JobPriority::P1 => weights.p1,
            JobPriority::P2 => weights.p2,
            JobPriority::P3 => weights.p3,
        }
    }

    pub fn elevate(self, target: JobPriority) -> JobPriority {
        if target as u8 <= self as u8 {
            target
        } else {
            self
        }
    }

    pub fn all() -> &'static [Self] {
        &[JobPriority::P0, JobPriority::P1, JobPriority::P2, JobPriority::P3]
    }
}

impl FromStr for JobPriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "p0" | "critical" => Ok(JobPriority::P0),
            "p1" | "high" => Ok(JobPriority::P1),
            "p2" | "normal" => Ok(JobPriority::P2),
            "p3" | "low" => Ok(JobPriority::P3),
            other => Err(CoreError::InvalidInput(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Scheduler-visible job states. Ready/Leased map directly to queue presence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    /// Enqueued with a delay; becomes ready at `available_at`.
    Deferred,
    Leased,
    Completed,
    /// Last attempt failed; waiting out its backoff before the next attempt.
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Ready | JobState::Deferred | JobState::Leased | JobState::Failed
        )
    }
}

/// Request to place a job on a named queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub queue: QueueName,
    #[serde(default)]
    pub school_id: SchoolId,
    #[serde(default)]
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// Fold into an active job with the same dedupe key instead of adding a new one.
    #[serde(default = "default_allow_merge")]
    pub allow_merge: bool,
    #[serde(default)]
    pub max_attempts: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

fn default_allow_merge() -> bool {
    true
}

impl EnqueueRequest {
    pub fn new(queue: QueueName, payload: serde_json::Value) -> Self {
        Self {
            queue,
            school_id: SchoolId::PLATFORM,
            priority: JobPriority::default(),
            payload,
            dedupe_key: None,
            allow_merge: true,
            max_attempts: None,
            delay_ms: None,
            correlation_id: None,
        }
    }

    pub fn for_school(mut self, school_id: SchoolId) -> Self {
        self.school_id = school_id;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn without_merge(mut self) -> Self {
        self.allow_merge = false;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Result of an enqueue call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub queue: QueueName,
    pub school_id: SchoolId,
    pub priority: JobPriority,
    pub dedupe_key: Option<String>,
    /// False when the request was folded into an existing job.
    pub accepted: bool,
    pub merged_into: Option<JobId>,
}

impl JobHandle {
    pub fn accepted(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            queue: record.queue.clone(),
            school_id: record.school_id,
            priority: record.priority,
            dedupe_key: record.dedupe_key.clone(),
            accepted: true,
            merged_into: None,
        }
    }

    pub fn merged(existing: &JobRecord) -> Self {
        Self {
            job_id: existing.id,
            queue: existing.queue.clone(),
            school_id: existing.school_id,
            priority: existing.priority,
            dedupe_key: existing.dedupe_key.clone(),
            accepted: false,
            merged_into: Some(existing.id),
        }
    }
}

/// Envelope stored by the queue for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: QueueName,
    pub school_id: SchoolId,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts: u16,
    pub max_attempts: u16,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub correlation_id: Uuid,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Builds the stored envelope. Delays above `max_delay` are rejected.
    pub fn new(
        request: EnqueueRequest,
        default_max_attempts: u16,
        max_delay: Duration,
    ) -> Result<Self> {
        let now = Utc::now();
        let (state, available_at) = match request.delay_ms.filter(|ms| *ms > 0) {
            None => (JobState::Ready, now),
            Some(ms) => {
                let delay = Duration::from_millis(ms);
                if delay > max_delay {
                    return Err(CoreError::InvalidInput(format!(
                        "delay of {ms}ms exceeds the maximum of {}ms",
                        max_delay.as_millis()
                    )));
                }
                let available_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| {
                        CoreError::InvalidInput(format!("delay of {ms}ms is out of range"))
                    })?;
                (JobState::Deferred, available_at)
            }
        };
        Ok(Self {
            id: JobId::new(),
            queue: request.queue,
            school_id: request.school_id,
            payload: request.payload,
            priority: request.priority,
            state,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            available_at,
            lease_owner: None,
            lease_expires_at: None,
            dedupe_key: request.dedupe_key,
            correlation_id: request.correlation_id.unwrap_or_else(Uuid::now_v7),
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Key used for events and idempotency checks.
    pub fn idempotency_key(&self) -> String {
        self.dedupe_key
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.queue, self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevate_keeps_the_more_urgent_priority() {
        assert_eq!(JobPriority::P2.elevate(JobPriority::P0), JobPriority::P0);
        assert_eq!(JobPriority::P1.elevate(JobPriority::P3), JobPriority::P1);
    }

    #[test]
    fn priority_parses_names_and_bands() {
        assert_eq!("critical".parse::<JobPriority>().unwrap(), JobPriority::P0);
        assert_eq!("P3".parse::<JobPriority>().unwrap(), JobPriority::P3);
        assert!("urgent".parse::<JobPriority>().is_err());
    }

    #[test]
    fn queue_names_reject_whitespace() {
        assert!(QueueName::new("etl.load").is_ok());
        assert!(QueueName::new("bad name").is_err());
        assert!(QueueName::new("").is_err());
    }

    #[test]
    fn delayed_requests_start_deferred() {
        let queue = QueueName::new("notifications").unwrap();
        let record = JobRecord::new(
            EnqueueRequest::new(queue, serde_json::json!({}))
                .delayed(Duration::from_secs(5)),
            5,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(record.state, JobState::Deferred);
        assert!(record.available_at > record.created_at);
    }

    #[test]
    fn oversized_delays_are_rejected() {
        let queue = QueueName::new("notifications").unwrap();
        let mut request = EnqueueRequest::new(queue, serde_json::json!({}));
        request.delay_ms = Some(u64::MAX);
        let err = JobRecord::new(request.clone(), 5, Duration::MAX).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        request.delay_ms = Some(120_000);
        let err = JobRecord::new(request, 5, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn queue_names_are_validated_when_deserialized() {
        let ok: QueueName = serde_json::from_str("\"etl.load\"").unwrap();
        assert_eq!(ok.as_str(), "etl.load");
        assert!(serde_json::from_str::<QueueName>("\"bad name\"").is_err());
        assert!(serde_json::from_value::<EnqueueRequest>(serde_json::json!({
            "queue": "",
            "payload": {}
        }))
        .is_err());
    }
}
