//! Request and response bodies of the control-plane API.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hasivu_core::{
    integration::{ComponentReport, HealthStatus},
    monitoring::{AnomalyAlert, DetectionStats, MetricBaseline, MetricSample},
    queue::{EnqueueRequest, JobPriority, QueueName, QueueSnapshot, SchoolLoad},
    resilience::SystemCircuitStatus,
    types::{RunId, SchoolId},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(error),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ===== Health =====

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checked_at: chrono::DateTime<chrono::Utc>,
    pub components: Vec<ComponentReport>,
    pub circuits: SystemCircuitStatus,
}

// ===== Queues =====

/// Job submission; the queue comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueJobBody {
    #[serde(default)]
    pub school_id: Option<SchoolId>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub allow_merge: Option<bool>,
    #[serde(default)]
    pub max_attempts: Option<u16>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl EnqueueJobBody {
    pub fn into_request(self, queue: QueueName) -> EnqueueRequest {
        let mut request = EnqueueRequest::new(queue, self.payload);
        if let Some(school_id) = self.school_id {
            request = request.for_school(school_id);
        }
        if let Some(priority) = self.priority {
            request = request.with_priority(priority);
        }
        if let Some(key) = self.dedupe_key {
            request = request.with_dedupe_key(key);
        }
        if self.allow_merge == Some(false) {
            request = request.without_merge();
        }
        if let Some(max_attempts) = self.max_attempts {
            request = request.with_max_attempts(max_attempts);
        }
        if let Some(correlation_id) = self.correlation_id {
            request = request.with_correlation_id(correlation_id);
        }
        request.delay_ms = self.delay_ms;
        request
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsResponse {
    #[serde(flatten)]
    pub snapshot: QueueSnapshot,
    pub total_dead_letters: usize,
    pub running_queues: Vec<QueueName>,
    /// Leased and reserved jobs per school on each running queue.
    pub school_load: BTreeMap<QueueName, HashMap<SchoolId, SchoolLoad>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub queue: QueueName,
    pub purged: usize,
}

// ===== Pipelines =====

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerQuery {
    /// Run inline and return the finished run instead of its id.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: RunId,
}

// ===== Circuit breakers =====

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CircuitOverrideBody {
    #[serde(default)]
    pub reason: Option<String>,
}

// ===== Monitoring =====

#[derive(Debug, Clone, Deserialize)]
pub struct DetectRequest {
    pub samples: Vec<MetricSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectResponse {
    pub alerts: Vec<AnomalyAlert>,
    pub statistics: DetectionStats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub false_positive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRequest {
    pub service: String,
    pub metric: String,
    pub baseline: MetricBaseline,
}
