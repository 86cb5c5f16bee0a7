use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{PipelineDefaults, RetryConfig};
use crate::error::{CoreError, Result};
use crate::queue::{JobPriority, QueueName};
use crate::types::{PipelineId, RunId, SchoolId};

use super::error::PipelineError;
use super::schedule::CronSchedule;
use super::transform::{Transformer, TransformStep};

/// A single row flowing through a pipeline.
pub type Record = serde_json::Map<String, Value>;

/// Opaque resume position understood by the extractor that produced it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_offset(offset: u64) -> Self {
        Self(offset.to_string())
    }

    /// Parses a numeric cursor. Offsets are what the built-in connectors emit.
    pub fn offset(&self) -> Result<u64> {
        self.0
            .parse()
            .map_err(|_| CoreError::InvalidInput(format!("cursor '{}' is not an offset", self.0)))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Transform,
    Load,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Load => "load",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, waiting for a concurrency slot.
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Schedule,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Named dataset in the shared in-process registry.
    Memory { dataset: String },
    /// Newline-delimited JSON objects.
    JsonLines { path: PathBuf },
    /// Extractor registered on the connector factory under `name`.
    Custom { name: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    Memory {
        dataset: String,
    },
    JsonLines {
        path: PathBuf,
    },
    /// Each record becomes one job on `queue`.
    Queue {
        queue: QueueName,
        #[serde(default)]
        priority: JobPriority,
        /// Record field used as the job dedupe key.
        #[serde(default)]
        dedupe_field: Option<String>,
    },
    Custom {
        name: String,
    },
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: PipelineId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub school_id: Option<SchoolId>,
    pub source: SourceSpec,
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
    pub sink: SinkSpec,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub checkpoint_every: Option<u32>,
    /// Fail the transform phase when a batch rejects more than this share.
    #[serde(default)]
    pub max_reject_ratio: Option<f64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Five-field cron expression or `@hourly`/`@daily`/`@weekly`/`@monthly`.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl PipelineDefinition {
    pub fn new(
        id: impl Into<PipelineId>,
        name: impl Into<String>,
        source: SourceSpec,
        sink: SinkSpec,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            school_id: None,
            source,
            transforms: Vec::new(),
            sink,
            batch_size: None,
            checkpoint_every: None,
            max_reject_ratio: None,
            retry: None,
            schedule: None,
            enabled: true,
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<TransformStep>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_checkpoint_every(mut self, batches: u32) -> Self {
        self.checkpoint_every = Some(batches);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }

    pub fn for_school(mut self, school_id: SchoolId) -> Self {
        self.school_id = Some(school_id);
        self
    }

    /// Structural validation; connector availability is checked by the
    /// orchestrator at registration.
    pub fn validate(&self) -> Result<Option<CronSchedule>> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::InvalidInput("pipeline id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "pipeline '{}' must have a name",
                self.id
            )));
        }
        if self.batch_size == Some(0) {
            return Err(CoreError::InvalidInput("batch_size must be positive".into()));
        }
        if self.checkpoint_every == Some(0) {
            return Err(CoreError::InvalidInput(
                "checkpoint_every must be positive".into(),
            ));
        }
        if let Some(ratio) = self.max_reject_ratio
            && !(0.0..=1.0).contains(&ratio)
        {
            return Err(CoreError::InvalidInput(
                "max_reject_ratio must be within [0, 1]".into(),
            ));
        }
        if let Some(retry) = &self.retry
            && retry.max_attempts == 0
        {
            return Err(CoreError::InvalidInput(
                "retry.max_attempts must be positive".into(),
            ));
        }
        Transformer::validate(&self.transforms)?;
        self.schedule.as_deref().map(CronSchedule::parse).transpose()
    }

    pub fn effective_batch_size(&self, defaults: &PipelineDefaults) -> usize {
        self.batch_size.unwrap_or(defaults.batch_size).max(1)
    }

    pub fn effective_checkpoint_every(&self, defaults: &PipelineDefaults) -> u32 {
        self.checkpoint_every
            .unwrap_or(defaults.checkpoint_every)
            .max(1)
    }

    pub fn effective_retry(&self, defaults: &PipelineDefaults) -> RetryConfig {
        self.retry.unwrap_or(defaults.retry)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub batches: u64,
    pub extracted: u64,
    pub transformed: u64,
    /// Dropped by a filter step.
    pub filtered: u64,
    /// Failed a `require` or `cast` step.
    pub rejected: u64,
    pub loaded: u64,
    pub retries: u64,
    pub checkpoints: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resumed_from: Option<Cursor>,
    pub metrics: RunMetrics,
    pub error: Option<PipelineError>,
}

impl PipelineRun {
    pub fn pending(pipeline_id: PipelineId, run_id: RunId, trigger: RunTrigger) -> Self {
        Self {
            run_id,
            pipeline_id,
            trigger,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            resumed_from: None,
            metrics: RunMetrics::default(),
            error: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<PipelineError>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_definition() -> PipelineDefinition {
        PipelineDefinition::new(
            "menu-sync",
            "Menu sync",
            SourceSpec::Memory {
                dataset: "menus".into(),
            },
            SinkSpec::Memory {
                dataset: "menus_out".into(),
            },
        )
    }

    #[test]
    fn validation_rejects_bad_definitions() {
        assert!(memory_definition().validate().is_ok());

        let zero_batch = memory_definition().with_batch_size(0);
        assert!(matches!(zero_batch.validate(), Err(CoreError::InvalidInput(_))));

        let bad_cron = memory_definition().with_schedule("61 * * * *");
        assert!(matches!(bad_cron.validate(), Err(CoreError::InvalidInput(_))));

        let mut unnamed = memory_definition();
        unnamed.name = "  ".into();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn definitions_deserialize_from_toml_shaped_json() {
        let raw = serde_json::json!({
            "id": "orders-export",
            "name": "Orders export",
            "source": { "type": "json_lines", "path": "/tmp/orders.jsonl" },
            "sink": { "type": "queue", "queue": "notifications", "priority": "high" },
            "transforms": [
                { "step": "rename", "from": "qty", "to": "quantity" },
                { "step": "filter", "field": "qty", "op": "gt", "value": 0 },
                { "step": "require", "fields": ["order_id"] }
            ],
            "schedule": "@hourly"
        });
        let definition: PipelineDefinition = serde_json::from_value(raw).unwrap();
        assert!(definition.enabled);
        assert_eq!(definition.transforms.len(), 3);
        assert!(matches!(
            definition.sink,
            SinkSpec::Queue {
                priority: JobPriority::P1,
                ..
            }
        ));
        assert!(definition.validate().unwrap().is_some());
    }

    #[test]
    fn defaults_fill_unset_knobs() {
        let defaults = PipelineDefaults::default();
        let definition = memory_definition();
        assert_eq!(definition.effective_batch_size(&defaults), defaults.batch_size);
        assert_eq!(definition.effective_checkpoint_every(&defaults), 1);
        assert_eq!(definition.effective_retry(&defaults), defaults.retry);
    }
}
