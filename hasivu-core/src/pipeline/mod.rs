//! Data-flow orchestration: batch extract → transform → load runs with
//! per-phase retry, checkpoint/resume and cron scheduling.

pub mod checkpoint;
pub mod connector;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod schedule;
pub mod transform;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use connector::{
    ConnectorFactory, ExtractBatch, Extractor, JsonLinesSink, JsonLinesSource, LoadReport, Loader,
    MemoryDatasets, MemorySink, MemorySource, QueueSink,
};
pub use error::{ErrorKind, PipelineError, classify_message, is_retryable_message};
pub use model::{
    Cursor, Phase, PipelineDefinition, PipelineRun, Record, RunMetrics, RunStatus, RunTrigger,
    SinkSpec, SourceSpec,
};
pub use orchestrator::{DataFlowOrchestrator, PipelineSummary};
pub use schedule::CronSchedule;
pub use transform::{CastType, FilterOp, Rejection, TransformOutput, TransformStep, Transformer};
