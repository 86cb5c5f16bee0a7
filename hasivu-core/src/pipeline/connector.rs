use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use crate::error::{CoreError, Result};
use crate::queue::{EnqueueRequest, JobPriority, QueueName, QueueService};
use crate::types::SchoolId;

use super::model::{Cursor, Record, SinkSpec, SourceSpec};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractBatch {
    pub records: Vec<Record>,
    /// Position to resume from after this batch.
    pub next_cursor: Option<Cursor>,
    /// No records remain past `next_cursor`.
    pub exhausted: bool,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, cursor: Option<&Cursor>, limit: usize) -> Result<ExtractBatch>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub written: usize,
}

/// Loaders must tolerate a batch being delivered again after a retry.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, records: &[Record]) -> Result<LoadReport>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Named in-process datasets, shared between memory sources and sinks.
#[derive(Clone, Debug, Default)]
pub struct MemoryDatasets {
    inner: Arc<DashMap<String, Vec<Record>>>,
}

impl MemoryDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, records: Vec<Record>) {
        self.inner.insert(name.into(), records);
    }

    pub fn append(&self, name: &str, records: &[Record]) {
        self.inner
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(records);
    }

    pub fn get(&self, name: &str) -> Option<Vec<Record>> {
        self.inner.get(name).map(|records| records.clone())
    }

    pub fn len(&self, name: &str) -> usize {
        self.inner.get(name).map_or(0, |records| records.len())
    }

    pub fn remove(&self, name: &str) -> Option<Vec<Record>> {
        self.inner.remove(name).map(|(_, records)| records)
    }
}

#[derive(Debug)]
pub struct MemorySource {
    datasets: MemoryDatasets,
    dataset: String,
}

impl MemorySource {
    pub fn new(datasets: MemoryDatasets, dataset: impl Into<String>) -> Self {
        Self {
            datasets,
            dataset: dataset.into(),
        }
    }
}

#[async_trait]
impl Extractor for MemorySource {
    async fn extract(&self, cursor: Option<&Cursor>, limit: usize) -> Result<ExtractBatch> {
        let offset = cursor.map(Cursor::offset).transpose()?.unwrap_or(0) as usize;
        let rows = self
            .datasets
            .inner
            .get(&self.dataset)
            .ok_or_else(|| CoreError::NotFound(format!("dataset '{}'", self.dataset)))?;

        let start = offset.min(rows.len());
        let end = start.saturating_add(limit).min(rows.len());
        Ok(ExtractBatch {
            records: rows[start..end].to_vec(),
            next_cursor: Some(Cursor::from_offset(end as u64)),
            exhausted: end >= rows.len(),
        })
    }
}

#[derive(Debug)]
pub struct MemorySink {
    datasets: MemoryDatasets,
    dataset: String,
}

impl MemorySink {
    pub fn new(datasets: MemoryDatasets, dataset: impl Into<String>) -> Self {
        Self {
            datasets,
            dataset: dataset.into(),
        }
    }
}

#[async_trait]
impl Loader for MemorySink {
    async fn load(&self, records: &[Record]) -> Result<LoadReport> {
        self.datasets.append(&self.dataset, records);
        Ok(LoadReport {
            written: records.len(),
        })
    }
}

/// Reads newline-delimited JSON objects. The cursor is the byte offset of the
/// next unread line.
#[derive(Debug)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Extractor for JsonLinesSource {
    async fn extract(&self, cursor: Option<&Cursor>, limit: usize) -> Result<ExtractBatch> {
        let offset = cursor.map(Cursor::offset).transpose()?.unwrap_or(0);
        let file = File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).await?;

        let mut position = offset;
        let mut records = Vec::with_capacity(limit.min(1024));
        let mut line = String::new();
        let mut exhausted = false;

        while records.len() < limit {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                exhausted = true;
                break;
            }
            let line_start = position;
            position += read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed)? {
                Value::Object(record) => records.push(record),
                _ => {
                    return Err(CoreError::InvalidInput(format!(
                        "{}: line at byte {line_start} is not a JSON object",
                        self.path.display()
                    )));
                }
            }
        }

        if !exhausted {
            exhausted = reader.fill_buf().await?.is_empty();
        }

        Ok(ExtractBatch {
            records,
            next_cursor: Some(Cursor::from_offset(position)),
            exhausted,
        })
    }
}

/// Appends records as JSON lines.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Loader for JsonLinesSink {
    async fn load(&self, records: &[Record]) -> Result<LoadReport> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;

        Ok(LoadReport {
            written: records.len(),
        })
    }
}

/// Hands each record to the queue manager as a job payload.
pub struct QueueSink {
    queue: Arc<dyn QueueService>,
    name: QueueName,
    priority: JobPriority,
    school_id: SchoolId,
    dedupe_field: Option<String>,
}

impl fmt::Debug for QueueSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSink")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("school_id", &self.school_id)
            .field("dedupe_field", &self.dedupe_field)
            .finish()
    }
}

impl QueueSink {
    pub fn new(
        queue: Arc<dyn QueueService>,
        name: QueueName,
        priority: JobPriority,
        school_id: SchoolId,
        dedupe_field: Option<String>,
    ) -> Self {
        Self {
            queue,
            name,
            priority,
            school_id,
            dedupe_field,
        }
    }

    fn request_for(&self, record: &Record) -> EnqueueRequest {
        let mut request = EnqueueRequest::new(self.name.clone(), Value::Object(record.clone()))
            .for_school(self.school_id)
            .with_priority(self.priority);
        if let Some(field) = &self.dedupe_field
            && let Some(value) = record.get(field).filter(|value| !value.is_null())
        {
            let key = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.with_dedupe_key(key);
        }
        request
    }
}

#[async_trait]
impl Loader for QueueSink {
    async fn load(&self, records: &[Record]) -> Result<LoadReport> {
        let requests = records.iter().map(|record| self.request_for(record)).collect();
        let handles = self.queue.enqueue_many(requests).await?;
        Ok(LoadReport {
            written: handles.len(),
        })
    }
}

/// Resolves source and sink specs into connector instances.
#[derive(Clone, Default)]
pub struct ConnectorFactory {
    datasets: MemoryDatasets,
    queue: Option<Arc<dyn QueueService>>,
    extractors: Arc<DashMap<String, Arc<dyn Extractor>>>,
    loaders: Arc<DashMap<String, Arc<dyn Loader>>>,
}

impl fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("datasets", &self.datasets.inner.len())
            .field("queue", &self.queue.is_some())
            .field("custom_extractors", &self.extractors.len())
            .field("custom_loaders", &self.loaders.len())
            .finish()
    }
}

impl ConnectorFactory {
    pub fn new(datasets: MemoryDatasets) -> Self {
        Self {
            datasets,
            ..Self::default()
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueService>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn datasets(&self) -> &MemoryDatasets {
        &self.datasets
    }

    pub fn register_extractor(&self, name: impl Into<String>, extractor: Arc<dyn Extractor>) {
        self.extractors.insert(name.into(), extractor);
    }

    pub fn register_loader(&self, name: impl Into<String>, loader: Arc<dyn Loader>) {
        self.loaders.insert(name.into(), loader);
    }

    /// Checks that both ends of a pipeline can be built.
    pub fn validate(&self, source: &SourceSpec, sink: &SinkSpec) -> Result<()> {
        if let SourceSpec::Custom { name } = source
            && !self.extractors.contains_key(name)
        {
            return Err(CoreError::InvalidInput(format!("unknown extractor '{name}'")));
        }
        match sink {
            SinkSpec::Queue { .. } if self.queue.is_none() => Err(CoreError::InvalidInput(
                "queue sink requires a queue service".into(),
            )),
            SinkSpec::Custom { name } if !self.loaders.contains_key(name) => {
                Err(CoreError::InvalidInput(format!("unknown loader '{name}'")))
            }
            _ => Ok(()),
        }
    }

    pub fn extractor(&self, spec: &SourceSpec) -> Result<Arc<dyn Extractor>> {
        Ok(match spec {
            SourceSpec::Memory { dataset } => {
                Arc::new(MemorySource::new(self.datasets.clone(), dataset.clone()))
            }
            SourceSpec::JsonLines { path } => Arc::new(JsonLinesSource::new(path.clone())),
            SourceSpec::Custom { name } => self
                .extractors
                .get(name)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| CoreError::NotFound(format!("extractor '{name}'")))?,
        })
    }

    pub fn loader(&self, spec: &SinkSpec, school_id: Option<SchoolId>) -> Result<Arc<dyn Loader>> {
        Ok(match spec {
            SinkSpec::Memory { dataset } => {
                Arc::new(MemorySink::new(self.datasets.clone(), dataset.clone()))
            }
            SinkSpec::JsonLines { path } => Arc::new(JsonLinesSink::new(path.clone())),
            SinkSpec::Queue {
                queue,
                priority,
                dedupe_field,
            } => {
                let service = self.queue.clone().ok_or_else(|| {
                    CoreError::InvalidInput("queue sink requires a queue service".into())
                })?;
                Arc::new(QueueSink::new(
                    service,
                    queue.clone(),
                    *priority,
                    school_id.unwrap_or_default(),
                    dedupe_field.clone(),
                ))
            }
            SinkSpec::Custom { name } => self
                .loaders
                .get(name)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| CoreError::NotFound(format!("loader '{name}'")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::config::RetryConfig;
    use crate::queue::InMemoryQueue;

    fn rows(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn memory_source_pages_with_offsets() {
        let datasets = MemoryDatasets::new();
        datasets.insert("students", rows(5));
        let source = MemorySource::new(datasets, "students");

        let first = source.extract(None, 3).await.unwrap();
        assert_eq!(first.records.len(), 3);
        assert!(!first.exhausted);

        let second = source
            .extract(first.next_cursor.as_ref(), 3)
            .await
            .unwrap();
        assert_eq!(second.records.len(), 2);
        assert!(second.exhausted);
        assert_eq!(second.records[0]["id"], json!(3));
    }

    #[tokio::test]
    async fn missing_dataset_is_not_found() {
        let source = MemorySource::new(MemoryDatasets::new(), "nope");
        assert!(matches!(
            source.extract(None, 10).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn json_lines_round_trip_through_sink_and_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/orders.jsonl");
        let sink = JsonLinesSink::new(&path);
        sink.load(&rows(3)).await.unwrap();
        sink.load(&rows(2)).await.unwrap();

        let source = JsonLinesSource::new(&path);
        let first = source.extract(None, 4).await.unwrap();
        assert_eq!(first.records.len(), 4);
        assert!(!first.exhausted);

        let rest = source.extract(first.next_cursor.as_ref(), 4).await.unwrap();
        assert_eq!(rest.records.len(), 1);
        assert!(rest.exhausted);
        assert_eq!(rest.records[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn json_lines_rejects_non_objects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        tokio::fs::write(&path, "{\"ok\":1}\n[1,2]\n").await.unwrap();
        let source = JsonLinesSource::new(&path);
        assert!(matches!(
            source.extract(None, 10).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn queue_sink_enqueues_with_dedupe_keys() {
        let queue = Arc::new(InMemoryQueue::new(RetryConfig::default()));
        let name = QueueName::new("notifications").unwrap();
        let sink = QueueSink::new(
            queue.clone(),
            name.clone(),
            JobPriority::P1,
            SchoolId::new(),
            Some("id".into()),
        );

        let mut batch = rows(2);
        batch.extend(rows(1));
        let report = sink.load(&batch).await.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(queue.queue_depth(&name).await.unwrap(), 2);
    }

    #[test]
    fn factory_validates_queue_sinks() {
        let factory = ConnectorFactory::new(MemoryDatasets::new());
        let source = SourceSpec::Memory {
            dataset: "a".into(),
        };
        let sink = SinkSpec::Queue {
            queue: QueueName::new("jobs").unwrap(),
            priority: JobPriority::P2,
            dedupe_field: None,
        };
        assert!(factory.validate(&source, &sink).is_err());

        let factory = factory.with_queue(Arc::new(InMemoryQueue::new(RetryConfig::default())));
        assert!(factory.validate(&source, &sink).is_ok());
    }
}
