use async_trait::async_trait;
use serde_json::{Map, Value};

/// Ingestion lifecycle stages, emitted in order as a document moves through
/// the pipeline. `Failed` can follow any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Started,
    Validating,
    Extracting,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Started => "started",
            IngestStage::Validating => "validating",
            IngestStage::Extracting => "extracting",
            IngestStage::Chunking => "chunking",
            IngestStage::Embedding => "embedding",
            IngestStage::Storing => "storing",
            IngestStage::Completed => "completed",
            IngestStage::Failed => "failed",
        }
    }

    /// Coarse percent-complete for transports that render a progress bar.
    /// `Failed` reports `None`: the transport keeps whatever it last showed.
    pub fn percent(&self) -> Option<u8> {
        match self {
            IngestStage::Started => Some(0),
            IngestStage::Validating => Some(10),
            IngestStage::Extracting => Some(25),
            IngestStage::Chunking => Some(45),
            IngestStage::Embedding => Some(65),
            IngestStage::Storing => Some(85),
            IngestStage::Completed => Some(100),
            IngestStage::Failed => None,
        }
    }
}

/// Rebuild lifecycle stages. `Processing` repeats once per batch; its event
/// data carries the running chunk and document totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStage {
    Started,
    Initializing,
    Counting,
    Processing,
    Finalizing,
    Completed,
    Failed,
}

impl RebuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildStage::Started => "started",
            RebuildStage::Initializing => "initializing",
            RebuildStage::Counting => "counting",
            RebuildStage::Processing => "processing",
            RebuildStage::Finalizing => "finalizing",
            RebuildStage::Completed => "completed",
            RebuildStage::Failed => "failed",
        }
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            RebuildStage::Started => Some(0),
            RebuildStage::Initializing => Some(5),
            RebuildStage::Counting => Some(10),
            RebuildStage::Processing => Some(10),
            RebuildStage::Finalizing => Some(95),
            RebuildStage::Completed => Some(100),
            RebuildStage::Failed => None,
        }
    }
}

/// One progress event. The stage name and percent come from the stage enums;
/// `data` carries structured extras (chunk counts, document ids, error text).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: &'static str,
    pub percent: Option<u8>,
    pub message: String,
    pub data: Map<String, Value>,
}

impl ProgressEvent {
    pub fn ingest(stage: IngestStage, message: impl Into<String>) -> Self {
        Self {
            stage: stage.as_str(),
            percent: stage.percent(),
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn rebuild(stage: RebuildStage, message: impl Into<String>) -> Self {
        Self {
            stage: stage.as_str(),
            percent: stage.percent(),
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// The only coupling point between the pipelines and any progress transport.
/// SSE, websockets, or polling endpoints subscribe by implementing this;
/// the pipelines themselves never know how events leave the process.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_event(&self, event: ProgressEvent);
}

/// Observer that drops every event. Default when nobody is watching.
pub struct NoopObserver;

#[async_trait]
impl ProgressObserver for NoopObserver {
    async fn on_event(&self, _event: ProgressEvent) {}
}

/// Observer that forwards events to the process log.
pub struct TracingObserver;

#[async_trait]
impl ProgressObserver for TracingObserver {
    async fn on_event(&self, event: ProgressEvent) {
        match event.percent {
            Some(percent) => tracing::info!(
                stage = event.stage,
                percent,
                data = %serde_json::Value::Object(event.data.clone()),
                "{}",
                event.message
            ),
            None => tracing::warn!(
                stage = event.stage,
                data = %serde_json::Value::Object(event.data.clone()),
                "{}",
                event.message
            ),
        }
    }
}
