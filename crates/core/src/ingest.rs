use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunking::Chunker;
use crate::error::{PipelineError, StoreError};
use crate::extractor::{extract_text, normalize_text};
use crate::index::{entry_id, ChunkIndex, IndexEntry};
use crate::models::{
    ChunkRecord, Document, DocumentLifecycle, DocumentStatus, DocumentType, ProcessingReport,
    UploadReceipt,
};
use crate::progress::{IngestStage, ProgressEvent, ProgressObserver};
use crate::traits::DocumentStore;

/// First characters of extracted text persisted on the document row.
const PREVIEW_CHARS: usize = 5000;

/// A submitted upload: the receipt the caller gets immediately, plus the
/// handle of the detached processing task for anyone who needs to await
/// completion (tests, single-shot CLI runs). Dropping the handle leaves the
/// task running.
#[derive(Debug)]
pub struct IngestSubmission {
    pub receipt: UploadReceipt,
    pub task: JoinHandle<()>,
}

/// Upload-to-index pipeline: validate, register, then extract, chunk, embed,
/// and store in a background task while the caller already holds a receipt.
///
/// Durable chunk rows are written before the vector upsert, so an index that
/// dies mid-flight can always be rebuilt from the rows.
#[derive(Clone)]
pub struct IngestPipeline {
    documents: Arc<dyn DocumentStore>,
    index: Arc<ChunkIndex>,
    chunker: Chunker,
    observer: Arc<dyn ProgressObserver>,
}

impl IngestPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<ChunkIndex>,
        chunker: Chunker,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            documents,
            index,
            chunker,
            observer,
        }
    }

    /// Validate and register an upload, then hand the heavy work to a
    /// detached task. Returns while extraction is still running; the
    /// document row is already persisted with `Processing` status.
    pub async fn submit(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        tenant_id: &str,
    ) -> Result<IngestSubmission, PipelineError> {
        self.emit(ProgressEvent::ingest(
            IngestStage::Started,
            format!("upload received: {filename}"),
        ))
        .await;
        self.emit(ProgressEvent::ingest(IngestStage::Validating, "validating upload"))
            .await;

        if filename.trim().is_empty() {
            return Err(self
                .reject_upload(PipelineError::Validation("filename must not be empty".into()))
                .await);
        }
        if bytes.is_empty() {
            return Err(self
                .reject_upload(PipelineError::Validation("uploaded file is empty".into()))
                .await);
        }

        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            filename: safe_filename(filename),
            original_filename: filename.to_string(),
            size_bytes: bytes.len() as u64,
            doc_type: DocumentType::from_filename(filename),
            status: DocumentStatus::Processing,
            lifecycle: DocumentLifecycle::Active,
            chunk_count: 0,
            text_preview: None,
            error_message: None,
            uploaded_at: now,
            processed_at: None,
            updated_at: now,
        };
        self.documents.insert_document(&document).await?;
        info!(document_id = %document.id, tenant_id, filename, "upload registered");

        let receipt = UploadReceipt {
            document_id: document.id,
            filename: filename.to_string(),
            status: DocumentStatus::Processing,
        };
        let pipeline = self.clone();
        let task = tokio::spawn(async move {
            pipeline.process(document, bytes).await;
        });

        Ok(IngestSubmission { receipt, task })
    }

    async fn reject_upload(&self, error: PipelineError) -> PipelineError {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(error.to_string()));
        self.emit(ProgressEvent::ingest(IngestStage::Failed, "upload rejected").with_data(data))
            .await;
        error
    }

    async fn process(&self, mut document: Document, bytes: Vec<u8>) {
        let document_id = document.id;
        match self.run_stages(&mut document, bytes).await {
            Ok(chunk_count) => {
                let mut data = Map::new();
                data.insert("document_id".to_string(), Value::String(document_id.to_string()));
                data.insert("chunk_count".to_string(), Value::from(chunk_count));
                self.emit(
                    ProgressEvent::ingest(
                        IngestStage::Completed,
                        format!("document processed into {chunk_count} chunks"),
                    )
                    .with_data(data),
                )
                .await;
            }
            Err(pipeline_error) => {
                error!(document_id = %document_id, error = %pipeline_error, "ingestion failed");
                document.status = DocumentStatus::Failed;
                document.error_message = Some(pipeline_error.to_string());
                document.processed_at = Some(Utc::now());
                document.updated_at = Utc::now();
                if let Err(store_error) = self.documents.update_document(&document).await {
                    error!(
                        document_id = %document_id,
                        error = %store_error,
                        "failed to persist the failure status"
                    );
                }
                let mut data = Map::new();
                data.insert("document_id".to_string(), Value::String(document_id.to_string()));
                data.insert("error".to_string(), Value::String(pipeline_error.to_string()));
                self.emit(
                    ProgressEvent::ingest(IngestStage::Failed, "document processing failed")
                        .with_data(data),
                )
                .await;
            }
        }
    }

    async fn run_stages(
        &self,
        document: &mut Document,
        bytes: Vec<u8>,
    ) -> Result<usize, PipelineError> {
        self.emit(ProgressEvent::ingest(IngestStage::Extracting, "extracting text"))
            .await;
        let filename = document.original_filename.clone();
        // PDF parsing is CPU-bound, keep it off the async workers.
        let raw = tokio::task::spawn_blocking(move || extract_text(&bytes, &filename))
            .await
            .map_err(|join_error| PipelineError::Task(join_error.to_string()))??;
        let normalized = normalize_text(&raw);

        self.emit(ProgressEvent::ingest(IngestStage::Chunking, "splitting text into chunks"))
            .await;
        let chunks = self.chunker.chunk(&normalized, document.doc_type.as_str())?;

        let now = Utc::now();
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .map(|chunk| ChunkRecord {
                id: Uuid::new_v4(),
                document_id: document.id,
                tenant_id: document.tenant_id.clone(),
                seq_index: chunk.index,
                content: chunk.content.clone(),
                word_count: chunk.word_count,
                char_count: chunk.char_count,
                metadata: chunk.metadata(),
                embedding_ref: Some(entry_id(&document.id.to_string(), chunk.index)),
                created_at: now,
            })
            .collect();
        // Durable rows land before the vector upsert on purpose.
        self.documents.insert_chunks(&records).await?;

        self.emit(ProgressEvent::ingest(
            IngestStage::Embedding,
            format!("embedding {} chunks", chunks.len()),
        ))
        .await;
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .map(|chunk| IndexEntry {
                seq_index: chunk.index,
                text: chunk.content.clone(),
                metadata: chunk.metadata(),
            })
            .collect();
        self.index
            .upsert(
                &document.tenant_id,
                &document.id.to_string(),
                &document.filename,
                entries,
            )
            .await?;

        self.emit(ProgressEvent::ingest(IngestStage::Storing, "finalizing document record"))
            .await;
        document.status = DocumentStatus::Completed;
        document.chunk_count = chunks.len();
        document.text_preview = Some(normalized.chars().take(PREVIEW_CHARS).collect());
        document.processed_at = Some(Utc::now());
        document.updated_at = Utc::now();
        self.documents.update_document(document).await?;

        info!(document_id = %document.id, chunks = chunks.len(), "document processed");
        Ok(chunks.len())
    }

    /// Soft delete: vector entries go away, durable rows stay. The document
    /// disappears from listings and retrieval, and the rebuild path skips it.
    pub async fn delete_document(&self, tenant_id: &str, document_id: Uuid) -> Result<(), PipelineError> {
        let mut document = self.owned_document(tenant_id, document_id).await?;
        // Vector entries first: if this fails the document stays visible and
        // the delete can be retried.
        self.index
            .delete_document(tenant_id, &document_id.to_string())
            .await?;
        document.lifecycle = DocumentLifecycle::Deleted;
        document.updated_at = Utc::now();
        self.documents.update_document(&document).await?;
        info!(document_id = %document_id, tenant_id, "document soft-deleted");
        Ok(())
    }

    pub async fn get_document(&self, tenant_id: &str, document_id: Uuid) -> Result<Document, PipelineError> {
        self.owned_document(tenant_id, document_id).await
    }

    pub async fn list_documents(
        &self,
        tenant_id: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Document>, PipelineError> {
        Ok(self.documents.list_documents(tenant_id, skip, limit).await?)
    }

    pub async fn processing_status(
        &self,
        tenant_id: &str,
        document_id: Uuid,
    ) -> Result<ProcessingReport, PipelineError> {
        let document = self.owned_document(tenant_id, document_id).await?;
        Ok(ProcessingReport {
            document_id: document.id,
            status: document.status,
            progress: if document.status == DocumentStatus::Completed { 100 } else { 0 },
            chunks_processed: document.chunk_count,
            error_message: document.error_message,
        })
    }

    /// Fetch a document while enforcing tenant ownership. Foreign and
    /// soft-deleted documents are indistinguishable from missing ones.
    async fn owned_document(&self, tenant_id: &str, document_id: Uuid) -> Result<Document, PipelineError> {
        match self.documents.get_document(document_id).await? {
            Some(document)
                if document.tenant_id == tenant_id
                    && document.lifecycle == DocumentLifecycle::Active =>
            {
                Ok(document)
            }
            _ => Err(StoreError::NotFound(format!("document {document_id}")).into()),
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        self.observer.on_event(event).await;
    }
}

/// Filesystem- and payload-safe name: spaces and path separators collapse to
/// underscores.
fn safe_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// Recursively find ingestable files (pdf, txt, md) under a folder, sorted
/// for deterministic processing order.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder).into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                ext.eq_ignore_ascii_case("pdf")
                    || ext.eq_ignore_ascii_case("txt")
                    || ext.eq_ignore_ascii_case("md")
            });

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}
