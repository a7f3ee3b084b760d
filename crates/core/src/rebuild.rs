//! Re-index the vector collection from the durable chunk rows.
//!
//! A rebuild drops the whole collection and replays chunk rows from the
//! metadata store, so it repairs drift, dimension changes, and lost vectors.
//! Per-document problems are recorded in the report; only setup and paging
//! failures abort the run.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RebuildError;
use crate::index::{ChunkIndex, IndexEntry};
use crate::models::{ChunkRecord, DocumentLifecycle, RebuildReport};
use crate::progress::{ProgressEvent, ProgressObserver, RebuildStage};
use crate::traits::{ChunkScope, DocumentStore};

const DEFAULT_BATCH_SIZE: usize = 100;

/// What to replay. Both fields unset means everything in the store.
#[derive(Debug, Clone, Default)]
pub struct RebuildScope {
    pub tenant_id: Option<String>,
    pub document_id: Option<Uuid>,
}

/// Chunks of the document currently being replayed. Entries never mix
/// documents because entry ids are derived per document.
struct OpenDocument {
    document_id: Uuid,
    tenant_id: String,
    source: String,
    entries: Vec<IndexEntry>,
}

pub struct RebuildOrchestrator {
    documents: Arc<dyn DocumentStore>,
    index: Arc<ChunkIndex>,
    batch_size: usize,
    observer: Arc<dyn ProgressObserver>,
}

impl RebuildOrchestrator {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<ChunkIndex>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            documents,
            index,
            batch_size: DEFAULT_BATCH_SIZE,
            observer,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Drop the collection and replay every chunk row in scope.
    ///
    /// Destructive: the drop is global even when the scope is not, so a
    /// tenant-scoped rebuild leaves only that tenant's entries behind.
    /// Documents missing from the store are reported as errors, soft-deleted
    /// ones are skipped, and a failed upsert batch is recorded without
    /// stopping the run.
    pub async fn rebuild(&self, scope: RebuildScope) -> Result<RebuildReport, RebuildError> {
        let started = Instant::now();
        self.emit(ProgressEvent::rebuild(
            RebuildStage::Started,
            "rebuild requested",
        ))
        .await;
        info!(?scope, "rebuilding vector index from chunk rows");

        if let Err(error) = self.index.drop_collection().await {
            self.fail(&error.to_string()).await;
            return Err(error.into());
        }
        if let Err(error) = self.index.ensure_ready().await {
            self.fail(&error.to_string()).await;
            return Err(error.into());
        }
        self.emit(ProgressEvent::rebuild(
            RebuildStage::Initializing,
            "collection recreated empty",
        ))
        .await;

        let chunk_scope = match self.chunk_scope(&scope).await {
            Ok(chunk_scope) => chunk_scope,
            Err(error) => {
                self.fail(&error.to_string()).await;
                return Err(error.into());
            }
        };
        let chunks_total = match self.documents.count_chunks(&chunk_scope).await {
            Ok(total) => total,
            Err(error) => {
                self.fail(&error.to_string()).await;
                return Err(error.into());
            }
        };
        let mut data = Map::new();
        data.insert("chunks_total".to_string(), Value::from(chunks_total));
        self.emit(
            ProgressEvent::rebuild(
                RebuildStage::Counting,
                format!("{chunks_total} chunk rows in scope"),
            )
            .with_data(data),
        )
        .await;

        let mut report = RebuildReport {
            chunks_total,
            chunks_indexed: 0,
            documents_seen: 0,
            documents_skipped: 0,
            errors: Vec::new(),
            duration_ms: 0,
            final_entity_count: None,
        };

        if chunks_total == 0 {
            return Ok(self.finish(report, started).await);
        }

        let mut skip = 0;
        let mut open: Option<OpenDocument> = None;
        let mut skipping: Option<Uuid> = None;
        loop {
            let page = match self
                .documents
                .chunks_by_document(&chunk_scope, skip, self.batch_size)
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    self.fail(&error.to_string()).await;
                    return Err(error.into());
                }
            };
            if page.is_empty() {
                break;
            }
            skip += page.len();

            for record in page {
                let current = open.as_ref().map(|doc| doc.document_id);
                if current != Some(record.document_id) && skipping != Some(record.document_id) {
                    if let Some(done) = open.take() {
                        self.flush(done, &mut report).await;
                    }
                    match self.open_document(&record, &mut report).await {
                        Ok(next) => {
                            if next.is_none() {
                                skipping = Some(record.document_id);
                            }
                            open = next;
                        }
                        Err(error) => {
                            self.fail(&error.to_string()).await;
                            return Err(error.into());
                        }
                    }
                }
                if let Some(doc) = &mut open {
                    doc.entries.push(index_entry(&record));
                    if doc.entries.len() >= self.batch_size {
                        let entries = std::mem::take(&mut doc.entries);
                        let full = OpenDocument {
                            document_id: doc.document_id,
                            tenant_id: doc.tenant_id.clone(),
                            source: doc.source.clone(),
                            entries,
                        };
                        self.flush(full, &mut report).await;
                    }
                }
            }
        }
        if let Some(done) = open.take() {
            self.flush(done, &mut report).await;
        }

        self.emit(ProgressEvent::rebuild(
            RebuildStage::Finalizing,
            "verifying entity count",
        ))
        .await;
        Ok(self.finish(report, started).await)
    }

    /// Resolve the rebuild scope to concrete document ids. A tenant scope
    /// covers every document the tenant ever uploaded, whatever its
    /// lifecycle; the per-document fate check decides what to skip.
    async fn chunk_scope(&self, scope: &RebuildScope) -> Result<ChunkScope, RebuildError> {
        if let Some(document_id) = scope.document_id {
            return Ok(ChunkScope {
                document_ids: Some(vec![document_id]),
            });
        }
        if let Some(tenant_id) = &scope.tenant_id {
            let ids = self.documents.document_ids_for_tenant(tenant_id).await?;
            return Ok(ChunkScope {
                document_ids: Some(ids),
            });
        }
        Ok(ChunkScope { document_ids: None })
    }

    /// Decide the fate of a new document once, on its first chunk.
    async fn open_document(
        &self,
        record: &ChunkRecord,
        report: &mut RebuildReport,
    ) -> Result<Option<OpenDocument>, RebuildError> {
        match self.documents.get_document(record.document_id).await? {
            None => {
                warn!(document_id = %record.document_id, "chunk rows reference a missing document");
                report
                    .errors
                    .push(format!("document {} missing from store", record.document_id));
                Ok(None)
            }
            Some(document) if document.lifecycle == DocumentLifecycle::Deleted => {
                debug!(document_id = %document.id, "skipping soft-deleted document");
                report.documents_skipped += 1;
                Ok(None)
            }
            Some(document) => {
                report.documents_seen += 1;
                Ok(Some(OpenDocument {
                    document_id: document.id,
                    tenant_id: document.tenant_id,
                    source: document.filename,
                    entries: Vec::new(),
                }))
            }
        }
    }

    async fn flush(&self, doc: OpenDocument, report: &mut RebuildReport) {
        if doc.entries.is_empty() {
            return;
        }
        let count = doc.entries.len() as u64;
        match self
            .index
            .upsert(
                &doc.tenant_id,
                &doc.document_id.to_string(),
                &doc.source,
                doc.entries,
            )
            .await
        {
            Ok(_) => {
                report.chunks_indexed += count;
                let mut data = Map::new();
                data.insert("chunks_indexed".to_string(), Value::from(report.chunks_indexed));
                data.insert("chunks_total".to_string(), Value::from(report.chunks_total));
                data.insert("documents_seen".to_string(), Value::from(report.documents_seen as u64));
                self.emit(
                    ProgressEvent::rebuild(
                        RebuildStage::Processing,
                        format!("{} of {} chunks indexed", report.chunks_indexed, report.chunks_total),
                    )
                    .with_data(data),
                )
                .await;
            }
            Err(error) => {
                warn!(document_id = %doc.document_id, error = %error, "rebuild batch failed");
                report
                    .errors
                    .push(format!("document {}: {error}", doc.document_id));
            }
        }
    }

    async fn finish(&self, mut report: RebuildReport, started: Instant) -> RebuildReport {
        report.final_entity_count = match self.index.stats().await {
            Ok(stats) => Some(stats.entity_count),
            Err(error) => {
                warn!(error = %error, "entity count unavailable after rebuild");
                None
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;

        let mut data = Map::new();
        data.insert("chunks_indexed".to_string(), Value::from(report.chunks_indexed));
        data.insert("chunks_total".to_string(), Value::from(report.chunks_total));
        data.insert("documents_seen".to_string(), Value::from(report.documents_seen as u64));
        data.insert(
            "documents_skipped".to_string(),
            Value::from(report.documents_skipped as u64),
        );
        data.insert("errors".to_string(), Value::from(report.errors.len() as u64));
        self.emit(
            ProgressEvent::rebuild(
                RebuildStage::Completed,
                format!(
                    "rebuild finished: {} of {} chunks indexed",
                    report.chunks_indexed, report.chunks_total
                ),
            )
            .with_data(data),
        )
        .await;
        info!(
            chunks_indexed = report.chunks_indexed,
            chunks_total = report.chunks_total,
            documents_seen = report.documents_seen,
            documents_skipped = report.documents_skipped,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "rebuild complete"
        );
        report
    }

    async fn fail(&self, reason: &str) {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(reason.to_string()));
        self.emit(
            ProgressEvent::rebuild(RebuildStage::Failed, "rebuild aborted").with_data(data),
        )
        .await;
    }

    async fn emit(&self, event: ProgressEvent) {
        self.observer.on_event(event).await;
    }
}

fn index_entry(record: &ChunkRecord) -> IndexEntry {
    // Carry the durable row id so an index entry can be traced back.
    let mut metadata = record.metadata.clone();
    metadata.insert(
        "chunk_record_id".to_string(),
        Value::String(record.id.to_string()),
    );
    IndexEntry {
        seq_index: record.seq_index,
        text: record.content.clone(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    use crate::config::VectorStoreSettings;
    use crate::embeddings::{EmbeddingEngine, HashEmbedder};
    use crate::models::{Document, DocumentStatus, DocumentType};
    use crate::progress::NoopObserver;
    use crate::stores::memory::{MemoryMetadataStore, MemoryVectorStore};
    use crate::traits::VectorStore;

    struct RecordingObserver {
        stages: Mutex<Vec<&'static str>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stages: Mutex::new(Vec::new()),
            })
        }

        async fn stages(&self) -> Vec<&'static str> {
            self.stages.lock().await.clone()
        }
    }

    #[async_trait]
    impl ProgressObserver for RecordingObserver {
        async fn on_event(&self, event: ProgressEvent) {
            self.stages.lock().await.push(event.stage);
        }
    }

    struct Harness {
        store: Arc<MemoryMetadataStore>,
        vectors: Arc<MemoryVectorStore>,
        index: Arc<ChunkIndex>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryMetadataStore::new());
        let vectors = Arc::new(MemoryVectorStore::new());
        let engine = Arc::new(EmbeddingEngine::new(Arc::new(HashEmbedder::new(32)), 32));
        let index = Arc::new(ChunkIndex::new(
            vectors.clone(),
            engine,
            &VectorStoreSettings::default(),
        ));
        Harness {
            store,
            vectors,
            index,
        }
    }

    fn orchestrator(h: &Harness) -> RebuildOrchestrator {
        RebuildOrchestrator::new(h.store.clone(), h.index.clone(), Arc::new(NoopObserver))
    }

    fn document(tenant: &str, filename: &str) -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            filename: filename.to_string(),
            original_filename: filename.to_string(),
            size_bytes: 100,
            doc_type: DocumentType::Txt,
            status: DocumentStatus::Completed,
            lifecycle: DocumentLifecycle::Active,
            chunk_count: 0,
            text_preview: None,
            error_message: None,
            uploaded_at: now,
            processed_at: Some(now),
            updated_at: now,
        }
    }

    fn chunk(doc: &Document, seq: usize, content: &str) -> ChunkRecord {
        ChunkRecord {
            id: Uuid::new_v4(),
            document_id: doc.id,
            tenant_id: doc.tenant_id.clone(),
            seq_index: seq,
            content: content.to_string(),
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
            metadata: Map::new(),
            embedding_ref: None,
            created_at: Utc::now(),
        }
    }

    async fn seed(h: &Harness, doc: &Document, texts: &[&str]) {
        h.store.insert_document(doc).await.unwrap();
        let rows: Vec<ChunkRecord> = texts
            .iter()
            .enumerate()
            .map(|(seq, text)| chunk(doc, seq, text))
            .collect();
        h.store.insert_chunks(&rows).await.unwrap();
    }

    #[tokio::test]
    async fn replays_chunk_rows_into_a_searchable_index() {
        let h = harness();
        let doc = document("tenant-a", "notes.txt");
        seed(
            &h,
            &doc,
            &[
                "Glaciers carve valleys over thousands of years.",
                "Moraines mark where the ice once stopped.",
            ],
        )
        .await;

        let report = orchestrator(&h).rebuild(RebuildScope::default()).await.unwrap();

        assert_eq!(report.chunks_total, 2);
        assert_eq!(report.chunks_indexed, 2);
        assert_eq!(report.documents_seen, 1);
        assert_eq!(report.documents_skipped, 0);
        assert!(report.errors.is_empty());
        assert_eq!(report.final_entity_count, Some(2));

        let hits = h
            .index
            .search("glaciers carve valleys", "tenant-a", 5, None, 0.2)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source, "notes.txt");
    }

    #[tokio::test]
    async fn rebuild_is_repeatable_without_growth() {
        let h = harness();
        let doc = document("tenant-a", "a.txt");
        seed(&h, &doc, &["first chunk text", "second chunk text"]).await;
        let orchestrator = orchestrator(&h);

        let first = orchestrator.rebuild(RebuildScope::default()).await.unwrap();
        let second = orchestrator.rebuild(RebuildScope::default()).await.unwrap();

        assert_eq!(first.final_entity_count, Some(2));
        assert_eq!(second.final_entity_count, Some(2));
        assert_eq!(h.vectors.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_entries_do_not_survive_the_drop() {
        let h = harness();
        let doc = document("tenant-a", "kept.txt");
        seed(&h, &doc, &["the row that should survive"]).await;

        // An orphaned vector with no backing chunk row.
        h.index
            .upsert(
                "tenant-a",
                &Uuid::new_v4().to_string(),
                "ghost.txt",
                vec![IndexEntry {
                    seq_index: 0,
                    text: "stale vector entry".to_string(),
                    metadata: Map::new(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(h.vectors.count().await.unwrap(), 1);

        let report = orchestrator(&h).rebuild(RebuildScope::default()).await.unwrap();

        assert_eq!(report.final_entity_count, Some(1));
        assert_eq!(report.chunks_indexed, 1);
    }

    #[tokio::test]
    async fn missing_document_is_reported_and_the_rest_still_indexes() {
        let h = harness();
        let doc = document("tenant-a", "present.txt");
        seed(&h, &doc, &["good chunk"]).await;

        // Chunk rows whose document record was never written.
        let orphan = document("tenant-a", "orphan.txt");
        let rows = vec![chunk(&orphan, 0, "orphaned chunk")];
        h.store.insert_chunks(&rows).await.unwrap();

        let report = orchestrator(&h).rebuild(RebuildScope::default()).await.unwrap();

        assert_eq!(report.chunks_total, 2);
        assert_eq!(report.chunks_indexed, 1);
        assert_eq!(report.documents_seen, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("missing from store"));
        assert_eq!(report.final_entity_count, Some(1));
    }

    #[tokio::test]
    async fn soft_deleted_documents_are_skipped_once() {
        let h = harness();
        let kept = document("tenant-a", "kept.txt");
        seed(&h, &kept, &["kept chunk"]).await;

        let mut deleted = document("tenant-a", "deleted.txt");
        deleted.lifecycle = DocumentLifecycle::Deleted;
        seed(&h, &deleted, &["gone one", "gone two", "gone three"]).await;

        let report = orchestrator(&h).rebuild(RebuildScope::default()).await.unwrap();

        assert_eq!(report.documents_seen, 1);
        assert_eq!(report.documents_skipped, 1);
        assert_eq!(report.chunks_indexed, 1);
        assert_eq!(report.final_entity_count, Some(1));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn tenant_scope_replays_only_that_tenant() {
        let h = harness();
        let ours = document("tenant-a", "ours.txt");
        seed(&h, &ours, &["tenant a content"]).await;
        let theirs = document("tenant-b", "theirs.txt");
        seed(&h, &theirs, &["tenant b content"]).await;

        let report = orchestrator(&h)
            .rebuild(RebuildScope {
                tenant_id: Some("tenant-a".to_string()),
                document_id: None,
            })
            .await
            .unwrap();

        assert_eq!(report.chunks_total, 1);
        assert_eq!(report.chunks_indexed, 1);
        // The drop is global: the other tenant's entries are gone until they
        // rebuild too.
        assert_eq!(h.vectors.count().await.unwrap(), 1);
        let foreign = h
            .index
            .search("tenant b content", "tenant-b", 5, None, 0.0)
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn single_document_scope_replays_only_that_document() {
        let h = harness();
        let wanted = document("tenant-a", "wanted.txt");
        seed(&h, &wanted, &["wanted text"]).await;
        let other = document("tenant-a", "other.txt");
        seed(&h, &other, &["other text"]).await;

        let report = orchestrator(&h)
            .rebuild(RebuildScope {
                tenant_id: None,
                document_id: Some(wanted.id),
            })
            .await
            .unwrap();

        assert_eq!(report.chunks_total, 1);
        assert_eq!(report.documents_seen, 1);
        assert_eq!(h.vectors.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn large_documents_split_into_batches_without_id_collisions() {
        let h = harness();
        let doc = document("tenant-a", "big.txt");
        let texts: Vec<String> = (0..7).map(|i| format!("chunk number {i} body")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        seed(&h, &doc, &refs).await;

        let report = orchestrator(&h)
            .with_batch_size(3)
            .rebuild(RebuildScope::default())
            .await
            .unwrap();

        assert_eq!(report.chunks_total, 7);
        assert_eq!(report.chunks_indexed, 7);
        // Entry ids keep the original sequence indexes, so batches never
        // overwrite each other.
        assert_eq!(report.final_entity_count, Some(7));
    }

    #[tokio::test]
    async fn empty_store_completes_with_zero_counts() {
        let h = harness();
        let observer = RecordingObserver::new();
        let orchestrator = RebuildOrchestrator::new(
            h.store.clone(),
            h.index.clone(),
            observer.clone(),
        );

        let report = orchestrator.rebuild(RebuildScope::default()).await.unwrap();

        assert_eq!(report.chunks_total, 0);
        assert_eq!(report.chunks_indexed, 0);
        assert_eq!(report.final_entity_count, Some(0));
        assert_eq!(
            observer.stages().await,
            vec!["started", "initializing", "counting", "completed"]
        );
    }

    #[tokio::test]
    async fn progress_stages_arrive_in_order() {
        let h = harness();
        let doc = document("tenant-a", "a.txt");
        seed(&h, &doc, &["some content here"]).await;
        let observer = RecordingObserver::new();
        let orchestrator = RebuildOrchestrator::new(
            h.store.clone(),
            h.index.clone(),
            observer.clone(),
        );

        orchestrator.rebuild(RebuildScope::default()).await.unwrap();

        let stages = observer.stages().await;
        assert_eq!(&stages[..3], &["started", "initializing", "counting"]);
        assert!(stages.contains(&"processing"));
        assert_eq!(&stages[stages.len() - 2..], &["finalizing", "completed"]);
    }
}
