use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VectorStoreSettings;
use crate::embeddings::EmbeddingEngine;
use crate::error::IndexError;
use crate::models::{DetailedIndexStats, HealthStatus, IndexHealth, IndexStats, ScoredChunk};
use crate::traits::{EntryFilter, VectorHit, VectorPoint, VectorStore};

/// Hard cap on entry id length, matching the tightest backend schema.
const MAX_ENTRY_ID_CHARS: usize = 100;
/// Hard cap on stored chunk text. Longer text is truncated with a warning,
/// never rejected; the embedding is still computed from the full text.
const MAX_TEXT_CHARS: usize = 65_535;
const SAMPLE_LIMIT: usize = 1000;
const TOP_DISTRIBUTION: usize = 10;

/// Stable vector entry id: `{document_id}_{seq_index}`, capped at the id
/// length limit. Oversized ids keep a digest-derived suffix so two long
/// document ids cannot truncate onto the same entry id.
pub fn entry_id(document_id: &str, seq_index: usize) -> String {
    let full = format!("{document_id}_{seq_index}");
    if full.chars().count() <= MAX_ENTRY_ID_CHARS {
        return full;
    }
    let digest = Sha256::digest(full.as_bytes());
    let suffix = format!(
        "_{:02x}{:02x}{:02x}{:02x}_{seq_index}",
        digest[0], digest[1], digest[2], digest[3]
    );
    let keep = MAX_ENTRY_ID_CHARS - suffix.chars().count();
    let head: String = document_id.chars().take(keep).collect();
    format!("{head}{suffix}")
}

/// Flatten metadata for payload storage: scalars pass through, nested arrays
/// and objects become JSON strings, nulls are dropped.
pub fn sanitize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in metadata {
        match value {
            Value::Null => {}
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                out.insert(key.clone(), value.clone());
            }
            nested => {
                out.insert(key.clone(), Value::String(nested.to_string()));
            }
        }
    }
    out
}

/// One chunk headed for the index, carrying its stable sequence position.
/// The sequence index participates in entry identity, so re-indexing the
/// same chunk replaces the old entry instead of duplicating it.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub seq_index: usize,
    pub text: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexLifecycle {
    Uninitialized,
    Connecting,
    Ready { dimension: usize },
    Failed(String),
}

/// Tenant-partitioned chunk index over a [`VectorStore`] backend.
///
/// Owns everything the raw store does not: lazy one-time initialization,
/// embedding of queries and chunks, entry id derivation, payload shaping,
/// and the mandatory tenant filter on every read and delete.
pub struct ChunkIndex {
    store: Arc<dyn VectorStore>,
    engine: Arc<EmbeddingEngine>,
    collection: String,
    metric: String,
    candidate_factor: usize,
    state: Mutex<IndexLifecycle>,
}

impl ChunkIndex {
    pub fn new(
        store: Arc<dyn VectorStore>,
        engine: Arc<EmbeddingEngine>,
        settings: &VectorStoreSettings,
    ) -> Self {
        Self {
            store,
            engine,
            collection: settings.collection.clone(),
            metric: settings.metric.clone(),
            candidate_factor: settings.candidate_factor.max(1),
            state: Mutex::new(IndexLifecycle::Uninitialized),
        }
    }

    /// Initialize on first use and return the embedding dimension.
    ///
    /// The lock is held for the whole initialization, so concurrent cold
    /// callers queue up behind a single attempt instead of racing to create
    /// the collection. Once `Failed`, the index stays failed: a restart gets
    /// a fresh handle, a running process does not flap between states.
    pub async fn ensure_ready(&self) -> Result<usize, IndexError> {
        let mut state = self.state.lock().await;
        match &*state {
            IndexLifecycle::Ready { dimension } => return Ok(*dimension),
            IndexLifecycle::Failed(reason) => {
                return Err(IndexError::Unavailable(format!(
                    "index initialization previously failed: {reason}"
                )))
            }
            IndexLifecycle::Uninitialized | IndexLifecycle::Connecting => {}
        }

        *state = IndexLifecycle::Connecting;
        match self.initialize().await {
            Ok(dimension) => {
                *state = IndexLifecycle::Ready { dimension };
                Ok(dimension)
            }
            Err(error) => {
                *state = IndexLifecycle::Failed(error.to_string());
                Err(error)
            }
        }
    }

    async fn initialize(&self) -> Result<usize, IndexError> {
        let dimension = self.engine.ensure_loaded().await?;
        if !self.store.collection_exists().await? {
            info!(
                collection = %self.collection,
                dimension,
                metric = %self.metric,
                "creating vector collection"
            );
            self.store.create_collection(dimension, &self.metric).await?;
            self.store.create_payload_indexes().await?;
        }
        // The collection must be queryable before we declare readiness.
        let entity_count = self.store.count().await?;
        debug!(collection = %self.collection, entity_count, "vector collection ready");
        Ok(dimension)
    }

    pub async fn lifecycle(&self) -> IndexLifecycle {
        self.state.lock().await.clone()
    }

    /// Embed and store a batch of chunks for one document. Returns the entry
    /// ids in input order. An empty batch is a no-op.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        document_id: &str,
        source: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<Vec<String>, IndexError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.seq_index) {
                return Err(IndexError::Validation(format!(
                    "duplicate sequence index {} in upsert batch",
                    entry.seq_index
                )));
            }
        }

        self.ensure_ready().await?;

        let texts: Vec<String> = entries.iter().map(|entry| entry.text.clone()).collect();
        let vectors = self.engine.embed_batch(&texts).await?;

        let mut ids = Vec::with_capacity(entries.len());
        let mut points = Vec::with_capacity(entries.len());
        for (entry, vector) in entries.iter().zip(vectors) {
            let id = entry_id(document_id, entry.seq_index);
            points.push(VectorPoint {
                entry_id: id.clone(),
                vector,
                payload: build_payload(&id, tenant_id, document_id, source, entry),
            });
            ids.push(id);
        }

        self.store.upsert(points).await?;
        debug!(tenant_id, document_id, count = ids.len(), "chunks indexed");
        Ok(ids)
    }

    /// Tenant-scoped similarity search. Over-fetches `k * candidate_factor`
    /// from the backend, drops candidates below `threshold`, and returns at
    /// most `k` chunks in descending similarity order.
    pub async fn search(
        &self,
        query: &str,
        tenant_id: &str,
        k: usize,
        document_ids: Option<Vec<String>>,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        if query.trim().is_empty() {
            return Err(IndexError::Validation("query must not be empty".into()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        self.ensure_ready().await?;

        let vector = self.engine.embed(query).await?;
        let filter = EntryFilter {
            tenant_id: tenant_id.to_string(),
            document_ids,
        };
        let limit = k.saturating_mul(self.candidate_factor);
        let hits = self.store.search(&vector, &filter, limit).await?;

        let mut chunks = Vec::new();
        for hit in hits {
            if hit.score < threshold {
                continue;
            }
            match scored_chunk(hit) {
                Some(chunk) => chunks.push(chunk),
                None => warn!(tenant_id, "dropping search hit with malformed payload"),
            }
            if chunks.len() == k {
                break;
            }
        }
        debug!(tenant_id, k, returned = chunks.len(), "search complete");
        Ok(chunks)
    }

    /// Remove every entry belonging to one document of one tenant.
    pub async fn delete_document(&self, tenant_id: &str, document_id: &str) -> Result<(), IndexError> {
        self.ensure_ready().await?;
        self.store
            .delete_by_filter(&EntryFilter::document(tenant_id, document_id))
            .await?;
        info!(tenant_id, document_id, "vector entries deleted");
        Ok(())
    }

    /// Drop the backing collection and reset the lifecycle so the next
    /// `ensure_ready` recreates it empty. Destructive; the rebuild path is
    /// the only caller.
    pub async fn drop_collection(&self) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        warn!(collection = %self.collection, "dropping vector collection");
        self.store.drop_collection().await?;
        *state = IndexLifecycle::Uninitialized;
        Ok(())
    }

    /// Best-effort health probe. Never returns an error: every failed check
    /// downgrades the reported status and lands in `errors` instead.
    pub async fn health(&self) -> IndexHealth {
        let mut errors = Vec::new();
        let mut connected = false;
        let mut exists = false;

        match self.store.collection_exists().await {
            Ok(flag) => {
                connected = true;
                exists = flag;
                if !flag {
                    errors.push("collection does not exist".to_string());
                }
            }
            Err(error) => errors.push(format!("vector store unreachable: {error}")),
        }

        let loaded = matches!(self.lifecycle().await, IndexLifecycle::Ready { .. });
        if connected && exists && !loaded {
            errors.push("index not initialized in this process".to_string());
        }

        let entity_count = if connected && exists {
            match self.store.count().await {
                Ok(count) => Some(count),
                Err(error) => {
                    errors.push(format!("entity count failed: {error}"));
                    None
                }
            }
        } else {
            None
        };

        let status = if !connected || !exists {
            HealthStatus::Critical
        } else if !errors.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        IndexHealth {
            status,
            connected,
            collection_exists: exists,
            collection_loaded: loaded,
            entity_count,
            errors,
        }
    }

    pub async fn stats(&self) -> Result<IndexStats, IndexError> {
        let dimension = self.ensure_ready().await?;
        let entity_count = self.store.count().await?;
        Ok(IndexStats {
            collection: self.collection.clone(),
            entity_count,
            dimension,
        })
    }

    /// Stats plus tenant and document distributions tallied from a bounded
    /// payload sample. Approximate by construction.
    pub async fn detailed_stats(&self) -> Result<DetailedIndexStats, IndexError> {
        let stats = self.stats().await?;
        let sample = self.store.sample(SAMPLE_LIMIT).await?;
        let sampled = sample.len() as u64;

        let mut tenants: BTreeMap<String, u64> = BTreeMap::new();
        let mut documents: BTreeMap<String, u64> = BTreeMap::new();
        for hit in sample {
            if let Some(tenant) = hit.payload.get("tenant_id").and_then(Value::as_str) {
                *tenants.entry(tenant.to_string()).or_default() += 1;
            }
            if let Some(document) = hit.payload.get("document_id").and_then(Value::as_str) {
                *documents.entry(document.to_string()).or_default() += 1;
            }
        }

        Ok(DetailedIndexStats {
            stats,
            sampled,
            tenants: top_counts(tenants),
            documents: top_counts(documents),
        })
    }
}

fn build_payload(
    entry_id: &str,
    tenant_id: &str,
    document_id: &str,
    source: &str,
    entry: &IndexEntry,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("entry_id".to_string(), Value::String(entry_id.to_string()));
    payload.insert("text".to_string(), Value::String(bounded_text(&entry.text, entry_id)));
    payload.insert("tenant_id".to_string(), Value::String(tenant_id.to_string()));
    payload.insert("document_id".to_string(), Value::String(document_id.to_string()));
    payload.insert("source".to_string(), Value::String(source.to_string()));
    payload.insert("seq_index".to_string(), Value::from(entry.seq_index));

    let mut metadata = sanitize_metadata(&entry.metadata);
    metadata.insert(
        "word_count".to_string(),
        Value::from(entry.text.split_whitespace().count()),
    );
    metadata.insert("char_count".to_string(), Value::from(entry.text.chars().count()));
    payload.insert("metadata".to_string(), Value::Object(metadata));
    payload
}

fn bounded_text(text: &str, entry_id: &str) -> String {
    if text.chars().count() <= MAX_TEXT_CHARS {
        text.to_string()
    } else {
        warn!(entry_id, limit = MAX_TEXT_CHARS, "chunk text exceeds storage cap, truncating");
        text.chars().take(MAX_TEXT_CHARS).collect()
    }
}

fn scored_chunk(hit: VectorHit) -> Option<ScoredChunk> {
    let payload = hit.payload;
    let document_id = payload
        .get("document_id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())?;
    let tenant_id = payload.get("tenant_id").and_then(Value::as_str)?.to_string();
    let content = payload.get("text").and_then(Value::as_str)?.to_string();
    let source = payload
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let seq_index = payload.get("seq_index").and_then(Value::as_u64).unwrap_or(0) as usize;
    let metadata = payload
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Some(ScoredChunk {
        entry_id: hit.entry_id,
        document_id,
        tenant_id,
        source,
        seq_index,
        content,
        similarity: hit.score,
        metadata,
    })
}

fn top_counts(counts: BTreeMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_DISTRIBUTION);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::embeddings::{EmbeddingModel, HashEmbedder};
    use crate::error::EmbedError;
    use crate::stores::MemoryVectorStore;

    /// Maps text starting with a float to a unit vector whose cosine against
    /// the query "1.0" equals that float. Makes similarity scores exact.
    struct DirectionModel;

    #[async_trait]
    impl EmbeddingModel for DirectionModel {
        fn name(&self) -> &str {
            "direction"
        }

        async fn load(&self) -> Result<usize, EmbedError> {
            Ok(2)
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let cos: f32 = text
                        .split_whitespace()
                        .next()
                        .and_then(|token| token.parse().ok())
                        .unwrap_or(1.0);
                    vec![cos, (1.0 - cos * cos).max(0.0).sqrt()]
                })
                .collect())
        }
    }

    struct CountingStore {
        inner: MemoryVectorStore,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for CountingStore {
        async fn collection_exists(&self) -> Result<bool, IndexError> {
            self.inner.collection_exists().await
        }

        async fn create_collection(&self, dimension: usize, metric: &str) -> Result<(), IndexError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_collection(dimension, metric).await
        }

        async fn create_payload_indexes(&self) -> Result<(), IndexError> {
            self.inner.create_payload_indexes().await
        }

        async fn drop_collection(&self) -> Result<(), IndexError> {
            self.inner.drop_collection().await
        }

        async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), IndexError> {
            self.inner.upsert(points).await
        }

        async fn search(
            &self,
            vector: &[f32],
            filter: &EntryFilter,
            limit: usize,
        ) -> Result<Vec<VectorHit>, IndexError> {
            self.inner.search(vector, filter, limit).await
        }

        async fn delete_by_filter(&self, filter: &EntryFilter) -> Result<(), IndexError> {
            self.inner.delete_by_filter(filter).await
        }

        async fn count(&self) -> Result<u64, IndexError> {
            self.inner.count().await
        }

        async fn sample(&self, limit: usize) -> Result<Vec<VectorHit>, IndexError> {
            self.inner.sample(limit).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl VectorStore for BrokenStore {
        async fn collection_exists(&self) -> Result<bool, IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn create_collection(&self, _dimension: usize, _metric: &str) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn create_payload_indexes(&self) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn drop_collection(&self) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn upsert(&self, _points: Vec<VectorPoint>) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn search(
            &self,
            _vector: &[f32],
            _filter: &EntryFilter,
            _limit: usize,
        ) -> Result<Vec<VectorHit>, IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn delete_by_filter(&self, _filter: &EntryFilter) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn count(&self) -> Result<u64, IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }

        async fn sample(&self, _limit: usize) -> Result<Vec<VectorHit>, IndexError> {
            Err(IndexError::Unavailable("backend down".into()))
        }
    }

    fn hash_index(store: Arc<dyn VectorStore>) -> ChunkIndex {
        let engine = Arc::new(EmbeddingEngine::new(Arc::new(HashEmbedder::new(64)), 64));
        ChunkIndex::new(store, engine, &VectorStoreSettings::default())
    }

    fn direction_index(store: Arc<dyn VectorStore>) -> ChunkIndex {
        let engine = Arc::new(EmbeddingEngine::new(Arc::new(DirectionModel), 2));
        ChunkIndex::new(store, engine, &VectorStoreSettings::default())
    }

    fn entry(seq: usize, text: &str) -> IndexEntry {
        IndexEntry {
            seq_index: seq,
            text: text.to_string(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn entry_ids_pass_through_when_short() {
        assert_eq!(entry_id("doc-1", 0), "doc-1_0");
        assert_eq!(entry_id("doc-1", 42), "doc-1_42");
    }

    #[test]
    fn oversized_entry_ids_are_capped_and_stay_unique() {
        let shared_prefix = "x".repeat(120);
        let first = format!("{shared_prefix}-alpha");
        let second = format!("{shared_prefix}-beta");

        let id_a = entry_id(&first, 3);
        let id_b = entry_id(&second, 3);

        assert_eq!(id_a.chars().count(), 100);
        assert_eq!(id_b.chars().count(), 100);
        assert_ne!(id_a, id_b);
        assert!(id_a.ends_with("_3"));
        // Deterministic: same inputs always give the same id.
        assert_eq!(id_a, entry_id(&first, 3));
    }

    #[test]
    fn metadata_sanitization_flattens_nested_values() {
        let mut metadata = Map::new();
        metadata.insert("note".into(), Value::String("plain".into()));
        metadata.insert("count".into(), Value::from(7));
        metadata.insert("tags".into(), serde_json::json!(["a", "b"]));
        metadata.insert("extra".into(), serde_json::json!({"k": 1}));
        metadata.insert("missing".into(), Value::Null);

        let clean = sanitize_metadata(&metadata);
        assert_eq!(clean["note"], "plain");
        assert_eq!(clean["count"], 7);
        assert_eq!(clean["tags"], Value::String("[\"a\",\"b\"]".into()));
        assert_eq!(clean["extra"], Value::String("{\"k\":1}".into()));
        assert!(!clean.contains_key("missing"));
    }

    #[tokio::test]
    async fn concurrent_cold_callers_create_the_collection_once() {
        let store = Arc::new(CountingStore {
            inner: MemoryVectorStore::new(),
            creates: AtomicUsize::new(0),
        });
        let index = Arc::new(hash_index(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move { index.ensure_ready().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 64);
        }

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(index.ensure_ready().await.unwrap(), 64);
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_initialization_is_terminal() {
        let index = hash_index(Arc::new(BrokenStore));
        assert!(index.ensure_ready().await.is_err());

        let second = index.ensure_ready().await.unwrap_err();
        match second {
            IndexError::Unavailable(reason) => {
                assert!(reason.contains("previously failed"), "got: {reason}")
            }
            other => panic!("expected Unavailable, got {other}"),
        }
        assert!(matches!(index.lifecycle().await, IndexLifecycle::Failed(_)));
    }

    #[tokio::test]
    async fn upsert_rejects_duplicate_sequence_indexes() {
        let index = hash_index(Arc::new(MemoryVectorStore::new()));
        let error = index
            .upsert(
                "tenant-a",
                "doc-1",
                "a.txt",
                vec![entry(0, "first part"), entry(0, "second part")],
            )
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_upsert_is_a_no_op() {
        let index = hash_index(Arc::new(MemoryVectorStore::new()));
        let ids = index.upsert("tenant-a", "doc-1", "a.txt", Vec::new()).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn search_applies_threshold_then_k() {
        let index = direction_index(Arc::new(MemoryVectorStore::new()));
        index
            .upsert(
                "tenant-a",
                &Uuid::new_v4().to_string(),
                "scores.txt",
                vec![
                    entry(0, "0.95 alpha"),
                    entry(1, "0.80 beta"),
                    entry(2, "0.60 gamma"),
                ],
            )
            .await
            .unwrap();

        let strict = index
            .search("1.0 query", "tenant-a", 3, None, 0.9)
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
        assert!((strict[0].similarity - 0.95).abs() < 1e-3);

        let loose = index
            .search("1.0 query", "tenant-a", 3, None, 0.5)
            .await
            .unwrap();
        assert_eq!(loose.len(), 3);
        assert!(loose.windows(2).all(|pair| pair[0].similarity >= pair[1].similarity));

        let capped = index
            .search("1.0 query", "tenant-a", 2, None, 0.5)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
        assert!((capped[0].similarity - 0.95).abs() < 1e-3);
    }

    #[tokio::test]
    async fn tenant_isolation_holds_even_for_better_matches() {
        let index = direction_index(Arc::new(MemoryVectorStore::new()));
        index
            .upsert(
                "tenant-a",
                &Uuid::new_v4().to_string(),
                "a.txt",
                vec![entry(0, "0.60 mine")],
            )
            .await
            .unwrap();
        index
            .upsert(
                "tenant-b",
                &Uuid::new_v4().to_string(),
                "b.txt",
                vec![entry(0, "0.99 theirs")],
            )
            .await
            .unwrap();

        let hits = index
            .search("1.0 query", "tenant-a", 5, None, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tenant_id, "tenant-a");
        assert!(hits[0].content.contains("mine"));
    }

    #[tokio::test]
    async fn document_filter_narrows_the_search() {
        let index = direction_index(Arc::new(MemoryVectorStore::new()));
        let doc_a = Uuid::new_v4().to_string();
        let doc_b = Uuid::new_v4().to_string();
        index
            .upsert("tenant-a", &doc_a, "a.txt", vec![entry(0, "0.9 from-a")])
            .await
            .unwrap();
        index
            .upsert("tenant-a", &doc_b, "b.txt", vec![entry(0, "0.9 from-b")])
            .await
            .unwrap();

        let hits = index
            .search("1.0 query", "tenant-a", 5, Some(vec![doc_a.clone()]), 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id.to_string(), doc_a);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let index = hash_index(Arc::new(MemoryVectorStore::new()));
        let error = index.search("   ", "tenant-a", 5, None, 0.5).await.unwrap_err();
        assert!(matches!(error, IndexError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_removes_only_the_requested_document() {
        let store = Arc::new(MemoryVectorStore::new());
        let index = direction_index(store.clone());
        let doc_a = Uuid::new_v4().to_string();
        let doc_b = Uuid::new_v4().to_string();
        index
            .upsert(
                "tenant-a",
                &doc_a,
                "a.txt",
                vec![entry(0, "0.9 one"), entry(1, "0.9 two")],
            )
            .await
            .unwrap();
        index
            .upsert("tenant-a", &doc_b, "b.txt", vec![entry(0, "0.9 three")])
            .await
            .unwrap();

        index.delete_document("tenant-a", &doc_a).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let hits = index.search("1.0 query", "tenant-a", 5, None, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id.to_string(), doc_b);
    }

    #[tokio::test]
    async fn oversized_text_is_truncated_in_the_payload() {
        let store = Arc::new(MemoryVectorStore::new());
        let index = hash_index(store.clone());
        let long_text = "chunk ".repeat(20_000);
        assert!(long_text.chars().count() > MAX_TEXT_CHARS);

        index
            .upsert("tenant-a", "doc-long", "long.txt", vec![entry(0, &long_text)])
            .await
            .unwrap();

        let sample = store.sample(10).await.unwrap();
        let stored = sample[0].payload.get("text").and_then(Value::as_str).unwrap();
        assert_eq!(stored.chars().count(), MAX_TEXT_CHARS);
    }

    #[tokio::test]
    async fn payload_metadata_carries_fresh_counts() {
        let store = Arc::new(MemoryVectorStore::new());
        let index = hash_index(store.clone());
        let mut metadata = Map::new();
        metadata.insert("tags".into(), serde_json::json!(["intro"]));
        metadata.insert("empty".into(), Value::Null);

        index
            .upsert(
                "tenant-a",
                "doc-1",
                "a.txt",
                vec![IndexEntry {
                    seq_index: 0,
                    text: "five little words here now".to_string(),
                    metadata,
                }],
            )
            .await
            .unwrap();

        let sample = store.sample(10).await.unwrap();
        let stored = sample[0].payload.get("metadata").and_then(Value::as_object).unwrap();
        assert_eq!(stored["word_count"], 5);
        assert_eq!(stored["char_count"], 26);
        assert!(stored["tags"].is_string());
        assert!(!stored.contains_key("empty"));
    }

    #[tokio::test]
    async fn health_degrades_instead_of_failing() {
        let broken = hash_index(Arc::new(BrokenStore));
        let health = broken.health().await;
        assert_eq!(health.status, HealthStatus::Critical);
        assert!(!health.connected);
        assert!(!health.errors.is_empty());

        let store = Arc::new(MemoryVectorStore::new());
        let index = hash_index(store);
        // Before initialization the collection does not exist yet.
        let cold = index.health().await;
        assert_eq!(cold.status, HealthStatus::Critical);
        assert!(cold.connected);
        assert!(!cold.collection_exists);

        index.ensure_ready().await.unwrap();
        let warm = index.health().await;
        assert_eq!(warm.status, HealthStatus::Healthy);
        assert!(warm.collection_loaded);
        assert_eq!(warm.entity_count, Some(0));
    }

    #[tokio::test]
    async fn stats_and_distributions_come_from_the_sample() {
        let index = direction_index(Arc::new(MemoryVectorStore::new()));
        let doc_a = Uuid::new_v4().to_string();
        let doc_b = Uuid::new_v4().to_string();
        index
            .upsert(
                "tenant-a",
                &doc_a,
                "a.txt",
                vec![entry(0, "0.9 a"), entry(1, "0.9 b")],
            )
            .await
            .unwrap();
        index
            .upsert("tenant-b", &doc_b, "b.txt", vec![entry(0, "0.9 c")])
            .await
            .unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.entity_count, 3);
        assert_eq!(stats.dimension, 2);
        assert_eq!(stats.collection, "doc_chunks");

        let detailed = index.detailed_stats().await.unwrap();
        assert_eq!(detailed.sampled, 3);
        assert_eq!(detailed.tenants[0].1, 2);
        assert_eq!(detailed.tenants[0].0, "tenant-a");
        assert_eq!(detailed.documents.len(), 2);
    }

    #[tokio::test]
    async fn drop_collection_resets_the_lifecycle() {
        let store = Arc::new(MemoryVectorStore::new());
        let index = hash_index(store.clone());
        index
            .upsert("tenant-a", "doc-1", "a.txt", vec![entry(0, "some text here")])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        index.drop_collection().await.unwrap();
        assert!(matches!(index.lifecycle().await, IndexLifecycle::Uninitialized));

        index.ensure_ready().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(matches!(index.lifecycle().await, IndexLifecycle::Ready { .. }));
    }
}
