use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{IndexError, StoreError};
use crate::models::{
    ChunkRecord, Conversation, Document, DocumentLifecycle, Message, QueryLogEntry,
};
use crate::traits::{
    ChunkScope, ConversationStore, DocumentStore, EntryFilter, VectorHit, VectorPoint, VectorStore,
};

#[derive(Debug, Clone)]
struct StoredPoint {
    vector: Vec<f32>,
    payload: serde_json::Map<String, Value>,
}

#[derive(Debug, Default)]
struct CollectionState {
    exists: bool,
    dimension: usize,
    points: BTreeMap<String, StoredPoint>,
}

/// Brute-force in-process vector store. Backs tests and offline CLI runs;
/// semantics mirror the Qdrant backend, including tenant filtering.
#[derive(Default)]
pub struct MemoryVectorStore {
    state: RwLock<CollectionState>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(payload: &serde_json::Map<String, Value>, filter: &EntryFilter) -> bool {
    let tenant_matches = payload
        .get("tenant_id")
        .and_then(Value::as_str)
        .map(|tenant| tenant == filter.tenant_id)
        .unwrap_or(false);
    if !tenant_matches {
        return false;
    }

    match &filter.document_ids {
        None => true,
        Some(ids) => payload
            .get("document_id")
            .and_then(Value::as_str)
            .map(|document| ids.iter().any(|candidate| candidate == document))
            .unwrap_or(false),
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn collection_exists(&self) -> Result<bool, IndexError> {
        Ok(self.state.read().await.exists)
    }

    async fn create_collection(&self, dimension: usize, _metric: &str) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.exists = true;
        state.dimension = dimension;
        Ok(())
    }

    async fn create_payload_indexes(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn drop_collection(&self) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.exists = false;
        state.points.clear();
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        if !state.exists {
            return Err(IndexError::NotReady("collection does not exist".into()));
        }
        for point in points {
            if point.vector.len() != state.dimension {
                return Err(IndexError::Validation(format!(
                    "vector dimension {} does not match collection dimension {}",
                    point.vector.len(),
                    state.dimension
                )));
            }
            state.points.insert(
                point.entry_id.clone(),
                StoredPoint {
                    vector: point.vector,
                    payload: point.payload,
                },
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, IndexError> {
        let state = self.state.read().await;
        if !state.exists {
            return Err(IndexError::NotReady("collection does not exist".into()));
        }

        let mut hits: Vec<VectorHit> = state
            .points
            .iter()
            .filter(|(_, point)| matches_filter(&point.payload, filter))
            .map(|(entry_id, point)| VectorHit {
                entry_id: entry_id.clone(),
                score: cosine(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_filter(&self, filter: &EntryFilter) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.points.retain(|_, point| !matches_filter(&point.payload, filter));
        Ok(())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        Ok(self.state.read().await.points.len() as u64)
    }

    async fn sample(&self, limit: usize) -> Result<Vec<VectorHit>, IndexError> {
        let state = self.state.read().await;
        Ok(state
            .points
            .iter()
            .take(limit)
            .map(|(entry_id, point)| VectorHit {
                entry_id: entry_id.clone(),
                score: 0.0,
                payload: point.payload.clone(),
            })
            .collect())
    }
}

/// In-process metadata store covering documents, chunks, conversations,
/// messages, and the query log. The durable-database stand-in for tests and
/// single-process CLI sessions.
#[derive(Default)]
pub struct MemoryMetadataStore {
    documents: RwLock<BTreeMap<Uuid, Document>>,
    chunks: RwLock<Vec<ChunkRecord>>,
    conversations: RwLock<BTreeMap<Uuid, Conversation>>,
    messages: RwLock<Vec<Message>>,
    query_log: RwLock<Vec<QueryLogEntry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn query_log_len(&self) -> usize {
        self.query_log.read().await.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryMetadataStore {
    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        self.documents.write().await.insert(document.id, document.clone());
        Ok(())
    }

    async fn update_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        if !documents.contains_key(&document.id) {
            return Err(StoreError::NotFound(format!("document {}", document.id)));
        }
        documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn list_documents(
        &self,
        tenant_id: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let documents = self.documents.read().await;
        let mut matching: Vec<Document> = documents
            .values()
            .filter(|document| {
                document.tenant_id == tenant_id
                    && document.lifecycle == DocumentLifecycle::Active
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(matching.into_iter().skip(skip).take(limit).collect())
    }

    async fn document_ids_for_tenant(&self, tenant_id: &str) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .filter(|document| document.tenant_id == tenant_id)
            .map(|document| document.id)
            .collect())
    }

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StoreError> {
        self.chunks.write().await.extend_from_slice(chunks);
        Ok(())
    }

    async fn count_chunks(&self, scope: &ChunkScope) -> Result<u64, StoreError> {
        let chunks = self.chunks.read().await;
        Ok(chunks.iter().filter(|chunk| scope_matches(scope, chunk)).count() as u64)
    }

    async fn chunks_by_document(
        &self,
        scope: &ChunkScope,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let chunks = self.chunks.read().await;
        let mut matching: Vec<ChunkRecord> = chunks
            .iter()
            .filter(|chunk| scope_matches(scope, chunk))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.seq_index.cmp(&b.seq_index))
        });
        Ok(matching.into_iter().skip(skip).take(limit).collect())
    }
}

fn scope_matches(scope: &ChunkScope, chunk: &ChunkRecord) -> bool {
    match &scope.document_ids {
        None => true,
        Some(ids) => ids.contains(&chunk.document_id),
    }
}

#[async_trait]
impl ConversationStore for MemoryMetadataStore {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        if !conversations.contains_key(&conversation.id) {
            return Err(StoreError::NotFound(format!("conversation {}", conversation.id)));
        }
        conversations.insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn list_conversations(
        &self,
        tenant_id: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Conversation>, StoreError> {
        let conversations = self.conversations.read().await;
        let mut matching: Vec<Conversation> = conversations
            .values()
            .filter(|conversation| conversation.tenant_id == tenant_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(matching.into_iter().skip(skip).take(limit).collect())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        // Insertion order is chronological; messages are append-only.
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let all = self.messages(conversation_id).await?;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn log_query(&self, entry: &QueryLogEntry) -> Result<(), StoreError> {
        self.query_log.write().await.push(entry.clone());
        Ok(())
    }
}
