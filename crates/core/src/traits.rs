use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{IndexError, StoreError};
use crate::models::{ChunkRecord, Conversation, Document, Message, QueryLogEntry};

/// One entry headed for the vector store: the stable entry id, its unit
/// vector, and the denormalized payload stored beside it.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub entry_id: String,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

/// A raw hit coming back from the vector store, before the retrieval layer
/// shapes it into a [`crate::models::ScoredChunk`].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub entry_id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// Tenant-scoped filter applied to searches and deletes. The tenant is
/// mandatory; every store operation that reads or removes entries goes
/// through one of these.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    pub tenant_id: String,
    pub document_ids: Option<Vec<String>>,
}

impl EntryFilter {
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            document_ids: None,
        }
    }

    pub fn document(tenant_id: &str, document_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            document_ids: Some(vec![document_id.to_string()]),
        }
    }
}

/// Raw operations a vector backend must provide. `ChunkIndex` owns the
/// embedding, id derivation, and filtering policy on top of this.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self) -> Result<bool, IndexError>;

    async fn create_collection(&self, dimension: usize, metric: &str) -> Result<(), IndexError>;

    /// Payload indexes on the tenant and document fields used by filters.
    async fn create_payload_indexes(&self) -> Result<(), IndexError>;

    async fn drop_collection(&self) -> Result<(), IndexError>;

    /// Insert-or-replace. Resolves only once entries are durable enough for
    /// a subsequent search to observe them.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), IndexError>;

    async fn search(
        &self,
        vector: &[f32],
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, IndexError>;

    async fn delete_by_filter(&self, filter: &EntryFilter) -> Result<(), IndexError>;

    async fn count(&self) -> Result<u64, IndexError>;

    /// Bounded payload sample used for approximate distribution stats.
    async fn sample(&self, limit: usize) -> Result<Vec<VectorHit>, IndexError>;
}

/// Scope selector over durable chunk rows, used by the rebuild path.
#[derive(Debug, Clone, Default)]
pub struct ChunkScope {
    pub document_ids: Option<Vec<Uuid>>,
}

/// Durable document and chunk metadata. Chunk rows written here outlive the
/// vector index and are the source of truth a rebuild replays.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn update_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError>;

    /// Active-lifecycle documents for one tenant, newest upload first.
    async fn list_documents(
        &self,
        tenant_id: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// Every document id the tenant has ever uploaded, regardless of
    /// lifecycle. Rebuild scoping decides per document what to do.
    async fn document_ids_for_tenant(&self, tenant_id: &str) -> Result<Vec<Uuid>, StoreError>;

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StoreError>;

    async fn count_chunks(&self, scope: &ChunkScope) -> Result<u64, StoreError>;

    /// Page through chunk rows ordered by document id then sequence index,
    /// so a rebuild sees each document's chunks contiguously.
    async fn chunks_by_document(
        &self,
        scope: &ChunkScope,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError>;
}

/// Conversations, their append-only message log, and per-turn analytics.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Most recently updated conversations first.
    async fn list_conversations(
        &self,
        tenant_id: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Conversation>, StoreError>;

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Full history in chronological order.
    async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// The last `limit` messages, still in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn log_query(&self, entry: &QueryLogEntry) -> Result<(), StoreError>;
}
