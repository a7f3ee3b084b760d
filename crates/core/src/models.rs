use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared document type, derived from the upload filename extension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Txt,
    Md,
}

impl DocumentType {
    pub fn from_filename(name: &str) -> Self {
        match name.rsplit('.').next().map(|ext| ext.to_lowercase()) {
            Some(ext) if ext == "pdf" => DocumentType::Pdf,
            Some(ext) if ext == "md" || ext == "markdown" => DocumentType::Md,
            // Unknown extensions are treated as plain text; extraction decides
            // whether the bytes are actually decodable.
            _ => DocumentType::Txt,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Txt => "txt",
            DocumentType::Md => "md",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

/// Soft-delete lifecycle. Deleted documents keep their durable records but
/// disappear from listings, retrieval, and rebuilds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentLifecycle {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: String,
    pub filename: String,
    pub original_filename: String,
    pub size_bytes: u64,
    pub doc_type: DocumentType,
    pub status: DocumentStatus,
    pub lifecycle: DocumentLifecycle,
    pub chunk_count: usize,
    pub text_preview: Option<String>,
    pub error_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Durable chunk row. Written once during ingestion and never mutated; the
/// vector index can always be rebuilt from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: String,
    pub seq_index: usize,
    pub content: String,
    pub word_count: usize,
    pub char_count: usize,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub embedding_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: String,
    pub title: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(tenant_id: &str, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            title: title.unwrap_or_else(|| "New Conversation".to_string()),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Citation attached to an assistant message: which chunk grounded the answer
/// and how similar it was to the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub document_id: Uuid,
    pub document_name: String,
    pub similarity: f32,
    pub seq_index: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: String,
    pub role: MessageRole,
    pub content: String,
    pub sources: Vec<SourceRef>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-turn analytics row, written after every successful chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub conversation_id: Uuid,
    pub query: String,
    pub response_chars: usize,
    pub source_count: usize,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// What `IngestPipeline::submit` hands back while processing continues in the
/// background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub document_id: Uuid,
    pub filename: String,
    pub status: DocumentStatus,
}

/// Point-in-time processing status for one document. Coarse on purpose: the
/// progress observer stream carries the fine-grained stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    pub progress: u8,
    pub chunks_processed: usize,
    pub error_message: Option<String>,
}

/// One retrieval hit, already tenant-filtered and threshold-filtered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub entry_id: String,
    pub document_id: Uuid,
    pub tenant_id: String,
    pub source: String,
    pub seq_index: usize,
    pub content: String,
    pub similarity: f32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Index health probe result. Collected best-effort; probing never fails, it
/// degrades the reported status instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHealth {
    pub status: HealthStatus,
    pub connected: bool,
    pub collection_exists: bool,
    pub collection_loaded: bool,
    pub entity_count: Option<u64>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub collection: String,
    pub entity_count: u64,
    pub dimension: usize,
}

/// Stats enriched with tenant/document distribution from a bounded sample of
/// the collection. Counts are approximate by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedIndexStats {
    pub stats: IndexStats,
    pub sampled: u64,
    pub tenants: Vec<(String, u64)>,
    pub documents: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildReport {
    pub chunks_total: u64,
    pub chunks_indexed: u64,
    pub documents_seen: usize,
    pub documents_skipped: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub final_entity_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_from_extension() {
        assert_eq!(DocumentType::from_filename("report.PDF"), DocumentType::Pdf);
        assert_eq!(DocumentType::from_filename("notes.markdown"), DocumentType::Md);
        assert_eq!(DocumentType::from_filename("readme.txt"), DocumentType::Txt);
        assert_eq!(DocumentType::from_filename("no_extension"), DocumentType::Txt);
        assert_eq!(DocumentType::from_filename("weird.xyz"), DocumentType::Txt);
    }

    #[test]
    fn conversation_defaults_title() {
        let convo = Conversation::new("tenant-a", None);
        assert_eq!(convo.title, "New Conversation");
        assert_eq!(convo.message_count, 0);

        let named = Conversation::new("tenant-a", Some("Q3 filings".into()));
        assert_eq!(named.title, "Q3 filings");
    }
}
