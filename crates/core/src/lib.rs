pub mod chat;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod index;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod provider;
pub mod rebuild;
pub mod rotation;
pub mod stores;
pub mod traits;

pub use chat::{ChatOrchestrator, ChatReply, ChatRequest};
pub use chunking::{Chunker, TextChunk};
pub use config::{RetrievalSettings, Settings};
pub use embeddings::{EmbeddingEngine, EmbeddingModel, HashEmbedder, RemoteEmbedder};
pub use error::{
    ChatError, ConfigError, EmbedError, ExtractError, IndexError, LlmError, PipelineError,
    RebuildError, StoreError,
};
pub use extractor::{extract_text, normalize_text};
pub use gateway::{LlmGateway, ProviderHealth};
pub use index::{entry_id, ChunkIndex, IndexEntry, IndexLifecycle};
pub use ingest::{discover_files, IngestPipeline, IngestSubmission};
pub use models::{
    ChunkRecord, Conversation, DetailedIndexStats, Document, DocumentLifecycle, DocumentStatus,
    DocumentType, IndexHealth, IndexStats, Message, MessageRole, ProcessingReport, QueryLogEntry,
    RebuildReport, ScoredChunk, SourceRef, TokenUsage, UploadReceipt,
};
pub use progress::{NoopObserver, ProgressEvent, ProgressObserver, TracingObserver};
pub use provider::{ChatMessage, ChatProvider, GenerationOptions, GenerationProvider, LlmResponse};
pub use rebuild::{RebuildOrchestrator, RebuildScope};
pub use rotation::{KeyRing, RateBudget};
pub use stores::{MemoryMetadataStore, MemoryVectorStore, QdrantStore};
pub use traits::{ConversationStore, DocumentStore, VectorStore};
