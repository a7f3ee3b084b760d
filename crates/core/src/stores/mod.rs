pub mod memory;
pub mod qdrant;

pub use memory::{MemoryMetadataStore, MemoryVectorStore};
pub use qdrant::QdrantStore;
