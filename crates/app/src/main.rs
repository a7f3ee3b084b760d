use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use doc_chat_core::config::parse_key_list;
use doc_chat_core::{
    discover_files, ChatOrchestrator, ChatRequest, ChunkIndex, Chunker, DocumentStatus,
    EmbeddingEngine, IngestPipeline, LlmGateway, MemoryMetadataStore, MemoryVectorStore,
    QdrantStore, RebuildOrchestrator, RebuildScope, Settings, TracingObserver, VectorStore,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "doc-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML settings file. Built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tenant all operations run under.
    #[arg(long, default_value = "default")]
    tenant: String,

    /// Vector backend.
    #[arg(long, value_enum, default_value_t = VectorBackend::Qdrant)]
    vector_backend: VectorBackend,

    /// Comma-separated LLM API keys; overrides the config file.
    #[arg(long, env = "GROQ_API_KEYS")]
    api_keys: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum VectorBackend {
    /// In-process store, gone when the command exits.
    Memory,
    Qdrant,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one file, or every supported file under a folder.
    Ingest {
        /// File or folder path.
        #[arg(long)]
        path: PathBuf,
    },
    /// Similarity search over the tenant's indexed chunks.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of chunks to return.
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum similarity score.
        #[arg(long)]
        threshold: Option<f32>,
        /// Restrict the search to one document.
        #[arg(long)]
        document: Option<Uuid>,
    },
    /// One retrieval-grounded chat turn.
    Chat {
        /// User message
        #[arg(long)]
        message: String,
        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<Uuid>,
        /// Cap on retrieved chunks for this turn.
        #[arg(long)]
        max_chunks: Option<usize>,
    },
    /// Soft-delete a document and remove its vector entries.
    Delete {
        #[arg(long)]
        document: Uuid,
    },
    /// Drop the collection and re-index chunk rows from the metadata store.
    Rebuild {
        /// Chunks per upsert batch.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Rebuild a single document instead of the whole tenant.
        #[arg(long)]
        document: Option<Uuid>,
        /// Replay every tenant's chunks, not just --tenant.
        #[arg(long, default_value_t = false)]
        all_tenants: bool,
    },
    /// Vector index and LLM provider health.
    Health,
    /// Index stats with tenant and document distributions.
    Stats,
    /// List the tenant's documents.
    Documents {
        #[arg(long, default_value = "0")]
        skip: usize,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(raw) = &cli.api_keys {
        settings.llm.api_keys = parse_key_list(raw);
    }
    settings.validate()?;

    let vectors: Arc<dyn VectorStore> = match cli.vector_backend {
        VectorBackend::Memory => Arc::new(MemoryVectorStore::new()),
        VectorBackend::Qdrant => Arc::new(QdrantStore::new(
            settings.vector_store.url.clone(),
            settings.vector_store.collection.clone(),
            settings.vector_store.timeout_secs,
        )?),
    };
    let metadata = Arc::new(MemoryMetadataStore::new());
    let engine = Arc::new(EmbeddingEngine::from_settings(&settings.embedding)?);
    let index = Arc::new(ChunkIndex::new(vectors, engine, &settings.vector_store));
    let pipeline = IngestPipeline::new(
        metadata.clone(),
        index.clone(),
        Chunker::new(settings.chunking),
        Arc::new(TracingObserver),
    );

    info!(
        version = app_version,
        tenant = %cli.tenant,
        started_at = %Utc::now().to_rfc3339(),
        "doc-chat boot"
    );

    match cli.command {
        Command::Ingest { path } => {
            let files = if path.is_dir() {
                discover_files(&path)
            } else {
                vec![path.clone()]
            };
            anyhow::ensure!(
                !files.is_empty(),
                "no supported files under {}",
                path.display()
            );

            for file in files {
                let bytes = tokio::fs::read(&file).await?;
                let filename = file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("upload.txt")
                    .to_string();

                let submission = pipeline.submit(bytes, &filename, &cli.tenant).await?;
                let document_id = submission.receipt.document_id;
                submission.task.await?;

                let report = pipeline.processing_status(&cli.tenant, document_id).await?;
                match report.status {
                    DocumentStatus::Completed => println!(
                        "{filename} -> {document_id} ({} chunks)",
                        report.chunks_processed
                    ),
                    _ => println!(
                        "{filename} -> {} ({})",
                        report.status.as_str(),
                        report.error_message.unwrap_or_else(|| "no detail".to_string())
                    ),
                }
            }
        }
        Command::Search {
            query,
            top_k,
            threshold,
            document,
        } => {
            let k = top_k.unwrap_or(settings.retrieval.top_k);
            let threshold = threshold.unwrap_or(settings.retrieval.similarity_threshold);
            let filter = document.map(|id| vec![id.to_string()]);

            let hits = index.search(&query, &cli.tenant, k, filter, threshold).await?;
            if hits.is_empty() {
                println!("no chunks scored above {threshold}");
            }
            for hit in hits {
                println!(
                    "[{:.4}] {} #{} ({})",
                    hit.similarity, hit.source, hit.seq_index, hit.entry_id
                );
                let preview: String = hit.content.chars().take(160).collect();
                println!("  {preview}");
            }
        }
        Command::Chat {
            message,
            conversation,
            max_chunks,
        } => {
            let chat = ChatOrchestrator::new(metadata.clone(), index.clone(), settings.clone());
            let reply = chat
                .process_message(ChatRequest {
                    tenant_id: cli.tenant.clone(),
                    message,
                    conversation_id: conversation,
                    document_ids: None,
                    max_chunks,
                })
                .await?;

            println!("{}", reply.message);
            if !reply.sources.is_empty() {
                println!();
                println!("sources:");
                for source in &reply.sources {
                    println!(
                        "  [{:.3}] {} #{}",
                        source.similarity, source.document_name, source.seq_index
                    );
                }
            }
            println!();
            println!(
                "conversation={} model={} tokens={}",
                reply.conversation_id, reply.model, reply.tokens_used
            );
        }
        Command::Delete { document } => {
            pipeline.delete_document(&cli.tenant, document).await?;
            println!("document {document} deleted");
        }
        Command::Rebuild {
            batch_size,
            document,
            all_tenants,
        } => {
            let mut orchestrator = RebuildOrchestrator::new(
                metadata.clone(),
                index.clone(),
                Arc::new(TracingObserver),
            );
            if let Some(size) = batch_size {
                orchestrator = orchestrator.with_batch_size(size);
            }
            let scope = if let Some(id) = document {
                RebuildScope {
                    tenant_id: None,
                    document_id: Some(id),
                }
            } else if all_tenants {
                RebuildScope::default()
            } else {
                RebuildScope {
                    tenant_id: Some(cli.tenant.clone()),
                    document_id: None,
                }
            };

            let report = orchestrator.rebuild(scope).await?;
            println!(
                "{} of {} chunks indexed, {} documents seen, {} skipped, {} errors in {} ms",
                report.chunks_indexed,
                report.chunks_total,
                report.documents_seen,
                report.documents_skipped,
                report.errors.len(),
                report.duration_ms
            );
            for error in &report.errors {
                println!("  error: {error}");
            }
            if let Some(count) = report.final_entity_count {
                println!("collection entity count: {count}");
            }
        }
        Command::Health => {
            let health = index.health().await;
            println!(
                "index: {} (connected={} exists={} loaded={})",
                health.status.as_str(),
                health.connected,
                health.collection_exists,
                health.collection_loaded
            );
            if let Some(count) = health.entity_count {
                println!("  entities: {count}");
            }
            for issue in &health.errors {
                println!("  issue: {issue}");
            }

            let gateway = LlmGateway::for_tenant(&settings, Some(&cli.tenant));
            if gateway.provider_count() == 0 {
                println!("llm: no credentials configured");
            } else {
                for probe in gateway.health().await {
                    match probe.error {
                        None => println!("llm {} ({}): ok", probe.provider, probe.model),
                        Some(error) => {
                            println!("llm {} ({}): {error}", probe.provider, probe.model)
                        }
                    }
                }
                for stats in gateway.provider_stats().await {
                    println!("  {}", serde_json::to_string(&stats)?);
                }
            }
        }
        Command::Stats => {
            let detailed = index.detailed_stats().await?;
            println!(
                "collection {}: {} entities, dimension {}",
                detailed.stats.collection, detailed.stats.entity_count, detailed.stats.dimension
            );
            println!("sampled {} points", detailed.sampled);
            if !detailed.tenants.is_empty() {
                println!("tenants:");
                for (tenant, count) in &detailed.tenants {
                    println!("  {tenant}: {count}");
                }
            }
            if !detailed.documents.is_empty() {
                println!("documents:");
                for (document, count) in &detailed.documents {
                    println!("  {document}: {count}");
                }
            }
        }
        Command::Documents { skip, limit } => {
            let documents = pipeline.list_documents(&cli.tenant, skip, limit).await?;
            if documents.is_empty() {
                println!("no documents for tenant {}", cli.tenant);
            }
            for document in documents {
                println!(
                    "{} {} {} chunks={} uploaded={}",
                    document.id,
                    document.status.as_str(),
                    document.original_filename,
                    document.chunk_count,
                    document.uploaded_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
