//! Retrieval-augmented chat turns: resolve a conversation, ground the query
//! against the tenant's chunks, generate through the gateway, persist both
//! sides of the exchange.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{RetrievalSettings, Settings};
use crate::error::ChatError;
use crate::gateway::LlmGateway;
use crate::index::ChunkIndex;
use crate::models::{Conversation, Message, MessageRole, QueryLogEntry, SourceRef};
use crate::provider::{ChatMessage, GenerationOptions};
use crate::traits::ConversationStore;

/// Prior messages carried into the prompt, not counting the current turn.
const HISTORY_WINDOW: usize = 10;

const RESPONSE_MAX_TOKENS: u32 = 2000;
const RESPONSE_TEMPERATURE: f32 = 0.7;

/// Opening the model is instructed to use when retrieval came back empty, so
/// ungrounded answers are recognizable downstream.
const NO_CONTEXT_PREFIX: &str =
    "I could not find any relevant information in the documents, but here's what I can tell you:";

fn grounded_prompt(context: &str) -> String {
    format!(
        "You are a helpful AI assistant. Use the following context to answer questions accurately:\n\n{context}"
    )
}

fn fallback_prompt() -> String {
    format!(
        "You are a helpful AI assistant. I could not find any relevant information in the uploaded documents for this query. Please provide a general response based on your knowledge, but start your response with: '{NO_CONTEXT_PREFIX}'"
    )
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub tenant_id: String,
    pub message: String,
    pub conversation_id: Option<Uuid>,
    /// Restrict retrieval to these documents. `None` searches the whole tenant.
    pub document_ids: Option<Vec<Uuid>>,
    pub max_chunks: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub message: String,
    pub sources: Vec<SourceRef>,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub tokens_used: u64,
    pub model: String,
}

/// Builds the gateway for a tenant. Indirected so tests can inject scripted
/// providers without touching provider config.
pub type GatewayResolver = dyn Fn(&str) -> LlmGateway + Send + Sync;

pub struct ChatOrchestrator {
    conversations: Arc<dyn ConversationStore>,
    index: Arc<ChunkIndex>,
    retrieval: RetrievalSettings,
    resolve_gateway: Box<GatewayResolver>,
}

impl ChatOrchestrator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        index: Arc<ChunkIndex>,
        settings: Settings,
    ) -> Self {
        let retrieval = settings.retrieval;
        let resolver =
            move |tenant_id: &str| LlmGateway::for_tenant(&settings, Some(tenant_id));
        Self::with_gateway_resolver(conversations, index, retrieval, Box::new(resolver))
    }

    pub fn with_gateway_resolver(
        conversations: Arc<dyn ConversationStore>,
        index: Arc<ChunkIndex>,
        retrieval: RetrievalSettings,
        resolve_gateway: Box<GatewayResolver>,
    ) -> Self {
        Self {
            conversations,
            index,
            retrieval,
            resolve_gateway,
        }
    }

    /// Run one full chat turn.
    ///
    /// The user message is persisted before generation, so a provider outage
    /// loses the answer but never the question. The conversation counter and
    /// query log are only touched after a successful exchange.
    pub async fn process_message(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        if request.message.trim().is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }
        let started = Instant::now();

        let mut conversation = self.resolve_conversation(&request).await?;

        let user_message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            tenant_id: request.tenant_id.clone(),
            role: MessageRole::User,
            content: request.message.clone(),
            sources: Vec::new(),
            usage: None,
            model: None,
            created_at: Utc::now(),
        };
        self.conversations.insert_message(&user_message).await?;

        let k = request.max_chunks.unwrap_or(self.retrieval.top_k);
        let document_filter = request
            .document_ids
            .as_ref()
            .map(|ids| ids.iter().map(Uuid::to_string).collect::<Vec<_>>());
        let hits = self
            .index
            .search(
                &request.message,
                &request.tenant_id,
                k,
                document_filter,
                self.retrieval.similarity_threshold,
            )
            .await?;

        let sources: Vec<SourceRef> = hits
            .iter()
            .map(|hit| SourceRef {
                chunk_id: hit.entry_id.clone(),
                document_id: hit.document_id,
                document_name: hit.source.clone(),
                similarity: hit.similarity,
                seq_index: hit.seq_index,
                snippet: hit.content.clone(),
            })
            .collect();

        let system_prompt = if hits.is_empty() {
            debug!(tenant_id = %request.tenant_id, "no chunks above threshold, answering without context");
            fallback_prompt()
        } else {
            let context = hits
                .iter()
                .map(|hit| hit.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            grounded_prompt(&context)
        };

        // The user message is already stored, so fetch one extra and drop it
        // by id to get the last `HISTORY_WINDOW` prior messages.
        let recent = self
            .conversations
            .recent_messages(conversation.id, HISTORY_WINDOW + 1)
            .await?;
        let mut prompt = Vec::with_capacity(recent.len() + 2);
        prompt.push(ChatMessage::system(system_prompt));
        for prior in recent.iter().filter(|m| m.id != user_message.id) {
            prompt.push(ChatMessage {
                role: prior.role.as_str().to_string(),
                content: prior.content.clone(),
            });
        }
        prompt.push(ChatMessage::user(request.message.clone()));

        let gateway = (self.resolve_gateway)(&request.tenant_id);
        let options = GenerationOptions {
            max_tokens: Some(RESPONSE_MAX_TOKENS),
            temperature: Some(RESPONSE_TEMPERATURE),
        };
        let response = gateway.generate_response(&prompt, options).await?;

        let assistant_message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            tenant_id: request.tenant_id.clone(),
            role: MessageRole::Assistant,
            content: response.content.clone(),
            sources: sources.clone(),
            usage: Some(response.usage),
            model: Some(response.model.clone()),
            created_at: Utc::now(),
        };
        self.conversations.insert_message(&assistant_message).await?;

        conversation.message_count += 2;
        conversation.updated_at = Utc::now();
        self.conversations.update_conversation(&conversation).await?;

        let latency_ms = started.elapsed().as_millis() as u64;
        self.conversations
            .log_query(&QueryLogEntry {
                id: Uuid::new_v4(),
                tenant_id: request.tenant_id.clone(),
                conversation_id: conversation.id,
                query: request.message.clone(),
                response_chars: response.content.chars().count(),
                source_count: sources.len(),
                tokens_used: response.usage.total_tokens,
                latency_ms,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            tenant_id = %request.tenant_id,
            conversation_id = %conversation.id,
            sources = sources.len(),
            tokens = response.usage.total_tokens,
            latency_ms,
            "chat turn complete"
        );

        Ok(ChatReply {
            message: response.content,
            sources,
            conversation_id: conversation.id,
            message_id: assistant_message.id,
            tokens_used: response.usage.total_tokens,
            model: response.model,
        })
    }

    /// A missing or foreign conversation id silently starts a fresh one, so a
    /// stale client reference never reveals whether the id exists.
    async fn resolve_conversation(
        &self,
        request: &ChatRequest,
    ) -> Result<Conversation, ChatError> {
        if let Some(id) = request.conversation_id {
            match self.conversations.get_conversation(id).await? {
                Some(existing) if existing.tenant_id == request.tenant_id => {
                    return Ok(existing);
                }
                _ => {
                    debug!(conversation_id = %id, "conversation reference not usable, starting new");
                }
            }
        }
        let conversation = Conversation::new(&request.tenant_id, None);
        self.conversations.insert_conversation(&conversation).await?;
        Ok(conversation)
    }

    pub async fn conversation_history(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
    ) -> Result<(Conversation, Vec<Message>), ChatError> {
        let conversation = self
            .conversations
            .get_conversation(conversation_id)
            .await?
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        let messages = self.conversations.messages(conversation_id).await?;
        Ok((conversation, messages))
    }

    pub async fn list_conversations(
        &self,
        tenant_id: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Conversation>, ChatError> {
        Ok(self
            .conversations
            .list_conversations(tenant_id, skip, limit)
            .await?)
    }
}
