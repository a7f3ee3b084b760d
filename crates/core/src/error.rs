use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("could not decode bytes with any supported encoding: {0}")]
    Encoding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding model failed to load: {0}")]
    ModelLoad(String),

    #[error("embedding inference failed: {0}")]
    Inference(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("vector index not ready: {0}")]
    NotReady(String),

    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no credentials configured for provider {0}")]
    NoCredentials(String),

    #[error("no API key available: all keys exhausted or over budget")]
    NoAvailableKey,

    #[error("rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned an error: {0}")]
    Provider(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("all providers failed, last error: {0}")]
    AllProvidersFailed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid upload: {0}")]
    Validation(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
