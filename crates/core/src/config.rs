use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level settings, loaded from TOML with serde defaults so a partial (or
/// absent) file still yields a runnable configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub vector_store: VectorStoreSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    /// Per-tenant LLM overrides keyed by tenant id. Anything left unset falls
    /// back to the global `llm` block.
    #[serde(default)]
    pub tenants: BTreeMap<String, LlmOverride>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding: EmbeddingSettings::default(),
            chunking: ChunkingSettings::default(),
            vector_store: VectorStoreSettings::default(),
            retrieval: RetrievalSettings::default(),
            llm: LlmSettings::default(),
            tenants: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSettings {
    /// `hash` (deterministic, in-process) or `remote` (OpenAI-compatible).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Advisory: the engine adopts the backend's actual dimension at load.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            base_url: None,
            timeout_secs: default_embed_timeout(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_dimension() -> usize {
    384
}
fn default_embed_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkingSettings {
    #[serde(default = "default_chunk_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_tokens(),
            overlap_tokens: default_chunk_overlap(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    300
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStoreSettings {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_metric")]
    pub metric: String,
    /// Over-fetch multiplier: a search for `k` requests `k * candidate_factor`
    /// candidates before threshold filtering.
    #[serde(default = "default_candidate_factor")]
    pub candidate_factor: usize,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            collection: default_collection(),
            metric: default_metric(),
            candidate_factor: default_candidate_factor(),
            timeout_secs: default_store_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "doc_chunks".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}
fn default_candidate_factor() -> usize {
    2
}
fn default_store_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_threshold() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u64,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_keys: Vec::new(),
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            max_tokens: default_max_tokens(),
            requests_per_minute: default_rpm(),
            tokens_per_minute: default_tpm(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_provider() -> String {
    "groq".to_string()
}
fn default_llm_model() -> String {
    "llama-3.1-8b-instant".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.groq.com".to_string()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_rpm() -> u32 {
    30
}
fn default_tpm() -> u64 {
    6000
}
fn default_llm_timeout() -> u64 {
    60
}

/// Sparse per-tenant override: only the fields present in the TOML replace
/// the global defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmOverride {
    pub provider: Option<String>,
    pub api_keys: Option<Vec<String>>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.max_tokens == 0 {
            return Err(ConfigError::Invalid("chunking.max_tokens must be > 0".into()));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(ConfigError::Invalid(
                "chunking.overlap_tokens must be smaller than chunking.max_tokens".into(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be > 0".into()));
        }
        if self.embedding.provider == "remote" && self.embedding.base_url.is_none() {
            return Err(ConfigError::Invalid(
                "embedding.base_url is required when embedding.provider is 'remote'".into(),
            ));
        }
        match self.embedding.provider.as_str() {
            "hash" | "remote" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown embedding provider '{other}', expected 'hash' or 'remote'"
                )))
            }
        }
        if self.vector_store.candidate_factor == 0 {
            return Err(ConfigError::Invalid("vector_store.candidate_factor must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(ConfigError::Invalid(
                "retrieval.similarity_threshold must be within [0.0, 1.0]".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval.top_k must be >= 1".into()));
        }
        Ok(())
    }

    /// Resolve the effective LLM settings for one tenant. Missing overrides
    /// (or a tenant with no override block at all) fall back to the global
    /// `llm` defaults without failing.
    pub fn llm_for_tenant(&self, tenant_id: &str) -> LlmSettings {
        let mut effective = self.llm.clone();
        if let Some(over) = self.tenants.get(tenant_id) {
            if let Some(provider) = &over.provider {
                effective.provider = provider.clone();
            }
            if let Some(keys) = &over.api_keys {
                effective.api_keys = keys.clone();
            }
            if let Some(model) = &over.model {
                effective.model = model.clone();
            }
            if let Some(base_url) = &over.base_url {
                effective.base_url = base_url.clone();
            }
            if let Some(max_tokens) = over.max_tokens {
                effective.max_tokens = max_tokens;
            }
            if let Some(rpm) = over.requests_per_minute {
                effective.requests_per_minute = rpm;
            }
            if let Some(tpm) = over.tokens_per_minute {
                effective.tokens_per_minute = tpm;
            }
        }
        effective
    }
}

/// Split a comma-separated credential list, as passed via flag or env var.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.chunking.max_tokens, 300);
        assert_eq!(settings.chunking.overlap_tokens, 50);
        assert_eq!(settings.retrieval.top_k, 5);
        assert_eq!(settings.llm.model, "llama-3.1-8b-instant");
        assert_eq!(settings.llm.requests_per_minute, 30);
        assert_eq!(settings.llm.tokens_per_minute, 6000);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[chunking]\nmax_tokens = 120\n\n[llm]\nmodel = \"mixtral-8x7b\"\n"
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.chunking.max_tokens, 120);
        assert_eq!(settings.chunking.overlap_tokens, 50);
        assert_eq!(settings.llm.model, "mixtral-8x7b");
        assert_eq!(settings.llm.base_url, "https://api.groq.com");
    }

    #[test]
    fn overlap_must_fit_under_chunk_size() {
        let mut settings = Settings::default();
        settings.chunking.overlap_tokens = settings.chunking.max_tokens;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn tenant_override_falls_back_to_defaults() {
        let mut settings = Settings::default();
        settings.llm.api_keys = vec!["global-key".into()];
        settings.tenants.insert(
            "tenant-b".into(),
            LlmOverride {
                model: Some("llama-3.3-70b-versatile".into()),
                ..LlmOverride::default()
            },
        );

        let effective = settings.llm_for_tenant("tenant-b");
        assert_eq!(effective.model, "llama-3.3-70b-versatile");
        assert_eq!(effective.api_keys, vec!["global-key".to_string()]);

        let unknown = settings.llm_for_tenant("tenant-z");
        assert_eq!(unknown.model, "llama-3.1-8b-instant");
    }

    #[test]
    fn key_list_parsing_trims_and_skips_empties() {
        assert_eq!(
            parse_key_list(" k1 , k2,,k3 "),
            vec!["k1".to_string(), "k2".to_string(), "k3".to_string()]
        );
        assert!(parse_key_list("").is_empty());
    }
}
