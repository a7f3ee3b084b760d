use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::config::EmbeddingSettings;
use crate::error::EmbedError;

/// A backend that can turn text into vectors. Loading is separate from
/// embedding so the engine can defer expensive startup until first use and
/// learn the backend's true output dimension.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare the backend and return the dimension it actually produces.
    async fn load(&self) -> Result<usize, EmbedError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Deterministic character-trigram embedder: FNV-1a hashes of each trigram
/// are bucketed into a fixed-width vector. Loads instantly and never hits the
/// network, which makes it the default backend and the one used in tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    fn name(&self) -> &str {
        "hash-trigram"
    }

    async fn load(&self) -> Result<usize, EmbedError> {
        Ok(self.dimension)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let texts = texts.to_vec();
        let dimension = self.dimension;
        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| hash_embed(text, dimension))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|error| EmbedError::Inference(format!("embedding task failed: {error}")))
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0f32; dimension.max(1)];
    let lowered = text.to_lowercase();
    let chars: Vec<char> = lowered.chars().collect();

    if chars.is_empty() {
        return vector;
    }

    if chars.len() < 3 {
        let bucket = (fnv1a(&lowered) % vector.len() as u64) as usize;
        vector[bucket] += 1.0;
        return vector;
    }

    for window in chars.windows(3) {
        let token = window.iter().collect::<String>();
        let bucket = (fnv1a(&token) % vector.len() as u64) as usize;
        vector[bucket] += 1.0;
    }

    vector
}

fn fnv1a(token: &str) -> u64 {
    let mut hash = 1469598103934665603u64;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

/// OpenAI-compatible `/embeddings` backend. Loading probes the endpoint with
/// a single input to measure the dimension the deployment really serves.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl RemoteEmbedder {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmbedError::Inference(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let payload: EmbeddingResponse = response.json().await?;
        Ok(parse_embeddings(payload))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn parse_embeddings(mut payload: EmbeddingResponse) -> Vec<Vec<f32>> {
    payload.data.sort_by_key(|datum| datum.index);
    payload.data.into_iter().map(|datum| datum.embedding).collect()
}

#[async_trait]
impl EmbeddingModel for RemoteEmbedder {
    fn name(&self) -> &str {
        "remote-openai"
    }

    async fn load(&self) -> Result<usize, EmbedError> {
        let probe = vec!["dimension probe".to_string()];
        let vectors = self.request(&probe).await?;
        let first = vectors
            .first()
            .ok_or_else(|| EmbedError::ModelLoad("probe returned no embedding".into()))?;
        if first.is_empty() {
            return Err(EmbedError::ModelLoad("probe returned an empty embedding".into()));
        }
        Ok(first.len())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let vectors = self.request(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbedError::Inference(format!(
                "requested {} embeddings, endpoint returned {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

/// Front door for all embedding work. Lazily loads the backend exactly once
/// (concurrent cold callers share the same load), reconciles the configured
/// dimension against the backend's real one, and L2-normalizes every vector
/// so cosine similarity can be computed as a dot product.
pub struct EmbeddingEngine {
    model: Arc<dyn EmbeddingModel>,
    configured_dimension: usize,
    loaded: OnceCell<usize>,
}

impl EmbeddingEngine {
    pub fn new(model: Arc<dyn EmbeddingModel>, configured_dimension: usize) -> Self {
        Self {
            model,
            configured_dimension,
            loaded: OnceCell::new(),
        }
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self, EmbedError> {
        let model: Arc<dyn EmbeddingModel> = match settings.provider.as_str() {
            "hash" => Arc::new(HashEmbedder::new(settings.dimension)),
            "remote" => {
                let base_url = settings.base_url.as_deref().ok_or_else(|| {
                    EmbedError::ModelLoad("remote embedding provider needs a base_url".into())
                })?;
                Arc::new(RemoteEmbedder::new(base_url, &settings.model, settings.timeout_secs)?)
            }
            other => {
                return Err(EmbedError::ModelLoad(format!(
                    "unknown embedding provider '{other}'"
                )))
            }
        };
        Ok(Self::new(model, settings.dimension))
    }

    /// Load the backend if it has not been loaded yet and return the actual
    /// dimension. The configured dimension is advisory: on mismatch we log
    /// and adopt what the backend reports.
    pub async fn ensure_loaded(&self) -> Result<usize, EmbedError> {
        self.loaded
            .get_or_try_init(|| async {
                let actual = self.model.load().await?;
                if actual != self.configured_dimension {
                    tracing::warn!(
                        model = self.model.name(),
                        configured = self.configured_dimension,
                        actual,
                        "embedding dimension mismatch, adopting actual value"
                    );
                }
                tracing::info!(model = self.model.name(), dimension = actual, "embedding model loaded");
                Ok(actual)
            })
            .await
            .copied()
    }

    /// Dimension after loading. `None` until [`ensure_loaded`] has succeeded.
    pub fn dimension(&self) -> Option<usize> {
        self.loaded.get().copied()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let batch = [text.to_string()];
        let mut vectors = self.embed_batch(&batch).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::Inference("backend returned no embedding".into()))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.ensure_loaded().await?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.model.embed_batch(texts).await?;
        raw.into_iter().map(l2_normalize).collect()
    }
}

fn l2_normalize(mut vector: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude == 0.0 {
        return Err(EmbedError::Inference(
            "embedding collapsed to a zero vector".into(),
        ));
    }
    for value in &mut vector {
        *value /= magnitude;
    }
    Ok(vector)
}
