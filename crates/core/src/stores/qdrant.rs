use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::IndexError;
use crate::traits::{EntryFilter, VectorHit, VectorPoint, VectorStore};

/// Qdrant REST backend. Entry ids live in the payload; point ids are UUIDs
/// derived from the entry id so re-upserting the same chunk replaces the
/// previous point instead of duplicating it.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, IndexError> {
        let endpoint = endpoint.into();
        Url::parse(&endpoint)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            collection: collection.into(),
            client,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, suffix)
    }

    fn backend_error(details: impl Into<String>) -> IndexError {
        IndexError::BackendResponse {
            backend: "qdrant".to_string(),
            details: details.into(),
        }
    }
}

/// Stable point id for an entry id: the first sixteen bytes of its SHA-256,
/// rendered as a UUID.
fn derive_point_id(entry_id: &str) -> String {
    let digest = Sha256::digest(entry_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

fn build_filter(filter: &EntryFilter) -> Value {
    let mut must = vec![json!({
        "key": "tenant_id",
        "match": { "value": filter.tenant_id },
    })];

    if let Some(document_ids) = &filter.document_ids {
        must.push(json!({
            "key": "document_id",
            "match": { "any": document_ids },
        }));
    }

    json!({ "must": must })
}

fn hit_from_point(point: &Value) -> VectorHit {
    let payload = point
        .pointer("/payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    let entry_id = payload
        .get("entry_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            point
                .pointer("/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });

    let score = point.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32;

    VectorHit {
        entry_id,
        score,
        payload,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn collection_exists(&self) -> Result<bool, IndexError> {
        let response = self.client.get(self.collection_url("")).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }
        Ok(true)
    }

    async fn create_collection(&self, dimension: usize, metric: &str) -> Result<(), IndexError> {
        let distance = match metric {
            "cosine" => "Cosine",
            "dot" => "Dot",
            "euclid" | "l2" => "Euclid",
            other => {
                return Err(IndexError::Validation(format!(
                    "unsupported similarity metric '{other}'"
                )))
            }
        };

        let response = self
            .client
            .put(self.collection_url(""))
            .json(&json!({
                "vectors": { "size": dimension, "distance": distance },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }
        Ok(())
    }

    async fn create_payload_indexes(&self) -> Result<(), IndexError> {
        for field in ["tenant_id", "document_id"] {
            let response = self
                .client
                .put(self.collection_url("/index?wait=true"))
                .json(&json!({
                    "field_name": field,
                    "field_schema": "keyword",
                }))
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(Self::backend_error(format!(
                    "index on {field}: {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    async fn drop_collection(&self) -> Result<(), IndexError> {
        let response = self.client.delete(self.collection_url("")).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), IndexError> {
        if points.is_empty() {
            return Ok(());
        }

        let body_points = points
            .iter()
            .map(|point| {
                json!({
                    "id": derive_point_id(&point.entry_id),
                    "vector": point.vector,
                    "payload": point.payload,
                })
            })
            .collect::<Vec<_>>();

        let response = self
            .client
            .put(self.collection_url("/points?wait=true"))
            .json(&json!({ "points": body_points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, IndexError> {
        let response = self
            .client
            .post(self.collection_url("/points/search"))
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
                "filter": build_filter(filter),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits.iter().map(hit_from_point).collect())
    }

    async fn delete_by_filter(&self, filter: &EntryFilter) -> Result<(), IndexError> {
        let response = self
            .client
            .post(self.collection_url("/points/delete?wait=true"))
            .json(&json!({ "filter": build_filter(filter) }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let response = self
            .client
            .post(self.collection_url("/points/count"))
            .json(&json!({ "exact": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }

        let parsed: Value = response.json().await?;
        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .ok_or_else(|| Self::backend_error("count response missing result.count"))
    }

    async fn sample(&self, limit: usize) -> Result<Vec<VectorHit>, IndexError> {
        let response = self
            .client
            .post(self.collection_url("/points/scroll"))
            .json(&json!({
                "limit": limit,
                "with_payload": true,
                "with_vector": false,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response.status().to_string()));
        }

        let parsed: Value = response.json().await?;
        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(points.iter().map(hit_from_point).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_and_distinct() {
        let first = derive_point_id("doc-1_0");
        assert_eq!(first, derive_point_id("doc-1_0"));
        assert_ne!(first, derive_point_id("doc-1_1"));
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn filter_always_pins_the_tenant() {
        let tenant_only = build_filter(&EntryFilter::tenant("tenant-a"));
        assert_eq!(tenant_only["must"][0]["key"], "tenant_id");
        assert_eq!(tenant_only["must"][0]["match"]["value"], "tenant-a");
        assert_eq!(tenant_only["must"].as_array().unwrap().len(), 1);

        let scoped = build_filter(&EntryFilter {
            tenant_id: "tenant-a".into(),
            document_ids: Some(vec!["d1".into(), "d2".into()]),
        });
        assert_eq!(scoped["must"][1]["key"], "document_id");
        assert_eq!(scoped["must"][1]["match"]["any"][1], "d2");
    }

    #[test]
    fn endpoint_must_be_a_valid_url() {
        assert!(QdrantStore::new("not a url", "chunks", 30).is_err());
        assert!(QdrantStore::new("http://localhost:6333/", "chunks", 30).is_ok());
    }
}
