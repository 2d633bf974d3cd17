use super::phash::{HASH_BITS, PerceptualHash};
use crate::config::{env_or, env_string};
use crate::http::build_client;
use crate::imaging;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_THRESHOLD: u32 = 10;

#[derive(Debug, Error)]
pub enum DuplicateError {
    #[error("unreadable image: {0}")]
    Decode(String),
    #[error("hash index error: {0}")]
    Index(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HashEntry {
    pub listing_id: String,
    pub filename: String,
    pub phash: String,
}

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub entry: HashEntry,
    /// Euclidean distance between the bit vectors.
    pub distance: f64,
}

/// Nearest-neighbour store of perceptual hashes.
#[async_trait]
pub trait HashIndex: Send + Sync {
    /// Closest stored hash that does not belong to `exclude_listing`.
    async fn nearest(
        &self,
        hash: &PerceptualHash,
        exclude_listing: &str,
    ) -> Result<Option<Neighbor>, DuplicateError>;

    async fn insert(&self, hash: &PerceptualHash, entry: HashEntry) -> Result<(), DuplicateError>;
}

#[derive(Default)]
pub struct MemoryIndex {
    entries: Mutex<Vec<(PerceptualHash, HashEntry)>>,
}

#[async_trait]
impl HashIndex for MemoryIndex {
    async fn nearest(
        &self,
        hash: &PerceptualHash,
        exclude_listing: &str,
    ) -> Result<Option<Neighbor>, DuplicateError> {
        let guard = self.entries.lock().await;
        Ok(guard
            .iter()
            .filter(|(_, entry)| entry.listing_id != exclude_listing)
            .min_by_key(|(stored, _)| stored.hamming(hash))
            .map(|(stored, entry)| Neighbor {
                entry: entry.clone(),
                distance: (stored.hamming(hash) as f64).sqrt(),
            }))
    }

    async fn insert(&self, hash: &PerceptualHash, entry: HashEntry) -> Result<(), DuplicateError> {
        let mut guard = self.entries.lock().await;
        if !guard
            .iter()
            .any(|(_, existing)| existing.filename == entry.filename)
        {
            guard.push((*hash, entry));
        }
        Ok(())
    }
}

/// Qdrant collection accessed over its REST API. Vectors are 64-dimensional
/// with Euclidean distance, so the returned score is the bit distance.
pub struct QdrantIndex {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    ready: OnceCell<()>,
}

impl QdrantIndex {
    pub fn from_env() -> Option<Self> {
        let base_url = env_string("QDRANT_URL")?;
        Some(Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: env_string("QDRANT_API_KEY"),
            collection: env_string("QDRANT_COLLECTION").unwrap_or_else(|| "image_hashes".into()),
            ready: OnceCell::new(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/collections/{}{}", self.base_url, self.collection, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn ensure_collection(&self) -> Result<(), DuplicateError> {
        self.ready
            .get_or_try_init(|| async {
                let existing = self
                    .request(reqwest::Method::GET, "")
                    .send()
                    .await
                    .map_err(|err| DuplicateError::Index(err.to_string()))?;
                if existing.status().is_success() {
                    return Ok(());
                }
                if existing.status() != StatusCode::NOT_FOUND {
                    return Err(DuplicateError::Index(format!("HTTP {}", existing.status())));
                }

                let created = self
                    .request(reqwest::Method::PUT, "")
                    .json(&json!({"vectors": {"size": HASH_BITS, "distance": "Euclid"}}))
                    .send()
                    .await
                    .map_err(|err| DuplicateError::Index(err.to_string()))?;
                if !created.status().is_success() {
                    return Err(DuplicateError::Index(format!("HTTP {}", created.status())));
                }
                let _ = self
                    .request(reqwest::Method::PUT, "/index")
                    .json(&json!({"field_name": "filename", "field_schema": "keyword"}))
                    .send()
                    .await;
                info!(
                    target = "auction.authenticity",
                    collection = %self.collection,
                    "qdrant_collection_created"
                );
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f64,
    #[serde(default)]
    payload: Option<HashEntry>,
}

#[derive(Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Deserialize)]
struct ScrollResult {
    #[serde(default)]
    points: Vec<serde_json::Value>,
}

#[async_trait]
impl HashIndex for QdrantIndex {
    async fn nearest(
        &self,
        hash: &PerceptualHash,
        exclude_listing: &str,
    ) -> Result<Option<Neighbor>, DuplicateError> {
        self.ensure_collection().await?;
        let response = self
            .request(reqwest::Method::POST, "/points/query")
            .json(&json!({
                "query": hash.to_vector(),
                "limit": 1,
                "with_payload": true,
                "filter": {"must_not": [{"key": "listing_id", "match": {"value": exclude_listing}}]},
            }))
            .send()
            .await
            .map_err(|err| DuplicateError::Index(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DuplicateError::Index(format!("HTTP {}", response.status())));
        }
        let payload: QueryResponse = response
            .json()
            .await
            .map_err(|err| DuplicateError::Index(err.to_string()))?;
        Ok(payload.result.points.into_iter().next().and_then(|point| {
            point.payload.map(|entry| Neighbor {
                entry,
                distance: point.score,
            })
        }))
    }

    async fn insert(&self, hash: &PerceptualHash, entry: HashEntry) -> Result<(), DuplicateError> {
        self.ensure_collection().await?;

        let existing = self
            .request(reqwest::Method::POST, "/points/scroll")
            .json(&json!({
                "filter": {"must": [{"key": "filename", "match": {"value": entry.filename}}]},
                "limit": 1,
            }))
            .send()
            .await
            .map_err(|err| DuplicateError::Index(err.to_string()))?;
        if existing.status().is_success()
            && let Ok(scroll) = existing.json::<ScrollResponse>().await
            && !scroll.result.points.is_empty()
        {
            return Ok(());
        }

        let response = self
            .request(reqwest::Method::PUT, "/points")
            .query(&[("wait", "true")])
            .json(&json!({
                "points": [{
                    "id": Uuid::new_v4().to_string(),
                    "vector": hash.to_vector(),
                    "payload": entry,
                }]
            }))
            .send()
            .await
            .map_err(|err| DuplicateError::Index(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DuplicateError::Index(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub is_duplicate: bool,
    pub phash: String,
    pub hamming: Option<u32>,
    pub threshold: u32,
    pub matched: Option<HashEntry>,
}

#[derive(Clone)]
pub struct DuplicateChecker {
    index: Arc<dyn HashIndex>,
    threshold: u32,
}

impl DuplicateChecker {
    pub fn new(index: Arc<dyn HashIndex>, threshold: u32) -> Self {
        Self { index, threshold }
    }

    pub fn from_env() -> Self {
        let index: Arc<dyn HashIndex> = match QdrantIndex::from_env() {
            Some(qdrant) => Arc::new(qdrant),
            None => {
                warn!(
                    target = "auction.authenticity",
                    "QDRANT_URL not set; duplicate hashes are kept in memory"
                );
                Arc::new(MemoryIndex::default())
            }
        };
        Self::new(
            index,
            env_or("DUPLICATE_HAMMING_THRESHOLD", DEFAULT_THRESHOLD),
        )
    }

    /// Hash `bytes`, look for a near-duplicate from another listing and, when
    /// none is found, remember the hash.
    pub async fn check_and_insert(
        &self,
        bytes: Arc<[u8]>,
        listing_id: &str,
        filename: &str,
    ) -> Result<DuplicateReport, DuplicateError> {
        let hash = tokio::task::spawn_blocking(move || {
            imaging::decode(&bytes).map(|img| PerceptualHash::from_image(&img))
        })
        .await
        .map_err(|err| DuplicateError::Decode(err.to_string()))?
        .map_err(|err| DuplicateError::Decode(err.to_string()))?;

        let neighbor = self.index.nearest(&hash, listing_id).await?;
        let hamming = neighbor
            .as_ref()
            .map(|found| (found.distance * found.distance).round() as u32);

        if let (Some(found), Some(distance)) = (&neighbor, hamming)
            && distance <= self.threshold
        {
            warn!(
                target = "auction.authenticity",
                listing_id = %listing_id,
                matched_listing = %found.entry.listing_id,
                hamming = distance,
                "duplicate_image_detected"
            );
            return Ok(DuplicateReport {
                is_duplicate: true,
                phash: hash.to_hex(),
                hamming: Some(distance),
                threshold: self.threshold,
                matched: Some(found.entry.clone()),
            });
        }

        self.index
            .insert(
                &hash,
                HashEntry {
                    listing_id: listing_id.to_string(),
                    filename: filename.to_string(),
                    phash: hash.to_hex(),
                },
            )
            .await?;

        Ok(DuplicateReport {
            is_duplicate: false,
            phash: hash.to_hex(),
            hamming,
            threshold: self.threshold,
            matched: None,
        })
    }
}
