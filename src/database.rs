use crate::embeddings::{cosine_similarity, Embedding};
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use qdrant_client::qdrant::{
    with_payload_selector, CreateAliasBuilder, CreateCollectionBuilder, Distance, PointStruct, SearchPoints,
    UpsertPointsBuilder, Value, VectorParams, WithPayloadSelector,
};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

const CURRENT_POINTER: &str = "CURRENT";
const INDEX_FILE: &str = "index.json";

/// A page embedding as persisted in the index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub id: usize,
    pub text: String,
    pub page: usize,
    pub embedding: Embedding,
}

/// A stored page paired with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub text: String,
    pub page: usize,
    pub score: f32,
}

/// Storage backend for page embeddings
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Human-readable location, used in logs and errors
    fn location(&self) -> String;

    /// Whether an index has been published at this location
    async fn exists(&self) -> Result<bool>;

    /// Replace whatever index exists with `records`
    async fn rebuild(&self, records: Vec<EmbeddingRecord>) -> Result<()>;

    /// Return up to `limit` records ordered by descending similarity
    async fn search(&self, query: &Embedding, limit: usize) -> Result<Vec<RetrievalResult>>;
}

pub(crate) fn missing_index(location: &str) -> RagError {
    RagError::NotFound(format!(
        "Vector index not found at '{}'. Call /create_vector_db first.",
        location
    ))
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    dimensions: usize,
    records: Vec<EmbeddingRecord>,
}

/// Flat on-disk index searched by brute-force cosine similarity.
///
/// Each rebuild is written to a fresh `v<millis>` directory under the root and
/// published by atomically renaming a pointer file over `CURRENT`, so readers
/// only ever see a complete version.
pub struct LocalIndex {
    root: PathBuf,
}

impl LocalIndex {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LocalIndex {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn current_version(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_POINTER)).await {
            Ok(version) => Ok(Some(version.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn new_version_dir(&self) -> Result<(String, PathBuf)> {
        let mut stamp = millis_now();

        loop {
            let version = format!("v{}", stamp);
            let dir = self.root.join(&version);
            if !fs::try_exists(&dir).await? {
                fs::create_dir_all(&dir).await?;
                return Ok((version, dir));
            }
            stamp += 1;
        }
    }

    async fn remove_stale_versions(&self, keep: &str) {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not list {}: {}", self.root.display(), e);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == keep || !name.starts_with('v') {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()).await {
                warn!("Failed to remove stale index version {}: {}", name, e);
            } else {
                debug!("Removed stale index version {}", name);
            }
        }
    }
}

#[async_trait]
impl VectorStore for LocalIndex {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.current_version().await?.is_some())
    }

    async fn rebuild(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        fs::create_dir_all(&self.root).await?;

        let dimensions = records
            .first()
            .map(|r| r.embedding.dimensions())
            .unwrap_or_default();
        let index = IndexFile {
            dimensions,
            records,
        };

        let (version, dir) = self.new_version_dir().await?;
        fs::write(dir.join(INDEX_FILE), serde_json::to_vec(&index)?).await?;

        // Publish the new version
        let tmp_pointer = self.root.join(format!("{}.tmp", CURRENT_POINTER));
        fs::write(&tmp_pointer, version.as_bytes()).await?;
        fs::rename(&tmp_pointer, self.root.join(CURRENT_POINTER)).await?;
        info!(
            "Published index version {} with {} records",
            version,
            index.records.len()
        );

        self.remove_stale_versions(&version).await;
        Ok(())
    }

    async fn search(&self, query: &Embedding, limit: usize) -> Result<Vec<RetrievalResult>> {
        let location = self.location();
        let version = self
            .current_version()
            .await?
            .ok_or_else(|| missing_index(&location))?;

        let bytes = match fs::read(self.root.join(&version).join(INDEX_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(missing_index(&location))
            }
            Err(e) => return Err(e.into()),
        };
        let index: IndexFile = serde_json::from_slice(&bytes)?;

        if index.dimensions != 0 && index.dimensions != query.dimensions() {
            return Err(RagError::Store(format!(
                "Query embedding has {} dimensions, index has {}",
                query.dimensions(),
                index.dimensions
            )));
        }

        let mut results: Vec<RetrievalResult> = index
            .records
            .into_iter()
            .map(|record| RetrievalResult {
                score: cosine_similarity(&query.values, &record.embedding.values),
                text: record.text,
                page: record.page,
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);

        Ok(results)
    }
}

/// Configuration for Qdrant
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
}

impl QdrantConfig {
    /// Read the configuration from the environment; `None` when `QDRANT_URL` is unset
    pub fn from_env() -> Option<Self> {
        let url = env::var("QDRANT_URL").ok()?;
        let api_key = env::var("QDRANT_API_KEY").ok();

        Some(QdrantConfig { url, api_key })
    }
}

/// Index kept in a Qdrant collection named after the storage location
pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
}

impl QdrantStore {
    /// Create a new Qdrant-backed store for the given storage location
    pub fn new(config: QdrantConfig, location: &str) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder.build()?;

        Ok(QdrantStore {
            client,
            collection_name: get_collection_name(location),
        })
    }

    /// Collection the alias currently resolves to
    async fn aliased_collection(&self) -> Result<Option<String>> {
        let aliases = self.client.list_aliases().await?;
        Ok(aliases
            .aliases
            .into_iter()
            .find(|a| a.alias_name == self.collection_name)
            .map(|a| a.collection_name))
    }

    async fn fill_collection(&self, collection_name: &str, records: Vec<EmbeddingRecord>) -> Result<()> {
        let size = records
            .first()
            .map(|r| r.embedding.dimensions() as u64)
            .unwrap_or_default();
        let create_collection =
            CreateCollectionBuilder::new(collection_name).vectors_config(VectorParams {
                size,
                distance: Distance::Cosine.into(),
                ..Default::default()
            });
        self.client.create_collection(create_collection).await?;

        if records.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                let payload: HashMap<String, Value> = HashMap::from([
                    ("text".to_string(), Value::from(record.text)),
                    ("page".to_string(), Value::from(record.page as i64)),
                ]);
                PointStruct::new(record.id as u64, record.embedding.values, payload)
            })
            .collect();

        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection_name, points).wait(true))
            .await?;
        info!("Upserted {} points into {}", count, collection_name);

        Ok(())
    }

    /// Move the alias onto `collection_name`, restoring it on failure
    async fn point_alias_at(&self, collection_name: &str, previous: Option<&str>) -> Result<()> {
        if previous.is_some() {
            self.client.delete_alias(self.collection_name.as_str()).await?;
        } else if self.exists().await? {
            // A plain collection from an older layout holds the alias name
            self.client
                .delete_collection(self.collection_name.clone())
                .await?;
            debug!("Dropped unaliased collection {}", self.collection_name);
        }

        let created = self
            .client
            .create_alias(CreateAliasBuilder::new(collection_name, self.collection_name.as_str()))
            .await;
        if let Err(e) = created {
            if let Some(previous) = previous {
                if let Err(restore) = self
                    .client
                    .create_alias(CreateAliasBuilder::new(previous, self.collection_name.as_str()))
                    .await
                {
                    warn!("Failed to restore alias {}: {}", self.collection_name, restore);
                }
            }
            return Err(e.into());
        }

        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn location(&self) -> String {
        format!("qdrant:{}", self.collection_name)
    }

    async fn exists(&self) -> Result<bool> {
        match self.client.collection_info(&self.collection_name).await {
            Ok(_) => Ok(true),
            Err(qdrant_client::QdrantError::ResponseError { status })
                if status.code() == tonic::Code::NotFound =>
            {
                Ok(false)
            }
            Err(e) => Err(RagError::Store(format!(
                "Failed to check collection existence: {}",
                e
            ))),
        }
    }

    async fn rebuild(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        let previous = self.aliased_collection().await?;
        let collection_name = versioned_collection_name(&self.collection_name, millis_now());

        if let Err(e) = self.fill_collection(&collection_name, records).await {
            // The alias still points at the previous collection
            if let Err(cleanup) = self.client.delete_collection(collection_name.clone()).await {
                warn!("Failed to drop partial collection {}: {}", collection_name, cleanup);
            }
            return Err(e);
        }

        self.point_alias_at(&collection_name, previous.as_deref()).await?;
        info!("Alias {} now points at {}", self.collection_name, collection_name);

        if let Some(previous) = previous {
            if let Err(e) = self.client.delete_collection(previous.clone()).await {
                warn!("Failed to drop stale collection {}: {}", previous, e);
            } else {
                debug!("Dropped collection {}", previous);
            }
        }

        Ok(())
    }

    async fn search(&self, query: &Embedding, limit: usize) -> Result<Vec<RetrievalResult>> {
        if !self.exists().await? {
            return Err(missing_index(&self.location()));
        }

        let search_request = SearchPoints {
            collection_name: self.collection_name.clone(),
            vector: query.values.clone(),
            limit: limit as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(with_payload_selector::SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_response = self.client.search_points(search_request).await?;

        // Qdrant already returns hits best-first
        let results = search_response
            .result
            .into_iter()
            .filter_map(|scored_point| {
                let payload = scored_point.payload;
                let text = payload.get("text")?.as_str()?.to_string();
                let page = payload
                    .get("page")
                    .and_then(|v| v.as_integer())
                    .map(|v| v as usize)
                    .unwrap_or(0);

                Some(RetrievalResult {
                    text,
                    page,
                    score: scored_point.score,
                })
            })
            .collect();

        Ok(results)
    }
}

fn millis_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Concrete collection behind the alias for one build
fn versioned_collection_name(alias: &str, stamp: u128) -> String {
    format!("{}_v{}", alias, stamp)
}

/// Generate a collection name from a storage location
fn get_collection_name(location: &str) -> String {
    let name = location
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    format!("rag_{}", name)
}
