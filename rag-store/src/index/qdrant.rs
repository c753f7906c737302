//! Qdrant-backed vector index.
//!
//! Thin adapter around `qdrant-client` builders. Points are keyed by the chunk
//! UUID; the payload holds the metadata keys plus the chunk text under
//! [`TEXT_KEY`]. Upserts wait for the write to be applied.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    CollectionInfo, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance,
    PointId, PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QValue, VectorParams, VectorParamsBuilder,
    point_id::PointIdOptions, vectors_config,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{VectorIndex, check_entries, check_query, sort_hits};
use crate::config::{DistanceKind, RagConfig, VectorSpace};
use crate::errors::RagError;
use crate::filters::SearchFilter;
use crate::record::{IndexEntry, Metadata, SearchHit};

/// Payload key holding the chunk text.
pub const TEXT_KEY: &str = "text";

const SCROLL_PAGE: u32 = 256;

pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    space: VectorSpace,
    upsert_batch: usize,
}

impl QdrantIndex {
    /// Connects and makes sure the collection exists.
    ///
    /// # Errors
    /// [`RagError::Config`] on invalid settings, [`RagError::IndexUnavailable`]
    /// if Qdrant cannot be reached.
    pub async fn connect(cfg: &RagConfig) -> Result<Self, RagError> {
        cfg.validate()?;

        let mut builder = Qdrant::from_url(&cfg.qdrant_url);
        if let Some(key) = &cfg.qdrant_api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| RagError::Config(format!("qdrant client: {e}")))?;

        let index = Self {
            client,
            collection: cfg.collection.clone(),
            space: cfg.space,
            upsert_batch: cfg.upsert_batch,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    /// Creates the collection if missing, otherwise checks that its vector
    /// size and metric match the configured space.
    ///
    /// # Errors
    /// [`RagError::Config`] when an existing collection was built differently.
    pub async fn ensure_collection(&self) -> Result<(), RagError> {
        if self.client.collection_exists(&self.collection).await? {
            let info = self.client.collection_info(&self.collection).await?;
            let params = info.result.as_ref().and_then(vector_params);
            check_vector_params(&self.collection, params, self.space)?;
            debug!("Collection '{}' already exists and matches", self.collection);
            return Ok(());
        }

        let distance = qdrant_distance(self.space.distance);
        info!(
            "Creating collection '{}' with size={} distance={:?}",
            self.collection, self.space.size, self.space.distance
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(self.space.size as u64, distance)),
            )
            .await?;
        Ok(())
    }

    fn to_point(e: &IndexEntry) -> Result<PointStruct, RagError> {
        let mut body = e.metadata.clone();
        body.insert(TEXT_KEY.into(), Value::String(e.text.clone()));
        let payload = Payload::try_from(Value::Object(body))
            .map_err(|err| RagError::Parse(format!("payload for {}: {err}", e.chunk_id)))?;
        Ok(PointStruct::new(e.chunk_id.clone(), e.vector.clone(), payload))
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimension(&self) -> usize {
        self.space.size
    }

    fn distance(&self) -> DistanceKind {
        self.space.distance
    }

    #[instrument(skip_all, fields(collection = %self.collection, n = entries.len()))]
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, RagError> {
        check_entries(entries, self.space.size)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let points = entries
            .iter()
            .map(Self::to_point)
            .collect::<Result<Vec<_>, _>>()?;

        let mut written = 0usize;
        let mut it = points.into_iter().peekable();
        while it.peek().is_some() {
            let batch: Vec<PointStruct> = it.by_ref().take(self.upsert_batch).collect();
            let n = batch.len();
            self.client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, batch).wait(true))
                .await?;
            written += n;
        }
        debug!("Upserted {} points into '{}'", written, self.collection);
        Ok(written)
    }

    #[instrument(skip_all, fields(collection = %self.collection, k))]
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, RagError> {
        check_query(query, k, self.space.size, filter)?;

        let mut builder = SearchPointsBuilder::new(&self.collection, query.to_vec(), k as u64)
            .with_payload(true);
        if let Some(f) = filter.to_qdrant()? {
            builder = builder.filter(f);
        }

        let res = self.client.search_points(builder).await?;

        let mut hits = Vec::with_capacity(res.result.len());
        for p in res.result {
            let Some(chunk_id) = p.id.as_ref().and_then(point_id_to_string) else {
                warn!("search hit without id skipped");
                continue;
            };
            let (text, metadata) = split_payload(p.payload);
            hits.push(SearchHit {
                chunk_id,
                score: p.score,
                text,
                metadata,
            });
        }
        sort_hits(&mut hits);
        hits.truncate(k);
        debug!("Search completed: {} hits returned", hits.len());
        Ok(hits)
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<(), RagError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<PointId> = ids.iter().cloned().map(PointId::from).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn scan_ids(&self, filter: &SearchFilter) -> Result<Vec<String>, RagError> {
        let mut out = Vec::new();
        let mut offset: Option<PointId> = None;
        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection)
                .limit(SCROLL_PAGE)
                .with_payload(false)
                .with_vectors(false);
            if let Some(f) = filter.to_qdrant()? {
                builder = builder.filter(f);
            }
            if let Some(o) = offset.take() {
                builder = builder.offset(o);
            }

            let page = self.client.scroll(builder).await?;
            out.extend(
                page.result
                    .iter()
                    .filter_map(|p| p.id.as_ref().and_then(point_id_to_string)),
            );
            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        out.sort();
        Ok(out)
    }

    /// Drops and recreates the collection.
    async fn delete_all(&self) -> Result<(), RagError> {
        if self.client.collection_exists(&self.collection).await? {
            info!("Dropping collection '{}'", self.collection);
            self.client.delete_collection(&self.collection).await?;
        }
        self.ensure_collection().await
    }

    async fn count(&self) -> Result<usize, RagError> {
        let res = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await?;
        Ok(res.result.map(|r| r.count as usize).unwrap_or(0))
    }
}

fn point_id_to_string(pid: &PointId) -> Option<String> {
    match pid.point_id_options.as_ref()? {
        PointIdOptions::Uuid(u) => Some(u.clone()),
        PointIdOptions::Num(n) => Some(n.to_string()),
    }
}

/// Separates the chunk text from the metadata keys.
fn split_payload(payload: HashMap<String, QValue>) -> (String, Metadata) {
    let mut text = String::new();
    let mut metadata = Metadata::new();
    for (k, v) in payload {
        let j = v.into_json();
        if k == TEXT_KEY {
            if let Value::String(s) = j {
                text = s;
            }
        } else {
            metadata.insert(k, j);
        }
    }
    (text, metadata)
}

fn qdrant_distance(kind: DistanceKind) -> Distance {
    match kind {
        DistanceKind::Cosine => Distance::Cosine,
        DistanceKind::Dot => Distance::Dot,
    }
}

/// Unnamed vector parameters of a collection; named vector maps are not used here.
fn vector_params(info: &CollectionInfo) -> Option<&VectorParams> {
    let vectors = info.config.as_ref()?.params.as_ref()?.vectors_config.as_ref()?;
    match vectors.config.as_ref()? {
        vectors_config::Config::Params(p) => Some(p),
        vectors_config::Config::ParamsMap(_) => None,
    }
}

fn check_vector_params(
    collection: &str,
    params: Option<&VectorParams>,
    space: VectorSpace,
) -> Result<(), RagError> {
    let Some(p) = params else {
        return Err(RagError::Config(format!(
            "collection '{collection}' has no single unnamed vector config"
        )));
    };
    if p.size != space.size as u64 {
        return Err(RagError::Config(format!(
            "collection '{collection}' stores {}d vectors, EMBEDDING_DIM is {}",
            p.size, space.size
        )));
    }
    let want = qdrant_distance(space.distance);
    if p.distance != i32::from(want) {
        return Err(RagError::Config(format!(
            "collection '{collection}' uses distance {:?}, VECTOR_DISTANCE is {:?}",
            Distance::try_from(p.distance).unwrap_or(Distance::UnknownDistance),
            want
        )));
    }
    Ok(())
}
