//! Core data models used by the library.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Flat metadata map stored next to every vector.
pub type Metadata = Map<String, Value>;

/// Canonical metadata keys written on every [`IndexEntry`].
pub mod keys {
    pub const DOCUMENT_ID: &str = "documentId";
    pub const TITLE: &str = "title";
    pub const ORIGINAL_LANGUAGE: &str = "originalLanguage";
    pub const POPULARITY: &str = "popularity";
    pub const VOTE_AVERAGE: &str = "voteAverage";
    pub const VOTE_COUNT: &str = "voteCount";
    pub const RELEASE_DATE: &str = "releaseDate";
    pub const IS_ADULT: &str = "isAdult";
    pub const POSTER_PATH: &str = "posterPath";
    pub const CHUNK: &str = "chunk";
}

/// One movie, in the canonical shape used everywhere past the source adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub overview_text: String,
    pub original_language: String,
    pub popularity: f64,
    pub vote_average: f64,
    pub vote_count: i64,
    pub release_date: Option<NaiveDate>,
    pub is_adult: bool,
    pub poster_path: Option<String>,
}

impl Document {
    /// Minimal document with neutral numeric fields; handy for tests and tools.
    pub fn new(id: impl Into<String>, title: impl Into<String>, overview: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            overview_text: overview.into(),
            original_language: "en".into(),
            popularity: 0.0,
            vote_average: 0.0,
            vote_count: 0,
            release_date: None,
            is_adult: false,
            poster_path: None,
        }
    }

    /// Non-text fields of the document plus `chunk = chunk_index`.
    pub fn chunk_metadata(&self, chunk_index: usize) -> Metadata {
        let mut m = Map::new();
        m.insert(keys::DOCUMENT_ID.into(), json!(self.id));
        m.insert(keys::TITLE.into(), json!(self.title));
        m.insert(keys::ORIGINAL_LANGUAGE.into(), json!(self.original_language));
        m.insert(keys::POPULARITY.into(), json!(self.popularity));
        m.insert(keys::VOTE_AVERAGE.into(), json!(self.vote_average));
        m.insert(keys::VOTE_COUNT.into(), json!(self.vote_count));
        m.insert(
            keys::RELEASE_DATE.into(),
            self.release_date
                .map(|d| json!(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
        );
        m.insert(keys::IS_ADULT.into(), json!(self.is_adult));
        m.insert(
            keys::POSTER_PATH.into(),
            self.poster_path.as_ref().map(|p| json!(p)).unwrap_or(Value::Null),
        );
        m.insert(keys::CHUNK.into(), json!(chunk_index));
        m
    }
}

/// A contiguous slice of a document's overview.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub source_document_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Metadata,
}

impl Chunk {
    /// Stable id derived from `(source_document_id, chunk_index)`.
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.source_document_id, self.chunk_index)
    }
}

/// Stable chunk id as stored in the index.
pub fn chunk_id(document_id: &str, chunk_index: usize) -> String {
    services::uuid::chunk_uuid(document_id, chunk_index).to_string()
}

/// The persisted unit of a VectorIndex.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub text: String,
}

/// A single retrieval hit with score, text and metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

impl SearchHit {
    /// `documentId` of the hit, if present.
    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get(keys::DOCUMENT_ID).and_then(Value::as_str)
    }

    /// `title` of the hit, if present.
    pub fn title(&self) -> Option<&str> {
        self.metadata.get(keys::TITLE).and_then(Value::as_str)
    }
}
