//! Document source adapter: movie batches from JSON or JSONL files.
//!
//! Accepted layouts:
//! - a JSON array of movie objects
//! - a collection object `{ "results": [ ... ] }`
//! - JSONL, one movie object per line
//!
//! Field naming varies between exports (`poster_path` vs `posterPath`,
//! `release_date` vs `releaseDate` vs `release_pate`, ...). Every variant is
//! mapped onto the canonical [`Document`] here; nothing past this module sees
//! the raw shapes. Malformed records are logged (`warn!`) and counted, never fatal.

use std::path::Path;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::RagError;
use crate::record::Document;

/// Documents read from a source, plus how many raw records were rejected.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub documents: Vec<Document>,
    pub skipped: usize,
}

/// Reads and maps a movie batch from `path`.
///
/// # Errors
/// [`RagError::Io`] if the file cannot be read. Bad records are skipped.
pub async fn read_documents(path: impl AsRef<Path>) -> Result<SourceBatch, RagError> {
    info!("Reading movie batch: {:?}", path.as_ref());
    let raw = tokio::fs::read_to_string(path.as_ref()).await?;
    Ok(parse_documents(&raw))
}

/// Maps an in-memory batch (array, `{results}` object, or JSONL).
pub fn parse_documents(raw: &str) -> SourceBatch {
    let mut batch = SourceBatch::default();

    let values: Vec<Value> = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(mut obj)) => match obj.remove("results") {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(obj)],
        },
        Ok(other) => {
            warn!("Unsupported top-level JSON ({}), nothing read", type_name(&other));
            batch.skipped += 1;
            Vec::new()
        }
        Err(_) => read_jsonl(raw, &mut batch.skipped),
    };

    for (i, v) in values.iter().enumerate() {
        match document_from_value(v) {
            Ok(doc) => batch.documents.push(doc),
            Err(e) => {
                warn!("Skipping movie record #{}: {}", i + 1, e);
                batch.skipped += 1;
            }
        }
    }

    debug!(
        "Loaded {} documents ({} skipped)",
        batch.documents.len(),
        batch.skipped
    );
    batch
}

fn read_jsonl(raw: &str, skipped: &mut usize) -> Vec<Value> {
    let mut out = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => out.push(v),
            Err(e) => {
                warn!("Skipping malformed JSON on line {}: {}", i + 1, e);
                *skipped += 1;
            }
        }
    }
    out
}

/// Maps one raw movie object onto a [`Document`].
///
/// Requires an `id` (string or integer) and a non-empty `title`/`name`.
pub fn document_from_value(v: &Value) -> Result<Document, RagError> {
    let obj = v
        .as_object()
        .ok_or_else(|| RagError::Parse(format!("expected object, got {}", type_name(v))))?;

    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(RagError::Parse("missing id".into())),
    };
    let title = pick_str(obj, &["title", "name", "original_title", "originalTitle"])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RagError::Parse(format!("movie {id} has no title")))?
        .to_string();

    let overview_text = pick_str(obj, &["overview", "overviewText", "overview_text"])
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let release_date = pick_str(obj, &["release_date", "releaseDate", "release_pate"])
        .and_then(|s| parse_date(&id, s));

    Ok(Document {
        original_language: pick_str(obj, &["original_language", "originalLanguage"])
            .unwrap_or("")
            .to_string(),
        popularity: pick_f64(obj, &["popularity"]).unwrap_or(0.0),
        vote_average: pick_f64(obj, &["vote_average", "voteAverage"]).unwrap_or(0.0),
        vote_count: pick_f64(obj, &["vote_count", "voteCount"])
            .map(|f| f as i64)
            .unwrap_or(0),
        release_date,
        is_adult: pick_bool(obj, &["adult", "isAdult", "is_adult"]).unwrap_or(false),
        poster_path: pick_str(obj, &["poster_path", "posterPath"])
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string()),
        id,
        title,
        overview_text,
    })
}

/// `YYYY-MM-DD`, optionally followed by a time part.
fn parse_date(id: &str, s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let day = s.get(..10).unwrap_or(s);
    match NaiveDate::parse_from_str(day, "%Y-%m-%d") {
        Ok(d) => Some(d),
        Err(e) => {
            debug!("movie {id}: ignoring release date '{s}': {e}");
            None
        }
    }
}

fn pick_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// Numbers, or numeric strings.
fn pick_f64(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn pick_bool(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_and_camel_variants_map_to_one_shape() {
        let snake = r#"[{"id": 155, "title": "The Dark Knight", "overview": "Batman fights crime.",
            "original_language": "en", "popularity": 88.1, "vote_average": 8.5, "vote_count": 30000,
            "release_date": "2008-07-16", "adult": false, "poster_path": "/dk.jpg"}]"#;
        let camel = r#"{"results": [{"id": "155", "title": "The Dark Knight", "overviewText": "Batman fights crime.",
            "originalLanguage": "en", "popularity": 88.1, "voteAverage": 8.5, "voteCount": 30000,
            "release_pate": "2008-07-16T00:00:00Z", "isAdult": false, "posterPath": "/dk.jpg"}]}"#;
        let a = parse_documents(snake);
        let b = parse_documents(camel);
        assert_eq!(a.skipped, 0);
        assert_eq!(a.documents, b.documents);
        assert_eq!(
            a.documents[0].release_date,
            NaiveDate::from_ymd_opt(2008, 7, 16)
        );
    }

    #[test]
    fn jsonl_with_bad_lines_is_tolerated() {
        let raw = "{\"id\":1,\"title\":\"Alien\",\"overview\":\"In space.\"}\n\nnot json\n{\"id\":2}\n";
        let batch = parse_documents(raw);
        assert_eq!(batch.documents.len(), 1);
        assert_eq!(batch.documents[0].id, "1");
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn invalid_date_is_dropped_not_fatal() {
        let doc = document_from_value(&serde_json::json!({
            "id": "9", "title": "Plan 9", "release_date": "someday"
        }))
        .unwrap();
        assert_eq!(doc.release_date, None);
        assert_eq!(doc.overview_text, "");
    }
}
