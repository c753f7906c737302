use uuid::Uuid;

/// Deterministic UUIDv5 from an arbitrary string id
pub fn stable_uuid(id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, id.as_bytes())
}

/// Stable chunk id for `(document_id, chunk_index)`.
///
/// Re-ingesting the same document yields the same ids, so writes overwrite
/// instead of duplicating.
pub fn chunk_uuid(document_id: &str, chunk_index: usize) -> Uuid {
    stable_uuid(&format!("movie:{document_id}#chunk:{chunk_index}"))
}
