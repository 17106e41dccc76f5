//! Embedding-based conversation recall.
//!
//! The store treats embedding BLOBs as opaque; this module owns their
//! encoding (f32 little-endian) and similarity ranking. Recall is an
//! independent feature over the store's embedding operations — it is not on
//! the voice hot path.

use crate::store::{EmbeddingRow, Store, StoreError};

/// Encode an embedding vector as a little-endian f32 blob.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob back to a vector.
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// A recalled snippet and its similarity to the query.
#[derive(Debug, Clone)]
pub struct RecallHit {
    pub conversation_id: i64,
    pub text: String,
    pub similarity: f32,
}

/// Store an embedding for a conversation turn.
pub fn remember(
    store: &Store,
    conversation_id: i64,
    text: &str,
    embedding: &[f32],
) -> Result<i64, StoreError> {
    store.store_embedding(conversation_id, text, &embedding_to_blob(embedding), "")
}

/// Rank a conversation's stored embeddings against a query vector,
/// best match first. Low-similarity rows are dropped.
pub fn recall(
    store: &Store,
    conversation_id: i64,
    query: &[f32],
    limit: usize,
) -> Result<Vec<RecallHit>, StoreError> {
    let rows = store.retrieve_embeddings(conversation_id)?;
    Ok(rank(rows, query, limit))
}

fn rank(rows: Vec<EmbeddingRow>, query: &[f32], limit: usize) -> Vec<RecallHit> {
    let mut hits: Vec<RecallHit> = rows
        .into_iter()
        .map(|row| {
            let embedding = blob_to_embedding(&row.embedding);
            RecallHit {
                conversation_id: row.conversation_id,
                text: row.text_content,
                similarity: cosine_similarity(query, &embedding),
            }
        })
        .filter(|h| h.similarity > 0.1)
        .collect();

    hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn blob_roundtrip() {
        let v = vec![0.1f32, -2.5, 3.75, 0.0];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&v)), v);
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &c).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn recall_ranks_by_similarity() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let conv = store.record_conversation("user", "groceries", "", 0).unwrap();

        remember(&store, conv, "bought apples", &[1.0, 0.0]).unwrap();
        remember(&store, conv, "watched a film", &[0.0, 1.0]).unwrap();
        remember(&store, conv, "bought oranges", &[0.9, 0.1]).unwrap();

        let hits = recall(&store, conv, &[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "bought apples");
        assert_eq!(hits[1].text, "bought oranges");
    }

    #[test]
    fn recall_limit_applies() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let conv = store.record_conversation("user", "x", "", 0).unwrap();
        for i in 0..4 {
            remember(&store, conv, &format!("note {}", i), &[1.0, i as f32 * 0.1]).unwrap();
        }
        assert_eq!(recall(&store, conv, &[1.0, 0.0], 2).unwrap().len(), 2);
    }
}
