// crates/engram-server/src/search/mod.rs
// Vector and full-text indices over entries and episodic memories

mod fulltext;
mod vector;

pub use fulltext::FullTextIndex;
pub use vector::{EntryHit, EntrySearchFilter, MemoryVector, SqliteVectorIndex};

/// Serialize an embedding for sqlite-vec (little-endian f32 array).
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Cosine distance → similarity score in (0, 1]. Identical vectors score
/// 1.0; unrelated ones decay toward 0.
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_bytes_little_endian() {
        let bytes = embedding_to_bytes(&[1.0f32]);
        assert_eq!(bytes, 1.0f32.to_le_bytes());
    }

    #[test]
    fn test_score_range() {
        assert_eq!(distance_to_score(0.0), 1.0);
        let far = distance_to_score(2.0);
        assert!(far > 0.0 && far < 1.0);
        // Negative distances (numeric noise) clamp instead of exceeding 1.0
        assert_eq!(distance_to_score(-0.1), 1.0);
    }
}
