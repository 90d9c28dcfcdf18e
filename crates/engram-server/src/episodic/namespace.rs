// crates/engram-server/src/episodic/namespace.rs
// Namespace encoding: percent-encoded segments joined by ASCII RS
//
// Percent-encoding guarantees a segment can never contain the separator,
// so "alice" is never a prefix of "aliced" after encoding: prefix
// matching is startsWith(encoded + RS) or exact equality. The encoded
// form is wire-stable (it appears in vector-store ancestor lists).

use crate::error::{EngramError, Result};

/// ASCII record separator.
pub const SEPARATOR: char = '\u{1e}';

/// Keys are bounded; namespaces segments too, defensively.
const MAX_KEY_BYTES: usize = 1024;

/// Validate a raw namespace against the configured depth cap.
pub fn validate(segments: &[String], max_depth: usize) -> Result<()> {
    if segments.is_empty() {
        return Err(EngramError::BadRequest("namespace must not be empty".to_string()));
    }
    if segments.len() > max_depth {
        return Err(EngramError::BadRequest(format!(
            "namespace depth {} exceeds maximum {max_depth}",
            segments.len()
        )));
    }
    for segment in segments {
        if segment.is_empty() {
            return Err(EngramError::BadRequest(
                "namespace segments must not be empty".to_string(),
            ));
        }
    }
    Ok(())
}

/// Validate an item key (non-empty, bounded).
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(EngramError::BadRequest("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(EngramError::BadRequest(format!(
            "key exceeds {MAX_KEY_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Encode a namespace to its storage form.
pub fn encode(segments: &[String]) -> String {
    segments
        .iter()
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

/// Decode a storage-form namespace back to its segments. Undecodable
/// segments pass through verbatim (they cannot occur for rows this
/// service wrote).
pub fn decode(encoded: &str) -> Vec<String> {
    encoded
        .split(SEPARATOR)
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .collect()
}

/// Whether `encoded` sits at or under `encoded_prefix`.
pub fn has_prefix(encoded: &str, encoded_prefix: &str) -> bool {
    encoded == encoded_prefix
        || encoded.starts_with(&format!("{encoded_prefix}{SEPARATOR}"))
}

/// Cumulative ancestor prefixes, outermost first, ending with the full
/// namespace. Stored beside memory vectors so a prefix search becomes an
/// exact membership match.
pub fn ancestor_prefixes(encoded: &str) -> Vec<String> {
    let segments: Vec<&str> = encoded.split(SEPARATOR).collect();
    let mut prefixes = Vec::with_capacity(segments.len());
    let mut current = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            current.push(SEPARATOR);
        }
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let original = ns(&["user", "alice smith", "notes/2026"]);
        let encoded = encode(&original);
        assert!(!encoded.contains(' '));
        assert!(!encoded.contains('/'));
        assert_eq!(decode(&encoded), original);
    }

    #[test]
    fn test_prefix_safety() {
        // "alice" must not match "aliced"
        let alice = encode(&ns(&["user", "alice"]));
        let aliced = encode(&ns(&["user", "aliced"]));
        assert!(!has_prefix(&aliced, &alice));

        let nested = encode(&ns(&["user", "alice", "notes"]));
        assert!(has_prefix(&nested, &alice));
        assert!(has_prefix(&alice, &alice));
    }

    #[test]
    fn test_segment_cannot_smuggle_separator() {
        // A segment containing a literal RS encodes away from the separator
        let tricky = ns(&[&format!("user{SEPARATOR}alice")]);
        let encoded = encode(&tricky);
        assert_eq!(encoded.matches(SEPARATOR).count(), 0);
        assert_eq!(decode(&encoded), tricky);
    }

    #[test]
    fn test_ancestor_prefixes() {
        let encoded = encode(&ns(&["user", "alice", "notes"]));
        let prefixes = ancestor_prefixes(&encoded);
        assert_eq!(prefixes.len(), 3);
        assert_eq!(prefixes[0], encode(&ns(&["user"])));
        assert_eq!(prefixes[1], encode(&ns(&["user", "alice"])));
        assert_eq!(prefixes[2], encoded);
    }

    #[test]
    fn test_validation() {
        assert!(validate(&ns(&["user", "alice"]), 16).is_ok());
        assert!(validate(&[], 16).is_err());
        assert!(validate(&ns(&["user", ""]), 16).is_err());
        assert!(validate(&ns(&["a", "b", "c"]), 2).is_err());

        assert!(validate_key("python_tip").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(1025)).is_err());
    }
}
