// crates/engram-server/src/crypto/plain.rs
// Identity provider: no envelope, passthrough reads

use super::Provider;
use crate::error::{EngramError, Result};

/// The `plain` provider writes records untouched and emits no envelope.
/// Reads of unenveloped records never reach a provider (the chain treats
/// them as passthrough), so `open` only fires on a corrupted record that
/// names "plain" in its header.
pub struct PlainProvider;

impl Provider for PlainProvider {
    fn id(&self) -> &'static str {
        "plain"
    }

    fn seal(&self, _plaintext: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(None)
    }

    fn open(&self, _iv: &[u8], _ciphertext: &[u8]) -> Result<Vec<u8>> {
        Err(EngramError::DecryptionFailed(
            "plain provider cannot open enveloped records".to_string(),
        ))
    }
}
