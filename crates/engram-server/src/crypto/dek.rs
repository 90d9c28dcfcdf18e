// crates/engram-server/src/crypto/dek.rs
// AES-256-GCM provider over a CSV of raw keys

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::Provider;
use crate::error::{EngramError, Result};

pub const IV_LEN: usize = 12;

/// The `dek` provider: AES-256-GCM with locally configured keys.
///
/// Keys arrive as a CSV (hex or base64, 32 bytes each). The first key
/// encrypts; the rest are legacy decrypt-only keys kept through rotation.
pub struct DekProvider {
    keys: Vec<[u8; 32]>,
}

impl DekProvider {
    pub fn from_csv(csv: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for part in csv.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            keys.push(parse_key(part)?);
        }
        if keys.is_empty() {
            return Err(EngramError::Config(
                "dek provider requires at least one key".to_string(),
            ));
        }
        Ok(Self { keys })
    }

    pub fn from_keys(keys: Vec<[u8; 32]>) -> Result<Self> {
        if keys.is_empty() {
            return Err(EngramError::Config(
                "dek provider requires at least one key".to_string(),
            ));
        }
        Ok(Self { keys })
    }
}

/// Parse one key: 64 hex chars or base64 of 32 bytes.
fn parse_key(s: &str) -> Result<[u8; 32]> {
    let bytes = if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(s).map_err(|e| EngramError::Config(format!("bad hex key: {e}")))?
    } else {
        BASE64
            .decode(s)
            .map_err(|e| EngramError::Config(format!("bad base64 key: {e}")))?
    };
    bytes
        .try_into()
        .map_err(|_| EngramError::Config("encryption keys must be exactly 32 bytes".to_string()))
}

/// Encrypt with a random 12-byte IV. Shared with the wrapped provider.
pub(crate) fn gcm_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EngramError::Config(format!("bad AES key: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| EngramError::Other(format!("AES-GCM encrypt failed: {e}")))?;
    Ok((nonce.to_vec(), ciphertext))
}

/// Try each key in order; the GCM tag rejects wrong keys.
pub(crate) fn gcm_open(keys: &[[u8; 32]], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LEN {
        return Err(EngramError::DecryptionFailed(format!(
            "expected {IV_LEN}-byte IV, got {}",
            iv.len()
        )));
    }
    let nonce = Nonce::from_slice(iv);
    for key in keys {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| EngramError::Config(format!("bad AES key: {e}")))?;
        if let Ok(plaintext) = cipher.decrypt(nonce, ciphertext) {
            return Ok(plaintext);
        }
    }
    Err(EngramError::DecryptionFailed(
        "no configured key opens this record".to_string(),
    ))
}

impl Provider for DekProvider {
    fn id(&self) -> &'static str {
        "dek"
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        gcm_seal(&self.keys[0], plaintext).map(Some)
    }

    fn open(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        gcm_open(&self.keys, iv, ciphertext)
    }

    fn key_material(&self) -> Option<[u8; 32]> {
        Some(self.keys[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> [u8; 32] {
        [n; 32]
    }

    #[test]
    fn test_round_trip() {
        let provider = DekProvider::from_keys(vec![key(1)]).unwrap();
        let (iv, ct) = provider.seal(b"hello").unwrap().unwrap();
        assert_eq!(iv.len(), IV_LEN);
        assert_ne!(ct, b"hello");
        assert_eq!(provider.open(&iv, &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_legacy_key_still_decrypts() {
        let old = DekProvider::from_keys(vec![key(1)]).unwrap();
        let (iv, ct) = old.seal(b"vintage").unwrap().unwrap();

        // Rotated: new primary, old key kept as legacy
        let rotated = DekProvider::from_keys(vec![key(2), key(1)]).unwrap();
        assert_eq!(rotated.open(&iv, &ct).unwrap(), b"vintage");

        // New writes use the new key; the old provider cannot open them
        let (iv2, ct2) = rotated.seal(b"fresh").unwrap().unwrap();
        assert!(old.open(&iv2, &ct2).is_err());
    }

    #[test]
    fn test_csv_hex_and_base64() {
        let hex_key = hex::encode(key(3));
        let b64_key = BASE64.encode(key(4));
        let provider = DekProvider::from_csv(&format!("{hex_key}, {b64_key}")).unwrap();
        let (iv, ct) = provider.seal(b"x").unwrap().unwrap();
        assert_eq!(provider.open(&iv, &ct).unwrap(), b"x");
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(DekProvider::from_csv(&hex::encode([1u8; 16])).is_err());
        assert!(DekProvider::from_csv("").is_err());
    }
}
