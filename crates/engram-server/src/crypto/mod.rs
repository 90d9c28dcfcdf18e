// crates/engram-server/src/crypto/mod.rs
// Encryption provider chain: one primary for writes, fallbacks for reads

pub mod envelope;

mod dek;
mod plain;
mod wrapped;

pub use dek::DekProvider;
pub use plain::PlainProvider;
pub use wrapped::{KeyWrapper, LocalKeyWrapper, WrappedDekProvider};

use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngramError, Result};

/// One encryption backend. `seal` returns `None` for identity providers
/// (no envelope); otherwise `(iv, ciphertext)` which the chain wraps into
/// an MSEH envelope.
pub trait Provider: Send + Sync {
    fn id(&self) -> &'static str;
    fn seal(&self, plaintext: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn open(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
    /// 32 bytes of primary key material, fed through HKDF for derived
    /// keys (signed download URLs). Identity providers have none.
    fn key_material(&self) -> Option<[u8; 32]> {
        None
    }
}

/// Ordered provider chain. The first provider encrypts every new record;
/// decryption routes by the envelope's provider_id with the rest of the
/// chain as fallback. Adding a new primary while keeping the old provider
/// registered is a zero-downtime key rotation.
pub struct ProviderChain {
    primary: Arc<dyn Provider>,
    by_id: HashMap<&'static str, Arc<dyn Provider>>,
    order: Vec<&'static str>,
}

impl ProviderChain {
    pub fn new(ordered: Vec<Arc<dyn Provider>>) -> Result<Self> {
        let primary = ordered
            .first()
            .cloned()
            .ok_or_else(|| EngramError::Config("empty encryption chain".to_string()))?;
        let mut by_id = HashMap::new();
        let mut order = Vec::new();
        for provider in ordered {
            let id = provider.id();
            if by_id.insert(id, provider).is_some() {
                return Err(EngramError::Config(format!(
                    "duplicate encryption provider {id:?} in chain"
                )));
            }
            order.push(id);
        }
        Ok(Self { primary, by_id, order })
    }

    pub fn primary_id(&self) -> &str {
        self.primary.id()
    }

    pub fn provider_ids(&self) -> &[&'static str] {
        &self.order
    }

    /// Encrypt with the primary provider.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.primary.seal(plaintext)? {
            Some((iv, ciphertext)) => Ok(envelope::seal(self.primary.id(), &iv, &ciphertext)),
            None => Ok(plaintext.to_vec()),
        }
    }

    /// Decrypt a record. Unenveloped records are legacy plaintext and pass
    /// through. Enveloped records route to the named provider, then fall
    /// back to the rest of the chain; when nothing opens the record the
    /// result is `DecryptionFailed`.
    pub fn decrypt(&self, record: &[u8]) -> Result<Vec<u8>> {
        let Some((header, ciphertext)) = envelope::parse(record)? else {
            return Ok(record.to_vec());
        };

        if let Some(provider) = self.by_id.get(header.provider_id.as_str()) {
            match provider.open(&header.iv, ciphertext) {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) => {
                    tracing::debug!(
                        provider = %header.provider_id,
                        "routed provider failed to open record, trying fallbacks: {e}"
                    );
                }
            }
        }

        for id in &self.order {
            if *id == header.provider_id {
                continue;
            }
            if let Some(provider) = self.by_id.get(id) {
                if let Ok(plaintext) = provider.open(&header.iv, ciphertext) {
                    return Ok(plaintext);
                }
            }
        }

        Err(EngramError::DecryptionFailed(format!(
            "no provider in chain opens records written by {:?}",
            header.provider_id
        )))
    }

    /// A purpose-scoped signing key derived via HKDF from the primary
    /// provider's key material. Rotating the DEK rotates every derived
    /// key. Identity chains derive from a per-process random key instead,
    /// so signed URLs still work (but do not survive restarts).
    pub fn signing_key(&self, context: &[u8]) -> [u8; 32] {
        static PROCESS_KEY: OnceLock<[u8; 32]> = OnceLock::new();
        let ikm = self.primary.key_material().unwrap_or_else(|| {
            *PROCESS_KEY.get_or_init(|| {
                use rand::RngCore;
                let mut key = [0u8; 32];
                rand::rng().fill_bytes(&mut key);
                key
            })
        });
        let hk = Hkdf::<Sha256>::new(Some(b"engram-signing"), &ikm);
        let mut out = [0u8; 32];
        hk.expand(context, &mut out)
            .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF output length"));
        out
    }
}

/// Streaming encryption writer.
///
/// GCM computes its auth tag over the complete plaintext, so the sealer
/// buffers until `finish()`, then writes one envelope to the sink.
pub struct StreamSealer<W> {
    chain: Arc<ProviderChain>,
    sink: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> StreamSealer<W> {
    pub fn new(chain: Arc<ProviderChain>, sink: W) -> Self {
        Self { chain, sink, buf: Vec::new() }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub async fn finish(mut self) -> Result<()> {
        let record = self.chain.encrypt(&self.buf)?;
        self.sink.write_all(&record).await?;
        self.sink.flush().await?;
        Ok(())
    }
}

/// Streaming decryption: drain the source, open the record.
pub async fn open_stream<R: AsyncRead + Unpin>(
    chain: &ProviderChain,
    mut source: R,
) -> Result<Vec<u8>> {
    let mut record = Vec::new();
    source.read_to_end(&mut record).await?;
    chain.decrypt(&record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dek_chain(key_bytes: u8) -> ProviderChain {
        let provider = DekProvider::from_keys(vec![[key_bytes; 32]]).unwrap();
        ProviderChain::new(vec![Arc::new(provider)]).unwrap()
    }

    #[test]
    fn test_chain_round_trip() {
        let chain = dek_chain(1);
        let record = chain.encrypt(b"secret payload").unwrap();
        assert!(envelope::has_magic(&record));
        assert_eq!(chain.decrypt(&record).unwrap(), b"secret payload");
    }

    #[test]
    fn test_plain_chain_emits_no_envelope() {
        let chain = ProviderChain::new(vec![Arc::new(PlainProvider)]).unwrap();
        let record = chain.encrypt(b"visible").unwrap();
        assert_eq!(record, b"visible");
        assert_eq!(chain.decrypt(&record).unwrap(), b"visible");
    }

    #[test]
    fn test_legacy_plaintext_passthrough() {
        let chain = dek_chain(1);
        assert_eq!(chain.decrypt(b"legacy row").unwrap(), b"legacy row");
    }

    #[test]
    fn test_rotation_old_records_still_open() {
        // Records written under the original single-provider chain
        let old_chain = dek_chain(1);
        let old_record = old_chain.encrypt(b"pre-rotation").unwrap();

        // Rotated chain: a new primary, old provider kept as fallback.
        // The fallback here is a dek provider with the original key,
        // registered under the same id so routing finds it.
        let new_primary = DekProvider::from_keys(vec![[2u8; 32], [1u8; 32]]).unwrap();
        let rotated = ProviderChain::new(vec![Arc::new(new_primary)]).unwrap();

        assert_eq!(rotated.decrypt(&old_record).unwrap(), b"pre-rotation");

        let new_record = rotated.encrypt(b"post-rotation").unwrap();
        assert_eq!(rotated.decrypt(&new_record).unwrap(), b"post-rotation");

        // The pre-rotation chain cannot open post-rotation records
        assert!(matches!(
            old_chain.decrypt(&new_record),
            Err(EngramError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_unknown_provider_fails() {
        let record = envelope::seal("vault", &[0u8; 12], b"ciphertext");
        let chain = dek_chain(1);
        assert!(matches!(
            chain.decrypt(&record),
            Err(EngramError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_signing_key_is_stable_and_scoped() {
        let chain = dek_chain(1);
        let a1 = chain.signing_key(b"attachments");
        let a2 = chain.signing_key(b"attachments");
        let b = chain.signing_key(b"other");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);

        // Rotating the key material rotates derived keys
        let rotated = dek_chain(2);
        assert_ne!(rotated.signing_key(b"attachments"), a1);
    }

    #[tokio::test]
    async fn test_stream_sealer_round_trip() {
        let chain = Arc::new(dek_chain(1));
        let mut out = Vec::new();
        {
            let mut sealer = StreamSealer::new(chain.clone(), &mut out);
            sealer.write(b"chunk one ");
            sealer.write(b"chunk two");
            sealer.finish().await.unwrap();
        }
        let opened = open_stream(&chain, out.as_slice()).await.unwrap();
        assert_eq!(opened, b"chunk one chunk two");
    }
}
