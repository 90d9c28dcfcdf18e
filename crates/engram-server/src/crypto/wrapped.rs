// crates/engram-server/src/crypto/wrapped.rs
// DEKs wrapped by a key-encryption key and persisted in the store
//
// The remote KMS/Vault client is an external collaborator behind the
// KeyWrapper trait. DEK rows are unwrapped once at startup; afterwards
// every record operation is local AES-GCM with zero remote calls.
// Inserting a new row rotates the encrypting DEK.

use hkdf::Hkdf;
use sha2::Sha256;
use std::sync::Arc;

use super::Provider;
use super::dek::{gcm_open, gcm_seal};
use crate::db::pool::DatabasePool;
use crate::error::{EngramError, Result};

/// Wraps and unwraps DEKs with a KEK held elsewhere.
pub trait KeyWrapper: Send + Sync {
    fn wrap(&self, dek: &[u8; 32]) -> Result<Vec<u8>>;
    fn unwrap_dek(&self, wrapped: &[u8]) -> Result<[u8; 32]>;
}

/// A local KEK derived from a passphrase via HKDF-SHA256. Stands in for
/// the remote wrapper in dev and tests; the wrapped-DEK rows it produces
/// are indistinguishable from remotely wrapped ones.
pub struct LocalKeyWrapper {
    kek: [u8; 32],
}

impl LocalKeyWrapper {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(b"engram-kek"), passphrase.as_bytes());
        let mut kek = [0u8; 32];
        hk.expand(b"kek-v1", &mut kek)
            .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF output length"));
        Self { kek }
    }
}

impl KeyWrapper for LocalKeyWrapper {
    fn wrap(&self, dek: &[u8; 32]) -> Result<Vec<u8>> {
        let (iv, ct) = gcm_seal(&self.kek, dek)?;
        let mut out = iv;
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn unwrap_dek(&self, wrapped: &[u8]) -> Result<[u8; 32]> {
        if wrapped.len() < 12 {
            return Err(EngramError::DecryptionFailed("wrapped DEK too short".to_string()));
        }
        let (iv, ct) = wrapped.split_at(12);
        let dek = gcm_open(&[self.kek], iv, ct)?;
        dek.try_into()
            .map_err(|_| EngramError::DecryptionFailed("wrapped DEK has wrong length".to_string()))
    }
}

/// The `wrapped` provider: AES-256-GCM over store-persisted DEKs.
pub struct WrappedDekProvider {
    /// Newest first; the first entry encrypts.
    deks: Vec<[u8; 32]>,
}

impl WrappedDekProvider {
    pub const PROVIDER_ID: &'static str = "wrapped";

    /// Load every wrapped DEK row, unwrap through the KEK, and hold the
    /// plaintext keys in memory. A fresh deployment gets its first DEK
    /// generated and persisted here.
    pub async fn load(pool: &Arc<DatabasePool>, wrapper: Arc<dyn KeyWrapper>) -> Result<Self> {
        let rows = pool
            .run(|conn| crate::db::load_deks_sync(conn, Self::PROVIDER_ID))
            .await?;

        if rows.is_empty() {
            let mut dek = [0u8; 32];
            use rand::RngCore;
            rand::rng().fill_bytes(&mut dek);
            let wrapped = wrapper.wrap(&dek)?;
            pool.run(move |conn| {
                crate::db::insert_dek_sync(conn, Self::PROVIDER_ID, &wrapped)
            })
            .await?;
            tracing::info!("generated initial wrapped DEK");
            return Ok(Self { deks: vec![dek] });
        }

        let mut deks = Vec::with_capacity(rows.len());
        for row in rows {
            deks.push(wrapper.unwrap_dek(&row.wrapped_dek)?);
        }
        tracing::debug!(count = deks.len(), "unwrapped persisted DEKs");
        Ok(Self { deks })
    }
}

impl Provider for WrappedDekProvider {
    fn id(&self) -> &'static str {
        Self::PROVIDER_ID
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        gcm_seal(&self.deks[0], plaintext).map(Some)
    }

    fn open(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        gcm_open(&self.deks, iv, ciphertext)
    }

    fn key_material(&self) -> Option<[u8; 32]> {
        Some(self.deks[0])
    }
}
