// crates/engram-server/src/convo/attachments.rs
// Attachment lifecycle: a thin byte sink with TTLs and signed URLs

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use engram_types::AttachmentDto;

use crate::authz::Principal;
use crate::config::AttachmentConfig;
use crate::crypto::ProviderChain;
use crate::db::pool::DatabasePool;
use crate::db::types::AttachmentRow;
use crate::db::{self};
use crate::error::{EngramError, Result};
use crate::utils::to_storage_ts;

type HmacSha256 = Hmac<Sha256>;

/// HKDF context for URL-signing keys; rotating the primary DEK rotates
/// these too.
const SIGNING_CONTEXT: &[u8] = b"attachment-download-urls";

/// Where attachment bytes live. Payloads are encrypted through the
/// provider chain before they reach the sink.
#[async_trait]
pub trait AttachmentSink: Send + Sync {
    fn id(&self) -> &'static str;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem sink: one file per storage key under a flat directory.
pub struct FsAttachmentSink {
    dir: PathBuf,
}

impl FsAttachmentSink {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

#[async_trait]
impl AttachmentSink for FsAttachmentSink {
    fn id(&self) -> &'static str {
        "fs"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(self.path_for(key), bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngramError::NotFound("attachment bytes missing".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Attachment orchestration over (store rows, byte sink, signed URLs).
pub struct AttachmentService {
    pool: Arc<DatabasePool>,
    sink: Arc<dyn AttachmentSink>,
    chain: Arc<ProviderChain>,
    cfg: AttachmentConfig,
}

impl AttachmentService {
    pub fn new(
        pool: Arc<DatabasePool>,
        sink: Arc<dyn AttachmentSink>,
        chain: Arc<ProviderChain>,
        cfg: AttachmentConfig,
    ) -> Self {
        Self { pool, sink, chain, cfg }
    }

    pub fn sink_id(&self) -> &'static str {
        self.sink.id()
    }

    /// Create an unlinked attachment with the short initial TTL. The
    /// bytes arrive separately through `upload`.
    pub async fn create(
        &self,
        principal: &Principal,
        filename: Option<String>,
        content_type: String,
    ) -> Result<AttachmentDto> {
        let id = Uuid::new_v4().to_string();
        let storage_key = Uuid::new_v4().simple().to_string();
        let expires_at = to_storage_ts(
            chrono::Utc::now()
                + chrono::Duration::from_std(self.cfg.initial_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        );
        let user_id = principal.user_id.clone();
        let row_id = id.clone();
        let row_filename = filename.clone();
        let row_content_type = content_type.clone();
        let row_expiry = expires_at.clone();
        self.pool
            .run(move |conn| {
                db::create_attachment_sync(
                    conn,
                    &row_id,
                    &user_id,
                    &storage_key,
                    row_filename.as_deref(),
                    &row_content_type,
                    &row_expiry,
                )
            })
            .await?;

        self.get(principal, &id).await
    }

    /// Accept the uploaded bytes: size-check, digest, encrypt, persist.
    pub async fn upload(&self, principal: &Principal, id: &str, bytes: Vec<u8>) -> Result<AttachmentDto> {
        if bytes.len() as u64 > self.cfg.max_bytes {
            return Err(EngramError::BadRequest(format!(
                "attachment exceeds maximum of {} bytes",
                self.cfg.max_bytes
            )));
        }
        let row = self.owned_row(principal, id).await?;

        let sha256 = hex::encode(Sha256::digest(&bytes));
        let sealed = self.chain.encrypt(&bytes)?;
        self.sink.put(&row.storage_key, &sealed).await?;

        let size = bytes.len() as i64;
        let row_id = row.id.clone();
        let digest = sha256.clone();
        self.pool
            .run(move |conn| db::finalize_attachment_sync(conn, &row_id, size, &digest))
            .await?;
        self.get(principal, id).await
    }

    /// Extend an unlinked attachment's TTL, capped at the configured
    /// maximum past creation.
    pub async fn refresh_ttl(&self, principal: &Principal, id: &str) -> Result<AttachmentDto> {
        let row = self.owned_row(principal, id).await?;
        if row.entry_id.is_some() {
            return Err(EngramError::Conflict("attachment is already linked".to_string()));
        }
        let ceiling = chrono::DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| EngramError::Other(format!("bad created_at: {e}")))?
            .with_timezone(&chrono::Utc)
            + chrono::Duration::from_std(self.cfg.max_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let wanted = chrono::Utc::now()
            + chrono::Duration::from_std(self.cfg.initial_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let expires_at = to_storage_ts(wanted.min(ceiling));

        let row_id = row.id.clone();
        self.pool
            .run(move |conn| db::refresh_attachment_ttl_sync(conn, &row_id, &expires_at))
            .await?;
        self.get(principal, id).await
    }

    /// Link the attachment to a persisted entry, clearing its expiry.
    pub async fn link(&self, principal: &Principal, id: &str, entry_id: &str) -> Result<AttachmentDto> {
        let row = self.owned_row(principal, id).await?;
        let entry_key = entry_id.to_string();
        let entry = self
            .pool
            .run(move |conn| db::get_entry_by_id_sync(conn, &entry_key))
            .await?
            .ok_or_else(|| EngramError::NotFound(format!("entry {entry_id} not found")))?;

        let row_id = row.id.clone();
        let entry_key = entry.id.clone();
        self.pool
            .run(move |conn| db::link_attachment_sync(conn, &row_id, &entry_key))
            .await?;
        self.get(principal, id).await
    }

    pub async fn get(&self, principal: &Principal, id: &str) -> Result<AttachmentDto> {
        let row = self.owned_row(principal, id).await?;
        row_to_dto(row)
    }

    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<()> {
        let row = self.owned_row(principal, id).await?;
        self.sink.delete(&row.storage_key).await?;
        let row_id = row.id;
        self.pool
            .run(move |conn| db::delete_attachment_sync(conn, &row_id))
            .await?;
        Ok(())
    }

    /// A signed relative download URL, valid for `ttl_seconds`.
    pub async fn download_url(
        &self,
        principal: &Principal,
        id: &str,
        ttl_seconds: i64,
    ) -> Result<String> {
        let row = self.owned_row(principal, id).await?;
        let expiry = chrono::Utc::now().timestamp() + ttl_seconds.clamp(1, 24 * 3600);
        let signature = self.sign(&row.id, expiry);
        Ok(format!(
            "/v1/attachments/{}/data?exp={expiry}&sig={signature}",
            row.id
        ))
    }

    /// Serve a download authenticated by its URL signature alone.
    pub async fn download_signed(&self, id: &str, exp: i64, sig: &str) -> Result<(AttachmentRow, Vec<u8>)> {
        if chrono::Utc::now().timestamp() > exp {
            return Err(EngramError::Unauthenticated("download URL expired".to_string()));
        }
        if !self.verify(id, exp, sig) {
            return Err(EngramError::Unauthenticated("bad download signature".to_string()));
        }
        let id_owned = id.to_string();
        let row = self
            .pool
            .run(move |conn| db::get_attachment_sync(conn, &id_owned))
            .await?
            .ok_or_else(|| EngramError::NotFound("attachment not found".to_string()))?;
        let sealed = self.sink.get(&row.storage_key).await?;
        let bytes = self.chain.decrypt(&sealed)?;
        Ok((row, bytes))
    }

    /// Cleanup sweep: expired unlinked attachments vanish from both the
    /// store and the sink. Returns how many were removed.
    pub async fn sweep_expired(&self, batch: usize) -> Result<usize> {
        let now = crate::utils::now_ts();
        let rows = self
            .pool
            .run(move |conn| db::expired_attachments_sync(conn, &now, batch))
            .await?;
        let count = rows.len();
        for row in rows {
            if let Err(e) = self.sink.delete(&row.storage_key).await {
                tracing::warn!(attachment = %row.id, "sink delete failed during sweep: {e}");
            }
            let row_id = row.id.clone();
            self.pool
                .run(move |conn| db::delete_attachment_sync(conn, &row_id))
                .await?;
        }
        Ok(count)
    }

    fn sign(&self, id: &str, expiry: i64) -> String {
        let key = self.chain.signing_key(SIGNING_CONTEXT);
        let mut mac = HmacSha256::new_from_slice(&key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(format!("{id}.{expiry}").as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn verify(&self, id: &str, expiry: i64, signature: &str) -> bool {
        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let key = self.chain.signing_key(SIGNING_CONTEXT);
        let mut mac = HmacSha256::new_from_slice(&key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(format!("{id}.{expiry}").as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    async fn owned_row(&self, principal: &Principal, id: &str) -> Result<AttachmentRow> {
        let id_owned = id.to_string();
        let row = self
            .pool
            .run(move |conn| db::get_attachment_sync(conn, &id_owned))
            .await?
            .ok_or_else(|| EngramError::NotFound(format!("attachment {id} not found")))?;
        if row.user_id != principal.user_id && !principal.admin {
            return Err(EngramError::NotFound(format!("attachment {id} not found")));
        }
        Ok(row)
    }
}

fn row_to_dto(row: AttachmentRow) -> Result<AttachmentDto> {
    Ok(AttachmentDto {
        id: Uuid::parse_str(&row.id)
            .map_err(|e| EngramError::Other(format!("malformed attachment id: {e}")))?,
        user_id: row.user_id,
        filename: row.filename,
        content_type: row.content_type,
        size: row.size,
        sha256: row.sha256,
        entry_id: row
            .entry_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| EngramError::Other(format!("malformed entry id: {e}")))?,
        created_at: row.created_at,
        expires_at: row.expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DekProvider, PlainProvider};

    async fn service(dir: &std::path::Path) -> AttachmentService {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let sink = Arc::new(FsAttachmentSink::new(dir.to_path_buf()).unwrap());
        let chain = Arc::new(
            crate::crypto::ProviderChain::new(vec![Arc::new(
                DekProvider::from_keys(vec![[5u8; 32]]).unwrap(),
            )])
            .unwrap(),
        );
        AttachmentService::new(
            pool,
            sink,
            chain,
            AttachmentConfig {
                dir: dir.to_path_buf(),
                max_bytes: 1024,
                initial_ttl: std::time::Duration::from_secs(60),
                max_ttl: std::time::Duration::from_secs(24 * 3600),
            },
        )
    }

    #[tokio::test]
    async fn test_upload_and_signed_download() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let alice = Principal::user("alice");

        let created = service
            .create(&alice, Some("notes.txt".into()), "text/plain".into())
            .await
            .unwrap();
        assert!(created.expires_at.is_some());

        let uploaded = service
            .upload(&alice, &created.id.to_string(), b"attachment body".to_vec())
            .await
            .unwrap();
        assert_eq!(uploaded.size, 15);
        let expected_digest = hex::encode(Sha256::digest(b"attachment body"));
        assert_eq!(uploaded.sha256.as_deref(), Some(expected_digest.as_str()));

        let url = service
            .download_url(&alice, &created.id.to_string(), 300)
            .await
            .unwrap();
        let (exp, sig) = parse_url(&url);
        let (_, bytes) = service
            .download_signed(&created.id.to_string(), exp, &sig)
            .await
            .unwrap();
        assert_eq!(bytes, b"attachment body");

        // A tampered signature is rejected
        assert!(
            service
                .download_signed(&created.id.to_string(), exp, "forged")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_upload_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let alice = Principal::user("alice");
        let created = service.create(&alice, None, "application/octet-stream".into()).await.unwrap();
        let result = service
            .upload(&alice, &created.id.to_string(), vec![0u8; 2048])
            .await;
        assert!(matches!(result, Err(EngramError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_other_user_cannot_see_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");
        let created = service.create(&alice, None, "text/plain".into()).await.unwrap();
        assert!(matches!(
            service.get(&bob, &created.id.to_string()).await,
            Err(EngramError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_chain_still_signs_urls() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let sink = Arc::new(FsAttachmentSink::new(dir.path().to_path_buf()).unwrap());
        let chain =
            Arc::new(crate::crypto::ProviderChain::new(vec![Arc::new(PlainProvider)]).unwrap());
        let service = AttachmentService::new(
            pool,
            sink,
            chain,
            AttachmentConfig::default(),
        );
        let alice = Principal::user("alice");
        let created = service.create(&alice, None, "text/plain".into()).await.unwrap();
        let url = service.download_url(&alice, &created.id.to_string(), 60).await.unwrap();
        let (exp, sig) = parse_url(&url);
        assert!(service.verify(&created.id.to_string(), exp, &sig));
    }

    fn parse_url(url: &str) -> (i64, String) {
        let query = url.split_once('?').unwrap().1;
        let mut exp = 0;
        let mut sig = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "exp" => exp = v.parse().unwrap(),
                "sig" => sig = v.to_string(),
                _ => {}
            }
        }
        (exp, sig)
    }
}
