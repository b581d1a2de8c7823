//! TTL'd attachment storage.
//!
//! Uploaded files live on disk next to a JSON sidecar with their metadata,
//! so expiry survives a relay restart. The sweeper evicts expired pairs.

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::util::{deadline_ms, now_ms};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: String,
    pub session_id: String,
    pub owner_user_id: String,
    pub uploader_user_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
    ttl: Duration,
    max_bytes: u64,
}

impl AttachmentStore {
    pub fn new(dir: PathBuf, ttl: Duration, max_bytes: u64) -> Self {
        Self { dir, ttl, max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn data_path(&self, attachment_id: &str) -> PathBuf {
        self.dir.join(attachment_id)
    }

    fn meta_path(&self, attachment_id: &str) -> PathBuf {
        self.dir.join(format!("{attachment_id}.json"))
    }

    /// Store an upload. The content type falls back to a guess from the
    /// filename.
    pub async fn save(
        &self,
        session_id: &str,
        owner_user_id: &str,
        uploader_user_id: &str,
        filename: &str,
        mime_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<Attachment> {
        if bytes.len() as u64 > self.max_bytes {
            anyhow::bail!(
                "attachment exceeds maximum size of {} bytes",
                self.max_bytes
            );
        }

        fs::create_dir_all(&self.dir)
            .await
            .context("creating attachment directory")?;

        let mime_type = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });

        let attachment = Attachment {
            attachment_id: nanoid::nanoid!(),
            session_id: session_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            uploader_user_id: uploader_user_id.to_string(),
            filename: filename.to_string(),
            mime_type,
            size: bytes.len() as u64,
            created_at: now_ms(),
            expires_at: deadline_ms(self.ttl),
        };

        fs::write(self.data_path(&attachment.attachment_id), bytes)
            .await
            .context("writing attachment data")?;
        fs::write(
            self.meta_path(&attachment.attachment_id),
            serde_json::to_vec(&attachment).context("serializing attachment metadata")?,
        )
        .await
        .context("writing attachment metadata")?;

        Ok(attachment)
    }

    async fn read_meta(&self, attachment_id: &str) -> Option<Attachment> {
        let raw = fs::read(self.meta_path(attachment_id)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Metadata and bytes, or None when unknown or expired.
    pub async fn get(&self, attachment_id: &str) -> Result<Option<(Attachment, Vec<u8>)>> {
        let Some(meta) = self.read_meta(attachment_id).await else {
            return Ok(None);
        };
        if meta.expires_at <= now_ms() {
            return Ok(None);
        }
        let bytes = fs::read(self.data_path(attachment_id))
            .await
            .context("reading attachment data")?;
        Ok(Some((meta, bytes)))
    }

    /// Evict attachments past their expiry. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err).context("reading attachment directory"),
        };

        let now = now_ms();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await.context("iterating attachments")? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Some(meta) = self.read_meta(id).await else {
                continue;
            };
            if meta.expires_at <= now {
                debug!("sweeping expired attachment {id}");
                let _ = fs::remove_file(self.data_path(id)).await;
                let _ = fs::remove_file(self.meta_path(id)).await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, ttl_ms: u64, max_bytes: u64) -> AttachmentStore {
        AttachmentStore::new(
            dir.path().to_path_buf(),
            Duration::from_millis(ttl_ms),
            max_bytes,
        )
    }

    #[tokio::test]
    async fn save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 60_000, 1024);

        let saved = store
            .save("s-1", "u-1", "u-2", "diff.patch", None, b"hello")
            .await
            .unwrap();
        assert_eq!(saved.size, 5);
        assert_eq!(saved.session_id, "s-1");

        let (meta, bytes) = store.get(&saved.attachment_id).await.unwrap().unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(meta.uploader_user_id, "u-2");
    }

    #[tokio::test]
    async fn mime_type_guessed_from_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 60_000, 1024);
        let saved = store
            .save("s-1", "u-1", "u-1", "shot.png", None, b"png")
            .await
            .unwrap();
        assert_eq!(saved.mime_type, "image/png");

        let explicit = store
            .save("s-1", "u-1", "u-1", "shot.png", Some("image/webp"), b"x")
            .await
            .unwrap();
        assert_eq!(explicit.mime_type, "image/webp");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 60_000, 4);
        assert!(
            store
                .save("s-1", "u-1", "u-1", "big.bin", None, b"too big")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn expired_attachments_are_invisible_and_swept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1, 1024);
        let saved = store
            .save("s-1", "u-1", "u-1", "f.txt", None, b"x")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get(&saved.attachment_id).await.unwrap().is_none());

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        assert!(!dir.path().join(&saved.attachment_id).exists());
    }

    #[tokio::test]
    async fn sweep_on_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(
            dir.path().join("never-created"),
            Duration::from_secs(1),
            1024,
        );
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
    }
}
