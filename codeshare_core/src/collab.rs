//! Interface of the companion upload service, plus an in-process implementation.

use crate::rendezvous::now_ms;
use crate::transfer::hash::hash_bytes;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    /// Unknown id, or a secret that does not match
    #[error("file not found")]
    NotFound,

    #[error("upload service error: {0}")]
    Service(String),
}

/// Returned once per upload; the secret is never retrievable again
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub file_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub file_hash: String,
    pub uploaded_at_ms: u64,
}

pub trait UploadService: Send + Sync {
    fn upload(
        &self,
        name: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<UploadReceipt, UploadError>> + Send;

    /// Metadata for `file_id`, only when `secret` matches the one issued at upload
    fn fetch_metadata(
        &self,
        file_id: &str,
        secret: &str,
    ) -> impl Future<Output = Result<FileMetadata, UploadError>> + Send;

    fn delete(&self, file_id: &str) -> impl Future<Output = Result<(), UploadError>> + Send;
}

struct StoredUpload {
    metadata: FileMetadata,
    /// Digest of the issued secret
    secret: blake3::Hash,
    data: Bytes,
}

impl StoredUpload {
    fn authorize(&self, secret: &str) -> Result<&Self, UploadError> {
        // blake3::Hash equality is constant-time
        if self.secret == blake3::hash(secret.as_bytes()) {
            Ok(self)
        } else {
            Err(UploadError::NotFound)
        }
    }
}

#[derive(Default)]
pub struct MemoryUploadService {
    files: RwLock<HashMap<String, StoredUpload>>,
}

impl MemoryUploadService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    /// Stored bytes, under the same secret check as [`UploadService::fetch_metadata`]
    pub async fn fetch_content(&self, file_id: &str, secret: &str) -> Result<Bytes, UploadError> {
        let files = self.files.read().await;
        let stored = files.get(file_id).ok_or(UploadError::NotFound)?;
        Ok(stored.authorize(secret)?.data.clone())
    }
}

impl UploadService for MemoryUploadService {
    async fn upload(&self, name: &str, data: Bytes) -> Result<UploadReceipt, UploadError> {
        let file_id = Uuid::new_v4().simple().to_string();
        let secret = Uuid::new_v4().simple().to_string();

        let metadata = FileMetadata {
            file_id: file_id.clone(),
            name: name.to_string(),
            size: data.len() as u64,
            file_hash: hash_bytes(&data),
            uploaded_at_ms: now_ms(),
        };
        self.files.write().await.insert(
            file_id.clone(),
            StoredUpload {
                metadata,
                secret: blake3::hash(secret.as_bytes()),
                data,
            },
        );
        debug!(file_id = %file_id, "Stored upload");

        Ok(UploadReceipt { file_id, secret })
    }

    async fn fetch_metadata(
        &self,
        file_id: &str,
        secret: &str,
    ) -> Result<FileMetadata, UploadError> {
        let files = self.files.read().await;
        let stored = files.get(file_id).ok_or(UploadError::NotFound)?;
        Ok(stored.authorize(secret)?.metadata.clone())
    }

    async fn delete(&self, file_id: &str) -> Result<(), UploadError> {
        self.files
            .write()
            .await
            .remove(file_id)
            .map(|_| ())
            .ok_or(UploadError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_requires_matching_secret() {
        let service = MemoryUploadService::new();
        let receipt = service
            .upload("notes.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let meta = service
            .fetch_metadata(&receipt.file_id, &receipt.secret)
            .await
            .unwrap();
        assert_eq!(meta.name, "notes.txt");
        assert_eq!(meta.size, 5);
        assert_eq!(meta.file_hash, hash_bytes(b"hello"));
        assert_eq!(
            service.fetch_content(&receipt.file_id, &receipt.secret).await.unwrap(),
            Bytes::from_static(b"hello")
        );

        assert_eq!(
            service.fetch_metadata(&receipt.file_id, "wrong").await,
            Err(UploadError::NotFound)
        );
        assert_eq!(
            service.fetch_metadata("missing", &receipt.secret).await,
            Err(UploadError::NotFound)
        );
        assert_eq!(
            service.fetch_content(&receipt.file_id, "wrong").await,
            Err(UploadError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let service = MemoryUploadService::new();
        let receipt = service.upload("a", Bytes::new()).await.unwrap();

        assert_eq!(service.delete(&receipt.file_id).await, Ok(()));
        assert_eq!(service.delete(&receipt.file_id).await, Err(UploadError::NotFound));
        assert_eq!(service.len().await, 0);
    }
}
