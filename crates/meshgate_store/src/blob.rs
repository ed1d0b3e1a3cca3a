//! Blob storage port.
//!
//! Textures, exports, and other binary artifacts travel through this port.
//! `put` is an upsert; pointers are `(bucket, key)` pairs.

use async_trait::async_trait;
use meshgate_state::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::project::RepoError;

/// Address of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobPointer {
    pub bucket: String,
    pub key: String,
}

/// A stored blob with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub cache_control: Option<String>,
    pub metadata: HashMap<String, String>,
    pub updated_at: Option<u64>,
}

/// Input for `put`.
#[derive(Debug, Clone)]
pub struct PutBlobInput {
    pub bucket: String,
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub cache_control: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Blob persistence port.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upsert; large payloads may be chunked by the adapter.
    async fn put(&self, input: PutBlobInput) -> Result<BlobPointer, RepoError>;

    async fn get(&self, pointer: &BlobPointer) -> Result<Option<BlobObject>, RepoError>;

    async fn delete(&self, pointer: &BlobPointer) -> Result<(), RepoError>;
}

/// In-memory adapter.
pub struct MemoryBlobStore {
    clock: Arc<dyn Clock>,
    blobs: Mutex<HashMap<BlobPointer, BlobObject>>,
}

impl MemoryBlobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, input: PutBlobInput) -> Result<BlobPointer, RepoError> {
        let pointer = BlobPointer {
            bucket: input.bucket,
            key: input.key,
        };
        let object = BlobObject {
            bytes: input.bytes,
            content_type: input.content_type,
            cache_control: input.cache_control,
            metadata: input.metadata,
            updated_at: Some(self.clock.now_ms()),
        };
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pointer.clone(), object);
        Ok(pointer)
    }

    async fn get(&self, pointer: &BlobPointer) -> Result<Option<BlobObject>, RepoError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(pointer)
            .cloned())
    }

    async fn delete(&self, pointer: &BlobPointer) -> Result<(), RepoError> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pointer);
        Ok(())
    }
}
