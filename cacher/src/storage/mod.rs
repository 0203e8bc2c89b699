//! This module provides the object storage seam cached assets are persisted to.

use std::fmt::Debug;
use std::io;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod fs;
pub use fs::FsStorage;

mod memory;
pub use memory::{MemoryStorage, StoredObject};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
}

/// Object storage interface.
///
/// Implementors must be safe for unsynchronized concurrent use by every worker of the pool.
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Persist `content` under `key` with the given content type.
    ///
    /// The object must either be fully written or not written at all. When `overwrite` is `false`,
    /// an existing object is left untouched and [`StorageError::AlreadyExists`] is returned.
    async fn upload(&self, content: Bytes, key: &str, content_type: &str, overwrite: bool) -> Result<(), StorageError>;

    /// Return the creation time of the object stored under `key`, or `None` if there is no such object.
    async fn creation_time(&self, key: &str) -> Result<Option<SystemTime>, StorageError>;
}
