use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Storage, StorageError};

/// An object held by a [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content: Bytes,
    pub content_type: String,
    pub created: SystemTime,
}

/// In-memory storage.
///
/// Handy to embed the cacher without any object store, and to observe what the pipeline persisted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, StoredObject>>,
    uploads: AtomicUsize,
    read_only: AtomicBool,
    failing_lookups: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object as is, bypassing [`Storage::upload`] and its accounting.
    pub fn insert(&self, key: impl Into<String>, object: StoredObject) {
        self.objects.write().unwrap_or_else(PoisonError::into_inner).insert(key.into(), object);
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// List stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of successful uploads so far.
    #[inline]
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Acquire)
    }

    /// Reject every upload with a permission error while set.
    #[inline]
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Fail every creation time lookup with an I/O error while set.
    #[inline]
    pub fn set_failing_lookups(&self, failing: bool) {
        self.failing_lookups.store(failing, Ordering::Release);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upload(&self, content: Bytes, key: &str, content_type: &str, overwrite: bool) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into());
        }

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);

        if !overwrite && objects.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_owned()));
        }

        objects.insert(
            key.to_owned(),
            StoredObject {
                content,
                content_type: content_type.to_owned(),
                created: SystemTime::now(),
            },
        );
        self.uploads.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    async fn creation_time(&self, key: &str) -> Result<Option<SystemTime>, StorageError> {
        if self.failing_lookups.load(Ordering::Acquire) {
            return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
        }

        Ok(self.get(key).map(|object| object.created))
    }
}
