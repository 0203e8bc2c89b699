use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{fs, io};

use super::{Storage, StorageError};

const TEMP_EXT: &str = "tmp";

/// Local filesystem storage.
///
/// Object keys are mapped to relative paths under a root directory, `/` separating directories. Objects are first written to a
/// temporary file next to their final location and then moved in place, so readers never observe partial content.
///
/// _Note: the content type is not retained by this backend, it is only meaningful to object stores serving HTTP._
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Return the path in the local storage related to this object key.
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);

        let valid = !key.is_empty() && relative.components().all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }

        Ok(self.root.join(relative))
    }

    /// Return a temporary path unique to this upload, next to the final object path.
    fn temp_path(path: &Path) -> PathBuf {
        static UPLOAD_ID: AtomicUsize = AtomicUsize::new(0);
        let id = UPLOAD_ID.fetch_add(1, Ordering::Relaxed);

        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{id}.{TEMP_EXT}"));

        path.with_file_name(name)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn upload(&self, content: Bytes, key: &str, content_type: &str, overwrite: bool) -> Result<(), StorageError> {
        use io::AsyncWriteExt;

        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = Self::temp_path(&path);

        tracing::trace!("Writing object `{key}` ({content_type}, {} bytes) to local storage: `{}`", content.len(), tmp.display());

        let file = fs::File::options().write(true).create_new(true).open(&tmp).await?;
        let mut writer = io::BufWriter::new(file);

        writer.write_all(&content).await?;
        writer.shutdown().await?;
        writer.into_inner().sync_all().await?;

        let moved = if overwrite {
            fs::rename(&tmp, &path).await
        } else {
            // linking fails when the destination exists, which makes the no-clobber check atomic
            let linked = fs::hard_link(&tmp, &path).await;
            let _ = fs::remove_file(&tmp).await;
            linked
        };

        match moved {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(StorageError::AlreadyExists(key.to_owned())),
            Err(err) => {
                let _ = fs::remove_file(&tmp).await;
                Err(err.into())
            }
        }
    }

    async fn creation_time(&self, key: &str) -> Result<Option<SystemTime>, StorageError> {
        let path = self.object_path(key)?;

        match fs::metadata(&path).await {
            // objects are only ever replaced as a whole, so the last modification is the time the current object was created
            Ok(metadata) => Ok(Some(metadata.modified()?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path() {
        let storage = FsStorage::new("a/b");

        let path = storage.object_path("42/https!3A!2F!2Fcdn.example!2Fapp.css").unwrap();
        assert!(
            path.iter().eq(["a", "b", "42", "https!3A!2F!2Fcdn.example!2Fapp.css"]),
            "'{}' didn't match expected path",
            path.display()
        );

        for key in ["", "/etc/passwd", "../escape", "js/../../escape", "./js"] {
            assert!(matches!(storage.object_path(key), Err(StorageError::InvalidKey(_))), "{key:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_upload_and_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());

        assert_eq!(storage.creation_time("js/lib.js").await.unwrap(), None);

        let before = SystemTime::now() - std::time::Duration::from_secs(1);
        storage.upload(Bytes::from_static(b"let a;"), "js/lib.js", "text/javascript", false).await.unwrap();

        let created = storage.creation_time("js/lib.js").await.unwrap().unwrap();
        assert!(created >= before);
        assert_eq!(std::fs::read(dir.path().join("js/lib.js")).unwrap(), b"let a;");

        // no temporary file is left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("js")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());

        storage.upload(Bytes::from_static(b"v1"), "1/a.png", "image/png", false).await.unwrap();

        let err = storage.upload(Bytes::from_static(b"v2"), "1/a.png", "image/png", false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(key) if key == "1/a.png"));
        assert_eq!(std::fs::read(dir.path().join("1/a.png")).unwrap(), b"v1");

        storage.upload(Bytes::from_static(b"v2"), "1/a.png", "image/png", true).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("1/a.png")).unwrap(), b"v2");

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("1")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
