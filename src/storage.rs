//! Object storage collaborator.
//!
//! The pipeline only needs byte-level get/put/list plus an atomic-enough
//! "move to completed" rename, so the store is a small trait. The shipped
//! implementation is a local filesystem tree; the S3-shaped original sits
//! behind the same seam.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::StorageConfig;

/// Byte-level object store keyed by string paths (`prefix/name`).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List object keys under a prefix, relative to that prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Download an object's bytes.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Upload bytes to a key, overwriting.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Move an object from one key to another. Used only after a confirmed
    /// index write, never before.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Size in bytes if the object exists.
    async fn size(&self, key: &str) -> Result<Option<u64>>;
}

/// Filesystem-backed object store rooted at a directory.
pub struct FsObjectStore {
    root: PathBuf,
    include: GlobSet,
}

impl FsObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.include_globs {
            builder.add(Glob::new(pattern).with_context(|| format!("bad glob: {}", pattern))?);
        }
        Ok(Self {
            root: config.root.clone(),
            include: builder.build()?,
        })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == "..") {
            bail!("object key must not contain '..': {}", key);
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&base) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or_else(|_| entry.path());
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if self.include.is_match(&rel_str) {
                keys.push(rel_str);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read object: {}", path.display()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write object: {}", path.display()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .with_context(|| format!("failed to move {} -> {}", src.display(), dst.display()))
    }

    async fn size(&self, key: &str) -> Result<Option<u64>> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Join a prefix and a relative key (`incoming/` + `a/b.txt`).
pub fn object_key(prefix: &str, file_key: &str) -> String {
    format!("{}{}", prefix, file_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::path::Path;

    fn store(root: &Path) -> FsObjectStore {
        FsObjectStore::new(&StorageConfig {
            root: root.to_path_buf(),
            incoming_prefix: "incoming/".to_string(),
            completed_prefix: "completed/".to_string(),
            include_globs: vec!["**/*.txt".to_string()],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.put("incoming/a.txt", b"hello").await.unwrap();
        assert_eq!(s.get("incoming/a.txt").await.unwrap(), b"hello");
        assert_eq!(s.size("incoming/a.txt").await.unwrap(), Some(5));
        assert_eq!(s.size("incoming/missing.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.put("incoming/b.txt", b"b").await.unwrap();
        s.put("incoming/a.txt", b"a").await.unwrap();
        s.put("incoming/skip.pdf", b"x").await.unwrap();
        let keys = s.list("incoming/").await.unwrap();
        assert_eq!(keys, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn list_missing_prefix_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(s.list("incoming/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_moves_to_completed() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.put("incoming/a.txt", b"data").await.unwrap();
        s.rename("incoming/a.txt", "completed/a.txt").await.unwrap();
        assert_eq!(s.size("incoming/a.txt").await.unwrap(), None);
        assert_eq!(s.get("completed/a.txt").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn parent_traversal_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(s.get("../outside.txt").await.is_err());
    }
}
