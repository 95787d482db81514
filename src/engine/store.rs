// Durable store — one file per cache key holding the raw fetched bytes.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tempfile::NamedTempFile;

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Read the entry for `key`. Returns `None` if there is none.
    pub fn read(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow!("failed to read cache entry {}: {}", key, e)),
        }
    }

    /// Replace the entry for `key`. The file is written to a temporary name
    /// in the same directory and renamed into place, so readers see either
    /// the old or the new content.
    pub fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)
            .with_context(|| format!("failed to stage cache entry {}", key))?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(key))
            .map_err(|e| anyhow!("failed to persist cache entry {}: {}", key, e.error))?;
        Ok(())
    }
}
