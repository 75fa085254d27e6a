//! Directory-backed document store.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use uuid::Uuid;

use super::DocumentStore;
use crate::error::{Error, Result};
use crate::signatures::DocumentId;

/// Serves `<root>/<id>.pdf` and writes signed output beside it.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Store rooted at `root`, which must be an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "document store root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checked_name(id: &DocumentId) -> Result<&str> {
        let name = id.as_str();
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0'])
            && !name.starts_with('.');
        if valid {
            Ok(name)
        } else {
            Err(Error::NotFound(format!("invalid document id '{}'", name)))
        }
    }
}

impl DocumentStore for FsDocumentStore {
    fn resolve_path(&self, id: &DocumentId) -> Result<PathBuf> {
        let name = Self::checked_name(id)?;
        let path = self.root.join(format!("{}.pdf", name));
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::NotFound(format!("document {}", id)))
        }
    }

    fn read(&self, id: &DocumentId) -> Result<Vec<u8>> {
        let path = self.resolve_path(id)?;
        debug!("Reading {}", path.display());
        Ok(std::fs::read(path)?)
    }

    fn write_signed(&self, id: &DocumentId, record_id: Uuid, bytes: &[u8]) -> Result<PathBuf> {
        let name = Self::checked_name(id)?;
        let target = self.root.join(format!("{}.signed.{}.pdf", name, record_id));

        // Temp file in the same directory so the final rename is atomic
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&target).map_err(|e| Error::Io(e.error))?;

        info!("Wrote signed output {} ({} bytes)", target.display(), bytes.len());
        Ok(target)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if !path.starts_with(&self.root) {
            return Err(Error::Storage(format!(
                "refusing to remove {} outside the store root",
                path.display()
            )));
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
