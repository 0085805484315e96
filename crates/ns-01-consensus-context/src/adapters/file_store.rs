//! # File Context Store
//!
//! One JSON document per relationship under a data directory. Uses `fs2`
//! advisory locks so two processes never interleave a read-compare-write.
//!
//! File names are the SHA-256 of the relationship's display form, so nym and
//! notary identifiers never reach the filesystem as path components.

use crate::domain::{ContextError, SerializedContext};
use crate::ports::ContextStore;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use shared_types::RelationshipId;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// JSON-file-backed context store.
pub struct FileContextStore {
    root: PathBuf,
}

impl FileContextStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ContextError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!("[ns-01] Opened context store at {}", root.display());
        Ok(Self { root })
    }

    /// Directory holding the context files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, relationship: &RelationshipId) -> PathBuf {
        let digest = Sha256::digest(relationship.to_string().as_bytes());
        self.root.join(format!("{}.json", hex::encode(digest)))
    }

    fn read_locked(file: &mut File) -> io::Result<Option<SerializedContext>> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn try_load(&self, relationship: &RelationshipId) -> io::Result<Option<SerializedContext>> {
        let path = self.path_for(relationship);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        FileExt::lock_shared(&file)?;
        let result = Self::read_locked(&mut file);
        FileExt::unlock(&file)?;
        result
    }

    fn write_locked(file: &mut File, context: &SerializedContext) -> io::Result<bool> {
        if let Some(existing) = Self::read_locked(file)? {
            if existing.revision > context.revision {
                warn!(
                    "[ns-01] Refusing to overwrite {} revision {} with {}",
                    context.relationship, existing.revision, context.revision
                );
                return Ok(false);
            }
        }
        let bytes = serde_json::to_vec_pretty(context)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(true)
    }

    fn try_store(&self, context: &SerializedContext) -> io::Result<bool> {
        let path = self.path_for(&context.relationship);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        let outcome = Self::write_locked(&mut file, context);
        FileExt::unlock(&file)?;
        outcome
    }
}

impl ContextStore for FileContextStore {
    fn load_context(&self, relationship: &RelationshipId) -> Option<SerializedContext> {
        match self.try_load(relationship) {
            Ok(found) => found,
            Err(e) => {
                error!("[ns-01] Failed to load context {}: {}", relationship, e);
                None
            }
        }
    }

    fn store_context(&self, context: &SerializedContext) -> bool {
        match self.try_store(context) {
            Ok(written) => written,
            Err(e) => {
                error!(
                    "[ns-01] Failed to store context {}: {}",
                    context.relationship, e
                );
                false
            }
        }
    }
}
