//! File attribute persistence for LAYOUTCOMMIT.
//!
//! The layout manager does not own file attributes. Commits are written
//! through a [`FileMetadataStore`], which the metadata service implements
//! against its own storage. [`MemoryMetadataStore`] is used by the binary
//! when no external store is wired in, and by tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};
use crate::types::{ByteRange, FileId};

/// Attribute changes carried by a LAYOUTCOMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitUpdate {
    /// Range the client wrote through its layout
    pub range: ByteRange,
    /// Offset of the last byte written, if the client reports one
    pub last_write_offset: Option<u64>,
    /// Client-supplied modification time
    pub time_modify: Option<SystemTime>,
    /// Change in space used on the storage devices, in bytes
    pub delta_space_used: Option<i64>,
}

impl CommitUpdate {
    /// An update that only names the committed range.
    pub fn for_range(range: ByteRange) -> Self {
        Self {
            range,
            last_write_offset: None,
            time_modify: None,
            delta_space_used: None,
        }
    }
}

/// File attributes after a commit was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedAttrs {
    /// File size in bytes
    pub size: u64,
    /// Space used on storage devices
    pub space_used: u64,
    /// Modification time
    pub mtime: Option<SystemTime>,
    /// Whether this commit changed the size
    pub size_changed: bool,
}

/// Persistent file attribute store.
pub trait FileMetadataStore: Send + Sync {
    /// Applies a commit and returns the resulting attributes.
    fn apply_commit(&self, file_id: FileId, update: &CommitUpdate) -> Result<CommittedAttrs>;

    /// Current attributes, if the file is known.
    fn attrs(&self, file_id: FileId) -> Result<Option<CommittedAttrs>>;
}

/// In-memory attribute store. Thread-safe via RwLock.
pub struct MemoryMetadataStore {
    files: Arc<RwLock<HashMap<FileId, CommittedAttrs>>>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMetadataStore for MemoryMetadataStore {
    fn apply_commit(&self, file_id: FileId, update: &CommitUpdate) -> Result<CommittedAttrs> {
        let mut files = self
            .files
            .write()
            .map_err(|e| LayoutError::internal(format!("metadata store: {}", e)))?;
        let attrs = files.entry(file_id).or_default();

        // A file grows to cover the last written byte; commits never shrink it.
        let mut size_changed = false;
        if let Some(last) = update.last_write_offset {
            let new_size = last.saturating_add(1);
            if new_size > attrs.size {
                attrs.size = new_size;
                size_changed = true;
            }
        }

        if let Some(delta) = update.delta_space_used {
            attrs.space_used = if delta >= 0 {
                attrs.space_used.saturating_add(delta as u64)
            } else {
                attrs.space_used.saturating_sub(delta.unsigned_abs())
            };
        }

        match update.time_modify {
            Some(t) => attrs.mtime = Some(t),
            None if size_changed => attrs.mtime = Some(SystemTime::now()),
            None => {}
        }

        attrs.size_changed = size_changed;
        Ok(attrs.clone())
    }

    fn attrs(&self, file_id: FileId) -> Result<Option<CommittedAttrs>> {
        let files = self
            .files
            .read()
            .map_err(|e| LayoutError::internal(format!("metadata store: {}", e)))?;
        Ok(files.get(&file_id).cloned())
    }
}
