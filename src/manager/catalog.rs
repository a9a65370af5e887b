//! Index catalog: in-memory state machine with a durable mirror on disk.
//!
//! All state transitions go through compare-and-set over the in-memory
//! map; losers observe the winning transition. The status file under each
//! index directory is the single source of truth across restarts and is
//! replaced atomically (same-directory temp file + rename).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;

use crate::index::distance::Distance;

pub const STATUS_FILE_NAME: &str = "status";
pub const METADATA_FILE_NAME: &str = "metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Creating,
    Created,
    Uploading,
    Uploaded,
    InBuildQueue,
    Building,
    Built,
    Broken,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Creating => "CREATING",
            IndexState::Created => "CREATED",
            IndexState::Uploading => "UPLOADING",
            IndexState::Uploaded => "UPLOADED",
            IndexState::InBuildQueue => "IN_BUILD_QUEUE",
            IndexState::Building => "BUILDING",
            IndexState::Built => "BUILT",
            IndexState::Broken => "BROKEN",
        }
    }

    /// States that cannot be resumed after an unclean restart.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            IndexState::Creating
                | IndexState::Uploading
                | IndexState::Building
                | IndexState::InBuildQueue
                | IndexState::Broken
        )
    }
}

impl FromStr for IndexState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CREATING" => Ok(IndexState::Creating),
            "CREATED" => Ok(IndexState::Created),
            "UPLOADING" => Ok(IndexState::Uploading),
            "UPLOADED" => Ok(IndexState::Uploaded),
            "IN_BUILD_QUEUE" => Ok(IndexState::InBuildQueue),
            "BUILDING" => Ok(IndexState::Building),
            "BUILT" => Ok(IndexState::Built),
            "BROKEN" => Ok(IndexState::Broken),
            other => bail!("unknown index state `{other}`"),
        }
    }
}

/// Immutable per-index record created alongside the directory.
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pub distance: Distance,
    pub dir: PathBuf,
}

#[derive(Default)]
pub struct IndexCatalog {
    states: RwLock<HashMap<String, IndexState>>,
    metadata: RwLock<HashMap<String, Arc<IndexMetadata>>>,
}

impl IndexCatalog {
    pub fn state(&self, name: &str) -> Option<IndexState> {
        self.states.read().get(name).copied()
    }

    /// Register a brand-new index in CREATING state. Returns false when the
    /// name is already taken.
    pub fn insert_new(&self, name: &str) -> bool {
        let mut states = self.states.write();
        if states.contains_key(name) {
            return false;
        }
        states.insert(name.to_string(), IndexState::Creating);
        true
    }

    /// Atomically flip `from` to `to`. Returns false when the current state
    /// is not `from` (or the name is unknown).
    pub fn compare_and_set(&self, name: &str, from: IndexState, to: IndexState) -> bool {
        let mut states = self.states.write();
        match states.get_mut(name) {
            Some(state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    /// Atomically apply `transition` to the current state; states it maps
    /// to `None` are left alone. Returns the pair of states before and
    /// after the call, or `None` when the name is unknown.
    pub fn transition(
        &self,
        name: &str,
        transition: impl Fn(IndexState) -> Option<IndexState>,
    ) -> Option<(IndexState, IndexState)> {
        let mut states = self.states.write();
        let state = states.get_mut(name)?;
        let previous = *state;
        if let Some(next) = transition(previous) {
            *state = next;
        }
        Some((previous, *state))
    }

    pub fn set_state(&self, name: &str, state: IndexState) {
        self.states.write().insert(name.to_string(), state);
    }

    pub fn remove(&self, name: &str) {
        self.states.write().remove(name);
        self.metadata.write().remove(name);
    }

    pub fn metadata(&self, name: &str) -> Option<Arc<IndexMetadata>> {
        self.metadata.read().get(name).cloned()
    }

    pub fn put_metadata(&self, name: &str, metadata: IndexMetadata) {
        self.metadata
            .write()
            .insert(name.to_string(), Arc::new(metadata));
    }

    pub fn remove_metadata(&self, name: &str) {
        self.metadata.write().remove(name);
    }

    /// Every catalogued name whose state is not BROKEN.
    pub fn list_non_broken(&self) -> Vec<String> {
        self.states
            .read()
            .iter()
            .filter(|(_, state)| **state != IndexState::Broken)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Admit an index found on disk during startup reconciliation.
    pub fn admit(&self, name: &str, state: IndexState, metadata: IndexMetadata) {
        self.put_metadata(name, metadata);
        self.set_state(name, state);
    }
}

/// Durably replace the status file of an index directory.
///
/// The state is written to a temp file in the same directory, fsynced and
/// renamed over the status file. When the rename fails (some filesystems
/// refuse cross-replacing moves), a plain copy replaces the file instead.
pub fn write_status_file(dir: &Path, state: IndexState) -> Result<()> {
    let status_path = dir.join(STATUS_FILE_NAME);
    if state == IndexState::Creating && status_path.exists() {
        bail!("index already exists on disk in path {}", dir.display());
    }

    let mut tmp = tempfile::Builder::new()
        .prefix("status")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("creating status temp file in {}", dir.display()))?;
    tmp.write_all(state.as_str().as_bytes())?;
    tmp.as_file().sync_all()?;

    match tmp.persist(&status_path) {
        Ok(_) => Ok(()),
        Err(persist_error) => {
            tracing::warn!(
                "Atomic rename of status file in {} failed ({}), falling back to replacing copy",
                dir.display(),
                persist_error.error
            );
            std::fs::copy(persist_error.file.path(), &status_path)
                .with_context(|| format!("replacing status file in {}", dir.display()))?;
            Ok(())
        }
    }
}

pub fn read_status_file(dir: &Path) -> Result<IndexState> {
    let status_path = dir.join(STATUS_FILE_NAME);
    let content = std::fs::read_to_string(&status_path)
        .with_context(|| format!("reading {}", status_path.display()))?;
    content.parse()
}

/// Write the immutable metadata file: distance name, create-new, fsynced.
pub fn write_metadata_file(dir: &Path, distance: Distance) -> Result<()> {
    let metadata_path = dir.join(METADATA_FILE_NAME);
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&metadata_path)
        .with_context(|| format!("creating {}", metadata_path.display()))?;
    file.write_all(distance.to_string().as_bytes())?;
    file.sync_all()?;
    Ok(())
}

pub fn read_metadata_file(dir: &Path) -> Result<Distance> {
    let metadata_path = dir.join(METADATA_FILE_NAME);
    let content = std::fs::read_to_string(&metadata_path)
        .with_context(|| format!("reading {}", metadata_path.display()))?;
    content.parse()
}

/// Scan the indexes directory and repopulate the catalog from disk.
///
/// Only indexes whose persisted state is safe to resume are admitted;
/// everything else is left on disk untouched and skipped with an error in
/// the log.
pub fn load_indexes_from_disk(indexes_dir: &Path, catalog: &IndexCatalog) -> Result<()> {
    tracing::info!("Scanning existing indexes on disk {}", indexes_dir.display());

    for entry in std::fs::read_dir(indexes_dir)
        .with_context(|| format!("listing {}", indexes_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        load_index(&path, catalog);
    }

    tracing::info!(
        "Scanning of existing indexes on disk {} completed",
        indexes_dir.display()
    );
    Ok(())
}

fn load_index(path: &Path, catalog: &IndexCatalog) {
    let index_name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => return,
    };
    tracing::info!("Loading index `{}`", index_name);

    if catalog.state(&index_name).is_some() {
        tracing::warn!("Index {} already exists", index_name);
    }

    let status_path = path.join(STATUS_FILE_NAME);
    if !status_path.exists() {
        tracing::error!(
            "Status file {} does not exist for index {}",
            status_path.display(),
            index_name
        );
        return;
    }

    let state = match read_status_file(path) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to parse index state for index {}: {}", index_name, e);
            return;
        }
    };

    if !state.is_recoverable() {
        tracing::error!(
            "Index {} is in invalid state {}. Will not load it",
            index_name,
            state.as_str()
        );
        return;
    }

    let metadata_path = path.join(METADATA_FILE_NAME);
    if !metadata_path.exists() {
        tracing::error!(
            "Metadata file {} does not exist for index {}",
            metadata_path.display(),
            index_name
        );
        return;
    }

    let distance = match read_metadata_file(path) {
        Ok(distance) => distance,
        Err(e) => {
            tracing::error!("Failed to parse metadata for index {}: {}", index_name, e);
            return;
        }
    };

    catalog.admit(
        &index_name,
        state,
        IndexMetadata {
            distance,
            dir: path.to_path_buf(),
        },
    );
    tracing::info!("Index {} loaded", index_name);
}
