//! Search mode: reader cache and query dispatch.
//!
//! One [`DiskCache`] is created per search-mode instance and shared by
//! every reader; both are torn down together when the node leaves search
//! mode.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;

use crate::error::{OpResult, Status};
use crate::index::diskcache::DiskCache;
use crate::index::reader::IndexReader;
use crate::manager::catalog::IndexState;
use crate::manager::ManagerCore;

pub struct SearchMode {
    core: Arc<ManagerCore>,
    disk_cache: Arc<DiskCache>,
    readers: RwLock<HashMap<String, Arc<IndexReader>>>,
}

impl SearchMode {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        let disk_cache = Arc::new(DiskCache::new(
            core.budgets.disk_cache,
            core.config.dimensions,
            core.config.max_connections_per_vertex,
        ));
        Self {
            core,
            disk_cache,
            readers: RwLock::new(HashMap::new()),
        }
    }

    pub fn find_nearest(&self, index_name: &str, k: usize, query: &[f32]) -> OpResult<Vec<Vec<u8>>> {
        self.check_built(index_name)?;
        let reader = self.fetch_reader(index_name)?;

        let dimensions = self.core.config.dimensions;
        if query.len() < dimensions {
            return Err(Status::Internal(anyhow!(
                "query vector has {} components, expected {dimensions}",
                query.len()
            )));
        }
        let mut buffer = vec![0f32; dimensions];
        buffer.copy_from_slice(&query[..dimensions]);

        reader.nearest(&buffer, k).map_err(|e| {
            tracing::error!("Failed to find nearest neighbours: {}", e);
            Status::Internal(e)
        })
    }

    pub fn drop_index(&self, index_name: &str) -> OpResult<()> {
        self.check_built(index_name)?;
        let reader = self.fetch_reader(index_name)?;

        if let Err(e) = reader.delete_index() {
            tracing::error!("Failed dropping an index '{}': {}", index_name, e);
            return Err(Status::Internal(e));
        }

        self.readers.write().remove(index_name);
        self.core.catalog.remove(index_name);
        Ok(())
    }

    fn check_built(&self, index_name: &str) -> OpResult<()> {
        if self.core.catalog.state(index_name) != Some(IndexState::Built) {
            let msg = format!("Index {index_name} is not in BUILT state");
            tracing::error!("{msg}");
            return Err(Status::failed_precondition(msg));
        }
        Ok(())
    }

    /// Readers open lazily on first use and stay cached for the lifetime
    /// of the mode.
    fn fetch_reader(&self, index_name: &str) -> OpResult<Arc<IndexReader>> {
        if let Some(reader) = self.readers.read().get(index_name) {
            return Ok(reader.clone());
        }

        let mut readers = self.readers.write();
        if let Some(reader) = readers.get(index_name) {
            return Ok(reader.clone());
        }

        let metadata = self
            .core
            .catalog
            .metadata(index_name)
            .ok_or_else(|| Status::Internal(anyhow!("no metadata for index {index_name}")))?;
        let reader = IndexReader::new(
            index_name,
            self.core.config.dimensions,
            self.core.config.max_connections_per_vertex,
            self.core.config.max_candidates_returned,
            self.core.config.compression_ratio,
            &metadata.dir,
            metadata.distance,
            self.disk_cache.clone(),
        )
        .map_err(Status::Internal)?;

        let reader = Arc::new(reader);
        readers.insert(index_name.to_string(), reader.clone());
        Ok(reader)
    }

    pub(crate) fn shutdown(&self) {
        let mut readers = self.readers.write();
        for reader in readers.values() {
            reader.close();
        }
        readers.clear();
        self.disk_cache.close();
    }
}
