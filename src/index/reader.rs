//! k-NN reader over a built index.
//!
//! Readers are created lazily by the search mode, one per index, and pull
//! every byte through the shared [`DiskCache`]. The scan is exact: every
//! stored vector is scored against the query and a bounded max-heap keeps
//! the best `k`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::index::builder::{index_location, ID_ENTRY_SIZE, IDX_HEADER_SIZE, IDX_MAGIC};
use crate::index::diskcache::DiskCache;
use crate::index::distance::Distance;

pub struct IndexReader {
    name: String,
    dimensions: usize,
    max_candidates_returned: usize,
    distance: Distance,
    dir: PathBuf,
    cache: Arc<DiskCache>,
    file: File,
    file_id: u64,
    count: usize,
}

struct Candidate {
    score: f32,
    ordinal: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.ordinal.cmp(&other.ordinal))
    }
}

impl IndexReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        dimensions: usize,
        _max_connections_per_vertex: usize,
        max_candidates_returned: usize,
        _compression_ratio: u32,
        dir: &Path,
        distance: Distance,
        cache: Arc<DiskCache>,
    ) -> Result<Self> {
        let index_path = index_location(name, dir);
        let file = File::open(&index_path)
            .with_context(|| format!("opening index file {}", index_path.display()))?;
        let file_id = cache.register_file();

        let header = cache.read_range(file_id, &file, 0, IDX_HEADER_SIZE)?;
        if header[0..8] != IDX_MAGIC {
            bail!("index file {} has invalid magic bytes", index_path.display());
        }
        let count = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let file_dimensions = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        if file_dimensions != dimensions {
            bail!(
                "index file {} has {file_dimensions} dimensions, expected {dimensions}",
                index_path.display()
            );
        }

        Ok(Self {
            name: name.to_string(),
            dimensions,
            max_candidates_returned,
            distance,
            dir: dir.to_path_buf(),
            cache,
            file,
            file_id,
            count,
        })
    }

    /// Ids of the `k` stored vectors closest to `query`, nearest first.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Vec<u8>>> {
        let k = k.min(self.max_candidates_returned);
        if k == 0 || self.count == 0 {
            return Ok(Vec::new());
        }

        let vector_bytes = self.dimensions * 4;
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);

        let mut components = vec![0f32; self.dimensions];
        for ordinal in 0..self.count {
            let offset = (IDX_HEADER_SIZE + ordinal * vector_bytes) as u64;
            let bytes = self
                .cache
                .read_range(self.file_id, &self.file, offset, vector_bytes)?;
            for (slot, chunk) in components.iter_mut().zip(bytes.chunks_exact(4)) {
                *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }

            let score = self.distance.distance(query, &components);
            if heap.len() < k {
                heap.push(Candidate { score, ordinal });
            } else if let Some(worst) = heap.peek() {
                if score < worst.score {
                    heap.pop();
                    heap.push(Candidate { score, ordinal });
                }
            }
        }

        let mut candidates = heap.into_sorted_vec();
        candidates.truncate(k);

        let mut ids = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            ids.push(self.read_id(candidate.ordinal)?);
        }
        Ok(ids)
    }

    fn read_id(&self, ordinal: usize) -> Result<Vec<u8>> {
        let table_start = IDX_HEADER_SIZE + self.count * self.dimensions * 4;
        let entry_offset = (table_start + ordinal * ID_ENTRY_SIZE) as u64;
        let entry = self
            .cache
            .read_range(self.file_id, &self.file, entry_offset, ID_ENTRY_SIZE)?;
        let id_offset = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let id_len = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as usize;

        Ok(self
            .cache
            .read_range(self.file_id, &self.file, id_offset, id_len)?)
    }

    /// Remove the index from disk; the reader is unusable afterwards.
    pub fn delete_index(&self) -> Result<()> {
        self.cache.evict_file(self.file_id);
        std::fs::remove_dir_all(&self.dir)
            .with_context(|| format!("removing index directory {}", self.dir.display()))?;
        tracing::info!("Index {} deleted from disk", self.name);
        Ok(())
    }

    pub fn close(&self) {
        self.cache.evict_file(self.file_id);
    }
}
