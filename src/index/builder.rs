//! Blocking index build.
//!
//! Transforms a finalized datastore into a packed, queryable `.idx` file:
//!
//! ```text
//! Offset   Size        Type        Description
//! ─────────────────────────────────────────────────
//! 0x00     8           [u8; 8]     Magic: "VDBIDX01"
//! 0x08     4           u32 LE      N: number of vectors
//! 0x0C     4           u32 LE      D: dimensions
//! 0x10     N*D*4       [f32]       Vector data (Little Endian)
//! ...      N*12        entries     id table: u64 LE offset, u32 LE length
//! ...      ...         [u8]        id blob
//! ```
//!
//! The build runs on the dedicated build worker and blocks for its whole
//! duration; progress is reported through the registered tracker.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::index::datastore::DataStoreReader;
use crate::index::distance::Distance;
use crate::manager::progress::ProgressTracker;

pub const IDX_MAGIC: [u8; 8] = *b"VDBIDX01";
pub const IDX_HEADER_SIZE: usize = 16;
pub const ID_ENTRY_SIZE: usize = 12;

pub const PHASE_READ: &str = "reading vectors";
pub const PHASE_WRITE: &str = "writing index";

pub fn index_location(name: &str, dir: &Path) -> std::path::PathBuf {
    dir.join(format!("{name}.idx"))
}

/// Build the on-disk index for `name` from the raw vectors at `data_path`.
///
/// The sizing parameters mirror the node configuration and are recorded in
/// the progress stream so operators can see what a build was run with.
#[allow(clippy::too_many_arguments)]
pub fn build_index(
    name: &str,
    dimensions: usize,
    compression_ratio: u32,
    distance_multiplier: f32,
    index_dir: &Path,
    data_path: &Path,
    max_memory: u64,
    max_connections_per_vertex: usize,
    max_candidates_returned: usize,
    distance: Distance,
    tracker: &ProgressTracker,
) -> Result<()> {
    tracker.begin(name, &[PHASE_READ, PHASE_WRITE]);
    let result = run_build(
        name,
        dimensions,
        compression_ratio,
        distance_multiplier,
        index_dir,
        data_path,
        max_memory,
        max_connections_per_vertex,
        max_candidates_returned,
        distance,
        tracker,
    );
    tracker.finish();
    result
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    name: &str,
    dimensions: usize,
    compression_ratio: u32,
    distance_multiplier: f32,
    index_dir: &Path,
    data_path: &Path,
    max_memory: u64,
    max_connections_per_vertex: usize,
    max_candidates_returned: usize,
    distance: Distance,
    tracker: &ProgressTracker,
) -> Result<()> {
    let reader = DataStoreReader::open(data_path)
        .with_context(|| format!("opening datastore {}", data_path.display()))?;
    if reader.dimensions() != dimensions {
        bail!(
            "datastore for index {name} has {} dimensions, expected {dimensions}",
            reader.dimensions()
        );
    }

    let count = DataStoreReader::count(&reader) as usize;
    let parameters = vec![
        format!("distance={distance}"),
        format!("maxMemory={max_memory}"),
        format!("maxConnectionsPerVertex={max_connections_per_vertex}"),
        format!("maxCandidatesReturned={max_candidates_returned}"),
        format!("compressionRatio={compression_ratio}"),
        format!("distanceMultiplier={distance_multiplier}"),
    ];

    let index_path = index_location(name, index_dir);
    let file = File::create(&index_path)
        .with_context(|| format!("creating index file {}", index_path.display()))?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&IDX_MAGIC)?;
    writer.write_all(&(count as u32).to_le_bytes())?;
    writer.write_all(&(dimensions as u32).to_le_bytes())?;

    // Vectors stream straight through; ids are buffered for the tail table.
    let progress_interval = (count / 100).max(1);
    let mut ids: Vec<Vec<u8>> = Vec::with_capacity(count);
    for (i, record) in reader.enumerate() {
        let (vector, id) = record.with_context(|| format!("reading record {i} of index {name}"))?;
        for component in vector {
            writer.write_all(&component.to_le_bytes())?;
        }
        ids.push(id);

        if i % progress_interval == 0 {
            let pct = if count == 0 {
                100.0
            } else {
                i as f64 / count as f64 * 100.0
            };
            tracker.update(PHASE_READ, pct, &parameters);
        }
    }
    if ids.len() != count {
        bail!(
            "datastore for index {name} is truncated: header says {count} records, found {}",
            ids.len()
        );
    }
    tracker.update(PHASE_READ, 100.0, &parameters);

    tracker.update(PHASE_WRITE, 0.0, &parameters);
    let id_blob_start =
        (IDX_HEADER_SIZE + count * dimensions * 4 + count * ID_ENTRY_SIZE) as u64;
    let mut id_offset = id_blob_start;
    for id in &ids {
        writer.write_all(&id_offset.to_le_bytes())?;
        writer.write_all(&(id.len() as u32).to_le_bytes())?;
        id_offset += id.len() as u64;
    }
    for id in &ids {
        writer.write_all(id)?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    tracker.update(PHASE_WRITE, 100.0, &parameters);

    tracing::info!(
        "Index {} built: {} vectors of dimension {}",
        name,
        count,
        dimensions
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::datastore::DataStore;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_build_produces_readable_index() {
        let dir = tempdir().unwrap();
        let mut store = DataStore::create("a", 2, dir.path()).unwrap();
        store.add(&[1.0, 2.0], &[0x01]).unwrap();
        store.add(&[3.0, 4.0], &[0x02, 0x03]).unwrap();
        store.close().unwrap();

        let tracker = ProgressTracker::new(Duration::from_secs(5));
        build_index(
            "a",
            2,
            32,
            1.0,
            dir.path(),
            &DataStore::data_location("a", dir.path()),
            64 * 1024 * 1024,
            16,
            128,
            Distance::L2,
            &tracker,
        )
        .unwrap();

        let bytes = std::fs::read(index_location("a", dir.path())).unwrap();
        assert_eq!(&bytes[0..8], &IDX_MAGIC);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 2);

        // First id table entry points just past the table at a 1-byte id.
        let table_start = IDX_HEADER_SIZE + 2 * 2 * 4;
        let first_offset =
            u64::from_le_bytes(bytes[table_start..table_start + 8].try_into().unwrap());
        let first_len = u32::from_le_bytes(
            bytes[table_start + 8..table_start + 12].try_into().unwrap(),
        );
        assert_eq!(first_len, 1);
        assert_eq!(bytes[first_offset as usize], 0x01);
    }

    #[tokio::test]
    async fn test_build_rejects_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let mut store = DataStore::create("a", 2, dir.path()).unwrap();
        store.add(&[1.0, 2.0], &[0x01]).unwrap();
        store.close().unwrap();

        let tracker = ProgressTracker::new(Duration::from_secs(5));
        let result = build_index(
            "a",
            3,
            32,
            1.0,
            dir.path(),
            &DataStore::data_location("a", dir.path()),
            64 * 1024 * 1024,
            16,
            128,
            Distance::L2,
            &tracker,
        );
        assert!(result.is_err());
    }
}
