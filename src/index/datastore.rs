//! Append-only raw-vector log.
//!
//! # File structure
//!
//! ```text
//! Offset   Size      Type        Description
//! ──────────────────────────────────────────────
//! 0x00     8         [u8; 8]     Magic: "VDBRAW01"
//! 0x08     4         u32 LE      N: number of records
//! 0x0C     4         u32 LE      D: dimensions
//! 0x10     ...       records     D*f32 LE, u32 LE id length, id bytes
//! ```
//!
//! The count is backpatched and the file fsynced on [`DataStore::close`];
//! an unclosed store reads back as empty.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const RAW_MAGIC: [u8; 8] = *b"VDBRAW01";
pub const RAW_HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Invalid magic bytes: expected VDBRAW01")]
    InvalidMagic,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Writer collecting `(vector, id)` pairs for one index during an upload.
pub struct DataStore {
    writer: BufWriter<File>,
    dimensions: usize,
    count: u32,
}

impl DataStore {
    /// Location of the raw-vector log inside an index directory.
    pub fn data_location(name: &str, dir: &Path) -> PathBuf {
        dir.join(format!("{name}.bin"))
    }

    pub fn create(name: &str, dimensions: usize, dir: &Path) -> Result<Self, DataStoreError> {
        let file = File::create(Self::data_location(name, dir))?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&RAW_MAGIC)?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&(dimensions as u32).to_le_bytes())?;

        Ok(Self {
            writer,
            dimensions,
            count: 0,
        })
    }

    /// Append one vector and its opaque id.
    pub fn add(&mut self, vector: &[f32], id: &[u8]) -> Result<(), DataStoreError> {
        if vector.len() != self.dimensions {
            return Err(DataStoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        for &component in vector {
            self.writer.write_all(&component.to_le_bytes())?;
        }
        self.writer.write_all(&(id.len() as u32).to_le_bytes())?;
        self.writer.write_all(id)?;

        self.count += 1;
        Ok(())
    }

    /// Finalize the log: backpatch the record count and fsync.
    pub fn close(mut self) -> Result<u32, DataStoreError> {
        self.writer.flush()?;

        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;

        Ok(self.count)
    }
}

/// Sequential reader over a finalized datastore.
pub struct DataStoreReader {
    reader: BufReader<File>,
    dimensions: usize,
    count: u32,
    read: u32,
}

impl DataStoreReader {
    pub fn open(path: &Path) -> Result<Self, DataStoreError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; RAW_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        if header[0..8] != RAW_MAGIC {
            return Err(DataStoreError::InvalidMagic);
        }
        let count = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let dimensions = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;

        Ok(Self {
            reader,
            dimensions,
            count,
            read: 0,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn read_record(&mut self) -> Result<(Vec<f32>, Vec<u8>), DataStoreError> {
        let mut vector_bytes = vec![0u8; self.dimensions * 4];
        self.reader.read_exact(&mut vector_bytes)?;
        let vector = vector_bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let id_len = u32::from_le_bytes(len_bytes) as usize;
        let mut id = vec![0u8; id_len];
        self.reader.read_exact(&mut id)?;

        Ok((vector, id))
    }
}

impl Iterator for DataStoreReader {
    type Item = Result<(Vec<f32>, Vec<u8>), DataStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read >= self.count {
            return None;
        }
        self.read += 1;
        Some(self.read_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = DataStore::create("a", 3, dir.path()).unwrap();
        store.add(&[1.0, 2.0, 3.0], &[0x01]).unwrap();
        store.add(&[4.0, 5.0, 6.0], &[0xAB, 0xCD]).unwrap();
        assert_eq!(store.close().unwrap(), 2);

        let reader = DataStoreReader::open(&DataStore::data_location("a", dir.path())).unwrap();
        assert_eq!(DataStoreReader::count(&reader), 2);
        assert_eq!(reader.dimensions(), 3);

        let records: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(records[0], (vec![1.0, 2.0, 3.0], vec![0x01]));
        assert_eq!(records[1], (vec![4.0, 5.0, 6.0], vec![0xAB, 0xCD]));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let mut store = DataStore::create("a", 3, dir.path()).unwrap();
        let result = store.add(&[1.0, 2.0], &[0x01]);
        assert!(matches!(
            result,
            Err(DataStoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_unclosed_store_reads_back_empty() {
        let dir = tempdir().unwrap();
        let mut store = DataStore::create("a", 2, dir.path()).unwrap();
        store.add(&[1.0, 2.0], &[0x01]).unwrap();
        // Flush the buffered bytes without backpatching the count.
        store.writer.flush().unwrap();
        drop(store);

        let reader = DataStoreReader::open(&DataStore::data_location("a", dir.path())).unwrap();
        assert_eq!(reader.count(), 0);
    }
}
