//! Byte-budgeted page cache for index files.
//!
//! One cache is created per search-mode instance, sized from the
//! disk-cache memory pool, and shared by every open [`super::IndexReader`].
//! Pages are fixed 64 KiB slices; eviction is LRU.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub const PAGE_SIZE: usize = 64 * 1024;

type PageKey = (u64, u64);

pub struct DiskCache {
    capacity_pages: usize,
    next_file_id: AtomicU64,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    pages: HashMap<PageKey, Arc<Vec<u8>>>,
    lru: VecDeque<PageKey>,
}

impl DiskCache {
    /// `dimensions` and `max_connections` are the sizing hints the index
    /// format carries; the byte budget alone decides capacity here.
    pub fn new(bytes: u64, _dimensions: usize, _max_connections: usize) -> Self {
        let capacity_pages = ((bytes as usize) / PAGE_SIZE).max(8);
        Self {
            capacity_pages,
            next_file_id: AtomicU64::new(0),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Hand out an id under which a reader's pages are tracked.
    pub fn register_file(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read `len` bytes at `offset`, served from cached pages.
    pub fn read_range(
        &self,
        file_id: u64,
        file: &File,
        offset: u64,
        len: usize,
    ) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut position = offset;
        let end = offset + len as u64;

        while position < end {
            let page_no = position / PAGE_SIZE as u64;
            let page = self.page(file_id, file, page_no)?;
            let start = (position - page_no * PAGE_SIZE as u64) as usize;
            if start >= page.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read past end of file at offset {position}"),
                ));
            }
            let take = ((end - position) as usize).min(page.len() - start);
            out.extend_from_slice(&page[start..start + take]);
            position += take as u64;
        }

        Ok(out)
    }

    fn page(&self, file_id: u64, file: &File, page_no: u64) -> io::Result<Arc<Vec<u8>>> {
        let key = (file_id, page_no);

        {
            let mut inner = self.inner.lock();
            if let Some(page) = inner.pages.get(&key).cloned() {
                if let Some(pos) = inner.lru.iter().position(|k| *k == key) {
                    inner.lru.remove(pos);
                }
                inner.lru.push_back(key);
                return Ok(page);
            }
        }

        let page = Arc::new(read_page(file, page_no)?);

        let mut inner = self.inner.lock();
        inner.pages.insert(key, page.clone());
        inner.lru.push_back(key);
        while inner.pages.len() > self.capacity_pages {
            if let Some(victim) = inner.lru.pop_front() {
                inner.pages.remove(&victim);
            } else {
                break;
            }
        }

        Ok(page)
    }

    /// Drop every cached page of one file; called when a reader closes.
    pub fn evict_file(&self, file_id: u64) {
        let mut inner = self.inner.lock();
        inner.pages.retain(|(fid, _), _| *fid != file_id);
        inner.lru.retain(|(fid, _)| *fid != file_id);
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.lru.clear();
    }

    #[cfg(test)]
    fn cached_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }
}

fn read_page(file: &File, page_no: u64) -> io::Result<Vec<u8>> {
    let offset = page_no * PAGE_SIZE as u64;
    let mut buf = vec![0u8; PAGE_SIZE];
    let mut filled = 0usize;

    while filled < PAGE_SIZE {
        let n = read_at(file, &mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(path: &std::path::Path, len: usize) -> File {
        let mut f = File::create(path).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f.sync_all().unwrap();
        File::open(path).unwrap()
    }

    #[test]
    fn test_read_range_across_page_boundary() {
        let dir = tempdir().unwrap();
        let file = write_file(&dir.path().join("data"), PAGE_SIZE * 2 + 100);

        let cache = DiskCache::new((PAGE_SIZE * 16) as u64, 3, 16);
        let file_id = cache.register_file();

        let offset = PAGE_SIZE as u64 - 10;
        let bytes = cache.read_range(file_id, &file, offset, 20).unwrap();
        let expected: Vec<u8> = (0..20).map(|i| ((offset as usize + i) % 251) as u8).collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_read_past_eof_errors() {
        let dir = tempdir().unwrap();
        let file = write_file(&dir.path().join("data"), 100);

        let cache = DiskCache::new((PAGE_SIZE * 16) as u64, 3, 16);
        let file_id = cache.register_file();

        assert!(cache.read_range(file_id, &file, 90, 20).is_err());
    }

    #[test]
    fn test_lru_eviction_bounds_cache() {
        let dir = tempdir().unwrap();
        let file = write_file(&dir.path().join("data"), PAGE_SIZE * 64);

        // Minimum capacity is 8 pages.
        let cache = DiskCache::new(0, 3, 16);
        let file_id = cache.register_file();

        for page in 0..32u64 {
            cache
                .read_range(file_id, &file, page * PAGE_SIZE as u64, 16)
                .unwrap();
        }
        assert!(cache.cached_pages() <= 8);
    }

    #[test]
    fn test_evict_file_removes_only_that_file() {
        let dir = tempdir().unwrap();
        let file_a = write_file(&dir.path().join("a"), PAGE_SIZE);
        let file_b = write_file(&dir.path().join("b"), PAGE_SIZE);

        let cache = DiskCache::new((PAGE_SIZE * 16) as u64, 3, 16);
        let id_a = cache.register_file();
        let id_b = cache.register_file();

        cache.read_range(id_a, &file_a, 0, 16).unwrap();
        cache.read_range(id_b, &file_b, 0, 16).unwrap();
        assert_eq!(cache.cached_pages(), 2);

        cache.evict_file(id_a);
        assert_eq!(cache.cached_pages(), 1);
    }
}
