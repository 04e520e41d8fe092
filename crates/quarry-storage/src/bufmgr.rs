//! Buffer manager: the pin/unpin page interface the index and relation
//! layers are written against.
//!
//! Composes the disk manager with the buffer pool. Pages are fetched
//! from the pool when resident, loaded from disk on a miss, and dirty
//! pages displaced by eviction are written back here.

use crate::disk::DiskManager;
use quarry_buffer::{BufferFrame, BufferPool, EvictedPage, PoolStats};
use quarry_common::page::PageId;
use quarry_common::{QuarryError, Result};
use std::sync::Arc;
use tracing::debug;

/// Page-granularity buffer manager.
///
/// Every `read_page`/`alloc_page` returns a pinned frame and must be
/// matched by exactly one `unpin_page` with the dirty flag reflecting
/// whether the caller mutated the page bytes. Violations surface as
/// `PageNotPinned`/`PagePinned` errors rather than silent corruption.
pub struct BufferManager {
    disk: Arc<DiskManager>,
    pool: BufferPool,
}

impl BufferManager {
    /// Creates a buffer manager over a disk manager with the given
    /// number of pool frames.
    pub fn new(disk: Arc<DiskManager>, pool_frames: usize) -> Self {
        Self {
            disk,
            pool: BufferPool::new(pool_frames),
        }
    }

    /// Returns the underlying disk manager.
    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    /// Returns buffer pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Writes an evicted dirty page back to disk.
    fn write_back(&self, evicted: Option<EvictedPage>) -> Result<()> {
        if let Some(evicted) = evicted {
            debug!(page = %evicted.page_id, "writing back evicted page");
            self.disk.write_page(evicted.page_id, &evicted.data)?;
        }
        Ok(())
    }

    /// Pins a page and returns its frame, reading it from disk if it is
    /// not resident in the pool.
    pub fn read_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        if let Some(frame) = self.pool.fetch_page(page_id) {
            return Ok(frame);
        }

        let data = self.disk.read_page(page_id)?;
        let (frame, evicted) = self.pool.load_page(page_id, &data)?;
        self.write_back(evicted)?;
        Ok(frame)
    }

    /// Allocates a new page in the given file and returns it pinned
    /// with zeroed bytes.
    pub fn alloc_page(&self, file_id: u32) -> Result<(PageId, &BufferFrame)> {
        let page_id = self.disk.allocate_page(file_id)?;
        let (frame, evicted) = self.pool.new_page(page_id)?;
        self.write_back(evicted)?;
        Ok((page_id, frame))
    }

    /// Releases one pin on a page.
    ///
    /// `dirty` must be true iff the caller mutated the page bytes while
    /// holding the pin.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> Result<()> {
        self.pool.unpin_page(page_id, dirty)
    }

    /// Writes all dirty pages of a file to disk and syncs it.
    ///
    /// Fails with `PagePinned` if any page of the file is still pinned;
    /// a pinned page at flush time means some caller lost track of a pin.
    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        let mut pinned: Option<PageId> = None;
        self.pool.for_each_page(|page_id, frame| {
            if page_id.file_id == file_id && frame.is_pinned() {
                pinned = Some(page_id);
                return false;
            }
            true
        });
        if let Some(page_id) = pinned {
            return Err(QuarryError::PagePinned {
                file_id: page_id.file_id,
                page_num: page_id.page_num,
            });
        }

        let mut result = Ok(());
        self.pool.for_each_page(|page_id, frame| {
            if page_id.file_id == file_id && frame.is_dirty() {
                let data = frame.read_data();
                if let Err(e) = self.disk.write_page(page_id, &data) {
                    result = Err(e);
                    return false;
                }
                drop(data);
                frame.set_dirty(false);
            }
            true
        });
        result?;

        self.disk.sync_file(file_id)
    }

    /// Drops every resident page of a file from the pool without
    /// writing it back.
    ///
    /// Used when a file is being closed (after a flush) or deleted.
    /// Fails with `PagePinned` if any of the file's pages is still in
    /// use.
    pub fn discard_file(&self, file_id: u32) -> Result<()> {
        let mut pages = Vec::new();
        self.pool.for_each_page(|page_id, _| {
            if page_id.file_id == file_id {
                pages.push(page_id);
            }
            true
        });
        for page_id in pages {
            if !self.pool.discard_page(page_id) {
                return Err(QuarryError::PagePinned {
                    file_id: page_id.file_id,
                    page_num: page_id.page_num,
                });
            }
        }
        Ok(())
    }

    /// Drops a page from the buffer pool, writing it out first if dirty.
    ///
    /// Used when the index frees a page: the page's bytes (its free-list
    /// link) must survive on disk, but the frame can be reclaimed. A
    /// page that is not resident is fine; a pinned page is an error.
    pub fn dispose_page(&self, page_id: PageId) -> Result<()> {
        if !self.pool.contains(page_id) {
            return Ok(());
        }

        self.pool
            .flush_page(page_id, |pid, data| {
                let mut buf = [0u8; quarry_common::PAGE_SIZE];
                buf.copy_from_slice(data);
                self.disk.write_page(pid, &buf)
            })?;

        if !self.pool.discard_page(page_id) {
            return Err(QuarryError::PagePinned {
                file_id: page_id.file_id,
                page_num: page_id.page_num,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::StorageConfig;
    use tempfile::tempdir;

    fn create_test_bufmgr(pool_frames: usize) -> (BufferManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let disk = Arc::new(DiskManager::new(&config).unwrap());
        (BufferManager::new(disk, pool_frames), dir)
    }

    #[test]
    fn test_alloc_read_roundtrip() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (page_id, frame) = bufmgr.alloc_page(file_id).unwrap();
        frame.write_data()[0] = 0x5A;
        bufmgr.unpin_page(page_id, true).unwrap();

        let frame = bufmgr.read_page(page_id).unwrap();
        assert_eq!(frame.read_data()[0], 0x5A);
        bufmgr.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_read_miss_loads_from_disk() {
        let (bufmgr, _dir) = create_test_bufmgr(2);
        let file_id = bufmgr.disk().create("data").unwrap();

        // Write a page and push it out of the small pool
        let (first, frame) = bufmgr.alloc_page(file_id).unwrap();
        frame.write_data()[10] = 0x77;
        bufmgr.unpin_page(first, true).unwrap();

        for _ in 0..4 {
            let (pid, _) = bufmgr.alloc_page(file_id).unwrap();
            bufmgr.unpin_page(pid, true).unwrap();
        }

        // The first page comes back from disk with its data intact
        let frame = bufmgr.read_page(first).unwrap();
        assert_eq!(frame.read_data()[10], 0x77);
        bufmgr.unpin_page(first, false).unwrap();
    }

    #[test]
    fn test_unpin_twice_fails() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (page_id, _) = bufmgr.alloc_page(file_id).unwrap();
        bufmgr.unpin_page(page_id, false).unwrap();

        let result = bufmgr.unpin_page(page_id, false);
        assert!(matches!(result, Err(QuarryError::PageNotPinned { .. })));
    }

    #[test]
    fn test_flush_file_with_pinned_page_fails() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (page_id, _) = bufmgr.alloc_page(file_id).unwrap();
        // Page left pinned

        let result = bufmgr.flush_file(file_id);
        assert!(matches!(result, Err(QuarryError::PagePinned { .. })));

        bufmgr.unpin_page(page_id, false).unwrap();
        bufmgr.flush_file(file_id).unwrap();
    }

    #[test]
    fn test_flush_file_persists_dirty_pages() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (page_id, frame) = bufmgr.alloc_page(file_id).unwrap();
        frame.write_data()[0] = 0x99;
        bufmgr.unpin_page(page_id, true).unwrap();

        bufmgr.flush_file(file_id).unwrap();

        let on_disk = bufmgr.disk().read_page(page_id).unwrap();
        assert_eq!(on_disk[0], 0x99);
        assert_eq!(bufmgr.pool_stats().dirty_frames, 0);
    }

    #[test]
    fn test_flush_only_touches_target_file() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let f0 = bufmgr.disk().create("a").unwrap();
        let f1 = bufmgr.disk().create("b").unwrap();

        let (p0, frame) = bufmgr.alloc_page(f0).unwrap();
        frame.write_data()[0] = 1;
        bufmgr.unpin_page(p0, true).unwrap();

        let (p1, frame) = bufmgr.alloc_page(f1).unwrap();
        frame.write_data()[0] = 2;
        bufmgr.unpin_page(p1, true).unwrap();

        bufmgr.flush_file(f0).unwrap();

        // The other file's page is still dirty in the pool
        assert_eq!(bufmgr.pool_stats().dirty_frames, 1);
    }

    #[test]
    fn test_dispose_page_persists_bytes() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (page_id, frame) = bufmgr.alloc_page(file_id).unwrap();
        frame.write_data()[0..4].copy_from_slice(&42u32.to_le_bytes());
        bufmgr.unpin_page(page_id, true).unwrap();

        bufmgr.dispose_page(page_id).unwrap();

        // The frame was reclaimed but the bytes reached disk
        let on_disk = bufmgr.disk().read_page(page_id).unwrap();
        assert_eq!(u32::from_le_bytes([on_disk[0], on_disk[1], on_disk[2], on_disk[3]]), 42);
    }

    #[test]
    fn test_dispose_pinned_page_fails() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (page_id, _) = bufmgr.alloc_page(file_id).unwrap();
        let result = bufmgr.dispose_page(page_id);
        assert!(matches!(result, Err(QuarryError::PagePinned { .. })));

        bufmgr.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_dispose_nonresident_page_ok() {
        let (bufmgr, _dir) = create_test_bufmgr(16);
        let file_id = bufmgr.disk().create("data").unwrap();
        bufmgr
            .dispose_page(PageId::new(file_id, 1234))
            .unwrap();
    }

    #[test]
    fn test_eviction_write_back_through_read() {
        let (bufmgr, _dir) = create_test_bufmgr(1);
        let file_id = bufmgr.disk().create("data").unwrap();

        let (p0, frame) = bufmgr.alloc_page(file_id).unwrap();
        frame.write_data()[0] = 0xAA;
        bufmgr.unpin_page(p0, true).unwrap();

        // Allocating a second page with one frame evicts the dirty first
        let (p1, _) = bufmgr.alloc_page(file_id).unwrap();
        bufmgr.unpin_page(p1, false).unwrap();

        let on_disk = bufmgr.disk().read_page(p0).unwrap();
        assert_eq!(on_disk[0], 0xAA);
    }
}
