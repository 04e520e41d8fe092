//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use quarry_common::page::{PageId, PAGE_SIZE};
use quarry_common::{QuarryError, Result, StorageConfig};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Manages reading and writing pages to named data files.
///
/// Files are registered by name (relation files, index files) and
/// addressed afterwards by the `file_id` handed out at registration.
/// Index files carry names of the form `<relation>.<offset>`, so the
/// name is the identity that survives process restarts, not the id.
pub struct DiskManager {
    /// Base directory for data files.
    data_dir: PathBuf,
    /// Whether to fsync after writes.
    fsync_enabled: bool,
    /// Open file handles and the name registry.
    inner: Mutex<DiskManagerInner>,
}

struct DiskManagerInner {
    /// Open file handles keyed by file_id.
    files: HashMap<u32, FileHandle>,
    /// Name to file_id registry for open files.
    by_name: HashMap<String, u32>,
    /// Next file_id to assign.
    next_file_id: u32,
}

/// Handle for an open data file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Registered name of the file.
    name: String,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager over the configured data directory.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
            inner: Mutex::new(DiskManagerInner {
                files: HashMap::new(),
                by_name: HashMap::new(),
                next_file_id: 0,
            }),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Generates the on-disk path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Returns true if a file with the given name exists on disk.
    pub fn exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    /// Opens an existing file and returns its file_id.
    ///
    /// If the file is already open, the existing id is returned.
    pub fn open(&self, name: &str) -> Result<u32> {
        let mut inner = self.inner.lock();

        if let Some(&file_id) = inner.by_name.get(name) {
            return Ok(file_id);
        }

        let path = self.file_path(name);
        if !path.exists() {
            return Err(QuarryError::FileNotFound(name.to_string()));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self::register(&mut inner, file, name, num_pages))
    }

    /// Creates a new empty file and returns its file_id.
    pub fn create(&self, name: &str) -> Result<u32> {
        let mut inner = self.inner.lock();

        let path = self.file_path(name);
        if inner.by_name.contains_key(name) || path.exists() {
            return Err(QuarryError::FileAlreadyExists(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        Ok(Self::register(&mut inner, file, name, 0))
    }

    fn register(inner: &mut DiskManagerInner, file: File, name: &str, num_pages: u32) -> u32 {
        let file_id = inner.next_file_id;
        inner.next_file_id += 1;
        inner.files.insert(
            file_id,
            FileHandle {
                file,
                name: name.to_string(),
                num_pages,
            },
        );
        inner.by_name.insert(name.to_string(), file_id);
        file_id
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&page_id.file_id)
            .ok_or(QuarryError::PageNotFound {
                file_id: page_id.file_id,
                page_num: page_id.page_num,
            })?;

        if page_id.page_num >= handle.num_pages {
            return Err(QuarryError::PageNotFound {
                file_id: page_id.file_id,
                page_num: page_id.page_num,
            });
        }

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&page_id.file_id)
            .ok_or(QuarryError::PageNotFound {
                file_id: page_id.file_id,
                page_num: page_id.page_num,
            })?;

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if self.fsync_enabled {
            handle.file.sync_all()?;
        }

        if page_id.page_num >= handle.num_pages {
            handle.num_pages = page_id.page_num + 1;
        }

        Ok(())
    }

    /// Allocates a new zeroed page at the end of the file.
    ///
    /// Returns the PageId of the newly allocated page.
    pub fn allocate_page(&self, file_id: u32) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&file_id)
            .ok_or(QuarryError::FileNotFound(format!("file_id {file_id}")))?;

        let page_num = handle.num_pages;
        let page_id = PageId::new(file_id, page_num);

        let offset = (page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.fsync_enabled {
            handle.file.sync_all()?;
        }

        handle.num_pages = page_num + 1;

        Ok(page_id)
    }

    /// Returns the number of pages in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<u32> {
        let inner = self.inner.lock();
        let handle = inner
            .files
            .get(&file_id)
            .ok_or(QuarryError::FileNotFound(format!("file_id {file_id}")))?;
        Ok(handle.num_pages)
    }

    /// Syncs a single file's pending writes to disk.
    pub fn sync_file(&self, file_id: u32) -> Result<()> {
        let inner = self.inner.lock();
        let handle = inner
            .files
            .get(&file_id)
            .ok_or(QuarryError::FileNotFound(format!("file_id {file_id}")))?;
        handle.file.sync_all()?;
        Ok(())
    }

    /// Closes a specific file, syncing it first.
    pub fn close_file(&self, file_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.files.remove(&file_id) {
            inner.by_name.remove(&handle.name);
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.by_name.clear();
        for (_, handle) in inner.files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a file by name, closing it first if open.
    pub fn delete(&self, name: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(file_id) = inner.by_name.remove(name) {
                inner.files.remove(&file_id);
            }
        }
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let dm = DiskManager::new(&config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
    }

    #[test]
    fn test_disk_manager_create_and_exists() {
        let (dm, _dir) = create_test_disk_manager();

        assert!(!dm.exists("rel.4"));
        dm.create("rel.4").unwrap();
        assert!(dm.exists("rel.4"));
    }

    #[test]
    fn test_disk_manager_create_existing_fails() {
        let (dm, _dir) = create_test_disk_manager();

        dm.create("rel.4").unwrap();
        let result = dm.create("rel.4");
        assert!(matches!(result, Err(QuarryError::FileAlreadyExists(_))));
    }

    #[test]
    fn test_disk_manager_open_missing_fails() {
        let (dm, _dir) = create_test_disk_manager();

        let result = dm.open("nope");
        assert!(matches!(result, Err(QuarryError::FileNotFound(_))));
    }

    #[test]
    fn test_disk_manager_open_returns_same_id() {
        let (dm, _dir) = create_test_disk_manager();

        let id1 = dm.create("rel.4").unwrap();
        let id2 = dm.open("rel.4").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create("data").unwrap();

        let page1 = dm.allocate_page(file_id).unwrap();
        assert_eq!(page1.file_id, file_id);
        assert_eq!(page1.page_num, 0);

        let page2 = dm.allocate_page(file_id).unwrap();
        assert_eq!(page2.page_num, 1);

        assert_eq!(dm.num_pages(file_id).unwrap(), 2);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create("data").unwrap();

        let page_id = dm.allocate_page(file_id).unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let read_data = dm.read_page(page_id).unwrap();
        assert_eq!(read_data[0], 0xAB);
        assert_eq!(read_data[100], 0xCD);
        assert_eq!(read_data[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_multiple_files() {
        let (dm, _dir) = create_test_disk_manager();

        let f0 = dm.create("a").unwrap();
        let f1 = dm.create("b").unwrap();
        assert_ne!(f0, f1);

        let p0 = dm.allocate_page(f0).unwrap();
        let p1 = dm.allocate_page(f1).unwrap();

        let mut data0 = [0u8; PAGE_SIZE];
        data0[0] = 0x11;
        dm.write_page(p0, &data0).unwrap();

        let mut data1 = [0u8; PAGE_SIZE];
        data1[0] = 0x22;
        dm.write_page(p1, &data1).unwrap();

        assert_eq!(dm.read_page(p0).unwrap()[0], 0x11);
        assert_eq!(dm.read_page(p1).unwrap()[0], 0x22);
    }

    #[test]
    fn test_disk_manager_read_nonexistent_page() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create("data").unwrap();

        dm.allocate_page(file_id).unwrap();

        let result = dm.read_page(PageId::new(file_id, 99));
        assert!(matches!(result, Err(QuarryError::PageNotFound { .. })));
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: true,
            ..Default::default()
        };
        let page_id;

        {
            let dm = DiskManager::new(&config).unwrap();
            let file_id = dm.create("persist").unwrap();
            page_id = dm.allocate_page(file_id).unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let dm = DiskManager::new(&config).unwrap();
            let file_id = dm.open("persist").unwrap();
            assert_eq!(dm.num_pages(file_id).unwrap(), 1);

            let read_data = dm.read_page(PageId::new(file_id, page_id.page_num)).unwrap();
            assert_eq!(read_data[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_delete() {
        let (dm, dir) = create_test_disk_manager();

        let file_id = dm.create("doomed").unwrap();
        dm.allocate_page(file_id).unwrap();
        assert!(dir.path().join("doomed").exists());

        dm.delete("doomed").unwrap();
        assert!(!dir.path().join("doomed").exists());
        assert!(!dm.exists("doomed"));
    }

    #[test]
    fn test_disk_manager_close_and_reopen() {
        let (dm, _dir) = create_test_disk_manager();

        let file_id = dm.create("data").unwrap();
        dm.allocate_page(file_id).unwrap();
        dm.close_file(file_id).unwrap();

        // Operations on the closed id fail
        assert!(dm.num_pages(file_id).is_err());

        // Reopening by name works and sees the allocated page
        let file_id2 = dm.open("data").unwrap();
        assert_eq!(dm.num_pages(file_id2).unwrap(), 1);
    }

    #[test]
    fn test_disk_manager_sync_file() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create("data").unwrap();
        dm.allocate_page(file_id).unwrap();
        dm.sync_file(file_id).unwrap();
    }
}
