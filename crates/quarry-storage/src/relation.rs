//! Relation files: paged storage for fixed-size records, plus the
//! sequential scanner that feeds index bulk loads.

use crate::bufmgr::BufferManager;
use bytes::Bytes;
use quarry_common::page::{PageId, RecordId, PAGE_SIZE};
use quarry_common::{QuarryError, Result};
use std::sync::Arc;

/// Magic number identifying a relation file header page.
const REL_MAGIC: u32 = 0x5152_454C; // "QREL"

/// Header page layout (page 0):
/// - magic: 4 bytes
/// - record_size: 4 bytes
/// - num_records: 8 bytes
struct RelationHeader {
    record_size: u32,
    num_records: u64,
}

impl RelationHeader {
    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&REL_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.record_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.num_records.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != REL_MAGIC {
            return Err(QuarryError::Internal(format!(
                "not a relation file (magic {magic:#x})"
            )));
        }
        Ok(Self {
            record_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            num_records: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        })
    }
}

/// A relation file holding fixed-size records.
///
/// Page 0 is the header; data pages follow. Records are appended
/// densely, so record `i` lives at page `1 + i / records_per_page`,
/// slot `i % records_per_page`. Records are never deleted; a secondary
/// index handles logical removal.
pub struct RelationFile {
    bufmgr: Arc<BufferManager>,
    file_id: u32,
    name: String,
    record_size: usize,
}

impl RelationFile {
    /// Page number of the header page.
    const HEADER_PAGE: u32 = 0;

    /// Creates a new relation file for records of the given size.
    pub fn create(bufmgr: Arc<BufferManager>, name: &str, record_size: usize) -> Result<Self> {
        if record_size == 0 || record_size > PAGE_SIZE {
            return Err(QuarryError::Internal(format!(
                "invalid record size {record_size}"
            )));
        }

        let file_id = bufmgr.disk().create(name)?;
        let (page_id, frame) = bufmgr.alloc_page(file_id)?;

        let header = RelationHeader {
            record_size: record_size as u32,
            num_records: 0,
        };
        header.write(&mut frame.write_data()[..]);
        bufmgr.unpin_page(page_id, true)?;

        Ok(Self {
            bufmgr,
            file_id,
            name: name.to_string(),
            record_size,
        })
    }

    /// Opens an existing relation file, reading the record size from
    /// its header page.
    pub fn open(bufmgr: Arc<BufferManager>, name: &str) -> Result<Self> {
        let file_id = bufmgr.disk().open(name)?;

        let header_id = PageId::new(file_id, Self::HEADER_PAGE);
        let frame = bufmgr.read_page(header_id)?;
        let header = {
            let data = frame.read_data();
            RelationHeader::read(&data[..])
        };
        bufmgr.unpin_page(header_id, false)?;
        let header = header?;

        Ok(Self {
            bufmgr,
            file_id,
            name: name.to_string(),
            record_size: header.record_size as usize,
        })
    }

    /// Returns the relation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the fixed record size in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Returns how many records fit on one data page.
    pub fn records_per_page(&self) -> usize {
        PAGE_SIZE / self.record_size
    }

    /// Returns the number of records in the relation.
    pub fn num_records(&self) -> Result<u64> {
        let header_id = PageId::new(self.file_id, Self::HEADER_PAGE);
        let frame = self.bufmgr.read_page(header_id)?;
        let header = {
            let data = frame.read_data();
            RelationHeader::read(&data[..])
        };
        self.bufmgr.unpin_page(header_id, false)?;
        Ok(header?.num_records)
    }

    /// Appends a record and returns its record ID.
    pub fn append(&self, record: &[u8]) -> Result<RecordId> {
        if record.len() != self.record_size {
            return Err(QuarryError::RecordSizeMismatch {
                expected: self.record_size,
                actual: record.len(),
            });
        }

        // Bump the header count first so a failure below leaves at most
        // a gap at the tail, never a dangling rid.
        let header_id = PageId::new(self.file_id, Self::HEADER_PAGE);
        let frame = self.bufmgr.read_page(header_id)?;
        let header = {
            let data = frame.read_data();
            RelationHeader::read(&data[..])
        };
        let mut header = match header {
            Ok(h) => h,
            Err(e) => {
                self.bufmgr.unpin_page(header_id, false)?;
                return Err(e);
            }
        };

        let rpp = self.records_per_page() as u64;
        let index = header.num_records;
        let page_num = 1 + (index / rpp) as u32;
        let slot = (index % rpp) as u16;

        header.num_records += 1;
        header.write(&mut frame.write_data()[..]);
        self.bufmgr.unpin_page(header_id, true)?;

        let rid = RecordId::new(page_num, slot);
        let page_id = PageId::new(self.file_id, page_num);

        let frame = if slot == 0 {
            // First record of a fresh page
            let (allocated, frame) = self.bufmgr.alloc_page(self.file_id)?;
            if allocated.page_num != page_num {
                self.bufmgr.unpin_page(allocated, false)?;
                return Err(QuarryError::Internal(format!(
                    "relation page allocation out of order: expected {page_num}, got {}",
                    allocated.page_num
                )));
            }
            frame
        } else {
            self.bufmgr.read_page(page_id)?
        };

        let offset = slot as usize * self.record_size;
        frame.write_data()[offset..offset + self.record_size].copy_from_slice(record);
        self.bufmgr.unpin_page(page_id, true)?;

        Ok(rid)
    }

    /// Reads the record at the given record ID.
    pub fn read_record(&self, rid: RecordId) -> Result<Bytes> {
        let rpp = self.records_per_page() as u64;
        let total = self.num_records()?;

        let in_range = rid.page_num >= 1
            && (rid.slot as u64) < rpp
            && ((rid.page_num as u64 - 1) * rpp + rid.slot as u64) < total;
        if !in_range {
            return Err(QuarryError::PageNotFound {
                file_id: self.file_id,
                page_num: rid.page_num,
            });
        }

        let page_id = PageId::new(self.file_id, rid.page_num);
        let frame = self.bufmgr.read_page(page_id)?;
        let bytes = {
            let data = frame.read_data();
            let offset = rid.slot as usize * self.record_size;
            Bytes::copy_from_slice(&data[offset..offset + self.record_size])
        };
        self.bufmgr.unpin_page(page_id, false)?;

        Ok(bytes)
    }

    /// Starts a sequential scan over all records.
    pub fn scan(&self) -> Result<RelationScan<'_>> {
        Ok(RelationScan {
            file: self,
            next: 0,
            total: self.num_records()?,
            current: None,
        })
    }

    /// Flushes all of the relation's dirty pages.
    pub fn flush(&self) -> Result<()> {
        self.bufmgr.flush_file(self.file_id)
    }
}

/// Sequential scanner over a relation file.
///
/// Yields record IDs in (page, slot) order; the bytes of the record
/// most recently yielded are available through `record`.
pub struct RelationScan<'a> {
    file: &'a RelationFile,
    next: u64,
    total: u64,
    current: Option<Bytes>,
}

impl RelationScan<'_> {
    /// Advances to the next record and returns its ID.
    ///
    /// Returns `EndOfFile` when the relation is exhausted.
    pub fn next(&mut self) -> Result<RecordId> {
        if self.next >= self.total {
            return Err(QuarryError::EndOfFile);
        }

        let rpp = self.file.records_per_page() as u64;
        let rid = RecordId::new(1 + (self.next / rpp) as u32, (self.next % rpp) as u16);

        self.current = Some(self.file.read_record(rid)?);
        self.next += 1;
        Ok(rid)
    }

    /// Returns the bytes of the record most recently yielded by `next`.
    pub fn record(&self) -> Result<&Bytes> {
        self.current
            .as_ref()
            .ok_or_else(|| QuarryError::Internal("no current record in scan".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use quarry_common::StorageConfig;
    use tempfile::tempdir;

    fn create_test_bufmgr() -> (Arc<BufferManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let disk = Arc::new(DiskManager::new(&config).unwrap());
        (Arc::new(BufferManager::new(disk, 64)), dir)
    }

    fn make_record(i: u32, size: usize) -> Vec<u8> {
        let mut rec = vec![0u8; size];
        rec[0..4].copy_from_slice(&i.to_le_bytes());
        rec
    }

    #[test]
    fn test_relation_create_and_append() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 32).unwrap();

        assert_eq!(rel.record_size(), 32);
        assert_eq!(rel.num_records().unwrap(), 0);

        let rid = rel.append(&make_record(7, 32)).unwrap();
        assert_eq!(rid.page_num, 1);
        assert_eq!(rid.slot, 0);
        assert_eq!(rel.num_records().unwrap(), 1);
    }

    #[test]
    fn test_relation_append_wrong_size() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 32).unwrap();

        let result = rel.append(&[0u8; 16]);
        assert!(matches!(
            result,
            Err(QuarryError::RecordSizeMismatch {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_relation_read_record() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 32).unwrap();

        let rec = make_record(99, 32);
        let rid = rel.append(&rec).unwrap();

        let read = rel.read_record(rid).unwrap();
        assert_eq!(&read[..], &rec[..]);
    }

    #[test]
    fn test_relation_read_out_of_range() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 32).unwrap();
        rel.append(&make_record(1, 32)).unwrap();

        assert!(rel.read_record(RecordId::new(1, 1)).is_err());
        assert!(rel.read_record(RecordId::new(2, 0)).is_err());
        assert!(rel.read_record(RecordId::new(0, 0)).is_err());
    }

    #[test]
    fn test_relation_spans_pages() {
        let (bufmgr, _dir) = create_test_bufmgr();
        // 1024-byte records: 4 per page
        let rel = RelationFile::create(bufmgr, "big", 1024).unwrap();
        assert_eq!(rel.records_per_page(), 4);

        let mut rids = Vec::new();
        for i in 0..10u32 {
            rids.push(rel.append(&make_record(i, 1024)).unwrap());
        }

        assert_eq!(rids[0], RecordId::new(1, 0));
        assert_eq!(rids[3], RecordId::new(1, 3));
        assert_eq!(rids[4], RecordId::new(2, 0));
        assert_eq!(rids[9], RecordId::new(3, 1));

        for (i, rid) in rids.iter().enumerate() {
            let rec = rel.read_record(*rid).unwrap();
            assert_eq!(
                u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]),
                i as u32
            );
        }
    }

    #[test]
    fn test_relation_scan() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 64).unwrap();

        for i in 0..100u32 {
            rel.append(&make_record(i, 64)).unwrap();
        }

        let mut scan = rel.scan().unwrap();
        let mut count = 0u32;
        loop {
            match scan.next() {
                Ok(_rid) => {
                    let rec = scan.record().unwrap();
                    assert_eq!(
                        u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]),
                        count
                    );
                    count += 1;
                }
                Err(QuarryError::EndOfFile) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn test_relation_scan_empty() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 64).unwrap();

        let mut scan = rel.scan().unwrap();
        assert!(matches!(scan.next(), Err(QuarryError::EndOfFile)));
    }

    #[test]
    fn test_relation_scan_record_before_next() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr, "emp", 64).unwrap();
        rel.append(&make_record(0, 64)).unwrap();

        let scan = rel.scan().unwrap();
        assert!(scan.record().is_err());
    }

    #[test]
    fn test_relation_reopen() {
        let (bufmgr, _dir) = create_test_bufmgr();

        {
            let rel = RelationFile::create(bufmgr.clone(), "emp", 48).unwrap();
            for i in 0..20u32 {
                rel.append(&make_record(i, 48)).unwrap();
            }
            rel.flush().unwrap();
        }

        let rel = RelationFile::open(bufmgr, "emp").unwrap();
        assert_eq!(rel.record_size(), 48);
        assert_eq!(rel.num_records().unwrap(), 20);

        let rec = rel.read_record(RecordId::new(1, 5)).unwrap();
        assert_eq!(u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]), 5);
    }

    #[test]
    fn test_relation_pin_balance() {
        let (bufmgr, _dir) = create_test_bufmgr();
        let rel = RelationFile::create(bufmgr.clone(), "emp", 64).unwrap();

        for i in 0..50u32 {
            rel.append(&make_record(i, 64)).unwrap();
        }
        let mut scan = rel.scan().unwrap();
        while scan.next().is_ok() {}

        assert_eq!(bufmgr.pool_stats().pinned_frames, 0);
    }
}
