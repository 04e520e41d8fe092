//! Page table mapping resident page IDs to buffer frames.

use crate::frame::FrameId;
use parking_lot::Mutex;
use quarry_common::page::PageId;
use std::collections::HashMap;

/// Maps page IDs to the frames that currently hold them.
///
/// Lookups, inserts, and removals all go through a single mutex. The
/// access model is single-threaded cooperative, so contention is not a
/// concern; the map exists for correctness, not throughput.
pub struct PageTable {
    entries: Mutex<HashMap<PageId, FrameId>>,
}

impl PageTable {
    /// Creates a new page table sized for the given number of frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Looks up a page ID and returns its frame ID if resident.
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        self.entries.lock().get(&page_id).copied()
    }

    /// Inserts a page ID to frame ID mapping.
    pub fn insert(&self, page_id: PageId, frame_id: FrameId) {
        self.entries.lock().insert(page_id, frame_id);
    }

    /// Removes a page ID mapping. Returns the frame ID if it was present.
    pub fn remove(&self, page_id: PageId) -> Option<FrameId> {
        self.entries.lock().remove(&page_id)
    }

    /// Returns true if the page ID is in the table.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.entries.lock().contains_key(&page_id)
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Iterates over all entries, calling the provided function for each.
    /// Returns early if the function returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId) -> bool,
    {
        let entries = self.entries.lock();
        for (&page_id, &frame_id) in entries.iter() {
            if !f(page_id, frame_id) {
                return;
            }
        }
    }
}
