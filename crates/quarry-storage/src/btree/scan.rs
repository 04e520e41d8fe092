//! Range-scan cursor over the B+ tree.
//!
//! The cursor keeps the current leaf pinned between calls: one pin is
//! held for the lifetime of an active scan position and released when
//! the cursor steps off the page, completes, or the scan is ended.

use crate::btree::index::BTreeIndex;
use crate::btree::key::IndexKey;
use crate::btree::node::{LeafNode, NO_SIBLING};
use quarry_common::page::RecordId;
use quarry_common::{QuarryError, Result};
use std::cmp::Ordering;
use tracing::trace;

/// Comparison operators accepted by `start_scan`.
///
/// The low bound takes `Gt`/`Gte`, the high bound `Lt`/`Lte`; any
/// other assignment is rejected with `BadOperator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Lte,
    Gte,
    Gt,
}

/// Position of an active cursor: a pinned leaf page, its parsed image,
/// and the next entry to emit.
struct CursorPos<K> {
    page_num: u32,
    next_index: usize,
    leaf: LeafNode<K>,
}

/// State of an active scan.
///
/// The low bound and its operator are consumed while positioning the
/// cursor in `start_scan`; only the high bound needs to survive into
/// `next_record`. `position` is None once the cursor has run off the
/// end of the leaf chain; the scan stays active (so `end_scan` still
/// works) but every `next_record` reports completion.
pub(crate) struct ScanState<K> {
    high: K,
    high_op: Operator,
    position: Option<CursorPos<K>>,
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Opens a scan over `[low, high]` filtered by the two operators.
    ///
    /// Fails with `BadOperator` unless `low_op` is `Gt`/`Gte` and
    /// `high_op` is `Lt`/`Lte`, and with `BadScanRange` if `low` is
    /// greater than `high`. An already-active scan is ended first.
    ///
    /// A scan with no matching entries succeeds; the first call to
    /// `next_record` then reports `IndexScanCompleted`.
    pub fn start_scan(&mut self, low: K, low_op: Operator, high: K, high_op: Operator) -> Result<()> {
        if !matches!(low_op, Operator::Gt | Operator::Gte)
            || !matches!(high_op, Operator::Lt | Operator::Lte)
        {
            return Err(QuarryError::BadOperator);
        }
        if low.compare(&high) == Ordering::Greater {
            return Err(QuarryError::BadScanRange);
        }

        if self.scan.is_some() {
            self.end_scan()?;
        }

        let path = self.descend(&low)?;
        let leaf_no = *path
            .last()
            .ok_or_else(|| QuarryError::Internal("empty descent path".to_string()))?;

        let leaf = self.pin_leaf(leaf_no)?;
        let mut pos = CursorPos {
            page_num: leaf_no,
            next_index: 0,
            leaf,
        };

        // Position at the first entry satisfying the low bound. The
        // descent may land on the predecessor leaf when `low` falls in
        // the gap between two leaves, so stepping right is expected.
        let mut cursor = match pos.leaf.keys.last().copied() {
            None => {
                // Empty leaf: only the root can be empty.
                self.unpin_cursor(pos.page_num)?;
                None
            }
            Some(last) if low.compare(&last) == Ordering::Greater => {
                self.step_to_next_leaf(pos)?
            }
            Some(_) => {
                pos.next_index = pos.leaf.lower_bound(&low);
                Some(pos)
            }
        };

        // A strict low bound skips every entry equal to it.
        if low_op == Operator::Gt {
            loop {
                match cursor.take() {
                    Some(pos)
                        if pos.leaf.keys[pos.next_index].compare(&low) == Ordering::Equal =>
                    {
                        cursor = self.advance(pos)?;
                    }
                    other => {
                        cursor = other;
                        break;
                    }
                }
            }
        }

        trace!(
            index = %self.name(),
            positioned = cursor.is_some(),
            "scan started"
        );
        self.scan = Some(ScanState {
            high,
            high_op,
            position: cursor,
        });
        Ok(())
    }

    /// Emits the next record ID in the scan range.
    ///
    /// Fails with `ScanNotInitialized` when no scan is active and
    /// `IndexScanCompleted` once the range is exhausted.
    pub fn next_record(&mut self) -> Result<RecordId> {
        let (pos, high, high_op) = {
            let scan = self
                .scan
                .as_mut()
                .ok_or(QuarryError::ScanNotInitialized)?;
            match scan.position.take() {
                None => return Err(QuarryError::IndexScanCompleted),
                Some(pos) => (pos, scan.high, scan.high_op),
            }
        };

        let key = pos.leaf.keys[pos.next_index];
        let past_high = match key.compare(&high) {
            Ordering::Greater => true,
            Ordering::Equal => high_op == Operator::Lt,
            Ordering::Less => false,
        };
        if past_high {
            // Keep the position (and its pin) so end_scan releases it.
            if let Some(scan) = self.scan.as_mut() {
                scan.position = Some(pos);
            }
            return Err(QuarryError::IndexScanCompleted);
        }

        let rid = pos.leaf.rids[pos.next_index];
        let next = self.advance(pos)?;
        if let Some(scan) = self.scan.as_mut() {
            scan.position = next;
        }
        Ok(rid)
    }

    /// Ends the active scan, releasing the cursor's pinned leaf.
    pub fn end_scan(&mut self) -> Result<()> {
        let scan = self.scan.take().ok_or(QuarryError::ScanNotInitialized)?;
        if let Some(pos) = scan.position {
            self.unpin_cursor(pos.page_num)?;
        }
        Ok(())
    }

    /// Reads and pins a leaf page, leaving the pin held for the cursor.
    fn pin_leaf(&self, page_num: u32) -> Result<LeafNode<K>> {
        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        let parsed = {
            let data = frame.read_data();
            LeafNode::read(&data[..])
        };
        match parsed {
            Ok(leaf) => Ok(leaf),
            Err(e) => {
                self.bufmgr.unpin_page(pid, false)?;
                Err(e)
            }
        }
    }

    /// Releases the cursor's pin on a leaf page.
    fn unpin_cursor(&self, page_num: u32) -> Result<()> {
        self.bufmgr.unpin_page(self.page_id(page_num), false)
    }

    /// Moves the cursor one entry forward, hopping to the right
    /// sibling when the current leaf is exhausted.
    fn advance(&self, mut pos: CursorPos<K>) -> Result<Option<CursorPos<K>>> {
        if pos.next_index + 1 < pos.leaf.size() {
            pos.next_index += 1;
            return Ok(Some(pos));
        }
        self.step_to_next_leaf(pos)
    }

    /// Unpins the current leaf and pins the next one in the sibling
    /// chain, skipping empty leaves. Returns None at the end of the
    /// chain.
    fn step_to_next_leaf(&self, pos: CursorPos<K>) -> Result<Option<CursorPos<K>>> {
        let mut next = pos.leaf.right_sibling;
        self.unpin_cursor(pos.page_num)?;

        loop {
            if next == NO_SIBLING {
                return Ok(None);
            }
            let leaf = self.pin_leaf(next)?;
            if leaf.size() > 0 {
                return Ok(Some(CursorPos {
                    page_num: next,
                    next_index: 0,
                    leaf,
                }));
            }
            let following = leaf.right_sibling;
            self.unpin_cursor(next)?;
            next = following;
        }
    }
}
