//! The B+ tree index driver: lifecycle, insert, and delete paths.
//!
//! The tree is generic over its key kind. Descent records the page
//! numbers visited so split and underflow propagation can walk back up
//! the same path instead of re-deriving parents. Every page access
//! goes through the buffer manager's pin/unpin protocol: a pin taken
//! here is released on every exit path, including errors.

use crate::btree::key::IndexKey;
use crate::btree::node::{InternalNode, LeafNode, MetaPage, NodeKind, MAX_RELATION_NAME, NO_SIBLING};
use crate::btree::scan::ScanState;
use crate::bufmgr::BufferManager;
use crate::relation::RelationFile;
use quarry_common::page::{PageId, RecordId};
use quarry_common::{QuarryError, Result};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page number of the meta page within an index file.
const META_PAGE: u32 = 0;

/// Upper bound on tree height, used to detect pointer cycles.
const MAX_HEIGHT: usize = 16;

/// A disk-backed B+ tree secondary index over one fixed-width
/// attribute of a relation.
///
/// Maps attribute values to the record IDs holding them. Supports
/// insertion, point deletion, and bounded range scans through a
/// stateful cursor (see the scan methods).
pub struct BTreeIndex<K: IndexKey> {
    pub(crate) bufmgr: Arc<BufferManager>,
    pub(crate) file_id: u32,
    index_name: String,
    relation: String,
    attr_offset: u32,
    pub(crate) root_page: u32,
    pub(crate) scan: Option<ScanState<K>>,
    closed: bool,
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Opens the index for `(relation, attr_offset, K)`.
    ///
    /// The index file is named `<relation>.<attr_offset>`. If it
    /// exists, its meta page must match the requested triple or
    /// `BadIndexInfo` is returned. If it does not exist, it is created
    /// and bulk-loaded from the relation file.
    pub fn open(bufmgr: Arc<BufferManager>, relation: &str, attr_offset: u32) -> Result<Self> {
        if relation.len() > MAX_RELATION_NAME {
            return Err(QuarryError::RelationNameTooLong {
                len: relation.len(),
                max: MAX_RELATION_NAME,
            });
        }

        let index_name = format!("{relation}.{attr_offset}");

        if bufmgr.disk().exists(&index_name) {
            Self::open_existing(bufmgr, relation, attr_offset, index_name)
        } else {
            Self::create(bufmgr, relation, attr_offset, index_name)
        }
    }

    fn open_existing(
        bufmgr: Arc<BufferManager>,
        relation: &str,
        attr_offset: u32,
        index_name: String,
    ) -> Result<Self> {
        let file_id = bufmgr.disk().open(&index_name)?;
        let mut index = Self {
            bufmgr,
            file_id,
            index_name,
            relation: relation.to_string(),
            attr_offset,
            root_page: 0,
            scan: None,
            closed: false,
        };

        let meta = index.read_meta()?;
        if meta.relation != relation
            || meta.attr_offset != attr_offset
            || meta.attr_type != K::TYPE
        {
            // Nothing was modified; release the file without flushing.
            index.closed = true;
            let _ = index.bufmgr.discard_file(index.file_id);
            let _ = index.bufmgr.disk().close_file(index.file_id);
            return Err(QuarryError::BadIndexInfo(format!(
                "stored ({}, {}, {}), requested ({}, {}, {})",
                meta.relation, meta.attr_offset, meta.attr_type, relation, attr_offset, K::TYPE
            )));
        }

        index.root_page = meta.root_page;
        info!(index = %index.index_name, root = index.root_page, "opened index");
        Ok(index)
    }

    fn create(
        bufmgr: Arc<BufferManager>,
        relation: &str,
        attr_offset: u32,
        index_name: String,
    ) -> Result<Self> {
        let file_id = bufmgr.disk().create(&index_name)?;

        // Meta page first, then the initial empty leaf root.
        let (meta_pid, meta_frame) = bufmgr.alloc_page(file_id)?;
        if meta_pid.page_num != META_PAGE {
            bufmgr.unpin_page(meta_pid, false)?;
            return Err(QuarryError::Internal(
                "meta page was not allocated first".to_string(),
            ));
        }

        let root_alloc = bufmgr.alloc_page(file_id);
        let (root_pid, root_frame) = match root_alloc {
            Ok(pair) => pair,
            Err(e) => {
                bufmgr.unpin_page(meta_pid, false)?;
                return Err(e);
            }
        };

        LeafNode::<K>::new().write(&mut root_frame.write_data()[..]);
        bufmgr.unpin_page(root_pid, true)?;

        let meta = MetaPage::new(relation, attr_offset, K::TYPE, root_pid.page_num)?;
        meta.write(&mut meta_frame.write_data()[..]);
        bufmgr.unpin_page(meta_pid, true)?;

        let mut index = Self {
            bufmgr,
            file_id,
            index_name,
            relation: relation.to_string(),
            attr_offset,
            root_page: root_pid.page_num,
            scan: None,
            closed: false,
        };

        info!(index = %index.index_name, "created index, bulk loading");
        match index.bulk_load() {
            Ok(()) => Ok(index),
            Err(e) => {
                // Leave no half-built index behind: a later open would
                // otherwise see a valid but empty tree.
                index.closed = true;
                let _ = index.bufmgr.discard_file(index.file_id);
                let _ = index.bufmgr.disk().delete(&index.index_name);
                Err(e)
            }
        }
    }

    /// Scans the relation file and inserts every record's attribute.
    fn bulk_load(&mut self) -> Result<()> {
        let rel = RelationFile::open(self.bufmgr.clone(), &self.relation)?;

        if self.attr_offset as usize + K::WIDTH > rel.record_size() {
            return Err(QuarryError::BadIndexInfo(format!(
                "attribute at offset {} ({} bytes) does not fit record size {}",
                self.attr_offset,
                K::WIDTH,
                rel.record_size()
            )));
        }

        let mut loaded = 0u64;
        let mut scan = rel.scan()?;
        loop {
            match scan.next() {
                Ok(rid) => {
                    let record = scan.record()?;
                    let key = K::read(&record[self.attr_offset as usize..]);
                    self.insert(&key, rid)?;
                    loaded += 1;
                }
                Err(QuarryError::EndOfFile) => break,
                Err(e) => return Err(e),
            }
        }

        info!(index = %self.index_name, records = loaded, "bulk load complete");
        Ok(())
    }

    /// Returns the index file name (`<relation>.<offset>`).
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Returns the disk manager file id of the index file.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Returns the tree height (1 = the root is a leaf).
    pub fn height(&self) -> Result<u32> {
        let mut height = 1u32;
        let mut current = self.root_page;
        loop {
            if height as usize > MAX_HEIGHT {
                return Err(QuarryError::TreeCorrupted(
                    "height walk exceeded max height".to_string(),
                ));
            }
            match self.read_node_kind(current)? {
                NodeKind::Leaf => return Ok(height),
                NodeKind::Internal => {
                    let node = self.read_internal(current)?;
                    current = node.children[0];
                    height += 1;
                }
            }
        }
    }

    /// Flushes the index file and releases its handle.
    ///
    /// An active scan is ended first. Dropping the index performs the
    /// same steps best-effort.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.scan.is_some() {
            self.end_scan()?;
        }
        self.bufmgr.flush_file(self.file_id)?;
        self.bufmgr.discard_file(self.file_id)?;
        self.bufmgr.disk().close_file(self.file_id)?;
        self.closed = true;
        Ok(())
    }

    // =========================================================================
    // Page helpers
    // =========================================================================

    pub(crate) fn page_id(&self, page_num: u32) -> PageId {
        PageId::new(self.file_id, page_num)
    }

    fn read_meta(&self) -> Result<MetaPage> {
        let pid = self.page_id(META_PAGE);
        let frame = self.bufmgr.read_page(pid)?;
        let parsed = {
            let data = frame.read_data();
            MetaPage::read(&data[..])
        };
        self.bufmgr.unpin_page(pid, false)?;
        parsed
    }

    fn write_meta(&self, meta: &MetaPage) -> Result<()> {
        let pid = self.page_id(META_PAGE);
        let frame = self.bufmgr.read_page(pid)?;
        meta.write(&mut frame.write_data()[..]);
        self.bufmgr.unpin_page(pid, true)
    }

    pub(crate) fn read_node_kind(&self, page_num: u32) -> Result<NodeKind> {
        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        let kind = {
            let data = frame.read_data();
            NodeKind::of(&data[..])
        };
        self.bufmgr.unpin_page(pid, false)?;
        kind
    }

    pub(crate) fn read_leaf(&self, page_num: u32) -> Result<LeafNode<K>> {
        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        let parsed = {
            let data = frame.read_data();
            LeafNode::read(&data[..])
        };
        self.bufmgr.unpin_page(pid, false)?;
        parsed
    }

    fn write_leaf(&self, page_num: u32, leaf: &LeafNode<K>) -> Result<()> {
        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        leaf.write(&mut frame.write_data()[..]);
        self.bufmgr.unpin_page(pid, true)
    }

    pub(crate) fn read_internal(&self, page_num: u32) -> Result<InternalNode<K>> {
        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        let parsed = {
            let data = frame.read_data();
            InternalNode::read(&data[..])
        };
        self.bufmgr.unpin_page(pid, false)?;
        parsed
    }

    fn write_internal(&self, page_num: u32, node: &InternalNode<K>) -> Result<()> {
        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        node.write(&mut frame.write_data()[..]);
        self.bufmgr.unpin_page(pid, true)
    }

    /// Allocates a page for a new node, reusing the free list first.
    fn alloc_node_page(&self) -> Result<u32> {
        let mut meta = self.read_meta()?;
        if meta.free_head != 0 {
            let page_num = meta.free_head;
            let pid = self.page_id(page_num);
            let frame = self.bufmgr.read_page(pid)?;
            let next = {
                let data = frame.read_data();
                u32::from_le_bytes([data[0], data[1], data[2], data[3]])
            };
            self.bufmgr.unpin_page(pid, false)?;

            meta.free_head = next;
            self.write_meta(&meta)?;
            debug!(page = page_num, "reused freed index page");
            return Ok(page_num);
        }

        let (pid, _frame) = self.bufmgr.alloc_page(self.file_id)?;
        self.bufmgr.unpin_page(pid, false)?;
        Ok(pid.page_num)
    }

    /// Pushes a no-longer-referenced node page onto the free list.
    ///
    /// The page's leading bytes become the link to the previous free
    /// head; the page is then flushed and dropped from the pool.
    fn free_node_page(&self, page_num: u32) -> Result<()> {
        let mut meta = self.read_meta()?;

        let pid = self.page_id(page_num);
        let frame = self.bufmgr.read_page(pid)?;
        {
            let mut data = frame.write_data();
            data[0..4].copy_from_slice(&meta.free_head.to_le_bytes());
        }
        self.bufmgr.unpin_page(pid, true)?;
        self.bufmgr.dispose_page(pid)?;

        meta.free_head = page_num;
        self.write_meta(&meta)?;
        debug!(page = page_num, "freed index page");
        Ok(())
    }

    /// Rewrites the meta page's root pointer.
    fn update_root(&mut self, new_root: u32) -> Result<()> {
        let mut meta = self.read_meta()?;
        meta.root_page = new_root;
        self.write_meta(&meta)?;
        self.root_page = new_root;
        Ok(())
    }

    // =========================================================================
    // Descent
    // =========================================================================

    /// Walks from the root to the leaf that would hold `key`.
    ///
    /// Returns the page numbers visited, root first, target leaf last.
    /// Equal keys descend left (the in-node search uses >=).
    pub(crate) fn descend(&self, key: &K) -> Result<Vec<u32>> {
        let mut path = Vec::new();
        let mut current = self.root_page;

        loop {
            if path.len() >= MAX_HEIGHT {
                return Err(QuarryError::TreeCorrupted(format!(
                    "descent exceeded max height {MAX_HEIGHT}"
                )));
            }
            path.push(current);

            let pid = self.page_id(current);
            let frame = self.bufmgr.read_page(pid)?;
            let step = {
                let data = frame.read_data();
                match NodeKind::of(&data[..]) {
                    Ok(NodeKind::Leaf) => Ok(None),
                    Ok(NodeKind::Internal) => {
                        InternalNode::<K>::read(&data[..]).map(|node| Some(node.child_for(key)))
                    }
                    Err(e) => Err(e),
                }
            };
            self.bufmgr.unpin_page(pid, false)?;

            match step? {
                None => return Ok(path),
                Some(child) => current = child,
            }
        }
    }

    // =========================================================================
    // Insert path
    // =========================================================================

    /// Inserts a (key, rid) entry.
    ///
    /// Duplicate keys are allowed and stored as independent entries;
    /// their relative order is not specified.
    pub fn insert(&mut self, key: &K, rid: RecordId) -> Result<()> {
        let path = self.descend(key)?;
        let (&leaf_no, parents) = path
            .split_last()
            .ok_or_else(|| QuarryError::Internal("empty descent path".to_string()))?;

        let mut leaf = self.read_leaf(leaf_no)?;

        if !leaf.is_full() {
            let idx = leaf.lower_bound(key);
            leaf.insert_at(idx, *key, rid);
            return self.write_leaf(leaf_no, &leaf);
        }

        // Split: upper half moves to a fresh right sibling, the
        // separator (largest key staying left) is copied up.
        let new_page = self.alloc_node_page()?;
        let mut right = leaf.split();
        leaf.right_sibling = new_page;

        let separator = *leaf.keys.last().ok_or_else(|| {
            QuarryError::TreeCorrupted("left half empty after leaf split".to_string())
        })?;

        if key.compare(&separator) != Ordering::Greater {
            let idx = leaf.lower_bound(key);
            leaf.insert_at(idx, *key, rid);
        } else {
            let idx = right.lower_bound(key);
            right.insert_at(idx, *key, rid);
        }

        self.write_leaf(leaf_no, &leaf)?;
        self.write_leaf(new_page, &right)?;
        debug!(left = leaf_no, right = new_page, "leaf split");

        self.insert_into_parent(parents, separator, new_page, 1)
    }

    /// Inserts a separator and its right child into the parent chain,
    /// splitting internal nodes as needed.
    ///
    /// `new_root_level` is the level a newly created root would get:
    /// 1 when the children are leaves, 0 otherwise.
    fn insert_into_parent(
        &mut self,
        parents: &[u32],
        key: K,
        right_child: u32,
        new_root_level: u16,
    ) -> Result<()> {
        let mut key = key;
        let mut right_child = right_child;
        let mut level = new_root_level;
        let mut depth = parents.len();

        loop {
            if depth == 0 {
                // The old root split: grow the tree by one level.
                let new_root = self.alloc_node_page()?;
                let mut root = InternalNode::<K>::new(level);
                root.children.push(self.root_page);
                root.insert_at(0, key, right_child);
                self.write_internal(new_root, &root)?;
                self.update_root(new_root)?;
                debug!(root = new_root, "root split, height increased");
                return Ok(());
            }

            let node_no = parents[depth - 1];
            let mut node = self.read_internal(node_no)?;

            if !node.is_full() {
                let idx = node.lower_bound(&key);
                node.insert_at(idx, key, right_child);
                return self.write_internal(node_no, &node);
            }

            // Split the internal node; the middle key is pushed up.
            let new_page = self.alloc_node_page()?;
            let (push_up, mut right) = node.split();

            if key.compare(&push_up) != Ordering::Greater {
                let idx = node.lower_bound(&key);
                node.insert_at(idx, key, right_child);
            } else {
                let idx = right.lower_bound(&key);
                right.insert_at(idx, key, right_child);
            }

            self.write_internal(node_no, &node)?;
            self.write_internal(new_page, &right)?;
            debug!(left = node_no, right = new_page, "internal split");

            key = push_up;
            right_child = new_page;
            level = 0;
            depth -= 1;
        }
    }

    // =========================================================================
    // Delete path
    // =========================================================================

    /// Deletes one entry with the given key.
    ///
    /// Deleting an absent key is a no-op. With duplicates present, one
    /// unspecified entry among the equals is removed.
    pub fn delete(&mut self, key: &K) -> Result<()> {
        let path = self.descend(key)?;
        let leaf_no = *path
            .last()
            .ok_or_else(|| QuarryError::Internal("empty descent path".to_string()))?;

        let mut leaf = self.read_leaf(leaf_no)?;
        let idx = leaf.lower_bound(key);
        if idx >= leaf.size() || leaf.keys[idx].compare(key) != Ordering::Equal {
            return Ok(());
        }

        leaf.remove_at(idx);
        let underfull = leaf.size() < LeafNode::<K>::min_fill();
        self.write_leaf(leaf_no, &leaf)?;

        if path.len() == 1 || !underfull {
            return Ok(());
        }
        self.rebalance_leaf(&path)
    }

    /// Fixes an underfull leaf at the end of `path` by redistribution
    /// (right sibling preferred, then left) or merge.
    fn rebalance_leaf(&mut self, path: &[u32]) -> Result<()> {
        let leaf_no = path[path.len() - 1];
        let parent_no = path[path.len() - 2];

        let mut parent = self.read_internal(parent_no)?;
        let ci = parent.position_of_child(leaf_no).ok_or_else(|| {
            QuarryError::TreeCorrupted(format!("leaf {leaf_no} not under parent {parent_no}"))
        })?;
        let mut leaf = self.read_leaf(leaf_no)?;
        let min_fill = LeafNode::<K>::min_fill();

        // Borrow from the right sibling.
        if ci < parent.size() {
            let right_no = parent.children[ci + 1];
            let mut right = self.read_leaf(right_no)?;
            if right.size() > min_fill {
                let (k, r) = right.remove_at(0);
                leaf.insert_at(leaf.size(), k, r);
                // Separator tracks the largest key left of the boundary.
                parent.keys[ci] = k;

                self.write_leaf(leaf_no, &leaf)?;
                self.write_leaf(right_no, &right)?;
                self.write_internal(parent_no, &parent)?;
                debug!(leaf = leaf_no, from = right_no, "leaf borrowed from right");
                return Ok(());
            }
        }

        // Borrow from the left sibling.
        if ci > 0 {
            let left_no = parent.children[ci - 1];
            let mut left = self.read_leaf(left_no)?;
            if left.size() > min_fill {
                let (k, r) = left.remove_at(left.size() - 1);
                leaf.insert_at(0, k, r);
                let new_sep = *left.keys.last().ok_or_else(|| {
                    QuarryError::TreeCorrupted("left sibling empty after borrow".to_string())
                })?;
                parent.keys[ci - 1] = new_sep;

                self.write_leaf(left_no, &left)?;
                self.write_leaf(leaf_no, &leaf)?;
                self.write_internal(parent_no, &parent)?;
                debug!(leaf = leaf_no, from = left_no, "leaf borrowed from left");
                return Ok(());
            }
        }

        // Merge, preferring the right sibling.
        if ci < parent.size() {
            let right_no = parent.children[ci + 1];
            let mut right = self.read_leaf(right_no)?;

            leaf.keys.append(&mut right.keys);
            leaf.rids.append(&mut right.rids);
            leaf.right_sibling = right.right_sibling;
            self.write_leaf(leaf_no, &leaf)?;
            self.free_node_page(right_no)?;
            debug!(left = leaf_no, right = right_no, "leaf merge");

            self.remove_from_parent(path, parent, parent_no, ci)
        } else {
            let left_no = parent.children[ci - 1];
            let mut left = self.read_leaf(left_no)?;

            left.keys.append(&mut leaf.keys);
            left.rids.append(&mut leaf.rids);
            left.right_sibling = leaf.right_sibling;
            self.write_leaf(left_no, &left)?;
            self.free_node_page(leaf_no)?;
            debug!(left = left_no, right = leaf_no, "leaf merge");

            self.remove_from_parent(path, parent, parent_no, ci - 1)
        }
    }

    /// Removes the separator at `sep_idx` (and its right child) from a
    /// parent after a merge, shrinking the root or cascading the
    /// underflow as needed. `path` still ends at the merged child.
    fn remove_from_parent(
        &mut self,
        path: &[u32],
        mut parent: InternalNode<K>,
        parent_no: u32,
        sep_idx: usize,
    ) -> Result<()> {
        parent.remove_at(sep_idx);

        if path.len() == 2 {
            // Parent is the root.
            if parent.size() == 0 {
                let only_child = parent.children[0];
                self.update_root(only_child)?;
                self.free_node_page(parent_no)?;
                debug!(root = only_child, "root collapsed, height decreased");
                return Ok(());
            }
            return self.write_internal(parent_no, &parent);
        }

        let underfull = parent.size() < InternalNode::<K>::min_fill();
        self.write_internal(parent_no, &parent)?;
        if !underfull {
            return Ok(());
        }
        self.rebalance_internal(&path[..path.len() - 1])
    }

    /// Fixes an underfull internal node at the end of `path`.
    ///
    /// Redistribution rotates a key through the parent; merge pulls
    /// the separator down between the two merged children.
    fn rebalance_internal(&mut self, path: &[u32]) -> Result<()> {
        let node_no = path[path.len() - 1];
        let parent_no = path[path.len() - 2];

        let mut parent = self.read_internal(parent_no)?;
        let ci = parent.position_of_child(node_no).ok_or_else(|| {
            QuarryError::TreeCorrupted(format!("node {node_no} not under parent {parent_no}"))
        })?;
        let mut node = self.read_internal(node_no)?;
        let min_fill = InternalNode::<K>::min_fill();

        // Borrow from the right sibling: parent separator comes down,
        // right's first key goes up.
        if ci < parent.size() {
            let right_no = parent.children[ci + 1];
            let mut right = self.read_internal(right_no)?;
            if right.size() > min_fill {
                node.keys.push(parent.keys[ci]);
                node.children.push(right.children.remove(0));
                parent.keys[ci] = right.keys.remove(0);

                self.write_internal(node_no, &node)?;
                self.write_internal(right_no, &right)?;
                self.write_internal(parent_no, &parent)?;
                debug!(node = node_no, from = right_no, "internal borrowed from right");
                return Ok(());
            }
        }

        // Borrow from the left sibling.
        if ci > 0 {
            let left_no = parent.children[ci - 1];
            let mut left = self.read_internal(left_no)?;
            if left.size() > min_fill {
                let borrowed_child = left.children.pop().ok_or_else(|| {
                    QuarryError::TreeCorrupted("left sibling has no children".to_string())
                })?;
                let promoted = left.keys.pop().ok_or_else(|| {
                    QuarryError::TreeCorrupted("left sibling has no keys".to_string())
                })?;
                node.keys.insert(0, parent.keys[ci - 1]);
                node.children.insert(0, borrowed_child);
                parent.keys[ci - 1] = promoted;

                self.write_internal(left_no, &left)?;
                self.write_internal(node_no, &node)?;
                self.write_internal(parent_no, &parent)?;
                debug!(node = node_no, from = left_no, "internal borrowed from left");
                return Ok(());
            }
        }

        // Merge, preferring the right sibling. The parent separator is
        // pulled down between the merged halves.
        if ci < parent.size() {
            let right_no = parent.children[ci + 1];
            let mut right = self.read_internal(right_no)?;

            node.keys.push(parent.keys[ci]);
            node.keys.append(&mut right.keys);
            node.children.append(&mut right.children);
            self.write_internal(node_no, &node)?;
            self.free_node_page(right_no)?;
            debug!(left = node_no, right = right_no, "internal merge");

            self.remove_from_parent(path, parent, parent_no, ci)
        } else {
            let left_no = parent.children[ci - 1];
            let mut left = self.read_internal(left_no)?;

            left.keys.push(parent.keys[ci - 1]);
            left.keys.append(&mut node.keys);
            left.children.append(&mut node.children);
            self.write_internal(left_no, &left)?;
            self.free_node_page(node_no)?;
            debug!(left = left_no, right = node_no, "internal merge");

            self.remove_from_parent(path, parent, parent_no, ci - 1)
        }
    }

    // =========================================================================
    // Integrity checking
    // =========================================================================

    /// Walks the whole tree and verifies its structural invariants:
    /// sorted keys, separator bounds, minimum occupancy of non-root
    /// nodes, and the leaf sibling chain.
    pub fn validate(&self) -> Result<()> {
        let mut leaves = Vec::new();
        self.validate_node(self.root_page, true, None, None, &mut leaves, 0)?;

        for pair in leaves.windows(2) {
            let left = self.read_leaf(pair[0])?;
            if left.right_sibling != pair[1] {
                return Err(QuarryError::TreeCorrupted(format!(
                    "leaf {} sibling pointer {} does not reach next leaf {}",
                    pair[0], left.right_sibling, pair[1]
                )));
            }
        }
        if let Some(&last) = leaves.last() {
            let leaf = self.read_leaf(last)?;
            if leaf.right_sibling != NO_SIBLING {
                return Err(QuarryError::TreeCorrupted(format!(
                    "last leaf {last} has dangling sibling pointer"
                )));
            }
        }
        Ok(())
    }

    fn validate_node(
        &self,
        page_num: u32,
        is_root: bool,
        lower: Option<K>,
        upper: Option<K>,
        leaves: &mut Vec<u32>,
        depth: usize,
    ) -> Result<()> {
        if depth >= MAX_HEIGHT {
            return Err(QuarryError::TreeCorrupted(
                "validation exceeded max height".to_string(),
            ));
        }

        let check_bounds = |keys: &[K]| -> Result<()> {
            for pair in keys.windows(2) {
                if pair[0].compare(&pair[1]) == Ordering::Greater {
                    return Err(QuarryError::TreeCorrupted(format!(
                        "page {page_num} keys out of order"
                    )));
                }
            }
            if let (Some(lo), Some(first)) = (lower, keys.first()) {
                if first.compare(&lo) == Ordering::Less {
                    return Err(QuarryError::TreeCorrupted(format!(
                        "page {page_num} key below subtree bound"
                    )));
                }
            }
            if let (Some(hi), Some(last)) = (upper, keys.last()) {
                if last.compare(&hi) == Ordering::Greater {
                    return Err(QuarryError::TreeCorrupted(format!(
                        "page {page_num} key above separator bound"
                    )));
                }
            }
            Ok(())
        };

        match self.read_node_kind(page_num)? {
            NodeKind::Leaf => {
                let leaf = self.read_leaf(page_num)?;
                check_bounds(&leaf.keys)?;
                if !is_root && leaf.size() < LeafNode::<K>::min_fill() {
                    return Err(QuarryError::TreeCorrupted(format!(
                        "leaf {page_num} under minimum occupancy"
                    )));
                }
                leaves.push(page_num);
                Ok(())
            }
            NodeKind::Internal => {
                let node = self.read_internal(page_num)?;
                check_bounds(&node.keys)?;
                if node.size() == 0 {
                    return Err(QuarryError::TreeCorrupted(format!(
                        "internal {page_num} has no keys"
                    )));
                }
                if !is_root && node.size() < InternalNode::<K>::min_fill() {
                    return Err(QuarryError::TreeCorrupted(format!(
                        "internal {page_num} under minimum occupancy"
                    )));
                }

                for (i, &child) in node.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(node.keys[i - 1]) };
                    let child_upper = if i == node.size() {
                        upper
                    } else {
                        Some(node.keys[i])
                    };
                    self.validate_node(child, false, child_lower, child_upper, leaves, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl<K: IndexKey> Drop for BTreeIndex<K> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                warn!(index = %self.index_name, error = %e, "error closing index on drop");
            }
        }
    }
}
