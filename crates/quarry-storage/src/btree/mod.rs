//! Disk-backed B+ tree secondary index.
//!
//! Maps one fixed-width attribute of a relation to the record IDs
//! holding it. The tree lives in its own paged file: page 0 is the
//! meta page (identity triple, root pointer, free list), every other
//! page is a leaf or internal node. All page access goes through the
//! buffer manager's pin/unpin protocol.
//!
//! ```text
//!                    [ internal: level 0 ]
//!                   /                     \
//!         [ internal: level 1 ]   [ internal: level 1 ]
//!          /       |                    |        \
//!     [leaf] -> [leaf] ----------> [leaf] -> [leaf] -> 0
//! ```
//!
//! Leaves chain through `right_sibling` in ascending key order, which
//! is what the range-scan cursor walks. Separators satisfy
//! `max(subtree(child_i)) <= key_i < keys(child_{i+1})`, and the
//! in-node search uses >=, so equal keys descend left.

pub mod index;
pub mod key;
pub mod node;
pub mod scan;

pub use index::BTreeIndex;
pub use key::{IndexKey, StringKey};
pub use node::{InternalNode, LeafNode, MetaPage, NodeKind, MAX_RELATION_NAME, NO_SIBLING};
pub use scan::Operator;
