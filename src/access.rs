//! Access layer: the B+ tree index and the record identifiers it stores.

pub mod btree;

use serde::{Deserialize, Serialize};

/// Opaque 64-bit identifier of a tuple. The tree stores these as leaf
/// values and the lock manager keys its lock table by them; neither
/// interprets the bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

pub use btree::key::IndexKey;
pub use btree::BPlusTree;
