//! Ordered key/value index over pool pages: fixed 64-byte memcmp keys,
//! three value storage classes, and split/merge/redistribute rebalancing.

mod delete;
mod insert;
mod iter;
mod key;
mod node;
mod overflow;
mod tree;
mod value;

pub use iter::RangeScan;
pub use key::{Key, KEY_SIZE};
pub use node::{InternalNode, LeafNode, Node, MAX_DEPTH, MAX_ENT, MIN_ENT};
pub use overflow::OverflowStore;
pub use tree::BTree;
pub use value::{ValueRef, INLINE_MAX, NORMAL_MAX};
