//! Range scans over the leaf sibling chain.
//!
//! A scan snapshots one leaf at a time and follows the `next` links, so it
//! sees a consistent view of each leaf without holding latches across
//! items. Like the rest of the tree API it assumes a single mutator or
//! disjoint subtrees; a scan racing a restructure of its own range may
//! observe either version.

use crate::common::{INVALID_PAGE_ID, PageId};
use crate::error::Result;

use super::key::Key;
use super::tree::BTree;
use super::value::ValueRef;

pub struct RangeScan<'a> {
    tree: &'a BTree,
    entries: Vec<(Key, ValueRef)>,
    idx: usize,
    next_leaf: PageId,
    /// Exclusive upper bound.
    end: Option<Key>,
    done: bool,
}

impl BTree {
    /// Iterate key/value pairs in key order, from `start` (inclusive, or
    /// the smallest key) up to `end` (exclusive, or the end of the tree).
    pub fn scan(&self, start: Option<&Key>, end: Option<&Key>) -> Result<RangeScan<'_>> {
        let (leaf, idx) = match start {
            Some(key) => {
                let (leaf_page, _) = self.descend(key)?;
                let leaf = self.read_leaf(leaf_page)?;
                let idx = match leaf.search(key) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                (leaf, idx)
            }
            None => (self.read_leaf(self.first_leaf()?)?, 0),
        };
        Ok(RangeScan {
            tree: self,
            idx,
            next_leaf: leaf.next,
            entries: leaf.entries,
            end: end.copied(),
            done: false,
        })
    }
}

impl<'a> Iterator for RangeScan<'a> {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while self.idx >= self.entries.len() {
            if self.next_leaf == INVALID_PAGE_ID {
                self.done = true;
                return None;
            }
            match self.tree.read_leaf(self.next_leaf) {
                Ok(leaf) => {
                    self.entries = leaf.entries;
                    self.next_leaf = leaf.next;
                    self.idx = 0;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        let (key, value_ref) = &self.entries[self.idx];
        if let Some(end) = &self.end {
            if key >= end {
                self.done = true;
                return None;
            }
        }
        self.idx += 1;
        match self.tree.materialize(value_ref) {
            Ok(value) => Some(Ok((*key, value))),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
