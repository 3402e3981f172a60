//! B+Tree handle: descent, point lookup, and the shared node/value I/O
//! helpers the insert and delete paths build on.
//!
//! The tree addresses nodes by page number and pins each page only for the
//! duration of one decode or encode. Mutations are single-writer; readers
//! on disjoint subtrees ride on the buffer pool's latching.

use std::sync::Arc;

use crate::alloc::PageAllocator;
use crate::buffer::BufferPool;
use crate::common::{INVALID_PAGE_ID, PageId};
use crate::error::{DbError, Result};
use crate::sync::LatchMode;

use super::key::Key;
use super::node::{InternalNode, LeafNode, Node, MAX_DEPTH};
use super::overflow::{chain_free, chain_read, chain_write, OverflowStore};
use super::value::{ValueRef, INLINE_MAX, NORMAL_MAX};

pub struct BTree {
    root: PageId,
    pub(super) pool: Arc<BufferPool>,
    pub(super) alloc: Arc<PageAllocator>,
    pub(super) overflow: Arc<OverflowStore>,
}

impl BTree {
    /// Create a tree whose root is a fresh empty leaf.
    pub fn create(
        pool: Arc<BufferPool>,
        alloc: Arc<PageAllocator>,
        overflow: Arc<OverflowStore>,
    ) -> Result<Self> {
        let root = alloc.alloc(0)?;
        let tree = Self {
            root,
            pool,
            alloc,
            overflow,
        };
        tree.write_node(root, &Node::Leaf(LeafNode::empty()))?;
        Ok(tree)
    }

    /// Create a tree on a caller-chosen root page. The page must already be
    /// allocated; it is overwritten with an empty leaf.
    pub fn create_at(
        pool: Arc<BufferPool>,
        alloc: Arc<PageAllocator>,
        overflow: Arc<OverflowStore>,
        root: PageId,
    ) -> Result<Self> {
        let tree = Self {
            root,
            pool,
            alloc,
            overflow,
        };
        tree.write_node(root, &Node::Leaf(LeafNode::empty()))?;
        Ok(tree)
    }

    /// Attach to an existing tree by its root page.
    pub fn open(
        pool: Arc<BufferPool>,
        alloc: Arc<PageAllocator>,
        overflow: Arc<OverflowStore>,
        root: PageId,
    ) -> Self {
        Self {
            root,
            pool,
            alloc,
            overflow,
        }
    }

    /// The root page number. Stable across splits and collapses; this is
    /// the tree's externally advertised identity.
    #[inline]
    pub fn root_page(&self) -> PageId {
        self.root
    }

    /// Point lookup.
    pub fn search(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let (leaf_page, _) = self.descend(key)?;
        let leaf = self.read_leaf(leaf_page)?;
        match leaf.search(key) {
            Ok(idx) => Ok(Some(self.materialize(&leaf.entries[idx].1)?)),
            Err(_) => Ok(None),
        }
    }

    /// Walk from the root to the leaf responsible for `key`, recording the
    /// internal pages passed along the way (root first).
    pub(super) fn descend(&self, key: &Key) -> Result<(PageId, Vec<PageId>)> {
        let mut path = Vec::new();
        let mut page = self.root;
        loop {
            match self.read_node(page)? {
                Node::Leaf(_) => return Ok((page, path)),
                Node::Internal(node) => {
                    if path.len() >= MAX_DEPTH {
                        return Err(DbError::CorruptedMetadata(
                            "descent exceeded the depth bound".into(),
                        ));
                    }
                    path.push(page);
                    page = node.child_for(key);
                    if page == INVALID_PAGE_ID {
                        return Err(DbError::CorruptedMetadata(
                            "internal node with invalid child".into(),
                        ));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // node I/O
    // ------------------------------------------------------------------

    pub(super) fn read_node(&self, page: PageId) -> Result<Node> {
        let guard = self.pool.fetch(page, LatchMode::Shared)?;
        Node::decode(guard.data())
    }

    pub(super) fn read_leaf(&self, page: PageId) -> Result<LeafNode> {
        match self.read_node(page)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(DbError::CorruptedMetadata(format!(
                "page {} is not a leaf",
                page
            ))),
        }
    }

    pub(super) fn read_internal(&self, page: PageId) -> Result<InternalNode> {
        match self.read_node(page)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(DbError::CorruptedMetadata(format!(
                "page {} is not an internal node",
                page
            ))),
        }
    }

    pub(super) fn write_node(&self, page: PageId, node: &Node) -> Result<()> {
        let mut guard = self.pool.fetch(page, LatchMode::Exclusive)?;
        node.encode(guard.data_mut());
        guard.mark_dirty();
        Ok(())
    }

    /// Rewrite a child's parent pointer.
    pub(super) fn set_parent(&self, child: PageId, parent: PageId) -> Result<()> {
        let mut node = self.read_node(child)?;
        node.set_parent(parent);
        self.write_node(child, &node)
    }

    /// Update the back link of the node after `page` on its level.
    pub(super) fn relink_prev(&self, page: PageId, new_prev: PageId) -> Result<()> {
        let mut node = self.read_node(page)?;
        match &mut node {
            Node::Leaf(n) => n.prev = new_prev,
            Node::Internal(n) => n.prev = new_prev,
        }
        self.write_node(page, &node)
    }

    // ------------------------------------------------------------------
    // value storage
    // ------------------------------------------------------------------

    /// Store `value` in its class-appropriate location and return the leaf
    /// descriptor. `hint` steers page allocation toward the leaf's group.
    pub(super) fn write_value(&self, value: &[u8]) -> Result<ValueRef> {
        if value.len() <= INLINE_MAX {
            Ok(ValueRef::inline(value))
        } else if value.len() <= NORMAL_MAX {
            let (page, slot) = self.overflow.write(value)?;
            Ok(ValueRef::Normal {
                page,
                slot,
                len: value.len() as u16,
            })
        } else {
            let first_page = chain_write(&self.pool, &self.alloc, value)?;
            Ok(ValueRef::Huge {
                first_page,
                total_len: value.len() as u64,
            })
        }
    }

    /// Release whatever external storage a descriptor points at.
    pub(super) fn free_value(&self, value: &ValueRef) -> Result<()> {
        match value {
            ValueRef::Inline { .. } => Ok(()),
            ValueRef::Normal { page, slot, .. } => self.overflow.free(*page, *slot),
            ValueRef::Huge {
                first_page,
                total_len,
            } => chain_free(&self.pool, &self.alloc, *first_page, *total_len),
        }
    }

    /// Copy a value out of its storage location.
    pub(super) fn materialize(&self, value: &ValueRef) -> Result<Vec<u8>> {
        match value {
            ValueRef::Inline { len, data } => Ok(data[..*len as usize].to_vec()),
            ValueRef::Normal { page, slot, len } => self.overflow.read(*page, *slot, *len),
            ValueRef::Huge {
                first_page,
                total_len,
            } => chain_read(&self.pool, *first_page, *total_len),
        }
    }

    /// Tear the tree down: release every value's external storage and every
    /// node page, root included.
    pub fn destroy(self) -> Result<()> {
        self.free_subtree(self.root)
    }

    fn free_subtree(&self, page: PageId) -> Result<()> {
        match self.read_node(page)? {
            Node::Leaf(leaf) => {
                for (_, value) in &leaf.entries {
                    self.free_value(value)?;
                }
            }
            Node::Internal(node) => {
                self.free_subtree(node.head)?;
                for (_, child) in &node.entries {
                    self.free_subtree(*child)?;
                }
            }
        }
        self.alloc.free(page)
    }

    // ------------------------------------------------------------------
    // traversal helpers for consistency checks
    // ------------------------------------------------------------------

    /// Leftmost leaf of the tree.
    pub fn first_leaf(&self) -> Result<PageId> {
        let mut page = self.root;
        let mut depth = 0;
        loop {
            match self.read_node(page)? {
                Node::Leaf(_) => return Ok(page),
                Node::Internal(node) => {
                    depth += 1;
                    if depth > MAX_DEPTH {
                        return Err(DbError::CorruptedMetadata(
                            "descent exceeded the depth bound".into(),
                        ));
                    }
                    page = node.head;
                }
            }
        }
    }

    /// All keys in leaf order, following the sibling chain.
    pub fn collect_keys(&self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        let mut page = self.first_leaf()?;
        while page != INVALID_PAGE_ID {
            let leaf = self.read_leaf(page)?;
            keys.extend(leaf.entries.iter().map(|e| e.0));
            page = leaf.next;
        }
        Ok(keys)
    }

    /// Number of levels, counting the root. 1 means the root is a leaf.
    pub fn height(&self) -> Result<usize> {
        let mut height = 1;
        let mut page = self.root;
        loop {
            match self.read_node(page)? {
                Node::Leaf(_) => return Ok(height),
                Node::Internal(node) => {
                    height += 1;
                    if height > MAX_DEPTH {
                        return Err(DbError::CorruptedMetadata(
                            "descent exceeded the depth bound".into(),
                        ));
                    }
                    page = node.head;
                }
            }
        }
    }

    /// The stored descriptor for `key`, without materializing the value.
    pub fn value_ref(&self, key: &Key) -> Result<Option<ValueRef>> {
        let (leaf_page, _) = self.descend(key)?;
        let leaf = self.read_leaf(leaf_page)?;
        match leaf.search(key) {
            Ok(idx) => Ok(Some(leaf.entries[idx].1.clone())),
            Err(_) => Ok(None),
        }
    }

    /// Structural self-check: entry bounds, key order, parent pointers, and
    /// subtree key ranges. Errors describe the first violation found.
    pub fn check_consistency(&self) -> Result<()> {
        self.check_subtree(self.root, INVALID_PAGE_ID, None, None, 0)?;

        // The leaf chain must be doubly linked and globally sorted.
        let mut page = self.first_leaf()?;
        let mut prev_page = INVALID_PAGE_ID;
        let mut last_key: Option<Key> = None;
        while page != INVALID_PAGE_ID {
            let leaf = self.read_leaf(page)?;
            if leaf.prev != prev_page {
                return Err(DbError::CorruptedMetadata(format!(
                    "leaf {} prev link {} != {}",
                    page, leaf.prev, prev_page
                )));
            }
            for (key, _) in &leaf.entries {
                if let Some(last) = last_key {
                    if *key <= last {
                        return Err(DbError::CorruptedMetadata(format!(
                            "leaf chain out of order at page {}",
                            page
                        )));
                    }
                }
                last_key = Some(*key);
            }
            prev_page = page;
            page = leaf.next;
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page: PageId,
        expected_parent: PageId,
        lower: Option<Key>,
        upper: Option<Key>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(DbError::CorruptedMetadata("tree too deep".into()));
        }
        let node = self.read_node(page)?;
        let is_root = page == self.root;

        if node.parent() != expected_parent {
            return Err(DbError::CorruptedMetadata(format!(
                "page {} parent {} != {}",
                page,
                node.parent(),
                expected_parent
            )));
        }
        if !is_root && (node.entry_count() < super::node::MIN_ENT) {
            return Err(DbError::CorruptedMetadata(format!(
                "page {} underfull with {} entries",
                page,
                node.entry_count()
            )));
        }

        let in_bounds = |key: &Key| {
            lower.map_or(true, |lo| *key >= lo) && upper.map_or(true, |hi| *key < hi)
        };
        match node {
            Node::Leaf(leaf) => {
                for w in leaf.entries.windows(2) {
                    if w[0].0 >= w[1].0 {
                        return Err(DbError::CorruptedMetadata(format!(
                            "leaf {} keys out of order",
                            page
                        )));
                    }
                }
                for (key, _) in &leaf.entries {
                    if !in_bounds(key) {
                        return Err(DbError::CorruptedMetadata(format!(
                            "leaf {} key outside its separator range",
                            page
                        )));
                    }
                }
            }
            Node::Internal(int) => {
                for w in int.entries.windows(2) {
                    if w[0].0 >= w[1].0 {
                        return Err(DbError::CorruptedMetadata(format!(
                            "internal {} keys out of order",
                            page
                        )));
                    }
                }
                for (key, _) in &int.entries {
                    if !in_bounds(key) {
                        return Err(DbError::CorruptedMetadata(format!(
                            "internal {} key outside its separator range",
                            page
                        )));
                    }
                }
                // head subtree: keys below the first entry key
                let first = int.entries.first().map(|e| e.0);
                self.check_subtree(int.head, page, lower, first.or(upper), depth + 1)?;
                for (i, (key, child)) in int.entries.iter().enumerate() {
                    let next = int.entries.get(i + 1).map(|e| e.0).or(upper);
                    self.check_subtree(*child, page, Some(*key), next, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}
