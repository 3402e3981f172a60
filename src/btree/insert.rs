//! Insert path: leaf insertion, leaf and internal splits, and root growth.
//!
//! Splits build a temporary buffer of `MAX_ENT + 1` entries in key order and
//! cut it at `(MAX_ENT + 1) / 2`; the promoted key is the right node's first
//! key (leaf) or the cut entry itself (internal). The root page number never
//! changes: growing the tree copies the old root aside and rewrites the root
//! page as a two-child internal node.

use crate::common::{INVALID_PAGE_ID, PageId};
use crate::error::Result;

use super::key::Key;
use super::node::{InternalNode, LeafNode, Node, MAX_ENT};
use super::tree::BTree;
use super::value::ValueRef;

impl BTree {
    /// Insert or replace. Replacement frees the previous value's external
    /// storage.
    pub fn insert(&self, key: &Key, value: &[u8]) -> Result<()> {
        let (leaf_page, mut path) = self.descend(key)?;
        let mut leaf = self.read_leaf(leaf_page)?;

        match leaf.search(key) {
            Ok(idx) => {
                let new_ref = self.write_value(value)?;
                let old_ref = std::mem::replace(&mut leaf.entries[idx].1, new_ref);
                self.write_node(leaf_page, &Node::Leaf(leaf))?;
                self.free_value(&old_ref)?;
                Ok(())
            }
            Err(slot) => {
                let new_ref = self.write_value(value)?;
                if leaf.entries.len() < MAX_ENT {
                    leaf.entries.insert(slot, (*key, new_ref));
                    self.write_node(leaf_page, &Node::Leaf(leaf))?;
                    return Ok(());
                }
                self.split_leaf(leaf_page, leaf, slot, *key, new_ref, &mut path)
            }
        }
    }

    fn split_leaf(
        &self,
        left_page: PageId,
        leaf: LeafNode,
        slot: usize,
        key: Key,
        value: ValueRef,
        path: &mut Vec<PageId>,
    ) -> Result<()> {
        // MAX_ENT + 1 entries in key order.
        let mut temp = leaf.entries;
        temp.insert(slot, (key, value));

        let right_page = match self.alloc.alloc(left_page) {
            Ok(page) => page,
            Err(e) => {
                // The leaf is untouched; only the staged value must go.
                self.free_value(&temp[slot].1)?;
                return Err(e);
            }
        };

        let split = (MAX_ENT + 1) / 2;
        let right_entries = temp.split_off(split);
        let promoted = right_entries[0].0;
        let old_next = leaf.next;

        let right = LeafNode {
            parent: leaf.parent,
            prev: left_page,
            next: old_next,
            entries: right_entries,
        };
        self.write_node(right_page, &Node::Leaf(right))?;

        let left = LeafNode {
            parent: leaf.parent,
            prev: leaf.prev,
            next: right_page,
            entries: temp,
        };
        self.write_node(left_page, &Node::Leaf(left))?;

        if old_next != INVALID_PAGE_ID {
            self.relink_prev(old_next, right_page)?;
        }

        self.insert_into_parent(left_page, promoted, right_page, path)
    }

    /// Hang `(key, right_page)` off the parent of `left_page`, splitting
    /// upward as needed.
    fn insert_into_parent(
        &self,
        left_page: PageId,
        key: Key,
        right_page: PageId,
        path: &mut Vec<PageId>,
    ) -> Result<()> {
        let parent_page = match path.pop() {
            Some(page) => page,
            None => return self.grow_root(left_page, key, right_page),
        };

        let mut parent = self.read_internal(parent_page)?;
        let slot = match parent.entries.binary_search_by(|e| e.0.cmp(&key)) {
            Ok(i) => i,
            Err(i) => i,
        };

        if parent.entries.len() < MAX_ENT {
            parent.entries.insert(slot, (key, right_page));
            return self.write_node(parent_page, &Node::Internal(parent));
        }

        // Internal split: the cut entry moves up, its child becomes the new
        // right node's head.
        let mut temp = parent.entries;
        temp.insert(slot, (key, right_page));

        let new_right_page = self.alloc.alloc(parent_page)?;
        let split = (MAX_ENT + 1) / 2;
        let mut right_entries = temp.split_off(split);
        let (promoted_key, promoted_child) = right_entries.remove(0);
        let old_next = parent.next;

        let right = InternalNode {
            parent: parent.parent,
            prev: parent_page,
            next: old_next,
            head: promoted_child,
            entries: right_entries,
        };
        self.write_node(new_right_page, &Node::Internal(right.clone()))?;

        self.set_parent(right.head, new_right_page)?;
        for (_, child) in &right.entries {
            self.set_parent(*child, new_right_page)?;
        }

        let left = InternalNode {
            parent: parent.parent,
            prev: parent.prev,
            next: new_right_page,
            head: parent.head,
            entries: temp,
        };
        self.write_node(parent_page, &Node::Internal(left))?;

        if old_next != INVALID_PAGE_ID {
            self.relink_prev(old_next, new_right_page)?;
        }

        self.insert_into_parent(parent_page, promoted_key, new_right_page, path)
    }

    /// A split propagated past the root. Copy the root's current content to
    /// a fresh page and turn the root page into an internal node with two
    /// children, keeping the root page number stable.
    fn grow_root(&self, root_page: PageId, key: Key, right_page: PageId) -> Result<()> {
        debug_assert_eq!(root_page, self.root_page());

        let copy_page = self.alloc.alloc(root_page)?;
        let mut moved = self.read_node(root_page)?;
        match &mut moved {
            Node::Leaf(n) => {
                n.parent = root_page;
                n.prev = INVALID_PAGE_ID;
                n.next = right_page;
            }
            Node::Internal(n) => {
                n.parent = root_page;
                n.prev = INVALID_PAGE_ID;
                n.next = right_page;
            }
        }
        self.write_node(copy_page, &moved)?;

        // Children of the copied node now live under the copy.
        if let Node::Internal(n) = &moved {
            self.set_parent(n.head, copy_page)?;
            for (_, child) in &n.entries {
                self.set_parent(*child, copy_page)?;
            }
        }

        // The new right sibling was created pointing at the old root.
        {
            let mut right = self.read_node(right_page)?;
            match &mut right {
                Node::Leaf(n) => {
                    n.parent = root_page;
                    n.prev = copy_page;
                }
                Node::Internal(n) => {
                    n.parent = root_page;
                    n.prev = copy_page;
                }
            }
            self.write_node(right_page, &right)?;
        }

        let new_root = InternalNode {
            parent: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            head: copy_page,
            entries: vec![(key, right_page)],
        };
        self.write_node(root_page, &Node::Internal(new_root))
    }
}
