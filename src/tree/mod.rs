//! B+-tree access layer: path cursors, depth-first walks, exact and
//! comparator searches, and leaf-item iteration over a single tree.
//!
//! Everything operates through a [`NodeSource`], so each node read is
//! checksummed, validated against the expectations its parent imposes, and
//! pinned for exactly as long as the operation touches it. A tree here is
//! nothing but a root descriptor; the same view works for pristine trees and
//! for candidate roots the rebuild layer is still deciding about.

use crate::format::{RootItem, RootSlot};
use crate::node_source::{ByteReader, NodeSource};

mod path;
mod search;
mod searcher;
mod walk;

#[cfg(test)]
pub(crate) mod testutil;

pub use path::{Path, PathElem};
pub use searcher::{
    SearchCsum, SearchExactKey, SearchObject, SearchObjectType, SearchRootItem, Searcher,
    SIZE_UNKNOWN,
};
pub use walk::{WalkCtl, WalkHandler};

/// Root descriptor: everything needed to start reading a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub id: u64,
    pub root_addr: u64,
    pub level: u8,
    pub generation: u64,
}

impl TreeRoot {
    /// Root of a well-known tree, straight from the superblock.
    pub fn from_slot(slot: &RootSlot) -> TreeRoot {
        TreeRoot {
            id: slot.tree_id,
            root_addr: slot.addr,
            level: slot.level,
            generation: slot.generation,
        }
    }

    /// Root described by a ROOT_ITEM found in the root tree.
    pub fn from_root_item(id: u64, item: &RootItem) -> TreeRoot {
        TreeRoot {
            id,
            root_addr: item.byte_nr,
            level: item.level,
            generation: item.generation,
        }
    }
}

/// Read-only view of one tree through a node source.
pub struct TreeView<'a, R> {
    source: &'a NodeSource<R>,
    root: TreeRoot,
}

impl<'a, R: ByteReader> TreeView<'a, R> {
    pub fn new(source: &'a NodeSource<R>, root: TreeRoot) -> Self {
        TreeView { source, root }
    }

    pub fn root(&self) -> &TreeRoot {
        &self.root
    }

    pub(crate) fn source(&self) -> &'a NodeSource<R> {
        self.source
    }
}
