//! Paths: how a cursor remembers where it is in a tree.
//!
//! A path starts at a root element and alternates downward through
//! key-pointer elements, optionally ending at an item element. Each non-root
//! element carries the constraint its parent imposes on the child, which is
//! exactly what the node source needs to re-read the node later.

use std::fmt;

use super::TreeRoot;
use crate::format::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathElem {
    /// The first element of every path.
    Root {
        tree_id: u64,
        to_addr: u64,
        to_generation: u64,
        to_level: u8,
    },
    /// Descent through slot `from_slot` of an interior node.
    KeyPointer {
        from_tree: u64,
        from_slot: usize,
        to_addr: u64,
        to_generation: u64,
        to_level: u8,
        /// The key-pointer's own key: no key in the child may be below it.
        to_min_key: Key,
        /// Predecessor of the next sibling's key, or the parent's bound.
        to_max_key: Key,
    },
    /// Terminal element naming one leaf item.
    Item {
        from_tree: u64,
        from_slot: usize,
        to_key: Key,
    },
}

impl PathElem {
    /// Address of the node this element points at; `None` for items.
    pub fn node_addr(&self) -> Option<u64> {
        match self {
            PathElem::Root { to_addr, .. } | PathElem::KeyPointer { to_addr, .. } => Some(*to_addr),
            PathElem::Item { .. } => None,
        }
    }

    /// Upper key bound the pointed-at node must respect.
    pub(crate) fn max_key_bound(&self) -> Key {
        match self {
            PathElem::Root { .. } => Key::MAX,
            PathElem::KeyPointer { to_max_key, .. } => *to_max_key,
            PathElem::Item { .. } => unreachable!("items impose no bound"),
        }
    }
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElem::Root { tree_id, to_addr, to_generation, to_level } => {
                write!(f, "tree={}@{:#x}(lvl {} gen {})", tree_id, to_addr, to_level, to_generation)
            }
            PathElem::KeyPointer { from_slot, to_addr, to_level, .. } => {
                write!(f, "kp[{}]->{:#x}(lvl {})", from_slot, to_addr, to_level)
            }
            PathElem::Item { from_slot, to_key, .. } => {
                write!(f, "item[{}]{}", from_slot, to_key)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    elems: Vec<PathElem>,
}

impl Path {
    pub fn from_root(root: &TreeRoot) -> Path {
        Path {
            elems: vec![PathElem::Root {
                tree_id: root.id,
                to_addr: root.root_addr,
                to_generation: root.generation,
                to_level: root.level,
            }],
        }
    }

    pub(crate) fn from_elems(elems: Vec<PathElem>) -> Path {
        debug_assert!(matches!(elems.first(), Some(PathElem::Root { .. })));
        Path { elems }
    }

    pub fn elems(&self) -> &[PathElem] {
        &self.elems
    }

    pub fn last(&self) -> &PathElem {
        self.elems.last().expect("a path is never empty")
    }

    pub fn push(&mut self, elem: PathElem) {
        debug_assert!(
            !matches!(self.last(), PathElem::Item { .. }),
            "item elements are terminal"
        );
        self.elems.push(elem);
    }

    pub fn pop(&mut self) -> Option<PathElem> {
        if self.elems.len() > 1 {
            self.elems.pop()
        } else {
            None
        }
    }

    /// Address of the innermost node on the path.
    pub fn node_addr(&self) -> Option<u64> {
        self.elems.iter().rev().find_map(|e| e.node_addr())
    }

    /// Slot of the terminal item element, if the path ends at one.
    pub fn item_slot(&self) -> Option<usize> {
        match self.last() {
            PathElem::Item { from_slot, .. } => Some(*from_slot),
            _ => None,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, elem) in self.elems.iter().enumerate() {
            if i > 0 {
                write!(f, " / ")?;
            }
            write!(f, "{}", elem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ItemType;

    fn root() -> TreeRoot {
        TreeRoot { id: 5, root_addr: 0x10000, level: 1, generation: 7 }
    }

    #[test]
    fn push_pop_and_addresses() {
        let mut p = Path::from_root(&root());
        assert_eq!(p.node_addr(), Some(0x10000));

        p.push(PathElem::KeyPointer {
            from_tree: 5,
            from_slot: 1,
            to_addr: 0x20000,
            to_generation: 7,
            to_level: 0,
            to_min_key: Key::new(3, ItemType(0x77), 0),
            to_max_key: Key::MAX,
        });
        assert_eq!(p.node_addr(), Some(0x20000));

        p.push(PathElem::Item {
            from_tree: 5,
            from_slot: 0,
            to_key: Key::new(3, ItemType(0x77), 0),
        });
        assert_eq!(p.item_slot(), Some(0));
        assert_eq!(p.node_addr(), Some(0x20000));

        assert!(p.pop().is_some());
        assert!(p.pop().is_some());
        assert!(p.pop().is_none(), "the root element stays");
        assert_eq!(p.node_addr(), Some(0x10000));
    }

    #[test]
    fn display_is_compact() {
        let mut p = Path::from_root(&root());
        p.push(PathElem::Item { from_tree: 5, from_slot: 2, to_key: Key::new(1, ItemType(0x77), 9) });
        let s = p.to_string();
        assert!(s.contains("tree=5"), "{s}");
        assert!(s.contains("item[2]"), "{s}");
    }
}
