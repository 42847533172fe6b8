//! Lookup, comparator search and leaf-item cursor motion.
//!
//! Interior descent picks the right-most key-pointer that is not yet past
//! the target: the comparator's positive ("target is after this key") results
//! are clamped to zero so the predicate over the sorted key-pointers stays
//! monotonic and binary-searchable. Leaves use a plain binary search.

use super::searcher::{Searcher, SIZE_UNKNOWN};
use super::{Path, PathElem, TreeView};
use crate::cancel::CancelToken;
use crate::format::{Item, Key, NodeBody};
use crate::node_source::{ByteReader, NodeExpectations, NodeGuard};
use crate::{Error, Result};

impl<'a, R: ByteReader> TreeView<'a, R> {
    /// Exact-match lookup. `ErrNoItem` when absent.
    pub fn lookup(&self, key: Key) -> Result<(Path, Item)> {
        self.search(&super::SearchExactKey(key))
    }

    /// Return the first leaf item matching `searcher`. With several matches
    /// in one leaf the left-most in that leaf wins, deterministically.
    pub fn search<S: Searcher + ?Sized>(&self, searcher: &S) -> Result<(Path, Item)> {
        if self.root().root_addr == 0 {
            return Err(Error::NoItem);
        }
        let mut path = Path::from_root(self.root());
        loop {
            let node = self.read_elem(path.last())?;
            match &node.body {
                NodeBody::Interior(kps) => {
                    // Right-most key-pointer whose clamped comparison is
                    // still >= 0, i.e. the highest key not past the target.
                    let pp = kps
                        .partition_point(|kp| searcher.search(&kp.key, SIZE_UNKNOWN).min(0) >= 0);
                    if pp == 0 {
                        return Err(Error::NoItem);
                    }
                    let slot = pp - 1;
                    let kp = kps[slot];
                    let to_max = if slot + 1 < kps.len() {
                        kps[slot + 1]
                            .key
                            .predecessor()
                            .expect("strictly ordered keys have predecessors")
                    } else {
                        path.last().max_key_bound()
                    };
                    let to_level = node.level() - 1;
                    path.push(PathElem::KeyPointer {
                        from_tree: self.root().id,
                        from_slot: slot,
                        to_addr: kp.block_ptr,
                        to_generation: kp.generation,
                        to_level,
                        to_min_key: kp.key,
                        to_max_key: to_max,
                    });
                }
                NodeBody::Leaf(items) => {
                    let pp = items.partition_point(|it| searcher.search(&it.key, it.body_size) > 0);
                    if pp < items.len() && searcher.search(&items[pp].key, items[pp].body_size) == 0
                    {
                        let item = items[pp].clone();
                        path.push(PathElem::Item {
                            from_tree: self.root().id,
                            from_slot: pp,
                            to_key: item.key,
                        });
                        return Ok((path, item));
                    }
                    return Err(Error::NoItem);
                }
            }
        }
    }

    /// Every leaf item matching `searcher`, in ascending key order, appended
    /// to `out`. On an iteration error the matches collected so far are
    /// still appended before the error is returned.
    pub fn search_all<S: Searcher + ?Sized>(
        &self,
        searcher: &S,
        cancel: &CancelToken,
        out: &mut Vec<(Path, Item)>,
    ) -> Result<()> {
        let first = match self.search(searcher) {
            Ok(hit) => hit,
            Err(Error::NoItem) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut before: Vec<(Path, Item)> = Vec::new();
        let mut after: Vec<(Path, Item)> = Vec::new();
        let res = (|| -> Result<()> {
            // The descent lands on the left-most match of one leaf, but
            // earlier leaves may hold matches too.
            let mut cur = first.0.clone();
            loop {
                cancel.check()?;
                match self.prev_item(&cur)? {
                    Some((path, item)) if searcher.search(&item.key, item.body_size) == 0 => {
                        cur = path.clone();
                        before.push((path, item));
                    }
                    _ => break,
                }
            }
            let mut cur = first.0.clone();
            loop {
                cancel.check()?;
                match self.next_item(&cur)? {
                    Some((path, item)) if searcher.search(&item.key, item.body_size) == 0 => {
                        cur = path.clone();
                        after.push((path, item));
                    }
                    _ => break,
                }
            }
            Ok(())
        })();
        out.extend(before.into_iter().rev());
        out.push(first);
        out.extend(after);
        res
    }

    /// Step the cursor to the next leaf item: up until a right sibling
    /// exists, then down the left-most path. `None` past the last item.
    pub fn next_item(&self, path: &Path) -> Result<Option<(Path, Item)>> {
        self.step(path, Direction::Forward)
    }

    /// Step the cursor to the previous leaf item.
    pub fn prev_item(&self, path: &Path) -> Result<Option<(Path, Item)>> {
        self.step(path, Direction::Backward)
    }

    fn step(&self, path: &Path, dir: Direction) -> Result<Option<(Path, Item)>> {
        let elems = path.elems();
        let Some(&PathElem::Item { from_slot, .. }) = elems.last() else {
            panic!("cursor motion requires a path ending at an item");
        };
        let mut node_elems = elems[..elems.len() - 1].to_vec();

        // Within the same leaf first.
        {
            let leaf = self.read_elem(node_elems.last().unwrap())?;
            let items = leaf.leaf().expect("item path elements hang off a leaf");
            let next = match dir {
                Direction::Forward if from_slot + 1 < items.len() => Some(from_slot + 1),
                Direction::Backward if from_slot > 0 => Some(from_slot - 1),
                _ => None,
            };
            if let Some(slot) = next {
                let item = items[slot].clone();
                let mut p = Path::from_elems(node_elems);
                p.push(PathElem::Item {
                    from_tree: self.root().id,
                    from_slot: slot,
                    to_key: item.key,
                });
                return Ok(Some((p, item)));
            }
        }

        // Climb until a sibling exists on the right side.
        while node_elems.len() > 1 {
            let Some(PathElem::KeyPointer { from_slot: kp_slot, .. }) = node_elems.pop() else {
                unreachable!("inner path elements are key pointers");
            };
            let parent = self.read_elem(node_elems.last().unwrap())?;
            let kps = parent.interior().expect("key pointer elements hang off interior nodes");
            let sibling = match dir {
                Direction::Forward if kp_slot + 1 < kps.len() => Some(kp_slot + 1),
                Direction::Backward if kp_slot > 0 => Some(kp_slot - 1),
                _ => None,
            };
            let Some(slot) = sibling else { continue };

            let parent_max = node_elems.last().unwrap().max_key_bound();
            let kp = kps[slot];
            let to_max = if slot + 1 < kps.len() {
                kps[slot + 1].key.predecessor().expect("ordered keys")
            } else {
                parent_max
            };
            let child_level = parent.level() - 1;
            node_elems.push(PathElem::KeyPointer {
                from_tree: self.root().id,
                from_slot: slot,
                to_addr: kp.block_ptr,
                to_generation: kp.generation,
                to_level: child_level,
                to_min_key: kp.key,
                to_max_key: to_max,
            });

            // Descend the edge nearest the cursor.
            loop {
                let node = self.read_elem(node_elems.last().unwrap())?;
                match &node.body {
                    NodeBody::Leaf(items) => {
                        let slot = match dir {
                            Direction::Forward => 0,
                            Direction::Backward => items.len() - 1,
                        };
                        let item = items[slot].clone();
                        let mut p = Path::from_elems(node_elems);
                        p.push(PathElem::Item {
                            from_tree: self.root().id,
                            from_slot: slot,
                            to_key: item.key,
                        });
                        return Ok(Some((p, item)));
                    }
                    NodeBody::Interior(kps) => {
                        let slot = match dir {
                            Direction::Forward => 0,
                            Direction::Backward => kps.len() - 1,
                        };
                        let parent_max = node_elems.last().unwrap().max_key_bound();
                        let kp = kps[slot];
                        let to_max = if slot + 1 < kps.len() {
                            kps[slot + 1].key.predecessor().expect("ordered keys")
                        } else {
                            parent_max
                        };
                        let to_level = node.level() - 1;
                        node_elems.push(PathElem::KeyPointer {
                            from_tree: self.root().id,
                            from_slot: slot,
                            to_addr: kp.block_ptr,
                            to_generation: kp.generation,
                            to_level,
                            to_min_key: kp.key,
                            to_max_key: to_max,
                        });
                    }
                }
            }
        }
        Ok(None)
    }

    /// Re-read the node a path element points at, under the constraints the
    /// element records.
    fn read_elem(&self, elem: &PathElem) -> Result<NodeGuard<'a>> {
        match *elem {
            PathElem::Root { to_addr, to_generation, to_level, .. } => self.source().node(
                to_addr,
                &NodeExpectations {
                    addr: Some(to_addr),
                    level: Some(to_level),
                    generation: Some(to_generation),
                    ..Default::default()
                },
            ),
            PathElem::KeyPointer {
                to_addr, to_generation, to_level, to_min_key, to_max_key, ..
            } => self.source().node(
                to_addr,
                &NodeExpectations {
                    addr: Some(to_addr),
                    level: Some(to_level),
                    generation: Some(to_generation),
                    min_item: Some(to_min_key),
                    max_item: Some(to_max_key),
                    ..Default::default()
                },
            ),
            PathElem::Item { .. } => unreachable!("items are not nodes"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}
