//! Depth-first traversal with callbacks, skip control and cancellation.
//!
//! Six callback points fire per node: `pre_node`, `node` (or `bad_node` when
//! the read fails), `pre_key_pointer`/`post_key_pointer` around each child
//! descent, `item` (or `bad_item`) per leaf item, and `post_node`. A callback
//! either continues, skips the subtree under the current boundary, or raises
//! an error; raised errors are wrapped with the active path and offered to
//! `handle_error`, which may consume them (the walk resumes at the nearest
//! sibling) or escalate. Cancellation is observed between every callback and
//! every descent.
//!
//! On a well-formed tree the walk visits items in ascending key order; on a
//! damaged one it visits whatever structural order remains.

use super::{Path, PathElem, TreeView};
use crate::cancel::CancelToken;
use crate::format::{Item, ItemBody, Key, KeyPointer, Node, NodeBody};
use crate::node_source::{ByteReader, NodeExpectations};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkCtl {
    Continue,
    /// Prune below the boundary the callback fired at. Consumed locally at
    /// item callbacks, which have nothing below them.
    SkipSubtree,
}

#[allow(unused_variables)]
pub trait WalkHandler {
    fn pre_node(&mut self, path: &Path) -> Result<WalkCtl> {
        Ok(WalkCtl::Continue)
    }

    fn node(&mut self, path: &Path, node: &Node) -> Result<WalkCtl> {
        Ok(WalkCtl::Continue)
    }

    /// A node that was pointed at failed to read. Returning a control value
    /// prunes the subtree; the default escalates the read error.
    fn bad_node(&mut self, path: &Path, err: Error) -> Result<WalkCtl> {
        Err(err)
    }

    fn pre_key_pointer(&mut self, path: &Path, kp: &KeyPointer) -> Result<WalkCtl> {
        Ok(WalkCtl::Continue)
    }

    fn post_key_pointer(&mut self, path: &Path, kp: &KeyPointer) -> Result<WalkCtl> {
        Ok(WalkCtl::Continue)
    }

    fn item(&mut self, path: &Path, item: &Item) -> Result<WalkCtl> {
        Ok(WalkCtl::Continue)
    }

    /// A leaf item whose body did not decode. The default raises it.
    fn bad_item(&mut self, path: &Path, key: Key, err: &str) -> Result<WalkCtl> {
        Err(Error::decode(
            path.node_addr().unwrap_or(0),
            format!("item {}: {}", key, err),
        ))
    }

    fn post_node(&mut self, path: &Path, node: &Node) -> Result<WalkCtl> {
        Ok(WalkCtl::Continue)
    }

    /// Judge a node's declared owner. Runs inside the node read, before the
    /// node is surfaced.
    fn check_owner(&self, owner: u64) -> Result<()> {
        Ok(())
    }

    /// Receives every error a callback raised, wrapped with the active path.
    /// `Ok(())` consumes it and the walk continues at the nearest sibling;
    /// the default escalates.
    fn handle_error(&mut self, err: Error) -> Result<()> {
        Err(err)
    }
}

/// Route a callback result through the error handler. A consumed error
/// becomes a skip at the callback's boundary.
fn consume<H: WalkHandler>(handler: &mut H, path: &Path, res: Result<WalkCtl>) -> Result<WalkCtl> {
    match res {
        Ok(ctl) => Ok(ctl),
        Err(err) => {
            handler.handle_error(err.at_path(path.to_string()))?;
            Ok(WalkCtl::SkipSubtree)
        }
    }
}

impl<R: ByteReader> TreeView<'_, R> {
    /// Walk the whole tree depth-first. A zero root address is an empty
    /// tree, not an error.
    pub fn walk<H: WalkHandler>(&self, cancel: &CancelToken, handler: &mut H) -> Result<()> {
        if self.root().root_addr == 0 {
            return Ok(());
        }
        let mut path = Path::from_root(self.root());
        self.walk_node(cancel, handler, &mut path)
    }

    fn walk_node<H: WalkHandler>(
        &self,
        cancel: &CancelToken,
        handler: &mut H,
        path: &mut Path,
    ) -> Result<()> {
        cancel.check()?;
        let res = handler.pre_node(path);
        if consume(handler, path, res)? == WalkCtl::SkipSubtree {
            return Ok(());
        }

        cancel.check()?;
        let read = {
            let owner_check = |owner: u64| handler.check_owner(owner);
            let (addr, level, generation, min_key) = match *path.last() {
                PathElem::Root { to_addr, to_level, to_generation, .. } => {
                    (to_addr, to_level, to_generation, None)
                }
                PathElem::KeyPointer {
                    to_addr, to_level, to_generation, to_min_key, ..
                } => (to_addr, to_level, to_generation, Some(to_min_key)),
                PathElem::Item { .. } => unreachable!("walk never descends into items"),
            };
            let exp = NodeExpectations {
                addr: Some(addr),
                level: Some(level),
                generation: Some(generation),
                owner: Some(&owner_check),
                min_item: min_key,
                max_item: Some(path.last().max_key_bound()),
            };
            self.source().node(addr, &exp)
        };
        let node = match read {
            Ok(node) => node,
            Err(err) => {
                let res = handler.bad_node(path, err);
                // Skip or continue: either way there is nothing to descend.
                consume(handler, path, res)?;
                return Ok(());
            }
        };

        let res = handler.node(path, &node);
        if consume(handler, path, res)? == WalkCtl::Continue {
            match &node.body {
                NodeBody::Interior(kps) => {
                    self.walk_children(cancel, handler, path, &node, kps)?;
                }
                NodeBody::Leaf(items) => {
                    for (slot, item) in items.iter().enumerate() {
                        cancel.check()?;
                        path.push(PathElem::Item {
                            from_tree: self.root().id,
                            from_slot: slot,
                            to_key: item.key,
                        });
                        let res = match &item.body {
                            ItemBody::Error { err } => handler.bad_item(path, item.key, err),
                            _ => handler.item(path, item),
                        };
                        let res = consume(handler, path, res);
                        path.pop();
                        res?;
                    }
                }
            }
        }

        cancel.check()?;
        let res = handler.post_node(path, &node);
        consume(handler, path, res)?;
        Ok(())
    }

    fn walk_children<H: WalkHandler>(
        &self,
        cancel: &CancelToken,
        handler: &mut H,
        path: &mut Path,
        node: &Node,
        kps: &[KeyPointer],
    ) -> Result<()> {
        let parent_max = path.last().max_key_bound();
        for (slot, kp) in kps.iter().enumerate() {
            cancel.check()?;
            let res = handler.pre_key_pointer(path, kp);
            if consume(handler, path, res)? == WalkCtl::Continue {
                let to_max = if slot + 1 < kps.len() {
                    kps[slot + 1]
                        .key
                        .predecessor()
                        .expect("strictly ordered keys have predecessors")
                } else {
                    parent_max
                };
                path.push(PathElem::KeyPointer {
                    from_tree: self.root().id,
                    from_slot: slot,
                    to_addr: kp.block_ptr,
                    to_generation: kp.generation,
                    to_level: node.level() - 1,
                    to_min_key: kp.key,
                    to_max_key: to_max,
                });
                let res = self.walk_node(cancel, handler, path);
                path.pop();
                res?;
            }
            cancel.check()?;
            let res = handler.post_key_pointer(path, kp);
            if consume(handler, path, res)? == WalkCtl::SkipSubtree {
                break;
            }
        }
        Ok(())
    }
}
