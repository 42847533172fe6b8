//! The rebuilt forest: lazy tree initialization with parent-UUID
//! resolution, plus the bounded caches of the three per-tree indexes.
//!
//! Initialization may reenter `tree()` through the injected callbacks, so
//! the in-progress stack travels as an explicit parameter and no lock is
//! ever held across a callback. Failed initializations are remembered as
//! negative entries; growing the root or UUID tree clears them, because new
//! items may now resolve what previously failed.

use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use log::debug;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::tree::{AncestorChain, ChainLink, ItemIndex, ItemPtr, LeafIndex, RebuiltTree};
use super::IndexedItem;
use crate::cache::AdaptiveCache;
use crate::config::SalvageConfiguration;
use crate::format::{Item, Key, RootItem, Uuid, ROOT_TREE, UUID_TREE};
use crate::graph::Graph;
use crate::node_source::{ByteReader, NodeExpectations, NodeSource};
use crate::tree::Searcher;
use crate::{Error, Result};

/// Injected hooks the forest needs from its driver. Callbacks may reenter
/// [`RebuiltForest::tree`]; implementations must not assume otherwise.
pub trait ForestCallbacks<R: ByteReader>: Send + Sync {
    /// A key newly became part of a tree's included items.
    fn added_item(&self, tree_id: u64, key: Key);

    /// Resolve the ROOT_ITEM for a tree through the (rebuilt) root tree.
    /// Returns the item's key offset alongside the body; the offset is the
    /// snapshot cutoff toward the parent.
    fn lookup_root(&self, forest: &RebuiltForest<R>, tree_id: u64) -> Option<(u64, RootItem)>;

    /// Resolve a parent UUID to a tree id through the (rebuilt) UUID tree.
    fn lookup_uuid(&self, forest: &RebuiltForest<R>, uuid: &Uuid) -> Option<u64>;
}

pub struct RebuiltForest<R> {
    source: Arc<NodeSource<R>>,
    graph: Arc<Graph>,
    callbacks: Arc<dyn ForestCallbacks<R>>,
    /// `None` marks a failed initialization.
    trees: Mutex<FxHashMap<u64, Option<Arc<RwLock<RebuiltTree>>>>>,
    leaf_indexes: AdaptiveCache<u64, LeafIndex>,
    item_indexes: AdaptiveCache<u64, ItemIndex>,
    potential_indexes: AdaptiveCache<u64, ItemIndex>,
}

impl<R: ByteReader> RebuiltForest<R> {
    pub fn new(
        source: Arc<NodeSource<R>>,
        graph: Arc<Graph>,
        config: &SalvageConfiguration,
        callbacks: Arc<dyn ForestCallbacks<R>>,
    ) -> RebuiltForest<R> {
        let cap = config.tree_index_cache_capacity;
        RebuiltForest {
            source,
            graph,
            callbacks,
            trees: Mutex::new(FxHashMap::default()),
            leaf_indexes: AdaptiveCache::new(cap),
            item_indexes: AdaptiveCache::new(cap),
            potential_indexes: AdaptiveCache::new(cap),
        }
    }

    pub fn source(&self) -> &NodeSource<R> {
        &self.source
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The rebuilt tree for `id`, initializing it on first use. Failed
    /// initializations are cached and resurface as `ErrNoTree` until the
    /// root or UUID tree grows.
    pub fn tree(&self, id: u64) -> Result<Arc<RwLock<RebuiltTree>>> {
        self.tree_with_stack(id, &mut Vec::new())
    }

    fn tree_with_stack(
        &self,
        id: u64,
        stack: &mut Vec<u64>,
    ) -> Result<Arc<RwLock<RebuiltTree>>> {
        if let Some(entry) = self.trees.lock().get(&id) {
            return entry.clone().ok_or(Error::NoTree(id));
        }
        if stack.contains(&id) {
            debug!("forest: initialization cycle through tree {}", id);
            self.trees.lock().insert(id, None);
            return Err(Error::NoTree(id));
        }

        stack.push(id);
        let outcome = self.init_tree(id, stack);
        stack.pop();

        match outcome {
            Ok((tree, root_addr)) => {
                // Store-once: a racing initializer wins if it got there first.
                let tree = {
                    let mut trees = self.trees.lock();
                    match trees.entry(id) {
                        std::collections::hash_map::Entry::Occupied(e) => match e.get() {
                            Some(existing) => return Ok(existing.clone()),
                            None => return Err(Error::NoTree(id)),
                        },
                        std::collections::hash_map::Entry::Vacant(v) => {
                            v.insert(Some(tree.clone()));
                            tree
                        }
                    }
                };
                self.add_root(id, root_addr)?;
                Ok(tree)
            }
            Err(err) => {
                debug!("forest: tree {} failed to initialize: {}", id, err);
                self.trees.lock().entry(id).or_insert(None);
                Err(err)
            }
        }
    }

    fn init_tree(
        &self,
        id: u64,
        stack: &mut Vec<u64>,
    ) -> Result<(Arc<RwLock<RebuiltTree>>, u64)> {
        if let Some(slot) = self
            .source
            .superblock()
            .root_slots()
            .iter()
            .find(|slot| slot.tree_id == id)
        {
            let tree = Arc::new(RwLock::new(RebuiltTree::new(id, None, None, 0)));
            return Ok((tree, slot.addr));
        }

        self.tree_with_stack(ROOT_TREE, stack)?;
        let Some((offset, root_item)) = self.callbacks.lookup_root(self, id) else {
            return Err(Error::NoTree(id));
        };

        let mut parent = None;
        let mut parent_generation = 0;
        if root_item.parent_uuid != [0u8; 16] {
            self.tree_with_stack(UUID_TREE, stack)?;
            let Some(parent_id) = self.callbacks.lookup_uuid(self, &root_item.parent_uuid) else {
                debug!("forest: tree {}: parent uuid does not resolve", id);
                return Err(Error::NoTree(id));
            };
            self.tree_with_stack(parent_id, stack)?;
            parent = Some(parent_id);
            parent_generation = offset;
        }

        let uuid = (root_item.uuid != [0u8; 16]).then_some(root_item.uuid);
        let tree = Arc::new(RwLock::new(RebuiltTree::new(id, uuid, parent, parent_generation)));
        Ok((tree, root_item.byte_nr))
    }

    fn existing_tree(&self, id: u64) -> Result<Arc<RwLock<RebuiltTree>>> {
        self.trees
            .lock()
            .get(&id)
            .cloned()
            .flatten()
            .ok_or(Error::NoTree(id))
    }

    /// Snapshot the parent lineage of an initialized tree.
    pub(crate) fn chain(&self, tree_id: u64) -> Result<AncestorChain> {
        let mut links = Vec::new();
        let mut cur = Some(tree_id);
        while let Some(id) = cur {
            let tree = self.existing_tree(id)?;
            let tree = tree.read();
            links.push(ChainLink {
                id,
                has_parent: tree.parent.is_some(),
                parent_generation: tree.parent_generation,
            });
            cur = tree.parent;
        }
        Ok(AncestorChain::new(links))
    }

    /// Accept `addr` as a root of the tree. Idempotent; monotonic in the
    /// root set. Fires `added_item` for every key the acceptance includes.
    pub fn add_root(&self, tree_id: u64, addr: u64) -> Result<()> {
        let tree = self.existing_tree(tree_id)?;
        if addr == 0 || tree.read().roots.contains(&addr) {
            return Ok(());
        }
        debug!("forest: tree {} accepts root {:#x}", tree_id, addr);

        let old_keys: Vec<Key> = self.with_items(tree_id, |ix| ix.keys().collect())?;

        tree.write().roots.insert(addr);
        self.item_indexes.delete(&tree_id);
        self.potential_indexes.delete(&tree_id);
        if tree_id == ROOT_TREE || tree_id == UUID_TREE {
            // New root or uuid items may resolve previously failed trees.
            self.trees.lock().retain(|_, entry| entry.is_some());
        }

        let new_keys: Vec<Key> = self.with_items(tree_id, |ix| ix.keys().collect())?;
        // Both snapshots are key-sorted; everything only on the new side
        // just became included.
        for pair in new_keys.iter().merge_join_by(old_keys.iter(), |a, b| a.cmp(b)) {
            if let EitherOrBoth::Left(key) = pair {
                self.callbacks.added_item(tree_id, *key);
            }
        }
        Ok(())
    }

    /// Run `f` against the tree's leaf-to-roots index.
    pub fn with_leaf_index<T>(
        &self,
        tree_id: u64,
        f: impl FnOnce(&LeafIndex) -> T,
    ) -> Result<T> {
        let guard = self.leaf_indexes.acquire(tree_id, || {
            let chain = self.chain(tree_id)?;
            Ok(LeafIndex::build(&self.graph, &chain))
        })?;
        Ok(f(&guard))
    }

    /// Run `f` against the tree's included-items index.
    pub fn with_items<T>(&self, tree_id: u64, f: impl FnOnce(&ItemIndex) -> T) -> Result<T> {
        let guard = self
            .item_indexes
            .acquire(tree_id, || self.build_item_index(tree_id, true))?;
        Ok(f(&guard))
    }

    /// Run `f` against the tree's potential-items index.
    pub fn with_potential_items<T>(
        &self,
        tree_id: u64,
        f: impl FnOnce(&ItemIndex) -> T,
    ) -> Result<T> {
        let guard = self
            .potential_indexes
            .acquire(tree_id, || self.build_item_index(tree_id, false))?;
        Ok(f(&guard))
    }

    fn build_item_index(&self, tree_id: u64, included: bool) -> Result<ItemIndex> {
        let chain = self.chain(tree_id)?;
        let tree = self.existing_tree(tree_id)?;
        let accepted = tree.read().roots.clone();
        self.with_leaf_index(tree_id, |leaf_index| {
            ItemIndex::build(&self.graph, &chain, leaf_index, &accepted, included)
        })?
    }

    /// Candidate roots that reach `leaf` and are not yet accepted.
    pub fn leaf_to_roots(&self, tree_id: u64, leaf: u64) -> Result<Vec<u64>> {
        let tree = self.existing_tree(tree_id)?;
        let accepted = tree.read().roots.clone();
        self.with_leaf_index(tree_id, |ix| {
            ix.roots_for(leaf)
                .map(|roots| roots.iter().copied().filter(|r| !accepted.contains(r)).collect())
                .unwrap_or_default()
        })
    }

    /// Exact-key read of an included item's full body.
    pub fn read_item(&self, tree_id: u64, key: Key) -> Result<Item> {
        let ptr = self
            .with_items(tree_id, |ix| ix.get(&key).map(|e| e.ptr))?
            .ok_or(Error::NoItem)?;
        let item = self.read_item_at(ptr)?;
        if item.key != key {
            return Err(Error::decode(
                ptr.leaf,
                format!("leaf changed under the index: wanted {}, found {}", key, item.key),
            ));
        }
        Ok(item)
    }

    /// Read an item body straight out of a leaf, included or not.
    pub fn read_item_at(&self, ptr: ItemPtr) -> Result<Item> {
        let generation = self.graph.node(ptr.leaf).map(|n| n.generation);
        let exp = NodeExpectations {
            addr: Some(ptr.leaf),
            level: Some(0),
            generation,
            ..Default::default()
        };
        let node = self.source.node(ptr.leaf, &exp)?;
        let items = node.leaf().expect("level-0 expectation held");
        items
            .get(ptr.slot)
            .cloned()
            .ok_or_else(|| Error::decode(ptr.leaf, format!("slot {} out of range", ptr.slot)))
    }

    /// First included item matching the searcher.
    pub fn search(&self, tree_id: u64, searcher: &dyn Searcher) -> Result<IndexedItem> {
        self.with_items(tree_id, |ix| ix.search(searcher).copied())?
            .ok_or(Error::NoItem)
    }

    /// Every included item matching the searcher, in key order.
    pub fn search_all(&self, tree_id: u64, searcher: &dyn Searcher) -> Result<Vec<IndexedItem>> {
        self.with_items(tree_id, |ix| ix.search_all(searcher).to_vec())
    }

    /// (COW distance of the leaf's owner, leaf generation), for ranking
    /// augment candidates.
    pub fn candidate_rank(&self, tree_id: u64, leaf: u64) -> Result<(usize, u64)> {
        let chain = self.chain(tree_id)?;
        let node = self
            .graph
            .node(leaf)
            .ok_or_else(|| Error::decode(leaf, "candidate leaf is not in the graph"))?;
        let dist = chain.cow_distance(node.owner).unwrap_or(usize::MAX);
        Ok((dist, node.generation))
    }
}
