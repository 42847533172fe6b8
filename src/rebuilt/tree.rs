//! Per-tree state and the indexes derived from the node graph.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexSet;
use rustc_hash::FxHashMap;

use crate::format::{ItemType, Key, Uuid};
use crate::graph::Graph;
use crate::tree::Searcher;
use crate::{Error, Result};

/// One rebuilt tree. Derived maps live in the forest's caches, keyed by
/// `id`; the parent link is an id, not a pointer, so trees need no shared
/// ownership of each other.
#[derive(Debug)]
pub struct RebuiltTree {
    pub id: u64,
    pub uuid: Option<Uuid>,
    /// Parent tree this one was snapshotted from.
    pub parent: Option<u64>,
    /// Snapshot cutoff: nodes older than this generation may be shared with
    /// the parent.
    pub parent_generation: u64,
    pub(crate) roots: IndexSet<u64>,
}

impl RebuiltTree {
    pub(crate) fn new(
        id: u64,
        uuid: Option<Uuid>,
        parent: Option<u64>,
        parent_generation: u64,
    ) -> RebuiltTree {
        RebuiltTree { id, uuid, parent, parent_generation, roots: IndexSet::new() }
    }

    /// Candidate roots accepted so far.
    pub fn roots(&self) -> &IndexSet<u64> {
        &self.roots
    }
}

/// Immutable snapshot of a tree's parent lineage, taken once per index
/// build so legality checks need no further tree lookups.
#[derive(Debug, Clone)]
pub(crate) struct AncestorChain {
    links: Vec<ChainLink>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChainLink {
    pub id: u64,
    pub has_parent: bool,
    pub parent_generation: u64,
}

impl AncestorChain {
    pub(crate) fn new(links: Vec<ChainLink>) -> AncestorChain {
        debug_assert!(!links.is_empty());
        AncestorChain { links }
    }

    pub(crate) fn tree_id(&self) -> u64 {
        self.links[0].id
    }

    /// A node declared as owned by `owner` at `generation` is legal for this
    /// tree iff `owner` appears somewhere on the chain and every parent link
    /// walked to reach it predates that link's snapshot cutoff.
    pub(crate) fn is_legal(&self, owner: u64, generation: u64) -> bool {
        for link in &self.links {
            if link.id == owner {
                return true;
            }
            if !link.has_parent || generation >= link.parent_generation {
                return false;
            }
        }
        false
    }

    /// Parent-link hops from the tree to `owner`; `None` when `owner` is not
    /// an ancestor.
    pub(crate) fn cow_distance(&self, owner: u64) -> Option<usize> {
        self.links.iter().position(|l| l.id == owner)
    }
}

/// Leaf-to-roots index: every leaf in the image that is legal for one tree,
/// mapped to the candidate roots that reach it through legal key-pointer
/// edges. A legal node with no legal parent is its own root.
#[derive(Debug)]
pub struct LeafIndex {
    leaf_roots: FxHashMap<u64, Arc<IndexSet<u64>>>,
}

impl LeafIndex {
    pub(crate) fn build(graph: &Graph, chain: &AncestorChain) -> LeafIndex {
        let mut memo: FxHashMap<u64, Arc<IndexSet<u64>>> = FxHashMap::default();
        let mut leaf_roots = FxHashMap::default();
        for node in graph.all_nodes() {
            if node.level != 0 || !chain.is_legal(node.owner, node.generation) {
                continue;
            }
            leaf_roots.insert(node.addr, roots_of(graph, chain, node.addr, &mut memo));
        }
        LeafIndex { leaf_roots }
    }

    pub fn roots_for(&self, leaf: u64) -> Option<&IndexSet<u64>> {
        self.leaf_roots.get(&leaf).map(|arc| arc.as_ref())
    }

    pub fn leaves(&self) -> impl Iterator<Item = (u64, &IndexSet<u64>)> {
        self.leaf_roots.iter().map(|(addr, roots)| (*addr, roots.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.leaf_roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_roots.is_empty()
    }
}

/// Memoized reverse reachability: the set of graph sources that reach
/// `addr` through edges whose origin node is legal for the chain's tree.
/// Bounded by tree height, since key-pointer edges strictly descend levels.
fn roots_of(
    graph: &Graph,
    chain: &AncestorChain,
    addr: u64,
    memo: &mut FxHashMap<u64, Arc<IndexSet<u64>>>,
) -> Arc<IndexSet<u64>> {
    if let Some(cached) = memo.get(&addr) {
        return cached.clone();
    }
    let mut roots = IndexSet::new();
    let mut has_parent = false;
    for edge in graph.edges_to(addr) {
        if !edge.is_key_pointer() {
            continue;
        }
        let Some(parent) = graph.node(edge.from_addr()) else { continue };
        if !chain.is_legal(parent.owner, parent.generation) {
            continue;
        }
        has_parent = true;
        roots.extend(roots_of(graph, chain, parent.addr, memo).iter().copied());
    }
    if !has_parent {
        roots.insert(addr);
    }
    let roots = Arc::new(roots);
    memo.insert(addr, roots.clone());
    roots
}

/// Location of one item: leaf address plus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPtr {
    pub leaf: u64,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedItem {
    pub key: Key,
    pub ptr: ItemPtr,
    /// Body size as stored in the leaf.
    pub size: u32,
}

/// Sorted key → item-location map for one tree; either the included items
/// (reachable from accepted roots) or the potential ones (reachable only
/// from candidates not yet accepted).
#[derive(Debug)]
pub struct ItemIndex {
    entries: Vec<IndexedItem>,
}

impl ItemIndex {
    /// Build from the leaf index by keeping leaves whose candidate-root set
    /// does (`included`) or does not intersect the accepted roots. Key
    /// collisions across leaves resolve to the lower COW distance, then the
    /// higher generation; an exact tie means the image carries two
    /// irreconcilable versions of the tree and is surfaced as an error.
    pub(crate) fn build(
        graph: &Graph,
        chain: &AncestorChain,
        leaf_index: &LeafIndex,
        accepted: &IndexSet<u64>,
        included: bool,
    ) -> Result<ItemIndex> {
        let mut map: BTreeMap<Key, IndexedItem> = BTreeMap::new();
        for (leaf_addr, leaf_roots) in leaf_index.leaves() {
            let reaches = leaf_roots.iter().any(|r| accepted.contains(r));
            if reaches != included {
                continue;
            }
            let node = graph.node(leaf_addr).expect("indexed leaf is in the graph");
            for (slot, &(key, size)) in node.items.iter().enumerate() {
                let cand = IndexedItem { key, ptr: ItemPtr { leaf: leaf_addr, slot }, size };
                match map.entry(key) {
                    Entry::Vacant(v) => {
                        v.insert(cand);
                    }
                    Entry::Occupied(mut o) => {
                        if should_replace(graph, chain, o.get(), &cand)? {
                            o.insert(cand);
                        }
                    }
                }
            }
        }
        Ok(ItemIndex { entries: map.into_values().collect() })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedItem> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.entries.iter().map(|e| e.key)
    }

    pub fn get(&self, key: &Key) -> Option<&IndexedItem> {
        self.entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// First (lowest-keyed) entry the searcher matches.
    pub fn search<S: Searcher + ?Sized>(&self, searcher: &S) -> Option<&IndexedItem> {
        let pp = self.entries.partition_point(|e| searcher.search(&e.key, e.size) > 0);
        match self.entries.get(pp) {
            Some(e) if searcher.search(&e.key, e.size) == 0 => Some(e),
            _ => None,
        }
    }

    /// The contiguous run of entries the searcher matches, in key order.
    pub fn search_all<S: Searcher + ?Sized>(&self, searcher: &S) -> &[IndexedItem] {
        let lo = self.entries.partition_point(|e| searcher.search(&e.key, e.size) > 0);
        let mut hi = lo;
        while hi < self.entries.len() && searcher.search(&self.entries[hi].key, self.entries[hi].size) == 0 {
            hi += 1;
        }
        &self.entries[lo..hi]
    }

    /// Offset runs covered by `(object_id, item_type)` entries intersecting
    /// `[beg, end)`, with `run_len` mapping a body size to covered bytes.
    /// Runs come back clamped to the window, in ascending order.
    pub(crate) fn covered_runs(
        &self,
        object_id: u64,
        item_type: ItemType,
        beg: u64,
        end: u64,
        run_len: &dyn Fn(u32) -> u64,
    ) -> Vec<(u64, u64)> {
        let lo = Key::new(object_id, item_type, 0);
        let mut i = self.entries.partition_point(|e| e.key < lo);
        let mut runs = Vec::new();
        while let Some(e) = self.entries.get(i) {
            if e.key.object_id != object_id || e.key.item_type != item_type || e.key.offset >= end {
                break;
            }
            let start = e.key.offset;
            let stop = start.saturating_add(run_len(e.size).max(1));
            if stop > beg {
                runs.push((start.max(beg), stop.min(end)));
            }
            i += 1;
        }
        runs
    }

    /// First `(object_id, item_type)` entry whose run overlaps
    /// `[beg, end)`.
    pub(crate) fn first_overlap(
        &self,
        object_id: u64,
        item_type: ItemType,
        beg: u64,
        end: u64,
        run_len: &dyn Fn(u32) -> u64,
    ) -> Option<&IndexedItem> {
        let lo = Key::new(object_id, item_type, 0);
        let mut i = self.entries.partition_point(|e| e.key < lo);
        while let Some(e) = self.entries.get(i) {
            if e.key.object_id != object_id || e.key.item_type != item_type || e.key.offset >= end {
                return None;
            }
            let stop = e.key.offset.saturating_add(run_len(e.size).max(1));
            if stop > beg {
                return Some(e);
            }
            i += 1;
        }
        None
    }
}

fn should_replace(
    graph: &Graph,
    chain: &AncestorChain,
    old: &IndexedItem,
    new: &IndexedItem,
) -> Result<bool> {
    let old_leaf = graph.node(old.ptr.leaf).expect("indexed leaf is in the graph");
    let new_leaf = graph.node(new.ptr.leaf).expect("indexed leaf is in the graph");
    let old_dist = chain.cow_distance(old_leaf.owner).expect("legal owner is on the chain");
    let new_dist = chain.cow_distance(new_leaf.owner).expect("legal owner is on the chain");
    if new_dist != old_dist {
        return Ok(new_dist < old_dist);
    }
    if new_leaf.generation != old_leaf.generation {
        return Ok(new_leaf.generation > old_leaf.generation);
    }
    Err(Error::AmbiguousTree {
        tree: chain.tree_id(),
        key: new.key,
        a: old.ptr.leaf,
        b: new.ptr.leaf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::format::{Item, ItemBody, NodeBody, NodeHeader, Superblock};

    const P: u64 = 5;
    const C: u64 = 257;

    fn chain_with_parent() -> AncestorChain {
        AncestorChain::new(vec![
            ChainLink { id: C, has_parent: true, parent_generation: 10 },
            ChainLink { id: P, has_parent: false, parent_generation: 0 },
        ])
    }

    #[test]
    fn legality_respects_the_snapshot_cutoff() {
        let chain = chain_with_parent();
        assert!(chain.is_legal(C, 12), "own nodes are legal at any generation");
        assert!(chain.is_legal(P, 9), "parent nodes strictly before the cutoff");
        assert!(!chain.is_legal(P, 10), "parent nodes at the cutoff are not shared");
        assert!(!chain.is_legal(P, 11));
        assert!(!chain.is_legal(42, 1), "strangers are never legal");
    }

    #[test]
    fn cow_distance_counts_hops() {
        let chain = chain_with_parent();
        assert_eq!(chain.cow_distance(C), Some(0));
        assert_eq!(chain.cow_distance(P), Some(1));
        assert_eq!(chain.cow_distance(42), None);
    }

    fn sb() -> Superblock {
        Superblock {
            fsid: [1; 16],
            flags: 0,
            generation: 1,
            root: 0,
            chunk_root: 0,
            log_root: 0,
            log_root_transid: 0,
            total_bytes: 0,
            bytes_used: 0,
            sector_size: 4096,
            node_size: 4096,
            chunk_root_generation: 0,
            incompat_flags: 0,
            csum_type: ChecksumKind::Crc32c,
            root_level: 0,
            chunk_root_level: 0,
            log_root_level: 0,
            metadata_uuid: [0; 16],
            block_group_root: 0,
            block_group_root_generation: 0,
            block_group_root_level: 0,
            chunk_tree_uuid: [0; 16],
            sys_chunk_array_size: 0,
            sys_chunk_array: vec![0; 2048],
        }
    }

    fn leaf(addr: u64, owner: u64, generation: u64, objs: &[u64]) -> crate::format::Node {
        let items: Vec<Item> = objs
            .iter()
            .map(|o| Item::new(Key::new(*o, ItemType(0x77), 0), ItemBody::Other { raw: vec![0; 4] }))
            .collect();
        crate::format::Node {
            head: NodeHeader {
                addr,
                fsid: [1; 16],
                flags: 0,
                chunk_tree_uuid: [0; 16],
                generation,
                owner,
                num_items: items.len() as u32,
                level: 0,
            },
            body: NodeBody::Leaf(items),
        }
    }

    fn interior(addr: u64, owner: u64, generation: u64, children: &[u64]) -> crate::format::Node {
        let kps = children
            .iter()
            .enumerate()
            .map(|(i, child)| crate::format::KeyPointer {
                key: Key::new(i as u64 * 100 + 1, ItemType(0x77), 0),
                block_ptr: *child,
                generation,
            })
            .collect();
        crate::format::Node {
            head: NodeHeader {
                addr,
                fsid: [1; 16],
                flags: 0,
                chunk_tree_uuid: [0; 16],
                generation,
                owner,
                num_items: children.len() as u32,
                level: 1,
            },
            body: NodeBody::Interior(kps),
        }
    }

    /// Two candidate interior roots over overlapping leaves, plus a leaf
    /// shared from the parent tree before the cutoff.
    fn graph() -> Graph {
        let mut g = Graph::new(&sb());
        g.insert_node(&interior(0x1000000, C, 9, &[0x2000000]));
        g.insert_node(&interior(0x1100000, C, 12, &[0x2000000, 0x2100000]));
        g.insert_node(&leaf(0x2000000, C, 8, &[1, 2]));
        g.insert_node(&leaf(0x2100000, P, 9, &[101, 102]));
        g.insert_node(&leaf(0x2200000, P, 11, &[201]));
        g.final_check(|_| Some(Error::NoItem)).unwrap();
        g
    }

    #[test]
    fn leaf_index_labels_roots_and_drops_illegal_leaves() {
        let g = graph();
        let ix = LeafIndex::build(&g, &chain_with_parent());

        // 0x2200000 is a parent-tree leaf past the cutoff: not legal.
        assert!(ix.roots_for(0x2200000).is_none());

        let shared: Vec<u64> = ix.roots_for(0x2000000).unwrap().iter().copied().collect();
        let mut shared_sorted = shared.clone();
        shared_sorted.sort_unstable();
        assert_eq!(shared_sorted, vec![0x1000000, 0x1100000]);

        let single: Vec<u64> = ix.roots_for(0x2100000).unwrap().iter().copied().collect();
        assert_eq!(single, vec![0x1100000]);
    }

    #[test]
    fn item_indexes_split_on_accepted_roots() {
        let g = graph();
        let chain = chain_with_parent();
        let leaf_ix = LeafIndex::build(&g, &chain);
        let mut accepted = IndexSet::new();
        accepted.insert(0x1000000u64);

        let items = ItemIndex::build(&g, &chain, &leaf_ix, &accepted, true).unwrap();
        let keys: Vec<u64> = items.keys().map(|k| k.object_id).collect();
        assert_eq!(keys, vec![1, 2]);

        let potential = ItemIndex::build(&g, &chain, &leaf_ix, &accepted, false).unwrap();
        let keys: Vec<u64> = potential.keys().map(|k| k.object_id).collect();
        assert_eq!(keys, vec![101, 102]);

        // Included and potential never share a key.
        for e in items.iter() {
            assert!(potential.get(&e.key).is_none());
        }
    }

    #[test]
    fn collision_prefers_distance_then_generation() {
        let mut g = Graph::new(&sb());
        // Same key in three leaves: child tree at gen 5, child tree at gen 7,
        // parent tree at gen 9 (legal, but one hop away).
        g.insert_node(&leaf(0x2000000, C, 5, &[1]));
        g.insert_node(&leaf(0x2100000, C, 7, &[1]));
        g.insert_node(&leaf(0x2200000, P, 9, &[1]));
        g.final_check(|_| Some(Error::NoItem)).unwrap();

        let chain = chain_with_parent();
        let leaf_ix = LeafIndex::build(&g, &chain);
        // Every leaf is its own root; accept them all.
        let accepted: IndexSet<u64> =
            [0x2000000u64, 0x2100000, 0x2200000].into_iter().collect();
        let items = ItemIndex::build(&g, &chain, &leaf_ix, &accepted, true).unwrap();

        let winner = items.get(&Key::new(1, ItemType(0x77), 0)).unwrap();
        assert_eq!(winner.ptr.leaf, 0x2100000, "distance 0 beats distance 1, gen 7 beats gen 5");
    }

    #[test]
    fn exact_tie_is_an_ambiguity_error() {
        let mut g = Graph::new(&sb());
        g.insert_node(&leaf(0x2000000, C, 7, &[1]));
        g.insert_node(&leaf(0x2100000, C, 7, &[1]));
        g.final_check(|_| Some(Error::NoItem)).unwrap();

        let chain = chain_with_parent();
        let leaf_ix = LeafIndex::build(&g, &chain);
        let accepted: IndexSet<u64> = [0x2000000u64, 0x2100000].into_iter().collect();
        let err = ItemIndex::build(&g, &chain, &leaf_ix, &accepted, true).unwrap_err();
        assert!(matches!(err, Error::AmbiguousTree { tree: C, .. }), "{err}");
    }

    #[test]
    fn covered_runs_and_overlap() {
        let mut g = Graph::new(&sb());
        let items: Vec<Item> = [0x0u64, 0x4000, 0x10000]
            .iter()
            .map(|off| {
                Item::new(
                    Key::new(9, ItemType::EXTENT_CSUM, *off),
                    ItemBody::ExtentCsum { raw: vec![0; 16] },
                )
            })
            .collect();
        let node = crate::format::Node {
            head: NodeHeader {
                addr: 0x2000000,
                fsid: [1; 16],
                flags: 0,
                chunk_tree_uuid: [0; 16],
                generation: 3,
                owner: C,
                num_items: items.len() as u32,
                level: 0,
            },
            body: NodeBody::Leaf(items),
        };
        g.insert_node(&node);
        g.final_check(|_| Some(Error::NoItem)).unwrap();
        let chain = chain_with_parent();
        let leaf_ix = LeafIndex::build(&g, &chain);
        let accepted: IndexSet<u64> = [0x2000000u64].into_iter().collect();
        let items = ItemIndex::build(&g, &chain, &leaf_ix, &accepted, true).unwrap();

        // 16-byte bodies, 4 bytes per sum, 4096-byte blocks: 0x4000 each.
        let run_len = |size: u32| (size as u64 / 4) * 4096;
        let runs = items.covered_runs(9, ItemType::EXTENT_CSUM, 0, 0x20000, &run_len);
        assert_eq!(runs, vec![(0, 0x4000), (0x4000, 0x8000), (0x10000, 0x14000)]);

        let hit = items.first_overlap(9, ItemType::EXTENT_CSUM, 0x12000, 0x13000, &run_len);
        assert_eq!(hit.unwrap().key.offset, 0x10000);
        assert!(items.first_overlap(9, ItemType::EXTENT_CSUM, 0x8000, 0x10000, &run_len).is_none());
    }
}
