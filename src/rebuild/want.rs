//! Want primitives: how item handlers express "this tree should contain
//! that item".
//!
//! Each primitive first checks the tree's included items; only unmet wants
//! consult the potential items, translate the matching leaves into the
//! unaccepted roots that reach them, and queue those as the want's choices.
//! The driver's augment pass later decides which choices become roots.

use indexmap::IndexSet;
use log::{debug, trace};

use super::DriverState;
use crate::format::{Item, ItemType, Key};
use crate::node_source::ByteReader;
use crate::rebuilt::RebuiltForest;
use crate::tree::{SearchExactKey, SearchObjectType, Searcher};
use crate::Result;

pub struct WantCtx<'a, R> {
    forest: &'a RebuiltForest<R>,
    state: &'a DriverState,
}

impl<'a, R: ByteReader> WantCtx<'a, R> {
    pub(crate) fn new(forest: &'a RebuiltForest<R>, state: &'a DriverState) -> Self {
        WantCtx { forest, state }
    }

    pub fn forest(&self) -> &RebuiltForest<R> {
        self.forest
    }

    /// Queue a tree for initialization in the next pass.
    pub fn push_tree(&self, id: u64) {
        self.state.push_tree(id);
    }

    /// Want any item of `(object_id, item_type)` in `tree`.
    pub fn want(&self, tree: u64, object_id: u64, item_type: ItemType, reason: &str) -> Result<()> {
        let searcher = SearchObjectType(object_id, item_type);
        self.want_by_searcher(tree, &searcher, reason)
    }

    /// Want exactly `key` in `tree`.
    pub fn want_off(&self, tree: u64, key: Key, reason: &str) -> Result<()> {
        let searcher = SearchExactKey(key);
        self.want_by_searcher(tree, &searcher, reason)
    }

    fn want_by_searcher(&self, tree: u64, searcher: &dyn Searcher, reason: &str) -> Result<()> {
        if !self.ensure_tree(tree) {
            return Ok(());
        }
        if self.forest.with_items(tree, |ix| ix.search(searcher).is_some())? {
            return Ok(());
        }
        let leaves: IndexSet<u64> = self.forest.with_potential_items(tree, |ix| {
            ix.search_all(searcher).iter().map(|e| e.ptr.leaf).collect()
        })?;
        let choices = self.choices_for(tree, leaves.iter().copied())?;
        if choices.is_empty() {
            trace!("want: {} ({}) has no candidates in tree {}", searcher.describe(), reason, tree);
            return Ok(());
        }
        self.state.queue_want(tree, format!("{} [{}]", searcher.describe(), reason), choices);
        Ok(())
    }

    /// Translate candidate leaves into the unaccepted roots that would make
    /// them reachable; those roots are what an augment can actually add.
    fn choices_for(&self, tree: u64, leaves: impl Iterator<Item = u64>) -> Result<IndexSet<u64>> {
        let mut choices = IndexSet::new();
        for leaf in leaves {
            choices.extend(self.forest.leaf_to_roots(tree, leaf)?);
        }
        Ok(choices)
    }

    /// Want an item of `(object_id, item_type)` satisfying `predicate`,
    /// which sees the fully decoded item body.
    pub fn want_func(
        &self,
        tree: u64,
        object_id: u64,
        item_type: ItemType,
        predicate: &dyn Fn(&Item) -> bool,
        reason: &str,
    ) -> Result<()> {
        if !self.ensure_tree(tree) {
            return Ok(());
        }
        let searcher = SearchObjectType(object_id, item_type);
        let included =
            self.forest.with_items(tree, |ix| ix.search_all(&searcher).to_vec())?;
        for entry in &included {
            if let Ok(item) = self.forest.read_item_at(entry.ptr) {
                if predicate(&item) {
                    return Ok(());
                }
            }
        }
        let candidates =
            self.forest.with_potential_items(tree, |ix| ix.search_all(&searcher).to_vec())?;
        let mut leaves = IndexSet::new();
        for entry in &candidates {
            if let Ok(item) = self.forest.read_item_at(entry.ptr) {
                if predicate(&item) {
                    leaves.insert(entry.ptr.leaf);
                }
            }
        }
        let choices = self.choices_for(tree, leaves.iter().copied())?;
        if choices.is_empty() {
            trace!("want: predicate on {} ({}) has no candidates", searcher.describe(), reason);
            return Ok(());
        }
        self.state
            .queue_want(tree, format!("{} by predicate [{}]", searcher.describe(), reason), choices);
        Ok(())
    }

    /// Want coverage of the offset window `[beg, end)` by
    /// `(object_id, item_type)` items, where `run_len` maps an item's body
    /// size to the offsets it covers. Every uncovered gap greedily picks one
    /// candidate leaf.
    pub fn want_range(
        &self,
        tree: u64,
        object_id: u64,
        item_type: ItemType,
        beg: u64,
        end: u64,
        run_len: &dyn Fn(u32) -> u64,
        reason: &str,
    ) -> Result<()> {
        if beg >= end || !self.ensure_tree(tree) {
            return Ok(());
        }
        let covered = self.forest.with_items(tree, |ix| {
            ix.covered_runs(object_id, item_type, beg, end, run_len)
        })?;

        // Fold the runs into gaps; runs come sorted by start offset.
        let mut gaps: Vec<(u64, u64)> = Vec::new();
        let mut cursor = beg;
        for (start, stop) in covered {
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(stop);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        for (gap_beg, gap_end) in gaps {
            let pick = self.forest.with_potential_items(tree, |ix| {
                ix.first_overlap(object_id, item_type, gap_beg, gap_end, run_len)
                    .map(|e| e.ptr.leaf)
            })?;
            match pick {
                Some(leaf) => {
                    let choices = self.choices_for(tree, std::iter::once(leaf))?;
                    if choices.is_empty() {
                        continue;
                    }
                    self.state.queue_want(
                        tree,
                        format!(
                            "object={} type={} range {:#x}..{:#x} [{}]",
                            object_id, item_type, gap_beg, gap_end, reason
                        ),
                        choices,
                    );
                }
                None => trace!(
                    "want: range {:#x}..{:#x} of object {} in tree {} has no candidates ({})",
                    gap_beg,
                    gap_end,
                    object_id,
                    tree,
                    reason
                ),
            }
        }
        Ok(())
    }

    /// Initialize-on-demand; a tree that cannot initialize swallows its
    /// wants (they become satisfiable once the root tree grows).
    fn ensure_tree(&self, tree: u64) -> bool {
        match self.forest.tree(tree) {
            Ok(_) => true,
            Err(err) => {
                debug!("want: tree {} unavailable: {}", tree, err);
                false
            }
        }
    }
}
