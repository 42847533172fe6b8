//! The rebuild driver: a want/augment fixed-point loop that grows each
//! tree's root set until referential closure.
//!
//! Three queues drive the passes. `tree_queue` holds tree ids awaiting
//! initialization, `item_queue` holds `(tree, key)` pairs whose handlers
//! still have to run, and `augment_queue` holds, per tree and per want, the
//! candidate roots that would satisfy the want. A pass initializes queued
//! trees, processes queued items in key order, then resolves augments into
//! `add_root` calls; every acceptance feeds new items back through
//! `added_item`. When a pass drains nothing, the fixed point is reached.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian as LE};
use crossbeam_channel::Sender;
use indexmap::IndexSet;
use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cancel::CancelToken;
use crate::config::SalvageConfiguration;
use crate::format::{ItemBody, ItemType, Key, RootItem, Uuid, ROOT_TREE, UUID_TREE, WELL_KNOWN_TREES};
use crate::graph::Graph;
use crate::node_source::{ByteReader, NodeSource};
use crate::rebuilt::{ForestCallbacks, RebuiltForest};
use crate::tree::SearchRootItem;
use crate::{Error, Result};

mod handlers;
mod want;

pub use want::WantCtx;

/// Progress events, sent best-effort when a report channel is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildEvent {
    PassStarted { pass: usize },
    TreeInitialized { tree: u64 },
    TreeFailed { tree: u64 },
    ItemsProcessed { count: usize },
    RootAdded { tree: u64, addr: u64 },
    Finished { passes: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub passes: usize,
    pub trees_initialized: usize,
    pub items_processed: usize,
    pub roots_added: usize,
}

/// Shared queue state; doubles as the forest's callback sink.
#[derive(Default)]
pub(crate) struct DriverState {
    tree_queue: Mutex<IndexSet<u64>>,
    item_queue: Mutex<BTreeSet<(u64, Key)>>,
    /// tree -> want description -> candidate roots that would satisfy it.
    augment_queue: Mutex<BTreeMap<u64, BTreeMap<String, IndexSet<u64>>>>,
}

impl DriverState {
    pub(crate) fn push_tree(&self, id: u64) {
        self.tree_queue.lock().insert(id);
    }

    pub(crate) fn queue_want(&self, tree: u64, desc: String, choices: IndexSet<u64>) {
        self.augment_queue
            .lock()
            .entry(tree)
            .or_default()
            .entry(desc)
            .or_insert(choices);
    }

    fn take_trees(&self) -> Vec<u64> {
        self.tree_queue.lock().drain(..).collect()
    }

    fn take_items(&self) -> Vec<(u64, Key)> {
        std::mem::take(&mut *self.item_queue.lock()).into_iter().collect()
    }

    fn take_augments(&self) -> BTreeMap<u64, BTreeMap<String, IndexSet<u64>>> {
        std::mem::take(&mut *self.augment_queue.lock())
    }

    fn is_empty(&self) -> bool {
        self.tree_queue.lock().is_empty()
            && self.item_queue.lock().is_empty()
            && self.augment_queue.lock().is_empty()
    }
}

impl<R: ByteReader> ForestCallbacks<R> for DriverState {
    fn added_item(&self, tree_id: u64, key: Key) {
        self.item_queue.lock().insert((tree_id, key));
    }

    fn lookup_root(&self, forest: &RebuiltForest<R>, tree_id: u64) -> Option<(u64, RootItem)> {
        let hits = forest.search_all(ROOT_TREE, &SearchRootItem(tree_id)).ok()?;
        // Prefer the newest snapshot offset whose body decodes.
        for entry in hits.iter().rev() {
            if let Ok(item) = forest.read_item_at(entry.ptr) {
                if let ItemBody::Root(ri) = item.body {
                    return Some((entry.key.offset, ri));
                }
            }
        }
        None
    }

    fn lookup_uuid(&self, forest: &RebuiltForest<R>, uuid: &Uuid) -> Option<u64> {
        match forest.read_item(UUID_TREE, uuid_key(uuid)) {
            Ok(item) => match item.body {
                ItemBody::UuidSubvols(ids) => ids.first().copied(),
                _ => None,
            },
            Err(_) => None,
        }
    }
}

/// UUID-tree key for a subvolume UUID: the two halves of the UUID, read
/// little-endian, become object id and offset.
fn uuid_key(uuid: &Uuid) -> Key {
    Key::new(
        LE::read_u64(&uuid[0..8]),
        ItemType::UUID_SUBVOL,
        LE::read_u64(&uuid[8..16]),
    )
}

pub struct RebuildDriver<R: ByteReader> {
    forest: Arc<RebuiltForest<R>>,
    state: Arc<DriverState>,
    report: Option<Sender<RebuildEvent>>,
}

impl<R: ByteReader> RebuildDriver<R> {
    pub fn new(
        source: Arc<NodeSource<R>>,
        graph: Arc<Graph>,
        config: &SalvageConfiguration,
    ) -> RebuildDriver<R> {
        let state = Arc::new(DriverState::default());
        let callbacks: Arc<dyn ForestCallbacks<R>> = state.clone();
        let forest = Arc::new(RebuiltForest::new(source, graph, config, callbacks));
        RebuildDriver { forest, state, report: None }
    }

    /// Attach a progress channel.
    pub fn with_report(mut self, tx: Sender<RebuildEvent>) -> Self {
        self.report = Some(tx);
        self
    }

    pub fn forest(&self) -> &Arc<RebuiltForest<R>> {
        &self.forest
    }

    fn emit(&self, event: RebuildEvent) {
        if let Some(tx) = &self.report {
            let _ = tx.send(event);
        }
    }

    /// Run passes until the fixed point. The forest keeps whatever state
    /// was reached if this returns early through cancellation.
    pub fn rebuild(&self, cancel: &CancelToken) -> Result<RebuildReport> {
        for id in WELL_KNOWN_TREES {
            self.state.push_tree(id);
        }
        let mut report = RebuildReport::default();

        while !self.state.is_empty() {
            cancel.check()?;
            report.passes += 1;
            self.emit(RebuildEvent::PassStarted { pass: report.passes });

            for id in self.state.take_trees() {
                cancel.check()?;
                match self.forest.tree(id) {
                    Ok(_) => {
                        report.trees_initialized += 1;
                        self.emit(RebuildEvent::TreeInitialized { tree: id });
                    }
                    Err(err) if err.is_not_exist() => {
                        debug!("rebuild: tree {} unavailable: {}", id, err);
                        self.emit(RebuildEvent::TreeFailed { tree: id });
                    }
                    Err(err) => return Err(err),
                }
            }

            let items = self.state.take_items();
            for &(tree_id, key) in &items {
                cancel.check()?;
                self.process_item(tree_id, key)?;
                report.items_processed += 1;
            }
            if !items.is_empty() {
                self.emit(RebuildEvent::ItemsProcessed { count: items.len() });
            }

            for (tree_id, lists) in self.state.take_augments() {
                cancel.check()?;
                let lists: Vec<IndexSet<u64>> = lists.into_values().collect();
                for root in self.resolve_augments(tree_id, &lists)? {
                    self.forest.add_root(tree_id, root)?;
                    report.roots_added += 1;
                    self.emit(RebuildEvent::RootAdded { tree: tree_id, addr: root });
                }
            }
        }

        self.emit(RebuildEvent::Finished { passes: report.passes });
        Ok(report)
    }

    fn process_item(&self, tree_id: u64, key: Key) -> Result<()> {
        let item = match self.forest.read_item(tree_id, key) {
            Ok(item) => item,
            Err(err @ (Error::NoItem | Error::NoTree(_))) => {
                warn!("rebuild: included item {} of tree {} vanished: {}", key, tree_id, err);
                return Ok(());
            }
            Err(err @ (Error::NotANode { .. } | Error::Io { .. } | Error::Decode { .. })) => {
                warn!("rebuild: cannot read item {} of tree {}: {}", key, tree_id, err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let ctx = WantCtx::new(&self.forest, &self.state);
        handlers::item_wants(&ctx, tree_id, key, &item)
    }

    /// Choose which candidate roots to accept for one tree. Candidates are
    /// ranked by how many want lists they satisfy, then COW distance,
    /// generation and address; a candidate conflicts when any of its lists
    /// already has an accepted choice.
    fn resolve_augments(&self, tree_id: u64, lists: &[IndexSet<u64>]) -> Result<Vec<u64>> {
        if self.forest.tree(tree_id).is_err() {
            debug!("rebuild: dropping augments for unavailable tree {}", tree_id);
            return Ok(Vec::new());
        }

        struct Candidate {
            root: u64,
            count: usize,
            dist: usize,
            generation: u64,
        }

        let mut counts: FxHashMap<u64, usize> = FxHashMap::default();
        for list in lists {
            for &root in list {
                *counts.entry(root).or_default() += 1;
            }
        }
        let mut candidates = Vec::with_capacity(counts.len());
        for (&root, &count) in &counts {
            let (dist, generation) = self.forest.candidate_rank(tree_id, root)?;
            candidates.push(Candidate { root, count, dist, generation });
        }
        candidates.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.dist.cmp(&b.dist))
                .then(b.generation.cmp(&a.generation))
                .then(a.root.cmp(&b.root))
        });

        let mut satisfied = vec![false; lists.len()];
        let mut chosen = Vec::new();
        for cand in candidates {
            let member: Vec<usize> = lists
                .iter()
                .enumerate()
                .filter(|(_, list)| list.contains(&cand.root))
                .map(|(i, _)| i)
                .collect();
            if member.iter().any(|&i| satisfied[i]) {
                continue;
            }
            chosen.push(cand.root);
            for i in member {
                satisfied[i] = true;
            }
        }
        Ok(chosen)
    }
}
