//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a salvage session. All fields have workable defaults; the
/// struct exists so embedders can bound the working set of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SalvageConfiguration {
    /// Capacity of the decoded-node cache, in nodes. Must be at least the
    /// maximum tree height plus some slack, since cursors pin one node per
    /// path element.
    pub node_cache_capacity: usize,
    /// Capacity of each of the three per-tree index caches (leaf-to-roots,
    /// included items, potential items), in trees.
    pub tree_index_cache_capacity: usize,
    /// Step between candidate block addresses during the device scan, in
    /// bytes. Zero means one node size, which suits images whose metadata
    /// has stayed node-aligned; a smaller power of two also catches nodes
    /// copied to odd alignments, at proportional scan cost.
    pub scan_chunk_size: u64,
}

impl Default for SalvageConfiguration {
    fn default() -> Self {
        SalvageConfiguration {
            node_cache_capacity: 1024,
            tree_index_cache_capacity: 16,
            scan_chunk_size: 0,
        }
    }
}
