//! Rebuilt trees: logical trees re-derived from the node graph instead of
//! trusted root pointers.
//!
//! A rebuilt tree is its id, its snapshot lineage, and a monotonically
//! growing set of accepted candidate roots. Everything else (which leaves
//! are legal, which items are included, which are merely potential) is
//! derived from `(graph, roots)` and cached; the forest owns those caches
//! and the trees themselves, so parent links can stay plain ids.

mod forest;
mod tree;

pub use forest::{ForestCallbacks, RebuiltForest};
pub use tree::{IndexedItem, ItemIndex, ItemPtr, LeafIndex, RebuiltTree};
