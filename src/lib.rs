//! Forensic rebuild engine for damaged btrfs images.
//!
//! The engine never trusts the image's own root pointers further than it has
//! to. It scans every candidate tree-node block on the device, builds an
//! immutable graph of key-pointer and tree-ownership edges, and re-derives
//! each logical tree from that graph: every leaf that is *legal* for a tree
//! (by owner and snapshot generation) is indexed against the candidate roots
//! that reach it, and a want/augment loop grows each tree's accepted root
//! set until the trees are referentially closed. Queries are answered from
//! the rebuilt trees; the image itself is never written.
//!
//! Layering, bottom up:
//!
//! - [`cache`]: fixed-capacity pinning cache with adaptive eviction,
//!   shared by the node source and the per-tree index caches.
//! - [`format`]: keys, nodes, item bodies and the superblock.
//! - [`node_source`]: checksummed, validated, cached node reads over an
//!   external [`node_source::ByteReader`].
//! - [`tree`]: walk/lookup/search/cursor access to one tree.
//! - [`graph`] and [`scan`]: the one-shot device scan and the node graph
//!   it produces.
//! - [`rebuilt`]: the forest of re-derived trees and their item indexes.
//! - [`rebuild`]: the driver loop reaching the fixed point.

pub mod cache;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod error;
pub mod format;
pub mod graph;
pub mod node_source;
pub mod rebuild;
pub mod rebuilt;
pub mod scan;
pub mod tree;

pub use cancel::CancelToken;
pub use config::SalvageConfiguration;
pub use error::{Error, Result};

/// Initialize `env_logger` for binaries and tests that want the engine's
/// logging without wiring their own.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::builder().is_test(false).try_init();
}
