//! Crate-wide error type.
//!
//! Lookup misses (`NoItem`, `NoTree`) are expected outcomes and are matched on
//! by every caller; the rebuild driver turns them into wants. Structural
//! damage surfaces as `NotANode`/`Decode`/`Io` tied to the logical address
//! that produced it. Conditions that can only mean the implementation itself
//! is wrong (releasing an unheld cache entry, mutating a checked graph) are
//! panics, not error values.

use crate::format::Key;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Exact or comparator search found nothing.
    #[error("item not found")]
    NoItem,

    /// The forest has no tree with this id, or its initialization failed.
    #[error("tree {0} not found")]
    NoTree(u64),

    /// The block decodes, but not into a node the caller will accept.
    #[error("block {addr:#x} is not a usable node: {reason}")]
    NotANode { addr: u64, reason: String },

    /// The byte reader failed, including unmapped logical addresses.
    #[error("read of logical {addr:#x} failed: {source}")]
    Io {
        addr: u64,
        #[source]
        source: std::io::Error,
    },

    /// The bytes were read but could not be decoded.
    #[error("decode at logical {addr:#x} failed: {msg}")]
    Decode { addr: u64, msg: String },

    /// Two leaves tie on COW distance and generation for the same key.
    /// The image presents genuinely conflicting snapshots of one tree.
    #[error("tree {tree} is ambiguous at {key}: leaves {a:#x} and {b:#x} tie on distance and generation")]
    AmbiguousTree { tree: u64, key: Key, a: u64, b: u64 },

    /// The node graph contains a directed cycle through this address.
    #[error("node graph has a pointer loop through {addr:#x}")]
    Loop { addr: u64 },

    /// A cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    /// An error raised by a walk or search callback, wrapped with the tree
    /// path that was active when it fired.
    #[error("at {path}: {source}")]
    AtPath {
        path: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Filesystem-style "does not exist" classification. Both lookup-miss
    /// variants satisfy it so callers can treat them uniformly.
    pub fn is_not_exist(&self) -> bool {
        match self {
            Error::NoItem | Error::NoTree(_) => true,
            Error::AtPath { source, .. } => source.is_not_exist(),
            _ => false,
        }
    }

    pub(crate) fn io(addr: u64, source: std::io::Error) -> Self {
        Error::Io { addr, source }
    }

    pub(crate) fn decode(addr: u64, msg: impl Into<String>) -> Self {
        Error::Decode { addr, msg: msg.into() }
    }

    pub(crate) fn not_a_node(addr: u64, reason: impl Into<String>) -> Self {
        Error::NotANode { addr, reason: reason.into() }
    }

    /// Wrap with the textual form of the active path. Used at the walk and
    /// search callback boundary.
    pub(crate) fn at_path(self, path: String) -> Self {
        Error::AtPath { path, source: Box::new(self) }
    }
}
