//! Validated, cached access to decoded tree nodes by logical address.
//!
//! The source sits between the external byte reader and everything that
//! thinks in nodes. A block only comes back from [`NodeSource::node`] if its
//! checksum verifies, it decodes structurally, and it satisfies the caller's
//! [`NodeExpectations`]; failures are typed errors and are never admitted to
//! the cache.

use std::ops::Range;
use std::sync::Arc;

use log::trace;

use crate::cache::{AdaptiveCache, CacheGuard};
use crate::config::SalvageConfiguration;
use crate::format::{Key, Node, Superblock, SysChunk, SUPERBLOCK_ADDR, SUPERBLOCK_LEN};
use crate::{Error, Result};

mod mem;
pub use mem::MemReader;

/// External access to the raw image, in logical addresses. Translation to
/// devices and physical offsets is the address map's problem, not ours.
pub trait ByteReader: Send + Sync + 'static {
    /// Fill `buf` from `addr`. Must fail with a typed error when the logical
    /// address does not resolve or the span is short.
    fn read_at(&self, buf: &mut [u8], addr: u64) -> Result<()>;

    /// Logical ranges that may contain tree nodes; the scan walks these in
    /// node-size steps.
    fn mapped_regions(&self) -> Vec<Range<u64>>;
}

impl<R: ByteReader + ?Sized> ByteReader for Arc<R> {
    fn read_at(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        (**self).read_at(buf, addr)
    }

    fn mapped_regions(&self) -> Vec<Range<u64>> {
        (**self).mapped_regions()
    }
}

/// Constraints a caller imposes on the node it is about to read. Everything
/// is optional; the source always verifies checksum, structure, stored
/// address and filesystem identity.
#[derive(Default)]
pub struct NodeExpectations<'a> {
    pub addr: Option<u64>,
    pub level: Option<u8>,
    pub generation: Option<u64>,
    /// Owner check supplied by the caller; the declared owner of a node is
    /// only judgeable against tree lineage the source knows nothing about.
    pub owner: Option<&'a dyn Fn(u64) -> Result<()>>,
    /// Lower bound every key in the node must satisfy.
    pub min_item: Option<Key>,
    /// Upper bound every key in the node must satisfy.
    pub max_item: Option<Key>,
}

/// Pinned, decoded node. Dropping the guard unpins it.
pub type NodeGuard<'a> = CacheGuard<'a, u64, Node>;

pub struct NodeSource<R> {
    reader: R,
    superblock: Superblock,
    node_size: usize,
    cache: AdaptiveCache<u64, Node>,
}

impl<R: ByteReader> NodeSource<R> {
    /// Read and validate the superblock, then set up the node cache.
    pub fn new(reader: R, config: &SalvageConfiguration) -> Result<Self> {
        let mut buf = vec![0u8; SUPERBLOCK_LEN];
        reader.read_at(&mut buf, SUPERBLOCK_ADDR)?;
        let superblock = Superblock::unpack(&buf)?;
        let node_size = superblock.node_size as usize;
        if !(1024..=(1 << 20)).contains(&node_size) || !node_size.is_power_of_two() {
            return Err(Error::decode(
                SUPERBLOCK_ADDR,
                format!("implausible node size {}", node_size),
            ));
        }
        Ok(NodeSource {
            reader,
            superblock,
            node_size,
            cache: AdaptiveCache::new(config.node_cache_capacity),
        })
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// The bootstrap chunks embedded in the superblock, for priming an
    /// external logical-to-physical map.
    pub fn bootstrap_chunks(&self) -> Result<Vec<SysChunk>> {
        self.superblock.bootstrap_chunks()
    }

    /// Read, validate and pin the node at `addr`.
    pub fn node(&self, addr: u64, exp: &NodeExpectations<'_>) -> Result<NodeGuard<'_>> {
        // Expectations run inside the loader: a miss that fails them errors
        // out of the load and is never admitted to the cache.
        let guard = self.cache.acquire(addr, || {
            let node = self.load(addr)?;
            self.check_expectations(&node, exp)?;
            Ok(node)
        })?;
        // A hit was admitted under some earlier caller's expectations; this
        // caller's still have to hold. The node itself is valid either way,
        // so it stays cached.
        self.check_expectations(&guard, exp)?;
        Ok(guard)
    }

    /// Try reading `addr` as a node, reporting the failure if any. Used by
    /// the graph's final check to classify dangling edge targets.
    pub fn probe(&self, addr: u64) -> Option<Error> {
        match self.node(addr, &NodeExpectations::default()) {
            Ok(_) => None,
            Err(e) => Some(e),
        }
    }

    fn load(&self, addr: u64) -> Result<Node> {
        trace!("node source: loading {:#x}", addr);
        let mut buf = vec![0u8; self.node_size];
        self.reader.read_at(&mut buf, addr)?;
        let node = Node::unpack(addr, self.superblock.csum_type, &buf)?;
        if node.head.addr != addr {
            return Err(Error::not_a_node(
                addr,
                format!("header claims address {:#x}", node.head.addr),
            ));
        }
        if node.head.fsid != self.superblock.effective_metadata_uuid() {
            return Err(Error::not_a_node(addr, "foreign filesystem id"));
        }
        Ok(node)
    }

    fn check_expectations(&self, node: &Node, exp: &NodeExpectations<'_>) -> Result<()> {
        let addr = node.addr();
        if let Some(want) = exp.addr {
            if addr != want {
                return Err(Error::not_a_node(addr, format!("expected address {:#x}", want)));
            }
        }
        if let Some(want) = exp.level {
            if node.level() != want {
                return Err(Error::not_a_node(
                    addr,
                    format!("level {}, expected {}", node.level(), want),
                ));
            }
        }
        if let Some(want) = exp.generation {
            if node.generation() != want {
                return Err(Error::not_a_node(
                    addr,
                    format!("generation {}, expected {}", node.generation(), want),
                ));
            }
        }
        if let Some(check) = exp.owner {
            check(node.owner())?;
        }
        if let Some(min) = exp.min_item {
            if node.min_key() < min {
                return Err(Error::not_a_node(
                    addr,
                    format!("key {} below expected minimum {}", node.min_key(), min),
                ));
            }
        }
        if let Some(max) = exp.max_item {
            if node.max_key() > max {
                return Err(Error::not_a_node(
                    addr,
                    format!("key {} above expected maximum {}", node.max_key(), max),
                ));
            }
        }
        Ok(())
    }
}
