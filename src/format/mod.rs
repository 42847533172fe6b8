//! On-disk data model: keys, item types, nodes and the superblock.
//!
//! Everything here is little-endian on disk. Decoding is deliberately
//! forgiving about semantics (a damaged image is the expected input) but
//! strict about structure: offsets must stay in bounds and ordering
//! invariants must hold, otherwise the block is rejected as not-a-node.

use std::fmt;

mod node;
mod superblock;

pub use node::{
    DirEntry, FileExtent, FileExtentKind, InodeItem, InodeRef, Item, ItemBody, KeyPointer, Node,
    NodeBody, NodeHeader, RootItem, HEADER_LEN, ITEM_LEN, KEY_LEN, KEY_POINTER_LEN,
};
pub use superblock::{ChunkStripe, RootSlot, Superblock, SysChunk, SUPERBLOCK_ADDR, SUPERBLOCK_LEN};

pub const UUID_LEN: usize = 16;
pub type Uuid = [u8; UUID_LEN];

/// Tree ids recorded in the superblock itself.
pub const ROOT_TREE: u64 = 1;
pub const CHUNK_TREE: u64 = 3;
pub const TREE_LOG: u64 = -6_i64 as u64;
pub const BLOCK_GROUP_TREE: u64 = 11;

/// Tree ids resolved through the root tree.
pub const EXTENT_TREE: u64 = 2;
pub const DEV_TREE: u64 = 4;
pub const FS_TREE: u64 = 5;
pub const CSUM_TREE: u64 = 7;
pub const UUID_TREE: u64 = 9;
pub const FREE_SPACE_TREE: u64 = 10;

/// First id usable for subvolumes and snapshots.
pub const FIRST_FREE_OBJECTID: u64 = 256;

/// Object id owning every run in the checksum tree.
pub const EXTENT_CSUM_OBJECTID: u64 = -10_i64 as u64;

/// The four tree ids whose roots the superblock records directly.
pub const WELL_KNOWN_TREES: [u64; 4] = [ROOT_TREE, CHUNK_TREE, TREE_LOG, BLOCK_GROUP_TREE];

/// Levels run 0 (leaf) to 7; anything else means the header is garbage.
pub const MAX_LEVEL: u8 = 7;

/// Item type discriminant inside a key. Kept as a raw byte rather than an
/// enum: a forensic reader must represent types it has never heard of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ItemType(pub u8);

impl ItemType {
    pub const INODE_ITEM: ItemType = ItemType(0x01);
    pub const INODE_REF: ItemType = ItemType(0x0c);
    pub const DIR_ITEM: ItemType = ItemType(0x54);
    pub const DIR_INDEX: ItemType = ItemType(0x60);
    pub const EXTENT_DATA: ItemType = ItemType(0x6c);
    pub const EXTENT_CSUM: ItemType = ItemType(0x80);
    pub const ROOT_ITEM: ItemType = ItemType(0x84);
    pub const ROOT_BACKREF: ItemType = ItemType(0x90);
    pub const ROOT_REF: ItemType = ItemType(0x9c);
    pub const EXTENT_ITEM: ItemType = ItemType(0xa8);
    pub const BLOCK_GROUP_ITEM: ItemType = ItemType(0xc0);
    pub const CHUNK_ITEM: ItemType = ItemType(0xe4);
    pub const UUID_SUBVOL: ItemType = ItemType(0xfb);
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ItemType::INODE_ITEM => write!(f, "INODE_ITEM"),
            ItemType::INODE_REF => write!(f, "INODE_REF"),
            ItemType::DIR_ITEM => write!(f, "DIR_ITEM"),
            ItemType::DIR_INDEX => write!(f, "DIR_INDEX"),
            ItemType::EXTENT_DATA => write!(f, "EXTENT_DATA"),
            ItemType::EXTENT_CSUM => write!(f, "EXTENT_CSUM"),
            ItemType::ROOT_ITEM => write!(f, "ROOT_ITEM"),
            ItemType::ROOT_BACKREF => write!(f, "ROOT_BACKREF"),
            ItemType::ROOT_REF => write!(f, "ROOT_REF"),
            ItemType::EXTENT_ITEM => write!(f, "EXTENT_ITEM"),
            ItemType::BLOCK_GROUP_ITEM => write!(f, "BLOCK_GROUP_ITEM"),
            ItemType::CHUNK_ITEM => write!(f, "CHUNK_ITEM"),
            ItemType::UUID_SUBVOL => write!(f, "UUID_SUBVOL"),
            ItemType(other) => write!(f, "TYPE_{:#04x}", other),
        }
    }
}

/// Item key: the unit of ordering for everything in a tree.
///
/// Ordering is lexicographic over `(object_id, item_type, offset)`, which the
/// field order makes derivable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    pub object_id: u64,
    pub item_type: ItemType,
    pub offset: u64,
}

impl Key {
    pub const ZERO: Key = Key { object_id: 0, item_type: ItemType(0), offset: 0 };

    /// The distinguished maximum key.
    pub const MAX: Key = Key {
        object_id: u64::MAX,
        item_type: ItemType(u8::MAX),
        offset: u64::MAX,
    };

    pub const fn new(object_id: u64, item_type: ItemType, offset: u64) -> Key {
        Key { object_id, item_type, offset }
    }

    /// The immediate predecessor in key order, `None` only for the zero key.
    ///
    /// Decrements the least significant nonzero component and saturates the
    /// components below it, so that for all `k > ZERO` there is no key
    /// strictly between `k.predecessor()` and `k`.
    pub fn predecessor(self) -> Option<Key> {
        if self.offset > 0 {
            Some(Key { offset: self.offset - 1, ..self })
        } else if self.item_type.0 > 0 {
            Some(Key {
                item_type: ItemType(self.item_type.0 - 1),
                offset: u64::MAX,
                ..self
            })
        } else if self.object_id > 0 {
            Some(Key {
                object_id: self.object_id - 1,
                item_type: ItemType(u8::MAX),
                offset: u64::MAX,
            })
        } else {
            None
        }
    }

    /// Three-way compare as a sign, for comparator plumbing that does
    /// arithmetic clamping on the result.
    pub fn compare(&self, other: &Key) -> i32 {
        match self.cmp(other) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.object_id, self.item_type, self.offset)
    }
}
