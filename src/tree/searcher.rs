//! Composable item comparators.
//!
//! A searcher is a three-way comparison against a candidate key plus the
//! candidate's body size. The sign convention follows key comparison with
//! the searcher's target on the left: negative means the target lies before
//! the candidate, positive after, zero is a match. Interior key-pointers
//! pass [`SIZE_UNKNOWN`] as the size; descent clamps positive results so the
//! binary-search predicate over key-pointers stays monotonic.

use crate::format::{ItemType, Key, EXTENT_CSUM_OBJECTID};

/// Body size passed when comparing against an interior key-pointer.
pub const SIZE_UNKNOWN: u32 = u32::MAX;

pub trait Searcher {
    /// Human-readable target description, for logs and want bookkeeping.
    fn describe(&self) -> String;

    fn search(&self, key: &Key, body_size: u32) -> i32;
}

/// Matches exactly one key.
pub struct SearchExactKey(pub Key);

impl Searcher for SearchExactKey {
    fn describe(&self) -> String {
        format!("key={}", self.0)
    }

    fn search(&self, key: &Key, _body_size: u32) -> i32 {
        self.0.compare(key)
    }
}

/// Matches every item of one object id, any type, any offset.
pub struct SearchObject(pub u64);

impl Searcher for SearchObject {
    fn describe(&self) -> String {
        format!("object={}", self.0)
    }

    fn search(&self, key: &Key, _body_size: u32) -> i32 {
        match self.0.cmp(&key.object_id) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }
    }
}

/// Matches every item of one `(object id, type)` pair, any offset.
pub struct SearchObjectType(pub u64, pub ItemType);

impl Searcher for SearchObjectType {
    fn describe(&self) -> String {
        format!("object={} type={}", self.0, self.1)
    }

    fn search(&self, key: &Key, _body_size: u32) -> i32 {
        match (self.0, self.1).cmp(&(key.object_id, key.item_type)) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }
    }
}

/// Matches the ROOT_ITEMs of one tree, whatever their snapshot offset.
pub struct SearchRootItem(pub u64);

impl Searcher for SearchRootItem {
    fn describe(&self) -> String {
        format!("root item of tree {}", self.0)
    }

    fn search(&self, key: &Key, body_size: u32) -> i32 {
        SearchObjectType(self.0, ItemType::ROOT_ITEM).search(key, body_size)
    }
}

/// Matches the checksum run covering one logical address.
///
/// A run keyed at offset `o` with body size `s` covers
/// `[o, o + (s / alg_size) * block_size)`; the body size is what locates the
/// right run, which is why searchers receive it at all.
pub struct SearchCsum {
    pub logical: u64,
    /// Bytes per checksum item for the image's algorithm.
    pub alg_size: u32,
    /// Bytes covered by one checksum item.
    pub block_size: u32,
}

impl Searcher for SearchCsum {
    fn describe(&self) -> String {
        format!("csum covering {:#x}", self.logical)
    }

    fn search(&self, key: &Key, body_size: u32) -> i32 {
        let prefix = (EXTENT_CSUM_OBJECTID, ItemType::EXTENT_CSUM)
            .cmp(&(key.object_id, key.item_type));
        if prefix != std::cmp::Ordering::Equal {
            return if prefix == std::cmp::Ordering::Less { -1 } else { 1 };
        }
        if self.logical < key.offset {
            return -1;
        }
        let run = if body_size == SIZE_UNKNOWN {
            u64::MAX
        } else {
            (body_size as u64 / self.alg_size as u64) * self.block_size as u64
        };
        if self.logical < key.offset.saturating_add(run) {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_key_signs() {
        let s = SearchExactKey(Key::new(5, ItemType(2), 9));
        assert_eq!(s.search(&Key::new(5, ItemType(2), 9), 0), 0);
        assert_eq!(s.search(&Key::new(5, ItemType(2), 10), 0), -1);
        assert_eq!(s.search(&Key::new(5, ItemType(2), 8), 0), 1);
    }

    #[test]
    fn object_ignores_type_and_offset() {
        let s = SearchObject(2);
        assert_eq!(s.search(&Key::new(2, ItemType(0xff), u64::MAX), 0), 0);
        assert_eq!(s.search(&Key::new(3, ItemType(0), 0), 0), -1);
        assert_eq!(s.search(&Key::new(1, ItemType(0xff), 0), 0), 1);
    }

    #[test]
    fn csum_run_bounds() {
        // 4-byte crc32c sums over 4096-byte blocks: a 16-byte body covers
        // 4 blocks = 0x4000 bytes.
        let covering = |logical| SearchCsum { logical, alg_size: 4, block_size: 4096 };
        let key = Key::new(EXTENT_CSUM_OBJECTID, ItemType::EXTENT_CSUM, 0x100000);

        assert_eq!(covering(0x100000).search(&key, 16), 0);
        assert_eq!(covering(0x103fff).search(&key, 16), 0);
        assert_eq!(covering(0x104000).search(&key, 16), 1, "past the run: target is after");
        assert_eq!(covering(0xfffff).search(&key, 16), -1, "before the run: target is before");

        // Unknown size (interior pointer): everything at or past the offset
        // may be in the subtree.
        assert_eq!(covering(0x900000).search(&key, SIZE_UNKNOWN), 0);
        assert_eq!(covering(0xfffff).search(&key, SIZE_UNKNOWN), -1);
    }
}
