//! Tree-node blocks: header, interior key-pointers, leaf items and their
//! decoded bodies.
//!
//! A block only becomes a [`Node`] if its structure holds up: checksum,
//! level, item count, in-bounds body slices and strict key ordering. Item
//! *bodies* on the other hand decode leniently; a mangled body becomes
//! [`ItemBody::Error`] so the walk layer can report it without losing the
//! rest of the leaf.

use byteorder::{ByteOrder, LittleEndian as LE};

use super::{ItemType, Key, Uuid, MAX_LEVEL, UUID_LEN};
use crate::checksum::{ChecksumKind, CSUM_SIZE};
use crate::{Error, Result};

/// csum + fsid + bytenr + flags + chunk tree uuid + generation + owner +
/// nritems + level.
pub const HEADER_LEN: usize = CSUM_SIZE + UUID_LEN + 8 + 8 + UUID_LEN + 8 + 8 + 4 + 1;
pub const KEY_LEN: usize = 17;
pub const KEY_POINTER_LEN: usize = KEY_LEN + 8 + 8;
pub const ITEM_LEN: usize = KEY_LEN + 4 + 4;

fn read_key(buf: &[u8]) -> Key {
    Key {
        object_id: LE::read_u64(&buf[0..8]),
        item_type: ItemType(buf[8]),
        offset: LE::read_u64(&buf[9..17]),
    }
}

fn write_key(buf: &mut [u8], key: &Key) {
    LE::write_u64(&mut buf[0..8], key.object_id);
    buf[8] = key.item_type.0;
    LE::write_u64(&mut buf[9..17], key.offset);
}

/// Decoded node header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader {
    /// Logical address stored in the block itself.
    pub addr: u64,
    pub fsid: Uuid,
    pub flags: u64,
    pub chunk_tree_uuid: Uuid,
    pub generation: u64,
    /// Declared owning tree id.
    pub owner: u64,
    pub num_items: u32,
    pub level: u8,
}

/// Interior-node entry pointing at a child one level down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPointer {
    pub key: Key,
    pub block_ptr: u64,
    pub generation: u64,
}

/// Leaf item: key, body size as stored, and the decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Key,
    pub body_size: u32,
    pub body: ItemBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootItem {
    pub generation: u64,
    pub root_dirid: u64,
    /// Logical address of the tree's root node.
    pub byte_nr: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u64,
}

/// One directory entry; DIR_ITEM and DIR_INDEX bodies are sequences of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Key of the entry's target: an INODE_ITEM, or a ROOT_ITEM for a
    /// subvolume crossing.
    pub location: Key,
    pub transid: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileExtentKind {
    Inline { len: u32 },
    Regular { disk_bytenr: u64, disk_num_bytes: u64, offset: u64, num_bytes: u64 },
    Prealloc { disk_bytenr: u64, disk_num_bytes: u64, offset: u64, num_bytes: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExtent {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub kind: FileExtentKind,
}

/// Tagged item body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemBody {
    Root(RootItem),
    Inode(InodeItem),
    InodeRefs(Vec<InodeRef>),
    DirEntries(Vec<DirEntry>),
    FileExtent(FileExtent),
    /// Raw run of checksums from the checksum tree.
    ExtentCsum { raw: Vec<u8> },
    /// UUID-tree entry: subvolume ids carrying the keyed UUID.
    UuidSubvols(Vec<u64>),
    /// A type this crate does not interpret; kept raw.
    Other { raw: Vec<u8> },
    /// The body failed to decode.
    Error { err: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    Interior(Vec<KeyPointer>),
    Leaf(Vec<Item>),
}

/// A fully decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub head: NodeHeader,
    pub body: NodeBody,
}

impl Node {
    pub fn addr(&self) -> u64 {
        self.head.addr
    }

    pub fn level(&self) -> u8 {
        self.head.level
    }

    pub fn owner(&self) -> u64 {
        self.head.owner
    }

    pub fn generation(&self) -> u64 {
        self.head.generation
    }

    pub fn num_items(&self) -> u32 {
        self.head.num_items
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    pub fn interior(&self) -> Option<&[KeyPointer]> {
        match &self.body {
            NodeBody::Interior(kps) => Some(kps),
            NodeBody::Leaf(_) => None,
        }
    }

    pub fn leaf(&self) -> Option<&[Item]> {
        match &self.body {
            NodeBody::Leaf(items) => Some(items),
            NodeBody::Interior(_) => None,
        }
    }

    /// First key present in the node. Decode guarantees at least one entry.
    pub fn min_key(&self) -> Key {
        match &self.body {
            NodeBody::Interior(kps) => kps[0].key,
            NodeBody::Leaf(items) => items[0].key,
        }
    }

    pub fn max_key(&self) -> Key {
        match &self.body {
            NodeBody::Interior(kps) => kps[kps.len() - 1].key,
            NodeBody::Leaf(items) => items[items.len() - 1].key,
        }
    }

    /// Decode one node-sized block read at `addr`.
    pub fn unpack(addr: u64, csum: ChecksumKind, data: &[u8]) -> Result<Node> {
        if data.len() < HEADER_LEN {
            return Err(Error::not_a_node(addr, "block shorter than a node header"));
        }
        if !csum.verify(&data[..CSUM_SIZE], &data[CSUM_SIZE..]) {
            return Err(Error::not_a_node(addr, "checksum mismatch"));
        }

        let mut fsid = [0u8; UUID_LEN];
        fsid.copy_from_slice(&data[32..48]);
        let mut chunk_tree_uuid = [0u8; UUID_LEN];
        chunk_tree_uuid.copy_from_slice(&data[64..80]);
        let head = NodeHeader {
            addr: LE::read_u64(&data[48..56]),
            fsid,
            flags: LE::read_u64(&data[56..64]),
            chunk_tree_uuid,
            generation: LE::read_u64(&data[80..88]),
            owner: LE::read_u64(&data[88..96]),
            num_items: LE::read_u32(&data[96..100]),
            level: data[100],
        };

        if head.level > MAX_LEVEL {
            return Err(Error::not_a_node(addr, format!("level {} out of range", head.level)));
        }
        if head.num_items == 0 {
            return Err(Error::not_a_node(addr, "node has no items"));
        }
        let n = head.num_items as usize;

        let body = if head.level > 0 {
            if HEADER_LEN + n * KEY_POINTER_LEN > data.len() {
                return Err(Error::not_a_node(addr, "key pointers exceed block"));
            }
            let mut kps = Vec::with_capacity(n);
            for i in 0..n {
                let off = HEADER_LEN + i * KEY_POINTER_LEN;
                let kp = KeyPointer {
                    key: read_key(&data[off..off + KEY_LEN]),
                    block_ptr: LE::read_u64(&data[off + 17..off + 25]),
                    generation: LE::read_u64(&data[off + 25..off + 33]),
                };
                if let Some(prev) = kps.last() {
                    let prev: &KeyPointer = prev;
                    if prev.key >= kp.key {
                        return Err(Error::not_a_node(addr, "key pointers out of order"));
                    }
                }
                kps.push(kp);
            }
            NodeBody::Interior(kps)
        } else {
            if HEADER_LEN + n * ITEM_LEN > data.len() {
                return Err(Error::not_a_node(addr, "item headers exceed block"));
            }
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                let off = HEADER_LEN + i * ITEM_LEN;
                let key = read_key(&data[off..off + KEY_LEN]);
                let body_off = LE::read_u32(&data[off + 17..off + 21]) as usize;
                let body_size = LE::read_u32(&data[off + 21..off + 25]);
                let start = HEADER_LEN + body_off;
                let end = start + body_size as usize;
                if end > data.len() {
                    return Err(Error::not_a_node(
                        addr,
                        format!("item {} body {}..{} exceeds block", i, start, end),
                    ));
                }
                if let Some(prev) = items.last() {
                    let prev: &Item = prev;
                    if prev.key >= key {
                        return Err(Error::not_a_node(addr, "items out of order"));
                    }
                }
                let body = decode_body(key.item_type, &data[start..end]);
                items.push(Item { key, body_size, body });
            }
            NodeBody::Leaf(items)
        };

        Ok(Node { head, body })
    }

    /// Serialize into a node-sized block, checksummed with `csum`. The
    /// inverse of [`Node::unpack`], used to build deterministic test images;
    /// the engine itself never writes.
    ///
    /// Panics if the node does not fit `node_size`.
    pub fn pack(&self, csum: ChecksumKind, node_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; node_size];
        buf[32..48].copy_from_slice(&self.head.fsid);
        LE::write_u64(&mut buf[48..56], self.head.addr);
        LE::write_u64(&mut buf[56..64], self.head.flags);
        buf[64..80].copy_from_slice(&self.head.chunk_tree_uuid);
        LE::write_u64(&mut buf[80..88], self.head.generation);
        LE::write_u64(&mut buf[88..96], self.head.owner);
        LE::write_u32(&mut buf[96..100], self.head.num_items);
        buf[100] = self.head.level;

        match &self.body {
            NodeBody::Interior(kps) => {
                assert_eq!(kps.len(), self.head.num_items as usize);
                assert!(HEADER_LEN + kps.len() * KEY_POINTER_LEN <= node_size, "node overflow");
                for (i, kp) in kps.iter().enumerate() {
                    let off = HEADER_LEN + i * KEY_POINTER_LEN;
                    write_key(&mut buf[off..off + KEY_LEN], &kp.key);
                    LE::write_u64(&mut buf[off + 17..off + 25], kp.block_ptr);
                    LE::write_u64(&mut buf[off + 25..off + 33], kp.generation);
                }
            }
            NodeBody::Leaf(items) => {
                assert_eq!(items.len(), self.head.num_items as usize);
                // Bodies fill the block tail-first, item headers the front.
                let mut data_end = node_size - HEADER_LEN;
                for (i, item) in items.iter().enumerate() {
                    let raw = encode_body(&item.body);
                    assert_eq!(raw.len(), item.body_size as usize, "body_size disagrees with body");
                    let off = HEADER_LEN + i * ITEM_LEN;
                    assert!(
                        raw.len() <= data_end && off + ITEM_LEN <= HEADER_LEN + (data_end - raw.len()),
                        "node overflow"
                    );
                    data_end -= raw.len();
                    write_key(&mut buf[off..off + KEY_LEN], &item.key);
                    LE::write_u32(&mut buf[off + 17..off + 21], data_end as u32);
                    LE::write_u32(&mut buf[off + 21..off + 25], item.body_size);
                    buf[HEADER_LEN + data_end..HEADER_LEN + data_end + raw.len()]
                        .copy_from_slice(&raw);
                }
            }
        }

        let sum = csum.compute(&buf[CSUM_SIZE..]);
        buf[..CSUM_SIZE].copy_from_slice(&sum);
        buf
    }
}

macro_rules! need {
    ($buf:expr, $len:expr, $what:expr) => {
        if $buf.len() < $len {
            return ItemBody::Error {
                err: format!("{}: {} bytes, need {}", $what, $buf.len(), $len),
            };
        }
    };
}

fn decode_body(item_type: ItemType, raw: &[u8]) -> ItemBody {
    match item_type {
        ItemType::ROOT_ITEM => {
            // Legacy bodies stop after the level byte; the uuid block is
            // only present in the extended form.
            need!(raw, 239, "root item");
            let mut uuid = [0u8; UUID_LEN];
            let mut parent_uuid = [0u8; UUID_LEN];
            if raw.len() >= 295 {
                uuid.copy_from_slice(&raw[247..263]);
                parent_uuid.copy_from_slice(&raw[263..279]);
            }
            ItemBody::Root(RootItem {
                generation: LE::read_u64(&raw[160..168]),
                root_dirid: LE::read_u64(&raw[168..176]),
                byte_nr: LE::read_u64(&raw[176..184]),
                bytes_used: LE::read_u64(&raw[192..200]),
                last_snapshot: LE::read_u64(&raw[200..208]),
                flags: LE::read_u64(&raw[208..216]),
                refs: LE::read_u32(&raw[216..220]),
                drop_progress: read_key(&raw[220..237]),
                drop_level: raw[237],
                level: raw[238],
                uuid,
                parent_uuid,
            })
        }
        ItemType::INODE_ITEM => {
            need!(raw, 160, "inode item");
            ItemBody::Inode(InodeItem {
                generation: LE::read_u64(&raw[0..8]),
                transid: LE::read_u64(&raw[8..16]),
                size: LE::read_u64(&raw[16..24]),
                nbytes: LE::read_u64(&raw[24..32]),
                nlink: LE::read_u32(&raw[40..44]),
                uid: LE::read_u32(&raw[44..48]),
                gid: LE::read_u32(&raw[48..52]),
                mode: LE::read_u32(&raw[52..56]),
                flags: LE::read_u64(&raw[64..72]),
            })
        }
        ItemType::INODE_REF => {
            let mut refs = Vec::new();
            let mut pos = 0;
            while pos < raw.len() {
                if pos + 10 > raw.len() {
                    return ItemBody::Error { err: "truncated inode ref".into() };
                }
                let index = LE::read_u64(&raw[pos..pos + 8]);
                let name_len = LE::read_u16(&raw[pos + 8..pos + 10]) as usize;
                if pos + 10 + name_len > raw.len() {
                    return ItemBody::Error { err: "inode ref name exceeds body".into() };
                }
                refs.push(InodeRef {
                    index,
                    name: raw[pos + 10..pos + 10 + name_len].to_vec(),
                });
                pos += 10 + name_len;
            }
            ItemBody::InodeRefs(refs)
        }
        ItemType::DIR_ITEM | ItemType::DIR_INDEX => {
            let mut entries = Vec::new();
            let mut pos = 0;
            while pos < raw.len() {
                if pos + 30 > raw.len() {
                    return ItemBody::Error { err: "truncated dir entry".into() };
                }
                let location = read_key(&raw[pos..pos + 17]);
                let transid = LE::read_u64(&raw[pos + 17..pos + 25]);
                let data_len = LE::read_u16(&raw[pos + 25..pos + 27]) as usize;
                let name_len = LE::read_u16(&raw[pos + 27..pos + 29]) as usize;
                let file_type = raw[pos + 29];
                if pos + 30 + name_len + data_len > raw.len() {
                    return ItemBody::Error { err: "dir entry name exceeds body".into() };
                }
                entries.push(DirEntry {
                    location,
                    transid,
                    file_type,
                    name: raw[pos + 30..pos + 30 + name_len].to_vec(),
                });
                pos += 30 + name_len + data_len;
            }
            ItemBody::DirEntries(entries)
        }
        ItemType::EXTENT_DATA => {
            need!(raw, 21, "file extent");
            let generation = LE::read_u64(&raw[0..8]);
            let ram_bytes = LE::read_u64(&raw[8..16]);
            let compression = raw[16];
            let kind = match raw[20] {
                0 => FileExtentKind::Inline { len: (raw.len() - 21) as u32 },
                t @ (1 | 2) => {
                    need!(raw, 53, "regular file extent");
                    let disk_bytenr = LE::read_u64(&raw[21..29]);
                    let disk_num_bytes = LE::read_u64(&raw[29..37]);
                    let offset = LE::read_u64(&raw[37..45]);
                    let num_bytes = LE::read_u64(&raw[45..53]);
                    if t == 1 {
                        FileExtentKind::Regular { disk_bytenr, disk_num_bytes, offset, num_bytes }
                    } else {
                        FileExtentKind::Prealloc { disk_bytenr, disk_num_bytes, offset, num_bytes }
                    }
                }
                t => return ItemBody::Error { err: format!("file extent type {} unknown", t) },
            };
            ItemBody::FileExtent(FileExtent { generation, ram_bytes, compression, kind })
        }
        ItemType::EXTENT_CSUM => ItemBody::ExtentCsum { raw: raw.to_vec() },
        ItemType::UUID_SUBVOL => {
            if raw.is_empty() || raw.len() % 8 != 0 {
                return ItemBody::Error { err: format!("uuid body of {} bytes", raw.len()) };
            }
            ItemBody::UuidSubvols(raw.chunks_exact(8).map(LE::read_u64).collect())
        }
        _ => ItemBody::Other { raw: raw.to_vec() },
    }
}

/// Re-encode a body. Supports exactly the shapes `decode_body` emits;
/// `Error` bodies cannot be encoded and panic.
fn encode_body(body: &ItemBody) -> Vec<u8> {
    match body {
        ItemBody::Root(ri) => {
            let mut raw = vec![0u8; 439];
            LE::write_u64(&mut raw[160..168], ri.generation);
            LE::write_u64(&mut raw[168..176], ri.root_dirid);
            LE::write_u64(&mut raw[176..184], ri.byte_nr);
            LE::write_u64(&mut raw[192..200], ri.bytes_used);
            LE::write_u64(&mut raw[200..208], ri.last_snapshot);
            LE::write_u64(&mut raw[208..216], ri.flags);
            LE::write_u32(&mut raw[216..220], ri.refs);
            write_key(&mut raw[220..237], &ri.drop_progress);
            raw[237] = ri.drop_level;
            raw[238] = ri.level;
            raw[247..263].copy_from_slice(&ri.uuid);
            raw[263..279].copy_from_slice(&ri.parent_uuid);
            raw
        }
        ItemBody::Inode(ii) => {
            let mut raw = vec![0u8; 160];
            LE::write_u64(&mut raw[0..8], ii.generation);
            LE::write_u64(&mut raw[8..16], ii.transid);
            LE::write_u64(&mut raw[16..24], ii.size);
            LE::write_u64(&mut raw[24..32], ii.nbytes);
            LE::write_u32(&mut raw[40..44], ii.nlink);
            LE::write_u32(&mut raw[44..48], ii.uid);
            LE::write_u32(&mut raw[48..52], ii.gid);
            LE::write_u32(&mut raw[52..56], ii.mode);
            LE::write_u64(&mut raw[64..72], ii.flags);
            raw
        }
        ItemBody::InodeRefs(refs) => {
            let mut raw = Vec::new();
            for r in refs {
                let mut head = [0u8; 10];
                LE::write_u64(&mut head[0..8], r.index);
                LE::write_u16(&mut head[8..10], r.name.len() as u16);
                raw.extend_from_slice(&head);
                raw.extend_from_slice(&r.name);
            }
            raw
        }
        ItemBody::DirEntries(entries) => {
            let mut raw = Vec::new();
            for e in entries {
                let mut head = [0u8; 30];
                write_key(&mut head[0..17], &e.location);
                LE::write_u64(&mut head[17..25], e.transid);
                LE::write_u16(&mut head[25..27], 0);
                LE::write_u16(&mut head[27..29], e.name.len() as u16);
                head[29] = e.file_type;
                raw.extend_from_slice(&head);
                raw.extend_from_slice(&e.name);
            }
            raw
        }
        ItemBody::FileExtent(fe) => {
            let mut raw = vec![0u8; 21];
            LE::write_u64(&mut raw[0..8], fe.generation);
            LE::write_u64(&mut raw[8..16], fe.ram_bytes);
            raw[16] = fe.compression;
            match fe.kind {
                FileExtentKind::Inline { len } => {
                    raw[20] = 0;
                    raw.extend(std::iter::repeat(0).take(len as usize));
                }
                FileExtentKind::Regular { disk_bytenr, disk_num_bytes, offset, num_bytes }
                | FileExtentKind::Prealloc { disk_bytenr, disk_num_bytes, offset, num_bytes } => {
                    raw[20] = if matches!(fe.kind, FileExtentKind::Regular { .. }) { 1 } else { 2 };
                    raw.resize(53, 0);
                    LE::write_u64(&mut raw[21..29], disk_bytenr);
                    LE::write_u64(&mut raw[29..37], disk_num_bytes);
                    LE::write_u64(&mut raw[37..45], offset);
                    LE::write_u64(&mut raw[45..53], num_bytes);
                }
            }
            raw
        }
        ItemBody::ExtentCsum { raw } | ItemBody::Other { raw } => raw.clone(),
        ItemBody::UuidSubvols(ids) => {
            let mut raw = vec![0u8; ids.len() * 8];
            for (i, id) in ids.iter().enumerate() {
                LE::write_u64(&mut raw[i * 8..i * 8 + 8], *id);
            }
            raw
        }
        ItemBody::Error { .. } => panic!("cannot encode an undecodable item body"),
    }
}

impl Item {
    /// Convenience constructor computing `body_size` from the body.
    pub fn new(key: Key, body: ItemBody) -> Item {
        let body_size = encode_body(&body).len() as u32;
        Item { key, body_size, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FS_TREE, ROOT_TREE};

    fn leaf(addr: u64, owner: u64, generation: u64, items: Vec<Item>) -> Node {
        Node {
            head: NodeHeader {
                addr,
                fsid: [7; UUID_LEN],
                flags: 0,
                chunk_tree_uuid: [9; UUID_LEN],
                generation,
                owner,
                num_items: items.len() as u32,
                level: 0,
            },
            body: NodeBody::Leaf(items),
        }
    }

    fn item(obj: u64, typ: ItemType, off: u64) -> Item {
        Item::new(Key::new(obj, typ, off), ItemBody::Other { raw: vec![0xaa; 8] })
    }

    #[test]
    fn unpack_roundtrips_a_leaf() {
        let node = leaf(
            0x4000,
            FS_TREE,
            9,
            vec![
                item(1, ItemType::INODE_ITEM, 0),
                item(1, ItemType::INODE_REF, 3),
                item(2, ItemType::INODE_ITEM, 0),
            ],
        );
        let bytes = node.pack(ChecksumKind::Crc32c, 4096);
        let back = Node::unpack(0x4000, ChecksumKind::Crc32c, &bytes).unwrap();
        assert_eq!(back.head, node.head);
        assert_eq!(back.leaf().unwrap().len(), 3);
        assert_eq!(back.min_key(), Key::new(1, ItemType::INODE_ITEM, 0));
        assert_eq!(back.max_key(), Key::new(2, ItemType::INODE_ITEM, 0));
    }

    #[test]
    fn unpack_rejects_bad_checksum() {
        let node = leaf(0x4000, FS_TREE, 9, vec![item(1, ItemType::INODE_ITEM, 0)]);
        let mut bytes = node.pack(ChecksumKind::Crc32c, 4096);
        bytes[200] ^= 1;
        let err = Node::unpack(0x4000, ChecksumKind::Crc32c, &bytes).unwrap_err();
        assert!(matches!(err, Error::NotANode { .. }), "{err}");
    }

    #[test]
    fn unpack_rejects_unordered_items() {
        let mut node = leaf(
            0x4000,
            FS_TREE,
            9,
            vec![item(2, ItemType::INODE_ITEM, 0), item(1, ItemType::INODE_ITEM, 0)],
        );
        // pack() writes whatever order it is given; unpack must refuse it.
        node.head.num_items = 2;
        let bytes = node.pack(ChecksumKind::Crc32c, 4096);
        assert!(Node::unpack(0x4000, ChecksumKind::Crc32c, &bytes).is_err());
    }

    #[test]
    fn unpack_rejects_empty_node() {
        let node = Node {
            head: NodeHeader {
                addr: 0x4000,
                fsid: [0; 16],
                flags: 0,
                chunk_tree_uuid: [0; 16],
                generation: 1,
                owner: ROOT_TREE,
                num_items: 0,
                level: 0,
            },
            body: NodeBody::Leaf(vec![]),
        };
        let bytes = node.pack(ChecksumKind::Crc32c, 4096);
        assert!(Node::unpack(0x4000, ChecksumKind::Crc32c, &bytes).is_err());
    }

    #[test]
    fn root_item_body_roundtrip() {
        let ri = RootItem {
            generation: 42,
            root_dirid: 256,
            byte_nr: 0x8000,
            bytes_used: 4096,
            last_snapshot: 40,
            flags: 0,
            refs: 1,
            drop_progress: Key::ZERO,
            drop_level: 0,
            level: 1,
            uuid: [3; 16],
            parent_uuid: [0; 16],
        };
        let raw = encode_body(&ItemBody::Root(ri.clone()));
        assert_eq!(decode_body(ItemType::ROOT_ITEM, &raw), ItemBody::Root(ri));
    }

    #[test]
    fn truncated_root_item_is_an_error_body() {
        let body = decode_body(ItemType::ROOT_ITEM, &[0u8; 64]);
        assert!(matches!(body, ItemBody::Error { .. }));
    }

    #[test]
    fn dir_entries_roundtrip() {
        let entries = vec![
            DirEntry {
                location: Key::new(257, ItemType::INODE_ITEM, 0),
                transid: 7,
                file_type: 1,
                name: b"hello.txt".to_vec(),
            },
            DirEntry {
                location: Key::new(258, ItemType::INODE_ITEM, 0),
                transid: 7,
                file_type: 2,
                name: b"sub".to_vec(),
            },
        ];
        let raw = encode_body(&ItemBody::DirEntries(entries.clone()));
        assert_eq!(
            decode_body(ItemType::DIR_ITEM, &raw),
            ItemBody::DirEntries(entries)
        );
    }

    #[test]
    fn unknown_type_stays_raw() {
        let body = decode_body(ItemType(0x33), &[1, 2, 3]);
        assert_eq!(body, ItemBody::Other { raw: vec![1, 2, 3] });
    }
}
