//! Shared fixtures for the tree-layer tests: a small two-level tree served
//! from an in-memory image.

use crate::checksum::ChecksumKind;
use crate::config::SalvageConfiguration;
use crate::format::{
    Item, ItemBody, ItemType, Key, KeyPointer, Node, NodeBody, NodeHeader, Superblock, FS_TREE,
};
use crate::node_source::{MemReader, NodeSource};
use crate::tree::TreeRoot;

/// Item type used by fixture keys; deliberately one the body decoder does
/// not interpret.
pub(crate) const X: ItemType = ItemType(0x77);

pub(crate) const FSID: [u8; 16] = [0x11; 16];
pub(crate) const NODE_SIZE: usize = 4096;

pub(crate) fn superblock() -> Superblock {
    Superblock {
        fsid: FSID,
        flags: 0,
        generation: 7,
        root: 0,
        chunk_root: 0,
        log_root: 0,
        log_root_transid: 0,
        total_bytes: 1 << 30,
        bytes_used: 0,
        sector_size: 4096,
        node_size: NODE_SIZE as u32,
        chunk_root_generation: 0,
        incompat_flags: 0,
        csum_type: ChecksumKind::Crc32c,
        root_level: 0,
        chunk_root_level: 0,
        log_root_level: 0,
        metadata_uuid: [0; 16],
        block_group_root: 0,
        block_group_root_generation: 0,
        block_group_root_level: 0,
        chunk_tree_uuid: [0x22; 16],
        sys_chunk_array_size: 0,
        sys_chunk_array: vec![0; 2048],
    }
}

fn header(addr: u64, owner: u64, generation: u64, num_items: u32, level: u8) -> NodeHeader {
    NodeHeader {
        addr,
        fsid: FSID,
        flags: 0,
        chunk_tree_uuid: [0x22; 16],
        generation,
        owner,
        num_items,
        level,
    }
}

pub(crate) fn leaf_node(addr: u64, owner: u64, generation: u64, keys: &[Key]) -> Node {
    let items: Vec<Item> = keys
        .iter()
        .map(|k| Item::new(*k, ItemBody::Other { raw: vec![0xab; 8] }))
        .collect();
    Node {
        head: header(addr, owner, generation, items.len() as u32, 0),
        body: NodeBody::Leaf(items),
    }
}

pub(crate) fn interior_node(
    addr: u64,
    owner: u64,
    generation: u64,
    level: u8,
    kps: &[(Key, u64, u64)],
) -> Node {
    let kps: Vec<KeyPointer> = kps
        .iter()
        .map(|(key, block_ptr, generation)| KeyPointer {
            key: *key,
            block_ptr: *block_ptr,
            generation: *generation,
        })
        .collect();
    Node {
        head: header(addr, owner, generation, kps.len() as u32, level),
        body: NodeBody::Interior(kps),
    }
}

pub(crate) fn build_source(nodes: &[Node], bad: &[u64]) -> NodeSource<MemReader> {
    let sb = superblock();
    let mut reader = MemReader::new();
    reader.insert_superblock(&sb);
    for node in nodes {
        reader.insert_node(node, sb.csum_type, NODE_SIZE);
    }
    for addr in bad {
        reader.corrupt(*addr, 500);
    }
    NodeSource::new(reader, &SalvageConfiguration::default()).unwrap()
}

/// Two leaves under one interior root, owner tree 5:
/// `0x90000(lvl 1) -> { 0x20000: (1,X,0)(2,X,0), 0x30000: (3,X,0)(4,X,0) }`.
pub(crate) fn fixture() -> (NodeSource<MemReader>, TreeRoot) {
    fixture_corrupt(&[])
}

pub(crate) fn fixture_corrupt(bad: &[u64]) -> (NodeSource<MemReader>, TreeRoot) {
    let nodes = vec![
        interior_node(
            0x90000,
            FS_TREE,
            7,
            1,
            &[
                (Key::new(1, X, 0), 0x20000, 6),
                (Key::new(3, X, 0), 0x30000, 6),
            ],
        ),
        leaf_node(0x20000, FS_TREE, 6, &[Key::new(1, X, 0), Key::new(2, X, 0)]),
        leaf_node(0x30000, FS_TREE, 6, &[Key::new(3, X, 0), Key::new(4, X, 0)]),
    ];
    let source = build_source(&nodes, bad);
    let root = TreeRoot { id: FS_TREE, root_addr: 0x90000, level: 1, generation: 7 };
    (source, root)
}

/// A three-level tree with duplicate-free keys spread over four leaves, for
/// cursor iteration tests:
/// root 0x90000(lvl 2) -> 0x20000, 0x30000 (lvl 1) -> four leaves.
pub(crate) fn deep_fixture() -> (NodeSource<MemReader>, TreeRoot) {
    let k = |o| Key::new(o, X, 0);
    let nodes = vec![
        interior_node(
            0x90000,
            FS_TREE,
            9,
            2,
            &[(k(10), 0x20000, 8), (k(30), 0x30000, 8)],
        ),
        interior_node(
            0x20000,
            FS_TREE,
            8,
            1,
            &[(k(10), 0x40000, 7), (k(20), 0x50000, 7)],
        ),
        interior_node(
            0x30000,
            FS_TREE,
            8,
            1,
            &[(k(30), 0x60000, 7), (k(40), 0x70000, 7)],
        ),
        leaf_node(0x40000, FS_TREE, 7, &[k(10), k(11)]),
        leaf_node(0x50000, FS_TREE, 7, &[k(20), k(21)]),
        leaf_node(0x60000, FS_TREE, 7, &[k(30), k(31)]),
        leaf_node(0x70000, FS_TREE, 7, &[k(40), k(41)]),
    ];
    let source = build_source(&nodes, &[]);
    let root = TreeRoot { id: FS_TREE, root_addr: 0x90000, level: 2, generation: 9 };
    (source, root)
}
