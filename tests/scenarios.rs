//! End-to-end scenarios over deterministic in-memory images. Node
//! addresses are spaced by the 4 KiB node size; otherwise the shapes follow
//! small hand-drawn trees.

use std::sync::Arc;

use btrfs_salvage::cache::AdaptiveCache;
use btrfs_salvage::checksum::ChecksumKind;
use btrfs_salvage::format::{
    InodeItem, InodeRef, Item, ItemBody, ItemType, Key, KeyPointer, Node, NodeBody, NodeHeader,
    RootItem, Superblock, FS_TREE, ROOT_TREE,
};
use btrfs_salvage::graph::Graph;
use btrfs_salvage::node_source::{MemReader, NodeSource};
use btrfs_salvage::rebuild::{RebuildDriver, RebuildEvent};
use btrfs_salvage::scan::scan_device;
use btrfs_salvage::tree::{SearchExactKey, SearchObject, TreeRoot, TreeView};
use btrfs_salvage::{CancelToken, Error, SalvageConfiguration};

const NODE_SIZE: usize = 4096;
const FSID: [u8; 16] = [0x42; 16];
const X: ItemType = ItemType(0x77);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn superblock() -> Superblock {
    Superblock {
        fsid: FSID,
        flags: 0,
        generation: 10,
        root: 0,
        chunk_root: 0,
        log_root: 0,
        log_root_transid: 0,
        total_bytes: 1 << 30,
        bytes_used: 1 << 20,
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

fn leaf(addr: u64, owner: u64, generation: u64, items: Vec<Item>) -> Node {
    Node {
        head: header(addr, owner, generation, items.len() as u32, 0),
        body: NodeBody::Leaf(items),
    }
}

fn interior(addr: u64, owner: u64, generation: u64, level: u8, kps: Vec<(Key, u64, u64)>) -> Node {
    let kps: Vec<KeyPointer> = kps
        .into_iter()
        .map(|(key, block_ptr, generation)| KeyPointer { key, block_ptr, generation })
        .collect();
    Node {
        head: header(addr, owner, generation, kps.len() as u32, level),
        body: NodeBody::Interior(kps),
    }
}

fn opaque(obj: u64, typ: ItemType, off: u64) -> Item {
    Item::new(Key::new(obj, typ, off), ItemBody::Other { raw: vec![0xcd; 8] })
}

fn source_for(sb: &Superblock, nodes: &[Node]) -> NodeSource<MemReader> {
    let mut reader = MemReader::new();
    reader.insert_superblock(sb);
    for node in nodes {
        reader.insert_node(node, sb.csum_type, NODE_SIZE);
    }
    NodeSource::new(reader, &SalvageConfiguration::default()).unwrap()
}

/// The S1 image: tree 5, interior root over two leaves holding keys
/// (1,X,0)..(4,X,0).
fn s1_view() -> (NodeSource<MemReader>, TreeRoot) {
    let sb = superblock();
    let nodes = vec![
        interior(
            0x90000,
            FS_TREE,
            7,
            1,
            vec![(Key::new(1, X, 0), 0x20000, 6), (Key::new(3, X, 0), 0x30000, 6)],
        ),
        leaf(0x20000, FS_TREE, 6, vec![opaque(1, X, 0), opaque(2, X, 0)]),
        leaf(0x30000, FS_TREE, 6, vec![opaque(3, X, 0), opaque(4, X, 0)]),
    ];
    let source = source_for(&sb, &nodes);
    (source, TreeRoot { id: FS_TREE, root_addr: 0x90000, level: 1, generation: 7 })
}

#[test]
fn s1_exact_lookup_lands_on_the_right_leaf_slot() {
    let (source, root) = s1_view();
    let view = TreeView::new(&source, root);
    let (path, item) = view.search(&SearchExactKey(Key::new(3, X, 0))).unwrap();
    assert_eq!(item.key, Key::new(3, X, 0));
    assert_eq!(path.node_addr(), Some(0x30000));
    assert_eq!(path.item_slot(), Some(0));
}

#[test]
fn s2_missing_key_is_err_no_item() {
    let (source, root) = s1_view();
    let view = TreeView::new(&source, root);
    let err = view.lookup(Key::new(5, X, 0)).unwrap_err();
    assert!(matches!(err, Error::NoItem));
    assert!(err.is_not_exist());
}

#[test]
fn s3_object_range_search() {
    let (source, root) = s1_view();
    let view = TreeView::new(&source, root);
    let mut out = Vec::new();
    view.search_all(&SearchObject(2), &CancelToken::new(), &mut out).unwrap();
    let keys: Vec<Key> = out.iter().map(|(_, item)| item.key).collect();
    assert_eq!(keys, vec![Key::new(2, X, 0)]);
}

fn root_item(byte_nr: u64, level: u8, generation: u64) -> RootItem {
    RootItem {
        generation,
        root_dirid: 256,
        byte_nr,
        bytes_used: 0,
        last_snapshot: 0,
        flags: 0,
        refs: 1,
        drop_progress: Key::ZERO,
        drop_level: 0,
        level,
        uuid: [0; 16],
        parent_uuid: [0; 16],
    }
}

/// S4 and the driver fixed point share one image: the ROOT_ITEM for tree 5
/// references r1 (one leaf); the better candidate r2 reaches both leaves,
/// and the inode in leaf A demands the backref that only leaf B holds.
#[test]
fn s4_rebuild_augments_tree_5_through_r2() {
    init_logs();
    let mut sb = superblock();
    sb.root = 0x80000;
    sb.root_level = 0;

    let inode_key = Key::new(256, ItemType::INODE_ITEM, 0);
    let ref_key = Key::new(256, ItemType::INODE_REF, 256);
    let nodes = vec![
        leaf(
            0x80000,
            ROOT_TREE,
            10,
            vec![Item::new(
                Key::new(FS_TREE, ItemType::ROOT_ITEM, 0),
                ItemBody::Root(root_item(0x90000, 1, 7)),
            )],
        ),
        // r1: the referenced root, reaching leaf A only.
        interior(0x90000, FS_TREE, 7, 1, vec![(inode_key, 0x20000, 6)]),
        // r2: unreferenced candidate reaching both leaves.
        interior(
            0x40000,
            FS_TREE,
            8,
            1,
            vec![(inode_key, 0x20000, 6), (ref_key, 0x30000, 6)],
        ),
        // Leaf A: an inode whose backref lives in leaf B.
        leaf(
            0x20000,
            FS_TREE,
            6,
            vec![Item::new(
                inode_key,
                ItemBody::Inode(InodeItem {
                    generation: 6,
                    transid: 6,
                    size: 0,
                    nbytes: 0,
                    nlink: 1,
                    uid: 0,
                    gid: 0,
                    mode: 0o40755,
                    flags: 0,
                }),
            )],
        ),
        // Leaf B: the inode backref.
        leaf(
            0x30000,
            FS_TREE,
            6,
            vec![Item::new(
                ref_key,
                ItemBody::InodeRefs(vec![InodeRef { index: 0, name: b"..".to_vec() }]),
            )],
        ),
    ];

    let source = Arc::new(source_for(&sb, &nodes));
    let graph = Arc::new(
        scan_device(&source, &SalvageConfiguration::default(), &CancelToken::new()).unwrap(),
    );
    let (tx, rx) = crossbeam_channel::unbounded();
    let driver =
        RebuildDriver::new(source, graph, &SalvageConfiguration::default()).with_report(tx);
    let report = driver.rebuild(&CancelToken::new()).unwrap();
    assert_eq!(report.roots_added, 1, "exactly the augment r2 is added by passes: {report:?}");

    let events: Vec<RebuildEvent> = rx.try_iter().collect();
    assert!(events.contains(&RebuildEvent::RootAdded { tree: FS_TREE, addr: 0x40000 }));
    assert!(events.contains(&RebuildEvent::Finished { passes: report.passes }));

    let forest = driver.forest();
    let tree = forest.tree(FS_TREE).unwrap();
    let roots: Vec<u64> = tree.read().roots().iter().copied().collect();
    assert!(roots.contains(&0x90000), "referenced root accepted: {roots:?}");
    assert!(roots.contains(&0x40000), "augment accepted the better candidate: {roots:?}");

    let keys: Vec<Key> = forest
        .with_items(FS_TREE, |ix| ix.keys().collect())
        .unwrap();
    assert_eq!(keys, vec![inode_key, ref_key], "all items included after augment");

    // The included set answers reads.
    let item = forest.read_item(FS_TREE, ref_key).unwrap();
    assert!(matches!(item.body, ItemBody::InodeRefs(_)));
}

/// S5: a parent-tree leaf is legal for the child only strictly before the
/// snapshot cutoff. Exercised end to end in the rebuilt-tree unit tests;
/// here the same rule is checked through the forest's public indexes.
#[test]
fn s5_snapshot_cutoff_bounds_leaf_legality() {
    init_logs();
    // Parent P=5 owns two leaves, generations 9 and 10; child C=257 was
    // snapshotted at generation 10 from P's root.
    let mut sb = superblock();
    sb.root = 0x80000;
    sb.root_level = 0;

    let parent_uuid = {
        let mut u = [0u8; 16];
        u[0] = 0x05;
        u
    };
    let uuid_tree_root = 0x90000;
    // UUID tree maps parent_uuid -> tree 5.
    let uuid_key = Key::new(0x05, ItemType::UUID_SUBVOL, 0);

    let mut child_root = root_item(0x40000, 0, 11);
    child_root.parent_uuid = parent_uuid;

    let nodes = vec![
        leaf(
            0x80000,
            ROOT_TREE,
            10,
            vec![
                Item::new(
                    Key::new(FS_TREE, ItemType::ROOT_ITEM, 0),
                    ItemBody::Root(root_item(0x20000, 0, 9)),
                ),
                Item::new(
                    Key::new(9, ItemType::ROOT_ITEM, 0),
                    ItemBody::Root(root_item(uuid_tree_root, 0, 9)),
                ),
                Item::new(
                    Key::new(257, ItemType::ROOT_ITEM, 10),
                    ItemBody::Root(child_root),
                ),
            ],
        ),
        leaf(
            uuid_tree_root,
            9,
            9,
            vec![Item::new(uuid_key, ItemBody::UuidSubvols(vec![5]))],
        ),
        // Parent leaves: one before the cutoff, one at it.
        leaf(0x20000, FS_TREE, 9, vec![opaque(100, X, 0)]),
        leaf(0x30000, FS_TREE, 10, vec![opaque(200, X, 0)]),
        // The child's own root leaf.
        leaf(0x40000, 257, 11, vec![opaque(300, X, 0)]),
    ];

    let source = Arc::new(source_for(&sb, &nodes));
    let graph = Arc::new(
        scan_device(&source, &SalvageConfiguration::default(), &CancelToken::new()).unwrap(),
    );
    let driver = RebuildDriver::new(source, graph, &SalvageConfiguration::default());
    driver.rebuild(&CancelToken::new()).unwrap();

    let forest = driver.forest();
    let child = forest.tree(257).unwrap();
    assert_eq!(child.read().parent, Some(5));
    assert_eq!(child.read().parent_generation, 10);

    forest
        .with_leaf_index(257, |ix| {
            assert!(
                ix.roots_for(0x20000).is_some(),
                "parent leaf at generation 9 is legal for the child"
            );
            assert!(
                ix.roots_for(0x30000).is_none(),
                "parent leaf at the cutoff generation is not"
            );
            assert!(ix.roots_for(0x40000).is_some(), "own leaves are always legal");
        })
        .unwrap();
}

#[test]
fn s6_capacity_two_cache_evicts_once_and_reloads() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &AtomicUsize, v: u64) -> impl FnOnce() -> btrfs_salvage::Result<u64> + '_ {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        }
    }

    let cache: AdaptiveCache<u64, u64> = AdaptiveCache::new(2);
    let loads = AtomicUsize::new(0);
    drop(cache.acquire(1, counting(&loads, 10)).unwrap());
    drop(cache.acquire(2, counting(&loads, 20)).unwrap());
    drop(cache.acquire(3, counting(&loads, 30)).unwrap());
    assert_eq!(loads.load(Ordering::SeqCst), 3);
    let g = cache.acquire(1, counting(&loads, 10)).unwrap();
    assert_eq!(*g, 10);
    assert_eq!(loads.load(Ordering::SeqCst), 4, "key 1 was evicted exactly once and reloaded");
}

#[test]
fn s7_pointer_loops_fail_the_final_check() {
    let sb = superblock();
    let mut graph = Graph::new(&sb);
    graph.insert_node(&interior(0x10000, FS_TREE, 7, 1, vec![(Key::new(1, X, 0), 0x20000, 6)]));
    graph.insert_node(&interior(0x20000, FS_TREE, 6, 1, vec![(Key::new(1, X, 0), 0x10000, 5)]));
    let err = graph.final_check(|_| None).unwrap_err();
    match err {
        Error::Loop { addr } => assert!(addr == 0x10000 || addr == 0x20000),
        other => panic!("expected a loop diagnostic, got {other}"),
    }
}

#[test]
fn cancelled_rebuild_returns_promptly_with_partial_state() {
    let mut sb = superblock();
    sb.root = 0x80000;
    sb.root_level = 0;
    let nodes = vec![leaf(
        0x80000,
        ROOT_TREE,
        10,
        vec![Item::new(
            Key::new(FS_TREE, ItemType::ROOT_ITEM, 0),
            ItemBody::Root(root_item(0x20000, 0, 7)),
        )],
    )];
    let source = Arc::new(source_for(&sb, &nodes));
    let graph = Arc::new(
        scan_device(&source, &SalvageConfiguration::default(), &CancelToken::new()).unwrap(),
    );
    let driver = RebuildDriver::new(source, graph, &SalvageConfiguration::default());

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = driver.rebuild(&cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}
