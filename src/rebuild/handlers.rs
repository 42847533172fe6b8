//! Per-item-type want rules.
//!
//! One arm per item shape the rebuild cares about: what must also exist in
//! a tree for this item to make sense. The driver stays agnostic; this
//! table is the only place that knows the schema.

use log::trace;

use super::want::WantCtx;
use crate::format::{
    FileExtentKind, Item, ItemBody, ItemType, Key, CSUM_TREE, EXTENT_CSUM_OBJECTID, ROOT_TREE,
};
use crate::node_source::ByteReader;
use crate::Result;

pub(crate) fn item_wants<R: ByteReader>(
    ctx: &WantCtx<'_, R>,
    tree: u64,
    key: Key,
    item: &Item,
) -> Result<()> {
    match &item.body {
        ItemBody::Root(_) => {
            // The referenced tree becomes rebuildable.
            ctx.push_tree(key.object_id);
        }

        ItemBody::DirEntries(entries) => {
            for entry in entries {
                match entry.location.item_type {
                    ItemType::INODE_ITEM => {
                        ctx.want_off(tree, entry.location, "dir entry target inode")?;
                    }
                    ItemType::ROOT_ITEM => {
                        ctx.want(
                            ROOT_TREE,
                            entry.location.object_id,
                            ItemType::ROOT_ITEM,
                            "dir entry subvolume",
                        )?;
                        ctx.push_tree(entry.location.object_id);
                    }
                    other => trace!("dir entry points at unexpected type {}", other),
                }

                // The same name must exist under the sibling directory
                // index; names are compared because the two are keyed
                // differently (hash vs. position).
                let sibling = if key.item_type == ItemType::DIR_ITEM {
                    ItemType::DIR_INDEX
                } else {
                    ItemType::DIR_ITEM
                };
                let name = entry.name.clone();
                ctx.want_func(
                    tree,
                    key.object_id,
                    sibling,
                    &move |candidate: &Item| match &candidate.body {
                        ItemBody::DirEntries(entries) => {
                            entries.iter().any(|e| e.name == name)
                        }
                        _ => false,
                    },
                    "sibling dir entry",
                )?;
            }
            // A directory entry implies its directory's inode.
            ctx.want(tree, key.object_id, ItemType::INODE_ITEM, "directory inode")?;
        }

        ItemBody::Inode(_) => {
            ctx.want(tree, key.object_id, ItemType::INODE_REF, "inode backref")?;
        }

        ItemBody::InodeRefs(_) => {
            ctx.want(tree, key.object_id, ItemType::INODE_ITEM, "referenced inode")?;
            // The key offset names the parent directory.
            if key.offset != 0 && key.offset != key.object_id {
                ctx.want(tree, key.offset, ItemType::INODE_ITEM, "parent directory inode")?;
            }
        }

        ItemBody::FileExtent(fe) => {
            if let FileExtentKind::Regular { disk_bytenr, disk_num_bytes, .. } = fe.kind {
                if disk_bytenr != 0 && disk_num_bytes != 0 {
                    let sb = ctx.forest().source().superblock();
                    let alg_size = sb.csum_type.digest_len() as u64;
                    let block_size = sb.sector_size as u64;
                    let run_len = move |body_size: u32| -> u64 {
                        (body_size as u64 / alg_size) * block_size
                    };
                    ctx.want_range(
                        CSUM_TREE,
                        EXTENT_CSUM_OBJECTID,
                        ItemType::EXTENT_CSUM,
                        disk_bytenr,
                        disk_bytenr + disk_num_bytes,
                        &run_len,
                        "extent checksums",
                    )?;
                }
            }
        }

        ItemBody::UuidSubvols(ids) => {
            for id in ids {
                ctx.want(ROOT_TREE, *id, ItemType::ROOT_ITEM, "uuid mapped subvolume")?;
            }
        }

        // Checksum runs, uninterpreted and undecodable bodies demand
        // nothing further.
        ItemBody::ExtentCsum { .. } | ItemBody::Other { .. } | ItemBody::Error { .. } => {}
    }
    Ok(())
}
