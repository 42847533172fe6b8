//! The superblock: the one block read from a fixed address, naming the four
//! well-known tree roots and supplying global parameters.

use byteorder::{ByteOrder, LittleEndian as LE};

use super::{Key, Uuid, BLOCK_GROUP_TREE, CHUNK_TREE, ROOT_TREE, TREE_LOG, UUID_LEN};
use crate::checksum::{ChecksumKind, CSUM_SIZE};
use crate::{Error, Result};

/// Logical address the byte reader must resolve to the superblock copy.
pub const SUPERBLOCK_ADDR: u64 = 65536;
pub const SUPERBLOCK_LEN: usize = 4096;

const MAGIC: u64 = 0x4D5F_5366_5248_425F; // "_BHRfS_M"
const SYS_CHUNK_ARRAY_OFF: usize = 811;
const SYS_CHUNK_ARRAY_LEN: usize = 2048;
const INCOMPAT_METADATA_UUID: u64 = 1 << 10;

/// One well-known root as recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot {
    pub tree_id: u64,
    pub addr: u64,
    pub generation: u64,
    pub level: u8,
}

/// One stripe of a bootstrap chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: Uuid,
}

/// A chunk from the superblock's bootstrap array; enough to seed an external
/// logical-to-physical map before the chunk tree is readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysChunk {
    pub logical: u64,
    pub length: u64,
    pub owner: u64,
    pub type_flags: u64,
    pub stripes: Vec<ChunkStripe>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub fsid: Uuid,
    pub flags: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub log_root_transid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub sector_size: u32,
    pub node_size: u32,
    pub chunk_root_generation: u64,
    pub incompat_flags: u64,
    pub csum_type: ChecksumKind,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub metadata_uuid: Uuid,
    pub block_group_root: u64,
    pub block_group_root_generation: u64,
    pub block_group_root_level: u8,
    pub chunk_tree_uuid: Uuid,
    pub sys_chunk_array_size: u32,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    pub fn unpack(data: &[u8]) -> Result<Superblock> {
        if data.len() < SUPERBLOCK_LEN {
            return Err(Error::decode(SUPERBLOCK_ADDR, "superblock block too short"));
        }
        if LE::read_u64(&data[64..72]) != MAGIC {
            return Err(Error::decode(SUPERBLOCK_ADDR, "bad magic"));
        }
        let csum_raw = LE::read_u16(&data[196..198]);
        let csum_type = ChecksumKind::from_raw(csum_raw).ok_or_else(|| {
            Error::decode(SUPERBLOCK_ADDR, format!("unsupported checksum type {}", csum_raw))
        })?;
        if !csum_type.verify(&data[..CSUM_SIZE], &data[CSUM_SIZE..SUPERBLOCK_LEN]) {
            return Err(Error::decode(SUPERBLOCK_ADDR, "superblock checksum mismatch"));
        }

        let mut fsid = [0u8; UUID_LEN];
        fsid.copy_from_slice(&data[32..48]);
        let mut metadata_uuid = [0u8; UUID_LEN];
        metadata_uuid.copy_from_slice(&data[571..587]);
        let mut chunk_tree_uuid = [0u8; UUID_LEN];
        chunk_tree_uuid.copy_from_slice(&data[612..628]);

        let sys_chunk_array_size = LE::read_u32(&data[160..164]);
        if sys_chunk_array_size as usize > SYS_CHUNK_ARRAY_LEN {
            return Err(Error::decode(SUPERBLOCK_ADDR, "sys chunk array size out of range"));
        }

        Ok(Superblock {
            fsid,
            flags: LE::read_u64(&data[56..64]),
            generation: LE::read_u64(&data[72..80]),
            root: LE::read_u64(&data[80..88]),
            chunk_root: LE::read_u64(&data[88..96]),
            log_root: LE::read_u64(&data[96..104]),
            log_root_transid: LE::read_u64(&data[104..112]),
            total_bytes: LE::read_u64(&data[112..120]),
            bytes_used: LE::read_u64(&data[120..128]),
            sector_size: LE::read_u32(&data[144..148]),
            node_size: LE::read_u32(&data[148..152]),
            chunk_root_generation: LE::read_u64(&data[164..172]),
            incompat_flags: LE::read_u64(&data[188..196]),
            csum_type,
            root_level: data[198],
            chunk_root_level: data[199],
            log_root_level: data[200],
            metadata_uuid,
            block_group_root: LE::read_u64(&data[595..603]),
            block_group_root_generation: LE::read_u64(&data[603..611]),
            block_group_root_level: data[611],
            chunk_tree_uuid,
            sys_chunk_array_size,
            sys_chunk_array: data
                [SYS_CHUNK_ARRAY_OFF..SYS_CHUNK_ARRAY_OFF + SYS_CHUNK_ARRAY_LEN]
                .to_vec(),
        })
    }

    /// Serialize back into a superblock-sized block. Test-image support.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SUPERBLOCK_LEN];
        buf[32..48].copy_from_slice(&self.fsid);
        LE::write_u64(&mut buf[48..56], SUPERBLOCK_ADDR);
        LE::write_u64(&mut buf[56..64], self.flags);
        LE::write_u64(&mut buf[64..72], MAGIC);
        LE::write_u64(&mut buf[72..80], self.generation);
        LE::write_u64(&mut buf[80..88], self.root);
        LE::write_u64(&mut buf[88..96], self.chunk_root);
        LE::write_u64(&mut buf[96..104], self.log_root);
        LE::write_u64(&mut buf[104..112], self.log_root_transid);
        LE::write_u64(&mut buf[112..120], self.total_bytes);
        LE::write_u64(&mut buf[120..128], self.bytes_used);
        LE::write_u32(&mut buf[144..148], self.sector_size);
        LE::write_u32(&mut buf[148..152], self.node_size);
        LE::write_u32(&mut buf[160..164], self.sys_chunk_array_size);
        LE::write_u64(&mut buf[164..172], self.chunk_root_generation);
        LE::write_u64(&mut buf[188..196], self.incompat_flags);
        LE::write_u16(&mut buf[196..198], self.csum_type.to_raw());
        buf[198] = self.root_level;
        buf[199] = self.chunk_root_level;
        buf[200] = self.log_root_level;
        buf[571..587].copy_from_slice(&self.metadata_uuid);
        LE::write_u64(&mut buf[595..603], self.block_group_root);
        LE::write_u64(&mut buf[603..611], self.block_group_root_generation);
        buf[611] = self.block_group_root_level;
        buf[612..628].copy_from_slice(&self.chunk_tree_uuid);
        let n = self.sys_chunk_array.len().min(SYS_CHUNK_ARRAY_LEN);
        buf[SYS_CHUNK_ARRAY_OFF..SYS_CHUNK_ARRAY_OFF + n]
            .copy_from_slice(&self.sys_chunk_array[..n]);
        let sum = self.csum_type.compute(&buf[CSUM_SIZE..]);
        buf[..CSUM_SIZE].copy_from_slice(&sum);
        buf
    }

    /// The UUID nodes must carry in their fsid field.
    pub fn effective_metadata_uuid(&self) -> Uuid {
        if self.incompat_flags & INCOMPAT_METADATA_UUID != 0 {
            self.metadata_uuid
        } else {
            self.fsid
        }
    }

    /// The four well-known roots, zero-address slots included.
    pub fn root_slots(&self) -> [RootSlot; 4] {
        [
            RootSlot {
                tree_id: ROOT_TREE,
                addr: self.root,
                generation: self.generation,
                level: self.root_level,
            },
            RootSlot {
                tree_id: CHUNK_TREE,
                addr: self.chunk_root,
                generation: self.chunk_root_generation,
                level: self.chunk_root_level,
            },
            RootSlot {
                tree_id: TREE_LOG,
                addr: self.log_root,
                generation: self.log_root_transid,
                level: self.log_root_level,
            },
            RootSlot {
                tree_id: BLOCK_GROUP_TREE,
                addr: self.block_group_root,
                generation: self.block_group_root_generation,
                level: self.block_group_root_level,
            },
        ]
    }

    /// Decode the bootstrap chunk array.
    pub fn bootstrap_chunks(&self) -> Result<Vec<SysChunk>> {
        let raw = &self.sys_chunk_array;
        let size = (self.sys_chunk_array_size as usize).min(raw.len());
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < size {
            if pos + 17 + 48 > size {
                return Err(Error::decode(SUPERBLOCK_ADDR, "truncated sys chunk entry"));
            }
            let key = Key {
                object_id: LE::read_u64(&raw[pos..pos + 8]),
                item_type: super::ItemType(raw[pos + 8]),
                offset: LE::read_u64(&raw[pos + 9..pos + 17]),
            };
            let c = pos + 17;
            let length = LE::read_u64(&raw[c..c + 8]);
            let owner = LE::read_u64(&raw[c + 8..c + 16]);
            let type_flags = LE::read_u64(&raw[c + 24..c + 32]);
            let num_stripes = LE::read_u16(&raw[c + 44..c + 46]) as usize;
            let stripes_off = c + 48;
            if stripes_off + num_stripes * 32 > size {
                return Err(Error::decode(SUPERBLOCK_ADDR, "sys chunk stripes exceed array"));
            }
            let mut stripes = Vec::with_capacity(num_stripes);
            for s in 0..num_stripes {
                let o = stripes_off + s * 32;
                let mut dev_uuid = [0u8; UUID_LEN];
                dev_uuid.copy_from_slice(&raw[o + 16..o + 32]);
                stripes.push(ChunkStripe {
                    devid: LE::read_u64(&raw[o..o + 8]),
                    offset: LE::read_u64(&raw[o + 8..o + 16]),
                    dev_uuid,
                });
            }
            out.push(SysChunk { logical: key.offset, length, owner, type_flags, stripes });
            pos = stripes_off + num_stripes * 32;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ItemType;

    fn sample() -> Superblock {
        Superblock {
            fsid: [0x11; 16],
            flags: 0,
            generation: 100,
            root: 0x10000,
            chunk_root: 0x20000,
            log_root: 0,
            log_root_transid: 0,
            total_bytes: 1 << 30,
            bytes_used: 1 << 20,
            sector_size: 4096,
            node_size: 4096,
            chunk_root_generation: 90,
            incompat_flags: 0,
            csum_type: ChecksumKind::Crc32c,
            root_level: 1,
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

    #[test]
    fn pack_unpack_roundtrip() {
        let sb = sample();
        let back = Superblock::unpack(&sb.pack()).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn rejects_bad_magic_and_checksum() {
        let sb = sample();
        let mut bytes = sb.pack();
        bytes[64] ^= 1;
        assert!(Superblock::unpack(&bytes).is_err());

        let mut bytes = sb.pack();
        bytes[300] ^= 1;
        let err = Superblock::unpack(&bytes).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }), "{err}");
    }

    #[test]
    fn metadata_uuid_falls_back_to_fsid() {
        let mut sb = sample();
        assert_eq!(sb.effective_metadata_uuid(), sb.fsid);
        sb.incompat_flags |= super::INCOMPAT_METADATA_UUID;
        sb.metadata_uuid = [9; 16];
        assert_eq!(sb.effective_metadata_uuid(), [9; 16]);
    }

    #[test]
    fn bootstrap_chunks_decode() {
        let mut sb = sample();
        let mut arr = vec![0u8; 2048];
        // key
        byteorder::LittleEndian::write_u64(&mut arr[0..8], 256);
        arr[8] = ItemType::CHUNK_ITEM.0;
        byteorder::LittleEndian::write_u64(&mut arr[9..17], 0x100000);
        // chunk: length, owner, stripe_len, type, io/sector, num_stripes
        byteorder::LittleEndian::write_u64(&mut arr[17..25], 0x40000);
        byteorder::LittleEndian::write_u64(&mut arr[25..33], 3);
        byteorder::LittleEndian::write_u64(&mut arr[41..49], 2); // type flags
        byteorder::LittleEndian::write_u16(&mut arr[61..63], 1); // num_stripes
        // stripe
        byteorder::LittleEndian::write_u64(&mut arr[65..73], 1);
        byteorder::LittleEndian::write_u64(&mut arr[73..81], 0x100000);
        sb.sys_chunk_array = arr;
        sb.sys_chunk_array_size = (17 + 48 + 32) as u32;

        let chunks = sb.bootstrap_chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].logical, 0x100000);
        assert_eq!(chunks[0].length, 0x40000);
        assert_eq!(chunks[0].stripes[0].devid, 1);
    }
}
