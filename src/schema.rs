//! Typed key and value layouts for every column family.
//!
//! Keys are big-endian so that raw lexicographic comparison matches the
//! semantic order; values use the little-endian bincode layout. Values are
//! only ever produced by this shard, so decoding one from the store panics
//! on corruption instead of surfacing an error.

use crate::bincode::{BincodeBuf, BincodeCursor};
use crate::crypto::SecretKey;
use crate::error::BincodeError;
use crate::kv::IterBounds;
use crate::policy::DirectoryInfo;
use crate::types::{
    BlockId, BlockServiceId, Crc, HashMode, InodeId, InodeIdExtra, Parity, ShardId, SpanState,
    StorageClass, TernTime,
};

fn must<T>(res: Result<T, BincodeError>, what: &str) -> T {
    res.unwrap_or_else(|err| panic!("corrupt {what} record: {err}"))
}

// ----------------------------------------------------------------
// metadata family

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataKey {
    ShardInfo = 0,
    NextFileId = 1,
    NextSymlinkId = 2,
    NextBlockId = 3,
    LastAppliedLogIndex = 4,
}

pub fn metadata_key(key: MetadataKey) -> Vec<u8> {
    vec![key as u8]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInfoBody {
    pub shard_id: ShardId,
    pub secret_key: SecretKey,
}

impl ShardInfoBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u8(self.shard_id.0);
        buf.pack_fixed(&self.secret_key);
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let body = ShardInfoBody {
            shard_id: ShardId(must(cur.unpack_u8(), "shard info")),
            secret_key: must(cur.unpack_fixed(), "shard info"),
        };
        must(cur.ensure_finished(), "shard info");
        body
    }
}

pub fn encode_u64(x: u64) -> Vec<u8> {
    x.to_le_bytes().to_vec()
}

pub fn decode_u64(raw: &[u8]) -> u64 {
    u64::from_le_bytes(raw.try_into().expect("corrupt u64 value"))
}

pub fn decode_i64(raw: &[u8]) -> i64 {
    i64::from_le_bytes(raw.try_into().expect("corrupt i64 value"))
}

// ----------------------------------------------------------------
// inode keys (files, transientFiles, directories)

pub fn inode_id_key(id: InodeId) -> Vec<u8> {
    id.u64().to_be_bytes().to_vec()
}

pub fn decode_inode_id_key(raw: &[u8]) -> InodeId {
    InodeId::from_u64(u64::from_be_bytes(raw.try_into().expect("corrupt inode key")))
}

// ----------------------------------------------------------------
// inode bodies

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryBody {
    pub version: u8,
    pub owner_id: InodeId,
    pub mtime: TernTime,
    pub hash_mode: HashMode,
    pub info: DirectoryInfo,
}

impl DirectoryBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u8(self.version);
        buf.pack_u64(self.owner_id.u64());
        buf.pack_u64(self.mtime.0);
        buf.pack_u8(self.hash_mode as u8);
        self.info.encode(&mut buf);
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let body = DirectoryBody {
            version: must(cur.unpack_u8(), "directory"),
            owner_id: InodeId::from_u64(must(cur.unpack_u64(), "directory")),
            mtime: TernTime(must(cur.unpack_u64(), "directory")),
            hash_mode: HashMode::from_u8(must(cur.unpack_u8(), "directory"))
                .expect("corrupt directory hash mode"),
            info: must(DirectoryInfo::decode(&mut cur), "directory"),
        };
        must(cur.ensure_finished(), "directory");
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBody {
    pub version: u8,
    pub mtime: TernTime,
    pub atime: TernTime,
    pub file_size: u64,
}

impl FileBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u8(self.version);
        buf.pack_u64(self.mtime.0);
        buf.pack_u64(self.atime.0);
        buf.pack_u64(self.file_size);
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let body = FileBody {
            version: must(cur.unpack_u8(), "file"),
            mtime: TernTime(must(cur.unpack_u64(), "file")),
            atime: TernTime(must(cur.unpack_u64(), "file")),
            file_size: must(cur.unpack_u64(), "file"),
        };
        must(cur.ensure_finished(), "file");
        body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientFileBody {
    pub version: u8,
    pub file_size: u64,
    pub mtime: TernTime,
    pub deadline: TernTime,
    pub last_span_state: SpanState,
    pub note: Vec<u8>,
}

impl TransientFileBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u8(self.version);
        buf.pack_u64(self.file_size);
        buf.pack_u64(self.mtime.0);
        buf.pack_u64(self.deadline.0);
        buf.pack_u8(self.last_span_state as u8);
        buf.pack_bytes(&self.note);
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let body = TransientFileBody {
            version: must(cur.unpack_u8(), "transient file"),
            file_size: must(cur.unpack_u64(), "transient file"),
            mtime: TernTime(must(cur.unpack_u64(), "transient file")),
            deadline: TernTime(must(cur.unpack_u64(), "transient file")),
            last_span_state: SpanState::from_u8(must(cur.unpack_u8(), "transient file"))
                .expect("corrupt last span state"),
            note: must(cur.unpack_bytes(), "transient file"),
        };
        must(cur.ensure_finished(), "transient file");
        body
    }
}

// ----------------------------------------------------------------
// edges

/// Edge keys sort: directory, then current edges before snapshot edges,
/// then name hash, then name bytes, then (snapshot only) creation time
/// ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeKey {
    pub dir_id: InodeId,
    pub snapshot: bool,
    pub name_hash: u64,
    pub name: Vec<u8>,
    /// Set iff `snapshot`.
    pub creation_time: TernTime,
}

fn edge_group(dir_id: InodeId, snapshot: bool) -> u64 {
    (dir_id.u64() << 1) | snapshot as u64
}

pub fn edge_key_current(dir_id: InodeId, name_hash: u64, name: &[u8]) -> Vec<u8> {
    debug_assert!(name.len() <= u8::MAX as usize);
    let mut key = Vec::with_capacity(17 + name.len());
    key.extend_from_slice(&edge_group(dir_id, false).to_be_bytes());
    key.extend_from_slice(&name_hash.to_be_bytes());
    key.push(name.len() as u8);
    key.extend_from_slice(name);
    key
}

pub fn edge_key_snapshot(dir_id: InodeId, name_hash: u64, name: &[u8], time: TernTime) -> Vec<u8> {
    let mut key = Vec::with_capacity(25 + name.len());
    key.extend_from_slice(&edge_group(dir_id, true).to_be_bytes());
    key.extend_from_slice(&name_hash.to_be_bytes());
    key.push(name.len() as u8);
    key.extend_from_slice(name);
    key.extend_from_slice(&time.0.to_be_bytes());
    key
}

/// 8-byte prefix of one directory's current or snapshot group; usable as an
/// inclusive lower or exclusive upper bound (the bare prefix is never a
/// full key).
pub fn edge_group_prefix(dir_id: InodeId, snapshot: bool) -> Vec<u8> {
    edge_group(dir_id, snapshot).to_be_bytes().to_vec()
}

/// First possible key after every edge of `dir_id`.
pub fn edge_dir_end(dir_id: InodeId) -> Vec<u8> {
    ((dir_id.u64() + 1) << 1).to_be_bytes().to_vec()
}

impl EdgeKey {
    pub fn decode(raw: &[u8]) -> Self {
        assert!(raw.len() >= 17, "corrupt edge key: {} bytes", raw.len());
        let group = u64::from_be_bytes(raw[0..8].try_into().unwrap());
        let snapshot = group & 1 != 0;
        let dir_id = InodeId::from_u64(group >> 1);
        let name_hash = u64::from_be_bytes(raw[8..16].try_into().unwrap());
        let name_len = raw[16] as usize;
        let name_end = 17 + name_len;
        let expected = if snapshot { name_end + 8 } else { name_end };
        assert!(raw.len() == expected, "corrupt edge key: {} bytes, expected {expected}", raw.len());
        let name = raw[17..name_end].to_vec();
        let creation_time = if snapshot {
            TernTime(u64::from_be_bytes(raw[name_end..].try_into().unwrap()))
        } else {
            TernTime(0)
        };
        EdgeKey { dir_id, snapshot, name_hash, name, creation_time }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentEdgeBody {
    pub version: u8,
    /// Extra bit: the edge is locked by a cross-shard operation.
    pub target: InodeIdExtra,
    pub creation_time: TernTime,
}

impl CurrentEdgeBody {
    pub fn locked(&self) -> bool {
        self.target.extra()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u8(self.version);
        buf.pack_u64(self.target.u64());
        buf.pack_u64(self.creation_time.0);
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let body = CurrentEdgeBody {
            version: must(cur.unpack_u8(), "current edge"),
            target: InodeIdExtra::from_u64(must(cur.unpack_u64(), "current edge")),
            creation_time: TernTime(must(cur.unpack_u64(), "current edge")),
        };
        must(cur.ensure_finished(), "current edge");
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEdgeBody {
    pub version: u8,
    /// Extra bit: the edge owns its target (keeps the file alive).
    pub target: InodeIdExtra,
}

impl SnapshotEdgeBody {
    pub fn owned(&self) -> bool {
        self.target.extra()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u8(self.version);
        buf.pack_u64(self.target.u64());
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let body = SnapshotEdgeBody {
            version: must(cur.unpack_u8(), "snapshot edge"),
            target: InodeIdExtra::from_u64(must(cur.unpack_u64(), "snapshot edge")),
        };
        must(cur.ensure_finished(), "snapshot edge");
        body
    }
}

// ----------------------------------------------------------------
// spans

pub fn span_key(file_id: InodeId, byte_offset: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&file_id.u64().to_be_bytes());
    key.extend_from_slice(&byte_offset.to_be_bytes());
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanKey {
    pub file_id: InodeId,
    pub byte_offset: u64,
}

impl SpanKey {
    pub fn decode(raw: &[u8]) -> Self {
        assert!(raw.len() == 16, "corrupt span key");
        SpanKey {
            file_id: InodeId::from_u64(u64::from_be_bytes(raw[0..8].try_into().unwrap())),
            byte_offset: u64::from_be_bytes(raw[8..16].try_into().unwrap()),
        }
    }
}

/// Bounds covering exactly the spans of one file.
pub fn span_file_bounds(file_id: InodeId) -> IterBounds {
    IterBounds::both(
        file_id.u64().to_be_bytes().to_vec(),
        (file_id.u64() + 1).to_be_bytes().to_vec(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanBlock {
    pub block_service: BlockServiceId,
    pub block_id: BlockId,
    pub crc: Crc,
}

/// Blocks of one span at one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationBlocks {
    pub location_id: u8,
    pub storage_class: StorageClass,
    pub parity: Parity,
    pub stripes: u8,
    pub cell_size: u32,
    pub stripe_crcs: Vec<Crc>,
    pub blocks: Vec<SpanBlock>,
}

impl LocationBlocks {
    pub fn block_size(&self) -> u32 {
        self.cell_size * self.stripes as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStorage {
    Inline(Vec<u8>),
    Blocks(Vec<LocationBlocks>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBody {
    pub span_size: u32,
    pub crc: Crc,
    pub storage: SpanStorage,
}

const SPAN_STORAGE_INLINE: u8 = 0;
const SPAN_STORAGE_BLOCKS: u8 = 1;

impl SpanBody {
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, SpanStorage::Inline(_))
    }

    pub fn locations(&self) -> &[LocationBlocks] {
        match &self.storage {
            SpanStorage::Inline(_) => &[],
            SpanStorage::Blocks(locations) => locations,
        }
    }

    pub fn locations_mut(&mut self) -> &mut Vec<LocationBlocks> {
        match &mut self.storage {
            SpanStorage::Inline(_) => panic!("inline span has no locations"),
            SpanStorage::Blocks(locations) => locations,
        }
    }

    pub fn find_location(&self, location_id: u8) -> Option<&LocationBlocks> {
        self.locations().iter().find(|l| l.location_id == location_id)
    }

    /// All block ids across locations, in storage order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.locations()
            .iter()
            .flat_map(|l| l.blocks.iter().map(|b| b.block_id))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::new();
        buf.pack_u32(self.span_size);
        buf.pack_u32(self.crc.0);
        match &self.storage {
            SpanStorage::Inline(body) => {
                buf.pack_u8(SPAN_STORAGE_INLINE);
                buf.pack_bytes(body);
            }
            SpanStorage::Blocks(locations) => {
                buf.pack_u8(SPAN_STORAGE_BLOCKS);
                buf.pack_u8(locations.len() as u8);
                for loc in locations {
                    buf.pack_u8(loc.location_id);
                    buf.pack_u8(loc.storage_class.0);
                    buf.pack_u8(loc.parity.0);
                    buf.pack_u8(loc.stripes);
                    buf.pack_u32(loc.cell_size);
                    assert!(loc.stripe_crcs.len() == loc.stripes as usize);
                    for crc in &loc.stripe_crcs {
                        buf.pack_u32(crc.0);
                    }
                    assert!(loc.blocks.len() == loc.parity.blocks());
                    for block in &loc.blocks {
                        buf.pack_u64(block.block_service.0);
                        buf.pack_u64(block.block_id.0);
                        buf.pack_u32(block.crc.0);
                    }
                }
            }
        }
        buf.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cur = BincodeCursor::new(raw);
        let span_size = must(cur.unpack_u32(), "span");
        let crc = Crc(must(cur.unpack_u32(), "span"));
        let storage = match must(cur.unpack_u8(), "span") {
            SPAN_STORAGE_INLINE => SpanStorage::Inline(must(cur.unpack_bytes(), "span")),
            SPAN_STORAGE_BLOCKS => {
                let location_count = must(cur.unpack_u8(), "span");
                let mut locations = Vec::with_capacity(location_count as usize);
                for _ in 0..location_count {
                    let location_id = must(cur.unpack_u8(), "span");
                    let storage_class = StorageClass(must(cur.unpack_u8(), "span"));
                    let parity = Parity(must(cur.unpack_u8(), "span"));
                    let stripes = must(cur.unpack_u8(), "span");
                    let cell_size = must(cur.unpack_u32(), "span");
                    let mut stripe_crcs = Vec::with_capacity(stripes as usize);
                    for _ in 0..stripes {
                        stripe_crcs.push(Crc(must(cur.unpack_u32(), "span")));
                    }
                    let mut blocks = Vec::with_capacity(parity.blocks());
                    for _ in 0..parity.blocks() {
                        blocks.push(SpanBlock {
                            block_service: BlockServiceId(must(cur.unpack_u64(), "span")),
                            block_id: BlockId(must(cur.unpack_u64(), "span")),
                            crc: Crc(must(cur.unpack_u32(), "span")),
                        });
                    }
                    locations.push(LocationBlocks {
                        location_id,
                        storage_class,
                        parity,
                        stripes,
                        cell_size,
                        stripe_crcs,
                        blocks,
                    });
                }
                SpanStorage::Blocks(locations)
            }
            other => panic!("corrupt span storage tag {other}"),
        };
        must(cur.ensure_finished(), "span");
        SpanBody { span_size, crc, storage }
    }
}

// ----------------------------------------------------------------
// block service reverse index

pub fn block_service_to_file_key(block_service: BlockServiceId, file_id: InodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&block_service.0.to_be_bytes());
    key.extend_from_slice(&file_id.u64().to_be_bytes());
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockServiceToFileKey {
    pub block_service: BlockServiceId,
    pub file_id: InodeId,
}

impl BlockServiceToFileKey {
    pub fn decode(raw: &[u8]) -> Self {
        assert!(raw.len() == 16, "corrupt block service to file key");
        BlockServiceToFileKey {
            block_service: BlockServiceId(u64::from_be_bytes(raw[0..8].try_into().unwrap())),
            file_id: InodeId::from_u64(u64::from_be_bytes(raw[8..16].try_into().unwrap())),
        }
    }
}
