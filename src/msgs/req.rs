//! Request bodies. Field order is the wire order.

use super::{wire_struct, Wire};
use crate::bincode::{BincodeBuf, BincodeCursor};
use crate::error::BincodeError;
use crate::policy::DirectoryInfo;
use crate::types::{
    BlockId, BlockServiceId, Crc, FailureDomain, InodeId, Parity, ShortBytes, StorageClass,
    TernTime,
};

/// Proof that a block service performed a write or an erase.
wire_struct!(BlockProof {
    block_id: BlockId,
    proof: [u8; 8],
});

/// Placement exclusion: a specific block service or a whole failure domain.
wire_struct!(BlacklistEntry {
    failure_domain: FailureDomain,
    block_service: BlockServiceId,
});

// ---------------- read path ----------------

wire_struct!(LookupReq {
    dir_id: InodeId,
    name: ShortBytes,
});

wire_struct!(StatFileReq {
    id: InodeId,
});

wire_struct!(StatDirectoryReq {
    id: InodeId,
});

wire_struct!(StatTransientFileReq {
    id: InodeId,
});

wire_struct!(ReadDirReq {
    dir_id: InodeId,
    start_hash: u64,
    mtu: u16,
});

pub const FULL_READ_DIR_CURRENT: u8 = 1 << 0;
pub const FULL_READ_DIR_BACKWARDS: u8 = 1 << 1;
pub const FULL_READ_DIR_SAME_NAME: u8 = 1 << 2;

wire_struct!(FullReadDirReq {
    dir_id: InodeId,
    flags: u8,
    start_name: ShortBytes,
    start_time: TernTime,
    limit: u16,
    mtu: u16,
});

wire_struct!(LocalFileSpansReq {
    file_id: InodeId,
    byte_offset: u64,
    limit: u32,
    mtu: u16,
});

wire_struct!(FileSpansReq {
    file_id: InodeId,
    byte_offset: u64,
    limit: u32,
    mtu: u16,
});

wire_struct!(BlockServiceFilesReq {
    block_service_id: BlockServiceId,
    start_from: InodeId,
});

wire_struct!(VisitDirectoriesReq {
    begin_id: InodeId,
    mtu: u16,
});

wire_struct!(VisitFilesReq {
    begin_id: InodeId,
    mtu: u16,
});

wire_struct!(VisitTransientFilesReq {
    begin_id: InodeId,
    mtu: u16,
});

// ---------------- write path ----------------

wire_struct!(ConstructFileReq {
    file_type: u8,
    note: ShortBytes,
});

wire_struct!(LinkFileReq {
    file_id: InodeId,
    cookie: [u8; 8],
    owner_id: InodeId,
    name: ShortBytes,
});

wire_struct!(SameDirectoryRenameReq {
    target_id: InodeId,
    dir_id: InodeId,
    old_name: ShortBytes,
    old_creation_time: TernTime,
    new_name: ShortBytes,
});

wire_struct!(SameDirectoryRenameSnapshotReq {
    target_id: InodeId,
    dir_id: InodeId,
    old_name: ShortBytes,
    old_creation_time: TernTime,
    new_name: ShortBytes,
});

wire_struct!(SoftUnlinkFileReq {
    owner_id: InodeId,
    file_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(CreateDirectoryInodeReq {
    id: InodeId,
    owner_id: InodeId,
    info: DirectoryInfo,
});

wire_struct!(CreateLockedCurrentEdgeReq {
    dir_id: InodeId,
    name: ShortBytes,
    target_id: InodeId,
    old_creation_time: TernTime,
});

wire_struct!(LockCurrentEdgeReq {
    dir_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
    target_id: InodeId,
});

wire_struct!(UnlockCurrentEdgeReq {
    dir_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
    target_id: InodeId,
    was_moved: bool,
});

wire_struct!(RemoveDirectoryOwnerReq {
    dir_id: InodeId,
    info: DirectoryInfo,
});

wire_struct!(RemoveInodeReq {
    id: InodeId,
});

wire_struct!(SetDirectoryOwnerReq {
    dir_id: InodeId,
    owner_id: InodeId,
});

wire_struct!(SetDirectoryInfoReq {
    id: InodeId,
    info: DirectoryInfo,
});

wire_struct!(RemoveNonOwnedEdgeReq {
    dir_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(SameShardHardFileUnlinkReq {
    owner_id: InodeId,
    target_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(RemoveSpanInitiateReq {
    file_id: InodeId,
    cookie: [u8; 8],
});

wire_struct!(RemoveSpanCertifyReq {
    file_id: InodeId,
    cookie: [u8; 8],
    byte_offset: u64,
    proofs: Vec<BlockProof>,
});

wire_struct!(AddInlineSpanReq {
    file_id: InodeId,
    cookie: [u8; 8],
    storage_class: StorageClass,
    byte_offset: u64,
    size: u32,
    crc: Crc,
    body: ShortBytes,
});

/// The span size may be larger than `stripes * data_blocks * cell_size`
/// (trailing zero padding) or smaller (short last cell); the CRC laws in
/// the prepare path account for both.
wire_struct!(AddSpanInitiateReq {
    file_id: InodeId,
    cookie: [u8; 8],
    byte_offset: u64,
    size: u32,
    crc: Crc,
    storage_class: StorageClass,
    parity: Parity,
    stripes: u8,
    cell_size: u32,
    crcs: Vec<Crc>,
    blacklist: Vec<BlacklistEntry>,
});

wire_struct!(AddSpanInitiateWithReferenceReq {
    req: AddSpanInitiateReq,
    reference: InodeId,
});

wire_struct!(AddSpanAtLocationInitiateReq {
    location_id: u8,
    req: AddSpanInitiateWithReferenceReq,
});

wire_struct!(AddSpanCertifyReq {
    file_id: InodeId,
    cookie: [u8; 8],
    byte_offset: u64,
    proofs: Vec<BlockProof>,
});

wire_struct!(AddSpanLocationReq {
    file_id1: InodeId,
    byte_offset1: u64,
    blocks1: Vec<u64>,
    file_id2: InodeId,
    byte_offset2: u64,
});

wire_struct!(MakeFileTransientReq {
    id: InodeId,
    note: ShortBytes,
});

wire_struct!(ScrapTransientFileReq {
    id: InodeId,
    cookie: [u8; 8],
});

wire_struct!(MoveSpanReq {
    span_size: u32,
    file_id1: InodeId,
    byte_offset1: u64,
    cookie1: [u8; 8],
    file_id2: InodeId,
    byte_offset2: u64,
    cookie2: [u8; 8],
});

wire_struct!(SwapBlocksReq {
    file_id1: InodeId,
    byte_offset1: u64,
    block_id1: BlockId,
    file_id2: InodeId,
    byte_offset2: u64,
    block_id2: BlockId,
});

wire_struct!(SwapSpansReq {
    file_id1: InodeId,
    byte_offset1: u64,
    blocks1: Vec<u64>,
    file_id2: InodeId,
    byte_offset2: u64,
    blocks2: Vec<u64>,
});

/// The high bit of `mtime`/`atime` flags the field as "set this".
wire_struct!(SetTimeReq {
    id: InodeId,
    mtime: u64,
    atime: u64,
});

wire_struct!(RemoveZeroBlockServiceFilesReq {
    start_block_service: BlockServiceId,
    start_file: InodeId,
});

wire_struct!(RemoveOwnedSnapshotFileEdgeReq {
    owner_id: InodeId,
    target_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});
