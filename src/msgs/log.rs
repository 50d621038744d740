//! Replicated-log entries.
//!
//! A log entry is the deterministic form of a write: the prepare path has
//! already resolved wall-clock time, fresh deadlines, and block-service
//! picks, so applying the entry never consults anything but the store.
//! Entry bodies therefore differ from their requests: cookies are gone
//! (verified at prepare) and resolved values are frozen in.

use super::{wire_struct, BlockProof, ShardMessageKind, Wire, SHARD_LOG_PROTOCOL_VERSION};
use crate::bincode::{BincodeBuf, BincodeCursor};
use crate::error::BincodeError;
use crate::policy::DirectoryInfo;
use crate::types::{
    BlockId, BlockServiceId, Crc, InodeId, Parity, ShortBytes, StorageClass, TernTime,
};

wire_struct!(ConstructFileEntry {
    file_type: u8,
    note: ShortBytes,
    deadline_time: TernTime,
});

wire_struct!(LinkFileEntry {
    file_id: InodeId,
    owner_id: InodeId,
    name: ShortBytes,
});

wire_struct!(SameDirectoryRenameEntry {
    target_id: InodeId,
    dir_id: InodeId,
    old_name: ShortBytes,
    old_creation_time: TernTime,
    new_name: ShortBytes,
});

wire_struct!(SameDirectoryRenameSnapshotEntry {
    target_id: InodeId,
    dir_id: InodeId,
    old_name: ShortBytes,
    old_creation_time: TernTime,
    new_name: ShortBytes,
});

wire_struct!(SoftUnlinkFileEntry {
    owner_id: InodeId,
    file_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(CreateDirectoryInodeEntry {
    id: InodeId,
    owner_id: InodeId,
    info: DirectoryInfo,
});

wire_struct!(CreateLockedCurrentEdgeEntry {
    dir_id: InodeId,
    name: ShortBytes,
    target_id: InodeId,
    old_creation_time: TernTime,
});

wire_struct!(LockCurrentEdgeEntry {
    dir_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
    target_id: InodeId,
});

wire_struct!(UnlockCurrentEdgeEntry {
    dir_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
    target_id: InodeId,
    was_moved: bool,
});

wire_struct!(RemoveDirectoryOwnerEntry {
    dir_id: InodeId,
    info: DirectoryInfo,
});

wire_struct!(RemoveInodeEntry {
    id: InodeId,
});

wire_struct!(SetDirectoryOwnerEntry {
    dir_id: InodeId,
    owner_id: InodeId,
});

wire_struct!(SetDirectoryInfoEntry {
    dir_id: InodeId,
    info: DirectoryInfo,
});

wire_struct!(RemoveNonOwnedEdgeEntry {
    dir_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(SameShardHardFileUnlinkEntry {
    owner_id: InodeId,
    target_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
    deadline_time: TernTime,
});

wire_struct!(RemoveSpanInitiateEntry {
    file_id: InodeId,
});

wire_struct!(AddInlineSpanEntry {
    file_id: InodeId,
    storage_class: StorageClass,
    byte_offset: u64,
    size: u32,
    body: ShortBytes,
    crc: Crc,
});

/// A block picked by the prepare path: which service, and the block's CRC
/// computed from the request's cell CRCs. Block ids are allocated at apply.
wire_struct!(EntryNewBlockInfo {
    block_service_id: BlockServiceId,
    crc: Crc,
});

wire_struct!(AddSpanAtLocationInitiateEntry {
    location_id: u8,
    with_reference: bool,
    file_id: InodeId,
    byte_offset: u64,
    size: u32,
    crc: Crc,
    storage_class: StorageClass,
    parity: Parity,
    stripes: u8,
    cell_size: u32,
    body_blocks: Vec<EntryNewBlockInfo>,
    body_stripes: Vec<Crc>,
});

wire_struct!(AddSpanCertifyEntry {
    file_id: InodeId,
    byte_offset: u64,
    proofs: Vec<BlockProof>,
});

wire_struct!(AddSpanLocationEntry {
    file_id1: InodeId,
    byte_offset1: u64,
    blocks1: Vec<u64>,
    file_id2: InodeId,
    byte_offset2: u64,
});

wire_struct!(MakeFileTransientEntry {
    id: InodeId,
    note: ShortBytes,
    deadline_time: TernTime,
});

wire_struct!(ScrapTransientFileEntry {
    id: InodeId,
    deadline_time: TernTime,
});

wire_struct!(RemoveSpanCertifyEntry {
    file_id: InodeId,
    byte_offset: u64,
    proofs: Vec<BlockProof>,
});

wire_struct!(RemoveOwnedSnapshotFileEdgeEntry {
    owner_id: InodeId,
    target_id: InodeId,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(SwapBlocksEntry {
    file_id1: InodeId,
    byte_offset1: u64,
    block_id1: BlockId,
    file_id2: InodeId,
    byte_offset2: u64,
    block_id2: BlockId,
});

wire_struct!(SwapSpansEntry {
    file_id1: InodeId,
    byte_offset1: u64,
    blocks1: Vec<u64>,
    file_id2: InodeId,
    byte_offset2: u64,
    blocks2: Vec<u64>,
});

wire_struct!(MoveSpanEntry {
    span_size: u32,
    file_id1: InodeId,
    byte_offset1: u64,
    cookie1: [u8; 8],
    file_id2: InodeId,
    byte_offset2: u64,
    cookie2: [u8; 8],
});

wire_struct!(SetTimeEntry {
    id: InodeId,
    mtime: u64,
    atime: u64,
});

wire_struct!(RemoveZeroBlockServiceFilesEntry {
    start_block_service: BlockServiceId,
    start_file: InodeId,
});

macro_rules! log_entry_body {
    ($( $kind:ident($entry:ident) ),* $(,)?) => {
        /// Tagged union over every entry kind; the tag reuses the message
        /// kind discriminants.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ShardLogEntryBody {
            $($kind($entry),)*
        }

        impl ShardLogEntryBody {
            pub fn kind(&self) -> ShardMessageKind {
                match self {
                    $(ShardLogEntryBody::$kind(_) => ShardMessageKind::$kind,)*
                }
            }

            pub fn enc(&self, buf: &mut BincodeBuf) {
                buf.pack_u16(self.kind() as u16);
                match self {
                    $(ShardLogEntryBody::$kind(body) => body.enc(buf),)*
                }
            }

            pub fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
                let raw = cur.unpack_u16()?;
                match ShardMessageKind::from_u16(raw) {
                    $(Some(ShardMessageKind::$kind) => {
                        Ok(ShardLogEntryBody::$kind(Wire::dec(cur)?))
                    })*
                    _ => Err(BincodeError::BadDiscriminant {
                        what: "log entry kind",
                        value: raw as u64,
                    }),
                }
            }
        }
    };
}

log_entry_body! {
    ConstructFile(ConstructFileEntry),
    LinkFile(LinkFileEntry),
    SameDirectoryRename(SameDirectoryRenameEntry),
    SameDirectoryRenameSnapshot(SameDirectoryRenameSnapshotEntry),
    SoftUnlinkFile(SoftUnlinkFileEntry),
    CreateDirectoryInode(CreateDirectoryInodeEntry),
    CreateLockedCurrentEdge(CreateLockedCurrentEdgeEntry),
    LockCurrentEdge(LockCurrentEdgeEntry),
    UnlockCurrentEdge(UnlockCurrentEdgeEntry),
    RemoveDirectoryOwner(RemoveDirectoryOwnerEntry),
    RemoveInode(RemoveInodeEntry),
    SetDirectoryOwner(SetDirectoryOwnerEntry),
    SetDirectoryInfo(SetDirectoryInfoEntry),
    RemoveNonOwnedEdge(RemoveNonOwnedEdgeEntry),
    SameShardHardFileUnlink(SameShardHardFileUnlinkEntry),
    RemoveSpanInitiate(RemoveSpanInitiateEntry),
    AddInlineSpan(AddInlineSpanEntry),
    // Same entry shape under two kinds: the default-location form keeps its
    // own tag so the response comes back under the kind the client sent.
    AddSpanInitiate(AddSpanAtLocationInitiateEntry),
    AddSpanAtLocationInitiate(AddSpanAtLocationInitiateEntry),
    AddSpanCertify(AddSpanCertifyEntry),
    AddSpanLocation(AddSpanLocationEntry),
    MakeFileTransient(MakeFileTransientEntry),
    ScrapTransientFile(ScrapTransientFileEntry),
    RemoveSpanCertify(RemoveSpanCertifyEntry),
    RemoveOwnedSnapshotFileEdge(RemoveOwnedSnapshotFileEdgeEntry),
    SwapBlocks(SwapBlocksEntry),
    SwapSpans(SwapSpansEntry),
    MoveSpan(MoveSpanEntry),
    SetTime(SetTimeEntry),
    RemoveZeroBlockServiceFiles(RemoveZeroBlockServiceFilesEntry),
}

/// A prepared log entry. `idx` is assigned by the log layer before apply;
/// `time` is the wall clock frozen at prepare.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardLogEntry {
    pub idx: u64,
    pub time: TernTime,
    pub body: ShardLogEntryBody,
}

impl ShardLogEntry {
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = BincodeBuf::with_capacity(64);
        buf.pack_u32(SHARD_LOG_PROTOCOL_VERSION);
        buf.pack_u64(self.idx);
        buf.pack_u64(self.time.0);
        self.body.enc(&mut buf);
        buf.into_bytes()
    }

    /// Log entries come from our own replicated log; a version mismatch
    /// there means mixed binaries writing one log, and continuing would
    /// corrupt state.
    pub fn unpack(raw: &[u8]) -> Result<Self, BincodeError> {
        let mut cur = BincodeCursor::new(raw);
        let version = cur.unpack_u32()?;
        assert!(
            version == SHARD_LOG_PROTOCOL_VERSION,
            "log entry protocol version {version:#x}, expected {SHARD_LOG_PROTOCOL_VERSION:#x}"
        );
        let idx = cur.unpack_u64()?;
        let time = TernTime(cur.unpack_u64()?);
        let body = ShardLogEntryBody::dec(&mut cur)?;
        cur.ensure_finished()?;
        Ok(ShardLogEntry { idx, time, body })
    }
}
