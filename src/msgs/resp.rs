//! Response bodies. The list-element types here carry the packed sizes the
//! read path subtracts from its MTU budget; the `*_STATIC_SIZE` constants
//! are the fixed bytes of each paginated response before any elements.

use super::{wire_struct, Wire};
use crate::bincode::{BincodeBuf, BincodeCursor};
use crate::error::BincodeError;
use crate::policy::DirectoryInfo;
use crate::types::{
    AddrsInfo, BlockId, BlockServiceId, Crc, FailureDomain, InodeId, InodeIdExtra, Parity,
    ShortBytes, StorageClass, TernTime,
};

// ---------------- read path ----------------

wire_struct!(LookupResp {
    target_id: InodeId,
    creation_time: TernTime,
});

wire_struct!(StatFileResp {
    mtime: TernTime,
    atime: TernTime,
    size: u64,
});

wire_struct!(StatDirectoryResp {
    mtime: TernTime,
    owner: InodeId,
    info: DirectoryInfo,
});

wire_struct!(StatTransientFileResp {
    mtime: TernTime,
    size: u64,
    note: ShortBytes,
});

/// One current edge in a `read_dir` page.
wire_struct!(CurrentEdge {
    target_id: InodeId,
    name_hash: u64,
    name: ShortBytes,
    creation_time: TernTime,
});

wire_struct!(ReadDirResp {
    next_hash: u64,
    results: Vec<CurrentEdge>,
});

/// next_hash + list header.
pub const READ_DIR_RESP_STATIC_SIZE: usize = 8 + 2;

/// One edge (current or snapshot) in a `full_read_dir` page. For current
/// edges the extra bit of `target_id` is the locked flag; for snapshot
/// edges it is the owned flag.
wire_struct!(Edge {
    current: bool,
    target_id: InodeIdExtra,
    name_hash: u64,
    name: ShortBytes,
    creation_time: TernTime,
});

/// Resumption point for `full_read_dir`: feed the fields back verbatim.
wire_struct!(FullReadDirCursor {
    current: bool,
    start_name: ShortBytes,
    start_time: TernTime,
});

pub const FULL_READ_DIR_CURSOR_STATIC_SIZE: usize = 1 + 1 + 8;

wire_struct!(FullReadDirResp {
    next: FullReadDirCursor,
    results: Vec<Edge>,
});

pub const FULL_READ_DIR_RESP_STATIC_SIZE: usize = FULL_READ_DIR_CURSOR_STATIC_SIZE + 2;

/// A block service as returned inline in span reads.
wire_struct!(BlockServiceEntry {
    id: BlockServiceId,
    addrs: AddrsInfo,
    flags: u8,
});

pub const BLOCK_SERVICE_ENTRY_SIZE: usize = 8 + 12 + 1;

/// A block within a span page; `block_service_ix` indexes the response's
/// `block_services` list.
wire_struct!(FetchedBlock {
    block_service_ix: u8,
    block_id: BlockId,
    crc: Crc,
});

wire_struct!(FetchedBlocksSpan {
    storage_class: StorageClass,
    parity: Parity,
    stripes: u8,
    cell_size: u32,
    blocks: Vec<FetchedBlock>,
    stripes_crc: Vec<Crc>,
});

/// Span payload projected to one location.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedSpanBody {
    Inline(ShortBytes),
    Blocks(FetchedBlocksSpan),
}

impl Default for FetchedSpanBody {
    fn default() -> Self {
        FetchedSpanBody::Inline(ShortBytes::default())
    }
}

const SPAN_BODY_INLINE: u8 = 0;
const SPAN_BODY_BLOCKS: u8 = 1;

impl Wire for FetchedSpanBody {
    fn enc(&self, buf: &mut BincodeBuf) {
        match self {
            FetchedSpanBody::Inline(body) => {
                buf.pack_u8(SPAN_BODY_INLINE);
                body.enc(buf);
            }
            FetchedSpanBody::Blocks(blocks) => {
                buf.pack_u8(SPAN_BODY_BLOCKS);
                blocks.enc(buf);
            }
        }
    }

    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        match cur.unpack_u8()? {
            SPAN_BODY_INLINE => Ok(FetchedSpanBody::Inline(Wire::dec(cur)?)),
            SPAN_BODY_BLOCKS => Ok(FetchedSpanBody::Blocks(Wire::dec(cur)?)),
            other => {
                Err(BincodeError::BadDiscriminant { what: "span body", value: other as u64 })
            }
        }
    }

    fn size(&self) -> usize {
        1 + match self {
            FetchedSpanBody::Inline(body) => body.size(),
            FetchedSpanBody::Blocks(blocks) => blocks.size(),
        }
    }
}

wire_struct!(FetchedSpanHeader {
    byte_offset: u64,
    size: u32,
    crc: Crc,
});

wire_struct!(FetchedSpan {
    header: FetchedSpanHeader,
    body: FetchedSpanBody,
});

wire_struct!(LocalFileSpansResp {
    next_offset: u64,
    block_services: Vec<BlockServiceEntry>,
    spans: Vec<FetchedSpan>,
});

pub const LOCAL_FILE_SPANS_RESP_STATIC_SIZE: usize = 8 + 2 + 2;

/// One location of a span in the all-locations read.
wire_struct!(FetchedLocation {
    location_id: u8,
    storage_class: StorageClass,
    parity: Parity,
    stripes: u8,
    cell_size: u32,
    blocks: Vec<FetchedBlock>,
    stripes_crc: Vec<Crc>,
});

#[derive(Debug, Clone, PartialEq)]
pub enum FetchedFullSpanBody {
    Inline(ShortBytes),
    Locations(Vec<FetchedLocation>),
}

impl Default for FetchedFullSpanBody {
    fn default() -> Self {
        FetchedFullSpanBody::Inline(ShortBytes::default())
    }
}

impl Wire for FetchedFullSpanBody {
    fn enc(&self, buf: &mut BincodeBuf) {
        match self {
            FetchedFullSpanBody::Inline(body) => {
                buf.pack_u8(SPAN_BODY_INLINE);
                body.enc(buf);
            }
            FetchedFullSpanBody::Locations(locations) => {
                buf.pack_u8(SPAN_BODY_BLOCKS);
                locations.enc(buf);
            }
        }
    }

    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        match cur.unpack_u8()? {
            SPAN_BODY_INLINE => Ok(FetchedFullSpanBody::Inline(Wire::dec(cur)?)),
            SPAN_BODY_BLOCKS => Ok(FetchedFullSpanBody::Locations(Wire::dec(cur)?)),
            other => {
                Err(BincodeError::BadDiscriminant { what: "span body", value: other as u64 })
            }
        }
    }

    fn size(&self) -> usize {
        1 + match self {
            FetchedFullSpanBody::Inline(body) => body.size(),
            FetchedFullSpanBody::Locations(locations) => locations.size(),
        }
    }
}

wire_struct!(FetchedFullSpan {
    header: FetchedSpanHeader,
    body: FetchedFullSpanBody,
});

wire_struct!(FileSpansResp {
    next_offset: u64,
    block_services: Vec<BlockServiceEntry>,
    spans: Vec<FetchedFullSpan>,
});

pub const FILE_SPANS_RESP_STATIC_SIZE: usize = 8 + 2 + 2;

wire_struct!(BlockServiceFilesResp {
    file_ids: Vec<InodeId>,
});

pub const BLOCK_SERVICE_FILES_RESP_STATIC_SIZE: usize = 2;

wire_struct!(VisitDirectoriesResp {
    next_id: InodeId,
    ids: Vec<InodeId>,
});

wire_struct!(VisitFilesResp {
    next_id: InodeId,
    ids: Vec<InodeId>,
});

pub const VISIT_INODES_RESP_STATIC_SIZE: usize = 8 + 2;

/// One transient file with its capability cookie.
wire_struct!(TransientFileItem {
    id: InodeId,
    cookie: [u8; 8],
    deadline_time: TernTime,
});

wire_struct!(VisitTransientFilesResp {
    next_id: InodeId,
    files: Vec<TransientFileItem>,
});

pub const VISIT_TRANSIENT_FILES_RESP_STATIC_SIZE: usize = 8 + 2;

// ---------------- write path ----------------

wire_struct!(ConstructFileResp {
    id: InodeId,
    cookie: [u8; 8],
});

wire_struct!(LinkFileResp {
    creation_time: TernTime,
});

wire_struct!(SameDirectoryRenameResp {
    new_creation_time: TernTime,
});

wire_struct!(SameDirectoryRenameSnapshotResp {
    new_creation_time: TernTime,
});

wire_struct!(SoftUnlinkFileResp {
    delete_creation_time: TernTime,
});

wire_struct!(CreateDirectoryInodeResp {
    mtime: TernTime,
});

wire_struct!(CreateLockedCurrentEdgeResp {
    creation_time: TernTime,
});

wire_struct!(LockCurrentEdgeResp {});

wire_struct!(UnlockCurrentEdgeResp {});

wire_struct!(RemoveDirectoryOwnerResp {});

wire_struct!(RemoveInodeResp {});

wire_struct!(SetDirectoryOwnerResp {});

wire_struct!(SetDirectoryInfoResp {});

wire_struct!(RemoveNonOwnedEdgeResp {});

wire_struct!(SameShardHardFileUnlinkResp {});

/// A block to erase, with the certificate authorizing the erase.
wire_struct!(RemoveSpanInitiateBlockInfo {
    block_service_addrs: AddrsInfo,
    block_service_id: BlockServiceId,
    block_service_flags: u8,
    block_id: BlockId,
    certificate: [u8; 8],
});

wire_struct!(RemoveSpanInitiateResp {
    byte_offset: u64,
    blocks: Vec<RemoveSpanInitiateBlockInfo>,
});

wire_struct!(RemoveSpanCertifyResp {});

wire_struct!(AddInlineSpanResp {});

/// A freshly allocated block, with the certificate authorizing the write.
wire_struct!(AddSpanInitiateBlockInfo {
    block_service_addrs: AddrsInfo,
    block_service_id: BlockServiceId,
    block_service_failure_domain: FailureDomain,
    block_id: BlockId,
    certificate: [u8; 8],
});

wire_struct!(AddSpanInitiateResp {
    blocks: Vec<AddSpanInitiateBlockInfo>,
});

wire_struct!(AddSpanInitiateWithReferenceResp {
    resp: AddSpanInitiateResp,
});

wire_struct!(AddSpanAtLocationInitiateResp {
    resp: AddSpanInitiateResp,
});

wire_struct!(AddSpanCertifyResp {});

wire_struct!(AddSpanLocationResp {});

wire_struct!(MakeFileTransientResp {});

wire_struct!(ScrapTransientFileResp {});

wire_struct!(MoveSpanResp {});

wire_struct!(SwapBlocksResp {});

wire_struct!(SwapSpansResp {});

wire_struct!(SetTimeResp {});

wire_struct!(RemoveZeroBlockServiceFilesResp {
    removed: u64,
    next_block_service: BlockServiceId,
    next_file: InodeId,
});

wire_struct!(RemoveOwnedSnapshotFileEdgeResp {});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InodeType, ShardId};

    #[test]
    fn packed_sizes_match_encodings() {
        let edge = Edge {
            current: true,
            target_id: InodeIdExtra::new(InodeId::new(InodeType::File, ShardId(1), 2), true),
            name_hash: 7,
            name: ShortBytes::from("some-name"),
            creation_time: TernTime(3),
        };
        let mut buf = BincodeBuf::new();
        edge.enc(&mut buf);
        assert_eq!(buf.len(), edge.size());
        assert_eq!(edge.size(), 26 + 9);

        let cursor = FullReadDirCursor::default();
        assert_eq!(cursor.size(), FULL_READ_DIR_CURSOR_STATIC_SIZE);

        let bs = BlockServiceEntry::default();
        assert_eq!(bs.size(), BLOCK_SERVICE_ENTRY_SIZE);
    }

    #[test]
    fn fetched_span_round_trips() {
        let span = FetchedSpan {
            header: FetchedSpanHeader { byte_offset: 4096, size: 100, crc: Crc(5) },
            body: FetchedSpanBody::Blocks(FetchedBlocksSpan {
                storage_class: crate::types::FLASH_STORAGE,
                parity: Parity::new(2, 1),
                stripes: 1,
                cell_size: 4096,
                blocks: vec![
                    FetchedBlock { block_service_ix: 0, block_id: BlockId(0x101), crc: Crc(1) },
                    FetchedBlock { block_service_ix: 1, block_id: BlockId(0x201), crc: Crc(2) },
                    FetchedBlock { block_service_ix: 2, block_id: BlockId(0x301), crc: Crc(3) },
                ],
                stripes_crc: vec![Crc(9)],
            }),
        };
        let mut buf = BincodeBuf::new();
        span.enc(&mut buf);
        let bytes = buf.into_bytes();
        assert_eq!(bytes.len(), span.size());
        let mut cur = BincodeCursor::new(&bytes);
        assert_eq!(FetchedSpan::dec(&mut cur).unwrap(), span);
        cur.ensure_finished().unwrap();
    }
}
