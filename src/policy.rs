//! Directory info segments.
//!
//! A directory body carries a list of opaque, tagged policy segments that
//! clients and the garbage collector interpret; the shard itself only
//! stores and returns them. The constructors here produce the default set
//! written to the root directory on first boot.

use crate::bincode::{bytes_size, BincodeBuf, BincodeCursor};
use crate::error::BincodeError;
use crate::types::{Parity, StorageClass, FLASH_STORAGE, HDD_STORAGE};

pub const SNAPSHOT_POLICY_TAG: u8 = 1;
pub const BLOCK_POLICY_TAG: u8 = 2;
pub const SPAN_POLICY_TAG: u8 = 3;
pub const STRIPE_POLICY_TAG: u8 = 4;

/// One tagged segment; the body is at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoSegment {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl InfoSegment {
    pub fn packed_size(&self) -> usize {
        1 + bytes_size(&self.body)
    }

    pub fn encode(&self, buf: &mut BincodeBuf) {
        buf.pack_u8(self.tag);
        buf.pack_bytes(&self.body);
    }

    pub fn decode(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(InfoSegment { tag: cur.unpack_u8()?, body: cur.unpack_bytes()? })
    }
}

/// The full info attached to a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryInfo {
    pub segments: Vec<InfoSegment>,
}

impl DirectoryInfo {
    pub fn packed_size(&self) -> usize {
        2 + self.segments.iter().map(|s| s.packed_size()).sum::<usize>()
    }

    pub fn encode(&self, buf: &mut BincodeBuf) {
        buf.pack_list_len(self.segments.len());
        for seg in &self.segments {
            seg.encode(buf);
        }
    }

    pub fn decode(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        let len = cur.unpack_list_len()?;
        let mut segments = Vec::with_capacity(len);
        for _ in 0..len {
            segments.push(InfoSegment::decode(cur)?);
        }
        Ok(DirectoryInfo { segments })
    }
}

/// When snapshot edges become collectable. The high bit of
/// `delete_after_time` flags the field as set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub delete_after_time: u64,
    pub delete_after_versions: u16,
}

impl SnapshotPolicy {
    fn encode_segment(&self) -> InfoSegment {
        let mut buf = BincodeBuf::new();
        buf.pack_u64(self.delete_after_time);
        buf.pack_u16(self.delete_after_versions);
        InfoSegment { tag: SNAPSHOT_POLICY_TAG, body: buf.into_bytes() }
    }
}

/// Storage class by block size: the entry with the largest `min_size` not
/// above the block size wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPolicy {
    pub entries: Vec<BlockPolicyEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPolicyEntry {
    pub storage_class: StorageClass,
    pub min_size: u64,
}

impl BlockPolicy {
    fn encode_segment(&self) -> InfoSegment {
        let mut buf = BincodeBuf::new();
        buf.pack_list_len(self.entries.len());
        for e in &self.entries {
            buf.pack_u8(e.storage_class.0);
            buf.pack_u64(e.min_size);
        }
        InfoSegment { tag: BLOCK_POLICY_TAG, body: buf.into_bytes() }
    }
}

/// Parity by span size: the entry with the smallest `max_size` not below
/// the span size wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanPolicy {
    pub entries: Vec<SpanPolicyEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanPolicyEntry {
    pub max_size: u64,
    pub parity: Parity,
}

impl SpanPolicy {
    fn encode_segment(&self) -> InfoSegment {
        let mut buf = BincodeBuf::new();
        buf.pack_list_len(self.entries.len());
        for e in &self.entries {
            buf.pack_u64(e.max_size);
            buf.pack_u8(e.parity.0);
        }
        InfoSegment { tag: SPAN_POLICY_TAG, body: buf.into_bytes() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripePolicy {
    pub target_stripe_size: u32,
}

impl StripePolicy {
    fn encode_segment(&self) -> InfoSegment {
        let mut buf = BincodeBuf::new();
        buf.pack_u32(self.target_stripe_size);
        InfoSegment { tag: STRIPE_POLICY_TAG, body: buf.into_bytes() }
    }
}

const DAY_NS: u64 = 24 * 60 * 60 * 1_000_000_000;

/// The policy set written to the root directory when it is first created.
/// Small spans go to flash with wide parity, the rest to HDD; snapshots
/// expire after 30 days.
pub fn default_directory_info() -> DirectoryInfo {
    let snapshot = SnapshotPolicy {
        delete_after_time: (30 * DAY_NS) | (1 << 63),
        delete_after_versions: 0,
    };

    // ~2.5MB boundary, page aligned
    let flash_block_limit: u64 = 610 << 12;
    let block = BlockPolicy {
        entries: vec![
            BlockPolicyEntry { storage_class: FLASH_STORAGE, min_size: 0 },
            BlockPolicyEntry { storage_class: HDD_STORAGE, min_size: flash_block_limit },
        ],
    };

    let mut span_entries = vec![SpanPolicyEntry {
        max_size: 2 * flash_block_limit,
        parity: Parity::new(1, 4),
    }];
    for d in 2..=10u8 {
        let prev = span_entries.last().unwrap().max_size;
        span_entries.push(SpanPolicyEntry {
            max_size: prev + flash_block_limit,
            parity: Parity::new(d, 4),
        });
    }
    let span = SpanPolicy { entries: span_entries };

    let stripe = StripePolicy { target_stripe_size: 1 << 20 };

    DirectoryInfo {
        segments: vec![
            snapshot.encode_segment(),
            block.encode_segment(),
            span.encode_segment(),
            stripe.encode_segment(),
        ],
    }
}
