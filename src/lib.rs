//! Per-shard metadata state machine of a distributed filesystem.
//!
//! The shard persists the authoritative metadata for a disjoint subset of
//! inodes — directories, files, symlinks, transient files, the name
//! bindings between directories and children, file spans, and the reverse
//! index from block services to files. Reads are served from a shared
//! snapshot; writes go through a two-phase pipeline:
//! [`shard::ShardDb::prepare`] turns a request into a deterministic log
//! entry, and [`shard::ShardDb::apply`] executes ordered entries under an
//! exclusive write lock.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod bincode;
pub mod cache;
pub mod crc32c;
pub mod crypto;
pub mod error;
pub mod kv;
pub mod msgs;
pub mod policy;
pub mod schema;
pub mod shard;
pub mod types;

pub use cache::{BlockServiceInfo, BlockServicesCache, BlockServicesCacheDb, CurrentBlockService};
pub use error::{BincodeError, ShardOpenError, TernError};
pub use kv::{Family, IterBounds, KvIter, KvSnapshot, MemKv, WriteBatch};
pub use msgs::{
    ShardLogEntry, ShardLogEntryBody, ShardMessageKind, ShardReq, ShardReqMsg, ShardResp,
    ShardRespMsg,
};
pub use shard::{ShardDb, ShardOptions};
pub use types::{
    BlockId, BlockServiceId, Crc, HashMode, InodeId, InodeIdExtra, InodeType, Parity, ShardId,
    ShortBytes, SpanState, StorageClass, TernTime, NULL_INODE_ID, ROOT_DIR_INODE_ID,
};
