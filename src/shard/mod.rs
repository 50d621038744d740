//! The shard state machine.
//!
//! `ShardDb` owns the store handle and the shard identity (id, location,
//! secret key) and exposes the three entry points of the pipeline:
//!
//! - [`ShardDb::read`] serves queries against the shared read snapshot;
//! - [`ShardDb::prepare`] turns a write request into a deterministic log
//!   entry, resolving wall-clock time and block-service picks;
//! - [`ShardDb::apply`] executes ordered log entries under the exclusive
//!   write lock.

mod apply;
mod prepare;
mod read;

use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, RwLock};

use crate::bincode::BincodeBuf;
use crate::cache::BlockServicesCacheDb;
use crate::crypto::{generate_secret_key, Mac, MacKey, SecretKey};
use crate::error::{ShardOpenError, TernError};
use crate::kv::{Family, IterBounds, KvIter, KvSnapshot, MemKv, WriteBatch};
use crate::policy::default_directory_info;
use crate::schema::{
    decode_u64, encode_u64, inode_id_key, metadata_key, DirectoryBody, FileBody, MetadataKey,
    ShardInfoBody, TransientFileBody,
};
use crate::types::{
    compute_name_hash, BlockId, BlockServiceId, Crc, HashMode, InodeId, ShardId, TernTime,
    ROOT_DIR_INODE_ID,
};

/// Static configuration of one shard instance.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub shard_id: ShardId,
    /// Location this process serves; span reads project to it.
    pub location_id: u8,
    /// How long a transient file stays collectable-after, refreshed on
    /// every modification.
    pub transient_deadline_interval_ns: u64,
}

impl Default for ShardOptions {
    fn default() -> Self {
        ShardOptions {
            shard_id: ShardId(0),
            location_id: 0,
            transient_deadline_interval_ns: 60 * 60 * 1_000_000_000, // 1 hour
        }
    }
}

#[derive(Debug)]
pub struct ShardDb {
    pub(crate) opts: ShardOptions,
    pub(crate) kv: MemKv,
    pub(crate) cache: Arc<BlockServicesCacheDb>,
    pub(crate) secret_key: SecretKey,
    pub(crate) mac_key: MacKey,
    apply_lock: Mutex<()>,
    read_snapshot: RwLock<Arc<KvSnapshot>>,
}

impl ShardDb {
    /// Opens the shard over its store: verifies or creates the shard info
    /// record, zero-initializes the id counters and the log index, and
    /// creates the root directory when this shard owns it.
    pub fn open(
        opts: ShardOptions,
        kv: MemKv,
        cache: Arc<BlockServicesCacheDb>,
    ) -> Result<Self, ShardOpenError> {
        info!("event=shard_open shard={}", opts.shard_id);

        let secret_key = match kv.get(Family::Metadata, &metadata_key(MetadataKey::ShardInfo)) {
            Some(raw) => {
                let shard_info = ShardInfoBody::decode(&raw);
                if shard_info.shard_id != opts.shard_id {
                    return Err(ShardOpenError::ShardIdMismatch {
                        configured: opts.shard_id.0,
                        found: shard_info.shard_id.0,
                    });
                }
                shard_info.secret_key
            }
            None => {
                info!("event=shard_info_create shard={}", opts.shard_id);
                let secret_key = generate_secret_key();
                let mut batch = WriteBatch::new();
                batch.put(
                    Family::Metadata,
                    metadata_key(MetadataKey::ShardInfo),
                    ShardInfoBody { shard_id: opts.shard_id, secret_key }.encode(),
                );
                kv.write(batch);
                secret_key
            }
        };

        let mut batch = WriteBatch::new();
        let init_counter = |batch: &mut WriteBatch, key: MetadataKey, value: u64| {
            if kv.get(Family::Metadata, &metadata_key(key)).is_none() {
                info!("event=shard_counter_init shard={} counter={key:?}", opts.shard_id);
                batch.put(Family::Metadata, metadata_key(key), encode_u64(value));
            }
        };
        init_counter(
            &mut batch,
            MetadataKey::NextFileId,
            InodeId::new(crate::types::InodeType::File, opts.shard_id, 0).u64(),
        );
        init_counter(
            &mut batch,
            MetadataKey::NextSymlinkId,
            InodeId::new(crate::types::InodeType::Symlink, opts.shard_id, 0).u64(),
        );
        init_counter(&mut batch, MetadataKey::NextBlockId, opts.shard_id.0 as u64);
        init_counter(&mut batch, MetadataKey::LastAppliedLogIndex, 0);

        if opts.shard_id == ROOT_DIR_INODE_ID.shard()
            && kv.get(Family::Directories, &inode_id_key(ROOT_DIR_INODE_ID)).is_none()
        {
            info!("event=root_directory_create shard={}", opts.shard_id);
            let root = DirectoryBody {
                version: 0,
                owner_id: crate::types::NULL_INODE_ID,
                mtime: TernTime(0),
                hash_mode: HashMode::Xxh3_63,
                info: default_directory_info(),
            };
            batch.put(Family::Directories, inode_id_key(ROOT_DIR_INODE_ID), root.encode());
        }
        kv.write(batch);

        let read_snapshot = RwLock::new(Arc::new(kv.snapshot()));
        Ok(ShardDb {
            mac_key: MacKey::new(&secret_key),
            secret_key,
            opts,
            kv,
            cache,
            apply_lock: Mutex::new(()),
            read_snapshot,
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.opts.shard_id
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Flushes the store and refreshes the shared read snapshot; readers
    /// pick up everything committed so far.
    pub fn flush(&self) {
        *self.read_snapshot.write() = Arc::new(self.kv.snapshot());
    }

    pub fn last_applied(&self) -> u64 {
        last_applied_from(&self.kv)
    }

    pub(crate) fn current_read_snapshot(&self) -> Arc<KvSnapshot> {
        self.read_snapshot.read().clone()
    }

    pub(crate) fn with_apply_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.apply_lock.lock();
        f()
    }

    /// Cookie handed out with transient files: MAC of the raw id.
    pub(crate) fn calc_cookie(&self, id: InodeId) -> Mac {
        self.mac_key.cbc_mac(&id.u64().to_le_bytes())
    }
}

// ----------------------------------------------------------------
// store access shared by the three paths

/// The read half of the store interface: the apply path reads committed
/// state directly, the read and prepare paths read a frozen snapshot.
pub(crate) trait KvRead {
    fn get(&self, family: Family, key: &[u8]) -> Option<Vec<u8>>;
    fn iter(&self, family: Family, bounds: IterBounds) -> KvIter;
}

impl KvRead for MemKv {
    fn get(&self, family: Family, key: &[u8]) -> Option<Vec<u8>> {
        MemKv::get(self, family, key)
    }
    fn iter(&self, family: Family, bounds: IterBounds) -> KvIter {
        MemKv::iter(self, family, bounds)
    }
}

impl KvRead for KvSnapshot {
    fn get(&self, family: Family, key: &[u8]) -> Option<Vec<u8>> {
        KvSnapshot::get(self, family, key).map(|v| v.to_vec())
    }
    fn iter(&self, family: Family, bounds: IterBounds) -> KvIter {
        KvSnapshot::iter(self, family, bounds)
    }
}

pub(crate) fn last_applied_from(r: &impl KvRead) -> u64 {
    decode_u64(
        &r.get(Family::Metadata, &metadata_key(MetadataKey::LastAppliedLogIndex))
            .expect("last applied log index missing"),
    )
}

pub(crate) fn get_directory(
    r: &impl KvRead,
    id: InodeId,
    allow_snapshot: bool,
) -> Result<DirectoryBody, TernError> {
    if !id.is_directory() {
        return Err(TernError::TypeIsNotDirectory);
    }
    let raw = r
        .get(Family::Directories, &inode_id_key(id))
        .ok_or(TernError::DirectoryNotFound)?;
    let dir = DirectoryBody::decode(&raw);
    // the root dir never has an owner and is not a snapshot
    if !allow_snapshot && dir.owner_id.is_null() && id != ROOT_DIR_INODE_ID {
        return Err(TernError::DirectoryNotFound);
    }
    Ok(dir)
}

pub(crate) fn get_directory_and_hash(
    r: &impl KvRead,
    id: InodeId,
    allow_snapshot: bool,
    name: &[u8],
) -> Result<u64, TernError> {
    let dir = get_directory(r, id, allow_snapshot)?;
    Ok(compute_name_hash(dir.hash_mode, name))
}

pub(crate) fn get_file(r: &impl KvRead, id: InodeId) -> Result<FileBody, TernError> {
    if !id.is_file_or_symlink() {
        return Err(TernError::TypeIsDirectory);
    }
    let raw = r.get(Family::Files, &inode_id_key(id)).ok_or(TernError::FileNotFound)?;
    Ok(FileBody::decode(&raw))
}

pub(crate) fn get_transient_file(
    r: &impl KvRead,
    time: TernTime,
    allow_past_deadline: bool,
    id: InodeId,
) -> Result<TransientFileBody, TernError> {
    if !id.is_file_or_symlink() {
        return Err(TernError::TypeIsDirectory);
    }
    let raw = r
        .get(Family::TransientFiles, &inode_id_key(id))
        .ok_or(TernError::FileNotFound)?;
    let file = TransientFileBody::decode(&raw);
    if !allow_past_deadline && time > file.deadline {
        log::info!(
            "event=transient_file_past_deadline id={id} deadline={} entry_time={time}",
            file.deadline
        );
        return Err(TernError::FileNotFound);
    }
    Ok(file)
}

// ----------------------------------------------------------------
// block capability tokens

fn certificate_payload(f: impl FnOnce(&mut BincodeBuf)) -> [u8; 32] {
    let mut buf = BincodeBuf::with_capacity(32);
    f(&mut buf);
    let mut payload = [0u8; 32];
    payload[..buf.len()].copy_from_slice(buf.as_bytes());
    payload
}

/// Authorizes writing a block: MAC of `(service, 'w', block, crc, size)`.
pub fn block_write_certificate(
    key: &MacKey,
    block_service: BlockServiceId,
    block_id: BlockId,
    crc: Crc,
    block_size: u32,
) -> Mac {
    key.cbc_mac(&certificate_payload(|buf| {
        buf.pack_u64(block_service.0);
        buf.pack_u8(b'w');
        buf.pack_u64(block_id.0);
        buf.pack_u32(crc.0);
        buf.pack_u32(block_size);
    }))
}

/// Returned by a block service to prove a write: MAC of `(service, 'W', block)`.
pub fn block_write_proof(key: &MacKey, block_service: BlockServiceId, block_id: BlockId) -> Mac {
    key.cbc_mac(&certificate_payload(|buf| {
        buf.pack_u64(block_service.0);
        buf.pack_u8(b'W');
        buf.pack_u64(block_id.0);
    }))
}

/// Authorizes erasing a block: MAC of `(service, 'e', block)`.
pub fn block_erase_certificate(
    key: &MacKey,
    block_service: BlockServiceId,
    block_id: BlockId,
) -> Mac {
    key.cbc_mac(&certificate_payload(|buf| {
        buf.pack_u64(block_service.0);
        buf.pack_u8(b'e');
        buf.pack_u64(block_id.0);
    }))
}

/// Returned by a block service to prove an erase: MAC of `(service, 'E', block)`.
pub fn block_erase_proof(key: &MacKey, block_service: BlockServiceId, block_id: BlockId) -> Mac {
    key.cbc_mac(&certificate_payload(|buf| {
        buf.pack_u64(block_service.0);
        buf.pack_u8(b'E');
        buf.pack_u64(block_id.0);
    }))
}
