//! Apply path: deterministic execution of ordered log entries.
//!
//! Every apply runs under the exclusive write lock. The batch first
//! advances the last-applied index unconditionally and sets a savepoint;
//! handlers then mutate freely and can fail midway, because an error rolls
//! the batch back to the savepoint — the index advance commits either way,
//! the state change is all or nothing.
//!
//! Handlers read committed state, never their own batch, and are written
//! to be idempotent: re-applying an already-committed entry converges to
//! the same state and reports success.

use log::{debug, warn};

use crate::error::TernError;
use crate::kv::{Family, IterBounds, WriteBatch};
use crate::msgs::*;
use crate::schema::{
    block_service_to_file_key, decode_i64, decode_u64, edge_dir_end, edge_group_prefix,
    edge_key_current, edge_key_snapshot, encode_u64, inode_id_key, metadata_key, span_file_bounds,
    span_key, BlockServiceToFileKey, CurrentEdgeBody, DirectoryBody, EdgeKey, FileBody,
    LocationBlocks, MetadataKey, SnapshotEdgeBody, SpanBlock, SpanBody, SpanKey, SpanStorage,
    TransientFileBody,
};
use crate::types::{
    compute_name_hash, BlockId, BlockServiceId, HashMode, InodeId, InodeIdExtra, InodeType,
    SpanState, TernTime, NULL_INODE_ID,
};

use super::{
    block_erase_certificate, block_erase_proof, block_write_certificate, block_write_proof,
    get_directory, get_file, get_transient_file, last_applied_from, ShardDb,
};
use crate::crypto::MacKey;

impl ShardDb {
    /// Applies one log entry at `log_index`, which must be exactly one past
    /// the last applied index. Returns the response for the originating
    /// request; handler errors come back as an `Error` body while the
    /// index advance still commits.
    pub fn apply(&self, log_index: u64, entry: &ShardLogEntry) -> ShardResp {
        self.with_apply_lock(|| {
            debug!("event=shard_apply index={log_index} kind={:?}", entry.body.kind());
            let mut batch = WriteBatch::new();
            self.advance_last_applied(&mut batch, log_index);
            batch.set_savepoint();

            let time = entry.time;
            let result = self.apply_body(&mut batch, time, &entry.body);
            let resp = match result {
                Ok(resp) => resp,
                Err(err) => {
                    debug!(
                        "event=shard_apply_failed index={log_index} kind={:?} err={err}",
                        entry.body.kind()
                    );
                    batch.rollback_to_savepoint();
                    ShardResp::Error(err)
                }
            };
            self.kv.write(batch);
            resp
        })
    }

    fn advance_last_applied(&self, batch: &mut WriteBatch, index: u64) {
        let old = last_applied_from(&self.kv);
        assert!(
            old + 1 == index,
            "log index gap: last applied {old}, applying {index}"
        );
        batch.put(
            Family::Metadata,
            metadata_key(MetadataKey::LastAppliedLogIndex),
            encode_u64(index),
        );
    }

    fn apply_body(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        body: &ShardLogEntryBody,
    ) -> Result<ShardResp, TernError> {
        use ShardLogEntryBody as B;
        Ok(match body {
            B::ConstructFile(entry) => {
                ShardResp::ConstructFile(self.apply_construct_file(batch, time, entry)?)
            }
            B::LinkFile(entry) => ShardResp::LinkFile(self.apply_link_file(batch, time, entry)?),
            B::SameDirectoryRename(entry) => {
                ShardResp::SameDirectoryRename(self.apply_same_directory_rename(batch, time, entry)?)
            }
            B::SameDirectoryRenameSnapshot(entry) => ShardResp::SameDirectoryRenameSnapshot(
                self.apply_same_directory_rename_snapshot(batch, time, entry)?,
            ),
            B::SoftUnlinkFile(entry) => {
                ShardResp::SoftUnlinkFile(self.apply_soft_unlink_file(batch, time, entry)?)
            }
            B::CreateDirectoryInode(entry) => ShardResp::CreateDirectoryInode(
                self.apply_create_directory_inode(batch, time, entry)?,
            ),
            B::CreateLockedCurrentEdge(entry) => ShardResp::CreateLockedCurrentEdge(
                self.apply_create_locked_current_edge(batch, time, entry)?,
            ),
            B::LockCurrentEdge(entry) => {
                ShardResp::LockCurrentEdge(self.apply_lock_current_edge(batch, time, entry)?)
            }
            B::UnlockCurrentEdge(entry) => {
                ShardResp::UnlockCurrentEdge(self.apply_unlock_current_edge(batch, time, entry)?)
            }
            B::RemoveDirectoryOwner(entry) => ShardResp::RemoveDirectoryOwner(
                self.apply_remove_directory_owner(batch, time, entry)?,
            ),
            B::RemoveInode(entry) => {
                ShardResp::RemoveInode(self.apply_remove_inode(batch, time, entry)?)
            }
            B::SetDirectoryOwner(entry) => {
                ShardResp::SetDirectoryOwner(self.apply_set_directory_owner(batch, time, entry)?)
            }
            B::SetDirectoryInfo(entry) => {
                ShardResp::SetDirectoryInfo(self.apply_set_directory_info(batch, time, entry)?)
            }
            B::RemoveNonOwnedEdge(entry) => {
                ShardResp::RemoveNonOwnedEdge(self.apply_remove_non_owned_edge(batch, time, entry)?)
            }
            B::SameShardHardFileUnlink(entry) => ShardResp::SameShardHardFileUnlink(
                self.apply_same_shard_hard_file_unlink(batch, time, entry)?,
            ),
            B::RemoveSpanInitiate(entry) => {
                ShardResp::RemoveSpanInitiate(self.apply_remove_span_initiate(batch, time, entry)?)
            }
            B::AddInlineSpan(entry) => {
                ShardResp::AddInlineSpan(self.apply_add_inline_span(batch, time, entry)?)
            }
            B::AddSpanInitiate(entry) => {
                let resp = self.apply_add_span_initiate(batch, time, entry)?;
                if entry.with_reference {
                    ShardResp::AddSpanInitiateWithReference(AddSpanInitiateWithReferenceResp {
                        resp,
                    })
                } else {
                    ShardResp::AddSpanInitiate(resp)
                }
            }
            B::AddSpanAtLocationInitiate(entry) => {
                let resp = self.apply_add_span_initiate(batch, time, entry)?;
                ShardResp::AddSpanAtLocationInitiate(AddSpanAtLocationInitiateResp { resp })
            }
            B::AddSpanCertify(entry) => {
                ShardResp::AddSpanCertify(self.apply_add_span_certify(batch, time, entry)?)
            }
            B::AddSpanLocation(entry) => {
                ShardResp::AddSpanLocation(self.apply_add_span_location(batch, time, entry)?)
            }
            B::MakeFileTransient(entry) => {
                ShardResp::MakeFileTransient(self.apply_make_file_transient(batch, time, entry)?)
            }
            B::ScrapTransientFile(entry) => {
                ShardResp::ScrapTransientFile(self.apply_scrap_transient_file(batch, time, entry)?)
            }
            B::RemoveSpanCertify(entry) => {
                ShardResp::RemoveSpanCertify(self.apply_remove_span_certify(batch, time, entry)?)
            }
            B::RemoveOwnedSnapshotFileEdge(entry) => ShardResp::RemoveOwnedSnapshotFileEdge(
                self.apply_remove_owned_snapshot_file_edge(batch, time, entry)?,
            ),
            B::SwapBlocks(entry) => {
                ShardResp::SwapBlocks(self.apply_swap_blocks(batch, time, entry)?)
            }
            B::SwapSpans(entry) => ShardResp::SwapSpans(self.apply_swap_spans(batch, time, entry)?),
            B::MoveSpan(entry) => ShardResp::MoveSpan(self.apply_move_span(batch, time, entry)?),
            B::SetTime(entry) => ShardResp::SetTime(self.apply_set_time(batch, time, entry)?),
            B::RemoveZeroBlockServiceFiles(entry) => ShardResp::RemoveZeroBlockServiceFiles(
                self.apply_remove_zero_block_service_files(batch, time, entry)?,
            ),
        })
    }

    // ----------------------------------------------------------------
    // shared write preambles

    /// Reads a directory, rejects entries older than its mtime, and bumps
    /// the mtime. Every directory-touching write goes through here so
    /// snapshot edges stay unique per (dir, name, creation time).
    fn initiate_directory_modification(
        &self,
        time: TernTime,
        allow_snapshot: bool,
        batch: &mut WriteBatch,
        dir_id: InodeId,
    ) -> Result<DirectoryBody, TernError> {
        let mut dir = get_directory(&self.kv, dir_id, allow_snapshot)?;
        if dir.mtime >= time {
            warn!(
                "event=dir_mtime_too_recent dir={dir_id} mtime={} entry_time={time}",
                dir.mtime
            );
            return Err(TernError::MtimeIsTooRecent);
        }
        dir.mtime = time;
        batch.put(Family::Directories, inode_id_key(dir_id), dir.encode());
        Ok(dir)
    }

    fn initiate_directory_modification_and_hash(
        &self,
        time: TernTime,
        allow_snapshot: bool,
        batch: &mut WriteBatch,
        dir_id: InodeId,
        name: &[u8],
    ) -> Result<u64, TernError> {
        let dir = self.initiate_directory_modification(time, allow_snapshot, batch, dir_id)?;
        Ok(compute_name_hash(dir.hash_mode, name))
    }

    /// Same preamble for transient files. Deadline-insensitive operations
    /// (span removal, inode removal) pass `allow_past_deadline` and do not
    /// refresh the deadline, since their whole point is cleanup.
    fn initiate_transient_file_modification(
        &self,
        time: TernTime,
        allow_past_deadline: bool,
        batch: &mut WriteBatch,
        id: InodeId,
    ) -> Result<TransientFileBody, TernError> {
        let mut file = get_transient_file(&self.kv, time, allow_past_deadline, id)?;
        if file.mtime >= time {
            warn!(
                "event=transient_mtime_too_recent id={id} mtime={} entry_time={time}",
                file.mtime
            );
            return Err(TernError::MtimeIsTooRecent);
        }
        file.mtime = time;
        if !allow_past_deadline {
            file.deadline = time.plus_ns(self.opts.transient_deadline_interval_ns);
        }
        batch.put(Family::TransientFiles, inode_id_key(id), file.encode());
        Ok(file)
    }

    /// Creates (or idempotently re-creates) the current edge for
    /// `(dir, name)`. Returns the edge's creation time, which is the entry
    /// time unless an existing locked edge already carries one.
    ///
    /// Only locked edges can be created through the external API; unlocked
    /// creation is reserved for link and rename, which own their targets.
    fn create_current_edge(
        &self,
        time: TernTime,
        batch: &mut WriteBatch,
        dir_id: InodeId,
        name: &[u8],
        target_id: InodeId,
        locked: bool,
        old_creation_time: TernTime,
    ) -> Result<TernTime, TernError> {
        assert!(locked || !old_creation_time.is_set());

        let mut creation_time = time;
        // current edges never live in snapshot directories
        let name_hash =
            self.initiate_directory_modification_and_hash(time, false, batch, dir_id, name)?;

        let edge_key = edge_key_current(dir_id, name_hash, name);
        match self.kv.get(Family::Edges, &edge_key) {
            None => {
                // First one here. Snapshot edges all predate the entry time
                // except when replaying or racing, so check the newest one.
                let mut it = self.kv.iter(
                    Family::Edges,
                    IterBounds::both(edge_group_prefix(dir_id, true), edge_dir_end(dir_id)),
                );
                it.seek_for_prev(&edge_key_snapshot(dir_id, name_hash, name, TernTime(u64::MAX)));
                if it.valid() {
                    let key = EdgeKey::decode(it.key());
                    if key.snapshot
                        && key.name_hash == name_hash
                        && key.name == name
                        && key.creation_time >= creation_time
                    {
                        return Err(TernError::MoreRecentSnapshotEdge);
                    }
                }
            }
            Some(raw) => {
                let existing = CurrentEdgeBody::decode(&raw);
                if existing.locked() {
                    // an existing locked edge must be exactly the one the
                    // caller is retrying to create
                    if !locked {
                        return Err(TernError::NameIsLocked);
                    }
                    if existing.target.id() != target_id {
                        debug!(
                            "event=edge_target_mismatch expected={} got={target_id}",
                            existing.target.id()
                        );
                        return Err(TernError::MismatchingTarget);
                    }
                    if existing.creation_time != old_creation_time {
                        debug!(
                            "event=edge_time_mismatch expected={} got={old_creation_time}",
                            existing.creation_time
                        );
                        return Err(TernError::MismatchingCreationTime);
                    }
                    // the creation time does not budge
                    creation_time = existing.creation_time;
                } else {
                    // Kicking out a live edge: only file-over-file, the way
                    // rename(2) overrides work.
                    if existing.creation_time >= creation_time {
                        return Err(TernError::MoreRecentCurrentEdge);
                    }
                    if target_id.is_directory() || existing.target.id().is_directory() {
                        return Err(TernError::CannotOverrideName);
                    }
                    // the displaced edge becomes an owned snapshot edge
                    batch.put(
                        Family::Edges,
                        edge_key_snapshot(dir_id, name_hash, name, existing.creation_time),
                        SnapshotEdgeBody {
                            version: 0,
                            target: InodeIdExtra::new(existing.target.id(), true),
                        }
                        .encode(),
                    );
                }
            }
        }

        batch.put(
            Family::Edges,
            edge_key,
            CurrentEdgeBody {
                version: 0,
                target: InodeIdExtra::new(target_id, locked),
                creation_time,
            }
            .encode(),
        );
        Ok(creation_time)
    }

    /// Unlinks the current edge for `(dir, name)`, writing the historical
    /// snapshot edge (owned per the caller) plus a deletion snapshot edge
    /// at the entry time.
    fn soft_unlink_current_edge(
        &self,
        time: TernTime,
        batch: &mut WriteBatch,
        dir_id: InodeId,
        name: &[u8],
        creation_time: TernTime,
        target_id: InodeId,
        owned: bool,
    ) -> Result<(), TernError> {
        let name_hash =
            self.initiate_directory_modification_and_hash(time, false, batch, dir_id, name)?;

        let edge_key = edge_key_current(dir_id, name_hash, name);
        let raw = self.kv.get(Family::Edges, &edge_key).ok_or(TernError::EdgeNotFound)?;
        let edge = CurrentEdgeBody::decode(&raw);
        if edge.target.id() != target_id {
            debug!("event=edge_target_mismatch expected={target_id} got={}", edge.target.id());
            return Err(TernError::MismatchingTarget);
        }
        if edge.creation_time != creation_time {
            debug!(
                "event=edge_time_mismatch expected={} got={creation_time}",
                edge.creation_time
            );
            return Err(TernError::MismatchingCreationTime);
        }
        if edge.locked() {
            return Err(TernError::EdgeIsLocked);
        }

        batch.delete(Family::Edges, edge_key);
        batch.put(
            Family::Edges,
            edge_key_snapshot(dir_id, name_hash, name, edge.creation_time),
            SnapshotEdgeBody { version: 0, target: InodeIdExtra::new(target_id, owned) }.encode(),
        );
        // deletion edges mark when the name became free, and own nothing
        batch.put(
            Family::Edges,
            edge_key_snapshot(dir_id, name_hash, name, time),
            SnapshotEdgeBody { version: 0, target: InodeIdExtra::new(NULL_INODE_ID, false) }
                .encode(),
        );
        Ok(())
    }

    // ----------------------------------------------------------------
    // file construction and linking

    fn apply_construct_file(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &ConstructFileEntry,
    ) -> Result<ConstructFileResp, TernError> {
        let counter_key = if entry.file_type == InodeType::File as u8 {
            MetadataKey::NextFileId
        } else if entry.file_type == InodeType::Symlink as u8 {
            MetadataKey::NextSymlinkId
        } else {
            panic!("bad inode type {} in construct entry", entry.file_type);
        };
        let raw = self
            .kv
            .get(Family::Metadata, &metadata_key(counter_key))
            .expect("inode counter missing");
        let id = InodeId::from_u64(decode_u64(&raw) + crate::types::INODE_ID_STRIDE);
        batch.put(Family::Metadata, metadata_key(counter_key), encode_u64(id.u64()));

        let file = TransientFileBody {
            version: 0,
            file_size: 0,
            mtime: time,
            deadline: entry.deadline_time,
            last_span_state: SpanState::Clean,
            note: entry.note.as_slice().to_vec(),
        };
        batch.put(Family::TransientFiles, inode_id_key(id), file.encode());

        Ok(ConstructFileResp { id, cookie: self.calc_cookie(id) })
    }

    fn apply_link_file(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &LinkFileEntry,
    ) -> Result<LinkFileResp, TernError> {
        let transient = match get_transient_file(&self.kv, time, false, entry.file_id) {
            Ok(file) => file,
            Err(TernError::FileNotFound) => {
                // The file may already be linked; retrying clients land
                // here. The edge must point at exactly this file.
                let name_hash = match super::get_directory_and_hash(
                    &self.kv,
                    entry.owner_id,
                    false,
                    &entry.name,
                ) {
                    Ok(hash) => hash,
                    Err(_) => {
                        debug!("event=link_file_retry_no_dir file={}", entry.file_id);
                        return Err(TernError::FileNotFound);
                    }
                };
                let key = edge_key_current(entry.owner_id, name_hash, &entry.name);
                let Some(raw) = self.kv.get(Family::Edges, &key) else {
                    debug!("event=link_file_retry_no_edge file={}", entry.file_id);
                    return Err(TernError::FileNotFound);
                };
                let edge = CurrentEdgeBody::decode(&raw);
                if edge.target.id() != entry.file_id {
                    debug!("event=link_file_retry_mismatch file={}", entry.file_id);
                    return Err(TernError::FileNotFound);
                }
                return Ok(LinkFileResp { creation_time: edge.creation_time });
            }
            Err(err) => return Err(err),
        };
        if transient.last_span_state != SpanState::Clean {
            return Err(TernError::LastSpanStateNotClean);
        }

        // move from transient to durable
        batch.delete(Family::TransientFiles, inode_id_key(entry.file_id));
        let file = FileBody {
            version: 0,
            mtime: time,
            atime: time,
            file_size: transient.file_size,
        };
        batch.put(Family::Files, inode_id_key(entry.file_id), file.encode());

        let creation_time = self.create_current_edge(
            time,
            batch,
            entry.owner_id,
            &entry.name,
            entry.file_id,
            false,
            TernTime(0),
        )?;
        Ok(LinkFileResp { creation_time })
    }

    fn apply_same_directory_rename(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SameDirectoryRenameEntry,
    ) -> Result<SameDirectoryRenameResp, TernError> {
        // the old edge loses ownership: the target lives on under the new name
        self.soft_unlink_current_edge(
            time,
            batch,
            entry.dir_id,
            &entry.old_name,
            entry.old_creation_time,
            entry.target_id,
            false,
        )?;
        let new_creation_time = self.create_current_edge(
            time,
            batch,
            entry.dir_id,
            &entry.new_name,
            entry.target_id,
            false,
            TernTime(0),
        )?;
        Ok(SameDirectoryRenameResp { new_creation_time })
    }

    fn apply_same_directory_rename_snapshot(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SameDirectoryRenameSnapshotEntry,
    ) -> Result<SameDirectoryRenameSnapshotResp, TernError> {
        // First, disown the snapshot edge; owned edges cannot live in
        // snapshot directories, so no allow-snapshot here either.
        let name_hash = self.initiate_directory_modification_and_hash(
            time,
            false,
            batch,
            entry.dir_id,
            &entry.old_name,
        )?;
        let key =
            edge_key_snapshot(entry.dir_id, name_hash, &entry.old_name, entry.old_creation_time);
        let raw = self.kv.get(Family::Edges, &key).ok_or(TernError::EdgeNotFound)?;
        let edge = SnapshotEdgeBody::decode(&raw);
        if edge.target.id() != entry.target_id {
            debug!(
                "event=edge_target_mismatch expected={} got={}",
                entry.target_id,
                edge.target.id()
            );
            return Err(TernError::MismatchingTarget);
        }
        if !edge.owned() {
            return Err(TernError::EdgeNotOwned);
        }
        batch.put(
            Family::Edges,
            key,
            SnapshotEdgeBody {
                version: 0,
                target: InodeIdExtra::new(entry.target_id, false),
            }
            .encode(),
        );

        let new_creation_time = self.create_current_edge(
            time,
            batch,
            entry.dir_id,
            &entry.new_name,
            entry.target_id,
            false,
            TernTime(0),
        )?;
        Ok(SameDirectoryRenameSnapshotResp { new_creation_time })
    }

    fn apply_soft_unlink_file(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SoftUnlinkFileEntry,
    ) -> Result<SoftUnlinkFileResp, TernError> {
        self.soft_unlink_current_edge(
            time,
            batch,
            entry.owner_id,
            &entry.name,
            entry.creation_time,
            entry.file_id,
            true,
        )?;
        Ok(SoftUnlinkFileResp { delete_creation_time: time })
    }

    // ----------------------------------------------------------------
    // directory lifecycle and the cross-shard edge protocol

    fn apply_create_directory_inode(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &CreateDirectoryInodeEntry,
    ) -> Result<CreateDirectoryInodeResp, TernError> {
        // Only the directory coordinator creates directories and it doles
        // out ids transactionally, but retries still land here.
        match get_directory(&self.kv, entry.id, false) {
            Ok(dir) => {
                return if dir.owner_id != entry.owner_id {
                    Err(TernError::MismatchingOwner)
                } else {
                    Ok(CreateDirectoryInodeResp { mtime: dir.mtime })
                };
            }
            Err(TernError::DirectoryNotFound) => {}
            Err(err) => return Err(err),
        }

        let dir = DirectoryBody {
            version: 0,
            owner_id: entry.owner_id,
            mtime: time,
            hash_mode: HashMode::Xxh3_63,
            info: entry.info.clone(),
        };
        batch.put(Family::Directories, inode_id_key(entry.id), dir.encode());
        Ok(CreateDirectoryInodeResp { mtime: time })
    }

    fn apply_create_locked_current_edge(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &CreateLockedCurrentEdgeEntry,
    ) -> Result<CreateLockedCurrentEdgeResp, TernError> {
        let creation_time = self.create_current_edge(
            time,
            batch,
            entry.dir_id,
            &entry.name,
            entry.target_id,
            true,
            entry.old_creation_time,
        )?;
        Ok(CreateLockedCurrentEdgeResp { creation_time })
    }

    fn apply_lock_current_edge(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &LockCurrentEdgeEntry,
    ) -> Result<LockCurrentEdgeResp, TernError> {
        let name_hash = self.initiate_directory_modification_and_hash(
            time,
            false,
            batch,
            entry.dir_id,
            &entry.name,
        )?;
        let key = edge_key_current(entry.dir_id, name_hash, &entry.name);
        let raw = self.kv.get(Family::Edges, &key).ok_or(TernError::EdgeNotFound)?;
        let mut edge = CurrentEdgeBody::decode(&raw);
        if edge.creation_time != entry.creation_time {
            debug!(
                "event=edge_time_mismatch expected={} got={}",
                edge.creation_time, entry.creation_time
            );
            return Err(TernError::MismatchingCreationTime);
        }
        if !edge.locked() {
            edge.target = InodeIdExtra::new(entry.target_id, true);
            batch.put(Family::Edges, key, edge.encode());
        }
        Ok(LockCurrentEdgeResp {})
    }

    fn apply_unlock_current_edge(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &UnlockCurrentEdgeEntry,
    ) -> Result<UnlockCurrentEdgeResp, TernError> {
        let name_hash = self.initiate_directory_modification_and_hash(
            time,
            false,
            batch,
            entry.dir_id,
            &entry.name,
        )?;
        let key = edge_key_current(entry.dir_id, name_hash, &entry.name);
        let raw = self.kv.get(Family::Edges, &key).ok_or(TernError::EdgeNotFound)?;
        let mut edge = CurrentEdgeBody::decode(&raw);
        if edge.creation_time != entry.creation_time {
            debug!(
                "event=edge_time_mismatch expected={} got={}",
                edge.creation_time, entry.creation_time
            );
            return Err(TernError::MismatchingCreationTime);
        }
        if edge.locked() {
            edge.target = InodeIdExtra::new(entry.target_id, false);
            batch.put(Family::Edges, key.clone(), edge.encode());
        }
        if entry.was_moved {
            // a cross-shard rename completed: retire the name here
            batch.delete(Family::Edges, key);
            batch.put(
                Family::Edges,
                edge_key_snapshot(entry.dir_id, name_hash, &entry.name, edge.creation_time),
                SnapshotEdgeBody {
                    version: 0,
                    target: InodeIdExtra::new(entry.target_id, false),
                }
                .encode(),
            );
            batch.put(
                Family::Edges,
                edge_key_snapshot(entry.dir_id, name_hash, &entry.name, time),
                SnapshotEdgeBody { version: 0, target: InodeIdExtra::new(NULL_INODE_ID, false) }
                    .encode(),
            );
        }
        Ok(UnlockCurrentEdgeResp {})
    }

    fn apply_remove_directory_owner(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveDirectoryOwnerEntry,
    ) -> Result<RemoveDirectoryOwnerResp, TernError> {
        // allow snapshot for idempotency: re-applying sees owner == NULL
        let dir =
            self.initiate_directory_modification(time, true, batch, entry.dir_id)?;
        if dir.owner_id.is_null() {
            return Ok(RemoveDirectoryOwnerResp {});
        }

        // any current edge blocks the removal
        let mut it = self.kv.iter(
            Family::Edges,
            IterBounds::both(
                edge_group_prefix(entry.dir_id, false),
                edge_group_prefix(entry.dir_id, true),
            ),
        );
        it.seek(&edge_key_current(entry.dir_id, 0, b""));
        if it.valid() {
            return Err(TernError::DirectoryNotEmpty);
        }

        // the info may change size, so write a fresh body
        let new_dir = DirectoryBody {
            version: 0,
            owner_id: NULL_INODE_ID,
            mtime: time,
            hash_mode: dir.hash_mode,
            info: entry.info.clone(),
        };
        batch.put(Family::Directories, inode_id_key(entry.dir_id), new_dir.encode());
        Ok(RemoveDirectoryOwnerResp {})
    }

    fn apply_remove_inode(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveInodeEntry,
    ) -> Result<RemoveInodeResp, TernError> {
        if entry.id.is_directory() {
            self.apply_remove_directory_inode(batch, time, entry)
        } else {
            self.apply_remove_file_inode(batch, time, entry)
        }
    }

    fn apply_remove_directory_inode(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveInodeEntry,
    ) -> Result<RemoveInodeResp, TernError> {
        let dir = match self.initiate_directory_modification(time, true, batch, entry.id) {
            Ok(dir) => dir,
            Err(TernError::DirectoryNotFound) => return Ok(RemoveInodeResp {}), // already gone
            Err(err) => return Err(err),
        };
        if !dir.owner_id.is_null() {
            return Err(TernError::DirectoryHasOwner);
        }
        // no outgoing edges of any kind may remain
        let mut it = self.kv.iter(
            Family::Edges,
            IterBounds::both(edge_group_prefix(entry.id, false), edge_dir_end(entry.id)),
        );
        it.seek(&edge_group_prefix(entry.id, false));
        if it.valid() {
            debug!("event=remove_dir_not_empty dir={}", entry.id);
            return Err(TernError::DirectoryNotEmpty);
        }
        batch.delete(Family::Directories, inode_id_key(entry.id));
        Ok(RemoveInodeResp {})
    }

    fn apply_remove_file_inode(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveInodeEntry,
    ) -> Result<RemoveInodeResp, TernError> {
        let transient = match get_transient_file(&self.kv, time, true, entry.id) {
            Ok(file) => file,
            Err(TernError::FileNotFound) => {
                return match get_file(&self.kv, entry.id) {
                    Ok(_) => Err(TernError::FileIsNotTransient),
                    // the inode is just gone; repeated removals are fine
                    Err(TernError::FileNotFound) => Ok(RemoveInodeResp {}),
                    Err(err) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };
        if transient.deadline >= time {
            return Err(TernError::DeadlineNotPassed);
        }
        let mut it = self.kv.iter(Family::Spans, span_file_bounds(entry.id));
        it.seek(&span_key(entry.id, 0));
        if it.valid() {
            return Err(TernError::FileNotEmpty);
        }
        batch.delete(Family::TransientFiles, inode_id_key(entry.id));
        Ok(RemoveInodeResp {})
    }

    fn apply_set_directory_owner(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SetDirectoryOwnerEntry,
    ) -> Result<SetDirectoryOwnerResp, TernError> {
        let mut dir = self.initiate_directory_modification(time, true, batch, entry.dir_id)?;
        // The info may still be the non-inherited one if the owner was
        // removed first; uncommon enough to live with.
        dir.owner_id = entry.owner_id;
        batch.put(Family::Directories, inode_id_key(entry.dir_id), dir.encode());
        Ok(SetDirectoryOwnerResp {})
    }

    fn apply_set_directory_info(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SetDirectoryInfoEntry,
    ) -> Result<SetDirectoryInfoResp, TernError> {
        // allow snapshot: deletion policies of already-deleted directories
        // remain tweakable
        let dir = self.initiate_directory_modification(time, true, batch, entry.dir_id)?;
        let new_dir = DirectoryBody {
            version: 0,
            owner_id: dir.owner_id,
            mtime: dir.mtime,
            hash_mode: dir.hash_mode,
            info: entry.info.clone(),
        };
        batch.put(Family::Directories, inode_id_key(entry.dir_id), new_dir.encode());
        Ok(SetDirectoryInfoResp {})
    }

    fn apply_remove_non_owned_edge(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveNonOwnedEdgeEntry,
    ) -> Result<RemoveNonOwnedEdgeResp, TernError> {
        // GC must reach into snapshot directories
        let name_hash = self.initiate_directory_modification_and_hash(
            time,
            true,
            batch,
            entry.dir_id,
            &entry.name,
        )?;
        let key = edge_key_snapshot(entry.dir_id, name_hash, &entry.name, entry.creation_time);
        let Some(raw) = self.kv.get(Family::Edges, &key) else {
            return Ok(RemoveNonOwnedEdgeResp {}); // already collected
        };
        let edge = SnapshotEdgeBody::decode(&raw);
        if edge.owned() {
            // deleting an owned edge would orphan its file
            return Err(TernError::EdgeNotFound);
        }
        batch.delete(Family::Edges, key);
        Ok(RemoveNonOwnedEdgeResp {})
    }

    fn apply_same_shard_hard_file_unlink(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SameShardHardFileUnlinkEntry,
    ) -> Result<SameShardHardFileUnlinkResp, TernError> {
        let file = match get_file(&self.kv, entry.target_id) {
            Ok(file) => file,
            Err(TernError::FileNotFound) => {
                // already transient means already done
                return match get_transient_file(&self.kv, time, true, entry.target_id) {
                    Ok(_) => Ok(SameShardHardFileUnlinkResp {}),
                    Err(err) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        // GC also runs inside snapshot directories
        let name_hash = self.initiate_directory_modification_and_hash(
            time,
            true,
            batch,
            entry.owner_id,
            &entry.name,
        )?;

        // The edge must still own the file; it may have been re-owned in
        // the meantime, in which case making the file transient would lose
        // data.
        let key = edge_key_snapshot(entry.owner_id, name_hash, &entry.name, entry.creation_time);
        let raw = self.kv.get(Family::Edges, &key).ok_or(TernError::EdgeNotFound)?;
        let edge = SnapshotEdgeBody::decode(&raw);
        if !edge.owned() {
            return Err(TernError::EdgeNotFound);
        }
        batch.delete(Family::Edges, key);

        batch.delete(Family::Files, inode_id_key(entry.target_id));
        let transient = TransientFileBody {
            version: 0,
            file_size: file.file_size,
            mtime: time,
            deadline: entry.deadline_time,
            last_span_state: SpanState::Clean,
            note: entry.name.as_slice().to_vec(),
        };
        batch.put(Family::TransientFiles, inode_id_key(entry.target_id), transient.encode());
        Ok(SameShardHardFileUnlinkResp {})
    }

    // ----------------------------------------------------------------
    // spans

    fn apply_remove_span_initiate(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveSpanInitiateEntry,
    ) -> Result<RemoveSpanInitiateResp, TernError> {
        let mut file =
            self.initiate_transient_file_modification(time, true, batch, entry.file_id)?;

        // The size check keeps us from scanning tombstones of an empty file.
        if file.file_size == 0 {
            return Err(TernError::FileEmpty);
        }

        let mut it = self.kv.iter(Family::Spans, span_file_bounds(entry.file_id));
        it.seek_for_prev(&span_key(entry.file_id, file.file_size));
        assert!(it.valid(), "file {} has size but no spans", entry.file_id);
        let key = SpanKey::decode(it.key());
        let span = SpanBody::decode(it.value());

        let mut resp = RemoveSpanInitiateResp { byte_offset: key.byte_offset, blocks: Vec::new() };

        if span.is_inline() {
            batch.delete(Family::Spans, span_key(entry.file_id, key.byte_offset));
            file.file_size = key.byte_offset;
            batch.put(Family::TransientFiles, inode_id_key(entry.file_id), file.encode());
            return Ok(resp);
        }

        // Blocked spans get condemned first and erased on certify. Dirty
        // spans are accepted so a writer that died mid-add can be cleaned
        // up.
        file.last_span_state = SpanState::Condemned;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id), file.encode());

        let cache = self.cache.get_cache();
        for loc in span.locations() {
            for block in &loc.blocks {
                let info = cache
                    .info(block.block_service)
                    .unwrap_or_else(|| panic!("block service {} not in cache", block.block_service));
                resp.blocks.push(RemoveSpanInitiateBlockInfo {
                    block_service_addrs: info.addrs,
                    block_service_id: block.block_service,
                    block_service_flags: info.flags,
                    block_id: block.block_id,
                    certificate: block_erase_certificate(
                        &MacKey::new(&info.secret_key),
                        block.block_service,
                        block.block_id,
                    ),
                });
            }
        }
        Ok(resp)
    }

    fn next_block_id(&self) -> u64 {
        decode_u64(
            &self
                .kv
                .get(Family::Metadata, &metadata_key(MetadataKey::NextBlockId))
                .expect("next block id missing"),
        )
    }

    /// Block ids embed the allocation time, with the shard in the low
    /// byte, and never go backwards.
    fn bump_block_id(&self, time: TernTime, next: &mut u64) -> BlockId {
        *next = (*next + 0x100).max((time.0 & !0xFF) | self.opts.shard_id.0 as u64);
        BlockId(*next)
    }

    fn add_block_services_to_files(
        &self,
        batch: &mut WriteBatch,
        block_service: BlockServiceId,
        file_id: InodeId,
        delta: i64,
    ) {
        debug!(
            "event=reverse_index_delta block_service={block_service} file={file_id} delta={delta}"
        );
        batch.merge_add(
            Family::BlockServicesToFiles,
            block_service_to_file_key(block_service, file_id),
            delta,
        );
    }

    fn apply_add_inline_span(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &AddInlineSpanEntry,
    ) -> Result<AddInlineSpanResp, TernError> {
        let mut file =
            self.initiate_transient_file_modification(time, false, batch, entry.file_id)?;

        // empty spans store nothing
        if entry.body.is_empty() {
            return Ok(AddInlineSpanResp {});
        }

        if file.file_size != entry.byte_offset {
            // Re-adding the same span is fine; anything else is not.
            if file.file_size == entry.byte_offset + entry.size as u64 {
                let raw = self
                    .kv
                    .get(Family::Spans, &span_key(entry.file_id, entry.byte_offset))
                    .ok_or(TernError::SpanNotFound)?;
                let existing = SpanBody::decode(&raw);
                let matches = existing.span_size == entry.size
                    && existing.crc == entry.crc
                    && matches!(&existing.storage, SpanStorage::Inline(body) if body.as_slice() == entry.body.as_slice());
                if !matches {
                    debug!("event=inline_span_mismatch file={}", entry.file_id);
                    return Err(TernError::SpanNotFound);
                }
                return Ok(AddInlineSpanResp {});
            }
            debug!(
                "event=span_offset_mismatch file={} size={} offset={}",
                entry.file_id, file.file_size, entry.byte_offset
            );
            return Err(TernError::SpanNotFound);
        }

        if file.last_span_state != SpanState::Clean {
            return Err(TernError::LastSpanStateNotClean);
        }

        // inline spans need no certification, the state stays clean
        file.file_size = entry.byte_offset + entry.size as u64;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id), file.encode());

        let span = SpanBody {
            span_size: entry.size,
            crc: entry.crc,
            storage: SpanStorage::Inline(entry.body.as_slice().to_vec()),
        };
        batch.put(Family::Spans, span_key(entry.file_id, entry.byte_offset), span.encode());
        Ok(AddInlineSpanResp {})
    }

    fn apply_add_span_initiate(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &AddSpanAtLocationInitiateEntry,
    ) -> Result<AddSpanInitiateResp, TernError> {
        let mut file =
            self.initiate_transient_file_modification(time, false, batch, entry.file_id)?;

        if file.file_size != entry.byte_offset {
            // Idempotent retry: the span must match what we recorded, and
            // we must return the blocks we first chose — the client has to
            // either write those or scrap the file, otherwise blocks leak.
            if file.file_size == entry.byte_offset + entry.size as u64 {
                let raw = self
                    .kv
                    .get(Family::Spans, &span_key(entry.file_id, entry.byte_offset))
                    .ok_or(TernError::SpanNotFound)?;
                let existing = SpanBody::decode(&raw);
                let loc = (!existing.is_inline() && existing.locations().len() == 1)
                    .then(|| &existing.locations()[0]);
                let matches = loc.is_some_and(|loc| {
                    existing.span_size == entry.size
                        && existing.crc == entry.crc
                        && loc.cell_size == entry.cell_size
                        && loc.stripes == entry.stripes
                        && loc.parity == entry.parity
                        && loc.location_id == entry.location_id
                });
                let Some(loc) = (if matches { loc } else { None }) else {
                    debug!("event=span_mismatch file={}", entry.file_id);
                    return Err(TernError::SpanNotFound);
                };
                return Ok(self.fill_in_add_span_initiate(loc));
            }
            debug!(
                "event=span_offset_mismatch file={} size={} offset={}",
                entry.file_id, file.file_size, entry.byte_offset
            );
            return Err(TernError::SpanNotFound);
        }

        if file.last_span_state != SpanState::Clean {
            return Err(TernError::LastSpanStateNotClean);
        }

        file.file_size = entry.byte_offset + entry.size as u64;
        file.last_span_state = SpanState::Dirty;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id), file.encode());

        // allocate the block ids and record the reverse index
        let mut next = self.next_block_id();
        let mut blocks = Vec::with_capacity(entry.body_blocks.len());
        for entry_block in &entry.body_blocks {
            let block_id = self.bump_block_id(time, &mut next);
            blocks.push(SpanBlock {
                block_service: entry_block.block_service_id,
                block_id,
                crc: entry_block.crc,
            });
            self.add_block_services_to_files(
                batch,
                entry_block.block_service_id,
                entry.file_id,
                1,
            );
        }
        batch.put(Family::Metadata, metadata_key(MetadataKey::NextBlockId), encode_u64(next));

        let loc = LocationBlocks {
            location_id: entry.location_id,
            storage_class: entry.storage_class,
            parity: entry.parity,
            stripes: entry.stripes,
            cell_size: entry.cell_size,
            stripe_crcs: entry.body_stripes.clone(),
            blocks,
        };
        let resp = self.fill_in_add_span_initiate(&loc);
        let span = SpanBody {
            span_size: entry.size,
            crc: entry.crc,
            storage: SpanStorage::Blocks(vec![loc]),
        };
        batch.put(Family::Spans, span_key(entry.file_id, entry.byte_offset), span.encode());
        Ok(resp)
    }

    fn fill_in_add_span_initiate(&self, loc: &LocationBlocks) -> AddSpanInitiateResp {
        let cache = self.cache.get_cache();
        let block_size = loc.block_size();
        let blocks = loc
            .blocks
            .iter()
            .map(|block| {
                let info = cache
                    .info(block.block_service)
                    .unwrap_or_else(|| panic!("block service {} not in cache", block.block_service));
                AddSpanInitiateBlockInfo {
                    block_service_addrs: info.addrs,
                    block_service_id: block.block_service,
                    block_service_failure_domain: info.failure_domain,
                    block_id: block.block_id,
                    certificate: block_write_certificate(
                        &MacKey::new(&info.secret_key),
                        block.block_service,
                        block.block_id,
                        block.crc,
                        block_size,
                    ),
                }
            })
            .collect();
        AddSpanInitiateResp { blocks }
    }

    fn apply_add_span_certify(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &AddSpanCertifyEntry,
    ) -> Result<AddSpanCertifyResp, TernError> {
        let mut file =
            self.initiate_transient_file_modification(time, false, batch, entry.file_id)?;

        let raw = self
            .kv
            .get(Family::Spans, &span_key(entry.file_id, entry.byte_offset))
            .ok_or(TernError::SpanNotFound)?;
        let span = SpanBody::decode(&raw);

        if file.file_size > entry.byte_offset + span.span_size as u64 {
            return Ok(AddSpanCertifyResp {}); // already past this span
        }
        match file.last_span_state {
            SpanState::Clean => return Ok(AddSpanCertifyResp {}), // already certified
            SpanState::Condemned => return Err(TernError::SpanNotFound),
            SpanState::Dirty => {}
        }
        if span.is_inline() {
            return Err(TernError::CannotCertifyBlocklessSpan);
        }
        assert!(span.locations().len() == 1, "dirty span with multiple locations");
        let loc = &span.locations()[0];
        if loc.blocks.len() != entry.proofs.len() {
            return Err(TernError::BadNumberOfBlocksProofs);
        }
        let cache = self.cache.get_cache();
        for (block, proof) in loc.blocks.iter().zip(&entry.proofs) {
            let info = cache
                .info(block.block_service)
                .unwrap_or_else(|| panic!("block service {} not in cache", block.block_service));
            let expected =
                block_write_proof(&MacKey::new(&info.secret_key), block.block_service, proof.block_id);
            if proof.proof != expected {
                return Err(TernError::BadBlockProof);
            }
        }

        file.last_span_state = SpanState::Clean;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id), file.encode());
        Ok(AddSpanCertifyResp {})
    }

    fn apply_remove_span_certify(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveSpanCertifyEntry,
    ) -> Result<RemoveSpanCertifyResp, TernError> {
        let mut file =
            self.initiate_transient_file_modification(time, true, batch, entry.file_id)?;

        let Some(raw) = self.kv.get(Family::Spans, &span_key(entry.file_id, entry.byte_offset))
        else {
            debug!(
                "event=remove_span_already_done file={} offset={}",
                entry.file_id, entry.byte_offset
            );
            return Ok(RemoveSpanCertifyResp {});
        };
        let span = SpanBody::decode(&raw);
        if span.is_inline() {
            return Err(TernError::CannotCertifyBlocklessSpan);
        }
        if file.last_span_state != SpanState::Condemned {
            return Err(TernError::SpanNotFound);
        }

        // one proof per block, across every location, in storage order
        let cache = self.cache.get_cache();
        let mut proof_ix = 0;
        for loc in span.locations() {
            if entry.proofs.len() - proof_ix < loc.blocks.len() {
                return Err(TernError::BadNumberOfBlocksProofs);
            }
            for block in &loc.blocks {
                let proof = &entry.proofs[proof_ix];
                proof_ix += 1;
                if block.block_id != proof.block_id {
                    warn!(
                        "event=bad_erase_proof_id file={} expected={} got={}",
                        entry.file_id, block.block_id, proof.block_id
                    );
                    return Err(TernError::BadBlockProof);
                }
                let info = cache
                    .info(block.block_service)
                    .unwrap_or_else(|| panic!("block service {} not in cache", block.block_service));
                let expected = block_erase_proof(
                    &MacKey::new(&info.secret_key),
                    block.block_service,
                    block.block_id,
                );
                if proof.proof != expected {
                    warn!(
                        "event=bad_erase_proof file={} block_service={}",
                        entry.file_id, block.block_service
                    );
                    return Err(TernError::BadBlockProof);
                }
                self.add_block_services_to_files(batch, block.block_service, entry.file_id, -1);
            }
        }
        if proof_ix != entry.proofs.len() {
            return Err(TernError::BadNumberOfBlocksProofs);
        }

        debug!("event=remove_span file={} offset={}", entry.file_id, entry.byte_offset);
        batch.delete(Family::Spans, span_key(entry.file_id, entry.byte_offset));
        file.last_span_state = SpanState::Clean;
        file.file_size = entry.byte_offset;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id), file.encode());
        Ok(RemoveSpanCertifyResp {})
    }

    fn apply_add_span_location(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &AddSpanLocationEntry,
    ) -> Result<AddSpanLocationResp, TernError> {
        get_file(&self.kv, entry.file_id2)?;

        let mut source_file =
            self.initiate_transient_file_modification(time, false, batch, entry.file_id1)?;
        if source_file.last_span_state != SpanState::Clean {
            return Err(TernError::LastSpanStateNotClean);
        }

        let mut dest_span = self
            .fetch_span(entry.file_id2, entry.byte_offset2)
            .ok_or(TernError::SpanNotFound)?;
        if dest_span.is_inline() {
            return Err(TernError::AddSpanLocationInlineStorage);
        }

        let Some(source_span) = self.fetch_span(entry.file_id1, entry.byte_offset1) else {
            // maybe we already moved these exact blocks over
            let moved = dest_span.locations().iter().any(|loc| {
                loc.blocks.len() == entry.blocks1.len()
                    && loc.blocks.iter().zip(&entry.blocks1).all(|(b, id)| b.block_id.0 == *id)
            });
            if moved {
                return Ok(AddSpanLocationResp {});
            }
            return Err(TernError::SpanNotFound);
        };
        if source_span.is_inline() {
            return Err(TernError::SwapSpansInlineStorage);
        }

        if source_span.span_size != dest_span.span_size {
            return Err(TernError::AddSpanLocationMismatchingSize);
        }
        if source_span.crc != dest_span.crc {
            return Err(TernError::AddSpanLocationMismatchingCrc);
        }

        let state = self.fetch_span_state(
            time,
            entry.file_id1,
            entry.byte_offset1 + source_span.span_size as u64,
        );
        if state != SpanState::Clean {
            return Err(TernError::AddSpanLocationNotClean);
        }

        if source_span.locations().len() != 1 {
            return Err(TernError::TransientLocationCount);
        }
        let source_loc = source_span.locations()[0].clone();

        if dest_span.locations().iter().any(|loc| loc.location_id == source_loc.location_id) {
            return Err(TernError::AddSpanLocationExists);
        }

        for block in &source_loc.blocks {
            self.add_block_services_to_files(batch, block.block_service, entry.file_id2, 1);
            self.add_block_services_to_files(batch, block.block_service, entry.file_id1, -1);
        }

        source_file.file_size -= source_span.span_size as u64;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id1), source_file.encode());

        dest_span.locations_mut().push(source_loc);
        batch.put(
            Family::Spans,
            span_key(entry.file_id2, entry.byte_offset2),
            dest_span.encode(),
        );
        batch.delete(Family::Spans, span_key(entry.file_id1, entry.byte_offset1));
        Ok(AddSpanLocationResp {})
    }

    fn fetch_span(&self, file_id: InodeId, byte_offset: u64) -> Option<SpanBody> {
        self.kv
            .get(Family::Spans, &span_key(file_id, byte_offset))
            .map(|raw| SpanBody::decode(&raw))
    }

    /// State of the span ending at `span_end`: clean unless the file is
    /// transient and this is its (possibly dirty or condemned) last span.
    fn fetch_span_state(&self, time: TernTime, file_id: InodeId, span_end: u64) -> SpanState {
        match get_file(&self.kv, file_id) {
            Ok(_) => SpanState::Clean,
            Err(TernError::FileNotFound) => {
                let file = get_transient_file(&self.kv, time, true, file_id)
                    .expect("span owner neither durable nor transient");
                if span_end == file.file_size {
                    file.last_span_state
                } else {
                    SpanState::Clean
                }
            }
            Err(err) => panic!("unexpected error fetching span owner {file_id}: {err}"),
        }
    }

    fn apply_swap_blocks(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SwapBlocksEntry,
    ) -> Result<SwapBlocksResp, TernError> {
        let mut span1 = self
            .fetch_span(entry.file_id1, entry.byte_offset1)
            .ok_or(TernError::SpanNotFound)?;
        let mut span2 = self
            .fetch_span(entry.file_id2, entry.byte_offset2)
            .ok_or(TernError::SpanNotFound)?;
        if span1.is_inline() || span2.is_inline() {
            return Err(TernError::SwapBlocksInlineStorage);
        }

        let state1 =
            self.fetch_span_state(time, entry.file_id1, entry.byte_offset1 + span1.span_size as u64);
        let state2 =
            self.fetch_span_state(time, entry.file_id2, entry.byte_offset2 + span2.span_size as u64);
        // never mix certified and uncertified blocks in one span
        if state1 != state2 {
            return Err(TernError::SwapBlocksMismatchingState);
        }

        let find_block = |span: &SpanBody, block_id: BlockId| -> Option<(usize, usize)> {
            span.locations().iter().enumerate().find_map(|(loc_ix, loc)| {
                loc.blocks
                    .iter()
                    .position(|b| b.block_id == block_id)
                    .map(|block_ix| (loc_ix, block_ix))
            })
        };
        let pos1 = find_block(&span1, entry.block_id1);
        let pos2 = find_block(&span2, entry.block_id2);
        let (Some(pos1), Some(pos2)) = (pos1, pos2) else {
            // both missing and present crosswise means we already swapped
            if pos1.is_none()
                && pos2.is_none()
                && find_block(&span1, entry.block_id2).is_some()
                && find_block(&span2, entry.block_id1).is_some()
            {
                return Ok(SwapBlocksResp {});
            }
            return Err(TernError::BlockNotFound);
        };

        let block1 = span1.locations()[pos1.0].blocks[pos1.1];
        let block2 = span2.locations()[pos2.0].blocks[pos2.1];
        let loc1 = &span1.locations()[pos1.0];
        let loc2 = &span2.locations()[pos2.0];
        if loc1.block_size() != loc2.block_size() {
            return Err(TernError::SwapBlocksMismatchingSize);
        }
        if block1.crc != block2.crc {
            return Err(TernError::SwapBlocksMismatchingCrc);
        }
        if loc1.location_id != loc2.location_id {
            return Err(TernError::SwapBlocksMismatchingLocation);
        }

        // the swap must not place two blocks of one span on the same block
        // service or failure domain
        let cache = self.cache.get_cache();
        let failure_domain = |id: BlockServiceId| {
            cache
                .info(id)
                .unwrap_or_else(|| panic!("block service {id} not in cache"))
                .failure_domain
        };
        let check_no_duplicates = |loc: &LocationBlocks,
                                   replaced_ix: usize,
                                   incoming: &SpanBlock|
         -> Result<(), TernError> {
            let incoming_domain = failure_domain(incoming.block_service);
            for (i, block) in loc.blocks.iter().enumerate() {
                if i == replaced_ix {
                    continue;
                }
                if block.block_service == incoming.block_service {
                    return Err(TernError::SwapBlocksDuplicateBlockService);
                }
                if failure_domain(block.block_service) == incoming_domain {
                    return Err(TernError::SwapBlocksDuplicateFailureDomain);
                }
            }
            Ok(())
        };
        check_no_duplicates(loc1, pos1.1, &block2)?;
        check_no_duplicates(loc2, pos2.1, &block1)?;

        self.add_block_services_to_files(batch, block1.block_service, entry.file_id1, -1);
        self.add_block_services_to_files(batch, block2.block_service, entry.file_id1, 1);
        self.add_block_services_to_files(batch, block1.block_service, entry.file_id2, 1);
        self.add_block_services_to_files(batch, block2.block_service, entry.file_id2, -1);

        span1.locations_mut()[pos1.0].blocks[pos1.1] = block2;
        span2.locations_mut()[pos2.0].blocks[pos2.1] = block1;
        batch.put(Family::Spans, span_key(entry.file_id1, entry.byte_offset1), span1.encode());
        batch.put(Family::Spans, span_key(entry.file_id2, entry.byte_offset2), span2.encode());
        Ok(SwapBlocksResp {})
    }

    fn apply_swap_spans(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &SwapSpansEntry,
    ) -> Result<SwapSpansResp, TernError> {
        let span1 = self
            .fetch_span(entry.file_id1, entry.byte_offset1)
            .ok_or(TernError::SpanNotFound)?;
        let span2 = self
            .fetch_span(entry.file_id2, entry.byte_offset2)
            .ok_or(TernError::SpanNotFound)?;
        if span1.is_inline() || span2.is_inline() {
            return Err(TernError::SwapSpansInlineStorage);
        }
        if span1.span_size != span2.span_size {
            return Err(TernError::SwapSpansMismatchingSize);
        }
        if span1.crc != span2.crc {
            return Err(TernError::SwapSpansMismatchingCrc);
        }
        let state1 =
            self.fetch_span_state(time, entry.file_id1, entry.byte_offset1 + span1.span_size as u64);
        let state2 =
            self.fetch_span_state(time, entry.file_id2, entry.byte_offset2 + span2.span_size as u64);
        if state1 != SpanState::Clean || state2 != SpanState::Clean {
            return Err(TernError::SwapSpansNotClean);
        }

        let blocks_match = |span: &SpanBody, ids: &[u64]| -> bool {
            let span_ids = span.block_ids();
            span_ids.len() == ids.len()
                && span_ids.iter().zip(ids).all(|(a, b)| a.0 == *b)
        };
        if blocks_match(&span1, &entry.blocks2) && blocks_match(&span2, &entry.blocks1) {
            return Ok(SwapSpansResp {}); // already swapped
        }
        if !(blocks_match(&span1, &entry.blocks1) && blocks_match(&span2, &entry.blocks2)) {
            return Err(TernError::SwapSpansMismatchingBlocks);
        }

        let adjust = |batch: &mut WriteBatch, span: &SpanBody, add_to: InodeId, subtract_from: InodeId| {
            for loc in span.locations() {
                for block in &loc.blocks {
                    self.add_block_services_to_files(batch, block.block_service, add_to, 1);
                    self.add_block_services_to_files(batch, block.block_service, subtract_from, -1);
                }
            }
        };
        adjust(batch, &span1, entry.file_id2, entry.file_id1);
        adjust(batch, &span2, entry.file_id1, entry.file_id2);

        batch.put(Family::Spans, span_key(entry.file_id1, entry.byte_offset1), span2.encode());
        batch.put(Family::Spans, span_key(entry.file_id2, entry.byte_offset2), span1.encode());
        Ok(SwapSpansResp {})
    }

    fn apply_move_span(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &MoveSpanEntry,
    ) -> Result<MoveSpanResp, TernError> {
        let mut file1 =
            self.initiate_transient_file_modification(time, true, batch, entry.file_id1)?;
        let mut file2 =
            self.initiate_transient_file_modification(time, true, batch, entry.file_id2)?;

        debug!(
            "event=move_span size={} src_size={} src_state={:?} dst_size={} dst_state={:?}",
            entry.span_size, file1.file_size, file1.last_span_state, file2.file_size,
            file2.last_span_state
        );
        // already moved
        if file1.file_size == entry.byte_offset1
            && file1.last_span_state == SpanState::Clean
            && file2.file_size == entry.byte_offset2 + entry.span_size as u64
            && file2.last_span_state == SpanState::Dirty
        {
            return Ok(MoveSpanResp {});
        }
        if file1.last_span_state != SpanState::Dirty
            || file1.file_size != entry.byte_offset1 + entry.span_size as u64
            || file2.last_span_state != SpanState::Clean
            || file2.file_size != entry.byte_offset2
        {
            debug!("event=move_span_offset_check_failed");
            return Err(TernError::SpanNotFound);
        }

        let span = self
            .fetch_span(entry.file_id1, entry.byte_offset1)
            .ok_or(TernError::SpanNotFound)?;
        if span.span_size != entry.span_size {
            debug!("event=move_span_size_mismatch");
            return Err(TernError::SpanNotFound);
        }

        batch.delete(Family::Spans, span_key(entry.file_id1, entry.byte_offset1));
        batch.put(Family::Spans, span_key(entry.file_id2, entry.byte_offset2), span.encode());

        file1.file_size -= span.span_size as u64;
        file1.last_span_state = SpanState::Clean;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id1), file1.encode());
        file2.file_size += span.span_size as u64;
        file2.last_span_state = SpanState::Dirty;
        batch.put(Family::TransientFiles, inode_id_key(entry.file_id2), file2.encode());

        assert!(span.locations().len() == 1, "moving span with multiple locations");
        for block in &span.locations()[0].blocks {
            self.add_block_services_to_files(batch, block.block_service, entry.file_id1, -1);
            self.add_block_services_to_files(batch, block.block_service, entry.file_id2, 1);
        }
        Ok(MoveSpanResp {})
    }

    // ----------------------------------------------------------------
    // transient lifecycle

    fn apply_make_file_transient(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &MakeFileTransientEntry,
    ) -> Result<MakeFileTransientResp, TernError> {
        let file = match get_file(&self.kv, entry.id) {
            Ok(file) => file,
            Err(TernError::FileNotFound) => {
                // already transient means already done
                if get_transient_file(&self.kv, time, true, entry.id).is_ok() {
                    return Ok(MakeFileTransientResp {});
                }
                return Err(TernError::FileNotFound);
            }
            Err(err) => return Err(err),
        };

        batch.delete(Family::Files, inode_id_key(entry.id));
        let transient = TransientFileBody {
            version: 0,
            file_size: file.file_size,
            mtime: time,
            deadline: entry.deadline_time,
            last_span_state: SpanState::Clean,
            note: entry.note.as_slice().to_vec(),
        };
        batch.put(Family::TransientFiles, inode_id_key(entry.id), transient.encode());
        Ok(MakeFileTransientResp {})
    }

    fn apply_scrap_transient_file(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &ScrapTransientFileEntry,
    ) -> Result<ScrapTransientFileResp, TernError> {
        let mut file = get_transient_file(&self.kv, time, true, entry.id)?;
        file.deadline = entry.deadline_time;
        batch.put(Family::TransientFiles, inode_id_key(entry.id), file.encode());
        Ok(ScrapTransientFileResp {})
    }

    // ----------------------------------------------------------------
    // housekeeping

    fn apply_remove_owned_snapshot_file_edge(
        &self,
        batch: &mut WriteBatch,
        time: TernTime,
        entry: &RemoveOwnedSnapshotFileEdgeEntry,
    ) -> Result<RemoveOwnedSnapshotFileEdgeResp, TernError> {
        // deleted directories may still hold owned file edges the GC clears
        let name_hash = self.initiate_directory_modification_and_hash(
            time,
            true,
            batch,
            entry.owner_id,
            &entry.name,
        )?;
        batch.delete(
            Family::Edges,
            edge_key_snapshot(entry.owner_id, name_hash, &entry.name, entry.creation_time),
        );
        Ok(RemoveOwnedSnapshotFileEdgeResp {})
    }

    fn apply_set_time(
        &self,
        batch: &mut WriteBatch,
        _time: TernTime,
        entry: &SetTimeEntry,
    ) -> Result<SetTimeResp, TernError> {
        let mut file = get_file(&self.kv, entry.id)?;
        // the high bit flags the field as set
        if entry.mtime & (1 << 63) != 0 {
            file.mtime = TernTime(entry.mtime & !(1 << 63));
        }
        if entry.atime & (1 << 63) != 0 {
            file.atime = TernTime(entry.atime & !(1 << 63));
        }
        batch.put(Family::Files, inode_id_key(entry.id), file.encode());
        Ok(SetTimeResp {})
    }

    fn apply_remove_zero_block_service_files(
        &self,
        batch: &mut WriteBatch,
        _time: TernTime,
        entry: &RemoveZeroBlockServiceFilesEntry,
    ) -> Result<RemoveZeroBlockServiceFilesResp, TernError> {
        // cap the sweep so one entry cannot stall the apply loop
        const MAX_ENTRIES: usize = 1_000;

        let mut resp = RemoveZeroBlockServiceFilesResp {
            removed: 0,
            next_block_service: BlockServiceId(0),
            next_file: NULL_INODE_ID,
        };
        let mut it = self.kv.iter(Family::BlockServicesToFiles, IterBounds::none());
        it.seek(&block_service_to_file_key(entry.start_block_service, entry.start_file));
        let mut seen = 0;
        while it.valid() && seen < MAX_ENTRIES {
            if decode_i64(it.value()) == 0 {
                let key = BlockServiceToFileKey::decode(it.key());
                debug!(
                    "event=remove_zero_reverse_index block_service={} file={}",
                    key.block_service, key.file_id
                );
                batch.delete(Family::BlockServicesToFiles, it.key().to_vec());
                resp.removed += 1;
            }
            seen += 1;
            it.next();
        }
        if it.valid() {
            let key = BlockServiceToFileKey::decode(it.key());
            resp.next_block_service = key.block_service;
            resp.next_file = key.file_id;
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockServicesCacheDb;
    use crate::kv::MemKv;
    use crate::shard::ShardOptions;
    use crate::types::{ShardId, ShortBytes};
    use std::sync::Arc;

    fn shard() -> ShardDb {
        ShardDb::open(
            ShardOptions { shard_id: ShardId(1), ..Default::default() },
            MemKv::new(),
            Arc::new(BlockServicesCacheDb::new()),
        )
        .unwrap()
    }

    fn construct_entry(time: TernTime) -> ShardLogEntry {
        ShardLogEntry {
            idx: 0,
            time,
            body: ShardLogEntryBody::ConstructFile(ConstructFileEntry {
                file_type: InodeType::File as u8,
                note: ShortBytes::from("test"),
                deadline_time: time.plus_ns(1),
            }),
        }
    }

    #[test]
    fn apply_advances_log_index_by_one() {
        let db = shard();
        assert_eq!(db.last_applied(), 0);
        db.apply(1, &construct_entry(TernTime(10)));
        assert_eq!(db.last_applied(), 1);
        db.apply(2, &construct_entry(TernTime(20)));
        assert_eq!(db.last_applied(), 2);
    }

    #[test]
    #[should_panic(expected = "log index gap")]
    fn apply_rejects_index_gaps() {
        let db = shard();
        db.apply(2, &construct_entry(TernTime(10)));
    }

    #[test]
    fn failed_apply_still_advances_log_index() {
        let db = shard();
        // scrapping a file that does not exist fails but the index moves
        let entry = ShardLogEntry {
            idx: 0,
            time: TernTime(5),
            body: ShardLogEntryBody::ScrapTransientFile(ScrapTransientFileEntry {
                id: InodeId::new(InodeType::File, ShardId(1), 42),
                deadline_time: TernTime(5),
            }),
        };
        let resp = db.apply(1, &entry);
        assert_eq!(resp, ShardResp::Error(TernError::FileNotFound));
        assert_eq!(db.last_applied(), 1);
    }

    #[test]
    fn inode_counter_advances_by_stride() {
        let db = shard();
        let resp = db.apply(1, &construct_entry(TernTime(10)));
        let ShardResp::ConstructFile(first) = resp else { panic!("unexpected {resp:?}") };
        assert_eq!(first.id.u64(), 0x0101);
        let resp = db.apply(2, &construct_entry(TernTime(20)));
        let ShardResp::ConstructFile(second) = resp else { panic!("unexpected {resp:?}") };
        assert_eq!(second.id.u64(), first.id.u64() + 0x100);
        assert_eq!(second.id.shard(), ShardId(1));
    }

    #[test]
    fn block_id_allocation_respects_floor() {
        let db = shard();
        let mut next = db.next_block_id();
        let time = TernTime(0x1234_5600);
        let id1 = db.bump_block_id(time, &mut next);
        assert_eq!(id1.0, (time.0 & !0xFF) | 1);
        let id2 = db.bump_block_id(time, &mut next);
        assert!(id2.0 >= id1.0 + 0x100);
        assert_eq!(id2.0 & 0xFF, 1);
    }
}
