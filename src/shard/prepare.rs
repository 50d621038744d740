//! Prepare path: turns a write request into a candidate log entry.
//!
//! Everything non-deterministic is resolved here — wall-clock time,
//! transient-file deadlines, and block-service picks — and frozen into the
//! entry, so that applying the entry is a pure function of the store. All
//! validation here is advisory: the apply path re-checks whatever matters
//! for state integrity, which is what lets prepare run against a possibly
//! stale snapshot without any interlock.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::crc32c::{crc32c, crc32c_append, crc32c_xor, crc32c_zero_extend};
use crate::error::TernError;
use crate::kv::{Family, KvSnapshot};
use crate::msgs::*;
use crate::schema::{span_file_bounds, span_key, SpanBody, SpanKey};
use crate::types::{
    valid_name, BlockServiceId, Crc, FailureDomain, InodeId, InodeType, TernTime, DEFAULT_LOCATION,
    EMPTY_STORAGE, INLINE_STORAGE, MAXIMUM_SPAN_SIZE, PAGE_SIZE,
};

use super::ShardDb;

impl ShardDb {
    /// Prepares a log entry for a write request, stamping the current wall
    /// clock. The entry's `idx` is zero; the log layer assigns it.
    pub fn prepare(&self, req: &ShardReq) -> Result<ShardLogEntry, TernError> {
        self.prepare_at(TernTime::now(), req)
    }

    /// Like [`ShardDb::prepare`] with an explicit clock.
    pub fn prepare_at(&self, time: TernTime, req: &ShardReq) -> Result<ShardLogEntry, TernError> {
        debug!("event=shard_prepare kind={:?}", req.kind());
        let snap = self.current_read_snapshot();
        let body = self.prepare_body(&snap, time, req);
        match body {
            Ok(body) => {
                debug!("event=shard_prepared kind={:?}", body.kind());
                Ok(ShardLogEntry { idx: 0, time, body })
            }
            Err(err) => {
                info!("event=shard_prepare_failed kind={:?} err={err}", req.kind());
                Err(err)
            }
        }
    }

    fn prepare_body(
        &self,
        snap: &KvSnapshot,
        time: TernTime,
        req: &ShardReq,
    ) -> Result<ShardLogEntryBody, TernError> {
        use ShardLogEntryBody as B;
        match req {
            ShardReq::ConstructFile(req) => {
                self.prepare_construct_file(time, req).map(B::ConstructFile)
            }
            ShardReq::LinkFile(req) => self.prepare_link_file(req).map(B::LinkFile),
            ShardReq::SameDirectoryRename(req) => self
                .prepare_same_directory_rename(
                    req.dir_id,
                    &req.old_name,
                    &req.new_name,
                    true,
                )
                .map(|_| {
                    B::SameDirectoryRename(SameDirectoryRenameEntry {
                        target_id: req.target_id,
                        dir_id: req.dir_id,
                        old_name: req.old_name.clone(),
                        old_creation_time: req.old_creation_time,
                        new_name: req.new_name.clone(),
                    })
                }),
            ShardReq::SameDirectoryRenameSnapshot(req) => self
                .prepare_same_directory_rename(
                    req.dir_id,
                    &req.old_name,
                    &req.new_name,
                    false,
                )
                .map(|_| {
                    B::SameDirectoryRenameSnapshot(SameDirectoryRenameSnapshotEntry {
                        target_id: req.target_id,
                        dir_id: req.dir_id,
                        old_name: req.old_name.clone(),
                        old_creation_time: req.old_creation_time,
                        new_name: req.new_name.clone(),
                    })
                }),
            ShardReq::SoftUnlinkFile(req) => self.prepare_soft_unlink_file(req).map(B::SoftUnlinkFile),
            ShardReq::CreateDirectoryInode(req) => {
                self.prepare_create_directory_inode(req).map(B::CreateDirectoryInode)
            }
            ShardReq::CreateLockedCurrentEdge(req) => {
                self.prepare_create_locked_current_edge(req).map(B::CreateLockedCurrentEdge)
            }
            ShardReq::LockCurrentEdge(req) => {
                self.check_dir_on_shard(req.dir_id)?;
                Ok(B::LockCurrentEdge(LockCurrentEdgeEntry {
                    dir_id: req.dir_id,
                    name: req.name.clone(),
                    creation_time: req.creation_time,
                    target_id: req.target_id,
                }))
            }
            ShardReq::UnlockCurrentEdge(req) => {
                self.check_dir_on_shard(req.dir_id)?;
                Ok(B::UnlockCurrentEdge(UnlockCurrentEdgeEntry {
                    dir_id: req.dir_id,
                    name: req.name.clone(),
                    creation_time: req.creation_time,
                    target_id: req.target_id,
                    was_moved: req.was_moved,
                }))
            }
            ShardReq::RemoveDirectoryOwner(req) => {
                self.check_dir_on_shard(req.dir_id)?;
                if req.dir_id == crate::types::ROOT_DIR_INODE_ID {
                    return Err(TernError::CannotRemoveRootDirectory);
                }
                Ok(B::RemoveDirectoryOwner(RemoveDirectoryOwnerEntry {
                    dir_id: req.dir_id,
                    info: req.info.clone(),
                }))
            }
            ShardReq::RemoveInode(req) => {
                self.check_shard(req.id)?;
                if req.id == crate::types::ROOT_DIR_INODE_ID {
                    return Err(TernError::CannotRemoveRootDirectory);
                }
                Ok(B::RemoveInode(RemoveInodeEntry { id: req.id }))
            }
            ShardReq::SetDirectoryOwner(req) => {
                self.check_dir_on_shard(req.dir_id)?;
                if !req.owner_id.is_directory() {
                    return Err(TernError::TypeIsNotDirectory);
                }
                Ok(B::SetDirectoryOwner(SetDirectoryOwnerEntry {
                    dir_id: req.dir_id,
                    owner_id: req.owner_id,
                }))
            }
            ShardReq::SetDirectoryInfo(req) => {
                self.check_dir_on_shard(req.id)?;
                Ok(B::SetDirectoryInfo(SetDirectoryInfoEntry {
                    dir_id: req.id,
                    info: req.info.clone(),
                }))
            }
            ShardReq::RemoveNonOwnedEdge(req) => {
                self.check_dir_on_shard(req.dir_id)?;
                Ok(B::RemoveNonOwnedEdge(RemoveNonOwnedEdgeEntry {
                    dir_id: req.dir_id,
                    name: req.name.clone(),
                    creation_time: req.creation_time,
                }))
            }
            ShardReq::SameShardHardFileUnlink(req) => {
                if !req.owner_id.is_directory() {
                    return Err(TernError::TypeIsNotDirectory);
                }
                if !req.target_id.is_file_or_symlink() {
                    return Err(TernError::TypeIsDirectory);
                }
                if req.owner_id.shard() != self.opts.shard_id
                    || req.target_id.shard() != self.opts.shard_id
                {
                    return Err(TernError::BadShard);
                }
                Ok(B::SameShardHardFileUnlink(SameShardHardFileUnlinkEntry {
                    owner_id: req.owner_id,
                    target_id: req.target_id,
                    name: req.name.clone(),
                    creation_time: req.creation_time,
                    deadline_time: time,
                }))
            }
            ShardReq::RemoveSpanInitiate(req) => {
                self.check_file_on_shard(req.file_id)?;
                self.check_transient_file_cookie(req.file_id, &req.cookie)?;
                Ok(B::RemoveSpanInitiate(RemoveSpanInitiateEntry { file_id: req.file_id }))
            }
            ShardReq::RemoveSpanCertify(req) => {
                self.check_file_on_shard(req.file_id)?;
                self.check_transient_file_cookie(req.file_id, &req.cookie)?;
                Ok(B::RemoveSpanCertify(RemoveSpanCertifyEntry {
                    file_id: req.file_id,
                    byte_offset: req.byte_offset,
                    proofs: req.proofs.clone(),
                }))
            }
            ShardReq::AddInlineSpan(req) => {
                self.prepare_add_inline_span(req).map(B::AddInlineSpan)
            }
            ShardReq::AddSpanInitiate(req) => {
                let entry = self.prepare_add_span_initiate(
                    snap,
                    time,
                    DEFAULT_LOCATION,
                    false,
                    req,
                    req.file_id,
                )?;
                Ok(B::AddSpanInitiate(entry))
            }
            ShardReq::AddSpanInitiateWithReference(req) => {
                let entry = self.prepare_add_span_initiate(
                    snap,
                    time,
                    DEFAULT_LOCATION,
                    true,
                    &req.req,
                    req.reference,
                )?;
                Ok(B::AddSpanInitiate(entry))
            }
            ShardReq::AddSpanAtLocationInitiate(req) => {
                let reference = if req.req.reference.is_null() {
                    req.req.req.file_id
                } else {
                    req.req.reference
                };
                let entry = self.prepare_add_span_initiate(
                    snap,
                    time,
                    req.location_id,
                    !req.req.reference.is_null(),
                    &req.req.req,
                    reference,
                )?;
                Ok(B::AddSpanAtLocationInitiate(entry))
            }
            ShardReq::AddSpanCertify(req) => {
                self.check_file_on_shard(req.file_id)?;
                self.check_transient_file_cookie(req.file_id, &req.cookie)?;
                Ok(B::AddSpanCertify(AddSpanCertifyEntry {
                    file_id: req.file_id,
                    byte_offset: req.byte_offset,
                    proofs: req.proofs.clone(),
                }))
            }
            ShardReq::AddSpanLocation(req) => {
                self.check_span_pair(req.file_id1, req.file_id2)?;
                Ok(B::AddSpanLocation(AddSpanLocationEntry {
                    file_id1: req.file_id1,
                    byte_offset1: req.byte_offset1,
                    blocks1: req.blocks1.clone(),
                    file_id2: req.file_id2,
                    byte_offset2: req.byte_offset2,
                }))
            }
            ShardReq::MakeFileTransient(req) => {
                self.check_file_on_shard(req.id)?;
                Ok(B::MakeFileTransient(MakeFileTransientEntry {
                    id: req.id,
                    note: req.note.clone(),
                    deadline_time: time,
                }))
            }
            ShardReq::ScrapTransientFile(req) => {
                if req.id.is_null() || req.id.ty() != InodeType::File {
                    return Err(TernError::FileIsNotTransient);
                }
                self.check_shard(req.id)?;
                self.check_transient_file_cookie(req.id, &req.cookie)?;
                Ok(B::ScrapTransientFile(ScrapTransientFileEntry {
                    id: req.id,
                    deadline_time: time,
                }))
            }
            ShardReq::MoveSpan(req) => {
                if req.file_id1.shard() != self.opts.shard_id
                    || req.file_id2.shard() != self.opts.shard_id
                {
                    return Err(TernError::BadShard);
                }
                self.check_transient_file_cookie(req.file_id1, &req.cookie1)?;
                self.check_transient_file_cookie(req.file_id2, &req.cookie2)?;
                Ok(B::MoveSpan(MoveSpanEntry {
                    span_size: req.span_size,
                    file_id1: req.file_id1,
                    byte_offset1: req.byte_offset1,
                    cookie1: req.cookie1,
                    file_id2: req.file_id2,
                    byte_offset2: req.byte_offset2,
                    cookie2: req.cookie2,
                }))
            }
            ShardReq::SwapBlocks(req) => {
                self.check_span_pair(req.file_id1, req.file_id2)?;
                Ok(B::SwapBlocks(SwapBlocksEntry {
                    file_id1: req.file_id1,
                    byte_offset1: req.byte_offset1,
                    block_id1: req.block_id1,
                    file_id2: req.file_id2,
                    byte_offset2: req.byte_offset2,
                    block_id2: req.block_id2,
                }))
            }
            ShardReq::SwapSpans(req) => {
                self.check_span_pair(req.file_id1, req.file_id2)?;
                Ok(B::SwapSpans(SwapSpansEntry {
                    file_id1: req.file_id1,
                    byte_offset1: req.byte_offset1,
                    blocks1: req.blocks1.clone(),
                    file_id2: req.file_id2,
                    byte_offset2: req.byte_offset2,
                    blocks2: req.blocks2.clone(),
                }))
            }
            ShardReq::SetTime(req) => {
                if req.id.is_null() || req.id.ty() == InodeType::Directory {
                    return Err(TernError::TypeIsDirectory);
                }
                self.check_shard(req.id)?;
                Ok(B::SetTime(SetTimeEntry { id: req.id, mtime: req.mtime, atime: req.atime }))
            }
            ShardReq::RemoveZeroBlockServiceFiles(req) => {
                Ok(B::RemoveZeroBlockServiceFiles(RemoveZeroBlockServiceFilesEntry {
                    start_block_service: req.start_block_service,
                    start_file: req.start_file,
                }))
            }
            ShardReq::RemoveOwnedSnapshotFileEdge(req) => {
                self.check_dir_on_shard(req.owner_id)?;
                if !req.target_id.is_file_or_symlink() {
                    return Err(TernError::TypeIsDirectory);
                }
                Ok(B::RemoveOwnedSnapshotFileEdge(RemoveOwnedSnapshotFileEdgeEntry {
                    owner_id: req.owner_id,
                    target_id: req.target_id,
                    name: req.name.clone(),
                    creation_time: req.creation_time,
                }))
            }
            other => panic!("prepare got read-only request kind {:?}", other.kind()),
        }
    }

    fn check_shard(&self, id: InodeId) -> Result<(), TernError> {
        if id.shard() != self.opts.shard_id {
            return Err(TernError::BadShard);
        }
        Ok(())
    }

    fn check_dir_on_shard(&self, id: InodeId) -> Result<(), TernError> {
        if !id.is_directory() {
            return Err(TernError::TypeIsNotDirectory);
        }
        self.check_shard(id)
    }

    fn check_file_on_shard(&self, id: InodeId) -> Result<(), TernError> {
        if !id.is_file_or_symlink() {
            return Err(TernError::TypeIsDirectory);
        }
        self.check_shard(id)
    }

    fn check_span_pair(&self, file1: InodeId, file2: InodeId) -> Result<(), TernError> {
        if file1.is_null()
            || file2.is_null()
            || file1.ty() == InodeType::Directory
            || file2.ty() == InodeType::Directory
        {
            return Err(TernError::TypeIsDirectory);
        }
        if file1.shard() != self.opts.shard_id || file2.shard() != self.opts.shard_id {
            return Err(TernError::BadShard);
        }
        if file1 == file2 {
            return Err(TernError::SameSourceAndDestination);
        }
        Ok(())
    }

    pub(crate) fn check_transient_file_cookie(
        &self,
        id: InodeId,
        cookie: &[u8; 8],
    ) -> Result<(), TernError> {
        if !id.is_file_or_symlink() {
            return Err(TernError::TypeIsDirectory);
        }
        if *cookie != self.calc_cookie(id) {
            return Err(TernError::BadCookie);
        }
        Ok(())
    }

    fn prepare_construct_file(
        &self,
        time: TernTime,
        req: &ConstructFileReq,
    ) -> Result<ConstructFileEntry, TernError> {
        if req.file_type != InodeType::File as u8 && req.file_type != InodeType::Symlink as u8 {
            return Err(TernError::TypeIsDirectory);
        }
        Ok(ConstructFileEntry {
            file_type: req.file_type,
            note: req.note.clone(),
            deadline_time: time.plus_ns(self.opts.transient_deadline_interval_ns),
        })
    }

    fn prepare_link_file(&self, req: &LinkFileReq) -> Result<LinkFileEntry, TernError> {
        if !req.owner_id.is_directory() {
            return Err(TernError::TypeIsNotDirectory);
        }
        if req.owner_id.shard() != self.opts.shard_id
            || req.file_id.shard() != self.opts.shard_id
        {
            return Err(TernError::BadShard);
        }
        if !valid_name(&req.name) {
            return Err(TernError::BadName);
        }
        self.check_transient_file_cookie(req.file_id, &req.cookie)?;
        Ok(LinkFileEntry {
            file_id: req.file_id,
            owner_id: req.owner_id,
            name: req.name.clone(),
        })
    }

    fn prepare_same_directory_rename(
        &self,
        dir_id: InodeId,
        old_name: &[u8],
        new_name: &[u8],
        reject_same_name: bool,
    ) -> Result<(), TernError> {
        if !dir_id.is_directory() {
            return Err(TernError::TypeIsNotDirectory);
        }
        if reject_same_name && old_name == new_name {
            return Err(TernError::SameSourceAndDestination);
        }
        if !valid_name(new_name) {
            return Err(TernError::BadName);
        }
        self.check_shard(dir_id)
    }

    fn prepare_soft_unlink_file(
        &self,
        req: &SoftUnlinkFileReq,
    ) -> Result<SoftUnlinkFileEntry, TernError> {
        if !req.owner_id.is_directory() {
            return Err(TernError::TypeIsNotDirectory);
        }
        if !req.file_id.is_file_or_symlink() {
            return Err(TernError::TypeIsDirectory);
        }
        self.check_shard(req.owner_id)?;
        Ok(SoftUnlinkFileEntry {
            owner_id: req.owner_id,
            file_id: req.file_id,
            name: req.name.clone(),
            creation_time: req.creation_time,
        })
    }

    fn prepare_create_directory_inode(
        &self,
        req: &CreateDirectoryInodeReq,
    ) -> Result<CreateDirectoryInodeEntry, TernError> {
        self.check_shard(req.id)?;
        if !req.id.is_directory() || !req.owner_id.is_directory() {
            return Err(TernError::TypeIsNotDirectory);
        }
        Ok(CreateDirectoryInodeEntry {
            id: req.id,
            owner_id: req.owner_id,
            info: req.info.clone(),
        })
    }

    fn prepare_create_locked_current_edge(
        &self,
        req: &CreateLockedCurrentEdgeReq,
    ) -> Result<CreateLockedCurrentEdgeEntry, TernError> {
        self.check_dir_on_shard(req.dir_id)?;
        if !valid_name(&req.name) {
            return Err(TernError::BadName);
        }
        if req.target_id.is_null() {
            return Err(TernError::MismatchingTarget);
        }
        Ok(CreateLockedCurrentEdgeEntry {
            dir_id: req.dir_id,
            name: req.name.clone(),
            target_id: req.target_id,
            old_creation_time: req.old_creation_time,
        })
    }

    fn prepare_add_inline_span(
        &self,
        req: &AddInlineSpanReq,
    ) -> Result<AddInlineSpanEntry, TernError> {
        self.check_file_on_shard(req.file_id)?;
        self.check_transient_file_cookie(req.file_id, &req.cookie)?;

        if req.storage_class == EMPTY_STORAGE {
            if req.size != 0 {
                debug!("event=bad_inline_span reason=empty_span_with_size size={}", req.size);
                return Err(TernError::BadSpanBody);
            }
        } else if req.storage_class == INLINE_STORAGE {
            if req.size == 0 || (req.size as usize) < req.body.len() {
                debug!(
                    "event=bad_inline_span reason=size_mismatch size={} body_len={}",
                    req.size,
                    req.body.len()
                );
                return Err(TernError::BadSpanBody);
            }
        } else {
            debug!("event=bad_inline_span reason=storage_class class={}", req.storage_class.0);
            return Err(TernError::BadSpanBody);
        }

        if req.byte_offset % PAGE_SIZE != 0 {
            warn!(
                "event=bad_inline_span reason=unaligned_offset offset={} page={PAGE_SIZE}",
                req.byte_offset
            );
            return Err(TernError::BadSpanBody);
        }

        let expected =
            crc32c_zero_extend(crc32c(&req.body), req.size as i64 - req.body.len() as i64);
        if expected != req.crc {
            debug!("event=bad_inline_span reason=crc expected={expected} got={}", req.crc);
            return Err(TernError::BadSpanBody);
        }

        Ok(AddInlineSpanEntry {
            file_id: req.file_id,
            storage_class: req.storage_class,
            byte_offset: req.byte_offset,
            size: req.size,
            body: req.body.clone(),
            crc: req.crc,
        })
    }

    fn prepare_add_span_initiate(
        &self,
        snap: &KvSnapshot,
        time: TernTime,
        location_id: u8,
        with_reference: bool,
        req: &AddSpanInitiateReq,
        reference: InodeId,
    ) -> Result<AddSpanAtLocationInitiateEntry, TernError> {
        if !req.file_id.is_file_or_symlink() || !reference.is_file_or_symlink() {
            return Err(TernError::TypeIsDirectory);
        }
        self.check_shard(req.file_id)?;
        self.check_transient_file_cookie(req.file_id, &req.cookie)?;
        if !req.storage_class.is_blocked() {
            debug!("event=bad_span reason=storage_class class={}", req.storage_class.0);
            return Err(TernError::BadSpanBody);
        }
        if req.byte_offset % PAGE_SIZE != 0 || req.cell_size as u64 % PAGE_SIZE != 0 {
            warn!(
                "event=bad_span reason=unaligned offset={} cell={}",
                req.byte_offset, req.cell_size
            );
            return Err(TernError::BadSpanBody);
        }
        if !check_span_body(req) {
            return Err(TernError::BadSpanBody);
        }

        let blocks = req.parity.blocks();
        let mut entry = AddSpanAtLocationInitiateEntry {
            location_id,
            with_reference,
            file_id: req.file_id,
            byte_offset: req.byte_offset,
            size: req.size,
            crc: req.crc,
            storage_class: req.storage_class,
            parity: req.parity,
            stripes: req.stripes,
            cell_size: req.cell_size,
            body_blocks: Vec::with_capacity(blocks),
            body_stripes: Vec::with_capacity(req.stripes as usize),
        };

        for s in 0..req.stripes as usize {
            let mut stripe_crc = Crc(0);
            for d in 0..req.parity.data_blocks() {
                stripe_crc =
                    crc32c_append(stripe_crc, req.crcs[s * blocks + d], req.cell_size as u64);
            }
            entry.body_stripes.push(stripe_crc);
        }

        let picked = self.pick_block_services(snap, time, location_id, req, reference)?;
        for (i, block_service_id) in picked.into_iter().enumerate() {
            let mut block_crc = Crc(0);
            for s in 0..req.stripes as usize {
                block_crc =
                    crc32c_append(block_crc, req.crcs[s * blocks + i], req.cell_size as u64);
            }
            entry.body_blocks.push(EntryNewBlockInfo { block_service_id, crc: block_crc });
        }

        Ok(entry)
    }

    /// Picks `parity.blocks()` block services for a new span: candidates
    /// are the current services matching location and storage class, with
    /// the blacklist and strict failure-domain deduplication applied. To
    /// keep placement stable across a file we first inherit services from
    /// the reference file's first span, then from its last span, and only
    /// then fill the remainder at random.
    fn pick_block_services(
        &self,
        snap: &KvSnapshot,
        time: TernTime,
        location_id: u8,
        req: &AddSpanInitiateReq,
        reference: InodeId,
    ) -> Result<Vec<BlockServiceId>, TernError> {
        let cache = self.cache.get_cache();
        let needed = req.parity.blocks();

        let mut blacklist: Vec<(FailureDomain, BlockServiceId)> = req
            .blacklist
            .iter()
            .map(|b| (b.failure_domain, b.block_service))
            .collect();
        let mut candidates: Vec<BlockServiceId> = Vec::new();
        for bs in &cache.current_block_services {
            if bs.location_id != location_id {
                continue;
            }
            if bs.storage_class != req.storage_class {
                continue;
            }
            if blacklist.iter().any(|(fd, id)| *id == bs.id || *fd == bs.failure_domain) {
                continue;
            }
            candidates.push(bs.id);
            // picking one service rules out its whole failure domain
            blacklist.push((bs.failure_domain, bs.id));
        }
        debug!(
            "event=pick_block_services candidates={} needed={needed} parity={}",
            candidates.len(),
            req.parity
        );

        let mut picked: Vec<BlockServiceId> = Vec::with_capacity(needed);

        // Copy placement from the first span (the reference layout in the
        // common case), then from the last (covers files that switched
        // services mid-write). Reorganizers work left to right, so the
        // first span is the one that stays representative.
        let fill_from_span = |picked: &mut Vec<BlockServiceId>,
                              candidates: &mut Vec<BlockServiceId>,
                              first: bool| {
            if req.file_id == reference && req.byte_offset == 0 {
                return; // empty file, nothing to inherit
            }
            if picked.len() >= needed || candidates.is_empty() {
                return;
            }
            let mut it = snap.iter(Family::Spans, span_file_bounds(reference));
            it.seek_for_prev(&span_key(reference, if first { 0 } else { u64::MAX }));
            if !it.valid() {
                return;
            }
            debug_assert!(SpanKey::decode(it.key()).file_id == reference);
            let span = SpanBody::decode(it.value());
            let Some(loc) = span.find_location(location_id) else { return };
            for block in &loc.blocks {
                if picked.len() >= needed || candidates.is_empty() {
                    break;
                }
                if let Some(ix) = candidates.iter().position(|c| *c == block.block_service) {
                    debug!(
                        "event=pick_block_service source=span block_service={}",
                        block.block_service
                    );
                    picked.push(block.block_service);
                    candidates.swap_remove(ix);
                }
            }
        };
        fill_from_span(&mut picked, &mut candidates, true);
        fill_from_span(&mut picked, &mut candidates, false);

        // Random fill for the rest. Determinism is not required here (this
        // runs at prepare, not apply), but a seeded generator costs
        // nothing.
        let mut rng = StdRng::seed_from_u64(time.0);
        while picked.len() < needed && !candidates.is_empty() {
            let ix = (rng.gen::<u64>() % candidates.len() as u64) as usize;
            debug!("event=pick_block_service source=random block_service={}", candidates[ix]);
            picked.push(candidates.swap_remove(ix));
        }

        if picked.len() < needed {
            return Err(TernError::CouldNotPickBlockServices);
        }
        Ok(picked)
    }
}

/// Recomputes the span CRC from the per-cell CRCs and verifies the parity
/// laws: all mirror blocks carry the stripe CRC when there is a single
/// data block, and the first parity block's CRC is the XOR of the data
/// CRCs otherwise. The span CRC is the cell CRCs combined and
/// zero-extended (or contracted) to the span size.
fn check_span_body(req: &AddSpanInitiateReq) -> bool {
    if req.size as u64 > MAXIMUM_SPAN_SIZE {
        debug!("event=bad_span reason=size size={} max={MAXIMUM_SPAN_SIZE}", req.size);
        return false;
    }
    let blocks = req.parity.blocks();
    let stripes = req.stripes as usize;
    let cell = req.cell_size as u64;
    if req.crcs.len() != stripes * blocks {
        debug!(
            "event=bad_span reason=crc_count crcs={} expected={}",
            req.crcs.len(),
            stripes * blocks
        );
        return false;
    }

    let mut span_crc = Crc(0);
    if req.parity.data_blocks() == 1 {
        // mirrored blocks all carry the stripe crc
        for s in 0..stripes {
            let stripe_crc = req.crcs[s * blocks];
            span_crc = crc32c_append(span_crc, stripe_crc, cell);
            for p in 0..req.parity.parity_blocks() {
                if req.crcs[s * blocks + 1 + p] != stripe_crc {
                    debug!(
                        "event=bad_span reason=mirror_crc expected={stripe_crc} got={}",
                        req.crcs[s * blocks + 1 + p]
                    );
                    return false;
                }
            }
        }
    } else {
        // the span is the concatenation of the data cells, and the first
        // parity block is their XOR; the remaining parity blocks cannot be
        // checked without the data
        for s in 0..stripes {
            let mut parity0_crc = Crc(0);
            for d in 0..req.parity.data_blocks() {
                let cell_crc = req.crcs[s * blocks + d];
                span_crc = crc32c_append(span_crc, cell_crc, cell);
                parity0_crc = if d == 0 {
                    cell_crc
                } else {
                    crc32c_xor(parity0_crc, cell_crc, cell)
                };
            }
            if parity0_crc != req.crcs[s * blocks + req.parity.data_blocks()] {
                debug!(
                    "event=bad_span reason=parity0_crc expected={parity0_crc} got={}",
                    req.crcs[s * blocks + req.parity.data_blocks()]
                );
                return false;
            }
        }
    }

    let cells_total = cell * stripes as u64 * req.parity.data_blocks() as u64;
    span_crc = crc32c_zero_extend(span_crc, req.size as i64 - cells_total as i64);
    if span_crc != req.crc {
        debug!("event=bad_span reason=span_crc expected={span_crc} got={}", req.crc);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc32c::crc32c_extend;
    use crate::types::Parity;

    fn cell_bytes(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
    }

    /// Builds a consistent blocked-span request: cells, mirror-or-xor
    /// parity crcs, and the combined span crc.
    pub(crate) fn blocked_span_req(
        data: u8,
        parity: u8,
        stripes: u8,
        cell_size: u32,
        span_size: u32,
    ) -> AddSpanInitiateReq {
        let shape = Parity::new(data, parity);
        let blocks = shape.blocks();
        let mut crcs = vec![Crc(0); stripes as usize * blocks];
        let mut span = Vec::new();
        for s in 0..stripes as usize {
            let mut cells: Vec<Vec<u8>> = Vec::new();
            for d in 0..data as usize {
                let cell = cell_bytes((s * blocks + d) as u8, cell_size as usize);
                crcs[s * blocks + d] = crc32c(&cell);
                span.extend_from_slice(&cell);
                cells.push(cell);
            }
            if data == 1 {
                for p in 0..parity as usize {
                    crcs[s * blocks + 1 + p] = crcs[s * blocks];
                }
            } else {
                let mut xored = cells[0].clone();
                for cell in &cells[1..] {
                    for (x, b) in xored.iter_mut().zip(cell) {
                        *x ^= b;
                    }
                }
                crcs[s * blocks + data as usize] = crc32c(&xored);
                // the higher parity cells are opaque to the shard
                for p in 1..parity as usize {
                    crcs[s * blocks + data as usize + p] = Crc(0xD00D + p as u32);
                }
            }
        }
        span.resize(span_size as usize, 0);
        AddSpanInitiateReq {
            size: span_size,
            crc: crc32c(&span),
            storage_class: crate::types::FLASH_STORAGE,
            parity: shape,
            stripes,
            cell_size,
            crcs,
            ..Default::default()
        }
    }

    #[test]
    fn span_body_check_accepts_mirrored() {
        let req = blocked_span_req(1, 2, 3, 4096, 3 * 4096);
        assert!(check_span_body(&req));
    }

    #[test]
    fn span_body_check_accepts_xor_parity_and_padding() {
        // span padded past the data cells
        let req = blocked_span_req(3, 2, 2, 4096, 2 * 3 * 4096 + 512);
        assert!(check_span_body(&req));
        // span shorter than the data cells (short last cell)
        let req = blocked_span_req(3, 2, 2, 4096, 2 * 3 * 4096 - 512);
        assert!(check_span_body(&req));
    }

    #[test]
    fn span_body_check_rejects_bad_crcs() {
        let mut req = blocked_span_req(1, 2, 2, 4096, 2 * 4096);
        req.crcs[1] = Crc(req.crcs[1].0 ^ 1); // break a mirror copy
        assert!(!check_span_body(&req));

        let mut req = blocked_span_req(3, 2, 2, 4096, 2 * 3 * 4096);
        req.crcs[3] = Crc(req.crcs[3].0 ^ 1); // break parity block 0
        assert!(!check_span_body(&req));

        let mut req = blocked_span_req(3, 2, 2, 4096, 2 * 3 * 4096);
        req.crc = Crc(req.crc.0 ^ 1); // break the span crc
        assert!(!check_span_body(&req));

        let mut req = blocked_span_req(2, 1, 2, 4096, 2 * 2 * 4096);
        req.crcs.pop(); // wrong crc count
        assert!(!check_span_body(&req));
    }

    #[test]
    fn incremental_crc_matches_one_shot() {
        let a = cell_bytes(1, 100);
        let b = cell_bytes(2, 50);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        assert_eq!(crc32c_extend(crc32c(&a), &b), crc32c(&joined));
    }
}
