//! Read path: stateless queries against the shared read snapshot.
//!
//! Every paginated handler computes a byte budget from the request MTU,
//! stops before the budget goes negative, removes any half-filled trailing
//! element, and returns a continuation cursor. Responses are paired with
//! the last-applied log index observed on the snapshot so callers can
//! reason about staleness.

use std::sync::Arc;

use log::debug;

use crate::cache::BlockServicesCache;
use crate::error::TernError;
use crate::kv::{Family, IterBounds, KvSnapshot};
use crate::msgs::*;
use crate::schema::{
    decode_i64, decode_inode_id_key, edge_dir_end, edge_group_prefix, edge_key_current,
    edge_key_snapshot, inode_id_key, span_file_bounds, span_key, BlockServiceToFileKey,
    CurrentEdgeBody, EdgeKey, SnapshotEdgeBody, SpanBody, SpanKey, SpanStorage,
    TransientFileBody,
};
use crate::types::{
    compute_name_hash, BlockServiceId, InodeId, InodeType, ShortBytes, TernTime,
};

use super::{
    get_directory, get_directory_and_hash, get_file, get_transient_file, last_applied_from,
    ShardDb,
};

impl ShardDb {
    /// Serves a read-only request. Returns the last-applied log index seen
    /// by the snapshot alongside the response; errors come back as an
    /// `Error` response body.
    pub fn read(&self, req: &ShardReq) -> (u64, ShardResp) {
        debug!("event=shard_read kind={:?}", req.kind());
        let snap = self.current_read_snapshot();
        let result = match req {
            ShardReq::StatFile(req) => self.stat_file(&snap, req).map(ShardResp::StatFile),
            ShardReq::StatDirectory(req) => {
                self.stat_directory(&snap, req).map(ShardResp::StatDirectory)
            }
            ShardReq::StatTransientFile(req) => {
                self.stat_transient_file(&snap, req).map(ShardResp::StatTransientFile)
            }
            ShardReq::Lookup(req) => self.lookup(&snap, req).map(ShardResp::Lookup),
            ShardReq::ReadDir(req) => self.read_dir(&snap, req).map(ShardResp::ReadDir),
            ShardReq::FullReadDir(req) => {
                self.full_read_dir(&snap, req).map(ShardResp::FullReadDir)
            }
            ShardReq::LocalFileSpans(req) => {
                self.local_file_spans(&snap, req).map(ShardResp::LocalFileSpans)
            }
            ShardReq::FileSpans(req) => self.file_spans(&snap, req).map(ShardResp::FileSpans),
            ShardReq::BlockServiceFiles(req) => {
                self.block_service_files(&snap, req).map(ShardResp::BlockServiceFiles)
            }
            ShardReq::VisitDirectories(req) => self
                .visit_inodes(&snap, Family::Directories, req.begin_id, req.mtu)
                .map(|(next_id, ids)| ShardResp::VisitDirectories(VisitDirectoriesResp { next_id, ids })),
            ShardReq::VisitFiles(req) => self
                .visit_inodes(&snap, Family::Files, req.begin_id, req.mtu)
                .map(|(next_id, ids)| ShardResp::VisitFiles(VisitFilesResp { next_id, ids })),
            ShardReq::VisitTransientFiles(req) => {
                self.visit_transient_files(&snap, req).map(ShardResp::VisitTransientFiles)
            }
            other => panic!("read-only path got write request kind {:?}", other.kind()),
        };
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => ShardResp::Error(err),
        };
        (last_applied_from(snap.as_ref()), resp)
    }

    fn stat_file(&self, snap: &KvSnapshot, req: &StatFileReq) -> Result<StatFileResp, TernError> {
        let file = get_file(snap, req.id)?;
        Ok(StatFileResp { mtime: file.mtime, atime: file.atime, size: file.file_size })
    }

    fn stat_directory(
        &self,
        snap: &KvSnapshot,
        req: &StatDirectoryReq,
    ) -> Result<StatDirectoryResp, TernError> {
        // snapshot directories allowed, the caller can see owner == NULL
        let dir = get_directory(snap, req.id, true)?;
        Ok(StatDirectoryResp { mtime: dir.mtime, owner: dir.owner_id, info: dir.info })
    }

    fn stat_transient_file(
        &self,
        snap: &KvSnapshot,
        req: &StatTransientFileReq,
    ) -> Result<StatTransientFileResp, TernError> {
        let raw = snap
            .get(Family::TransientFiles, &inode_id_key(req.id))
            .ok_or(TernError::FileNotFound)?;
        let file = TransientFileBody::decode(raw);
        Ok(StatTransientFileResp {
            mtime: file.mtime,
            size: file.file_size,
            note: ShortBytes::new(file.note),
        })
    }

    fn lookup(&self, snap: &KvSnapshot, req: &LookupReq) -> Result<LookupResp, TernError> {
        let name_hash = get_directory_and_hash(snap, req.dir_id, false, &req.name)?;
        let key = edge_key_current(req.dir_id, name_hash, &req.name);
        let raw = snap.get(Family::Edges, &key).ok_or(TernError::NameNotFound)?;
        let edge = CurrentEdgeBody::decode(raw);
        Ok(LookupResp { target_id: edge.target.id(), creation_time: edge.creation_time })
    }

    fn read_dir(&self, snap: &KvSnapshot, req: &ReadDirReq) -> Result<ReadDirResp, TernError> {
        get_directory(snap, req.dir_id, false)?;

        let mut resp = ReadDirResp::default();
        let mut budget =
            pick_mtu(req.mtu) as i64 - MSG_STATIC_SIZE as i64 - READ_DIR_RESP_STATIC_SIZE as i64;

        // bound to the current-edge group so we never cross into snapshots
        let bounds = IterBounds::both(
            edge_group_prefix(req.dir_id, false),
            edge_group_prefix(req.dir_id, true),
        );
        let mut it = snap.iter(Family::Edges, bounds);
        it.seek(&edge_key_current(req.dir_id, req.start_hash, b""));
        while it.valid() {
            let key = EdgeKey::decode(it.key());
            debug_assert!(key.dir_id == req.dir_id && !key.snapshot);
            let edge = CurrentEdgeBody::decode(it.value());
            let entry = CurrentEdge {
                target_id: edge.target.id(),
                name_hash: key.name_hash,
                name: ShortBytes::new(key.name),
                creation_time: edge.creation_time,
            };
            budget -= entry.size() as i64;
            let overflow_hash = entry.name_hash;
            resp.results.push(entry);
            if budget < 0 {
                resp.next_hash = overflow_hash;
                // do not split a same-hash group across pages
                while resp.results.last().is_some_and(|e| e.name_hash == overflow_hash) {
                    resp.results.pop();
                }
                break;
            }
            it.next();
        }
        Ok(resp)
    }

    fn full_read_dir(
        &self,
        snap: &KvSnapshot,
        req: &FullReadDirReq,
    ) -> Result<FullReadDirResp, TernError> {
        let same_name = req.flags & FULL_READ_DIR_SAME_NAME != 0;
        let forwards = req.flags & FULL_READ_DIR_BACKWARDS == 0;

        if same_name && req.start_name.is_empty() {
            return Err(TernError::BadName);
        }

        let dir = get_directory(snap, req.dir_id, true)?;
        let hash_mode = dir.hash_mode;

        let mut walk = EdgeWalk {
            resp: FullReadDirResp::default(),
            budget: pick_mtu(req.mtu) as i64
                - MSG_STATIC_SIZE as i64
                - FULL_READ_DIR_RESP_STATIC_SIZE as i64,
            limit: req.limit,
        };

        if same_name {
            self.full_read_dir_same_name(snap, req, hash_mode, forwards, &mut walk);
        } else {
            self.full_read_dir_normal(snap, req, hash_mode, forwards, &mut walk);
        }
        Ok(walk.resp)
    }

    /// Whole-directory walk. Current edges group before snapshot edges, so
    /// forwards order is current then snapshot and backwards order is
    /// snapshot (descending) then current. The `current` flag widens the
    /// walk to the current-edge group.
    fn full_read_dir_normal(
        &self,
        snap: &KvSnapshot,
        req: &FullReadDirReq,
        hash_mode: crate::types::HashMode,
        forwards: bool,
        walk: &mut EdgeWalk,
    ) {
        let with_current = req.flags & FULL_READ_DIR_CURRENT != 0;
        let dir_id = req.dir_id;

        // cursor region: an explicit start time resumes among snapshot
        // edges; otherwise the current flag picks the current group
        let start_key = if req.start_name.is_empty() {
            if forwards {
                edge_group_prefix(dir_id, !with_current)
            } else {
                edge_dir_end(dir_id)
            }
        } else {
            let name_hash = compute_name_hash(hash_mode, &req.start_name);
            if !req.start_time.is_set() && with_current {
                edge_key_current(dir_id, name_hash, &req.start_name)
            } else {
                let time = if req.start_time.is_set() {
                    req.start_time
                } else if forwards {
                    TernTime(0)
                } else {
                    TernTime(u64::MAX)
                };
                edge_key_snapshot(dir_id, name_hash, &req.start_name, time)
            }
        };

        let bounds = if forwards {
            IterBounds::upper(edge_dir_end(dir_id))
        } else {
            IterBounds::lower(edge_group_prefix(dir_id, !with_current))
        };

        let mut it = snap.iter(Family::Edges, bounds);
        if forwards {
            it.seek(&start_key);
        } else {
            it.seek_for_prev(&start_key);
        }
        while it.valid() {
            let key = EdgeKey::decode(it.key());
            debug_assert!(key.dir_id == dir_id);
            if walk.add(edge_from_kv(&key, it.value())) {
                return;
            }
            if forwards {
                it.next();
            } else {
                it.prev();
            }
        }
    }

    /// Single-name walk over the name's current edge and snapshot history.
    /// The current edge (behind the flag) comes first in either direction,
    /// then the snapshot edges by creation time, so the continuation
    /// cursor never has to point back at the current edge.
    fn full_read_dir_same_name(
        &self,
        snap: &KvSnapshot,
        req: &FullReadDirReq,
        hash_mode: crate::types::HashMode,
        forwards: bool,
        walk: &mut EdgeWalk,
    ) {
        let with_current = req.flags & FULL_READ_DIR_CURRENT != 0;
        let dir_id = req.dir_id;
        let name_hash = compute_name_hash(hash_mode, &req.start_name);

        let lookup_current = |walk: &mut EdgeWalk| -> bool {
            let key = edge_key_current(dir_id, name_hash, &req.start_name);
            match snap.get(Family::Edges, &key) {
                None => false,
                Some(raw) => {
                    let edge = CurrentEdgeBody::decode(raw);
                    walk.add(Edge {
                        current: true,
                        target_id: edge.target,
                        name_hash,
                        name: req.start_name.clone(),
                        creation_time: edge.creation_time,
                    })
                }
            }
        };

        if with_current && lookup_current(walk) {
            return;
        }

        // snapshot edges of this name; the hash bounds the scan, the name
        // check below handles hash collisions
        let start_time = if req.start_time.is_set() {
            req.start_time
        } else if forwards {
            TernTime(0)
        } else {
            TernTime(u64::MAX)
        };
        let start_key = edge_key_snapshot(dir_id, name_hash, &req.start_name, start_time);
        let bounds = if forwards {
            IterBounds::upper(edge_key_snapshot(dir_id, name_hash + 1, b"", TernTime(0)))
        } else {
            IterBounds::lower(edge_key_snapshot(dir_id, name_hash, b"", TernTime(0)))
        };
        let mut it = snap.iter(Family::Edges, bounds);
        if forwards {
            it.seek(&start_key);
        } else {
            it.seek_for_prev(&start_key);
        }
        while it.valid() {
            let key = EdgeKey::decode(it.key());
            debug_assert!(key.dir_id == dir_id);
            if key.name != req.start_name.as_slice() {
                break;
            }
            if walk.add(edge_from_kv(&key, it.value())) {
                return;
            }
            if forwards {
                it.next();
            } else {
                it.prev();
            }
        }

        // forwards without the flag still reports the live edge at the end
        if forwards && !with_current {
            lookup_current(walk);
        }
    }

    fn local_file_spans(
        &self,
        snap: &KvSnapshot,
        req: &LocalFileSpansReq,
    ) -> Result<LocalFileSpansResp, TernError> {
        if !req.file_id.is_file_or_symlink() {
            return Err(TernError::TypeIsDirectory);
        }
        let cache = self.cache.get_cache();
        let mut resp = LocalFileSpansResp::default();
        let mut budget = pick_mtu(req.mtu) as i64
            - MSG_STATIC_SIZE as i64
            - LOCAL_FILE_SPANS_RESP_STATIC_SIZE as i64;

        let mut it = snap.iter(Family::Spans, span_file_bounds(req.file_id));
        it.seek_for_prev(&span_key(req.file_id, req.byte_offset));
        while it.valid() && (req.limit == 0 || (resp.spans.len() as u32) < req.limit) {
            let key = SpanKey::decode(it.key());
            let span = SpanBody::decode(it.value());
            if key.byte_offset + (span.span_size as u64) < req.byte_offset {
                // only possible when the initial backward seek undershot
                debug!(
                    "event=spans_out_of_range offset={} size={} requested={}",
                    key.byte_offset, span.span_size, req.byte_offset
                );
                break;
            }
            let header = FetchedSpanHeader {
                byte_offset: key.byte_offset,
                size: span.span_size,
                crc: span.crc,
            };
            let body = match &span.storage {
                SpanStorage::Inline(bytes) => {
                    FetchedSpanBody::Inline(ShortBytes::new(bytes.clone()))
                }
                SpanStorage::Blocks(locations) => {
                    // match the caller's location, falling back to the first
                    let loc = span
                        .find_location(self.opts.location_id)
                        .unwrap_or(&locations[0]);
                    let mut blocks = Vec::with_capacity(loc.blocks.len());
                    for block in &loc.blocks {
                        let Some(ix) =
                            add_block_service(&mut resp.block_services, &mut budget, &cache, block.block_service)
                        else {
                            break; // budget went negative, the span below gets dropped
                        };
                        blocks.push(FetchedBlock {
                            block_service_ix: ix,
                            block_id: block.block_id,
                            crc: block.crc,
                        });
                    }
                    FetchedSpanBody::Blocks(FetchedBlocksSpan {
                        storage_class: loc.storage_class,
                        parity: loc.parity,
                        stripes: loc.stripes,
                        cell_size: loc.cell_size,
                        blocks,
                        stripes_crc: loc.stripe_crcs.clone(),
                    })
                }
            };
            let fetched = FetchedSpan { header, body };
            budget -= fetched.size() as i64;
            resp.spans.push(fetched);
            if budget < 0 {
                resp.next_offset = key.byte_offset;
                resp.spans.pop();
                break;
            }
            it.next();
        }

        if resp.spans.is_empty() {
            self.check_file_exists_for_span_read(snap, req.file_id)?;
        }
        Ok(resp)
    }

    fn file_spans(
        &self,
        snap: &KvSnapshot,
        req: &FileSpansReq,
    ) -> Result<FileSpansResp, TernError> {
        if req.file_id.is_null() || req.file_id.ty() != InodeType::File {
            return Err(TernError::TypeIsDirectory);
        }
        let cache = self.cache.get_cache();
        let mut resp = FileSpansResp::default();
        let mut budget = pick_mtu(req.mtu) as i64
            - MSG_STATIC_SIZE as i64
            - FILE_SPANS_RESP_STATIC_SIZE as i64;

        let mut it = snap.iter(Family::Spans, span_file_bounds(req.file_id));
        it.seek_for_prev(&span_key(req.file_id, req.byte_offset));
        while it.valid() && (req.limit == 0 || (resp.spans.len() as u32) < req.limit) {
            let key = SpanKey::decode(it.key());
            let span = SpanBody::decode(it.value());
            if key.byte_offset + (span.span_size as u64) < req.byte_offset {
                break;
            }
            let header = FetchedSpanHeader {
                byte_offset: key.byte_offset,
                size: span.span_size,
                crc: span.crc,
            };
            let body = match &span.storage {
                SpanStorage::Inline(bytes) => {
                    FetchedFullSpanBody::Inline(ShortBytes::new(bytes.clone()))
                }
                SpanStorage::Blocks(span_locations) => {
                    let mut locations = Vec::with_capacity(span_locations.len());
                    'locations: for loc in span_locations {
                        let mut blocks = Vec::with_capacity(loc.blocks.len());
                        for block in &loc.blocks {
                            let Some(ix) = add_block_service(
                                &mut resp.block_services,
                                &mut budget,
                                &cache,
                                block.block_service,
                            ) else {
                                break 'locations;
                            };
                            blocks.push(FetchedBlock {
                                block_service_ix: ix,
                                block_id: block.block_id,
                                crc: block.crc,
                            });
                        }
                        locations.push(FetchedLocation {
                            location_id: loc.location_id,
                            storage_class: loc.storage_class,
                            parity: loc.parity,
                            stripes: loc.stripes,
                            cell_size: loc.cell_size,
                            blocks,
                            stripes_crc: loc.stripe_crcs.clone(),
                        });
                    }
                    FetchedFullSpanBody::Locations(locations)
                }
            };
            let fetched = FetchedFullSpan { header, body };
            budget -= fetched.size() as i64;
            resp.spans.push(fetched);
            if budget < 0 {
                resp.next_offset = key.byte_offset;
                resp.spans.pop();
                break;
            }
            it.next();
        }

        if resp.spans.is_empty() {
            self.check_file_exists_for_span_read(snap, req.file_id)?;
        }
        Ok(resp)
    }

    /// Span reads over an empty result double-check the file exists, so a
    /// truly missing file surfaces as `FILE_NOT_FOUND` rather than an
    /// empty page. Unexpected errors from the transient fallback are
    /// logged and swallowed.
    fn check_file_exists_for_span_read(
        &self,
        snap: &KvSnapshot,
        file_id: InodeId,
    ) -> Result<(), TernError> {
        match get_file(snap, file_id) {
            Ok(_) => Ok(()),
            Err(TernError::FileNotFound) => {
                match get_transient_file(snap, TernTime(0), true, file_id) {
                    Ok(_) => Ok(()),
                    Err(TernError::FileNotFound) => Err(TernError::FileNotFound),
                    Err(other) => {
                        debug!(
                            "event=span_read_transient_fallback_error id={file_id} err={other}"
                        );
                        Err(TernError::FileNotFound)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    fn block_service_files(
        &self,
        snap: &KvSnapshot,
        req: &BlockServiceFilesReq,
    ) -> Result<BlockServiceFilesResp, TernError> {
        let mut resp = BlockServiceFilesResp::default();
        let bounds = IterBounds::upper(
            crate::schema::block_service_to_file_key(
                BlockServiceId(req.block_service_id.0 + 1),
                crate::types::NULL_INODE_ID,
            ),
        );
        let mut it = snap.iter(Family::BlockServicesToFiles, bounds);
        it.seek(&crate::schema::block_service_to_file_key(req.block_service_id, req.start_from));
        while it.valid() {
            let key = BlockServiceToFileKey::decode(it.key());
            let blocks = decode_i64(it.value());
            assert!(blocks >= 0, "negative reverse index count for {}", key.file_id);
            if blocks == 0 {
                // left behind by migrations and span removals
                it.next();
                continue;
            }
            resp.file_ids.push(key.file_id);
            break;
        }
        Ok(resp)
    }

    fn visit_inodes(
        &self,
        snap: &KvSnapshot,
        family: Family,
        begin_id: InodeId,
        mtu: u16,
    ) -> Result<(InodeId, Vec<InodeId>), TernError> {
        let budget =
            pick_mtu(mtu) as i64 - MSG_STATIC_SIZE as i64 - VISIT_INODES_RESP_STATIC_SIZE as i64;
        let max_ids = (budget / 8 + 1) as usize; // includes the next-id slot
        let mut ids = Vec::new();
        let mut it = snap.iter(family, IterBounds::none());
        it.seek(&inode_id_key(begin_id));
        while it.valid() && ids.len() < max_ids {
            ids.push(decode_inode_id_key(it.key()));
            it.next();
        }
        let mut next_id = crate::types::NULL_INODE_ID;
        if ids.len() == max_ids {
            next_id = ids.pop().unwrap();
        }
        Ok((next_id, ids))
    }

    fn visit_transient_files(
        &self,
        snap: &KvSnapshot,
        req: &VisitTransientFilesReq,
    ) -> Result<VisitTransientFilesResp, TernError> {
        let mut resp =
            VisitTransientFilesResp { next_id: crate::types::NULL_INODE_ID, files: Vec::new() };
        let mut budget = pick_mtu(req.mtu) as i64
            - MSG_STATIC_SIZE as i64
            - VISIT_TRANSIENT_FILES_RESP_STATIC_SIZE as i64;
        let mut it = snap.iter(Family::TransientFiles, IterBounds::none());
        it.seek(&inode_id_key(req.begin_id));
        while it.valid() {
            let id = decode_inode_id_key(it.key());
            let file = TransientFileBody::decode(it.value());
            let item = TransientFileItem {
                id,
                cookie: self.calc_cookie(id),
                deadline_time: file.deadline,
            };
            budget -= item.size() as i64;
            resp.files.push(item);
            if budget <= 0 {
                resp.next_id = resp.files.pop().unwrap().id;
                break;
            }
            it.next();
        }
        Ok(resp)
    }
}

fn edge_from_kv(key: &EdgeKey, value: &[u8]) -> Edge {
    if key.snapshot {
        let edge = SnapshotEdgeBody::decode(value);
        Edge {
            current: false,
            target_id: edge.target,
            name_hash: key.name_hash,
            name: ShortBytes::new(key.name.clone()),
            creation_time: key.creation_time,
        }
    } else {
        let edge = CurrentEdgeBody::decode(value);
        Edge {
            current: true,
            target_id: edge.target,
            name_hash: key.name_hash,
            name: ShortBytes::new(key.name.clone()),
            creation_time: edge.creation_time,
        }
    }
}

/// Accumulates `full_read_dir` results under the static limit and the MTU
/// budget, maintaining the continuation cursor.
struct EdgeWalk {
    resp: FullReadDirResp,
    budget: i64,
    limit: u16,
}

impl EdgeWalk {
    /// Returns true when the walk is done (limit hit or budget spent).
    fn add(&mut self, edge: Edge) -> bool {
        let edge_size = edge.size() as i64;
        self.resp.results.push(edge);
        if self.limit > 0 && self.resp.results.len() >= self.limit as usize {
            self.resp.next = FullReadDirCursor::default(); // done
            return true;
        }
        self.budget -= edge_size;
        if self.budget >= 0 {
            return false;
        }
        // shrink until the page plus its cursor fit
        let mut prev_cursor_size = FULL_READ_DIR_CURSOR_STATIC_SIZE as i64;
        while self.budget < 0 {
            let Some(last) = self.resp.results.pop() else { break };
            self.budget += last.size() as i64;
            self.resp.next = FullReadDirCursor {
                current: last.current,
                start_time: if last.current { TernTime(0) } else { last.creation_time },
                start_name: last.name,
            };
            self.budget += prev_cursor_size;
            self.budget -= self.resp.next.size() as i64;
            prev_cursor_size = self.resp.next.size() as i64;
        }
        true
    }
}

/// Registers a block service in the response-wide list, charging the
/// budget on first sight. `None` means the budget is spent.
fn add_block_service(
    entries: &mut Vec<BlockServiceEntry>,
    budget: &mut i64,
    cache: &Arc<BlockServicesCache>,
    id: BlockServiceId,
) -> Option<u8> {
    if let Some(ix) = entries.iter().position(|e| e.id == id) {
        return Some(ix as u8);
    }
    *budget -= BLOCK_SERVICE_ENTRY_SIZE as i64;
    if *budget < 0 {
        return None;
    }
    let (addrs, flags) = match cache.info(id) {
        Some(info) => (info.addrs, info.flags),
        None => Default::default(),
    };
    entries.push(BlockServiceEntry { id, addrs, flags });
    assert!(entries.len() <= 256, "block service list overflow");
    Some((entries.len() - 1) as u8)
}
