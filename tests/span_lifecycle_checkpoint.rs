//! Blocked spans end to end: placement, certification, condemnation, and
//! erase certification, plus the reverse index they maintain.

mod common;

use std::collections::HashSet;

use common::{blocked_span_req, erase_proofs, flash_cache, write_proofs, Harness};
use ternshard::msgs::*;
use ternshard::types::FLASH_STORAGE;
use ternshard::{BlockServiceId, InodeId, ShardId, TernError};

fn span_harness(services: u64) -> Harness {
    let h = Harness::new(0x01);
    h.cache.replace(flash_cache(services));
    h
}

fn initiate(h: &mut Harness, req: AddSpanInitiateReq) -> AddSpanInitiateResp {
    let resp = h.write_ok(ShardReq::AddSpanInitiate(req));
    let ShardResp::AddSpanInitiate(resp) = resp else { panic!("unexpected {resp:?}") };
    resp
}

#[test]
fn wide_span_picks_distinct_failure_domains() {
    let mut h = span_harness(20);
    let (id, cookie) = h.construct_file("big");

    // parity (10,4): fourteen blocks, fourteen distinct services
    let resp = initiate(&mut h, blocked_span_req(id, cookie, 0, 10, 4, 1, 128 << 10));
    assert_eq!(resp.blocks.len(), 14);
    let services: HashSet<BlockServiceId> =
        resp.blocks.iter().map(|b| b.block_service_id).collect();
    assert_eq!(services.len(), 14);
    let domains: HashSet<_> =
        resp.blocks.iter().map(|b| b.block_service_failure_domain.0).collect();
    assert_eq!(domains.len(), 14);

    // block ids are fresh, shard-tagged, and strictly spaced
    let mut ids: Vec<u64> = resp.blocks.iter().map(|b| b.block_id.0).collect();
    ids.sort_unstable();
    for pair in ids.windows(2) {
        assert!(pair[1] >= pair[0] + 0x100);
    }
    assert!(ids.iter().all(|id| id & 0xFF == 1));

    // the file is now dirty: linking is refused until certification
    let dir = h.create_directory(1);
    let err = h.write_err(ShardReq::LinkFile(LinkFileReq {
        file_id: id,
        cookie,
        owner_id: dir,
        name: "big".into(),
    }));
    assert_eq!(err, TernError::LastSpanStateNotClean);

    // certify with write proofs from every block service
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: write_proofs(&resp.blocks),
    }));
    h.link_file(id, cookie, dir, "big");
}

#[test]
fn too_few_failure_domains_fail_placement() {
    let mut h = span_harness(10);
    let (id, cookie) = h.construct_file("");
    let err = h.write_err(ShardReq::AddSpanInitiate(blocked_span_req(
        id, cookie, 0, 10, 4, 1, 4096,
    )));
    assert_eq!(err, TernError::CouldNotPickBlockServices);
}

#[test]
fn blacklist_excludes_services_and_domains() {
    let mut h = span_harness(4);
    let (id, cookie) = h.construct_file("");
    let mut req = blocked_span_req(id, cookie, 0, 1, 1, 1, 4096);
    req.blacklist = vec![
        BlacklistEntry {
            failure_domain: ternshard::types::FailureDomain::from_name("rack1"),
            block_service: BlockServiceId(0),
        },
        BlacklistEntry {
            failure_domain: ternshard::types::FailureDomain::default(),
            block_service: BlockServiceId(2),
        },
    ];
    let resp = initiate(&mut h, req);
    let picked: HashSet<u64> = resp.blocks.iter().map(|b| b.block_service_id.0).collect();
    assert!(!picked.contains(&1), "blacklisted by failure domain");
    assert!(!picked.contains(&2), "blacklisted by id");
}

#[test]
fn placement_inherits_from_existing_spans() {
    let mut h = span_harness(8);
    let (id, cookie) = h.construct_file("");

    let first = initiate(&mut h, blocked_span_req(id, cookie, 0, 1, 2, 1, 4096));
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: write_proofs(&first.blocks),
    }));

    let second = initiate(&mut h, blocked_span_req(id, cookie, 4096, 1, 2, 1, 4096));
    let first_services: HashSet<u64> =
        first.blocks.iter().map(|b| b.block_service_id.0).collect();
    let second_services: HashSet<u64> =
        second.blocks.iter().map(|b| b.block_service_id.0).collect();
    assert_eq!(first_services, second_services, "placement should stay stable");
}

#[test]
fn add_span_initiate_replay_returns_original_blocks() {
    let mut h = span_harness(5);
    let (id, cookie) = h.construct_file("");

    let time = h.tick();
    let entry = h
        .db
        .prepare_at(time, &ShardReq::AddSpanInitiate(blocked_span_req(id, cookie, 0, 2, 1, 1, 4096)))
        .unwrap();
    let resp = h.apply_entry(&entry);
    let ShardResp::AddSpanInitiate(first) = resp else { panic!("unexpected {resp:?}") };

    // same entry applied again: success, and the same block ids come back
    let mut replay = entry.clone();
    replay.time = h.tick();
    let resp = h.apply_entry(&replay);
    let ShardResp::AddSpanInitiate(second) = resp else { panic!("unexpected {resp:?}") };
    let first_ids: Vec<_> = first.blocks.iter().map(|b| b.block_id).collect();
    let second_ids: Vec<_> = second.blocks.iter().map(|b| b.block_id).collect();
    assert_eq!(first_ids, second_ids);
}

#[test]
fn certify_validates_proofs() {
    let mut h = span_harness(5);
    let (id, cookie) = h.construct_file("");
    let resp = initiate(&mut h, blocked_span_req(id, cookie, 0, 2, 1, 1, 4096));

    let mut bad = write_proofs(&resp.blocks);
    bad[0].proof[0] ^= 1;
    assert_eq!(
        h.write_err(ShardReq::AddSpanCertify(AddSpanCertifyReq {
            file_id: id,
            cookie,
            byte_offset: 0,
            proofs: bad,
        })),
        TernError::BadBlockProof
    );

    let mut short = write_proofs(&resp.blocks);
    short.pop();
    assert_eq!(
        h.write_err(ShardReq::AddSpanCertify(AddSpanCertifyReq {
            file_id: id,
            cookie,
            byte_offset: 0,
            proofs: short,
        })),
        TernError::BadNumberOfBlocksProofs
    );

    let good = write_proofs(&resp.blocks);
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: good.clone(),
    }));
    // certifying an already-clean span is a no-op
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: good,
    }));
}

#[test]
fn remove_span_round_trip_shrinks_file() {
    let mut h = span_harness(20);
    let (id, cookie) = h.construct_file("");
    let resp = initiate(&mut h, blocked_span_req(id, cookie, 0, 10, 4, 1, 4096));
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: write_proofs(&resp.blocks),
    }));

    // every block service now references the file
    for block in &resp.blocks {
        let read = h.read_ok(ShardReq::BlockServiceFiles(BlockServiceFilesReq {
            block_service_id: block.block_service_id,
            start_from: ternshard::NULL_INODE_ID,
        }));
        let ShardResp::BlockServiceFiles(files) = read else { panic!() };
        assert_eq!(files.file_ids, vec![id]);
    }

    // condemn: fourteen erase certificates come back
    let removed = h.write_ok(ShardReq::RemoveSpanInitiate(RemoveSpanInitiateReq {
        file_id: id,
        cookie,
    }));
    let ShardResp::RemoveSpanInitiate(removed) = removed else { panic!() };
    assert_eq!(removed.byte_offset, 0);
    assert_eq!(removed.blocks.len(), 14);
    for block in &removed.blocks {
        let expected = ternshard::shard::block_erase_certificate(
            &ternshard::crypto::MacKey::new(&common::block_service_secret(
                block.block_service_id.0,
            )),
            block.block_service_id,
            block.block_id,
        );
        assert_eq!(block.certificate, expected);
    }

    // erase proofs flip the file back to clean and shrink it
    h.write_ok(ShardReq::RemoveSpanCertify(RemoveSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: erase_proofs(&removed.blocks),
    }));
    let resp = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    let ShardResp::StatTransientFile(stat) = resp else { panic!() };
    assert_eq!(stat.size, 0);

    // re-certifying the removed span is a no-op
    h.write_ok(ShardReq::RemoveSpanCertify(RemoveSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: Vec::new(),
    }));

    // reverse-index rows went back to zero and are sweepable
    let resp = h.write_ok(ShardReq::RemoveZeroBlockServiceFiles(RemoveZeroBlockServiceFilesReq {
        start_block_service: BlockServiceId(0),
        start_file: ternshard::NULL_INODE_ID,
    }));
    let ShardResp::RemoveZeroBlockServiceFiles(swept) = resp else { panic!() };
    assert_eq!(swept.removed, 14);
    assert_eq!(swept.next_file, ternshard::NULL_INODE_ID);
}

#[test]
fn remove_inline_span_needs_no_certification() {
    let mut h = span_harness(2);
    let (id, cookie) = h.construct_file("");
    h.add_inline_span(id, cookie, 0, b"just bytes");
    let resp = h.write_ok(ShardReq::RemoveSpanInitiate(RemoveSpanInitiateReq {
        file_id: id,
        cookie,
    }));
    let ShardResp::RemoveSpanInitiate(resp) = resp else { panic!() };
    assert!(resp.blocks.is_empty());
    let stat = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    let ShardResp::StatTransientFile(stat) = stat else { panic!() };
    assert_eq!(stat.size, 0);

    // an empty file has nothing to remove
    assert_eq!(
        h.write_err(ShardReq::RemoveSpanInitiate(RemoveSpanInitiateReq { file_id: id, cookie })),
        TernError::FileEmpty
    );
}

#[test]
fn dirty_span_can_be_condemned() {
    let mut h = span_harness(5);
    let (id, cookie) = h.construct_file("");
    let resp = initiate(&mut h, blocked_span_req(id, cookie, 0, 2, 1, 1, 4096));
    // no certification: the writer died; removal must still work
    let removed = h.write_ok(ShardReq::RemoveSpanInitiate(RemoveSpanInitiateReq {
        file_id: id,
        cookie,
    }));
    let ShardResp::RemoveSpanInitiate(removed) = removed else { panic!() };
    assert_eq!(removed.blocks.len(), resp.blocks.len());
    // and a certify of the condemned span is refused
    assert_eq!(
        h.write_err(ShardReq::AddSpanCertify(AddSpanCertifyReq {
            file_id: id,
            cookie,
            byte_offset: 0,
            proofs: write_proofs(&resp.blocks),
        })),
        TernError::SpanNotFound
    );
}

#[test]
fn spans_read_back_with_block_layout() {
    let mut h = span_harness(5);
    let (id, cookie) = h.construct_file("");
    let req = blocked_span_req(id, cookie, 0, 2, 1, 2, 4096);
    let span_size = req.size;
    let resp = initiate(&mut h, req);
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: id,
        cookie,
        byte_offset: 0,
        proofs: write_proofs(&resp.blocks),
    }));

    let read = h.read_ok(ShardReq::LocalFileSpans(LocalFileSpansReq {
        file_id: id,
        byte_offset: 0,
        limit: 0,
        mtu: 0,
    }));
    let ShardResp::LocalFileSpans(spans) = read else { panic!() };
    assert_eq!(spans.spans.len(), 1);
    let span = &spans.spans[0];
    assert_eq!(span.header.size, span_size);
    let FetchedSpanBody::Blocks(blocks) = &span.body else { panic!("expected blocks") };
    assert_eq!(blocks.storage_class, FLASH_STORAGE);
    assert_eq!(blocks.blocks.len(), 3);
    assert_eq!(blocks.stripes_crc.len(), 2);
    for block in &blocks.blocks {
        let entry = &spans.block_services[block.block_service_ix as usize];
        assert!(entry.id.0 >= 1 && entry.id.0 <= 5);
    }

    let read = h.read_ok(ShardReq::FileSpans(FileSpansReq {
        file_id: id,
        byte_offset: 0,
        limit: 0,
        mtu: 0,
    }));
    let ShardResp::FileSpans(spans) = read else { panic!() };
    let FetchedFullSpanBody::Locations(locations) = &spans.spans[0].body else {
        panic!("expected locations")
    };
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].location_id, ternshard::types::DEFAULT_LOCATION);
}

#[test]
fn span_reads_report_missing_files() {
    let h = span_harness(2);
    let missing = InodeId::new(ternshard::InodeType::File, ShardId(1), 77);
    let (_, resp) = h.read(ShardReq::LocalFileSpans(LocalFileSpansReq {
        file_id: missing,
        byte_offset: 0,
        limit: 0,
        mtu: 0,
    }));
    assert_eq!(resp, ShardResp::Error(TernError::FileNotFound));
}

#[test]
fn move_span_shifts_dirty_tail() {
    let mut h = span_harness(5);
    let (src, src_cookie) = h.construct_file("");
    let (dst, dst_cookie) = h.construct_file("");

    let req = blocked_span_req(src, src_cookie, 0, 2, 1, 1, 4096);
    let span_size = req.size;
    initiate(&mut h, req);

    // src holds a dirty span [0, span); dst is empty and clean
    h.write_ok(ShardReq::MoveSpan(MoveSpanReq {
        span_size,
        file_id1: src,
        byte_offset1: 0,
        cookie1: src_cookie,
        file_id2: dst,
        byte_offset2: 0,
        cookie2: dst_cookie,
    }));

    let stat = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id: src }));
    let ShardResp::StatTransientFile(stat) = stat else { panic!() };
    assert_eq!(stat.size, 0);
    let stat = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id: dst }));
    let ShardResp::StatTransientFile(stat) = stat else { panic!() };
    assert_eq!(stat.size, span_size as u64);

    // replaying converges: the already-moved state reports success
    h.write_ok(ShardReq::MoveSpan(MoveSpanReq {
        span_size,
        file_id1: src,
        byte_offset1: 0,
        cookie1: src_cookie,
        file_id2: dst,
        byte_offset2: 0,
        cookie2: dst_cookie,
    }));
}

#[test]
fn swap_spans_trades_whole_layouts() {
    let mut h = span_harness(8);
    let dir = h.create_directory(1);
    let (a, a_cookie) = h.construct_file("");
    let (b, b_cookie) = h.construct_file("");

    // identical content so sizes and crcs match
    let req_a = blocked_span_req(a, a_cookie, 0, 2, 1, 1, 4096);
    let mut req_b = req_a.clone();
    req_b.file_id = b;
    req_b.cookie = b_cookie;
    let resp_a = initiate(&mut h, req_a);
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: a,
        cookie: a_cookie,
        byte_offset: 0,
        proofs: write_proofs(&resp_a.blocks),
    }));
    let resp_b = initiate(&mut h, req_b);
    h.write_ok(ShardReq::AddSpanCertify(AddSpanCertifyReq {
        file_id: b,
        cookie: b_cookie,
        byte_offset: 0,
        proofs: write_proofs(&resp_b.blocks),
    }));
    h.link_file(a, a_cookie, dir, "a");
    h.link_file(b, b_cookie, dir, "b");

    let blocks_a: Vec<u64> = resp_a.blocks.iter().map(|x| x.block_id.0).collect();
    let blocks_b: Vec<u64> = resp_b.blocks.iter().map(|x| x.block_id.0).collect();
    let swap = SwapSpansReq {
        file_id1: a,
        byte_offset1: 0,
        blocks1: blocks_a.clone(),
        file_id2: b,
        byte_offset2: 0,
        blocks2: blocks_b.clone(),
    };
    h.write_ok(ShardReq::SwapSpans(swap.clone()));

    // a now holds b's blocks
    let read = h.read_ok(ShardReq::FileSpans(FileSpansReq {
        file_id: a,
        byte_offset: 0,
        limit: 0,
        mtu: 0,
    }));
    let ShardResp::FileSpans(spans) = read else { panic!() };
    let FetchedFullSpanBody::Locations(locations) = &spans.spans[0].body else { panic!() };
    let now_in_a: Vec<u64> = locations[0].blocks.iter().map(|x| x.block_id.0).collect();
    assert_eq!(now_in_a, blocks_b);

    // replaying the same swap detects the crosswise state and succeeds
    h.write_ok(ShardReq::SwapSpans(swap));
}
