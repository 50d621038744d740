//! End-to-end lifecycle of a file: construct, fill, link, unlink, make
//! transient, remove — including the idempotency replays clients rely on.

mod common;

use common::Harness;
use ternshard::crypto::MacKey;
use ternshard::msgs::*;
use ternshard::{InodeId, InodeType, ShardId, ShortBytes, TernError, TernTime};

#[test]
fn construct_returns_packed_id_and_cookie() {
    let mut h = Harness::new(0x01);
    let (id, cookie) = h.construct_file("first");
    assert_eq!(id.u64(), 0x0000_0000_0000_0101);
    assert_eq!(id.ty(), InodeType::File);
    assert_eq!(id.shard(), ShardId(1));
    assert_eq!(id.counter(), 1);

    // the cookie is the MAC of the id under the shard secret
    let expected = MacKey::new(h.db.secret_key()).cbc_mac(&id.u64().to_le_bytes());
    assert_eq!(cookie, expected);

    let resp = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    let ShardResp::StatTransientFile(stat) = resp else { panic!("unexpected {resp:?}") };
    assert_eq!(stat.size, 0);
    assert_eq!(stat.note.as_slice(), b"first");
}

#[test]
fn construct_stamps_deadline_from_interval() {
    let mut h = Harness::with_options(ternshard::ShardOptions {
        shard_id: ShardId(1),
        transient_deadline_interval_ns: 3_600_000_000_000, // 1 hour
        ..Default::default()
    });
    let time = TernTime(h.clock + common::CLOCK_STEP);
    let entry = h
        .db
        .prepare_at(
            time,
            &ShardReq::ConstructFile(ConstructFileReq {
                file_type: InodeType::File as u8,
                note: ShortBytes::from(""),
            }),
        )
        .unwrap();
    let ShardLogEntryBody::ConstructFile(ref body) = entry.body else { panic!() };
    assert_eq!(body.deadline_time, time.plus_ns(3_600_000_000_000));
}

#[test]
fn inline_span_accumulates_and_replays_idempotently() {
    let mut h = Harness::new(0x01);
    let (id, cookie) = h.construct_file("data");

    let body = vec![0xAB; 100];
    let time = h.tick();
    let entry = h
        .db
        .prepare_at(
            time,
            &ShardReq::AddInlineSpan(AddInlineSpanReq {
                file_id: id,
                cookie,
                storage_class: ternshard::types::INLINE_STORAGE,
                byte_offset: 0,
                size: 100,
                crc: ternshard::crc32c::crc32c(&body),
                body: ShortBytes::new(body),
            }),
        )
        .unwrap();
    assert!(!matches!(h.apply_entry(&entry), ShardResp::Error(_)));

    let resp = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    let ShardResp::StatTransientFile(stat) = resp else { panic!() };
    assert_eq!(stat.size, 100);

    // replaying the same entry at the next index succeeds and changes nothing
    let mut replay = entry.clone();
    replay.time = h.tick();
    assert!(!matches!(h.apply_entry(&replay), ShardResp::Error(_)));
    let resp = h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    let ShardResp::StatTransientFile(stat) = resp else { panic!() };
    assert_eq!(stat.size, 100);
}

#[test]
fn inline_span_rejects_bad_crc_and_cookie() {
    let mut h = Harness::new(0x01);
    let (id, cookie) = h.construct_file("");
    let body = b"hello world".to_vec();

    let mut req = AddInlineSpanReq {
        file_id: id,
        cookie,
        storage_class: ternshard::types::INLINE_STORAGE,
        byte_offset: 0,
        size: body.len() as u32,
        crc: ternshard::crc32c::crc32c(&body),
        body: ShortBytes::new(body),
    };
    req.crc = ternshard::Crc(req.crc.0 ^ 1);
    assert_eq!(h.write_err(ShardReq::AddInlineSpan(req.clone())), TernError::BadSpanBody);

    req.crc = ternshard::Crc(req.crc.0 ^ 1);
    req.cookie = [0; 8];
    assert_eq!(h.write_err(ShardReq::AddInlineSpan(req)), TernError::BadCookie);
}

#[test]
fn link_then_lookup_then_soft_unlink() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(7);
    let (id, cookie) = h.construct_file("");
    h.add_inline_span(id, cookie, 0, b"contents");

    let t1 = h.link_file(id, cookie, dir, "hello");

    // transient record is gone, durable record exists
    let (_, resp) = h.read(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    assert_eq!(resp, ShardResp::Error(TernError::FileNotFound));
    let resp = h.read_ok(ShardReq::StatFile(StatFileReq { id }));
    let ShardResp::StatFile(stat) = resp else { panic!() };
    assert_eq!(stat.size, 8);

    let resp = h.read_ok(ShardReq::Lookup(LookupReq {
        dir_id: dir,
        name: ShortBytes::from("hello"),
    }));
    let ShardResp::Lookup(lookup) = resp else { panic!() };
    assert_eq!(lookup.target_id, id);
    assert_eq!(lookup.creation_time, t1);

    // linking again with the same name and target is the idempotent path
    let resp = h.write_ok(ShardReq::LinkFile(LinkFileReq {
        file_id: id,
        cookie,
        owner_id: dir,
        name: ShortBytes::from("hello"),
    }));
    assert_eq!(resp, ShardResp::LinkFile(LinkFileResp { creation_time: t1 }));

    // soft unlink, then the name is free and history holds two snapshot edges
    let resp = h.write_ok(ShardReq::SoftUnlinkFile(SoftUnlinkFileReq {
        owner_id: dir,
        file_id: id,
        name: ShortBytes::from("hello"),
        creation_time: t1,
    }));
    let ShardResp::SoftUnlinkFile(unlink) = resp else { panic!() };

    let (_, resp) =
        h.read(ShardReq::Lookup(LookupReq { dir_id: dir, name: ShortBytes::from("hello") }));
    assert_eq!(resp, ShardResp::Error(TernError::NameNotFound));

    let resp = h.read_ok(ShardReq::FullReadDir(FullReadDirReq {
        dir_id: dir,
        flags: FULL_READ_DIR_SAME_NAME | FULL_READ_DIR_BACKWARDS,
        start_name: ShortBytes::from("hello"),
        start_time: TernTime(0),
        limit: 0,
        mtu: 0,
    }));
    let ShardResp::FullReadDir(listing) = resp else { panic!() };
    assert_eq!(listing.results.len(), 2);
    // newest first: the deletion edge, then the owned history edge
    assert_eq!(listing.results[0].creation_time, unlink.delete_creation_time);
    assert!(listing.results[0].target_id.id().is_null());
    assert!(!listing.results[0].target_id.extra());
    assert_eq!(listing.results[1].creation_time, t1);
    assert_eq!(listing.results[1].target_id.id(), id);
    assert!(listing.results[1].target_id.extra(), "history edge must own the file");
}

#[test]
fn soft_unlink_validates_target_and_time() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(3);
    let (id, cookie) = h.construct_file("");
    let t1 = h.link_file(id, cookie, dir, "name");

    let err = h.write_err(ShardReq::SoftUnlinkFile(SoftUnlinkFileReq {
        owner_id: dir,
        file_id: InodeId::new(InodeType::File, ShardId(1), 999),
        name: ShortBytes::from("name"),
        creation_time: t1,
    }));
    assert_eq!(err, TernError::MismatchingTarget);

    let err = h.write_err(ShardReq::SoftUnlinkFile(SoftUnlinkFileReq {
        owner_id: dir,
        file_id: id,
        name: ShortBytes::from("name"),
        creation_time: TernTime(t1.0 + 1),
    }));
    assert_eq!(err, TernError::MismatchingCreationTime);

    let err = h.write_err(ShardReq::SoftUnlinkFile(SoftUnlinkFileReq {
        owner_id: dir,
        file_id: id,
        name: ShortBytes::from("missing"),
        creation_time: t1,
    }));
    assert_eq!(err, TernError::EdgeNotFound);
}

#[test]
fn same_directory_rename_keeps_history() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(4);
    let (id, cookie) = h.construct_file("");
    let t1 = h.link_file(id, cookie, dir, "old");

    let resp = h.write_ok(ShardReq::SameDirectoryRename(SameDirectoryRenameReq {
        target_id: id,
        dir_id: dir,
        old_name: ShortBytes::from("old"),
        old_creation_time: t1,
        new_name: ShortBytes::from("new"),
    }));
    let ShardResp::SameDirectoryRename(rename) = resp else { panic!() };

    let resp =
        h.read_ok(ShardReq::Lookup(LookupReq { dir_id: dir, name: ShortBytes::from("new") }));
    let ShardResp::Lookup(lookup) = resp else { panic!() };
    assert_eq!(lookup.target_id, id);
    assert_eq!(lookup.creation_time, rename.new_creation_time);

    // the rename does not transfer ownership to the old-name history edge
    let resp = h.read_ok(ShardReq::FullReadDir(FullReadDirReq {
        dir_id: dir,
        flags: FULL_READ_DIR_SAME_NAME | FULL_READ_DIR_BACKWARDS,
        start_name: ShortBytes::from("old"),
        start_time: TernTime(0),
        limit: 0,
        mtu: 0,
    }));
    let ShardResp::FullReadDir(listing) = resp else { panic!() };
    assert_eq!(listing.results.len(), 2);
    assert!(listing.results.iter().all(|e| !e.target_id.extra()));

    // renaming to the same name is rejected at prepare
    let err = h.write_err(ShardReq::SameDirectoryRename(SameDirectoryRenameReq {
        target_id: id,
        dir_id: dir,
        old_name: ShortBytes::from("new"),
        old_creation_time: rename.new_creation_time,
        new_name: ShortBytes::from("new"),
    }));
    assert_eq!(err, TernError::SameSourceAndDestination);
}

#[test]
fn unlinked_name_can_be_reused() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(5);
    let (first, cookie1) = h.construct_file("");
    let t1 = h.link_file(first, cookie1, dir, "slot");
    h.write_ok(ShardReq::SoftUnlinkFile(SoftUnlinkFileReq {
        owner_id: dir,
        file_id: first,
        name: ShortBytes::from("slot"),
        creation_time: t1,
    }));

    let (second, cookie2) = h.construct_file("");
    let t2 = h.link_file(second, cookie2, dir, "slot");
    assert!(t2 > t1);

    let resp =
        h.read_ok(ShardReq::Lookup(LookupReq { dir_id: dir, name: ShortBytes::from("slot") }));
    let ShardResp::Lookup(lookup) = resp else { panic!() };
    assert_eq!(lookup.target_id, second);

    // the first file's history edge still owns it
    let resp = h.read_ok(ShardReq::FullReadDir(FullReadDirReq {
        dir_id: dir,
        flags: FULL_READ_DIR_SAME_NAME | FULL_READ_DIR_BACKWARDS,
        start_name: ShortBytes::from("slot"),
        start_time: TernTime(0),
        limit: 0,
        mtu: 0,
    }));
    let ShardResp::FullReadDir(listing) = resp else { panic!() };
    let owned: Vec<_> = listing.results.iter().filter(|e| e.target_id.extra()).collect();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].target_id.id(), first);
}

#[test]
fn make_file_transient_and_remove_inode() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(6);
    let (id, cookie) = h.construct_file("");
    let t1 = h.link_file(id, cookie, dir, "doomed");
    h.write_ok(ShardReq::SoftUnlinkFile(SoftUnlinkFileReq {
        owner_id: dir,
        file_id: id,
        name: ShortBytes::from("doomed"),
        creation_time: t1,
    }));

    h.write_ok(ShardReq::MakeFileTransient(MakeFileTransientReq {
        id,
        note: ShortBytes::from("gc"),
    }));
    // idempotent: already transient
    h.write_ok(ShardReq::MakeFileTransient(MakeFileTransientReq {
        id,
        note: ShortBytes::from("gc"),
    }));

    let (_, resp) = h.read(ShardReq::StatFile(StatFileReq { id }));
    assert_eq!(resp, ShardResp::Error(TernError::FileNotFound));
    h.read_ok(ShardReq::StatTransientFile(StatTransientFileReq { id }));

    // a removal before the deadline passes is refused; make-file-transient
    // stamps the deadline with its own entry time, so the next tick passes
    h.write_ok(ShardReq::RemoveInode(RemoveInodeReq { id }));
    let (_, resp) = h.read(ShardReq::StatTransientFile(StatTransientFileReq { id }));
    assert_eq!(resp, ShardResp::Error(TernError::FileNotFound));

    // removing a removed inode is fine
    h.write_ok(ShardReq::RemoveInode(RemoveInodeReq { id }));
}

#[test]
fn remove_inode_requires_deadline_and_emptiness() {
    let mut h = Harness::new(0x01);
    let (id, cookie) = h.construct_file("keeps running");
    // fresh transient file: deadline is one interval away
    assert_eq!(
        h.write_err(ShardReq::RemoveInode(RemoveInodeReq { id })),
        TernError::DeadlineNotPassed
    );

    // scrap it so the deadline is now in the past, but give it a span
    h.add_inline_span(id, cookie, 0, b"span");
    h.write_ok(ShardReq::ScrapTransientFile(ScrapTransientFileReq { id, cookie }));
    assert_eq!(
        h.write_err(ShardReq::RemoveInode(RemoveInodeReq { id })),
        TernError::FileNotEmpty
    );

    // durable files cannot be removed directly
    let dir = h.create_directory(8);
    let (linked, cookie2) = h.construct_file("");
    h.link_file(linked, cookie2, dir, "alive");
    assert_eq!(
        h.write_err(ShardReq::RemoveInode(RemoveInodeReq { id: linked })),
        TernError::FileIsNotTransient
    );
}

#[test]
fn link_requires_clean_last_span_and_cookie() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(9);
    let (id, _) = h.construct_file("");
    let err = h.write_err(ShardReq::LinkFile(LinkFileReq {
        file_id: id,
        cookie: [1; 8],
        owner_id: dir,
        name: ShortBytes::from("x"),
    }));
    assert_eq!(err, TernError::BadCookie);
}

#[test]
fn set_time_flags_fields_with_high_bit() {
    let mut h = Harness::new(0x01);
    let dir = h.create_directory(10);
    let (id, cookie) = h.construct_file("");
    h.link_file(id, cookie, dir, "timed");

    h.write_ok(ShardReq::SetTime(SetTimeReq {
        id,
        mtime: (1 << 63) | 12_345,
        atime: 99_999, // high bit clear: leave atime alone
    }));
    let resp = h.read_ok(ShardReq::StatFile(StatFileReq { id }));
    let ShardResp::StatFile(stat) = resp else { panic!() };
    assert_eq!(stat.mtime, TernTime(12_345));
    assert_ne!(stat.atime, TernTime(99_999));
}
