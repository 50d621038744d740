//! Shared harness for the checkpoint suites: a shard over the in-memory
//! engine, a deterministic clock, and helpers to build block-service
//! caches, consistent span requests, and block proofs.
#![allow(dead_code)]

use std::sync::Arc;

use ternshard::cache::{BlockServiceInfo, BlockServicesCache, BlockServicesCacheDb, CurrentBlockService};
use ternshard::crc32c::crc32c;
use ternshard::crypto::MacKey;
use ternshard::msgs::*;
use ternshard::types::{AddrsInfo, FailureDomain, DEFAULT_LOCATION, FLASH_STORAGE};
use ternshard::{
    BlockServiceId, Crc, InodeId, InodeType, MemKv, Parity, ShardDb, ShardId, ShortBytes,
    StorageClass, TernTime,
};

pub const CLOCK_STEP: u64 = 1_000;

pub struct Harness {
    pub db: ShardDb,
    pub cache: Arc<BlockServicesCacheDb>,
    pub next_idx: u64,
    pub clock: u64,
}

impl Harness {
    pub fn new(shard: u8) -> Self {
        Self::with_options(ternshard::ShardOptions {
            shard_id: ShardId(shard),
            ..Default::default()
        })
    }

    pub fn with_options(opts: ternshard::ShardOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let cache = Arc::new(BlockServicesCacheDb::new());
        let db = ShardDb::open(opts, MemKv::new(), cache.clone()).unwrap();
        Harness { db, cache, next_idx: 0, clock: 1_000_000 }
    }

    pub fn tick(&mut self) -> TernTime {
        self.clock += CLOCK_STEP;
        TernTime(self.clock)
    }

    /// Prepare and apply one write, refreshing the read snapshot.
    pub fn write(&mut self, req: ShardReq) -> Result<ShardResp, ternshard::TernError> {
        let time = self.tick();
        let entry = self.db.prepare_at(time, &req)?;
        Ok(self.apply_entry(&entry))
    }

    /// Apply an already-prepared entry at the next index.
    pub fn apply_entry(&mut self, entry: &ShardLogEntry) -> ShardResp {
        self.next_idx += 1;
        let resp = self.db.apply(self.next_idx, entry);
        self.db.flush();
        resp
    }

    pub fn write_ok(&mut self, req: ShardReq) -> ShardResp {
        let resp = self.write(req).unwrap();
        assert!(!matches!(resp, ShardResp::Error(_)), "unexpected error: {resp:?}");
        resp
    }

    /// The error of a write, whether prepare or apply rejected it.
    pub fn write_err(&mut self, req: ShardReq) -> ternshard::TernError {
        match self.write(req) {
            Err(err) => err,
            Ok(ShardResp::Error(err)) => err,
            Ok(resp) => panic!("expected an error, got {resp:?}"),
        }
    }

    pub fn read(&self, req: ShardReq) -> (u64, ShardResp) {
        self.db.read(&req)
    }

    pub fn read_ok(&self, req: ShardReq) -> ShardResp {
        let (_, resp) = self.read(req);
        assert!(!matches!(resp, ShardResp::Error(_)), "unexpected error: {resp:?}");
        resp
    }

    /// Constructs a transient file and returns (id, cookie).
    pub fn construct_file(&mut self, note: &str) -> (InodeId, [u8; 8]) {
        let resp = self.write_ok(ShardReq::ConstructFile(ConstructFileReq {
            file_type: InodeType::File as u8,
            note: ShortBytes::from(note),
        }));
        let ShardResp::ConstructFile(resp) = resp else { panic!("unexpected {resp:?}") };
        (resp.id, resp.cookie)
    }

    /// Creates a directory inode owned by the root directory.
    pub fn create_directory(&mut self, counter: u64) -> InodeId {
        let id = InodeId::new(InodeType::Directory, self.db.shard_id(), counter);
        self.write_ok(ShardReq::CreateDirectoryInode(CreateDirectoryInodeReq {
            id,
            owner_id: ternshard::ROOT_DIR_INODE_ID,
            info: Default::default(),
        }));
        id
    }

    /// Links a constructed file under `dir` and returns the creation time.
    pub fn link_file(&mut self, file: InodeId, cookie: [u8; 8], dir: InodeId, name: &str) -> TernTime {
        let resp = self.write_ok(ShardReq::LinkFile(LinkFileReq {
            file_id: file,
            cookie,
            owner_id: dir,
            name: ShortBytes::from(name),
        }));
        let ShardResp::LinkFile(resp) = resp else { panic!("unexpected {resp:?}") };
        resp.creation_time
    }

    pub fn add_inline_span(&mut self, file: InodeId, cookie: [u8; 8], offset: u64, body: &[u8]) {
        self.write_ok(ShardReq::AddInlineSpan(AddInlineSpanReq {
            file_id: file,
            cookie,
            storage_class: ternshard::types::INLINE_STORAGE,
            byte_offset: offset,
            size: body.len() as u32,
            crc: crc32c(body),
            body: ShortBytes::new(body.to_vec()),
        }));
    }
}

pub fn block_service_secret(i: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&i.to_le_bytes());
    key[8] = 0xB5;
    key
}

/// A cache of `n` writable flash block services, one failure domain each.
pub fn flash_cache(n: u64) -> BlockServicesCache {
    cache_with(n, DEFAULT_LOCATION, FLASH_STORAGE)
}

pub fn cache_with(n: u64, location_id: u8, storage_class: StorageClass) -> BlockServicesCache {
    let mut cache = BlockServicesCache::default();
    for i in 1..=n {
        let id = BlockServiceId(i);
        let failure_domain = FailureDomain::from_name(&format!("rack{i}"));
        cache.block_services.insert(
            i,
            BlockServiceInfo {
                id,
                addrs: AddrsInfo { addr1: ([10, 0, 0, i as u8], 7000), addr2: ([0; 4], 0) },
                flags: 0,
                location_id,
                storage_class,
                failure_domain,
                secret_key: block_service_secret(i),
            },
        );
        cache.current_block_services.push(CurrentBlockService {
            id,
            location_id,
            storage_class,
            failure_domain,
        });
    }
    cache
}

fn cell_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_mul(37).wrapping_add(i as u8)).collect()
}

/// A consistent blocked-span request: generated cells, mirror-or-XOR
/// parity CRCs, and the combined span CRC.
pub fn blocked_span_req(
    file_id: InodeId,
    cookie: [u8; 8],
    byte_offset: u64,
    data: u8,
    parity: u8,
    stripes: u8,
    cell_size: u32,
) -> AddSpanInitiateReq {
    let shape = Parity::new(data, parity);
    let blocks = shape.blocks();
    let span_size = cell_size * stripes as u32 * data as u32;
    let mut crcs = vec![Crc(0); stripes as usize * blocks];
    let mut span = Vec::new();
    for s in 0..stripes as usize {
        let mut cells: Vec<Vec<u8>> = Vec::new();
        for d in 0..data as usize {
            let cell = cell_bytes((1 + s * blocks + d) as u8, cell_size as usize);
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
            for p in 1..parity as usize {
                crcs[s * blocks + data as usize + p] = Crc(0x5EED + p as u32);
            }
        }
    }
    AddSpanInitiateReq {
        file_id,
        cookie,
        byte_offset,
        size: span_size,
        crc: crc32c(&span),
        storage_class: FLASH_STORAGE,
        parity: shape,
        stripes,
        cell_size,
        crcs,
        blacklist: Vec::new(),
    }
}

/// Write proofs for every block handed out by an add-span-initiate.
pub fn write_proofs(blocks: &[AddSpanInitiateBlockInfo]) -> Vec<BlockProof> {
    blocks
        .iter()
        .map(|b| BlockProof {
            block_id: b.block_id,
            proof: ternshard::shard::block_write_proof(
                &MacKey::new(&block_service_secret(b.block_service_id.0)),
                b.block_service_id,
                b.block_id,
            ),
        })
        .collect()
}

/// Erase proofs for every block returned by a remove-span-initiate.
pub fn erase_proofs(blocks: &[RemoveSpanInitiateBlockInfo]) -> Vec<BlockProof> {
    blocks
        .iter()
        .map(|b| BlockProof {
            block_id: b.block_id,
            proof: ternshard::shard::block_erase_proof(
                &MacKey::new(&block_service_secret(b.block_service_id.0)),
                b.block_service_id,
                b.block_id,
            ),
        })
        .collect()
}
