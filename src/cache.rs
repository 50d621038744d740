//! Read-only view of the block services known to the cluster.
//!
//! The cache itself is owned and refreshed by an external component; the
//! shard only snapshots it, once per handler call, to pick block services
//! during write preparation and to enrich span reads with addresses and
//! flags.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::SecretKey;
use crate::types::{AddrsInfo, BlockServiceId, FailureDomain, StorageClass};

/// Full record for one block service.
#[derive(Debug, Clone)]
pub struct BlockServiceInfo {
    pub id: BlockServiceId,
    pub addrs: AddrsInfo,
    pub flags: u8,
    pub location_id: u8,
    pub storage_class: StorageClass,
    pub failure_domain: FailureDomain,
    pub secret_key: SecretKey,
}

/// Short entry in the "currently writable" list consulted by span
/// placement.
#[derive(Debug, Clone, Copy)]
pub struct CurrentBlockService {
    pub id: BlockServiceId,
    pub location_id: u8,
    pub storage_class: StorageClass,
    pub failure_domain: FailureDomain,
}

/// One immutable cache generation.
#[derive(Debug, Default, Clone)]
pub struct BlockServicesCache {
    pub block_services: HashMap<u64, BlockServiceInfo>,
    pub current_block_services: Vec<CurrentBlockService>,
}

impl BlockServicesCache {
    pub fn info(&self, id: BlockServiceId) -> Option<&BlockServiceInfo> {
        self.block_services.get(&id.0)
    }
}

/// Shared handle; readers grab an `Arc` of the current generation, writers
/// swap in a whole new one.
#[derive(Default, Debug)]
pub struct BlockServicesCacheDb {
    current: RwLock<Arc<BlockServicesCache>>,
}

impl BlockServicesCacheDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cache(&self) -> Arc<BlockServicesCache> {
        self.current.read().clone()
    }

    pub fn replace(&self, cache: BlockServicesCache) {
        *self.current.write() = Arc::new(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_replacement() {
        let db = BlockServicesCacheDb::new();
        let mut gen1 = BlockServicesCache::default();
        gen1.block_services.insert(
            1,
            BlockServiceInfo {
                id: BlockServiceId(1),
                addrs: AddrsInfo::default(),
                flags: 0,
                location_id: 0,
                storage_class: crate::types::FLASH_STORAGE,
                failure_domain: FailureDomain::from_name("rack1"),
                secret_key: [0u8; 16],
            },
        );
        db.replace(gen1);
        let snap = db.get_cache();
        db.replace(BlockServicesCache::default());
        assert!(snap.info(BlockServiceId(1)).is_some());
        assert!(db.get_cache().info(BlockServiceId(1)).is_none());
    }
}
