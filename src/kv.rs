//! Embedded ordered key-value engine.
//!
//! The shard treats its store as an external collaborator: seven column
//! families, point gets, bounded ordered iteration with forward and
//! backward seeks, snapshot reads, and atomic write batches with a
//! savepoint. This module provides that interface over in-memory B-trees.
//! Committed state is an array of `Arc`-shared maps; a snapshot is a cheap
//! clone of the array, and commits copy-on-write only the families a batch
//! touched, so readers are never blocked and never see partial batches.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

/// Column families, in the order they are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Family {
    Metadata = 0,
    Files = 1,
    Spans = 2,
    TransientFiles = 3,
    Directories = 4,
    Edges = 5,
    BlockServicesToFiles = 6,
}

pub const FAMILY_COUNT: usize = 7;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;
type Families = [Arc<Map>; FAMILY_COUNT];

#[derive(Debug)]
enum BatchOp {
    Put { family: Family, key: Vec<u8>, value: Vec<u8> },
    Delete { family: Family, key: Vec<u8> },
    /// Additive signed merge; the stored value is a little-endian i64.
    Merge { family: Family, key: Vec<u8>, delta: i64 },
}

/// An ordered list of mutations applied atomically. A single savepoint can
/// be set and rolled back to, which truncates every op recorded after it.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    savepoint: Option<usize>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, family: Family, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { family, key, value });
    }

    pub fn delete(&mut self, family: Family, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { family, key });
    }

    pub fn merge_add(&mut self, family: Family, key: Vec<u8>, delta: i64) {
        self.ops.push(BatchOp::Merge { family, key, delta });
    }

    pub fn set_savepoint(&mut self) {
        self.savepoint = Some(self.ops.len());
    }

    pub fn rollback_to_savepoint(&mut self) {
        let at = self.savepoint.expect("rollback without savepoint");
        self.ops.truncate(at);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The engine. Cloning is shallow; all clones share the same state.
#[derive(Clone, Default, Debug)]
pub struct MemKv {
    families: Arc<RwLock<Families>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point read of the committed state.
    pub fn get(&self, family: Family, key: &[u8]) -> Option<Vec<u8>> {
        self.families.read()[family as usize].get(key).cloned()
    }

    /// Iterator over the committed state of one family. The iterator holds
    /// its own reference; later commits do not move it.
    pub fn iter(&self, family: Family, bounds: IterBounds) -> KvIter {
        KvIter::new(self.families.read()[family as usize].clone(), bounds)
    }

    /// Frozen view of all families.
    pub fn snapshot(&self) -> KvSnapshot {
        KvSnapshot { families: self.families.read().clone() }
    }

    /// Applies a batch atomically. Only the families the batch touches are
    /// copied.
    pub fn write(&self, batch: WriteBatch) {
        let mut families = self.families.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { family, key, value } => {
                    Arc::make_mut(&mut families[family as usize]).insert(key, value);
                }
                BatchOp::Delete { family, key } => {
                    Arc::make_mut(&mut families[family as usize]).remove(&key);
                }
                BatchOp::Merge { family, key, delta } => {
                    let map = Arc::make_mut(&mut families[family as usize]);
                    let current = map.get(&key).map_or(0, |v| {
                        i64::from_le_bytes(v.as_slice().try_into().expect("merge value is not 8 bytes"))
                    });
                    map.insert(key, (current + delta).to_le_bytes().to_vec());
                }
            }
        }
    }
}

/// Frozen, immutable view of the store.
#[derive(Clone, Debug)]
pub struct KvSnapshot {
    families: Families,
}

impl KvSnapshot {
    pub fn get(&self, family: Family, key: &[u8]) -> Option<&[u8]> {
        self.families[family as usize].get(key).map(|v| v.as_slice())
    }

    pub fn iter(&self, family: Family, bounds: IterBounds) -> KvIter {
        KvIter::new(self.families[family as usize].clone(), bounds)
    }
}

/// Iteration bounds: `lower` inclusive, `upper` exclusive. Seeks and steps
/// never leave the bounded range.
#[derive(Debug, Default, Clone)]
pub struct IterBounds {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
}

impl IterBounds {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn upper(upper: Vec<u8>) -> Self {
        IterBounds { lower: None, upper: Some(upper) }
    }

    pub fn lower(lower: Vec<u8>) -> Self {
        IterBounds { lower: Some(lower), upper: None }
    }

    pub fn both(lower: Vec<u8>, upper: Vec<u8>) -> Self {
        IterBounds { lower: Some(lower), upper: Some(upper) }
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.lower.as_deref().map_or(true, |l| key >= l)
            && self.upper.as_deref().map_or(true, |u| key < u)
    }
}

/// A positioned cursor over one family.
pub struct KvIter {
    map: Arc<Map>,
    bounds: IterBounds,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl KvIter {
    fn new(map: Arc<Map>, bounds: IterBounds) -> Self {
        KvIter { map, bounds, current: None }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("key() on invalid iterator").0
    }

    pub fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("value() on invalid iterator").1
    }

    fn settle(&mut self, found: Option<(Vec<u8>, Vec<u8>)>) {
        self.current = found.filter(|(k, _)| self.bounds.contains(k));
    }

    /// Position at the first key `>= target` within bounds.
    pub fn seek(&mut self, target: &[u8]) {
        let start = match self.bounds.lower.as_deref() {
            Some(l) if l > target => l,
            _ => target,
        };
        let found = self
            .map
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(found);
    }

    /// Position at the last key `<= target` within bounds.
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        let end: Bound<&[u8]> = match self.bounds.upper.as_deref() {
            Some(u) if u <= target => Bound::Excluded(u),
            _ => Bound::Included(target),
        };
        let found = self
            .map
            .range::<[u8], _>((Bound::Unbounded, end))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(found);
    }

    /// Step forward; invalidates at the upper bound or the end of the map.
    pub fn next(&mut self) {
        let Some((key, _)) = self.current.take() else { return };
        let found = self
            .map
            .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(found);
    }

    /// Step backward; invalidates at the lower bound or the start of the map.
    pub fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else { return };
        let found = self
            .map
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_slice())))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv_with(entries: &[(&[u8], &[u8])]) -> MemKv {
        let kv = MemKv::new();
        let mut batch = WriteBatch::new();
        for (k, v) in entries {
            batch.put(Family::Edges, k.to_vec(), v.to_vec());
        }
        kv.write(batch);
        kv
    }

    #[test]
    fn snapshot_isolation() {
        let kv = kv_with(&[(b"a", b"1")]);
        let snap = kv.snapshot();
        let mut batch = WriteBatch::new();
        batch.put(Family::Edges, b"a".to_vec(), b"2".to_vec());
        batch.put(Family::Edges, b"b".to_vec(), b"3".to_vec());
        kv.write(batch);
        assert_eq!(snap.get(Family::Edges, b"a"), Some(b"1".as_slice()));
        assert_eq!(snap.get(Family::Edges, b"b"), None);
        assert_eq!(kv.get(Family::Edges, b"a"), Some(b"2".to_vec()));
    }

    #[test]
    fn savepoint_rollback_keeps_prefix() {
        let kv = MemKv::new();
        let mut batch = WriteBatch::new();
        batch.put(Family::Metadata, b"keep".to_vec(), b"x".to_vec());
        batch.set_savepoint();
        batch.put(Family::Metadata, b"drop".to_vec(), b"y".to_vec());
        batch.delete(Family::Metadata, b"keep".to_vec());
        batch.rollback_to_savepoint();
        kv.write(batch);
        assert_eq!(kv.get(Family::Metadata, b"keep"), Some(b"x".to_vec()));
        assert_eq!(kv.get(Family::Metadata, b"drop"), None);
    }

    #[test]
    fn merge_accumulates_without_read_modify_write() {
        let kv = MemKv::new();
        let mut batch = WriteBatch::new();
        batch.merge_add(Family::BlockServicesToFiles, b"k".to_vec(), 3);
        batch.merge_add(Family::BlockServicesToFiles, b"k".to_vec(), -1);
        kv.write(batch);
        let mut batch = WriteBatch::new();
        batch.merge_add(Family::BlockServicesToFiles, b"k".to_vec(), -2);
        kv.write(batch);
        let raw = kv.get(Family::BlockServicesToFiles, b"k").unwrap();
        assert_eq!(i64::from_le_bytes(raw.try_into().unwrap()), 0);
    }

    #[test]
    fn seek_and_step() {
        let kv = kv_with(&[(b"b", b"1"), (b"d", b"2"), (b"f", b"3")]);
        let mut it = kv.iter(Family::Edges, IterBounds::none());
        it.seek(b"c");
        assert!(it.valid());
        assert_eq!(it.key(), b"d");
        it.next();
        assert_eq!(it.key(), b"f");
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn seek_for_prev_lands_at_or_before() {
        let kv = kv_with(&[(b"b", b"1"), (b"d", b"2"), (b"f", b"3")]);
        let mut it = kv.iter(Family::Edges, IterBounds::none());
        it.seek_for_prev(b"e");
        assert_eq!(it.key(), b"d");
        it.seek_for_prev(b"d");
        assert_eq!(it.key(), b"d");
        it.prev();
        assert_eq!(it.key(), b"b");
        it.prev();
        assert!(!it.valid());
        it.seek_for_prev(b"a");
        assert!(!it.valid());
    }

    #[test]
    fn bounds_clip_iteration() {
        let kv = kv_with(&[(b"a", b"1"), (b"c", b"2"), (b"e", b"3"), (b"g", b"4")]);
        let mut it = kv.iter(Family::Edges, IterBounds::both(b"c".to_vec(), b"g".to_vec()));
        it.seek(b"a");
        assert_eq!(it.key(), b"c");
        it.next();
        assert_eq!(it.key(), b"e");
        it.next();
        assert!(!it.valid());
        it.seek_for_prev(b"zzz");
        assert_eq!(it.key(), b"e");
    }
}
