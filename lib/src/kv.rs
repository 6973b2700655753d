//! The external KV backend interface (§2, §6): an ordered byte-keyed
//! key/value store with range scans and atomic batch writes, plus the
//! byte-exact key layout every [`crate::tree::Tree`] uses on top of it.
//!
//! The core is backend-agnostic — [`KvBackend`] is the seam a real
//! embedded-KV crate (sled, RocksDB, etc.) would be plugged in behind. A
//! [`MemoryKv`] reference implementation is provided for tests and for
//! callers that don't need durability.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::Mutex;

use crate::error::{KvError, KvResult};

/// One mutation in an atomic [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum KvOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of mutations applied atomically by [`KvBackend::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<KvOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(KvOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(KvOp::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }
}

/// A half-open `[start, end)` byte-key range, as consumed by
/// [`KvBackend::scan`]. `end = None` means unbounded above.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub reverse: bool,
}

impl KeyRange {
    /// All keys sharing `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: Bound::Included(prefix.to_vec()),
            end: Bound::Excluded(prefix_upper_bound(prefix)),
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_start(mut self, start: Bound<Vec<u8>>) -> Self {
        self.start = start;
        self
    }

    pub fn with_end(mut self, end: Bound<Vec<u8>>) -> Self {
        self.end = end;
        self
    }
}

/// The lexicographically smallest key that is *not* prefixed by `prefix`,
/// used as the exclusive upper bound of a prefix scan.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] != 0xff {
            upper[i] += 1;
            upper.truncate(i + 1);
            return upper;
        }
    }
    // prefix is all 0xff bytes (or empty): no finite upper bound exists, so
    // the caller gets an unbounded scan instead.
    upper.clear();
    upper
}

/// Ordered byte-keyed key/value store with range scans and atomic batch
/// writes (§2). Implementations are expected to be cheaply cloneable
/// handles (e.g. an `Arc` around the real connection).
pub trait KvBackend: Send + Sync + Debug {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    /// Returns matching `(key, value)` pairs in key order (or reverse order
    /// if `range.reverse`).
    fn scan(&self, range: &KeyRange) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies every operation in `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> KvResult<()>;
}

/// In-memory [`KvBackend`] backed by a `BTreeMap`, for tests and
/// non-durable callers.
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn scan(&self, range: &KeyRange) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.lock().unwrap();
        let mut out: Vec<_> = data
            .range((range.start.clone(), range.end.clone()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if range.reverse {
            out.reverse();
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> KvResult<()> {
        let mut data = self.data.lock().unwrap();
        for op in batch.ops() {
            match op {
                KvOp::Put(k, v) => {
                    data.insert(k.clone(), v.clone());
                }
                KvOp::Delete(k) => {
                    data.remove(k);
                }
            }
        }
        Ok(())
    }
}

/// Byte-exact key layout of §6. Each key is additionally prefixed, outside
/// this module, by the tree's UTF-8 name followed by `0x00` (see
/// [`crate::tree::Tree::key`]).
pub mod layout {
    const PRIMARY: u8 = 0x01;
    const INSERTION: u8 = 0x02;
    const VERSION: u8 = 0x03;
    const HEAD: u8 = 0x04;
    const CURSOR: u8 = 0x05;

    /// `0x01 | id | 0x00 | big-endian u64 i`
    pub fn primary_key(id: &[u8], i: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len() + 1 + 8);
        key.push(PRIMARY);
        key.extend_from_slice(id);
        key.push(0x00);
        key.extend_from_slice(&i.to_be_bytes());
        key
    }

    /// `0x02 | big-endian u64 i`
    pub fn insertion_key(i: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + 8);
        key.push(INSERTION);
        key.extend_from_slice(&i.to_be_bytes());
        key
    }

    /// `0x03 | v`
    pub fn version_key(v: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + v.len());
        key.push(VERSION);
        key.extend_from_slice(v);
        key
    }

    /// `0x04 | id | 0x00 | v`
    pub fn head_key(id: &[u8], v: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len() + 1 + v.len());
        key.push(HEAD);
        key.extend_from_slice(id);
        key.push(0x00);
        key.extend_from_slice(v);
        key
    }

    /// Prefix of every head-index entry for `id`: `0x04 | id | 0x00`.
    pub fn head_prefix(id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len() + 1);
        key.push(HEAD);
        key.extend_from_slice(id);
        key.push(0x00);
        key
    }

    /// Prefix of every primary-data entry for `id`: `0x01 | id | 0x00`.
    pub fn primary_prefix(id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len() + 1);
        key.push(PRIMARY);
        key.extend_from_slice(id);
        key.push(0x00);
        key
    }

    pub const INSERTION_PREFIX_BYTE: u8 = INSERTION;

    /// The merger's persisted high-water mark for a remote tree: `i` of the
    /// last remote record whose merge the consumer has acknowledged. A
    /// single key per (tree-namespaced) remote, not part of the DAG data
    /// model itself.
    pub fn cursor_key() -> Vec<u8> {
        vec![CURSOR]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_kv_scan_respects_bounds_and_order() {
        let kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        for i in 0..5u8 {
            batch.put(vec![i], vec![i]);
        }
        kv.write_batch(batch).unwrap();

        let range = KeyRange::prefix(&[]).with_start(Bound::Included(vec![1]));
        let got = kv.scan(&range).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].0, vec![1]);
    }

    #[test]
    fn atomic_batch_applies_all_ops() {
        let kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        kv.write_batch(batch).unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn prefix_upper_bound_increments_last_non_ff_byte() {
        assert_eq!(prefix_upper_bound(&[0x01, 0x02]), vec![0x01, 0x03]);
        assert_eq!(prefix_upper_bound(&[0x01, 0xff]), vec![0x02]);
    }
}
