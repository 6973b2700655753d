//! [`Tree`]: one append-only DAG of versioned records (§3, §4.1).
//!
//! Per the design notes (§9), a `Tree` owns a single write task that
//! serializes every append; reads run directly against the backend and
//! always see a consistent batch boundary because every mutation commits as
//! one atomic [`crate::kv::WriteBatch`].

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::error::{KvError, TreeError, TreeResult};
use crate::ids::{Id, InsertionCounter, PerspectiveName, Version};
use crate::kv::{layout, KeyRange, KvBackend, WriteBatch};
use crate::record::Record;
use crate::stream_tree::{ReadOptions, StreamTree};

/// Which provenance a [`Tree`] holds records for. Only affects how an
/// unresolvable `pa` entry is classified (§7: fatal `InvalidHeader` for a
/// local tree, per-record `UnknownParent` for a remote tree).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeKind {
    Local,
    Remote(PerspectiveName),
}

enum WriteOp {
    Append { record: Record, extra_known_parents: HashSet<Version> },
    /// Removes a version from this tree's indices entirely. Used to clear a
    /// candidate record out of a stage tree once it has been promoted
    /// elsewhere.
    Discard { v: Version },
}

enum WriteOutcome {
    Appended(Record),
    Discarded,
}

struct WriteRequest {
    op: WriteOp,
    resp: oneshot::Sender<TreeResult<WriteOutcome>>,
}

/// One append-only DAG of versioned records, keyed by `(id, v)` (§3).
#[derive(Clone)]
pub struct Tree {
    name: Arc<str>,
    backend: Arc<dyn KvBackend>,
    kind: TreeKind,
    /// Every version in this tree, including every `pa` entry, must be
    /// exactly this many bytes (§3's `vSize`, the Open Question resolution
    /// in `SPEC_FULL.md` §C.1).
    v_size: usize,
    write_tx: mpsc::Sender<WriteRequest>,
    // Cached for `lastReceivedFromRemote`/tests; the write task owns the
    // authoritative value and keeps this mirror up to date after each
    // successful append.
    last_i: Arc<AtomicU64>,
}

impl Tree {
    /// Opens (or creates) a tree named `name` over `backend`. Scans the
    /// insertion index once to recover the last-assigned `i`. `v_size` is
    /// the fixed version width this tree enforces on every append.
    pub fn open(
        name: impl Into<String>,
        backend: Arc<dyn KvBackend>,
        kind: TreeKind,
        v_size: usize,
    ) -> TreeResult<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let last_i = recover_last_i(backend.as_ref(), &name)?;
        let last_i = Arc::new(AtomicU64::new(last_i));
        let (write_tx, write_rx) = mpsc::channel(64);

        tokio::spawn(run_write_task(
            write_rx,
            backend.clone(),
            name.clone(),
            kind.clone(),
            v_size,
            last_i.clone(),
        ));

        Ok(Self { name, backend, kind, v_size, write_tx, last_i })
    }

    pub fn v_size(&self) -> usize {
        self.v_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TreeKind {
        &self.kind
    }

    /// This tree's name-prefixed form of a raw (unprefixed) backend key.
    /// Exposed to `merge_tree` so the merger can persist its per-remote
    /// cursor mark in the same namespace as this tree's own index entries.
    pub(crate) fn raw_key(&self, raw: Vec<u8>) -> Vec<u8> {
        self.key(raw)
    }

    pub(crate) fn backend_ref(&self) -> &dyn KvBackend {
        self.backend.as_ref()
    }

    fn key(&self, raw: Vec<u8>) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.name.len() + 1 + raw.len());
        key.extend_from_slice(self.name.as_bytes());
        key.push(0x00);
        key.extend_from_slice(&raw);
        key
    }

    /// Appends `record` to this tree. Assigns `i`, validates the header,
    /// and commits one atomic batch (§4.1). A `v` that already exists is
    /// reported as [`TreeError::DuplicateVersion`] — the caller treats that
    /// as a no-op, not a failure.
    #[instrument(skip(self, record), fields(tree = %self.name))]
    pub async fn append(&self, record: Record) -> TreeResult<Record> {
        self.append_inner(record, HashSet::new()).await
    }

    /// As [`Self::append`], but `extra_known_parents` are treated as
    /// resolved for the parent-existence check even though they are not
    /// present in this tree's own version index. Used by the merge engine
    /// when writing a merged record whose `pa` cites a remote tree's
    /// version.
    pub async fn append_with_known_parents(
        &self,
        record: Record,
        extra_known_parents: HashSet<Version>,
    ) -> TreeResult<Record> {
        self.append_inner(record, extra_known_parents).await
    }

    async fn append_inner(
        &self,
        record: Record,
        extra_known_parents: HashSet<Version>,
    ) -> TreeResult<Record> {
        match self.submit(WriteOp::Append { record, extra_known_parents }).await? {
            WriteOutcome::Appended(record) => Ok(record),
            WriteOutcome::Discarded => unreachable!("Append always resolves to Appended"),
        }
    }

    /// Removes `v` from this tree's indices. A no-op if `v` isn't present.
    /// Used by the merger to clear a candidate out of the stage tree once
    /// it has been promoted into the local tree.
    pub async fn discard(&self, v: &Version) -> TreeResult<()> {
        match self.submit(WriteOp::Discard { v: v.clone() }).await? {
            WriteOutcome::Discarded => Ok(()),
            WriteOutcome::Appended(_) => unreachable!("Discard always resolves to Discarded"),
        }
    }

    async fn submit(&self, op: WriteOp) -> TreeResult<WriteOutcome> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { op, resp: resp_tx })
            .await
            .map_err(|_| TreeError::Backend(KvError::other(WriteTaskGone)))?;
        resp_rx.await.map_err(|_| TreeError::Backend(KvError::other(WriteTaskGone)))?
    }

    /// O(1)-ish lookup (version index, then insertion index, then primary
    /// key) of a record by its version.
    pub fn get_by_version(&self, v: &Version) -> TreeResult<Option<Record>> {
        let Some(i) = self.resolve_i(v)? else { return Ok(None) };
        self.get_by_i(i)
    }

    fn resolve_i(&self, v: &Version) -> TreeResult<Option<InsertionCounter>> {
        let key = self.key(layout::version_key(v.as_bytes()));
        match self.backend.get(&key)? {
            Some(bytes) => Ok(Some(u64::from_be_bytes(bytes.as_slice().try_into().map_err(
                |_| TreeError::Backend(KvError::other(CorruptIndex("version index"))),
            )?))),
            None => Ok(None),
        }
    }

    fn get_by_i(&self, i: InsertionCounter) -> TreeResult<Option<Record>> {
        let ikey = self.key(layout::insertion_key(i));
        let Some(idval) = self.backend.get(&ikey)? else { return Ok(None) };
        if idval.len() < 9 {
            return Err(TreeError::Backend(KvError::other(CorruptIndex("insertion index"))));
        }
        let id_bytes = &idval[..idval.len() - 8];
        let id_bytes = &id_bytes[..id_bytes.len() - 1]; // drop the 0x00 separator
        let pkey = self.key(layout::primary_key(id_bytes, i));
        let Some(record_bytes) = self.backend.get(&pkey)? else { return Ok(None) };
        let record = Record::decode(&record_bytes)
            .map_err(|e| TreeError::Backend(KvError::other(e)))?;
        Ok(Some(record))
    }

    /// Current heads of `id` in this tree: versions cited by no other
    /// version's `pa` within this tree (§3 invariant 4).
    pub fn heads_of(&self, id: &Id) -> TreeResult<Vec<Version>> {
        let range = KeyRange::prefix(&layout::head_prefix(id.as_bytes()));
        let entries = self.backend.scan(&range)?;
        let prefix_len = layout::head_prefix(id.as_bytes()).len();
        Ok(entries
            .into_iter()
            .filter_map(|(k, _)| Version::new(k[prefix_len..].to_vec()))
            .collect())
    }

    pub fn parents(&self, v: &Version) -> TreeResult<Vec<Version>> {
        Ok(self
            .get_by_version(v)?
            .map(|r| r.header.pa)
            .unwrap_or_default())
    }

    /// Breadth-first walk over `pa`, excluding `v` itself. `stop` prunes the
    /// walk past any version it returns `true` for (that version is still
    /// included in the result).
    pub fn ancestors(&self, v: &Version, stop: &dyn Fn(&Version) -> bool) -> TreeResult<HashSet<Version>> {
        let mut visited = HashSet::new();
        let mut frontier: VecDeque<Version> = self.parents(v)?.into_iter().collect();
        while let Some(cur) = frontier.pop_front() {
            if !visited.insert(cur.clone()) {
                continue;
            }
            if stop(&cur) {
                continue;
            }
            for p in self.parents(&cur)? {
                frontier.push_back(p);
            }
        }
        Ok(visited)
    }

    fn ancestors_inclusive(&self, v: &Version) -> TreeResult<HashSet<Version>> {
        let mut set = self.ancestors(v, &|_| false)?;
        set.insert(v.clone());
        Ok(set)
    }

    /// Lowest common ancestor set between `v1` and `v2` (§4.1). Multiple
    /// elements are returned for criss-cross histories.
    pub fn lca(&self, v1: &Version, v2: &Version) -> TreeResult<Vec<Version>> {
        if v1 == v2 {
            return Ok(vec![v1.clone()]);
        }
        let anc1 = self.ancestors_inclusive(v1)?;
        let anc2 = self.ancestors_inclusive(v2)?;
        let common: Vec<Version> = anc1.intersection(&anc2).cloned().collect();
        if common.is_empty() {
            return Ok(vec![]);
        }

        let mut result = Vec::new();
        for candidate in &common {
            let mut dominated = false;
            for other in &common {
                if other == candidate {
                    continue;
                }
                // `candidate` is dominated if it is a proper ancestor of
                // some other common ancestor — then it isn't "lowest".
                if self.ancestors(other, &|x| x == candidate)?.contains(candidate) {
                    dominated = true;
                    break;
                }
            }
            if !dominated {
                result.push(candidate.clone());
            }
        }
        Ok(result)
    }

    /// A [`StreamTree`] reader over this tree in insertion order (§4.2).
    pub fn read_stream(&self, opts: ReadOptions) -> StreamTree {
        StreamTree::new(self.backend.clone(), self.name.clone(), opts)
    }

    /// The `v` of the highest-`i` record in this tree, used as a resume
    /// token for the transport layer (`lastReceivedFromRemote`).
    pub fn last_version(&self) -> TreeResult<Option<Version>> {
        let i = self.last_i.load(Ordering::SeqCst);
        if i == 0 {
            return Ok(None);
        }
        Ok(self.get_by_i(i)?.map(|r| r.header.v))
    }

    pub fn last_i(&self) -> InsertionCounter {
        self.last_i.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("tree write task is no longer running")]
struct WriteTaskGone;

#[derive(Debug, thiserror::Error)]
#[error("corrupt {0}")]
struct CorruptIndex(&'static str);

fn recover_last_i(backend: &dyn KvBackend, name: &str) -> TreeResult<InsertionCounter> {
    let mut prefix = name.as_bytes().to_vec();
    prefix.push(0x00);
    prefix.push(layout::INSERTION_PREFIX_BYTE);
    let range = KeyRange::prefix(&prefix).reversed();
    let entries = backend.scan(&range)?;
    match entries.first() {
        Some((key, _)) => {
            let i_bytes = &key[key.len() - 8..];
            Ok(u64::from_be_bytes(i_bytes.try_into().unwrap()))
        }
        None => Ok(0),
    }
}

async fn run_write_task(
    mut rx: mpsc::Receiver<WriteRequest>,
    backend: Arc<dyn KvBackend>,
    name: Arc<str>,
    kind: TreeKind,
    v_size: usize,
    last_i: Arc<AtomicU64>,
) {
    while let Some(WriteRequest { op, resp }) = rx.recv().await {
        let result = match op {
            WriteOp::Append { record, extra_known_parents } => do_append(
                backend.as_ref(),
                &name,
                &kind,
                v_size,
                &last_i,
                record,
                &extra_known_parents,
            )
            .map(WriteOutcome::Appended),
            WriteOp::Discard { v } => {
                do_discard(backend.as_ref(), &name, &v).map(|()| WriteOutcome::Discarded)
            }
        };
        if let Err(err) = &result {
            debug!(tree = %name, error = %err, "write rejected");
        }
        let _ = resp.send(result);
    }
}

fn do_append(
    backend: &dyn KvBackend,
    name: &str,
    kind: &TreeKind,
    v_size: usize,
    last_i: &AtomicU64,
    mut record: Record,
    extra_known_parents: &HashSet<Version>,
) -> TreeResult<Record> {
    record.header.validate()?;
    if record.header.v.len() != v_size {
        return Err(TreeError::InvalidHeader(format!(
            "version must be exactly {v_size} bytes, got {}",
            record.header.v.len()
        )));
    }
    for parent in &record.header.pa {
        if parent.len() != v_size {
            return Err(TreeError::InvalidHeader(format!(
                "parent version must be exactly {v_size} bytes, got {}",
                parent.len()
            )));
        }
    }

    let key_of = |raw: Vec<u8>| -> Vec<u8> {
        let mut key = Vec::with_capacity(name.len() + 1 + raw.len());
        key.extend_from_slice(name.as_bytes());
        key.push(0x00);
        key.extend_from_slice(&raw);
        key
    };

    let vkey = key_of(layout::version_key(record.header.v.as_bytes()));
    if backend.get(&vkey)?.is_some() {
        return Err(TreeError::DuplicateVersion(record.header.v.clone()));
    }

    for parent in &record.header.pa {
        if extra_known_parents.contains(parent) {
            continue;
        }
        let pkey = key_of(layout::version_key(parent.as_bytes()));
        if backend.get(&pkey)?.is_none() {
            return match kind {
                TreeKind::Local => Err(TreeError::InvalidHeader(format!(
                    "parent {parent:?} not found in local tree"
                ))),
                TreeKind::Remote(_) => Err(TreeError::UnknownParent(parent.clone())),
            };
        }
    }

    let i = last_i.load(Ordering::SeqCst) + 1;
    record.header.i = Some(i);

    let mut batch = WriteBatch::new();
    batch.put(
        key_of(layout::primary_key(record.header.id.as_bytes(), i)),
        record.encode(),
    );
    let mut insertion_value = record.header.id.as_bytes().to_vec();
    insertion_value.push(0x00);
    insertion_value.extend_from_slice(&i.to_be_bytes());
    batch.put(key_of(layout::insertion_key(i)), insertion_value);
    batch.put(
        key_of(layout::version_key(record.header.v.as_bytes())),
        i.to_be_bytes().to_vec(),
    );
    for parent in &record.header.pa {
        batch.delete(key_of(layout::head_key(record.header.id.as_bytes(), parent.as_bytes())));
    }
    batch.put(
        key_of(layout::head_key(record.header.id.as_bytes(), record.header.v.as_bytes())),
        i.to_be_bytes().to_vec(),
    );

    backend.write_batch(batch)?;
    last_i.store(i, Ordering::SeqCst);
    warn_if_wide_merge(&record);
    Ok(record)
}

fn do_discard(backend: &dyn KvBackend, name: &str, v: &Version) -> TreeResult<()> {
    let key_of = |raw: Vec<u8>| -> Vec<u8> {
        let mut key = Vec::with_capacity(name.len() + 1 + raw.len());
        key.extend_from_slice(name.as_bytes());
        key.push(0x00);
        key.extend_from_slice(&raw);
        key
    };

    let vkey = key_of(layout::version_key(v.as_bytes()));
    let Some(i_bytes) = backend.get(&vkey)? else { return Ok(()) };
    let i = u64::from_be_bytes(
        i_bytes
            .as_slice()
            .try_into()
            .map_err(|_| TreeError::Backend(KvError::other(CorruptIndex("version index"))))?,
    );

    let ikey = key_of(layout::insertion_key(i));
    let Some(idval) = backend.get(&ikey)? else { return Ok(()) };
    if idval.len() < 9 {
        return Err(TreeError::Backend(KvError::other(CorruptIndex("insertion index"))));
    }
    let id_bytes = &idval[..idval.len() - 9];

    let mut batch = WriteBatch::new();
    batch.delete(vkey);
    batch.delete(ikey);
    batch.delete(key_of(layout::primary_key(id_bytes, i)));
    batch.delete(key_of(layout::head_key(id_bytes, v.as_bytes())));
    backend.write_batch(batch)?;
    Ok(())
}

fn warn_if_wide_merge(record: &Record) {
    if record.header.pa.len() > 2 {
        warn!(
            parents = record.header.pa.len(),
            "record has more than 2 parents; the merge engine only supports ≤2"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::header::Header;
    use crate::kv::MemoryKv;

    fn id(key: &str) -> Id {
        Id::compose("items", key.as_bytes()).unwrap()
    }

    fn v(b: u8) -> Version {
        Version::new(vec![b; 6]).unwrap()
    }

    async fn open_tree() -> Tree {
        Tree::open("local", Arc::new(MemoryKv::new()), TreeKind::Local, 6).unwrap()
    }

    #[tokio::test]
    async fn append_assigns_dense_monotonic_i() {
        let tree = open_tree().await;
        let r1 = tree
            .append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let r2 = tree
            .append(Record::new(Header::new(id("x"), v(2), vec![v(1)]), Document::new()))
            .await
            .unwrap();
        assert_eq!(r1.header.i, Some(1));
        assert_eq!(r2.header.i, Some(2));
    }

    #[tokio::test]
    async fn duplicate_version_is_reported_not_panicking() {
        let tree = open_tree().await;
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let err = tree
            .append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::DuplicateVersion(_)));
    }

    #[tokio::test]
    async fn heads_reflect_current_frontier() {
        let tree = open_tree().await;
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        assert_eq!(tree.heads_of(&id("x")).unwrap(), vec![v(1)]);
        tree.append(Record::new(Header::new(id("x"), v(2), vec![v(1)]), Document::new()))
            .await
            .unwrap();
        assert_eq!(tree.heads_of(&id("x")).unwrap(), vec![v(2)]);
    }

    #[tokio::test]
    async fn local_tree_rejects_unknown_parent_as_invalid_header() {
        let tree = open_tree().await;
        let err = tree
            .append(Record::new(Header::new(id("x"), v(2), vec![v(99)]), Document::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn remote_tree_reports_unknown_parent_distinctly() {
        let tree = Tree::open(
            "remote-a",
            Arc::new(MemoryKv::new()),
            TreeKind::Remote(PerspectiveName::new("a")),
            6,
        )
        .unwrap();
        let err = tree
            .append(Record::new(Header::new(id("x"), v(2), vec![v(99)]), Document::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::UnknownParent(_)));
    }

    #[tokio::test]
    async fn lca_of_linear_history_is_the_common_ancestor() {
        let tree = open_tree().await;
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(2), vec![v(1)]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(3), vec![v(1)]), Document::new()))
            .await
            .unwrap();
        assert_eq!(tree.lca(&v(2), &v(3)).unwrap(), vec![v(1)]);
    }

    #[tokio::test]
    async fn lca_of_disjoint_histories_is_empty() {
        let tree = open_tree().await;
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("y"), v(2), vec![]), Document::new()))
            .await
            .unwrap();
        assert_eq!(tree.lca(&v(1), &v(2)).unwrap(), vec![]);
    }

    #[tokio::test]
    async fn lca_handles_criss_cross_history() {
        let tree = open_tree().await;
        // A, B -> two roots that both merge into C and D (criss-cross).
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(2), vec![]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(3), vec![v(1), v(2)]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(4), vec![v(1), v(2)]), Document::new()))
            .await
            .unwrap();
        let mut lcas = tree.lca(&v(3), &v(4)).unwrap();
        lcas.sort();
        let mut expected = vec![v(1), v(2)];
        expected.sort();
        assert_eq!(lcas, expected);
    }

    #[tokio::test]
    async fn append_rejects_a_version_of_the_wrong_width() {
        let tree = open_tree().await;
        let short = Version::new(vec![1; 3]).unwrap();
        let err = tree
            .append(Record::new(Header::new(id("x"), short, vec![]), Document::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn append_rejects_a_parent_of_the_wrong_width() {
        let tree = open_tree().await;
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let bad_parent = Version::new(vec![1; 3]).unwrap();
        let err = tree
            .append(Record::new(Header::new(id("x"), v(2), vec![bad_parent]), Document::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn discard_removes_a_version_from_every_index() {
        let tree = open_tree().await;
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        tree.discard(&v(1)).await.unwrap();
        assert_eq!(tree.get_by_version(&v(1)).unwrap(), None);
        assert_eq!(tree.heads_of(&id("x")).unwrap(), vec![]);
    }

    #[tokio::test]
    async fn discard_of_an_absent_version_is_a_no_op() {
        let tree = open_tree().await;
        tree.discard(&v(9)).await.unwrap();
    }
}
