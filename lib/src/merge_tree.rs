//! [`MergeTree`]: one local [`Tree`], one [`Tree`] per remote perspective,
//! and the background merger that keeps them converging (§4.4).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};
use itertools::Itertools as _;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::MergeTreeConfig;
use crate::conflict::ConflictSink;
use crate::document::Document;
use crate::error::{KvError, MergeTreeError, MergeTreeResult, TreeError};
use crate::header::Header;
use crate::ids::{Id, PerspectiveName, Version};
use crate::kv::{layout, KeyRange, KvBackend, WriteBatch};
use crate::merge_engine::{self, CombinedAncestry, ConflictCandidate, MergeDecision};
use crate::record::Record;
use crate::stream_tree::{ReadOptions, StreamTree, Transform};
use crate::tree::{Tree, TreeKind};

/// One item on the merger's output stream (§6 "Output envelope"). Holding
/// it unacked keeps the emitting remote's cursor from advancing past the
/// record it describes — dropping it without calling [`Self::ack`] is
/// equivalent to the consumer never acknowledging, so the merger will
/// re-offer the same record after a restart.
pub struct MergeOutput {
    pub n: Version,
    pub l: Option<Version>,
    pub lcas: Vec<Version>,
    pub pe: PerspectiveName,
    pub c: Option<Vec<String>>,
    pub err: Option<String>,
    ack_tx: Option<oneshot::Sender<()>>,
}

impl MergeOutput {
    /// Acknowledges this output, letting the emitting remote's merge
    /// cursor advance past the record it describes (§4.4's exactly-once
    /// contract).
    pub fn ack(mut self) {
        if let Some(tx) = self.ack_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A sink accepting locally originated records (§4.4
/// `createLocalWriteStream`): `pe` must be absent.
pub struct LocalWriteStream {
    tree: Tree,
}

impl LocalWriteStream {
    /// Appends `record` to the local tree. A duplicate `v` is silently
    /// dropped, matching the idempotent-write contract.
    pub async fn write(&self, record: Record) -> MergeTreeResult<()> {
        if record.header.pe.is_some() {
            return Err(MergeTreeError::Tree(TreeError::InvalidHeader(
                "locally originated records must not carry `pe`".to_string(),
            )));
        }
        match self.tree.append(record).await {
            Ok(_) => Ok(()),
            Err(TreeError::DuplicateVersion(_)) => Ok(()),
            Err(e) => Err(MergeTreeError::Tree(e)),
        }
    }
}

/// A per-remote sink (§4.4 `createRemoteWriteStream`). Applies `filter`
/// then `hooks` before appending; a record the pipeline drops is still
/// acknowledged to the caller (it advances that remote's high-water mark)
/// but never reaches the tree.
pub struct RemoteWriteStream {
    tree: Tree,
    pe: PerspectiveName,
    filter: Option<Arc<dyn Fn(&Record) -> bool + Send + Sync>>,
    hooks: Vec<Arc<dyn Transform>>,
}

impl RemoteWriteStream {
    pub async fn write(&self, mut record: Record) -> MergeTreeResult<()> {
        record.header.pe = Some(self.pe.clone());

        if let Some(filter) = &self.filter {
            if !filter(&record) {
                return Ok(());
            }
        }
        let mut candidate = Some(record);
        for hook in &self.hooks {
            candidate = match candidate {
                Some(r) => hook.apply(r).await,
                None => None,
            };
        }
        let Some(record) = candidate else { return Ok(()) };

        match self.tree.append(record).await {
            Ok(_) => Ok(()),
            Err(TreeError::DuplicateVersion(_)) => Ok(()),
            Err(e) => Err(MergeTreeError::Tree(e)),
        }
    }
}

/// State of one remote's merge cursor (§4.4's state-machine diagram),
/// exposed for observability; not required for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    Idle,
    Scanning,
    AwaitAck,
    Draining,
    Stopped,
    BackendFault,
}

fn set_status(map: &Mutex<HashMap<PerspectiveName, CursorStatus>>, pe: &PerspectiveName, status: CursorStatus) {
    map.lock().unwrap().insert(pe.clone(), status);
}

/// Owns one local [`Tree`], one [`Tree`] per configured remote
/// perspective, a transient stage [`Tree`] used to buffer a merge
/// candidate before it's promoted into the local tree, and drives the
/// background merger between them.
pub struct MergeTree {
    backend: Arc<dyn KvBackend>,
    local: Tree,
    remotes: HashMap<PerspectiveName, Tree>,
    stage: Tree,
    config: Arc<MergeTreeConfig>,
    conflict_sink: Arc<dyn ConflictSink>,
    cursor_status: Arc<Mutex<HashMap<PerspectiveName, CursorStatus>>>,
    stop_flag: Arc<AtomicBool>,
    merge_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// The output stream of a merger spawned eagerly by `new` because
    /// `config.start_merge` was set. Taken by the first call to
    /// `start_merge`; `None` once taken or if the merger was never
    /// auto-started.
    pending_output: Mutex<Option<BoxStream<'static, MergeTreeResult<MergeOutput>>>>,
}

impl MergeTree {
    #[instrument(skip(backend, conflict_sink, config))]
    pub fn new(
        backend: Arc<dyn KvBackend>,
        config: MergeTreeConfig,
        conflict_sink: Arc<dyn ConflictSink>,
    ) -> MergeTreeResult<Self> {
        let local = Tree::open("local", backend.clone(), TreeKind::Local, config.v_size)?;
        let stage = Tree::open("stage", backend.clone(), TreeKind::Local, config.v_size)?;
        let mut remotes = HashMap::new();
        let mut cursor_status = HashMap::new();
        for pe in &config.perspectives {
            let name = format!("remote-{}", pe.as_str());
            let tree = Tree::open(name, backend.clone(), TreeKind::Remote(pe.clone()), config.v_size)?;
            remotes.insert(pe.clone(), tree);
            cursor_status.insert(pe.clone(), CursorStatus::Idle);
        }
        let start_merge = config.start_merge;
        let mt = Self {
            backend,
            local,
            remotes,
            stage,
            config: Arc::new(config),
            conflict_sink,
            cursor_status: Arc::new(Mutex::new(cursor_status)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            merge_tasks: Mutex::new(Vec::new()),
            pending_output: Mutex::new(None),
        };
        if start_merge {
            let stream = mt.spawn_merge_loops();
            *mt.pending_output.lock().unwrap() = Some(stream);
        }
        Ok(mt)
    }

    pub fn create_local_write_stream(&self) -> LocalWriteStream {
        LocalWriteStream { tree: self.local.clone() }
    }

    pub fn create_remote_write_stream(
        &self,
        pe: &PerspectiveName,
        filter: Option<Arc<dyn Fn(&Record) -> bool + Send + Sync>>,
        hooks: Vec<Arc<dyn Transform>>,
    ) -> MergeTreeResult<RemoteWriteStream> {
        let tree = self
            .remotes
            .get(pe)
            .ok_or_else(|| MergeTreeError::UnknownPerspective(pe.as_str().to_string()))?
            .clone();
        Ok(RemoteWriteStream { tree, pe: pe.clone(), filter, hooks })
    }

    pub fn get_local_tree(&self) -> &Tree {
        &self.local
    }

    pub fn get_remote_tree(&self, pe: &PerspectiveName) -> MergeTreeResult<&Tree> {
        self.remotes
            .get(pe)
            .ok_or_else(|| MergeTreeError::UnknownPerspective(pe.as_str().to_string()))
    }

    /// The unique head of `id` in the local tree, or `None` if `id` has
    /// never been written locally.
    pub fn get_local_head(&self, id: &Id) -> MergeTreeResult<Option<Record>> {
        let heads = self.local.heads_of(id)?;
        match heads.as_slice() {
            [] => Ok(None),
            [v] => Ok(self.local.get_by_version(v)?),
            many => Err(MergeTreeError::Tree(TreeError::MultipleHeads(many.to_vec()))),
        }
    }

    /// The `v` of the highest-`i` record received from `pe`, for use as a
    /// transport-layer resume token.
    pub fn last_received_from_remote(&self, pe: &PerspectiveName) -> MergeTreeResult<Option<Version>> {
        Ok(self.get_remote_tree(pe)?.last_version()?)
    }

    /// A [`StreamTree`] reader over the local tree (§4.2/§4.4
    /// `createReadStream`).
    pub fn create_read_stream(&self, opts: ReadOptions) -> StreamTree {
        self.local.read_stream(opts)
    }

    pub fn cursor_status(&self, pe: &PerspectiveName) -> Option<CursorStatus> {
        self.cursor_status.lock().unwrap().get(pe).copied()
    }

    /// Starts the merger and returns its output stream. Each item must be
    /// acknowledged ([`MergeOutput::ack`]) for its originating remote's
    /// cursor to advance (§4.4's exactly-once contract).
    ///
    /// If `config.start_merge` was set, the merger was already spawned by
    /// [`Self::new`]; the first call here just hands back that stream
    /// instead of spawning a second one.
    pub fn start_merge(&self) -> BoxStream<'static, MergeTreeResult<MergeOutput>> {
        if let Some(stream) = self.pending_output.lock().unwrap().take() {
            return stream;
        }
        self.spawn_merge_loops()
    }

    fn spawn_merge_loops(&self) -> BoxStream<'static, MergeTreeResult<MergeOutput>> {
        self.stop_flag.store(false, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        let mut handles = Vec::new();
        for (pe, remote) in &self.remotes {
            let loop_pe = pe.clone();
            let loop_remote = remote.clone();
            let loop_local = self.local.clone();
            let loop_stage = self.stage.clone();
            let loop_tx = tx.clone();
            let loop_stop = self.stop_flag.clone();
            let loop_status = self.cursor_status.clone();
            let loop_sink = self.conflict_sink.clone();
            let v_size = self.config.v_size;
            handles.push(tokio::spawn(run_remote_merge_loop(
                loop_pe,
                loop_remote,
                loop_local,
                loop_stage,
                loop_tx,
                loop_stop,
                loop_status,
                loop_sink,
                v_size,
            )));
        }
        *self.merge_tasks.lock().unwrap() = handles;
        stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed()
    }

    /// Signals every remote merge loop to quiesce, then waits for the
    /// in-flight merge (if any) on each to finish.
    pub async fn stop_merge(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.merge_tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Resolves a recorded conflict (§4.4 `resolveConflict`): validates that
    /// the local tree hasn't moved past `to_be_resolved` since the conflict
    /// was recorded, then writes `resolved` as a new local record whose `pa`
    /// cites both the current local head and the remote record that
    /// conflicted with it, and finally drops the conflict from the sink.
    pub async fn resolve_conflict(
        &self,
        conflict_id: u64,
        to_be_resolved: &Document,
        resolved: Document,
        del: bool,
    ) -> MergeTreeResult<Record> {
        let conflict = self
            .conflict_sink
            .get(conflict_id)
            .ok_or(MergeTreeError::UnknownConflict(conflict_id))?;
        let remote = self.get_remote_tree(&conflict.pe)?;
        let candidate = remote
            .get_by_version(&conflict.n)?
            .ok_or(MergeTreeError::UnknownConflict(conflict_id))?;
        let id = candidate.header.id.clone();

        let current = self
            .get_local_head(&id)?
            .ok_or(MergeTreeError::StaleConflict(conflict_id))?;
        if &current.body != to_be_resolved {
            return Err(MergeTreeError::StaleConflict(conflict_id));
        }

        let ancestry = CombinedAncestry::new(&self.local, remote);
        let mut rng = OsRng;
        let v = merge_engine::generate_unused_version(&ancestry, &mut rng, self.config.v_size, &id)
            .map_err(MergeTreeError::Tree)?;

        let pa = vec![current.header.v.clone(), conflict.n.clone()];
        let mut header = Header::new(id, v, pa);
        header.d = del;
        let record = Record::new(header, resolved);
        let known_parents = HashSet::from_iter([current.header.v.clone(), conflict.n.clone()]);
        let appended = self
            .local
            .append_with_known_parents(record, known_parents)
            .await
            .map_err(MergeTreeError::Tree)?;

        self.conflict_sink.remove(conflict_id);
        Ok(appended)
    }
}

/// The decision [`merge_one_id`] reached for one id, ready for the merge
/// loop to act on.
enum MergeStep {
    /// `rhead` is already an ancestor of `lhead` (or equal to it): nothing
    /// to write, nothing to emit, just advance the cursor past it.
    NothingToDo,
    /// Write `record` to the local tree (citing `known_parents` as already
    /// verified, even though some may live only in the remote tree), then
    /// emit `output`.
    AdoptOrMerge { record: Record, known_parents: HashSet<Version>, output: MergeOutput },
    /// Hand `candidate` to the conflict sink and emit the resulting
    /// descriptor; no local-tree write.
    Conflict(ConflictCandidate),
}

fn bare_output(
    n: Version,
    l: Option<Version>,
    lcas: Vec<Version>,
    pe: &PerspectiveName,
    c: Option<Vec<String>>,
    err: Option<String>,
) -> MergeOutput {
    MergeOutput { n, l, lcas, pe: pe.clone(), c, err, ack_tx: None }
}

async fn merge_one_id(
    local: &Tree,
    remote: &Tree,
    pe: &PerspectiveName,
    id: &Id,
    v_size: usize,
) -> Result<Option<MergeStep>, TreeError> {
    let remote_heads = remote.heads_of(id)?;
    let Some(rhead_v) = remote_heads.first() else { return Ok(None) };
    let Some(rhead) = remote.get_by_version(rhead_v)? else { return Ok(None) };

    let local_heads = local.heads_of(id)?;
    let lhead = match local_heads.as_slice() {
        [] => None,
        [v] => local.get_by_version(v)?,
        many => return Err(TreeError::MultipleHeads(many.to_vec())),
    };

    let Some(lhead) = lhead else {
        let mut header = rhead.header.clone();
        header.i = None;
        let record = Record { header, body: rhead.body.clone(), metadata: rhead.metadata.clone() };
        let known_parents = HashSet::from_iter(rhead.header.pa.clone());
        let output = bare_output(rhead.header.v.clone(), None, vec![], pe, None, None);
        return Ok(Some(MergeStep::AdoptOrMerge { record, known_parents, output }));
    };

    let ancestry = CombinedAncestry::new(local, remote);
    let mut rng = OsRng;
    let decision = merge_engine::three_way_merge(&ancestry, &lhead, &rhead, pe.clone(), &mut rng, v_size)?;

    Ok(Some(match decision {
        MergeDecision::Drop => MergeStep::NothingToDo,
        MergeDecision::FastForward => {
            let lcas = ancestry.lca(lhead.version(), rhead.version()).unwrap_or_default();
            let mut header = rhead.header.clone();
            header.i = None;
            let record = Record { header, body: rhead.body.clone(), metadata: rhead.metadata.clone() };
            let known_parents = HashSet::from_iter(rhead.header.pa.clone());
            let output = bare_output(rhead.header.v.clone(), Some(lhead.header.v.clone()), lcas, pe, None, None);
            MergeStep::AdoptOrMerge { record, known_parents, output }
        }
        MergeDecision::Merged(record) => {
            let lcas = ancestry.lca(lhead.version(), rhead.version()).unwrap_or_default();
            let known_parents = HashSet::from_iter(record.header.pa.clone());
            let output = bare_output(record.header.v.clone(), Some(lhead.header.v.clone()), lcas, pe, None, None);
            MergeStep::AdoptOrMerge { record, known_parents, output }
        }
        MergeDecision::Conflict(candidate) => MergeStep::Conflict(candidate),
    }))
}

/// Applies one [`MergeStep`], returning the output to emit (if any).
/// Returns `Err` only for a backend-level failure on the local append path
/// (§4.4 failure policy: that alone stops the merger).
///
/// A record to adopt or merge is appended to `stage` first, then to
/// `local`; only once it's safely in `local` is it discarded from `stage`.
/// `stage` is purely a transient buffer — a crash between the two appends
/// leaves the candidate recoverable from `stage`, never lost.
async fn apply_merge_step(
    local: &Tree,
    stage: &Tree,
    conflict_sink: &Arc<dyn ConflictSink>,
    step: MergeStep,
) -> Result<Option<MergeOutput>, TreeError> {
    match step {
        MergeStep::NothingToDo => Ok(None),
        MergeStep::Conflict(candidate) => {
            debug!(n = ?candidate.n, "merge produced a conflict");
            let recorded = conflict_sink.record(candidate);
            Ok(Some(bare_output(
                recorded.n,
                recorded.l,
                recorded.lcas,
                &recorded.pe,
                recorded.c,
                recorded.err,
            )))
        }
        MergeStep::AdoptOrMerge { record, known_parents, output } => {
            match stage.append_with_known_parents(record.clone(), known_parents.clone()).await {
                Ok(_) | Err(TreeError::DuplicateVersion(_)) => {}
                Err(e @ TreeError::Backend(_)) => return Err(e),
                Err(other) => {
                    warn!(error = %other, "stage append rejected during merge; will retry on next scan");
                    return Ok(None);
                }
            }
            match local.append_with_known_parents(record, known_parents).await {
                Ok(_) | Err(TreeError::DuplicateVersion(_)) => {
                    let _ = stage.discard(&output.n).await;
                    Ok(Some(output))
                }
                Err(e @ TreeError::Backend(_)) => Err(e),
                Err(other) => {
                    warn!(error = %other, "local append rejected during merge; will retry on next scan");
                    Ok(None)
                }
            }
        }
    }
}

#[instrument(skip_all, fields(perspective = %pe))]
async fn run_remote_merge_loop(
    pe: PerspectiveName,
    remote: Tree,
    local: Tree,
    stage: Tree,
    tx: mpsc::Sender<MergeTreeResult<MergeOutput>>,
    stop_flag: Arc<AtomicBool>,
    cursor_status: Arc<Mutex<HashMap<PerspectiveName, CursorStatus>>>,
    conflict_sink: Arc<dyn ConflictSink>,
    v_size: usize,
) {
    let cursor_key = remote.raw_key(layout::cursor_key());
    let mut cursor_i = load_cursor(remote.backend_ref(), &cursor_key).unwrap_or(0);

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        set_status(&cursor_status, &pe, CursorStatus::Scanning);

        let ids = match ids_touched_since(&remote, cursor_i) {
            Ok(ids) => ids,
            Err(e) => {
                set_status(&cursor_status, &pe, CursorStatus::BackendFault);
                let _ = tx.send(Err(MergeTreeError::BackendFault(e))).await;
                return;
            }
        };

        if ids.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            continue;
        }

        for (id, max_i_for_id) in ids {
            if stop_flag.load(Ordering::SeqCst) {
                break;
            }

            let step = match merge_one_id(&local, &remote, &pe, &id, v_size).await {
                Ok(Some(step)) => step,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, ?id, "could not evaluate merge for id, will retry on next scan");
                    continue;
                }
            };

            let output = match apply_merge_step(&local, &stage, &conflict_sink, step).await {
                Ok(output) => output,
                Err(TreeError::Backend(kv_err)) => {
                    set_status(&cursor_status, &pe, CursorStatus::BackendFault);
                    let _ = tx.send(Err(MergeTreeError::BackendFault(kv_err))).await;
                    return;
                }
                Err(e) => {
                    // `apply_merge_step` only ever returns `Err` for the
                    // backend-fault case; any other outcome is folded into
                    // `Ok(None)` there.
                    set_status(&cursor_status, &pe, CursorStatus::BackendFault);
                    let _ = tx.send(Err(MergeTreeError::Tree(e))).await;
                    return;
                }
            };

            if let Some(mut output) = output {
                set_status(&cursor_status, &pe, CursorStatus::AwaitAck);
                let (ack_tx, ack_rx) = oneshot::channel();
                output.ack_tx = Some(ack_tx);
                if tx.send(Ok(output)).await.is_err() {
                    return;
                }
                if ack_rx.await.is_err() {
                    return;
                }
            }

            cursor_i = cursor_i.max(max_i_for_id);
            if let Err(e) = store_cursor(remote.backend_ref(), &cursor_key, cursor_i) {
                set_status(&cursor_status, &pe, CursorStatus::BackendFault);
                let _ = tx.send(Err(MergeTreeError::BackendFault(e))).await;
                return;
            }
        }
    }
    set_status(&cursor_status, &pe, CursorStatus::Stopped);
}

fn load_cursor(backend: &dyn KvBackend, key: &[u8]) -> Option<u64> {
    backend
        .get(key)
        .ok()
        .flatten()
        .and_then(|bytes| bytes.as_slice().try_into().ok())
        .map(u64::from_be_bytes)
}

fn store_cursor(backend: &dyn KvBackend, key: &[u8], i: u64) -> Result<(), KvError> {
    let mut batch = WriteBatch::new();
    batch.put(key.to_vec(), i.to_be_bytes().to_vec());
    backend.write_batch(batch)
}

/// Every `id` with at least one record whose `i > since` in `remote`,
/// mapped to the highest such `i` seen for that id (so the caller can
/// advance the cursor past exactly the ids it has now handled).
fn ids_touched_since(remote: &Tree, since: u64) -> Result<Vec<(Id, u64)>, KvError> {
    let prefix = remote.raw_key(vec![layout::INSERTION_PREFIX_BYTE]);
    let range = KeyRange::prefix(&prefix);
    let entries = remote.backend_ref().scan(&range)?;
    let mut seen: HashMap<Id, u64> = HashMap::new();
    for (key, val) in entries {
        let i = u64::from_be_bytes(key[key.len() - 8..].try_into().unwrap());
        if i <= since {
            continue;
        }
        let id_bytes = val[..val.len() - 9].to_vec();
        let id = Id::from_bytes(id_bytes);
        seen.entry(id).and_modify(|m| *m = (*m).max(i)).or_insert(i);
    }
    // Deterministic processing order within a scan round, rather than
    // whatever order the hash map happens to yield.
    Ok(seen.into_iter().sorted_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::MemoryConflictSink;
    use crate::document::{Document, Value};
    use crate::header::Header;
    use crate::kv::MemoryKv;
    use futures::StreamExt;

    fn id(key: &str) -> Id {
        Id::compose("items", key.as_bytes()).unwrap()
    }

    fn cfg(perspectives: &[&str]) -> MergeTreeConfig {
        MergeTreeConfig {
            v_size: 6,
            perspectives: perspectives.iter().map(|p| PerspectiveName::new(*p)).collect(),
            conflict_store: "conflicts".to_string(),
            snapshot_store: "snapshots".to_string(),
            start_merge: true,
            tail_retry: std::time::Duration::from_millis(1000),
            output_filter: None,
            output_hooks: vec![],
        }
    }

    #[tokio::test]
    async fn new_id_from_remote_is_adopted_without_a_merge() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let sink = Arc::new(MemoryConflictSink::new());
        let mt = MergeTree::new(backend, cfg(&["a"]), sink).unwrap();

        let remote_stream = mt
            .create_remote_write_stream(&PerspectiveName::new("a"), None, vec![])
            .unwrap();
        let v = Version::new(vec![1; 6]).unwrap();
        remote_stream
            .write(Record::new(Header::new(id("x"), v.clone(), vec![]), Document::new()))
            .await
            .unwrap();

        let mut stream = mt.start_merge();
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(item.n, v);
        assert_eq!(item.l, None);
        item.ack();
        mt.stop_merge().await;

        let head = mt.get_local_head(&id("x")).unwrap().unwrap();
        assert_eq!(head.header.v, v);
    }

    #[tokio::test]
    async fn clean_merge_combines_disjoint_key_changes_into_local_tree() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let sink = Arc::new(MemoryConflictSink::new());
        let mt = MergeTree::new(backend, cfg(&["a"]), sink).unwrap();

        let mut base_doc = Document::new();
        base_doc.insert("x", Value::Int(1));
        let v1 = Version::new(vec![1; 6]).unwrap();

        let local_stream = mt.create_local_write_stream();
        local_stream
            .write(Record::new(Header::new(id("x"), v1.clone(), vec![]), base_doc.clone()))
            .await
            .unwrap();

        let remote_stream = mt
            .create_remote_write_stream(&PerspectiveName::new("a"), None, vec![])
            .unwrap();
        remote_stream
            .write(Record::new(Header::new(id("x"), v1.clone(), vec![]), base_doc.clone()))
            .await
            .unwrap();

        let mut l_doc = base_doc.clone();
        l_doc.insert("y", Value::Int(2));
        let v2 = Version::new(vec![2; 6]).unwrap();
        local_stream
            .write(Record::new(Header::new(id("x"), v2.clone(), vec![v1.clone()]), l_doc))
            .await
            .unwrap();

        let mut r_doc = base_doc.clone();
        r_doc.insert("z", Value::Int(3));
        let v3 = Version::new(vec![3; 6]).unwrap();
        remote_stream
            .write(Record::new(Header::new(id("x"), v3.clone(), vec![v1.clone()]), r_doc))
            .await
            .unwrap();

        let mut stream = mt.start_merge();
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(item.c, None);
        assert_eq!(item.l, Some(v2.clone()));
        item.ack();
        mt.stop_merge().await;

        let head = mt.get_local_head(&id("x")).unwrap().unwrap();
        assert_eq!(head.body.get("y"), Some(&Value::Int(2)));
        assert_eq!(head.body.get("z"), Some(&Value::Int(3)));
        assert_eq!(head.header.pa, vec![v2, v3]);
    }

    #[tokio::test]
    async fn conflicting_merge_is_sent_to_the_conflict_sink_not_the_local_tree() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let sink = Arc::new(MemoryConflictSink::new());
        let mt = MergeTree::new(backend, cfg(&["a"]), sink.clone()).unwrap();

        let mut base_doc = Document::new();
        base_doc.insert("same", Value::Str("s1".to_string()));
        let v1 = Version::new(vec![1; 6]).unwrap();

        let local_stream = mt.create_local_write_stream();
        local_stream
            .write(Record::new(Header::new(id("x"), v1.clone(), vec![]), base_doc.clone()))
            .await
            .unwrap();
        let remote_stream = mt
            .create_remote_write_stream(&PerspectiveName::new("a"), None, vec![])
            .unwrap();
        remote_stream
            .write(Record::new(Header::new(id("x"), v1.clone(), vec![]), base_doc.clone()))
            .await
            .unwrap();

        let mut l_doc = base_doc.clone();
        l_doc.insert("same", Value::Str("s2".to_string()));
        let v2 = Version::new(vec![2; 6]).unwrap();
        local_stream
            .write(Record::new(Header::new(id("x"), v2.clone(), vec![v1.clone()]), l_doc))
            .await
            .unwrap();

        let mut r_doc = base_doc.clone();
        r_doc.insert("same", Value::Str("s3".to_string()));
        let v3 = Version::new(vec![3; 6]).unwrap();
        remote_stream
            .write(Record::new(Header::new(id("x"), v3.clone(), vec![v1.clone()]), r_doc))
            .await
            .unwrap();

        let mut stream = mt.start_merge();
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(item.c, Some(vec!["same".to_string()]));
        item.ack();
        mt.stop_merge().await;

        assert_eq!(sink.len(), 1);
        // No merge record was written; the local head is still v2.
        let head = mt.get_local_head(&id("x")).unwrap().unwrap();
        assert_eq!(head.header.v, v2);
    }
}
