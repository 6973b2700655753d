//! [`StreamTree`]: a lazy, restartable reader over a [`crate::tree::Tree`]
//! in insertion order (§4.2), with filter/hook-driven ancestor rewriting and
//! optional tailing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, instrument};

use crate::error::{KvError, TreeError, TreeResult};
use crate::ids::{Id, Version};
use crate::kv::{layout, KeyRange, KvBackend};
use crate::record::Record;

/// An async, ordered transformer applied to every record a [`StreamTree`]
/// would otherwise emit (§4.2, §9 "hook arrays"). Returning `None` drops
/// the record — the same ancestor-rewriting rule that applies to `filter`
/// then applies to it.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, record: Record) -> Option<Record>;
}

/// A `Transform` built from a plain synchronous predicate, the degenerate
/// case §9 calls out explicitly ("filter predicates are a degenerate case"
/// of the hook trait).
pub struct Predicate<F>(pub F);

#[async_trait]
impl<F> Transform for Predicate<F>
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    async fn apply(&self, record: Record) -> Option<Record> {
        if (self.0)(&record) { Some(record) } else { None }
    }
}

/// Parameters accepted by [`crate::tree::Tree::read_stream`] (§4.2), all
/// optional.
#[derive(Default)]
pub struct ReadOptions {
    pub id: Option<Id>,
    pub first: Option<Version>,
    pub last: Option<Version>,
    pub exclude_first: bool,
    pub exclude_last: bool,
    pub reverse: bool,
    pub tail: bool,
    pub tail_retry: Option<Duration>,
    pub filter: Option<Arc<dyn Fn(&Record) -> bool + Send + Sync>>,
    pub hooks: Vec<Arc<dyn Transform>>,
    pub raw: bool,
}

impl ReadOptions {
    pub fn for_id(id: Id) -> Self {
        Self { id: Some(id), ..Self::default() }
    }
}

/// One item a [`StreamTree`] yields: either a decoded [`Record`] or, when
/// [`ReadOptions::raw`] is set, the undecoded serialized form straight from
/// the backend. Raw mode bypasses `filter`/`hooks`/ancestor rewriting
/// entirely — it exists for bulk byte-level replication, not
/// reinterpretation.
pub enum StreamItem {
    Decoded(Record),
    Raw(Vec<u8>),
}

const DEFAULT_TAIL_RETRY: Duration = Duration::from_millis(1000);

/// A lazy, restartable iterator over a tree in insertion order (§4.2).
pub struct StreamTree {
    backend: Arc<dyn KvBackend>,
    name: Arc<str>,
    opts: ReadOptions,
}

impl StreamTree {
    pub(crate) fn new(backend: Arc<dyn KvBackend>, name: Arc<str>, opts: ReadOptions) -> Self {
        Self { backend, name, opts }
    }

    fn key(&self, raw: Vec<u8>) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.name.len() + 1 + raw.len());
        key.extend_from_slice(self.name.as_bytes());
        key.push(0x00);
        key.extend_from_slice(&raw);
        key
    }

    fn resolve_i(&self, v: &Version) -> TreeResult<Option<u64>> {
        let key = self.key(layout::version_key(v.as_bytes()));
        match self.backend.get(&key)? {
            Some(bytes) => Ok(Some(u64::from_be_bytes(bytes.as_slice().try_into().unwrap()))),
            None => Ok(None),
        }
    }

    /// Scans `[lo, hi]` (inclusive `i` bounds, already adjusted for
    /// exclusivity) in insertion order, restricted to `id` if set.
    fn scan_range(&self, lo: u64, hi: Option<u64>) -> TreeResult<Vec<(u64, Vec<u8>)>> {
        if let Some(id) = &self.opts.id {
            let prefix = layout::primary_prefix(id.as_bytes());
            let full_prefix = self.key(prefix);
            let range = KeyRange::prefix(&full_prefix);
            let entries = self.backend.scan(&range)?;
            Ok(entries
                .into_iter()
                .filter_map(|(k, val)| {
                    let i = u64::from_be_bytes(k[k.len() - 8..].try_into().ok()?);
                    if i >= lo && hi.is_none_or(|hi| i <= hi) { Some((i, val)) } else { None }
                })
                .collect())
        } else {
            let mut prefix = self.name.as_bytes().to_vec();
            prefix.push(0x00);
            prefix.push(layout::INSERTION_PREFIX_BYTE);
            let range = KeyRange::prefix(&prefix);
            let entries = self.backend.scan(&range)?;
            let mut out = Vec::new();
            for (k, idval) in entries {
                let i = u64::from_be_bytes(k[k.len() - 8..].try_into().unwrap());
                if i < lo || hi.is_some_and(|hi| i > hi) {
                    continue;
                }
                // idval = id | 0x00 | i(8 bytes)
                let id_bytes = &idval[..idval.len() - 9];
                let pkey = self.key(layout::primary_key(id_bytes, i));
                if let Some(record_bytes) = self.backend.get(&pkey)? {
                    out.push((i, record_bytes));
                }
            }
            Ok(out)
        }
    }

    fn bounds(&self) -> TreeResult<(u64, Option<u64>)> {
        let mut lo = 1u64;
        let mut hi = None;
        if let Some(first) = &self.opts.first {
            let i = self.resolve_i(first)?.ok_or_else(|| {
                TreeError::InvalidHeader(format!("`first` version {first:?} not found"))
            })?;
            lo = if self.opts.exclude_first { i + 1 } else { i };
        }
        if let Some(last) = &self.opts.last {
            let i = self.resolve_i(last)?.ok_or_else(|| {
                TreeError::InvalidHeader(format!("`last` version {last:?} not found"))
            })?;
            hi = Some(if self.opts.exclude_last { i.saturating_sub(1) } else { i });
        }
        Ok((lo, hi))
    }

    /// Materializes the (bounded) backlog, applying `filter`/`hooks` and
    /// the ancestor-rewriting rule of §4.2, then returns it plus the
    /// highest `i` seen (for tailing).
    #[instrument(skip(self), fields(tree = %self.name))]
    async fn materialize(&self) -> TreeResult<(Vec<Record>, u64)> {
        let (lo, hi) = self.bounds()?;
        let rows = self.scan_range(lo, hi)?;

        let mut emitted: HashSet<Version> = HashSet::new();
        let mut rewrite: HashMap<Version, Vec<Version>> = HashMap::new();
        let mut out = Vec::new();
        let mut max_i = lo.saturating_sub(1);

        for (i, bytes) in rows {
            max_i = max_i.max(i);
            let mut record = Record::decode(&bytes).map_err(|e| TreeError::Backend(KvError::other(e)))?;
            let own_version = record.header.v.clone();

            let mut resolved_pa = Vec::new();
            for parent in &record.header.pa {
                if emitted.contains(parent) {
                    push_unique(&mut resolved_pa, parent.clone());
                } else if let Some(replacement) = rewrite.get(parent) {
                    for r in replacement {
                        push_unique(&mut resolved_pa, r.clone());
                    }
                } else {
                    push_unique(&mut resolved_pa, parent.clone());
                }
            }
            record.header.pa = resolved_pa;
            let resolved_pa_for_suppression = record.header.pa.clone();

            let mut candidate = match &self.opts.filter {
                Some(f) if !f(&record) => None,
                _ => Some(record),
            };

            for hook in &self.opts.hooks {
                candidate = match candidate {
                    Some(r) => hook.apply(r).await,
                    None => None,
                };
            }

            match candidate {
                Some(r) => {
                    let pa_after = r.header.pa.clone();
                    rewrite.insert(own_version.clone(), pa_after);
                    emitted.insert(own_version);
                    out.push(r);
                }
                None => {
                    debug!(?own_version, "record suppressed by filter/hooks");
                    rewrite.insert(own_version, resolved_pa_for_suppression);
                }
            }
        }

        Ok((out, max_i))
    }

    /// Turns this reader into a `Stream` of items. Non-tail reads complete
    /// once the bounded backlog is drained; tailing reads stay open,
    /// reopening the underlying scan every `tail_retry` to pick up newly
    /// appended records (§4.2).
    pub fn into_stream(self) -> BoxStream<'static, TreeResult<StreamItem>> {
        if self.opts.raw {
            return self.into_raw_stream();
        }
        let reverse = self.opts.reverse;
        let tail = self.opts.tail;
        let tail_retry = self.opts.tail_retry.unwrap_or(DEFAULT_TAIL_RETRY);
        let this = Arc::new(self);

        struct State {
            this: Arc<StreamTree>,
            queue: VecDeque<Record>,
            last_i: u64,
            done: bool,
        }

        let initial = State { this: this.clone(), queue: VecDeque::new(), last_i: 0, done: false };

        stream::unfold(initial, move |mut state| {
            let reverse = reverse;
            let tail = tail;
            async move {
                loop {
                    if let Some(record) = state.queue.pop_front() {
                        return Some((Ok(StreamItem::Decoded(record)), state));
                    }
                    if state.done {
                        return None;
                    }
                    let (mut records, max_i) = match state.this.materialize().await {
                        Ok(v) => v,
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e), state));
                        }
                    };
                    // Only replay records newer than the last batch on a
                    // tail reopen.
                    records.retain(|r| r.header.i.unwrap_or(0) > state.last_i);
                    state.last_i = max_i.max(state.last_i);
                    if reverse {
                        records.reverse();
                    }

                    if records.is_empty() {
                        if tail {
                            tokio::time::sleep(tail_retry).await;
                            continue;
                        }
                        state.done = true;
                        return None;
                    }
                    state.queue.extend(records);
                }
            }
        })
        .boxed()
    }

    fn into_raw_stream(self) -> BoxStream<'static, TreeResult<StreamItem>> {
        let tail = self.opts.tail;
        let tail_retry = self.opts.tail_retry.unwrap_or(DEFAULT_TAIL_RETRY);
        let reverse = self.opts.reverse;
        let this = Arc::new(self);

        struct State {
            this: Arc<StreamTree>,
            queue: VecDeque<Vec<u8>>,
            last_i: u64,
            done: bool,
        }
        let initial = State { this, queue: VecDeque::new(), last_i: 0, done: false };

        stream::unfold(initial, move |mut state| async move {
            loop {
                if let Some(bytes) = state.queue.pop_front() {
                    return Some((Ok(StreamItem::Raw(bytes)), state));
                }
                if state.done {
                    return None;
                }
                let (lo, hi) = match state.this.bounds() {
                    Ok(b) => b,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                };
                let lo = lo.max(state.last_i + 1);
                let rows = match state.this.scan_range(lo, hi) {
                    Ok(r) => r,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                };
                if let Some((max_i, _)) = rows.last() {
                    state.last_i = (*max_i).max(state.last_i);
                }
                let mut bytes: Vec<Vec<u8>> = rows.into_iter().map(|(_, b)| b).collect();
                if reverse {
                    bytes.reverse();
                }
                if bytes.is_empty() {
                    if tail {
                        tokio::time::sleep(tail_retry).await;
                        continue;
                    }
                    state.done = true;
                    return None;
                }
                state.queue.extend(bytes);
            }
        })
        .boxed()
    }
}

fn push_unique(vec: &mut Vec<Version>, v: Version) {
    if !vec.contains(&v) {
        vec.push(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::header::Header;
    use crate::kv::MemoryKv;
    use crate::tree::{Tree, TreeKind};

    fn id(key: &str) -> Id {
        Id::compose("items", key.as_bytes()).unwrap()
    }

    fn v(b: u8) -> Version {
        Version::new(vec![b; 6]).unwrap()
    }

    #[tokio::test]
    async fn ancestor_rewriting_drops_filtered_middle_record() {
        let tree = Tree::open("local", Arc::new(MemoryKv::new()), TreeKind::Local, 6).unwrap();
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(2), vec![v(1)]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("x"), v(3), vec![v(2)]), Document::new()))
            .await
            .unwrap();

        let reject_b = v(2);
        let mut opts = ReadOptions::for_id(id("x"));
        opts.filter = Some(Arc::new(move |r: &Record| r.header.v != reject_b));
        let stream = tree.read_stream(opts);
        let items: Vec<_> = stream.into_stream().collect().await;
        let records: Vec<Record> = items
            .into_iter()
            .map(|i| match i.unwrap() {
                StreamItem::Decoded(r) => r,
                StreamItem::Raw(_) => unreachable!(),
            })
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].header.v, v(1));
        assert_eq!(records[1].header.v, v(3));
        assert_eq!(records[1].header.pa, vec![v(1)]);
    }

    #[tokio::test]
    async fn plain_stream_yields_insertion_order() {
        let tree = Tree::open("local", Arc::new(MemoryKv::new()), TreeKind::Local, 6).unwrap();
        tree.append(Record::new(Header::new(id("x"), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        tree.append(Record::new(Header::new(id("y"), v(2), vec![]), Document::new()))
            .await
            .unwrap();
        let items: Vec<_> = tree.read_stream(ReadOptions::default()).into_stream().collect().await;
        assert_eq!(items.len(), 2);
    }
}
