//! The three-way merge algorithm (§4.3): given a local head, a remote head,
//! and their LCA set, produces either a merged record or a conflict
//! descriptor.
//!
//! A merge head and its LCAs can each live in a different
//! [`crate::tree::Tree`] (the local tree, or some remote perspective's
//! tree) — together they form the "combined DAG" the glossary refers to.
//! [`CombinedAncestry`] is the seam that lets ancestor/LCA queries walk
//! across that boundary: it tries the local tree first, then the remote
//! tree, exactly mirroring how a version composed from a prior merge can
//! cite a parent that only the *other* tree actually stored.

use std::collections::HashSet;

use rand::RngCore;

use crate::document::{Document, Value};
use crate::error::TreeResult;
use crate::header::Header;
use crate::ids::{PerspectiveName, Version};
use crate::record::Record;
use crate::tree::Tree;

/// Looks up ancestry across a local tree and one remote tree, the way the
/// merge engine needs to when a prior merge's `pa` cites a version that
/// only lives in the other tree.
pub struct CombinedAncestry<'a> {
    pub local: &'a Tree,
    pub remote: &'a Tree,
}

impl<'a> CombinedAncestry<'a> {
    pub fn new(local: &'a Tree, remote: &'a Tree) -> Self {
        Self { local, remote }
    }

    fn get(&self, v: &Version) -> TreeResult<Option<Record>> {
        if let Some(r) = self.local.get_by_version(v)? {
            return Ok(Some(r));
        }
        self.remote.get_by_version(v)
    }

    fn parents(&self, v: &Version) -> TreeResult<Vec<Version>> {
        Ok(self.get(v)?.map(|r| r.header.pa).unwrap_or_default())
    }

    /// Whether `v` is `ancestor`'s proper ancestor, searched across both
    /// trees.
    pub fn is_ancestor(&self, ancestor: &Version, v: &Version) -> TreeResult<bool> {
        if ancestor == v {
            return Ok(false);
        }
        let mut frontier: Vec<Version> = self.parents(v)?;
        let mut visited = HashSet::new();
        while let Some(cur) = frontier.pop() {
            if !visited.insert(cur.clone()) {
                continue;
            }
            if &cur == ancestor {
                return Ok(true);
            }
            frontier.extend(self.parents(&cur)?);
        }
        Ok(false)
    }

    fn ancestors_inclusive(&self, v: &Version) -> TreeResult<HashSet<Version>> {
        let mut visited = HashSet::new();
        let mut frontier = vec![v.clone()];
        while let Some(cur) = frontier.pop() {
            if !visited.insert(cur.clone()) {
                continue;
            }
            frontier.extend(self.parents(&cur)?);
        }
        Ok(visited)
    }

    /// Lowest common ancestor set of `v1` and `v2`, across both trees
    /// (§4.1's algorithm, generalized to span two `Tree`s).
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
                if self.is_ancestor(candidate, other)? {
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
}

/// One merged or candidate-new record, or a conflict, as produced by
/// [`three_way_merge`]. Maps directly onto the output envelope of §6.
pub enum MergeDecision {
    /// `rhead` is a descendant of `lhead`; the local head simply becomes
    /// `rhead` with no fresh version generated.
    FastForward,
    /// `rhead` is an ancestor of (or equal to) `lhead`; nothing to do.
    Drop,
    /// Auto-merge succeeded; `record` is ready to append to the local tree
    /// (its `v` is fresh and its `pa` cites `lhead`/`rhead` directly).
    Merged(Record),
    /// Auto-merge failed; the descriptor should go to the conflict sink.
    Conflict(ConflictCandidate),
}

/// The non-persisted shape of a conflict, before a sink assigns it an
/// integer id (§3 "Conflict record").
#[derive(Debug, Clone)]
pub struct ConflictCandidate {
    pub n: Version,
    pub l: Option<Version>,
    pub lcas: Vec<Version>,
    pub pe: PerspectiveName,
    /// Conflicting body keys, or `None` for a non-body conflict (e.g. "no
    /// lca").
    pub c: Option<Vec<String>>,
    pub err: Option<String>,
}

/// Runs the three-way merge of §4.3 between `lhead` (a local-tree record)
/// and `rhead` (a record in perspective `pe`'s remote tree) given their
/// combined-DAG LCA set `lcas`. `rng`/`v_size` are used only when rule 3
/// needs a fresh version for a clean merge.
pub fn three_way_merge(
    ancestry: &CombinedAncestry<'_>,
    lhead: &Record,
    rhead: &Record,
    pe: PerspectiveName,
    rng: &mut impl RngCore,
    v_size: usize,
) -> TreeResult<MergeDecision> {
    // Rule 1: fast-forward / drop.
    if ancestry.is_ancestor(lhead.version(), rhead.version())? {
        return Ok(MergeDecision::FastForward);
    }
    if ancestry.is_ancestor(rhead.version(), lhead.version())? || lhead.version() == rhead.version() {
        return Ok(MergeDecision::Drop);
    }

    let lcas = ancestry.lca(lhead.version(), rhead.version())?;

    // Rule 2: disjoint DAGs.
    if lcas.is_empty() {
        return Ok(MergeDecision::Conflict(ConflictCandidate {
            n: rhead.version().clone(),
            l: Some(lhead.version().clone()),
            lcas: vec![],
            pe,
            c: None,
            err: Some("no lca".to_string()),
        }));
    }

    let base_body = if lcas.len() == 1 {
        let record = ancestry
            .get(&lcas[0])?
            .expect("lca version must resolve to a record in one of the two trees");
        record.body
    } else {
        // Rule 4: criss-cross. Recursively merge the LCAs pairwise until one
        // synthetic LCA remains, then fall through to rule 3.
        reduce_lcas(ancestry, &lcas)?
    };

    let (merged_doc, conflicting_keys) =
        merge_documents(&base_body, &lhead.body, lhead.header.d, &rhead.body, rhead.header.d);

    if conflicting_keys.is_empty() {
        let v = generate_unused_version(ancestry, rng, v_size, lhead.id())?;
        let d = document_deleted(lhead) && document_deleted(rhead);
        let mut header = Header::new(lhead.id().clone(), v, vec![lhead.version().clone(), rhead.version().clone()]);
        header.d = d;
        Ok(MergeDecision::Merged(Record::new(header, merged_doc)))
    } else {
        Ok(MergeDecision::Conflict(ConflictCandidate {
            n: rhead.version().clone(),
            l: Some(lhead.version().clone()),
            lcas,
            pe,
            c: Some(conflicting_keys),
            err: None,
        }))
    }
}

fn document_deleted(record: &Record) -> bool {
    record.header.d
}

/// Per-key three-way merge (§4.3 rule 3). `local_deleted`/`remote_deleted`
/// come straight from each side's `header.d` rather than being inferred
/// from the body: a deleted side is treated as "all keys removed" even if
/// its stored body is stale and still carries old values, since nothing
/// about `Record`'s shape forces a tombstone's body to be empty.
/// Grounded on the same trivial-merge shape used throughout content-merge
/// algorithms: keep on agreement, take the side that actually changed,
/// conflict when both changed to different values.
fn merge_documents(
    base: &Document,
    local: &Document,
    local_deleted: bool,
    remote: &Document,
    remote_deleted: bool,
) -> (Document, Vec<String>) {
    let mut keys: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
    keys.extend(base.keys());
    if !local_deleted {
        keys.extend(local.keys());
    }
    if !remote_deleted {
        keys.extend(remote.keys());
    }

    let mut merged = Document::new();
    let mut conflicts = Vec::new();

    for key in keys {
        let a = base.get(key);
        let l = if local_deleted { None } else { local.get(key) };
        let r = if remote_deleted { None } else { remote.get(key) };

        if l == r {
            if let Some(v) = l {
                merged.insert(key, v.clone());
            }
            continue;
        }
        if l == a {
            if let Some(v) = r {
                merged.insert(key, v.clone());
            }
            continue;
        }
        if r == a {
            if let Some(v) = l {
                merged.insert(key, v.clone());
            }
            continue;
        }
        // l != a && r != a && l != r
        conflicts.push(key.to_string());
    }

    (merged, conflicts)
}

/// Folds a criss-cross LCA set down to one synthetic body by recursively
/// three-way-merging pairs (§4.3 rule 4). The synthetic body is never
/// persisted, so any residual disagreement during the fold is resolved by
/// preferring the first accumulator's value rather than surfaced as a
/// conflict — only the final rule-3 merge against `lhead`/`rhead` produces
/// a user-visible conflict.
fn reduce_lcas(ancestry: &CombinedAncestry<'_>, lcas: &[Version]) -> TreeResult<Document> {
    let mut records = Vec::with_capacity(lcas.len());
    for v in lcas {
        let r = ancestry
            .get(v)?
            .expect("lca version must resolve to a record in one of the two trees");
        records.push(r);
    }
    let mut acc = records[0].body.clone();
    let mut acc_deleted = records[0].header.d;
    for next in &records[1..] {
        let sub_lcas = ancestry.lca(&records[0].header.v, &next.header.v)?;
        let sub_base = if sub_lcas.is_empty() {
            Document::new()
        } else {
            reduce_lcas(ancestry, &sub_lcas)?
        };
        let (merged, _conflicts_resolved_arbitrarily) =
            merge_documents(&sub_base, &acc, acc_deleted, &next.body, next.header.d);
        acc = merged;
        acc_deleted = acc_deleted && next.header.d;
    }
    Ok(acc)
}

/// Draws a fresh version not already present in either tree of `ancestry`,
/// retrying on collision. Exposed to `merge_tree` so `resolveConflict` can
/// generate the version of the record it writes the same way a clean merge
/// does.
pub(crate) fn generate_unused_version(
    ancestry: &CombinedAncestry<'_>,
    rng: &mut impl RngCore,
    v_size: usize,
    _id: &crate::ids::Id,
) -> TreeResult<Version> {
    loop {
        let candidate = Version::generate(rng, v_size);
        if ancestry.local.get_by_version(&candidate)?.is_none()
            && ancestry.remote.get_by_version(&candidate)?.is_none()
        {
            return Ok(candidate);
        }
        tracing::warn!("generated version collided with an existing one; retrying");
    }
}

/// Used only by tests/examples to build small bodies inline.
pub fn doc(pairs: &[(&str, Value)]) -> Document {
    let mut d = Document::new();
    for (k, v) in pairs {
        d.insert(*k, v.clone());
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;
    use crate::header::Header;
    use crate::ids::Id;
    use crate::kv::MemoryKv;
    use crate::tree::TreeKind;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::sync::Arc;

    fn id() -> crate::ids::Id {
        Id::compose("items", b"x").unwrap()
    }

    fn v(b: u8) -> Version {
        Version::new(vec![b; 6]).unwrap()
    }

    async fn local_tree() -> Tree {
        Tree::open("local", Arc::new(MemoryKv::new()), TreeKind::Local, 6).unwrap()
    }

    async fn remote_tree() -> Tree {
        Tree::open(
            "remote-a",
            Arc::new(MemoryKv::new()),
            TreeKind::Remote(PerspectiveName::new("a")),
            6,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fast_forward_when_local_is_ancestor_of_remote() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        let a = local
            .append(Record::new(Header::new(id(), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        remote
            .append(Record::new(Header::new(id(), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let b = remote
            .append(Record::new(Header::new(id(), v(2), vec![v(1)]), Document::new()))
            .await
            .unwrap();

        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let decision =
            three_way_merge(&ancestry, &a, &b, PerspectiveName::new("a"), &mut rng, 6).unwrap();
        assert!(matches!(decision, MergeDecision::FastForward));
    }

    #[tokio::test]
    async fn drop_when_remote_is_ancestor_of_local() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        remote
            .append(Record::new(Header::new(id(), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let a = local
            .append(Record::new(Header::new(id(), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let b = local
            .append(Record::new(Header::new(id(), v(2), vec![v(1)]), Document::new()))
            .await
            .unwrap();
        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let decision =
            three_way_merge(&ancestry, &b, &a, PerspectiveName::new("a"), &mut rng, 6).unwrap();
        assert!(matches!(decision, MergeDecision::Drop));
    }

    #[tokio::test]
    async fn disjoint_histories_conflict_with_no_lca() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        let a = local
            .append(Record::new(Header::new(id(), v(1), vec![]), Document::new()))
            .await
            .unwrap();
        let b = remote
            .append(Record::new(Header::new(id(), v(2), vec![]), Document::new()))
            .await
            .unwrap();
        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let decision =
            three_way_merge(&ancestry, &a, &b, PerspectiveName::new("a"), &mut rng, 6).unwrap();
        match decision {
            MergeDecision::Conflict(c) => {
                assert_eq!(c.c, None);
                assert_eq!(c.err.as_deref(), Some("no lca"));
            }
            _ => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn clean_three_way_merge_combines_disjoint_key_changes() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        let mut base_doc = Document::new();
        base_doc.insert("x", Value::Int(1));
        base_doc.insert("y", Value::Int(1));

        let base = local
            .append(Record::new(Header::new(id(), v(1), vec![]), base_doc))
            .await
            .unwrap();
        remote
            .append(Record::new(Header::new(id(), v(1), vec![]), base.body.clone()))
            .await
            .unwrap();

        let mut l_doc = base.body.clone();
        l_doc.insert("x", Value::Int(2));
        let lhead = local
            .append(Record::new(Header::new(id(), v(2), vec![v(1)]), l_doc))
            .await
            .unwrap();

        let mut r_doc = base.body.clone();
        r_doc.insert("y", Value::Int(3));
        let rhead = remote
            .append(Record::new(Header::new(id(), v(3), vec![v(1)]), r_doc))
            .await
            .unwrap();

        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let decision = three_way_merge(&ancestry, &lhead, &rhead, PerspectiveName::new("a"), &mut rng, 6)
            .unwrap();
        match decision {
            MergeDecision::Merged(record) => {
                assert_eq!(record.body.get("x"), Some(&Value::Int(2)));
                assert_eq!(record.body.get("y"), Some(&Value::Int(3)));
                assert_eq!(record.header.pa, vec![v(2), v(3)]);
            }
            _ => panic!("expected clean merge"),
        }
    }

    #[tokio::test]
    async fn conflicting_key_changes_are_reported() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        let mut base_doc = Document::new();
        base_doc.insert("same", Value::Str("s1".into()));
        let base = local
            .append(Record::new(Header::new(id(), v(1), vec![]), base_doc))
            .await
            .unwrap();
        remote
            .append(Record::new(Header::new(id(), v(1), vec![]), base.body.clone()))
            .await
            .unwrap();

        let mut l_doc = base.body.clone();
        l_doc.insert("same", Value::Str("s2".into()));
        let lhead = local
            .append(Record::new(Header::new(id(), v(2), vec![v(1)]), l_doc))
            .await
            .unwrap();

        let mut r_doc = base.body.clone();
        r_doc.insert("same", Value::Str("s3".into()));
        let rhead = remote
            .append(Record::new(Header::new(id(), v(3), vec![v(1)]), r_doc))
            .await
            .unwrap();

        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let decision = three_way_merge(&ancestry, &lhead, &rhead, PerspectiveName::new("a"), &mut rng, 6)
            .unwrap();
        match decision {
            MergeDecision::Conflict(c) => assert_eq!(c.c, Some(vec!["same".to_string()])),
            _ => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn delete_vs_modify_conflicts_on_the_modified_key() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        let mut base_doc = Document::new();
        base_doc.insert("k", Value::Int(1));
        let base = local
            .append(Record::new(Header::new(id(), v(1), vec![]), base_doc))
            .await
            .unwrap();
        remote
            .append(Record::new(Header::new(id(), v(1), vec![]), base.body.clone()))
            .await
            .unwrap();

        let mut lheader = Header::new(id(), v(2), vec![v(1)]);
        lheader.d = true;
        let lhead = local.append(Record::new(lheader, Document::new())).await.unwrap();

        let mut r_doc = base.body.clone();
        r_doc.insert("k", Value::Int(2));
        let rhead = remote
            .append(Record::new(Header::new(id(), v(3), vec![v(1)]), r_doc))
            .await
            .unwrap();

        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let decision = three_way_merge(&ancestry, &lhead, &rhead, PerspectiveName::new("a"), &mut rng, 6)
            .unwrap();
        match decision {
            MergeDecision::Conflict(c) => assert_eq!(c.c, Some(vec!["k".to_string()])),
            _ => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn deleted_side_with_stale_nonempty_body_is_still_treated_as_all_removed() {
        let local = local_tree().await;
        let remote = remote_tree().await;
        let mut base_doc = Document::new();
        base_doc.insert("k", Value::Int(1));
        let base = local
            .append(Record::new(Header::new(id(), v(1), vec![]), base_doc))
            .await
            .unwrap();
        remote
            .append(Record::new(Header::new(id(), v(1), vec![]), base.body.clone()))
            .await
            .unwrap();

        // Tombstone that (against convention) still carries the pre-deletion
        // body instead of an empty one.
        let mut lheader = Header::new(id(), v(2), vec![v(1)]);
        lheader.d = true;
        let lhead = local
            .append(Record::new(lheader, base.body.clone()))
            .await
            .unwrap();

        // Remote leaves "k" untouched.
        let rhead = remote
            .append(Record::new(Header::new(id(), v(3), vec![v(1)]), base.body.clone()))
            .await
            .unwrap();

        let ancestry = CombinedAncestry::new(&local, &remote);
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let decision = three_way_merge(&ancestry, &lhead, &rhead, PerspectiveName::new("a"), &mut rng, 6)
            .unwrap();
        match decision {
            MergeDecision::Merged(record) => assert!(record.body.get("k").is_none()),
            _ => panic!("expected a clean merge with the key removed"),
        }
    }
}
