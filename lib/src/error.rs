//! Error taxonomy for the KV layer, the [`crate::tree::Tree`] layer, and
//! [`crate::merge_tree::MergeTree`] orchestration.
//!
//! Mirrors the layering of the on-disk stack: a [`KvError`] wraps whatever
//! the backing key/value store reports, a [`TreeError`] wraps that plus the
//! append-only DAG invariants of a single [`crate::tree::Tree`], and a
//! [`MergeTreeError`] wraps that plus failures that can only occur while
//! orchestrating several trees together.

use thiserror::Error;

use crate::ids::Version;

/// Error returned by a [`crate::kv::KvBackend`] implementation.
#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl KvError {
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Error taxonomy of spec.md §7, scoped to a single [`crate::tree::Tree`].
#[derive(Debug, Error)]
pub enum TreeError {
    /// A record failed header schema validation (§3): empty version, `id`
    /// containing more than one `store` separator, or (for a local tree) a
    /// `pa` entry that does not resolve to an earlier insertion in this tree.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// `v` already exists in this tree. Not fatal: the caller should treat
    /// the append as a no-op.
    #[error("version {0:?} already exists in this tree")]
    DuplicateVersion(Version),

    /// A `pa` entry in a remote-tree record does not resolve to any
    /// existing version in that perspective's history.
    #[error("unknown parent version {0:?}")]
    UnknownParent(Version),

    /// Caller expected exactly one head for an id, but the local tree has
    /// more than one (only reachable via direct external manipulation).
    #[error("id has multiple heads: {0:?}")]
    MultipleHeads(Vec<Version>),

    #[error(transparent)]
    Backend(#[from] KvError),
}

pub type TreeResult<T> = Result<T, TreeError>;

/// Error taxonomy for [`crate::merge_tree::MergeTree`] orchestration: wraps
/// [`TreeError`] plus failures that only make sense at the level of the
/// merger (a sticky `BACKEND_FAULT` terminal state, or the output channel
/// having been dropped by its consumer).
#[derive(Debug, Error)]
pub enum MergeTreeError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// A backend error occurred on the local-tree append path. Per §4.4 this
    /// stops the merger; recovery requires reconstructing the `MergeTree`.
    #[error("local append backend fault, merger stopped: {0}")]
    BackendFault(#[source] KvError),

    /// The consumer of a merge-output or read stream dropped its receiving
    /// end before the merger/reader finished.
    #[error("output stream consumer went away")]
    ConsumerGone,

    /// No such perspective was configured at construction time.
    #[error("unknown perspective {0:?}")]
    UnknownPerspective(String),

    /// `resolve_conflict` was called with an id the conflict sink doesn't
    /// have (already resolved, or never recorded).
    #[error("unknown conflict id {0}")]
    UnknownConflict(u64),

    /// `resolve_conflict`'s `to_be_resolved` no longer matches the current
    /// local head, or the id has no local head at all — the local tree
    /// moved on since the conflict was recorded.
    #[error("conflict {0} is stale: local head no longer matches to_be_resolved")]
    StaleConflict(u64),
}

pub type MergeTreeResult<T> = Result<T, MergeTreeError>;

/// Error returned while loading a [`crate::config::MergeTreeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml_edit::TomlError),

    #[error("unrecognized configuration key {0:?}")]
    UnknownKey(String),

    #[error("field {field:?}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
