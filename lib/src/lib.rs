//! Append-only, content-addressed DAG storage and an on-line three-way
//! merge engine for multi-master replicated document stores.
//!
//! A [`merge_tree::MergeTree`] owns one local [`tree::Tree`] plus one
//! [`tree::Tree`] per remote perspective, plus a transient stage
//! [`tree::Tree`] of its own. Locally originated writes and remotely
//! received writes each land in their own tree; a background merger pairs
//! remote heads with the current local head, three-way merges them
//! ([`merge_engine`]), and writes the candidate to the stage tree before
//! promoting it to the local tree and discarding it from the stage —
//! or, when the merge can't auto-resolve, hands a descriptor to a
//! [`conflict::ConflictSink`] instead.
//! [`stream_tree::StreamTree`] reads any tree back out in insertion order,
//! with optional filtering/transform hooks that preserve DAG connectivity
//! across suppressed records.

pub mod base64_util;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod header;
pub mod ids;
pub mod kv;
pub mod merge_engine;
pub mod merge_tree;
pub mod record;
pub mod stream_tree;
pub mod tree;

pub use config::MergeTreeConfig;
pub use conflict::{ConflictRecord, ConflictSink, MemoryConflictSink};
pub use document::{Document, Value};
pub use error::{ConfigError, KvError, MergeTreeError, MergeTreeResult, TreeError, TreeResult};
pub use header::Header;
pub use ids::{Id, PerspectiveName, Version};
pub use kv::{KvBackend, MemoryKv};
pub use merge_tree::{LocalWriteStream, MergeOutput, MergeTree, RemoteWriteStream};
pub use record::Record;
pub use stream_tree::{ReadOptions, StreamItem, StreamTree, Transform};
pub use tree::{Tree, TreeKind};
