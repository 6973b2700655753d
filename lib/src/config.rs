//! Typed configuration (§6 "Configuration"): the recognized options,
//! a loader from TOML for file-based callers, and a builder for callers
//! (typically tests) that construct a config directly.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::ids::PerspectiveName;
use crate::record::Record;
use crate::stream_tree::Transform;

const DEFAULT_V_SIZE: usize = 6;
const DEFAULT_TAIL_RETRY_MS: u64 = 1000;
const DEFAULT_START_MERGE: bool = true;

/// Every configuration option §6 recognizes. Unknown keys encountered
/// while loading from TOML are rejected rather than silently ignored.
pub struct MergeTreeConfig {
    /// Version width in bytes, shared by every tree in one `MergeTree`.
    pub v_size: usize,
    /// Fixed set of remote perspective names, decided at construction.
    pub perspectives: Vec<PerspectiveName>,
    /// Name of the external sink for conflict records.
    pub conflict_store: String,
    /// Name of the external sink for materialized local snapshots.
    pub snapshot_store: String,
    /// Whether the merger starts immediately on construction.
    pub start_merge: bool,
    /// Milliseconds between reopen attempts when tailing a `StreamTree`.
    pub tail_retry: Duration,
    /// Applied to the merger's output stream before it reaches the caller.
    pub output_filter: Option<Arc<dyn Fn(&Record) -> bool + Send + Sync>>,
    /// Applied, in order, to the merger's output stream after `output_filter`.
    pub output_hooks: Vec<Arc<dyn Transform>>,
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        Self {
            v_size: DEFAULT_V_SIZE,
            perspectives: Vec::new(),
            conflict_store: "conflicts".to_string(),
            snapshot_store: "snapshots".to_string(),
            start_merge: DEFAULT_START_MERGE,
            tail_retry: Duration::from_millis(DEFAULT_TAIL_RETRY_MS),
            output_filter: None,
            output_hooks: Vec::new(),
        }
    }
}

impl MergeTreeConfig {
    pub fn builder() -> MergeTreeConfigBuilder {
        MergeTreeConfigBuilder::default()
    }

    /// Parses the recognized subset of §6's keys out of a TOML document.
    /// `output_filter`/`output_hooks` are never loaded this way — they are
    /// Rust closures/trait objects, not TOML-representable — so a loaded
    /// config always has them unset; callers that need them use
    /// [`Self::builder`] instead.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let doc: toml_edit::DocumentMut = text.parse()?;
        let mut cfg = Self::default();

        for (key, item) in doc.iter() {
            match key {
                "vSize" => {
                    cfg.v_size = item.as_integer().ok_or_else(|| ConfigError::InvalidValue {
                        field: "vSize",
                        message: "expected an integer".to_string(),
                    })? as usize;
                }
                "perspectives" => {
                    let arr = item.as_array().ok_or_else(|| ConfigError::InvalidValue {
                        field: "perspectives",
                        message: "expected an array of strings".to_string(),
                    })?;
                    cfg.perspectives = arr
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(PerspectiveName::new)
                                .ok_or_else(|| ConfigError::InvalidValue {
                                    field: "perspectives",
                                    message: "expected an array of strings".to_string(),
                                })
                        })
                        .collect::<ConfigResult<Vec<_>>>()?;
                }
                "conflictStore" => {
                    cfg.conflict_store = expect_str(item, "conflictStore")?.to_string();
                }
                "snapshotStore" => {
                    cfg.snapshot_store = expect_str(item, "snapshotStore")?.to_string();
                }
                "startMerge" => {
                    cfg.start_merge = item.as_bool().ok_or_else(|| ConfigError::InvalidValue {
                        field: "startMerge",
                        message: "expected a boolean".to_string(),
                    })?;
                }
                "tailRetry" => {
                    let ms = item.as_integer().ok_or_else(|| ConfigError::InvalidValue {
                        field: "tailRetry",
                        message: "expected an integer".to_string(),
                    })?;
                    cfg.tail_retry = Duration::from_millis(ms as u64);
                }
                "mergeTree" => {
                    // `.filter`/`.hooks`/`.hooksOpts` are recognized keys
                    // (§6) but are never TOML-representable; presence of
                    // the table itself is accepted, any non-table value
                    // under it is rejected as a malformed document rather
                    // than silently accepted.
                    if !item.is_table() {
                        return Err(ConfigError::InvalidValue {
                            field: "mergeTree",
                            message: "expected a table".to_string(),
                        });
                    }
                }
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }
        Ok(cfg)
    }
}

fn expect_str<'a>(item: &'a toml_edit::Item, field: &'static str) -> ConfigResult<&'a str> {
    item.as_str().ok_or_else(|| ConfigError::InvalidValue {
        field,
        message: "expected a string".to_string(),
    })
}

/// Programmatic builder for [`MergeTreeConfig`], for callers (typically
/// tests) that want `output_filter`/`output_hooks` set without going
/// through TOML.
#[derive(Default)]
pub struct MergeTreeConfigBuilder {
    cfg: MergeTreeConfigInner,
}

#[derive(Default)]
struct MergeTreeConfigInner {
    v_size: Option<usize>,
    perspectives: Vec<PerspectiveName>,
    conflict_store: Option<String>,
    snapshot_store: Option<String>,
    start_merge: Option<bool>,
    tail_retry: Option<Duration>,
    output_filter: Option<Arc<dyn Fn(&Record) -> bool + Send + Sync>>,
    output_hooks: Vec<Arc<dyn Transform>>,
}

impl MergeTreeConfigBuilder {
    pub fn v_size(mut self, v_size: usize) -> Self {
        self.cfg.v_size = Some(v_size);
        self
    }

    pub fn perspective(mut self, pe: impl Into<PerspectiveName>) -> Self {
        self.cfg.perspectives.push(pe.into());
        self
    }

    pub fn conflict_store(mut self, name: impl Into<String>) -> Self {
        self.cfg.conflict_store = Some(name.into());
        self
    }

    pub fn snapshot_store(mut self, name: impl Into<String>) -> Self {
        self.cfg.snapshot_store = Some(name.into());
        self
    }

    pub fn start_merge(mut self, start: bool) -> Self {
        self.cfg.start_merge = Some(start);
        self
    }

    pub fn tail_retry(mut self, retry: Duration) -> Self {
        self.cfg.tail_retry = Some(retry);
        self
    }

    pub fn output_filter(mut self, filter: Arc<dyn Fn(&Record) -> bool + Send + Sync>) -> Self {
        self.cfg.output_filter = Some(filter);
        self
    }

    pub fn output_hook(mut self, hook: Arc<dyn Transform>) -> Self {
        self.cfg.output_hooks.push(hook);
        self
    }

    pub fn build(self) -> MergeTreeConfig {
        MergeTreeConfig {
            v_size: self.cfg.v_size.unwrap_or(DEFAULT_V_SIZE),
            perspectives: self.cfg.perspectives,
            conflict_store: self.cfg.conflict_store.unwrap_or_else(|| "conflicts".to_string()),
            snapshot_store: self.cfg.snapshot_store.unwrap_or_else(|| "snapshots".to_string()),
            start_merge: self.cfg.start_merge.unwrap_or(DEFAULT_START_MERGE),
            tail_retry: self
                .cfg
                .tail_retry
                .unwrap_or(Duration::from_millis(DEFAULT_TAIL_RETRY_MS)),
            output_filter: self.cfg.output_filter,
            output_hooks: self.cfg.output_hooks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys() {
        let toml = r#"
            vSize = 8
            perspectives = ["a", "b"]
            conflictStore = "my-conflicts"
            startMerge = false
            tailRetry = 500
        "#;
        let cfg = MergeTreeConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.v_size, 8);
        assert_eq!(cfg.perspectives, vec![PerspectiveName::new("a"), PerspectiveName::new("b")]);
        assert_eq!(cfg.conflict_store, "my-conflicts");
        assert!(!cfg.start_merge);
        assert_eq!(cfg.tail_retry, Duration::from_millis(500));
    }

    #[test]
    fn rejects_unknown_keys() {
        let toml = "notAReal Key = 1\n";
        assert!(MergeTreeConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn builder_sets_every_field() {
        let cfg = MergeTreeConfig::builder()
            .v_size(10)
            .perspective("a")
            .conflict_store("c")
            .snapshot_store("s")
            .start_merge(false)
            .tail_retry(Duration::from_millis(42))
            .build();
        assert_eq!(cfg.v_size, 10);
        assert_eq!(cfg.perspectives, vec![PerspectiveName::new("a")]);
        assert_eq!(cfg.conflict_store, "c");
        assert_eq!(cfg.snapshot_store, "s");
        assert!(!cfg.start_merge);
        assert_eq!(cfg.tail_retry, Duration::from_millis(42));
    }

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = MergeTreeConfig::default();
        assert_eq!(cfg.v_size, 6);
        assert!(cfg.start_merge);
        assert_eq!(cfg.tail_retry, Duration::from_millis(1000));
    }
}
