//! The mandatory record header (§3) and its schema validation.

use crate::error::TreeError;
use crate::ids::{Id, InsertionCounter, PerspectiveName, Version};

/// Mandatory header carried by every record (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub id: Id,
    pub v: Version,
    /// Parent versions. Empty = root, one = linear update, two = merge.
    /// Lengths ≥3 are structurally permitted but the merge engine (§4.3)
    /// only supports ≤2.
    pub pa: Vec<Version>,
    /// Set iff this record was produced by a remote perspective.
    pub pe: Option<PerspectiveName>,
    /// 1-based insertion counter within the tree that stores this record.
    /// `None` until the record has been appended to a [`crate::tree::Tree`].
    pub i: Option<InsertionCounter>,
    /// True iff this version tombstones the item.
    pub d: bool,
    /// True iff this version is a stored conflict.
    pub c: bool,
}

impl Header {
    /// Constructs a header for a record not yet appended to any tree (`i`
    /// unset).
    pub fn new(id: Id, v: Version, pa: Vec<Version>) -> Self {
        Self { id, v, pa, pe: None, i: None, d: false, c: false }
    }

    pub fn with_perspective(mut self, pe: PerspectiveName) -> Self {
        self.pe = Some(pe);
        self
    }

    pub fn with_deleted(mut self, d: bool) -> Self {
        self.d = d;
        self
    }

    pub fn with_conflict(mut self, c: bool) -> Self {
        self.c = c;
        self
    }

    pub fn is_root(&self) -> bool {
        self.pa.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.pa.len() >= 2
    }

    /// Header schema validation (§7 `InvalidHeader`). Checks structural
    /// well-formedness only; parent existence is a [`crate::tree::Tree`]
    /// concern (it needs the tree to resolve `pa` entries) and is reported
    /// separately as `UnknownParent`.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.id.as_bytes().is_empty() {
            return Err(TreeError::InvalidHeader("id must not be empty".to_string()));
        }
        if self.pa.iter().any(|p| p == &self.v) {
            return Err(TreeError::InvalidHeader(
                "a record cannot be its own parent".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if !self.pa.iter().all(|p| seen.insert(p)) {
            return Err(TreeError::InvalidHeader("duplicate parent version".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(b: u8) -> Version {
        Version::new(vec![b; 6]).unwrap()
    }

    #[test]
    fn root_header_is_valid() {
        let h = Header::new(Id::compose("x", b"k").unwrap(), v(1), vec![]);
        assert!(h.validate().is_ok());
        assert!(h.is_root());
    }

    #[test]
    fn rejects_self_parent() {
        let h = Header::new(Id::compose("x", b"k").unwrap(), v(1), vec![v(1)]);
        assert!(h.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_parents() {
        let h = Header::new(Id::compose("x", b"k").unwrap(), v(3), vec![v(1), v(1)]);
        assert!(h.validate().is_err());
    }
}
