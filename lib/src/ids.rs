//! Identifier types (§3): [`Version`], [`Id`], and [`PerspectiveName`], plus
//! the small amount of parsing/composition logic the spec calls "Id
//! helpers".

use std::fmt;

use rand::RngCore;

use crate::base64_util;

/// The only byte allowed to separate `store` from `key` inside an [`Id`].
pub const ID_SEPARATOR: u8 = 0x01;

/// A fixed-size, content-opaque version tag (§3). Equality and ordering are
/// by byte content. The empty version is never constructed — see
/// [`Version::new`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(Vec<u8>);

impl Version {
    /// Wraps raw bytes as a `Version`. Returns `None` for the empty version,
    /// which §3 disallows.
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() { None } else { Some(Self(bytes)) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64 text form, matching the default "8 base64 characters ≡ 6
    /// bytes" presentation of §3.
    pub fn to_base64(&self) -> String {
        base64_util::encode(&self.0)
    }

    /// Parses a base64-encoded version. Returns `None` if decoding fails or
    /// the result is empty.
    pub fn from_base64(s: &str) -> Option<Self> {
        base64_util::decode(s).and_then(Self::new)
    }

    /// Generates a fresh random version of `v_size` bytes using `rng`. The
    /// caller is responsible for the collision-retry policy of §4.3 — this
    /// function only draws bytes.
    pub fn generate(rng: &mut impl RngCore, v_size: usize) -> Self {
        let mut bytes = vec![0u8; v_size];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.to_base64())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// An opaque item identifier (§3). When composed of `store` and `key`, the
/// two are joined by [`ID_SEPARATOR`], the only byte `store` may not itself
/// contain.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Vec<u8>);

#[derive(Debug, thiserror::Error)]
#[error("store name contains the id separator byte")]
pub struct InvalidStoreName;

impl Id {
    /// Wraps an already-composed byte string as an `Id` verbatim.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Composes `<store>\x01<key>`. Fails if `store` itself contains the
    /// separator byte.
    pub fn compose(store: &str, key: &[u8]) -> Result<Self, InvalidStoreName> {
        if store.as_bytes().contains(&ID_SEPARATOR) {
            return Err(InvalidStoreName);
        }
        let mut bytes = Vec::with_capacity(store.len() + 1 + key.len());
        bytes.extend_from_slice(store.as_bytes());
        bytes.push(ID_SEPARATOR);
        bytes.extend_from_slice(key);
        Ok(Self(bytes))
    }

    /// Splits a composed id back into `(store, key)`, if it contains the
    /// separator byte.
    pub fn split(&self) -> Option<(&str, &[u8])> {
        let pos = self.0.iter().position(|&b| b == ID_SEPARATOR)?;
        let store = std::str::from_utf8(&self.0[..pos]).ok()?;
        Some((store, &self.0[pos + 1..]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.split() {
            Some((store, key)) => write!(f, "Id({store:?}\\x01{})", String::from_utf8_lossy(key)),
            None => write!(f, "Id({:?})", String::from_utf8_lossy(&self.0)),
        }
    }
}

/// The name of a remote participant, as carried in `h.pe` and used to key
/// the per-remote [`crate::tree::Tree`]s inside a `MergeTree`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PerspectiveName(String);

impl PerspectiveName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PerspectiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PerspectiveName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PerspectiveName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// The 1-based, dense, strictly monotonic insertion counter of §3 (`h.i`).
pub type InsertionCounter = u64;
