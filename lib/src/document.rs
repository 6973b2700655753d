//! The application payload model (`b` in §3) and its on-disk codec.
//!
//! The spec treats the body as an "opaque application payload", but the
//! merge engine (§4.3) needs structural access to it at key granularity —
//! "the key-sets of `a.b`, `lhead.b`, `rhead.b`" — so the core models it one
//! level deep as a string-keyed map of otherwise-opaque values, and compares
//! values deeper than that only by equality, never by interpretation.
//!
//! §6 only requires that "encoding is total and round-trips bytewise"; it
//! does not mandate wire compatibility with any particular format, so this
//! module hand-rolls a small deterministic tag-length-value encoding rather
//! than pulling in a schema-flexible serializer whose canonical-form
//! guarantees would need auditing.

use std::collections::BTreeMap;
use std::fmt;

/// One field of a [`Document`]. Recursive structure is supported, but only
/// ever compared by equality — the core never interprets what a value
/// "means".
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Map(Document),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bytes(b) => write!(f, "bytes({})", b.len()),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(doc) => fmt::Debug::fmt(doc, f),
        }
    }
}

/// The record body: a string-keyed, opaque-valued document.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Document(BTreeMap<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serializes into the on-disk tag-length-value encoding. Total: every
    /// `Document` encodes to some byte string.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(&Value::Map(self.clone()), &mut out);
        out
    }

    /// Decodes a `Document` previously produced by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0usize;
        let value = decode_value(bytes, &mut cursor)?;
        if cursor != bytes.len() {
            return Err(DecodeError::TrailingBytes);
        }
        match value {
            Value::Map(doc) => Ok(doc),
            _ => Err(DecodeError::NotAMap),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    Eof,
    #[error("unknown value tag {0}")]
    UnknownTag(u8),
    #[error("invalid UTF-8 string field")]
    InvalidUtf8,
    #[error("trailing bytes after decoding value")]
    TrailingBytes,
    #[error("top-level value must be a map")]
    NotAMap,
}

const TAG_NULL: u8 = 0;
const TAG_BOOL_FALSE: u8 = 1;
const TAG_BOOL_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_BOOL_FALSE),
        Value::Bool(true) => out.push(TAG_BOOL_TRUE),
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Bytes(bytes) => {
            out.push(TAG_BYTES);
            encode_len(bytes.len(), out);
            out.extend_from_slice(bytes);
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            encode_len(s.len(), out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            encode_len(items.len(), out);
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Map(doc) => {
            out.push(TAG_MAP);
            encode_len(doc.0.len(), out);
            // BTreeMap iterates in key order, so this is deterministic.
            for (key, value) in &doc.0 {
                encode_len(key.len(), out);
                out.extend_from_slice(key.as_bytes());
                encode_value(value, out);
            }
        }
    }
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn decode_len(bytes: &[u8], cursor: &mut usize) -> Result<usize, DecodeError> {
    let end = *cursor + 8;
    let slice = bytes.get(*cursor..end).ok_or(DecodeError::Eof)?;
    *cursor = end;
    Ok(u64::from_be_bytes(slice.try_into().unwrap()) as usize)
}

fn decode_value(bytes: &[u8], cursor: &mut usize) -> Result<Value, DecodeError> {
    let tag = *bytes.get(*cursor).ok_or(DecodeError::Eof)?;
    *cursor += 1;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL_FALSE => Ok(Value::Bool(false)),
        TAG_BOOL_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            let end = *cursor + 8;
            let slice = bytes.get(*cursor..end).ok_or(DecodeError::Eof)?;
            *cursor = end;
            Ok(Value::Int(i64::from_be_bytes(slice.try_into().unwrap())))
        }
        TAG_BYTES => {
            let len = decode_len(bytes, cursor)?;
            let end = *cursor + len;
            let slice = bytes.get(*cursor..end).ok_or(DecodeError::Eof)?;
            *cursor = end;
            Ok(Value::Bytes(slice.to_vec()))
        }
        TAG_STR => {
            let len = decode_len(bytes, cursor)?;
            let end = *cursor + len;
            let slice = bytes.get(*cursor..end).ok_or(DecodeError::Eof)?;
            *cursor = end;
            let s = std::str::from_utf8(slice).map_err(|_| DecodeError::InvalidUtf8)?;
            Ok(Value::Str(s.to_string()))
        }
        TAG_LIST => {
            let len = decode_len(bytes, cursor)?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_value(bytes, cursor)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let len = decode_len(bytes, cursor)?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key_len = decode_len(bytes, cursor)?;
                let end = *cursor + key_len;
                let slice = bytes.get(*cursor..end).ok_or(DecodeError::Eof)?;
                *cursor = end;
                let key = std::str::from_utf8(slice)
                    .map_err(|_| DecodeError::InvalidUtf8)?
                    .to_string();
                let value = decode_value(bytes, cursor)?;
                map.insert(key, value);
            }
            Ok(Value::Map(Document(map)))
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}
