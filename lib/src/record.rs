//! The persisted record: [`Header`] plus an opaque body and optional
//! metadata (§3), and its on-disk serialization.
//!
//! §6 only requires that the format be total and round-trip bytewise; this
//! module defines one such format, built out of the same primitives as
//! [`crate::document`].

use crate::document::Document;
use crate::header::Header;
use crate::ids::{Id, InsertionCounter, PerspectiveName, Version};

/// A fully formed record: header, application body, and adapter-supplied
/// metadata that the core never interprets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub header: Header,
    pub body: Document,
    pub metadata: Option<Document>,
}

impl Record {
    pub fn new(header: Header, body: Document) -> Self {
        Self { header, body, metadata: None }
    }

    pub fn with_metadata(mut self, metadata: Document) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> &Id {
        &self.header.id
    }

    pub fn version(&self) -> &Version {
        &self.header.v
    }

    pub fn parents(&self) -> &[Version] {
        &self.header.pa
    }

    pub fn perspective(&self) -> Option<&PerspectiveName> {
        self.header.pe.as_ref()
    }

    pub fn insertion(&self) -> Option<InsertionCounter> {
        self.header.i
    }

    /// Serializes header + body + metadata. Total: every well-formed
    /// `Record` encodes to some byte string.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_bytes(&mut out, self.header.id.as_bytes());
        write_bytes(&mut out, self.header.v.as_bytes());
        write_len(&mut out, self.header.pa.len());
        for p in &self.header.pa {
            write_bytes(&mut out, p.as_bytes());
        }
        match &self.header.pe {
            Some(pe) => {
                out.push(1);
                write_bytes(&mut out, pe.as_str().as_bytes());
            }
            None => out.push(0),
        }
        match self.header.i {
            Some(i) => {
                out.push(1);
                out.extend_from_slice(&i.to_be_bytes());
            }
            None => out.push(0),
        }
        out.push(u8::from(self.header.d));
        out.push(u8::from(self.header.c));

        let body_bytes = self.body.encode();
        write_bytes(&mut out, &body_bytes);

        match &self.metadata {
            Some(meta) => {
                out.push(1);
                write_bytes(&mut out, &meta.encode());
            }
            None => out.push(0),
        }
        out
    }

    /// Decodes a `Record` previously produced by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        let mut c = 0usize;
        let id = Id::from_bytes(read_bytes(bytes, &mut c)?);
        let v = Version::new(read_bytes(bytes, &mut c)?.to_vec())
            .ok_or(RecordDecodeError::EmptyVersion)?;
        let pa_len = read_len(bytes, &mut c)?;
        let mut pa = Vec::with_capacity(pa_len);
        for _ in 0..pa_len {
            let bytes = read_bytes(bytes, &mut c)?.to_vec();
            pa.push(Version::new(bytes).ok_or(RecordDecodeError::EmptyVersion)?);
        }
        let has_pe = read_u8(bytes, &mut c)?;
        let pe = if has_pe == 1 {
            let s = std::str::from_utf8(read_bytes(bytes, &mut c)?)
                .map_err(|_| RecordDecodeError::InvalidUtf8)?;
            Some(PerspectiveName::new(s))
        } else {
            None
        };
        let has_i = read_u8(bytes, &mut c)?;
        let i = if has_i == 1 {
            let end = c + 8;
            let slice = bytes.get(c..end).ok_or(RecordDecodeError::Eof)?;
            c = end;
            Some(u64::from_be_bytes(slice.try_into().unwrap()))
        } else {
            None
        };
        let d = read_u8(bytes, &mut c)? == 1;
        let conflict = read_u8(bytes, &mut c)? == 1;

        let body_bytes = read_bytes(bytes, &mut c)?;
        let body = Document::decode(body_bytes).map_err(RecordDecodeError::Body)?;

        let has_meta = read_u8(bytes, &mut c)?;
        let metadata = if has_meta == 1 {
            let meta_bytes = read_bytes(bytes, &mut c)?;
            Some(Document::decode(meta_bytes).map_err(RecordDecodeError::Body)?)
        } else {
            None
        };

        if c != bytes.len() {
            return Err(RecordDecodeError::TrailingBytes);
        }

        Ok(Self {
            header: Header { id, v, pa, pe, i, d, c: conflict },
            body,
            metadata,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordDecodeError {
    #[error("unexpected end of buffer")]
    Eof,
    #[error("version must not be empty")]
    EmptyVersion,
    #[error("invalid UTF-8 in perspective name")]
    InvalidUtf8,
    #[error("trailing bytes after decoding record")]
    TrailingBytes,
    #[error(transparent)]
    Body(crate::document::DecodeError),
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn read_len(bytes: &[u8], c: &mut usize) -> Result<usize, RecordDecodeError> {
    let end = *c + 8;
    let slice = bytes.get(*c..end).ok_or(RecordDecodeError::Eof)?;
    *c = end;
    Ok(u64::from_be_bytes(slice.try_into().unwrap()) as usize)
}

fn read_bytes<'a>(bytes: &'a [u8], c: &mut usize) -> Result<&'a [u8], RecordDecodeError> {
    let len = read_len(bytes, c)?;
    let end = *c + len;
    let slice = bytes.get(*c..end).ok_or(RecordDecodeError::Eof)?;
    *c = end;
    Ok(slice)
}

fn read_u8(bytes: &[u8], c: &mut usize) -> Result<u8, RecordDecodeError> {
    let b = *bytes.get(*c).ok_or(RecordDecodeError::Eof)?;
    *c += 1;
    Ok(b)
}
