//! Atomic text edits and their application semantics.
//!
//! Offsets and lengths are measured in UTF-16 code units, the unit a browser
//! text area reports for `selectionStart` and `selectionEnd`. Content is kept
//! as a Rust `String`; conversion to byte offsets happens at apply time.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single text edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Splice `text` in at `position`.
    Insert { position: usize, text: String },
    /// Remove `length` units starting at `position`.
    Delete { position: usize, length: usize },
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            Self::Insert { position, .. } | Self::Delete { position, .. } => *position,
        }
    }

    /// Units of the base document this operation consumes (zero for inserts).
    pub fn deleted_len(&self) -> usize {
        match self {
            Self::Insert { .. } => 0,
            Self::Delete { length, .. } => *length,
        }
    }

    /// Units this operation adds to the document (zero for deletes).
    pub fn inserted_len(&self) -> usize {
        match self {
            Self::Insert { text, .. } => utf16_len(text),
            Self::Delete { .. } => 0,
        }
    }

    /// First offset past the region of the base document this operation reads.
    pub fn end(&self) -> usize {
        self.position() + self.deleted_len()
    }

    /// Minimum base document length this operation can be applied to.
    pub fn required_len(&self) -> usize {
        self.end()
    }

    /// Length of a document of `base_len` units after applying this operation.
    pub fn resulting_len(&self, base_len: usize) -> usize {
        base_len + self.inserted_len() - self.deleted_len().min(base_len)
    }

    /// Empty inserts and zero-length deletes change nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { length, .. } => *length == 0,
        }
    }

    /// Apply this operation to `content`. See [`apply`].
    pub fn apply(&self, content: &str) -> Result<String, OperationError> {
        apply(content, self)
    }
}

/// An operation tagged with the document version it was generated against
/// and the participant that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedOperation {
    pub op: Operation,
    pub base_version: u64,
    pub origin_id: Uuid,
}

impl VersionedOperation {
    pub fn new(op: Operation, base_version: u64, origin_id: Uuid) -> Self {
        Self {
            op,
            base_version,
            origin_id,
        }
    }
}

/// Errors raised while applying an operation.
///
/// Any of these means the replica's version bookkeeping has drifted from the
/// authority; the owning session must re-synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("offset {offset} is out of range for a document of length {len}")]
    OutOfRange { offset: usize, len: usize },
}

/// Apply `op` to `content`, returning the new content.
///
/// Pure: `content` is never modified, so a failed apply leaves nothing
/// half-applied. Offsets landing inside a surrogate pair are out of range.
pub fn apply(content: &str, op: &Operation) -> Result<String, OperationError> {
    match op {
        Operation::Insert { position, text } => {
            let at = byte_offset(content, *position)?;
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            Ok(out)
        }
        Operation::Delete { position, length } => {
            let start = byte_offset(content, *position)?;
            let end = byte_offset(content, position + length)?;
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Ok(out)
        }
    }
}

/// Apply a sequence of operations in order.
pub fn apply_all<'a, I>(content: &str, ops: I) -> Result<String, OperationError>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut current = content.to_owned();
    for op in ops {
        current = apply(&current, op)?;
    }
    Ok(current)
}

/// Length of `s` in UTF-16 code units.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Convert a UTF-16 offset into a byte offset into `s`.
pub(crate) fn byte_offset(s: &str, offset: usize) -> Result<usize, OperationError> {
    let mut units = 0;
    for (idx, ch) in s.char_indices() {
        if units == offset {
            return Ok(idx);
        }
        units += ch.len_utf16();
        if units > offset {
            break;
        }
    }
    if units == offset {
        return Ok(s.len());
    }
    Err(OperationError::OutOfRange {
        offset,
        len: utf16_len(s),
    })
}
