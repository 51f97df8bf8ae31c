//! Snapshot diffing: turn a before/after pair of texts into operations.
//!
//! The changed region is found by trimming the longest common prefix and
//! suffix. This is O(n) and gives exactly one replaced span, which is all
//! a keystroke, paste or cut produces.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// One contiguous replacement: `deleted` units at `position` give way to
/// `inserted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splice {
    pub position: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl Splice {
    /// Lower into primitive operations.
    ///
    /// A replacement becomes Delete followed by Insert at the same offset,
    /// so the insert is valid against the post-delete content.
    pub fn into_operations(self) -> Vec<Operation> {
        let mut ops = Vec::with_capacity(2);
        if self.deleted > 0 {
            ops.push(Operation::delete(self.position, self.deleted));
        }
        if !self.inserted.is_empty() {
            ops.push(Operation::insert(self.position, self.inserted));
        }
        ops
    }
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..=0xDBFF).contains(&unit)
}

fn is_low_surrogate(unit: u16) -> bool {
    (0xDC00..=0xDFFF).contains(&unit)
}

/// Compute the single replaced region between `old` and `new`.
///
/// Returns `None` when the texts are identical.
pub fn diff(old: &str, new: &str) -> Option<Splice> {
    if old == new {
        return None;
    }

    let old16: Vec<u16> = old.encode_utf16().collect();
    let new16: Vec<u16> = new.encode_utf16().collect();
    let shortest = old16.len().min(new16.len());

    let mut prefix = old16
        .iter()
        .zip(&new16)
        .take_while(|(a, b)| a == b)
        .count();
    // Never cut a surrogate pair in half.
    if prefix > 0 && is_high_surrogate(old16[prefix - 1]) {
        prefix -= 1;
    }

    let mut suffix = old16
        .iter()
        .rev()
        .zip(new16.iter().rev())
        .take(shortest - prefix)
        .take_while(|(a, b)| a == b)
        .count();
    if suffix > 0 && is_low_surrogate(old16[old16.len() - suffix]) {
        suffix -= 1;
    }

    let deleted = old16.len() - suffix - prefix;
    let inserted = String::from_utf16_lossy(&new16[prefix..new16.len() - suffix]);

    Some(Splice {
        position: prefix,
        deleted,
        inserted,
    })
}

/// Operations that turn `old` into `new`: empty, a single Insert or Delete,
/// or Delete then Insert for a replacement.
pub fn diff_multi(old: &str, new: &str) -> Vec<Operation> {
    diff(old, new)
        .map(Splice::into_operations)
        .unwrap_or_default()
}
