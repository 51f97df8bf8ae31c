//! Operational transform for concurrent text edits.
//!
//! Given two operations generated against the same base document,
//! [`transform_pair`] rewrites each so it can be applied after the other and
//! both application orders produce the same text (TP1). [`transform_seqs`]
//! lifts this to sequences; the client session and the authority both use it.
//!
//! Split policy: when an insert lands strictly inside a concurrently deleted
//! range, the delete is split around the inserted text, so the insert
//! survives on every replica.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems"

use thiserror::Error;
use uuid::Uuid;

use crate::operation::Operation;

/// Order for two concurrent inserts at the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// The left-hand operation's insert lands first.
    LeftFirst,
    /// The right-hand operation's insert lands first.
    RightFirst,
}

impl TieBreak {
    /// Lower origin id goes first. Equal ids fall back to the left side.
    pub fn by_origin(left: Uuid, right: Uuid) -> Self {
        if left <= right {
            Self::LeftFirst
        } else {
            Self::RightFirst
        }
    }

    fn left_first(self) -> bool {
        self == Self::LeftFirst
    }
}

/// Transform inputs that cannot share the base they claim to share.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("{op:?} needs {required} units but its base document has {base_len}")]
    Conflict {
        op: Operation,
        required: usize,
        base_len: usize,
    },
}

fn check_bounds(op: &Operation, base_len: usize) -> Result<(), TransformError> {
    let required = op.required_len();
    if required > base_len {
        return Err(TransformError::Conflict {
            op: op.clone(),
            required,
            base_len,
        });
    }
    Ok(())
}

/// Rewrite `op` so it applies after `applied`. `op_first` decides insert ties.
///
/// Both operations must already be validated against the same base.
fn rewrite(op: &Operation, applied: &Operation, op_first: bool) -> Vec<Operation> {
    if op.is_noop() {
        return Vec::new();
    }
    if applied.is_noop() {
        return vec![op.clone()];
    }

    let rewritten = match (op, applied) {
        (
            Operation::Insert { position, text },
            Operation::Insert {
                position: other, ..
            },
        ) => {
            if *position < *other || (*position == *other && op_first) {
                vec![op.clone()]
            } else {
                vec![Operation::insert(position + applied.inserted_len(), text.clone())]
            }
        }

        (
            Operation::Insert { position, text },
            Operation::Delete {
                position: del_pos,
                length,
            },
        ) => {
            if *position <= *del_pos {
                vec![op.clone()]
            } else if *position >= del_pos + length {
                vec![Operation::insert(position - length, text.clone())]
            } else {
                // Inserted inside the deleted range: collapse to its start.
                vec![Operation::insert(*del_pos, text.clone())]
            }
        }

        (
            Operation::Delete { position, length },
            Operation::Insert {
                position: ins_pos, ..
            },
        ) => {
            let inserted = applied.inserted_len();
            let end = position + length;
            if *ins_pos <= *position {
                vec![Operation::delete(position + inserted, *length)]
            } else if *ins_pos >= end {
                vec![op.clone()]
            } else {
                // Back-to-front so the second delete's offset is still valid.
                vec![
                    Operation::delete(ins_pos + inserted, end - ins_pos),
                    Operation::delete(*position, ins_pos - position),
                ]
            }
        }

        (
            Operation::Delete { position, length },
            Operation::Delete {
                position: other,
                length: other_len,
            },
        ) => {
            let end = position + length;
            let other_end = other + other_len;
            let removed_before = position.saturating_sub(*other).min(*other_len);
            let overlap = end.min(other_end).saturating_sub((*position).max(*other));
            vec![Operation::delete(position - removed_before, length - overlap)]
        }
    };

    rewritten.into_iter().filter(|o| !o.is_noop()).collect()
}

/// Rewrite `op` so it applies after `applied`; both were generated against a
/// document of `base_len` units. `tie` orders `op` (left) against `applied`
/// (right) when both insert at the same offset.
///
/// The result is empty when `op` no longer has any effect, and holds two
/// deletes when `op` is a delete split around `applied`'s inserted text.
pub fn transform(
    op: &Operation,
    applied: &Operation,
    base_len: usize,
    tie: TieBreak,
) -> Result<Vec<Operation>, TransformError> {
    check_bounds(op, base_len)?;
    check_bounds(applied, base_len)?;
    Ok(rewrite(op, applied, tie.left_first()))
}

/// Symmetric transform: returns `(left', right')` where `left'` applies after
/// `right` and `right'` applies after `left`.
pub fn transform_pair(
    left: &Operation,
    right: &Operation,
    base_len: usize,
    tie: TieBreak,
) -> Result<(Vec<Operation>, Vec<Operation>), TransformError> {
    check_bounds(left, base_len)?;
    check_bounds(right, base_len)?;
    Ok((
        rewrite(left, right, tie.left_first()),
        rewrite(right, left, !tie.left_first()),
    ))
}

/// Transform two concurrent operation sequences against each other.
///
/// `left` and `right` each apply, in order, to the same base document of
/// `base_len` units. Returns `(left', right')` such that
/// `right ; left'` and `left ; right'` produce the same text.
pub fn transform_seqs(
    left: &[Operation],
    right: &[Operation],
    base_len: usize,
    tie: TieBreak,
) -> Result<(Vec<Operation>, Vec<Operation>), TransformError> {
    match (left.len(), right.len()) {
        (0, _) => Ok((Vec::new(), right.to_vec())),
        (_, 0) => Ok((left.to_vec(), Vec::new())),
        (1, 1) => transform_pair(&left[0], &right[0], base_len, tie),
        (1, _) => {
            let (left_past_head, head) = transform_pair(&left[0], &right[0], base_len, tie)?;
            let after_head = right[0].resulting_len(base_len);
            let (left_out, mut tail) = transform_seqs(&left_past_head, &right[1..], after_head, tie)?;
            let mut right_out = head;
            right_out.append(&mut tail);
            Ok((left_out, right_out))
        }
        _ => {
            let (head, right_past_head) = transform_seqs(&left[..1], right, base_len, tie)?;
            let after_head = left[0].resulting_len(base_len);
            let (mut tail, right_out) = transform_seqs(&left[1..], &right_past_head, after_head, tie)?;
            let mut left_out = head;
            left_out.append(&mut tail);
            Ok((left_out, right_out))
        }
    }
}

/// Shift a caret offset across an applied operation.
///
/// `stick_after` keeps the caret after text inserted exactly at it; use it
/// when the caret belongs to the operation's author.
pub fn transform_index(index: usize, op: &Operation, stick_after: bool) -> usize {
    match op {
        Operation::Insert { position, .. } => {
            if index > *position || (index == *position && stick_after) {
                index + op.inserted_len()
            } else {
                index
            }
        }
        Operation::Delete { position, length } => {
            if index >= position + length {
                index - length
            } else if index > *position {
                *position
            } else {
                index
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{apply, apply_all, utf16_len};

    const BASE: &str = "abcd";

    /// Every non-trivial operation on a document of length `len`.
    fn all_ops(len: usize) -> Vec<Operation> {
        let mut ops = Vec::new();
        for pos in 0..=len {
            ops.push(Operation::insert(pos, "X"));
            ops.push(Operation::insert(pos, "YZ"));
            for l in 1..=(len - pos) {
                ops.push(Operation::delete(pos, l));
            }
        }
        ops
    }

    fn assert_converges(base: &str, left: &Operation, right: &Operation, tie: TieBreak) {
        let len = utf16_len(base);
        let (left_t, right_t) = transform_pair(left, right, len, tie).unwrap();
        let via_left = apply_all(&apply(base, left).unwrap(), &right_t).unwrap();
        let via_right = apply_all(&apply(base, right).unwrap(), &left_t).unwrap();
        assert_eq!(
            via_left, via_right,
            "diverged on {left:?} / {right:?} ({tie:?}): {left_t:?} / {right_t:?}"
        );
    }

    #[test]
    fn test_convergence_exhaustive_pairs() {
        let ops = all_ops(utf16_len(BASE));
        for left in &ops {
            for right in &ops {
                assert_converges(BASE, left, right, TieBreak::LeftFirst);
                assert_converges(BASE, left, right, TieBreak::RightFirst);
            }
        }
    }

    #[test]
    fn test_insert_insert_shift() {
        let a = Operation::insert(1, "AA");
        let b = Operation::insert(3, "B");
        assert_eq!(transform(&b, &a, 4, TieBreak::RightFirst).unwrap(), vec![Operation::insert(5, "B")]);
        assert_eq!(transform(&a, &b, 4, TieBreak::RightFirst).unwrap(), vec![a.clone()]);
    }

    #[test]
    fn test_insert_insert_tie_break() {
        let a = Operation::insert(2, "A");
        let b = Operation::insert(2, "B");
        let (a_t, b_t) = transform_pair(&a, &b, 4, TieBreak::LeftFirst).unwrap();
        assert_eq!(a_t, vec![Operation::insert(2, "A")]);
        assert_eq!(b_t, vec![Operation::insert(3, "B")]);
        assert_eq!(apply_all("abcd", &[a, b_t[0].clone()]).unwrap(), "abABcd");
    }

    #[test]
    fn test_transform_honours_tie_break() {
        let op = Operation::insert(2, "A");
        let applied = Operation::insert(2, "BB");
        assert_eq!(transform(&op, &applied, 4, TieBreak::LeftFirst).unwrap(), vec![op.clone()]);
        assert_eq!(
            transform(&op, &applied, 4, TieBreak::RightFirst).unwrap(),
            vec![Operation::insert(4, "A")]
        );
    }

    #[test]
    fn test_tie_break_by_origin() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        assert_eq!(TieBreak::by_origin(low, high), TieBreak::LeftFirst);
        assert_eq!(TieBreak::by_origin(high, low), TieBreak::RightFirst);
        assert_eq!(TieBreak::by_origin(low, low), TieBreak::LeftFirst);
    }

    #[test]
    fn test_delete_shifted_by_earlier_insert() {
        let ins = Operation::insert(0, "xx");
        let del = Operation::delete(1, 2);
        assert_eq!(transform(&del, &ins, 4, TieBreak::RightFirst).unwrap(), vec![Operation::delete(3, 2)]);
    }

    #[test]
    fn test_delete_unchanged_by_later_insert() {
        let ins = Operation::insert(3, "xx");
        let del = Operation::delete(1, 2);
        assert_eq!(transform(&del, &ins, 4, TieBreak::RightFirst).unwrap(), vec![del.clone()]);
    }

    #[test]
    fn test_split_policy_delete_side() {
        // "abcdefgh": delete "cdef" while someone types "XY" between d and e.
        let ins = Operation::insert(4, "XY");
        let del = Operation::delete(2, 4);
        let del_t = transform(&del, &ins, 8, TieBreak::RightFirst).unwrap();
        assert_eq!(del_t, vec![Operation::delete(6, 2), Operation::delete(2, 2)]);

        let after_insert = apply("abcdefgh", &ins).unwrap();
        assert_eq!(apply_all(&after_insert, &del_t).unwrap(), "abXYgh");
    }

    #[test]
    fn test_split_policy_insert_side() {
        let ins = Operation::insert(4, "XY");
        let del = Operation::delete(2, 4);
        let ins_t = transform(&ins, &del, 8, TieBreak::RightFirst).unwrap();
        assert_eq!(ins_t, vec![Operation::insert(2, "XY")]);

        let after_delete = apply("abcdefgh", &del).unwrap();
        assert_eq!(apply_all(&after_delete, &ins_t).unwrap(), "abXYgh");
    }

    #[test]
    fn test_overlapping_deletes_converge() {
        // Deletes of [2,5) and [3,6) on "abcdefgh".
        let a = Operation::delete(2, 3);
        let b = Operation::delete(3, 3);
        let (a_t, b_t) = transform_pair(&a, &b, 8, TieBreak::LeftFirst).unwrap();
        assert_eq!(a_t, vec![Operation::delete(2, 1)]);
        assert_eq!(b_t, vec![Operation::delete(2, 1)]);

        let left = apply_all(&apply("abcdefgh", &a).unwrap(), &b_t).unwrap();
        let right = apply_all(&apply("abcdefgh", &b).unwrap(), &a_t).unwrap();
        assert_eq!(left, "abgh");
        assert_eq!(right, "abgh");
    }

    #[test]
    fn test_covered_delete_vanishes() {
        let outer = Operation::delete(1, 5);
        let inner = Operation::delete(2, 2);
        assert!(transform(&inner, &outer, 8, TieBreak::RightFirst).unwrap().is_empty());
        assert_eq!(
            transform(&outer, &inner, 8, TieBreak::RightFirst).unwrap(),
            vec![Operation::delete(1, 3)]
        );
    }

    #[test]
    fn test_noop_inputs() {
        let noop = Operation::insert(1, "");
        let del = Operation::delete(0, 2);
        assert!(transform(&noop, &del, 4, TieBreak::RightFirst).unwrap().is_empty());
        assert_eq!(transform(&del, &noop, 4, TieBreak::RightFirst).unwrap(), vec![del.clone()]);
    }

    #[test]
    fn test_conflict_on_out_of_bounds_input() {
        let ins = Operation::insert(9, "x");
        let del = Operation::delete(0, 1);
        let err = transform(&ins, &del, 4, TieBreak::RightFirst).unwrap_err();
        assert!(matches!(err, TransformError::Conflict { required: 9, base_len: 4, .. }));

        let long_del = Operation::delete(2, 5);
        assert!(transform_pair(&ins, &long_del, 20, TieBreak::LeftFirst).is_ok());
        assert!(transform_pair(&del, &long_del, 4, TieBreak::LeftFirst).is_err());
    }

    #[test]
    fn test_scenario_prepend_against_append() {
        // Local appends " world" while a peer prepends "say ".
        let local = Operation::insert(5, " world");
        let remote = Operation::insert(0, "say ");
        let (remote_t, local_t) = transform_pair(&remote, &local, 5, TieBreak::LeftFirst).unwrap();
        assert_eq!(remote_t, vec![Operation::insert(0, "say ")]);
        assert_eq!(local_t, vec![Operation::insert(9, " world")]);

        let at_local = apply_all(&apply("hello", &local).unwrap(), &remote_t).unwrap();
        let at_remote = apply_all(&apply("hello", &remote).unwrap(), &local_t).unwrap();
        assert_eq!(at_local, "say hello world");
        assert_eq!(at_remote, "say hello world");
    }

    /// Small deterministic generator so sequence tests need no extra crates.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 33) as usize) % bound.max(1)
        }

        fn op(&mut self, len: usize) -> Operation {
            let pos = self.next(len + 1);
            if len > pos && self.next(2) == 0 {
                Operation::delete(pos, 1 + self.next(len - pos))
            } else {
                let texts = ["x", "yy", "é", "q"];
                Operation::insert(pos, texts[self.next(texts.len())])
            }
        }

        fn seq(&mut self, base: &str, count: usize) -> Vec<Operation> {
            let mut doc = base.to_owned();
            let mut ops = Vec::new();
            for _ in 0..count {
                let op = self.op(utf16_len(&doc));
                doc = apply(&doc, &op).unwrap();
                ops.push(op);
            }
            ops
        }
    }

    #[test]
    fn test_sequence_convergence() {
        let base = "the quick brown fox";
        let len = utf16_len(base);
        let mut rng = Lcg(7);
        for round in 0..300 {
            let left = rng.seq(base, 1 + round % 4);
            let right = rng.seq(base, 1 + (round / 4) % 4);
            for tie in [TieBreak::LeftFirst, TieBreak::RightFirst] {
                let (left_t, right_t) = transform_seqs(&left, &right, len, tie).unwrap();
                let via_left = apply_all(&apply_all(base, &left).unwrap(), &right_t).unwrap();
                let via_right = apply_all(&apply_all(base, &right).unwrap(), &left_t).unwrap();
                assert_eq!(via_left, via_right, "left {left:?} right {right:?}");
            }
        }
    }

    #[test]
    fn test_transform_index_insert() {
        let op = Operation::insert(3, "ab");
        assert_eq!(transform_index(1, &op, false), 1);
        assert_eq!(transform_index(3, &op, false), 3);
        assert_eq!(transform_index(3, &op, true), 5);
        assert_eq!(transform_index(7, &op, false), 9);
    }

    #[test]
    fn test_transform_index_delete() {
        let op = Operation::delete(2, 3);
        assert_eq!(transform_index(1, &op, false), 1);
        assert_eq!(transform_index(2, &op, false), 2);
        assert_eq!(transform_index(4, &op, false), 2);
        assert_eq!(transform_index(5, &op, false), 2);
        assert_eq!(transform_index(8, &op, false), 5);
    }
}
