//! Server-side authority for one document.
//!
//! The authority owns the canonical content and a bounded history of the
//! primitive operations applied to it, one version per operation. An
//! incoming operation names the version it was generated against; it is
//! transformed past everything applied since then, applied, and appended to
//! history.
//!
//! ```text
//!  text-change(base = 3)
//!        │
//!        ▼
//!  history[3..]  ──► transform_seqs ──► apply ──► history.push (v4, v5, ..)
//!                                          │
//!                                          └──► Accepted { broadcast, ack_version }
//! ```

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use uuid::Uuid;

use crate::operation::{apply_all, utf16_len, OperationError, VersionedOperation};
use crate::protocol::{ParticipantInfo, SyncMessage, TextChange};
use crate::transform::{transform_seqs, TieBreak, TransformError};

/// Reasons an incoming operation is rejected. Every variant means the
/// sender must re-synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("base version {base} is ahead of document version {current}")]
    FutureBase { base: u64, current: u64 },
    #[error("base version {base} predates retained history (oldest {oldest})")]
    StaleBase { base: u64, oldest: u64 },
    #[error("change addressed to document {got}, expected {expected}")]
    WrongDocument { expected: Uuid, got: Uuid },
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Result of applying one incoming change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// The change as applied, one entry per resulting version. Empty when
    /// concurrent edits cancelled it out.
    pub broadcast: Vec<TextChange>,
    /// Document version after the change; goes back to the sender as `ack`.
    pub ack_version: u64,
}

/// Canonical state of one document.
pub struct DocumentAuthority {
    document_id: Uuid,
    content: String,
    version: u64,
    /// `history[i]` was applied at version `version - history.len() + i`.
    history: VecDeque<VersionedOperation>,
    max_history: usize,
    participants: HashMap<Uuid, ParticipantInfo>,
}

impl DocumentAuthority {
    pub fn new(document_id: Uuid, max_history: usize) -> Self {
        Self::with_content(document_id, String::new(), max_history)
    }

    /// Start from existing content at version 0.
    pub fn with_content(document_id: Uuid, content: impl Into<String>, max_history: usize) -> Self {
        Self {
            document_id,
            content: content.into(),
            version: 0,
            history: VecDeque::new(),
            max_history: max_history.max(1),
            participants: HashMap::new(),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Oldest base version an incoming change may still name.
    pub fn oldest_base(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Transform `change` past concurrent history, apply it, and record it.
    ///
    /// On error nothing changes.
    pub fn receive(&mut self, change: &TextChange) -> Result<Accepted, AuthorityError> {
        if change.document_id != self.document_id {
            return Err(AuthorityError::WrongDocument {
                expected: self.document_id,
                got: change.document_id,
            });
        }
        if change.version > self.version {
            return Err(AuthorityError::FutureBase {
                base: change.version,
                current: self.version,
            });
        }
        let oldest = self.oldest_base();
        if change.version < oldest {
            return Err(AuthorityError::StaleBase {
                base: change.version,
                oldest,
            });
        }

        let skip = (change.version - oldest) as usize;
        let mut len = self.len_at(skip);
        let mut ops = vec![change.operation.clone()];
        for applied in self.history.iter().skip(skip) {
            let tie = TieBreak::by_origin(change.origin_id, applied.origin_id);
            let (rebased, _) = transform_seqs(&ops, std::slice::from_ref(&applied.op), len, tie)?;
            len = applied.op.resulting_len(len);
            ops = rebased;
        }

        self.content = apply_all(&self.content, &ops)?;

        let mut broadcast = Vec::with_capacity(ops.len());
        for op in ops {
            let versioned = VersionedOperation::new(op, self.version, change.origin_id);
            broadcast.push(TextChange::new(self.document_id, versioned.clone()));
            self.history.push_back(versioned);
            self.version += 1;
        }
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        log::trace!(
            "Document {} at version {} after change from {}",
            self.document_id,
            self.version,
            change.origin_id
        );
        Ok(Accepted {
            broadcast,
            ack_version: self.version,
        })
    }

    /// Document length before `history[skip..]` was applied.
    fn len_at(&self, skip: usize) -> usize {
        self.history
            .iter()
            .skip(skip)
            .rev()
            .fold(utf16_len(&self.content), |len, applied| {
                (len + applied.op.deleted_len()).saturating_sub(applied.op.inserted_len())
            })
    }

    // ── Membership ───────────────────────────────────────────────

    /// Returns `true` if the participant was not present before.
    pub fn join(&mut self, participant: ParticipantInfo) -> bool {
        self.participants.insert(participant.user_id, participant).is_none()
    }

    pub fn leave(&mut self, user_id: &Uuid) -> Option<ParticipantInfo> {
        self.participants.remove(user_id)
    }

    pub fn is_member(&self, user_id: &Uuid) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants.values().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Current state as a `document-snapshot` message.
    pub fn snapshot(&self) -> SyncMessage {
        SyncMessage::DocumentSnapshot {
            document_id: self.document_id,
            content: self.content.clone(),
            version: self.version,
            participants: self.participants(),
        }
    }
}
