//! Wire protocol for document synchronization.
//!
//! Every frame is one bincode-encoded [`SyncMessage`]. Each variant has a
//! stable event name (see [`SyncMessage::event_name`]) so non-Rust peers can
//! route by name.
//!
//! Versions on `text-change` are *base* versions: the document version the
//! operation applies to. `ack` carries the authority's version after the
//! acknowledged operation was applied.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::operation::{Operation, VersionedOperation};
use crate::presence::CursorColor;

/// Participant identity with display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub display_name: String,
    /// Stable hash of `user_id`, used to pick a cursor color.
    pub color_hash: u32,
}

impl ParticipantInfo {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), display_name)
    }

    /// Create with explicit user id (for testing)
    pub fn with_id(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color_hash: color_hash(user_id),
        }
    }

    pub fn color(&self) -> CursorColor {
        CursorColor::from_hash(self.color_hash)
    }
}

/// Fold a UUID into 32 bits.
pub fn color_hash(id: Uuid) -> u32 {
    let v = id.as_u128();
    (v as u32) ^ ((v >> 32) as u32) ^ ((v >> 64) as u32) ^ ((v >> 96) as u32)
}

/// Selected range, `start <= end` not enforced (backwards selections exist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub document_id: Uuid,
    pub operation: Operation,
    /// Base version the operation applies to.
    pub version: u64,
    pub origin_id: Uuid,
}

impl TextChange {
    pub fn new(document_id: Uuid, op: VersionedOperation) -> Self {
        Self {
            document_id,
            operation: op.op,
            version: op.base_version,
            origin_id: op.origin_id,
        }
    }

    pub fn versioned(&self) -> VersionedOperation {
        VersionedOperation::new(self.operation.clone(), self.version, self.origin_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionUpdate {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub selection: Selection,
}

/// Top-level protocol message, used in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Client asks to open a document; the authority answers with a snapshot.
    JoinDocument {
        document_id: Uuid,
        participant: ParticipantInfo,
    },
    LeaveDocument {
        document_id: Uuid,
        user_id: Uuid,
    },
    /// Full authoritative content, sent on join and on forced re-sync.
    DocumentSnapshot {
        document_id: Uuid,
        content: String,
        version: u64,
        participants: Vec<ParticipantInfo>,
    },
    TextChange(TextChange),
    /// The sender's in-flight operation was applied; `version` is the result.
    Ack {
        document_id: Uuid,
        version: u64,
    },
    CursorUpdate(CursorUpdate),
    SelectionUpdate(SelectionUpdate),
    UserJoinedDocument {
        document_id: Uuid,
        participant: ParticipantInfo,
    },
    UserLeftDocument {
        document_id: Uuid,
        user_id: Uuid,
    },
    UserTyping {
        document_id: Uuid,
        user_id: Uuid,
    },
    UserStoppedTyping {
        document_id: Uuid,
        user_id: Uuid,
    },
    /// The authority rejected an operation; the client must re-join.
    Resync {
        document_id: Uuid,
        reason: String,
    },
    Ping,
    Pong,
}

impl SyncMessage {
    /// Event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinDocument { .. } => "join-document",
            Self::LeaveDocument { .. } => "leave-document",
            Self::DocumentSnapshot { .. } => "document-snapshot",
            Self::TextChange(_) => "text-change",
            Self::Ack { .. } => "ack",
            Self::CursorUpdate(_) => "cursor-update",
            Self::SelectionUpdate(_) => "selection-update",
            Self::UserJoinedDocument { .. } => "user-joined-document",
            Self::UserLeftDocument { .. } => "user-left-document",
            Self::UserTyping { .. } => "user-typing",
            Self::UserStoppedTyping { .. } => "user-stopped-typing",
            Self::Resync { .. } => "resync",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Document this message concerns, if any.
    pub fn document_id(&self) -> Option<Uuid> {
        match self {
            Self::JoinDocument { document_id, .. }
            | Self::LeaveDocument { document_id, .. }
            | Self::DocumentSnapshot { document_id, .. }
            | Self::Ack { document_id, .. }
            | Self::UserJoinedDocument { document_id, .. }
            | Self::UserLeftDocument { document_id, .. }
            | Self::UserTyping { document_id, .. }
            | Self::UserStoppedTyping { document_id, .. }
            | Self::Resync { document_id, .. } => Some(*document_id),
            Self::TextChange(c) => Some(c.document_id),
            Self::CursorUpdate(c) => Some(c.document_id),
            Self::SelectionUpdate(s) => Some(s.document_id),
            Self::Ping | Self::Pong => None,
        }
    }

    /// Participant whose action this message reports, if any.
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::JoinDocument { participant, .. }
            | Self::UserJoinedDocument { participant, .. } => Some(participant.user_id),
            Self::LeaveDocument { user_id, .. }
            | Self::UserLeftDocument { user_id, .. }
            | Self::UserTyping { user_id, .. }
            | Self::UserStoppedTyping { user_id, .. } => Some(*user_id),
            Self::TextChange(c) => Some(c.origin_id),
            Self::CursorUpdate(c) => Some(c.user_id),
            Self::SelectionUpdate(s) => Some(s.user_id),
            _ => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_change_roundtrip() {
        let doc = Uuid::new_v4();
        let origin = Uuid::new_v4();
        let msg = SyncMessage::TextChange(TextChange {
            document_id: doc,
            operation: Operation::insert(5, " world"),
            version: 42,
            origin_id: origin,
        });

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.event_name(), "text-change");
        assert_eq!(decoded.document_id(), Some(doc));
        assert_eq!(decoded.user_id(), Some(origin));
    }

    #[test]
    fn test_text_change_versioned_conversion() {
        let doc = Uuid::new_v4();
        let op = VersionedOperation::new(Operation::delete(1, 2), 7, Uuid::new_v4());
        let change = TextChange::new(doc, op.clone());
        assert_eq!(change.version, 7);
        assert_eq!(change.versioned(), op);
    }

    #[test]
    fn test_snapshot_roundtrip_unicode() {
        let msg = SyncMessage::DocumentSnapshot {
            document_id: Uuid::new_v4(),
            content: "naïve 😀 text".into(),
            version: 3,
            participants: vec![ParticipantInfo::new("Alice")],
        };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_event_names() {
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        let cases = [
            (
                SyncMessage::CursorUpdate(CursorUpdate {
                    document_id: doc,
                    user_id: user,
                    position: 1,
                }),
                "cursor-update",
            ),
            (
                SyncMessage::SelectionUpdate(SelectionUpdate {
                    document_id: doc,
                    user_id: user,
                    selection: Selection { start: 1, end: 4 },
                }),
                "selection-update",
            ),
            (
                SyncMessage::UserJoinedDocument {
                    document_id: doc,
                    participant: ParticipantInfo::with_id(user, "Bob"),
                },
                "user-joined-document",
            ),
            (SyncMessage::UserLeftDocument { document_id: doc, user_id: user }, "user-left-document"),
            (SyncMessage::UserTyping { document_id: doc, user_id: user }, "user-typing"),
            (
                SyncMessage::UserStoppedTyping { document_id: doc, user_id: user },
                "user-stopped-typing",
            ),
            (SyncMessage::Ack { document_id: doc, version: 1 }, "ack"),
        ];
        for (msg, name) in cases {
            assert_eq!(msg.event_name(), name);
            assert_eq!(msg.document_id(), Some(doc));
        }
        assert_eq!(SyncMessage::Ping.document_id(), None);
    }

    #[test]
    fn test_participant_stable_color_hash() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = ParticipantInfo::with_id(id, "Test");
        let b = ParticipantInfo::with_id(id, "Other name");
        assert_eq!(a.color_hash, b.color_hash);
        assert_eq!(a.color(), b.color());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_text_change_size_efficient() {
        let msg = SyncMessage::TextChange(TextChange {
            document_id: Uuid::new_v4(),
            operation: Operation::insert(100, "x"),
            version: 1000,
            origin_id: Uuid::new_v4(),
        });
        let encoded = msg.encode().unwrap();
        // Two UUIDs dominate: 32 bytes + small varints.
        assert!(encoded.len() < 64, "encoded size {} too large", encoded.len());
    }
}
