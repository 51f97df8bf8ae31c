//! # orbit-collab: real-time collaborative text editing for OrbitOS
//!
//! Keeps every participant's copy of a plain-text document convergent under
//! concurrent edits, using server-mediated operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌───────────────────┐
//! │ SyncClient       │ ◄────────────────► │ SyncServer        │
//! │  DocumentSession │   bincode frames   │  DocumentAuthority│
//! │  (replica)       │                    │  (canonical)      │
//! └────────┬─────────┘                    └─────────┬─────────┘
//!          │                                        │
//!          ▼                                        ▼
//! ┌──────────────────┐                    ┌───────────────────┐
//! │ diff → Operation │                    │ BroadcastGroup    │
//! │ transform_seqs   │                    │ (ordered fan-out) │
//! └──────────────────┘                    └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Insert/Delete operations and their application
//! - [`diff`]: Minimal splice between two texts
//! - [`transform`]: Concurrent operation transformation
//! - [`session`]: Client replica with in-flight/buffered edits
//! - [`authority`]: Canonical document with transform history
//! - [`presence`]: Participants, remote cursors and typing state
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`]: Outbound message adapters (WebSocket, in-memory)
//! - [`broadcast`]: Room-based ordered fan-out
//! - [`server`]: WebSocket authority server
//! - [`client`]: Async driver for a session over WebSocket
//!
//! All offsets are UTF-16 code units.

pub mod operation;
pub mod diff;
pub mod transform;
pub mod ttl;
pub mod config;
pub mod protocol;
pub mod presence;
pub mod transport;
pub mod session;
pub mod authority;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use operation::{apply, apply_all, utf16_len, Operation, OperationError, VersionedOperation};
pub use diff::{diff, diff_multi, Splice};
pub use transform::{transform, transform_index, transform_pair, transform_seqs, TieBreak, TransformError};
pub use config::{ServerConfig, SessionConfig};
pub use protocol::{ParticipantInfo, ProtocolError, Selection, SyncMessage, TextChange};
pub use presence::{CursorColor, CursorState, Participant, PresenceRoom, TypingIndicator};
pub use transport::{MemoryTransport, Transport, TransportError, WsTransport};
pub use session::{DocumentSession, SessionError, SessionEvent, SessionState};
pub use authority::{Accepted, AuthorityError, DocumentAuthority};
pub use broadcast::{BroadcastGroup, BroadcastStats, Recipients};
pub use server::{ServerStats, SyncServer};
pub use client::{ConnectionState, DocumentView, SyncClient, SyncEvent};
