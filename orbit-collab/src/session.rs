//! Client-side session for one shared document.
//!
//! A [`DocumentSession`] owns the local replica, the local edits the
//! authority has not acknowledged yet, and presence for remote participants.
//! It is a synchronous state machine: the caller feeds it inbound messages
//! and local edits, and it talks back through a [`Transport`].
//!
//! ## Pending edits
//!
//! ```text
//!            local_edit()
//!                 │ diff + optimistic apply
//!                 ▼
//!   buffer: [op3, op4]  ── head sent when nothing is in flight ──►  authority
//!                 │
//!   in_flight: op2      ◄── ack(version) clears it, sends next head
//! ```
//!
//! At most one operation is in flight. A remote `text-change` must carry the
//! replica's version as its base; it is transformed past the in-flight op and
//! then the buffer, while those are transformed past it, so the replica and
//! the authority converge once everything is acknowledged.
//!
//! Reference: Nichols et al., "High-Latency, Low-Bandwidth Windowing in the
//! Jupiter Collaboration System"

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::diff::diff_multi;
use crate::operation::{apply_all, utf16_len, Operation, OperationError};
use crate::presence::{CursorState, PresenceRoom, TypingIndicator};
use crate::protocol::{
    CursorUpdate, ParticipantInfo, Selection, SelectionUpdate, SyncMessage, TextChange,
};
use crate::transform::{transform_index, transform_seqs, TieBreak, TransformError};
use crate::transport::{Transport, TransportError};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the authority's snapshot.
    Joining,
    /// Replica matches the authority; nothing pending.
    Synced,
    /// Local edits are pending acknowledgement.
    Diverged,
    /// Terminal. Every further message is ignored.
    Left,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("change based on version {got}, replica is at {expected}")]
    VersionMismatch { expected: u64, got: u64 },
    #[error("operation not allowed while {0:?}")]
    InvalidState(SessionState),
}

impl SessionError {
    /// Whether the replica can no longer be trusted and must re-join.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::Operation(_) | Self::Transform(_) | Self::VersionMismatch { .. }
        )
    }
}

/// What changed, for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A snapshot was installed.
    Synced { content: String, version: u64 },
    /// A remote edit was applied to the replica.
    RemoteChange {
        content: String,
        version: u64,
        origin_id: Uuid,
    },
    /// The in-flight operation was acknowledged.
    Acknowledged { version: u64, pending: usize },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(Uuid),
    CursorMoved(CursorState),
    CursorRemoved(Uuid),
    TypingChanged { user_id: Uuid, is_typing: bool },
    /// Pending edits were discarded and the session is re-joining.
    Resynced { reason: String },
    Left,
}

/// One participant's view of a shared document.
pub struct DocumentSession {
    document_id: Uuid,
    local: ParticipantInfo,
    transport: Arc<dyn Transport>,
    state: SessionState,
    content: String,
    version: u64,
    last_ack: Option<u64>,
    /// Sent, not yet acknowledged. May hold several pieces after a remote
    /// insert split it, or none if a remote delete swallowed it.
    in_flight: Option<Vec<Operation>>,
    /// Not yet sent, oldest first.
    buffer: VecDeque<Operation>,
    presence: PresenceRoom,
    typing: TypingIndicator,
    caret: usize,
    selection: Option<(usize, usize)>,
    /// A throttled caret move still has to go out.
    cursor_dirty: bool,
    /// `join-document` has to be (re)sent.
    join_pending: bool,
}

impl DocumentSession {
    pub fn new(
        document_id: Uuid,
        local: ParticipantInfo,
        transport: Arc<dyn Transport>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            document_id,
            presence: PresenceRoom::new(local.user_id, config),
            typing: TypingIndicator::new(config.typing_idle_timeout),
            local,
            transport,
            state: SessionState::Joining,
            content: String::new(),
            version: 0,
            last_ack: None,
            in_flight: None,
            buffer: VecDeque::new(),
            caret: 0,
            selection: None,
            cursor_dirty: false,
            join_pending: true,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn local_user(&self) -> &ParticipantInfo {
        &self.local
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Last authority version folded into the replica.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_ack(&self) -> Option<u64> {
        self.last_ack
    }

    /// Local operations not yet acknowledged: the in-flight one (counted once
    /// even if split) plus the buffer.
    pub fn pending_count(&self) -> usize {
        usize::from(self.in_flight.is_some()) + self.buffer.len()
    }

    /// Unacknowledged local operations in application order.
    pub fn pending_local(&self) -> Vec<Operation> {
        self.in_flight
            .iter()
            .flatten()
            .chain(self.buffer.iter())
            .cloned()
            .collect()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn caret(&self) -> usize {
        self.caret
    }

    pub fn selection(&self) -> Option<(usize, usize)> {
        self.selection
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_typing()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Ask the authority for the document. On send failure the join is
    /// retried from [`tick`](Self::tick).
    pub fn join(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Left {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::Joining;
        self.join_pending = true;
        self.send_join()
    }

    fn send_join(&mut self) -> Result<(), SessionError> {
        self.transport.send(SyncMessage::JoinDocument {
            document_id: self.document_id,
            participant: self.local.clone(),
        })?;
        self.join_pending = false;
        log::debug!("Sent join for document {}", self.document_id);
        Ok(())
    }

    /// Leave the document. Unacknowledged local operations are discarded.
    pub fn leave(&mut self) {
        if self.state == SessionState::Left {
            return;
        }
        let leave = SyncMessage::LeaveDocument {
            document_id: self.document_id,
            user_id: self.local.user_id,
        };
        if let Err(e) = self.transport.send(leave) {
            log::debug!("leave-document not delivered: {}", e);
        }
        let discarded = self.discard_pending();
        if discarded > 0 {
            log::info!("Leaving with {} unacknowledged operations discarded", discarded);
        }
        self.presence.clear();
        self.typing.reset();
        self.cursor_dirty = false;
        self.join_pending = false;
        self.state = SessionState::Left;
    }

    /// Drop pending edits and presence, then re-join for a fresh snapshot.
    pub fn resync(&mut self, reason: impl Into<String>) -> SessionEvent {
        let reason = reason.into();
        let discarded = self.discard_pending();
        log::warn!(
            "Re-synchronizing document {} ({} pending discarded): {}",
            self.document_id,
            discarded,
            reason
        );
        self.presence.clear();
        self.last_ack = None;
        if let Err(e) = self.join() {
            log::warn!("Re-join not sent yet: {}", e);
        }
        SessionEvent::Resynced { reason }
    }

    fn discard_pending(&mut self) -> usize {
        let count = self.pending_count();
        self.in_flight = None;
        self.buffer.clear();
        count
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Record a local edit from `old_text` to `new_text`.
    ///
    /// The change is applied to the replica immediately. If `old_text` does
    /// not match the replica (a remote change landed first), the diff is taken
    /// against the replica instead. A failed send keeps the operation pending
    /// for [`retry_pending`](Self::retry_pending).
    pub fn local_edit(&mut self, old_text: &str, new_text: &str, now: Instant) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Synced | SessionState::Diverged) {
            return Err(SessionError::InvalidState(self.state));
        }
        if old_text != self.content {
            log::warn!("Local edit based on stale text; diffing against the replica");
        }
        let ops = diff_multi(&self.content, new_text);
        if ops.is_empty() {
            return Ok(());
        }

        self.content = apply_all(&self.content, &ops)?;
        for op in &ops {
            self.presence.shift_cursors(op, self.local.user_id);
            self.shift_local_caret(op, true);
        }
        self.buffer.extend(ops);
        self.state = SessionState::Diverged;

        if let Err(e) = self.flush() {
            log::warn!("Edit queued, send failed: {}", e);
        }
        if self.typing.on_edit(now) {
            self.send_presence(SyncMessage::UserTyping {
                document_id: self.document_id,
                user_id: self.local.user_id,
            });
        }
        Ok(())
    }

    /// Send the buffer head if nothing is in flight.
    pub fn retry_pending(&mut self) -> Result<(), SessionError> {
        self.flush().map_err(SessionError::from)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if self.in_flight.is_some() || self.state == SessionState::Joining {
            return Ok(());
        }
        let Some(op) = self.buffer.front().cloned() else {
            return Ok(());
        };
        self.transport.send(SyncMessage::TextChange(TextChange {
            document_id: self.document_id,
            operation: op.clone(),
            version: self.version,
            origin_id: self.local.user_id,
        }))?;
        self.buffer.pop_front();
        self.in_flight = Some(vec![op]);
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Feed one message from the authority.
    ///
    /// Errors that leave the replica untrustworthy trigger a re-sync and come
    /// back as [`SessionEvent::Resynced`].
    pub fn handle_message(&mut self, message: SyncMessage, now: Instant) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state == SessionState::Left {
            return Ok(Vec::new());
        }
        if let Some(doc) = message.document_id() {
            if doc != self.document_id {
                log::debug!("Ignoring {} for document {}", message.event_name(), doc);
                return Ok(Vec::new());
            }
        }

        let result = match message {
            SyncMessage::DocumentSnapshot {
                content,
                version,
                participants,
                ..
            } => Ok(self.install_snapshot(content, version, participants)),
            SyncMessage::TextChange(change) => self.remote_op_received(change),
            SyncMessage::Ack { version, .. } => self.ack(version),
            SyncMessage::Resync { reason, .. } => Ok(vec![self.resync(reason)]),
            other => Ok(self.handle_presence(other, now)),
        };

        match result {
            Err(e) if e.requires_resync() => Ok(vec![self.resync(e.to_string())]),
            other => other,
        }
    }

    fn install_snapshot(
        &mut self,
        content: String,
        version: u64,
        participants: Vec<ParticipantInfo>,
    ) -> Vec<SessionEvent> {
        if self.state != SessionState::Joining {
            let discarded = self.discard_pending();
            log::warn!("Unsolicited snapshot at version {}; {} pending discarded", version, discarded);
        }
        self.content = content;
        self.version = version;
        self.last_ack = None;
        self.join_pending = false;
        self.presence.clear();
        for participant in participants {
            self.presence.join(participant);
        }
        let len = utf16_len(&self.content);
        self.caret = self.caret.min(len);
        self.selection = None;
        self.state = SessionState::Synced;
        log::info!("Joined document {} at version {}", self.document_id, version);
        vec![SessionEvent::Synced {
            content: self.content.clone(),
            version,
        }]
    }

    /// Fold a remote edit into the replica.
    pub fn remote_op_received(&mut self, change: TextChange) -> Result<Vec<SessionEvent>, SessionError> {
        match self.state {
            SessionState::Synced | SessionState::Diverged => {}
            SessionState::Joining => {
                // The snapshot will include it.
                return Ok(Vec::new());
            }
            SessionState::Left => return Err(SessionError::InvalidState(self.state)),
        }
        if change.origin_id == self.local.user_id {
            log::debug!("Ignoring echo of own change at version {}", change.version);
            return Ok(Vec::new());
        }
        if change.version != self.version {
            return Err(SessionError::VersionMismatch {
                expected: self.version,
                got: change.version,
            });
        }

        let tie = TieBreak::by_origin(change.origin_id, self.local.user_id);
        let mut incoming = vec![change.operation];
        let mut base_len = self.confirmed_len();
        let mut in_flight = None;

        if let Some(ops) = &self.in_flight {
            let (past, rebased) = transform_seqs(&incoming, ops, base_len, tie)?;
            base_len = ops.iter().fold(base_len, |len, op| op.resulting_len(len));
            incoming = past;
            in_flight = Some(rebased);
        }
        let buffered: Vec<Operation> = self.buffer.iter().cloned().collect();
        let (incoming, buffer) = transform_seqs(&incoming, &buffered, base_len, tie)?;

        // Nothing is committed until the apply succeeds.
        let content = apply_all(&self.content, &incoming)?;
        self.content = content;
        if in_flight.is_some() {
            self.in_flight = in_flight;
        }
        self.buffer = buffer.into();
        self.version += 1;
        if self.in_flight.is_none() && self.buffer.is_empty() {
            self.state = SessionState::Synced;
        }

        for op in &incoming {
            self.presence.shift_cursors(op, change.origin_id);
            self.shift_local_caret(op, false);
        }

        Ok(vec![SessionEvent::RemoteChange {
            content: self.content.clone(),
            version: self.version,
            origin_id: change.origin_id,
        }])
    }

    /// Length of the document at `self.version`, before pending local edits.
    fn confirmed_len(&self) -> usize {
        let pending = self.in_flight.iter().flatten().chain(self.buffer.iter());
        let (inserted, deleted) = pending.fold((0, 0), |(ins, del), op| {
            (ins + op.inserted_len(), del + op.deleted_len())
        });
        (utf16_len(&self.content) + deleted).saturating_sub(inserted)
    }

    /// The authority applied our in-flight operation; `version` is its
    /// version afterwards.
    pub fn ack(&mut self, version: u64) -> Result<Vec<SessionEvent>, SessionError> {
        if self.last_ack.is_some_and(|acked| version <= acked) {
            log::debug!("Duplicate ack for version {}", version);
            return Ok(Vec::new());
        }
        if self.in_flight.is_none() {
            if self.state == SessionState::Joining {
                // Applied before our re-join; the snapshot carries it.
                log::debug!("Ack for version {} while joining", version);
                return Ok(Vec::new());
            }
            if version > self.version {
                // An edit we discarded was applied after all.
                return Err(SessionError::VersionMismatch {
                    expected: self.version,
                    got: version,
                });
            }
            log::warn!("Ack for version {} with nothing in flight", version);
            return Ok(Vec::new());
        }
        if version < self.version {
            return Err(SessionError::VersionMismatch {
                expected: self.version,
                got: version,
            });
        }

        self.in_flight = None;
        self.version = version;
        self.last_ack = Some(version);
        if let Err(e) = self.flush() {
            log::warn!("Next pending operation not sent: {}", e);
        }
        if self.pending_count() == 0 {
            self.state = SessionState::Synced;
        }
        Ok(vec![SessionEvent::Acknowledged {
            version,
            pending: self.pending_count(),
        }])
    }

    fn handle_presence(&mut self, message: SyncMessage, now: Instant) -> Vec<SessionEvent> {
        if self.state == SessionState::Joining {
            return Vec::new();
        }
        match message {
            SyncMessage::UserJoinedDocument { participant, .. } => {
                if self.presence.join(participant.clone()) {
                    vec![SessionEvent::ParticipantJoined(participant)]
                } else {
                    Vec::new()
                }
            }
            SyncMessage::UserLeftDocument { user_id, .. } => {
                if self.presence.leave(&user_id) {
                    vec![SessionEvent::ParticipantLeft(user_id)]
                } else {
                    Vec::new()
                }
            }
            SyncMessage::CursorUpdate(update) => {
                self.presence.update_cursor(update.user_id, update.position, now);
                self.cursor_event(update.user_id, now)
            }
            SyncMessage::SelectionUpdate(update) => {
                let Selection { start, end } = update.selection;
                self.presence.update_selection(update.user_id, start, end, now);
                self.cursor_event(update.user_id, now)
            }
            SyncMessage::UserTyping { user_id, .. } => {
                if user_id == self.local.user_id {
                    return Vec::new();
                }
                let was_typing = self.presence.is_typing(&user_id, now);
                self.presence.set_typing(user_id, now);
                if was_typing {
                    Vec::new()
                } else {
                    vec![SessionEvent::TypingChanged { user_id, is_typing: true }]
                }
            }
            SyncMessage::UserStoppedTyping { user_id, .. } => {
                if self.presence.clear_typing(&user_id) {
                    vec![SessionEvent::TypingChanged { user_id, is_typing: false }]
                } else {
                    Vec::new()
                }
            }
            SyncMessage::Ping | SyncMessage::Pong => Vec::new(),
            other => {
                log::debug!("Ignoring unexpected {}", other.event_name());
                Vec::new()
            }
        }
    }

    fn cursor_event(&self, user_id: Uuid, now: Instant) -> Vec<SessionEvent> {
        self.presence
            .cursor(&user_id, now)
            .map(|c| SessionEvent::CursorMoved(c.clone()))
            .into_iter()
            .collect()
    }

    // ── Local presence ───────────────────────────────────────────

    /// Move the local caret. Broadcasts are throttled; a suppressed move goes
    /// out on a later [`tick`](Self::tick).
    pub fn set_cursor(&mut self, position: usize, now: Instant) {
        self.caret = position.min(utf16_len(&self.content));
        self.selection = None;
        self.cursor_dirty = true;
        self.flush_cursor(now);
    }

    /// Set the local selection. Always broadcast.
    pub fn set_selection(&mut self, start: usize, end: usize) {
        let len = utf16_len(&self.content);
        let (start, end) = (start.min(len), end.min(len));
        self.caret = end;
        self.selection = (start != end).then_some((start, end));
        self.cursor_dirty = false;
        self.send_presence(SyncMessage::SelectionUpdate(SelectionUpdate {
            document_id: self.document_id,
            user_id: self.local.user_id,
            selection: Selection { start, end },
        }));
    }

    fn flush_cursor(&mut self, now: Instant) {
        if !self.cursor_dirty || !self.presence.should_broadcast_cursor(now) {
            return;
        }
        self.cursor_dirty = false;
        self.send_presence(SyncMessage::CursorUpdate(CursorUpdate {
            document_id: self.document_id,
            user_id: self.local.user_id,
            position: self.caret,
        }));
    }

    /// Presence is fire-and-forget.
    fn send_presence(&self, message: SyncMessage) {
        if !matches!(self.state, SessionState::Synced | SessionState::Diverged) {
            return;
        }
        if let Err(e) = self.transport.send(message) {
            log::trace!("Presence update dropped: {}", e);
        }
    }

    fn shift_local_caret(&mut self, op: &Operation, own: bool) {
        self.caret = transform_index(self.caret, op, own);
        if let Some((start, end)) = self.selection {
            self.selection = Some((
                transform_index(start, op, own),
                transform_index(end, op, own),
            ));
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Periodic work: typing timeout, presence expiry, retries.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.state == SessionState::Left {
            return events;
        }

        if self.join_pending {
            if let Err(e) = self.send_join() {
                log::debug!("Join retry failed: {}", e);
            }
        }

        if self.typing.poll(now) {
            self.send_presence(SyncMessage::UserStoppedTyping {
                document_id: self.document_id,
                user_id: self.local.user_id,
            });
        }
        self.flush_cursor(now);

        let report = self.presence.purge(now);
        events.extend(report.stale_cursors.into_iter().map(SessionEvent::CursorRemoved));
        events.extend(
            report
                .stopped_typing
                .into_iter()
                .map(|user_id| SessionEvent::TypingChanged { user_id, is_typing: false }),
        );

        if let Err(e) = self.flush() {
            log::debug!("Pending retry failed: {}", e);
        }
        events
    }
}
