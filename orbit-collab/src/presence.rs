//! Presence for a shared document: who is here, where their caret is, and
//! whether they are typing.
//!
//! ## Architecture
//!
//! ```text
//! user-joined-document / user-left-document
//!       │
//!       ▼
//! PresenceRoom::join() / leave()        ── participants (HashMap)
//!       │
//! cursor-update / selection-update
//!       │
//!       ▼
//! PresenceRoom::update_cursor()         ── cursors (TtlCache, stale timeout)
//!       │
//! user-typing / user-stopped-typing
//!       │
//!       ▼
//! PresenceRoom::set_typing()            ── typing (TtlCache, refresh per event)
//!
//! applied Insert/Delete ──► PresenceRoom::shift_cursors()
//! ```
//!
//! Reference: Kleppmann, Chapter 8 (Broadcast Protocols)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::operation::Operation;
use crate::protocol::ParticipantInfo;
use crate::transform::transform_index;
use crate::ttl::TtlCache;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color from a participant's color hash.
    ///
    /// Hue comes from the hash; saturation and lightness are fixed.
    pub fn from_hash(hash: u32) -> Self {
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// CSS `rgba(...)` string for the UI layer.
    pub fn to_css(&self) -> String {
        format!(
            "rgba({}, {}, {}, {})",
            (self.r * 255.0).round() as u8,
            (self.g * 255.0).round() as u8,
            (self.b * 255.0).round() as u8,
            self.a
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Per-participant state
// ───────────────────────────────────────────────────────────────────

/// Where a remote participant's caret is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub user_id: Uuid,
    /// UTF-16 offset in the local replica's content.
    pub position: usize,
    pub selection: Option<(usize, usize)>,
    pub last_update: Instant,
}

impl CursorState {
    /// Move across an operation applied to the local replica.
    ///
    /// The operation's author keeps their caret after text they inserted.
    pub fn shift(&mut self, op: &Operation, origin: Uuid) {
        let own = origin == self.user_id;
        self.position = transform_index(self.position, op, own);
        if let Some((start, end)) = self.selection {
            self.selection = Some((
                transform_index(start, op, own),
                transform_index(end, op, own),
            ));
        }
    }
}

/// A participant as seen by the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub color_hash: u32,
    pub is_typing: bool,
    pub typing_expires_at: Option<Instant>,
}

impl Participant {
    pub fn color(&self) -> CursorColor {
        CursorColor::from_hash(self.color_hash)
    }
}

/// What a purge pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub stale_cursors: Vec<Uuid>,
    pub stopped_typing: Vec<Uuid>,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.stale_cursors.is_empty() && self.stopped_typing.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence state for all remote participants of one document.
///
/// Entries about the local user are ignored.
pub struct PresenceRoom {
    local_user_id: Uuid,
    participants: HashMap<Uuid, ParticipantInfo>,
    cursors: TtlCache<Uuid, CursorState>,
    typing: TtlCache<Uuid, ()>,
    /// Minimum interval between local cursor broadcasts.
    cursor_broadcast_interval: Duration,
    last_cursor_broadcast: Option<Instant>,
}

impl PresenceRoom {
    pub fn new(local_user_id: Uuid, config: &SessionConfig) -> Self {
        Self {
            local_user_id,
            participants: HashMap::new(),
            cursors: TtlCache::new(config.cursor_stale_timeout),
            typing: TtlCache::new(config.remote_typing_ttl),
            cursor_broadcast_interval: config.cursor_broadcast_interval,
            last_cursor_broadcast: None,
        }
    }

    /// Register a participant. Returns `true` if they were not known before.
    pub fn join(&mut self, info: ParticipantInfo) -> bool {
        if info.user_id == self.local_user_id {
            return false;
        }
        self.participants.insert(info.user_id, info).is_none()
    }

    /// Forget a participant and all their ephemeral state.
    pub fn leave(&mut self, user_id: &Uuid) -> bool {
        self.cursors.remove(user_id);
        self.typing.remove(user_id);
        self.participants.remove(user_id).is_some()
    }

    /// Record a caret move. Cursors from unknown participants create a
    /// placeholder entry; they may have joined before we did.
    pub fn update_cursor(&mut self, user_id: Uuid, position: usize, now: Instant) {
        if user_id == self.local_user_id {
            return;
        }
        self.ensure_participant(user_id);
        // A bare caret move collapses any previous selection.
        self.cursors.insert(
            user_id,
            CursorState {
                user_id,
                position,
                selection: None,
                last_update: now,
            },
            now,
        );
    }

    /// Record a selection; the caret sits at the selection's end.
    pub fn update_selection(&mut self, user_id: Uuid, start: usize, end: usize, now: Instant) {
        if user_id == self.local_user_id {
            return;
        }
        self.ensure_participant(user_id);
        let selection = if start == end { None } else { Some((start, end)) };
        self.cursors.insert(
            user_id,
            CursorState {
                user_id,
                position: end,
                selection,
                last_update: now,
            },
            now,
        );
    }

    fn ensure_participant(&mut self, user_id: Uuid) {
        self.participants.entry(user_id).or_insert_with(|| {
            ParticipantInfo::with_id(user_id, format!("Peer-{}", &user_id.to_string()[..8]))
        });
    }

    /// Mark a participant as typing, refreshing the TTL.
    pub fn set_typing(&mut self, user_id: Uuid, now: Instant) {
        if user_id == self.local_user_id {
            return;
        }
        self.typing.insert(user_id, (), now);
    }

    pub fn clear_typing(&mut self, user_id: &Uuid) -> bool {
        self.typing.remove(user_id).is_some()
    }

    pub fn is_typing(&self, user_id: &Uuid, now: Instant) -> bool {
        self.typing.get(user_id, now).is_some()
    }

    /// Shift every remote caret across an operation applied locally.
    pub fn shift_cursors(&mut self, op: &Operation, origin: Uuid) {
        for cursor in self.cursors.values_mut() {
            cursor.shift(op, origin);
        }
    }

    /// Drop stale cursors and expired typing flags.
    pub fn purge(&mut self, now: Instant) -> PurgeReport {
        PurgeReport {
            stale_cursors: self.cursors.purge_expired(now),
            stopped_typing: self.typing.purge_expired(now),
        }
    }

    /// Whether a local cursor move should go out now; records the broadcast
    /// when it returns `true`.
    pub fn should_broadcast_cursor(&mut self, now: Instant) -> bool {
        let due = self
            .last_cursor_broadcast
            .map_or(true, |last| now.duration_since(last) >= self.cursor_broadcast_interval);
        if due {
            self.last_cursor_broadcast = Some(now);
        }
        due
    }

    pub fn cursor(&self, user_id: &Uuid, now: Instant) -> Option<&CursorState> {
        self.cursors.get(user_id, now)
    }

    /// Live remote cursors.
    pub fn cursors(&self, now: Instant) -> Vec<CursorState> {
        self.cursors.iter(now).map(|(_, c)| c.clone()).collect()
    }

    pub fn participant(&self, user_id: &Uuid, now: Instant) -> Option<Participant> {
        let info = self.participants.get(user_id)?;
        let is_typing = self.is_typing(user_id, now);
        Some(Participant {
            user_id: info.user_id,
            display_name: info.display_name.clone(),
            color_hash: info.color_hash,
            is_typing,
            typing_expires_at: if is_typing { self.typing.expires_at(user_id) } else { None },
        })
    }

    pub fn participants(&self, now: Instant) -> Vec<Participant> {
        self.participants
            .keys()
            .filter_map(|id| self.participant(id, now))
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    /// Forget everyone; used on leave and re-sync.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.cursors.clear();
        self.typing.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Local typing indicator
// ───────────────────────────────────────────────────────────────────

/// Debounces the local user's typing state.
///
/// The first edit starts typing; each further edit pushes the deadline out.
/// Typing stops once `idle_timeout` passes with no edit.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    idle_timeout: Duration,
    deadline: Option<Instant>,
}

impl TypingIndicator {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            deadline: None,
        }
    }

    /// Record a local edit. Returns `true` when `user-typing` should be sent.
    pub fn on_edit(&mut self, now: Instant) -> bool {
        let started = self.deadline.is_none();
        self.deadline = Some(now + self.idle_timeout);
        started
    }

    /// Returns `true` when `user-stopped-typing` should be sent.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }

    /// Stop immediately. Returns whether typing was active.
    pub fn reset(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}

// ===================================================================
// Tests
// ===================================================================
