//! Async driver that runs a [`DocumentSession`] against a live connection.
//!
//! Provides:
//! - Connection setup over WebSocket
//! - A single task that owns the session and serializes inbound messages,
//!   local commands and housekeeping ticks
//! - Events for the UI layer
//!
//! ```text
//!  SyncClient::edit() ──► commands ──┐
//!                                    ├──► driver task ──► DocumentSession ──► Transport
//!  WsTransport reader ──► inbound ───┤          │
//!  interval ──────────────► tick ────┘          └──► events (SyncEvent)
//! ```
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::presence::{CursorState, Participant};
use crate::protocol::{ParticipantInfo, SyncMessage};
use crate::session::{DocumentSession, SessionError, SessionEvent, SessionState};
use crate::transport::{TransportError, WsTransport};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Something changed in the session.
    Session(SessionEvent),
    /// The driver stopped: connection lost or the session was left.
    Disconnected,
}

/// Point-in-time view of the session, for rendering.
#[derive(Debug, Clone)]
pub struct DocumentView {
    pub content: String,
    pub version: u64,
    pub state: SessionState,
    pub pending: usize,
    pub caret: usize,
    pub participants: Vec<Participant>,
    pub cursors: Vec<CursorState>,
}

impl DocumentView {
    fn of(session: &DocumentSession, now: Instant) -> Self {
        Self {
            content: session.content().to_string(),
            version: session.version(),
            state: session.state(),
            pending: session.pending_count(),
            caret: session.caret(),
            participants: session.presence().participants(now),
            cursors: session.presence().cursors(now),
        }
    }
}

enum Command {
    Edit {
        old: String,
        new: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Update {
        f: Box<dyn FnOnce(&str) -> String + Send>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Cursor(usize),
    Selection { start: usize, end: usize },
    View(oneshot::Sender<DocumentView>),
    Leave(oneshot::Sender<()>),
}

/// The sync client.
///
/// Owns a background task running one [`DocumentSession`]. Dropping the
/// client leaves the document.
pub struct SyncClient {
    local: ParticipantInfo,
    document_id: Uuid,
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    state: Arc<RwLock<ConnectionState>>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to the authority at `url` and join `document_id`.
    pub async fn connect(
        url: &str,
        document_id: Uuid,
        local: ParticipantInfo,
        config: SessionConfig,
    ) -> Result<Self, TransportError> {
        let (transport, inbound) = WsTransport::connect(url, config.channel_capacity).await?;
        log::info!("Connected to {url} as {}", local.display_name);
        let session = DocumentSession::new(document_id, local, Arc::new(transport), &config);
        Ok(Self::spawn(session, inbound, &config))
    }

    /// Run `session` on a background task, fed by `inbound`.
    ///
    /// The session joins its document as soon as the task starts.
    pub fn spawn(session: DocumentSession, inbound: mpsc::Receiver<SyncMessage>, config: &SessionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        let local = session.local_user().clone();
        let document_id = session.document_id();
        let driver = Driver {
            session,
            inbound,
            commands: command_rx,
            events: event_tx,
            state: state.clone(),
            tick_interval: config.tick_interval,
        };
        let task = tokio::spawn(driver.run());

        Self {
            local,
            document_id,
            commands: command_tx,
            event_rx: Some(event_rx),
            state,
            task,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Submit a local edit: the text before and after the user's change.
    pub async fn edit(&self, old_text: impl Into<String>, new_text: impl Into<String>) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Edit {
            old: old_text.into(),
            new: new_text.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    /// Rewrite the replica with `f` as one local edit.
    ///
    /// `f` sees the current content, so remote changes that arrive
    /// concurrently are never overwritten.
    pub async fn update<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&str) -> String + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.command(Command::Update { f: Box::new(f), reply }).await?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    /// Move the local caret.
    pub async fn set_cursor(&self, position: usize) -> Result<(), TransportError> {
        self.command(Command::Cursor(position)).await
    }

    pub async fn set_selection(&self, start: usize, end: usize) -> Result<(), TransportError> {
        self.command(Command::Selection { start, end }).await
    }

    /// Current content, version and presence.
    pub async fn view(&self) -> Result<DocumentView, TransportError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::View(reply)).await?;
        response.await.map_err(|_| TransportError::Closed)
    }

    /// Leave the document and stop the driver.
    pub async fn leave(self) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Leave(reply)).await?;
        response.await.map_err(|_| TransportError::Closed)?;
        let _ = self.task.await;
        Ok(())
    }

    async fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands.send(command).await.map_err(|_| TransportError::Closed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn local_user(&self) -> &ParticipantInfo {
        &self.local
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }
}

/// State owned by the background task.
struct Driver {
    session: DocumentSession,
    inbound: mpsc::Receiver<SyncMessage>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SyncEvent>,
    state: Arc<RwLock<ConnectionState>>,
    tick_interval: Duration,
}

impl Driver {
    async fn run(mut self) {
        if let Err(e) = self.session.join() {
            log::warn!("Join not sent yet: {e}");
        }
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.inbound.recv() => {
                    let Some(msg) = msg else {
                        log::info!("Connection to authority lost");
                        break;
                    };
                    match self.session.handle_message(msg, Instant::now()) {
                        Ok(events) => self.emit(events),
                        Err(e) => log::warn!("Inbound message rejected: {e}"),
                    }
                }

                cmd = self.commands.recv() => {
                    let now = Instant::now();
                    match cmd {
                        Some(Command::Edit { old, new, reply }) => {
                            let _ = reply.send(self.session.local_edit(&old, &new, now));
                        }
                        Some(Command::Update { f, reply }) => {
                            let old = self.session.content().to_string();
                            let new = f(&old);
                            let _ = reply.send(self.session.local_edit(&old, &new, now));
                        }
                        Some(Command::Cursor(position)) => self.session.set_cursor(position, now),
                        Some(Command::Selection { start, end }) => self.session.set_selection(start, end),
                        Some(Command::View(reply)) => {
                            let _ = reply.send(DocumentView::of(&self.session, now));
                        }
                        Some(Command::Leave(reply)) => {
                            self.session.leave();
                            self.emit(vec![SessionEvent::Left]);
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            // Client handle dropped.
                            self.session.leave();
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    let events = self.session.tick(Instant::now());
                    self.emit(events);
                }
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.events.try_send(SyncEvent::Disconnected);
    }

    /// Events are dropped, not queued without bound, when nobody reads them.
    fn emit(&self, events: Vec<SessionEvent>) {
        for event in events {
            if let Err(e) = self.events.try_send(SyncEvent::Session(event)) {
                log::trace!("Event dropped: {e}");
            }
        }
    }
}
