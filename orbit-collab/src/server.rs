//! WebSocket authority server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (document_id) ── DocumentAuthority ── BroadcastGroup
//! Client B ──┘                                                   │
//!                                                  ┌─────────────┼─────────────┐
//!                                                  ▼             ▼             ▼
//!                                               Client A      Client B      Client C
//! ```
//!
//! Each document room maintains:
//! - A `DocumentAuthority` holding canonical content, version and history
//! - A `BroadcastGroup` for ordered fan-out to connected participants
//!
//! Every frame produced by a change (relayed edits, the sender's ack, a
//! rejection's resync) is queued on the room's broadcast channel while the
//! room lock is held, so each connection sees edits and acks in the order
//! the authority applied them. Snapshots go out directly on the connection,
//! taken under the same lock that subscribes the connection's receiver.
//! A connection whose receiver lags is told to re-sync; its re-join is read
//! after any change it already sent, so the fresh snapshot includes it.
//!
//! Documents live in memory for the lifetime of the process.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 and 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::authority::DocumentAuthority;
use crate::broadcast::{BroadcastGroup, Frame, Recipients};
use crate::config::ServerConfig;
use crate::protocol::SyncMessage;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    /// Connections told to re-sync because their broadcast receiver lagged.
    pub lag_resyncs: u64,
}

/// Document room: authority + broadcast group.
struct DocumentRoom {
    authority: DocumentAuthority,
    broadcast: Arc<BroadcastGroup>,
    /// Latest connection of each participant; a reconnect supersedes the old one.
    connections: HashMap<Uuid, Uuid>,
}

impl DocumentRoom {
    fn new(document_id: Uuid, config: &ServerConfig) -> Self {
        Self {
            authority: DocumentAuthority::new(document_id, config.max_history),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            connections: HashMap::new(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, DocumentRoom>>>;

/// Shared state handed to every connection task.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

/// The participant and document a connection joined, plus its receiver.
struct Membership {
    user_id: Uuid,
    document_id: Uuid,
    connection_id: Uuid,
    rx: broadcast::Receiver<Arc<Frame>>,
}

/// What the connection loop does after a message or room frame.
enum Step {
    Continue,
    Reply(SyncMessage),
    Forward(Arc<Frame>),
    Close,
}

/// The sync server.
pub struct SyncServer {
    ctx: ServerContext,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            ctx: ServerContext {
                config,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ServerContext) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Membership> = None;
        let result = Self::connection_loop(&ctx, addr, &mut ws_sender, &mut ws_receiver, &mut member).await;

        if let Some(m) = member {
            Self::depart(&ctx, &m).await;
        }
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn connection_loop(
        ctx: &ServerContext,
        addr: SocketAddr,
        ws_sender: &mut WsSink,
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        member: &mut Option<Membership>,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            match Self::process(ctx, member, sync_msg).await? {
                                Step::Continue | Step::Forward(_) => {}
                                Step::Reply(reply) => send_direct(ws_sender, &reply).await?,
                                Step::Close => break,
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room frame
                frame = async {
                    match member.as_mut() {
                        Some(m) => m.rx.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(m) = member.as_mut() else { continue };
                    match Self::deliver(ctx, m, frame).await {
                        Step::Continue => {}
                        Step::Forward(frame) => {
                            ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                        }
                        Step::Reply(reply) => send_direct(ws_sender, &reply).await?,
                        Step::Close => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Decide what to do with one frame from the room's channel.
    async fn deliver(
        ctx: &ServerContext,
        m: &mut Membership,
        frame: Result<Arc<Frame>, broadcast::error::RecvError>,
    ) -> Step {
        match frame {
            Ok(frame) if frame.recipients.includes(m.user_id) => Step::Forward(frame),
            Ok(_) => Step::Continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Peer {} lagged by {n} frames; asking it to re-sync", m.user_id);
                // The backlog is useless to a re-joining client.
                if let Some(room) = ctx.rooms.read().await.get(&m.document_id) {
                    m.rx = room.broadcast.subscribe();
                }
                ctx.stats.write().await.lag_resyncs += 1;
                Step::Reply(SyncMessage::Resync {
                    document_id: m.document_id,
                    reason: format!("missed {n} updates"),
                })
            }
            Err(broadcast::error::RecvError::Closed) => Step::Close,
        }
    }

    /// Apply one decoded client message.
    async fn process(ctx: &ServerContext, member: &mut Option<Membership>, msg: SyncMessage) -> Result<Step, BoxError> {
        match msg {
            SyncMessage::JoinDocument {
                document_id,
                participant,
            } => {
                if let Some(m) = member.as_mut() {
                    if m.document_id != document_id || m.user_id != participant.user_id {
                        log::warn!("Connection already joined document {}; ignoring join", m.document_id);
                        return Ok(Step::Continue);
                    }
                    // Re-join after a rejected change: fresh receiver and snapshot.
                    return Ok(match Self::resubscribe(ctx, m).await {
                        Some(snapshot) => Step::Reply(snapshot),
                        None => Step::Close,
                    });
                }

                let user_id = participant.user_id;
                let mut rooms_w = ctx.rooms.write().await;
                let room = rooms_w
                    .entry(document_id)
                    .or_insert_with(|| DocumentRoom::new(document_id, &ctx.config));

                let reconnect = room.connections.contains_key(&user_id);
                if !reconnect && room.broadcast.peer_count().await >= ctx.config.max_peers_per_room {
                    log::warn!("Room {document_id} is full; refusing {}", participant.display_name);
                    return Ok(Step::Close);
                }

                let connection_id = Uuid::new_v4();
                room.connections.insert(user_id, connection_id);
                room.authority.join(participant.clone());
                let rx = room.broadcast.add_peer(participant.clone()).await;
                let snapshot = room.authority.snapshot();
                room.broadcast.send(
                    Recipients::AllExcept(user_id),
                    &SyncMessage::UserJoinedDocument {
                        document_id,
                        participant: participant.clone(),
                    },
                )?;
                let room_count = rooms_w.len();
                drop(rooms_w);

                ctx.stats.write().await.active_rooms = room_count;
                log::info!(
                    "Peer {} ({}) joined doc {}",
                    participant.display_name,
                    user_id,
                    document_id
                );

                *member = Some(Membership {
                    user_id,
                    document_id,
                    connection_id,
                    rx,
                });
                Ok(Step::Reply(snapshot))
            }

            SyncMessage::TextChange(change) => {
                let Some(m) = member.as_ref() else {
                    log::warn!("text-change before join; ignoring");
                    return Ok(Step::Continue);
                };
                if change.origin_id != m.user_id || change.document_id != m.document_id {
                    log::warn!("Dropping text-change with foreign origin or document from {}", m.user_id);
                    return Ok(Step::Continue);
                }

                let mut rooms_w = ctx.rooms.write().await;
                let Some(room) = rooms_w.get_mut(&m.document_id) else {
                    return Ok(Step::Continue);
                };
                let applied = match room.authority.receive(&change) {
                    Ok(accepted) => {
                        for relayed in accepted.broadcast {
                            room.broadcast
                                .send(Recipients::AllExcept(m.user_id), &SyncMessage::TextChange(relayed))?;
                        }
                        room.broadcast.send(
                            Recipients::Only(m.user_id),
                            &SyncMessage::Ack {
                                document_id: m.document_id,
                                version: accepted.ack_version,
                            },
                        )?;
                        true
                    }
                    Err(e) => {
                        log::warn!("Rejected change from {} on doc {}: {e}", m.user_id, m.document_id);
                        room.broadcast.send(
                            Recipients::Only(m.user_id),
                            &SyncMessage::Resync {
                                document_id: m.document_id,
                                reason: e.to_string(),
                            },
                        )?;
                        false
                    }
                };
                drop(rooms_w);

                let mut s = ctx.stats.write().await;
                if applied {
                    s.operations_applied += 1;
                } else {
                    s.operations_rejected += 1;
                }
                Ok(Step::Continue)
            }

            SyncMessage::CursorUpdate(_)
            | SyncMessage::SelectionUpdate(_)
            | SyncMessage::UserTyping { .. }
            | SyncMessage::UserStoppedTyping { .. } => {
                let Some(m) = member.as_ref() else {
                    return Ok(Step::Continue);
                };
                if msg.user_id() != Some(m.user_id) || msg.document_id() != Some(m.document_id) {
                    log::debug!("Dropping {} not sent on behalf of {}", msg.event_name(), m.user_id);
                    return Ok(Step::Continue);
                }
                log::trace!("Presence: {} from {} in room {}", msg.event_name(), m.user_id, m.document_id);

                let rooms_r = ctx.rooms.read().await;
                if let Some(room) = rooms_r.get(&m.document_id) {
                    room.broadcast.send(Recipients::AllExcept(m.user_id), &msg)?;
                }
                Ok(Step::Continue)
            }

            SyncMessage::LeaveDocument { .. } => Ok(Step::Close),

            SyncMessage::Ping => Ok(Step::Reply(SyncMessage::Pong)),

            other => {
                log::debug!("Unhandled message type: {}", other.event_name());
                Ok(Step::Continue)
            }
        }
    }

    /// Replace the connection's receiver and take a snapshot under the same
    /// lock, so no frame falls between the two.
    async fn resubscribe(ctx: &ServerContext, m: &mut Membership) -> Option<SyncMessage> {
        let rooms_w = ctx.rooms.write().await;
        let room = rooms_w.get(&m.document_id)?;
        m.rx = room.broadcast.subscribe();
        Some(room.authority.snapshot())
    }

    /// Remove a departing participant and tell the rest of the room.
    ///
    /// A connection superseded by a reconnect of the same participant leaves
    /// silently.
    async fn depart(ctx: &ServerContext, m: &Membership) {
        let mut rooms_w = ctx.rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&m.document_id) {
            if room.connections.get(&m.user_id) != Some(&m.connection_id) {
                log::debug!("Superseded connection of {} closed", m.user_id);
                return;
            }
            room.connections.remove(&m.user_id);
            room.broadcast.remove_peer(&m.user_id).await;
            room.authority.leave(&m.user_id);

            let leave_msg = SyncMessage::UserLeftDocument {
                document_id: m.document_id,
                user_id: m.user_id,
            };
            if let Err(e) = room.broadcast.send(Recipients::AllExcept(m.user_id), &leave_msg) {
                log::error!("Failed to announce departure of {}: {e}", m.user_id);
            }
            log::info!("Peer {} left doc {}", m.user_id, m.document_id);
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Content and version of a document, if any participant ever opened it.
    pub async fn document(&self, document_id: &Uuid) -> Option<(String, u64)> {
        let rooms_r = self.ctx.rooms.read().await;
        rooms_r
            .get(document_id)
            .map(|room| (room.authority.content().to_string(), room.authority.version()))
    }
}

async fn send_direct(ws_sender: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParticipantInfo, TextChange};
    use crate::operation::Operation;

    fn context(config: ServerConfig) -> ServerContext {
        SyncServer::new(config).ctx
    }

    async fn join(ctx: &ServerContext, document_id: Uuid, name: &str) -> (Option<Membership>, SyncMessage) {
        let mut member = None;
        let step = SyncServer::process(
            ctx,
            &mut member,
            SyncMessage::JoinDocument {
                document_id,
                participant: ParticipantInfo::new(name),
            },
        )
        .await
        .unwrap();
        match step {
            Step::Reply(snapshot) => (member, snapshot),
            _ => panic!("join did not reply with a snapshot"),
        }
    }

    async fn next_for(m: &mut Membership) -> SyncMessage {
        loop {
            let frame = m.rx.recv().await.unwrap();
            if frame.recipients.includes(m.user_id) {
                return SyncMessage::decode(&frame.bytes).unwrap();
            }
        }
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_room: 50,
            broadcast_capacity: 512,
            max_history: 10,
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.config().max_history, 10);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.operations_applied, 0);
    }

    #[tokio::test]
    async fn test_join_replies_with_snapshot_and_announces() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let (mut alice, snapshot) = join(&ctx, doc, "Alice").await;
        assert!(matches!(snapshot, SyncMessage::DocumentSnapshot { version: 0, .. }));

        let (_bob, snapshot) = join(&ctx, doc, "Bob").await;
        match snapshot {
            SyncMessage::DocumentSnapshot { participants, .. } => assert_eq!(participants.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        let alice = alice.as_mut().unwrap();
        assert!(matches!(
            next_for(alice).await,
            SyncMessage::UserJoinedDocument { participant, .. } if participant.display_name == "Bob"
        ));
        assert_eq!(ctx.stats.read().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_text_change_relayed_then_acked_in_order() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let (mut alice, _) = join(&ctx, doc, "Alice").await;
        let (mut bob, _) = join(&ctx, doc, "Bob").await;
        let alice_m = alice.as_mut().unwrap();
        // Drain Bob's join announcement.
        next_for(alice_m).await;

        let alice_id = alice_m.user_id;
        let change = TextChange {
            document_id: doc,
            operation: Operation::insert(0, "hi"),
            version: 0,
            origin_id: alice_id,
        };
        SyncServer::process(&ctx, &mut alice, SyncMessage::TextChange(change.clone()))
            .await
            .unwrap();

        let bob_m = bob.as_mut().unwrap();
        assert_eq!(next_for(bob_m).await, SyncMessage::TextChange(change));
        let alice_m = alice.as_mut().unwrap();
        assert_eq!(
            next_for(alice_m).await,
            SyncMessage::Ack { document_id: doc, version: 1 }
        );
        assert_eq!(ctx.stats.read().await.operations_applied, 1);
    }

    #[tokio::test]
    async fn test_rejected_change_sends_resync() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let (mut alice, _) = join(&ctx, doc, "Alice").await;
        let alice_id = alice.as_ref().unwrap().user_id;

        let change = TextChange {
            document_id: doc,
            operation: Operation::insert(0, "x"),
            version: 7,
            origin_id: alice_id,
        };
        SyncServer::process(&ctx, &mut alice, SyncMessage::TextChange(change))
            .await
            .unwrap();

        let alice_m = alice.as_mut().unwrap();
        assert!(matches!(next_for(alice_m).await, SyncMessage::Resync { .. }));
        assert_eq!(ctx.stats.read().await.operations_rejected, 1);
    }

    #[tokio::test]
    async fn test_spoofed_origin_dropped() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let (mut alice, _) = join(&ctx, doc, "Alice").await;

        let change = TextChange {
            document_id: doc,
            operation: Operation::insert(0, "x"),
            version: 0,
            origin_id: Uuid::new_v4(),
        };
        SyncServer::process(&ctx, &mut alice, SyncMessage::TextChange(change))
            .await
            .unwrap();

        let rooms = ctx.rooms.read().await;
        assert_eq!(rooms.get(&doc).unwrap().authority.version(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_on_same_connection_resubscribes() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let participant = ParticipantInfo::new("Alice");
        let join_msg = SyncMessage::JoinDocument {
            document_id: doc,
            participant: participant.clone(),
        };
        let mut member = None;
        SyncServer::process(&ctx, &mut member, join_msg.clone()).await.unwrap();
        let step = SyncServer::process(&ctx, &mut member, join_msg).await.unwrap();
        assert!(matches!(step, Step::Reply(SyncMessage::DocumentSnapshot { .. })));

        let rooms = ctx.rooms.read().await;
        assert_eq!(rooms.get(&doc).unwrap().broadcast.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_full_closes() {
        let ctx = context(ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::default()
        });
        let doc = Uuid::new_v4();
        let _alice = join(&ctx, doc, "Alice").await;

        let mut member = None;
        let step = SyncServer::process(
            &ctx,
            &mut member,
            SyncMessage::JoinDocument {
                document_id: doc,
                participant: ParticipantInfo::new("Bob"),
            },
        )
        .await
        .unwrap();
        assert!(matches!(step, Step::Close));
        assert!(member.is_none());
    }

    #[tokio::test]
    async fn test_presence_relayed_to_others_only() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let (mut alice, _) = join(&ctx, doc, "Alice").await;
        let (mut bob, _) = join(&ctx, doc, "Bob").await;
        let alice_id = alice.as_ref().unwrap().user_id;

        let typing = SyncMessage::UserTyping { document_id: doc, user_id: alice_id };
        SyncServer::process(&ctx, &mut alice, typing.clone()).await.unwrap();

        assert_eq!(next_for(bob.as_mut().unwrap()).await, typing);

        // Alice only sees Bob's join.
        let alice_m = alice.as_mut().unwrap();
        assert!(matches!(next_for(alice_m).await, SyncMessage::UserJoinedDocument { .. }));
        let own_typing = alice_m.rx.try_recv().unwrap();
        assert!(!own_typing.recipients.includes(alice_id));
    }

    #[tokio::test]
    async fn test_depart_announces_leave() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let (alice, _) = join(&ctx, doc, "Alice").await;
        let (mut bob, _) = join(&ctx, doc, "Bob").await;
        let alice = alice.unwrap();

        SyncServer::depart(&ctx, &alice).await;
        assert_eq!(
            next_for(bob.as_mut().unwrap()).await,
            SyncMessage::UserLeftDocument { document_id: doc, user_id: alice.user_id }
        );
        let rooms = ctx.rooms.read().await;
        assert_eq!(rooms.get(&doc).unwrap().authority.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_lagged_receiver_told_to_resync() {
        let ctx = context(ServerConfig {
            broadcast_capacity: 2,
            ..ServerConfig::default()
        });
        let doc = Uuid::new_v4();
        let (mut alice, _) = join(&ctx, doc, "Alice").await;
        let (mut bob, _) = join(&ctx, doc, "Bob").await;
        let alice_id = alice.as_ref().unwrap().user_id;

        for version in 0..4 {
            let change = TextChange {
                document_id: doc,
                operation: Operation::insert(0, "x"),
                version,
                origin_id: alice_id,
            };
            SyncServer::process(&ctx, &mut alice, SyncMessage::TextChange(change))
                .await
                .unwrap();
        }

        let bob_m = bob.as_mut().unwrap();
        let frame = bob_m.rx.recv().await;
        assert!(matches!(frame, Err(broadcast::error::RecvError::Lagged(_))));
        let step = SyncServer::deliver(&ctx, bob_m, frame).await;
        assert!(matches!(
            step,
            Step::Reply(SyncMessage::Resync { document_id, .. }) if document_id == doc
        ));
        assert_eq!(ctx.stats.read().await.lag_resyncs, 1);

        // The fresh receiver carries no backlog, only what follows.
        let change = TextChange {
            document_id: doc,
            operation: Operation::insert(0, "y"),
            version: 4,
            origin_id: alice_id,
        };
        SyncServer::process(&ctx, &mut alice, SyncMessage::TextChange(change.clone()))
            .await
            .unwrap();
        let bob_m = bob.as_mut().unwrap();
        let frame = bob_m.rx.recv().await;
        match SyncServer::deliver(&ctx, bob_m, frame).await {
            Step::Forward(frame) => {
                assert_eq!(SyncMessage::decode(&frame.bytes).unwrap(), SyncMessage::TextChange(change));
            }
            _ => panic!("expected the next change to be forwarded"),
        }
    }

    #[tokio::test]
    async fn test_superseded_connection_departs_silently() {
        let ctx = context(ServerConfig::default());
        let doc = Uuid::new_v4();
        let participant = ParticipantInfo::new("Alice");
        let join_msg = SyncMessage::JoinDocument {
            document_id: doc,
            participant: participant.clone(),
        };
        let mut old_conn = None;
        SyncServer::process(&ctx, &mut old_conn, join_msg.clone()).await.unwrap();
        let (mut bob, _) = join(&ctx, doc, "Bob").await;
        let mut new_conn = None;
        SyncServer::process(&ctx, &mut new_conn, join_msg).await.unwrap();

        SyncServer::depart(&ctx, old_conn.as_ref().unwrap()).await;
        {
            let rooms = ctx.rooms.read().await;
            let room = rooms.get(&doc).unwrap();
            assert!(room.authority.is_member(&participant.user_id));
            assert!(room.broadcast.has_peer(&participant.user_id).await);
        }
        // Bob sees the reconnect announcement, but no departure.
        let bob_m = bob.as_mut().unwrap();
        assert!(matches!(next_for(bob_m).await, SyncMessage::UserJoinedDocument { .. }));
        assert!(bob_m.rx.try_recv().is_err());

        SyncServer::depart(&ctx, new_conn.as_ref().unwrap()).await;
        assert_eq!(
            next_for(bob.as_mut().unwrap()).await,
            SyncMessage::UserLeftDocument { document_id: doc, user_id: participant.user_id }
        );
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let ctx = context(ServerConfig::default());
        let mut member = None;
        let step = SyncServer::process(&ctx, &mut member, SyncMessage::Ping).await.unwrap();
        assert!(matches!(step, Step::Reply(SyncMessage::Pong)));
    }
}
