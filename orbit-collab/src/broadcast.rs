//! Ordered fan-out of encoded frames to every connection in a document room.
//!
//! Uses one tokio broadcast channel per room. Every frame the authority emits
//! for a room (relayed edits, acks, presence) goes through the same channel,
//! so all connections observe the authority's order. Each frame names its
//! recipients; connections skip frames not meant for them.
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ParticipantInfo, ProtocolError, SyncMessage};

/// Who a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    /// Everyone except the participant whose action produced the frame.
    AllExcept(Uuid),
    Only(Uuid),
}

impl Recipients {
    pub fn includes(&self, user_id: Uuid) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(excluded) => *excluded != user_id,
            Self::Only(target) => *target == user_id,
        }
    }
}

/// A pre-encoded message plus its audience.
#[derive(Debug)]
pub struct Frame {
    pub recipients: Recipients,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_peers: usize,
}

/// Broadcast channel and membership for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: Arc<RwLock<HashMap<Uuid, ParticipantInfo>>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group.
    ///
    /// `capacity` is how many frames a slow receiver may fall behind before
    /// it lags and must be re-synchronized.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver.
    ///
    /// The receiver sees every frame sent after this call.
    pub async fn add_peer(&self, info: ParticipantInfo) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.user_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, user_id: &Uuid) -> Option<ParticipantInfo> {
        self.peers.write().await.remove(user_id)
    }

    /// Encode `msg` once and queue it for `recipients`.
    ///
    /// Returns the number of live receivers. Zero receivers is not an error.
    pub fn send(&self, recipients: Recipients, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.send_frame(Arc::new(Frame { recipients, bytes })))
    }

    pub fn send_frame(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Fresh receiver positioned at the current end of the channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ParticipantInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, user_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(user_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_frame(recipients: Recipients) -> Arc<Frame> {
        Arc::new(Frame {
            recipients,
            bytes: SyncMessage::Ping.encode().unwrap(),
        })
    }

    #[test]
    fn test_recipients() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(Recipients::All.includes(a));
        assert!(!Recipients::AllExcept(a).includes(a));
        assert!(Recipients::AllExcept(a).includes(b));
        assert!(Recipients::Only(a).includes(a));
        assert!(!Recipients::Only(a).includes(b));
    }

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let alice = ParticipantInfo::new("Alice");
        let id = alice.user_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert!(group.remove_peer(&id).await.is_some());
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let group = BroadcastGroup::new(16);
        let alice = ParticipantInfo::new("Alice");
        let bob = ParticipantInfo::new("Bob");
        let mut rx_alice = group.add_peer(alice.clone()).await;
        let mut rx_bob = group.add_peer(bob.clone()).await;

        let doc = Uuid::new_v4();
        let first = SyncMessage::Ack { document_id: doc, version: 1 };
        let second = SyncMessage::Ack { document_id: doc, version: 2 };
        assert_eq!(group.send(Recipients::Only(alice.user_id), &first).unwrap(), 2);
        group.send(Recipients::AllExcept(alice.user_id), &second).unwrap();

        for rx in [&mut rx_alice, &mut rx_bob] {
            let f1 = rx.recv().await.unwrap();
            let f2 = rx.recv().await.unwrap();
            assert_eq!(SyncMessage::decode(&f1.bytes).unwrap(), first);
            assert_eq!(SyncMessage::decode(&f2.bytes).unwrap(), second);
        }

        let f = rx_bob.try_recv();
        assert!(f.is_err());
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(ParticipantInfo::new("Slow")).await;
        for _ in 0..5 {
            group.send_frame(ping_frame(Recipients::All));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_and_capacity() {
        let group = BroadcastGroup::new(32);
        let _rx = group.add_peer(ParticipantInfo::new("Alice")).await;
        group.send_frame(ping_frame(Recipients::All));
        group.send_frame(ping_frame(Recipients::All));

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 32);
    }

    #[tokio::test]
    async fn test_send_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.send_frame(ping_frame(Recipients::All)), 0);
    }
}
