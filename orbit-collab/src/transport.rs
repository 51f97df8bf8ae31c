//! Transport adapters between a [`DocumentSession`](crate::session::DocumentSession)
//! and the authority.
//!
//! The session only needs a non-blocking `send`; inbound messages are fed to
//! it by whoever owns the receiving half (the [`SyncClient`](crate::client::SyncClient)
//! driver for WebSockets, the test itself for [`MemoryTransport`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, SyncMessage};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("outgoing queue full")]
    Full,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outbound half of a connection to the authority.
///
/// `send` must not block; implementations queue and return.
pub trait Transport: Send + Sync {
    fn send(&self, message: SyncMessage) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        (**self).send(message)
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// Records every sent message. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<SyncMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `send` fails with [`TransportError::Closed`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Remove and return everything sent so far.
    pub fn take_sent(&self) -> Vec<SyncMessage> {
        std::mem::take(&mut *self.log())
    }

    pub fn sent(&self) -> Vec<SyncMessage> {
        self.log().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.log().len()
    }

    fn log(&self) -> MutexGuard<'_, Vec<SyncMessage>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.log().push(message);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// WebSocket transport: a writer task drains an outgoing frame queue, a
/// reader task decodes inbound frames into a channel.
///
/// Dropping every clone of the transport closes the writer.
#[derive(Debug, Clone)]
pub struct WsTransport {
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl WsTransport {
    /// Connect to `url` and spawn the reader/writer tasks.
    ///
    /// The returned receiver yields decoded inbound messages and ends when
    /// the connection closes.
    pub async fn connect(
        url: &str,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SyncMessage>), TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(capacity);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode incoming frames
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            if in_tx.send(sync_msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::debug!("WebSocket reader finished");
        });

        Ok((Self { outgoing: out_tx }, in_rx))
    }
}

impl Transport for WsTransport {
    fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        let encoded = message.encode()?;
        self.outgoing.try_send(encoded).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
