//! Peer transport seam
//!
//! The engine addresses peers by [`PeerId`] only. [`ChannelTransport`] hands
//! every connected peer a bounded channel; a front end (stdio, websocket, ...)
//! drains it and serializes the messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::messages::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Delivery to peers never blocks the engine.
pub trait Transport: Send + Sync {
    fn send_to(&self, peer: PeerId, message: ServerMessage);

    fn send_to_many(&self, peers: &[PeerId], message: ServerMessage) {
        for peer in peers {
            self.send_to(*peer, message.clone());
        }
    }

    fn broadcast(&self, message: ServerMessage);
}

pub struct ChannelTransport {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<ServerMessage>>>,
    next_peer: AtomicU64,
    buffer: usize,
}

impl ChannelTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::Sender<ServerMessage>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new peer. The engine still has to be told about it.
    pub fn connect(&self) -> (PeerId, mpsc::Receiver<ServerMessage>) {
        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        self.peers().insert(peer, tx);
        debug!("Transport registered {}", peer);
        (peer, rx)
    }

    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.peers().remove(&peer).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    fn deliver(peer: PeerId, sender: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> bool {
        let lossy = message.is_lossy();
        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !lossy {
                    warn!("Outbound buffer of {} is full, dropping message", peer);
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Transport for ChannelTransport {
    fn send_to(&self, peer: PeerId, message: ServerMessage) {
        let mut peers = self.peers();
        let open = match peers.get(&peer) {
            Some(sender) => Self::deliver(peer, sender, message),
            None => return,
        };
        if !open {
            debug!("{} went away", peer);
            peers.remove(&peer);
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        let mut peers = self.peers();
        peers.retain(|peer, sender| Self::deliver(*peer, sender, message.clone()));
    }
}
