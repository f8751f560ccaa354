//! Per-room fan-out with audience filtering.
//!
//! Uses a tokio broadcast channel so one send reaches every connection in
//! the room. Each delivery names its audience; the connection task drops
//! deliveries that are not addressed to it. Publishing happens while the
//! room lock is held, so the channel order is the room's acceptance order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{ConnectionId, ServerMessage};

/// Who a delivery is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    /// Everyone but the originating connection.
    Except(ConnectionId),
    Only(ConnectionId),
}

impl Audience {
    pub fn includes(&self, connection_id: ConnectionId) -> bool {
        match self {
            Audience::All => true,
            Audience::Except(excluded) => *excluded != connection_id,
            Audience::Only(target) => *target == connection_id,
        }
    }
}

/// One message on a room channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub audience: Audience,
    pub message: ServerMessage,
}

pub type DeliveryReceiver = broadcast::Receiver<Arc<Delivery>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Sends that found no subscriber.
    pub messages_unheard: u64,
    pub receivers: usize,
}

/// Fan-out channel owned by one room.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Delivery>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_unheard: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow connection may fall behind before it
    /// lags and has to be resynced.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_unheard: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> DeliveryReceiver {
        self.sender.subscribe()
    }

    /// Publish to the room. Returns the number of live receivers.
    pub fn publish(&self, audience: Audience, message: ServerMessage) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(Delivery { audience, message })) {
            Ok(count) => count,
            Err(_) => {
                self.messages_unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_unheard: self.messages_unheard.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
