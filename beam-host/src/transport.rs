//! Seams to the outside world: the signaling relay and the peer-channel transport.
//!
//! Transports report what happens on their side by pushing [`TransportEvent`]s into the
//! node's [`Inbox`]; the node calls back into them to send frames and negotiation payloads.

use std::sync::Arc;

use async_trait::async_trait;
use beam_core::{ControlMessage, PeerId};

use crate::node::Inbox;

/// Store-and-forward relay keyed by user identity.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Hand an encoded envelope (`{"target_user_id": .., "type": .., ..}`) to the relay.
    async fn send(&self, envelope: String) -> Result<(), TransportError>;
}

/// An open, reliable, possibly unordered binary channel to one peer. Text arriving on it
/// is read as control messages; the node itself only sends frames.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Bytes queued but not yet transmitted.
    fn buffered_amount(&self) -> u64;

    /// Report `BufferedAmountLow` when the buffered amount drops below `bytes`.
    fn set_buffered_amount_low_threshold(&self, bytes: u64);

    fn close(&self);
}

/// Creates connection objects and applies negotiation payloads.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Create the connection object for `peer`. The initiator opens the data channel and
    /// produces the first negotiation payload. Everything that follows is reported on `inbox`.
    async fn connect(&self, peer: PeerId, initiator: bool, inbox: Inbox) -> Result<(), TransportError>;

    /// Apply a negotiation payload relayed from `peer`.
    async fn negotiate(&self, peer: &PeerId, message: ControlMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Binary(Vec<u8>),
    Text(String),
}

pub enum TransportEvent {
    Open {
        peer: PeerId,
        channel: Arc<dyn PeerChannel>,
    },
    BufferedAmountLow(PeerId),
    Message {
        peer: PeerId,
        message: ChannelMessage,
    },
    /// The channel closed or the connection failed.
    Closed { peer: PeerId, reason: String },
    /// Negotiation payload produced locally, to be relayed to `peer`.
    Negotiation {
        peer: PeerId,
        message: ControlMessage,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Open { peer, .. } => f.debug_struct("Open").field("peer", peer).finish(),
            TransportEvent::BufferedAmountLow(peer) => {
                f.debug_tuple("BufferedAmountLow").field(peer).finish()
            }
            TransportEvent::Message { peer, message } => f
                .debug_struct("Message")
                .field("peer", peer)
                .field("message", message)
                .finish(),
            TransportEvent::Closed { peer, reason } => f
                .debug_struct("Closed")
                .field("peer", peer)
                .field("reason", reason)
                .finish(),
            TransportEvent::Negotiation { peer, message } => f
                .debug_struct("Negotiation")
                .field("peer", peer)
                .field("message", message)
                .finish(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("no connection to {0}")]
    NotConnected(PeerId),
    #[error("relay unavailable: {0}")]
    Relay(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}
