//! In-process relay and peer channels. Nodes in one process talk through a shared
//! [`MemoryNetwork`]; negotiation still goes offer -> relay -> answer -> relay before the
//! channel opens, so the whole signaling path is exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beam_core::{ControlMessage, PeerId};
use serde_json::{json, Value};
use tracing::debug;

use crate::node::Inbox;
use crate::transport::{
    ChannelConnector, ChannelMessage, PeerChannel, SignalingRelay, TransportError, TransportEvent,
};

#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: Mutex<HashMap<PeerId, Inbox>>,
    links: Mutex<HashMap<(PeerId, PeerId), Arc<AtomicBool>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `peer` reachable through the relay.
    pub fn register(&self, peer: PeerId, inbox: Inbox) {
        lock(&self.inboxes).insert(peer, inbox);
    }

    pub fn relay(self: &Arc<Self>, local: PeerId) -> MemoryRelay {
        MemoryRelay {
            net: self.clone(),
            local,
        }
    }

    pub fn connector(self: &Arc<Self>, local: PeerId) -> MemoryConnector {
        MemoryConnector {
            net: self.clone(),
            local,
        }
    }

    /// Close the channel between `a` and `b`, as if the transport failed.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) -> bool {
        let closed = lock(&self.links).remove(&link_key(a, b));
        let Some(closed) = closed else {
            return false;
        };
        if closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(inbox) = self.inbox(local) {
                inbox.transport(TransportEvent::Closed {
                    peer: remote.clone(),
                    reason: "channel closed".to_string(),
                });
            }
        }
        true
    }

    fn inbox(&self, peer: &PeerId) -> Option<Inbox> {
        lock(&self.inboxes).get(peer).cloned()
    }

    fn open(&self, a: &PeerId, b: &PeerId) -> Result<(), TransportError> {
        let inbox_a = self
            .inbox(a)
            .ok_or_else(|| TransportError::NotConnected(a.clone()))?;
        let inbox_b = self
            .inbox(b)
            .ok_or_else(|| TransportError::NotConnected(b.clone()))?;
        let closed = Arc::new(AtomicBool::new(false));
        if let Some(old) = lock(&self.links).insert(link_key(a, b), closed.clone()) {
            old.store(true, Ordering::Release);
        }
        let to_b = MemoryChannel::new(a.clone(), inbox_b.clone(), closed.clone());
        let to_a = MemoryChannel::new(b.clone(), inbox_a.clone(), closed);
        debug!(%a, %b, "memory channel open");
        inbox_a.transport(TransportEvent::Open {
            peer: b.clone(),
            channel: Arc::new(to_b),
        });
        inbox_b.transport(TransportEvent::Open {
            peer: a.clone(),
            channel: Arc::new(to_a),
        });
        Ok(())
    }
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Relay endpoint for one user: rewrites `target_user_id` into `sender_id` on delivery.
pub struct MemoryRelay {
    net: Arc<MemoryNetwork>,
    local: PeerId,
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn send(&self, envelope: String) -> Result<(), TransportError> {
        let mut value: Value =
            serde_json::from_str(&envelope).map_err(|e| TransportError::Relay(e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| TransportError::Relay("envelope is not an object".into()))?;
        let target = match object.remove("target_user_id") {
            Some(Value::String(s)) => PeerId::new(s),
            _ => return Err(TransportError::Relay("missing target_user_id".into())),
        };
        object.insert("sender_id".into(), Value::String(self.local.as_str().to_string()));
        let inbox = self
            .net
            .inbox(&target)
            .ok_or_else(|| TransportError::NotConnected(target.clone()))?;
        if !inbox.relay(value.to_string()) {
            return Err(TransportError::Relay(format!("{target} is offline")));
        }
        Ok(())
    }
}

pub struct MemoryConnector {
    net: Arc<MemoryNetwork>,
    local: PeerId,
}

impl MemoryConnector {
    fn emit(&self, peer: &PeerId, message: ControlMessage) -> Result<(), TransportError> {
        let inbox = self
            .net
            .inbox(&self.local)
            .ok_or_else(|| TransportError::NotConnected(self.local.clone()))?;
        inbox.transport(TransportEvent::Negotiation {
            peer: peer.clone(),
            message,
        });
        Ok(())
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(&self, peer: PeerId, initiator: bool, _inbox: Inbox) -> Result<(), TransportError> {
        if initiator {
            self.emit(
                &peer,
                ControlMessage::NegotiationOffer {
                    offer: json!({"type": "offer", "sdp": "memory"}),
                },
            )?;
        }
        Ok(())
    }

    async fn negotiate(&self, peer: &PeerId, message: ControlMessage) -> Result<(), TransportError> {
        match message {
            ControlMessage::NegotiationOffer { .. } => self.emit(
                peer,
                ControlMessage::NegotiationAnswer {
                    answer: json!({"type": "answer", "sdp": "memory"}),
                },
            ),
            ControlMessage::NegotiationAnswer { .. } => self.net.open(&self.local, peer),
            ControlMessage::NegotiationIce { .. } => Ok(()),
            other => Err(TransportError::Negotiation(format!(
                "unexpected message {other:?}"
            ))),
        }
    }
}

/// One direction of an in-process channel. Delivery is immediate, so nothing stays buffered.
pub struct MemoryChannel {
    local: PeerId,
    remote_inbox: Inbox,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn new(local: PeerId, remote_inbox: Inbox, closed: Arc<AtomicBool>) -> Self {
        Self {
            local,
            remote_inbox,
            closed,
        }
    }

    fn deliver(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let delivered = self.remote_inbox.transport(TransportEvent::Message {
            peer: self.local.clone(),
            message,
        });
        if delivered {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.deliver(ChannelMessage::Binary(frame))
    }

    fn buffered_amount(&self) -> u64 {
        0
    }

    // Never buffers, so the low-water event never fires.
    fn set_buffered_amount_low_threshold(&self, _bytes: u64) {}

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
