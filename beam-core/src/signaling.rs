//! Signaling adapter: one connection object per remote endpoint, and the translation of
//! session intents into relay messages and transport requests.

use std::collections::HashMap;

use tracing::debug;

use crate::core::Action;
use crate::protocol::{ControlMessage, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Peer channel being negotiated; `initiator` is true on the side that sent the transport offer.
    Negotiating { initiator: bool },
    Open,
}

#[derive(Debug, Default)]
pub struct SignalingAdapter {
    links: HashMap<PeerId, LinkState>,
}

impl SignalingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answering side: make sure a connection object exists so an inbound transport offer can land.
    pub fn prepare(&mut self, peer: &PeerId) -> Option<Action> {
        if self.links.contains_key(peer) {
            return None;
        }
        self.links
            .insert(peer.clone(), LinkState::Negotiating { initiator: false });
        debug!(%peer, "preparing peer connection");
        Some(Action::Connect {
            peer: peer.clone(),
            initiator: false,
        })
    }

    /// Offering side: start channel negotiation unless a channel is open or already being offered.
    pub fn initiate(&mut self, peer: &PeerId) -> Option<Action> {
        match self.links.get(peer) {
            Some(LinkState::Open) | Some(LinkState::Negotiating { initiator: true }) => None,
            _ => {
                self.links
                    .insert(peer.clone(), LinkState::Negotiating { initiator: true });
                debug!(%peer, "initiating peer channel");
                Some(Action::Connect {
                    peer: peer.clone(),
                    initiator: true,
                })
            }
        }
    }

    /// Record the channel as open. Returns false if it was already open.
    pub fn mark_open(&mut self, peer: &PeerId) -> bool {
        let previous = self.links.insert(peer.clone(), LinkState::Open);
        previous != Some(LinkState::Open)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.links.get(peer) == Some(&LinkState::Open)
    }

    /// Tear down the connection object. Returns true if one existed.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.links.remove(peer).is_some()
    }

    /// Control message bound for the relay.
    pub fn signal(&self, peer: &PeerId, message: ControlMessage) -> Action {
        Action::Signal(peer.clone(), message)
    }

    /// Inbound negotiation payload from the relay: hand it to the transport untouched.
    pub fn inbound_negotiation(&mut self, peer: &PeerId, message: ControlMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        actions.extend(self.prepare(peer));
        actions.push(Action::Negotiate(peer.clone(), message));
        actions
    }
}
