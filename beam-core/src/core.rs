//! Host-driven API: BeamCore receives events from the host, returns actions.
//!
//! The host feeds relay messages (`on_signal`), peer-channel frames (`on_frame`), channel
//! lifecycle (`on_channel_open`, `on_buffered_amount_low`, `on_channel_closed`), user intents
//! (`send_file`, `accept`, `reject`, `cancel`) and a periodic `tick`. Refill passes call
//! `next_chunk` / `seal_chunk` around their source reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkSource, Reassembly, Stored};
use crate::config::Config;
use crate::e2ee::{E2eeSession, Handshake, SEAL_OVERHEAD};
use crate::flow::{FlowController, RefillPermit, RefillTrigger, Reservation};
use crate::metrics::ThroughputMeter;
use crate::protocol::{
    unix_millis, ControlMessage, FileId, FileIdGenerator, PeerId, ResponseStatus,
};
use crate::session::{
    Artifact, Direction, FileInfo, IncomingTransfer, OutgoingTransfer, PendingOffer, Stage,
};
use crate::signaling::SignalingAdapter;
use crate::wire::{self, AckFrame, DataFrame, Frame, DATA_HEADER_LEN};

pub const REASON_CHANNEL_CLOSED: &str = "channel closed";
pub const REASON_RESPONSE_TIMEOUT: &str = "Response Timeout";
pub const REASON_USER_CANCEL: &str = "User clicked cancel";
pub const REASON_DECRYPTION_FAILURE: &str = "Decryption Failure";
pub const REASON_ENCRYPTION_FAILURE: &str = "Encryption Failure";
pub const REASON_READ_FAILED: &str = "Source read failed";
pub const REASON_E2EE_DISABLED: &str =
    "Receiver has end-to-end encryption disabled, can't accept an encrypted file.";
pub const REASON_E2EE_REQUIRED: &str =
    "Receiver has end-to-end encryption enabled, can't accept an unencrypted file.";
pub const REASON_MISSING_KEY: &str = "Responder did not provide an encryption key";
pub const REASON_UNEXPECTED_KEY: &str = "Responder requires encryption but the offer was unencrypted";
pub const REASON_KEY_AGREEMENT: &str = "Key agreement failed";
pub const GENERIC_REJECT_REASON: &str = "Rejected by peer";
pub const GENERIC_CANCEL_REASON: &str = "Cancelled by other user";

/// Reasons naming a transport failure are not re-alerted when echoed back by the peer.
pub fn is_transport_failure(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains("channel")
}

/// Action for the host to perform.
#[derive(Debug)]
pub enum Action {
    /// Deliver a control message to a peer through the signaling relay.
    Signal(PeerId, ControlMessage),
    /// Create the transport's connection object for `peer`; the initiator also opens the channel.
    Connect { peer: PeerId, initiator: bool },
    /// Hand an inbound negotiation payload to the transport, unmodified.
    Negotiate(PeerId, ControlMessage),
    /// Send a binary frame on the peer's open channel.
    SendFrame(PeerId, Vec<u8>),
    /// Start refill passes for the peer (the host caps them through `begin_refill`).
    Refill { peer: PeerId, trigger: RefillTrigger },
    /// Hand a completed file to the save collaborator.
    Deliver(Artifact),
    Notify(Event),
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An offer passed compatibility checks and awaits the user's decision.
    IncomingOffer(PendingOfferView),
    Stage {
        file_id: FileId,
        direction: Direction,
        stage: Stage,
    },
    Progress {
        file_id: FileId,
        direction: Direction,
        current: u64,
        total: u64,
    },
    Throughput { bytes_per_sec: f64 },
    Fingerprint {
        file_id: FileId,
        local: String,
        remote: Option<String>,
        verified: bool,
    },
    Rejected { file_id: FileId, reason: String },
    Cancelled {
        file_id: FileId,
        direction: Direction,
        reason: String,
        by_peer: bool,
        /// False when the user should not be alerted (withdrawn offer, echoed transport failure).
        alert: bool,
    },
}

/// What the UI shows for an incoming offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOfferView {
    pub file_id: FileId,
    pub from: PeerId,
    pub info: FileInfo,
    pub encrypted: bool,
}

/// A chunk pulled by a refill pass: read `len` bytes at `offset`, then call `seal_chunk`.
pub struct ChunkRead {
    pub file_id: FileId,
    pub peer: PeerId,
    pub index: u64,
    pub offset: u64,
    pub len: usize,
    pub source: Arc<dyn ChunkSource>,
    reservation: Reservation,
}

impl std::fmt::Debug for ChunkRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRead")
            .field("file_id", &self.file_id)
            .field("peer", &self.peer)
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// A framed DATA chunk ready for the channel. Keep it alive until the send completes.
#[derive(Debug)]
pub struct OutboundChunk {
    pub peer: PeerId,
    pub frame: Vec<u8>,
    _reservation: Reservation,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Send(OutboundChunk),
    /// Transfer cancelled or gone while the chunk was being read; stop the pass.
    Abort,
    /// Read or encryption failed; the transfer was cancelled. Perform the actions and stop.
    Failed(Vec<Action>),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct BeamCore {
    config: Config,
    ids: FileIdGenerator,
    outgoing: HashMap<FileId, OutgoingTransfer>,
    incoming: HashMap<FileId, IncomingTransfer>,
    pending: HashMap<FileId, PendingOffer>,
    early_fingerprints: HashMap<FileId, String>,
    signaling: SignalingAdapter,
    flow: FlowController,
    throughput: ThroughputMeter,
}

impl BeamCore {
    pub fn new(config: Config) -> Self {
        Self {
            flow: FlowController::new(&config),
            throughput: ThroughputMeter::new(config.throughput_window, config.throughput_min_span),
            config,
            ids: FileIdGenerator::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            pending: HashMap::new(),
            early_fingerprints: HashMap::new(),
            signaling: SignalingAdapter::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn e2ee_enabled(&self) -> bool {
        self.config.e2ee_enabled
    }

    /// Applies to offers made or received from now on.
    pub fn set_e2ee_enabled(&mut self, enabled: bool) {
        self.config.e2ee_enabled = enabled;
    }

    pub fn outgoing(&self, file_id: FileId) -> Option<&OutgoingTransfer> {
        self.outgoing.get(&file_id)
    }

    pub fn incoming(&self, file_id: FileId) -> Option<&IncomingTransfer> {
        self.incoming.get(&file_id)
    }

    pub fn pending_offer(&self, file_id: FileId) -> Option<&PendingOffer> {
        self.pending.get(&file_id)
    }

    pub fn has_active_transfers(&self) -> bool {
        !self.outgoing.is_empty() || !self.incoming.is_empty()
    }

    pub fn is_channel_open(&self, peer: &PeerId) -> bool {
        self.signaling.is_open(peer)
    }

    /// Claim a refill slot for `peer`; `None` when the per-peer cap is reached.
    pub fn begin_refill(&mut self, peer: &PeerId) -> Option<RefillPermit> {
        self.flow.try_begin_pass(peer)
    }

    pub fn active_refills(&self, peer: &PeerId) -> usize {
        self.flow.active_passes(peer)
    }

    // ---- user intents ----

    /// Offer a file to `peer`. Starts the response timeout.
    pub fn send_file(
        &mut self,
        peer: PeerId,
        name: impl Into<String>,
        mime: impl Into<String>,
        source: Arc<dyn ChunkSource>,
        now: Instant,
    ) -> (FileId, Vec<Action>) {
        let file_id = self.ids.next_id();
        let info = FileInfo {
            name: name.into(),
            size: source.len(),
            mime: mime.into(),
        };
        let encrypted = self.config.e2ee_enabled;
        let handshake = encrypted.then(Handshake::generate);
        let offer = ControlMessage::Offer {
            file_name: info.name.clone(),
            file_size: info.size,
            file_type: info.mime.clone(),
            file_id,
            encrypted,
            pubkey: handshake.as_ref().map(Handshake::public_key_b64),
        };
        info!(%peer, %file_id, size = info.size, encrypted, "offering file");
        self.outgoing.insert(
            file_id,
            OutgoingTransfer {
                file_id,
                peer: peer.clone(),
                info,
                source,
                stage: Stage::Offered,
                sent_offset: 0,
                acked_offset: 0,
                chunk_cursor: 0,
                cancelled: false,
                start_time: None,
                response_deadline: Some(now + self.config.response_timeout),
                release_at: None,
                encrypted,
                handshake,
                e2ee: None,
            },
        );
        let actions = vec![
            self.signaling.signal(&peer, offer),
            stage_event(file_id, Direction::Outgoing, Stage::Offered),
        ];
        (file_id, actions)
    }

    /// Accept a pending offer.
    pub fn accept(&mut self, file_id: FileId, now: Instant) -> Result<Vec<Action>, CoreError> {
        let offer = self
            .pending
            .remove(&file_id)
            .ok_or(CoreError::NoPendingOffer(file_id))?;
        let peer = offer.peer.clone();
        let mut actions = Vec::new();

        if let Some(reason) = self.compatibility(offer.encrypted) {
            actions.push(reject_message(&peer, file_id, Some(reason)));
            actions.push(stage_event(file_id, Direction::Incoming, Stage::Rejected));
            return Ok(actions);
        }

        let mut pubkey = None;
        let mut e2ee = None;
        if offer.encrypted {
            let handshake = Handshake::generate();
            pubkey = Some(handshake.public_key_b64());
            let session = offer
                .pubkey
                .as_deref()
                .ok_or(crate::e2ee::E2eeError::InvalidPublicKey)
                .and_then(|k| handshake.complete(k));
            match session {
                Ok(s) => e2ee = Some(s),
                Err(e) => {
                    warn!(%peer, %file_id, error = %e, "key agreement failed");
                    actions.push(reject_message(&peer, file_id, Some(REASON_KEY_AGREEMENT)));
                    actions.push(stage_event(file_id, Direction::Incoming, Stage::Rejected));
                    return Ok(actions);
                }
            }
        }

        actions.push(self.signaling.signal(
            &peer,
            ControlMessage::Response {
                file_id,
                status: ResponseStatus::Accepted,
                reason: None,
                pubkey,
            },
        ));
        if let Some(session) = &e2ee {
            actions.push(self.signaling.signal(
                &peer,
                ControlMessage::Fingerprint {
                    file_id,
                    fingerprint: session.local_fingerprint().to_string(),
                },
            ));
            actions.push(fingerprint_event(file_id, session));
        }

        info!(%peer, %file_id, size = offer.info.size, "offer accepted");
        let stage = if self.signaling.is_open(&peer) {
            Stage::Accepted
        } else {
            actions.extend(self.signaling.prepare(&peer));
            Stage::Negotiating
        };
        let transfer = IncomingTransfer {
            file_id,
            peer,
            reassembly: Reassembly::new(offer.info.size),
            info: offer.info,
            stage,
            e2ee,
            start_time: now,
        };
        actions.push(stage_event(file_id, Direction::Incoming, stage));

        if transfer.info.size == 0 {
            actions.extend(self.finish_incoming(transfer));
        } else {
            self.incoming.insert(file_id, transfer);
        }
        Ok(actions)
    }

    /// Decline a pending offer.
    pub fn reject(&mut self, file_id: FileId) -> Result<Vec<Action>, CoreError> {
        let offer = self
            .pending
            .remove(&file_id)
            .ok_or(CoreError::NoPendingOffer(file_id))?;
        info!(peer = %offer.peer, %file_id, "offer rejected by user");
        Ok(vec![
            reject_message(&offer.peer, file_id, None),
            stage_event(file_id, Direction::Incoming, Stage::Rejected),
        ])
    }

    /// Cancel a transfer in either role (or decline a pending offer). Always propagated to the peer.
    pub fn cancel(&mut self, file_id: FileId, reason: &str) -> Result<Vec<Action>, CoreError> {
        if self.pending.contains_key(&file_id) {
            return self.reject(file_id);
        }
        if let Some(t) = self.outgoing.get(&file_id) {
            if t.stage.is_terminal() {
                debug!(%file_id, stage = %t.stage, "cancel ignored for finished transfer");
                return Ok(Vec::new());
            }
            return Ok(self.cancel_outgoing(file_id, reason, Notice::Local { alert: false }));
        }
        if self.incoming.contains_key(&file_id) {
            return Ok(self.cancel_incoming(file_id, reason, Notice::Local { alert: false }));
        }
        Err(CoreError::UnknownTransfer(file_id))
    }

    /// Cancel every outgoing and incoming transfer.
    pub fn cancel_all(&mut self, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        let outgoing: Vec<FileId> = self
            .outgoing
            .values()
            .filter(|t| !t.stage.is_terminal())
            .map(|t| t.file_id)
            .collect();
        for file_id in outgoing {
            actions.extend(self.cancel_outgoing(file_id, reason, Notice::Local { alert: false }));
        }
        let incoming: Vec<FileId> = self.incoming.keys().copied().collect();
        for file_id in incoming {
            actions.extend(self.cancel_incoming(file_id, reason, Notice::Local { alert: false }));
        }
        actions
    }

    // ---- relay ----

    /// Process a control message from `peer` (relay, or text over the peer channel).
    pub fn on_signal(&mut self, peer: &PeerId, message: ControlMessage, now: Instant) -> Vec<Action> {
        match message {
            ControlMessage::Offer {
                file_name,
                file_size,
                file_type,
                file_id,
                encrypted,
                pubkey,
            } => {
                let info = FileInfo {
                    name: file_name,
                    size: file_size,
                    mime: file_type,
                };
                self.on_offer(peer, file_id, info, encrypted, pubkey)
            }
            ControlMessage::Response {
                file_id,
                status,
                reason,
                pubkey,
            } => self.on_response(peer, file_id, status, reason, pubkey, now),
            ControlMessage::Cancel { file_id, reason } => self.on_peer_cancel(peer, file_id, reason),
            ControlMessage::Fingerprint {
                file_id,
                fingerprint,
            } => self.on_fingerprint(peer, file_id, fingerprint),
            negotiation => self.signaling.inbound_negotiation(peer, negotiation),
        }
    }

    /// Negotiation payload produced by the local transport, bound for `peer` via the relay.
    pub fn on_transport_signal(&mut self, peer: &PeerId, message: ControlMessage) -> Vec<Action> {
        vec![self.signaling.signal(peer, message)]
    }

    fn compatibility(&self, encrypted: bool) -> Option<&'static str> {
        match (encrypted, self.config.e2ee_enabled) {
            (true, false) => Some(REASON_E2EE_DISABLED),
            (false, true) => Some(REASON_E2EE_REQUIRED),
            _ => None,
        }
    }

    fn on_offer(
        &mut self,
        peer: &PeerId,
        file_id: FileId,
        info: FileInfo,
        encrypted: bool,
        pubkey: Option<String>,
    ) -> Vec<Action> {
        if self.pending.contains_key(&file_id) || self.incoming.contains_key(&file_id) {
            debug!(%peer, %file_id, "duplicate offer ignored");
            return Vec::new();
        }
        if let Some(reason) = self.compatibility(encrypted) {
            warn!(%peer, %file_id, encrypted, "offer rejected: encryption mismatch");
            return vec![reject_message(peer, file_id, Some(reason))];
        }
        info!(%peer, %file_id, size = info.size, encrypted, "incoming offer");
        let offer = PendingOffer {
            file_id,
            peer: peer.clone(),
            info,
            encrypted,
            pubkey,
        };
        let mut actions = Vec::new();
        actions.extend(self.signaling.prepare(peer));
        actions.push(Action::Notify(Event::IncomingOffer(PendingOfferView {
            file_id,
            from: peer.clone(),
            info: offer.info.clone(),
            encrypted,
        })));
        actions.push(stage_event(file_id, Direction::Incoming, Stage::Offered));
        self.pending.insert(file_id, offer);
        actions
    }

    fn on_response(
        &mut self,
        peer: &PeerId,
        file_id: FileId,
        status: ResponseStatus,
        reason: Option<String>,
        pubkey: Option<String>,
        now: Instant,
    ) -> Vec<Action> {
        let Some(t) = self.outgoing.get_mut(&file_id) else {
            debug!(%peer, %file_id, "response for unknown transfer");
            return Vec::new();
        };
        if t.peer != *peer || t.stage != Stage::Offered {
            debug!(%peer, %file_id, stage = %t.stage, "unexpected response ignored");
            return Vec::new();
        }
        t.response_deadline = None;

        if status == ResponseStatus::Rejected {
            let reason = reason
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| GENERIC_REJECT_REASON.to_string());
            info!(%peer, %file_id, %reason, "offer rejected by peer");
            self.outgoing.remove(&file_id);
            self.early_fingerprints.remove(&file_id);
            return vec![Action::Notify(Event::Rejected { file_id, reason })];
        }

        let mut actions = Vec::new();
        match (t.encrypted, pubkey) {
            (true, None) => {
                return self.cancel_outgoing(file_id, REASON_MISSING_KEY, Notice::Local { alert: true });
            }
            (false, Some(_)) => {
                return self.cancel_outgoing(
                    file_id,
                    REASON_UNEXPECTED_KEY,
                    Notice::Local { alert: true },
                );
            }
            (true, Some(key)) => {
                let session = t
                    .handshake
                    .take()
                    .ok_or(crate::e2ee::E2eeError::Key)
                    .and_then(|h| h.complete(&key));
                let mut session = match session {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%peer, %file_id, error = %e, "key agreement failed");
                        return self.cancel_outgoing(
                            file_id,
                            REASON_KEY_AGREEMENT,
                            Notice::Local { alert: true },
                        );
                    }
                };
                if let Some(remote) = self.early_fingerprints.remove(&file_id) {
                    session.set_remote_fingerprint(remote);
                }
                actions.push(Action::Signal(
                    peer.clone(),
                    ControlMessage::Fingerprint {
                        file_id,
                        fingerprint: session.local_fingerprint().to_string(),
                    },
                ));
                actions.push(fingerprint_event(file_id, &session));
                t.e2ee = Some(session);
            }
            (false, None) => {}
        }

        info!(%peer, %file_id, "offer accepted by peer");
        if self.signaling.is_open(peer) {
            actions.extend(self.start_sending(file_id, now));
            actions.push(Action::Refill {
                peer: peer.clone(),
                trigger: RefillTrigger::Prime,
            });
        } else {
            t.stage = Stage::Negotiating;
            actions.push(stage_event(file_id, Direction::Outgoing, Stage::Negotiating));
            actions.extend(self.signaling.initiate(peer));
        }
        actions
    }

    fn on_peer_cancel(&mut self, peer: &PeerId, file_id: FileId, reason: String) -> Vec<Action> {
        if self.pending.get(&file_id).is_some_and(|o| o.peer == *peer) {
            self.pending.remove(&file_id);
            info!(%peer, %file_id, "offer withdrawn");
            return vec![
                stage_event(file_id, Direction::Incoming, Stage::Cancelled),
                Action::Notify(Event::Cancelled {
                    file_id,
                    direction: Direction::Incoming,
                    reason,
                    by_peer: true,
                    alert: false,
                }),
            ];
        }
        let reason = if reason.is_empty() {
            GENERIC_CANCEL_REASON.to_string()
        } else {
            reason
        };
        let alert = !is_transport_failure(&reason);
        if self.incoming.get(&file_id).is_some_and(|t| t.peer == *peer) {
            return self.cancel_incoming(file_id, &reason, Notice::Peer { alert });
        }
        if self.outgoing.get(&file_id).is_some_and(|t| t.peer == *peer) {
            return self.cancel_outgoing(file_id, &reason, Notice::Peer { alert });
        }
        debug!(%peer, %file_id, "cancel for unknown transfer");
        Vec::new()
    }

    fn on_fingerprint(&mut self, peer: &PeerId, file_id: FileId, fingerprint: String) -> Vec<Action> {
        let session = if let Some(t) = self.incoming.get_mut(&file_id).filter(|t| t.peer == *peer) {
            t.e2ee.as_mut()
        } else if let Some(t) = self.outgoing.get_mut(&file_id).filter(|t| t.peer == *peer) {
            if t.e2ee.is_none() && t.encrypted {
                // Arrived ahead of the response that lets us derive our own.
                self.early_fingerprints.insert(file_id, fingerprint);
                return Vec::new();
            }
            t.e2ee.as_mut()
        } else {
            None
        };
        let Some(session) = session else {
            debug!(%peer, %file_id, "fingerprint for unknown or unencrypted transfer");
            return Vec::new();
        };
        session.set_remote_fingerprint(fingerprint);
        if !session.is_verified() {
            warn!(%peer, %file_id, "fingerprint mismatch");
        }
        vec![fingerprint_event(file_id, session)]
    }

    // ---- peer channel ----

    /// The peer channel to `peer` opened: start deferred transfers and prime the pipeline.
    pub fn on_channel_open(&mut self, peer: &PeerId, now: Instant) -> Vec<Action> {
        self.signaling.mark_open(peer);
        info!(%peer, "peer channel open");
        let mut actions = Vec::new();

        let waiting: Vec<FileId> = self
            .outgoing
            .values()
            .filter(|t| t.peer == *peer && t.stage == Stage::Negotiating)
            .map(|t| t.file_id)
            .collect();
        for file_id in waiting {
            actions.extend(self.start_sending(file_id, now));
        }
        for t in self.incoming.values_mut() {
            if t.peer == *peer && t.stage == Stage::Negotiating {
                t.stage = Stage::Receiving;
                actions.push(stage_event(t.file_id, Direction::Incoming, Stage::Receiving));
            }
        }
        actions.push(Action::Refill {
            peer: peer.clone(),
            trigger: RefillTrigger::Prime,
        });
        actions
    }

    /// The channel's buffered amount dropped below the low-water mark.
    pub fn on_buffered_amount_low(&mut self, peer: &PeerId) -> Vec<Action> {
        if !self.signaling.is_open(peer) || !self.is_sending_to(peer) {
            return Vec::new();
        }
        vec![Action::Refill {
            peer: peer.clone(),
            trigger: RefillTrigger::BufferedLow,
        }]
    }

    /// Channel failed or closed: cancel every transfer bound to `peer`, in both roles.
    pub fn on_channel_closed(&mut self, peer: &PeerId) -> Vec<Action> {
        let existed = self.signaling.remove(peer);
        self.flow.forget(peer);
        let outgoing: Vec<FileId> = self
            .outgoing
            .values()
            .filter(|t| t.peer == *peer && !t.stage.is_terminal())
            .map(|t| t.file_id)
            .collect();
        let incoming: Vec<FileId> = self
            .incoming
            .values()
            .filter(|t| t.peer == *peer)
            .map(|t| t.file_id)
            .collect();
        if existed || !outgoing.is_empty() || !incoming.is_empty() {
            warn!(
                %peer,
                outgoing = outgoing.len(),
                incoming = incoming.len(),
                "peer channel closed"
            );
        }
        let mut actions = Vec::new();
        for file_id in outgoing {
            actions.extend(self.cancel_outgoing(
                file_id,
                REASON_CHANNEL_CLOSED,
                Notice::Local { alert: true },
            ));
        }
        for file_id in incoming {
            actions.extend(self.cancel_incoming(
                file_id,
                REASON_CHANNEL_CLOSED,
                Notice::Local { alert: true },
            ));
        }
        actions
    }

    /// Binary message from the peer channel. Malformed frames are dropped.
    pub fn on_frame(&mut self, peer: &PeerId, bytes: &[u8], now: Instant) -> Vec<Action> {
        match wire::decode_frame(bytes) {
            Ok(Frame::Data(data)) => self.on_data(peer, data, now),
            Ok(Frame::Ack(ack)) => self.on_ack(peer, ack, now),
            Err(e) => {
                debug!(%peer, error = %e, len = bytes.len(), "dropping malformed frame");
                Vec::new()
            }
        }
    }

    fn on_data(&mut self, peer: &PeerId, data: DataFrame, now: Instant) -> Vec<Action> {
        let file_id = data.file_id;
        let Some(t) = self.incoming.get_mut(&file_id).filter(|t| t.peer == *peer) else {
            debug!(%peer, %file_id, "data for unknown transfer");
            return Vec::new();
        };
        let total = t.info.size;
        if data.offset >= total {
            debug!(%peer, %file_id, offset = data.offset, "chunk offset out of range");
            return Vec::new();
        }

        let payload = match &t.e2ee {
            Some(session) => match session.open(&data.payload) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!(%peer, %file_id, error = %e, "chunk decryption failed");
                    return self.cancel_incoming(
                        file_id,
                        REASON_DECRYPTION_FAILURE,
                        Notice::Local { alert: true },
                    );
                }
            },
            None => data.payload,
        };
        let len = payload.len();
        let stored = t.reassembly.insert(data.offset, payload);
        if stored == Stored::Rejected {
            debug!(%peer, %file_id, offset = data.offset, len, "chunk range rejected");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if t.stage != Stage::Receiving {
            t.stage = Stage::Receiving;
            actions.push(stage_event(file_id, Direction::Incoming, Stage::Receiving));
        }
        if let Stored::New(delta) = stored {
            self.throughput.record(now, delta);
            actions.push(Action::Notify(Event::Progress {
                file_id,
                direction: Direction::Incoming,
                current: t.reassembly.received_bytes(),
                total,
            }));
        }
        let received = t.reassembly.received_bytes();
        actions.push(Action::SendFrame(
            peer.clone(),
            wire::encode_ack(file_id, received).to_vec(),
        ));

        if t.reassembly.is_complete() {
            if let Some(t) = self.incoming.remove(&file_id) {
                actions.extend(self.finish_incoming(t));
            }
        }
        actions
    }

    fn finish_incoming(&mut self, t: IncomingTransfer) -> Vec<Action> {
        let IncomingTransfer {
            file_id,
            peer,
            info,
            reassembly,
            ..
        } = t;
        let bytes = reassembly.assemble();
        info!(%peer, %file_id, size = bytes.len(), "file received");
        vec![
            stage_event(file_id, Direction::Incoming, Stage::Completed),
            Action::Deliver(Artifact {
                file_id,
                from: peer,
                info,
                bytes,
            }),
        ]
    }

    fn on_ack(&mut self, peer: &PeerId, ack: AckFrame, now: Instant) -> Vec<Action> {
        let linger = self.config.completion_linger;
        let Some(t) = self.outgoing.get_mut(&ack.file_id).filter(|t| t.peer == *peer) else {
            debug!(%peer, file_id = %ack.file_id, "ack for unknown transfer");
            return Vec::new();
        };
        if t.cancelled || t.stage != Stage::Sending {
            return Vec::new();
        }
        let received = ack.received.min(t.info.size);
        if received <= t.acked_offset {
            return Vec::new();
        }
        self.throughput.record(now, received - t.acked_offset);
        t.acked_offset = received;
        let mut actions = vec![Action::Notify(Event::Progress {
            file_id: t.file_id,
            direction: Direction::Outgoing,
            current: received,
            total: t.info.size,
        })];
        if t.acked_offset >= t.info.size {
            actions.extend(complete_outgoing(t, now + linger));
        }
        actions
    }

    fn start_sending(&mut self, file_id: FileId, now: Instant) -> Vec<Action> {
        let linger = self.config.completion_linger;
        let Some(t) = self.outgoing.get_mut(&file_id) else {
            return Vec::new();
        };
        t.stage = Stage::Sending;
        t.start_time = Some(now);
        info!(peer = %t.peer, %file_id, size = t.info.size, "sending");
        let mut actions = vec![
            stage_event(file_id, Direction::Outgoing, Stage::Sending),
            Action::Notify(Event::Progress {
                file_id,
                direction: Direction::Outgoing,
                current: 0,
                total: t.info.size,
            }),
        ];
        if t.info.size == 0 {
            actions.extend(complete_outgoing(t, now + linger));
        }
        actions
    }

    fn is_sending_to(&self, peer: &PeerId) -> bool {
        self.outgoing
            .values()
            .any(|t| t.peer == *peer && t.has_chunks_to_send(self.config.chunk_size))
    }

    // ---- refill pass ----

    /// Pull the next chunk for `peer` if the channel has room. Advances the chunk cursor.
    pub fn next_chunk(&mut self, peer: &PeerId, buffered: u64) -> Option<ChunkRead> {
        if !self.signaling.is_open(peer) {
            return None;
        }
        let chunk_size = self.config.chunk_size;
        let t = self
            .outgoing
            .values_mut()
            .filter(|t| t.peer == *peer && t.has_chunks_to_send(chunk_size))
            .min_by_key(|t| t.file_id)?;
        let index = t.chunk_cursor;
        let (offset, len) = chunk::chunk_span(index, t.info.size, chunk_size)?;
        let overhead = DATA_HEADER_LEN + if t.e2ee.is_some() { SEAL_OVERHEAD } else { 0 };
        let reservation = self.flow.admit(peer, buffered, (len + overhead) as u64)?;
        t.chunk_cursor += 1;
        Some(ChunkRead {
            file_id: t.file_id,
            peer: peer.clone(),
            index,
            offset,
            len,
            source: t.source.clone(),
            reservation,
        })
    }

    /// Finish a pulled chunk: re-check cancellation, encrypt if negotiated, and frame it.
    pub fn seal_chunk(&mut self, read: ChunkRead, body: std::io::Result<Vec<u8>>) -> ChunkOutcome {
        let ChunkRead {
            file_id,
            peer,
            offset,
            len,
            reservation,
            ..
        } = read;
        let Some(t) = self.outgoing.get_mut(&file_id) else {
            return ChunkOutcome::Abort;
        };
        if t.cancelled || t.peer != peer || t.stage != Stage::Sending {
            return ChunkOutcome::Abort;
        }
        let body = match body {
            Ok(b) if b.len() == len => b,
            Ok(b) => {
                warn!(%peer, %file_id, got = b.len(), len, "short read from source");
                return ChunkOutcome::Failed(self.cancel_outgoing(
                    file_id,
                    REASON_READ_FAILED,
                    Notice::Local { alert: true },
                ));
            }
            Err(e) => {
                warn!(%peer, %file_id, error = %e, "source read failed");
                return ChunkOutcome::Failed(self.cancel_outgoing(
                    file_id,
                    REASON_READ_FAILED,
                    Notice::Local { alert: true },
                ));
            }
        };
        let payload = match &t.e2ee {
            Some(session) => match session.seal(&body) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%peer, %file_id, error = %e, "chunk encryption failed");
                    return ChunkOutcome::Failed(self.cancel_outgoing(
                        file_id,
                        REASON_ENCRYPTION_FAILURE,
                        Notice::Local { alert: true },
                    ));
                }
            },
            None => body,
        };
        t.sent_offset = t.sent_offset.saturating_add(len as u64);
        ChunkOutcome::Send(OutboundChunk {
            peer,
            frame: wire::encode_data(file_id, offset, unix_millis(), &payload),
            _reservation: reservation,
        })
    }

    // ---- timers ----

    /// Periodic tick: response timeouts, completed-transfer release, throughput, periodic refill.
    /// `buffered` reports a peer channel's buffered amount, `None` if no channel exists.
    pub fn tick(&mut self, now: Instant, buffered: impl Fn(&PeerId) -> Option<u64>) -> Vec<Action> {
        let mut actions = Vec::new();

        let timed_out: Vec<FileId> = self
            .outgoing
            .values()
            .filter(|t| t.stage == Stage::Offered && t.response_deadline.is_some_and(|d| d <= now))
            .map(|t| t.file_id)
            .collect();
        for file_id in timed_out {
            warn!(%file_id, "no response to offer");
            actions.extend(self.cancel_outgoing(
                file_id,
                REASON_RESPONSE_TIMEOUT,
                Notice::Local { alert: true },
            ));
        }

        self.outgoing.retain(|file_id, t| {
            let release = t.stage == Stage::Completed && t.release_at.is_some_and(|r| r <= now);
            if release {
                debug!(%file_id, "releasing completed transfer");
            }
            !release
        });

        if self.has_active_transfers() {
            let bytes_per_sec = self.throughput.sample(now);
            actions.push(Action::Notify(Event::Throughput { bytes_per_sec }));
        } else if self.throughput.last_rate() != 0.0 {
            self.throughput.clear();
            actions.push(Action::Notify(Event::Throughput { bytes_per_sec: 0.0 }));
        } else {
            self.throughput.clear();
        }

        let floor = self.config.safety_floor;
        let chunk_size = self.config.chunk_size;
        let mut starving: Vec<PeerId> = self
            .outgoing
            .values()
            .filter(|t| t.has_chunks_to_send(chunk_size) && self.signaling.is_open(&t.peer))
            .filter(|t| buffered(&t.peer).is_some_and(|b| b < floor))
            .map(|t| t.peer.clone())
            .collect();
        starving.sort();
        starving.dedup();
        for peer in starving {
            actions.push(Action::Refill {
                peer,
                trigger: RefillTrigger::Periodic,
            });
        }
        actions
    }

    // ---- teardown ----

    fn cancel_outgoing(&mut self, file_id: FileId, reason: &str, notice: Notice) -> Vec<Action> {
        let Some(mut t) = self.outgoing.remove(&file_id) else {
            return Vec::new();
        };
        t.cancelled = true;
        self.early_fingerprints.remove(&file_id);
        warn!(peer = %t.peer, %file_id, %reason, "outgoing transfer cancelled");
        cancellation(t.peer.clone(), file_id, Direction::Outgoing, reason, notice)
    }

    fn cancel_incoming(&mut self, file_id: FileId, reason: &str, notice: Notice) -> Vec<Action> {
        let Some(t) = self.incoming.remove(&file_id) else {
            return Vec::new();
        };
        warn!(peer = %t.peer, %file_id, %reason, "incoming transfer cancelled");
        cancellation(t.peer.clone(), file_id, Direction::Incoming, reason, notice)
    }
}

impl Default for BeamCore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Who ended a transfer, and whether to alert the user.
#[derive(Debug, Clone, Copy)]
enum Notice {
    /// Local decision or local failure: tell the peer.
    Local { alert: bool },
    /// The peer cancelled: nothing to send back.
    Peer { alert: bool },
}

fn cancellation(
    peer: PeerId,
    file_id: FileId,
    direction: Direction,
    reason: &str,
    notice: Notice,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let (by_peer, alert) = match notice {
        Notice::Local { alert } => {
            actions.push(Action::Signal(
                peer,
                ControlMessage::Cancel {
                    file_id,
                    reason: reason.to_string(),
                },
            ));
            (false, alert)
        }
        Notice::Peer { alert } => (true, alert),
    };
    actions.push(stage_event(file_id, direction, Stage::Cancelled));
    actions.push(Action::Notify(Event::Cancelled {
        file_id,
        direction,
        reason: reason.to_string(),
        by_peer,
        alert,
    }));
    actions
}

fn complete_outgoing(t: &mut OutgoingTransfer, release_at: Instant) -> Vec<Action> {
    t.stage = Stage::Completed;
    t.release_at = Some(release_at);
    t.e2ee = None;
    info!(peer = %t.peer, file_id = %t.file_id, size = t.info.size, "file sent");
    vec![stage_event(t.file_id, Direction::Outgoing, Stage::Completed)]
}

fn reject_message(peer: &PeerId, file_id: FileId, reason: Option<&str>) -> Action {
    Action::Signal(
        peer.clone(),
        ControlMessage::Response {
            file_id,
            status: ResponseStatus::Rejected,
            reason: reason.map(str::to_string),
            pubkey: None,
        },
    )
}

fn stage_event(file_id: FileId, direction: Direction, stage: Stage) -> Action {
    Action::Notify(Event::Stage {
        file_id,
        direction,
        stage,
    })
}

fn fingerprint_event(file_id: FileId, session: &E2eeSession) -> Action {
    Action::Notify(Event::Fingerprint {
        file_id,
        local: session.local_fingerprint().to_string(),
        remote: session.remote_fingerprint().map(str::to_string),
        verified: session.is_verified(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(FileId),
    #[error("no pending offer {0}")]
    NoPendingOffer(FileId),
}
