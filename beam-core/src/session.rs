//! Per-file transfer records for both roles.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::chunk::{self, ChunkSource, Reassembly};
use crate::e2ee::{E2eeSession, Handshake};
use crate::protocol::{FileId, PeerId};

/// Lifecycle stage reported to the UI.
///
/// Sender: `Offered -> Negotiating -> Sending -> Completed | Cancelled | Rejected`.
/// Receiver: `Offered -> Accepted -> [Negotiating] -> Receiving -> Completed | Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Offered,
    Accepted,
    Negotiating,
    Sending,
    Receiving,
    Completed,
    Rejected,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Rejected | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Offered => "offered",
            Stage::Accepted => "accepted",
            Stage::Negotiating => "negotiating",
            Stage::Sending => "sending",
            Stage::Receiving => "receiving",
            Stage::Completed => "completed",
            Stage::Rejected => "rejected",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Display metadata of a file on offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mime: String,
}

/// Sender-side state for one file.
pub struct OutgoingTransfer {
    pub(crate) file_id: FileId,
    pub(crate) peer: PeerId,
    pub(crate) info: FileInfo,
    pub(crate) source: Arc<dyn ChunkSource>,
    pub(crate) stage: Stage,
    /// Bytes handed to the channel.
    pub(crate) sent_offset: u64,
    /// Highest cumulative count the receiver has acknowledged.
    pub(crate) acked_offset: u64,
    /// Next chunk index to read.
    pub(crate) chunk_cursor: u64,
    pub(crate) cancelled: bool,
    pub(crate) start_time: Option<Instant>,
    pub(crate) response_deadline: Option<Instant>,
    pub(crate) release_at: Option<Instant>,
    pub(crate) encrypted: bool,
    pub(crate) handshake: Option<Handshake>,
    pub(crate) e2ee: Option<E2eeSession>,
}

impl OutgoingTransfer {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn sent_offset(&self) -> u64 {
        self.sent_offset
    }

    pub fn acked_offset(&self) -> u64 {
        self.acked_offset
    }

    pub fn chunk_cursor(&self) -> u64 {
        self.chunk_cursor
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn e2ee(&self) -> Option<&E2eeSession> {
        self.e2ee.as_ref()
    }

    /// Actively pushing chunks and more remain to be read.
    pub(crate) fn has_chunks_to_send(&self, chunk_size: u64) -> bool {
        self.stage == Stage::Sending
            && !self.cancelled
            && self.chunk_cursor < chunk::chunk_count(self.info.size, chunk_size)
    }
}

impl fmt::Debug for OutgoingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingTransfer")
            .field("file_id", &self.file_id)
            .field("peer", &self.peer)
            .field("info", &self.info)
            .field("stage", &self.stage)
            .field("sent_offset", &self.sent_offset)
            .field("acked_offset", &self.acked_offset)
            .field("chunk_cursor", &self.chunk_cursor)
            .field("cancelled", &self.cancelled)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

/// Receiver-side state for one accepted file.
#[derive(Debug)]
pub struct IncomingTransfer {
    pub(crate) file_id: FileId,
    pub(crate) peer: PeerId,
    pub(crate) info: FileInfo,
    pub(crate) stage: Stage,
    pub(crate) reassembly: Reassembly,
    pub(crate) e2ee: Option<E2eeSession>,
    pub(crate) start_time: Instant,
}

impl IncomingTransfer {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn received_bytes(&self) -> u64 {
        self.reassembly.received_bytes()
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn e2ee(&self) -> Option<&E2eeSession> {
        self.e2ee.as_ref()
    }
}

/// An offer surfaced to the user and awaiting accept/reject.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub file_id: FileId,
    pub peer: PeerId,
    pub info: FileInfo,
    pub encrypted: bool,
    pub(crate) pubkey: Option<String>,
}

/// Reassembled file handed to the save collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_id: FileId,
    pub from: PeerId,
    pub info: FileInfo,
    pub bytes: Vec<u8>,
}
