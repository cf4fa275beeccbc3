//! Beam peer-to-peer file transfer core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod e2ee;
pub mod flow;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod wire;

pub use chunk::{ChunkSource, MemorySource};
pub use config::{Config, ConfigError};
pub use crate::core::{Action, BeamCore, ChunkOutcome, ChunkRead, CoreError, Event, OutboundChunk};
pub use e2ee::{E2eeError, E2eeSession, Handshake};
pub use flow::{RefillPermit, RefillTrigger};
pub use protocol::{decode_signal, encode_signal, ControlMessage, FileId, PeerId, ResponseStatus};
pub use session::{Artifact, Direction, FileInfo, Stage};
pub use wire::{decode_frame, Frame, FrameDecodeError};
