//! Tokio host for the Beam transfer core.
//! Performs the core's actions against a signaling relay, peer channels and a save target.

pub mod config;
pub mod logging;
pub mod memory;
pub mod node;
mod refill;
pub mod sink;
pub mod source;
pub mod transport;

pub use config::HostConfig;
pub use node::{Inbox, Node, NodeEvent};
pub use sink::{ArtifactSink, DirectorySink};
pub use source::FileSource;
pub use transport::{
    ChannelConnector, ChannelMessage, PeerChannel, SignalingRelay, TransportError, TransportEvent,
};
