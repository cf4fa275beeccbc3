//! The coordinating node: owns the core, performs its actions, and drives the tick.
//!
//! All inputs (relay text, transport events, user intents) funnel through one mpsc queue
//! and are handled in order by a single task. Refill passes run as their own tasks and
//! only touch the core through short lock sections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use beam_core::core::REASON_USER_CANCEL;
use beam_core::{
    decode_signal, encode_signal, protocol, Action, BeamCore, ChunkSource, Config, ConfigError,
    CoreError, Event, FileId, PeerId,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, HostConfig};
use crate::logging;
use crate::refill;
use crate::sink::{ArtifactSink, DirectorySink};
use crate::source::FileSource;
use crate::transport::{
    ChannelConnector, ChannelMessage, PeerChannel, SignalingRelay, TransportEvent,
};

/// What the node reports to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Core(Event),
    Saved { file_id: FileId, path: PathBuf },
    SaveFailed { file_id: FileId, error: String },
}

pub(crate) enum Input {
    Relay(String),
    Transport(TransportEvent),
    Actions(Vec<Action>),
}

/// Entry point for transports and relays to report inbound traffic.
#[derive(Clone)]
pub struct Inbox(mpsc::UnboundedSender<Input>);

impl Inbox {
    /// An envelope received from the relay (`{"sender_id": .., "type": .., ..}`).
    pub fn relay(&self, envelope: impl Into<String>) -> bool {
        self.0.send(Input::Relay(envelope.into())).is_ok()
    }

    pub fn transport(&self, event: TransportEvent) -> bool {
        self.0.send(Input::Transport(event)).is_ok()
    }

    pub(crate) fn actions(&self, actions: Vec<Action>) {
        if !actions.is_empty() {
            let _ = self.0.send(Input::Actions(actions));
        }
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").finish_non_exhaustive()
    }
}

pub(crate) struct Inner {
    pub(crate) core: Mutex<BeamCore>,
    channels: Mutex<HashMap<PeerId, Arc<dyn PeerChannel>>>,
    relay: Arc<dyn SignalingRelay>,
    connector: Arc<dyn ChannelConnector>,
    sink: Arc<dyn ArtifactSink>,
    events: mpsc::UnboundedSender<NodeEvent>,
    pub(crate) inbox: Inbox,
}

/// Running node. Dropping it stops the event loop.
pub struct Node {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl Node {
    /// Validate `config` and start the event loop. Must be called inside a tokio runtime.
    pub fn spawn(
        config: Config,
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn ChannelConnector>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), ConfigError> {
        config.validate()?;
        let tick = config.tick_interval;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            core: Mutex::new(BeamCore::new(config)),
            channels: Mutex::new(HashMap::new()),
            relay,
            connector,
            sink,
            events: events_tx,
            inbox: Inbox(input_tx),
        });
        let task = tokio::spawn(run(inner.clone(), input_rx, tick));
        Ok((Node { inner, task }, events_rx))
    }

    /// Start a node from host configuration: installs the log subscriber and saves received
    /// files under `download_dir`.
    pub fn from_config(
        config: HostConfig,
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), ConfigError> {
        logging::init(&config.log_filter);
        info!(
            download_dir = %config.download_dir.display(),
            e2ee = config.transfer.e2ee_enabled,
            "starting node"
        );
        let sink = Arc::new(DirectorySink::new(config.download_dir));
        Self::spawn(config.transfer, relay, connector, sink)
    }

    /// [`config::load`] followed by [`Node::from_config`].
    pub fn load(
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), config::ConfigError> {
        let config = config::load()?;
        Ok(Self::from_config(config, relay, connector)?)
    }

    pub fn inbox(&self) -> Inbox {
        self.inner.inbox.clone()
    }

    /// Offer `source` to `peer`.
    pub async fn send_file(
        &self,
        peer: PeerId,
        name: impl Into<String>,
        mime: impl Into<String>,
        source: Arc<dyn ChunkSource>,
    ) -> FileId {
        let (file_id, actions) =
            self.inner
                .core
                .lock()
                .await
                .send_file(peer, name, mime, source, Instant::now());
        self.inner.inbox.actions(actions);
        file_id
    }

    /// Offer a file from disk to `peer`.
    pub async fn send_path(&self, peer: PeerId, path: impl AsRef<Path>) -> anyhow::Result<FileId> {
        let path = path.as_ref();
        let source = FileSource::open(path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let name = source.file_name();
        Ok(self
            .send_file(peer, name, "application/octet-stream", Arc::new(source))
            .await)
    }

    pub async fn accept(&self, file_id: FileId) -> Result<(), CoreError> {
        let actions = self.inner.core.lock().await.accept(file_id, Instant::now())?;
        self.inner.inbox.actions(actions);
        Ok(())
    }

    pub async fn reject(&self, file_id: FileId) -> Result<(), CoreError> {
        let actions = self.inner.core.lock().await.reject(file_id)?;
        self.inner.inbox.actions(actions);
        Ok(())
    }

    pub async fn cancel(&self, file_id: FileId) -> Result<(), CoreError> {
        let actions = self
            .inner
            .core
            .lock()
            .await
            .cancel(file_id, REASON_USER_CANCEL)?;
        self.inner.inbox.actions(actions);
        Ok(())
    }

    pub async fn cancel_all(&self) {
        let actions = self.inner.core.lock().await.cancel_all(REASON_USER_CANCEL);
        self.inner.inbox.actions(actions);
    }

    pub async fn set_e2ee_enabled(&self, enabled: bool) {
        self.inner.core.lock().await.set_e2ee_enabled(enabled);
        info!(enabled, "end-to-end encryption preference changed");
    }

    pub async fn is_channel_open(&self, peer: &PeerId) -> bool {
        self.inner.core.lock().await.is_channel_open(peer)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(inner: Arc<Inner>, mut input: mpsc::UnboundedReceiver<Input>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            next = input.recv() => match next {
                Some(i) => inner.handle(i).await,
                None => break,
            },
            _ = ticker.tick() => inner.on_tick().await,
        }
    }
}

impl Inner {
    pub(crate) async fn channel(&self, peer: &PeerId) -> Option<Arc<dyn PeerChannel>> {
        self.channels.lock().await.get(peer).cloned()
    }

    async fn handle(self: &Arc<Self>, input: Input) {
        let now = Instant::now();
        let actions = match input {
            Input::Relay(text) => match decode_signal(&text) {
                Ok((peer, message)) => self.core.lock().await.on_signal(&peer, message, now),
                Err(e) => {
                    debug!(error = %e, "dropping malformed relay message");
                    return;
                }
            },
            Input::Transport(event) => self.on_transport(event, now).await,
            Input::Actions(actions) => actions,
        };
        self.perform(actions).await;
    }

    async fn on_transport(&self, event: TransportEvent, now: Instant) -> Vec<Action> {
        match event {
            TransportEvent::Open { peer, channel } => {
                let low_water = self.core.lock().await.config().low_water;
                channel.set_buffered_amount_low_threshold(low_water);
                self.channels.lock().await.insert(peer.clone(), channel);
                self.core.lock().await.on_channel_open(&peer, now)
            }
            TransportEvent::BufferedAmountLow(peer) => {
                self.core.lock().await.on_buffered_amount_low(&peer)
            }
            TransportEvent::Message {
                peer,
                message: ChannelMessage::Binary(bytes),
            } => self.core.lock().await.on_frame(&peer, &bytes, now),
            TransportEvent::Message {
                peer,
                message: ChannelMessage::Text(text),
            } => match protocol::decode_control(&text) {
                Ok(message) => self.core.lock().await.on_signal(&peer, message, now),
                Err(e) => {
                    debug!(%peer, error = %e, "dropping malformed channel text");
                    Vec::new()
                }
            },
            TransportEvent::Closed { peer, reason } => {
                info!(%peer, %reason, "transport closed");
                if let Some(channel) = self.channels.lock().await.remove(&peer) {
                    channel.close();
                }
                self.core.lock().await.on_channel_closed(&peer)
            }
            TransportEvent::Negotiation { peer, message } => {
                self.core.lock().await.on_transport_signal(&peer, message)
            }
        }
    }

    async fn on_tick(&self) {
        let buffered: HashMap<PeerId, u64> = self
            .channels
            .lock()
            .await
            .iter()
            .map(|(p, c)| (p.clone(), c.buffered_amount()))
            .collect();
        let actions = self
            .core
            .lock()
            .await
            .tick(Instant::now(), |p| buffered.get(p).copied());
        self.inbox.actions(actions);
    }

    async fn perform(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Signal(peer, message) => match encode_signal(&peer, &message) {
                    Ok(envelope) => {
                        if let Err(e) = self.relay.send(envelope).await {
                            warn!(%peer, error = %e, "relay send failed");
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "failed to encode control message"),
                },
                Action::Connect { peer, initiator } => {
                    if let Err(e) = self
                        .connector
                        .connect(peer.clone(), initiator, self.inbox.clone())
                        .await
                    {
                        warn!(%peer, error = %e, "connection setup failed");
                        self.inbox.transport(TransportEvent::Closed {
                            peer,
                            reason: "channel failed".to_string(),
                        });
                    }
                }
                Action::Negotiate(peer, message) => {
                    if let Err(e) = self.connector.negotiate(&peer, message).await {
                        warn!(%peer, error = %e, "negotiation failed");
                    }
                }
                Action::SendFrame(peer, frame) => match self.channel(&peer).await {
                    Some(channel) => {
                        if let Err(e) = channel.send(frame).await {
                            warn!(%peer, error = %e, "channel send failed");
                        }
                    }
                    None => debug!(%peer, "no channel for frame"),
                },
                Action::Refill { peer, trigger } => refill::start(self, peer, trigger).await,
                Action::Deliver(artifact) => {
                    let sink = self.sink.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let file_id = artifact.file_id;
                        let event = match sink.save(artifact).await {
                            Ok(path) => {
                                info!(%file_id, path = %path.display(), "file saved");
                                NodeEvent::Saved { file_id, path }
                            }
                            Err(e) => {
                                warn!(%file_id, error = %e, "saving file failed");
                                NodeEvent::SaveFailed {
                                    file_id,
                                    error: format!("{e:#}"),
                                }
                            }
                        };
                        let _ = events.send(event);
                    });
                }
                Action::Notify(event) => {
                    let _ = self.events.send(NodeEvent::Core(event));
                }
            }
        }
    }
}
