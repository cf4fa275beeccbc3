//! Two nodes in one process, wired by the in-memory relay and channel.

use std::sync::Arc;
use std::time::Duration;

use beam_core::core::{GENERIC_REJECT_REASON, REASON_CHANNEL_CLOSED, REASON_RESPONSE_TIMEOUT};
use beam_core::{Config, ControlMessage, Event, FileId, PeerId, Stage};
use beam_host::memory::MemoryNetwork;
use beam_host::{ChannelMessage, DirectorySink, Node, NodeEvent, TransportEvent};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Peer {
    id: PeerId,
    node: Node,
    events: UnboundedReceiver<NodeEvent>,
    dir: TempDir,
}

fn spawn_peer(net: &Arc<MemoryNetwork>, name: &str, config: Config) -> Peer {
    let id = PeerId::from(name);
    let dir = tempfile::tempdir().unwrap();
    let (node, events) = Node::spawn(
        config,
        Arc::new(net.relay(id.clone())),
        Arc::new(net.connector(id.clone())),
        Arc::new(DirectorySink::new(dir.path().join("downloads"))),
    )
    .unwrap();
    net.register(id.clone(), node.inbox());
    Peer {
        id,
        node,
        events,
        dir,
    }
}

fn plain() -> Config {
    Config {
        e2ee_enabled: false,
        ..Config::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Wait for the first event matching `f`, skipping the rest.
async fn wait_for<T>(
    events: &mut UnboundedReceiver<NodeEvent>,
    mut f: impl FnMut(&NodeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("node stopped");
            if let Some(t) = f(&event) {
                return t;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn incoming_offer(peer: &mut Peer) -> FileId {
    wait_for(&mut peer.events, |e| match e {
        NodeEvent::Core(Event::IncomingOffer(o)) => Some(o.file_id),
        _ => None,
    })
    .await
}

async fn saved(peer: &mut Peer, id: FileId) -> std::path::PathBuf {
    wait_for(&mut peer.events, |e| match e {
        NodeEvent::Saved { file_id, path } if *file_id == id => Some(path.clone()),
        NodeEvent::SaveFailed { error, .. } => panic!("save failed: {error}"),
        _ => None,
    })
    .await
}

async fn stage(peer: &mut Peer, id: FileId, want: Stage) {
    wait_for(&mut peer.events, |e| match e {
        NodeEvent::Core(Event::Stage {
            file_id, stage, ..
        }) if *file_id == id && *stage == want => Some(()),
        _ => None,
    })
    .await
}

async fn transfer(sender: &mut Peer, receiver: &mut Peer, data: &[u8], name: &str) -> FileId {
    let path = sender.dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    let id = sender
        .node
        .send_path(receiver.id.clone(), &path)
        .await
        .unwrap();
    assert_eq!(incoming_offer(receiver).await, id);
    receiver.node.accept(id).await.unwrap();
    let saved_to = saved(receiver, id).await;
    assert_eq!(std::fs::read(&saved_to).unwrap(), data);
    assert_eq!(saved_to.file_name().unwrap().to_str(), Some(name));
    stage(sender, id, Stage::Completed).await;
    id
}

#[tokio::test]
async fn plaintext_transfer() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());

    transfer(&mut alice, &mut bob, &pattern(1_000_000), "report.pdf").await;
    assert!(alice.node.is_channel_open(&bob.id).await);

    // Second file reuses the open channel.
    transfer(&mut alice, &mut bob, &pattern(70_000), "notes.txt").await;
}

#[tokio::test]
async fn encrypted_transfer_verifies_fingerprints() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", Config::default());
    let mut bob = spawn_peer(&net, "bob", Config::default());

    let path = alice.dir.path().join("secret.bin");
    let data = pattern(600_000);
    std::fs::write(&path, &data).unwrap();
    let id = alice.node.send_path(bob.id.clone(), &path).await.unwrap();
    assert_eq!(incoming_offer(&mut bob).await, id);
    bob.node.accept(id).await.unwrap();

    let verified = |e: &NodeEvent| match e {
        NodeEvent::Core(Event::Fingerprint {
            verified: true,
            local,
            ..
        }) => Some(local.clone()),
        _ => None,
    };
    let bob_fp = wait_for(&mut bob.events, verified).await;
    let alice_fp = wait_for(&mut alice.events, verified).await;
    assert_eq!(alice_fp, bob_fp);

    let saved_to = saved(&mut bob, id).await;
    assert_eq!(std::fs::read(saved_to).unwrap(), data);
}

#[tokio::test]
async fn empty_file_transfer() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());
    transfer(&mut alice, &mut bob, &[], "empty.txt").await;
}

#[tokio::test]
async fn encryption_mismatch_rejected_without_prompt() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", Config::default());
    let mut bob = spawn_peer(&net, "bob", plain());

    let source = Arc::new(beam_core::MemorySource::new(pattern(100)));
    let id = alice
        .node
        .send_file(bob.id.clone(), "a.bin", "", source)
        .await;
    let reason = wait_for(&mut alice.events, |e| match e {
        NodeEvent::Core(Event::Rejected { file_id, reason }) if *file_id == id => {
            Some(reason.clone())
        }
        _ => None,
    })
    .await;
    assert!(reason.contains("disabled"), "{reason}");

    while let Ok(event) = bob.events.try_recv() {
        assert!(!matches!(event, NodeEvent::Core(Event::IncomingOffer(_))));
    }
}

#[tokio::test]
async fn user_rejection_reaches_sender() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());

    let source = Arc::new(beam_core::MemorySource::new(pattern(100)));
    let id = alice.node.send_file(bob.id.clone(), "a.bin", "", source).await;
    assert_eq!(incoming_offer(&mut bob).await, id);
    bob.node.reject(id).await.unwrap();
    let reason = wait_for(&mut alice.events, |e| match e {
        NodeEvent::Core(Event::Rejected { reason, .. }) => Some(reason.clone()),
        _ => None,
    })
    .await;
    assert_eq!(reason, GENERIC_REJECT_REASON);
}

#[tokio::test]
async fn withdrawn_offer_is_silent() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());

    let source = Arc::new(beam_core::MemorySource::new(pattern(100)));
    let id = alice.node.send_file(bob.id.clone(), "a.bin", "", source).await;
    assert_eq!(incoming_offer(&mut bob).await, id);
    alice.node.cancel_all().await;

    let alert = wait_for(&mut bob.events, |e| match e {
        NodeEvent::Core(Event::Cancelled {
            file_id, alert, ..
        }) if *file_id == id => Some(*alert),
        _ => None,
    })
    .await;
    assert!(!alert);
    assert!(bob.node.accept(id).await.is_err());
}

#[tokio::test]
async fn unanswered_offer_times_out() {
    let net = MemoryNetwork::new();
    let config = Config {
        response_timeout: Duration::from_millis(300),
        tick_interval: Duration::from_millis(50),
        ..plain()
    };
    let mut alice = spawn_peer(&net, "alice", config);
    let mut bob = spawn_peer(&net, "bob", plain());

    let source = Arc::new(beam_core::MemorySource::new(pattern(100)));
    let id = alice.node.send_file(bob.id.clone(), "a.bin", "", source).await;
    assert_eq!(incoming_offer(&mut bob).await, id);

    let reason = wait_for(&mut alice.events, |e| match e {
        NodeEvent::Core(Event::Cancelled {
            file_id, reason, ..
        }) if *file_id == id => Some(reason.clone()),
        _ => None,
    })
    .await;
    assert_eq!(reason, REASON_RESPONSE_TIMEOUT);
    wait_for(&mut bob.events, |e| match e {
        NodeEvent::Core(Event::Cancelled { file_id, .. }) if *file_id == id => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn channel_loss_cancels_bound_transfers() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());
    transfer(&mut alice, &mut bob, &pattern(1000), "first.bin").await;

    let source = Arc::new(beam_core::MemorySource::new(pattern(100)));
    let id = alice.node.send_file(bob.id.clone(), "b.bin", "", source).await;
    assert_eq!(incoming_offer(&mut bob).await, id);

    assert!(net.disconnect(&alice.id, &bob.id));
    let (reason, alert) = wait_for(&mut alice.events, |e| match e {
        NodeEvent::Core(Event::Cancelled {
            file_id,
            reason,
            alert,
            ..
        }) if *file_id == id => Some((reason.clone(), *alert)),
        _ => None,
    })
    .await;
    assert_eq!(reason, REASON_CHANNEL_CLOSED);
    assert!(alert);

    tokio::time::timeout(Duration::from_secs(10), async {
        while alice.node.is_channel_open(&bob.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn malformed_relay_input_ignored() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());

    assert!(bob.node.inbox().relay("not json"));
    assert!(bob.node.inbox().relay(r#"{"sender_id":"alice","type":"mystery"}"#));
    transfer(&mut alice, &mut bob, &pattern(10), "ok.bin").await;
}

#[tokio::test]
async fn node_from_loaded_config_saves_into_download_dir() {
    let net = MemoryNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let inbox_dir = dir.path().join("inbox");
    let config = beam_host::config::load_from(&[dir.path().join("missing.toml")], |var| {
        match var {
            "BEAM_DOWNLOAD_DIR" => Some(inbox_dir.display().to_string()),
            "BEAM_E2EE" => Some("off".to_string()),
            "BEAM_LOG" => Some("beam_host=debug".to_string()),
            _ => None,
        }
    })
    .unwrap();

    let id = PeerId::from("bob");
    let (node, events) = Node::from_config(
        config,
        Arc::new(net.relay(id.clone())),
        Arc::new(net.connector(id.clone())),
    )
    .unwrap();
    net.register(id.clone(), node.inbox());
    let mut bob = Peer {
        id,
        node,
        events,
        dir,
    };
    // Sender frames with a smaller chunk than the receiver's default.
    let mut alice = spawn_peer(
        &net,
        "alice",
        Config {
            chunk_size: 64 * 1024,
            ..plain()
        },
    );

    let data = pattern(300_000);
    transfer(&mut alice, &mut bob, &data, "mixed.bin").await;
    assert_eq!(std::fs::read(inbox_dir.join("mixed.bin")).unwrap(), data);
}

#[tokio::test]
async fn control_text_on_channel_is_handled() {
    let net = MemoryNetwork::new();
    let mut alice = spawn_peer(&net, "alice", plain());
    let mut bob = spawn_peer(&net, "bob", plain());

    let source = Arc::new(beam_core::MemorySource::new(pattern(100)));
    let id = alice.node.send_file(bob.id.clone(), "a.bin", "", source).await;
    assert_eq!(incoming_offer(&mut bob).await, id);

    let text = |message: String| TransportEvent::Message {
        peer: alice.id.clone(),
        message: ChannelMessage::Text(message),
    };
    assert!(bob.node.inbox().transport(text("{broken".to_string())));
    let cancel = ControlMessage::Cancel {
        file_id: id,
        reason: "withdrawn".to_string(),
    };
    assert!(bob
        .node
        .inbox()
        .transport(text(serde_json::to_string(&cancel).unwrap())));

    let reason = wait_for(&mut bob.events, |e| match e {
        NodeEvent::Core(Event::Cancelled {
            file_id, reason, ..
        }) if *file_id == id => Some(reason.clone()),
        _ => None,
    })
    .await;
    assert_eq!(reason, "withdrawn");
    assert!(bob.node.accept(id).await.is_err());
}
