//! Refill passes: tasks that pull chunks from the core, read them, and hand them to the channel.

use std::sync::Arc;

use beam_core::{ChunkOutcome, PeerId, RefillPermit, RefillTrigger};
use tracing::{debug, warn};

use crate::node::Inner;
use crate::transport::PeerChannel;

/// Spawn up to `trigger.passes()` passes for `peer`, bounded by the per-peer cap.
pub(crate) async fn start(inner: &Arc<Inner>, peer: PeerId, trigger: RefillTrigger) {
    let Some(channel) = inner.channel(&peer).await else {
        debug!(%peer, ?trigger, "refill skipped, no channel");
        return;
    };
    let mut core = inner.core.lock().await;
    let wanted = trigger.passes(core.config());
    let mut started = 0;
    while started < wanted {
        let Some(permit) = core.begin_refill(&peer) else {
            break;
        };
        tokio::spawn(run_pass(inner.clone(), peer.clone(), channel.clone(), permit));
        started += 1;
    }
    drop(core);
    debug!(%peer, ?trigger, started, "refill passes started");
}

async fn run_pass(
    inner: Arc<Inner>,
    peer: PeerId,
    channel: Arc<dyn PeerChannel>,
    _permit: RefillPermit,
) {
    let mut sent = 0usize;
    loop {
        let buffered = channel.buffered_amount();
        let read = inner.core.lock().await.next_chunk(&peer, buffered);
        let Some(read) = read else {
            break;
        };
        let body = read.source.read_at(read.offset, read.len).await;
        let outcome = inner.core.lock().await.seal_chunk(read, body);
        match outcome {
            ChunkOutcome::Send(mut chunk) => {
                let frame = std::mem::take(&mut chunk.frame);
                // The reservation in `chunk` covers the frame until the channel has it.
                let result = channel.send(frame).await;
                drop(chunk);
                if let Err(e) = result {
                    warn!(%peer, error = %e, "channel send failed");
                    break;
                }
                sent += 1;
            }
            ChunkOutcome::Abort => break,
            ChunkOutcome::Failed(actions) => {
                inner.inbox.actions(actions);
                break;
            }
        }
    }
    debug!(%peer, sent, "refill pass finished");
}
