//! Flow control: bounded concurrent refill passes per peer and a buffered-bytes admission check.
//!
//! A refill pass is a loop run by the host: acquire a [`RefillPermit`], then repeatedly
//! pull the next chunk (admitted only while `buffered + reserved < high_water`), read,
//! seal, and hand it to the channel. Bytes pulled but not yet handed over are held in a
//! [`Reservation`] so concurrent passes see each other's in-flight chunks. Both guards
//! release on drop, so a pass that errors or unwinds never leaks its slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::protocol::PeerId;

/// Why a batch of refill passes is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillTrigger {
    /// Channel just opened, or a transfer started sending on an open channel.
    Prime,
    /// Channel reported its buffered amount fell below the low-water mark.
    BufferedLow,
    /// Periodic tick found the channel below the safety floor.
    Periodic,
}

impl RefillTrigger {
    pub fn passes(self, config: &Config) -> usize {
        match self {
            RefillTrigger::Prime => config.prime_passes,
            RefillTrigger::BufferedLow => config.low_water_passes,
            RefillTrigger::Periodic => 1,
        }
    }
}

#[derive(Debug, Default)]
struct PeerFlow {
    passes: Arc<AtomicUsize>,
    reserved: Arc<AtomicU64>,
}

/// Held by a running refill pass. Dropping it frees the pass slot.
#[derive(Debug)]
pub struct RefillPermit {
    passes: Arc<AtomicUsize>,
}

impl Drop for RefillPermit {
    fn drop(&mut self) {
        self.passes.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bytes of a chunk pulled from the source but not yet handed to the channel.
#[derive(Debug)]
pub struct Reservation {
    reserved: Arc<AtomicU64>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct FlowController {
    high_water: u64,
    max_passes: usize,
    peers: HashMap<PeerId, PeerFlow>,
}

impl FlowController {
    pub fn new(config: &Config) -> Self {
        Self {
            high_water: config.high_water,
            max_passes: config.max_refill_passes,
            peers: HashMap::new(),
        }
    }

    /// Claim a pass slot for `peer`, or `None` when the cap is reached.
    pub fn try_begin_pass(&mut self, peer: &PeerId) -> Option<RefillPermit> {
        let flow = self.peers.entry(peer.clone()).or_default();
        let max = self.max_passes;
        flow.passes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| RefillPermit {
                passes: flow.passes.clone(),
            })
    }

    pub fn active_passes(&self, peer: &PeerId) -> usize {
        self.peers
            .get(peer)
            .map(|f| f.passes.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn reserved(&self, peer: &PeerId) -> u64 {
        self.peers
            .get(peer)
            .map(|f| f.reserved.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Admit `bytes` more toward the channel if the peer is below the high-water mark.
    pub fn admit(&mut self, peer: &PeerId, buffered: u64, bytes: u64) -> Option<Reservation> {
        let flow = self.peers.entry(peer.clone()).or_default();
        let high_water = self.high_water;
        flow.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                (buffered.saturating_add(r) < high_water).then_some(r.saturating_add(bytes))
            })
            .ok()
            .map(|_| Reservation {
                reserved: flow.reserved.clone(),
                bytes,
            })
    }

    /// Drop bookkeeping for a peer whose channel is gone. Outstanding guards still release safely.
    pub fn forget(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}
