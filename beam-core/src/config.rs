//! Protocol tuning. Every field has a default; hosts deserialize overrides from their config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Largest chunk a peer channel message is expected to carry.
pub const MAX_CHUNK_SIZE: u64 = 16 * MIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Plaintext bytes per outgoing DATA frame (default 255 KiB). Receivers accept any size.
    pub chunk_size: u64,
    /// Refill passes stop pulling chunks once channel-buffered bytes reach this (12 MiB).
    pub high_water: u64,
    /// Buffered-amount-low threshold set on the channel (8 MiB).
    pub low_water: u64,
    /// Periodic refill fires only while buffered bytes are below this (1 MiB).
    pub safety_floor: u64,
    /// Concurrent refill passes allowed per peer.
    pub max_refill_passes: usize,
    /// Passes started when a channel opens or sending starts.
    pub prime_passes: usize,
    /// Passes started on a buffered-amount-low signal.
    pub low_water_passes: usize,
    #[serde(with = "millis")]
    pub response_timeout: Duration,
    /// Host tick period: throughput sampling, periodic refill, deadlines.
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    #[serde(with = "millis")]
    pub throughput_window: Duration,
    #[serde(with = "millis")]
    pub throughput_min_span: Duration,
    /// How long a completed outgoing transfer stays visible before release.
    #[serde(with = "millis")]
    pub completion_linger: Duration,
    pub e2ee_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 255 * KIB,
            high_water: 12 * MIB,
            low_water: 8 * MIB,
            safety_floor: MIB,
            max_refill_passes: 12,
            prime_passes: 12,
            low_water_passes: 6,
            response_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            throughput_window: Duration::from_millis(1500),
            throughput_min_span: Duration::from_millis(100),
            completion_linger: Duration::from_secs(2),
            e2ee_enabled: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.low_water >= self.high_water {
            return Err(ConfigError::Watermarks {
                low: self.low_water,
                high: self.high_water,
            });
        }
        if self.max_refill_passes == 0 || self.prime_passes == 0 || self.low_water_passes == 0 {
            return Err(ConfigError::PassCount);
        }
        if self.tick_interval.is_zero() || self.throughput_min_span.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size {0} out of range (1..={MAX_CHUNK_SIZE})")]
    ChunkSize(u64),
    #[error("low water mark {low} must be below high water mark {high}")]
    Watermarks { low: u64, high: u64 },
    #[error("refill pass counts must be at least 1")]
    PassCount,
    #[error("tick interval and throughput span must be non-zero")]
    ZeroInterval,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
