//! Session configuration

use crate::constants::{
    DEFAULT_PACKET_SIZE, DEFAULT_STORE_CAPACITY, MAX_FEC_NUMERATOR, MAX_FRAGMENT_PAYLOAD,
};
use crate::error::ConduitError;
use crate::fec::FecScheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redundancy ratio `numerator : denominator`
///
/// For every `denominator` data packets, `numerator - denominator`
/// redundancy packets are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecRatio {
    /// Total packets per group
    pub numerator: u8,
    /// Data packets per group
    pub denominator: u8,
}

impl FecRatio {
    /// Create a ratio, validating `1 <= denominator <= numerator <= 16`
    pub fn new(numerator: u8, denominator: u8) -> Result<Self, ConduitError> {
        let ratio = Self {
            numerator,
            denominator,
        };
        ratio.validate()?;
        Ok(ratio)
    }

    /// Validate the ratio bounds
    pub fn validate(&self) -> Result<(), ConduitError> {
        if self.denominator == 0
            || self.denominator > self.numerator
            || self.numerator > MAX_FEC_NUMERATOR
        {
            return Err(ConduitError::InvalidParameter(format!(
                "redundancy ratio {}:{} outside 1 <= den <= num <= {}",
                self.numerator, self.denominator, MAX_FEC_NUMERATOR
            )));
        }
        Ok(())
    }

    /// Redundancy packets emitted per completed group
    pub fn extra(&self) -> u8 {
        self.numerator - self.denominator
    }
}

impl Default for FecRatio {
    fn default() -> Self {
        Self {
            numerator: 6,
            denominator: 5,
        }
    }
}

/// Handshake timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Interval between `initiate` retransmissions, in milliseconds
    pub retry_interval_ms: u64,
    /// Give up after this long without a `configuration`, in milliseconds
    pub timeout_ms: u64,
    /// Number of times `confirmed` is sent
    pub confirm_repeats: u32,
    /// Pause between `confirmed` repeats, in milliseconds
    pub confirm_interval_ms: u64,
}

impl HandshakeConfig {
    /// Retry interval as a duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Overall timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause between confirmations as a duration
    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 200,
            timeout_ms: 10_000,
            confirm_repeats: 3,
            confirm_interval_ms: 200,
        }
    }
}

/// Local settings of one conduit session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest data fragment payload in bytes
    pub packet_size: usize,
    /// Packet store capacity (power of two)
    pub store_capacity: usize,
    /// Redundancy codec
    pub fec_scheme: FecScheme,
    /// Sequence number of the first packet
    pub initial_sequence: u16,
    /// Drop captured frames while this many packets are unsent
    pub max_queued_packets: usize,
    /// Depth of the capture -> sender channel
    pub frame_channel_depth: usize,
    /// Depth of the feedback channel
    pub feedback_channel_depth: usize,
    /// Longest wait for a frame or feedback before servicing the send queue, in milliseconds
    pub poll_interval_ms: u64,
    /// Receiver: how far the stream must move past a gap before it is reported
    pub reorder_window: u16,
    /// Handshake timing
    pub handshake: HandshakeConfig,
}

impl SessionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConduitError> {
        if self.packet_size == 0 || self.packet_size > MAX_FRAGMENT_PAYLOAD {
            return Err(ConduitError::InvalidParameter(format!(
                "packet size {} outside 1..={}",
                self.packet_size, MAX_FRAGMENT_PAYLOAD
            )));
        }

        if self.store_capacity < 2
            || !self.store_capacity.is_power_of_two()
            || self.store_capacity > 1 << 16
        {
            return Err(ConduitError::InvalidParameter(format!(
                "store capacity {} is not a power of two in 2..=65536",
                self.store_capacity
            )));
        }

        if self.max_queued_packets == 0 || self.max_queued_packets >= self.store_capacity {
            return Err(ConduitError::InvalidParameter(format!(
                "max queued packets {} outside 1..{}",
                self.max_queued_packets, self.store_capacity
            )));
        }

        if self.frame_channel_depth == 0 || self.feedback_channel_depth == 0 {
            return Err(ConduitError::InvalidParameter(
                "channel depths must be non-zero".to_string(),
            ));
        }

        if self.handshake.retry_interval_ms == 0 {
            return Err(ConduitError::InvalidParameter(
                "handshake retry interval must be non-zero".to_string(),
            ));
        }

        self.fec_scheme.codec()?;
        Ok(())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            store_capacity: DEFAULT_STORE_CAPACITY,
            fec_scheme: FecScheme::Xor,
            initial_sequence: 0,
            max_queued_packets: 64,
            frame_channel_depth: 4,
            feedback_channel_depth: 64,
            poll_interval_ms: 5,
            reorder_window: 16,
            handshake: HandshakeConfig::default(),
        }
    }
}
