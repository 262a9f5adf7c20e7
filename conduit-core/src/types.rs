//! Core types for conduit packets

use crate::constants::{
    FrameType, PacketFlags, PacketType, DATAGRAM_WINDOW, MAX_FRAGMENT_INDEX, MAX_K_FRAGMENTS,
    MAX_N_REDUNDANCY, MAX_PACKET_SIZE,
};
use crate::error::ConduitError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Packet header containing fragment and stream metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Payload length in bytes
    pub packet_size: u16,

    /// Number of data fragments in the datagram
    pub k_fragments: u16,

    /// Number of redundancy fragments emitted while sending the datagram
    pub n_redundancy: u16,

    /// Index of this fragment within its datagram
    ///
    /// Data fragments use `0..k_fragments`; parity fragments follow at
    /// `k_fragments..`; duplicates reuse the index of the data fragment they copy.
    pub fragment_index: u16,

    /// Rolling datagram index (mod 128)
    pub datagram_index: u8,

    /// Stream sequence number (wraps at 2^16)
    pub sequence: u16,

    /// Capture timestamp of the frame
    pub timestamp: u32,

    /// Kind of frame the payload belongs to
    pub frame_type: FrameType,

    /// Data or redundancy
    pub packet_type: PacketType,

    /// New/end frame markers
    pub flags: PacketFlags,

    /// Data: packets left in the current group including this one, counting
    /// down from the ratio denominator; 1 marks the packet that closes it.
    /// Redundancy: number of data packets the payload protects.
    pub redundant_count: u8,
}

impl PacketHeader {
    /// Create a data header with no fragment bookkeeping filled in
    pub fn new(sequence: u16, timestamp: u32, frame_type: FrameType, packet_size: u16) -> Self {
        Self {
            packet_size,
            k_fragments: 1,
            n_redundancy: 0,
            fragment_index: 0,
            datagram_index: 0,
            sequence,
            timestamp,
            frame_type,
            packet_type: PacketType::Data,
            flags: PacketFlags::default(),
            redundant_count: 0,
        }
    }

    /// Validate field ranges against the wire format limits
    pub fn validate(&self) -> Result<(), ConduitError> {
        if self.packet_size as usize > MAX_PACKET_SIZE {
            return Err(ConduitError::InvalidHeader(format!(
                "packet size {} exceeds {}",
                self.packet_size, MAX_PACKET_SIZE
            )));
        }

        if self.k_fragments == 0 || self.k_fragments as usize > MAX_K_FRAGMENTS {
            return Err(ConduitError::InvalidHeader(format!(
                "fragment count {} outside 1..={}",
                self.k_fragments, MAX_K_FRAGMENTS
            )));
        }

        if self.n_redundancy as usize > MAX_N_REDUNDANCY {
            return Err(ConduitError::InvalidHeader(format!(
                "redundancy count {} exceeds {}",
                self.n_redundancy, MAX_N_REDUNDANCY
            )));
        }

        if self.fragment_index as usize > MAX_FRAGMENT_INDEX {
            return Err(ConduitError::InvalidHeader(format!(
                "fragment index {} exceeds {}",
                self.fragment_index, MAX_FRAGMENT_INDEX
            )));
        }

        if self.datagram_index as usize >= DATAGRAM_WINDOW {
            return Err(ConduitError::InvalidHeader(format!(
                "datagram index {} exceeds {}",
                self.datagram_index,
                DATAGRAM_WINDOW - 1
            )));
        }

        if self.packet_type == PacketType::Data && self.fragment_index >= self.k_fragments {
            return Err(ConduitError::InvalidHeader(format!(
                "data fragment index {} not below fragment count {}",
                self.fragment_index, self.k_fragments
            )));
        }

        if self.flags.as_u8() & !PacketFlags::KNOWN != 0 {
            return Err(ConduitError::InvalidHeader(format!(
                "unknown flag bits {:#04x}",
                self.flags.as_u8()
            )));
        }

        Ok(())
    }

    /// Check whether this is a parity packet (as opposed to data or a duplicate)
    pub fn is_parity(&self) -> bool {
        self.packet_type == PacketType::Redundancy && self.redundant_count > 1
    }

    /// Check whether this packet carries a data fragment, original or duplicate
    pub fn carries_fragment(&self) -> bool {
        !self.is_parity()
    }
}

/// Complete conduit packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,

    /// Packet payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Validate the packet
    pub fn validate(&self) -> Result<(), ConduitError> {
        self.header.validate()?;

        if self.payload.len() != self.header.packet_size as usize {
            return Err(ConduitError::InvalidHeader(format!(
                "Payload length mismatch: header says {}, actual {}",
                self.header.packet_size,
                self.payload.len()
            )));
        }

        Ok(())
    }

    /// Calculate the serialized size in bytes
    pub fn total_size(&self) -> usize {
        crate::constants::HEADER_SIZE + self.payload.len()
    }

    /// Get the sequence number
    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }
}

/// Application-level message reassembled from data fragments
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    /// Rolling datagram index
    pub index: u8,

    /// Capture timestamp shared by the datagram's fragments
    pub timestamp: u32,

    /// Kind of frame carried
    pub frame_type: FrameType,

    /// Reassembled bytes
    pub payload: Bytes,
}
