//! Constants and limits for the conduit wire format

use serde::{Deserialize, Serialize};

/// Packs three letters into 15 bits, five bits per letter
pub const fn pack_magic(a: u8, b: u8, c: u8) -> u16 {
    ((a & 0x1f) as u16) | (((b & 0x1f) as u16) << 5) | (((c & 0x1f) as u16) << 10)
}

/// Conduit magic: "RDC" packed five bits per letter
pub const MAGIC: u16 = pack_magic(b'R', b'D', b'C');

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 0x0101;

/// Value carried in the first two bytes of every packet
pub const MAGIC_VERSION: u16 = MAGIC ^ PROTOCOL_VERSION;

/// Fixed header size in bytes
///
/// 2 (magic ^ version) + 6 (packed sizes/indices) + 2 (sequence) + 4 (timestamp)
/// + 1 (frame type) + 1 (packet type) + 1 (flags) + 1 (redundant count) = 18 bytes
pub const HEADER_SIZE: usize = 18;

/// Largest payload representable in the 11-bit size field
pub const MAX_PACKET_SIZE: usize = 0x7ff;

/// Largest number of data fragments per datagram (10-bit field)
pub const MAX_K_FRAGMENTS: usize = 0x3ff;

/// Largest number of redundancy fragments per datagram (9-bit field)
pub const MAX_N_REDUNDANCY: usize = 0x1ff;

/// Largest fragment index (11-bit field)
pub const MAX_FRAGMENT_INDEX: usize = 0x7ff;

/// Number of datagram indices in flight before an index is reused (7-bit field)
pub const DATAGRAM_WINDOW: usize = 128;

/// Bytes a parity payload carries ahead of the protected shard
///
/// 2 (group base sequence) + 13 (XOR of the members' fragment metadata)
pub const PARITY_OVERHEAD: usize = 15;

/// Largest data fragment payload that still leaves room for parity overhead
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_PACKET_SIZE - PARITY_OVERHEAD;

/// Default fragment payload size, safely under common path MTUs
pub const DEFAULT_PACKET_SIZE: usize = 1200;

/// Default packet store capacity (must be a power of two)
pub const DEFAULT_STORE_CAPACITY: usize = 2048;

/// Upper bound on the redundancy ratio numerator
pub const MAX_FEC_NUMERATOR: u8 = 16;

/// Half of the 16-bit sequence space
pub const SEQ_HALF_RANGE: u16 = 0x8000;

/// Kind of video frame a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ordinary inter frame
    Normal = 0,
    /// Key frame
    Key = 1,
    /// Golden frame kept as a long-term reference
    Gold = 2,
    /// Alt-ref frame kept as a long-term reference
    AltRef = 3,
}

impl FrameType {
    /// Parse the wire representation
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Normal),
            1 => Some(FrameType::Key),
            2 => Some(FrameType::Gold),
            3 => Some(FrameType::AltRef),
            _ => None,
        }
    }

    /// Wire representation
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Whether a packet carries frame data or redundancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Fragment of an encoded frame
    Data = 0,
    /// Parity or duplicate protecting preceding data packets
    Redundancy = 1,
}

impl PacketType {
    /// Parse the wire representation
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Redundancy),
            _ => None,
        }
    }

    /// Wire representation
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Per-packet flags (stored as a single byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set
    pub const NONE: u8 = 0b0000_0000;

    /// First packet of a frame
    pub const NEW_FRAME: u8 = 0b0000_0001;

    /// Last packet of a frame
    pub const END_FRAME: u8 = 0b0000_0010;

    /// Redundancy payload was produced by the Reed-Solomon backend
    pub const REED_SOLOMON: u8 = 0b0000_0100;

    /// Bits a receiver understands
    pub const KNOWN: u8 = Self::NEW_FRAME | Self::END_FRAME | Self::REED_SOLOMON;

    /// Create new flags from raw byte
    pub const fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// Get raw flags byte
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Check if this packet starts a frame
    pub const fn is_new_frame(&self) -> bool {
        (self.0 & Self::NEW_FRAME) != 0
    }

    /// Check if this packet ends a frame
    pub const fn is_end_frame(&self) -> bool {
        (self.0 & Self::END_FRAME) != 0
    }

    /// Check if the redundancy payload is Reed-Solomon coded
    pub const fn is_reed_solomon(&self) -> bool {
        (self.0 & Self::REED_SOLOMON) != 0
    }

    /// Return a copy with `bits` set or cleared
    pub const fn with(self, bits: u8, on: bool) -> Self {
        if on {
            Self(self.0 | bits)
        } else {
            Self(self.0 & !bits)
        }
    }
}

impl Default for PacketFlags {
    fn default() -> Self {
        Self(Self::NONE)
    }
}
