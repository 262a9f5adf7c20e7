//! Packet encoding

use crate::constants::{FrameType, PacketFlags, PacketType, HEADER_SIZE, MAGIC_VERSION};
use crate::error::ConduitError;
use crate::types::{Packet, PacketHeader};
use bytes::{BufMut, Bytes, BytesMut};

/// Pack the five size/index fields into the 48-bit header word
///
/// Layout, most significant bit first:
/// `pkt_size:11 | k_fragments:10 | n_redundancy:9 | fragment_index:11 | datagram_index:7`
pub(crate) fn pack_fields(header: &PacketHeader) -> u64 {
    ((header.packet_size as u64 & 0x7ff) << 37)
        | ((header.k_fragments as u64 & 0x3ff) << 27)
        | ((header.n_redundancy as u64 & 0x1ff) << 18)
        | ((header.fragment_index as u64 & 0x7ff) << 7)
        | (header.datagram_index as u64 & 0x7f)
}

/// Write the fixed header into `buf`
pub fn encode_header(header: &PacketHeader, buf: &mut BytesMut) {
    buf.put_u16(MAGIC_VERSION);
    buf.put_uint(pack_fields(header), 6);
    buf.put_u16(header.sequence);
    buf.put_u32(header.timestamp);
    buf.put_u8(header.frame_type.as_u8());
    buf.put_u8(header.packet_type.as_u8());
    buf.put_u8(header.flags.as_u8());
    buf.put_u8(header.redundant_count);
}

/// Encode a packet into bytes
///
/// The packet is encoded with the following layout (all big-endian):
/// 1. Magic XOR version (2 bytes)
/// 2. Packed sizes and indices (6 bytes)
/// 3. Sequence (2 bytes)
/// 4. Timestamp (4 bytes)
/// 5. Frame type, packet type, flags, redundant count (1 byte each)
/// 6. Payload (`packet_size` bytes)
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Result<Bytes, ConduitError> {
    header.validate()?;

    if payload.len() != header.packet_size as usize {
        return Err(ConduitError::InvalidHeader(format!(
            "Payload length mismatch: header says {}, actual {}",
            header.packet_size,
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_header(header, &mut buf);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Encode a complete Packet struct
pub fn encode_packet_struct(packet: &Packet) -> Result<Bytes, ConduitError> {
    encode_packet(&packet.header, &packet.payload)
}

/// Builder for constructing packets with various options
pub struct PacketBuilder {
    header: PacketHeader,
    payload: Bytes,
}

impl PacketBuilder {
    /// Create a new builder for a data packet
    pub fn new(sequence: u16) -> Self {
        Self {
            header: PacketHeader::new(sequence, 0, FrameType::Normal, 0),
            payload: Bytes::new(),
        }
    }

    /// Set the payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Set the timestamp
    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    /// Set the frame type
    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.header.frame_type = frame_type;
        self
    }

    /// Place the packet in a datagram
    pub fn fragment(mut self, datagram_index: u8, fragment_index: u16, k_fragments: u16) -> Self {
        self.header.datagram_index = datagram_index;
        self.header.fragment_index = fragment_index;
        self.header.k_fragments = k_fragments;
        self
    }

    /// Set the redundancy fragment count of the datagram
    pub fn n_redundancy(mut self, n_redundancy: u16) -> Self {
        self.header.n_redundancy = n_redundancy;
        self
    }

    /// Mark as a redundancy packet protecting `count` packets
    pub fn redundancy(mut self, count: u8) -> Self {
        self.header.packet_type = PacketType::Redundancy;
        self.header.redundant_count = count;
        self
    }

    /// Mark as first packet of a frame
    pub fn mark_new_frame(mut self) -> Self {
        self.header.flags = self.header.flags.with(PacketFlags::NEW_FRAME, true);
        self
    }

    /// Mark as last packet of a frame
    pub fn mark_end_frame(mut self) -> Self {
        self.header.flags = self.header.flags.with(PacketFlags::END_FRAME, true);
        self
    }

    /// Build the packet struct without encoding
    pub fn build_struct(mut self) -> Result<Packet, ConduitError> {
        self.header.packet_size = u16::try_from(self.payload.len()).map_err(|_| {
            ConduitError::InvalidHeader(format!("payload of {} bytes", self.payload.len()))
        })?;
        self.header.validate()?;

        Ok(Packet::new(self.header, self.payload))
    }

    /// Build and encode the packet
    pub fn build(self) -> Result<Bytes, ConduitError> {
        let packet = self.build_struct()?;
        encode_packet_struct(&packet)
    }
}
