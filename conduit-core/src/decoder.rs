//! Packet decoding (strict mode)

use crate::constants::{FrameType, PacketFlags, PacketType, HEADER_SIZE, MAGIC_VERSION};
use crate::error::ConduitError;
use crate::types::{Packet, PacketHeader};
use bytes::{Buf, Bytes};

/// Decode the fixed header at the start of `data`
///
/// Validates:
/// - Magic/version
/// - Field ranges
/// - Frame and packet type codes
pub fn decode_header(data: &[u8]) -> Result<PacketHeader, ConduitError> {
    if data.len() < HEADER_SIZE {
        return Err(ConduitError::IncompletePacket {
            expected: HEADER_SIZE,
            actual: data.len(),
        });
    }

    let mut cur = &data[..HEADER_SIZE];

    let vmagic = cur.get_u16();
    if vmagic != MAGIC_VERSION {
        return Err(ConduitError::VersionMismatch {
            expected: MAGIC_VERSION,
            actual: vmagic,
        });
    }

    let word = cur.get_uint(6);
    let sequence = cur.get_u16();
    let timestamp = cur.get_u32();

    let frame_code = cur.get_u8();
    let frame_type = FrameType::from_u8(frame_code)
        .ok_or_else(|| ConduitError::InvalidHeader(format!("frame type {}", frame_code)))?;

    let packet_code = cur.get_u8();
    let packet_type = PacketType::from_u8(packet_code)
        .ok_or_else(|| ConduitError::InvalidHeader(format!("packet type {}", packet_code)))?;

    let flags = PacketFlags::new(cur.get_u8());
    let redundant_count = cur.get_u8();

    let header = PacketHeader {
        packet_size: ((word >> 37) & 0x7ff) as u16,
        k_fragments: ((word >> 27) & 0x3ff) as u16,
        n_redundancy: ((word >> 18) & 0x1ff) as u16,
        fragment_index: ((word >> 7) & 0x7ff) as u16,
        datagram_index: (word & 0x7f) as u8,
        sequence,
        timestamp,
        frame_type,
        packet_type,
        flags,
        redundant_count,
    };
    header.validate()?;

    Ok(header)
}

/// Decode a packet from a byte slice
pub fn decode_packet_from_bytes(data: &[u8]) -> Result<Packet, ConduitError> {
    decode_packet_from_bytes_zero_copy(Bytes::copy_from_slice(data))
}

/// Decode a packet from a byte buffer without copying the payload
///
/// `buf` must hold exactly one datagram as received from the socket;
/// trailing bytes past the declared payload are rejected.
pub fn decode_packet_from_bytes_zero_copy(buf: Bytes) -> Result<Packet, ConduitError> {
    let header = decode_header(&buf)?;

    let total = HEADER_SIZE + header.packet_size as usize;
    if buf.len() < total {
        return Err(ConduitError::IncompletePacket {
            expected: total,
            actual: buf.len(),
        });
    }
    if buf.len() > total {
        return Err(ConduitError::InvalidHeader(format!(
            "{} trailing bytes after payload",
            buf.len() - total
        )));
    }

    Ok(Packet::new(header, buf.slice(HEADER_SIZE..total)))
}

/// Check whether a datagram looks like a conduit packet (magic/version match)
pub fn is_conduit_packet(data: &[u8]) -> bool {
    data.len() >= 2 && u16::from_be_bytes([data[0], data[1]]) == MAGIC_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode_packet, PacketBuilder};

    #[test]
    fn test_decode_simple_packet() {
        let payload = b"Hello, conduit!";
        let header = PacketHeader::new(7, 1000, FrameType::Gold, payload.len() as u16);

        let encoded = encode_packet(&header, payload).unwrap();
        let decoded = decode_packet_from_bytes(&encoded).unwrap();

        assert_eq!(decoded.header, header);
        assert_eq!(decoded.payload.as_ref(), payload);
    }

    #[test]
    fn test_decode_redundancy_fields() {
        let encoded = PacketBuilder::new(65535)
            .payload(Bytes::from_static(b"parity"))
            .fragment(127, 1030, 1023)
            .n_redundancy(511)
            .redundancy(16)
            .mark_end_frame()
            .build()
            .unwrap();

        let decoded = decode_packet_from_bytes_zero_copy(encoded).unwrap();
        assert_eq!(decoded.header.sequence, 65535);
        assert_eq!(decoded.header.datagram_index, 127);
        assert_eq!(decoded.header.fragment_index, 1030);
        assert_eq!(decoded.header.k_fragments, 1023);
        assert_eq!(decoded.header.n_redundancy, 511);
        assert_eq!(decoded.header.redundant_count, 16);
        assert!(decoded.header.is_parity());
        assert!(decoded.header.flags.is_end_frame());
    }

    #[test]
    fn test_decode_version_mismatch() {
        let mut encoded = PacketBuilder::new(1)
            .payload(Bytes::from_static(b"x"))
            .build()
            .unwrap()
            .to_vec();
        encoded[1] ^= 0x01;

        let result = decode_packet_from_bytes(&encoded);
        assert!(matches!(result, Err(ConduitError::VersionMismatch { .. })));
        assert!(!is_conduit_packet(&encoded));
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = PacketBuilder::new(1)
            .payload(Bytes::from_static(b"payload"))
            .build()
            .unwrap();

        let result = decode_packet_from_bytes(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(ConduitError::IncompletePacket { .. })));

        let result = decode_packet_from_bytes(&encoded[..4]);
        assert!(matches!(
            result,
            Err(ConduitError::IncompletePacket { expected: HEADER_SIZE, actual: 4 })
        ));
    }

    #[test]
    fn test_decode_unknown_frame_type() {
        let mut encoded = PacketBuilder::new(1)
            .payload(Bytes::from_static(b"x"))
            .build()
            .unwrap()
            .to_vec();
        encoded[14] = 9;

        assert!(matches!(
            decode_packet_from_bytes(&encoded),
            Err(ConduitError::InvalidHeader(_))
        ));
    }
}
