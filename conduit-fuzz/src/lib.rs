//! Fuzzing entry points for conduit-core
//!
//! Every function must return normally for any input. To use with cargo-fuzz:
//! 1. Install cargo-fuzz: cargo install cargo-fuzz
//! 2. Run fuzzer: cargo fuzz run fuzz_decode

use bytes::Bytes;
use conduit_core::{
    decoder::decode_packet_from_bytes_zero_copy,
    fec::{rebuild_packet, split_parity_payload},
    handshake::HandshakeMessage,
    receiver::LossTracker,
    Feedback, Reassembler,
};

pub fn fuzz_decode(data: &[u8]) {
    let _ = decode_packet_from_bytes_zero_copy(Bytes::copy_from_slice(data));
}

pub fn fuzz_control(data: &[u8]) {
    let _ = Feedback::parse(data);
    let _ = HandshakeMessage::parse(data);
}

pub fn fuzz_parity(data: &[u8]) {
    let payload = Bytes::copy_from_slice(data);
    if let Ok((base, shard)) = split_parity_payload(&payload) {
        let _ = rebuild_packet(&shard, base);
    }
}

/// Feed a stream of `u16` length-prefixed datagrams through reassembly
pub fn fuzz_reassemble(data: &[u8]) {
    let mut reassembler = Reassembler::new();
    let mut tracker = LossTracker::new(4);
    let mut rest = data;

    while rest.len() >= 2 {
        let len = (u16::from_be_bytes([rest[0], rest[1]]) as usize).min(rest.len() - 2);
        let datagram = Bytes::copy_from_slice(&rest[2..2 + len]);
        rest = &rest[2 + len..];

        if let Ok(packet) = decode_packet_from_bytes_zero_copy(datagram) {
            tracker.observe(packet.sequence());
            let _ = reassembler.push(packet);
            for lost in tracker.due() {
                let _ = reassembler.loss_matters(lost);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{encoder::encode_packet_struct, packetizer::Packetizer, FecRatio, FrameType, SessionConfig};

    #[test]
    fn test_fuzz_decode_empty() {
        fuzz_decode(&[]);
    }

    #[test]
    fn test_fuzz_decode_random() {
        fuzz_decode(&[0x0d, 0x93, 0x56, 0x78]);
    }

    #[test]
    fn test_fuzz_control_random() {
        fuzz_control(&[0xFF; 300]);
        fuzz_control(b"configuration 1 2");
    }

    #[test]
    fn test_fuzz_parity_random() {
        fuzz_parity(&[0x00; 14]);
        fuzz_parity(&[0xFF; 64]);
    }

    #[test]
    fn test_fuzz_reassemble_real_stream() {
        let config = SessionConfig {
            packet_size: 8,
            store_capacity: 64,
            max_queued_packets: 32,
            ..SessionConfig::default()
        };
        let mut p = Packetizer::new(&config, FecRatio::new(3, 2).unwrap()).unwrap();
        p.packetize(0, Bytes::from_static(b"fuzzing the receiver"), FrameType::Key)
            .unwrap();

        let mut stream = Vec::new();
        while let Ok(packet) = p.pop_for_send() {
            let wire = encode_packet_struct(&packet).unwrap();
            stream.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            stream.extend_from_slice(&wire);
        }

        fuzz_reassemble(&stream);
        // Corrupt every eleventh byte and go again
        for i in (0..stream.len()).step_by(11) {
            stream[i] ^= 0x5a;
        }
        fuzz_reassemble(&stream);
    }
}
