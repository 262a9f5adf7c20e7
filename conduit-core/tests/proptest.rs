//! Property-based tests using proptest

use bytes::Bytes;
use conduit_core::{
    decoder::decode_packet_from_bytes,
    encoder::PacketBuilder,
    handshake::HandshakeMessage,
    packetizer::Packetizer,
    receiver::LossTracker,
    seq,
    store::PacketStore,
    ConduitError, FecRatio, Feedback, FrameType, Packet, PacketHeader, PacketType, Reassembler,
    SessionConfig,
};
use proptest::prelude::*;

fn packet(sequence: u16) -> Packet {
    Packet::new(
        PacketHeader::new(sequence, 0, FrameType::Normal, 1),
        Bytes::copy_from_slice(&sequence.to_be_bytes()[1..]),
    )
}

proptest! {
    #[test]
    fn prop_round_trip_encode_decode(
        sequence in any::<u16>(),
        timestamp in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..2047)
    ) {
        let payload = Bytes::from(payload);
        let encoded = PacketBuilder::new(sequence)
            .payload(payload.clone())
            .timestamp(timestamp)
            .mark_new_frame()
            .build()
            .unwrap();

        let decoded = decode_packet_from_bytes(&encoded).unwrap();
        prop_assert_eq!(decoded.header.sequence, sequence);
        prop_assert_eq!(decoded.header.timestamp, timestamp);
        prop_assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = decode_packet_from_bytes(&data);
    }

    #[test]
    fn prop_control_parsers_never_panic(data in prop::collection::vec(any::<u8>(), 0..300)) {
        let _ = Feedback::parse(&data);
        let _ = HandshakeMessage::parse(&data);
    }

    #[test]
    fn prop_sequence_order_is_antisymmetric(a in any::<u16>(), d in 1u16..0x8000) {
        let b = a.wrapping_add(d);
        prop_assert!(seq::is_after(b, a));
        prop_assert!(seq::is_before(a, b));
        prop_assert!(!seq::is_after(a, b));
        prop_assert_eq!(seq::latest(a, b), b);
        prop_assert!(seq::is_at_or_after(a, a));
    }

    #[test]
    fn prop_store_never_returns_wrong_packet(
        cap in (1u32..=10).prop_map(|bits| 1usize << bits),
        start in any::<u16>(),
        ops in prop::collection::vec(any::<bool>(), 1..400),
        probes in prop::collection::vec(any::<u16>(), 1..32)
    ) {
        let mut store = PacketStore::starting_at(cap, start).unwrap();
        let mut written: Vec<Option<u16>> = vec![None; cap];
        let mut next = start;
        let mut queued = 0usize;

        for append in ops {
            if append {
                match store.append(packet(next)) {
                    Ok(()) => {
                        written[next as usize % cap] = Some(next);
                        next = next.wrapping_add(1);
                        queued += 1;
                    }
                    Err(ConduitError::StoreFull { .. }) => prop_assert_eq!(queued, cap),
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                }
            } else if let Ok(p) = store.pop_for_send() {
                prop_assert_eq!(p.sequence(), next.wrapping_sub(queued as u16));
                queued -= 1;
            } else {
                prop_assert_eq!(queued, 0);
            }

            prop_assert_eq!(store.len(), queued);
            let span = (store.add_ptr() + cap - store.send_ptr()) % cap;
            if span == 0 {
                prop_assert!(store.len() == 0 || store.len() == cap);
            } else {
                prop_assert_eq!(store.len(), span);
            }
        }

        // Recent history, everything overwritten before it, and random sequences
        let recent = (0..2 * cap as u16).map(|back| next.wrapping_sub(back + 1));
        for probe in recent.chain(probes) {
            match written[probe as usize % cap] {
                Some(seq) if seq == probe => {
                    let p = store.lookup(probe).unwrap();
                    prop_assert_eq!(p.sequence(), probe);
                }
                _ => prop_assert!(matches!(
                    store.lookup(probe),
                    Err(ConduitError::NotFound(s)) if s == probe
                )),
            }
        }
    }

    #[test]
    fn prop_single_loss_is_recovered(
        data in prop::collection::vec(any::<u8>(), 1..400),
        packet_size in 16usize..200,
        (denominator, numerator) in (1u8..16).prop_flat_map(|d| (Just(d), (d + 1)..=16)),
        lost in any::<prop::sample::Index>()
    ) {
        let config = SessionConfig {
            packet_size,
            store_capacity: 512,
            ..SessionConfig::default()
        };
        let ratio = FecRatio::new(numerator, denominator).unwrap();
        let mut p = Packetizer::new(&config, ratio).unwrap();
        p.packetize(9, Bytes::from(data.clone()), FrameType::Normal).unwrap();
        let packets: Vec<Packet> = std::iter::from_fn(|| p.pop_for_send().ok()).collect();

        // Packets after the last redundancy packet are unprotected until the next datagram
        let last_redundancy = packets
            .iter()
            .rposition(|pk| pk.header.packet_type == PacketType::Redundancy);
        let lost = match last_redundancy {
            Some(last) => lost.index(last + 1),
            None => usize::MAX,
        };

        let mut r = Reassembler::new();
        let mut delivered = Vec::new();
        for (i, pk) in packets.into_iter().enumerate() {
            if i != lost {
                delivered.extend(r.push(pk));
            }
        }

        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(delivered[0].payload.as_ref(), &data[..]);
    }

    #[test]
    fn prop_every_gap_reported_once(
        start in any::<u16>(),
        received in prop::collection::vec(any::<bool>(), 2..300)
    ) {
        let mut tracker = LossTracker::new(1);
        let last = received.len() - 1;
        let mut expected = Vec::new();
        let mut reported = Vec::new();

        for (i, arrived) in received.iter().enumerate() {
            let sequence = start.wrapping_add(i as u16);
            if *arrived || i == 0 || i == last {
                tracker.observe(sequence);
                reported.extend(tracker.due());
            } else {
                expected.push(sequence);
            }
        }

        prop_assert_eq!(reported, expected);
    }
}
