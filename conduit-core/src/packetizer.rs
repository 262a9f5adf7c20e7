//! Fragmentation and redundancy emission
//!
//! The packetizer splits each outbound datagram (one encoded frame) into data
//! fragments of at most `packet_size` bytes and appends them to its packet
//! store. A countdown runs across datagrams: every `denominator` data packets
//! close a redundancy group, after which `numerator - denominator`
//! redundancy packets are appended. With a denominator of 1 those are exact
//! duplicates of the preceding packet; otherwise they are parity shards from
//! the session codec.

use crate::config::{FecRatio, SessionConfig};
use crate::constants::{
    FrameType, PacketFlags, PacketType, DATAGRAM_WINDOW, MAX_K_FRAGMENTS, MAX_N_REDUNDANCY,
};
use crate::error::ConduitError;
use crate::fec::{fragment_shard, parity_payload, Codec, FecScheme, RedundancyEncoder};
use crate::store::PacketStore;
use crate::types::{Packet, PacketHeader};
use bytes::Bytes;

#[cfg(feature = "logging")]
use tracing::debug;

/// Outcome of packetizing one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketizeSummary {
    /// Sequence of the datagram's first packet
    pub first_sequence: u16,
    /// Datagram index assigned
    pub datagram_index: u8,
    /// Data fragments appended
    pub data_packets: usize,
    /// Redundancy packets appended
    pub redundancy_packets: usize,
}

/// Datagram-wide header fields shared by every packet of one `packetize` call
#[derive(Debug, Clone, Copy)]
struct DatagramContext {
    timestamp: u32,
    frame_type: FrameType,
    datagram_index: u8,
    k_fragments: u16,
    n_redundancy: u16,
}

/// Sender-side fragmentation state for one stream
#[derive(Debug)]
pub struct Packetizer {
    store: PacketStore,
    codec: Codec,
    packet_size: usize,
    ratio: FecRatio,
    pending_ratio: FecRatio,
    fec_count: u8,
    next_sequence: u16,
    datagram_index: u8,
    group: Vec<Packet>,
}

impl Packetizer {
    /// Create a packetizer with an empty store
    pub fn new(config: &SessionConfig, ratio: FecRatio) -> Result<Self, ConduitError> {
        config.validate()?;
        ratio.validate()?;

        Ok(Self {
            store: PacketStore::starting_at(config.store_capacity, config.initial_sequence)?,
            codec: config.fec_scheme.codec()?,
            packet_size: config.packet_size,
            ratio,
            pending_ratio: ratio,
            fec_count: ratio.denominator,
            next_sequence: config.initial_sequence,
            datagram_index: 0,
            group: Vec::with_capacity(ratio.denominator as usize),
        })
    }

    /// Change the redundancy ratio starting with the next group
    pub fn set_ratio(&mut self, ratio: FecRatio) -> Result<(), ConduitError> {
        ratio.validate()?;
        self.pending_ratio = ratio;
        Ok(())
    }

    /// Ratio of the group currently being filled
    pub fn ratio(&self) -> FecRatio {
        self.ratio
    }

    /// Ratio that applies from the next group on
    pub fn pending_ratio(&self) -> FecRatio {
        self.pending_ratio
    }

    /// Data packets left before the current group closes
    pub fn fec_count(&self) -> u8 {
        self.fec_count
    }

    /// Sequence the next appended packet will carry
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Index the next datagram will carry
    pub fn next_datagram_index(&self) -> u8 {
        self.datagram_index
    }

    /// Packet store (read-only)
    pub fn store(&self) -> &PacketStore {
        &self.store
    }

    /// Take the next unsent packet
    pub fn pop_for_send(&mut self) -> Result<Packet, ConduitError> {
        self.store.pop_for_send()
    }

    /// Look up a sent or unsent packet by sequence
    pub fn lookup(&self, sequence: u16) -> Result<&Packet, ConduitError> {
        self.store.lookup(sequence)
    }

    /// Drop unsent packets ahead of a recovery frame
    ///
    /// When anything was dropped, the partially filled redundancy group is
    /// abandoned as well, since some of its members never left the sender.
    pub fn skip_to_head(&mut self) -> usize {
        let skipped = self.store.skip_to_head();
        if skipped > 0 && !self.group.is_empty() {
            self.group.clear();
            self.ratio = self.pending_ratio;
            self.fec_count = self.ratio.denominator;
        }
        skipped
    }

    /// Redundancy packets the next `k` data packets will trigger
    fn plan_redundancy(&self, k: usize) -> usize {
        let mut ratio = self.ratio;
        let mut count = self.fec_count;
        let mut n = 0usize;

        for _ in 0..k {
            count -= 1;
            if count == 0 {
                n += ratio.extra() as usize;
                ratio = self.pending_ratio;
                count = ratio.denominator;
            }
        }
        n
    }

    /// Split a datagram into data fragments and append them with redundancy
    ///
    /// Either every packet of the datagram is appended or none is: capacity is
    /// checked up front and `StoreFull` leaves the store untouched.
    pub fn packetize(
        &mut self,
        timestamp: u32,
        data: Bytes,
        frame_type: FrameType,
    ) -> Result<PacketizeSummary, ConduitError> {
        if data.is_empty() {
            return Err(ConduitError::InvalidParameter(
                "cannot packetize an empty datagram".to_string(),
            ));
        }

        let k = data.len().div_ceil(self.packet_size);
        let n = self.plan_redundancy(k);
        if k > MAX_K_FRAGMENTS || n > MAX_N_REDUNDANCY {
            return Err(ConduitError::DatagramTooLarge {
                size: data.len(),
                fragments: k,
                redundancy: n,
            });
        }
        if k + n > self.store.available() {
            return Err(ConduitError::StoreFull {
                capacity: self.store.capacity(),
            });
        }

        let ctx = DatagramContext {
            timestamp,
            frame_type,
            datagram_index: self.datagram_index,
            k_fragments: k as u16,
            n_redundancy: n as u16,
        };
        let first_sequence = self.next_sequence;
        let mut emitted = 0usize;

        for i in 0..k {
            let start = i * self.packet_size;
            let end = (start + self.packet_size).min(data.len());
            let last = i + 1 == k;

            let flags = PacketFlags::default()
                .with(PacketFlags::NEW_FRAME, i == 0)
                .with(PacketFlags::END_FRAME, last);

            let header = PacketHeader {
                packet_size: (end - start) as u16,
                k_fragments: ctx.k_fragments,
                n_redundancy: ctx.n_redundancy,
                fragment_index: i as u16,
                datagram_index: ctx.datagram_index,
                sequence: self.next_sequence,
                timestamp,
                frame_type,
                packet_type: PacketType::Data,
                flags,
                redundant_count: self.fec_count,
            };

            let packet = Packet::new(header, data.slice(start..end));
            self.push(packet.clone())?;
            self.group.push(packet);

            self.fec_count -= 1;
            if self.fec_count == 0 {
                emitted += self.emit_redundancy(&ctx, last, emitted)?;
            }
        }

        self.datagram_index = ((self.datagram_index as usize + 1) % DATAGRAM_WINDOW) as u8;

        #[cfg(feature = "logging")]
        debug!(
            "Packetized datagram {} ({} bytes, {:?}): seq {} + {} data, {} redundancy",
            ctx.datagram_index,
            data.len(),
            frame_type,
            first_sequence,
            k,
            emitted
        );

        Ok(PacketizeSummary {
            first_sequence,
            datagram_index: ctx.datagram_index,
            data_packets: k,
            redundancy_packets: emitted,
        })
    }

    /// Close the current group, returning the number of packets appended
    fn emit_redundancy(
        &mut self,
        ctx: &DatagramContext,
        end_frame: bool,
        emitted_before: usize,
    ) -> Result<usize, ConduitError> {
        let extra = self.ratio.extra() as usize;
        let mut appended = 0usize;

        if extra > 0 {
            if self.ratio.denominator == 1 {
                // Exact duplicates of the preceding packet
                if let Some(source) = self.group.last().cloned() {
                    for _ in 0..extra {
                        let mut header = source.header;
                        header.sequence = self.next_sequence;
                        header.packet_type = PacketType::Redundancy;
                        header.redundant_count = 1;
                        self.push(Packet::new(header, source.payload.clone()))?;
                        appended += 1;
                    }
                }
            } else {
                let base = self.group[0].header.sequence;
                let members = self.group.len() as u8;
                let shards: Vec<Bytes> = self.group.iter().map(fragment_shard).collect();
                let parities = self.codec.encode_batch(&shards, extra)?;
                let rs = self.codec.scheme() == FecScheme::ReedSolomon;

                for (j, shard) in parities.iter().enumerate() {
                    let payload = parity_payload(base, shard);
                    let flags = PacketFlags::default()
                        .with(PacketFlags::END_FRAME, end_frame && j + 1 == parities.len())
                        .with(PacketFlags::REED_SOLOMON, rs);

                    let header = PacketHeader {
                        packet_size: payload.len() as u16,
                        k_fragments: ctx.k_fragments,
                        n_redundancy: ctx.n_redundancy,
                        fragment_index: ctx.k_fragments + (emitted_before + j) as u16,
                        datagram_index: ctx.datagram_index,
                        sequence: self.next_sequence,
                        timestamp: ctx.timestamp,
                        frame_type: ctx.frame_type,
                        packet_type: PacketType::Redundancy,
                        flags,
                        redundant_count: members,
                    };
                    self.push(Packet::new(header, payload))?;
                    appended += 1;
                }
            }
        }

        self.group.clear();
        self.ratio = self.pending_ratio;
        self.fec_count = self.ratio.denominator;
        Ok(appended)
    }

    fn push(&mut self, packet: Packet) -> Result<(), ConduitError> {
        self.store.append(packet)?;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::{rebuild_packet, split_parity_payload, RedundancyDecoder, XorCodec};

    fn config(packet_size: usize) -> SessionConfig {
        SessionConfig {
            packet_size,
            store_capacity: 64,
            max_queued_packets: 32,
            ..SessionConfig::default()
        }
    }

    fn drain(p: &mut Packetizer) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(packet) = p.pop_for_send() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn test_six_to_five_emits_one_parity_after_fifth() {
        let mut p = Packetizer::new(&config(4), FecRatio::new(6, 5).unwrap()).unwrap();
        let summary = p
            .packetize(1, Bytes::from_static(b"abcdefghijklmnopqrst"), FrameType::Normal)
            .unwrap();
        assert_eq!(summary.data_packets, 5);
        assert_eq!(summary.redundancy_packets, 1);

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 6);
        assert!(packets[..5].iter().all(|pk| pk.header.packet_type == PacketType::Data));
        assert!(packets[5].header.is_parity());
        assert_eq!(packets[5].header.redundant_count, 5);
        assert_eq!(packets[5].header.fragment_index, 5);

        // Lose any one data packet; parity rebuilds it exactly
        let (base, parity) = split_parity_payload(&packets[5].payload).unwrap();
        assert_eq!(base, packets[0].sequence());
        for lost in 0..5 {
            let mut shards: Vec<Option<Bytes>> = packets[..5]
                .iter()
                .map(|pk| Some(fragment_shard(pk)))
                .chain(std::iter::once(Some(parity.clone())))
                .collect();
            shards[lost] = None;
            XorCodec.decode_batch(&mut shards, 5).unwrap();
            let rebuilt =
                rebuild_packet(shards[lost].as_ref().unwrap(), base.wrapping_add(lost as u16)).unwrap();
            assert_eq!(rebuilt, packets[lost]);
        }
    }

    #[test]
    fn test_countdown_spans_datagrams() {
        let mut p = Packetizer::new(&config(10), FecRatio::new(4, 3).unwrap()).unwrap();
        let a = p.packetize(1, Bytes::from(vec![1u8; 20]), FrameType::Key).unwrap();
        assert_eq!(a.redundancy_packets, 0);
        assert_eq!(p.fec_count(), 1);

        let b = p.packetize(2, Bytes::from(vec![2u8; 5]), FrameType::Normal).unwrap();
        assert_eq!(b.redundancy_packets, 1);
        assert_eq!(b.datagram_index, 1);

        let packets = drain(&mut p);
        let parity = &packets[3];
        assert!(parity.header.is_parity());
        assert_eq!(parity.header.datagram_index, 1);
        assert!(parity.header.flags.is_end_frame());
        assert!(!packets[2].header.flags.is_end_frame());
        let (base, _) = split_parity_payload(&parity.payload).unwrap();
        assert_eq!(base, packets[0].sequence());
    }

    #[test]
    fn test_ratio_change_applies_to_next_group() {
        let mut p = Packetizer::new(&config(1), FecRatio::new(3, 2).unwrap()).unwrap();
        p.packetize(0, Bytes::from_static(b"a"), FrameType::Normal).unwrap();
        p.set_ratio(FecRatio::new(5, 3).unwrap()).unwrap();
        assert_eq!(p.ratio(), FecRatio::new(3, 2).unwrap());

        // Closes the 3:2 group with one parity, then the 5:3 ratio takes over
        let s = p.packetize(0, Bytes::from_static(b"b"), FrameType::Normal).unwrap();
        assert_eq!(s.redundancy_packets, 1);
        assert_eq!(p.ratio(), FecRatio::new(5, 3).unwrap());
        assert_eq!(p.fec_count(), 3);

        let s = p.packetize(0, Bytes::from_static(b"cde"), FrameType::Normal).unwrap();
        assert_eq!(s.redundancy_packets, 2);
    }

    #[test]
    fn test_data_packets_carry_group_countdown() {
        let mut p = Packetizer::new(&config(4), FecRatio::new(6, 5).unwrap()).unwrap();
        p.packetize(1, Bytes::from(vec![3u8; 28]), FrameType::Normal).unwrap();
        let counts: Vec<u8> = drain(&mut p)
            .iter()
            .filter(|pk| pk.header.packet_type == PacketType::Data)
            .map(|pk| pk.header.redundant_count)
            .collect();
        assert_eq!(counts, vec![5, 4, 3, 2, 1, 5, 4]);
    }

    #[test]
    fn test_denominator_one_duplicates() {
        let mut p = Packetizer::new(&config(8), FecRatio::new(3, 1).unwrap()).unwrap();
        let s = p.packetize(9, Bytes::from_static(b"dup me"), FrameType::Normal).unwrap();
        assert_eq!(s.data_packets, 1);
        assert_eq!(s.redundancy_packets, 2);

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 3);
        // Data packets carry the countdown, which starts at the denominator
        assert_eq!(packets[0].header.redundant_count, 1);
        for copy in &packets[1..] {
            assert_eq!(copy.payload, packets[0].payload);
            assert_eq!(copy.header.packet_type, PacketType::Redundancy);
            assert_eq!(copy.header.redundant_count, 1);
            assert_eq!(copy.header.fragment_index, 0);
            assert!(copy.header.carries_fragment());
        }
        assert_eq!(packets[2].sequence(), packets[0].sequence().wrapping_add(2));
    }

    #[test]
    fn test_store_full_leaves_state_untouched() {
        let cfg = SessionConfig {
            packet_size: 1,
            store_capacity: 8,
            max_queued_packets: 4,
            ..SessionConfig::default()
        };
        let mut p = Packetizer::new(&cfg, FecRatio::new(6, 5).unwrap()).unwrap();
        p.packetize(0, Bytes::from_static(b"abc"), FrameType::Normal).unwrap();

        let err = p.packetize(1, Bytes::from_static(b"defgh"), FrameType::Normal);
        assert_eq!(err, Err(ConduitError::StoreFull { capacity: 8 }));
        assert_eq!(p.store().len(), 3);
        assert_eq!(p.next_sequence(), 3);
        assert_eq!(p.fec_count(), 2);
        assert_eq!(p.next_datagram_index(), 1);
    }

    #[test]
    fn test_sequence_and_datagram_index_wrap() {
        let cfg = SessionConfig {
            initial_sequence: 65534,
            ..config(100)
        };
        let mut p = Packetizer::new(&cfg, FecRatio::new(1, 1).unwrap()).unwrap();
        for i in 0..130u32 {
            p.packetize(i, Bytes::from_static(b"x"), FrameType::Normal).unwrap();
            p.pop_for_send().unwrap();
        }
        assert_eq!(p.next_datagram_index(), 2);
        assert_eq!(p.next_sequence(), 65534u16.wrapping_add(130));
        assert_eq!(p.lookup(65534u16.wrapping_add(129)).unwrap().header.timestamp, 129);
    }

    #[test]
    fn test_skip_abandons_partial_group() {
        let mut p = Packetizer::new(&config(4), FecRatio::new(6, 5).unwrap()).unwrap();
        p.packetize(0, Bytes::from_static(b"abcdefgh"), FrameType::Normal).unwrap();
        assert_eq!(p.fec_count(), 3);

        assert_eq!(p.skip_to_head(), 2);
        assert_eq!(p.fec_count(), 5);
        assert!(p.store().is_empty());
    }

    #[test]
    fn test_rejects_empty_and_oversized_datagrams() {
        let mut p = Packetizer::new(&config(1), FecRatio::new(1, 1).unwrap()).unwrap();
        assert!(matches!(
            p.packetize(0, Bytes::new(), FrameType::Normal),
            Err(ConduitError::InvalidParameter(_))
        ));
        assert!(matches!(
            p.packetize(0, Bytes::from(vec![0u8; MAX_K_FRAGMENTS + 1]), FrameType::Normal),
            Err(ConduitError::DatagramTooLarge { .. })
        ));
    }
}
