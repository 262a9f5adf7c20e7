//! Receiver side: reassembly, parity recovery and loss reporting
//!
//! [`Reassembler`] keeps a history of recently received packets indexed by
//! sequence and one reassembly slot per datagram index. A fragment whose
//! slot holds an older datagram evicts it, so at most 128 datagrams are ever
//! in flight. Parity packets name the base sequence of the group they
//! protect; once enough members and parities are present the missing
//! members are rebuilt and fed back in as if they had arrived.
//!
//! [`LossTracker`] turns sequence gaps into recovery queries once the stream
//! has moved a reorder window past them.

use crate::config::SessionConfig;
use crate::constants::{FrameType, DATAGRAM_WINDOW, MAX_FEC_NUMERATOR};
use crate::decoder::{decode_packet_from_bytes, is_conduit_packet};
use crate::error::ConduitError;
use crate::fec::{fragment_shard, rebuild_packet, split_parity_payload, FecScheme, RedundancyDecoder};
use crate::feedback::Feedback;
use crate::handshake::{self, StreamConfig};
use crate::seq;
use crate::sender::MAX_DATAGRAM;
use crate::transport::Transport;
use crate::types::{Datagram, Packet, PacketHeader};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Packets remembered for duplicate suppression and parity recovery
pub const HISTORY: usize = 1024;

/// Largest gap reported as individual losses
pub const MAX_REPORTED_GAP: u16 = 512;

/// How far to look for a received neighbour of a lost sequence
const NEIGHBOR_SCAN: u16 = 64;

/// Receiver counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverStats {
    /// Distinct packets accepted
    pub packets_received: u64,
    /// Packets seen before (or already rebuilt)
    pub duplicates: u64,
    /// Packets or parity payloads that failed to parse
    pub malformed: u64,
    /// Data packets rebuilt from parity
    pub recovered_packets: u64,
    /// Datagrams delivered
    pub datagrams_completed: u64,
    /// Incomplete datagrams pushed out of the window
    pub datagrams_evicted: u64,
    /// Fragments of datagrams already evicted
    pub stale_fragments: u64,
    /// Feedback messages sent
    pub feedback_sent: u64,
    /// Payload bytes delivered
    pub bytes_delivered: u64,
}

#[derive(Debug)]
struct PartialDatagram {
    timestamp: u32,
    frame_type: FrameType,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    complete: bool,
}

#[derive(Debug)]
struct ParityGroup {
    members: usize,
    scheme: FecScheme,
    parities: Vec<Option<Bytes>>,
    done: bool,
}

/// Datagram reassembly with parity recovery
#[derive(Debug)]
pub struct Reassembler {
    history: Vec<Option<Packet>>,
    datagrams: Vec<Option<PartialDatagram>>,
    groups: HashMap<u16, ParityGroup>,
    newest: Option<u16>,
    stats: ReceiverStats,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self {
            history: vec![None; HISTORY],
            datagrams: (0..DATAGRAM_WINDOW).map(|_| None).collect(),
            groups: HashMap::new(),
            newest: None,
            stats: ReceiverStats::default(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Newest sequence seen
    pub fn newest(&self) -> Option<u16> {
        self.newest
    }

    fn get(&self, sequence: u16) -> Option<&Packet> {
        self.history[sequence as usize % HISTORY]
            .as_ref()
            .filter(|p| p.sequence() == sequence)
    }

    /// Check if `sequence` was received or rebuilt
    pub fn contains(&self, sequence: u16) -> bool {
        self.get(sequence).is_some()
    }

    fn remember(&mut self, packet: Packet) {
        let slot = packet.sequence() as usize % HISTORY;
        self.history[slot] = Some(packet);
    }

    /// Accept one packet, returning any datagrams it completed
    pub fn push(&mut self, packet: Packet) -> Vec<Datagram> {
        let sequence = packet.sequence();
        if self.contains(sequence) {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        self.stats.packets_received += 1;
        self.newest = Some(match self.newest {
            Some(newest) => seq::latest(newest, sequence),
            None => sequence,
        });
        self.prune_groups();
        self.remember(packet.clone());

        let mut out = Vec::new();
        if packet.header.is_parity() {
            self.on_parity(&packet, &mut out);
        } else {
            self.on_fragment(&packet, &mut out);
            let covering: Vec<u16> = self
                .groups
                .iter()
                .filter(|(base, g)| !g.done && (seq::distance(sequence, **base) as usize) < g.members)
                .map(|(base, _)| *base)
                .collect();
            for base in covering {
                self.try_recover(base, &mut out);
            }
        }
        out
    }

    fn on_parity(&mut self, packet: &Packet, out: &mut Vec<Datagram>) {
        let (base, shard) = match split_parity_payload(&packet.payload) {
            Ok(parts) => parts,
            Err(_e) => {
                #[cfg(feature = "logging")]
                warn!("Dropping parity packet {}: {}", packet.sequence(), _e);
                self.stats.malformed += 1;
                return;
            }
        };

        let members = packet.header.redundant_count as usize;
        let ordinal = seq::distance(packet.sequence(), base) as usize;
        if ordinal < members || ordinal - members >= MAX_FEC_NUMERATOR as usize {
            self.stats.malformed += 1;
            return;
        }
        let ordinal = ordinal - members;

        let group = self.groups.entry(base).or_insert_with(|| ParityGroup {
            members,
            scheme: FecScheme::from_flags(packet.header.flags),
            parities: Vec::new(),
            done: false,
        });
        if group.members != members {
            self.stats.malformed += 1;
            return;
        }
        if group.parities.len() <= ordinal {
            group.parities.resize(ordinal + 1, None);
        }
        group.parities[ordinal] = Some(shard);

        self.try_recover(base, out);
    }

    fn try_recover(&mut self, base: u16, out: &mut Vec<Datagram>) {
        let (members, scheme, parities) = match self.groups.get(&base) {
            Some(g) if !g.done => (g.members, g.scheme, g.parities.clone()),
            _ => return,
        };

        let mut shards: Vec<Option<Bytes>> = (0..members)
            .map(|i| {
                self.get(base.wrapping_add(i as u16))
                    .filter(|p| p.header.carries_fragment())
                    .map(fragment_shard)
            })
            .collect();
        let missing: Vec<usize> = (0..members).filter(|&i| shards[i].is_none()).collect();

        if missing.is_empty() {
            self.finish_group(base);
            return;
        }

        let codec = match scheme.codec() {
            Ok(codec) => codec,
            Err(_) => {
                self.finish_group(base);
                return;
            }
        };

        shards.extend(parities);
        if !codec.can_reconstruct(&shards, members) {
            return;
        }
        if let Err(_e) = codec.decode_batch(&mut shards, members) {
            #[cfg(feature = "logging")]
            debug!("Parity group {} not recoverable: {}", base, _e);
            return;
        }
        self.finish_group(base);

        for i in missing {
            let sequence = base.wrapping_add(i as u16);
            let Some(shard) = shards[i].as_ref() else {
                continue;
            };
            match rebuild_packet(shard, sequence) {
                Ok(packet) => {
                    #[cfg(feature = "logging")]
                    debug!("Rebuilt packet {} from parity group {}", sequence, base);
                    self.stats.recovered_packets += 1;
                    self.remember(packet.clone());
                    self.on_fragment(&packet, out);
                }
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    warn!("Rebuilt shard for {} is invalid: {}", sequence, _e);
                    self.stats.malformed += 1;
                }
            }
        }
    }

    fn finish_group(&mut self, base: u16) {
        if let Some(group) = self.groups.get_mut(&base) {
            group.done = true;
            group.parities.clear();
        }
    }

    fn prune_groups(&mut self) {
        if let Some(newest) = self.newest {
            self.groups
                .retain(|base, _| (seq::distance(newest, *base) as usize) < HISTORY / 2);
        }
    }

    fn on_fragment(&mut self, packet: &Packet, out: &mut Vec<Datagram>) {
        let h = &packet.header;
        let k = h.k_fragments as usize;
        let index = h.fragment_index as usize;
        if index >= k {
            self.stats.malformed += 1;
            return;
        }

        let slot = &mut self.datagrams[h.datagram_index as usize % DATAGRAM_WINDOW];
        let evict = match slot.as_ref() {
            Some(d) if d.timestamp == h.timestamp => false,
            Some(d) if seq::timestamp_is_after(d.timestamp, h.timestamp) => {
                self.stats.stale_fragments += 1;
                return;
            }
            Some(d) => {
                if !d.complete {
                    #[cfg(feature = "logging")]
                    debug!(
                        "Evicting datagram {} ({}/{} fragments)",
                        h.datagram_index,
                        d.received,
                        d.fragments.len()
                    );
                    self.stats.datagrams_evicted += 1;
                }
                true
            }
            None => false,
        };
        if evict {
            *slot = None;
        }

        let d = slot.get_or_insert_with(|| PartialDatagram {
            timestamp: h.timestamp,
            frame_type: h.frame_type,
            fragments: vec![None; k],
            received: 0,
            complete: false,
        });
        if d.complete {
            return;
        }
        if d.fragments.len() != k {
            self.stats.malformed += 1;
            return;
        }
        if d.fragments[index].is_some() {
            return;
        }

        d.fragments[index] = Some(packet.payload.clone());
        d.received += 1;
        if d.received < k {
            return;
        }

        d.complete = true;
        let fragments = std::mem::take(&mut d.fragments);
        let mut payload = BytesMut::with_capacity(fragments.iter().flatten().map(Bytes::len).sum());
        for fragment in fragments.iter().flatten() {
            payload.extend_from_slice(fragment);
        }

        self.stats.datagrams_completed += 1;
        self.stats.bytes_delivered += payload.len() as u64;
        out.push(Datagram {
            index: h.datagram_index,
            timestamp: d.timestamp,
            frame_type: d.frame_type,
            payload: payload.freeze(),
        });
    }

    fn is_complete(&self, header: &PacketHeader) -> bool {
        matches!(
            &self.datagrams[header.datagram_index as usize % DATAGRAM_WINDOW],
            Some(d) if d.timestamp == header.timestamp && d.complete
        )
    }

    /// Check if losing `sequence` can still matter
    ///
    /// A loss is moot when the nearest received packets on both sides belong
    /// to the same or adjacent datagrams and both are complete: the lost
    /// packet was then redundancy or a fragment that has been rebuilt.
    pub fn loss_matters(&self, sequence: u16) -> bool {
        if self.contains(sequence) {
            return false;
        }

        let prev = (1..=NEIGHBOR_SCAN).find_map(|d| self.get(sequence.wrapping_sub(d)));
        let next = (1..=NEIGHBOR_SCAN).find_map(|d| self.get(sequence.wrapping_add(d)));
        match (prev, next) {
            (Some(p), Some(n)) => {
                let span = (n.header.datagram_index as usize + DATAGRAM_WINDOW
                    - p.header.datagram_index as usize)
                    % DATAGRAM_WINDOW;
                !(span <= 1 && self.is_complete(&p.header) && self.is_complete(&n.header))
            }
            _ => true,
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequence gap detector
#[derive(Debug, Clone)]
pub struct LossTracker {
    reorder_window: u16,
    highest: Option<u16>,
    missing: VecDeque<u16>,
}

impl LossTracker {
    /// Report gaps once the stream is `reorder_window` packets past them
    pub fn new(reorder_window: u16) -> Self {
        Self {
            reorder_window: reorder_window.max(1),
            highest: None,
            missing: VecDeque::new(),
        }
    }

    /// Highest sequence observed
    pub fn highest(&self) -> Option<u16> {
        self.highest
    }

    /// Sequences currently considered missing
    pub fn missing(&self) -> impl Iterator<Item = u16> + '_ {
        self.missing.iter().copied()
    }

    /// Record an arrival
    pub fn observe(&mut self, sequence: u16) {
        match self.highest {
            None => self.highest = Some(sequence),
            Some(highest) if seq::is_after(sequence, highest) => {
                let gap = seq::distance(sequence, highest) - 1;
                if gap > MAX_REPORTED_GAP {
                    #[cfg(feature = "logging")]
                    warn!("Gap of {} packets before {}, not reporting", gap, sequence);
                    self.missing.clear();
                } else {
                    self.missing
                        .extend((1..=gap).map(|i| highest.wrapping_add(i)));
                }
                self.highest = Some(sequence);
            }
            Some(_) => {
                if let Some(pos) = self.missing.iter().position(|&s| s == sequence) {
                    self.missing.remove(pos);
                }
            }
        }
    }

    /// Take the losses that have aged past the reorder window
    pub fn due(&mut self) -> Vec<u16> {
        let Some(highest) = self.highest else {
            return Vec::new();
        };

        let mut due = Vec::new();
        while let Some(&sequence) = self.missing.front() {
            if seq::distance(highest, sequence) < self.reorder_window {
                break;
            }
            self.missing.pop_front();
            due.push(sequence);
        }
        due
    }
}

/// Receive loop for one conduit
pub struct ConduitReceiver<T: Transport + ?Sized> {
    transport: Arc<T>,
    stream: StreamConfig,
    config: SessionConfig,
    reassembler: Reassembler,
    tracker: LossTracker,
    malformed: u64,
    feedback_sent: u64,
    buf: Vec<u8>,
}

impl<T: Transport + ?Sized> ConduitReceiver<T> {
    /// Create a receiver that will offer `stream` to the sender
    pub fn new(transport: Arc<T>, stream: StreamConfig, config: SessionConfig) -> Result<Self, ConduitError> {
        config.validate()?;
        stream.fec_ratio()?;

        Ok(Self {
            transport,
            stream,
            tracker: LossTracker::new(config.reorder_window),
            config,
            reassembler: Reassembler::new(),
            malformed: 0,
            feedback_sent: 0,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Stream parameters offered to the sender
    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    /// Counters so far
    pub fn stats(&self) -> ReceiverStats {
        let mut stats = self.reassembler.stats().clone();
        stats.malformed += self.malformed;
        stats.feedback_sent = self.feedback_sent;
        stats
    }

    /// Answer the sender's handshake
    ///
    /// Returns any datagram completed by a data packet that ended the handshake.
    pub fn accept(&mut self) -> Result<Vec<Datagram>, ConduitError> {
        match handshake::accept(self.transport.as_ref(), &self.stream, &self.config.handshake)? {
            Some(packet) => self.ingest(packet),
            None => Ok(Vec::new()),
        }
    }

    /// Wait up to `timeout` for one datagram from the sender
    ///
    /// Returns `Ok(None)` when nothing arrived.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<Datagram>>, ConduitError> {
        let Some(n) = self.transport.recv_timeout(&mut self.buf, timeout)? else {
            return Ok(None);
        };

        if !is_conduit_packet(&self.buf[..n]) {
            // Late handshake traffic
            return Ok(Some(Vec::new()));
        }

        match decode_packet_from_bytes(&self.buf[..n]) {
            Ok(packet) => self.ingest(packet).map(Some),
            Err(_e) => {
                #[cfg(feature = "logging")]
                warn!("Dropping packet: {}", _e);
                self.malformed += 1;
                Ok(Some(Vec::new()))
            }
        }
    }

    fn ingest(&mut self, packet: Packet) -> Result<Vec<Datagram>, ConduitError> {
        self.tracker.observe(packet.sequence());
        let datagrams = self.reassembler.push(packet);
        self.report_losses()?;
        Ok(datagrams)
    }

    fn report_losses(&mut self) -> Result<(), ConduitError> {
        for sequence in self.tracker.due() {
            if !self.reassembler.loss_matters(sequence) {
                continue;
            }

            #[cfg(feature = "logging")]
            debug!("Reporting loss of {}", sequence);
            self.transport
                .send(&Feedback::recovery_query(sequence).encode())?;
            self.feedback_sent += 1;
        }
        Ok(())
    }

    /// Receive until no packet arrives for `idle`, handing each datagram to `on_datagram`
    pub fn run<F: FnMut(Datagram)>(&mut self, idle: Duration, mut on_datagram: F) -> Result<ReceiverStats, ConduitError> {
        let poll = self.config.poll_interval().max(Duration::from_millis(1));
        let mut last_packet = Instant::now();

        loop {
            match self.poll(poll)? {
                Some(datagrams) => {
                    last_packet = Instant::now();
                    datagrams.into_iter().for_each(&mut on_datagram);
                }
                None if last_packet.elapsed() >= idle => return Ok(self.stats()),
                None => {}
            }
        }
    }
}
