//! Deterministic in-process run of a sender and receiver over a lossy link
//!
//! Both directions drop packets with the same probability, drawn from a
//! seeded `StdRng`, so a given seed always reproduces the same run.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use conduit_core::{
    receiver::{LossTracker, Reassembler},
    video::PassthroughEncoder,
    ConduitSession, FecRatio, Feedback, FeedbackAction, Packet, RawImage, ReceiverStats,
    SenderStats, SessionConfig, StreamConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use tracing::{debug, info};

/// Arguments of `conduit simulate`
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Frames to send
    pub frames: u32,
    /// Bytes per frame
    pub frame_size: usize,
    /// Probability that any one datagram is lost, in each direction
    pub loss: f64,
    /// Random seed
    pub seed: u64,
    /// Redundancy ratio
    pub ratio: FecRatio,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            frames: 300,
            frame_size: 6000,
            loss: 0.02,
            seed: 1,
            ratio: FecRatio::default(),
        }
    }
}

/// Outcome of a simulated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Frames handed to the sender
    pub frames: u32,
    /// Datagrams the receiver completed
    pub delivered: u64,
    /// Delivered datagrams whose bytes differ from what was sent
    pub corrupted: u64,
    /// `delivered / frames`
    pub delivery_ratio: f64,
    /// Packets dropped by the link
    pub packets_lost: u64,
    /// Feedback messages dropped by the link
    pub feedback_lost: u64,
    /// Sender counters
    pub sender: SenderStats,
    /// Receiver counters
    pub receiver: ReceiverStats,
}

fn frame_payload(frame: u32, size: usize) -> Bytes {
    (0..size)
        .map(|i| (frame as usize).wrapping_mul(31).wrapping_add(i) as u8)
        .collect::<Vec<u8>>()
        .into()
}

/// Run the simulation
pub fn run(config: SessionConfig, opts: &SimulateOptions) -> Result<SimulationReport> {
    if !(0.0..=1.0).contains(&opts.loss) {
        bail!("loss probability {} outside 0..=1", opts.loss);
    }
    if opts.frame_size == 0 {
        bail!("frame size must be non-zero");
    }

    let stream = StreamConfig {
        fec_numerator: opts.ratio.numerator,
        fec_denominator: opts.ratio.denominator,
        ..StreamConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut tracker = LossTracker::new(config.reorder_window);
    let mut session = ConduitSession::open(config, stream)
        .with_context(|| "Failed to open simulated session")?;
    let mut reassembler = Reassembler::new();
    let mut encoder = PassthroughEncoder;

    let mut sent: HashMap<u32, Bytes> = HashMap::new();
    let mut delivered = 0u64;
    let mut corrupted = 0u64;
    let mut packets_lost = 0u64;
    let mut feedback_lost = 0u64;
    let mut feedback_sent = 0u64;

    for frame in 0..opts.frames {
        let image = RawImage {
            width: stream.width,
            height: stream.height,
            data: frame_payload(frame, opts.frame_size),
        };
        sent.insert(session.next_timestamp(), image.data.clone());
        session.encode_frame(&mut encoder, &image)?;

        let mut wire: VecDeque<Packet> = std::iter::from_fn(|| session.next_packet()).collect();
        while let Some(packet) = wire.pop_front() {
            if rng.gen_bool(opts.loss) {
                packets_lost += 1;
                continue;
            }

            tracker.observe(packet.sequence());
            for datagram in reassembler.push(packet) {
                delivered += 1;
                if sent.get(&datagram.timestamp) != Some(&datagram.payload) {
                    corrupted += 1;
                }
            }

            for lost in tracker.due() {
                if !reassembler.loss_matters(lost) {
                    continue;
                }
                feedback_sent += 1;
                if rng.gen_bool(opts.loss) {
                    feedback_lost += 1;
                    continue;
                }

                let wire_bytes = Feedback::recovery_query(lost).encode();
                let feedback = Feedback::parse(&wire_bytes)?;
                match session.handle_feedback(feedback) {
                    FeedbackAction::Retransmit(again) => wire.push_back(again),
                    FeedbackAction::Requested(request) => {
                        debug!("Frame {}: loss of {} requested {:?}", frame, lost, request)
                    }
                    FeedbackAction::Ignored => {}
                }
            }
        }
    }

    let mut receiver = reassembler.stats().clone();
    receiver.feedback_sent = feedback_sent;

    let report = SimulationReport {
        frames: opts.frames,
        delivered,
        corrupted,
        delivery_ratio: if opts.frames == 0 {
            1.0
        } else {
            delivered as f64 / opts.frames as f64
        },
        packets_lost,
        feedback_lost,
        sender: session.stats().clone(),
        receiver,
    };

    info!(
        "Delivered {}/{} frames ({:.1}%), {} packets lost, {} rebuilt from parity",
        report.delivered,
        report.frames,
        report.delivery_ratio * 100.0,
        report.packets_lost,
        report.receiver.recovered_packets
    );
    Ok(report)
}

pub fn execute(config: SessionConfig, opts: &SimulateOptions, output: Option<&str>) -> Result<()> {
    let report = run(config, opts)?;
    let json = serde_json::to_string_pretty(&report)
        .with_context(|| "Failed to serialize simulation report")?;

    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write report: {}", path))?;
            info!("Report written to {}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
