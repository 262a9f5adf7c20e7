//! Per-stream sender state
//!
//! A [`ConduitSession`] owns the packetizer (and through it the packet store)
//! and the recovery state of one stream. Nothing in it is shared: several
//! sessions can run side by side, each driven by its own send loop.

use crate::config::{FecRatio, SessionConfig};
use crate::constants::FrameType;
use crate::error::ConduitError;
use crate::feedback::Feedback;
use crate::handshake::StreamConfig;
use crate::packetizer::Packetizer;
use crate::recovery::{FeedbackAction, RecoveryRequest, RecoveryState};
use crate::types::Packet;
use crate::video::{EncodedFrame, RawImage, VideoEncoder};
use serde::{Deserialize, Serialize};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Sender counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderStats {
    /// Images handed to the encoder
    pub frames_encoded: u64,
    /// Captured images dropped before encoding
    pub frames_dropped: u64,
    /// Datagrams packetized
    pub datagrams: u64,
    /// Data fragments produced
    pub data_packets: u64,
    /// Redundancy packets produced
    pub redundancy_packets: u64,
    /// Packets taken from the store for first transmission
    pub packets_sent: u64,
    /// Unsent packets dropped ahead of recovery frames
    pub packets_skipped: u64,
    /// Feedback messages handled
    pub feedback_received: u64,
    /// Exact retransmissions
    pub retransmissions: u64,
    /// Feedback that needed no action
    pub feedback_ignored: u64,
    /// Key frames requested
    pub key_requests: u64,
    /// Golden frames requested
    pub gold_requests: u64,
    /// Alt-ref frames requested
    pub altref_requests: u64,
}

/// Sender side of one conduit
#[derive(Debug)]
pub struct ConduitSession {
    config: SessionConfig,
    stream: StreamConfig,
    packetizer: Packetizer,
    recovery: RecoveryState,
    timestamp: u32,
    stats: SenderStats,
}

impl ConduitSession {
    /// Open a session with negotiated stream parameters
    pub fn open(config: SessionConfig, stream: StreamConfig) -> Result<Self, ConduitError> {
        let ratio = stream.fec_ratio()?;
        let packetizer = Packetizer::new(&config, ratio)?;

        #[cfg(feature = "logging")]
        debug!(
            "Opened session: {}x{} at {}fps, FEC {}:{} ({:?}), packet size {}",
            stream.width,
            stream.height,
            stream.fps,
            ratio.numerator,
            ratio.denominator,
            config.fec_scheme,
            config.packet_size
        );

        Ok(Self {
            config,
            stream,
            packetizer,
            recovery: RecoveryState::new(),
            timestamp: 0,
            stats: SenderStats::default(),
        })
    }

    /// Local configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Negotiated stream parameters
    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    /// Packetizer (read-only)
    pub fn packetizer(&self) -> &Packetizer {
        &self.packetizer
    }

    /// Recovery state (read-only)
    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    /// Counters so far
    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Timestamp the next frame will carry
    pub fn next_timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Packets queued but not yet sent
    pub fn queued(&self) -> usize {
        self.packetizer.store().len()
    }

    /// Check if fewer than `max_queued_packets` packets wait to be sent
    pub fn has_room(&self) -> bool {
        self.queued() < self.config.max_queued_packets
    }

    /// Change the redundancy ratio from the next group on
    pub fn set_redundancy(&mut self, ratio: FecRatio) -> Result<(), ConduitError> {
        self.packetizer.set_ratio(ratio)
    }

    /// Count a captured image that was dropped before encoding
    pub fn record_dropped_frame(&mut self) {
        self.stats.frames_dropped += 1;
    }

    /// Encode one image and packetize the result
    ///
    /// The pending recovery request selects the encoder flags. Returns the
    /// number of datagrams packetized.
    pub fn encode_frame<E: VideoEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        image: &RawImage,
    ) -> Result<usize, ConduitError> {
        let flags = self.recovery.encode_flags();
        let frames = encoder.encode(image, flags)?;
        self.stats.frames_encoded += 1;
        self.push_encoded(frames)
    }

    /// Packetize the frames the encoder produced for one image
    ///
    /// The first frame answers the pending recovery request: unsent packets
    /// are dropped first, and once the frame is stored its anchor moves to
    /// the frame's first sequence. The timestamp advances once per call.
    pub fn push_encoded(&mut self, frames: Vec<EncodedFrame>) -> Result<usize, ConduitError> {
        let request = self.recovery.pending();
        let timestamp = self.timestamp;
        self.timestamp = self.timestamp.wrapping_add(1);

        let mut datagrams = 0;
        for (i, frame) in frames.into_iter().enumerate() {
            let answering = i == 0 && request.is_pending();
            let frame_type = if frame.is_key {
                FrameType::Key
            } else if i == 0 {
                request.frame_type()
            } else {
                FrameType::Normal
            };

            if answering {
                self.stats.packets_skipped += self.packetizer.skip_to_head() as u64;
            }

            let summary = self.packetizer.packetize(timestamp, frame.data, frame_type)?;
            self.recovery.record_anchor(frame_type, summary.first_sequence);
            if answering {
                self.recovery.resolve();

                #[cfg(feature = "logging")]
                debug!(
                    "Answered {:?} request with {:?} frame at sequence {}",
                    request, frame_type, summary.first_sequence
                );
            }

            self.stats.datagrams += 1;
            self.stats.data_packets += summary.data_packets as u64;
            self.stats.redundancy_packets += summary.redundancy_packets as u64;
            datagrams += 1;
        }

        Ok(datagrams)
    }

    /// Apply one feedback message
    pub fn handle_feedback(&mut self, feedback: Feedback) -> FeedbackAction {
        self.stats.feedback_received += 1;
        let action = self.recovery.handle_feedback(feedback, self.packetizer.store());

        match &action {
            FeedbackAction::Retransmit(_) => self.stats.retransmissions += 1,
            FeedbackAction::Ignored => self.stats.feedback_ignored += 1,
            FeedbackAction::Requested(request) => match request {
                RecoveryRequest::Key => self.stats.key_requests += 1,
                RecoveryRequest::Gold => self.stats.gold_requests += 1,
                RecoveryRequest::AltRef => self.stats.altref_requests += 1,
                RecoveryRequest::Idle => {}
            },
        }
        action
    }

    /// Take the next packet due for first transmission
    pub fn next_packet(&mut self) -> Option<Packet> {
        match self.packetizer.pop_for_send() {
            Ok(packet) => {
                self.stats.packets_sent += 1;
                Some(packet)
            }
            Err(ConduitError::Empty) => None,
            Err(_e) => {
                #[cfg(feature = "logging")]
                warn!("Packet store inconsistent: {}", _e);
                None
            }
        }
    }
}
