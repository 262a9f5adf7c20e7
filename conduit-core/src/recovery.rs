//! Feedback-driven recovery state machine
//!
//! The sender keeps two long-term reference anchors: the first sequence of
//! the most recent golden frame and of the most recent alt-ref frame. When
//! the receiver reports a loss, the state machine decides whether an exact
//! retransmission suffices or whether the encoder should produce a recovery
//! frame that references only the anchor the receiver is known to hold.
//!
//! At most one request is pending at a time. It is resolved by the next
//! encoded frame, after which the anchor for that frame moves to its first
//! sequence and the state returns to idle.

use crate::constants::FrameType;
use crate::feedback::{Feedback, FeedbackCommand};
use crate::seq;
use crate::store::PacketStore;
use crate::types::Packet;
use serde::{Deserialize, Serialize};

#[cfg(feature = "logging")]
use tracing::debug;

/// Per-frame control flags passed to the upstream video encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EncodeFlags(u32);

impl EncodeFlags {
    /// No flags set
    pub const NONE: u32 = 0;

    /// Force a key frame
    pub const FORCE_KEY: u32 = 1 << 0;

    /// Refresh the golden buffer with this frame
    pub const FORCE_GOLDEN: u32 = 1 << 1;

    /// Refresh the alt-ref buffer with this frame
    pub const FORCE_ALTREF: u32 = 1 << 2;

    /// Do not reference the most recent ordinary frame
    pub const NO_REF_LAST: u32 = 1 << 3;

    /// Do not reference the golden buffer
    pub const NO_REF_GOLDEN: u32 = 1 << 4;

    /// Do not reference the alt-ref buffer
    pub const NO_REF_ALTREF: u32 = 1 << 5;

    /// Leave the golden buffer untouched
    pub const NO_UPD_GOLDEN: u32 = 1 << 6;

    /// Leave the alt-ref buffer untouched
    pub const NO_UPD_ALTREF: u32 = 1 << 7;

    /// Create flags from raw bits
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if every bit in `bits` is set
    pub const fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Check if no flag is set
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Recovery frame the encoder should produce next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryRequest {
    /// Nothing pending
    #[default]
    Idle,
    /// Full key frame
    Key,
    /// Golden long-term reference frame
    Gold,
    /// Alt-ref long-term reference frame
    AltRef,
}

impl RecoveryRequest {
    /// Check if a request is pending
    pub fn is_pending(self) -> bool {
        self != RecoveryRequest::Idle
    }

    /// Frame type tagged on the frame that answers this request
    pub fn frame_type(self) -> FrameType {
        match self {
            RecoveryRequest::Idle => FrameType::Normal,
            RecoveryRequest::Key => FrameType::Key,
            RecoveryRequest::Gold => FrameType::Gold,
            RecoveryRequest::AltRef => FrameType::AltRef,
        }
    }

    /// Encoder flags that produce the requested frame
    ///
    /// Long-term recovery frames never reference the last ordinary frame or
    /// the other long-term buffer, and leave the other buffer untouched, so
    /// they decode with only the anchor the receiver already holds.
    pub fn encode_flags(self) -> EncodeFlags {
        EncodeFlags::new(match self {
            RecoveryRequest::Idle => EncodeFlags::NONE,
            RecoveryRequest::Key => EncodeFlags::FORCE_KEY,
            RecoveryRequest::Gold => {
                EncodeFlags::FORCE_GOLDEN
                    | EncodeFlags::NO_UPD_ALTREF
                    | EncodeFlags::NO_REF_LAST
                    | EncodeFlags::NO_REF_ALTREF
            }
            RecoveryRequest::AltRef => {
                EncodeFlags::FORCE_ALTREF
                    | EncodeFlags::NO_UPD_GOLDEN
                    | EncodeFlags::NO_REF_LAST
                    | EncodeFlags::NO_REF_GOLDEN
            }
        })
    }
}

/// What the sender should do about one feedback message
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackAction {
    /// Send this stored packet again
    Retransmit(Packet),
    /// A recovery frame was requested from the encoder
    Requested(RecoveryRequest),
    /// Nothing to do (request already pending, or the packet is gone)
    Ignored,
}

/// Pending request and the two long-term anchors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryState {
    pending: RecoveryRequest,
    gold_anchor: u16,
    altref_anchor: u16,
}

impl RecoveryState {
    /// Fresh state: the first encoded frame must be a key frame
    pub fn new() -> Self {
        Self {
            pending: RecoveryRequest::Key,
            gold_anchor: 0,
            altref_anchor: 0,
        }
    }

    /// Idle state with the given anchors
    pub fn with_anchors(gold_anchor: u16, altref_anchor: u16) -> Self {
        Self {
            pending: RecoveryRequest::Idle,
            gold_anchor,
            altref_anchor,
        }
    }

    /// Request awaiting the next encoded frame
    pub fn pending(&self) -> RecoveryRequest {
        self.pending
    }

    /// First sequence of the most recent golden frame
    pub fn gold_anchor(&self) -> u16 {
        self.gold_anchor
    }

    /// First sequence of the most recent alt-ref frame
    pub fn altref_anchor(&self) -> u16 {
        self.altref_anchor
    }

    /// Flags for the next call into the encoder
    pub fn encode_flags(&self) -> EncodeFlags {
        self.pending.encode_flags()
    }

    /// Fresher anchor first, fallback second
    ///
    /// Gold wins ties.
    pub fn anchors(&self) -> ((u16, RecoveryRequest), (u16, RecoveryRequest)) {
        let gold = (self.gold_anchor, RecoveryRequest::Gold);
        let altref = (self.altref_anchor, RecoveryRequest::AltRef);
        if seq::is_at_or_after(self.gold_anchor, self.altref_anchor) {
            (gold, altref)
        } else {
            (altref, gold)
        }
    }

    /// Decide how to answer one feedback message
    ///
    /// Lookup misses are absorbed: feedback for a sequence the store no
    /// longer holds (or never held) is ignored and requests nothing.
    pub fn handle_feedback(&mut self, feedback: Feedback, store: &PacketStore) -> FeedbackAction {
        let sequence = feedback.sequence;
        let stored = store.lookup(sequence).ok();

        let retransmit = || match stored {
            Some(packet) => FeedbackAction::Retransmit(packet.clone()),
            None => {
                #[cfg(feature = "logging")]
                debug!("Sequence {} no longer stored, retransmission dropped", sequence);
                FeedbackAction::Ignored
            }
        };

        match feedback.command {
            FeedbackCommand::Resend if self.pending.is_pending() => FeedbackAction::Ignored,
            FeedbackCommand::Resend => retransmit(),
            FeedbackCommand::RecoveryQuery if self.pending.is_pending() => retransmit(),
            FeedbackCommand::RecoveryQuery => {
                let Some(packet) = stored else {
                    #[cfg(feature = "logging")]
                    debug!("Query for unknown sequence {} ignored", sequence);
                    return FeedbackAction::Ignored;
                };
                let ((anchor, kind), (fallback, fallback_kind)) = self.anchors();

                if seq::is_before(sequence, anchor) {
                    return retransmit();
                }

                let normal = packet.header.frame_type == FrameType::Normal;

                let request = if normal && seq::is_after(sequence, anchor) {
                    kind
                } else if seq::is_after(sequence, fallback) {
                    fallback_kind
                } else {
                    RecoveryRequest::Key
                };

                #[cfg(feature = "logging")]
                debug!(
                    "Loss at {} (gold {}, altref {}): requesting {:?}",
                    sequence, self.gold_anchor, self.altref_anchor, request
                );

                self.pending = request;
                FeedbackAction::Requested(request)
            }
        }
    }

    /// Move the anchors for a frame whose first packet is `first_sequence`
    ///
    /// Key frames move both anchors.
    pub fn record_anchor(&mut self, frame_type: FrameType, first_sequence: u16) {
        if matches!(frame_type, FrameType::Key | FrameType::Gold) {
            self.gold_anchor = first_sequence;
        }
        if matches!(frame_type, FrameType::Key | FrameType::AltRef) {
            self.altref_anchor = first_sequence;
        }
    }

    /// Mark the pending request as answered
    pub fn resolve(&mut self) -> RecoveryRequest {
        std::mem::take(&mut self.pending)
    }
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new()
    }
}
