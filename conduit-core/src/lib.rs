//! # Conduit Core
//!
//! A loss-tolerant datagram conduit for real-time video over UDP.
//!
//! ## Modules
//!
//! - `config`: Session, handshake and redundancy configuration
//! - `constants`: Wire format constants and limits
//! - `types`: Core types (Packet, PacketHeader, Datagram)
//! - `encoder`: Packet encoding
//! - `decoder`: Strict packet decoding
//! - `seq`: Wraparound-safe sequence arithmetic
//! - `fec`: Redundancy codecs (XOR parity, optional Reed-Solomon)
//! - `store`: Bounded circular packet store
//! - `packetizer`: Fragmentation and redundancy emission
//! - `recovery`: Feedback-driven recovery state machine
//! - `feedback`: Receiver feedback messages
//! - `handshake`: Session handshake and stream parameters
//! - `session`: Per-stream sender state
//! - `sender`: Capture -> encode -> send pipeline
//! - `receiver`: Reassembly, parity recovery and loss reporting
//! - `transport`: UDP and in-memory datagram transports
//! - `video`: Capture and video encoder interfaces

#![warn(missing_docs)]

pub mod config;
pub mod constants;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod fec;
pub mod feedback;
pub mod handshake;
pub mod packetizer;
pub mod receiver;
pub mod recovery;
pub mod sender;
pub mod seq;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
pub mod video;

// Re-export commonly used types
pub use config::{FecRatio, HandshakeConfig, SessionConfig};
pub use constants::{FrameType, PacketFlags, PacketType};
pub use error::ConduitError;
pub use feedback::{Feedback, FeedbackCommand};
pub use handshake::StreamConfig;
pub use receiver::{ConduitReceiver, ReceiverStats, Reassembler};
pub use recovery::{EncodeFlags, FeedbackAction, RecoveryRequest, RecoveryState};
pub use sender::ConduitSender;
pub use session::{ConduitSession, SenderStats};
pub use transport::{MemoryLink, Transport, UdpTransport};
pub use types::{Datagram, Packet, PacketHeader};
pub use video::{EncodedFrame, FrameSource, RawImage, VideoEncoder};

/// Result type alias for conduit operations
pub type Result<T> = core::result::Result<T, ConduitError>;
