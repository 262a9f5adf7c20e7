//! Error types for conduit operations

/// Errors that can occur while operating a conduit
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConduitError {
    /// Bad open-time parameter or ratio
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Packet store has no free slot
    #[error("Packet store full (capacity {capacity})")]
    StoreFull {
        /// Capacity of the store
        capacity: usize,
    },

    /// Nothing queued for transmission
    #[error("Packet store empty")]
    Empty,

    /// Requested sequence is no longer held by the store
    #[error("Sequence {0} not found (slot overwritten or never written)")]
    NotFound(u16),

    /// Packet carries a magic/version this build does not speak
    #[error("Version mismatch: expected {expected:#06x}, got {actual:#06x}")]
    VersionMismatch {
        /// The magic/version value we expect
        expected: u16,
        /// The value found in the packet
        actual: u16,
    },

    /// Header fields are out of range or inconsistent
    #[error("Invalid packet header: {0}")]
    InvalidHeader(String),

    /// Not enough bytes for a complete packet
    #[error("Incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// The number of bytes expected.
        expected: usize,
        /// The number of bytes actually found.
        actual: usize,
    },

    /// Datagram needs more fragments than the header can describe
    #[error("Datagram of {size} bytes needs {fragments} data and {redundancy} redundancy fragments")]
    DatagramTooLarge {
        /// Datagram size in bytes
        size: usize,
        /// Data fragments required
        fragments: usize,
        /// Redundancy fragments required
        redundancy: usize,
    },

    /// Redundancy coding could not be performed
    #[error("FEC error: {0}")]
    Fec(String),

    /// Upstream video encoder reported a failure
    #[error("Encoder failure: {0}")]
    EncoderFailure(String),

    /// Malformed handshake or feedback message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Peer never answered the handshake
    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    /// A pipeline channel was closed by its peer
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error during send/receive
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::Io(err.to_string())
    }
}
