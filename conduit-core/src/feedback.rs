//! Receiver -> sender feedback messages
//!
//! A feedback message is three bytes: a command byte followed by the
//! big-endian sequence number it refers to.

use crate::error::ConduitError;

/// Size of an encoded feedback message
pub const FEEDBACK_SIZE: usize = 3;

/// Feedback command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackCommand {
    /// Retransmit the packet verbatim
    Resend,
    /// Packet lost; let the sender choose between retransmission and a recovery frame
    RecoveryQuery,
}

impl FeedbackCommand {
    /// Wire byte
    pub fn as_byte(self) -> u8 {
        match self {
            FeedbackCommand::Resend => b'r',
            FeedbackCommand::RecoveryQuery => b'g',
        }
    }

    /// Parse a wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'r' => Some(FeedbackCommand::Resend),
            b'g' => Some(FeedbackCommand::RecoveryQuery),
            _ => None,
        }
    }
}

/// One feedback message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Feedback {
    /// What the receiver asks for
    pub command: FeedbackCommand,
    /// Sequence of the lost packet
    pub sequence: u16,
}

impl Feedback {
    /// Ask for a verbatim retransmission
    pub fn resend(sequence: u16) -> Self {
        Self {
            command: FeedbackCommand::Resend,
            sequence,
        }
    }

    /// Report a loss and let the sender pick the recovery
    pub fn recovery_query(sequence: u16) -> Self {
        Self {
            command: FeedbackCommand::RecoveryQuery,
            sequence,
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; FEEDBACK_SIZE] {
        let [hi, lo] = self.sequence.to_be_bytes();
        [self.command.as_byte(), hi, lo]
    }

    /// Parse wire bytes
    ///
    /// Anything past the first three bytes is ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ConduitError> {
        if data.len() < FEEDBACK_SIZE {
            return Err(ConduitError::Malformed(format!(
                "feedback message of {} bytes",
                data.len()
            )));
        }

        let command = FeedbackCommand::from_byte(data[0]).ok_or_else(|| {
            ConduitError::Malformed(format!("unknown feedback command 0x{:02x}", data[0]))
        })?;

        Ok(Self {
            command,
            sequence: u16::from_be_bytes([data[1], data[2]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        assert_eq!(Feedback::resend(0x1234).encode(), [b'r', 0x12, 0x34]);
        assert_eq!(Feedback::recovery_query(7).encode(), [b'g', 0, 7]);
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            Feedback::parse(&[b'g', 0xff, 0xfe, 0xaa]).unwrap(),
            Feedback::recovery_query(65534)
        );
        assert!(Feedback::parse(&[b'r', 1]).is_err());
        assert!(matches!(
            Feedback::parse(&[b'x', 0, 1]),
            Err(ConduitError::Malformed(_))
        ));
    }
}
