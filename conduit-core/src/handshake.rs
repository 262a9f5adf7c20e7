//! Session handshake
//!
//! Before any video flows the sender repeats `initiate` until the receiver
//! answers with `configuration <width> <height> <fps> <bitrate> <num> <den>`,
//! then sends `confirmed` a few times since the handshake itself has no
//! recovery. Messages are plain ASCII; trailing NULs and whitespace are
//! ignored so fixed-size padded buffers parse too.

use crate::config::{FecRatio, HandshakeConfig};
use crate::decoder::{decode_packet_from_bytes, is_conduit_packet};
use crate::error::ConduitError;
use crate::transport::Transport;
use crate::types::Packet;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Largest handshake message accepted
pub const MAX_HANDSHAKE_SIZE: usize = 256;

/// Stream parameters chosen by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Capture frame rate
    pub fps: u32,
    /// Target bitrate in kbit/s
    pub bitrate: u32,
    /// Redundancy ratio numerator
    pub fec_numerator: u8,
    /// Redundancy ratio denominator
    pub fec_denominator: u8,
}

impl StreamConfig {
    /// Negotiated redundancy ratio
    pub fn fec_ratio(&self) -> Result<FecRatio, ConduitError> {
        FecRatio::new(self.fec_numerator, self.fec_denominator)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            fps: 30,
            bitrate: 400,
            fec_numerator: 6,
            fec_denominator: 5,
        }
    }
}

/// One handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Sender asks for the stream configuration
    Initiate,
    /// Receiver's stream configuration
    Configuration(StreamConfig),
    /// Sender acknowledges the configuration
    Confirmed,
}

impl HandshakeMessage {
    /// Encode as an ASCII message
    pub fn encode(&self) -> String {
        match self {
            HandshakeMessage::Initiate => "initiate".to_string(),
            HandshakeMessage::Confirmed => "confirmed".to_string(),
            HandshakeMessage::Configuration(c) => format!(
                "configuration {} {} {} {} {} {}",
                c.width, c.height, c.fps, c.bitrate, c.fec_numerator, c.fec_denominator
            ),
        }
    }

    /// Parse a received message
    pub fn parse(data: &[u8]) -> Result<Self, ConduitError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ConduitError::Malformed("handshake message is not ASCII".to_string()))?
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace());

        let mut tokens = text.split_whitespace();
        match tokens.next() {
            Some("initiate") => Ok(HandshakeMessage::Initiate),
            Some("confirmed") => Ok(HandshakeMessage::Confirmed),
            Some("configuration") => {
                let mut field = |name: &str| -> Result<u32, ConduitError> {
                    tokens
                        .next()
                        .ok_or_else(|| ConduitError::Malformed(format!("configuration missing {}", name)))?
                        .parse::<u32>()
                        .map_err(|_| ConduitError::Malformed(format!("configuration {} is not a number", name)))
                };

                let width = field("width")?;
                let height = field("height")?;
                let fps = field("fps")?;
                let bitrate = field("bitrate")?;
                let numerator = field("fec numerator")?;
                let denominator = field("fec denominator")?;

                let config = StreamConfig {
                    width,
                    height,
                    fps,
                    bitrate,
                    fec_numerator: u8::try_from(numerator)
                        .map_err(|_| ConduitError::Malformed(format!("fec numerator {}", numerator)))?,
                    fec_denominator: u8::try_from(denominator)
                        .map_err(|_| ConduitError::Malformed(format!("fec denominator {}", denominator)))?,
                };
                config.fec_ratio()?;
                Ok(HandshakeMessage::Configuration(config))
            }
            _ => Err(ConduitError::Malformed(format!(
                "unknown handshake message {:?}",
                text.chars().take(32).collect::<String>()
            ))),
        }
    }
}

/// Sender side: obtain the receiver's stream configuration
///
/// Sends `initiate` every `retry_interval` until a `configuration` arrives,
/// then sends `confirmed` `confirm_repeats` times. Anything else received in
/// the meantime is ignored.
pub fn initiate<T: Transport + ?Sized>(
    transport: &T,
    config: &HandshakeConfig,
) -> Result<StreamConfig, ConduitError> {
    let started = Instant::now();
    let initiate = HandshakeMessage::Initiate.encode();
    let mut buf = [0u8; MAX_HANDSHAKE_SIZE];
    let mut attempts = 0u32;

    let stream = loop {
        if started.elapsed() >= config.timeout() {
            #[cfg(feature = "logging")]
            warn!("No configuration after {} initiate attempts", attempts);
            return Err(ConduitError::HandshakeTimeout(config.timeout_ms));
        }

        transport.send(initiate.as_bytes())?;
        attempts += 1;

        if let Some(n) = transport.recv_timeout(&mut buf, config.retry_interval())? {
            match HandshakeMessage::parse(&buf[..n]) {
                Ok(HandshakeMessage::Configuration(stream)) => break stream,
                Ok(_other) => {
                    #[cfg(feature = "logging")]
                    debug!("Ignoring handshake message {:?}", _other);
                }
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    debug!("Ignoring datagram during handshake: {}", _e);
                }
            }
        }
    };

    let confirmed = HandshakeMessage::Confirmed.encode();
    for i in 0..config.confirm_repeats {
        if i > 0 {
            std::thread::sleep(config.confirm_interval());
        }
        transport.send(confirmed.as_bytes())?;
    }

    #[cfg(feature = "logging")]
    debug!(
        "Handshake complete after {} attempts: {}x{} {}fps {}kbps {}/{} FEC",
        attempts,
        stream.width,
        stream.height,
        stream.fps,
        stream.bitrate,
        stream.fec_numerator,
        stream.fec_denominator
    );

    Ok(stream)
}

/// Receiver side: answer `initiate` with `stream` until the sender confirms
///
/// The first conduit packet also ends the handshake, since every
/// `confirmed` may have been lost; it is returned so the caller can feed it
/// to reassembly.
pub fn accept<T: Transport + ?Sized>(
    transport: &T,
    stream: &StreamConfig,
    config: &HandshakeConfig,
) -> Result<Option<Packet>, ConduitError> {
    let started = Instant::now();
    let reply = HandshakeMessage::Configuration(*stream).encode();
    let mut buf = vec![0u8; 1 << 16];

    loop {
        let elapsed = started.elapsed();
        if elapsed >= config.timeout() {
            return Err(ConduitError::HandshakeTimeout(config.timeout_ms));
        }

        let Some(n) = transport.recv_timeout(&mut buf, config.timeout() - elapsed)? else {
            continue;
        };
        let datagram = &buf[..n];

        if is_conduit_packet(datagram) {
            match decode_packet_from_bytes(datagram) {
                Ok(packet) => {
                    #[cfg(feature = "logging")]
                    debug!("Handshake ended by data packet {}", packet.sequence());
                    return Ok(Some(packet));
                }
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    warn!("Dropping malformed packet during handshake: {}", _e);
                    continue;
                }
            }
        }

        match HandshakeMessage::parse(datagram) {
            Ok(HandshakeMessage::Initiate) => transport.send(reply.as_bytes())?,
            Ok(HandshakeMessage::Confirmed) => {
                #[cfg(feature = "logging")]
                debug!("Handshake confirmed");
                return Ok(None);
            }
            Ok(HandshakeMessage::Configuration(_)) | Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryLink;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted replies, recording everything sent
    struct Scripted {
        replies: Mutex<VecDeque<Option<Vec<u8>>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Option<&[u8]>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(|r| r.map(<[u8]>::to_vec)).collect()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .collect()
        }
    }

    impl Transport for Scripted {
        fn send(&self, data: &[u8]) -> Result<(), ConduitError> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn recv_timeout(&self, buf: &mut [u8], _timeout: Duration) -> Result<Option<usize>, ConduitError> {
            match self.replies.lock().unwrap().pop_front().flatten() {
                Some(reply) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok(Some(reply.len()))
                }
                None => Ok(None),
            }
        }
    }

    fn fast() -> HandshakeConfig {
        HandshakeConfig {
            retry_interval_ms: 1,
            timeout_ms: 1_000,
            confirm_repeats: 3,
            confirm_interval_ms: 0,
        }
    }

    #[test]
    fn test_initiate_retries_until_configuration() {
        let transport = Scripted::new(vec![None, None, Some(&b"configuration 640 480 30 400 6 5"[..])]);

        let stream = initiate(&transport, &fast()).unwrap();
        assert_eq!(stream.width, 640);
        assert_eq!(stream.height, 480);
        assert_eq!(stream.fec_numerator, 6);
        assert_eq!(stream.fec_denominator, 5);

        assert_eq!(
            transport.sent(),
            vec!["initiate", "initiate", "initiate", "confirmed", "confirmed", "confirmed"]
        );
    }

    #[test]
    fn test_parse_tolerates_padding() {
        let mut padded = b"configuration 1 2 3 4 2 1".to_vec();
        padded.extend_from_slice(&[0u8; 40]);
        assert!(matches!(
            HandshakeMessage::parse(&padded),
            Ok(HandshakeMessage::Configuration(StreamConfig { width: 1, .. }))
        ));
        assert_eq!(
            HandshakeMessage::parse(b"initiate call\0\0\0").unwrap(),
            HandshakeMessage::Initiate
        );
        assert_eq!(HandshakeMessage::parse(b"confirmed\n").unwrap(), HandshakeMessage::Confirmed);
    }

    #[test]
    fn test_parse_rejects_bad_configuration() {
        assert!(HandshakeMessage::parse(b"configuration 640 480 30").is_err());
        assert!(HandshakeMessage::parse(b"configuration 640 480 30 400 5 6").is_err());
        assert!(HandshakeMessage::parse(b"configuration a b c d e f").is_err());
        assert!(HandshakeMessage::parse(b"hello").is_err());
        assert!(HandshakeMessage::parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_initiate_times_out() {
        let (sender, _receiver) = MemoryLink::pair();
        let config = HandshakeConfig {
            retry_interval_ms: 5,
            timeout_ms: 30,
            ..fast()
        };
        assert_eq!(
            initiate(&sender, &config),
            Err(ConduitError::HandshakeTimeout(30))
        );
    }

    #[test]
    fn test_accept_and_initiate_over_memory_link() {
        let (sender, receiver) = MemoryLink::pair();
        let stream = StreamConfig {
            width: 320,
            height: 240,
            ..StreamConfig::default()
        };

        let handle = std::thread::spawn(move || accept(&receiver, &stream, &fast()));
        let negotiated = initiate(&sender, &fast()).unwrap();
        assert_eq!(negotiated, stream);
        assert_eq!(handle.join().unwrap(), Ok(None));
    }
}
