//! Sender pipeline
//!
//! Capture runs on its own thread and hands images to the send loop through a
//! bounded channel; when the channel is full the image is dropped rather than
//! stalling capture. A second thread reads feedback from the transport. The
//! send loop owns the [`ConduitSession`] and is the only place protocol state
//! changes: it waits for an image or feedback (bounded by the poll interval),
//! applies it, then flushes the packet store to the transport.

use crate::config::SessionConfig;
use crate::encoder::encode_packet_struct;
use crate::error::ConduitError;
use crate::feedback::Feedback;
use crate::handshake;
use crate::recovery::FeedbackAction;
use crate::session::{ConduitSession, SenderStats};
use crate::transport::Transport;
use crate::video::{FrameSource, RawImage, VideoEncoder};
use crossbeam_channel::{bounded, never, select, Receiver, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Largest datagram read from a transport
pub const MAX_DATAGRAM: usize = 1 << 16;

/// Spawn the capture thread
///
/// The returned handle yields the number of images dropped because the
/// channel was full. The channel disconnects when the source is exhausted.
pub fn spawn_capture<S: FrameSource + 'static>(
    mut source: S,
    depth: usize,
) -> (Receiver<RawImage>, JoinHandle<u64>) {
    let (tx, rx) = bounded(depth);

    let handle = thread::spawn(move || {
        let mut dropped = 0u64;
        while let Some(image) = source.next_frame() {
            match tx.try_send(image) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    #[cfg(feature = "logging")]
                    debug!("Send loop busy, dropped captured frame");
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        dropped
    });

    (rx, handle)
}

/// Spawn the feedback reader thread
///
/// Datagrams that do not parse as feedback (late handshake messages, noise)
/// are skipped. The thread exits once `stop` is set or the transport closes.
pub fn spawn_feedback_reader<T: Transport + ?Sized + 'static>(
    transport: Arc<T>,
    depth: usize,
    poll: Duration,
    stop: Arc<AtomicBool>,
) -> (Receiver<Feedback>, JoinHandle<()>) {
    let (tx, rx) = bounded(depth);

    let handle = thread::spawn(move || {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !stop.load(Ordering::Relaxed) {
            let n = match transport.recv_timeout(&mut buf, poll) {
                Ok(Some(n)) => n,
                Ok(None) => continue,
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    debug!("Feedback reader stopping: {}", _e);
                    break;
                }
            };

            match Feedback::parse(&buf[..n]) {
                Ok(feedback) => {
                    if let Err(TrySendError::Disconnected(_)) = tx.try_send(feedback) {
                        break;
                    }
                }
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    debug!("Ignoring non-feedback datagram: {}", _e);
                }
            }
        }
    });

    (rx, handle)
}

/// Send loop for one conduit
pub struct ConduitSender<T: Transport + ?Sized + 'static> {
    session: ConduitSession,
    transport: Arc<T>,
}

impl<T: Transport + ?Sized + 'static> ConduitSender<T> {
    /// Run the handshake and open the session with the receiver's parameters
    pub fn connect(transport: Arc<T>, config: SessionConfig) -> Result<Self, ConduitError> {
        config.validate()?;
        let stream = handshake::initiate(transport.as_ref(), &config.handshake)?;
        let session = ConduitSession::open(config, stream)?;
        Ok(Self { session, transport })
    }

    /// Wrap an already-opened session
    pub fn with_session(transport: Arc<T>, session: ConduitSession) -> Self {
        Self { session, transport }
    }

    /// Session state
    pub fn session(&self) -> &ConduitSession {
        &self.session
    }

    /// Session state (mutable)
    pub fn session_mut(&mut self) -> &mut ConduitSession {
        &mut self.session
    }

    /// Drive the conduit until `frames` disconnects and the queue drains
    ///
    /// After the last packet leaves, feedback keeps being served for
    /// `linger` so late losses can still be repaired.
    pub fn run<E: VideoEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        frames: Receiver<RawImage>,
        linger: Duration,
    ) -> Result<SenderStats, ConduitError> {
        let stop = Arc::new(AtomicBool::new(false));
        let config = self.session.config().clone();
        let (feedback, reader) = spawn_feedback_reader(
            Arc::clone(&self.transport),
            config.feedback_channel_depth,
            config.poll_interval(),
            Arc::clone(&stop),
        );

        let result = self.serve(encoder, frames, feedback, &config, linger);

        stop.store(true, Ordering::Relaxed);
        if reader.join().is_err() {
            #[cfg(feature = "logging")]
            warn!("Feedback reader panicked");
        }

        result.map(|()| self.session.stats().clone())
    }

    fn serve<E: VideoEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        frames: Receiver<RawImage>,
        feedback: Receiver<Feedback>,
        config: &SessionConfig,
        linger: Duration,
    ) -> Result<(), ConduitError> {
        let poll = config.poll_interval();
        let mut frames = frames;
        let mut feedback = feedback;
        let mut capture_done = false;
        let mut frames_closed = false;
        let mut feedback_done = false;
        let mut idle_since: Option<Instant> = None;

        loop {
            select! {
                recv(frames) -> msg => match msg {
                    Ok(image) => self.on_image(encoder, &image)?,
                    Err(_) => capture_done = true,
                },
                recv(feedback) -> msg => match msg {
                    Ok(fb) => self.on_feedback(fb)?,
                    Err(_) => feedback_done = true,
                },
                default(poll) => {},
            }

            // Disconnected receivers are always ready; park them
            if capture_done && !frames_closed {
                #[cfg(feature = "logging")]
                debug!("Capture finished");
                frames = never();
                frames_closed = true;
            }
            if feedback_done {
                feedback = never();
                feedback_done = false;
            }

            self.flush()?;

            if capture_done && self.session.queued() == 0 {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= linger {
                    return Ok(());
                }
            }
        }
    }

    fn on_image<E: VideoEncoder + ?Sized>(&mut self, encoder: &mut E, image: &RawImage) -> Result<(), ConduitError> {
        if !self.session.has_room() {
            self.session.record_dropped_frame();
            #[cfg(feature = "logging")]
            debug!(
                "{} packets still queued, dropping frame",
                self.session.queued()
            );
            return Ok(());
        }

        match self.session.encode_frame(encoder, image) {
            Ok(_) => Ok(()),
            Err(ConduitError::StoreFull { .. }) => {
                #[cfg(feature = "logging")]
                warn!(
                    "Packet store full ({} slots), frame lost",
                    self.session.packetizer().store().capacity()
                );
                self.session.record_dropped_frame();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn on_feedback(&mut self, feedback: Feedback) -> Result<(), ConduitError> {
        if let FeedbackAction::Retransmit(packet) = self.session.handle_feedback(feedback) {
            let bytes = encode_packet_struct(&packet)?;
            self.transport.send(&bytes)?;
        }
        Ok(())
    }

    /// Send every queued packet
    pub fn flush(&mut self) -> Result<usize, ConduitError> {
        let mut sent = 0;
        while let Some(packet) = self.session.next_packet() {
            let bytes = encode_packet_struct(&packet)?;
            self.transport.send(&bytes)?;
            sent += 1;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_packet_from_bytes;
    use crate::handshake::StreamConfig;
    use crate::transport::MemoryLink;
    use crate::video::{PassthroughEncoder, VecSource};
    use bytes::Bytes;

    #[test]
    fn test_capture_drops_when_channel_full() {
        let frames: Vec<RawImage> = (0..10)
            .map(|_| RawImage {
                width: 1,
                height: 1,
                data: Bytes::from_static(b"x"),
            })
            .collect();

        let (rx, handle) = spawn_capture(VecSource::new(frames), 2);
        let dropped = handle.join().unwrap();
        let delivered = std::iter::from_fn(|| rx.try_recv().ok()).count() as u64;

        assert_eq!(delivered, 2);
        assert_eq!(dropped + delivered, 10);
    }

    #[test]
    fn test_run_sends_all_packets_and_serves_feedback() {
        let (near, far) = MemoryLink::pair();
        let near = Arc::new(near);
        let config = SessionConfig {
            packet_size: 16,
            store_capacity: 256,
            max_queued_packets: 128,
            frame_channel_depth: 64,
            ..SessionConfig::default()
        };
        let session = ConduitSession::open(config, StreamConfig::default()).unwrap();
        let mut sender = ConduitSender::with_session(Arc::clone(&near), session);

        let source = VecSource::chunked(Bytes::from(vec![7u8; 200]), 50, 1, 1);
        let (frames, capture) = spawn_capture(source, 64);
        capture.join().unwrap();

        // Ask for sequence 0 again before the loop starts
        far.send(&Feedback::resend(0).encode()).unwrap();

        let stats = sender
            .run(&mut PassthroughEncoder, frames, Duration::from_millis(50))
            .unwrap();
        assert_eq!(stats.frames_encoded, 4);
        assert_eq!(stats.data_packets, 16);
        assert_eq!(stats.redundancy_packets, 3);

        let received: Vec<_> = std::iter::from_fn(|| far.try_recv())
            .map(|d| decode_packet_from_bytes(&d).unwrap())
            .collect();
        assert_eq!(received.len() as u64, stats.packets_sent + stats.retransmissions);
        assert!(received.iter().any(|p| p.header.frame_type == crate::constants::FrameType::Key));
    }
}
