use anyhow::{bail, Context, Result};
use bytes::Bytes;
use conduit_core::{
    sender::spawn_capture,
    video::{PassthroughEncoder, VecSource},
    ConduitError, ConduitSender, EncodeFlags, EncodedFrame, FrameSource, RawImage,
    SessionConfig, UdpTransport, VideoEncoder,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Arguments of `conduit send`
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// File whose bytes are streamed as frames
    pub input: String,
    /// Receiver address
    pub peer: String,
    /// Local address feedback arrives on
    pub bind: String,
    /// Bytes per synthetic frame
    pub chunk: usize,
    /// Frame width reported to the encoder
    pub width: u32,
    /// Frame height reported to the encoder
    pub height: u32,
    /// Frames per second; 0 releases frames as fast as the channel takes them
    pub fps: u32,
    /// How long to keep serving feedback after the last packet
    pub linger_ms: u64,
    /// Show a progress bar
    pub progress: bool,
}

/// Releases frames at a fixed rate, like a camera would
struct PacedSource<S> {
    inner: S,
    interval: Duration,
    next_due: Option<Instant>,
}

impl<S: FrameSource> FrameSource for PacedSource<S> {
    fn next_frame(&mut self) -> Option<RawImage> {
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);
        self.inner.next_frame()
    }
}

/// Encoder wrapper that ticks a progress bar per frame
struct Tracked<E> {
    inner: E,
    bar: ProgressBar,
}

impl<E: VideoEncoder> VideoEncoder for Tracked<E> {
    fn encode(&mut self, image: &RawImage, flags: EncodeFlags) -> Result<Vec<EncodedFrame>, ConduitError> {
        let frames = self.inner.encode(image, flags)?;
        self.bar.inc(1);
        Ok(frames)
    }
}

pub fn execute(config: SessionConfig, opts: &SendOptions) -> Result<()> {
    if opts.chunk == 0 {
        bail!("chunk size must be non-zero");
    }

    let data = fs::read(&opts.input)
        .with_context(|| format!("Failed to read input file: {}", opts.input))?;
    info!("Sending {} ({} bytes) to {}", opts.input, data.len(), opts.peer);

    let transport = UdpTransport::connect(opts.peer.as_str(), opts.bind.as_str())
        .with_context(|| format!("Failed to open UDP transport to {}", opts.peer))?;
    let mut sender = ConduitSender::connect(Arc::new(transport), config.clone())
        .with_context(|| "Handshake with receiver failed")?;

    let stream = *sender.session().stream();
    info!(
        "Receiver asked for {}x{} at {}fps, FEC {}:{}",
        stream.width, stream.height, stream.fps, stream.fec_numerator, stream.fec_denominator
    );

    let source = VecSource::chunked(Bytes::from(data), opts.chunk, opts.width, opts.height);
    let total = source.remaining() as u64;
    let interval = match opts.fps {
        0 => Duration::ZERO,
        fps => Duration::from_secs(1) / fps,
    };
    let paced = PacedSource {
        inner: source,
        interval,
        next_due: None,
    };
    let (frames, capture) = spawn_capture(paced, config.frame_channel_depth);

    let bar = if opts.progress {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} frames")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    } else {
        ProgressBar::hidden()
    };
    let mut encoder = Tracked {
        inner: PassthroughEncoder,
        bar: bar.clone(),
    };

    let stats = sender
        .run(&mut encoder, frames, Duration::from_millis(opts.linger_ms))
        .with_context(|| "Send loop failed")?;
    bar.finish_and_clear();

    let dropped = capture
        .join()
        .map_err(|_| anyhow::anyhow!("capture thread panicked"))?;
    info!("Capture dropped {} of {} frames", dropped, total);

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
