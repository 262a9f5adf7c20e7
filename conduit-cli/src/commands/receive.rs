use anyhow::{Context, Result};
use conduit_core::{ConduitReceiver, Datagram, SessionConfig, StreamConfig, UdpTransport};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Arguments of `conduit receive`
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Local address packets arrive on
    pub listen: String,
    /// Sender address handshake replies and feedback go to
    pub peer: String,
    /// File the reassembled stream is written to
    pub output: String,
    /// Stream parameters offered to the sender
    pub stream: StreamConfig,
    /// Stop after this long without a packet
    pub idle_ms: u64,
}

/// Concatenate datagram payloads in capture order
pub fn assemble(mut datagrams: Vec<Datagram>) -> Vec<u8> {
    datagrams.sort_by_key(|d| d.timestamp);
    datagrams.dedup_by_key(|d| d.timestamp);
    datagrams
        .iter()
        .flat_map(|d| d.payload.iter().copied())
        .collect()
}

pub fn execute(config: SessionConfig, opts: &ReceiveOptions) -> Result<()> {
    let transport = UdpTransport::connect(opts.peer.as_str(), opts.listen.as_str())
        .with_context(|| format!("Failed to bind {}", opts.listen))?;
    info!(
        "Listening on {}, offering {}x{} at {}fps with FEC {}:{}",
        transport.local_addr()?,
        opts.stream.width,
        opts.stream.height,
        opts.stream.fps,
        opts.stream.fec_numerator,
        opts.stream.fec_denominator
    );

    let mut receiver = ConduitReceiver::new(Arc::new(transport), opts.stream, config)
        .with_context(|| "Invalid receiver configuration")?;
    let mut datagrams = receiver
        .accept()
        .with_context(|| "Handshake with sender failed")?;
    info!("Sender connected");

    let stats = receiver
        .run(Duration::from_millis(opts.idle_ms), |d| datagrams.push(d))
        .with_context(|| "Receive loop failed")?;

    if stats.datagrams_evicted > 0 {
        warn!("{} datagrams could not be completed", stats.datagrams_evicted);
    }

    let data = assemble(datagrams);
    fs::write(&opts.output, &data)
        .with_context(|| format!("Failed to write output file: {}", opts.output))?;
    info!("Wrote {} bytes to {}", data.len(), opts.output);

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
