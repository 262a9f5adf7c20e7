use anyhow::Result;
use clap::{Parser, Subcommand};
use conduit_cli::{commands, load_session_config, parse_ratio, FecSchemeArg};
use conduit_core::{FecRatio, StreamConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit - loss-tolerant video datagrams over UDP", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Session configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Redundancy codec, overriding the configuration file
    #[arg(long, global = true, value_enum)]
    fec_scheme: Option<FecSchemeArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a file to a receiver as a sequence of frames
    Send {
        /// File to send
        #[arg(short, long)]
        input: String,

        /// Receiver address
        #[arg(short, long)]
        peer: String,

        /// Local address for feedback
        #[arg(long, default_value = "0.0.0.0:5001")]
        bind: String,

        /// Bytes per frame
        #[arg(long, default_value = "6000")]
        chunk: usize,

        /// Frame width
        #[arg(long, default_value = "800")]
        width: u32,

        /// Frame height
        #[arg(long, default_value = "600")]
        height: u32,

        /// Frame rate (0 = unpaced)
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Milliseconds to keep answering feedback after the last packet
        #[arg(long, default_value = "500")]
        linger_ms: u64,

        /// Show progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Receive a stream and write the reassembled bytes
    Receive {
        /// Local address packets arrive on
        #[arg(short, long, default_value = "0.0.0.0:5000")]
        listen: String,

        /// Sender address for handshake replies and feedback
        #[arg(short, long)]
        peer: String,

        /// Output file
        #[arg(short, long)]
        output: String,

        /// Frame width offered to the sender
        #[arg(long, default_value = "800")]
        width: u32,

        /// Frame height offered to the sender
        #[arg(long, default_value = "600")]
        height: u32,

        /// Frame rate offered to the sender
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Bitrate in kbit/s offered to the sender
        #[arg(long, default_value = "400")]
        bitrate: u32,

        /// Redundancy ratio NUM:DEN
        #[arg(long, default_value = "6:5", value_parser = ratio_arg)]
        fec: FecRatio,

        /// Stop after this many milliseconds without a packet
        #[arg(long, default_value = "2000")]
        idle_ms: u64,
    },

    /// Run sender and receiver in-process over a lossy link
    Simulate {
        /// Frames to send
        #[arg(long, default_value = "300")]
        frames: u32,

        /// Bytes per frame
        #[arg(long, default_value = "6000")]
        frame_size: usize,

        /// Loss probability per datagram, each direction
        #[arg(long, default_value = "0.02")]
        loss: f64,

        /// Random seed
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Redundancy ratio NUM:DEN
        #[arg(long, default_value = "6:5", value_parser = ratio_arg)]
        fec: FecRatio,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Decode a captured datagram
    Inspect {
        /// Datagram as hex
        hex: Option<String>,

        /// Read the raw datagram from a file instead
        #[arg(short, long)]
        input: Option<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn ratio_arg(s: &str) -> std::result::Result<FecRatio, String> {
    parse_ratio(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = load_session_config(cli.config.as_deref())?;
    if let Some(scheme) = cli.fec_scheme {
        config.fec_scheme = scheme.into();
        config.validate()?;
    }

    // Execute command
    match cli.command {
        Commands::Send {
            input,
            peer,
            bind,
            chunk,
            width,
            height,
            fps,
            linger_ms,
            progress,
        } => commands::send::execute(
            config,
            &commands::send::SendOptions {
                input,
                peer,
                bind,
                chunk,
                width,
                height,
                fps,
                linger_ms,
                progress,
            },
        ),

        Commands::Receive {
            listen,
            peer,
            output,
            width,
            height,
            fps,
            bitrate,
            fec,
            idle_ms,
        } => commands::receive::execute(
            config,
            &commands::receive::ReceiveOptions {
                listen,
                peer,
                output,
                stream: StreamConfig {
                    width,
                    height,
                    fps,
                    bitrate,
                    fec_numerator: fec.numerator,
                    fec_denominator: fec.denominator,
                },
                idle_ms,
            },
        ),

        Commands::Simulate {
            frames,
            frame_size,
            loss,
            seed,
            fec,
            output,
        } => commands::simulate::execute(
            config,
            &commands::simulate::SimulateOptions {
                frames,
                frame_size,
                loss,
                seed,
                ratio: fec,
            },
            output.as_deref(),
        ),

        Commands::Inspect { hex, input, json } => {
            commands::inspect::execute(hex.as_deref(), input.as_deref(), json)
        }
    }
}
