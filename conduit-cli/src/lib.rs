//! Library entry for conduit-cli used by integration tests and embedding.

pub mod commands;

use anyhow::{bail, Context, Result};
use conduit_core::{fec::FecScheme, FecRatio, SessionConfig};
use std::fs;

// Re-export commands for convenience
pub use commands::*;

/// Redundancy codec selectable on the command line
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum FecSchemeArg {
    /// Single XOR parity per group
    Xor,
    /// Reed-Solomon (requires the fec-rs feature)
    ReedSolomon,
}

impl From<FecSchemeArg> for FecScheme {
    fn from(arg: FecSchemeArg) -> Self {
        match arg {
            FecSchemeArg::Xor => FecScheme::Xor,
            FecSchemeArg::ReedSolomon => FecScheme::ReedSolomon,
        }
    }
}

/// Parse a redundancy ratio written as `numerator:denominator`
pub fn parse_ratio(s: &str) -> Result<FecRatio> {
    let Some((num, den)) = s.split_once(':') else {
        bail!("expected NUM:DEN, got {:?}", s);
    };
    let num: u8 = num.trim().parse().with_context(|| format!("bad numerator in {:?}", s))?;
    let den: u8 = den.trim().parse().with_context(|| format!("bad denominator in {:?}", s))?;
    Ok(FecRatio::new(num, den)?)
}

/// Load a session configuration from a JSON file, or the defaults
///
/// Fields missing from the file keep their default values.
pub fn load_session_config(path: Option<&str>) -> Result<SessionConfig> {
    let config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?
        }
        None => SessionConfig::default(),
    };

    config
        .validate()
        .with_context(|| "Invalid session configuration")?;
    Ok(config)
}
