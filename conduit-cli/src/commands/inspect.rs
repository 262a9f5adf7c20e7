use anyhow::{bail, Context, Result};
use colored::*;
use conduit_core::{
    constants::HEADER_SIZE,
    decoder::{decode_header, is_conduit_packet},
    fec::split_parity_payload,
    feedback::FEEDBACK_SIZE,
    handshake::HandshakeMessage,
    Feedback, FeedbackCommand, PacketHeader,
};
use bytes::Bytes;
use serde::Serialize;
use std::fs;

/// What a captured datagram turned out to be
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inspection {
    /// Conduit data or redundancy packet
    Packet {
        /// Decoded header
        header: PacketHeader,
        /// Payload bytes present after the header
        payload_len: usize,
        /// Group base sequence, for parity packets
        parity_base: Option<u16>,
    },
    /// Receiver feedback
    Feedback {
        /// `resend` or `recovery_query`
        command: String,
        /// Sequence the feedback refers to
        sequence: u16,
    },
    /// Handshake text message
    Handshake {
        /// Message as it would be sent
        message: String,
    },
}

/// Decode hex text, ignoring whitespace and an optional `0x` prefix
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.split_whitespace().collect();
    let cleaned = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    hex::decode(cleaned).with_context(|| "Input is not valid hex")
}

/// Classify and decode one datagram
pub fn describe(data: &[u8]) -> Result<Inspection> {
    if is_conduit_packet(data) {
        let header = decode_header(data).with_context(|| "Invalid packet header")?;
        let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..]);
        let parity_base = if header.is_parity() {
            split_parity_payload(&payload).ok().map(|(base, _)| base)
        } else {
            None
        };
        return Ok(Inspection::Packet {
            header,
            payload_len: payload.len(),
            parity_base,
        });
    }

    if data.len() == FEEDBACK_SIZE {
        if let Ok(feedback) = Feedback::parse(data) {
            let command = match feedback.command {
                FeedbackCommand::Resend => "resend",
                FeedbackCommand::RecoveryQuery => "recovery_query",
            };
            return Ok(Inspection::Feedback {
                command: command.to_string(),
                sequence: feedback.sequence,
            });
        }
    }

    match HandshakeMessage::parse(data) {
        Ok(message) => Ok(Inspection::Handshake {
            message: message.encode(),
        }),
        Err(_) => bail!("{} bytes are neither a packet, feedback nor a handshake message", data.len()),
    }
}

fn print_human(inspection: &Inspection) {
    match inspection {
        Inspection::Packet {
            header,
            payload_len,
            parity_base,
        } => {
            println!("\n=== Conduit Packet ===");
            println!("Sequence:          {}", header.sequence);
            println!("Timestamp:         {}", header.timestamp);
            println!("Frame type:        {:?}", header.frame_type);
            println!("Packet type:       {:?}", header.packet_type);
            println!(
                "Datagram:          {} (fragment {} of {}, {} redundancy)",
                header.datagram_index, header.fragment_index, header.k_fragments, header.n_redundancy
            );
            println!("Redundant count:   {}", header.redundant_count);
            println!(
                "Flags:             {:#04x}{}{}",
                header.flags.as_u8(),
                if header.flags.is_new_frame() { " new" } else { "" },
                if header.flags.is_end_frame() { " end" } else { "" }
            );
            if let Some(base) = parity_base {
                println!("Parity group base: {}", base);
            }

            let declared = header.packet_size as usize;
            if *payload_len == declared {
                println!("Payload:           {} bytes {}", payload_len, "✓".green());
            } else {
                println!(
                    "Payload:           {} of {} bytes {}",
                    payload_len,
                    declared,
                    "✗".red()
                );
            }
        }
        Inspection::Feedback { command, sequence } => {
            println!("{} feedback: {} {}", "✓".green(), command, sequence);
        }
        Inspection::Handshake { message } => {
            println!("{} handshake: {}", "✓".green(), message);
        }
    }
}

pub fn execute(hex_text: Option<&str>, input: Option<&str>, json: bool) -> Result<()> {
    let data = match (hex_text, input) {
        (Some(text), _) => parse_hex(text)?,
        (None, Some(path)) => {
            fs::read(path).with_context(|| format!("Failed to read input file: {}", path))?
        }
        (None, None) => bail!("pass a hex string or --input <file>"),
    };

    let inspection = describe(&data)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
    } else {
        print_human(&inspection);
    }
    Ok(())
}
