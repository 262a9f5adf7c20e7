//! Forward Error Correction
//!
//! Redundancy is computed over *shards*. At the packet level a shard is the
//! fragment metadata followed by the payload (see [`fragment_shard`]), so a
//! rebuilt shard yields the lost packet's header fields and its exact length,
//! not just zero-padded payload bytes.
//!
//! Two codecs implement [`RedundancyEncoder`] and [`RedundancyDecoder`]:
//! - [`XorCodec`]: single parity. Any one missing data shard per group can be
//!   rebuilt; extra parity shards are repetitions that only guard against the
//!   parity itself being lost.
//! - `RsCodec` (feature `fec-rs`): Reed-Solomon erasure code. Up to
//!   `redundancy` missing shards per group can be rebuilt.

use crate::constants::{FrameType, PacketFlags, PacketType, PARITY_OVERHEAD};
use crate::error::ConduitError;
use crate::types::{Packet, PacketHeader};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Serialized size of [`FragmentMeta`]
pub const FRAGMENT_META_SIZE: usize = 13;

/// Trait for producing redundancy shards
pub trait RedundancyEncoder {
    /// Encode a group of data shards into `redundancy` parity shards
    ///
    /// Shards may differ in length; shorter ones are treated as zero-padded
    /// to the longest. Every returned parity shard has the longest length.
    fn encode_batch(&self, shards: &[Bytes], redundancy: usize) -> Result<Vec<Bytes>, ConduitError>;
}

/// Trait for rebuilding lost data shards
pub trait RedundancyDecoder {
    /// Rebuild missing data shards in place
    ///
    /// `shards[..data_shards]` are the data shards and the rest are parity
    /// shards in emission order; `None` marks a lost shard. Rebuilt data
    /// shards carry the parity length (trailing zero padding included).
    fn decode_batch(
        &self,
        shards: &mut [Option<Bytes>],
        data_shards: usize,
    ) -> Result<(), ConduitError>;

    /// Check if the available shards are enough to rebuild every data shard
    fn can_reconstruct(&self, shards: &[Option<Bytes>], data_shards: usize) -> bool;
}

/// XOR `src` into `acc`, eight bytes per lane with a bytewise tail
pub fn xor_into(acc: &mut [u8], src: &[u8]) {
    let n = src.len().min(acc.len());
    let mut acc_lanes = acc[..n].chunks_exact_mut(8);
    let mut src_lanes = src[..n].chunks_exact(8);

    for (a, s) in (&mut acc_lanes).zip(&mut src_lanes) {
        let x = u64::from_ne_bytes(lane(a)) ^ u64::from_ne_bytes(lane(s));
        a.copy_from_slice(&x.to_ne_bytes());
    }

    for (a, s) in acc_lanes
        .into_remainder()
        .iter_mut()
        .zip(src_lanes.remainder())
    {
        *a ^= s;
    }
}

fn lane(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

/// XOR a set of shards together, zero-padding to the longest
pub fn xor_shards<S: AsRef<[u8]>>(shards: &[S]) -> BytesMut {
    let max_len = shards.iter().map(|s| s.as_ref().len()).max().unwrap_or(0);
    let mut out = BytesMut::zeroed(max_len);
    for shard in shards {
        xor_into(&mut out, shard.as_ref());
    }
    out
}

/// Single-parity XOR codec
#[derive(Debug, Clone, Copy, Default)]
pub struct XorCodec;

impl RedundancyEncoder for XorCodec {
    fn encode_batch(&self, shards: &[Bytes], redundancy: usize) -> Result<Vec<Bytes>, ConduitError> {
        if shards.is_empty() {
            return Err(ConduitError::Fec("cannot protect an empty group".to_string()));
        }

        let parity = xor_shards(shards).freeze();
        Ok(vec![parity; redundancy])
    }
}

impl RedundancyDecoder for XorCodec {
    fn decode_batch(
        &self,
        shards: &mut [Option<Bytes>],
        data_shards: usize,
    ) -> Result<(), ConduitError> {
        let data_shards = data_shards.min(shards.len());
        let missing: Vec<usize> = (0..data_shards).filter(|&i| shards[i].is_none()).collect();

        match missing.as_slice() {
            [] => Ok(()),
            [lost] => {
                let parity = shards[data_shards..]
                    .iter()
                    .flatten()
                    .next()
                    .cloned()
                    .ok_or_else(|| ConduitError::Fec("no parity shard available".to_string()))?;

                let mut rebuilt = BytesMut::from(parity.as_ref());
                for shard in shards[..data_shards].iter().flatten() {
                    xor_into(&mut rebuilt, shard);
                }
                shards[*lost] = Some(rebuilt.freeze());
                Ok(())
            }
            _ => Err(ConduitError::Fec(format!(
                "XOR parity cannot rebuild {} missing shards",
                missing.len()
            ))),
        }
    }

    fn can_reconstruct(&self, shards: &[Option<Bytes>], data_shards: usize) -> bool {
        let data_shards = data_shards.min(shards.len());
        let missing = shards[..data_shards].iter().filter(|s| s.is_none()).count();
        let parity = shards[data_shards..].iter().any(Option::is_some);
        missing == 0 || (missing == 1 && parity)
    }
}

/// Reed-Solomon erasure codec over GF(2^8)
#[cfg(feature = "fec-rs")]
#[derive(Debug, Clone, Copy, Default)]
pub struct RsCodec;

#[cfg(feature = "fec-rs")]
impl RedundancyEncoder for RsCodec {
    fn encode_batch(&self, shards: &[Bytes], redundancy: usize) -> Result<Vec<Bytes>, ConduitError> {
        use reed_solomon_erasure::galois_8::ReedSolomon;

        if shards.is_empty() {
            return Err(ConduitError::Fec("cannot protect an empty group".to_string()));
        }
        if redundancy == 0 {
            return Ok(Vec::new());
        }

        let len = shards.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut work: Vec<Vec<u8>> = shards
            .iter()
            .map(|s| {
                let mut v = s.to_vec();
                v.resize(len, 0);
                v
            })
            .collect();
        work.extend((0..redundancy).map(|_| vec![0u8; len]));

        let rs = ReedSolomon::new(shards.len(), redundancy)
            .map_err(|e| ConduitError::Fec(format!("{:?}", e)))?;
        rs.encode(&mut work)
            .map_err(|e| ConduitError::Fec(format!("{:?}", e)))?;

        Ok(work.into_iter().skip(shards.len()).map(Bytes::from).collect())
    }
}

#[cfg(feature = "fec-rs")]
impl RedundancyDecoder for RsCodec {
    fn decode_batch(
        &self,
        shards: &mut [Option<Bytes>],
        data_shards: usize,
    ) -> Result<(), ConduitError> {
        use reed_solomon_erasure::galois_8::ReedSolomon;

        if shards[..data_shards.min(shards.len())].iter().all(Option::is_some) {
            return Ok(());
        }
        if !self.can_reconstruct(shards, data_shards) {
            return Err(ConduitError::Fec("not enough shards to reconstruct".to_string()));
        }

        let len = shards.iter().flatten().map(|s| s.len()).max().unwrap_or(0);
        let mut work: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|s| {
                s.as_ref().map(|b| {
                    let mut v = b.to_vec();
                    v.resize(len, 0);
                    v
                })
            })
            .collect();

        let rs = ReedSolomon::new(data_shards, shards.len() - data_shards)
            .map_err(|e| ConduitError::Fec(format!("{:?}", e)))?;
        rs.reconstruct_data(&mut work)
            .map_err(|e| ConduitError::Fec(format!("{:?}", e)))?;

        for (slot, rebuilt) in shards.iter_mut().zip(work).take(data_shards) {
            if slot.is_none() {
                *slot = rebuilt.map(Bytes::from);
            }
        }
        Ok(())
    }

    fn can_reconstruct(&self, shards: &[Option<Bytes>], data_shards: usize) -> bool {
        shards.len() > data_shards && shards.iter().flatten().count() >= data_shards
    }
}

/// Redundancy scheme selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FecScheme {
    /// Single XOR parity per group
    #[default]
    Xor,
    /// Reed-Solomon erasure code (requires the `fec-rs` feature)
    ReedSolomon,
}

impl FecScheme {
    /// Instantiate the codec for this scheme
    pub fn codec(self) -> Result<Codec, ConduitError> {
        match self {
            FecScheme::Xor => Ok(Codec::Xor(XorCodec)),
            #[cfg(feature = "fec-rs")]
            FecScheme::ReedSolomon => Ok(Codec::ReedSolomon(RsCodec)),
            #[cfg(not(feature = "fec-rs"))]
            FecScheme::ReedSolomon => Err(ConduitError::InvalidParameter(
                "Reed-Solomon FEC requires the fec-rs feature".to_string(),
            )),
        }
    }

    /// Scheme used to produce a redundancy packet with these flags
    pub fn from_flags(flags: PacketFlags) -> Self {
        if flags.is_reed_solomon() {
            FecScheme::ReedSolomon
        } else {
            FecScheme::Xor
        }
    }
}

/// A concrete codec, dispatching to the scheme's implementation
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    /// Single XOR parity
    Xor(XorCodec),
    /// Reed-Solomon erasure code
    #[cfg(feature = "fec-rs")]
    ReedSolomon(RsCodec),
}

impl Codec {
    /// Scheme implemented by this codec
    pub fn scheme(&self) -> FecScheme {
        match self {
            Codec::Xor(_) => FecScheme::Xor,
            #[cfg(feature = "fec-rs")]
            Codec::ReedSolomon(_) => FecScheme::ReedSolomon,
        }
    }
}

impl RedundancyEncoder for Codec {
    fn encode_batch(&self, shards: &[Bytes], redundancy: usize) -> Result<Vec<Bytes>, ConduitError> {
        match self {
            Codec::Xor(c) => c.encode_batch(shards, redundancy),
            #[cfg(feature = "fec-rs")]
            Codec::ReedSolomon(c) => c.encode_batch(shards, redundancy),
        }
    }
}

impl RedundancyDecoder for Codec {
    fn decode_batch(
        &self,
        shards: &mut [Option<Bytes>],
        data_shards: usize,
    ) -> Result<(), ConduitError> {
        match self {
            Codec::Xor(c) => c.decode_batch(shards, data_shards),
            #[cfg(feature = "fec-rs")]
            Codec::ReedSolomon(c) => c.decode_batch(shards, data_shards),
        }
    }

    fn can_reconstruct(&self, shards: &[Option<Bytes>], data_shards: usize) -> bool {
        match self {
            Codec::Xor(c) => c.can_reconstruct(shards, data_shards),
            #[cfg(feature = "fec-rs")]
            Codec::ReedSolomon(c) => c.can_reconstruct(shards, data_shards),
        }
    }
}

/// Header fields of a data fragment that travel inside its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentMeta {
    /// Payload length
    pub len: u16,
    /// Fragment index within the datagram
    pub fragment_index: u16,
    /// Data fragments in the datagram
    pub k_fragments: u16,
    /// Datagram index
    pub datagram_index: u8,
    /// Packet flags
    pub flags: u8,
    /// Frame type code
    pub frame_type: u8,
    /// Capture timestamp
    pub timestamp: u32,
}

impl FragmentMeta {
    /// Capture the metadata of a data packet
    pub fn of(header: &PacketHeader) -> Self {
        Self {
            len: header.packet_size,
            fragment_index: header.fragment_index,
            k_fragments: header.k_fragments,
            datagram_index: header.datagram_index,
            flags: header.flags.as_u8(),
            frame_type: header.frame_type.as_u8(),
            timestamp: header.timestamp,
        }
    }

    /// Append the 13-byte big-endian form
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.len);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.k_fragments);
        buf.put_u8(self.datagram_index);
        buf.put_u8(self.flags);
        buf.put_u8(self.frame_type);
        buf.put_u32(self.timestamp);
    }

    /// Parse the 13-byte big-endian form
    pub fn read(mut data: &[u8]) -> Result<Self, ConduitError> {
        if data.len() < FRAGMENT_META_SIZE {
            return Err(ConduitError::IncompletePacket {
                expected: FRAGMENT_META_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            len: data.get_u16(),
            fragment_index: data.get_u16(),
            k_fragments: data.get_u16(),
            datagram_index: data.get_u8(),
            flags: data.get_u8(),
            frame_type: data.get_u8(),
            timestamp: data.get_u32(),
        })
    }
}

/// Shard protecting one data packet: its metadata followed by its payload
pub fn fragment_shard(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAGMENT_META_SIZE + packet.payload.len());
    FragmentMeta::of(&packet.header).write(&mut buf);
    buf.put_slice(&packet.payload);
    buf.freeze()
}

/// Payload of a redundancy packet: group base sequence followed by the parity shard
pub fn parity_payload(base_sequence: u16, shard: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + shard.len());
    buf.put_u16(base_sequence);
    buf.put_slice(shard);
    buf.freeze()
}

/// Split a redundancy payload into its base sequence and parity shard
pub fn split_parity_payload(payload: &Bytes) -> Result<(u16, Bytes), ConduitError> {
    if payload.len() < PARITY_OVERHEAD {
        return Err(ConduitError::IncompletePacket {
            expected: PARITY_OVERHEAD,
            actual: payload.len(),
        });
    }

    let base = u16::from_be_bytes([payload[0], payload[1]]);
    Ok((base, payload.slice(2..)))
}

/// Rebuild a data packet from a recovered shard
///
/// The recovered packet is tagged as data and takes `sequence`, the slot it
/// occupied in its group.
pub fn rebuild_packet(shard: &Bytes, sequence: u16) -> Result<Packet, ConduitError> {
    let meta = FragmentMeta::read(shard)?;
    let end = FRAGMENT_META_SIZE + meta.len as usize;
    if shard.len() < end {
        return Err(ConduitError::Fec(format!(
            "recovered shard of {} bytes shorter than declared length {}",
            shard.len(),
            meta.len
        )));
    }

    let frame_type = FrameType::from_u8(meta.frame_type)
        .ok_or_else(|| ConduitError::Fec(format!("recovered frame type {}", meta.frame_type)))?;

    let header = PacketHeader {
        packet_size: meta.len,
        k_fragments: meta.k_fragments,
        n_redundancy: 0,
        fragment_index: meta.fragment_index,
        datagram_index: meta.datagram_index,
        sequence,
        timestamp: meta.timestamp,
        frame_type,
        packet_type: PacketType::Data,
        flags: PacketFlags::new(meta.flags),
        redundant_count: 0,
    };
    header.validate()?;

    Ok(Packet::new(header, shard.slice(FRAGMENT_META_SIZE..end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::PacketBuilder;

    fn shards(count: usize, len: usize) -> Vec<Bytes> {
        (0..count)
            .map(|i| Bytes::from((0..len).map(|b| (b * 7 + i * 13) as u8).collect::<Vec<_>>()))
            .collect()
    }

    #[test]
    fn test_xor_into_handles_tail() {
        let mut acc = vec![0xffu8; 11];
        xor_into(&mut acc, &[0x0f; 11]);
        assert_eq!(acc, vec![0xf0; 11]);

        let mut acc = vec![0u8; 4];
        xor_into(&mut acc, &[1, 2]);
        assert_eq!(acc, vec![1, 2, 0, 0]);
    }

    #[test]
    fn test_xor_recovers_any_single_loss() {
        for k in 1..=16usize {
            for n in k..=16usize {
                let data = shards(k, 37);
                let parity = XorCodec.encode_batch(&data, n - k).unwrap();
                assert_eq!(parity.len(), n - k);
                if n == k {
                    continue;
                }

                for lost in 0..k {
                    let mut group: Vec<Option<Bytes>> =
                        data.iter().cloned().map(Some).chain(parity.iter().cloned().map(Some)).collect();
                    group[lost] = None;

                    assert!(XorCodec.can_reconstruct(&group, k));
                    XorCodec.decode_batch(&mut group, k).unwrap();
                    assert_eq!(group[lost].as_ref(), Some(&data[lost]));
                }
            }
        }
    }

    #[test]
    fn test_xor_rejects_double_loss() {
        let data = shards(4, 16);
        let parity = XorCodec.encode_batch(&data, 2).unwrap();
        let mut group: Vec<Option<Bytes>> =
            data.into_iter().map(Some).chain(parity.into_iter().map(Some)).collect();
        group[0] = None;
        group[3] = None;

        assert!(!XorCodec.can_reconstruct(&group, 4));
        assert!(XorCodec.decode_batch(&mut group, 4).is_err());
    }

    #[test]
    fn test_xor_empty_group_rejected() {
        assert!(XorCodec.encode_batch(&[], 1).is_err());
    }

    #[test]
    fn test_rebuild_packet_restores_exact_length() {
        let short = PacketBuilder::new(10)
            .payload(Bytes::from_static(b"tail"))
            .timestamp(77)
            .fragment(3, 2, 3)
            .mark_end_frame()
            .build_struct()
            .unwrap();
        let long = PacketBuilder::new(9)
            .payload(Bytes::from(vec![0xab; 40]))
            .timestamp(77)
            .fragment(3, 1, 3)
            .build_struct()
            .unwrap();

        let group = [fragment_shard(&long), fragment_shard(&short)];
        let parity = XorCodec.encode_batch(&group, 1).unwrap();
        let payload = parity_payload(9, &parity[0]);

        let (base, shard) = split_parity_payload(&payload).unwrap();
        assert_eq!(base, 9);

        let mut slots = vec![Some(group[0].clone()), None, Some(shard)];
        XorCodec.decode_batch(&mut slots, 2).unwrap();
        let rebuilt = rebuild_packet(slots[1].as_ref().unwrap(), 10).unwrap();

        assert_eq!(rebuilt.payload.as_ref(), b"tail");
        assert_eq!(rebuilt.header.fragment_index, 2);
        assert_eq!(rebuilt.header.timestamp, 77);
        assert!(rebuilt.header.flags.is_end_frame());
        assert_eq!(rebuilt.header.sequence, 10);
    }

    #[test]
    fn test_scheme_codec() {
        assert_eq!(FecScheme::Xor.codec().unwrap().scheme(), FecScheme::Xor);
        #[cfg(not(feature = "fec-rs"))]
        assert!(FecScheme::ReedSolomon.codec().is_err());
    }

    #[cfg(feature = "fec-rs")]
    #[test]
    fn test_rs_recovers_multiple_losses() {
        let data = shards(5, 64);
        let parity = RsCodec.encode_batch(&data, 3).unwrap();
        let mut group: Vec<Option<Bytes>> =
            data.iter().cloned().map(Some).chain(parity.into_iter().map(Some)).collect();
        group[0] = None;
        group[2] = None;
        group[6] = None;

        assert!(RsCodec.can_reconstruct(&group, 5));
        RsCodec.decode_batch(&mut group, 5).unwrap();
        assert_eq!(group[0].as_ref(), Some(&data[0]));
        assert_eq!(group[2].as_ref(), Some(&data[2]));
    }
}
