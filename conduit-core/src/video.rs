//! Interfaces to the capture and video encoder collaborators

use crate::error::ConduitError;
use crate::recovery::EncodeFlags;
use bytes::Bytes;

/// One captured, uncompressed frame
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data in the encoder's input format
    pub data: Bytes,
}

/// One compressed frame produced by the encoder
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// Compressed bitstream
    pub data: Bytes,
    /// The frame is decodable on its own
    pub is_key: bool,
}

/// Upstream video encoder
pub trait VideoEncoder: Send {
    /// Compress one image
    ///
    /// `flags` carries the recovery controls for this frame. An encoder may
    /// return zero or more frames.
    fn encode(&mut self, image: &RawImage, flags: EncodeFlags) -> Result<Vec<EncodedFrame>, ConduitError>;
}

/// Source of captured frames
///
/// Returning `None` ends the stream.
pub trait FrameSource: Send {
    /// Block until the next frame is captured
    fn next_frame(&mut self) -> Option<RawImage>;
}

/// Encoder that forwards image bytes unchanged
///
/// Frames are flagged as key frames when the caller forces one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl VideoEncoder for PassthroughEncoder {
    fn encode(&mut self, image: &RawImage, flags: EncodeFlags) -> Result<Vec<EncodedFrame>, ConduitError> {
        if image.data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![EncodedFrame {
            data: image.data.clone(),
            is_key: flags.contains(EncodeFlags::FORCE_KEY),
        }])
    }
}

/// Frame source over a fixed list of images
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    frames: std::collections::VecDeque<RawImage>,
}

impl VecSource {
    /// Serve `frames` in order
    pub fn new(frames: Vec<RawImage>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    /// Split `data` into frames of at most `chunk` bytes
    pub fn chunked(data: Bytes, chunk: usize, width: u32, height: u32) -> Self {
        let chunk = chunk.max(1);
        let frames = (0..data.len())
            .step_by(chunk)
            .map(|start| RawImage {
                width,
                height,
                data: data.slice(start..(start + chunk).min(data.len())),
            })
            .collect();
        Self { frames }
    }

    /// Frames not yet served
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Option<RawImage> {
        self.frames.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_marks_forced_key() {
        let image = RawImage {
            width: 2,
            height: 2,
            data: Bytes::from_static(b"pixels"),
        };
        let mut encoder = PassthroughEncoder;

        let frames = encoder
            .encode(&image, EncodeFlags::new(EncodeFlags::FORCE_KEY))
            .unwrap();
        assert!(frames[0].is_key);
        assert_eq!(frames[0].data, image.data);

        let frames = encoder.encode(&image, EncodeFlags::default()).unwrap();
        assert!(!frames[0].is_key);
    }

    #[test]
    fn test_chunked_source() {
        let mut source = VecSource::chunked(Bytes::from_static(b"abcdefg"), 3, 1, 1);
        assert_eq!(source.remaining(), 3);
        let sizes: Vec<usize> = std::iter::from_fn(|| source.next_frame())
            .map(|f| f.data.len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }
}
