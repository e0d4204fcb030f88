//! Media data model shared by every pipeline stage.
//!
//! Samples carry track time-base ticks as they come out of the container;
//! everything downstream of the decoder gate (decode units, frames, encoded
//! chunks) is timed in microseconds.

pub mod codec_string;
pub mod format;

use bytes::Bytes;

pub use codec_string::CodecString;
pub use format::{ContainerFormat, DetectionError, OutputFormat, detect_container_format};

use crate::codec::{CodecError, CodecResult};

/// Static description of the video track being transcoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub track_id: u32,
    pub width: u32,
    pub height: u32,
    /// Ticks per second
    pub time_base: u32,
    /// RFC 6381 codec string, e.g. `avc1.64001f`
    pub codec: String,
    /// Codec configuration record handed to the decoder (`avcC` body etc.)
    pub description: Option<Bytes>,
    pub duration_ticks: Option<u64>,
}

impl TrackMetadata {
    /// Declared duration in seconds, if the container states a positive one.
    pub fn declared_duration_seconds(&self) -> Option<f64> {
        match self.duration_ticks {
            Some(ticks) if ticks > 0 && self.time_base > 0 => {
                Some(ticks as f64 / f64::from(self.time_base))
            }
            _ => None,
        }
    }
}

/// One compressed access unit in track time-base ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Bytes,
    /// Presentation timestamp
    pub timestamp: i64,
    pub duration: u64,
    pub is_random_access: bool,
}

impl Sample {
    /// Presentation end of the sample in ticks.
    pub fn end(&self) -> i64 {
        self.timestamp
            .saturating_add(i64::try_from(self.duration).unwrap_or(i64::MAX))
    }
}

/// Converts a tick count to microseconds without intermediate overflow.
pub fn ticks_to_micros(ticks: i64, time_base: u32) -> i64 {
    if time_base == 0 {
        return 0;
    }
    let micros = i128::from(ticks) * 1_000_000 / i128::from(time_base);
    micros.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// Unsigned variant of [`ticks_to_micros`] for durations.
pub fn duration_ticks_to_micros(ticks: u64, time_base: u32) -> u64 {
    if time_base == 0 {
        return 0;
    }
    let micros = u128::from(ticks) * 1_000_000 / u128::from(time_base);
    micros.min(u128::from(u64::MAX)) as u64
}

/// Whether a compressed unit can be decoded on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Key,
    Delta,
}

impl ChunkKind {
    pub fn from_random_access(is_random_access: bool) -> Self {
        if is_random_access {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        }
    }
}

/// A sample converted for submission to a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeUnit {
    pub kind: ChunkKind,
    pub timestamp_us: i64,
    pub duration_us: u64,
    pub data: Bytes,
}

impl DecodeUnit {
    /// Converts a sample using the track time base.
    pub fn from_sample(sample: &Sample, time_base: u32) -> Self {
        Self {
            kind: ChunkKind::from_random_access(sample.is_random_access),
            timestamp_us: ticks_to_micros(sample.timestamp, time_base),
            duration_us: duration_ticks_to_micros(sample.duration, time_base),
            data: sample.data.clone(),
        }
    }
}

/// Plane of an I420 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Y,
    U,
    V,
}

/// Decoded picture in planar I420 layout, stored contiguously (Y, then U, then V).
///
/// Chroma planes are `ceil(width / 2)` by `ceil(height / 2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    pub timestamp_us: i64,
    pub duration_us: u64,
    data: Vec<u8>,
}

impl VideoFrame {
    /// Wraps an I420 buffer.
    ///
    /// # Errors
    ///
    /// - `CodecError::InvalidFrame` - Zero dimension or buffer length mismatch
    pub fn from_i420(
        width: u32,
        height: u32,
        timestamp_us: i64,
        duration_us: u64,
        data: Vec<u8>,
    ) -> CodecResult<Self> {
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidFrame {
                reason: format!("zero-sized frame {width}x{height}"),
            });
        }
        let expected = Self::i420_len(width, height);
        if data.len() != expected {
            return Err(CodecError::InvalidFrame {
                reason: format!(
                    "{width}x{height} frame needs {expected} bytes, got {}",
                    data.len()
                ),
            });
        }
        Ok(Self {
            width,
            height,
            timestamp_us,
            duration_us,
            data,
        })
    }

    /// Mid-grey frame, mostly useful for simulated decoders.
    ///
    /// Zero dimensions are raised to 1.
    pub fn blank(width: u32, height: u32, timestamp_us: i64, duration_us: u64) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let mut frame = Self {
            width,
            height,
            timestamp_us,
            duration_us,
            data: vec![0x80; Self::i420_len(width, height)],
        };
        frame.plane_mut(Plane::Y).fill(0x10);
        frame
    }

    /// Byte length of an I420 buffer with the given dimensions.
    pub fn i420_len(width: u32, height: u32) -> usize {
        let (cw, ch) = chroma_dims(width, height);
        (width as usize * height as usize) + 2 * (cw as usize * ch as usize)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_dimensions(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Width and height of a plane.
    pub fn plane_dims(&self, plane: Plane) -> (u32, u32) {
        match plane {
            Plane::Y => (self.width, self.height),
            Plane::U | Plane::V => chroma_dims(self.width, self.height),
        }
    }

    pub fn plane(&self, plane: Plane) -> &[u8] {
        let range = self.plane_range(plane);
        &self.data[range]
    }

    pub fn plane_mut(&mut self, plane: Plane) -> &mut [u8] {
        let range = self.plane_range(plane);
        &mut self.data[range]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn plane_range(&self, plane: Plane) -> std::ops::Range<usize> {
        let luma = self.width as usize * self.height as usize;
        let (cw, ch) = chroma_dims(self.width, self.height);
        let chroma = cw as usize * ch as usize;
        match plane {
            Plane::Y => 0..luma,
            Plane::U => luma..luma + chroma,
            Plane::V => luma + chroma..luma + 2 * chroma,
        }
    }
}

fn chroma_dims(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// Compressed output unit produced by an encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub kind: ChunkKind,
    pub timestamp_us: i64,
    pub duration_us: u64,
    pub data: Bytes,
    /// Decoder configuration record, present on the first chunk
    pub decoder_config: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_to_micros() {
        assert_eq!(ticks_to_micros(90_000, 90_000), 1_000_000);
        assert_eq!(ticks_to_micros(1, 3), 333_333);
        assert_eq!(ticks_to_micros(-512, 1_000), -512_000);
        assert_eq!(ticks_to_micros(i64::MAX, 1), i64::MAX);
        assert_eq!(duration_ticks_to_micros(512, 15_360), 33_333);
        assert_eq!(ticks_to_micros(10, 0), 0);
    }

    #[test]
    fn test_decode_unit_from_sample() {
        let sample = Sample {
            data: Bytes::from_static(&[1, 2, 3]),
            timestamp: 1_024,
            duration: 512,
            is_random_access: false,
        };
        let unit = DecodeUnit::from_sample(&sample, 15_360);
        assert_eq!(unit.kind, ChunkKind::Delta);
        assert_eq!(unit.timestamp_us, 66_666);
        assert_eq!(unit.duration_us, 33_333);
        assert_eq!(unit.data, sample.data);
    }

    #[test]
    fn test_frame_layout_odd_dimensions() {
        let frame = VideoFrame::blank(5, 3, 0, 0);
        assert_eq!(frame.plane_dims(Plane::U), (3, 2));
        assert_eq!(frame.plane(Plane::Y).len(), 15);
        assert_eq!(frame.plane(Plane::V).len(), 6);
        assert_eq!(frame.as_bytes().len(), VideoFrame::i420_len(5, 3));
        assert!(frame.plane(Plane::Y).iter().all(|&value| value == 0x10));
        assert!(frame.plane(Plane::U).iter().all(|&value| value == 0x80));
    }

    #[test]
    fn test_frame_rejects_wrong_length() {
        let result = VideoFrame::from_i420(4, 4, 0, 0, vec![0; 10]);
        assert!(matches!(result, Err(CodecError::InvalidFrame { .. })));
        assert!(VideoFrame::from_i420(0, 4, 0, 0, Vec::new()).is_err());
        assert!(VideoFrame::from_i420(4, 4, 0, 0, vec![0; 24]).is_ok());
    }

    #[test]
    fn test_declared_duration() {
        let mut track = TrackMetadata {
            track_id: 1,
            width: 640,
            height: 360,
            time_base: 1_000,
            codec: "avc1.64001f".to_string(),
            description: None,
            duration_ticks: Some(2_500),
        };
        assert_eq!(track.declared_duration_seconds(), Some(2.5));
        track.duration_ticks = Some(0);
        assert_eq!(track.declared_duration_seconds(), None);
    }
}
