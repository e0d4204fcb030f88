use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::util::mathematics::Rescale;

use super::{MICROS, init};
use crate::demux::{SampleSource, SourceError, SourceResult};
use crate::media::{CodecString, ContainerFormat, Sample, TrackMetadata, detect_container_format};

/// Sample source for any container libavformat can read, GIF included.
#[derive(Debug)]
pub struct FfmpegSampleSource {
    container: ContainerFormat,
    track: TrackMetadata,
    samples: Vec<Sample>,
}

impl FfmpegSampleSource {
    /// Demuxes the first video stream of a file.
    ///
    /// # Errors
    ///
    /// - `SourceError::Io` - File cannot be read
    /// - `SourceError::NoVideoTrack` - No video stream
    /// - `SourceError::Backend` - libavformat failed
    pub fn open(path: &Path) -> SourceResult<Self> {
        let mut header = [0u8; 64];
        let read = std::fs::File::open(path)
            .and_then(|mut file| file.read(&mut header))
            .map_err(|source| SourceError::Io {
                operation: format!("reading {}", path.display()),
                source,
            })?;
        let container = detect_container_format(&header[..read])?;
        Self::demux(path, container)
    }

    /// Demuxes in-memory input through a temporary file.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn from_bytes(data: &[u8]) -> SourceResult<Self> {
        let container = detect_container_format(&data[..data.len().min(64)])?;
        let io_error = |source| SourceError::Io {
            operation: "staging input".to_string(),
            source,
        };
        let mut staged = tempfile::NamedTempFile::new().map_err(io_error)?;
        staged.write_all(data).map_err(io_error)?;
        staged.flush().map_err(io_error)?;
        Self::demux(staged.path(), container)
    }

    fn demux(path: &Path, container: ContainerFormat) -> SourceResult<Self> {
        init().map_err(|e| SourceError::Backend {
            reason: e.to_string(),
        })?;
        let mut input = ffmpeg::format::input(path).map_err(backend)?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(SourceError::NoVideoTrack)?;
        let stream_index = stream.index();
        let stream_time_base = stream.time_base();
        let parameters = stream.parameters();
        let codec_id = parameters.id();
        let description = extradata(&parameters);
        let video = codec::context::Context::from_parameters(parameters)
            .and_then(|context| context.decoder().video())
            .map_err(backend)?;
        let (width, height) = (video.width(), video.height());

        // Keep native ticks when the stream time base is 1/N; otherwise
        // rescale everything to microseconds.
        let native = stream_time_base.numerator() == 1 && stream_time_base.denominator() > 0;
        let time_base = if native {
            stream_time_base.denominator() as u32
        } else {
            1_000_000
        };
        let to_ticks = |value: i64| {
            if native {
                value
            } else {
                value.rescale(stream_time_base, MICROS)
            }
        };
        let duration_ticks = u64::try_from(to_ticks(stream.duration()))
            .ok()
            .filter(|&ticks| ticks > 0);

        let mut samples = Vec::new();
        let mut next_timestamp = 0i64;
        for (stream, packet) in input.packets() {
            if stream.index() != stream_index {
                continue;
            }
            let Some(data) = packet.data() else {
                continue;
            };
            let timestamp = packet
                .pts()
                .or(packet.dts())
                .map(to_ticks)
                .unwrap_or(next_timestamp);
            let duration = u64::try_from(to_ticks(packet.duration())).unwrap_or(0);
            next_timestamp = timestamp.saturating_add(duration as i64);
            samples.push(Sample {
                data: Bytes::copy_from_slice(data),
                timestamp,
                duration,
                is_random_access: packet.is_key(),
            });
        }

        let codec = codec_string(codec_id, description.as_deref());
        tracing::debug!(
            "Demuxed {} {} samples ({}x{}, {}) from {}",
            samples.len(),
            codec,
            width,
            height,
            container,
            path.display()
        );

        Ok(Self {
            container,
            track: TrackMetadata {
                track_id: stream_index as u32,
                width,
                height,
                time_base,
                codec,
                description,
                duration_ticks,
            },
            samples,
        })
    }
}

impl SampleSource for FfmpegSampleSource {
    fn container(&self) -> ContainerFormat {
        self.container
    }

    fn track_metadata(&self) -> Option<&TrackMetadata> {
        Some(&self.track)
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// RFC 6381 string where the configuration record allows one, the libav
/// codec name otherwise.
fn codec_string(id: codec::Id, description: Option<&[u8]>) -> String {
    let derived = match (id, description) {
        (codec::Id::H264, Some(body)) => CodecString::from_avc_config(body),
        (codec::Id::HEVC, Some(body)) => CodecString::from_hevc_config(false, body),
        (codec::Id::AV1, Some(body)) => CodecString::from_av1_config(body),
        _ => None,
    };
    derived.map_or_else(|| id.name().to_string(), |codec| codec.to_string())
}

fn extradata(parameters: &codec::Parameters) -> Option<Bytes> {
    // SAFETY: libav keeps extradata/extradata_size consistent for the
    // lifetime of the parameters.
    unsafe {
        let raw = parameters.as_ptr();
        if (*raw).extradata.is_null() || (*raw).extradata_size <= 0 {
            return None;
        }
        let body = std::slice::from_raw_parts((*raw).extradata, (*raw).extradata_size as usize);
        Some(Bytes::copy_from_slice(body))
    }
}

fn backend(error: ffmpeg::Error) -> SourceError {
    SourceError::Backend {
        reason: error.to_string(),
    }
}
