//! FFmpeg-backed collaborators (`ffmpeg` feature).
//!
//! Each adapter owns its libav contexts and is driven from a single stage
//! thread. Frames cross the boundary as tightly packed I420 buffers; the
//! adapters copy plane rows in and out of libav's strided layout.

mod decode;
mod encode;
mod mux;
mod scale;
mod source;

use std::sync::OnceLock;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::util::frame;

pub use decode::FfmpegDecoder;
pub use encode::{FfmpegEncoder, FfmpegSupport};
pub use mux::FfmpegMuxSink;
pub use scale::FfmpegScaler;
pub use source::FfmpegSampleSource;

use super::{CodecError, CodecResult};
use crate::media::codec_string::CodecFamily;
use crate::media::{Plane, VideoFrame};

/// Internal time base of decode units, frames and chunks.
pub(crate) const MICROS: ffmpeg::Rational = ffmpeg::Rational(1, 1_000_000);

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initializes libav once per process.
///
/// # Errors
///
/// - `CodecError::Backend` - libav failed to initialize
pub fn init() -> CodecResult<()> {
    INIT.get_or_init(|| {
        ffmpeg::init().map_err(|e| e.to_string())?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        tracing::debug!("libav initialized");
        Ok(())
    })
    .clone()
    .map_err(|reason| CodecError::Backend { reason })
}

pub(crate) fn backend_error(operation: &str, error: ffmpeg::Error) -> CodecError {
    CodecError::Backend {
        reason: format!("{operation}: {error}"),
    }
}

pub(crate) fn codec_id(family: CodecFamily) -> ffmpeg::codec::Id {
    match family {
        CodecFamily::Avc => ffmpeg::codec::Id::H264,
        CodecFamily::Hevc => ffmpeg::codec::Id::HEVC,
        CodecFamily::Vp8 => ffmpeg::codec::Id::VP8,
        CodecFamily::Vp9 => ffmpeg::codec::Id::VP9,
        CodecFamily::Av1 => ffmpeg::codec::Id::AV1,
    }
}

/// Frame-and-slice threading with `count` workers, 0 meaning automatic.
pub(crate) fn threading(count: usize) -> ffmpeg::threading::Config {
    ffmpeg::threading::Config {
        kind: ffmpeg::threading::Type::Frame,
        count,
    }
}

/// Copies a codec configuration record into libav-owned, padded memory.
///
/// # Safety
///
/// `extradata` and `extradata_size` must point into a live codec context or
/// parameter set that takes ownership of the allocation.
pub(crate) unsafe fn install_extradata(
    extradata: &mut *mut u8,
    extradata_size: &mut std::os::raw::c_int,
    body: &[u8],
) -> CodecResult<()> {
    let padded = body.len() + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
    // SAFETY: av_mallocz returns zeroed memory of the requested size or null.
    let buffer = unsafe { ffmpeg::ffi::av_mallocz(padded) as *mut u8 };
    if buffer.is_null() {
        return Err(CodecError::Backend {
            reason: "extradata allocation failed".to_string(),
        });
    }
    // SAFETY: buffer holds at least body.len() bytes and does not overlap body.
    unsafe { std::ptr::copy_nonoverlapping(body.as_ptr(), buffer, body.len()) };
    *extradata = buffer;
    *extradata_size = body.len() as std::os::raw::c_int;
    Ok(())
}

/// Whether libav wants more input before it can produce output.
pub(crate) fn needs_input(error: &ffmpeg::Error) -> bool {
    matches!(error, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
        || matches!(error, ffmpeg::Error::Eof)
}

/// Copies a packed I420 frame into a freshly allocated libav frame.
pub(crate) fn to_av_frame(source: &VideoFrame) -> frame::Video {
    let mut target = frame::Video::new(Pixel::YUV420P, source.width(), source.height());
    for (index, plane) in [Plane::Y, Plane::U, Plane::V].into_iter().enumerate() {
        let (width, height) = source.plane_dims(plane);
        let stride = target.stride(index);
        let rows = source.plane(plane).chunks_exact(width as usize);
        let data = target.data_mut(index);
        for (row, line) in rows.take(height as usize).enumerate() {
            data[row * stride..row * stride + line.len()].copy_from_slice(line);
        }
    }
    target
}

/// Packs a YUV420P libav frame into a [`VideoFrame`].
///
/// # Errors
///
/// - `CodecError::InvalidFrame` - Frame is not YUV420P or has no pixels
pub(crate) fn from_av_frame(
    source: &frame::Video,
    timestamp_us: i64,
    duration_us: u64,
) -> CodecResult<VideoFrame> {
    if source.format() != Pixel::YUV420P {
        return Err(CodecError::InvalidFrame {
            reason: format!("expected yuv420p, got {:?}", source.format()),
        });
    }
    let (width, height) = (source.width(), source.height());
    let mut packed = Vec::with_capacity(VideoFrame::i420_len(width, height));
    for index in 0..3 {
        let (plane_width, plane_height) = if index == 0 {
            (width, height)
        } else {
            (width.div_ceil(2), height.div_ceil(2))
        };
        let stride = source.stride(index);
        let data = source.data(index);
        for row in 0..plane_height as usize {
            let start = row * stride;
            packed.extend_from_slice(&data[start..start + plane_width as usize]);
        }
    }
    VideoFrame::from_i420(width, height, timestamp_us, duration_us, packed)
}
