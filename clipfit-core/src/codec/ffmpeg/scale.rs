use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame;

use super::{from_av_frame, to_av_frame};
use crate::codec::{CodecError, CodecResult, FrameScaler};
use crate::media::VideoFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    format: Pixel,
    source: (u32, u32),
    target: (u32, u32),
}

/// A swscale context remembered for the geometry it was built for.
pub(crate) struct SwsContext {
    inner: scaling::Context,
    geometry: Geometry,
}

// SAFETY: a context is created, used and dropped by the single stage thread
// that owns the adapter holding it.
unsafe impl Send for SwsContext {}

impl SwsContext {
    /// Returns the context in `slot`, rebuilding it when the geometry changed.
    pub(crate) fn cached(
        slot: &mut Option<SwsContext>,
        format: Pixel,
        source: (u32, u32),
        target: (u32, u32),
        flags: scaling::Flags,
    ) -> CodecResult<&mut SwsContext> {
        let geometry = Geometry {
            format,
            source,
            target,
        };
        if slot.as_ref().is_none_or(|context| context.geometry != geometry) {
            let inner = scaling::Context::get(
                format,
                source.0,
                source.1,
                Pixel::YUV420P,
                target.0,
                target.1,
                flags,
            )
            .map_err(|e| CodecError::ScaleFailed {
                reason: e.to_string(),
            })?;
            *slot = Some(SwsContext { inner, geometry });
        }
        slot.as_mut().ok_or_else(|| CodecError::ScaleFailed {
            reason: "scaler context missing".to_string(),
        })
    }

    pub(crate) fn run(&mut self, input: &frame::Video) -> CodecResult<frame::Video> {
        let mut output = frame::Video::empty();
        self.inner
            .run(input, &mut output)
            .map_err(|e| CodecError::ScaleFailed {
                reason: e.to_string(),
            })?;
        Ok(output)
    }
}

/// swscale resampler using Lanczos filtering.
#[derive(Default)]
pub struct FfmpegScaler {
    context: Option<SwsContext>,
}

impl FfmpegScaler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameScaler for FfmpegScaler {
    fn scale(&mut self, frame: &VideoFrame, width: u32, height: u32) -> CodecResult<VideoFrame> {
        if width == 0 || height == 0 {
            return Err(CodecError::ScaleFailed {
                reason: format!("cannot scale to {width}x{height}"),
            });
        }
        let context = SwsContext::cached(
            &mut self.context,
            Pixel::YUV420P,
            (frame.width(), frame.height()),
            (width, height),
            scaling::Flags::LANCZOS,
        )?;
        let scaled = context.run(&to_av_frame(frame))?;
        from_av_frame(&scaled, frame.timestamp_us, frame.duration_us)
    }
}
