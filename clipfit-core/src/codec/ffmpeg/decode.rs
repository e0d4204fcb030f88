use std::collections::HashMap;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame;
use ffmpeg::{Packet, codec};

use super::scale::SwsContext;
use super::{MICROS, codec_id, from_av_frame, init, install_extradata, needs_input, threading};
use crate::codec::{CodecError, CodecResult, DecoderConfig, VideoDecoder};
use crate::media::{ChunkKind, CodecString, DecodeUnit, VideoFrame};

/// libavcodec decoder producing packed I420 frames.
///
/// Non-YUV420P output (GIF palettes, 10-bit video) is converted with a
/// bilinear swscale pass at the decoded size.
pub struct FfmpegDecoder {
    threads: usize,
    decoder: Option<ffmpeg::decoder::Video>,
    converter: Option<SwsContext>,
    /// Unit durations by timestamp; libav does not carry them through reliably.
    durations: HashMap<i64, u64>,
}

impl FfmpegDecoder {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            decoder: None,
            converter: None,
            durations: HashMap::new(),
        }
    }

    fn receive_frames(&mut self) -> CodecResult<Vec<VideoFrame>> {
        let decoder = self.decoder.as_mut().ok_or(CodecError::NotConfigured)?;
        let mut frames = Vec::new();
        loop {
            let mut decoded = frame::Video::empty();
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {}
                Err(e) if needs_input(&e) => break,
                Err(e) => {
                    return Err(CodecError::DecodeFailed {
                        reason: e.to_string(),
                    });
                }
            }

            let timestamp_us = decoded.timestamp().or(decoded.pts()).unwrap_or(0);
            let duration_us = self.durations.remove(&timestamp_us).unwrap_or(0);
            let decoded = if decoded.format() == Pixel::YUV420P {
                decoded
            } else {
                let context = SwsContext::cached(
                    &mut self.converter,
                    decoded.format(),
                    (decoded.width(), decoded.height()),
                    (decoded.width(), decoded.height()),
                    scaling::Flags::BILINEAR,
                )?;
                context.run(&decoded)?
            };
            frames.push(from_av_frame(&decoded, timestamp_us, duration_us)?);
        }
        Ok(frames)
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> CodecResult<()> {
        init()?;
        let codec = match config.codec.parse::<CodecString>() {
            Ok(parsed) => ffmpeg::decoder::find(codec_id(parsed.family())),
            Err(_) => ffmpeg::decoder::find_by_name(&config.codec),
        }
        .ok_or_else(|| CodecError::UnsupportedCodec {
            codec: config.codec.clone(),
        })?;

        let mut context = codec::context::Context::new_with_codec(codec);
        // SAFETY: the context is freshly allocated and owns its extradata.
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).width = config.coded_width as i32;
            (*raw).height = config.coded_height as i32;
            (*raw).pkt_timebase = MICROS.into();
            if let Some(description) = &config.description {
                install_extradata(&mut (*raw).extradata, &mut (*raw).extradata_size, description)?;
            }
        }
        context.set_threading(threading(self.threads));

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| CodecError::InvalidConfig {
                reason: format!("{}: {e}", config.codec),
            })?;
        tracing::debug!(
            "Opened {} decoder for {} ({}x{})",
            codec.name(),
            config.codec,
            config.coded_width,
            config.coded_height
        );
        self.decoder = Some(decoder);
        Ok(())
    }

    fn decode(&mut self, unit: DecodeUnit) -> CodecResult<Vec<VideoFrame>> {
        let decoder = self.decoder.as_mut().ok_or(CodecError::NotConfigured)?;
        let mut packet = Packet::copy(&unit.data);
        packet.set_pts(Some(unit.timestamp_us));
        packet.set_duration(unit.duration_us as i64);
        if unit.kind == ChunkKind::Key {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        self.durations.insert(unit.timestamp_us, unit.duration_us);

        decoder
            .send_packet(&packet)
            .map_err(|e| CodecError::DecodeFailed {
                reason: format!("sample at {}us: {e}", unit.timestamp_us),
            })?;
        self.receive_frames()
    }

    fn flush(&mut self) -> CodecResult<Vec<VideoFrame>> {
        let decoder = self.decoder.as_mut().ok_or(CodecError::NotConfigured)?;
        decoder.send_eof().map_err(|e| CodecError::DecodeFailed {
            reason: e.to_string(),
        })?;
        let frames = self.receive_frames()?;
        self.durations.clear();
        Ok(frames)
    }
}
