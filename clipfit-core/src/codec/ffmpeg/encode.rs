use std::collections::HashMap;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::{Dictionary, Packet, codec};

use super::{MICROS, codec_id, init, needs_input, threading, to_av_frame};
use crate::codec::{BitrateMode, CodecError, CodecResult, EncoderConfig, EncoderSupport, VideoEncoder};
use crate::media::codec_string::CodecFamily;
use crate::media::{ChunkKind, CodecString, EncodedChunk, VideoFrame};

/// Seconds between forced keyframes.
const KEYFRAME_SECONDS: f64 = 2.0;

/// libavcodec encoder fed packed I420 frames.
///
/// B-frames are disabled so chunks leave the encoder in presentation order
/// and the muxer can use presentation timestamps as decode timestamps.
pub struct FfmpegEncoder {
    threads: usize,
    encoder: Option<ffmpeg::encoder::video::Encoder>,
    width: u32,
    height: u32,
    /// Configuration record, attached to the first chunk only.
    decoder_config: Option<Bytes>,
    durations: HashMap<i64, u64>,
}

impl FfmpegEncoder {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            encoder: None,
            width: 0,
            height: 0,
            decoder_config: None,
            durations: HashMap::new(),
        }
    }

    fn receive_chunks(&mut self) -> CodecResult<Vec<EncodedChunk>> {
        let encoder = self.encoder.as_mut().ok_or(CodecError::NotConfigured)?;
        let mut chunks = Vec::new();
        loop {
            let mut packet = Packet::empty();
            match encoder.receive_packet(&mut packet) {
                Ok(()) => {}
                Err(e) if needs_input(&e) => break,
                Err(e) => {
                    return Err(CodecError::EncodeFailed {
                        reason: e.to_string(),
                    });
                }
            }

            let timestamp_us = packet.pts().unwrap_or(0);
            let duration_us = self
                .durations
                .remove(&timestamp_us)
                .unwrap_or_else(|| u64::try_from(packet.duration()).unwrap_or(0));
            chunks.push(EncodedChunk {
                kind: ChunkKind::from_random_access(packet.is_key()),
                timestamp_us,
                duration_us,
                data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                decoder_config: self.decoder_config.take(),
            });
        }
        Ok(chunks)
    }
}

/// Preferred libav encoder names per family, best first.
fn encoder_names(family: CodecFamily) -> &'static [&'static str] {
    match family {
        CodecFamily::Avc => &["libx264"],
        CodecFamily::Hevc => &["libx265"],
        CodecFamily::Vp8 => &["libvpx"],
        CodecFamily::Vp9 => &["libvpx-vp9"],
        CodecFamily::Av1 => &["libsvtav1", "libaom-av1"],
    }
}

fn find_encoder(codec: &CodecString) -> Option<ffmpeg::Codec> {
    encoder_names(codec.family())
        .iter()
        .find_map(|name| ffmpeg::encoder::find_by_name(name))
        .or_else(|| ffmpeg::encoder::find(codec_id(codec.family())))
}

fn encoder_options(codec: &CodecString, config: &EncoderConfig) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    match codec {
        CodecString::Avc { .. } => {
            options.set("preset", "medium");
            if let Some(profile) = codec.avc_profile_name() {
                options.set("profile", profile);
            }
            if let Some(level) = codec.avc_level() {
                options.set("level", &level);
            }
        }
        CodecString::Vp9 { profile, .. } => {
            options.set("profile", &profile.to_string());
            options.set("deadline", "good");
            options.set("cpu-used", "4");
            options.set("row-mt", "1");
        }
        _ => {}
    }

    if config.bitrate_mode == BitrateMode::Constant {
        let rate = config.bitrate.to_string();
        options.set("minrate", &rate);
        options.set("maxrate", &rate);
        options.set("bufsize", &rate);
        if codec.family() == CodecFamily::Avc {
            options.set("x264-params", "nal-hrd=cbr");
        }
    }
    options
}

fn encoder_extradata(encoder: &ffmpeg::encoder::video::Encoder) -> Option<Bytes> {
    // SAFETY: extradata is owned by the open context and sized by extradata_size.
    unsafe {
        let raw = encoder.as_ptr();
        if (*raw).extradata.is_null() || (*raw).extradata_size <= 0 {
            return None;
        }
        let body = std::slice::from_raw_parts((*raw).extradata, (*raw).extradata_size as usize);
        Some(Bytes::copy_from_slice(body))
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> CodecResult<()> {
        init()?;
        let parsed: CodecString = config.codec.parse()?;
        let codec = find_encoder(&parsed).ok_or_else(|| CodecError::UnsupportedCodec {
            codec: config.codec.clone(),
        })?;
        if config.width == 0 || config.height == 0 {
            return Err(CodecError::InvalidConfig {
                reason: format!("output size {}x{}", config.width, config.height),
            });
        }

        let mut context = codec::context::Context::new_with_codec(codec);
        context.set_threading(threading(self.threads));
        context.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut setup = context
            .encoder()
            .video()
            .map_err(|e| CodecError::InvalidConfig {
                reason: e.to_string(),
            })?;
        setup.set_width(config.width);
        setup.set_height(config.height);
        setup.set_format(Pixel::YUV420P);
        setup.set_time_base(MICROS);
        setup.set_frame_rate(Some(ffmpeg::Rational::from(config.framerate)));
        setup.set_bit_rate(config.bitrate as usize);
        if config.bitrate_mode == BitrateMode::Constant {
            setup.set_max_bit_rate(config.bitrate as usize);
        }
        setup.set_max_b_frames(0);
        setup.set_gop((config.framerate * KEYFRAME_SECONDS).round().max(1.0) as u32);

        let encoder = setup
            .open_with(encoder_options(&parsed, config))
            .map_err(|e| CodecError::InvalidConfig {
                reason: format!("{} rejected {}: {e}", codec.name(), config.codec),
            })?;

        tracing::debug!(
            "Opened {} for {} at {}x{}, {}bps {}",
            codec.name(),
            config.codec,
            config.width,
            config.height,
            config.bitrate,
            config.bitrate_mode
        );
        self.decoder_config = encoder_extradata(&encoder);
        self.encoder = Some(encoder);
        self.width = config.width;
        self.height = config.height;
        self.durations.clear();
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame) -> CodecResult<Vec<EncodedChunk>> {
        if !frame.has_dimensions(self.width, self.height) {
            return Err(CodecError::InvalidFrame {
                reason: format!(
                    "encoder expects {}x{}, got {}x{}",
                    self.width,
                    self.height,
                    frame.width(),
                    frame.height()
                ),
            });
        }
        let encoder = self.encoder.as_mut().ok_or(CodecError::NotConfigured)?;
        let mut picture = to_av_frame(&frame);
        picture.set_pts(Some(frame.timestamp_us));
        self.durations.insert(frame.timestamp_us, frame.duration_us);

        encoder
            .send_frame(&picture)
            .map_err(|e| CodecError::EncodeFailed {
                reason: format!("frame at {}us: {e}", frame.timestamp_us),
            })?;
        self.receive_chunks()
    }

    fn flush(&mut self) -> CodecResult<Vec<EncodedChunk>> {
        let encoder = self.encoder.as_mut().ok_or(CodecError::NotConfigured)?;
        encoder.send_eof().map_err(|e| CodecError::EncodeFailed {
            reason: e.to_string(),
        })?;
        self.receive_chunks()
    }
}

/// Probes support by opening a throwaway encoder with the candidate.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegSupport {
    threads: usize,
}

impl FfmpegSupport {
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }
}

impl EncoderSupport for FfmpegSupport {
    fn probe_support(&self, config: &EncoderConfig) -> CodecResult<bool> {
        match FfmpegEncoder::new(self.threads).configure(config) {
            Ok(()) => Ok(true),
            Err(CodecError::UnsupportedCodec { .. } | CodecError::InvalidConfig { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
