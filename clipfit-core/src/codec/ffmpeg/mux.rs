use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg::format::context::Output;
use ffmpeg::{Dictionary, Packet, Rational};
use tempfile::NamedTempFile;

use super::{MICROS, backend_error, codec_id, init, install_extradata};
use crate::codec::{ChunkSink, CodecError, CodecResult, EncoderConfig};
use crate::media::{ChunkKind, CodecString, EncodedChunk, OutputFormat};

const STREAM_INDEX: usize = 0;

struct OpenOutput {
    file: NamedTempFile,
    context: Output,
    stream_time_base: Rational,
    header_written: bool,
}

/// libavformat muxer writing MP4 (`faststart`) or WebM to a temporary file,
/// read back into memory on finalize.
///
/// The header is deferred to the first chunk so the encoder's configuration
/// record can go into the stream parameters.
pub struct FfmpegMuxSink {
    format: OutputFormat,
    output: Option<OpenOutput>,
    chunks: u64,
}

// SAFETY: the format context is only touched by the driver task that owns the
// sink, and by the blocking task it is moved into for finalize.
unsafe impl Send for FfmpegMuxSink {}

impl FfmpegMuxSink {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            output: None,
            chunks: 0,
        }
    }

    fn muxer_name(&self) -> &'static str {
        match self.format {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::WebM => "webm",
        }
    }

    fn header_options(&self) -> Dictionary<'static> {
        let mut options = Dictionary::new();
        if self.format == OutputFormat::Mp4 {
            options.set("movflags", "+faststart");
        }
        options
    }
}

fn mux_error(operation: &str, error: impl std::fmt::Display) -> CodecError {
    CodecError::MuxFailed {
        reason: format!("{operation}: {error}"),
    }
}

impl ChunkSink for FfmpegMuxSink {
    fn begin(&mut self, config: &EncoderConfig) -> CodecResult<()> {
        init()?;
        let codec: CodecString = config.codec.parse()?;
        let id = codec_id(codec.family());

        let file = tempfile::Builder::new()
            .prefix("clipfit-")
            .suffix(&format!(".{}", self.format.extension()))
            .tempfile()
            .map_err(|source| CodecError::Io {
                operation: "creating output file".to_string(),
                source,
            })?;
        let mut context = ffmpeg::format::output_as(file.path(), self.muxer_name())
            .map_err(|e| backend_error("opening muxer", e))?;

        let mut stream = context
            .add_stream(ffmpeg::encoder::find(id))
            .map_err(|e| mux_error("adding stream", e))?;
        stream.set_time_base(MICROS);
        // SAFETY: codecpar belongs to the stream just created.
        unsafe {
            let parameters = (*stream.as_mut_ptr()).codecpar;
            (*parameters).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*parameters).codec_id = id.into();
            (*parameters).codec_tag = 0;
            (*parameters).width = config.width as i32;
            (*parameters).height = config.height as i32;
            (*parameters).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
            (*parameters).bit_rate = config.bitrate as i64;
        }

        tracing::debug!(
            "Muxing {} into {} at {}",
            config.codec,
            self.format,
            file.path().display()
        );
        self.output = Some(OpenOutput {
            file,
            context,
            stream_time_base: MICROS,
            header_written: false,
        });
        self.chunks = 0;
        Ok(())
    }

    fn add_chunk(&mut self, chunk: EncodedChunk) -> CodecResult<()> {
        let options = self.header_options();
        let output = self.output.as_mut().ok_or(CodecError::NotConfigured)?;

        if !output.header_written {
            if let Some(record) = &chunk.decoder_config {
                let mut stream = output
                    .context
                    .stream_mut(STREAM_INDEX)
                    .ok_or_else(|| mux_error("writing header", "stream missing"))?;
                // SAFETY: the parameters take ownership of the new allocation.
                unsafe {
                    let parameters = (*stream.as_mut_ptr()).codecpar;
                    install_extradata(
                        &mut (*parameters).extradata,
                        &mut (*parameters).extradata_size,
                        record,
                    )?;
                }
            }
            output
                .context
                .write_header_with(options)
                .map_err(|e| mux_error("writing header", e))?;
            output.stream_time_base = output
                .context
                .stream(STREAM_INDEX)
                .map(|stream| stream.time_base())
                .unwrap_or(MICROS);
            output.header_written = true;
        }

        let mut packet = Packet::copy(&chunk.data);
        packet.set_pts(Some(chunk.timestamp_us));
        packet.set_dts(Some(chunk.timestamp_us));
        packet.set_duration(i64::try_from(chunk.duration_us).unwrap_or(i64::MAX));
        if chunk.kind == ChunkKind::Key {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        packet.set_stream(STREAM_INDEX);
        packet.set_position(-1);
        packet.rescale_ts(MICROS, output.stream_time_base);
        packet
            .write_interleaved(&mut output.context)
            .map_err(|e| mux_error(&format!("chunk {}", self.chunks), e))?;
        self.chunks += 1;
        Ok(())
    }

    fn finalize(&mut self) -> CodecResult<Bytes> {
        let OpenOutput {
            file,
            mut context,
            header_written,
            ..
        } = self.output.take().ok_or(CodecError::NotConfigured)?;
        if !header_written {
            return Err(mux_error("finalizing", "no chunks were written"));
        }
        context
            .write_trailer()
            .map_err(|e| mux_error("writing trailer", e))?;
        drop(context);

        let payload = std::fs::read(file.path()).map_err(|source| CodecError::Io {
            operation: format!("reading back {}", file.path().display()),
            source,
        })?;
        tracing::debug!("Muxed {} chunks into {} bytes", self.chunks, payload.len());
        Ok(Bytes::from(payload))
    }
}
