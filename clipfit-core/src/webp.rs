//! WebP metadata stripping.
//!
//! Removes the `EXIF`, `XMP ` and `ICCP` chunks from a RIFF/WEBP file and
//! clears the matching feature bits in the `VP8X` header so decoders do not go
//! looking for them. Image data chunks are copied byte for byte.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const RIFF_SIGNATURE: &[u8; 4] = b"RIFF";
const WEBP_SIGNATURE: &[u8; 4] = b"WEBP";
const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

const METADATA_CHUNKS: [&[u8; 4]; 3] = [b"EXIF", b"XMP ", b"ICCP"];

/// ICC (0x20), EXIF (0x08) and XMP (0x04) bits of the VP8X flags byte.
const VP8X_METADATA_FLAGS: u8 = 0x2C;

/// Errors raised while rewriting a WebP file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebpError {
    #[error("Chunk {fourcc} at offset {offset} runs past the end of the file")]
    TruncatedChunk { fourcc: String, offset: usize },

    #[error("Stripped file would exceed the RIFF size limit")]
    TooLarge,
}

/// Returns `data` without metadata chunks.
///
/// Inputs that are not RIFF/WEBP are returned unchanged. Each kept chunk keeps
/// its padding byte when its size is odd, and the RIFF size is recomputed.
///
/// # Errors
///
/// - `WebpError::TruncatedChunk` - A chunk header declares more bytes than remain
/// - `WebpError::TooLarge` - Output size does not fit the 32-bit RIFF field
pub fn strip_webp_metadata(data: Bytes) -> Result<Bytes, WebpError> {
    if data.len() < RIFF_HEADER_LEN
        || &data[0..4] != RIFF_SIGNATURE
        || &data[8..12] != WEBP_SIGNATURE
    {
        return Ok(data);
    }

    let mut output = BytesMut::with_capacity(data.len());
    output.put_slice(RIFF_SIGNATURE);
    output.put_u32_le(0);
    output.put_slice(WEBP_SIGNATURE);

    let mut offset = RIFF_HEADER_LEN;
    let mut removed = 0usize;
    while offset < data.len() {
        let fourcc = chunk_fourcc(&data, offset)?;
        let size = chunk_size(&data, offset)?;
        let total = CHUNK_HEADER_LEN + size + size % 2;
        let end = offset
            .checked_add(total)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| truncated(&fourcc, offset))?;

        if METADATA_CHUNKS.contains(&&fourcc) {
            tracing::debug!(
                "Dropping {} chunk ({} bytes)",
                String::from_utf8_lossy(&fourcc),
                size
            );
            removed += 1;
        } else {
            let start = output.len();
            output.put_slice(&data[offset..end]);
            if &fourcc == b"VP8X" && size >= 1 {
                output[start + CHUNK_HEADER_LEN] &= !VP8X_METADATA_FLAGS;
            }
        }
        offset = end;
    }

    let riff_size = u32::try_from(output.len() - 8).map_err(|_| WebpError::TooLarge)?;
    output[4..8].copy_from_slice(&riff_size.to_le_bytes());

    tracing::debug!("Stripped {} metadata chunks from WebP", removed);
    Ok(output.freeze())
}

fn chunk_fourcc(data: &[u8], offset: usize) -> Result<[u8; 4], WebpError> {
    data.get(offset..offset + 4)
        .map(|bytes| [bytes[0], bytes[1], bytes[2], bytes[3]])
        .ok_or_else(|| truncated(b"????", offset))
}

fn chunk_size(data: &[u8], offset: usize) -> Result<usize, WebpError> {
    let bytes = data
        .get(offset + 4..offset + CHUNK_HEADER_LEN)
        .ok_or_else(|| truncated(&data[offset..], offset))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

fn truncated(fourcc: &[u8], offset: usize) -> WebpError {
    WebpError::TruncatedChunk {
        fourcc: String::from_utf8_lossy(&fourcc[..fourcc.len().min(4)]).into_owned(),
        offset,
    }
}
