//! Input container sniffing and output format selection.
//!
//! Extensions lie, so inputs are classified from their leading bytes.

use thiserror::Error;

/// What the input file turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Mp4,
    /// ISO-BMFF with a `qt  ` major brand
    Mov,
    WebM,
    /// EBML without a `webm` doctype
    Mkv,
    Avi,
    /// GIF87a or GIF89a, possibly animated
    Gif,
    /// RIFF WebP, possibly animated
    WebP,
    Unknown,
}

impl ContainerFormat {
    /// Animated images carry frame delays rather than a real timeline.
    pub fn is_animated_image(self) -> bool {
        matches!(self, Self::Gif | Self::WebP)
    }

    /// Whether the pure-Rust ISO-BMFF source can read this container.
    pub fn is_iso_bmff(self) -> bool {
        matches!(self, Self::Mp4 | Self::Mov)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Mp4 => "MP4",
            Self::Mov => "QuickTime",
            Self::WebM => "WebM",
            Self::Mkv => "Matroska",
            Self::Avi => "AVI",
            Self::Gif => "GIF",
            Self::WebP => "WebP",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Sniffing failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("Header too short to identify the container: {got} of {min} bytes", min = HEADER_MIN_LEN)]
    HeaderTooShort { got: usize },
}

/// Shortest header every signature below can be checked against.
pub const HEADER_MIN_LEN: usize = 12;

/// Window searched for the EBML doctype.
const EBML_DOCTYPE_WINDOW: usize = 64;
const EBML_MAGIC: &[u8] = &[0x1A, 0x45, 0xDF, 0xA3];

/// Top-level box types an ISO-BMFF file may open with.
const ISO_LEADING_BOXES: [&[u8; 4]; 6] = [b"ftyp", b"moov", b"mdat", b"free", b"skip", b"wide"];

/// Classifies `header`, which should hold the first bytes of the file.
///
/// # Errors
///
/// - `DetectionError::HeaderTooShort` - Fewer than [`HEADER_MIN_LEN`] bytes
pub fn detect_container_format(header: &[u8]) -> Result<ContainerFormat, DetectionError> {
    if header.len() < HEADER_MIN_LEN {
        return Err(DetectionError::HeaderTooShort { got: header.len() });
    }

    let box_type = &header[4..8];
    let brand = &header[8..12];

    let format = if ISO_LEADING_BOXES.iter().any(|b| b.as_slice() == box_type) {
        if box_type == b"ftyp" && brand.starts_with(b"qt") {
            ContainerFormat::Mov
        } else {
            ContainerFormat::Mp4
        }
    } else if header.starts_with(EBML_MAGIC) {
        let window = &header[..header.len().min(EBML_DOCTYPE_WINDOW)];
        if window.windows(4).any(|w| w == b"webm") {
            ContainerFormat::WebM
        } else {
            ContainerFormat::Mkv
        }
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        ContainerFormat::Gif
    } else if header.starts_with(b"RIFF") && brand == b"WEBP" {
        ContainerFormat::WebP
    } else if header.starts_with(b"RIFF") && brand == b"AVI " {
        ContainerFormat::Avi
    } else {
        ContainerFormat::Unknown
    };
    Ok(format)
}

/// Output container produced by a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// H.264 in MP4
    Mp4,
    /// VP9 in WebM
    #[value(name = "webm")]
    WebM,
}

impl OutputFormat {
    /// Animated images become WebM, everything else MP4.
    pub fn for_container(container: ContainerFormat) -> Self {
        if container.is_animated_image() {
            Self::WebM
        } else {
            Self::Mp4
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::WebM => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::WebM => "video/webm",
        }
    }

    /// Share of the budget left to the video bitstream after container overhead.
    pub fn default_safety_factor(self) -> f64 {
        match self {
            Self::Mp4 => 0.90,
            Self::WebM => 0.98,
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}
