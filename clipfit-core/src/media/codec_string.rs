//! RFC 6381 codec strings.
//!
//! Parses the identifiers used by the negotiation ladders (`avc1.64002a`,
//! `vp09.00.10.08`) and derives them from codec configuration records found in
//! ISO-BMFF sample entries.

use std::fmt;
use std::str::FromStr;

use crate::codec::CodecError;

/// Codec family behind a codec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFamily {
    Avc,
    Hevc,
    Vp8,
    Vp9,
    Av1,
}

/// A parsed codec string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CodecString {
    /// `avc1.PPCCLL` / `avc3.PPCCLL`
    Avc {
        in_band_parameters: bool,
        profile_idc: u8,
        constraint_flags: u8,
        level_idc: u8,
    },
    /// `hvc1.*` / `hev1.*`, parameters kept verbatim
    Hevc {
        in_band_parameters: bool,
        parameters: String,
    },
    /// `vp8` / `vp08.*`
    Vp8,
    /// `vp09.PP.LL.DD`
    Vp9 { profile: u8, level: u8, bit_depth: u8 },
    /// `av01.*`, parameters kept verbatim
    Av1 { parameters: String },
}

impl CodecString {
    pub fn family(&self) -> CodecFamily {
        match self {
            CodecString::Avc { .. } => CodecFamily::Avc,
            CodecString::Hevc { .. } => CodecFamily::Hevc,
            CodecString::Vp8 => CodecFamily::Vp8,
            CodecString::Vp9 { .. } => CodecFamily::Vp9,
            CodecString::Av1 { .. } => CodecFamily::Av1,
        }
    }

    /// AVC profile name for `profile_idc`, `None` for other families.
    pub fn avc_profile_name(&self) -> Option<&'static str> {
        let CodecString::Avc { profile_idc, .. } = self else {
            return None;
        };
        Some(match profile_idc {
            66 => "baseline",
            77 => "main",
            88 => "extended",
            100 => "high",
            110 => "high10",
            122 => "high422",
            244 => "high444",
            _ => return None,
        })
    }

    /// AVC level as written in encoder options, e.g. `4.2` for `level_idc` 42.
    pub fn avc_level(&self) -> Option<String> {
        let CodecString::Avc { level_idc, .. } = self else {
            return None;
        };
        Some(format!("{}.{}", level_idc / 10, level_idc % 10))
    }

    /// Derives `avc1.PPCCLL` from the body of an `avcC` box.
    pub fn from_avc_config(body: &[u8]) -> Option<Self> {
        if body.len() < 4 || body[0] != 1 {
            return None;
        }
        Some(CodecString::Avc {
            in_band_parameters: false,
            profile_idc: body[1],
            constraint_flags: body[2],
            level_idc: body[3],
        })
    }

    /// Derives an `hvc1`/`hev1` string from the body of an `hvcC` box.
    pub fn from_hevc_config(in_band_parameters: bool, body: &[u8]) -> Option<Self> {
        if body.len() < 13 {
            return None;
        }
        let profile_space = body[1] >> 6;
        let tier_high = body[1] & 0x20 != 0;
        let profile_idc = body[1] & 0x1F;
        let compatibility = u32::from_be_bytes([body[2], body[3], body[4], body[5]]).reverse_bits();
        let level_idc = body[12];

        let mut parameters = String::new();
        if profile_space > 0 {
            parameters.push(char::from(b'A' + profile_space - 1));
        }
        parameters.push_str(&format!(
            "{profile_idc}.{compatibility:X}.{}{level_idc}",
            if tier_high { 'H' } else { 'L' }
        ));

        let constraints = &body[6..12];
        let used = constraints
            .iter()
            .rposition(|&byte| byte != 0)
            .map_or(0, |index| index + 1);
        for byte in &constraints[..used] {
            parameters.push_str(&format!(".{byte:X}"));
        }

        Some(CodecString::Hevc {
            in_band_parameters,
            parameters,
        })
    }

    /// Derives `vp09.PP.LL.DD` from the body of a `vpcC` box (version 1).
    pub fn from_vp9_config(body: &[u8]) -> Option<Self> {
        // version + flags, then profile, level, bitDepth/chroma/range
        if body.len() < 7 || body[0] != 1 {
            return None;
        }
        Some(CodecString::Vp9 {
            profile: body[4],
            level: body[5],
            bit_depth: body[6] >> 4,
        })
    }

    /// Derives `av01.P.LLT.DD` from the body of an `av1C` box.
    pub fn from_av1_config(body: &[u8]) -> Option<Self> {
        if body.len() < 3 || body[0] & 0x80 == 0 {
            return None;
        }
        let profile = body[1] >> 5;
        let level = body[1] & 0x1F;
        let tier = if body[2] & 0x80 != 0 { 'H' } else { 'M' };
        let high_bitdepth = body[2] & 0x40 != 0;
        let twelve_bit = body[2] & 0x20 != 0;
        let bit_depth = match (high_bitdepth, twelve_bit) {
            (true, true) => 12,
            (true, false) => 10,
            _ => 8,
        };
        Some(CodecString::Av1 {
            parameters: format!("{profile}.{level:02}{tier}.{bit_depth:02}"),
        })
    }
}

impl FromStr for CodecString {
    type Err = CodecError;

    fn from_str(codec: &str) -> Result<Self, Self::Err> {
        let (fourcc, rest) = codec.split_once('.').unwrap_or((codec, ""));
        let malformed = |reason: &str| CodecError::InvalidConfig {
            reason: format!("malformed codec string {codec}: {reason}"),
        };

        match fourcc {
            "avc1" | "avc3" => {
                if rest.len() != 6 || !rest.is_ascii() {
                    return Err(malformed("expected six hex digits"));
                }
                let byte = |index: usize| {
                    u8::from_str_radix(&rest[index..index + 2], 16)
                        .map_err(|_| malformed("expected six hex digits"))
                };
                Ok(CodecString::Avc {
                    in_band_parameters: fourcc == "avc3",
                    profile_idc: byte(0)?,
                    constraint_flags: byte(2)?,
                    level_idc: byte(4)?,
                })
            }
            "hvc1" | "hev1" => {
                if rest.is_empty() {
                    return Err(malformed("missing parameters"));
                }
                Ok(CodecString::Hevc {
                    in_band_parameters: fourcc == "hev1",
                    parameters: rest.to_string(),
                })
            }
            "vp8" | "vp08" => Ok(CodecString::Vp8),
            "vp9" => Ok(CodecString::Vp9 {
                profile: 0,
                level: 10,
                bit_depth: 8,
            }),
            "vp09" => {
                let fields: Vec<&str> = rest.split('.').collect();
                if fields.len() < 3 {
                    return Err(malformed("expected profile, level and bit depth"));
                }
                let number = |field: &str| {
                    field
                        .parse::<u8>()
                        .map_err(|_| malformed("expected decimal fields"))
                };
                Ok(CodecString::Vp9 {
                    profile: number(fields[0])?,
                    level: number(fields[1])?,
                    bit_depth: number(fields[2])?,
                })
            }
            "av01" => {
                if rest.is_empty() {
                    return Err(malformed("missing parameters"));
                }
                Ok(CodecString::Av1 {
                    parameters: rest.to_string(),
                })
            }
            _ => Err(CodecError::UnsupportedCodec {
                codec: codec.to_string(),
            }),
        }
    }
}

impl fmt::Display for CodecString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecString::Avc {
                in_band_parameters,
                profile_idc,
                constraint_flags,
                level_idc,
            } => {
                let fourcc = if *in_band_parameters { "avc3" } else { "avc1" };
                write!(f, "{fourcc}.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}")
            }
            CodecString::Hevc {
                in_band_parameters,
                parameters,
            } => {
                let fourcc = if *in_band_parameters { "hev1" } else { "hvc1" };
                write!(f, "{fourcc}.{parameters}")
            }
            CodecString::Vp8 => f.write_str("vp8"),
            CodecString::Vp9 {
                profile,
                level,
                bit_depth,
            } => write!(f, "vp09.{profile:02}.{level:02}.{bit_depth:02}"),
            CodecString::Av1 { parameters } => write!(f, "av01.{parameters}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_avc_ladder_entries() {
        let high: CodecString = "avc1.64002a".parse().unwrap();
        assert_eq!(high.family(), CodecFamily::Avc);
        assert_eq!(high.avc_profile_name(), Some("high"));
        assert_eq!(high.avc_level().as_deref(), Some("4.2"));
        assert_eq!(high.to_string(), "avc1.64002a");

        let baseline: CodecString = "avc1.42002a".parse().unwrap();
        assert_eq!(baseline.avc_profile_name(), Some("baseline"));

        let high51: CodecString = "avc1.640033".parse().unwrap();
        assert_eq!(high51.avc_level().as_deref(), Some("5.1"));
    }

    #[test]
    fn test_parse_vp9() {
        let vp9: CodecString = "vp09.00.10.08".parse().unwrap();
        assert_eq!(
            vp9,
            CodecString::Vp9 {
                profile: 0,
                level: 10,
                bit_depth: 8
            }
        );
        assert_eq!(vp9.to_string(), "vp09.00.10.08");
        assert_eq!(vp9.avc_level(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "mp4v.20.9".parse::<CodecString>(),
            Err(CodecError::UnsupportedCodec { .. })
        ));
        assert!(matches!(
            "avc1.64zz2a".parse::<CodecString>(),
            Err(CodecError::InvalidConfig { .. })
        ));
        assert!("avc1.6400".parse::<CodecString>().is_err());
        assert!("vp09.00".parse::<CodecString>().is_err());
    }

    #[test]
    fn test_from_avc_config() {
        let body = [0x01, 0x4D, 0x40, 0x1F, 0xFF, 0xE1];
        let codec = CodecString::from_avc_config(&body).unwrap();
        assert_eq!(codec.to_string(), "avc1.4d401f");
        assert!(CodecString::from_avc_config(&[0x02, 0x4D, 0x40, 0x1F]).is_none());
        assert!(CodecString::from_avc_config(&[0x01, 0x4D]).is_none());
    }

    #[test]
    fn test_from_hevc_config() {
        // Main profile, compatibility flag bits 1 and 2, level 93, progressive source flag
        let mut body = vec![0x01, 0x01, 0x60, 0x00, 0x00, 0x00, 0x90, 0, 0, 0, 0, 0, 93];
        body.extend_from_slice(&[0xF0, 0x00]);
        let codec = CodecString::from_hevc_config(false, &body).unwrap();
        assert_eq!(codec.to_string(), "hvc1.1.6.L93.90");
        assert_eq!(codec.family(), CodecFamily::Hevc);
    }

    #[test]
    fn test_from_vp9_and_av1_config() {
        let vpcc = [0x01, 0, 0, 0, 0x00, 0x1F, 0x80, 0x01];
        assert_eq!(
            CodecString::from_vp9_config(&vpcc).unwrap().to_string(),
            "vp09.00.31.08"
        );

        let av1c = [0x81, 0x08, 0x0C, 0x00];
        assert_eq!(
            CodecString::from_av1_config(&av1c).unwrap().to_string(),
            "av01.0.08M.08"
        );
    }
}
