//! SDP video format descriptors and catalog matching.

use std::collections::BTreeMap;
use std::fmt;

/// `profile-level-id` fmtp key.
pub const PROFILE_LEVEL_ID: &str = "profile-level-id";
/// `packetization-mode` fmtp key.
pub const PACKETIZATION_MODE: &str = "packetization-mode";
/// `level-asymmetry-allowed` fmtp key.
pub const LEVEL_ASYMMETRY_ALLOWED: &str = "level-asymmetry-allowed";

/// Profile assumed when an H.264 format carries no `profile-level-id`.
const DEFAULT_PROFILE_LEVEL_ID: &str = "42e01f";

/// Spatial/temporal layering structure (W3C `scalabilityMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalabilityMode {
    L1T1,
    L1T2,
    L1T3,
    L2T1,
    L2T2,
    L2T3,
    L3T1,
    L3T2,
    L3T3,
}

impl ScalabilityMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L1T1 => "L1T1",
            Self::L1T2 => "L1T2",
            Self::L1T3 => "L1T3",
            Self::L2T1 => "L2T1",
            Self::L2T2 => "L2T2",
            Self::L2T3 => "L2T3",
            Self::L3T1 => "L3T1",
            Self::L3T2 => "L3T2",
            Self::L3T3 => "L3T3",
        }
    }

    /// Parse a mode name. Unknown names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "L1T1" => Self::L1T1,
            "L1T2" => Self::L1T2,
            "L1T3" => Self::L1T3,
            "L2T1" => Self::L2T1,
            "L2T2" => Self::L2T2,
            "L2T3" => Self::L2T3,
            "L3T1" => Self::L3T1,
            "L3T2" => Self::L3T2,
            "L3T3" => Self::L3T3,
            _ => return None,
        })
    }
}

impl fmt::Display for ScalabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec name plus fmtp parameters, as negotiated in SDP.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpVideoFormat {
    pub name: String,
    pub parameters: BTreeMap<String, String>,
    pub scalability_modes: Vec<ScalabilityMode>,
}

impl SdpVideoFormat {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_scalability_modes(mut self, modes: &[ScalabilityMode]) -> Self {
        self.scalability_modes = modes.to_vec();
        self
    }

    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_h264(&self) -> bool {
        self.name.eq_ignore_ascii_case("H264")
    }

    /// H.264 profile from `profile-level-id`, defaulting when absent.
    #[must_use]
    pub fn h264_profile(&self) -> Option<H264Profile> {
        let profile_level_id = self
            .parameter(PROFILE_LEVEL_ID)
            .unwrap_or(DEFAULT_PROFILE_LEVEL_ID);
        H264Profile::from_profile_level_id(profile_level_id)
    }
}

impl fmt::Display for SdpVideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        let mut sep = " {";
        for (k, v) in &self.parameters {
            write!(f, "{sep}{k}={v}")?;
            sep = ", ";
        }
        if !self.parameters.is_empty() {
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// H.264 profiles distinguished when matching formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    ConstrainedBaseline,
    Baseline,
    Main,
    ConstrainedHigh,
    High,
    PredictiveHigh444,
}

impl H264Profile {
    /// Decode the profile from a six-digit hex `profile-level-id`.
    #[must_use]
    pub fn from_profile_level_id(id: &str) -> Option<Self> {
        if id.len() != 6 {
            return None;
        }
        let value = u32::from_str_radix(id, 16).ok()?;
        let profile_idc = (value >> 16) & 0xFF;
        let profile_iop = (value >> 8) & 0xFF;

        let constraint_set0 = profile_iop & 0x80 != 0;
        let constraint_set1 = profile_iop & 0x40 != 0;
        let constraint_set3 = profile_iop & 0x10 != 0;

        match profile_idc {
            0x42 if constraint_set1 => Some(Self::ConstrainedBaseline),
            0x42 => Some(Self::Baseline),
            0x4D if constraint_set0 => Some(Self::ConstrainedBaseline),
            0x4D => Some(Self::Main),
            0x58 if constraint_set0 && constraint_set1 => Some(Self::ConstrainedBaseline),
            0x64 if profile_iop & 0x0C == 0x0C => Some(Self::ConstrainedHigh),
            0x64 => Some(Self::High),
            0xF4 if !constraint_set3 => Some(Self::PredictiveHigh444),
            _ => None,
        }
    }

    /// `profile_idc` and `profile_iop` bytes for this profile.
    fn prefix(self) -> &'static str {
        match self {
            Self::ConstrainedBaseline => "42e0",
            Self::Baseline => "4200",
            Self::Main => "4d00",
            Self::ConstrainedHigh => "640c",
            Self::High => "6400",
            Self::PredictiveHigh444 => "f400",
        }
    }
}

/// H.264 levels used by the built-in catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Level {
    L3_1,
    L4_1,
}

impl H264Level {
    fn level_idc(self) -> &'static str {
        match self {
            Self::L3_1 => "1f",
            Self::L4_1 => "29",
        }
    }
}

/// An H.264 format entry for a catalog.
#[must_use]
pub fn h264_format(
    profile: H264Profile,
    level: H264Level,
    packetization_mode: &str,
) -> SdpVideoFormat {
    SdpVideoFormat::new("H264")
        .with_parameter(PROFILE_LEVEL_ID, format!("{}{}", profile.prefix(), level.level_idc()))
        .with_parameter(LEVEL_ASYMMETRY_ALLOWED, "1")
        .with_parameter(PACKETIZATION_MODE, packetization_mode)
}

/// Temporal layering an H.264 encoder can produce.
pub const H264_SCALABILITY_MODES: [ScalabilityMode; 3] =
    [ScalabilityMode::L1T1, ScalabilityMode::L1T2, ScalabilityMode::L1T3];

/// The H.264 catalog: Baseline, Constrained Baseline and Main at level
/// 3.1, each with packetization modes 1 and 0.
#[must_use]
pub fn supported_h264_codecs(add_scalability_modes: bool) -> Vec<SdpVideoFormat> {
    let modes: &[ScalabilityMode] = if add_scalability_modes {
        &H264_SCALABILITY_MODES
    } else {
        &[]
    };
    [H264Profile::Baseline, H264Profile::ConstrainedBaseline, H264Profile::Main]
        .into_iter()
        .flat_map(|profile| {
            ["1", "0"].map(|mode| {
                h264_format(profile, H264Level::L3_1, mode).with_scalability_modes(modes)
            })
        })
        .collect()
}

fn matching_parameters(candidate: &SdpVideoFormat, requested: &SdpVideoFormat) -> usize {
    candidate
        .parameters
        .iter()
        .filter(|(k, v)| requested.parameters.get(*k) == Some(*v))
        .count()
}

/// Pick the catalog entry closest to `requested`.
///
/// Candidates must have the same codec name (case-insensitive). A single
/// candidate wins outright. Among several, H.264 candidates must share the
/// requested profile, then the one agreeing on `packetization-mode` and on
/// the most other parameters is chosen; ties go to the earlier entry.
#[must_use]
pub fn fuzzy_match<'a>(
    catalog: &'a [SdpVideoFormat],
    requested: &SdpVideoFormat,
) -> Option<&'a SdpVideoFormat> {
    let candidates: Vec<&SdpVideoFormat> = catalog
        .iter()
        .filter(|f| f.name.eq_ignore_ascii_case(&requested.name))
        .collect();

    if let [only] = candidates.as_slice() {
        return Some(only);
    }

    let wanted_profile = requested.is_h264().then(|| requested.h264_profile()).flatten();
    let mut best: Option<(&SdpVideoFormat, (bool, usize))> = None;
    for candidate in candidates {
        if candidate.is_h264() && candidate.h264_profile() != wanted_profile {
            continue;
        }
        let same_mode = candidate.parameter(PACKETIZATION_MODE).unwrap_or("0")
            == requested.parameter(PACKETIZATION_MODE).unwrap_or("0");
        let score = (same_mode, matching_parameters(candidate, requested));
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }

    if best.is_none() {
        tracing::debug!(format = %requested, "No matching format in catalog");
    }
    best.map(|(format, _)| format)
}
