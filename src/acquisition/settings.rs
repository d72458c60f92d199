//! Acquisition parameters.
//!
//! Gain and apodization are closed sets. The server addresses them by index,
//! which is the declaration order of each enum; an unknown name is rejected when
//! the configuration is built rather than silently mapped to a default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a gain or apodization name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind} '{value}' (expected one of: {expected})")]
pub struct UnknownSettingError {
    kind: &'static str,
    value: String,
    expected: String,
}

impl UnknownSettingError {
    fn new(kind: &'static str, value: &str, names: &[&str]) -> Self {
        Self {
            kind,
            value: value.to_string(),
            expected: names.join(", "),
        }
    }
}

/// Detector gain level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Gain {
    /// Index 0.
    #[default]
    Low,
    /// Index 1.
    Medium,
    /// Index 2.
    High,
    /// Index 3.
    Extreme,
}

impl Gain {
    /// All gain levels in index order.
    pub const ALL: [Gain; 4] = [Gain::Low, Gain::Medium, Gain::High, Gain::Extreme];

    /// Index sent with `GAIN:SET`.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Gain::Low => "Low",
            Gain::Medium => "Medium",
            Gain::High => "High",
            Gain::Extreme => "Extreme",
        }
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Gain {
    type Err = UnknownSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|g| g.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|g| g.name()).collect();
                UnknownSettingError::new("gain", s, &names)
            })
    }
}

/// Apodization function applied to the interferogram.
///
/// Variants are listed in server index order, `Boxcar` = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Apodization {
    Boxcar,
    NortonBeerWeak,
    NortonBeerMedium,
    #[default]
    NortonBeerStrong,
    Hamming,
    BlackmanHarris3,
    BlackmanHarris4,
    Triangular,
    Hann,
    Tukey,
    Cosine,
    HappGenzel,
}

impl Apodization {
    /// All apodization functions in index order.
    pub const ALL: [Apodization; 12] = [
        Apodization::Boxcar,
        Apodization::NortonBeerWeak,
        Apodization::NortonBeerMedium,
        Apodization::NortonBeerStrong,
        Apodization::Hamming,
        Apodization::BlackmanHarris3,
        Apodization::BlackmanHarris4,
        Apodization::Triangular,
        Apodization::Hann,
        Apodization::Tukey,
        Apodization::Cosine,
        Apodization::HappGenzel,
    ];

    /// Index sent with `SPEC:APO`.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Apodization::Boxcar => "Boxcar",
            Apodization::NortonBeerWeak => "NortonBeerWeak",
            Apodization::NortonBeerMedium => "NortonBeerMedium",
            Apodization::NortonBeerStrong => "NortonBeerStrong",
            Apodization::Hamming => "Hamming",
            Apodization::BlackmanHarris3 => "BlackmanHarris3",
            Apodization::BlackmanHarris4 => "BlackmanHarris4",
            Apodization::Triangular => "Triangular",
            Apodization::Hann => "Hann",
            Apodization::Tukey => "Tukey",
            Apodization::Cosine => "Cosine",
            Apodization::HappGenzel => "HappGenzel",
        }
    }
}

impl fmt::Display for Apodization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Apodization {
    type Err = UnknownSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|a| a.name()).collect();
                UnknownSettingError::new("apodization", s, &names)
            })
    }
}

/// Default number of co-added spectra.
pub const DEFAULT_AVERAGE_COUNT: NonZeroU32 = NonZeroU32::MIN.saturating_add(4);

/// Parameters for one acquisition. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Detector gain.
    pub gain: Gain,
    /// Apodization function.
    pub apodization: Apodization,
    /// Number of spectra averaged per measurement.
    pub average_count: NonZeroU32,
    /// Also average at the interferogram level with the same count.
    pub interferogram_averaging: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            gain: Gain::default(),
            apodization: Apodization::default(),
            average_count: DEFAULT_AVERAGE_COUNT,
            interferogram_averaging: false,
        }
    }
}
