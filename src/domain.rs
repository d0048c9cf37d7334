use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CutoutError;

fn is_safe_name(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

/// Catalog identifier of one object (SDSS `dr7objid` in the default query).
///
/// Used verbatim as the archive entry stem, so it is restricted to characters
/// that are safe inside a tar member name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = CutoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // pandas writes integer ids read back as floats with a trailing ".0"
        let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
        if !is_safe_name(trimmed) {
            return Err(CutoutError::InvalidObjectId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogName(String);

impl CatalogName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CatalogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CatalogName {
    type Err = CutoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !is_safe_name(trimmed) {
            return Err(CutoutError::InvalidCatalogName(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// SDSS photometric bands, in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    U,
    G,
    R,
    I,
    Z,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::U, Band::G, Band::R, Band::I, Band::Z];

    pub fn suffix(self) -> &'static str {
        match self {
            Band::U => "u",
            Band::G => "g",
            Band::R => "r",
            Band::I => "i",
            Band::Z => "z",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Band::U => 0,
            Band::G => 1,
            Band::R => 2,
            Band::I => 3,
            Band::Z => 4,
        }
    }

    pub fn magnitude_column(self) -> String {
        format!("modelMag_{}", self.suffix())
    }

    pub fn error_column(self) -> String {
        format!("modelMagErr_{}", self.suffix())
    }
}

/// One object from the joined ZooSpec/PhotoObj catalog. Never mutated after
/// it has been read; filtering only selects rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    pub id: ObjectId,
    pub ra: f64,
    pub dec: f64,
    pub magnitudes: [f64; 5],
    pub magnitude_errors: [f64; 5],
    /// Petrosian radius containing 90% of the r-band light, arcseconds.
    pub petro_r90_r: f64,
    pub p_el_debiased: f64,
    pub p_cs_debiased: f64,
}

impl CatalogRow {
    pub fn magnitude(&self, band: Band) -> f64 {
        self.magnitudes[band.index()]
    }

    pub fn magnitude_error(&self, band: Band) -> f64 {
        self.magnitude_errors[band.index()]
    }
}

/// Everything the cutout builder needs for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub id: ObjectId,
    pub ra: f64,
    pub dec: f64,
    /// Arcseconds.
    pub angular_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpg,
    Png,
    Fits,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Fits => "fits",
        }
    }

    /// Identify a payload from its leading magic bytes.
    pub fn sniff(payload: &[u8]) -> Option<ImageFormat> {
        if payload.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpg)
        } else if payload.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if payload.starts_with(b"SIMPLE  =") {
            Some(ImageFormat::Fits)
        } else {
            None
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Morphology {
    Elliptical,
    Spiral,
}

impl Morphology {
    pub const ALL: [Morphology; 2] = [Morphology::Elliptical, Morphology::Spiral];

    /// Spiral wins only when its vote strictly exceeds the elliptical one.
    pub fn from_votes(spiral: f64, elliptical: f64) -> Self {
        if spiral > elliptical {
            Morphology::Spiral
        } else {
            Morphology::Elliptical
        }
    }

    pub fn index(self) -> usize {
        match self {
            Morphology::Elliptical => 0,
            Morphology::Spiral => 1,
        }
    }

    pub fn from_index(index: usize) -> Self {
        if index == 1 {
            Morphology::Spiral
        } else {
            Morphology::Elliptical
        }
    }
}

impl fmt::Display for Morphology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Morphology::Elliptical => write!(f, "Elliptical"),
            Morphology::Spiral => write!(f, "Spiral"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_object_id_valid() {
        let id: ObjectId = " 587722981742084144 ".parse().unwrap();
        assert_eq!(id.as_str(), "587722981742084144");
    }

    #[test]
    fn parse_object_id_strips_float_suffix() {
        let id: ObjectId = "42.0".parse().unwrap();
        assert_eq!(id.as_str(), "42");
    }

    #[test]
    fn parse_object_id_rejects_paths() {
        let err = "../etc/passwd".parse::<ObjectId>().unwrap_err();
        assert_matches!(err, CutoutError::InvalidObjectId(_));
    }

    #[test]
    fn sniff_formats() {
        assert_eq!(ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpg));
        assert_eq!(ImageFormat::sniff(b"SIMPLE  =                    T"), Some(ImageFormat::Fits));
        assert_eq!(ImageFormat::sniff(b"<html>"), None);
    }

    #[test]
    fn morphology_ties_are_elliptical() {
        assert_eq!(Morphology::from_votes(1.0, 0.0), Morphology::Spiral);
        assert_eq!(Morphology::from_votes(0.0, 0.0), Morphology::Elliptical);
    }
}
