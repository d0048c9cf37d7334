//! Photometric quality and morphology-confidence cuts over catalog rows.

use serde::{Deserialize, Serialize};

use crate::domain::{Band, CatalogRow};

/// Thresholds applied by [`QualityCuts::passes`]. Every comparison is strict
/// except the confidence floor, and NaN never passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityCuts {
    /// Magnitudes at or below this are survey sentinels (-9999 and friends).
    pub min_magnitude: f64,
    /// Per-band upper bound on the magnitude error, ugriz order.
    pub max_magnitude_error: [f64; 5],
    /// At least one of `p_el_debiased`/`p_cs_debiased` must reach this.
    pub min_confidence: f64,
    /// Arcseconds per pixel of the cutouts the sizes are measured against.
    pub pixel_scale: f64,
    /// Upper bound applies to the diameter widened by this factor.
    pub size_margin: f64,
    pub min_size_px: f64,
    pub max_size_px: f64,
}

impl Default for QualityCuts {
    fn default() -> Self {
        Self {
            min_magnitude: -30.0,
            max_magnitude_error: [0.5, 0.05, 0.05, 0.05, 0.1],
            min_confidence: 0.9,
            pixel_scale: 0.4,
            size_margin: 1.5,
            min_size_px: 20.0,
            max_size_px: 64.0,
        }
    }
}

impl QualityCuts {
    /// Diameter of the object in cutout pixels.
    pub fn diameter_px(&self, petro_r90_r: f64) -> f64 {
        petro_r90_r * 2.0 / self.pixel_scale
    }

    pub fn passes(&self, row: &CatalogRow) -> bool {
        let magnitudes_ok = Band::ALL
            .iter()
            .all(|&band| row.magnitude(band) > self.min_magnitude);
        let errors_ok = Band::ALL
            .iter()
            .all(|&band| row.magnitude_error(band) < self.max_magnitude_error[band.index()]);
        let confident = row.p_cs_debiased >= self.min_confidence
            || row.p_el_debiased >= self.min_confidence;
        let diameter = self.diameter_px(row.petro_r90_r);
        let size_ok = diameter * self.size_margin < self.max_size_px && diameter > self.min_size_px;

        magnitudes_ok && errors_ok && confident && size_ok
    }

    pub fn mask(&self, rows: &[CatalogRow]) -> Vec<bool> {
        rows.iter().map(|row| self.passes(row)).collect()
    }

    /// Rows that pass every cut, in input order.
    pub fn apply(&self, rows: &[CatalogRow]) -> Vec<CatalogRow> {
        rows.iter().filter(|row| self.passes(row)).cloned().collect()
    }
}
