//! Deviation of a fitted surface from the limit surface it stands in for.
//!
//! [`check_region_quality`] measures against a denser lattice than any fit density in
//! use, so most of the points it checks were not fit samples.

use serde::Serialize;

use super::Point3;
use super::cancel::CancellationToken;
use super::mesh::Tessellation;
use super::segmentation::Region;
use super::subdivision::SubdivisionEvaluator;
use super::surface::{Surface, closest_point};
use super::surface_fit::{SurfaceFitError, sample_region_limit};

/// Seed grid for the closest-point projection of each sample.
const PROJECTION_SEED_GRID: usize = 16;

/// Limit samples per cage-face edge for held-out validation.
pub const CHECK_DENSITY: usize = 20;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("no samples to validate against")]
    NoSamples,

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },

    #[error(transparent)]
    Sampling(#[from] SurfaceFitError),
}

/// Signed distances from samples to their projections, positive on the normal side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FittingQuality {
    /// Largest `|d|`.
    pub max_deviation: f64,
    /// Mean `|d|`.
    pub mean_deviation: f64,
    pub rms_deviation: f64,
    pub max_signed: f64,
    pub min_signed: f64,
    pub sample_count: usize,
}

impl FittingQuality {
    /// `max_deviation < tolerance`.
    #[must_use]
    pub fn is_acceptable(&self, tolerance: f64) -> bool {
        self.max_deviation < tolerance
    }
}

/// # Errors
/// `NoSamples` for an empty sample set, `NonFinite` when a sample or projection is NaN/Inf.
pub fn check_fitting_quality(
    samples: &[Point3],
    surface: &impl Surface,
) -> Result<FittingQuality, ValidationError> {
    if samples.is_empty() {
        return Err(ValidationError::NoSamples);
    }
    if samples.iter().any(|p| !p.is_finite()) {
        return Err(ValidationError::NonFinite { stage: "validation input" });
    }

    let mut max_deviation: f64 = 0.0;
    let mut sum_abs = 0.0;
    let mut sum_sq = 0.0;
    let mut max_signed = f64::NEG_INFINITY;
    let mut min_signed = f64::INFINITY;
    for &sample in samples {
        let d = closest_point(surface, sample, PROJECTION_SEED_GRID).signed_distance;
        if !d.is_finite() {
            return Err(ValidationError::NonFinite { stage: "projection" });
        }
        max_deviation = max_deviation.max(d.abs());
        sum_abs += d.abs();
        sum_sq += d * d;
        max_signed = max_signed.max(d);
        min_signed = min_signed.min(d);
    }

    let count = samples.len() as f64;
    let quality = FittingQuality {
        max_deviation,
        mean_deviation: sum_abs / count,
        rms_deviation: (sum_sq / count).sqrt(),
        max_signed,
        min_signed,
        sample_count: samples.len(),
    };
    log::debug!(
        "validation: {} samples, max {:.3e}, rms {:.3e}",
        quality.sample_count,
        quality.max_deviation,
        quality.rms_deviation
    );
    Ok(quality)
}

/// Deviation of `surface` from the limit surface under `region`, sampled at
/// [`CHECK_DENSITY`] independently of the samples the surface was fit to.
///
/// # Errors
/// `Sampling` when the region cannot be sampled (including cancellation), otherwise as
/// [`check_fitting_quality`].
pub fn check_region_quality(
    evaluator: &SubdivisionEvaluator,
    tessellation: &Tessellation,
    region: &Region,
    surface: &impl Surface,
    token: &CancellationToken,
) -> Result<FittingQuality, ValidationError> {
    let samples = sample_region_limit(evaluator, tessellation, region, CHECK_DENSITY, token)?;
    check_fitting_quality(&samples, surface)
}

/// Tessellation vertices referenced by the region's triangles, in index order.
#[must_use]
pub fn region_samples(tessellation: &Tessellation, region: &Region) -> Vec<Point3> {
    let mut vertices: Vec<u32> = region
        .faces
        .iter()
        .filter_map(|&t| tessellation.triangles.get(t))
        .flatten()
        .copied()
        .collect();
    vertices.sort_unstable();
    vertices.dedup();
    vertices
        .into_iter()
        .map(|i| tessellation.positions[i as usize])
        .collect()
}
