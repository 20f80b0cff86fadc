//! End-to-end mold generation: cage → tessellation → curvature → regions → one mold per
//! region, plus the serialized export of the resulting surfaces.
//!
//! Regions are independent once segmentation is done, so with the `parallel` feature they
//! are fit and thickened on the rayon pool. Numerical failures of a single region
//! (`FitFailed`, `NonManifoldResult`) are recorded in [`MoldSet::skipped`] and do not stop
//! the other regions; everything else aborts the run.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::cage::{CageError, ControlCage};
use super::cancel::{CancellationToken, Cancelled};
use super::constraints::{
    ConstraintError, ConstraintOptions, ConstraintReport, ConstraintValidator,
    MIN_DRAFT_ANGLE_DEGREES, MIN_WALL_THICKNESS,
};
use super::curvature::compute_curvature_with_cancel;
use super::draft::{DraftAnalysis, DraftError, DraftOptions, analyze_draft, apply_draft_angle};
use super::laplacian::{AnalysisError, build_laplacian_with_cancel};
use super::mesh::Tessellation;
use super::metrics::{GeomMetrics, GeomTimingReport, TimingBucket};
use super::segmentation::{Region, SegmentOptions, SegmentationError, segment_with_cancel};
use super::solid::{
    KeyGeometry, MoldSolid, SolidError, SolidOptions, add_registration_keys, create_mold_solid,
};
use super::subdivision::{MAX_TESSELLATION_LEVEL, SubdivisionError, SubdivisionEvaluator};
use super::surface::NurbsSurface;
use super::surface_fit::{FitOptions, FittedSurface, SurfaceFitError, fit_region_with_cancel};
use super::validation::{FittingQuality, ValidationError, check_region_quality};
use super::Vec3;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Grid used for the per-mold draft analysis.
const DRAFT_ANALYSIS_GRID: usize = 12;

pub const EXPORT_TYPE: &str = "ceramic_mold_set";
pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum MoldError {
    #[error("invalid mold parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Cage(#[from] CageError),

    #[error(transparent)]
    Subdivision(#[from] SubdivisionError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error(transparent)]
    Fit(#[from] SurfaceFitError),

    #[error(transparent)]
    Draft(#[from] DraftError),

    #[error(transparent)]
    Solid(#[from] SolidError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error("timestamp formatting failed: {0}")]
    Timestamp(String),

    #[error("mold generation cancelled")]
    Cancelled,
}

impl From<Cancelled> for MoldError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl MoldError {
    /// True for cancellation raised at any stage.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Subdivision(SubdivisionError::Cancelled)
                | Self::Analysis(AnalysisError::Cancelled)
                | Self::Segmentation(SegmentationError::Cancelled)
                | Self::Fit(SurfaceFitError::Cancelled)
                | Self::Validation(ValidationError::Sampling(SurfaceFitError::Cancelled))
        )
    }

    /// Failures confined to one region's geometry.
    fn is_region_local(&self) -> bool {
        matches!(
            self,
            Self::Fit(SurfaceFitError::FitFailed { .. })
                | Self::Validation(ValidationError::Sampling(SurfaceFitError::FitFailed { .. }))
                | Self::Solid(SolidError::NonManifoldResult { .. })
        )
    }
}

/// Workflow configuration, accepted across the wasm boundary as a plain JS object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoldParameters {
    /// Degrees.
    pub draft_angle: f64,
    pub wall_thickness: f64,
    pub demolding_direction: Vec3,
    pub add_registration_keys: bool,
    pub key_count: usize,
    pub key_geometry: KeyGeometry,
    /// Limit samples per cage-face edge.
    pub sample_density: usize,
    /// Largest acceptable fit deviation.
    pub deviation_tolerance: f64,
    pub tessellation_level: u32,
    pub solid_resolution: usize,
    pub segmentation: SegmentOptions,
    pub fit: FitOptions,
}

impl Default for MoldParameters {
    fn default() -> Self {
        Self {
            draft_angle: 2.0,
            wall_thickness: 40.0,
            demolding_direction: Vec3::Z,
            add_registration_keys: true,
            key_count: 4,
            key_geometry: KeyGeometry::default(),
            sample_density: 8,
            deviation_tolerance: 0.1,
            tessellation_level: 3,
            solid_resolution: SolidOptions::default().resolution,
            segmentation: SegmentOptions::default(),
            fit: FitOptions::default(),
        }
    }
}

impl MoldParameters {
    #[must_use]
    pub fn with_draft_angle(mut self, degrees: f64) -> Self {
        self.draft_angle = degrees;
        self
    }

    #[must_use]
    pub fn with_wall_thickness(mut self, thickness: f64) -> Self {
        self.wall_thickness = thickness;
        self
    }

    #[must_use]
    pub fn with_demolding_direction(mut self, direction: Vec3) -> Self {
        self.demolding_direction = direction;
        self
    }

    #[must_use]
    pub fn with_registration_keys(mut self, count: usize, geometry: KeyGeometry) -> Self {
        self.add_registration_keys = true;
        self.key_count = count;
        self.key_geometry = geometry;
        self
    }

    #[must_use]
    pub fn without_registration_keys(mut self) -> Self {
        self.add_registration_keys = false;
        self
    }

    #[must_use]
    pub fn with_sample_density(mut self, density: usize) -> Self {
        self.sample_density = density;
        self
    }

    #[must_use]
    pub fn with_deviation_tolerance(mut self, tolerance: f64) -> Self {
        self.deviation_tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_tessellation_level(mut self, level: u32) -> Self {
        self.tessellation_level = level;
        self
    }

    #[must_use]
    pub fn with_solid_resolution(mut self, resolution: usize) -> Self {
        self.solid_resolution = resolution;
        self
    }

    #[must_use]
    pub fn with_segmentation(mut self, options: SegmentOptions) -> Self {
        self.segmentation = options;
        self
    }

    #[must_use]
    pub fn with_fit(mut self, options: FitOptions) -> Self {
        self.fit = options;
        self
    }

    fn fit_options(&self) -> FitOptions {
        self.fit.with_sample_density(self.sample_density)
    }

    fn draft_options(&self) -> DraftOptions {
        DraftOptions::default().with_demolding_direction(self.demolding_direction)
    }

    fn constraint_options(&self) -> ConstraintOptions {
        ConstraintOptions::default().with_demolding_direction(self.demolding_direction)
    }

    /// Rejects parameters no stage could run with, using the owning stage's error.
    ///
    /// # Errors
    /// `InvalidDraftAngle`, `InvalidThickness`, `InsufficientKeys`, `InvalidKeyGeometry`,
    /// `InsufficientSamples`, `InvalidLevel`, `InvalidResolution`, or `InvalidParameters`.
    pub fn validate(&self) -> Result<(), MoldError> {
        if !self.draft_angle.is_finite() || !(0.0..90.0).contains(&self.draft_angle) {
            return Err(DraftError::InvalidDraftAngle {
                angle: self.draft_angle,
            }
            .into());
        }
        if self.demolding_direction.normalized().is_none() {
            return Err(DraftError::InvalidDirection.into());
        }
        if !self.wall_thickness.is_finite() || self.wall_thickness <= 0.0 {
            return Err(SolidError::InvalidThickness {
                thickness: self.wall_thickness,
            }
            .into());
        }
        if self.solid_resolution < 2 {
            return Err(SolidError::InvalidResolution {
                resolution: self.solid_resolution,
            }
            .into());
        }
        if self.add_registration_keys {
            if self.key_count < 2 {
                return Err(SolidError::InsufficientKeys {
                    count: self.key_count,
                }
                .into());
            }
            let KeyGeometry { radius, height } = self.key_geometry;
            if !(radius.is_finite() && radius > 0.0 && height.is_finite() && height > 0.0) {
                return Err(SolidError::InvalidKeyGeometry { radius, height }.into());
            }
        }
        if self.tessellation_level == 0 || self.tessellation_level > MAX_TESSELLATION_LEVEL {
            return Err(SubdivisionError::InvalidLevel {
                level: self.tessellation_level,
                max: MAX_TESSELLATION_LEVEL,
            }
            .into());
        }
        self.fit_options().validate()?;
        if !self.deviation_tolerance.is_finite() || self.deviation_tolerance <= 0.0 {
            return Err(MoldError::InvalidParameters(format!(
                "deviation tolerance must be finite and positive: {}",
                self.deviation_tolerance
            )));
        }
        Ok(())
    }

    /// Casting-practice advisories; these never block generation.
    #[must_use]
    pub fn advisories(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.draft_angle < MIN_DRAFT_ANGLE_DEGREES {
            notes.push(format!(
                "draft angle {}° is below {MIN_DRAFT_ANGLE_DEGREES}°; demolding may be impossible",
                self.draft_angle
            ));
        } else if self.draft_angle > 10.0 {
            notes.push(format!(
                "draft angle {}° is very high and may distort the form",
                self.draft_angle
            ));
        }
        if self.wall_thickness < MIN_WALL_THICKNESS {
            notes.push(format!(
                "wall thickness {} is below {MIN_WALL_THICKNESS} mm; the mold may crack",
                self.wall_thickness
            ));
        } else if self.wall_thickness > 100.0 {
            notes.push(format!(
                "wall thickness {} is excessive; slow drying and wasted material",
                self.wall_thickness
            ));
        }
        notes
    }
}

/// Everything produced for one region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoldResult {
    pub region_id: String,
    pub fitted: FittedSurface,
    pub drafted: NurbsSurface,
    /// Deviation from the limit surface on a lattice denser than the fit samples.
    pub quality: FittingQuality,
    pub draft: DraftAnalysis,
    /// Draft and undercut findings against the limit mesh; advisory only.
    pub constraints: ConstraintReport,
    pub solid: MoldSolid,
    /// `quality` is within the deviation tolerance.
    pub accepted: bool,
}

/// A region that produced no mold, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRegion {
    pub region_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoldSet {
    pub tessellation: Tessellation,
    pub regions: Vec<Region>,
    pub molds: Vec<MoldResult>,
    pub skipped: Vec<SkippedRegion>,
    pub timing: Option<GeomTimingReport>,
}

impl MoldSet {
    #[must_use]
    pub fn all_accepted(&self) -> bool {
        self.skipped.is_empty() && self.molds.iter().all(|m| m.accepted)
    }

    #[must_use]
    pub fn mold(&self, region_id: &str) -> Option<&MoldResult> {
        self.molds.iter().find(|m| m.region_id == region_id)
    }
}

/// Molds built for a list of regions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionMolds {
    pub molds: Vec<MoldResult>,
    pub skipped: Vec<SkippedRegion>,
    pub timing: Option<GeomTimingReport>,
}

pub struct MoldGenerator {
    params: MoldParameters,
    token: CancellationToken,
}

impl MoldGenerator {
    /// # Errors
    /// See [`MoldParameters::validate`].
    pub fn new(params: MoldParameters) -> Result<Self, MoldError> {
        params.validate()?;
        for note in params.advisories() {
            log::warn!("pipeline: {note}");
        }
        Ok(Self {
            params,
            token: CancellationToken::new(),
        })
    }

    /// Uses `token` for every stage of subsequent runs.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn params(&self) -> &MoldParameters {
        &self.params
    }

    /// Runs the whole workflow on a fresh evaluator.
    ///
    /// # Errors
    /// Any stage error except region-local numerical failures, which are recorded in
    /// [`MoldSet::skipped`].
    pub fn generate(&self, cage: &ControlCage) -> Result<MoldSet, MoldError> {
        self.generate_with_pinned(cage, &[])
    }

    /// Like [`generate`](Self::generate), carrying `pinned` regions into segmentation.
    ///
    /// # Errors
    /// See [`generate`](Self::generate).
    pub fn generate_with_pinned(
        &self,
        cage: &ControlCage,
        pinned: &[Region],
    ) -> Result<MoldSet, MoldError> {
        let token = &self.token;
        let mut metrics = GeomMetrics::default();
        metrics.begin();
        log::info!(
            "pipeline: generating molds for cage with {} faces",
            cage.face_count()
        );

        let mut evaluator = SubdivisionEvaluator::new();
        evaluator.initialize(cage)?;
        let tessellation = metrics.time(TimingBucket::Tessellation, || {
            evaluator.tessellate_with_cancel(self.params.tessellation_level, token)
        })?;
        token.check()?;

        let laplacian = metrics.time(TimingBucket::Laplacian, || {
            build_laplacian_with_cancel(&tessellation, token)
        })?;
        let curvature = metrics.time(TimingBucket::Curvature, || {
            compute_curvature_with_cancel(&tessellation, &laplacian, token)
        })?;
        token.check()?;

        let regions = metrics.time(TimingBucket::Segmentation, || {
            segment_with_cancel(
                &tessellation,
                &curvature,
                pinned,
                &self.params.segmentation,
                token,
            )
        })?;
        token.check()?;

        let built = self.build_molds(&evaluator, &tessellation, &regions)?;
        metrics.absorb(built.timing.as_ref());

        log::info!(
            "pipeline: {} molds built, {} regions skipped",
            built.molds.len(),
            built.skipped.len()
        );
        Ok(MoldSet {
            tessellation,
            regions,
            molds: built.molds,
            skipped: built.skipped,
            timing: metrics.end(),
        })
    }

    /// Fits, validates, drafts and thickens each region against `evaluator`'s limit surface.
    ///
    /// # Errors
    /// See [`generate`](Self::generate).
    pub fn build_molds(
        &self,
        evaluator: &SubdivisionEvaluator,
        tessellation: &Tessellation,
        regions: &[Region],
    ) -> Result<RegionMolds, MoldError> {
        log::debug!("pipeline: building molds for {} regions", regions.len());
        let validator = ConstraintValidator::new(tessellation, self.params.constraint_options())?;
        let outcomes = self.run_regions(evaluator, tessellation, &validator, regions)?;

        let mut metrics = GeomMetrics::default();
        metrics.begin();
        let mut built = RegionMolds::default();
        for (region, outcome) in regions.iter().zip(outcomes) {
            match outcome {
                Ok((mold, timing)) => {
                    metrics.absorb(timing.as_ref());
                    built.molds.push(mold);
                }
                Err(err) if err.is_region_local() => {
                    log::warn!("pipeline: region '{}' skipped: {err}", region.id);
                    built.skipped.push(SkippedRegion {
                        region_id: region.id.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        built.timing = metrics.end();
        Ok(built)
    }

    #[cfg(feature = "parallel")]
    fn run_regions(
        &self,
        evaluator: &SubdivisionEvaluator,
        tessellation: &Tessellation,
        validator: &ConstraintValidator<'_>,
        regions: &[Region],
    ) -> Result<Vec<RegionOutcome>, MoldError> {
        self.token.check()?;
        Ok(regions
            .par_iter()
            .map(|region| self.build_mold(evaluator, tessellation, validator, region))
            .collect())
    }

    #[cfg(not(feature = "parallel"))]
    fn run_regions(
        &self,
        evaluator: &SubdivisionEvaluator,
        tessellation: &Tessellation,
        validator: &ConstraintValidator<'_>,
        regions: &[Region],
    ) -> Result<Vec<RegionOutcome>, MoldError> {
        let mut outcomes = Vec::with_capacity(regions.len());
        for region in regions {
            self.token.check()?;
            outcomes.push(self.build_mold(evaluator, tessellation, validator, region));
        }
        Ok(outcomes)
    }

    fn build_mold(
        &self,
        evaluator: &SubdivisionEvaluator,
        tessellation: &Tessellation,
        validator: &ConstraintValidator<'_>,
        region: &Region,
    ) -> RegionOutcome {
        let params = &self.params;
        let mut metrics = GeomMetrics::default();
        metrics.begin();

        let fitted = metrics.time(TimingBucket::Fitting, || {
            fit_region_with_cancel(
                evaluator,
                tessellation,
                region,
                &params.fit_options(),
                &self.token,
            )
        })?;
        let quality = metrics.time(TimingBucket::Validation, || {
            check_region_quality(evaluator, tessellation, region, &fitted.surface, &self.token)
        })?;
        let accepted = quality.is_acceptable(params.deviation_tolerance);
        if !accepted {
            log::warn!(
                "pipeline: region '{}' deviates {:.3e} (tolerance {:.3e})",
                region.id,
                quality.max_deviation,
                params.deviation_tolerance
            );
        }

        let (drafted, draft) = metrics.time(TimingBucket::Draft, || {
            let drafted =
                apply_draft_angle(&fitted.surface, params.draft_angle, &params.draft_options())?;
            let draft = analyze_draft(&drafted, params.demolding_direction, DRAFT_ANALYSIS_GRID)?;
            Ok::<_, DraftError>((drafted, draft))
        })?;
        self.token.check()?;

        let constraints = metrics.time(TimingBucket::Validation, || {
            validator.validate_region(region, params.wall_thickness)
        })?;
        if constraints.has_errors() {
            log::warn!(
                "pipeline: region '{}' has {} manufacturability errors",
                region.id,
                constraints.error_count()
            );
        }

        let solid_options = SolidOptions::default().with_resolution(params.solid_resolution);
        let mut solid = metrics
            .time(TimingBucket::Solid, || {
                create_mold_solid(&drafted, params.wall_thickness, &solid_options)
            })?
            .with_draft_angle(params.draft_angle);
        if params.add_registration_keys {
            solid = metrics.time(TimingBucket::Keys, || {
                add_registration_keys(&solid, params.key_count, &params.key_geometry)
            })?;
        }

        log::debug!(
            "pipeline: region '{}' mold with {} triangles, accepted {accepted}",
            region.id,
            solid.solid.triangle_count()
        );
        Ok((
            MoldResult {
                region_id: region.id.clone(),
                fitted,
                drafted,
                quality,
                draft,
                constraints,
                solid,
                accepted,
            },
            metrics.end(),
        ))
    }
}

type RegionOutcome = Result<(MoldResult, Option<GeomTimingReport>), MoldError>;

/// One drafted mold surface in the exchange format: flattened knots, control points in
/// `u`-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoldSurfaceExport {
    pub name: String,
    pub region_id: String,
    pub degree_u: usize,
    pub degree_v: usize,
    pub count_u: usize,
    pub count_v: usize,
    pub knots_u: Vec<f64>,
    pub knots_v: Vec<f64>,
    pub control_points: Vec<[f64; 3]>,
    pub weights: Vec<f64>,
    pub draft_angle: f64,
}

impl MoldSurfaceExport {
    #[must_use]
    pub fn from_surface(surface: &NurbsSurface, region_id: &str, draft_angle: f64) -> Self {
        let mut control_points = Vec::with_capacity(surface.control_points.len());
        let mut weights = Vec::with_capacity(surface.control_points.len());
        for i in 0..surface.u_count {
            for j in 0..surface.v_count {
                control_points.push(surface.control_point(i, j).to_array());
                let weight = surface
                    .weights
                    .as_ref()
                    .and_then(|w| w.get(j * surface.u_count + i).copied())
                    .unwrap_or(1.0);
                weights.push(weight);
            }
        }
        Self {
            name: format!("mold_{region_id}"),
            region_id: region_id.to_string(),
            degree_u: surface.degree_u,
            degree_v: surface.degree_v,
            count_u: surface.u_count,
            count_v: surface.v_count,
            knots_u: surface.knots_u.clone(),
            knots_v: surface.knots_v.clone(),
            control_points,
            weights,
            draft_angle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub draft_angle: f64,
    pub wall_thickness: f64,
    pub demolding_direction: [f64; 3],
    pub key_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoldSetExport {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub molds: Vec<MoldSurfaceExport>,
    pub metadata: ExportMetadata,
    /// RFC 3339.
    pub timestamp: String,
}

impl MoldSetExport {
    /// # Errors
    /// `Timestamp` if `generated_at` cannot be formatted as RFC 3339.
    pub fn new(
        set: &MoldSet,
        params: &MoldParameters,
        generated_at: OffsetDateTime,
    ) -> Result<Self, MoldError> {
        let timestamp = generated_at
            .format(&Rfc3339)
            .map_err(|err| MoldError::Timestamp(err.to_string()))?;
        let molds = set
            .molds
            .iter()
            .map(|m| MoldSurfaceExport::from_surface(&m.drafted, &m.region_id, params.draft_angle))
            .collect();
        Ok(Self {
            kind: EXPORT_TYPE.to_string(),
            version: EXPORT_VERSION.to_string(),
            molds,
            metadata: ExportMetadata {
                draft_angle: params.draft_angle,
                wall_thickness: params.wall_thickness,
                demolding_direction: params.demolding_direction.to_array(),
                key_count: if params.add_registration_keys {
                    params.key_count
                } else {
                    0
                },
            },
            timestamp,
        })
    }
}
