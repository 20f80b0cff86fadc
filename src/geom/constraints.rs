//! Manufacturability checks of a region against the demolding direction.
//!
//! Draft is read from the triangle normals under the region. Undercuts are found by
//! casting a ray along the demolding direction from each triangle centroid against the
//! whole tessellation: a hit means some other part of the form sits in the way of the
//! mold piece being pulled off. Results are grouped per cage face and collected in a
//! [`ConstraintReport`], which is advisory and never blocks mold building.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bvh::{Bvh, ray_triangle_hit};
use super::mesh::Tessellation;
use super::segmentation::Region;
use super::{BBox, Point3, Tolerance, Vec3};

/// Draft below this cannot be demolded.
pub const MIN_DRAFT_ANGLE_DEGREES: f64 = 0.5;
/// Draft below this demolds poorly.
pub const RECOMMENDED_DRAFT_ANGLE_DEGREES: f64 = 2.0;
/// Plaster walls thinner than this tend to crack.
pub const MIN_WALL_THICKNESS: f64 = 30.0;

/// Fraction of occluded samples above which a cage face counts as undercut.
const UNDERCUT_RATIO: f64 = 0.1;
/// Ray start offset along the demolding direction, relative to the mesh diagonal.
const RAY_OFFSET: f64 = 1e-6;

const ERROR_SUGGESTION: &str =
    "This region requires revision to eliminate physical impossibility";
const WARNING_SUGGESTION: &str = "Consider adjusting geometry for better manufacturability";
const FEATURE_SUGGESTION: &str = "This is an aesthetic feature - mathematical tension";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConstraintError {
    #[error("demolding direction must be a non-zero finite vector")]
    InvalidDirection,

    #[error("minimum wall thickness {thickness} must be finite and non-negative")]
    InvalidThickness { thickness: f64 },

    #[error("invalid tessellation: {0}")]
    InvalidTessellation(String),

    #[error("region '{region}' references triangle {triangle} of {count}")]
    TriangleOutOfRange {
        region: String,
        triangle: usize,
        count: usize,
    },
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintLevel {
    /// Physically impossible to cast as is.
    Error,
    /// Castable, with difficulty.
    Warning,
    /// Intended tension in the form, recorded for the designer.
    Feature,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintViolation {
    pub level: ConstraintLevel,
    pub description: String,
    /// Cage face the finding concerns; `None` for region-wide findings.
    pub face: Option<usize>,
    /// In `[0, 1]`.
    pub severity: f64,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConstraintReport {
    pub violations: Vec<ConstraintViolation>,
}

impl ConstraintReport {
    pub fn add_error(&mut self, description: String, face: Option<usize>, severity: f64) {
        self.push(ConstraintLevel::Error, description, face, severity, ERROR_SUGGESTION);
    }

    pub fn add_warning(&mut self, description: String, face: Option<usize>, severity: f64) {
        self.push(ConstraintLevel::Warning, description, face, severity, WARNING_SUGGESTION);
    }

    pub fn add_feature(&mut self, description: String, face: Option<usize>) {
        self.push(ConstraintLevel::Feature, description, face, 0.0, FEATURE_SUGGESTION);
    }

    fn push(
        &mut self,
        level: ConstraintLevel,
        description: String,
        face: Option<usize>,
        severity: f64,
        suggestion: &str,
    ) {
        self.violations.push(ConstraintViolation {
            level,
            description,
            face,
            severity: if severity.is_finite() {
                severity.clamp(0.0, 1.0)
            } else {
                1.0
            },
            suggestion: suggestion.to_string(),
        });
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        self.warning_count() > 0
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(ConstraintLevel::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count(ConstraintLevel::Warning)
    }

    fn count(&self, level: ConstraintLevel) -> usize {
        self.violations.iter().filter(|v| v.level == level).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstraintViolation> {
        self.violations.iter()
    }
}

// ============================================================================
// Validator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintOptions {
    pub demolding_direction: Vec3,
    pub min_wall_thickness: f64,
}

impl Default for ConstraintOptions {
    fn default() -> Self {
        Self {
            demolding_direction: Vec3::Z,
            min_wall_thickness: MIN_WALL_THICKNESS,
        }
    }
}

impl ConstraintOptions {
    #[must_use]
    pub fn with_demolding_direction(mut self, direction: Vec3) -> Self {
        self.demolding_direction = direction;
        self
    }

    #[must_use]
    pub fn with_min_wall_thickness(mut self, thickness: f64) -> Self {
        self.min_wall_thickness = thickness;
        self
    }
}

/// Occlusion of one cage face's samples along the demolding direction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UndercutScan {
    pub samples: usize,
    pub occluded: usize,
    /// Largest of `1 / (1 + distance)` over blocked rays and `−n·d` over samples facing
    /// against the direction.
    pub max_severity: f64,
}

impl UndercutScan {
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.occluded as f64 / self.samples as f64
        }
    }
}

/// Checks regions of one tessellation; the ray hierarchy is built once and shared.
#[derive(Debug)]
pub struct ConstraintValidator<'a> {
    tessellation: &'a Tessellation,
    direction: Vec3,
    min_wall_thickness: f64,
    bvh: Option<Bvh>,
    offset: f64,
}

impl<'a> ConstraintValidator<'a> {
    /// # Errors
    /// `InvalidDirection`, `InvalidThickness`, or `InvalidTessellation` when indices or
    /// coordinates are broken.
    pub fn new(
        tessellation: &'a Tessellation,
        options: ConstraintOptions,
    ) -> Result<Self, ConstraintError> {
        let direction = options
            .demolding_direction
            .normalized()
            .filter(|d| d.is_finite())
            .ok_or(ConstraintError::InvalidDirection)?;
        let min_wall_thickness = options.min_wall_thickness;
        if !min_wall_thickness.is_finite() || min_wall_thickness < 0.0 {
            return Err(ConstraintError::InvalidThickness {
                thickness: min_wall_thickness,
            });
        }
        tessellation
            .validate()
            .map_err(ConstraintError::InvalidTessellation)?;

        let diagonal = BBox::from_points(&tessellation.positions)
            .map_or(0.0, |bbox| bbox.max.distance_to(bbox.min));
        let bvh = Bvh::over_triangles(
            &tessellation.positions,
            &tessellation.triangles,
            Tolerance::DEFAULT.eps,
        );
        Ok(Self {
            tessellation,
            direction,
            min_wall_thickness,
            bvh,
            offset: RAY_OFFSET * diagonal,
        })
    }

    /// Smallest draft under the region per cage face, in degrees: `90° − ∠(n, d)`.
    /// Negative values face against the demolding direction.
    ///
    /// # Errors
    /// `TriangleOutOfRange` for a region triangle outside the tessellation.
    pub fn draft_angles(&self, region: &Region) -> Result<BTreeMap<usize, f64>, ConstraintError> {
        let mut drafts: BTreeMap<usize, f64> = BTreeMap::new();
        for &t in &region.faces {
            self.check_triangle(region, t)?;
            let Some(normal) = self.triangle_normal(t) else {
                continue;
            };
            let angle = normal.dot(self.direction).clamp(-1.0, 1.0).acos();
            let draft = 90.0 - angle.to_degrees();
            let face = self.tessellation.face_parents[t];
            drafts
                .entry(face)
                .and_modify(|d| *d = d.min(draft))
                .or_insert(draft);
        }
        Ok(drafts)
    }

    /// Rays along the demolding direction from each region triangle, per cage face.
    ///
    /// # Errors
    /// `TriangleOutOfRange` for a region triangle outside the tessellation.
    pub fn undercuts(&self, region: &Region) -> Result<BTreeMap<usize, UndercutScan>, ConstraintError> {
        let mut scans: BTreeMap<usize, UndercutScan> = BTreeMap::new();
        for &t in &region.faces {
            self.check_triangle(region, t)?;
            let Some(normal) = self.triangle_normal(t) else {
                continue;
            };
            let scan = scans.entry(self.tessellation.face_parents[t]).or_default();
            scan.samples += 1;

            let alignment = normal.dot(self.direction);
            if alignment < 0.0 {
                scan.max_severity = scan.max_severity.max(-alignment);
            }
            if let Some(distance) = self.blocking_distance(t) {
                scan.occluded += 1;
                scan.max_severity = scan.max_severity.max(1.0 / (1.0 + distance));
            }
        }
        Ok(scans)
    }

    /// Draft, undercut and wall-thickness findings for one region.
    ///
    /// # Errors
    /// `TriangleOutOfRange` for a region triangle outside the tessellation.
    pub fn validate_region(
        &self,
        region: &Region,
        wall_thickness: f64,
    ) -> Result<ConstraintReport, ConstraintError> {
        let mut report = ConstraintReport::default();

        for (face, draft) in self.draft_angles(region)? {
            if draft < MIN_DRAFT_ANGLE_DEGREES {
                report.add_error(
                    format!(
                        "Draft angle {draft:.2}° is below the {MIN_DRAFT_ANGLE_DEGREES}° minimum"
                    ),
                    Some(face),
                    1.0 - draft / MIN_DRAFT_ANGLE_DEGREES,
                );
            } else if draft < RECOMMENDED_DRAFT_ANGLE_DEGREES {
                report.add_warning(
                    format!(
                        "Draft angle {draft:.2}° is below the recommended \
                         {RECOMMENDED_DRAFT_ANGLE_DEGREES}°"
                    ),
                    Some(face),
                    1.0 - draft / RECOMMENDED_DRAFT_ANGLE_DEGREES,
                );
            }
        }

        for (face, scan) in self.undercuts(region)? {
            let ratio = scan.ratio();
            if ratio > UNDERCUT_RATIO {
                report.add_error(
                    format!(
                        "Undercut detected on {:.0}% of face {face} - requires additional mold \
                         piece",
                        ratio * 100.0
                    ),
                    Some(face),
                    scan.max_severity * ratio,
                );
            }
        }

        if wall_thickness < self.min_wall_thickness {
            report.add_warning(
                format!(
                    "Wall thickness {wall_thickness} is below the {} minimum",
                    self.min_wall_thickness
                ),
                None,
                1.0 - wall_thickness / self.min_wall_thickness,
            );
        }

        log::debug!(
            "constraints: region '{}' has {} errors, {} warnings",
            region.id,
            report.error_count(),
            report.warning_count()
        );
        Ok(report)
    }

    fn check_triangle(&self, region: &Region, triangle: usize) -> Result<(), ConstraintError> {
        let count = self.tessellation.triangle_count();
        if triangle < count {
            Ok(())
        } else {
            Err(ConstraintError::TriangleOutOfRange {
                region: region.id.clone(),
                triangle,
                count,
            })
        }
    }

    fn triangle_normal(&self, triangle: usize) -> Option<Vec3> {
        let [a, b, c] = self.tessellation.triangle_points(triangle);
        b.sub_point(a).cross(c.sub_point(a)).normalized()
    }

    /// Distance to the nearest other triangle above the centroid of `triangle`.
    fn blocking_distance(&self, triangle: usize) -> Option<f64> {
        let bvh = self.bvh.as_ref()?;
        let points = self.tessellation.triangle_points(triangle);
        let centroid = Point3::centroid(&points)?;
        let origin = centroid.add_vec(self.direction.mul_scalar(self.offset));

        let mut nearest: Option<f64> = None;
        bvh.query_ray(origin, self.direction, 0.0, f64::INFINITY, |candidate| {
            if candidate != triangle {
                let hit = ray_triangle_hit(
                    origin,
                    self.direction,
                    self.tessellation.triangle_points(candidate),
                    Tolerance::DEFAULT,
                );
                if let Some(t) = hit.filter(|&t| t > Tolerance::DEFAULT.eps) {
                    nearest = Some(nearest.map_or(t, |n| n.min(t)));
                }
            }
            true
        });
        nearest.map(|t| t + self.offset)
    }
}
