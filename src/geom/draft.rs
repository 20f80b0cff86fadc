//! Draft-angle offset of fitted mold faces and draft analysis.
//!
//! A control point at height `h` above the parting plane moves `|h|·tan(angle)` along the
//! surface normal taken at its Greville parameters, so the taper grows linearly with
//! distance from the parting line. Knots and weights are kept.

use serde::{Deserialize, Serialize};

use super::surface::{NurbsSurface, Surface};
use super::{Point3, Vec3};

/// Draft angles at or beyond this are rejected.
pub const MAX_DRAFT_ANGLE_DEGREES: f64 = 90.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DraftError {
    #[error("draft angle {angle}° must be finite and within [0, 90)")]
    InvalidDraftAngle { angle: f64 },

    #[error("demolding direction must be a non-zero finite vector")]
    InvalidDirection,

    #[error("drafted surface is invalid: {0}")]
    InvalidSurface(String),

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftOptions {
    pub demolding_direction: Vec3,
    /// Point on the parting plane; the lowest control point when `None`.
    pub parting_origin: Option<Point3>,
}

impl Default for DraftOptions {
    fn default() -> Self {
        Self {
            demolding_direction: Vec3::Z,
            parting_origin: None,
        }
    }
}

impl DraftOptions {
    #[must_use]
    pub fn with_demolding_direction(mut self, direction: Vec3) -> Self {
        self.demolding_direction = direction;
        self
    }

    #[must_use]
    pub fn with_parting_origin(mut self, origin: Point3) -> Self {
        self.parting_origin = Some(origin);
        self
    }
}

/// Offsets `surface` by a draft of `angle_degrees`.
///
/// # Errors
/// `InvalidDraftAngle` for negative, non-finite or ≥ 90° angles, `InvalidDirection` for a
/// zero demolding direction, `NonFinite` / `InvalidSurface` if the result is unusable.
pub fn apply_draft_angle(
    surface: &NurbsSurface,
    angle_degrees: f64,
    options: &DraftOptions,
) -> Result<NurbsSurface, DraftError> {
    if !angle_degrees.is_finite() || !(0.0..MAX_DRAFT_ANGLE_DEGREES).contains(&angle_degrees) {
        return Err(DraftError::InvalidDraftAngle {
            angle: angle_degrees,
        });
    }
    let direction = options
        .demolding_direction
        .normalized()
        .ok_or(DraftError::InvalidDirection)?;

    let height = |p: Point3, origin: Point3| p.sub_point(origin).dot(direction);
    let origin = match options.parting_origin {
        Some(origin) => origin,
        None => surface
            .control_points
            .iter()
            .copied()
            .min_by(|a, b| height(*a, Point3::ORIGIN).total_cmp(&height(*b, Point3::ORIGIN)))
            .ok_or(DraftError::InvalidSurface("surface has no control points".to_string()))?,
    };

    let tan_angle = angle_degrees.to_radians().tan();
    log::debug!(
        "draft: {angle_degrees}° over {}x{} control net",
        surface.u_count,
        surface.v_count
    );

    let mut control_points = Vec::with_capacity(surface.control_points.len());
    let mut fallback_normals = 0;
    for j in 0..surface.v_count {
        let v = surface.greville_v(j);
        for i in 0..surface.u_count {
            let u = surface.greville_u(i);
            let p = surface.control_point(i, j);
            let offset = height(p, origin).abs() * tan_angle;
            let normal = surface.normal_at(u, v).unwrap_or_else(|| {
                fallback_normals += 1;
                direction
            });
            control_points.push(p + normal * offset);
        }
    }
    if fallback_normals > 0 {
        log::warn!("draft: {fallback_normals} control points used the demolding direction");
    }
    if control_points.iter().any(|p| !p.is_finite()) {
        return Err(DraftError::NonFinite { stage: "draft offset" });
    }

    surface
        .with_control_points(control_points)
        .map_err(DraftError::InvalidSurface)
}

/// Draft measured at one surface sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DraftSample {
    pub u: f64,
    pub v: f64,
    /// `90° − ∠(normal, direction)`; negative values are undercuts.
    pub angle_degrees: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftAnalysis {
    pub samples: Vec<DraftSample>,
    pub min_angle: f64,
    pub max_angle: f64,
    /// Samples whose draft is negative.
    pub undercuts: usize,
}

impl DraftAnalysis {
    /// True when every sample drafts at least `required_degrees`.
    #[must_use]
    pub fn meets(&self, required_degrees: f64) -> bool {
        self.min_angle >= required_degrees
    }
}

/// Samples draft angles on a `grid × grid` lattice over the surface domain.
///
/// # Errors
/// `InvalidDirection` for a zero direction.
pub fn analyze_draft(
    surface: &impl Surface,
    direction: Vec3,
    grid: usize,
) -> Result<DraftAnalysis, DraftError> {
    let direction = direction.normalized().ok_or(DraftError::InvalidDirection)?;
    let grid = grid.max(2);
    let (u0, u1) = surface.domain_u();
    let (v0, v1) = surface.domain_v();

    let mut samples = Vec::with_capacity(grid * grid);
    for j in 0..grid {
        let v = v0 + (v1 - v0) * j as f64 / (grid - 1) as f64;
        for i in 0..grid {
            let u = u0 + (u1 - u0) * i as f64 / (grid - 1) as f64;
            let Some(angle) = surface
                .normal_at(u, v)
                .and_then(|normal| normal.angle_to(direction))
            else {
                continue;
            };
            samples.push(DraftSample {
                u,
                v,
                angle_degrees: 90.0 - angle.to_degrees(),
            });
        }
    }

    let (min_angle, max_angle) = samples.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY),
        |(lo, hi), s| (lo.min(s.angle_degrees), hi.max(s.angle_degrees)),
    );
    let undercuts = samples.iter().filter(|s| s.angle_degrees < 0.0).count();
    Ok(DraftAnalysis {
        samples,
        min_angle,
        max_angle,
        undercuts,
    })
}
