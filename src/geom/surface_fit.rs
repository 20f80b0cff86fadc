//! Least-squares NURBS fitting of one segmented region against the limit surface.
//!
//! Samples come from exact limit evaluation inside the region's own triangles, not from
//! the tessellation's vertices. They are parameterized on their principal plane and fit by
//! a clamped uniform B-spline net with a divided second-difference smoothing term.

use std::collections::{BTreeSet, HashSet, VecDeque};

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

use super::cancel::{CancellationToken, Cancelled};
use super::mesh::Tessellation;
use super::segmentation::Region;
use super::subdivision::{SubdivisionError, SubdivisionEvaluator};
use super::surface::{NurbsSurface, basis_row, clamped_uniform_knots};
use super::{Point3, Tolerance, Vec3};

/// Smallest accepted samples-per-face-edge.
pub const MIN_SAMPLE_DENSITY: usize = 2;

/// Singular values below this are treated as zero in the least-squares solve.
const SVD_EPSILON: f64 = 1e-12;

/// Face parameters closer than `1 / PARAM_KEY_SCALE` are one sample.
const PARAM_KEY_SCALE: f64 = 1e9;

/// Slack when rounding a triangle's lattice steps up.
const STEP_SLACK: f64 = 1e-9;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SurfaceFitError {
    #[error("sample density {density} is below the minimum of {minimum}")]
    InsufficientSamples { density: usize, minimum: usize },

    #[error("fit of region '{region}' failed: {reason}")]
    FitFailed { region: String, reason: String },

    #[error("invalid fit options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Subdivision(#[from] SubdivisionError),

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },

    #[error("fitting cancelled")]
    Cancelled,
}

impl From<Cancelled> for SurfaceFitError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Requested degree in both directions, lowered to `control_points − 1` if needed.
    pub degree: usize,
    /// Control points per direction.
    pub control_points: usize,
    /// Samples per cage-face edge; a region samples only the part of each face it covers.
    pub sample_density: usize,
    /// Weight of the second-difference smoothing rows.
    pub smoothing: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            degree: 3,
            control_points: 6,
            sample_density: 8,
            smoothing: 1e-4,
        }
    }
}

impl FitOptions {
    #[must_use]
    pub fn with_degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    #[must_use]
    pub fn with_control_points(mut self, count: usize) -> Self {
        self.control_points = count;
        self
    }

    #[must_use]
    pub fn with_sample_density(mut self, density: usize) -> Self {
        self.sample_density = density;
        self
    }

    #[must_use]
    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// # Errors
    /// `InsufficientSamples` below [`MIN_SAMPLE_DENSITY`], `InvalidOptions` otherwise.
    pub fn validate(&self) -> Result<(), SurfaceFitError> {
        if self.sample_density < MIN_SAMPLE_DENSITY {
            return Err(SurfaceFitError::InsufficientSamples {
                density: self.sample_density,
                minimum: MIN_SAMPLE_DENSITY,
            });
        }
        if self.degree == 0 {
            return Err(SurfaceFitError::InvalidOptions("degree must be >= 1".to_string()));
        }
        if self.control_points < 2 {
            return Err(SurfaceFitError::InvalidOptions(
                "at least 2 control points per direction are required".to_string(),
            ));
        }
        if !self.smoothing.is_finite() || self.smoothing < 0.0 {
            return Err(SurfaceFitError::InvalidOptions(
                "smoothing must be finite and >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A fitted region surface with the limit samples it was fit to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FittedSurface {
    pub surface: NurbsSurface,
    pub region_id: String,
    pub sample_density: usize,
    pub samples: Vec<Point3>,
}

// ============================================================================
// Fitting
// ============================================================================

/// Fits `region` with default options at the given sample density.
///
/// # Errors
/// See [`fit_region_with_cancel`].
pub fn fit(
    evaluator: &SubdivisionEvaluator,
    tessellation: &Tessellation,
    region: &Region,
    sample_density: usize,
) -> Result<FittedSurface, SurfaceFitError> {
    let options = FitOptions::default().with_sample_density(sample_density);
    fit_region(evaluator, tessellation, region, &options)
}

/// # Errors
/// See [`fit_region_with_cancel`].
pub fn fit_region(
    evaluator: &SubdivisionEvaluator,
    tessellation: &Tessellation,
    region: &Region,
    options: &FitOptions,
) -> Result<FittedSurface, SurfaceFitError> {
    fit_region_with_cancel(evaluator, tessellation, region, options, &CancellationToken::new())
}

/// Samples the limit surface under `region` and fits a NURBS patch to it.
///
/// # Errors
/// - `InsufficientSamples` / `InvalidOptions` before any work starts.
/// - `FitFailed` for empty, disconnected or zero-area face sets, collinear samples, or
///   a failed solve.
/// - `Subdivision` if limit evaluation fails, `Cancelled` between triangles.
pub fn fit_region_with_cancel(
    evaluator: &SubdivisionEvaluator,
    tessellation: &Tessellation,
    region: &Region,
    options: &FitOptions,
    token: &CancellationToken,
) -> Result<FittedSurface, SurfaceFitError> {
    options.validate()?;
    let failed = |reason: String| SurfaceFitError::FitFailed {
        region: region.id.clone(),
        reason,
    };

    if region.faces.is_empty() {
        return Err(failed("region has no faces".to_string()));
    }
    if let Some(&t) = region.faces.iter().find(|&&t| t >= tessellation.triangle_count()) {
        return Err(failed(format!("triangle {t} is outside the tessellation")));
    }
    let components = connected_components(tessellation, &region.faces);
    if components != 1 {
        return Err(failed(format!("face set is disconnected ({components} components)")));
    }
    let area: f64 = region.faces.iter().map(|&t| tessellation.triangle_area(t)).sum();
    if area <= Tolerance::ZERO_LENGTH.eps {
        return Err(failed(format!("region area {area:e} is degenerate")));
    }

    log::debug!(
        "surface_fit: region '{}' with {} triangles, density {}",
        region.id,
        region.faces.len(),
        options.sample_density
    );

    let samples =
        sample_region_limit(evaluator, tessellation, region, options.sample_density, token)?;
    let reference_normal = region
        .faces
        .iter()
        .map(|&t| {
            let [a, b, c] = tessellation.triangle_points(t);
            b.sub_point(a).cross(c.sub_point(a))
        })
        .fold(Vec3::ZERO, |acc, n| acc + n);

    let params = principal_parameters(&samples, reference_normal).map_err(failed)?;
    token.check()?;

    let n = options.control_points;
    let degree = options.degree.min(n - 1);
    let control_points = solve_control_net(&samples, &params, n, degree, options.smoothing)
        .map_err(failed)?;
    if control_points.iter().any(|p| !p.is_finite()) {
        return Err(SurfaceFitError::NonFinite {
            stage: "control net solve",
        });
    }
    let surface = NurbsSurface::clamped_uniform(degree, degree, n, n, control_points).map_err(failed)?;

    log::debug!(
        "surface_fit: region '{}' fit {n}x{n} degree {degree} to {} samples",
        region.id,
        samples.len()
    );
    Ok(FittedSurface {
        surface,
        region_id: region.id.clone(),
        sample_density: options.sample_density,
        samples,
    })
}

/// Edge-connected components among `faces`.
fn connected_components(tessellation: &Tessellation, faces: &[usize]) -> usize {
    let neighbors = tessellation.triangle_neighbors();
    let members: BTreeSet<usize> = faces.iter().copied().collect();
    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut components = 0;
    for &start in &members {
        if !seen.insert(start) {
            continue;
        }
        components += 1;
        let mut queue = VecDeque::from([start]);
        while let Some(t) = queue.pop_front() {
            for &n in neighbors[t].iter().flatten() {
                if members.contains(&n) && seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
    }
    components
}

/// Samples the exact limit surface under `region`, triangle by triangle.
///
/// Each triangle gets a barycentric lattice whose spacing in face parameters is about
/// `1 / (density − 1)`, so a whole cage face sampled this way yields a
/// `density × density` grid and a partial face yields only the part the region covers.
/// Points shared by neighbouring triangles are evaluated once.
///
/// # Errors
/// `FitFailed` when the tessellation carries no corner parameters or the region points
/// outside it, `Subdivision` if limit evaluation fails, `Cancelled` between triangles.
pub fn sample_region_limit(
    evaluator: &SubdivisionEvaluator,
    tessellation: &Tessellation,
    region: &Region,
    density: usize,
    token: &CancellationToken,
) -> Result<Vec<Point3>, SurfaceFitError> {
    let failed = |reason: String| SurfaceFitError::FitFailed {
        region: region.id.clone(),
        reason,
    };
    if density < MIN_SAMPLE_DENSITY {
        return Err(SurfaceFitError::InsufficientSamples {
            density,
            minimum: MIN_SAMPLE_DENSITY,
        });
    }
    if !tessellation.has_corner_params() {
        return Err(failed("tessellation has no face parameters".to_string()));
    }

    let spacing = (density - 1) as f64;
    let mut seen: HashSet<(usize, i64, i64)> = HashSet::new();
    let mut samples = Vec::new();
    for &t in &region.faces {
        token.check()?;
        let (Some(&face), Some(corners)) =
            (tessellation.face_parents.get(t), tessellation.corner_params.get(t))
        else {
            return Err(failed(format!("triangle {t} is outside the tessellation")));
        };

        let extent = (0..3)
            .flat_map(|i| (i + 1..3).map(move |j| (i, j)))
            .map(|(i, j)| {
                (corners[i][0] - corners[j][0])
                    .abs()
                    .max((corners[i][1] - corners[j][1]).abs())
            })
            .fold(0.0, f64::max);
        let steps = ((extent * spacing - STEP_SLACK).ceil() as usize).max(1);

        for i in 0..=steps {
            for j in 0..=steps - i {
                let weights = [
                    (steps - i - j) as f64 / steps as f64,
                    i as f64 / steps as f64,
                    j as f64 / steps as f64,
                ];
                let (u, v) = evaluator.triangle_params(face, corners, weights)?;
                let key = (
                    face,
                    (u * PARAM_KEY_SCALE).round() as i64,
                    (v * PARAM_KEY_SCALE).round() as i64,
                );
                if seen.insert(key) {
                    samples.push(evaluator.evaluate_limit_point(face, u, v)?.position);
                }
            }
        }
    }
    Ok(samples)
}

/// Projects samples onto their two dominant principal axes and rescales into `[0, 1]²`.
/// The frame is flipped so that `e1 × e2` agrees with `reference_normal`.
fn principal_parameters(
    samples: &[Point3],
    reference_normal: Vec3,
) -> Result<Vec<(f64, f64)>, String> {
    let centroid = Point3::centroid(samples).ok_or_else(|| "no samples".to_string())?;
    let mut covariance = Matrix3::zeros();
    for p in samples {
        let d = p.sub_point(centroid);
        let d = Vector3::new(d.x, d.y, d.z);
        covariance += d * d.transpose();
    }
    covariance /= samples.len() as f64;

    let eigen = SymmetricEigen::new(covariance);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let largest = eigen.eigenvalues[order[0]];
    let second = eigen.eigenvalues[order[1]];
    if largest <= Tolerance::ZERO_LENGTH.eps || second <= largest * 1e-10 {
        return Err(format!(
            "samples are collinear or coincident (principal variances {largest:e}, {second:e})"
        ));
    }

    let axis = |k: usize| {
        let c = eigen.eigenvectors.column(order[k]);
        Vec3::new(c[0], c[1], c[2])
    };
    let e1 = axis(0);
    let mut e2 = axis(1);
    if e1.cross(e2).dot(reference_normal) < 0.0 {
        e2 = -e2;
    }

    let projected: Vec<(f64, f64)> = samples
        .iter()
        .map(|p| {
            let d = p.sub_point(centroid);
            (d.dot(e1), d.dot(e2))
        })
        .collect();
    let (s_min, s_max) = min_max(projected.iter().map(|p| p.0));
    let (t_min, t_max) = min_max(projected.iter().map(|p| p.1));
    let s_span = s_max - s_min;
    let t_span = t_max - t_min;
    if s_span <= Tolerance::DEFAULT.eps || t_span <= Tolerance::DEFAULT.eps {
        return Err("sample parameter span is degenerate".to_string());
    }

    Ok(projected
        .into_iter()
        .map(|(s, t)| ((s - s_min) / s_span, (t - t_min) / t_span))
        .collect())
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
        (lo.min(x), hi.max(x))
    })
}

/// Solves the `n × n` control net in the least-squares sense with one SVD for all three
/// coordinates.
fn solve_control_net(
    samples: &[Point3],
    params: &[(f64, f64)],
    n: usize,
    degree: usize,
    smoothing: f64,
) -> Result<Vec<Point3>, String> {
    let knots = clamped_uniform_knots(n, degree);
    let greville: Vec<f64> = (0..n)
        .map(|i| knots[i + 1..=i + degree].iter().sum::<f64>() / degree as f64)
        .collect();

    let smoothing_rows = if smoothing > 0.0 && n >= 3 { 2 * n * (n - 2) } else { 0 };
    let rows = samples.len() + smoothing_rows;
    let unknowns = n * n;
    let mut matrix = DMatrix::<f64>::zeros(rows, unknowns);
    let mut rhs = DMatrix::<f64>::zeros(rows, 3);

    for (r, (&(u, v), p)) in params.iter().zip(samples).enumerate() {
        let bu = basis_row(&knots, degree, n, u);
        let bv = basis_row(&knots, degree, n, v);
        for (l, &nv) in bv.values.iter().enumerate() {
            for (k, &nu) in bu.values.iter().enumerate() {
                matrix[(r, (bv.first + l) * n + bu.first + k)] += nu * nv;
            }
        }
        rhs[(r, 0)] = p.x;
        rhs[(r, 1)] = p.y;
        rhs[(r, 2)] = p.z;
    }

    if smoothing_rows > 0 {
        // Divided second differences vanish on nets sampled from linear functions.
        let weights: Vec<[f64; 3]> = (1..n - 1)
            .map(|i| {
                let left = greville[i] - greville[i - 1];
                let right = greville[i + 1] - greville[i];
                [1.0 / left, -(1.0 / left + 1.0 / right), 1.0 / right]
            })
            .collect();
        let mut r = samples.len();
        for fixed in 0..n {
            for (m, w) in weights.iter().enumerate() {
                for (offset, &coefficient) in w.iter().enumerate() {
                    let moving = m + offset;
                    matrix[(r, fixed * n + moving)] = smoothing * coefficient;
                    matrix[(r + 1, moving * n + fixed)] = smoothing * coefficient;
                }
                r += 2;
            }
        }
    }

    let svd = matrix.svd(true, true);
    let solution = svd
        .solve(&rhs, SVD_EPSILON)
        .map_err(|e| format!("least-squares solve failed: {e}"))?;

    Ok((0..unknowns)
        .map(|idx| Point3::new(solution[(idx, 0)], solution[(idx, 1)], solution[(idx, 2)]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_parameters_unit_square() {
        let samples = vec![
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(2.0, 0.0, 1.0),
            Point3::new(2.0, 1.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        ];
        let params = principal_parameters(&samples, Vec3::Z).unwrap();
        for (s, t) in params {
            assert!((0.0..=1.0).contains(&s) && (0.0..=1.0).contains(&t));
        }
    }

    #[test]
    fn test_principal_parameters_rejects_collinear() {
        let samples: Vec<Point3> = (0..5).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        assert!(principal_parameters(&samples, Vec3::Z).is_err());
    }
}
