//! Discrete curvature from the cotangent Laplacian and mixed Voronoi areas.
//!
//! - Gaussian curvature `K` is the angle defect `2π − Σθ` divided by the mixed area.
//! - Mean curvature `H` is `|L x| / 2A`, positive when `L x` points against the vertex
//!   normal (convex surface, outward normals).
//! - Principal curvatures are `κ1,2 = H ± √(H² − K)`.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::cancel::CancellationToken;
use super::laplacian::{AnalysisError, LaplacianOperator, mixed_areas};
use super::mesh::Tessellation;
use super::{Tolerance, Vec3};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Thresholds separating the four curvature classes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvatureThresholds {
    pub gaussian: f64,
    pub mean: f64,
}

impl Default for CurvatureThresholds {
    fn default() -> Self {
        Self {
            gaussian: 0.01,
            mean: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CurvatureClass {
    /// `K > 0`: bowl-like.
    Elliptic,
    /// `K < 0`: saddle-like.
    Hyperbolic,
    /// `K ≈ 0`, `H ≠ 0`: cylindrical, developable.
    Parabolic,
    /// `K ≈ 0`, `H ≈ 0`.
    Planar,
}

impl CurvatureClass {
    #[must_use]
    pub fn classify(gaussian: f64, mean: f64, thresholds: CurvatureThresholds) -> Self {
        if gaussian.abs() < thresholds.gaussian {
            if mean.abs() < thresholds.mean {
                Self::Planar
            } else {
                Self::Parabolic
            }
        } else if gaussian > 0.0 {
            Self::Elliptic
        } else {
            Self::Hyperbolic
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Elliptic => "bowl-like curvature (convex/concave)",
            Self::Hyperbolic => "saddle-like curvature (anticlastic)",
            Self::Parabolic => "cylindrical curvature (developable)",
            Self::Planar => "flat/minimal curvature",
        }
    }
}

/// Per-vertex curvature measures. All vectors have one entry per tessellation vertex.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CurvatureField {
    pub mean: Vec<f64>,
    pub gaussian: Vec<f64>,
    /// Larger principal curvature.
    pub k1: Vec<f64>,
    /// Smaller principal curvature.
    pub k2: Vec<f64>,
    pub mixed_area: Vec<f64>,
    /// Vertices whose `K` was lowered to `H²` to keep the discriminant real.
    pub clamped: usize,
}

impl CurvatureField {
    #[must_use]
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    #[must_use]
    pub fn principal(&self, vertex: usize) -> (f64, f64) {
        (self.k1[vertex], self.k2[vertex])
    }

    #[must_use]
    pub fn classify(&self, vertex: usize, thresholds: CurvatureThresholds) -> CurvatureClass {
        CurvatureClass::classify(self.gaussian[vertex], self.mean[vertex], thresholds)
    }

    /// Per-triangle mean of the vertex Gaussian curvature.
    #[must_use]
    pub fn triangle_gaussian(&self, tessellation: &Tessellation) -> Vec<f64> {
        triangle_average(&self.gaussian, tessellation)
    }

    #[must_use]
    pub fn triangle_mean(&self, tessellation: &Tessellation) -> Vec<f64> {
        triangle_average(&self.mean, tessellation)
    }
}

fn triangle_average(values: &[f64], tessellation: &Tessellation) -> Vec<f64> {
    tessellation
        .triangles
        .iter()
        .map(|tri| tri.iter().map(|&i| values[i as usize]).sum::<f64>() / 3.0)
        .collect()
}

/// Derives the curvature field from a prebuilt Laplacian.
///
/// # Errors
/// See [`compute_curvature_with_cancel`].
pub fn compute_curvature(
    tessellation: &Tessellation,
    laplacian: &LaplacianOperator,
) -> Result<CurvatureField, AnalysisError> {
    compute_curvature_with_cancel(tessellation, laplacian, &CancellationToken::new())
}

/// # Errors
/// `SizeMismatch` when the operator was built for another mesh, `NonFinite` if any
/// curvature value is NaN/Inf, `Cancelled` when the token fires.
pub fn compute_curvature_with_cancel(
    tessellation: &Tessellation,
    laplacian: &LaplacianOperator,
    token: &CancellationToken,
) -> Result<CurvatureField, AnalysisError> {
    let n = tessellation.vertex_count();
    if laplacian.size() != n || tessellation.normals.len() != n {
        return Err(AnalysisError::SizeMismatch {
            operator: laplacian.size(),
            vertices: n,
        });
    }
    log::debug!("curvature: computing over {n} vertices");

    let areas = mixed_areas(tessellation);
    let angle_sums = angle_sums(tessellation);
    let boundary = tessellation.boundary_vertices();
    token.check()?;
    let laplace = laplacian.apply(&tessellation.positions);
    token.check()?;

    let mut field = CurvatureField {
        mean: Vec::with_capacity(n),
        gaussian: Vec::with_capacity(n),
        k1: Vec::with_capacity(n),
        k2: Vec::with_capacity(n),
        mixed_area: areas.clone(),
        clamped: 0,
    };
    let solve = |i: usize| {
        vertex_values(
            areas[i],
            laplace[i],
            tessellation.normals[i],
            angle_sums[i],
            boundary[i],
        )
    };
    #[cfg(feature = "parallel")]
    let values: Vec<VertexValues> = (0..n).into_par_iter().map(solve).collect();
    #[cfg(not(feature = "parallel"))]
    let values: Vec<VertexValues> = (0..n).map(solve).collect();

    let mut zero_area = 0;
    for vertex in values {
        if !(vertex.h.is_finite() && vertex.k.is_finite() && vertex.root.is_finite()) {
            return Err(AnalysisError::NonFinite { stage: "curvature" });
        }
        zero_area += usize::from(vertex.zero_area);
        field.clamped += usize::from(vertex.clamped);
        field.mean.push(vertex.h);
        field.gaussian.push(vertex.k);
        field.k1.push(vertex.h + vertex.root);
        field.k2.push(vertex.h - vertex.root);
    }

    if zero_area > 0 {
        log::warn!("curvature: {zero_area} vertices have zero mixed area");
    }
    if field.clamped > 0 {
        log::debug!("curvature: clamped {} negative discriminants", field.clamped);
    }
    log::debug!("curvature: done");
    Ok(field)
}

struct VertexValues {
    h: f64,
    k: f64,
    root: f64,
    clamped: bool,
    zero_area: bool,
}

/// `K` is clamped to `H²` when the discriminant goes negative.
fn vertex_values(
    area: f64,
    laplace: Vec3,
    normal: Vec3,
    angle_sum: f64,
    on_boundary: bool,
) -> VertexValues {
    if area <= Tolerance::ZERO_LENGTH.eps {
        return VertexValues {
            h: 0.0,
            k: 0.0,
            root: 0.0,
            clamped: false,
            zero_area: true,
        };
    }
    let (h, mut k) = vertex_curvature(laplace, normal, area, angle_sum, on_boundary);
    let clamped = h * h - k < 0.0;
    if clamped {
        k = h * h;
    }
    VertexValues {
        h,
        k,
        root: (h * h - k).max(0.0).sqrt(),
        clamped,
        zero_area: false,
    }
}

fn vertex_curvature(
    laplace: Vec3,
    normal: Vec3,
    area: f64,
    angle_sum: f64,
    on_boundary: bool,
) -> (f64, f64) {
    let along_normal = laplace.dot(normal);
    if on_boundary {
        return (-along_normal / (2.0 * area), 0.0);
    }
    let sign = if along_normal > 0.0 { -1.0 } else { 1.0 };
    let h = sign * laplace.length() / (2.0 * area);
    let k = (2.0 * PI - angle_sum) / area;
    (h, k)
}

/// Sum of incident triangle angles at each vertex.
fn angle_sums(tessellation: &Tessellation) -> Vec<f64> {
    let mut sums = vec![0.0; tessellation.vertex_count()];
    for tri in &tessellation.triangles {
        let idx = tri.map(|i| i as usize);
        let pts = idx.map(|i| tessellation.positions[i]);
        for k in 0..3 {
            let apex = pts[k];
            let a = pts[(k + 1) % 3].sub_point(apex);
            let b = pts[(k + 2) % 3].sub_point(apex);
            if let Some(angle) = a.angle_to(b) {
                sums[idx[k]] += angle;
            }
        }
    }
    sums
}
