//! Laplace-Beltrami eigenmodes and the nodal domains they cut the surface into.
//!
//! The generalized problem `-L φ = λ A φ` (cotangent Laplacian `L`, mixed areas `A`) is
//! solved through its symmetric form `A^{-1/2} (-L) A^{-1/2} ψ = λ ψ` with a dense
//! eigensolver, then mapped back with `φ = A^{-1/2} ψ`. Mode 0 is the constant function.
//! The dense solve limits this to tessellations of at most [`MAX_SPECTRAL_VERTICES`]
//! vertices.

use std::collections::VecDeque;

use nalgebra::{DMatrix, SymmetricEigen};
use serde::Serialize;

use super::curvature::CurvatureField;
use super::laplacian::{LaplacianOperator, mixed_areas};
use super::mesh::Tessellation;
use super::segmentation::{Region, SegmentOptions, SegmentationError, regions_from_groups};

pub const MAX_SPECTRAL_VERTICES: usize = 1600;

/// Eigenvalues closer than this count toward each other's multiplicity.
const MULTIPLICITY_TOLERANCE: f64 = 1e-3;
/// Eigenfunction values below this magnitude lie on the nodal set.
const NODAL_ZERO: f64 = 1e-6;
/// Domains need more vertices than this to become regions.
const MIN_DOMAIN_VERTICES: usize = 10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpectralError {
    #[error("at least one eigenmode must be requested")]
    NoModesRequested,

    #[error("tessellation is invalid: {0}")]
    InvalidTessellation(String),

    #[error("{vertices} vertices exceed the dense eigensolver limit of {max}")]
    TooLarge { vertices: usize, max: usize },

    #[error("laplacian has {operator} rows but the tessellation has {vertices} vertices")]
    SizeMismatch { operator: usize, vertices: usize },

    #[error("vertex {vertex} has no area; is it referenced by a triangle?")]
    ZeroArea { vertex: usize },

    #[error("mode {index} has no nodal domains; only modes from 1 up separate the surface")]
    ConstantMode { index: usize },

    #[error("mode {index} has {values} values for {vertices} vertices")]
    ModeMismatch {
        index: usize,
        values: usize,
        vertices: usize,
    },

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EigenMode {
    pub index: usize,
    pub eigenvalue: f64,
    /// Per-vertex eigenfunction, normalized so that `Σ A_i φ_i² = 1` and the entry of
    /// largest magnitude is positive.
    pub values: Vec<f64>,
    /// Number of returned modes whose eigenvalue lies within 1e-3 of this one.
    pub multiplicity: usize,
}

/// A connected set of same-sign vertices and the triangles it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodalDomain {
    pub positive: bool,
    pub vertices: Vec<usize>,
    /// Triangles with at least two corners in `vertices`, sorted.
    pub triangles: Vec<usize>,
}

/// The `num_modes` lowest eigenmodes, ascending; fewer when the mesh has fewer vertices.
///
/// # Errors
/// `NoModesRequested`, `InvalidTessellation`, `TooLarge`, `SizeMismatch`, `ZeroArea` for
/// an unreferenced vertex, or `NonFinite` from the solve.
pub fn compute_eigenmodes(
    tessellation: &Tessellation,
    laplacian: &LaplacianOperator,
    num_modes: usize,
) -> Result<Vec<EigenMode>, SpectralError> {
    if num_modes == 0 {
        return Err(SpectralError::NoModesRequested);
    }
    tessellation
        .validate()
        .map_err(SpectralError::InvalidTessellation)?;
    let n = tessellation.vertex_count();
    if laplacian.size() != n {
        return Err(SpectralError::SizeMismatch {
            operator: laplacian.size(),
            vertices: n,
        });
    }
    if n > MAX_SPECTRAL_VERTICES {
        return Err(SpectralError::TooLarge {
            vertices: n,
            max: MAX_SPECTRAL_VERTICES,
        });
    }

    let areas = mixed_areas(tessellation);
    if let Some(vertex) = areas.iter().position(|&a| a.is_nan() || a <= 0.0) {
        return Err(SpectralError::ZeroArea { vertex });
    }
    let inv_sqrt: Vec<f64> = areas.iter().map(|a| 1.0 / a.sqrt()).collect();

    let mut operator = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for &(j, w) in laplacian.row(i) {
            operator[(i, j)] = -w * inv_sqrt[i] * inv_sqrt[j];
        }
    }
    // Cotangent sums are symmetric up to rounding; the solver reads one triangle.
    let operator = (&operator + operator.transpose()) * 0.5;

    log::debug!("spectral: dense eigensolve over {n} vertices");
    let eigen = SymmetricEigen::new(operator);
    if eigen.eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(SpectralError::NonFinite {
            stage: "eigenvalues",
        });
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let mut modes: Vec<EigenMode> = order
        .into_iter()
        .take(num_modes)
        .enumerate()
        .map(|(index, column)| {
            let mut values: Vec<f64> = (0..n)
                .map(|i| eigen.eigenvectors[(i, column)] * inv_sqrt[i])
                .collect();
            let peak = values
                .iter()
                .copied()
                .max_by(|a, b| a.abs().total_cmp(&b.abs()))
                .unwrap_or(0.0);
            if peak < 0.0 {
                for v in &mut values {
                    *v = -*v;
                }
            }
            EigenMode {
                index,
                // The kernel may come out a hair negative.
                eigenvalue: eigen.eigenvalues[column].max(0.0),
                values,
                multiplicity: 1,
            }
        })
        .collect();

    let eigenvalues: Vec<f64> = modes.iter().map(|m| m.eigenvalue).collect();
    for mode in &mut modes {
        mode.multiplicity = eigenvalues
            .iter()
            .filter(|&&other| (other - mode.eigenvalue).abs() < MULTIPLICITY_TOLERANCE)
            .count();
    }
    log::debug!(
        "spectral: lowest eigenvalues {:?}",
        &eigenvalues[..eigenvalues.len().min(4)]
    );
    Ok(modes)
}

/// Connected same-sign vertex sets of `mode` with more than ten vertices, in order of
/// their lowest vertex.
///
/// # Errors
/// `ConstantMode` for mode 0, `InvalidTessellation`, or `ModeMismatch` when the mode
/// belongs to another mesh.
pub fn nodal_domains(
    tessellation: &Tessellation,
    mode: &EigenMode,
) -> Result<Vec<NodalDomain>, SpectralError> {
    if mode.index == 0 {
        return Err(SpectralError::ConstantMode { index: 0 });
    }
    tessellation
        .validate()
        .map_err(SpectralError::InvalidTessellation)?;
    let n = tessellation.vertex_count();
    if mode.values.len() != n {
        return Err(SpectralError::ModeMismatch {
            index: mode.index,
            values: mode.values.len(),
            vertices: n,
        });
    }

    let sign: Vec<i8> = mode
        .values
        .iter()
        .map(|&v| {
            if v.abs() < NODAL_ZERO {
                0
            } else if v > 0.0 {
                1
            } else {
                -1
            }
        })
        .collect();
    let adjacency = vertex_adjacency(tessellation);

    let mut component: Vec<Option<usize>> = vec![None; n];
    let mut domains: Vec<NodalDomain> = Vec::new();
    let mut kept: Vec<Option<usize>> = Vec::new();
    for start in 0..n {
        if sign[start] == 0 || component[start].is_some() {
            continue;
        }
        let id = kept.len();
        let mut vertices = vec![start];
        component[start] = Some(id);
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            for &w in &adjacency[v] {
                if component[w].is_none() && sign[w] == sign[start] {
                    component[w] = Some(id);
                    vertices.push(w);
                    queue.push_back(w);
                }
            }
        }

        if vertices.len() > MIN_DOMAIN_VERTICES {
            vertices.sort_unstable();
            kept.push(Some(domains.len()));
            domains.push(NodalDomain {
                positive: sign[start] > 0,
                vertices,
                triangles: Vec::new(),
            });
        } else {
            kept.push(None);
        }
    }

    for (t, tri) in tessellation.triangles.iter().enumerate() {
        let owners = tri.map(|i| component[i as usize].and_then(|c| kept[c]));
        let majority = owners
            .iter()
            .flatten()
            .find(|&&d| owners.iter().filter(|&&o| o == Some(d)).count() >= 2);
        if let Some(&d) = majority {
            domains[d].triangles.push(t);
        }
    }

    log::debug!(
        "spectral: mode {} has {} nodal domains",
        mode.index,
        domains.len()
    );
    Ok(domains)
}

/// Nodal domains of `mode` as regions named `spectral_mode{k}_{pos|neg}_{n}`. Domains
/// that own no triangle are dropped.
///
/// # Errors
/// As [`nodal_domains`], plus segmentation errors while scoring the regions.
pub fn spectral_regions(
    tessellation: &Tessellation,
    curvature: &CurvatureField,
    mode: &EigenMode,
    options: &SegmentOptions,
) -> Result<Vec<Region>, SpectralError> {
    let domains = nodal_domains(tessellation, mode)?;
    let mut labels = Vec::new();
    let mut groups = Vec::new();
    for (n, domain) in domains.into_iter().enumerate() {
        if domain.triangles.is_empty() {
            continue;
        }
        let side = if domain.positive { "pos" } else { "neg" };
        groups.push((format!("spectral_mode{}_{side}_{n}", mode.index), domain.triangles));
        labels.push(if domain.positive { "positive" } else { "negative" });
    }

    let mut regions = regions_from_groups(tessellation, curvature, groups, options)?;
    for (region, label) in regions.iter_mut().zip(labels) {
        region.unity_principle = format!("Spectral eigenmode {} ({label} domain)", mode.index);
    }
    Ok(regions)
}

/// How well a decomposition matches the form, in `[0, 1]`: 60% region count (three to
/// eight is ideal) and 40% size uniformity.
#[must_use]
pub fn resonance_score(regions: &[Region]) -> f64 {
    if regions.is_empty() {
        return 0.0;
    }
    let count = regions.len();
    let count_score = match count {
        0..3 => count as f64 / 3.0,
        3..=8 => 1.0,
        _ => (1.0 - (count - 8) as f64 / 10.0).max(0.0),
    };

    let sizes: Vec<f64> = regions.iter().map(|r| r.len() as f64).collect();
    let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
    let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / sizes.len() as f64;
    let uniformity = 1.0 - (variance.sqrt() / (mean + 1.0)).min(1.0);

    (0.6 * count_score + 0.4 * uniformity).clamp(0.0, 1.0)
}

fn vertex_adjacency(tessellation: &Tessellation) -> Vec<Vec<usize>> {
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); tessellation.vertex_count()];
    for tri in &tessellation.triangles {
        for k in 0..3 {
            let a = tri[k] as usize;
            let b = tri[(k + 1) % 3] as usize;
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
    }
    for neighbours in &mut adjacency {
        neighbours.sort_unstable();
        neighbours.dedup();
    }
    adjacency
}
