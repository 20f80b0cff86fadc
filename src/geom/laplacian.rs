//! Cotangent Laplace-Beltrami operator over a [`Tessellation`].
//!
//! Off-diagonal weights are `w_ij = ½ Σ cot θ` over the angles opposite edge `ij`; the
//! diagonal holds `-Σ_j w_ij`, so every row sums to zero and constants lie in the kernel.

use std::collections::BTreeMap;

use super::cancel::{CancellationToken, Cancelled};
use super::mesh::Tessellation;
use super::{Point3, Tolerance, Vec3};

/// Cotangents are clamped to this magnitude near degenerate angles.
pub const COTANGENT_CLAMP: f64 = 100.0;

/// Triangles processed between cancellation checks.
const TRIANGLE_BATCH: usize = 4096;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("tessellation is invalid: {0}")]
    InvalidTessellation(String),

    #[error("laplacian has {operator} rows but the tessellation has {vertices} vertices")]
    SizeMismatch { operator: usize, vertices: usize },

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },

    #[error("analysis cancelled")]
    Cancelled,
}

impl From<Cancelled> for AnalysisError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Sparse symmetric `n × n` operator. Each row is sorted by column and includes its
/// diagonal entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaplacianOperator {
    rows: Vec<Vec<(usize, f64)>>,
    degenerate_triangles: usize,
}

impl LaplacianOperator {
    #[must_use]
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// Stored entries across all rows.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Triangles whose cross product fell below the degeneracy tolerance.
    #[must_use]
    pub fn degenerate_triangles(&self) -> usize {
        self.degenerate_triangles
    }

    #[must_use]
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    /// Entry `(i, j)`; zero where nothing is stored.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let row = &self.rows[i];
        row.binary_search_by_key(&j, |&(col, _)| col)
            .map_or(0.0, |k| row[k].1)
    }

    #[must_use]
    pub fn row_sum(&self, i: usize) -> f64 {
        self.rows[i].iter().map(|&(_, w)| w).sum()
    }

    /// Largest `|L_ij − L_ji|` over stored entries.
    #[must_use]
    pub fn max_asymmetry(&self) -> f64 {
        let mut worst: f64 = 0.0;
        for (i, row) in self.rows.iter().enumerate() {
            for &(j, w) in row {
                worst = worst.max((w - self.get(j, i)).abs());
            }
        }
        worst
    }

    #[must_use]
    pub fn is_symmetric(&self, tolerance: f64) -> bool {
        self.max_asymmetry() <= tolerance
    }

    /// `(L x)_i = Σ_j w_ij (x_j − x_i)` for a per-vertex position field.
    #[must_use]
    pub fn apply(&self, field: &[Point3]) -> Vec<Vec3> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .filter(|&&(j, _)| j != i)
                    .fold(Vec3::ZERO, |acc, &(j, w)| {
                        acc + field[j].sub_point(field[i]) * w
                    })
            })
            .collect()
    }
}

/// Cotangent of the angle at `apex` between `apex→a` and `apex→b`, zero for degenerate
/// corners and clamped to `±COTANGENT_CLAMP`.
#[must_use]
pub fn cotangent(apex: Point3, a: Point3, b: Point3) -> f64 {
    let ea = a.sub_point(apex);
    let eb = b.sub_point(apex);
    let cross = ea.cross(eb).length();
    if cross < Tolerance::DEGENERATE_TRIANGLE.eps {
        return 0.0;
    }
    (ea.dot(eb) / cross).clamp(-COTANGENT_CLAMP, COTANGENT_CLAMP)
}

/// Builds the cotangent Laplacian.
///
/// # Errors
/// See [`build_laplacian_with_cancel`].
pub fn build_laplacian(tessellation: &Tessellation) -> Result<LaplacianOperator, AnalysisError> {
    build_laplacian_with_cancel(tessellation, &CancellationToken::new())
}

/// Builds the cotangent Laplacian, checking `token` between triangle batches.
///
/// # Errors
/// `InvalidTessellation` for structurally broken input, `NonFinite` if a weight is not
/// finite, `Cancelled` when the token fires.
pub fn build_laplacian_with_cancel(
    tessellation: &Tessellation,
    token: &CancellationToken,
) -> Result<LaplacianOperator, AnalysisError> {
    tessellation
        .validate()
        .map_err(AnalysisError::InvalidTessellation)?;

    let n = tessellation.vertex_count();
    log::debug!(
        "laplacian: building over {n} vertices / {} triangles",
        tessellation.triangle_count()
    );

    let mut off_diagonal: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
    let mut degenerate_triangles = 0;

    for (t, tri) in tessellation.triangles.iter().enumerate() {
        if t % TRIANGLE_BATCH == 0 {
            token.check()?;
        }
        let idx = tri.map(|i| i as usize);
        let pts = idx.map(|i| tessellation.positions[i]);

        let doubled_area = pts[1].sub_point(pts[0]).cross(pts[2].sub_point(pts[0])).length();
        if doubled_area < Tolerance::DEGENERATE_TRIANGLE.eps {
            degenerate_triangles += 1;
            continue;
        }

        for k in 0..3 {
            let i = idx[(k + 1) % 3];
            let j = idx[(k + 2) % 3];
            let w = 0.5 * cotangent(pts[k], pts[(k + 1) % 3], pts[(k + 2) % 3]);
            *off_diagonal[i].entry(j).or_insert(0.0) += w;
            *off_diagonal[j].entry(i).or_insert(0.0) += w;
        }
    }

    token.check()?;
    let mut rows = Vec::with_capacity(n);
    for (i, entries) in off_diagonal.into_iter().enumerate() {
        let diagonal: f64 = -entries.values().sum::<f64>();
        if !diagonal.is_finite() {
            return Err(AnalysisError::NonFinite {
                stage: "laplacian weights",
            });
        }
        let mut row: Vec<(usize, f64)> = entries.into_iter().collect();
        let at = row.partition_point(|&(col, _)| col < i);
        row.insert(at, (i, diagonal));
        rows.push(row);
    }

    if degenerate_triangles > 0 {
        log::warn!("laplacian: {degenerate_triangles} degenerate triangles contributed no weight");
    }
    let operator = LaplacianOperator {
        rows,
        degenerate_triangles,
    };
    log::debug!("laplacian: done, {} stored entries", operator.nnz());
    Ok(operator)
}

/// Per-vertex mixed Voronoi areas: the Voronoi region for non-obtuse triangles, otherwise
/// half the triangle to the obtuse corner and a quarter to each other corner.
#[must_use]
pub fn mixed_areas(tessellation: &Tessellation) -> Vec<f64> {
    let mut areas = vec![0.0; tessellation.vertex_count()];
    for tri in &tessellation.triangles {
        let idx = tri.map(|i| i as usize);
        let pts = idx.map(|i| tessellation.positions[i]);
        let area = 0.5 * pts[1].sub_point(pts[0]).cross(pts[2].sub_point(pts[0])).length();
        if area < 0.5 * Tolerance::DEGENERATE_TRIANGLE.eps {
            continue;
        }

        let obtuse = (0..3).find(|&k| {
            let apex = pts[k];
            pts[(k + 1) % 3]
                .sub_point(apex)
                .dot(pts[(k + 2) % 3].sub_point(apex))
                < 0.0
        });

        match obtuse {
            Some(k) => {
                for m in 0..3 {
                    areas[idx[m]] += if m == k { area / 2.0 } else { area / 4.0 };
                }
            }
            None => {
                for k in 0..3 {
                    let p = pts[k];
                    let q = pts[(k + 1) % 3];
                    let r = pts[(k + 2) % 3];
                    let cot_q = cotangent(q, p, r);
                    let cot_r = cotangent(r, p, q);
                    areas[idx[k]] += 0.125
                        * (r.sub_point(p).length_squared() * cot_q
                            + q.sub_point(p).length_squared() * cot_r);
                }
            }
        }
    }
    areas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cotangent_right_angle_is_zero() {
        let c = cotangent(
            Point3::ORIGIN,
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        );
        assert!(c.abs() < 1e-12);
    }

    #[test]
    fn test_cotangent_degenerate_is_zero() {
        let c = cotangent(
            Point3::ORIGIN,
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        );
        assert_eq!(c, 0.0);
    }
}
