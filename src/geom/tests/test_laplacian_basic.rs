//! Tests for the cotangent Laplacian.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geom::{
    AnalysisError, CancellationToken, ControlCage, Point3, SubdivisionEvaluator, Tessellation,
    build_laplacian, build_laplacian_with_cancel, mixed_areas,
};

/// `n × n` quad grid in the XY plane with interior vertices jittered by up to `jitter`.
fn jittered_grid(n: usize, jitter: f64, seed: u64) -> Tessellation {
    let mut rng = StdRng::seed_from_u64(seed);
    let row = n + 1;
    let mut positions = Vec::with_capacity(row * row);
    for j in 0..row {
        for i in 0..row {
            let interior = i > 0 && j > 0 && i < n && j < n;
            let (dx, dy) = if interior {
                (
                    rng.random_range(-jitter..jitter),
                    rng.random_range(-jitter..jitter),
                )
            } else {
                (0.0, 0.0)
            };
            positions.push(Point3::new(i as f64 + dx, j as f64 + dy, 0.0));
        }
    }

    let mut quads = Vec::new();
    for j in 0..n {
        for i in 0..n {
            let a = (j * row + i) as u32;
            let r = row as u32;
            quads.push([a, a + 1, a + 1 + r, a + r]);
        }
    }
    let parents = vec![0; quads.len()];
    Tessellation::from_quads(positions, &quads, &parents)
}

fn cube_tessellation(level: u32) -> Tessellation {
    SubdivisionEvaluator::from_cage(&ControlCage::unit_cube())
        .tessellate(level)
        .expect("tessellate")
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn test_cube_laplacian_is_symmetric() {
    let tess = cube_tessellation(2);
    let laplacian = build_laplacian(&tess).expect("laplacian");
    assert_eq!(laplacian.size(), tess.vertex_count());
    assert!(
        laplacian.is_symmetric(1e-10),
        "max asymmetry {}",
        laplacian.max_asymmetry()
    );
    assert_eq!(laplacian.degenerate_triangles(), 0);
}

#[test]
fn test_rows_sum_to_zero() {
    let tess = cube_tessellation(2);
    let laplacian = build_laplacian(&tess).expect("laplacian");
    for i in 0..laplacian.size() {
        assert!(laplacian.row_sum(i).abs() < 1e-10, "row {i} sums to {}", laplacian.row_sum(i));
    }
}

#[test]
fn test_rows_are_sorted_with_diagonal() {
    let tess = jittered_grid(3, 0.2, 7);
    let laplacian = build_laplacian(&tess).expect("laplacian");
    for i in 0..laplacian.size() {
        let row = laplacian.row(i);
        assert!(row.windows(2).all(|w| w[0].0 < w[1].0), "row {i} is not sorted");
        assert!(row.iter().any(|&(j, _)| j == i), "row {i} has no diagonal");
    }
}

#[test]
fn test_jittered_grid_symmetric_for_many_seeds() {
    for seed in 0..8 {
        let tess = jittered_grid(4, 0.25, seed);
        let laplacian = build_laplacian(&tess).expect("laplacian");
        assert!(laplacian.is_symmetric(1e-10), "seed {seed}");
        for i in 0..laplacian.size() {
            assert!(laplacian.row_sum(i).abs() < 1e-10, "seed {seed}, row {i}");
        }
    }
}

// ============================================================================
// Linear precision
// ============================================================================

#[test]
fn test_planar_positions_vanish_at_interior_vertices() {
    let tess = jittered_grid(4, 0.2, 42);
    let laplacian = build_laplacian(&tess).expect("laplacian");
    let boundary = tess.boundary_vertices();
    let applied = laplacian.apply(&tess.positions);
    for (i, value) in applied.iter().enumerate() {
        if !boundary[i] {
            assert!(value.length() < 1e-9, "interior vertex {i}: {value:?}");
        }
    }
}

#[test]
fn test_mixed_areas_cover_the_mesh() {
    let tess = jittered_grid(3, 0.2, 3);
    let total: f64 = mixed_areas(&tess).iter().sum();
    assert!((total - tess.total_area()).abs() < 1e-9, "{total} vs {}", tess.total_area());
    assert!((tess.total_area() - 9.0).abs() < 1e-9);
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn test_rejects_out_of_range_index() {
    let mut tess = jittered_grid(1, 0.0, 0);
    tess.triangles[0][2] = 99;
    assert!(matches!(
        build_laplacian(&tess),
        Err(AnalysisError::InvalidTessellation(_))
    ));
}

#[test]
fn test_cancelled_token_stops_build() {
    let tess = cube_tessellation(1);
    let token = CancellationToken::new();
    token.cancel();
    assert_eq!(
        build_laplacian_with_cancel(&tess, &token).unwrap_err(),
        AnalysisError::Cancelled
    );
}

#[test]
fn test_degenerate_triangle_is_counted() {
    let positions = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(2.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
    ];
    // The first half of the quad is collinear.
    let tess = Tessellation::from_quads(positions, &[[0, 1, 2, 3]], &[0]);
    let laplacian = build_laplacian(&tess).expect("laplacian");
    assert_eq!(laplacian.degenerate_triangles(), 1);
}
