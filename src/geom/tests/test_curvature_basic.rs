//! Tests for discrete curvature.

use crate::geom::{
    AnalysisError, ControlCage, CurvatureClass, CurvatureField, CurvatureThresholds,
    SubdivisionEvaluator, Tessellation, build_laplacian, compute_curvature,
};

fn analyze(cage: &ControlCage, level: u32) -> (Tessellation, CurvatureField) {
    let tess = SubdivisionEvaluator::from_cage(cage)
        .tessellate(level)
        .expect("tessellate");
    let laplacian = build_laplacian(&tess).expect("laplacian");
    let curvature = compute_curvature(&tess, &laplacian).expect("curvature");
    (tess, curvature)
}

#[test]
fn test_field_has_one_entry_per_vertex() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    assert_eq!(curvature.len(), tess.vertex_count());
    assert_eq!(curvature.gaussian.len(), tess.vertex_count());
    assert_eq!(curvature.k1.len(), tess.vertex_count());
    assert_eq!(curvature.k2.len(), tess.vertex_count());
    assert_eq!(curvature.mixed_area.len(), tess.vertex_count());
}

#[test]
fn test_principal_curvatures_reproduce_k_and_h() {
    let (_, curvature) = analyze(&ControlCage::unit_cube(), 2);
    for v in 0..curvature.len() {
        let (k1, k2) = curvature.principal(v);
        let k = curvature.gaussian[v];
        let h = curvature.mean[v];
        assert!(k1 >= k2, "vertex {v}: k1 {k1} < k2 {k2}");
        assert!((k1 * k2 - k).abs() < 1e-9 * (1.0 + h * h), "vertex {v}: k1·k2 ≠ K");
        assert!(((k1 + k2) / 2.0 - h).abs() < 1e-9 * (1.0 + h.abs()), "vertex {v}: mean ≠ H");
    }
}

#[test]
fn test_closed_cube_curves_outward() {
    let (_, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let total: f64 = curvature
        .gaussian
        .iter()
        .zip(&curvature.mixed_area)
        .map(|(k, a)| k * a)
        .sum();
    assert!(total > 0.0, "integrated K of a closed convex shell was {total}");
    assert!(curvature.mixed_area.iter().all(|&a| a > 0.0));
}

#[test]
fn test_flat_grid_has_zero_curvature() {
    let (_, curvature) = analyze(&ControlCage::planar_grid(3, 3, 1.0, 1.0), 2);
    for v in 0..curvature.len() {
        assert!(curvature.gaussian[v].abs() < 1e-8, "vertex {v}: K = {}", curvature.gaussian[v]);
        assert!(curvature.mean[v].abs() < 1e-8, "vertex {v}: H = {}", curvature.mean[v]);
        assert_eq!(
            curvature.classify(v, CurvatureThresholds::default()),
            CurvatureClass::Planar
        );
    }
    assert_eq!(curvature.clamped, 0);
}

#[test]
fn test_saddle_interior_is_hyperbolic() {
    let cage = ControlCage::height_field(6, 6, 1.0, |x, y| 0.5 * (x * x - y * y));
    let (tess, curvature) = analyze(&cage, 2);
    let boundary = tess.boundary_vertices();
    let centre = tess
        .positions
        .iter()
        .enumerate()
        .filter(|&(i, _)| !boundary[i])
        .min_by(|a, b| {
            let da = a.1.x * a.1.x + a.1.y * a.1.y;
            let db = b.1.x * b.1.x + b.1.y * b.1.y;
            da.total_cmp(&db)
        })
        .map(|(i, _)| i)
        .expect("grid has interior vertices");
    assert!(
        curvature.gaussian[centre] < 0.0,
        "saddle centre should have K < 0, got {}",
        curvature.gaussian[centre]
    );
}

#[test]
fn test_triangle_averages() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 1);
    let per_triangle = curvature.triangle_gaussian(&tess);
    assert_eq!(per_triangle.len(), tess.triangle_count());
    let [a, b, c] = tess.triangles[0].map(|i| curvature.gaussian[i as usize]);
    assert!((per_triangle[0] - (a + b + c) / 3.0).abs() < 1e-12);
}

#[test]
fn test_size_mismatch_is_rejected() {
    let (tess, _) = analyze(&ControlCage::unit_cube(), 1);
    let other = SubdivisionEvaluator::from_cage(&ControlCage::unit_cube())
        .tessellate(2)
        .expect("tessellate");
    let laplacian = build_laplacian(&other).expect("laplacian");
    assert!(matches!(
        compute_curvature(&tess, &laplacian),
        Err(AnalysisError::SizeMismatch { .. })
    ));
}
