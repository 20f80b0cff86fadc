//! Tests for least-squares region fitting.

use crate::geom::{
    BBox, CancellationToken, ControlCage, CurvatureClass, FitOptions, Region, Surface,
    SurfaceFitError, SubdivisionEvaluator, Tessellation, check_fitting_quality, fit,
    fit_region, fit_region_with_cancel, sample_region_limit,
};

fn region(id: &str, faces: Vec<usize>) -> Region {
    Region {
        id: id.to_string(),
        faces,
        pinned: false,
        unity_strength: 1.0,
        unity_principle: String::new(),
        curvature_class: CurvatureClass::Planar,
        modified: false,
    }
}

fn setup(cage: &ControlCage, level: u32) -> (SubdivisionEvaluator, Tessellation) {
    let mut evaluator = SubdivisionEvaluator::from_cage(cage);
    let tess = evaluator.tessellate(level).expect("tessellate");
    (evaluator, tess)
}

fn whole(tess: &Tessellation) -> Region {
    region("all", (0..tess.triangle_count()).collect())
}

// ============================================================================
// Fitting
// ============================================================================

#[test]
fn test_flat_region_fits_exactly() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 2);
    let fitted = fit_region(&evaluator, &tess, &whole(&tess), &FitOptions::default())
        .expect("flat fit");

    assert_eq!(fitted.region_id, "all");
    assert_eq!(fitted.sample_density, 8);
    // A 9 × 9 lattice per cage face: every level-2 quad spans a quarter of its face.
    assert_eq!(fitted.samples.len(), 4 * 9 * 9);
    assert_eq!(fitted.surface.u_count, 6);
    assert_eq!(fitted.surface.degree_u, 3);
    for p in &fitted.surface.control_points {
        assert!(p.z.abs() < 1e-9, "control point {p:?} left the plane");
    }

    let quality = check_fitting_quality(&fitted.samples, &fitted.surface).expect("quality");
    assert!(
        quality.max_deviation < 1e-6,
        "flat fit deviated by {}",
        quality.max_deviation
    );
}

#[test]
fn test_fitted_normal_follows_region_winding() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 1);
    let fitted = fit(&evaluator, &tess, &whole(&tess), 4).expect("fit");
    let normal = fitted.surface.normal_at(0.5, 0.5).expect("regular surface");
    assert!(normal.z > 0.99, "normal should agree with the +Z triangles, got {normal:?}");
    assert_eq!(fitted.samples.len(), 4 * 5 * 5);
}

#[test]
fn test_saddle_region_fits_within_tolerance() {
    let cage = ControlCage::height_field(4, 4, 1.0, |x, y| 0.3 * (x * x - y * y));
    let (evaluator, tess) = setup(&cage, 2);
    let fitted = fit_region(&evaluator, &tess, &whole(&tess), &FitOptions::default())
        .expect("saddle fit");
    let quality = check_fitting_quality(&fitted.samples, &fitted.surface).expect("quality");
    assert!(
        quality.max_deviation < 0.05,
        "saddle fit deviated by {}",
        quality.max_deviation
    );
    assert!(quality.rms_deviation <= quality.max_deviation);
}

#[test]
fn test_regions_on_one_cage_face_sample_only_themselves() {
    let cage = ControlCage::height_field(4, 4, 1.0, |x, y| 0.3 * (x * x + y * y));
    let (evaluator, tess) = setup(&cage, 2);
    // Two neighbouring level-2 quads, both refined from cage face 0.
    let first = region("first", vec![0, 1]);
    let second = region("second", vec![2, 3]);
    assert_eq!(tess.face_parents[0], tess.face_parents[2]);

    let a = fit_region(&evaluator, &tess, &first, &FitOptions::default()).expect("first");
    let b = fit_region(&evaluator, &tess, &second, &FitOptions::default()).expect("second");
    // Each quad spans a quarter of its face: a 3 × 3 lattice at density 8.
    assert_eq!(a.samples.len(), 9);
    assert_eq!(b.samples.len(), 9);
    assert_ne!(a.samples, b.samples);
    assert_ne!(a.surface.control_points, b.surface.control_points);

    for (fitted, faces) in [(&a, &first.faces), (&b, &second.faces)] {
        let corners: Vec<_> = faces.iter().flat_map(|&t| tess.triangle_points(t)).collect();
        let bbox = BBox::from_points(&corners).expect("non-empty");
        for p in &fitted.samples {
            let inside = p.x >= bbox.min.x - 1e-9
                && p.x <= bbox.max.x + 1e-9
                && p.y >= bbox.min.y - 1e-9
                && p.y <= bbox.max.y + 1e-9;
            assert!(inside, "{p:?} lies outside the triangles of '{}'", fitted.region_id);
        }
    }
}

#[test]
fn test_partial_face_sampling_is_deduplicated() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 2);
    let token = CancellationToken::new();
    // Both triangles of one level-2 quad share their diagonal.
    let samples = sample_region_limit(&evaluator, &tess, &region("q", vec![0, 1]), 5, &token)
        .expect("samples");
    assert_eq!(samples.len(), 4);

    let whole_face = sample_region_limit(&evaluator, &tess, &whole(&tess), 5, &token)
        .expect("samples");
    assert_eq!(whole_face.len(), 25);
}

#[test]
fn test_hand_built_tessellation_cannot_be_sampled() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    let mut bare = tess.clone();
    bare.corner_params.clear();
    let err = fit(&evaluator, &bare, &whole(&bare), 4).unwrap_err();
    assert!(
        matches!(err, SurfaceFitError::FitFailed { ref reason, .. } if reason.contains("parameters")),
        "unexpected error: {err}"
    );
}

#[test]
fn test_cancelled_fit() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 1);
    let token = CancellationToken::new();
    token.cancel();
    let err = fit_region_with_cancel(
        &evaluator,
        &tess,
        &whole(&tess),
        &FitOptions::default(),
        &token,
    )
    .unwrap_err();
    assert_eq!(err, SurfaceFitError::Cancelled);
}

#[test]
fn test_degree_is_capped_by_control_points() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    let options = FitOptions::default().with_control_points(3).with_degree(5);
    let fitted = fit_region(&evaluator, &tess, &whole(&tess), &options).expect("fit");
    assert_eq!(fitted.surface.degree_u, 2);
    assert_eq!(fitted.surface.control_points.len(), 9);
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn test_insufficient_sample_density() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    let err = fit(&evaluator, &tess, &whole(&tess), 1).unwrap_err();
    assert_eq!(
        err,
        SurfaceFitError::InsufficientSamples {
            density: 1,
            minimum: 2
        }
    );
}

#[test]
fn test_invalid_options() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    for options in [
        FitOptions::default().with_degree(0),
        FitOptions::default().with_control_points(1),
        FitOptions::default().with_smoothing(-1.0),
    ] {
        assert!(matches!(
            fit_region(&evaluator, &tess, &whole(&tess), &options),
            Err(SurfaceFitError::InvalidOptions(_))
        ));
    }
}

#[test]
fn test_empty_region_fails() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    let err = fit(&evaluator, &tess, &region("empty", vec![]), 4).unwrap_err();
    assert!(matches!(err, SurfaceFitError::FitFailed { ref region, .. } if region == "empty"));
}

#[test]
fn test_disconnected_region_fails() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 2);
    let last = tess.triangle_count() - 1;
    let err = fit(&evaluator, &tess, &region("split", vec![0, last]), 4).unwrap_err();
    assert!(
        matches!(err, SurfaceFitError::FitFailed { ref reason, .. } if reason.contains("disconnected")),
        "unexpected error: {err}"
    );
}

#[test]
fn test_out_of_range_triangle_fails() {
    let (evaluator, tess) = setup(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    let err = fit(&evaluator, &tess, &region("far", vec![tess.triangle_count()]), 4).unwrap_err();
    assert!(matches!(err, SurfaceFitError::FitFailed { .. }));
}
