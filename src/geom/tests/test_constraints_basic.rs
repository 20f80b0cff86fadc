//! Tests for draft, undercut and wall-thickness constraints.

use crate::geom::{
    ConstraintError, ConstraintLevel, ConstraintOptions, ConstraintReport, ConstraintValidator,
    ControlCage, CurvatureClass, RECOMMENDED_DRAFT_ANGLE_DEGREES, Region, SubdivisionEvaluator,
    Tessellation, Vec3,
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

fn tessellate(cage: &ControlCage, level: u32) -> Tessellation {
    SubdivisionEvaluator::from_cage(cage)
        .tessellate(level)
        .expect("tessellate")
}

fn cage_face(tess: &Tessellation, face: usize) -> Region {
    let faces = (0..tess.triangle_count())
        .filter(|&t| tess.face_parents[t] == face)
        .collect();
    region(&format!("face_{face}"), faces)
}

fn whole(tess: &Tessellation) -> Region {
    region("all", (0..tess.triangle_count()).collect())
}

#[test]
fn test_flat_patch_pulled_straight_up_is_clean() {
    let tess = tessellate(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 2);
    let validator = ConstraintValidator::new(&tess, ConstraintOptions::default()).expect("valid");

    let report = validator.validate_region(&whole(&tess), 40.0).expect("report");
    assert!(report.violations.is_empty(), "{report:?}");
    for (_, draft) in validator.draft_angles(&whole(&tess)).expect("drafts") {
        assert!((draft - 90.0).abs() < 1e-9);
    }
    for (_, scan) in validator.undercuts(&whole(&tess)).expect("scans") {
        assert_eq!(scan.occluded, 0);
    }
}

#[test]
fn test_tilted_direction_lowers_draft() {
    let tess = tessellate(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 2);
    let tilt = 10.0_f64.to_radians();
    let options =
        ConstraintOptions::default().with_demolding_direction(Vec3::new(tilt.sin(), 0.0, tilt.cos()));
    let validator = ConstraintValidator::new(&tess, options).expect("valid");

    let drafts = validator.draft_angles(&whole(&tess)).expect("drafts");
    assert_eq!(drafts.len(), 4);
    for draft in drafts.values() {
        assert!((draft - 80.0).abs() < 1e-9, "draft {draft}");
    }
}

#[test]
fn test_cube_bottom_is_an_undercut() {
    let tess = tessellate(&ControlCage::unit_cube(), 2);
    let validator = ConstraintValidator::new(&tess, ConstraintOptions::default()).expect("valid");
    // Cage face 0 is the bottom; every ray up from it runs into the top.
    let bottom = cage_face(&tess, 0);

    let scans = validator.undercuts(&bottom).expect("scans");
    let scan = scans[&0];
    assert_eq!(scan.samples, 32);
    assert_eq!(scan.occluded, scan.samples);
    assert!(scan.max_severity > 0.9 && scan.max_severity <= 1.0);

    let report = validator.validate_region(&bottom, 40.0).expect("report");
    assert_eq!(report.error_count(), 2, "{report:?}");
    assert!(!report.has_warnings());
    let undercut = report
        .iter()
        .find(|v| v.description.starts_with("Undercut"))
        .expect("undercut reported");
    assert_eq!(undercut.face, Some(0));
    assert!((undercut.severity - scan.max_severity).abs() < 1e-12);
    assert!(undercut.suggestion.contains("physical impossibility"));
}

#[test]
fn test_cube_top_demolds_cleanly() {
    let tess = tessellate(&ControlCage::unit_cube(), 2);
    let validator = ConstraintValidator::new(&tess, ConstraintOptions::default()).expect("valid");
    let top = cage_face(&tess, 1);

    assert_eq!(validator.undercuts(&top).expect("scans")[&1].occluded, 0);
    assert!(validator.draft_angles(&top).expect("drafts")[&1] > RECOMMENDED_DRAFT_ANGLE_DEGREES);
    let report = validator.validate_region(&top, 40.0).expect("report");
    assert!(report.violations.is_empty(), "{report:?}");
}

#[test]
fn test_cube_side_is_undercut_below_its_bulge() {
    let tess = tessellate(&ControlCage::unit_cube(), 2);
    let validator = ConstraintValidator::new(&tess, ConstraintOptions::default()).expect("valid");
    let side = cage_face(&tess, 2);

    let scan = validator.undercuts(&side).expect("scans")[&2];
    assert!(scan.occluded > 0);
    assert!(scan.occluded < scan.samples);
    assert!(validator.draft_angles(&side).expect("drafts")[&2] < 0.0);
    assert!(validator.validate_region(&side, 40.0).expect("report").has_errors());
}

#[test]
fn test_thin_wall_is_a_warning() {
    let tess = tessellate(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    let validator = ConstraintValidator::new(&tess, ConstraintOptions::default()).expect("valid");

    let report = validator.validate_region(&whole(&tess), 10.0).expect("report");
    assert_eq!(report.warning_count(), 1);
    assert!(!report.has_errors());
    let warning = &report.violations[0];
    assert_eq!(warning.level, ConstraintLevel::Warning);
    assert_eq!(warning.face, None);
    assert!((warning.severity - 2.0 / 3.0).abs() < 1e-12);

    let relaxed = ConstraintValidator::new(
        &tess,
        ConstraintOptions::default().with_min_wall_thickness(5.0),
    )
    .expect("valid");
    assert!(relaxed.validate_region(&whole(&tess), 10.0).expect("report").violations.is_empty());
}

#[test]
fn test_report_levels_and_severity_bounds() {
    let mut report = ConstraintReport::default();
    report.add_error("wall".to_string(), Some(3), 4.0);
    report.add_warning("draft".to_string(), None, f64::NAN);
    report.add_feature("saddle".to_string(), Some(1));

    assert_eq!(report.error_count(), 1);
    assert_eq!(report.warning_count(), 1);
    assert_eq!(report.violations[0].severity, 1.0);
    assert_eq!(report.violations[1].severity, 1.0);
    let feature = &report.violations[2];
    assert_eq!(feature.level, ConstraintLevel::Feature);
    assert_eq!(feature.severity, 0.0);
    assert!(feature.suggestion.contains("aesthetic"));
}

#[test]
fn test_invalid_inputs_are_rejected() {
    let tess = tessellate(&ControlCage::planar_grid(1, 1, 1.0, 1.0), 1);
    assert_eq!(
        ConstraintValidator::new(
            &tess,
            ConstraintOptions::default().with_demolding_direction(Vec3::ZERO)
        )
        .unwrap_err(),
        ConstraintError::InvalidDirection
    );
    assert!(matches!(
        ConstraintValidator::new(&tess, ConstraintOptions::default().with_min_wall_thickness(-1.0)),
        Err(ConstraintError::InvalidThickness { .. })
    ));

    let validator = ConstraintValidator::new(&tess, ConstraintOptions::default()).expect("valid");
    assert!(matches!(
        validator.validate_region(&region("bad", vec![0, 99]), 40.0),
        Err(ConstraintError::TriangleOutOfRange { triangle: 99, .. })
    ));
}
