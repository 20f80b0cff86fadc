//! Tests for the subdivision evaluator.

use crate::geom::{
    BBox, CancellationToken, ControlCage, EvaluatorState, MeshSolid, Point3, Solid, SubdMesh,
    SubdivisionError, SubdivisionEvaluator, VertexClass,
};

fn cube_evaluator() -> SubdivisionEvaluator {
    SubdivisionEvaluator::from_cage(&ControlCage::unit_cube())
}

/// One flat regular pentagon on the unit circle.
fn pentagon() -> ControlCage {
    let vertices = (0..5)
        .map(|k| {
            let angle = 2.0 * std::f64::consts::PI * f64::from(k) / 5.0;
            Point3::new(angle.cos(), angle.sin(), 0.0)
        })
        .collect();
    ControlCage::new(vertices, vec![vec![0, 1, 2, 3, 4]]).expect("valid pentagon")
}

/// Every tessellation vertex, re-evaluated from its triangle's corner parameters, lands
/// on the stored position.
fn assert_corners_match_limit(cage: &ControlCage, level: u32) {
    let mut evaluator = SubdivisionEvaluator::from_cage(cage);
    let tess = evaluator.tessellate(level).expect("tessellate");
    assert!(tess.has_corner_params());
    for (t, tri) in tess.triangles.iter().enumerate() {
        let face = tess.face_parents[t];
        for (corner, &vertex) in tri.iter().enumerate() {
            let mut weights = [0.0; 3];
            weights[corner] = 1.0;
            let limit = evaluator
                .evaluate_in_triangle(face, &tess.corner_params[t], weights)
                .expect("limit point");
            let stored = tess.positions[vertex as usize];
            assert!(
                limit.position.distance_to(stored) < 1e-9,
                "triangle {t} corner {corner}: limit {:?} vs tessellation {stored:?}",
                limit.position
            );
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_lifecycle_states() {
    let mut evaluator = SubdivisionEvaluator::new();
    assert_eq!(evaluator.state(), EvaluatorState::Uninitialized);
    assert_eq!(evaluator.face_count(), 0);

    evaluator
        .initialize(&ControlCage::unit_cube())
        .expect("fresh evaluator accepts a cage");
    assert_eq!(evaluator.state(), EvaluatorState::Initialized);
    assert_eq!(evaluator.face_count(), 6);

    evaluator.tessellate(1).expect("tessellate");
    assert_eq!(evaluator.state(), EvaluatorState::Tessellated);
}

#[test]
fn test_initialize_twice_fails() {
    let mut evaluator = cube_evaluator();
    let err = evaluator.initialize(&ControlCage::unit_cube()).unwrap_err();
    assert_eq!(err, SubdivisionError::AlreadyInitialized);
}

#[test]
fn test_tessellate_requires_cage() {
    let mut evaluator = SubdivisionEvaluator::new();
    assert_eq!(evaluator.tessellate(2).unwrap_err(), SubdivisionError::NotInitialized);
}

#[test]
fn test_tessellate_is_single_use() {
    let mut evaluator = cube_evaluator();
    evaluator.tessellate(1).expect("first tessellation");
    assert_eq!(
        evaluator.tessellate(1).unwrap_err(),
        SubdivisionError::AlreadyTessellated
    );
    // Limit evaluation stays available after tessellation.
    assert!(evaluator.evaluate_limit_point(0, 0.5, 0.5).is_ok());
}

#[test]
fn test_cancelled_tessellation_leaves_evaluator_initialized() {
    let mut evaluator = cube_evaluator();
    let token = CancellationToken::new();
    token.cancel();
    assert_eq!(
        evaluator.tessellate_with_cancel(2, &token).unwrap_err(),
        SubdivisionError::Cancelled
    );
    assert_eq!(evaluator.state(), EvaluatorState::Initialized);
    assert!(evaluator.tessellate(2).is_ok());
}

#[test]
fn test_tessellate_rejects_level_zero() {
    let mut evaluator = cube_evaluator();
    let err = evaluator.tessellate(0).unwrap_err();
    assert!(matches!(err, SubdivisionError::InvalidLevel { level: 0, .. }));
    // A rejected call leaves the evaluator usable.
    assert_eq!(evaluator.state(), EvaluatorState::Initialized);
}

// ============================================================================
// Tessellation
// ============================================================================

#[test]
fn test_cube_level_two_counts() {
    let tess = cube_evaluator().tessellate(2).expect("tessellate");
    assert_eq!(tess.triangle_count(), 192, "6 faces × 16 quads × 2 triangles");
    assert_eq!(tess.face_parents.len(), tess.triangle_count());
    assert!(tess.face_parents.iter().all(|&f| f < 6));
    for face in 0..6 {
        assert_eq!(
            tess.face_parents.iter().filter(|&&f| f == face).count(),
            32,
            "each cage face should own a quarter of the refinement"
        );
    }
    tess.validate().expect("tessellation invariants");
}

#[test]
fn test_cube_level_one_vertices() {
    let tess = cube_evaluator().tessellate(1).expect("tessellate");
    // 8 vertex points, 12 edge points, 6 face points.
    assert_eq!(tess.vertex_count(), 26);
    assert_eq!(tess.triangle_count(), 48);
}

#[test]
fn test_triangle_count_grows_by_four() {
    let mut previous = None;
    for level in 1..=4 {
        let tess = cube_evaluator().tessellate(level).expect("tessellate");
        if let Some(prev) = previous {
            assert_eq!(tess.triangle_count(), 4 * prev, "level {level}");
        }
        previous = Some(tess.triangle_count());
    }
}

#[test]
fn test_normals_are_unit_length() {
    let tess = cube_evaluator().tessellate(2).expect("tessellate");
    assert_eq!(tess.normals.len(), tess.vertex_count());
    for n in &tess.normals {
        assert!((n.length() - 1.0).abs() < 1e-9, "normal {n:?} is not unit length");
    }
}

#[test]
fn test_cube_limit_is_closed_and_inside_cage() {
    let tess = cube_evaluator().tessellate(3).expect("tessellate");
    for p in &tess.positions {
        for c in [p.x, p.y, p.z] {
            assert!((0.0..=1.0).contains(&c), "limit point {p:?} escaped the cage");
        }
    }

    let shell = MeshSolid {
        positions: tess.positions.clone(),
        triangles: tess.triangles.clone(),
    };
    assert!(shell.is_closed(), "{}", shell.diagnostics());
    let volume = shell.volume();
    assert!(volume > 0.0 && volume < 1.0, "volume {volume} should shrink inside the cube");
}

#[test]
fn test_planar_grid_stays_planar() {
    let mut evaluator = SubdivisionEvaluator::from_cage(&ControlCage::planar_grid(3, 3, 1.0, 1.0));
    let tess = evaluator.tessellate(2).expect("tessellate");
    for p in &tess.positions {
        assert!(p.z.abs() < 1e-12);
        assert!((-1e-12..=1.0 + 1e-12).contains(&p.x));
        assert!((-1e-12..=1.0 + 1e-12).contains(&p.y));
    }
    for n in &tess.normals {
        assert!((n.z - 1.0).abs() < 1e-9, "grid normal should face +Z, got {n:?}");
    }
}

#[test]
fn test_pentagon_cage_tessellates() {
    let mut evaluator = SubdivisionEvaluator::from_cage(&pentagon());
    let tess = evaluator.tessellate(2).expect("tessellate");
    // Five corner quads, then four children each, two triangles per quad.
    assert_eq!(tess.triangle_count(), 5 * 4 * 2);
    assert!(tess.face_parents.iter().all(|&f| f == 0));
    for p in &tess.positions {
        assert!(p.z.abs() < 1e-12);
        assert!(p.x.hypot(p.y) <= 1.0 + 1e-12, "{p:?} left the pentagon");
    }
}

// ============================================================================
// Limit evaluation
// ============================================================================

#[test]
fn test_cube_tessellation_lies_on_the_limit_surface() {
    assert_corners_match_limit(&ControlCage::unit_cube(), 2);
}

#[test]
fn test_pentagon_tessellation_lies_on_the_limit_surface() {
    assert_corners_match_limit(&pentagon(), 2);
}

#[test]
fn test_pentagon_limit_points_stay_in_the_plane() {
    let cage = pentagon();
    let evaluator = SubdivisionEvaluator::from_cage(&cage);
    let bounds = cage.bounding_box().expect("bounds");
    for i in 0..=10 {
        for j in 0..=10 {
            let (u, v) = (f64::from(i) / 10.0, f64::from(j) / 10.0);
            let p = evaluator.evaluate_limit_point(0, u, v).expect("limit point").position;
            assert!(p.is_finite());
            assert!(p.z.abs() < 1e-12);
            let inside = BBox::from_points(&[p]).is_some_and(|b| bounds.intersects(b));
            assert!(inside, "{p:?} at ({u}, {v}) is outside {bounds:?}");
        }
    }
    let centre = evaluator.evaluate_limit_point(0, 1.0, 1.0).expect("centre").position;
    assert!(centre.x.hypot(centre.y) < 1e-9, "centre {centre:?}");
}

#[test]
fn test_evaluate_limit_point_checks_inputs() {
    let evaluator = cube_evaluator();
    assert_eq!(
        evaluator.evaluate_limit_point(6, 0.5, 0.5).unwrap_err(),
        SubdivisionError::InvalidFaceIndex {
            index: 6,
            face_count: 6
        }
    );
    assert!(matches!(
        evaluator.evaluate_limit_point(0, 1.5, 0.5),
        Err(SubdivisionError::InvalidParameter { .. })
    ));
    assert!(matches!(
        evaluator.evaluate_limit_point(0, 0.5, -0.1),
        Err(SubdivisionError::InvalidParameter { .. })
    ));
    assert_eq!(
        SubdivisionEvaluator::new()
            .evaluate_limit_point(0, 0.0, 0.0)
            .unwrap_err(),
        SubdivisionError::NotInitialized
    );
}

#[test]
fn test_cube_corners_are_finite_and_distinct() {
    let evaluator = cube_evaluator();
    let corners: Vec<Point3> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
        .iter()
        .map(|&(u, v)| {
            evaluator
                .evaluate_limit_point(0, u, v)
                .expect("corner evaluation")
                .position
        })
        .collect();
    for (i, a) in corners.iter().enumerate() {
        assert!(a.is_finite());
        for b in &corners[i + 1..] {
            assert!(a.distance_to(*b) > 1e-3, "corners {a:?} and {b:?} coincide");
        }
    }
}

#[test]
fn test_cube_face_centre_is_symmetric() {
    let evaluator = cube_evaluator();
    let (point, normal) = evaluator.evaluate_limit(0, 0.5, 0.5).expect("centre");
    let p = point.position;
    assert!((p.x - 0.5).abs() < 1e-9);
    assert!((p.y - 0.5).abs() < 1e-9);
    assert!(p.z > 0.0 && p.z < 0.5, "centre should sit above the bottom face, got {p:?}");
    assert!(normal.z < -0.99, "bottom face normal should point down, got {normal:?}");
}

#[test]
fn test_grid_corner_limit_is_fixed() {
    let cage = ControlCage::planar_grid(2, 2, 1.0, 1.0);
    let evaluator = SubdivisionEvaluator::from_cage(&cage);
    let corner = evaluator.evaluate_limit_point(0, 0.0, 0.0).expect("corner");
    assert_eq!(corner.position, Point3::new(0.0, 0.0, 0.0));
    assert_eq!((corner.face, corner.u, corner.v), (0, 0.0, 0.0));
}

// ============================================================================
// Control mesh topology
// ============================================================================

#[test]
fn test_control_mesh_vertex_classes() {
    let mesh = SubdMesh::from_cage(&ControlCage::planar_grid(2, 2, 1.0, 1.0));
    // 3×3 vertex grid: corners, edge midpoints, centre.
    assert_eq!(mesh.vertex_class(0), VertexClass::Corner);
    assert!(matches!(mesh.vertex_class(1), VertexClass::Boundary(_)));
    assert_eq!(mesh.vertex_class(4), VertexClass::Interior);
    assert_eq!(mesh.face_neighbors(0), vec![1, 2]);
}

#[test]
fn test_refine_quadruples_quads() {
    let mesh = SubdMesh::from_cage(&ControlCage::unit_cube());
    let refined = mesh.refine();
    assert_eq!(refined.mesh.faces.len(), 24);
    assert_eq!(refined.child_offsets, vec![0, 4, 8, 12, 16, 20]);
    assert!(refined.mesh.faces.iter().all(|f| f.len() == 4));
}
