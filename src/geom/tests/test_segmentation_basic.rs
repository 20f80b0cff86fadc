//! Tests for region segmentation and the editable region set.

use crate::geom::{
    CancellationToken, ControlCage, CurvatureClass, CurvatureField, Region, RegionSet,
    SegmentOptions, SegmentationError, SubdivisionEvaluator, Tessellation, build_laplacian,
    compute_curvature, segment, segment_with_cancel, validate_region,
};

fn analyze(cage: &ControlCage, level: u32) -> (Tessellation, CurvatureField) {
    let tess = SubdivisionEvaluator::from_cage(cage)
        .tessellate(level)
        .expect("tessellate");
    let laplacian = build_laplacian(&tess).expect("laplacian");
    let curvature = compute_curvature(&tess, &laplacian).expect("curvature");
    (tess, curvature)
}

fn flat_set() -> RegionSet {
    let (tess, curvature) = analyze(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 2);
    let mut set = RegionSet::new(&tess, &curvature, SegmentOptions::default()).expect("set");
    set.segment().expect("segment");
    set
}

fn assert_partition(regions: &[Region], triangle_count: usize) {
    let mut owner = vec![0usize; triangle_count];
    for region in regions {
        validate_region(region).expect("region is well formed");
        for &t in &region.faces {
            owner[t] += 1;
        }
    }
    assert!(
        owner.iter().all(|&count| count == 1),
        "every triangle should belong to exactly one region"
    );
}

// ============================================================================
// Segmentation
// ============================================================================

#[test]
fn test_flat_grid_is_one_developable_region() {
    let (tess, curvature) = analyze(&ControlCage::planar_grid(2, 2, 1.0, 1.0), 2);
    let regions = segment(&tess, &curvature, &[], &SegmentOptions::default()).expect("segment");

    assert_eq!(regions.len(), 1);
    let region = &regions[0];
    assert_eq!(region.id, "region_0");
    assert_eq!(region.len(), tess.triangle_count());
    assert!((region.unity_strength - 1.0).abs() < 1e-12);
    assert_eq!(region.curvature_class, CurvatureClass::Planar);
    assert!(!region.pinned && !region.modified);
    assert!(region.unity_principle.contains("flat"));
}

#[test]
fn test_cube_regions_partition_the_tessellation() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let regions = segment(&tess, &curvature, &[], &SegmentOptions::default()).expect("segment");
    assert!(!regions.is_empty());
    assert_partition(&regions, tess.triangle_count());
    for region in &regions {
        assert!((0.0..=1.0).contains(&region.unity_strength));
    }
}

#[test]
fn test_segmentation_is_deterministic() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let options = SegmentOptions::default();
    let first = segment(&tess, &curvature, &[], &options).expect("segment");
    let second = segment(&tess, &curvature, &[], &options).expect("segment");
    assert_eq!(first, second);
}

#[test]
fn test_min_region_size_is_respected() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let options = SegmentOptions::default()
        .with_variance_threshold(1e-6)
        .with_min_region_size(8);
    let regions = segment(&tess, &curvature, &[], &options).expect("segment");
    assert_partition(&regions, tess.triangle_count());
    assert!(
        regions.iter().all(|r| r.len() >= 8),
        "undersized regions should be merged into a neighbour"
    );
}

#[test]
fn test_cancelled_segmentation() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let token = CancellationToken::new();
    token.cancel();
    assert_eq!(
        segment_with_cancel(&tess, &curvature, &[], &SegmentOptions::default(), &token)
            .unwrap_err(),
        SegmentationError::Cancelled
    );
}

#[test]
fn test_default_options_keep_regions_castable() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 3);
    let options = SegmentOptions::default();
    let regions = segment(&tess, &curvature, &[], &options).expect("segment");

    assert_partition(&regions, tess.triangle_count());
    assert!(regions.len() <= options.max_regions, "{} regions", regions.len());
    assert!(regions.iter().all(|r| r.len() >= options.min_region_size));
}

#[test]
fn test_region_cap_merges_smallest_first() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let fine = SegmentOptions::default()
        .with_variance_threshold(1e-6)
        .with_min_region_size(1);

    let uncapped = segment(&tess, &curvature, &[], &fine.with_max_regions(0)).expect("segment");
    assert!(uncapped.len() > 8);

    let capped = segment(&tess, &curvature, &[], &fine.with_max_regions(3)).expect("segment");
    assert_partition(&capped, tess.triangle_count());
    assert!(capped.len() <= 3);
}

#[test]
fn test_region_cap_counts_pinned_regions() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let pinned = Region {
        id: "keep".to_string(),
        faces: (0..10).collect(),
        pinned: true,
        unity_strength: 0.5,
        unity_principle: "manual".to_string(),
        curvature_class: CurvatureClass::Elliptic,
        modified: true,
    };
    let options = SegmentOptions::default()
        .with_variance_threshold(1e-6)
        .with_max_regions(2);
    let regions = segment(&tess, &curvature, &[pinned], &options).expect("segment");

    assert_partition(&regions, tess.triangle_count());
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].id, "keep");
}

#[test]
fn test_pinned_regions_are_kept_verbatim() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let pinned = Region {
        id: "keep".to_string(),
        faces: (0..10).collect(),
        pinned: true,
        unity_strength: 0.5,
        unity_principle: "manual".to_string(),
        curvature_class: CurvatureClass::Elliptic,
        modified: true,
    };
    let regions = segment(&tess, &curvature, &[pinned.clone()], &SegmentOptions::default())
        .expect("segment");

    assert_eq!(regions[0], pinned, "pinned regions come first, unchanged");
    assert_partition(&regions, tess.triangle_count());
    assert!(regions[1..].iter().all(|r| r.id != "keep"));
}

#[test]
fn test_overlapping_pinned_regions_are_rejected() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 1);
    let region = |id: &str, faces: Vec<usize>| Region {
        id: id.to_string(),
        faces,
        pinned: true,
        unity_strength: 1.0,
        unity_principle: String::new(),
        curvature_class: CurvatureClass::Planar,
        modified: false,
    };
    let err = segment(
        &tess,
        &curvature,
        &[region("a", vec![0, 1, 2]), region("b", vec![2, 3])],
        &SegmentOptions::default(),
    )
    .unwrap_err();
    assert_eq!(
        err,
        SegmentationError::OverlappingRegions {
            id: "b".to_string(),
            other: "a".to_string(),
            face: 2
        }
    );
}

#[test]
fn test_size_mismatch_is_rejected() {
    let (tess, _) = analyze(&ControlCage::unit_cube(), 1);
    let (_, other) = analyze(&ControlCage::unit_cube(), 2);
    assert!(matches!(
        segment(&tess, &other, &[], &SegmentOptions::default()),
        Err(SegmentationError::SizeMismatch { .. })
    ));
}

// ============================================================================
// RegionSet editing
// ============================================================================

#[test]
fn test_pin_survives_resegmentation() {
    let (tess, curvature) = analyze(&ControlCage::unit_cube(), 2);
    let mut set = RegionSet::new(&tess, &curvature, SegmentOptions::default()).expect("set");
    set.segment().expect("segment");
    let chosen = set.regions()[set.len() - 1].clone();
    set.pin(&chosen.id, true).expect("pin");

    set.set_options(SegmentOptions::default().with_variance_threshold(0.5));
    set.segment().expect("resegment");

    let kept = &set.regions()[0];
    assert_eq!(kept.id, chosen.id);
    assert_eq!(kept.faces, chosen.faces);
    assert!(kept.pinned);
    assert_partition(set.regions(), tess.triangle_count());
}

#[test]
fn test_split_then_merge_restores_faces() {
    let mut set = flat_set();
    let total = set.triangle_count();

    let new_id = set.split("region_0", &[0, 1, 2, 3]).expect("split");
    assert_eq!(new_id, "region_1");
    assert_eq!(set.len(), 2);
    assert_eq!(set.get("region_0").map(Region::len), Some(total - 4));
    assert_eq!(set.get("region_1").map(|r| r.faces.clone()), Some(vec![0, 1, 2, 3]));
    assert!(set.iter().all(|r| r.modified));

    let kept = set.merge(&["region_0", "region_1"]).expect("merge");
    assert_eq!(kept, "region_0");
    assert_eq!(set.len(), 1);
    assert_eq!(set.regions()[0].len(), total);
    assert!(set.unassigned_triangles().is_empty());
}

#[test]
fn test_split_rejects_bad_parts() {
    let mut set = flat_set();
    let all: Vec<usize> = (0..set.triangle_count()).collect();
    assert!(matches!(
        set.split("region_0", &all),
        Err(SegmentationError::EmptyRegion { .. })
    ));
    assert!(matches!(
        set.split("region_0", &[]),
        Err(SegmentationError::EmptyRegion { .. })
    ));
    assert!(matches!(
        set.split("region_0", &[set.triangle_count()]),
        Err(SegmentationError::InvalidFaceIndex { .. })
    ));
    assert_eq!(
        set.split("missing", &[0]).unwrap_err(),
        SegmentationError::UnknownRegion {
            id: "missing".to_string()
        }
    );
}

#[test]
fn test_edit_rescoring_and_overlap() {
    let mut set = flat_set();
    set.split("region_0", &[0, 1, 2, 3]).expect("split");

    let err = set.edit("region_0", &[0, 10]).unwrap_err();
    assert!(matches!(err, SegmentationError::OverlappingRegions { face: 0, .. }));

    set.edit("region_1", &[2, 1, 1, 0]).expect("edit");
    let edited = set.get("region_1").expect("region_1");
    assert_eq!(edited.faces, vec![0, 1, 2], "faces are sorted and deduplicated");
    assert!((edited.unity_strength - 1.0).abs() < 1e-12);
    assert_eq!(set.unassigned_triangles(), vec![3]);

    assert!(matches!(
        set.edit("region_1", &[]),
        Err(SegmentationError::EmptyRegion { .. })
    ));
}

#[test]
fn test_merge_rules() {
    let mut set = flat_set();
    set.split("region_0", &[0, 1]).expect("split");

    assert!(matches!(
        set.merge(&["region_0"]),
        Err(SegmentationError::InsufficientRegions { count: 1 })
    ));
    assert!(matches!(
        set.merge(&["region_0", "region_0"]),
        Err(SegmentationError::InsufficientRegions { .. })
    ));

    set.pin("region_1", true).expect("pin");
    assert_eq!(
        set.merge(&["region_0", "region_1"]).unwrap_err(),
        SegmentationError::PinnedRegion {
            id: "region_1".to_string()
        }
    );
    assert_eq!(set.len(), 2, "failed merge leaves the set untouched");
}
