mod bvh;
mod cage;
mod cancel;
mod constraints;
mod core;
mod curvature;
mod diagnostics;
mod draft;
mod laplacian;
mod mesh;
mod metrics;
mod pipeline;
mod segmentation;
mod solid;
mod spectral;
mod subdivision;
mod surface;
mod surface_fit;
mod validation;

pub use cage::{CageError, ControlCage};
pub use cancel::{CancellationToken, Cancelled};
pub use constraints::{
    ConstraintError, ConstraintLevel, ConstraintOptions, ConstraintReport, ConstraintValidator,
    ConstraintViolation, MIN_DRAFT_ANGLE_DEGREES, MIN_WALL_THICKNESS,
    RECOMMENDED_DRAFT_ANGLE_DEGREES, UndercutScan,
};
pub use core::{BBox, Point3, Tolerance, Vec3};
pub use curvature::{
    CurvatureClass, CurvatureField, CurvatureThresholds, compute_curvature,
    compute_curvature_with_cancel,
};
pub use diagnostics::MeshDiagnostics;
pub use draft::{
    DraftAnalysis, DraftError, DraftOptions, DraftSample, MAX_DRAFT_ANGLE_DEGREES, analyze_draft,
    apply_draft_angle,
};
pub use laplacian::{
    AnalysisError, COTANGENT_CLAMP, LaplacianOperator, build_laplacian,
    build_laplacian_with_cancel, cotangent, mixed_areas,
};
pub use mesh::{FALLBACK_NORMAL, Tessellation, compute_vertex_normals};
pub use metrics::{GeomMetrics, GeomTimingReport, TimingBucket};
pub use pipeline::{
    EXPORT_TYPE, EXPORT_VERSION, ExportMetadata, MoldError, MoldGenerator, MoldParameters,
    MoldResult, MoldSet, MoldSetExport, MoldSurfaceExport, RegionMolds, SkippedRegion,
};
pub use segmentation::{
    Region, RegionSet, SegmentOptions, SegmentationError, segment, segment_with_cancel,
    validate_region,
};
pub use solid::{
    KeyGeometry, MeshKernel, MeshSolid, MoldSolid, RegistrationKey, Solid, SolidError,
    SolidKernel, SolidOptions, add_registration_keys, add_registration_keys_with,
    create_mold_solid,
};
pub use subdivision::{
    EvaluatorState, LimitPoint, MAX_LIMIT_DEPTH, MAX_TESSELLATION_LEVEL, Refinement, SubdEdge,
    SubdMesh, SubdivisionError, SubdivisionEvaluator, VertexClass, bspline_basis,
    evaluate_bspline_patch,
};
pub use surface::{
    BasisRow, ClosestPoint, NurbsSurface, Surface, basis_row, clamped_uniform_knots,
    closest_point,
};
pub use surface_fit::{
    FitOptions, FittedSurface, MIN_SAMPLE_DENSITY, SurfaceFitError, fit, fit_region,
    fit_region_with_cancel, sample_region_limit,
};
pub use spectral::{
    EigenMode, MAX_SPECTRAL_VERTICES, NodalDomain, SpectralError, compute_eigenmodes,
    nodal_domains, resonance_score, spectral_regions,
};
pub use validation::{
    CHECK_DENSITY, FittingQuality, ValidationError, check_fitting_quality, check_region_quality,
    region_samples,
};

#[cfg(test)]
mod tests;
