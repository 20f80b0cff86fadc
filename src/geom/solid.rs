//! Mold bodies: thickening a drafted face into a closed shell and adding registration keys.
//!
//! The engine only needs two solid operations, thickening and union, so both sit behind
//! [`SolidKernel`]. [`MeshKernel`] implements them on triangle shells: the face is sampled
//! on a grid, offset along its normals and stitched to the offset copy with side walls.
//!
//! Shell layout for a grid of `m` samples: vertices `0..m` are the cavity face (wound
//! against the surface normal), `m..2m` the back face offset by the wall thickness (wound
//! with it), and the rim quads join them along the sheet boundary.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use super::bvh::{Bvh, triangle_bbox, triangles_cross};
use super::diagnostics::MeshDiagnostics;
use super::mesh::compute_vertex_normals;
use super::surface::Surface;
use super::{BBox, Point3, Tolerance, Vec3};

/// Side segments of a registration key cylinder.
const KEY_SEGMENTS: usize = 16;

/// Offset cells shrinking below this fraction of their original area count as collapsed.
const COLLAPSE_RATIO: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolidError {
    #[error("wall thickness must be finite and positive: {thickness}")]
    InvalidThickness { thickness: f64 },

    #[error("grid resolution must be at least 2: {resolution}")]
    InvalidResolution { resolution: usize },

    #[error("thickened shell is not a valid solid: {reason}")]
    NonManifoldResult { reason: String },

    #[error("at least two registration keys are required, got {count}")]
    InsufficientKeys { count: usize },

    #[error("key radius and height must be finite and positive (radius {radius}, height {height})")]
    InvalidKeyGeometry { radius: f64, height: f64 },

    #[error("solid has no parting boundary to place keys on")]
    MissingPartingBoundary,

    #[error("solid kernel failed: {0}")]
    Kernel(String),

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolidOptions {
    /// Grid cells per parametric direction when sampling the face.
    pub resolution: usize,
}

impl Default for SolidOptions {
    fn default() -> Self {
        Self { resolution: 24 }
    }
}

impl SolidOptions {
    #[must_use]
    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }
}

/// Cylinder dimensions of a registration key, in model units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyGeometry {
    pub radius: f64,
    pub height: f64,
}

impl Default for KeyGeometry {
    fn default() -> Self {
        Self {
            radius: 5.0,
            height: 10.0,
        }
    }
}

impl KeyGeometry {
    #[must_use]
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    #[must_use]
    pub fn with_height(mut self, height: f64) -> Self {
        self.height = height;
        self
    }

    fn validate(self) -> Result<Self, SolidError> {
        let ok = |x: f64| x.is_finite() && x > 0.0;
        if ok(self.radius) && ok(self.height) {
            Ok(self)
        } else {
            Err(SolidError::InvalidKeyGeometry {
                radius: self.radius,
                height: self.height,
            })
        }
    }
}

/// Read-only queries every solid representation answers.
pub trait Solid {
    /// Enclosed volume, positive for outward-facing shells.
    fn volume(&self) -> f64;

    fn bounding_box(&self) -> Option<BBox>;

    fn diagnostics(&self) -> MeshDiagnostics;

    fn is_closed(&self) -> bool {
        self.diagnostics().is_valid_solid()
    }
}

/// Thicken and union, the two operations mold synthesis needs from a CAD kernel.
pub trait SolidKernel {
    /// Offsets `surface` by `thickness` along its normals into a closed body.
    ///
    /// # Errors
    /// `InvalidThickness`, `InvalidResolution`, or `NonManifoldResult` when the offset
    /// folds over itself or runs into another part of the shell.
    fn thicken<S: Surface>(
        &self,
        surface: &S,
        thickness: f64,
        options: &SolidOptions,
    ) -> Result<MoldSolid, SolidError>;

    /// # Errors
    /// Kernel-specific failures are reported as `Kernel`.
    fn union(&self, base: &MeshSolid, tool: &MeshSolid) -> Result<MeshSolid, SolidError>;
}

/// Closed triangle shell with outward winding.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MeshSolid {
    pub positions: Vec<Point3>,
    pub triangles: Vec<[u32; 3]>,
}

impl MeshSolid {
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Appends `other` as a separate shell.
    pub fn append(&mut self, other: &MeshSolid) {
        let base = self.positions.len() as u32;
        self.positions.extend_from_slice(&other.positions);
        self.triangles
            .extend(other.triangles.iter().map(|tri| tri.map(|i| i + base)));
    }
}

impl Solid for MeshSolid {
    fn volume(&self) -> f64 {
        self.triangles
            .iter()
            .map(|tri| {
                let [a, b, c] = tri.map(|i| self.positions[i as usize].to_vec3());
                a.dot(b.cross(c))
            })
            .sum::<f64>()
            / 6.0
    }

    fn bounding_box(&self) -> Option<BBox> {
        BBox::from_points(&self.positions)
    }

    fn diagnostics(&self) -> MeshDiagnostics {
        MeshDiagnostics::analyze(&self.positions, &self.triangles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegistrationKey {
    /// Centre of the key's base on the parting boundary.
    pub position: Point3,
    /// Unit axis the key protrudes along.
    pub axis: Vec3,
    pub radius: f64,
    pub height: f64,
}

/// A thickened mold face plus the keys added to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoldSolid {
    pub solid: MeshSolid,
    pub thickness: f64,
    pub draft_angle: f64,
    pub keys: Vec<RegistrationKey>,
    /// Boundary of the cavity face, one closed loop.
    pub parting_loop: Vec<Point3>,
    /// Surface normal at each `parting_loop` point.
    pub parting_normals: Vec<Vec3>,
}

impl MoldSolid {
    #[must_use]
    pub fn with_draft_angle(mut self, angle_degrees: f64) -> Self {
        self.draft_angle = angle_degrees;
        self
    }

    /// Length of the closed parting loop.
    #[must_use]
    pub fn parting_length(&self) -> f64 {
        let n = self.parting_loop.len();
        (0..n)
            .map(|i| self.parting_loop[i].distance_to(self.parting_loop[(i + 1) % n]))
            .sum()
    }
}

impl Solid for MoldSolid {
    fn volume(&self) -> f64 {
        self.solid.volume()
    }

    fn bounding_box(&self) -> Option<BBox> {
        self.solid.bounding_box()
    }

    fn diagnostics(&self) -> MeshDiagnostics {
        self.solid.diagnostics()
    }
}

/// Triangle-shell kernel. `union` concatenates shells, which is exact for disjoint inputs;
/// overlapping volumes stay as separate closed components.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshKernel;

impl SolidKernel for MeshKernel {
    fn thicken<S: Surface>(
        &self,
        surface: &S,
        thickness: f64,
        options: &SolidOptions,
    ) -> Result<MoldSolid, SolidError> {
        if !thickness.is_finite() || thickness <= 0.0 {
            return Err(SolidError::InvalidThickness { thickness });
        }
        if options.resolution < 2 {
            return Err(SolidError::InvalidResolution {
                resolution: options.resolution,
            });
        }
        let n = options.resolution + 1;
        log::debug!("solid: thickening {n}x{n} grid by {thickness}");

        let grid = SampleGrid::sample(surface, n);
        if grid.positions.iter().any(|p| !p.is_finite()) {
            return Err(SolidError::NonFinite { stage: "solid sampling" });
        }
        let offset: Vec<Point3> = grid
            .positions
            .iter()
            .zip(&grid.normals)
            .map(|(&p, &normal)| p + normal * thickness)
            .collect();
        if offset.iter().any(|p| !p.is_finite()) {
            return Err(SolidError::NonFinite { stage: "solid offset" });
        }
        check_offset_cells(&grid.positions, &offset, n)?;

        let solid = stitch_shell(&grid.positions, &offset, n);
        check_self_intersection(&solid)?;
        let diagnostics = solid.diagnostics();
        if !diagnostics.is_valid_solid() {
            return Err(SolidError::NonManifoldResult {
                reason: diagnostics.summary(),
            });
        }
        if solid.volume() <= 0.0 {
            return Err(SolidError::NonManifoldResult {
                reason: "shell encloses no volume".to_string(),
            });
        }

        let ring = boundary_ring(n);
        log::debug!(
            "solid: shell with {} triangles, volume {:.6}",
            solid.triangle_count(),
            solid.volume()
        );
        Ok(MoldSolid {
            solid,
            thickness,
            draft_angle: 0.0,
            keys: Vec::new(),
            parting_loop: ring.iter().map(|&k| grid.positions[k]).collect(),
            parting_normals: ring.iter().map(|&k| grid.normals[k]).collect(),
        })
    }

    fn union(&self, base: &MeshSolid, tool: &MeshSolid) -> Result<MeshSolid, SolidError> {
        let mut combined = base.clone();
        combined.append(tool);
        Ok(combined)
    }
}

/// Thickens `surface` with the built-in [`MeshKernel`].
///
/// # Errors
/// See [`SolidKernel::thicken`].
pub fn create_mold_solid<S: Surface>(
    surface: &S,
    thickness: f64,
    options: &SolidOptions,
) -> Result<MoldSolid, SolidError> {
    MeshKernel.thicken(surface, thickness, options)
}

/// Adds `count` cylindrical keys at equal arc-length spacing along the parting loop,
/// unioned with the built-in [`MeshKernel`].
///
/// # Errors
/// See [`add_registration_keys_with`].
pub fn add_registration_keys(
    solid: &MoldSolid,
    count: usize,
    geometry: &KeyGeometry,
) -> Result<MoldSolid, SolidError> {
    add_registration_keys_with(&MeshKernel, solid, count, geometry)
}

/// Keys protrude from the cavity rim away from the mold body, along the negated surface
/// normal at their boundary point.
///
/// # Errors
/// `InsufficientKeys` for `count < 2`, `InvalidKeyGeometry`, `MissingPartingBoundary` for a
/// zero-length loop, and any error from `kernel.union`.
pub fn add_registration_keys_with(
    kernel: &impl SolidKernel,
    solid: &MoldSolid,
    count: usize,
    geometry: &KeyGeometry,
) -> Result<MoldSolid, SolidError> {
    if count < 2 {
        return Err(SolidError::InsufficientKeys { count });
    }
    let geometry = geometry.validate()?;
    let placements = spaced_along_loop(&solid.parting_loop, &solid.parting_normals, count)?;
    log::debug!("keys: placing {count} keys along loop of length {:.4}", solid.parting_length());

    let mut result = solid.clone();
    for (position, normal) in placements {
        let key = RegistrationKey {
            position,
            axis: -normal,
            radius: geometry.radius,
            height: geometry.height,
        };
        let cylinder = key_cylinder(&key);
        result.solid = kernel.union(&result.solid, &cylinder)?;
        result.keys.push(key);
    }
    if result.solid.positions.iter().any(|p| !p.is_finite()) {
        return Err(SolidError::NonFinite { stage: "registration keys" });
    }
    log::debug!("keys: solid now has {} triangles", result.solid.triangle_count());
    Ok(result)
}

struct SampleGrid {
    positions: Vec<Point3>,
    normals: Vec<Vec3>,
}

impl SampleGrid {
    /// `n × n` samples, `v` outer. Normals come from the surface, or from the sampled grid
    /// where the surface normal degenerates.
    fn sample<S: Surface>(surface: &S, n: usize) -> Self {
        let (u0, u1) = surface.domain_u();
        let (v0, v1) = surface.domain_v();
        let params: Vec<(f64, f64)> = (0..n)
            .flat_map(|j| {
                let v = v0 + (v1 - v0) * j as f64 / (n - 1) as f64;
                (0..n).map(move |i| (u0 + (u1 - u0) * i as f64 / (n - 1) as f64, v))
            })
            .collect();
        let positions: Vec<Point3> = params.iter().map(|&(u, v)| surface.point_at(u, v)).collect();

        let (grid_normals, _) = compute_vertex_normals(&positions, &grid_triangles(n, 0));
        let mut fallbacks = 0;
        let normals = params
            .iter()
            .zip(grid_normals)
            .map(|(&(u, v), fallback)| {
                surface.normal_at(u, v).unwrap_or_else(|| {
                    fallbacks += 1;
                    fallback
                })
            })
            .collect();
        if fallbacks > 0 {
            log::warn!("solid: {fallbacks} samples used grid normals");
        }
        Self { positions, normals }
    }
}

/// Two triangles per cell wound along `∂u × ∂v`, indices shifted by `base`.
fn grid_triangles(n: usize, base: u32) -> Vec<[u32; 3]> {
    let mut triangles = Vec::with_capacity((n - 1) * (n - 1) * 2);
    for j in 0..n - 1 {
        for i in 0..n - 1 {
            let [a, b, c, d] = cell_corners(n, i, j).map(|k| k as u32 + base);
            triangles.push([a, b, c]);
            triangles.push([a, c, d]);
        }
    }
    triangles
}

fn cell_corners(n: usize, i: usize, j: usize) -> [usize; 4] {
    let a = j * n + i;
    [a, a + 1, a + n + 1, a + n]
}

fn cell_normal(points: &[Point3], corners: [usize; 4]) -> Vec3 {
    let [a, b, c, d] = corners.map(|k| points[k]);
    c.sub_point(a).cross(d.sub_point(b))
}

/// Rejects offset cells that turned over or shrank to nothing.
fn check_offset_cells(original: &[Point3], offset: &[Point3], n: usize) -> Result<(), SolidError> {
    for j in 0..n - 1 {
        for i in 0..n - 1 {
            let corners = cell_corners(n, i, j);
            let before = cell_normal(original, corners);
            let area = before.length();
            if area <= Tolerance::DEGENERATE_TRIANGLE.eps {
                continue;
            }
            let after = cell_normal(offset, corners);
            if after.dot(before) <= 0.0 {
                return Err(SolidError::NonManifoldResult {
                    reason: format!("offset cell ({i}, {j}) flips orientation"),
                });
            }
            if after.length() < area * COLLAPSE_RATIO {
                return Err(SolidError::NonManifoldResult {
                    reason: format!("offset cell ({i}, {j}) collapses"),
                });
            }
        }
    }
    Ok(())
}

/// Rejects shells whose faces pass through each other anywhere, not just within one
/// offset cell. Triangles sharing a vertex are neighbours and never tested.
fn check_self_intersection(solid: &MeshSolid) -> Result<(), SolidError> {
    let tol = Tolerance::DEFAULT;
    let Some(bvh) = Bvh::over_triangles(&solid.positions, &solid.triangles, tol.eps) else {
        return Ok(());
    };
    let corners = |t: usize| solid.triangles[t].map(|i| solid.positions[i as usize]);

    let mut hit = None;
    for (i, tri) in solid.triangles.iter().enumerate() {
        let query = triangle_bbox(corners(i)).expanded(tol.eps);
        bvh.query_bbox(query, |j| {
            if j <= i || solid.triangles[j].iter().any(|v| tri.contains(v)) {
                return true;
            }
            if triangles_cross(corners(i), corners(j), tol) {
                hit = Some(j);
                return false;
            }
            true
        });
        if let Some(j) = hit {
            return Err(SolidError::NonManifoldResult {
                reason: format!("shell triangles {i} and {j} intersect"),
            });
        }
    }
    Ok(())
}

/// Grid indices around the sheet boundary, in order, without repeats.
fn boundary_ring(n: usize) -> Vec<usize> {
    let mut ring = Vec::with_capacity(4 * (n - 1));
    ring.extend(0..n - 1);
    ring.extend((0..n - 1).map(|j| j * n + n - 1));
    ring.extend((1..n).rev().map(|i| (n - 1) * n + i));
    ring.extend((1..n).rev().map(|j| j * n));
    ring
}

fn stitch_shell(cavity: &[Point3], back: &[Point3], n: usize) -> MeshSolid {
    let m = cavity.len() as u32;
    let back_triangles = grid_triangles(n, m);

    let mut triangles = Vec::with_capacity(back_triangles.len() * 2 + 8 * (n - 1));
    triangles.extend(grid_triangles(n, 0).into_iter().map(|[a, b, c]| [a, c, b]));

    // The back face's boundary half-edges a->b run along the ring; each rim quad
    // supplies b->a on the back face and a'->b' on the cavity face.
    let ring = boundary_ring(n);
    for k in 0..ring.len() {
        let a = ring[k] as u32 + m;
        let b = ring[(k + 1) % ring.len()] as u32 + m;
        triangles.push([b, a, a - m]);
        triangles.push([b, a - m, b - m]);
    }
    triangles.extend(back_triangles);

    let mut positions = Vec::with_capacity(cavity.len() * 2);
    positions.extend_from_slice(cavity);
    positions.extend_from_slice(back);
    MeshSolid {
        positions,
        triangles,
    }
}

/// Positions and normals at `count` equal arc-length stations around a closed loop.
fn spaced_along_loop(
    points: &[Point3],
    normals: &[Vec3],
    count: usize,
) -> Result<Vec<(Point3, Vec3)>, SolidError> {
    let n = points.len();
    if n < 2 || normals.len() != n {
        return Err(SolidError::MissingPartingBoundary);
    }
    let lengths: Vec<f64> = (0..n)
        .map(|i| points[i].distance_to(points[(i + 1) % n]))
        .collect();
    let total: f64 = lengths.iter().sum();
    if total <= Tolerance::ZERO_LENGTH.eps {
        return Err(SolidError::MissingPartingBoundary);
    }

    let mut stations = Vec::with_capacity(count);
    let mut segment = 0;
    let mut start = 0.0;
    for k in 0..count {
        let target = total * k as f64 / count as f64;
        while segment + 1 < n && start + lengths[segment] < target {
            start += lengths[segment];
            segment += 1;
        }
        let next = (segment + 1) % n;
        let t = if lengths[segment] > 0.0 {
            ((target - start) / lengths[segment]).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let position = points[segment].lerp(points[next], t);
        let blended = normals[segment] * (1.0 - t) + normals[next] * t;
        let normal = blended
            .normalized()
            .or_else(|| normals[segment].normalized())
            .unwrap_or(Vec3::Z);
        stations.push((position, normal));
    }
    Ok(stations)
}

/// Closed cylinder shell for one key.
fn key_cylinder(key: &RegistrationKey) -> MeshSolid {
    let axis = key.axis.normalized().unwrap_or(Vec3::Z);
    let e1 = axis.any_orthogonal();
    let e2 = axis.cross(e1);
    let top_center = key.position + axis * key.height;

    let mut positions = Vec::with_capacity(2 * KEY_SEGMENTS + 2);
    for s in 0..KEY_SEGMENTS {
        let theta = TAU * s as f64 / KEY_SEGMENTS as f64;
        let radial = e1 * (key.radius * theta.cos()) + e2 * (key.radius * theta.sin());
        positions.push(key.position + radial);
        positions.push(top_center + radial);
    }
    let bottom = positions.len() as u32;
    positions.push(key.position);
    positions.push(top_center);
    let top = bottom + 1;

    let mut triangles = Vec::with_capacity(4 * KEY_SEGMENTS);
    for s in 0..KEY_SEGMENTS {
        let b0 = (2 * s) as u32;
        let t0 = b0 + 1;
        let b1 = (2 * ((s + 1) % KEY_SEGMENTS)) as u32;
        let t1 = b1 + 1;
        triangles.push([b0, b1, t1]);
        triangles.push([b0, t1, t0]);
        triangles.push([top, t0, t1]);
        triangles.push([bottom, b1, b0]);
    }
    MeshSolid {
        positions,
        triangles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_ring_visits_each_edge_vertex_once() {
        let ring = boundary_ring(4);
        assert_eq!(ring.len(), 12);
        let mut sorted = ring.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 12);
        assert!(!ring.contains(&5) && !ring.contains(&6));
    }

    #[test]
    fn test_key_cylinder_is_closed_with_expected_volume() {
        let key = RegistrationKey {
            position: Point3::new(1.0, 2.0, 3.0),
            axis: Vec3::X,
            radius: 2.0,
            height: 4.0,
        };
        let cylinder = key_cylinder(&key);
        assert!(cylinder.is_closed(), "{}", cylinder.diagnostics().summary());
        let n = KEY_SEGMENTS as f64;
        let expected = 0.5 * n * 4.0 * (TAU / n).sin() * 4.0;
        assert!((cylinder.volume() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_spaced_along_square_loop() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let normals = vec![Vec3::Z; 4];
        let stations = spaced_along_loop(&points, &normals, 2).unwrap();
        assert!(stations[0].0.distance_to(Point3::new(0.0, 0.0, 0.0)) < 1e-12);
        assert!(stations[1].0.distance_to(Point3::new(1.0, 1.0, 0.0)) < 1e-12);
    }
}
