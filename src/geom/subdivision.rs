//! Catmull-Clark subdivision: refinement, limit projection and exact limit evaluation.
//!
//! [`SubdivisionEvaluator`] binds one [`ControlCage`] and moves through the states
//! `Uninitialized → Initialized → Tessellated`. Tessellation is legal once; point-wise
//! limit evaluation is legal in both bound states and never touches the tessellation.
//!
//! # Example
//! ```ignore
//! use mold_engine::geom::{ControlCage, SubdivisionEvaluator};
//!
//! let mut evaluator = SubdivisionEvaluator::new();
//! evaluator.initialize(&ControlCage::unit_cube())?;
//! let tess = evaluator.tessellate(2)?;
//! assert_eq!(tess.triangle_count(), 192);
//!
//! let corner = evaluator.evaluate_limit_point(0, 0.0, 0.0)?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;

use serde::Serialize;

use super::cage::ControlCage;
use super::cancel::{CancellationToken, Cancelled};
use super::mesh::{FALLBACK_NORMAL, Tessellation};
use super::{Point3, Vec3};

/// Deepest uniform refinement accepted by [`SubdivisionEvaluator::tessellate`].
pub const MAX_TESSELLATION_LEVEL: u32 = 8;

/// Local refinement depth after which limit evaluation interpolates bilinearly.
pub const MAX_LIMIT_DEPTH: usize = 12;

/// Faces processed between cancellation checks.
const FACE_BATCH: usize = 4096;

/// Parameter step for finite-difference limit normals.
const NORMAL_STEP: f64 = 1e-4;

/// Distance in parameter space at which a point is read as a patch corner.
const CORNER_SNAP: f64 = 1e-12;

/// Distance in scaled `u` at which an n-gon point is read as lying on a sector seam.
const SECTOR_SNAP: f64 = 1e-9;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubdivisionError {
    #[error("evaluator has no control cage; call initialize first")]
    NotInitialized,

    #[error("evaluator is already bound to a control cage")]
    AlreadyInitialized,

    #[error("evaluator has already produced a tessellation; construct a fresh evaluator")]
    AlreadyTessellated,

    #[error("tessellation level {level} is outside 1..={max}")]
    InvalidLevel { level: u32, max: u32 },

    #[error("face index {index} is out of range for a cage with {face_count} faces")]
    InvalidFaceIndex { index: usize, face_count: usize },

    #[error("limit parameters ({u}, {v}) must lie in [0, 1]")]
    InvalidParameter { u: f64, v: f64 },

    #[error("tessellation would need {vertex_count} vertices, beyond 32-bit indexing")]
    TooLarge { vertex_count: usize },

    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },

    #[error("subdivision cancelled")]
    Cancelled,
}

impl From<Cancelled> for SubdivisionError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Debug, Clone)]
pub struct SubdEdge {
    /// Endpoints, smaller index first.
    pub vertices: (usize, usize),
    /// Faces sharing this edge.
    pub faces: Vec<usize>,
}

impl SubdEdge {
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        self.faces.len() < 2
    }
}

/// Role of a vertex in the refinement and limit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexClass {
    Interior,
    /// On the boundary, with its two boundary-edge neighbours.
    Boundary([usize; 2]),
    /// Fixed: a single incident face, no faces at all, or non-manifold boundary.
    Corner,
}

/// Polygon mesh with the adjacency needed by Catmull-Clark.
#[derive(Debug, Clone, Default)]
pub struct SubdMesh {
    pub positions: Vec<Point3>,
    pub faces: Vec<Vec<usize>>,
    pub edges: Vec<SubdEdge>,
    edge_lookup: HashMap<(usize, usize), usize>,
    vertex_faces: Vec<Vec<usize>>,
    vertex_edges: Vec<Vec<usize>>,
}

/// Result of one refinement pass. Child `k` of parent face `f` is
/// `mesh.faces[child_offsets[f] + k]`, the quad at the parent's `k`-th corner.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub mesh: SubdMesh,
    pub child_offsets: Vec<usize>,
}

impl SubdMesh {
    #[must_use]
    pub fn from_cage(cage: &ControlCage) -> Self {
        Self::from_parts(cage.vertices().to_vec(), cage.faces().to_vec())
    }

    #[must_use]
    pub fn from_parts(positions: Vec<Point3>, faces: Vec<Vec<usize>>) -> Self {
        let mut mesh = Self {
            positions,
            faces,
            ..Self::default()
        };
        mesh.rebuild_topology();
        mesh
    }

    /// Rebuilds edges and vertex adjacency from the face vertex lists.
    pub fn rebuild_topology(&mut self) {
        let vertex_count = self.positions.len();
        let mut edges: Vec<SubdEdge> = Vec::new();
        let mut edge_lookup = HashMap::new();
        let mut vertex_faces = vec![Vec::new(); vertex_count];
        let mut vertex_edges = vec![Vec::new(); vertex_count];

        for (face_index, face) in self.faces.iter().enumerate() {
            let n = face.len();
            for (k, &a) in face.iter().enumerate() {
                vertex_faces[a].push(face_index);
                let b = face[(k + 1) % n];
                let key = normalized_edge_pair(a, b);
                let edge_index = *edge_lookup.entry(key).or_insert_with(|| {
                    edges.push(SubdEdge {
                        vertices: key,
                        faces: Vec::new(),
                    });
                    vertex_edges[key.0].push(edges.len() - 1);
                    vertex_edges[key.1].push(edges.len() - 1);
                    edges.len() - 1
                });
                edges[edge_index].faces.push(face_index);
            }
        }

        self.edges = edges;
        self.edge_lookup = edge_lookup;
        self.vertex_faces = vertex_faces;
        self.vertex_edges = vertex_edges;
    }

    #[must_use]
    pub fn edge_between(&self, a: usize, b: usize) -> Option<usize> {
        self.edge_lookup.get(&normalized_edge_pair(a, b)).copied()
    }

    #[must_use]
    pub fn vertex_faces(&self, vertex: usize) -> &[usize] {
        &self.vertex_faces[vertex]
    }

    /// Faces sharing an edge with `face`, in edge order, without duplicates.
    #[must_use]
    pub fn face_neighbors(&self, face: usize) -> Vec<usize> {
        let verts = &self.faces[face];
        let mut neighbors = Vec::new();
        for (k, &a) in verts.iter().enumerate() {
            let b = verts[(k + 1) % verts.len()];
            let Some(edge) = self.edge_between(a, b) else {
                continue;
            };
            for &other in &self.edges[edge].faces {
                if other != face && !neighbors.contains(&other) {
                    neighbors.push(other);
                }
            }
        }
        neighbors
    }

    #[must_use]
    pub fn vertex_class(&self, vertex: usize) -> VertexClass {
        let faces = &self.vertex_faces[vertex];
        if faces.len() <= 1 {
            return VertexClass::Corner;
        }

        let boundary: Vec<usize> = self.vertex_edges[vertex]
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|edge| edge.is_boundary())
            .map(|edge| other_endpoint(edge.vertices, vertex))
            .collect();

        match boundary.as_slice() {
            [] => VertexClass::Interior,
            [a, b] => VertexClass::Boundary([*a, *b]),
            _ => VertexClass::Corner,
        }
    }

    fn face_point(&self, face: usize) -> Point3 {
        let verts = &self.faces[face];
        let weight = 1.0 / verts.len() as f64;
        let terms: Vec<(Point3, f64)> = verts.iter().map(|&v| (self.positions[v], weight)).collect();
        Point3::weighted_sum(&terms)
    }

    /// One uniform Catmull-Clark pass.
    #[must_use]
    pub fn refine(&self) -> Refinement {
        match self.refine_checked(|| Ok::<(), Infallible>(())) {
            Ok(refinement) => refinement,
            Err(never) => match never {},
        }
    }

    /// One uniform Catmull-Clark pass, checking `token` between face batches.
    ///
    /// # Errors
    /// Returns [`Cancelled`] when the token fires mid-pass.
    pub fn refine_with_cancel(&self, token: &CancellationToken) -> Result<Refinement, Cancelled> {
        self.refine_checked(|| token.check())
    }

    fn refine_checked<E>(&self, check: impl Fn() -> Result<(), E>) -> Result<Refinement, E> {
        let vertex_count = self.positions.len();
        let edge_count = self.edges.len();

        let face_points: Vec<Point3> = (0..self.faces.len()).map(|f| self.face_point(f)).collect();

        let edge_points: Vec<Point3> = self
            .edges
            .iter()
            .map(|edge| {
                let (a, b) = edge.vertices;
                let (pa, pb) = (self.positions[a], self.positions[b]);
                match edge.faces.as_slice() {
                    [f0, f1] => Point3::weighted_sum(&[
                        (pa, 0.25),
                        (pb, 0.25),
                        (face_points[*f0], 0.25),
                        (face_points[*f1], 0.25),
                    ]),
                    _ => pa.lerp(pb, 0.5),
                }
            })
            .collect();

        check()?;

        let vertex_points: Vec<Point3> = (0..vertex_count)
            .map(|v| {
                let p = self.positions[v];
                match self.vertex_class(v) {
                    VertexClass::Corner => p,
                    VertexClass::Boundary([a, b]) => Point3::weighted_sum(&[
                        (self.positions[a], 0.125),
                        (p, 0.75),
                        (self.positions[b], 0.125),
                    ]),
                    VertexClass::Interior => {
                        let incident_edges = &self.vertex_edges[v];
                        let incident_faces = &self.vertex_faces[v];
                        let n = incident_edges.len() as f64;
                        let q = Point3::weighted_sum(
                            &incident_faces
                                .iter()
                                .map(|&f| (face_points[f], 1.0 / incident_faces.len() as f64))
                                .collect::<Vec<_>>(),
                        );
                        let r = Point3::weighted_sum(
                            &incident_edges
                                .iter()
                                .map(|&e| {
                                    let (a, b) = self.edges[e].vertices;
                                    (self.positions[a].lerp(self.positions[b], 0.5), 1.0 / n)
                                })
                                .collect::<Vec<_>>(),
                        );
                        Point3::weighted_sum(&[(q, 1.0 / n), (r, 2.0 / n), (p, (n - 3.0) / n)])
                    }
                }
            })
            .collect();

        let mut positions = Vec::with_capacity(vertex_count + edge_count + self.faces.len());
        positions.extend(vertex_points);
        positions.extend(edge_points);
        positions.extend(face_points);

        let edge_base = vertex_count;
        let face_base = vertex_count + edge_count;
        let mut faces = Vec::new();
        let mut child_offsets = Vec::with_capacity(self.faces.len());

        for (face_index, verts) in self.faces.iter().enumerate() {
            if face_index % FACE_BATCH == 0 {
                check()?;
            }
            child_offsets.push(faces.len());
            let n = verts.len();
            for k in 0..n {
                let prev = verts[(k + n - 1) % n];
                let here = verts[k];
                let next = verts[(k + 1) % n];
                // Edge lookups cannot miss: both edges were registered from this face.
                let outgoing = self.edge_between(here, next).unwrap_or_default();
                let incoming = self.edge_between(prev, here).unwrap_or_default();
                faces.push(vec![
                    here,
                    edge_base + outgoing,
                    face_base + face_index,
                    edge_base + incoming,
                ]);
            }
        }

        Ok(Refinement {
            mesh: Self::from_parts(positions, faces),
            child_offsets,
        })
    }

    /// True when every face touching `vertex` is a quad, which the limit masks require.
    #[must_use]
    pub fn is_quad_neighborhood(&self, vertex: usize) -> bool {
        self.vertex_faces[vertex]
            .iter()
            .all(|&f| self.faces[f].len() == 4)
    }

    /// Limit position of a vertex whose neighbourhood is all quads.
    #[must_use]
    pub fn limit_position(&self, vertex: usize) -> Point3 {
        let p = self.positions[vertex];
        match self.vertex_class(vertex) {
            VertexClass::Corner => p,
            VertexClass::Boundary([a, b]) => Point3::weighted_sum(&[
                (self.positions[a], 1.0 / 6.0),
                (p, 4.0 / 6.0),
                (self.positions[b], 1.0 / 6.0),
            ]),
            VertexClass::Interior => {
                let n = self.vertex_edges[vertex].len() as f64;
                let denom = n * (n + 5.0);
                let mut terms = vec![(p, n * n / denom)];
                for &e in &self.vertex_edges[vertex] {
                    let neighbor = other_endpoint(self.edges[e].vertices, vertex);
                    terms.push((self.positions[neighbor], 4.0 / denom));
                }
                for &f in &self.vertex_faces[vertex] {
                    let verts = &self.faces[f];
                    if let Some(k) = verts.iter().position(|&v| v == vertex) {
                        terms.push((self.positions[verts[(k + 2) % verts.len()]], 1.0 / denom));
                    }
                }
                Point3::weighted_sum(&terms)
            }
        }
    }

    fn next_after(&self, face: usize, vertex: usize) -> Option<usize> {
        let verts = &self.faces[face];
        let k = verts.iter().position(|&v| v == vertex)?;
        Some(verts[(k + 1) % verts.len()])
    }

    /// The face whose boundary walks `a → b`.
    fn face_with_directed_edge(&self, a: usize, b: usize) -> Option<usize> {
        self.vertex_faces[a]
            .iter()
            .copied()
            .find(|&f| self.next_after(f, a) == Some(b))
    }

    /// The 4×4 B-spline control net of a regular quad, indexed `[u][v]`, or `None` when
    /// any corner is not an interior valence-4 vertex surrounded by quads.
    fn regular_patch(&self, face: usize) -> Option<[[Point3; 4]; 4]> {
        let &[c0, c1, c2, c3] = self.faces[face].as_slice() else {
            return None;
        };
        for c in [c0, c1, c2, c3] {
            if self.vertex_class(c) != VertexClass::Interior
                || self.vertex_faces[c].len() != 4
                || !self.is_quad_neighborhood(c)
            {
                return None;
            }
        }

        let bottom = self.face_with_directed_edge(c1, c0)?;
        let p10 = self.next_after(bottom, c0)?;
        let p20 = self.next_after(bottom, p10)?;

        let right = self.face_with_directed_edge(c2, c1)?;
        let p31 = self.next_after(right, c1)?;
        let p32 = self.next_after(right, p31)?;

        let top = self.face_with_directed_edge(c3, c2)?;
        let p23 = self.next_after(top, c2)?;
        let p13 = self.next_after(top, p23)?;

        let left = self.face_with_directed_edge(c0, c3)?;
        let p02 = self.next_after(left, c3)?;
        let p01 = self.next_after(left, p02)?;

        let p00 = self.next_after(self.face_with_directed_edge(c0, p01)?, p01)?;
        let p30 = self.next_after(self.face_with_directed_edge(c1, p20)?, p20)?;
        let p33 = self.next_after(self.face_with_directed_edge(c2, p32)?, p32)?;
        let p03 = self.next_after(self.face_with_directed_edge(c3, p13)?, p13)?;

        let at = |i: usize| self.positions[i];
        Some([
            [at(p00), at(p01), at(p02), at(p03)],
            [at(p10), at(c0), at(c3), at(p13)],
            [at(p20), at(c1), at(c2), at(p23)],
            [at(p30), at(p31), at(p32), at(p33)],
        ])
    }

    /// Faces touching any vertex of `face`, compacted into a standalone mesh. Returns the
    /// submesh and the index of `face` inside it.
    fn one_ring_submesh(&self, face: usize) -> (Self, usize) {
        let mut face_set: Vec<usize> = self.faces[face]
            .iter()
            .flat_map(|&v| self.vertex_faces[v].iter().copied())
            .collect();
        face_set.sort_unstable();
        face_set.dedup();

        let mut remap: BTreeMap<usize, usize> = BTreeMap::new();
        let mut positions = Vec::new();
        let mut faces = Vec::with_capacity(face_set.len());
        let mut target = 0;
        for (local, &f) in face_set.iter().enumerate() {
            if f == face {
                target = local;
            }
            let verts = self.faces[f]
                .iter()
                .map(|&v| {
                    *remap.entry(v).or_insert_with(|| {
                        positions.push(self.positions[v]);
                        positions.len() - 1
                    })
                })
                .collect();
            faces.push(verts);
        }
        (Self::from_parts(positions, faces), target)
    }
}

#[inline]
fn normalized_edge_pair(a: usize, b: usize) -> (usize, usize) {
    if a <= b { (a, b) } else { (b, a) }
}

#[inline]
fn other_endpoint(edge: (usize, usize), vertex: usize) -> usize {
    if edge.0 == vertex { edge.1 } else { edge.0 }
}

// ============================================================================
// Limit evaluation
// ============================================================================

/// Uniform cubic B-spline basis at `t ∈ [0, 1]`.
#[must_use]
pub fn bspline_basis(t: f64) -> [f64; 4] {
    let s = 1.0 - t;
    let t2 = t * t;
    let t3 = t2 * t;
    [
        s * s * s / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// Regular bicubic patch over a 4×4 control net indexed `net[u][v]`.
#[must_use]
pub fn evaluate_bspline_patch(net: &[[Point3; 4]; 4], u: f64, v: f64) -> Point3 {
    let bu = bspline_basis(u);
    let bv = bspline_basis(v);
    let mut terms = Vec::with_capacity(16);
    for (i, column) in net.iter().enumerate() {
        for (j, &p) in column.iter().enumerate() {
            terms.push((p, bu[i] * bv[j]));
        }
    }
    Point3::weighted_sum(&terms)
}

fn corner_index(u: f64, v: f64) -> Option<usize> {
    let at = |x: f64, target: f64| (x - target).abs() <= CORNER_SNAP;
    [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
        .iter()
        .position(|&(cu, cv)| at(u, cu) && at(v, cv))
}

/// Parameters of a child quad's corners on its parent, by the same midpoint rule the
/// refinement uses to place the child's vertices.
fn child_corner_params(parent: &[[f64; 2]; 4], k: usize) -> [[f64; 2]; 4] {
    let mid = |a: [f64; 2], b: [f64; 2]| [0.5 * (a[0] + b[0]), 0.5 * (a[1] + b[1])];
    let centre = [
        0.25 * parent.iter().map(|c| c[0]).sum::<f64>(),
        0.25 * parent.iter().map(|c| c[1]).sum::<f64>(),
    ];
    [
        parent[k],
        mid(parent[k], parent[(k + 1) % 4]),
        centre,
        mid(parent[(k + 3) % 4], parent[k]),
    ]
}

/// Parameters of the `k`-th corner quad of an `n`-sided cage face.
fn cage_child_params(n: usize, k: usize) -> [[f64; 2]; 4] {
    if n == 4 {
        return child_corner_params(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]], k);
    }
    let (lo, hi) = (k as f64 / n as f64, (k + 1) as f64 / n as f64);
    [[lo, 0.0], [hi, 0.0], [hi, 1.0], [lo, 1.0]]
}

/// Rewrites `(u, v)` read inside sector `k` of an n-gon so that evaluation lands in the
/// same sector. The far edge `s = 1` of sector `k` is the `t = 1` edge of sector `k + 1`
/// and the face centre is `(1, 1)`.
fn sector_canonical(n: usize, k: usize, u: f64, v: f64) -> (f64, f64) {
    let s = u * n as f64 - k as f64;
    if s < 1.0 - SECTOR_SNAP {
        return (u, v);
    }
    if v >= 1.0 - SECTOR_SNAP {
        return (1.0, 1.0);
    }
    (((k + 1) % n) as f64 / n as f64 + v / n as f64, 1.0)
}

/// Child quad containing `(u, v)` and the parameters inside it. Child `k` starts at
/// corner `k` and runs toward corner `k + 1`.
fn quadrant(u: f64, v: f64) -> (usize, f64, f64) {
    match (u < 0.5, v < 0.5) {
        (true, true) => (0, 2.0 * u, 2.0 * v),
        (false, true) => (1, 2.0 * v, 2.0 * (1.0 - u)),
        (false, false) => (2, 2.0 * (1.0 - u), 2.0 * (1.0 - v)),
        (true, false) => (3, 2.0 * (1.0 - v), 2.0 * u),
    }
}

fn evaluate_on_mesh(mesh: &SubdMesh, face: usize, u: f64, v: f64) -> Point3 {
    let n = mesh.faces[face].len();
    if n == 4 {
        return evaluate_quad(mesh, face, u, v, 0);
    }

    // N-gons are parameterized by spreading u over their n corner quads.
    let (local, target) = mesh.one_ring_submesh(face);
    let refined = local.refine();
    let mut scaled = u * n as f64;
    if (scaled - scaled.round()).abs() <= SECTOR_SNAP {
        scaled = scaled.round();
    }
    let k = (scaled.floor() as usize).min(n - 1);
    let s = (scaled - k as f64).clamp(0.0, 1.0);
    evaluate_quad(&refined.mesh, refined.child_offsets[target] + k, s, v, 1)
}

fn evaluate_quad(mesh: &SubdMesh, face: usize, u: f64, v: f64, depth: usize) -> Point3 {
    let verts = &mesh.faces[face];

    if let Some(k) = corner_index(u, v) {
        if mesh.is_quad_neighborhood(verts[k]) {
            return mesh.limit_position(verts[k]);
        }
    }

    if let Some(net) = mesh.regular_patch(face) {
        return evaluate_bspline_patch(&net, u, v);
    }

    if depth >= MAX_LIMIT_DEPTH {
        let corner = |k: usize| {
            if mesh.is_quad_neighborhood(verts[k]) {
                mesh.limit_position(verts[k])
            } else {
                mesh.positions[verts[k]]
            }
        };
        let bottom = corner(0).lerp(corner(1), u);
        let top = corner(3).lerp(corner(2), u);
        return bottom.lerp(top, v);
    }

    let (local, target) = mesh.one_ring_submesh(face);
    let refined = local.refine();
    let (k, s, t) = quadrant(u, v);
    evaluate_quad(
        &refined.mesh,
        refined.child_offsets[target] + k,
        s.clamp(0.0, 1.0),
        t.clamp(0.0, 1.0),
        depth + 1,
    )
}

// ============================================================================
// Evaluator
// ============================================================================

/// A point on the limit surface and the parameters that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimitPoint {
    pub position: Point3,
    pub face: usize,
    pub u: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    Uninitialized,
    Initialized,
    Tessellated,
}

#[derive(Debug, Clone, Default)]
enum Lifecycle {
    #[default]
    Uninitialized,
    Initialized(SubdMesh),
    Tessellated(SubdMesh),
}

/// Single-use subdivision evaluator for one control cage.
#[derive(Debug, Clone, Default)]
pub struct SubdivisionEvaluator {
    lifecycle: Lifecycle,
}

impl SubdivisionEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `new` followed by `initialize`.
    #[must_use]
    pub fn from_cage(cage: &ControlCage) -> Self {
        Self {
            lifecycle: Lifecycle::Initialized(SubdMesh::from_cage(cage)),
        }
    }

    #[must_use]
    pub fn state(&self) -> EvaluatorState {
        match self.lifecycle {
            Lifecycle::Uninitialized => EvaluatorState::Uninitialized,
            Lifecycle::Initialized(_) => EvaluatorState::Initialized,
            Lifecycle::Tessellated(_) => EvaluatorState::Tessellated,
        }
    }

    /// Binds `cage`. Legal only on a fresh evaluator.
    ///
    /// # Errors
    /// Returns [`SubdivisionError::AlreadyInitialized`] if a cage is already bound.
    pub fn initialize(&mut self, cage: &ControlCage) -> Result<(), SubdivisionError> {
        if !matches!(self.lifecycle, Lifecycle::Uninitialized) {
            return Err(SubdivisionError::AlreadyInitialized);
        }
        log::debug!(
            "subdivision: bound cage with {} vertices / {} faces",
            cage.vertex_count(),
            cage.face_count()
        );
        self.lifecycle = Lifecycle::Initialized(SubdMesh::from_cage(cage));
        Ok(())
    }

    /// The bound control mesh, if any.
    #[must_use]
    pub fn control_mesh(&self) -> Option<&SubdMesh> {
        match &self.lifecycle {
            Lifecycle::Uninitialized => None,
            Lifecycle::Initialized(mesh) | Lifecycle::Tessellated(mesh) => Some(mesh),
        }
    }

    #[must_use]
    pub fn face_count(&self) -> usize {
        self.control_mesh().map_or(0, |mesh| mesh.faces.len())
    }

    /// Uniformly refines the cage `level` times and returns the limit-projected mesh.
    ///
    /// # Errors
    /// See [`tessellate_with_cancel`](Self::tessellate_with_cancel).
    pub fn tessellate(&mut self, level: u32) -> Result<Tessellation, SubdivisionError> {
        self.tessellate_with_cancel(level, &CancellationToken::new())
    }

    /// Like [`tessellate`](Self::tessellate), checking `token` between refinement passes
    /// and face batches. A failed or cancelled call leaves the evaluator `Initialized`.
    ///
    /// # Errors
    /// `NotInitialized`, `AlreadyTessellated`, `InvalidLevel`, `TooLarge`, `NonFinite`
    /// or `Cancelled`.
    pub fn tessellate_with_cancel(
        &mut self,
        level: u32,
        token: &CancellationToken,
    ) -> Result<Tessellation, SubdivisionError> {
        let mesh = match &self.lifecycle {
            Lifecycle::Uninitialized => return Err(SubdivisionError::NotInitialized),
            Lifecycle::Tessellated(_) => return Err(SubdivisionError::AlreadyTessellated),
            Lifecycle::Initialized(mesh) => mesh,
        };
        if level == 0 || level > MAX_TESSELLATION_LEVEL {
            return Err(SubdivisionError::InvalidLevel {
                level,
                max: MAX_TESSELLATION_LEVEL,
            });
        }

        let tessellation = tessellate_mesh(mesh, level, token)?;

        if let Lifecycle::Initialized(mesh) = std::mem::take(&mut self.lifecycle) {
            self.lifecycle = Lifecycle::Tessellated(mesh);
        }
        Ok(tessellation)
    }

    /// Exact limit-surface position on cage face `face` at `(u, v) ∈ [0, 1]²`.
    ///
    /// Corners map as `(0,0)`, `(1,0)`, `(1,1)`, `(0,1)` to the face's vertices 0..3.
    ///
    /// # Errors
    /// `NotInitialized`, `InvalidFaceIndex`, `InvalidParameter` or `NonFinite`.
    pub fn evaluate_limit_point(
        &self,
        face: usize,
        u: f64,
        v: f64,
    ) -> Result<LimitPoint, SubdivisionError> {
        let mesh = self.checked_mesh(face, u, v)?;
        let position = evaluate_on_mesh(mesh, face, u, v);
        if !position.is_finite() {
            return Err(SubdivisionError::NonFinite {
                stage: "limit evaluation",
            });
        }
        Ok(LimitPoint {
            position,
            face,
            u,
            v,
        })
    }

    /// Limit point at barycentric `weights` inside a tessellation triangle whose corners
    /// sit at `corners` on cage face `face` (see [`Tessellation::corner_params`]).
    ///
    /// # Errors
    /// Same as [`evaluate_limit_point`](Self::evaluate_limit_point).
    pub fn evaluate_in_triangle(
        &self,
        face: usize,
        corners: &[[f64; 2]; 3],
        weights: [f64; 3],
    ) -> Result<LimitPoint, SubdivisionError> {
        let (u, v) = self.triangle_params(face, corners, weights)?;
        self.evaluate_limit_point(face, u, v)
    }

    /// Face parameters of a point inside a tessellation triangle, in the form
    /// [`evaluate_limit_point`](Self::evaluate_limit_point) reads back to the same spot.
    ///
    /// # Errors
    /// `NotInitialized`, `InvalidFaceIndex` or `InvalidParameter`.
    pub fn triangle_params(
        &self,
        face: usize,
        corners: &[[f64; 2]; 3],
        weights: [f64; 3],
    ) -> Result<(f64, f64), SubdivisionError> {
        let blend = |axis: usize| -> f64 {
            (0..3)
                .map(|i| weights[i] * corners[i][axis])
                .sum::<f64>()
                .clamp(0.0, 1.0)
        };
        let (u, v) = (blend(0), blend(1));

        let mesh = self.checked_mesh(face, u, v)?;
        let n = mesh.faces[face].len();
        if n == 4 {
            return Ok((u, v));
        }

        // The centroid never sits on a seam, so it names the triangle's sector.
        let centroid_u = corners.iter().map(|c| c[0]).sum::<f64>() / 3.0;
        let sector = ((centroid_u * n as f64).floor() as usize).min(n - 1);
        Ok(sector_canonical(n, sector, u, v))
    }

    /// Limit point plus a unit normal from finite differences across the face.
    ///
    /// # Errors
    /// Same as [`evaluate_limit_point`](Self::evaluate_limit_point).
    pub fn evaluate_limit(
        &self,
        face: usize,
        u: f64,
        v: f64,
    ) -> Result<(LimitPoint, Vec3), SubdivisionError> {
        let point = self.evaluate_limit_point(face, u, v)?;
        let mesh = self.checked_mesh(face, u, v)?;

        let (u0, u1) = ((u - NORMAL_STEP).max(0.0), (u + NORMAL_STEP).min(1.0));
        let (v0, v1) = ((v - NORMAL_STEP).max(0.0), (v + NORMAL_STEP).min(1.0));
        let du = evaluate_on_mesh(mesh, face, u1, v).sub_point(evaluate_on_mesh(mesh, face, u0, v));
        let dv = evaluate_on_mesh(mesh, face, u, v1).sub_point(evaluate_on_mesh(mesh, face, u, v0));

        let normal = du.cross(dv).normalized().unwrap_or_else(|| {
            log::debug!("subdivision: degenerate limit normal on face {face} at ({u}, {v})");
            FALLBACK_NORMAL
        });
        Ok((point, normal))
    }

    fn checked_mesh(&self, face: usize, u: f64, v: f64) -> Result<&SubdMesh, SubdivisionError> {
        let mesh = self.control_mesh().ok_or(SubdivisionError::NotInitialized)?;
        if face >= mesh.faces.len() {
            return Err(SubdivisionError::InvalidFaceIndex {
                index: face,
                face_count: mesh.faces.len(),
            });
        }
        if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
            return Err(SubdivisionError::InvalidParameter { u, v });
        }
        Ok(mesh)
    }
}

fn tessellate_mesh(
    root: &SubdMesh,
    level: u32,
    token: &CancellationToken,
) -> Result<Tessellation, SubdivisionError> {
    log::debug!(
        "subdivision: tessellating {} faces at level {level}",
        root.faces.len()
    );

    let mut mesh = root.clone();
    let mut parents: Vec<usize> = (0..root.faces.len()).collect();
    let mut params: Vec<[[f64; 2]; 4]> = Vec::new();
    for pass in 0..level {
        token.check()?;
        let refinement = mesh.refine_with_cancel(token)?;
        let child_count = refinement.mesh.faces.len();
        let mut next_parents = vec![0; child_count];
        let mut next_params = vec![[[0.0; 2]; 4]; child_count];
        for (face, &offset) in refinement.child_offsets.iter().enumerate() {
            let n = mesh.faces[face].len();
            for k in 0..n {
                next_parents[offset + k] = parents[face];
                next_params[offset + k] = if pass == 0 {
                    cage_child_params(n, k)
                } else {
                    child_corner_params(&params[face], k)
                };
            }
        }
        parents = next_parents;
        params = next_params;
        mesh = refinement.mesh;
    }

    token.check()?;
    let vertex_count = mesh.positions.len();
    if u32::try_from(vertex_count).is_err() {
        return Err(SubdivisionError::TooLarge { vertex_count });
    }

    let positions: Vec<Point3> = (0..vertex_count).map(|v| mesh.limit_position(v)).collect();
    if positions.iter().any(|p| !p.is_finite()) {
        return Err(SubdivisionError::NonFinite {
            stage: "limit projection",
        });
    }

    // Every face is a quad after at least one refinement pass.
    let quads: Vec<[u32; 4]> = mesh
        .faces
        .iter()
        .map(|f| [f[0] as u32, f[1] as u32, f[2] as u32, f[3] as u32])
        .collect();

    let tessellation =
        Tessellation::from_quads(positions, &quads, &parents).with_corner_params(&params);
    log::debug!(
        "subdivision: level {level} produced {} vertices / {} triangles",
        tessellation.vertex_count(),
        tessellation.triangle_count()
    );
    Ok(tessellation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadrant_maps_child_corners() {
        // Centre of the parent face is corner 2 of every child.
        for (u, v, k) in [(0.25, 0.25, 0), (0.75, 0.25, 1), (0.75, 0.75, 2), (0.25, 0.75, 3)] {
            let (child, s, t) = quadrant(u, v);
            assert_eq!(child, k);
            assert!((0.0..=1.0).contains(&s) && (0.0..=1.0).contains(&t));
        }
        assert_eq!(quadrant(0.0, 0.0), (0, 0.0, 0.0));
        assert_eq!(quadrant(1.0, 0.0), (1, 0.0, 0.0));
        assert_eq!(quadrant(1.0, 1.0), (2, 0.0, 0.0));
        assert_eq!(quadrant(0.0, 1.0), (3, 0.0, 0.0));
    }

    #[test]
    fn test_child_params_follow_quadrant() {
        let unit = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        for k in 0..4 {
            let child = child_corner_params(&unit, k);
            assert_eq!(child[0], unit[k]);
            assert_eq!(child[2], [0.5, 0.5], "corner 2 of every child is the centre");
            let u = child.iter().map(|c| c[0]).sum::<f64>() / 4.0;
            let v = child.iter().map(|c| c[1]).sum::<f64>() / 4.0;
            let (q, s, t) = quadrant(u, v);
            assert_eq!(q, k);
            assert!((s - 0.5).abs() < 1e-12 && (t - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sector_seams_are_rewritten_into_the_next_sector() {
        let close = |(u, v): (f64, f64), (eu, ev): (f64, f64)| {
            (u - eu).abs() < 1e-12 && (v - ev).abs() < 1e-12
        };
        // Far edge of sector 1 of a pentagon, halfway toward the centre.
        assert!(close(sector_canonical(5, 1, 0.4, 0.5), (0.5, 1.0)));
        // The last sector wraps to the first.
        assert!(close(sector_canonical(5, 4, 1.0, 0.25), (0.05, 1.0)));
        assert_eq!(sector_canonical(5, 2, 0.6, 1.0), (1.0, 1.0));
        // Interior points pass through.
        assert_eq!(sector_canonical(5, 2, 0.5, 0.3), (0.5, 0.3));
    }

    #[test]
    fn test_bspline_basis_partition_of_unity() {
        for t in [0.0, 0.1, 0.5, 0.9, 1.0] {
            let sum: f64 = bspline_basis(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "basis sum at {t} was {sum}");
        }
    }

    #[test]
    fn test_vertex_classes_on_single_quad() {
        let mesh = SubdMesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![vec![0, 1, 2, 3]],
        );
        for v in 0..4 {
            assert_eq!(mesh.vertex_class(v), VertexClass::Corner);
        }
        assert_eq!(mesh.edges.len(), 4);
        assert!(mesh.edges.iter().all(SubdEdge::is_boundary));
    }
}
