use std::collections::HashMap;

use serde::Serialize;

use super::{Point3, Tolerance, Vec3};

/// Fallback normal for vertices whose incident triangles are all degenerate.
pub const FALLBACK_NORMAL: Vec3 = Vec3::Z;

/// Triangle mesh produced by refining a control cage.
///
/// `face_parents[t]` is the control-cage face that triangle `t` was refined from and
/// `corner_params[t]` holds the `(u, v)` of its three corners on that face. On an n-gon
/// face `u` spreads the corner sectors over `[0, 1]`; a triangle never straddles two
/// sectors, so corners on a sector's far edge read `u = (k + 1) / n`. Meshes assembled
/// by hand may leave `corner_params` empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Tessellation {
    pub positions: Vec<Point3>,
    pub normals: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
    pub face_parents: Vec<usize>,
    pub corner_params: Vec<[[f64; 2]; 3]>,
}

impl Tessellation {
    /// Splits each quad `[a, b, c, d]` into `[a, b, c]` and `[a, c, d]` and derives
    /// area-weighted vertex normals.
    #[must_use]
    pub fn from_quads(positions: Vec<Point3>, quads: &[[u32; 4]], quad_parents: &[usize]) -> Self {
        let mut triangles = Vec::with_capacity(quads.len() * 2);
        let mut face_parents = Vec::with_capacity(quads.len() * 2);
        for (quad, &parent) in quads.iter().zip(quad_parents) {
            let [a, b, c, d] = *quad;
            triangles.push([a, b, c]);
            triangles.push([a, c, d]);
            face_parents.push(parent);
            face_parents.push(parent);
        }

        let (normals, fallback_count) = compute_vertex_normals(&positions, &triangles);
        if fallback_count > 0 {
            log::warn!("tessellation: {fallback_count} vertices used the fallback normal");
        }

        Self {
            positions,
            normals,
            triangles,
            face_parents,
            corner_params: Vec::new(),
        }
    }

    /// Attaches per-quad corner parameters, split the same way as the quads.
    #[must_use]
    pub fn with_corner_params(mut self, quad_params: &[[[f64; 2]; 4]]) -> Self {
        self.corner_params = quad_params
            .iter()
            .flat_map(|&[a, b, c, d]| [[a, b, c], [a, c, d]])
            .collect();
        self
    }

    /// Whether every triangle knows where its corners sit on the parent cage face.
    #[must_use]
    pub fn has_corner_params(&self) -> bool {
        !self.triangles.is_empty() && self.corner_params.len() == self.triangles.len()
    }

    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Checks the structural invariants: in-range indices, one parent and one unit normal
    /// per element, finite coordinates.
    pub fn validate(&self) -> Result<(), String> {
        if self.face_parents.len() != self.triangles.len() {
            return Err(format!(
                "face_parents has {} entries for {} triangles",
                self.face_parents.len(),
                self.triangles.len()
            ));
        }
        if !self.corner_params.is_empty() && self.corner_params.len() != self.triangles.len() {
            return Err(format!(
                "corner_params has {} entries for {} triangles",
                self.corner_params.len(),
                self.triangles.len()
            ));
        }
        if self.normals.len() != self.positions.len() {
            return Err("normal buffer does not match vertex count".to_string());
        }
        if self.positions.iter().any(|p| !p.is_finite()) {
            return Err("tessellation has invalid vertex coordinates (NaN/Inf)".to_string());
        }
        let n = self.positions.len();
        if self
            .triangles
            .iter()
            .any(|tri| tri.iter().any(|&i| i as usize >= n))
        {
            return Err("tessellation has out-of-bounds vertex indices".to_string());
        }
        if self
            .normals
            .iter()
            .any(|normal| !Tolerance::LOOSE.approx_eq_f64(normal.length(), 1.0))
        {
            return Err("tessellation has non-unit normals".to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn triangle_points(&self, triangle: usize) -> [Point3; 3] {
        let [a, b, c] = self.triangles[triangle];
        [
            self.positions[a as usize],
            self.positions[b as usize],
            self.positions[c as usize],
        ]
    }

    #[must_use]
    pub fn triangle_area(&self, triangle: usize) -> f64 {
        let [a, b, c] = self.triangle_points(triangle);
        0.5 * b.sub_point(a).cross(c.sub_point(a)).length()
    }

    #[must_use]
    pub fn total_area(&self) -> f64 {
        (0..self.triangles.len()).map(|t| self.triangle_area(t)).sum()
    }

    /// Edge-adjacent triangle across each edge `(v[k], v[k+1])`, `None` on the boundary
    /// or where more than two triangles meet.
    #[must_use]
    pub fn triangle_neighbors(&self) -> Vec<[Option<usize>; 3]> {
        let mut edge_owners: HashMap<(u32, u32), Vec<(usize, usize)>> = HashMap::new();
        for (t, tri) in self.triangles.iter().enumerate() {
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                edge_owners
                    .entry((a.min(b), a.max(b)))
                    .or_default()
                    .push((t, k));
            }
        }

        let mut neighbors = vec![[None; 3]; self.triangles.len()];
        for owners in edge_owners.values() {
            if let [(t0, k0), (t1, k1)] = owners.as_slice() {
                neighbors[*t0][*k0] = Some(*t1);
                neighbors[*t1][*k1] = Some(*t0);
            }
        }
        neighbors
    }

    /// Flags vertices lying on an edge used by only one triangle.
    #[must_use]
    pub fn boundary_vertices(&self) -> Vec<bool> {
        let mut counts: HashMap<(u32, u32), u32> = HashMap::new();
        for tri in &self.triangles {
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                *counts.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }

        let mut boundary = vec![false; self.positions.len()];
        for (&(a, b), &count) in &counts {
            if count == 1 {
                boundary[a as usize] = true;
                boundary[b as usize] = true;
            }
        }
        boundary
    }
}

/// Area-weighted vertex normals. Returns the normals and how many vertices fell back
/// to [`FALLBACK_NORMAL`].
#[must_use]
pub fn compute_vertex_normals(positions: &[Point3], triangles: &[[u32; 3]]) -> (Vec<Vec3>, usize) {
    let mut sums = vec![Vec3::ZERO; positions.len()];
    for tri in triangles {
        let [a, b, c] = tri.map(|i| positions[i as usize]);
        // The unnormalized cross product weights each face by twice its area.
        let face_normal = b.sub_point(a).cross(c.sub_point(a));
        for &i in tri {
            sums[i as usize] += face_normal;
        }
    }

    let mut fallback_count = 0;
    let normals = sums
        .into_iter()
        .map(|sum| {
            sum.normalized().unwrap_or_else(|| {
                fallback_count += 1;
                FALLBACK_NORMAL
            })
        })
        .collect();
    (normals, fallback_count)
}
