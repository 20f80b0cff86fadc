//! Bounding-volume hierarchy over mesh triangles, with the triangle tests that run on
//! its leaves.

use super::{BBox, Point3, Tolerance, Vec3};

#[derive(Debug, Clone, Copy)]
struct BvhNode {
    bbox: BBox,
    left: u32,
    right: u32,
    start: u32,
    count: u32,
}

impl BvhNode {
    const fn leaf(bbox: BBox, start: u32, count: u32) -> Self {
        Self {
            bbox,
            left: u32::MAX,
            right: u32::MAX,
            start,
            count,
        }
    }

    const fn inner(bbox: BBox, left: u32, right: u32) -> Self {
        Self {
            bbox,
            left,
            right,
            start: 0,
            count: 0,
        }
    }

    const fn is_leaf(self) -> bool {
        self.count != 0
    }
}

/// Median-split hierarchy over primitive boxes. Primitive `i` is `bboxes[i]` at build.
#[derive(Debug, Clone)]
pub(crate) struct Bvh {
    nodes: Vec<BvhNode>,
    prim_indices: Vec<u32>,
}

impl Bvh {
    const LEAF_SIZE: usize = 8;

    #[must_use]
    pub(crate) fn build(bboxes: &[BBox]) -> Option<Self> {
        if bboxes.is_empty() {
            return None;
        }
        let prim_indices: Vec<u32> = (0..(bboxes.len() as u32)).collect();
        let nodes = Vec::with_capacity(bboxes.len().saturating_mul(2));

        let mut bvh = Self { nodes, prim_indices };
        bvh.build_node(bboxes, 0, bboxes.len());
        Some(bvh)
    }

    /// Hierarchy over the triangles of a mesh, each box grown by `margin`.
    #[must_use]
    pub(crate) fn over_triangles(
        positions: &[Point3],
        triangles: &[[u32; 3]],
        margin: f64,
    ) -> Option<Self> {
        let boxes: Vec<BBox> = triangles
            .iter()
            .map(|tri| triangle_bbox(tri.map(|i| positions[i as usize])).expanded(margin))
            .collect();
        Self::build(&boxes)
    }

    fn build_node(&mut self, bboxes: &[BBox], start: usize, end: usize) -> u32 {
        let node_index = self.nodes.len() as u32;
        let seed_bbox = bboxes[self.prim_indices[start] as usize];
        self.nodes.push(BvhNode::leaf(seed_bbox, 0, 0));

        let bbox = self.range_bbox(bboxes, start, end);
        let count = end - start;

        if count <= Self::LEAF_SIZE {
            self.nodes[node_index as usize] = BvhNode::leaf(bbox, start as u32, count as u32);
            return node_index;
        }

        let axis = self.choose_split_axis(bboxes, start, end);
        let mid = start + count / 2;
        self.prim_indices[start..end].select_nth_unstable_by(mid - start, |a, b| {
            let ca = centroid_component(bboxes[*a as usize], axis);
            let cb = centroid_component(bboxes[*b as usize], axis);
            ca.total_cmp(&cb)
        });

        let left = self.build_node(bboxes, start, mid);
        let right = self.build_node(bboxes, mid, end);
        self.nodes[node_index as usize] = BvhNode::inner(bbox, left, right);
        node_index
    }

    fn range_bbox(&self, bboxes: &[BBox], start: usize, end: usize) -> BBox {
        self.prim_indices[start + 1..end]
            .iter()
            .fold(bboxes[self.prim_indices[start] as usize], |acc, &idx| {
                acc.union(bboxes[idx as usize])
            })
    }

    fn choose_split_axis(&self, bboxes: &[BBox], start: usize, end: usize) -> u8 {
        let centres: Vec<Point3> = self.prim_indices[start..end]
            .iter()
            .map(|&idx| bboxes[idx as usize].center())
            .collect();
        let Some(spread) = BBox::from_points(&centres) else {
            return 0;
        };
        let extent = spread.max.sub_point(spread.min);
        if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        }
    }

    /// Visits the primitives of every leaf whose box overlaps `query` until `visit`
    /// returns false. Candidates still need an exact test.
    pub(crate) fn query_bbox<F>(&self, query: BBox, mut visit: F)
    where
        F: FnMut(usize) -> bool,
    {
        self.walk(|bbox| bbox.intersects(query), &mut visit);
    }

    /// Visits the primitives of every leaf the ray `origin + t·dir`, `t ∈ [t_min, t_max]`
    /// passes through.
    pub(crate) fn query_ray<F>(
        &self,
        origin: Point3,
        dir: Vec3,
        t_min: f64,
        t_max: f64,
        mut visit: F,
    ) where
        F: FnMut(usize) -> bool,
    {
        self.walk(
            |bbox| ray_intersects_bbox(origin, dir, bbox, t_min, t_max),
            &mut visit,
        );
    }

    fn walk<F>(&self, enter: impl Fn(BBox) -> bool, visit: &mut F)
    where
        F: FnMut(usize) -> bool,
    {
        let mut stack = vec![0u32];
        while let Some(node_idx) = stack.pop() {
            let node = self.nodes[node_idx as usize];
            if !enter(node.bbox) {
                continue;
            }
            if node.is_leaf() {
                let start = node.start as usize;
                let end = start + node.count as usize;
                for &prim in &self.prim_indices[start..end] {
                    if !visit(prim as usize) {
                        return;
                    }
                }
                continue;
            }
            stack.push(node.left);
            stack.push(node.right);
        }
    }
}

pub(crate) fn triangle_bbox(tri: [Point3; 3]) -> BBox {
    let [a, b, c] = tri;
    BBox::new(
        Point3::new(a.x.min(b.x).min(c.x), a.y.min(b.y).min(c.y), a.z.min(b.z).min(c.z)),
        Point3::new(a.x.max(b.x).max(c.x), a.y.max(b.y).max(c.y), a.z.max(b.z).max(c.z)),
    )
}

fn centroid_component(bbox: BBox, axis: u8) -> f64 {
    let c = bbox.center();
    match axis {
        0 => c.x,
        1 => c.y,
        _ => c.z,
    }
}

fn ray_intersects_bbox(origin: Point3, dir: Vec3, bbox: BBox, t_min: f64, t_max: f64) -> bool {
    let mut tmin = t_min;
    let mut tmax = t_max;
    let eps = 1e-15;

    for (o, d, min, max) in [
        (origin.x, dir.x, bbox.min.x, bbox.max.x),
        (origin.y, dir.y, bbox.min.y, bbox.max.y),
        (origin.z, dir.z, bbox.min.z, bbox.max.z),
    ] {
        if !o.is_finite() || !d.is_finite() {
            return false;
        }
        if d.abs() <= eps {
            if o < min || o > max {
                return false;
            }
            continue;
        }

        let inv_d = 1.0 / d;
        let mut t0 = (min - o) * inv_d;
        let mut t1 = (max - o) * inv_d;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        tmin = tmin.max(t0);
        tmax = tmax.min(t1);
        if tmax < tmin {
            return false;
        }
    }
    true
}

// ============================================================================
// Triangle tests
// ============================================================================

/// Möller–Trumbore hit of the ray `origin + t·dir` on `tri`, edges included; returns
/// `t ≥ 0`.
pub(crate) fn ray_triangle_hit(
    origin: Point3,
    dir: Vec3,
    tri: [Point3; 3],
    tol: Tolerance,
) -> Option<f64> {
    let t = moller_trumbore(origin, dir, tri, tol, tol.eps)?;
    (t >= -tol.eps).then_some(t)
}

/// Whether the segment `a → b` passes through the interior of `tri`. Grazing contact at
/// the triangle's edges or the segment's endpoints does not count.
pub(crate) fn segment_pierces_triangle(
    a: Point3,
    b: Point3,
    tri: [Point3; 3],
    tol: Tolerance,
) -> bool {
    moller_trumbore(a, b.sub_point(a), tri, tol, -tol.eps)
        .is_some_and(|t| t > tol.eps && t < 1.0 - tol.eps)
}

/// Whether two triangles pass through each other, tested edge against face both ways.
pub(crate) fn triangles_cross(a: [Point3; 3], b: [Point3; 3], tol: Tolerance) -> bool {
    let edges = |t: [Point3; 3]| [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])];
    edges(a)
        .into_iter()
        .any(|(p, q)| segment_pierces_triangle(p, q, b, tol))
        || edges(b)
            .into_iter()
            .any(|(p, q)| segment_pierces_triangle(p, q, a, tol))
}

/// Ray parameter of the hit, with barycentric bounds widened by `slack` (narrowed when
/// negative).
fn moller_trumbore(
    origin: Point3,
    dir: Vec3,
    tri: [Point3; 3],
    tol: Tolerance,
    slack: f64,
) -> Option<f64> {
    let edge1 = tri[1].sub_point(tri[0]);
    let edge2 = tri[2].sub_point(tri[0]);
    let h = dir.cross(edge2);
    let det = edge1.dot(h);
    let det_eps = tol.eps * edge1.length() * h.length();
    if !det.is_finite() || det.abs() <= det_eps {
        return None;
    }

    let inv_det = 1.0 / det;
    let s = origin.sub_point(tri[0]);
    let u = inv_det * s.dot(h);
    if u < -slack || u > 1.0 + slack {
        return None;
    }

    let q = s.cross(edge1);
    let v = inv_det * dir.dot(q);
    if v < -slack || u + v > 1.0 + slack {
        return None;
    }

    let t = inv_det * edge2.dot(q);
    t.is_finite().then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle(z: f64) -> [Point3; 3] {
        [
            Point3::new(0.0, 0.0, z),
            Point3::new(1.0, 0.0, z),
            Point3::new(0.0, 1.0, z),
        ]
    }

    #[test]
    fn test_query_bbox_finds_overlapping_boxes() {
        let boxes: Vec<BBox> = (0..40)
            .map(|i| {
                let x = f64::from(i);
                BBox::new(Point3::new(x, 0.0, 0.0), Point3::new(x + 0.5, 1.0, 1.0))
            })
            .collect();
        let bvh = Bvh::build(&boxes).expect("non-empty");

        let query = BBox::new(Point3::new(9.8, 0.2, 0.2), Point3::new(12.2, 0.4, 0.4));
        let mut hits = Vec::new();
        bvh.query_bbox(query, |i| {
            hits.push(i);
            true
        });
        for i in [10, 11, 12] {
            assert!(hits.contains(&i), "box {i} overlaps the query");
        }
        assert!(!hits.contains(&0) && !hits.contains(&39), "far leaves are pruned");
        assert!(Bvh::build(&[]).is_none());
    }

    #[test]
    fn test_query_ray_prunes_missed_boxes() {
        let mut positions = Vec::new();
        let mut triangles = Vec::new();
        for i in 0..32u32 {
            let x = 2.0 * f64::from(i);
            positions.extend(unit_triangle(1.0).map(|p| Point3::new(p.x + x, p.y, p.z)));
            triangles.push([3 * i, 3 * i + 1, 3 * i + 2]);
        }
        let bvh = Bvh::over_triangles(&positions, &triangles, 0.0).expect("mesh");
        let mut hits = Vec::new();
        bvh.query_ray(Point3::new(0.2, 0.2, 0.0), Vec3::Z, 0.0, f64::INFINITY, |i| {
            hits.push(i);
            true
        });
        assert!(hits.contains(&0));
        assert!(hits.len() <= Bvh::LEAF_SIZE, "only the first leaf is entered: {hits:?}");
    }

    #[test]
    fn test_ray_triangle_hit_distance() {
        let tol = Tolerance::DEFAULT;
        let t = ray_triangle_hit(Point3::new(0.25, 0.25, -2.0), Vec3::Z, unit_triangle(0.0), tol);
        assert!((t.expect("hit") - 2.0).abs() < 1e-12);
        let behind = ray_triangle_hit(Point3::new(0.25, 0.25, 1.0), Vec3::Z, unit_triangle(0.0), tol);
        assert!(behind.is_none());
        let outside = ray_triangle_hit(Point3::new(0.9, 0.9, -1.0), Vec3::Z, unit_triangle(0.0), tol);
        assert!(outside.is_none());
    }

    #[test]
    fn test_triangles_cross() {
        let tol = Tolerance::DEFAULT;
        let vertical = [
            Point3::new(0.2, 0.2, -1.0),
            Point3::new(0.3, 0.2, 1.0),
            Point3::new(0.2, 0.3, 1.0),
        ];
        assert!(triangles_cross(unit_triangle(0.0), vertical, tol));
        assert!(!triangles_cross(unit_triangle(0.0), unit_triangle(0.5), tol));

        // Hinged along a shared edge: touching, not crossing.
        let hinged = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, -0.5, 0.8),
        ];
        assert!(!triangles_cross(unit_triangle(0.0), hinged, tol));
    }
}
