//! Topology and quality diagnostics for triangle shells.
//!
//! Mold solids are only handed on when their shell is closed, manifold and consistently
//! wound; [`MeshDiagnostics::analyze`] counts the edges that break each of those.
//!
//! ```ignore
//! use mold_engine::geom::MeshDiagnostics;
//!
//! let diagnostics = MeshDiagnostics::analyze(&solid.positions, &solid.triangles);
//! if !diagnostics.is_valid_solid() {
//!     eprintln!("{}", diagnostics.summary());
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::{Point3, Tolerance};

/// Edge and triangle counts describing how far a triangle set is from a valid solid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshDiagnostics {
    pub vertex_count: usize,
    pub triangle_count: usize,

    /// Triangles whose doubled area is below [`Tolerance::DEGENERATE_TRIANGLE`].
    pub degenerate_triangle_count: usize,

    /// Edges with exactly one adjacent triangle.
    pub open_edge_count: usize,

    /// Edges with more than two adjacent triangles.
    pub non_manifold_edge_count: usize,

    /// Two-triangle edges traversed in the same direction by both triangles.
    pub inconsistent_edge_count: usize,

    pub warnings: Vec<String>,
}

impl MeshDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts open, non-manifold and inconsistently wound edges of `triangles`.
    #[must_use]
    pub fn analyze(positions: &[Point3], triangles: &[[u32; 3]]) -> Self {
        // (lo, hi) -> (uses as lo->hi, uses as hi->lo)
        let mut edges: HashMap<(u32, u32), (u32, u32)> = HashMap::new();
        let mut degenerate = 0;

        for tri in triangles {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                let entry = edges.entry((a.min(b), a.max(b))).or_insert((0, 0));
                if a <= b {
                    entry.0 += 1;
                } else {
                    entry.1 += 1;
                }
            }

            let [p0, p1, p2] = tri.map(|i| positions[i as usize]);
            let doubled_area = p1.sub_point(p0).cross(p2.sub_point(p0)).length();
            if doubled_area < Tolerance::DEGENERATE_TRIANGLE.eps {
                degenerate += 1;
            }
        }

        let mut diagnostics = Self {
            vertex_count: positions.len(),
            triangle_count: triangles.len(),
            degenerate_triangle_count: degenerate,
            ..Self::default()
        };
        for &(forward, backward) in edges.values() {
            match forward + backward {
                1 => diagnostics.open_edge_count += 1,
                2 if forward != 1 => diagnostics.inconsistent_edge_count += 1,
                2 => {}
                _ => diagnostics.non_manifold_edge_count += 1,
            }
        }
        diagnostics
    }

    #[must_use]
    pub fn is_watertight(&self) -> bool {
        self.open_edge_count == 0
    }

    #[must_use]
    pub fn is_manifold(&self) -> bool {
        self.non_manifold_edge_count == 0
    }

    #[must_use]
    pub fn is_consistently_oriented(&self) -> bool {
        self.inconsistent_edge_count == 0
    }

    /// Closed, manifold and consistently wound.
    #[must_use]
    pub fn is_valid_solid(&self) -> bool {
        self.is_watertight() && self.is_manifold() && self.is_consistently_oriented()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.is_valid_solid() && self.degenerate_triangle_count == 0 && self.warnings.is_empty()
    }

    #[must_use]
    pub fn topology_issue_count(&self) -> usize {
        self.open_edge_count + self.non_manifold_edge_count + self.inconsistent_edge_count
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Sums counts and appends warnings from `other`.
    pub fn merge(&mut self, other: &MeshDiagnostics) {
        self.vertex_count += other.vertex_count;
        self.triangle_count += other.triangle_count;
        self.degenerate_triangle_count += other.degenerate_triangle_count;
        self.open_edge_count += other.open_edge_count;
        self.non_manifold_edge_count += other.non_manifold_edge_count;
        self.inconsistent_edge_count += other.inconsistent_edge_count;
        self.warnings.extend(other.warnings.iter().cloned());
    }

    /// Short one-line form: `"V:{vertices} T:{triangles} [issues...]"`.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("V:{} T:{}", self.vertex_count, self.triangle_count)];
        if self.degenerate_triangle_count > 0 {
            parts.push(format!("degenerate:{}", self.degenerate_triangle_count));
        }
        if self.open_edge_count > 0 {
            parts.push(format!("open:{}", self.open_edge_count));
        }
        if self.non_manifold_edge_count > 0 {
            parts.push(format!("non-manifold:{}", self.non_manifold_edge_count));
        }
        if self.inconsistent_edge_count > 0 {
            parts.push(format!("inconsistent:{}", self.inconsistent_edge_count));
        }
        parts.join(" ")
    }
}

impl fmt::Display for MeshDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mesh Diagnostics:")?;
        writeln!(f, "  Vertices: {}", self.vertex_count)?;
        writeln!(f, "  Triangles: {}", self.triangle_count)?;
        if self.degenerate_triangle_count > 0 {
            writeln!(f, "  Degenerate triangles: {}", self.degenerate_triangle_count)?;
        }

        if self.topology_issue_count() > 0 {
            writeln!(f, "  Topology issues:")?;
            if self.open_edge_count > 0 {
                writeln!(f, "    - Open edges: {}", self.open_edge_count)?;
            }
            if self.non_manifold_edge_count > 0 {
                writeln!(f, "    - Non-manifold edges: {}", self.non_manifold_edge_count)?;
            }
            if self.inconsistent_edge_count > 0 {
                writeln!(f, "    - Inconsistent winding: {}", self.inconsistent_edge_count)?;
            }
        }

        if !self.warnings.is_empty() {
            writeln!(f, "  Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "    - {warning}")?;
            }
        }

        let status = if self.is_clean() {
            "CLEAN"
        } else if self.is_valid_solid() {
            "VALID"
        } else {
            "ISSUES DETECTED"
        };
        writeln!(f, "  Status: {status}")
    }
}
