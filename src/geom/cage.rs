//! Control cage input for the subdivision evaluator.
//!
//! A [`ControlCage`] is the coarse polygon mesh a limit surface is derived from. It is
//! validated once at construction and never mutated afterwards; the evaluator copies
//! what it needs.

use std::collections::BTreeMap;

use super::core::{BBox, Point3};

/// Errors raised while validating a control cage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CageError {
    #[error("control cage has no faces")]
    Empty,

    #[error("face {face} has {count} vertices; at least 3 are required")]
    DegenerateFace { face: usize, count: usize },

    #[error("face {face} references vertex {index}, but the cage has {vertex_count} vertices")]
    IndexOutOfRange {
        face: usize,
        index: usize,
        vertex_count: usize,
    },

    #[error("face {face} repeats vertex {index}")]
    RepeatedVertex { face: usize, index: usize },

    #[error("vertex {index} has a non-finite coordinate")]
    NonFinite { index: usize },

    #[error("malformed cage buffers: {0}")]
    MalformedBuffers(String),
}

/// Coarse polygon mesh (predominantly quads) defining a subdivision surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCage {
    vertices: Vec<Point3>,
    faces: Vec<Vec<usize>>,
}

impl ControlCage {
    /// Validates and wraps cage data.
    ///
    /// # Errors
    /// Returns a [`CageError`] for empty input, faces with fewer than three vertices,
    /// out-of-range or repeated indices, and non-finite coordinates.
    pub fn new(vertices: Vec<Point3>, faces: Vec<Vec<usize>>) -> Result<Self, CageError> {
        if faces.is_empty() {
            return Err(CageError::Empty);
        }
        if let Some(index) = vertices.iter().position(|p| !p.is_finite()) {
            return Err(CageError::NonFinite { index });
        }

        for (face_index, face) in faces.iter().enumerate() {
            if face.len() < 3 {
                return Err(CageError::DegenerateFace {
                    face: face_index,
                    count: face.len(),
                });
            }
            for (i, &index) in face.iter().enumerate() {
                if index >= vertices.len() {
                    return Err(CageError::IndexOutOfRange {
                        face: face_index,
                        index,
                        vertex_count: vertices.len(),
                    });
                }
                if face[..i].contains(&index) {
                    return Err(CageError::RepeatedVertex {
                        face: face_index,
                        index,
                    });
                }
            }
        }

        Ok(Self { vertices, faces })
    }

    /// Builds a cage from flat buffers: `xyz` triples, one size per face, and the
    /// concatenated face indices.
    ///
    /// # Errors
    /// `MalformedBuffers` when the buffer lengths disagree, then as [`ControlCage::new`].
    pub fn from_flat(
        coordinates: &[f64],
        face_sizes: &[u32],
        indices: &[u32],
    ) -> Result<Self, CageError> {
        if coordinates.len() % 3 != 0 {
            return Err(CageError::MalformedBuffers(format!(
                "{} coordinates is not a multiple of 3",
                coordinates.len()
            )));
        }
        let expected: usize = face_sizes.iter().map(|&n| n as usize).sum();
        if expected != indices.len() {
            return Err(CageError::MalformedBuffers(format!(
                "face sizes add up to {expected} but {} indices were given",
                indices.len()
            )));
        }

        let vertices = coordinates
            .chunks_exact(3)
            .map(|c| Point3::new(c[0], c[1], c[2]))
            .collect();
        let mut faces = Vec::with_capacity(face_sizes.len());
        let mut start = 0;
        for &size in face_sizes {
            let end = start + size as usize;
            faces.push(indices[start..end].iter().map(|&i| i as usize).collect());
            start = end;
        }
        Self::new(vertices, faces)
    }

    /// Axis-aligned box with the six quads wound for outward normals.
    ///
    /// # Errors
    /// Returns [`CageError::NonFinite`] if a bound is not finite.
    pub fn box_from_bounds(min: [f64; 3], max: [f64; 3]) -> Result<Self, CageError> {
        Self::new(box_corners(min, max).to_vec(), box_faces())
    }

    /// The unit cube `[0, 1]³`: 8 vertices, 6 quads.
    #[must_use]
    pub fn unit_cube() -> Self {
        Self {
            vertices: box_corners([0.0; 3], [1.0; 3]).to_vec(),
            faces: box_faces(),
        }
    }

    /// Flat `nu × nv` quad grid in the XY plane spanning `[0, size_x] × [0, size_y]`.
    ///
    /// Counts are raised to at least one quad per direction.
    #[must_use]
    pub fn planar_grid(nu: usize, nv: usize, size_x: f64, size_y: f64) -> Self {
        Self::grid(nu, nv, |i, j, nu, nv| {
            Point3::new(
                size_x * i as f64 / nu as f64,
                size_y * j as f64 / nv as f64,
                0.0,
            )
        })
    }

    /// `nu × nv` quad grid over `[-extent, extent]²` lifted by `height(x, y)`.
    #[must_use]
    pub fn height_field(
        nu: usize,
        nv: usize,
        extent: f64,
        height: impl Fn(f64, f64) -> f64,
    ) -> Self {
        Self::grid(nu, nv, |i, j, nu, nv| {
            let x = -extent + 2.0 * extent * i as f64 / nu as f64;
            let y = -extent + 2.0 * extent * j as f64 / nv as f64;
            Point3::new(x, y, height(x, y))
        })
    }

    fn grid(
        nu: usize,
        nv: usize,
        point: impl Fn(usize, usize, usize, usize) -> Point3,
    ) -> Self {
        let nu = nu.max(1);
        let nv = nv.max(1);
        let mut vertices = Vec::with_capacity((nu + 1) * (nv + 1));
        for j in 0..=nv {
            for i in 0..=nu {
                vertices.push(point(i, j, nu, nv));
            }
        }
        let row = nu + 1;
        let mut faces = Vec::with_capacity(nu * nv);
        for j in 0..nv {
            for i in 0..nu {
                let a = j * row + i;
                faces.push(vec![a, a + 1, a + 1 + row, a + row]);
            }
        }
        Self { vertices, faces }
    }

    #[must_use]
    pub fn vertices(&self) -> &[Point3] {
        &self.vertices
    }

    #[must_use]
    pub fn faces(&self) -> &[Vec<usize>] {
        &self.faces
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[must_use]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// True when every edge is shared by exactly two faces.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let mut counts: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for face in &self.faces {
            for (i, &a) in face.iter().enumerate() {
                let b = face[(i + 1) % face.len()];
                *counts.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        counts.values().all(|&count| count == 2)
    }

    #[must_use]
    pub fn bounding_box(&self) -> Option<BBox> {
        BBox::from_points(&self.vertices)
    }
}

fn box_corners(lo: [f64; 3], hi: [f64; 3]) -> [Point3; 8] {
    [
        Point3::new(lo[0], lo[1], lo[2]),
        Point3::new(hi[0], lo[1], lo[2]),
        Point3::new(hi[0], hi[1], lo[2]),
        Point3::new(lo[0], hi[1], lo[2]),
        Point3::new(lo[0], lo[1], hi[2]),
        Point3::new(hi[0], lo[1], hi[2]),
        Point3::new(hi[0], hi[1], hi[2]),
        Point3::new(lo[0], hi[1], hi[2]),
    ]
}

fn box_faces() -> Vec<Vec<usize>> {
    vec![
        vec![0, 3, 2, 1],
        vec![4, 5, 6, 7],
        vec![0, 1, 5, 4],
        vec![1, 2, 6, 5],
        vec![2, 3, 7, 6],
        vec![3, 0, 4, 7],
    ]
}
