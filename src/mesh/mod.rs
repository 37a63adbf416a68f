//! Reference surface and variable-vector layout.
//!
//! This module provides [`TriMesh`], the immutable triangle surface that
//! energy terms are constructed against. The mesh is supplied once (vertex
//! positions plus triangular connectivity), validated eagerly, and never
//! mutated afterwards: the optimization unknowns live in a flat variable
//! vector, not in the mesh.
//!
//! # Variable layout
//!
//! For a mesh with `n` vertices the planar embedding is packed as
//!
//! ```text
//! X = [u_0, u_1, ..., u_{n-1}, v_0, v_1, ..., v_{n-1}, (auxiliary...)]
//! ```
//!
//! i.e. all u-coordinates first, then all v-coordinates, with an optional
//! trailing block of auxiliary unknowns owned by whoever configured the
//! objective. [`TriMesh::u_index`] and [`TriMesh::v_index`] map a vertex to
//! its slots.

use std::collections::HashSet;

use nalgebra::{DVector, Matrix2, Point2, Point3, Vector2};

use crate::error::{EnergyError, Result};
use crate::solver::linear::SparseSolver;

/// An immutable, validated triangle surface.
///
/// Besides connectivity and 3D positions, the mesh precomputes the per-face
/// data every distortion energy needs: an isometric 2D copy of each face
/// (the *reference frame*), its inverse edge matrix, and the reference area.
///
/// # Example
///
/// ```
/// use flatiron::mesh::TriMesh;
/// use nalgebra::Point3;
///
/// let vertices = vec![
///     Point3::new(0.0, 0.0, 0.0),
///     Point3::new(1.0, 0.0, 0.0),
///     Point3::new(0.5, 1.0, 0.0),
/// ];
/// let mesh = TriMesh::from_triangles(&vertices, &[[0, 1, 2]]).unwrap();
/// assert_eq!(mesh.num_vertices(), 3);
/// assert_eq!(mesh.num_variables(), 6);
/// ```
#[derive(Debug, Clone)]
pub struct TriMesh {
    positions: Vec<Point3<f64>>,
    faces: Vec<[usize; 3]>,
    /// Inverse of the flattened reference edge matrix, one per face.
    rest_inverses: Vec<Matrix2<f64>>,
    /// Reference (3D) area, one per face.
    rest_areas: Vec<f64>,
    /// Boundary vertices in loop order, empty for a closed surface.
    boundary_loop: Vec<usize>,
}

impl TriMesh {
    /// Build a mesh from vertex positions and triangle connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the face list is empty, a face references an
    /// out-of-range vertex, or a face is degenerate (repeated vertices or
    /// zero area).
    pub fn from_triangles(vertices: &[Point3<f64>], faces: &[[usize; 3]]) -> Result<Self> {
        if faces.is_empty() {
            return Err(EnergyError::EmptyMesh);
        }

        for (fi, face) in faces.iter().enumerate() {
            for &v in face {
                if v >= vertices.len() {
                    return Err(EnergyError::InvalidVertexIndex { face: fi, vertex: v });
                }
            }
            if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                return Err(EnergyError::DegenerateFace {
                    face: fi,
                    reason: "repeated vertices",
                });
            }
        }

        let mut rest_inverses = Vec::with_capacity(faces.len());
        let mut rest_areas = Vec::with_capacity(faces.len());
        for (fi, face) in faces.iter().enumerate() {
            let (frame, area) = flatten_face(
                &vertices[face[0]],
                &vertices[face[1]],
                &vertices[face[2]],
            )
            .ok_or(EnergyError::DegenerateFace {
                face: fi,
                reason: "zero area",
            })?;
            let inverse = frame.try_inverse().ok_or(EnergyError::DegenerateFace {
                face: fi,
                reason: "singular reference frame",
            })?;
            rest_inverses.push(inverse);
            rest_areas.push(area);
        }

        let boundary_loop = walk_boundary_loop(faces, vertices.len());

        Ok(Self {
            positions: vertices.to_vec(),
            faces: faces.to_vec(),
            rest_inverses,
            rest_areas,
            boundary_loop,
        })
    }

    /// Number of vertices.
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    /// Number of faces.
    #[inline]
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Number of embedding variables (u-block plus v-block).
    #[inline]
    pub fn num_variables(&self) -> usize {
        2 * self.positions.len()
    }

    /// The 3D position of a vertex.
    #[inline]
    pub fn position(&self, vertex: usize) -> Point3<f64> {
        self.positions[vertex]
    }

    /// The vertex triple of a face.
    #[inline]
    pub fn face(&self, face: usize) -> [usize; 3] {
        self.faces[face]
    }

    /// All faces.
    #[inline]
    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }

    /// Variable index of a vertex's u-coordinate.
    #[inline]
    pub fn u_index(&self, vertex: usize) -> usize {
        vertex
    }

    /// Variable index of a vertex's v-coordinate.
    #[inline]
    pub fn v_index(&self, vertex: usize) -> usize {
        self.positions.len() + vertex
    }

    /// The six variable indices a face touches, u-block then v-block.
    #[inline]
    pub fn face_variables(&self, face: usize) -> [usize; 6] {
        let [i, j, k] = self.faces[face];
        let n = self.positions.len();
        [i, j, k, n + i, n + j, n + k]
    }

    /// The embedded 2D position of a vertex under the variable vector `x`.
    #[inline]
    pub fn embedded(&self, x: &DVector<f64>, vertex: usize) -> Point2<f64> {
        Point2::new(x[self.u_index(vertex)], x[self.v_index(vertex)])
    }

    /// Inverse reference edge matrix of a face.
    ///
    /// Multiplying the current edge matrix by this constant yields the 2x2
    /// Jacobian of the embedding restricted to the face.
    #[inline]
    pub fn rest_inverse(&self, face: usize) -> &Matrix2<f64> {
        &self.rest_inverses[face]
    }

    /// Reference area of a face.
    #[inline]
    pub fn rest_area(&self, face: usize) -> f64 {
        self.rest_areas[face]
    }

    /// Total reference area.
    pub fn total_rest_area(&self) -> f64 {
        self.rest_areas.iter().sum()
    }

    /// Boundary vertices in loop order, empty for a closed surface.
    #[inline]
    pub fn boundary_loop(&self) -> &[usize] {
        &self.boundary_loop
    }

    /// Whether a vertex lies on the boundary.
    pub fn is_boundary_vertex(&self, vertex: usize) -> bool {
        self.boundary_loop.contains(&vertex)
    }

    /// Signed area of a face under the variable vector `x`.
    pub fn signed_area(&self, x: &DVector<f64>, face: usize) -> f64 {
        let [i, j, k] = self.faces[face];
        let p0 = self.embedded(x, i);
        let p1 = self.embedded(x, j);
        let p2 = self.embedded(x, k);
        0.5 * ((p1.x - p0.x) * (p2.y - p0.y) - (p2.x - p0.x) * (p1.y - p0.y))
    }

    /// Seed the variable vector with a Tutte embedding.
    ///
    /// Boundary vertices are spread over the unit circle in loop order and
    /// interior vertices are placed at the uniform-weight harmonic solution,
    /// which keeps every face positively oriented when the boundary is
    /// convex. The interior Laplacian system is solved with the same direct
    /// sparse solver the Newton iteration uses.
    ///
    /// # Errors
    ///
    /// Returns [`EnergyError::NoBoundary`] for a closed surface and a
    /// factorization error if the interior system cannot be solved.
    pub fn initial_embedding(&self) -> Result<DVector<f64>> {
        if self.boundary_loop.is_empty() {
            return Err(EnergyError::NoBoundary);
        }

        let n = self.positions.len();
        let mut uv = vec![Point2::origin(); n];
        let mut on_boundary = vec![false; n];
        for (i, &v) in self.boundary_loop.iter().enumerate() {
            let angle = 2.0 * std::f64::consts::PI * (i as f64) / (self.boundary_loop.len() as f64);
            uv[v] = Point2::new(angle.cos(), angle.sin());
            on_boundary[v] = true;
        }

        let interior: Vec<usize> = (0..n).filter(|&v| !on_boundary[v]).collect();
        if !interior.is_empty() {
            let mut interior_slot = vec![usize::MAX; n];
            for (slot, &v) in interior.iter().enumerate() {
                interior_slot[v] = slot;
            }

            // Uniform-weight Laplacian over interior vertices. Only the upper
            // triangle is recorded; the solver mirrors it.
            let mut neighbors: Vec<Vec<usize>> = vec![Vec::new(); n];
            for face in &self.faces {
                for e in 0..3 {
                    let a = face[e];
                    let b = face[(e + 1) % 3];
                    if !neighbors[a].contains(&b) {
                        neighbors[a].push(b);
                        neighbors[b].push(a);
                    }
                }
            }

            let m = interior.len();
            let mut rows = Vec::new();
            let mut cols = Vec::new();
            let mut vals = Vec::new();
            let mut rhs_u = DVector::zeros(m);
            let mut rhs_v = DVector::zeros(m);

            for (slot, &v) in interior.iter().enumerate() {
                rows.push(slot);
                cols.push(slot);
                vals.push(neighbors[v].len() as f64);
                for &w in &neighbors[v] {
                    if on_boundary[w] {
                        rhs_u[slot] += uv[w].x;
                        rhs_v[slot] += uv[w].y;
                    } else {
                        let ws = interior_slot[w];
                        if slot < ws {
                            rows.push(slot);
                            cols.push(ws);
                            vals.push(-1.0);
                        }
                    }
                }
            }

            let mut solver = SparseSolver::new();
            solver.set_pattern(&rows, &cols, m)?;
            solver.analyze_pattern()?;
            solver.factorize(&vals)?;
            let sol_u = solver.solve(rhs_u.as_slice())?;
            let sol_v = solver.solve(rhs_v.as_slice())?;

            for (slot, &v) in interior.iter().enumerate() {
                uv[v] = Point2::new(sol_u[slot], sol_v[slot]);
            }
        }

        let mut x = DVector::zeros(self.num_variables());
        for (v, p) in uv.iter().enumerate() {
            x[self.u_index(v)] = p.x;
            x[self.v_index(v)] = p.y;
        }
        Ok(x)
    }
}

/// Flatten one 3D triangle to the plane.
///
/// Returns the 2x2 matrix whose columns are the flattened edges
/// `(p1 - p0, p2 - p0)` plus the triangle area, or `None` for a degenerate
/// triangle.
fn flatten_face(
    p0: &Point3<f64>,
    p1: &Point3<f64>,
    p2: &Point3<f64>,
) -> Option<(Matrix2<f64>, f64)> {
    let e1 = p1 - p0;
    let e2 = p2 - p0;

    let e1_len = e1.norm();
    if e1_len < 1e-12 {
        return None;
    }
    let normal = e1.cross(&e2);
    let normal_len = normal.norm();
    if normal_len < 1e-12 {
        return None;
    }

    let x_axis = e1 / e1_len;
    let y_axis = normal.cross(&e1).normalize();

    let q1 = Vector2::new(e1_len, 0.0);
    let q2 = Vector2::new(e2.dot(&x_axis), e2.dot(&y_axis));

    let frame = Matrix2::from_columns(&[q1, q2]);
    Some((frame, 0.5 * normal_len))
}

/// Walk the boundary of a face-vertex mesh into a single vertex loop.
///
/// A directed edge with no opposite is a boundary edge; following
/// predecessors around the hole yields the loop. Returns an empty vector for
/// a closed surface. Meshes with several holes yield the loop through the
/// smallest boundary vertex; the remaining holes still pin their vertices as
/// boundary for constraint purposes.
fn walk_boundary_loop(faces: &[[usize; 3]], num_vertices: usize) -> Vec<usize> {
    let mut directed: HashSet<(usize, usize)> = HashSet::new();
    for face in faces {
        for e in 0..3 {
            directed.insert((face[e], face[(e + 1) % 3]));
        }
    }

    // A directed edge (a, b) missing its twin lies on the boundary; the
    // loop follows it in face orientation so the circle placement keeps the
    // interior on the correct side.
    let mut successor = vec![usize::MAX; num_vertices];
    let mut start = usize::MAX;
    for &(a, b) in directed.iter() {
        if !directed.contains(&(b, a)) {
            successor[a] = b;
            start = start.min(a);
        }
    }
    if start == usize::MAX {
        return Vec::new();
    }

    let mut boundary = vec![start];
    let mut current = successor[start];
    while current != start && current != usize::MAX && boundary.len() <= num_vertices {
        boundary.push(current);
        current = successor[current];
    }
    boundary
}
