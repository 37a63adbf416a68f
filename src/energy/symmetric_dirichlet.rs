//! Symmetric Dirichlet distortion energy.
//!
//! For each face with embedding Jacobian `J` (2x2, linear in the variable
//! vector through the face's constant reference frame) the energy is
//!
//! ```text
//! E_f = A_f * (||J||_F^2 + ||J^{-1}||_F^2)
//! ```
//!
//! which penalizes stretch and shrink symmetrically and blows up as a face
//! degenerates, so minimizers stay inversion-free when paired with the
//! flip-avoiding line search. The total is the sum over faces.
//!
//! Writing `J = [[a, b], [c, d]]`, `s = a^2+b^2+c^2+d^2`, `t = det J`, the
//! energy per face is `A_f * s * (1 + 1/t^2)`. Derivatives are taken
//! exactly in `(a, b, c, d)` and chained through the constant linear map
//! from the six incident coordinates, so gradient and Hessian are analytic.

use std::sync::Arc;

use nalgebra::{DVector, Matrix4, Matrix4x6, Matrix6, Vector4};
use tracing::warn;

use crate::error::{EnergyError, Result};
use crate::graph::providers::FaceJacobians;
use crate::mesh::TriMesh;

use super::{EnergyTerm, SparsityPattern};

/// Per-face Jacobian entries and determinant.
#[derive(Debug, Clone, Copy, Default)]
struct FaceState {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    det: f64,
}

/// Symmetric Dirichlet distortion term.
///
/// # Example
///
/// ```no_run
/// use flatiron::energy::{EnergyTerm, SymmetricDirichlet};
/// # let mesh: std::sync::Arc<flatiron::mesh::TriMesh> = unimplemented!();
///
/// let mut distortion = SymmetricDirichlet::new("distortion");
/// distortion.set_mesh(mesh);
/// distortion.init().unwrap();
/// ```
pub struct SymmetricDirichlet {
    name: String,
    weight: f64,
    mesh: Option<Arc<TriMesh>>,
    /// Optional shared producer; when present, `update_x` reads its cache
    /// instead of recomputing the Jacobians.
    jacobians: Option<Arc<FaceJacobians>>,
    num_variables: usize,
    initialized: bool,

    /// Constant chain-rule maps from face coordinates to (a, b, c, d).
    face_maps: Vec<Matrix4x6<f64>>,
    /// Global variable indices per face, u-block then v-block.
    face_scatter: Vec<[usize; 6]>,

    states: Vec<FaceState>,
    pattern: SparsityPattern,
    coefficients: Vec<f64>,
    element_energies: Vec<f64>,
    cached_value: f64,
}

impl SymmetricDirichlet {
    /// Create an uninitialized term; the mesh must be set before `init()`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            mesh: None,
            jacobians: None,
            num_variables: 0,
            initialized: false,
            face_maps: Vec::new(),
            face_scatter: Vec::new(),
            states: Vec::new(),
            pattern: SparsityPattern::new(),
            coefficients: Vec::new(),
            element_energies: Vec::new(),
            cached_value: 0.0,
        }
    }

    /// Set the reference surface (required shape member).
    pub fn set_mesh(&mut self, mesh: Arc<TriMesh>) {
        self.mesh = Some(mesh);
    }

    /// Attach a shared Jacobian producer.
    ///
    /// The producer must be updated before this term; registering both in
    /// the same dependency graph guarantees that.
    pub fn set_jacobians(&mut self, jacobians: Arc<FaceJacobians>) {
        self.jacobians = Some(jacobians);
    }

    /// The scalar energy and per-face contributions at the current state.
    fn accumulate(&self, per_face: Option<&mut [f64]>) -> f64 {
        let mesh = self.mesh.as_ref().expect("initialized term has a mesh");
        let mut total = 0.0;
        let mut sink = per_face;
        for (f, st) in self.states.iter().enumerate() {
            let s = st.a * st.a + st.b * st.b + st.c * st.c + st.d * st.d;
            let energy = mesh.rest_area(f) * s * (1.0 + 1.0 / (st.det * st.det));
            if let Some(sink) = sink.as_deref_mut() {
                sink[f] = energy;
            }
            total += energy;
        }
        total
    }

    /// Exact gradient of `s * (1 + 1/t^2)` in (a, b, c, d).
    fn local_gradient(st: &FaceState) -> Vector4<f64> {
        let s = st.a * st.a + st.b * st.b + st.c * st.c + st.d * st.d;
        let t = st.det;
        let t2 = t * t;
        let t3 = t2 * t;
        let scale = 1.0 + 1.0 / t2;
        let pull = 2.0 * s / t3;
        // dt/d(a,b,c,d) = (d, -c, -b, a)
        Vector4::new(
            2.0 * st.a * scale - pull * st.d,
            2.0 * st.b * scale + pull * st.c,
            2.0 * st.c * scale + pull * st.b,
            2.0 * st.d * scale - pull * st.a,
        )
    }

    /// Exact Hessian of `s * (1 + 1/t^2)` in (a, b, c, d).
    fn local_hessian(st: &FaceState) -> Matrix4<f64> {
        let p = Vector4::new(st.a, st.b, st.c, st.d);
        let tp = Vector4::new(st.d, -st.c, -st.b, st.a);
        let s = p.dot(&p);
        let t = st.det;
        let t2 = t * t;
        let t3 = t2 * t;
        let t4 = t2 * t2;

        let mut h = Matrix4::identity() * (2.0 * (1.0 + 1.0 / t2));
        h += (p * tp.transpose() + tp * p.transpose()) * (-4.0 / t3);
        h += tp * tp.transpose() * (6.0 * s / t4);
        // d^2 t: the (a,d) and (b,c) cross entries.
        let shift = -2.0 * s / t3;
        h[(0, 3)] += shift;
        h[(3, 0)] += shift;
        h[(1, 2)] -= shift;
        h[(2, 1)] -= shift;
        h
    }
}

impl EnergyTerm for SymmetricDirichlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn num_variables(&self) -> usize {
        self.num_variables
    }

    fn set_num_variables(&mut self, count: usize) {
        self.num_variables = count;
    }

    fn init(&mut self) -> Result<()> {
        let mesh = self
            .mesh
            .as_ref()
            .ok_or_else(|| EnergyError::config("symmetric Dirichlet term has no mesh"))?
            .clone();

        if self.num_variables == 0 {
            self.num_variables = mesh.num_variables();
        } else if self.num_variables < mesh.num_variables() {
            return Err(EnergyError::config(format!(
                "variable count {} is smaller than the embedding size {}",
                self.num_variables,
                mesh.num_variables()
            )));
        }

        let m = mesh.num_faces();
        self.face_maps.clear();
        self.face_scatter.clear();
        self.pattern = SparsityPattern::new();

        for f in 0..m {
            let dinv = mesh.rest_inverse(f);
            // (a, b, c, d) are linear in [u0, u1, u2, v0, v1, v2]; the
            // coefficients come straight from the inverse reference frame.
            let d00 = dinv[(0, 0)];
            let d01 = dinv[(0, 1)];
            let d10 = dinv[(1, 0)];
            let d11 = dinv[(1, 1)];
            #[rustfmt::skip]
            let map = Matrix4x6::new(
                -(d00 + d10), d00, d10, 0.0, 0.0, 0.0,
                -(d01 + d11), d01, d11, 0.0, 0.0, 0.0,
                0.0, 0.0, 0.0, -(d00 + d10), d00, d10,
                0.0, 0.0, 0.0, -(d01 + d11), d01, d11,
            );
            self.face_maps.push(map);

            let scatter = mesh.face_variables(f);
            for li in 0..6 {
                for lj in li..6 {
                    self.pattern.push(scatter[li], scatter[lj]);
                }
            }
            self.face_scatter.push(scatter);
        }

        self.states = vec![FaceState::default(); m];
        self.coefficients = vec![0.0; self.pattern.len()];
        self.element_energies = vec![0.0; m];
        self.cached_value = 0.0;
        self.initialized = true;
        Ok(())
    }

    fn update_x(&mut self, x: &DVector<f64>) {
        debug_assert!(self.initialized, "update_x before init");
        let mut inverted = 0usize;

        if let Some(provider) = &self.jacobians {
            let jacobians = provider.jacobians();
            for (st, j) in self.states.iter_mut().zip(jacobians.iter()) {
                *st = FaceState {
                    a: j[(0, 0)],
                    b: j[(0, 1)],
                    c: j[(1, 0)],
                    d: j[(1, 1)],
                    det: j.determinant(),
                };
                if st.det <= 0.0 {
                    inverted += 1;
                }
            }
        } else {
            let mesh = self.mesh.as_ref().expect("initialized term has a mesh");
            for (f, st) in self.states.iter_mut().enumerate() {
                let vars = &self.face_scatter[f];
                let du1 = x[vars[1]] - x[vars[0]];
                let du2 = x[vars[2]] - x[vars[0]];
                let dv1 = x[vars[4]] - x[vars[3]];
                let dv2 = x[vars[5]] - x[vars[3]];
                let dinv = mesh.rest_inverse(f);
                let a = du1 * dinv[(0, 0)] + du2 * dinv[(1, 0)];
                let b = du1 * dinv[(0, 1)] + du2 * dinv[(1, 1)];
                let c = dv1 * dinv[(0, 0)] + dv2 * dinv[(1, 0)];
                let d = dv1 * dinv[(0, 1)] + dv2 * dinv[(1, 1)];
                *st = FaceState {
                    a,
                    b,
                    c,
                    d,
                    det: a * d - b * c,
                };
                if st.det <= 0.0 {
                    inverted += 1;
                }
            }
        }

        if inverted > 0 {
            warn!(
                term = %self.name,
                faces = inverted,
                "inverted or collapsed faces; derivatives may be non-physical"
            );
        }
    }

    fn value(&mut self, update: bool) -> f64 {
        if update {
            // Split borrows: accumulate writes per-face energies in place.
            let mut energies = std::mem::take(&mut self.element_energies);
            let total = self.accumulate(Some(&mut energies));
            self.element_energies = energies;
            self.cached_value = total;
            total
        } else {
            self.accumulate(None)
        }
    }

    fn gradient(&self, grad: &mut DVector<f64>) {
        let mesh = self.mesh.as_ref().expect("initialized term has a mesh");
        for (f, st) in self.states.iter().enumerate() {
            let local = Self::local_gradient(st) * mesh.rest_area(f);
            let scattered = self.face_maps[f].transpose() * local;
            for (li, &var) in self.face_scatter[f].iter().enumerate() {
                grad[var] += scattered[li];
            }
        }
    }

    fn hessian(&mut self) {
        let mesh = self.mesh.as_ref().expect("initialized term has a mesh");
        let mut slot = 0;
        for (f, st) in self.states.iter().enumerate() {
            let map = &self.face_maps[f];
            let local: Matrix6<f64> =
                map.transpose() * (Self::local_hessian(st) * mesh.rest_area(f)) * map;
            for li in 0..6 {
                for lj in li..6 {
                    self.coefficients[slot] = local[(li, lj)];
                    slot += 1;
                }
            }
        }
        debug_assert_eq!(slot, self.coefficients.len());
    }

    fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    fn cached_value(&self) -> f64 {
        self.cached_value
    }

    fn element_energies(&self) -> &[f64] {
        &self.element_energies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn disk_mesh() -> Arc<TriMesh> {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 0.866, 0.0),
            Point3::new(-0.5, 0.866, 0.0),
            Point3::new(-1.0, 0.0, 0.0),
            Point3::new(-0.5, -0.866, 0.0),
            Point3::new(0.5, -0.866, 0.0),
        ];
        let faces = vec![
            [0, 1, 2],
            [0, 2, 3],
            [0, 3, 4],
            [0, 4, 5],
            [0, 5, 6],
            [0, 6, 1],
        ];
        Arc::new(TriMesh::from_triangles(&vertices, &faces).unwrap())
    }

    fn identity_embedding(mesh: &TriMesh) -> DVector<f64> {
        let mut x = DVector::zeros(mesh.num_variables());
        for v in 0..mesh.num_vertices() {
            let p = mesh.position(v);
            x[mesh.u_index(v)] = p.x;
            x[mesh.v_index(v)] = p.y;
        }
        x
    }

    fn ready_term(mesh: &Arc<TriMesh>) -> SymmetricDirichlet {
        let mut term = SymmetricDirichlet::new("distortion");
        term.set_mesh(Arc::clone(mesh));
        term.init().unwrap();
        term
    }

    #[test]
    fn test_init_without_mesh_fails() {
        let mut term = SymmetricDirichlet::new("distortion");
        assert!(matches!(term.init(), Err(EnergyError::Configuration(_))));
    }

    #[test]
    fn test_identity_embedding_is_critical_point() {
        let mesh = disk_mesh();
        let mut term = ready_term(&mesh);
        let x = identity_embedding(&mesh);
        term.update_x(&x);

        // At an isometry E = 4 * total area and the gradient vanishes.
        let value = term.value(true);
        assert!((value - 4.0 * mesh.total_rest_area()).abs() < 1e-9);

        let mut grad = DVector::zeros(mesh.num_variables());
        term.gradient(&mut grad);
        assert!(grad.amax() < 1e-9);
    }

    #[test]
    fn test_value_is_deterministic() {
        let mesh = disk_mesh();
        let mut term = ready_term(&mesh);
        let mut x = identity_embedding(&mesh);
        x[2] += 0.1;
        x[9] -= 0.05;
        term.update_x(&x);

        let first = term.value(true);
        let second = term.value(false);
        let third = term.value(true);
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(first.to_bits(), third.to_bits());
    }

    #[test]
    fn test_pattern_is_invariant_under_updates() {
        let mesh = disk_mesh();
        let mut term = ready_term(&mesh);
        let before = term.pattern().clone();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let mut x = identity_embedding(&mesh);
            for xi in x.iter_mut() {
                *xi += rng.random_range(-0.05..0.05);
            }
            term.update_x(&x);
            term.value(true);
            term.hessian();
        }
        assert_eq!(&before, term.pattern());
    }

    #[test]
    fn test_finite_difference_gradient() {
        let mesh = disk_mesh();
        let mut term = ready_term(&mesh);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..4 {
            let mut x = identity_embedding(&mesh);
            for xi in x.iter_mut() {
                *xi += rng.random_range(-0.08..0.08);
            }

            term.update_x(&x);
            let mut analytic = DVector::zeros(mesh.num_variables());
            term.gradient(&mut analytic);

            let h = 1e-6;
            for i in 0..x.len() {
                let mut xp = x.clone();
                xp[i] += h;
                term.update_x(&xp);
                let fp = term.value(false);

                let mut xm = x.clone();
                xm[i] -= h;
                term.update_x(&xm);
                let fm = term.value(false);

                let fd = (fp - fm) / (2.0 * h);
                assert!(
                    (analytic[i] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                    "gradient mismatch at {}: analytic {} vs fd {}",
                    i,
                    analytic[i],
                    fd
                );
            }
        }
    }

    #[test]
    fn test_finite_difference_hessian_action() {
        let mesh = disk_mesh();
        let mut term = ready_term(&mesh);
        let mut rng = StdRng::seed_from_u64(3);

        let mut x = identity_embedding(&mesh);
        for xi in x.iter_mut() {
            *xi += rng.random_range(-0.05..0.05);
        }
        let mut p = DVector::zeros(x.len());
        for pi in p.iter_mut() {
            *pi = rng.random_range(-1.0..1.0);
        }

        // Analytic H*p assembled from the mirrored upper triangle.
        term.update_x(&x);
        term.hessian();
        let mut hp: DVector<f64> = DVector::zeros(x.len());
        for (k, (r, c)) in term.pattern().iter().enumerate() {
            let v = term.coefficients()[k];
            hp[r] += v * p[c];
            if r != c {
                hp[c] += v * p[r];
            }
        }

        // Directional finite difference of the gradient.
        let h = 1e-6;
        let xp = &x + &p * h;
        term.update_x(&xp);
        let mut gp = DVector::zeros(x.len());
        term.gradient(&mut gp);
        let xm = &x - &p * h;
        term.update_x(&xm);
        let mut gm = DVector::zeros(x.len());
        term.gradient(&mut gm);
        let fd = (gp - gm) / (2.0 * h);

        for i in 0..x.len() {
            assert!(
                (hp[i] - fd[i]).abs() < 1e-3 * (1.0 + fd[i].abs()),
                "hessian mismatch at {}: analytic {} vs fd {}",
                i,
                hp[i],
                fd[i]
            );
        }
    }
}
