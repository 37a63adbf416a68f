//! Leaf data providers.
//!
//! Providers compute per-feature quantities from the variable vector and
//! cache them behind an `RwLock` so several energy terms can read one
//! producer. Each provider implements [`UpdatableNode`]; wiring them into a
//! [`DependencyGraph`](super::DependencyGraph) keeps consumers from ever
//! reading stale caches.
//!
//! The chain used by the distortion energies is
//! coordinates → edge vectors → face Jacobians; fan angles and barycenters
//! hang off the same producers for diagnostic consumers.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use nalgebra::{DVector, Matrix2, Point2, Vector2};

use crate::graph::UpdatableNode;
use crate::mesh::TriMesh;

/// Per-vertex embedded 2D positions split out of the variable vector.
pub struct Coordinates {
    mesh: Arc<TriMesh>,
    cache: RwLock<Vec<Point2<f64>>>,
}

impl Coordinates {
    /// Create the provider for a mesh.
    pub fn new(mesh: Arc<TriMesh>) -> Arc<Self> {
        let n = mesh.num_vertices();
        Arc::new(Self {
            mesh,
            cache: RwLock::new(vec![Point2::origin(); n]),
        })
    }

    /// Read the cached positions.
    pub fn points(&self) -> RwLockReadGuard<'_, Vec<Point2<f64>>> {
        self.cache.read().expect("coordinate cache poisoned")
    }
}

impl UpdatableNode for Coordinates {
    fn name(&self) -> &str {
        "coordinates"
    }

    fn update(&self, x: &DVector<f64>) {
        let mut cache = self.cache.write().expect("coordinate cache poisoned");
        for (v, p) in cache.iter_mut().enumerate() {
            *p = self.mesh.embedded(x, v);
        }
    }
}

/// Per-face embedded edge vectors `[p1-p0, p2-p1, p0-p2]`.
pub struct EdgeVectors {
    mesh: Arc<TriMesh>,
    coordinates: Arc<Coordinates>,
    cache: RwLock<Vec<[Vector2<f64>; 3]>>,
}

impl EdgeVectors {
    /// Create the provider on top of a coordinate producer.
    pub fn new(mesh: Arc<TriMesh>, coordinates: Arc<Coordinates>) -> Arc<Self> {
        let m = mesh.num_faces();
        Arc::new(Self {
            mesh,
            coordinates,
            cache: RwLock::new(vec![[Vector2::zeros(); 3]; m]),
        })
    }

    /// Read the cached edge vectors.
    pub fn edges(&self) -> RwLockReadGuard<'_, Vec<[Vector2<f64>; 3]>> {
        self.cache.read().expect("edge cache poisoned")
    }
}

impl UpdatableNode for EdgeVectors {
    fn name(&self) -> &str {
        "edge-vectors"
    }

    fn update(&self, _x: &DVector<f64>) {
        let points = self.coordinates.points();
        let mut cache = self.cache.write().expect("edge cache poisoned");
        for (f, edges) in cache.iter_mut().enumerate() {
            let [i, j, k] = self.mesh.face(f);
            *edges = [
                points[j] - points[i],
                points[k] - points[j],
                points[i] - points[k],
            ];
        }
    }
}

/// Per-face 2x2 Jacobians of the embedding.
///
/// `J = C * Dinv` where `C` has the current edges `(p1-p0, p2-p0)` as
/// columns and `Dinv` is the face's constant inverse reference frame.
pub struct FaceJacobians {
    mesh: Arc<TriMesh>,
    edges: Arc<EdgeVectors>,
    cache: RwLock<Vec<Matrix2<f64>>>,
}

impl FaceJacobians {
    /// Create the provider on top of an edge-vector producer.
    pub fn new(mesh: Arc<TriMesh>, edges: Arc<EdgeVectors>) -> Arc<Self> {
        let m = mesh.num_faces();
        Arc::new(Self {
            mesh,
            edges,
            cache: RwLock::new(vec![Matrix2::identity(); m]),
        })
    }

    /// Read the cached Jacobians.
    pub fn jacobians(&self) -> RwLockReadGuard<'_, Vec<Matrix2<f64>>> {
        self.cache.read().expect("jacobian cache poisoned")
    }
}

impl UpdatableNode for FaceJacobians {
    fn name(&self) -> &str {
        "face-jacobians"
    }

    fn update(&self, _x: &DVector<f64>) {
        let edges = self.edges.edges();
        let mut cache = self.cache.write().expect("jacobian cache poisoned");
        for (f, jacobian) in cache.iter_mut().enumerate() {
            let [e0, _, e2] = edges[f];
            let current = Matrix2::from_columns(&[e0, -e2]);
            *jacobian = current * self.mesh.rest_inverse(f);
        }
    }
}

/// Per-face corner angles of the embedded triangles.
pub struct FanAngles {
    mesh: Arc<TriMesh>,
    edges: Arc<EdgeVectors>,
    cache: RwLock<Vec<[f64; 3]>>,
}

impl FanAngles {
    /// Create the provider on top of an edge-vector producer.
    pub fn new(mesh: Arc<TriMesh>, edges: Arc<EdgeVectors>) -> Arc<Self> {
        let m = mesh.num_faces();
        Arc::new(Self {
            mesh,
            edges,
            cache: RwLock::new(vec![[0.0; 3]; m]),
        })
    }

    /// Read the cached corner angles.
    pub fn angles(&self) -> RwLockReadGuard<'_, Vec<[f64; 3]>> {
        self.cache.read().expect("angle cache poisoned")
    }
}

fn corner_angle(out: Vector2<f64>, incoming: Vector2<f64>) -> f64 {
    let denom = out.norm() * incoming.norm();
    if denom < 1e-18 {
        return 0.0;
    }
    (out.dot(&incoming) / denom).clamp(-1.0, 1.0).acos()
}

impl UpdatableNode for FanAngles {
    fn name(&self) -> &str {
        "fan-angles"
    }

    fn update(&self, _x: &DVector<f64>) {
        let edges = self.edges.edges();
        let mut cache = self.cache.write().expect("angle cache poisoned");
        for (f, angles) in cache.iter_mut().enumerate() {
            let [e0, e1, e2] = edges[f];
            *angles = [
                corner_angle(e0, -e2),
                corner_angle(e1, -e0),
                corner_angle(e2, -e1),
            ];
        }
    }
}

/// Per-face barycenters of the embedded triangles.
pub struct Barycenters {
    mesh: Arc<TriMesh>,
    coordinates: Arc<Coordinates>,
    cache: RwLock<Vec<Point2<f64>>>,
}

impl Barycenters {
    /// Create the provider on top of a coordinate producer.
    pub fn new(mesh: Arc<TriMesh>, coordinates: Arc<Coordinates>) -> Arc<Self> {
        let m = mesh.num_faces();
        Arc::new(Self {
            mesh,
            coordinates,
            cache: RwLock::new(vec![Point2::origin(); m]),
        })
    }

    /// Read the cached barycenters.
    pub fn barycenters(&self) -> RwLockReadGuard<'_, Vec<Point2<f64>>> {
        self.cache.read().expect("barycenter cache poisoned")
    }
}

impl UpdatableNode for Barycenters {
    fn name(&self) -> &str {
        "barycenters"
    }

    fn update(&self, _x: &DVector<f64>) {
        let points = self.coordinates.points();
        let mut cache = self.cache.write().expect("barycenter cache poisoned");
        for (f, center) in cache.iter_mut().enumerate() {
            let [i, j, k] = self.mesh.face(f);
            let sum = points[i].coords + points[j].coords + points[k].coords;
            *center = Point2::from(sum / 3.0);
        }
    }
}
