//! Soft position constraints.
//!
//! Pins a set of vertices to target positions through the quadratic penalty
//!
//! ```text
//! E = 1/2 * sum_{i in C} ||x_i - p_i||^2
//! ```
//!
//! The constrained set comes from external picking logic; dragging a handle
//! only changes target values, so it never disturbs the frozen Hessian
//! layout. Changing which vertices are constrained is a structural change
//! and requires a fresh `init()`.

use std::sync::Arc;

use nalgebra::{DVector, Point2};

use crate::error::{EnergyError, Result};
use crate::mesh::TriMesh;

use super::{EnergyTerm, SparsityPattern};

/// Quadratic position-constraint term.
///
/// Exactly quadratic: its Hessian is the identity on the constrained
/// indices, so a single Newton step minimizing this term alone lands on the
/// targets.
pub struct PositionPenalty {
    name: String,
    weight: f64,
    mesh: Option<Arc<TriMesh>>,
    /// Constrained vertices with their targets (required shape member).
    targets: Option<Vec<(usize, Point2<f64>)>>,
    num_variables: usize,
    initialized: bool,

    /// Current embedded positions of the constrained vertices.
    current: Vec<Point2<f64>>,
    pattern: SparsityPattern,
    coefficients: Vec<f64>,
    element_energies: Vec<f64>,
    cached_value: f64,
}

impl PositionPenalty {
    /// Create an uninitialized term; mesh and targets must be set before
    /// `init()`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            mesh: None,
            targets: None,
            num_variables: 0,
            initialized: false,
            current: Vec::new(),
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

    /// Set the constrained vertices and their targets (required shape
    /// member).
    pub fn set_targets(&mut self, targets: Vec<(usize, Point2<f64>)>) {
        self.targets = Some(targets);
    }

    /// Move the targets of the already-constrained vertices.
    ///
    /// # Errors
    ///
    /// After `init()` the constrained set is part of the frozen layout;
    /// supplying a different vertex set fails with a configuration error.
    pub fn update_targets(&mut self, targets: Vec<(usize, Point2<f64>)>) -> Result<()> {
        if self.initialized {
            let current = self
                .targets
                .as_ref()
                .expect("initialized term has targets");
            let same_set = current.len() == targets.len()
                && current
                    .iter()
                    .zip(targets.iter())
                    .all(|((a, _), (b, _))| a == b);
            if !same_set {
                return Err(EnergyError::config(
                    "changing the constrained vertex set requires re-initialization",
                ));
            }
        }
        self.targets = Some(targets);
        Ok(())
    }

    /// The constrained vertices and their current targets.
    pub fn targets(&self) -> &[(usize, Point2<f64>)] {
        self.targets.as_deref().unwrap_or(&[])
    }
}

impl EnergyTerm for PositionPenalty {
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
            .ok_or_else(|| EnergyError::config("position penalty has no mesh"))?
            .clone();
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| EnergyError::config("position penalty has no constrained vertices"))?;

        for &(v, _) in targets {
            if v >= mesh.num_vertices() {
                return Err(EnergyError::config(format!(
                    "constrained vertex {} is out of range",
                    v
                )));
            }
        }

        if self.num_variables == 0 {
            self.num_variables = mesh.num_variables();
        } else if self.num_variables < mesh.num_variables() {
            return Err(EnergyError::config(format!(
                "variable count {} is smaller than the embedding size {}",
                self.num_variables,
                mesh.num_variables()
            )));
        }

        self.pattern = SparsityPattern::new();
        for &(v, _) in targets {
            self.pattern.push(mesh.u_index(v), mesh.u_index(v));
            self.pattern.push(mesh.v_index(v), mesh.v_index(v));
        }

        self.current = vec![Point2::origin(); targets.len()];
        self.coefficients = vec![0.0; self.pattern.len()];
        self.element_energies = vec![0.0; targets.len()];
        self.cached_value = 0.0;
        self.initialized = true;
        Ok(())
    }

    fn update_x(&mut self, x: &DVector<f64>) {
        debug_assert!(self.initialized, "update_x before init");
        let mesh = self.mesh.as_ref().expect("initialized term has a mesh");
        let targets = self.targets.as_ref().expect("initialized term has targets");
        for (slot, &(v, _)) in targets.iter().enumerate() {
            self.current[slot] = mesh.embedded(x, v);
        }
    }

    fn value(&mut self, update: bool) -> f64 {
        let targets = self.targets.as_ref().expect("initialized term has targets");
        let mut total = 0.0;
        for (slot, &(_, target)) in targets.iter().enumerate() {
            let energy = 0.5 * (self.current[slot] - target).norm_squared();
            if update {
                self.element_energies[slot] = energy;
            }
            total += energy;
        }
        if update {
            self.cached_value = total;
        }
        total
    }

    fn gradient(&self, grad: &mut DVector<f64>) {
        let mesh = self.mesh.as_ref().expect("initialized term has a mesh");
        let targets = self.targets.as_ref().expect("initialized term has targets");
        for (slot, &(v, target)) in targets.iter().enumerate() {
            let delta = self.current[slot] - target;
            grad[mesh.u_index(v)] += delta.x;
            grad[mesh.v_index(v)] += delta.y;
        }
    }

    fn hessian(&mut self) {
        // Constant identity blocks on the constrained indices.
        self.coefficients.fill(1.0);
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
