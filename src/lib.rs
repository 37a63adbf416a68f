//! # Flatiron
//!
//! A mesh-parameterization energy-minimization engine.
//!
//! Flatiron flattens triangle surfaces by minimizing a weighted composite
//! of pluggable distortion and constraint energies with Newton's method or
//! gradient descent, globalized by a flip-avoiding backtracking line
//! search. Minimization runs as a cancellable background computation that
//! a presentation layer polls for intermediate results.
//!
//! ## Features
//!
//! - **Pluggable energy terms**: value / gradient / sparse Hessian behind
//!   one trait, with the Hessian layout frozen at initialization
//! - **Composite objective**: independent per-term weights, merged sparsity,
//!   tunable diagonal regularization
//! - **Direct sparse solver**: LDL^T with a one-time symbolic analysis and
//!   per-iteration numeric refactorization
//! - **Dependency graph**: shared per-feature producers recomputed in
//!   height order, never stale, parallel within a layer
//! - **Background lifecycle**: start / pause / resume / terminate plus a
//!   single-slot snapshot of the latest iterate
//!
//! ## Quick Start
//!
//! ```
//! use flatiron::prelude::*;
//! use nalgebra::{DVector, Point2, Point3};
//! use std::sync::Arc;
//!
//! // A two-triangle square to flatten (already planar here for brevity).
//! let vertices = vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(1.0, 1.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//! ];
//! let faces = vec![[0, 1, 2], [0, 2, 3]];
//! let mesh = Arc::new(TriMesh::from_triangles(&vertices, &faces).unwrap());
//!
//! // Distortion plus one pinned vertex, aggregated under weights.
//! let mut distortion = SymmetricDirichlet::new("distortion");
//! distortion.set_mesh(Arc::clone(&mesh));
//!
//! let mut pins = PositionPenalty::new("pins");
//! pins.set_mesh(Arc::clone(&mesh));
//! pins.set_targets(vec![(0, Point2::new(0.0, 0.0))]);
//! pins.set_weight(100.0);
//!
//! let mut objective = CompositeEnergy::new(mesh.num_variables());
//! objective.add_term(term_handle(distortion)).unwrap();
//! objective.add_term(term_handle(pins)).unwrap();
//!
//! // Newton iteration from the Tutte seed.
//! let mut solver = NewtonSolver::new(
//!     Arc::clone(&mesh),
//!     objective,
//!     SolverOptions::default(),
//! );
//! solver.init(mesh.initial_embedding().unwrap()).unwrap();
//! while !solver.state().is_terminal() {
//!     solver.step().unwrap();
//! }
//! ```
//!
//! ## Background minimization
//!
//! ```no_run
//! use flatiron::prelude::*;
//! use nalgebra::DVector;
//! # fn demo(solver: NewtonSolver) -> flatiron::error::Result<()> {
//!
//! let task = SolverTask::spawn(solver)?;
//! let mut latest = DVector::zeros(task.num_variables());
//! loop {
//!     if let Some(energy) = task.latest_approximation(&mut latest) {
//!         // hand `latest` to the display layer
//!         if energy < 1e-6 { break; }
//!     }
//! }
//! task.pause();
//! task.resume();
//! let solver = task.terminate()?;
//! # let _ = solver; Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod energy;
pub mod error;
pub mod graph;
pub mod mesh;
pub mod solver;

/// Prelude module for convenient imports.
///
/// ```
/// use flatiron::prelude::*;
/// ```
pub mod prelude {
    pub use crate::energy::{
        term_handle, CompositeEnergy, EnergyTerm, PositionPenalty, SymmetricDirichlet,
    };
    pub use crate::error::{EnergyError, Result};
    pub use crate::mesh::TriMesh;
    pub use crate::solver::{
        DescentSolver, GradientDescentSolver, NewtonSolver, RunState, SolverOptions, SolverState,
        SolverTask,
    };
}

// Re-export nalgebra types for convenience
pub use nalgebra;
