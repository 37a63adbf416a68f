//! Newton's method over the composite objective.
//!
//! Each step assembles the weighted gradient and Hessian, factorizes the
//! shifted system, solves `H p = -g`, and globalizes the step with the
//! flip-avoiding backtracking search. A factorization that reports an
//! indefinite system escalates the composite's diagonal shift and retries
//! within a bounded budget; after a successful step the shift is restored
//! to its configured base value.

use std::sync::Arc;

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::energy::CompositeEnergy;
use crate::error::{EnergyError, Result};
use crate::mesh::TriMesh;

use super::line_search::backtrack;
use super::linear::SparseSolver;
use super::trace::{IterationRecord, IterationTrace};
use super::{DescentSolver, SolverOptions, SolverState};

/// Newton solver owning the current iterate.
pub struct NewtonSolver {
    mesh: Arc<TriMesh>,
    objective: CompositeEnergy,
    options: SolverOptions,
    x: DVector<f64>,
    grad: DVector<f64>,
    state: SolverState,
    iteration: usize,
    energy: f64,
    /// Constructed lazily, exactly once; its pattern is never re-set.
    linear: Option<SparseSolver>,
    base_shift: f64,
    trace: Option<IterationTrace>,
}

impl NewtonSolver {
    /// Create a solver over a composite objective.
    pub fn new(mesh: Arc<TriMesh>, objective: CompositeEnergy, options: SolverOptions) -> Self {
        let n = objective.num_variables();
        let trace = options.collect_trace.then(IterationTrace::new);
        Self {
            mesh,
            objective,
            options,
            x: DVector::zeros(n),
            grad: DVector::zeros(n),
            state: SolverState::Uninitialized,
            iteration: 0,
            energy: f64::INFINITY,
            linear: None,
            base_shift: 0.0,
            trace,
        }
    }

    /// The objective, e.g. to fetch term handles for reweighing.
    pub fn objective(&self) -> &CompositeEnergy {
        &self.objective
    }

    /// Mutable access to the objective.
    pub fn objective_mut(&mut self) -> &mut CompositeEnergy {
        &mut self.objective
    }

    /// Consume the solver, returning the objective and final iterate.
    pub fn into_parts(self) -> (CompositeEnergy, DVector<f64>) {
        (self.objective, self.x)
    }

    /// Construct the linear solver on first use.
    ///
    /// The objective's merged pattern is frozen by `init`, so the symbolic
    /// structure is set once here and only numeric values flow through
    /// later.
    fn internal_init(&mut self) -> Result<()> {
        if self.linear.is_some() {
            return Ok(());
        }
        let pattern = self.objective.pattern();
        let mut linear = SparseSolver::new();
        linear.set_pattern(pattern.rows(), pattern.cols(), self.objective.num_variables())?;
        linear.analyze_pattern()?;
        debug!(
            dim = self.objective.num_variables(),
            entries = pattern.len(),
            "newton linear solver ready"
        );
        self.linear = Some(linear);
        Ok(())
    }

    /// Factorize the current coefficients, escalating the diagonal shift on
    /// indefinite systems.
    fn factorize_with_escalation(&mut self) -> Result<()> {
        let linear = self.linear.as_mut().expect("internal_init ran");
        let mut retries = 0;
        loop {
            match linear.factorize(self.objective.coefficients()) {
                Ok(()) => return Ok(()),
                Err(EnergyError::Factorization(reason)) => {
                    if retries >= self.options.max_shift_retries {
                        self.objective.set_diagonal_shift(self.base_shift);
                        return Err(EnergyError::Factorization(reason));
                    }
                    let current = self.objective.diagonal_shift();
                    let raised = if current > 0.0 {
                        current * self.options.shift_growth
                    } else {
                        1e-8
                    };
                    warn!(
                        shift = raised,
                        retry = retries + 1,
                        "indefinite system; raising diagonal shift"
                    );
                    self.objective.set_diagonal_shift(raised);
                    retries += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

impl DescentSolver for NewtonSolver {
    fn init(&mut self, x0: DVector<f64>) -> Result<()> {
        self.objective.init()?;
        if x0.len() != self.objective.num_variables() {
            return Err(EnergyError::config(format!(
                "initial iterate has {} entries for {} variables",
                x0.len(),
                self.objective.num_variables()
            )));
        }
        self.base_shift = self.objective.diagonal_shift();
        self.x = x0;
        self.grad = DVector::zeros(self.x.len());
        self.iteration = 0;
        self.state = SolverState::Initialized;
        Ok(())
    }

    fn step(&mut self) -> Result<f64> {
        match self.state {
            SolverState::Uninitialized => {
                return Err(EnergyError::config("step before init"));
            }
            s if s.is_terminal() => return Ok(self.energy),
            _ => {}
        }
        self.internal_init()?;
        self.state = SolverState::Stepping;

        self.objective.update_x(&self.x)?;
        let energy = self.objective.value(true);
        if !energy.is_finite() {
            warn!(energy, "non-finite energy; marking diverged");
            self.energy = energy;
            self.state = SolverState::Diverged;
            return Ok(energy);
        }

        self.objective.gradient(&mut self.grad);
        self.objective.hessian();
        self.factorize_with_escalation()?;

        let rhs: Vec<f64> = self.grad.iter().map(|g| -g).collect();
        let direction = self
            .linear
            .as_ref()
            .expect("internal_init ran")
            .solve(&rhs)?;
        let dphi0 = self.grad.dot(&direction);

        let grad_norm = self.grad.amax();
        let mut record = self
            .trace
            .as_ref()
            .map(|_| IterationRecord::new(self.iteration, energy, grad_norm));

        let outcome = backtrack(
            &mut self.objective,
            &self.mesh,
            &mut self.x,
            &direction,
            energy,
            dphi0,
            &self.options.line_search,
            record.as_mut(),
        )?;

        if self.objective.diagonal_shift() != self.base_shift {
            self.objective.set_diagonal_shift(self.base_shift);
        }

        self.energy = outcome.energy;
        self.iteration += 1;

        let step_norm = outcome.step * direction.amax();
        if !self.options.test_progress(grad_norm, step_norm) {
            self.state = SolverState::Converged;
            if let Some(rec) = record.as_mut() {
                rec.note = Some("converged");
            }
        } else if self.iteration >= self.options.max_iterations {
            self.state = SolverState::Halted;
            if let Some(rec) = record.as_mut() {
                rec.note = Some("iteration cap");
            }
        }

        if let (Some(trace), Some(rec)) = (self.trace.as_mut(), record) {
            trace.push(rec);
        }
        Ok(outcome.energy)
    }

    fn state(&self) -> SolverState {
        self.state
    }

    fn x(&self) -> &DVector<f64> {
        &self.x
    }

    fn energy(&self) -> f64 {
        self.energy
    }

    fn iterations(&self) -> usize {
        self.iteration
    }

    fn trace(&self) -> Option<&IterationTrace> {
        self.trace.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{term_handle, EnergyTerm, PositionPenalty, SymmetricDirichlet};
    use nalgebra::{Point2, Point3};

    fn triangle_mesh() -> Arc<TriMesh> {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        Arc::new(TriMesh::from_triangles(&vertices, &[[0, 1, 2]]).unwrap())
    }

    fn grid_mesh(n: usize) -> Arc<TriMesh> {
        let mut vertices = Vec::new();
        for j in 0..=n {
            for i in 0..=n {
                vertices.push(Point3::new(i as f64, j as f64, 0.0));
            }
        }
        let mut faces = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let v00 = j * (n + 1) + i;
                let v10 = v00 + 1;
                let v01 = v00 + n + 1;
                let v11 = v01 + 1;
                faces.push([v00, v10, v11]);
                faces.push([v00, v11, v01]);
            }
        }
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

    #[test]
    fn test_step_before_init_is_an_error() {
        let mesh = triangle_mesh();
        let objective = CompositeEnergy::new(mesh.num_variables());
        let mut solver = NewtonSolver::new(mesh, objective, SolverOptions::default());
        assert!(matches!(
            solver.step(),
            Err(EnergyError::Configuration(_))
        ));
    }

    #[test]
    fn test_single_newton_step_solves_quadratic_exactly() {
        // With every vertex pinned the objective is exactly quadratic, so
        // one Newton step (zero shift, full step) lands on the targets.
        let mesh = triangle_mesh();
        let targets = vec![
            (0, Point2::new(0.5, 0.5)),
            (1, Point2::new(1.5, 0.5)),
            (2, Point2::new(0.5, 1.5)),
        ];
        let mut pins = PositionPenalty::new("pins");
        pins.set_mesh(Arc::clone(&mesh));
        pins.set_targets(targets.clone());

        let mut objective =
            CompositeEnergy::new(mesh.num_variables()).with_diagonal_shift(0.0);
        objective.add_term(term_handle(pins)).unwrap();

        let mut solver =
            NewtonSolver::new(Arc::clone(&mesh), objective, SolverOptions::default());
        solver.init(identity_embedding(&mesh)).unwrap();
        let energy = solver.step().unwrap();

        assert!(energy < 1e-24);
        for &(v, target) in &targets {
            assert!((solver.x()[mesh.u_index(v)] - target.x).abs() < 1e-12);
            assert!((solver.x()[mesh.v_index(v)] - target.y).abs() < 1e-12);
        }
        // The quadratic leaves nothing to improve: the next step converges.
        solver.step().unwrap();
        assert_eq!(solver.state(), SolverState::Converged);
    }

    #[test]
    fn test_distortion_energy_decreases_monotonically() {
        let mesh = grid_mesh(3);
        let mut distortion = SymmetricDirichlet::new("distortion");
        distortion.set_mesh(Arc::clone(&mesh));
        let mut pins = PositionPenalty::new("pins");
        pins.set_mesh(Arc::clone(&mesh));
        pins.set_targets(vec![(0, Point2::new(0.0, 0.0))]);
        pins.set_weight(10.0);

        let mut objective = CompositeEnergy::new(mesh.num_variables());
        objective.add_term(term_handle(distortion)).unwrap();
        objective.add_term(term_handle(pins)).unwrap();

        let options = SolverOptions::default().with_trace(true);
        let mut solver = NewtonSolver::new(Arc::clone(&mesh), objective, options);
        solver.init(mesh.initial_embedding().unwrap()).unwrap();

        let mut last = f64::INFINITY;
        for _ in 0..10 {
            let energy = solver.step().unwrap();
            assert!(energy <= last + 1e-12, "energy increased: {} -> {}", last, energy);
            last = energy;
            if solver.state().is_terminal() {
                break;
            }
        }
        // No face may flip along the way.
        for f in 0..mesh.num_faces() {
            assert!(mesh.signed_area(solver.x(), f) > 0.0);
        }
        let trace = solver.trace().unwrap();
        assert!(!trace.is_empty());
        assert!(trace.records()[0].trials.len() >= 1);
    }

    #[test]
    fn test_converges_on_distortion_objective() {
        let mesh = grid_mesh(2);
        let mut distortion = SymmetricDirichlet::new("distortion");
        distortion.set_mesh(Arc::clone(&mesh));
        let mut pins = PositionPenalty::new("pins");
        pins.set_mesh(Arc::clone(&mesh));
        pins.set_targets(vec![(0, Point2::new(0.0, 0.0)), (8, Point2::new(2.0, 2.0))]);

        let mut objective = CompositeEnergy::new(mesh.num_variables());
        objective.add_term(term_handle(distortion)).unwrap();
        objective.add_term(term_handle(pins)).unwrap();

        let options = SolverOptions::default().with_tol_grad(1e-7);
        let mut solver = NewtonSolver::new(Arc::clone(&mesh), objective, options);
        solver.init(mesh.initial_embedding().unwrap()).unwrap();

        for _ in 0..200 {
            solver.step().unwrap();
            if solver.state().is_terminal() {
                break;
            }
        }
        assert_eq!(solver.state(), SolverState::Converged);
    }
}
