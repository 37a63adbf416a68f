//! Steepest descent over the composite objective.
//!
//! Uses the plain negative gradient as the descent direction with the same
//! flip-avoiding backtracking search as the Newton solver. No linear
//! system is assembled, so the per-step cost is one evaluation sweep; the
//! price is far slower convergence on stiff distortion energies.

use std::sync::Arc;

use nalgebra::DVector;
use tracing::warn;

use crate::energy::CompositeEnergy;
use crate::error::{EnergyError, Result};
use crate::mesh::TriMesh;

use super::line_search::backtrack;
use super::trace::{IterationRecord, IterationTrace};
use super::{DescentSolver, SolverOptions, SolverState};

/// Gradient-descent solver owning the current iterate.
pub struct GradientDescentSolver {
    mesh: Arc<TriMesh>,
    objective: CompositeEnergy,
    options: SolverOptions,
    x: DVector<f64>,
    grad: DVector<f64>,
    state: SolverState,
    iteration: usize,
    energy: f64,
    trace: Option<IterationTrace>,
}

impl GradientDescentSolver {
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
}

impl DescentSolver for GradientDescentSolver {
    fn init(&mut self, x0: DVector<f64>) -> Result<()> {
        self.objective.init()?;
        if x0.len() != self.objective.num_variables() {
            return Err(EnergyError::config(format!(
                "initial iterate has {} entries for {} variables",
                x0.len(),
                self.objective.num_variables()
            )));
        }
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
        let direction = -&self.grad;
        let grad_norm = self.grad.amax();
        let dphi0 = -self.grad.norm_squared();

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
