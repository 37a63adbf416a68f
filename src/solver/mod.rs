//! Descent solvers and the background minimization lifecycle.
//!
//! Two solvers drive the composite objective downhill: [`NewtonSolver`]
//! (direction from the sparse Newton system `H p = -g`) and
//! [`GradientDescentSolver`] (`p = -g`). Both share the flip-avoiding
//! backtracking line search and the same state machine:
//!
//! ```text
//! Uninitialized -> Initialized -> Stepping -> { Converged | Halted | Diverged }
//! ```
//!
//! [`task::SolverTask`] runs a solver on a dedicated worker thread with
//! pause/resume/terminate and a polling snapshot of the latest iterate.

use nalgebra::DVector;

use crate::error::Result;

pub mod gradient_descent;
pub mod line_search;
pub mod linear;
pub mod task;
pub mod trace;

mod newton;

pub use gradient_descent::GradientDescentSolver;
pub use line_search::{LineSearchOptions, SearchOutcome};
pub use newton::NewtonSolver;
pub use task::{RunState, SolverTask};
pub use trace::{IterationRecord, IterationTrace, TrialRecord};

/// Lifecycle of a descent solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    /// Constructed, `init` not yet called.
    Uninitialized,
    /// Ready to step from the initial iterate.
    Initialized,
    /// At least one step taken, none of the terminal conditions met.
    Stepping,
    /// The stopping rule fired.
    Converged,
    /// The iteration cap was reached or repeated step failures gave up.
    Halted,
    /// The energy became non-finite.
    Diverged,
}

impl SolverState {
    /// Whether the solver reached a terminal state.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SolverState::Converged | SolverState::Halted | SolverState::Diverged
        )
    }
}

/// Tunable solver parameters.
#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    /// Gradient infinity-norm threshold of the stopping rule.
    pub tol_grad: f64,
    /// Accepted-step infinity-norm threshold of the stopping rule.
    pub tol_step: f64,
    /// Iteration cap; reaching it halts the solver.
    pub max_iterations: usize,
    /// How many times a failed factorization may escalate the diagonal
    /// shift before the step is reported as failed.
    pub max_shift_retries: usize,
    /// Multiplier applied to the diagonal shift on each escalation.
    pub shift_growth: f64,
    /// Line-search parameters.
    pub line_search: LineSearchOptions,
    /// Whether to record an [`IterationTrace`].
    pub collect_trace: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tol_grad: 1e-6,
            tol_step: 1e-10,
            max_iterations: 10_000,
            max_shift_retries: 12,
            shift_growth: 10.0,
            line_search: LineSearchOptions::default(),
            collect_trace: false,
        }
    }
}

impl SolverOptions {
    /// Set the gradient-norm threshold.
    pub fn with_tol_grad(mut self, tol: f64) -> Self {
        self.tol_grad = tol;
        self
    }

    /// Set the step-norm threshold.
    pub fn with_tol_step(mut self, tol: f64) -> Self {
        self.tol_step = tol;
        self
    }

    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, cap: usize) -> Self {
        self.max_iterations = cap;
        self
    }

    /// Set the line-search parameters.
    pub fn with_line_search(mut self, line_search: LineSearchOptions) -> Self {
        self.line_search = line_search;
        self
    }

    /// Enable or disable trace collection.
    pub fn with_trace(mut self, collect: bool) -> Self {
        self.collect_trace = collect;
        self
    }

    /// The stopping rule: whether the iteration should continue.
    ///
    /// Progress stops — the solver is converged — once the gradient
    /// infinity norm falls under `tol_grad` or the accepted step moved no
    /// variable by more than `tol_step`.
    pub fn test_progress(&self, grad_norm: f64, step_norm: f64) -> bool {
        grad_norm >= self.tol_grad && step_norm >= self.tol_step
    }
}

/// A solver the background task can drive step by step.
///
/// `step()` runs one full evaluate / direction / line-search / update
/// cycle and returns the accepted energy. Per-iteration numeric failures
/// (a factorization that stays indefinite through every shift escalation)
/// come back as `Err` values — never panics — so the long-running worker
/// can log them and keep going.
pub trait DescentSolver: Send {
    /// Install the initial iterate and initialize the objective.
    fn init(&mut self, x0: DVector<f64>) -> Result<()>;

    /// Take one step; returns the energy at the new iterate.
    fn step(&mut self) -> Result<f64>;

    /// Current lifecycle state.
    fn state(&self) -> SolverState;

    /// The current iterate.
    fn x(&self) -> &DVector<f64>;

    /// Energy at the current iterate (meaningful once stepping).
    fn energy(&self) -> f64;

    /// Number of completed steps.
    fn iterations(&self) -> usize;

    /// The diagnostic trace, when enabled.
    fn trace(&self) -> Option<&IterationTrace>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopping_rule() {
        let options = SolverOptions::default()
            .with_tol_grad(1e-4)
            .with_tol_step(1e-8);

        assert!(options.test_progress(1.0, 1.0));
        assert!(!options.test_progress(1e-5, 1.0), "small gradient stops");
        assert!(!options.test_progress(1.0, 1e-9), "small step stops");
    }

    #[test]
    fn test_terminal_states() {
        assert!(SolverState::Converged.is_terminal());
        assert!(SolverState::Halted.is_terminal());
        assert!(SolverState::Diverged.is_terminal());
        assert!(!SolverState::Stepping.is_terminal());
        assert!(!SolverState::Uninitialized.is_terminal());
    }
}
