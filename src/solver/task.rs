//! Background minimization with a cooperative lifecycle.
//!
//! [`SolverTask::spawn`] runs a [`DescentSolver`] on a dedicated worker
//! thread. Callers drive the lifecycle
//!
//! ```text
//! Terminated -> Running -> { Paused <-> Running } -> Terminating -> Terminated
//! ```
//!
//! and poll for the latest iterate. The worker re-reads the run state only
//! at step boundaries: an in-flight evaluate / solve / line-search sequence
//! always completes, pausing and termination are never observed mid-step.
//!
//! The snapshot exchange is single-writer/multi-reader: after each accepted
//! step the worker copies the iterate into a mutex-guarded slot and raises
//! a freshness flag; a reader copies the slot out only while the flag is
//! up and lowers it. No torn reads, no lost updates, and the worker never
//! blocks on a slow consumer.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::error::{EnergyError, Result};

use super::DescentSolver;

/// Lifecycle states of a background solver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Worker running steps.
    Running,
    /// Worker blocked at a step boundary, waiting for resume.
    Paused,
    /// Termination requested, worker has not yet observed it.
    Terminating,
    /// Worker exited (terminated, converged, or gave up).
    Terminated,
}

struct Lifecycle {
    state: Mutex<RunState>,
    signal: Condvar,
}

struct Slot {
    x: DVector<f64>,
    energy: f64,
    fresh: bool,
}

/// Single-slot exchange for the latest accepted iterate.
struct ApproximationSlot {
    slot: Mutex<Slot>,
}

impl ApproximationSlot {
    fn new(n: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                x: DVector::zeros(n),
                energy: f64::INFINITY,
                fresh: false,
            }),
        }
    }

    /// Writer side: store the iterate and raise the freshness flag.
    fn publish(&self, x: &DVector<f64>, energy: f64) {
        let mut slot = self.slot.lock().expect("snapshot lock poisoned");
        slot.x.copy_from(x);
        slot.energy = energy;
        slot.fresh = true;
    }

    /// Reader side: copy the iterate out if it changed since the last take.
    fn take(&self, out: &mut DVector<f64>) -> Option<f64> {
        let mut slot = self.slot.lock().expect("snapshot lock poisoned");
        if !slot.fresh {
            return None;
        }
        out.copy_from(&slot.x);
        slot.fresh = false;
        Some(slot.energy)
    }
}

/// Handle to a solver running on a background worker thread.
///
/// Dropping the handle terminates the worker and joins it.
///
/// # Example
///
/// ```no_run
/// use flatiron::solver::{DescentSolver, SolverTask};
/// use nalgebra::DVector;
/// # fn demo(solver: flatiron::solver::NewtonSolver) -> flatiron::error::Result<()> {
///
/// let task = SolverTask::spawn(solver)?;
/// let mut latest = DVector::zeros(task.num_variables());
/// // ... event loop ...
/// if task.latest_approximation(&mut latest).is_some() {
///     // redraw with `latest`
/// }
/// task.pause();
/// task.resume();
/// let solver = task.terminate()?;
/// # let _ = solver; Ok(())
/// # }
/// ```
pub struct SolverTask<S: DescentSolver + 'static> {
    lifecycle: Arc<Lifecycle>,
    snapshot: Arc<ApproximationSlot>,
    num_variables: usize,
    handle: Option<JoinHandle<S>>,
}

impl<S: DescentSolver + 'static> SolverTask<S> {
    /// Spawn the worker and start stepping immediately.
    ///
    /// The solver must already be initialized with its starting iterate.
    ///
    /// # Errors
    ///
    /// Fails if the worker thread cannot be spawned.
    pub fn spawn(solver: S) -> Result<Self> {
        let num_variables = solver.x().len();
        let lifecycle = Arc::new(Lifecycle {
            state: Mutex::new(RunState::Running),
            signal: Condvar::new(),
        });
        let snapshot = Arc::new(ApproximationSlot::new(num_variables));

        let worker_lifecycle = Arc::clone(&lifecycle);
        let worker_snapshot = Arc::clone(&snapshot);
        let handle = thread::Builder::new()
            .name("flatiron-solver".into())
            .spawn(move || worker_loop(solver, worker_lifecycle, worker_snapshot))
            .map_err(|e| EnergyError::config(format!("failed to spawn worker: {}", e)))?;

        Ok(Self {
            lifecycle,
            snapshot,
            num_variables,
            handle: Some(handle),
        })
    }

    /// Number of variables in published iterates.
    #[inline]
    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// The current run state.
    pub fn run_state(&self) -> RunState {
        *self.lifecycle.state.lock().expect("lifecycle lock poisoned")
    }

    /// Ask the worker to pause at the next step boundary.
    ///
    /// A no-op unless the worker is running.
    pub fn pause(&self) {
        let mut state = self.lifecycle.state.lock().expect("lifecycle lock poisoned");
        if *state == RunState::Running {
            *state = RunState::Paused;
            self.lifecycle.signal.notify_all();
        }
    }

    /// Resume a paused worker.
    pub fn resume(&self) {
        let mut state = self.lifecycle.state.lock().expect("lifecycle lock poisoned");
        if *state == RunState::Paused {
            *state = RunState::Running;
            self.lifecycle.signal.notify_all();
        }
    }

    /// Copy out the latest iterate if it changed since the last poll.
    ///
    /// Returns the energy at the iterate, or `None` when nothing new was
    /// published. `out` must have [`num_variables`](Self::num_variables)
    /// entries.
    pub fn latest_approximation(&self, out: &mut DVector<f64>) -> Option<f64> {
        self.snapshot.take(out)
    }

    /// Request termination, join the worker, and return the solver.
    ///
    /// This is the only blocking call: it waits for at most the one step
    /// currently in flight.
    ///
    /// # Errors
    ///
    /// Returns [`EnergyError::WorkerPanicked`] if the worker thread
    /// panicked.
    pub fn terminate(mut self) -> Result<S> {
        self.request_termination();
        let handle = self.handle.take().expect("worker joined exactly once");
        handle.join().map_err(|_| EnergyError::WorkerPanicked)
    }

    fn request_termination(&self) {
        let mut state = self.lifecycle.state.lock().expect("lifecycle lock poisoned");
        if !matches!(*state, RunState::Terminated) {
            *state = RunState::Terminating;
            self.lifecycle.signal.notify_all();
        }
    }
}

impl<S: DescentSolver + 'static> Drop for SolverTask<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.request_termination();
            let _ = handle.join();
        }
    }
}

/// How many consecutive failed steps before the worker gives up.
const MAX_CONSECUTIVE_FAILURES: usize = 8;

fn worker_loop<S: DescentSolver>(
    mut solver: S,
    lifecycle: Arc<Lifecycle>,
    snapshot: Arc<ApproximationSlot>,
) -> S {
    let mut failures = 0usize;
    loop {
        // State is observed only here, at the step boundary.
        {
            let mut state = lifecycle.state.lock().expect("lifecycle lock poisoned");
            while *state == RunState::Paused {
                state = lifecycle
                    .signal
                    .wait(state)
                    .expect("lifecycle lock poisoned");
            }
            if *state == RunState::Terminating {
                *state = RunState::Terminated;
                lifecycle.signal.notify_all();
                debug!("worker observed termination request");
                return solver;
            }
        }

        match solver.step() {
            Ok(energy) => {
                failures = 0;
                snapshot.publish(solver.x(), energy);
                if solver.state().is_terminal() {
                    debug!(
                        state = ?solver.state(),
                        iterations = solver.iterations(),
                        "worker finished"
                    );
                    break;
                }
            }
            Err(e) => {
                // Per-iteration failures cross the thread boundary as
                // values; the worker logs them and keeps trying until they
                // persist.
                failures += 1;
                warn!(error = %e, failures, "step failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("giving up after repeated step failures");
                    break;
                }
            }
        }
    }

    let mut state = lifecycle.state.lock().expect("lifecycle lock poisoned");
    *state = RunState::Terminated;
    lifecycle.signal.notify_all();
    solver
}
