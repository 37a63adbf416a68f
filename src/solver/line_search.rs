//! Globalized line search.
//!
//! Two composable layers:
//!
//! 1. A **flip-avoiding upper bound** on the step length: the largest step
//!    along the descent direction before any triangle's signed area crosses
//!    zero, scaled by a safety factor. Per face the signed area is a
//!    quadratic in the step length, so the bound is the smallest positive
//!    root over all faces.
//! 2. **Backtracking**: starting from that bound (capped at 1), the step is
//!    halved up to a fixed budget while the trial energy does not improve
//!    on the current energy; when the budget is exhausted the last trial is
//!    accepted regardless, keeping the iteration moving.
//!
//! Persisting the accepted iterate into the shared snapshot slot is the
//! worker's job; see [`crate::solver::task`].

use nalgebra::DVector;

use crate::energy::CompositeEnergy;
use crate::error::Result;
use crate::mesh::TriMesh;

use super::trace::{IterationRecord, TrialRecord};

/// Backtracking parameters.
#[derive(Debug, Clone, Copy)]
pub struct LineSearchOptions {
    /// Maximum number of halvings before the last trial is accepted.
    pub max_halvings: usize,
    /// Whether the starting step is capped by the flip-avoiding bound.
    pub flip_avoidance: bool,
    /// Safety factor applied to the flip-avoiding bound.
    pub flip_safety: f64,
    /// Armijo sufficient-decrease coefficient; 0 demands plain strict
    /// decrease.
    pub sufficient_decrease: f64,
}

impl Default for LineSearchOptions {
    fn default() -> Self {
        Self {
            max_halvings: 10,
            flip_avoidance: true,
            flip_safety: 0.8,
            sufficient_decrease: 0.0,
        }
    }
}

impl LineSearchOptions {
    /// Set the halving budget.
    pub fn with_max_halvings(mut self, max_halvings: usize) -> Self {
        self.max_halvings = max_halvings;
        self
    }

    /// Enable or disable the flip-avoiding starting bound.
    pub fn with_flip_avoidance(mut self, enabled: bool) -> Self {
        self.flip_avoidance = enabled;
        self
    }

    /// Set the safety factor applied to the flip-avoiding bound.
    pub fn with_flip_safety(mut self, safety: f64) -> Self {
        self.flip_safety = safety;
        self
    }

    /// Set the Armijo sufficient-decrease coefficient.
    pub fn with_sufficient_decrease(mut self, coefficient: f64) -> Self {
        self.sufficient_decrease = coefficient;
        self
    }
}

/// Result of one backtracking search.
#[derive(Debug, Clone, Copy)]
pub struct SearchOutcome {
    /// Accepted step length.
    pub step: f64,
    /// Energy at the accepted point.
    pub energy: f64,
    /// Whether the accepted point actually improved on the start energy.
    pub decreased: bool,
}

/// Smallest positive root of `c2 t^2 + c1 t + c0`.
fn smallest_positive_root(c2: f64, c1: f64, c0: f64) -> Option<f64> {
    const EPS: f64 = 1e-14;
    if c2.abs() < EPS {
        if c1.abs() < EPS {
            return None;
        }
        let t = -c0 / c1;
        return (t > EPS).then_some(t);
    }
    let disc = c1 * c1 - 4.0 * c2 * c0;
    if disc < 0.0 {
        return None;
    }
    let sq = disc.sqrt();
    let sign = if c1 >= 0.0 { 1.0 } else { -1.0 };
    let q = -0.5 * (c1 + sign * sq);
    let mut best: Option<f64> = None;
    let mut consider = |t: f64| {
        if t > EPS && best.map_or(true, |b| t < b) {
            best = Some(t);
        }
    };
    consider(q / c2);
    if q.abs() > EPS {
        consider(c0 / q);
    }
    best
}

/// Largest step along `direction` before any face's signed area crosses
/// zero.
///
/// Faces that are already inverted at `x` place no bound. Returns
/// `f64::INFINITY` when no face ever degenerates along the ray.
pub fn max_flip_free_step(mesh: &TriMesh, x: &DVector<f64>, direction: &DVector<f64>) -> f64 {
    let mut bound = f64::INFINITY;
    for f in 0..mesh.num_faces() {
        let [i, j, k] = mesh.face(f);

        let (ui, vi) = (x[mesh.u_index(i)], x[mesh.v_index(i)]);
        let e1 = (
            x[mesh.u_index(j)] - ui,
            x[mesh.v_index(j)] - vi,
        );
        let e2 = (
            x[mesh.u_index(k)] - ui,
            x[mesh.v_index(k)] - vi,
        );

        let (dui, dvi) = (direction[mesh.u_index(i)], direction[mesh.v_index(i)]);
        let f1 = (
            direction[mesh.u_index(j)] - dui,
            direction[mesh.v_index(j)] - dvi,
        );
        let f2 = (
            direction[mesh.u_index(k)] - dui,
            direction[mesh.v_index(k)] - dvi,
        );

        let cross = |a: (f64, f64), b: (f64, f64)| a.0 * b.1 - a.1 * b.0;
        let c0 = cross(e1, e2);
        if c0 <= 0.0 {
            continue;
        }
        let c1 = cross(e1, f2) + cross(f1, e2);
        let c2 = cross(f1, f2);

        if let Some(t) = smallest_positive_root(c2, c1, c0) {
            bound = bound.min(t);
        }
    }
    bound
}

/// Backtracking search along `direction` from `x`.
///
/// On return `x` holds the accepted point and `objective` carries cached
/// values for it. `dphi0` is the directional derivative `g . p` at the
/// start, used by the Armijo variant; pass the plain dot product, it is
/// ignored when `sufficient_decrease` is 0.
#[allow(clippy::too_many_arguments)]
pub fn backtrack(
    objective: &mut CompositeEnergy,
    mesh: &TriMesh,
    x: &mut DVector<f64>,
    direction: &DVector<f64>,
    energy: f64,
    dphi0: f64,
    options: &LineSearchOptions,
    mut record: Option<&mut IterationRecord>,
) -> Result<SearchOutcome> {
    let mut step = 1.0;
    if options.flip_avoidance {
        let bound = max_flip_free_step(mesh, x, direction);
        if bound.is_finite() {
            step = (bound * options.flip_safety).min(1.0);
        }
    }

    let mut trial = DVector::zeros(x.len());
    let mut trial_energy;
    let mut halvings = 0;
    loop {
        trial.copy_from(x);
        trial.axpy(step, direction, 1.0);
        objective.update_x(&trial)?;
        trial_energy = objective.value(false);

        if let Some(rec) = record.as_deref_mut() {
            rec.trials.push(TrialRecord {
                step,
                energy: trial_energy,
            });
        }

        let target = energy + options.sufficient_decrease * step * dphi0;
        if trial_energy < target || halvings >= options.max_halvings {
            break;
        }
        step *= 0.5;
        halvings += 1;
    }

    // The objective state already matches the last trial; refresh the
    // caches at the accepted point.
    x.copy_from(&trial);
    let accepted_energy = objective.value(true);
    if let Some(rec) = record.as_deref_mut() {
        rec.step = step;
    }

    Ok(SearchOutcome {
        step,
        energy: accepted_energy,
        decreased: accepted_energy < energy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{term_handle, PositionPenalty};
    use nalgebra::{Point2, Point3};
    use std::sync::Arc;

    fn triangle_mesh() -> Arc<TriMesh> {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        Arc::new(TriMesh::from_triangles(&vertices, &[[0, 1, 2]]).unwrap())
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

    /// Composite holding one quadratic pin of every vertex to the origin.
    fn quadratic_objective(mesh: &Arc<TriMesh>) -> CompositeEnergy {
        let mut term = PositionPenalty::new("pins");
        term.set_mesh(Arc::clone(mesh));
        term.set_targets(vec![
            (0, Point2::origin()),
            (1, Point2::origin()),
            (2, Point2::origin()),
        ]);
        let mut composite = CompositeEnergy::new(mesh.num_variables());
        composite.add_term(term_handle(term)).unwrap();
        composite.init().unwrap();
        composite
    }

    #[test]
    fn test_translation_never_flips() {
        let mesh = triangle_mesh();
        let x = identity_embedding(&mesh);
        let mut direction = DVector::zeros(x.len());
        for v in 0..mesh.num_vertices() {
            direction[mesh.u_index(v)] = 1.0;
        }
        assert_eq!(max_flip_free_step(&mesh, &x, &direction), f64::INFINITY);
    }

    #[test]
    fn test_collapse_is_bounded() {
        let mesh = triangle_mesh();
        let x = identity_embedding(&mesh);
        // Move every vertex straight at the origin; the triangle collapses
        // exactly at t = 1.
        let direction = -&x;
        let bound = max_flip_free_step(&mesh, &x, &direction);
        assert!((bound - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_vertex_crossing_is_bounded() {
        let mesh = triangle_mesh();
        let x = identity_embedding(&mesh);
        // Push vertex 2 down through the opposite edge: area hits zero at
        // t = 0.5 for a displacement of -2 in v.
        let mut direction = DVector::zeros(x.len());
        direction[mesh.v_index(2)] = -2.0;
        let bound = max_flip_free_step(&mesh, &x, &direction);
        assert!((bound - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_backtracking_decreases_convex_quadratic() {
        let mesh = triangle_mesh();
        let mut objective = quadratic_objective(&mesh);
        let mut x = identity_embedding(&mesh);

        objective.update_x(&x).unwrap();
        let e0 = objective.value(true);

        // Steepest descent direction for the quadratic.
        let mut grad = DVector::zeros(x.len());
        objective.gradient(&mut grad);
        let direction = -&grad;
        let dphi0 = grad.dot(&direction);

        // The full gradient step collapses the triangle exactly at the
        // minimizer, so the flip bound must not cap it here.
        let options = LineSearchOptions::default().with_flip_avoidance(false);
        let outcome = backtrack(
            &mut objective,
            &mesh,
            &mut x,
            &direction,
            e0,
            dphi0,
            &options,
            None,
        )
        .unwrap();

        assert!(outcome.decreased);
        assert!(outcome.energy < e0);
        // Full gradient step on E = 1/2 ||x||^2 lands exactly at the
        // minimizer.
        assert!(outcome.energy.abs() < 1e-20);
        assert!(x.amax() < 1e-12);
    }

    #[test]
    fn test_budget_exhaustion_accepts_last_trial() {
        let mesh = triangle_mesh();
        let mut objective = quadratic_objective(&mesh);
        let mut x = identity_embedding(&mesh);

        objective.update_x(&x).unwrap();
        let e0 = objective.value(true);

        // An ascent direction can never decrease the energy; the search
        // must still terminate and accept the final halved step.
        let mut grad = DVector::zeros(x.len());
        objective.gradient(&mut grad);
        let direction = grad.clone();
        let dphi0 = grad.dot(&direction);

        let options = LineSearchOptions::default().with_max_halvings(3);
        let outcome = backtrack(
            &mut objective,
            &mesh,
            &mut x,
            &direction,
            e0,
            dphi0,
            &options,
            None,
        )
        .unwrap();

        assert!(!outcome.decreased);
        assert!((outcome.step - 1.0 / 8.0).abs() < 1e-15);
    }

    #[test]
    fn test_trials_are_recorded() {
        let mesh = triangle_mesh();
        let mut objective = quadratic_objective(&mesh);
        let mut x = identity_embedding(&mesh);

        objective.update_x(&x).unwrap();
        let e0 = objective.value(true);
        let mut grad = DVector::zeros(x.len());
        objective.gradient(&mut grad);
        let direction = grad.clone(); // ascent: forces halvings

        let mut record = IterationRecord::new(0, e0, grad.amax());
        let options = LineSearchOptions::default().with_max_halvings(2);
        backtrack(
            &mut objective,
            &mesh,
            &mut x,
            &direction,
            e0,
            grad.dot(&direction),
            &options,
            Some(&mut record),
        )
        .unwrap();

        assert_eq!(record.trials.len(), 3);
        assert!((record.trials[0].step - 1.0).abs() < 1e-15);
        assert!((record.trials[2].step - 0.25).abs() < 1e-15);
    }
}
