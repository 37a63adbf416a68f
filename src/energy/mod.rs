//! Energy terms and their composition.
//!
//! An energy term is a scalar function of the variable vector together with
//! its dense gradient and sparse Hessian. Terms share one discipline: the
//! Hessian's (row, col) layout is frozen once at `init()` and only the
//! coefficient values change afterwards, so the solver's symbolic
//! factorization stays valid across every iteration.
//!
//! # Lifecycle
//!
//! ```text
//! construct -> set shape members -> init() -> (update_x, value, gradient, hessian)*
//! ```
//!
//! `init()` fails fast with [`EnergyError::Configuration`] when a required
//! shape member (mesh, constraint lists) was never supplied.

use nalgebra::DVector;

use crate::error::Result;

mod composite;
mod position;
mod symmetric_dirichlet;

pub use composite::{term_handle, CompositeEnergy, TermHandle, TermId};
pub use position::PositionPenalty;
pub use symmetric_dirichlet::SymmetricDirichlet;

/// Immutable Hessian layout: parallel (row, col) index arrays.
///
/// Entries address the upper triangle (`row <= col`); the sparse solver
/// mirrors them when materializing the full symmetric matrix. Duplicate
/// pairs are legal and are summed at assembly. The pattern is frozen when a
/// term's `init()` runs; the matching coefficient buffer is the only part
/// that changes per iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparsityPattern {
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl SparsityPattern {
    /// Create an empty pattern.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an upper-triangle entry.
    ///
    /// The pair is stored as given when `row <= col` and swapped otherwise.
    #[inline]
    pub fn push(&mut self, row: usize, col: usize) {
        if row <= col {
            self.rows.push(row);
            self.cols.push(col);
        } else {
            self.rows.push(col);
            self.cols.push(row);
        }
    }

    /// Append every entry of another pattern.
    pub fn extend_from(&mut self, other: &SparsityPattern) {
        self.rows.extend_from_slice(&other.rows);
        self.cols.extend_from_slice(&other.cols);
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the pattern has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row indices.
    #[inline]
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Column indices.
    #[inline]
    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Iterate over (row, col) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }
}

/// A single energy term of the composite objective.
///
/// Implementations are constructed with their shape parameters (mesh,
/// constrained-vertex lists), then driven through the
/// `init / update_x / value / gradient / hessian` cycle by the solver.
/// Outputs are unweighted; [`CompositeEnergy`] applies each term's weight
/// when aggregating.
///
/// Determinism: identical variable vectors and call history must produce
/// bit-identical outputs.
pub trait EnergyTerm: Send {
    /// Identifying name, used in diagnostics.
    fn name(&self) -> &str;

    /// The term's aggregation weight.
    fn weight(&self) -> f64;

    /// Change the aggregation weight.
    ///
    /// This never changes the Hessian layout: a zero-weight term keeps its
    /// pattern entries so the merged symbolic structure is stable across
    /// reweighings.
    fn set_weight(&mut self, weight: f64);

    /// Total number of variables the gradient is sized to.
    fn num_variables(&self) -> usize;

    /// Set the total variable count (embedding block plus any auxiliary
    /// trailing block). Must be called before `init()` when the objective
    /// carries auxiliary unknowns; defaults to the mesh's embedding size.
    fn set_num_variables(&mut self, count: usize);

    /// Freeze the Hessian layout and pre-size output buffers.
    ///
    /// # Errors
    ///
    /// Fails with [`EnergyError::Configuration`] when a required shape
    /// member is unset. Never fails later for the same cause.
    ///
    /// [`EnergyError::Configuration`]: crate::error::EnergyError::Configuration
    fn init(&mut self) -> Result<()>;

    /// Recompute per-element intermediate quantities at `x`.
    ///
    /// Linear in the element count; does not by itself produce the value,
    /// gradient, or Hessian.
    fn update_x(&mut self, x: &DVector<f64>);

    /// The scalar energy at the last `update_x` point.
    ///
    /// With `update` set, the per-element energies and the scalar are
    /// cached for later retrieval; otherwise this is a pure query that
    /// leaves the caches untouched.
    fn value(&mut self, update: bool) -> f64;

    /// Accumulate the gradient into `grad`.
    ///
    /// `grad` must be sized to [`num_variables`](Self::num_variables);
    /// entries the term does not touch are left as-is.
    fn gradient(&self, grad: &mut DVector<f64>);

    /// Refresh the Hessian coefficient buffer, in the exact entry order
    /// frozen by `init()`.
    fn hessian(&mut self);

    /// The frozen Hessian layout.
    fn pattern(&self) -> &SparsityPattern;

    /// The Hessian coefficients, parallel to [`pattern`](Self::pattern).
    fn coefficients(&self) -> &[f64];

    /// The scalar cached by the last `value(true)` call.
    fn cached_value(&self) -> f64;

    /// Per-element energies cached by the last `value(true)` call.
    fn element_energies(&self) -> &[f64];
}
