//! Direct sparse solver for the Newton system.
//!
//! Wraps `sprs-ldl`'s LDL^T factorization behind the
//! `set_pattern / analyze_pattern / factorize / solve` cycle the Newton
//! iteration needs. The symbolic side — the merged CSR structure, the
//! triplet-to-slot scatter map, and the factorization's elimination
//! structure — is built once per sparsity pattern; every iteration only
//! refreshes numeric values and calls the in-place refactorization.
//!
//! The pattern is given as upper-triangular (row, col, value) triplets.
//! Assembly mirrors off-diagonal entries into the full symmetric matrix and
//! sums duplicates, so several energy terms may contribute to the same
//! entry without coordination.

use nalgebra::DVector;
use sprs::{CsMat, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};

use crate::error::{EnergyError, Result};

/// Scatter target of one triplet: its slot in the CSR data array plus the
/// mirrored slot for off-diagonal entries.
#[derive(Debug, Clone, Copy)]
struct Slots {
    upper: usize,
    mirror: Option<usize>,
}

/// Sparse LDL^T solver with an invariant symbolic structure.
///
/// # Example
///
/// ```
/// use flatiron::solver::linear::SparseSolver;
///
/// // 2x2 SPD system given as upper-triangular triplets.
/// let mut solver = SparseSolver::new();
/// solver.set_pattern(&[0, 0, 1], &[0, 1, 1], 2).unwrap();
/// solver.analyze_pattern().unwrap();
/// solver.factorize(&[4.0, 1.0, 3.0]).unwrap();
/// let x = solver.solve(&[1.0, 2.0]).unwrap();
/// assert!((x[0] - 1.0 / 11.0).abs() < 1e-12);
/// assert!((x[1] - 7.0 / 11.0).abs() < 1e-12);
/// ```
#[derive(Default)]
pub struct SparseSolver {
    dim: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    scatter: Vec<Slots>,
    matrix: Option<CsMat<f64>>,
    numeric: Option<LdlNumeric<f64, usize>>,
}

impl SparseSolver {
    /// Create a solver with no pattern.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the symbolic structure.
    ///
    /// `rows` and `cols` are parallel upper-triangular index arrays
    /// (`row <= col`); duplicates are legal. Re-setting the pattern drops
    /// any existing factorization.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error on length mismatch, out-of-range
    /// indices, or a lower-triangle entry.
    pub fn set_pattern(&mut self, rows: &[usize], cols: &[usize], dim: usize) -> Result<()> {
        if rows.len() != cols.len() {
            return Err(EnergyError::config("row/col index arrays differ in length"));
        }
        for (&r, &c) in rows.iter().zip(cols.iter()) {
            if r >= dim || c >= dim {
                return Err(EnergyError::config(format!(
                    "pattern entry ({}, {}) outside a {}-dim system",
                    r, c, dim
                )));
            }
            if r > c {
                return Err(EnergyError::config(format!(
                    "pattern entry ({}, {}) is below the diagonal",
                    r, c
                )));
            }
        }
        self.dim = dim;
        self.rows = rows.to_vec();
        self.cols = cols.to_vec();
        self.scatter.clear();
        self.matrix = None;
        self.numeric = None;
        Ok(())
    }

    /// Build the CSR structure and scatter map for the current pattern.
    ///
    /// Runs once per pattern; `factorize` reuses the result across every
    /// iteration.
    pub fn analyze_pattern(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Err(EnergyError::config("analyze_pattern before set_pattern"));
        }

        let mut entries: Vec<(usize, usize)> = Vec::with_capacity(2 * self.rows.len());
        for (&r, &c) in self.rows.iter().zip(self.cols.iter()) {
            entries.push((r, c));
            if r != c {
                entries.push((c, r));
            }
        }
        entries.sort_unstable();
        entries.dedup();

        let mut indptr = vec![0usize; self.dim + 1];
        for &(r, _) in &entries {
            indptr[r + 1] += 1;
        }
        for r in 0..self.dim {
            indptr[r + 1] += indptr[r];
        }
        let indices: Vec<usize> = entries.iter().map(|&(_, c)| c).collect();

        self.scatter = self
            .rows
            .iter()
            .zip(self.cols.iter())
            .map(|(&r, &c)| {
                let upper = entries
                    .binary_search(&(r, c))
                    .expect("triplet present in merged structure");
                let mirror = (r != c).then(|| {
                    entries
                        .binary_search(&(c, r))
                        .expect("mirror present in merged structure")
                });
                Slots { upper, mirror }
            })
            .collect();

        let data = vec![0.0; entries.len()];
        self.matrix = Some(CsMat::new((self.dim, self.dim), indptr, indices, data));
        self.numeric = None;
        Ok(())
    }

    /// Refresh numeric values and refactorize.
    ///
    /// `values` is parallel to the pattern arrays; duplicates and mirrored
    /// entries are summed into the fixed CSR slots. The first call performs
    /// the symbolic elimination; later calls refactorize in place.
    ///
    /// # Errors
    ///
    /// Returns [`EnergyError::Factorization`] when the matrix is singular
    /// or not positive definite (a non-positive pivot). The solver stays
    /// usable: callers typically raise the diagonal shift and retry.
    pub fn factorize(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(EnergyError::config(format!(
                "{} coefficient values for {} pattern entries",
                values.len(),
                self.rows.len()
            )));
        }
        let matrix = self
            .matrix
            .as_mut()
            .ok_or_else(|| EnergyError::config("factorize before analyze_pattern"))?;

        let data = matrix.data_mut();
        data.fill(0.0);
        for (slots, &v) in self.scatter.iter().zip(values.iter()) {
            data[slots.upper] += v;
            if let Some(mirror) = slots.mirror {
                data[mirror] += v;
            }
        }

        match self.numeric.as_mut() {
            Some(numeric) => {
                if let Err(e) = numeric.update(matrix.view()) {
                    self.numeric = None;
                    return Err(e.into());
                }
            }
            None => {
                let numeric = Ldl::new()
                    .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
                    .check_symmetry(SymmetryCheck::DontCheckSymmetry)
                    .numeric(matrix.view())?;
                self.numeric = Some(numeric);
            }
        }

        // LDL^T tolerates indefinite pivots, but the Newton direction needs
        // a positive definite system; report a non-positive pivot as a
        // recoverable factorization failure.
        let numeric = self.numeric.as_ref().expect("numeric factorization set");
        for (i, &di) in numeric.d().iter().enumerate() {
            if di <= 0.0 || !di.is_finite() {
                self.numeric = None;
                return Err(EnergyError::Factorization(format!(
                    "non-positive pivot {} at index {}",
                    di, i
                )));
            }
        }
        Ok(())
    }

    /// Solve the factorized system for `rhs`.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error when no factorization is current.
    pub fn solve(&self, rhs: &[f64]) -> Result<DVector<f64>> {
        let numeric = self
            .numeric
            .as_ref()
            .ok_or_else(|| EnergyError::config("solve before factorize"))?;
        if rhs.len() != self.dim {
            return Err(EnergyError::config(format!(
                "rhs length {} for a {}-dim system",
                rhs.len(),
                self.dim
            )));
        }
        Ok(DVector::from_vec(numeric.solve(rhs)))
    }

    /// System dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Whether a numeric factorization is current.
    #[inline]
    pub fn is_factorized(&self) -> bool {
        self.numeric.is_some()
    }
}

impl std::fmt::Debug for SparseSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseSolver")
            .field("dim", &self.dim)
            .field("entries", &self.rows.len())
            .field("factorized", &self.numeric.is_some())
            .finish()
    }
}
