//! Weighted composition of energy terms.
//!
//! [`CompositeEnergy`] aggregates child terms under independent weights and
//! owns the merged Hessian layout the sparse solver factorizes against. The
//! merged pattern is the *concatenation* of the children's patterns —
//! including zero-weight children, whose coefficients are written as zeros —
//! plus one diagonal regularization entry per variable. Dropping a
//! zero-weight child's pattern would desynchronize the solver's symbolic
//! factorization the moment its weight becomes nonzero, so the layout never
//! depends on weights.
//!
//! Recomputation is dependency-ordered: providers and terms registered here
//! form a [`DependencyGraph`] and `update_x` sweeps it from the leaves up,
//! so a term reading a shared producer never sees a stale cache.

use std::sync::{Arc, Mutex};

use nalgebra::DVector;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{EnergyError, Result};
use crate::graph::{DependencyGraph, NodeId, UpdatableNode};

use super::{EnergyTerm, SparsityPattern};

/// Shared handle to an energy term.
///
/// The mutex is the per-object lock serializing solver access against
/// external reweighing; parallel aggregation locks one child at a time and
/// each child owns disjoint output buffers.
pub type TermHandle = Arc<Mutex<dyn EnergyTerm>>;

/// Wrap a concrete term into a shareable handle.
pub fn term_handle(term: impl EnergyTerm + 'static) -> TermHandle {
    Arc::new(Mutex::new(term))
}

/// Index of a term within a composite, in insertion order.
///
/// Removing a term invalidates the ids of terms added after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermId(usize);

/// Adapter registering a term as a graph node.
struct TermNode {
    name: String,
    handle: TermHandle,
}

impl UpdatableNode for TermNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&self, x: &DVector<f64>) {
        self.handle.lock().expect("term lock poisoned").update_x(x);
    }
}

struct TermEntry {
    handle: TermHandle,
    provider_deps: Vec<NodeId>,
}

struct ProviderEntry {
    node: Arc<dyn UpdatableNode>,
    deps: Vec<NodeId>,
}

/// The composite objective minimized by the solvers.
pub struct CompositeEnergy {
    num_variables: usize,
    diagonal_shift: f64,
    providers: Vec<ProviderEntry>,
    terms: Vec<TermEntry>,
    graph: DependencyGraph,
    graph_stale: bool,
    structure_stale: bool,
    initialized: bool,

    pattern: SparsityPattern,
    coefficients: Vec<f64>,
    /// Start of each term's slice within `coefficients`.
    offsets: Vec<usize>,
    /// Start of the diagonal-shift tail within `coefficients`.
    shift_offset: usize,

    scratch: DVector<f64>,
    cached_value: f64,
}

impl CompositeEnergy {
    /// Create an empty composite over `num_variables` unknowns.
    ///
    /// `num_variables` covers the embedding blocks plus any auxiliary
    /// trailing block; every child's gradient is sized to it.
    pub fn new(num_variables: usize) -> Self {
        Self {
            num_variables,
            diagonal_shift: 1e-8,
            providers: Vec::new(),
            terms: Vec::new(),
            graph: DependencyGraph::new(),
            graph_stale: false,
            structure_stale: true,
            initialized: false,
            pattern: SparsityPattern::new(),
            coefficients: Vec::new(),
            offsets: Vec::new(),
            shift_offset: 0,
            scratch: DVector::zeros(num_variables),
            cached_value: 0.0,
        }
    }

    /// Total number of unknowns.
    #[inline]
    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// The current diagonal regularization added to every variable's
    /// Hessian diagonal.
    #[inline]
    pub fn diagonal_shift(&self) -> f64 {
        self.diagonal_shift
    }

    /// Change the diagonal regularization.
    ///
    /// This only rewrites coefficient values in the reserved tail of the
    /// merged buffer; the layout is untouched, so the solver's symbolic
    /// factorization stays valid. Solvers raise the shift to recover from
    /// failed factorizations and restore it afterwards.
    pub fn set_diagonal_shift(&mut self, shift: f64) {
        self.diagonal_shift = shift;
        if self.initialized {
            self.coefficients[self.shift_offset..].fill(shift);
        }
    }

    /// Builder-style diagonal shift.
    pub fn with_diagonal_shift(mut self, shift: f64) -> Self {
        self.set_diagonal_shift(shift);
        self
    }

    /// Register a shared data provider with its producer dependencies.
    ///
    /// Providers must all be registered before the first term so their
    /// handles stay valid when the graph is rebuilt after a term removal.
    pub fn add_provider(
        &mut self,
        node: Arc<dyn UpdatableNode>,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        if !self.terms.is_empty() {
            return Err(EnergyError::config(
                "providers must be registered before the first term",
            ));
        }
        let id = self.graph.insert(Arc::clone(&node), deps)?;
        self.providers.push(ProviderEntry {
            node,
            deps: deps.to_vec(),
        });
        Ok(id)
    }

    /// Add a child term with no provider dependencies.
    pub fn add_term(&mut self, term: TermHandle) -> Result<TermId> {
        self.add_term_with_deps(term, &[])
    }

    /// Add a child term that reads the given providers.
    ///
    /// Structural change: the merged layout is rebuilt on the next
    /// [`init`](Self::init).
    pub fn add_term_with_deps(&mut self, term: TermHandle, deps: &[NodeId]) -> Result<TermId> {
        for dep in deps {
            if dep.index() >= self.providers.len() {
                return Err(EnergyError::config(
                    "term dependencies must be provider handles",
                ));
            }
        }
        let name = term.lock().expect("term lock poisoned").name().to_string();
        self.graph.insert(
            Arc::new(TermNode {
                name,
                handle: Arc::clone(&term),
            }),
            deps,
        )?;
        self.terms.push(TermEntry {
            handle: term,
            provider_deps: deps.to_vec(),
        });
        self.structure_stale = true;
        self.initialized = false;
        Ok(TermId(self.terms.len() - 1))
    }

    /// Remove a child term.
    ///
    /// Structural change; ids of terms added after the removed one shift
    /// down by one.
    pub fn remove_term(&mut self, id: TermId) -> Result<TermHandle> {
        if id.0 >= self.terms.len() {
            return Err(EnergyError::config("unknown term id"));
        }
        let entry = self.terms.remove(id.0);
        self.graph_stale = true;
        self.structure_stale = true;
        self.initialized = false;
        Ok(entry.handle)
    }

    /// Handle to a child term, e.g. for reweighing from another thread.
    pub fn term(&self, id: TermId) -> Option<TermHandle> {
        self.terms.get(id.0).map(|e| Arc::clone(&e.handle))
    }

    /// Number of child terms.
    #[inline]
    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    /// Initialize children and merge the Hessian layout.
    ///
    /// The merge runs exactly once per structural change (term added or
    /// removed); calling `init` again without such a change is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates the first child configuration error.
    pub fn init(&mut self) -> Result<()> {
        if !self.structure_stale {
            return Ok(());
        }
        if self.graph_stale {
            self.rebuild_graph()?;
        }

        for entry in &self.terms {
            let mut term = entry.handle.lock().expect("term lock poisoned");
            term.set_num_variables(self.num_variables);
            term.init()?;
        }
        self.init_hessian();
        self.initialized = true;
        self.structure_stale = false;
        Ok(())
    }

    /// Concatenate children's patterns and reserve the diagonal tail.
    fn init_hessian(&mut self) {
        self.pattern = SparsityPattern::new();
        self.offsets.clear();
        for entry in &self.terms {
            let term = entry.handle.lock().expect("term lock poisoned");
            self.offsets.push(self.pattern.len());
            self.pattern.extend_from(term.pattern());
        }
        self.shift_offset = self.pattern.len();
        for i in 0..self.num_variables {
            self.pattern.push(i, i);
        }
        self.coefficients = vec![0.0; self.pattern.len()];
        self.coefficients[self.shift_offset..].fill(self.diagonal_shift);
        self.scratch = DVector::zeros(self.num_variables);
        debug!(
            terms = self.terms.len(),
            entries = self.pattern.len(),
            "merged hessian layout"
        );
    }

    /// Re-insert every node after a removal, preserving provider ids.
    fn rebuild_graph(&mut self) -> Result<()> {
        let mut graph = DependencyGraph::new();
        for entry in &self.providers {
            graph.insert(Arc::clone(&entry.node), &entry.deps)?;
        }
        for entry in &self.terms {
            let name = entry
                .handle
                .lock()
                .expect("term lock poisoned")
                .name()
                .to_string();
            graph.insert(
                Arc::new(TermNode {
                    name,
                    handle: Arc::clone(&entry.handle),
                }),
                &entry.provider_deps,
            )?;
        }
        self.graph = graph;
        self.graph_stale = false;
        Ok(())
    }

    /// Recompute every provider and term at `x`, leaves first.
    pub fn update_x(&mut self, x: &DVector<f64>) -> Result<()> {
        if self.graph_stale {
            self.rebuild_graph()?;
        }
        self.graph.update(x)
    }

    /// The weighted energy `sum_i w_i * value_i`.
    ///
    /// Zero-weight children contribute nothing and are not evaluated. With
    /// `update` set, children cache their per-element energies.
    pub fn value(&mut self, update: bool) -> f64 {
        let mut total = 0.0;
        for entry in &self.terms {
            let mut term = entry.handle.lock().expect("term lock poisoned");
            let w = term.weight();
            if w != 0.0 {
                total += w * term.value(update);
            }
        }
        if update {
            self.cached_value = total;
        }
        total
    }

    /// The energy cached by the last `value(true)` call.
    #[inline]
    pub fn cached_value(&self) -> f64 {
        self.cached_value
    }

    /// Write the weighted gradient into `grad` (overwriting it).
    pub fn gradient(&mut self, grad: &mut DVector<f64>) {
        grad.fill(0.0);
        for entry in &self.terms {
            let term = entry.handle.lock().expect("term lock poisoned");
            let w = term.weight();
            if w == 0.0 {
                continue;
            }
            self.scratch.fill(0.0);
            term.gradient(&mut self.scratch);
            grad.axpy(w, &self.scratch, 1.0);
        }
    }

    /// Refresh the merged coefficient buffer.
    ///
    /// Children fill their own buffers and the weighted copy into the
    /// merged slices runs per-child in parallel; the diagonal tail keeps
    /// the current shift.
    pub fn hessian(&mut self) {
        let (term_region, _shift_tail) = self.coefficients.split_at_mut(self.shift_offset);

        let mut slices: Vec<&mut [f64]> = Vec::with_capacity(self.terms.len());
        let mut rest = term_region;
        for (i, entry) in self.terms.iter().enumerate() {
            let len = {
                let term = entry.handle.lock().expect("term lock poisoned");
                term.pattern().len()
            };
            debug_assert!(self.offsets[i] + len <= self.shift_offset);
            let (head, tail) = rest.split_at_mut(len);
            slices.push(head);
            rest = tail;
        }

        self.terms
            .par_iter()
            .zip(slices.into_par_iter())
            .for_each(|(entry, out)| {
                let mut term = entry.handle.lock().expect("term lock poisoned");
                let w = term.weight();
                if w == 0.0 {
                    out.fill(0.0);
                    return;
                }
                term.hessian();
                for (o, &c) in out.iter_mut().zip(term.coefficients()) {
                    *o = w * c;
                }
            });
    }

    /// The merged Hessian layout (children concatenated, diagonal tail).
    #[inline]
    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    /// The merged Hessian coefficients, parallel to
    /// [`pattern`](Self::pattern).
    #[inline]
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{PositionPenalty, SymmetricDirichlet};
    use crate::graph::providers::{Coordinates, EdgeVectors, FaceJacobians};
    use crate::mesh::TriMesh;
    use nalgebra::{Point2, Point3};

    fn disk_mesh() -> Arc<TriMesh> {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 0.866, 0.0),
            Point3::new(-0.5, 0.866, 0.0),
            Point3::new(-1.0, 0.0, 0.0),
            Point3::new(-0.5, -0.866, 0.0),
            Point3::new(0.5, -0.866, 0.0),
        ];
        let faces = vec![
            [0, 1, 2],
            [0, 2, 3],
            [0, 3, 4],
            [0, 4, 5],
            [0, 5, 6],
            [0, 6, 1],
        ];
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

    fn distortion_term(mesh: &Arc<TriMesh>, weight: f64) -> TermHandle {
        let mut term = SymmetricDirichlet::new("distortion");
        term.set_mesh(Arc::clone(mesh));
        term.set_weight(weight);
        term_handle(term)
    }

    fn pin_term(mesh: &Arc<TriMesh>, weight: f64) -> TermHandle {
        let mut term = PositionPenalty::new("pins");
        term.set_mesh(Arc::clone(mesh));
        term.set_targets(vec![(0, Point2::new(0.25, 0.25))]);
        term.set_weight(weight);
        term_handle(term)
    }

    #[test]
    fn test_value_is_weighted_sum_of_children() {
        let mesh = disk_mesh();
        let mut composite = CompositeEnergy::new(mesh.num_variables());
        let distortion = distortion_term(&mesh, 2.5);
        let pins = pin_term(&mesh, 0.5);
        composite.add_term(Arc::clone(&distortion)).unwrap();
        composite.add_term(Arc::clone(&pins)).unwrap();
        composite.init().unwrap();

        let mut x = identity_embedding(&mesh);
        x[0] += 0.05;
        composite.update_x(&x).unwrap();
        let total = composite.value(true);

        let expected = 2.5 * distortion.lock().unwrap().value(false)
            + 0.5 * pins.lock().unwrap().value(false);
        assert!((total - expected).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weight_child_contributes_nothing_but_keeps_pattern() {
        let mesh = disk_mesh();
        let mut composite = CompositeEnergy::new(mesh.num_variables());
        let distortion = distortion_term(&mesh, 1.0);
        let pins = pin_term(&mesh, 0.0);
        composite.add_term(Arc::clone(&distortion)).unwrap();
        composite.add_term(Arc::clone(&pins)).unwrap();
        composite.init().unwrap();

        let x = identity_embedding(&mesh);
        composite.update_x(&x).unwrap();

        let total = composite.value(true);
        let alone = distortion.lock().unwrap().value(false);
        assert!((total - alone).abs() < 1e-12);

        // The zero-weight child's diagonal entries are still in the merged
        // layout, with zero coefficients.
        let pin_entries = pins.lock().unwrap().pattern().len();
        assert!(pin_entries > 0);
        composite.hessian();
        let start = composite.offsets[1];
        let slice = &composite.coefficients()[start..start + pin_entries];
        assert!(slice.iter().all(|&c| c == 0.0));

        let pairs: Vec<_> = composite.pattern().iter().collect();
        for pair in pins.lock().unwrap().pattern().iter() {
            assert!(pairs.contains(&pair));
        }
    }

    #[test]
    fn test_merged_pattern_is_stable_across_reweighing() {
        let mesh = disk_mesh();
        let mut composite = CompositeEnergy::new(mesh.num_variables());
        let pins = pin_term(&mesh, 0.0);
        composite.add_term(distortion_term(&mesh, 1.0)).unwrap();
        composite.add_term(Arc::clone(&pins)).unwrap();
        composite.init().unwrap();

        let before = composite.pattern().clone();
        pins.lock().unwrap().set_weight(3.0);
        let x = identity_embedding(&mesh);
        composite.update_x(&x).unwrap();
        composite.value(true);
        composite.hessian();
        composite.init().unwrap(); // no structural change: must not re-merge
        assert_eq!(&before, composite.pattern());
    }

    #[test]
    fn test_diagonal_shift_tail() {
        let mesh = disk_mesh();
        let n = mesh.num_variables();
        let mut composite = CompositeEnergy::new(n).with_diagonal_shift(1e-3);
        composite.add_term(distortion_term(&mesh, 1.0)).unwrap();
        composite.init().unwrap();

        let tail_pairs: Vec<_> = composite
            .pattern()
            .iter()
            .skip(composite.shift_offset)
            .collect();
        let expected: Vec<_> = (0..n).map(|i| (i, i)).collect();
        assert_eq!(tail_pairs, expected);

        let x = identity_embedding(&mesh);
        composite.update_x(&x).unwrap();
        composite.hessian();
        assert!(composite.coefficients()[composite.shift_offset..]
            .iter()
            .all(|&c| c == 1e-3));

        composite.set_diagonal_shift(2e-3);
        assert!(composite.coefficients()[composite.shift_offset..]
            .iter()
            .all(|&c| c == 2e-3));
    }

    #[test]
    fn test_structural_change_remerges() {
        let mesh = disk_mesh();
        let mut composite = CompositeEnergy::new(mesh.num_variables());
        composite.add_term(distortion_term(&mesh, 1.0)).unwrap();
        composite.init().unwrap();
        let small = composite.pattern().len();

        let id = composite.add_term(pin_term(&mesh, 1.0)).unwrap();
        composite.init().unwrap();
        assert!(composite.pattern().len() > small);

        composite.remove_term(id).unwrap();
        composite.init().unwrap();
        assert_eq!(composite.pattern().len(), small);
    }

    #[test]
    fn test_provider_backed_term_matches_standalone() {
        let mesh = disk_mesh();

        // Provider-backed composite.
        let mut composite = CompositeEnergy::new(mesh.num_variables());
        let coords = Coordinates::new(Arc::clone(&mesh));
        let edges = EdgeVectors::new(Arc::clone(&mesh), Arc::clone(&coords));
        let jacobians = FaceJacobians::new(Arc::clone(&mesh), Arc::clone(&edges));
        let c = composite.add_provider(coords, &[]).unwrap();
        let e = composite.add_provider(edges, &[c]).unwrap();
        let j = composite
            .add_provider(Arc::clone(&jacobians) as Arc<dyn UpdatableNode>, &[e])
            .unwrap();

        let mut term = SymmetricDirichlet::new("distortion");
        term.set_mesh(Arc::clone(&mesh));
        term.set_jacobians(jacobians);
        composite
            .add_term_with_deps(term_handle(term), &[j])
            .unwrap();
        composite.init().unwrap();

        // Standalone term computing its own Jacobians.
        let standalone = distortion_term(&mesh, 1.0);
        standalone.lock().unwrap().init().unwrap();

        let mut x = identity_embedding(&mesh);
        x[3] += 0.07;
        x[10] -= 0.02;
        composite.update_x(&x).unwrap();
        let via_graph = composite.value(true);

        let mut term = standalone.lock().unwrap();
        term.update_x(&x);
        let direct = term.value(false);

        assert!((via_graph - direct).abs() < 1e-12);
    }
}
