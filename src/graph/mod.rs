//! Dependency-ordered incremental recomputation.
//!
//! Data providers and energy terms form a directed acyclic graph: a node
//! declares the shared producers it reads from, and the graph orders
//! recomputation so a consumer never sees stale producer state. Nodes are
//! bucketed into *layers* by height (leaves at height 0, every other node
//! one above its tallest dependency); within a layer no two nodes depend on
//! each other, so a layer can be processed in any order or in parallel.
//!
//! Layers are rebuilt only when the dependency structure changes, not on
//! every variable update.

use std::sync::Arc;

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{EnergyError, Result};

pub mod providers;

/// A recomputation node driven by the variable vector.
///
/// `update` refreshes the node's cached quantities from `x`; the graph
/// guarantees that all of the node's dependencies were updated first. Nodes
/// are shared (`Arc`) because several consumers may read one producer, so
/// caches use interior mutability.
pub trait UpdatableNode: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Recompute cached quantities from the variable vector.
    fn update(&self, x: &DVector<f64>);
}

/// Handle to a node stored in a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// The position of the node in insertion order.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Dependency graph over shared [`UpdatableNode`]s.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: Vec<Arc<dyn UpdatableNode>>,
    dependencies: Vec<Vec<NodeId>>,
    layers: Vec<Vec<usize>>,
    layers_stale: bool,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node with its direct dependencies.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a dependency handle does not refer
    /// to a node already in this graph.
    pub fn insert(&mut self, node: Arc<dyn UpdatableNode>, deps: &[NodeId]) -> Result<NodeId> {
        for dep in deps {
            if dep.0 >= self.nodes.len() {
                return Err(EnergyError::config(format!(
                    "dependency {} of node '{}' is not in the graph",
                    dep.0,
                    node.name()
                )));
            }
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.dependencies.push(deps.to_vec());
        self.layers_stale = true;
        Ok(id)
    }

    /// Add a dependency edge between existing nodes.
    ///
    /// # Errors
    ///
    /// Fails if either handle is unknown; a cycle created here is reported
    /// by the next [`rebuild_layers`](Self::rebuild_layers).
    pub fn add_dependency(&mut self, node: NodeId, dep: NodeId) -> Result<()> {
        if node.0 >= self.nodes.len() || dep.0 >= self.nodes.len() {
            return Err(EnergyError::config("unknown node handle"));
        }
        if !self.dependencies[node.0].contains(&dep) {
            self.dependencies[node.0].push(dep);
            self.layers_stale = true;
        }
        Ok(())
    }

    /// Recompute the height layering.
    ///
    /// Height is `1 + max(height of dependencies)`, leaves at height 0.
    ///
    /// # Errors
    ///
    /// Returns [`EnergyError::DependencyCycle`] if the edges no longer form
    /// a DAG.
    pub fn rebuild_layers(&mut self) -> Result<()> {
        const UNVISITED: u8 = 0;
        const ON_STACK: u8 = 1;
        const DONE: u8 = 2;

        let n = self.nodes.len();
        let mut mark = vec![UNVISITED; n];
        let mut height = vec![0usize; n];

        // Iterative DFS; a back edge to an on-stack node is a cycle.
        for root in 0..n {
            if mark[root] == DONE {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            mark[root] = ON_STACK;
            while let Some(&(node, next_dep)) = stack.last() {
                if next_dep < self.dependencies[node].len() {
                    stack.last_mut().expect("stack is non-empty").1 += 1;
                    let dep = self.dependencies[node][next_dep].0;
                    match mark[dep] {
                        ON_STACK => return Err(EnergyError::DependencyCycle { node: dep }),
                        UNVISITED => {
                            mark[dep] = ON_STACK;
                            stack.push((dep, 0));
                        }
                        _ => {}
                    }
                } else {
                    height[node] = self.dependencies[node]
                        .iter()
                        .map(|d| height[d.0] + 1)
                        .max()
                        .unwrap_or(0);
                    mark[node] = DONE;
                    stack.pop();
                }
            }
        }

        let max_height = height.iter().copied().max().unwrap_or(0);
        let mut layers = vec![Vec::new(); if n == 0 { 0 } else { max_height + 1 }];
        for (node, &h) in height.iter().enumerate() {
            layers[h].push(node);
        }
        self.layers = layers;
        self.layers_stale = false;
        Ok(())
    }

    /// The current layers as node handles, lowest height first.
    ///
    /// Rebuilds the layering first if the structure changed.
    pub fn layers(&mut self) -> Result<Vec<Vec<NodeId>>> {
        if self.layers_stale {
            self.rebuild_layers()?;
        }
        Ok(self
            .layers
            .iter()
            .map(|layer| layer.iter().map(|&i| NodeId(i)).collect())
            .collect())
    }

    /// Update every node, layer by layer from leaves upward.
    ///
    /// Nodes within one layer are independent by construction and are
    /// updated in parallel.
    pub fn update(&mut self, x: &DVector<f64>) -> Result<()> {
        if self.layers_stale {
            self.rebuild_layers()?;
        }
        for layer in &self.layers {
            layer.par_iter().for_each(|&i| self.nodes[i].update(x));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Node that records the global tick at which it last updated.
    struct Probe {
        name: &'static str,
        clock: Arc<AtomicUsize>,
        seen: AtomicUsize,
    }

    impl Probe {
        fn new(name: &'static str, clock: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name,
                clock: Arc::clone(clock),
                seen: AtomicUsize::new(0),
            })
        }
    }

    impl UpdatableNode for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn update(&self, _x: &DVector<f64>) {
            let tick = self.clock.fetch_add(1, Ordering::SeqCst);
            self.seen.store(tick, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_chain_layering() {
        // A -> B -> C: heights 0, 1, 2.
        let clock = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let a = graph.insert(Probe::new("a", &clock), &[]).unwrap();
        let b = graph.insert(Probe::new("b", &clock), &[a]).unwrap();
        let c = graph.insert(Probe::new("c", &clock), &[b]).unwrap();

        let layers = graph.layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec![a]);
        assert_eq!(layers[1], vec![b]);
        assert_eq!(layers[2], vec![c]);
    }

    #[test]
    fn test_shared_producer() {
        // Diamond: d depends on b and c, both depend on a.
        let clock = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let a = graph.insert(Probe::new("a", &clock), &[]).unwrap();
        let b = graph.insert(Probe::new("b", &clock), &[a]).unwrap();
        let c = graph.insert(Probe::new("c", &clock), &[a]).unwrap();
        let d = graph.insert(Probe::new("d", &clock), &[b, c]).unwrap();

        let layers = graph.layers().unwrap();
        assert_eq!(layers[0], vec![a]);
        assert_eq!(layers[1], vec![b, c]);
        assert_eq!(layers[2], vec![d]);
    }

    #[test]
    fn test_no_two_dependent_nodes_share_a_layer() {
        let clock = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let a = graph.insert(Probe::new("a", &clock), &[]).unwrap();
        let b = graph.insert(Probe::new("b", &clock), &[]).unwrap();
        let c = graph.insert(Probe::new("c", &clock), &[a, b]).unwrap();
        let d = graph.insert(Probe::new("d", &clock), &[c]).unwrap();

        let layers = graph.layers().unwrap();
        for layer in &layers {
            for &u in layer {
                for &v in layer {
                    assert!(
                        !graph.dependencies[u.index()].contains(&v),
                        "{:?} depends on {:?} within one layer",
                        u,
                        v
                    );
                }
            }
        }
        assert_eq!(layers[0], vec![a, b]);
        assert_eq!(layers[1], vec![c]);
        assert_eq!(layers[2], vec![d]);
    }

    #[test]
    fn test_update_order_respects_layers() {
        let clock = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let a = Probe::new("a", &clock);
        let b = Probe::new("b", &clock);
        let c = Probe::new("c", &clock);
        let ia = graph.insert(a.clone(), &[]).unwrap();
        let ib = graph.insert(b.clone(), &[ia]).unwrap();
        graph.insert(c.clone(), &[ib]).unwrap();

        let x = DVector::zeros(1);
        graph.update(&x).unwrap();

        let ta = a.seen.load(Ordering::SeqCst);
        let tb = b.seen.load(Ordering::SeqCst);
        let tc = c.seen.load(Ordering::SeqCst);
        assert!(ta < tb && tb < tc);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let clock = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let a = graph.insert(Probe::new("a", &clock), &[]).unwrap();
        let b = graph.insert(Probe::new("b", &clock), &[a]).unwrap();
        graph.add_dependency(a, b).unwrap();

        assert!(matches!(
            graph.rebuild_layers(),
            Err(EnergyError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let clock = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let bogus = NodeId(5);
        let result = graph.insert(Probe::new("a", &clock), &[bogus]);
        assert!(matches!(result, Err(EnergyError::Configuration(_))));
    }
}
