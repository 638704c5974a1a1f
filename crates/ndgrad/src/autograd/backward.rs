//! Backward pass driver.
//!
//! A pass collects every open node reachable from the root through
//! predecessor edges, orders them with `petgraph::algo::toposort` (consumers
//! before operands), seeds the root gradient and invokes each recorded
//! backward function in that order.
//!
//! Passes that do not keep the graph run with recording disabled, release
//! the backward functions of every interior node they visit and close all
//! temporaries they created. Passes that keep the graph record gradient
//! arithmetic as ordinary nodes, which is what makes second-order
//! derivatives possible.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, debug_span, trace_span};

use super::node::{NodeId, ValueId};
use super::registry::Registry;
use super::scope::NoGradGuard;
use super::value::AutogradValue;
use crate::error::{AutogradError, Result};
use crate::payload::Payload;

/// Options for a backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardConfig {
    /// Keep the graph (and record gradient arithmetic) so that it can be
    /// traversed again.
    pub keep_graph: bool,
    /// Reserved; currently has no effect.
    pub zero_grad: bool,
}

impl BackwardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration that keeps the graph.
    pub fn retained() -> Self {
        Self::new().with_keep_graph(true)
    }

    pub fn with_keep_graph(mut self, keep_graph: bool) -> Self {
        self.keep_graph = keep_graph;
        self
    }

    pub fn with_zero_grad(mut self, zero_grad: bool) -> Self {
        self.zero_grad = zero_grad;
        self
    }
}

impl<P: Payload> AutogradValue<P> {
    /// Backpropagate from this value with a gradient of ones.
    pub fn backward(&self) -> Result<()> {
        self.backward_with(BackwardConfig::default())
    }

    pub fn backward_with(&self, config: BackwardConfig) -> Result<()> {
        self.run_backward(None, config)
    }

    /// Backpropagate `seed` as the gradient of this value.
    pub fn backward_seed(&self, seed: P) -> Result<()> {
        self.backward_seed_with(seed, BackwardConfig::default())
    }

    pub fn backward_seed_with(&self, seed: P, config: BackwardConfig) -> Result<()> {
        self.run_backward(Some(seed), config)
    }

    fn run_backward(&self, seed: Option<P>, config: BackwardConfig) -> Result<()> {
        if self.is_closed() {
            return Err(AutogradError::IllegalState(format!(
                "cannot backpropagate from closed value {}",
                self.id.0
            )));
        }
        if !self.requires_grad() {
            return Err(AutogradError::IllegalState(
                "cannot backpropagate through a node that does not require grad".to_string(),
            ));
        }
        let config = BackwardConfig {
            keep_graph: config.keep_graph || self.create_graph(),
            ..config
        };
        let root = self.node_id()?;
        let order = self.registry.topo_order(root)?;
        let span = debug_span!(
            "backward",
            registry = self.registry.name(),
            root = %root,
            nodes = order.len(),
            keep_graph = config.keep_graph
        );
        let _enter = span.enter();
        self.registry.check_traversable(&order)?;

        self.registry.push_frame();
        let result = {
            let _no_grad = (!config.keep_graph).then(NoGradGuard::new);
            self.propagate(root, &order, seed, &config)
        };
        let frame = self.registry.pop_frame();
        self.registry.finish_pass(root, &order, frame, &config);
        debug!(ok = result.is_ok(), "backward pass finished");
        result
    }

    fn propagate(
        &self,
        root: NodeId,
        order: &[NodeId],
        seed: Option<P>,
        config: &BackwardConfig,
    ) -> Result<()> {
        let size = self.size()?;
        let seed = match seed {
            Some(seed) => {
                if seed.numel() != size.numel() {
                    return Err(AutogradError::ShapeMismatch {
                        expected: size.numel(),
                        actual: seed.numel(),
                    });
                }
                self.registry.leaf(seed)
            }
            None => self.registry.leaf_sized(P::ones(&size), size),
        };
        self.registry.add_to_grad(root, &seed, config.keep_graph)?;

        for &node in order {
            let (backward, op, grad) = {
                let arena = self.registry.lock();
                let value = &arena.values[node.0];
                (value.backward.clone(), value.op, arena.grad_of(node))
            };
            let (Some(backward), Some(grad)) = (backward, grad) else {
                continue;
            };
            let _span = trace_span!("op", op, node = %node).entered();
            backward(&self.registry.handle(grad), config)?;
        }
        Ok(())
    }
}

impl<P: Payload> Registry<P> {
    /// Open nodes reachable from `root`, consumers before operands.
    pub(crate) fn topo_order(&self, root: NodeId) -> Result<Vec<NodeId>> {
        let arena = self.lock();
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        index.insert(root, graph.add_node(root));
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let from = index[&node];
            for &prev in &arena.values[node.0].prev {
                if arena.values[prev.0].closed {
                    continue;
                }
                let to = *index.entry(prev).or_insert_with(|| {
                    stack.push(prev);
                    graph.add_node(prev)
                });
                graph.add_edge(from, to, ());
            }
        }
        let sorted = toposort(&graph, None).map_err(|cycle| AutogradError::CyclicGraph {
            node: graph[cycle.node_id()].0,
        })?;
        Ok(sorted.into_iter().map(|i| graph[i]).collect())
    }

    fn check_traversable(&self, order: &[NodeId]) -> Result<()> {
        let arena = self.lock();
        for &node in order {
            let value = &arena.values[node.0];
            if value.released {
                return Err(AutogradError::GraphReleased { node: node.0 });
            }
            if value.version > 0 && value.backward.is_some() {
                return Err(AutogradError::IllegalState(format!(
                    "{node} (`{}`) was modified in place after it was recorded",
                    value.op
                )));
            }
        }
        Ok(())
    }

    /// Tear down what a pass left behind.
    ///
    /// Interior gradients never survive a pass. Without a kept graph they are
    /// closed together with every other temporary and the visited backward
    /// functions are released; with a kept graph they stay open (later
    /// passes may differentiate through them) and are linked to the root.
    fn finish_pass(&self, root: NodeId, order: &[NodeId], frame: Vec<ValueId>, config: &BackwardConfig) {
        let mut arena = self.lock();
        let mut detached = Vec::new();
        for &node in order {
            if arena.values[node.0].is_leaf() {
                continue;
            }
            if !config.keep_graph && arena.values[node.0].backward.take().is_some() {
                arena.values[node.0].released = true;
            }
            detached.extend(arena.grads[node.0].value.take());
        }
        let referenced = arena.grad_referenced();
        let leftovers: Vec<ValueId> = frame
            .into_iter()
            .filter(|id| !referenced.contains(id))
            .chain(detached)
            .collect();

        if config.keep_graph {
            let owner = arena.values[root.0].owner;
            let open: Vec<ValueId> = leftovers
                .into_iter()
                .filter(|&id| id != owner && arena.is_open(id))
                .collect();
            if let Ok(slot) = arena.slot_mut(owner) {
                slot.links.extend(open);
            }
        } else {
            let closed: usize = leftovers.into_iter().map(|id| arena.close(id)).sum();
            debug!(closed, released = order.len(), "released graph");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DenseTensor;

    #[test]
    fn test_config_defaults() {
        let config = BackwardConfig::default();
        assert!(!config.keep_graph);
        assert!(!config.zero_grad);
        assert!(BackwardConfig::retained().keep_graph);
        assert!(BackwardConfig::new().with_zero_grad(true).zero_grad);
    }

    #[test]
    fn test_requires_grad_enforced() {
        let r = Registry::<f64>::new("backward-requires");
        let x = r.value(1.0).unwrap();
        let err = x.backward().unwrap_err();
        assert!(err.to_string().contains("does not require grad"));
        r.close_all();
    }

    #[test]
    fn test_topological_order_visits_each_node_once() {
        let r = Registry::<f64>::new("backward-topo");
        let x = r.variable(2.0).unwrap();
        let a = x.mul(&x).unwrap();
        let b = a.add(&x).unwrap();
        let c = b.mul(&a).unwrap();
        let order = r.topo_order(c.node_id().unwrap()).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], c.node_id().unwrap());
        assert_eq!(order[3], x.node_id().unwrap());
        let pos = |v: &AutogradValue<f64>| {
            let n = v.node_id().unwrap();
            order.iter().position(|&o| o == n).unwrap()
        };
        assert!(pos(&b) < pos(&a));

        // c = (x^2 + x) * x^2 = x^4 + x^3, dc/dx = 4x^3 + 3x^2 = 44
        c.backward().unwrap();
        assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 44.0);
        r.close_all();
    }

    #[test]
    fn test_cycle_is_reported() {
        let r = Registry::<f64>::new("backward-cycle");
        let x = r.variable(1.0).unwrap();
        let y = x.exp().unwrap();
        let (xn, yn) = (x.node_id().unwrap(), y.node_id().unwrap());
        r.lock().values[xn.0].prev.push(yn);
        assert!(matches!(
            y.backward(),
            Err(AutogradError::CyclicGraph { .. })
        ));
        r.lock().values[xn.0].prev.clear();
        r.close_all();
    }

    #[test]
    fn test_released_graph_cannot_be_reused() {
        let r = Registry::<f64>::new("backward-released");
        let x = r.variable(3.0).unwrap();
        let y = x.mul(&x).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 6.0);
        assert!(matches!(
            y.backward(),
            Err(AutogradError::GraphReleased { .. })
        ));
        r.close_all();
    }

    #[test]
    fn test_kept_graph_accumulates_across_passes() {
        let r = Registry::<f64>::new("backward-kept");
        let x = r.variable(3.0).unwrap();
        let y = x.mul(&x).unwrap();
        let grad = {
            y.backward_with(BackwardConfig::retained()).unwrap();
            x.grad().unwrap().unwrap()
        };
        assert_eq!(grad.item().unwrap(), 6.0);
        y.backward_with(BackwardConfig::retained()).unwrap();
        // Same handle, updated through the accumulator swap.
        assert_eq!(grad.item().unwrap(), 12.0);
        r.close_all();
    }

    #[test]
    fn test_explicit_seed() {
        let r = Registry::<DenseTensor<f64>>::new("backward-seed");
        let x = r.variable(DenseTensor::ones(&[2])).unwrap();
        let y = x.scale(3.0).unwrap();
        let seed = DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        y.backward_seed(seed).unwrap();
        assert_eq!(
            x.grad().unwrap().unwrap().to_vec().unwrap(),
            vec![3.0, 6.0]
        );
        let z = x.scale(1.0).unwrap();
        assert!(matches!(
            z.backward_seed(DenseTensor::ones(&[3])),
            Err(AutogradError::ShapeMismatch { .. })
        ));
        r.close_all();
    }

    #[test]
    fn test_non_retained_pass_leaves_only_leaves_and_grads() {
        let r = Registry::<DenseTensor<f64>>::new("backward-cleanup");
        let x = r.variable(DenseTensor::ones(&[2, 2])).unwrap();
        let w = r.variable(DenseTensor::ones(&[2])).unwrap();
        let y = x.mul(&w).unwrap().sigmoid().unwrap().sum().unwrap();
        y.backward().unwrap();
        // x, w, their grads, and the three forward results.
        assert_eq!(r.status().open, 7);
        r.close_all();
        assert!(r.is_all_closed());
    }
}
