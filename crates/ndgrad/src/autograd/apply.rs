//! Operator application and gradient accumulation.
//!
//! [`AutogradValue::apply_unary`] and [`AutogradValue::apply_binary`] are
//! the only places where forward nodes are created. Both compute the
//! forward payload eagerly and, when recording is enabled and an operand
//! requires grad, attach a backward function to the new node.
//!
//! A backward function captures operand *node ids* and payload snapshots,
//! never value handles: after a [`swap_with`](AutogradValue::swap_with) the
//! node's current owner is looked up again, and when the graph is not kept
//! the operand is replayed as a fresh leaf from its snapshot. The node's
//! version is captured too, so an operand updated in place after recording
//! is replayed from its snapshot in both modes.

use std::sync::Arc;

use smallvec::smallvec;
use tracing::trace;

use super::backward::BackwardConfig;
use super::cell::{DataCell, Saved};
use super::node::{BackwardFn, NodeId};
use super::registry::{Registry, SlotInit};
use super::scope::is_grad_enabled;
use super::value::AutogradValue;
use crate::error::{AutogradError, Result};
use crate::payload::Payload;
use crate::size::Size;

impl<P: Payload> Registry<P> {
    /// Untracked leaf holding `payload`.
    pub(crate) fn leaf(&self, payload: P) -> AutogradValue<P> {
        let size = payload.size();
        self.leaf_sized(payload, size)
    }

    pub(crate) fn leaf_sized(&self, payload: P, size: Size) -> AutogradValue<P> {
        let id = self.insert_leaf(SlotInit::plain(Arc::new(payload), size));
        self.handle(id)
    }

    /// Whether the current owner of `node` collects gradients.
    pub(crate) fn wants_grad(&self, node: NodeId) -> bool {
        let arena = self.lock();
        let owner = arena.values[node.0].owner;
        arena
            .slot(owner)
            .is_ok_and(|s| s.requires_grad && !s.closed)
    }

    /// In-place updates applied to `node` so far.
    pub(crate) fn version(&self, node: NodeId) -> u64 {
        self.lock().values[node.0].version
    }

    /// Operand of a backward function: the live value when the graph is
    /// kept and the operand still holds the recorded payload, otherwise a
    /// leaf rebuilt from the snapshot.
    pub(crate) fn resolve(
        &self,
        node: NodeId,
        saved: &Saved<P>,
        version: u64,
        keep_graph: bool,
    ) -> AutogradValue<P> {
        if keep_graph {
            let arena = self.lock();
            let value = &arena.values[node.0];
            let owner = value.owner;
            if arena.is_open(owner) && value.version == version {
                drop(arena);
                return self.handle(owner);
            }
        }
        let id = self.insert_leaf(SlotInit::plain(
            Arc::clone(saved.data()),
            saved.size().clone(),
        ));
        self.handle(id)
    }

    /// Add `grad` to the gradient accumulated on `node`.
    ///
    /// The first contribution starts from zeros so the accumulator is never
    /// an alias of `grad`. Later contributions build `old + grad` and swap it
    /// into the existing accumulator slot, so handles returned by earlier
    /// `grad()` calls observe the update.
    pub(crate) fn add_to_grad(
        &self,
        node: NodeId,
        grad: &AutogradValue<P>,
        keep_graph: bool,
    ) -> Result<()> {
        let (lock, size) = {
            let arena = self.lock();
            let owner = arena.values[node.0].owner;
            let Ok(slot) = arena.slot(owner) else {
                return Ok(());
            };
            if !slot.requires_grad || slot.closed {
                return Ok(());
            }
            (Arc::clone(&arena.grads[node.0].lock), slot.size.clone())
        };
        let _guard = lock.lock();

        let grad_size = grad.size()?;
        let grad = if grad_size == size {
            grad.clone()
        } else if non_unit_dims(&grad_size) == non_unit_dims(&size) {
            grad.reshape(size.clone())?
        } else {
            return Err(AutogradError::InvalidGradient(format!(
                "gradient of shape {grad_size} delivered to {node} of shape {size}"
            )));
        };

        let existing = self.lock().grad_of(node);
        match existing {
            None => {
                let zeros = self.leaf_sized(P::zeros(&size), size);
                let acc = zeros.add(&grad)?;
                self.lock().grads[node.0].value = Some(acc.id);
            }
            Some(old) => {
                let old = self.handle(old);
                let updated = old.add(&grad)?;
                old.swap_with(&updated)?;
                // `updated` now holds the superseded accumulator. Without a
                // kept graph it may still be on the walk; the pass closes it.
                if keep_graph {
                    self.lock().slot_mut(old.id)?.links.push(updated.id);
                }
            }
        }
        Ok(())
    }
}

/// Dimensions other than size-1 axes.
fn non_unit_dims(size: &Size) -> Vec<usize> {
    size.dims().iter().copied().filter(|&d| d != 1).collect()
}

fn ensure_operand<P: Payload>(value: &AutogradValue<P>) -> Result<()> {
    let arena = value.registry.lock();
    match arena.slot(value.id) {
        Ok(slot) if !slot.closed && !slot.closing => Ok(()),
        _ => Err(AutogradError::InvalidConstruction(format!(
            "operand {} is closed",
            value.id.0
        ))),
    }
}

/// Result shape: keep an operand's (possibly annotated) size when the
/// payload shape agrees with it.
fn result_size(out: &Size, candidates: &[&Size]) -> Size {
    candidates
        .iter()
        .find(|s| **s == out)
        .map_or_else(|| out.clone(), |s| (*s).clone())
}

impl<P: Payload> AutogradValue<P> {
    /// Apply a unary operator.
    ///
    /// `rule(g, x)` receives the upstream gradient and the operand and
    /// returns the operand's gradient.
    pub fn apply_unary<F, R>(&self, op: &'static str, forward: F, rule: R) -> Result<AutogradValue<P>>
    where
        F: FnOnce(&P) -> Result<P>,
        R: Fn(&AutogradValue<P>, &AutogradValue<P>) -> Result<AutogradValue<P>>
            + Send
            + Sync
            + 'static,
    {
        ensure_operand(self)?;
        let data = self.data()?;
        let input = self.size()?;
        let out = forward(&data)?;
        let size = result_size(&out.size(), &[&input]);

        if !(is_grad_enabled() && self.requires_grad()) {
            return Ok(self.registry.leaf_sized(out, size));
        }

        let node = self.node_id()?;
        let version = self.registry.version(node);
        let saved = Saved::new(&data, input, self.registry.save_policy());
        let backward: Arc<BackwardFn<P>> =
            Arc::new(move |g: &AutogradValue<P>, config: &BackwardConfig| -> Result<()> {
                let registry = g.registry();
                if !registry.wants_grad(node) {
                    return Ok(());
                }
                let x = registry.resolve(node, &saved, version, config.keep_graph);
                let dx = rule(g, &x)?;
                registry.add_to_grad(node, &dx, config.keep_graph)
            });
        let id = self
            .registry
            .insert_interior(Arc::new(out), size, op, smallvec![node], backward);
        Ok(self.registry.handle(id))
    }

    /// Apply a binary operator.
    ///
    /// With `broadcast` set, an operand whose shape differs from the result
    /// gets its gradient summed back down to its own shape after its rule
    /// runs.
    pub fn apply_binary<F, L, R>(
        &self,
        other: &AutogradValue<P>,
        op: &'static str,
        broadcast: bool,
        forward: F,
        lhs_rule: L,
        rhs_rule: R,
    ) -> Result<AutogradValue<P>>
    where
        F: FnOnce(&P, &P) -> Result<P>,
        L: Fn(&AutogradValue<P>, &AutogradValue<P>, &AutogradValue<P>) -> Result<AutogradValue<P>>
            + Send
            + Sync
            + 'static,
        R: Fn(&AutogradValue<P>, &AutogradValue<P>, &AutogradValue<P>) -> Result<AutogradValue<P>>
            + Send
            + Sync
            + 'static,
    {
        if !self.registry.same(&other.registry) {
            return Err(AutogradError::InvalidConstruction(format!(
                "`{op}` operands live in registries `{}` and `{}`",
                self.registry.name(),
                other.registry.name()
            )));
        }
        ensure_operand(self)?;
        ensure_operand(other)?;
        let (lhs, rhs) = (self.data()?, other.data()?);
        let (lhs_size, rhs_size) = (self.size()?, other.size()?);
        let out = forward(&lhs, &rhs)?;
        let size = result_size(&out.size(), &[&lhs_size, &rhs_size]);

        let track = is_grad_enabled() && (self.requires_grad() || other.requires_grad());
        if !track {
            return Ok(self.registry.leaf_sized(out, size));
        }

        let policy = self.registry.save_policy();
        let (lhs_node, rhs_node) = (self.node_id()?, other.node_id()?);
        let (lhs_version, rhs_version) = (
            self.registry.version(lhs_node),
            self.registry.version(rhs_node),
        );
        let reduce_lhs = (broadcast && lhs_size != size).then(|| lhs_size.clone());
        let reduce_rhs = (broadcast && rhs_size != size).then(|| rhs_size.clone());
        let saved_lhs = Saved::new(&lhs, lhs_size, policy);
        let saved_rhs = Saved::new(&rhs, rhs_size, policy);

        let backward: Arc<BackwardFn<P>> =
            Arc::new(move |g: &AutogradValue<P>, config: &BackwardConfig| -> Result<()> {
                let registry = g.registry();
                let keep = config.keep_graph;
                let want_lhs = registry.wants_grad(lhs_node);
                let want_rhs = registry.wants_grad(rhs_node);
                if !want_lhs && !want_rhs {
                    return Ok(());
                }
                let l = registry.resolve(lhs_node, &saved_lhs, lhs_version, keep);
                let r = registry.resolve(rhs_node, &saved_rhs, rhs_version, keep);
                if want_lhs {
                    let dl = reduce(lhs_rule(g, &l, &r)?, reduce_lhs.as_ref())?;
                    registry.add_to_grad(lhs_node, &dl, keep)?;
                }
                if want_rhs {
                    let dr = reduce(rhs_rule(g, &l, &r)?, reduce_rhs.as_ref())?;
                    registry.add_to_grad(rhs_node, &dr, keep)?;
                }
                Ok(())
            });
        let id = self.registry.insert_interior(
            Arc::new(out),
            size,
            op,
            smallvec![lhs_node, rhs_node],
            backward,
        );
        Ok(self.registry.handle(id))
    }

    /// Replace the payload in place; no graph bookkeeping happens.
    ///
    /// Bumps the node's version. Operators recorded earlier replay the
    /// operand from their snapshot, and a backward pass through a mutated
    /// interior node fails instead of using stale operands.
    pub(crate) fn apply_inplace<F>(&self, op: &'static str, f: F) -> Result<&Self>
    where
        F: FnOnce(&P) -> Result<P>,
    {
        ensure_operand(self)?;
        let data = self.data()?;
        let size = self.size()?;
        let mut out = f(&data)?;
        if out.size() != size {
            if out.numel() != size.numel() {
                return Err(AutogradError::ShapeMismatch {
                    expected: size.numel(),
                    actual: out.numel(),
                });
            }
            out = out.reshape(&size)?;
        }
        let mut arena = self.registry.lock();
        let slot = arena.slot_mut(self.id)?;
        slot.data = DataCell::ready(Arc::new(out));
        let node = slot.node;
        let value_node = &mut arena.values[node.0];
        value_node.version += 1;
        trace!(value = self.id.0, op, version = value_node.version, "in-place update");
        Ok(self)
    }
}

fn reduce<P: Payload>(grad: AutogradValue<P>, target: Option<&Size>) -> Result<AutogradValue<P>> {
    match target {
        Some(size) => grad.sum_to(size.clone()),
        None => Ok(grad),
    }
}
