//! Differentiable values.
//!
//! [`AutogradValue`] is a cheap handle: a registry plus the index of a slot
//! in the registry arena. Cloning a handle does not copy the payload, and
//! two handles with the same id always observe the same state.
//!
//! # Example
//!
//! ```
//! use ndgrad::{Registry, ValueBuilder};
//!
//! let registry = Registry::<f64>::new("example");
//! let a = ValueBuilder::new().data(2.6).requires_grad(true).build(&registry).unwrap();
//! let b = ValueBuilder::new().data(3.6).requires_grad(true).build(&registry).unwrap();
//!
//! let result = a.add(&b).unwrap();
//! assert!((result.item().unwrap() - 6.2).abs() < 1e-12);
//! assert!(result.grad().unwrap().is_none());
//!
//! result.backward().unwrap();
//! assert_eq!(a.grad().unwrap().unwrap().item().unwrap(), 1.0);
//! registry.close_all();
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::cell::{DataCell, Supplier};
use super::node::{NativeGrad, NodeId, ValueId};
use super::registry::{Registry, SlotInit};
use crate::error::{AutogradError, Result};
use crate::payload::Payload;
use crate::size::Size;

/// Handle to a graph-tracked payload.
pub struct AutogradValue<P: Payload> {
    pub(crate) registry: Registry<P>,
    pub(crate) id: ValueId,
}

impl<P: Payload> Clone for AutogradValue<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            id: self.id,
        }
    }
}

impl<P: Payload> fmt::Debug for AutogradValue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutogradValue")
            .field("registry", &self.registry.name())
            .field("id", &self.id)
            .finish()
    }
}

impl<P: Payload> AutogradValue<P> {
    pub(crate) fn from_parts(registry: Registry<P>, id: ValueId) -> Self {
        Self { registry, id }
    }

    pub fn registry(&self) -> &Registry<P> {
        &self.registry
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    /// Forward/grad node pair currently owned by this value.
    pub fn node_id(&self) -> Result<NodeId> {
        Ok(self.registry.lock().slot(self.id)?.node)
    }

    /// Cached payload, computing it from the supplier on first access.
    pub fn data(&self) -> Result<Arc<P>> {
        self.registry.data(self.id)
    }

    pub fn size(&self) -> Result<Size> {
        Ok(self.registry.lock().slot(self.id)?.size.clone())
    }

    pub fn numel(&self) -> Result<usize> {
        Ok(self.registry.lock().slot(self.id)?.size.numel())
    }

    /// Elements in storage order.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        Ok(self.data()?.to_vec())
    }

    /// The single element of a one-element value.
    pub fn item(&self) -> Result<f64> {
        let data = self.data()?;
        if data.numel() != 1 {
            return Err(AutogradError::ShapeMismatch {
                expected: 1,
                actual: data.numel(),
            });
        }
        data.get(0)
    }

    /// Element at a flat index.
    pub fn get(&self, index: usize) -> Result<f64> {
        self.data()?.get(index)
    }

    pub fn get_at(&self, indices: &[usize]) -> Result<f64> {
        self.data()?.get_at(indices)
    }

    pub fn requires_grad(&self) -> bool {
        self.registry
            .lock()
            .slot(self.id)
            .is_ok_and(|s| s.requires_grad)
    }

    pub fn requires_grad_(&self, requires_grad: bool) -> &Self {
        if let Ok(slot) = self.registry.lock().slot_mut(self.id) {
            slot.requires_grad = requires_grad;
        }
        self
    }

    /// Whether a backward pass rooted here keeps the graph by default.
    pub fn create_graph(&self) -> bool {
        self.registry
            .lock()
            .slot(self.id)
            .is_ok_and(|s| s.create_graph)
    }

    pub fn create_graph_(&self, create_graph: bool) -> &Self {
        if let Ok(slot) = self.registry.lock().slot_mut(self.id) {
            slot.create_graph = create_graph;
        }
        self
    }

    pub fn name(&self) -> Option<String> {
        self.registry
            .lock()
            .slot(self.id)
            .ok()
            .and_then(|s| s.name.clone())
    }

    pub fn name_(&self, name: impl Into<String>) -> &Self {
        if let Ok(slot) = self.registry.lock().slot_mut(self.id) {
            slot.name = Some(name.into());
        }
        self
    }

    /// Closed or evicted.
    pub fn is_closed(&self) -> bool {
        self.registry.lock().slot(self.id).map_or(true, |s| s.closed)
    }

    pub fn is_closing(&self) -> bool {
        self.registry.lock().slot(self.id).is_ok_and(|s| s.closing)
    }

    pub fn is_leaf(&self) -> bool {
        let arena = self.registry.lock();
        arena
            .slot(self.id)
            .map_or(true, |s| arena.values[s.node.0].is_leaf())
    }

    /// Name of the operator that produced this value (`"leaf"` for leaves).
    pub fn op(&self) -> &'static str {
        let arena = self.registry.lock();
        arena
            .slot(self.id)
            .map_or("leaf", |s| arena.values[s.node.0].op)
    }

    /// Forward nodes of the operands this value was computed from.
    pub fn predecessors(&self) -> Vec<NodeId> {
        let arena = self.registry.lock();
        arena
            .slot(self.id)
            .map(|s| arena.values[s.node.0].prev.to_vec())
            .unwrap_or_default()
    }

    /// Forward nodes of the values computed from this one.
    pub fn successors(&self) -> Vec<NodeId> {
        let arena = self.registry.lock();
        arena
            .slot(self.id)
            .map(|s| arena.values[s.node.0].next.clone())
            .unwrap_or_default()
    }

    /// Close this value together with its gradient and linked values.
    ///
    /// Closing an already-closed or uncloseable value does nothing.
    pub fn close(&self) {
        let closed = self.registry.close(self.id);
        trace!(value = self.id.0, closed, "close");
    }

    /// Drop the cached payload if it can be recomputed from a supplier.
    pub fn clear_cache(&self) -> bool {
        self.registry
            .lock()
            .slot_mut(self.id)
            .is_ok_and(|s| s.data.clear())
    }

    /// Accumulated gradient, or the native gradient when one is available.
    pub fn grad(&self) -> Result<Option<AutogradValue<P>>> {
        self.grad_with(false)
    }

    /// Like [`grad`](Self::grad); with `close` set the gradient is detached
    /// from the grad node and the caller becomes responsible for closing it.
    pub fn grad_with(&self, close: bool) -> Result<Option<AutogradValue<P>>> {
        let node = self.node_id()?;
        if let Some(native) = self.native_grad(node)? {
            if close {
                self.registry.lock().grads[node.0].native_value = None;
            }
            return Ok(Some(self.registry.handle(native)));
        }
        let mut arena = self.registry.lock();
        let grad = arena.grad_of(node);
        if grad.is_none() || close {
            arena.grads[node.0].value = None;
        }
        drop(arena);
        Ok(grad.map(|id| self.registry.handle(id)))
    }

    /// Refresh and return the stable native-gradient slot of `node`.
    fn native_grad(&self, node: NodeId) -> Result<Option<ValueId>> {
        let supplier = {
            let arena = self.registry.lock();
            let grad = &arena.grads[node.0];
            if grad.native_disabled {
                None
            } else {
                grad.native.clone()
            }
        };
        let Some(payload) = supplier.and_then(|f| f()) else {
            return Ok(None);
        };
        let size = payload.size();
        let fresh = self
            .registry
            .insert_leaf(SlotInit::plain(Arc::new(payload), size));

        let stable = {
            let mut arena = self.registry.lock();
            let current = arena.grads[node.0]
                .native_value
                .filter(|&v| arena.is_open(v));
            if current.is_none() {
                arena.grads[node.0].native_value = Some(fresh);
            }
            current
        };
        match stable {
            None => Ok(Some(fresh)),
            Some(stable) => {
                self.registry
                    .handle(stable)
                    .swap_with(&self.registry.handle(fresh))?;
                self.registry.close(fresh);
                Ok(Some(stable))
            }
        }
    }

    /// Install a supplier of an externally computed gradient.
    pub fn set_native_grad(&self, native: impl Fn() -> Option<P> + Send + Sync + 'static) -> Result<()> {
        let node = self.node_id()?;
        let native: NativeGrad<P> = Arc::new(native);
        self.registry.lock().grads[node.0].native = Some(native);
        Ok(())
    }

    /// Stop (or resume) consulting the native gradient.
    pub fn disable_native_grad(&self, disabled: bool) -> Result<()> {
        let node = self.node_id()?;
        self.registry.lock().grads[node.0].native_disabled = disabled;
        Ok(())
    }

    /// Make `grad` the gradient of this value.
    ///
    /// Fails for a leaf that already holds a gradient: a leaf only gains a
    /// second gradient through accumulation.
    pub fn set_grad(&self, grad: &AutogradValue<P>) -> Result<()> {
        if !self.registry.same(&grad.registry) {
            return Err(AutogradError::InvalidGradient(
                "gradient belongs to another registry".to_string(),
            ));
        }
        let mut arena = self.registry.lock();
        let slot = arena.slot(self.id)?;
        let (node, expected) = (slot.node, slot.size.numel());
        let actual = arena.slot(grad.id)?.size.numel();
        if expected != actual {
            return Err(AutogradError::ShapeMismatch { expected, actual });
        }
        if arena.values[node.0].is_leaf() && arena.grad_of(node).is_some() {
            return Err(AutogradError::InvalidGradient(format!(
                "leaf {node} already holds a gradient"
            )));
        }
        arena.grads[node.0].value = Some(grad.id);
        Ok(())
    }

    /// Close the accumulated gradient so the next pass starts from zero.
    pub fn zero_grad(&self) -> Result<()> {
        let node = self.node_id()?;
        let grad = self.registry.lock().grads[node.0].value.take();
        if let Some(grad) = grad {
            self.registry.close(grad);
        }
        Ok(())
    }

    /// Exchange the entire contents of two slots.
    ///
    /// Every handle to `self` afterwards observes what `other` held and vice
    /// versa, including the graph nodes.
    pub fn swap_with(&self, other: &AutogradValue<P>) -> Result<()> {
        if !self.registry.same(&other.registry) {
            return Err(AutogradError::Swap(format!(
                "values live in registries `{}` and `{}`",
                self.registry.name(),
                other.registry.name()
            )));
        }
        if self.id == other.id {
            return Ok(());
        }
        let mut arena = self.registry.lock();
        for id in [self.id, other.id] {
            match arena.slot(id) {
                Ok(slot) if !slot.closed && !slot.closing => {}
                _ => {
                    return Err(AutogradError::Swap(format!("value {} is closed", id.0)));
                }
            }
        }
        arena.slots.swap(self.id.0, other.id.0);
        for id in [self.id, other.id] {
            let node = arena.slot(id)?.node;
            arena.values[node.0].owner = id;
        }
        Ok(())
    }

    /// Untracked value sharing this value's payload under another shape.
    ///
    /// The view is linked to this value and closes with it.
    pub fn view(&self, size: impl Into<Size>) -> Result<AutogradValue<P>> {
        let size = size.into();
        let current = self.size()?;
        if size.numel() != current.numel() {
            return Err(AutogradError::ShapeMismatch {
                expected: current.numel(),
                actual: size.numel(),
            });
        }
        let data = self.data()?.reshape(&size)?;
        let view = self
            .registry
            .insert_leaf(SlotInit::plain(Arc::new(data), size));
        self.registry.lock().slot_mut(self.id)?.links.push(view);
        Ok(self.registry.handle(view))
    }

    /// Change the shape in place; the element count must be preserved.
    ///
    /// Counts as an in-place update for operators that recorded `self`.
    pub fn resize_(&self, dims: &[usize]) -> Result<&Self> {
        let size = self.size()?.resize(dims)?;
        let data = self.data()?.reshape(&size)?;
        let mut arena = self.registry.lock();
        let slot = arena.slot_mut(self.id)?;
        slot.data = DataCell::ready(Arc::new(data));
        slot.size = size;
        let node = slot.node;
        arena.values[node.0].version += 1;
        Ok(self)
    }
}

enum Source<P> {
    Ready(P),
    Lazy(Supplier<P>),
}

/// Construction options for a leaf value.
///
/// ```
/// use ndgrad::{DenseTensor, Registry, Size, ValueBuilder};
///
/// let registry = Registry::<DenseTensor<f64>>::new("builder");
/// let x = ValueBuilder::new()
///     .supplier(|| DenseTensor::ones(&[2, 3]))
///     .size(Size::new(&[2, 3]))
///     .requires_grad(true)
///     .name("x")
///     .build(&registry)
///     .unwrap();
/// assert_eq!(x.numel().unwrap(), 6);
/// registry.close_all();
/// ```
pub struct ValueBuilder<P: Payload> {
    source: Option<Source<P>>,
    size: Option<Size>,
    requires_grad: bool,
    create_graph: bool,
    name: Option<String>,
    uncloseable: bool,
}

impl<P: Payload> Default for ValueBuilder<P> {
    fn default() -> Self {
        Self {
            source: None,
            size: None,
            requires_grad: false,
            create_graph: false,
            name: None,
            uncloseable: false,
        }
    }
}

impl<P: Payload> ValueBuilder<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, payload: P) -> Self {
        self.source = Some(Source::Ready(payload));
        self
    }

    /// Compute the payload on first access instead of eagerly.
    pub fn supplier(mut self, supplier: impl Fn() -> P + Send + Sync + 'static) -> Self {
        self.source = Some(Source::Lazy(Arc::new(supplier)));
        self
    }

    /// Shape of the value; defaults to the payload's own shape.
    pub fn size(mut self, size: impl Into<Size>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub fn create_graph(mut self, create_graph: bool) -> Self {
        self.create_graph = create_graph;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Exempt the value from closing; it is reported separately.
    pub fn uncloseable(mut self, uncloseable: bool) -> Self {
        self.uncloseable = uncloseable;
        self
    }

    pub fn build(self, registry: &Registry<P>) -> Result<AutogradValue<P>> {
        let source = self.source.ok_or_else(|| {
            AutogradError::InvalidConstruction(
                "a leaf value needs a payload or a supplier".to_string(),
            )
        })?;
        let (data, size) = match (source, self.size) {
            (Source::Ready(payload), size) => {
                let (payload, size) = fit(payload, size)?;
                (DataCell::ready(Arc::new(payload)), size)
            }
            (Source::Lazy(supplier), Some(size)) => (DataCell::lazy(supplier), size),
            (Source::Lazy(supplier), None) => {
                let payload = supplier();
                let size = payload.size();
                let mut cell = DataCell::lazy(supplier);
                cell.fill(Arc::new(payload));
                (cell, size)
            }
        };
        let id = registry.insert_leaf(SlotInit {
            data,
            size,
            requires_grad: self.requires_grad,
            create_graph: self.create_graph,
            name: self.name,
            uncloseable: self.uncloseable,
        });
        Ok(registry.handle(id))
    }
}

/// Reshape `payload` to `size` when one is given.
fn fit<P: Payload>(payload: P, size: Option<Size>) -> Result<(P, Size)> {
    let actual = payload.size();
    match size {
        None => Ok((payload, actual)),
        Some(size) if size == actual => Ok((payload, size)),
        Some(size) => {
            if size.numel() != actual.numel() {
                return Err(AutogradError::ShapeMismatch {
                    expected: size.numel(),
                    actual: actual.numel(),
                });
            }
            let payload = payload.reshape(&size)?;
            Ok((payload, size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DenseTensor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Registry<DenseTensor<f64>> {
        Registry::new("value-tests")
    }

    #[test]
    fn test_leaf_construction() {
        let r = registry();
        let x = ValueBuilder::new()
            .data(DenseTensor::<f64>::ones(&[2, 2]))
            .requires_grad(true)
            .name("x")
            .build(&r)
            .unwrap();
        assert!(x.predecessors().is_empty());
        assert!(x.is_leaf());
        assert!(x.requires_grad());
        assert!(x.grad().unwrap().is_none());
        assert_eq!(x.name().as_deref(), Some("x"));
        assert_eq!(x.op(), "leaf");
        r.close_all();
    }

    #[test]
    fn test_missing_payload_is_rejected() {
        let r = registry();
        let err = ValueBuilder::new().build(&r).unwrap_err();
        assert!(matches!(err, AutogradError::InvalidConstruction(_)));
    }

    #[test]
    fn test_explicit_size_must_match() {
        let r = registry();
        let err = ValueBuilder::new()
            .data(DenseTensor::<f64>::zeros(&[2, 3]))
            .size(Size::new(&[4]))
            .build(&r)
            .unwrap_err();
        assert!(matches!(
            err,
            AutogradError::ShapeMismatch {
                expected: 4,
                actual: 6
            }
        ));

        let reshaped = ValueBuilder::new()
            .data(DenseTensor::<f64>::zeros(&[2, 3]))
            .size(Size::new(&[3, 2]))
            .build(&r)
            .unwrap();
        assert_eq!(reshaped.data().unwrap().shape(), &[3, 2]);
        r.close_all();
    }

    #[test]
    fn test_supplier_runs_once_until_cleared() {
        let r = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let x = ValueBuilder::new()
            .supplier(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                DenseTensor::ones(&[3])
            })
            .size(Size::new(&[3]))
            .build(&r)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        x.data().unwrap();
        x.data().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(x.clear_cache());
        x.data().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        r.close_all();
    }

    #[test]
    fn test_swap_exchanges_contents() {
        let r = Registry::<f64>::new("swap");
        let a = r.variable(1.0).unwrap();
        let b = r.value(2.0).unwrap();
        let a_node = a.node_id().unwrap();
        a.swap_with(&b).unwrap();
        assert_eq!(a.item().unwrap(), 2.0);
        assert_eq!(b.item().unwrap(), 1.0);
        assert!(b.requires_grad());
        assert_eq!(b.node_id().unwrap(), a_node);

        let other = Registry::<f64>::new("swap-other");
        let c = other.value(3.0).unwrap();
        assert!(matches!(a.swap_with(&c), Err(AutogradError::Swap(_))));
        b.close();
        assert!(matches!(a.swap_with(&b), Err(AutogradError::Swap(_))));
        r.close_all();
        other.close_all();
    }

    #[test]
    fn test_view_is_linked_and_round_trips() {
        let r = registry();
        let data = DenseTensor::from_vec((0..6).map(f64::from).collect(), &[2, 3]).unwrap();
        let x = r.value(data).unwrap();
        let v = x.view([3, 2]).unwrap();
        assert_eq!(v.size().unwrap().dims(), &[3, 2]);
        assert_eq!(v.to_vec().unwrap(), x.to_vec().unwrap());
        assert!(x.view([4]).is_err());

        x.close();
        assert!(v.is_closed());
        assert!(matches!(x.data(), Err(AutogradError::IllegalState(_))));
    }

    #[test]
    fn test_resize_in_place() {
        let r = registry();
        let x = r.value(DenseTensor::<f64>::zeros(&[2, 6])).unwrap();
        x.resize_(&[3, 4]).unwrap();
        assert_eq!(x.size().unwrap().dims(), &[3, 4]);
        assert_eq!(x.data().unwrap().shape(), &[3, 4]);
        assert!(x.resize_(&[5]).is_err());
        assert_eq!(r.version(x.node_id().unwrap()), 1);
        r.close_all();
    }

    #[test]
    fn test_native_grad_preferred_and_stable() {
        let r = Registry::<f64>::new("native");
        let x = r.variable(1.0).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        x.set_native_grad(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Some(10.0 + n as f64)
        })
        .unwrap();

        let first = x.grad().unwrap().unwrap();
        assert_eq!(first.item().unwrap(), 10.0);
        let second = x.grad().unwrap().unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(first.item().unwrap(), 11.0);

        x.disable_native_grad(true).unwrap();
        assert!(x.grad().unwrap().is_none());
        r.close_all();
        assert!(r.is_all_closed());
    }

    #[test]
    fn test_set_grad_twice_on_leaf_fails() {
        let r = Registry::<f64>::new("set-grad");
        let x = r.variable(1.0).unwrap();
        let g = r.value(0.5).unwrap();
        x.set_grad(&g).unwrap();
        assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 0.5);
        let h = r.value(0.25).unwrap();
        assert!(matches!(x.set_grad(&h), Err(AutogradError::InvalidGradient(_))));

        x.zero_grad().unwrap();
        assert!(x.grad().unwrap().is_none());
        assert!(g.is_closed());
        r.close_all();
    }
}
