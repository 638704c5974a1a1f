//! Lifecycle registry and node arena.
//!
//! A [`Registry`] owns every value slot and node pair created against it.
//! Handles ([`AutogradValue`]) are `(registry, ValueId)` pairs; all mutable
//! state sits behind one `parking_lot::Mutex`, which is never held while a
//! payload supplier or a backward function runs.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::cell::{DataCell, SavePolicy};
use super::lifecycle::{self, RegistryStatus};
use super::node::{BackwardFn, GradNode, NodeId, ValueId, ValueNode};
use super::value::{AutogradValue, ValueBuilder};
use crate::error::{AutogradError, Result};
use crate::payload::Payload;
use crate::size::Size;

pub(crate) struct Slot<P> {
    pub(crate) data: DataCell<P>,
    pub(crate) size: Size,
    pub(crate) requires_grad: bool,
    pub(crate) create_graph: bool,
    pub(crate) name: Option<String>,
    pub(crate) node: NodeId,
    pub(crate) closed: bool,
    pub(crate) closing: bool,
    pub(crate) uncloseable: bool,
    /// Values whose lifetime is entangled with this one (views, superseded
    /// gradient accumulators, retained backward temporaries).
    pub(crate) links: Vec<ValueId>,
}

/// Construction parameters for a new slot.
pub(crate) struct SlotInit<P> {
    pub(crate) data: DataCell<P>,
    pub(crate) size: Size,
    pub(crate) requires_grad: bool,
    pub(crate) create_graph: bool,
    pub(crate) name: Option<String>,
    pub(crate) uncloseable: bool,
}

impl<P> SlotInit<P> {
    pub(crate) fn plain(data: Arc<P>, size: Size) -> Self {
        Self {
            data: DataCell::ready(data),
            size,
            requires_grad: false,
            create_graph: false,
            name: None,
            uncloseable: false,
        }
    }
}

pub(crate) struct Arena<P: Payload> {
    pub(crate) slots: Vec<Option<Slot<P>>>,
    pub(crate) values: Vec<ValueNode<P>>,
    pub(crate) grads: Vec<GradNode<P>>,
    /// Stack of "values created since" lists used by backward passes.
    pub(crate) frames: Vec<Vec<ValueId>>,
}

impl<P: Payload> Arena<P> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            values: Vec::new(),
            grads: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub(crate) fn slot(&self, id: ValueId) -> Result<&Slot<P>> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| evicted(id))
    }

    pub(crate) fn slot_mut(&mut self, id: ValueId) -> Result<&mut Slot<P>> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| evicted(id))
    }

    pub(crate) fn is_open(&self, id: ValueId) -> bool {
        self.slot(id).is_ok_and(|s| !s.closed && !s.closing)
    }

    /// Gradient slot of a node, if it is still usable.
    pub(crate) fn grad_of(&self, node: NodeId) -> Option<ValueId> {
        self.grads[node.0].value.filter(|&g| self.is_open(g))
    }

    fn insert(&mut self, init: SlotInit<P>, node: impl FnOnce(ValueId) -> ValueNode<P>) -> ValueId {
        let id = ValueId(self.slots.len());
        let node_id = NodeId(self.values.len());
        let value_node = node(id);
        for &p in &value_node.prev {
            self.values[p.0].next.push(node_id);
        }
        self.values.push(value_node);
        self.grads.push(GradNode::new());
        self.slots.push(Some(Slot {
            data: init.data,
            size: init.size,
            requires_grad: init.requires_grad,
            create_graph: init.create_graph,
            name: init.name,
            node: node_id,
            closed: false,
            closing: false,
            uncloseable: init.uncloseable,
            links: Vec::new(),
        }));
        if let Some(frame) = self.frames.last_mut() {
            frame.push(id);
        }
        id
    }

    /// Every slot a grad node currently points at.
    pub(crate) fn grad_referenced(&self) -> HashSet<ValueId> {
        self.grads
            .iter()
            .flat_map(|g| g.value.into_iter().chain(g.native_value))
            .collect()
    }

    /// Close `id` and everything entangled with it.
    ///
    /// Already-closed and uncloseable values are skipped silently.
    pub(crate) fn close(&mut self, id: ValueId) -> usize {
        let mut closed = 0;
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Ok(slot) = self.slot_mut(id) else {
                continue;
            };
            if slot.closed || slot.closing || slot.uncloseable {
                continue;
            }
            slot.closing = true;
            let node = slot.node;
            stack.extend(slot.links.drain(..));
            let payload = slot.data.take();

            let grad = &mut self.grads[node.0];
            stack.extend(grad.value.take());
            stack.extend(grad.native_value.take());
            grad.native = None;

            let value_node = &mut self.values[node.0];
            value_node.closing = true;
            value_node.backward = None;

            if let Some(mut payload) = payload {
                if let Some(p) = Arc::get_mut(&mut payload) {
                    p.release();
                }
            }

            let value_node = &mut self.values[node.0];
            value_node.closing = false;
            value_node.closed = true;
            if let Ok(slot) = self.slot_mut(id) {
                slot.closing = false;
                slot.closed = true;
            }
            closed += 1;
        }
        closed
    }
}

fn evicted(id: ValueId) -> AutogradError {
    AutogradError::IllegalState(format!("value {} was evicted from its registry", id.0))
}

pub(crate) struct RegistryInner<P: Payload> {
    name: String,
    policy: SavePolicy,
    arena: Mutex<Arena<P>>,
}

/// Named collection of differentiable values.
///
/// Cloning a `Registry` clones the handle; all clones share one arena.
pub struct Registry<P: Payload> {
    inner: Arc<RegistryInner<P>>,
}

impl<P: Payload> Clone for Registry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Payload> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.inner.name)
            .field("backend", &P::BACKEND)
            .finish()
    }
}

impl<P: Payload> Registry<P> {
    /// Create a registry and add it to the process-wide list.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_policy(name, SavePolicy::default())
    }

    /// Create a registry whose operators snapshot operands with `policy`.
    pub fn with_policy(name: impl Into<String>, policy: SavePolicy) -> Self {
        let inner = Arc::new(RegistryInner {
            name: name.into(),
            policy,
            arena: Mutex::new(Arena::new()),
        });
        debug!(registry = %inner.name, backend = P::BACKEND, "registry created");
        let weak: std::sync::Weak<RegistryInner<P>> = Arc::downgrade(&inner);
        lifecycle::register(weak);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn save_policy(&self) -> SavePolicy {
        self.inner.policy
    }

    /// Whether two handles refer to the same registry.
    pub fn same(&self, other: &Registry<P>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Leaf value that does not require grad.
    pub fn value(&self, payload: P) -> Result<AutogradValue<P>> {
        ValueBuilder::new().data(payload).build(self)
    }

    /// Leaf value that requires grad.
    pub fn variable(&self, payload: P) -> Result<AutogradValue<P>> {
        ValueBuilder::new().data(payload).requires_grad(true).build(self)
    }

    /// Number of slots not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every closeable value still open.
    pub fn close_all(&self) {
        self.inner.close_all();
    }

    /// Forget closed values; returns how many slots were evicted.
    pub fn clear_closed(&self) -> usize {
        let mut arena = self.lock();
        let mut evicted = 0;
        for slot in arena.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.closed) {
                *slot = None;
                evicted += 1;
            }
        }
        debug!(registry = %self.inner.name, evicted, "cleared closed values");
        evicted
    }

    /// Counts of open and uncloseable values, grouped by name.
    pub fn status(&self) -> RegistryReport {
        self.inner.report()
    }

    /// Whether no closeable value is left open.
    pub fn is_all_closed(&self) -> bool {
        self.status().open == 0
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Arena<P>> {
        self.inner.arena.lock()
    }

    pub(crate) fn handle(&self, id: ValueId) -> AutogradValue<P> {
        AutogradValue::from_parts(self.clone(), id)
    }

    pub(crate) fn insert_leaf(&self, init: SlotInit<P>) -> ValueId {
        let id = self.lock().insert(init, ValueNode::leaf);
        trace!(registry = %self.inner.name, value = id.0, "leaf created");
        id
    }

    pub(crate) fn insert_interior(
        &self,
        data: Arc<P>,
        size: Size,
        op: &'static str,
        prev: SmallVec<[NodeId; 2]>,
        backward: Arc<BackwardFn<P>>,
    ) -> ValueId {
        let mut init = SlotInit::plain(data, size);
        init.requires_grad = true;
        let id = self
            .lock()
            .insert(init, |owner| ValueNode::interior(owner, op, prev, backward));
        trace!(registry = %self.inner.name, value = id.0, op, "node recorded");
        id
    }

    /// Cached payload of `id`, running its supplier outside the lock.
    pub(crate) fn data(&self, id: ValueId) -> Result<Arc<P>> {
        let (supplier, size) = {
            let arena = self.lock();
            let slot = arena.slot(id)?;
            if slot.closed {
                return Err(AutogradError::IllegalState(format!(
                    "value {} is closed",
                    id.0
                )));
            }
            if let Some(data) = slot.data.cached() {
                return Ok(data);
            }
            let supplier = slot.data.supplier().ok_or_else(|| {
                AutogradError::IllegalState(format!("value {} has no payload", id.0))
            })?;
            (supplier, slot.size.clone())
        };
        let mut computed = supplier();
        if computed.size() != size {
            if computed.numel() != size.numel() {
                return Err(AutogradError::ShapeMismatch {
                    expected: size.numel(),
                    actual: computed.numel(),
                });
            }
            computed = computed.reshape(&size)?;
        }
        Ok(self.lock().slot_mut(id)?.data.fill(Arc::new(computed)))
    }

    pub(crate) fn close(&self, id: ValueId) -> usize {
        self.lock().close(id)
    }

    pub(crate) fn push_frame(&self) {
        self.lock().frames.push(Vec::new());
    }

    pub(crate) fn pop_frame(&self) -> Vec<ValueId> {
        self.lock().frames.pop().unwrap_or_default()
    }
}

impl<P: Payload> RegistryInner<P> {
    fn close_all(&self) {
        let mut arena = self.arena.lock();
        let open: Vec<ValueId> = arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|s| !s.closed && !s.uncloseable))
            .map(|(i, _)| ValueId(i))
            .collect();
        let closed: usize = open.into_iter().map(|id| arena.close(id)).sum();
        debug!(registry = %self.name, closed, "closed all values");
    }

    fn report(&self) -> RegistryReport {
        let arena = self.arena.lock();
        let mut report = RegistryReport {
            name: self.name.clone(),
            ..RegistryReport::default()
        };
        for slot in arena.slots.iter().flatten() {
            report.live += 1;
            let key = slot.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
            if slot.uncloseable {
                report.uncloseable += 1;
                *report.uncloseable_by_name.entry(key).or_default() += 1;
            } else if !slot.closed {
                report.open += 1;
                *report.open_by_name.entry(key).or_default() += 1;
            }
        }
        report
    }
}

impl<P: Payload> RegistryStatus for RegistryInner<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn report(&self) -> RegistryReport {
        RegistryInner::report(self)
    }

    fn close_all(&self) {
        RegistryInner::close_all(self);
    }
}

/// Diagnostic snapshot of one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryReport {
    pub name: String,
    /// Slots not yet evicted, closed or not.
    pub live: usize,
    /// Closeable values still open.
    pub open: usize,
    pub uncloseable: usize,
    pub open_by_name: BTreeMap<String, usize>,
    pub uncloseable_by_name: BTreeMap<String, usize>,
}

impl fmt::Display for RegistryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "registry `{}`: {} open, {} uncloseable, {} live",
            self.name, self.open, self.uncloseable, self.live
        )?;
        for (name, count) in &self.open_by_name {
            writeln!(f, "  open        {name}: {count}")?;
        }
        for (name, count) in &self.uncloseable_by_name {
            writeln!(f, "  uncloseable {name}: {count}")?;
        }
        Ok(())
    }
}
