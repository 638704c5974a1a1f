//! Forward and gradient graph nodes.
//!
//! Every differentiable value owns one node pair sharing a [`NodeId`]: the
//! value node records the producing operator and its operands, the grad
//! node accumulates the gradient. Topology lives on the value node only;
//! the grad node of `n` has the same predecessors as the value node of `n`.
//!
//! Nodes are stored in the registry arena and refer to each other by index,
//! so the graph holds no reference cycles.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::backward::BackwardConfig;
use super::value::AutogradValue;
use crate::error::Result;
use crate::payload::Payload;

/// Index of a node pair in a registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a value slot in a registry arena.
///
/// A handle keeps its `ValueId` for life; [`AutogradValue::swap_with`]
/// exchanges slot contents, never ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) usize);

impl ValueId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Recorded backward function: receives the node's accumulated gradient and
/// deposits gradients into the operands' grad nodes.
pub type BackwardFn<P> = dyn Fn(&AutogradValue<P>, &BackwardConfig) -> Result<()> + Send + Sync;

/// Supplier of an externally computed gradient.
pub type NativeGrad<P> = Arc<dyn Fn() -> Option<P> + Send + Sync>;

pub(crate) struct ValueNode<P: Payload> {
    pub(crate) owner: ValueId,
    pub(crate) prev: SmallVec<[NodeId; 2]>,
    pub(crate) next: Vec<NodeId>,
    pub(crate) backward: Option<Arc<BackwardFn<P>>>,
    pub(crate) op: &'static str,
    pub(crate) closed: bool,
    pub(crate) closing: bool,
    /// Backward function dropped by a pass that did not keep the graph.
    pub(crate) released: bool,
    /// Number of in-place updates applied to the owner's payload.
    pub(crate) version: u64,
}

impl<P: Payload> ValueNode<P> {
    pub(crate) fn leaf(owner: ValueId) -> Self {
        Self {
            owner,
            prev: SmallVec::new(),
            next: Vec::new(),
            backward: None,
            op: "leaf",
            closed: false,
            closing: false,
            released: false,
            version: 0,
        }
    }

    pub(crate) fn interior(
        owner: ValueId,
        op: &'static str,
        prev: SmallVec<[NodeId; 2]>,
        backward: Arc<BackwardFn<P>>,
    ) -> Self {
        Self {
            prev,
            backward: Some(backward),
            op,
            ..Self::leaf(owner)
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.prev.is_empty()
    }
}

impl<P: Payload> fmt::Debug for ValueNode<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueNode")
            .field("owner", &self.owner)
            .field("op", &self.op)
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("has_backward", &self.backward.is_some())
            .field("closed", &self.closed)
            .field("released", &self.released)
            .field("version", &self.version)
            .finish()
    }
}

pub(crate) struct GradNode<P> {
    /// Slot holding the accumulated gradient.
    pub(crate) value: Option<ValueId>,
    pub(crate) native: Option<NativeGrad<P>>,
    pub(crate) native_disabled: bool,
    /// Stable handle through which the native gradient is exposed.
    pub(crate) native_value: Option<ValueId>,
    /// Serializes accumulation into this node.
    pub(crate) lock: Arc<Mutex<()>>,
}

impl<P> GradNode<P> {
    pub(crate) fn new() -> Self {
        Self {
            value: None,
            native: None,
            native_disabled: false,
            native_value: None,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl<P> fmt::Debug for GradNode<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradNode")
            .field("value", &self.value)
            .field("native", &self.native.is_some())
            .field("native_disabled", &self.native_disabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_leaf_and_interior() {
        let leaf: ValueNode<f64> = ValueNode::leaf(ValueId(0));
        assert!(leaf.is_leaf());
        assert!(leaf.backward.is_none());

        let backward: Arc<BackwardFn<f64>> =
            Arc::new(|_: &AutogradValue<f64>, _: &BackwardConfig| -> Result<()> { Ok(()) });
        let node = ValueNode::interior(ValueId(2), "add", smallvec![NodeId(0), NodeId(1)], backward);
        assert!(!node.is_leaf());
        assert_eq!(node.op, "add");
        assert_eq!(node.prev.as_slice(), &[NodeId(0), NodeId(1)]);
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(NodeId(3).to_string(), "n3");
        assert_eq!(ValueId(5).index(), 5);
    }
}
