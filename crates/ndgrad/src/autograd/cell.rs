//! Payload memo cell and saved operand snapshots.

use std::fmt;
use std::sync::Arc;

use crate::payload::Payload;
use crate::size::Size;

/// Lazily evaluated payload source.
pub type Supplier<P> = Arc<dyn Fn() -> P + Send + Sync>;

/// Single-slot memoization of a payload supplier.
///
/// The supplier runs at most once; its result stays cached until
/// [`DataCell::clear`] drops it. Eager payloads have no supplier and can
/// never be cleared.
pub(crate) struct DataCell<P> {
    supplier: Option<Supplier<P>>,
    cached: Option<Arc<P>>,
}

impl<P> DataCell<P> {
    pub(crate) fn ready(value: Arc<P>) -> Self {
        Self {
            supplier: None,
            cached: Some(value),
        }
    }

    pub(crate) fn lazy(supplier: Supplier<P>) -> Self {
        Self {
            supplier: Some(supplier),
            cached: None,
        }
    }

    pub(crate) fn cached(&self) -> Option<Arc<P>> {
        self.cached.clone()
    }

    pub(crate) fn supplier(&self) -> Option<Supplier<P>> {
        self.supplier.clone()
    }

    /// Store a freshly computed value unless another caller got there first.
    pub(crate) fn fill(&mut self, value: Arc<P>) -> Arc<P> {
        Arc::clone(self.cached.get_or_insert(value))
    }

    /// Drop the cached payload if the supplier can recompute it.
    pub(crate) fn clear(&mut self) -> bool {
        if self.supplier.is_some() {
            self.cached = None;
            true
        } else {
            false
        }
    }

    /// Remove everything; used when the owning value closes.
    pub(crate) fn take(&mut self) -> Option<Arc<P>> {
        self.supplier = None;
        self.cached.take()
    }
}

impl<P> fmt::Debug for DataCell<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCell")
            .field("lazy", &self.supplier.is_some())
            .field("cached", &self.cached.is_some())
            .finish()
    }
}

/// How operand payloads are captured for backward replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Share the operand's payload buffer (default).
    #[default]
    Shared,
    /// Deep-copy the payload at operator application time.
    Copied,
}

/// Operand snapshot recorded when an operator is applied.
///
/// A backward pass that does not keep the graph rebuilds an equivalent leaf
/// from this snapshot instead of touching the operand itself, which may be
/// closed or mutated by then.
pub struct Saved<P> {
    data: Arc<P>,
    size: Size,
    policy: SavePolicy,
}

impl<P: Payload> Saved<P> {
    pub fn new(data: &Arc<P>, size: Size, policy: SavePolicy) -> Self {
        let data = match policy {
            SavePolicy::Shared => Arc::clone(data),
            SavePolicy::Copied => Arc::new(P::clone(data)),
        };
        Self { data, size, policy }
    }

    pub fn data(&self) -> &Arc<P> {
        &self.data
    }

    pub fn size(&self) -> &Size {
        &self.size
    }

    pub fn policy(&self) -> SavePolicy {
        self.policy
    }
}

impl<P> Clone for Saved<P> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            size: self.size.clone(),
            policy: self.policy,
        }
    }
}

impl<P> fmt::Debug for Saved<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saved")
            .field("size", &self.size)
            .field("policy", &self.policy)
            .finish()
    }
}
