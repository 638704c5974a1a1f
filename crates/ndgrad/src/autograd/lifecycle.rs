//! Process-wide view over every live registry.
//!
//! Registries add themselves here on creation; the list holds weak
//! references only, so dropping the last handle of a registry removes it.
//! [`shutdown`] closes and forgets every tracked registry.

use std::sync::{OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::registry::RegistryReport;

/// Type-erased view of a registry for process-level diagnostics.
pub trait RegistryStatus: Send + Sync {
    fn name(&self) -> &str;
    fn report(&self) -> RegistryReport;
    fn close_all(&self);
}

type Entries = Mutex<Vec<Weak<dyn RegistryStatus>>>;

fn entries() -> &'static Entries {
    static ENTRIES: OnceLock<Entries> = OnceLock::new();
    ENTRIES.get_or_init(|| Mutex::new(Vec::new()))
}

pub(crate) fn register<R: RegistryStatus + 'static>(registry: Weak<R>) {
    let registry: Weak<dyn RegistryStatus> = registry;
    let mut list = entries().lock();
    list.retain(|w| w.strong_count() > 0);
    list.push(registry);
}

fn live() -> Vec<std::sync::Arc<dyn RegistryStatus>> {
    let mut list = entries().lock();
    list.retain(|w| w.strong_count() > 0);
    list.iter().filter_map(Weak::upgrade).collect()
}

/// Reports of every registry still alive.
pub fn status_report() -> Vec<RegistryReport> {
    let reports: Vec<RegistryReport> = live().iter().map(|r| r.report()).collect();
    for report in reports.iter().filter(|r| r.open > 0) {
        warn!(
            registry = %report.name,
            open = report.open,
            "registry still holds open values"
        );
    }
    reports
}

/// Whether every live registry has closed all closeable values.
pub fn all_closed() -> bool {
    live().iter().all(|r| r.report().open == 0)
}

/// Close everything in every live registry, log what was left open and
/// stop tracking them. Registries created afterwards are tracked again.
pub fn shutdown() {
    let detached = std::mem::take(&mut *entries().lock());
    let registries: Vec<_> = detached.iter().filter_map(Weak::upgrade).collect();
    info!(registries = registries.len(), "closing all registries");
    for registry in registries {
        let before = registry.report();
        if before.open > 0 {
            debug!(registry = registry.name(), open = before.open, "closing leftovers");
        }
        registry.close_all();
    }
}
