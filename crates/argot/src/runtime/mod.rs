//! Argot runtime core.
//!
//! The runtime is organized leaves-first:
//!
//! - [`encoding`]: type-encoding comparison and return-kind classification
//! - [`selector`]: global selector interning with typed/untyped peers
//! - `dtable`: per-selector sorted dispatch tables and advisory caches
//! - [`class`] / [`object`]: class records, metaclasses, receivers
//! - [`method`]: method lists and method administration
//! - [`sync`]: the per-object recursive monitor
//! - [`init`]: the exactly-once class initialization protocol
//! - [`dispatch`]: the message-send hot path and its hooks
//!
//! Everything long-lived is allocated from the global arena in `argot-mem`
//! and survives for the remainder of the process.

pub mod class;
pub mod dispatch;
mod dtable;
pub mod encoding;
pub mod init;
mod locks;
pub mod method;
pub mod object;
pub mod selector;
pub mod sync;

pub use class::{Class, ClassFlags, DtableState, lookup_class};
pub use dispatch::{
    ForwardHook, ProxyHook, SuperContext, TypeMismatchHook, cached_entry,
    class_responds_to, get_slot, implementation_for, lookup_slot,
    lookup_slot_super, set_forward_hook, set_proxy_hook, set_type_mismatch_hook,
};
pub use dtable::Slot;
pub use init::{
    ClassResolveHook, dtable_for_class, ensure_initialized, send_initialize,
    set_class_resolve_hook,
};
pub use method::{
    Imp, Method, MethodDesc, MethodList, add_method_list,
    check_refcount_eligibility, register_selector_array,
    register_selectors_from_class, register_selectors_from_list, remove_class,
    update_method,
};
pub use object::{Id, NIL, Object, ObjectHeader, class_of};
pub use selector::{
    Selector, registered_count, typed_variants_of, types_for_name,
};

/// Snapshot of the runtime's memory footprint.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStats {
    /// Registered selectors (typed variants count separately).
    pub selectors: u32,
    /// Bytes held by slot arrays, retired generations included.
    pub dtable_bytes: u64,
    /// Global arena statistics.
    pub arena: argot_mem::ArenaStats,
}

/// Collects the current memory-usage counters.
#[must_use]
pub fn runtime_stats() -> RuntimeStats {
    RuntimeStats {
        selectors: selector::registered_count(),
        dtable_bytes: dtable::dtable_bytes(),
        arena: argot_mem::global_arena().stats(),
    }
}

/// Logs the memory-usage counters at debug level.
pub fn log_memory_usage() {
    let stats = runtime_stats();
    log::debug!(
        "{} selectors registered, {} bytes in dtable slot arrays, \
         {} bytes in {} arena chunk(s)",
        stats.selectors,
        stats.dtable_bytes,
        stats.arena.allocated,
        stats.arena.chunks,
    );
}
