//! Argot: a selector-indexed message dispatch core.
//!
//! Argot is the dispatch heart of a Smalltalk-style dynamic object runtime:
//! message sends against a single-inheritance class hierarchy, resolved
//! through globally interned selectors and per-selector dispatch tables.
//! It provides:
//!
//! - **Selector interning** — `(name, type-encoding)` pairs map to compact
//!   pointer-identity handles; every typed selector shares an untyped peer.
//! - **Per-selector dtables** — sorted `(class -> slot)` binding arrays
//!   with lock-free readers and a small advisory cache.
//! - **Exactly-once class initialization** — a lock-protected protocol that
//!   runs a class's `initialize` method once, superclass first, while the
//!   initializing thread can keep messaging the class and other threads
//!   block until it is done.
//! - **A hot path that cannot fail** — nil receivers, type mismatches, and
//!   missing methods all resolve to callable slots through replaceable
//!   hooks.
//!
//! The class loader, object allocator, and refcount primitives live in the
//! host runtime; Argot consumes them through callbacks and the narrow class
//! fields it owns.
//!
//! # Example
//!
//! ```rust
//! use argot::{Class, MethodDesc, Object, Selector, add_method_list, lookup_slot};
//!
//! unsafe extern "C" fn answer_imp(
//!     _receiver: argot::Id,
//!     _sel: Selector,
//!     _args: *const *mut u8,
//!     ret: *mut u8,
//! ) {
//!     unsafe { ret.cast::<usize>().write_unaligned(42) };
//! }
//!
//! let class = Class::new_root("Example").unwrap();
//! add_method_list(
//!     class,
//!     &[MethodDesc { name: "answer", types: "q@:", imp: answer_imp }],
//! );
//!
//! let sel = Selector::register("answer", Some("q@:"));
//! let obj = Object::new(class);
//! let mut receiver = obj.as_id();
//! let slot = unsafe { lookup_slot(&mut receiver, sel, None) };
//! let mut ret = [0u8; 16];
//! unsafe {
//!     (slot.imp())(receiver, sel, std::ptr::null(), ret.as_mut_ptr());
//!     assert_eq!(ret.as_ptr().cast::<usize>().read_unaligned(), 42);
//! }
//! ```

pub mod error;
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::{
    Class, ClassFlags, ClassResolveHook, DtableState, ForwardHook, Id, Imp,
    Method, MethodDesc, MethodList, NIL, Object, ObjectHeader, ProxyHook,
    RuntimeStats, Selector, Slot, SuperContext, TypeMismatchHook, add_method_list,
    cached_entry, check_refcount_eligibility, class_of, class_responds_to,
    dtable_for_class, ensure_initialized, get_slot, implementation_for,
    log_memory_usage, lookup_class, lookup_slot, lookup_slot_super,
    register_selector_array, register_selectors_from_class,
    register_selectors_from_list, registered_count, remove_class,
    runtime_stats, send_initialize, set_class_resolve_hook, set_forward_hook,
    set_proxy_hook, set_type_mismatch_hook, typed_variants_of, types_for_name,
    update_method,
};
