//! Message dispatch.
//!
//! [`lookup_slot`] is the hot path behind every message send: it resolves
//! `(receiver, selector)` to a slot whose implementation is always safe to
//! invoke. A send never fails at this layer — nil receivers resolve to
//! zero-returning slots, a typed miss falls back to the untyped peer
//! through the type-mismatch hook, and unresolvable sends are routed
//! through the proxy and forwarding hooks.
//!
//! The resolution order is:
//!
//! 1. nil receiver → shared nil slot, picked by the selector's return kind,
//! 2. unregistered selector → registered transparently,
//! 3. class not initialized → drive `runtime::init`,
//! 4. typed dtable hit → opportunistic cache write, return,
//! 5. untyped peer hit → type-mismatch hook decides,
//! 6. proxy hook may substitute the receiver and restart,
//! 7. forward hook produces the final slot.

use std::sync::{LazyLock, RwLock};

use crate::runtime::class::Class;
use crate::runtime::dtable::Slot;
use crate::runtime::encoding::{self, ReturnKind};
use crate::runtime::init;
use crate::runtime::method::Imp;
use crate::runtime::object::{Id, NIL, class_of};
use crate::runtime::selector::{self, Selector};

unsafe extern "C" fn nil_imp(
    _receiver: Id,
    _sel: Selector,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    // SAFETY: dispatch guarantees a 16-byte return buffer.
    unsafe { ret.cast::<usize>().write_unaligned(0) };
}

unsafe extern "C" fn nil_imp_double(
    _receiver: Id,
    _sel: Selector,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    // SAFETY: as above.
    unsafe { ret.cast::<f64>().write_unaligned(0.0) };
}

unsafe extern "C" fn nil_imp_float(
    _receiver: Id,
    _sel: Selector,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    // SAFETY: as above.
    unsafe { ret.cast::<f32>().write_unaligned(0.0) };
}

unsafe extern "C" fn nil_imp_long_double(
    _receiver: Id,
    _sel: Selector,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    // SAFETY: as above.
    unsafe { ret.cast::<[u8; 16]>().write_unaligned([0; 16]) };
}

static NIL_SLOT: LazyLock<Slot> = LazyLock::new(|| Slot::ownerless(nil_imp));
static NIL_SLOT_DOUBLE: LazyLock<Slot> =
    LazyLock::new(|| Slot::ownerless(nil_imp_double));
static NIL_SLOT_FLOAT: LazyLock<Slot> =
    LazyLock::new(|| Slot::ownerless(nil_imp_float));
static NIL_SLOT_LONG_DOUBLE: LazyLock<Slot> =
    LazyLock::new(|| Slot::ownerless(nil_imp_long_double));

/// Picks the nil slot whose implementation returns the right kind of zero
/// for the selector's return type.
fn nil_slot_for(sel: Selector) -> &'static Slot {
    match encoding::return_kind(sel.types()) {
        ReturnKind::LongDouble => &NIL_SLOT_LONG_DOUBLE,
        ReturnKind::Double => &NIL_SLOT_DOUBLE,
        ReturnKind::Float => &NIL_SLOT_FLOAT,
        ReturnKind::Word => &NIL_SLOT,
    }
}

/// The shared integer nil slot.
fn word_nil_slot() -> &'static Slot {
    &NIL_SLOT
}

/// Replaceable hook: may substitute the receiver before resolution fails
/// over to forwarding. Returns nil to decline.
pub type ProxyHook = fn(receiver: Id, sel: Selector) -> Id;

/// Replaceable hook: produces the final slot for an unresolved send.
pub type ForwardHook = fn(receiver: Id, sel: Selector) -> &'static Slot;

/// Replaceable hook: invoked when a typed lookup missed but the untyped
/// peer hit. Whatever it returns is dispatched.
pub type TypeMismatchHook =
    fn(class: Class, sel: Selector, slot: &'static Slot) -> &'static Slot;

fn default_proxy(_receiver: Id, _sel: Selector) -> Id {
    NIL
}

fn default_forward(_receiver: Id, _sel: Selector) -> &'static Slot {
    word_nil_slot()
}

fn default_type_mismatch(class: Class, sel: Selector, slot: &'static Slot) -> &'static Slot {
    if cfg!(feature = "mismatch-warnings") {
        log::warn!(
            "calling [{} {}{}] with a mismatched signature: method has {:?}, selector has {:?}",
            class.name(),
            if class.is_metaclass() { '+' } else { '-' },
            sel.name(),
            slot.types(),
            sel.types(),
        );
    }
    slot
}

#[derive(Clone, Copy)]
struct Hooks {
    proxy: ProxyHook,
    forward: ForwardHook,
    mismatch: TypeMismatchHook,
}

static HOOKS: RwLock<Hooks> = RwLock::new(Hooks {
    proxy: default_proxy,
    forward: default_forward,
    mismatch: default_type_mismatch,
});

fn hooks() -> Hooks {
    *HOOKS.read().unwrap()
}

/// Replaces the proxy hook, returning the previous one.
pub fn set_proxy_hook(hook: ProxyHook) -> ProxyHook {
    std::mem::replace(&mut HOOKS.write().unwrap().proxy, hook)
}

/// Replaces the forward hook, returning the previous one.
pub fn set_forward_hook(hook: ForwardHook) -> ForwardHook {
    std::mem::replace(&mut HOOKS.write().unwrap().forward, hook)
}

/// Replaces the type-mismatch hook, returning the previous one.
pub fn set_type_mismatch_hook(hook: TypeMismatchHook) -> TypeMismatchHook {
    std::mem::replace(&mut HOOKS.write().unwrap().mismatch, hook)
}

/// Resolves a message send. The returned slot is always callable.
///
/// May rewrite `*receiver` when the proxy hook substitutes a new one; the
/// caller must use the receiver as rewritten when invoking the slot.
/// `sender` is accepted for sender-aware dispatch schemes and is currently
/// unused.
///
/// # Safety
///
/// A non-nil `*receiver` must point at a live allocation starting with an
/// object header, and must remain valid for the duration of the call.
pub unsafe fn lookup_slot(
    receiver: &mut Id,
    sel: Selector,
    _sender: Option<Id>,
) -> &'static Slot {
    if receiver.is_null() {
        return nil_slot_for(sel);
    }
    let sel = selector::register_in_place(sel);
    let hooks = hooks();

    loop {
        // SAFETY: non-null per the check above and the rewrite rule; the
        // caller guarantees validity.
        let Some(class) = (unsafe { class_of(*receiver) }) else {
            return (hooks.forward)(*receiver, sel);
        };
        if !init::is_initialized(class) {
            // SAFETY: receiver is valid per the caller contract.
            unsafe { init::send_initialize(*receiver) };
        }

        let cls = class.inner.as_ptr().cast_const();
        let dtable = sel.dtable();
        if let Some(slot) = dtable.lookup(cls) {
            dtable.cache_store(cls, slot);
            return slot;
        }
        if let Some(slot) = sel.untyped().dtable().lookup(cls) {
            return (hooks.mismatch)(class, sel, slot);
        }

        let substitute = (hooks.proxy)(*receiver, sel);
        if !substitute.is_null() {
            *receiver = substitute;
            continue;
        }
        return (hooks.forward)(*receiver, sel);
    }
}

/// A super-send context: dispatch starts at `class` instead of the
/// receiver's own class.
pub struct SuperContext {
    /// The receiver the implementation will be invoked on.
    pub receiver: Id,
    /// The class whose chain the lookup starts at (normally the sending
    /// method's superclass).
    pub class: Class,
}

/// Resolves a super-send: walks the chain starting at `ctx.class`, with no
/// proxy or forwarding fallback. Misses resolve to the integer nil slot so
/// the result stays callable.
///
/// # Safety
///
/// A non-nil `ctx.receiver` must point at a live allocation starting with
/// an object header.
pub unsafe fn lookup_slot_super(ctx: &SuperContext, sel: Selector) -> &'static Slot {
    if ctx.receiver.is_null() {
        return word_nil_slot();
    }
    let sel = selector::register_in_place(sel);
    if !init::is_initialized(ctx.class) {
        // SAFETY: receiver is valid per the caller contract.
        unsafe { init::send_initialize(ctx.receiver) };
    }
    sel.dtable()
        .lookup(ctx.class.inner.as_ptr().cast_const())
        .unwrap_or_else(word_nil_slot)
}

/// Introspective slot lookup: no initialization driving, no proxy, no
/// forwarding. The type-mismatch hook still mediates untyped fallbacks.
#[must_use]
pub fn get_slot(class: Class, sel: Selector) -> Option<&'static Slot> {
    let sel = selector::register_in_place(sel);
    let cls = class.inner.as_ptr().cast_const();
    if let Some(slot) = sel.dtable().lookup(cls) {
        return Some(slot);
    }
    if let Some(slot) = sel.untyped().dtable().lookup(cls) {
        return Some((hooks().mismatch)(class, sel, slot));
    }
    None
}

/// Whether `class` (or an ancestor) defines a method for `sel`.
#[must_use]
pub fn class_responds_to(class: Class, sel: Selector) -> bool {
    get_slot(class, sel).is_some()
}

/// The implementation `class` would run for `sel`, falling through to the
/// forward hook's slot when there is none.
#[must_use]
pub fn implementation_for(class: Class, sel: Selector) -> Imp {
    match get_slot(class, sel) {
        Some(slot) => slot.imp(),
        None => (hooks().forward)(NIL, sel).imp(),
    }
}

/// Probes the advisory per-selector cache for `(sel, class)`.
///
/// A hit is a hint, not an authority: call-site caches must revalidate
/// against the slot's version before trusting a cached implementation.
#[must_use]
pub fn cached_entry(sel: Selector, class: Class) -> Option<(Imp, u64)> {
    sel.dtable().cache_probe(class.inner.as_ptr().cast_const())
}
