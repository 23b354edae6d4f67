//! Class initialization coordination.
//!
//! The first message to a class must run the class's `initialize` method
//! exactly once, before any sender observes the class's dispatch state —
//! while the initializing thread itself can keep messaging the class from
//! inside the initializer. The coordinator drives that with three locks and
//! a transient look-aside list:
//!
//! - the **runtime lock** serializes dtable construction,
//! - the **metaclass monitor** is held for the whole initializer, so other
//!   threads that discover initialization has started can block on it,
//! - the **init lock** protects the flag transitions and the look-aside
//!   list of classes whose initializer is currently in flight.
//!
//! Lock order is RuntimeLock → ClassObjectLock → InitLock; the init lock is
//! never held while acquiring the runtime lock (`runtime::locks` checks
//! this in debug builds).
//!
//! The look-aside entries are a pair of stack-allocated nodes, one for the
//! class and one for its metaclass, spliced into a global list while the
//! initializer runs. A scope-exit guard installs both dtable states and
//! unlinks both nodes in a single init-lock critical section, whether the
//! initializer returns or unwinds.

use std::ptr::NonNull;
use std::sync::{OnceLock, RwLock};

use parking_lot::{Mutex, MutexGuard};

use crate::runtime::class::{Class, ClassFlags, ClassInner, DtableState};
use crate::runtime::object::{Id, class_of};
use crate::runtime::selector::Selector;
use crate::runtime::{locks, method, sync};

/// Node of the init look-aside list. Lives on the initializing thread's
/// stack; the install guard unlinks it before the frame is torn down.
struct InitEntry {
    class: *const ClassInner,
    next: *mut InitEntry,
}

/// Head of the look-aside list, protected by the init lock.
struct Lookaside {
    head: *mut InitEntry,
}

// SAFETY: the head is only touched with the lock held; the entries it
// points at outlive their membership in the list.
unsafe impl Send for Lookaside {}

static INIT_LOCK: Mutex<Lookaside> = Mutex::new(Lookaside {
    head: std::ptr::null_mut(),
});

/// Init-lock guard that keeps the lock-order bookkeeping honest.
struct InitLockGuard {
    inner: MutexGuard<'static, Lookaside>,
}

fn lock_init() -> InitLockGuard {
    let inner = INIT_LOCK.lock();
    locks::note_init_acquired();
    InitLockGuard { inner }
}

impl Drop for InitLockGuard {
    fn drop(&mut self) {
        locks::note_init_released();
    }
}

impl std::ops::Deref for InitLockGuard {
    type Target = Lookaside;
    fn deref(&self) -> &Lookaside {
        &self.inner
    }
}

impl std::ops::DerefMut for InitLockGuard {
    fn deref_mut(&mut self) -> &mut Lookaside {
        &mut self.inner
    }
}

fn lookaside_contains(lookaside: &Lookaside, class: Class) -> bool {
    let target = class.inner.as_ptr().cast_const();
    let mut cur = lookaside.head;
    while !cur.is_null() {
        // SAFETY: entries stay valid while linked; we hold the init lock.
        let entry = unsafe { &*cur };
        if entry.class == target {
            return true;
        }
        cur = entry.next;
    }
    false
}

fn unlink(lookaside: &mut Lookaside, target: *const ClassInner) {
    let mut cur: *mut *mut InitEntry = &mut lookaside.head;
    // SAFETY: we hold the init lock; the chain only contains live entries.
    unsafe {
        while !(*cur).is_null() {
            if (**cur).class == target {
                *cur = (**cur).next;
            } else {
                cur = &mut (**cur).next;
            }
        }
    }
}

/// Scope-exit guard for the initializer call: installs both dtable states
/// and retracts both look-aside entries in one init-lock critical section.
/// Runs on unwind too, so a throwing initializer still publishes the class.
struct InstallGuard {
    class: Class,
    meta: Class,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let mut lookaside = lock_init();
        self.meta.set_dtable_state(DtableState::Installed);
        self.class.set_dtable_state(DtableState::Installed);
        unlink(&mut lookaside, self.class.inner.as_ptr().cast_const());
        unlink(&mut lookaside, self.meta.inner.as_ptr().cast_const());
    }
}

/// Replaceable loader callback, invoked before a class is initialized.
pub type ClassResolveHook = fn(Class);

fn default_resolve(_class: Class) {}

static RESOLVE_HOOK: RwLock<ClassResolveHook> = RwLock::new(default_resolve);

/// Installs the loader's class-resolve callback.
pub fn set_class_resolve_hook(hook: ClassResolveHook) {
    *RESOLVE_HOOK.write().unwrap() = hook;
}

/// The `initialize` selector, interned once.
pub(crate) fn initialize_selector() -> Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    *SEL.get_or_init(|| Selector::register("initialize", None))
}

/// Ensures `class` has run its initializer and published its dispatch
/// state. Blocks if another thread is mid-initialization; re-entry from the
/// initializing thread is a no-op.
pub fn ensure_initialized(class: Class) {
    // Fast path: initialization finished on some thread.
    if class.test_flag(ClassFlags::INITIALIZED)
        && class.dtable_state() == DtableState::Installed
    {
        return;
    }

    (*RESOLVE_HOOK.read().unwrap())(class);
    class.set_flag(ClassFlags::RESOLVED);

    // A class's superclass is fully initialized before its own initializer
    // runs. The superclass initializer may message this class; the flag
    // re-checks below keep that from re-entering.
    if let Some(superclass) = class.superclass() {
        ensure_initialized(superclass);
    }

    let meta = class.metaclass();

    // Hold the runtime lock while building dtables, and take it before any
    // other lock so a thread inside dtable_for_class cannot invert the
    // order on us.
    let runtime = locks::lock_runtime();

    if class.test_flag(ClassFlags::INITIALIZED) {
        // Initialization has started elsewhere. Release the runtime lock
        // first (the initializing thread may need it), then queue on the
        // metaclass monitor, which that thread holds until it finishes.
        drop(runtime);
        sync::enter(meta.as_id());
        sync::exit(meta.as_id());
        debug_assert_eq!(class.dtable_state(), DtableState::Installed);
        return;
    }

    let _monitor = sync::ObjectGuard::enter(meta.as_id());
    let mut lookaside = lock_init();
    if class.test_flag(ClassFlags::INITIALIZED) {
        return;
    }

    let skip_meta = meta.test_flag(ClassFlags::INITIALIZED);

    // Set the flags the moment initialization begins, so a re-entrant send
    // from this thread takes the look-aside path instead of re-running the
    // initializer.
    class.set_flag(ClassFlags::INITIALIZED);
    meta.set_flag(ClassFlags::INITIALIZED);

    method::register_attached_methods(class);
    if !skip_meta {
        method::register_attached_methods(meta);
    }

    // Done with everything that needs the runtime lock. Other threads can
    // now proceed until they hit the look-aside check and block there.
    drop(runtime);

    let init_sel = initialize_selector();
    let init_slot = if skip_meta {
        None
    } else {
        init_sel.dtable().lookup(meta.inner.as_ptr().cast_const())
    };

    let Some(init_slot) = init_slot else {
        // No initializer: install both dtable states right away.
        if !skip_meta {
            meta.set_dtable_state(DtableState::Installed);
        }
        class.set_dtable_state(DtableState::Installed);
        method::check_refcount_eligibility(class);
        return;
    };

    // Publish "initializer in flight" through the look-aside list. The
    // entries live on this stack frame; the install guard unlinks them
    // before the frame unwinds.
    let mut class_entry = InitEntry {
        class: class.inner.as_ptr().cast_const(),
        next: lookaside.head,
    };
    let mut meta_entry = InitEntry {
        class: meta.inner.as_ptr().cast_const(),
        next: &raw mut class_entry,
    };
    lookaside.head = &raw mut meta_entry;
    class.set_dtable_state(DtableState::Initializing);
    meta.set_dtable_state(DtableState::Initializing);
    drop(lookaside);

    let _install = InstallGuard { class, meta };
    method::check_refcount_eligibility(class);

    log::trace!("running initializer for {}", class.name());
    let imp = init_slot.imp();
    let mut ret = [0u8; 16];
    // SAFETY: the slot's imp follows the Imp ABI and a class record is a
    // valid receiver. The metaclass monitor is held across this call; that
    // is what makes other threads wait out the initializer.
    unsafe {
        imp(class.as_id(), init_sel, std::ptr::null(), ret.as_mut_ptr());
    }
    // _install drop: install + unlink under the init lock, then the
    // metaclass monitor is released.
}

/// Derives the class from a receiver (which may itself be a class object)
/// and ensures it is initialized.
///
/// # Safety
///
/// A non-nil `receiver` must point at a live allocation starting with an
/// object header.
pub unsafe fn send_initialize(receiver: Id) {
    // SAFETY: forwarded caller contract.
    let Some(mut class) = (unsafe { class_of(receiver) }) else {
        return;
    };
    if class.is_metaclass() {
        // The receiver is a class object; initialize that class, not its
        // metaclass.
        // SAFETY: class_of returned Some, so receiver is non-null and is a
        // class record.
        class = Class {
            inner: unsafe { NonNull::new_unchecked(receiver.cast()) },
        };
    }
    ensure_initialized(class);
}

/// Whether dispatch may proceed against `class` right now. Blocks while the
/// class's initializer runs on another thread.
pub(crate) fn is_initialized(class: Class) -> bool {
    if class.dtable_state() == DtableState::Installed {
        return true;
    }
    if !class.test_flag(ClassFlags::INITIALIZED) {
        return false;
    }

    // The original left `wait` uninitialized when the scan missed; starting
    // from false is the intended behavior.
    let mut wait = false;
    {
        let lookaside = lock_init();
        if lookaside_contains(&lookaside, class) {
            wait = true;
        }
    }
    if wait {
        sync::enter(class.as_id());
        sync::exit(class.as_id());
    }
    true
}

/// Observable dtable state for `class`, waiting out an in-flight
/// initializer on another thread first.
#[must_use]
pub fn dtable_for_class(class: Class) -> DtableState {
    if class.dtable_state() == DtableState::Installed {
        return DtableState::Installed;
    }
    let in_flight = {
        let lookaside = lock_init();
        lookaside_contains(&lookaside, class)
    };
    if in_flight {
        sync::enter(class.as_id());
        sync::exit(class.as_id());
    }
    class.dtable_state()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_selector_is_cached() {
        let a = initialize_selector();
        let b = initialize_selector();
        assert_eq!(a, b);
        assert_eq!(a.name(), "initialize");
        assert_eq!(a.types(), None);
    }

    #[test]
    fn test_ensure_without_initializer_installs() {
        let class = Class::new_root("InitPlain").unwrap();
        assert_eq!(class.dtable_state(), DtableState::Uninstalled);
        ensure_initialized(class);
        assert_eq!(class.dtable_state(), DtableState::Installed);
        assert_eq!(class.metaclass().dtable_state(), DtableState::Installed);
        assert!(is_initialized(class));
        // Idempotent.
        ensure_initialized(class);
        assert_eq!(class.dtable_state(), DtableState::Installed);
    }

    #[test]
    fn test_superclass_installed_with_subclass() {
        let parent = Class::new_root("InitSuperP").unwrap();
        let child = Class::new("InitSuperC", parent).unwrap();
        ensure_initialized(child);
        assert_eq!(parent.dtable_state(), DtableState::Installed);
        assert_eq!(child.dtable_state(), DtableState::Installed);
    }

    #[test]
    fn test_dtable_for_class_states() {
        let class = Class::new_root("InitStates").unwrap();
        assert_eq!(dtable_for_class(class), DtableState::Uninstalled);
        ensure_initialized(class);
        assert_eq!(dtable_for_class(class), DtableState::Installed);
    }

    #[test]
    fn test_resolve_hook_runs_before_init() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static RESOLVED: AtomicUsize = AtomicUsize::new(0);
        fn counting_resolve(_class: Class) {
            RESOLVED.fetch_add(1, Ordering::SeqCst);
        }

        set_class_resolve_hook(counting_resolve);
        let class = Class::new_root("InitResolve").unwrap();
        ensure_initialized(class);
        set_class_resolve_hook(super::default_resolve);
        assert!(RESOLVED.load(Ordering::SeqCst) >= 1);
    }
}
