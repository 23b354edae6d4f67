//! Cross-cutting runtime lock and lock-order bookkeeping.
//!
//! Three locks interact during dispatch and initialization:
//!
//! 1. **RuntimeLock** (here) — serializes method-list registration and
//!    method updates.
//! 2. **ClassObjectLock** — the per-object monitor in `runtime::sync`.
//! 3. **InitLock** — protects the init look-aside list in `runtime::init`.
//!
//! Acquisition must follow RuntimeLock → ClassObjectLock → InitLock. The
//! load-bearing half of that rule — InitLock is never held while acquiring
//! RuntimeLock — is enforced in debug builds with a thread-local counter,
//! because getting it wrong deadlocks rarely but reproducibly.

use std::cell::Cell;

use parking_lot::{Mutex, MutexGuard};

static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static INIT_LOCKS_HELD: Cell<u32> = const { Cell::new(0) };
}

/// Acquires the runtime lock.
pub(crate) fn lock_runtime() -> MutexGuard<'static, ()> {
    debug_assert_eq!(
        INIT_LOCKS_HELD.with(Cell::get),
        0,
        "lock order violation: runtime lock acquired while holding the init lock"
    );
    RUNTIME_LOCK.lock()
}

/// Records that the current thread acquired the init lock.
pub(crate) fn note_init_acquired() {
    INIT_LOCKS_HELD.with(|held| held.set(held.get() + 1));
}

/// Records that the current thread released the init lock.
pub(crate) fn note_init_released() {
    INIT_LOCKS_HELD.with(|held| {
        debug_assert!(held.get() > 0);
        held.set(held.get().saturating_sub(1));
    });
}
