//! Per-object synchronization service.
//!
//! `enter`/`exit` implement a recursive monitor keyed by object address.
//! The init coordinator holds a metaclass's monitor for the whole duration
//! of that class's initializer, which is what makes other threads block —
//! and the initializing thread re-enter — correctly during initialization.
//!
//! Monitors are created on first contact and arena-allocated; they are
//! never reclaimed, matching the process-lifetime policy of the rest of the
//! runtime metadata.

use std::thread::{self, ThreadId};

use argot_mem::global_arena;
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};

use crate::runtime::object::Id;

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    recursion: u32,
}

struct Monitor {
    state: Mutex<OwnerState>,
    cond: Condvar,
}

/// Address-keyed monitor registry.
static MONITORS: Mutex<Option<FxHashMap<usize, &'static Monitor>>> = Mutex::new(None);

fn monitor_for(addr: usize) -> &'static Monitor {
    let mut map = MONITORS.lock();
    let map = map.get_or_insert_with(FxHashMap::default);
    *map.entry(addr).or_insert_with(|| {
        global_arena().alloc(Monitor {
            state: Mutex::new(OwnerState::default()),
            cond: Condvar::new(),
        })
    })
}

/// Acquires the monitor for `obj`, blocking while another thread holds it.
/// Re-entry by the owning thread nests. Nil receivers are ignored.
pub fn enter(obj: Id) {
    if obj.is_null() {
        return;
    }
    let monitor = monitor_for(obj.addr());
    let me = thread::current().id();
    let mut state = monitor.state.lock();
    if state.owner == Some(me) {
        state.recursion += 1;
        return;
    }
    while state.owner.is_some() {
        monitor.cond.wait(&mut state);
    }
    state.owner = Some(me);
    state.recursion = 1;
}

/// Releases one level of the monitor for `obj`.
///
/// # Panics
///
/// Panics if the calling thread does not hold the monitor.
pub fn exit(obj: Id) {
    if obj.is_null() {
        return;
    }
    let monitor = monitor_for(obj.addr());
    let me = thread::current().id();
    let mut state = monitor.state.lock();
    assert_eq!(
        state.owner,
        Some(me),
        "object monitor exited by a non-owning thread"
    );
    state.recursion -= 1;
    if state.recursion == 0 {
        state.owner = None;
        monitor.cond.notify_one();
    }
}

/// RAII guard over `enter`/`exit`.
pub(crate) struct ObjectGuard {
    obj: Id,
}

impl ObjectGuard {
    pub(crate) fn enter(obj: Id) -> ObjectGuard {
        enter(obj);
        ObjectGuard { obj }
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        exit(self.obj);
    }
}
