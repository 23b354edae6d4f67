//! Selector interning.
//!
//! A selector is the interned identity of a message name plus an optional
//! type encoding. The table guarantees that `(name, types)` — with types
//! compared modulo the rules in `runtime::encoding` — maps to exactly one
//! handle, so selector comparison on the dispatch path is pointer equality.
//!
//! Every name also has an *untyped peer* (the selector with no encoding).
//! Registering a typed selector creates the peer on demand, and all typed
//! variants of a name share the peer's dispatch index, so a sender that only
//! knows the name lands in the same dtable family. Under the
//! `type-dependent-dispatch` feature each variant instead gets its own
//! index and the hash mixes in the dispatch-significant type characters.
//!
//! # Representation
//!
//! A selector entry is two words plus the encoding pointer: the `index` word
//! carries a high-bit registration tag and, once registered, the address of
//! the selector's dispatch table; the `name` word always points at the
//! canonical NUL-terminated name. Handles minted outside the table (see
//! [`Selector::unregistered`]) have a zero index word and are patched in
//! place the first time they meet the dispatch path.
//!
//! # Thread Safety
//!
//! The table is a bucket-chained hash map behind one `RwLock`: reads take
//! the shared lock and walk arena-immortal chain nodes; registration takes
//! the exclusive lock with a double-check. The hash uses only the name, so
//! all typed variants of a name collide into one chain on purpose.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};

use argot_mem::{Arena, global_arena};
use fxhash::FxHasher;

use crate::runtime::dtable::SelDtable;
use crate::runtime::encoding;

/// High bit of the index word: set once the selector is registered.
const REGISTERED_TAG: usize = 1 << (usize::BITS - 1);

/// Number of hash buckets (power of two for mask indexing).
const NUM_BUCKETS: usize = 1024;
const BUCKET_MASK: usize = NUM_BUCKETS - 1;

/// Interned selector entry, allocated in the global arena.
#[repr(C)]
pub(crate) struct SelEntry {
    /// Zero while unregistered; afterwards the dtable address with
    /// [`REGISTERED_TAG`] set.
    index: AtomicUsize,
    /// Canonical NUL-terminated name. All variants of one name share one
    /// copy after registration.
    name: AtomicPtr<u8>,
    /// NUL-terminated type encoding, null for the untyped peer. Fixed at
    /// creation.
    types: *const u8,
    /// Bucket chain link, written under the table's exclusive lock.
    next: AtomicPtr<SelEntry>,
}

// SAFETY: entries are arena-immortal; mutable fields are atomics and
// `types` is written once before the entry is shared.
unsafe impl Send for SelEntry {}
unsafe impl Sync for SelEntry {}

impl SelEntry {
    fn name_str(&self) -> &'static str {
        let raw = self.name.load(Ordering::Acquire);
        debug_assert!(!raw.is_null());
        // SAFETY: `name` always holds an alloc_cstr pointer.
        unsafe { Arena::cstr_to_str(NonNull::new_unchecked(raw)) }
    }

    fn types_str(&self) -> Option<&'static str> {
        // SAFETY: non-null `types` always holds an alloc_cstr pointer.
        NonNull::new(self.types.cast_mut()).map(|p| unsafe { Arena::cstr_to_str(p) })
    }
}

/// The process-global selector table.
struct SelectorTable {
    buckets: Vec<AtomicPtr<SelEntry>>,
    /// Dispatch index -> dtable. Index 0 is reserved as invalid.
    by_index: Vec<*const SelDtable>,
}

// SAFETY: chain nodes and dtables are arena-immortal; the table itself is
// only touched through the RwLock.
unsafe impl Send for SelectorTable {}
unsafe impl Sync for SelectorTable {}

static TABLE: OnceLock<RwLock<SelectorTable>> = OnceLock::new();

fn table() -> &'static RwLock<SelectorTable> {
    TABLE.get_or_init(|| {
        RwLock::new(SelectorTable {
            buckets: (0..NUM_BUCKETS)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            by_index: vec![std::ptr::null()],
        })
    })
}

/// Hashes a selector key. Only the name participates, so all typed variants
/// of a name land in one bucket chain; with type-dependent dispatch the
/// whitelisted type characters are mixed in as well (the full encoding
/// cannot be hashed because equality is looser than string equality).
fn hash_selector(name: &str, types: Option<&str>) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    if cfg!(feature = "type-dependent-dispatch") {
        if let Some(types) = types {
            for &c in types.as_bytes() {
                if encoding::mixes_into_hash(c) {
                    hasher.write_u8(c);
                }
            }
        }
    }
    hasher.finish() as usize
}

fn lookup_locked(
    tbl: &SelectorTable,
    name: &str,
    types: Option<&str>,
) -> Option<Selector> {
    let bucket = hash_selector(name, types) & BUCKET_MASK;
    let mut cur = tbl.buckets[bucket].load(Ordering::Acquire);
    while let Some(entry) = NonNull::new(cur) {
        // SAFETY: chain nodes are arena-immortal.
        let e = unsafe { entry.as_ref() };
        if e.name_str() == name && encoding::types_equal(e.types_str(), types) {
            return Some(Selector { entry });
        }
        cur = e.next.load(Ordering::Acquire);
    }
    None
}

/// Installs `entry` with a fresh dtable whose dispatch index is `uid`, and
/// patches the entry's index word. Caller holds the exclusive lock.
fn add_to_table_locked(tbl: &mut SelectorTable, entry: NonNull<SelEntry>, uid: u32) {
    // SAFETY: entry is arena-immortal.
    let e = unsafe { entry.as_ref() };
    let name = NonNull::new(e.name.load(Ordering::Relaxed))
        .expect("selector entry without a name");
    let dtable = SelDtable::new_in_arena(uid, name);
    tbl.by_index.push(std::ptr::from_ref(dtable));

    let bucket = hash_selector(e.name_str(), e.types_str()) & BUCKET_MASK;
    e.next
        .store(tbl.buckets[bucket].load(Ordering::Relaxed), Ordering::Relaxed);
    tbl.buckets[bucket].store(entry.as_ptr(), Ordering::Release);

    let word = (std::ptr::from_ref(dtable) as usize) | REGISTERED_TAG;
    e.index.store(word, Ordering::Release);
}

/// Registers `entry` (and, for typed selectors, its untyped peer) under the
/// exclusive lock. Mirrors the registration flow in the module docs.
fn register_entry_locked(tbl: &mut SelectorTable, entry: NonNull<SelEntry>) {
    // SAFETY: entry is arena-immortal.
    let e = unsafe { entry.as_ref() };
    let name = e.name_str();
    let Some(types) = e.types_str() else {
        let idx = u32::try_from(tbl.by_index.len()).expect("selector index overflow");
        add_to_table_locked(tbl, entry, idx);
        log::trace!("registered selector {idx} {name}");
        return;
    };

    let untyped = if let Some(u) = lookup_locked(tbl, name, None) {
        // Keep a single canonical copy of the name.
        // SAFETY: u.entry is arena-immortal.
        let u_name = unsafe { u.entry.as_ref() }.name.load(Ordering::Relaxed);
        e.name.store(u_name, Ordering::Relaxed);
        u
    } else {
        let u_entry: &'static SelEntry = global_arena().alloc(SelEntry {
            index: AtomicUsize::new(0),
            name: AtomicPtr::new(e.name.load(Ordering::Relaxed)),
            types: std::ptr::null(),
            next: AtomicPtr::new(std::ptr::null_mut()),
        });
        let u_entry = NonNull::from(u_entry);
        let idx = u32::try_from(tbl.by_index.len()).expect("selector index overflow");
        add_to_table_locked(tbl, u_entry, idx);
        log::trace!("registered selector {idx} {name}");
        Selector { entry: u_entry }
    };

    // Typed variants share the untyped peer's dispatch index unless each
    // type is dispatched separately.
    let uid = if cfg!(feature = "type-dependent-dispatch") {
        u32::try_from(tbl.by_index.len()).expect("selector index overflow")
    } else {
        untyped.dtable_unchecked().index()
    };
    add_to_table_locked(tbl, entry, uid);
    log::trace!("registered typed selector {uid} {name} {types}");

    let types_ptr = NonNull::new(e.types.cast_mut())
        .expect("typed selector entry without an encoding");
    untyped.dtable_unchecked().push_type(types_ptr);
}

/// Registers a foreign selector handle in place.
///
/// If an identical selector is already interned, the handle's index word
/// (and canonical name) are patched to match and the interned handle is
/// returned; otherwise the handle itself becomes the interned one.
pub(crate) fn register_in_place(sel: Selector) -> Selector {
    if sel.is_registered() {
        return sel;
    }
    // SAFETY: entries are arena-immortal.
    let e = unsafe { sel.entry.as_ref() };
    let name = e.name_str();
    let types = e.types_str();

    let adopt = |reg: Selector| {
        // SAFETY: both entries are arena-immortal.
        let reg_e = unsafe { reg.entry.as_ref() };
        e.name.store(reg_e.name.load(Ordering::Relaxed), Ordering::Relaxed);
        e.index
            .store(reg_e.index.load(Ordering::Acquire), Ordering::Release);
        reg
    };

    {
        let guard = table().read().unwrap();
        if let Some(reg) = lookup_locked(&guard, name, types) {
            return adopt(reg);
        }
    }

    let mut guard = table().write().unwrap();
    if let Some(reg) = lookup_locked(&guard, name, types) {
        return adopt(reg);
    }
    register_entry_locked(&mut guard, sel.entry);
    sel
}

/// Interned identity of a message name (plus optional type encoding).
///
/// Selectors are copyable pointer-sized handles. Two registered handles are
/// pointer-equal exactly when their `(name, types)` keys are equal, so `==`
/// on the dispatch path is a single comparison.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Selector {
    entry: NonNull<SelEntry>,
}

// SAFETY: entries are arena-immortal and internally synchronized.
unsafe impl Send for Selector {}
unsafe impl Sync for Selector {}

impl Selector {
    /// Returns the canonical selector for `(name, types)`, interning it if
    /// needed. Idempotent: equal keys yield pointer-equal handles, and
    /// registering a typed selector creates its untyped peer as well.
    ///
    /// # Panics
    ///
    /// Panics if `name` or `types` contains an embedded NUL byte.
    #[must_use]
    pub fn register(name: &str, types: Option<&str>) -> Selector {
        {
            let guard = table().read().unwrap();
            if let Some(sel) = lookup_locked(&guard, name, types) {
                return sel;
            }
        }

        let mut guard = table().write().unwrap();
        if let Some(sel) = lookup_locked(&guard, name, types) {
            return sel;
        }

        let arena = global_arena();
        let name_ptr = arena.alloc_cstr(name);
        let types_ptr = types.map_or(std::ptr::null(), |t| {
            arena.alloc_cstr(t).as_ptr().cast_const()
        });
        let entry: &'static SelEntry = arena.alloc(SelEntry {
            index: AtomicUsize::new(0),
            name: AtomicPtr::new(name_ptr.as_ptr()),
            types: types_ptr,
            next: AtomicPtr::new(std::ptr::null_mut()),
        });
        let entry = NonNull::from(entry);
        register_entry_locked(&mut guard, entry);
        Selector { entry }
    }

    /// Mints a selector handle without consulting the table, the way a
    /// loader materializes selectors from compiled metadata. The handle is
    /// registered transparently the first time it is dispatched.
    ///
    /// # Panics
    ///
    /// Panics if `name` or `types` contains an embedded NUL byte.
    #[must_use]
    pub fn unregistered(name: &str, types: Option<&str>) -> Selector {
        let arena = global_arena();
        let entry: &'static SelEntry = arena.alloc(SelEntry {
            index: AtomicUsize::new(0),
            name: AtomicPtr::new(arena.alloc_cstr(name).as_ptr()),
            types: types.map_or(std::ptr::null(), |t| {
                arena.alloc_cstr(t).as_ptr().cast_const()
            }),
            next: AtomicPtr::new(std::ptr::null_mut()),
        });
        Selector {
            entry: NonNull::from(entry),
        }
    }

    /// Whether the handle has been registered (tests the index-word tag).
    #[must_use]
    pub fn is_registered(self) -> bool {
        // SAFETY: entries are arena-immortal.
        let word = unsafe { self.entry.as_ref() }.index.load(Ordering::Acquire);
        word & REGISTERED_TAG != 0
    }

    /// The selector's dispatch table, registering the handle on demand.
    pub(crate) fn dtable(self) -> &'static SelDtable {
        register_in_place(self).dtable_unchecked()
    }

    /// Reads the embedded dtable of an already-registered selector.
    fn dtable_unchecked(self) -> &'static SelDtable {
        // SAFETY: entries are arena-immortal.
        let word = unsafe { self.entry.as_ref() }.index.load(Ordering::Acquire);
        debug_assert!(word & REGISTERED_TAG != 0);
        // SAFETY: registered index words always embed a valid dtable
        // address under the tag bit.
        unsafe { &*((word & !REGISTERED_TAG) as *const SelDtable) }
    }

    /// Dispatch index. Typed variants share their untyped peer's index
    /// unless type-dependent dispatch is enabled. Registers the handle on
    /// demand.
    #[must_use]
    pub fn index(self) -> u32 {
        self.dtable().index()
    }

    /// Selector name.
    ///
    /// Registered selectors read the canonical copy anchoring their
    /// dtable's type list; unregistered handles report their own.
    #[must_use]
    pub fn name(self) -> &'static str {
        if self.is_registered() {
            return self.dtable_unchecked().name();
        }
        // SAFETY: entries are arena-immortal.
        unsafe { self.entry.as_ref() }.name_str()
    }

    /// Type encoding, `None` for the untyped peer.
    #[must_use]
    pub fn types(self) -> Option<&'static str> {
        // SAFETY: entries are arena-immortal.
        unsafe { self.entry.as_ref() }.types_str()
    }

    /// The untyped peer: the selector with this name and no encoding.
    #[must_use]
    pub fn untyped(self) -> Selector {
        if self.types().is_none() && self.is_registered() {
            return self;
        }
        Selector::register(self.name(), None)
    }

    /// Dispatch-level equality: pointer-equal handles match, otherwise
    /// names are compared; with type-dependent dispatch an absent encoding
    /// matches any encoding and present ones must be equivalent.
    #[must_use]
    pub fn matches(self, other: Selector) -> bool {
        if self == other {
            return true;
        }
        if self.name() != other.name() {
            return false;
        }
        if cfg!(feature = "type-dependent-dispatch") {
            match (self.types(), other.types()) {
                (Some(a), Some(b)) => encoding::types_equal(Some(a), Some(b)),
                _ => true,
            }
        } else {
            true
        }
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.entry.as_ptr(), other.entry.as_ptr())
    }
}

impl Eq for Selector {}

impl Hash for Selector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.entry.as_ptr().addr());
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("name", &self.name())
            .field("types", &self.types())
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Every type encoding registered for `name`, in no particular order.
#[must_use]
pub fn types_for_name(name: &str) -> Vec<&'static str> {
    let untyped = {
        let guard = table().read().unwrap();
        lookup_locked(&guard, name, None)
    };
    untyped.map_or_else(Vec::new, |u| u.dtable_unchecked().type_encodings())
}

/// Every registered typed variant of `name`.
#[must_use]
pub fn typed_variants_of(name: &str) -> Vec<Selector> {
    types_for_name(name)
        .into_iter()
        .map(|t| Selector::register(name, Some(t)))
        .collect()
}

/// Number of selectors registered so far (typed variants count separately).
#[must_use]
pub fn registered_count() -> u32 {
    let guard = table().read().unwrap();
    u32::try_from(guard.by_index.len() - 1).unwrap_or(u32::MAX)
}
