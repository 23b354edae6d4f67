//! Per-selector dispatch tables.
//!
//! Every registered selector owns a [`SelDtable`]: a sorted array of
//! `(owner class, slot)` bindings, one per class that defines a method for
//! the selector, plus a small advisory cache of recent lookups. Lookup walks
//! the receiver's superclass chain and binary-searches the array at each
//! level, so the common case (one or two defining classes) touches a single
//! cache line.
//!
//! # Concurrency
//!
//! The read side is lock-free. Slot arrays are published with release
//! stores and never freed — growth allocates a fresh array, copies, and
//! retires the old one in the arena, so a reader that raced the growth keeps
//! walking a stale-but-valid array. Writers (method registration, update,
//! removal) are serialized by the runtime lock; see `runtime::locks`.
//!
//! Mid-mutation readers can observe a transiently duplicated neighbor while
//! an insertion shifts the tail. The array stays sorted (non-strictly) and
//! every visible pointer is a valid slot, so binary search still lands on a
//! correct binding or misses a not-yet-published one.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering,
};

use argot_mem::{Arena, global_arena};

use crate::runtime::class::{Class, ClassInner};
use crate::runtime::method::Imp;

/// Number of advisory cache entries per dtable.
pub(crate) const DISPATCH_CACHE_SIZE: usize = 4;

/// Bytes currently sitting in slot arrays, including retired ones.
///
/// Old arrays are never freed while a reader might hold them; this counter
/// is the observability knob for that policy.
static DTABLE_BYTES: AtomicU64 = AtomicU64::new(0);

/// Total bytes allocated for slot arrays over the process lifetime.
pub(crate) fn dtable_bytes() -> u64 {
    DTABLE_BYTES.load(Ordering::Relaxed)
}

/// One node in a selector's type-encoding list.
///
/// The list is anchored inside the dtable: the anchor node carries the
/// selector name, each later node carries one registered type encoding.
#[repr(C)]
pub(crate) struct TypeListNode {
    value: AtomicPtr<u8>,
    next: AtomicPtr<TypeListNode>,
}

/// A single advisory cache line: the most recent `(class, imp)` resolutions
/// on this dtable.
#[repr(C)]
struct CacheEntry {
    class: AtomicPtr<ClassInner>,
    imp: AtomicPtr<()>,
    version: AtomicU64,
}

impl CacheEntry {
    const fn empty() -> Self {
        CacheEntry {
            class: AtomicPtr::new(std::ptr::null_mut()),
            imp: AtomicPtr::new(std::ptr::null_mut()),
            version: AtomicU64::new(0),
        }
    }
}

/// A `(class, selector)` method binding with a stable address.
///
/// Slots are arena-allocated and live for the rest of the process, so
/// callers may hold a raw reference across calls and revalidate it by
/// comparing [`Slot::version`]. `owner` never changes; the implementation
/// and its encoding are replaced in place when a method is redefined, and
/// every replacement bumps the version.
#[repr(C)]
pub struct Slot {
    owner: *const ClassInner,
    /// Receiver class this slot was last cached for. Maintained for
    /// call-site caches; the core never reads it back.
    cached_for: AtomicPtr<ClassInner>,
    types: AtomicPtr<u8>,
    version: AtomicU64,
    method: AtomicPtr<()>,
}

// SAFETY: all mutable fields are atomics and `owner` is written once before
// the slot is published.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    /// Allocates a slot for `(owner, imp, types)` in the global arena.
    pub(crate) fn new_in_arena(
        owner: *const ClassInner,
        imp: Imp,
        types: *const u8,
    ) -> &'static Slot {
        global_arena().alloc(Slot {
            owner,
            cached_for: AtomicPtr::new(std::ptr::null_mut()),
            types: AtomicPtr::new(types.cast_mut()),
            version: AtomicU64::new(1),
            method: AtomicPtr::new(imp as *mut ()),
        })
    }

    /// Allocates an ownerless slot wrapping `imp`, for forward hooks that
    /// fabricate a landing site for unresolved sends.
    #[must_use]
    pub fn forwarding(imp: Imp) -> &'static Slot {
        global_arena().alloc(Slot::ownerless(imp))
    }

    /// Builds a slot with no owner, used for the shared nil-receiver and
    /// forwarding slots.
    pub(crate) fn ownerless(imp: Imp) -> Slot {
        Slot {
            owner: std::ptr::null(),
            cached_for: AtomicPtr::new(std::ptr::null_mut()),
            types: AtomicPtr::new(std::ptr::null_mut()),
            version: AtomicU64::new(1),
            method: AtomicPtr::new(imp as *mut ()),
        }
    }

    /// The class that defines this binding, `None` for the shared
    /// nil/forwarding slots.
    #[must_use]
    pub fn owner(&self) -> Option<Class> {
        NonNull::new(self.owner.cast_mut()).map(|inner| Class { inner })
    }

    /// Current implementation pointer.
    #[must_use]
    pub fn imp(&self) -> Imp {
        let raw = self.method.load(Ordering::Acquire);
        debug_assert!(!raw.is_null());
        // SAFETY: `method` is only ever written from a valid `Imp`.
        unsafe { std::mem::transmute::<*mut (), Imp>(raw) }
    }

    /// Type encoding the implementation was registered with.
    #[must_use]
    pub fn types(&self) -> Option<&'static str> {
        let raw = self.types.load(Ordering::Acquire);
        // SAFETY: non-null `types` pointers always come from `alloc_cstr`
        // on the global arena.
        NonNull::new(raw).map(|p| unsafe { Arena::cstr_to_str(p) })
    }

    /// Replacement counter; bumped every time the implementation changes.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Replaces the implementation in place and advances the version.
    pub(crate) fn replace(&self, imp: Imp, types: *const u8) {
        self.types.store(types.cast_mut(), Ordering::Release);
        self.method.store(imp as *mut (), Ordering::Release);
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// Sorted slot array: a fixed header followed by `capacity` atomic slot
/// pointers. Entries below `len` are always valid published slots.
#[repr(C, align(8))]
struct SlotArray {
    capacity: u32,
    len: AtomicU32,
    // `capacity` AtomicPtr<Slot> entries follow the header.
}

impl SlotArray {
    fn alloc(capacity: u32) -> NonNull<SlotArray> {
        let bytes = std::mem::size_of::<SlotArray>()
            + std::mem::size_of::<AtomicPtr<Slot>>() * capacity as usize;
        // SAFETY: size is small and non-zero, alignment is that of the
        // header which also satisfies the entries.
        let layout = unsafe {
            Layout::from_size_align_unchecked(bytes, std::mem::align_of::<SlotArray>())
        };
        let raw = global_arena().alloc_raw(layout).cast::<SlotArray>();
        DTABLE_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
        // SAFETY: raw points at freshly allocated, properly aligned memory
        // large enough for the header and `capacity` entries.
        unsafe {
            raw.as_ptr().write(SlotArray {
                capacity,
                len: AtomicU32::new(0),
            });
            let entries = raw.as_ptr().add(1).cast::<AtomicPtr<Slot>>();
            for i in 0..capacity as usize {
                entries.add(i).write(AtomicPtr::new(std::ptr::null_mut()));
            }
        }
        raw
    }

    fn entries(&self) -> &[AtomicPtr<Slot>] {
        // SAFETY: `capacity` entries were initialized directly after the
        // header in `alloc` and the array is never freed.
        unsafe {
            let base = std::ptr::from_ref(self).add(1).cast::<AtomicPtr<Slot>>();
            std::slice::from_raw_parts(base, self.capacity as usize)
        }
    }
}

/// Dispatch table for one registered selector.
#[repr(C)]
pub(crate) struct SelDtable {
    entries: [CacheEntry; DISPATCH_CACHE_SIZE],
    cache_lock: AtomicBool,
    cache_cursor: AtomicU8,
    index: u32,
    slots: AtomicPtr<SlotArray>,
    type_list: TypeListNode,
}

// SAFETY: every field is either immutable after construction (`index`) or
// atomic; the slot arrays and list nodes it points to are arena-immortal.
unsafe impl Send for SelDtable {}
unsafe impl Sync for SelDtable {}

impl SelDtable {
    /// Allocates the dtable for a fresh selector registration. `name` is the
    /// canonical selector name and becomes the type-list anchor.
    pub(crate) fn new_in_arena(index: u32, name: NonNull<u8>) -> &'static SelDtable {
        global_arena().alloc(SelDtable {
            entries: [
                CacheEntry::empty(),
                CacheEntry::empty(),
                CacheEntry::empty(),
                CacheEntry::empty(),
            ],
            cache_lock: AtomicBool::new(false),
            cache_cursor: AtomicU8::new(0),
            index,
            slots: AtomicPtr::new(std::ptr::null_mut()),
            type_list: TypeListNode {
                value: AtomicPtr::new(name.as_ptr()),
                next: AtomicPtr::new(std::ptr::null_mut()),
            },
        })
    }

    /// Dispatch index shared by all type variants of a name (unless
    /// type-dependent dispatch is enabled).
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Canonical selector name (the type-list anchor value).
    pub(crate) fn name(&self) -> &'static str {
        let raw = self.type_list.value.load(Ordering::Acquire);
        debug_assert!(!raw.is_null());
        // SAFETY: the anchor always holds an `alloc_cstr` pointer.
        unsafe { Arena::cstr_to_str(NonNull::new_unchecked(raw)) }
    }

    /// Appends a type encoding to this selector's type list. Callers hold
    /// the selector-table lock.
    pub(crate) fn push_type(&self, types: NonNull<u8>) {
        let node = global_arena().alloc(TypeListNode {
            value: AtomicPtr::new(types.as_ptr()),
            next: AtomicPtr::new(self.type_list.next.load(Ordering::Relaxed)),
        });
        self.type_list.next.store(node, Ordering::Release);
    }

    /// Every type encoding registered for this selector's name, skipping the
    /// name anchor.
    pub(crate) fn type_encodings(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut cur = self.type_list.next.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(cur) {
            // SAFETY: nodes are arena-allocated and immortal.
            let node = unsafe { node.as_ref() };
            let value = node.value.load(Ordering::Acquire);
            if let Some(p) = NonNull::new(value) {
                // SAFETY: list values always come from `alloc_cstr`.
                out.push(unsafe { Arena::cstr_to_str(p) });
            }
            cur = node.next.load(Ordering::Acquire);
        }
        out
    }

    /// Binary-searches one class level.
    fn search(&self, cls: *const ClassInner) -> Option<&'static Slot> {
        let arr = NonNull::new(self.slots.load(Ordering::Acquire))?;
        // SAFETY: published slot arrays are immortal.
        let arr = unsafe { arr.as_ref() };
        let len = arr.len.load(Ordering::Acquire) as usize;
        let entries = arr.entries();

        let mut beg: isize = 0;
        let mut end: isize = len as isize - 1;
        while beg <= end {
            let mid = beg + ((end - beg) >> 1);
            let slot_ptr = entries[mid as usize].load(Ordering::Acquire);
            // SAFETY: entries below `len` always hold published slots.
            let slot = unsafe { &*slot_ptr };
            match (slot.owner as usize).cmp(&(cls as usize)) {
                std::cmp::Ordering::Equal => return Some(slot),
                std::cmp::Ordering::Less => beg = mid + 1,
                std::cmp::Ordering::Greater => end = mid - 1,
            }
        }
        None
    }

    /// Walks `cls` and its superclass chain, returning the binding of the
    /// nearest defining class.
    pub(crate) fn lookup(&self, mut cls: *const ClassInner) -> Option<&'static Slot> {
        while !cls.is_null() {
            if let Some(slot) = self.search(cls) {
                return Some(slot);
            }
            // SAFETY: cls is a registered class; classes are immortal.
            cls = unsafe { (*cls).super_ptr() };
        }
        None
    }

    /// Installs `(cls -> imp)` into the sorted array.
    ///
    /// If `cls` already owns a slot, the implementation is replaced in place
    /// when `replace` is set and left alone otherwise. The caller holds the
    /// runtime lock; readers are never blocked.
    pub(crate) fn insert(
        &self,
        cls: *const ClassInner,
        imp: Imp,
        types: *const u8,
        replace: bool,
    ) {
        let mut arr_ptr = self.slots.load(Ordering::Relaxed);
        let needs_grow = match NonNull::new(arr_ptr) {
            None => true,
            // SAFETY: published arrays are immortal.
            Some(arr) => unsafe {
                let arr = arr.as_ref();
                arr.len.load(Ordering::Relaxed) + 1 >= arr.capacity
            },
        };
        if needs_grow {
            arr_ptr = self.grow(arr_ptr).as_ptr();
        }
        // SAFETY: arr_ptr is non-null after the growth check.
        let arr = unsafe { &*arr_ptr };
        let entries = arr.entries();
        let len = arr.len.load(Ordering::Relaxed) as usize;

        // A class appears at most once; scan is linear because dtables are
        // small and writes are rare.
        for entry in entries.iter().take(len) {
            let slot_ptr = entry.load(Ordering::Relaxed);
            // SAFETY: entries below len hold published slots.
            let slot = unsafe { &*slot_ptr };
            if slot.owner == cls {
                if replace {
                    slot.replace(imp, types);
                }
                self.clear_cache();
                return;
            }
        }

        let slot = Slot::new_in_arena(cls, imp, types);
        let slot_ptr: *const Slot = slot;
        if len == 0 {
            entries[0].store(slot_ptr.cast_mut(), Ordering::Release);
            arr.len.store(1, Ordering::Release);
        } else {
            // SAFETY: len > 0, so the tail entry is published.
            let tail = unsafe { &*entries[len - 1].load(Ordering::Relaxed) };
            if (cls as usize) > (tail.owner as usize) {
                // Methods usually register in ascending class-address order,
                // so appending is the hot case.
                entries[len].store(slot_ptr.cast_mut(), Ordering::Release);
                arr.len.store(len as u32 + 1, Ordering::Release);
            } else {
                entries[len].store(
                    entries[len - 1].load(Ordering::Relaxed),
                    Ordering::Release,
                );
                arr.len.store(len as u32 + 1, Ordering::Release);
                let mut hole = len - 1;
                while hole > 0 {
                    let below = entries[hole - 1].load(Ordering::Relaxed);
                    // SAFETY: entries below the hole hold published slots.
                    if unsafe { (*below).owner as usize } > cls as usize {
                        entries[hole].store(below, Ordering::Release);
                        hole -= 1;
                    } else {
                        break;
                    }
                }
                entries[hole].store(slot_ptr.cast_mut(), Ordering::Release);
            }
        }
        self.clear_cache();
    }

    /// Allocates a doubled array, copies the live prefix, and publishes it.
    /// The old array is retired, never freed.
    fn grow(&self, old: *mut SlotArray) -> NonNull<SlotArray> {
        let (old_len, new_cap) = match NonNull::new(old) {
            None => (0, 2),
            // SAFETY: published arrays are immortal.
            Some(arr) => unsafe {
                let arr = arr.as_ref();
                (arr.len.load(Ordering::Relaxed), arr.capacity << 1)
            },
        };
        let fresh = SlotArray::alloc(new_cap);
        // SAFETY: fresh was just allocated with capacity >= old_len.
        let fresh_ref = unsafe { fresh.as_ref() };
        if old_len > 0 {
            // SAFETY: old is non-null when old_len > 0.
            let old_entries = unsafe { (*old).entries() };
            let new_entries = fresh_ref.entries();
            for i in 0..old_len as usize {
                new_entries[i]
                    .store(old_entries[i].load(Ordering::Relaxed), Ordering::Relaxed);
            }
            fresh_ref.len.store(old_len, Ordering::Relaxed);
        }
        self.slots.store(fresh.as_ptr(), Ordering::Release);
        fresh
    }

    /// Replaces the implementation on any slot owned by `cls`, bumping its
    /// version. Missing bindings are not created. Caller holds the runtime
    /// lock.
    pub(crate) fn update(&self, cls: *const ClassInner, imp: Imp, types: *const u8) {
        if let Some(arr) = NonNull::new(self.slots.load(Ordering::Acquire)) {
            // SAFETY: published arrays are immortal.
            let arr = unsafe { arr.as_ref() };
            let len = arr.len.load(Ordering::Relaxed) as usize;
            for entry in arr.entries().iter().take(len) {
                // SAFETY: entries below len hold published slots.
                let slot = unsafe { &*entry.load(Ordering::Relaxed) };
                if slot.owner == cls {
                    slot.replace(imp, types);
                }
            }
        }
        self.clear_cache();
    }

    /// Removes any binding owned by `cls`, shifting the tail left. Caller
    /// holds the runtime lock.
    pub(crate) fn remove(&self, cls: *const ClassInner) {
        if let Some(arr) = NonNull::new(self.slots.load(Ordering::Acquire)) {
            // SAFETY: published arrays are immortal.
            let arr = unsafe { arr.as_ref() };
            let entries = arr.entries();
            let mut len = arr.len.load(Ordering::Relaxed) as usize;
            let mut i = 0;
            while i < len {
                // SAFETY: entries below len hold published slots.
                let slot = unsafe { &*entries[i].load(Ordering::Relaxed) };
                if slot.owner == cls {
                    for j in (i + 1)..len {
                        entries[j - 1]
                            .store(entries[j].load(Ordering::Relaxed), Ordering::Release);
                    }
                    len -= 1;
                    arr.len.store(len as u32, Ordering::Release);
                } else {
                    i += 1;
                }
            }
        }
        self.clear_cache();
    }

    /// Number of classes currently defining this selector.
    #[cfg(test)]
    pub(crate) fn binding_count(&self) -> usize {
        match NonNull::new(self.slots.load(Ordering::Acquire)) {
            None => 0,
            // SAFETY: published arrays are immortal.
            Some(arr) => unsafe { arr.as_ref().len.load(Ordering::Acquire) as usize },
        }
    }

    fn spin_lock(&self) {
        loop {
            while self.cache_lock.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            if !self.cache_lock.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn spin_unlock(&self) {
        self.cache_lock.store(false, Ordering::Release);
    }

    /// Zeroes the advisory cache.
    pub(crate) fn clear_cache(&self) {
        self.spin_lock();
        self.cache_cursor.store(0, Ordering::Relaxed);
        for entry in &self.entries {
            entry.class.store(std::ptr::null_mut(), Ordering::Release);
            entry.imp.store(std::ptr::null_mut(), Ordering::Relaxed);
            entry.version.store(0, Ordering::Relaxed);
        }
        self.spin_unlock();
    }

    /// Best-effort write-through after a successful lookup. Skipped entirely
    /// when the spinflag is contended; the cache is advisory.
    pub(crate) fn cache_store(&self, cls: *const ClassInner, slot: &Slot) {
        if self.cache_lock.swap(true, Ordering::AcqRel) {
            return;
        }
        let cursor = self.cache_cursor.load(Ordering::Relaxed);
        self.cache_cursor.store(cursor.wrapping_add(1), Ordering::Relaxed);
        let entry = &self.entries[cursor as usize % DISPATCH_CACHE_SIZE];
        // Invalidate before rewriting so a racing probe never pairs the old
        // class with the new imp.
        entry.class.store(std::ptr::null_mut(), Ordering::Release);
        entry.imp.store(slot.method.load(Ordering::Acquire), Ordering::Relaxed);
        entry.version.store(slot.version(), Ordering::Relaxed);
        entry.class.store(cls.cast_mut(), Ordering::Release);
        slot.cached_for.store(cls.cast_mut(), Ordering::Relaxed);
        self.spin_unlock();
    }

    /// Probes the advisory cache. Consumers must treat a hit as a hint and
    /// revalidate against the slot array or the version counter.
    pub(crate) fn cache_probe(&self, cls: *const ClassInner) -> Option<(Imp, u64)> {
        for entry in &self.entries {
            if std::ptr::eq(entry.class.load(Ordering::Acquire).cast_const(), cls) {
                let raw = entry.imp.load(Ordering::Acquire);
                if !raw.is_null() {
                    // SAFETY: `imp` is only written from valid `Imp` values.
                    let imp = unsafe { std::mem::transmute::<*mut (), Imp>(raw) };
                    return Some((imp, entry.version.load(Ordering::Acquire)));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::Class;
    use crate::runtime::object::Id;
    use crate::runtime::selector::Selector;

    unsafe extern "C" fn noop_imp(
        _receiver: Id,
        _sel: Selector,
        _args: *const *mut u8,
        _ret: *mut u8,
    ) {
    }

    fn fresh_dtable(tag: &str) -> &'static SelDtable {
        let name = global_arena().alloc_cstr(tag);
        SelDtable::new_in_arena(7, name)
    }

    fn classes(prefix: &str, n: usize) -> Vec<Class> {
        (0..n)
            .map(|i| Class::new_root(&format!("{prefix}_{i}")).unwrap())
            .collect()
    }

    fn owners(dt: &SelDtable) -> Vec<usize> {
        let arr = NonNull::new(dt.slots.load(Ordering::Acquire)).unwrap();
        // SAFETY: published arrays are immortal.
        let arr = unsafe { arr.as_ref() };
        let len = arr.len.load(Ordering::Acquire) as usize;
        arr.entries()
            .iter()
            .take(len)
            // SAFETY: entries below len hold published slots.
            .map(|e| unsafe { (*e.load(Ordering::Acquire)).owner as usize })
            .collect()
    }

    fn types_ptr() -> *const u8 {
        global_arena().alloc_cstr("v@:").as_ptr()
    }

    #[test]
    fn test_insert_keeps_sorted_order_any_insertion_order() {
        let dt = fresh_dtable("dtSorted");
        let mut cls = classes("DtSorted", 9);
        // Insert in a deliberately scrambled order.
        cls.sort_by_key(|c| c.inner.as_ptr().addr().wrapping_mul(2_654_435_761));
        for c in &cls {
            dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        }
        let got = owners(dt);
        assert_eq!(got.len(), 9);
        for w in got.windows(2) {
            assert!(w[0] < w[1], "owners must be strictly ascending: {got:?}");
        }
    }

    #[test]
    fn test_insert_is_idempotent_per_class() {
        let dt = fresh_dtable("dtIdem");
        let c = Class::new_root("DtIdem_A").unwrap();
        dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), true);
        assert_eq!(dt.binding_count(), 1);
    }

    #[test]
    fn test_replace_bumps_version_in_place() {
        unsafe extern "C" fn other_imp(
            _receiver: Id,
            _sel: Selector,
            _args: *const *mut u8,
            ret: *mut u8,
        ) {
            // SAFETY: dispatch hands every imp a 16-byte return buffer.
            unsafe { ret.cast::<usize>().write_unaligned(9) };
        }

        let dt = fresh_dtable("dtReplace");
        let c = Class::new_root("DtReplace_A").unwrap();
        dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), true);
        let slot = dt.lookup(c.inner.as_ptr()).unwrap();
        let before = slot.version();
        let addr_before = std::ptr::from_ref(slot).addr();

        dt.insert(c.inner.as_ptr(), other_imp, types_ptr(), true);
        let slot2 = dt.lookup(c.inner.as_ptr()).unwrap();
        assert_eq!(std::ptr::from_ref(slot2).addr(), addr_before);
        assert_eq!(slot2.version(), before + 1);
        assert_eq!(slot2.imp() as usize, other_imp as usize);

        // replace = false must leave the binding untouched.
        dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        assert_eq!(slot2.version(), before + 1);
    }

    #[test]
    fn test_lookup_walks_superclass_chain() {
        let dt = fresh_dtable("dtChain");
        let root = Class::new_root("DtChain_Root").unwrap();
        let mid = Class::new("DtChain_Mid", root).unwrap();
        let leaf = Class::new("DtChain_Leaf", mid).unwrap();

        dt.insert(root.inner.as_ptr(), noop_imp, types_ptr(), false);
        let slot = dt.lookup(leaf.inner.as_ptr()).unwrap();
        assert_eq!(slot.owner(), Some(root));

        // An override on the middle class shadows the root for the leaf.
        dt.insert(mid.inner.as_ptr(), noop_imp, types_ptr(), false);
        let slot = dt.lookup(leaf.inner.as_ptr()).unwrap();
        assert_eq!(slot.owner(), Some(mid));
        // The root still resolves to its own binding.
        let slot = dt.lookup(root.inner.as_ptr()).unwrap();
        assert_eq!(slot.owner(), Some(root));
    }

    #[test]
    fn test_remove_shifts_tail() {
        let dt = fresh_dtable("dtRemove");
        let cls = classes("DtRemove", 5);
        for c in &cls {
            dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        }
        let victim = cls[2];
        dt.remove(victim.inner.as_ptr());
        assert_eq!(dt.binding_count(), 4);
        assert!(dt.lookup(victim.inner.as_ptr()).is_none());
        let got = owners(dt);
        for w in got.windows(2) {
            assert!(w[0] < w[1]);
        }
        // Removing an absent class is a no-op.
        dt.remove(victim.inner.as_ptr());
        assert_eq!(dt.binding_count(), 4);
    }

    #[test]
    fn test_cache_round_robin_and_clear() {
        let dt = fresh_dtable("dtCache");
        let cls = classes("DtCache", 6);
        for c in &cls {
            dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        }
        for c in &cls {
            let slot = dt.lookup(c.inner.as_ptr()).unwrap();
            dt.cache_store(c.inner.as_ptr(), slot);
        }
        // Only the last K lookups can be cached.
        let hits = cls
            .iter()
            .filter(|c| dt.cache_probe(c.inner.as_ptr()).is_some())
            .count();
        assert!(hits <= DISPATCH_CACHE_SIZE);
        assert!(dt.cache_probe(cls[5].inner.as_ptr()).is_some());

        dt.clear_cache();
        for c in &cls {
            assert!(dt.cache_probe(c.inner.as_ptr()).is_none());
        }
    }

    #[test]
    fn test_insert_invalidates_cache() {
        let dt = fresh_dtable("dtInval");
        let c = Class::new_root("DtInval_A").unwrap();
        dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        let slot = dt.lookup(c.inner.as_ptr()).unwrap();
        dt.cache_store(c.inner.as_ptr(), slot);
        assert!(dt.cache_probe(c.inner.as_ptr()).is_some());

        let other = Class::new_root("DtInval_B").unwrap();
        dt.insert(other.inner.as_ptr(), noop_imp, types_ptr(), false);
        assert!(dt.cache_probe(c.inner.as_ptr()).is_none());
    }

    #[test]
    fn test_growth_retires_bytes() {
        let before = dtable_bytes();
        let dt = fresh_dtable("dtGrow");
        let cls = classes("DtGrow", 17);
        for c in &cls {
            dt.insert(c.inner.as_ptr(), noop_imp, types_ptr(), false);
        }
        assert_eq!(dt.binding_count(), 17);
        assert!(dtable_bytes() > before);
    }

    #[test]
    fn test_type_list() {
        let dt = fresh_dtable("dtTypes");
        assert_eq!(dt.name(), "dtTypes");
        assert!(dt.type_encodings().is_empty());
        dt.push_type(global_arena().alloc_cstr("v@:"));
        dt.push_type(global_arena().alloc_cstr("i@:"));
        let mut types = dt.type_encodings();
        types.sort_unstable();
        assert_eq!(types, vec!["i@:", "v@:"]);
    }
}
