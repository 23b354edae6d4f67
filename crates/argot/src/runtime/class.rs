//! Class records and the class registry.
//!
//! The dispatch core reads and writes only a narrow strip of each class:
//! the superclass link, the metaclass (`isa`), a flag word, the dtable
//! installation state, and the chain of registered method lists. Class
//! storage itself is arena-allocated and immortal; the host runtime owns
//! identity and layout beyond that.
//!
//! A class record begins with its `isa` pointer, so a `Class` is itself a
//! valid message receiver: sending to a class dispatches through its
//! metaclass, which is how class methods (including `initialize`) resolve.
//!
//! # Thread Safety
//!
//! The registry is guarded by an `RwLock`; flag and state words are atomics.
//! Structural fields (`isa`, `super_class`, name) never change after the
//! class is published.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};

use argot_mem::{Arena, global_arena};
use bitflags::bitflags;
use fxhash::FxHashMap;

use crate::error::{Error, Result};
use crate::runtime::method::MethodList;
use crate::runtime::object::Id;

bitflags! {
    /// Per-class flag word, updated atomically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// The class is a metaclass.
        const META = 1 << 0;
        /// The class record has been resolved by the loader callback.
        const RESOLVED = 1 << 1;
        /// Initialization has begun (set when the initializer starts, not
        /// when it finishes).
        const INITIALIZED = 1 << 2;
        /// Instances may take the fast refcount path.
        const FAST_REFCOUNT = 1 << 3;
    }
}

/// Observable installation state of a class's dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtableState {
    /// No dtable yet; the first message will drive initialization.
    Uninstalled,
    /// The class's initializer is running on some thread.
    Initializing,
    /// Method bindings are published and initialization has completed (or
    /// needed no initializer).
    Installed,
}

const STATE_UNINSTALLED: usize = 0;
const STATE_INSTALLED: usize = 1;
const STATE_INITIALIZING: usize = 2;

/// Class record as the dispatch core sees it.
#[repr(C)]
pub(crate) struct ClassInner {
    /// Metaclass pointer. First field: a class pointer doubles as an object
    /// header, which is what makes class messages work.
    isa: *const ClassInner,
    super_class: *const ClassInner,
    name: *const u8,
    flags: AtomicU32,
    dtable_state: AtomicUsize,
    methods: AtomicPtr<MethodList>,
}

// SAFETY: structural fields are immutable after publication; the rest are
// atomics. All pointed-to storage is arena-immortal.
unsafe impl Send for ClassInner {}
unsafe impl Sync for ClassInner {}

impl ClassInner {
    pub(crate) fn super_ptr(&self) -> *const ClassInner {
        self.super_class
    }
}

/// Handle to a registered class.
///
/// Copyable pointer-identity handle; two handles are equal exactly when they
/// designate the same class record.
#[derive(Clone, Copy)]
pub struct Class {
    pub(crate) inner: NonNull<ClassInner>,
}

// SAFETY: ClassInner is Send + Sync and immortal.
unsafe impl Send for Class {}
unsafe impl Sync for Class {}

/// Pointer wrapper so the registry map is Send + Sync.
#[derive(Clone, Copy)]
struct ClassPtr(NonNull<ClassInner>);
// SAFETY: see Class.
unsafe impl Send for ClassPtr {}
unsafe impl Sync for ClassPtr {}

/// Name-keyed class registry.
static REGISTRY: OnceLock<RwLock<FxHashMap<&'static str, ClassPtr>>> = OnceLock::new();

fn registry() -> &'static RwLock<FxHashMap<&'static str, ClassPtr>> {
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

impl Class {
    /// Creates and registers a root class (no superclass).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn new_root(name: &str) -> Result<Class> {
        Self::create(name, None)
    }

    /// Creates and registers a subclass of `superclass`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn new(name: &str, superclass: Class) -> Result<Class> {
        Self::create(name, Some(superclass))
    }

    fn create(name: &str, superclass: Option<Class>) -> Result<Class> {
        let mut classes = registry().write().unwrap();
        if classes.contains_key(name) {
            return Err(Error::ClassAlreadyExists {
                name: name.to_string(),
            });
        }

        let arena = global_arena();
        let name_ptr = arena.alloc_cstr(name);
        let super_ptr = superclass.map_or(std::ptr::null(), |s| {
            s.inner.as_ptr().cast_const()
        });

        // Converted to raw pointers immediately; the records are patched
        // and published through those, never through the references.
        let class_inner: *mut ClassInner = arena.alloc(ClassInner {
            isa: std::ptr::null(),
            super_class: super_ptr,
            name: name_ptr.as_ptr(),
            flags: AtomicU32::new(ClassFlags::RESOLVED.bits()),
            dtable_state: AtomicUsize::new(STATE_UNINSTALLED),
            methods: AtomicPtr::new(std::ptr::null_mut()),
        });

        // The metaclass supers to the superclass's metaclass; a root
        // metaclass supers to the class itself so class messages fall back
        // to the root's instance methods.
        let meta_super = superclass.map_or(class_inner.cast_const(), |s| {
            s.metaclass().inner.as_ptr().cast_const()
        });
        let meta_inner: *mut ClassInner = arena.alloc(ClassInner {
            isa: std::ptr::null(),
            super_class: meta_super,
            name: name_ptr.as_ptr(),
            flags: AtomicU32::new((ClassFlags::META | ClassFlags::RESOLVED).bits()),
            dtable_state: AtomicUsize::new(STATE_UNINSTALLED),
            methods: AtomicPtr::new(std::ptr::null_mut()),
        });

        // Metaclasses are instances of the root metaclass; the root
        // metaclass is an instance of itself.
        let root_meta = superclass.map_or(meta_inner.cast_const(), |s| {
            let mut root = s;
            while let Some(sup) = root.superclass() {
                root = sup;
            }
            root.metaclass().inner.as_ptr().cast_const()
        });
        // SAFETY: both records are freshly allocated and not yet published.
        unsafe {
            (*meta_inner).isa = root_meta;
            (*class_inner).isa = meta_inner.cast_const();
        }

        // SAFETY: arena allocations are never null.
        let handle = Class {
            inner: unsafe { NonNull::new_unchecked(class_inner) },
        };
        // SAFETY: name_ptr came from alloc_cstr on the global arena.
        let key = unsafe { Arena::cstr_to_str(name_ptr) };
        classes.insert(key, ClassPtr(handle.inner));
        Ok(handle)
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        // SAFETY: name always comes from alloc_cstr and is immortal.
        unsafe {
            Arena::cstr_to_str(NonNull::new_unchecked(
                self.inner.as_ref().name.cast_mut(),
            ))
        }
    }

    /// Superclass, `None` for a root class (or a root metaclass's class).
    #[must_use]
    pub fn superclass(&self) -> Option<Class> {
        // SAFETY: class records are immortal.
        let sup = unsafe { self.inner.as_ref().super_class };
        NonNull::new(sup.cast_mut()).map(|inner| Class { inner })
    }

    /// The class's metaclass. For a metaclass this is the root metaclass.
    #[must_use]
    pub fn metaclass(&self) -> Class {
        // SAFETY: `isa` is patched before the class is published and records
        // are immortal.
        let isa = unsafe { self.inner.as_ref().isa };
        debug_assert!(!isa.is_null());
        // SAFETY: checked above; metaclasses are created with every class.
        Class {
            inner: unsafe { NonNull::new_unchecked(isa.cast_mut()) },
        }
    }

    /// Whether this record is a metaclass.
    #[must_use]
    pub fn is_metaclass(&self) -> bool {
        self.test_flag(ClassFlags::META)
    }

    /// Treats the class record as a message receiver.
    #[must_use]
    pub fn as_id(&self) -> Id {
        // A ClassInner starts with its isa pointer, exactly like an object
        // header.
        self.inner.as_ptr().cast()
    }

    pub(crate) fn test_flag(&self, flag: ClassFlags) -> bool {
        // SAFETY: records are immortal.
        let bits = unsafe { self.inner.as_ref().flags.load(Ordering::Acquire) };
        bits & flag.bits() != 0
    }

    pub(crate) fn set_flag(&self, flag: ClassFlags) {
        // SAFETY: records are immortal.
        unsafe {
            self.inner
                .as_ref()
                .flags
                .fetch_or(flag.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn clear_flag(&self, flag: ClassFlags) {
        // SAFETY: records are immortal.
        unsafe {
            self.inner
                .as_ref()
                .flags
                .fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    /// Whether instances of this class may use the fast refcount path.
    #[must_use]
    pub fn fast_refcount_eligible(&self) -> bool {
        self.test_flag(ClassFlags::FAST_REFCOUNT)
    }

    /// Current dtable installation state.
    #[must_use]
    pub fn dtable_state(&self) -> DtableState {
        // SAFETY: records are immortal.
        match unsafe { self.inner.as_ref().dtable_state.load(Ordering::Acquire) } {
            STATE_INSTALLED => DtableState::Installed,
            STATE_INITIALIZING => DtableState::Initializing,
            _ => DtableState::Uninstalled,
        }
    }

    pub(crate) fn set_dtable_state(&self, state: DtableState) {
        let word = match state {
            DtableState::Uninstalled => STATE_UNINSTALLED,
            DtableState::Installed => STATE_INSTALLED,
            DtableState::Initializing => STATE_INITIALIZING,
        };
        // SAFETY: records are immortal.
        unsafe {
            self.inner.as_ref().dtable_state.store(word, Ordering::Release);
        }
    }

    /// Prepends a method list to the class's chain.
    pub(crate) fn push_method_list(&self, list: &'static MethodList) {
        // SAFETY: records are immortal.
        let head = unsafe { &self.inner.as_ref().methods };
        list.set_next(head.load(Ordering::Acquire));
        head.store(std::ptr::from_ref(list).cast_mut(), Ordering::Release);
    }

    /// Iterates the class's registered method lists, newest first.
    pub(crate) fn method_lists(&self) -> impl Iterator<Item = &'static MethodList> {
        // SAFETY: records are immortal.
        let mut cur = unsafe { self.inner.as_ref().methods.load(Ordering::Acquire) };
        std::iter::from_fn(move || {
            let node = NonNull::new(cur)?;
            // SAFETY: method lists are arena-allocated and immortal.
            let list = unsafe { &*node.as_ptr() };
            cur = list.next();
            Some(list)
        })
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.inner.as_ptr(), other.inner.as_ptr())
    }
}

impl Eq for Class {}

impl std::hash::Hash for Class {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.inner.as_ptr().addr());
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name())
            .field("meta", &self.is_metaclass())
            .field("super", &self.superclass().map(|s| s.name()))
            .finish()
    }
}

/// Looks a class up by name.
#[must_use]
pub fn lookup_class(name: &str) -> Option<Class> {
    let classes = registry().read().unwrap();
    classes.get(name).map(|p| Class { inner: p.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_class() {
        let root = Class::new_root("ClsRoot").unwrap();
        assert_eq!(root.name(), "ClsRoot");
        assert!(root.superclass().is_none());
        assert!(!root.is_metaclass());
        assert_eq!(root.dtable_state(), DtableState::Uninstalled);
    }

    #[test]
    fn test_metaclass_chain() {
        let root = Class::new_root("ClsMetaRoot").unwrap();
        let child = Class::new("ClsMetaChild", root).unwrap();

        let meta_root = root.metaclass();
        let meta_child = child.metaclass();
        assert!(meta_root.is_metaclass());
        assert!(meta_child.is_metaclass());
        assert_eq!(meta_child.name(), "ClsMetaChild");

        // meta(child) supers to meta(root); meta(root) supers to root.
        assert_eq!(meta_child.superclass(), Some(meta_root));
        assert_eq!(meta_root.superclass(), Some(root));
        // Metaclasses are instances of the root metaclass.
        assert_eq!(meta_child.metaclass(), meta_root);
        assert_eq!(meta_root.metaclass(), meta_root);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        Class::new_root("ClsDup").unwrap();
        assert!(matches!(
            Class::new_root("ClsDup"),
            Err(Error::ClassAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_lookup_by_name() {
        let c = Class::new_root("ClsLookup").unwrap();
        assert_eq!(lookup_class("ClsLookup"), Some(c));
        assert_eq!(lookup_class("ClsLookupMissing"), None);
    }

    #[test]
    fn test_flags_are_independent() {
        let c = Class::new_root("ClsFlags").unwrap();
        assert!(!c.test_flag(ClassFlags::INITIALIZED));
        c.set_flag(ClassFlags::INITIALIZED);
        assert!(c.test_flag(ClassFlags::INITIALIZED));
        assert!(!c.test_flag(ClassFlags::FAST_REFCOUNT));
        c.set_flag(ClassFlags::FAST_REFCOUNT);
        c.clear_flag(ClassFlags::FAST_REFCOUNT);
        assert!(c.test_flag(ClassFlags::INITIALIZED));
        assert!(!c.fast_refcount_eligible());
    }

    #[test]
    fn test_class_is_a_receiver() {
        let c = Class::new_root("ClsReceiver").unwrap();
        let id = c.as_id();
        // SAFETY: a class record starts with its isa pointer.
        let isa = unsafe { (*id).isa };
        assert_eq!(isa.cast_mut(), c.metaclass().inner.as_ptr());
    }

    #[test]
    fn test_handle_identity() {
        let a = Class::new_root("ClsIdentA").unwrap();
        let b = Class::new_root("ClsIdentB").unwrap();
        let a2 = lookup_class("ClsIdentA").unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }
}
