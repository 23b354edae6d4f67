//! Methods, method lists, and method administration.
//!
//! Hosts describe methods with [`MethodDesc`] (borrowed name, encoding, and
//! implementation). Registration interns the selector, copies the strings
//! into the arena, and attaches an immortal [`MethodList`] to the class.
//! Every binding is installed twice: once under the typed selector and once
//! under its untyped peer, so senders that only know the name still resolve.
//!
//! All dtable mutation here happens under the runtime lock; see
//! `runtime::locks` for the ordering rules.

use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, Ordering};

use argot_mem::{Arena, global_arena};

use crate::runtime::class::{Class, ClassFlags};
use crate::runtime::dispatch;
use crate::runtime::locks;
use crate::runtime::object::Id;
use crate::runtime::selector::Selector;

/// Method implementation pointer.
///
/// Arguments beyond the receiver and selector arrive as an array of opaque
/// words; the return value is written through `ret`, which always has at
/// least 16 writable bytes.
pub type Imp = unsafe extern "C" fn(
    receiver: Id,
    sel: Selector,
    args: *const *mut u8,
    ret: *mut u8,
);

/// A method as a host hands it in: not yet interned.
#[derive(Clone, Copy)]
pub struct MethodDesc<'a> {
    /// Selector name, e.g. `"describeWith:"`.
    pub name: &'a str,
    /// Type encoding, e.g. `"v@:@"`.
    pub types: &'a str,
    /// Implementation.
    pub imp: Imp,
}

/// An interned method: registered selector plus arena-owned encoding.
#[repr(C)]
pub struct Method {
    selector: Selector,
    types: NonNull<u8>,
    imp: Imp,
}

// SAFETY: selector handles and arena strings are immortal and immutable.
unsafe impl Send for Method {}
unsafe impl Sync for Method {}

impl Method {
    fn from_desc(desc: &MethodDesc<'_>) -> Method {
        Method {
            selector: Selector::register(desc.name, Some(desc.types)),
            types: global_arena().alloc_cstr(desc.types),
            imp: desc.imp,
        }
    }

    /// The method's typed selector.
    #[must_use]
    pub fn selector(&self) -> Selector {
        self.selector
    }

    /// The method's type encoding.
    #[must_use]
    pub fn types(&self) -> &'static str {
        // SAFETY: `types` comes from alloc_cstr on the global arena.
        unsafe { Arena::cstr_to_str(self.types) }
    }

    /// The implementation pointer.
    #[must_use]
    pub fn imp(&self) -> Imp {
        self.imp
    }

    pub(crate) fn types_ptr(&self) -> *const u8 {
        self.types.as_ptr()
    }
}

/// Arena-allocated batch of methods, chained on the owning class.
#[repr(C)]
pub struct MethodList {
    methods: NonNull<Method>,
    count: usize,
    next: AtomicPtr<MethodList>,
}

// SAFETY: the method array is immortal and immutable; `next` is atomic.
unsafe impl Send for MethodList {}
unsafe impl Sync for MethodList {}

impl MethodList {
    /// Interns `descs` into an immortal list.
    ///
    /// # Panics
    ///
    /// Panics if `descs` is empty.
    fn intern(descs: &[MethodDesc<'_>]) -> &'static MethodList {
        assert!(!descs.is_empty(), "method list must not be empty");
        let arena = global_arena();
        let layout = std::alloc::Layout::array::<Method>(descs.len())
            .expect("method list layout");
        let base = arena.alloc_raw(layout).cast::<Method>();
        for (i, desc) in descs.iter().enumerate() {
            // SAFETY: base has room for descs.len() methods.
            unsafe {
                base.as_ptr().add(i).write(Method::from_desc(desc));
            }
        }
        arena.alloc(MethodList {
            methods: base,
            count: descs.len(),
            next: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    /// The methods in this list.
    #[must_use]
    pub fn methods(&self) -> &'static [Method] {
        // SAFETY: `intern` initialized `count` methods at `methods` and the
        // storage is immortal.
        unsafe { std::slice::from_raw_parts(self.methods.as_ptr(), self.count) }
    }

    pub(crate) fn next(&self) -> *mut MethodList {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut MethodList) {
        self.next.store(next, Ordering::Release);
    }
}

/// Adds a batch of methods to `class`, replacing any existing bindings.
///
/// Each method is installed into the typed selector's dtable and its untyped
/// peer's, and both caches are invalidated. After this returns, lookups on
/// `class` observe the new implementations.
pub fn add_method_list(class: Class, descs: &[MethodDesc<'_>]) {
    let list = MethodList::intern(descs);
    class.push_method_list(list);

    let _rt = locks::lock_runtime();
    for method in list.methods() {
        let typed = method.selector();
        let untyped = typed.untyped();
        let cls = class.inner.as_ptr().cast_const();
        typed
            .dtable()
            .insert(cls, method.imp(), method.types_ptr(), true);
        untyped
            .dtable()
            .insert(cls, method.imp(), method.types_ptr(), true);
    }
    log::debug!(
        "registered {} method(s) on {}{}",
        descs.len(),
        if class.is_metaclass() { "+" } else { "" },
        class.name()
    );
}

/// Inserts every method already attached to `class` into the dispatch
/// tables without replacing existing bindings. Used while initializing a
/// class; the caller holds the runtime lock.
pub(crate) fn register_attached_methods(class: Class) {
    for list in class.method_lists() {
        for method in list.methods() {
            let typed = method.selector();
            let untyped = typed.untyped();
            let cls = class.inner.as_ptr().cast_const();
            typed
                .dtable()
                .insert(cls, method.imp(), method.types_ptr(), false);
            untyped
                .dtable()
                .insert(cls, method.imp(), method.types_ptr(), false);
        }
    }
}

/// Overwrites the implementation of an existing binding in place.
///
/// Both the typed and untyped dtables are updated, versions advance, and
/// the caches clear. A binding that does not exist is not created.
pub fn update_method(class: Class, desc: &MethodDesc<'_>) {
    let _rt = locks::lock_runtime();
    let typed = Selector::register(desc.name, Some(desc.types));
    let types = global_arena().alloc_cstr(desc.types);
    let cls = class.inner.as_ptr().cast_const();
    typed.dtable().update(cls, desc.imp, types.as_ptr());
    typed
        .untyped()
        .dtable()
        .update(cls, desc.imp, types.as_ptr());
}

/// Retracts every binding `class` contributed and clears the caches of each
/// ancestor's dtables, since a cached subclass resolution may now be stale.
pub fn remove_class(class: Class) {
    let _rt = locks::lock_runtime();
    let cls = class.inner.as_ptr().cast_const();
    for list in class.method_lists() {
        for method in list.methods() {
            method.selector().dtable().remove(cls);
            method.selector().untyped().dtable().remove(cls);
        }
    }
    clear_caches_up_chain(class);
}

fn clear_caches_up_chain(class: Class) {
    for list in class.method_lists() {
        for method in list.methods() {
            method.selector().dtable().clear_cache();
            method.selector().untyped().dtable().clear_cache();
        }
    }
    if let Some(sup) = class.superclass() {
        clear_caches_up_chain(sup);
    }
}

/// The refcount-protocol selectors, interned once.
fn refcount_selectors() -> &'static [Selector; 4] {
    static SELS: OnceLock<[Selector; 4]> = OnceLock::new();
    SELS.get_or_init(|| {
        [
            Selector::register("retain", None),
            Selector::register("release", None),
            Selector::register("autorelease", None),
            Selector::register("_ARCCompliantRetainRelease", None),
        ]
    })
}

fn owns_method(class: Class, sel: Selector) -> bool {
    dispatch::get_slot(class, sel).is_some_and(|slot| slot.owner() == Some(class))
}

/// Re-derives the fast-refcount eligibility flag for `class`.
///
/// A class is eligible when every class providing `retain`, `release`, and
/// `autorelease` along its dispatch chain also carries the
/// `_ARCCompliantRetainRelease` marker.
pub fn check_refcount_eligibility(class: Class) {
    let [retain, release, autorelease, marker] = *refcount_selectors();
    for sel in [retain, release, autorelease] {
        if let Some(slot) = dispatch::get_slot(class, sel) {
            let owner = slot.owner().expect("refcount binding has an owner");
            if !owns_method(owner, marker) {
                class.clear_flag(ClassFlags::FAST_REFCOUNT);
                return;
            }
        }
    }
    class.set_flag(ClassFlags::FAST_REFCOUNT);
}

/// Interns the selector of every method in `descs`.
pub fn register_selectors_from_list(descs: &[MethodDesc<'_>]) {
    for desc in descs {
        let _ = Selector::register(desc.name, Some(desc.types));
    }
}

/// Re-registers the selectors of every method attached to `class`.
pub fn register_selectors_from_class(class: Class) {
    for list in class.method_lists() {
        for method in list.methods() {
            crate::runtime::selector::register_in_place(method.selector());
        }
    }
}

/// Registers a batch of selector handles in place.
pub fn register_selector_array(sels: &[Selector]) {
    for &sel in sels {
        crate::runtime::selector::register_in_place(sel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn ret_one(
        _receiver: Id,
        _sel: Selector,
        _args: *const *mut u8,
        ret: *mut u8,
    ) {
        // SAFETY: dispatch hands every imp a 16-byte return buffer.
        unsafe { ret.cast::<usize>().write_unaligned(1) };
    }

    unsafe extern "C" fn ret_two(
        _receiver: Id,
        _sel: Selector,
        _args: *const *mut u8,
        ret: *mut u8,
    ) {
        // SAFETY: as above.
        unsafe { ret.cast::<usize>().write_unaligned(2) };
    }

    #[test]
    fn test_method_list_interning() {
        let class = Class::new_root("MethIntern").unwrap();
        add_method_list(
            class,
            &[
                MethodDesc { name: "alpha", types: "v@:", imp: ret_one },
                MethodDesc { name: "beta:", types: "v@:i", imp: ret_two },
            ],
        );
        let lists: Vec<_> = class.method_lists().collect();
        assert_eq!(lists.len(), 1);
        let methods = lists[0].methods();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].selector().name(), "alpha");
        assert_eq!(methods[1].types(), "v@:i");
    }

    #[test]
    fn test_add_then_lookup_typed_and_untyped() {
        let class = Class::new_root("MethBoth").unwrap();
        add_method_list(
            class,
            &[MethodDesc { name: "gamma", types: "v@:", imp: ret_one }],
        );
        let typed = Selector::register("gamma", Some("v@:"));
        let untyped = Selector::register("gamma", None);
        let cls = class.inner.as_ptr().cast_const();
        assert!(typed.dtable().lookup(cls).is_some());
        assert!(untyped.dtable().lookup(cls).is_some());
    }

    #[test]
    fn test_update_method_bumps_version_without_creating() {
        let class = Class::new_root("MethUpdate").unwrap();
        add_method_list(
            class,
            &[MethodDesc { name: "delta", types: "v@:", imp: ret_one }],
        );
        let sel = Selector::register("delta", Some("v@:"));
        let cls = class.inner.as_ptr().cast_const();
        let v0 = sel.dtable().lookup(cls).unwrap().version();

        update_method(
            class,
            &MethodDesc { name: "delta", types: "v@:", imp: ret_two },
        );
        let slot = sel.dtable().lookup(cls).unwrap();
        assert_eq!(slot.version(), v0 + 1);
        assert_eq!(slot.imp() as usize, ret_two as usize);

        // Updating a method nobody defined installs nothing.
        let other = Class::new_root("MethUpdateOther").unwrap();
        update_method(
            other,
            &MethodDesc { name: "delta", types: "v@:", imp: ret_two },
        );
        assert!(sel.dtable().lookup(other.inner.as_ptr().cast_const()).is_none());
    }

    #[test]
    fn test_remove_class_retracts_bindings() {
        let parent = Class::new_root("MethRemoveP").unwrap();
        let child = Class::new("MethRemoveC", parent).unwrap();
        add_method_list(
            parent,
            &[MethodDesc { name: "epsilon", types: "v@:", imp: ret_one }],
        );
        add_method_list(
            child,
            &[MethodDesc { name: "epsilon", types: "v@:", imp: ret_two }],
        );
        let sel = Selector::register("epsilon", None);
        let child_cls = child.inner.as_ptr().cast_const();
        assert_eq!(
            sel.dtable().lookup(child_cls).unwrap().owner(),
            Some(child)
        );

        remove_class(child);
        // The child now inherits the parent's binding.
        let slot = sel.dtable().lookup(child_cls).unwrap();
        assert_eq!(slot.owner(), Some(parent));
    }

    #[test]
    fn test_refcount_eligibility() {
        let compliant = Class::new_root("MethArcYes").unwrap();
        add_method_list(
            compliant,
            &[
                MethodDesc { name: "retain", types: "@@:", imp: ret_one },
                MethodDesc { name: "release", types: "v@:", imp: ret_one },
                MethodDesc { name: "autorelease", types: "@@:", imp: ret_one },
                MethodDesc {
                    name: "_ARCCompliantRetainRelease",
                    types: "v@:",
                    imp: ret_one,
                },
            ],
        );
        check_refcount_eligibility(compliant);
        assert!(compliant.fast_refcount_eligible());

        // A subclass inheriting compliant refcounting stays eligible.
        let sub = Class::new("MethArcSub", compliant).unwrap();
        check_refcount_eligibility(sub);
        assert!(sub.fast_refcount_eligible());

        // Overriding retain without the marker revokes eligibility.
        let rogue = Class::new("MethArcRogue", compliant).unwrap();
        add_method_list(
            rogue,
            &[MethodDesc { name: "retain", types: "@@:", imp: ret_two }],
        );
        check_refcount_eligibility(rogue);
        assert!(!rogue.fast_refcount_eligible());
    }

    #[test]
    fn test_class_with_no_refcount_methods_is_eligible() {
        let plain = Class::new_root("MethArcPlain").unwrap();
        check_refcount_eligibility(plain);
        assert!(plain.fast_refcount_eligible());
    }
}
