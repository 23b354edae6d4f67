//! Minimal object model: a header with an `isa` pointer.
//!
//! The dispatch core does not allocate or reference-count objects; it only
//! needs to get from a receiver to its class. Anything whose first word is a
//! class pointer is a valid receiver, which includes class records
//! themselves (see `runtime::class`).

use std::ptr::NonNull;

use argot_mem::global_arena;

use crate::runtime::class::{Class, ClassInner};

/// Leading word of every message receiver.
#[repr(C)]
pub struct ObjectHeader {
    pub(crate) isa: *const ClassInner,
}

/// A nullable receiver. Nil receivers are legal; dispatch resolves them to
/// zero-returning slots.
pub type Id = *mut ObjectHeader;

/// The nil receiver.
pub const NIL: Id = std::ptr::null_mut();

/// Resolves a receiver to its class.
///
/// Returns `None` for nil or for a receiver whose class word was never
/// initialized.
///
/// # Safety
///
/// A non-nil `obj` must point at a live allocation that starts with an
/// [`ObjectHeader`].
#[must_use]
pub unsafe fn class_of(obj: Id) -> Option<Class> {
    if obj.is_null() {
        return None;
    }
    // SAFETY: caller guarantees obj points at an ObjectHeader.
    let isa = unsafe { (*obj).isa };
    NonNull::new(isa.cast_mut()).map(|inner| Class { inner })
}

/// A bare arena-allocated instance, for hosts and tests that need a
/// receiver without bringing their own allocator.
#[derive(Clone, Copy)]
pub struct Object {
    ptr: NonNull<ObjectHeader>,
}

// SAFETY: the header is arena-immortal and only ever read through it.
unsafe impl Send for Object {}
unsafe impl Sync for Object {}

impl Object {
    /// Allocates a header-only instance of `class` in the global arena.
    #[must_use]
    pub fn new(class: Class) -> Object {
        let header = global_arena().alloc(ObjectHeader {
            isa: class.inner.as_ptr(),
        });
        Object {
            ptr: NonNull::from(header),
        }
    }

    /// The instance as a message receiver.
    #[must_use]
    pub fn as_id(&self) -> Id {
        self.ptr.as_ptr()
    }

    /// The instance's class.
    #[must_use]
    pub fn class(&self) -> Class {
        // SAFETY: `new` initialized the header from a registered class.
        unsafe { class_of(self.as_id()).expect("object header lost its class") }
    }
}
