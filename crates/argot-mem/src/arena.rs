//! Grow-only arena allocator for runtime metadata.
//!
//! The arena hands out memory that lives for the remainder of the process.
//! It is the Rust rendering of the per-type pool allocators a C runtime
//! would use for selectors, dispatch tables, and slots: allocation is a bump
//! pointer, chunks are never reclaimed, and callers are free to stash raw
//! pointers to anything they allocate.
//!
//! # Thread Safety
//!
//! Each chunk carries an atomic bump pointer updated with a CAS loop, so any
//! number of threads can allocate concurrently. The chunk list itself is
//! only touched under a mutex when the current chunk runs dry.
//!
//! # Failure
//!
//! Running out of memory while growing the arena is not a recoverable
//! condition for a dispatch runtime: allocation failure aborts the process
//! via [`std::alloc::handle_alloc_error`]. No partially-published metadata
//! is ever observable, because allocation always precedes publication.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Alignment floor for arena allocations.
///
/// Everything the runtime stores in the arena is pointer-heavy, so 8-byte
/// alignment is the useful minimum; callers with stricter types get their
/// natural alignment instead.
const MIN_ALIGNMENT: usize = 8;

/// Size of the first chunk (64 KiB).
const INITIAL_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks double up to this cap (1 MiB).
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Allocation statistics for an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes handed out to callers.
    pub allocated: usize,
    /// Number of chunks backing the arena.
    pub chunks: usize,
    /// Total capacity across all chunks.
    pub capacity: usize,
}

/// A fixed-size memory chunk with an atomic bump pointer.
///
/// Chunks are leaked on creation; their memory is released only when the
/// process exits.
struct Chunk {
    /// Start of the chunk's region.
    start: NonNull<u8>,
    /// Current bump position.
    cursor: AtomicPtr<u8>,
    /// One past the end of the region.
    end: NonNull<u8>,
    /// Capacity in bytes.
    capacity: usize,
}

impl Chunk {
    /// Allocates a chunk from the system allocator and leaks it.
    fn new(size: usize) -> &'static Chunk {
        // SAFETY: size is non-zero (floored by the callers) and
        // MIN_ALIGNMENT is a power of two.
        let layout = unsafe { Layout::from_size_align_unchecked(size, MIN_ALIGNMENT) };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(start) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        // SAFETY: start..start+size is the allocation we just obtained;
        // one-past-the-end pointers are valid to form.
        let end = unsafe { NonNull::new_unchecked(start.as_ptr().add(size)) };

        Box::leak(Box::new(Chunk {
            start,
            cursor: AtomicPtr::new(start.as_ptr()),
            end,
            capacity: size,
        }))
    }

    /// Tries to carve `size` bytes at `align` out of this chunk.
    #[inline(always)]
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        loop {
            let current = self.cursor.load(Ordering::Acquire);
            let current_addr = current.addr();

            let aligned = (current_addr + align - 1) & !(align - 1);
            let next = aligned.checked_add(size)?;
            if next > self.end.addr().get() {
                return None;
            }

            // `with_addr` keeps the provenance of the original chunk
            // pointer, which matters for anyone auditing this with Miri.
            let next_ptr = current.with_addr(next);
            match self.cursor.compare_exchange_weak(
                current,
                next_ptr,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let result = current.with_addr(aligned);
                    // SAFETY: aligned lies inside the chunk (checked above)
                    // and is non-null because the chunk region is non-null.
                    return unsafe { Some(NonNull::new_unchecked(result)) };
                }
                Err(_) => continue,
            }
        }
    }
}

// SAFETY: Chunk owns its region for the process lifetime, the cursor is
// atomic, and start/end are immutable after construction.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

/// Thread-safe grow-only arena.
///
/// Allocations are valid for the rest of the process: the arena never frees,
/// never moves, and never reuses memory. This is exactly the lifetime
/// contract the dispatch core's metadata needs, so raw pointers into the
/// arena can be treated as `'static`.
///
/// # Example
///
/// ```
/// use argot_mem::global_arena;
///
/// let arena = global_arena();
/// let n: &mut u64 = arena.alloc(7);
/// assert_eq!(*n, 7);
/// ```
pub struct Arena {
    /// All chunks ever attached, kept so `stats` can sum capacities.
    chunks: Mutex<Vec<&'static Chunk>>,
    /// Chunk currently being bumped.
    current: AtomicPtr<Chunk>,
    /// Size for the next chunk attachment.
    next_chunk_size: AtomicUsize,
    /// Bytes handed out.
    allocated: AtomicUsize,
}

impl Arena {
    /// Creates an arena with a single initial chunk.
    #[must_use]
    pub fn new() -> Self {
        let first = Chunk::new(INITIAL_CHUNK_SIZE);
        let first_ptr: *const Chunk = first;
        Arena {
            chunks: Mutex::new(vec![first]),
            current: AtomicPtr::new(first_ptr.cast_mut()),
            next_chunk_size: AtomicUsize::new(INITIAL_CHUNK_SIZE * 2),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocates and initializes a value in the arena.
    ///
    /// The returned reference is valid for the remainder of the process; it
    /// is tied to `&self` only so that borrows stay honest while the caller
    /// still has it.
    #[inline]
    #[allow(clippy::mut_from_ref)] // bump allocation; each call returns fresh memory
    pub fn alloc<T>(&self, value: T) -> &mut T {
        let ptr = self.alloc_raw(Layout::new::<T>()).as_ptr().cast::<T>();
        // SAFETY: ptr is freshly allocated, properly aligned for T, and
        // nobody else holds it.
        unsafe {
            std::ptr::write(ptr, value);
            &mut *ptr
        }
    }

    /// Allocates raw zero-uninitialized memory with the given layout.
    ///
    /// # Panics
    ///
    /// Aborts the process (via the allocation-error handler) if the system
    /// allocator cannot provide a new chunk.
    pub fn alloc_raw(&self, layout: Layout) -> NonNull<u8> {
        let size = layout.size();
        let align = layout.align().max(MIN_ALIGNMENT);

        loop {
            let current = self.current.load(Ordering::Acquire);
            if !current.is_null() {
                // SAFETY: current always points at a leaked Chunk.
                let chunk = unsafe { &*current };
                if let Some(ptr) = chunk.try_alloc(size, align) {
                    self.allocated.fetch_add(size, Ordering::Relaxed);
                    return ptr;
                }
            }
            self.attach_chunk(size + align);
        }
    }

    /// Copies `s` into the arena as a NUL-terminated byte string.
    ///
    /// Returning a thin pointer (rather than a fat `&str`) lets callers keep
    /// the string in a single word that can be swapped atomically; read it
    /// back with [`Arena::cstr_to_str`].
    ///
    /// # Panics
    ///
    /// Panics if `s` contains an interior NUL byte. Selector names and type
    /// encodings never do.
    pub fn alloc_cstr(&self, s: &str) -> NonNull<u8> {
        assert!(
            !s.as_bytes().contains(&0),
            "embedded NUL in arena string: {s:?}"
        );
        let bytes = s.as_bytes();
        // SAFETY: len + 1 cannot overflow for a real string, align 1.
        let layout = unsafe { Layout::from_size_align_unchecked(bytes.len() + 1, 1) };
        let dst = self.alloc_raw(layout);
        // SAFETY: dst has len + 1 writable bytes; src and dst do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            *dst.as_ptr().add(bytes.len()) = 0;
        }
        dst
    }

    /// Reads a NUL-terminated arena string back as `&'static str`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Arena::alloc_cstr`] on an arena that is never
    /// dropped (the global arena qualifies).
    #[must_use]
    pub unsafe fn cstr_to_str(ptr: NonNull<u8>) -> &'static str {
        // SAFETY: alloc_cstr wrote valid UTF-8 followed by a NUL, and the
        // memory is immortal per the caller contract.
        unsafe {
            let cstr = std::ffi::CStr::from_ptr(ptr.as_ptr().cast());
            std::str::from_utf8_unchecked(cstr.to_bytes())
        }
    }

    /// Attaches a new chunk big enough for at least `min_size` bytes.
    #[cold]
    fn attach_chunk(&self, min_size: usize) {
        let mut chunks = self.chunks.lock().unwrap();

        let planned = self.next_chunk_size.load(Ordering::Relaxed);
        let size = planned.max(min_size.next_power_of_two());
        let chunk = Chunk::new(size);
        chunks.push(chunk);
        self.next_chunk_size
            .store((size * 2).min(MAX_CHUNK_SIZE), Ordering::Relaxed);
        let chunk_ptr: *const Chunk = chunk;
        self.current.store(chunk_ptr.cast_mut(), Ordering::Release);
    }

    /// Returns allocation statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let chunks = self.chunks.lock().unwrap();
        ArenaStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            chunks: chunks.len(),
            capacity: chunks.iter().map(|c| c.capacity).sum(),
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/// Global arena instance.
static GLOBAL: OnceLock<Arena> = OnceLock::new();

/// Returns the process-global arena, creating it on first use.
pub fn global_arena() -> &'static Arena {
    GLOBAL.get_or_init(Arena::new)
}
