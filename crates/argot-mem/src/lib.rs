//! Argot memory management infrastructure.
//!
//! This crate provides the grow-only arena that backs every piece of
//! long-lived runtime metadata in Argot: selectors, dispatch tables, slots,
//! type-encoding lists, method lists, and per-object monitors. The arena is
//! deliberately one-way: allocation is cheap and thread-safe, and nothing is
//! ever handed back. Freeing runtime metadata is a process-exit concern.
//!
//! # Design
//!
//! - **Bump allocation** over chunks obtained from the system allocator.
//! - **Stable pointers**: an allocation never moves, so raw pointers into
//!   the arena are valid for the remainder of the process.
//! - **Thread safety** through an atomic bump pointer with a CAS loop; a
//!   mutex is only taken when a fresh chunk has to be attached.

pub mod arena;

pub use arena::{Arena, ArenaStats, global_arena};
