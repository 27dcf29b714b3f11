//! Generational garbage collection
//!
//! The heap is a slot arena addressed by [`Handle`] indices; the object
//! header (mark bit, tenure counter, generation, weak observers) lives
//! inline with each slot, so marking touches only live objects and never
//! scans a generation to resolve a handle.

mod collector;
mod heap;

pub use collector::{GarbageCollector, GcStats};
pub use heap::{GcHeader, Generation, Handle, Heap};
