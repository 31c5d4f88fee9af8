// =============================================================================
// OpalOS — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel.
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, interrupt-driven environment.
//
// IMPORTANT: VM lock ordering rules:
//   Level 1 (outermost): hashed page table lock
//   Level 2 (innermost): frame table lock
//   Disjoint: bootstrap allocator lock (only before the frame table exists)
//
// NEVER acquire the page-table lock while holding the frame-table lock.
// Violating this WILL cause deadlocks.
// =============================================================================

pub mod spinlock;
