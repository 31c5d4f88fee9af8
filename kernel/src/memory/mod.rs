// =============================================================================
// OpalOS — Memory Subsystem
// =============================================================================
//
// The memory subsystem manages all physical and virtual memory in the kernel.
// It's organized into layers:
//
//   address.rs   — PhysAddr/VirtAddr newtypes (type safety for addresses)
//   frame.rs     — frame table (free-list allocator at the top of RAM)
//   hpt.rs       — hashed page table (kernel-wide inverted translations)
//   addrspace.rs — address-space lifecycle (create/copy/destroy/regions)
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod address;
pub mod addrspace;
pub mod frame;
pub mod hpt;
