// =============================================================================
// OpalOS — Kernel Core (Virtual Memory Subsystem)
// =============================================================================
//
// This crate is the machine-independent core of the OpalOS virtual-memory
// system for a 32-bit RISC CPU with a software-managed TLB. The hardware
// never walks page tables: every TLB miss traps to software, which looks up
// the translation and refills one TLB slot.
//
// LAYERS (leaves first):
//
//   machine/   — the narrow interface to the world outside this crate:
//                RAM probe, bootstrap allocator, direct-mapped window,
//                raw TLB ports, interrupt priority, console
//   sync/      — ticket spinlock
//   memory/    — frame table, hashed page table, address spaces
//   tlb.rs     — TLB flush/refill wrapper over the machine's raw ports
//   vm.rs      — the subsystem object: bootstrap, kernel pages, vm_fault
//   util/      — logger backend for the `log` facade
//
// The trap entry calls `Vm::fault`, the process module calls the `as_*`
// lifecycle methods, and kmalloc/kfree sit on top of `alloc_kpages` /
// `free_kpages`. None of those callers live here.
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod machine;
pub mod memory;
pub mod sync;
pub mod tlb;
pub mod util;
pub mod vm;

pub use memory::addrspace::{AddressSpace, Asid};
pub use vm::{FaultKind, FrameStats, Vm, VmError};
