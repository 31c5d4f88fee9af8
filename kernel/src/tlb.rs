//! TLB interface — thin wrapper over the machine's raw TLB ports.
//!
//! The hardware TLB is the only translation cache in the system and is
//! populated exclusively through `Machine::tlb_random` (refill on fault)
//! and invalidated by rewriting every slot (flush). There is no ASID
//! tagging in hardware, so an address-space switch flushes everything.

use crate::machine::Machine;
use crate::memory::address::{KSEG0_BASE, PAGE_SHIFT};

/// Number of hardware TLB entries.
pub const NUM_TLB: u32 = 64;

/// The invalid `entry_hi` used to park TLB slot `slot`.
///
/// Each slot gets a distinct kernel-segment VPN so no two parked slots
/// alias each other — the hardware faults on duplicate VPNs. Kernel-segment
/// addresses never reach the TLB, so these entries can never hit.
#[inline]
pub fn invalid_hi(slot: u32) -> u32 {
    KSEG0_BASE + (slot << PAGE_SHIFT)
}

/// The invalid `entry_lo`: no frame, no VALID bit, no permissions.
pub const INVALID_LO: u32 = 0;

/// Invalidate every TLB slot.
///
/// Runs at raised interrupt priority so a trap on this CPU cannot observe
/// a half-flushed TLB. Called on address-space activation, teardown, and
/// at the end of the program-load window.
pub fn flush<M: Machine>(machine: &M) {
    let spl = machine.splhigh();
    for slot in 0..NUM_TLB {
        machine.tlb_write(invalid_hi(slot), INVALID_LO, slot);
    }
    machine.splx(spl);
}
