// =============================================================================
// OpalOS — Machine Interface
// =============================================================================
//
// Everything the VM core needs from the world outside this crate, gathered
// into one narrow trait. A port implements `Machine` for its board; the
// test build implements it over a plain memory buffer (see `testing`).
// The rest of the kernel uses `&M where M: Machine` and never reaches for
// hardware directly.
//
// The surface is deliberately small:
//
//   RAM probe         — total physical bytes, first free byte above the
//                       resident kernel image. Consumed once at bootstrap.
//   Bootstrap alloc   — hands out monotonically increasing frames before
//                       the frame table exists; never frees.
//   Direct window     — a pointer under which physical byte `p` is
//                       addressable at `window + p` (the kseg0 segment on
//                       real hardware).
//   Raw TLB ports     — write a chosen slot, or a hardware-chosen one.
//   Priority          — raise/restore interrupt priority around TLB writes.
//   Console           — byte sink for the kernel logger.
//
// =============================================================================

use crate::memory::address::PhysAddr;

/// The hardware (or simulated hardware) beneath the VM core.
///
/// All methods take `&self`: the machine is shared by every kernel thread,
/// and any interior state (the TLB, the bootstrap bump pointer) is the
/// implementation's business to synchronize.
pub trait Machine: Sync {
    // ── RAM probe and bootstrap allocator ─────────────────────────────

    /// Total bytes of physical RAM fitted to the machine.
    fn ram_size(&self) -> u32;

    /// First free physical byte above the already-resident kernel image.
    /// Read once by `Vm::bootstrap`; everything below it is kernel.
    fn ram_firstfree(&self) -> u32;

    /// Steal `npages` contiguous frames from the bottom of free RAM.
    /// Only legal before the frame table is initialized; stolen memory is
    /// never returned. Yields the zero address when RAM is exhausted.
    fn ram_stealmem(&self, npages: usize) -> PhysAddr;

    // ── Direct-mapped window ──────────────────────────────────────────

    /// Base pointer of the kernel direct-mapped window. Physical byte `p`
    /// is addressable at `window + p` without any TLB translation.
    fn direct_window(&self) -> *mut u8;

    // ── Raw TLB ports ─────────────────────────────────────────────────

    /// Write a translation into the given TLB slot.
    fn tlb_write(&self, entry_hi: u32, entry_lo: u32, slot: u32);

    /// Write a translation into a hardware-chosen TLB slot.
    fn tlb_random(&self, entry_hi: u32, entry_lo: u32);

    // ── Interrupt priority ────────────────────────────────────────────

    /// Raise interrupt priority to the maximum; returns the old level.
    /// Acts as a critical section against the trap handler on this CPU.
    fn splhigh(&self) -> u8;

    /// Restore a previously saved interrupt priority level.
    fn splx(&self, level: u8);

    // ── Console ───────────────────────────────────────────────────────

    /// Write text to the machine console (serial port or equivalent).
    fn console_write(&self, text: &str);
}

/// A borrowed machine is a machine. Lets the VM core hold `&M` without a
/// second set of APIs.
impl<M: Machine + ?Sized> Machine for &M {
    fn ram_size(&self) -> u32 {
        (**self).ram_size()
    }
    fn ram_firstfree(&self) -> u32 {
        (**self).ram_firstfree()
    }
    fn ram_stealmem(&self, npages: usize) -> PhysAddr {
        (**self).ram_stealmem(npages)
    }
    fn direct_window(&self) -> *mut u8 {
        (**self).direct_window()
    }
    fn tlb_write(&self, entry_hi: u32, entry_lo: u32, slot: u32) {
        (**self).tlb_write(entry_hi, entry_lo, slot)
    }
    fn tlb_random(&self, entry_hi: u32, entry_lo: u32) {
        (**self).tlb_random(entry_hi, entry_lo)
    }
    fn splhigh(&self) -> u8 {
        (**self).splhigh()
    }
    fn splx(&self, level: u8) {
        (**self).splx(level)
    }
    fn console_write(&self, text: &str) {
        (**self).console_write(text)
    }
}

#[cfg(test)]
pub mod testing;
