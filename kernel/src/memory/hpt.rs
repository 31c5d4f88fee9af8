// =============================================================================
// OpalOS — Hashed Page Table (Inverted, Kernel-Wide)
// =============================================================================
//
// One table for the whole kernel: every address space's translations live
// in the same array, keyed by (ASID, virtual page number). The table is
// sized at 2 slots per physical frame and placed immediately below the
// frame table at the top of RAM.
//
// SLOT LIFE CYCLE:
//
//   Free ──insert──▶ Used ──teardown──▶ Tombstone ──insert──▶ Used ...
//
//   Free slots have never held an entry; a lookup probe stops there.
//   Tombstones are left by address-space teardown; lookups step over
//   them and inserts reuse them. Entries never move between slots, so
//   a bulk walk of the table stays valid across concurrent inserts.
//
// PROBING:
//   Home slot = (asid XOR (vpn >> 12)) mod table length, then linear
//   probing with step 1. An insert probes at most the whole table before
//   reporting it full.
//
// ENTRY WORDS:
//   entry_hi — the virtual page number, page-aligned, low 12 bits zero.
//   entry_lo — the word handed to the TLB: physical frame number in the
//              top 20 bits, hardware bits (GLOBAL/VALID/DIRTY/NOCACHE) in
//              bits 8–11, and a software overlay in the low 5 bits
//              (SWRITE/EXECUTE/WRITE/READ/DEFINED) that is stripped before
//              the word reaches hardware.
//
// THREAD SAFETY:
//   Like the frame table, this structure is not a lock; `Vm` guards it
//   with the page-table spinlock, which is the outermost VM lock.
//
// =============================================================================

use bitflags::bitflags;
use core::fmt;
use core::ptr;

use crate::memory::address::{PhysAddr, VirtAddr, PAGE_FRAME, PAGE_SHIFT};
use crate::memory::addrspace::Asid;

// =============================================================================
// Entry flags and the entry_lo word
// =============================================================================

bitflags! {
    /// Permission and state bits of an `entry_lo` word.
    ///
    /// Bits 8–11 are defined by the hardware; the low five bits are a
    /// software overlay living in space the hardware ignores. `STATEBITS`
    /// is masked off before a word is written to the TLB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Soft write: writes allowed while the owning address space is
        /// being loaded, regardless of the declared permissions.
        const SWRITE   = 1 << 0;

        /// Execute permission (software-checked).
        const EXECUTE  = 1 << 1;

        /// Write permission.
        const WRITE    = 1 << 2;

        /// Read permission.
        const READ     = 1 << 3;

        /// The translation is declared but has no backing frame yet.
        const DEFINED  = 1 << 4;

        /// Hardware: entry matches regardless of ASID. Always set here —
        /// the TLB has no ASID tagging in this design.
        const GLOBAL   = 1 << 8;

        /// Hardware: the entry may be used for translation.
        const VALID    = 1 << 9;

        /// Hardware: writes through this entry are permitted; clear means
        /// a write raises a read-only fault.
        const DIRTY    = 1 << 10;

        /// Hardware: bypass the cache for this page.
        const NOCACHE  = 1 << 11;
    }
}

impl EntryFlags {
    /// The RWXS permission nibble.
    pub const PERMISSION: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::EXECUTE)
        .union(Self::SWRITE);

    /// All software state: the permission nibble plus DEFINED. Stripped
    /// from every word before it reaches the TLB.
    pub const STATEBITS: Self = Self::PERMISSION.union(Self::DEFINED);
}

/// A packed `entry_lo` word: physical frame number plus `EntryFlags`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EntryLo(u32);

impl EntryLo {
    /// An all-zero word: no frame, no permissions, not valid.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a word from a frame address (zero for "no frame yet") and
    /// flags.
    pub fn new(frame: PhysAddr, flags: EntryFlags) -> Self {
        debug_assert!(frame.is_page_aligned());
        Self((frame.as_u32() & PAGE_FRAME) | flags.bits())
    }

    /// The raw 32-bit word.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The flag bits of this word.
    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// The backing frame address (zero when no frame is attached).
    #[inline]
    pub fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & PAGE_FRAME)
    }

    /// Whether a backing frame has been attached.
    #[inline]
    pub fn has_frame(self) -> bool {
        self.0 & PAGE_FRAME != 0
    }

    /// Returns true if all of `flags` are set.
    #[inline]
    pub fn contains(self, flags: EntryFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Returns true if any of `flags` is set.
    #[inline]
    pub fn intersects(self, flags: EntryFlags) -> bool {
        self.flags().intersects(flags)
    }

    /// Sets flag bits.
    #[inline]
    pub fn insert(&mut self, flags: EntryFlags) {
        self.0 |= flags.bits();
    }

    /// Clears flag bits.
    #[inline]
    pub fn remove(&mut self, flags: EntryFlags) {
        self.0 &= !flags.bits();
    }

    /// Attaches a backing frame to a frameless word and drops DEFINED,
    /// which only means anything while there is no frame.
    pub fn attach_frame(&mut self, frame: PhysAddr) {
        debug_assert!(!self.has_frame(), "entry already has a backing frame");
        debug_assert!(frame.is_page_aligned() && !frame.is_zero());
        self.0 = (self.0 & !PAGE_FRAME) | frame.as_u32();
        self.remove(EntryFlags::DEFINED);
    }

    /// The word actually handed to the TLB: software state stripped, and
    /// DIRTY promoted when the faulting access was a write (a soft write
    /// must reach memory even on a read-only page).
    pub fn to_tlb(self, write_access: bool) -> u32 {
        let mut word = self.0 & !EntryFlags::STATEBITS.bits();
        if write_access {
            word |= EntryFlags::DIRTY.bits();
        }
        word
    }
}

impl fmt::Debug for EntryLo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryLo({} {:?})", self.frame(), self.flags())
    }
}

// =============================================================================
// Slots
// =============================================================================

/// Occupancy of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum SlotState {
    /// Never held an entry. Terminates a lookup probe.
    Free = 0,
    /// Held an entry that was torn down. Probes continue past it; inserts
    /// may reuse it.
    Tombstone = 1,
    /// Holds a live entry.
    Used = 2,
}

/// One slot of the hashed page table. Lives in raw RAM below the frame
/// table, so the layout is fixed.
#[repr(C)]
pub(crate) struct HptEntry {
    /// Owning address space, or zero when the slot holds no entry.
    asid: u32,
    /// Virtual page number (page-aligned).
    entry_hi: u32,
    /// Frame and permission word.
    entry_lo: EntryLo,
    /// Occupancy state.
    state: SlotState,
}

// =============================================================================
// The table
// =============================================================================

/// The kernel-wide inverted page table.
pub struct HashedPageTable {
    slots: *mut HptEntry,
    len: usize,
}

// SAFETY: the slot array is only touched through &mut self, and `Vm`
// serializes all access behind the page-table spinlock.
unsafe impl Send for HashedPageTable {}

impl HashedPageTable {
    /// Builds the table in place over `len` slots of raw RAM, marking every
    /// slot Free.
    pub(crate) fn init(slots: *mut HptEntry, len: usize) -> Self {
        debug_assert!(len > 0);
        debug_assert!(slots.align_offset(core::mem::align_of::<HptEntry>()) == 0);

        // The array starts as raw RAM of unknown content; write every slot
        // once before any reference to it is formed.
        for index in 0..len {
            // SAFETY: the caller carved out `len` slots at `slots`.
            unsafe {
                ptr::write(
                    slots.add(index),
                    HptEntry {
                        asid: 0,
                        entry_hi: 0,
                        entry_lo: EntryLo::empty(),
                        state: SlotState::Free,
                    },
                );
            }
        }

        Self { slots, len }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// The home slot of a (ASID, VPN) pair.
    #[inline]
    fn home(&self, asid: Asid, vpn: VirtAddr) -> usize {
        ((asid.as_u32() ^ (vpn.as_u32() >> PAGE_SHIFT)) as usize) % self.len
    }

    /// Inserts a translation. Returns false when the table is full.
    ///
    /// The caller guarantees no live entry exists for this (ASID, VPN);
    /// duplicates would shadow each other.
    pub fn insert(&mut self, asid: Asid, vpn: VirtAddr, lo: EntryLo) -> bool {
        debug_assert!(vpn.is_page_aligned());
        debug_assert!(self.lookup(asid, vpn).is_none(), "duplicate translation");

        let home = self.home(asid, vpn);
        for step in 0..self.len {
            let index = (home + step) % self.len;
            if self.slots()[index].state == SlotState::Used {
                continue;
            }
            self.slots_mut()[index] = HptEntry {
                asid: asid.as_u32(),
                entry_hi: vpn.as_u32(),
                entry_lo: lo,
                state: SlotState::Used,
            };
            return true;
        }
        false
    }

    /// Finds the slot holding the translation for (ASID, VPN).
    ///
    /// Probes from the home slot, stepping over tombstones, until a hit, a
    /// never-used slot, or a full cycle of the table.
    pub fn lookup(&self, asid: Asid, vpn: VirtAddr) -> Option<usize> {
        debug_assert!(vpn.is_page_aligned());

        let home = self.home(asid, vpn);
        for step in 0..self.len {
            let index = (home + step) % self.len;
            let slot = &self.slots()[index];
            match slot.state {
                SlotState::Free => return None,
                SlotState::Tombstone => continue,
                SlotState::Used => {
                    if slot.asid == asid.as_u32() && slot.entry_hi == vpn.as_u32() {
                        return Some(index);
                    }
                }
            }
        }
        None
    }

    /// Removes a single frameless translation (region-definition rollback).
    /// Returns whether it was present.
    pub fn remove(&mut self, asid: Asid, vpn: VirtAddr) -> bool {
        match self.lookup(asid, vpn) {
            Some(index) => {
                debug_assert!(
                    !self.slots()[index].entry_lo.has_frame(),
                    "removing a translation that still owns a frame"
                );
                self.clear_slot(index);
                true
            }
            None => false,
        }
    }

    /// Tears down every translation owned by `asid`, handing each backing
    /// frame to `release` before the slot is cleared.
    ///
    /// Returns the number of translations removed.
    pub fn remove_all_for(&mut self, asid: Asid, mut release: impl FnMut(PhysAddr)) -> usize {
        let mut removed = 0;
        for index in 0..self.len {
            let slot = &self.slots()[index];
            if slot.state != SlotState::Used || slot.asid != asid.as_u32() {
                continue;
            }
            let lo = slot.entry_lo;
            if lo.has_frame() {
                release(lo.frame());
            }
            self.clear_slot(index);
            removed += 1;
        }
        removed
    }

    /// Reads one slot as (owner, VPN, entry_lo) if it holds a live entry.
    pub fn slot(&self, index: usize) -> Option<(Asid, VirtAddr, EntryLo)> {
        let slot = &self.slots()[index];
        if slot.state != SlotState::Used {
            return None;
        }
        Some((
            Asid::new(slot.asid),
            VirtAddr::new(slot.entry_hi),
            slot.entry_lo,
        ))
    }

    /// The VPN stored in a live slot.
    pub fn entry_hi(&self, index: usize) -> VirtAddr {
        debug_assert!(self.slots()[index].state == SlotState::Used);
        VirtAddr::new(self.slots()[index].entry_hi)
    }

    /// The entry_lo word of a live slot.
    pub fn entry_lo(&self, index: usize) -> EntryLo {
        debug_assert!(self.slots()[index].state == SlotState::Used);
        self.slots()[index].entry_lo
    }

    /// Mutable access to the entry_lo word of a live slot.
    pub fn entry_lo_mut(&mut self, index: usize) -> &mut EntryLo {
        debug_assert!(self.slots()[index].state == SlotState::Used);
        &mut self.slots_mut()[index].entry_lo
    }

    /// Number of live entries, for diagnostics and tests.
    pub fn used_slots(&self) -> usize {
        self.slots()
            .iter()
            .filter(|s| s.state == SlotState::Used)
            .count()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn clear_slot(&mut self, index: usize) {
        self.slots_mut()[index] = HptEntry {
            asid: 0,
            entry_hi: 0,
            entry_lo: EntryLo::empty(),
            state: SlotState::Tombstone,
        };
    }

    fn slots(&self) -> &[HptEntry] {
        // SAFETY: init wrote every slot; the array stays inside RAM.
        unsafe { core::slice::from_raw_parts(self.slots, self.len) }
    }

    fn slots_mut(&mut self) -> &mut [HptEntry] {
        // SAFETY: as above, plus &mut self gives exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.slots, self.len) }
    }
}

// =============================================================================
// Tests
// =============================================================================
