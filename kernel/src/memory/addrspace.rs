// =============================================================================
// OpalOS — Address Spaces
// =============================================================================
//
// An address space is the per-process view of user memory. It owns no
// storage of its own: every translation it defines lives in the kernel-wide
// hashed page table, keyed by the space's ASID. The object itself is a
// heap-allocated handle carrying that ASID and nothing else.
//
// ASIDs are issued from a monotonic counter and never reused, so a stale
// translation can never alias a later address space — teardown plus the
// counter make the key unambiguous for the lifetime of the boot.
//
// LIFE CYCLE (driven by the exec/fork path):
//
//   create ─▶ define_region / define_stack ─▶ prepare_load ─▶ (load runs,
//   faults allocate frames on demand) ─▶ complete_load ─▶ user runs
//
//   fork: copy — every translation is mirrored under a fresh ASID and
//   every backing frame is deep-copied.
//   exit: destroy — translations removed, frames released, TLB flushed.
//
// THE LOAD WINDOW:
//   Regions are created with the soft-write bit (SWRITE) set so the loader
//   can fill read-only segments. complete_load clears the bit on every
//   entry and flushes the TLB, because cached entries minted during the
//   window carry a promoted DIRTY bit that must not survive into the
//   running program.
//
// =============================================================================

use alloc::boxed::Box;
use core::sync::atomic::Ordering;

use crate::machine::Machine;
use crate::memory::address::{PhysAddr, VirtAddr, KSEG0_BASE, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::hpt::{EntryFlags, EntryLo, HashedPageTable};
use crate::tlb;
use crate::vm::{Vm, VmError};

/// Number of pages in a freshly defined user stack.
pub const STACK_PAGES: u32 = 16;

/// Initial user stack pointer: the top of user virtual memory. The stack
/// occupies the STACK_PAGES pages ending here.
pub const USERSTACK: VirtAddr = VirtAddr::new(KSEG0_BASE);

// =============================================================================
// Identifiers and the handle
// =============================================================================

/// An address-space identifier: the tenant key in the hashed page table.
///
/// Issued monotonically from 1; zero marks a vacant table slot and is never
/// a real ASID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Asid(u32);

impl Asid {
    pub(crate) const fn new(raw: u32) -> Self {
        debug_assert!(raw != 0, "ASID zero is the vacant-slot marker");
        Self(raw)
    }

    /// The raw identifier.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// A process's address space. Opaque to callers; the process module keeps
/// the box and hands references to the VM entry points.
#[derive(Debug)]
pub struct AddressSpace {
    asid: Asid,
}

impl AddressSpace {
    /// This space's identifier.
    #[inline]
    pub fn asid(&self) -> Asid {
        self.asid
    }
}

// =============================================================================
// Lifecycle operations
// =============================================================================

impl<M: Machine> Vm<M> {
    /// Creates an empty address space. No translations exist until the
    /// loader defines regions.
    pub fn as_create(&self) -> Box<AddressSpace> {
        let raw = self.next_asid.fetch_add(1, Ordering::Relaxed);
        assert!(raw != 0, "address-space identifiers exhausted");
        tlb::flush(&self.machine);
        Box::new(AddressSpace {
            asid: Asid::new(raw),
        })
    }

    /// Builds a deep copy of `old` under a fresh ASID: every translation is
    /// mirrored with identical permission and state bits, and every backing
    /// frame is copied byte for byte into a newly allocated frame.
    ///
    /// On failure the half-built space is destroyed and nothing leaks.
    pub fn as_copy(&self, old: &AddressSpace) -> Result<Box<AddressSpace>, VmError> {
        let new = self.as_create();

        let mut pages = self.pages.lock();
        let result = match pages.as_mut() {
            None => Ok(()),
            Some(hpt) => self.copy_translations(hpt, old.asid(), new.asid()),
        };
        drop(pages);

        match result {
            Ok(()) => Ok(new),
            Err(err) => {
                self.as_destroy(new);
                Err(err)
            }
        }
    }

    /// The copy loop. Runs under the page-table lock; entries never move
    /// between slots, so inserting mirrors while walking is sound (they
    /// carry the new ASID and are skipped by the owner check).
    fn copy_translations(
        &self,
        hpt: &mut HashedPageTable,
        old_asid: Asid,
        new_asid: Asid,
    ) -> Result<(), VmError> {
        for index in 0..hpt.len() {
            let Some((owner, vpn, lo)) = hpt.slot(index) else {
                continue;
            };
            if owner != old_asid {
                continue;
            }

            let mut mirror = EntryLo::new(PhysAddr::zero(), lo.flags());
            if lo.has_frame() {
                let frame = self.grab_frame().ok_or(VmError::OutOfMemory)?;
                self.copy_page(lo.frame(), frame);
                mirror.attach_frame(frame);
            }

            if !hpt.insert(new_asid, vpn, mirror) {
                // The mirror never made it into the table, so teardown
                // would miss its frame; release it here.
                if mirror.has_frame() {
                    self.release_frame(mirror.frame());
                }
                return Err(VmError::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Tears down an address space: removes every translation it owns,
    /// releasing backing frames, then flushes the TLB and frees the handle.
    pub fn as_destroy(&self, space: Box<AddressSpace>) {
        let asid = space.asid();
        {
            let mut pages = self.pages.lock();
            if let Some(hpt) = pages.as_mut() {
                hpt.remove_all_for(asid, |frame| self.release_frame(frame));
            }
        }
        tlb::flush(&self.machine);
        drop(space);
    }

    /// Makes `space` the current address space on a context switch. The
    /// whole TLB is flushed — the hardware has no ASID tagging, so entries
    /// of the previous space must not survive.
    pub fn as_activate(&self, space: &AddressSpace) {
        self.current.store(space.asid().as_u32(), Ordering::Relaxed);
        tlb::flush(&self.machine);
    }

    /// Clears the current address space (switching to a kernel-only
    /// thread). Flushes symmetrically with `as_activate`.
    pub fn as_deactivate(&self) {
        self.current.store(0, Ordering::Relaxed);
        tlb::flush(&self.machine);
    }

    // =========================================================================
    // Region definition
    // =========================================================================

    /// Declares a user segment of `size` bytes at `vaddr` with the given
    /// permissions. Every page of the range gets a translation with no
    /// backing frame; frames arrive lazily at fault time.
    ///
    /// Fails with `BadAddress` if the range reaches into the kernel segment
    /// or overlaps an existing region of this space, and with `OutOfMemory`
    /// if the page table fills. Either way no partial region remains.
    pub fn as_define_region(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        size: u32,
        readable: bool,
        writeable: bool,
        executable: bool,
    ) -> Result<(), VmError> {
        let mut perms = EntryFlags::empty();
        if readable {
            perms |= EntryFlags::READ;
        }
        if writeable {
            perms |= EntryFlags::WRITE;
        }
        if executable {
            perms |= EntryFlags::EXECUTE;
        }
        self.define_memory(space.asid(), vaddr, size, perms)
    }

    /// Declares the initial user stack: STACK_PAGES read-write pages ending
    /// at the top of user memory. Returns the initial stack pointer.
    pub fn as_define_stack(&self, space: &AddressSpace) -> Result<VirtAddr, VmError> {
        let base = USERSTACK - STACK_PAGES * PAGE_SIZE;
        self.define_memory(
            space.asid(),
            base,
            STACK_PAGES * PAGE_SIZE,
            EntryFlags::READ | EntryFlags::WRITE,
        )?;
        Ok(USERSTACK)
    }

    /// Inserts one frameless translation per page of `[vaddr, vaddr+size)`.
    fn define_memory(
        &self,
        asid: Asid,
        vaddr: VirtAddr,
        size: u32,
        perms: EntryFlags,
    ) -> Result<(), VmError> {
        // The range must stay below the kernel segment; the sum is taken in
        // 64 bits so a range touching the top of the address space can't
        // wrap.
        let end = vaddr.as_u32() as u64 + size as u64;
        if end > KSEG0_BASE as u64 {
            return Err(VmError::BadAddress);
        }

        let first_page = vaddr.as_u32() >> PAGE_SHIFT;
        let last_page = ((end + (PAGE_SIZE as u64 - 1)) >> PAGE_SHIFT) as u32;

        let mut flags = EntryFlags::VALID
            | EntryFlags::GLOBAL
            | EntryFlags::SWRITE
            | EntryFlags::DEFINED
            | perms;
        // DIRTY is derived from the declared write permission: hardware
        // write-enable for writable pages, read-only fault otherwise.
        if perms.contains(EntryFlags::WRITE) {
            flags |= EntryFlags::DIRTY;
        }

        let mut pages = self.pages.lock();
        let hpt = pages
            .as_mut()
            .expect("VM: region defined before bootstrap");

        for page in first_page..last_page {
            let vpn = VirtAddr::new(page << PAGE_SHIFT);

            let failure = if hpt.lookup(asid, vpn).is_some() {
                Some(VmError::BadAddress) // overlaps an existing region
            } else if !hpt.insert(asid, vpn, EntryLo::new(PhysAddr::zero(), flags)) {
                Some(VmError::OutOfMemory) // table full
            } else {
                None
            };

            if let Some(err) = failure {
                // Unwind the pages this call already inserted; none of them
                // has a frame yet.
                for done in first_page..page {
                    hpt.remove(asid, VirtAddr::new(done << PAGE_SHIFT));
                }
                return Err(err);
            }
        }

        Ok(())
    }

    // =========================================================================
    // The load window
    // =========================================================================

    /// Opens the load window. Nothing to do: regions are born with SWRITE
    /// set, so the loader can already write everywhere it declared.
    pub fn as_prepare_load(&self, _space: &AddressSpace) -> Result<(), VmError> {
        Ok(())
    }

    /// Closes the load window: clears SWRITE on every translation of this
    /// space, then flushes the TLB so entries minted during the window
    /// (whose DIRTY bit was promoted by the soft write) are re-derived from
    /// the real permissions on the next fault.
    pub fn as_complete_load(&self, space: &AddressSpace) -> Result<(), VmError> {
        let asid = space.asid();
        {
            let mut pages = self.pages.lock();
            if let Some(hpt) = pages.as_mut() {
                for index in 0..hpt.len() {
                    let Some((owner, _, lo)) = hpt.slot(index) else {
                        continue;
                    };
                    if owner == asid && lo.contains(EntryFlags::SWRITE) {
                        hpt.entry_lo_mut(index).remove(EntryFlags::SWRITE);
                    }
                }
            }
        }
        tlb::flush(&self.machine);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::TestMachine;

    const MIB: u32 = 1024 * 1024;

    fn machine() -> TestMachine {
        TestMachine::new(MIB, 0x4000)
    }

    fn vm_on(machine: &TestMachine) -> Vm<&TestMachine> {
        let vm = Vm::new(machine);
        vm.bootstrap();
        vm
    }

    /// Counts live translations owned by `asid`.
    fn owned_slots(vm: &Vm<&TestMachine>, asid: Asid) -> usize {
        let pages = vm.pages.lock();
        let hpt = pages.as_ref().unwrap();
        (0..hpt.len())
            .filter(|&i| matches!(hpt.slot(i), Some((owner, _, _)) if owner == asid))
            .count()
    }

    #[test]
    fn asids_are_unique_and_nonzero() {
        let machine = machine();
        let vm = vm_on(&machine);
        let a = vm.as_create();
        let b = vm.as_create();
        assert_ne!(a.asid(), b.asid());
        assert_ne!(a.asid().as_u32(), 0);
    }

    #[test]
    fn define_region_inserts_one_entry_per_page() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();

        vm.as_define_region(&space, VirtAddr::new(0x0040_0000), 3 * PAGE_SIZE, true, true, false)
            .unwrap();
        assert_eq!(owned_slots(&vm, space.asid()), 3);

        // Unaligned start and length round outward to whole pages.
        vm.as_define_region(&space, VirtAddr::new(0x0050_0800), PAGE_SIZE, true, false, false)
            .unwrap();
        assert_eq!(owned_slots(&vm, space.asid()), 5);
    }

    #[test]
    fn region_may_end_exactly_at_the_kernel_segment() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();

        let base = VirtAddr::new(KSEG0_BASE - PAGE_SIZE);
        vm.as_define_region(&space, base, PAGE_SIZE, true, false, false)
            .unwrap();

        let err = vm
            .as_define_region(&space, base, PAGE_SIZE + 1, true, false, false)
            .unwrap_err();
        assert_eq!(err, VmError::BadAddress);
    }

    #[test]
    fn overlapping_region_is_rejected_and_rolled_back() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();

        vm.as_define_region(&space, VirtAddr::new(0x0040_2000), PAGE_SIZE, true, false, false)
            .unwrap();
        let before = owned_slots(&vm, space.asid());

        // A 3-page range whose last page collides: the two fresh pages must
        // be unwound.
        let err = vm
            .as_define_region(
                &space,
                VirtAddr::new(0x0040_0000),
                3 * PAGE_SIZE,
                true,
                true,
                false,
            )
            .unwrap_err();
        assert_eq!(err, VmError::BadAddress);
        assert_eq!(owned_slots(&vm, space.asid()), before);
    }

    #[test]
    fn stack_sits_below_userstack() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();

        let sp = vm.as_define_stack(&space).unwrap();
        assert_eq!(sp, USERSTACK);
        assert_eq!(owned_slots(&vm, space.asid()), STACK_PAGES as usize);

        // The page just below the stack pointer is mapped...
        let pages = vm.pages.lock();
        let hpt = pages.as_ref().unwrap();
        assert!(hpt
            .lookup(space.asid(), USERSTACK - PAGE_SIZE)
            .is_some());
        // ...and the page below the stack's base is not.
        assert!(hpt
            .lookup(space.asid(), USERSTACK - (STACK_PAGES + 1) * PAGE_SIZE)
            .is_none());
    }

    #[test]
    fn complete_load_touches_only_swrite() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();

        vm.as_define_region(&space, VirtAddr::new(0x0040_0000), 2 * PAGE_SIZE, true, false, true)
            .unwrap();
        vm.as_prepare_load(&space).unwrap();

        let before: Vec<u32> = {
            let pages = vm.pages.lock();
            let hpt = pages.as_ref().unwrap();
            (0..hpt.len())
                .filter_map(|i| hpt.slot(i))
                .filter(|(owner, _, _)| *owner == space.asid())
                .map(|(_, _, lo)| lo.raw())
                .collect()
        };
        assert!(before.iter().all(|raw| raw & EntryFlags::SWRITE.bits() != 0));

        vm.as_complete_load(&space).unwrap();

        let after: Vec<u32> = {
            let pages = vm.pages.lock();
            let hpt = pages.as_ref().unwrap();
            (0..hpt.len())
                .filter_map(|i| hpt.slot(i))
                .filter(|(owner, _, _)| *owner == space.asid())
                .map(|(_, _, lo)| lo.raw())
                .collect()
        };

        // Identity on everything outside the SWRITE bit.
        let mut expected: Vec<u32> = before
            .iter()
            .map(|raw| raw & !EntryFlags::SWRITE.bits())
            .collect();
        expected.sort_unstable();
        let mut got = after.clone();
        got.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn destroy_removes_every_translation_and_frame() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();
        vm.as_activate(&space);

        vm.as_define_region(&space, VirtAddr::new(0x0040_0000), 2 * PAGE_SIZE, true, true, false)
            .unwrap();
        // Fault a frame in so destroy has something to release.
        vm.fault(crate::vm::FaultKind::Write, VirtAddr::new(0x0040_0010))
            .unwrap();

        let used_before = vm.stats().used_frames;
        assert_eq!(used_before, 1);

        let asid = space.asid();
        vm.as_destroy(space);
        assert_eq!(owned_slots(&vm, asid), 0);
        assert_eq!(vm.stats().used_frames, 0);
    }

    #[test]
    fn copy_duplicates_frames_byte_for_byte() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();
        vm.as_activate(&space);

        let vaddr = VirtAddr::new(0x0040_0000);
        vm.as_define_region(&space, vaddr, PAGE_SIZE, true, true, false)
            .unwrap();
        vm.fault(crate::vm::FaultKind::Write, vaddr).unwrap();

        // Plant a byte in the original's frame.
        let original_frame = {
            let pages = vm.pages.lock();
            let hpt = pages.as_ref().unwrap();
            let index = hpt.lookup(space.asid(), vaddr).unwrap();
            hpt.entry_lo(index).frame()
        };
        machine.write_phys(original_frame.as_u32(), 0x42);

        let twin = vm.as_copy(&space).unwrap();
        let twin_frame = {
            let pages = vm.pages.lock();
            let hpt = pages.as_ref().unwrap();
            let index = hpt.lookup(twin.asid(), vaddr).unwrap();
            let lo = hpt.entry_lo(index);
            assert!(lo.has_frame());
            lo.frame()
        };

        assert_ne!(twin_frame, original_frame, "copy must not share frames");
        assert_eq!(machine.read_phys(twin_frame.as_u32()), 0x42);
        assert_eq!(vm.stats().used_frames, 2);
    }

    #[test]
    fn copy_mirrors_frameless_entries_without_frames() {
        let machine = machine();
        let vm = vm_on(&machine);
        let space = vm.as_create();

        vm.as_define_region(&space, VirtAddr::new(0x0040_0000), 2 * PAGE_SIZE, true, false, false)
            .unwrap();
        let twin = vm.as_copy(&space).unwrap();

        assert_eq!(owned_slots(&vm, twin.asid()), 2);
        assert_eq!(vm.stats().used_frames, 0);

        let pages = vm.pages.lock();
        let hpt = pages.as_ref().unwrap();
        let index = hpt.lookup(twin.asid(), VirtAddr::new(0x0040_0000)).unwrap();
        let lo = hpt.entry_lo(index);
        assert!(!lo.has_frame());
        assert!(lo.contains(EntryFlags::DEFINED | EntryFlags::READ));
    }

    #[test]
    fn copy_failure_destroys_the_twin() {
        // A machine small enough that the second frame allocation fails.
        let machine = TestMachine::new(64 * PAGE_SIZE, 0x4000);
        let vm = vm_on(&machine);
        let space = vm.as_create();
        vm.as_activate(&space);

        // Two writable pages with frames attached.
        vm.as_define_region(&space, VirtAddr::new(0x0040_0000), 2 * PAGE_SIZE, true, true, false)
            .unwrap();
        vm.fault(crate::vm::FaultKind::Write, VirtAddr::new(0x0040_0000))
            .unwrap();
        vm.fault(crate::vm::FaultKind::Write, VirtAddr::new(0x0040_1000))
            .unwrap();

        // Drain the free list so the copy cannot allocate.
        let mut hoard = Vec::new();
        while let Ok(page) = vm.alloc_kpages(1) {
            hoard.push(page);
        }

        let used_before = vm.stats().used_frames;
        let err = vm.as_copy(&space).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);

        // The twin's translations and any half-copied frames are gone.
        assert_eq!(vm.stats().used_frames, used_before);
        for page in hoard {
            vm.free_kpages(page);
        }
    }
}
