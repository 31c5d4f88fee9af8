// =============================================================================
// OpalOS — Frame Table (Free-List Frame Allocator)
// =============================================================================
//
// The frame table tracks every physical page frame (4 KiB each) in the
// machine. One entry per frame, indexed by physical frame number.
//
// ENTRY LAYOUT:
//   ref_count → how many translations reference the frame (fork sharing)
//   next      → index of the next free frame, or NO_NEXT_FRAME
//   state     → Unused (on the free list), Used, or Reserved
//
// TABLE PLACEMENT (computed at bootstrap from the RAM probe):
//
//   physical 0 ┌────────────────────┐
//              │ kernel image       │  Reserved
//              ├────────────────────┤ ← first free byte (RAM probe)
//              │ usable frames      │  threaded into the free list
//              ├────────────────────┤ ← hpt_base
//              │ hashed page table  │  Reserved (2 slots per frame)
//              ├────────────────────┤ ← ft_base
//              │ frame table        │  Reserved (this array)
//    RAM size  └────────────────────┘
//
//   The table lives inside the very RAM it manages, at the top, accessed
//   through the kernel direct-mapped window. The hashed page table sits
//   immediately below it; both regions' frames are marked Reserved so the
//   allocator can never hand them out.
//
// ALLOCATION STRATEGY:
//   Singly linked free list rooted at `next_free`. Allocation pops the
//   head, freeing pushes the head. Only single-frame allocations exist;
//   nothing in the kernel needs physically contiguous user memory.
//
// THREAD SAFETY:
//   The table itself is not a lock. `Vm` wraps it in a SpinLock and all
//   access goes through that (the frame-table lock, acquired inside the
//   page-table lock when a fault attaches a frame — never the other way
//   around).
//
// =============================================================================

use core::mem::size_of;
use core::ptr;

use crate::memory::address::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::hpt::HptEntry;

/// Free-list terminator.
pub const NO_NEXT_FRAME: i32 = -1;

/// Usage status of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameState {
    /// On the free list, refcount zero.
    Unused = 0,
    /// Allocated; refcount counts the translations that reference it.
    Used = 1,
    /// Never allocatable: kernel image, frame table, hashed page table.
    Reserved = 2,
}

/// One frame-table entry. Lives in raw RAM at the top of memory, so the
/// layout is fixed.
#[repr(C)]
struct FtEntry {
    ref_count: i32,
    next: i32,
    state: FrameState,
}

// =============================================================================
// Memory layout
// =============================================================================

/// Placement of the frame table and hashed page table, computed once at
/// bootstrap from the probed RAM size.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// Number of physical frames covering all of RAM.
    pub total_frames: usize,

    /// Physical address of the frame-table array (top of RAM).
    pub ft_base: u32,

    /// Physical address of the hashed-page-table array (below the frame table).
    pub hpt_base: u32,

    /// Number of hashed-page-table slots (2 × total_frames).
    pub hpt_len: usize,
}

impl MemoryLayout {
    /// Computes the table placement for `ram_size` bytes of physical RAM.
    pub fn compute(ram_size: u32) -> Self {
        let total_frames =
            ((ram_size as u64 + (PAGE_SIZE as u64 - 1)) / PAGE_SIZE as u64) as usize;
        let ft_bytes = (total_frames * size_of::<FtEntry>()) as u32;
        let ft_base = ram_size - ft_bytes;

        let hpt_len = total_frames * 2;
        let hpt_bytes = (hpt_len * size_of::<HptEntry>()) as u32;
        let hpt_base = ft_base - hpt_bytes;

        Self {
            total_frames,
            ft_base,
            hpt_base,
            hpt_len,
        }
    }
}

// =============================================================================
// Frame-usage statistics
// =============================================================================

/// Snapshot of physical memory usage.
///
/// Returned by `Vm::stats()` for boot-time reporting and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    /// Total number of physical frames tracked by the table.
    pub total_frames: usize,

    /// Frames currently allocated (state Used).
    pub used_frames: usize,

    /// Frames available for allocation.
    pub free_frames: usize,

    /// Frames that can never be allocated (kernel image + VM tables).
    pub reserved_frames: usize,
}

// =============================================================================
// The frame table
// =============================================================================

/// The frame allocator state.
///
/// Holds a pointer to the entry array (placed at the top of RAM, reached
/// through the direct-mapped window), the free-list head, and the bounds
/// of the usable region. Constructed once by `Vm::bootstrap`.
pub struct FrameTable {
    /// The entry array, one per physical frame.
    entries: *mut FtEntry,

    /// Number of entries (== frames covering all of RAM).
    total_frames: usize,

    /// Head of the free list, or NO_NEXT_FRAME when memory is exhausted.
    next_free: i32,

    /// Lowest allocatable frame index (first frame above the kernel image).
    usable_bot: usize,

    /// Highest allocatable frame index (last frame below the VM tables).
    usable_top: usize,

    /// Count of frames in state Used.
    used_frames: usize,

    /// Count of frames in state Reserved.
    reserved_frames: usize,

    /// Direct-mapped window base, for zeroing freshly allocated frames.
    window: *mut u8,
}

// SAFETY: the entry array is only touched through &mut self, and `Vm`
// serializes all access behind the frame-table spinlock.
unsafe impl Send for FrameTable {}

impl FrameTable {
    /// Builds the frame table in place at the top of RAM and threads the
    /// free list.
    ///
    /// `kernel_top` is the first free physical byte above the resident
    /// kernel image (the RAM probe's answer); everything below it and
    /// everything from `layout.hpt_base` up is marked Reserved.
    pub fn init(layout: &MemoryLayout, window: *mut u8, kernel_top: u32) -> Self {
        let total = layout.total_frames;
        // SAFETY: layout places the array inside RAM; the window covers all
        // of RAM; the region was carved out for exactly `total` entries.
        let entries = unsafe { window.add(layout.ft_base as usize) } as *mut FtEntry;
        debug_assert!(entries.align_offset(core::mem::align_of::<FtEntry>()) == 0);

        // First frame of the table region; every frame from here up holds
        // the hashed page table or the frame table itself.
        let tables_first = (layout.hpt_base >> PAGE_SHIFT) as usize;
        assert!(tables_first > 0, "VM tables would cover all of RAM");

        // Frames covering the kernel image. Frame 0 stays reserved even for
        // an empty image: a zero frame address doubles as the no-frame
        // marker in the page table.
        let kernel_frames =
            (((kernel_top as u64 + (PAGE_SIZE as u64 - 1)) / PAGE_SIZE as u64) as usize).max(1);
        assert!(
            kernel_frames <= tables_first,
            "kernel image collides with the VM tables"
        );

        let mut ft = Self {
            entries,
            total_frames: total,
            next_free: NO_NEXT_FRAME,
            usable_bot: kernel_frames,
            usable_top: tables_first - 1,
            used_frames: 0,
            reserved_frames: kernel_frames + (total - tables_first),
            window,
        };

        // The array starts as raw RAM of unknown content; write every entry
        // once before any reference to it is formed.
        for index in 0..total {
            let state = if index < kernel_frames || index >= tables_first {
                FrameState::Reserved
            } else {
                FrameState::Unused
            };
            let ref_count = if state == FrameState::Reserved { 1 } else { 0 };
            // SAFETY: index < total; the region holds `total` entries.
            unsafe {
                ptr::write(
                    entries.add(index),
                    FtEntry {
                        ref_count,
                        next: NO_NEXT_FRAME,
                        state,
                    },
                );
            }
        }

        // Thread the usable frames into the free list, lowest first. The
        // last usable frame terminates the list; Reserved frames are never
        // linked.
        if ft.usable_bot <= ft.usable_top {
            for index in ft.usable_bot..ft.usable_top {
                ft.set_entry(index, index as i32 + 1, 0, FrameState::Unused);
            }
            ft.set_entry(ft.usable_top, NO_NEXT_FRAME, 0, FrameState::Unused);
            ft.next_free = ft.usable_bot as i32;
        }

        ft
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates a single frame: pops the free-list head, zeroes the page
    /// through the direct-mapped window, and returns its physical address.
    ///
    /// Returns `None` when the free list is empty (out of memory).
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        if self.next_free == NO_NEXT_FRAME {
            return None;
        }

        let index = self.next_free as usize;
        assert!(
            index >= self.usable_bot && index <= self.usable_top,
            "frame free list escaped the usable range at index {}",
            index
        );

        let (state, refs, next) = {
            let entry = &self.entries()[index];
            (entry.state, entry.ref_count, entry.next)
        };
        assert!(
            state == FrameState::Unused && refs == 0,
            "frame {} on the free list but not Unused",
            index
        );

        self.next_free = next;
        self.set_entry(index, NO_NEXT_FRAME, 1, FrameState::Used);
        self.used_frames += 1;

        let paddr = PhysAddr::new((index as u32) << PAGE_SHIFT);
        // SAFETY: the frame is inside RAM and now exclusively ours.
        unsafe {
            ptr::write_bytes(
                self.window.add(paddr.as_u32() as usize),
                0,
                PAGE_SIZE as usize,
            );
        }

        Some(paddr)
    }

    /// Drops one reference to the frame containing `paddr`. When the last
    /// reference goes away the frame returns to the free list.
    ///
    /// # Panics
    /// If the frame is out of the usable range, not Used, or unreferenced
    /// (double free).
    pub fn free_frame(&mut self, paddr: PhysAddr) {
        let index = paddr.page_align_down().frame_index();
        assert!(
            index >= self.usable_bot && index <= self.usable_top,
            "freeing frame {} outside the usable range",
            index
        );

        let (state, refs) = {
            let entry = &self.entries()[index];
            (entry.state, entry.ref_count)
        };
        assert!(
            state == FrameState::Used,
            "double free detected at frame {}",
            index
        );
        assert!(refs >= 1);

        let remaining = refs - 1;
        if remaining == 0 {
            let prev_head = self.next_free;
            self.next_free = index as i32;
            self.set_entry(index, prev_head, 0, FrameState::Unused);
            self.used_frames -= 1;
        } else {
            self.entries_mut()[index].ref_count = remaining;
        }
    }

    /// Adds a reference to the frame containing `paddr`, for sharing one
    /// physical frame between two address spaces.
    ///
    /// # Panics
    /// If the frame is not currently Used with at least one reference.
    pub fn share_frame(&mut self, paddr: PhysAddr) {
        let index = paddr.page_align_down().frame_index();
        assert!(
            index >= self.usable_bot && index <= self.usable_top,
            "sharing frame {} outside the usable range",
            index
        );

        let (state, refs) = {
            let entry = &self.entries()[index];
            (entry.state, entry.ref_count)
        };
        assert!(state == FrameState::Used && refs >= 1);
        self.entries_mut()[index].ref_count += 1;
    }

    /// Returns a snapshot of current frame usage.
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.total_frames - self.used_frames - self.reserved_frames,
            reserved_frames: self.reserved_frames,
        }
    }

    /// The free-list head, for boot reporting.
    pub fn next_free_index(&self) -> Option<usize> {
        if self.next_free == NO_NEXT_FRAME {
            None
        } else {
            Some(self.next_free as usize)
        }
    }

    /// Bounds of the allocatable frame range, inclusive.
    pub fn usable_range(&self) -> (usize, usize) {
        (self.usable_bot, self.usable_top)
    }

    /// State of one frame, for diagnostics and tests.
    pub fn frame_state(&self, index: usize) -> FrameState {
        self.entries()[index].state
    }

    /// Reference count of one frame, for diagnostics and tests.
    pub fn frame_refs(&self, index: usize) -> i32 {
        self.entries()[index].ref_count
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn entries(&self) -> &[FtEntry] {
        // SAFETY: init wrote every entry; the array stays inside RAM.
        unsafe { core::slice::from_raw_parts(self.entries, self.total_frames) }
    }

    fn entries_mut(&mut self) -> &mut [FtEntry] {
        // SAFETY: as above, plus &mut self gives exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.entries, self.total_frames) }
    }

    /// Writes one entry, checking the invariants every entry must satisfy.
    fn set_entry(&mut self, index: usize, next: i32, ref_count: i32, state: FrameState) {
        debug_assert!(index < self.total_frames);
        debug_assert!(ref_count >= 0);
        debug_assert!(next == NO_NEXT_FRAME || (next >= 0 && (next as usize) < self.total_frames));

        let entry = &mut self.entries_mut()[index];
        entry.ref_count = ref_count;
        entry.next = next;
        entry.state = state;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::TestMachine;
    use crate::machine::Machine;

    const MIB: u32 = 1024 * 1024;

    fn setup(ram_size: u32, kernel_top: u32) -> (TestMachine, MemoryLayout, FrameTable) {
        let machine = TestMachine::new(ram_size, kernel_top);
        let layout = MemoryLayout::compute(machine.ram_size());
        let ft = FrameTable::init(&layout, machine.direct_window(), machine.ram_firstfree());
        (machine, layout, ft)
    }

    /// Walks the free list, panicking if it cycles or leaves the table.
    fn free_list_len(ft: &FrameTable) -> usize {
        let mut count = 0;
        let mut cursor = ft.next_free;
        while cursor != NO_NEXT_FRAME {
            let index = cursor as usize;
            assert!(index < ft.total_frames);
            assert_eq!(ft.frame_state(index), FrameState::Unused);
            count += 1;
            assert!(count <= ft.total_frames, "free list cycles");
            cursor = ft.entries()[index].next;
        }
        count
    }

    #[test]
    fn boot_layout_4mib() {
        let (_m, layout, ft) = setup(4 * MIB, 0x4000);

        assert_eq!(layout.total_frames, 1024);
        assert_eq!(layout.hpt_len, 2048);
        assert!(layout.hpt_base < layout.ft_base);
        assert!(layout.ft_base < 4 * MIB);

        // The kernel image covers frames 0..4; the free list starts just
        // above it.
        assert_eq!(ft.next_free_index(), Some(4));
        for index in 0..4 {
            assert_eq!(ft.frame_state(index), FrameState::Reserved);
        }

        // Every frame covering the tables at the top of RAM is reserved.
        let tables_first = (layout.hpt_base >> PAGE_SHIFT) as usize;
        for index in tables_first..layout.total_frames {
            assert_eq!(ft.frame_state(index), FrameState::Reserved);
        }

        // The free list holds exactly the Unused frames.
        let unused = (0..layout.total_frames)
            .filter(|&i| ft.frame_state(i) == FrameState::Unused)
            .count();
        assert_eq!(free_list_len(&ft), unused);
        assert_eq!(ft.stats().free_frames, unused);
        assert_eq!(ft.stats().used_frames, 0);
    }

    #[test]
    fn alloc_pops_and_zeroes() {
        let (machine, _layout, mut ft) = setup(MIB, 0x2000);

        let frame = ft.alloc_frame().unwrap();
        assert!(frame.is_page_aligned());
        assert_eq!(ft.frame_state(frame.frame_index()), FrameState::Used);
        assert_eq!(ft.frame_refs(frame.frame_index()), 1);

        // Dirty the page, free it, and check a fresh allocation of the same
        // frame comes back zeroed.
        machine.write_phys(frame.as_u32() + 17, 0xAB);
        ft.free_frame(frame);
        let again = ft.alloc_frame().unwrap();
        assert_eq!(again, frame); // LIFO free list
        assert_eq!(machine.read_phys(again.as_u32() + 17), 0);
    }

    #[test]
    fn alloc_free_restores_free_list() {
        let (_m, _layout, mut ft) = setup(MIB, 0x2000);

        let before = free_list_len(&ft);
        let frame = ft.alloc_frame().unwrap();
        assert_eq!(free_list_len(&ft), before - 1);
        ft.free_frame(frame);
        assert_eq!(free_list_len(&ft), before);
        assert_eq!(ft.frame_state(frame.frame_index()), FrameState::Unused);
    }

    #[test]
    fn shared_frame_survives_first_free() {
        let (_m, _layout, mut ft) = setup(MIB, 0x2000);

        let frame = ft.alloc_frame().unwrap();
        ft.share_frame(frame);
        assert_eq!(ft.frame_refs(frame.frame_index()), 2);

        ft.free_frame(frame);
        assert_eq!(ft.frame_state(frame.frame_index()), FrameState::Used);
        assert_eq!(ft.frame_refs(frame.frame_index()), 1);

        ft.free_frame(frame);
        assert_eq!(ft.frame_state(frame.frame_index()), FrameState::Unused);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_m, _layout, mut ft) = setup(MIB, 0x2000);

        let mut count = 0;
        while ft.alloc_frame().is_some() {
            count += 1;
            assert!(count <= 256, "allocated more frames than exist");
        }
        assert_eq!(count, ft.stats().used_frames);
        assert_eq!(ft.stats().free_frames, 0);
        assert!(ft.alloc_frame().is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let (_m, _layout, mut ft) = setup(MIB, 0x2000);
        let frame = ft.alloc_frame().unwrap();
        ft.free_frame(frame);
        ft.free_frame(frame);
    }

    #[test]
    #[should_panic(expected = "outside the usable range")]
    fn freeing_reserved_frame_panics() {
        let (_m, _layout, mut ft) = setup(MIB, 0x2000);
        ft.free_frame(PhysAddr::new(0));
    }
}
