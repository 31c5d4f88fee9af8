// =============================================================================
// OpalOS — VM Subsystem Object
// =============================================================================
//
// `Vm` ties the pieces together: the frame table and hashed page table
// (both living at the top of RAM, behind their spinlocks), the identity
// of the currently running address space, and the machine underneath.
// The kernel constructs exactly one of these before bootstrap and routes
// every VM entry point through it:
//
//   trap vector     ─▶ fault()
//   kmalloc/kfree   ─▶ alloc_kpages() / free_kpages()
//   process module  ─▶ as_* lifecycle (memory/addrspace.rs)
//   early init      ─▶ bootstrap()
//
// LOCKING:
//   pages lock (page table) is the outermost VM lock; frames lock (frame
//   table) nests inside it when a fault attaches a frame or teardown
//   releases one. The stealmem lock is disjoint and only taken while the
//   frame table doesn't exist yet. Nothing blocks while holding any of
//   them.
//
// EARLY BOOT:
//   Before bootstrap() runs, alloc_kpages delegates to the machine's
//   bootstrap allocator, which hands out frames that are never freed.
//   The Option in the frames lock is the regime flag.
//
// =============================================================================

use core::sync::atomic::{AtomicU32, Ordering};

use crate::machine::Machine;
use crate::memory::addrspace::Asid;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::frame::{FrameTable, MemoryLayout};
use crate::memory::hpt::{EntryFlags, HashedPageTable, HptEntry};
use crate::sync::spinlock::SpinLock;

pub use crate::memory::frame::FrameStats;

// =============================================================================
// Error and fault kinds
// =============================================================================

/// Why a VM operation failed. Every fallible entry point reports one of
/// these; there are no retries and no partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical frame available, or the page table is full.
    OutOfMemory,
    /// The address is outside every declared region, inside the kernel
    /// segment, or the access violates the region's permissions.
    BadAddress,
    /// A write reached a page whose TLB entry is read-only (the hardware's
    /// read-only fault); the access is wrong, not the address.
    Invalid,
}

/// The kind of fault the trap vector observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A read missed the TLB.
    Read = 0,
    /// A write missed the TLB.
    Write = 1,
    /// A write hit a TLB entry without the DIRTY bit.
    ReadOnly = 2,
}

// =============================================================================
// The subsystem
// =============================================================================

/// The virtual-memory subsystem. One per kernel.
pub struct Vm<M: Machine> {
    pub(crate) machine: M,

    /// The frame table; `None` until bootstrap (early-boot regime flag).
    pub(crate) frames: SpinLock<Option<FrameTable>>,

    /// The hashed page table; `None` until bootstrap.
    pub(crate) pages: SpinLock<Option<HashedPageTable>>,

    /// Serializes calls into the machine's bootstrap allocator.
    stealmem_lock: SpinLock<()>,

    /// ASID of the running address space, or zero when none is active.
    pub(crate) current: AtomicU32,

    /// Source of fresh ASIDs; starts at 1, never reused.
    pub(crate) next_asid: AtomicU32,
}

impl<M: Machine> Vm<M> {
    /// Builds the subsystem in its pre-bootstrap state.
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            frames: SpinLock::new(None),
            pages: SpinLock::new(None),
            stealmem_lock: SpinLock::new(()),
            current: AtomicU32::new(0),
            next_asid: AtomicU32::new(1),
        }
    }

    /// The machine beneath the subsystem.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Lays out and initializes the frame table and hashed page table at
    /// the top of RAM. Called exactly once by early kernel init, after the
    /// machine can answer the RAM probe.
    ///
    /// # Panics
    /// If called more than once.
    pub fn bootstrap(&self) {
        let mut pages = self.pages.lock();
        let mut frames = self.frames.lock();
        assert!(
            pages.is_none() && frames.is_none(),
            "VM: bootstrap called more than once"
        );

        let ram_size = self.machine.ram_size();
        let kernel_top = self.machine.ram_firstfree();
        let layout = MemoryLayout::compute(ram_size);
        let window = self.machine.direct_window();

        log::info!(
            "[vm] {} KiB RAM, {} frames; kernel image below {}",
            ram_size / 1024,
            layout.total_frames,
            PhysAddr::new(kernel_top),
        );
        log::info!(
            "[vm] frame table at {}, page table at {} ({} slots)",
            PhysAddr::new(layout.ft_base),
            PhysAddr::new(layout.hpt_base),
            layout.hpt_len,
        );

        let ft = FrameTable::init(&layout, window, kernel_top);
        // SAFETY: the layout reserves exactly hpt_len slots at hpt_base,
        // inside RAM, below the frame table.
        let hpt_slots = unsafe { window.add(layout.hpt_base as usize) } as *mut HptEntry;
        let hpt = HashedPageTable::init(hpt_slots, layout.hpt_len);

        let (usable_bot, usable_top) = ft.usable_range();
        log::info!(
            "[vm] usable frames {}..={} ({} free, {} reserved)",
            usable_bot,
            usable_top,
            ft.stats().free_frames,
            ft.stats().reserved_frames,
        );

        *frames = Some(ft);
        *pages = Some(hpt);
    }

    // =========================================================================
    // Kernel pages (the kmalloc/kfree backend)
    // =========================================================================

    /// Allocates kernel pages and returns their kernel-virtual address.
    ///
    /// Before bootstrap this steals permanently from the machine's
    /// bootstrap allocator (any page count). Afterwards only single-page
    /// allocations exist, served zeroed from the frame table.
    pub fn alloc_kpages(&self, npages: usize) -> Result<VirtAddr, VmError> {
        let mut frames = self.frames.lock();
        match frames.as_mut() {
            None => {
                let _steal = self.stealmem_lock.lock();
                let paddr = self.machine.ram_stealmem(npages);
                if paddr.is_zero() {
                    Err(VmError::OutOfMemory)
                } else {
                    Ok(paddr.to_kvaddr())
                }
            }
            Some(ft) => {
                if npages != 1 {
                    return Err(VmError::OutOfMemory);
                }
                ft.alloc_frame()
                    .map(PhysAddr::to_kvaddr)
                    .ok_or(VmError::OutOfMemory)
            }
        }
    }

    /// Releases one reference to the kernel page at `vaddr`. A null address
    /// is ignored, as are frees before the frame table exists (early stolen
    /// memory is permanent).
    pub fn free_kpages(&self, vaddr: VirtAddr) {
        if vaddr.is_zero() {
            return;
        }
        let mut frames = self.frames.lock();
        let Some(ft) = frames.as_mut() else {
            return;
        };
        assert!(vaddr.is_kernel(), "free_kpages on a non-kernel address");
        ft.free_frame(vaddr.page_align_down().to_paddr());
    }

    /// Adds a reference to the kernel page at `vaddr`, so two owners can
    /// share one frame.
    pub fn share_kpage(&self, vaddr: VirtAddr) {
        if vaddr.is_zero() {
            return;
        }
        let mut frames = self.frames.lock();
        let Some(ft) = frames.as_mut() else {
            return;
        };
        assert!(vaddr.is_kernel(), "share_kpage on a non-kernel address");
        ft.share_frame(vaddr.page_align_down().to_paddr());
    }

    /// Snapshot of frame usage.
    ///
    /// # Panics
    /// If the frame table is not initialized yet.
    pub fn stats(&self) -> FrameStats {
        self.frames
            .lock()
            .as_ref()
            .expect("VM: stats before bootstrap")
            .stats()
    }

    // =========================================================================
    // Fault handling
    // =========================================================================

    /// Services a TLB miss or protection fault at `faultaddr`.
    ///
    /// Resolves the translation in the hashed page table, allocating the
    /// backing frame on first touch, and refills one TLB slot. The TLB
    /// write runs at raised interrupt priority; the page-table lock is
    /// released first.
    pub fn fault(&self, kind: FaultKind, faultaddr: VirtAddr) -> Result<(), VmError> {
        let Some(asid) = self.current_asid() else {
            return Err(VmError::BadAddress);
        };

        // A write through a clean TLB entry is a protection violation the
        // moment the hardware reports it; there is nothing to refill.
        if kind == FaultKind::ReadOnly {
            return Err(VmError::Invalid);
        }

        // Kernel-segment addresses never take this path; rejected before
        // any lock is touched.
        if faultaddr.is_kernel() {
            return Err(VmError::BadAddress);
        }

        let vpn = faultaddr.page_align_down();

        let mut pages = self.pages.lock();
        let hpt = pages.as_mut().ok_or(VmError::BadAddress)?;
        let index = hpt.lookup(asid, vpn).ok_or(VmError::BadAddress)?;

        let lo = hpt.entry_lo(index);
        let allowed = match kind {
            FaultKind::Read => lo.contains(EntryFlags::READ),
            FaultKind::Write => lo.intersects(EntryFlags::WRITE | EntryFlags::SWRITE),
            FaultKind::ReadOnly => unreachable!(),
        };
        if !allowed {
            return Err(VmError::BadAddress);
        }

        if !lo.has_frame() {
            let frame = self.grab_frame().ok_or(VmError::OutOfMemory)?;
            hpt.entry_lo_mut(index).attach_frame(frame);
        }

        let entry_hi = hpt.entry_hi(index).as_u32();
        let entry_lo = hpt.entry_lo(index).to_tlb(kind == FaultKind::Write);
        drop(pages);

        let spl = self.machine.splhigh();
        self.machine.tlb_random(entry_hi, entry_lo);
        self.machine.splx(spl);
        Ok(())
    }

    /// TLB shootdown request from another CPU. Multiprocessor operation is
    /// not supported by this VM.
    pub fn tlb_shootdown(&self) -> ! {
        panic!("VM: TLB shootdown on a single-CPU design");
    }

    // =========================================================================
    // Internals shared with the address-space operations
    // =========================================================================

    /// ASID of the running address space, if any.
    pub(crate) fn current_asid(&self) -> Option<Asid> {
        match self.current.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(Asid::new(raw)),
        }
    }

    /// Allocates one user frame from the frame table (never the bootstrap
    /// allocator). Takes the frame-table lock; callers may hold the
    /// page-table lock.
    pub(crate) fn grab_frame(&self) -> Option<PhysAddr> {
        self.frames.lock().as_mut().and_then(FrameTable::alloc_frame)
    }

    /// Releases one reference to a user frame.
    pub(crate) fn release_frame(&self, frame: PhysAddr) {
        if let Some(ft) = self.frames.lock().as_mut() {
            ft.free_frame(frame);
        }
    }

    /// Copies one page of physical memory through the direct-mapped window.
    pub(crate) fn copy_page(&self, from: PhysAddr, to: PhysAddr) {
        debug_assert!(from.is_page_aligned() && to.is_page_aligned());
        debug_assert!(from != to);
        let window = self.machine.direct_window();
        // SAFETY: both frames are inside RAM, distinct, and owned by the
        // caller; the window maps all of RAM.
        unsafe {
            core::ptr::copy_nonoverlapping(
                window.add(from.as_u32() as usize),
                window.add(to.as_u32() as usize),
                PAGE_SIZE as usize,
            );
        }
    }
}

// =============================================================================
// Tests — end-to-end scenarios over a test machine
// =============================================================================
