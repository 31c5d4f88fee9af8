//! A software machine for the test suite.
//!
//! `TestMachine` stands in for the board: RAM is a page-aligned heap
//! buffer, the direct-mapped window is the buffer itself, the TLB is an
//! array of recorded (entry_hi, entry_lo) pairs with a round-robin
//! "random" slot, and the bootstrap allocator is a bump pointer. Tests
//! construct one per case, so cases never share state.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::string::String;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use super::Machine;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::tlb::NUM_TLB;

/// Recorded TLB state: one (entry_hi, entry_lo) pair per hardware slot.
struct TlbArray {
    entries: [(u32, u32); NUM_TLB as usize],
    /// Slot the next `tlb_random` lands in. Real hardware picks via a
    /// free-running counter; round-robin is close enough and deterministic.
    next_random: usize,
}

/// A fake board: probe-able RAM, a recording TLB, and a console string.
pub struct TestMachine {
    ram: *mut u8,
    ram_layout: Layout,
    ram_size: u32,
    /// Bump pointer of the bootstrap allocator; starts at the simulated
    /// kernel-image top and only ever grows.
    firstfree: AtomicU32,
    tlb: Mutex<TlbArray>,
    console: Mutex<String>,
    spl: AtomicU8,
}

// SAFETY: the RAM pointer is only written through &self methods whose
// callers (the VM core) serialize access with their own locks, and tests
// that inspect RAM do so after the operations under test complete.
unsafe impl Send for TestMachine {}
unsafe impl Sync for TestMachine {}

impl TestMachine {
    /// Builds a machine with `ram_size` bytes of zeroed RAM and a resident
    /// kernel image occupying `[0, kernel_top)`.
    pub fn new(ram_size: u32, kernel_top: u32) -> Self {
        assert!(ram_size % PAGE_SIZE == 0, "RAM size must be whole pages");
        assert!(kernel_top <= ram_size);
        let ram_layout = Layout::from_size_align(ram_size as usize, PAGE_SIZE as usize).unwrap();
        // SAFETY: layout has nonzero size; alloc_zeroed returns zeroed or null.
        let ram = unsafe { alloc_zeroed(ram_layout) };
        assert!(!ram.is_null(), "test RAM allocation failed");
        Self {
            ram,
            ram_layout,
            ram_size,
            firstfree: AtomicU32::new(kernel_top),
            tlb: Mutex::new(TlbArray {
                entries: [(0, 0); NUM_TLB as usize],
                next_random: 0,
            }),
            console: Mutex::new(String::new()),
            spl: AtomicU8::new(0),
        }
    }

    /// Reads one byte of physical RAM.
    pub fn read_phys(&self, paddr: u32) -> u8 {
        assert!(paddr < self.ram_size);
        // SAFETY: in bounds of the RAM buffer.
        unsafe { *self.ram.add(paddr as usize) }
    }

    /// Writes one byte of physical RAM.
    pub fn write_phys(&self, paddr: u32, value: u8) {
        assert!(paddr < self.ram_size);
        // SAFETY: in bounds of the RAM buffer.
        unsafe { *self.ram.add(paddr as usize) = value }
    }

    /// Snapshot of all TLB slots as (entry_hi, entry_lo) pairs.
    pub fn tlb_entries(&self) -> Vec<(u32, u32)> {
        self.tlb.lock().unwrap().entries.to_vec()
    }

    /// Finds the `entry_lo` of a valid TLB entry for the given VPN, if any.
    /// "Valid" means the VALID bit (bit 9) is set in `entry_lo`.
    pub fn tlb_lookup(&self, vpn: u32) -> Option<u32> {
        self.tlb
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|(hi, lo)| *hi == vpn && lo & (1 << 9) != 0)
            .map(|(_, lo)| *lo)
    }

    /// Everything written to the console so far.
    pub fn console_output(&self) -> String {
        self.console.lock().unwrap().clone()
    }
}

impl Drop for TestMachine {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ram, self.ram_layout) }
    }
}

impl Machine for TestMachine {
    fn ram_size(&self) -> u32 {
        self.ram_size
    }

    fn ram_firstfree(&self) -> u32 {
        self.firstfree.load(Ordering::SeqCst)
    }

    fn ram_stealmem(&self, npages: usize) -> PhysAddr {
        let bytes = npages as u32 * PAGE_SIZE;
        let base = self.firstfree.fetch_add(bytes, Ordering::SeqCst);
        if base + bytes > self.ram_size {
            return PhysAddr::zero();
        }
        PhysAddr::new(base)
    }

    fn direct_window(&self) -> *mut u8 {
        self.ram
    }

    fn tlb_write(&self, entry_hi: u32, entry_lo: u32, slot: u32) {
        assert!(slot < NUM_TLB, "TLB slot out of range");
        self.tlb.lock().unwrap().entries[slot as usize] = (entry_hi, entry_lo);
    }

    fn tlb_random(&self, entry_hi: u32, entry_lo: u32) {
        let mut tlb = self.tlb.lock().unwrap();
        let slot = tlb.next_random;
        tlb.entries[slot] = (entry_hi, entry_lo);
        tlb.next_random = (slot + 1) % NUM_TLB as usize;
    }

    fn splhigh(&self) -> u8 {
        self.spl.swap(1, Ordering::SeqCst)
    }

    fn splx(&self, level: u8) {
        self.spl.store(level, Ordering::SeqCst);
    }

    fn console_write(&self, text: &str) {
        self.console.lock().unwrap().push_str(text);
    }
}
