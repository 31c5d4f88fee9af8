// =============================================================================
// OpalOS — Physical and Virtual Address Types
// =============================================================================
//
// In OS development, confusing a physical address with a virtual address is
// one of the most common and catastrophic bugs. You hand what you think is
// a physical frame number to the TLB refill path, but it's actually a
// kernel-virtual address — you map user pages onto the kernel image and the
// system corrupts itself mysteriously.
//
// SOLUTION: Newtype pattern.
//   PhysAddr and VirtAddr are separate types. The compiler prevents you from
//   using one where the other is expected. Converting between them requires
//   explicit function calls that document the relationship.
//
// 32-BIT ADDRESS SPACE:
//   - Physical: up to 512 MiB of RAM, addressed from 0
//   - Virtual, lower half:  0x0000_0000 — 0x7FFF_FFFF  (user space)
//   - Virtual, upper half:  0x8000_0000 and above      (kernel space)
//
// DIRECT-MAPPED WINDOW (kseg0):
//   The kernel segment starting at KSEG0_BASE maps 1:1 onto low physical
//   memory without going through the TLB. If a frame lives at physical
//   0x0000_1000, the kernel touches it at virtual 0x8000_1000. This lets
//   the kernel access any physical memory without setting up translations.
//
// =============================================================================

use core::fmt;

// =============================================================================
// Page size constants
// =============================================================================

/// Size of a page (4 KiB).
pub const PAGE_SIZE: u32 = 4096;

/// Bit shift for pages (4K = 2^12).
pub const PAGE_SHIFT: u32 = 12;

/// Mask isolating the page-frame bits of an address (clears the offset).
pub const PAGE_FRAME: u32 = 0xFFFF_F000;

/// Base of the kernel segment; the upper bound on user virtual addresses.
/// Addresses at or above this never reach the TLB refill path.
pub const KSEG0_BASE: u32 = 0x8000_0000;

// =============================================================================
// PhysAddr — A physical memory address
// =============================================================================

/// A physical memory address.
///
/// Physical addresses refer to locations in the system's physical RAM.
/// They are what ends up in the frame field of a TLB entry after the
/// fault handler resolves a translation.
///
/// # Examples
/// ```
/// use opalos_kernel::memory::address::PhysAddr;
/// let addr = PhysAddr::new(0x1000);  // Physical frame at 4KB
/// assert!(addr.is_page_aligned());
/// let virt = addr.to_kvaddr();       // Its kseg0 mapping
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// A physical address must be below the kernel segment base — RAM larger
    /// than the direct-mapped window cannot be reached by this kernel.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        debug_assert!(addr < KSEG0_BASE, "physical address beyond the kseg0 window");
        Self(addr)
    }

    /// Returns the raw u32 value of this physical address.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Converts this physical address to its kernel-virtual (kseg0) mapping.
    #[inline]
    pub const fn to_kvaddr(self) -> VirtAddr {
        VirtAddr::new(self.0 + KSEG0_BASE)
    }

    /// Returns the index of the frame containing this address.
    #[inline]
    pub const fn frame_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// Returns true if this address is aligned to a 4KB page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Aligns this address down to the nearest 4KB page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & PAGE_FRAME)
    }

    /// Creates a zero physical address (used as a null/no-frame marker).
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns true if this is the zero address.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Display a physical address with a `P:` prefix to distinguish it from
/// virtual addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

// =============================================================================
// VirtAddr — A virtual memory address
// =============================================================================

/// A virtual memory address.
///
/// Virtual addresses are what the CPU issues for every access. User
/// addresses (below `KSEG0_BASE`) are translated by the TLB; kernel-segment
/// addresses bypass it through the direct-mapped window.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the raw u32 value of this virtual address.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true if this is a kernel-segment address.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KSEG0_BASE
    }

    /// Converts a kernel-segment (kseg0) address back to its physical
    /// address. Only meaningful for direct-mapped addresses.
    #[inline]
    pub const fn to_paddr(self) -> PhysAddr {
        debug_assert!(self.0 >= KSEG0_BASE, "not a kseg0 address");
        PhysAddr::new(self.0 - KSEG0_BASE)
    }

    /// Returns true if this address is aligned to a 4KB page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Aligns this address down to the nearest 4KB page boundary.
    /// For a user address this yields the virtual page number (VPN).
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & PAGE_FRAME)
    }

    /// Creates a zero virtual address (null pointer equivalent).
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns true if this is the zero address.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Display a virtual address with a `V:` prefix to distinguish from physical.
impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010X}", self.0)
    }
}

/// Allow adding a byte offset to a virtual address.
impl core::ops::Add<u32> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u32) -> Self {
        Self::new(self.0 + offset)
    }
}

/// Allow subtracting a byte offset from a virtual address.
impl core::ops::Sub<u32> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u32) -> Self {
        Self::new(self.0 - offset)
    }
}
