//! VM Page Management - Physical Page Registry
//!
//! Based on the Mach vm_page layer.
//! The page registry owns every physical page; VM objects only reference
//! pages by number. Each page carries the metadata the clone tree needs:
//! a pin count and the two per-branch split flags used by hidden nodes.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use super::vm_error::{VmError, VmResult};

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Largest pin count a page can hold before pinning fails
pub const MAX_PIN_COUNT: u32 = 31;

/// Physical page number (physical address >> PAGE_SHIFT)
pub type PageNum = u32;

// ============================================================================
// Page Flags
// ============================================================================

/// Page state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Page is on the free list
    pub const FREE: Self = Self(0x0001);
    /// Page is referenced by a VM object page list
    pub const OBJECT: Self = Self(0x0002);
    /// Page was handed out wired, before any object claimed it
    pub const WIRED: Self = Self(0x0004);
    /// The shared zero page
    pub const ZERO: Self = Self(0x0008);
    /// Already forked down the left branch of its hidden container
    pub const LEFT_SPLIT: Self = Self(0x0010);
    /// Already forked down the right branch of its hidden container
    pub const RIGHT_SPLIT: Self = Self(0x0020);

    /// Both split bits
    pub const SPLIT_MASK: Self = Self(0x0030);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits)
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the flags are set
    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// One side of a hidden merge node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Left,
    Right,
}

impl Branch {
    /// The opposite side
    pub const fn other(self) -> Self {
        match self {
            Branch::Left => Branch::Right,
            Branch::Right => Branch::Left,
        }
    }

    /// Split flag recording a fork down this side
    pub const fn split_flag(self) -> PageFlags {
        match self {
            Branch::Left => PageFlags::LEFT_SPLIT,
            Branch::Right => PageFlags::RIGHT_SPLIT,
        }
    }
}

/// Allocation hint forwarded unchanged to the page registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmmAllocFlags(pub u32);

impl PmmAllocFlags {
    /// No preference
    pub const ANY: Self = Self(0);
    /// Caller prefers not to dip into reserves
    pub const CAN_WAIT: Self = Self(0x1);
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Physical page metadata
///
/// Split flags are only touched under the owning clone tree's lock. The pin
/// count is updated atomically since pins are the one piece of page state
/// other paths inspect without that lock.
#[derive(Debug)]
pub struct VmPage {
    /// Physical address of this page
    pub phys_addr: u64,

    /// Page number in system
    pub page_num: PageNum,

    /// Page flags
    flags: AtomicU32,

    /// Pin count; non-zero pages are never freed or relocated
    pin_count: AtomicU32,

    /// Page contents; `None` reads as zeroes
    data: Mutex<Option<Box<[u8]>>>,
}

impl VmPage {
    /// Create a new free page
    pub fn new(phys_addr: u64, page_num: PageNum) -> Self {
        Self {
            phys_addr,
            page_num,
            flags: AtomicU32::new(PageFlags::FREE.bits()),
            pin_count: AtomicU32::new(0),
            data: Mutex::new(None),
        }
    }

    /// Get page flags
    pub fn get_flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set page flags
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear page flags
    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Check if page has specific flags
    pub fn has_flags(&self, flags: PageFlags) -> bool {
        self.get_flags().contains(flags)
    }

    pub fn is_free(&self) -> bool {
        self.has_flags(PageFlags::FREE)
    }

    /// Has this page been forked down `branch` already?
    pub fn is_split(&self, branch: Branch) -> bool {
        self.has_flags(branch.split_flag())
    }

    /// Either split flag set
    pub fn is_split_any(&self) -> bool {
        self.get_flags().intersects(PageFlags::SPLIT_MASK)
    }

    /// Current (left, right) split bits
    pub fn split_bits(&self) -> (bool, bool) {
        let flags = self.get_flags();
        (
            flags.contains(PageFlags::LEFT_SPLIT),
            flags.contains(PageFlags::RIGHT_SPLIT),
        )
    }

    /// Record a fork down `branch`
    ///
    /// Panics if the page was already forked down either side: a page in a
    /// hidden node can be split at most once.
    pub fn set_split(&self, branch: Branch) {
        let prev = self.flags.fetch_or(branch.split_flag().bits(), Ordering::SeqCst);
        let prev = PageFlags::from_bits_truncate(prev);
        assert!(
            !prev.intersects(PageFlags::SPLIT_MASK),
            "page {:#x} split twice ({:?} after {:?})",
            self.phys_addr,
            branch,
            prev
        );
    }

    /// Overwrite both split bits
    pub fn set_split_bits(&self, left: bool, right: bool) {
        assert!(!(left && right), "page {:#x} split both ways", self.phys_addr);
        self.clear_split();
        if left {
            self.set_flags(PageFlags::LEFT_SPLIT);
        }
        if right {
            self.set_flags(PageFlags::RIGHT_SPLIT);
        }
    }

    /// Forget any split state
    pub fn clear_split(&self) {
        self.clear_flags(PageFlags::SPLIT_MASK);
    }

    /// Pin the page
    pub fn pin(&self) -> VmResult<()> {
        self.pin_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                if count >= MAX_PIN_COUNT {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .map(|_| ())
            .map_err(|_| VmError::Unavailable)
    }

    /// Unpin the page; unpinning an unpinned page is fatal
    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "unpin of unpinned page {:#x}", self.phys_addr);
    }

    /// Get pin count
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    /// Check if page is pinned
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    fn reset(&self) {
        self.flags.store(PageFlags::FREE.bits(), Ordering::SeqCst);
        *self.data.lock() = None;
    }
}

// ============================================================================
// Page Registry
// ============================================================================

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub total: u32,
    pub free: u32,
    pub allocated: u64,
    pub freed: u64,
}

/// Physical page registry
///
/// Owns every page in a physical range. The first page of the range is
/// reserved as the shared zero page and is never handed out.
#[derive(Debug)]
pub struct PageRegistry {
    /// First page number covered
    first_page: PageNum,

    /// All pages in the range (indexed by page_num - first_page)
    pages: Vec<VmPage>,

    /// Free page numbers, ordered so contiguous runs can be found
    free: Mutex<BTreeSet<PageNum>>,

    /// The shared zero page
    zero_page: PageNum,

    /// Lifetime allocation counter
    allocated: AtomicU64,

    /// Lifetime free counter
    freed: AtomicU64,
}

impl PageRegistry {
    /// Create a registry over `[start, end)` physical addresses
    pub fn new(start: u64, end: u64) -> Self {
        let first_page = addr_to_page(round_page(start));
        let end_page = addr_to_page(trunc_page(end));
        assert!(end_page > first_page + 1, "page registry needs at least two pages");

        let count = (end_page - first_page) as usize;
        let mut pages = Vec::with_capacity(count);
        let mut free = BTreeSet::new();
        for i in 0..count {
            let page_num = first_page + i as PageNum;
            pages.push(VmPage::new(page_to_addr(page_num), page_num));
            free.insert(page_num);
        }

        // Reserve the first page as the shared zero page
        let zero_page = first_page;
        free.remove(&zero_page);
        pages[0].flags.store(PageFlags::ZERO.bits(), Ordering::SeqCst);

        Self {
            first_page,
            pages,
            free: Mutex::new(free),
            zero_page,
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Create a registry of `count` usable pages at a fixed base
    pub fn with_pages(count: usize) -> Arc<Self> {
        const BASE: u64 = 0x10_0000;
        Arc::new(Self::new(BASE, BASE + ((count as u64 + 1) << PAGE_SHIFT)))
    }

    /// The shared zero page
    pub fn zero_page(&self) -> PageNum {
        self.zero_page
    }

    /// Is this page number managed here?
    pub fn contains(&self, page_num: PageNum) -> bool {
        page_num >= self.first_page && ((page_num - self.first_page) as usize) < self.pages.len()
    }

    /// Get page by number
    pub fn get_page(&self, page_num: PageNum) -> Option<&VmPage> {
        if !self.contains(page_num) {
            return None;
        }
        self.pages.get((page_num - self.first_page) as usize)
    }

    /// Get page by number; the page must belong to this registry
    pub fn page(&self, page_num: PageNum) -> &VmPage {
        match self.get_page(page_num) {
            Some(page) => page,
            None => panic!("page {} is not managed by this registry", page_num),
        }
    }

    /// Physical address of a page
    pub fn paddr(&self, page_num: PageNum) -> u64 {
        self.page(page_num).phys_addr
    }

    /// Page number of a physical address, if managed here
    pub fn page_from_paddr(&self, paddr: u64) -> Option<PageNum> {
        let page_num = addr_to_page(paddr);
        self.contains(page_num).then_some(page_num)
    }

    fn take_free(&self, page_num: PageNum, state: PageFlags) {
        let page = self.page(page_num);
        debug_assert!(page.is_free());
        page.flags.store(state.bits(), Ordering::SeqCst);
        self.allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocate a single zeroed page
    pub fn alloc_page(&self, _flags: PmmAllocFlags) -> VmResult<PageNum> {
        let page_num = self.free.lock().pop_first().ok_or(VmError::NoMemory)?;
        self.take_free(page_num, PageFlags::OBJECT);
        Ok(page_num)
    }

    /// Allocate `count` pages; all or nothing
    pub fn alloc_pages(
        &self,
        count: usize,
        _flags: PmmAllocFlags,
        list: &mut Vec<PageNum>,
    ) -> VmResult<()> {
        let mut free = self.free.lock();
        if free.len() < count {
            return Err(VmError::NoMemory);
        }
        for _ in 0..count {
            if let Some(page_num) = free.pop_first() {
                self.take_free(page_num, PageFlags::OBJECT);
                list.push(page_num);
            }
        }
        Ok(())
    }

    /// Allocate `count` physically contiguous pages whose first physical
    /// address is aligned to `1 << alignment_log2`
    pub fn alloc_contiguous(
        &self,
        count: usize,
        _flags: PmmAllocFlags,
        alignment_log2: u8,
        list: &mut Vec<PageNum>,
    ) -> VmResult<()> {
        if count == 0 {
            return Ok(());
        }
        let align_pages: u64 = if (alignment_log2 as usize) <= PAGE_SHIFT {
            1
        } else {
            1u64
                .checked_shl(alignment_log2 as u32 - PAGE_SHIFT as u32)
                .ok_or(VmError::InvalidArgs)?
        };

        let mut free = self.free.lock();
        let mut run_start: Option<PageNum> = None;
        let mut run_len = 0usize;
        let mut found = None;
        for &page_num in free.iter() {
            match run_start {
                Some(start) if start as usize + run_len == page_num as usize => run_len += 1,
                _ => {
                    if (page_num as u64) % align_pages != 0 {
                        run_start = None;
                        run_len = 0;
                        continue;
                    }
                    run_start = Some(page_num);
                    run_len = 1;
                }
            }
            if run_len == count {
                found = run_start;
                break;
            }
        }

        let start = found.ok_or(VmError::NoMemory)?;
        for page_num in start..start + count as PageNum {
            free.remove(&page_num);
            self.take_free(page_num, PageFlags::OBJECT);
            list.push(page_num);
        }
        Ok(())
    }

    /// Allocate pages in the wired state, as boot-time allocations are
    pub fn alloc_wired(&self, count: usize) -> VmResult<Vec<PageNum>> {
        let mut list = Vec::with_capacity(count);
        self.alloc_pages(count, PmmAllocFlags::ANY, &mut list)?;
        for &page_num in &list {
            let page = self.page(page_num);
            page.clear_flags(PageFlags::OBJECT);
            page.set_flags(PageFlags::WIRED);
        }
        Ok(list)
    }

    /// Return a single page to the registry
    pub fn free_page(&self, page_num: PageNum) {
        let page = self.page(page_num);
        assert!(page_num != self.zero_page, "freeing the zero page");
        assert!(!page.is_free(), "double free of page {:#x}", page.phys_addr);
        assert!(
            !page.is_pinned(),
            "freeing pinned page {:#x} (pin count {})",
            page.phys_addr,
            page.pin_count()
        );
        page.reset();
        self.free.lock().insert(page_num);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a list of pages to the registry
    pub fn free(&self, list: Vec<PageNum>) {
        for page_num in list {
            self.free_page(page_num);
        }
    }

    /// Copy a whole page
    pub fn copy_page(&self, src: PageNum, dst: PageNum) {
        if src == dst {
            return;
        }
        let contents = self.page(src).data.lock().clone();
        *self.page(dst).data.lock() = contents;
    }

    /// Zero a whole page
    pub fn zero_fill(&self, page_num: PageNum) {
        *self.page(page_num).data.lock() = None;
    }

    /// Read bytes out of a page
    pub fn read(&self, page_num: PageNum, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        match self.page(page_num).data.lock().as_ref() {
            Some(data) => buf.copy_from_slice(&data[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
    }

    /// Write bytes into a page
    pub fn write(&self, page_num: PageNum, offset: usize, buf: &[u8]) {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        assert!(page_num != self.zero_page, "write to the zero page");
        let mut data = self.page(page_num).data.lock();
        let data = data.get_or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    /// Get number of free pages
    pub fn free_count(&self) -> u32 {
        self.free.lock().len() as u32
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        PageStats {
            total: self.pages.len() as u32,
            free: self.free_count(),
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Global State
// ============================================================================

static PAGE_REGISTRY: spin::Once<Arc<PageRegistry>> = spin::Once::new();

/// Initialize the global page registry with a physical memory range
pub fn init_memory(start: u64, end: u64) {
    PAGE_REGISTRY.call_once(|| Arc::new(PageRegistry::new(start, end)));
}

/// The global page registry, once initialized
pub fn registry() -> Option<Arc<PageRegistry>> {
    PAGE_REGISTRY.get().cloned()
}

/// Convert address to page number
pub const fn addr_to_page(addr: u64) -> PageNum {
    (addr >> PAGE_SHIFT) as PageNum
}

/// Convert page number to address
pub const fn page_to_addr(page: PageNum) -> u64 {
    (page as u64) << PAGE_SHIFT
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Round up, reporting overflow
pub fn round_page_checked(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_SIZE as u64 - 1)
        .map(|a| a & !(PAGE_SIZE as u64 - 1))
}

/// Is the value a multiple of the page size?
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}
