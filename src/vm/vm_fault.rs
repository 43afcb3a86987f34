//! Page Fault Resolution
//!
//! Based on Mach4 vm/vm_fault.c
//!
//! Resolves an offset of a paged object to a physical page:
//! 1. Use the object's own page if it has one
//! 2. Otherwise walk up the clone tree to the first ancestor holding the
//!    page, or to the root
//! 3. Nothing found: ask the root's page source, or use the zero page
//! 4. Write faults give the object a private page, migrating a page out
//!    of hidden ancestors when only one side of the tree can still see it

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::mapping::{range_change_update, range_change_update_from_parent, RangeChangeOp};
use super::page_source::PageRequest;
use super::vm_error::{VmError, VmResult};
use super::vm_node::TreeState;
use super::vm_object::{PagerMissPolicy, VmObjectId};
use super::vm_page::{trunc_page, Branch, PageNum, PAGE_SIZE};

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// Fault Flags
// ============================================================================

/// Fault access flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultFlags(u32);

impl FaultFlags {
    /// Write access
    pub const WRITE: Self = Self(0x1);
    /// Software fault (read/write/commit paths)
    pub const SW_FAULT: Self = Self(0x2);
    /// Hardware fault from a mapping
    pub const HW_FAULT: Self = Self(0x4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Will a missing page be produced, or is this a pure lookup?
    pub const fn is_fault(&self) -> bool {
        (self.0 & (Self::SW_FAULT.0 | Self::HW_FAULT.0)) != 0
    }

    pub const fn is_write(&self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl core::ops::BitOr for FaultFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics
static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Faults satisfied with a fresh zeroed page
    pub zero_fill: AtomicU64,
    /// Pages copied to break sharing
    pub cow: AtomicU64,
    /// Pages moved down a level without copying
    pub migrated: AtomicU64,
    /// Faults that had to wait for a pager
    pub page_in: AtomicU64,
    /// Failed faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            migrated: AtomicU64::new(0),
            page_in: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_migrated(&self) {
        self.migrated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_page_in(&self) {
        self.page_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Initial Content Lookup
// ============================================================================

/// Where the content of an offset currently comes from
struct InitialContent {
    page: Option<PageNum>,
    owner: VmObjectId,
    owner_offset: u64,
}

/// Walk up from `id` to the first ancestor holding a page for `offset`
///
/// Stops at a window edge or at the root; `owner` is then the last node
/// whose view covers the offset.
fn find_initial_page_content(state: &TreeState, id: VmObjectId, offset: u64) -> InitialContent {
    let mut cur = id;
    let mut cur_offset = offset;
    loop {
        let node = state.node(cur);
        let Some(parent) = node.parent else {
            break;
        };
        let paged = state.paged(cur);
        if cur_offset < paged.parent_start_limit || cur_offset >= paged.parent_limit {
            break;
        }
        let parent_offset = match paged.parent_offset.checked_add(cur_offset) {
            Some(off) => off,
            None => panic!("parent offset overflow in {:?}", cur),
        };
        let parent_node = state.paged(parent);
        if parent_offset >= parent_node.size {
            break;
        }
        cur = parent;
        cur_offset = parent_offset;
        if let Some(page) = parent_node.page_list.get(parent_offset) {
            return InitialContent {
                page: Some(page),
                owner: cur,
                owner_offset: cur_offset,
            };
        }
    }
    InitialContent {
        page: None,
        owner: cur,
        owner_offset: cur_offset,
    }
}

// ============================================================================
// Page Lookup
// ============================================================================

/// Resolve `offset` of paged object `id` to a page
///
/// Without a fault flag this is a pure existence query: absent content is
/// `NotFound`. A fault that needs the pager records the request in
/// `request` and returns `ShouldWait`; the caller drops the tree lock,
/// waits and retries.
pub(crate) fn get_page(
    state: &mut TreeState,
    id: VmObjectId,
    offset: u64,
    flags: FaultFlags,
    request: &mut PageRequest,
) -> VmResult<PageNum> {
    let paged = state.paged(id);
    if offset >= paged.size {
        return Err(VmError::OutOfRange);
    }
    let offset = trunc_page(offset);

    // Slices forward to the object they view
    if paged.is_slice() {
        let target = match state.parent_of(id) {
            Some(parent) => parent,
            None => panic!("slice {:?} without a parent", id),
        };
        let target_offset = paged.parent_offset + offset;
        return get_page(state, target, target_offset, flags, request);
    }

    if flags.is_fault() {
        FAULT_STATS.incr_total();
    }

    if let Some(page) = paged.page_list.get(offset) {
        return Ok(page);
    }

    let content = find_initial_page_content(state, id, offset);
    let zero = state.pmm.zero_page();

    let page = match content.page {
        Some(page) => page,
        None if !flags.is_fault() => return Err(VmError::NotFound),
        None => match state.paged(content.owner).page_source.clone() {
            None => zero,
            Some(source) => match source.get_page(content.owner_offset, request) {
                Ok(page) => {
                    // A synchronous source hands the page to the owner
                    let owner = state.paged_mut(content.owner);
                    if let Err(err) = owner.page_list.add(content.owner_offset, page) {
                        state.pmm.free_page(page);
                        return Err(err);
                    }
                    range_change_update(state, content.owner, content.owner_offset, PAGE, RangeChangeOp::Unmap);
                    if content.owner == id {
                        return Ok(page);
                    }
                    page
                }
                Err(VmError::NotFound)
                    if content.owner != id
                        && state.paged(id).miss_policy == PagerMissPolicy::ZeroFill =>
                {
                    log::trace!("pager miss at {:#x} of {:?}, zero fill", offset, id);
                    zero
                }
                Err(err) => {
                    if err == VmError::ShouldWait {
                        FAULT_STATS.incr_page_in();
                    }
                    return Err(err);
                }
            },
        },
    };

    if !flags.is_write() {
        return Ok(page);
    }

    // A pinned page must keep backing whoever pinned it
    if page != zero && state.is_hidden(content.owner) && is_user_pinned(state, page) {
        log::debug!("write to {:?} at {:#x} refused, source page pinned", id, offset);
        return Err(VmError::BadState);
    }

    let migrate =
        page != zero && state.is_hidden(content.owner) && path_all_hidden(state, id, content.owner);

    let original_at = if migrate {
        clone_cow_page(state, id, offset, content.owner, page, content.owner_offset)?
    } else {
        let new_page = alloc_copy_page(state, id, page)?;
        if page == zero {
            FAULT_STATS.incr_zero_fill();
        } else {
            FAULT_STATS.incr_cow();
        }
        if let Err(err) = state.paged_mut(id).page_list.add(offset, new_page) {
            state.pmm.free_page(new_page);
            return Err(err);
        }
        range_change_update(state, id, offset, PAGE, RangeChangeOp::Unmap);
        (content.owner, content.owner_offset)
    };

    if state.paged(id).is_contiguous() {
        return Ok(contiguous_fixup(state, id, offset, page, original_at));
    }

    match state.paged(id).page_list.get(offset) {
        Some(page) => Ok(page),
        None => panic!("write fault left no page at {:#x} of {:?}", offset, id),
    }
}

/// Does `page` carry pins beyond the contiguity pin of its run?
fn is_user_pinned(state: &TreeState, page: PageNum) -> bool {
    let pins = state.pmm.page(page).pin_count();
    if pins == 0 {
        return false;
    }
    let in_run = state.ids().any(|id| {
        state.node(id).as_paged().is_some_and(|p| {
            !p.is_slice()
                && p.contiguous_base.is_some_and(|base| {
                    page >= base && u64::from(page - base) < p.size / PAGE
                })
        })
    });
    pins > u32::from(in_run)
}

/// Are all nodes strictly between `id` and its ancestor `owner` hidden?
fn path_all_hidden(state: &TreeState, id: VmObjectId, owner: VmObjectId) -> bool {
    let mut cur = state.parent_of(id);
    while let Some(node) = cur {
        if node == owner {
            return true;
        }
        if !state.is_hidden(node) {
            return false;
        }
        cur = state.parent_of(node);
    }
    false
}

/// Allocate a page for `id` holding a copy of `src`
fn alloc_copy_page(state: &TreeState, id: VmObjectId, src: PageNum) -> VmResult<PageNum> {
    let page = match state.pmm.alloc_page(state.paged(id).alloc_flags) {
        Ok(page) => page,
        Err(err) => {
            FAULT_STATS.incr_failures();
            return Err(err);
        }
    };
    if src != state.pmm.zero_page() {
        state.pmm.copy_page(src, page);
    }
    Ok(page)
}

/// Can only one child of hidden `container` still see `page` at `offset`?
fn is_uni_accessible(state: &TreeState, container: VmObjectId, page: PageNum, offset: u64) -> bool {
    if state.pmm.page(page).is_split_any() {
        return true;
    }
    let left = state.paged(state.child_on(container, Branch::Left));
    let right = state.paged(state.child_on(container, Branch::Right));
    !left.sees_parent_offset(offset) || !right.sees_parent_offset(offset)
}

// ============================================================================
// Fork-on-Write Migration
// ============================================================================

/// Bring a page held by hidden ancestor `owner` down into `id`
///
/// Walks from the owner down towards `id`. At each hidden level the page
/// moves down when only our side can see it, and is copied otherwise,
/// marking the branch we descended as split. An allocation failure stops
/// the walk; every node is consistent after each step.
///
/// Returns where the page originally found at the owner ended up.
fn clone_cow_page(
    state: &mut TreeState,
    id: VmObjectId,
    offset: u64,
    owner: VmObjectId,
    page: PageNum,
    owner_offset: u64,
) -> VmResult<(VmObjectId, u64)> {
    // Record the branch taken at every hidden level, top down
    let mut path: Vec<(VmObjectId, Branch)> = Vec::new();
    let mut cur = id;
    while cur != owner {
        let parent = match state.parent_of(cur) {
            Some(parent) => parent,
            None => panic!("{:?} is not an ancestor of {:?}", owner, id),
        };
        path.push((parent, state.branch_of(parent, cur)));
        cur = parent;
    }
    path.reverse();

    let mut target = page;
    let mut cur_offset = owner_offset;
    let mut original_at = (owner, owner_offset);
    let mut skip_range_update = true;

    for (i, &(container, branch)) in path.iter().enumerate() {
        let child = state.child_on(container, branch);
        let child_offset = match cur_offset.checked_sub(state.paged(child).parent_offset) {
            Some(off) => off,
            None => panic!("page below the window of {:?}", child),
        };

        if is_uni_accessible(state, container, target, cur_offset) {
            let vm_page = state.pmm.page(target);
            assert!(
                !vm_page.is_split(branch),
                "page {:#x} migrating down an already split branch",
                vm_page.phys_addr
            );
            state.paged_mut(container).page_list.remove(cur_offset);
            state.pmm.page(target).clear_split();
            if target == page {
                original_at = (child, child_offset);
            }
            FAULT_STATS.incr_migrated();
            log::trace!("moved page {:#x} of {:?} into {:?}", cur_offset, container, child);
        } else {
            let cover = alloc_copy_page(state, id, target)?;
            state.pmm.page(target).set_split(branch);
            FAULT_STATS.incr_cow();
            log::trace!("forked page {:#x} of {:?} into {:?}", cur_offset, container, child);
            target = cover;
            skip_range_update = false;
        }

        if state.paged_mut(child).page_list.add(child_offset, target).is_err() {
            panic!("fork target slot {:#x} of {:?} occupied", child_offset, child);
        }

        if !skip_range_update {
            if child != id {
                // Hidden nodes have no mappings; whoever sees the new page
                // from the other side of the next level must drop the old one
                let next_branch = path[i + 1].1;
                let other = state.child_on(child, next_branch.other());
                range_change_update_from_parent(state, other, child_offset, PAGE, RangeChangeOp::Unmap);
            } else {
                range_change_update(state, id, child_offset, PAGE, RangeChangeOp::Unmap);
            }
        }

        cur_offset = child_offset;
    }

    debug_assert_eq!(cur_offset, offset);
    Ok(original_at)
}

/// Make a contiguous object hold its own run page at `offset` again
///
/// If the write left a copy in `id`, the original run page is swapped back
/// in from wherever it sits. Split state travels with the slot, pin counts
/// stay with the physical page.
fn contiguous_fixup(
    state: &mut TreeState,
    id: VmObjectId,
    offset: u64,
    original: PageNum,
    original_at: (VmObjectId, u64),
) -> PageNum {
    let node = state.paged(id);
    let current = match node.page_list.get(offset) {
        Some(page) => page,
        None => panic!("contiguous fixup without a page at {:#x}", offset),
    };
    let Some(want) = node.contiguous_page_at(offset) else {
        return current;
    };
    if current == want {
        return current;
    }
    assert_eq!(original, want, "contiguous object lost its run page");

    let (loc, loc_offset) = original_at;
    debug_assert_ne!(loc, id);
    state.paged_mut(id).page_list.replace(offset, want);
    let displaced = state.paged_mut(loc).page_list.replace(loc_offset, current);
    debug_assert_eq!(displaced, Some(want));

    let (left, right) = state.pmm.page(want).split_bits();
    state.pmm.page(current).set_split_bits(left, right);
    state.pmm.page(want).clear_split();

    range_change_update(state, loc, loc_offset, PAGE, RangeChangeOp::Unmap);
    log::trace!("contiguous fixup at {:#x} of {:?}", offset, id);
    want
}
