//! Paged VM Objects
//!
//! Based on Mach4 vm/vm_object.c and vm/vm_user.c
//!
//! Factories for page-backed objects and the operations callers perform
//! on them: read, write, commit, decommit, pin, resize and pager supply.
//! Slices forward every operation to the object they view.
//!
//! Operations that meet a pending pager request drop the tree lock, wait,
//! and revalidate the range before carrying on. A range that shrank while
//! unlocked completes for the part that is still there.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::clone_tree::{self, Teardown};
use super::lock::TreeGuard;
use super::mapping::{range_change_update, RangeChangeOp};
use super::page_list::MAX_SIZE;
use super::page_source::{PageRequest, PageSource};
use super::vm_error::{VmError, VmResult};
use super::vm_fault::{self, FaultFlags};
use super::vm_node::{NodeFlags, NodeKind, PagedNode, TreeState, VmNode};
use super::vm_object::{
    self, CachePolicy, CloneTree, PagerMissPolicy, VmObject, VmObjectId, VmoOptions,
};
use super::vm_page::{
    is_page_aligned, round_page_checked, trunc_page, PageNum, PageRegistry, PmmAllocFlags,
    PAGE_SIZE,
};

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// Factories
// ============================================================================

/// Register a new single-node tree holding the node `build` makes
pub(crate) fn create_root<F>(pmm: &Arc<PageRegistry>, build: F) -> VmResult<Arc<VmObject>>
where
    F: FnOnce(VmObjectId) -> (NodeKind, CachePolicy),
{
    vm_object::ensure_initialized()?;
    let id = vm_object::alloc_id();
    let tree = CloneTree::new(pmm.clone());
    {
        let mut state = tree.lock.lock();
        let token = state.token();
        let (kind, cache_policy) = build(id);
        let lock_id = state.lock_id;
        state.insert(token, VmNode::new(id, lock_id, cache_policy, kind));
    }
    vm_object::register(&[id], &tree);
    Ok(VmObject::from_parts(id, tree))
}

/// Round a requested size up to whole pages
fn checked_size(size: u64) -> VmResult<u64> {
    let size = round_page_checked(size).ok_or(VmError::OutOfRange)?;
    if size > MAX_SIZE {
        return Err(VmError::OutOfRange);
    }
    Ok(size)
}

impl VmObject {
    /// Create an anonymous object; pages are allocated on first write
    pub fn create(
        pmm: &Arc<PageRegistry>,
        alloc_flags: PmmAllocFlags,
        options: VmoOptions,
        size: u64,
    ) -> VmResult<Arc<VmObject>> {
        let size = checked_size(size)?;
        let flags = if options.contains(VmoOptions::RESIZABLE) {
            NodeFlags::RESIZABLE
        } else {
            NodeFlags::empty()
        };
        create_root(pmm, |id| {
            (NodeKind::Paged(PagedNode::new(size, flags, alloc_flags, id)), CachePolicy::Cached)
        })
    }

    /// Create an object backed by one physically contiguous run
    ///
    /// Every page is committed up front and carries one pin for as long as
    /// the object exists, so the run can never be relocated.
    pub fn create_contiguous(
        pmm: &Arc<PageRegistry>,
        alloc_flags: PmmAllocFlags,
        size: u64,
        alignment_log2: u8,
    ) -> VmResult<Arc<VmObject>> {
        if size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = checked_size(size)?;
        let count = usize::try_from(size / PAGE).map_err(|_| VmError::OutOfRange)?;

        let mut run = Vec::with_capacity(count);
        pmm.alloc_contiguous(count, alloc_flags, alignment_log2, &mut run)?;
        for &page in &run {
            if let Err(err) = pmm.page(page).pin() {
                panic!("fresh contiguous page already saturated: {:?}", err);
            }
        }

        let base = run[0];
        let result = create_root(pmm, |id| {
            let mut node = PagedNode::new(size, NodeFlags::CONTIGUOUS, alloc_flags, id);
            node.contiguous_base = Some(base);
            for (i, &page) in run.iter().enumerate() {
                if node.page_list.add(i as u64 * PAGE, page).is_err() {
                    panic!("duplicate offset in fresh contiguous object");
                }
            }
            (NodeKind::Paged(node), CachePolicy::Cached)
        });
        if result.is_err() {
            for &page in &run {
                pmm.page(page).unpin();
            }
            pmm.free(run);
        } else {
            log::debug!("contiguous object at {:#x}, {} pages", pmm.paddr(base), count);
        }
        result
    }

    /// Wrap pages handed out wired at boot
    ///
    /// The object takes ownership of `pages`, in offset order.
    pub fn create_from_wired_pages(
        pmm: &Arc<PageRegistry>,
        pages: &[PageNum],
    ) -> VmResult<Arc<VmObject>> {
        let size = checked_size(pages.len() as u64 * PAGE)?;
        for &page in pages {
            if !pmm.contains(page) || pmm.page(page).is_free() {
                return Err(VmError::InvalidArgs);
            }
        }
        create_root(pmm, |id| {
            let mut node = PagedNode::new(size, NodeFlags::empty(), PmmAllocFlags::ANY, id);
            for (i, &page) in pages.iter().enumerate() {
                if node.page_list.add(i as u64 * PAGE, page).is_err() {
                    panic!("duplicate offset in wired object");
                }
            }
            (NodeKind::Paged(node), CachePolicy::Cached)
        })
    }

    /// Create an object whose content comes from `source`
    pub fn create_external(
        pmm: &Arc<PageRegistry>,
        source: Arc<dyn PageSource>,
        options: VmoOptions,
        size: u64,
    ) -> VmResult<Arc<VmObject>> {
        let size = checked_size(size)?;
        let flags = if options.contains(VmoOptions::RESIZABLE) {
            NodeFlags::RESIZABLE
        } else {
            NodeFlags::empty()
        };
        create_root(pmm, |id| {
            let mut node = PagedNode::new(size, flags, PmmAllocFlags::ANY, id);
            node.page_source = Some(source);
            (NodeKind::Paged(node), CachePolicy::Cached)
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Follow slices down to the object that holds pages
fn resolve_slice(state: &TreeState, mut id: VmObjectId, mut offset: u64) -> (VmObjectId, u64) {
    loop {
        match state.node(id).as_paged() {
            Some(p) if p.is_slice() => {
                offset = match p.parent_offset.checked_add(offset) {
                    Some(off) => off,
                    None => panic!("slice offset overflow in {:?}", id),
                };
                id = match state.parent_of(id) {
                    Some(parent) => parent,
                    None => panic!("slice {:?} without a parent", id),
                };
            }
            _ => return (id, offset),
        }
    }
}

/// `[offset, offset + len)` must lie within `size`; returns the end
fn check_range(offset: u64, len: u64, size: u64) -> VmResult<u64> {
    let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
    if end > size {
        return Err(VmError::OutOfRange);
    }
    Ok(end)
}

/// Page-aligned `[start, end)` covering `[offset, offset + len)`
fn page_span(offset: u64, end: u64) -> (u64, u64) {
    // `end <= MAX_SIZE`, so rounding cannot overflow
    (trunc_page(offset), round_page_checked(end).unwrap_or(MAX_SIZE))
}

impl VmObject {
    fn require_paged(state: &TreeState, id: VmObjectId) -> VmResult<()> {
        if state.node(id).is_paged() {
            Ok(())
        } else {
            Err(VmError::NotSupported)
        }
    }

    /// Drop the lock, wait for the pager, and take the lock again
    fn wait_for_pager<'a>(
        &'a self,
        state: TreeGuard<'a, TreeState>,
        request: &mut PageRequest,
    ) -> VmResult<TreeGuard<'a, TreeState>> {
        drop(state);
        request.wait()?;
        Ok(self.lock())
    }

    /// Walk `[offset, offset + len)` page by page, faulting pages in
    ///
    /// `copy` gets the page, the offset within it, the position within the
    /// caller's buffer, and the byte count.
    fn read_write_internal<F>(&self, offset: u64, len: u64, write: bool, mut copy: F) -> VmResult<()>
    where
        F: FnMut(&PageRegistry, PageNum, usize, usize, usize),
    {
        let mut state = self.lock();
        Self::require_paged(&state, self.id())?;
        if state.node(self.id()).cache_policy != CachePolicy::Cached {
            return Err(VmError::BadState);
        }
        let mut end = check_range(offset, len, state.node(self.id()).size())?;

        let flags = if write {
            FaultFlags::SW_FAULT | FaultFlags::WRITE
        } else {
            FaultFlags::SW_FAULT
        };
        let mut request = PageRequest::new();
        let mut cur = offset;
        while cur < end {
            let page_offset = (cur % PAGE) as usize;
            let count = (PAGE - page_offset as u64).min(end - cur) as usize;
            match vm_fault::get_page(&mut state, self.id(), cur, flags, &mut request) {
                Ok(page) => {
                    let pmm = state.pmm.clone();
                    copy(&pmm, page, page_offset, (cur - offset) as usize, count);
                }
                Err(VmError::ShouldWait) => {
                    state = self.wait_for_pager(state, &mut request)?;
                    // The object may have shrunk while we waited
                    let size = state.node(self.id()).size();
                    if cur >= size {
                        return Ok(());
                    }
                    end = end.min(size);
                    continue;
                }
                Err(err) => return Err(err),
            }
            cur += count as u64;
        }
        Ok(())
    }
}

// ============================================================================
// Paged Operations
// ============================================================================

impl VmObject {
    /// Copy bytes out of the object
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VmResult<()> {
        self.read_write_internal(offset, buf.len() as u64, false, |pmm, page, page_off, buf_off, n| {
            pmm.read(page, page_off, &mut buf[buf_off..buf_off + n]);
        })
    }

    /// Copy bytes into the object, forking shared pages
    pub fn write(&self, offset: u64, buf: &[u8]) -> VmResult<()> {
        self.read_write_internal(offset, buf.len() as u64, true, |pmm, page, page_off, buf_off, n| {
            pmm.write(page, page_off, &buf[buf_off..buf_off + n]);
        })
    }

    /// Report the physical address of every page already backing
    /// `[offset, offset + len)`, without faulting anything in
    pub fn lookup<F>(&self, offset: u64, len: u64, mut f: F) -> VmResult<()>
    where
        F: FnMut(u64, u64),
    {
        let mut state = self.lock();
        let end = check_range(offset, len, state.node(self.id()).size())?;
        if len == 0 {
            return Ok(());
        }
        let (start, end) = page_span(offset, end);

        if let NodeKind::Physical(_) = state.node(self.id()).kind {
            let mut cur = start;
            while cur < end {
                f(cur, super::vm_object_physical::paddr_at(&state, self.id(), cur));
                cur += PAGE;
            }
            return Ok(());
        }

        let mut request = PageRequest::new();
        let mut cur = start;
        while cur < end {
            match vm_fault::get_page(&mut state, self.id(), cur, FaultFlags::empty(), &mut request) {
                Ok(page) => f(cur, state.pmm.paddr(page)),
                Err(VmError::NotFound) => {}
                Err(err) => return Err(err),
            }
            cur += PAGE;
        }
        Ok(())
    }

    /// Resolve a fault from a mapping; returns the physical address
    pub fn fault(&self, offset: u64, flags: FaultFlags) -> VmResult<u64> {
        let flags = if flags.is_fault() {
            flags
        } else {
            flags | FaultFlags::HW_FAULT
        };
        let mut state = self.lock();
        if let NodeKind::Physical(p) = &state.node(self.id()).kind {
            if offset >= p.size {
                return Err(VmError::OutOfRange);
            }
            return Ok(super::vm_object_physical::paddr_at(&state, self.id(), trunc_page(offset)));
        }

        let mut request = PageRequest::new();
        loop {
            if offset >= state.node(self.id()).size() {
                return Err(VmError::OutOfRange);
            }
            match vm_fault::get_page(&mut state, self.id(), offset, flags, &mut request) {
                Ok(page) => return Ok(state.pmm.paddr(page)),
                Err(VmError::ShouldWait) => {
                    state = self.wait_for_pager(state, &mut request)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Give every page in the range its own private page
    ///
    /// Pager misses are batched into as few requests as possible. Pages
    /// committed before a failure stay committed.
    pub fn commit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        let mut state = self.lock();
        Self::require_paged(&state, self.id())?;
        let end = check_range(offset, len, state.node(self.id()).size())?;
        if len == 0 {
            return Ok(());
        }
        let (start, mut end) = page_span(offset, end);
        let flags = FaultFlags::SW_FAULT | FaultFlags::WRITE;

        let mut request = PageRequest::new_batching();
        let mut cur = start;
        loop {
            while cur < end {
                match vm_fault::get_page(&mut state, self.id(), cur, flags, &mut request) {
                    Ok(_) => {}
                    // Offset recorded in the open batch; keep collecting
                    Err(VmError::ShouldWait) if request.is_batch_open() => {}
                    Err(VmError::ShouldWait) => {
                        state = self.wait_for_pager(state, &mut request)?;
                        end = end.min(state.node(self.id()).size());
                        continue;
                    }
                    Err(err) => return Err(err),
                }
                cur += PAGE;
            }

            if !request.is_batch_open() {
                return Ok(());
            }
            let source = match clone_tree::root_page_source(&state, self.id()) {
                Some(source) => source,
                None => panic!("batched pager request on {:?} without a pager", self.id()),
            };
            match source.finalize_request(&mut request) {
                Ok(()) => return Ok(()),
                Err(VmError::ShouldWait) => {
                    state = self.wait_for_pager(state, &mut request)?;
                    end = end.min(state.node(self.id()).size());
                    // Everything supplied is present now; sweep again
                    cur = start;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Return the pages of the range to the page registry
    pub fn decommit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        let mut state = self.lock();
        Self::require_paged(&state, self.id())?;
        let end = check_range(offset, len, state.node(self.id()).size())?;
        if len == 0 {
            return Ok(());
        }
        let (start, end) = page_span(offset, end);
        let (target, target_start) = resolve_slice(&state, self.id(), start);
        let target_end = target_start + (end - start);

        let node = state.paged(target);
        if node.is_contiguous() || node.page_source.is_some() || state.parent_of(target).is_some() {
            return Err(VmError::NotSupported);
        }
        let pmm = state.pmm.clone();
        let pinned = node
            .page_list
            .iter()
            .filter(|&(off, _)| off >= target_start && off < target_end)
            .any(|(_, page)| pmm.page(page).is_pinned());
        if pinned {
            return Err(VmError::BadState);
        }

        range_change_update(&state, target, target_start, target_end - target_start, RangeChangeOp::Unmap);
        let freed = state.paged_mut(target).page_list.remove_range(target_start, target_end);
        drop(state);
        log::debug!("decommitted {} pages of {:?}", freed.len(), target);
        pmm.free(freed);
        Ok(())
    }

    /// Commit and pin every page of the range
    pub fn pin(&self, offset: u64, len: u64) -> VmResult<()> {
        {
            let state = self.lock();
            if let NodeKind::Physical(p) = &state.node(self.id()).kind {
                check_range(offset, len, p.size)?;
                return Ok(());
            }
            check_range(offset, len, state.node(self.id()).size())?;
        }
        if len == 0 {
            return Ok(());
        }

        loop {
            self.commit_range(offset, len)?;
            let mut state = self.lock();
            let end = check_range(offset, len, state.node(self.id()).size())?;
            let (start, end) = page_span(offset, end);
            match pin_locked(&mut state, self.id(), start, end) {
                // Lost a page to a racing decommit; commit again
                Err(VmError::NotFound) => continue,
                result => return result,
            }
        }
    }

    /// Drop one pin from every page of the range
    ///
    /// Unpinning a page that is not pinned is a caller bug.
    pub fn unpin(&self, offset: u64, len: u64) {
        let mut state = self.lock();
        if !state.node(self.id()).is_paged() {
            return;
        }
        let end = match check_range(offset, len, state.node(self.id()).size()) {
            Ok(end) => end,
            Err(_) => panic!("unpin of {:#x}+{:#x} outside {:?}", offset, len, self.id()),
        };
        if len == 0 {
            return;
        }
        let (start, end) = page_span(offset, end);
        let (target, target_start) = resolve_slice(&state, self.id(), start);
        let list = &state.paged(target).page_list;
        let mut cur = target_start;
        while cur < target_start + (end - start) {
            match list.get(cur) {
                Some(page) => state.pmm.page(page).unpin(),
                None => panic!("unpin of uncommitted page {:#x} in {:?}", cur, target),
            }
            cur += PAGE;
        }
        let node = state.paged_mut(target);
        let pages = (end - start) / PAGE;
        assert!(node.user_pins >= pages, "unpin of {:?} without matching pins", target);
        node.user_pins -= pages;
    }

    /// Change the size
    ///
    /// Shrinking refuses to drop pinned pages, wakes pager waiters on the
    /// removed tail, and releases ancestor pages nobody can see any more.
    pub fn resize(&self, new_size: u64) -> VmResult<()> {
        let mut state = self.lock();
        let id = self.id();
        let Some(node) = state.node(id).as_paged() else {
            return Err(VmError::Unavailable);
        };
        if !node.is_resizable() {
            return Err(VmError::Unavailable);
        }
        let new_size = checked_size(new_size)?;
        let old_size = node.size;
        if new_size == old_size {
            return Ok(());
        }

        if new_size > old_size {
            state.paged_mut(id).size = new_size;
            range_change_update(&state, id, old_size, new_size - old_size, RangeChangeOp::Unmap);
            log::debug!("grew {:?} to {:#x}", id, new_size);
            return Ok(());
        }

        let pmm = state.pmm.clone();
        let mut teardown = Teardown::new(pmm.clone());
        let tail_pinned = node
            .page_list
            .iter()
            .filter(|&(off, _)| off >= new_size)
            .any(|(_, page)| pmm.page(page).is_pinned());
        if tail_pinned {
            return Err(VmError::BadState);
        }

        range_change_update(&state, id, new_size, old_size - new_size, RangeChangeOp::Unmap);
        if let Some(source) = &node.page_source {
            source.on_pages_supplied(new_size, old_size - new_size);
        }

        if state.parent_of(id).is_some() {
            let limit = state.paged(id).parent_limit;
            if new_size < limit {
                clone_tree::release_cow_parent_pages(&mut state, id, new_size, limit, &mut teardown);
            }
            let node = state.paged_mut(id);
            node.parent_limit = node.parent_limit.min(new_size);
            node.parent_start_limit = node.parent_start_limit.min(node.parent_limit);
        }
        clone_tree::update_child_parent_limits(&mut state, id, new_size);

        let node = state.paged_mut(id);
        teardown.freed.extend(node.page_list.remove_range(new_size, MAX_SIZE));
        node.size = new_size;
        state.debug_check_invariants();
        drop(state);

        log::debug!(
            "shrank {:?} to {:#x}, released {} pages",
            id,
            new_size,
            teardown.freed.len()
        );
        teardown.finish();
        Ok(())
    }

    /// Hand pager-supplied content to a pager-backed root
    ///
    /// Offsets that already hold a page keep it. Waiters on the whole range
    /// are woken either way.
    pub fn supply_pages(&self, offset: u64, data: &[u8]) -> VmResult<()> {
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgs);
        }
        let mut state = self.lock();
        let id = self.id();
        let source = match state.node(id).as_paged() {
            Some(p) if p.is_slice() => return Err(VmError::NotSupported),
            Some(p) => p.page_source.clone().ok_or(VmError::NotSupported)?,
            None => return Err(VmError::NotSupported),
        };
        let len = round_page_checked(data.len() as u64).ok_or(VmError::OutOfRange)?;
        let end = check_range(offset, len, state.paged(id).size)?;

        let pmm = state.pmm.clone();
        let alloc_flags = state.paged(id).alloc_flags;
        let mut cur = offset;
        while cur < end {
            if state.paged(id).page_list.get(cur).is_none() {
                let page = match pmm.alloc_page(alloc_flags) {
                    Ok(page) => page,
                    Err(err) => {
                        drop(state);
                        // Waiters on the pages already added must still wake
                        if cur > offset {
                            source.on_pages_supplied(offset, cur - offset);
                        }
                        return Err(err);
                    }
                };
                let start = (cur - offset) as usize;
                let chunk = &data[start..data.len().min(start + PAGE_SIZE)];
                pmm.write(page, 0, chunk);
                if state.paged_mut(id).page_list.add(cur, page).is_err() {
                    panic!("supply slot {:#x} of {:?} occupied", cur, id);
                }
                range_change_update(&state, id, cur, PAGE, RangeChangeOp::Unmap);
            }
            cur += PAGE;
        }
        drop(state);

        source.on_pages_supplied(offset, len);
        Ok(())
    }

    /// Choose how this object treats a refused pager request for an
    /// ancestor's content
    pub fn set_pager_miss_policy(&self, policy: PagerMissPolicy) -> VmResult<()> {
        let mut state = self.lock();
        match state.node_mut(self.id()).as_paged_mut() {
            Some(node) => {
                node.miss_policy = policy;
                Ok(())
            }
            None => Err(VmError::NotSupported),
        }
    }

    pub fn pager_miss_policy(&self) -> Option<PagerMissPolicy> {
        self.lock().node(self.id()).as_paged().map(|p| p.miss_policy)
    }
}

/// Pin `[start, end)` of `id`; every page must be committed
///
/// On saturation the pins already taken are dropped again.
fn pin_locked(state: &mut TreeState, id: VmObjectId, start: u64, end: u64) -> VmResult<()> {
    let (target, target_start) = resolve_slice(state, id, start);
    let target_end = target_start + (end - start);
    let list = &state.paged(target).page_list;

    let mut cur = target_start;
    let mut result = Ok(());
    while cur < target_end {
        let pinned = match list.get(cur) {
            Some(page) => state.pmm.page(page).pin(),
            None => Err(VmError::NotFound),
        };
        if let Err(err) = pinned {
            result = Err(err);
            break;
        }
        cur += PAGE;
    }

    if result.is_err() {
        let mut undo = target_start;
        while undo < cur {
            if let Some(page) = list.get(undo) {
                state.pmm.page(page).unpin();
            }
            undo += PAGE;
        }
    } else {
        state.paged_mut(target).user_pins += (end - start) / PAGE;
    }
    result
}
