//! Clone Tree Maintenance
//!
//! Based on the Mach shadow-chain collapse in vm/vm_object.c, reworked
//! around hidden merge nodes.
//!
//! A bidirectional clone of `V` inserts a hidden node `H` above `V` that
//! takes over `V`'s pages; `V` and the clone become `H`'s two children.
//! When one of them goes away `H` merges into the survivor. Pages that no
//! live object can see any more are released along the way.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::lock::LockToken;
use super::mapping::{range_change_update, RangeChangeOp};
use super::page_list::{MergeAction, VmPageList, MAX_SIZE};
use super::page_source::PageSource;
use super::vm_error::{VmError, VmResult};
use super::vm_node::{NodeFlags, NodeKind, PagedNode, TreeState, VmNode};
use super::vm_object::{
    self, CachePolicy, ChildObserver, ChildType, VmObject, VmObjectId,
};
use super::vm_page::{is_page_aligned, Branch, PageNum, PageRegistry, PAGE_SIZE};

// ============================================================================
// Deferred Teardown
// ============================================================================

/// Work collected under the tree lock and finished after dropping it
pub(crate) struct Teardown {
    pmm: Arc<PageRegistry>,
    pub freed: Vec<PageNum>,
    pub destroyed: Vec<VmObjectId>,
    pub sources: Vec<Arc<dyn PageSource>>,
    pub zero_children: Vec<Arc<dyn ChildObserver>>,
}

impl Teardown {
    pub(crate) fn new(pmm: Arc<PageRegistry>) -> Self {
        Self {
            pmm,
            freed: Vec::new(),
            destroyed: Vec::new(),
            sources: Vec::new(),
            zero_children: Vec::new(),
        }
    }

    /// Free pages, unregister objects, close sources, notify observers
    pub(crate) fn finish(self) {
        if !self.destroyed.is_empty() {
            vm_object::unregister(&self.destroyed);
            log::debug!(
                "destroyed {} objects, freed {} pages",
                self.destroyed.len(),
                self.freed.len()
            );
        }
        self.pmm.free(self.freed);
        for source in self.sources {
            source.close();
        }
        for observer in self.zero_children {
            observer.on_zero_children();
        }
    }
}

// ============================================================================
// Child Creation
// ============================================================================

impl VmObject {
    /// Create a slice or copy-on-write clone of `[offset, offset + size)`
    pub fn create_child(
        &self,
        child_type: ChildType,
        offset: u64,
        size: u64,
        resizable: bool,
        copy_name: bool,
    ) -> VmResult<Arc<VmObject>> {
        vm_object::ensure_initialized()?;
        if !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        if size > MAX_SIZE {
            return Err(VmError::OutOfRange);
        }
        offset.checked_add(size).ok_or(VmError::OutOfRange)?;

        let child_id = vm_object::alloc_id();
        let mut state = self.lock();
        let token = state.token();

        let physical = !state.node(self.id()).is_paged();
        let created = match (physical, child_type) {
            (true, ChildType::Slice) => {
                super::vm_object_physical::create_physical_slice(
                    &mut state, token, self.id(), child_id, offset, size, resizable,
                )
            }
            (true, _) => Err(VmError::NotSupported),
            (false, ChildType::Slice) => {
                create_slice(&mut state, token, self.id(), child_id, offset, size, resizable)
            }
            (false, ty) => create_clone(
                &mut state,
                token,
                self.id(),
                child_id,
                ty == ChildType::Snapshot,
                offset,
                size,
                resizable,
            ),
        }?;

        let name = copy_name.then(|| state.node(self.id()).name.clone());
        let child = state.node_mut(child_id);
        child.creator = Some(self.id());
        if let Some(name) = name {
            child.name = name;
        }
        let parent = state.node_mut(self.id());
        parent.user_child_count += 1;
        let notify = if parent.user_child_count == 1 {
            parent.child_observer.clone()
        } else {
            None
        };
        state.debug_check_acyclic(child_id);
        drop(state);

        vm_object::register(&created, self.tree());
        if let Some(observer) = notify {
            observer.on_one_child();
        }
        Ok(VmObject::from_parts(child_id, self.tree().clone()))
    }
}

/// Pure view of `[offset, offset + size)` of paged object `id`
fn create_slice(
    state: &mut TreeState,
    token: LockToken,
    id: VmObjectId,
    child_id: VmObjectId,
    offset: u64,
    size: u64,
    resizable: bool,
) -> VmResult<Vec<VmObjectId>> {
    let node = state.node(id);
    let paged = state.paged(id);
    if resizable || paged.is_resizable() {
        return Err(VmError::NotSupported);
    }
    // Uncached slices only make sense where no page will ever be allocated
    if node.cache_policy != CachePolicy::Cached && !paged.is_contiguous() {
        return Err(VmError::BadState);
    }
    if offset + size > paged.size {
        return Err(VmError::OutOfRange);
    }

    // Slices of slices view the underlying object directly
    let (parent, parent_offset) = if paged.is_slice() {
        match node.parent {
            Some(parent) => (parent, paged.parent_offset + offset),
            None => panic!("slice {:?} without a parent", id),
        }
    } else {
        (id, offset)
    };

    let mut flags = NodeFlags::SLICE;
    if paged.is_contiguous() {
        flags = flags | NodeFlags::CONTIGUOUS;
    }
    let mut child = PagedNode::new(size, flags, paged.alloc_flags, child_id);
    child.parent_offset = parent_offset;
    child.parent_limit = size;
    child.miss_policy = paged.miss_policy;

    let cache_policy = node.cache_policy;
    state.insert(token, VmNode::new(child_id, state.lock_id, cache_policy, NodeKind::Paged(child)));
    state.attach_child(token, parent, child_id);
    log::debug!("slice {:?} of {:?} at {:#x}+{:#x}", child_id, parent, parent_offset, size);
    Ok(vec![child_id])
}

/// Copy-on-write clone of `[offset, offset + size)` of paged object `id`
#[allow(clippy::too_many_arguments)]
fn create_clone(
    state: &mut TreeState,
    token: LockToken,
    id: VmObjectId,
    child_id: VmObjectId,
    bidirectional: bool,
    offset: u64,
    size: u64,
    resizable: bool,
) -> VmResult<Vec<VmObjectId>> {
    let node = state.node(id);
    let paged = state.paged(id);
    if node.cache_policy != CachePolicy::Cached {
        return Err(VmError::NotSupported);
    }

    // A clone of a slice clones the range of the underlying object
    let (target, target_offset, visible) = if paged.is_slice() {
        let parent = match node.parent {
            Some(parent) => parent,
            None => panic!("slice {:?} without a parent", id),
        };
        let visible = if offset < paged.size {
            size.min(paged.size - offset)
        } else {
            0
        };
        let target_offset = paged
            .parent_offset
            .checked_add(offset)
            .ok_or(VmError::OutOfRange)?;
        (parent, target_offset, visible)
    } else {
        (id, offset, size)
    };

    if bidirectional {
        // Pinned pages would move into the hidden node
        if state.paged(target).user_pins > 0 {
            return Err(VmError::BadState);
        }
        if root_page_source(state, target).is_some() {
            return Err(VmError::NotSupported);
        }
        let mut cur = Some(target);
        while let Some(ancestor) = cur {
            if !state.node(ancestor).is_paged() {
                return Err(VmError::NotSupported);
            }
            cur = state.parent_of(ancestor);
        }
    }

    let target_node = state.paged(target);
    let parent_limit = if target_offset < target_node.size {
        visible.min(target_node.size - target_offset)
    } else {
        0
    };
    let target_size = target_node.size;
    let flags = if resizable {
        NodeFlags::RESIZABLE
    } else {
        NodeFlags::empty()
    };
    let mut child = PagedNode::new(size, flags, target_node.alloc_flags, child_id);
    child.parent_offset = target_offset;
    child.parent_limit = parent_limit;
    child.miss_policy = target_node.miss_policy;

    let mut created = vec![child_id];
    let attach_to = if bidirectional {
        let hidden_id = vm_object::alloc_id();
        insert_hidden_parent(state, token, target, hidden_id);
        // The original must fault on its next write
        range_change_update(state, target, 0, target_size, RangeChangeOp::RemoveWrite);
        created.push(hidden_id);
        hidden_id
    } else {
        target
    };

    state.insert(
        token,
        VmNode::new(child_id, state.lock_id, CachePolicy::Cached, NodeKind::Paged(child)),
    );
    state.attach_child(token, attach_to, child_id);
    log::debug!(
        "{} clone {:?} of {:?} at {:#x}+{:#x} under {:?}",
        if bidirectional { "bidirectional" } else { "unidirectional" },
        child_id,
        target,
        target_offset,
        size,
        attach_to
    );
    Ok(created)
}

/// Put a new hidden node between `id` and its parent
///
/// The hidden node takes `id`'s pages, size and window; `id` then sees
/// all of the hidden node.
fn insert_hidden_parent(state: &mut TreeState, token: LockToken, id: VmObjectId, hidden_id: VmObjectId) {
    let old_parent = state.parent_of(id);
    let lock_id = state.lock_id;
    let node = state.paged_mut(id);

    let mut hidden = PagedNode::new(node.size, NodeFlags::HIDDEN, node.alloc_flags, node.attribution_id);
    hidden.page_list = core::mem::take(&mut node.page_list);
    hidden.parent_offset = node.parent_offset;
    hidden.parent_limit = node.parent_limit;
    hidden.parent_start_limit = node.parent_start_limit;
    hidden.partial_cow_release = node.partial_cow_release;
    hidden.miss_policy = node.miss_policy;

    node.parent_offset = 0;
    node.parent_limit = node.size;
    node.parent_start_limit = 0;
    node.partial_cow_release = false;

    let mut hidden_node = VmNode::new(hidden_id, lock_id, CachePolicy::Cached, NodeKind::Paged(hidden));
    hidden_node.has_handle = false;
    state.insert(token, hidden_node);

    if let Some(parent) = old_parent {
        state.replace_child(parent, id, hidden_id);
        state.node_mut(hidden_id).parent = Some(parent);
    }
    state.node_mut(id).parent = None;
    state.attach_child(token, hidden_id, id);
    log::debug!("hidden {:?} inserted above {:?}", hidden_id, id);
}

/// Page source of the root of `id`'s ancestor chain
pub(crate) fn root_page_source(state: &TreeState, id: VmObjectId) -> Option<Arc<dyn PageSource>> {
    state
        .node(state.root_of(id))
        .as_paged()
        .and_then(|p| p.page_source.clone())
}

// ============================================================================
// Child Removal
// ============================================================================

/// The caller's handle on `id` went away
pub(crate) fn release_handle(state: &mut TreeState, id: VmObjectId) -> Teardown {
    let mut teardown = Teardown::new(state.pmm.clone());
    let node = state.node_mut(id);
    node.has_handle = false;
    node.mappings.clear();

    if let Some(creator) = node.creator.take() {
        if let Some(creator) = state.try_node_mut(creator) {
            creator.user_child_count -= 1;
            if creator.user_child_count == 0 {
                if let Some(observer) = creator.child_observer.clone() {
                    teardown.zero_children.push(observer);
                }
            }
        }
    }

    let children = state.node(id).children.len();
    if children == 0 {
        destroy(state, id, &mut teardown);
    } else {
        log::debug!("{:?} closed, kept alive by {} children", id, children);
    }
    teardown
}

/// Remove childless `id`, then any ancestor that is now useless
fn destroy(state: &mut TreeState, id: VmObjectId, teardown: &mut Teardown) {
    let mut pending = vec![id];
    while let Some(id) = pending.pop() {
        debug_assert!(state.node(id).children.is_empty());
        release_contiguous_pins(state, id);

        let parent = state.parent_of(id);
        let branch = parent
            .filter(|&p| state.is_hidden(p))
            .map(|p| state.branch_of(p, id));

        let mut node = state.remove(id);
        teardown.destroyed.push(id);
        if let NodeKind::Paged(paged) = &mut node.kind {
            drain_pages(&state.pmm, id, &mut paged.page_list, &mut teardown.freed);
            if let Some(source) = paged.page_source.take() {
                teardown.sources.push(source);
            }
        }

        let Some(parent) = parent else {
            continue;
        };
        state.detach_child(parent, id);
        match (branch, &node.kind) {
            (Some(branch), NodeKind::Paged(removed)) => {
                merge_with_child(state, parent, removed, branch, teardown);
            }
            _ => {
                let parent_node = state.node(parent);
                if !parent_node.has_handle && parent_node.children.is_empty() {
                    pending.push(parent);
                }
            }
        }
    }
}

/// Move every page of a dying node into `freed`
fn drain_pages(pmm: &PageRegistry, id: VmObjectId, list: &mut VmPageList, freed: &mut Vec<PageNum>) {
    for page in list.drain() {
        let vm_page = pmm.page(page);
        if vm_page.is_pinned() {
            log::warn!(
                "{:?} destroyed with page {:#x} pinned {} times",
                id,
                vm_page.phys_addr,
                vm_page.pin_count()
            );
            while vm_page.is_pinned() {
                vm_page.unpin();
            }
        }
        vm_page.clear_split();
        freed.push(page);
    }
}

/// Drop the contiguity pin a contiguous object holds on its run
fn release_contiguous_pins(state: &TreeState, id: VmObjectId) {
    let Some(paged) = state.node(id).as_paged() else {
        return;
    };
    if paged.is_slice() {
        return;
    }
    let Some(base) = paged.contiguous_base else {
        return;
    };
    let end = base + (paged.size / PAGE_SIZE as u64) as PageNum;
    let mut cur = Some(id);
    while let Some(node) = cur {
        for (_, page) in state.paged(node).page_list.iter() {
            if page >= base && page < end {
                state.pmm.page(page).unpin();
            }
        }
        cur = state.parent_of(node);
    }
}

/// Hidden `hidden` lost its `removed_branch` child; fold it into the
/// survivor and splice the survivor into its place
fn merge_with_child(
    state: &mut TreeState,
    hidden: VmObjectId,
    removed: &PagedNode,
    removed_branch: Branch,
    teardown: &mut Teardown,
) {
    let child = match state.node(hidden).children.as_slice() {
        [child] => *child,
        other => panic!("hidden {:?} left with {} children", hidden, other.len()),
    };

    reattribute(state, hidden, child);

    let c = state.paged(child);
    let child_offset = c.parent_offset;
    let visibility_start = c.parent_offset + c.parent_start_limit;
    let merge_end = c.parent_offset + c.parent_limit;
    let child_hidden = c.is_hidden();
    let child_contiguous = c.is_contiguous();

    // Whatever the survivor cannot see is garbage
    let h = state.paged_mut(hidden);
    teardown.freed.extend(h.page_list.remove_range(0, visibility_start));
    teardown.freed.extend(h.page_list.remove_range(merge_end, MAX_SIZE));
    let h_limit = h.parent_limit;

    let h_parent = state.parent_of(hidden);
    if h_parent.is_some() {
        if merge_end < h_limit {
            release_cow_parent_pages(state, hidden, merge_end, h_limit, teardown);
        }
        let removed_start = removed.parent_offset + removed.parent_start_limit;
        if removed_start < visibility_start {
            release_cow_parent_pages(state, hidden, removed_start, visibility_start, teardown);
        }
    }

    let h = state.paged(hidden);
    let (h_offset, h_start_limit, h_limit, h_partial) =
        (h.parent_offset, h.parent_start_limit, h.parent_limit, h.partial_cow_release);

    // Fold the hidden node's window over its parent into the child's
    let c = state.paged_mut(child);
    if h_parent.is_some() {
        let limit = c.parent_limit.min(h_limit.saturating_sub(child_offset));
        let start_limit = c.parent_start_limit.max(h_start_limit.saturating_sub(child_offset));
        c.parent_offset = match h_offset.checked_add(child_offset) {
            Some(off) => off,
            None => panic!("parent offset overflow merging {:?}", hidden),
        };
        c.parent_limit = limit;
        c.parent_start_limit = start_limit.min(limit);
    } else {
        c.parent_offset = 0;
        c.parent_limit = 0;
        c.parent_start_limit = 0;
    }

    let mut h_list = core::mem::take(&mut state.paged_mut(hidden).page_list);
    let pmm = state.pmm.clone();
    if !h_partial && child_offset == 0 && !child_hidden && !child_contiguous {
        log::debug!("fast merge of {:?} into {:?}", hidden, child);
        for (_, page) in h_list.iter() {
            pmm.page(page).clear_split();
        }
        let c = state.paged_mut(child);
        let child_list = core::mem::take(&mut c.page_list);
        child_list.merge_onto(&mut h_list, |_, stale| teardown.freed.push(stale));
        c.page_list = h_list;
    } else {
        log::debug!("general merge of {:?} into {:?}", hidden, child);
        let remaining = removed_branch.other();
        let freed = &mut teardown.freed;
        let c = state.paged_mut(child);
        c.page_list.merge_from(
            &mut h_list,
            child_offset,
            merge_end,
            |page| freed.push(page),
            |_, page| {
                let vm_page = pmm.page(page);
                if vm_page.is_split(remaining) {
                    // The survivor's side already has its own copy
                    MergeAction::Release
                } else {
                    vm_page.clear_split();
                    MergeAction::Keep
                }
            },
        );
        freed.extend(h_list.drain());
    }

    // Splice the child into the hidden node's place
    if let Some(grandparent) = h_parent {
        state.replace_child(grandparent, hidden, child);
    }
    state.node_mut(child).parent = h_parent;
    state.node_mut(hidden).children.clear();
    state.remove(hidden);
    teardown.destroyed.push(hidden);
}

/// Hand pages charged to a dying identity to someone still alive
///
/// `hidden` is about to merge into `child`. Ancestors charged to the
/// hidden node's identity are recharged to a live descendant.
fn reattribute(state: &mut TreeState, hidden: VmObjectId, child: VmObjectId) {
    let dead = state.paged(hidden).attribution_id;
    if state.paged(child).attribution_id == dead {
        return;
    }
    let mut skip = dead;
    let mut cur = hidden;
    while let Some(parent) = state.parent_of(cur) {
        if !state.is_hidden(parent) || state.paged(parent).attribution_id != dead {
            break;
        }
        let left = state.paged(state.child_on(parent, Branch::Left)).attribution_id;
        let right = state.paged(state.child_on(parent, Branch::Right)).attribution_id;
        let new_id = if left == skip { right } else { left };
        debug_assert_ne!(new_id, dead);
        state.paged_mut(parent).attribution_id = new_id;
        skip = new_id;
        cur = parent;
    }
}

// ============================================================================
// Ancestor Page Release
// ============================================================================

/// `id` no longer sees `[start, end)` of its parent: free parent pages
/// nobody else can see, recursing up through hidden ancestors
pub(crate) fn release_cow_parent_pages(
    state: &mut TreeState,
    id: VmObjectId,
    start: u64,
    end: u64,
    teardown: &mut Teardown,
) {
    let mut work = vec![(id, start, end)];
    while let Some((cur, start, end)) = work.pop() {
        let Some(parent) = state.parent_of(cur) else {
            continue;
        };
        let node = state.paged(cur);
        let start = start.max(node.parent_start_limit);
        let end = end.min(node.parent_limit);
        if start >= end {
            continue;
        }
        let at_edge = start == node.parent_start_limit || end == node.parent_limit;
        let parent_start = node.parent_offset + start;
        let parent_end = node.parent_offset + end;

        if !state.is_hidden(parent) {
            narrow_parent_window(state, cur, start, end);
            continue;
        }

        let ours = state.branch_of(parent, cur);
        let sibling = state.child_on(parent, ours.other());
        let (sib_start, sib_end) = state.paged(sibling).parent_window();

        let pmm = state.pmm.clone();
        let list = &mut state.paged_mut(parent).page_list;
        let in_range: Vec<(u64, PageNum)> = list.take_range(parent_start, parent_end).iter().collect();
        for (off, page) in in_range {
            let vm_page = pmm.page(page);
            let sibling_sees = off >= sib_start && off < sib_end;
            if !sibling_sees || vm_page.is_split(ours.other()) {
                vm_page.clear_split();
                teardown.freed.push(page);
                continue;
            }
            if at_edge {
                // Our window will exclude it; the window alone says who sees it
                vm_page.clear_split();
            } else if !vm_page.is_split(ours) {
                vm_page.set_split(ours);
            }
            if list.add(off, page).is_err() {
                panic!("page list slot {:#x} reoccupied during release", off);
            }
        }

        // Ranges the sibling cannot see are ours alone all the way up
        if parent_end > sib_end {
            work.push((parent, parent_start.max(sib_end), parent_end));
        }
        if parent_start < sib_start {
            work.push((parent, parent_start, parent_end.min(sib_start)));
        }

        narrow_parent_window(state, cur, start, end);
    }
}

/// Shrink `id`'s window to exclude `[start, end)`, or record that an
/// interior range was released
fn narrow_parent_window(state: &mut TreeState, id: VmObjectId, start: u64, end: u64) {
    let node = state.paged_mut(id);
    let covers_start = start <= node.parent_start_limit;
    let covers_end = end >= node.parent_limit;
    match (covers_start, covers_end) {
        (true, true) => {
            node.parent_limit = node.parent_start_limit;
        }
        (true, false) => node.parent_start_limit = end,
        (false, true) => node.parent_limit = start,
        (false, false) => {
            log::debug!("partial release of {:#x}..{:#x} in {:?}", start, end, id);
            let mut cur = Some(id);
            while let Some(node) = cur {
                state.paged_mut(node).partial_cow_release = true;
                cur = state.parent_of(node);
            }
        }
    }
}

/// Clamp the windows of `id`'s direct children to its new size
pub(crate) fn update_child_parent_limits(state: &mut TreeState, id: VmObjectId, new_size: u64) {
    let children = state.node(id).children.clone();
    for child in children {
        if let Some(c) = state.node_mut(child).as_paged_mut() {
            if c.is_slice() {
                continue;
            }
            c.parent_limit = if new_size <= c.parent_offset {
                0
            } else {
                c.parent_limit.min(new_size - c.parent_offset)
            };
            c.parent_start_limit = c.parent_start_limit.min(c.parent_limit);
        }
    }
}
