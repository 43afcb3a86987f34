//! Page Attribution
//!
//! Charges every resident page to exactly one live object for reporting.
//! An object's own pages are its own. Pages a hidden ancestor holds on
//! behalf of both of its children are charged to the side its
//! attribution id lives in, unless the other side can no longer see them.
//! Hidden nodes, slices and physical objects are charged nothing.

use alloc::vec::Vec;

use super::page_list::Walk;
use super::vm_node::TreeState;
use super::vm_object::{VmObject, VmObjectId};
use super::vm_page::PageNum;

/// One hidden level climbed on the way up: the hidden node and the child
/// we came through
type Level = (VmObjectId, VmObjectId);

impl VmObject {
    /// Pages charged to this object
    pub fn attributed_pages(&self) -> u64 {
        let state = self.lock();
        let size = state.node(self.id()).size();
        attributed_pages_in_range(&state, self.id(), 0, size)
    }

    /// Pages in `[offset, offset + len)` charged to this object
    pub fn attributed_pages_in_range(&self, offset: u64, len: u64) -> u64 {
        let state = self.lock();
        attributed_pages_in_range(&state, self.id(), offset, offset.saturating_add(len))
    }
}

/// Pages of `id` in `[start, end)` charged to `id`
pub(crate) fn attributed_pages_in_range(state: &TreeState, id: VmObjectId, start: u64, end: u64) -> u64 {
    let Some(paged) = state.node(id).as_paged() else {
        return 0;
    };
    if paged.is_hidden() || paged.is_slice() {
        return 0;
    }
    let end = end.min(paged.size);

    let mut own = 0u64;
    let mut inherited = 0u64;
    let mut levels = Vec::new();
    let walked = paged.page_list.for_every_page_and_gap_in_range(
        start,
        end,
        |_, _| {
            own += 1;
            Ok(Walk::Next)
        },
        |gap_start, gap_end| {
            inherited += ancestor_pages(state, id, gap_start, gap_end, &mut levels);
            Ok(Walk::Next)
        },
    );
    debug_assert!(walked.is_ok());
    own + inherited
}

/// Pages above `child`'s `[start, end)` charged to the object at the
/// bottom of `levels`
fn ancestor_pages(
    state: &TreeState,
    child: VmObjectId,
    start: u64,
    end: u64,
    levels: &mut Vec<Level>,
) -> u64 {
    let Some(parent) = state.parent_of(child) else {
        return 0;
    };
    // A visible parent owns what it holds
    if !state.is_hidden(parent) {
        return 0;
    }
    let node = state.paged(child);
    let start = start.max(node.parent_start_limit);
    let end = end.min(node.parent_limit);
    if start >= end {
        return 0;
    }
    let parent_start = node.parent_offset + start;
    let parent_end = node.parent_offset + end;

    levels.push((parent, child));
    let mut count = 0u64;
    let mut gaps = Vec::new();
    let walked = state.paged(parent).page_list.for_every_page_and_gap_in_range(
        parent_start,
        parent_end,
        |off, page| {
            if charged_to_origin(state, levels, off, page) {
                count += 1;
            }
            Ok(Walk::Next)
        },
        |gap_start, gap_end| {
            gaps.push((gap_start, gap_end));
            Ok(Walk::Next)
        },
    );
    debug_assert!(walked.is_ok());
    for (gap_start, gap_end) in gaps {
        count += ancestor_pages(state, parent, gap_start, gap_end, levels);
    }
    levels.pop();
    count
}

/// Is `page`, held at `offset` of the top level, charged to the object at
/// the bottom of `levels`?
fn charged_to_origin(state: &TreeState, levels: &[Level], offset: u64, page: PageNum) -> bool {
    let vm_page = state.pmm.page(page);
    let mut off = offset;
    for (depth, &(hidden, child)) in levels.iter().enumerate().rev() {
        let ours = state.branch_of(hidden, child);
        let top = depth + 1 == levels.len();
        // Our side already forked its own copy
        if top && vm_page.is_split(ours) {
            return false;
        }
        let sibling = state.paged(state.child_on(hidden, ours.other()));
        let sibling_sees =
            sibling.sees_parent_offset(off) && !(top && vm_page.is_split(ours.other()));
        if sibling_sees {
            let owner = state.paged(hidden).attribution_id;
            if !state.subtree_contains(child, owner) {
                return false;
            }
        }
        off -= state.paged(child).parent_offset;
    }
    true
}
