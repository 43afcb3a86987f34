//! Mapping Invalidation
//!
//! Based on the Mach pmap interface: the VM object layer does not manage
//! page tables, it only tells whoever maps an object that a range of it
//! changed. A range change on an object also reaches every descendant
//! that can see the range through its parent window.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::vm_node::{NodeKind, TreeState};
use super::vm_object::VmObjectId;

/// What happened to a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeChangeOp {
    /// Drop the translations entirely
    Unmap,
    /// Keep them but make them read-only
    RemoveWrite,
}

/// Mapping identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(pub u64);

static NEXT_MAPPING_ID: AtomicU64 = AtomicU64::new(1);

impl MappingId {
    pub(crate) fn alloc() -> Self {
        Self(NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Address-space mapping of an object
///
/// Called with the clone tree lock held; implementations must not call
/// back into the object.
pub trait MappingObserver: Send + Sync {
    fn range_changed(&self, offset: u64, len: u64, op: RangeChangeOp);
}

/// Translate a parent range into `child`'s offsets, clipped to what the
/// child can see
fn child_view(state: &TreeState, child: VmObjectId, offset: u64, len: u64) -> Option<(u64, u64)> {
    let node = state.node(child);
    let (start, end, parent_offset) = match &node.kind {
        NodeKind::Paged(p) if p.is_slice() => (p.parent_offset, p.parent_offset + p.size, p.parent_offset),
        NodeKind::Paged(p) => {
            let (start, end) = p.parent_window();
            (start, end, p.parent_offset)
        }
        NodeKind::Physical(p) => (p.parent_offset, p.parent_offset + p.size, p.parent_offset),
    };
    let lo = offset.max(start);
    let hi = offset.saturating_add(len).min(end);
    (lo < hi).then(|| (lo - parent_offset, hi - lo))
}

/// Tell the mappings of `id` and of every descendant seeing the range
pub(crate) fn range_change_update(
    state: &TreeState,
    id: VmObjectId,
    offset: u64,
    len: u64,
    op: RangeChangeOp,
) {
    if len == 0 {
        return;
    }
    let mut work: Vec<(VmObjectId, u64, u64)> = Vec::new();
    work.push((id, offset, len));
    while let Some((cur, offset, len)) = work.pop() {
        let node = state.node(cur);
        debug_assert!(
            !node.is_hidden() || node.mappings.is_empty(),
            "hidden object with mappings"
        );
        for (_, mapping) in &node.mappings {
            mapping.range_changed(offset, len, op);
        }
        for &child in &node.children {
            if let Some((child_off, child_len)) = child_view(state, child, offset, len) {
                work.push((child, child_off, child_len));
            }
        }
    }
}

/// Like [`range_change_update`], starting from a range expressed in the
/// coordinates of `child`'s parent
pub(crate) fn range_change_update_from_parent(
    state: &TreeState,
    child: VmObjectId,
    parent_offset: u64,
    len: u64,
    op: RangeChangeOp,
) {
    if let Some((offset, len)) = child_view(state, child, parent_offset, len) {
        range_change_update(state, child, offset, len, op);
    }
}
