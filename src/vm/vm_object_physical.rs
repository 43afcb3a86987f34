//! Physical VM Objects
//!
//! Based on Mach4 device memory objects (vm/vm_object.c, device pager).
//!
//! A physical object names a fixed run of physical addresses the page
//! registry does not manage, typically device memory. Every in-range
//! offset always has a page, so lookups and faults never allocate and
//! pinning is only a range check. Physical objects can be sliced but
//! never cloned, and they are not readable or writable through the
//! object interface.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::lock::LockToken;
use super::page_list::MAX_SIZE;
use super::vm_error::{VmError, VmResult};
use super::vm_node::{NodeKind, PhysicalNode, TreeState, VmNode};
use super::vm_object::{CachePolicy, VmObject, VmObjectId};
use super::vm_object_paged::create_root;
use super::vm_page::{is_page_aligned, PageRegistry};

impl VmObject {
    /// Create an object covering `[paddr, paddr + size)`
    pub fn create_physical(pmm: &Arc<PageRegistry>, paddr: u64, size: u64) -> VmResult<Arc<VmObject>> {
        if !is_page_aligned(paddr) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        if size > MAX_SIZE {
            return Err(VmError::OutOfRange);
        }
        paddr.checked_add(size).ok_or(VmError::OutOfRange)?;

        let vmo = create_root(pmm, |_| {
            let node = PhysicalNode {
                base: paddr,
                size,
                parent_offset: 0,
            };
            (NodeKind::Physical(node), CachePolicy::Uncached)
        })?;
        log::debug!("physical object {:?} at {:#x}+{:#x}", vmo.id(), paddr, size);
        Ok(vmo)
    }
}

/// Physical address backing `offset` of physical object `id`
pub(crate) fn paddr_at(state: &TreeState, id: VmObjectId, offset: u64) -> u64 {
    match &state.node(id).kind {
        NodeKind::Physical(p) => p.base + offset,
        NodeKind::Paged(_) => panic!("{:?} is not a physical object", id),
    }
}

/// Slice of `[offset, offset + size)` of physical object `id`
pub(crate) fn create_physical_slice(
    state: &mut TreeState,
    token: LockToken,
    id: VmObjectId,
    child_id: VmObjectId,
    offset: u64,
    size: u64,
    resizable: bool,
) -> VmResult<Vec<VmObjectId>> {
    if resizable {
        return Err(VmError::NotSupported);
    }
    let node = state.node(id);
    let NodeKind::Physical(phys) = &node.kind else {
        panic!("{:?} is not a physical object", id);
    };
    if offset + size > phys.size {
        return Err(VmError::OutOfRange);
    }

    // Slices of slices hang off the underlying object
    let (parent, parent_offset) = match node.parent {
        Some(parent) => (parent, phys.parent_offset + offset),
        None => (id, offset),
    };
    let child = PhysicalNode {
        base: phys.base + offset,
        size,
        parent_offset,
    };
    let cache_policy = node.cache_policy;
    let lock_id = state.lock_id;
    state.insert(token, VmNode::new(child_id, lock_id, cache_policy, NodeKind::Physical(child)));
    state.attach_child(token, parent, child_id);
    Ok(vec![child_id])
}
