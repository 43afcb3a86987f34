//! Virtual Memory Objects
//!
//! Based on Mach4 vm/ subsystem.
//! Provides page-backed and physical memory objects with copy-on-write
//! cloning:
//! - vm_page: Physical page metadata and the page registry
//! - page_list: Sparse offset-to-page map each object owns
//! - vm_object: Object handles, identity and the object registry
//! - vm_object_paged: Paged object factories and operations
//! - vm_object_physical: Objects over fixed physical ranges
//! - clone_tree: Slices, clones, hidden merge nodes and tree collapse
//! - vm_fault: Fault resolution and fork-on-write migration
//! - attribution: Charging shared pages to one live object
//! - page_source: Pager contract and request tracking
//! - mapping: Range change delivery to mappings

pub mod attribution;
pub mod clone_tree;
pub mod lock;
pub mod mapping;
pub mod page_list;
pub mod page_source;
pub mod vm_error;
pub mod vm_fault;
pub mod vm_node;
pub mod vm_object;
pub mod vm_object_paged;
pub mod vm_object_physical;
pub mod vm_page;

#[cfg(test)]
mod tests;

pub use mapping::{MappingId, MappingObserver, RangeChangeOp};
pub use page_list::{VmPageList, MAX_SIZE};
pub use page_source::{
    set_wait_hook, PageRequest, PageSource, PagerPacket, PagerSource, PagerState,
};
pub use vm_error::{VmError, VmResult};
pub use vm_fault::FaultFlags;
pub use vm_object::{
    CachePolicy, ChildObserver, ChildType, PagerMissPolicy, VmObject, VmObjectId, VmoInfo,
    VmoOptions,
};
pub use vm_page::{PageNum, PageRegistry, PmmAllocFlags, MAX_PIN_COUNT, PAGE_SIZE};

/// Initialize the VM object subsystem
pub fn init() {
    vm_object::init();
}

/// Initialize with the physical memory range discovered at boot
///
/// Installs the global page registry; objects may also be created against
/// private registries.
pub fn init_with_memory(start: u64, end: u64) {
    init();
    vm_page::init_memory(start, end);
    log::info!("vm objects over {:#x}..{:#x}", start, end);
}
