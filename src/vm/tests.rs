//! End-to-end tests for VM objects
//!
//! Clone tree scenarios, pager round trips with a real pager thread,
//! concurrent clone churn, and property tests against a byte-level model.

use std::sync::Arc;
use std::thread;
use std::vec::Vec;

use proptest::prelude::*;

use super::mapping::tests::RecordingMapping;
use super::vm_object::{for_each_object, lookup_info};
use super::*;

const P: u64 = PAGE_SIZE as u64;

fn setup(pages: usize) -> Arc<PageRegistry> {
    init();
    set_wait_hook(thread::yield_now);
    PageRegistry::with_pages(pages)
}

fn anon(pmm: &Arc<PageRegistry>, pages: u64) -> Arc<VmObject> {
    VmObject::create(pmm, PmmAllocFlags::ANY, VmoOptions::empty(), pages * P).unwrap()
}

fn resizable(pmm: &Arc<PageRegistry>, pages: u64) -> Arc<VmObject> {
    VmObject::create(pmm, PmmAllocFlags::ANY, VmoOptions::RESIZABLE, pages * P).unwrap()
}

fn snapshot(vmo: &VmObject, offset_pages: u64, pages: u64) -> Arc<VmObject> {
    vmo.create_child(ChildType::Snapshot, offset_pages * P, pages * P, false, false)
        .unwrap()
}

fn read_u32(vmo: &VmObject, offset: u64) -> u32 {
    let mut buf = [0u8; 4];
    vmo.read(offset, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}

fn tag(vmo: &VmObject, page: u64) -> u8 {
    let mut buf = [0u8; 1];
    vmo.read(page * P, &mut buf).unwrap();
    buf[0]
}

fn set_tag(vmo: &VmObject, page: u64, value: u8) {
    vmo.write(page * P, &[value]).unwrap();
}

// ============================================================================
// Clone Tree Scenarios
// ============================================================================

#[test]
fn test_clone_then_diverge() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 1);
    vmo.write(0, &0xdeadbeefu32.to_le_bytes()).unwrap();
    let clone = snapshot(&vmo, 0, 1);

    assert_eq!(read_u32(&vmo, 0), 0xdeadbeef);
    assert_eq!(read_u32(&clone, 0), 0xdeadbeef);

    clone.write(0, &0xc0ffeeu32.to_le_bytes()).unwrap();
    assert_eq!(read_u32(&vmo, 0), 0xdeadbeef);
    assert_eq!(read_u32(&clone, 0), 0xc0ffee);
    vmo.lock().debug_check_invariants();
}

#[test]
fn test_partial_clone_survives_original() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 2);
    set_tag(&vmo, 0, 1);
    set_tag(&vmo, 1, 2);
    let vmo_id = vmo.id();

    let clone = snapshot(&vmo, 1, 1);
    assert_eq!(tag(&clone, 0), 2);
    set_tag(&clone, 0, 4);

    drop(vmo);
    assert_eq!(tag(&clone, 0), 4);
    assert_eq!(clone.tree_node_count(), 1);
    assert_eq!(clone.parent_id(), None);
    assert_eq!(clone.committed_pages(), 1);
    assert_eq!(clone.attributed_pages(), 1);
    assert!(lookup_info(vmo_id).is_none());
}

#[test]
fn test_write_through_middle_clone() {
    const N: u64 = 4;
    let pmm = setup(32);
    let v = anon(&pmm, N);
    for i in 0..N {
        set_tag(&v, i, i as u8 + 1);
    }
    let c1 = snapshot(&v, 0, N);
    let c2 = snapshot(&c1, 0, N);
    set_tag(&c1, 0, 0x55);

    assert_eq!(v.attributed_pages(), N);
    assert_eq!(c1.committed_pages(), 1);
    assert_eq!(c1.attributed_pages(), 1);
    assert_eq!(c2.committed_pages(), 0);
    assert_eq!(c2.attributed_pages(), 1);

    for i in 0..N {
        assert_eq!(tag(&v, i), i as u8 + 1);
        assert_eq!(tag(&c2, i), i as u8 + 1);
    }
    assert_eq!(tag(&c1, 0), 0x55);
    v.lock().debug_check_invariants();
}

#[test]
fn test_shrink_original_to_zero() {
    let pmm = setup(16);
    let vmo = resizable(&pmm, 3);
    for i in 0..3 {
        set_tag(&vmo, i, i as u8 + 1);
    }
    let clone = snapshot(&vmo, 1, 1);
    let free = pmm.free_count();

    vmo.resize(0).unwrap();
    assert_eq!(tag(&clone, 0), 2);
    assert_eq!(vmo.committed_pages(), 0);
    assert_eq!(vmo.size(), 0);
    // Pages 0 and 2 were visible to nobody
    assert_eq!(pmm.free_count(), free + 2);

    drop(vmo);
    assert_eq!(tag(&clone, 0), 2);
    assert_eq!(clone.committed_pages(), 1);
    assert_eq!(clone.tree_node_count(), 1);
}

#[test]
fn test_contiguous_run_survives_forks() {
    let pmm = setup(32);
    let start_free = pmm.free_count();
    let vmo = VmObject::create_contiguous(&pmm, PmmAllocFlags::ANY, 4 * P, 0).unwrap();
    let mut run = Vec::new();
    vmo.lookup(0, 4 * P, |_, paddr| run.push(paddr)).unwrap();
    for i in 0..4 {
        set_tag(&vmo, i, 0x10 + i as u8);
    }

    let a = snapshot(&vmo, 0, 2);
    let b = snapshot(&vmo, 1, 2);
    let c = snapshot(&vmo, 3, 1);
    set_tag(&a, 0, 0xa0);
    set_tag(&b, 1, 0xb0);
    set_tag(&c, 0, 0xc0);
    set_tag(&vmo, 1, 0x21);

    let mut after = Vec::new();
    vmo.lookup(0, 4 * P, |_, paddr| after.push(paddr)).unwrap();
    assert_eq!(after, run);
    assert!(after.windows(2).all(|w| w[1] == w[0] + P));

    assert_eq!(tag(&vmo, 0), 0x10);
    assert_eq!(tag(&vmo, 1), 0x21);
    assert_eq!(tag(&vmo, 2), 0x12);
    assert_eq!(tag(&vmo, 3), 0x13);
    assert_eq!(tag(&a, 1), 0x11);
    assert_eq!(tag(&b, 0), 0x11);
    vmo.lock().debug_check_invariants();

    drop(a);
    drop(b);
    drop(c);
    let mut merged = Vec::new();
    vmo.lookup(0, 4 * P, |_, paddr| merged.push(paddr)).unwrap();
    assert_eq!(merged, run);
    assert_eq!(vmo.committed_pages(), 4);
    assert_eq!(vmo.tree_node_count(), 1);

    drop(vmo);
    assert_eq!(pmm.free_count(), start_free);
}

#[test]
fn test_close_middle_of_chain() {
    let pmm = setup(32);
    let a = anon(&pmm, 4);
    for i in 0..4 {
        set_tag(&a, i, i as u8 + 1);
    }
    let b = snapshot(&a, 0, 4);
    let c = snapshot(&b, 1, 2);
    set_tag(&b, 0, 0xbb);
    set_tag(&c, 0, 0xcc);

    drop(b);
    assert_eq!(tag(&c, 0), 0xcc);
    assert_eq!(tag(&c, 1), 3);
    for i in 0..4 {
        assert_eq!(tag(&a, i), i as u8 + 1);
    }

    // Only A, its hidden parent and C remain
    assert_eq!(a.tree_node_count(), 3);
    let state = a.lock();
    let hidden = state.parent_of(a.id()).unwrap();
    assert_eq!(state.parent_of(c.id()), Some(hidden));
    assert_eq!(state.node(hidden).children, [a.id(), c.id()]);
    state.debug_check_invariants();
}

#[test]
fn test_closing_all_clones_frees_everything() {
    let pmm = setup(64);
    let start_free = pmm.free_count();
    let vmo = anon(&pmm, 4);
    for i in 0..4 {
        set_tag(&vmo, i, 9);
    }
    let clones: Vec<_> = (0..4).map(|i| snapshot(&vmo, i % 2, 3)).collect();
    for (i, clone) in clones.iter().enumerate() {
        set_tag(clone, 0, i as u8);
    }
    drop(clones);
    assert_eq!(vmo.tree_node_count(), 1);
    assert_eq!(vmo.committed_pages(), 4);
    for i in 0..4 {
        assert_eq!(tag(&vmo, i), 9);
    }
    drop(vmo);
    assert_eq!(pmm.free_count(), start_free);
}

#[test]
fn test_unidirectional_clone_sees_unforked_writes() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 2);
    let clone = vmo
        .create_child(ChildType::SnapshotAtLeastOnWrite, 0, 2 * P, false, false)
        .unwrap();
    set_tag(&vmo, 0, 1);
    set_tag(&clone, 1, 2);
    // The parent's write lands where the clone still reads through
    assert_eq!(tag(&clone, 0), 1);
    assert_eq!(tag(&vmo, 1), 0);
    assert_eq!(clone.committed_pages(), 1);
}

#[test]
fn test_clone_of_slice_clones_underlying_range() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 4);
    set_tag(&vmo, 2, 7);
    let slice = vmo.create_child(ChildType::Slice, 2 * P, 2 * P, false, false).unwrap();
    let clone = slice.create_child(ChildType::Snapshot, 0, 4 * P, false, false).unwrap();

    assert_eq!(tag(&clone, 0), 7);
    // Beyond the slice the clone reads zeroes
    assert_eq!(tag(&clone, 2), 0);
    set_tag(&clone, 0, 8);
    assert_eq!(tag(&slice, 0), 7);
    assert_eq!(slice.num_children(), 1);
    assert_eq!(vmo.num_children(), 1);
}

#[test]
fn test_bidirectional_clone_refusals() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let external = VmObject::create_external(&pmm, pager, VmoOptions::empty(), 2 * P).unwrap();
    assert_eq!(
        external.create_child(ChildType::Snapshot, 0, P, false, false).err(),
        Some(VmError::NotSupported)
    );
    let uni = external
        .create_child(ChildType::SnapshotAtLeastOnWrite, 0, P, false, false)
        .unwrap();
    assert_eq!(
        uni.create_child(ChildType::Snapshot, 0, P, false, false).err(),
        Some(VmError::NotSupported)
    );

    let vmo = anon(&pmm, 1);
    vmo.set_cache_policy(CachePolicy::WriteCombining as u32).unwrap();
    assert_eq!(
        vmo.create_child(ChildType::Snapshot, 0, P, false, false).err(),
        Some(VmError::NotSupported)
    );
    assert_eq!(
        vmo.create_child(ChildType::Slice, 0, P, false, false).err(),
        Some(VmError::BadState)
    );
}

#[test]
fn test_uncached_slice_of_contiguous() {
    let pmm = setup(16);
    let vmo = VmObject::create_contiguous(&pmm, PmmAllocFlags::ANY, 2 * P, 0).unwrap();
    vmo.set_cache_policy(CachePolicy::Uncached as u32).unwrap();
    let slice = vmo.create_child(ChildType::Slice, P, P, false, false).unwrap();
    assert_eq!(slice.cache_policy(), CachePolicy::Uncached);
    assert!(slice.is_contiguous());
    assert!(slice.fault(0, FaultFlags::empty()).is_ok());
}

// ============================================================================
// Object State
// ============================================================================

#[test]
fn test_cache_policy_rules() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 1);
    assert_eq!(vmo.set_cache_policy(17), Err(VmError::InvalidArgs));
    vmo.set_cache_policy(CachePolicy::Uncached as u32).unwrap();
    vmo.set_cache_policy(CachePolicy::Cached as u32).unwrap();

    set_tag(&vmo, 0, 1);
    assert_eq!(
        vmo.set_cache_policy(CachePolicy::Uncached as u32),
        Err(VmError::BadState)
    );

    let bare = anon(&pmm, 1);
    let mapping = RecordingMapping::new();
    let id = bare.add_mapping(mapping);
    assert_eq!(
        bare.set_cache_policy(CachePolicy::Uncached as u32),
        Err(VmError::BadState)
    );
    assert!(bare.remove_mapping(id));
    let _child = bare.create_child(ChildType::Slice, 0, P, false, false).unwrap();
    assert_eq!(
        bare.set_cache_policy(CachePolicy::Uncached as u32),
        Err(VmError::BadState)
    );
}

#[test]
fn test_mappings_see_range_changes() {
    let pmm = setup(16);
    let vmo = resizable(&pmm, 2);
    let parent_map = RecordingMapping::new();
    vmo.add_mapping(parent_map.clone());

    set_tag(&vmo, 0, 1);
    assert_eq!(parent_map.take(), [(0, P, RangeChangeOp::Unmap)]);

    let clone = snapshot(&vmo, 0, 2);
    assert_eq!(parent_map.take(), [(0, 2 * P, RangeChangeOp::RemoveWrite)]);

    let clone_map = RecordingMapping::new();
    clone.add_mapping(clone_map.clone());
    set_tag(&vmo, 0, 2);
    assert_eq!(parent_map.take(), [(0, P, RangeChangeOp::Unmap)]);
    assert!(clone_map.take().is_empty());

    vmo.resize(P).unwrap();
    assert_eq!(parent_map.take(), [(P, P, RangeChangeOp::Unmap)]);
}

#[test]
fn test_slice_mappings_follow_parent() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 4);
    let slice = vmo.create_child(ChildType::Slice, 2 * P, 2 * P, false, false).unwrap();
    let slice_map = RecordingMapping::new();
    slice.add_mapping(slice_map.clone());

    set_tag(&vmo, 0, 1);
    assert!(slice_map.take().is_empty());
    set_tag(&vmo, 3, 1);
    assert_eq!(slice_map.take(), [(P, P, RangeChangeOp::Unmap)]);
}

#[test]
fn test_names_and_diagnostics() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 2);
    vmo.set_name("framebuffer");
    set_tag(&vmo, 0, 1);
    let clone = vmo.create_child(ChildType::Snapshot, 0, 2 * P, false, true).unwrap();
    assert_eq!(clone.name().as_str(), "framebuffer");

    let info = lookup_info(vmo.id()).unwrap();
    assert_eq!(info.name.as_str(), "framebuffer");
    assert_eq!(info.size, 2 * P);
    assert_eq!(info.committed_pages, 0);
    assert_eq!(info.attributed_pages, 1);
    assert_eq!(info.num_children, 1);
    assert!(info.has_handle);

    let hidden = vmo.parent_id().unwrap();
    let hidden_info = lookup_info(hidden).unwrap();
    assert!(hidden_info.hidden);
    assert!(!hidden_info.has_handle);
    assert_eq!(hidden_info.committed_pages, 1);

    let mut seen = 0;
    for_each_object(|info| {
        if info.id == vmo.id() || info.id == clone.id() || info.id == hidden {
            seen += 1;
        }
    });
    assert_eq!(seen, 3);
    vm_object::dump_all();

    drop(clone);
    assert!(lookup_info(hidden).is_none());
}

#[test]
fn test_boot_registry() {
    init_with_memory(0x100_0000, 0x100_0000 + 64 * P);
    let pmm = vm_page::registry().unwrap();
    assert!(pmm.free_count() > 0);

    let before = vm_object::object_count();
    let vmo = anon(&pmm, 1);
    assert!(vm_object::object_count() >= before + 1);
    assert_eq!(vmo.pager_miss_policy(), Some(PagerMissPolicy::ZeroFill));
    let physical = VmObject::create_physical(&pmm, 0xfe00_0000, P).unwrap();
    assert_eq!(physical.pager_miss_policy(), None);
}

#[test]
fn test_fault_stats_move() {
    let pmm = setup(16);
    let before = vm_fault::stats().cow.load(core::sync::atomic::Ordering::Relaxed);
    let vmo = anon(&pmm, 1);
    set_tag(&vmo, 0, 1);
    let clone = snapshot(&vmo, 0, 1);
    set_tag(&clone, 0, 2);
    let after = vm_fault::stats().cow.load(core::sync::atomic::Ordering::Relaxed);
    assert!(after > before);
}

// ============================================================================
// Pinning
// ============================================================================

fn paddrs(vmo: &VmObject, pages: u64) -> Vec<u64> {
    let mut addrs = Vec::new();
    vmo.lookup(0, pages * P, |_, paddr| addrs.push(paddr)).unwrap();
    addrs
}

#[test]
fn test_pin_blocks_snapshot_until_unpinned() {
    let pmm = setup(16);
    let start_free = pmm.free_count();
    let vmo = anon(&pmm, 2);
    set_tag(&vmo, 0, 7);
    vmo.pin(0, P).unwrap();

    let refused = vmo.create_child(ChildType::Snapshot, 0, 2 * P, false, false);
    assert_eq!(refused.err(), Some(VmError::BadState));
    assert_eq!(vmo.tree_node_count(), 1);

    // The pinned page never left the object, so unpin finds it
    vmo.unpin(0, P);
    let clone = snapshot(&vmo, 0, 2);
    set_tag(&vmo, 0, 8);
    assert_eq!(tag(&clone, 0), 7);
    assert_eq!(tag(&vmo, 0), 8);
    vmo.lock().debug_check_invariants();

    drop(clone);
    drop(vmo);
    assert_eq!(pmm.free_count(), start_free);
}

#[test]
fn test_pinned_page_keeps_backing_through_writes() {
    let pmm = setup(16);
    let start_free = pmm.free_count();
    let vmo = anon(&pmm, 1);
    vmo.pin(0, P).unwrap();
    let pinned = paddrs(&vmo, 1);

    assert!(vmo.create_child(ChildType::Snapshot, 0, P, false, false).is_err());
    vmo.write(0, &[9]).unwrap();
    assert_eq!(paddrs(&vmo, 1), pinned);

    // A unidirectional child copies on write and leaves the pinned page alone
    let child = vmo
        .create_child(ChildType::SnapshotAtLeastOnWrite, 0, P, false, false)
        .unwrap();
    assert_eq!(tag(&child, 0), 9);
    set_tag(&child, 0, 10);
    assert_eq!(tag(&vmo, 0), 9);
    assert_eq!(paddrs(&vmo, 1), pinned);
    assert_ne!(paddrs(&child, 1), pinned);

    vmo.unpin(0, P);
    drop(child);
    drop(vmo);
    assert_eq!(pmm.free_count(), start_free);
}

#[test]
fn test_pin_through_slice_blocks_snapshot_of_parent() {
    let pmm = setup(16);
    let vmo = anon(&pmm, 4);
    let slice = vmo.create_child(ChildType::Slice, 2 * P, 2 * P, false, false).unwrap();
    slice.pin(0, P).unwrap();

    let refused = vmo.create_child(ChildType::Snapshot, 0, 4 * P, false, false);
    assert_eq!(refused.err(), Some(VmError::BadState));
    let refused = slice.create_child(ChildType::Snapshot, 0, P, false, false);
    assert_eq!(refused.err(), Some(VmError::BadState));

    slice.unpin(0, P);
    let clone = snapshot(&vmo, 0, 4);
    assert_eq!(tag(&clone, 2), 0);
}

// ============================================================================
// Pager
// ============================================================================

/// Serve `count` data requests, filling pages with `fill`
fn spawn_pager(
    pager: Arc<PagerSource>,
    vmo: Arc<VmObject>,
    count: usize,
    fill: u8,
) -> thread::JoinHandle<Vec<(u64, u64)>> {
    thread::spawn(move || {
        let mut served = Vec::new();
        while served.len() < count {
            match pager.next_packet() {
                Some(PagerPacket::DataRequest { offset, length }) => {
                    let data = std::vec![fill; length as usize];
                    vmo.supply_pages(offset, &data).unwrap();
                    served.push((offset, length));
                }
                Some(PagerPacket::Complete) => break,
                None => thread::yield_now(),
            }
        }
        served
    })
}

#[test]
fn test_read_waits_for_pager() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), 4 * P).unwrap();
    let server = spawn_pager(pager.clone(), vmo.clone(), 1, 0x42);

    assert_eq!(tag(&vmo, 2), 0x42);
    assert_eq!(server.join().unwrap(), [(2 * P, P)]);
    assert_eq!(vmo.committed_pages(), 1);
    assert_eq!(pager.outstanding(), 0);
}

#[test]
fn test_commit_batches_pager_requests() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), 4 * P).unwrap();
    let server = spawn_pager(pager.clone(), vmo.clone(), 1, 0x17);

    vmo.commit_range(0, 4 * P).unwrap();
    assert_eq!(server.join().unwrap(), [(0, 4 * P)]);
    assert_eq!(vmo.committed_pages(), 4);
    assert_eq!(tag(&vmo, 3), 0x17);
}

#[test]
fn test_clone_of_pager_object_pages_in() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), 2 * P).unwrap();
    let clone = vmo
        .create_child(ChildType::SnapshotAtLeastOnWrite, 0, 2 * P, false, false)
        .unwrap();
    let server = spawn_pager(pager.clone(), vmo.clone(), 1, 0x33);

    set_tag(&clone, 1, 0x99);
    server.join().unwrap();
    assert_eq!(tag(&vmo, 1), 0x33);
    assert_eq!(tag(&clone, 1), 0x99);
    assert_eq!(clone.committed_pages(), 1);
}

#[test]
fn test_detached_pager_miss_policy() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), 2 * P).unwrap();
    let clone = vmo
        .create_child(ChildType::SnapshotAtLeastOnWrite, 0, 2 * P, false, false)
        .unwrap();
    pager.detach();
    assert_eq!(pager.state(), PagerState::Detached);

    // Descendants zero fill; the root reports the refusal
    assert_eq!(tag(&clone, 0), 0);
    let mut buf = [0u8; 1];
    assert_eq!(vmo.read(0, &mut buf), Err(VmError::NotFound));

    clone.set_pager_miss_policy(PagerMissPolicy::Propagate).unwrap();
    assert_eq!(clone.read(0, &mut buf), Err(VmError::NotFound));
}

#[test]
fn test_pager_failure_reaches_reader() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), 2 * P).unwrap();
    let failer = {
        let pager = pager.clone();
        thread::spawn(move || loop {
            if let Some(PagerPacket::DataRequest { offset, length }) = pager.next_packet() {
                pager.fail_range(offset, length, VmError::NoMemory);
                break;
            }
            thread::yield_now();
        })
    };
    let mut buf = [0u8; 1];
    assert_eq!(vmo.read(0, &mut buf), Err(VmError::NoMemory));
    failer.join().unwrap();
}

#[test]
fn test_shrink_wakes_pager_waiters() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::RESIZABLE, 4 * P).unwrap();
    let reader = {
        let vmo = vmo.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 1];
            vmo.read(3 * P, &mut buf)
        })
    };
    while pager.outstanding() == 0 {
        thread::yield_now();
    }
    vmo.resize(P).unwrap();
    // The read was valid when issued and completes without data
    assert_eq!(reader.join().unwrap(), Ok(()));
}

#[test]
fn test_failed_supply_wakes_supplied_prefix() {
    let pmm = setup(8);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), 2 * P).unwrap();
    let mut held = Vec::new();
    while pmm.free_count() > 1 {
        held.push(pmm.alloc_page(PmmAllocFlags::ANY).unwrap());
    }

    let reader = {
        let vmo = vmo.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 1];
            vmo.read(0, &mut buf).map(|()| buf[0])
        })
    };
    while pager.outstanding() == 0 {
        thread::yield_now();
    }
    assert_eq!(
        pager.next_packet(),
        Some(PagerPacket::DataRequest { offset: 0, length: P })
    );

    // Only the first page fits; its waiter must still wake
    let data = std::vec![0x5a; 2 * PAGE_SIZE];
    assert_eq!(vmo.supply_pages(0, &data), Err(VmError::NoMemory));
    assert_eq!(reader.join().unwrap(), Ok(0x5a));
    assert_eq!(vmo.committed_pages(), 1);
    assert_eq!(pager.outstanding(), 0);

    for page in held {
        pmm.free_page(page);
    }
}

#[test]
fn test_destroy_closes_pager() {
    let pmm = setup(16);
    let pager = PagerSource::new();
    let vmo = VmObject::create_external(&pmm, pager.clone(), VmoOptions::empty(), P).unwrap();
    drop(vmo);
    assert_eq!(pager.state(), PagerState::Closed);
    assert_eq!(pager.next_packet(), Some(PagerPacket::Complete));
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_clone_churn() {
    let pmm = setup(256);
    let start_free = pmm.free_count();
    let vmo = anon(&pmm, 8);
    for i in 0..8 {
        set_tag(&vmo, i, i as u8 + 1);
    }

    let workers: Vec<_> = (0..4u8)
        .map(|t| {
            let vmo = vmo.clone();
            thread::spawn(move || {
                for round in 0..25u64 {
                    let clone = snapshot(&vmo, round % 4, 4);
                    let page = round % 4;
                    assert_eq!(tag(&clone, page), (round % 4 + page) as u8 + 1);
                    set_tag(&clone, page, 0x80 | t);
                    assert_eq!(tag(&clone, page), 0x80 | t);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for i in 0..8 {
        assert_eq!(tag(&vmo, i), i as u8 + 1);
    }
    assert_eq!(vmo.tree_node_count(), 1);
    vmo.lock().debug_check_invariants();
    drop(vmo);
    assert_eq!(pmm.free_count(), start_free);
}

// ============================================================================
// Property Tests
// ============================================================================

const MAX_PAGES: u64 = 4;
const MAX_OBJECTS: usize = 6;
const MAX_PINS: u8 = 3;

#[derive(Debug, Clone)]
enum Op {
    Write { obj: usize, page: u64, value: u8 },
    Clone { obj: usize, offset: u64, pages: u64 },
    CloneAtLeastOnWrite { obj: usize, offset: u64, pages: u64 },
    Close { obj: usize },
    Resize { obj: usize, pages: u64 },
    Pin { obj: usize, page: u64 },
    Unpin { obj: usize, page: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..MAX_OBJECTS, 0..MAX_PAGES, 1..=255u8)
            .prop_map(|(obj, page, value)| Op::Write { obj, page, value }),
        2 => (0..MAX_OBJECTS, 0..MAX_PAGES, 0..=MAX_PAGES)
            .prop_map(|(obj, offset, pages)| Op::Clone { obj, offset, pages }),
        1 => (0..MAX_OBJECTS, 0..MAX_PAGES, 0..=MAX_PAGES)
            .prop_map(|(obj, offset, pages)| Op::CloneAtLeastOnWrite { obj, offset, pages }),
        1 => (0..MAX_OBJECTS).prop_map(|obj| Op::Close { obj }),
        1 => (0..MAX_OBJECTS, 0..=MAX_PAGES).prop_map(|(obj, pages)| Op::Resize { obj, pages }),
        1 => (0..MAX_OBJECTS, 0..MAX_PAGES).prop_map(|(obj, page)| Op::Pin { obj, page }),
        1 => (0..MAX_OBJECTS, 0..MAX_PAGES).prop_map(|(obj, page)| Op::Unpin { obj, page }),
    ]
}

/// Reference node: the first byte of each page it holds itself, plus
/// `(parent, offset, limit)` when it reads through to a parent
struct ModelNode {
    own: Vec<Option<u8>>,
    parent: Option<(usize, u64, u64)>,
}

/// Reference tree that never merges; hidden nodes stay frozen forever
#[derive(Default)]
struct Model {
    nodes: Vec<ModelNode>,
}

impl Model {
    fn add(&mut self, pages: u64, parent: Option<(usize, u64, u64)>) -> usize {
        self.nodes.push(ModelNode {
            own: std::vec![None; pages as usize],
            parent,
        });
        self.nodes.len() - 1
    }

    fn size(&self, node: usize) -> u64 {
        self.nodes[node].own.len() as u64
    }

    fn read(&self, mut node: usize, mut page: u64) -> u8 {
        loop {
            let n = &self.nodes[node];
            if let Some(Some(value)) = n.own.get(page as usize) {
                return *value;
            }
            match n.parent {
                Some((parent, offset, limit)) if page < limit => {
                    node = parent;
                    page += offset;
                }
                _ => return 0,
            }
        }
    }

    fn window(&self, node: usize, offset: u64, pages: u64) -> u64 {
        let size = self.size(node);
        if offset < size {
            pages.min(size - offset)
        } else {
            0
        }
    }

    /// `node` gets a frozen hidden parent holding its pages; returns the clone
    fn snapshot(&mut self, node: usize, offset: u64, pages: u64) -> usize {
        let size = self.size(node);
        let n = &mut self.nodes[node];
        let hidden = ModelNode {
            own: core::mem::replace(&mut n.own, std::vec![None; size as usize]),
            parent: n.parent,
        };
        self.nodes.push(hidden);
        let hidden = self.nodes.len() - 1;
        self.nodes[node].parent = Some((hidden, 0, size));
        let limit = self.window(hidden, offset, pages);
        self.add(pages, Some((hidden, offset, limit)))
    }

    fn resize(&mut self, node: usize, pages: u64) {
        let n = &mut self.nodes[node];
        n.own.resize(pages as usize, None);
        if let Some((_, _, limit)) = &mut n.parent {
            *limit = (*limit).min(pages);
        }
        for other in self.nodes.iter_mut() {
            if let Some((parent, offset, limit)) = &mut other.parent {
                if *parent == node {
                    *limit = (*limit).min(pages.saturating_sub(*offset));
                }
            }
        }
    }
}

/// Live handle, its reference node and the pins it holds per page
struct Modeled {
    vmo: Arc<VmObject>,
    node: usize,
    pins: Vec<u8>,
}

impl Modeled {
    fn unpin_all(&mut self) {
        for (page, pins) in self.pins.iter_mut().enumerate() {
            while *pins > 0 {
                self.vmo.unpin(page as u64 * P, P);
                *pins -= 1;
            }
        }
    }
}

fn check_model(model: &Model, objects: &[Modeled]) -> Result<(), TestCaseError> {
    for obj in objects {
        let pages = model.size(obj.node);
        prop_assert_eq!(obj.vmo.size(), pages * P);
        for page in 0..pages {
            let expected = model.read(obj.node, page);
            prop_assert_eq!(tag(&obj.vmo, page), expected, "object {:?} page {}", obj.vmo.id(), page);
        }
        obj.vmo.lock().debug_check_invariants();
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Clones stay isolated from each other's writes, closing or shrinking
    /// objects never changes what survivors read, and pins hold their
    /// pages in place
    #[test]
    fn prop_clone_tree_matches_model(ops in proptest::collection::vec(op(), 1..40)) {
        let pmm = setup(512);
        let start_free = pmm.free_count();
        let mut model = Model::default();
        let root = model.add(MAX_PAGES, None);
        let mut objects = std::vec![Modeled {
            vmo: resizable(&pmm, MAX_PAGES),
            node: root,
            pins: std::vec![0; MAX_PAGES as usize],
        }];

        for op in ops {
            if objects.is_empty() {
                break;
            }
            match op {
                Op::Write { obj, page, value } => {
                    let obj = &objects[obj % objects.len()];
                    if page < model.size(obj.node) {
                        set_tag(&obj.vmo, page, value);
                        model.nodes[obj.node].own[page as usize] = Some(value);
                    }
                }
                Op::Clone { obj, offset, pages } => {
                    if objects.len() >= MAX_OBJECTS {
                        continue;
                    }
                    let parent = &objects[obj % objects.len()];
                    let result = parent
                        .vmo
                        .create_child(ChildType::Snapshot, offset * P, pages * P, true, false);
                    if parent.pins.iter().any(|&pins| pins > 0) {
                        prop_assert_eq!(result.err(), Some(VmError::BadState));
                        continue;
                    }
                    let node = model.snapshot(parent.node, offset, pages);
                    let vmo = result.unwrap();
                    objects.push(Modeled { vmo, node, pins: std::vec![0; pages as usize] });
                }
                Op::CloneAtLeastOnWrite { obj, offset, pages } => {
                    if objects.len() >= MAX_OBJECTS {
                        continue;
                    }
                    let parent = &objects[obj % objects.len()];
                    let vmo = parent
                        .vmo
                        .create_child(ChildType::SnapshotAtLeastOnWrite, offset * P, pages * P, true, false)
                        .unwrap();
                    let limit = model.window(parent.node, offset, pages);
                    let node = model.add(pages, Some((parent.node, offset, limit)));
                    objects.push(Modeled { vmo, node, pins: std::vec![0; pages as usize] });
                }
                Op::Close { obj } => {
                    let idx = obj % objects.len();
                    let mut closed = objects.swap_remove(idx);
                    closed.unpin_all();
                }
                Op::Resize { obj, pages } => {
                    let idx = obj % objects.len();
                    let obj = &mut objects[idx];
                    let result = obj.vmo.resize(pages * P);
                    if obj.pins.iter().skip(pages as usize).any(|&pins| pins > 0) {
                        prop_assert_eq!(result, Err(VmError::BadState));
                        continue;
                    }
                    prop_assert_eq!(result, Ok(()));
                    model.resize(obj.node, pages);
                    obj.pins.resize(pages as usize, 0);
                }
                Op::Pin { obj, page } => {
                    let idx = obj % objects.len();
                    let obj = &mut objects[idx];
                    if page >= model.size(obj.node) || obj.pins[page as usize] >= MAX_PINS {
                        continue;
                    }
                    obj.vmo.pin(page * P, P).unwrap();
                    // Pinning commits the page into the object itself
                    let value = model.read(obj.node, page);
                    model.nodes[obj.node].own[page as usize] = Some(value);
                    obj.pins[page as usize] += 1;
                }
                Op::Unpin { obj, page } => {
                    let idx = obj % objects.len();
                    let obj = &mut objects[idx];
                    if obj.pins.get(page as usize).is_some_and(|&pins| pins > 0) {
                        obj.vmo.unpin(page * P, P);
                        obj.pins[page as usize] -= 1;
                    }
                }
            }
            check_model(&model, &objects)?;
        }

        for obj in objects.iter_mut() {
            obj.unpin_all();
        }
        drop(objects);
        prop_assert_eq!(pmm.free_count(), start_free);
    }
}
