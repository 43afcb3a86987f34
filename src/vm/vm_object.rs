//! VM Object - Memory Object Handles
//!
//! Based on Mach4 vm/vm_object.h/c
//! A VM object is a handle onto one node of a clone tree. The tree holds
//! the node state; the handle keeps the tree alive and tears its node down
//! when dropped. Objects are either:
//! - Paged (anonymous, contiguous, wired or pager-backed, and their clones)
//! - Physical (a fixed range of physical addresses)
//!
//! Every node, including hidden merge nodes, is listed in a process-wide
//! registry used for diagnostics.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::clone_tree;
use super::lock::{TreeGuard, TreeLock};
use super::mapping::{MappingId, MappingObserver};
use super::vm_error::{VmError, VmResult};
use super::vm_node::{NodeKind, TreeState};
use super::vm_page::PageRegistry;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);
}

/// Longest object name, in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Diagnostic object name
pub type VmoName = heapless::String<MAX_NAME_LEN>;

/// Creation options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmoOptions(u32);

impl VmoOptions {
    /// Object may be resized
    pub const RESIZABLE: Self = Self(0x0001);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for VmoOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Mapping cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CachePolicy {
    #[default]
    Cached = 0,
    Uncached = 1,
    UncachedDevice = 2,
    WriteCombining = 3,
}

impl CachePolicy {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(Self::Cached),
            1 => Some(Self::Uncached),
            2 => Some(Self::UncachedDevice),
            3 => Some(Self::WriteCombining),
            _ => None,
        }
    }
}

/// Kind of child to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    /// Pure view of a range of the parent; never forks
    Slice,
    /// Bidirectional copy-on-write clone: neither side sees the other's
    /// later writes
    Snapshot,
    /// Unidirectional copy-on-write clone: the child may see writes the
    /// parent makes before the child forks the page
    SnapshotAtLeastOnWrite,
}

/// What a descendant sees when its root's pager refuses a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagerMissPolicy {
    /// Substitute the zero page
    #[default]
    ZeroFill,
    /// Report the pager's refusal
    Propagate,
}

/// Observer of user-visible child count transitions
pub trait ChildObserver: Send + Sync {
    /// The last child went away
    fn on_zero_children(&self);

    /// The first child appeared
    fn on_one_child(&self) {}
}

/// Snapshot of one object for diagnostics
#[derive(Debug, Clone)]
pub struct VmoInfo {
    pub id: VmObjectId,
    pub name: VmoName,
    pub size: u64,
    pub committed_pages: u64,
    pub attributed_pages: u64,
    pub parent: Option<VmObjectId>,
    pub num_children: u32,
    pub cache_policy: CachePolicy,
    pub hidden: bool,
    pub slice: bool,
    pub contiguous: bool,
    pub resizable: bool,
    pub physical: bool,
    pub pager_backed: bool,
    pub has_handle: bool,
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// Lock and arena shared by every node of one clone tree
pub(crate) struct CloneTree {
    pub(crate) lock: TreeLock<TreeState>,
}

impl CloneTree {
    pub(crate) fn new(pmm: Arc<PageRegistry>) -> Arc<Self> {
        Arc::new(Self {
            lock: TreeLock::new_with(|lock_id| TreeState::new(lock_id, pmm)),
        })
    }
}

/// Handle onto one object of a clone tree
pub struct VmObject {
    id: VmObjectId,
    tree: Arc<CloneTree>,
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject").field("id", &self.id).finish()
    }
}

impl VmObject {
    pub(crate) fn from_parts(id: VmObjectId, tree: Arc<CloneTree>) -> Arc<Self> {
        Arc::new(Self { id, tree })
    }

    pub(crate) fn tree(&self) -> &Arc<CloneTree> {
        &self.tree
    }

    /// Take the tree lock
    pub(crate) fn lock(&self) -> TreeGuard<'_, TreeState> {
        let guard = self.tree.lock.lock();
        guard.token().attest(guard.node(self.id).lock_id);
        guard
    }

    /// Object ID
    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.lock().node(self.id).size()
    }

    pub fn is_paged(&self) -> bool {
        self.lock().node(self.id).is_paged()
    }

    pub fn is_physical(&self) -> bool {
        !self.is_paged()
    }

    pub fn is_resizable(&self) -> bool {
        self.lock()
            .node(self.id)
            .as_paged()
            .is_some_and(|p| p.is_resizable())
    }

    pub fn is_contiguous(&self) -> bool {
        self.lock()
            .node(self.id)
            .as_paged()
            .is_some_and(|p| p.is_contiguous())
    }

    pub fn is_slice(&self) -> bool {
        let state = self.lock();
        match &state.node(self.id).kind {
            NodeKind::Paged(p) => p.is_slice(),
            NodeKind::Physical(_) => state.node(self.id).parent.is_some(),
        }
    }

    pub fn name(&self) -> VmoName {
        self.lock().node(self.id).name.clone()
    }

    /// Set the name, truncating at a character boundary
    pub fn set_name(&self, name: &str) {
        let mut state = self.lock();
        state.node_mut(self.id).name = truncate_name(name);
    }

    /// Pages in this object's own page list
    pub fn committed_pages(&self) -> u64 {
        let state = self.lock();
        state
            .node(self.id)
            .as_paged()
            .map_or(0, |p| p.page_list.len() as u64)
    }

    /// Live slices and clones created from this object
    pub fn num_children(&self) -> u32 {
        self.lock().node(self.id).user_child_count
    }

    pub fn set_child_observer(&self, observer: Option<Arc<dyn ChildObserver>>) {
        self.lock().node_mut(self.id).child_observer = observer;
    }

    /// Immediate parent in the clone tree, hidden nodes included
    pub fn parent_id(&self) -> Option<VmObjectId> {
        self.lock().node(self.id).parent
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.lock().node(self.id).cache_policy
    }

    /// Change the cache policy
    ///
    /// Only a bare object may change policy: no pages, mappings, children
    /// or parent. A contiguous root may go from cached to uncached even
    /// though it always holds its pages.
    pub fn set_cache_policy(&self, policy: u32) -> VmResult<()> {
        let policy = CachePolicy::from_u32(policy).ok_or(VmError::InvalidArgs)?;
        let mut state = self.lock();
        let node = state.node(self.id);
        if !node.mappings.is_empty() || !node.children.is_empty() || node.parent.is_some() {
            return Err(VmError::BadState);
        }
        if let Some(paged) = node.as_paged() {
            let uncaching_contiguous = paged.is_contiguous()
                && node.cache_policy == CachePolicy::Cached
                && policy != CachePolicy::Cached;
            if !paged.page_list.is_empty() && !uncaching_contiguous {
                return Err(VmError::BadState);
            }
        }
        state.node_mut(self.id).cache_policy = policy;
        Ok(())
    }

    /// Register a mapping to be told about range changes
    pub fn add_mapping(&self, observer: Arc<dyn MappingObserver>) -> MappingId {
        let id = MappingId::alloc();
        self.lock().node_mut(self.id).mappings.push((id, observer));
        id
    }

    pub fn remove_mapping(&self, mapping: MappingId) -> bool {
        let mut state = self.lock();
        let mappings = &mut state.node_mut(self.id).mappings;
        let before = mappings.len();
        mappings.retain(|(id, _)| *id != mapping);
        mappings.len() != before
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> VmoInfo {
        let state = self.lock();
        info_locked(&state, self.id)
    }

    /// Number of nodes, hidden ones included, in this object's clone tree
    pub fn tree_node_count(&self) -> usize {
        self.lock().node_count()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let teardown = {
            let mut state = self.lock();
            clone_tree::release_handle(&mut state, self.id)
        };
        teardown.finish();
    }
}

pub(crate) fn truncate_name(name: &str) -> VmoName {
    let mut out = VmoName::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

pub(crate) fn info_locked(state: &TreeState, id: VmObjectId) -> VmoInfo {
    let node = state.node(id);
    let paged = node.as_paged();
    VmoInfo {
        id,
        name: node.name.clone(),
        size: node.size(),
        committed_pages: paged.map_or(0, |p| p.page_list.len() as u64),
        attributed_pages: super::attribution::attributed_pages_in_range(state, id, 0, node.size()),
        parent: node.parent,
        num_children: node.user_child_count,
        cache_policy: node.cache_policy,
        hidden: node.is_hidden(),
        slice: paged.is_some_and(|p| p.is_slice()) || (paged.is_none() && node.parent.is_some()),
        contiguous: paged.is_some_and(|p| p.is_contiguous()),
        resizable: paged.is_some_and(|p| p.is_resizable()),
        physical: paged.is_none(),
        pager_backed: paged.is_some_and(|p| p.page_source.is_some()),
        has_handle: node.has_handle,
    }
}

// ============================================================================
// Object Registry
// ============================================================================

/// Process-wide list of live objects
///
/// Maps each object to its clone tree. The registry lock is a leaf: it is
/// never held while taking a tree lock or while allocating.
struct ObjectRegistry {
    objects: BTreeMap<VmObjectId, Weak<CloneTree>>,
}

static OBJECT_REGISTRY: spin::Once<Mutex<ObjectRegistry>> = spin::Once::new();

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Initialize object subsystem
pub fn init() {
    OBJECT_REGISTRY.call_once(|| {
        log::info!("vm object registry initialized");
        Mutex::new(ObjectRegistry {
            objects: BTreeMap::new(),
        })
    });
}

fn object_registry() -> VmResult<&'static Mutex<ObjectRegistry>> {
    OBJECT_REGISTRY.get().ok_or(VmError::BadState)
}

/// Fail unless [`init`] ran
pub(crate) fn ensure_initialized() -> VmResult<()> {
    object_registry().map(|_| ())
}

pub(crate) fn alloc_id() -> VmObjectId {
    VmObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn register(ids: &[VmObjectId], tree: &Arc<CloneTree>) {
    if let Ok(registry) = object_registry() {
        let mut registry = registry.lock();
        for &id in ids {
            registry.objects.insert(id, Arc::downgrade(tree));
        }
    }
}

pub(crate) fn unregister(ids: &[VmObjectId]) {
    if let Ok(registry) = object_registry() {
        let mut registry = registry.lock();
        for id in ids {
            registry.objects.remove(id);
        }
    }
}

/// Number of registered objects
pub fn object_count() -> usize {
    object_registry().map_or(0, |r| r.lock().objects.len())
}

/// Visit a snapshot of every live object
pub fn for_each_object<F: FnMut(&VmoInfo)>(mut f: F) {
    let snapshot: Vec<(VmObjectId, Weak<CloneTree>)> = match object_registry() {
        Ok(registry) => registry
            .lock()
            .objects
            .iter()
            .map(|(id, tree)| (*id, tree.clone()))
            .collect(),
        Err(_) => return,
    };

    for (id, tree) in snapshot {
        let Some(tree) = tree.upgrade() else {
            continue;
        };
        let info = {
            let state = tree.lock.lock();
            state.contains(id).then(|| info_locked(&state, id))
        };
        if let Some(info) = info {
            f(&info);
        }
    }
}

/// Diagnostic snapshot of one object by id
pub fn lookup_info(id: VmObjectId) -> Option<VmoInfo> {
    let tree = object_registry().ok()?.lock().objects.get(&id)?.upgrade()?;
    let state = tree.lock.lock();
    state.contains(id).then(|| info_locked(&state, id))
}

/// Log every live object
pub fn dump_all() {
    for_each_object(|info| {
        log::info!(
            "vmo {:>6} {:<32} size {:#x} committed {} attributed {} parent {:?}{}{}",
            info.id.0,
            info.name.as_str(),
            info.size,
            info.committed_pages,
            info.attributed_pages,
            info.parent.map(|p| p.0),
            if info.hidden { " hidden" } else { "" },
            if info.physical { " physical" } else { "" },
        );
    });
}
