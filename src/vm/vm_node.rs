//! Clone Tree Nodes
//!
//! Every object of a clone tree lives in one arena keyed by object id.
//! Parent links are ids; the arena, not the links, owns the nodes. A node
//! is either paged (page list, clone-tree window, optional page source) or
//! physical (a fixed run of physical addresses).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::lock::{LockId, LockToken};
use super::mapping::{MappingId, MappingObserver};
use super::page_list::VmPageList;
use super::page_source::PageSource;
use super::vm_object::{CachePolicy, ChildObserver, PagerMissPolicy, VmObjectId, VmoName};
use super::vm_page::{Branch, PageNum, PageRegistry, PmmAllocFlags};

// ============================================================================
// Node Flags
// ============================================================================

/// Paged node option bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFlags(u32);

impl NodeFlags {
    /// Size may change
    pub const RESIZABLE: Self = Self(0x0001);
    /// Pages form one physical run
    pub const CONTIGUOUS: Self = Self(0x0002);
    /// Merge node; never handed to callers
    pub const HIDDEN: Self = Self(0x0004);
    /// Pure view of the parent
    pub const SLICE: Self = Self(0x0008);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for NodeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Node Variants
// ============================================================================

/// Page-backed node state
pub struct PagedNode {
    pub size: u64,
    pub flags: NodeFlags,
    pub page_list: VmPageList,
    /// Only ever set on a root
    pub page_source: Option<Arc<dyn PageSource>>,
    pub alloc_flags: PmmAllocFlags,

    /// Offset of our offset zero inside the parent
    pub parent_offset: u64,
    /// Our offsets at or past this see nothing of the parent
    pub parent_limit: u64,
    /// Our offsets below this see nothing of the parent
    pub parent_start_limit: u64,

    /// Identity pages of this node are charged to
    pub attribution_id: VmObjectId,
    /// An interior range was released; split flags alone now decide
    /// visibility
    pub partial_cow_release: bool,
    pub miss_policy: PagerMissPolicy,
    /// First page of the physical run of a contiguous object
    pub contiguous_base: Option<PageNum>,
    /// Caller pins held on this node's pages; the contiguity pin of a run
    /// is not counted
    pub user_pins: u64,
}

impl PagedNode {
    pub fn new(size: u64, flags: NodeFlags, alloc_flags: PmmAllocFlags, id: VmObjectId) -> Self {
        Self {
            size,
            flags,
            page_list: VmPageList::new(),
            page_source: None,
            alloc_flags,
            parent_offset: 0,
            parent_limit: 0,
            parent_start_limit: 0,
            attribution_id: id,
            partial_cow_release: false,
            miss_policy: PagerMissPolicy::default(),
            contiguous_base: None,
            user_pins: 0,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(NodeFlags::HIDDEN)
    }

    pub fn is_slice(&self) -> bool {
        self.flags.contains(NodeFlags::SLICE)
    }

    pub fn is_resizable(&self) -> bool {
        self.flags.contains(NodeFlags::RESIZABLE)
    }

    pub fn is_contiguous(&self) -> bool {
        self.flags.contains(NodeFlags::CONTIGUOUS)
    }

    /// Parent-relative range this node can see, `[start, end)`
    pub fn parent_window(&self) -> (u64, u64) {
        (
            self.parent_offset + self.parent_start_limit,
            self.parent_offset + self.parent_limit,
        )
    }

    /// Does a parent-relative offset fall inside our window?
    pub fn sees_parent_offset(&self, parent_off: u64) -> bool {
        let (start, end) = self.parent_window();
        parent_off >= start && parent_off < end
    }

    /// Page number of `offset` within the contiguous run
    pub fn contiguous_page_at(&self, offset: u64) -> Option<PageNum> {
        self.contiguous_base
            .map(|base| base + (offset >> super::vm_page::PAGE_SHIFT) as PageNum)
    }
}

/// Physical-range node state; every in-range offset has a page
#[derive(Debug)]
pub struct PhysicalNode {
    pub base: u64,
    pub size: u64,
    /// Offset of this view inside its parent (slices only)
    pub parent_offset: u64,
}

pub enum NodeKind {
    Paged(PagedNode),
    Physical(PhysicalNode),
}

/// Arena node
pub struct VmNode {
    pub id: VmObjectId,
    pub lock_id: LockId,
    pub parent: Option<VmObjectId>,
    /// Hidden nodes: `[left, right]`, left being the original object
    pub children: Vec<VmObjectId>,
    /// A caller still holds a handle
    pub has_handle: bool,
    pub cache_policy: CachePolicy,
    pub name: VmoName,
    pub mappings: Vec<(MappingId, Arc<dyn MappingObserver>)>,
    /// Visible children created from this object
    pub user_child_count: u32,
    /// Object this one was created from, for child counting
    pub creator: Option<VmObjectId>,
    pub child_observer: Option<Arc<dyn ChildObserver>>,
    pub kind: NodeKind,
}

impl VmNode {
    pub fn new(id: VmObjectId, lock_id: LockId, cache_policy: CachePolicy, kind: NodeKind) -> Self {
        Self {
            id,
            lock_id,
            parent: None,
            children: Vec::new(),
            has_handle: true,
            cache_policy,
            name: VmoName::new(),
            mappings: Vec::new(),
            user_child_count: 0,
            creator: None,
            child_observer: None,
            kind,
        }
    }

    pub fn as_paged(&self) -> Option<&PagedNode> {
        match &self.kind {
            NodeKind::Paged(p) => Some(p),
            NodeKind::Physical(_) => None,
        }
    }

    pub fn as_paged_mut(&mut self) -> Option<&mut PagedNode> {
        match &mut self.kind {
            NodeKind::Paged(p) => Some(p),
            NodeKind::Physical(_) => None,
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self.kind, NodeKind::Paged(_))
    }

    pub fn is_hidden(&self) -> bool {
        self.as_paged().is_some_and(|p| p.is_hidden())
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Paged(p) => p.size,
            NodeKind::Physical(p) => p.size,
        }
    }
}

// ============================================================================
// Tree State
// ============================================================================

/// Everything guarded by one clone tree lock
pub struct TreeState {
    pub lock_id: LockId,
    pub pmm: Arc<PageRegistry>,
    nodes: BTreeMap<VmObjectId, VmNode>,
}

impl TreeState {
    pub fn new(lock_id: LockId, pmm: Arc<PageRegistry>) -> Self {
        Self {
            lock_id,
            pmm,
            nodes: BTreeMap::new(),
        }
    }

    /// Add a node created under this tree's lock
    pub fn insert(&mut self, token: LockToken, node: VmNode) {
        token.attest(self.lock_id);
        token.attest(node.lock_id);
        let id = node.id;
        let prev = self.nodes.insert(id, node);
        assert!(prev.is_none(), "object {:?} inserted twice", id);
    }

    pub fn remove(&mut self, id: VmObjectId) -> VmNode {
        match self.nodes.remove(&id) {
            Some(node) => node,
            None => panic!("object {:?} missing from its clone tree", id),
        }
    }

    pub fn contains(&self, id: VmObjectId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = VmObjectId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn try_node(&self, id: VmObjectId) -> Option<&VmNode> {
        self.nodes.get(&id)
    }

    pub fn try_node_mut(&mut self, id: VmObjectId) -> Option<&mut VmNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: VmObjectId) -> &VmNode {
        match self.nodes.get(&id) {
            Some(node) => node,
            None => panic!("object {:?} missing from its clone tree", id),
        }
    }

    pub fn node_mut(&mut self, id: VmObjectId) -> &mut VmNode {
        match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => panic!("object {:?} missing from its clone tree", id),
        }
    }

    pub fn paged(&self, id: VmObjectId) -> &PagedNode {
        match self.node(id).as_paged() {
            Some(p) => p,
            None => panic!("object {:?} is not paged", id),
        }
    }

    pub fn paged_mut(&mut self, id: VmObjectId) -> &mut PagedNode {
        match self.node_mut(id).as_paged_mut() {
            Some(p) => p,
            None => panic!("object {:?} is not paged", id),
        }
    }

    pub fn parent_of(&self, id: VmObjectId) -> Option<VmObjectId> {
        self.node(id).parent
    }

    pub fn is_hidden(&self, id: VmObjectId) -> bool {
        self.node(id).is_hidden()
    }

    /// Child of a hidden node on `branch`
    pub fn child_on(&self, hidden: VmObjectId, branch: Branch) -> VmObjectId {
        let children = &self.node(hidden).children;
        assert_eq!(
            children.len(),
            2,
            "hidden object {:?} has {} children",
            hidden,
            children.len()
        );
        match branch {
            Branch::Left => children[0],
            Branch::Right => children[1],
        }
    }

    /// Which side of hidden `parent` is `child` on?
    pub fn branch_of(&self, parent: VmObjectId, child: VmObjectId) -> Branch {
        let children = &self.node(parent).children;
        if children.first() == Some(&child) {
            Branch::Left
        } else {
            debug_assert_eq!(children.get(1), Some(&child));
            Branch::Right
        }
    }

    /// Link `child` under `parent`
    pub fn attach_child(&mut self, token: LockToken, parent: VmObjectId, child: VmObjectId) {
        token.attest(self.node(parent).lock_id);
        token.attest(self.node(child).lock_id);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
    }

    /// Put `new` in `old`'s slot among `parent`'s children
    pub fn replace_child(&mut self, parent: VmObjectId, old: VmObjectId, new: VmObjectId) {
        let children = &mut self.node_mut(parent).children;
        match children.iter_mut().find(|c| **c == old) {
            Some(slot) => *slot = new,
            None => panic!("{:?} is not a child of {:?}", old, parent),
        }
    }

    /// Unlink `child` from `parent`'s child list
    pub fn detach_child(&mut self, parent: VmObjectId, child: VmObjectId) {
        let children = &mut self.node_mut(parent).children;
        let before = children.len();
        children.retain(|c| *c != child);
        assert_eq!(children.len() + 1, before, "{:?} is not a child of {:?}", child, parent);
    }

    /// Is `node` in the subtree rooted at `root`?
    pub fn subtree_contains(&self, root: VmObjectId, node: VmObjectId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == root {
                return true;
            }
            cur = self.try_node(id).and_then(|n| n.parent);
        }
        false
    }

    /// Root of the ancestor chain
    pub fn root_of(&self, id: VmObjectId) -> VmObjectId {
        let mut cur = id;
        while let Some(parent) = self.parent_of(cur) {
            cur = parent;
        }
        cur
    }

    /// Debug check that parent links form a tree
    pub fn debug_check_acyclic(&self, id: VmObjectId) {
        if cfg!(debug_assertions) {
            let mut steps = 0usize;
            let mut cur = id;
            while let Some(parent) = self.parent_of(cur) {
                steps += 1;
                assert!(steps <= self.nodes.len(), "cycle in clone tree at {:?}", id);
                cur = parent;
            }
        }
    }

    /// Debug check of the per-node structural invariants
    pub fn debug_check_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        for (id, node) in &self.nodes {
            if let Some(paged) = node.as_paged() {
                if paged.is_hidden() {
                    assert_eq!(node.children.len(), 2, "hidden {:?} child count", id);
                    for (_, page) in paged.page_list.iter() {
                        let (left, right) = self.pmm.page(page).split_bits();
                        assert!(!(left && right), "page split both ways in {:?}", id);
                    }
                } else {
                    for (_, page) in paged.page_list.iter() {
                        assert!(!self.pmm.page(page).is_split_any(), "split leaf page in {:?}", id);
                    }
                }
                if node.parent.is_some() && !paged.is_slice() {
                    assert!(paged.parent_start_limit <= paged.parent_limit, "{:?} window", id);
                    assert!(paged.parent_limit <= paged.size, "{:?} limit past size", id);
                }
            }
            self.debug_check_acyclic(*id);
        }
    }
}
