//! Sparse Page List
//!
//! Ordered map from page-aligned object offset to page. Every VM object
//! node owns one. Lookups and range operations are logarithmic in the
//! number of resident pages plus the pages touched; empty stretches of the
//! offset space cost nothing.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::vm_error::{VmError, VmResult};
use super::vm_page::{is_page_aligned, PageNum, PAGE_SIZE};

/// Largest object size and exclusive upper bound on page list offsets
///
/// Rounded down so that offset arithmetic in nested clones has headroom.
pub const MAX_SIZE: u64 = u64::MAX & !(PAGE_SIZE as u64 * 16 - 1);

/// Callback verdict for page list walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Keep going
    Next,
    /// Stop the walk early; not an error
    Stop,
}

/// What a merge does with a page that did not collide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Insert the page into the destination list
    Keep,
    /// Hand the page back to the caller for freeing
    Release,
}

/// Sparse page list
#[derive(Debug, Default)]
pub struct VmPageList {
    pages: BTreeMap<u64, PageNum>,
}

impl VmPageList {
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Number of resident pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Add a page at `offset`; fails if the slot is occupied
    pub fn add(&mut self, offset: u64, page: PageNum) -> VmResult<()> {
        debug_assert!(is_page_aligned(offset));
        if offset >= MAX_SIZE {
            return Err(VmError::OutOfRange);
        }
        match self.pages.entry(offset) {
            alloc::collections::btree_map::Entry::Occupied(_) => Err(VmError::BadState),
            alloc::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(page);
                Ok(())
            }
        }
    }

    /// Page at `offset`, if resident
    pub fn get(&self, offset: u64) -> Option<PageNum> {
        self.pages.get(&offset).copied()
    }

    /// Detach the page at `offset`
    pub fn remove(&mut self, offset: u64) -> Option<PageNum> {
        self.pages.remove(&offset)
    }

    /// Swap the page at an occupied `offset`, returning the old one
    pub fn replace(&mut self, offset: u64, page: PageNum) -> Option<PageNum> {
        self.pages.get_mut(&offset).map(|slot| core::mem::replace(slot, page))
    }

    /// Iterate resident `(offset, page)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (u64, PageNum)> + '_ {
        self.pages.iter().map(|(&off, &page)| (off, page))
    }

    /// Visit every page in `[start, end)` in offset order
    pub fn for_every_page_in_range<F>(&self, start: u64, end: u64, mut f: F) -> VmResult<()>
    where
        F: FnMut(u64, PageNum) -> VmResult<Walk>,
    {
        if start >= end {
            return Ok(());
        }
        for (&off, &page) in self.pages.range(start..end) {
            if f(off, page)? == Walk::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Visit every page in `[start, end)` and every maximal gap between
    /// them, in offset order
    pub fn for_every_page_and_gap_in_range<P, G>(
        &self,
        start: u64,
        end: u64,
        mut page_fn: P,
        mut gap_fn: G,
    ) -> VmResult<()>
    where
        P: FnMut(u64, PageNum) -> VmResult<Walk>,
        G: FnMut(u64, u64) -> VmResult<Walk>,
    {
        if start >= end {
            return Ok(());
        }
        let mut expected = start;
        for (&off, &page) in self.pages.range(start..end) {
            if off > expected && gap_fn(expected, off)? == Walk::Stop {
                return Ok(());
            }
            if page_fn(off, page)? == Walk::Stop {
                return Ok(());
            }
            expected = off + PAGE_SIZE as u64;
        }
        if expected < end {
            gap_fn(expected, end)?;
        }
        Ok(())
    }

    /// Detach and return every page in `[start, end)` without freeing
    pub fn remove_range(&mut self, start: u64, end: u64) -> Vec<PageNum> {
        self.take_range(start, end).into_pages()
    }

    /// Split `[start, end)` out into its own list, offsets unchanged
    pub fn take_range(&mut self, start: u64, end: u64) -> VmPageList {
        if start >= end {
            return VmPageList::new();
        }
        let keys: Vec<u64> = self.pages.range(start..end).map(|(&off, _)| off).collect();
        let mut taken = VmPageList::new();
        for off in keys {
            if let Some(page) = self.pages.remove(&off) {
                taken.pages.insert(off, page);
            }
        }
        taken
    }

    /// Detach every page
    pub fn into_pages(self) -> Vec<PageNum> {
        self.pages.into_values().collect()
    }

    /// Detach every page, leaving the list empty
    pub fn drain(&mut self) -> Vec<PageNum> {
        core::mem::take(self).into_pages()
    }

    /// Move all of this list's pages onto `dest`
    ///
    /// Pages from `self` win collisions; each displaced page of `dest` is
    /// passed to `displaced`. Cost is proportional to the size of `self`.
    pub fn merge_onto<F>(self, dest: &mut VmPageList, mut displaced: F)
    where
        F: FnMut(u64, PageNum),
    {
        for (off, page) in self.pages {
            if let Some(old) = dest.pages.insert(off, page) {
                displaced(off, old);
            }
        }
    }

    /// Pull pages of `other` in `[start, end)` into this list, rebased so
    /// that `start` lands at offset zero
    ///
    /// On collision this list keeps its page and `other`'s page goes to
    /// `release`. Non-colliding pages are offered to `migrate`, which decides
    /// whether they are kept or released. Pages of `other` outside the range
    /// are left in place.
    pub fn merge_from<R, M>(
        &mut self,
        other: &mut VmPageList,
        start: u64,
        end: u64,
        mut release: R,
        mut migrate: M,
    ) where
        R: FnMut(PageNum),
        M: FnMut(u64, PageNum) -> MergeAction,
    {
        debug_assert!(is_page_aligned(start));
        let moving = other.take_range(start, end);
        for (off, page) in moving.pages {
            let new_off = off - start;
            if self.pages.contains_key(&new_off) {
                release(page);
                continue;
            }
            match migrate(new_off, page) {
                MergeAction::Keep => {
                    self.pages.insert(new_off, page);
                }
                MergeAction::Release => release(page),
            }
        }
    }
}
