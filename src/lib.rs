//! mach_vmo - Virtual memory objects for a Rust Mach kernel
//!
//! Page-backed and physical memory objects with slices, copy-on-write
//! clone trees, pager-backed content, pinning and attribution.

#![cfg_attr(not(test), no_std)]
// Kernel types often have specialized construction that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod vm;

pub use vm::{VmError, VmObject, VmResult};
