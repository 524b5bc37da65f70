// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Thread-local buffer (TLB): a committed span of the reserved region with a
//! bump-pointer allocator and per-kind back-reference slots.
//!
//! Exactly one thread owns a buffer at a time. The payload bytes are written
//! only by the owner; other threads may read them after release or inside a
//! stop-the-world section.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::list::ListNode;
use crate::region::align_up;

/// Record alignment inside a buffer (pointer width).
pub const RECORD_ALIGN: usize = std::mem::size_of::<usize>();

/// Deduplication kinds with a back-reference slot per buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackRefKind {
    ClassLoad = 0,
}

pub const BACK_REF_KIND_COUNT: usize = 1;

/// Slot value meaning "no back reference" (offset 0 is a valid record).
const NO_BACK_REF: u32 = u32::MAX;

/// Owner token meaning "released".
pub const NO_OWNER: u64 = 0;

/// One leased span of native memory.
///
/// The link must stay the first field: list nodes are cast back to buffers.
#[repr(C)]
pub struct Buffer {
    link: ListNode,
    base: *mut u8,
    pos: AtomicUsize,
    owner: AtomicU64,
    back_refs: [AtomicU32; BACK_REF_KIND_COUNT],
}

// SAFETY: Buffer is Send + Sync because:
// - base is fixed at pool construction and points into the pool's region
// - pos/owner/back_refs are atomics
// - payload bytes behind base are written only by the owning thread and read
//   only after release or under stop-the-world, per the pool's protocol
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(base: *mut u8) -> Self {
        Self {
            link: ListNode::new(),
            base,
            pos: AtomicUsize::new(0),
            owner: AtomicU64::new(NO_OWNER),
            back_refs: [const { AtomicU32::new(NO_BACK_REF) }; BACK_REF_KIND_COUNT],
        }
    }

    pub fn link(&self) -> *mut ListNode {
        let link: &ListNode = &self.link;
        link as *const ListNode as *mut ListNode
    }

    /// Recover the buffer from its embedded link.
    ///
    /// # Safety
    /// `link` must be the link of a live `Buffer` (it is the first field of a
    /// `#[repr(C)]` struct, so the cast is layout-correct).
    pub unsafe fn from_link(link: *mut ListNode) -> *mut Buffer {
        link.cast::<Buffer>()
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn pos(&self) -> usize {
        self.pos.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub fn remaining(&self, capacity: usize) -> usize {
        capacity - self.pos()
    }

    /// Take ownership: reset the write offset and the back-reference slots.
    pub fn lease(&self, owner: u64) {
        debug_assert_ne!(owner, NO_OWNER);
        debug_assert_eq!(self.owner(), NO_OWNER, "buffer already owned");
        self.pos.store(0, Ordering::Relaxed);
        for slot in &self.back_refs {
            slot.store(NO_BACK_REF, Ordering::Relaxed);
        }
        self.owner.store(owner, Ordering::Release);
    }

    /// Clear ownership. Only the owning thread, or any thread inside a
    /// stop-the-world section, may call this.
    pub fn release(&self) {
        debug_assert_ne!(self.owner(), NO_OWNER, "buffer not owned");
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    /// Bump-allocate `size` bytes (padded to record alignment).
    ///
    /// The caller must have verified `size <= remaining`; there is no bounds
    /// check here.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let pos = self.pos.load(Ordering::Relaxed);
        self.pos
            .store(pos + align_up(size, RECORD_ALIGN), Ordering::Release);
        // SAFETY: base + pos stays inside the committed buffer per the
        // caller's size check.
        unsafe { self.base.add(pos) }
    }

    pub fn reference(&self, kind: BackRefKind) -> Option<u32> {
        let off = self.back_refs[kind as usize].load(Ordering::Relaxed);
        (off != NO_BACK_REF).then_some(off)
    }

    pub fn set_reference(&self, kind: BackRefKind, offset: u32) {
        debug_assert_ne!(offset, NO_BACK_REF);
        self.back_refs[kind as usize].store(offset, Ordering::Relaxed);
    }
}
