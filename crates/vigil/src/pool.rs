// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Buffer pool: owns the reserved region and the three lifecycle lists
//! (free / leased / uncommitted), with adaptive commit and decommit.
//!
//! Conservation invariant: every buffer is on exactly one of the three lists
//! (or transiently in a popper's hands), so
//! `|free| + |leased| + |uncommitted| == buffer_count` at every quiescent
//! point, and `committed == |free| + |leased|`.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use log::debug;

use crate::buffer::Buffer;
use crate::list::{AtomicList, ListNode};
use crate::region::{align_up, page_size, ReservedRegion};
use crate::Result;

/// Aim for roughly this many bytes per buffer (about 128 records).
const DESIRED_BUFFER_SIZE: usize = 8 * 1024;

/// Record sizes are u16, so a buffer never exceeds 64 KiB.
const MAX_BUFFER_SIZE: usize = 1 << 16;

/// Typical startup emits ~2k class loads (~72 B each) and ~11k first calls
/// (~24 B each); commit about this much up front and grow on demand.
const INITIAL_COMMIT_ESTIMATE: usize = 640 * 1024;

pub struct BufferPool {
    free: AtomicList,
    leased: AtomicList,
    uncommitted: AtomicList,
    buffers: Box<[Buffer]>,
    region: ReservedRegion,
    buffer_size: usize,
    committed: AtomicU32,
    bytes_used: AtomicUsize,
    // Buffers popped from the leased list during flush but still owned by a
    // thread. Kept reachable so a stop-the-world scan can still blow records
    // in them mid-flush. Accessed only by the flush thread or inside a
    // stop-the-world section, never concurrently.
    not_finished: AtomicPtr<ListNode>,
}

impl BufferPool {
    /// Carve `area_size` bytes into page-aligned buffers and commit the
    /// initial estimate. Fails only when the initial commit fails.
    pub fn new(area_size: usize) -> Result<Self> {
        let page = page_size();
        let mut buffer_count = (area_size / DESIRED_BUFFER_SIZE).max(2);
        let mut buffer_size = align_up(area_size / buffer_count, page);
        if buffer_size > MAX_BUFFER_SIZE {
            buffer_size = MAX_BUFFER_SIZE;
            buffer_count = (area_size / buffer_size).max(2);
        }
        let committed = (INITIAL_COMMIT_ESTIMATE / buffer_size).clamp(1, buffer_count);
        let area = buffer_count * buffer_size;

        let region = ReservedRegion::reserve(area)?;
        region.commit(0, committed * buffer_size)?;

        let buffers: Box<[Buffer]> = (0..buffer_count)
            // SAFETY: i * buffer_size < area, inside the reservation.
            .map(|i| Buffer::new(unsafe { region.base().add(i * buffer_size) }))
            .collect();

        let pool = Self {
            free: AtomicList::new(),
            leased: AtomicList::new(),
            uncommitted: AtomicList::new(),
            buffers,
            region,
            buffer_size,
            committed: AtomicU32::new(committed as u32),
            bytes_used: AtomicUsize::new(0),
            not_finished: AtomicPtr::new(ptr::null_mut()),
        };
        for i in (0..committed).rev() {
            // SAFETY: buffers live as long as the pool; not yet shared.
            unsafe { pool.free.push(pool.buffers[i].link()) };
        }
        for i in (committed..buffer_count).rev() {
            // SAFETY: as above.
            unsafe { pool.uncommitted.push(pool.buffers[i].link()) };
        }
        debug!(
            "event buffer pool: {} buffers of {} bytes, {} committed (area {})",
            buffer_count, buffer_size, committed, area
        );
        Ok(pool)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Relaxed)
    }

    pub fn bytes_committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed) as usize * self.buffer_size
    }

    fn buffer_offset(&self, buffer: &Buffer) -> usize {
        buffer.base() as usize - self.region.base() as usize
    }

    /// Lease a buffer for `owner`. Tries the free list first (no syscall),
    /// then commits an uncommitted buffer. None means overflow: leasing never
    /// blocks.
    pub fn lease_for(&self, owner: u64) -> Option<NonNull<Buffer>> {
        let link = self.free.pop();
        let link = if link.is_null() {
            let link = self.uncommitted.pop();
            if link.is_null() {
                debug!(
                    "out of buffer space: {} committed, {} bytes used",
                    self.committed.load(Ordering::Relaxed),
                    self.bytes_used()
                );
                return None;
            }
            // SAFETY: links on our lists always come from our buffers.
            let buffer = unsafe { &*Buffer::from_link(link) };
            let offset = self.buffer_offset(buffer);
            if self.region.commit(offset, self.buffer_size).is_err() {
                // no physical memory, put the buffer back
                unsafe { self.uncommitted.push(link) };
                return None;
            }
            self.committed.fetch_add(1, Ordering::Relaxed);
            debug_assert!(self.committed.load(Ordering::Relaxed) as usize <= self.buffers.len());
            link
        } else {
            link
        };

        // SAFETY: as above; the pop gave us exclusive rights to the node.
        let buffer = unsafe { &*Buffer::from_link(link) };
        buffer.lease(owner);
        unsafe { self.leased.push(link) };
        self.bytes_used.fetch_add(self.buffer_size, Ordering::Relaxed);
        Some(NonNull::from(buffer))
    }

    /// Return `buffer` if it still has room for `size`, otherwise release it
    /// (owner must be the caller) and lease a fresh one.
    pub fn ensure(
        &self,
        buffer: Option<NonNull<Buffer>>,
        size: usize,
        owner: u64,
    ) -> Option<NonNull<Buffer>> {
        debug_assert!(size <= self.buffer_size, "record exceeds buffer size");
        if let Some(b) = buffer {
            // SAFETY: the caller's thread owns this buffer.
            let b = unsafe { b.as_ref() };
            if b.remaining(self.buffer_size) >= size {
                return Some(NonNull::from(b));
            }
            debug_assert_eq!(b.owner(), owner, "ensure from a non-owning thread");
            b.release();
        }
        self.lease_for(owner)
    }

    /// Drain the leased list. Unowned buffers are handed to `processor` and
    /// then freed or decommitted down to `committed_goal` bytes; buffers
    /// still owned by a thread are put aside and spliced back unprocessed.
    pub fn flush_buffers(&self, processor: &mut dyn FnMut(&Buffer), committed_goal: usize) {
        let goal_buffers = committed_goal / self.buffer_size;
        let mut to_uncommit = (self.committed.load(Ordering::Relaxed) as usize)
            .saturating_sub(goal_buffers);
        let mut uncommitted_chain: *mut ListNode = ptr::null_mut();
        let mut counts = (0usize, 0usize, 0usize); // owned, processed, decommitted

        loop {
            let link = self.leased.pop();
            if link.is_null() {
                break;
            }
            // SAFETY: links on the leased list come from our buffers.
            let buffer = unsafe { &*Buffer::from_link(link) };
            if buffer.owner() != crate::buffer::NO_OWNER {
                // still being written; keep it reachable but unprocessed
                counts.0 += 1;
                unsafe {
                    (*link).set_next(self.not_finished.load(Ordering::Relaxed));
                }
                self.not_finished.store(link, Ordering::Relaxed);
            } else {
                counts.1 += 1;
                processor(buffer);
                self.bytes_used.fetch_sub(self.buffer_size, Ordering::Relaxed);
                if to_uncommit > 0 && self.uncommit_buffer(buffer, &mut uncommitted_chain) {
                    to_uncommit -= 1;
                    counts.2 += 1;
                } else {
                    unsafe { self.free.push(link) };
                }
            }
        }

        let not_finished = self.not_finished.swap(ptr::null_mut(), Ordering::Relaxed);
        if !not_finished.is_null() {
            // SAFETY: the chain was built above from our own buffers.
            unsafe { self.leased.splice(not_finished) };
        }

        while to_uncommit > 0 {
            let link = self.free.pop();
            if link.is_null() {
                break;
            }
            let buffer = unsafe { &*Buffer::from_link(link) };
            if self.uncommit_buffer(buffer, &mut uncommitted_chain) {
                to_uncommit -= 1;
                counts.2 += 1;
            } else {
                unsafe { self.free.push(link) };
                break;
            }
        }

        if !uncommitted_chain.is_null() {
            // SAFETY: chain of buffers we just decommitted, caller-owned.
            unsafe { self.uncommitted.splice(uncommitted_chain) };
        }
        debug!(
            "flush: {} still owned, {} processed, {} decommitted",
            counts.0, counts.1, counts.2
        );
    }

    fn uncommit_buffer(&self, buffer: &Buffer, chain: &mut *mut ListNode) -> bool {
        let offset = self.buffer_offset(buffer);
        if self.region.uncommit(offset, self.buffer_size) {
            let link = buffer.link();
            // SAFETY: buffer was popped from a list, we own its link.
            unsafe { (*link).set_next(*chain) };
            *chain = link;
            debug_assert!(self.committed.load(Ordering::Relaxed) > 0);
            self.committed.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Raw traversal of every leased buffer, including buffers put aside
    /// mid-flush. Caller must synchronize (stop-the-world section).
    pub fn leased_buffers_do(&self, visitor: &mut dyn FnMut(&Buffer)) {
        let mut link = self.leased.head();
        while !link.is_null() {
            // SAFETY: caller guarantees no concurrent list mutation.
            let buffer = unsafe { &*Buffer::from_link(link) };
            visitor(buffer);
            link = unsafe { (*link).next() };
        }
        let mut link = self.not_finished.load(Ordering::Relaxed);
        while !link.is_null() {
            let buffer = unsafe { &*Buffer::from_link(link) };
            visitor(buffer);
            link = unsafe { (*link).next() };
        }
    }

    #[cfg(test)]
    pub(crate) fn list_lengths(&self) -> (usize, usize, usize) {
        fn len(mut link: *mut ListNode) -> usize {
            let mut n = 0;
            while !link.is_null() {
                n += 1;
                link = unsafe { (*link).next() };
            }
            n
        }
        (
            len(self.free.head()),
            len(self.leased.head()),
            len(self.uncommitted.head()),
        )
    }
}
