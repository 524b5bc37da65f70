// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Per-call facade over the buffer pool: obtains or extends the calling
//! thread's buffer, hands out record memory, and tracks overflow.
//!
//! Overflow is sticky: once no buffer can be leased, every further event is
//! dropped silently until the next flush reports the lost byte-range and
//! clears the flag. Bounded memory wins over completeness.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use log::warn;

use crate::buffer::{BackRefKind, Buffer};
use crate::pool::BufferPool;
use crate::Result;

/// Per-thread slot for the currently leased buffer.
///
/// Producers pass their context to every entry point; the monitor keeps a
/// registry of contexts so stop-the-world operations can clear every slot.
/// Tokens are assigned by the monitor's registry and are never zero (zero
/// marks an unowned buffer).
pub struct ThreadContext {
    token: u64,
    buffer: AtomicPtr<Buffer>,
}

impl ThreadContext {
    pub(crate) fn new(token: u64) -> Self {
        debug_assert_ne!(token, 0);
        Self {
            token,
            buffer: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn buffer(&self) -> Option<NonNull<Buffer>> {
        NonNull::new(self.buffer.load(Ordering::Relaxed))
    }

    pub(crate) fn set_buffer(&self, buffer: Option<NonNull<Buffer>>) {
        self.buffer.store(
            buffer.map_or(std::ptr::null_mut(), NonNull::as_ptr),
            Ordering::Relaxed,
        );
    }

    pub(crate) fn take_buffer(&self) -> Option<NonNull<Buffer>> {
        NonNull::new(self.buffer.swap(std::ptr::null_mut(), Ordering::Relaxed))
    }
}

pub struct EventMemory {
    pool: BufferPool,
    overflow: AtomicBool,
    // high usage watermark on the previous flush, for decommit hysteresis
    previous_usage: AtomicUsize,
}

impl EventMemory {
    pub fn new(area_size: usize) -> Result<Self> {
        let pool = BufferPool::new(area_size)?;
        let previous_usage = AtomicUsize::new(pool.bytes_committed());
        Ok(Self {
            pool,
            overflow: AtomicBool::new(false),
            previous_usage,
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn bytes_used(&self) -> usize {
        self.pool.bytes_used()
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes for a plain record. None means the record is
    /// dropped (overflow).
    pub fn alloc(&self, size: usize, ctx: &ThreadContext) -> Option<NonNull<u8>> {
        if self.overflow.load(Ordering::Relaxed) {
            return None;
        }
        if size > self.pool.buffer_size() {
            // cannot ever fit; drop the record without tripping overflow
            debug_assert!(false, "record exceeds buffer size");
            return None;
        }
        let current = ctx.buffer();
        let ensured = self.pool.ensure(current, size, ctx.token());
        if ensured.map(NonNull::as_ptr) != current.map(NonNull::as_ptr) {
            ctx.set_buffer(ensured);
        }
        match ensured {
            Some(buffer) => {
                // SAFETY: ensure() guaranteed room; this thread owns the buffer.
                let p = unsafe { buffer.as_ref() }.alloc(size);
                NonNull::new(p)
            }
            None => {
                self.overflow.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    /// Allocate with back-reference deduplication.
    ///
    /// `want_full` is the caller's verdict from comparing against the current
    /// back-reference; a buffer switch overrides it, because a reference form
    /// cannot point across buffers. Returns the record memory and whether the
    /// full form was written (the slot then points at it).
    pub fn alloc_with_dedup(
        &self,
        kind: BackRefKind,
        want_full: bool,
        full_size: usize,
        dedup_size: usize,
        ctx: &ThreadContext,
    ) -> Option<(NonNull<u8>, bool)> {
        if self.overflow.load(Ordering::Relaxed) {
            return None;
        }
        if full_size > self.pool.buffer_size() {
            debug_assert!(false, "record exceeds buffer size");
            return None;
        }
        let mut write_full = want_full;
        let size = if write_full { full_size } else { dedup_size };

        let current = ctx.buffer();
        let ensured = self.pool.ensure(current, size, ctx.token());
        if ensured.map(NonNull::as_ptr) != current.map(NonNull::as_ptr) {
            ctx.set_buffer(ensured);
            write_full = true;
        }
        let Some(buffer) = ensured else {
            self.overflow.store(true, Ordering::Relaxed);
            return None;
        };
        // A fresh buffer always fits the full form (sizes are bounded by the
        // buffer size); a reused buffer was ensured for the requested form.
        let buffer = unsafe { buffer.as_ref() };
        let p = buffer.alloc(if write_full { full_size } else { dedup_size });
        if write_full {
            let offset = p as usize - buffer.base() as usize;
            buffer.set_reference(kind, offset as u32);
        }
        NonNull::new(p).map(|p| (p, write_full))
    }

    /// The record currently referenced by the thread's back-reference slot,
    /// or None when the thread holds no buffer or the slot is empty.
    pub fn reference_message(&self, kind: BackRefKind, ctx: &ThreadContext) -> Option<NonNull<u8>> {
        let buffer = ctx.buffer()?;
        // SAFETY: the calling thread owns its buffer.
        let buffer = unsafe { buffer.as_ref() };
        let offset = buffer.reference(kind)?;
        // SAFETY: back-reference offsets always point at records in this buffer.
        NonNull::new(unsafe { buffer.base().add(offset as usize) })
    }

    /// Drain finished buffers through `processor`, shrink toward the usage
    /// watermark midpoint, and report any overflow since the last flush.
    pub fn flush(&self, processor: &mut dyn FnMut(&Buffer)) {
        let used = self.pool.bytes_used();
        let next_target = (self.previous_usage.load(Ordering::Relaxed) + used) / 2;
        self.previous_usage.store(used, Ordering::Relaxed);

        let before = used;
        self.pool.flush_buffers(processor, next_target);

        if self.overflow.swap(false, Ordering::Relaxed) {
            warn!(
                "event buffer overflow, data lost [{} -> {}]",
                before,
                self.pool.bytes_used()
            );
        }
    }

    /// Stop-the-world traversal of all leased buffers.
    pub fn buffers_do(&self, visitor: &mut dyn FnMut(&Buffer)) {
        self.pool.leased_buffers_do(visitor);
    }
}
