// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Trace identifiers for loaders and classes.
//!
//! Monotonically increasing, assigned once per entity. Id 0 is reserved for
//! anonymous entities and is never handed out as a real id.

use std::sync::atomic::{AtomicU32, Ordering};

pub type TraceId = u32;

/// The reserved id for anonymous loaders/classes.
pub const ANONYMOUS_ID: TraceId = 0;

#[derive(Debug, Default)]
pub struct TraceIdAllocator {
    next_loader: AtomicU32,
    next_class: AtomicU32,
}

impl TraceIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next loader id; anonymous loaders get the reserved id 0.
    pub fn assign_loader_id(&self, anonymous: bool) -> TraceId {
        if anonymous {
            ANONYMOUS_ID
        } else {
            self.next_loader.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn assign_class_id(&self) -> TraceId {
        self.next_class.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pin an entity to the anonymous id.
    pub fn anonymous_id(&self) -> TraceId {
        ANONYMOUS_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_skip_zero() {
        let alloc = TraceIdAllocator::new();
        assert_eq!(alloc.assign_class_id(), 1);
        assert_eq!(alloc.assign_class_id(), 2);
        assert_eq!(alloc.assign_loader_id(false), 1);
        assert_eq!(alloc.assign_loader_id(true), ANONYMOUS_ID);
        assert_eq!(alloc.assign_loader_id(false), 2);
    }

    #[test]
    fn loader_and_class_counters_are_independent() {
        let alloc = TraceIdAllocator::new();
        for _ in 0..5 {
            alloc.assign_class_id();
        }
        assert_eq!(alloc.assign_loader_id(false), 1);
    }
}
