// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Lock-free intrusive singly-linked list used for all buffer bookkeeping.
//!
//! A Treiber stack hardened against the double-pop race with a locking
//! sentinel: to detach the head, a popper CAS-installs a stack-local
//! placeholder node whose `next` points at a list-unique marker. While the
//! placeholder is installed, any push or pop that observes
//! `head.next == marker` spins, so the popper can read `head.next` without a
//! hazard window and republish it as the new head.
//!
//! Nodes are never freed while a list can reach them: the pool owns all
//! buffers for its whole lifetime, so a stale `head` read can only cause a
//! retry, never a use-after-free.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive link. Embed as the **first** field of a `#[repr(C)]` node type
/// so the containing node can be recovered by pointer cast.
#[derive(Debug)]
pub struct ListNode {
    next: AtomicPtr<ListNode>,
}

impl ListNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn next(&self) -> *mut ListNode {
        self.next.load(Ordering::Acquire)
    }

    /// Caller must own the node (not yet published to any list).
    pub fn set_next(&self, next: *mut ListNode) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl Default for ListNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free list head with a list-unique marker node.
///
/// The marker is boxed so its address stays stable; it is compared by
/// identity only and never linked into the list proper.
pub struct AtomicList {
    head: AtomicPtr<ListNode>,
    marker: Box<ListNode>,
}

// SAFETY: AtomicList is Send + Sync because:
// - head is only mutated through CAS loops
// - the marker box is never mutated after construction, only compared by address
// - node memory outlives the list (owned by the buffer pool)
unsafe impl Send for AtomicList {}
unsafe impl Sync for AtomicList {}

impl AtomicList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            marker: Box::new(ListNode::new()),
        }
    }

    fn marker_ptr(&self) -> *mut ListNode {
        let marker: &ListNode = &self.marker;
        marker as *const ListNode as *mut ListNode
    }

    /// Push a single node.
    ///
    /// # Safety
    /// `node` must be exclusively owned by the caller (linked into no list)
    /// and must stay valid until popped.
    pub unsafe fn push(&self, node: *mut ListNode) {
        debug_assert!(!node.is_null());
        let marker = self.marker_ptr();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // head.next == marker means a pop installed its placeholder; wait
            // until the new head is republished.
            if !head.is_null() && unsafe { (*head).next.load(Ordering::Acquire) } == marker {
                std::hint::spin_loop();
                continue;
            }
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Splice a caller-built chain (terminated by a null `next`) in one CAS,
    /// preserving the chain's internal order.
    ///
    /// # Safety
    /// Every node of `chain` must be exclusively owned by the caller and no
    /// other thread may mutate the chain's links during the call.
    pub unsafe fn splice(&self, chain: *mut ListNode) {
        debug_assert!(!chain.is_null());
        let marker = self.marker_ptr();
        let mut tail = chain;
        // chain is caller-owned, so the walk is race-free
        while !unsafe { (*tail).next.load(Ordering::Relaxed) }.is_null() {
            tail = unsafe { (*tail).next.load(Ordering::Relaxed) };
        }
        loop {
            let head = self.head.load(Ordering::Acquire);
            if !head.is_null() && unsafe { (*head).next.load(Ordering::Acquire) } == marker {
                std::hint::spin_loop();
                continue;
            }
            unsafe { (*tail).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, chain, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop the current head. Returns null only when the list is genuinely
    /// empty; contention is resolved by retrying.
    pub fn pop(&self) -> *mut ListNode {
        let marker = self.marker_ptr();
        // Stack-local placeholder: published as the list head only between the
        // winning CAS below and the republish store, both in this call.
        let lock = ListNode {
            next: AtomicPtr::new(marker),
        };
        let lock_ptr = &lock as *const ListNode as *mut ListNode;
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return ptr::null_mut();
            }
            // SAFETY: head points at pool-owned memory that is never freed
            // while the list exists, so the load is safe even if the node was
            // concurrently popped (the CAS below will fail in that case).
            if unsafe { (*head).next.load(Ordering::Acquire) } == marker {
                // another pop is mid-flight
                std::hint::spin_loop();
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, lock_ptr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Exclusive rights: pushes and pops observing the placeholder
                // spin, so head.next is the next value from the incarnation we
                // detached and can be republished directly.
                // SAFETY: the winning CAS proves head was the true list head.
                let next = unsafe { (*head).next.load(Ordering::Acquire) };
                self.head.store(next, Ordering::Release);
                unsafe { (*head).next.store(ptr::null_mut(), Ordering::Relaxed) };
                return head;
            }
        }
    }

    /// Non-owning snapshot of the head for read-only traversal.
    ///
    /// The caller must synchronize externally (stop-the-world section or a
    /// single-accessor protocol); the list itself provides no hazard
    /// protection for traversals.
    pub fn head(&self) -> *mut ListNode {
        self.head.load(Ordering::Acquire)
    }
}

impl Default for AtomicList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct TestNode {
        link: ListNode,
        value: u64,
    }

    fn node(value: u64) -> *mut ListNode {
        Box::into_raw(Box::new(TestNode {
            link: ListNode::new(),
            value,
        }))
        .cast::<ListNode>()
    }

    fn value_of(link: *mut ListNode) -> u64 {
        // link is the first field of the repr(C) node
        unsafe { (*link.cast::<TestNode>()).value }
    }

    fn free(link: *mut ListNode) {
        drop(unsafe { Box::from_raw(link.cast::<TestNode>()) });
    }

    #[test]
    fn push_pop_single() {
        let list = AtomicList::new();
        let n = node(7);
        unsafe { list.push(n) };
        let popped = list.pop();
        assert_eq!(popped, n);
        assert_eq!(value_of(popped), 7);
        assert!(list.pop().is_null());
        free(popped);
    }

    #[test]
    fn pop_is_lifo() {
        let list = AtomicList::new();
        for v in 0..4 {
            unsafe { list.push(node(v)) };
        }
        for expected in (0..4).rev() {
            let p = list.pop();
            assert_eq!(value_of(p), expected);
            free(p);
        }
        assert!(list.pop().is_null());
    }

    #[test]
    fn splice_preserves_chain_order() {
        let list = AtomicList::new();
        unsafe { list.push(node(99)) };

        // chain 1 -> 2 -> 3
        let chain = node(1);
        let second = node(2);
        let third = node(3);
        unsafe {
            (*chain).set_next(second);
            (*second).set_next(third);
            list.splice(chain);
        }

        let order: Vec<u64> = (0..4)
            .map(|_| {
                let p = list.pop();
                let v = value_of(p);
                free(p);
                v
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3, 99]);
    }

    #[test]
    fn head_walk_sees_all_nodes() {
        let list = AtomicList::new();
        for v in 0..8 {
            unsafe { list.push(node(v)) };
        }
        let mut seen = 0;
        let mut cur = list.head();
        while !cur.is_null() {
            seen += 1;
            cur = unsafe { (*cur).next() };
        }
        assert_eq!(seen, 8);
        loop {
            let p = list.pop();
            if p.is_null() {
                break;
            }
            free(p);
        }
    }

    #[test]
    fn concurrent_push_pop_returns_each_node_once() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 500;

        let list = AtomicList::new();
        crossbeam::scope(|s| {
            for t in 0..THREADS {
                let list = &list;
                s.spawn(move |_| {
                    for i in 0..PER_THREAD {
                        unsafe { list.push(node(t * PER_THREAD + i)) };
                    }
                });
            }
        })
        .expect("pusher thread panicked");

        let mut seen = vec![false; (THREADS * PER_THREAD) as usize];
        let mut last_per_thread = vec![u64::MAX; THREADS as usize];
        loop {
            let p = list.pop();
            if p.is_null() {
                break;
            }
            let v = value_of(p);
            free(p);
            assert!(!seen[v as usize], "node {} returned twice", v);
            seen[v as usize] = true;
            // LIFO drain: per thread, later insertions come out first
            let t = (v / PER_THREAD) as usize;
            assert!(v < last_per_thread[t], "per-thread order violated");
            last_per_thread[t] = v;
        }
        assert!(seen.iter().all(|&s| s), "some node was lost");
    }

    #[test]
    fn concurrent_mixed_push_pop_stress() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 2000;

        let list = AtomicList::new();
        let (tx, rx) = crossbeam::channel::unbounded();

        crossbeam::scope(|s| {
            for t in 0..THREADS {
                let list = &list;
                let tx = tx.clone();
                s.spawn(move |_| {
                    for i in 0..PER_THREAD {
                        unsafe { list.push(node(t * PER_THREAD + i)) };
                        if i % 3 == 0 {
                            let p = list.pop();
                            if !p.is_null() {
                                tx.send(value_of(p)).expect("collector gone");
                                free(p);
                            }
                        }
                    }
                });
            }
        })
        .expect("stress thread panicked");
        drop(tx);

        let mut all: Vec<u64> = rx.iter().collect();
        loop {
            let p = list.pop();
            if p.is_null() {
                break;
            }
            all.push(value_of(p));
            free(p);
        }
        all.sort_unstable();
        let expected: Vec<u64> = (0..THREADS * PER_THREAD).collect();
        assert_eq!(all, expected, "every node exactly once");
    }
}
