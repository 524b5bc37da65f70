// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Ordered delivery of out-of-band events on a dedicated consumer thread.
//!
//! Some notifications carry owned data and must not run on the producing
//! thread (the producer may hold runtime-internal locks). They are boxed,
//! queued under a mutex, and processed one at a time by the consumer, which
//! drops the lock for the duration of each upcall.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::host::AgentSink;

/// A queued out-of-band event. Processing happens on the consumer thread,
/// outside the queue lock.
pub trait QueuedEvent: Send {
    fn process(&self, agent: &dyn AgentSink);
}

/// Notification that a native thread called into managed code.
///
/// The enabled gate is sampled at processing time, not at enqueue time, so a
/// disable that lands while the event sits in the queue suppresses it.
pub struct ToJavaCallEvent {
    name: String,
    enabled: Arc<AtomicBool>,
}

impl ToJavaCallEvent {
    pub fn new(name: String, enabled: Arc<AtomicBool>) -> Self {
        Self { name, enabled }
    }
}

impl QueuedEvent for ToJavaCallEvent {
    fn process(&self, agent: &dyn AgentSink) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = agent.notify_to_java_call(&self.name) {
            debug!("{}", e);
        }
    }
}

struct QueueState {
    events: VecDeque<Box<dyn QueuedEvent>>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
}

/// FIFO queue with a single consumer thread.
pub struct EventQueue {
    shared: Arc<Shared>,
    consumer: Option<JoinHandle<()>>,
}

impl EventQueue {
    pub fn start(agent: Arc<dyn AgentSink>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let consumer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vigil-events".into())
                .spawn(move || consumer_loop(&shared, &*agent))
                .expect("spawn event consumer")
        };
        Self {
            shared,
            consumer: Some(consumer),
        }
    }

    pub fn post(&self, event: Box<dyn QueuedEvent>) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            trace!("event dropped after queue shutdown");
            return;
        }
        state.events.push_back(event);
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Stop the consumer after it drains everything already queued.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.wake.notify_one();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shared.state.lock().events.len()
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consumer_loop(shared: &Shared, agent: &dyn AgentSink) {
    loop {
        // re-acquire per event so producers are never starved
        let event = {
            let mut state = shared.state.lock();
            loop {
                if let Some(event) = state.events.pop_front() {
                    break Some(event);
                }
                if state.shutdown {
                    break None;
                }
                shared.wake.wait(&mut state);
            }
        };
        match event {
            Some(event) => event.process(agent),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Event, RecordingAgent};
    use std::time::Duration;

    #[test]
    fn events_are_delivered_in_order() {
        let agent = Arc::new(RecordingAgent::default());
        let enabled = Arc::new(AtomicBool::new(true));
        let mut queue = EventQueue::start(agent.clone());
        for i in 0..10 {
            queue.post(Box::new(ToJavaCallEvent::new(
                format!("m{}", i),
                enabled.clone(),
            )));
        }
        queue.shutdown();
        let names: Vec<String> = agent
            .take()
            .into_iter()
            .map(|e| match e {
                Event::ToJavaCall { name } => name,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(names, (0..10).map(|i| format!("m{}", i)).collect::<Vec<_>>());
    }

    #[test]
    fn disable_suppresses_queued_events() {
        let agent = Arc::new(RecordingAgent::default());
        let enabled = Arc::new(AtomicBool::new(true));
        // block the consumer so the event stays queued past the disable
        let gate = Arc::new(Mutex::new(()));
        struct Blocker(Arc<Mutex<()>>);
        impl QueuedEvent for Blocker {
            fn process(&self, _agent: &dyn AgentSink) {
                drop(self.0.lock());
            }
        }
        let held = gate.lock();

        let mut queue = EventQueue::start(agent.clone());
        queue.post(Box::new(Blocker(gate.clone())));
        queue.post(Box::new(ToJavaCallEvent::new("late".into(), enabled.clone())));
        std::thread::sleep(Duration::from_millis(20));
        enabled.store(false, Ordering::Relaxed);
        drop(held);
        queue.shutdown();
        assert!(agent.take().is_empty());
    }

    #[test]
    fn shutdown_drains_pending_events() {
        let agent = Arc::new(RecordingAgent::default());
        let enabled = Arc::new(AtomicBool::new(true));
        let mut queue = EventQueue::start(agent.clone());
        for _ in 0..100 {
            queue.post(Box::new(ToJavaCallEvent::new("m".into(), enabled.clone())));
        }
        queue.shutdown();
        assert_eq!(queue.len(), 0);
        assert_eq!(agent.take().len(), 100);
    }

    #[test]
    fn post_after_shutdown_is_dropped() {
        let agent = Arc::new(RecordingAgent::default());
        let enabled = Arc::new(AtomicBool::new(true));
        let mut queue = EventQueue::start(agent.clone());
        queue.shutdown();
        queue.post(Box::new(ToJavaCallEvent::new("late".into(), enabled)));
        assert_eq!(queue.len(), 0);
    }
}
