// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Public facade: lifecycle, the thread registry, and the notification
//! entry points the host calls from its hot paths.
//!
//! The capture memory sits behind an [`ArcSwapOption`], so teardown swaps it
//! out atomically while a producer mid-notification keeps its own reference
//! alive until the call returns. Entry points are cheap no-ops whenever the
//! matching event flag is off or memory has been torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::Settings;
use crate::flush::{run_flush, Flusher, FlushPolicy};
use crate::host::{AgentSink, ClassRef, Host, MethodRef, DIGEST_LEN};
use crate::ids::{TraceId, TraceIdAllocator};
use crate::memory::{EventMemory, ThreadContext};
use crate::queue::{EventQueue, ToJavaCallEvent};
use crate::record::{self, RecordKind};
use crate::Result;

/// Event families that can be switched on and off at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ClassLoad,
    FirstCall,
    ToJavaCall,
}

pub(crate) struct MonitorState {
    pub(crate) memory: ArcSwapOption<EventMemory>,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) agent: Arc<dyn AgentSink>,
    pub(crate) policy: FlushPolicy,
    class_load_enabled: AtomicBool,
    first_call_enabled: AtomicBool,
    to_java_call_enabled: Arc<AtomicBool>,
    registry: Mutex<Vec<Arc<ThreadContext>>>,
    // owner tokens for leased buffers; 0 is reserved for "unowned"
    next_thread_token: AtomicU64,
    ids: TraceIdAllocator,
}

impl MonitorState {
    /// Obtain the pause, retrying per policy. Returns false when every
    /// attempt failed; `op` has then not run.
    pub(crate) fn paused(&self, op: &mut dyn FnMut()) -> bool {
        let mut attempts = 0;
        loop {
            if self.host.pause_all_threads(op) {
                return true;
            }
            if attempts >= self.policy.stw_retries {
                warn!("could not pause application threads");
                return false;
            }
            attempts += 1;
            std::thread::sleep(self.policy.retry_backoff);
        }
    }

    /// Pull the buffer out of every registered thread's slot. Only safe
    /// inside a pause.
    pub(crate) fn release_thread_buffers(&self) {
        for ctx in self.registry.lock().iter() {
            if let Some(buffer) = ctx.take_buffer() {
                // SAFETY: the owning thread is paused, the slot is cleared.
                unsafe { buffer.as_ref() }.release();
            }
        }
    }

    pub(crate) fn disable_capture(&self) {
        self.class_load_enabled.store(false, Ordering::Relaxed);
        self.first_call_enabled.store(false, Ordering::Relaxed);
        self.to_java_call_enabled.store(false, Ordering::Relaxed);
    }
}

pub struct Monitor {
    state: Arc<MonitorState>,
    queue: EventQueue,
    flusher: Flusher,
}

impl Monitor {
    /// Bring up capture memory, the event queue, and the background flusher.
    pub fn init(
        settings: &Settings,
        host: Arc<dyn Host>,
        agent: Arc<dyn AgentSink>,
    ) -> Result<Self> {
        Self::init_with_policy(settings, FlushPolicy::default(), host, agent)
    }

    /// As [`Monitor::init`], with an explicit pause retry policy for forced
    /// flushes.
    pub fn init_with_policy(
        settings: &Settings,
        policy: FlushPolicy,
        host: Arc<dyn Host>,
        agent: Arc<dyn AgentSink>,
    ) -> Result<Self> {
        let memory = EventMemory::new(settings.area_size)?;
        let state = Arc::new(MonitorState {
            memory: ArcSwapOption::from_pointee(memory),
            host,
            agent: Arc::clone(&agent),
            policy,
            class_load_enabled: AtomicBool::new(true),
            first_call_enabled: AtomicBool::new(true),
            to_java_call_enabled: Arc::new(AtomicBool::new(true)),
            registry: Mutex::new(Vec::new()),
            next_thread_token: AtomicU64::new(1),
            ids: TraceIdAllocator::new(),
        });
        let queue = EventQueue::start(agent);
        let flusher = Flusher::start(Arc::clone(&state), settings.flush_interval);
        info!(
            "event capture enabled, {} byte area, flush every {:?}",
            settings.area_size, settings.flush_interval
        );
        Ok(Self {
            state,
            queue,
            flusher,
        })
    }

    pub fn ids(&self) -> &TraceIdAllocator {
        &self.state.ids
    }

    /// Register the calling thread. The returned context must accompany
    /// every notification from that thread.
    pub fn register_thread(&self) -> Arc<ThreadContext> {
        let token = self.state.next_thread_token.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(ThreadContext::new(token));
        self.state.registry.lock().push(Arc::clone(&ctx));
        ctx
    }

    /// Hand back the exiting thread's buffer and drop it from the registry.
    pub fn notify_thread_exit(&self, ctx: &Arc<ThreadContext>) {
        if let Some(buffer) = ctx.take_buffer() {
            // SAFETY: only the exiting thread itself calls this.
            unsafe { buffer.as_ref() }.release();
        }
        self.state
            .registry
            .lock()
            .retain(|c| !Arc::ptr_eq(c, ctx));
    }

    pub fn set_event_enabled(&self, kind: EventKind, enabled: bool) {
        let flag = match kind {
            EventKind::ClassLoad => &self.state.class_load_enabled,
            EventKind::FirstCall => &self.state.first_call_enabled,
            EventKind::ToJavaCall => &self.state.to_java_call_enabled,
        };
        flag.store(enabled, Ordering::Relaxed);
    }

    pub fn notify_class_load(
        &self,
        ctx: &ThreadContext,
        class_ref: ClassRef,
        class_id: TraceId,
        loader_id: TraceId,
        digest: Option<&[u8; DIGEST_LEN]>,
        source: Option<&str>,
    ) {
        if !self.state.class_load_enabled.load(Ordering::Relaxed) {
            return;
        }
        let guard = self.state.memory.load();
        let Some(memory) = guard.as_ref() else {
            return;
        };
        record::post_class_load(memory, ctx, class_ref, class_id, loader_id, digest, source);
    }

    pub fn notify_first_call(&self, ctx: &ThreadContext, method_ref: MethodRef, holder_id: TraceId) {
        if !self.state.first_call_enabled.load(Ordering::Relaxed) {
            return;
        }
        let guard = self.state.memory.load();
        let Some(memory) = guard.as_ref() else {
            return;
        };
        record::post_first_call(memory, ctx, method_ref, holder_id);
    }

    /// Queue a native-to-managed call notification for ordered delivery off
    /// the calling thread.
    pub fn notify_to_java_call(&self, method_name: &str) {
        if !self.state.to_java_call_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.queue.post(Box::new(ToJavaCallEvent::new(
            method_name.to_owned(),
            Arc::clone(&self.state.to_java_call_enabled),
        )));
    }

    /// The host is about to destroy a class and its methods: rewrite every
    /// record referencing them into self-contained form, under a pause.
    pub fn notify_class_eviction(
        &self,
        ctx: &ThreadContext,
        class_ref: ClassRef,
        method_refs: &[MethodRef],
    ) {
        self.blow_matching(ctx, &|kind, p| unsafe {
            match kind {
                RecordKind::ClassLoad => record::class_load_references(p, class_ref),
                RecordKind::FirstCall => method_refs
                    .iter()
                    .any(|&m| record::first_call_references_method(p, m)),
                _ => false,
            }
        });
    }

    /// The host is about to destroy a single method.
    pub fn notify_method_eviction(&self, ctx: &ThreadContext, method_ref: MethodRef) {
        self.blow_matching(ctx, &|kind, p| unsafe {
            kind == RecordKind::FirstCall && record::first_call_references_method(p, method_ref)
        });
    }

    fn blow_matching(
        &self,
        ctx: &ThreadContext,
        matches: &dyn Fn(RecordKind, *const u8) -> bool,
    ) {
        let guard = self.state.memory.load();
        let Some(memory) = guard.as_ref() else {
            return;
        };
        let state = &self.state;
        let mut scan = || {
            memory.buffers_do(&mut |buffer| {
                record::walk_records(buffer, &mut |p| {
                    // SAFETY: the world is paused, we hold the only access.
                    let Some(kind) = (unsafe { record::record_kind(p) }) else {
                        return;
                    };
                    if !matches(kind, p) {
                        return;
                    }
                    match kind {
                        RecordKind::ClassLoad => unsafe {
                            record::blow_class_load(memory, state.host.as_ref(), ctx, buffer, p)
                        },
                        RecordKind::FirstCall => unsafe {
                            record::blow_first_call(memory, state.host.as_ref(), ctx, p)
                        },
                        _ => {}
                    }
                });
            });
        };
        if !self.state.paused(&mut scan) {
            // Without the pause the scan would race the owning threads'
            // writes. The records stay live and are dropped as stale at
            // process time instead; losing events is allowed, racing is not.
            error!("eviction scan skipped, affected records will be dropped");
        }
    }

    /// Flush released buffers. `force` pulls buffers from running threads
    /// first; `and_stop` also disables capture for good.
    pub fn flush(&self, force: bool, and_stop: bool) {
        run_flush(&self.state, force, and_stop);
    }

    pub fn bytes_used(&self) -> usize {
        self.state
            .memory
            .load()
            .as_ref()
            .map_or(0, |m| m.bytes_used())
    }

    /// Final drain, then tear everything down. Entry points on clones of the
    /// registry contexts become no-ops once this returns.
    pub fn shutdown(mut self) {
        run_flush(&self.state, true, true);
        self.flusher.shutdown();
        self.queue.shutdown();
        self.state.memory.store(None);
        info!("event capture stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::testutil::{Event, RecordingAgent, TestHost};
    use std::time::Duration;

    fn monitor(agent: &Arc<RecordingAgent>, host: &Arc<TestHost>) -> Monitor {
        let settings = Settings {
            area_size: 64 * 1024,
            // long enough that tests drive every flush themselves
            flush_interval: Duration::from_secs(3600),
            ..Settings::default()
        };
        Monitor::init(
            &settings,
            Arc::clone(host) as Arc<dyn Host>,
            Arc::clone(agent) as Arc<dyn AgentSink>,
        )
        .expect("monitor")
    }

    #[test]
    fn forced_flush_pulls_buffers_from_live_threads() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "A");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();

        m.notify_class_load(&ctx, 1, 1, 0, None, None);
        assert!(m.bytes_used() > 0);

        // plain flush leaves the thread's buffer alone
        m.flush(false, false);
        assert!(agent.take().is_empty());

        m.flush(true, false);
        assert_eq!(agent.take().len(), 1);
        assert_eq!(m.bytes_used(), 0);
        assert_eq!(host.pauses(), 1);
    }

    #[test]
    fn forced_flush_skips_pause_when_empty() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        let m = monitor(&agent, &host);
        m.flush(true, false);
        assert_eq!(host.pauses(), 0);
    }

    #[test]
    fn and_stop_disables_capture() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "A");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();

        m.notify_class_load(&ctx, 1, 1, 0, None, None);
        m.flush(true, true);
        assert_eq!(agent.take().len(), 1);

        m.notify_class_load(&ctx, 1, 2, 0, None, None);
        m.flush(true, false);
        assert!(agent.take().is_empty());
    }

    #[test]
    fn failed_pause_still_drains_released_buffers() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "A");
        host.fail_pauses(true);
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();

        m.notify_class_load(&ctx, 1, 1, 0, None, None);
        m.notify_thread_exit(&ctx); // releases the buffer
        m.flush(true, false);
        assert_eq!(agent.take().len(), 1);
    }

    #[test]
    fn class_eviction_blows_class_and_method_records() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "Doomed");
        host.add_method(10, "Doomed.m()V");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();

        m.notify_class_load(&ctx, 1, 5, 0, None, Some("d.jar"));
        m.notify_first_call(&ctx, 10, 5);

        m.notify_class_eviction(&ctx, 1, &[10]);
        host.remove_class(1);
        host.remove_method(10);

        m.flush(true, false);
        let events = agent.take();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(
            |e| matches!(e, Event::ClassLoad { name, source, .. }
                if name == "Doomed" && source.as_deref() == Some("d.jar"))
        ));
        assert!(events.iter().any(
            |e| matches!(e, Event::FirstCall { holder_id: 5, name } if name == "Doomed.m()V")
        ));
    }

    #[test]
    fn method_eviction_leaves_other_records_live() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_method(10, "Doomed.m()V");
        host.add_method(11, "Stays.m()V");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();

        m.notify_first_call(&ctx, 10, 1);
        m.notify_first_call(&ctx, 11, 2);
        m.notify_method_eviction(&ctx, 10);
        host.remove_method(10);

        m.flush(true, false);
        let events = agent.take();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::FirstCall { holder_id: 1, name } if name == "Doomed.m()V")));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::FirstCall { holder_id: 2, name } if name == "Stays.m()V")));
    }

    #[test]
    fn declined_pause_skips_the_eviction_scan() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "Stays");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();
        m.notify_class_load(&ctx, 1, 1, 0, None, Some("s.jar"));

        // no pause, no scan: another thread could be mid-write
        host.fail_pauses(true);
        m.notify_class_eviction(&ctx, 1, &[]);
        assert_eq!(host.pauses(), 0);

        let buffer = ctx.buffer().expect("buffer");
        let buffer = unsafe { buffer.as_ref() };
        let mut kinds = Vec::new();
        record::walk_records(buffer, &mut |p| kinds.push(unsafe { record::record_kind(p) }));
        assert_eq!(kinds, vec![Some(RecordKind::ClassLoad)]);

        // the untouched record still decodes as a live class load
        host.fail_pauses(false);
        m.flush(true, false);
        let events = agent.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::ClassLoad { name, .. } if name == "Stays"));
    }

    #[test]
    fn registered_threads_get_distinct_nonzero_tokens() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        let m = monitor(&agent, &host);
        let a = m.register_thread();
        let b = m.register_thread();
        assert_ne!(a.token(), 0);
        assert_ne!(b.token(), 0);
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn shutdown_drains_captured_events() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "A");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();
        m.notify_class_load(&ctx, 1, 1, 0, None, None);
        m.shutdown();
        let events = agent.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::ClassLoad { .. }));
    }

    #[test]
    fn queued_calls_are_delivered_in_order() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        let m = monitor(&agent, &host);
        m.notify_to_java_call("Main.main([Ljava/lang/String;)V");
        m.notify_to_java_call("Main.run()V");
        // the consumer runs concurrently; wait for delivery before stopping,
        // since shutdown gates off anything still queued
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.len() < 2 && std::time::Instant::now() < deadline {
            events.extend(agent.take());
            std::thread::sleep(Duration::from_millis(1));
        }
        m.shutdown();
        let names: Vec<String> = events
            .into_iter()
            .map(|e| match e {
                Event::ToJavaCall { name } => name,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["Main.main([Ljava/lang/String;)V", "Main.run()V"]);
    }

    #[test]
    fn disabled_events_cost_nothing() {
        let agent = Arc::new(RecordingAgent::default());
        let host = Arc::new(TestHost::default());
        host.add_class(1, "A");
        let m = monitor(&agent, &host);
        let ctx = m.register_thread();
        m.set_event_enabled(EventKind::ClassLoad, false);
        m.notify_class_load(&ctx, 1, 1, 0, None, None);
        assert_eq!(m.bytes_used(), 0);
    }
}
