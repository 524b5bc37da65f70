// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Flush coordination: the periodic background flusher and the forced drain.
//!
//! A plain flush only processes buffers their threads have already released.
//! A forced flush first takes a pause to pull the buffers out of every
//! registered thread's hands, so nothing stays behind; with `and_stop` it
//! also turns capture off inside the pause, which makes the drain final.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::monitor::MonitorState;
use crate::record::{process_buffer, RecordStats};

/// How hard a forced flush tries to obtain the pause before giving up and
/// draining only what is already released.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    pub stw_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            stw_retries: 0,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// One flush pass. `force` pulls buffers from running threads; `and_stop`
/// additionally disables capture while the world is paused.
pub(crate) fn run_flush(state: &MonitorState, force: bool, and_stop: bool) {
    let guard = state.memory.load();
    let Some(memory) = guard.as_ref() else {
        return;
    };

    if force {
        // nothing to pull out of threads and nothing to switch off: skip the
        // pause entirely
        if memory.bytes_used() > 0 || and_stop {
            let paused = state.paused(&mut || {
                if and_stop {
                    state.disable_capture();
                }
                state.release_thread_buffers();
            });
            if !paused && and_stop {
                // racing producers may still finish a record; the flags stop
                // everything after that
                state.disable_capture();
            }
        }
    }

    let mut stats = RecordStats::default();
    memory.flush(&mut |buffer| {
        stats.merge(&process_buffer(buffer, state.agent.as_ref(), state.host.as_ref()));
    });
    if force {
        stats.log();
    }
}

struct FlusherShared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Background thread running plain flushes at a fixed interval.
pub(crate) struct Flusher {
    shared: Arc<FlusherShared>,
    thread: Option<JoinHandle<()>>,
}

impl Flusher {
    pub(crate) fn start(state: Arc<MonitorState>, interval: Duration) -> Self {
        let shared = Arc::new(FlusherShared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vigil-flush".into())
                .spawn(move || {
                    debug!("flusher running, interval {:?}", interval);
                    loop {
                        {
                            let mut stop = shared.stop.lock();
                            if !*stop {
                                shared.wake.wait_for(&mut stop, interval);
                            }
                            if *stop {
                                return;
                            }
                        }
                        run_flush(&state, false, false);
                    }
                })
                .expect("spawn flusher")
        };
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_one();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
