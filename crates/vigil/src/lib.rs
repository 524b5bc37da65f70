// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Lock-free event capture for runtime monitoring.
//!
//! Application threads record class-load and first-call events into
//! thread-leased buffers carved out of one reserved memory area; a
//! background flusher drains finished buffers and delivers decoded events to
//! an external agent. The hot path never blocks and never allocates from the
//! system: when the area is exhausted, events are dropped and the loss is
//! reported on the next flush.
//!
//! The embedding runtime supplies two capabilities through traits: a way to
//! pause all application threads ([`Host`]) and the delivery channel for
//! decoded events ([`AgentSink`]). Everything else is internal.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::{Monitor, Settings};
//! # fn demo(host: Arc<dyn vigil::Host>, agent: Arc<dyn vigil::AgentSink>) -> vigil::Result<()> {
//! let settings = Settings::from_sources(std::env::var("VIGIL_OPTIONS").ok().as_deref(), None);
//! if settings.mode.is_enabled() {
//!     let monitor = Monitor::init(&settings, host, agent)?;
//!     let ctx = monitor.register_thread();
//!     monitor.notify_class_load(&ctx, 0x1000, 1, 0, None, Some("app.jar"));
//!     monitor.shutdown();
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;

pub mod config;
pub mod host;
pub mod ids;
pub mod monitor;

mod buffer;
mod flush;
mod list;
mod memory;
mod pool;
mod queue;
mod record;
mod region;

pub use config::{LogLevel, Mode, Settings};
pub use flush::FlushPolicy;
pub use host::{AgentError, AgentSink, ClassRef, Host, MethodRef, DIGEST_LEN};
pub use ids::{TraceId, TraceIdAllocator, ANONYMOUS_ID};
pub use memory::ThreadContext;
pub use monitor::{EventKind, Monitor};

#[derive(Debug)]
pub enum Error {
    /// Reserving the capture area's address range failed.
    RegionReserve(io::Error),
    /// Committing physical memory for a buffer failed.
    CommitFailed(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RegionReserve(e) => write!(f, "reserving capture area failed: {}", e),
            Error::CommitFailed(e) => write!(f, "committing buffer memory failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::RegionReserve(e) | Error::CommitFailed(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
