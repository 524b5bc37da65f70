// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! External capabilities: the host runtime and the monitoring agent.
//!
//! The core never owns a thread-pausing mechanism or entity metadata; both
//! are supplied by the embedder through these traits.

use std::fmt;

use crate::ids::TraceId;

/// Opaque handle to a live class entity inside the monitored runtime.
/// Valid until the host destroys the entity; a blow must happen first.
pub type ClassRef = u64;

/// Opaque handle to a live method entity.
pub type MethodRef = u64;

/// Class-bytes digest length (externally computed fingerprint).
pub const DIGEST_LEN: usize = 32;

/// Error raised by the agent during an upcall. Always swallowed by the core;
/// the payload exists only for debug logging.
#[derive(Debug)]
pub struct AgentError(pub String);

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent notification failed: {}", self.0)
    }
}

impl std::error::Error for AgentError {}

/// Upcalls into the external monitoring agent.
///
/// Failures never propagate past the core: they are logged at debug level and
/// discarded, and later records are unaffected.
pub trait AgentSink: Send + Sync {
    fn notify_class_load(
        &self,
        name: &str,
        digest: Option<&[u8; DIGEST_LEN]>,
        class_id: TraceId,
        loader_id: TraceId,
        source: Option<&str>,
    ) -> Result<(), AgentError>;

    fn notify_first_call(&self, holder_id: TraceId, method_name: &str) -> Result<(), AgentError>;

    fn notify_to_java_call(&self, method_name: &str) -> Result<(), AgentError>;
}

/// Capabilities of the host runtime.
pub trait Host: Send + Sync {
    /// Run `op` while no other application thread mutates shared state.
    ///
    /// Returns false when the pause could not be obtained; the caller decides
    /// whether to retry (see `FlushPolicy`). Users of this capability:
    /// forced drain, blow scans on eviction, and teardown while producers may
    /// still be active.
    fn pause_all_threads(&self, op: &mut dyn FnMut()) -> bool;

    /// Resolve the name of a live class. `None` means the entity is gone —
    /// a blow should have rewritten the record first, so this is a
    /// programming error on the host side.
    fn class_name(&self, class: ClassRef) -> Option<String>;

    /// Resolve the qualified name (name + signature) of a live method.
    fn method_name(&self, method: MethodRef) -> Option<String>;
}
