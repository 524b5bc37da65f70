// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Tagged variable-length records laid out manually in buffer memory.
//!
//! Header: `{ kind: u8, flags: u8, size: u16 }`, records padded to pointer
//! width when walking. Live records (class load, first call) keep raw entity
//! handles and resolve names only when processed; blown records are
//! self-contained copies made before the referenced entity is destroyed.
//! Blowing rewrites the live record's kind byte to `Deleted` in place — the
//! size is untouched so the walk step over that slot never changes. The
//! rewrite happens only inside a stop-the-world section.
//!
//! Class-load source strings are deduplicated per buffer: a record whose
//! source equals the buffer's current back-reference is written in a compact
//! "same source" form that points at the prior record instead of copying.

use std::ptr;

use log::{debug, error};

use crate::buffer::{BackRefKind, Buffer, RECORD_ALIGN};
use crate::host::{AgentSink, ClassRef, Host, MethodRef, DIGEST_LEN};
use crate::ids::TraceId;
use crate::memory::{EventMemory, ThreadContext};
use crate::region::align_up;

/// Record kinds. Deleted sits between the live and the blown kinds so the
/// wire values stay stable when new live kinds are appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    ClassLoad = 0,
    FirstCall = 1,
    Deleted = 2,
    ClassLoadBlown = 3,
    FirstCallBlown = 4,
}

pub const RECORD_KIND_COUNT: usize = 5;

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ClassLoad),
            1 => Some(Self::FirstCall),
            2 => Some(Self::Deleted),
            3 => Some(Self::ClassLoadBlown),
            4 => Some(Self::FirstCallBlown),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ClassLoad => "class load",
            Self::FirstCall => "first call",
            Self::Deleted => "deleted",
            Self::ClassLoadBlown => "class load blown",
            Self::FirstCallBlown => "first call blown",
        }
    }
}

const FLAG_HAS_DIGEST: u8 = 0x01;
const FLAG_HAS_SOURCE: u8 = 0x02;
const FLAG_HAS_SAME_SOURCE: u8 = 0x04;

const HDR_KIND: usize = 0;
const HDR_FLAGS: usize = 1;
const HDR_SIZE: usize = 2;
pub const HEADER_SIZE: usize = 4;

// class load (live): header, pad, class_ref, class_id, loader_id, digest, source...
const CL_CLASS_REF: usize = 8;
const CL_CLASS_ID: usize = 16;
const CL_LOADER_ID: usize = 20;
const CL_DIGEST: usize = 24;
pub const CLASS_LOAD_FIXED: usize = CL_DIGEST + DIGEST_LEN; // 56

// first call (live): header, pad, method_ref, holder_id
const FC_METHOD_REF: usize = 8;
const FC_HOLDER_ID: usize = 16;
pub const FIRST_CALL_SIZE: usize = 20;

// class load blown: header, class_id, loader_id, source_len, pad, digest,
// source..., name...
const CLB_CLASS_ID: usize = 4;
const CLB_LOADER_ID: usize = 8;
const CLB_SOURCE_LEN: usize = 12;
const CLB_DIGEST: usize = 16;
const CLASS_LOAD_BLOWN_FIXED: usize = CLB_DIGEST + DIGEST_LEN; // 48

// first call blown: header, holder_id, name...
const FCB_HOLDER_ID: usize = 4;
const FIRST_CALL_BLOWN_FIXED: usize = 8;

// ---------------------------------------------------------------------------
// unaligned field access

unsafe fn get_u16(p: *const u8) -> u16 {
    unsafe { ptr::read_unaligned(p.cast::<u16>()) }
}

unsafe fn put_u16(p: *mut u8, v: u16) {
    unsafe { ptr::write_unaligned(p.cast::<u16>(), v) }
}

unsafe fn get_u32(p: *const u8) -> u32 {
    unsafe { ptr::read_unaligned(p.cast::<u32>()) }
}

unsafe fn put_u32(p: *mut u8, v: u32) {
    unsafe { ptr::write_unaligned(p.cast::<u32>(), v) }
}

unsafe fn get_u64(p: *const u8) -> u64 {
    unsafe { ptr::read_unaligned(p.cast::<u64>()) }
}

unsafe fn put_u64(p: *mut u8, v: u64) {
    unsafe { ptr::write_unaligned(p.cast::<u64>(), v) }
}

/// # Safety
/// `p` must point at a record header inside a live buffer.
pub unsafe fn record_kind(p: *const u8) -> Option<RecordKind> {
    RecordKind::from_u8(unsafe { *p.add(HDR_KIND) })
}

/// # Safety
/// As [`record_kind`].
pub unsafe fn record_size(p: *const u8) -> usize {
    unsafe { get_u16(p.add(HDR_SIZE)) as usize }
}

unsafe fn record_flags(p: *const u8) -> u8 {
    unsafe { *p.add(HDR_FLAGS) }
}

unsafe fn write_header(p: *mut u8, kind: RecordKind, flags: u8, size: usize) {
    debug_assert!(size <= u16::MAX as usize);
    unsafe {
        *p.add(HDR_KIND) = kind as u8;
        *p.add(HDR_FLAGS) = flags;
        put_u16(p.add(HDR_SIZE), size as u16);
    }
}

/// Rewrite a live record to the inert tombstone. The size stays, so the walk
/// step over this slot never changes.
///
/// # Safety
/// Must run inside a stop-the-world section (another thread may be walking
/// the same buffer otherwise).
pub unsafe fn mark_deleted(p: *mut u8) {
    unsafe { *p.add(HDR_KIND) = RecordKind::Deleted as u8 };
}

/// Payload tail of a live class-load record, or None without `HAS_SOURCE`.
unsafe fn class_load_source(p: *const u8) -> Option<&'static [u8]> {
    unsafe {
        if record_flags(p) & FLAG_HAS_SOURCE == 0 {
            return None;
        }
        let len = record_size(p) - CLASS_LOAD_FIXED;
        Some(std::slice::from_raw_parts(p.add(CLASS_LOAD_FIXED), len))
    }
}

/// Source bytes a live class-load record resolves to, following the buffer's
/// back-reference slot for the same-source form.
unsafe fn resolve_class_load_source(buffer: &Buffer, p: *const u8) -> Option<Vec<u8>> {
    unsafe {
        if let Some(own) = class_load_source(p) {
            return Some(own.to_vec());
        }
        if record_flags(p) & FLAG_HAS_SAME_SOURCE == 0 {
            return None;
        }
        let offset = buffer.reference(BackRefKind::ClassLoad)?;
        let referent = buffer.base().add(offset as usize) as *const u8;
        debug_assert_eq!(record_kind(referent), Some(RecordKind::ClassLoad));
        class_load_source(referent).map(<[u8]>::to_vec)
    }
}

// ---------------------------------------------------------------------------
// producers

/// Encode a class-load record, deduplicating the source string against the
/// buffer's back-reference slot. An empty source is normalized to "no
/// source" before comparison. Drops the record silently on overflow.
pub fn post_class_load(
    memory: &EventMemory,
    ctx: &ThreadContext,
    class_ref: ClassRef,
    class_id: TraceId,
    loader_id: TraceId,
    digest: Option<&[u8; DIGEST_LEN]>,
    source: Option<&str>,
) {
    let source = source.filter(|s| !s.is_empty());

    // The slot may point at a record without a source (it is updated on every
    // buffer switch); such a referent cannot serve dedup.
    let previous = memory
        .reference_message(BackRefKind::ClassLoad, ctx)
        .filter(|p| unsafe {
            record_kind(p.as_ptr()) == Some(RecordKind::ClassLoad)
                && record_flags(p.as_ptr()) & FLAG_HAS_SOURCE != 0
        });
    let previous_source =
        previous.and_then(|p| unsafe { class_load_source(p.as_ptr().cast_const()) });

    let want_full = match (source, previous_source) {
        (Some(s), Some(prev)) => s.as_bytes() != prev,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let full_size = CLASS_LOAD_FIXED + source.map_or(0, str::len);
    if full_size > u16::MAX as usize {
        debug!("class load record too large ({} bytes), dropped", full_size);
        return;
    }

    let Some((p, wrote_full)) =
        memory.alloc_with_dedup(BackRefKind::ClassLoad, want_full, full_size, CLASS_LOAD_FIXED, ctx)
    else {
        return;
    };
    let p = p.as_ptr();

    let mut flags = 0u8;
    let mut size = CLASS_LOAD_FIXED;
    if digest.is_some() {
        flags |= FLAG_HAS_DIGEST;
    }
    if wrote_full {
        if let Some(s) = source {
            flags |= FLAG_HAS_SOURCE;
            size = full_size;
        }
    } else if previous_source.is_some() {
        // same source as the record the back-reference slot points at
        flags |= FLAG_HAS_SAME_SOURCE;
    }

    // SAFETY: alloc_with_dedup returned `size` writable bytes owned by this
    // thread's buffer.
    unsafe {
        write_header(p, RecordKind::ClassLoad, flags, size);
        put_u64(p.add(CL_CLASS_REF), class_ref);
        put_u32(p.add(CL_CLASS_ID), class_id);
        put_u32(p.add(CL_LOADER_ID), loader_id);
        if let Some(d) = digest {
            ptr::copy_nonoverlapping(d.as_ptr(), p.add(CL_DIGEST), DIGEST_LEN);
        }
        if flags & FLAG_HAS_SOURCE != 0 {
            let s = source.unwrap_or_default().as_bytes();
            ptr::copy_nonoverlapping(s.as_ptr(), p.add(CLASS_LOAD_FIXED), s.len());
        }
    }
}

/// Encode a first-call record. Drops silently on overflow.
pub fn post_first_call(
    memory: &EventMemory,
    ctx: &ThreadContext,
    method_ref: MethodRef,
    holder_id: TraceId,
) {
    let Some(p) = memory.alloc(FIRST_CALL_SIZE, ctx) else {
        return;
    };
    let p = p.as_ptr();
    // SAFETY: alloc returned FIRST_CALL_SIZE writable bytes.
    unsafe {
        write_header(p, RecordKind::FirstCall, 0, FIRST_CALL_SIZE);
        put_u64(p.add(FC_METHOD_REF), method_ref);
        put_u32(p.add(FC_HOLDER_ID), holder_id);
    }
}

// ---------------------------------------------------------------------------
// blow transformation

/// Append a self-contained copy of a live class-load record, then tombstone
/// the original.
///
/// # Safety
/// Must run inside a stop-the-world section; `p` must point at a live
/// `ClassLoad` record inside `buffer`.
pub unsafe fn blow_class_load(
    memory: &EventMemory,
    host: &dyn Host,
    ctx: &ThreadContext,
    buffer: &Buffer,
    p: *mut u8,
) {
    unsafe {
        debug_assert_eq!(record_kind(p), Some(RecordKind::ClassLoad));
        let class_ref = get_u64(p.add(CL_CLASS_REF));
        let class_id = get_u32(p.add(CL_CLASS_ID));
        let loader_id = get_u32(p.add(CL_LOADER_ID));
        let flags = record_flags(p);
        let source = resolve_class_load_source(buffer, p);

        let Some(name) = host.class_name(class_ref) else {
            debug_assert!(false, "blowing a class that is already gone");
            error!("class {:#x} vanished before blow; record dropped", class_ref);
            mark_deleted(p);
            return;
        };
        debug!("blow class load {} (id {})", name, class_id);

        let source_len = source.as_ref().map_or(0, Vec::len);
        let size = CLASS_LOAD_BLOWN_FIXED + source_len + name.len();
        if size <= u16::MAX as usize {
            if let Some(blown) = memory.alloc(size, ctx) {
                let b = blown.as_ptr();
                let mut blown_flags = flags & FLAG_HAS_DIGEST;
                if source.is_some() {
                    blown_flags |= FLAG_HAS_SOURCE;
                }
                write_header(b, RecordKind::ClassLoadBlown, blown_flags, size);
                put_u32(b.add(CLB_CLASS_ID), class_id);
                put_u32(b.add(CLB_LOADER_ID), loader_id);
                put_u16(b.add(CLB_SOURCE_LEN), source_len as u16);
                ptr::copy_nonoverlapping(p.add(CL_DIGEST), b.add(CLB_DIGEST), DIGEST_LEN);
                if let Some(src) = &source {
                    ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        b.add(CLASS_LOAD_BLOWN_FIXED),
                        src.len(),
                    );
                }
                ptr::copy_nonoverlapping(
                    name.as_ptr(),
                    b.add(CLASS_LOAD_BLOWN_FIXED + source_len),
                    name.len(),
                );
            }
        }
        mark_deleted(p);
    }
}

/// Append a self-contained copy of a live first-call record, then tombstone
/// the original.
///
/// # Safety
/// As [`blow_class_load`], with `p` pointing at a live `FirstCall` record.
pub unsafe fn blow_first_call(
    memory: &EventMemory,
    host: &dyn Host,
    ctx: &ThreadContext,
    p: *mut u8,
) {
    unsafe {
        debug_assert_eq!(record_kind(p), Some(RecordKind::FirstCall));
        let method_ref = get_u64(p.add(FC_METHOD_REF));
        let holder_id = get_u32(p.add(FC_HOLDER_ID));

        let Some(name) = host.method_name(method_ref) else {
            debug_assert!(false, "blowing a method that is already gone");
            error!("method {:#x} vanished before blow; record dropped", method_ref);
            mark_deleted(p);
            return;
        };

        let size = FIRST_CALL_BLOWN_FIXED + name.len();
        if size <= u16::MAX as usize {
            if let Some(blown) = memory.alloc(size, ctx) {
                let b = blown.as_ptr();
                write_header(b, RecordKind::FirstCallBlown, 0, size);
                put_u32(b.add(FCB_HOLDER_ID), holder_id);
                ptr::copy_nonoverlapping(name.as_ptr(), b.add(FIRST_CALL_BLOWN_FIXED), name.len());
            }
        }
        mark_deleted(p);
    }
}

// ---------------------------------------------------------------------------
// eviction predicates

/// # Safety
/// `p` must point at a live `ClassLoad` record.
pub unsafe fn class_load_references(p: *const u8, class: ClassRef) -> bool {
    unsafe { get_u64(p.add(CL_CLASS_REF)) == class }
}

/// # Safety
/// `p` must point at a live `FirstCall` record.
pub unsafe fn first_call_references_method(p: *const u8, method: MethodRef) -> bool {
    unsafe { get_u64(p.add(FC_METHOD_REF)) == method }
}

// ---------------------------------------------------------------------------
// walking and processing

/// Walk every record in `buffer` in emission order. The visitor may rewrite
/// the record in place (blow) but must not change its size.
pub fn walk_records(buffer: &Buffer, f: &mut dyn FnMut(*mut u8)) {
    let base = buffer.base();
    let end = buffer.pos();
    let mut offset = 0;
    while offset < end {
        // SAFETY: offset < pos, so the header lies in written buffer memory.
        let p = unsafe { base.add(offset) };
        let size = unsafe { record_size(p) };
        debug_assert!(size >= HEADER_SIZE);
        if size == 0 {
            break; // corrupt header, stop rather than loop forever
        }
        f(p);
        offset += align_up(size, RECORD_ALIGN);
    }
}

/// Per-kind record counters gathered while processing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordStats {
    pub count: [usize; RECORD_KIND_COUNT],
    pub bytes: [usize; RECORD_KIND_COUNT],
}

impl RecordStats {
    pub fn merge(&mut self, other: &RecordStats) {
        for i in 0..RECORD_KIND_COUNT {
            self.count[i] += other.count[i];
            self.bytes[i] += other.bytes[i];
        }
    }

    pub fn log(&self) {
        for kind in [
            RecordKind::ClassLoad,
            RecordKind::FirstCall,
            RecordKind::Deleted,
            RecordKind::ClassLoadBlown,
            RecordKind::FirstCallBlown,
        ] {
            let i = kind as usize;
            if self.count[i] > 0 {
                debug!(
                    "record stats: {} x{} ({} bytes)",
                    kind.name(),
                    self.count[i],
                    self.bytes[i]
                );
            }
        }
    }
}

/// Decode and deliver every record of a finished buffer to the agent.
///
/// The buffer's back-reference slot is replayed during the walk so
/// same-source records resolve against the record that preceded them, exactly
/// as at write time. Agent failures are logged and discarded. Deleted records
/// are skipped; their size still participates in the walk.
pub fn process_buffer(buffer: &Buffer, agent: &dyn AgentSink, host: &dyn Host) -> RecordStats {
    let mut stats = RecordStats::default();
    walk_records(buffer, &mut |p| {
        // SAFETY: walk_records only yields record starts within written bytes.
        let kind = unsafe { record_kind(p) };
        let size = unsafe { record_size(p) };
        let Some(kind) = kind else {
            debug_assert!(false, "unknown record kind");
            return;
        };
        stats.count[kind as usize] += 1;
        stats.bytes[kind as usize] += size;
        let outcome = match kind {
            RecordKind::ClassLoad => unsafe { process_class_load(buffer, p, agent, host) },
            RecordKind::FirstCall => unsafe { process_first_call(p, agent, host) },
            RecordKind::ClassLoadBlown => unsafe { process_class_load_blown(p, agent) },
            RecordKind::FirstCallBlown => unsafe { process_first_call_blown(p, agent) },
            RecordKind::Deleted => Ok(()),
        };
        if let Err(e) = outcome {
            debug!("{}", e);
        }
    });
    stats
}

unsafe fn process_class_load(
    buffer: &Buffer,
    p: *mut u8,
    agent: &dyn AgentSink,
    host: &dyn Host,
) -> Result<(), crate::host::AgentError> {
    unsafe {
        let class_ref = get_u64(p.add(CL_CLASS_REF));
        let Some(name) = host.class_name(class_ref) else {
            debug_assert!(false, "processing a class that is already gone");
            error!("class {:#x} vanished unblown; record dropped", class_ref);
            return Ok(());
        };
        let flags = record_flags(p);
        if flags & FLAG_HAS_SOURCE != 0 {
            // later same-source records in this buffer resolve to this one
            let offset = p as usize - buffer.base() as usize;
            buffer.set_reference(BackRefKind::ClassLoad, offset as u32);
        }
        let source = resolve_class_load_source(buffer, p);
        let source = source
            .as_deref()
            .map(String::from_utf8_lossy);
        let digest = (flags & FLAG_HAS_DIGEST != 0)
            .then(|| &*p.add(CL_DIGEST).cast::<[u8; DIGEST_LEN]>());
        agent.notify_class_load(
            &name,
            digest,
            get_u32(p.add(CL_CLASS_ID)),
            get_u32(p.add(CL_LOADER_ID)),
            source.as_deref(),
        )
    }
}

unsafe fn process_first_call(
    p: *mut u8,
    agent: &dyn AgentSink,
    host: &dyn Host,
) -> Result<(), crate::host::AgentError> {
    unsafe {
        let method_ref = get_u64(p.add(FC_METHOD_REF));
        let Some(name) = host.method_name(method_ref) else {
            debug_assert!(false, "processing a method that is already gone");
            error!("method {:#x} vanished unblown; record dropped", method_ref);
            return Ok(());
        };
        agent.notify_first_call(get_u32(p.add(FC_HOLDER_ID)), &name)
    }
}

unsafe fn process_class_load_blown(
    p: *mut u8,
    agent: &dyn AgentSink,
) -> Result<(), crate::host::AgentError> {
    unsafe {
        let size = record_size(p);
        let flags = record_flags(p);
        let source_len = get_u16(p.add(CLB_SOURCE_LEN)) as usize;
        let tail = std::slice::from_raw_parts(
            p.add(CLASS_LOAD_BLOWN_FIXED),
            size - CLASS_LOAD_BLOWN_FIXED,
        );
        let (source, name) = tail.split_at(source_len);
        let source = (flags & FLAG_HAS_SOURCE != 0).then(|| String::from_utf8_lossy(source));
        let digest = (flags & FLAG_HAS_DIGEST != 0)
            .then(|| &*p.add(CLB_DIGEST).cast::<[u8; DIGEST_LEN]>());
        agent.notify_class_load(
            &String::from_utf8_lossy(name),
            digest,
            get_u32(p.add(CLB_CLASS_ID)),
            get_u32(p.add(CLB_LOADER_ID)),
            source.as_deref(),
        )
    }
}

unsafe fn process_first_call_blown(
    p: *mut u8,
    agent: &dyn AgentSink,
) -> Result<(), crate::host::AgentError> {
    unsafe {
        let size = record_size(p);
        let name = std::slice::from_raw_parts(
            p.add(FIRST_CALL_BLOWN_FIXED),
            size - FIRST_CALL_BLOWN_FIXED,
        );
        agent.notify_first_call(
            get_u32(p.add(FCB_HOLDER_ID)),
            &String::from_utf8_lossy(name),
        )
    }
}
