//! The C ABI surface.
//!
//! Slots are bare 8-byte words on this side; the typed conversion layer is a
//! Rust-only nicety. Success is 1 and failure 0, so results read as truthy
//! in C. Every entry point pins the abort-on-fatal-error handler: an unwind
//! must never cross into a C caller.

use crate::err::AbortOnError;
use crate::rseq;

/// C entry point for [crate::begin].
#[no_mangle]
pub extern "C" fn rseq_begin() -> i32 {
    let _abort = AbortOnError::new();
    crate::begin()
}

/// C entry point for [crate::end].
#[no_mangle]
pub extern "C" fn rseq_end() {
    let _abort = AbortOnError::new();
    crate::end();
}

/// C entry point for [crate::fence].
#[no_mangle]
pub extern "C" fn rseq_fence() {
    let _abort = AbortOnError::new();
    crate::fence();
}

/// C entry point for [crate::fence_with].
#[no_mangle]
pub extern "C" fn rseq_fence_with(shard: i32) {
    let _abort = AbortOnError::new();
    crate::fence_with(shard);
}

/// Tries `*dst = *src` in the current rseq. Returns 1 on success, 0 if the
/// rseq ended first (in which case `*dst` is untouched).
///
/// # Safety
/// `dst` and `src` must be valid, 8-byte-aligned pointers; `src` must point
/// at a slot only mutated through this API.
#[no_mangle]
pub unsafe extern "C" fn rseq_load(dst: *mut u64, src: *const u64) -> i32 {
    let _abort = AbortOnError::new();
    rseq::rseq_load_raw(dst, src) as i32
}

/// Tries `*dst = val` (release) in the current rseq. Returns 1 on success,
/// 0 if the rseq ended first (no store occurred).
///
/// # Safety
/// `dst` must be a valid, 8-byte-aligned slot pointer.
#[no_mangle]
pub unsafe extern "C" fn rseq_store(dst: *mut u64, val: u64) -> i32 {
    let _abort = AbortOnError::new();
    rseq::rseq_store_raw(dst, val) as i32
}

/// Tries `*dst = val` (sequentially consistent) in the current rseq.
/// Returns 1 on success, 0 if the rseq ended first (no store occurred).
///
/// # Safety
/// `dst` must be a valid, 8-byte-aligned slot pointer.
#[no_mangle]
pub unsafe extern "C" fn rseq_store_fence(dst: *mut u64, val: u64) -> i32 {
    let _abort = AbortOnError::new();
    rseq::rseq_store_fence_raw(dst, val) as i32
}

/// C entry point for [crate::validate]: 1 iff the current rseq is still
/// live.
#[no_mangle]
pub extern "C" fn rseq_validate() -> i32 {
    let _abort = AbortOnError::new();
    crate::validate() as i32
}
