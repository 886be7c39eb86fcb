//! # urseq
//!
//! A userspace take on the kernel restartable-sequences API. Threads update
//! per-CPU sharded data with plain (non-atomic) loads and stores at close to
//! thread-local cost, while each shard stays serializable: an rseq-load or
//! rseq-store either executes, or fails atomically because another thread
//! has since claimed the same shard.
//!
//! # Usage
//! ## Example
//! A per-CPU fetch-and-increment, with no atomic read-modify-write on the
//! common path:
//! ```no_run
//! use urseq::{begin, store, CpuLocal, Value};
//!
//! let counters: CpuLocal<Value<u64>> = CpuLocal::new();
//!
//! fn increment(counters: &CpuLocal<Value<u64>>) -> u64 {
//!     loop {
//!         let shard = begin();
//!         let counter = counters.for_cpu(shard);
//!         let cur = counter.load(std::sync::atomic::Ordering::Relaxed);
//!         if store(counter, cur + 1) {
//!             return cur;
//!         }
//!     }
//! }
//!
//! increment(&counters);
//! ```
//!
//! ## Details
//! [begin] returns a shard index in `[0, num_cpus)`. The rseq it starts
//! lasts for an unspecified amount of time; it ends no later than the point
//! at which another thread's [begin] returns the same shard. Within the
//! rseq, [load], [store] and [store_fence] against [Value] slots succeed or
//! report failure with no side effect on the target; a `false` return means
//! the rseq ended before the op, and the caller should re-enter [begin] and
//! retry. Reads done inside an rseq are only known consistent if the rseq
//! is observed still live afterwards ([validate], or any successful store),
//! so the semantics are seqlock-like: readers validate, writers retry.
//!
//! [fence_with] inserts a synchronization point into one shard's rseq
//! ordering, [fence] into every shard's. Stores visible to earlier rseqs on
//! the shard are visible to the caller after return; stores visible to the
//! caller before the call are visible to later rseqs on the shard.
//!
//! When chasing pointers inside an rseq the pointed-to memory may already
//! be freed; compute field addresses with [member_addr!]/[member_addr_mut!]
//! (which never dereference their operand) and read them through [load].
//!
//! # Caveats
//! 1. x86-64 Linux only. The fast paths lean on TSO, the eviction protocol
//!    on instruction-fetch coherence, and the heavy fence on mprotect TLB
//!    shootdowns; the crate refuses to build elsewhere.
//! 2. Slot payloads are at most 8 bytes.
//! 3. The slow path may block for microseconds (at most about once per
//!    scheduling quantum): the heavy fence waits for cross-CPU interrupts.
#![warn(missing_debug_implementations, missing_docs)]

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("urseq requires x86-64 Linux (TSO, mprotect IPIs, futex)");

mod cache_padded;
mod code;
mod cpu;
mod cpu_local;
mod err;
mod fence;
mod ffi;
mod id_alloc;
#[doc(hidden)]
pub mod member_addr;
mod mutex;
mod os_mem;
mod rseq;
mod sync;
mod thread_control;
mod thread_death;
mod value;

pub use cache_padded::CachePadded;
pub use cpu::{num_cpus, switch_to_cpu};
pub use cpu_local::CpuLocal;
pub use err::{
    fatal_error_handler, set_fatal_error_handler, AbortOnError, FatalError, FatalErrorHandler,
    PanicOnError,
};
pub use ffi::{
    rseq_begin, rseq_end, rseq_fence, rseq_fence_with, rseq_load, rseq_store, rseq_store_fence,
    rseq_validate,
};
pub use rseq::{begin, end, fence, fence_with, validate};
pub use value::{load, store, store_fence, Value};
