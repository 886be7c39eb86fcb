//! The per-shard ownership arbiter.
//!
//! Each shard (CPU) carries one atomic word packing `(owner_id,
//! evictor_id)`. A thread's `begin` fast path is a single thread-local load;
//! the slow path claims the shard by CAS, evicting any incumbent by patching
//! the incumbent's stubs and then proving the patch visible (usually by
//! observing the scheduler, rarely by the heavy fence).

use core::cell::Cell;
use core::ptr;

use tracing::{debug, instrument};

use crate::code::{RseqLoadFn, RseqStoreFn};
use crate::cpu::{current_cpu, num_cpus};
use crate::cpu_local::CpuLocal;
use crate::err::PanicOnError;
use crate::fence::{asymmetric_thread_fence_heavy, asymmetric_thread_fence_light};
use crate::mutex::Once;
use crate::sync::{fence as atomic_fence, AtomicI32, AtomicPtr, AtomicU64, Ordering};
use crate::thread_control::ThreadControl;
use crate::thread_death;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OwnerAndEvictor {
    owner_id: u32,
    evictor_id: u32,
}

impl OwnerAndEvictor {
    const UNOWNED: OwnerAndEvictor = OwnerAndEvictor { owner_id: 0, evictor_id: 0 };

    fn pack(self) -> u64 {
        (u64::from(self.owner_id) << 32) | u64::from(self.evictor_id)
    }

    fn unpack(repr: u64) -> Self {
        Self {
            owner_id: (repr >> 32) as u32,
            evictor_id: repr as u32,
        }
    }
}

// A bare u64 rather than an atomic two-field struct: the packed integer is
// lock-free by construction, independent of how any particular compiler
// lays out and aligns a struct behind `Atomic*`.
#[derive(Debug, Default)]
struct AtomicOwnerAndEvictor {
    repr: AtomicU64,
}

impl AtomicOwnerAndEvictor {
    fn load(&self) -> OwnerAndEvictor {
        OwnerAndEvictor::unpack(self.repr.load(Ordering::SeqCst))
    }

    fn cas(&self, expected: OwnerAndEvictor, desired: OwnerAndEvictor) -> bool {
        self.repr
            .compare_exchange(
                expected.pack(),
                desired.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

static SHARDS_ONCE: Once = Once::new();
static SHARDS: AtomicPtr<CpuLocal<AtomicOwnerAndEvictor>> = AtomicPtr::new(ptr::null_mut());

// Dying threads release ownership from their death callbacks, so the table
// can never be destroyed; it is leaked once and lives for the process.
fn shards() -> &'static CpuLocal<AtomicOwnerAndEvictor> {
    unsafe { &*SHARDS.load(Ordering::Acquire) }
}

unsafe extern "C" fn load_not_started(_dst: *mut u64, _src: *const u64) -> i32 {
    1
}

unsafe extern "C" fn store_not_started(_dst: *mut u64, _val: u64) -> i32 {
    1
}

thread_local! {
    // Negative: not in an rseq (the fail path and evictors write -1 through
    // the embedded pointer). Non-negative: the shard this thread owns.
    static THREAD_CACHED_CPU: AtomicI32 = const { AtomicI32::new(-1) };
    // The shard named by the most recent slow-path acquisition; `end`
    // releases this shard even after the cached cell has gone negative.
    static LAST_CPU: Cell<i32> = const { Cell::new(0) };
    static RSEQ_ME: Cell<*mut ThreadControl> = const { Cell::new(ptr::null_mut()) };
    // Before the first begin() these deliberately fail instead of faulting.
    static RSEQ_LOAD: Cell<RseqLoadFn> = const { Cell::new(load_not_started as RseqLoadFn) };
    static RSEQ_STORE: Cell<RseqStoreFn> = const { Cell::new(store_not_started as RseqStoreFn) };
    static RSEQ_STORE_FENCE: Cell<RseqStoreFn> =
        const { Cell::new(store_not_started as RseqStoreFn) };
}

fn ensure_my_thread_control_initialized() {
    if !RSEQ_ME.with(|me| me.get()).is_null() {
        return;
    }
    let cached_cpu = THREAD_CACHED_CPU.with(|cell| cell as *const AtomicI32);
    let me = ThreadControl::get(cached_cpu);
    RSEQ_ME.with(|cell| cell.set(me));
    unsafe {
        RSEQ_LOAD.with(|cell| cell.set((*me).rseq_load_fn()));
        RSEQ_STORE.with(|cell| cell.set((*me).rseq_store_fn()));
        RSEQ_STORE_FENCE.with(|cell| cell.set((*me).rseq_store_fence_fn()));
    }
    thread_death::set_rseq_cleanup(|| {
        end();
        // Rseq may be resurrected by another thread-death callback; poison
        // the thread-locals so the next begin() rebuilds everything (the old
        // id, and therefore the old stubs, may belong to someone else by
        // then).
        RSEQ_ME.with(|cell| cell.set(ptr::null_mut()));
        RSEQ_LOAD.with(|cell| cell.set(load_not_started as RseqLoadFn));
        RSEQ_STORE.with(|cell| cell.set(store_not_started as RseqStoreFn));
        RSEQ_STORE_FENCE.with(|cell| cell.set(store_not_started as RseqStoreFn));
    });
    SHARDS_ONCE.call_once(|| {
        SHARDS.store(Box::leak(Box::new(CpuLocal::new())), Ordering::Release);
    });
}

fn acquire_cpu_ownership() -> i32 {
    let me = unsafe { &*RSEQ_ME.with(|cell| cell.get()) };
    loop {
        let cpu = current_cpu();
        LAST_CPU.with(|cell| cell.set(cpu));
        THREAD_CACHED_CPU.with(|cell| cell.store(cpu, Ordering::Relaxed));

        let shard = shards().for_cpu(cpu);
        let observed = shard.load();
        if observed.owner_id == 0 {
            if shard.cas(observed, OwnerAndEvictor { owner_id: me.id(), evictor_id: 0 }) {
                return cpu;
            }
            continue;
        }

        // Pin the incumbent's record before installing ourselves as its
        // evictor; its thread may be dying right now.
        me.accessing().store(observed.owner_id, Ordering::Relaxed);
        let staged = OwnerAndEvictor {
            owner_id: observed.owner_id,
            evictor_id: me.id(),
        };
        if !shard.cas(observed, staged) {
            me.accessing().store(0, Ordering::Relaxed);
            continue;
        }

        let victim = unsafe { &*ThreadControl::for_id(staged.owner_id) };
        debug!(victim = staged.owner_id, cpu, "evicting shard owner");
        victim.block_rseq_ops(); // A

        if cpu != current_cpu() { // B
            me.accessing().store(0, Ordering::Relaxed);
            continue;
        }

        // Why not *always* fence? The blocking stores (A) happened before we
        // re-observed ourselves on `cpu` (B), so every thread scheduled onto
        // `cpu` from here on sees them. If the victim reports `cpu` as its
        // current CPU, it is such a thread: either it already ran here since
        // A (then it CASed the pair on its way out and our CAS below fails,
        // retrying), or it has not run yet and will see the patch when it
        // does. Only a victim observed elsewhere, possibly still mid-op on
        // a stale view, needs the heavy fence. This leans on the kernel's
        // migration ordering; see ThreadControl::cur_cpu.
        if victim.cur_cpu() != cpu {
            asymmetric_thread_fence_heavy();
        }

        me.accessing().store(0, Ordering::Relaxed);

        if shard.cas(staged, OwnerAndEvictor { owner_id: me.id(), evictor_id: 0 }) {
            return cpu;
        }
    }
}

#[instrument(level = "trace")]
fn begin_slow_path() -> i32 {
    let _surface_failures = PanicOnError::new();
    ensure_my_thread_control_initialized();
    end();
    unsafe { &*RSEQ_ME.with(|cell| cell.get()) }.unblock_rseq_ops();
    acquire_cpu_ownership()
}

/// Starts (or continues) an rseq and returns the calling thread's shard
/// index in `[0, num_cpus)`. Any rseq another thread previously ran against
/// the same index is over before this returns.
#[inline]
pub fn begin() -> i32 {
    let cached = THREAD_CACHED_CPU.with(|cell| cell.load(Ordering::SeqCst));
    if cached >= 0 {
        return cached;
    }
    begin_slow_path()
}

/// Ends the calling thread's current rseq, releasing shard ownership.
/// Idempotent, and a no-op on threads that never began one.
///
/// Usually unnecessary (a later `begin` or a failing op settles things),
/// but releasing early speeds up another thread's `begin` on this shard,
/// which pays off just before sleeping or blocking.
pub fn end() {
    THREAD_CACHED_CPU.with(|cell| cell.store(-1, Ordering::Relaxed));
    let me = RSEQ_ME.with(|cell| cell.get());
    if me.is_null() {
        return;
    }
    let my_id = unsafe { (*me).id() };
    let shard = shards().for_cpu(LAST_CPU.with(|cell| cell.get()));
    loop {
        let observed = shard.load();
        if observed.owner_id != my_id {
            break;
        }
        if shard.cas(observed, OwnerAndEvictor::UNOWNED) {
            break;
        }
    }
}

/// Blocks the current owner of `cpu`, if any, without claiming the shard.
fn evict_owner(cpu: i32) {
    let me = unsafe { &*RSEQ_ME.with(|cell| cell.get()) };
    let shard = shards().for_cpu(cpu);
    let observed = shard.load();
    if observed.owner_id == 0 {
        return;
    }

    me.accessing().store(observed.owner_id, Ordering::SeqCst);
    if shard.load().owner_id != observed.owner_id {
        me.accessing().store(0, Ordering::Relaxed);
        return;
    }

    let victim = unsafe { &*ThreadControl::for_id(observed.owner_id) };
    debug!(victim = observed.owner_id, cpu, "blocking shard owner for fence");
    victim.block_rseq_ops();

    me.accessing().store(0, Ordering::Relaxed);
}

/// Inserts a synchronization point into shard `shard`'s rseq ordering,
/// ending any rseq running there. Stores visible to earlier rseqs on the
/// shard are visible to the caller after return; stores visible to the
/// caller before the call are visible to later rseqs on the shard.
#[instrument(level = "trace")]
pub fn fence_with(shard: i32) {
    let _surface_failures = PanicOnError::new();
    atomic_fence(Ordering::SeqCst);
    ensure_my_thread_control_initialized();
    evict_owner(shard);
    asymmetric_thread_fence_heavy();
}

/// Equivalent to, but cheaper than, [fence_with] on every shard: one heavy
/// fence covers all the evictions.
#[instrument(level = "trace")]
pub fn fence() {
    let _surface_failures = PanicOnError::new();
    atomic_fence(Ordering::SeqCst);
    ensure_my_thread_control_initialized();
    for cpu in 0..num_cpus() {
        evict_owner(cpu);
    }
    asymmetric_thread_fence_heavy();
}

/// Returns true iff the rseq most recently started by this thread has not
/// yet ended; equivalently, no other thread's [begin] has returned this
/// thread's shard since. Implemented as a store of 0 to a throwaway slot.
pub fn validate() -> bool {
    let mut dummy: u64 = 0;
    rseq_store_raw(&mut dummy, 0)
}

// The raw trampoline calls under the typed API and the C ABI. The light
// fence matches the heavy one in the eviction path; the indirect call into
// generated code already keeps the compiler from reordering around it.

pub(crate) fn rseq_load_raw(dst: *mut u64, src: *const u64) -> bool {
    let trampoline = RSEQ_LOAD.with(|cell| cell.get());
    let interrupted = unsafe { trampoline(dst, src) };
    asymmetric_thread_fence_light();
    interrupted == 0
}

pub(crate) fn rseq_store_raw(dst: *mut u64, val: u64) -> bool {
    let trampoline = RSEQ_STORE.with(|cell| cell.get());
    let interrupted = unsafe { trampoline(dst, val) };
    asymmetric_thread_fence_light();
    interrupted == 0
}

pub(crate) fn rseq_store_fence_raw(dst: *mut u64, val: u64) -> bool {
    let trampoline = RSEQ_STORE_FENCE.with(|cell| cell.get());
    let interrupted = unsafe { trampoline(dst, val) };
    asymmetric_thread_fence_light();
    interrupted == 0
}
