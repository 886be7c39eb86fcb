use core::mem;

use crate::err::{fatal_error, FatalError};
use crate::mutex::Once;
use crate::sync::{AtomicI32, Ordering};

static NUM_CPUS_ONCE: Once = Once::new();
static NUM_CPUS: AtomicI32 = AtomicI32::new(0);

/// The number of online CPUs, i.e. the number of shards.
///
/// `std::thread::available_parallelism` respects affinity masks and cgroup
/// quotas, which is exactly wrong for sizing per-CPU tables; this caches the
/// raw online-processor count instead.
pub fn num_cpus() -> i32 {
    NUM_CPUS_ONCE.call_once(|| {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        NUM_CPUS.store(count as i32, Ordering::Relaxed);
    });
    NUM_CPUS.load(Ordering::Relaxed)
}

/// The CPU the calling thread is running on right now (stale the moment it
/// returns).
pub(crate) fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

/// Pins the calling thread to `cpu`. Intended for tests and benchmarks that
/// need deterministic shard placement; fatal if the kernel refuses.
pub fn switch_to_cpu(cpu: i32) {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(tid, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            fatal_error(FatalError::SetAffinityFailed(cpu));
        }
    }
}
