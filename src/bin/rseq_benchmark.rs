//! Counter-increment benchmarks pitting restartable sequences against the
//! usual per-CPU and global alternatives.
//!
//! `rseq_benchmark <benchmarks> <num_threads> <increments_per_thread>`,
//! where `<benchmarks>` is `all` or a comma-separated subset; run with no
//! arguments for the full usage text. Each benchmark prints its increment
//! total (validated), wall time, and TSC cycle accounting.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use urseq::{begin, num_cpus, store, CpuLocal, Value};

// Counter rows are padded out to 128 bytes: adjacent-line prefetching makes
// 64-byte spacing not enough to keep cross-CPU traffic off the rows.
#[repr(align(128))]
struct PercpuCounter {
    atomic_counter: AtomicU64,
    rseq_counter: Value<u64>,
    mu: Mutex<()>,
}

impl Default for PercpuCounter {
    fn default() -> Self {
        Self {
            atomic_counter: AtomicU64::new(0),
            rseq_counter: Value::new(0),
            mu: Mutex::new(()),
        }
    }
}

struct BenchState {
    counter_by_cpu: CpuLocal<PercpuCounter>,
    contended_mu: Mutex<()>,
    contended_counter: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Benchmark {
    LongCriticalSection,
    ContendedAtomics,
    ContendedLocks,
    Rseq,
    Atomics,
    AtomicsCachedCpu,
    Locks,
    LocksCachedCpu,
    ThreadLocal,
}

const ALL_BENCHMARKS: [Benchmark; 9] = [
    Benchmark::LongCriticalSection,
    Benchmark::ContendedAtomics,
    Benchmark::ContendedLocks,
    Benchmark::Rseq,
    Benchmark::Atomics,
    Benchmark::AtomicsCachedCpu,
    Benchmark::Locks,
    Benchmark::LocksCachedCpu,
    Benchmark::ThreadLocal,
];

impl Benchmark {
    fn token(self) -> &'static str {
        match self {
            Benchmark::LongCriticalSection => "longCriticalSection",
            Benchmark::ContendedAtomics => "contendedAtomics",
            Benchmark::ContendedLocks => "contendedLocks",
            Benchmark::Rseq => "rseq",
            Benchmark::Atomics => "atomics",
            Benchmark::AtomicsCachedCpu => "atomicsCachedCpu",
            Benchmark::Locks => "locks",
            Benchmark::LocksCachedCpu => "locksCachedCpu",
            Benchmark::ThreadLocal => "threadLocal",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Benchmark::LongCriticalSection => "Long critical section",
            Benchmark::ContendedAtomics => "Contended atomics",
            Benchmark::ContendedLocks => "Contended locks",
            Benchmark::Rseq => "Per-cpu restartable sequences",
            Benchmark::Atomics => "Per-cpu atomics",
            Benchmark::AtomicsCachedCpu => "Per-cpu atomics (with cached getcpu calls)",
            Benchmark::Locks => "Per-cpu locks",
            Benchmark::LocksCachedCpu => "Per-cpu locks (with cached getcpu calls)",
            Benchmark::ThreadLocal => "Thread-local operations only (no sharing)",
        }
    }
}

fn do_increments_long_critical_section(state: &BenchState, num_increments: u64) {
    let _guard = state.contended_mu.lock().unwrap();
    for _ in 0..num_increments {
        let observed = state.contended_counter.load(Ordering::Relaxed);
        state.contended_counter.store(observed + 1, Ordering::Relaxed);
    }
}

fn do_increments_contended_atomics(state: &BenchState, num_increments: u64) {
    for _ in 0..num_increments {
        let mut old = state.contended_counter.load(Ordering::SeqCst);
        while let Err(actual) = state.contended_counter.compare_exchange_weak(
            old,
            old + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            old = actual;
        }
    }
}

fn do_increments_contended_locks(state: &BenchState, num_increments: u64) {
    for _ in 0..num_increments {
        let _guard = state.contended_mu.lock().unwrap();
        let observed = state.contended_counter.load(Ordering::Relaxed);
        state.contended_counter.store(observed + 1, Ordering::Relaxed);
    }
}

fn do_increments_rseq(state: &BenchState, num_increments: u64) {
    for _ in 0..num_increments {
        loop {
            let cpu = begin();
            let counter = &state.counter_by_cpu.for_cpu(cpu).rseq_counter;
            let observed = counter.load(Ordering::Relaxed);
            if store(counter, observed + 1) {
                break;
            }
        }
    }
}

fn do_increments_atomics(state: &BenchState, num_increments: u64) {
    for _ in 0..num_increments {
        loop {
            let cpu = current_cpu();
            let counter = &state.counter_by_cpu.for_cpu(cpu).atomic_counter;
            let old = counter.load(Ordering::SeqCst);
            if counter
                .compare_exchange_weak(old, old + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }
}

fn do_increments_atomics_cached_cpu(state: &BenchState, num_increments: u64) {
    let mut done = 0;
    while done < num_increments {
        let cpu = current_cpu();
        let counter = &state.counter_by_cpu.for_cpu(cpu).atomic_counter;
        for _ in 0..100 {
            if done == num_increments {
                break;
            }
            let old = counter.load(Ordering::SeqCst);
            if counter
                .compare_exchange_weak(old, old + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
            done += 1;
        }
    }
}

fn do_increments_locks(state: &BenchState, num_increments: u64) {
    for _ in 0..num_increments {
        let cpu = current_cpu();
        let row = state.counter_by_cpu.for_cpu(cpu);
        let _guard = row.mu.lock().unwrap();
        let observed = row.atomic_counter.load(Ordering::Relaxed);
        row.atomic_counter.store(observed + 1, Ordering::Relaxed);
    }
}

fn do_increments_locks_cached_cpu(state: &BenchState, num_increments: u64) {
    let mut done = 0;
    while done < num_increments {
        let cpu = current_cpu();
        let row = state.counter_by_cpu.for_cpu(cpu);
        for _ in 0..100 {
            if done == num_increments {
                break;
            }
            let _guard = row.mu.lock().unwrap();
            let observed = row.atomic_counter.load(Ordering::Relaxed);
            row.atomic_counter.store(observed + 1, Ordering::Relaxed);
            done += 1;
        }
    }
}

fn do_increments_thread_local(state: &BenchState, num_increments: u64) {
    let mut counter: u64 = 0;
    for _ in 0..num_increments {
        // black_box keeps this an actual load-add-store per iteration.
        counter = std::hint::black_box(counter) + 1;
    }
    state
        .counter_by_cpu
        .for_cpu(0)
        .atomic_counter
        .fetch_add(counter, Ordering::SeqCst);
}

fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

fn rdtscp() -> u64 {
    let mut aux: u32 = 0;
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) }
}

fn run_benchmark(benchmark: Benchmark, num_threads: u64, num_increments: u64) {
    let state = BenchState {
        counter_by_cpu: CpuLocal::new(),
        contended_mu: Mutex::new(()),
        contended_counter: AtomicU64::new(0),
    };
    let thread_func: fn(&BenchState, u64) = match benchmark {
        Benchmark::LongCriticalSection => do_increments_long_critical_section,
        Benchmark::ContendedAtomics => do_increments_contended_atomics,
        Benchmark::ContendedLocks => do_increments_contended_locks,
        Benchmark::Rseq => do_increments_rseq,
        Benchmark::Atomics => do_increments_atomics,
        Benchmark::AtomicsCachedCpu => do_increments_atomics_cached_cpu,
        Benchmark::Locks => do_increments_locks,
        Benchmark::LocksCachedCpu => do_increments_locks_cached_cpu,
        Benchmark::ThreadLocal => do_increments_thread_local,
    };

    println!("===========================================================");
    println!("Benchmarking {}", benchmark.description());
    let begin_time = Instant::now();
    let begin_cycles = rdtscp();
    thread::scope(|scope| {
        for _ in 0..num_threads {
            scope.spawn(|| thread_func(&state, num_increments));
        }
    });
    let end_cycles = rdtscp();
    let elapsed = begin_time.elapsed();

    let expected_increments = num_threads * num_increments;
    let mut actual_increments = state.contended_counter.load(Ordering::SeqCst);
    for cpu in 0..num_cpus() {
        let row = state.counter_by_cpu.for_cpu(cpu);
        actual_increments += row.atomic_counter.load(Ordering::SeqCst);
        actual_increments += row.rseq_counter.load(Ordering::SeqCst);
    }
    if actual_increments != expected_increments {
        println!(
            "Error: actual increment count {actual_increments} does not match \
             expected increment count {expected_increments}."
        );
    }

    let cycles = end_cycles - begin_cycles;
    let cycles_per_increment = cycles as f64 / actual_increments as f64;
    println!("Increments: {actual_increments}");
    println!("Seconds: {:.6}", elapsed.as_secs_f64());
    println!("TSC ticks: {cycles}");
    println!("Single-CPU TSC ticks per increment: {cycles_per_increment:.6}");
    println!(
        "Global TSC ticks per increment: {:.6}",
        num_cpus() as f64 * cycles_per_increment
    );
    println!("===========================================================");
}

const USAGE: &str = "\
Usage: rseq_benchmark benchmarks num_threads increments_per_thread
  Where 'benchmarks' is either 'all', or a comma-separated list containing
  the benchmarks to run:
    longCriticalSection:  Each thread acquires a single shared lock, does all
                          its increments, and releases the lock.

    contendedAtomics:     Each thread updates a global counter with a CAS.

    contendedLocks:       Each thread acquires and releases a global lock per
                          counter increment.

    rseq:                 Threads increment cpu-local counters using
                          restartable sequences.

    atomics:              Threads increment cpu-local counters using CASs.

    atomicsCachedCpu:     Threads increment cpu-local counters using CASs, but
                          only look up their cpu once every 100 increments (or
                          until contention is detected).

    locks:                Threads increment cpu-local counters, protecting
                          their increments with locks.

    locksCachedCpu:       Threads increment cpu-local counters, protecting
                          their increments with locks, but only look up their
                          cpu once every 100 increments.

    threadLocal:          Threads increment thread-local counters, with no
                          synchronization.
";

fn parse_benchmarks(list: &str) -> Vec<Benchmark> {
    if list == "all" {
        return ALL_BENCHMARKS.to_vec();
    }
    list.split(',')
        .map(|token| {
            ALL_BENCHMARKS
                .into_iter()
                .find(|benchmark| benchmark.token() == token)
                .unwrap_or_else(|| {
                    println!("Error: unknown benchmark type \"{token}\"");
                    process::exit(1);
                })
        })
        .collect()
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        print!("{USAGE}");
        process::exit(1);
    }

    let benchmarks = parse_benchmarks(&args[1]);
    let num_threads: u64 = args[2].parse().unwrap_or(0);
    let num_increments: u64 = args[3].parse().unwrap_or(0);
    if num_threads == 0 || num_increments == 0 {
        println!("Error: invalid value for threads or increments");
        process::exit(1);
    }

    for benchmark in benchmarks {
        run_benchmark(benchmark, num_threads, num_increments);
    }
}
