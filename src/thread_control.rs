//! Per-thread records and the global registry.
//!
//! Every thread that touches an rseq gets exactly one record, linked into a
//! doubly linked registry under a mutex and reachable lock-free by id. Other
//! threads may only dereference a record while their own record's
//! `accessing` cell names its id; a dying thread drains those references
//! before freeing anything.

use core::ptr;
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::code::{Code, RseqLoadFn, RseqStoreFn};
use crate::id_alloc::{IdAllocator, MAX_THREAD_IDS};
use crate::mutex::{Mutex, Once};
use crate::sync::{AtomicI32, AtomicPtr, AtomicU32, Ordering};
use crate::thread_death;

static ID_ALLOCATOR_ONCE: Once = Once::new();
static ID_ALLOCATOR: AtomicPtr<IdAllocator<ThreadControl>> = AtomicPtr::new(ptr::null_mut());

// Dying threads consult the allocator after arbitrary other teardown has
// run, so the singleton is leaked rather than ever destroyed.
fn id_allocator() -> &'static IdAllocator<ThreadControl> {
    ID_ALLOCATOR_ONCE.call_once(|| {
        let allocator = Box::leak(Box::new(IdAllocator::new(MAX_THREAD_IDS)));
        ID_ALLOCATOR.store(allocator, Ordering::Release);
    });
    unsafe { &*ID_ALLOCATOR.load(Ordering::Acquire) }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry { head: ptr::null_mut() });

struct Registry {
    head: *mut ThreadControl,
}

unsafe impl Send for Registry {}

impl Registry {
    unsafe fn link(&mut self, record: *mut ThreadControl) {
        (*record).prev = ptr::null_mut();
        (*record).next = self.head;
        if !self.head.is_null() {
            (*self.head).prev = record;
        }
        self.head = record;
    }

    unsafe fn unlink(&mut self, record: *mut ThreadControl) {
        if (*record).prev.is_null() {
            self.head = (*record).next;
        } else {
            (*(*record).prev).next = (*record).next;
        }
        if !(*record).next.is_null() {
            (*(*record).next).prev = (*record).prev;
        }
    }

    unsafe fn is_accessed_by_any(&self, id: u32) -> bool {
        let mut record = self.head;
        while !record.is_null() {
            if (*record).accessing.load(Ordering::SeqCst) == id {
                return true;
            }
            record = (*record).next;
        }
        false
    }
}

thread_local! {
    static ME: core::cell::Cell<*mut ThreadControl> =
        const { core::cell::Cell::new(ptr::null_mut()) };
}

pub(crate) struct ThreadControl {
    code: *mut Code,
    tid: libc::pid_t,
    id: u32,
    thread_cached_cpu: *const AtomicI32,
    accessing: AtomicU32,
    next: *mut ThreadControl,
    prev: *mut ThreadControl,
}

impl ThreadControl {
    /// The calling thread's record, created and registered on first use.
    /// `thread_cached_cpu` must point at this thread's cached-CPU cell.
    pub(crate) fn get(thread_cached_cpu: *const AtomicI32) -> *mut ThreadControl {
        let existing = ME.with(|me| me.get());
        if !existing.is_null() {
            return existing;
        }

        let record = Box::into_raw(Box::new(ThreadControl {
            code: ptr::null_mut(),
            tid: unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t },
            id: 0,
            thread_cached_cpu,
            accessing: AtomicU32::new(0),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }));
        unsafe {
            (*record).id = id_allocator().allocate(record);
            (*record).code = Code::init_for_id((*record).id, thread_cached_cpu);
            let mut registry = REGISTRY.lock();
            registry.link(record);
        }
        ME.with(|me| me.set(record));
        thread_death::set_thread_control_cleanup(|| {
            // Clearing ME before tearing down lets a record rebuilt during
            // thread death know it must reinitialize.
            let record = ME.with(|me| me.replace(ptr::null_mut()));
            unsafe { ThreadControl::release(record) };
        });
        record
    }

    /// The record owning `id`. The returned pointer is only safe to
    /// dereference while the caller's `accessing` cell names `id` (or while
    /// `id` is this thread's own).
    pub(crate) fn for_id(id: u32) -> *mut ThreadControl {
        id_allocator().lookup_owner(id)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn accessing(&self) -> &AtomicU32 {
        &self.accessing
    }

    pub(crate) fn rseq_load_fn(&self) -> RseqLoadFn {
        unsafe { &*self.code }.rseq_load_fn()
    }

    pub(crate) fn rseq_store_fn(&self) -> RseqStoreFn {
        unsafe { &*self.code }.rseq_store_fn()
    }

    pub(crate) fn rseq_store_fence_fn(&self) -> RseqStoreFn {
        unsafe { &*self.code }.rseq_store_fence_fn()
    }

    /// Makes every future rseq op of this thread fail, by patching its stubs
    /// and writing the eviction sentinel into its cached-CPU cell. No
    /// ordering of its own; callers make the patch visible via hardware
    /// instruction-fetch coherence plus, when needed, the heavy fence.
    pub(crate) fn block_rseq_ops(&self) {
        unsafe { &*self.thread_cached_cpu }.store(-1, Ordering::Relaxed);
        unsafe { &*self.code }.block_rseq_ops();
    }

    /// Re-arms this thread's own stubs. The cached-CPU cell is rewritten by
    /// the slow path at the point it queries the OS, not here.
    pub(crate) fn unblock_rseq_ops(&self) {
        unsafe { &*self.code }.unblock_rseq_ops();
    }

    /// Best-effort: the CPU this record's thread is running on (or will next
    /// run on), or -1. One ordering guarantee rides on the kernel's
    /// migration handling: if a thread observes itself on CPU n and then
    /// observes another thread on CPU n through this function, the effect is
    /// that of a heavy fence pairing with a light fence in the other thread.
    pub(crate) fn cur_cpu(&self) -> i32 {
        // "/proc/self/task/" + at most 10 tid digits + "/stat" + NUL fits in
        // 32 bytes. snprintf has allocating paths, so format by hand.
        let mut filename = [0u8; 32];
        let mut len = 0;
        for &byte in b"/proc/self/task/" {
            filename[len] = byte;
            len += 1;
        }
        len += format_decimal(self.tid as u64, &mut filename[len..]);
        for &byte in b"/stat" {
            filename[len] = byte;
            len += 1;
        }

        let fd = unsafe { libc::open(filename.as_ptr().cast(), libc::O_RDONLY) };
        if fd == -1 {
            return -1;
        }
        // A single read keeps the snapshot atomic; every field we skip is
        // bounded, so 1024 bytes always covers through the processor field.
        let mut contents = [0u8; 1024];
        let mut length: isize = -1;
        for _ in 0..10 {
            length = unsafe { libc::read(fd, contents.as_mut_ptr().cast(), contents.len()) };
            if length >= 0 {
                break;
            }
        }
        unsafe { libc::close(fd) };
        if length < 0 {
            return -1;
        }
        parse_cpu_from_stat(&contents[..length as usize]).unwrap_or(-1)
    }

    /// Unlinks, waits out every evictor that still names this id, then frees
    /// the id and the record. Runs in the owning thread's death callback.
    unsafe fn release(record: *mut ThreadControl) {
        {
            let mut registry = REGISTRY.lock();
            registry.unlink(record);
        }
        let id = (*record).id;
        let mut num_yields = 0;
        loop {
            let being_accessed = {
                let registry = REGISTRY.lock();
                registry.is_accessed_by_any(id)
            };
            if !being_accessed {
                break;
            }
            // Evictors hold the reference for microseconds; be polite first,
            // then stop burning the CPU they might need.
            if num_yields < 100 {
                num_yields += 1;
                thread::yield_now();
            } else {
                trace!(id, "thread-death rendezvous still pinned, sleeping");
                thread::sleep(Duration::from_secs(1));
            }
        }
        id_allocator().free(id);
        drop(Box::from_raw(record));
    }
}

/// Writes `value` in decimal into `out`, returning the number of bytes.
fn format_decimal(value: u64, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 20];
    let mut remaining = value;
    let mut count = 0;
    if remaining == 0 {
        digits[0] = b'0';
        count = 1;
    }
    while remaining != 0 {
        digits[count] = b'0' + (remaining % 10) as u8;
        remaining /= 10;
        count += 1;
    }
    for i in 0..count {
        out[i] = digits[count - 1 - i];
    }
    count
}

/// Extracts the processor field (39th) from a stat line. The comm field may
/// itself contain spaces and parens, so counting starts after the last `)`:
/// 37 separators remain before the processor field.
fn parse_cpu_from_stat(contents: &[u8]) -> Option<i32> {
    const SPACES_AFTER_COMM: usize = 37;

    let last_rparen = contents.iter().rposition(|&byte| byte == b')')?;
    let mut pos = last_rparen + 1;
    let mut spaces = 0;
    while pos < contents.len() && spaces < SPACES_AFTER_COMM {
        if contents[pos] == b' ' {
            spaces += 1;
        }
        pos += 1;
    }
    if spaces < SPACES_AFTER_COMM {
        return None;
    }
    let mut cpu: i32 = 0;
    let mut any_digits = false;
    while pos < contents.len() {
        match contents[pos] {
            b' ' => return any_digits.then_some(cpu),
            digit @ b'0'..=b'9' => {
                cpu = cpu * 10 + (digit - b'0') as i32;
                any_digits = true;
            }
            _ => return None,
        }
        pos += 1;
    }
    None
}
