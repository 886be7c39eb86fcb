//! Ordered thread-death callbacks with resurrection support.
//!
//! Cleanup runs in two fixed stages: rseq cleanup (release shard ownership)
//! strictly before thread-control cleanup (unlink and free the record). Both
//! hang off one pthread key destructor. A destructor belonging to *other*
//! user code may touch rseq after ours has run; clearing the scheduled flag
//! before running the stages lets that use fully re-initialize and
//! re-register, bounded by the kernel's destructor iteration limit.
//!
//! The per-thread state lives in const-initialized `Cell`s, which register
//! no destructor of their own and so stay readable for the whole teardown.

use core::cell::Cell;

use crate::err::{fatal_error, FatalError};
use crate::mutex::Once;
use crate::sync::{AtomicU32, Ordering};

thread_local! {
    static CLEAN_UP_RSEQ: Cell<Option<fn()>> = const { Cell::new(None) };
    static CLEAN_UP_THREAD_CONTROL: Cell<Option<fn()>> = const { Cell::new(None) };
    static DESTRUCTOR_SCHEDULED: Cell<bool> = const { Cell::new(false) };
}

static KEY_ONCE: Once = Once::new();
static DEATH_KEY: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" fn run_cleanups(_unused: *mut libc::c_void) {
    DESTRUCTOR_SCHEDULED.with(|flag| flag.set(false));
    if let Some(clean_up) = CLEAN_UP_RSEQ.with(|cell| cell.get()) {
        clean_up();
    }
    if let Some(clean_up) = CLEAN_UP_THREAD_CONTROL.with(|cell| cell.get()) {
        clean_up();
    }
    CLEAN_UP_RSEQ.with(|cell| cell.set(None));
    CLEAN_UP_THREAD_CONTROL.with(|cell| cell.set(None));
}

fn ensure_destructor_scheduled() {
    KEY_ONCE.call_once(|| {
        let mut key: libc::pthread_key_t = 0;
        if unsafe { libc::pthread_key_create(&mut key, Some(run_cleanups)) } != 0 {
            fatal_error(FatalError::ThreadKeyCreateFailed);
        }
        DEATH_KEY.store(key, Ordering::Release);
    });
    if !DESTRUCTOR_SCHEDULED.with(|flag| flag.get()) {
        DESTRUCTOR_SCHEDULED.with(|flag| flag.set(true));
        // The value only exists to make pthread call the destructor.
        unsafe {
            libc::pthread_setspecific(DEATH_KEY.load(Ordering::Acquire), 1 as *const libc::c_void);
        }
    }
}

pub(crate) fn set_rseq_cleanup(clean_up: fn()) {
    CLEAN_UP_RSEQ.with(|cell| cell.set(Some(clean_up)));
    ensure_destructor_scheduled();
}

pub(crate) fn set_thread_control_cleanup(clean_up: fn()) {
    CLEAN_UP_THREAD_CONTROL.with(|cell| cell.set(Some(clean_up)));
    ensure_destructor_scheduled();
}
