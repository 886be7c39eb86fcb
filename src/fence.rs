//! The asymmetric fence pair.
//!
//! The light side costs nothing at runtime; the heavy side makes every store
//! sequenced before it visible to all other cores before it returns. Heavy
//! pairs with light: an rseq op (whose indirect call through generated code
//! already stops compiler reordering) never needs a hardware barrier, and
//! the evicting slow path pays for ordering instead.

use core::ptr;

use crate::err::{fatal_error, FatalError};
use crate::mutex::{Mutex, Once};
use crate::os_mem::{self, PAGE_SIZE};
use crate::sync::{compiler_fence, AtomicPtr, AtomicUsize, Ordering};

static FENCE_MU: Mutex<()> = Mutex::new(());
static PAGE_ONCE: Once = Once::new();
static FENCE_PAGE: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());

/// A compiler reorder barrier only.
#[inline]
pub(crate) fn asymmetric_thread_fence_light() {
    compiler_fence(Ordering::SeqCst);
}

/// Forces every other core to observe all stores sequenced before the call.
///
/// Downgrading a dirty page from R+W to R makes the kernel broadcast TLB
/// shootdown interrupts to every other core, and those interrupts double as
/// a full store barrier there. Expect microseconds, not nanoseconds; never
/// call this on a fast path.
pub(crate) fn asymmetric_thread_fence_heavy() {
    PAGE_ONCE.call_once(|| {
        let page = os_mem::allocate(PAGE_SIZE);
        // An unmapped or paged-out page would not trigger the shootdown;
        // pin it. Failure just means a best-effort fence page, like any
        // other resident page.
        unsafe { libc::mlock(page.cast(), PAGE_SIZE) };
        FENCE_PAGE.store(page, Ordering::Release);
    });
    let page = FENCE_PAGE.load(Ordering::Acquire).cast::<libc::c_void>();

    let _guard = FENCE_MU.lock();
    unsafe {
        if libc::mprotect(page, PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            fatal_error(FatalError::MprotectFailed);
        }
        // The page must be dirty, or the downgrade can skip the remote
        // flush.
        (*page.cast::<AtomicUsize>()).fetch_add(1, Ordering::SeqCst);
        if libc::mprotect(page, PAGE_SIZE, libc::PROT_READ) != 0 {
            fatal_error(FatalError::MprotectFailed);
        }
    }
}
