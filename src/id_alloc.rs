use core::fmt;
use core::marker::PhantomData;
use core::mem;

use crate::err::{fatal_error, FatalError};
use crate::mutex::Mutex;
use crate::os_mem;
use crate::sync::{AtomicUsize, Ordering};

/// Ceiling on simultaneously live thread ids, matching the kernel's own
/// thread-count limit. Sizes both the allocator's backing array and the stub
/// arena; the backing memory is committed lazily, so the real footprint
/// tracks the number of threads actually seen.
pub(crate) const MAX_THREAD_IDS: u32 = 1 << 22;

/// Allocates small nonzero integer ids with an O(1) lock-free id-to-owner
/// reverse lookup.
///
/// `allocate` and `free` take a mutex; `lookup_owner` never does. Id 0 is
/// reserved as "null". An id is either on the free list or owned, never
/// both, so a single word per slot serves as free-list link and owner
/// pointer: allocation always prefers the free list and only bumps the
/// high-water mark when it is empty, which also guarantees the
/// smallest-never-allocated id is handed out first.
///
/// `lookup_owner` returns a raw pointer; keeping the pointee alive is the
/// caller's business (the thread records built on top pin each other with
/// the `accessing` protocol before dereferencing).
pub(crate) struct IdAllocator<T> {
    slots: Mutex<FreeSlots>,
    items: *mut AtomicUsize,
    max_elements: u32,
    _owner: PhantomData<*mut T>,
}

struct FreeSlots {
    free_list_head: u32,
    first_untouched_id: u32,
}

unsafe impl<T> Send for IdAllocator<T> {}
unsafe impl<T> Sync for IdAllocator<T> {}

impl<T> IdAllocator<T> {
    /// `max_elements` includes the reserved null id: for `n` usable ids,
    /// pass `n + 1`.
    pub(crate) fn new(max_elements: u32) -> Self {
        let bytes = max_elements as usize * mem::size_of::<AtomicUsize>();
        // mmap returns zeroed memory, which reads as "no owner" for every slot.
        let items = os_mem::allocate(bytes).cast::<AtomicUsize>();
        Self {
            slots: Mutex::new(FreeSlots {
                free_list_head: 0,
                first_untouched_id: 1,
            }),
            items,
            max_elements,
            _owner: PhantomData,
        }
    }

    fn item(&self, id: u32) -> &AtomicUsize {
        debug_assert!(id < self.max_elements);
        unsafe { &*self.items.add(id as usize) }
    }

    pub(crate) fn allocate(&self, owner: *mut T) -> u32 {
        let mut slots = self.slots.lock();
        let id = if slots.free_list_head != 0 {
            let id = slots.free_list_head;
            slots.free_list_head = self.item(id).load(Ordering::Relaxed) as u32;
            id
        } else {
            if slots.first_untouched_id == self.max_elements {
                fatal_error(FatalError::IdSpaceExhausted(self.max_elements));
            }
            let id = slots.first_untouched_id;
            slots.first_untouched_id += 1;
            id
        };
        self.item(id).store(owner as usize, Ordering::Release);
        id
    }

    pub(crate) fn free(&self, id: u32) {
        let mut slots = self.slots.lock();
        self.item(id)
            .store(slots.free_list_head as usize, Ordering::Relaxed);
        slots.free_list_head = id;
    }

    pub(crate) fn lookup_owner(&self, id: u32) -> *mut T {
        self.item(id).load(Ordering::Acquire) as *mut T
    }
}

impl<T> Drop for IdAllocator<T> {
    fn drop(&mut self) {
        let bytes = self.max_elements as usize * mem::size_of::<AtomicUsize>();
        unsafe { os_mem::free(self.items.cast(), bytes) };
    }
}

impl<T> fmt::Debug for IdAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAllocator")
            .field("max_elements", &self.max_elements)
            .finish_non_exhaustive()
    }
}
