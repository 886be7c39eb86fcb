use core::fmt;
use core::mem;
use core::ptr;

use crate::cache_padded::CachePadded;
use crate::cpu::num_cpus;
use crate::os_mem;

/// A fixed array of one `T` per online CPU, each on its own cache line and
/// addressable by shard index.
///
/// Slots are backed by anonymous pages rather than the heap so the
/// process-lifetime singletons built on this type never interact with the
/// allocator. Construction default-initializes every slot.
pub struct CpuLocal<T> {
    elements: *mut CachePadded<T>,
}

unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Sync> Sync for CpuLocal<T> {}

impl<T: Default> CpuLocal<T> {
    /// Allocates and default-initializes one padded slot per CPU.
    pub fn new() -> Self {
        let count = num_cpus() as usize;
        let bytes = count * mem::size_of::<CachePadded<T>>();
        let elements = os_mem::allocate(bytes).cast::<CachePadded<T>>();
        for i in 0..count {
            unsafe { ptr::write(elements.add(i), CachePadded::new(T::default())) };
        }
        Self { elements }
    }
}

impl<T: Default> Default for CpuLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CpuLocal<T> {
    /// The slot for shard `cpu`.
    pub fn for_cpu(&self, cpu: i32) -> &T {
        debug_assert!(cpu >= 0 && cpu < num_cpus());
        unsafe { &*self.elements.add(cpu as usize) }
    }
}

impl<T> Drop for CpuLocal<T> {
    fn drop(&mut self) {
        let count = num_cpus() as usize;
        for i in 0..count {
            unsafe { ptr::drop_in_place(self.elements.add(i)) };
        }
        let bytes = count * mem::size_of::<CachePadded<T>>();
        unsafe { os_mem::free(self.elements.cast(), bytes) };
    }
}

impl<T> fmt::Debug for CpuLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuLocal").finish_non_exhaustive()
    }
}
