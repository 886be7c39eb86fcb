use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr;

use crate::rseq;
use crate::sync::{AtomicU64, Ordering};

/// An 8-byte slot holding a `T`, usable both as an ordinary atomic and as
/// the target of the rseq-protected [load]/[store]/[store_fence].
///
/// `T` must be `Copy` and at most 8 bytes; both checks are compile-time.
/// Conversion between `T` and the slot word copies bytes (no aliasing
/// games), so any bit pattern of `T` round-trips exactly.
pub struct Value<T> {
    repr: AtomicU64,
    _item: PhantomData<T>,
}

impl<T: Copy> Value<T> {
    const FITS_IN_SLOT: () = assert!(
        mem::size_of::<T>() <= 8,
        "Value<T> requires sizeof(T) <= 8",
    );

    /// A slot initially holding `item`.
    pub fn new(item: T) -> Self {
        Self {
            repr: AtomicU64::new(Self::to_repr(item)),
            _item: PhantomData,
        }
    }

    /// Plain atomic load.
    pub fn load(&self, order: Ordering) -> T {
        Self::from_repr(self.repr.load(order))
    }

    /// Plain atomic store.
    pub fn store(&self, item: T, order: Ordering) {
        self.repr.store(Self::to_repr(item), order);
    }

    /// Plain atomic exchange.
    pub fn exchange(&self, item: T, order: Ordering) -> T {
        Self::from_repr(self.repr.swap(Self::to_repr(item), order))
    }

    /// Plain atomic compare-exchange on the slot's byte representation.
    pub fn compare_exchange(
        &self,
        current: T,
        new: T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<T, T> {
        self.repr
            .compare_exchange(Self::to_repr(current), Self::to_repr(new), success, failure)
            .map(Self::from_repr)
            .map_err(Self::from_repr)
    }

    /// Weak flavor of [Self::compare_exchange]; may fail spuriously.
    pub fn compare_exchange_weak(
        &self,
        current: T,
        new: T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<T, T> {
        self.repr
            .compare_exchange_weak(Self::to_repr(current), Self::to_repr(new), success, failure)
            .map(Self::from_repr)
            .map_err(Self::from_repr)
    }

    pub(crate) fn raw(&self) -> *mut u64 {
        self.repr.as_ptr()
    }

    pub(crate) fn to_repr(item: T) -> u64 {
        let _ = Self::FITS_IN_SLOT;
        let mut repr: u64 = 0;
        unsafe {
            ptr::copy_nonoverlapping(
                (&item as *const T).cast::<u8>(),
                (&mut repr as *mut u64).cast::<u8>(),
                mem::size_of::<T>(),
            );
        }
        repr
    }

    pub(crate) fn from_repr(repr: u64) -> T {
        let _ = Self::FITS_IN_SLOT;
        let mut item = MaybeUninit::<T>::uninit();
        unsafe {
            ptr::copy_nonoverlapping(
                (&repr as *const u64).cast::<u8>(),
                item.as_mut_ptr().cast::<u8>(),
                mem::size_of::<T>(),
            );
            item.assume_init()
        }
    }
}

impl<T: Copy + Default> Default for Value<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&self.load(Ordering::Relaxed)).finish()
    }
}

/// Tries to do `*dst = src` within the rseq last started by this thread,
/// with acquire semantics.
///
/// `true`: the value was read coherently and the rseq was still live when
/// the read completed (the store into `dst` itself may land later). `false`:
/// the rseq ended before the call; `dst` is untouched. Call [crate::begin]
/// first; without it this fails.
///
/// Slightly slower than [Value::load]; prefer that unless the load being
/// inside the rseq is load-bearing, e.g. when chasing pointers through
/// memory that may be freed once the rseq ends.
pub fn load<T: Copy>(dst: &mut T, src: &Value<T>) -> bool {
    let mut repr: u64 = 0;
    if !rseq::rseq_load_raw(&mut repr, src.raw()) {
        return false;
    }
    *dst = Value::<T>::from_repr(repr);
    true
}

/// Tries to do `*dst = val` within the rseq last started by this thread,
/// with release semantics.
///
/// `true`: the store happened and the rseq was still live at that point.
/// `false`: the rseq ended before the call and no store occurred. Call
/// [crate::begin] first; without it this fails.
pub fn store<T: Copy>(dst: &Value<T>, val: T) -> bool {
    rseq::rseq_store_raw(dst.raw(), Value::<T>::to_repr(val))
}

/// [store], but sequentially consistent (the stub publishes via exchange).
pub fn store_fence<T: Copy>(dst: &Value<T>, val: T) -> bool {
    rseq::rseq_store_fence_raw(dst.raw(), Value::<T>::to_repr(val))
}
