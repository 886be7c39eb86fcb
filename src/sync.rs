pub(crate) use std::sync::atomic::{
    compiler_fence, fence, AtomicBool, AtomicI32, AtomicPtr, AtomicU16, AtomicU32, AtomicU64,
    AtomicUsize, Ordering,
};
