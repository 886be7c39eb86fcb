//! Per-thread generated code for the rseq ops.
//!
//! Each live thread id owns a 64-byte executable slot holding three tiny
//! functions (load, store, store-fence) and a shared failure tail. Evicting
//! a thread overwrites the first two bytes of each op with a short jump to
//! the tail, which stores `-1` into the owning thread's cached-CPU cell and
//! returns failure. Op entries sit at even offsets inside a 64-aligned
//! slot, so every patch is a single aligned 16-bit store.

use core::mem;
use core::ptr;

use crate::cache_padded::CachePadded;
use crate::id_alloc::MAX_THREAD_IDS;
use crate::mutex::Once;
use crate::os_mem;
use crate::sync::{AtomicI32, AtomicPtr, AtomicU16, Ordering};

/// Returns 0 on success, 1 if the rseq was interrupted. Prototype
/// `(dst, src)`, i.e. `*dst = *src`.
pub(crate) type RseqLoadFn = unsafe extern "C" fn(*mut u64, *const u64) -> i32;
/// Returns 0 on success, 1 if the rseq was interrupted. Prototype
/// `(dst, val)`, i.e. `*dst = val`.
pub(crate) type RseqStoreFn = unsafe extern "C" fn(*mut u64, u64) -> i32;

const CODE_TEMPLATE: [u8; 54] = [
    // 8-byte load, int (*)(u64* dst, u64* src):
    //                        mov (%rsi), %rax
    /* offset  0: */ 0x48, 0x8b, 0x06,
    //                        mov %rax, (%rdi)
    /* offset  3: */ 0x48, 0x89, 0x07,
    //                        xor %eax, %eax        (return success, 0)
    /* offset  6: */ 0x31, 0xc0,
    //                        retq
    /* offset  8: */ 0xc3,
    /* offset  9: */ 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    //
    // 8-byte store, int (*)(u64* dst, u64 val):
    //                        mov %rsi, (%rdi)
    /* offset 16: */ 0x48, 0x89, 0x37,
    /* offset 19: */ 0x31, 0xc0,
    /* offset 21: */ 0xc3,
    /* offset 22: */ 0x00, 0x00,
    //
    // 8-byte store-fence, int (*)(u64* dst, u64 val); the exchange makes the
    // publication sequentially consistent:
    //                        xchg %rsi, (%rdi)
    /* offset 24: */ 0x48, 0x87, 0x37,
    /* offset 27: */ 0x31, 0xc0,
    /* offset 29: */ 0xc3,
    /* offset 30: */ 0x00, 0x00,
    //
    // Shared failure tail. Blocking an op patches its first instruction into
    // a jump to here. Stores -1 into the owning thread's cached-CPU cell
    // (the 0x42 placeholder is overwritten with the cell address at init)
    // and returns 1.
    //                        movabs $cell, %rax
    /* offset 32: */ 0x48, 0xb8,
    /* offset 34: */ 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42,
    //                        movl $-1, (%rax)
    /* offset 42: */ 0xc7, 0x00, 0xff, 0xff, 0xff, 0xff,
    //                        mov $1, %eax
    /* offset 48: */ 0xb8, 0x01, 0x00, 0x00, 0x00,
    //                        retq
    /* offset 53: */ 0xc3,
];

const LOAD_OFFSET: usize = 0;
const STORE_OFFSET: usize = 16;
const STORE_FENCE_OFFSET: usize = 24;
const FAIL_PATH_OFFSET: usize = 32;
const CACHED_CPU_ADDR_OFFSET: usize = 34;

const JMP_INSTRUCTION_SIZE: usize = 2;
const JMP_OPCODE: u16 = 0xeb;

// jmp rel8: opcode in the low byte, displacement from the following
// instruction in the high byte.
const LOAD_BLOCKED: u16 =
    JMP_OPCODE | (((FAIL_PATH_OFFSET - LOAD_OFFSET - JMP_INSTRUCTION_SIZE) as u16) << 8);
const STORE_BLOCKED: u16 =
    JMP_OPCODE | (((FAIL_PATH_OFFSET - STORE_OFFSET - JMP_INSTRUCTION_SIZE) as u16) << 8);
const STORE_FENCE_BLOCKED: u16 =
    JMP_OPCODE | (((FAIL_PATH_OFFSET - STORE_FENCE_OFFSET - JMP_INSTRUCTION_SIZE) as u16) << 8);

// First two template bytes of each op, restored on unblock.
const LOAD_UNBLOCKED: u16 = 0x8b48;
const STORE_UNBLOCKED: u16 = 0x8948;
const STORE_FENCE_UNBLOCKED: u16 = 0x8748;

/// One thread id's stub slot.
#[repr(C)]
pub(crate) struct Code {
    bytes: [u8; CODE_TEMPLATE.len()],
}

static ARENA_ONCE: Once = Once::new();
static ARENA: AtomicPtr<CachePadded<Code>> = AtomicPtr::new(ptr::null_mut());

impl Code {
    /// (Re-)initializes the stub slot for `id` so its failure tail targets
    /// `thread_cached_cpu`, and returns it with all ops unblocked.
    ///
    /// The arena is reserved on first use and never freed; recycled ids
    /// reuse their slot. The caller must be the only thread touching this
    /// id's slot (true for a freshly allocated id).
    pub(crate) fn init_for_id(id: u32, thread_cached_cpu: *const AtomicI32) -> *mut Code {
        ARENA_ONCE.call_once(|| {
            // 256MB of address space at the maximum id count; pages are
            // committed lazily so the resident cost tracks live threads.
            let bytes = MAX_THREAD_IDS as usize * mem::size_of::<CachePadded<Code>>();
            ARENA.store(os_mem::allocate_executable(bytes).cast(), Ordering::Release);
        });
        let arena = ARENA.load(Ordering::Acquire);
        let slot = unsafe { &mut *arena.add(id as usize) };
        let code: *mut Code = &mut **slot;
        let cell_address = (thread_cached_cpu as usize as u64).to_le_bytes();
        unsafe {
            ptr::copy_nonoverlapping(CODE_TEMPLATE.as_ptr(), (*code).bytes.as_mut_ptr(), CODE_TEMPLATE.len());
            ptr::copy_nonoverlapping(
                cell_address.as_ptr(),
                (*code).bytes.as_mut_ptr().add(CACHED_CPU_ADDR_OFFSET),
                cell_address.len(),
            );
        }
        code
    }

    pub(crate) fn rseq_load_fn(&self) -> RseqLoadFn {
        unsafe { mem::transmute(self.bytes.as_ptr().add(LOAD_OFFSET)) }
    }

    pub(crate) fn rseq_store_fn(&self) -> RseqStoreFn {
        unsafe { mem::transmute(self.bytes.as_ptr().add(STORE_OFFSET)) }
    }

    pub(crate) fn rseq_store_fence_fn(&self) -> RseqStoreFn {
        unsafe { mem::transmute(self.bytes.as_ptr().add(STORE_FENCE_OFFSET)) }
    }

    fn entry_word(&self, offset: usize) -> &AtomicU16 {
        // Entries sit at even offsets inside a 64-aligned slot, so the
        // 16-bit patch store is aligned.
        unsafe { &*self.bytes.as_ptr().add(offset).cast::<AtomicU16>() }
    }

    /// Points every op's first instruction at the failure tail. Plain
    /// relaxed stores; making them visible to the victim before relying on
    /// them is the caller's job (instruction-fetch coherence plus, when
    /// needed, the heavy fence).
    pub(crate) fn block_rseq_ops(&self) {
        self.entry_word(LOAD_OFFSET).store(LOAD_BLOCKED, Ordering::Relaxed);
        self.entry_word(STORE_OFFSET).store(STORE_BLOCKED, Ordering::Relaxed);
        self.entry_word(STORE_FENCE_OFFSET)
            .store(STORE_FENCE_BLOCKED, Ordering::Relaxed);
    }

    /// Restores the original first instructions.
    pub(crate) fn unblock_rseq_ops(&self) {
        self.entry_word(LOAD_OFFSET).store(LOAD_UNBLOCKED, Ordering::Relaxed);
        self.entry_word(STORE_OFFSET).store(STORE_UNBLOCKED, Ordering::Relaxed);
        self.entry_word(STORE_FENCE_OFFSET)
            .store(STORE_FENCE_UNBLOCKED, Ordering::Relaxed);
    }
}
