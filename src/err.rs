use core::cell::Cell;
use core::fmt::{self, Write};
use displaydoc::Display;

/// An unrecoverable platform failure.
///
/// These are never produced by rseq-op contention (which is a plain `bool`
/// return); they mean a syscall the primitive cannot work without has
/// failed. They are routed through the thread's fatal-error handler, which
/// either aborts the process or surfaces the failure as a panic; see
/// [AbortOnError] and [PanicOnError].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// anonymous mmap of {0} bytes failed
    MmapFailed(usize),
    /// munmap of {0} bytes failed
    MunmapFailed(usize),
    /// munmap of a pointer that is not page-aligned
    MisalignedFree,
    /// mprotect on the fence page failed
    MprotectFailed,
    /// pthread_key_create for the thread-death destructor failed
    ThreadKeyCreateFailed,
    /// the thread id space ({0} ids) is exhausted
    IdSpaceExhausted(u32),
    /// sched_setaffinity to cpu {0} failed
    SetAffinityFailed(i32),
}

/// A fatal-error handler. It must not return; it either terminates the
/// process or panics.
pub type FatalErrorHandler = fn(&FatalError) -> !;

thread_local! {
    static HANDLER: Cell<FatalErrorHandler> = const { Cell::new(panic_with_message) };
}

/// Installs `handler` as the calling thread's fatal-error handler.
///
/// Prefer the scoped guards [AbortOnError] and [PanicOnError], which restore
/// the previous handler automatically.
pub fn set_fatal_error_handler(handler: FatalErrorHandler) {
    HANDLER.with(|h| h.set(handler));
}

/// Returns the calling thread's current fatal-error handler.
pub fn fatal_error_handler() -> FatalErrorHandler {
    HANDLER.with(|h| h.get())
}

pub(crate) fn fatal_error(err: FatalError) -> ! {
    fatal_error_handler()(&err)
}

fn panic_with_message(err: &FatalError) -> ! {
    panic!("{err}");
}

fn abort_with_message(err: &FatalError) -> ! {
    // Format into a stack buffer and write(2) it; the failing subsystem may
    // be the allocator, so no heap from here on.
    let mut buf = StackBuffer::new();
    let _ = write!(buf, "urseq fatal error: {err}\n");
    abort_with_str(buf.as_str());
}

fn abort_with_str(message: &str) -> ! {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            message.as_ptr().cast(),
            message.len(),
        );
    }
    std::process::abort();
}

struct StackBuffer {
    bytes: [u8; 128],
    len: usize,
}

impl StackBuffer {
    fn new() -> Self {
        Self { bytes: [0; 128], len: 0 }
    }

    fn as_str(&self) -> &str {
        // Only ever filled from `write!` of str data, so this cannot fail.
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("urseq fatal error\n")
    }
}

impl Write for StackBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        let take = s.len().min(room);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// While one of these is in scope, fatal errors abort the process with a
/// message instead of panicking, and a panic unwinding through the scope
/// aborts as well. This keeps unwinds from escaping into C callers, and it
/// means a core dump shows the frame that hit the error rather than the one
/// that caught it. Every `extern "C"` entry point of this crate pins one.
#[derive(Debug)]
pub struct AbortOnError {
    previous: FatalErrorHandler,
}

impl AbortOnError {
    /// Installs the abort handler, remembering the previous one.
    pub fn new() -> Self {
        let previous = fatal_error_handler();
        set_fatal_error_handler(abort_with_message);
        Self { previous }
    }
}

impl Default for AbortOnError {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AbortOnError {
    fn drop(&mut self) {
        if std::thread::panicking() {
            abort_with_str("urseq: panic reached an abort-on-error boundary\n");
        }
        set_fatal_error_handler(self.previous);
    }
}

/// While one of these is in scope, fatal errors surface as panics the caller
/// can catch and treat as a recoverable failure. The public Rust entry
/// points pin one, so a library user always sees fatal errors as unwinds
/// regardless of what an outer scope installed.
#[derive(Debug)]
pub struct PanicOnError {
    previous: FatalErrorHandler,
}

impl PanicOnError {
    /// Installs the panic handler, remembering the previous one.
    pub fn new() -> Self {
        let previous = fatal_error_handler();
        set_fatal_error_handler(panic_with_message);
        Self { previous }
    }
}

impl Default for PanicOnError {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PanicOnError {
    fn drop(&mut self) {
        set_fatal_error_handler(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_a(_err: &FatalError) -> ! {
        panic!("handler_a");
    }

    #[test]
    fn default_handler_panics_with_display() {
        let result = std::panic::catch_unwind(|| {
            fatal_error(FatalError::MprotectFailed);
        });
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert_eq!(message, "mprotect on the fence page failed");
    }

    #[test]
    fn scoped_guards_save_and_restore() {
        let installed = handler_a as FatalErrorHandler;
        set_fatal_error_handler(installed);
        {
            let _panic_mode = PanicOnError::new();
            assert!(fatal_error_handler() != installed);
            {
                let _abort_mode = AbortOnError::new();
                assert!(fatal_error_handler() != installed);
            }
            // Back to the panic handler installed by the outer guard.
            let result = std::panic::catch_unwind(|| {
                fatal_error(FatalError::ThreadKeyCreateFailed);
            });
            assert!(result.is_err());
        }
        assert!(fatal_error_handler() == installed);
        set_fatal_error_handler(super::panic_with_message);
    }

    #[test]
    fn handlers_are_thread_local() {
        let installed = handler_a as FatalErrorHandler;
        set_fatal_error_handler(installed);
        std::thread::spawn(move || {
            assert!(fatal_error_handler() != installed);
        })
        .join()
        .unwrap();
        set_fatal_error_handler(super::panic_with_message);
    }

    #[test]
    fn stack_buffer_truncates_instead_of_overflowing() {
        let mut buf = StackBuffer::new();
        for _ in 0..100 {
            let _ = write!(buf, "0123456789");
        }
        assert_eq!(buf.as_str().len(), 128);
    }
}
