//! Field-address computation for pointers that may dangle.
//!
//! Inside an rseq, pointer chasing is only safe through [crate::load], and
//! the struct a pointer targets may already be freed by the time the address
//! arithmetic happens. These macros compute the address a field *would* have
//! using `offset_of!` and wrapping byte arithmetic only: the operand is
//! never dereferenced, not even syntactically, so they are sound (and keep
//! sanitizers quiet) on dangling and null pointers.
//!
//! The projection closure passed to the helper below is never called; it
//! exists purely so the macro's result is typed as a pointer to the field.
//! Array fields yield a pointer to the whole array type (Rust has no
//! implicit decay); cast to the element type to index.

/// The address `field` would have inside the `$Parent` that `$ptr` points
/// at, as a `*const` preserving the operand's immutability.
///
/// `$ptr` may dangle or be null; it is not dereferenced.
#[macro_export]
macro_rules! member_addr {
    ($ptr:expr, $Parent:ty, $field:ident) => {{
        let base: *const $Parent = $ptr;
        $crate::member_addr::cast_to_field(
            |parent: &$Parent| &parent.$field,
            base.cast::<u8>().wrapping_add(core::mem::offset_of!($Parent, $field)),
        )
    }};
}

/// [member_addr!], for mutable operands: yields a `*mut` to the field.
#[macro_export]
macro_rules! member_addr_mut {
    ($ptr:expr, $Parent:ty, $field:ident) => {{
        let base: *mut $Parent = $ptr;
        $crate::member_addr::cast_to_field(
            |parent: &$Parent| &parent.$field,
            base.cast::<u8>().wrapping_add(core::mem::offset_of!($Parent, $field)),
        ) as *mut _
    }};
}

#[doc(hidden)]
pub const fn cast_to_field<Parent, Field>(
    _projection: fn(&Parent) -> &Field,
    address: *const u8,
) -> *const Field {
    address.cast()
}
