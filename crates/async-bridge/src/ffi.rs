//! The C ABI contract between the bridge and a foreign runtime.
//!
//! A foreign runtime publishes a [`RuntimeVTable`] describing how to create,
//! destroy and cancel work on its execution contexts and how to read the
//! errors it produces. Individual operations are started through per-operation
//! start functions that receive a [`Promise`](crate::Promise) slot.

use std::{
    ffi::{CStr, c_char},
    ptr::NonNull,
};

use crate::error::{ForeignError, Result};

/// Identifies one in-flight foreign operation for cancellation purposes.
///
/// `0` is reserved to mean "not assigned".
pub type CancellationId = u64;

pub const CANCELLATION_ID_UNSET: CancellationId = 0;

/// Opaque foreign execution context.
#[repr(C)]
pub struct FfiContext {
    _private: [u8; 0],
}

/// Opaque foreign error. Ownership of a non-null `*mut FfiError` handed to the
/// bridge passes to the bridge, which releases it with
/// [`RuntimeVTable::error_free`].
#[repr(C)]
pub struct FfiError {
    _private: [u8; 0],
}

/// Borrowed byte buffer. Only valid for the duration of the call it is passed
/// to.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiBuffer {
    pub data: *const u8,
    pub len: usize,
}

impl FfiBuffer {
    /// # Safety
    ///
    /// `data` must be valid for reads of `len` bytes, or `len` must be zero.
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RuntimeVTable {
    /// Creates a context, writing it to `out`. Returns null on success.
    pub context_create: unsafe extern "C" fn(out: *mut *mut FfiContext) -> *mut FfiError,
    /// Releases every resource tied to the context. Only called once no
    /// operation started on it is still pending, and never from inside a
    /// completion callback.
    pub context_destroy: unsafe extern "C" fn(ctx: *mut FfiContext),
    /// Best-effort cancellation of the operation registered under `id`.
    pub cancel: unsafe extern "C" fn(ctx: *const FfiContext, id: CancellationId) -> *mut FfiError,
    pub error_code: unsafe extern "C" fn(err: *const FfiError) -> u32,
    /// Borrowed message, valid until the error is freed. May be null.
    pub error_message: unsafe extern "C" fn(err: *const FfiError) -> *const c_char,
    pub error_free: unsafe extern "C" fn(err: *mut FfiError),
}

/// Safe wrapper over a [`RuntimeVTable`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForeignRuntime {
    vtable: RuntimeVTable,
}

impl ForeignRuntime {
    pub(crate) const fn new(vtable: RuntimeVTable) -> Self {
        Self { vtable }
    }

    pub(crate) const fn vtable(&self) -> &RuntimeVTable {
        &self.vtable
    }

    /// Decodes and frees a foreign error.
    ///
    /// # Safety
    ///
    /// `err` must be an error produced by this runtime that has not been freed.
    pub(crate) unsafe fn take_error(&self, err: NonNull<FfiError>) -> ForeignError {
        let raw = err.as_ptr();
        let code = unsafe { (self.vtable.error_code)(raw) };
        let message = unsafe { (self.vtable.error_message)(raw) };
        let message = if message.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(message) }
                .to_string_lossy()
                .into_owned()
        };
        unsafe { (self.vtable.error_free)(raw) };
        ForeignError { code, message }
    }

    /// Converts a returned error pointer into a `Result`, freeing the error.
    ///
    /// # Safety
    ///
    /// `err` must be null or satisfy the contract of [`Self::take_error`].
    pub(crate) unsafe fn check(&self, err: *mut FfiError) -> Result<()> {
        match NonNull::new(err) {
            None => Ok(()),
            Some(err) => Err(unsafe { self.take_error(err) }.into()),
        }
    }

    /// # Safety
    ///
    /// `ctx` must be a live context created by this runtime.
    pub(crate) unsafe fn cancel(&self, ctx: *const FfiContext, id: CancellationId) -> Result<()> {
        let err = unsafe { (self.vtable.cancel)(ctx, id) };
        unsafe { self.check(err) }
    }
}
