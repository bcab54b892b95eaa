use std::{alloc::Layout, ffi::c_void, fmt};

use crate::{
    error::{Error, Result},
    ffi::{CANCELLATION_ID_UNSET, CancellationId, FfiError},
};

/// Completion callback. The foreign runtime invokes it exactly once per
/// successfully started operation, with either a non-null error (ownership
/// passes to the bridge) or a value pointer valid for the duration of the call.
pub type PromiseCallback<T> =
    extern "C" fn(error: *mut FfiError, value: *const T, context: *const c_void);

/// Promise slot handed to a foreign start function.
///
/// The slot itself only lives for the duration of the start call: the foreign
/// runtime copies `complete` and `context` out of it and writes
/// `cancellation_id` before returning.
#[repr(C)]
pub struct Promise<T> {
    pub complete: PromiseCallback<T>,
    pub context: *const c_void,
    pub cancellation_id: CancellationId,
}

pub type RawPromise = Promise<c_void>;

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Promise<T> {}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("context", &self.context)
            .field("cancellation_id", &self.cancellation_id)
            .finish_non_exhaustive()
    }
}

impl<T> Promise<T> {
    /// Invokes the completion callback.
    ///
    /// # Safety
    ///
    /// Must be called at most once per started operation, with `error` either
    /// null or an owned foreign error, and `value` either null or valid for
    /// reads for the duration of the call.
    pub unsafe fn complete(&self, error: *mut FfiError, value: *const T) {
        (self.complete)(error, value, self.context);
    }

    pub const fn has_cancellation_id(&self) -> bool {
        self.cancellation_id != CANCELLATION_ID_UNSET
    }
}

impl RawPromise {
    pub(crate) const fn new(complete: PromiseCallback<c_void>, context: *const c_void) -> Self {
        Self {
            complete,
            context,
            cancellation_id: CANCELLATION_ID_UNSET,
        }
    }

    /// Reinterprets the slot for a concrete value type.
    ///
    /// This is the only place a promise slot changes type. The value pointer
    /// is a thin pointer whatever `T` is, so the callback ABI is unchanged;
    /// the layout of the whole slot is still checked before casting.
    pub(crate) fn into_typed<T>(self) -> Result<Promise<T>> {
        ensure_raw_layout::<Promise<T>>()?;
        // SAFETY: layouts are equal (checked above) and `extern "C"` function
        // pointers that differ only in the pointee of a thin pointer argument
        // share one calling convention.
        Ok(unsafe { std::mem::transmute_copy::<Self, Promise<T>>(&self) })
    }
}

/// Fails if `S` cannot stand in for a [`RawPromise`] in memory.
pub fn ensure_raw_layout<S>() -> Result<()> {
    let expected = Layout::new::<RawPromise>();
    let actual = Layout::new::<S>();
    if expected == actual {
        Ok(())
    } else {
        Err(Error::internal(format!(
            "promise slot layout mismatch for {}: expected size {} align {}, got size {} align {}",
            std::any::type_name::<S>(),
            expected.size(),
            expected.align(),
            actual.size(),
            actual.align(),
        )))
    }
}
