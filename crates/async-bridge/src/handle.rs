use std::{fmt, ptr::NonNull};

use crate::error::{Error, Result};

/// A foreign resource type with a statically known destructor.
///
/// Implement this for opaque `#[repr(C)]` marker types so that operations can
/// return freshly created resources as [`NativeHandle`]s. `DESTROY` must be
/// safe to call from any thread.
pub trait ForeignResource {
    const DESTROY: unsafe extern "C" fn(*mut Self);
}

/// Owns exactly one foreign resource and destroys it exactly once, on drop.
///
/// Share through `Arc` when several owners need the resource; the handle itself
/// is never cloned.
///
/// The handle is `Send` and `Sync` whatever `T` is. The foreign resource must
/// tolerate being passed to foreign calls concurrently, and its destructor
/// must be callable from whichever thread drops the last owner.
pub struct NativeHandle<T> {
    raw: NonNull<T>,
    destroy: unsafe extern "C" fn(*mut T),
}

// SAFETY: the handle is only ever read (passed by pointer into foreign calls)
// and destroyed once from `Drop`, which requires exclusive ownership. Callers of
// `from_raw` guarantee the resource and its destructor are thread-agnostic.
unsafe impl<T> Send for NativeHandle<T> {}
unsafe impl<T> Sync for NativeHandle<T> {}

impl<T> NativeHandle<T> {
    /// Takes ownership of `raw`.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live resource that nothing else will destroy,
    /// and `destroy` must be the destructor the foreign runtime expects for it.
    /// The resource may be used and destroyed from any thread.
    pub unsafe fn from_raw(raw: *mut T, destroy: unsafe extern "C" fn(*mut T)) -> Result<Self> {
        let raw = NonNull::new(raw).ok_or(Error::InvalidArgument("null native handle"))?;
        Ok(Self { raw, destroy })
    }

    pub const fn as_ptr(&self) -> *const T {
        self.raw.as_ptr()
    }

    /// Runs `f` with the raw pointer. The resource stays alive for the whole
    /// call.
    pub fn guard<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        f(self.as_ptr())
    }

    /// Releases ownership without destroying the resource.
    pub fn into_raw(self) -> *mut T {
        let raw = self.raw.as_ptr();
        std::mem::forget(self);
        raw
    }
}

impl<T: ForeignResource> NativeHandle<T> {
    /// # Safety
    ///
    /// Same contract as [`NativeHandle::from_raw`], with `T::DESTROY` as the
    /// destructor.
    pub unsafe fn adopt(raw: *mut T) -> Result<Self> {
        unsafe { Self::from_raw(raw, T::DESTROY) }
    }
}

impl<T> Drop for NativeHandle<T> {
    fn drop(&mut self) {
        tracing::trace!(handle = ?self.raw, "destroying native handle");
        unsafe { (self.destroy)(self.raw.as_ptr()) };
    }
}

impl<T> fmt::Debug for NativeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeHandle").field(&self.raw).finish()
    }
}
