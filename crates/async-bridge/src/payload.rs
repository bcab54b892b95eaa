use std::ffi::c_void;

use bytes::Bytes;

use crate::{
    error::{Error, Result},
    ffi::FfiBuffer,
    handle::{ForeignResource, NativeHandle},
};

/// A result type that can be read out of a completion callback's value
/// pointer.
pub trait FromForeign: Sized + Send + 'static {
    /// The pointee type the foreign runtime passes to the callback.
    type Raw;

    /// # Safety
    ///
    /// `raw` must be non-null, aligned and valid for reads of `Self::Raw` for
    /// the duration of the call.
    unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self>;
}

macro_rules! copy_from_foreign {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromForeign for $ty {
                type Raw = $ty;

                unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self> {
                    Ok(unsafe { raw.read() })
                }
            }
        )*
    };
}

copy_from_foreign!(u8, u16, u32, u64, i8, i16, i32, i64, usize, isize, f32, f64);

/// The foreign runtime still passes a non-null value pointer; its pointee is
/// never read.
impl FromForeign for () {
    type Raw = c_void;

    unsafe fn from_foreign(_raw: *const Self::Raw) -> Result<Self> {
        Ok(())
    }
}

impl FromForeign for bool {
    type Raw = u8;

    unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self> {
        match unsafe { raw.read() } {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::internal(format!("invalid bool payload: {other}"))),
        }
    }
}

impl FromForeign for Bytes {
    type Raw = FfiBuffer;

    unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self> {
        let buffer = unsafe { raw.read() };
        if buffer.data.is_null() && buffer.len != 0 {
            return Err(Error::internal("null buffer with non-zero length"));
        }
        Ok(Self::copy_from_slice(unsafe { buffer.as_slice() }))
    }
}

impl FromForeign for Vec<u8> {
    type Raw = FfiBuffer;

    unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self> {
        unsafe { Bytes::from_foreign(raw) }.map(|bytes| bytes.to_vec())
    }
}

impl FromForeign for String {
    type Raw = FfiBuffer;

    unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self> {
        let bytes = unsafe { Vec::<u8>::from_foreign(raw) }?;
        Self::from_utf8(bytes).map_err(|_| Error::internal("string payload is not valid UTF-8"))
    }
}

/// The foreign runtime hands over a freshly created resource; the host owns it
/// from here on.
impl<T: ForeignResource + 'static> FromForeign for NativeHandle<T> {
    type Raw = *mut T;

    unsafe fn from_foreign(raw: *const Self::Raw) -> Result<Self> {
        let ptr = unsafe { raw.read() };
        unsafe { Self::adopt(ptr) }
            .map_err(|_| Error::internal("completion delivered a null resource handle"))
    }
}
