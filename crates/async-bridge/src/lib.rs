//! Awaiting operations that run in a foreign runtime behind a C ABI.
//!
//! A call is started with [`AsyncContext::invoke_async_function`], which hands
//! the foreign runtime a [`Promise`] slot. The foreign runtime completes the
//! promise exactly once from any thread, and the returned [`AsyncCall`]
//! resolves with the decoded result. Cancelling the call, explicitly through a
//! [`CancelHandle`] or by dropping it, forwards the request to the foreign
//! runtime's own cancellation, whichever of the two sides learns about the
//! operation first.

mod cancel;
mod completer;
mod context;
pub mod error;
pub mod ffi;
mod handle;
mod observer;
mod payload;
mod promise;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cancel::{CancellationPhase, CancellationState, Canceller};
pub use context::{AsyncCall, AsyncContext, AsyncContextBuilder, CancelHandle, ContextOptions};
pub use error::{Error, ForeignError, Result};
pub use ffi::{CancellationId, FfiBuffer, FfiContext, FfiError, RuntimeVTable};
pub use handle::{ForeignResource, NativeHandle};
pub use observer::{CancellationObserver, TracingObserver};
pub use payload::FromForeign;
pub use promise::{Promise, PromiseCallback, RawPromise, ensure_raw_layout};
