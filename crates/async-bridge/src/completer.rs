use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;

use crate::{
    context::{ContextShared, release_from_foreign},
    error::{Error, Result},
    ffi::{FfiError, ForeignRuntime},
    payload::FromForeign,
    promise::{Promise, RawPromise},
};

/// Completers whose promise has been handed to a foreign runtime, keyed by the
/// token stored in the promise's `context` field.
static PENDING: LazyLock<PendingCompleters> = LazyLock::new(PendingCompleters::default);

#[derive(Default)]
struct PendingCompleters {
    last_token: AtomicUsize,
    slots: DashMap<usize, Box<dyn ErasedCompleter>>,
}

impl PendingCompleters {
    fn insert(&self, completer: Box<dyn ErasedCompleter>) -> usize {
        loop {
            let token = self.last_token.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            // Zero is the null context. After wrapping, skip tokens still in use.
            if token == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.slots.entry(token) {
                slot.insert(completer);
                return token;
            }
        }
    }

    fn take(&self, token: usize) -> Option<Box<dyn ErasedCompleter>> {
        self.slots.remove(&token).map(|(_, completer)| completer)
    }
}

const fn token_to_context(token: usize) -> *const c_void {
    std::ptr::without_provenance(token)
}

fn context_to_token(context: *const c_void) -> usize {
    context.addr()
}

/// The object-safe face of [`Completer`], stored in the registry.
trait ErasedCompleter: Send + Sync {
    /// # Safety
    ///
    /// `error` is null or an owned foreign error; `value` is null or points to
    /// the completer's raw value type and is valid for the call.
    unsafe fn complete(self: Box<Self>, error: *mut FfiError, value: *const c_void);

    fn fail(self: Box<Self>, error: Error);
}

/// Resumes one suspended call with a typed result.
///
/// The completer keeps its context alive until it has fired. Completion may
/// happen on a foreign thread, so the context reference is released through
/// [`release_from_foreign`] rather than dropped in place.
pub(crate) struct Completer<T> {
    runtime: ForeignRuntime,
    context: Arc<ContextShared>,
    tx: oneshot::Sender<Result<T>>,
}

impl<T: FromForeign> Completer<T> {
    pub(crate) fn new(context: Arc<ContextShared>, tx: oneshot::Sender<Result<T>>) -> Self {
        Self {
            runtime: *context.runtime(),
            context,
            tx,
        }
    }

    /// Hands ownership of the completer to the pending registry and builds the
    /// promise slot that will reclaim it.
    ///
    /// If the slot cannot be built, the completer is completed with the error
    /// before it is returned.
    pub(crate) fn make_promise_struct(self) -> Result<Promise<T::Raw>> {
        self.register(RawPromise::into_typed::<T::Raw>)
    }

    /// Registers the completer and casts its raw slot with `cast`. A failed
    /// cast takes the completer back out and fails it. For `Promise<T>` the
    /// cast never fails, since every typed slot shares the raw layout.
    fn register<P>(self, cast: impl FnOnce(RawPromise) -> Result<P>) -> Result<P> {
        let token = PENDING.insert(Box::new(self));
        cast(RawPromise::new(complete_raw, token_to_context(token))).inspect_err(|err| {
            if let Some(completer) = PENDING.take(token) {
                completer.fail(err.clone());
            }
        })
    }

    /// Completes a promise whose start call failed synchronously. The foreign
    /// runtime will never invoke its callback.
    pub(crate) fn clean_up_uncompleted_promise_struct(promise: &Promise<T::Raw>, error: Error) {
        let token = context_to_token(promise.context);
        match PENDING.take(token) {
            Some(completer) => completer.fail(error),
            None => tracing::error!(
                token,
                %error,
                "start call failed but its promise was already completed"
            ),
        }
    }

    /// # Safety
    ///
    /// See [`ErasedCompleter::complete`].
    unsafe fn resolve(&self, error: *mut FfiError, value: *const T::Raw) -> Result<T> {
        if let Some(error) = NonNull::new(error) {
            return Err(unsafe { self.runtime.take_error(error) }.into());
        }
        if value.is_null() {
            return Err(Error::internal(
                "completion delivered neither an error nor a value",
            ));
        }
        unsafe { T::from_foreign(value) }
    }

    fn finish(self, result: Result<T>) {
        let Self { context, tx, .. } = self;
        release_from_foreign(context);
        if tx.send(result).is_err() {
            tracing::debug!("call dropped before completion, discarding result");
        }
    }
}

impl<T: FromForeign> ErasedCompleter for Completer<T> {
    unsafe fn complete(self: Box<Self>, error: *mut FfiError, value: *const c_void) {
        let result = unsafe { self.resolve(error, value.cast()) };
        (*self).finish(result);
    }

    fn fail(self: Box<Self>, error: Error) {
        (*self).finish(Err(error));
    }
}

/// Fails the completer registered for a promise if the start call unwinds
/// before returning.
pub(crate) struct StartGuard {
    token: usize,
}

impl StartGuard {
    pub(crate) fn new<R>(promise: &Promise<R>) -> Self {
        Self {
            token: context_to_token(promise.context),
        }
    }

    /// The start call returned; the promise now belongs to the foreign
    /// runtime or to the start-failure cleanup.
    pub(crate) fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if let Some(completer) = PENDING.take(self.token) {
            tracing::error!(token = self.token, "start call unwound, failing its promise");
            completer.fail(Error::internal("start call panicked"));
        }
    }
}

/// The callback stored in every promise slot.
extern "C" fn complete_raw(error: *mut FfiError, value: *const c_void, context: *const c_void) {
    let token = context_to_token(context);
    match PENDING.take(token) {
        Some(completer) => unsafe { completer.complete(error, value) },
        None => tracing::error!(
            token,
            has_error = !error.is_null(),
            "completion callback fired for an unknown or already completed promise"
        ),
    }
}
