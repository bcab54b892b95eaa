use std::{
    future::Future,
    pin::Pin,
    ptr::NonNull,
    sync::{Arc, LazyLock},
    task::{Context, Poll},
    thread,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    cancel::{CancellationState, Canceller},
    completer::{Completer, StartGuard},
    error::{Error, Result},
    ffi::{CancellationId, FfiContext, FfiError, ForeignRuntime, RuntimeVTable},
    handle::NativeHandle,
    observer::{CancellationObserver, TracingObserver},
    payload::FromForeign,
    promise::Promise,
};

/// Options applied to an [`AsyncContext`] at construction.
#[derive(Clone)]
pub struct ContextOptions {
    observer: Arc<dyn CancellationObserver>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            observer: Arc::new(TracingObserver),
        }
    }
}

impl ContextOptions {
    /// Where failures of best-effort cancellation calls are reported.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn CancellationObserver>) -> Self {
        self.observer = observer;
        self
    }
}

impl std::fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextOptions").finish_non_exhaustive()
    }
}

pub struct AsyncContextBuilder {
    vtable: RuntimeVTable,
    options: ContextOptions,
}

impl AsyncContextBuilder {
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn CancellationObserver>) -> Self {
        self.options = self.options.observer(observer);
        self
    }

    #[must_use]
    pub fn options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    /// Creates a foreign execution context through the runtime's
    /// `context_create`.
    pub fn build(self) -> Result<AsyncContext> {
        let runtime = ForeignRuntime::new(self.vtable);
        let mut raw = std::ptr::null_mut();
        unsafe { runtime.check((self.vtable.context_create)(&raw mut raw)) }?;
        if raw.is_null() {
            return Err(Error::internal("context_create succeeded without a context"));
        }
        unsafe { AsyncContext::from_raw(self.vtable, raw, self.options) }
    }
}

/// State shared between a context, its pending calls, and their completers.
pub(crate) struct ContextShared {
    handle: NativeHandle<FfiContext>,
    runtime: ForeignRuntime,
    observer: Arc<dyn CancellationObserver>,
}

impl ContextShared {
    pub(crate) const fn runtime(&self) -> &ForeignRuntime {
        &self.runtime
    }
}

impl Canceller for ContextShared {
    fn cancel(&self, id: CancellationId) -> Result<()> {
        self.handle
            .guard(|ctx| unsafe { self.runtime.cancel(ctx, id) })
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        tracing::debug!(context = ?self.handle, "releasing async context");
    }
}

const RELEASE_THREAD_NAME: &str = "async-bridge-release";

/// Destroys contexts whose last reference was released on a foreign thread.
static RELEASER: LazyLock<Option<mpsc::UnboundedSender<ContextShared>>> = LazyLock::new(|| {
    let (tx, mut rx) = mpsc::unbounded_channel::<ContextShared>();
    thread::Builder::new()
        .name(RELEASE_THREAD_NAME.to_string())
        .spawn(move || {
            while let Some(shared) = rx.blocking_recv() {
                drop(shared);
            }
        })
        .inspect_err(|err| tracing::error!(%err, "failed to spawn context release thread"))
        .ok()?;
    Some(tx)
});

/// Drops a context reference from a thread that may belong to the foreign
/// runtime. A foreign runtime cannot be torn down from one of its own threads,
/// so the last reference is handed to the release thread instead.
pub(crate) fn release_from_foreign(shared: Arc<ContextShared>) {
    let Some(shared) = Arc::into_inner(shared) else {
        return;
    };
    let Some(releaser) = RELEASER.as_ref() else {
        tracing::warn!("no release thread, destroying context in place");
        return;
    };
    if let Err(mpsc::error::SendError(shared)) = releaser.send(shared) {
        tracing::warn!("release thread is gone, destroying context in place");
        drop(shared);
    }
}

/// A foreign runtime's execution context, and the entry point for calls into
/// it.
///
/// The context is destroyed when the last clone, pending call and unfired
/// completion callback have all gone away.
#[derive(Clone)]
pub struct AsyncContext {
    shared: Arc<ContextShared>,
}

impl AsyncContext {
    pub fn builder(vtable: RuntimeVTable) -> AsyncContextBuilder {
        AsyncContextBuilder {
            vtable,
            options: ContextOptions::default(),
        }
    }

    /// Adopts an existing foreign context.
    ///
    /// # Safety
    ///
    /// `raw` must be a live context created by the runtime described by
    /// `vtable`, and nothing else may destroy it.
    pub unsafe fn from_raw(
        vtable: RuntimeVTable,
        raw: *mut FfiContext,
        options: ContextOptions,
    ) -> Result<Self> {
        let handle = unsafe { NativeHandle::from_raw(raw, vtable.context_destroy) }?;
        tracing::debug!(context = ?handle, "async context created");
        Ok(Self {
            shared: Arc::new(ContextShared {
                handle,
                runtime: ForeignRuntime::new(vtable),
                observer: options.observer,
            }),
        })
    }

    pub fn vtable(&self) -> &RuntimeVTable {
        self.shared.runtime.vtable()
    }

    /// Runs `f` with the raw context pointer.
    pub fn with_native_handle<R>(&self, f: impl FnOnce(*const FfiContext) -> R) -> R {
        self.shared.handle.guard(f)
    }

    /// Prepares a call into the foreign runtime.
    ///
    /// `start` receives a promise slot and the context, begins the operation,
    /// and returns null, or an error if the operation could not be started. It
    /// runs when the returned future is first polled. The foreign runtime must
    /// write the operation's cancellation id into the slot before `start`
    /// returns if the operation can be cancelled.
    pub fn invoke_async_function<T, F>(&self, start: F) -> AsyncCall<T, F>
    where
        T: FromForeign,
        F: FnOnce(*mut Promise<T::Raw>, *const FfiContext) -> *mut FfiError,
    {
        let cancellation = Arc::new(CancellationState::new(
            self.shared.clone(),
            self.shared.observer.clone(),
        ));
        let (tx, rx) = oneshot::channel();
        AsyncCall {
            context: self.shared.clone(),
            start: Some(start),
            tx: Some(tx),
            rx,
            cancellation,
            completed: false,
        }
    }

    pub(crate) fn shared(&self) -> Arc<ContextShared> {
        self.shared.clone()
    }
}

impl std::fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncContext")
            .field("handle", &self.shared.handle)
            .finish_non_exhaustive()
    }
}

/// Requests cancellation of an [`AsyncCall`] from any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    state: Arc<CancellationState>,
}

impl CancelHandle {
    /// Asks the foreign runtime to abandon the operation. The call still
    /// resolves with whatever the foreign runtime eventually reports.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// A call into the foreign runtime, started on first poll.
///
/// Dropping the call while the operation is in flight cancels it; the result
/// it eventually delivers is discarded.
#[must_use = "the foreign operation only starts when the call is polled"]
pub struct AsyncCall<T, F> {
    context: Arc<ContextShared>,
    start: Option<F>,
    tx: Option<oneshot::Sender<Result<T>>>,
    rx: oneshot::Receiver<Result<T>>,
    cancellation: Arc<CancellationState>,
    completed: bool,
}

// `start` is moved out by value and never pinned.
impl<T, F> Unpin for AsyncCall<T, F> {}

impl<T, F> AsyncCall<T, F>
where
    T: FromForeign,
    F: FnOnce(*mut Promise<T::Raw>, *const FfiContext) -> *mut FfiError,
{
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: self.cancellation.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn launch(&mut self, start: F, tx: oneshot::Sender<Result<T>>) {
        let completer = Completer::new(self.context.clone(), tx);
        let mut promise = match completer.make_promise_struct() {
            Ok(promise) => promise,
            Err(err) => {
                tracing::error!(%err, "failed to build promise slot");
                return;
            }
        };

        let unwinding = StartGuard::new(&promise);
        let error = self
            .context
            .handle
            .guard(|ctx| start(&raw mut promise, ctx));
        unwinding.disarm();

        if let Some(error) = NonNull::new(error) {
            let error = unsafe { self.context.runtime.take_error(error) };
            tracing::debug!(%error, "foreign operation failed to start");
            Completer::<T>::clean_up_uncompleted_promise_struct(&promise, error.into());
            return;
        }

        if promise.has_cancellation_id() {
            self.cancellation
                .set_cancellation_id(promise.cancellation_id);
        } else {
            tracing::trace!("foreign operation started without a cancellation id");
        }
    }
}

impl<T, F> Future for AsyncCall<T, F>
where
    T: FromForeign,
    F: FnOnce(*mut Promise<T::Raw>, *const FfiContext) -> *mut FfiError,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.completed {
            return Poll::Ready(Err(Error::internal("call polled after completion")));
        }
        if let (Some(start), Some(tx)) = (this.start.take(), this.tx.take()) {
            this.launch(start, tx);
        }

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.completed = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(Error::internal("completer dropped without completing"))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, F> Drop for AsyncCall<T, F> {
    fn drop(&mut self) {
        let started = self.start.is_none();
        if started && !self.completed {
            tracing::debug!("call dropped while pending, cancelling");
            self.cancellation.cancel();
        }
    }
}

impl<T, F> std::fmt::Debug for AsyncCall<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCall")
            .field("started", &self.start.is_none())
            .field("completed", &self.completed)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            OnceLock,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    };

    use bytes::Bytes;
    use futures::poll;

    use super::*;
    use crate::{
        ffi::FfiBuffer,
        testing::{self, TestResource},
    };

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_resolves_with_value() {
        let ctx = testing::context().unwrap();
        let result = ctx
            .invoke_async_function::<i32, _>(|promise, raw| unsafe {
                testing::future_success(promise, raw, 21)
            })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_failure_resolves_with_foreign_error() {
        let ctx = testing::context().unwrap();
        let err = ctx
            .invoke_async_function::<i32, _>(|promise, raw| unsafe {
                testing::future_failure(promise, raw, 21)
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::Foreign(crate::ForeignError {
                code: testing::ERROR_INVALID_ARGUMENT,
                message: "input rejected".to_string(),
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_failure_resolves_without_callback() {
        let ctx = testing::context().unwrap();
        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_start_failure(promise, raw)
        });

        // Already complete on the first poll.
        let err = match poll!(&mut call) {
            Poll::Ready(result) => result.unwrap_err(),
            Poll::Pending => panic!("start failure must complete synchronously"),
        };
        assert_eq!(err.foreign_code(), Some(testing::ERROR_INVALID_ARGUMENT));
        assert_eq!(testing::in_flight(&ctx).load(Ordering::SeqCst), 0);
        assert!(testing::cancel_requests(&ctx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inline_completion_is_delivered() {
        let ctx = testing::context().unwrap();
        let result = ctx
            .invoke_async_function::<i32, _>(|promise, raw| unsafe {
                testing::future_inline(promise, raw, 1)
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_completion_is_internal_error() {
        let ctx = testing::context().unwrap();
        let err = ctx
            .invoke_async_function::<i32, _>(|promise, raw| unsafe {
                testing::future_empty(promise, raw)
            })
            .await
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_during_start_is_deferred_until_id_is_known() {
        let ctx = testing::context().unwrap();
        let handle: Arc<OnceLock<CancelHandle>> = Arc::default();

        let call = ctx.invoke_async_function::<i32, _>({
            let ctx = ctx.clone();
            let handle = handle.clone();
            move |promise, raw| {
                let error = unsafe { testing::future_pending(promise, raw) };
                handle.get().unwrap().cancel();
                // The id is written to the slot but not yet handed over.
                assert!(testing::cancel_requests(&ctx).is_empty());
                error
            }
        });
        handle.set(call.cancel_handle()).unwrap();

        let err = call.await.unwrap_err();
        assert_eq!(err.foreign_code(), Some(testing::ERROR_CANCELLED));
        assert_eq!(testing::cancel_requests(&ctx), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_after_start_is_immediate() {
        let ctx = testing::context().unwrap();
        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_pending(promise, raw)
        });
        assert!(poll!(&mut call).is_pending());
        assert!(testing::cancel_requests(&ctx).is_empty());

        let handle = call.cancel_handle();
        handle.cancel();
        assert_eq!(testing::cancel_requests(&ctx), vec![1]);
        handle.cancel();
        assert!(call.is_cancelled());

        let err = call.await.unwrap_err();
        assert_eq!(err.foreign_code(), Some(testing::ERROR_CANCELLED));
        assert_eq!(testing::cancel_requests(&ctx), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_is_advisory() {
        let ctx = testing::context().unwrap();
        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_stubborn(promise, raw, 5, 50)
        });
        assert!(poll!(&mut call).is_pending());

        call.cancel_handle().cancel();
        assert_eq!(call.await, Ok(5));
        assert_eq!(testing::cancel_requests(&ctx).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_pending_call_cancels_it() {
        let ctx = testing::context().unwrap();
        let in_flight = testing::in_flight(&ctx);
        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_pending(promise, raw)
        });
        assert!(poll!(&mut call).is_pending());
        assert_eq!(in_flight.load(Ordering::SeqCst), 1);

        drop(call);
        assert_eq!(testing::cancel_requests(&ctx), vec![1]);
        wait_until("cancelled operation to finish", || {
            in_flight.load(Ordering::SeqCst) == 0
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unpolled_call_never_starts() {
        let ctx = testing::context().unwrap();
        let call = ctx.invoke_async_function::<i32, _>(|_, _| -> *mut FfiError {
            panic!("start must not run for an unpolled call")
        });
        call.cancel_handle().cancel();
        drop(call);
        assert!(testing::cancel_requests(&ctx).is_empty());
    }

    #[derive(Default)]
    struct CountingObserver {
        failures: AtomicUsize,
        last_code: parking_lot::Mutex<Option<u32>>,
    }

    impl CancellationObserver for CountingObserver {
        fn cancellation_failed(&self, _id: CancellationId, error: &Error) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            *self.last_code.lock() = error.foreign_code();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_cancellation_is_observed_not_raised() {
        let observer = Arc::new(CountingObserver::default());
        let ctx = testing::context_with_observer(observer.clone()).unwrap();
        testing::reject_cancellation(&ctx, true);

        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_stubborn(promise, raw, 3, 20)
        });
        assert!(poll!(&mut call).is_pending());
        call.cancel_handle().cancel();

        assert_eq!(call.await, Ok(3));
        assert_eq!(observer.failures.load(Ordering::SeqCst), 1);
        assert_eq!(
            *observer.last_code.lock(),
            Some(testing::ERROR_CANCEL_REJECTED)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn context_outlives_pending_operations() {
        let ctx = testing::context().unwrap();
        let destroyed = testing::destroy_counter(&ctx);
        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_stubborn(promise, raw, 9, 30)
        });
        assert!(poll!(&mut call).is_pending());

        drop(ctx);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        assert_eq!(call.await, Ok(9));
        wait_until("context destruction", || {
            destroyed.load(Ordering::SeqCst) == 1
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandoned_context_is_destroyed_off_foreign_threads() {
        let ctx = testing::context().unwrap();
        let destroyed = testing::destroy_counter(&ctx);
        let destroyed_on = testing::destroy_thread(&ctx);
        let mut call = ctx.invoke_async_function::<i32, _>(|promise, raw| unsafe {
            testing::future_stubborn(promise, raw, 1, 30)
        });
        assert!(poll!(&mut call).is_pending());

        // The completer now holds the only reference.
        drop(ctx);
        drop(call);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        wait_until("context destruction", || {
            destroyed.load(Ordering::SeqCst) == 1
        })
        .await;
        let thread = destroyed_on.lock().clone();
        assert_ne!(thread.as_deref(), Some(testing::WORKER_THREAD_NAME));
        assert_eq!(thread.as_deref(), Some(RELEASE_THREAD_NAME));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_start_does_not_pin_context() {
        let ctx = testing::context().unwrap();
        let destroyed = testing::destroy_counter(&ctx);
        let call = ctx.invoke_async_function::<i32, _>(|_, _| -> *mut FfiError {
            panic!("start exploded")
        });

        let joined = tokio::spawn(call).await;
        assert!(joined.unwrap_err().is_panic());
        assert!(testing::cancel_requests(&ctx).is_empty());

        drop(ctx);
        wait_until("context destruction", || {
            destroyed.load(Ordering::SeqCst) == 1
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn returned_resource_is_owned_by_caller() {
        let ctx = testing::context().unwrap();
        let destroyed = testing::resource_destroy_counter(&ctx);

        let resource = ctx
            .invoke_async_function::<NativeHandle<TestResource>, _>(|promise, raw| unsafe {
                testing::future_resource(promise, raw, 7)
            })
            .await
            .unwrap();
        assert_eq!(TestResource::tag(&resource), 7);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        drop(resource);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn buffers_are_copied_into_owned_values() {
        let ctx = testing::context().unwrap();
        let input = b"hello";
        let shouted = ctx
            .invoke_async_function::<String, _>(|promise, raw| unsafe {
                testing::future_shout(
                    promise,
                    raw,
                    FfiBuffer {
                        data: input.as_ptr(),
                        len: input.len(),
                    },
                )
            })
            .await;
        assert_eq!(shouted.as_deref(), Ok("HELLO"));

        let bytes = ctx
            .invoke_async_function::<Bytes, _>(|promise, raw| unsafe {
                testing::future_shout(
                    promise,
                    raw,
                    FfiBuffer {
                        data: std::ptr::null(),
                        len: 0,
                    },
                )
            })
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn builder_surfaces_create_errors() {
        unsafe extern "C" fn failing_create(_out: *mut *mut FfiContext) -> *mut FfiError {
            testing::new_error(testing::ERROR_INTERNAL, "no threads left")
        }

        let vtable = RuntimeVTable {
            context_create: failing_create,
            ..testing::VTABLE
        };
        let err = AsyncContext::builder(vtable).build().unwrap_err();
        assert_eq!(err.foreign_code(), Some(testing::ERROR_INTERNAL));
        assert_eq!(err.to_string(), "foreign error: [4] no threads left");
    }
}
