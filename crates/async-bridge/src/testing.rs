//! A foreign runtime implemented in Rust behind the C ABI.
//!
//! Operations run on a private multi-threaded tokio runtime and complete
//! their promise from its worker threads, exercising the same paths a real
//! foreign runtime would.

use std::{
    ffi::{CString, c_char},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    sync::oneshot,
};

use crate::{
    context::{AsyncContext, ContextOptions},
    error::Result,
    ffi::{CancellationId, FfiBuffer, FfiContext, FfiError, RuntimeVTable},
    handle::{ForeignResource, NativeHandle},
    observer::CancellationObserver,
    promise::Promise,
};

pub const ERROR_INVALID_ARGUMENT: u32 = 1;
pub const ERROR_CANCELLED: u32 = 2;
pub const ERROR_CANCEL_REJECTED: u32 = 3;
pub const ERROR_INTERNAL: u32 = 4;

/// Name of the runtime's worker threads, which deliver completions.
pub const WORKER_THREAD_NAME: &str = "bridge-test-runtime";

pub const VTABLE: RuntimeVTable = RuntimeVTable {
    context_create,
    context_destroy,
    cancel,
    error_code,
    error_message,
    error_free,
};

pub fn context() -> Result<AsyncContext> {
    AsyncContext::builder(VTABLE).build()
}

pub fn context_with_observer(observer: Arc<dyn CancellationObserver>) -> Result<AsyncContext> {
    AsyncContext::builder(VTABLE)
        .options(ContextOptions::default().observer(observer))
        .build()
}

struct TestError {
    code: u32,
    message: CString,
}

/// Allocates an error the way the test runtime reports them.
pub fn new_error(code: u32, message: &str) -> *mut FfiError {
    let message = CString::new(message).unwrap_or_else(|_| c"invalid message".to_owned());
    Box::into_raw(Box::new(TestError { code, message })).cast()
}

unsafe extern "C" fn error_code(err: *const FfiError) -> u32 {
    unsafe { (*err.cast::<TestError>()).code }
}

unsafe extern "C" fn error_message(err: *const FfiError) -> *const c_char {
    unsafe { (*err.cast::<TestError>()).message.as_ptr() }
}

unsafe extern "C" fn error_free(err: *mut FfiError) {
    drop(unsafe { Box::from_raw(err.cast::<TestError>()) });
}

struct TestRuntime {
    rt: Option<Runtime>,
    handle: Handle,
    last_id: AtomicU64,
    operations: DashMap<CancellationId, oneshot::Sender<()>>,
    in_flight: Arc<AtomicUsize>,
    cancel_requests: Mutex<Vec<CancellationId>>,
    reject_cancellation: AtomicBool,
    destroyed: Arc<AtomicUsize>,
    destroyed_on: Arc<Mutex<Option<String>>>,
    resources_destroyed: Arc<AtomicUsize>,
}

impl TestRuntime {
    fn new() -> std::io::Result<Self> {
        let rt = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()?;
        Ok(Self {
            handle: rt.handle().clone(),
            rt: Some(rt),
            last_id: AtomicU64::new(0),
            operations: DashMap::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel_requests: Mutex::new(Vec::new()),
            reject_cancellation: AtomicBool::new(false),
            destroyed: Arc::new(AtomicUsize::new(0)),
            destroyed_on: Arc::default(),
            resources_destroyed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// # Safety
    ///
    /// `ctx` must come from [`context_create`] and still be alive.
    unsafe fn from_ffi<'a>(ctx: *const FfiContext) -> &'a Self {
        unsafe { &*ctx.cast::<Self>() }
    }

    fn next_id(&self) -> CancellationId {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a cancellable operation, returning its id and the signal
    /// fired when it is cancelled.
    fn register(&self) -> (CancellationId, oneshot::Receiver<()>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.operations.insert(id, tx);
        (id, rx)
    }

    fn spawn<T: Send + 'static>(
        &self,
        promise: *mut Promise<T>,
        op: impl Future<Output = Outcome<T>> + Send + 'static,
    ) {
        let promise = SendPromise(unsafe { *promise });
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);
        self.handle.spawn(async move {
            let outcome = op.await;
            promise.deliver(outcome);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

enum Outcome<T> {
    Value(T),
    Error(u32, &'static str),
    Nothing,
}

struct SendPromise<T>(Promise<T>);

// SAFETY: the promise context is an opaque token, not a pointer to memory.
unsafe impl<T> Send for SendPromise<T> {}

impl<T> SendPromise<T> {
    fn deliver(&self, outcome: Outcome<T>) {
        match outcome {
            Outcome::Value(value) => unsafe { self.0.complete(std::ptr::null_mut(), &raw const value) },
            Outcome::Error(code, message) => unsafe {
                self.0.complete(new_error(code, message), std::ptr::null());
            },
            Outcome::Nothing => unsafe {
                self.0.complete(std::ptr::null_mut(), std::ptr::null());
            },
        }
    }
}

unsafe extern "C" fn context_create(out: *mut *mut FfiContext) -> *mut FfiError {
    match TestRuntime::new() {
        Ok(runtime) => {
            unsafe { out.write(Box::into_raw(Box::new(runtime)).cast()) };
            std::ptr::null_mut()
        }
        Err(e) => new_error(ERROR_INTERNAL, &format!("failed to build runtime: {e}")),
    }
}

unsafe extern "C" fn context_destroy(ctx: *mut FfiContext) {
    let mut runtime = unsafe { Box::from_raw(ctx.cast::<TestRuntime>()) };
    *runtime.destroyed_on.lock() = std::thread::current().name().map(str::to_owned);
    runtime.destroyed.fetch_add(1, Ordering::SeqCst);
    // Host tests destroy contexts from inside their own async runtime, where
    // blocking on shutdown is not allowed.
    if let Some(rt) = runtime.rt.take() {
        rt.shutdown_background();
    }
}

unsafe extern "C" fn cancel(ctx: *const FfiContext, id: CancellationId) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    runtime.cancel_requests.lock().push(id);
    if runtime.reject_cancellation.load(Ordering::SeqCst) {
        return new_error(ERROR_CANCEL_REJECTED, "cancellation rejected");
    }
    if let Some((_, signal)) = runtime.operations.remove(&id) {
        _ = signal.send(());
    }
    std::ptr::null_mut()
}

/// Completes with `input * 2` from a worker thread.
///
/// # Safety
///
/// `promise` must be a valid slot and `ctx` a live test runtime context.
pub unsafe extern "C" fn future_success(
    promise: *mut Promise<i32>,
    ctx: *const FfiContext,
    input: i32,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    runtime.spawn(promise, async move { Outcome::Value(input * 2) });
    std::ptr::null_mut()
}

/// Completes with an invalid-argument error from a worker thread.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_failure(
    promise: *mut Promise<i32>,
    ctx: *const FfiContext,
    _input: i32,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    runtime.spawn(promise, async {
        Outcome::Error(ERROR_INVALID_ARGUMENT, "input rejected")
    });
    std::ptr::null_mut()
}

/// Refuses to start; the promise is never completed.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_start_failure(
    _promise: *mut Promise<i32>,
    _ctx: *const FfiContext,
) -> *mut FfiError {
    new_error(ERROR_INVALID_ARGUMENT, "refused to start")
}

/// Completes synchronously, before returning to the caller.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_inline(
    promise: *mut Promise<i32>,
    _ctx: *const FfiContext,
    input: i32,
) -> *mut FfiError {
    let value = input + 1;
    unsafe { (*promise).complete(std::ptr::null_mut(), &raw const value) };
    std::ptr::null_mut()
}

/// Completes with neither an error nor a value.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_empty(
    promise: *mut Promise<i32>,
    ctx: *const FfiContext,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    runtime.spawn(promise, async { Outcome::Nothing });
    std::ptr::null_mut()
}

/// Never completes on its own; completes with a cancelled error once
/// cancelled.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_pending(
    promise: *mut Promise<i32>,
    ctx: *const FfiContext,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    let (id, cancelled) = runtime.register();
    unsafe { (*promise).cancellation_id = id };
    runtime.spawn(promise, async move {
        _ = cancelled.await;
        Outcome::Error(ERROR_CANCELLED, "operation cancelled")
    });
    std::ptr::null_mut()
}

/// Cancellable, but ignores cancellation and completes with `input` after
/// `delay_ms`.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_stubborn(
    promise: *mut Promise<i32>,
    ctx: *const FfiContext,
    input: i32,
    delay_ms: u64,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    let id = runtime.next_id();
    unsafe { (*promise).cancellation_id = id };
    runtime.spawn(promise, async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Outcome::Value(input)
    });
    std::ptr::null_mut()
}

/// Completes with an upper-cased copy of `input`.
///
/// # Safety
///
/// See [`future_success`]; `input` must be valid for the duration of the
/// call.
pub unsafe extern "C" fn future_shout(
    promise: *mut Promise<FfiBuffer>,
    ctx: *const FfiContext,
    input: FfiBuffer,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    let shouted = unsafe { input.as_slice() }.to_ascii_uppercase();
    let promise = SendPromise(unsafe { *promise });
    let in_flight = runtime.in_flight.clone();
    in_flight.fetch_add(1, Ordering::SeqCst);
    runtime.handle.spawn(async move {
        let buffer = FfiBuffer {
            data: shouted.as_ptr(),
            len: shouted.len(),
        };
        promise.deliver(Outcome::Value(buffer));
        drop(shouted);
        in_flight.fetch_sub(1, Ordering::SeqCst);
    });
    std::ptr::null_mut()
}

/// A resource created by [`future_resource`].
pub struct TestResource {
    tag: u32,
    destroyed: Arc<AtomicUsize>,
}

unsafe extern "C" fn destroy_resource(raw: *mut TestResource) {
    let resource = unsafe { Box::from_raw(raw) };
    resource.destroyed.fetch_add(1, Ordering::SeqCst);
}

impl ForeignResource for TestResource {
    const DESTROY: unsafe extern "C" fn(*mut Self) = destroy_resource;
}

impl TestResource {
    pub fn tag(handle: &NativeHandle<Self>) -> u32 {
        handle.guard(|raw| unsafe { (*raw).tag })
    }
}

/// Completes with a new [`TestResource`] carrying `tag`.
///
/// # Safety
///
/// See [`future_success`].
pub unsafe extern "C" fn future_resource(
    promise: *mut Promise<*mut TestResource>,
    ctx: *const FfiContext,
    tag: u32,
) -> *mut FfiError {
    let runtime = unsafe { TestRuntime::from_ffi(ctx) };
    let destroyed = runtime.resources_destroyed.clone();
    let promise = SendPromise(unsafe { *promise });
    let in_flight = runtime.in_flight.clone();
    in_flight.fetch_add(1, Ordering::SeqCst);
    runtime.handle.spawn(async move {
        let raw = Box::into_raw(Box::new(TestResource { tag, destroyed }));
        promise.deliver(Outcome::Value(raw));
        in_flight.fetch_sub(1, Ordering::SeqCst);
    });
    std::ptr::null_mut()
}

fn runtime_of<R>(ctx: &AsyncContext, f: impl FnOnce(&TestRuntime) -> R) -> R {
    assert!(
        std::ptr::fn_addr_eq(ctx.vtable().context_destroy, VTABLE.context_destroy),
        "not a test runtime context"
    );
    ctx.with_native_handle(|raw| f(unsafe { TestRuntime::from_ffi(raw) }))
}

/// Ids the bridge asked the runtime to cancel, in order.
pub fn cancel_requests(ctx: &AsyncContext) -> Vec<CancellationId> {
    runtime_of(ctx, |runtime| runtime.cancel_requests.lock().clone())
}

/// Makes every subsequent cancel call fail.
pub fn reject_cancellation(ctx: &AsyncContext, reject: bool) {
    runtime_of(ctx, |runtime| {
        runtime.reject_cancellation.store(reject, Ordering::SeqCst);
    });
}

/// Operations spawned on the runtime that have not completed yet.
pub fn in_flight(ctx: &AsyncContext) -> Arc<AtomicUsize> {
    runtime_of(ctx, |runtime| runtime.in_flight.clone())
}

/// Incremented when the context is destroyed.
pub fn destroy_counter(ctx: &AsyncContext) -> Arc<AtomicUsize> {
    runtime_of(ctx, |runtime| runtime.destroyed.clone())
}

/// Name of the thread that destroyed the context, once it has been destroyed.
pub fn destroy_thread(ctx: &AsyncContext) -> Arc<Mutex<Option<String>>> {
    runtime_of(ctx, |runtime| runtime.destroyed_on.clone())
}

/// Incremented whenever a [`TestResource`] is destroyed.
pub fn resource_destroy_counter(ctx: &AsyncContext) -> Arc<AtomicUsize> {
    runtime_of(ctx, |runtime| runtime.resources_destroyed.clone())
}
