use crate::{error::Error, ffi::CancellationId};

/// Receives failures of best-effort foreign cancellation calls. These never
/// reach the caller; the operation's own completion still resolves it.
pub trait CancellationObserver: Send + Sync + 'static {
    fn cancellation_failed(&self, id: CancellationId, error: &Error);
}

/// Logs cancellation failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CancellationObserver for TracingObserver {
    fn cancellation_failed(&self, id: CancellationId, error: &Error) {
        tracing::warn!(cancellation_id = id, %error, "failed to cancel foreign operation");
    }
}
