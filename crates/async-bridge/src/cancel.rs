use std::sync::Arc;

use parking_lot::Mutex;

use crate::{error::Result, ffi::CancellationId, observer::CancellationObserver};

/// Issues the foreign cancellation call for one operation id.
pub trait Canceller: Send + Sync + 'static {
    fn cancel(&self, id: CancellationId) -> Result<()>;
}

/// Snapshot of a [`CancellationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationPhase {
    /// The foreign runtime has not reported a cancellation id yet.
    NotStarted,
    Started(CancellationId),
    /// Terminal.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum State {
    NotStarted,
    Started(CancellationId),
    /// `notified` records whether the foreign runtime has been told, which only
    /// happens once an id is known.
    Cancelled { notified: bool },
}

/// Resolves the race between a foreign operation receiving its cancellation id
/// and the host asking for cancellation.
///
/// The foreign runtime is only ever called with the lock released, and at
/// most once per state machine.
pub struct CancellationState {
    state: Mutex<State>,
    canceller: Arc<dyn Canceller>,
    observer: Arc<dyn CancellationObserver>,
}

impl CancellationState {
    pub fn new(canceller: Arc<dyn Canceller>, observer: Arc<dyn CancellationObserver>) -> Self {
        Self {
            state: Mutex::new(State::NotStarted),
            canceller,
            observer,
        }
    }

    /// Records the id the foreign runtime assigned. If cancellation was
    /// already requested, cancels it now.
    pub fn set_cancellation_id(&self, id: CancellationId) {
        let mut state = self.state.lock();
        match *state {
            State::NotStarted => {
                *state = State::Started(id);
                tracing::trace!(cancellation_id = id, "foreign operation started");
            }
            State::Cancelled { notified: false } => {
                *state = State::Cancelled { notified: true };
                drop(state);
                tracing::debug!(cancellation_id = id, "issuing deferred cancellation");
                self.issue(id);
            }
            State::Started(existing) => {
                tracing::warn!(
                    existing,
                    cancellation_id = id,
                    "cancellation id assigned twice, keeping the first"
                );
            }
            State::Cancelled { notified: true } => {
                tracing::warn!(
                    cancellation_id = id,
                    "cancellation id assigned after cancellation was issued, ignoring"
                );
            }
        }
    }

    /// Requests cancellation. The foreign runtime is told immediately if the
    /// id is known, otherwise as soon as it is set.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Started(id) => {
                *state = State::Cancelled { notified: true };
                drop(state);
                tracing::debug!(cancellation_id = id, "cancelling foreign operation");
                self.issue(id);
            }
            State::NotStarted => {
                *state = State::Cancelled { notified: false };
                tracing::trace!("cancellation requested before the operation started");
            }
            State::Cancelled { .. } => {}
        }
    }

    pub fn phase(&self) -> CancellationPhase {
        match *self.state.lock() {
            State::NotStarted => CancellationPhase::NotStarted,
            State::Started(id) => CancellationPhase::Started(id),
            State::Cancelled { .. } => CancellationPhase::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase() == CancellationPhase::Cancelled
    }

    fn issue(&self, id: CancellationId) {
        if let Err(error) = self.canceller.cancel(id) {
            self.observer.cancellation_failed(id, &error);
        }
    }
}

impl std::fmt::Debug for CancellationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationState")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
