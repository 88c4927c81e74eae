use derive_more::{Display, Error};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

static NEXT_CONTROLLER: AtomicU64 = AtomicU64::new(1);

/// Why a piece of work was aborted.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// A newer call took over; the result of this one is no longer wanted.
    #[display("superseded by a newer call")]
    Superseded,
    /// The entry was invalidated while the call was in flight.
    #[display("invalidated")]
    Invalidated,
    /// Explicitly cancelled by a caller, optionally with a message.
    #[display("cancelled{}", _0.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    Cancelled(Option<String>),
}

#[derive(Default)]
struct State {
    reason: Option<AbortReason>,
    wakers: Vec<Waker>,
}

struct Shared {
    id: u64,
    state: Mutex<State>,
}
impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding this lock can't leave `State` half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The cancelling half of an abort pair.
///
/// Aborting is one-shot: the first reason wins and later calls are ignored.
///
/// ```
/// use stash_asyncutils::{AbortController, AbortReason};
///
/// let controller = AbortController::new();
/// let signal = controller.signal();
/// assert!(!signal.is_aborted());
/// controller.abort(AbortReason::Cancelled(None));
/// assert_eq!(signal.reason(), Some(AbortReason::Cancelled(None)));
/// ```
pub struct AbortController {
    shared: Arc<Shared>,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONTROLLER.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// A signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal { shared: Arc::clone(&self.shared) }
    }

    /// Abort with `reason`. Returns `false` if the controller had already
    /// been aborted, in which case the original reason is kept.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let wakers = {
            let mut state = self.shared.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock().reason.is_some()
    }
}
impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
impl std::fmt::Debug for AbortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortController")
            .field("id", &self.shared.id)
            .field("reason", &self.shared.lock().reason)
            .finish()
    }
}

/// The observing half of an abort pair. Cheap to clone.
#[derive(Clone)]
pub struct AbortSignal {
    shared: Arc<Shared>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.shared.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.shared.lock().reason.clone()
    }

    /// `Err(Aborted)` if the signal has fired, for early returns with `?`.
    pub fn check(&self) -> Result<(), Aborted> {
        match self.reason() {
            Some(reason) => Err(Aborted { reason }),
            None => Ok(()),
        }
    }

    /// Resolves with the reason once the controller aborts.
    pub fn aborted(&self) -> AbortedFuture {
        AbortedFuture { shared: Arc::clone(&self.shared) }
    }

    /// `true` if both signals observe the same controller.
    pub fn same_controller(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("id", &self.shared.id)
            .field("reason", &self.shared.lock().reason)
            .finish()
    }
}

/// Returned by [`AbortSignal::check`] when the signal fired.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
#[display("aborted: {reason}")]
pub struct Aborted {
    #[error(not(source))]
    pub reason: AbortReason,
}

/// Future returned by [`AbortSignal::aborted`].
pub struct AbortedFuture {
    shared: Arc<Shared>,
}

impl Future for AbortedFuture {
    type Output = AbortReason;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.reason {
            return Poll::Ready(reason.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
