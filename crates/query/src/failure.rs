use derive_more::{Display, Error};
use stash_asyncutils::{AbortReason, Aborted};
use std::error::Error as StdError;
use std::sync::Arc;

/// The failure of a caller-supplied async function (query function,
/// mutation function, or mutation callback).
///
/// Cloneable because a failure is stored in entry state and handed to every
/// awaiter of a coalesced call.
#[derive(Clone, Debug, Display, Error)]
pub enum Failure {
    /// The function observed its abort signal and stopped.
    #[display("aborted: {_0}")]
    Aborted(#[error(not(source))] AbortReason),
    /// Any other error.
    #[display("{_0}")]
    Error(#[error(not(source))] Arc<dyn StdError + Send + Sync>),
}

#[derive(Debug, Display, Error)]
#[display("{_0}")]
struct Message(#[error(not(source))] String);

impl Failure {
    pub fn new(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Error(Arc::new(error))
    }

    /// A failure carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// The wrapped error, if it is of type `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Error(error) => error.downcast_ref::<E>(),
            Self::Aborted(_) => None,
        }
    }
}

/// Two failures are equal when they are the same abort reason or share the
/// same underlying error allocation.
impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Aborted(a), Self::Aborted(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Aborted> for Failure {
    fn from(aborted: Aborted) -> Self {
        Self::Aborted(aborted.reason)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error)
    }
}
