use crate::failure::Failure;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The data axis of an entry.
///
/// The variants carry exactly the fields that may be present in that
/// status, so "data without success" or "error without error status" can't
/// be represented:
/// - `Pending` never settled, no data, no error.
/// - `Success` holds the data from the last settle.
/// - `Error` holds the error and, if an earlier call succeeded, that data.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum DataState {
    #[default]
    Pending,
    Success { data: Value },
    Error { data: Option<Value>, error: Failure },
}

impl DataState {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Pending => Status::Pending,
            Self::Success { .. } => Status::Success,
            Self::Error { .. } => Status::Error,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Pending => None,
            Self::Success { data } => Some(data),
            Self::Error { data, .. } => data.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&Failure> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Transition to `Error`, keeping whatever data this state holds.
    pub fn failed(&self, error: Failure) -> Self {
        Self::Error { data: self.data().cloned(), error }
    }
}

/// Status of the data axis, without the payload.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[display("pending")]
    Pending,
    #[display("success")]
    Success,
    #[display("error")]
    Error,
}

/// The async axis of an entry, independent of [`DataState`]: a successful
/// entry can be `Loading` while still exposing its previous data.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncStatus {
    #[default]
    #[display("idle")]
    Idle,
    #[display("loading")]
    Loading,
}
