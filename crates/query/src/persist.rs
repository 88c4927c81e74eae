//! Serialized cache layout and hydration.
//!
//! An entry serializes to the tuple `[data, error, when]`, or
//! `[data, error, when, meta]` when its options carry metadata. The cache
//! serializes to a map from canonical key string to that tuple.

use crate::cache::QueryCache;
use crate::error::{ErrorKind, Result};
use crate::failure::Failure;
use crate::state::DataState;
use exn::ResultExt;
use serde::de::Error as DeError;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use stash_key::EntryKey;
use std::collections::BTreeMap;
use tracing::instrument;

/// Serialized form of a whole cache, keyed by canonical key string.
pub type SerializedCache = BTreeMap<String, SerializedEntry>;

/// An error as it survives serialization: its message only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SerializedEntry {
    pub data: Option<Value>,
    pub error: Option<SerializedError>,
    /// Unix milliseconds of the last settle; `0` if never settled.
    pub when: u64,
    pub meta: Option<Value>,
}

impl SerializedEntry {
    pub fn from_state(state: &DataState, when: u64, meta: Option<Value>) -> Self {
        Self {
            data: state.data().cloned(),
            error: state.error().map(|error| SerializedError { message: error.to_string() }),
            when,
            meta,
        }
    }

    /// The state an entry is restored into.
    ///
    /// An error wins; otherwise non-null data or a settle time mean success;
    /// anything else never settled.
    pub fn to_state(&self) -> DataState {
        let data = self.data.clone().filter(|data| !data.is_null());
        match &self.error {
            Some(error) => DataState::Error { data, error: Failure::msg(error.message.clone()) },
            None if data.is_some() || self.when > 0 => DataState::success(data.unwrap_or(Value::Null)),
            None => DataState::Pending,
        }
    }
}

impl Serialize for SerializedEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.meta.is_some() { 4 } else { 3 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.data)?;
        seq.serialize_element(&self.error)?;
        seq.serialize_element(&self.when)?;
        if let Some(meta) = &self.meta {
            seq.serialize_element(meta)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for SerializedEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let fields = Vec::<Value>::deserialize(deserializer)?;
        if !(3..=4).contains(&fields.len()) {
            return Err(D::Error::invalid_length(fields.len(), &"a tuple of 3 or 4 elements"));
        }
        let mut fields = fields.into_iter();
        let data = fields.next().filter(|data| !data.is_null());
        let error = match fields.next() {
            None | Some(Value::Null) => None,
            Some(error) => Some(SerializedError::deserialize(error).map_err(D::Error::custom)?),
        };
        let when = match fields.next() {
            Some(when) => u64::deserialize(when).map_err(D::Error::custom)?,
            None => 0,
        };
        let meta = fields.next().filter(|meta| !meta.is_null());
        Ok(Self { data, error, when, meta })
    }
}

impl QueryCache {
    /// Snapshot every entry.
    pub fn serialize(&self) -> SerializedCache {
        self.entries()
            .into_iter()
            .map(|entry| {
                let meta = entry.options().and_then(|options| options.meta.clone());
                let serialized = SerializedEntry::from_state(&entry.state(), entry.when(), meta);
                (entry.key().to_cache_key().to_string(), serialized)
            })
            .collect()
    }

    /// Restore entries without running their query functions. Existing
    /// entries are overwritten; their options are kept.
    #[instrument(level = "trace", skip_all, fields(entries = serialized.len()))]
    pub fn hydrate(&self, serialized: SerializedCache) -> Result<()> {
        let mut restored = Vec::with_capacity(serialized.len());
        for (cache_key, entry) in serialized {
            let key = EntryKey::parse(&cache_key).or_raise(|| ErrorKind::InvalidKey(cache_key.clone()))?;
            restored.push((key, entry));
        }
        for (key, serialized) in restored {
            let entry = self.get_or_create(&key);
            entry.set_when(serialized.when);
            self.set_entry_state(&entry, serialized.to_state());
        }
        Ok(())
    }

    /// [`hydrate`](Self::hydrate) from a JSON value.
    pub fn hydrate_json(&self, value: Value) -> Result<()> {
        let serialized: SerializedCache =
            serde_json::from_value(value).or_raise(|| ErrorKind::InvalidData("expected a map of entry tuples".into()))?;
        self.hydrate(serialized)
    }
}
