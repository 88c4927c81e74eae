use crate::codec::{canonical_segment, is_subset_of, to_cache_key};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::hash::{Hash, Hasher};

/// An ordered, non-empty list of JSON segments identifying an entry.
///
/// Equality and hashing go through the canonical string form, so object
/// segments compare regardless of field order.
#[derive(Clone, Debug)]
pub struct EntryKey {
    segments: Vec<Value>,
    canonical: String,
}

impl EntryKey {
    /// Create a key from segments. Returns [`ErrorKind::EmptyKey`] when
    /// `segments` is empty.
    pub fn new(segments: impl IntoIterator<Item = Value>) -> Result<Self> {
        let segments: Vec<Value> = segments.into_iter().collect();
        if segments.is_empty() {
            exn::bail!(ErrorKind::EmptyKey);
        }
        Ok(Self::from_vec(segments))
    }

    /// Parse a canonical cache-key string (as produced by
    /// [`to_cache_key`](Self::to_cache_key)) back into a key.
    pub fn parse(cache_key: &str) -> Result<Self> {
        let segments: Vec<Value> =
            serde_json::from_str(cache_key).or_raise(|| ErrorKind::InvalidKey(cache_key.to_string()))?;
        Self::new(segments)
    }

    fn from_vec(segments: Vec<Value>) -> Self {
        let canonical = to_cache_key(&segments);
        Self { segments, canonical }
    }

    #[doc(hidden)]
    pub fn __from_json_array(value: Value) -> Self {
        match value {
            Value::Array(segments) if !segments.is_empty() => Self::from_vec(segments),
            // The `key!` macro always passes a non-empty array literal.
            other => Self::from_vec(vec![other]),
        }
    }

    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always `false`; keys cannot be empty. Present for clippy's sake.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Canonical string form: JSON array with sorted object fields.
    pub fn to_cache_key(&self) -> &str {
        &self.canonical
    }

    /// Per-segment canonical strings, used as the path into a key tree.
    pub fn tree_path(&self) -> Vec<String> {
        self.segments.iter().map(canonical_segment).collect()
    }

    /// A new key with `segment` appended.
    pub fn child(&self, segment: Value) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self::from_vec(segments)
    }

    /// `true` if `prefix` equals the first `prefix.len()` segments of this key.
    pub fn starts_with(&self, prefix: &EntryKey) -> bool {
        prefix.len() <= self.len()
            && prefix.segments.iter().zip(&self.segments).all(|(a, b)| canonical_segment(a) == canonical_segment(b))
    }

    /// `true` if every segment of `filter` is a structural subset of the
    /// segment at the same position in this key (see [`is_subset_of`]).
    pub fn matches_partial(&self, filter: &EntryKey) -> bool {
        filter.len() <= self.len() && filter.segments.iter().zip(&self.segments).all(|(a, b)| is_subset_of(a, b))
    }
}

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}
impl Eq for EntryKey {}
impl Hash for EntryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl Display for EntryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.canonical)
    }
}

impl TryFrom<Vec<Value>> for EntryKey {
    type Error = crate::error::Error;
    fn try_from(segments: Vec<Value>) -> Result<Self> {
        Self::new(segments)
    }
}

impl Serialize for EntryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.segments.serialize(serializer)
    }
}
impl<'de> Deserialize<'de> for EntryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let segments = Vec::<Value>::deserialize(deserializer)?;
        if segments.is_empty() {
            return Err(serde::de::Error::custom(ErrorKind::EmptyKey));
        }
        Ok(Self::from_vec(segments))
    }
}
