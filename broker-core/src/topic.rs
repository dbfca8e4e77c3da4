//! Topics: `/`-separated hierarchical addresses.
//!
//! A topic is a non-empty UTF-8 string composed of `/`-separated segments.
//! Prefix matching is segment-aware: topic `a/b` matches subscriber `a` and
//! `a/b`, but never `a/bc` (§3, Topic).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A hierarchical, slash-segmented topic name.
///
/// Cheap to clone: the backing bytes are reference-counted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(Bytes);

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.as_str().to_owned()
    }
}

impl Topic {
    /// Construct a topic from owned bytes without validating non-emptiness.
    /// Internal helper; public construction goes through `TryFrom`.
    fn new_unchecked(bytes: Bytes) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Safety net: constructed only from valid UTF-8 via TryFrom impls below.
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    /// Returns true if `self` is a prefix-match ancestor of (or equal to)
    /// `other` on segment boundaries: `self` is a match for `other` iff
    /// `other` starts with `self`'s bytes and either they are equal length
    /// or the next byte in `other` is `/`.
    #[must_use]
    pub fn is_segment_prefix_of(&self, other: &Topic) -> bool {
        let p = self.as_bytes();
        let t = other.as_bytes();
        if p.len() > t.len() || !t.starts_with(p) {
            return false;
        }
        p.len() == t.len() || t[p.len()] == b'/'
    }
}

impl TryFrom<&str> for Topic {
    type Error = TopicError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(TopicError::Empty);
        }
        Ok(Self::new_unchecked(Bytes::copy_from_slice(s.as_bytes())))
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(TopicError::Empty);
        }
        Ok(Self::new_unchecked(Bytes::from(s.into_bytes())))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors constructing a `Topic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
}
