// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};

/// A `key:value` tag attached to outgoing records and alarms.
///
/// Many tags are made from literal strings, such as:
///  - "source:nginx-access"
///  - "host:web-01"
///  - "region:us-east-1"
///
/// so being able to save allocations is nice.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag {
    value: Cow<'static, str>,
}

/// Creates a tag from a key and value known at compile time. No validation is
/// performed; only use this with literals that are known to be well formed.
/// For runtime values, use [Tag::new].
#[macro_export]
macro_rules! tag {
    ($key:expr, $val:expr) => {
        $crate::tag::Tag::from_static(concat!($key, ":", $val))
    };
}

impl Tag {
    /// Used by the `tag!` macro, or directly with literals that are already
    /// in `key:value` form.
    pub const fn from_static(value: &'static str) -> Self {
        Self {
            value: Cow::Borrowed(value),
        }
    }

    /// Creates a tag from a key and value, rejecting empty parts. It's
    /// preferred to use the `tag!` macro when both are known at compile time.
    pub fn new<K, V>(key: K, value: V) -> Result<Self, TagError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let key = key.as_ref();
        let value = value.as_ref();
        if key.is_empty() {
            return Err(TagError::EmptyKey);
        }
        if value.is_empty() {
            return Err(TagError::EmptyValue);
        }
        if key.contains(':') {
            return Err(TagError::ColonInKey);
        }
        Ok(Tag {
            value: Cow::Owned(format!("{key}:{value}")),
        })
    }

    /// The tag's key, i.e. everything before the first colon.
    pub fn key(&self) -> &str {
        self.value.split_once(':').map_or("", |(k, _)| k)
    }

    /// The tag's value, i.e. everything after the first colon.
    pub fn value(&self) -> &str {
        self.value.split_once(':').map_or("", |(_, v)| v)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TagError {
    EmptyKey,
    EmptyValue,
    ColonInKey,
}

impl Display for TagError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TagError::EmptyKey => write!(f, "tag key is empty"),
            TagError::EmptyValue => write!(f, "tag value is empty"),
            TagError::ColonInKey => write!(f, "tag key contains a colon"),
        }
    }
}

impl std::error::Error for TagError {}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag").field("value", &self.value).finish()
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        self.value.as_ref()
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}
