//! Identities and the store key layout derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A scope a limit applies to, such as `{type: "ip", key: "203.0.113.4"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// The scoped value (an address, a username, ...)
    pub key: String,
    /// The kind of scope (`ip`, `user`, ...)
    #[serde(rename = "type")]
    pub id_type: String,
}

impl Id {
    /// Create a new identity.
    pub fn new(id_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id_type: id_type.into(),
        }
    }

    /// Shorthand for an IP scope.
    pub fn ip(addr: impl Into<String>) -> Self {
        Self::new("ip", addr)
    }

    /// Parse a `type=key` pair.
    pub fn parse(s: &str) -> Option<Self> {
        let (id_type, key) = s.split_once('=')?;
        if id_type.is_empty() {
            return None;
        }
        Some(Self::new(id_type, key))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.id_type, self.key)
    }
}

/// Which of the two per-identity records a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// The attempt counter
    Attempts,
    /// The timeout record
    Timeout,
}

impl Kind {
    /// The key suffix for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Attempts => "attempts",
            Kind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds store keys for one limiter namespace.
///
/// Format: `{key_type}/{id_type}/{{id_key}}/{kind}`. The braces around the
/// identity key are a Redis Cluster hash tag, keeping both records of one
/// identity in the same slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    key_type: String,
}

impl KeyLayout {
    /// Create a layout for the `key_type` namespace.
    pub fn new(key_type: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
        }
    }

    /// The namespace every key starts with.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// The key for one record of `id`.
    pub fn key(&self, id: &Id, kind: Kind) -> String {
        format!("{}/{}/{{{}}}/{}", self.key_type, id.id_type, id.key, kind)
    }

    /// The attempt counter key for `id`.
    pub fn attempts_key(&self, id: &Id) -> String {
        self.key(id, Kind::Attempts)
    }

    /// The timeout record key for `id`.
    pub fn timeout_key(&self, id: &Id) -> String {
        self.key(id, Kind::Timeout)
    }

    /// A glob pattern matching every key in this namespace.
    pub fn pattern(&self) -> String {
        format!("{}/*", self.key_type)
    }
}
