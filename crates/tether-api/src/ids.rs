//! Record identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a record, unique within its resource type.
///
/// Most resources use numeric ids; a few (e.g. trees, addressed by SHA-1)
/// use strings. Serialized untagged so it matches the wire form exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl RecordId {
    /// Parse an id from a path argument, preferring the numeric form.
    pub fn parse(value: &str) -> Self {
        value
            .parse::<i64>()
            .map(RecordId::Int)
            .unwrap_or_else(|_| RecordId::Str(value.to_string()))
    }

    /// Extract an id from a JSON value, if it is a number or string.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(RecordId::Int),
            serde_json::Value::String(s) => Some(RecordId::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{}", n),
            RecordId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Int(n)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Str(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::Str(s)
    }
}

/// Anything that carries a record id.
///
/// Implemented by every record type; used to reduce records to their ids
/// when computing subscription dependency keys.
pub trait Identifiable {
    fn id(&self) -> RecordId;
}

impl Identifiable for RecordId {
    fn id(&self) -> RecordId {
        self.clone()
    }
}
