use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::lsn::Lsn;

/// The type of row-level change that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" | "I" => Ok(ChangeKind::Insert),
            "update" | "U" => Ok(ChangeKind::Update),
            "delete" | "D" => Ok(ChangeKind::Delete),
            other => Err(Error::Decode(format!("unknown change kind: {}", other))),
        }
    }
}

/// One committed unit of upstream output, still in its wire encoding.
///
/// A batch may decode into zero or more change events; `lsn` is the
/// position to checkpoint once it has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub lsn: Lsn,
    pub data: String,
}

impl ChangeBatch {
    pub fn new(lsn: Lsn, data: impl Into<String>) -> Self {
        Self {
            lsn,
            data: data.into(),
        }
    }
}

/// A normalized row-level change, ready to be routed to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: Option<String>,
    pub table: Option<String>,
    /// The decoded change record as produced by the upstream decoder.
    pub body: serde_json::Value,
    pub lsn: Lsn,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Observation time in the wire format (RFC 3339, millisecond precision).
    pub fn timestamp(&self) -> String {
        self.observed_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
