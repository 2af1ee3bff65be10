//! Record lifecycle status stored in the soft-delete status field.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::value::Value;

/// Lifecycle state of a record carrying a status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Default for newly inserted records.
    Active,
    Inactive,
    Archived,
    /// Soft-deleted tombstone; the row stays in storage.
    Deleted,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Active => "ACTIVE",
            RecordStatus::Inactive => "INACTIVE",
            RecordStatus::Archived => "ARCHIVED",
            RecordStatus::Deleted => "DELETED",
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "ACTIVE" => Ok(RecordStatus::Active),
            "INACTIVE" => Ok(RecordStatus::Inactive),
            "ARCHIVED" => Ok(RecordStatus::Archived),
            "DELETED" => Ok(RecordStatus::Deleted),
            other => Err(format!("unknown record status `{other}`")),
        }
    }
}

impl From<RecordStatus> for Value {
    fn from(status: RecordStatus) -> Self {
        Value::Text(status.as_str().to_string())
    }
}
