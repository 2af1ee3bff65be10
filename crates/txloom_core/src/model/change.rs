//! Change kinds and link-change payloads recorded per mutation.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::value::{Record, RecordId};

/// Kind of one change-detail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    AddLink,
    RemoveLink,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::AddLink => "ADD_LINK",
            ChangeKind::RemoveLink => "REMOVE_LINK",
        }
    }

    pub fn is_link(self) -> bool {
        matches!(self, ChangeKind::AddLink | ChangeKind::RemoveLink)
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            "ADD_LINK" => Ok(ChangeKind::AddLink),
            "REMOVE_LINK" => Ok(ChangeKind::RemoveLink),
            other => Err(format!("unknown change kind `{other}`")),
        }
    }
}

/// Edge described by an `ADD_LINK` / `REMOVE_LINK` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkChange {
    pub parent_type: String,
    pub parent_id: RecordId,
    pub parent_field: String,
    pub child_type: String,
    pub child_id: RecordId,
}

impl LinkChange {
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("parentType", &self.parent_type)
            .with("parentId", &self.parent_id)
            .with("parentField", &self.parent_field)
            .with("childType", &self.child_type)
            .with("childId", &self.child_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeKind, LinkChange};

    #[test]
    fn link_kinds_are_flagged() {
        assert!(ChangeKind::AddLink.is_link());
        assert!(!ChangeKind::Update.is_link());
        assert_eq!("REMOVE_LINK".parse::<ChangeKind>().unwrap(), ChangeKind::RemoveLink);
        assert_eq!(serde_json::to_string(&ChangeKind::AddLink).unwrap(), "\"ADD_LINK\"");
    }

    #[test]
    fn link_change_uses_camel_case_keys() {
        let change = LinkChange {
            parent_type: "Tst".to_string(),
            parent_id: "p".to_string(),
            parent_field: "docsIds".to_string(),
            child_type: "TstDoc".to_string(),
            child_id: "c".to_string(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["parentField"], "docsIds");
        assert_eq!(change.to_record().get("childId").and_then(|v| v.as_str()), Some("c"));
    }
}
