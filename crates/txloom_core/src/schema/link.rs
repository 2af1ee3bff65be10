//! Link (join) table declarations and resolution.
//!
//! # Invariants
//! - One `(parent type, child type, field)` triple maps to exactly one join
//!   table with exactly two columns.
//! - Resolution reports which level of the lookup is missing.

use std::collections::BTreeMap;
use thiserror::Error;

use super::{check_identifier, FieldDef, SchemaError, TableDef};

/// Logical name of the join table's parent column.
pub const LINK_PARENT_FIELD: &str = "parentId";
/// Logical name of the join table's child column.
pub const LINK_CHILD_FIELD: &str = "childId";

/// Raised when a link operation names a relation that was never declared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkConfigError {
    #[error("no links declared for parent type `{parent}`")]
    UnknownParent { parent: String },
    #[error("no link fields declared for `{parent}` -> `{child}`")]
    UnknownRelation { parent: String, child: String },
    #[error("no linked field `{parent}.{field}` for child type `{child}`")]
    UnknownField {
        parent: String,
        child: String,
        field: String,
    },
}

/// Physical join table for one declared link field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableDef {
    table: TableDef,
}

impl LinkTableDef {
    pub fn new(
        table: impl Into<String>,
        parent_column: impl Into<String>,
        child_column: impl Into<String>,
    ) -> Self {
        let table = table.into();
        Self {
            table: TableDef::new(table.clone(), table)
                .field(FieldDef::text(LINK_PARENT_FIELD, parent_column))
                .field(FieldDef::text(LINK_CHILD_FIELD, child_column)),
        }
    }

    /// Join table described with `parentId` / `childId` logical fields.
    pub fn table_def(&self) -> &TableDef {
        &self.table
    }

    pub fn table(&self) -> &str {
        self.table.table()
    }

    pub(crate) fn validate(&self) -> Result<(), SchemaError> {
        check_identifier("link table", self.table.table())?;
        self.table.validate()
    }
}

/// Parent type -> child type -> field -> join table.
#[derive(Debug, Clone, Default)]
pub struct LinkRegistry {
    links: BTreeMap<String, BTreeMap<String, BTreeMap<String, LinkTableDef>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a join table, returning the one it replaced.
    pub fn insert(
        &mut self,
        parent: impl Into<String>,
        child: impl Into<String>,
        field: impl Into<String>,
        table: LinkTableDef,
    ) -> Option<LinkTableDef> {
        self.links
            .entry(parent.into())
            .or_default()
            .entry(child.into())
            .or_default()
            .insert(field.into(), table)
    }

    pub fn resolve(
        &self,
        parent: &str,
        child: &str,
        field: &str,
    ) -> Result<&LinkTableDef, LinkConfigError> {
        let children = self
            .links
            .get(parent)
            .ok_or_else(|| LinkConfigError::UnknownParent {
                parent: parent.to_string(),
            })?;
        let fields = children
            .get(child)
            .ok_or_else(|| LinkConfigError::UnknownRelation {
                parent: parent.to_string(),
                child: child.to_string(),
            })?;
        fields
            .get(field)
            .ok_or_else(|| LinkConfigError::UnknownField {
                parent: parent.to_string(),
                child: child.to_string(),
                field: field.to_string(),
            })
    }

    /// Iterates `(parent, child, field, table)` in declaration-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, &LinkTableDef)> {
        self.links.iter().flat_map(|(parent, children)| {
            children.iter().flat_map(move |(child, fields)| {
                fields
                    .iter()
                    .map(move |(field, table)| (parent.as_str(), child.as_str(), field.as_str(), table))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{LinkConfigError, LinkRegistry, LinkTableDef};

    fn registry() -> LinkRegistry {
        let mut registry = LinkRegistry::new();
        registry.insert(
            "Tst",
            "TstDoc",
            "docsIds",
            LinkTableDef::new("tst_log", "tst_log_id", "tst_doc_id"),
        );
        registry
    }

    #[test]
    fn resolve_finds_declared_join_table() {
        let registry = registry();
        let link = registry.resolve("Tst", "TstDoc", "docsIds").unwrap();
        assert_eq!(link.table(), "tst_log");
        assert_eq!(
            link.table_def().field_def("parentId").unwrap().column,
            "tst_log_id"
        );
    }

    #[test]
    fn resolve_distinguishes_each_missing_level() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("Other", "TstDoc", "docsIds"),
            Err(LinkConfigError::UnknownParent { .. })
        ));
        assert!(matches!(
            registry.resolve("Tst", "Other", "docsIds"),
            Err(LinkConfigError::UnknownRelation { .. })
        ));
        assert!(matches!(
            registry.resolve("Tst", "TstDoc", "otherIds"),
            Err(LinkConfigError::UnknownField { .. })
        ));
    }

    #[test]
    fn iter_lists_every_declaration() {
        let entries: Vec<_> = registry()
            .iter()
            .map(|(parent, child, field, table)| {
                (parent.to_string(), child.to_string(), field.to_string(), table.table().to_string())
            })
            .collect();
        assert_eq!(
            entries,
            vec![(
                "Tst".to_string(),
                "TstDoc".to_string(),
                "docsIds".to_string(),
                "tst_log".to_string()
            )]
        );
    }
}
