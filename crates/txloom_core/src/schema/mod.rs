//! Declarative table, link and audit schema.
//!
//! # Responsibility
//! - Describe each entity type's storage mapping (fields, computed fields,
//!   encryption) so queries are derived instead of hand-written.
//! - Validate declarations once, before any session uses them.
//!
//! # Invariants
//! - Every SQL identifier matches `^[A-Za-z_][A-Za-z0-9_]*$`.
//! - Every entity declares the configured identity field.
//! - Encrypted fields are text-typed.

pub mod link;
pub mod manifest;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::audit::AuditTables;
use crate::sql::params::RESERVED_PARAMS;
use link::{LinkRegistry, LinkTableDef};

pub use link::LinkConfigError;

/// Default identity field name.
pub const DEFAULT_ID_FIELD: &str = "_id";
/// Default lifecycle field name used for soft deletes.
pub const DEFAULT_STATUS_FIELD: &str = "status";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Errors raised while declaring or loading a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid {context} identifier `{value}`")]
    InvalidIdentifier { context: &'static str, value: String },
    #[error("duplicate field `{field}` in table `{table}`")]
    DuplicateField { table: String, field: String },
    #[error("entity type `{0}` declared twice")]
    DuplicateEntity(String),
    #[error("entity `{entity}` does not declare identity field `{field}`")]
    MissingIdField { entity: String, field: String },
    #[error("encrypted field `{table}.{field}` must be text")]
    EncryptedNonText { table: String, field: String },
    #[error("field name `{table}.{field}` is reserved")]
    ReservedFieldName { table: String, field: String },
    #[error("link references undeclared entity type `{0}`")]
    UnknownLinkEntity(String),
    #[error("audit table `{table}` is missing field `{field}`")]
    MissingAuditField { table: String, field: String },
    #[error("invalid schema manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Storage type of one field, used to decode rows and encode parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    /// RFC 3339 text (epoch milliseconds are accepted on read).
    DateTime,
    Binary,
    /// Escaped JSON text holding any composite value.
    Json,
    /// Natural SQLite mapping without coercion.
    #[default]
    Any,
}

/// One stored field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Logical field name used in records.
    pub name: String,
    /// Physical column name.
    pub column: String,
    pub kind: FieldType,
    /// Stored through the encryption functions; needs the session key.
    pub encrypted: bool,
    /// Must be present and non-null on insert.
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, column: impl Into<String>, kind: FieldType) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            kind,
            encrypted: false,
            required: false,
        }
    }

    pub fn text(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::Text)
    }

    pub fn integer(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::Integer)
    }

    pub fn real(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::Real)
    }

    pub fn boolean(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::Boolean)
    }

    pub fn datetime(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::DateTime)
    }

    pub fn binary(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::Binary)
    }

    pub fn json(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, column, FieldType::Json)
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Read-only field resolved by a correlated SQL expression.
///
/// The expression may reference the owning table by its physical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedField {
    pub name: String,
    pub kind: FieldType,
    pub sql: String,
}

impl ComputedField {
    pub fn new(name: impl Into<String>, kind: FieldType, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            sql: sql.into(),
        }
    }
}

/// Storage mapping of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    computed: Vec<ComputedField>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
            computed: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn computed(mut self, field: ComputedField) -> Self {
        self.computed.push(field);
        self
    }

    /// Logical table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn computed_fields(&self) -> &[ComputedField] {
        &self.computed
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn computed_def(&self, name: &str) -> Option<&ComputedField> {
        self.computed.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_def(name).is_some()
    }

    pub fn has_encrypted_fields(&self) -> bool {
        self.fields.iter().any(|field| field.encrypted)
    }

    /// Checks identifiers, duplicates and encryption typing.
    pub fn validate(&self) -> Result<(), SchemaError> {
        check_identifier("table", &self.table)?;

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            check_identifier("field", &field.name)?;
            check_identifier("column", &field.column)?;
            if !seen.insert(field.name.as_str()) {
                return Err(self.duplicate(&field.name));
            }
            if field.encrypted && field.kind != FieldType::Text {
                return Err(SchemaError::EncryptedNonText {
                    table: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        for field in &self.computed {
            check_identifier("field", &field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(self.duplicate(&field.name));
            }
        }
        Ok(())
    }

    fn duplicate(&self, field: &str) -> SchemaError {
        SchemaError::DuplicateField {
            table: self.name.clone(),
            field: field.to_string(),
        }
    }
}

/// Validated set of entity, link and audit declarations.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: BTreeMap<String, TableDef>,
    links: LinkRegistry,
    id_field: String,
    status_field: Option<String>,
    audit: Option<AuditTables>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entity(&self, entity_type: &str) -> Option<&TableDef> {
        self.entities.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn status_field(&self) -> Option<&str> {
        self.status_field.as_deref()
    }

    /// Returns the status field when `table` declares it.
    pub fn status_field_of(&self, table: &TableDef) -> Option<&str> {
        self.status_field()
            .filter(|status| table.has_field(status))
    }

    pub fn audit(&self) -> Option<&AuditTables> {
        self.audit.as_ref()
    }
}

/// Collects declarations and validates them into a `Schema`.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    entities: Vec<(String, TableDef)>,
    links: Vec<(String, String, String, LinkTableDef)>,
    id_field: String,
    status_field: Option<String>,
    audit: Option<AuditTables>,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            links: Vec::new(),
            id_field: DEFAULT_ID_FIELD.to_string(),
            status_field: Some(DEFAULT_STATUS_FIELD.to_string()),
            audit: None,
        }
    }
}

impl SchemaBuilder {
    pub fn entity(mut self, entity_type: impl Into<String>, table: TableDef) -> Self {
        self.entities.push((entity_type.into(), table));
        self
    }

    /// Declares the join table behind `parent.field` pointing at `child` records.
    pub fn link(
        mut self,
        parent: impl Into<String>,
        field: impl Into<String>,
        child: impl Into<String>,
        table: LinkTableDef,
    ) -> Self {
        self.links
            .push((parent.into(), child.into(), field.into(), table));
        self
    }

    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.id_field = name.into();
        self
    }

    /// Sets the soft-delete status field; `None` disables soft deletes.
    pub fn status_field(mut self, name: Option<&str>) -> Self {
        self.status_field = name.map(str::to_string);
        self
    }

    pub fn audit(mut self, tables: AuditTables) -> Self {
        self.audit = Some(tables);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        check_identifier("identity field", &self.id_field)?;
        if let Some(status) = self.status_field.as_deref() {
            check_identifier("status field", status)?;
        }

        let mut entities = BTreeMap::new();
        for (entity_type, table) in self.entities {
            check_identifier("entity type", &entity_type)?;
            table.validate()?;
            if !table.has_field(&self.id_field) {
                return Err(SchemaError::MissingIdField {
                    entity: entity_type,
                    field: self.id_field.clone(),
                });
            }
            for name in table
                .fields()
                .iter()
                .map(|field| field.name.as_str())
                .chain(table.computed_fields().iter().map(|field| field.name.as_str()))
            {
                if RESERVED_PARAMS.contains(&name) || name.starts_with("__") {
                    return Err(SchemaError::ReservedFieldName {
                        table: table.name().to_string(),
                        field: name.to_string(),
                    });
                }
            }
            if entities.insert(entity_type.clone(), table).is_some() {
                return Err(SchemaError::DuplicateEntity(entity_type));
            }
        }

        let mut links = LinkRegistry::new();
        for (parent, child, field, table) in self.links {
            for endpoint in [&parent, &child] {
                if !entities.contains_key(endpoint) {
                    return Err(SchemaError::UnknownLinkEntity(endpoint.clone()));
                }
            }
            check_identifier("link field", &field)?;
            table.validate()?;
            links.insert(parent, child, field, table);
        }

        if let Some(audit) = self.audit.as_ref() {
            audit.validate()?;
        }

        Ok(Schema {
            entities,
            links,
            id_field: self.id_field,
            status_field: self.status_field,
            audit: self.audit,
        })
    }
}

pub(crate) fn check_identifier(context: &'static str, value: &str) -> Result<(), SchemaError> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            context,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldDef, FieldType, LinkTableDef, Schema, SchemaError, TableDef};

    fn doc_table() -> TableDef {
        TableDef::new("doc", "doc")
            .field(FieldDef::text("_id", "doc_id"))
            .field(FieldDef::text("status", "doc_status"))
    }

    #[test]
    fn build_rejects_invalid_identifiers() {
        let table = TableDef::new("bad", "bad table").field(FieldDef::text("_id", "id"));
        let err = Schema::builder().entity("Bad", table).build().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { context: "table", .. }));
    }

    #[test]
    fn build_requires_identity_field() {
        let table = TableDef::new("doc", "doc").field(FieldDef::text("name", "doc_name"));
        let err = Schema::builder().entity("Doc", table).build().unwrap_err();
        assert!(matches!(err, SchemaError::MissingIdField { .. }));
    }

    #[test]
    fn build_rejects_encrypted_non_text_fields() {
        let table = doc_table().field(FieldDef::integer("amount", "doc_amount").encrypted());
        let err = Schema::builder().entity("Doc", table).build().unwrap_err();
        assert!(matches!(err, SchemaError::EncryptedNonText { .. }));
    }

    #[test]
    fn build_rejects_reserved_parameter_names() {
        let table = doc_table().field(FieldDef::text("recordId", "doc_record"));
        let err = Schema::builder().entity("Doc", table).build().unwrap_err();
        assert!(matches!(err, SchemaError::ReservedFieldName { .. }));
    }

    #[test]
    fn build_rejects_links_to_undeclared_entities() {
        let err = Schema::builder()
            .entity("Doc", doc_table())
            .link("Doc", "children", "Missing", LinkTableDef::new("doc_lnk", "p", "c"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownLinkEntity(name) if name == "Missing"));
    }

    #[test]
    fn status_field_applies_only_to_tables_declaring_it() {
        let plain = TableDef::new("plain", "plain").field(FieldDef::new("_id", "id", FieldType::Any));
        let schema = Schema::builder()
            .entity("Doc", doc_table())
            .entity("Plain", plain)
            .build()
            .unwrap();
        assert_eq!(schema.status_field_of(schema.entity("Doc").unwrap()), Some("status"));
        assert_eq!(schema.status_field_of(schema.entity("Plain").unwrap()), None);
    }
}
