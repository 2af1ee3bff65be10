//! JSON schema manifest.
//!
//! Lets a service and the CLI share one declaration file:
//!
//! ```json
//! {
//!   "idField": "_id",
//!   "statusField": "status",
//!   "entities": {
//!     "Tst": {
//!       "table": "tst",
//!       "fields": [{ "name": "_id", "column": "tst_id", "type": "text" }],
//!       "computed": []
//!     }
//!   },
//!   "links": [],
//!   "audit": {}
//! }
//! ```
//!
//! `statusField: false` disables soft deletes. An absent `audit` disables the
//! trail; `{}` selects the default layout.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::link::LinkTableDef;
use super::{
    ComputedField, FieldDef, FieldType, Schema, SchemaError, TableDef, DEFAULT_ID_FIELD,
    DEFAULT_STATUS_FIELD,
};
use crate::audit::{default_detail, default_header, AuditTables};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SchemaManifest {
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub status_field: Option<StatusFieldSpec>,
    #[serde(default)]
    pub entities: BTreeMap<String, ManifestTable>,
    #[serde(default)]
    pub links: Vec<ManifestLink>,
    #[serde(default)]
    pub audit: Option<ManifestAudit>,
}

/// `"statusField"` is either a field name or a boolean switch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StatusFieldSpec {
    Name(String),
    Enabled(bool),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestTable {
    pub table: String,
    #[serde(default)]
    pub fields: Vec<ManifestField>,
    #[serde(default)]
    pub computed: Vec<ManifestComputed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestField {
    pub name: String,
    pub column: String,
    #[serde(rename = "type", default)]
    pub kind: FieldType,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestComputed {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FieldType,
    pub sql: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestLink {
    pub parent: String,
    pub field: String,
    pub child: String,
    pub table: String,
    pub parent_column: String,
    pub child_column: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestAudit {
    #[serde(default)]
    pub header: Option<ManifestTable>,
    #[serde(default)]
    pub detail: Option<ManifestTable>,
}

impl ManifestTable {
    fn into_table_def(self, name: &str) -> TableDef {
        let mut table = TableDef::new(name, self.table);
        for field in self.fields {
            let mut def = FieldDef::new(field.name, field.column, field.kind);
            def.encrypted = field.encrypted;
            def.required = field.required;
            table = table.field(def);
        }
        for computed in self.computed {
            table = table.computed(ComputedField::new(computed.name, computed.kind, computed.sql));
        }
        table
    }
}

impl SchemaManifest {
    pub fn from_json_str(raw: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Audit tables declared by the manifest, if the trail is enabled.
    pub fn audit_tables(&self) -> Option<AuditTables> {
        self.audit.clone().map(|audit| {
            let header = audit.header.map_or_else(default_header, |table| {
                let name = table.table.clone();
                table.into_table_def(&name)
            });
            let detail = audit.detail.map_or_else(default_detail, |table| {
                let name = table.table.clone();
                table.into_table_def(&name)
            });
            AuditTables::new(header, detail)
        })
    }

    /// Validates the declarations into a `Schema`.
    pub fn into_schema(self) -> Result<Schema, SchemaError> {
        let audit = self.audit_tables();
        let status_field = match &self.status_field {
            None | Some(StatusFieldSpec::Enabled(true)) => Some(DEFAULT_STATUS_FIELD),
            Some(StatusFieldSpec::Enabled(false)) => None,
            Some(StatusFieldSpec::Name(name)) => Some(name.as_str()),
        };

        let mut builder = Schema::builder()
            .id_field(self.id_field.as_deref().unwrap_or(DEFAULT_ID_FIELD))
            .status_field(status_field);
        for (entity_type, table) in self.entities {
            let def = table.into_table_def(&entity_type);
            builder = builder.entity(entity_type, def);
        }
        for link in self.links {
            builder = builder.link(
                link.parent,
                link.field,
                link.child,
                LinkTableDef::new(link.table, link.parent_column, link.child_column),
            );
        }
        if let Some(audit) = audit {
            builder = builder.audit(audit);
        }
        builder.build()
    }
}
