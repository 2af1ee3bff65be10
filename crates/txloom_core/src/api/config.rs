//! Session configuration: schema, identity generation, encryption key.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use uuid::Uuid;

use crate::schema::{Schema, TableDef};
use crate::sql::{Params, ENCRYPTION_KEY_PARAM};
use crate::value::RecordId;

/// Key used when no key source is configured.
pub const DEFAULT_ENCRYPTION_KEY: &str = "NOTSET";
const RANDOM_ID_LEN: usize = 16;

/// How inserts obtain an identity when the caller supplies none.
#[derive(Clone, Default)]
pub enum IdStrategy {
    /// 16 random alphanumeric characters.
    #[default]
    Random,
    /// UUID v4 text.
    Uuid,
    Custom(Rc<dyn Fn() -> RecordId>),
    /// Leave the identity to the database (defaults, rowid aliases).
    Disabled,
}

impl Debug for IdStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => f.write_str("Random"),
            Self::Uuid => f.write_str("Uuid"),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

/// Generates a 16-character alphanumeric id.
pub fn random_id() -> RecordId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_ID_LEN)
        .map(char::from)
        .collect()
}

/// Everything a session needs besides the database.
#[derive(Clone)]
pub struct DataApiConfig {
    schema: Schema,
    id_strategy: IdStrategy,
    encryption_key: Rc<dyn Fn() -> String>,
}

impl Debug for DataApiConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataApiConfig")
            .field("schema", &self.schema)
            .field("id_strategy", &self.id_strategy)
            .finish_non_exhaustive()
    }
}

impl DataApiConfig {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            id_strategy: IdStrategy::default(),
            encryption_key: Rc::new(|| DEFAULT_ENCRYPTION_KEY.to_string()),
        }
    }

    pub fn with_id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Sets the key source; it is called on every statement that needs it.
    pub fn with_encryption_key(mut self, source: impl Fn() -> String + 'static) -> Self {
        self.encryption_key = Rc::new(source);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn id_strategy(&self) -> &IdStrategy {
        &self.id_strategy
    }

    /// Next record identity, or `None` when the database assigns it.
    pub(crate) fn next_id(&self) -> Option<RecordId> {
        match &self.id_strategy {
            IdStrategy::Random => Some(random_id()),
            IdStrategy::Uuid => Some(Uuid::new_v4().to_string()),
            IdStrategy::Custom(generate) => Some(generate()),
            IdStrategy::Disabled => None,
        }
    }

    /// Identity for audit rows, which always need one.
    pub(crate) fn audit_row_id(&self) -> RecordId {
        self.next_id().unwrap_or_else(random_id)
    }

    /// Key parameter for statements touching `table`; empty when it has no
    /// encrypted fields.
    pub(crate) fn key_params(&self, table: &TableDef) -> Params {
        let mut params = Params::new();
        if table.has_encrypted_fields() {
            params.insert(ENCRYPTION_KEY_PARAM, (self.encryption_key)());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::{random_id, DataApiConfig, IdStrategy};
    use crate::schema::{FieldDef, Schema, TableDef};
    use std::rc::Rc;

    fn schema() -> Schema {
        Schema::builder()
            .entity("Doc", TableDef::new("doc", "doc").field(FieldDef::text("_id", "doc_id")))
            .build()
            .unwrap()
    }

    #[test]
    fn random_ids_are_sixteen_alphanumerics() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, random_id());
    }

    #[test]
    fn disabled_strategy_still_yields_audit_ids() {
        let config = DataApiConfig::new(schema()).with_id_strategy(IdStrategy::Disabled);
        assert_eq!(config.next_id(), None);
        assert_eq!(config.audit_row_id().len(), 16);

        let config = DataApiConfig::new(schema())
            .with_id_strategy(IdStrategy::Custom(Rc::new(|| "fixed".to_string())));
        assert_eq!(config.next_id().as_deref(), Some("fixed"));
    }

    #[test]
    fn key_params_only_for_encrypted_tables() {
        let config = DataApiConfig::new(schema()).with_encryption_key(|| "k".to_string());
        let plain = TableDef::new("doc", "doc").field(FieldDef::text("_id", "doc_id"));
        assert!(config.key_params(&plain).is_empty());

        let secret = plain.field(FieldDef::text("name", "doc_name").encrypted());
        let params = config.key_params(&secret);
        assert_eq!(params.get("encryptionKey").and_then(|v| v.as_str()), Some("k"));
    }
}
