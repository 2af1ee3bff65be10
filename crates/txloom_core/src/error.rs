//! Error taxonomy of the data API.

use std::sync::Arc;
use thiserror::Error;

use crate::db::DbError;
use crate::schema::{LinkConfigError, SchemaError};
use crate::sql::SqlBuildError;
use crate::value::RecordId;

pub type DataResult<T> = Result<T, DataError>;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: String, id: RecordId },
    #[error("unknown entity type `{0}`")]
    UnknownEntity(String),
    /// Link relation or field not declared.
    #[error(transparent)]
    Link(#[from] LinkConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("insert into {entity} returned no row")]
    InsertFailed { entity: String },
    #[error("{operation} on {entity} returned no row")]
    MutationFailed {
        entity: String,
        operation: &'static str,
    },
    #[error("{entity} has no field `{field}`")]
    UnknownField { entity: String, field: String },
    #[error("{entity}.{field} is computed and cannot be written")]
    ReadOnlyField { entity: String, field: String },
    #[error("{entity}.{field} is required")]
    MissingField { entity: String, field: String },
    #[error("{entity}.{field} cannot be changed once assigned")]
    ImmutableField { entity: String, field: String },
    #[error(transparent)]
    Query(#[from] SqlBuildError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("cannot serialize operation descriptor: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Whole-batch failure shared by every load in that batch.
    #[error(transparent)]
    Batch(Arc<DataError>),
    #[error("transaction already finished")]
    TransactionClosed,
}

impl DataError {
    pub(crate) fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Stable short code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::UnknownEntity(_) => "unknown_entity",
            Self::Link(_) => "link_config",
            Self::Schema(_) => "schema",
            Self::InsertFailed { .. } => "insert_failed",
            Self::MutationFailed { .. } => "mutation_failed",
            Self::UnknownField { .. } => "unknown_field",
            Self::ReadOnlyField { .. } => "read_only_field",
            Self::MissingField { .. } => "missing_field",
            Self::ImmutableField { .. } => "immutable_field",
            Self::Query(_) => "query_build",
            Self::Db(_) => "db",
            Self::Serialization(_) => "serialization",
            Self::Batch(inner) => inner.code(),
            Self::TransactionClosed => "transaction_closed",
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Batch(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// True for undeclared entities or link relations.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::UnknownEntity(_) | Self::Link(_) | Self::Schema(_) => true,
            Self::Batch(inner) => inner.is_configuration(),
            _ => false,
        }
    }
}
