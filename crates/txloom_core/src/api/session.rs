//! Per-session state shared by the read path and transaction scopes.
//!
//! # Invariants
//! - Reads from a session without an open transaction wait on the database
//!   transaction gate, so they never observe another session's uncommitted
//!   rows.
//! - Reads a session issues while its own transaction is open are recorded
//!   on that transaction's scope and evicted if it rolls back.

use futures::future::{FutureExt, LocalBoxFuture};
use log::debug;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use super::config::DataApiConfig;
use super::tx::TxScope;
use crate::db::Database;
use crate::error::{DataError, DataResult};
use crate::loader::{BatchFn, BatchLoader};
use crate::schema::TableDef;
use crate::sql::{build_select, Expr, Params, SelectShape, RECORD_ID_PARAM};
use crate::value::{Record, RecordId};

pub(crate) type EntityLoader = BatchLoader<RecordId, Record, EntityFetch>;

/// Scope of the transaction this session currently has open, if any.
type ActiveScope = Rc<RefCell<Option<Rc<TxScope>>>>;

/// Batch fetch of one entity type by identity.
pub(crate) struct EntityFetch {
    db: Rc<Database>,
    config: Rc<DataApiConfig>,
    entity: String,
    active: ActiveScope,
}

impl EntityFetch {
    fn fetch(&self, ids: &[RecordId]) -> DataResult<HashMap<RecordId, Record>> {
        let schema = self.config.schema();
        let table = schema
            .entity(&self.entity)
            .ok_or_else(|| DataError::UnknownEntity(self.entity.clone()))?;
        let id_field = schema.id_field();

        let mut params = self.config.key_params(table);
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let name = format!("__id{index}");
                params.insert(name.clone(), id.as_str());
                Expr::param(name)
            })
            .collect();
        let shape = SelectShape::new().filter(Expr::field(id_field).in_list(placeholders));
        let query = build_select(table, &shape)?;
        let rows = self.db.any(&query, &params)?;
        debug!(
            "event=batch_load module=data_api status=ok entity={} keys={} rows={}",
            self.entity,
            ids.len(),
            rows.len()
        );

        Ok(rows
            .into_iter()
            .filter_map(|row| row.id(id_field).map(|id| (id, row)))
            .collect())
    }
}

impl BatchFn<RecordId, Record> for EntityFetch {
    type Error = Arc<DataError>;

    fn load_batch<'a>(
        &'a self,
        keys: &'a [RecordId],
    ) -> LocalBoxFuture<'a, Result<HashMap<RecordId, Record>, Self::Error>> {
        async move {
            let scope = self.active.borrow().clone();
            match scope {
                Some(scope) => {
                    for key in keys {
                        scope.touch(&self.entity, key);
                    }
                    self.fetch(keys).map_err(Arc::new)
                }
                None => {
                    let _gate = self.db.exclusive().await;
                    self.fetch(keys).map_err(Arc::new)
                }
            }
        }
        .boxed_local()
    }
}

/// Database, configuration and one loader per entity type.
pub(crate) struct Session {
    pub(crate) db: Rc<Database>,
    pub(crate) config: Rc<DataApiConfig>,
    loaders: BTreeMap<String, EntityLoader>,
    active: ActiveScope,
}

impl Session {
    pub(crate) fn new(db: Rc<Database>, config: Rc<DataApiConfig>) -> Self {
        let active: ActiveScope = Rc::new(RefCell::new(None));
        let loaders = config
            .schema()
            .entity_types()
            .map(|entity| {
                let fetch = EntityFetch {
                    db: Rc::clone(&db),
                    config: Rc::clone(&config),
                    entity: entity.to_string(),
                    active: Rc::clone(&active),
                };
                (entity.to_string(), BatchLoader::new(fetch))
            })
            .collect();
        Self {
            db,
            config,
            loaders,
            active,
        }
    }

    /// Scope of this session's open transaction.
    pub(crate) fn active_scope(&self) -> Option<Rc<TxScope>> {
        self.active.borrow().clone()
    }

    pub(crate) fn enter(&self, scope: Rc<TxScope>) {
        *self.active.borrow_mut() = Some(scope);
    }

    pub(crate) fn leave(&self) {
        self.active.borrow_mut().take();
    }

    pub(crate) fn table(&self, entity: &str) -> DataResult<&TableDef> {
        self.config
            .schema()
            .entity(entity)
            .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))
    }

    pub(crate) fn loader(&self, entity: &str) -> DataResult<&EntityLoader> {
        self.loaders
            .get(entity)
            .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))
    }

    /// `<id field> = :recordId`
    pub(crate) fn id_filter(&self) -> Expr {
        Expr::field(self.config.schema().id_field()).equals(Expr::param(RECORD_ID_PARAM))
    }

    /// Key parameters plus `recordId`.
    pub(crate) fn id_params(&self, table: &TableDef, id: &str) -> Params {
        self.config.key_params(table).with(RECORD_ID_PARAM, id)
    }

    /// Point select by identity, bypassing the loader.
    pub(crate) fn select_by_id(&self, table: &TableDef, id: &str) -> DataResult<Option<Record>> {
        let query = build_select(table, &SelectShape::new().filter(self.id_filter()))?;
        Ok(self.db.one_or_none(&query, &self.id_params(table, id))?)
    }

    pub(crate) fn prime(&self, entity: &str, id: &str, record: &Record) {
        if let Some(loader) = self.loaders.get(entity) {
            loader.prime(id.to_string(), record.clone());
        }
    }

    pub(crate) fn evict(&self, entity: &str, id: &str) {
        if let Some(loader) = self.loaders.get(entity) {
            loader.clear(&id.to_string());
        }
    }
}
