//! Transaction-scoped write API.
//!
//! # Responsibility
//! - Run insert/update/delete and link mutations inside the open transaction.
//! - Append one change-detail row per mutation and reprime the session cache.
//!
//! # Invariants
//! - Every successful mutation appends exactly one change-detail row (when
//!   the audit trail is enabled) referencing this scope's log id.
//! - The cache is primed only after the corresponding statement returned.
//! - After the transaction finishes, every call fails with `TransactionClosed`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::session::Session;
use crate::audit::{insert_change, ChangeRow, NO_TRANSACTION_LOG_ID};
use crate::codec::{audit_payload, strip_nulls};
use crate::error::{DataError, DataResult};
use crate::model::change::{ChangeKind, LinkChange};
use crate::model::status::RecordStatus;
use crate::schema::link::{LINK_CHILD_FIELD, LINK_PARENT_FIELD};
use crate::schema::TableDef;
use crate::sql::{build_delete, build_insert, build_update, parametrize, Expr, Params};
use crate::value::{Record, RecordId, Value};

/// Bookkeeping of one `tx` call.
pub(crate) struct TxScope {
    log_id: RecordId,
    open: Cell<bool>,
    changes: Cell<usize>,
    touched: RefCell<Vec<(String, RecordId)>>,
}

impl TxScope {
    pub(crate) fn new(log_id: RecordId) -> Self {
        Self {
            log_id,
            open: Cell::new(true),
            changes: Cell::new(0),
            touched: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn log_id(&self) -> &str {
        &self.log_id
    }

    pub(crate) fn close(&self) {
        self.open.set(false);
    }

    /// Mutations whose statement and detail row both succeeded.
    pub(crate) fn changes(&self) -> usize {
        self.changes.get()
    }

    fn record_change(&self) {
        self.changes.set(self.changes.get() + 1);
    }

    /// Remembers a cache key to evict if the transaction rolls back.
    pub(crate) fn touch(&self, entity: &str, id: &str) {
        self.touched
            .borrow_mut()
            .push((entity.to_string(), id.to_string()));
    }

    /// Cache keys primed or cleared during the transaction.
    pub(crate) fn take_touched(&self) -> Vec<(String, RecordId)> {
        std::mem::take(&mut *self.touched.borrow_mut())
    }
}

/// Write access handed to a `tx` body.
///
/// Cheap to clone; all clones share the same transaction.
#[derive(Clone)]
pub struct TxApi {
    session: Rc<Session>,
    scope: Rc<TxScope>,
}

impl TxApi {
    pub(crate) fn new(session: Rc<Session>, scope: Rc<TxScope>) -> Self {
        Self { session, scope }
    }

    /// Id of this transaction's log header (a fixed marker when auditing is off).
    pub fn log_id(&self) -> &str {
        self.scope.log_id()
    }

    /// Reads one record inside the transaction, seeing its own writes.
    pub async fn in_tx_get_record(&self, entity: &str, id: &str) -> DataResult<Record> {
        self.ensure_open()?;
        let table = self.session.table(entity)?;
        let row = self
            .session
            .select_by_id(table, id)?
            .ok_or_else(|| DataError::not_found(entity, id))?;
        self.prime(entity, id, &row);
        Ok(row)
    }

    /// Inserts one record and returns the stored row.
    ///
    /// Assigns the identity (unless supplied) and the `ACTIVE` status (when
    /// the entity has a status field and none was supplied).
    pub async fn insert_record(&self, entity: &str, data: Record) -> DataResult<Record> {
        self.ensure_open()?;
        let session = &self.session;
        let schema = session.config.schema();
        let table = session.table(entity)?;
        check_writable(entity, table, &data)?;

        let mut data = data;
        if let Some(status) = schema.status_field_of(table) {
            if data.get(status).map_or(true, Value::is_null) {
                data.insert(status, RecordStatus::Active);
            }
        }
        let id_field = schema.id_field();
        if data.get(id_field).map_or(true, Value::is_null) {
            match session.config.next_id() {
                Some(id) => {
                    data.insert(id_field, id);
                }
                None => {
                    data.remove(id_field);
                }
            }
        }
        check_required(entity, table, id_field, &data)?;

        let query = build_insert(table, &parametrize(&data), true)?;
        let mut params = session.config.key_params(table);
        params.extend(&Params::from(data));
        let inserted = session
            .db
            .one_or_none(&query, &params)?
            .ok_or_else(|| insert_failed(entity))?;
        let id = inserted.id(id_field).ok_or_else(|| insert_failed(entity))?;
        let row = self.with_computed(entity, table, &id, inserted)?;

        self.log_change(entity, &id, ChangeKind::Insert, audit_payload(&row))?;
        self.prime(entity, &id, &row);
        Ok(row)
    }

    /// Applies a partial update and returns the updated row.
    ///
    /// Null-valued fields are dropped first, so a field cannot be cleared
    /// through this path.
    pub async fn update_record(&self, entity: &str, id: &str, data: Record) -> DataResult<Record> {
        self.ensure_open()?;
        let table = self.session.table(entity)?;
        let id_field = self.session.config.schema().id_field();
        let mut data = strip_nulls(data);
        check_writable(entity, table, &data)?;

        if let Some(new_id) = data.remove(id_field) {
            if new_id.to_id().as_deref() != Some(id) {
                return Err(DataError::ImmutableField {
                    entity: entity.to_string(),
                    field: id_field.to_string(),
                });
            }
        }

        let row = if data.is_empty() {
            self.session
                .select_by_id(table, id)?
                .ok_or_else(|| DataError::not_found(entity, id))?
        } else {
            self.update_by_id(entity, table, id, data)?
                .ok_or_else(|| DataError::not_found(entity, id))?
        };

        self.log_change(entity, id, ChangeKind::Update, audit_payload(&row))?;
        self.prime(entity, id, &row);
        Ok(row)
    }

    /// Soft-deletes (status `DELETED`) when the entity has a status field,
    /// otherwise removes the row. Returns the row as logged.
    pub async fn delete_record(&self, entity: &str, id: &str) -> DataResult<Record> {
        self.ensure_open()?;
        let session = &self.session;
        let table = session.table(entity)?;

        if let Some(status) = session.config.schema().status_field_of(table) {
            let data = Record::new().with(status, RecordStatus::Deleted);
            let row = self
                .update_by_id(entity, table, id, data)?
                .ok_or_else(|| DataError::not_found(entity, id))?;
            self.log_change(entity, id, ChangeKind::Delete, audit_payload(&row))?;
            self.prime(entity, id, &row);
            return Ok(row);
        }

        let existing = session
            .select_by_id(table, id)?
            .ok_or_else(|| DataError::not_found(entity, id))?;
        let query = build_delete(table, &session.id_filter())?;
        let removed = session.db.none(&query, &session.id_params(table, id))?;
        if removed == 0 {
            return Err(DataError::MutationFailed {
                entity: entity.to_string(),
                operation: "delete",
            });
        }
        self.log_change(entity, id, ChangeKind::Delete, audit_payload(&existing))?;
        self.evict(entity, id);
        Ok(existing)
    }

    /// Adds the `parent.field -> child` edge and returns the refreshed parent.
    pub async fn add_link(
        &self,
        parent_type: &str,
        parent_id: &str,
        field: &str,
        child_type: &str,
        child_id: &str,
    ) -> DataResult<Record> {
        self.ensure_open()?;
        let link = self
            .session
            .config
            .schema()
            .links()
            .resolve(parent_type, child_type, field)?;
        let edge = edge_params(parent_id, child_id);
        let query = build_insert(link.table_def(), &parametrize(&edge), false)?;
        self.session.db.none(&query, &Params::from(edge))?;
        self.finish_link(
            ChangeKind::AddLink,
            LinkChange {
                parent_type: parent_type.to_string(),
                parent_id: parent_id.to_string(),
                parent_field: field.to_string(),
                child_type: child_type.to_string(),
                child_id: child_id.to_string(),
            },
        )
    }

    /// Removes the `parent.field -> child` edge and returns the refreshed
    /// parent. Removing an absent edge is not an error.
    pub async fn remove_link(
        &self,
        parent_type: &str,
        parent_id: &str,
        field: &str,
        child_type: &str,
        child_id: &str,
    ) -> DataResult<Record> {
        self.ensure_open()?;
        let link = self
            .session
            .config
            .schema()
            .links()
            .resolve(parent_type, child_type, field)?;
        let filter = Expr::and(vec![
            Expr::field(LINK_PARENT_FIELD).equals(Expr::param(LINK_PARENT_FIELD)),
            Expr::field(LINK_CHILD_FIELD).equals(Expr::param(LINK_CHILD_FIELD)),
        ]);
        let query = build_delete(link.table_def(), &filter)?;
        self.session
            .db
            .none(&query, &Params::from(edge_params(parent_id, child_id)))?;
        self.finish_link(
            ChangeKind::RemoveLink,
            LinkChange {
                parent_type: parent_type.to_string(),
                parent_id: parent_id.to_string(),
                parent_field: field.to_string(),
                child_type: child_type.to_string(),
                child_id: child_id.to_string(),
            },
        )
    }

    fn finish_link(&self, kind: ChangeKind, change: LinkChange) -> DataResult<Record> {
        let table = self.session.table(&change.parent_type)?;
        let parent = self
            .session
            .select_by_id(table, &change.parent_id)?
            .ok_or_else(|| DataError::not_found(&change.parent_type, &change.parent_id))?;
        self.log_change(
            &change.parent_type,
            &change.parent_id,
            kind,
            Value::from(change.to_record()),
        )?;
        self.prime(&change.parent_type, &change.parent_id, &parent);
        Ok(parent)
    }

    fn update_by_id(
        &self,
        entity: &str,
        table: &TableDef,
        id: &str,
        data: Record,
    ) -> DataResult<Option<Record>> {
        let session = &self.session;
        let query = build_update(table, &parametrize(&data), &session.id_filter(), true)?;
        let mut params = session.id_params(table, id);
        params.extend(&Params::from(data));
        match session.db.one_or_none(&query, &params)? {
            Some(updated) => Ok(Some(self.with_computed(entity, table, id, updated)?)),
            None => Ok(None),
        }
    }

    /// RETURNING only carries stored fields; re-read when computed ones exist.
    fn with_computed(
        &self,
        entity: &str,
        table: &TableDef,
        id: &str,
        stored: Record,
    ) -> DataResult<Record> {
        if table.computed_fields().is_empty() {
            return Ok(stored);
        }
        self.session
            .select_by_id(table, id)?
            .ok_or_else(|| DataError::MutationFailed {
                entity: entity.to_string(),
                operation: "reload",
            })
    }

    /// Appends one change-detail row; returns its id, or the marker id when
    /// auditing is off.
    fn log_change(
        &self,
        entity: &str,
        id: &str,
        kind: ChangeKind,
        payload: Value,
    ) -> DataResult<RecordId> {
        let config = &self.session.config;
        let detail_id = match config.schema().audit() {
            Some(tables) => {
                let detail_id = config.audit_row_id();
                insert_change(
                    &self.session.db,
                    tables,
                    &detail_id,
                    ChangeRow {
                        tx_log_id: self.scope.log_id(),
                        record_type: entity,
                        record_id: id,
                        kind,
                        payload,
                    },
                )?;
                detail_id
            }
            None => NO_TRANSACTION_LOG_ID.to_string(),
        };
        self.scope.record_change();
        Ok(detail_id)
    }

    fn ensure_open(&self) -> DataResult<()> {
        if self.scope.open.get() {
            Ok(())
        } else {
            Err(DataError::TransactionClosed)
        }
    }

    fn prime(&self, entity: &str, id: &str, row: &Record) {
        self.session.prime(entity, id, row);
        self.touch(entity, id);
    }

    fn evict(&self, entity: &str, id: &str) {
        self.session.evict(entity, id);
        self.touch(entity, id);
    }

    fn touch(&self, entity: &str, id: &str) {
        self.scope.touch(entity, id);
    }
}

fn edge_params(parent_id: &str, child_id: &str) -> Record {
    Record::new()
        .with(LINK_PARENT_FIELD, parent_id)
        .with(LINK_CHILD_FIELD, child_id)
}

fn insert_failed(entity: &str) -> DataError {
    DataError::InsertFailed {
        entity: entity.to_string(),
    }
}

/// Rejects fields the entity does not store.
fn check_writable(entity: &str, table: &TableDef, data: &Record) -> DataResult<()> {
    for field in data.fields() {
        if table.has_field(field) {
            continue;
        }
        return Err(if table.computed_def(field).is_some() {
            DataError::ReadOnlyField {
                entity: entity.to_string(),
                field: field.to_string(),
            }
        } else {
            DataError::UnknownField {
                entity: entity.to_string(),
                field: field.to_string(),
            }
        });
    }
    Ok(())
}

fn check_required(entity: &str, table: &TableDef, id_field: &str, data: &Record) -> DataResult<()> {
    let missing = table
        .fields()
        .iter()
        .filter(|field| field.required && field.name != id_field)
        .find(|field| data.get(&field.name).map_or(true, Value::is_null));
    match missing {
        Some(field) => Err(DataError::MissingField {
            entity: entity.to_string(),
            field: field.name.clone(),
        }),
        None => Ok(()),
    }
}
