//! Session-bound data API: batched reads and audited transactions.
//!
//! # Responsibility
//! - Route point reads through per-entity batching loaders.
//! - Run bulk selects that prime those loaders.
//! - Open audited transactions and hand their bodies a `TxApi`.
//!
//! # Invariants
//! - Loaders live exactly as long as the `DataApi` that created them.
//! - A rolled-back transaction leaves no cache entry it primed or cleared.
//! - A transaction either commits its header, data and detail rows together
//!   or none of them.
//!
//! All sessions over one `Database` share its single connection. An open
//! transaction holds the database gate until it finishes, so reads and
//! transactions from other sessions wait rather than observe its uncommitted
//! rows. A session that waits on itself from inside its own transaction, by
//! going through a second `DataApi`, never resumes.

pub mod config;
mod session;
pub mod tx;

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::future::Future;
use std::rc::Rc;
use std::time::Instant;

use crate::audit::{insert_header, AuditLog, NO_TRANSACTION_LOG_ID};
use crate::codec::deescape_from_json;
use crate::db::Database;
use crate::error::{DataError, DataResult};
use crate::loader::LoadError;
use crate::sql::{build_select, Params, SelectShape};
use crate::value::{Record, RecordId};
use session::Session;
use tx::TxScope;

pub use config::{random_id, DataApiConfig, IdStrategy, DEFAULT_ENCRYPTION_KEY};
pub use tx::TxApi;

/// One API session; create one per request.
pub struct DataApi {
    session: Rc<Session>,
}

impl DataApi {
    pub fn new(db: Rc<Database>, config: Rc<DataApiConfig>) -> Self {
        Self {
            session: Rc::new(Session::new(db, config)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.session.db
    }

    pub fn config(&self) -> &DataApiConfig {
        &self.session.config
    }

    /// Reader over the configured audit tables, if auditing is enabled.
    pub fn audit_log(&self) -> Option<AuditLog<'_>> {
        self.session
            .config
            .schema()
            .audit()
            .map(|tables| AuditLog::new(&self.session.db, tables.clone()))
    }

    /// Loads one record; loads issued in the same tick share one SELECT.
    pub async fn get_record(&self, entity: &str, id: &str) -> DataResult<Record> {
        let loader = self.session.loader(entity)?;
        loader
            .load(id.to_string())
            .await
            .map_err(|err| load_error(entity, id, err))
    }

    /// Loads several records in one batch; results keep the order of `ids`.
    pub async fn get_records(&self, entity: &str, ids: &[RecordId]) -> DataResult<Vec<DataResult<Record>>> {
        let loader = self.session.loader(entity)?;
        let loaded = loader.load_many(ids.to_vec()).await;
        Ok(ids
            .iter()
            .zip(loaded)
            .map(|(id, result)| result.map_err(|err| load_error(entity, id, err)))
            .collect())
    }

    /// Selects every row matching `shape` (all rows when `None`) and primes
    /// the loader with each one.
    pub async fn bulk_select(
        &self,
        entity: &str,
        shape: Option<SelectShape>,
        params: Params,
    ) -> DataResult<Vec<Record>> {
        let session = &self.session;
        let table = session.table(entity)?;
        let query = build_select(table, &shape.unwrap_or_default())?;
        let mut bound = params;
        bound.extend(&session.config.key_params(table));

        let scope = session.active_scope();
        let rows = match &scope {
            Some(_) => session.db.any(&query, &bound)?,
            None => {
                let _gate = session.db.exclusive().await;
                session.db.any(&query, &bound)?
            }
        };

        let id_field = session.config.schema().id_field();
        for row in &rows {
            if let Some(id) = row.id(id_field) {
                if let Some(scope) = &scope {
                    scope.touch(entity, &id);
                }
                session.prime(entity, &id, row);
            }
        }
        Ok(rows)
    }

    /// Runs `body` inside one audited database transaction.
    ///
    /// The header row (when auditing is on) is written before `body` runs;
    /// any error from `body` rolls back the header, data and detail rows.
    /// Waits for a transaction another session has open on the same
    /// database. Opening one from inside this session's own transaction
    /// fails with a database error.
    pub async fn tx<T, Op, F, Fut>(&self, operation: &Op, body: F) -> DataResult<T>
    where
        Op: Serialize + ?Sized,
        F: FnOnce(TxApi) -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        let started_at = Instant::now();
        let descriptor = deescape_from_json(serde_json::to_value(operation)?);
        let config = Rc::clone(&self.session.config);
        let log_id = if config.schema().audit().is_some() {
            config.audit_row_id()
        } else {
            NO_TRANSACTION_LOG_ID.to_string()
        };
        let scope = Rc::new(TxScope::new(log_id));
        let tx_api = TxApi::new(Rc::clone(&self.session), Rc::clone(&scope));
        let db = Rc::clone(&self.session.db);
        let body_db = Rc::clone(&db);
        let body_scope = Rc::clone(&scope);

        let nested = self.session.active_scope().is_some();
        let _gate = if nested {
            None
        } else {
            let gate = db.exclusive().await;
            self.session.enter(Rc::clone(&scope));
            Some(gate)
        };

        let result = db
            .run_atomic::<T, DataError, _, _>(move || async move {
                if let Some(tables) = config.schema().audit() {
                    insert_header(
                        &body_db,
                        tables,
                        body_scope.log_id(),
                        descriptor,
                        Utc::now(),
                    )?;
                }
                body(tx_api).await
            })
            .await;
        scope.close();
        if !nested {
            self.session.leave();
        }

        match &result {
            Ok(_) => info!(
                "event=tx_commit module=data_api status=ok log_id={} changes={} duration_ms={}",
                scope.log_id(),
                scope.changes(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => {
                for (entity, id) in scope.take_touched() {
                    self.session.evict(&entity, &id);
                }
                warn!(
                    "event=tx_rollback module=data_api status=error log_id={} changes={} duration_ms={} error_code={}",
                    scope.log_id(),
                    scope.changes(),
                    started_at.elapsed().as_millis(),
                    err.code()
                );
            }
        }
        result
    }
}

fn load_error(entity: &str, id: &str, err: LoadError<std::sync::Arc<DataError>>) -> DataError {
    match err {
        LoadError::Missing => DataError::not_found(entity, id),
        LoadError::Batch(inner) => DataError::Batch(inner),
    }
}
