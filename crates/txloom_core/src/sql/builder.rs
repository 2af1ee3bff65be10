//! SQL text rendering for SELECT / INSERT / UPDATE / DELETE.
//!
//! # Invariants
//! - Every identifier is double-quoted; every value travels as a named
//!   parameter, never inline.
//! - Encrypted columns are only read through the decrypt function and only
//!   written through the encrypt function, both keyed by `:encryptionKey`.
//! - Result columns are aliased to logical field names.

use std::collections::BTreeSet;
use thiserror::Error;

use super::expr::{Expr, OrderTarget, SelectShape};
use super::params::{Params, ENCRYPTION_KEY_PARAM};
use crate::db::crypto::{DECRYPT_FN, ENCRYPT_FN};
use crate::schema::{FieldDef, FieldType, TableDef};

/// Errors raised while rendering a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlBuildError {
    #[error("unknown field `{field}` on table `{table}`")]
    UnknownField { table: String, field: String },
    #[error("update of table `{table}` has no assignments")]
    NoAssignments { table: String },
}

/// Rendered statement plus what the executor needs to bind and decode it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    /// Parameters generated from inline literals.
    pub bound: Params,
    /// Result column aliases with their decode type.
    pub columns: Vec<(String, FieldType)>,
    /// Parameters written into JSON columns; bound as escaped JSON text.
    pub json_params: BTreeSet<String>,
}

impl BuiltQuery {
    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, kind)| *kind)
    }
}

struct Renderer<'t> {
    table: &'t TableDef,
    qualify: bool,
    bound: Params,
    json_params: BTreeSet<String>,
    next_literal: usize,
}

impl<'t> Renderer<'t> {
    fn new(table: &'t TableDef, qualify: bool) -> Self {
        Self {
            table,
            qualify,
            bound: Params::new(),
            json_params: BTreeSet::new(),
            next_literal: 0,
        }
    }

    fn finish(self, sql: String, columns: Vec<(String, FieldType)>) -> BuiltQuery {
        BuiltQuery {
            sql,
            bound: self.bound,
            columns,
            json_params: self.json_params,
        }
    }

    fn unknown(&self, field: &str) -> SqlBuildError {
        SqlBuildError::UnknownField {
            table: self.table.name().to_string(),
            field: field.to_string(),
        }
    }

    fn column(&self, field: &FieldDef) -> String {
        if self.qualify {
            format!("{}.{}", quote_ident(self.table.table()), quote_ident(&field.column))
        } else {
            quote_ident(&field.column)
        }
    }

    /// Readable form of a stored field, decrypting when needed.
    fn read_field(&self, field: &FieldDef) -> String {
        let column = self.column(field);
        if field.encrypted {
            format!("{DECRYPT_FN}({column}, :{ENCRYPTION_KEY_PARAM})")
        } else {
            column
        }
    }

    fn field(&self, name: &str) -> Result<String, SqlBuildError> {
        if let Some(field) = self.table.field_def(name) {
            return Ok(self.read_field(field));
        }
        if let Some(computed) = self.table.computed_def(name) {
            return Ok(format!("({})", computed.sql));
        }
        Err(self.unknown(name))
    }

    fn literal(&mut self, value: &crate::value::Value) -> String {
        let name = format!("__lit{}", self.next_literal);
        self.next_literal += 1;
        if value.is_composite() {
            self.json_params.insert(name.clone());
        }
        self.bound.insert(name.clone(), value.clone());
        format!(":{name}")
    }

    fn expr(&mut self, expr: &Expr) -> Result<String, SqlBuildError> {
        Ok(match expr {
            Expr::Field(name) => self.field(name)?,
            Expr::Param(name) => format!(":{name}"),
            Expr::Literal(value) => self.literal(value),
            Expr::Raw(sql) => sql.clone(),
            Expr::Compare(left, op, right) => {
                let left = self.expr(left)?;
                let right = self.expr(right)?;
                format!("({left} {} {right})", op.as_sql())
            }
            Expr::In(target, items) => {
                let target = self.expr(target)?;
                let items = self.list(items, ", ")?;
                format!("({target} IN ({items}))")
            }
            Expr::And(parts) if parts.is_empty() => "1".to_string(),
            Expr::And(parts) => format!("({})", self.list(parts, " AND ")?),
            Expr::Or(parts) if parts.is_empty() => "0".to_string(),
            Expr::Or(parts) => format!("({})", self.list(parts, " OR ")?),
            Expr::Not(inner) => format!("(NOT {})", self.expr(inner)?),
            Expr::IsNull(inner) => format!("({} IS NULL)", self.expr(inner)?),
        })
    }

    fn list(&mut self, items: &[Expr], separator: &str) -> Result<String, SqlBuildError> {
        let rendered = items
            .iter()
            .map(|item| self.expr(item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rendered.join(separator))
    }

    /// Renders the value written into `field`, tracking JSON parameters.
    fn write_value(&mut self, field: &FieldDef, value: &Expr) -> Result<String, SqlBuildError> {
        if field.kind == FieldType::Json {
            if let Expr::Param(name) = value {
                self.json_params.insert(name.clone());
            }
        }
        let rendered = self.expr(value)?;
        Ok(if field.encrypted {
            format!("{ENCRYPT_FN}({rendered}, :{ENCRYPTION_KEY_PARAM})")
        } else {
            rendered
        })
    }

    fn writable(&self, name: &str) -> Result<&'t FieldDef, SqlBuildError> {
        self.table.field_def(name).ok_or_else(|| self.unknown(name))
    }

    /// Stored fields as `expr AS "name"` plus their decode types.
    fn stored_columns(&self) -> (Vec<String>, Vec<(String, FieldType)>) {
        self.table
            .fields()
            .iter()
            .map(|field| {
                (
                    format!("{} AS {}", self.read_field(field), quote_ident(&field.name)),
                    (field.name.clone(), field.kind),
                )
            })
            .unzip()
    }

    fn returning(&self, returning: bool) -> (String, Vec<(String, FieldType)>) {
        if !returning {
            return (String::new(), Vec::new());
        }
        let (columns, decode) = self.stored_columns();
        (format!(" RETURNING {}", columns.join(", ")), decode)
    }
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders a SELECT of every stored and computed field of `table`.
pub fn build_select(table: &TableDef, shape: &SelectShape) -> Result<BuiltQuery, SqlBuildError> {
    let mut renderer = Renderer::new(table, true);
    let (mut columns, mut decode) = renderer.stored_columns();
    for computed in table.computed_fields() {
        columns.push(format!("({}) AS {}", computed.sql, quote_ident(&computed.name)));
        decode.push((computed.name.clone(), computed.kind));
    }

    let mut sql = format!(
        "SELECT {}{} FROM {}",
        if shape.distinct { "DISTINCT " } else { "" },
        columns.join(", "),
        quote_ident(table.table())
    );
    if let Some(filter) = shape.filter.as_ref() {
        let filter = renderer.expr(filter)?;
        sql.push_str(&format!(" WHERE {filter}"));
    }
    if !shape.order_by.is_empty() {
        let mut terms = Vec::with_capacity(shape.order_by.len());
        for term in &shape.order_by {
            let target = match &term.target {
                OrderTarget::Field(name) => renderer.field(name)?,
                OrderTarget::Raw(sql) => sql.clone(),
            };
            terms.push(format!("{target} {}", if term.descending { "DESC" } else { "ASC" }));
        }
        sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
    }
    if let Some(max_rows) = shape.max_rows {
        sql.push_str(&format!(" LIMIT {max_rows}"));
    }

    Ok(renderer.finish(sql, decode))
}

/// Renders an INSERT; with `returning`, every stored field comes back.
pub fn build_insert(
    table: &TableDef,
    assignments: &[(String, Expr)],
    returning: bool,
) -> Result<BuiltQuery, SqlBuildError> {
    let mut renderer = Renderer::new(table, false);
    let mut sql = format!("INSERT INTO {}", quote_ident(table.table()));
    if assignments.is_empty() {
        sql.push_str(" DEFAULT VALUES");
    } else {
        let mut columns = Vec::with_capacity(assignments.len());
        let mut values = Vec::with_capacity(assignments.len());
        for (name, value) in assignments {
            let field = renderer.writable(name)?;
            columns.push(quote_ident(&field.column));
            values.push(renderer.write_value(field, value)?);
        }
        sql.push_str(&format!(
            " ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ));
    }
    let (returning_sql, decode) = renderer.returning(returning);
    sql.push_str(&returning_sql);
    Ok(renderer.finish(sql, decode))
}

/// Renders an UPDATE restricted by `filter`.
pub fn build_update(
    table: &TableDef,
    assignments: &[(String, Expr)],
    filter: &Expr,
    returning: bool,
) -> Result<BuiltQuery, SqlBuildError> {
    if assignments.is_empty() {
        return Err(SqlBuildError::NoAssignments {
            table: table.name().to_string(),
        });
    }
    let mut renderer = Renderer::new(table, false);
    let mut sets = Vec::with_capacity(assignments.len());
    for (name, value) in assignments {
        let field = renderer.writable(name)?;
        let rendered = renderer.write_value(field, value)?;
        sets.push(format!("{} = {rendered}", quote_ident(&field.column)));
    }
    let filter = renderer.expr(filter)?;
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {filter}",
        quote_ident(table.table()),
        sets.join(", ")
    );
    let (returning_sql, decode) = renderer.returning(returning);
    sql.push_str(&returning_sql);
    Ok(renderer.finish(sql, decode))
}

/// Renders a DELETE restricted by `filter`.
pub fn build_delete(table: &TableDef, filter: &Expr) -> Result<BuiltQuery, SqlBuildError> {
    let mut renderer = Renderer::new(table, false);
    let filter = renderer.expr(filter)?;
    let sql = format!("DELETE FROM {} WHERE {filter}", quote_ident(table.table()));
    Ok(renderer.finish(sql, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::{build_delete, build_insert, build_select, build_update, SqlBuildError};
    use crate::schema::{ComputedField, FieldDef, FieldType, TableDef};
    use crate::sql::expr::{Expr, SelectShape};
    use crate::sql::params::parametrize;
    use crate::value::{Record, Value};

    fn table() -> TableDef {
        TableDef::new("tst", "tst")
            .field(FieldDef::text("_id", "tst_id"))
            .field(FieldDef::text("name", "tst_name").encrypted())
            .field(FieldDef::integer("amount", "tst_amount"))
            .field(FieldDef::json("meta", "tst_meta"))
            .computed(ComputedField::new("docCount", FieldType::Integer, "SELECT 0"))
    }

    #[test]
    fn select_aliases_fields_and_decrypts_encrypted_columns() {
        let query = build_select(&table(), &SelectShape::new()).unwrap();
        assert_eq!(
            query.sql,
            "SELECT \"tst\".\"tst_id\" AS \"_id\", \
             txloom_decrypt(\"tst\".\"tst_name\", :encryptionKey) AS \"name\", \
             \"tst\".\"tst_amount\" AS \"amount\", \"tst\".\"tst_meta\" AS \"meta\", \
             (SELECT 0) AS \"docCount\" FROM \"tst\""
        );
        assert_eq!(query.column_type("docCount"), Some(FieldType::Integer));
        assert_eq!(query.column_type("name"), Some(FieldType::Text));
    }

    #[test]
    fn select_binds_literals_and_renders_shape() {
        let shape = SelectShape::new()
            .filter(Expr::and(vec![
                Expr::field("amount").greater_than(Expr::value(1_i64)),
                Expr::field("_id").in_list(vec![Expr::value("a"), Expr::value("b")]),
            ]))
            .order_by("amount")
            .order_by_desc("_id")
            .limit(5);
        let query = build_select(&table(), &shape).unwrap();
        assert!(query.sql.ends_with(
            "WHERE ((\"tst\".\"tst_amount\" > :__lit0) AND (\"tst\".\"tst_id\" IN (:__lit1, :__lit2))) \
             ORDER BY \"tst\".\"tst_amount\" ASC, \"tst\".\"tst_id\" DESC LIMIT 5"
        ));
        assert_eq!(query.bound.get("__lit0"), Some(&Value::Int(1)));
        assert_eq!(query.bound.get("__lit2"), Some(&Value::from("b")));
    }

    #[test]
    fn select_rejects_unknown_fields() {
        let shape = SelectShape::new().order_by("missing");
        let err = build_select(&table(), &shape).unwrap_err();
        assert_eq!(
            err,
            SqlBuildError::UnknownField {
                table: "tst".to_string(),
                field: "missing".to_string()
            }
        );
    }

    #[test]
    fn insert_encrypts_and_tracks_json_params() {
        let record = Record::new()
            .with("_id", "x")
            .with("name", "secret")
            .with("meta", Value::Sequence(vec![]));
        let query = build_insert(&table(), &parametrize(&record), true).unwrap();
        assert!(query.sql.starts_with(
            "INSERT INTO \"tst\" (\"tst_id\", \"tst_meta\", \"tst_name\") \
             VALUES (:_id, :meta, txloom_encrypt(:name, :encryptionKey)) RETURNING "
        ));
        assert!(query.json_params.contains("meta"));
        assert_eq!(query.columns.len(), 4);
    }

    #[test]
    fn insert_rejects_computed_fields() {
        let record = Record::new().with("docCount", 1_i64);
        assert!(build_insert(&table(), &parametrize(&record), false).is_err());
    }

    #[test]
    fn update_requires_assignments_and_renders_filter() {
        let filter = Expr::field("_id").equals(Expr::param("recordId"));
        assert!(matches!(
            build_update(&table(), &[], &filter, true),
            Err(SqlBuildError::NoAssignments { .. })
        ));

        let record = Record::new().with("amount", 2_i64);
        let query = build_update(&table(), &parametrize(&record), &filter, false).unwrap();
        assert_eq!(
            query.sql,
            "UPDATE \"tst\" SET \"tst_amount\" = :amount WHERE (\"tst_id\" = :recordId)"
        );
    }

    #[test]
    fn delete_renders_compound_filter() {
        let filter = Expr::and(vec![
            Expr::field("_id").equals(Expr::param("recordId")),
            Expr::not(Expr::field("amount").is_null()),
        ]);
        let query = build_delete(&table(), &filter).unwrap();
        assert_eq!(
            query.sql,
            "DELETE FROM \"tst\" WHERE ((\"tst_id\" = :recordId) AND (NOT (\"tst_amount\" IS NULL)))"
        );
    }
}
