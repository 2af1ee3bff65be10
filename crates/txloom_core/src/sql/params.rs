//! Named parameters and the record-to-placeholder binder.

use std::collections::BTreeMap;

use super::expr::Expr;
use crate::schema::link::{LINK_CHILD_FIELD, LINK_PARENT_FIELD};
use crate::value::{Record, Value};

/// Parameter carrying the target id of point reads, updates and deletes.
pub const RECORD_ID_PARAM: &str = "recordId";
/// Parameter carrying the session encryption key.
pub const ENCRYPTION_KEY_PARAM: &str = "encryptionKey";

/// Parameter names entity fields may not use.
pub const RESERVED_PARAMS: &[&str] = &[
    RECORD_ID_PARAM,
    ENCRYPTION_KEY_PARAM,
    LINK_PARENT_FIELD,
    LINK_CHILD_FIELD,
];

/// Column assignments for INSERT/UPDATE: logical field -> value expression.
pub type Assignments = Vec<(String, Expr)>;

/// Named parameter values bound at execution time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Adds every parameter of `other`, overwriting equal names.
    pub fn extend(&mut self, other: &Params) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Record> for Params {
    fn from(record: Record) -> Self {
        Self(record.into_inner())
    }
}

/// Maps every field of `record` to a same-named placeholder.
pub fn parametrize(record: &Record) -> Assignments {
    record
        .fields()
        .map(|field| (field.to_string(), Expr::param(field)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parametrize, Params};
    use crate::sql::expr::Expr;
    use crate::value::Record;

    #[test]
    fn parametrize_maps_fields_to_named_placeholders() {
        let record = Record::new().with("name", "x").with("amount", 1_i64);
        let assignments = parametrize(&record);
        assert_eq!(
            assignments,
            vec![
                ("amount".to_string(), Expr::param("amount")),
                ("name".to_string(), Expr::param("name")),
            ]
        );
    }

    #[test]
    fn extend_overwrites_equal_names() {
        let mut params = Params::new().with("a", 1_i64).with("b", 2_i64);
        params.extend(&Params::new().with("b", 3_i64));
        assert_eq!(params.get("b").and_then(|value| value.as_i64()), Some(3));
        assert_eq!(params.len(), 2);
    }
}
