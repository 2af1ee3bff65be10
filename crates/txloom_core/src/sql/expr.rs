//! Expression tree and select shape consumed by the builder.

use crate::value::Value;

/// Binary comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
}

impl CompareOp {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// Predicate / value expression over one table's logical fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical field (stored or computed) of the queried table.
    Field(String),
    /// Named parameter supplied at execution time.
    Param(String),
    /// Inline value, bound as a generated parameter.
    Literal(Value),
    /// SQL text emitted verbatim.
    Raw(String),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    In(Box<Expr>, Vec<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Param(name.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Raw(sql.into())
    }

    pub fn and(parts: Vec<Expr>) -> Self {
        Expr::And(parts)
    }

    pub fn or(parts: Vec<Expr>) -> Self {
        Expr::Or(parts)
    }

    pub fn not(inner: Expr) -> Self {
        Expr::Not(Box::new(inner))
    }

    pub fn compare(self, op: CompareOp, other: Expr) -> Self {
        Expr::Compare(Box::new(self), op, Box::new(other))
    }

    pub fn equals(self, other: Expr) -> Self {
        self.compare(CompareOp::Eq, other)
    }

    pub fn not_equals(self, other: Expr) -> Self {
        self.compare(CompareOp::NotEq, other)
    }

    pub fn less_than(self, other: Expr) -> Self {
        self.compare(CompareOp::Lt, other)
    }

    pub fn greater_than(self, other: Expr) -> Self {
        self.compare(CompareOp::Gt, other)
    }

    pub fn like(self, other: Expr) -> Self {
        self.compare(CompareOp::Like, other)
    }

    pub fn in_list(self, items: Vec<Expr>) -> Self {
        Expr::In(Box::new(self), items)
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }
}

/// What an ORDER BY term sorts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTarget {
    Field(String),
    Raw(String),
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub target: OrderTarget,
    pub descending: bool,
}

/// Caller-supplied predicate, ordering and limit for a bulk select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectShape {
    pub distinct: bool,
    pub filter: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub max_rows: Option<u32>,
}

impl SelectShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            target: OrderTarget::Field(field.into()),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            target: OrderTarget::Field(field.into()),
            descending: true,
        });
        self
    }

    pub fn order_by_raw(mut self, sql: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            target: OrderTarget::Raw(sql.into()),
            descending,
        });
        self
    }

    pub fn limit(mut self, max_rows: u32) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}
