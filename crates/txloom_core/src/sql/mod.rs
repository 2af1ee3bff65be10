//! Declarative query building over `TableDef`s.
//!
//! # Responsibility
//! - Turn a table declaration plus an expression tree into SQL text and
//!   generated parameters.
//! - Map records to named placeholders.

pub mod builder;
pub mod expr;
pub mod params;

pub use builder::{
    build_delete, build_insert, build_select, build_update, quote_ident, BuiltQuery,
    SqlBuildError,
};
pub use expr::{CompareOp, Expr, OrderBy, OrderTarget, SelectShape};
pub use params::{
    parametrize, Assignments, Params, ENCRYPTION_KEY_PARAM, RECORD_ID_PARAM, RESERVED_PARAMS,
};
