//! SQL construction for SQLModel Derived.
//!
//! `sqlmodel-derived-query` is the **query construction layer**. It turns relation
//! paths and expressions into executable SQL plus parameters.
//!
//! # Role In The Architecture
//!
//! - **Expression tree**: `Expr` builds SELECT lists, WHERE and SET clauses.
//! - **Chained joins**: `chained_join` compiles an `AttrPath` into aliased joins.
//! - **Correlated subqueries**: `select_correlated_expression` computes a value over a
//!   relation path for each row of the root class's table.
//! - **Statements**: `Select`, `Insert`, `Update`, `Delete` render for Postgres,
//!   MySQL and SQLite, and execute through the `Connection` trait.
//!
//! Statements stay structured after construction, so in-process executors can
//! evaluate them without parsing SQL text.

pub mod clause;
pub mod correlated;
pub mod expr;
pub mod join;
pub mod select;
pub mod statement;

pub use clause::{NullsOrder, OrderBy, OrderDirection};
pub use correlated::{CorrelatedExpression, correlate, select_correlated_expression};
pub use expr::{BinaryOp, Expr, UnaryOp};
pub use join::{AliasedTable, ChainedJoin, ClassTables, FromClause, Join, JoinType, chained_join};
pub use select::{Select, SelectItem};
pub use sqlmodel_derived_core::Dialect;
pub use statement::{Delete, Insert, Statement, Update};

use asupersync::{Cx, Outcome};
use sqlmodel_derived_core::{Connection, Row, Value};

/// Raw SQL query execution.
///
/// For queries that can't be expressed with the builders.
pub async fn raw_query<C: Connection>(
    cx: &Cx,
    conn: &C,
    sql: &str,
    params: &[Value],
) -> Outcome<Vec<Row>, sqlmodel_derived_core::Error> {
    conn.query(cx, sql, params).await
}

/// Raw SQL statement execution.
pub async fn raw_execute<C: Connection>(
    cx: &Cx,
    conn: &C,
    sql: &str,
    params: &[Value],
) -> Outcome<u64, sqlmodel_derived_core::Error> {
    conn.execute(cx, sql, params).await
}
