//! SELECT statements.

use crate::clause::OrderBy;
use crate::expr::Expr;
use crate::join::FromClause;
use asupersync::{Cx, Outcome};
use sqlmodel_derived_core::{Connection, Dialect, Row, Value};

/// One entry of a SELECT list.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    /// Columns to select (empty = all)
    pub columns: Vec<SelectItem>,
    /// FROM clause (absent for `SELECT <expr>`)
    pub from: Option<FromClause>,
    /// WHERE clause
    pub where_clause: Option<Expr>,
    /// ORDER BY keys
    pub order_by: Vec<OrderBy>,
    /// LIMIT clause
    pub limit: Option<u64>,
    /// DISTINCT flag
    pub distinct: bool,
}

impl Select {
    /// Create an empty SELECT.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column to the SELECT list.
    pub fn column(mut self, expr: impl Into<Expr>) -> Self {
        self.columns.push(SelectItem {
            expr: expr.into(),
            alias: None,
        });
        self
    }

    /// Add an aliased column to the SELECT list.
    pub fn column_as(mut self, expr: impl Into<Expr>, alias: impl Into<String>) -> Self {
        self.columns.push(SelectItem {
            expr: expr.into(),
            alias: Some(alias.into()),
        });
        self
    }

    /// Set the FROM clause.
    pub fn from(mut self, from: FromClause) -> Self {
        self.from = Some(from);
        self
    }

    /// Select from a single unaliased table.
    pub fn from_table(self, table: impl Into<String>) -> Self {
        self.from(FromClause::table(table))
    }

    /// Add a WHERE condition (ANDed with any existing one).
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Add an ORDER BY key.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Make this a SELECT DISTINCT.
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Build the SQL query and parameters with the default dialect.
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the SQL query and parameters for `dialect`.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.build_into(dialect, &mut params, 0);
        (sql, params)
    }

    /// Build the SQL query, appending parameters to a shared list.
    ///
    /// Used when the SELECT is nested inside another statement.
    pub fn build_into(&self, dialect: Dialect, params: &mut Vec<Value>, offset: usize) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            sql.push('*');
        } else {
            let cols: Vec<_> = self
                .columns
                .iter()
                .map(|item| {
                    let expr_sql = item.expr.build_with_dialect(dialect, params, offset);
                    match &item.alias {
                        Some(alias) => {
                            format!("{expr_sql} AS {}", dialect.quote_identifier(alias))
                        }
                        None => expr_sql,
                    }
                })
                .collect();
            sql.push_str(&cols.join(", "));
        }

        // FROM + JOINs
        if let Some(from) = &self.from {
            sql.push_str(" FROM ");
            sql.push_str(&from.build_with_dialect(dialect, params, offset));
        }

        // WHERE
        if let Some(expr) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&expr.build_with_dialect(dialect, params, offset));
        }

        // ORDER BY
        if !self.order_by.is_empty() {
            let keys: Vec<_> = self
                .order_by
                .iter()
                .map(|o| o.build_with_dialect(dialect, params, offset))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        // LIMIT
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }

        sql
    }

    /// Execute the query and return all rows.
    pub async fn all<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
    ) -> Outcome<Vec<Row>, sqlmodel_derived_core::Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        tracing::trace!(sql = %sql, params = params.len(), "Executing SELECT");
        conn.query(cx, &sql, &params).await
    }
}
