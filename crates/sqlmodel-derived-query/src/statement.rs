//! INSERT, UPDATE and DELETE statements.

use crate::expr::Expr;
use asupersync::{Cx, Outcome};
use sqlmodel_derived_core::{Connection, Dialect, Error, Value};

/// An INSERT of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    /// Column whose generated value is returned (Postgres `RETURNING`).
    pub returning: Option<String>,
}

impl Insert {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
            returning: None,
        }
    }

    /// Add a column value.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push(column.into());
        self.values.push(value.into());
        self
    }

    /// Return the generated value of `column`.
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    /// Build the INSERT SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the INSERT SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(&self.table);
        let mut sql = if self.columns.is_empty() {
            match dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                _ => format!("INSERT INTO {table} DEFAULT VALUES"),
            }
        } else {
            let columns: Vec<_> = self
                .columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect();
            let placeholders: Vec<_> = (1..=self.values.len())
                .map(|i| dialect.placeholder(i))
                .collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            )
        };

        if let (Dialect::Postgres, Some(column)) = (dialect, &self.returning) {
            sql.push_str(&format!(" RETURNING {}", dialect.quote_identifier(column)));
        }

        (sql, self.values.clone())
    }

    /// Execute the INSERT and return the inserted ID.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<i64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.insert(cx, &sql, &params).await
    }
}

/// An UPDATE of a set of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub set: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
    /// Ask the session to re-read the assigned columns into loaded objects.
    pub refresh: bool,
}

impl Update {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set: Vec::new(),
            where_clause: None,
            refresh: false,
        }
    }

    /// Assign `column = expr`.
    pub fn set(mut self, column: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.set.push((column.into(), expr.into()));
        self
    }

    /// Add a WHERE condition (ANDed with any existing one).
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    /// Build the UPDATE SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the UPDATE SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let set_clauses: Vec<_> = self
            .set
            .iter()
            .map(|(column, expr)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    expr.build_with_dialect(dialect, &mut params, 0)
                )
            })
            .collect();

        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            set_clauses.join(", ")
        );

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, &mut params, 0));
        }

        (sql, params)
    }

    /// Execute the UPDATE and return rows affected.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.execute(cx, &sql, &params).await
    }
}

/// A DELETE of a set of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub where_clause: Option<Expr>,
}

impl Delete {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
        }
    }

    /// Add a WHERE condition.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Build the DELETE SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the DELETE SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        let mut params = Vec::new();

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, &mut params, 0));
        }

        (sql, params)
    }

    /// Execute the DELETE and return rows affected.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        conn.execute(cx, &sql, &params).await
    }
}

/// Any statement a flush can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Begin,
    Commit,
    Rollback,
}

impl Statement {
    /// Table the statement writes to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Insert(s) => Some(&s.table),
            Statement::Update(s) => Some(&s.table),
            Statement::Delete(s) => Some(&s.table),
            Statement::Begin | Statement::Commit | Statement::Rollback => None,
        }
    }

    /// Build the SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        match self {
            Statement::Insert(s) => s.build_with_dialect(dialect),
            Statement::Update(s) => s.build_with_dialect(dialect),
            Statement::Delete(s) => s.build_with_dialect(dialect),
            Statement::Begin => ("BEGIN".to_string(), Vec::new()),
            Statement::Commit => ("COMMIT".to_string(), Vec::new()),
            Statement::Rollback => ("ROLLBACK".to_string(), Vec::new()),
        }
    }

    /// Execute the statement and return rows affected.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build_with_dialect(conn.dialect());
        tracing::trace!(sql = %sql, params = params.len(), "Executing statement");
        conn.execute(cx, &sql, &params).await
    }
}

impl From<Insert> for Statement {
    fn from(s: Insert) -> Self {
        Statement::Insert(s)
    }
}

impl From<Update> for Statement {
    fn from(s: Update) -> Self {
        Statement::Update(s)
    }
}

impl From<Delete> for Statement {
    fn from(s: Delete) -> Self {
        Statement::Delete(s)
    }
}
