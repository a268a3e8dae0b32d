//! Statement executors.
//!
//! The session hands structured statements to an [`Executor`]. A
//! [`ConnectionExecutor`] renders them for a driver's dialect; the
//! [`MemoryDatabase`](crate::memory::MemoryDatabase) evaluates them in process.

use asupersync::{Cx, Outcome};
use sqlmodel_derived_core::{Connection, Dialect, Error, Row};
use sqlmodel_derived_query::{Insert, Select, Statement};
use std::future::Future;
use std::sync::Arc;

/// Something that can run the statements a session produces.
pub trait Executor: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Execute a statement and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT, returning the generated key when the table has one.
    fn insert(
        &self,
        cx: &Cx,
        insert: &Insert,
    ) -> impl Future<Output = Outcome<Option<i64>, Error>> + Send;

    /// Execute a query and return all rows.
    fn query(&self, cx: &Cx, select: &Select)
    -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;
}

impl<E: Executor> Executor for Arc<E> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        (**self).execute(cx, statement)
    }

    fn insert(
        &self,
        cx: &Cx,
        insert: &Insert,
    ) -> impl Future<Output = Outcome<Option<i64>, Error>> + Send {
        (**self).insert(cx, insert)
    }

    fn query(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        (**self).query(cx, select)
    }
}

/// Runs statements on a database [`Connection`].
#[derive(Debug)]
pub struct ConnectionExecutor<C: Connection> {
    connection: C,
}

impl<C: Connection> ConnectionExecutor<C> {
    pub fn new(connection: C) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn into_inner(self) -> C {
        self.connection
    }
}

impl<C: Connection> Executor for ConnectionExecutor<C> {
    fn dialect(&self) -> Dialect {
        self.connection.dialect()
    }

    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        statement.execute(cx, &self.connection)
    }

    fn insert(
        &self,
        cx: &Cx,
        insert: &Insert,
    ) -> impl Future<Output = Outcome<Option<i64>, Error>> + Send {
        let has_key = insert.returning.is_some();
        let fut = insert.execute(cx, &self.connection);
        async move {
            match fut.await {
                Outcome::Ok(id) => Outcome::Ok(has_key.then_some(id)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn query(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        select.all(cx, &self.connection)
    }
}
