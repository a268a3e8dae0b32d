//! SQLModel Derived - denormalized columns kept in sync with the object graph.
//!
//! `sqlmodel-derived` adds three kinds of derived attributes to mapped classes:
//!
//! - **aggregated columns**: an aggregate (COUNT, SUM, MAX, any expression)
//!   over the rows a relation path reaches, refreshed with one correlated
//!   UPDATE after every flush that touches the path;
//! - **generated attributes**: values computed from the owner row or copied
//!   across a relation path, recomputed in memory as soon as a source changes
//!   and again before every flush;
//! - **observers**: callbacks receiving the objects a relation path reaches,
//!   invoked once per flush for every owner whose path changed.
//!
//! It also provides the relation-path algebra they are built on: [`Path`],
//! [`AttrPath`] with `inverse`/`slice`, the dotted accessor [`getdotattr`],
//! [`chained_join`] and [`select_correlated_expression`].
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlmodel_derived::prelude::*;
//!
//! let derived = DerivedAttributes::new();
//! let registry = derived.configure(
//!     RegistryBuilder::new()
//!         .mapper(
//!             Mapper::builder("Thread", "threads")
//!                 .column(FieldInfo::id("id"))
//!                 .column(FieldInfo::new("comment_count", SqlType::BigInt).default_value(0_i64))
//!                 .relationship(
//!                     RelationshipInfo::one_to_many("comments", "Comment", "thread_id")
//!                         .back_populates("thread"),
//!                 )
//!                 .aggregated("comment_count", "comments", AggregateExpr::count()),
//!         )
//!         .mapper(comment_mapper()),
//! )?;
//!
//! let factory = SessionFactory::new(registry);
//! derived.install(&factory);
//!
//! let mut session = factory.session(MemoryDatabase::from_registry(factory.registry()));
//! let thread = factory.registry().create("Thread")?;
//! let comment = factory.registry().create("Comment")?;
//! thread.append("comments", &comment)?;
//! session.add(&thread);
//! session.flush(&cx).await;
//! assert_eq!(thread.get("comment_count"), Value::BigInt(1));
//! ```

pub mod aggregates;
pub mod config;
pub mod declarative;
pub mod generates;
mod index;
pub mod listeners;
pub mod observes;

pub use aggregates::{Aggregate, AggregateRegistry, LEAF_ALIAS};
pub use config::DerivedConfig;
pub use declarative::{
    AggregateExpr, Declaration, Declarations, DeclareExt, ExprFactory, Generator, ObserverFn,
    RelatedFn, RowFn,
};
pub use generates::{GeneratedAttribute, GeneratedRegistry};
pub use listeners::DerivedAttributes;
pub use observes::{Observer, ObserverRegistry};

// Re-export the host layers
pub use sqlmodel_derived_core::{
    AttrPath, ConfigError, Cx, DataError, DependencyError, Dotted, Error, FieldInfo, LinkTableInfo,
    Mapper, MapperBuilder, ObjectRef, Outcome, Path, PathError, PathErrorKind, PathStep, Registry,
    RegistryBuilder, RelationshipInfo, Result, SqlType, Value, getdotattr, getdotattr_filtered,
    path,
};
pub use sqlmodel_derived_query::{
    ChainedJoin, CorrelatedExpression, Expr, OrderBy, chained_join, select_correlated_expression,
};
pub use sqlmodel_derived_session::{
    Executor, FlushPhase, ListenerHandle, MemoryDatabase, Session, SessionConfig, SessionFactory,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sqlmodel_derived::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AggregateExpr, AttrPath, Cx, DeclareExt, DerivedAttributes, DerivedConfig, Dotted, Error,
        Expr, FieldInfo, Generator, Mapper, MemoryDatabase, ObjectRef, Outcome, Path,
        RegistryBuilder, RelationshipInfo, Result, Session, SessionFactory, SqlType, Value,
        chained_join, getdotattr, path, select_correlated_expression,
    };
}
