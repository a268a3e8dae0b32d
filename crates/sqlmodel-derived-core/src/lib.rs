//! Core types for SQLModel Derived.
//!
//! This crate provides the foundations the derived-attribute machinery is built on:
//!
//! - `Value` and `SqlType` for dynamically-typed column data
//! - `FieldInfo` and `RelationshipInfo` column/relationship metadata
//! - `Mapper` and `Registry` describing mapped classes, with configuration hooks
//! - `ObjectRef`, a shared handle to a live instance in the object graph
//! - `Path` / `AttrPath`, the relation-path algebra, and the dotted accessor
//! - `Connection` trait for drivers
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod attr_path;
pub mod connection;
pub mod dialect;
pub mod dotted;
pub mod error;
pub mod field;
pub mod ident;
pub mod mapper;
pub mod object;
pub mod path;
pub mod relationship;
pub mod row;
pub mod types;
pub mod value;

pub use attr_path::{AttrPath, PathStep};
pub use connection::Connection;
pub use dialect::Dialect;
pub use dotted::{Dotted, getdotattr, getdotattr_filtered, reachable_with_history};
pub use error::{
    ConfigError, DataError, DependencyError, Error, PathError, PathErrorKind, QueryError,
    QueryErrorKind, Result, TypeError,
};
pub use field::FieldInfo;
pub use mapper::{
    AttributeChange, AttributeListener, ConfigureListener, ListenerKey, Mapper, MapperBuilder,
    Registry, RegistryBuilder,
};
pub use object::{History, ObjectRef, Related};
pub use path::Path;
pub use relationship::{
    JoinColumns, JoinCondition, JoinFilter, JoinSide, LinkTableInfo, Relationship,
    RelationshipInfo, RelationshipKind,
};
pub use row::{ColumnInfo, Row};
pub use types::SqlType;
pub use value::{Value, hash_values};
