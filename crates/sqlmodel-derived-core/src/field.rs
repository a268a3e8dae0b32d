//! Column definitions.

use crate::types::SqlType;
use crate::value::Value;

/// Metadata about a mapped column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// Column name (also the attribute name on live objects)
    pub name: String,
    /// SQL type for this column
    pub sql_type: SqlType,
    /// Whether this column is nullable
    pub nullable: bool,
    /// Whether this is a primary key column
    pub primary_key: bool,
    /// Whether this column auto-increments
    pub auto_increment: bool,
    /// Default value used when an INSERT leaves the column unset
    pub default: Option<Value>,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<String>,
}

impl FieldInfo {
    /// Create a new nullable column.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default: None,
            foreign_key: None,
        }
    }

    /// Create an auto-incrementing BIGINT primary key column.
    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::BigInt)
            .primary_key(true)
            .auto_increment(true)
    }

    /// Set whether this is a primary key. Primary keys are never nullable.
    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        if value {
            self.nullable = false;
        }
        self
    }

    /// Set auto-increment flag.
    pub fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Set nullable flag.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set the column default.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set foreign key reference.
    pub fn foreign_key(mut self, fk: impl Into<String>) -> Self {
        self.foreign_key = Some(fk.into());
        self
    }

    /// The table referenced by the foreign key, if any.
    pub fn foreign_table(&self) -> Option<&str> {
        self.foreign_key
            .as_deref()
            .and_then(|fk| fk.split('.').next())
    }

    /// The declared default, or NULL.
    pub fn default_or_null(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}
