//! Error types for SQLModel Derived operations.

use std::fmt;

/// The primary error type for all SQLModel Derived operations.
#[derive(Debug)]
pub enum Error {
    /// A relation path could not be resolved or inverted
    Path(PathError),
    /// A traversal produced no rows where at least one was required
    Data(DataError),
    /// A declaration or mapper definition is invalid
    Config(ConfigError),
    /// Generators or flush operations form a cycle
    Dependency(DependencyError),
    /// Statement execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// What went wrong while resolving a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathErrorKind {
    /// The class at some position is not mapped
    UnknownClass,
    /// A segment names something that is not a relationship
    NotARelationship,
    /// An inverse was requested but a segment has no back-reference
    MissingBackref,
    /// A sub-path was not found inside a path
    NotFound,
    /// A segment is not a valid identifier
    InvalidSegment,
}

#[derive(Debug, Clone)]
pub struct PathError {
    pub kind: PathErrorKind,
    /// Class the path is rooted at
    pub class: String,
    /// The full dotted path
    pub path: String,
    /// Offending segment, when one can be named
    pub segment: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DataError {
    pub class: String,
    pub attribute: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub class: Option<String>,
    pub attribute: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct DependencyError {
    /// The nodes of the cycle, in order (`Class.attribute` form)
    pub chain: Vec<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed statement
    Syntax,
    /// Constraint violation (unique, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl PathError {
    pub fn new(
        kind: PathErrorKind,
        class: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            class: class.into(),
            path: path.into(),
            segment: None,
            message: message.into(),
        }
    }

    /// Attach the offending segment.
    #[must_use]
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }
}

impl DataError {
    pub fn new(
        class: impl Into<String>,
        attribute: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            attribute: attribute.into(),
            path: path.into(),
            message: message.into(),
        }
    }
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            class: None,
            attribute: None,
            message: message.into(),
            source: None,
        }
    }

    /// Name the class the error belongs to.
    #[must_use]
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Name the attribute the error belongs to.
    #[must_use]
    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl Error {
    /// Is this an error raised while configuring mappers or declarations?
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::Path(_) | Error::Config(_) | Error::Dependency(_)
        )
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Shortcut for a `PathError` of the given kind.
    pub fn path(
        kind: PathErrorKind,
        class: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Path(PathError::new(kind, class, path, message))
    }

    /// Shortcut for a `ConfigError` on `class.attribute`.
    pub fn config(
        class: impl Into<String>,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Config(ConfigError::new(message).class(class).attribute(attribute))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Path(e) => write!(f, "Path error: {}", e),
            Error::Data(e) => write!(f, "Data error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Dependency(e) => write!(f, "Dependency error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (class '{}', path '{}'", self.message, self.class, self.path)?;
        if let Some(segment) = &self.segment {
            write!(f, ", segment '{}'", segment)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}.{} from '{}')",
            self.message, self.class, self.attribute, self.path
        )
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.class, &self.attribute) {
            (Some(class), Some(attr)) => write!(f, "{}.{}: {}", class, attr, self.message),
            (Some(class), None) => write!(f, "{}: {}", class, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.chain.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.message, self.chain.join(" -> "))
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} in `{}`", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<PathError> for Error {
    fn from(err: PathError) -> Self {
        Error::Path(err)
    }
}

impl From<DataError> for Error {
    fn from(err: DataError) -> Self {
        Error::Data(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<DependencyError> for Error {
    fn from(err: DependencyError) -> Self {
        Error::Dependency(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for SQLModel Derived operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_error_names_class_path_and_segment() {
        let err = Error::Path(
            PathError::new(
                PathErrorKind::MissingBackref,
                "Catalog",
                "categories.products",
                "segment has no back-reference",
            )
            .segment("products"),
        );
        let msg = err.to_string();
        assert!(msg.contains("Catalog"));
        assert!(msg.contains("categories.products"));
        assert!(msg.contains("'products'"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn data_error_names_attribute() {
        let err = Error::from(DataError::new(
            "Section",
            "locale",
            "document",
            "source yielded no rows",
        ));
        assert_eq!(
            err.to_string(),
            "Data error: source yielded no rows (Section.locale from 'document')"
        );
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn config_error_display_variants() {
        assert_eq!(
            ConfigError::new("bad").class("Thread").to_string(),
            "Thread: bad"
        );
        assert_eq!(
            Error::config("Thread", "comment_count", "no such column").to_string(),
            "Configuration error: Thread.comment_count: no such column"
        );
    }

    #[test]
    fn dependency_error_renders_chain() {
        let err = DependencyError {
            chain: vec!["A.x".into(), "A.y".into(), "A.x".into()],
            message: "circular generator chain".into(),
        };
        assert_eq!(err.to_string(), "circular generator chain: A.x -> A.y -> A.x");
    }

    #[test]
    fn query_error_exposes_sql() {
        let err = Error::Query(
            QueryError::new(QueryErrorKind::NotFound, "no such table").sql("SELECT 1"),
        );
        assert_eq!(err.sql(), Some("SELECT 1"));
    }
}
