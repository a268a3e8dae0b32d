//! Declaring aggregated, generated and observed attributes.
//!
//! Declarations are attached to a [`MapperBuilder`] through [`DeclareExt`] and
//! stored in the mapper's [`Declarations`] extension. Nothing is resolved at
//! this point: paths are checked against the registry when the mapper is
//! configured.
//!
//! ```ignore
//! let thread = Mapper::builder("Thread", "threads")
//!     .column(FieldInfo::id("id"))
//!     .column(FieldInfo::new("comment_count", SqlType::BigInt).default_value(0_i64))
//!     .relationship(RelationshipInfo::one_to_many("comments", "Comment", "thread_id"))
//!     .aggregated("comment_count", "comments", AggregateExpr::count());
//! ```

use sqlmodel_derived_core::{Dotted, Mapper, MapperBuilder, ObjectRef, Result, Value};
use sqlmodel_derived_query::Expr;
use std::fmt;
use std::sync::Arc;

/// Computes a generated value from the owner row.
pub type RowFn = Arc<dyn Fn(&ObjectRef) -> Result<Value> + Send + Sync>;

/// Computes a generated value from the owner and what its source path reaches.
pub type RelatedFn = Arc<dyn Fn(&ObjectRef, &Dotted) -> Result<Value> + Send + Sync>;

/// Receives a root object and the leaves its observed path reaches.
pub type ObserverFn = Arc<dyn Fn(&ObjectRef, &Dotted) -> Result<()> + Send + Sync>;

/// Builds an aggregate expression from the owner mapper and the leaf alias.
pub type ExprFactory = Arc<dyn Fn(&Mapper, &str) -> Expr + Send + Sync>;

// ============================================================================
// Aggregate expressions
// ============================================================================

/// The value an aggregated column holds, computed over the leaf rows.
#[derive(Clone)]
pub enum AggregateExpr {
    /// An aggregate function applied to the literal `'1'`, such as `count`.
    Function(String),
    /// An expression over the leaf table.
    Expr(Expr),
    /// An expression built once the owner is configured.
    Factory(ExprFactory),
}

impl fmt::Debug for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateExpr::Function(name) => f.debug_tuple("Function").field(name).finish(),
            AggregateExpr::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            AggregateExpr::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

impl AggregateExpr {
    pub fn function(name: impl Into<String>) -> Self {
        AggregateExpr::Function(name.into())
    }

    /// `COUNT('1')` over the leaf rows.
    pub fn count() -> Self {
        Self::function("count")
    }

    /// An expression over the leaf table. Columns qualified with the leaf's
    /// class or table name are rebound to the leaf alias.
    pub fn expr(expr: Expr) -> Self {
        AggregateExpr::Expr(expr)
    }

    pub fn factory<F>(f: F) -> Self
    where
        F: Fn(&Mapper, &str) -> Expr + Send + Sync + 'static,
    {
        AggregateExpr::Factory(Arc::new(f))
    }

    /// The expression, with the leaf table referenced as `leaf_alias`.
    pub fn build(&self, owner: &Mapper, leaf: &Mapper, leaf_alias: &str) -> Expr {
        match self {
            AggregateExpr::Function(name) => {
                Expr::function(name.to_ascii_uppercase(), vec![Expr::lit("1")])
            }
            AggregateExpr::Expr(expr) => {
                let tables: Vec<&str> = leaf.tables().into_iter().map(|(t, _)| t).collect();
                expr.map_columns(&|qualifier: Option<&str>, name: &str| match qualifier {
                    Some(q) if q == leaf.name() || tables.iter().any(|t| *t == q) => {
                        Expr::qualified(leaf_alias, name)
                    }
                    Some(q) => Expr::qualified(q, name),
                    None => Expr::col(name),
                })
            }
            AggregateExpr::Factory(factory) => factory(owner, leaf_alias),
        }
    }
}

// ============================================================================
// Generators
// ============================================================================

#[derive(Clone)]
pub(crate) enum GeneratorSource {
    Row(RowFn),
    Related { path: String, f: RelatedFn },
    Copy { path: String },
}

/// How a generated attribute gets its value.
///
/// - [`Generator::row`] computes from the owner's own attributes;
/// - [`Generator::related`] computes from the objects a relation path reaches;
/// - [`Generator::copy`] copies a column of the object a path reaches, e.g.
///   `document.locale`.
#[derive(Clone)]
pub struct Generator {
    pub(crate) source: GeneratorSource,
    pub(crate) depends_on: Vec<String>,
    pub(crate) required: bool,
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("source", &self.source())
            .field("depends_on", &self.depends_on)
            .field("required", &self.required)
            .finish()
    }
}

impl Generator {
    fn with_source(source: GeneratorSource) -> Self {
        Self {
            source,
            depends_on: Vec::new(),
            required: false,
        }
    }

    pub fn row<F>(f: F) -> Self
    where
        F: Fn(&ObjectRef) -> Result<Value> + Send + Sync + 'static,
    {
        Self::with_source(GeneratorSource::Row(Arc::new(f)))
    }

    pub fn related<F>(source: impl ToString, f: F) -> Self
    where
        F: Fn(&ObjectRef, &Dotted) -> Result<Value> + Send + Sync + 'static,
    {
        Self::with_source(GeneratorSource::Related {
            path: source.to_string(),
            f: Arc::new(f),
        })
    }

    /// Copy the column named by the last segment of `source` from the object
    /// reached by the segments before it.
    pub fn copy(source: impl ToString) -> Self {
        Self::with_source(GeneratorSource::Copy {
            path: source.to_string(),
        })
    }

    /// Attributes the generator reads: of the owner for row generators, of the
    /// reached objects for related ones.
    #[must_use]
    pub fn depends_on<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Fail the flush instead of writing NULL when the source reaches nothing.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// The dotted source path, `None` for row generators.
    pub fn source(&self) -> Option<&str> {
        match &self.source {
            GeneratorSource::Row(_) => None,
            GeneratorSource::Related { path, .. } | GeneratorSource::Copy { path } => Some(path),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// One declared derived attribute.
#[derive(Clone)]
pub enum Declaration {
    Aggregate {
        column: String,
        path: String,
        expr: AggregateExpr,
    },
    Generator {
        target: String,
        generator: Generator,
    },
    Observer {
        path: String,
        callback: ObserverFn,
    },
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Aggregate { column, path, expr } => f
                .debug_struct("Aggregate")
                .field("column", column)
                .field("path", path)
                .field("expr", expr)
                .finish(),
            Declaration::Generator { target, generator } => f
                .debug_struct("Generator")
                .field("target", target)
                .field("generator", generator)
                .finish(),
            Declaration::Observer { path, .. } => f
                .debug_struct("Observer")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

impl Declaration {
    pub const fn kind(&self) -> &'static str {
        match self {
            Declaration::Aggregate { .. } => "aggregate",
            Declaration::Generator { .. } => "generator",
            Declaration::Observer { .. } => "observer",
        }
    }
}

/// Declarations of one mapper, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    items: Vec<Declaration>,
}

impl Declarations {
    pub fn push(&mut self, declaration: Declaration) {
        self.items.push(declaration);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Declaration> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Declarations of `mapper` itself (not of its base classes).
    pub fn of(mapper: &Mapper) -> &[Declaration] {
        mapper
            .extension::<Declarations>()
            .map_or(&[], |d| d.items.as_slice())
    }
}

impl<'a> IntoIterator for &'a Declarations {
    type Item = &'a Declaration;
    type IntoIter = std::slice::Iter<'a, Declaration>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Declaration methods for [`MapperBuilder`].
pub trait DeclareExt: Sized {
    /// Keep `column` equal to `expr` computed over the rows `path` reaches.
    fn aggregated(self, column: impl Into<String>, path: impl ToString, expr: AggregateExpr)
    -> Self;

    /// Compute `target` with `generator` before every flush.
    fn generates(self, target: impl Into<String>, generator: Generator) -> Self;

    /// Call `callback` with the leaves of `path` whenever anything on it changes.
    fn observes<F>(self, path: impl ToString, callback: F) -> Self
    where
        F: Fn(&ObjectRef, &Dotted) -> Result<()> + Send + Sync + 'static;
}

impl DeclareExt for MapperBuilder {
    fn aggregated(
        mut self,
        column: impl Into<String>,
        path: impl ToString,
        expr: AggregateExpr,
    ) -> Self {
        self.extension_mut::<Declarations>()
            .push(Declaration::Aggregate {
                column: column.into(),
                path: path.to_string(),
                expr,
            });
        self
    }

    fn generates(mut self, target: impl Into<String>, generator: Generator) -> Self {
        self.extension_mut::<Declarations>()
            .push(Declaration::Generator {
                target: target.into(),
                generator,
            });
        self
    }

    fn observes<F>(mut self, path: impl ToString, callback: F) -> Self
    where
        F: Fn(&ObjectRef, &Dotted) -> Result<()> + Send + Sync + 'static,
    {
        self.extension_mut::<Declarations>()
            .push(Declaration::Observer {
                path: path.to_string(),
                callback: Arc::new(callback),
            });
        self
    }
}
