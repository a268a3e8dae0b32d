//! Aggregated columns.
//!
//! An aggregated column stores an aggregate over the rows a relation path
//! reaches from its owner. The registry indexes every declaration by each class
//! on the path, and after every flush issues one UPDATE per affected
//! aggregate:
//!
//! ```text
//! UPDATE threads SET comment_count = COALESCE(
//!     (SELECT COUNT('1') FROM comments AS aggregate_leaf
//!      WHERE threads.id = aggregate_leaf.thread_id), 0)
//! WHERE id IN (...)
//! ```
//!
//! The owners in the WHERE clause are found by walking the inverse path from
//! every flushed object, following both current relationships and the ones
//! removed since the last flush. When part of a path has no back-reference the
//! WHERE clause falls back to the owners that have leaves or hold a
//! non-default value.

use crate::config::DerivedConfig;
use crate::declarative::{Declaration, Declarations};
use crate::index::{ClassIndex, inverse_prefixes};
use sqlmodel_derived_core::{
    AttrPath, ConfigureListener, Error, Mapper, ObjectRef, PathErrorKind, Registry, Result,
    SqlType, Value, reachable_with_history,
};
use sqlmodel_derived_query::{CorrelatedExpression, Expr, Statement, Update, correlate};
use sqlmodel_derived_session::{FlushContext, FlushListener, FlushPhase, key_filter};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Alias of the leaf table inside aggregate subqueries.
pub const LEAF_ALIAS: &str = "aggregate_leaf";

/// A resolved aggregated column.
#[derive(Debug)]
pub struct Aggregate {
    id: usize,
    owner: Arc<Mapper>,
    column: String,
    table: String,
    path: AttrPath,
    correlated: CorrelatedExpression,
    default: Value,
}

impl Aggregate {
    /// The class declaring the aggregate.
    pub fn owner(&self) -> &Arc<Mapper> {
        &self.owner
    }

    /// The aggregated column.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// The table that physically stores the column.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Relation path from the owner to the aggregated rows.
    pub fn path(&self) -> &AttrPath {
        &self.path
    }

    /// Inferred type of the aggregate expression, when known.
    pub fn sql_type(&self) -> Option<&SqlType> {
        self.correlated.sql_type.as_ref()
    }

    /// Value written when the path reaches no rows.
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// `COALESCE((subquery), default)`, correlated to the owner table.
    pub fn value_expr(&self) -> Expr {
        Expr::coalesce(vec![
            self.correlated.clone().into_expr(),
            Expr::lit(self.default.clone()),
        ])
    }

    /// Recompute the column for `owners`. `None` when there are none.
    pub fn update_owners(&self, owners: &[ObjectRef]) -> Option<Update> {
        let keys: Vec<Vec<Value>> = owners.iter().map(ObjectRef::primary_key).collect();
        let filter = key_filter(self.owner.primary_key(), &keys)?;
        Some(
            Update::new(&self.table)
                .set(&self.column, self.value_expr())
                .filter(filter),
        )
    }

    /// Recompute the column for every owner that has leaves or holds a value
    /// other than the default.
    pub fn update_correlated(&self) -> Update {
        let stale = Expr::col(&self.column).is_distinct_from(Expr::lit(self.default.clone()));
        Update::new(&self.table)
            .set(&self.column, self.value_expr())
            .filter(self.correlated.exists().or(stale))
    }
}

struct Watch {
    aggregate: Arc<Aggregate>,
    position: usize,
    /// Path from the watched class back to the owner; `None` when a segment
    /// has no back-reference.
    inverse: Option<AttrPath>,
}

#[derive(Default)]
struct State {
    aggregates: Vec<Arc<Aggregate>>,
    index: ClassIndex<Watch>,
}

/// Aggregated columns of one mapper registry.
pub struct AggregateRegistry {
    config: DerivedConfig,
    state: RwLock<State>,
}

impl std::fmt::Debug for AggregateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("AggregateRegistry")
            .field("aggregates", &state.aggregates.len())
            .field("watches", &state.index.len())
            .finish()
    }
}

impl AggregateRegistry {
    /// Flush listener name.
    pub const NAME: &'static str = "sqlmodel-derived.aggregates";

    pub fn new(config: DerivedConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every registered aggregate, in declaration order.
    pub fn aggregates(&self) -> Vec<Arc<Aggregate>> {
        self.read().aggregates.clone()
    }

    /// Aggregates declared on `class` itself.
    pub fn aggregates_of(&self, class: &str) -> Vec<Arc<Aggregate>> {
        self.read()
            .aggregates
            .iter()
            .filter(|a| a.owner.name() == class)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().aggregates.is_empty()
    }

    /// Whether changes to `class` can affect some aggregate.
    pub fn watches(&self, class: &str) -> bool {
        self.read().index.watches(class)
    }

    /// Forget every aggregate.
    pub fn clear(&self) {
        let mut state = self.write();
        state.aggregates.clear();
        state.index.clear();
    }

    fn register(&self, registry: &Registry, mapper: &Arc<Mapper>) -> Result<()> {
        let mut state = self.write();
        for declaration in Declarations::of(mapper) {
            let Declaration::Aggregate { column, path, expr } = declaration else {
                continue;
            };
            let class = mapper.name();
            let field = mapper.column(column).ok_or_else(|| {
                Error::config(class, column, format!("aggregated column '{column}' does not exist"))
            })?;
            if state
                .aggregates
                .iter()
                .any(|a| a.owner.name() == class && a.column == *column)
            {
                return Err(Error::config(class, column, "column is aggregated more than once"));
            }

            let attr = AttrPath::new(registry, class, path)?;
            if attr.is_empty() {
                return Err(Error::path(
                    PathErrorKind::InvalidSegment,
                    class,
                    path.clone(),
                    format!("aggregate '{class}.{column}' needs at least one relationship"),
                ));
            }
            let table = mapper
                .table_for_column(column)
                .unwrap_or_else(|| mapper.table())
                .to_string();
            let value = expr.build(mapper, attr.leaf(), LEAF_ALIAS);
            let correlated = correlate(&attr, &table, &value, LEAF_ALIAS, &[])?;

            let aggregate = Arc::new(Aggregate {
                id: state.aggregates.len(),
                owner: Arc::clone(mapper),
                column: column.clone(),
                table,
                path: attr.clone(),
                correlated,
                default: field.default_or_null(),
            });

            for (position, inverse) in inverse_prefixes(&attr) {
                let inverse = match inverse {
                    Ok(inverse) => Some(inverse),
                    Err(e) if self.config.correlation_fallback => {
                        tracing::debug!(
                            class,
                            column = column.as_str(),
                            position,
                            error = %e,
                            "Aggregate falls back to a correlated WHERE clause"
                        );
                        None
                    }
                    Err(e) => return Err(e),
                };
                state.index.insert(
                    attr.class_at(position).name(),
                    Watch {
                        aggregate: Arc::clone(&aggregate),
                        position,
                        inverse,
                    },
                );
            }

            tracing::debug!(
                class,
                column = column.as_str(),
                path = %attr,
                table = aggregate.table.as_str(),
                "Aggregate registered"
            );
            state.aggregates.push(aggregate);
        }
        Ok(())
    }

    /// The UPDATEs refreshing every aggregate the flushed objects can affect.
    pub fn statements(&self, ctx: &FlushContext<'_>) -> Vec<Statement> {
        let state = self.read();
        let n = state.aggregates.len();
        if n == 0 {
            return Vec::new();
        }

        let mut owners: Vec<Vec<ObjectRef>> = vec![Vec::new(); n];
        let mut seen: Vec<HashSet<ObjectRef>> = vec![HashSet::new(); n];
        let mut fallback = vec![false; n];

        for obj in ctx.changed() {
            for watch in state.index.lookup(obj.mapper()) {
                // The owner itself only matters when it was just inserted.
                if watch.position == 0 && !ctx.is_new(&obj) {
                    continue;
                }
                let id = watch.aggregate.id;
                let Some(inverse) = &watch.inverse else {
                    fallback[id] = true;
                    continue;
                };
                for owner in reachable_with_history(&obj, inverse.steps()) {
                    if ctx.is_deleted(&owner)
                        || !owner.has_identity()
                        || !owner.is_instance_of(watch.aggregate.owner.name())
                    {
                        continue;
                    }
                    if seen[id].insert(owner.clone()) {
                        owners[id].push(owner);
                    }
                }
            }
        }

        let mut statements = Vec::new();
        for aggregate in &state.aggregates {
            let update = if fallback[aggregate.id] {
                Some(aggregate.update_correlated())
            } else {
                aggregate.update_owners(&owners[aggregate.id])
            };
            let Some(mut update) = update else {
                continue;
            };
            if self.config.refresh_aggregates {
                update = update.refresh();
            }
            tracing::debug!(
                class = aggregate.owner.name(),
                column = aggregate.column.as_str(),
                owners = owners[aggregate.id].len(),
                fallback = fallback[aggregate.id],
                "Refreshing aggregate"
            );
            statements.push(update.into());
        }
        statements
    }
}

impl ConfigureListener for AggregateRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn mapper_configured(&self, registry: &Registry, mapper: &Arc<Mapper>) -> Result<()> {
        self.register(registry, mapper)
    }
}

impl FlushListener for AggregateRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn phase(&self) -> FlushPhase {
        FlushPhase::Aggregate
    }

    fn after_flush(&self, ctx: &FlushContext<'_>) -> Result<Vec<Statement>> {
        Ok(self.statements(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::{AggregateExpr, DeclareExt};
    use sqlmodel_derived_core::{
        FieldInfo, MapperBuilder, RegistryBuilder, RelationshipInfo, SqlType,
    };

    fn thread(aggregate: impl FnOnce(MapperBuilder) -> MapperBuilder) -> MapperBuilder {
        thread_with(true, aggregate)
    }

    fn thread_with(
        back_reference: bool,
        aggregate: impl FnOnce(MapperBuilder) -> MapperBuilder,
    ) -> MapperBuilder {
        let mut comments = RelationshipInfo::one_to_many("comments", "Comment", "thread_id");
        if back_reference {
            comments = comments.back_populates("thread");
        }
        aggregate(
            Mapper::builder("Thread", "threads")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("comment_count", SqlType::BigInt).default_value(0_i64))
                .relationship(comments),
        )
    }

    fn comment(back_reference: bool) -> MapperBuilder {
        let mut thread = RelationshipInfo::many_to_one("thread", "Thread", "thread_id");
        if back_reference {
            thread = thread.back_populates("comments");
        }
        Mapper::builder("Comment", "comments")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("thread_id", SqlType::BigInt))
            .relationship(thread)
    }

    fn configure(
        config: DerivedConfig,
        thread_builder: MapperBuilder,
        back_reference: bool,
    ) -> (Arc<AggregateRegistry>, Result<Arc<Registry>>) {
        let aggregates = Arc::new(AggregateRegistry::new(config));
        let mut builder = RegistryBuilder::new()
            .mapper(thread_builder)
            .mapper(comment(back_reference));
        builder.listen(aggregates.clone());
        let registry = builder.configure();
        (aggregates, registry)
    }

    #[test]
    fn registers_and_indexes_every_position() {
        let (aggregates, registry) = configure(
            DerivedConfig::default(),
            thread(|t| t.aggregated("comment_count", "comments", AggregateExpr::count())),
            true,
        );
        registry.unwrap();
        assert_eq!(aggregates.len(), 1);
        assert!(aggregates.watches("Thread"));
        assert!(aggregates.watches("Comment"));

        let agg = &aggregates.aggregates_of("Thread")[0];
        assert_eq!(agg.column(), "comment_count");
        assert_eq!(agg.table(), "threads");
        assert_eq!(agg.sql_type(), Some(&SqlType::BigInt));
        assert_eq!(agg.default_value(), &Value::BigInt(0));

        let update = agg.update_owners(&[]).map(|u| u.build().0);
        assert!(update.is_none());
    }

    #[test]
    fn renders_coalesced_update() {
        let (aggregates, registry) = configure(
            DerivedConfig::default(),
            thread(|t| t.aggregated("comment_count", "comments", AggregateExpr::count())),
            true,
        );
        let registry = registry.unwrap();
        let t = registry.create("Thread").unwrap();
        t.set_committed("id", 5_i64);

        let agg = &aggregates.aggregates()[0];
        let (sql, params) = agg.update_owners(&[t]).unwrap().build();
        assert_eq!(
            sql.replace('"', ""),
            "UPDATE threads SET comment_count = COALESCE((SELECT COUNT($1) FROM comments \
             AS aggregate_leaf WHERE threads.id = aggregate_leaf.thread_id), $2) \
             WHERE id IN ($3)"
        );
        assert_eq!(
            params,
            vec![Value::Text("1".into()), Value::BigInt(0), Value::BigInt(5)]
        );
    }

    #[test]
    fn missing_back_reference_uses_the_correlated_fallback() {
        let (aggregates, registry) = configure(
            DerivedConfig::default(),
            thread_with(false, |t| {
                t.aggregated("comment_count", "comments", AggregateExpr::count())
            }),
            false,
        );
        registry.unwrap();
        let agg = &aggregates.aggregates()[0];
        assert!(agg.path().inverse().is_err());
        assert!(aggregates.watches("Comment"));
        let (sql, _) = agg.update_correlated().build();
        let sql = sql.replace('"', "");
        assert!(sql.contains("WHERE EXISTS (SELECT $"));
        assert!(sql.ends_with("OR comment_count IS DISTINCT FROM $4"));

        let (_, registry) = configure(
            DerivedConfig::default().correlation_fallback(false),
            thread_with(false, |t| {
                t.aggregated("comment_count", "comments", AggregateExpr::count())
            }),
            false,
        );
        assert!(matches!(registry, Err(Error::Path(e)) if e.kind == PathErrorKind::MissingBackref));
    }

    #[test]
    fn invalid_declarations_fail_configuration() {
        let (_, registry) = configure(
            DerivedConfig::default(),
            thread(|t| t.aggregated("missing", "comments", AggregateExpr::count())),
            true,
        );
        assert!(matches!(registry, Err(Error::Config(_))));

        let (_, registry) = configure(
            DerivedConfig::default(),
            thread(|t| {
                t.aggregated("comment_count", "comments", AggregateExpr::count())
                    .aggregated("comment_count", "comments", AggregateExpr::count())
            }),
            true,
        );
        assert!(matches!(registry, Err(Error::Config(_))));

        let (_, registry) = configure(
            DerivedConfig::default(),
            thread(|t| t.aggregated("comment_count", "posts", AggregateExpr::count())),
            true,
        );
        assert!(
            matches!(registry, Err(Error::Path(e)) if e.kind == PathErrorKind::NotARelationship)
        );

        let (_, registry) = configure(
            DerivedConfig::default(),
            thread(|t| t.aggregated("comment_count", "", AggregateExpr::count())),
            true,
        );
        assert!(matches!(registry, Err(Error::Path(e)) if e.kind == PathErrorKind::InvalidSegment));
    }
}
