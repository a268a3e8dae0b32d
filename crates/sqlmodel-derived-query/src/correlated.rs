//! Scalar subqueries correlated to an outer table.

use crate::clause::OrderBy;
use crate::expr::Expr;
use crate::join::ChainBuilder;
use crate::select::{Select, SelectItem};
use sqlmodel_derived_core::{
    AttrPath, Error, JoinColumns, JoinSide, Mapper, PathErrorKind, Registry, Result, SqlType,
};

/// A SELECT of one expression over a relation path, correlated to the row of
/// the outer statement that owns the path's root.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedExpression {
    pub select: Select,
    /// Inferred type of the selected value, when known.
    pub sql_type: Option<SqlType>,
}

impl CorrelatedExpression {
    /// Use the SELECT as a scalar subquery.
    pub fn into_expr(self) -> Expr {
        Expr::subquery(self.select)
    }

    /// `EXISTS (...)` over the same joins and correlation.
    pub fn exists(&self) -> Expr {
        let mut select = self.select.clone();
        select.columns = vec![SelectItem {
            expr: Expr::lit(1_i64),
            alias: None,
        }];
        select.order_by.clear();
        select.limit = None;
        Expr::exists(select)
    }
}

/// Build a scalar SELECT of `expression` over `path`, starting at
/// `root_class`, correlated to `root_class`'s table in the enclosing statement.
///
/// `expression` refers to the leaf class through `leaf_alias` (or unqualified
/// column names). `order_by` only applies to non-aggregate expressions, which
/// then select the first row.
pub fn select_correlated_expression(
    registry: &Registry,
    root_class: &str,
    expression: &Expr,
    path: &str,
    leaf_alias: &str,
    order_by: &[OrderBy],
) -> Result<CorrelatedExpression> {
    let attr_path = AttrPath::new(registry, root_class, path)?;
    let outer = attr_path.root().table().to_string();
    correlate(&attr_path, &outer, expression, leaf_alias, order_by)
}

/// Like [`select_correlated_expression`] for an already resolved path,
/// correlated to `outer`, which must be one of the root class's tables.
#[tracing::instrument(level = "trace", skip(path, expression, order_by), fields(path = %path))]
pub fn correlate(
    path: &AttrPath,
    outer: &str,
    expression: &Expr,
    leaf_alias: &str,
    order_by: &[OrderBy],
) -> Result<CorrelatedExpression> {
    let root = path.root();
    let Some(first) = path.steps().first() else {
        return Err(Error::path(
            PathErrorKind::InvalidSegment,
            root.name(),
            path.path().to_string(),
            "a correlated expression needs at least one relationship",
        ));
    };

    let mut needed: Vec<String> = match &first.relationship.join {
        JoinColumns::Direct { pairs } => pairs.iter().map(|(pc, _)| pc.clone()).collect(),
        JoinColumns::Link { parent, .. } => parent.iter().map(|(pc, _)| pc.clone()).collect(),
    };
    needed.extend(
        first
            .relationship
            .filters
            .iter()
            .filter(|f| f.side == JoinSide::Parent)
            .map(|f| f.column.clone()),
    );

    let mut builder = ChainBuilder::new(Some(leaf_alias.to_string()));
    builder.correlated_root(root, outer, &needed);
    builder.expect_steps(path.len());
    for step in path.steps() {
        builder.step(step);
    }
    let (from, where_terms, positions) = builder.finish();
    let (Some(from), Some(leaf)) = (from, positions.last()) else {
        return Err(Error::path(
            PathErrorKind::InvalidSegment,
            root.name(),
            path.path().to_string(),
            "path produced no joins",
        ));
    };

    let leaf_mapper = path.leaf();
    let rebind = |qualifier: Option<&str>, name: &str| match qualifier {
        Some(q) if q != leaf_alias => Expr::qualified(q, name),
        _ => leaf.column(leaf_mapper, name),
    };

    let mut select = Select::new()
        .column(expression.map_columns(&rebind))
        .from(from);
    if let Some(correlation) = Expr::and_all(where_terms) {
        select = select.filter(correlation);
    }
    if !expression.is_aggregate() && !order_by.is_empty() {
        for key in order_by {
            select = select.order_by(OrderBy {
                expr: key.expr.map_columns(&rebind),
                ..key.clone()
            });
        }
        select = select.limit(1);
    }

    Ok(CorrelatedExpression {
        select,
        sql_type: infer_type(expression, leaf_mapper),
    })
}

fn infer_type(expression: &Expr, leaf: &Mapper) -> Option<SqlType> {
    match expression.function_name().as_deref() {
        Some("COUNT") => Some(SqlType::BigInt),
        Some("AVG") => Some(SqlType::Double),
        _ => expression
            .columns()
            .into_iter()
            .find_map(|(_, name)| leaf.column(name))
            .map(|field| field.sql_type.clone()),
    }
}
