//! FROM/JOIN clauses and the chained-join builder.
//!
//! [`chained_join`] compiles an [`AttrPath`] into a FROM clause that starts at
//! the root class and joins one class per segment. Every table gets its own
//! `<table>_<n>` alias, so self-referential paths join the same table several
//! times. Many-to-many segments join their link table first. Classes mapped
//! with joined-table inheritance contribute all of their tables, joined to each
//! other by primary key.

use crate::expr::Expr;
use sqlmodel_derived_core::{
    AttrPath, Dialect, JoinColumns, JoinFilter, JoinSide, Mapper, PathStep, Value,
};
use std::collections::HashMap;

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Type of join
    pub join_type: JoinType,
    /// Table to join
    pub table: String,
    /// Optional table alias
    pub alias: Option<String>,
    /// ON condition
    pub on: Expr,
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

impl Join {
    /// Create an INNER JOIN.
    pub fn inner(table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Inner,
            table: table.into(),
            alias: None,
            on,
        }
    }

    /// Create an aliased INNER JOIN.
    pub fn inner_aliased(table: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Self::inner(table, on)
        }
    }

    /// Create a LEFT JOIN.
    pub fn left(table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Left,
            ..Self::inner(table, on)
        }
    }

    /// Generate SQL for this JOIN clause.
    pub fn build_with_dialect(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> String {
        let mut sql = format!(
            " {} {}",
            self.join_type.as_str(),
            dialect.quote_identifier(&self.table)
        );
        if let Some(alias) = &self.alias {
            sql.push_str(&format!(" AS {}", dialect.quote_identifier(alias)));
        }
        let on_sql = self.on.build_with_dialect(dialect, params, offset);
        sql.push_str(&format!(" ON {on_sql}"));
        sql
    }
}

/// A FROM clause: one table followed by joins.
#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub table: String,
    pub alias: Option<String>,
    pub joins: Vec<Join>,
}

impl FromClause {
    /// An unaliased table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            joins: Vec::new(),
        }
    }

    /// An aliased table.
    pub fn aliased(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Self::table(table)
        }
    }

    /// Append a join.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Name the first table is referenced by.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    pub fn build_with_dialect(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> String {
        let mut sql = dialect.quote_identifier(&self.table);
        if let Some(alias) = &self.alias {
            sql.push_str(&format!(" AS {}", dialect.quote_identifier(alias)));
        }
        for join in &self.joins {
            sql.push_str(&join.build_with_dialect(dialect, params, offset));
        }
        sql
    }
}

/// A table together with the alias it is joined under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasedTable {
    pub table: String,
    pub alias: String,
}

/// The tables joined for one class position of a path, anchor table first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTables {
    pub class: String,
    pub tables: Vec<AliasedTable>,
}

impl ClassTables {
    /// Alias of the table the position was joined through.
    pub fn anchor(&self) -> &str {
        self.tables
            .first()
            .map_or(self.class.as_str(), |t| t.alias.as_str())
    }

    pub fn alias_of(&self, table: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.alias.as_str())
    }

    /// A reference to `column` of `mapper` through the right alias.
    ///
    /// Primary key columns are read from the anchor table.
    pub fn column(&self, mapper: &Mapper, column: &str) -> Expr {
        let alias = if mapper.primary_key().iter().any(|k| k == column) {
            self.anchor()
        } else {
            mapper
                .table_for_column(column)
                .and_then(|t| self.alias_of(t))
                .unwrap_or_else(|| self.anchor())
        };
        Expr::qualified(alias, column)
    }
}

/// The FROM clause for a whole path plus the aliases used at each position.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainedJoin {
    pub from: FromClause,
    /// One entry per class position, `positions[0]` being the root.
    pub positions: Vec<ClassTables>,
}

impl ChainedJoin {
    pub fn position(&self, k: usize) -> Option<&ClassTables> {
        self.positions.get(k)
    }
}

/// Compile `path` into joins starting at its root class.
#[tracing::instrument(level = "trace", skip(path), fields(path = %path))]
pub fn chained_join(path: &AttrPath) -> ChainedJoin {
    let mut builder = ChainBuilder::new(None);
    builder.root(path.root());
    for step in path.steps() {
        builder.step(step);
    }
    let (from, where_terms, positions) = builder.finish();
    let mut from = from.unwrap_or_else(|| FromClause::table(path.root().table()));
    // Terms on the FROM table are folded into the first join (or dropped for a
    // lone root, where there are none).
    if let (Some(first), Some(extra)) = (from.joins.first_mut(), Expr::and_all(where_terms)) {
        first.on = first.on.clone().and(extra);
    }
    ChainedJoin { from, positions }
}

struct Item {
    table: AliasedTable,
    on: Vec<Expr>,
}

/// Incrementally lays out the tables of a path.
pub(crate) struct ChainBuilder {
    counts: HashMap<String, usize>,
    items: Vec<Item>,
    positions: Vec<ClassTables>,
    leaf_alias: Option<String>,
    remaining: usize,
}

impl ChainBuilder {
    /// `leaf_alias`, when given, names the anchor table of the last class placed.
    pub(crate) fn new(leaf_alias: Option<String>) -> Self {
        Self {
            counts: HashMap::new(),
            items: Vec::new(),
            positions: Vec::new(),
            leaf_alias,
            remaining: 0,
        }
    }

    fn alias(&mut self, table: &str) -> String {
        let n = self.counts.entry(table.to_string()).or_insert(0);
        *n += 1;
        format!("{table}_{n}")
    }

    /// Place the root class with all of its tables.
    pub(crate) fn root(&mut self, mapper: &Mapper) {
        let anchor = mapper.base().table().to_string();
        self.place(mapper, &anchor, |_| Vec::new());
    }

    /// Place the root class as an outer, already-bound `table`. Root tables
    /// other than `outer` that store one of `needed` are joined by primary key.
    pub(crate) fn correlated_root(&mut self, mapper: &Mapper, outer: &str, needed: &[String]) {
        let mut position = ClassTables {
            class: mapper.name().to_string(),
            tables: vec![AliasedTable {
                table: outer.to_string(),
                alias: outer.to_string(),
            }],
        };
        for column in needed {
            if mapper.primary_key().contains(column) {
                continue;
            }
            let Some(table) = mapper.table_for_column(column) else {
                continue;
            };
            if position.alias_of(table).is_some() {
                continue;
            }
            let alias = self.alias(table);
            let on = mapper
                .primary_key()
                .iter()
                .map(|k| Expr::qualified(&alias, k).eq(Expr::qualified(outer, k)))
                .collect();
            self.items.push(Item {
                table: AliasedTable {
                    table: table.to_string(),
                    alias: alias.clone(),
                },
                on,
            });
            position.tables.push(AliasedTable {
                table: table.to_string(),
                alias,
            });
        }
        self.positions.push(position);
    }

    /// Number of steps still to be placed; the last one gets the leaf alias.
    pub(crate) fn expect_steps(&mut self, n: usize) {
        self.remaining = n;
    }

    /// Join the target class of `step` to the last placed position.
    pub(crate) fn step(&mut self, step: &PathStep) {
        self.remaining = self.remaining.saturating_sub(1);
        let Some(parent) = self.positions.last().cloned() else {
            return;
        };
        let rel = &step.relationship;
        let parent_filter = |f: &JoinFilter| {
            parent
                .column(&step.parent, &f.column)
                .eq(Expr::lit(f.value.clone()))
        };

        match &rel.join {
            JoinColumns::Direct { pairs } => {
                let anchor = anchor_table(&step.target, pairs.first().map(|(_, tc)| tc.as_str()));
                self.place(&step.target, &anchor, |tables| {
                    let mut terms: Vec<Expr> = pairs
                        .iter()
                        .map(|(pc, tc)| {
                            parent
                                .column(&step.parent, pc)
                                .eq(tables.column(&step.target, tc))
                        })
                        .collect();
                    for f in &rel.filters {
                        terms.push(match f.side {
                            JoinSide::Parent => parent_filter(f),
                            JoinSide::Target | JoinSide::Link => tables
                                .column(&step.target, &f.column)
                                .eq(Expr::lit(f.value.clone())),
                        });
                    }
                    terms
                });
            }
            JoinColumns::Link {
                table,
                parent: parent_pairs,
                target: target_pairs,
            } => {
                let link_alias = self.alias(table);
                let mut on: Vec<Expr> = parent_pairs
                    .iter()
                    .map(|(pc, lc)| {
                        parent
                            .column(&step.parent, pc)
                            .eq(Expr::qualified(&link_alias, lc))
                    })
                    .collect();
                for f in &rel.filters {
                    match f.side {
                        JoinSide::Parent => on.push(parent_filter(f)),
                        JoinSide::Link => on.push(
                            Expr::qualified(&link_alias, &f.column).eq(Expr::lit(f.value.clone())),
                        ),
                        JoinSide::Target => {}
                    }
                }
                self.items.push(Item {
                    table: AliasedTable {
                        table: table.clone(),
                        alias: link_alias.clone(),
                    },
                    on,
                });

                let anchor = anchor_table(
                    &step.target,
                    target_pairs.first().map(|(_, tc)| tc.as_str()),
                );
                self.place(&step.target, &anchor, |tables| {
                    let mut terms: Vec<Expr> = target_pairs
                        .iter()
                        .map(|(lc, tc)| {
                            Expr::qualified(&link_alias, lc).eq(tables.column(&step.target, tc))
                        })
                        .collect();
                    for f in rel.filters.iter().filter(|f| f.side == JoinSide::Target) {
                        terms.push(
                            tables
                                .column(&step.target, &f.column)
                                .eq(Expr::lit(f.value.clone())),
                        );
                    }
                    terms
                });
            }
        }
    }

    /// Join every table of `mapper`, `anchor` first, attaching each term to the
    /// last of the new tables it references.
    fn place<F>(&mut self, mapper: &Mapper, anchor: &str, terms: F)
    where
        F: FnOnce(&ClassTables) -> Vec<Expr>,
    {
        let mut ordered = vec![anchor.to_string()];
        for (table, _) in mapper.tables() {
            if table != anchor {
                ordered.push(table.to_string());
            }
        }

        let leaf_alias = if self.remaining == 0 {
            self.leaf_alias.take()
        } else {
            None
        };
        let mut tables = Vec::with_capacity(ordered.len());
        for (i, table) in ordered.iter().enumerate() {
            let alias = match (&leaf_alias, i) {
                (Some(alias), 0) => alias.clone(),
                _ => self.alias(table),
            };
            tables.push(AliasedTable {
                table: table.clone(),
                alias,
            });
        }
        let position = ClassTables {
            class: mapper.name().to_string(),
            tables,
        };

        let mut ons: Vec<Vec<Expr>> = vec![Vec::new(); position.tables.len()];
        let anchor_alias = position.anchor().to_string();
        for (i, t) in position.tables.iter().enumerate().skip(1) {
            ons[i] = mapper
                .primary_key()
                .iter()
                .map(|k| Expr::qualified(&t.alias, k).eq(Expr::qualified(&anchor_alias, k)))
                .collect();
        }
        for term in terms(&position) {
            let idx = term
                .columns()
                .iter()
                .filter_map(|(qualifier, _)| {
                    let q = (*qualifier)?;
                    position.tables.iter().position(|t| t.alias == q)
                })
                .max()
                .unwrap_or(0);
            ons[idx].push(term);
        }

        for (table, on) in position.tables.iter().cloned().zip(ons) {
            self.items.push(Item { table, on });
        }
        self.positions.push(position);
    }

    /// The FROM clause, the conditions of its first table (to be used in
    /// WHERE), and the per-position aliases.
    pub(crate) fn finish(self) -> (Option<FromClause>, Vec<Expr>, Vec<ClassTables>) {
        let mut items = self.items.into_iter();
        let Some(first) = items.next() else {
            return (None, Vec::new(), self.positions);
        };
        let mut from = FromClause::aliased(first.table.table, first.table.alias);
        for item in items {
            let on = Expr::and_all(item.on).unwrap_or_else(|| Expr::lit(true));
            from = from.join(Join::inner_aliased(item.table.table, item.table.alias, on));
        }
        (Some(from), first.on, self.positions)
    }
}

/// The table of `mapper` a join should enter through: the one storing the
/// first join column, or the base table for primary-key joins.
fn anchor_table(mapper: &Mapper, column: Option<&str>) -> String {
    column
        .filter(|c| !mapper.primary_key().iter().any(|k| k == c))
        .and_then(|c| mapper.table_for_column(c))
        .unwrap_or_else(|| mapper.base().table())
        .to_string()
}
