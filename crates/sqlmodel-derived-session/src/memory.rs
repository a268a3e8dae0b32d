//! In-process database.
//!
//! [`MemoryDatabase`] stores tables as rows of [`Value`]s and evaluates
//! structured statements directly: nested-loop joins, correlated subqueries,
//! aggregates, three-valued logic, auto-increment keys, and transactions via
//! table snapshots. Every statement is also rendered for the configured
//! dialect and kept in a log, so tests can assert on the SQL a flush emitted.

use crate::executor::Executor;
use asupersync::{Cx, Outcome};
use sqlmodel_derived_core::{
    Dialect, Error, FieldInfo, QueryError, QueryErrorKind, Registry, Result, Row, TypeError, Value,
};
use sqlmodel_derived_query::{
    BinaryOp, Delete, Expr, FromClause, Insert, JoinType, NullsOrder, OrderBy, OrderDirection,
    Select, SelectItem, Statement, UnaryOp, Update,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Column definition of an in-memory table.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub auto_increment: bool,
    /// Value used when an INSERT omits the column.
    pub default: Value,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_increment: false,
            default: Value::Null,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }
}

impl From<&FieldInfo> for ColumnDef {
    fn from(field: &FieldInfo) -> Self {
        Self {
            name: field.name.clone(),
            auto_increment: field.auto_increment,
            default: field.default_or_null(),
        }
    }
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<ColumnDef>,
    key: Vec<usize>,
    rows: Vec<Vec<Value>>,
    /// An all-NULL row for the unmatched side of LEFT JOINs.
    nulls: Vec<Value>,
    next_id: i64,
}

impl Table {
    fn new(columns: Vec<ColumnDef>, key: &[&str]) -> Self {
        let key = key
            .iter()
            .filter_map(|k| columns.iter().position(|c| c.name == *k))
            .collect();
        Self {
            nulls: vec![Value::Null; columns.len()],
            columns,
            key,
            rows: Vec::new(),
            next_id: 1,
        }
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    fn auto_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.auto_increment)
    }

    fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    snapshot: Option<BTreeMap<String, Table>>,
    log: Vec<String>,
}

/// A database held in memory.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    dialect: Dialect,
    state: Mutex<State>,
}

impl MemoryDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// A database with one table per mapped table and link table of `registry`.
    pub fn from_registry(registry: &Registry) -> Self {
        let db = Self::new();
        for mapper in registry.mappers() {
            let key: Vec<&str> = mapper.primary_key().iter().map(String::as_str).collect();
            db.create_table(
                mapper.table(),
                mapper.local_columns().iter().map(ColumnDef::from).collect(),
                &key,
            );
            for rel in mapper.relationships() {
                let Some(link) = &rel.info.link_table else {
                    continue;
                };
                let names: Vec<&str> = link
                    .local_columns
                    .iter()
                    .chain(&link.remote_columns)
                    .map(String::as_str)
                    .collect();
                db.create_table(
                    &link.table_name,
                    names.iter().copied().map(ColumnDef::new).collect(),
                    &names,
                );
            }
        }
        db
    }

    /// Render logged statements for `dialect`.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `table` unless it already exists.
    pub fn create_table(&self, table: &str, columns: Vec<ColumnDef>, key: &[&str]) {
        let mut state = self.lock();
        if !state.tables.contains_key(table) {
            tracing::trace!(table, columns = columns.len(), "Creating in-memory table");
            state
                .tables
                .insert(table.to_string(), Table::new(columns, key));
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }

    /// All rows of `table` in insertion order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let state = self.lock();
        let t = state.tables.get(table).ok_or_else(|| no_table(table))?;
        let names = t.names();
        Ok(t.rows
            .iter()
            .map(|r| Row::new(names.clone(), r.clone()))
            .collect())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// SQL of every statement and query run so far.
    pub fn executed(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    fn record(&self, state: &mut State, sql: String) {
        tracing::debug!(sql = %sql, "memory database");
        state.log.push(sql);
    }

    fn run(&self, statement: &Statement) -> Result<u64> {
        let mut state = self.lock();
        let (sql, _) = statement.build_with_dialect(self.dialect);
        self.record(&mut state, sql);
        match statement {
            Statement::Insert(insert) => insert_row(&mut state, insert).map(|_| 1),
            Statement::Update(update) => update_rows(&mut state, update),
            Statement::Delete(delete) => delete_rows(&mut state, delete),
            Statement::Begin => {
                if state.snapshot.is_none() {
                    state.snapshot = Some(state.tables.clone());
                }
                Ok(0)
            }
            Statement::Commit => {
                state.snapshot = None;
                Ok(0)
            }
            Statement::Rollback => {
                if let Some(tables) = state.snapshot.take() {
                    state.tables = tables;
                }
                Ok(0)
            }
        }
    }

    fn run_insert(&self, insert: &Insert) -> Result<Option<i64>> {
        let mut state = self.lock();
        let (sql, _) = insert.build_with_dialect(self.dialect);
        self.record(&mut state, sql);
        insert_row(&mut state, insert)
    }

    fn run_query(&self, select: &Select) -> Result<Vec<Row>> {
        let mut state = self.lock();
        let (sql, _) = select.build_with_dialect(self.dialect);
        self.record(&mut state, sql);
        let eval = Eval {
            tables: &state.tables,
        };
        let (names, rows) = eval.select(select, None)?;
        Ok(rows.into_iter().map(|r| Row::new(names.clone(), r)).collect())
    }
}

fn outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl Executor for MemoryDatabase {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn execute(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.run(statement);
        async move { outcome(result) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        insert: &Insert,
    ) -> impl Future<Output = Outcome<Option<i64>, Error>> + Send {
        let result = self.run_insert(insert);
        async move { outcome(result) }
    }

    fn query(
        &self,
        _cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run_query(select);
        async move { outcome(result) }
    }
}

// ============================================================================
// Writes
// ============================================================================

fn no_table(table: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::NotFound,
        format!("relation \"{table}\" does not exist"),
    ))
}

fn no_column(table: &str, column: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::NotFound,
        format!("column \"{column}\" of relation \"{table}\" does not exist"),
    ))
}

fn insert_row(state: &mut State, insert: &Insert) -> Result<Option<i64>> {
    let table = state
        .tables
        .get_mut(&insert.table)
        .ok_or_else(|| no_table(&insert.table))?;

    let mut row: Vec<Value> = table.columns.iter().map(|c| c.default.clone()).collect();
    for (column, value) in insert.columns.iter().zip(&insert.values) {
        let i = table
            .index_of(column)
            .ok_or_else(|| no_column(&insert.table, column))?;
        if !matches!(value, Value::Default) {
            row[i] = value.clone();
        }
    }

    let mut generated = None;
    if let Some(i) = table.auto_column() {
        if row[i].is_null() {
            row[i] = Value::BigInt(table.next_id);
            generated = Some(table.next_id);
            table.next_id += 1;
        } else if let Some(id) = row[i].as_i64() {
            table.next_id = table.next_id.max(id + 1);
            generated = Some(id);
        }
    }

    if !table.key.is_empty() && table.key.iter().all(|&k| !row[k].is_null()) {
        let duplicate = table
            .rows
            .iter()
            .any(|existing| table.key.iter().all(|&k| existing[k].not_distinct(&row[k])));
        if duplicate {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Constraint,
                format!(
                    "duplicate key value violates unique constraint on \"{}\"",
                    insert.table
                ),
            )));
        }
    }

    table.rows.push(row);
    Ok(generated)
}

fn update_rows(state: &mut State, update: &Update) -> Result<u64> {
    let table = state
        .tables
        .get(&update.table)
        .ok_or_else(|| no_table(&update.table))?;
    let targets = update
        .set
        .iter()
        .map(|(c, _)| table.index_of(c).ok_or_else(|| no_column(&update.table, c)))
        .collect::<Result<Vec<_>>>()?;

    let eval = Eval {
        tables: &state.tables,
    };
    let mut changes = Vec::new();
    for (ri, row) in table.rows.iter().enumerate() {
        let bindings = [Binding {
            alias: &update.table,
            table,
            row,
        }];
        let scope = Scope {
            bindings: &bindings,
            outer: None,
        };
        if let Some(filter) = &update.where_clause {
            if eval.truth(filter, &scope)? != Some(true) {
                continue;
            }
        }
        let values = update
            .set
            .iter()
            .map(|(_, e)| eval.eval(e, &scope, None))
            .collect::<Result<Vec<_>>>()?;
        changes.push((ri, values));
    }

    let table = state
        .tables
        .get_mut(&update.table)
        .ok_or_else(|| no_table(&update.table))?;
    for (ri, values) in &changes {
        for (&ci, value) in targets.iter().zip(values) {
            table.rows[*ri][ci] = value.clone();
        }
    }
    Ok(changes.len() as u64)
}

fn delete_rows(state: &mut State, delete: &Delete) -> Result<u64> {
    let table = state
        .tables
        .get(&delete.table)
        .ok_or_else(|| no_table(&delete.table))?;
    let eval = Eval {
        tables: &state.tables,
    };
    let mut doomed = HashSet::new();
    for (ri, row) in table.rows.iter().enumerate() {
        let keep = match &delete.where_clause {
            Some(filter) => {
                let bindings = [Binding {
                    alias: &delete.table,
                    table,
                    row,
                }];
                let scope = Scope {
                    bindings: &bindings,
                    outer: None,
                };
                eval.truth(filter, &scope)? != Some(true)
            }
            None => false,
        };
        if !keep {
            doomed.insert(ri);
        }
    }

    let table = state
        .tables
        .get_mut(&delete.table)
        .ok_or_else(|| no_table(&delete.table))?;
    let mut index = 0;
    table.rows.retain(|_| {
        let keep = !doomed.contains(&index);
        index += 1;
        keep
    });
    Ok(doomed.len() as u64)
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Binding<'a> {
    alias: &'a str,
    table: &'a Table,
    row: &'a [Value],
}

/// Rows visible to an expression: the current row's tables, then enclosing
/// queries' rows for correlated subqueries.
#[derive(Debug, Clone, Copy)]
struct Scope<'a, 'p> {
    bindings: &'p [Binding<'a>],
    outer: Option<&'p Scope<'a, 'p>>,
}

impl<'a> Scope<'a, '_> {
    fn lookup(&self, qualifier: Option<&str>, column: &str) -> Option<&'a Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            for binding in current.bindings {
                if qualifier.is_some_and(|q| q != binding.alias) {
                    continue;
                }
                if let Some(i) = binding.table.index_of(column) {
                    return binding.row.get(i);
                }
            }
            scope = current.outer;
        }
        None
    }
}

fn type_error(expected: &'static str, actual: String) -> Error {
    Error::Type(TypeError {
        expected,
        actual,
        column: None,
    })
}

fn truth_value(value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null | Value::Default => Ok(None),
        other => other
            .as_bool()
            .map(Some)
            .ok_or_else(|| type_error("boolean", other.type_name().to_string())),
    }
}

fn output_name(item: &SelectItem) -> String {
    if let Some(alias) = &item.alias {
        return alias.clone();
    }
    match &item.expr {
        Expr::Column { name, .. } => name.clone(),
        Expr::Function { name, .. } => name.to_ascii_lowercase(),
        Expr::CountStar => "count".to_string(),
        _ => "?column?".to_string(),
    }
}

fn compare_keys(order: &[OrderBy], a: &[Value], b: &[Value]) -> Ordering {
    for (key, (x, y)) in order.iter().zip(a.iter().zip(b)) {
        let desc = key.direction == OrderDirection::Desc;
        let nulls_first = key.nulls.map_or(desc, |n| n == NullsOrder::First);
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if desc => y.sort_cmp(x),
            (false, false) => x.sort_cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

struct Eval<'a> {
    tables: &'a BTreeMap<String, Table>,
}

impl<'a> Eval<'a> {
    fn table(&self, name: &str) -> Result<&'a Table> {
        self.tables.get(name).ok_or_else(|| no_table(name))
    }

    fn join_rows(
        &self,
        from: &'a FromClause,
        outer: Option<&Scope<'a, '_>>,
    ) -> Result<Vec<Vec<Binding<'a>>>> {
        let table = self.table(&from.table)?;
        let alias = from.reference();
        let mut combos: Vec<Vec<Binding<'a>>> = table
            .rows
            .iter()
            .map(|row| vec![Binding { alias, table, row }])
            .collect();

        for join in &from.joins {
            let table = self.table(&join.table)?;
            let alias = join.alias.as_deref().unwrap_or(&join.table);
            let mut next = Vec::new();
            for combo in &combos {
                let mut matched = false;
                for row in &table.rows {
                    let mut candidate = combo.clone();
                    candidate.push(Binding { alias, table, row });
                    let scope = Scope {
                        bindings: &candidate,
                        outer,
                    };
                    if self.truth(&join.on, &scope)? == Some(true) {
                        matched = true;
                        next.push(candidate);
                    }
                }
                if !matched && join.join_type == JoinType::Left {
                    let mut candidate = combo.clone();
                    candidate.push(Binding {
                        alias,
                        table,
                        row: &table.nulls,
                    });
                    next.push(candidate);
                }
            }
            combos = next;
        }
        Ok(combos)
    }

    fn select(
        &self,
        select: &'a Select,
        outer: Option<&Scope<'a, '_>>,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let combos = match &select.from {
            Some(from) => self.join_rows(from, outer)?,
            None => vec![Vec::new()],
        };

        let mut matched = Vec::new();
        for combo in combos {
            let keep = match &select.where_clause {
                Some(filter) => {
                    let scope = Scope {
                        bindings: &combo,
                        outer,
                    };
                    self.truth(filter, &scope)? == Some(true)
                }
                None => true,
            };
            if keep {
                matched.push(combo);
            }
        }

        let star = select.columns.is_empty();
        let names: Vec<String> = if star {
            match matched.first() {
                Some(combo) => combo.iter().flat_map(|b| b.table.names()).collect(),
                None => match &select.from {
                    Some(from) => {
                        let mut names = self.table(&from.table)?.names();
                        for join in &from.joins {
                            names.extend(self.table(&join.table)?.names());
                        }
                        names
                    }
                    None => Vec::new(),
                },
            }
        } else {
            select.columns.iter().map(output_name).collect()
        };

        if select.columns.iter().any(|c| c.expr.is_aggregate()) {
            let first = matched.first().map_or(&[][..], Vec::as_slice);
            let scope = Scope {
                bindings: first,
                outer,
            };
            let values = select
                .columns
                .iter()
                .map(|c| self.eval(&c.expr, &scope, Some(matched.as_slice())))
                .collect::<Result<Vec<_>>>()?;
            let rows = if select.limit == Some(0) {
                Vec::new()
            } else {
                vec![values]
            };
            return Ok((names, rows));
        }

        let mut keyed = Vec::with_capacity(matched.len());
        for combo in &matched {
            let scope = Scope {
                bindings: combo,
                outer,
            };
            let values = if star {
                combo.iter().flat_map(|b| b.row.iter().cloned()).collect()
            } else {
                select
                    .columns
                    .iter()
                    .map(|c| self.eval(&c.expr, &scope, None))
                    .collect::<Result<Vec<_>>>()?
            };
            let keys = select
                .order_by
                .iter()
                .map(|o| self.eval(&o.expr, &scope, None))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((keys, values));
        }
        if !select.order_by.is_empty() {
            keyed.sort_by(|a, b| compare_keys(&select.order_by, &a.0, &b.0));
        }

        let mut rows: Vec<Vec<Value>> = keyed.into_iter().map(|(_, v)| v).collect();
        if select.distinct {
            let mut unique: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
            for row in rows {
                let seen = unique.iter().any(|u| {
                    u.len() == row.len() && u.iter().zip(&row).all(|(a, b)| a.not_distinct(b))
                });
                if !seen {
                    unique.push(row);
                }
            }
            rows = unique;
        }
        if let Some(n) = select.limit {
            rows.truncate(usize::try_from(n).unwrap_or(usize::MAX));
        }
        Ok((names, rows))
    }

    fn truth(&self, expr: &'a Expr, scope: &Scope<'a, '_>) -> Result<Option<bool>> {
        truth_value(&self.eval(expr, scope, None)?)
    }

    fn eval(
        &self,
        expr: &'a Expr,
        scope: &Scope<'a, '_>,
        group: Option<&[Vec<Binding<'a>>]>,
    ) -> Result<Value> {
        match expr {
            Expr::Column { table, name } => scope
                .lookup(table.as_deref(), name)
                .cloned()
                .ok_or_else(|| {
                    let full = match table {
                        Some(t) => format!("{t}.{name}"),
                        None => name.clone(),
                    };
                    Error::Query(QueryError::new(
                        QueryErrorKind::NotFound,
                        format!("column {full} does not exist"),
                    ))
                }),
            Expr::Literal(Value::Default) => Ok(Value::Null),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Binary { left, op, right } => self.binary(left, *op, right, scope, group),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr, scope, group)?;
                match op {
                    UnaryOp::Not => Ok(truth_value(&value)?.map_or(Value::Null, |b| Value::Bool(!b))),
                    UnaryOp::Neg => Value::BigInt(0).checked_sub(&value),
                }
            }
            Expr::Function { name, args } => self.function(name, args, scope, group),
            Expr::CountStar => {
                let group = group.ok_or_else(|| misplaced_aggregate("COUNT"))?;
                Ok(Value::BigInt(i64::try_from(group.len()).unwrap_or(i64::MAX)))
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                let needle = self.eval(expr, scope, group)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let mut unknown = false;
                for candidate in values {
                    match needle.sql_eq(&self.eval(candidate, scope, group)?) {
                        Some(true) => return Ok(Value::Bool(!negated)),
                        Some(false) => {}
                        None => unknown = true,
                    }
                }
                Ok(if unknown {
                    Value::Null
                } else {
                    Value::Bool(*negated)
                })
            }
            Expr::IsNull { expr, negated } => {
                Ok(Value::Bool(self.eval(expr, scope, group)?.is_null() != *negated))
            }
            Expr::IsDistinctFrom {
                left,
                right,
                negated,
            } => {
                let l = self.eval(left, scope, group)?;
                let r = self.eval(right, scope, group)?;
                Ok(Value::Bool(l.not_distinct(&r) == *negated))
            }
            Expr::Subquery(select) => {
                let (_, rows) = self.select(select, Some(scope))?;
                if rows.len() > 1 {
                    return Err(Error::Query(QueryError::new(
                        QueryErrorKind::Database,
                        "more than one row returned by a subquery used as an expression",
                    )));
                }
                Ok(rows
                    .into_iter()
                    .next()
                    .and_then(|r| r.into_iter().next())
                    .unwrap_or(Value::Null))
            }
            Expr::Exists { subquery, negated } => {
                let (_, rows) = self.select(subquery, Some(scope))?;
                Ok(Value::Bool(rows.is_empty() == *negated))
            }
            Expr::Paren(inner) => self.eval(inner, scope, group),
        }
    }

    fn binary(
        &self,
        left: &'a Expr,
        op: BinaryOp,
        right: &'a Expr,
        scope: &Scope<'a, '_>,
        group: Option<&[Vec<Binding<'a>>]>,
    ) -> Result<Value> {
        let l = self.eval(left, scope, group)?;
        match op {
            BinaryOp::And => {
                let l = truth_value(&l)?;
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = truth_value(&self.eval(right, scope, group)?)?;
                Ok(match (l, r) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            BinaryOp::Or => {
                let l = truth_value(&l)?;
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = truth_value(&self.eval(right, scope, group)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            BinaryOp::Add => l.checked_add(&self.eval(right, scope, group)?),
            BinaryOp::Sub => l.checked_sub(&self.eval(right, scope, group)?),
            BinaryOp::Mul => l.checked_mul(&self.eval(right, scope, group)?),
            BinaryOp::Div => l.checked_div(&self.eval(right, scope, group)?),
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                let r = self.eval(right, scope, group)?;
                if l.is_null() || r.is_null() {
                    return Ok(Value::Null);
                }
                let ord = l.sql_cmp(&r).ok_or_else(|| {
                    type_error(
                        "comparable operands",
                        format!("{} {} {}", l.type_name(), op.as_str(), r.type_name()),
                    )
                })?;
                Ok(Value::Bool(match op {
                    BinaryOp::Eq => ord == Ordering::Equal,
                    BinaryOp::Ne => ord != Ordering::Equal,
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::Le => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }))
            }
        }
    }

    fn function(
        &self,
        name: &str,
        args: &'a [Expr],
        scope: &Scope<'a, '_>,
        group: Option<&[Vec<Binding<'a>>]>,
    ) -> Result<Value> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" => {
                let group = group.ok_or_else(|| misplaced_aggregate(&upper))?;
                let arg = args.first().ok_or_else(|| {
                    Error::Query(QueryError::new(
                        QueryErrorKind::Syntax,
                        format!("{upper} needs an argument"),
                    ))
                })?;
                let mut values = Vec::new();
                for row in group {
                    let row_scope = Scope {
                        bindings: row,
                        outer: scope.outer,
                    };
                    let value = self.eval(arg, &row_scope, None)?;
                    if !value.is_null() {
                        values.push(value);
                    }
                }
                aggregate(&upper, values)
            }
            "COALESCE" => {
                for arg in args {
                    let value = self.eval(arg, scope, group)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                Ok(Value::Null)
            }
            "LOWER" | "UPPER" => {
                let value = match args.first() {
                    Some(arg) => self.eval(arg, scope, group)?,
                    None => Value::Null,
                };
                match value {
                    Value::Null => Ok(Value::Null),
                    Value::Text(s) if upper == "LOWER" => Ok(Value::Text(s.to_lowercase())),
                    Value::Text(s) => Ok(Value::Text(s.to_uppercase())),
                    other => Err(type_error("text", other.type_name().to_string())),
                }
            }
            _ => Err(Error::Query(QueryError::new(
                QueryErrorKind::NotFound,
                format!("function {name} does not exist"),
            ))),
        }
    }
}

fn misplaced_aggregate(name: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::Syntax,
        format!("aggregate {name} is not allowed here"),
    ))
}

fn aggregate(name: &str, values: Vec<Value>) -> Result<Value> {
    let count = values.len();
    match name {
        "COUNT" => Ok(Value::BigInt(i64::try_from(count).unwrap_or(i64::MAX))),
        "SUM" | "AVG" => {
            let mut iter = values.into_iter();
            let Some(mut total) = iter.next() else {
                return Ok(Value::Null);
            };
            for v in iter {
                total = total.checked_add(&v)?;
            }
            if name == "SUM" {
                return Ok(total);
            }
            let total = total
                .as_f64()
                .ok_or_else(|| type_error("numeric operands", total.type_name().to_string()))?;
            Ok(Value::Double(total / count as f64))
        }
        _ => {
            let want = if name == "MIN" {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best: Option<Value> = None;
            for v in values {
                best = Some(match best {
                    None => v,
                    Some(current) => {
                        let ord = v.sql_cmp(&current).ok_or_else(|| {
                            type_error(
                                "comparable operands",
                                format!("{} and {}", v.type_name(), current.type_name()),
                            )
                        })?;
                        if ord == want { v } else { current }
                    }
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use sqlmodel_derived_query::Join;

    fn db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(
            "threads",
            vec![
                ColumnDef::new("id").auto_increment(),
                ColumnDef::new("comment_count").default_value(0_i64),
            ],
            &["id"],
        );
        db.create_table(
            "comments",
            vec![
                ColumnDef::new("id").auto_increment(),
                ColumnDef::new("thread_id"),
                ColumnDef::new("score"),
            ],
            &["id"],
        );
        for _ in 0..2 {
            db.run_insert(&Insert::new("threads")).unwrap();
        }
        for (thread, score) in [(1_i64, 3_i64), (1, 5), (2, 7)] {
            db.run_insert(
                &Insert::new("comments")
                    .value("thread_id", thread)
                    .value("score", score),
            )
            .unwrap();
        }
        db
    }

    fn scalar(db: &MemoryDatabase, select: &Select) -> Value {
        db.run_query(select).unwrap()[0].get(0).cloned().unwrap()
    }

    #[test]
    fn auto_increment_and_unique_keys() {
        let db = db();
        assert_eq!(db.row_count("threads"), 2);
        let id = db.run_insert(&Insert::new("threads").returning("id")).unwrap();
        assert_eq!(id, Some(3));
        let err = db
            .run_insert(&Insert::new("threads").value("id", 1_i64))
            .unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::Constraint));
        let rows = db.rows("threads").unwrap();
        assert_eq!(rows[0].get_by_name("comment_count"), Some(&Value::BigInt(0)));
    }

    #[test]
    fn joins_and_aggregates() {
        let db = db();
        let select = Select::new()
            .column(Expr::qualified("c", "score").sum())
            .from(FromClause::aliased("threads", "t").join(Join::inner_aliased(
                "comments",
                "c",
                Expr::qualified("t", "id").eq(Expr::qualified("c", "thread_id")),
            )))
            .filter(Expr::qualified("t", "id").eq(1_i64));
        assert_eq!(scalar(&db, &select), Value::BigInt(8));

        let empty = Select::new()
            .column(Expr::col("score").max())
            .from_table("comments")
            .filter(Expr::col("thread_id").eq(99_i64));
        assert_eq!(scalar(&db, &empty), Value::Null);
        let avg = Select::new().column(Expr::col("score").avg()).from_table("comments");
        assert_eq!(scalar(&db, &avg), Value::Double(5.0));
    }

    #[test]
    fn left_join_keeps_unmatched_rows() {
        let db = db();
        db.run_insert(&Insert::new("threads")).unwrap();
        let select = Select::new()
            .column(Expr::qualified("t", "id"))
            .from(FromClause::aliased("threads", "t").join(Join {
                alias: Some("c".into()),
                ..Join::left(
                    "comments",
                    Expr::qualified("t", "id").eq(Expr::qualified("c", "thread_id")),
                )
            }))
            .filter(Expr::qualified("c", "id").is_null());
        let rows = db.run_query(&select).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(3)));
    }

    #[test]
    fn correlated_update() {
        let db = db();
        let count = Select::new()
            .column(Expr::col("id").count())
            .from(FromClause::aliased("comments", "c"))
            .filter(Expr::qualified("threads", "id").eq(Expr::qualified("c", "thread_id")));
        let update = Update::new("threads")
            .set(
                "comment_count",
                Expr::coalesce(vec![Expr::subquery(count), Expr::lit(0_i64)]),
            )
            .filter(Expr::col("id").in_list(vec![1_i64]));
        assert_eq!(db.run(&update.into()).unwrap(), 1);
        let rows = db.rows("threads").unwrap();
        assert_eq!(rows[0].get_by_name("comment_count"), Some(&Value::BigInt(2)));
        assert_eq!(rows[1].get_by_name("comment_count"), Some(&Value::BigInt(0)));
        assert!(db.executed().last().unwrap().starts_with("UPDATE \"threads\""));
    }

    #[test]
    fn scalar_subquery_with_many_rows_fails() {
        let db = db();
        let inner = Select::new().column(Expr::col("id")).from_table("comments");
        let outer = Select::new().column(Expr::subquery(inner));
        assert!(db.run_query(&outer).is_err());
    }

    #[test]
    fn three_valued_logic() {
        let db = db();
        let select = |e: Expr| Select::new().column(e);
        assert_eq!(
            scalar(&db, &select(Expr::null().and(false))),
            Value::Bool(false)
        );
        assert_eq!(scalar(&db, &select(Expr::null().or(false))), Value::Null);
        assert_eq!(
            scalar(&db, &select(Expr::lit(1_i64).in_list(vec![Expr::null(), Expr::lit(2_i64)]))),
            Value::Null
        );
        assert_eq!(
            scalar(&db, &select(Expr::null().is_not_distinct_from(Expr::null()))),
            Value::Bool(true)
        );
    }

    #[test]
    fn ordering_distinct_and_limit() {
        let db = db();
        let select = Select::new()
            .column(Expr::col("thread_id"))
            .from_table("comments")
            .order_by(Expr::col("thread_id").desc())
            .distinct();
        let rows = db.run_query(&select).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.get(0).cloned().unwrap()).collect();
        assert_eq!(ids, vec![Value::BigInt(2), Value::BigInt(1)]);

        let top = Select::new()
            .column(Expr::col("score"))
            .from_table("comments")
            .order_by(Expr::col("score").desc())
            .limit(1);
        assert_eq!(scalar(&db, &top), Value::BigInt(7));
    }

    #[test]
    fn rollback_restores_snapshot() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let db = db();
        rt.block_on(async {
            assert!(matches!(db.execute(&cx, &Statement::Begin).await, Outcome::Ok(0)));
            let delete = Statement::from(Delete::new("comments"));
            assert!(matches!(db.execute(&cx, &delete).await, Outcome::Ok(3)));
            assert_eq!(db.row_count("comments"), 0);
            assert!(matches!(db.execute(&cx, &Statement::Rollback).await, Outcome::Ok(0)));
        });
        assert_eq!(db.row_count("comments"), 3);
        assert!(!db.in_transaction());
    }

    #[test]
    fn unknown_tables_and_columns() {
        let db = db();
        assert!(db.rows("nope").is_err());
        let bad = Select::new().column(Expr::col("nope")).from_table("threads");
        assert!(matches!(db.run_query(&bad), Err(Error::Query(_))));
    }
}
