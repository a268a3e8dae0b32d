//! Flush planning for the session.
//!
//! This module decides what a flush writes and in which order:
//! - INSERT parent-first, ordered per object (a topological sort over the
//!   foreign keys between the rows being inserted), base table before subclass
//!   table;
//! - UPDATE only the columns that changed, per table of the hierarchy;
//! - link-table rows derived from many-to-many history;
//! - DELETE child-first, subclass table before base table.
//!
//! Foreign keys follow the object graph: a row takes the key of the object its
//! many-to-one points at, and a parent pushes its key into the members of its
//! one-to-many collections.

use sqlmodel_derived_core::{
    DependencyError, Error, FieldInfo, JoinColumns, ObjectRef, Registry, RelationshipKind,
    Result, Value, hash_values,
};
use sqlmodel_derived_query::{Delete, Expr, Insert, Statement, Update};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// A pending link table operation (for many-to-many relationships).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTableOp {
    /// Insert a link row.
    Link {
        table: String,
        columns: Vec<(String, Value)>,
    },
    /// Delete matching link rows.
    Unlink {
        table: String,
        columns: Vec<(String, Value)>,
    },
}

impl LinkTableOp {
    pub fn link(table: impl Into<String>, columns: Vec<(String, Value)>) -> Self {
        Self::Link {
            table: table.into(),
            columns,
        }
    }

    pub fn unlink(table: impl Into<String>, columns: Vec<(String, Value)>) -> Self {
        Self::Unlink {
            table: table.into(),
            columns,
        }
    }

    /// Get the table name.
    pub fn table(&self) -> &str {
        match self {
            LinkTableOp::Link { table, .. } | LinkTableOp::Unlink { table, .. } => table,
        }
    }

    pub fn columns(&self) -> &[(String, Value)] {
        match self {
            LinkTableOp::Link { columns, .. } | LinkTableOp::Unlink { columns, .. } => columns,
        }
    }

    /// Check if this is a link (insert) operation.
    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }

    /// Check if this is an unlink (delete) operation.
    pub fn is_unlink(&self) -> bool {
        matches!(self, LinkTableOp::Unlink { .. })
    }

    /// Identity of the row, independent of which side recorded it.
    fn key(&self) -> (bool, String, u64) {
        let mut columns = self.columns().to_vec();
        columns.sort_by(|a, b| a.0.cmp(&b.0));
        let names: Vec<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
        let values: Vec<Value> = columns.iter().map(|(_, v)| v.clone()).collect();
        (
            self.is_link(),
            format!("{}({})", self.table(), names.join(",")),
            hash_values(&values),
        )
    }

    pub fn to_statement(&self) -> Statement {
        match self {
            LinkTableOp::Link { table, columns } => {
                let mut insert = Insert::new(table);
                for (column, value) in columns {
                    insert = insert.value(column, value.clone());
                }
                insert.into()
            }
            LinkTableOp::Unlink { table, columns } => {
                let mut delete = Delete::new(table);
                for (column, value) in columns {
                    delete = delete.filter(Expr::col(column).eq(value.clone()));
                }
                delete.into()
            }
        }
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of objects inserted.
    pub inserted: usize,
    /// Number of UPDATE statements for modified objects.
    pub updated: usize,
    /// Number of objects deleted.
    pub deleted: usize,
    /// Link rows inserted.
    pub linked: usize,
    /// Link row deletions.
    pub unlinked: usize,
    /// Statements emitted by after-flush listeners.
    pub derived: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of object operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

// ============================================================================
// Object graph
// ============================================================================

/// Every object reachable from `roots` through relationships, in discovery
/// order. Objects in `skip` and deleted objects are neither returned nor
/// traversed.
pub fn cascade(roots: &[ObjectRef], skip: &HashSet<ObjectRef>) -> Vec<ObjectRef> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<ObjectRef> = roots.iter().cloned().collect();
    let mut out = Vec::new();
    while let Some(obj) = queue.pop_front() {
        if skip.contains(&obj) || obj.is_deleted() || !seen.insert(obj.clone()) {
            continue;
        }
        for rel in obj.mapper().relationships() {
            queue.extend(
                obj.collection(rel.name())
                    .into_iter()
                    .filter(|t| !seen.contains(t)),
            );
        }
        out.push(obj);
    }
    out
}

/// Order `objects` so that every row is inserted after the rows it references.
///
/// Objects that do not depend on each other keep their relative order.
pub fn order_inserts(objects: &[ObjectRef]) -> Result<Vec<ObjectRef>> {
    let n = objects.len();
    let index: HashMap<&ObjectRef, usize> = objects.iter().enumerate().map(|(i, o)| (o, i)).collect();
    let mut after: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut pending = vec![0_usize; n];

    for (i, obj) in objects.iter().enumerate() {
        for rel in obj.mapper().relationships() {
            if rel.kind() == RelationshipKind::ManyToMany {
                continue;
            }
            for target in obj.collection(rel.name()) {
                let Some(&j) = index.get(&target) else {
                    continue;
                };
                if i == j {
                    continue;
                }
                let (first, then) = if rel.info.fk_on_parent() { (j, i) } else { (i, j) };
                if !after[first].contains(&then) {
                    after[first].push(then);
                    pending[then] += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..n).filter(|&i| pending[i] == 0).map(Reverse).collect();
    let mut out = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        out.push(objects[i].clone());
        for &j in &after[i] {
            pending[j] -= 1;
            if pending[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if out.len() < n {
        let chain: Vec<String> = (0..n)
            .filter(|&i| pending[i] > 0)
            .map(|i| objects[i].class_name().to_string())
            .collect();
        tracing::warn!(chain = ?chain, "Circular insert dependency");
        return Err(Error::Dependency(DependencyError {
            chain,
            message: "rows to insert reference each other in a cycle".to_string(),
        }));
    }
    Ok(out)
}

/// `roots` plus everything their cascade-delete relationships hold, parents
/// before children. Members of other one-to-many relationships are detached
/// from the deleted parent and get their foreign key nulled.
pub fn expand_deletes(roots: &[ObjectRef]) -> Result<Vec<ObjectRef>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<ObjectRef> = roots.iter().cloned().collect();
    while let Some(obj) = queue.pop_front() {
        if !seen.insert(obj.clone()) {
            continue;
        }
        for rel in obj.mapper().relationships() {
            if rel.info.fk_on_parent() || rel.kind() == RelationshipKind::ManyToMany {
                continue;
            }
            let members = obj.collection(rel.name());
            if rel.info.cascade_delete {
                tracing::trace!(
                    class = obj.class_name(),
                    relationship = rel.name(),
                    count = members.len(),
                    "Cascading delete"
                );
                queue.extend(members);
                continue;
            }
            for member in members {
                if seen.contains(&member) || roots.contains(&member) {
                    continue;
                }
                detach_member(&obj, rel.name(), &member)?;
            }
        }
        out.push(obj);
    }
    Ok(out)
}

fn detach_member(parent: &ObjectRef, name: &str, member: &ObjectRef) -> Result<()> {
    let Some(rel) = parent.mapper().relationship(name).cloned() else {
        return Ok(());
    };
    let scalar_back = rel.back_populates().filter(|back| {
        member
            .mapper()
            .relationship(back)
            .is_some_and(|r| !r.is_collection())
    });
    match scalar_back {
        Some(back) => member.set_related(back, None)?,
        None if rel.is_collection() => {
            parent.remove(name, member)?;
        }
        None => parent.set_related(name, None)?,
    }
    for (_, fk) in rel.target_foreign_keys(parent.mapper().primary_key()) {
        member.set(&fk, Value::Null)?;
    }
    Ok(())
}

// ============================================================================
// Foreign keys
// ============================================================================

/// Copy the key of each many-to-one target into `obj`'s foreign key columns.
/// A target removed since the last flush and not replaced nulls the columns.
pub fn pull_foreign_keys(obj: &ObjectRef) -> Result<()> {
    for rel in obj.mapper().relationships() {
        let pairs = rel.parent_foreign_keys();
        if pairs.is_empty() {
            continue;
        }
        match obj.related(rel.name()) {
            Some(target) => {
                for (fk, column) in &pairs {
                    let value = target.get(column);
                    if !value.is_null() && !obj.get(fk).not_distinct(&value) {
                        obj.set(fk, value)?;
                    }
                }
            }
            None => {
                let removed = obj.history(rel.name()).removed;
                for (fk, column) in &pairs {
                    let current = obj.get(fk);
                    if !current.is_null() && removed.iter().any(|t| t.get(column).not_distinct(&current)) {
                        obj.set(fk, Value::Null)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Copy `obj`'s key into the foreign key columns of its one-to-many members,
/// and null it on members removed since the last flush that still point here.
pub fn push_foreign_keys(obj: &ObjectRef, deleting: &HashSet<ObjectRef>) -> Result<()> {
    let pk = obj.mapper().primary_key().to_vec();
    for rel in obj.mapper().relationships() {
        let pairs = rel.target_foreign_keys(&pk);
        if pairs.is_empty() {
            continue;
        }
        for member in obj.collection(rel.name()) {
            if deleting.contains(&member) {
                continue;
            }
            for (column, fk) in &pairs {
                let value = obj.get(column);
                if !value.is_null() && !member.get(fk).not_distinct(&value) {
                    member.set(fk, value)?;
                }
            }
        }
        for removed in obj.history(rel.name()).removed {
            if deleting.contains(&removed) || removed.is_deleted() {
                continue;
            }
            let moved = rel
                .back_populates()
                .and_then(|back| removed.related(back))
                .is_some();
            if moved {
                continue;
            }
            for (column, fk) in &pairs {
                let value = obj.get(column);
                if !value.is_null() && removed.get(fk).not_distinct(&value) {
                    removed.set(fk, Value::Null)?;
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Link tables
// ============================================================================

fn link_columns(
    owner: &ObjectRef,
    parent: &[(String, String)],
    other: &ObjectRef,
    target: &[(String, String)],
) -> Vec<(String, Value)> {
    parent
        .iter()
        .map(|(column, link)| (link.clone(), owner.get(column)))
        .chain(
            target
                .iter()
                .map(|(link, column)| (link.clone(), other.get(column))),
        )
        .collect()
}

fn push_unique(ops: &mut Vec<LinkTableOp>, seen: &mut HashSet<(bool, String, u64)>, op: LinkTableOp) {
    if seen.insert(op.key()) {
        ops.push(op);
    }
}

/// Link-table rows to insert and delete for the many-to-many history of
/// `objects`, unlinks first. Rows recorded by both sides of a back-populated
/// pair appear once.
pub fn link_ops(objects: &[ObjectRef], deleting: &HashSet<ObjectRef>) -> Vec<LinkTableOp> {
    let mut seen = HashSet::new();
    let mut ops = Vec::new();
    for obj in objects {
        for rel in obj.mapper().relationships() {
            let JoinColumns::Link {
                table,
                parent,
                target,
            } = &rel.join
            else {
                continue;
            };
            let history = obj.history(rel.name());
            for removed in &history.removed {
                let columns = link_columns(obj, parent, removed, target);
                push_unique(&mut ops, &mut seen, LinkTableOp::unlink(table, columns));
            }
            if deleting.contains(obj) {
                continue;
            }
            for added in history.added.iter().filter(|a| !deleting.contains(*a)) {
                let columns = link_columns(obj, parent, added, target);
                push_unique(&mut ops, &mut seen, LinkTableOp::link(table, columns));
            }
        }
    }
    ops.sort_by_key(LinkTableOp::is_link);
    ops
}

/// Deletions of every link row that references `obj`, from either side.
pub fn unlink_all(registry: &Registry, obj: &ObjectRef) -> Vec<LinkTableOp> {
    let mut seen = HashSet::new();
    let mut ops = Vec::new();
    for mapper in registry.mappers() {
        for rel in mapper.relationships() {
            let JoinColumns::Link {
                table,
                parent,
                target,
            } = &rel.join
            else {
                continue;
            };
            if rel.parent == mapper.name() && obj.is_instance_of(mapper.name()) {
                let columns = parent
                    .iter()
                    .map(|(column, link)| (link.clone(), obj.get(column)))
                    .collect();
                push_unique(&mut ops, &mut seen, LinkTableOp::unlink(table, columns));
            }
            if obj.is_instance_of(rel.target()) {
                let columns = target
                    .iter()
                    .map(|(link, column)| (link.clone(), obj.get(column)))
                    .collect();
                push_unique(&mut ops, &mut seen, LinkTableOp::unlink(table, columns));
            }
        }
    }
    ops
}

// ============================================================================
// Statements
// ============================================================================

/// `pk = value AND ...` for `obj`.
pub fn pk_filter(obj: &ObjectRef) -> Expr {
    let pk = obj.mapper().primary_key();
    Expr::and_all(
        pk.iter()
            .map(|column| Expr::col(column).eq(obj.get(column))),
    )
    .unwrap_or_else(|| Expr::lit(false))
}

/// A filter matching any of `keys` on `columns`: `IN` for a single column,
/// an OR of ANDs for composite keys. `None` when `keys` is empty.
pub fn key_filter(columns: &[String], keys: &[Vec<Value>]) -> Option<Expr> {
    if keys.is_empty() {
        return None;
    }
    if let [column] = columns {
        let values: Vec<Expr> = keys
            .iter()
            .map(|k| Expr::lit(k.first().cloned().unwrap_or(Value::Null)))
            .collect();
        return Some(Expr::col(column).in_list(values));
    }
    Expr::or_all(keys.iter().filter_map(|key| {
        Expr::and_all(
            columns
                .iter()
                .zip(key)
                .map(|(column, value)| Expr::col(column).eq(value.clone())),
        )
        .map(Expr::paren)
    }))
}

/// INSERT of `obj`'s columns stored in `table`. Unset auto-increment columns
/// are left to the database and returned.
pub fn insert_row(obj: &ObjectRef, table: &str, fields: &[FieldInfo]) -> Insert {
    let mut insert = Insert::new(table);
    for field in fields {
        let value = obj.get(&field.name);
        if field.auto_increment && value.is_null() {
            insert = insert.returning(&field.name);
            continue;
        }
        insert = insert.value(&field.name, value);
    }
    insert
}

/// UPDATEs of `obj`'s changed columns, one per table, base table first.
pub fn update_rows(obj: &ObjectRef) -> Vec<Update> {
    let mapper = obj.mapper();
    let pk = mapper.primary_key();
    let modified = obj.modified_columns();
    mapper
        .tables()
        .into_iter()
        .filter_map(|(table, fields)| {
            let mut update = Update::new(table);
            for field in fields {
                if pk.contains(&field.name) || !modified.contains(&field.name) {
                    continue;
                }
                let value = obj.get(&field.name);
                if value.not_distinct(&obj.committed(&field.name)) {
                    continue;
                }
                update = update.set(&field.name, value);
            }
            (!update.set.is_empty()).then(|| update.filter(pk_filter(obj)))
        })
        .collect()
}

/// DELETEs of `obj`'s rows, subclass table first.
pub fn delete_rows(obj: &ObjectRef) -> Vec<Delete> {
    obj.mapper()
        .tables()
        .into_iter()
        .rev()
        .map(|(table, _)| Delete::new(table).filter(pk_filter(obj)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmodel_derived_core::{
        Dialect, LinkTableInfo, Mapper, RegistryBuilder, RelationshipInfo, SqlType,
    };
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        RegistryBuilder::new()
            .mapper(
                Mapper::builder("Thread", "threads")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("title", SqlType::Text).nullable(true))
                    .relationship(
                        RelationshipInfo::one_to_many("comments", "Comment", "thread_id")
                            .back_populates("thread"),
                    )
                    .relationship(
                        RelationshipInfo::one_to_many("attachments", "Attachment", "thread_id")
                            .cascade_delete(true),
                    ),
            )
            .mapper(
                Mapper::builder("Comment", "comments")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("thread_id", SqlType::BigInt).nullable(true))
                    .relationship(
                        RelationshipInfo::many_to_one("thread", "Thread", "thread_id")
                            .back_populates("comments"),
                    ),
            )
            .mapper(
                Mapper::builder("Attachment", "attachments")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("thread_id", SqlType::BigInt).nullable(true)),
            )
            .mapper(
                Mapper::builder("User", "users")
                    .column(FieldInfo::id("id"))
                    .relationship(
                        RelationshipInfo::many_to_many(
                            "groups",
                            "Group",
                            LinkTableInfo::new("memberships", "user_id", "group_id"),
                        )
                        .back_populates("users"),
                    ),
            )
            .mapper(
                Mapper::builder("Group", "groups")
                    .column(FieldInfo::id("id"))
                    .relationship(
                        RelationshipInfo::many_to_many(
                            "users",
                            "User",
                            LinkTableInfo::new("memberships", "group_id", "user_id"),
                        )
                        .back_populates("groups"),
                    ),
            )
            .configure()
            .unwrap()
    }

    #[test]
    fn parents_are_inserted_before_children() {
        let reg = registry();
        let thread = reg.create("Thread").unwrap();
        let comment = reg.create("Comment").unwrap();
        comment.set_related("thread", Some(&thread)).unwrap();
        let attachment = reg.create("Attachment").unwrap();
        thread.append("attachments", &attachment).unwrap();

        let found = cascade(&[comment.clone()], &HashSet::new());
        assert_eq!(found.len(), 3);

        let order = order_inserts(&[attachment.clone(), comment.clone(), thread.clone()]).unwrap();
        let pos = |o: &ObjectRef| order.iter().position(|x| x == o).unwrap();
        assert!(pos(&thread) < pos(&comment));
        assert!(pos(&thread) < pos(&attachment));
    }

    #[test]
    fn foreign_keys_follow_the_graph() {
        let reg = registry();
        let thread = reg.create("Thread").unwrap();
        thread.set_committed("id", 5_i64);
        let comment = reg.create("Comment").unwrap();
        comment.set_related("thread", Some(&thread)).unwrap();
        pull_foreign_keys(&comment).unwrap();
        assert_eq!(comment.get("thread_id"), Value::BigInt(5));

        let attachment = reg.create("Attachment").unwrap();
        thread.append("attachments", &attachment).unwrap();
        push_foreign_keys(&thread, &HashSet::new()).unwrap();
        assert_eq!(attachment.get("thread_id"), Value::BigInt(5));

        comment.commit_state();
        comment.set_related("thread", None).unwrap();
        pull_foreign_keys(&comment).unwrap();
        assert_eq!(comment.get("thread_id"), Value::Null);

        thread.commit_state();
        attachment.commit_state();
        thread.remove("attachments", &attachment).unwrap();
        push_foreign_keys(&thread, &HashSet::new()).unwrap();
        assert_eq!(attachment.get("thread_id"), Value::Null);
    }

    #[test]
    fn deletes_cascade_or_detach() {
        let reg = registry();
        let thread = reg.create("Thread").unwrap();
        thread.set_committed("id", 1_i64);
        let comment = reg.create("Comment").unwrap();
        comment.set_related("thread", Some(&thread)).unwrap();
        comment.set_committed("thread_id", 1_i64);
        let attachment = reg.create("Attachment").unwrap();
        thread.append("attachments", &attachment).unwrap();

        let doomed = expand_deletes(&[thread.clone()]).unwrap();
        assert_eq!(doomed, vec![thread.clone(), attachment.clone()]);
        assert!(comment.related("thread").is_none());
        assert_eq!(comment.get("thread_id"), Value::Null);
        assert!(thread.collection("comments").is_empty());
    }

    #[test]
    fn link_rows_recorded_by_both_sides_appear_once() {
        let reg = registry();
        let user = reg.create("User").unwrap();
        user.set_committed("id", 1_i64);
        let group = reg.create("Group").unwrap();
        group.set_committed("id", 2_i64);
        user.append("groups", &group).unwrap();

        let ops = link_ops(&[user.clone(), group.clone()], &HashSet::new());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_link());
        let (sql, params) = ops[0].to_statement().build_with_dialect(Dialect::Postgres);
        assert_eq!(
            sql,
            "INSERT INTO \"memberships\" (\"user_id\", \"group_id\") VALUES ($1, $2)"
        );
        assert_eq!(params, vec![Value::BigInt(1), Value::BigInt(2)]);

        user.commit_state();
        group.commit_state();
        group.remove("users", &user).unwrap();
        let ops = link_ops(&[user.clone(), group.clone()], &HashSet::new());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_unlink());

        let cleanup = unlink_all(&reg, &user);
        assert_eq!(cleanup.len(), 1);
        assert_eq!(cleanup[0].table(), "memberships");
        assert_eq!(cleanup[0].columns(), &[("user_id".to_string(), Value::BigInt(1))]);
    }

    #[test]
    fn circular_inserts_are_a_dependency_error() {
        let reg = RegistryBuilder::new()
            .mapper(
                Mapper::builder("Node", "nodes")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("next_id", SqlType::BigInt).nullable(true))
                    .relationship(RelationshipInfo::many_to_one("next", "Node", "next_id")),
            )
            .configure()
            .unwrap();
        let a = reg.create("Node").unwrap();
        let b = reg.create("Node").unwrap();
        a.set_related("next", Some(&b)).unwrap();
        b.set_related("next", Some(&a)).unwrap();
        let err = order_inserts(&[a, b]).unwrap_err();
        match err {
            Error::Dependency(e) => assert_eq!(e.chain, vec!["Node", "Node"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn statements_for_rows() {
        let reg = registry();
        let thread = reg.create("Thread").unwrap();
        let insert = insert_row(&thread, "threads", thread.mapper().local_columns());
        assert_eq!(insert.returning.as_deref(), Some("id"));
        assert_eq!(insert.columns, vec!["title".to_string()]);

        thread.set_committed("id", 3_i64);
        thread.commit_state();
        assert!(update_rows(&thread).is_empty());
        thread.set("title", "hello").unwrap();
        let updates = update_rows(&thread);
        assert_eq!(
            updates[0].build().0,
            "UPDATE \"threads\" SET \"title\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(
            delete_rows(&thread)[0].build().0,
            "DELETE FROM \"threads\" WHERE \"id\" = $1"
        );

        let composite = key_filter(
            &["a".to_string(), "b".to_string()],
            &[vec![Value::BigInt(1), Value::BigInt(2)]],
        )
        .unwrap();
        let mut params = Vec::new();
        assert_eq!(
            composite.build(&mut params, 0),
            "(\"a\" = $1 AND \"b\" = $2)"
        );
        assert!(key_filter(&["id".to_string()], &[]).is_none());
    }
}
