//! Live instances of mapped classes.
//!
//! An [`ObjectRef`] is a shared handle to one instance: its column values, the
//! state of each relationship, and the change tracking the session needs to
//! flush it. Handles compare by identity.
//!
//! Relationship edits keep both sides of a `back_populates` pair in sync and
//! record per-relationship history (targets added and removed since the last
//! flush). Every change is reported to the [`AttributeListener`]s registered on
//! the object's mapper once the object's lock has been released.
//!
//! Reference cycles between objects (a thread holding its comments, each comment
//! holding its thread) are expected; they live as long as the graph is reachable.

use crate::error::{Error, Result};
use crate::mapper::{AttributeChange, Mapper};
use crate::relationship::Relationship;
use crate::value::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The value of a relationship attribute.
#[derive(Debug, Clone)]
pub enum Related {
    Scalar(Option<ObjectRef>),
    Collection(Vec<ObjectRef>),
}

impl Related {
    /// The scalar target, or `None` for collections.
    pub fn as_scalar(&self) -> Option<&ObjectRef> {
        match self {
            Related::Scalar(target) => target.as_ref(),
            Related::Collection(_) => None,
        }
    }

    /// All targets as a list.
    pub fn into_vec(self) -> Vec<ObjectRef> {
        match self {
            Related::Scalar(target) => target.into_iter().collect(),
            Related::Collection(items) => items,
        }
    }

    pub fn contains(&self, obj: &ObjectRef) -> bool {
        match self {
            Related::Scalar(target) => target.as_ref() == Some(obj),
            Related::Collection(items) => items.contains(obj),
        }
    }
}

/// Targets added to and removed from one relationship since the last flush.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub added: Vec<ObjectRef>,
    pub removed: Vec<ObjectRef>,
}

impl History {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    fn record_added(&mut self, obj: &ObjectRef) {
        if let Some(pos) = self.removed.iter().position(|o| o == obj) {
            self.removed.remove(pos);
        } else if !self.added.contains(obj) {
            self.added.push(obj.clone());
        }
    }

    fn record_removed(&mut self, obj: &ObjectRef) {
        if let Some(pos) = self.added.iter().position(|o| o == obj) {
            self.added.remove(pos);
        } else if !self.removed.contains(obj) {
            self.removed.push(obj.clone());
        }
    }
}

#[derive(Debug)]
struct RelationState {
    current: Related,
    history: History,
}

#[derive(Debug, Default)]
struct ObjectData {
    values: HashMap<String, Value>,
    committed: HashMap<String, Value>,
    modified: BTreeSet<String>,
    relations: HashMap<String, RelationState>,
    persistent: bool,
    deleted: bool,
}

struct ObjectInner {
    mapper: Arc<Mapper>,
    data: RwLock<ObjectData>,
}

/// Shared handle to a live instance.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<ObjectInner>,
}

type Events = Vec<(ObjectRef, String, AttributeChange)>;

impl ObjectRef {
    /// Create a transient instance. Columns with a declared default start with it.
    pub fn new(mapper: Arc<Mapper>) -> Self {
        let mut data = ObjectData::default();
        for col in mapper.columns() {
            if let Some(default) = &col.default {
                data.values.insert(col.name.clone(), default.clone());
            }
        }
        for rel in mapper.relationships() {
            let current = if rel.is_collection() {
                Related::Collection(Vec::new())
            } else {
                Related::Scalar(None)
            };
            data.relations.insert(
                rel.name().to_string(),
                RelationState {
                    current,
                    history: History::default(),
                },
            );
        }
        Self {
            inner: Arc::new(ObjectInner {
                mapper,
                data: RwLock::new(data),
            }),
        }
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.inner.mapper
    }

    pub fn class_name(&self) -> &str {
        self.inner.mapper.name()
    }

    /// Whether the object is an instance of `class` (or a subclass of it).
    pub fn is_instance_of(&self, class: &str) -> bool {
        self.inner.mapper.is_subclass_of(class)
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ObjectData> {
        self.inner.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- columns -------------------------------------------------------

    /// Current value of `column`, NULL when unset or unknown.
    pub fn get(&self, column: &str) -> Value {
        self.read().values.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Current value of `column`, failing when the class has no such column.
    pub fn try_get(&self, column: &str) -> Result<Value> {
        if self.inner.mapper.column(column).is_none() {
            return Err(self.no_such(column, "column"));
        }
        Ok(self.get(column))
    }

    /// Value of `column` as of the last flush.
    pub fn committed(&self, column: &str) -> Value {
        self.read()
            .committed
            .get(column)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Set a column, coercing to the column's SQL type.
    ///
    /// Setting an equal value is a no-op; otherwise the column is marked
    /// modified and the column's listeners are fired.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let field = self
            .inner
            .mapper
            .column(column)
            .ok_or_else(|| self.no_such(column, "column"))?;
        let new = value.into().coerce(&field.sql_type).map_err(|e| match e {
            Error::Type(mut t) => {
                t.column = Some(format!("{}.{}", self.class_name(), column));
                Error::Type(t)
            }
            other => other,
        })?;

        let old = {
            let mut data = self.write();
            let old = data.values.get(column).cloned().unwrap_or(Value::Null);
            if old == new {
                return Ok(());
            }
            data.values.insert(column.to_string(), new.clone());
            data.modified.insert(column.to_string());
            old
        };
        tracing::trace!(class = self.class_name(), column, "Column set");
        fire(vec![(
            self.clone(),
            column.to_string(),
            AttributeChange::Column { old, new },
        )])
    }

    /// Write a column as already persisted: no modification, no listeners.
    pub fn set_committed(&self, column: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut data = self.write();
        data.values.insert(column.to_string(), value.clone());
        data.committed.insert(column.to_string(), value);
        data.modified.remove(column);
    }

    /// Primary key values, in key column order.
    pub fn primary_key(&self) -> Vec<Value> {
        let data = self.read();
        self.inner
            .mapper
            .primary_key()
            .iter()
            .map(|k| data.values.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Whether every primary key column is set.
    pub fn has_identity(&self) -> bool {
        self.primary_key().iter().all(|v| !v.is_null())
    }

    /// Columns modified since the last flush.
    pub fn modified_columns(&self) -> Vec<String> {
        self.read().modified.iter().cloned().collect()
    }

    // ---- relationships ---------------------------------------------------

    /// Current value of relationship `name`.
    pub fn relation(&self, name: &str) -> Result<Related> {
        self.read()
            .relations
            .get(name)
            .map(|state| state.current.clone())
            .ok_or_else(|| self.no_such(name, "relationship"))
    }

    /// The scalar target of `name`, `None` when unset, unknown, or a collection.
    pub fn related(&self, name: &str) -> Option<ObjectRef> {
        self.read()
            .relations
            .get(name)
            .and_then(|state| state.current.as_scalar().cloned())
    }

    /// The members of collection `name`, empty when unknown.
    pub fn collection(&self, name: &str) -> Vec<ObjectRef> {
        match self.read().relations.get(name).map(|s| &s.current) {
            Some(Related::Collection(items)) => items.clone(),
            Some(Related::Scalar(target)) => target.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Added/removed targets of `name` since the last flush.
    pub fn history(&self, name: &str) -> History {
        self.read()
            .relations
            .get(name)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Set a scalar relationship, keeping the back-reference in sync.
    pub fn set_related(&self, name: &str, target: Option<&ObjectRef>) -> Result<()> {
        let rel = self.relationship(name)?;
        if rel.is_collection() {
            return Err(Error::config(
                self.class_name(),
                name,
                "collection relationships are changed with append/remove",
            ));
        }
        self.check_target(&rel, target)?;
        let mut events = Events::new();
        link_scalar(self, &rel, target.cloned(), &mut events);
        fire(events)
    }

    /// Append to a collection relationship, keeping the back-reference in sync.
    pub fn append(&self, name: &str, target: &ObjectRef) -> Result<()> {
        let rel = self.collection_relationship(name)?;
        self.check_target(&rel, Some(target))?;
        let mut events = Events::new();
        link_member(self, &rel, target, &mut events);
        fire(events)
    }

    /// Remove from a collection relationship. Returns `false` if `target` was
    /// not a member.
    pub fn remove(&self, name: &str, target: &ObjectRef) -> Result<bool> {
        let rel = self.collection_relationship(name)?;
        let mut events = Events::new();
        let removed = unlink_member(self, &rel, target, &mut events);
        fire(events)?;
        Ok(removed)
    }

    fn relationship(&self, name: &str) -> Result<Relationship> {
        self.inner
            .mapper
            .relationship(name)
            .cloned()
            .ok_or_else(|| self.no_such(name, "relationship"))
    }

    fn collection_relationship(&self, name: &str) -> Result<Relationship> {
        let rel = self.relationship(name)?;
        if !rel.is_collection() {
            return Err(Error::config(
                self.class_name(),
                name,
                "scalar relationships are changed with set_related",
            ));
        }
        Ok(rel)
    }

    fn check_target(&self, rel: &Relationship, target: Option<&ObjectRef>) -> Result<()> {
        match target {
            Some(t) if !t.is_instance_of(rel.target()) => Err(Error::config(
                self.class_name(),
                rel.name(),
                format!("expected {}, got {}", rel.target(), t.class_name()),
            )),
            _ => Ok(()),
        }
    }

    fn no_such(&self, name: &str, what: &str) -> Error {
        Error::config(self.class_name(), name, format!("no such {what}"))
    }

    // ---- session state -------------------------------------------------

    /// Whether the object has been flushed to the database.
    pub fn is_persistent(&self) -> bool {
        self.read().persistent
    }

    /// Whether the object has been deleted in a flush.
    pub fn is_deleted(&self) -> bool {
        self.read().deleted
    }

    /// Whether any column or relationship changed since the last flush.
    pub fn is_modified(&self) -> bool {
        let data = self.read();
        !data.modified.is_empty() || data.relations.values().any(|s| !s.history.is_empty())
    }

    /// Mark the object as loaded from or written to the database.
    pub fn mark_persistent(&self) {
        self.write().persistent = true;
    }

    /// Mark the object as deleted from the database.
    pub fn mark_deleted(&self) {
        let mut data = self.write();
        data.deleted = true;
        data.persistent = false;
    }

    /// Snapshot current values as committed and clear all change tracking.
    pub fn commit_state(&self) {
        let mut data = self.write();
        data.committed = data.values.clone();
        data.modified.clear();
        for state in data.relations.values_mut() {
            state.history = History::default();
        }
    }

    /// Drop `target` from relationship `name` without history or listeners.
    pub fn detach_silently(&self, name: &str, target: &ObjectRef) {
        let mut data = self.write();
        if let Some(state) = data.relations.get_mut(name) {
            match &mut state.current {
                Related::Scalar(current) => {
                    if current.as_ref() == Some(target) {
                        *current = None;
                    }
                }
                Related::Collection(items) => items.retain(|o| o != target),
            }
        }
    }

    fn raw_set_scalar(&self, name: &str, new: Option<ObjectRef>) -> Option<Option<ObjectRef>> {
        let mut data = self.write();
        let state = data.relations.get_mut(name)?;
        let Related::Scalar(current) = &mut state.current else {
            return None;
        };
        if *current == new {
            return None;
        }
        let old = std::mem::replace(current, new.clone());
        if let Some(old) = &old {
            state.history.record_removed(old);
        }
        if let Some(new) = &new {
            state.history.record_added(new);
        }
        Some(old)
    }

    fn raw_append(&self, name: &str, target: &ObjectRef) -> bool {
        let mut data = self.write();
        let Some(state) = data.relations.get_mut(name) else {
            return false;
        };
        let Related::Collection(items) = &mut state.current else {
            return false;
        };
        if items.contains(target) {
            return false;
        }
        items.push(target.clone());
        state.history.record_added(target);
        true
    }

    fn raw_remove(&self, name: &str, target: &ObjectRef) -> bool {
        let mut data = self.write();
        let Some(state) = data.relations.get_mut(name) else {
            return false;
        };
        let Related::Collection(items) = &mut state.current else {
            return false;
        };
        let Some(pos) = items.iter().position(|o| o == target) else {
            return false;
        };
        items.remove(pos);
        state.history.record_removed(target);
        true
    }
}

fn back_is_collection(target: &ObjectRef, back: &str) -> bool {
    target
        .mapper()
        .relationship(back)
        .is_some_and(Relationship::is_collection)
}

fn push_scalar(
    events: &mut Events,
    obj: &ObjectRef,
    name: &str,
    old: Option<ObjectRef>,
    new: Option<ObjectRef>,
) {
    events.push((
        obj.clone(),
        name.to_string(),
        AttributeChange::Scalar { old, new },
    ));
}

/// `obj.rel = new`, then move the back-reference from the old target to the new.
fn link_scalar(obj: &ObjectRef, rel: &Relationship, new: Option<ObjectRef>, events: &mut Events) {
    let Some(old) = obj.raw_set_scalar(rel.name(), new.clone()) else {
        return;
    };
    push_scalar(events, obj, rel.name(), old.clone(), new.clone());
    let Some(back) = rel.back_populates() else {
        return;
    };
    if let Some(old) = &old {
        unlink_back(old, back, obj, events);
    }
    if let Some(new) = &new {
        link_back(new, back, obj, rel.name(), events);
    }
}

/// `obj.rel.append(target)`, then point `target`'s back-reference at `obj`.
fn link_member(obj: &ObjectRef, rel: &Relationship, target: &ObjectRef, events: &mut Events) {
    if !obj.raw_append(rel.name(), target) {
        return;
    }
    events.push((
        obj.clone(),
        rel.name().to_string(),
        AttributeChange::Appended(target.clone()),
    ));
    if let Some(back) = rel.back_populates() {
        link_back(target, back, obj, rel.name(), events);
    }
}

fn unlink_member(
    obj: &ObjectRef,
    rel: &Relationship,
    target: &ObjectRef,
    events: &mut Events,
) -> bool {
    if !obj.raw_remove(rel.name(), target) {
        return false;
    }
    events.push((
        obj.clone(),
        rel.name().to_string(),
        AttributeChange::Removed(target.clone()),
    ));
    if let Some(back) = rel.back_populates() {
        unlink_back(target, back, obj, events);
    }
    true
}

/// Make `target.back` refer to `owner`, where `owner.forward` now holds `target`.
fn link_back(
    target: &ObjectRef,
    back: &str,
    owner: &ObjectRef,
    forward: &str,
    events: &mut Events,
) {
    if back_is_collection(target, back) {
        if target.raw_append(back, owner) {
            events.push((
                target.clone(),
                back.to_string(),
                AttributeChange::Appended(owner.clone()),
            ));
        }
        return;
    }
    let Some(previous) = target.raw_set_scalar(back, Some(owner.clone())) else {
        return;
    };
    push_scalar(events, target, back, previous.clone(), Some(owner.clone()));
    // The previous owner loses `target` from its forward side.
    if let Some(previous) = previous.filter(|p| p != owner) {
        if back_is_collection(&previous, forward) {
            if previous.raw_remove(forward, target) {
                events.push((
                    previous.clone(),
                    forward.to_string(),
                    AttributeChange::Removed(target.clone()),
                ));
            }
        } else if let Some(old) = previous.raw_set_scalar(forward, None) {
            push_scalar(events, &previous, forward, old, None);
        }
    }
}

/// Make `target.back` stop referring to `owner`.
fn unlink_back(target: &ObjectRef, back: &str, owner: &ObjectRef, events: &mut Events) {
    if back_is_collection(target, back) {
        if target.raw_remove(back, owner) {
            events.push((
                target.clone(),
                back.to_string(),
                AttributeChange::Removed(owner.clone()),
            ));
        }
    } else if target.related(back).as_ref() == Some(owner) {
        if let Some(old) = target.raw_set_scalar(back, None) {
            push_scalar(events, target, back, old, None);
        }
    }
}

fn fire(events: Events) -> Result<()> {
    for (obj, attribute, change) in events {
        for listener in obj.mapper().listeners_for(&attribute) {
            listener.on_change(&obj, &attribute, &change)?;
        }
    }
    Ok(())
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pk = self.primary_key();
        write!(f, "{}(", self.class_name())?;
        for (i, v) in pk.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")@{:p}", Arc::as_ptr(&self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldInfo;
    use crate::mapper::{Registry, RegistryBuilder};
    use crate::relationship::{LinkTableInfo, RelationshipInfo};
    use crate::types::SqlType;
    use std::sync::Mutex;

    fn registry() -> Arc<Registry> {
        RegistryBuilder::new()
            .mapper(
                Mapper::builder("Thread", "threads")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("title", SqlType::Text))
                    .column(FieldInfo::new("comment_count", SqlType::BigInt).default_value(0_i64))
                    .relationship(
                        RelationshipInfo::one_to_many("comments", "Comment", "thread_id")
                            .back_populates("thread"),
                    ),
            )
            .mapper(
                Mapper::builder("Comment", "comments")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("thread_id", SqlType::BigInt))
                    .relationship(
                        RelationshipInfo::many_to_one("thread", "Thread", "thread_id")
                            .back_populates("comments"),
                    ),
            )
            .mapper(
                Mapper::builder("Post", "posts")
                    .column(FieldInfo::id("id"))
                    .relationship(
                        RelationshipInfo::many_to_many(
                            "tags",
                            "Tag",
                            LinkTableInfo::new("post_tags", "post_id", "tag_id"),
                        )
                        .back_populates("posts"),
                    ),
            )
            .mapper(
                Mapper::builder("Tag", "tags")
                    .column(FieldInfo::id("id"))
                    .relationship(
                        RelationshipInfo::many_to_many(
                            "posts",
                            "Post",
                            LinkTableInfo::new("post_tags", "tag_id", "post_id"),
                        )
                        .back_populates("tags"),
                    ),
            )
            .configure()
            .unwrap()
    }

    #[test]
    fn defaults_and_coercion() {
        let reg = registry();
        let thread = reg.create("Thread").unwrap();
        assert_eq!(thread.get("comment_count"), Value::BigInt(0));
        thread.set("comment_count", 3).unwrap();
        assert_eq!(thread.get("comment_count"), Value::BigInt(3));
        assert_eq!(thread.modified_columns(), vec!["comment_count".to_string()]);
        assert!(thread.set("nope", 1).is_err());
        assert!(thread.set("title", 1).is_err());
    }

    #[test]
    fn scalar_assignment_syncs_collection_backref() {
        let reg = registry();
        let t1 = reg.create("Thread").unwrap();
        let t2 = reg.create("Thread").unwrap();
        let c = reg.create("Comment").unwrap();

        c.set_related("thread", Some(&t1)).unwrap();
        assert_eq!(t1.collection("comments"), vec![c.clone()]);

        c.set_related("thread", Some(&t2)).unwrap();
        assert!(t1.collection("comments").is_empty());
        assert_eq!(t2.collection("comments"), vec![c.clone()]);
        assert_eq!(t1.history("comments").removed.len(), 0);
        assert_eq!(c.history("thread").added, vec![t2.clone()]);
    }

    #[test]
    fn append_moves_member_between_owners() {
        let reg = registry();
        let t1 = reg.create("Thread").unwrap();
        let t2 = reg.create("Thread").unwrap();
        let c = reg.create("Comment").unwrap();

        t1.append("comments", &c).unwrap();
        t2.append("comments", &c).unwrap();
        assert_eq!(c.related("thread"), Some(t2.clone()));
        assert!(t1.collection("comments").is_empty());

        assert!(t2.remove("comments", &c).unwrap());
        assert!(!t2.remove("comments", &c).unwrap());
        assert_eq!(c.related("thread"), None);
    }

    #[test]
    fn many_to_many_backref_and_history() {
        let reg = registry();
        let post = reg.create("Post").unwrap();
        let tag = reg.create("Tag").unwrap();
        post.commit_state();

        post.append("tags", &tag).unwrap();
        assert_eq!(tag.collection("posts"), vec![post.clone()]);
        assert_eq!(post.history("tags").added, vec![tag.clone()]);

        post.remove("tags", &tag).unwrap();
        assert!(post.history("tags").is_empty());
        assert!(tag.collection("posts").is_empty());
    }

    #[test]
    fn listeners_fire_on_both_sides_after_unlock() {
        let reg = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reg.mapper("Thread").unwrap().add_listener(
            "comments",
            Arc::new(
                move |target: &ObjectRef, attr: &str, change: &AttributeChange| {
                    // Reading the target proves its lock is not held.
                    let n = target.collection(attr).len();
                    let kind = match change {
                        AttributeChange::Appended(_) => "appended",
                        AttributeChange::Removed(_) => "removed",
                        _ => "other",
                    };
                    sink.lock().unwrap().push(format!("{kind}:{n}"));
                    Ok::<(), Error>(())
                },
            ),
        );

        let t = reg.create("Thread").unwrap();
        let c = reg.create("Comment").unwrap();
        c.set_related("thread", Some(&t)).unwrap();
        c.set_related("thread", None).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["appended:1", "removed:0"]);
    }

    #[test]
    fn wrong_target_class_is_rejected() {
        let reg = registry();
        let c = reg.create("Comment").unwrap();
        let tag = reg.create("Tag").unwrap();
        assert!(c.set_related("thread", Some(&tag)).is_err());
        assert!(c.append("thread", &tag).is_err());
    }

    #[test]
    fn commit_state_clears_tracking() {
        let reg = registry();
        let t = reg.create("Thread").unwrap();
        let c = reg.create("Comment").unwrap();
        t.set("title", "hello").unwrap();
        t.append("comments", &c).unwrap();
        assert!(t.is_modified());
        t.commit_state();
        assert!(!t.is_modified());
        assert_eq!(t.committed("title"), Value::Text("hello".into()));

        t.set_committed("comment_count", 7_i64);
        assert!(!t.is_modified());
        assert_eq!(t.get("comment_count"), Value::BigInt(7));
    }

    #[test]
    fn identity_semantics() {
        let reg = registry();
        let a = reg.create("Thread").unwrap();
        let b = reg.create("Thread").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        let set: std::collections::HashSet<_> = [a.clone(), a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
