//! Session and unit of work for SQLModel Derived.
//!
//! `sqlmodel-derived-session` is the **unit-of-work layer**. A [`Session`]
//! tracks live objects, and `flush` turns their changes into SQL in a fixed
//! pipeline:
//!
//! 1. cascade: everything reachable from tracked objects joins the session;
//! 2. `before_flush` listeners, in [`FlushPhase`] order;
//! 3. cascade again, for objects the listeners attached;
//! 4. deletes expanded (cascade-delete children) and other children detached;
//! 5. INSERTs, parents first, base table before subclass table;
//! 6. UPDATEs of changed columns, foreign keys synced from the object graph;
//! 7. link-table rows from many-to-many history;
//! 8. DELETEs, children first;
//! 9. `after_flush` listeners; their statements run and refreshed values are
//!    written back to the live objects;
//! 10. bookkeeping: change tracking cleared, identity map updated, deleted
//!     objects detached from in-memory collections.
//!
//! Statements run through an [`Executor`]: a [`ConnectionExecutor`] for a real
//! driver, or a [`MemoryDatabase`].
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(registry);
//! let mut session = factory.session(MemoryDatabase::from_registry(factory.registry()));
//!
//! session.add(&thread);
//! session.flush(&cx).await?;
//! session.commit(&cx).await?;
//! ```

pub mod events;
pub mod executor;
pub mod flush;
pub mod identity_map;
pub mod memory;

pub use events::{FlushContext, FlushListener, FlushPhase};
pub use executor::{ConnectionExecutor, Executor};
pub use flush::{FlushResult, LinkTableOp, key_filter, pk_filter};
pub use identity_map::{IdentityMap, ObjectKey};
pub use memory::{ColumnDef, MemoryDatabase};

use asupersync::{Cx, Outcome};
use sqlmodel_derived_core::{
    Error, Mapper, ObjectRef, QueryError, QueryErrorKind, Registry, Result, Row, Value,
};
use sqlmodel_derived_query::{Expr, Select, Statement, Update};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether to auto-begin a transaction on first flush.
    pub auto_begin: bool,
    /// Whether `add` also tracks everything reachable from the added object.
    pub cascade_on_add: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            cascade_on_add: true,
        }
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Creates sessions sharing a registry, a configuration and flush listeners.
pub struct SessionFactory {
    registry: Arc<Registry>,
    config: SessionConfig,
    listeners: Arc<RwLock<Vec<Arc<dyn FlushListener>>>>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .field("listeners", &self.listener_names())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            config: SessionConfig::default(),
            listeners: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Install a flush listener. Returns `false` (and changes nothing) when a
    /// listener with the same name is already installed.
    pub fn listen(&self, listener: Arc<dyn FlushListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if listeners.iter().any(|l| l.name() == listener.name()) {
            tracing::debug!(listener = listener.name(), "Flush listener already installed");
            return false;
        }
        tracing::debug!(
            listener = listener.name(),
            phase = listener.phase().as_str(),
            "Installing flush listener"
        );
        listeners.push(listener);
        true
    }

    /// Remove the listener called `name`. Sessions already created keep it.
    pub fn unlisten(&self, name: &str) -> bool {
        remove_listener(&self.listeners, name)
    }

    /// A handle that can remove listeners later without keeping the factory
    /// alive. Sessions already created keep the listeners they started with.
    pub fn listener_handle(&self) -> ListenerHandle {
        ListenerHandle(Arc::downgrade(&self.listeners))
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|l| l.name() == name)
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// A new session over `executor` with the currently installed listeners.
    pub fn session<E: Executor>(&self, executor: E) -> Session<E> {
        let mut listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        listeners.sort_by_key(|l| l.phase());
        Session {
            listeners,
            config: self.config.clone(),
            ..Session::new(executor, Arc::clone(&self.registry))
        }
    }
}

fn remove_listener(listeners: &RwLock<Vec<Arc<dyn FlushListener>>>, name: &str) -> bool {
    let mut listeners = listeners.write().unwrap_or_else(PoisonError::into_inner);
    let before = listeners.len();
    listeners.retain(|l| l.name() != name);
    if listeners.len() == before {
        return false;
    }
    tracing::debug!(listener = name, "Removed flush listener");
    true
}

/// Weak handle to the flush listeners of a [`SessionFactory`].
#[derive(Debug, Clone)]
pub struct ListenerHandle(Weak<RwLock<Vec<Arc<dyn FlushListener>>>>);

impl ListenerHandle {
    /// Remove the listener named `name`. Returns `false` when it is not
    /// installed or the factory has been dropped.
    pub fn unlisten(&self, name: &str) -> bool {
        self.0
            .upgrade()
            .is_some_and(|listeners| remove_listener(&listeners, name))
    }

    /// Whether the factory still exists.
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Whether both handles point at the same factory.
    pub fn same_factory(&self, other: &ListenerHandle) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work: tracks objects and writes their changes on flush.
pub struct Session<E: Executor> {
    executor: E,
    registry: Arc<Registry>,
    config: SessionConfig,
    listeners: Vec<Arc<dyn FlushListener>>,
    objects: Vec<ObjectRef>,
    members: HashSet<ObjectRef>,
    pending_delete: Vec<ObjectRef>,
    identity_map: IdentityMap,
    in_transaction: bool,
}

impl<E: Executor> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("objects", &self.objects.len())
            .field("pending_delete", &self.pending_delete.len())
            .field("identity_map", &self.identity_map.len())
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> Session<E> {
    /// A session without flush listeners.
    pub fn new(executor: E, registry: Arc<Registry>) -> Self {
        Self {
            executor,
            registry,
            config: SessionConfig::default(),
            listeners: Vec::new(),
            objects: Vec::new(),
            members: HashSet::new(),
            pending_delete: Vec::new(),
            identity_map: IdentityMap::new(),
            in_transaction: false,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ========================================================================
    // Object tracking
    // ========================================================================

    fn track(&mut self, obj: ObjectRef) {
        if self.members.insert(obj.clone()) {
            self.objects.push(obj);
        }
    }

    fn untrack(&mut self, obj: &ObjectRef) {
        if self.members.remove(obj) {
            self.objects.retain(|o| o != obj);
        }
    }

    /// Track `obj` (and, with `cascade_on_add`, everything reachable from it).
    pub fn add(&mut self, obj: &ObjectRef) {
        self.pending_delete.retain(|o| o != obj);
        let found = if self.config.cascade_on_add {
            let skip: HashSet<ObjectRef> = self.pending_delete.iter().cloned().collect();
            flush::cascade(std::slice::from_ref(obj), &skip)
        } else {
            vec![obj.clone()]
        };
        for o in found {
            self.track(o);
        }
    }

    /// Mark `obj` for deletion at the next flush.
    pub fn delete(&mut self, obj: &ObjectRef) {
        self.untrack(obj);
        if !self.pending_delete.contains(obj) {
            self.pending_delete.push(obj.clone());
        }
    }

    /// Stop tracking `obj` without deleting it.
    pub fn expunge(&mut self, obj: &ObjectRef) {
        self.untrack(obj);
        self.pending_delete.retain(|o| o != obj);
        self.identity_map.remove(obj);
    }

    pub fn contains(&self, obj: &ObjectRef) -> bool {
        self.members.contains(obj)
    }

    /// Tracked objects not yet written.
    pub fn new_objects(&self) -> Vec<ObjectRef> {
        self.objects
            .iter()
            .filter(|o| !o.is_persistent())
            .cloned()
            .collect()
    }

    /// Tracked persistent objects with changed columns or relationships.
    pub fn dirty_objects(&self) -> Vec<ObjectRef> {
        self.objects
            .iter()
            .filter(|o| o.is_persistent() && o.is_modified())
            .cloned()
            .collect()
    }

    /// Objects marked for deletion at the next flush.
    pub fn deleted_objects(&self) -> &[ObjectRef] {
        &self.pending_delete
    }

    pub fn is_deleted(&self, obj: &ObjectRef) -> bool {
        obj.is_deleted() || self.pending_delete.contains(obj)
    }

    /// The live object of `class` with primary key `pk`, if loaded.
    pub fn identity(&self, class: &str, pk: &[Value]) -> Result<Option<ObjectRef>> {
        self.identity_map.lookup(&self.registry, class, pk)
    }

    fn persistent_objects(&self) -> Vec<ObjectRef> {
        self.objects
            .iter()
            .filter(|o| o.is_persistent())
            .cloned()
            .collect()
    }

    fn cascade_all(&mut self) {
        let skip: HashSet<ObjectRef> = self.pending_delete.iter().cloned().collect();
        for obj in flush::cascade(&self.objects, &skip) {
            self.track(obj);
        }
    }

    // ========================================================================
    // Statements and queries
    // ========================================================================

    /// Run a query on the session's executor.
    pub async fn query(&self, cx: &Cx, select: &Select) -> Outcome<Vec<Row>, Error> {
        self.executor.query(cx, select).await
    }

    /// Run a statement on the session's executor.
    pub async fn execute(&self, cx: &Cx, statement: &Statement) -> Outcome<u64, Error> {
        self.executor.execute(cx, statement).await
    }

    /// Every column of `mapper` for the row keyed by `pk`, `None` if missing.
    async fn fetch(
        &self,
        cx: &Cx,
        mapper: &Mapper,
        pk: &[Value],
    ) -> Outcome<Option<Vec<(String, Value)>>, Error> {
        let key = mapper.primary_key();
        let mut values = Vec::new();
        for (table, fields) in mapper.tables() {
            let mut select = Select::new().from_table(table);
            for field in fields {
                select = select.column(Expr::col(&field.name));
            }
            if let Some(filter) = Expr::and_all(
                key.iter()
                    .zip(pk)
                    .map(|(column, value)| Expr::col(column).eq(value.clone())),
            ) {
                select = select.filter(filter);
            }
            let rows = match self.executor.query(cx, &select).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let Some(row) = rows.into_iter().next() else {
                return Outcome::Ok(None);
            };
            values.extend(row.iter().map(|(name, value)| (name.to_string(), value.clone())));
        }
        Outcome::Ok(Some(values))
    }

    /// Load `class` by primary key, through the identity map.
    pub async fn get(
        &mut self,
        cx: &Cx,
        class: &str,
        pk: &[Value],
    ) -> Outcome<Option<ObjectRef>, Error> {
        match self.identity(class, pk) {
            Ok(Some(obj)) => return Outcome::Ok(Some(obj)),
            Ok(None) => {}
            Err(e) => return Outcome::Err(e),
        }
        let obj = match self.registry.create(class) {
            Ok(obj) => obj,
            Err(e) => return Outcome::Err(e),
        };
        let values = match self.fetch(cx, obj.mapper(), pk).await {
            Outcome::Ok(Some(values)) => values,
            Outcome::Ok(None) => return Outcome::Ok(None),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for (column, value) in values {
            obj.set_committed(&column, value);
        }
        obj.commit_state();
        obj.mark_persistent();
        self.identity_map.insert(&obj);
        self.track(obj.clone());
        Outcome::Ok(Some(obj))
    }

    /// Re-read every column of `obj` from the database.
    pub async fn refresh(&mut self, cx: &Cx, obj: &ObjectRef) -> Outcome<(), Error> {
        let pk = obj.primary_key();
        let values = match self.fetch(cx, obj.mapper(), &pk).await {
            Outcome::Ok(Some(values)) => values,
            Outcome::Ok(None) => {
                return Outcome::Err(Error::Query(QueryError::new(
                    QueryErrorKind::NotFound,
                    format!("{obj:?} no longer exists"),
                )));
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for (column, value) in values {
            obj.set_committed(&column, value);
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }

        match self.executor.execute(cx, &Statement::Begin).await {
            Outcome::Ok(_) => {
                self.in_transaction = true;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Flush, then commit the current transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if self.in_transaction {
            match self.executor.execute(cx, &Statement::Commit).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Roll back the current transaction.
    ///
    /// Pending deletions are dropped; in-memory attribute values are kept.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            match self.executor.execute(cx, &Statement::Rollback).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.pending_delete.clear();
        Outcome::Ok(())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write pending changes to the database. Does NOT commit.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if self.config.auto_begin && !self.in_transaction {
            match self.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let mut result = FlushResult::new();
        self.cascade_all();

        for listener in self.listeners.clone() {
            let new = self.new_objects();
            let dirty = self.dirty_objects();
            let deleted = self.pending_delete.clone();
            let ctx = FlushContext::new(&self.registry, &new, &dirty, &deleted);
            tracing::trace!(
                listener = listener.name(),
                phase = listener.phase().as_str(),
                "before_flush"
            );
            if let Err(e) = listener.before_flush(&ctx) {
                return Outcome::Err(e);
            }
        }
        self.cascade_all();

        let deleting = match flush::expand_deletes(&self.pending_delete) {
            Ok(deleting) => deleting,
            Err(e) => return Outcome::Err(e),
        };
        let deleting_set: HashSet<ObjectRef> = deleting.iter().cloned().collect();
        for obj in &deleting {
            self.untrack(obj);
        }

        // INSERT
        let new = match flush::order_inserts(&self.new_objects()) {
            Ok(new) => new,
            Err(e) => return Outcome::Err(e),
        };
        for obj in self.persistent_objects() {
            if let Err(e) = flush::push_foreign_keys(&obj, &deleting_set) {
                return Outcome::Err(e);
            }
        }
        for obj in &new {
            if let Err(e) = flush::pull_foreign_keys(obj) {
                return Outcome::Err(e);
            }
            match self.insert_object(cx, obj).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            self.identity_map.insert(obj);
            result.inserted += 1;
            if let Err(e) = flush::push_foreign_keys(obj, &deleting_set) {
                return Outcome::Err(e);
            }
        }

        // UPDATE
        let persistent = self.persistent_objects();
        for obj in &persistent {
            if let Err(e) = flush::pull_foreign_keys(obj) {
                return Outcome::Err(e);
            }
        }
        for obj in &persistent {
            if let Err(e) = flush::push_foreign_keys(obj, &deleting_set) {
                return Outcome::Err(e);
            }
        }
        let dirty: Vec<ObjectRef> = persistent.into_iter().filter(ObjectRef::is_modified).collect();
        for obj in &dirty {
            for update in flush::update_rows(obj) {
                match self.executor.execute(cx, &update.into()).await {
                    Outcome::Ok(_) => result.updated += 1,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }

        // Link tables
        let mut touched = self.objects.clone();
        touched.extend(deleting.iter().cloned());
        for op in flush::link_ops(&touched, &deleting_set) {
            match self.executor.execute(cx, &op.to_statement()).await {
                Outcome::Ok(_) if op.is_link() => result.linked += 1,
                Outcome::Ok(_) => result.unlinked += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // DELETE
        for obj in deleting.iter().rev().filter(|o| o.is_persistent()) {
            let mut statements: Vec<Statement> = flush::unlink_all(&self.registry, obj)
                .iter()
                .map(LinkTableOp::to_statement)
                .collect();
            statements.extend(flush::delete_rows(obj).into_iter().map(Statement::from));
            for statement in &statements {
                match self.executor.execute(cx, statement).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            result.deleted += 1;
        }

        for listener in self.listeners.clone() {
            let statements = {
                let ctx = FlushContext::new(&self.registry, &new, &dirty, &deleting);
                match listener.after_flush(&ctx) {
                    Ok(statements) => statements,
                    Err(e) => return Outcome::Err(e),
                }
            };
            if !statements.is_empty() {
                tracing::debug!(
                    listener = listener.name(),
                    count = statements.len(),
                    "Executing listener statements"
                );
            }
            for statement in &statements {
                match self.run_listener_statement(cx, statement).await {
                    Outcome::Ok(()) => result.derived += 1,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }

        self.finish_flush(&deleting);
        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            linked = result.linked,
            unlinked = result.unlinked,
            derived = result.derived,
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    async fn insert_object(&self, cx: &Cx, obj: &ObjectRef) -> Outcome<(), Error> {
        for (table, fields) in obj.mapper().tables() {
            let insert = flush::insert_row(obj, table, fields);
            match self.executor.insert(cx, &insert).await {
                Outcome::Ok(Some(id)) => {
                    if let Some(column) = &insert.returning {
                        obj.set_committed(column, id);
                    }
                }
                Outcome::Ok(None) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        tracing::trace!(object = ?obj, "Inserted");
        Outcome::Ok(())
    }

    /// Execute a listener statement. A refreshing UPDATE also writes the
    /// assigned columns back into the live objects of the affected rows.
    async fn run_listener_statement(&self, cx: &Cx, statement: &Statement) -> Outcome<(), Error> {
        let target = match statement {
            Statement::Update(update) if update.refresh => self
                .registry
                .mapper_for_table(&update.table)
                .map(|mapper| (update, mapper.primary_key())),
            _ => None,
        };
        let Some((update, key)) = target else {
            return match self.executor.execute(cx, statement).await {
                Outcome::Ok(_) => Outcome::Ok(()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            };
        };

        let mut affected = Select::new().from_table(&update.table);
        for column in key {
            affected = affected.column(Expr::col(column));
        }
        if let Some(filter) = &update.where_clause {
            affected = affected.filter(filter.clone());
        }
        let keys: Vec<Vec<Value>> = match self.executor.query(cx, &affected).await {
            Outcome::Ok(rows) => rows.into_iter().map(Row::into_values).collect(),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.executor.execute(cx, statement).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let Some(filter) = flush::key_filter(key, &keys) else {
            return Outcome::Ok(());
        };
        match self.executor.query(cx, &reread(update, key, filter)).await {
            Outcome::Ok(rows) => {
                for row in rows {
                    let values = row.into_values();
                    let (pk, assigned) = values.split_at(key.len().min(values.len()));
                    let Some(obj) =
                        self.identity_map
                            .lookup_table(&self.registry, &update.table, pk)
                    else {
                        continue;
                    };
                    for ((column, _), value) in update.set.iter().zip(assigned) {
                        obj.set_committed(column, value.clone());
                    }
                }
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn finish_flush(&mut self, deleting: &[ObjectRef]) {
        let doomed: HashSet<&ObjectRef> = deleting.iter().collect();
        for obj in &self.objects {
            for rel in obj.mapper().relationships() {
                for target in obj.collection(rel.name()) {
                    if doomed.contains(&target) {
                        obj.detach_silently(rel.name(), &target);
                    }
                }
            }
        }
        for obj in deleting {
            for rel in obj.mapper().relationships() {
                if let Some(back) = rel.back_populates() {
                    for target in obj.collection(rel.name()) {
                        target.detach_silently(back, obj);
                    }
                }
            }
            obj.commit_state();
            if obj.is_persistent() {
                self.identity_map.remove(obj);
                obj.mark_deleted();
            }
        }
        for obj in &self.objects {
            obj.commit_state();
            obj.mark_persistent();
            self.identity_map.insert(obj);
        }
        self.pending_delete.clear();
    }
}

/// SELECT of the key and assigned columns of `update`'s rows matching `filter`.
fn reread(update: &Update, key: &[String], filter: Expr) -> Select {
    let mut select = Select::new().from_table(&update.table);
    for column in key.iter().chain(update.set.iter().map(|(c, _)| c)) {
        select = select.column(Expr::col(column));
    }
    select.filter(filter)
}
