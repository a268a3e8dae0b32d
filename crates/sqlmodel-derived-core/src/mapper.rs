//! Mapped classes and the mapper registry.
//!
//! A [`Mapper`] describes one mapped class: its table, columns, relationships and
//! (for joined-table inheritance) its base class. Mappers are declared with a
//! [`MapperBuilder`] and configured together by a [`RegistryBuilder`], which
//! resolves relationships, validates back-references and then runs the
//! [`ConfigureListener`] hooks:
//!
//! 1. `mapper_configured` once per mapper, in configuration order;
//! 2. `after_configured` once, with the finished registry.
//!
//! Mappers also carry per-attribute listener channels. Listeners are added after
//! configuration and are fired by [`ObjectRef`] whenever a column is set or a
//! relationship is modified.

use crate::error::{ConfigError, Error, Result};
use crate::field::FieldInfo;
use crate::ident::validate_identifier;
use crate::object::ObjectRef;
use crate::relationship::{Relationship, RelationshipInfo, RelationshipKind};
use crate::value::Value;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A change observed on one attribute of a live object.
#[derive(Debug, Clone)]
pub enum AttributeChange {
    /// A column value was set.
    Column { old: Value, new: Value },
    /// A scalar relationship was replaced.
    Scalar {
        old: Option<ObjectRef>,
        new: Option<ObjectRef>,
    },
    /// An object was appended to a collection.
    Appended(ObjectRef),
    /// An object was removed from a collection.
    Removed(ObjectRef),
}

/// Receives attribute changes for the `(class, attribute)` it is registered on.
///
/// Listeners run synchronously, after the object's lock has been released, so
/// they may read and write the target and any other object.
pub trait AttributeListener: Send + Sync {
    fn on_change(&self, target: &ObjectRef, attribute: &str, change: &AttributeChange)
    -> Result<()>;
}

impl<F> AttributeListener for F
where
    F: Fn(&ObjectRef, &str, &AttributeChange) -> Result<()> + Send + Sync,
{
    fn on_change(
        &self,
        target: &ObjectRef,
        attribute: &str,
        change: &AttributeChange,
    ) -> Result<()> {
        self(target, attribute, change)
    }
}

/// Handle returned by [`Mapper::add_listener`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

impl ListenerKey {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerKey(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type ListenerMap = HashMap<String, Vec<(ListenerKey, Arc<dyn AttributeListener>)>>;

/// Hooks run while a [`RegistryBuilder`] configures its mappers.
pub trait ConfigureListener: Send + Sync {
    /// Unique name; installing a second listener with the same name is a no-op.
    fn name(&self) -> &str;

    /// Called once per mapper after every mapper has been built.
    fn mapper_configured(&self, _registry: &Registry, _mapper: &Arc<Mapper>) -> Result<()> {
        Ok(())
    }

    /// Called once after all mappers have been configured.
    fn after_configured(&self, _registry: &Arc<Registry>) -> Result<()> {
        Ok(())
    }
}

/// One mapped class.
pub struct Mapper {
    name: String,
    table: String,
    parent: Option<Arc<Mapper>>,
    columns: Vec<FieldInfo>,
    primary_key: Vec<String>,
    relationships: Vec<Relationship>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    listeners: RwLock<ListenerMap>,
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("columns", &self.columns.len())
            .field("relationships", &self.relationships.len())
            .finish_non_exhaustive()
    }
}

impl Mapper {
    /// Start declaring a mapped class.
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> MapperBuilder {
        MapperBuilder::new(name, table)
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table holding this class's own columns.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Base class, for joined-table inheritance.
    pub fn parent(&self) -> Option<&Arc<Mapper>> {
        self.parent.as_ref()
    }

    /// This mapper followed by its base classes, most derived first.
    pub fn ancestry(&self) -> Vec<&Mapper> {
        let mut chain = vec![self];
        let mut current = self.parent.as_deref();
        while let Some(m) = current {
            chain.push(m);
            current = m.parent.as_deref();
        }
        chain
    }

    /// The root of the inheritance hierarchy.
    pub fn base(&self) -> &Mapper {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }

    /// Whether this class is `class` or inherits from it.
    pub fn is_subclass_of(&self, class: &str) -> bool {
        self.ancestry().iter().any(|m| m.name == class)
    }

    /// `(table, local columns)` for each table of the hierarchy, base first.
    pub fn tables(&self) -> Vec<(&str, &[FieldInfo])> {
        self.ancestry()
            .into_iter()
            .rev()
            .map(|m| (m.table.as_str(), m.columns.as_slice()))
            .collect()
    }

    /// Columns stored in this class's own table.
    pub fn local_columns(&self) -> &[FieldInfo] {
        &self.columns
    }

    /// Every column of the class, base table columns first, primary key once.
    pub fn columns(&self) -> Vec<&FieldInfo> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, cols) in self.tables() {
            for col in cols {
                if seen.insert(col.name.as_str()) {
                    out.push(col);
                }
            }
        }
        out
    }

    /// Look up a column by name, including inherited columns.
    pub fn column(&self, name: &str) -> Option<&FieldInfo> {
        self.ancestry()
            .into_iter()
            .find_map(|m| m.columns.iter().find(|c| c.name == name))
    }

    /// The most derived table that physically stores `column`.
    pub fn table_for_column(&self, column: &str) -> Option<&str> {
        self.ancestry()
            .into_iter()
            .find(|m| m.columns.iter().any(|c| c.name == column))
            .map(|m| m.table.as_str())
    }

    /// Primary key column names, shared by every table of the hierarchy.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// All relationships, inherited ones first.
    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name() == name)
    }

    /// Typed extension data attached by a [`MapperBuilder`].
    pub fn extension<T: Any>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|ext| ext.downcast_ref::<T>())
    }

    /// Register a listener for `attribute` (a column or relationship name).
    ///
    /// Listeners registered on a base class also fire for subclass instances.
    pub fn add_listener(
        &self,
        attribute: impl Into<String>,
        listener: Arc<dyn AttributeListener>,
    ) -> ListenerKey {
        let key = ListenerKey::next();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(attribute.into())
            .or_default()
            .push((key, listener));
        key
    }

    /// Remove a listener. Returns `false` when the key is unknown.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(k, _)| *k != key);
            removed |= entries.len() != before;
        }
        listeners.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Listeners for `attribute` on this class and its base classes.
    pub fn listeners_for(&self, attribute: &str) -> Vec<Arc<dyn AttributeListener>> {
        let mut out = Vec::new();
        for m in self.ancestry() {
            let listeners = m.listeners.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entries) = listeners.get(attribute) {
                out.extend(entries.iter().map(|(_, l)| Arc::clone(l)));
            }
        }
        out
    }

    /// Total number of listeners registered directly on this mapper.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Declares a mapped class.
pub struct MapperBuilder {
    name: String,
    table: String,
    inherits: Option<String>,
    columns: Vec<FieldInfo>,
    relationships: Vec<RelationshipInfo>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for MapperBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapperBuilder")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("inherits", &self.inherits)
            .finish_non_exhaustive()
    }
}

impl MapperBuilder {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            inherits: None,
            columns: Vec::new(),
            relationships: Vec::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a column.
    pub fn column(mut self, field: FieldInfo) -> Self {
        self.columns.push(field);
        self
    }

    /// Add a relationship.
    pub fn relationship(mut self, info: RelationshipInfo) -> Self {
        self.relationships.push(info);
        self
    }

    /// Inherit from `base` using joined-table inheritance.
    ///
    /// The subclass table receives copies of the base primary key columns.
    pub fn inherits(mut self, base: impl Into<String>) -> Self {
        self.inherits = Some(base.into());
        self
    }

    /// Mutable access to a typed extension slot, created on first use.
    pub fn extension_mut<T: Default + Any + Send + Sync>(&mut self) -> &mut T {
        let slot = self
            .extensions
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        match slot.downcast_mut::<T>() {
            Some(ext) => ext,
            None => unreachable!("extension slots are keyed by their own TypeId"),
        }
    }
}

/// Collects mapper declarations and configures them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    builders: Vec<MapperBuilder>,
    listeners: Vec<Arc<dyn ConfigureListener>>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("mappers", &self.builders)
            .field(
                "listeners",
                &self.listeners.iter().map(|l| l.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapper declaration (builder style).
    pub fn mapper(mut self, builder: MapperBuilder) -> Self {
        self.builders.push(builder);
        self
    }

    /// Add a mapper declaration.
    pub fn add_mapper(&mut self, builder: MapperBuilder) {
        self.builders.push(builder);
    }

    /// Install a configuration listener. Returns `false` if one with the same
    /// name is already installed.
    pub fn listen(&mut self, listener: Arc<dyn ConfigureListener>) -> bool {
        if self.listeners.iter().any(|l| l.name() == listener.name()) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Whether a listener with `name` is installed.
    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners.iter().any(|l| l.name() == name)
    }

    /// Build, validate and configure every declared mapper.
    #[tracing::instrument(level = "debug", skip(self), fields(mappers = self.builders.len()))]
    pub fn configure(self) -> Result<Arc<Registry>> {
        let RegistryBuilder {
            builders,
            listeners,
        } = self;

        let order = inheritance_order(&builders)?;
        let primary_keys = primary_keys(&builders)?;

        let mut slots: Vec<Option<MapperBuilder>> = builders.into_iter().map(Some).collect();
        let mut mappers: Vec<Arc<Mapper>> = Vec::with_capacity(slots.len());
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for idx in order {
            let Some(builder) = slots[idx].take() else {
                continue;
            };
            let parent = match &builder.inherits {
                Some(base) => by_name.get(base).map(|&i| Arc::clone(&mappers[i])),
                None => None,
            };
            let mapper = build_mapper(builder, parent, &primary_keys)?;
            by_name.insert(mapper.name.clone(), mappers.len());
            mappers.push(Arc::new(mapper));
        }

        let registry = Arc::new(Registry { mappers, by_name });
        registry.validate()?;
        tracing::debug!(mappers = registry.mappers.len(), "Mappers built");

        for listener in &listeners {
            for mapper in registry.mappers() {
                listener.mapper_configured(&registry, mapper)?;
            }
        }
        for listener in &listeners {
            listener.after_configured(&registry)?;
        }

        tracing::info!(
            mappers = registry.mappers.len(),
            listeners = listeners.len(),
            "Registry configured"
        );
        Ok(registry)
    }
}

/// Indices of `builders` ordered so every base class precedes its subclasses.
fn inheritance_order(builders: &[MapperBuilder]) -> Result<Vec<usize>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, b) in builders.iter().enumerate() {
        validate_identifier("class", &b.name)?;
        validate_identifier("table", &b.table)?;
        if index.insert(b.name.as_str(), i).is_some() {
            return Err(Error::Config(
                ConfigError::new("class is declared twice").class(&b.name),
            ));
        }
    }
    let mut tables = HashSet::new();
    for b in builders {
        if !tables.insert(b.table.as_str()) {
            return Err(Error::Config(
                ConfigError::new(format!("table '{}' is mapped twice", b.table)).class(&b.name),
            ));
        }
    }

    let mut order = Vec::with_capacity(builders.len());
    let mut placed = vec![false; builders.len()];
    for start in 0..builders.len() {
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(i) = current {
            if placed[i] {
                break;
            }
            if chain.contains(&i) {
                return Err(Error::Config(
                    ConfigError::new("inheritance cycle").class(&builders[i].name),
                ));
            }
            chain.push(i);
            current = match &builders[i].inherits {
                Some(base) => Some(*index.get(base.as_str()).ok_or_else(|| {
                    Error::Config(
                        ConfigError::new(format!("unknown base class '{base}'"))
                            .class(&builders[i].name),
                    )
                })?),
                None => None,
            };
        }
        for i in chain.into_iter().rev() {
            placed[i] = true;
            order.push(i);
        }
    }
    Ok(order)
}

/// Primary key column names per class, taken from the root of each hierarchy.
fn primary_keys(builders: &[MapperBuilder]) -> Result<HashMap<String, Vec<String>>> {
    let by_name: HashMap<&str, &MapperBuilder> =
        builders.iter().map(|b| (b.name.as_str(), b)).collect();
    let mut out = HashMap::new();
    for b in builders {
        let mut root = b;
        while let Some(base) = root.inherits.as_deref().and_then(|n| by_name.get(n)) {
            root = base;
        }
        let pk: Vec<String> = root
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        if pk.is_empty() {
            return Err(Error::Config(
                ConfigError::new("mapped class has no primary key").class(&root.name),
            ));
        }
        out.insert(b.name.clone(), pk);
    }
    Ok(out)
}

fn build_mapper(
    builder: MapperBuilder,
    parent: Option<Arc<Mapper>>,
    primary_keys: &HashMap<String, Vec<String>>,
) -> Result<Mapper> {
    let MapperBuilder {
        name,
        table,
        inherits: _,
        columns: declared,
        relationships,
        extensions,
    } = builder;

    let primary_key = primary_keys.get(&name).cloned().unwrap_or_default();

    let mut columns = Vec::new();
    if let Some(parent) = &parent {
        for pk in &primary_key {
            if let Some(col) = parent.column(pk) {
                let mut copy = col.clone();
                copy.auto_increment = false;
                copy.foreign_key = Some(format!("{}.{}", parent.base().table(), pk));
                columns.push(copy);
            }
        }
        if declared.iter().any(|c| c.primary_key) {
            return Err(Error::Config(
                ConfigError::new("subclasses inherit the primary key of their base").class(&name),
            ));
        }
    }
    for col in declared {
        validate_identifier("column", &col.name)?;
        let inherited = parent.as_ref().is_some_and(|p| p.column(&col.name).is_some());
        if inherited || columns.iter().any(|c: &FieldInfo| c.name == col.name) {
            return Err(Error::config(&name, &col.name, "column is declared twice"));
        }
        columns.push(col);
    }

    let mut resolved: Vec<Relationship> = parent
        .as_ref()
        .map(|p| p.relationships.clone())
        .unwrap_or_default();
    for info in relationships {
        validate_identifier("relationship", &info.name)?;
        let clashes_column = columns.iter().any(|c| c.name == info.name)
            || parent.as_ref().is_some_and(|p| p.column(&info.name).is_some());
        if clashes_column || resolved.iter().any(|r| r.name() == info.name) {
            return Err(Error::config(&name, &info.name, "attribute is declared twice"));
        }
        let target_pk = primary_keys.get(&info.target).ok_or_else(|| {
            Error::config(
                &name,
                &info.name,
                format!("unknown target class '{}'", info.target),
            )
        })?;
        resolved.push(Relationship::resolve(info, &name, &primary_key, target_pk)?);
    }

    Ok(Mapper {
        name,
        table,
        parent,
        columns,
        primary_key,
        relationships: resolved,
        extensions,
        listeners: RwLock::new(HashMap::new()),
    })
}

/// The configured set of mappers.
#[derive(Debug)]
pub struct Registry {
    mappers: Vec<Arc<Mapper>>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    /// All mappers, base classes before subclasses.
    pub fn mappers(&self) -> &[Arc<Mapper>] {
        &self.mappers
    }

    /// Look up a mapper by class name.
    pub fn mapper(&self, class: &str) -> Result<&Arc<Mapper>> {
        self.by_name
            .get(class)
            .map(|&i| &self.mappers[i])
            .ok_or_else(|| Error::Config(ConfigError::new(format!("unknown class '{class}'"))))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.by_name.contains_key(class)
    }

    /// The mapper whose own table is `table`.
    pub fn mapper_for_table(&self, table: &str) -> Option<&Arc<Mapper>> {
        self.mappers.iter().find(|m| m.table == table)
    }

    /// Create a new, transient instance of `class`.
    pub fn create(&self, class: &str) -> Result<ObjectRef> {
        Ok(ObjectRef::new(Arc::clone(self.mapper(class)?)))
    }

    /// Mappers that are `class` or inherit from it.
    pub fn subclasses_of(&self, class: &str) -> Vec<&Arc<Mapper>> {
        self.mappers
            .iter()
            .filter(|m| m.is_subclass_of(class))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        for mapper in &self.mappers {
            for rel in mapper.relationships() {
                if rel.parent != mapper.name {
                    continue;
                }
                let target = self.mapper(rel.target())?;
                self.validate_keys(mapper, target, rel)?;
                self.validate_back_populates(mapper, target, rel)?;
            }
        }
        Ok(())
    }

    fn validate_keys(&self, mapper: &Mapper, target: &Mapper, rel: &Relationship) -> Result<()> {
        let missing = |owner: &Mapper, column: &str| {
            Error::config(
                mapper.name(),
                rel.name(),
                format!("column '{}.{}' does not exist", owner.name(), column),
            )
        };
        for (local, remote) in rel.parent_foreign_keys() {
            if mapper.column(&local).is_none() {
                return Err(missing(mapper, &local));
            }
            if target.column(&remote).is_none() {
                return Err(missing(target, &remote));
            }
        }
        for (local, remote) in rel.target_foreign_keys(mapper.primary_key()) {
            if mapper.column(&local).is_none() {
                return Err(missing(mapper, &local));
            }
            if target.column(&remote).is_none() {
                return Err(missing(target, &remote));
            }
        }
        Ok(())
    }

    /// If `A.x` has `back_populates = "y"`, then `B.y` must exist, point back at
    /// `A` (or a base of `A`), and name `x` if it declares a back-reference itself.
    fn validate_back_populates(
        &self,
        mapper: &Mapper,
        target: &Mapper,
        rel: &Relationship,
    ) -> Result<()> {
        let Some(back) = rel.back_populates() else {
            return Ok(());
        };
        let Some(back_rel) = target.relationship(back) else {
            return Err(Error::config(
                mapper.name(),
                rel.name(),
                format!(
                    "back_populates='{}' but {}.{} does not exist",
                    back,
                    target.name(),
                    back
                ),
            ));
        };
        if !mapper.is_subclass_of(back_rel.target()) {
            return Err(Error::config(
                mapper.name(),
                rel.name(),
                format!(
                    "back_populates='{}' but {}.{} targets '{}'",
                    back,
                    target.name(),
                    back,
                    back_rel.target()
                ),
            ));
        }
        if let Some(reverse) = back_rel.back_populates() {
            if reverse != rel.name() {
                return Err(Error::config(
                    mapper.name(),
                    rel.name(),
                    format!(
                        "{}.{} has back_populates='{}' (expected '{}')",
                        target.name(),
                        back,
                        reverse,
                        rel.name()
                    ),
                ));
            }
        }
        let many_to_many = |kind| kind == RelationshipKind::ManyToMany;
        if many_to_many(rel.kind()) != many_to_many(back_rel.kind()) {
            return Err(Error::config(
                mapper.name(),
                rel.name(),
                "many-to-many relationships must be paired with many-to-many",
            ));
        }
        Ok(())
    }
}
