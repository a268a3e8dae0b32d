//! Generated attributes.
//!
//! A generated attribute is a column computed from other attributes, either of
//! the same row ([`Generator::row`](crate::Generator::row)) or of the objects a
//! relation path reaches ([`Generator::related`](crate::Generator::related),
//! [`Generator::copy`](crate::Generator::copy)).
//!
//! Values are kept current two ways:
//!
//! - **listeners**: every relationship on a source path, and the copied leaf
//!   column, gets an attribute listener that recomputes the owners reached by
//!   walking the path backwards from the changed object;
//! - **before flush**: generators run for every new or dirty owner, in
//!   declaration order, and for every owner reachable from a flushed object
//!   on a source path.
//!
//! A source that reaches nothing (or only deleted objects) yields NULL, or a
//! [`DataError`] for generators declared `required`.

use crate::declarative::{Declaration, Declarations, GeneratorSource, RelatedFn, RowFn};
use crate::index::{ClassIndex, inverse_prefixes};
use sqlmodel_derived_core::{
    AttrPath, AttributeChange, AttributeListener, ConfigureListener, DataError, DependencyError,
    Dotted, Error, ListenerKey, Mapper, ObjectRef, Path, Registry, Result, Value,
    getdotattr_filtered, reachable_with_history,
};
use sqlmodel_derived_session::{FlushContext, FlushListener, FlushPhase};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

enum Source {
    Row(RowFn),
    Related { path: AttrPath, f: RelatedFn },
    Copy { path: AttrPath, column: String },
}

/// A resolved generated attribute.
pub struct GeneratedAttribute {
    id: usize,
    owner: Arc<Mapper>,
    target: String,
    source: Source,
    depends_on: Vec<String>,
    required: bool,
}

impl fmt::Debug for GeneratedAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedAttribute")
            .field("owner", &self.owner.name())
            .field("target", &self.target)
            .field("source", &self.source_path().map(ToString::to_string))
            .field("required", &self.required)
            .finish()
    }
}

impl GeneratedAttribute {
    /// The class declaring the generator.
    pub fn owner(&self) -> &Arc<Mapper> {
        &self.owner
    }

    /// The column the generated value is written to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The relation path the value is read through, `None` for row generators.
    pub fn source_path(&self) -> Option<&AttrPath> {
        match &self.source {
            Source::Row(_) => None,
            Source::Related { path, .. } | Source::Copy { path, .. } => Some(path),
        }
    }

    /// Whether an empty source is an error rather than NULL.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Compute the value for `owner`, treating objects accepted by
    /// `is_deleted` as absent.
    pub fn evaluate(&self, owner: &ObjectRef, is_deleted: &dyn Fn(&ObjectRef) -> bool) -> Result<Value> {
        match &self.source {
            Source::Row(f) => f(owner),
            Source::Related { path, f } => {
                let found = getdotattr_filtered(owner, path.path(), |o| !is_deleted(o))?;
                if found.is_empty() {
                    return self.missing(owner, path);
                }
                f(owner, &found)
            }
            Source::Copy { path, column } => {
                match getdotattr_filtered(owner, path.path(), |o| !is_deleted(o))? {
                    Dotted::One(leaf) => Ok(leaf.get(column)),
                    _ => self.missing(owner, path),
                }
            }
        }
    }

    fn missing(&self, owner: &ObjectRef, path: &AttrPath) -> Result<Value> {
        if !self.required {
            return Ok(Value::Null);
        }
        Err(Error::Data(DataError::new(
            owner.class_name(),
            &self.target,
            path.path().to_string(),
            format!("{owner:?} reaches no object through '{}'", path.path()),
        )))
    }

    /// Recompute and assign the value. Returns whether it changed.
    pub fn apply(&self, owner: &ObjectRef, is_deleted: &dyn Fn(&ObjectRef) -> bool) -> Result<bool> {
        let value = self.evaluate(owner, is_deleted)?;
        if owner.get(&self.target) == value {
            return Ok(false);
        }
        tracing::trace!(
            object = ?owner,
            target = self.target.as_str(),
            "Generated value changed"
        );
        owner.set(&self.target, value)?;
        Ok(true)
    }

    fn applies_to(&self, obj: &ObjectRef) -> bool {
        obj.is_instance_of(self.owner.name())
    }
}

struct Watch {
    generated: Arc<GeneratedAttribute>,
    inverse: AttrPath,
}

#[derive(Default)]
struct State {
    generated: Vec<Arc<GeneratedAttribute>>,
    /// Classes on source paths, excluding the owners themselves.
    index: ClassIndex<Watch>,
}

/// Generated attributes of one mapper registry.
#[derive(Default)]
pub struct GeneratedRegistry {
    state: RwLock<State>,
    listeners: Mutex<Vec<(Arc<Mapper>, ListenerKey)>>,
}

impl fmt::Debug for GeneratedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedRegistry")
            .field("generated", &self.read().generated)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl GeneratedRegistry {
    /// Flush listener name.
    pub const NAME: &'static str = "sqlmodel-derived.generates";

    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every registered generator, in declaration order.
    pub fn generated(&self) -> Vec<Arc<GeneratedAttribute>> {
        self.read().generated.clone()
    }

    /// Generators that apply to instances of `class`, in declaration order.
    pub fn generated_for(&self, mapper: &Mapper) -> Vec<Arc<GeneratedAttribute>> {
        self.read()
            .generated
            .iter()
            .filter(|g| mapper.is_subclass_of(g.owner.name()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().generated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().generated.is_empty()
    }

    /// Attribute listeners currently installed on mappers.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Remove every attribute listener and forget every generator.
    pub fn clear(&self) {
        let keys: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (mapper, key) in keys {
            mapper.remove_listener(key);
        }
        let mut state = self.write();
        state.generated.clear();
        state.index.clear();
    }

    fn register(&self, registry: &Registry, mapper: &Arc<Mapper>) -> Result<()> {
        let mut state = self.write();
        for declaration in Declarations::of(mapper) {
            let Declaration::Generator { target, generator } = declaration else {
                continue;
            };
            let class = mapper.name();
            if mapper.column(target).is_none() {
                return Err(Error::config(
                    class,
                    target,
                    format!("generated column '{target}' does not exist"),
                ));
            }
            if state
                .generated
                .iter()
                .any(|g| g.owner.name() == class && g.target == *target)
            {
                return Err(Error::config(class, target, "column has more than one generator"));
            }

            let source = match &generator.source {
                GeneratorSource::Row(f) => Source::Row(Arc::clone(f)),
                GeneratorSource::Related { path, f } => {
                    let path = AttrPath::new(registry, class, path)?;
                    if path.is_empty() {
                        return Err(Error::config(
                            class,
                            target,
                            "a related generator needs a source path; use Generator::row",
                        ));
                    }
                    Source::Related {
                        path,
                        f: Arc::clone(f),
                    }
                }
                GeneratorSource::Copy { path } => resolve_copy(registry, mapper, target, path)?,
            };

            let generated = Arc::new(GeneratedAttribute {
                id: state.generated.len(),
                owner: Arc::clone(mapper),
                target: target.clone(),
                source,
                depends_on: generator.depends_on.clone(),
                required: generator.required,
            });

            if let Some(path) = generated.source_path() {
                for (position, inverse) in inverse_prefixes(path).into_iter().skip(1) {
                    state.index.insert(
                        path.class_at(position).name(),
                        Watch {
                            generated: Arc::clone(&generated),
                            inverse: inverse?,
                        },
                    );
                }
            }

            tracing::debug!(
                class,
                target = target.as_str(),
                source = generator.source(),
                "Generator registered"
            );
            state.generated.push(generated);
        }
        Ok(())
    }

    /// Fail when generated attributes depend on each other in a cycle.
    pub fn check_dependencies(&self) -> Result<()> {
        let state = self.read();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for g in &state.generated {
            let target = node(&g.owner, &g.target);
            let mut sources = Vec::new();
            match &g.source {
                Source::Row(_) => {
                    sources.extend(g.depends_on.iter().map(|d| node(&g.owner, d)));
                }
                Source::Related { path, .. } => {
                    sources.extend(g.depends_on.iter().map(|d| node(path.leaf(), d)));
                }
                Source::Copy { path, column } => sources.push(node(path.leaf(), column)),
            }
            for source in sources {
                edges.entry(source).or_default().insert(target.clone());
            }
        }
        match find_cycle(&edges) {
            Some(chain) => Err(Error::Dependency(DependencyError {
                message: format!("generated attributes form a cycle: {}", chain.join(" -> ")),
                chain,
            })),
            None => Ok(()),
        }
    }

    /// Install attribute listeners for every cross-relation generator.
    fn install_listeners(&self) {
        let generated = self.generated();
        let mut keys = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for g in generated {
            let Some(path) = g.source_path().cloned() else {
                continue;
            };
            // Every relationship on the path, from position k.
            for (k, step) in path.steps().iter().enumerate() {
                let inverse = path.slice(0..k).inverse().ok();
                let listener = recompute_listener(Arc::clone(&g), inverse);
                keys.push((
                    Arc::clone(&step.parent),
                    step.parent.add_listener(step.name(), listener),
                ));
            }
            // Leaf columns the value is read from.
            let leaf_columns: Vec<String> = match &g.source {
                Source::Copy { column, .. } => vec![column.clone()],
                Source::Related { .. } => g.depends_on.clone(),
                Source::Row(_) => Vec::new(),
            };
            let inverse = path.inverse().ok();
            for column in leaf_columns {
                let listener = recompute_listener(Arc::clone(&g), inverse.clone());
                keys.push((Arc::clone(path.leaf()), path.leaf().add_listener(column, listener)));
            }
        }
        tracing::debug!(listeners = keys.len(), "Generator listeners installed");
    }

    /// Recompute generated attributes of the objects a flush writes.
    pub fn generate(&self, ctx: &FlushContext<'_>) -> Result<usize> {
        let generated = self.generated();
        if generated.is_empty() {
            return Ok(0);
        }
        let is_deleted = |o: &ObjectRef| ctx.is_deleted(o);
        let mut done: HashSet<(usize, ObjectRef)> = HashSet::new();
        let mut changed = 0;

        for obj in ctx.new_objects().iter().chain(ctx.dirty_objects()) {
            if ctx.is_deleted(obj) {
                continue;
            }
            for g in generated.iter().filter(|g| g.applies_to(obj)) {
                if done.insert((g.id, obj.clone())) && g.apply(obj, &is_deleted)? {
                    changed += 1;
                }
            }
        }

        let owners: Vec<(Arc<GeneratedAttribute>, ObjectRef)> = {
            let state = self.read();
            let mut out = Vec::new();
            for obj in ctx.changed() {
                for watch in state.index.lookup(obj.mapper()) {
                    for owner in reachable_with_history(&obj, watch.inverse.steps()) {
                        out.push((Arc::clone(&watch.generated), owner));
                    }
                }
            }
            out
        };
        for (g, owner) in owners {
            if ctx.is_deleted(&owner) || !g.applies_to(&owner) {
                continue;
            }
            if done.insert((g.id, owner.clone())) && g.apply(&owner, &is_deleted)? {
                changed += 1;
            }
        }

        if changed > 0 {
            tracing::debug!(changed, "Generated attributes updated");
        }
        Ok(changed)
    }
}

fn resolve_copy(
    registry: &Registry,
    mapper: &Mapper,
    target: &str,
    source: &str,
) -> Result<Source> {
    let class = mapper.name();
    let full = Path::new(source)?;
    let (Some(column), true) = (full.last(), full.len() >= 2) else {
        return Err(Error::config(
            class,
            target,
            format!("copy source '{source}' must name a relationship path and a column"),
        ));
    };
    let column = column.to_string();
    let path = AttrPath::from_path(registry, class, full.slice(..full.len() - 1))?;
    if path.leaf().column(&column).is_none() {
        return Err(Error::config(
            class,
            target,
            format!("unknown source: '{}' has no column '{column}'", path.leaf().name()),
        ));
    }
    if path.is_many() {
        return Err(Error::config(
            class,
            target,
            format!("copy source '{source}' can reach more than one object"),
        ));
    }
    path.inverse()?;
    Ok(Source::Copy { path, column })
}

/// Graph node for `attribute` of `mapper`, named after the class declaring it.
fn node(mapper: &Mapper, attribute: &str) -> String {
    let declaring = mapper
        .ancestry()
        .into_iter()
        .find(|m| m.local_columns().iter().any(|c| c.name == attribute))
        .unwrap_or(mapper);
    format!("{}.{attribute}", declaring.name())
}

fn find_cycle(edges: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, BTreeSet<String>>,
        stack: &mut Vec<&'a str>,
        finished: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(start) = stack.iter().position(|n| *n == node) {
            let mut chain: Vec<String> = stack[start..].iter().map(|n| (*n).to_string()).collect();
            chain.push(node.to_string());
            return Some(chain);
        }
        if finished.contains(node) {
            return None;
        }
        stack.push(node);
        for next in edges.get(node).into_iter().flatten() {
            if let Some(chain) = visit(next, edges, stack, finished) {
                return Some(chain);
            }
        }
        stack.pop();
        finished.insert(node);
        None
    }

    let mut finished = HashSet::new();
    for start in edges.keys() {
        let mut stack = Vec::new();
        if let Some(chain) = visit(start, edges, &mut stack, &mut finished) {
            return Some(chain);
        }
    }
    None
}

/// Listener recomputing `generated` for the owners reached from the changed
/// object through `inverse` (the changed object itself when `inverse` is empty).
fn recompute_listener(
    generated: Arc<GeneratedAttribute>,
    inverse: Option<AttrPath>,
) -> Arc<dyn AttributeListener> {
    Arc::new(
        move |obj: &ObjectRef, attribute: &str, _change: &AttributeChange| -> Result<()> {
            let Some(inverse) = &inverse else {
                return Ok(());
            };
            let owners = if inverse.is_empty() {
                vec![obj.clone()]
            } else {
                getdotattr_filtered(obj, inverse.path(), |o| !o.is_deleted())?.into_vec()
            };
            for owner in owners {
                if generated.applies_to(&owner) && !owner.is_deleted() {
                    tracing::trace!(
                        object = ?obj,
                        attribute,
                        target = generated.target.as_str(),
                        "Recomputing generated attribute"
                    );
                    generated.apply(&owner, &|o: &ObjectRef| o.is_deleted())?;
                }
            }
            Ok(())
        },
    )
}

impl ConfigureListener for GeneratedRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn mapper_configured(&self, registry: &Registry, mapper: &Arc<Mapper>) -> Result<()> {
        self.register(registry, mapper)
    }

    fn after_configured(&self, _registry: &Arc<Registry>) -> Result<()> {
        self.check_dependencies()?;
        self.install_listeners();
        Ok(())
    }
}

impl FlushListener for GeneratedRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn phase(&self) -> FlushPhase {
        FlushPhase::Generate
    }

    fn before_flush(&self, ctx: &FlushContext<'_>) -> Result<()> {
        self.generate(ctx).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::{DeclareExt, Generator};
    use sqlmodel_derived_core::{FieldInfo, MapperBuilder, RegistryBuilder, RelationshipInfo, SqlType};

    fn document() -> MapperBuilder {
        Mapper::builder("Document", "documents")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("locale", SqlType::Text))
            .relationship(
                RelationshipInfo::one_to_many("sections", "Section", "document_id")
                    .back_populates("document"),
            )
    }

    fn section() -> MapperBuilder {
        Mapper::builder("Section", "sections")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("document_id", SqlType::BigInt))
            .column(FieldInfo::new("locale", SqlType::Text))
            .column(FieldInfo::new("title", SqlType::Text))
            .column(FieldInfo::new("heading", SqlType::Text))
            .relationship(
                RelationshipInfo::many_to_one("document", "Document", "document_id")
                    .back_populates("sections"),
            )
    }

    fn configure(section: MapperBuilder) -> (Arc<GeneratedRegistry>, Result<Arc<Registry>>) {
        let generated = Arc::new(GeneratedRegistry::new());
        let mut builder = RegistryBuilder::new().mapper(document()).mapper(section);
        builder.listen(generated.clone());
        (generated, builder.configure())
    }

    #[test]
    fn copy_generators_follow_relationship_and_column_changes() {
        let (generated, registry) =
            configure(section().generates("locale", Generator::copy("document.locale")));
        let registry = registry.unwrap();
        assert_eq!(generated.len(), 1);
        assert_eq!(generated.listener_count(), 2);

        let d = registry.create("Document").unwrap();
        d.set("locale", "fi").unwrap();
        let s = registry.create("Section").unwrap();
        s.set_related("document", Some(&d)).unwrap();
        assert_eq!(s.get("locale"), Value::Text("fi".into()));

        d.set("locale", "sv").unwrap();
        assert_eq!(s.get("locale"), Value::Text("sv".into()));

        s.set_related("document", None).unwrap();
        assert_eq!(s.get("locale"), Value::Null);

        generated.clear();
        assert_eq!(generated.listener_count(), 0);
        assert_eq!(registry.mapper("Document").unwrap().listener_count(), 0);
        d.set("locale", "en").unwrap();
        s.set_related("document", Some(&d)).unwrap();
        assert_eq!(s.get("locale"), Value::Null);
    }

    #[test]
    fn required_sources_raise_data_errors() {
        let (generated, registry) = configure(
            section().generates("locale", Generator::copy("document.locale").required()),
        );
        let registry = registry.unwrap();
        let s = registry.create("Section").unwrap();
        let g = &generated.generated()[0];
        let err = g.evaluate(&s, &|_| false).unwrap_err();
        assert!(matches!(err, Error::Data(e) if e.attribute == "locale" && e.path == "document"));
    }

    #[test]
    fn invalid_generators_fail_configuration() {
        let (_, registry) = configure(section().generates("missing", Generator::row(|_| Ok(Value::Null))));
        assert!(matches!(registry, Err(Error::Config(_))));

        let (_, registry) = configure(section().generates("locale", Generator::copy("document.nothing")));
        assert!(matches!(registry, Err(Error::Config(_))));

        let (_, registry) = configure(section().generates("locale", Generator::copy("locale")));
        assert!(matches!(registry, Err(Error::Config(_))));

        let (_, registry) = configure(
            section().generates("locale", Generator::related("", |_, _| Ok(Value::Null))),
        );
        assert!(matches!(registry, Err(Error::Config(_))));

        let (_, registry) = configure(
            section().generates("locale", Generator::related("owner", |_, _| Ok(Value::Null))),
        );
        assert!(matches!(registry, Err(Error::Path(_))));
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let (_, registry) = configure(
            section()
                .generates(
                    "title",
                    Generator::row(|s| Ok(s.get("heading"))).depends_on(["heading"]),
                )
                .generates(
                    "heading",
                    Generator::row(|s| Ok(s.get("title"))).depends_on(["title"]),
                ),
        );
        let Err(Error::Dependency(e)) = registry else {
            panic!("expected a dependency error");
        };
        assert_eq!(e.chain.first(), e.chain.last());
        assert!(e.chain.contains(&"Section.title".to_string()));
        assert!(e.chain.contains(&"Section.heading".to_string()));
    }

    #[test]
    fn chains_without_cycles_are_accepted() {
        let (generated, registry) = configure(
            section()
                .generates("locale", Generator::copy("document.locale"))
                .generates(
                    "title",
                    Generator::row(|s| Ok(s.get("locale"))).depends_on(["locale"]),
                ),
        );
        registry.unwrap();
        assert_eq!(generated.len(), 2);
    }
}
