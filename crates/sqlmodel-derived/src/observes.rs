//! Path observers.
//!
//! An observer watches every object on a relation path from its owner. When
//! any of them is written by a flush, the owners reached by walking the path
//! backwards are collected and each callback runs once per owner with the
//! leaves the path currently reaches. Callbacks run before the flush emits SQL
//! and may modify objects.

use crate::declarative::{Declaration, Declarations, ObserverFn};
use crate::index::{ClassIndex, inverse_prefixes};
use sqlmodel_derived_core::{
    AttrPath, ConfigureListener, Dotted, Mapper, ObjectRef, Registry, Result, getdotattr,
    getdotattr_filtered,
};
use sqlmodel_derived_session::{FlushContext, FlushListener, FlushPhase};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A resolved observer.
pub struct Observer {
    id: usize,
    owner: Arc<Mapper>,
    path: AttrPath,
    callback: ObserverFn,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("path", &self.path.to_string())
            .finish_non_exhaustive()
    }
}

impl Observer {
    /// The class declaring the observer.
    pub fn owner(&self) -> &Arc<Mapper> {
        &self.owner
    }

    /// Relation path from the owner to the observed objects.
    pub fn path(&self) -> &AttrPath {
        &self.path
    }

    /// Run the callback for `root` with the leaves its path reaches.
    pub fn notify(&self, root: &ObjectRef, leaves: &Dotted) -> Result<()> {
        (self.callback)(root, leaves)
    }
}

struct Watch {
    observer: Arc<Observer>,
    inverse: AttrPath,
}

#[derive(Default)]
struct State {
    observers: Vec<Arc<Observer>>,
    index: ClassIndex<Watch>,
}

/// Observers of one mapper registry.
#[derive(Default)]
pub struct ObserverRegistry {
    state: RwLock<State>,
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.read().observers)
            .finish()
    }
}

impl ObserverRegistry {
    /// Flush listener name.
    pub const NAME: &'static str = "sqlmodel-derived.observes";

    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every registered observer, in declaration order.
    pub fn observers(&self) -> Vec<Arc<Observer>> {
        self.read().observers.clone()
    }

    pub fn len(&self) -> usize {
        self.read().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().observers.is_empty()
    }

    /// Whether changes to instances of `class` can notify an observer.
    pub fn watches(&self, class: &str) -> bool {
        self.read().index.watches(class)
    }

    /// Forget every observer.
    pub fn clear(&self) {
        let mut state = self.write();
        state.observers.clear();
        state.index.clear();
    }

    fn register(&self, registry: &Registry, mapper: &Arc<Mapper>) -> Result<()> {
        let mut state = self.write();
        for declaration in Declarations::of(mapper) {
            let Declaration::Observer { path, callback } = declaration else {
                continue;
            };
            let path = AttrPath::new(registry, mapper.name(), path)?;
            let observer = Arc::new(Observer {
                id: state.observers.len(),
                owner: Arc::clone(mapper),
                path,
                callback: Arc::clone(callback),
            });
            for (position, inverse) in inverse_prefixes(&observer.path) {
                state.index.insert(
                    observer.path.class_at(position).name(),
                    Watch {
                        observer: Arc::clone(&observer),
                        inverse: inverse?,
                    },
                );
            }
            tracing::debug!(path = %observer.path, "Observer registered");
            state.observers.push(observer);
        }
        Ok(())
    }

    /// Collect the roots affected by a flush, with the leaves to pass each one.
    ///
    /// Every observer appears at most once per root. When one root is reached
    /// through several changed objects, collection results are merged by
    /// identity in first-seen order.
    pub fn collect(&self, ctx: &FlushContext<'_>) -> Result<Vec<(Arc<Observer>, ObjectRef, Dotted)>> {
        let state = self.read();
        let mut order: Vec<(Arc<Observer>, ObjectRef)> = Vec::new();
        let mut pending: HashMap<(usize, ObjectRef), Dotted> = HashMap::new();

        for obj in ctx.changed() {
            for watch in state.index.lookup(obj.mapper()) {
                let roots = if watch.inverse.is_empty() {
                    vec![obj.clone()]
                } else {
                    getdotattr(&obj, watch.inverse.path())?.into_vec()
                };
                for root in roots {
                    let observer = &watch.observer;
                    if ctx.is_deleted(&root) || !root.is_instance_of(observer.owner.name()) {
                        continue;
                    }
                    let leaves =
                        getdotattr_filtered(&root, observer.path.path(), |o| !ctx.is_deleted(o))?;
                    let key = (observer.id, root.clone());
                    match pending.get_mut(&key) {
                        Some(existing) => merge(existing, leaves),
                        None => {
                            pending.insert(key, leaves);
                            order.push((Arc::clone(observer), root));
                        }
                    }
                }
            }
        }

        Ok(order
            .into_iter()
            .map(|(observer, root)| {
                let leaves = pending.remove(&(observer.id, root.clone())).unwrap_or_default();
                (observer, root, leaves)
            })
            .collect())
    }

    /// Invoke every affected observer once.
    pub fn notify(&self, ctx: &FlushContext<'_>) -> Result<usize> {
        let calls = self.collect(ctx)?;
        for (observer, root, leaves) in &calls {
            tracing::debug!(
                object = ?root,
                path = %observer.path,
                leaves = leaves.len(),
                "Notifying observer"
            );
            observer.notify(root, leaves)?;
        }
        Ok(calls.len())
    }
}

fn merge(existing: &mut Dotted, leaves: Dotted) {
    match (existing, leaves) {
        (Dotted::Many(items), Dotted::Many(more)) => {
            for leaf in more {
                if !items.contains(&leaf) {
                    items.push(leaf);
                }
            }
        }
        (existing, leaves) => *existing = leaves,
    }
}

impl ConfigureListener for ObserverRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn mapper_configured(&self, registry: &Registry, mapper: &Arc<Mapper>) -> Result<()> {
        self.register(registry, mapper)
    }
}

impl FlushListener for ObserverRegistry {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn phase(&self) -> FlushPhase {
        FlushPhase::Observe
    }

    fn before_flush(&self, ctx: &FlushContext<'_>) -> Result<()> {
        self.notify(ctx).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::DeclareExt;
    use sqlmodel_derived_core::{
        Error, FieldInfo, MapperBuilder, PathErrorKind, RegistryBuilder, RelationshipInfo, SqlType,
    };

    fn catalog(observed: &str) -> MapperBuilder {
        Mapper::builder("Catalog", "catalogs")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("product_count", SqlType::BigInt))
            .relationship(
                RelationshipInfo::one_to_many("categories", "Category", "catalog_id")
                    .back_populates("catalog"),
            )
            .observes(observed, |_, _| Ok(()))
    }

    fn category(back_reference: bool) -> MapperBuilder {
        let products = RelationshipInfo::one_to_many("products", "Product", "category_id");
        Mapper::builder("Category", "categories")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("catalog_id", SqlType::BigInt))
            .relationship(
                RelationshipInfo::many_to_one("catalog", "Catalog", "catalog_id")
                    .back_populates("categories"),
            )
            .relationship(if back_reference {
                products.back_populates("category")
            } else {
                products
            })
    }

    fn product() -> MapperBuilder {
        Mapper::builder("Product", "products")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("category_id", SqlType::BigInt))
            .relationship(
                RelationshipInfo::many_to_one("category", "Category", "category_id")
                    .back_populates("products"),
            )
    }

    fn configure(observed: &str, back_reference: bool) -> (Arc<ObserverRegistry>, Result<Arc<Registry>>) {
        let observers = Arc::new(ObserverRegistry::new());
        let mut builder = RegistryBuilder::new()
            .mapper(catalog(observed))
            .mapper(category(back_reference))
            .mapper(product());
        builder.listen(observers.clone());
        (observers, builder.configure())
    }

    #[test]
    fn every_class_on_the_path_is_watched() {
        let (observers, registry) = configure("categories.products", true);
        registry.unwrap();
        assert_eq!(observers.len(), 1);
        assert!(observers.watches("Catalog"));
        assert!(observers.watches("Category"));
        assert!(observers.watches("Product"));
        assert_eq!(observers.observers()[0].path().to_string(), "Catalog:categories.products");
    }

    #[test]
    fn missing_back_references_fail_configuration() {
        let (_, registry) = configure("categories.products", false);
        let Err(Error::Path(e)) = registry else {
            panic!("expected a path error");
        };
        assert_eq!(e.kind, PathErrorKind::MissingBackref);
        assert_eq!(e.segment.as_deref(), Some("products"));
    }

    #[test]
    fn collections_merge_by_identity() {
        let (_, registry) = configure("categories", true);
        let registry = registry.unwrap();
        let a = registry.create("Category").unwrap();
        let b = registry.create("Category").unwrap();
        let c = registry.create("Category").unwrap();

        let mut leaves = Dotted::Many(vec![a.clone(), b.clone()]);
        merge(&mut leaves, Dotted::Many(vec![b.clone(), c.clone()]));
        assert_eq!(leaves, Dotted::Many(vec![a.clone(), b, c.clone()]));

        let mut scalar = Dotted::One(a);
        merge(&mut scalar, Dotted::One(c.clone()));
        assert_eq!(scalar, Dotted::One(c));
    }
}
