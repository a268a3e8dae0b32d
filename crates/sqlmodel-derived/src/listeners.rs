//! Wiring derived attributes into mapper configuration and session flushes.

use crate::aggregates::AggregateRegistry;
use crate::config::DerivedConfig;
use crate::generates::GeneratedRegistry;
use crate::observes::ObserverRegistry;
use sqlmodel_derived_core::{ConfigureListener, Registry, RegistryBuilder, Result};
use sqlmodel_derived_session::{FlushListener, ListenerHandle, SessionFactory};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Aggregated, generated and observed attributes of one mapper registry.
///
/// [`attach`](Self::attach) hooks the declarations into mapper configuration;
/// [`install`](Self::install) hooks the computed updates into every session a
/// factory creates. Both are idempotent. [`reset`](Self::reset) undoes both.
///
/// ```ignore
/// let derived = DerivedAttributes::new();
/// let registry = derived.configure(builder)?;
/// let factory = SessionFactory::new(registry);
/// derived.install(&factory);
/// ```
#[derive(Debug)]
pub struct DerivedAttributes {
    config: DerivedConfig,
    aggregates: Arc<AggregateRegistry>,
    generators: Arc<GeneratedRegistry>,
    observers: Arc<ObserverRegistry>,
    /// Factories the flush listeners are installed on.
    installed: Mutex<Vec<ListenerHandle>>,
}

impl Default for DerivedAttributes {
    fn default() -> Self {
        Self::with_config(DerivedConfig::default())
    }
}

impl DerivedAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DerivedConfig) -> Self {
        Self {
            aggregates: Arc::new(AggregateRegistry::new(config.clone())),
            generators: Arc::new(GeneratedRegistry::new()),
            observers: Arc::new(ObserverRegistry::new()),
            installed: Mutex::default(),
            config,
        }
    }

    pub fn config(&self) -> &DerivedConfig {
        &self.config
    }

    pub fn aggregates(&self) -> &Arc<AggregateRegistry> {
        &self.aggregates
    }

    pub fn generators(&self) -> &Arc<GeneratedRegistry> {
        &self.generators
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    fn configure_listeners(&self) -> [Arc<dyn ConfigureListener>; 3] {
        [
            Arc::clone(&self.aggregates) as Arc<dyn ConfigureListener>,
            Arc::clone(&self.generators) as Arc<dyn ConfigureListener>,
            Arc::clone(&self.observers) as Arc<dyn ConfigureListener>,
        ]
    }

    fn flush_listeners(&self) -> [Arc<dyn FlushListener>; 3] {
        [
            Arc::clone(&self.generators) as Arc<dyn FlushListener>,
            Arc::clone(&self.observers) as Arc<dyn FlushListener>,
            Arc::clone(&self.aggregates) as Arc<dyn FlushListener>,
        ]
    }

    /// Register the configuration listeners. Returns `false` when all of them
    /// were already registered.
    pub fn attach(&self, builder: &mut RegistryBuilder) -> bool {
        let mut attached = false;
        for listener in self.configure_listeners() {
            attached |= builder.listen(listener);
        }
        tracing::debug!(attached, "Derived attribute configuration listeners");
        attached
    }

    /// [`attach`](Self::attach) and configure the registry.
    pub fn configure(&self, mut builder: RegistryBuilder) -> Result<Arc<Registry>> {
        self.attach(&mut builder);
        let registry = builder.configure()?;
        tracing::info!(
            aggregates = self.aggregates.len(),
            generators = self.generators.len(),
            observers = self.observers.len(),
            "Derived attributes configured"
        );
        Ok(registry)
    }

    /// Install the flush listeners on `factory`. Returns `false` when all of
    /// them were already installed.
    pub fn install(&self, factory: &SessionFactory) -> bool {
        let mut installed = false;
        for listener in self.flush_listeners() {
            installed |= factory.listen(listener);
        }
        let handle = factory.listener_handle();
        let mut factories = self.factories();
        factories.retain(ListenerHandle::is_alive);
        if !factories.iter().any(|h| h.same_factory(&handle)) {
            factories.push(handle);
        }
        installed
    }

    /// Remove the flush listeners from `factory`.
    pub fn uninstall(&self, factory: &SessionFactory) -> bool {
        let handle = factory.listener_handle();
        self.factories().retain(|h| !h.same_factory(&handle));
        unlisten_all(&handle)
    }

    /// Number of live factories the flush listeners are installed on.
    pub fn installed_count(&self) -> usize {
        self.factories().iter().filter(|h| h.is_alive()).count()
    }

    fn factories(&self) -> MutexGuard<'_, Vec<ListenerHandle>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every listener: flush listeners from the factories they were
    /// installed on and attribute listeners from mappers. Every declaration
    /// is forgotten, so a registry configured afterwards starts empty.
    ///
    /// Sessions created before the reset keep their listeners, which no
    /// longer have anything to compute.
    pub fn reset(&self) {
        let factories: Vec<_> = self.factories().drain(..).collect();
        for handle in &factories {
            unlisten_all(handle);
        }
        self.aggregates.clear();
        self.generators.clear();
        self.observers.clear();
        tracing::debug!(factories = factories.len(), "Derived attributes reset");
    }
}

fn unlisten_all(handle: &ListenerHandle) -> bool {
    let mut removed = false;
    for name in [
        AggregateRegistry::NAME,
        GeneratedRegistry::NAME,
        ObserverRegistry::NAME,
    ] {
        removed |= handle.unlisten(name);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::{AggregateExpr, DeclareExt, Generator};
    use sqlmodel_derived_core::{FieldInfo, Mapper, RelationshipInfo, SqlType, Value};

    fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
            .mapper(
                Mapper::builder("Thread", "threads")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("comment_count", SqlType::BigInt).default_value(0_i64))
                    .column(FieldInfo::new("title", SqlType::Text))
                    .column(FieldInfo::new("slug", SqlType::Text))
                    .relationship(
                        RelationshipInfo::one_to_many("comments", "Comment", "thread_id")
                            .back_populates("thread"),
                    )
                    .aggregated("comment_count", "comments", AggregateExpr::count())
                    .generates(
                        "slug",
                        Generator::row(|t| Ok(t.get("title"))).depends_on(["title"]),
                    )
                    .observes("comments", |_, _| Ok(())),
            )
            .mapper(
                Mapper::builder("Comment", "comments")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("thread_id", SqlType::BigInt))
                    .column(FieldInfo::new("thread_title", SqlType::Text))
                    .relationship(
                        RelationshipInfo::many_to_one("thread", "Thread", "thread_id")
                            .back_populates("comments"),
                    )
                    .generates("thread_title", Generator::copy("thread.title")),
            )
    }

    #[test]
    fn attach_and_install_are_idempotent() {
        let derived = DerivedAttributes::new();
        let mut b = builder();
        assert!(derived.attach(&mut b));
        assert!(!derived.attach(&mut b));
        let registry = b.configure().unwrap();
        assert_eq!(derived.aggregates().len(), 1);
        assert_eq!(derived.generators().len(), 2);
        assert_eq!(derived.observers().len(), 1);

        let factory = SessionFactory::new(registry);
        assert!(derived.install(&factory));
        assert!(!derived.install(&factory));
        assert_eq!(
            factory.listener_names(),
            vec![
                GeneratedRegistry::NAME.to_string(),
                ObserverRegistry::NAME.to_string(),
                AggregateRegistry::NAME.to_string(),
            ]
        );
        assert!(derived.uninstall(&factory));
        assert!(factory.listener_names().is_empty());
    }

    #[test]
    fn reset_removes_attribute_listeners() {
        let derived = DerivedAttributes::new();
        let registry = derived.configure(builder()).unwrap();
        let thread = registry.mapper("Thread").unwrap();
        assert_eq!(thread.listener_count(), 1);

        let t = registry.create("Thread").unwrap();
        let c = registry.create("Comment").unwrap();
        t.set("title", "hello").unwrap();
        c.set_related("thread", Some(&t)).unwrap();
        assert_eq!(c.get("thread_title"), Value::Text("hello".into()));

        derived.reset();
        assert!(derived.aggregates().is_empty());
        assert!(derived.generators().is_empty());
        assert!(derived.observers().is_empty());
        assert_eq!(thread.listener_count(), 0);
        t.set("title", "changed").unwrap();
        assert_eq!(c.get("thread_title"), Value::Text("hello".into()));
    }

    #[test]
    fn reset_removes_flush_listeners_from_every_factory() {
        let derived = DerivedAttributes::new();
        let registry = derived.configure(builder()).unwrap();
        let first = SessionFactory::new(Arc::clone(&registry));
        let second = SessionFactory::new(Arc::clone(&registry));
        derived.install(&first);
        derived.install(&first);
        derived.install(&second);
        assert_eq!(derived.installed_count(), 2);

        {
            let dropped = SessionFactory::new(Arc::clone(&registry));
            derived.install(&dropped);
        }
        assert_eq!(derived.installed_count(), 2);

        derived.reset();
        assert_eq!(derived.installed_count(), 0);
        assert!(first.listener_names().is_empty());
        assert!(second.listener_names().is_empty());
        assert!(!derived.uninstall(&first));
    }
}
