//! Flush listeners.
//!
//! A [`FlushListener`] is installed on a [`SessionFactory`](crate::SessionFactory)
//! and runs inside every flush of the sessions it creates. Listeners run in
//! [`FlushPhase`] order: generated values first, then observers (both before
//! any SQL is emitted), and aggregates last, once the rows they count exist.

use sqlmodel_derived_core::{ObjectRef, Registry, Result};
use sqlmodel_derived_query::Statement;
use std::collections::HashSet;
use std::sync::Arc;

/// When in a flush a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlushPhase {
    /// Before SQL: recompute generated columns.
    Generate,
    /// Before SQL, after generators: notify observers.
    Observe,
    /// After INSERT/UPDATE/DELETE: emit UPDATEs for aggregated columns.
    Aggregate,
}

impl FlushPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            FlushPhase::Generate => "generate",
            FlushPhase::Observe => "observe",
            FlushPhase::Aggregate => "aggregate",
        }
    }
}

/// The objects a flush is writing.
#[derive(Debug)]
pub struct FlushContext<'a> {
    registry: &'a Arc<Registry>,
    new: &'a [ObjectRef],
    dirty: &'a [ObjectRef],
    deleted: &'a [ObjectRef],
}

impl<'a> FlushContext<'a> {
    pub fn new(
        registry: &'a Arc<Registry>,
        new: &'a [ObjectRef],
        dirty: &'a [ObjectRef],
        deleted: &'a [ObjectRef],
    ) -> Self {
        Self {
            registry,
            new,
            dirty,
            deleted,
        }
    }

    pub fn registry(&self) -> &'a Arc<Registry> {
        self.registry
    }

    /// Objects being inserted.
    pub fn new_objects(&self) -> &'a [ObjectRef] {
        self.new
    }

    /// Persistent objects with modified columns or relationships.
    pub fn dirty_objects(&self) -> &'a [ObjectRef] {
        self.dirty
    }

    /// Objects being deleted.
    pub fn deleted_objects(&self) -> &'a [ObjectRef] {
        self.deleted
    }

    /// New, dirty and deleted objects, each once.
    pub fn changed(&self) -> Vec<ObjectRef> {
        let mut seen = HashSet::new();
        self.new
            .iter()
            .chain(self.dirty)
            .chain(self.deleted)
            .filter(|obj| seen.insert((*obj).clone()))
            .cloned()
            .collect()
    }

    pub fn is_new(&self, obj: &ObjectRef) -> bool {
        self.new.contains(obj)
    }

    pub fn is_deleted(&self, obj: &ObjectRef) -> bool {
        obj.is_deleted() || self.deleted.contains(obj)
    }
}

/// Hooks run by every flush of a session.
pub trait FlushListener: Send + Sync {
    /// Unique name; a factory installs at most one listener per name.
    fn name(&self) -> &str;

    fn phase(&self) -> FlushPhase;

    /// Runs before any SQL is emitted. May modify objects.
    fn before_flush(&self, _ctx: &FlushContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs after INSERT/UPDATE/DELETE, while relationship history is still
    /// available. Returned statements are executed by the session.
    fn after_flush(&self, _ctx: &FlushContext<'_>) -> Result<Vec<Statement>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmodel_derived_core::{FieldInfo, Mapper, RegistryBuilder};

    #[test]
    fn phases_order_generators_first() {
        let mut phases = vec![FlushPhase::Aggregate, FlushPhase::Generate, FlushPhase::Observe];
        phases.sort();
        assert_eq!(
            phases,
            vec![FlushPhase::Generate, FlushPhase::Observe, FlushPhase::Aggregate]
        );
        assert_eq!(FlushPhase::Observe.as_str(), "observe");
    }

    #[test]
    fn changed_deduplicates() {
        let registry = RegistryBuilder::new()
            .mapper(Mapper::builder("Tag", "tags").column(FieldInfo::id("id")))
            .configure()
            .unwrap();
        let a = registry.create("Tag").unwrap();
        let b = registry.create("Tag").unwrap();
        let new = vec![a.clone()];
        let dirty = vec![b.clone(), a.clone()];
        let deleted = vec![b.clone()];
        let ctx = FlushContext::new(&registry, &new, &dirty, &deleted);
        assert_eq!(ctx.changed(), vec![a.clone(), b.clone()]);
        assert!(ctx.is_new(&a));
        assert!(ctx.is_deleted(&b));
        assert!(!ctx.is_deleted(&a));
    }
}
