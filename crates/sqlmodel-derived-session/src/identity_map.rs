//! Identity map: one live object per (base table, primary key).
//!
//! Objects of a joined-inheritance hierarchy share their base table's key
//! space, so a `Manager` and an `Employee` with the same id are the same row.

use sqlmodel_derived_core::{ObjectRef, Registry, Result, Value, hash_values};
use std::collections::HashMap;

/// Key of an object in the identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    table: String,
    pk_hash: u64,
}

impl ObjectKey {
    /// Key for primary key `pk` in the hierarchy whose base table is `table`.
    pub fn new(table: impl Into<String>, pk: &[Value]) -> Self {
        Self {
            table: table.into(),
            pk_hash: hash_values(pk),
        }
    }

    /// Key of `obj`, `None` until every primary key column is set.
    pub fn of(obj: &ObjectRef) -> Option<Self> {
        obj.has_identity()
            .then(|| Self::new(obj.mapper().base().table(), &obj.primary_key()))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pk_hash(&self) -> u64 {
        self.pk_hash
    }
}

#[derive(Debug, Default)]
pub struct IdentityMap {
    objects: HashMap<ObjectKey, ObjectRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `obj`. Returns `false` when it has no identity yet.
    pub fn insert(&mut self, obj: &ObjectRef) -> bool {
        let Some(key) = ObjectKey::of(obj) else {
            return false;
        };
        self.objects.insert(key, obj.clone());
        true
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ObjectRef> {
        self.objects.get(key)
    }

    /// The live object of `class` with primary key `pk`.
    pub fn lookup(&self, registry: &Registry, class: &str, pk: &[Value]) -> Result<Option<ObjectRef>> {
        let mapper = registry.mapper(class)?;
        let key = ObjectKey::new(mapper.base().table(), pk);
        Ok(self
            .objects
            .get(&key)
            .filter(|obj| obj.is_instance_of(class))
            .cloned())
    }

    /// The live object stored in `table` (base or subclass table) with `pk`.
    pub fn lookup_table(&self, registry: &Registry, table: &str, pk: &[Value]) -> Option<ObjectRef> {
        let mapper = registry.mapper_for_table(table)?;
        self.objects
            .get(&ObjectKey::new(mapper.base().table(), pk))
            .cloned()
    }

    pub fn contains(&self, obj: &ObjectRef) -> bool {
        ObjectKey::of(obj).is_some_and(|key| self.objects.get(&key) == Some(obj))
    }

    pub fn remove(&mut self, obj: &ObjectRef) -> bool {
        match ObjectKey::of(obj) {
            Some(key) if self.objects.get(&key) == Some(obj) => {
                self.objects.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.objects.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmodel_derived_core::{FieldInfo, Mapper, RegistryBuilder, SqlType};
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        RegistryBuilder::new()
            .mapper(
                Mapper::builder("Employee", "employees")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("name", SqlType::Text)),
            )
            .mapper(
                Mapper::builder("Manager", "managers")
                    .inherits("Employee")
                    .column(FieldInfo::new("reports", SqlType::BigInt)),
            )
            .configure()
            .unwrap()
    }

    #[test]
    fn objects_without_identity_are_not_stored() {
        let reg = registry();
        let mut map = IdentityMap::new();
        let e = reg.create("Employee").unwrap();
        assert!(!map.insert(&e));
        assert!(map.is_empty());
        e.set_committed("id", 4_i64);
        assert!(map.insert(&e));
        assert!(map.contains(&e));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn subclasses_share_the_base_key_space() {
        let reg = registry();
        let mut map = IdentityMap::new();
        let m = reg.create("Manager").unwrap();
        m.set_committed("id", 7_i64);
        map.insert(&m);

        let pk = [Value::BigInt(7)];
        assert_eq!(map.lookup(&reg, "Employee", &pk).unwrap(), Some(m.clone()));
        assert_eq!(map.lookup(&reg, "Manager", &pk).unwrap(), Some(m.clone()));
        assert_eq!(map.lookup_table(&reg, "managers", &pk), Some(m.clone()));
        assert!(map.lookup(&reg, "Nobody", &pk).is_err());

        assert!(map.remove(&m));
        assert!(!map.remove(&m));
    }
}
