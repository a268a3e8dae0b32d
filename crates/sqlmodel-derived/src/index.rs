//! Entries looked up by the class of a changed object.

use sqlmodel_derived_core::{AttrPath, Mapper, Result};
use std::collections::HashMap;

/// Entries keyed by class name. Lookups also see entries of base classes.
#[derive(Debug)]
pub(crate) struct ClassIndex<T> {
    by_class: HashMap<String, Vec<T>>,
}

impl<T> Default for ClassIndex<T> {
    fn default() -> Self {
        Self {
            by_class: HashMap::new(),
        }
    }
}

impl<T> ClassIndex<T> {
    pub(crate) fn insert(&mut self, class: &str, entry: T) {
        self.by_class.entry(class.to_string()).or_default().push(entry);
    }

    /// Entries for `mapper` and then for each of its base classes.
    pub(crate) fn lookup<'a>(&'a self, mapper: &'a Mapper) -> impl Iterator<Item = &'a T> + 'a {
        mapper
            .ancestry()
            .into_iter()
            .filter_map(move |m| self.by_class.get(m.name()))
            .flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_class.values().map(Vec::len).sum()
    }

    pub(crate) fn watches(&self, class: &str) -> bool {
        self.by_class.contains_key(class)
    }

    pub(crate) fn clear(&mut self) {
        self.by_class.clear();
    }
}

/// For every class position of `path`, the path leading from that class back
/// to the root. Position 0 gets the empty path.
pub(crate) fn inverse_prefixes(path: &AttrPath) -> Vec<(usize, Result<AttrPath>)> {
    (0..=path.len())
        .map(|k| (k, path.slice(0..k).inverse()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmodel_derived_core::{FieldInfo, RegistryBuilder, RelationshipInfo, SqlType};

    #[test]
    fn lookup_includes_base_classes() {
        let registry = RegistryBuilder::new()
            .mapper(Mapper::builder("Employee", "employees").column(FieldInfo::id("id")))
            .mapper(
                Mapper::builder("Manager", "managers")
                    .inherits("Employee")
                    .column(FieldInfo::new("reports", SqlType::BigInt)),
            )
            .configure()
            .unwrap();

        let mut index = ClassIndex::default();
        index.insert("Employee", 1);
        index.insert("Manager", 2);
        index.insert("Manager", 3);
        let manager = registry.mapper("Manager").unwrap();
        assert_eq!(index.lookup(manager).copied().collect::<Vec<_>>(), vec![2, 3, 1]);
        let employee = registry.mapper("Employee").unwrap();
        assert_eq!(index.lookup(employee).copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(index.len(), 3);
        assert!(index.watches("Manager"));
        index.clear();
        assert!(!index.watches("Manager"));
    }

    #[test]
    fn prefixes_walk_back_to_the_root() {
        let registry = RegistryBuilder::new()
            .mapper(
                Mapper::builder("Catalog", "catalogs")
                    .column(FieldInfo::id("id"))
                    .relationship(
                        RelationshipInfo::one_to_many("categories", "Category", "catalog_id")
                            .back_populates("catalog"),
                    ),
            )
            .mapper(
                Mapper::builder("Category", "categories")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("catalog_id", SqlType::BigInt))
                    .relationship(
                        RelationshipInfo::many_to_one("catalog", "Catalog", "catalog_id")
                            .back_populates("categories"),
                    )
                    .relationship(RelationshipInfo::one_to_many(
                        "products",
                        "Product",
                        "category_id",
                    )),
            )
            .mapper(
                Mapper::builder("Product", "products")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("category_id", SqlType::BigInt)),
            )
            .configure()
            .unwrap();

        let path = AttrPath::new(&registry, "Catalog", "categories.products").unwrap();
        let prefixes = inverse_prefixes(&path);
        assert_eq!(prefixes.len(), 3);
        assert!(prefixes[0].1.as_ref().unwrap().is_empty());
        assert_eq!(prefixes[1].1.as_ref().unwrap().to_string(), "Category:catalog");
        assert!(prefixes[2].1.is_err());
    }
}
