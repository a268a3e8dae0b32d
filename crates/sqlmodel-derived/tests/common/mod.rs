//! Shared fixtures for sqlmodel-derived integration tests.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use sqlmodel_derived::{
    AggregateExpr, DeclareExt, DerivedAttributes, Error, FieldInfo, Mapper, MapperBuilder,
    MemoryDatabase, Outcome, Registry, RegistryBuilder, RelationshipInfo, Session, SessionFactory,
    SqlType,
};
use std::future::Future;
use std::sync::Arc;

pub type TestSession = Session<Arc<MemoryDatabase>>;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn run<F: Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

/// A configured registry with derived attributes installed on a factory.
pub struct Harness {
    pub derived: DerivedAttributes,
    pub factory: SessionFactory,
    pub db: Arc<MemoryDatabase>,
}

impl Harness {
    pub fn new(builder: RegistryBuilder) -> Self {
        Self::with(DerivedAttributes::new(), builder)
    }

    pub fn with(derived: DerivedAttributes, builder: RegistryBuilder) -> Self {
        let registry = derived
            .configure(builder)
            .expect("configure registry");
        let factory = SessionFactory::new(registry);
        derived.install(&factory);
        let db = Arc::new(MemoryDatabase::from_registry(factory.registry()));
        Self {
            derived,
            factory,
            db,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.factory.registry()
    }

    pub fn session(&self) -> TestSession {
        self.factory.session(Arc::clone(&self.db))
    }
}

/// Catalog ──< Category ──< SubCategory ──< Product, every link with a
/// back-reference. `catalog` customizes the root mapper.
pub fn catalog_tree(catalog: impl FnOnce(MapperBuilder) -> MapperBuilder) -> RegistryBuilder {
    RegistryBuilder::new()
        .mapper(catalog(
            Mapper::builder("Catalog", "catalogs")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("name", SqlType::Text))
                .column(FieldInfo::new("product_count", SqlType::BigInt).default_value(0_i64))
                .relationship(
                    RelationshipInfo::one_to_many("categories", "Category", "catalog_id")
                        .back_populates("catalog"),
                ),
        ))
        .mapper(
            Mapper::builder("Category", "categories")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("catalog_id", SqlType::BigInt))
                .relationship(
                    RelationshipInfo::many_to_one("catalog", "Catalog", "catalog_id")
                        .back_populates("categories"),
                )
                .relationship(
                    RelationshipInfo::one_to_many("sub_categories", "SubCategory", "category_id")
                        .back_populates("category"),
                ),
        )
        .mapper(
            Mapper::builder("SubCategory", "sub_categories")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("category_id", SqlType::BigInt))
                .relationship(
                    RelationshipInfo::many_to_one("category", "Category", "category_id")
                        .back_populates("sub_categories"),
                )
                .relationship(
                    RelationshipInfo::one_to_many("products", "Product", "sub_category_id")
                        .back_populates("sub_category"),
                ),
        )
        .mapper(
            Mapper::builder("Product", "products")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("sub_category_id", SqlType::BigInt))
                .column(FieldInfo::new("price", SqlType::BigInt))
                .relationship(
                    RelationshipInfo::many_to_one("sub_category", "SubCategory", "sub_category_id")
                        .back_populates("products"),
                ),
        )
}

/// The tree with `Catalog.product_count` aggregated over every product.
pub fn counted_catalog_tree() -> RegistryBuilder {
    catalog_tree(|catalog| {
        catalog.aggregated(
            "product_count",
            "categories.sub_categories.products",
            AggregateExpr::count(),
        )
    })
}
