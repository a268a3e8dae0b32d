//! End-to-end flushes keeping aggregated, generated and observed attributes
//! in sync.

mod common;

use common::{Harness, catalog_tree, counted_catalog_tree, run, unwrap_outcome};
use regex::Regex;
use sqlmodel_derived::prelude::*;
use sqlmodel_derived::MapperBuilder;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

fn forum() -> RegistryBuilder {
    RegistryBuilder::new()
        .mapper(
            Mapper::builder("Thread", "threads")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("comment_count", SqlType::BigInt).default_value(0_i64))
                .relationship(
                    RelationshipInfo::one_to_many("comments", "Comment", "thread_id")
                        .back_populates("thread"),
                )
                .aggregated("comment_count", "comments", AggregateExpr::count()),
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
}

#[test]
fn comment_count_follows_inserts_and_deletes() {
    let h = Harness::new(forum());
    let reg = h.registry();
    let mut session = h.session();
    let cx = Cx::for_testing();

    let t = reg.create("Thread").unwrap();
    let c1 = reg.create("Comment").unwrap();
    let c2 = reg.create("Comment").unwrap();
    c1.set_related("thread", Some(&t)).unwrap();
    c2.set_related("thread", Some(&t)).unwrap();
    session.add(&t);

    let result = unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(result.inserted, 3);
    assert_eq!(result.derived, 1);
    assert_eq!(t.get("comment_count"), Value::BigInt(2));
    assert!(!t.is_modified());
    let rows = h.db.rows("threads").unwrap();
    assert_eq!(rows[0].get_by_name("comment_count"), Some(&Value::BigInt(2)));

    session.delete(&c1);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(t.get("comment_count"), Value::BigInt(1));
    assert_eq!(t.collection("comments"), vec![c2.clone()]);

    // Nothing changed, nothing derived.
    h.db.clear_log();
    let idle = unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(idle.derived, 0);
    assert!(h.db.executed().is_empty());
}

#[test]
fn net_worth_sums_leaf_prices() {
    let builder = RegistryBuilder::new()
        .mapper(
            Mapper::builder("Catalog", "catalogs")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("net_worth", SqlType::BigInt).default_value(0_i64))
                .relationship(
                    RelationshipInfo::one_to_many("products", "Product", "catalog_id")
                        .back_populates("catalog"),
                )
                .aggregated(
                    "net_worth",
                    "products",
                    AggregateExpr::expr(Expr::qualified("products", "price").sum()),
                ),
        )
        .mapper(
            Mapper::builder("Product", "products")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("catalog_id", SqlType::BigInt))
                .column(FieldInfo::new("price", SqlType::BigInt))
                .relationship(
                    RelationshipInfo::many_to_one("catalog", "Catalog", "catalog_id")
                        .back_populates("products"),
                ),
        );
    let h = Harness::new(builder);
    let reg = h.registry();
    let mut session = h.session();
    let cx = Cx::for_testing();

    let cat = reg.create("Catalog").unwrap();
    let p1 = reg.create("Product").unwrap();
    let p2 = reg.create("Product").unwrap();
    p1.set("price", 10_i64).unwrap();
    p2.set("price", 15_i64).unwrap();
    p1.set_related("catalog", Some(&cat)).unwrap();
    p2.set_related("catalog", Some(&cat)).unwrap();
    session.add(&cat);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(cat.get("net_worth"), Value::BigInt(25));

    p1.set("price", 20_i64).unwrap();
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(cat.get("net_worth"), Value::BigInt(35));

    // A catalog without products falls back to the column default.
    let empty = reg.create("Catalog").unwrap();
    empty.set("net_worth", 99_i64).unwrap();
    session.add(&empty);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(empty.get("net_worth"), Value::BigInt(0));
}

#[test]
fn deep_aggregate_counts_through_every_level() {
    let h = Harness::new(counted_catalog_tree());
    let reg = h.registry();
    let mut session = h.session();
    let cx = Cx::for_testing();

    let catalog = reg.create("Catalog").unwrap();
    let category = reg.create("Category").unwrap();
    let sub = reg.create("SubCategory").unwrap();
    let p1 = reg.create("Product").unwrap();
    catalog.append("categories", &category).unwrap();
    category.append("sub_categories", &sub).unwrap();
    sub.append("products", &p1).unwrap();
    session.add(&catalog);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(catalog.get("product_count"), Value::BigInt(1));

    let p2 = reg.create("Product").unwrap();
    p2.set_related("sub_category", Some(&sub)).unwrap();
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(catalog.get("product_count"), Value::BigInt(2));
    assert!(session.contains(&p2));

    session.delete(&sub);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(catalog.get("product_count"), Value::BigInt(0));
    assert_eq!(p1.related("sub_category"), None);
    assert_eq!(h.db.row_count("products"), 2);
}

#[test]
fn slug_is_generated_from_the_name() {
    let builder = RegistryBuilder::new().mapper(
        Mapper::builder("Article", "articles")
            .column(FieldInfo::id("id"))
            .column(FieldInfo::new("name", SqlType::Text))
            .column(FieldInfo::new("slug", SqlType::Text))
            .generates(
                "slug",
                Generator::row(|article| {
                    Ok(match article.get("name") {
                        Value::Text(name) => {
                            Value::Text(WHITESPACE.replace_all(&name.to_lowercase(), "-").into_owned())
                        }
                        _ => Value::Null,
                    })
                })
                .depends_on(["name"]),
            ),
    );
    let h = Harness::new(builder);
    let mut session = h.session();
    let cx = Cx::for_testing();

    let a = h.registry().create("Article").unwrap();
    a.set("name", "Hello World").unwrap();
    session.add(&a);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(a.get("slug"), Value::Text("hello-world".into()));
    let rows = h.db.rows("articles").unwrap();
    assert_eq!(rows[0].get_by_name("slug"), Some(&Value::Text("hello-world".into())));

    a.set("name", "Second  Draft").unwrap();
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(a.get("slug"), Value::Text("second-draft".into()));
}

fn documents(section: impl FnOnce(MapperBuilder) -> MapperBuilder) -> RegistryBuilder {
    RegistryBuilder::new()
        .mapper(
            Mapper::builder("Document", "documents")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("locale", SqlType::Text))
                .relationship(
                    RelationshipInfo::one_to_many("sections", "Section", "document_id")
                        .back_populates("document"),
                ),
        )
        .mapper(section(
            Mapper::builder("Section", "sections")
                .column(FieldInfo::id("id"))
                .column(FieldInfo::new("document_id", SqlType::BigInt))
                .column(FieldInfo::new("locale", SqlType::Text))
                .relationship(
                    RelationshipInfo::many_to_one("document", "Document", "document_id")
                        .back_populates("sections"),
                ),
        ))
}

fn copies_locale(builder: RegistryBuilder) {
    let h = Harness::new(builder);
    let reg = h.registry();
    let mut session = h.session();
    let cx = Cx::for_testing();

    let d = reg.create("Document").unwrap();
    d.set("locale", "fi").unwrap();
    let s = reg.create("Section").unwrap();
    s.set_related("document", Some(&d)).unwrap();
    session.add(&s);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(s.get("locale"), Value::Text("fi".into()));

    d.set("locale", "sv").unwrap();
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(s.get("locale"), Value::Text("sv".into()));
    let rows = h.db.rows("sections").unwrap();
    assert_eq!(rows[0].get_by_name("locale"), Some(&Value::Text("sv".into())));
}

#[test]
fn locale_is_copied_across_the_relationship() {
    copies_locale(documents(|section| {
        section.generates("locale", Generator::copy("document.locale"))
    }));
}

#[test]
fn locale_is_computed_from_the_related_document() {
    copies_locale(documents(|section| {
        section.generates(
            "locale",
            Generator::related("document", |_, document| {
                Ok(document.as_one().map_or(Value::Null, |d| d.get("locale")))
            })
            .depends_on(["locale"]),
        )
    }));
}

#[test]
fn observer_runs_once_per_flush_with_current_products() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
    let builder = {
        let calls = Arc::clone(&calls);
        let seen = Arc::clone(&seen);
        catalog_tree(move |catalog| {
            catalog.observes("categories.sub_categories.products", move |catalog, products| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(products.len());
                catalog.set("product_count", i64::try_from(products.len()).unwrap_or(i64::MAX))
            })
        })
    };
    let h = Harness::new(builder);
    let reg = h.registry();
    let mut session = h.session();
    let cx = Cx::for_testing();

    let catalog = reg.create("Catalog").unwrap();
    let category = reg.create("Category").unwrap();
    let sub = reg.create("SubCategory").unwrap();
    let p1 = reg.create("Product").unwrap();
    catalog.append("categories", &category).unwrap();
    category.append("sub_categories", &sub).unwrap();
    sub.append("products", &p1).unwrap();
    session.add(&catalog);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.get("product_count"), Value::BigInt(1));

    let p2 = reg.create("Product").unwrap();
    sub.append("products", &p2).unwrap();
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(catalog.get("product_count"), Value::BigInt(2));

    session.delete(&p1);
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(catalog.get("product_count"), Value::BigInt(1));

    // The callback's own write does not retrigger it.
    unwrap_outcome(run(session.flush(&cx)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1]);
}
