mod common;

use std::{collections::HashSet, sync::Arc};

use bson::oid::ObjectId;
use parking_lot::Mutex;

use common::Fixture;
use docmapper::{memory::InMemoryStore, prelude::*};

#[tokio::test]
async fn batch_inserts_assign_identifiers() {
    let fixture = Fixture::new();
    let articles = (1..=10)
        .map(|n| {
            let article = fixture.create("Article");
            article.set("title", format!("Article {n}")).unwrap();
            article
        })
        .collect::<Vec<_>>();

    fixture.mapper.save("Article", &articles).await.unwrap();

    let ids = articles
        .iter()
        .map(|article| article.id().unwrap())
        .collect::<HashSet<_>>();
    assert_eq!(ids.len(), 10);
    assert!(articles.iter().all(|article| !article.is_modified()));
    assert_eq!(fixture.store.count("article").await, 10);

    let found = fixture
        .mapper
        .find("Article", FindOptions::new().sort("title", SortDirection::Asc))
        .await
        .unwrap()
        .unwrap()
        .into_documents();
    let titles = found
        .iter()
        .map(|article| article.value("title").unwrap().to_key())
        .collect::<Vec<_>>();

    let mut expected = (1..=10).map(|n| format!("Article {n}")).collect::<Vec<_>>();
    expected.sort();
    assert_eq!(titles, expected);
}

#[tokio::test]
async fn duplicate_keys_keep_the_last_document_found() {
    let fixture = Fixture::new();
    let first = fixture.article("A").await;
    fixture.article("B").await;
    let second = fixture.article("A").await;

    let indexed = fixture
        .mapper
        .find("Article", FindOptions::new().index_by("title"))
        .await
        .unwrap()
        .unwrap()
        .into_indexed()
        .unwrap();

    assert_eq!(indexed.keys().collect::<Vec<_>>(), ["A", "B"]);
    assert_eq!(indexed["A"].id(), second.id());
    assert_ne!(indexed["A"].id(), first.id());
}

#[tokio::test]
async fn results_can_be_keyed_by_a_field() {
    let fixture = Fixture::new();
    let b = fixture.article("B").await;
    let a = fixture.article("A").await;

    let indexed = fixture
        .mapper
        .find("Article", FindOptions::new().index_by("title"))
        .await
        .unwrap()
        .unwrap()
        .into_indexed()
        .unwrap();

    assert_eq!(indexed.keys().collect::<Vec<_>>(), ["B", "A"]);
    assert_eq!(indexed["A"].id(), a.id());
    assert_eq!(indexed["B"].id(), b.id());

    let by_id = fixture
        .mapper
        .find("Article", FindOptions::new().index_by("_id"))
        .await
        .unwrap()
        .unwrap()
        .into_indexed()
        .unwrap();
    assert!(by_id.contains_key(&a.id().unwrap().to_hex()));

    assert!(matches!(
        fixture
            .mapper
            .find("Article", FindOptions::new().index_by("nope"))
            .await,
        Err(DocumentStoreError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn documents_are_found_by_identifier() {
    let fixture = Fixture::new();
    let article = fixture.article("Hello").await;
    let id = article.id().unwrap();

    let by_id = fixture.mapper.get("Article", id).await.unwrap().unwrap();
    assert_eq!(by_id.id(), Some(id));
    assert_eq!(by_id.value("title").unwrap(), Value::from("Hello"));
    assert!(!by_id.ptr_eq(&article));
    assert!(!by_id.is_modified());

    let by_hex = fixture.mapper.get("Article", id.to_hex()).await.unwrap();
    assert_eq!(by_hex.unwrap().id(), Some(id));

    assert!(
        fixture
            .mapper
            .get("Article", ObjectId::new())
            .await
            .unwrap()
            .is_none()
    );
    assert!(fixture.mapper.get("Article", "not hex").await.is_err());
}

#[tokio::test]
async fn find_options_shape_the_result() {
    let fixture = Fixture::new();
    for title in ["a", "b", "c", "d"] {
        fixture.article(title).await;
    }

    let nothing = fixture
        .mapper
        .find("Article", FindOptions::new().filter(Filter::eq("title", "z")))
        .await
        .unwrap();
    assert!(nothing.is_none());

    let page = fixture
        .mapper
        .find(
            "Article",
            FindOptions::new()
                .sort("title", SortDirection::Desc)
                .skip(1)
                .limit(2),
        )
        .await
        .unwrap()
        .unwrap()
        .into_documents();
    assert_eq!(
        page.iter()
            .map(|article| article.value("title").unwrap())
            .collect::<Vec<_>>(),
        [Value::from("c"), Value::from("b")]
    );

    let one = fixture
        .mapper
        .find(
            "Article",
            FindOptions::new()
                .filter(Filter::any_of("title", vec!["b", "d"]))
                .sort("title", SortDirection::Asc)
                .one(),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(&one, FindResult::One(_)));
    assert_eq!(one.into_one().unwrap().value("title").unwrap(), Value::from("b"));

    let found = fixture
        .mapper
        .find_one("Article", Some(Filter::eq("title", "a")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.value("is_active").unwrap(), Value::Bool(false));

    let projected = fixture
        .mapper
        .find(
            "Article",
            FindOptions::new()
                .filter(Filter::eq("title", "a"))
                .fields(["is_active"]),
        )
        .await
        .unwrap()
        .unwrap()
        .into_one()
        .unwrap();
    assert_eq!(projected.value("title").unwrap(), Value::Null);
    assert!(projected.id().is_some());
}

#[tokio::test]
async fn updates_reach_storage() {
    let fixture = Fixture::new();
    let article = fixture.article("Draft").await;

    article.set("content", "body").unwrap();
    article.set("is_active", true).unwrap();
    fixture.mapper.save("Article", [&article]).await.unwrap();
    assert!(!article.is_modified());

    article.set("content", Value::Null).unwrap();
    article.save().await.unwrap();

    let stored = fixture.store.records("article").await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].get_bool("is_active").unwrap());
    assert!(!stored[0].contains_key("content"));
    assert_eq!(stored[0].get_object_id("_id").unwrap(), article.id().unwrap());
}

#[tokio::test]
async fn unmodified_documents_cannot_be_saved() {
    let fixture = Fixture::new();
    let article = fixture.article("Saved").await;

    assert!(matches!(
        article.save().await,
        Err(DocumentStoreError::InvalidOperation(_))
    ));

    let category = fixture.create("Category");
    category.set("name", "wrong repository").unwrap();
    assert!(matches!(
        fixture.mapper.save("Article", [&category]).await,
        Err(DocumentStoreError::InvalidArgument(_))
    ));
    assert!(category.is_new());
}

#[tokio::test]
async fn deleting_removes_records() {
    let fixture = Fixture::new();
    let first = fixture.article("one").await;
    let second = fixture.article("two").await;
    let third = fixture.article("three").await;

    fixture
        .mapper
        .delete("Article", [&first, &third])
        .await
        .unwrap();
    fixture
        .mapper
        .delete("Article", Vec::<&Document>::new())
        .await
        .unwrap();

    let remaining = fixture.store.records("article").await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].get_object_id("_id").unwrap(),
        second.id().unwrap()
    );

    assert!(matches!(
        fixture.create("Article").delete().await,
        Err(DocumentStoreError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn remove_deletes_by_filter() {
    let fixture = Fixture::new();
    for title in ["keep", "drop 1", "drop 2"] {
        fixture.article(title).await;
    }

    let removed = fixture
        .mapper
        .remove("Article", Some(Filter::starts_with("title", "drop")))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(fixture.store.count("article").await, 1);

    assert_eq!(fixture.mapper.remove("Article", None).await.unwrap(), 1);
    assert_eq!(fixture.store.count("article").await, 0);
}

#[tokio::test]
async fn indexes_are_ensured_once() {
    let fixture = Fixture::new();
    let articles = fixture.container.repository("Article").unwrap();

    articles.ensure_indexes().await.unwrap();
    articles.ensure_indexes().await.unwrap();

    let indexes = fixture.store.indexes("article").await;
    assert_eq!(indexes.len(), 2);
    assert!(indexes[0].options.unique);
    assert_eq!(indexes[1].key_document(), bson::doc! { "author_id": 1, "is_active": -1 });
}

#[tokio::test]
async fn storage_operations_are_logged() {
    let logs = Arc::new(Mutex::new(Vec::<QueryLog>::new()));
    let sink = logs.clone();
    let fixture = Fixture::with(move |builder| builder.logger(move |log: &QueryLog| sink.lock().push(log.clone())));

    let article = fixture.article("Logged").await;
    article.set("title", "Changed").unwrap();
    article.save().await.unwrap();
    fixture
        .mapper
        .find_one("Article", Some(Filter::eq("title", "Changed")))
        .await
        .unwrap();

    let logs = logs.lock();
    assert_eq!(
        logs.iter().map(|log| log.operation).collect::<Vec<_>>(),
        ["insert_many", "update_one", "find"]
    );
    assert!(logs.iter().all(|log| log.connection == "main" && log.collection == "article"));
}

#[tokio::test]
async fn collections_and_connections_are_configurable() {
    let archive = InMemoryStore::new();
    let config: MapperConfig = serde_json::from_str(
        r#"{ "default_connection": "main", "collections": { "Category": "categories" } }"#,
    )
    .unwrap();

    let shared = archive.clone();
    let fixture = Fixture::with(move |builder| {
        builder
            .shared_connection("archive", Arc::new(shared))
            .config(config)
    });
    fixture
        .container
        .register_with("Entry", ShapeKind::Document, |definition: &mut Definition| {
            definition
                .add_field("message", "string")?
                .set_connection("archive")?
                .set_collection("entries")?;
            Ok(())
        })
        .unwrap();

    let category = fixture.create("Category");
    category.set("name", "News").unwrap();
    category.save().await.unwrap();
    assert_eq!(fixture.store.count("categories").await, 1);
    assert_eq!(fixture.store.count("category").await, 0);

    let entry = fixture.create("Entry");
    entry.set("message", "archived").unwrap();
    entry.save().await.unwrap();
    assert_eq!(archive.count("entries").await, 1);
    assert_eq!(fixture.store.count("entries").await, 0);

    let image = fixture.container.repository("Image").unwrap();
    assert_eq!(image.collection().name(), "images");
    assert_eq!(image.collection().connection(), "main");
}

#[test]
fn repositories_need_a_live_mapper() {
    let container = Container::new(TypeRegistry::new());
    common::register_blog(&container).unwrap();

    assert!(matches!(
        container.repository("Article"),
        Err(DocumentStoreError::NotFound("mapper", _))
    ));

    let mapper = Mapper::builder(container.clone())
        .connection("main", InMemoryStore::new())
        .build()
        .unwrap();
    container.bind("Article", &mapper);
    assert!(container.repository("Article").is_ok());
    assert!(matches!(
        container.repository("Source"),
        Err(DocumentStoreError::InvalidOperation(_))
    ));
    assert!(container.repository("Author").is_err());

    drop(mapper);
    assert!(matches!(
        container.repository("Article"),
        Err(DocumentStoreError::State(_))
    ));
}
