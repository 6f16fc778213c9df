mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::{EventLog, Fixture, Recorder};
use docmapper::prelude::*;

/// Registers "Post", whose shape hooks and extension both write to `log`.
fn register_post(fixture: &Fixture, log: &EventLog) {
    let log = log.clone();
    fixture
        .container
        .register_with("Post", ShapeKind::Document, move |definition: &mut Definition| {
            definition.add_field("title", "string")?;
            for event in Event::ALL {
                let log = log.clone();
                definition.add_hook(event, move |_| {
                    log.lock().push(format!("shape:{event}"));
                    Ok(())
                })?;
            }
            definition.add_extension(Recorder::new(log.clone())?)?;
            Ok(())
        })
        .unwrap();
}

fn take(log: &EventLog) -> Vec<String> {
    std::mem::take(&mut *log.lock())
}

fn shape_events(events: &[String]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| event.strip_prefix("shape:"))
        .collect()
}

#[tokio::test]
async fn events_fire_in_lifecycle_order() {
    let fixture = Fixture::new();
    let log = EventLog::default();
    register_post(&fixture, &log);

    let post = fixture.create("Post");
    post.set("title", "Hello").unwrap();
    post.save().await.unwrap();
    assert_eq!(
        take(&log),
        [
            "shape:preInsert",
            "extension:preInsert",
            "shape:preSave",
            "extension:preSave",
            "shape:postInsert",
            "extension:postInsert",
            "shape:postSave",
            "extension:postSave",
        ]
    );

    post.set("title", "Changed").unwrap();
    post.save().await.unwrap();
    assert_eq!(
        shape_events(&take(&log)),
        ["preUpdate", "preSave", "postUpdate", "postSave"]
    );

    post.delete().await.unwrap();
    assert_eq!(shape_events(&take(&log)), ["preDelete", "postDelete"]);
}

#[tokio::test]
async fn batches_fire_each_event_on_every_document_before_the_next() {
    let fixture = Fixture::new();
    let log = EventLog::default();
    let hook_log = log.clone();
    fixture
        .container
        .register_with("Note", ShapeKind::Document, move |definition: &mut Definition| {
            definition.add_field("title", "string")?;
            for event in Event::ALL {
                let log = hook_log.clone();
                definition.add_hook(event, move |document| {
                    let title = document.value("title")?.to_key();
                    log.lock().push(format!("{event}:{title}"));
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();

    let notes = ["a", "b"]
        .into_iter()
        .map(|title| {
            let note = fixture.create("Note");
            note.set("title", title).unwrap();
            note
        })
        .collect::<Vec<_>>();
    fixture.mapper.save("Note", &notes).await.unwrap();

    assert_eq!(
        take(&log),
        [
            "preInsert:a",
            "preInsert:b",
            "preSave:a",
            "preSave:b",
            "postInsert:a",
            "postInsert:b",
            "postSave:a",
            "postSave:b",
        ]
    );

    fixture.mapper.delete("Note", &notes).await.unwrap();
    assert_eq!(
        take(&log),
        ["preDelete:a", "preDelete:b", "postDelete:a", "postDelete:b"]
    );
}

#[tokio::test]
async fn failing_hooks_stop_the_write() {
    let fixture = Fixture::new();
    fixture
        .container
        .register_with("Guarded", ShapeKind::Document, |definition: &mut Definition| {
            definition
                .add_field("title", "string")?
                .add_hook(Event::PreInsert, |document| match document.value("title")?.as_str() {
                    Some("") | None => Err(DocumentStoreError::InvalidDocument("a title is required".into())),
                    Some(_) => Ok(()),
                })?;
            Ok(())
        })
        .unwrap();

    let guarded = fixture.create("Guarded");
    guarded.set("title", "").unwrap();
    assert!(matches!(
        guarded.save().await,
        Err(DocumentStoreError::InvalidDocument(_))
    ));
    assert!(guarded.is_new());
    assert_eq!(fixture.store.count("guarded").await, 0);

    guarded.set("title", "ok").unwrap();
    guarded.save().await.unwrap();
    assert_eq!(fixture.store.count("guarded").await, 1);
}

#[tokio::test]
async fn hooks_that_undo_every_change_skip_the_write() {
    let operations = Arc::new(Mutex::new(Vec::new()));
    let sink = operations.clone();
    let fixture = Fixture::with(move |builder| {
        builder.logger(move |log: &QueryLog| sink.lock().push(log.operation))
    });
    let log = EventLog::default();
    let hook_log = log.clone();
    fixture
        .container
        .register_with("Frozen", ShapeKind::Document, move |definition: &mut Definition| {
            let log = hook_log.clone();
            definition
                .add_field("title", "string")?
                .add_hook(Event::PreUpdate, |document| {
                    document.revert_fields_modified();
                    Ok(())
                })?
                .add_hook(Event::PostUpdate, move |_| {
                    log.lock().push("postUpdate".to_string());
                    Ok(())
                })?;
            Ok(())
        })
        .unwrap();

    let frozen = fixture.create("Frozen");
    frozen.set("title", "original").unwrap();
    frozen.save().await.unwrap();

    frozen.set("title", "changed").unwrap();
    frozen.save().await.unwrap();

    assert_eq!(*operations.lock(), ["insert_many"]);
    assert_eq!(*log.lock(), ["postUpdate"]);
    assert_eq!(frozen.value("title").unwrap(), Value::from("original"));
    assert!(!frozen.is_modified());
}

#[tokio::test]
async fn extensions_contribute_fields_and_methods() {
    let fixture = Fixture::new();
    let log = EventLog::default();
    register_post(&fixture, &log);

    let definition = fixture.container.definition("Post").unwrap();
    assert!(definition.field("recorded_by").is_some());

    let extension = &definition.extensions()[0];
    assert_eq!(extension.name(), "recorder");
    assert_eq!(
        extension.options().unwrap().option("prefix").unwrap(),
        &Value::from("extension")
    );

    let post = fixture.create("Post");
    post.set("title", "quiet").unwrap();
    post.set("recorded_by", "tests").unwrap();
    assert_eq!(post.call("shout", vec![]).unwrap(), Value::from("QUIET"));
    assert!(matches!(
        post.call("whisper", vec![]),
        Err(DocumentStoreError::NotFound(..))
    ));
    post.save().await.unwrap();

    let posts = fixture.container.repository("Post").unwrap();
    assert_eq!(
        posts
            .call("count_titled", vec![Value::from("quiet")])
            .await
            .unwrap(),
        Value::from(1)
    );
    assert!(posts.call("count_all", vec![]).await.is_err());
}

#[test]
fn extension_options_are_validated() {
    let log = EventLog::default();

    let custom = Recorder::with_options(log.clone(), vec![("field", Value::from("owner"))]).unwrap();
    assert_eq!(custom.options().unwrap().option("field").unwrap(), &Value::from("owner"));
    assert_eq!(
        custom.options().unwrap().option("prefix").unwrap(),
        &Value::from("extension")
    );

    assert!(matches!(
        Recorder::with_options(log, vec![("colour", Value::from("red"))]),
        Err(DocumentStoreError::Definition(_))
    ));
}
