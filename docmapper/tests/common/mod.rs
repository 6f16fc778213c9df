#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use docmapper::{async_trait, memory::InMemoryStore, prelude::*};

/// Events recorded by hooks and extensions, in firing order.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub struct Fixture {
    pub container: Container,
    pub mapper: Mapper,
    pub store: InMemoryStore,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Builds a fixture, letting the caller adjust the mapper before it is built.
    pub fn with(configure: impl FnOnce(docmapper::mapper::MapperBuilder) -> docmapper::mapper::MapperBuilder) -> Self {
        let container = Container::new(TypeRegistry::new());
        register_blog(&container).unwrap();

        let store = InMemoryStore::new();
        let mapper = configure(Mapper::builder(container.clone()).connection("main", store.clone()))
            .build()
            .unwrap();
        container.set_default(&mapper);

        Self {
            container,
            mapper,
            store,
        }
    }

    pub fn create(&self, shape: &str) -> Document {
        self.container.create(shape).unwrap()
    }

    pub async fn article(&self, title: &str) -> Document {
        let article = self.create("Article");
        article.set("title", title).unwrap();
        article.save().await.unwrap();
        article
    }
}

pub fn register_blog(container: &Container) -> DocumentStoreResult<()> {
    container.register_with("Article", ShapeKind::Document, |definition: &mut Definition| {
        definition
            .add_field("author_id", "id")?
            .add_field("title", "string")?
            .add_field("content", "string")?
            .add_field("category_ids", "raw")?
            .add_field_with_default("is_active", "boolean", false)?
            .add_field("options", "array")?
            .add_reference("author", "Author", "author_id", Cardinality::One)?
            .add_reference("categories", "Category", "category_ids", Cardinality::Many)?
            .add_embed("source", "Source", Cardinality::One)?
            .add_embed("comments", "Comment", Cardinality::Many)?
            .add_index(IndexDef::new([("title", SortDirection::Asc)]).unique())?
            .add_index(IndexDef::new([("author_id", SortDirection::Asc), ("is_active", SortDirection::Desc)]))?;
        Ok(())
    })?;

    container.register_with("Author", ShapeKind::Document, |definition: &mut Definition| {
        definition
            .add_field("name", "string")?
            .add_field("email", "string")?
            .add_relation("address", "Address", "author_id", Cardinality::One)?
            .add_relation("articles", "Article", "author_id", Cardinality::Many)?;
        Ok(())
    })?;

    container.register_with("Address", ShapeKind::Document, |definition: &mut Definition| {
        definition
            .add_field("author_id", "id")?
            .add_field("street", "string")?;
        Ok(())
    })?;

    container.register_with("Category", ShapeKind::Document, |definition: &mut Definition| {
        definition.add_field("name", "string")?;
        Ok(())
    })?;

    container.register_with("Source", ShapeKind::Embedded, |definition: &mut Definition| {
        definition
            .add_field("name", "string")?
            .add_field("url", "string")?;
        Ok(())
    })?;

    container.register_with("Comment", ShapeKind::Embedded, |definition: &mut Definition| {
        definition
            .add_field("name", "string")?
            .add_field("text", "string")?;
        Ok(())
    })?;

    container.register_with("Image", ShapeKind::Document, |definition: &mut Definition| {
        definition
            .add_field("file", "file")?
            .add_field("name", "string")?
            .set_collection("images")?;
        Ok(())
    })?;

    Ok(())
}

/// Records every event it is notified of and contributes one method of each kind.
#[derive(Debug)]
pub struct Recorder {
    options: ExtensionOptions,
    log: EventLog,
}

impl Recorder {
    pub fn new(log: EventLog) -> DocumentStoreResult<Self> {
        Self::with_options(log, Vec::<(&str, Value)>::new())
    }

    pub fn with_options(log: EventLog, options: Vec<(&str, Value)>) -> DocumentStoreResult<Self> {
        let options = ExtensionOptions::with_defaults([
            ("field", Value::from("recorded_by")),
            ("prefix", Value::from("extension")),
        ])
        .merge(options)?;

        Ok(Self { options, log })
    }
}

#[async_trait]
impl Extension for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn options(&self) -> Option<&ExtensionOptions> {
        Some(&self.options)
    }

    fn setup(&self, definition: &mut Definition) -> DocumentStoreResult<()> {
        definition.add_field(self.options.option("field")?.to_key(), "string")?;
        Ok(())
    }

    fn events(&self) -> &[Event] {
        &Event::ALL
    }

    fn notify(&self, event: Event, _document: &Document) -> DocumentStoreResult<()> {
        let prefix = self.options.option("prefix")?.to_key();
        self.log.lock().push(format!("{prefix}:{event}"));
        Ok(())
    }

    fn document_methods(&self) -> &[&'static str] {
        &["shout"]
    }

    fn call_document_method(&self, method: &str, document: &Document, _args: Vec<Value>) -> DocumentStoreResult<Value> {
        match method {
            "shout" => Ok(Value::from(
                document.value("title")?.as_str().unwrap_or_default().to_uppercase(),
            )),
            other => Err(DocumentStoreError::not_found("method", other)),
        }
    }

    fn repository_methods(&self) -> &[&'static str] {
        &["count_titled"]
    }

    async fn call_repository_method(
        &self,
        method: &str,
        repository: &Repository,
        args: Vec<Value>,
    ) -> DocumentStoreResult<Value> {
        if method != "count_titled" {
            return Err(DocumentStoreError::not_found("method", method));
        }

        let title = args.first().cloned().unwrap_or_default().to_key();
        let found = repository
            .find(FindOptions::new().filter(Filter::eq("title", title)))
            .await?;

        Ok(Value::from(found.map_or(0, |result| result.len() as i64)))
    }
}
