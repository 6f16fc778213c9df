//! Ordered collections of documents.
//!
//! A [`Group`] backs every "many" embed, reference and relation. It is a shared handle:
//! clones see the same elements. An optional callback runs after every mutation, which is
//! how a referencing document keeps its foreign-key field in sync with the group.
//!
//! The callback runs after the group's lock is released, so it may read the group and call
//! back into the document that owns it.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
};

/// Invoked with the group after each mutation.
pub type GroupCallback = Arc<dyn Fn(&Group) -> DocumentStoreResult<()> + Send + Sync>;

#[derive(Default)]
struct GroupState {
    elements: Vec<Document>,
    callback: Option<GroupCallback>,
}

/// A shared, ordered, index-addressed list of documents.
///
/// Membership changes are not change-tracked: an owner whose embed-many group only gained or
/// lost clean elements still reports [`Document::is_modified`](crate::document::Document::is_modified) as false.
#[derive(Clone, Default)]
pub struct Group {
    state: Arc<Mutex<GroupState>>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Group")
            .field("elements", &state.elements)
            .field("callback", &state.callback.is_some())
            .finish()
    }
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements(elements: impl IntoIterator<Item = Document>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GroupState {
                elements: elements.into_iter().collect(),
                callback: None,
            })),
        }
    }

    /// Whether both handles point to the same group.
    pub fn ptr_eq(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn callback(&self) -> Option<GroupCallback> {
        self.state.lock().callback.clone()
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&Group) -> DocumentStoreResult<()> + Send + Sync + 'static,
    {
        self.state.lock().callback = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        self.state.lock().callback = None;
    }

    fn changed(&self) -> DocumentStoreResult<()> {
        let callback = self.state.lock().callback.clone();

        match callback {
            Some(callback) => callback(self),
            None => Ok(()),
        }
    }

    /// Appends a document.
    pub fn add(&self, document: Document) -> DocumentStoreResult<()> {
        self.state.lock().elements.push(document);
        self.changed()
    }

    /// Replaces the document at `index`, or appends it when `index` equals the length.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidArgument`] if `index` is past the end.
    pub fn set(&self, index: usize, document: Document) -> DocumentStoreResult<()> {
        {
            let mut state = self.state.lock();
            let len = state.elements.len();

            match index {
                index if index < len => state.elements[index] = document,
                index if index == len => state.elements.push(document),
                index => {
                    return Err(DocumentStoreError::InvalidArgument(format!(
                        "index {index} is out of bounds for a group of {len}"
                    )));
                }
            }
        }

        self.changed()
    }

    /// Removes and returns the document at `index`, shifting later elements down.
    pub fn remove(&self, index: usize) -> DocumentStoreResult<Option<Document>> {
        let removed = {
            let mut state = self.state.lock();
            (index < state.elements.len()).then(|| state.elements.remove(index))
        };

        self.changed()?;

        Ok(removed)
    }

    pub fn clear(&self) -> DocumentStoreResult<()> {
        self.state.lock().elements.clear();
        self.changed()
    }

    /// Replaces every element at once, notifying the callback a single time.
    pub fn set_elements(&self, elements: impl IntoIterator<Item = Document>) -> DocumentStoreResult<()> {
        self.state.lock().elements = elements.into_iter().collect();
        self.changed()
    }

    /// Whether an element exists at `index`.
    pub fn exists(&self, index: usize) -> bool {
        index < self.state.lock().elements.len()
    }

    /// Whether `document` itself (not an equal copy) is an element.
    pub fn exists_element(&self, document: &Document) -> bool {
        self.index_of(document).is_some()
    }

    pub fn index_of(&self, document: &Document) -> Option<usize> {
        self.state
            .lock()
            .elements
            .iter()
            .position(|element| element.ptr_eq(document))
    }

    pub fn get(&self, index: usize) -> Option<Document> {
        self.state.lock().elements.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().elements.is_empty()
    }

    /// A snapshot of the elements.
    pub fn elements(&self) -> Vec<Document> {
        self.state.lock().elements.clone()
    }

    /// Iterates over a snapshot of the elements.
    pub fn iter(&self) -> std::vec::IntoIter<Document> {
        self.elements().into_iter()
    }
}

impl FromIterator<Document> for Group {
    fn from_iter<T: IntoIterator<Item = Document>>(iter: T) -> Self {
        Group::with_elements(iter)
    }
}

impl IntoIterator for &Group {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        container::Container,
        definition::{Definition, ShapeKind},
        types::TypeRegistry,
    };

    fn container() -> Container {
        let container = Container::new(TypeRegistry::new());
        container
            .register_with("Comment", ShapeKind::Document, |definition: &mut Definition| {
                definition.add_field("text", "string")?;
                Ok(())
            })
            .unwrap();
        container
    }

    fn comment(container: &Container, text: &str) -> Document {
        let document = container.create("Comment").unwrap();
        document.set("text", text).unwrap();
        document
    }

    #[test]
    fn elements_keep_insertion_order() {
        let container = container();
        let group = Group::new();
        let (a, b, c) = (
            comment(&container, "a"),
            comment(&container, "b"),
            comment(&container, "c"),
        );

        group.add(a.clone()).unwrap();
        group.add(b.clone()).unwrap();
        group.set(2, c.clone()).unwrap();

        assert_eq!(group.len(), 3);
        assert_eq!(group.index_of(&c), Some(2));
        assert!(group.exists(2));
        assert!(!group.exists(3));
        assert!(group.set(5, a.clone()).is_err());

        let removed = group.remove(0).unwrap().unwrap();
        assert!(removed.ptr_eq(&a));
        assert!(!group.exists_element(&a));
        assert!(group.get(0).unwrap().ptr_eq(&b));
        assert!(group.remove(9).unwrap().is_none());
    }

    #[test]
    fn element_lookup_is_by_identity() {
        let container = container();
        let group = Group::with_elements([comment(&container, "a")]);

        assert!(!group.exists_element(&comment(&container, "a")));
        assert!(group.exists_element(&group.get(0).unwrap()));
    }

    #[test]
    fn callback_runs_after_every_mutation() {
        let container = container();
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new();

        let counter = calls.clone();
        group.set_callback(move |group| {
            // The group can be read from inside its own callback.
            let _ = group.len();
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        group.add(comment(&container, "a")).unwrap();
        group.set(0, comment(&container, "b")).unwrap();
        group.remove(0).unwrap();
        group.set_elements([comment(&container, "c")]).unwrap();
        group.clear().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(group.is_empty());
    }

    #[test]
    fn clones_share_elements() {
        let container = container();
        let group = Group::new();
        let other = group.clone();

        group.add(comment(&container, "a")).unwrap();

        assert_eq!(other.len(), 1);
        assert!(other.ptr_eq(&group));
        assert!(!Group::new().ptr_eq(&group));
    }
}
