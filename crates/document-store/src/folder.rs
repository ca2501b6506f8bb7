use std::sync::Arc;

use async_trait::async_trait;
use common::validate_name;

use crate::{
    Document, DocumentStoreVersion, DocumentWatch, IndexEntry, NewerDocument, Result,
};

/// Storage operations over full document keys (`"folder/sub/name"`).
///
/// Backends serialize saves per key; operations on different keys never
/// wait on each other.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Loads a document; the returned `name` is the full key.
    async fn get(&self, key: &str) -> Result<Option<Document>>;

    /// Loads a document only if its version differs from `known_version`.
    async fn get_newer(&self, key: &str, known_version: i64) -> Result<NewerDocument> {
        Ok(match self.get(key).await? {
            None => NewerDocument::Missing,
            Some(doc) if doc.version == known_version => NewerDocument::Unchanged,
            Some(doc) => NewerDocument::Found(doc),
        })
    }

    /// Writes a document if `expected` matches, replacing its index entries.
    /// Returns the new version.
    async fn save(
        &self,
        key: &str,
        content: &str,
        expected: DocumentStoreVersion,
        index: &[IndexEntry],
    ) -> Result<i64>;

    /// Deletes every document whose key starts with `prefix`. Returns the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Documents directly under `prefix` with a value of `index` in
    /// `[start, end]`, ordered by lowest matching value then key.
    async fn find(
        &self,
        prefix: &str,
        index: &str,
        start: &str,
        end: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Document>>;

    /// Subscribes to changes of `key`.
    fn watch(&self, key: &str) -> DocumentWatch;
}

/// A namespace of documents.
///
/// Folders are cheap handles; cloning or creating sub-folders does not touch
/// storage.
#[derive(Clone)]
pub struct DocumentFolder {
    backend: Arc<dyn DocumentBackend>,
    /// Empty for the root, otherwise `"a/b/"`.
    prefix: String,
}

impl DocumentFolder {
    /// The root folder of a backend.
    pub fn root(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            prefix: String::new(),
        }
    }

    /// Path of this folder without the trailing separator.
    pub fn path(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    /// Opens a child folder.
    pub fn sub_folder(&self, name: &str) -> Result<DocumentFolder> {
        validate_name(name)?;
        Ok(Self {
            backend: self.backend.clone(),
            prefix: format!("{}{name}/", self.prefix),
        })
    }

    fn key(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        Ok(format!("{}{name}", self.prefix))
    }

    fn relative(&self, mut doc: Document) -> Document {
        if let Some(name) = doc.name.strip_prefix(&self.prefix) {
            doc.name = name.to_string();
        }
        doc
    }

    pub async fn get_document(&self, name: &str) -> Result<Option<Document>> {
        let key = self.key(name)?;
        Ok(self.backend.get(&key).await?.map(|doc| self.relative(doc)))
    }

    /// Conditional read: skips the content when `known_version` is current.
    pub async fn get_newer_document(&self, name: &str, known_version: i64) -> Result<NewerDocument> {
        let key = self.key(name)?;
        Ok(match self.backend.get_newer(&key, known_version).await? {
            NewerDocument::Found(doc) => NewerDocument::Found(self.relative(doc)),
            other => other,
        })
    }

    /// Saves a document and returns its new version.
    ///
    /// Fails with `ConcurrencyConflict` when `expected` does not match the
    /// stored version; nothing is written in that case.
    pub async fn save_document(
        &self,
        name: &str,
        content: &str,
        expected: DocumentStoreVersion,
        index: &[IndexEntry],
    ) -> Result<i64> {
        let key = self.key(name)?;
        for entry in index {
            validate_name(&entry.name)?;
        }
        self.backend.save(&key, content, expected, index).await
    }

    /// Deletes every document in this folder and its sub-folders.
    pub async fn delete_all(&self) -> Result<u64> {
        self.backend.delete_prefix(&self.prefix).await
    }

    /// Subscribes to changes of one document.
    pub fn watch_changes(&self, name: &str) -> Result<DocumentWatch> {
        let key = self.key(name)?;
        Ok(self.backend.watch(&key))
    }

    /// Reverse lookup through index entries; see [`DocumentBackend::find`].
    pub async fn find_documents(
        &self,
        index: &str,
        range_start: &str,
        range_end: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Document>> {
        validate_name(index)?;
        let docs = self
            .backend
            .find(&self.prefix, index, range_start, range_end, offset, count)
            .await?;
        Ok(docs.into_iter().map(|doc| self.relative(doc)).collect())
    }
}

impl std::fmt::Debug for DocumentFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentFolder")
            .field("path", &self.path())
            .finish()
    }
}
