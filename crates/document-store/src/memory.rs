use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    Document, DocumentBackend, DocumentFolder, DocumentStoreError, DocumentStoreVersion,
    DocumentWatch, IndexEntry, Result, WatchHub,
};

struct StoredDocument {
    version: i64,
    content: String,
    index: Vec<IndexEntry>,
}

/// In-memory document store implementation for testing.
///
/// Provides the same semantics as the PostgreSQL implementation, with
/// change notifications delivered synchronously on save.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<RwLock<BTreeMap<String, StoredDocument>>>,
    hub: WatchHub,
}

impl InMemoryDocumentStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root folder backed by this store.
    pub fn folder(&self) -> DocumentFolder {
        DocumentFolder::root(Arc::new(self.clone()))
    }

    /// Returns the total number of documents stored.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

fn is_direct_child(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

#[async_trait]
impl DocumentBackend for InMemoryDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<Document>> {
        let documents = self.documents.read().await;
        Ok(documents.get(key).map(|doc| Document {
            name: key.to_string(),
            version: doc.version,
            content: doc.content.clone(),
        }))
    }

    #[tracing::instrument(skip(self, content, index))]
    async fn save(
        &self,
        key: &str,
        content: &str,
        expected: DocumentStoreVersion,
        index: &[IndexEntry],
    ) -> Result<i64> {
        let mut documents = self.documents.write().await;
        let current = documents.get(key).map(|doc| doc.version).unwrap_or(0);

        if !expected.matches(current) {
            metrics::counter!("documentstore_conflicts_total").increment(1);
            return Err(DocumentStoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected,
                actual: current,
            });
        }

        let version = current + 1;
        documents.insert(
            key.to_string(),
            StoredDocument {
                version,
                content: content.to_string(),
                index: index.to_vec(),
            },
        );
        drop(documents);

        metrics::counter!("documentstore_saves_total").increment(1);
        self.hub.notify(key);
        Ok(version)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut documents = self.documents.write().await;
        let keys: Vec<String> = documents
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            documents.remove(key);
        }
        drop(documents);

        for key in &keys {
            self.hub.notify(key);
        }
        Ok(keys.len() as u64)
    }

    async fn find(
        &self,
        prefix: &str,
        index: &str,
        start: &str,
        end: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Document>> {
        let documents = self.documents.read().await;

        let mut matches: Vec<(&str, &str, &StoredDocument)> = documents
            .iter()
            .filter(|(key, _)| is_direct_child(key, prefix))
            .filter_map(|(key, doc)| {
                doc.index
                    .iter()
                    .filter(|entry| entry.name == index)
                    .flat_map(|entry| entry.values.iter())
                    .map(String::as_str)
                    .filter(|value| *value >= start && *value <= end)
                    .min()
                    .map(|lowest| (lowest, key.as_str(), doc))
            })
            .collect();
        matches.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        Ok(matches
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(_, key, doc)| Document {
                name: key.to_string(),
                version: doc.version,
                content: doc.content.clone(),
            })
            .collect())
    }

    fn watch(&self, key: &str) -> DocumentWatch {
        self.hub.subscribe(key)
    }
}
