//! In-memory document store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test panicked

use crate::faults::Faults;
use crate::json_path;
use certflow_core::error::{StoreError, StoreKind, WorkflowError};
use certflow_core::store::{DocumentOp, DocumentStore, DocumentTransaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Key = (String, String);
type Documents = Arc<Mutex<BTreeMap<Key, Value>>>;

/// Map-backed document store with failure injection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Documents,
    faults: Faults,
}

impl InMemoryDocumentStore {
    /// Empty store without injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store sharing a failure switchboard.
    #[must_use]
    pub fn with_faults(faults: Faults) -> Self {
        Self {
            documents: Documents::default(),
            faults,
        }
    }

    /// Committed document, bypassing transactions.
    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.documents
            .lock()
            .unwrap()
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of committed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    /// Whether no documents are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.lock().unwrap().is_empty()
    }
}

/// Staged document transaction.
#[derive(Debug)]
pub struct InMemoryDocumentTx {
    documents: Documents,
    faults: Faults,
    staged: BTreeMap<Key, Option<Value>>,
}

fn store_error(message: impl Into<String>) -> WorkflowError {
    StoreError::new(StoreKind::Document, message).into()
}

impl InMemoryDocumentTx {
    fn current(&self, key: &Key) -> Option<Value> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.documents.lock().unwrap().get(key).cloned(),
        }
    }

    fn apply_op(&mut self, op: &DocumentOp) -> Result<(), WorkflowError> {
        self.faults.before_apply(StoreKind::Document)?;

        let (collection, id) = op.target();
        let key = (collection.to_string(), id.to_string());

        match op {
            DocumentOp::Insert { document, .. } => {
                if self.current(&key).is_some() {
                    return Err(store_error(format!("duplicate document {collection}/{id}")));
                }
                self.staged.insert(key, Some(document.clone()));
                return Ok(());
            }
            DocumentOp::Delete { .. } => {
                self.staged.insert(key, None);
                return Ok(());
            }
            _ => {}
        }

        let mut document = self
            .current(&key)
            .ok_or_else(|| store_error(format!("document {collection}/{id} not found")))?;

        match op {
            DocumentOp::Set { path, value, .. } => {
                json_path::set(&mut document, path, value.clone()).map_err(store_error)?;
            }
            DocumentOp::SetIfAbsent { path, value, .. } => {
                let absent = json_path::get(&document, path).is_none_or(Value::is_null);
                if absent {
                    json_path::set(&mut document, path, value.clone()).map_err(store_error)?;
                }
            }
            DocumentOp::Push { path, value, .. } => {
                json_path::push(&mut document, path, value.clone()).map_err(store_error)?;
            }
            DocumentOp::PopLast { path, .. } => {
                json_path::pop_last(&mut document, path);
            }
            DocumentOp::Unset { path, .. } => {
                json_path::remove(&mut document, path);
            }
            DocumentOp::Insert { .. } | DocumentOp::Delete { .. } => {}
        }

        self.staged.insert(key, Some(document));
        Ok(())
    }
}

impl DocumentTransaction for InMemoryDocumentTx {
    async fn apply(&mut self, op: &DocumentOp) -> Result<(), WorkflowError> {
        self.apply_op(op)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.faults.before_commit(StoreKind::Document)?;

        let mut documents = self.documents.lock().unwrap();
        for (key, document) in self.staged {
            match document {
                Some(document) => documents.insert(key, document),
                None => documents.remove(&key),
            };
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    type Tx = InMemoryDocumentTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryDocumentTx {
            documents: Arc::clone(&self.documents),
            faults: self.faults.clone(),
            staged: BTreeMap::new(),
        })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.document(collection, id))
    }

    async fn search_text(&self, collection: &str, text: &str) -> Result<Vec<String>, StoreError> {
        let needle = text.to_lowercase();
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), document)| {
                c == collection && document.to_string().to_lowercase().contains(&needle)
            })
            .map(|((_, id), _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use certflow_core::store::path;
    use serde_json::json;

    fn push(id: &str) -> DocumentOp {
        DocumentOp::Push {
            collection: "applications".into(),
            id: id.into(),
            path: path(["workflowHistory"]),
            value: json!({ "toStatus": "submitted" }),
        }
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.apply(&DocumentOp::Insert {
            collection: "applications".into(),
            id: "a".into(),
            document: json!({ "formData": {} }),
        })
        .await
        .unwrap();
        tx.apply(&push("a")).await.unwrap();
        assert!(store.document("applications", "a").is_none());

        tx.commit().await.unwrap();
        let doc = store.document("applications", "a").unwrap();
        assert_eq!(doc["workflowHistory"][0]["toStatus"], "submitted");
    }

    #[tokio::test]
    async fn set_if_absent_keeps_first_value() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.apply(&DocumentOp::Insert {
            collection: "applications".into(),
            id: "a".into(),
            document: json!({ "timeline": { "reviewStartedAt": "first" } }),
        })
        .await
        .unwrap();
        tx.apply(&DocumentOp::SetIfAbsent {
            collection: "applications".into(),
            id: "a".into(),
            path: path(["timeline", "reviewStartedAt"]),
            value: json!("second"),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let doc = store.document("applications", "a").unwrap();
        assert_eq!(doc["timeline"]["reviewStartedAt"], "first");
    }

    #[tokio::test]
    async fn missing_document_is_a_store_error() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx.apply(&push("missing")).await.unwrap_err();
        assert_eq!(err.kind(), "store");
    }
}
