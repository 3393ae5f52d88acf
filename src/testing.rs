//! In-memory test support.
//!
//! [`MemoryCollection`] implements [`BulkCollection`] over a plain vector of
//! documents, records every batch it receives, and applies a useful subset
//! of update semantics (`$set`/`$unset` plus replacement-style merges). It
//! exists so engine behaviour can be tested without a running server; it is
//! not a MongoDB emulation.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};

use crate::operation::WriteOperation;
use crate::options::WriteOptions;
use crate::results::BatchResult;
use crate::source::RecordCursor;
use crate::store::BulkCollection;

/// An in-memory [`BulkCollection`] for tests.
#[derive(Default)]
pub struct MemoryCollection {
    documents: Mutex<Vec<Document>>,
    batches: Mutex<Vec<Vec<WriteOperation>>>,
    ordered_flags: Mutex<Vec<bool>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection pre-seeded with `documents`.
    pub fn with_documents(documents: Vec<Document>) -> Self {
        MemoryCollection {
            documents: Mutex::new(documents),
            ..Default::default()
        }
    }

    /// Makes every subsequent `bulk_write` fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(message.into());
    }

    /// The current documents, in storage order.
    pub fn documents(&self) -> Vec<Document> {
        self.documents.lock().unwrap().clone()
    }

    /// Every batch received, in submission order.
    pub fn batches(&self) -> Vec<Vec<WriteOperation>> {
        self.batches.lock().unwrap().clone()
    }

    /// The `ordered` flag of every received batch.
    pub fn ordered_flags(&self) -> Vec<bool> {
        self.ordered_flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl BulkCollection for MemoryCollection {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find(&self, filter: Document) -> anyhow::Result<Box<dyn RecordCursor>> {
        let matching: VecDeque<Document> = self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|document| matches(&filter, document))
            .cloned()
            .collect();
        Ok(Box::new(matching))
    }

    async fn bulk_write(
        &self,
        operations: &[WriteOperation],
        options: &WriteOptions,
    ) -> anyhow::Result<BatchResult> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            anyhow::bail!(message);
        }

        self.batches.lock().unwrap().push(operations.to_vec());
        self.ordered_flags.lock().unwrap().push(options.ordered);

        let mut documents = self.documents.lock().unwrap();
        let mut result = BatchResult::empty_ok();

        for operation in operations {
            match operation {
                WriteOperation::InsertOne { document, .. } => {
                    let mut document = document.clone();
                    let id = ensure_id(&mut document);
                    documents.push(document);
                    result.n_inserted += 1;
                    result.inserted_ids.push(id);
                }
                WriteOperation::UpdateOne {
                    filter,
                    update,
                    upsert,
                } => apply_update(&mut documents, filter, update, *upsert, false, &mut result),
                WriteOperation::UpdateMany {
                    filter,
                    update,
                    upsert,
                } => apply_update(&mut documents, filter, update, *upsert, true, &mut result),
                WriteOperation::ReplaceOne {
                    filter,
                    replacement,
                    upsert,
                } => apply_replace(&mut documents, filter, replacement, *upsert, false, &mut result),
                WriteOperation::ReplaceMany {
                    filter,
                    replacement,
                    upsert,
                } => apply_replace(&mut documents, filter, replacement, *upsert, true, &mut result),
                WriteOperation::DeleteOne { filter } => {
                    if let Some(position) =
                        documents.iter().position(|document| matches(filter, document))
                    {
                        documents.remove(position);
                        result.n_removed += 1;
                    }
                }
                WriteOperation::DeleteMany { filter } => {
                    let before = documents.len();
                    documents.retain(|document| !matches(filter, document));
                    result.n_removed += (before - documents.len()) as u64;
                }
            }
        }

        Ok(result)
    }
}

/// Top-level equality matching: every filter field must equal the document's
/// value. The empty filter matches everything.
fn matches(filter: &Document, document: &Document) -> bool {
    filter
        .iter()
        .all(|(key, value)| document.get(key) == Some(value))
}

fn ensure_id(document: &mut Document) -> Bson {
    match document.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            document.insert("_id", id.clone());
            id
        }
    }
}

fn apply_update(
    documents: &mut Vec<Document>,
    filter: &Document,
    update: &Document,
    upsert: Option<bool>,
    multi: bool,
    result: &mut BatchResult,
) {
    let mut matched = 0u64;
    for document in documents.iter_mut() {
        if !matches(filter, document) {
            continue;
        }
        matched += 1;
        if apply_update_content(document, update) {
            result.n_modified += 1;
        }
        if !multi {
            break;
        }
    }

    if matched == 0 && upsert == Some(true) {
        let mut document = Document::new();
        for (key, value) in filter {
            document.insert(key.clone(), value.clone());
        }
        apply_update_content(&mut document, update);
        let id = ensure_id(&mut document);
        documents.push(document);
        result.n_upserted += 1;
        result.upserted_ids.push(id);
    } else {
        result.n_matched += matched;
    }
}

/// Applies `$set`/`$unset` when the update uses operators, otherwise merges
/// the fields in directly. Returns whether anything changed.
fn apply_update_content(document: &mut Document, update: &Document) -> bool {
    let mut changed = false;
    if update.keys().any(|key| key.starts_with('$')) {
        if let Ok(set) = update.get_document("$set") {
            for (key, value) in set {
                if document.get(key) != Some(value) {
                    document.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
        }
        if let Ok(unset) = update.get_document("$unset") {
            for key in unset.keys() {
                if document.remove(key).is_some() {
                    changed = true;
                }
            }
        }
    } else {
        for (key, value) in update {
            if document.get(key) != Some(value) {
                document.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    changed
}

fn apply_replace(
    documents: &mut Vec<Document>,
    filter: &Document,
    replacement: &Document,
    upsert: Option<bool>,
    multi: bool,
    result: &mut BatchResult,
) {
    let mut matched = 0u64;
    for document in documents.iter_mut() {
        if !matches(filter, document) {
            continue;
        }
        matched += 1;
        let id = document.get("_id").cloned();
        let mut replaced = replacement.clone();
        if let Some(id) = id {
            // The identity field survives replacement.
            replaced.insert("_id", id);
        }
        if *document != replaced {
            *document = replaced;
            result.n_modified += 1;
        }
        if !multi {
            break;
        }
    }

    if matched == 0 && upsert == Some(true) {
        let mut document = replacement.clone();
        for (key, value) in filter {
            if !document.contains_key(key) {
                document.insert(key.clone(), value.clone());
            }
        }
        let id = ensure_id(&mut document);
        documents.push(document);
        result.n_upserted += 1;
        result.upserted_ids.push(id);
    } else {
        result.n_matched += matched;
    }
}
