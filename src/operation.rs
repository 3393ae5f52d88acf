//! Write operation descriptors and the per-record operation builder.

use std::fmt;
use std::str::FromStr;

use bson::{doc, Document};

use crate::error::BulkError;

/// The four high-level bulk operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Replace,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
        }
    }

    /// Whether operations of this type carry an upsert flag.
    pub fn supports_upsert(&self) -> bool {
        matches!(self, OperationType::Update | OperationType::Replace)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationType::Insert),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            "replace" => Ok(OperationType::Replace),
            other => Err(BulkError::config(format!(
                "Invalid option format: \"type\" - unsupported operation \"{other}\""
            ))),
        }
    }
}

/// A single bulk-write operation, mirroring the driver's bulkWrite entries.
///
/// Update and replace variants carry the upsert flag as an `Option` so the
/// wire form can omit it entirely when it was never configured; insert and
/// delete never carry one.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    InsertOne {
        filter: Document,
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: Option<bool>,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: Option<bool>,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: Option<bool>,
    },
    ReplaceMany {
        filter: Document,
        replacement: Document,
        upsert: Option<bool>,
    },
}

impl WriteOperation {
    /// The filter the operation targets.
    pub fn filter(&self) -> &Document {
        match self {
            WriteOperation::InsertOne { filter, .. }
            | WriteOperation::UpdateOne { filter, .. }
            | WriteOperation::UpdateMany { filter, .. }
            | WriteOperation::DeleteOne { filter }
            | WriteOperation::DeleteMany { filter }
            | WriteOperation::ReplaceOne { filter, .. }
            | WriteOperation::ReplaceMany { filter, .. } => filter,
        }
    }

    /// Renders the operation in the driver's bulkWrite wire shape, e.g.
    /// `{ "updateOne": { "filter": .., "update": .., "upsert": true } }`.
    /// The upsert key is omitted when unset.
    pub fn to_document(&self) -> Document {
        match self {
            WriteOperation::InsertOne { filter, document } => doc! {
                "insertOne": { "filter": filter.clone(), "document": document.clone() },
            },
            WriteOperation::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let mut op = doc! { "filter": filter.clone(), "update": update.clone() };
                if let Some(upsert) = upsert {
                    op.insert("upsert", *upsert);
                }
                doc! { "updateOne": op }
            }
            WriteOperation::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let mut op = doc! { "filter": filter.clone(), "update": update.clone() };
                if let Some(upsert) = upsert {
                    op.insert("upsert", *upsert);
                }
                doc! { "updateMany": op }
            }
            WriteOperation::DeleteOne { filter } => doc! {
                "deleteOne": { "filter": filter.clone() },
            },
            WriteOperation::DeleteMany { filter } => doc! {
                "deleteMany": { "filter": filter.clone() },
            },
            WriteOperation::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                let mut op = doc! { "filter": filter.clone(), "replacement": replacement.clone() };
                if let Some(upsert) = upsert {
                    op.insert("upsert", *upsert);
                }
                doc! { "replaceOne": op }
            }
            WriteOperation::ReplaceMany {
                filter,
                replacement,
                upsert,
            } => {
                let mut op = doc! { "filter": filter.clone(), "replacement": replacement.clone() };
                if let Some(upsert) = upsert {
                    op.insert("upsert", *upsert);
                }
                doc! { "replaceMany": op }
            }
        }
    }
}

/// Builds one write operation from an operation type, content, filter and
/// cardinality. Content is cloned into the operation so later mutation of the
/// caller's document cannot alias into an already-built batch. The upsert flag
/// is attached only for update/replace; insert ignores `many` since bulkWrite
/// has no insertMany entry.
pub fn build_operation(
    operation: OperationType,
    content: &Document,
    filter: Document,
    many: bool,
    upsert: Option<bool>,
) -> WriteOperation {
    match (operation, many) {
        (OperationType::Insert, _) => WriteOperation::InsertOne {
            filter,
            document: content.clone(),
        },
        (OperationType::Update, false) => WriteOperation::UpdateOne {
            filter,
            update: content.clone(),
            upsert,
        },
        (OperationType::Update, true) => WriteOperation::UpdateMany {
            filter,
            update: content.clone(),
            upsert,
        },
        (OperationType::Delete, false) => WriteOperation::DeleteOne { filter },
        (OperationType::Delete, true) => WriteOperation::DeleteMany { filter },
        (OperationType::Replace, false) => WriteOperation::ReplaceOne {
            filter,
            replacement: content.clone(),
            upsert,
        },
        (OperationType::Replace, true) => WriteOperation::ReplaceMany {
            filter,
            replacement: content.clone(),
            upsert,
        },
    }
}
