//! Record sources for chunked execution.
//!
//! Insert specs enumerate a synthetic index sequence with no I/O; every other
//! spec pulls real documents from the backing collection's cursor. Both are
//! driven through the same `next()` pull so the engine's queue loop does not
//! care which one it is draining.

use std::collections::VecDeque;

use async_trait::async_trait;
use bson::{Bson, Document};

/// A pull-based cursor over source documents.
///
/// Implemented for the driver's cursor and for materialized document lists,
/// so stores may hand back either.
#[async_trait]
pub trait RecordCursor: Send {
    /// The next document, or `None` once the source is exhausted.
    async fn next(&mut self) -> anyhow::Result<Option<Document>>;
}

#[async_trait]
impl RecordCursor for VecDeque<Document> {
    async fn next(&mut self) -> anyhow::Result<Option<Document>> {
        Ok(self.pop_front())
    }
}

#[async_trait]
impl RecordCursor for mongodb::Cursor<Document> {
    async fn next(&mut self) -> anyhow::Result<Option<Document>> {
        if self.advance().await? {
            let document: Document = self.current().try_into()?;
            Ok(Some(document))
        } else {
            Ok(None)
        }
    }
}

/// The record producer behind one chunked execution.
pub enum RecordSource {
    /// Synthetic sequence yielding indices `0..count`, used for inserts.
    Counter { next: u64, count: u64 },
    /// Documents pulled from the backing collection.
    Cursor(Box<dyn RecordCursor>),
}

impl RecordSource {
    pub fn counter(count: u64) -> Self {
        RecordSource::Counter { next: 0, count }
    }

    pub fn cursor(cursor: Box<dyn RecordCursor>) -> Self {
        RecordSource::Cursor(cursor)
    }

    /// Pulls the next record. Counter sources yield their index as a BSON
    /// int64; cursor sources yield the document itself.
    pub async fn next(&mut self) -> anyhow::Result<Option<Bson>> {
        match self {
            RecordSource::Counter { next, count } => {
                if *next >= *count {
                    return Ok(None);
                }
                let index = *next;
                *next += 1;
                Ok(Some(Bson::Int64(index as i64)))
            }
            RecordSource::Cursor(cursor) => Ok(cursor.next().await?.map(Bson::Document)),
        }
    }
}
