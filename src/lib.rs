//! mongo-bulk
//!
//! A convenience layer over MongoDB's bulk-write API. Callers describe an
//! insert/update/delete/replace intent as a fixed document, a per-record
//! mapping function, or a prebuilt operation list, and the engine turns it
//! into one or more batched bulk-write calls, merging the partial results
//! into a single [`BulkResults`].
//!
//! # Execution model
//!
//! - A fixed document with a filter becomes a single `...Many` operation.
//! - Inserts and mapper documents run *chunked*: the source (a synthetic
//!   index sequence for inserts, a `find` cursor otherwise) is streamed
//!   through a bounded queue and flushed as batches of at most
//!   `concurrency` operations, sequentially and in order.
//! - Prebuilt `operations` are submitted as-is in one call.
//!
//! # Example
//!
//! ```no_run
//! use bson::{doc, Bson};
//! use mongo_bulk::{bulk_insert, BulkOptions, DocumentSpec};
//!
//! # async fn example() -> Result<(), mongo_bulk::BulkError> {
//! let results = bulk_insert(BulkOptions {
//!     collection: Some("users".into()),
//!     db: Some("mongodb://localhost:27017/app".into()),
//!     count: Some(3),
//!     document: Some(DocumentSpec::mapper(|_record: &Bson, index| {
//!         Bson::Document(doc! { "seq": index as i64 })
//!     })),
//!     ..Default::default()
//! })
//! .await?;
//! assert_eq!(results.inserted_count(), 3);
//! # Ok(())
//! # }
//! ```

mod error;
mod operation;
mod options;
mod results;
mod source;
mod store;
pub mod testing;
mod write;

pub use error::BulkError;
pub use operation::{build_operation, OperationType, WriteOperation};
pub use options::{
    BulkOptions, DocumentMapper, DocumentSpec, OperationFactory, OperationsSpec, WriteOptions,
};
pub use results::{BatchResult, BulkResults, WriteConcernError, WriteError};
pub use source::{RecordCursor, RecordSource};
pub use store::{BulkCollection, DbSpec, MongoCollection, Target};
pub use write::BulkWrite;

/// Builds and executes a bulk operation in one call.
pub async fn bulk_write(options: BulkOptions) -> Result<BulkResults, BulkError> {
    BulkWrite::new(options)?.execute().await
}

/// [`bulk_write`] with the operation fixed to insert.
pub async fn bulk_insert(mut options: BulkOptions) -> Result<BulkResults, BulkError> {
    options.operation = Some(OperationType::Insert);
    bulk_write(options).await
}

/// [`bulk_write`] with the operation fixed to update.
pub async fn bulk_update(mut options: BulkOptions) -> Result<BulkResults, BulkError> {
    options.operation = Some(OperationType::Update);
    bulk_write(options).await
}

/// [`bulk_write`] with the operation fixed to delete.
pub async fn bulk_delete(mut options: BulkOptions) -> Result<BulkResults, BulkError> {
    options.operation = Some(OperationType::Delete);
    bulk_write(options).await
}

/// [`bulk_write`] with the operation fixed to replace.
pub async fn bulk_replace(mut options: BulkOptions) -> Result<BulkResults, BulkError> {
    options.operation = Some(OperationType::Replace);
    bulk_write(options).await
}
