//! The bulk-write engine: validation, routing, and the chunked queue loop.

use std::sync::Arc;

use bson::{Bson, Document};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::BulkError;
use crate::operation::{build_operation, OperationType, WriteOperation};
use crate::options::{BulkOptions, DocumentSpec, OperationsSpec};
use crate::results::{BatchResult, BulkResults};
use crate::source::RecordSource;
use crate::store::{resolve_collection, BulkCollection};

/// One configured bulk operation, ready to execute.
///
/// Construction validates the options synchronously; no I/O happens until
/// [`execute`](BulkWrite::execute). The collection handle is resolved once,
/// on first use, and reused for every batch the execution issues.
///
/// Execution is sequential: batches are derived, submitted and awaited one
/// at a time, in source order. There is no cancellation; callers that race
/// `execute` externally must accept that already-submitted batches stay
/// applied. A source cursor that never terminates will keep the engine
/// pulling forever.
pub struct BulkWrite {
    options: BulkOptions,
    collection: OnceCell<Arc<dyn BulkCollection>>,
}

impl BulkWrite {
    /// Validates `options` and builds an engine for them. Every violated
    /// rule is reported in the one returned error.
    pub fn new(options: BulkOptions) -> Result<Self, BulkError> {
        options.ensure_valid()?;
        Ok(BulkWrite {
            options,
            collection: OnceCell::new(),
        })
    }

    pub fn options(&self) -> &BulkOptions {
        &self.options
    }

    /// The resolved collection handle. Resolution happens on the first call
    /// and is memoized; connection errors surface here.
    pub async fn collection(&self) -> Result<&Arc<dyn BulkCollection>, BulkError> {
        self.collection
            .get_or_try_init(|| resolve_collection(&self.options))
            .await
    }

    /// Runs the configured operation and merges every issued batch into one
    /// aggregate result.
    pub async fn execute(&self) -> Result<BulkResults, BulkError> {
        let results = match (&self.options.operations, self.options.operation) {
            (Some(operations), _) => self.execute_prebuilt(operations).await?,
            (None, Some(operation)) => {
                if self.is_chunked(operation) {
                    self.execute_chunked(operation).await?
                } else {
                    self.execute_direct(operation).await?
                }
            }
            // ensure_valid rejects this; kept as an error rather than a panic.
            (None, None) => {
                return Err(BulkError::config(r#"Missing option: "type""#));
            }
        };

        let merged = BulkResults::merge(results);
        let collection = self.collection().await?;
        info!(
            collection = collection.name(),
            batches = merged.results.len(),
            ok = merged.ok,
            "bulk operation finished"
        );
        Ok(merged)
    }

    /// Chunked execution derives one operation per source record. That is
    /// only needed when records are enumerated: inserts (synthetic source)
    /// and mapper documents (per-record content). A fixed document over a
    /// filter is a single `...Many` call instead.
    fn is_chunked(&self, operation: OperationType) -> bool {
        operation == OperationType::Insert
            || self
                .options
                .document
                .as_ref()
                .is_some_and(DocumentSpec::is_mapper)
    }

    async fn execute_prebuilt(
        &self,
        operations: &OperationsSpec,
    ) -> Result<Vec<BatchResult>, BulkError> {
        let operations = match operations {
            OperationsSpec::List(list) => list.clone(),
            OperationsSpec::Factory(factory) => {
                factory.operations().await.map_err(BulkError::Store)?
            }
        };
        debug!(operations = operations.len(), "submitting prebuilt operations");
        let result = self.bulk_write(&operations).await?;
        Ok(vec![result])
    }

    async fn execute_direct(
        &self,
        operation: OperationType,
    ) -> Result<Vec<BatchResult>, BulkError> {
        let content = match &self.options.document {
            Some(DocumentSpec::Document(document)) => document.clone(),
            _ => Document::new(),
        };
        let upsert = self.upsert_flag(operation);
        let built = build_operation(
            operation,
            &content,
            self.options.filter.clone(),
            true,
            upsert,
        );
        debug!(operation = %operation, "executing as a single many-operation");
        let result = self.bulk_write(std::slice::from_ref(&built)).await?;
        Ok(vec![result])
    }

    async fn execute_chunked(
        &self,
        operation: OperationType,
    ) -> Result<Vec<BatchResult>, BulkError> {
        let mut source = self.source(operation).await?;
        let concurrency = self.options.concurrency();
        let mut queue: Vec<Bson> = Vec::new();
        let mut results: Vec<BatchResult> = Vec::new();
        let mut next_index: u64 = 0;
        let mut pulled: u64 = 0;

        while let Some(record) = source.next().await.map_err(BulkError::Store)? {
            pulled += 1;
            queue.push(record);
            if queue.len() >= concurrency {
                self.flush(operation, &mut queue, &mut next_index, &mut results)
                    .await?;
            }
        }

        if pulled == 0 && operation != OperationType::Insert {
            warn!(filter = %self.options.filter, "no documents matched the bulk filter");
        }

        // Final flush; a no-op when nothing is queued.
        self.flush(operation, &mut queue, &mut next_index, &mut results)
            .await?;

        debug!(records = pulled, batches = results.len(), "chunked execution drained source");
        Ok(results)
    }

    async fn source(&self, operation: OperationType) -> Result<RecordSource, BulkError> {
        if operation == OperationType::Insert {
            Ok(RecordSource::counter(self.options.count()))
        } else {
            let collection = self.collection().await?;
            let cursor = collection
                .find(self.options.filter.clone())
                .await
                .map_err(BulkError::Store)?;
            Ok(RecordSource::cursor(cursor))
        }
    }

    /// Converts the queued records into one batch and submits it. Drains
    /// the queue so the caller can keep reusing it.
    async fn flush(
        &self,
        operation: OperationType,
        queue: &mut Vec<Bson>,
        next_index: &mut u64,
        results: &mut Vec<BatchResult>,
    ) -> Result<(), BulkError> {
        if queue.is_empty() {
            return Ok(());
        }

        let upsert = self.upsert_flag(operation);
        let mut operations = Vec::with_capacity(queue.len());
        for record in queue.drain(..) {
            let index = *next_index;
            *next_index += 1;
            let content = self.record_content(&record, index).await?;
            let filter = self.correlation_filter(&record);
            operations.push(build_operation(operation, &content, filter, false, upsert));
        }

        debug!(batch = operations.len(), "flushing batch");
        let result = self.bulk_write(&operations).await?;
        results.push(result);
        Ok(())
    }

    /// Derives the content for one record: the fixed document verbatim, or
    /// the mapper's output, which must be a document.
    async fn record_content(&self, record: &Bson, index: u64) -> Result<Document, BulkError> {
        match &self.options.document {
            Some(DocumentSpec::Document(document)) => Ok(document.clone()),
            Some(DocumentSpec::Mapper(mapper)) => {
                let value = mapper.map(record, index).await.map_err(BulkError::Store)?;
                match value {
                    Bson::Document(document) => Ok(document),
                    other => Err(BulkError::InvalidDocument(format!(
                        "{:?}",
                        other.element_type()
                    ))),
                }
            }
            // Delete specs have no content.
            None => Ok(Document::new()),
        }
    }

    /// `{id_field: record[id_field]}`, targeting exactly one document when
    /// iterating a real source. Synthetic insert records have no id field
    /// and get a null correlation value, which inserts ignore.
    fn correlation_filter(&self, record: &Bson) -> Document {
        let id_field = self.options.id_field();
        let id = record
            .as_document()
            .and_then(|document| document.get(id_field))
            .cloned()
            .unwrap_or(Bson::Null);
        let mut filter = Document::new();
        filter.insert(id_field, id);
        filter
    }

    fn upsert_flag(&self, operation: OperationType) -> Option<bool> {
        if operation.supports_upsert() {
            self.options.upsert
        } else {
            None
        }
    }

    async fn bulk_write(&self, operations: &[WriteOperation]) -> Result<BatchResult, BulkError> {
        let collection = self.collection().await?;
        collection
            .bulk_write(operations, &self.options.write_options)
            .await
            .map_err(BulkError::Store)
    }
}
