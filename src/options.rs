//! Bulk operation configuration and its validation.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::BulkError;
use crate::operation::{OperationType, WriteOperation};
use crate::store::{DbSpec, Target};

/// Derives per-record content for chunked execution.
///
/// `record` is the source document for update/replace/delete specs and the
/// synthetic index (as a BSON int64) for insert specs; `index` is the
/// record's position in the overall stream. Implementations must return a
/// `Bson::Document`; anything else aborts the run with
/// [`BulkError::InvalidDocument`]. Plain closures get a blanket
/// implementation; mappers that need to await something implement the trait
/// directly.
#[async_trait]
pub trait DocumentMapper: Send + Sync {
    async fn map(&self, record: &Bson, index: u64) -> anyhow::Result<Bson>;
}

#[async_trait]
impl<F> DocumentMapper for F
where
    F: Fn(&Bson, u64) -> Bson + Send + Sync,
{
    async fn map(&self, record: &Bson, index: u64) -> anyhow::Result<Bson> {
        Ok(self(record, index))
    }
}

/// The content side of a spec: a fixed document applied as-is, or a mapper
/// invoked once per source record.
#[derive(Clone)]
pub enum DocumentSpec {
    Document(Document),
    Mapper(Arc<dyn DocumentMapper>),
}

impl DocumentSpec {
    pub fn mapper<F>(f: F) -> Self
    where
        F: Fn(&Bson, u64) -> Bson + Send + Sync + 'static,
    {
        DocumentSpec::Mapper(Arc::new(f))
    }

    pub fn is_mapper(&self) -> bool {
        matches!(self, DocumentSpec::Mapper(_))
    }
}

impl From<Document> for DocumentSpec {
    fn from(document: Document) -> Self {
        DocumentSpec::Document(document)
    }
}

/// Produces a prebuilt operation list on demand.
#[async_trait]
pub trait OperationFactory: Send + Sync {
    async fn operations(&self) -> anyhow::Result<Vec<WriteOperation>>;
}

#[async_trait]
impl<F> OperationFactory for F
where
    F: Fn() -> Vec<WriteOperation> + Send + Sync,
{
    async fn operations(&self) -> anyhow::Result<Vec<WriteOperation>> {
        Ok(self())
    }
}

/// Prebuilt operations: a static list, or a zero-argument factory awaited at
/// execution time. Either bypasses operation derivation entirely.
#[derive(Clone)]
pub enum OperationsSpec {
    List(Vec<WriteOperation>),
    Factory(Arc<dyn OperationFactory>),
}

impl OperationsSpec {
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> Vec<WriteOperation> + Send + Sync + 'static,
    {
        OperationsSpec::Factory(Arc::new(f))
    }
}

impl From<Vec<WriteOperation>> for OperationsSpec {
    fn from(operations: Vec<WriteOperation>) -> Self {
        OperationsSpec::List(operations)
    }
}

/// Options forwarded with every bulk-write call to the backing collection.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    /// Ordered execution: the store stops at the first failing operation
    /// within a batch instead of continuing.
    pub ordered: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions { ordered: true }
    }
}

/// Configuration for one bulk operation. Immutable once handed to
/// [`BulkWrite::new`](crate::BulkWrite::new), which validates it.
///
/// Exactly one of `operations` and `operation` must be supplied, and
/// `document` is required unless the operation is a delete or `operations`
/// is present.
#[derive(Clone, Default)]
pub struct BulkOptions {
    /// Target collection: a pre-connected handle, or a name resolved
    /// against `db`.
    pub collection: Option<Target>,
    /// Database to resolve a named collection against.
    pub db: Option<DbSpec>,
    /// High-level operation kind (the original API's `type`).
    pub operation: Option<OperationType>,
    /// Fixed content or per-record mapper.
    pub document: Option<DocumentSpec>,
    /// Which documents the operation targets. Empty matches everything.
    pub filter: Document,
    /// Field used to correlate a source record to its write target.
    /// Defaults to `_id`.
    pub id_field: Option<String>,
    /// Upsert flag for update/replace operations. `None` leaves the flag
    /// off built operations entirely.
    pub upsert: Option<bool>,
    /// Queue flush threshold for chunked execution. This is a batch-size
    /// bound, not a parallelism degree: batches are still issued one at a
    /// time, in order. Defaults to 1000.
    pub concurrency: Option<usize>,
    /// Number of synthetic records for insert specs. Defaults to 1.
    pub count: Option<u64>,
    /// Prebuilt operations, bypassing derivation.
    pub operations: Option<OperationsSpec>,
    /// Options passed through to every bulk-write call.
    pub write_options: WriteOptions,
}

pub(crate) const DEFAULT_ID_FIELD: &str = "_id";
pub(crate) const DEFAULT_CONCURRENCY: usize = 1000;
pub(crate) const DEFAULT_COUNT: u64 = 1;

impl BulkOptions {
    pub(crate) fn id_field(&self) -> &str {
        self.id_field.as_deref().unwrap_or(DEFAULT_ID_FIELD)
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.unwrap_or(DEFAULT_COUNT)
    }

    /// Checks every rule and reports all violations in one combined error,
    /// so a misconfigured caller learns everything at once.
    pub(crate) fn ensure_valid(&self) -> Result<(), BulkError> {
        let mut violations = Vec::new();

        match (&self.collection, &self.db) {
            (None, _) => violations.push(r#"Missing required option: "collection""#.to_string()),
            (Some(Target::Name(_)), None) => {
                violations.push(r#"Missing option: "db""#.to_string())
            }
            _ => {}
        }

        match (&self.operations, &self.operation) {
            (None, None) => {
                violations.push(r#"Missing option: "operations""#.to_string());
                violations.push(r#"Missing option: "type""#.to_string());
            }
            (Some(_), Some(_)) => violations.push(
                r#"Conflicting options: supply either "operations" or "type""#.to_string(),
            ),
            _ => {}
        }

        let needs_document = self.operations.is_none()
            && matches!(
                self.operation,
                Some(OperationType::Insert)
                    | Some(OperationType::Update)
                    | Some(OperationType::Replace)
            );
        if needs_document && self.document.is_none() {
            violations.push(r#"Missing required option: "document""#.to_string());
        }

        if self.concurrency == Some(0) {
            violations.push(r#"Invalid option format: "concurrency" must be positive"#.to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(BulkError::Config(violations))
        }
    }
}
