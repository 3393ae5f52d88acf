//! Raw per-batch results and the merged aggregate returned to callers.

use bson::{Bson, Document};
use serde::Deserialize;

/// A write error for a single operation inside an otherwise completed batch.
///
/// These are data, not failures: a batch that completes with per-item errors
/// still yields a `BatchResult`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteError {
    /// Position of the failing operation within the batch.
    pub index: u64,
    pub code: i32,
    #[serde(rename = "errmsg")]
    pub message: String,
}

/// A write-concern error reported for a whole batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteConcernError {
    pub code: i32,
    #[serde(rename = "errmsg")]
    pub message: String,
    #[serde(rename = "errInfo", default)]
    pub details: Option<Document>,
}

/// The raw outcome of one bulk-write call against the backing collection.
///
/// Counter names keep the server's legacy `n*` spelling so the mapping from
/// command replies stays mechanical.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Overall success flag of the call. `None` when the store reported no
    /// explicit flag; such batches do not affect the aggregate's `ok`.
    pub ok: Option<bool>,
    pub n_inserted: u64,
    pub n_upserted: u64,
    pub n_matched: u64,
    pub n_modified: u64,
    pub n_removed: u64,
    pub inserted_ids: Vec<Bson>,
    pub upserted_ids: Vec<Bson>,
    pub write_errors: Vec<WriteError>,
    pub write_concern_error: Option<WriteConcernError>,
    /// Last operation marker from the store reply, when one was present.
    pub last_op: Option<Bson>,
}

impl BatchResult {
    /// The canonical empty, successful result. Merging zero batches folds
    /// over this so callers always receive a well-formed aggregate.
    pub fn empty_ok() -> Self {
        BatchResult {
            ok: Some(true),
            ..Default::default()
        }
    }
}

/// The merged outcome of every batch executed for one bulk operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkResults {
    /// AND of every batch's explicit ok flag: one failing batch fails the
    /// aggregate no matter where it sat in the sequence.
    pub ok: bool,
    /// Legacy compatibility counter: the sum of per-batch `n_inserted`.
    /// Kept only because existing consumers read it; prefer the named
    /// accessors.
    pub n: u64,
    pub n_inserted: u64,
    pub n_upserted: u64,
    pub n_matched: u64,
    pub n_modified: u64,
    pub n_removed: u64,
    /// Inserted ids across all batches, in execution order.
    pub inserted_ids: Vec<Bson>,
    /// Upserted ids across all batches, in execution order.
    pub upserted_ids: Vec<Bson>,
    /// Write errors across all batches, in execution order.
    pub write_errors: Vec<WriteError>,
    /// Write-concern errors from batches that reported one.
    pub write_concern_errors: Vec<WriteConcernError>,
    /// The constituent raw results, for introspection.
    pub results: Vec<BatchResult>,
}

impl BulkResults {
    fn empty() -> Self {
        BulkResults {
            ok: true,
            n: 0,
            n_inserted: 0,
            n_upserted: 0,
            n_matched: 0,
            n_modified: 0,
            n_removed: 0,
            inserted_ids: Vec::new(),
            upserted_ids: Vec::new(),
            write_errors: Vec::new(),
            write_concern_errors: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Folds an ordered sequence of raw batch results into one aggregate.
    ///
    /// List fields concatenate in iteration order, which the engine keeps
    /// equal to execution order so error indexes stay debuggable. An empty
    /// input is replaced by the canonical empty/ok result.
    pub fn merge(results: Vec<BatchResult>) -> Self {
        let results = if results.is_empty() {
            vec![BatchResult::empty_ok()]
        } else {
            results
        };

        let mut merged = results.iter().fold(BulkResults::empty(), |acc, result| {
            acc.absorb(result)
        });
        merged.results = results;
        merged
    }

    fn absorb(mut self, result: &BatchResult) -> Self {
        if result.ok == Some(false) {
            self.ok = false;
        }
        self.n += result.n_inserted;
        self.n_inserted += result.n_inserted;
        self.n_upserted += result.n_upserted;
        self.n_matched += result.n_matched;
        self.n_modified += result.n_modified;
        self.n_removed += result.n_removed;
        self.inserted_ids.extend(result.inserted_ids.iter().cloned());
        self.upserted_ids.extend(result.upserted_ids.iter().cloned());
        self.write_errors.extend(result.write_errors.iter().cloned());
        if let Some(error) = &result.write_concern_error {
            self.write_concern_errors.push(error.clone());
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn inserted_count(&self) -> u64 {
        self.inserted_ids.len() as u64
    }

    pub fn deleted_count(&self) -> u64 {
        self.n_removed
    }

    pub fn matched_count(&self) -> u64 {
        self.n_matched
    }

    pub fn modified_count(&self) -> u64 {
        self.n_modified
    }

    pub fn upserted_count(&self) -> u64 {
        self.upserted_ids.len() as u64
    }
}
