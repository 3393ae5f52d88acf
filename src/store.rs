//! The backing-store seam and its MongoDB implementation.
//!
//! The engine only ever talks to a [`BulkCollection`]: something that can
//! `find` documents and accept batches of write operations. The shipped
//! implementation targets MongoDB by translating each batch into the native
//! `insert`/`update`/`delete` write commands, which is how drivers implement
//! bulkWrite themselves. Tests substitute the in-memory collection from
//! [`crate::testing`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

use crate::error::BulkError;
use crate::options::{BulkOptions, WriteOptions};
use crate::operation::WriteOperation;
use crate::results::{BatchResult, WriteError};
use crate::source::RecordCursor;

/// A collection that can serve source documents and accept bulk writes.
///
/// `bulk_write` must honour `WriteOptions::ordered`: when set, the store
/// stops at the first failing operation in the batch. Per-operation failures
/// are reported as data on the returned [`BatchResult`]; only an outright
/// call failure is an `Err`.
#[async_trait]
pub trait BulkCollection: Send + Sync {
    fn name(&self) -> &str;

    /// A cursor over the documents matching `filter`.
    async fn find(&self, filter: Document) -> anyhow::Result<Box<dyn RecordCursor>>;

    /// Executes one batch of operations, in order, as a single call.
    async fn bulk_write(
        &self,
        operations: &[WriteOperation],
        options: &WriteOptions,
    ) -> anyhow::Result<BatchResult>;
}

/// The target collection of a bulk operation.
#[derive(Clone)]
pub enum Target {
    /// A pre-connected collection handle (including test doubles).
    Handle(Arc<dyn BulkCollection>),
    /// A collection name, resolved against [`BulkOptions::db`].
    Name(String),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<Arc<dyn BulkCollection>> for Target {
    fn from(handle: Arc<dyn BulkCollection>) -> Self {
        Target::Handle(handle)
    }
}

/// The database a named collection is resolved against.
#[derive(Clone)]
pub enum DbSpec {
    /// Connection string; the database name is taken from its path.
    Uri(String),
    /// An already-connected database handle.
    Database(Database),
}

impl From<&str> for DbSpec {
    fn from(uri: &str) -> Self {
        DbSpec::Uri(uri.to_string())
    }
}

impl From<String> for DbSpec {
    fn from(uri: String) -> Self {
        DbSpec::Uri(uri)
    }
}

impl From<Database> for DbSpec {
    fn from(database: Database) -> Self {
        DbSpec::Database(database)
    }
}

/// Resolves the configured target into a usable collection handle.
/// Connection errors surface here, not at option validation.
pub(crate) async fn resolve_collection(
    options: &BulkOptions,
) -> Result<Arc<dyn BulkCollection>, BulkError> {
    match &options.collection {
        Some(Target::Handle(handle)) => Ok(handle.clone()),
        Some(Target::Name(name)) => {
            let database = match &options.db {
                Some(DbSpec::Database(database)) => database.clone(),
                Some(DbSpec::Uri(uri)) => connect(uri).await?,
                None => return Err(BulkError::config(r#"Missing option: "db""#)),
            };
            tracing::debug!(collection = %name, "resolved collection handle");
            Ok(Arc::new(MongoCollection::new(database, name.clone())))
        }
        None => Err(BulkError::config(r#"Missing required option: "collection""#)),
    }
}

async fn connect(uri: &str) -> Result<Database, BulkError> {
    tracing::debug!("parsing MongoDB connection options");
    let mut client_options = ClientOptions::parse(uri).await?;
    // Bounded timeouts so a bad URI fails instead of hanging.
    client_options.connect_timeout = Some(Duration::from_secs(10));
    client_options.server_selection_timeout = Some(Duration::from_secs(10));
    let client = Client::with_options(client_options)?;
    client.default_database().ok_or_else(|| {
        BulkError::config(r#"Invalid option format: "db" - connection string names no database"#)
    })
}

/// MongoDB-backed [`BulkCollection`].
///
/// Batches are executed as the native write commands: consecutive operations
/// of the same kind are grouped into one `insert`, `update` or `delete`
/// command, preserving batch order. Update and replace operations both ride
/// the `update` command; the server enforces the replacement-document rules.
pub struct MongoCollection {
    database: Database,
    name: String,
}

impl MongoCollection {
    pub fn new(database: Database, name: impl Into<String>) -> Self {
        MongoCollection {
            database,
            name: name.into(),
        }
    }
}

#[async_trait]
impl BulkCollection for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: Document) -> anyhow::Result<Box<dyn RecordCursor>> {
        let cursor = self
            .database
            .collection::<Document>(&self.name)
            .find(filter)
            .await?;
        Ok(Box::new(cursor))
    }

    async fn bulk_write(
        &self,
        operations: &[WriteOperation],
        options: &WriteOptions,
    ) -> anyhow::Result<BatchResult> {
        execute_batch(&self.database, &self.name, operations, options).await
    }
}

/// Runs one raw write command. The seam between the batch loop and the
/// driver, so the loop can be exercised against scripted replies.
#[async_trait]
trait RunCommand: Sync {
    async fn run(&self, command: Document) -> anyhow::Result<Document>;
}

#[async_trait]
impl RunCommand for Database {
    async fn run(&self, command: Document) -> anyhow::Result<Document> {
        Ok(self.run_command(command).await?)
    }
}

/// Executes one batch: consecutive same-kind operations become one command
/// each, in batch order. Under ordered execution the loop stops after the
/// first group that reports write errors; later groups are never sent.
async fn execute_batch<R: RunCommand>(
    runner: &R,
    collection: &str,
    operations: &[WriteOperation],
    options: &WriteOptions,
) -> anyhow::Result<BatchResult> {
    if operations.is_empty() {
        return Ok(BatchResult::empty_ok());
    }

    let mut result = BatchResult::default();
    let mut base: u64 = 0;

    for (kind, group) in group_consecutive(operations) {
        let reply = match kind {
            CommandKind::Insert => {
                let (command, ids) = insert_command(collection, group, options);
                let reply = runner.run(command).await?;
                let failed = absorb_reply(&mut result, &reply, base)?;
                result.n_inserted += reply_count(&reply, "n");
                for (offset, id) in ids.into_iter().enumerate() {
                    if !failed.contains(&(offset as u64)) {
                        result.inserted_ids.push(id);
                    }
                }
                reply
            }
            CommandKind::Update => {
                let command = update_command(collection, group, options);
                let reply = runner.run(command).await?;
                absorb_reply(&mut result, &reply, base)?;
                let upserted = upserted_ids(&reply);
                let matched_or_upserted = reply_count(&reply, "n");
                result.n_upserted += upserted.len() as u64;
                result.n_matched +=
                    matched_or_upserted.saturating_sub(upserted.len() as u64);
                result.n_modified += reply_count(&reply, "nModified");
                result.upserted_ids.extend(upserted);
                reply
            }
            CommandKind::Delete => {
                let command = delete_command(collection, group, options);
                let reply = runner.run(command).await?;
                absorb_reply(&mut result, &reply, base)?;
                result.n_removed += reply_count(&reply, "n");
                reply
            }
        };

        tracing::trace!(?kind, batch = group.len(), ok = ?reply_ok(&reply), "write command completed");
        base += group.len() as u64;

        if options.ordered && !result.write_errors.is_empty() {
            // Ordered execution stops at the first failing operation.
            break;
        }
    }

    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Insert,
    Update,
    Delete,
}

fn command_kind(operation: &WriteOperation) -> CommandKind {
    match operation {
        WriteOperation::InsertOne { .. } => CommandKind::Insert,
        WriteOperation::UpdateOne { .. }
        | WriteOperation::UpdateMany { .. }
        | WriteOperation::ReplaceOne { .. }
        | WriteOperation::ReplaceMany { .. } => CommandKind::Update,
        WriteOperation::DeleteOne { .. } | WriteOperation::DeleteMany { .. } => CommandKind::Delete,
    }
}

fn group_consecutive(
    operations: &[WriteOperation],
) -> Vec<(CommandKind, &[WriteOperation])> {
    let mut groups = Vec::new();
    let mut start = 0;
    for end in 1..=operations.len() {
        if end == operations.len()
            || command_kind(&operations[end]) != command_kind(&operations[start])
        {
            groups.push((command_kind(&operations[start]), &operations[start..end]));
            start = end;
        }
    }
    groups
}

/// Builds an `insert` command, assigning ids to documents that lack one so
/// the inserted-id list can be reported back.
fn insert_command(
    collection: &str,
    operations: &[WriteOperation],
    options: &WriteOptions,
) -> (Document, Vec<Bson>) {
    let mut documents = Vec::with_capacity(operations.len());
    let mut ids = Vec::with_capacity(operations.len());
    for operation in operations {
        if let WriteOperation::InsertOne { document, .. } = operation {
            let mut document = document.clone();
            let id = match document.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    document.insert("_id", id.clone());
                    id
                }
            };
            ids.push(id);
            documents.push(document);
        }
    }
    let command = doc! {
        "insert": collection,
        "documents": documents,
        "ordered": options.ordered,
    };
    (command, ids)
}

fn update_command(
    collection: &str,
    operations: &[WriteOperation],
    options: &WriteOptions,
) -> Document {
    let mut updates = Vec::with_capacity(operations.len());
    for operation in operations {
        let entry = match operation {
            WriteOperation::UpdateOne {
                filter,
                update,
                upsert,
            } => update_entry(filter, update, false, *upsert),
            WriteOperation::UpdateMany {
                filter,
                update,
                upsert,
            } => update_entry(filter, update, true, *upsert),
            WriteOperation::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => update_entry(filter, replacement, false, *upsert),
            WriteOperation::ReplaceMany {
                filter,
                replacement,
                upsert,
            } => update_entry(filter, replacement, true, *upsert),
            _ => continue,
        };
        updates.push(entry);
    }
    doc! {
        "update": collection,
        "updates": updates,
        "ordered": options.ordered,
    }
}

fn update_entry(filter: &Document, content: &Document, multi: bool, upsert: Option<bool>) -> Document {
    let mut entry = doc! {
        "q": filter.clone(),
        "u": content.clone(),
        "multi": multi,
    };
    if let Some(upsert) = upsert {
        entry.insert("upsert", upsert);
    }
    entry
}

fn delete_command(
    collection: &str,
    operations: &[WriteOperation],
    options: &WriteOptions,
) -> Document {
    let mut deletes = Vec::with_capacity(operations.len());
    for operation in operations {
        let entry = match operation {
            WriteOperation::DeleteOne { filter } => doc! { "q": filter.clone(), "limit": 1 },
            WriteOperation::DeleteMany { filter } => doc! { "q": filter.clone(), "limit": 0 },
            _ => continue,
        };
        deletes.push(entry);
    }
    doc! {
        "delete": collection,
        "deletes": deletes,
        "ordered": options.ordered,
    }
}

/// Folds the command-independent parts of a reply into `result`: the ok
/// flag (AND-combined across commands), write errors with their indexes
/// rebased onto batch positions, the write-concern error and the last
/// operation marker. Returns the command-relative indexes that failed.
fn absorb_reply(
    result: &mut BatchResult,
    reply: &Document,
    base: u64,
) -> anyhow::Result<HashSet<u64>> {
    match (result.ok, reply_ok(reply)) {
        (_, None) => {}
        (None, Some(ok)) => result.ok = Some(ok),
        (Some(previous), Some(ok)) => result.ok = Some(previous && ok),
    }

    let mut failed = HashSet::new();
    if let Some(Bson::Array(errors)) = reply.get("writeErrors") {
        for raw in errors {
            let mut error: WriteError = bson::from_bson(raw.clone())?;
            failed.insert(error.index);
            error.index += base;
            result.write_errors.push(error);
        }
    }

    if let Some(raw) = reply.get("writeConcernError") {
        result.write_concern_error = Some(bson::from_bson(raw.clone())?);
    }

    if let Some(marker) = reply.get("operationTime") {
        result.last_op = Some(marker.clone());
    }

    Ok(failed)
}

fn upserted_ids(reply: &Document) -> Vec<Bson> {
    let mut ids = Vec::new();
    if let Some(Bson::Array(entries)) = reply.get("upserted") {
        for entry in entries {
            if let Some(id) = entry.as_document().and_then(|d| d.get("_id")) {
                ids.push(id.clone());
            }
        }
    }
    ids
}

fn reply_count(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(value)) => (*value).max(0) as u64,
        Some(Bson::Int64(value)) => (*value).max(0) as u64,
        Some(Bson::Double(value)) => value.max(0.0) as u64,
        _ => 0,
    }
}

fn reply_ok(reply: &Document) -> Option<bool> {
    match reply.get("ok") {
        Some(Bson::Int32(value)) => Some(*value != 0),
        Some(Bson::Int64(value)) => Some(*value != 0),
        Some(Bson::Double(value)) => Some(*value != 0.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn insert_op(id: i32) -> WriteOperation {
        WriteOperation::InsertOne {
            filter: Document::new(),
            document: doc! { "_id": id },
        }
    }

    fn delete_op() -> WriteOperation {
        WriteOperation::DeleteOne {
            filter: doc! { "kind": "stale" },
        }
    }

    #[test]
    fn consecutive_operations_group_by_command_kind() {
        let operations = vec![insert_op(1), insert_op(2), delete_op(), insert_op(3)];
        let groups = group_consecutive(&operations);

        let kinds: Vec<(CommandKind, usize)> =
            groups.iter().map(|(kind, ops)| (*kind, ops.len())).collect();
        assert_eq!(
            kinds,
            vec![
                (CommandKind::Insert, 2),
                (CommandKind::Delete, 1),
                (CommandKind::Insert, 1),
            ]
        );
    }

    #[test]
    fn replace_operations_ride_the_update_command() {
        let operation = WriteOperation::ReplaceOne {
            filter: doc! { "_id": 1 },
            replacement: doc! { "name": "after" },
            upsert: Some(true),
        };
        assert_eq!(command_kind(&operation), CommandKind::Update);

        let command = update_command("users", std::slice::from_ref(&operation), &WriteOptions::default());
        let updates = command.get_array("updates").unwrap();
        let entry = updates[0].as_document().unwrap();
        assert_eq!(entry.get_document("u").unwrap(), &doc! { "name": "after" });
        assert_eq!(entry.get_bool("multi").unwrap(), false);
        assert_eq!(entry.get_bool("upsert").unwrap(), true);
    }

    #[test]
    fn insert_command_assigns_missing_ids() {
        let operations = vec![WriteOperation::InsertOne {
            filter: Document::new(),
            document: doc! { "name": "anonymous" },
        }];
        let (command, ids) = insert_command("users", &operations, &WriteOptions::default());

        assert_eq!(ids.len(), 1);
        assert!(matches!(ids[0], Bson::ObjectId(_)));
        let sent = command.get_array("documents").unwrap()[0]
            .as_document()
            .unwrap();
        assert_eq!(sent.get("_id"), Some(&ids[0]));
        assert!(command.get_bool("ordered").unwrap());
    }

    #[test]
    fn delete_command_uses_limit_for_cardinality() {
        let operations = vec![
            WriteOperation::DeleteOne {
                filter: doc! { "a": 1 },
            },
            WriteOperation::DeleteMany {
                filter: doc! { "b": 2 },
            },
        ];
        let command = delete_command("users", &operations, &WriteOptions::default());
        let deletes = command.get_array("deletes").unwrap();
        assert_eq!(deletes[0].as_document().unwrap().get_i32("limit").unwrap(), 1);
        assert_eq!(deletes[1].as_document().unwrap().get_i32("limit").unwrap(), 0);
    }

    #[test]
    fn absorb_reply_rebases_write_error_indexes() {
        let mut result = BatchResult::default();
        let reply = doc! {
            "ok": 1.0,
            "n": 2,
            "writeErrors": [ { "index": 1, "code": 11000, "errmsg": "dup" } ],
        };

        let failed = absorb_reply(&mut result, &reply, 10).unwrap();
        assert!(failed.contains(&1));
        assert_eq!(result.write_errors[0].index, 11);
        assert_eq!(result.ok, Some(true));
    }

    #[test]
    fn absorb_reply_ands_the_ok_flag_across_commands() {
        let mut result = BatchResult::default();
        absorb_reply(&mut result, &doc! { "ok": 1.0 }, 0).unwrap();
        absorb_reply(&mut result, &doc! { "ok": 0.0 }, 0).unwrap();
        absorb_reply(&mut result, &doc! { "ok": 1.0 }, 0).unwrap();
        assert_eq!(result.ok, Some(false));
    }

    #[test]
    fn upserted_ids_are_extracted_from_the_reply() {
        let reply = doc! {
            "ok": 1,
            "n": 2,
            "upserted": [ { "index": 0, "_id": 7 }, { "index": 1, "_id": 8 } ],
        };
        assert_eq!(upserted_ids(&reply), vec![Bson::Int32(7), Bson::Int32(8)]);
    }

    #[test]
    fn reply_counts_tolerate_numeric_widths() {
        assert_eq!(reply_count(&doc! { "n": 3_i32 }, "n"), 3);
        assert_eq!(reply_count(&doc! { "n": 3_i64 }, "n"), 3);
        assert_eq!(reply_count(&doc! { "n": 3.0 }, "n"), 3);
        assert_eq!(reply_count(&doc! {}, "n"), 0);
    }

    /// Records every command and answers each with the next scripted reply.
    struct ScriptedRunner {
        replies: Mutex<VecDeque<Document>>,
        commands: Mutex<Vec<Document>>,
    }

    impl ScriptedRunner {
        fn new(replies: Vec<Document>) -> Self {
            ScriptedRunner {
                replies: Mutex::new(replies.into()),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<Document> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RunCommand for ScriptedRunner {
        async fn run(&self, command: Document) -> anyhow::Result<Document> {
            self.commands.lock().unwrap().push(command);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| doc! { "ok": 1.0, "n": 0 });
            Ok(reply)
        }
    }

    #[tokio::test]
    async fn ordered_execution_stops_after_a_failing_group() {
        let runner = ScriptedRunner::new(vec![doc! {
            "ok": 1.0,
            "n": 1,
            "writeErrors": [ { "index": 1, "code": 11000, "errmsg": "dup" } ],
        }]);
        let operations = vec![insert_op(1), insert_op(2), delete_op()];

        let result = execute_batch(&runner, "users", &operations, &WriteOptions::default())
            .await
            .unwrap();

        // The delete group was never submitted.
        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains_key("insert"));

        assert_eq!(result.n_inserted, 1);
        assert_eq!(result.write_errors.len(), 1);
        assert_eq!(result.write_errors[0].index, 1);
        // The failed insert does not report its id.
        assert_eq!(result.inserted_ids, vec![Bson::Int32(1)]);
    }

    #[tokio::test]
    async fn unordered_execution_submits_every_group_despite_write_errors() {
        let runner = ScriptedRunner::new(vec![
            doc! {
                "ok": 1.0,
                "n": 0,
                "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "dup" } ],
            },
            doc! { "ok": 1.0, "n": 1 },
        ]);
        let operations = vec![insert_op(1), delete_op()];
        let options = WriteOptions { ordered: false };

        let result = execute_batch(&runner, "users", &operations, &options)
            .await
            .unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].contains_key("delete"));
        assert_eq!(result.n_removed, 1);
        assert_eq!(result.write_errors.len(), 1);
    }
}
