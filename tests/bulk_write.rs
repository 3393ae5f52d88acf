//! Engine-level tests: routing, prebuilt operations, direct execution.

use std::sync::Arc;

use bson::{doc, Bson};
use mongo_bulk::testing::MemoryCollection;
use mongo_bulk::{
    bulk_delete, bulk_replace, bulk_update, bulk_write, BulkCollection, BulkError, BulkOptions,
    BulkWrite, OperationType, Target, WriteOperation,
};

mod common;

fn target(collection: &Arc<MemoryCollection>) -> Option<Target> {
    common::init_tracing();
    Some(Target::Handle(collection.clone() as Arc<dyn BulkCollection>))
}

fn test_operations() -> Vec<WriteOperation> {
    vec![
        WriteOperation::DeleteMany {
            filter: doc! {},
        },
        WriteOperation::InsertOne {
            filter: doc! {},
            document: doc! { "name": "Test User" },
        },
        WriteOperation::UpdateOne {
            filter: doc! {},
            update: doc! { "$set": { "age": 31 } },
            upsert: Some(false),
        },
    ]
}

#[tokio::test]
async fn prebuilt_operations_are_submitted_in_exactly_one_call() {
    let collection = Arc::new(MemoryCollection::with_documents(vec![
        doc! { "_id": 1 },
        doc! { "_id": 2 },
    ]));

    let results = bulk_write(BulkOptions {
        collection: target(&collection),
        operations: Some(test_operations().into()),
        ..Default::default()
    })
    .await
    .unwrap();

    let batches = collection.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], test_operations());
    assert_eq!(collection.ordered_flags(), vec![true]);

    assert!(results.is_ok());
    assert_eq!(results.deleted_count(), 2);
    assert_eq!(results.inserted_count(), 1);
    assert_eq!(results.matched_count(), 1);
    assert_eq!(results.modified_count(), 1);

    let documents = collection.documents();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].get_str("name").unwrap(), "Test User");
    assert_eq!(documents[0].get_i32("age").unwrap(), 31);
}

#[tokio::test]
async fn an_operations_factory_is_awaited_and_submitted() {
    let collection = Arc::new(MemoryCollection::new());

    let results = bulk_write(BulkOptions {
        collection: target(&collection),
        operations: Some(mongo_bulk::OperationsSpec::factory(|| {
            vec![WriteOperation::InsertOne {
                filter: doc! {},
                document: doc! { "from": "factory" },
            }]
        })),
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(collection.batches().len(), 1);
    assert_eq!(results.inserted_count(), 1);
    assert_eq!(collection.documents()[0].get_str("from").unwrap(), "factory");
}

#[tokio::test]
async fn a_fixed_update_document_becomes_one_update_many() {
    let collection = Arc::new(MemoryCollection::with_documents(vec![
        doc! { "_id": 1, "kind": "user" },
        doc! { "_id": 2, "kind": "user" },
    ]));

    let results = bulk_update(BulkOptions {
        collection: target(&collection),
        filter: doc! { "kind": "user" },
        document: Some(doc! { "$set": { "active": true } }.into()),
        upsert: Some(false),
        ..Default::default()
    })
    .await
    .unwrap();

    let batches = collection.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0],
        vec![WriteOperation::UpdateMany {
            filter: doc! { "kind": "user" },
            update: doc! { "$set": { "active": true } },
            upsert: Some(false),
        }]
    );
    assert_eq!(results.matched_count(), 2);
    assert_eq!(results.modified_count(), 2);
}

#[tokio::test]
async fn a_fixed_replace_document_becomes_one_replace_many() {
    let collection = Arc::new(MemoryCollection::with_documents(vec![
        doc! { "_id": 1, "name": "before" },
    ]));

    let results = bulk_replace(BulkOptions {
        collection: target(&collection),
        filter: doc! { "_id": 1 },
        document: Some(doc! { "name": "after" }.into()),
        ..Default::default()
    })
    .await
    .unwrap();

    let batches = collection.batches();
    assert_eq!(batches.len(), 1);
    assert!(matches!(
        batches[0][0],
        WriteOperation::ReplaceMany { .. }
    ));
    assert_eq!(results.matched_count(), 1);
    assert_eq!(
        collection.documents(),
        vec![doc! { "name": "after", "_id": 1 }]
    );
}

#[tokio::test]
async fn delete_issues_one_delete_many_and_needs_no_document() {
    let collection = Arc::new(MemoryCollection::with_documents(vec![
        doc! { "_id": 1, "stale": true },
        doc! { "_id": 2, "stale": true },
        doc! { "_id": 3, "stale": false },
    ]));

    let results = bulk_delete(BulkOptions {
        collection: target(&collection),
        filter: doc! { "stale": true },
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(
        collection.batches(),
        vec![vec![WriteOperation::DeleteMany {
            filter: doc! { "stale": true },
        }]]
    );
    assert_eq!(results.deleted_count(), 2);
    assert_eq!(collection.documents().len(), 1);
}

#[tokio::test]
async fn validation_failures_surface_before_any_store_call() {
    let error = bulk_write(BulkOptions::default()).await.unwrap_err();
    let message = error.to_string();
    assert!(message.starts_with("Unable to perform bulk operation:"));
    assert!(message.contains("\"collection\""));
    assert!(message.contains("\"operations\""));
    assert!(message.contains("\"type\""));
}

#[tokio::test]
async fn store_failures_propagate_unmodified() {
    let collection = Arc::new(MemoryCollection::new());
    collection.fail_with("socket closed");

    let error = bulk_write(BulkOptions {
        collection: target(&collection),
        operation: Some(OperationType::Delete),
        ..Default::default()
    })
    .await
    .unwrap_err();

    assert!(matches!(error, BulkError::Store(_)));
    assert!(error.to_string().contains("socket closed"));
}

#[tokio::test]
async fn the_engine_resolves_its_collection_once() {
    let collection = Arc::new(MemoryCollection::new());
    let engine = BulkWrite::new(BulkOptions {
        collection: target(&collection),
        operation: Some(OperationType::Delete),
        ..Default::default()
    })
    .unwrap();

    let first = Arc::as_ptr(engine.collection().await.unwrap());
    let second = Arc::as_ptr(engine.collection().await.unwrap());
    assert_eq!(first, second);
}

#[tokio::test]
async fn upsert_updates_that_match_nothing_insert_through_the_store() {
    let collection = Arc::new(MemoryCollection::new());

    let results = bulk_update(BulkOptions {
        collection: target(&collection),
        filter: doc! { "_id": "absent" },
        document: Some(doc! { "$set": { "seen": true } }.into()),
        upsert: Some(true),
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(results.upserted_count(), 1);
    assert_eq!(results.upserted_ids, vec![Bson::String("absent".into())]);
    assert_eq!(collection.documents().len(), 1);
}
