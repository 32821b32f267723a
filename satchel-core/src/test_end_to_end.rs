// satchel-core/src/test_end_to_end.rs
//! End-to-end behaviour of the object-store backend, exercised over the
//! in-memory object store. The store's operation counters double as a spy
//! for the read-effort assertions.

use crate::collection::{CollectionStore, ObjectCollection};
use crate::document::{Document, DocumentId};
use crate::error::SatchelError;
use crate::find_options::FindOptions;
use crate::query::Filter;
use crate::storage::{MemoryObjectStore, ObjectStore};
use serde_json::{json, Value};
use std::sync::Arc;

async fn open(store: &Arc<MemoryObjectStore>, name: &str) -> Arc<ObjectCollection> {
    ObjectCollection::open(name, store.clone() as Arc<dyn ObjectStore>)
        .await
        .unwrap()
}

fn options(value: Value) -> FindOptions {
    FindOptions::from_json(&value).unwrap()
}

fn field_of(docs: &[Document], field: &str) -> Vec<Value> {
    docs.iter()
        .map(|d| d.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}

#[tokio::test]
async fn test_insert_and_find_roundtrip() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;

    coll.insert_one(json!({"_id": "a", "name": "Clancy"}))
        .await
        .unwrap();

    let docs = coll
        .find(&json!({"_id": "a"}), FindOptions::new())
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].to_value(), json!({"_id": "a", "name": "Clancy"}));
}

#[tokio::test]
async fn test_compound_index_pushdown_reads_only_matches() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;

    for (id, category, priority) in [
        (1, "work", 10),
        (2, "work", 20),
        (3, "work", 30),
        (4, "work", 40),
        (5, "work", 50),
        (6, "personal", 15),
        (7, "personal", 25),
    ] {
        coll.insert_one(json!({"_id": id, "category": category, "priority": priority}))
            .await
            .unwrap();
    }
    coll.create_index(&json!({"category": 1, "priority": 1}), None)
        .await
        .unwrap();
    coll.flush().await.unwrap();

    store.reset_stats();
    let docs = coll
        .find(
            &json!({"category": "work", "priority": {"$gt": 20}}),
            options(json!({"sort": {"priority": 1}, "limit": 2})),
        )
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();

    assert_eq!(field_of(&docs, "priority"), vec![json!(30), json!(40)]);
    // Only the two matching documents were fetched
    assert_eq!(store.stats().gets, 2);
}

#[tokio::test]
async fn test_cross_process_writers_merge() {
    let store = Arc::new(MemoryObjectStore::new());
    let left = open(&store, "events").await;
    let right = open(&store, "events").await;

    left.create_index(&json!({"commonKey": 1}), None).await.unwrap();
    right.create_index(&json!({"commonKey": 1}), None).await.unwrap();

    left.insert_one(json!({"_id": "from-left", "commonKey": "x"}))
        .await
        .unwrap();
    right
        .insert_one(json!({"_id": "from-right", "commonKey": "x"}))
        .await
        .unwrap();
    left.flush().await.unwrap();
    right.flush().await.unwrap();

    for coll in [&left, &right] {
        let mut ids: Vec<String> = coll
            .find(&json!({"commonKey": "x"}), FindOptions::new())
            .await
            .unwrap()
            .to_array()
            .await
            .unwrap()
            .iter()
            .map(|d| d.id.key_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["from-left", "from-right"]);
    }
}

#[tokio::test]
async fn test_delete_purges_from_index_and_drop_removes_it() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;

    coll.insert_one(json!({"_id": "a", "name": "Clancy"}))
        .await
        .unwrap();
    coll.insert_one(json!({"_id": "b", "name": "Clancy"}))
        .await
        .unwrap();
    coll.create_index(&json!({"name": 1}), None).await.unwrap();

    coll.delete_one(&json!({"_id": "a"})).await.unwrap();
    coll.flush().await.unwrap();

    let docs = coll
        .find(&json!({"name": "Clancy"}), FindOptions::new())
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, DocumentId::String("b".to_string()));

    coll.drop_index("name_1").await.unwrap();
    let listed = coll.list_indexes().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], json!("_id_"));
}

#[tokio::test]
async fn test_most_recent_n_via_compound_index() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "activities").await;

    for ts in [1000, 2000, 3000, 4000, 5000, 6000, 7000] {
        coll.insert_one(json!({
            "_id": format!("act-{}", ts),
            "personId": "alice",
            "timestamp": ts
        }))
        .await
        .unwrap();
    }
    coll.create_index(&json!([{"personId": 1}, {"timestamp": -1}]), None)
        .await
        .unwrap();
    coll.flush().await.unwrap();

    store.reset_stats();
    let docs = coll
        .find(
            &json!({"personId": "alice"}),
            options(json!({"sort": {"timestamp": -1}, "limit": 3})),
        )
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();

    assert_eq!(
        field_of(&docs, "timestamp"),
        vec![json!(7000), json!(6000), json!(5000)]
    );
    assert_eq!(store.stats().gets, 3);
}

#[tokio::test]
async fn test_closed_collection_makes_no_storage_calls() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;
    coll.close().await.unwrap();

    store.reset_stats();
    assert!(matches!(
        coll.create_index(&json!({"name": 1}), None).await,
        Err(SatchelError::ClientClosed)
    ));
    assert_eq!(store.stats(), Default::default());
}

// ============================================================================
// UNIVERSAL INVARIANTS
// ============================================================================

#[tokio::test]
async fn test_index_membership_matches_prefix_field_presence() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;
    coll.create_index(&json!({"category": 1}), None).await.unwrap();

    coll.insert_one(json!({"_id": 1, "category": "work"}))
        .await
        .unwrap();
    coll.insert_one(json!({"_id": 2})).await.unwrap();
    coll.insert_one(json!({"_id": 3, "category": null}))
        .await
        .unwrap();
    coll.flush().await.unwrap();

    let index = coll.list_indexes().await.unwrap();
    assert_eq!(index.len(), 2);

    // Only the document with a non-null category is a member of its entry
    let stored = store
        .get("tasks/indices/category_1/work.json")
        .await
        .unwrap();
    let members: Vec<(DocumentId, Value)> = serde_json::from_slice(&stored.bytes).unwrap();
    assert_eq!(members, vec![(DocumentId::Int(1), json!("work"))]);
    assert_eq!(store.object_count(), 5); // 3 docs + 1 metadata + 1 entry
}

#[tokio::test]
async fn test_indexed_find_agrees_with_in_process_evaluation() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;

    let bodies: Vec<Value> = (0..12)
        .map(|i| {
            json!({
                "_id": i,
                "category": if i % 3 == 0 { "work" } else { "personal" },
                "priority": (i * 7) % 40,
            })
        })
        .collect();
    coll.insert_many(bodies.clone()).await.unwrap();
    coll.create_index(&json!({"category": 1, "priority": 1}), None)
        .await
        .unwrap();
    coll.flush().await.unwrap();

    let filter_json = json!({"category": "work", "priority": {"$gte": 10, "$lte": 35}});
    let filter = Filter::parse(&filter_json).unwrap();
    let mut expected: Vec<i64> = bodies
        .iter()
        .map(|b| Document::from_value(b).unwrap())
        .filter(|d| filter.matches(d))
        .map(|d| d.get("priority").unwrap().as_i64().unwrap())
        .collect();
    expected.sort();

    let docs = coll
        .find(&filter_json, options(json!({"sort": {"priority": 1}})))
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    let got: Vec<i64> = docs
        .iter()
        .map(|d| d.get("priority").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(got, expected);
    assert!(!got.is_empty());
}

#[tokio::test]
async fn test_or_query_unions_indexed_branches() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;
    coll.create_index(&json!({"category": 1}), None).await.unwrap();

    for (id, category) in [(1, "work"), (2, "personal"), (3, "errand"), (4, "work")] {
        coll.insert_one(json!({"_id": id, "category": category}))
            .await
            .unwrap();
    }
    coll.flush().await.unwrap();

    let docs = coll
        .find(
            &json!({"$or": [{"category": "work"}, {"category": "errand"}]}),
            options(json!({"sort": {"_id": 1}})),
        )
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    assert_eq!(
        field_of(&docs, "_id"),
        vec![json!(1), json!(3), json!(4)]
    );
}

#[tokio::test]
async fn test_generated_id_roundtrip() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;

    let inserted = coll
        .insert_one(json!({"name": "Clancy"}))
        .await
        .unwrap()
        .inserted_id;

    let found = coll
        .find_one(
            &json!({"_id": inserted.key_string()}),
            FindOptions::new(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.get("name").unwrap(), &json!("Clancy"));
    assert_eq!(found.id.key_string(), inserted.key_string());
}

#[tokio::test]
async fn test_update_one_keeps_indexes_current() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;
    coll.create_index(&json!({"category": 1}), None).await.unwrap();

    coll.insert_one(json!({"_id": 1, "category": "work", "priority": 5}))
        .await
        .unwrap();
    coll.update_one(&json!({"_id": 1}), &json!({"$set": {"category": "personal"}}))
        .await
        .unwrap();
    coll.flush().await.unwrap();

    assert!(coll
        .find(&json!({"category": "work"}), FindOptions::new())
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap()
        .is_empty());
    let docs = coll
        .find(&json!({"category": "personal"}), FindOptions::new())
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn test_every_operation_raises_after_close() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;
    coll.insert_one(json!({"_id": 1})).await.unwrap();
    coll.close().await.unwrap();
    coll.close().await.unwrap(); // close itself stays idempotent

    macro_rules! assert_closed {
        ($call:expr) => {
            assert!(matches!($call.await, Err(SatchelError::ClientClosed)));
        };
    }
    assert_closed!(coll.insert_one(json!({"_id": 2})));
    assert_closed!(coll.insert_many(vec![json!({"_id": 3})]));
    assert_closed!(coll.replace_one(&json!({"_id": 1}), json!({"x": 1})));
    assert_closed!(coll.update_one(&json!({"_id": 1}), &json!({"$set": {"x": 1}})));
    assert_closed!(coll.delete_one(&json!({"_id": 1})));
    assert_closed!(coll.delete_many(&json!({})));
    assert_closed!(coll.find(&json!({}), FindOptions::new()));
    assert_closed!(coll.find_one(&json!({}), FindOptions::new()));
    assert_closed!(coll.count_documents(&json!({})));
    assert_closed!(coll.distinct("name", &json!({})));
    assert_closed!(coll.explain(&json!({}), FindOptions::new()));
    assert_closed!(coll.create_index(&json!({"name": 1}), None));
    assert_closed!(coll.drop_index("name_1"));
    assert_closed!(coll.list_indexes());
    assert_closed!(coll.flush());
}

#[tokio::test]
async fn test_in_query_merges_entries_with_pushdown() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;

    for (id, category, priority) in [
        (1, "work", 10),
        (2, "work", 20),
        (3, "work", 30),
        (4, "work", 40),
        (5, "work", 50),
        (6, "personal", 15),
        (7, "personal", 25),
    ] {
        coll.insert_one(json!({"_id": id, "category": category, "priority": priority}))
            .await
            .unwrap();
    }
    coll.create_index(&json!({"category": 1, "priority": 1}), None)
        .await
        .unwrap();
    coll.flush().await.unwrap();

    store.reset_stats();
    let docs = coll
        .find(
            &json!({
                "category": {"$in": ["work", "personal"]},
                "priority": {"$lte": 30}
            }),
            options(json!({"sort": {"priority": 1}, "limit": 3})),
        )
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();

    // Members from both entries merge in sort order before any fetch
    assert_eq!(
        field_of(&docs, "priority"),
        vec![json!(10), json!(15), json!(20)]
    );
    assert_eq!(store.stats().gets, 3);
}

#[tokio::test]
async fn test_replace_one_moves_document_between_entries() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "tasks").await;
    coll.create_index(&json!({"category": 1}), None).await.unwrap();

    coll.insert_one(json!({"_id": 1, "category": "work"}))
        .await
        .unwrap();
    coll.replace_one(&json!({"_id": 1}), json!({"category": "personal"}))
        .await
        .unwrap();
    coll.flush().await.unwrap();

    assert!(coll
        .find(&json!({"category": "work"}), FindOptions::new())
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap()
        .is_empty());
    let docs = coll
        .find(&json!({"category": "personal"}), FindOptions::new())
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);

    // The old entry object persisted its emptiness
    let stored = store.get("tasks/indices/category_1/work.json").await.unwrap();
    assert_eq!(stored.bytes.as_ref(), b"[]");
}

#[tokio::test]
async fn test_find_one_via_index_reads_one_document() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;
    coll.create_index(&json!({"name": 1}), None).await.unwrap();

    for i in 0..5 {
        coll.insert_one(json!({"_id": i, "name": "Clancy"}))
            .await
            .unwrap();
    }
    coll.flush().await.unwrap();

    store.reset_stats();
    let doc = coll
        .find_one(&json!({"name": "Clancy"}), FindOptions::new())
        .await
        .unwrap();
    assert!(doc.is_some());
    assert_eq!(store.stats().gets, 1);
}

#[tokio::test]
async fn test_sort_by_id_pushdown_end_to_end() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;
    coll.create_index(&json!({"name": 1}), None).await.unwrap();

    for id in ["c", "a", "b", "d"] {
        coll.insert_one(json!({"_id": id, "name": "Clancy"}))
            .await
            .unwrap();
    }
    coll.flush().await.unwrap();

    store.reset_stats();
    let docs = coll
        .find(
            &json!({"name": "Clancy"}),
            options(json!({"sort": {"_id": -1}, "limit": 2})),
        )
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    let ids: Vec<String> = docs.iter().map(|d| d.id.key_string()).collect();
    assert_eq!(ids, vec!["d", "c"]);
    assert_eq!(store.stats().gets, 2);
}

#[tokio::test]
async fn test_unindexed_query_full_scan_still_correct() {
    let store = Arc::new(MemoryObjectStore::new());
    let coll = open(&store, "people").await;

    for i in 0..5 {
        coll.insert_one(json!({"_id": i, "age": 20 + i})).await.unwrap();
    }

    let docs = coll
        .find(
            &json!({"age": {"$gte": 22}}),
            options(json!({"sort": {"age": -1}})),
        )
        .await
        .unwrap()
        .to_array()
        .await
        .unwrap();
    assert_eq!(
        field_of(&docs, "age"),
        vec![json!(24), json!(23), json!(22)]
    );
}
