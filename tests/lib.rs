use std::time::Duration;

use serde_json::{Value, json};
use tempfile::tempdir;
use tetherdb::{BatchTtl, Config, Document, PutOptions, TetherDb, TetherError};

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

#[tokio::test]
async fn test_put_get_with_tags() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed_with(
        "u1",
        doc(json!({"name": "John", "age": 30})),
        PutOptions::new().tags(["user", "active"]),
    )
    .await
    .unwrap();

    let fetched = db.get("u1").await.unwrap().unwrap();
    assert_eq!(
        Value::Object(fetched),
        json!({"name": "John", "age": 30, "_tags": ["user", "active"]})
    );

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_query_gt_in_key_order() {
    let db = TetherDb::new().await.unwrap();

    // Generated keys are monotonic, so key order follows insertion order
    db.put(doc(json!({"age": 30}))).await.unwrap();
    db.put(doc(json!({"age": 25}))).await.unwrap();
    db.put(doc(json!({"age": 35}))).await.unwrap();

    let results = db.query(json!({"age": {"$gt": 25}})).await.unwrap();
    let ages: Vec<_> = results.iter().map(|d| d.get("age").unwrap().clone()).collect();
    assert_eq!(ages, vec![json!(30), json!(35)]);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_ttl_expiry_and_cleanup() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed_with(
        "temp",
        doc(json!({"x": 1})),
        PutOptions::new().ttl(Duration::from_secs(1)),
    )
    .await
    .unwrap();
    assert!(db.get("temp").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(db.cleanup().await.unwrap(), 1);
    assert_eq!(db.get("temp").await.unwrap(), None);
    assert_eq!(db.cleanup().await.unwrap(), 0);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_expired_record_invisible_before_sweep() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed_with(
        "temp",
        doc(json!({"x": 1})),
        PutOptions::new().ttl(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // No sweep has run, but the record must already be invisible
    assert_eq!(db.get("temp").await.unwrap(), None);
    assert!(db.query(json!({})).await.unwrap().is_empty());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_file_backing_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    {
        let db = TetherDb::with_file(&path).await.unwrap();
        db.put_keyed("k", doc(json!({"v": 42}))).await.unwrap();
        db.close().await.unwrap();
    }

    let db = TetherDb::with_file(&path).await.unwrap();
    let fetched = db.get("k").await.unwrap().unwrap();
    assert_eq!(Value::Object(fetched), json!({"v": 42}));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_preserves_ttl() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    {
        let db = TetherDb::with_file(&path).await.unwrap();
        db.put_keyed_with(
            "session",
            doc(json!({"user": "john"})),
            PutOptions::new().ttl(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
        db.close().await.unwrap();
    }

    let db = TetherDb::with_file(&path).await.unwrap();

    // The TTL index is rebuilt from persisted side entries
    assert_eq!(db.stats().await.unwrap().ttl_entries, 1);
    assert!(db.get("session").await.unwrap().is_some());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_contains_on_arrays() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed("k", doc(json!({"a": [1, 2, 3]}))).await.unwrap();

    assert_eq!(db.query(json!({"a": {"$contains": 2}})).await.unwrap().len(), 1);
    assert!(db.query(json!({"a": {"$contains": 5}})).await.unwrap().is_empty());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_with_per_item_ttls() {
    let db = TetherDb::new().await.unwrap();

    let keys = db
        .put_batch(
            vec![doc(json!({"n": "A"})), doc(json!({"n": "B"}))],
            BatchTtl::PerItem(vec![Some(Duration::from_secs(1)), Some(Duration::from_secs(3600))]),
        )
        .await
        .unwrap();
    assert_eq!(keys.len(), 2);

    // Both retrievable, positionally aligned with the input
    let first = db.get(&keys[0]).await.unwrap().unwrap();
    assert_eq!(first.get("n"), Some(&json!("A")));
    let second = db.get(&keys[1]).await.unwrap().unwrap();
    assert_eq!(second.get("n"), Some(&json!("B")));

    // After the first TTL elapses and a sweep runs, only the second remains
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(db.cleanup().await.unwrap(), 1);
    assert_eq!(db.get(&keys[0]).await.unwrap(), None);
    assert!(db.get(&keys[1]).await.unwrap().is_some());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_atomicity_surface() {
    let db = TetherDb::new().await.unwrap();

    // One oversized item fails the whole batch: no keys surface
    let oversized = doc(json!({"padding": "x".repeat(10_000)}));
    let result = db
        .put_batch(vec![doc(json!({"ok": 1})), oversized], BatchTtl::None)
        .await;
    assert!(matches!(result, Err(TetherError::TooLarge { .. })));

    // A mismatched TTL list also fails up front
    let result = db
        .put_batch(
            vec![doc(json!({"ok": 1}))],
            BatchTtl::PerItem(vec![None, Some(Duration::from_secs(1))]),
        )
        .await;
    assert!(result.is_err());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_batch_counts_live_records() {
    let db = TetherDb::new().await.unwrap();

    let keys = db
        .put_batch(
            vec![doc(json!({"v": 1})), doc(json!({"v": 2})), doc(json!({"v": 3}))],
            BatchTtl::None,
        )
        .await
        .unwrap();

    let mut to_delete = keys.clone();
    to_delete.push("never-existed".to_string());

    let removed = db.delete_batch(to_delete).await.unwrap();
    assert_eq!(removed, 3);
    assert!(db.is_empty().await.unwrap());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_overwrite_cancels_ttl() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed_with(
        "k",
        doc(json!({"v": 1})),
        PutOptions::new().ttl(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    // Overwrite without a TTL: the record must not expire
    db.put_keyed("k", doc(json!({"v": 2}))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(db.cleanup().await.unwrap(), 0);

    let fetched = db.get("k").await.unwrap().unwrap();
    assert_eq!(fetched.get("v"), Some(&json!(2)));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_idempotence() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed("k", doc(json!({"v": 1}))).await.unwrap();

    assert!(db.delete("k").await.unwrap());
    assert!(!db.delete("k").await.unwrap());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_document_size_ceiling() {
    let db = TetherDb::new().await.unwrap();

    let too_big = doc(json!({"padding": "x".repeat(9000)}));
    assert!(matches!(
        db.put_keyed("big", too_big).await,
        Err(TetherError::TooLarge { .. })
    ));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_keys_rejected() {
    let db = TetherDb::new().await.unwrap();

    assert!(matches!(
        db.put_keyed("", doc(json!({"v": 1}))).await,
        Err(TetherError::InvalidKey(_))
    ));
    assert!(matches!(
        db.put_keyed(&"k".repeat(500), doc(json!({"v": 1}))).await,
        Err(TetherError::InvalidKey(_))
    ));

    // Reads on invalid keys are misses, not errors
    assert_eq!(db.get("").await.unwrap(), None);
    assert!(!db.delete("").await.unwrap());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_purge_removes_everything() {
    let db = TetherDb::new().await.unwrap();

    for i in 0..10 {
        db.put_keyed(&format!("key-{i}"), doc(json!({"v": i}))).await.unwrap();
    }
    db.put_keyed_with(
        "ttl-key",
        doc(json!({"v": 99})),
        PutOptions::new().ttl(Duration::from_secs(3600)),
    )
    .await
    .unwrap();

    assert_eq!(db.purge().await.unwrap(), 11);
    assert!(db.is_empty().await.unwrap());
    assert_eq!(db.stats().await.unwrap().ttl_entries, 0);

    // The store stays usable
    db.put_keyed("fresh", doc(json!({"v": 1}))).await.unwrap();
    assert_eq!(db.len().await.unwrap(), 1);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_query_limit_bounds_results() {
    let db = TetherDb::new().await.unwrap();

    for i in 0..20 {
        db.put(doc(json!({"n": i}))).await.unwrap();
    }

    let limited = db.query(json!({"$limit": 5})).await.unwrap();
    assert_eq!(limited.len(), 5);

    // Emission follows key order: the five oldest writes
    let ns: Vec<_> = limited.iter().map(|d| d.get("n").unwrap().clone()).collect();
    assert_eq!(ns, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_query_operator_coverage() {
    let db = TetherDb::new().await.unwrap();

    db.put_keyed(
        "a",
        doc(json!({"name": "John", "age": 30, "meta": {"role": "admin"}})),
    )
    .await
    .unwrap();
    db.put_keyed("b", doc(json!({"name": "Jane", "age": 25}))).await.unwrap();

    assert_eq!(db.query(json!({"age": {"$in": [25, 40]}})).await.unwrap().len(), 1);
    assert_eq!(db.query(json!({"age": {"$ne": 25}})).await.unwrap().len(), 1);
    assert_eq!(db.query(json!({"meta.role": "admin"})).await.unwrap().len(), 1);
    assert_eq!(db.query(json!({"meta": {"$exists": false}})).await.unwrap().len(), 1);
    assert_eq!(db.query(json!({"name": {"$contains": "J"}})).await.unwrap().len(), 2);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_store_rejects_operations() {
    let db = TetherDb::new().await.unwrap();
    db.put_keyed("k", doc(json!({"v": 1}))).await.unwrap();

    db.close().await.unwrap();
    // Idempotent
    db.close().await.unwrap();

    assert!(matches!(
        db.put_keyed("k2", doc(json!({"v": 2}))).await,
        Err(TetherError::Closed)
    ));
    assert!(matches!(db.get("k").await, Err(TetherError::Closed)));
    assert!(matches!(db.query(json!({})).await, Err(TetherError::Closed)));
}

#[tokio::test]
async fn test_scoped_acquisition_closes() {
    let mut escaped = None;
    let count = TetherDb::scoped(Config::default(), |db| {
        escaped = Some(db.clone());
        async move {
            db.put_keyed("k", doc(json!({"v": 1}))).await?;
            db.len().await
        }
    })
    .await
    .unwrap();
    assert_eq!(count, 1);

    // The store closed on scope exit, even for handles that escaped
    let db = escaped.unwrap();
    assert!(matches!(db.get("k").await, Err(TetherError::Closed)));
}

#[tokio::test]
async fn test_scoped_closes_on_error() {
    let err = TetherDb::scoped(Config::default(), |db| async move {
        db.put_keyed("", doc(json!({"v": 1}))).await?;
        Ok(())
    })
    .await;
    assert!(matches!(err, Err(TetherError::InvalidKey(_))));
}

#[tokio::test]
async fn test_concurrent_writers_via_clones() {
    let db = TetherDb::new().await.unwrap();
    let mut handles = Vec::new();

    for i in 0..10 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..10 {
                db.put_keyed(&format!("key-{i}-{j}"), doc(json!({"i": i, "j": j})))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(db.len().await.unwrap(), 100);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_many_documents_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("many.db");

    {
        let db = TetherDb::with_file(&path).await.unwrap();
        for i in 0..200 {
            db.put_keyed(&format!("key-{i:04}"), doc(json!({"n": i, "blob": "x".repeat(600)})))
                .await
                .unwrap();
        }
        db.close().await.unwrap();
    }

    let db = TetherDb::with_file(&path).await.unwrap();
    assert_eq!(db.len().await.unwrap(), 200);
    for i in (0..200).step_by(17) {
        let fetched = db.get(&format!("key-{i:04}")).await.unwrap().unwrap();
        assert_eq!(fetched.get("n"), Some(&json!(i)));
    }

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_tag_queries() {
    let db = TetherDb::new().await.unwrap();

    db.put_with(doc(json!({"v": 1})), PutOptions::new().tags(["sensor", "indoor"]))
        .await
        .unwrap();
    db.put_with(doc(json!({"v": 2})), PutOptions::new().tags(["sensor", "outdoor"]))
        .await
        .unwrap();
    db.put(doc(json!({"v": 3}))).await.unwrap();

    assert_eq!(db.query(json!({"tags": "sensor"})).await.unwrap().len(), 2);
    assert_eq!(db.query(json!({"tags": "indoor"})).await.unwrap().len(), 1);
    assert_eq!(db.query(json!({"_tags": {"$contains": "outdoor"}})).await.unwrap().len(), 1);
    assert!(db.query(json!({"tags": "missing"})).await.unwrap().is_empty());

    db.close().await.unwrap();
}
