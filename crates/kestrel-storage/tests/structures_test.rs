//! Storage structure integration tests.
//!
//! Runs the page-resident structures end to end over an in-memory store:
//! - B-tree ordering across splits, reloads and range scans
//! - chained hash lookups through commits, reloads and resizes
//! - tables handing out copies of their rows
//! - blocks refusing writes past the page budget

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rand::seq::SliceRandom;

use kestrel_common::{ErrorCategory, KestrelError, PAGE_BUDGET, StorageConfig, TypeId};
use kestrel_storage::{
    BTree, Block, Catalog, ChainedHash, Column, MAX_BUCKETS, Persistent, Row, Table, Value,
};
use kestrel_store::MemoryStore;
use kestrel_txn::Engine;

fn engine() -> Engine {
    engine_with(StorageConfig::default())
}

fn engine_with(config: StorageConfig) -> Engine {
    Engine::new(Arc::new(MemoryStore::standalone()), config).unwrap()
}

// =============================================================================
// B-tree
// =============================================================================

#[tokio::test]
async fn test_btree_sequential_keys_survive_reload() {
    let engine = engine();
    let capacity = engine.config().btree_node_capacity;
    let count = 3 * capacity as i64;

    let mut txn = engine.begin().await.unwrap();
    let mut tree: BTree<i64, i64> = BTree::new(txn.config());
    for k in 0..count {
        tree.put(&mut txn, k, k * k).await.unwrap();
    }
    let id = tree.id().unwrap();
    txn.commit().await.unwrap();

    let reloaded: BTree<i64, i64> = BTree::open(&engine, id).retrieved().await.unwrap();
    assert!(reloaded.height() >= 1);
    let entries = reloaded.iter(&engine).collect().await.unwrap();
    assert_eq!(entries.len() as i64, count);
    for (i, (k, v)) in entries.into_iter().enumerate() {
        assert_eq!(k, i as i64);
        assert_eq!(v, k * k);
    }
}

#[tokio::test]
async fn test_btree_shuffled_inserts_iterate_in_order() {
    let engine = engine();
    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut rand::rng());

    let mut txn = engine.begin().await.unwrap();
    let mut tree: BTree<i64, String> = BTree::with_node_capacity(8).unwrap();
    for k in &keys {
        tree.put(&mut txn, *k, k.to_string()).await.unwrap();
    }
    txn.commit().await.unwrap();

    let iterated: Vec<i64> = tree
        .iter(&engine)
        .collect()
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(iterated, (0..500).collect::<Vec<_>>());
    assert!(tree.height() >= 2);
}

#[tokio::test]
async fn test_btree_range_matches_reference() {
    let engine = engine();
    let mut txn = engine.begin().await.unwrap();
    let mut tree: BTree<String, i64> = BTree::with_node_capacity(6).unwrap();
    let mut reference = BTreeMap::new();
    for i in 0..200i64 {
        let key = format!("key-{:04}", (i * 37) % 200);
        tree.put(&mut txn, key.clone(), i).await.unwrap();
        reference.insert(key, i);
    }
    for i in (0..200i64).step_by(7) {
        let key = format!("key-{i:04}");
        tree.delete(&mut txn, &key).await.unwrap();
        reference.remove(&key);
    }
    txn.commit().await.unwrap();

    let from = "key-0042".to_string();
    let to = "key-0150".to_string();
    let scanned = tree
        .range(&engine, from.clone(), to.clone())
        .collect()
        .await
        .unwrap();
    let expected: Vec<_> = reference
        .range(from..to)
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    assert_eq!(scanned, expected);
    assert_eq!(tree.len(), reference.len() as u64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_btree_iteration_is_sorted(keys in proptest::collection::vec(-1000i64..1000, 0..300)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let iterated: Vec<i64> = runtime.block_on(async {
            let engine = engine();
            let mut txn = engine.begin().await.unwrap();
            let mut tree: BTree<i64, bool> = BTree::with_node_capacity(4).unwrap();
            for k in &keys {
                tree.put(&mut txn, *k, true).await.unwrap();
            }
            let out = tree.iter(&txn).collect().await.unwrap();
            txn.commit().await.unwrap();
            out.into_iter().map(|(k, _)| k).collect()
        });

        let mut expected = keys.clone();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(iterated, expected);
    }
}

// =============================================================================
// Chained hash
// =============================================================================

#[tokio::test]
async fn test_hash_lookup_after_reload() {
    let engine = engine();
    let mut txn = engine.begin().await.unwrap();
    let mut table: ChainedHash<String, i64> = ChainedHash::new(txn.config());
    table.put(&mut txn, "123".into(), 123).await.unwrap();
    let id = table.id().unwrap();
    txn.commit().await.unwrap();

    let reloaded: ChainedHash<String, i64> =
        ChainedHash::open(&engine, id).retrieved().await.unwrap();
    assert_eq!(reloaded.get(&engine, &"123".to_string()).await.unwrap(), Some(123));
    assert_eq!(reloaded.get(&engine, &"other".to_string()).await.unwrap(), None);
}

#[tokio::test]
async fn test_hash_resize_keeps_latest_values() {
    let engine = engine_with(StorageConfig {
        hash_initial_buckets: 1,
        ..StorageConfig::default()
    });
    let mut txn = engine.begin().await.unwrap();
    let mut table: ChainedHash<u64, String> = ChainedHash::new(txn.config());
    let padding = "p".repeat(900);
    for key in 0..150u64 {
        table.put(&mut txn, key, format!("{key}-old-{padding}")).await.unwrap();
    }
    for key in (0..150u64).step_by(3) {
        table.put(&mut txn, key, format!("{key}-new")).await.unwrap();
    }
    let id = table.id().unwrap();
    txn.commit().await.unwrap();

    let reloaded: ChainedHash<u64, String> =
        ChainedHash::open(&engine, id).retrieved().await.unwrap();
    assert!(reloaded.bucket_count() >= 9);
    assert_eq!(reloaded.len(), 150);
    for key in 0..150u64 {
        let value = reloaded.get(&engine, &key).await.unwrap().unwrap();
        if key % 3 == 0 {
            assert_eq!(value, format!("{key}-new"));
        } else {
            assert!(value.starts_with(&format!("{key}-old-")));
        }
    }
}

#[tokio::test]
async fn test_hash_oversized_overwrite_is_rejected() {
    let engine = engine();
    let mut txn = engine.begin().await.unwrap();
    let mut table: ChainedHash<u64, String> = ChainedHash::new(txn.config());
    table.put(&mut txn, 1, "small".into()).await.unwrap();

    let err = table
        .put(&mut txn, 1, "x".repeat(40_000))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Capacity);
    let err = table
        .put(&mut txn, 2, "x".repeat(40_000))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Capacity);

    assert_eq!(table.len(), 1);
    assert_eq!(table.get(&txn, &1).await.unwrap().as_deref(), Some("small"));
    let id = table.id().unwrap();
    txn.commit().await.unwrap();

    let reloaded: ChainedHash<u64, String> =
        ChainedHash::open(&engine, id).retrieved().await.unwrap();
    assert_eq!(reloaded.get(&engine, &1).await.unwrap().as_deref(), Some("small"));
    assert_eq!(reloaded.get(&engine, &2).await.unwrap(), None);
}

#[tokio::test]
async fn test_hash_growth_stops_at_header_limit() {
    let engine = engine_with(StorageConfig {
        hash_initial_buckets: MAX_BUCKETS,
        ..StorageConfig::default()
    });
    let mut txn = engine.begin().await.unwrap();
    let mut table: ChainedHash<u64, String> = ChainedHash::new(txn.config());
    // two of these never share a block
    let value = "v".repeat(16_500);

    let mut stored = Vec::new();
    let mut failure = None;
    for key in 0..MAX_BUCKETS as u64 {
        match table.put(&mut txn, key, value.clone()).await {
            Ok(()) => stored.push(key),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let err = failure.expect("some bucket must collide");
    assert_eq!(err.category(), ErrorCategory::Capacity);
    assert_eq!(table.bucket_count(), MAX_BUCKETS);
    assert_eq!(table.len(), stored.len() as u64);
    for key in stored {
        assert_eq!(table.get(&txn, &key).await.unwrap().as_deref(), Some(value.as_str()));
    }
    txn.commit().await.unwrap();
}

// =============================================================================
// Tables and catalog
// =============================================================================

#[tokio::test]
async fn test_table_rows_are_copies() {
    let engine = engine();
    let catalog = Catalog::open(&engine).await.unwrap();
    let columns = vec![
        Column::new("id", TypeId::Int64, false),
        Column::new("city", TypeId::Text, true),
    ];
    let rows = [
        Row::new(vec![1i64.into(), "oslo".into()]),
        Row::new(vec![2i64.into(), Value::Null]),
        Row::new(vec![3i64.into(), "lima".into()]),
    ];

    let mut txn = engine.begin().await.unwrap();
    let table = Table::create(&mut txn, columns).await.unwrap();
    catalog
        .create(&mut txn, "cities", table.id().unwrap())
        .await
        .unwrap();
    let mut ids = Vec::new();
    for row in &rows {
        ids.push(table.insert(&mut txn, row.clone()).await.unwrap());
    }
    txn.commit().await.unwrap();

    let table_id = catalog.require(&engine, "cities").await.unwrap();
    let table = Table::open_for_reads(&engine, table_id).retrieved().await.unwrap();
    for (id, row) in ids.iter().zip(&rows) {
        let copy = table.get(&engine, *id).await.unwrap().unwrap();
        assert_eq!(&copy, row);

        let changed = copy.with_value(1, "changed".into()).unwrap();
        assert_ne!(&changed, row);
        assert_eq!(table.get(&engine, *id).await.unwrap().as_ref(), Some(row));
    }
    assert_eq!(table.len(&engine).await.unwrap(), 3);
}

// =============================================================================
// Page budget
// =============================================================================

#[test]
fn test_full_block_rejects_next_pair() {
    let mut block: Block<u64, String> = Block::new();
    let value = "x".repeat(512);
    let mut key = 0;
    while block.put_if_possible(&key, &value) {
        key += 1;
    }
    assert!(block.estimated_size() <= PAGE_BUDGET);
    assert!(block.estimated_size() + 8 + value.len() + 4 > PAGE_BUDGET);

    let err = block.put(key, value).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Capacity);
    assert!(matches!(
        err,
        KestrelError::PageBudgetExceeded { budget, .. } if budget == PAGE_BUDGET
    ));
}
