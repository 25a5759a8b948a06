//! Cursor tests: ranges, directions, advance and continue

use idbstore_core::storage::{Cursor, CursorDirection, Durability, Transaction, TransactionMode};
use idbstore_core::{IndexMetadata, Key, KeyPath, KeyRange, StoreError, Value};
use idbstore_sqlite::{SqliteBackingStore, SqliteCursor, SqliteDatabase, SqliteTransaction};
use pretty_assertions::assert_eq;

const STORE: i64 = 1;
const COLOR_INDEX: i64 = 30;

async fn open_database(store: &SqliteBackingStore) -> SqliteDatabase {
    let db = store.open_database("cursors").unwrap();
    let mut txn = db
        .create_transaction(TransactionMode::VersionChange, Durability::Default)
        .unwrap();
    txn.begin().unwrap();
    txn.set_database_version(1).unwrap();
    txn.create_object_store(STORE, "items".into(), KeyPath::from("id"), false)
        .unwrap();
    txn.create_index(
        STORE,
        IndexMetadata::new(COLOR_INDEX, "by_color", KeyPath::from("color"), false, false),
    )
    .unwrap();
    txn.commit().await.unwrap();
    db
}

fn begin(db: &SqliteDatabase, mode: TransactionMode) -> SqliteTransaction {
    let mut txn = db.create_transaction(mode, Durability::Default).unwrap();
    txn.begin().unwrap();
    txn
}

/// Store odd keys 1..=9, colored red (1, 5, 9) and blue (3, 7)
async fn populate(db: &SqliteDatabase) {
    let mut txn = begin(db, TransactionMode::ReadWrite);
    for key in [1, 3, 5, 7, 9] {
        let color = if key % 4 == 1 { "red" } else { "blue" };
        let record = txn
            .put_record(STORE, &Key::from(key), Value::new(format!("item {}", key)))
            .unwrap();
        txn.put_index_data_for_record(STORE, COLOR_INDEX, &Key::from(color), &record)
            .unwrap();
    }
    txn.commit().await.unwrap();
}

/// Collect the remaining keys (and primary keys) of a cursor
fn drain(mut cursor: SqliteCursor) -> Vec<(Key, Key)> {
    let mut seen = vec![(cursor.key().clone(), cursor.primary_key().clone())];
    while cursor.continue_to(None, None).unwrap() {
        seen.push((cursor.key().clone(), cursor.primary_key().clone()));
    }
    seen
}

fn keys(seen: &[(Key, Key)]) -> Vec<Key> {
    seen.iter().map(|(key, _)| key.clone()).collect()
}

#[tokio::test]
async fn test_object_store_cursor_over_range() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let range = KeyRange::bound(Key::from(2), Key::from(6), false, false);
    let mut cursor = txn
        .open_object_store_cursor(STORE, &range, CursorDirection::Next, false)
        .unwrap()
        .unwrap();

    assert_eq!(cursor.key(), &Key::from(3));
    assert_eq!(cursor.value().unwrap().bits, b"item 3".to_vec());
    assert!(cursor.continue_to(None, None).unwrap());
    assert_eq!(cursor.key(), &Key::from(5));
    assert!(!cursor.continue_to(None, None).unwrap());
    // stays exhausted
    assert!(!cursor.continue_to(None, None).unwrap());
}

#[tokio::test]
async fn test_empty_range_has_no_cursor() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let range = KeyRange::bound(Key::from(3), Key::from(5), true, true);
    assert!(txn
        .open_object_store_cursor(STORE, &range, CursorDirection::Next, false)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_object_store_cursor_directions() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let ascending = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, true)
        .unwrap()
        .unwrap();
    let expected: Vec<Key> = [1, 3, 5, 7, 9].into_iter().map(Key::from).collect();
    assert_eq!(keys(&drain(ascending)), expected);

    let descending = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Prev, true)
        .unwrap()
        .unwrap();
    let expected: Vec<Key> = [9, 7, 5, 3, 1].into_iter().map(Key::from).collect();
    assert_eq!(keys(&drain(descending)), expected);
}

#[tokio::test]
async fn test_key_only_cursor_has_no_value() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, true)
        .unwrap()
        .unwrap();
    assert_eq!(cursor.key(), &Key::from(1));
    assert_eq!(cursor.primary_key(), &Key::from(1));
    assert!(cursor.value().is_none());
}

#[tokio::test]
async fn test_advance() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let mut cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, false)
        .unwrap()
        .unwrap();

    assert!(cursor.advance(2).unwrap());
    assert_eq!(cursor.key(), &Key::from(5));
    assert!(cursor.advance(1).unwrap());
    assert_eq!(cursor.key(), &Key::from(7));
    assert!(!cursor.advance(5).unwrap());
    assert!(matches!(
        cursor.advance(0),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_continue_to_target_key() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let mut cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, false)
        .unwrap()
        .unwrap();
    assert!(cursor.continue_to(Some(&Key::from(6)), None).unwrap());
    assert_eq!(cursor.key(), &Key::from(7));

    let mut cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Prev, false)
        .unwrap()
        .unwrap();
    assert!(cursor.continue_to(Some(&Key::from(4)), None).unwrap());
    assert_eq!(cursor.key(), &Key::from(3));
}

#[tokio::test]
async fn test_cursor_sees_records_written_after_open() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    let mut cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, true)
        .unwrap()
        .unwrap();
    txn.put_record(STORE, &Key::from(2), Value::new(b"late".to_vec()))
        .unwrap();

    assert!(cursor.continue_to(None, None).unwrap());
    assert_eq!(cursor.key(), &Key::from(2));
    drop(cursor);
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_index_cursor_orders_by_index_then_primary_key() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::unbounded(),
            CursorDirection::Next,
            false,
        )
        .unwrap()
        .unwrap();
    assert_eq!(cursor.value().unwrap().bits, b"item 3".to_vec());

    let expected: Vec<(Key, Key)> = [("blue", 3), ("blue", 7), ("red", 1), ("red", 5), ("red", 9)]
        .into_iter()
        .map(|(color, key)| (Key::from(color), Key::from(key)))
        .collect();
    assert_eq!(drain(cursor), expected);

    let cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::unbounded(),
            CursorDirection::Prev,
            true,
        )
        .unwrap()
        .unwrap();
    let reversed: Vec<(Key, Key)> = expected.into_iter().rev().collect();
    assert_eq!(drain(cursor), reversed);
}

#[tokio::test]
async fn test_index_cursor_no_duplicate() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::unbounded(),
            CursorDirection::NextNoDuplicate,
            true,
        )
        .unwrap()
        .unwrap();
    assert_eq!(
        drain(cursor),
        vec![
            (Key::from("blue"), Key::from(3)),
            (Key::from("red"), Key::from(1)),
        ]
    );

    // Each index key still yields its smallest primary key
    let cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::unbounded(),
            CursorDirection::PrevNoDuplicate,
            true,
        )
        .unwrap()
        .unwrap();
    assert_eq!(
        drain(cursor),
        vec![
            (Key::from("red"), Key::from(1)),
            (Key::from("blue"), Key::from(3)),
        ]
    );
}

#[tokio::test]
async fn test_index_cursor_continue_to_primary_key() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let mut cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::only(Key::from("red")),
            CursorDirection::Next,
            true,
        )
        .unwrap()
        .unwrap();
    assert_eq!(cursor.primary_key(), &Key::from(1));

    assert!(cursor
        .continue_to(Some(&Key::from("red")), Some(&Key::from(6)))
        .unwrap());
    assert_eq!(cursor.primary_key(), &Key::from(9));
    assert!(!cursor.continue_to(None, None).unwrap());
}

#[tokio::test]
async fn test_cursor_closes_with_deleted_database() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;
    populate(&db).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let mut cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, true)
        .unwrap()
        .unwrap();
    assert!(cursor.try_clone().is_none());

    store.delete_database("cursors").unwrap();
    assert!(matches!(
        cursor.continue_to(None, None),
        Err(StoreError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_index_continue_to_compares_composite_keys() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    for (color, key) in [("amber", 1), ("blue", 2), ("cyan", 3)] {
        let record = txn
            .put_record(STORE, &Key::from(key), Value::new(color.as_bytes().to_vec()))
            .unwrap();
        txn.put_index_data_for_record(STORE, COLOR_INDEX, &Key::from(color), &record)
            .unwrap();
    }
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    let mut cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::unbounded(),
            CursorDirection::Next,
            true,
        )
        .unwrap()
        .unwrap();
    // ("cyan", 3) is the first entry past ("blue", 5)
    assert!(cursor
        .continue_to(Some(&Key::from("blue")), Some(&Key::from(5)))
        .unwrap());
    assert_eq!(cursor.key(), &Key::from("cyan"));
    assert_eq!(cursor.primary_key(), &Key::from(3));

    let mut cursor = txn
        .open_index_cursor(
            STORE,
            COLOR_INDEX,
            &KeyRange::unbounded(),
            CursorDirection::Prev,
            true,
        )
        .unwrap()
        .unwrap();
    assert_eq!(cursor.key(), &Key::from("cyan"));
    // ("amber", 1) is the first entry before ("blue", 1)
    assert!(cursor
        .continue_to(Some(&Key::from("blue")), Some(&Key::from(1)))
        .unwrap());
    assert_eq!(cursor.key(), &Key::from("amber"));
    assert_eq!(cursor.primary_key(), &Key::from(1));
}

#[tokio::test]
async fn test_index_cursor_over_range() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    for (color, key) in [("a", 1), ("b", 2), ("b", 3), ("c", 4), ("d", 5)] {
        let record = txn
            .put_record(STORE, &Key::from(key), Value::new(color.as_bytes().to_vec()))
            .unwrap();
        txn.put_index_data_for_record(STORE, COLOR_INDEX, &Key::from(color), &record)
            .unwrap();
    }
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    let scan = |range: KeyRange, direction: CursorDirection| -> Vec<(Key, Key)> {
        txn.open_index_cursor(STORE, COLOR_INDEX, &range, direction, true)
            .unwrap()
            .map(drain)
            .unwrap_or_default()
    };
    let entries = |pairs: &[(&str, i32)]| -> Vec<(Key, Key)> {
        pairs
            .iter()
            .map(|(color, key)| (Key::from(*color), Key::from(*key)))
            .collect()
    };

    let closed = || KeyRange::bound(Key::from("b"), Key::from("c"), false, false);
    assert_eq!(
        scan(closed(), CursorDirection::Next),
        entries(&[("b", 2), ("b", 3), ("c", 4)])
    );
    assert_eq!(
        scan(closed(), CursorDirection::Prev),
        entries(&[("c", 4), ("b", 3), ("b", 2)])
    );

    let lower_open = || KeyRange::bound(Key::from("b"), Key::from("d"), true, false);
    assert_eq!(
        scan(lower_open(), CursorDirection::Next),
        entries(&[("c", 4), ("d", 5)])
    );
    assert_eq!(
        scan(lower_open(), CursorDirection::Prev),
        entries(&[("d", 5), ("c", 4)])
    );

    let upper_open = || KeyRange::bound(Key::from("a"), Key::from("c"), false, true);
    assert_eq!(
        scan(upper_open(), CursorDirection::Next),
        entries(&[("a", 1), ("b", 2), ("b", 3)])
    );
    assert_eq!(
        scan(upper_open(), CursorDirection::Prev),
        entries(&[("b", 3), ("b", 2), ("a", 1)])
    );

    let both_open = || KeyRange::bound(Key::from("a"), Key::from("c"), true, true);
    assert_eq!(
        scan(both_open(), CursorDirection::NextNoDuplicate),
        entries(&[("b", 2)])
    );
    assert!(scan(
        KeyRange::bound(Key::from("b"), Key::from("c"), true, true),
        CursorDirection::Next
    )
    .is_empty());
}

#[tokio::test]
async fn test_string_keys_scan_in_code_unit_order() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store).await;

    let expected = vec![
        Key::from("\u{D7FF}"),
        Key::from("\u{10000}"),
        Key::from("\u{E000}"),
        Key::from("\u{FFFF}"),
    ];
    let mut txn = begin(&db, TransactionMode::ReadWrite);
    for key in expected.iter().rev() {
        txn.put_record(STORE, key, Value::new(b"s".to_vec())).unwrap();
    }
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    let cursor = txn
        .open_object_store_cursor(STORE, &KeyRange::unbounded(), CursorDirection::Next, true)
        .unwrap()
        .unwrap();
    assert_eq!(keys(&drain(cursor)), expected);
}
