//! Blob tests: two-phase commit, active blobs and their lifetimes

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use idbstore_core::storage::{
    BlobWriteCompletion, BlobWriteResult, Durability, Transaction, TransactionMode,
};
use idbstore_core::{
    BlobSource, BlobStream, BytesBlobSource, ExternalObject, ExternalObjectKind, Key, KeyRange,
    KeyPath, StoreError, Value,
};
use idbstore_sqlite::{
    BlobHandle, BlobReaderClient, ClientBlob, ReadResult, SqliteBackingStore, SqliteDatabase,
    SqliteTransaction, StoreConfig,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::Notify;

const STORE: i64 = 1;

/// Small pipes and chunks so every blob crosses several of them
fn small_chunk_store() -> SqliteBackingStore {
    SqliteBackingStore::new(StoreConfig::new(8, 16))
}

async fn open_database(store: &SqliteBackingStore, name: &str) -> SqliteDatabase {
    let db = store.open_database(name).unwrap();
    let mut txn = begin(&db, TransactionMode::VersionChange);
    txn.set_database_version(1).unwrap();
    txn.create_object_store(STORE, "files".into(), KeyPath::None, false)
        .unwrap();
    txn.commit().await.unwrap();
    db
}

fn begin(db: &SqliteDatabase, mode: TransactionMode) -> SqliteTransaction {
    let mut txn = db.create_transaction(mode, Durability::Default).unwrap();
    txn.begin().unwrap();
    txn
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn blob_value(bytes: &[u8]) -> Value {
    let source = Arc::new(BytesBlobSource::new(bytes.to_vec()));
    Value::with_external_objects(
        b"holder".to_vec(),
        vec![ExternalObject::blob(source, "application/octet-stream", bytes.len() as u64)],
    )
}

/// Store `bytes` as a blob under key 1
async fn store_blob(db: &SqliteDatabase, bytes: &[u8]) {
    let mut txn = begin(db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), blob_value(bytes))
        .unwrap();
    txn.commit().await.unwrap();
}

/// Vend a client connection to the blob stored under `key`
fn vend(txn: &SqliteTransaction, key: i32) -> BlobHandle {
    let value = txn.get_value(STORE, &Key::from(key)).unwrap().unwrap();
    let mut blobs = txn
        .create_all_external_objects(&value.external_objects)
        .unwrap();
    assert_eq!(blobs.len(), 1);
    blobs.pop().unwrap().into_active().unwrap()
}

async fn read_all(handle: &BlobHandle) -> Vec<u8> {
    let (mut reader, writer) = tokio::io::duplex(16);
    let task = handle.read_all(writer, None);
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let outcome = task.await.unwrap();
    assert_eq!(outcome.result, ReadResult::Success);
    assert_eq!(outcome.bytes_transferred, out.len() as u64);
    out
}

/// A source whose pipe fails on the first read
#[derive(Debug)]
struct BrokenSource;

struct BrokenStream;

impl AsyncRead for BrokenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        _: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "source went away",
        )))
    }
}

impl BlobSource for BrokenSource {
    fn open_stream(&self, _capacity: usize) -> io::Result<BlobStream> {
        Ok(Box::new(BrokenStream))
    }
}

/// A source whose bytes only flow once the gate opens
#[derive(Debug)]
struct GatedSource {
    bytes: Vec<u8>,
    gate: Arc<Notify>,
}

impl BlobSource for GatedSource {
    fn open_stream(&self, capacity: usize) -> io::Result<BlobStream> {
        let (reader, mut writer) = tokio::io::duplex(capacity.max(1));
        let bytes = self.bytes.clone();
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            gate.notified().await;
            let _ = writer.write_all(&bytes).await;
        });
        Ok(Box::new(reader))
    }
}

fn gated_value(bytes: &[u8], gate: &Arc<Notify>) -> Value {
    let source = Arc::new(GatedSource {
        bytes: bytes.to_vec(),
        gate: Arc::clone(gate),
    });
    Value::with_external_objects(
        b"gated".to_vec(),
        vec![ExternalObject::blob(source, "application/octet-stream", bytes.len() as u64)],
    )
}

#[derive(Default)]
struct RecordingClient {
    sizes: Mutex<Vec<(u64, u64)>>,
    completions: Mutex<Vec<(ReadResult, u64)>>,
}

impl BlobReaderClient for RecordingClient {
    fn on_calculated_size(&self, total_size: u64, expected_content_size: u64) {
        self.sizes.lock().push((total_size, expected_content_size));
    }

    fn on_complete(&self, result: ReadResult, data_length: u64) {
        self.completions.lock().push((result, data_length));
    }
}

#[tokio::test]
async fn test_blob_round_trip() {
    let store = small_chunk_store();
    let db = open_database(&store, "round_trip").await;
    let bytes = payload(1000);
    store_blob(&db, &bytes).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let value = txn.get_value(STORE, &Key::from(1)).unwrap().unwrap();
    assert_eq!(value.bits, b"holder".to_vec());
    let object = &value.external_objects[0];
    assert!(!object.is_pending());
    assert!(object.blob_number().is_some());
    assert_eq!(object.size(), 1000);
    assert_eq!(object.mime_type(), "application/octet-stream");

    let handle = vend(&txn, 1);
    assert_eq!(handle.size(), 1000);
    assert_eq!(handle.content_type(), "application/octet-stream");
    assert_eq!(read_all(&handle).await, bytes);
    assert_eq!(db.active_blob_count().unwrap(), 1);

    drop(handle);
    assert_eq!(db.active_blob_count().unwrap(), 0);
}

#[tokio::test]
async fn test_file_metadata_round_trip() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "files").await;
    let last_modified = chrono::DateTime::from_timestamp(1_700_000_000, 123_000).unwrap();

    let source = Arc::new(BytesBlobSource::new(b"hello".to_vec()));
    let file = ExternalObject::file(source, "text/plain", 5, "hello.txt", last_modified);
    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(
        STORE,
        &Key::from(1),
        Value::with_external_objects(b"f".to_vec(), vec![file]),
    )
    .unwrap();
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    let value = txn.get_value(STORE, &Key::from(1)).unwrap().unwrap();
    assert_eq!(
        value.external_objects[0].kind(),
        &ExternalObjectKind::File {
            name: "hello.txt".to_string(),
            last_modified,
        }
    );
    assert_eq!(read_all(&vend(&txn, 1)).await, b"hello".to_vec());
}

#[tokio::test]
async fn test_explicit_two_phase_commit() {
    let store = small_chunk_store();
    let db = open_database(&store, "phases").await;
    let bytes = payload(300);

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), blob_value(&bytes))
        .unwrap();
    let completion = txn.commit_phase_one().unwrap();
    assert!(matches!(completion, BlobWriteCompletion::Pending(_)));
    assert_eq!(completion.wait().await, BlobWriteResult::Success);
    txn.commit_phase_two().unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    assert_eq!(read_all(&vend(&txn, 1)).await, bytes);
}

#[tokio::test]
async fn test_commit_without_blobs_is_ready() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "ready").await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), Value::new(b"plain".to_vec()))
        .unwrap();
    let completion = txn.commit_phase_one().unwrap();
    assert!(matches!(
        completion,
        BlobWriteCompletion::Ready(BlobWriteResult::Success)
    ));
    txn.commit_phase_two().unwrap();
}

#[tokio::test]
async fn test_failed_blob_write_rolls_back() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "broken").await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), Value::new(b"plain".to_vec()))
        .unwrap();
    let broken = ExternalObject::blob(Arc::new(BrokenSource), "text/plain", 10);
    txn.put_record(
        STORE,
        &Key::from(2),
        Value::with_external_objects(b"b".to_vec(), vec![broken]),
    )
    .unwrap();

    let result = txn.commit().await;
    assert!(matches!(result, Err(StoreError::BlobWrite(_))));

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    assert_eq!(
        txn.get_object_store_key_count(STORE, &KeyRange::unbounded())
            .unwrap(),
        0
    );
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_pending_blob_readable_in_same_transaction() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "pending").await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), blob_value(b"draft"))
        .unwrap();

    let value = txn.get_value(STORE, &Key::from(1)).unwrap().unwrap();
    assert!(value.external_objects[0].is_pending());
    let blobs = txn
        .create_all_external_objects(&value.external_objects)
        .unwrap();
    let ClientBlob::Pending(source) = &blobs[0] else {
        panic!("expected the pending source, got {:?}", blobs[0]);
    };
    let mut out = Vec::new();
    source
        .open_stream(4)
        .unwrap()
        .read_to_end(&mut out)
        .await
        .unwrap();
    assert_eq!(out, b"draft".to_vec());
    assert_eq!(db.active_blob_count().unwrap(), 0);

    drop(blobs);
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_blob_replaced_before_commit_is_skipped() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "replaced").await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), blob_value(b"first"))
        .unwrap();
    txn.put_record(STORE, &Key::from(1), Value::new(b"no blob".to_vec()))
        .unwrap();
    let completion = txn.commit_phase_one().unwrap();
    assert_eq!(completion.wait().await, BlobWriteResult::Success);
    txn.commit_phase_two().unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    let value = txn.get_value(STORE, &Key::from(1)).unwrap().unwrap();
    assert!(value.external_objects.is_empty());
}

#[tokio::test]
async fn test_read_range_reports_to_client() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "ranges").await;
    store_blob(&db, b"0123456789").await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let handle = vend(&txn, 1);
    let client = Arc::new(RecordingClient::default());

    let (mut reader, writer) = tokio::io::duplex(4);
    let task = handle.read_range(3, 100, writer, Some(client.clone() as Arc<dyn BlobReaderClient>));
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let outcome = task.await.unwrap();

    assert_eq!(out, b"3456789".to_vec());
    assert_eq!(outcome.bytes_transferred, 7);
    assert_eq!(*client.sizes.lock(), vec![(10, 7)]);
    assert_eq!(*client.completions.lock(), vec![(ReadResult::Success, 7)]);
}

#[tokio::test]
async fn test_read_into_closed_pipe_is_aborted() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "aborted").await;
    store_blob(&db, &payload(64)).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let handle = vend(&txn, 1);
    let (reader, writer) = tokio::io::duplex(4);
    drop(reader);

    let outcome = handle.read_all(writer, None).await.unwrap();
    assert_eq!(outcome.result, ReadResult::Aborted);
    assert_eq!(outcome.bytes_transferred, 0);
}

#[tokio::test]
async fn test_client_connections_share_one_active_blob() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "shared").await;
    store_blob(&db, b"shared bytes").await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let first = vend(&txn, 1);
    assert_eq!(first.connection_count(), 1);

    let second = first.clone_handle();
    let getter = first.data_pipe_getter();
    let third = vend(&txn, 1);
    assert_eq!(third.uuid(), first.uuid());
    assert_eq!(first.connection_count(), 4);
    assert_eq!(db.active_blob_count().unwrap(), 1);

    let (mut reader, writer) = tokio::io::duplex(64);
    let task = getter.read(writer);
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(task.await.unwrap().bytes_transferred, getter.size());
    assert_eq!(out, b"shared bytes".to_vec());

    drop(first);
    drop(second);
    drop(getter);
    assert_eq!(db.active_blob_count().unwrap(), 1);
    drop(third);
    assert_eq!(db.active_blob_count().unwrap(), 0);
}

#[tokio::test]
async fn test_registry_reader_outlives_client_connections() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "registry").await;
    store_blob(&db, b"registered").await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let handle = vend(&txn, 1);
    let uuid = handle.uuid();
    assert!(store.blob_registry().is_registered(&uuid));

    let reader = store.blob_registry().reader(&uuid).unwrap();
    assert_eq!(reader.size(), 10);
    drop(handle);
    assert!(!store.blob_registry().is_registered(&uuid));
    assert!(store.blob_registry().reader(&uuid).is_none());
    assert_eq!(db.active_blob_count().unwrap(), 1);

    let (mut pipe, writer) = tokio::io::duplex(8);
    let task = reader.read(0, 4, writer, None);
    let mut out = Vec::new();
    pipe.read_to_end(&mut out).await.unwrap();
    task.await.unwrap();
    assert_eq!(out, b"regi".to_vec());

    drop(reader);
    assert_eq!(db.active_blob_count().unwrap(), 0);
}

#[tokio::test]
async fn test_active_blob_survives_record_deletion() {
    let store = small_chunk_store();
    let db = open_database(&store, "survivor").await;
    let bytes = payload(200);
    store_blob(&db, &bytes).await;

    let reader_txn = begin(&db, TransactionMode::ReadOnly);
    let handle = vend(&reader_txn, 1);
    drop(reader_txn);

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.delete_range(STORE, &KeyRange::unbounded()).unwrap();
    txn.commit().await.unwrap();

    assert_eq!(read_all(&handle).await, bytes);
}

#[tokio::test]
async fn test_inactive_blob_releases_its_bytes() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "release").await;
    store_blob(&db, b"short lived").await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let value = txn.get_value(STORE, &Key::from(1)).unwrap().unwrap();
    let handle = vend(&txn, 1);
    drop(txn);

    // Going inactive during a write defers the reference cleanup to its end
    let mut txn = begin(&db, TransactionMode::ReadWrite);
    drop(handle);
    txn.delete_range(STORE, &KeyRange::unbounded()).unwrap();
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    assert!(txn
        .create_all_external_objects(&value.external_objects)
        .is_err());
    assert_eq!(db.active_blob_count().unwrap(), 0);
}

#[tokio::test]
async fn test_blob_vended_in_rolled_back_transaction_stays_readable() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "resurrect").await;
    store_blob(&db, b"keep me").await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    let handle = vend(&txn, 1);
    txn.rollback();

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.delete_range(STORE, &KeyRange::unbounded()).unwrap();
    txn.commit().await.unwrap();

    assert_eq!(read_all(&handle).await, b"keep me".to_vec());
}

#[tokio::test]
async fn test_stored_blob_shared_by_two_records() {
    let store = SqliteBackingStore::in_memory();
    let db = open_database(&store, "dedup").await;
    store_blob(&db, b"common").await;

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    let value = txn.get_value(STORE, &Key::from(1)).unwrap().unwrap();
    let blob_number = value.external_objects[0].blob_number();
    txn.put_record(STORE, &Key::from(2), value).unwrap();
    txn.delete_range(STORE, &KeyRange::only(Key::from(1)))
        .unwrap();
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    let value = txn.get_value(STORE, &Key::from(2)).unwrap().unwrap();
    assert_eq!(value.external_objects[0].blob_number(), blob_number);
    assert_eq!(read_all(&vend(&txn, 2)).await, b"common".to_vec());
}

#[tokio::test]
async fn test_deleted_database_lingers_for_active_blob() {
    let store = small_chunk_store();
    let db = open_database(&store, "zygote").await;
    let bytes = payload(100);
    store_blob(&db, &bytes).await;

    let txn = begin(&db, TransactionMode::ReadOnly);
    let handle = vend(&txn, 1);
    drop(txn);

    store.delete_database("zygote").unwrap();
    assert!(store.has_database("zygote"));
    assert!(db.is_zygotic().unwrap());
    let metadata = db.metadata().unwrap();
    assert!(metadata.object_stores.is_empty());

    let txn = begin(&db, TransactionMode::ReadOnly);
    assert!(txn.get_value(STORE, &Key::from(1)).unwrap().is_none());
    drop(txn);

    assert_eq!(read_all(&handle).await, bytes);

    drop(handle);
    assert!(!store.has_database("zygote"));
    assert!(db.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_waits_for_every_blob_writer() {
    let store = small_chunk_store();
    let db = open_database(&store, "many_blobs").await;
    let gate = Arc::new(Notify::new());
    let contents = [payload(100), payload(250), payload(40)];

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), blob_value(&contents[0]))
        .unwrap();
    txn.put_record(STORE, &Key::from(2), gated_value(&contents[1], &gate))
        .unwrap();
    txn.put_record(STORE, &Key::from(3), blob_value(&contents[2]))
        .unwrap();

    let BlobWriteCompletion::Pending(mut receiver) = txn.commit_phase_one().unwrap() else {
        panic!("three pending blobs should start writers");
    };
    // Two writers can finish, the gated one cannot
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut receiver)
        .await
        .is_err());

    gate.notify_one();
    assert_eq!(receiver.await.unwrap(), BlobWriteResult::Success);
    txn.commit_phase_two().unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    for (key, bytes) in [1, 2, 3].into_iter().zip(contents.iter()) {
        assert_eq!(&read_all(&vend(&txn, key)).await, bytes);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_failed_writer_fails_the_commit() {
    let store = small_chunk_store();
    let db = open_database(&store, "one_broken").await;
    let gate = Arc::new(Notify::new());

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    txn.put_record(STORE, &Key::from(1), blob_value(&payload(64)))
        .unwrap();
    txn.put_record(STORE, &Key::from(2), gated_value(&payload(64), &gate))
        .unwrap();
    let broken = ExternalObject::blob(Arc::new(BrokenSource), "text/plain", 10);
    txn.put_record(
        STORE,
        &Key::from(3),
        Value::with_external_objects(b"b".to_vec(), vec![broken]),
    )
    .unwrap();

    // Fails without waiting for the gated writer
    let result = tokio::time::timeout(Duration::from_secs(5), txn.commit())
        .await
        .expect("commit should not wait for the remaining writers");
    assert!(matches!(result, Err(StoreError::BlobWrite(_))));
    gate.notify_one();

    let mut txn = begin(&db, TransactionMode::ReadWrite);
    assert_eq!(
        txn.get_object_store_key_count(STORE, &KeyRange::unbounded())
            .unwrap(),
        0
    );
    txn.put_record(STORE, &Key::from(4), blob_value(b"after"))
        .unwrap();
    txn.commit().await.unwrap();

    let txn = begin(&db, TransactionMode::ReadOnly);
    assert_eq!(read_all(&vend(&txn, 4)).await, b"after".to_vec());
}
