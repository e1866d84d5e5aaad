//! Integration tests for the file-per-document update store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact};

use yrelay::callback::MetadataCallback;
use yrelay::error::Error;
use yrelay::store::{FileStore, UpdateStore};

fn counting_metadata() -> MetadataCallback {
    let counter = Arc::new(AtomicU64::new(0));
    MetadataCallback::sync(move |()| {
        let i = counter.fetch_add(1, Ordering::SeqCst);
        i.to_string().into_bytes()
    })
}

fn full_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

#[tokio::test]
async fn writes_read_back_in_order_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.y");
    let store = FileStore::new(&path).with_metadata(counting_metadata());
    store.start().await.unwrap();

    for data in [b"foo".as_slice(), b"bar", b"baz"] {
        store.write(data).await.unwrap();
    }
    assert!(path.exists());

    let mut records = store.read().await.unwrap();
    let mut seen = Vec::new();
    while let Some(record) = records.next().await {
        seen.push(record.unwrap());
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].update, b"foo");
    assert_eq!(seen[1].update, b"bar");
    assert_eq!(seen[2].update, b"baz");
    assert_eq!(seen[0].metadata, b"0");
    assert_eq!(seen[1].metadata, b"1");
    assert_eq!(seen[2].metadata, b"2");
    assert!(seen[0].timestamp <= seen[1].timestamp);
    assert!(seen[1].timestamp <= seen[2].timestamp);
}

#[tokio::test]
async fn reading_an_absent_document_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("missing.y"));
    store.start().await.unwrap();
    assert!(matches!(store.read().await, Err(Error::DocumentNotFound)));
}

#[tokio::test]
async fn version_mismatch_moves_file_aside() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.y");

    {
        let store = FileStore::new(&path);
        store.start().await.unwrap();
        store.write(b"old data").await.unwrap();
        store.stop().await.unwrap();
    }
    // stamp the file as written by some other version
    std::fs::write(&path, b"VERSION:999\nleftover").unwrap();

    let store = FileStore::new(&path);
    store.start().await.unwrap();
    store.write(b"new data").await.unwrap();

    let rotated = dir.path().join("doc(1).y");
    assert!(rotated.exists());
    assert_eq!(std::fs::read(&rotated).unwrap(), b"VERSION:999\nleftover");

    let mut records = store.read().await.unwrap();
    let first = records.next().await.unwrap().unwrap();
    assert_eq!(first.update, b"new data");
    assert!(records.next().await.is_none());
}

#[tokio::test]
async fn torn_tail_record_loses_only_itself() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.y");
    let store = FileStore::new(&path);
    store.start().await.unwrap();
    store.write(b"one").await.unwrap();
    store.write(b"two").await.unwrap();

    // simulate a crash mid-append: a length prefix promising more bytes
    // than were written
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[60, 1, 2, 3]).unwrap();

    let mut records = store.read().await.unwrap();
    let mut seen = Vec::new();
    while let Some(record) = records.next().await {
        seen.push(record.unwrap().update);
    }
    assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
}

#[tokio::test]
async fn apply_updates_replays_history_into_a_doc() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("doc.y"));
    store.start().await.unwrap();

    let source = Doc::new();
    let text = source.get_or_insert_text("content");
    {
        let mut txn = source.transact_mut();
        text.push(&mut txn, "hello");
    }
    store.write(&full_state(&source)).await.unwrap();
    {
        let mut txn = source.transact_mut();
        text.push(&mut txn, " world");
    }
    store.write(&full_state(&source)).await.unwrap();

    let replica = Doc::new();
    store.apply_updates(&replica).await.unwrap();
    let text = replica.get_or_insert_text("content");
    let txn = replica.transact();
    assert_eq!(text.get_string(&txn), "hello world");
}

#[tokio::test]
async fn encode_state_as_update_snapshots_the_doc() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("doc.y"));
    store.start().await.unwrap();

    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    {
        let mut txn = doc.transact_mut();
        text.push(&mut txn, "snapshot me");
    }
    store.encode_state_as_update(&doc).await.unwrap();

    let replica = Doc::new();
    store.apply_updates(&replica).await.unwrap();
    let text = replica.get_or_insert_text("content");
    let txn = replica.transact();
    assert_eq!(text.get_string(&txn), "snapshot me");
}

#[tokio::test]
async fn async_metadata_callbacks_are_awaited() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("doc.y"))
        .with_metadata(MetadataCallback::async_fn(|()| async { b"meta".to_vec() }));
    store.start().await.unwrap();
    store.write(b"data").await.unwrap();

    let mut records = store.read().await.unwrap();
    let record = records.next().await.unwrap().unwrap();
    assert_eq!(record.metadata, b"meta");
}
