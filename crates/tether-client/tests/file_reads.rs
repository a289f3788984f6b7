use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_client::{
    BlobStore, Client, ClientOptions, ClientUpdate, Envelope, MemoryBackend, ReadFileRequest,
    ReadOrigin, SqliteBlobStore,
};
use tether_transport::native::BroadcastHub;
use tether_transport::Platform;
use tokio::sync::broadcast;

struct Harness {
    client: Client,
    backend: Arc<MemoryBackend>,
    blobs: Arc<SqliteBlobStore>,
    updates: broadcast::Receiver<ClientUpdate>,
}

fn harness() -> Harness {
    let platform = Platform::window().with_native(BroadcastHub::new());
    let (backend, responses) = MemoryBackend::new();
    let blobs = Arc::new(SqliteBlobStore::in_memory().expect("blob store"));
    let client = Client::new(
        &platform,
        backend.clone(),
        responses,
        blobs.clone(),
        ClientOptions::default(),
    )
    .expect("client");
    let updates = client.subscribe();
    Harness {
        client,
        backend,
        blobs,
        updates,
    }
}

impl Harness {
    /// Emits an `updateFile` and waits until the client republished it.
    async fn push_file(&mut self, file: serde_json::Value) -> Envelope {
        self.backend
            .emit(Envelope::new("updateFile").with("file", file));
        loop {
            let update = tokio::time::timeout(Duration::from_secs(5), self.updates.recv())
                .await
                .expect("update in time")
                .expect("update stream open");
            if let ClientUpdate::Backend(env) = update {
                if env.type_name() == "updateFile" {
                    return env;
                }
            }
        }
    }
}

#[tokio::test]
async fn inline_bytes_are_cached_and_stripped_from_updates() {
    let mut h = harness();
    let forwarded = h
        .push_file(json!({"id": 3, "size": 6, "arr": [1, 2, 3, 4, 5, 6], "remote": {"id": "r3"}}))
        .await;

    let file = forwarded.get("file").expect("file field");
    assert!(file.get("arr").is_none());
    assert_eq!(file["local"]["is_downloading_completed"], json!(true));
    assert_eq!(file["remote"], json!({"id": "r3"}));

    let part = h
        .client
        .send(Envelope::new("readFilePart").with("file_id", 3).with("offset", 1).with("count", 2))
        .await
        .expect("read part");
    assert_eq!(part.get("data"), Some(&json!([2, 3])));
    assert_eq!(part.get_i64("transaction_id"), Some(-1));
    assert!(h.backend.posted().is_empty());
}

#[tokio::test]
async fn downloading_files_are_read_through_the_backend() {
    let mut h = harness();
    h.backend.add_local_file(9, "/downloads/9", &b"abcdefgh"[..]);
    h.push_file(json!({
        "id": 9,
        "size": 100,
        "local": {"path": "/downloads/9", "is_downloading_active": true}
    }))
    .await;

    let part = h
        .client
        .read_file(&ReadFileRequest::range(9, 2, 4))
        .await
        .expect("live read");
    assert_eq!(&part.data[..], b"cdef");
    assert_eq!(part.origin, ReadOrigin::LiveProbe);
    assert_eq!(
        h.backend.posted_types(),
        vec!["getFileDownloadedPrefixSize", "readFilePart"]
    );
}

#[tokio::test]
async fn stored_blob_is_preferred_over_a_live_download() {
    let mut h = harness();
    h.blobs.put("blob-4", b"0123456789").expect("put");
    h.push_file(json!({"id": 4, "size": 10, "idb_key": "blob-4"}))
        .await;
    h.push_file(json!({
        "id": 4,
        "size": 10,
        "local": {"path": "/gone", "is_downloading_active": true}
    }))
    .await;

    let part = h
        .client
        .read_file(&ReadFileRequest::range(4, 3, 4))
        .await
        .expect("read");
    assert!(matches!(part.origin, ReadOrigin::Persistent { .. }));
    assert_eq!(&part.data[..], b"0123456789");
    assert_eq!(h.client.file_cache().stats().persistent_reads, 1);
    assert!(h.backend.posted().is_empty());
}

#[tokio::test]
async fn delete_file_removes_cache_entry_blob_and_backend_copy() {
    let mut h = harness();
    h.blobs.put("blob-8", b"payload").expect("put");
    h.push_file(json!({"id": 8, "idb_key": "blob-8"})).await;

    let response = h
        .client
        .send(Envelope::new("deleteFile").with("file_id", 8))
        .await
        .expect("delete");
    assert_eq!(response.type_name(), "ok");
    assert!(!h.client.file_cache().contains(8));
    assert_eq!(h.blobs.get_many(&["blob-8".to_string()]).expect("get")[0], None);
    assert_eq!(h.backend.posted_types(), vec!["deleteFile"]);
}
