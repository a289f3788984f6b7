use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Persistent key/blob storage holding completed file contents.
pub trait BlobStore: Send + Sync + 'static {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), ClientError>;

    /// Reads every key inside one transaction, preserving order.
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, ClientError>;

    /// Returns whether a blob was removed.
    fn delete(&self, key: &str) -> Result<bool, ClientError>;
}

pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
}

impl SqliteBlobStore {
    pub fn open(path: &Path) -> Result<Self, ClientError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, ClientError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ClientError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS blobs (
               key TEXT PRIMARY KEY,
               data BLOB NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BlobStore for SqliteBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), ClientError> {
        self.conn().execute(
            "INSERT INTO blobs (key, data) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET data=excluded.data",
            params![key, data],
        )?;
        Ok(())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, ClientError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(keys.len());
        {
            let mut stmt = tx.prepare_cached("SELECT data FROM blobs WHERE key=?1")?;
            for key in keys {
                let data: Option<Vec<u8>> = stmt
                    .query_row([key], |row| row.get(0))
                    .optional()?;
                out.push(data.map(Bytes::from));
            }
        }
        tx.commit()?;
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<bool, ClientError> {
        let changed = self
            .conn()
            .execute("DELETE FROM blobs WHERE key=?1", [key])?;
        Ok(changed > 0)
    }
}

type BlobReply = oneshot::Sender<Result<Option<Bytes>, ClientError>>;

struct Batch {
    id: i64,
    requests: Vec<(String, BlobReply)>,
}

/// Coalesces blob reads issued in the same scheduler tick into one
/// [`BlobStore::get_many`] transaction.
pub struct ReadBatcher {
    store: Arc<dyn BlobStore>,
    pending: Arc<Mutex<Option<Batch>>>,
    next_id: AtomicI64,
}

impl ReadBatcher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(None)),
            next_id: AtomicI64::new(1),
        }
    }

    /// Reads `key`; returns the blob and the id of the transaction that read it.
    pub async fn read(&self, key: String) -> Result<(Option<Bytes>, i64), ClientError> {
        let (tx, rx) = oneshot::channel();
        let (batch_id, leader) = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            match pending.as_mut() {
                Some(batch) => {
                    batch.requests.push((key, tx));
                    (batch.id, false)
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    *pending = Some(Batch {
                        id,
                        requests: vec![(key, tx)],
                    });
                    (id, true)
                }
            }
        };

        if leader {
            let pending = Arc::clone(&self.pending);
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let batch = pending.lock().unwrap_or_else(|p| p.into_inner()).take();
                if let Some(batch) = batch {
                    flush(store, batch).await;
                }
            });
        }

        let result = rx.await.map_err(|_| ClientError::Closed)?;
        Ok((result?, batch_id))
    }
}

async fn flush(store: Arc<dyn BlobStore>, batch: Batch) {
    let (keys, replies): (Vec<String>, Vec<BlobReply>) = batch.requests.into_iter().unzip();
    debug!(transaction = batch.id, reads = keys.len(), "flushing blob read batch");
    let outcome = tokio::task::spawn_blocking(move || store.get_many(&keys)).await;
    match outcome {
        Ok(Ok(blobs)) => {
            for (reply, blob) in replies.into_iter().zip(blobs) {
                let _ = reply.send(Ok(blob));
            }
        }
        Ok(Err(err)) => {
            warn!(transaction = batch.id, "blob read batch failed: {err}");
            let message = err.to_string();
            for reply in replies {
                let _ = reply.send(Err(ClientError::Store(message.clone())));
            }
        }
        Err(join_err) => {
            warn!(transaction = batch.id, "blob read batch panicked: {join_err}");
            for reply in replies {
                let _ = reply.send(Err(ClientError::Store(join_err.to_string())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BlobStore, ReadBatcher, SqliteBlobStore};

    #[test]
    fn sqlite_store_round_trips_and_deletes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteBlobStore::open(&dir.path().join("blobs.db")).expect("open");
        store.put("a", b"hello").expect("put");
        store.put("a", b"hello again").expect("overwrite");
        let got = store
            .get_many(&["a".to_string(), "missing".to_string()])
            .expect("get");
        assert_eq!(got[0].as_deref(), Some(&b"hello again"[..]));
        assert!(got[1].is_none());
        assert!(store.delete("a").expect("delete"));
        assert!(!store.delete("a").expect("second delete"));
    }

    #[tokio::test]
    async fn reads_in_the_same_tick_share_one_transaction() {
        let store = Arc::new(SqliteBlobStore::in_memory().expect("store"));
        store.put("x", b"xx").expect("put");
        store.put("y", b"yyy").expect("put");
        let batcher = ReadBatcher::new(store);

        let (x, y) = tokio::join!(batcher.read("x".into()), batcher.read("y".into()));
        let (x, x_tx) = x.expect("x");
        let (y, y_tx) = y.expect("y");
        assert_eq!(x.as_deref(), Some(&b"xx"[..]));
        assert_eq!(y.as_deref(), Some(&b"yyy"[..]));
        assert_eq!(x_tx, y_tx);

        let (_, later_tx) = batcher.read("x".into()).await.expect("later");
        assert_ne!(later_tx, x_tx);
    }
}
