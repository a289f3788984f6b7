use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backend::BackendPort;
use crate::envelope::{Envelope, QueryTag};
use crate::error::ClientError;
use crate::file_cache::LiveProbe;

struct PendingQuery {
    reply: oneshot::Sender<Result<Envelope, ClientError>>,
    original: Option<Value>,
}

/// Multiplexes calls over one backend port by tagging `@extra`.
pub struct QueryCorrelator {
    backend: Arc<dyn BackendPort>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingQuery>>,
}

impl QueryCorrelator {
    pub fn new(backend: Arc<dyn BackendPort>) -> Self {
        Self {
            backend,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingQuery>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Posts `envelope` and resolves with the matching response.
    ///
    /// There is no timeout; a call the backend never answers stays pending
    /// until [`fail_pending`](Self::fail_pending).
    pub async fn send(&self, mut envelope: Envelope) -> Result<Envelope, ClientError> {
        let query_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let original = envelope.take_extra();
        let tag = QueryTag {
            query_id,
            original: original.clone(),
        };
        envelope.set_extra(Some(serde_json::to_value(&tag)?));

        let (reply, rx) = oneshot::channel();
        self.pending()
            .insert(query_id, PendingQuery { reply, original });
        if let Err(err) = self.backend.post(envelope) {
            self.pending().remove(&query_id);
            return Err(err);
        }
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Completes the call a response belongs to.
    ///
    /// Returns envelopes that carry no query tag, so the caller can publish
    /// them as updates.
    pub fn dispatch_response(&self, mut envelope: Envelope) -> Option<Envelope> {
        let tag = envelope
            .extra()
            .and_then(|extra| serde_json::from_value::<QueryTag>(extra.clone()).ok());
        let Some(tag) = tag else {
            return Some(envelope);
        };
        let Some(pending) = self.pending().remove(&tag.query_id) else {
            warn!(query_id = tag.query_id, kind = envelope.type_name(), "response for unknown query");
            return None;
        };
        envelope.set_extra(pending.original.or(tag.original));

        let result = match envelope.error_parts() {
            Some((code, message)) => Err(ClientError::Backend { code, message }),
            None => Ok(envelope),
        };
        if pending.reply.send(result).is_err() {
            debug!(query_id = tag.query_id, "caller dropped before response arrived");
        }
        None
    }

    /// Fails every outstanding call with [`ClientError::Closed`].
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<PendingQuery> = self.pending().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.reply.send(Err(ClientError::Closed));
        }
        count
    }
}

impl LiveProbe for QueryCorrelator {
    async fn downloaded_prefix_size(&self, file_id: i64, offset: u64) -> Result<u64, ClientError> {
        let response = self
            .send(
                Envelope::new("getFileDownloadedPrefixSize")
                    .with("file_id", file_id)
                    .with("offset", offset),
            )
            .await?;
        response
            .get_u64("count")
            .ok_or_else(|| ClientError::Malformed("fileDownloadedPrefixSize without count".into()))
    }

    async fn read_part(&self, path: &str, offset: u64, size: u64) -> Result<Bytes, ClientError> {
        let mut response = self
            .send(
                Envelope::new("readFilePart")
                    .with("path", path)
                    .with("offset", offset)
                    .with("size", size),
            )
            .await?;
        let data = response
            .remove("data")
            .ok_or_else(|| ClientError::Malformed("filePart without data".into()))?;
        Ok(serde_json::from_value::<Bytes>(data)?)
    }
}
