use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tether_arbiter::{ArbiterOptions, Arbitration, InstanceArbiter, InstanceState};
use tether_transport::Platform;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendPort;
use crate::blob_store::BlobStore;
use crate::correlator::QueryCorrelator;
use crate::envelope::{Envelope, ReadFileRequest, Request};
use crate::error::ClientError;
use crate::file_cache::{FileCache, FileCacheOptions, FileMetadata, FilePart};

const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub arbiter: ArbiterOptions,
    pub cache: FileCacheOptions,
    /// Upper bound on the backend `close` handshake.
    pub close_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            arbiter: ArbiterOptions::default(),
            cache: FileCacheOptions::default(),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Events published on [`Client::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    /// Untagged envelope from the backend.
    Backend(Envelope),
    State(InstanceState),
}

struct ClientInner {
    arbiter: InstanceArbiter,
    correlator: QueryCorrelator,
    cache: FileCache,
    blobs: Arc<dyn BlobStore>,
    backend: Arc<dyn BackendPort>,
    updates: broadcast::Sender<ClientUpdate>,
    close_timeout: Duration,
    shutting_down: AtomicBool,
}

impl ClientInner {
    fn publish(&self, update: ClientUpdate) {
        let _ = self.updates.send(update);
    }

    /// Registers file metadata found in `envelope` and strips inline bytes.
    fn absorb_files(&self, envelope: &mut Envelope) {
        match envelope.type_name() {
            "file" => {
                let value = envelope.clone().into_value();
                if let Some(stripped) = self.register_value(value) {
                    if let Ok(replacement) = Envelope::from_fields(stripped) {
                        *envelope = replacement;
                    }
                }
            }
            "updateFile" => {
                let Some(file) = envelope.remove("file") else {
                    return;
                };
                let file = self.register_value(file.clone()).unwrap_or(file);
                envelope.insert("file", file);
            }
            _ => {}
        }
    }

    fn register_value(&self, mut value: Value) -> Option<Value> {
        let metadata: FileMetadata = match serde_json::from_value(value.clone()) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("malformed file metadata from backend: {err}");
                return None;
            }
        };
        let registered = self.cache.register_file(metadata);
        let fields = value.as_object_mut()?;
        fields.remove("arr");
        if let Some(key) = registered.persistent_key {
            fields.insert("idb_key".to_string(), Value::String(key));
        }
        let local = fields
            .entry("local".to_string())
            .or_insert_with(|| json!({}));
        if let Some(local) = local.as_object_mut() {
            local.insert(
                "is_downloading_completed".to_string(),
                Value::Bool(registered.local.is_downloading_completed),
            );
        }
        Some(value)
    }

    fn handle_backend(&self, mut envelope: Envelope) {
        self.absorb_files(&mut envelope);
        if let Some(update) = self.correlator.dispatch_response(envelope) {
            self.publish(ClientUpdate::Backend(update));
        }
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.arbiter.state() {
            InstanceState::Start | InstanceState::Closed => {
                self.arbiter.close();
                self.publish(ClientUpdate::Backend(closed_update()));
            }
            InstanceState::Active | InstanceState::Closing => {
                self.arbiter.set_state(InstanceState::Closing);
                let close = self.correlator.send(Envelope::new("close"));
                match tokio::time::timeout(self.close_timeout, close).await {
                    Ok(Ok(_)) => debug!("backend acknowledged close"),
                    Ok(Err(err)) => warn!("backend close failed: {err}"),
                    Err(_) => warn!(timeout = ?self.close_timeout, "backend close timed out"),
                }
                self.arbiter.close();
            }
        }
        let failed = self.correlator.fail_pending();
        if failed > 0 {
            debug!(failed, "failed outstanding calls on shutdown");
        }
        info!("client closed");
    }
}

fn closed_update() -> Envelope {
    Envelope::new("updateAuthorizationState")
        .with("authorization_state", json!({ "@type": "authorizationStateClosed" }))
}

/// One application instance: arbitration, backend calls, file reads.
pub struct Client {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Builds the client and starts pumping `responses` from the backend.
    pub fn new(
        platform: &Platform,
        backend: Arc<dyn BackendPort>,
        mut responses: mpsc::UnboundedReceiver<Envelope>,
        blobs: Arc<dyn BlobStore>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let arbiter = InstanceArbiter::new(platform, options.arbiter)?;
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let inner = Arc::new(ClientInner {
            correlator: QueryCorrelator::new(Arc::clone(&backend)),
            cache: FileCache::new(options.cache, Arc::clone(&platform.clock), Arc::clone(&blobs)),
            arbiter,
            blobs,
            backend,
            updates,
            close_timeout: options.close_timeout,
            shutting_down: AtomicBool::new(false),
        });

        let pump_inner = Arc::clone(&inner);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = responses.recv().await {
                pump_inner.handle_backend(envelope);
            }
            debug!("backend response stream ended");
        });

        let mut states = inner.arbiter.subscribe_state();
        let state_updates = inner.updates.clone();
        let state_pump = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let _ = state_updates.send(ClientUpdate::State(state));
            }
        });

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![pump, state_pump]),
        })
    }

    /// Arbitrates; on a win starts the backend and watches for takeover.
    pub async fn run(&self) -> Result<Arbitration, ClientError> {
        let outcome = self.inner.arbiter.arbitrate().await?;
        match outcome {
            Arbitration::Won => {
                self.inner.backend.post(Envelope::new("start"))?;
                let mut takeover = self.inner.arbiter.watch_takeover();
                let inner = Arc::clone(&self.inner);
                let watcher = tokio::spawn(async move {
                    while takeover.changed().await.is_ok() {
                        if *takeover.borrow_and_update() {
                            info!("another instance took over; closing");
                            inner.shutdown().await;
                            break;
                        }
                    }
                });
                self.tasks
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(watcher);
            }
            Arbitration::Lost => {
                info!("instance lost arbitration; closing without backend");
                self.inner.shutdown().await;
            }
        }
        Ok(outcome)
    }

    /// Sends a call, answering intercepted operations locally.
    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, ClientError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        match Request::classify(envelope) {
            Request::Unsupported(method) => Err(ClientError::Unsupported(method.name())),
            Request::ReadFile(request) => Ok(self.read_file(&request).await?.to_envelope()),
            Request::DeleteFile { file_id, envelope } => {
                if let Some(key) = self.inner.cache.delete_file(file_id) {
                    let blobs = Arc::clone(&self.inner.blobs);
                    let removed = tokio::task::spawn_blocking(move || blobs.delete(&key))
                        .await
                        .map_err(|err| ClientError::Store(err.to_string()))??;
                    debug!(file_id, removed, "deleted stored blob");
                }
                self.inner.correlator.send(envelope).await
            }
            Request::Forward(envelope) => self.inner.correlator.send(envelope).await,
        }
    }

    pub async fn read_file(&self, request: &ReadFileRequest) -> Result<FilePart, ClientError> {
        self.inner
            .cache
            .read_file(request, &self.inner.correlator)
            .await
    }

    pub fn file_cache(&self) -> &FileCache {
        &self.inner.cache
    }

    pub fn state(&self) -> InstanceState {
        self.inner.arbiter.state()
    }

    pub fn uid(&self) -> String {
        self.inner.arbiter.uid()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Shuts the instance down; see [`InstanceState`] for the handshake.
    pub async fn close(&self) {
        self.inner.shutdown().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        self.inner.correlator.fail_pending();
    }
}
