use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::{Envelope, EXTRA_KEY};
use crate::error::ClientError;

/// Outgoing half of the backend worker channel. Responses and updates come
/// back on the receiver handed to [`crate::client::Client::new`].
pub trait BackendPort: Send + Sync {
    fn post(&self, envelope: Envelope) -> Result<(), ClientError>;
}

#[derive(Default)]
struct MemoryState {
    posted: Vec<Envelope>,
    files: HashMap<String, (i64, Bytes)>,
}

/// In-process backend answering the handful of calls the client itself makes.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    fail_posts: AtomicBool,
    responses: mpsc::UnboundedSender<Envelope>,
}

impl MemoryBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (responses, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
            fail_posts: AtomicBool::new(false),
            responses,
        });
        (backend, rx)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes a partially downloaded file readable at `path`.
    pub fn add_local_file(&self, file_id: i64, path: &str, data: impl Into<Bytes>) {
        self.lock()
            .files
            .insert(path.to_string(), (file_id, data.into()));
    }

    pub fn set_fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn posted(&self) -> Vec<Envelope> {
        self.lock().posted.clone()
    }

    pub fn posted_types(&self) -> Vec<String> {
        self.lock()
            .posted
            .iter()
            .map(|env| env.type_name().to_string())
            .collect()
    }

    /// Pushes an unsolicited update to the client.
    pub fn emit(&self, envelope: Envelope) {
        let _ = self.responses.send(envelope);
    }

    fn reply(&self, request: &Envelope, mut response: Envelope) {
        if let Some(extra) = request.extra() {
            response.insert(EXTRA_KEY, extra.clone());
        }
        self.emit(response);
    }

    fn not_found(&self, request: &Envelope) {
        let response = Envelope::new("error")
            .with("code", 404)
            .with("message", "Not Found");
        self.reply(request, response);
    }

    fn answer(&self, request: &Envelope) {
        match request.type_name() {
            "close" => {
                self.reply(request, Envelope::new("ok"));
                self.emit(authorization_update("authorizationStateClosed"));
            }
            "start" => {
                self.emit(authorization_update("authorizationStateReady"));
            }
            "getFileDownloadedPrefixSize" => {
                let file_id = request.get_i64("file_id").unwrap_or_default();
                let offset = request.get_u64("offset").unwrap_or_default();
                let len = self
                    .lock()
                    .files
                    .values()
                    .find(|(id, _)| *id == file_id)
                    .map(|(_, data)| data.len() as u64);
                match len {
                    Some(len) => self.reply(
                        request,
                        Envelope::new("fileDownloadedPrefixSize")
                            .with("count", len.saturating_sub(offset)),
                    ),
                    None => self.not_found(request),
                }
            }
            "readFilePart" => {
                let path = request
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let offset = request.get_u64("offset").unwrap_or_default() as usize;
                let size = request.get_u64("size").unwrap_or_default() as usize;
                let data = self.lock().files.get(&path).map(|(_, data)| {
                    let start = offset.min(data.len());
                    let end = start.saturating_add(size).min(data.len());
                    data.slice(start..end)
                });
                match data {
                    Some(data) => self.reply(
                        request,
                        Envelope::new("filePart").with("data", data.to_vec()),
                    ),
                    None => self.not_found(request),
                }
            }
            _ => self.reply(request, Envelope::new("ok")),
        }
    }
}

fn authorization_update(state: &str) -> Envelope {
    Envelope::new("updateAuthorizationState").with("authorization_state", json!({ "@type": state }))
}

impl BackendPort for MemoryBackend {
    fn post(&self, envelope: Envelope) -> Result<(), ClientError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(ClientError::BackendUnavailable(
                "memory backend refuses posts".into(),
            ));
        }
        debug!(kind = envelope.type_name(), "memory backend received call");
        self.lock().posted.push(envelope.clone());
        self.answer(&envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{BackendPort, MemoryBackend};
    use crate::envelope::Envelope;

    #[test]
    fn echoes_extra_and_answers_file_calls() {
        let (backend, mut rx) = MemoryBackend::new();
        backend.add_local_file(5, "/dl/5", &b"abcdef"[..]);

        backend
            .post(Envelope::new("getMe").with("@extra", json!(1)))
            .expect("post");
        let ok = rx.try_recv().expect("ok response");
        assert_eq!(ok.type_name(), "ok");
        assert_eq!(ok.extra(), Some(&json!(1)));

        backend
            .post(Envelope::new("getFileDownloadedPrefixSize").with("file_id", 5).with("offset", 2))
            .expect("post");
        assert_eq!(rx.try_recv().expect("size").get_u64("count"), Some(4));

        backend
            .post(
                Envelope::new("readFilePart")
                    .with("path", "/dl/5")
                    .with("offset", 1)
                    .with("size", 2),
            )
            .expect("post");
        assert_eq!(
            rx.try_recv().expect("part").get("data"),
            Some(&json!([98, 99]))
        );

        backend
            .post(Envelope::new("readFilePart").with("path", "/nope"))
            .expect("post");
        assert_eq!(
            rx.try_recv().expect("error").error_parts(),
            Some((404, "Not Found".to_string()))
        );
    }

    #[test]
    fn refuses_posts_when_told_to() {
        let (backend, _rx) = MemoryBackend::new();
        backend.set_fail_posts(true);
        assert!(backend.post(Envelope::new("getMe")).is_err());
        assert!(backend.posted().is_empty());
    }
}
