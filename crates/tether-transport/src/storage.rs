use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::names::{random_token, storage_key};
use tether_core::{ChannelMessage, DedupSet, MicroClock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{ChannelTransport, MessageSink, StatsCounters, TransportKind, TransportStats};
use crate::error::TransportError;
use crate::platform::{ContextKind, Platform};

/// Change notification for one storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

struct ListenerEntry {
    id: u64,
    document: u64,
    tx: mpsc::UnboundedSender<StorageEvent>,
}

/// Key/value area shared by every document of one origin.
#[derive(Default)]
pub struct StorageArea {
    items: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

impl StorageArea {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a new document view onto this area.
    pub fn document(self: &Arc<Self>) -> StorageDocument {
        StorageDocument {
            area: Arc::clone(self),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self, event: &StorageEvent, matches: impl Fn(u64) -> bool) {
        self.listeners()
            .retain(|entry| !matches(entry.document) || entry.tx.send(event.clone()).is_ok());
    }
}

impl fmt::Debug for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageArea")
            .field("items", &self.items().len())
            .field("listeners", &self.listeners().len())
            .finish()
    }
}

/// One browsing context's handle onto a [`StorageArea`].
///
/// Writes notify the listeners of every *other* document, never its own.
#[derive(Debug, Clone)]
pub struct StorageDocument {
    area: Arc<StorageArea>,
    id: u64,
}

impl StorageDocument {
    pub fn set_item(&self, key: &str, value: &str) {
        self.area
            .items()
            .insert(key.to_string(), value.to_string());
        let event = StorageEvent {
            key: key.to_string(),
            new_value: Some(value.to_string()),
        };
        let me = self.id;
        self.area.notify(&event, |document| document != me);
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.area.items().get(key).cloned()
    }

    pub fn remove_item(&self, key: &str) {
        if self.area.items().remove(key).is_some() {
            let event = StorageEvent {
                key: key.to_string(),
                new_value: None,
            };
            let me = self.id;
            self.area.notify(&event, |document| document != me);
        }
    }

    /// Registers a change listener on this document.
    pub fn add_listener(&self) -> (u64, mpsc::UnboundedReceiver<StorageEvent>) {
        let id = self.area.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.area.listeners().push(ListenerEntry {
            id,
            document: self.id,
            tx,
        });
        (id, rx)
    }

    pub fn remove_listener(&self, id: u64) {
        self.area.listeners().retain(|entry| entry.id != id);
    }

    /// Queues `event` to this document's own listeners.
    pub fn dispatch_event(&self, event: StorageEvent) {
        let me = self.id;
        self.area.notify(&event, |document| document == me);
    }
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// How long a seen token suppresses redelivery.
    pub dedup_ttl: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(60),
        }
    }
}

pub fn can_be_used(platform: &Platform) -> bool {
    platform.storage.is_some() && platform.context == ContextKind::Window
}

pub fn average_response_time() -> Duration {
    Duration::from_millis(120)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageRecord {
    token: String,
    time: u64,
    data: ChannelMessage,
    uuid: String,
}

struct StorageShared {
    key: String,
    uuid: String,
    seen: Mutex<DedupSet<String>>,
    stats: StatsCounters,
}

impl StorageShared {
    /// Filters one change event; returns the message to deliver, if any.
    fn accept(&self, event: StorageEvent, since: u64) -> Option<ChannelMessage> {
        if event.key != self.key {
            return None;
        }
        let value = event.new_value?;
        let record: StorageRecord = match serde_json::from_str(&value) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %self.key, "ignoring malformed storage record: {err}");
                return None;
            }
        };
        if record.uuid == self.uuid {
            StatsCounters::bump(&self.stats.dropped_own);
            return None;
        }
        {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            if seen.has(&record.token) {
                StatsCounters::bump(&self.stats.dropped_duplicate);
                return None;
            }
            seen.add(record.token);
        }
        if record.data.time < since {
            StatsCounters::bump(&self.stats.dropped_stale);
            return None;
        }
        Some(record.data)
    }
}

/// Channel transport over a single storage slot plus change events.
pub struct StorageEventTransport {
    document: StorageDocument,
    micro: MicroClock,
    shared: Arc<StorageShared>,
    listener: Mutex<Option<(u64, JoinHandle<()>)>>,
    runtime: Handle,
}

impl StorageEventTransport {
    pub fn create(
        channel_name: &str,
        platform: &Platform,
        options: StorageOptions,
    ) -> Result<Self, TransportError> {
        if !can_be_used(platform) {
            return Err(TransportError::Unavailable(TransportKind::StorageEvent));
        }
        let Some(document) = platform.storage.clone() else {
            return Err(TransportError::Unavailable(TransportKind::StorageEvent));
        };
        let runtime = Handle::try_current()
            .map_err(|_| TransportError::NoRuntime(TransportKind::StorageEvent))?;

        let key = storage_key(channel_name);
        debug!(channel = channel_name, %key, "storage event transport opened");
        Ok(Self {
            document,
            micro: MicroClock::new(Arc::clone(&platform.clock)),
            shared: Arc::new(StorageShared {
                key,
                uuid: Uuid::new_v4().to_string(),
                seen: Mutex::new(DedupSet::new(
                    options.dedup_ttl,
                    Arc::clone(&platform.clock),
                )),
                stats: StatsCounters::default(),
            }),
            listener: Mutex::new(None),
            runtime,
        })
    }

    fn detach(&self) {
        let current = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((id, task)) = current {
            self.document.remove_listener(id);
            task.abort();
        }
    }
}

impl ChannelTransport for StorageEventTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageEvent
    }

    fn post_message(&self, message: &ChannelMessage) -> Result<(), TransportError> {
        let record = StorageRecord {
            token: random_token(),
            time: self.micro.now_ms(),
            data: message.clone(),
            uuid: self.shared.uuid.clone(),
        };
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(err) => {
                StatsCounters::bump(&self.shared.stats.post_errors);
                return Err(err.into());
            }
        };
        self.document.set_item(&self.shared.key, &value);
        self.document.dispatch_event(StorageEvent {
            key: self.shared.key.clone(),
            new_value: Some(value),
        });
        StatsCounters::bump(&self.shared.stats.posted);
        Ok(())
    }

    fn on_message(&self, sink: Option<MessageSink>, since_time: u64) {
        self.detach();
        let Some(sink) = sink else {
            return;
        };
        let (id, mut events) = self.document.add_listener();
        let shared = Arc::clone(&self.shared);
        let task = self.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(message) = shared.accept(event, since_time) {
                    StatsCounters::bump(&shared.stats.delivered);
                    sink(message);
                }
            }
        });
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some((id, task));
    }

    fn close(&self) {
        self.detach();
    }

    fn micro_seconds(&self) -> u64 {
        self.micro.micro_seconds()
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for StorageEventTransport {
    fn drop(&mut self) {
        self.detach();
    }
}
