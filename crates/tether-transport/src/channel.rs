use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tether_core::names::normalize_channel_name;
use tether_core::{ChannelMessage, MessageKind};
use tracing::{debug, info};

use crate::adapter::{ChannelTransport, MessageSink, TransportKind, TransportStats};
use crate::error::TransportError;
use crate::native::{self, BroadcastHub, NativeTransport};
use crate::platform::Platform;
use crate::storage::{self, StorageEventTransport, StorageOptions};
use crate::store::{self, PersistentStoreTransport, StoreOptions};

/// Listener callback; receives the message payload.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Forces one variant instead of probing.
    pub transport: Option<TransportKind>,
    /// When false the persistent store is never probed.
    pub worker_support: bool,
    pub store: StoreOptions,
    pub storage: StorageOptions,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            transport: None,
            worker_support: true,
            store: StoreOptions::default(),
            storage: StorageOptions::default(),
        }
    }
}

/// Whether `kind` can back a channel on `platform`.
pub fn is_usable(kind: TransportKind, platform: &Platform) -> Result<bool, TransportError> {
    match kind {
        TransportKind::Native => native::can_be_used(platform),
        TransportKind::PersistentStore => Ok(store::can_be_used(platform)),
        TransportKind::StorageEvent => Ok(storage::can_be_used(platform)),
    }
}

pub fn average_response_time(kind: TransportKind, options: &ChannelOptions) -> Duration {
    match kind {
        TransportKind::Native => native::average_response_time(),
        TransportKind::PersistentStore => store::average_response_time(&options.store),
        TransportKind::StorageEvent => storage::average_response_time(),
    }
}

/// Picks the transport variant for `platform`.
///
/// An explicit choice is returned as-is; probing follows
/// [`TransportKind::PREFERENCE`].
pub fn choose_transport(
    platform: &Platform,
    options: &ChannelOptions,
) -> Result<TransportKind, TransportError> {
    if let Some(kind) = options.transport {
        return Ok(kind);
    }
    for kind in TransportKind::PREFERENCE {
        if kind == TransportKind::PersistentStore && !options.worker_support {
            continue;
        }
        if is_usable(kind, platform)? {
            return Ok(kind);
        }
    }
    Err(TransportError::NoTransport)
}

fn create_transport(
    kind: TransportKind,
    name: &str,
    platform: &Platform,
    options: &ChannelOptions,
) -> Result<Box<dyn ChannelTransport>, TransportError> {
    Ok(match kind {
        TransportKind::Native => Box::new(NativeTransport::create(name, platform)?),
        TransportKind::PersistentStore => Box::new(PersistentStoreTransport::create(
            name,
            platform,
            options.store.clone(),
        )?),
        TransportKind::StorageEvent => Box::new(StorageEventTransport::create(
            name,
            platform,
            options.storage.clone(),
        )?),
    })
}

struct ListenerEntry {
    id: ListenerId,
    kind: MessageKind,
    since: u64,
    handler: MessageHandler,
}

struct ChannelInner {
    name: String,
    transport: Box<dyn ChannelTransport>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl ChannelInner {
    fn listeners(&self) -> MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn dispatch(&self, message: ChannelMessage) {
        let handlers: Vec<MessageHandler> = self
            .listeners()
            .iter()
            .filter(|entry| entry.kind == message.kind && message.time >= entry.since)
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in handlers {
            handler(&message.data);
        }
    }

    fn sink(self: &Arc<Self>) -> MessageSink {
        let weak: Weak<ChannelInner> = Arc::downgrade(self);
        Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(message);
            }
        })
    }
}

/// Named publish/subscribe endpoint over one transport variant.
///
/// The transport only delivers while at least one listener is registered;
/// each listener only sees messages stamped at or after its registration.
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn open(
        name: &str,
        platform: &Platform,
        options: ChannelOptions,
    ) -> Result<Self, TransportError> {
        let name = normalize_channel_name(name)?;
        let kind = choose_transport(platform, &options)?;
        if options.transport.is_some() && !is_usable(kind, platform)? {
            return Err(TransportError::Unavailable(kind));
        }
        let transport = create_transport(kind, &name, platform, &options)?;
        info!(channel = %name, transport = %kind, "channel opened");
        Ok(Self {
            inner: Arc::new(ChannelInner {
                name,
                transport,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Marks `hub` as replaced by a channel implementation.
    ///
    /// Native probing on a marked hub fails with
    /// [`TransportError::MarkerCollision`], as does installing twice.
    pub fn install_as_primitive(hub: &BroadcastHub) -> Result<(), TransportError> {
        hub.install_channel_marker()?;
        info!("channel installed as the native primitive");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    pub fn post_message(&self, data: Value) -> Result<(), TransportError> {
        self.post(MessageKind::Message, data)
    }

    pub fn post_internal(&self, data: Value) -> Result<(), TransportError> {
        self.post(MessageKind::Internal, data)
    }

    fn post(&self, kind: MessageKind, data: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let message = ChannelMessage::new(self.inner.transport.micro_seconds(), kind, data);
        self.inner.transport.post_message(&message)
    }

    /// Registers `handler` for messages of `kind`.
    pub fn add_listener(
        &self,
        kind: MessageKind,
        handler: MessageHandler,
    ) -> Result<ListenerId, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let since = self.inner.transport.micro_seconds();
        let mut listeners = self.inner.listeners();
        let first = listeners.is_empty();
        listeners.push(ListenerEntry {
            id,
            kind,
            since,
            handler,
        });
        if first {
            debug!(channel = %self.inner.name, since, "activating transport");
            self.inner
                .transport
                .on_message(Some(self.inner.sink()), since);
        }
        Ok(id)
    }

    /// Removes a listener; returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        let removed = listeners.len() != before;
        if removed && listeners.is_empty() {
            debug!(channel = %self.inner.name, "deactivating transport");
            self.inner.transport.on_message(None, 0);
        }
        removed
    }

    /// Unsubscribes and releases the transport. Later posts fail.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.listeners().clear();
        self.inner.transport.on_message(None, 0);
        self.inner.transport.close();
        debug!(channel = %self.inner.name, "channel closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
