use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::{ChannelMessage, MicroClock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::adapter::{ChannelTransport, MessageSink, StatsCounters, TransportKind, TransportStats};
use crate::error::TransportError;
use crate::platform::Platform;

/// Platform-level publish/subscribe primitive scoped by channel name.
///
/// Every port receives the messages posted by the *other* ports opened under
/// the same name, in posting order.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    ports: Mutex<HashMap<String, Vec<PortEntry>>>,
    next_port: AtomicU64,
    channel_marker: AtomicBool,
}

#[derive(Debug)]
struct PortEntry {
    id: u64,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a new port on `name`.
    pub fn open(self: &Arc<Self>, name: &str) -> NativePort {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_ports()
            .entry(name.to_string())
            .or_default()
            .push(PortEntry { id, tx });
        NativePort {
            hub: Arc::clone(self),
            name: name.to_string(),
            id,
            inbox: Mutex::new(Some(rx)),
        }
    }

    /// Number of open ports on `name`.
    pub fn port_count(&self, name: &str) -> usize {
        self.lock_ports().get(name).map_or(0, Vec::len)
    }

    /// Stamps the marker a channel leaves when it is installed as this
    /// platform primitive. A marked hub refuses to back a native transport,
    /// and a second stamp is a collision.
    pub fn install_channel_marker(&self) -> Result<(), TransportError> {
        if self.channel_marker.swap(true, Ordering::SeqCst) {
            return Err(TransportError::MarkerCollision);
        }
        Ok(())
    }

    pub fn has_channel_marker(&self) -> bool {
        self.channel_marker.load(Ordering::SeqCst)
    }

    fn broadcast(&self, name: &str, from: u64, message: &ChannelMessage) -> usize {
        let ports = self.lock_ports();
        let Some(entries) = ports.get(name) else {
            return 0;
        };
        entries
            .iter()
            .filter(|entry| entry.id != from)
            .filter(|entry| entry.tx.send(message.clone()).is_ok())
            .count()
    }

    fn detach(&self, name: &str, id: u64) {
        let mut ports = self.lock_ports();
        if let Some(entries) = ports.get_mut(name) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                ports.remove(name);
            }
        }
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<PortEntry>>> {
        self.ports.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One endpoint of a [`BroadcastHub`] channel.
#[derive(Debug)]
pub struct NativePort {
    hub: Arc<BroadcastHub>,
    name: String,
    id: u64,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
}

impl NativePort {
    /// Posts to every other port; returns how many ports accepted it.
    pub fn post(&self, message: &ChannelMessage) -> usize {
        self.hub.broadcast(&self.name, self.id, message)
    }

    /// Takes the receiving half; only the first call returns `Some`.
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.inbox.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

impl Drop for NativePort {
    fn drop(&mut self) {
        self.hub.detach(&self.name, self.id);
    }
}

/// Whether the native variant can back a channel on `platform`.
pub fn can_be_used(platform: &Platform) -> Result<bool, TransportError> {
    match &platform.native {
        None => Ok(false),
        Some(hub) if hub.has_channel_marker() => Err(TransportError::MarkerCollision),
        Some(_) => Ok(true),
    }
}

pub fn average_response_time() -> Duration {
    Duration::from_millis(150)
}

#[derive(Default)]
struct NativeShared {
    sink: Mutex<Option<(MessageSink, u64)>>,
    stats: StatsCounters,
}

/// Thin pass-through to the platform [`BroadcastHub`].
pub struct NativeTransport {
    port: NativePort,
    micro: MicroClock,
    shared: Arc<NativeShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NativeTransport {
    pub fn create(channel_name: &str, platform: &Platform) -> Result<Self, TransportError> {
        if !can_be_used(platform)? {
            return Err(TransportError::Unavailable(TransportKind::Native));
        }
        let Some(hub) = platform.native.as_ref() else {
            return Err(TransportError::Unavailable(TransportKind::Native));
        };
        let runtime =
            Handle::try_current().map_err(|_| TransportError::NoRuntime(TransportKind::Native))?;

        let port = hub.open(channel_name);
        let mut inbox = port
            .take_inbox()
            .ok_or(TransportError::Unavailable(TransportKind::Native))?;
        let shared = Arc::new(NativeShared::default());

        let pump_shared = Arc::clone(&shared);
        let pump = runtime.spawn(async move {
            while let Some(message) = inbox.recv().await {
                let current = pump_shared
                    .sink
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                let Some((sink, since)) = current else {
                    continue;
                };
                if message.time < since {
                    StatsCounters::bump(&pump_shared.stats.dropped_stale);
                    continue;
                }
                StatsCounters::bump(&pump_shared.stats.delivered);
                sink(message);
            }
        });

        debug!(channel = channel_name, "native transport opened");
        Ok(Self {
            port,
            micro: MicroClock::new(Arc::clone(&platform.clock)),
            shared,
            pump: Mutex::new(Some(pump)),
        })
    }
}

impl ChannelTransport for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    fn post_message(&self, message: &ChannelMessage) -> Result<(), TransportError> {
        self.port.post(message);
        StatsCounters::bump(&self.shared.stats.posted);
        Ok(())
    }

    fn on_message(&self, sink: Option<MessageSink>, since_time: u64) {
        *self.shared.sink.lock().unwrap_or_else(|p| p.into_inner()) =
            sink.map(|sink| (sink, since_time));
    }

    fn close(&self) {
        self.on_message(None, 0);
        if let Some(pump) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pump.abort();
        }
        self.port.hub.detach(&self.port.name, self.port.id);
    }

    fn micro_seconds(&self) -> u64 {
        self.micro.micro_seconds()
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pump.abort();
        }
    }
}
