use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection};
use tether_core::names::store_table_name;
use tether_core::{ChannelMessage, DedupSet, MicroClock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{ChannelTransport, MessageSink, StatsCounters, TransportKind, TransportStats};
use crate::error::TransportError;
use crate::platform::{ContextKind, Platform};

/// Tuning for the persistent-store variant.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Delay between polling passes.
    pub poll_interval: Duration,
    /// Rows older than this are purged.
    pub ttl: Duration,
    /// Purge runs once every this many writes.
    pub cleanup_every: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(150),
            ttl: Duration::from_secs(45),
            cleanup_every: 10,
        }
    }
}

pub fn can_be_used(platform: &Platform) -> bool {
    platform.store_path.is_some() && platform.context != ContextKind::Background
}

pub fn average_response_time(options: &StoreOptions) -> Duration {
    options.poll_interval * 2
}

struct ReadState {
    cursor: i64,
    sink: Option<MessageSink>,
    since: u64,
    seen: DedupSet<i64>,
}

struct StoreShared {
    conn: Mutex<Connection>,
    table: String,
    author: String,
    micro: MicroClock,
    read: Mutex<ReadState>,
    stats: StatsCounters,
    writes: AtomicU64,
    options: StoreOptions,
}

impl StoreShared {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_state(&self) -> MutexGuard<'_, ReadState> {
        self.read.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn purge_expired(&self) -> Result<usize, TransportError> {
        let ttl_micros = self.options.ttl.as_micros() as u64;
        let threshold = self
            .micro
            .now_ms()
            .saturating_mul(1_000)
            .saturating_sub(ttl_micros);
        let purged = self.conn().execute(
            &format!("DELETE FROM {} WHERE time < ?1", self.table),
            params![threshold as i64],
        )?;
        self.stats
            .purged_rows
            .fetch_add(purged as u64, Ordering::Relaxed);
        if purged > 0 {
            debug!(table = %self.table, purged, "purged expired channel rows");
        }
        Ok(purged)
    }

    /// Fetches rows past the cursor, filters and orders them.
    ///
    /// Blocking; returns nothing when no sink is installed.
    fn collect_new_messages(
        &self,
    ) -> Result<Option<(MessageSink, Vec<ChannelMessage>)>, TransportError> {
        let cursor = self.read_state().cursor;
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, uuid, data FROM {} WHERE id > ?1 ORDER BY id ASC",
                self.table
            ))?;
            let mapped = stmt.query_map(params![cursor], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };

        let mut read = self.read_state();
        if let Some((last_id, _, _)) = rows.last() {
            read.cursor = read.cursor.max(*last_id);
        }
        let Some(sink) = read.sink.clone() else {
            return Ok(None);
        };
        let mut accepted = Vec::with_capacity(rows.len());
        for (id, uuid, data) in rows {
            if uuid == self.author {
                StatsCounters::bump(&self.stats.dropped_own);
                continue;
            }
            if read.seen.has(&id) {
                StatsCounters::bump(&self.stats.dropped_duplicate);
                continue;
            }
            let message = match ChannelMessage::from_json(&data) {
                Ok(message) => message,
                Err(err) => {
                    warn!(table = %self.table, id, "skipping undecodable channel row: {err}");
                    continue;
                }
            };
            if message.time < read.since {
                StatsCounters::bump(&self.stats.dropped_stale);
                continue;
            }
            accepted.push((id, message));
        }
        accepted.sort_by_key(|(id, message)| (message.time, *id));
        for (id, _) in &accepted {
            read.seen.add(*id);
        }
        Ok(Some((
            sink,
            accepted.into_iter().map(|(_, message)| message).collect(),
        )))
    }

    fn deliver(&self, sink: MessageSink, messages: Vec<ChannelMessage>) -> usize {
        let delivered = messages.len();
        for message in messages {
            StatsCounters::bump(&self.stats.delivered);
            sink(message);
        }
        delivered
    }

    /// One polling pass on the calling thread.
    fn read_new_messages(&self) -> Result<usize, TransportError> {
        Ok(match self.collect_new_messages()? {
            Some((sink, messages)) => self.deliver(sink, messages),
            None => 0,
        })
    }
}

/// Channel transport over an append-only SQLite table polled by every
/// subscriber.
pub struct PersistentStoreTransport {
    shared: Arc<StoreShared>,
    poller: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl PersistentStoreTransport {
    pub fn create(
        channel_name: &str,
        platform: &Platform,
        options: StoreOptions,
    ) -> Result<Self, TransportError> {
        if !can_be_used(platform) {
            return Err(TransportError::Unavailable(TransportKind::PersistentStore));
        }
        let Some(path) = platform.store_path.as_deref() else {
            return Err(TransportError::Unavailable(TransportKind::PersistentStore));
        };
        let runtime = Handle::try_current()
            .map_err(|_| TransportError::NoRuntime(TransportKind::PersistentStore))?;

        let table = store_table_name(channel_name);
        let conn = open_store(path, &table)?;
        let cursor: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {table}"),
            [],
            |row| row.get(0),
        )?;

        debug!(channel = channel_name, %table, cursor, "persistent store transport opened");
        Ok(Self {
            shared: Arc::new(StoreShared {
                conn: Mutex::new(conn),
                table,
                author: Uuid::new_v4().to_string(),
                micro: MicroClock::new(Arc::clone(&platform.clock)),
                read: Mutex::new(ReadState {
                    cursor,
                    sink: None,
                    since: 0,
                    seen: DedupSet::new(options.ttl * 2, Arc::clone(&platform.clock)),
                }),
                stats: StatsCounters::default(),
                writes: AtomicU64::new(0),
                options,
            }),
            poller: Mutex::new(None),
            runtime,
        })
    }

    /// Runs one polling pass immediately; returns the number delivered.
    pub fn poll_now(&self) -> Result<usize, TransportError> {
        self.shared.read_new_messages()
    }

    /// Rows currently stored for this channel.
    pub fn row_count(&self) -> Result<u64, TransportError> {
        let count: i64 = self.shared.conn().query_row(
            &format!("SELECT COUNT(*) FROM {}", self.shared.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn start_polling(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if poller.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *poller = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(shared.options.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pass = Arc::clone(&shared);
                match tokio::task::spawn_blocking(move || pass.collect_new_messages()).await {
                    Ok(Ok(Some((sink, messages)))) => {
                        shared.deliver(sink, messages);
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(err)) => warn!(table = %shared.table, "channel poll failed: {err}"),
                    Err(err) => warn!(table = %shared.table, "channel poll task failed: {err}"),
                }
            }
        }));
    }

    fn stop_polling(&self) {
        if let Some(poller) = self.poller.lock().unwrap_or_else(|p| p.into_inner()).take() {
            poller.abort();
        }
    }
}

fn open_store(path: &Path, table: &str) -> Result<Connection, TransportError> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         CREATE TABLE IF NOT EXISTS {table} (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           uuid TEXT NOT NULL,
           time INTEGER NOT NULL,
           data TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS {table}_time ON {table} (time);"
    ))?;
    Ok(conn)
}

impl ChannelTransport for PersistentStoreTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PersistentStore
    }

    fn post_message(&self, message: &ChannelMessage) -> Result<(), TransportError> {
        let shared = &self.shared;
        let data = serde_json::to_string(message)?;
        let inserted = shared.conn().execute(
            &format!(
                "INSERT INTO {} (uuid, time, data) VALUES (?1, ?2, ?3)",
                shared.table
            ),
            params![shared.author, message.time as i64, data],
        );
        if let Err(err) = inserted {
            StatsCounters::bump(&shared.stats.post_errors);
            return Err(err.into());
        }
        StatsCounters::bump(&shared.stats.posted);

        let writes = shared.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if shared.options.cleanup_every > 0 && writes % shared.options.cleanup_every == 0 {
            if let Err(err) = shared.purge_expired() {
                warn!(table = %shared.table, "channel purge failed: {err}");
            }
        }
        Ok(())
    }

    fn on_message(&self, sink: Option<MessageSink>, since_time: u64) {
        let active = sink.is_some();
        {
            let mut read = self.shared.read_state();
            read.sink = sink;
            read.since = since_time;
        }
        if active {
            self.start_polling();
        } else {
            self.stop_polling();
        }
    }

    fn close(&self) {
        self.on_message(None, 0);
    }

    fn micro_seconds(&self) -> u64 {
        self.shared.micro.micro_seconds()
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for PersistentStoreTransport {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
