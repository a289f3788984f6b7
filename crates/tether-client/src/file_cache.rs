use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tether_core::Clock;
use tracing::{debug, warn};

use crate::blob_store::{BlobStore, ReadBatcher};
use crate::envelope::{Envelope, ReadFileRequest};
use crate::error::ClientError;

pub const DEFAULT_BUDGET_BYTES: u64 = 100_000_000;
pub const DEFAULT_IMMUNITY_WINDOW: Duration = Duration::from_secs(60);

/// Local download state reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalFile {
    pub path: String,
    pub is_downloading_active: bool,
    pub is_downloading_completed: bool,
    pub downloaded_prefix_size: u64,
    pub downloaded_size: u64,
}

/// File description as carried by `file` responses and `updateFile` updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: i64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub local: LocalFile,
    /// Complete file contents, when the backend ships them inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arr: Option<Bytes>,
    #[serde(rename = "idb_key", default, skip_serializing_if = "Option::is_none")]
    pub persistent_key: Option<String>,
}

/// Where a [`FilePart`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrigin {
    Memory,
    Persistent { transaction_id: i64 },
    LiveProbe,
}

impl ReadOrigin {
    pub fn transaction_id(self) -> i64 {
        match self {
            Self::Memory => -1,
            Self::Persistent { transaction_id } => transaction_id,
            Self::LiveProbe => -2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub data: Bytes,
    pub origin: ReadOrigin,
}

impl FilePart {
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new("filePart")
            .with("data", self.data.to_vec())
            .with("transaction_id", self.origin.transaction_id())
    }
}

/// Backend calls used to read a file that is still downloading.
pub trait LiveProbe: Send + Sync {
    /// Bytes available on disk starting at `offset`.
    fn downloaded_prefix_size(
        &self,
        file_id: i64,
        offset: u64,
    ) -> impl Future<Output = Result<u64, ClientError>> + Send;

    fn read_part(
        &self,
        path: &str,
        offset: u64,
        size: u64,
    ) -> impl Future<Output = Result<Bytes, ClientError>> + Send;
}

#[derive(Debug, Clone)]
pub struct FileCacheOptions {
    pub budget_bytes: u64,
    /// Entries used more recently than this are never evicted.
    pub immunity_window: Duration,
}

impl Default for FileCacheOptions {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_BUDGET_BYTES,
            immunity_window: DEFAULT_IMMUNITY_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCacheStats {
    pub entries: usize,
    pub resident_bytes: u64,
    pub evictions: u64,
    pub repeated_bytes: u64,
    pub memory_reads: u64,
    pub persistent_reads: u64,
    pub live_probe_reads: u64,
    pub live_probe_failures: u64,
}

struct CacheEntry {
    metadata: FileMetadata,
    bytes: Option<Bytes>,
    last_used_ms: u64,
}

struct CacheState {
    entries: HashMap<i64, CacheEntry>,
    /// Ids of entries holding resident bytes, most recent first.
    lru: LruCache<i64, ()>,
    resident: u64,
    stats: FileCacheStats,
}

impl CacheState {
    fn touch(&mut self, file_id: i64, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(&file_id) {
            entry.last_used_ms = now_ms;
            if entry.bytes.is_some() {
                self.lru.promote(&file_id);
            }
        }
    }

    fn release_bytes(&mut self, file_id: i64) -> Option<Bytes> {
        let bytes = self.entries.get_mut(&file_id)?.bytes.take()?;
        self.resident -= bytes.len() as u64;
        self.lru.pop(&file_id);
        Some(bytes)
    }

    fn evict(&mut self, options: &FileCacheOptions, now_ms: u64) {
        let immunity_ms = options.immunity_window.as_millis() as u64;
        while self.resident > options.budget_bytes {
            let Some((&candidate, _)) = self.lru.peek_lru() else {
                break;
            };
            let last_used = self
                .entries
                .get(&candidate)
                .map_or(0, |entry| entry.last_used_ms);
            if now_ms.saturating_sub(last_used) < immunity_ms {
                debug!(file_id = candidate, resident = self.resident, "eviction stopped at immune entry");
                break;
            }
            self.release_bytes(candidate);
            self.entries.remove(&candidate);
            self.stats.evictions += 1;
            debug!(file_id = candidate, resident = self.resident, "evicted file");
        }
    }
}

enum ReadPlan {
    Ready(FilePart),
    Persistent(String),
    Live { path: String },
}

/// Byte-range cache for locally stored files.
pub struct FileCache {
    state: Mutex<CacheState>,
    options: FileCacheOptions,
    clock: Arc<dyn Clock>,
    batcher: ReadBatcher,
}

impl FileCache {
    pub fn new(options: FileCacheOptions, clock: Arc<dyn Clock>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: LruCache::unbounded(),
                resident: 0,
                stats: FileCacheStats::default(),
            }),
            options,
            clock,
            batcher: ReadBatcher::new(store),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Records fresh metadata; returns it without inline bytes.
    pub fn register_file(&self, mut metadata: FileMetadata) -> FileMetadata {
        let now = self.clock.now_ms();
        let file_id = metadata.id;
        let bytes = metadata.arr.take();
        let mut st = self.lock();

        if bytes.is_some() || metadata.persistent_key.is_some() {
            metadata.local.is_downloading_completed = true;
        }
        let previous_key = st
            .entries
            .get(&file_id)
            .and_then(|entry| entry.metadata.persistent_key.clone());
        if metadata.persistent_key.is_none() {
            metadata.persistent_key = previous_key;
        }

        if let Some(bytes) = bytes {
            if st.release_bytes(file_id).is_some() {
                warn!(file_id, "file bytes registered twice; releasing previous copy");
                st.stats.repeated_bytes += 1;
            }
            st.resident += bytes.len() as u64;
            st.lru.put(file_id, ());
            let entry = st.entries.entry(file_id).or_insert_with(|| CacheEntry {
                metadata: metadata.clone(),
                bytes: None,
                last_used_ms: now,
            });
            entry.bytes = Some(bytes);
        }

        let entry = st.entries.entry(file_id).or_insert_with(|| CacheEntry {
            metadata: metadata.clone(),
            bytes: None,
            last_used_ms: now,
        });
        entry.metadata = metadata.clone();
        st.touch(file_id, now);
        st.evict(&self.options, now);
        metadata
    }

    /// Serves `request` from memory, the blob store, or a live probe.
    pub async fn read_file<P: LiveProbe>(
        &self,
        request: &ReadFileRequest,
        probe: &P,
    ) -> Result<FilePart, ClientError> {
        let plan = self.plan(request)?;
        match plan {
            ReadPlan::Ready(part) => Ok(part),
            ReadPlan::Persistent(key) => {
                let (blob, transaction_id) = self.batcher.read(key.clone()).await?;
                let data = blob.ok_or(ClientError::BlobMissing(key))?;
                self.lock().stats.persistent_reads += 1;
                Ok(FilePart {
                    data,
                    origin: ReadOrigin::Persistent { transaction_id },
                })
            }
            ReadPlan::Live { path } => match self.read_live(request, &path, probe).await {
                Ok(part) => {
                    self.lock().stats.live_probe_reads += 1;
                    Ok(part)
                }
                Err(err) => {
                    if !err.is_cache_miss() {
                        self.lock().stats.live_probe_failures += 1;
                        warn!(file_id = request.file_id, %path, "live probe failed, falling back to stored blob: {err}");
                    }
                    self.read_fallback(request, err).await
                }
            },
        }
    }

    fn plan(&self, request: &ReadFileRequest) -> Result<ReadPlan, ClientError> {
        let now = self.clock.now_ms();
        let mut st = self.lock();
        st.touch(request.file_id, now);
        let Some(entry) = st.entries.get(&request.file_id) else {
            return Err(ClientError::FileNotLoaded(request.file_id));
        };
        if let Some(bytes) = &entry.bytes {
            let data = slice(bytes, request.offset, request.size);
            st.stats.memory_reads += 1;
            return Ok(ReadPlan::Ready(FilePart {
                data,
                origin: ReadOrigin::Memory,
            }));
        }
        if let Some(key) = &entry.metadata.persistent_key {
            return Ok(ReadPlan::Persistent(key.clone()));
        }
        let local = &entry.metadata.local;
        if local.is_downloading_active && !local.path.is_empty() {
            return Ok(ReadPlan::Live {
                path: local.path.clone(),
            });
        }
        Err(ClientError::FileNotLoaded(request.file_id))
    }

    async fn read_live<P: LiveProbe>(
        &self,
        request: &ReadFileRequest,
        path: &str,
        probe: &P,
    ) -> Result<FilePart, ClientError> {
        let available = probe
            .downloaded_prefix_size(request.file_id, request.offset)
            .await?;
        let size = request.size.unwrap_or(available);
        if size > available {
            return Err(ClientError::NotLoadedYet {
                file_id: request.file_id,
                available,
                requested: size,
            });
        }
        let data = probe.read_part(path, request.offset, size).await?;
        Ok(FilePart {
            data,
            origin: ReadOrigin::LiveProbe,
        })
    }

    /// Loads the whole blob and slices it; `probe_err` is returned when no
    /// blob exists.
    async fn read_fallback(
        &self,
        request: &ReadFileRequest,
        probe_err: ClientError,
    ) -> Result<FilePart, ClientError> {
        let key = {
            let st = self.lock();
            let Some(entry) = st.entries.get(&request.file_id) else {
                return Err(probe_err);
            };
            if let Some(bytes) = &entry.bytes {
                return Ok(FilePart {
                    data: slice(bytes, request.offset, request.size),
                    origin: ReadOrigin::Memory,
                });
            }
            match &entry.metadata.persistent_key {
                Some(key) => key.clone(),
                None => return Err(probe_err),
            }
        };
        let (blob, transaction_id) = self.batcher.read(key).await?;
        let Some(blob) = blob else {
            return Err(probe_err);
        };
        Ok(FilePart {
            data: slice(&blob, request.offset, request.size),
            origin: ReadOrigin::Persistent { transaction_id },
        })
    }

    /// Forgets a file; returns its persistent key so the caller can delete it
    /// from the blob store.
    pub fn delete_file(&self, file_id: i64) -> Option<String> {
        let mut st = self.lock();
        st.release_bytes(file_id);
        st.entries
            .remove(&file_id)
            .and_then(|entry| entry.metadata.persistent_key)
    }

    pub fn contains(&self, file_id: i64) -> bool {
        self.lock().entries.contains_key(&file_id)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.lock().resident
    }

    pub fn metadata(&self, file_id: i64) -> Option<FileMetadata> {
        self.lock()
            .entries
            .get(&file_id)
            .map(|entry| entry.metadata.clone())
    }

    pub fn stats(&self) -> FileCacheStats {
        let st = self.lock();
        FileCacheStats {
            entries: st.entries.len(),
            resident_bytes: st.resident,
            ..st.stats.clone()
        }
    }
}

/// `bytes[offset..offset + size]` clamped to the buffer.
pub fn slice(bytes: &Bytes, offset: u64, size: Option<u64>) -> Bytes {
    let len = bytes.len() as u64;
    let start = offset.min(len);
    let end = match size {
        Some(size) => start.saturating_add(size).min(len),
        None => len,
    };
    bytes.slice(start as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tether_core::ManualClock;

    use super::{
        slice, FileCache, FileCacheOptions, FileMetadata, LiveProbe, LocalFile, ReadOrigin,
    };
    use crate::blob_store::{BlobStore, SqliteBlobStore};
    use crate::envelope::ReadFileRequest;
    use crate::error::ClientError;

    struct FakeProbe {
        available: u64,
        data: Bytes,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn serving(data: &'static [u8], available: u64) -> Self {
            Self {
                available,
                data: Bytes::from_static(data),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::serving(b"", 0)
            }
        }
    }

    impl LiveProbe for FakeProbe {
        async fn downloaded_prefix_size(&self, _file_id: i64, _offset: u64) -> Result<u64, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::Backend {
                    code: 500,
                    message: "probe exploded".into(),
                });
            }
            Ok(self.available)
        }

        async fn read_part(&self, _path: &str, offset: u64, size: u64) -> Result<Bytes, ClientError> {
            Ok(slice(&self.data, offset, Some(size)))
        }
    }

    fn file(id: i64, arr: Option<Vec<u8>>) -> FileMetadata {
        FileMetadata {
            id,
            size: arr.as_ref().map_or(0, |a| a.len() as u64),
            local: LocalFile::default(),
            arr: arr.map(Bytes::from),
            persistent_key: None,
        }
    }

    fn cache(clock: Arc<ManualClock>) -> (FileCache, Arc<SqliteBlobStore>) {
        let store = Arc::new(SqliteBlobStore::in_memory().expect("blob store"));
        let cache = FileCache::new(FileCacheOptions::default(), clock, store.clone());
        (cache, store)
    }

    #[test]
    fn older_file_is_evicted_once_over_budget() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock.clone());

        cache.register_file(file(7, Some(vec![0; 10_000_000])));
        clock.advance(Duration::from_secs(61));
        cache.register_file(file(8, Some(vec![0; 95_000_000])));

        assert!(!cache.contains(7));
        assert!(cache.contains(8));
        assert_eq!(cache.resident_bytes(), 95_000_000);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn recently_used_entries_are_immune() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock.clone());

        cache.register_file(file(7, Some(vec![0; 10_000_000])));
        clock.advance(Duration::from_secs(30));
        cache.register_file(file(8, Some(vec![0; 95_000_000])));

        assert!(cache.contains(7));
        assert_eq!(cache.resident_bytes(), 105_000_000);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn repeated_bytes_replace_the_previous_copy() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        let first = cache.register_file(file(1, Some(vec![1; 100])));
        assert!(first.local.is_downloading_completed);
        assert!(first.arr.is_none());
        cache.register_file(file(1, Some(vec![2; 40])));
        assert_eq!(cache.resident_bytes(), 40);
        assert_eq!(cache.stats().repeated_bytes, 1);
    }

    #[tokio::test]
    async fn memory_reads_return_clamped_slices() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        let bytes: Vec<u8> = (0..10).collect();
        cache.register_file(file(3, Some(bytes.clone())));
        let probe = FakeProbe::serving(b"", 0);

        for offset in [0_u64, 3, 9, 10, 25] {
            for size in [None, Some(1_u64), Some(4), Some(100)] {
                let request = ReadFileRequest {
                    file_id: 3,
                    offset,
                    size,
                };
                let part = cache.read_file(&request, &probe).await.expect("read");
                let start = (offset as usize).min(bytes.len());
                let end = size.map_or(bytes.len(), |s| (start + s as usize).min(bytes.len()));
                assert_eq!(&part.data[..], &bytes[start..end], "offset={offset} size={size:?}");
                assert_eq!(part.origin, ReadOrigin::Memory);
            }
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_reads_return_the_whole_blob() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, store) = cache(clock);
        store.put("blob-5", b"0123456789").expect("put");
        let mut meta = file(5, None);
        meta.persistent_key = Some("blob-5".into());
        let registered = cache.register_file(meta);
        assert!(registered.local.is_downloading_completed);

        let part = cache
            .read_file(&ReadFileRequest::range(5, 2, 3), &FakeProbe::serving(b"", 0))
            .await
            .expect("read");
        assert_eq!(&part.data[..], b"0123456789");
        assert!(matches!(part.origin, ReadOrigin::Persistent { transaction_id } if transaction_id > 0));
        assert_eq!(cache.resident_bytes(), 0);
    }

    fn downloading(id: i64) -> FileMetadata {
        FileMetadata {
            id,
            size: 100,
            local: LocalFile {
                path: "/downloads/f".into(),
                is_downloading_active: true,
                ..LocalFile::default()
            },
            arr: None,
            persistent_key: None,
        }
    }

    #[tokio::test]
    async fn live_probe_serves_downloaded_prefix() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        cache.register_file(downloading(9));
        let probe = FakeProbe::serving(b"abcdefgh", 6);

        let part = cache
            .read_file(&ReadFileRequest::range(9, 1, 3), &probe)
            .await
            .expect("read");
        assert_eq!(&part.data[..], b"bcd");
        assert_eq!(part.origin, ReadOrigin::LiveProbe);
        assert_eq!(part.origin.transaction_id(), -2);

        let whole_prefix = cache
            .read_file(&ReadFileRequest::whole(9), &probe)
            .await
            .expect("read prefix");
        assert_eq!(&whole_prefix.data[..], b"abcdef");

        let err = cache
            .read_file(&ReadFileRequest::range(9, 0, 7), &probe)
            .await
            .expect_err("not enough bytes yet");
        assert!(matches!(err, ClientError::NotLoadedYet { available: 6, requested: 7, .. }));
        assert_eq!(cache.stats().live_probe_failures, 0);
    }

    #[tokio::test]
    async fn probe_failure_is_counted_and_surfaces_without_a_blob() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        cache.register_file(downloading(4));
        let err = cache
            .read_file(&ReadFileRequest::whole(4), &FakeProbe::failing())
            .await
            .expect_err("nothing to fall back to");
        assert!(matches!(err, ClientError::Backend { code: 500, .. }));
        assert_eq!(cache.stats().live_probe_failures, 1);
    }

    #[tokio::test]
    async fn unknown_or_idle_files_are_not_loaded() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        cache.register_file(file(2, None));
        let probe = FakeProbe::serving(b"", 0);
        for id in [2, 99] {
            let err = cache
                .read_file(&ReadFileRequest::whole(id), &probe)
                .await
                .expect_err("not loaded");
            assert!(matches!(err, ClientError::FileNotLoaded(got) if got == id));
        }
    }

    #[test]
    fn delete_releases_bytes_and_returns_the_key() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        cache.register_file(file(1, Some(vec![0; 10])));
        let mut keyed = file(2, None);
        keyed.persistent_key = Some("k2".into());
        cache.register_file(keyed);

        assert_eq!(cache.delete_file(1), None);
        assert_eq!(cache.resident_bytes(), 0);
        assert_eq!(cache.delete_file(2).as_deref(), Some("k2"));
        assert!(!cache.contains(2));
        assert_eq!(cache.delete_file(2), None);
    }

    /// Fails every probe after the file finished landing elsewhere.
    struct LandedDuringProbe<'a> {
        cache: &'a FileCache,
        landed: FileMetadata,
    }

    impl LiveProbe for LandedDuringProbe<'_> {
        async fn downloaded_prefix_size(&self, _file_id: i64, _offset: u64) -> Result<u64, ClientError> {
            self.cache.register_file(self.landed.clone());
            Err(ClientError::BackendUnavailable("worker restarted".into()))
        }

        async fn read_part(&self, _path: &str, _offset: u64, _size: u64) -> Result<Bytes, ClientError> {
            Err(ClientError::BackendUnavailable("worker restarted".into()))
        }
    }

    #[tokio::test]
    async fn failed_probe_slices_the_stored_blob() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, store) = cache(clock);
        store.put("blob-done", b"0123456789").expect("put");

        let cases: [(u64, Option<u64>, &[u8]); 4] = [
            (2, Some(3), b"234"),
            (7, None, b"789"),
            (8, Some(50), b"89"),
            (25, None, b""),
        ];
        for (n, (offset, size, expected)) in cases.into_iter().enumerate() {
            let id = 40 + n as i64;
            cache.register_file(downloading(id));
            let mut landed = downloading(id);
            landed.persistent_key = Some("blob-done".into());
            let probe = LandedDuringProbe {
                cache: &cache,
                landed,
            };

            let request = ReadFileRequest {
                file_id: id,
                offset,
                size,
            };
            let part = cache.read_file(&request, &probe).await.expect("fallback read");
            assert_eq!(&part.data[..], expected, "offset={offset} size={size:?}");
            assert!(matches!(part.origin, ReadOrigin::Persistent { .. }));
            assert_eq!(cache.stats().live_probe_failures, n as u64 + 1);
        }
    }

    #[tokio::test]
    async fn failed_probe_prefers_bytes_that_arrived_inline() {
        let clock = Arc::new(ManualClock::new(0));
        let (cache, _) = cache(clock);
        cache.register_file(downloading(50));
        let mut landed = downloading(50);
        landed.arr = Some(Bytes::from_static(b"abcdef"));
        let probe = LandedDuringProbe {
            cache: &cache,
            landed,
        };

        let part = cache
            .read_file(&ReadFileRequest::range(50, 4, 0), &probe)
            .await
            .expect("fallback read");
        assert_eq!(&part.data[..], b"ef");
        assert_eq!(part.origin, ReadOrigin::Memory);
        assert_eq!(cache.stats().live_probe_failures, 1);
    }
}
