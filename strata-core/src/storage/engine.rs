//! Storage engine - top-level table handle

use super::cache::LiveSegmentedCache;
use super::{LiveSegmentMode, StorageConfig};
use crate::chunk::{ChunkMeta, ValueSerializer};
use crate::kv::{open_table, OpenedStore, WriteBatch};
use crate::live::live_hash;
use crate::registry::{Closeable, RegistrationId, TableRegistry};
use crate::segment::{segment_hash, HistoricalRange, HistoricalSegmentTable, SegmentFinder, SegmentSummary, SingleSegmentFinder};
use crate::update::{UpdateListener, UpdateSummary};
use crate::{Result, SeriesKey, StrataError, TimeRange, TimeSeriesValue, Timestamp};
use chrono::{DateTime, Utc};
use parking_lot::{ArcRwLockReadGuard, Mutex, RawRwLock, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CREATED_TIMESTAMP: &str = "createdTimestamp";
const INDEX_DIR: &str = "index";
const SEGMENTS_DIR: &str = "segments";

type SharedCache<K, V> = Arc<RwLock<LiveSegmentedCache<K, V>>>;

/// Everything released by closing a table
struct OpenState<K, V> {
    store: OpenedStore,
    table: Arc<HistoricalSegmentTable<K, V>>,
    caches: Mutex<HashMap<K, SharedCache<K, V>>>,
    created: DateTime<Utc>,
}

impl<K: SeriesKey, V: TimeSeriesValue> OpenState<K, V> {
    fn cache(
        &self,
        key: &K,
        finder: &Arc<dyn SegmentFinder<K>>,
        journal: Option<Arc<dyn ValueSerializer<V>>>,
    ) -> Result<SharedCache<K, V>> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(key) {
            return Ok(cache.clone());
        }
        let cache = LiveSegmentedCache::open(key.clone(), self.table.clone(), finder.clone(), journal)?;
        let cache = Arc::new(RwLock::new(cache));
        caches.insert(key.clone(), cache.clone());
        Ok(cache)
    }
}

/// A time-series table: independent keys, each split into sealed
/// historical segments and one live segment.
///
/// Every key has its own read-write lock. Reads share it, live appends and
/// bulk updates take it exclusively. Range scans keep the read lock until
/// they are exhausted, closed or dropped.
pub struct TimeSeriesDb<K, V> {
    name: String,
    dir: PathBuf,
    config: StorageConfig,
    serializer: Arc<dyn ValueSerializer<V>>,
    finder: Arc<dyn SegmentFinder<K>>,
    state: RwLock<Option<OpenState<K, V>>>,
    registration: Mutex<Option<(TableRegistry, RegistrationId)>>,
}

impl<K: SeriesKey, V: TimeSeriesValue> TimeSeriesDb<K, V> {
    pub fn builder(name: &str) -> TimeSeriesDbBuilder<K, V> {
        TimeSeriesDbBuilder::new(name)
    }

    /// Get table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn closed(&self) -> StrataError {
        StrataError::Closed(self.name.clone())
    }

    fn journal_serializer(&self) -> Option<Arc<dyn ValueSerializer<V>>> {
        match self.config.live_mode {
            LiveSegmentMode::InMemory => None,
            LiveSegmentMode::WriteThrough => Some(self.serializer.clone()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&OpenState<K, V>) -> Result<T>) -> Result<T> {
        self.maybe_purge()?;
        let state = self.state.read();
        let state = state.as_ref().ok_or_else(|| self.closed())?;
        f(state)
    }

    fn cache(&self, key: &K) -> Result<SharedCache<K, V>> {
        self.with_state(|state| state.cache(key, &self.finder, self.journal_serializer()))
    }

    fn read_key<T>(&self, key: &K, f: impl FnOnce(&LiveSegmentedCache<K, V>) -> Result<T>) -> Result<T> {
        let cache = self.cache(key)?;
        let guard = cache.read_recursive();
        f(&guard)
    }

    fn write_key_within<T>(
        &self,
        key: &K,
        timeout: Duration,
        action: &str,
        f: impl FnOnce(&mut LiveSegmentedCache<K, V>) -> Result<T>,
    ) -> Result<T> {
        let cache = self.cache(key)?;
        let mut guard = cache.try_write_for(timeout).ok_or_else(|| {
            StrataError::Retryable(format!(
                "{} of {:?} in table {} could not lock the key within {:?}; close open iterators first",
                action, key, self.name, timeout
            ))
        })?;
        f(&mut guard)
    }

    pub fn get_first_value(&self, key: &K) -> Result<Option<V>> {
        self.read_key(key, |cache| cache.get_first_value())
    }

    pub fn get_last_value(&self, key: &K) -> Result<Option<V>> {
        self.read_key(key, |cache| cache.get_last_value())
    }

    /// Last value with `end_time <= t`, else the first value
    pub fn get_latest_value(&self, key: &K, t: Timestamp) -> Result<Option<V>> {
        self.read_key(key, |cache| cache.get_latest_value(t))
    }

    /// The value `n` positions before the last value with `end_time <= t`,
    /// clamped to the first value
    pub fn get_previous_value(&self, key: &K, t: Timestamp, n: u64) -> Result<Option<V>> {
        self.read_key(key, |cache| cache.get_previous_value(t, n))
    }

    /// The value `n` positions after the first value with `end_time >= t`,
    /// clamped to the last value
    pub fn get_next_value(&self, key: &K, t: Timestamp, n: u64) -> Result<Option<V>> {
        self.read_key(key, |cache| cache.get_next_value(t, n))
    }

    /// Values with `from <= end_time <= to`, ascending
    pub fn range_values(&self, key: &K, from: Timestamp, to: Timestamp) -> Result<LockedRange<K, V>> {
        self.locked_range(key, from, to, false)
    }

    /// Values with `to <= end_time <= from`, descending
    pub fn range_values_reverse(&self, key: &K, from: Timestamp, to: Timestamp) -> Result<LockedRange<K, V>> {
        self.locked_range(key, from, to, true)
    }

    fn locked_range(&self, key: &K, from: Timestamp, to: Timestamp, reverse: bool) -> Result<LockedRange<K, V>> {
        let cache = self.cache(key)?;
        let guard = cache.read_arc_recursive();
        let (historical, live) = guard.plan_range(from, to, reverse)?;
        Ok(LockedRange {
            guard: Some(guard),
            historical,
            live,
            reverse,
        })
    }

    /// Append one value after every value of the key
    pub fn put_next_live_value(&self, key: &K, value: V) -> Result<()> {
        let cache = self.cache(key)?;
        let mut guard = cache.write();
        guard.put_next_live_value(value)
    }

    /// Bulk load `source` below the live segment of the key
    pub fn update<I, L>(&self, key: &K, source: I, listener: &mut L) -> Result<UpdateSummary>
    where
        I: IntoIterator<Item = V>,
        L: UpdateListener,
    {
        self.write_key_within(key, self.config.update_lock_timeout, "Update", |cache| {
            cache.update(source, listener)
        })
    }

    /// Delete every value of the key, including an interrupted update
    pub fn delete_range(&self, key: &K) -> Result<()> {
        self.write_key_within(key, self.config.delete_lock_timeout, "Delete", |cache| {
            cache.delete_range()
        })
    }

    pub fn is_empty_or_inconsistent(&self, key: &K) -> Result<bool> {
        self.read_key(key, |cache| Ok(cache.table().is_empty_or_inconsistent(key)))
    }

    /// Sealed segments of the key, oldest first
    pub fn segments(&self, key: &K) -> Result<Vec<SegmentSummary>> {
        self.read_key(key, |cache| Ok(cache.table().segments(key)?.to_vec()))
    }

    /// Chunk index of the sealed segment starting at `segment_from`
    pub fn chunks(&self, key: &K, segment_from: Timestamp) -> Result<Vec<ChunkMeta>> {
        self.read_key(key, |cache| Ok(cache.table().chunks(key, segment_from)?.to_vec()))
    }

    /// Range and size of the live segment of the key
    pub fn live_segment(&self, key: &K) -> Result<Option<(TimeRange, usize)>> {
        self.read_key(key, |cache| Ok(cache.live().map(|live| (live.segment(), live.len()))))
    }

    /// Hash keys of every key holding data
    pub fn keys(&self) -> Result<Vec<String>> {
        self.with_state(|state| {
            let mut keys = BTreeSet::new();
            for prefix in [segment_hash(""), live_hash("")] {
                for hash_key in state.store.store.hash_keys(&prefix)? {
                    if let Some(key) = hash_key.strip_prefix(prefix.as_str()) {
                        keys.insert(key.to_string());
                    }
                }
            }
            for (key, cache) in state.caches.lock().iter() {
                if cache.read_recursive().live().is_some() {
                    keys.insert(key.hash_key());
                }
            }
            Ok(keys.into_iter().collect())
        })
    }

    /// Make all metadata writes durable
    pub fn flush(&self) -> Result<()> {
        self.with_state(|state| state.store.store.flush())
    }

    /// When the table was created, or last purged
    pub fn created(&self) -> Result<DateTime<Utc>> {
        self.with_state(|state| Ok(state.created))
    }

    fn maybe_purge(&self) -> Result<()> {
        let max_age = match self.config.max_table_age {
            Some(max_age) => max_age,
            None => return Ok(()),
        };
        let expired = match self.state.read().as_ref() {
            Some(state) => is_expired(state.created, max_age),
            None => return Err(self.closed()),
        };
        if expired {
            self.purge(max_age)?;
        }
        Ok(())
    }

    /// Drop every key of an expired table and restart its age
    fn purge(&self, max_age: Duration) -> Result<()> {
        let mut state = self.state.write();
        let state = state.as_mut().ok_or_else(|| self.closed())?;
        if !is_expired(state.created, max_age) {
            return Ok(());
        }

        let caches = state.caches.lock();
        let mut guards = Vec::with_capacity(caches.len());
        for (key, cache) in caches.iter() {
            let guard = cache.try_write_for(self.config.delete_lock_timeout).ok_or_else(|| {
                StrataError::Retryable(format!(
                    "Purge of expired table {} could not lock {:?}",
                    self.name, key
                ))
            })?;
            guards.push(guard);
        }
        for guard in guards.iter_mut() {
            guard.reset_live()?;
        }

        let segments = self.dir.join(SEGMENTS_DIR);
        if segments.exists() {
            fs::remove_dir_all(&segments)?;
        }
        let store = &state.store.store;
        let mut batch = WriteBatch::new();
        for hash_key in store.hash_keys("")? {
            batch.delete_range(&hash_key);
        }
        store.write_batch(batch)?;
        store.flush()?;
        state.table.clear_caches();
        drop(guards);
        drop(caches);

        state.created = write_created(&self.dir)?;
        info!("Purged table {} after it exceeded {:?}", self.name, max_age);
        Ok(())
    }
}

impl<K: SeriesKey, V: TimeSeriesValue> Closeable for TimeSeriesDb<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<()> {
        let state = self.state.write().take();
        if let Some((registry, id)) = self.registration.lock().take() {
            registry.unregister(id);
        }
        let state = match state {
            Some(state) => state,
            None => return Ok(()),
        };

        let result = state.store.store.flush();
        state.table.clear_caches();
        drop(state);
        info!("Closed table {}", self.name);
        result
    }

    fn is_closed(&self) -> bool {
        self.state.read().is_none()
    }
}

fn is_expired(created: DateTime<Utc>, max_age: Duration) -> bool {
    (Utc::now() - created).to_std().map_or(false, |age| age > max_age)
}

fn write_created(dir: &Path) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    fs::write(dir.join(CREATED_TIMESTAMP), now.to_rfc3339())?;
    Ok(now)
}

fn read_or_create_created(dir: &Path) -> Result<DateTime<Utc>> {
    let path = dir.join(CREATED_TIMESTAMP);
    match fs::read_to_string(&path) {
        Ok(text) => match DateTime::parse_from_rfc3339(text.trim()) {
            Ok(created) => Ok(created.with_timezone(&Utc)),
            Err(e) => {
                warn!("Unreadable creation time in {:?} ({}); resetting it", path, e);
                write_created(dir)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => write_created(dir),
        Err(e) => Err(e.into()),
    }
}

/// Table options; the value serializer is required
pub struct TimeSeriesDbBuilder<K, V> {
    name: String,
    config: StorageConfig,
    serializer: Option<Arc<dyn ValueSerializer<V>>>,
    finder: Arc<dyn SegmentFinder<K>>,
    registry: Option<TableRegistry>,
}

impl<K: SeriesKey, V: TimeSeriesValue> TimeSeriesDbBuilder<K, V> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: StorageConfig::default(),
            serializer: None,
            finder: Arc::new(SingleSegmentFinder),
            registry: None,
        }
    }

    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn ValueSerializer<V>>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Segment boundaries; defaults to one segment spanning all time
    pub fn segment_finder(mut self, finder: Arc<dyn SegmentFinder<K>>) -> Self {
        self.finder = finder;
        self
    }

    /// Register the opened table so `close_all` closes it
    pub fn registry(mut self, registry: &TableRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn open(self) -> Result<Arc<TimeSeriesDb<K, V>>> {
        validate_name(&self.name)?;
        let serializer = self
            .serializer
            .ok_or_else(|| StrataError::Config(format!("Table {} has no value serializer", self.name)))?;
        if self.config.batch_size == 0 {
            return Err(StrataError::Config("Batch size must be positive".into()));
        }

        let dir = self.config.data_dir.join(&self.name);
        fs::create_dir_all(&dir)?;
        let created = read_or_create_created(&dir)?;
        let store = open_table(self.config.backend, &dir.join(INDEX_DIR))?;
        let table = Arc::new(HistoricalSegmentTable::new(
            dir.join(SEGMENTS_DIR),
            store.store.clone(),
            serializer.clone(),
            self.config.write_options(),
        ));

        let db = Arc::new(TimeSeriesDb {
            name: self.name,
            dir,
            config: self.config,
            serializer,
            finder: self.finder,
            state: RwLock::new(Some(OpenState {
                store,
                table,
                caches: Mutex::new(HashMap::new()),
                created,
            })),
            registration: Mutex::new(None),
        });

        if let Some(registry) = self.registry {
            let id = registry.register(db.clone());
            *db.registration.lock() = Some((registry, id));
        }
        info!("Opened table {} at {:?}", db.name, db.dir);
        Ok(db)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StrataError::Config(format!("Invalid table name {:?}", name)));
    }
    Ok(())
}

/// Lazy scan over one key that holds the key's read lock.
///
/// The lock is released when the scan is exhausted, closed or dropped.
/// Writers of the same key wait until then; a bounded writer (`update`,
/// `delete_range`) gives up with [`StrataError::Retryable`].
pub struct LockedRange<K, V> {
    guard: Option<ArcRwLockReadGuard<RawRwLock, LiveSegmentedCache<K, V>>>,
    historical: Option<HistoricalRange<V>>,
    live: Range<usize>,
    reverse: bool,
}

impl<K, V> LockedRange<K, V> {
    /// Release the read lock. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.guard = None;
        self.historical = None;
        self.live = 0..0;
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }
}

impl<K: SeriesKey, V: TimeSeriesValue> LockedRange<K, V> {
    fn advance(&mut self) -> Option<Result<V>> {
        let cache = self.guard.as_deref()?;
        if self.reverse {
            if let Some(index) = self.live.next_back() {
                return cache.live_value(index).map(Ok);
            }
            self.historical.as_mut()?.next()
        } else {
            if let Some(item) = self.historical.as_mut().and_then(|scan| scan.next()) {
                return Some(item);
            }
            let index = self.live.next()?;
            cache.live_value(index).map(Ok)
        }
    }
}

impl<K: SeriesKey, V: TimeSeriesValue> Iterator for LockedRange<K, V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Some(Err(e)) => {
                self.historical = None;
                self.live = 0..0;
                Some(Err(e))
            }
            Some(value) => Some(value),
            None => {
                self.close();
                None
            }
        }
    }
}
