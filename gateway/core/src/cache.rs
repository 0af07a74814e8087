//! Content-addressed response cache
//!
//! Maps (normalized prompt, model, output-affecting params) to a previously
//! computed successful [`ModelResponse`].
//!
//! - **Keys**: SHA-256 over `prompt.trim() || model || {"max_tokens","temperature"}`
//!   with JSON keys in sorted order, so metadata in [`GenerationParams::extra`]
//!   never splits the cache
//! - **Expiry**: entries older than their TTL are purged lazily on lookup and
//!   count as a miss
//! - **Eviction**: at capacity, expired entries go first, then the least
//!   recently used entry (ties broken by lowest hit count, then insertion order)
//! - **Snapshots**: the most-hit entries are written to JSON every
//!   `snapshot_every` inserts, on the blocking pool when a runtime is
//!   available; a missing or corrupt snapshot yields an empty cache at startup
//!
//! Two identical requests racing past a miss will both reach the provider.
//! Both results are stored; the second simply replaces the first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;

use crate::types::{GenerationParams, ModelResponse};

// ============================================================================
// Configuration
// ============================================================================

/// Cache settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether lookups and inserts happen at all
    pub enabled: bool,

    /// Maximum live entries
    pub max_entries: usize,

    /// Default time-to-live
    pub ttl: Duration,

    /// Snapshot file, if persistence is wanted
    pub snapshot_path: Option<PathBuf>,

    /// Write a snapshot whenever the entry count is a multiple of this
    pub snapshot_every: usize,

    /// Entries kept in a snapshot, by hit count
    pub snapshot_top: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl: Duration::from_secs(3600),
            snapshot_path: None,
            snapshot_every: 10,
            snapshot_top: 100,
        }
    }
}

/// Snapshot persistence failures
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the snapshot file failed
    #[error("Cache snapshot IO error at {path}: {source}")]
    Io {
        /// Snapshot path
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The snapshot could not be encoded or decoded
    #[error("Cache snapshot is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

// ============================================================================
// Entries and Stats
// ============================================================================

/// The subset of [`GenerationParams`] that changes provider output
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheParams {
    /// Completion budget
    pub max_tokens: u32,
    /// Sampling temperature, rounded to four decimals
    pub temperature: f64,
}

impl From<&GenerationParams> for CacheParams {
    fn from(params: &GenerationParams) -> Self {
        Self {
            max_tokens: params.max_tokens,
            temperature: (f64::from(params.temperature) * 10_000.0).round() / 10_000.0,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    prompt: String,
    model: String,
    params: CacheParams,
    response: ModelResponse,
    created: Instant,
    last_accessed: Instant,
    hit_count: u64,
    sequence: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) > self.ttl
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.hit_count = self.hit_count.saturating_add(1);
    }

    fn to_persisted(&self, now: Instant, wall: DateTime<Utc>) -> PersistedEntry {
        let ago = |at: Instant| {
            chrono::Duration::from_std(now.saturating_duration_since(at))
                .unwrap_or_else(|_| chrono::Duration::zero())
        };
        PersistedEntry {
            prompt: self.prompt.clone(),
            model: self.model.clone(),
            params: self.params,
            response: self.response.clone(),
            created_at: wall - ago(self.created),
            last_accessed: wall - ago(self.last_accessed),
            hits: self.hit_count,
            ttl_secs: Some(self.ttl.as_secs_f64()),
        }
    }
}

/// Cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that returned a response
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Live entries
    pub entries: usize,
    /// `hits / (hits + misses)`, 0 before any lookup
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    next_sequence: u64,
}

// ============================================================================
// Snapshot Format
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    prompt: String,
    model: String,
    params: CacheParams,
    response: ModelResponse,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    hits: u64,
    /// Absent in older snapshots; the configured TTL applies then
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_secs: Option<f64>,
}

impl PersistedEntry {
    fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStats {
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    cache: HashMap<String, PersistedEntry>,
    #[serde(default)]
    stats: PersistedStats,
    timestamp: DateTime<Utc>,
}

/// Serializes snapshot writes and drops any that arrive out of order
#[derive(Debug)]
struct SnapshotWriter {
    path: PathBuf,
    written: Mutex<u64>,
}

impl SnapshotWriter {
    /// Write `snapshot` unless a newer generation is already on disk
    fn write(&self, generation: u64, snapshot: &Snapshot) -> Result<bool, CacheError> {
        let mut written = self.written.lock();
        if generation <= *written {
            tracing::debug!(generation, written = *written, "Skipping stale cache snapshot");
            return Ok(false);
        }

        let path = self.path.as_path();
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        *written = generation;
        tracing::info!(path = %path.display(), entries = snapshot.cache.len(), "Saved cache snapshot");
        Ok(true)
    }
}

// ============================================================================
// Response Cache
// ============================================================================

/// Thread-safe response cache
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    writer: Option<Arc<SnapshotWriter>>,
    generation: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResponseCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let writer = config.snapshot_path.clone().map(|path| {
            Arc::new(SnapshotWriter {
                path,
                written: Mutex::new(0),
            })
        });
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            writer,
            generation: AtomicU64::new(0),
        }
    }

    /// Create a cache, restoring the snapshot if one is configured
    ///
    /// Never fails: an unreadable snapshot is logged and ignored.
    #[must_use]
    pub fn load(config: CacheConfig) -> Self {
        let cache = Self::new(config);
        let Some(path) = cache.config.snapshot_path.clone() else {
            return cache;
        };

        match read_snapshot(&path) {
            Ok(Some(snapshot)) => {
                let restored = cache.restore(snapshot);
                tracing::info!(path = %path.display(), entries = restored, "Restored response cache");
            }
            Ok(None) => {
                tracing::debug!(path = %path.display(), "No cache snapshot, starting empty");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable cache snapshot");
            }
        }
        cache
    }

    /// Cache settings
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether the cache is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Derive the cache key for a request
    #[must_use]
    pub fn cache_key(prompt: &str, model: &str, params: &GenerationParams) -> String {
        let relevant = CacheParams::from(params);
        // serde_json maps keep keys sorted
        let canonical = serde_json::json!({
            "max_tokens": relevant.max_tokens,
            "temperature": relevant.temperature,
        });
        let material = format!("{}||{}||{}", prompt.trim(), model, canonical);
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// Look up a cached response
    pub fn get(&self, prompt: &str, model: &str, params: &GenerationParams) -> Option<ModelResponse> {
        if !self.config.enabled {
            return None;
        }

        let key = Self::cache_key(prompt, model, params);
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get_mut(&key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.touch(now);
                let response = entry.response.clone();
                inner.hits += 1;
                tracing::debug!(model = %model, key = %&key[..12], "Cache hit");
                return Some(response);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(&key);
        }
        inner.misses += 1;
        tracing::debug!(model = %model, expired, "Cache miss");
        None
    }

    /// Store a response; failed responses are ignored
    pub fn set(
        &self,
        prompt: &str,
        model: &str,
        response: &ModelResponse,
        params: &GenerationParams,
        ttl: Option<Duration>,
    ) {
        if !self.config.enabled || !response.success || self.config.max_entries == 0 {
            return;
        }

        let key = Self::cache_key(prompt, model, params);
        let now = Instant::now();

        let snapshot = {
            let mut inner = self.inner.lock();

            if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_entries {
                Self::purge_expired_locked(&mut inner, now);
                while inner.entries.len() >= self.config.max_entries {
                    if !Self::evict_lru_locked(&mut inner) {
                        break;
                    }
                }
            }

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.entries.insert(
                key,
                CacheEntry {
                    prompt: prompt.to_string(),
                    model: model.to_string(),
                    params: CacheParams::from(params),
                    response: response.clone(),
                    created: now,
                    last_accessed: now,
                    hit_count: 0,
                    sequence,
                    ttl: ttl.unwrap_or(self.config.ttl),
                },
            );

            let every = self.config.snapshot_every.max(1);
            match &self.writer {
                Some(writer) if inner.entries.len() % every == 0 => {
                    Some((Arc::clone(writer), self.build_snapshot(&inner, now)))
                }
                _ => None,
            }
        };

        if let Some((writer, (generation, snapshot))) = snapshot {
            schedule_snapshot(writer, generation, snapshot);
        }
    }

    /// Remove every expired entry, returning how many went
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::purge_expired_locked(&mut inner, Instant::now())
    }

    /// Drop every entry and reset counters
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
    }

    /// Live entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            hit_rate,
        }
    }

    /// Write the most-hit entries to the snapshot file
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be encoded or written. Does
    /// nothing when no snapshot path is configured.
    pub fn save_snapshot(&self) -> Result<(), CacheError> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let (generation, snapshot) = {
            let inner = self.inner.lock();
            self.build_snapshot(&inner, Instant::now())
        };
        writer.write(generation, &snapshot).map(|_| ())
    }

    fn purge_expired_locked(inner: &mut CacheInner, now: Instant) -> usize {
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    fn evict_lru_locked(inner: &mut CacheInner) -> bool {
        let victim = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed, e.hit_count, e.sequence))
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                inner.entries.remove(&key);
                inner.evictions += 1;
                tracing::debug!(key = %&key[..12], "Evicted least recently used entry");
                true
            }
            None => false,
        }
    }

    /// Must be called with the entry lock held so generations follow content
    fn build_snapshot(&self, inner: &CacheInner, now: Instant) -> (u64, Snapshot) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let wall = Utc::now();
        let mut ranked: Vec<(&String, &CacheEntry)> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .collect();
        ranked.sort_by(|a, b| b.1.hit_count.cmp(&a.1.hit_count).then(a.1.sequence.cmp(&b.1.sequence)));
        ranked.truncate(self.config.snapshot_top);

        let snapshot = Snapshot {
            cache: ranked
                .into_iter()
                .map(|(key, entry)| (key.clone(), entry.to_persisted(now, wall)))
                .collect(),
            stats: PersistedStats {
                hits: inner.hits,
                misses: inner.misses,
                evictions: inner.evictions,
            },
            timestamp: wall,
        };
        (generation, snapshot)
    }

    fn restore(&self, snapshot: Snapshot) -> usize {
        let now = Instant::now();
        let wall = Utc::now();

        let mut live: Vec<(String, PersistedEntry, Duration, Duration, Duration)> = snapshot
            .cache
            .into_iter()
            .filter_map(|(key, entry)| {
                let ttl = entry.ttl().unwrap_or(self.config.ttl);
                let age = (wall - entry.created_at).to_std().unwrap_or(Duration::ZERO);
                let idle = (wall - entry.last_accessed).to_std().unwrap_or(Duration::ZERO);
                (age <= ttl && entry.response.success).then_some((key, entry, age, idle, ttl))
            })
            .collect();
        live.sort_by(|a, b| b.1.hits.cmp(&a.1.hits));
        live.truncate(self.config.max_entries);

        let mut inner = self.inner.lock();
        inner.hits = snapshot.stats.hits;
        inner.misses = snapshot.stats.misses;
        inner.evictions = snapshot.stats.evictions;

        for (key, entry, age, idle, ttl) in live {
            let created = now.checked_sub(age).unwrap_or(now);
            let last_accessed = now.checked_sub(idle).unwrap_or(now);
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.entries.insert(
                key,
                CacheEntry {
                    prompt: entry.prompt,
                    model: entry.model,
                    params: entry.params,
                    response: entry.response,
                    created,
                    last_accessed,
                    hit_count: entry.hits,
                    sequence,
                    ttl,
                },
            );
        }
        inner.entries.len()
    }
}

/// Write off the async request path when a runtime is around
fn schedule_snapshot(writer: Arc<SnapshotWriter>, generation: u64, snapshot: Snapshot) {
    let write = move || {
        if let Err(e) = writer.write(generation, &snapshot) {
            tracing::warn!(error = %e, "Failed to save cache snapshot");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, CacheError> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(Some(serde_json::from_slice(&body)?))
}

// ============================================================================
// Tests
// ============================================================================
