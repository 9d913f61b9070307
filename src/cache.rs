//! Fast-path result cache.
//!
//! Bounded, fingerprint-keyed cache of recently synthesized outputs for small
//! requests. Bounded by entry count and by total payload bytes; inserting
//! beyond either bound evicts least-recently-used entries first.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use synth_governor::{FastPathCache, Fingerprint, SynthesisOutput, SynthesisRequest};
//!
//! let cache = FastPathCache::with_limits(128, 1 << 20);
//! let request = SynthesisRequest::new("hello", "af");
//! let fp = Fingerprint::of(&request);
//!
//! if cache.get(&fp).is_none() {
//!     let output = SynthesisOutput { audio: vec![0.0; 16], output_duration: Duration::from_millis(1) };
//!     cache.put(fp, Arc::new(output));
//! }
//! ```
//!
//! The cache is advisory: a miss is always resolvable by running the
//! synthesis, and a `get` racing a concurrent [`FastPathCache::clear`] may
//! miss an entry that existed moments earlier.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::CacheConfig;
use crate::synth::{SynthesisOutput, SynthesisRequest};

/// Deterministic key derived from the semantically relevant request inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Fingerprint of text, voice, speed and options.
    ///
    /// Speed is hashed by bit pattern, so `1.0` and `1.0000001` differ.
    pub fn of(request: &SynthesisRequest) -> Self {
        let mut hasher = DefaultHasher::new();
        request.text.hash(&mut hasher);
        request.voice.hash(&mut hasher);
        request.speed.to_bits().hash(&mut hasher);
        for (key, value) in &request.options {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

struct CacheEntry {
    value: Arc<SynthesisOutput>,
    size_bytes: usize,
    last_access: AtomicU64,
    created_at: Instant,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Tracked payload bytes.
    pub bytes: usize,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries removed for capacity, byte budget, or TTL.
    pub evictions: u64,
}

/// Bounded LRU cache of synthesis outputs.
///
/// Backed by a [`DashMap`] with per-entry atomic access ticks, so `get`
/// only takes a shard read lock. Eviction and [`clear`](Self::clear) never
/// hold one shard guard while locking another.
pub struct FastPathCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    capacity: usize,
    byte_budget: usize,
    ttl: Duration,
    max_text_len: usize,
    clock: AtomicU64,
    bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FastPathCache {
    /// Build a cache from its config section.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: config.capacity,
            byte_budget: config.byte_budget,
            ttl: config.ttl(),
            max_text_len: config.max_text_len,
            clock: AtomicU64::new(0),
            bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache with explicit entry and byte bounds and default TTL/eligibility.
    pub fn with_limits(capacity: usize, byte_budget: usize) -> Self {
        Self::new(&CacheConfig {
            capacity,
            byte_budget,
            ..CacheConfig::default()
        })
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether `request` is small enough to be cached.
    pub fn is_eligible(&self, request: &SynthesisRequest) -> bool {
        request.text.chars().count() <= self.max_text_len
    }

    /// Look up a fingerprint, refreshing its recency on hit.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<SynthesisOutput>> {
        if let Some(entry) = self.entries.get(fingerprint) {
            if entry.created_at.elapsed() < self.ttl {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "fast-path cache hit");
                return Some(Arc::clone(&entry.value));
            }
            drop(entry);
            self.remove_expired(fingerprint);
            debug!(fingerprint = %fingerprint, "fast-path cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry, then evict LRU entries over budget.
    ///
    /// Returns `false` without storing when the value alone exceeds the byte
    /// budget.
    pub fn put(&self, fingerprint: Fingerprint, value: Arc<SynthesisOutput>) -> bool {
        let size_bytes = value.size_bytes();
        if size_bytes > self.byte_budget || self.capacity == 0 {
            debug!(fingerprint = %fingerprint, size_bytes, "value exceeds cache budget");
            return false;
        }

        // Count bytes before the entry becomes visible so removal never
        // underflows the tracker.
        self.bytes.fetch_add(size_bytes, Ordering::AcqRel);
        let entry = CacheEntry {
            value,
            size_bytes,
            last_access: AtomicU64::new(self.tick()),
            created_at: Instant::now(),
        };
        if let Some(old) = self.entries.insert(fingerprint, entry) {
            self.bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
        }

        self.evict_over_budget(&fingerprint);
        true
    }

    /// Evict least-recently-used entries until both bounds hold.
    ///
    /// `keep` is only evicted if it is the last entry left.
    fn evict_over_budget(&self, keep: &Fingerprint) {
        while self.entries.len() > self.capacity
            || self.bytes.load(Ordering::Acquire) > self.byte_budget
        {
            // Collect the victim first; the iterator's shard guards must be
            // released before `remove` takes a write lock.
            let victim = self
                .entries
                .iter()
                .filter(|e| e.key() != keep)
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| *e.key());

            let Some(victim) = victim else {
                break;
            };
            if let Some((_, removed)) = self.entries.remove(&victim) {
                self.bytes.fetch_sub(removed.size_bytes, Ordering::AcqRel);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %victim, "fast-path cache evicted LRU entry");
            }
        }
    }

    fn remove_expired(&self, fingerprint: &Fingerprint) {
        let ttl = self.ttl;
        if let Some((_, removed)) = self
            .entries
            .remove_if(fingerprint, |_, e| e.created_at.elapsed() >= ttl)
        {
            self.bytes.fetch_sub(removed.size_bytes, Ordering::AcqRel);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every entry older than the TTL. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut purged = 0;
        self.entries.retain(|_, e| {
            if e.created_at.elapsed() >= ttl {
                self.bytes.fetch_sub(e.size_bytes, Ordering::AcqRel);
                purged += 1;
                false
            } else {
                true
            }
        });
        self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
        if purged > 0 {
            debug!(purged, "fast-path cache purged expired entries");
        }
        purged
    }

    /// Remove all entries.
    ///
    /// Safe to call concurrently with `get`/`put`: each shard is locked in
    /// turn and no other lock is held meanwhile. Entries inserted during the
    /// sweep may survive it.
    pub fn clear(&self) {
        let mut removed = 0usize;
        self.entries.retain(|_, e| {
            self.bytes.fetch_sub(e.size_bytes, Ordering::AcqRel);
            removed += 1;
            false
        });
        debug!(removed, "fast-path cache cleared");
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracked payload bytes.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Sum of entry sizes computed by walking the map.
    ///
    /// Equals [`bytes`](Self::bytes) whenever no `put` or removal is in
    /// flight.
    pub fn recount_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.value().size_bytes).sum()
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for FastPathCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
