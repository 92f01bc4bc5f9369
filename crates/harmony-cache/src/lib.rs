// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory response cache with ETags, TTL, stale-while-revalidate, and
//! write-through prefix invalidation.
//!
//! Keys are `(method, normalized path, vary hash)`. Entries are served
//! fresh inside their TTL, served stale inside the SWR window (the first
//! stale read is flagged so the caller refreshes), and missed afterwards.
//! Admission is LRU-bounded; `invalidate_prefix` removes matching entries
//! before it returns, so a read issued after an invalidating write can
//! never observe the old body. The cache fails open: internal faults
//! degrade to a miss, never an error.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use harmony_config::CacheConfig;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub path: String,
    pub vary_hash: u64,
}

impl CacheKey {
    pub fn new(method: &str, path: &str, vary_hash: u64) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: normalize_path(path),
            vary_hash,
        }
    }

    /// GET key with no vary dimension, the common case.
    pub fn get(path: &str) -> Self {
        Self::new("GET", path, 0)
    }
}

/// Collapse duplicate slashes and strip any trailing slash so lookups and
/// prefix invalidations agree on one spelling.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut last_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        out.push(ch);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Inside TTL; carries the remaining lifetime for `max-age`.
    Fresh { remaining: Duration },
    /// Past TTL but inside the SWR window.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub body: Vec<u8>,
    pub etag: String,
    pub freshness: Freshness,
    /// True on the first stale read of an entry; the caller owns the
    /// refresh.
    pub revalidate: bool,
}

impl CacheHit {
    /// `Cache-Control` value for this hit.
    pub fn cache_control(&self) -> String {
        match self.freshness {
            Freshness::Fresh { remaining } => {
                format!("public, max-age={}", remaining.as_secs())
            }
            Freshness::Stale => "public, max-age=0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub items: usize,
}

struct Entry {
    body: Vec<u8>,
    etag: String,
    stored_at: Instant,
    ttl: Duration,
    swr: Duration,
    revalidating: bool,
    /// Generation stamp of this entry's newest position in the LRU queue.
    generation: u64,
}

struct Inner {
    map: HashMap<CacheKey, Entry>,
    /// LRU order with lazy deletion: stale queue positions are skipped
    /// when their generation no longer matches the entry.
    order: VecDeque<(CacheKey, u64)>,
    next_generation: u64,
    stats: CacheStats,
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_items: usize,
    log_evictions: bool,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
                next_generation: 0,
                stats: CacheStats::default(),
            }),
            max_items: config.max_items.max(1),
            log_evictions: config.log_evictions,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(target: "cache", "cache mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let now = Instant::now();
        let mut inner = self.lock();

        let Some(entry) = inner.map.get_mut(key) else {
            inner.stats.misses += 1;
            debug!(target: "cache", event = "cache.miss", path = %key.path);
            return None;
        };

        let age = now.duration_since(entry.stored_at);
        if age < entry.ttl {
            let hit = CacheHit {
                body: entry.body.clone(),
                etag: entry.etag.clone(),
                freshness: Freshness::Fresh {
                    remaining: entry.ttl - age,
                },
                revalidate: false,
            };
            let generation = Self::bump(&mut inner, key);
            if let Some(entry) = inner.map.get_mut(key) {
                entry.generation = generation;
            }
            inner.stats.hits += 1;
            debug!(target: "cache", event = "cache.hit", path = %key.path, status = "fresh");
            return Some(hit);
        }

        if age < entry.ttl + entry.swr {
            let revalidate = !entry.revalidating;
            entry.revalidating = true;
            let hit = CacheHit {
                body: entry.body.clone(),
                etag: entry.etag.clone(),
                freshness: Freshness::Stale,
                revalidate,
            };
            inner.stats.hits += 1;
            debug!(target: "cache", event = "cache.hit", path = %key.path, status = "stale");
            return Some(hit);
        }

        // past the SWR window: drop and miss
        inner.map.remove(key);
        inner.stats.misses += 1;
        debug!(target: "cache", event = "cache.miss", path = %key.path, status = "expired");
        None
    }

    pub fn put(&self, key: CacheKey, body: Vec<u8>, ttl: Duration, swr: Duration) {
        self.put_with_etag(key, body, ttl, swr, EtagKind::Strong)
    }

    pub fn put_with_etag(
        &self,
        key: CacheKey,
        body: Vec<u8>,
        ttl: Duration,
        swr: Duration,
        etag_kind: EtagKind,
    ) {
        let etag = compute_etag(&body, etag_kind);
        let mut inner = self.lock();

        let generation = Self::bump(&mut inner, &key);
        inner.map.insert(
            key,
            Entry {
                body,
                etag,
                stored_at: Instant::now(),
                ttl,
                swr,
                revalidating: false,
                generation,
            },
        );

        while inner.map.len() > self.max_items {
            let Some((victim, generation)) = inner.order.pop_front() else {
                break;
            };
            let live = inner
                .map
                .get(&victim)
                .is_some_and(|entry| entry.generation == generation);
            if live {
                inner.map.remove(&victim);
                inner.stats.evictions += 1;
                if self.log_evictions {
                    debug!(target: "cache", event = "cache.evict", path = %victim.path, reason = "lru");
                }
            }
        }
    }

    /// Remove every entry whose path starts with `prefix`. Synchronous
    /// under the cache lock, so once this returns no reader can see a
    /// removed entry (write-through).
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let prefix = normalize_path(prefix);
        let mut inner = self.lock();

        let victims: Vec<CacheKey> = inner
            .map
            .keys()
            .filter(|key| key.path.starts_with(&prefix))
            .cloned()
            .collect();

        for key in &victims {
            inner.map.remove(key);
            inner.stats.invalidations += 1;
            if self.log_evictions {
                debug!(target: "cache", event = "cache.evict", path = %key.path, reason = "invalidate");
            }
        }
        victims.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            items: inner.map.len(),
            ..inner.stats
        }
    }

    /// Append a fresh LRU position for `key`, compacting the queue when
    /// lazy deletions pile up.
    fn bump(inner: &mut Inner, key: &CacheKey) -> u64 {
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.order.push_back((key.clone(), generation));

        if inner.order.len() > inner.map.len().saturating_mul(4).max(64) {
            let map = &inner.map;
            inner
                .order
                .retain(|(k, g)| map.get(k).is_some_and(|e| e.generation == *g));
        }
        generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtagKind {
    Strong,
    Weak,
}

/// Strong ETags are the hex digest of the body bytes; weak ones carry the
/// `W/` prefix.
fn compute_etag(body: &[u8], kind: EtagKind) -> String {
    let digest = Sha256::digest(body);
    let hex = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    match kind {
        EtagKind::Strong => format!("\"{hex}\""),
        EtagKind::Weak => format!("W/\"{hex}\""),
    }
}
