//! Short-lived caches for playlists and segments.
//!
//! Entries are immutable once written; a later write for the same key
//! simply replaces the earlier one. Expired entries are dropped when read
//! and swept opportunistically on insert.

use bytes::Bytes;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

const SWEEP_THRESHOLD: usize = 256;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if self.entries.len() >= SWEEP_THRESHOLD {
            self.sweep();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !predicate(k));
        before.saturating_sub(self.entries.len())
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Upstream playlist bodies per channel.
pub type PlaylistCache = TtlCache<i64, Bytes>;

/// Segment bodies keyed by channel and segment file name.
pub type SegmentCache = TtlCache<(i64, String), Bytes>;

/// Both HLS caches, purged together.
pub struct HlsCache {
    pub playlists: PlaylistCache,
    pub segments: SegmentCache,
}

impl HlsCache {
    pub fn new(playlist_ttl: Duration, segment_ttl: Duration) -> Self {
        Self {
            playlists: TtlCache::new(playlist_ttl),
            segments: TtlCache::new(segment_ttl),
        }
    }

    /// Forgets everything cached for one channel.
    pub fn purge_channel(&self, channel_id: i64) -> usize {
        self.playlists.remove_where(|id| *id == channel_id)
            + self.segments.remove_where(|(id, _)| *id == channel_id)
    }

    pub fn clear(&self) {
        self.playlists.clear();
        self.segments.clear();
    }
}
