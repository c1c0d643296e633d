//! Process-local caches in front of the job store.
//!
//! - [`ResultCache`] keeps terminal results so repeated polls skip the store.
//!   Entries are fresh until the soft TTL, then stale until the hard TTL.
//!   Stale entries are only served when the store cannot answer.
//! - [`MissingTracker`] counts polls for ids that no queue knows about and
//!   escalates to "gone" once a threshold is reached inside the window.
//!
//! Both take an explicit `now` in their `_at` variants so expiry can be
//! tested without sleeping.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, PollConfig};

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Instant,
    pub soft_expires_at: Instant,
    pub hard_expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Fresh(V),
    /// Past the soft TTL: revalidate, but usable as a fallback
    Stale(V),
    Miss,
}

pub struct ResultCache<V> {
    soft_ttl: Duration,
    hard_ttl: Duration,
    capacity: usize,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(soft_ttl: Duration, hard_ttl: Duration, capacity: usize) -> Self {
        Self {
            soft_ttl,
            hard_ttl: hard_ttl.max(soft_ttl),
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.soft_ttl, config.hard_ttl, config.capacity)
    }

    pub fn get(&self, id: &str) -> CacheLookup<V> {
        self.get_at(id, Instant::now())
    }

    pub fn get_at(&self, id: &str, now: Instant) -> CacheLookup<V> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(id) {
            Some(entry) if now < entry.soft_expires_at => CacheLookup::Fresh(entry.value.clone()),
            Some(entry) if now < entry.hard_expires_at => CacheLookup::Stale(entry.value.clone()),
            _ => CacheLookup::Miss,
        }
    }

    pub fn put(&self, id: impl Into<String>, value: V) {
        self.put_at(id, value, Instant::now());
    }

    pub fn put_at(&self, id: impl Into<String>, value: V, now: Instant) {
        let id = id.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if entries.len() >= self.capacity && !entries.contains_key(&id) {
            entries.retain(|_, entry| entry.hard_expires_at > now);

            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.fetched_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            id,
            CacheEntry {
                value,
                fetched_at: now,
                soft_expires_at: now + self.soft_ttl,
                hard_expires_at: now + self.hard_ttl,
            },
        );
    }

    pub fn remove(&self, id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct MissingRecord {
    first_seen_at: Instant,
    hit_count: u32,
}

/// Outcome of recording a poll for an id no queue knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissVerdict {
    /// Possibly not yet visible; the client should keep polling
    NotFound { hits: u32 },
    /// Missed often enough that the client should stop
    Gone { hits: u32 },
}

pub struct MissingTracker {
    window: Duration,
    /// 0 disables escalation
    threshold: u32,
    capacity: usize,
    state: Mutex<MissingState>,
}

#[derive(Default)]
struct MissingState {
    records: HashMap<String, MissingRecord>,
    /// Window starts in arrival order. Entries whose record was reset or
    /// forgotten stay behind and are skipped when reached.
    order: VecDeque<(Instant, String)>,
}

impl MissingState {
    fn is_current(&self, started: Instant, id: &str) -> bool {
        self.records
            .get(id)
            .is_some_and(|record| record.first_seen_at == started)
    }

    /// Drop the oldest tracked id. Returns false once nothing is left.
    fn evict_oldest(&mut self) -> bool {
        while let Some((started, id)) = self.order.pop_front() {
            if self.is_current(started, &id) {
                self.records.remove(&id);
                return true;
            }
        }
        false
    }

    fn purge_expired(&mut self, now: Instant, window: Duration) {
        while let Some((started, id)) = self.order.front() {
            let current = self.is_current(*started, id);
            if current && now.duration_since(*started) <= window {
                break;
            }
            if current {
                let id = id.clone();
                self.records.remove(&id);
            }
            self.order.pop_front();
        }
    }
}

pub const DEFAULT_MISSING_CAPACITY: usize = 10_000;

impl MissingTracker {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            capacity: DEFAULT_MISSING_CAPACITY,
            state: Mutex::new(MissingState::default()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(config.missing_ttl, config.missing_threshold)
            .with_capacity(config.missing_capacity)
    }

    pub fn record_miss(&self, id: &str) -> MissVerdict {
        self.record_miss_at(id, Instant::now())
    }

    pub fn record_miss_at(&self, id: &str, now: Instant) -> MissVerdict {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.purge_expired(now, self.window);

        let restarted = match state.records.get_mut(id) {
            Some(record) if now.duration_since(record.first_seen_at) <= self.window => {
                record.hit_count += 1;
                None
            }
            _ => Some(MissingRecord {
                first_seen_at: now,
                hit_count: 1,
            }),
        };

        if let Some(record) = restarted {
            state.records.insert(id.to_string(), record);
            state.order.push_back((now, id.to_string()));

            while state.records.len() > self.capacity {
                if !state.evict_oldest() {
                    break;
                }
            }
            if state.order.len() > self.capacity.saturating_mul(2) {
                let MissingState { records, order } = &mut *state;
                order.retain(|(started, id)| {
                    records
                        .get(id)
                        .is_some_and(|record| record.first_seen_at == *started)
                });
            }
        }

        let hits = state.records.get(id).map_or(1, |record| record.hit_count);

        if self.threshold > 0 && hits >= self.threshold {
            MissVerdict::Gone { hits }
        } else {
            MissVerdict::NotFound { hits }
        }
    }

    /// Clear the record once the id shows up.
    pub fn forget(&self, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.remove(id);
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResultCache<String> {
        ResultCache::new(Duration::from_secs(30), Duration::from_secs(600), 3)
    }

    #[test]
    fn entry_goes_fresh_then_stale_then_missing() {
        let cache = cache();
        let t0 = Instant::now();
        cache.put_at("a", "done".to_string(), t0);

        assert_eq!(cache.get_at("a", t0 + Duration::from_secs(10)), CacheLookup::Fresh("done".into()));
        assert_eq!(cache.get_at("a", t0 + Duration::from_secs(31)), CacheLookup::Stale("done".into()));
        assert_eq!(cache.get_at("a", t0 + Duration::from_secs(601)), CacheLookup::Miss);
        assert_eq!(cache.get_at("b", t0), CacheLookup::Miss);
    }

    #[test]
    fn put_refreshes_existing_entry() {
        let cache = cache();
        let t0 = Instant::now();
        cache.put_at("a", "v1".to_string(), t0);
        cache.put_at("a", "v2".to_string(), t0 + Duration::from_secs(40));

        assert_eq!(cache.get_at("a", t0 + Duration::from_secs(50)), CacheLookup::Fresh("v2".into()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_expired_before_oldest() {
        let cache = cache();
        let t0 = Instant::now();
        cache.put_at("old", "x".to_string(), t0);
        cache.put_at("mid", "x".to_string(), t0 + Duration::from_secs(500));
        cache.put_at("new", "x".to_string(), t0 + Duration::from_secs(550));

        // "old" is past its hard TTL at this point
        let later = t0 + Duration::from_secs(650);
        cache.put_at("next", "x".to_string(), later);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_at("old", later), CacheLookup::Miss);
        assert!(matches!(cache.get_at("mid", later), CacheLookup::Stale(_)));

        // Nothing expired: the oldest entry goes
        cache.put_at("last", "x".to_string(), later);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_at("mid", later), CacheLookup::Miss);
        assert!(matches!(cache.get_at("last", later), CacheLookup::Fresh(_)));
    }

    #[test]
    fn missing_escalates_on_threshold_hit() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 5);
        let t0 = Instant::now();

        for hit in 1..=4 {
            assert_eq!(
                tracker.record_miss_at("ghost", t0 + Duration::from_secs(hit as u64)),
                MissVerdict::NotFound { hits: hit }
            );
        }
        assert_eq!(
            tracker.record_miss_at("ghost", t0 + Duration::from_secs(5)),
            MissVerdict::Gone { hits: 5 }
        );
    }

    #[test]
    fn missing_window_restarts_count() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 2);
        let t0 = Instant::now();

        assert_eq!(tracker.record_miss_at("ghost", t0), MissVerdict::NotFound { hits: 1 });
        assert_eq!(
            tracker.record_miss_at("ghost", t0 + Duration::from_secs(121)),
            MissVerdict::NotFound { hits: 1 }
        );
        assert_eq!(
            tracker.record_miss_at("ghost", t0 + Duration::from_secs(122)),
            MissVerdict::Gone { hits: 2 }
        );
    }

    #[test]
    fn forget_clears_count() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 2);
        let t0 = Instant::now();

        tracker.record_miss_at("late", t0);
        tracker.forget("late");
        assert_eq!(tracker.record_miss_at("late", t0), MissVerdict::NotFound { hits: 1 });
    }

    #[test]
    fn missing_tracker_is_bounded_and_drops_oldest() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 3).with_capacity(2);
        let t0 = Instant::now();

        tracker.record_miss_at("a", t0);
        tracker.record_miss_at("a", t0 + Duration::from_secs(1));
        tracker.record_miss_at("b", t0 + Duration::from_secs(2));
        tracker.record_miss_at("c", t0 + Duration::from_secs(3));
        assert_eq!(tracker.len(), 2);

        // "a" was the oldest and starts over
        assert_eq!(
            tracker.record_miss_at("a", t0 + Duration::from_secs(4)),
            MissVerdict::NotFound { hits: 1 }
        );
        // which pushed out "b" in turn
        assert_eq!(
            tracker.record_miss_at("c", t0 + Duration::from_secs(5)),
            MissVerdict::NotFound { hits: 2 }
        );
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn polling_storm_stays_within_capacity() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 5).with_capacity(100);
        let t0 = Instant::now();

        for n in 0..5_000u64 {
            tracker.record_miss_at(&format!("id-{n}"), t0 + Duration::from_millis(n));
        }
        assert_eq!(tracker.len(), 100);

        // Expired records are purged as time moves past the window
        tracker.record_miss_at("late", t0 + Duration::from_secs(600));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn forgotten_id_does_not_evict_a_newer_record() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 5).with_capacity(2);
        let t0 = Instant::now();

        tracker.record_miss_at("a", t0);
        tracker.forget("a");
        tracker.record_miss_at("b", t0 + Duration::from_secs(1));
        tracker.record_miss_at("a", t0 + Duration::from_secs(2));
        assert_eq!(tracker.len(), 2);

        assert_eq!(
            tracker.record_miss_at("a", t0 + Duration::from_secs(3)),
            MissVerdict::NotFound { hits: 2 }
        );
        assert_eq!(
            tracker.record_miss_at("b", t0 + Duration::from_secs(4)),
            MissVerdict::NotFound { hits: 2 }
        );
    }

    #[test]
    fn zero_threshold_never_escalates() {
        let tracker = MissingTracker::new(Duration::from_secs(120), 0);
        let t0 = Instant::now();
        for _ in 0..50 {
            assert!(matches!(
                tracker.record_miss_at("ghost", t0),
                MissVerdict::NotFound { .. }
            ));
        }
    }
}
