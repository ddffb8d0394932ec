// ── KV store adapter (§4.2.A) ────────────────────────────────────────────
// The Scheduler/Heartbeat Fabric needs atomic counters, SET-NX locks, and
// expiring keys — a Redis-shaped contract, kept as a trait so a real
// Redis-backed implementation can replace `MemoryKvStore` without the
// scheduler or checker code changing. `MemoryKvStore` is what the
// in-process tests and `agentry-admin` run against.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait KvStore: Send + Sync {
    /// Atomically increment `key` by 1, setting the expiry to `ttl` only
    /// when the key did not already exist. Returns the post-increment
    /// value. Used by quota counters (§4.9) so a concurrent burst of
    /// requests increments exactly once each, with the TTL anchored to
    /// the counter's first write.
    fn incr_with_expiry(&self, key: &str, ttl: Duration) -> u64;

    /// `SET key value NX PX ttl`: succeeds (returns true) only if `key`
    /// was absent. The building block for the scheduler's singleton locks
    /// (§4.7) — exactly one runner holds the lock for `ttl`.
    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool;

    /// Unconditional set with expiry — used for heartbeat keys and the
    /// cold-start amortization marker (§9 resolved Open Question).
    fn set_volatile(&self, key: &str, value: &str, ttl: Duration);

    fn get(&self, key: &str) -> Option<String>;

    /// Delete a key this process owns (lock release on graceful shutdown).
    fn delete(&self, key: &str);

    /// Set one field of a hash, creating the hash if absent. Backs
    /// `DurableJobStore`'s KV-only alternative to the relational
    /// `ScheduledJobRepo` (§1.B "RedisJobStore-style durable job store").
    fn hset(&self, hash: &str, field: &str, value: &str);

    fn hget(&self, hash: &str, field: &str) -> Option<String>;

    fn hgetall(&self, hash: &str) -> HashMap<String, String>;

    /// Set (or refresh) a key's TTL without changing its value.
    fn expire(&self, key: &str, ttl: Duration);

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// In-process KV store behind a single mutex — same honesty tradeoff as
/// `SqliteStore`: no real distributed locking, but correct within one
/// process, and swappable for a Redis client implementing the same trait.
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        MemoryKvStore { entries: Mutex::new(HashMap::new()), hashes: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn incr_with_expiry(&self, key: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries.get(key).map(|e| e.is_live(now)).unwrap_or(false);
        if !live {
            entries.insert(key.to_string(), Entry { value: "1".into(), expires_at: Some(now + ttl) });
            return 1;
        }
        let entry = entries.get_mut(key).expect("checked live above");
        let next: u64 = entry.value.parse().unwrap_or(0) + 1;
        entry.value = next.to_string();
        next
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries.get(key).map(|e| e.is_live(now)).unwrap_or(false);
        if live {
            return false;
        }
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at: Some(now + ttl) });
        true
    }

    fn set_volatile(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        self.entries.lock().insert(key.to_string(), Entry { value: value.to_string(), expires_at: Some(now + ttl) });
    }

    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn hset(&self, hash: &str, field: &str, value: &str) {
        self.hashes.lock().entry(hash.to_string()).or_default().insert(field.to_string(), value.to_string());
    }

    fn hget(&self, hash: &str, field: &str) -> Option<String> {
        self.hashes.lock().get(hash).and_then(|h| h.get(field).cloned())
    }

    fn hgetall(&self, hash: &str) -> HashMap<String, String> {
        self.hashes.lock().get(hash).cloned().unwrap_or_default()
    }

    fn expire(&self, key: &str, ttl: Duration) {
        let now = Instant::now();
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
    }
}

/// KV-only alternative to the relational `ScheduledJobRepo`: serializes
/// each `ScheduledJob` into a field of one hash (`scheduler:jobs`), the
/// shape a Redis-backed `KvStore` would need to back the scheduler without
/// a relational store at all (§1.B).
const SCHEDULER_JOBS_HASH: &str = "scheduler:jobs";

pub struct DurableJobStore {
    kv: std::sync::Arc<dyn KvStore>,
}

impl DurableJobStore {
    pub fn new(kv: std::sync::Arc<dyn KvStore>) -> Self {
        DurableJobStore { kv }
    }

    pub fn upsert(&self, job: &crate::atoms::types::ScheduledJob) -> crate::atoms::error::PlatformResult<()> {
        let json = serde_json::to_string(job)?;
        self.kv.hset(SCHEDULER_JOBS_HASH, &job.id, &json);
        Ok(())
    }

    pub fn get(&self, id: &str) -> crate::atoms::error::PlatformResult<Option<crate::atoms::types::ScheduledJob>> {
        match self.kv.hget(SCHEDULER_JOBS_HASH, id) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn list_all(&self) -> crate::atoms::error::PlatformResult<Vec<crate::atoms::types::ScheduledJob>> {
        self.kv.hgetall(SCHEDULER_JOBS_HASH).values().map(|json| serde_json::from_str(json).map_err(Into::into)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nx_only_succeeds_once_while_live() {
        let kv = MemoryKvStore::new();
        assert!(kv.set_nx("lock:scheduler", "runner-a", Duration::from_secs(60)));
        assert!(!kv.set_nx("lock:scheduler", "runner-b", Duration::from_secs(60)));
        kv.delete("lock:scheduler");
        assert!(kv.set_nx("lock:scheduler", "runner-b", Duration::from_secs(60)));
    }

    #[test]
    fn incr_with_expiry_counts_up_from_one() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.incr_with_expiry("quota:agent-1", Duration::from_secs(86_400)), 1);
        assert_eq!(kv.incr_with_expiry("quota:agent-1", Duration::from_secs(86_400)), 2);
        assert_eq!(kv.incr_with_expiry("quota:agent-1", Duration::from_secs(86_400)), 3);
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let kv = MemoryKvStore::new();
        kv.set_volatile("heartbeat:scheduler", "alive", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(kv.get("heartbeat:scheduler"), None);
    }

    #[test]
    fn hash_fields_are_independent_and_overwrite_in_place() {
        let kv = MemoryKvStore::new();
        kv.hset("scheduler:jobs", "job-a", "{\"v\":1}");
        kv.hset("scheduler:jobs", "job-b", "{\"v\":2}");
        assert_eq!(kv.hget("scheduler:jobs", "job-a"), Some("{\"v\":1}".to_string()));
        assert_eq!(kv.hgetall("scheduler:jobs").len(), 2);

        kv.hset("scheduler:jobs", "job-a", "{\"v\":3}");
        assert_eq!(kv.hget("scheduler:jobs", "job-a"), Some("{\"v\":3}".to_string()));
        assert_eq!(kv.hgetall("scheduler:jobs").len(), 2);
    }

    #[test]
    fn durable_job_store_round_trips_scheduled_jobs() {
        use crate::atoms::types::{JobTrigger, ScheduledJob};
        let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
        let store = DurableJobStore::new(kv);

        let job = ScheduledJob {
            id: "refill_free_credits".to_string(),
            trigger: JobTrigger::IntervalMinutes(60),
            last_run_at: Some("2026-01-01T00:00:00Z".to_string()),
            next_run_at: None,
            lock_owner: None,
            lock_expires_at: None,
        };
        store.upsert(&job).unwrap();

        let fetched = store.get(&job.id).unwrap().unwrap();
        assert_eq!(fetched.last_run_at, job.last_run_at);
        assert_eq!(store.list_all().unwrap().len(), 1);
        assert!(store.get("missing").unwrap().is_none());
    }
}
