// ── Scheduler / Heartbeat Fabric (§4.7) ──────────────────────────────────
// Durable job definitions live in `SqliteStore` (survive a restart);
// at-most-one execution per fire is enforced by a SET-NX lock in the KV
// store, exactly the same primitive the ledger's idempotency keys use for
// its own at-most-once guarantee, just one layer up. Heartbeats are a
// plain volatile KV key a liveness probe can poll.

use crate::alerts::ErrorReporter;
use crate::atoms::constants::{
    quota_key, FAST_AUDIT_INTERVAL_SECS, FAST_AUDIT_MINUTE_OFFSET, FAST_AUDIT_SAMPLE_SIZE, HEARTBEAT_TTL_SECS, QUOTA_WINDOW_DAILY, QUOTA_WINDOW_MONTHLY, SCHEDULER_HEARTBEAT_INTERVAL_SECS,
    SLOW_AUDIT_INTERVAL_SECS, SLOW_AUDIT_PAGE_SIZE, UPDATE_SKILL_PRICE_CACHE_INTERVAL_SECS,
};
use crate::atoms::decimal::Amount;
use crate::atoms::error::PlatformResult;
use crate::atoms::ids::new_sortable_id;
use crate::atoms::types::{AutonomousTask, JobTrigger, ModelPrice, ScheduledJob, TaskSchedule};
use crate::checker::{ConsistencyChecker, FastAuditJob, SlowAuditJob};
use crate::engine::ExecutionEngine;
use crate::ledger::Ledger;
use crate::store::{AgentRepo, ChatRepo, KvStore, ScheduledJobRepo, SqliteStore};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Generous bound on any single job's runtime; the lock TTL, not the job
/// interval. A job wedged past this releases its lock for the next runner.
const JOB_LOCK_TTL_SECS: u64 = 120;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> PlatformResult<()>;
}

/// Concrete credential storage lives outside this crate; this job composes
/// against the trait so a real implementation can be swapped in without
/// touching the scheduler.
pub trait CredentialRefresher: Send + Sync {
    fn refresh_expiring(&self) -> PlatformResult<u64>;
}

pub struct NoopCredentialRefresher;

impl CredentialRefresher for NoopCredentialRefresher {
    fn refresh_expiring(&self) -> PlatformResult<u64> {
        Ok(0)
    }
}

/// Source of per-model pricing data, reloaded into the KV cache on a timer.
pub trait PriceSource: Send + Sync {
    fn load_prices(&self) -> PlatformResult<HashMap<String, ModelPrice>>;
}

pub struct StaticPriceSource(pub HashMap<String, ModelPrice>);

impl PriceSource for StaticPriceSource {
    fn load_prices(&self) -> PlatformResult<HashMap<String, ModelPrice>> {
        Ok(self.0.clone())
    }
}

pub const SKILL_PRICE_CACHE_KEY: &str = "skill_price_cache";

struct RefillFreeCreditsJob {
    ledger: Arc<Ledger>,
    ceiling: Amount,
}

#[async_trait]
impl JobHandler for RefillFreeCreditsJob {
    async fn run(&self) -> PlatformResult<()> {
        let events = self.ledger.refill_free_credits(self.ceiling)?;
        info!("[scheduler] refill_free_credits topped up {} accounts", events.len());
        Ok(())
    }
}

/// Quota counters are KV keys with their own TTL (§4.9) that would
/// eventually self-expire, but this job clears every enabled agent's
/// counter the instant the window rolls over, so a quota ceiling raised
/// mid-window (or a counter whose TTL drifted from the calendar boundary)
/// never leaves a stale block in place.
struct QuotaWindowBoundaryJob {
    store: Arc<SqliteStore>,
    kv: Arc<dyn KvStore>,
    window: &'static str,
}

#[async_trait]
impl JobHandler for QuotaWindowBoundaryJob {
    async fn run(&self) -> PlatformResult<()> {
        let agents = self.store.with_txn(AgentRepo::list_all_enabled)?;
        for agent in &agents {
            self.kv.delete(&quota_key(&agent.id, self.window));
        }
        info!("[scheduler] {} quota window boundary reached, cleared {} agent counters", self.window, agents.len());
        Ok(())
    }
}

struct RefreshExpiringCredentialsJob {
    refresher: Arc<dyn CredentialRefresher>,
}

#[async_trait]
impl JobHandler for RefreshExpiringCredentialsJob {
    async fn run(&self) -> PlatformResult<()> {
        let refreshed = self.refresher.refresh_expiring()?;
        if refreshed > 0 {
            info!("[scheduler] refreshed {refreshed} expiring credentials");
        }
        Ok(())
    }
}

struct UpdateSkillPriceCacheJob {
    kv: Arc<dyn KvStore>,
    source: Arc<dyn PriceSource>,
}

#[async_trait]
impl JobHandler for UpdateSkillPriceCacheJob {
    async fn run(&self) -> PlatformResult<()> {
        let prices = self.source.load_prices()?;
        let json = serde_json::to_string(&prices)?;
        self.kv.set_volatile(SKILL_PRICE_CACHE_KEY, &json, Duration::from_secs(UPDATE_SKILL_PRICE_CACHE_INTERVAL_SECS as u64 * 2));
        info!("[scheduler] updated skill price cache ({} models)", prices.len());
        Ok(())
    }
}

struct JobEntry {
    id: String,
    trigger: JobTrigger,
    handler: Arc<dyn JobHandler>,
}

const SCHEDULER_HEARTBEAT_KEY: &str = "scheduler_heartbeat";

pub struct Scheduler {
    store: Arc<SqliteStore>,
    kv: Arc<dyn KvStore>,
    runner_id: String,
    jobs: Vec<JobEntry>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl Scheduler {
    pub fn new(store: Arc<SqliteStore>, kv: Arc<dyn KvStore>, error_reporter: Arc<dyn ErrorReporter>) -> Self {
        Scheduler { store, kv, runner_id: new_sortable_id(), jobs: Vec::new(), error_reporter }
    }

    pub fn register(&mut self, id: impl Into<String>, trigger: JobTrigger, handler: Arc<dyn JobHandler>) {
        self.jobs.push(JobEntry { id: id.into(), trigger, handler });
    }

    /// Wires the five credit/price jobs plus the two consistency-checker
    /// audit bands onto the same lock/cadence machinery, with their pinned
    /// cadences (§4.7, §4.8): fast band every two hours at :30 past, slow
    /// band twice daily at 00:00 and 12:00 UTC.
    pub fn with_builtin_jobs(mut self, ledger: Arc<Ledger>, free_credit_ceiling: Amount, refresher: Arc<dyn CredentialRefresher>, price_source: Arc<dyn PriceSource>, checker: Arc<ConsistencyChecker>) -> Self {
        self.register("reset_daily_quotas", JobTrigger::Cron("0 0 * * *".to_string()), Arc::new(QuotaWindowBoundaryJob { store: self.store.clone(), kv: self.kv.clone(), window: QUOTA_WINDOW_DAILY }));
        self.register("reset_monthly_quotas", JobTrigger::Cron("0 0 1 * *".to_string()), Arc::new(QuotaWindowBoundaryJob { store: self.store.clone(), kv: self.kv.clone(), window: QUOTA_WINDOW_MONTHLY }));
        self.register("refresh_expiring_credentials", JobTrigger::IntervalMinutes(5), Arc::new(RefreshExpiringCredentialsJob { refresher }));
        self.register("refill_free_credits", JobTrigger::IntervalMinutes(60), Arc::new(RefillFreeCreditsJob { ledger, ceiling: free_credit_ceiling }));
        self.register("update_skill_price_cache", JobTrigger::IntervalMinutes(60), Arc::new(UpdateSkillPriceCacheJob { kv: self.kv.clone(), source: price_source }));
        self.register("quick_account_checks", JobTrigger::Cron(hourly_cron(FAST_AUDIT_INTERVAL_SECS, FAST_AUDIT_MINUTE_OFFSET)), Arc::new(FastAuditJob { checker: checker.clone(), sample_size: FAST_AUDIT_SAMPLE_SIZE }));
        self.register("slow_account_checks", JobTrigger::Cron(hourly_cron(SLOW_AUDIT_INTERVAL_SECS, 0)), Arc::new(SlowAuditJob { checker, page_size: SLOW_AUDIT_PAGE_SIZE }));
        self
    }

    /// Publishes this replica's liveness marker (§4.7). Callers invoke once
    /// per `SCHEDULER_HEARTBEAT_INTERVAL_SECS`.
    pub fn beat(&self) {
        self.kv.set_volatile(SCHEDULER_HEARTBEAT_KEY, &self.runner_id, Duration::from_secs(HEARTBEAT_TTL_SECS as u64));
    }

    pub fn heartbeat_interval() -> Duration {
        Duration::from_secs(SCHEDULER_HEARTBEAT_INTERVAL_SECS as u64)
    }

    /// Runs the tick/beat loop until `shutdown` is signalled, clearing this
    /// replica's heartbeat key on the way out (§1.B) rather than letting it
    /// linger until the TTL expires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PlatformResult<()> {
        let mut interval = tokio::time::interval(Self::heartbeat_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.beat();
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("[scheduler] tick failed: {e}");
                        self.error_reporter.report(&e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.kv.delete(SCHEDULER_HEARTBEAT_KEY);
        info!("[scheduler] runner {} shut down, heartbeat cleared", self.runner_id);
        Ok(())
    }

    /// Runs every due job exactly once, regardless of how many replicas
    /// call `tick` at the same instant (§8 Scenario 4). Returns the ids of
    /// jobs this replica actually ran.
    pub async fn tick(&self, now: DateTime<Utc>) -> PlatformResult<Vec<String>> {
        let mut ran = Vec::new();
        for job in &self.jobs {
            let stored = self.store.with_txn(|txn| ScheduledJobRepo::get(txn, &job.id))?;
            let last_run_at = stored.as_ref().and_then(|s| s.last_run_at.as_deref());
            if !is_due(&job.trigger, last_run_at, now) {
                continue;
            }

            let lock_key = format!("lock:{}", job.id);
            if !self.kv.set_nx(&lock_key, &self.runner_id, Duration::from_secs(JOB_LOCK_TTL_SECS)) {
                continue; // another replica holds the lock for this fire
            }

            if let Err(e) = job.handler.run().await {
                error!("[scheduler] job {} failed: {e}", job.id);
                self.error_reporter.report(&e);
            } else {
                ran.push(job.id.clone());
            }

            let record = ScheduledJob { id: job.id.clone(), trigger: job.trigger.clone(), last_run_at: Some(now.to_rfc3339()), next_run_at: None, lock_owner: Some(self.runner_id.clone()), lock_expires_at: None };
            self.store.with_txn(|txn| ScheduledJobRepo::upsert(txn, &record))?;
            self.kv.delete(&lock_key);
        }
        Ok(ran)
    }

    /// Fires any enabled autonomous task whose schedule is due, re-entering
    /// the Execution Engine with a synthetic user message built from the
    /// task's prompt (§4.7 autonomous-task dispatcher). Failures are logged;
    /// there is no automatic retry.
    pub async fn dispatch_autonomous_tasks(&self, engine: &ExecutionEngine, now: DateTime<Utc>) -> PlatformResult<Vec<String>> {
        let agents = self.store.with_txn(AgentRepo::list_all_enabled)?;
        let mut fired = Vec::new();

        for agent in agents {
            for task in &agent.autonomous_tasks {
                if !task.enabled {
                    continue;
                }
                let trigger = task_trigger(task);
                let job_id = format!("autonomous:{}", task.id);
                let stored = self.store.with_txn(|txn| ScheduledJobRepo::get(txn, &job_id))?;
                let last_run_at = stored.as_ref().and_then(|s| s.last_run_at.as_deref());
                if !is_due(&trigger, last_run_at, now) {
                    continue;
                }

                let lock_key = format!("lock:{job_id}");
                if !self.kv.set_nx(&lock_key, &self.runner_id, Duration::from_secs(JOB_LOCK_TTL_SECS)) {
                    continue;
                }

                let thread_user = format!("autonomous:{}", agent.id);
                let thread = self.store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &thread_user))?;
                match engine.execute(&agent, &thread.id, &task.prompt).await {
                    Ok(_) => fired.push(task.id.clone()),
                    Err(e) => {
                    warn!("[scheduler] autonomous task {} on agent {} failed: {e}", task.id, agent.id);
                    self.error_reporter.report(&e);
                }
                }

                let record = ScheduledJob { id: job_id.clone(), trigger, last_run_at: Some(now.to_rfc3339()), next_run_at: None, lock_owner: Some(self.runner_id.clone()), lock_expires_at: None };
                self.store.with_txn(|txn| ScheduledJobRepo::upsert(txn, &record))?;
                self.kv.delete(&lock_key);
            }
        }
        Ok(fired)
    }
}

/// Builds a `"<minute> */<hour_step> * * *"` cron expression for a cadence
/// expressed in seconds, e.g. `hourly_cron(2 * 3600, 30)` -> `"30 */2 * * *"`.
fn hourly_cron(interval_secs: i64, minute_offset: u32) -> String {
    let hour_step = (interval_secs / 3600).max(1);
    format!("{minute_offset} */{hour_step} * * *")
}

fn task_trigger(task: &AutonomousTask) -> JobTrigger {
    match &task.schedule {
        TaskSchedule::Minutes(m) => JobTrigger::IntervalMinutes(*m),
        TaskSchedule::Cron(expr) => JobTrigger::Cron(expr.clone()),
    }
}

fn is_due(trigger: &JobTrigger, last_run_at: Option<&str>, now: DateTime<Utc>) -> bool {
    match trigger {
        JobTrigger::IntervalMinutes(minutes) => match last_run_at.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
            None => true,
            Some(last) => now.signed_duration_since(last.with_timezone(&Utc)) >= chrono::Duration::minutes(*minutes as i64),
        },
        JobTrigger::Cron(expr) => {
            if !matches_cron(expr, now) {
                return false;
            }
            match last_run_at.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
                None => true,
                Some(last) => last.with_timezone(&Utc).format("%Y%m%d%H%M").to_string() != now.format("%Y%m%d%H%M").to_string(),
            }
        }
    }
}

/// Minimal 5-field cron matcher (minute hour day-of-month month day-of-week):
/// `*`, a bare integer, a comma list, or a `*/N` step. Enough to express
/// every built-in job's fixed cadence without pulling in a cron crate the
/// rest of the stack has no other use for.
fn matches_cron(expr: &str, now: DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        warn!("[scheduler] malformed cron expression, never fires: {expr}");
        return false;
    }
    field_matches(fields[0], now.minute() as i64)
        && field_matches(fields[1], now.hour() as i64)
        && field_matches(fields[2], now.day() as i64)
        && field_matches(fields[3], now.month() as i64)
        && field_matches(fields[4], now.weekday().num_days_from_sunday() as i64)
}

fn field_matches(field: &str, value: i64) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<i64>().map(|s| s > 0 && value % s == 0).unwrap_or(false);
    }
    field.split(',').any(|part| part.trim().parse::<i64>().map(|n| n == value).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for CountingJob {
        async fn run(&self) -> PlatformResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn interval_job_fires_exactly_once_per_minute_across_replicas() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut replica_a = Scheduler::new(store.clone(), kv.clone(), Arc::new(crate::alerts::LogErrorReporter));
        replica_a.register("minutely", JobTrigger::IntervalMinutes(1), Arc::new(CountingJob(counter.clone())));
        let mut replica_b = Scheduler::new(store.clone(), kv.clone(), Arc::new(crate::alerts::LogErrorReporter));
        replica_b.register("minutely", JobTrigger::IntervalMinutes(1), Arc::new(CountingJob(counter.clone())));

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for i in 0..100 {
            let now = start + chrono::Duration::minutes(i);
            replica_a.tick(now).await.unwrap();
            replica_b.tick(now).await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn cron_job_fires_only_at_matching_minute() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new(store, kv, Arc::new(crate::alerts::LogErrorReporter));
        scheduler.register("midnight", JobTrigger::Cron("0 0 * * *".to_string()), Arc::new(CountingJob(counter.clone())));

        scheduler.tick(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()).await.unwrap();
        scheduler.tick(Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap()).await.unwrap();
        scheduler.tick(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cron_step_field_matches_multiples() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap();
        assert!(matches_cron("*/5 * * * *", now));
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 11, 0).unwrap();
        assert!(!matches_cron("*/5 * * * *", now));
    }
}
