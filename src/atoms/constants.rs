// ── Atoms: Constants ───────────────────────────────────────────────────────
// Named constants for the crate. Collecting them here eliminates magic
// numbers and keeps the ledger/scheduler/engine invariants auditable in
// one place.

// ── Decimal precision (§4.1) ───────────────────────────────────────────────
// All monetary quantities use fixed-point decimal with this many fractional
// digits, rounding half-up. Equality is defined after quantization — never
// compare raw floats.
pub const AMOUNT_SCALE: u32 = 4;

// ── IDs (§4.1) ──────────────────────────────────────────────────────────────
// Lexicographically sortable, time-ordered tokens: sort order = creation order.
pub const ID_LENGTH: usize = 20;
pub const AUTONOMOUS_TASK_ID_MAX_LEN: usize = 20;
pub const AUTONOMOUS_TASK_NAME_MAX_LEN: usize = 50;
pub const AUTONOMOUS_TASK_DESCRIPTION_MAX_LEN: usize = 200;
pub const AUTONOMOUS_TASK_PROMPT_MAX_LEN: usize = 20_000;
pub const CHAT_THREAD_SUMMARY_MAX_LEN: usize = 500;

// ── Autonomous tasks (§3, §8) ───────────────────────────────────────────────
// Minimum interval between fires of an interval-triggered autonomous task.
// Config validation rejects anything below this.
pub const MIN_AUTONOMOUS_TASK_INTERVAL_MINUTES: u32 = 5;

// ── Fee splits ───────────────────────────────────────────────────────────
// Sum of an agent's percentage-split fees (platform + dev + agent) must not
// exceed this, expressed as a fraction of gross.
pub const MAX_FEE_FRACTION: f64 = 1.0;

// ── Execution Engine (§4.6) ─────────────────────────────────────────────────
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 20;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;
/// Cold-start cost is charged once per chat thread per this window, then
/// amortized (free) for the rest of the window. Resolved Open Question: 1 hour.
pub const COLD_START_WINDOW_SECS: i64 = 3600;

// ── Scheduler / Heartbeat Fabric (§4.7, SPEC_FULL §1.B) ────────────────────
pub const SCHEDULER_HEARTBEAT_INTERVAL_SECS: i64 = 60;
pub const CHECKER_HEARTBEAT_INTERVAL_SECS: i64 = 300;
/// TTL on heartbeat keys: long enough to tolerate one missed beat plus jitter.
pub const HEARTBEAT_TTL_SECS: i64 = 16 * 60;
/// Grace window within which a missed scheduled fire is still coalesced into
/// one execution; beyond this it is dropped with a warning.
pub const MISSED_FIRE_GRACE_WINDOW_SECS: i64 = 5 * 60;

pub const REFILL_FREE_CREDITS_INTERVAL_SECS: i64 = 3600;
pub const REFRESH_EXPIRING_CREDENTIALS_INTERVAL_SECS: i64 = 300;
pub const UPDATE_SKILL_PRICE_CACHE_INTERVAL_SECS: i64 = 3600;

// ── Consistency Checker (§4.8) ───────────────────────────────────────────────
/// Fast band: every two hours, at :30 past the hour, sampling recent rows.
pub const FAST_AUDIT_INTERVAL_SECS: i64 = 2 * 3600;
pub const FAST_AUDIT_MINUTE_OFFSET: u32 = 30;
/// Slow band: twice daily (00:00 and 12:00 UTC), full scan.
pub const SLOW_AUDIT_INTERVAL_SECS: i64 = 12 * 3600;
/// Row batch size for the fast/sampled audit band.
pub const FAST_AUDIT_SAMPLE_SIZE: usize = 500;
/// Page size for cursor-based pagination during full scans.
pub const SLOW_AUDIT_PAGE_SIZE: usize = 1000;

// ── Quotas & Rate Limits (§4.9) ──────────────────────────────────────────────
pub const DEFAULT_DAILY_MESSAGE_QUOTA: u64 = 1000;
pub const DEFAULT_MONTHLY_MESSAGE_QUOTA: u64 = 20_000;
pub const QUOTA_WINDOW_DAILY: &str = "msg_today";
pub const QUOTA_WINDOW_MONTHLY: &str = "msg_month";
pub const QUOTA_DAILY_TTL_SECS: u64 = 86_400;
pub const QUOTA_MONTHLY_TTL_SECS: u64 = 31 * 86_400;

/// KV key for a per-agent message counter (§4.9) — shared by the engine's
/// increment-and-check and the scheduler's window-boundary reset so the two
/// never drift onto different key shapes.
pub fn quota_key(agent_id: &str, window: &str) -> String {
    format!("quota:{agent_id}:{window}")
}

// ── Memory Policy (§4.5) ─────────────────────────────────────────────────────
/// Approximate characters per token for the monotonic token estimator.
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;
pub const DEFAULT_SUMMARIZE_KEEP_RECENT: usize = 6;
pub const DEFAULT_SUMMARIZE_MAX_SUMMARY_TOKENS: usize = 2000;
