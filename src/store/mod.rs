// ── Store adapters (§4.2.A) ──────────────────────────────────────────────
// Two independent interfaces the rest of the platform depends on: a
// relational store for the transactional ledger/agent/chat data, and a KV
// store for counters, locks and heartbeats. Concrete product choice
// (SQLite, Postgres, Redis) is deliberately kept out of the public API —
// everything above this module speaks `SqliteStore`'s repository methods
// or the `KvStore` trait, never raw SQL or Redis commands.

pub mod kv;
pub mod relational;
pub mod schema;

pub use kv::{DurableJobStore, KvStore, MemoryKvStore};
pub use relational::{AccountRepo, AgentRepo, ChatRepo, EventRepo, ScheduledJobRepo, SqliteStore, TransactionRepo};
