// ── Atoms Layer ────────────────────────────────────────────────────────────
// Pure constants, error types, IDs, and decimal math — zero side effects, no I/O.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from store/, ledger/, engine/, scheduler/, checker/.

pub mod constants;
pub mod decimal;
pub mod error;
pub mod ids;
pub mod types;
