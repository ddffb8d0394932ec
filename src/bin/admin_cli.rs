// ── Admin CLI ─────────────────────────────────────────────────────────────
// Thin wrapper around `Ledger` and the consistency checker for operators:
// manual recharges/refunds, a rebuild-and-optionally-fix for one account,
// and one-shot fast/slow audit runs outside the scheduler's own cadence.
// Never talks to the engine or a model provider — credits and consistency
// only.

use agentry_platform::alerts::{alert_sink_from_config, error_reporter_from_config};
use agentry_platform::atoms::constants::{FAST_AUDIT_SAMPLE_SIZE, SLOW_AUDIT_PAGE_SIZE};
use agentry_platform::atoms::decimal::Amount;
use agentry_platform::atoms::error::{PlatformError, PlatformResult};
use agentry_platform::atoms::types::{CreditClass, OwnerType};
use agentry_platform::checker::ConsistencyChecker;
use agentry_platform::config::PlatformConfig;
use agentry_platform::ledger::Ledger;
use agentry_platform::store::{KvStore, MemoryKvStore, SqliteStore};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agentry-admin", about = "Operator tooling for the credit ledger and consistency checker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Credit an account from outside the fee-split flow (e.g. a support refund top-up).
    Recharge {
        owner_id: String,
        #[arg(value_enum)]
        owner_type: OwnerTypeArg,
        amount: String,
        #[arg(value_enum)]
        class: CreditClassArg,
    },
    /// Grant reward credits to an account.
    Reward { owner_id: String, #[arg(value_enum)] owner_type: OwnerTypeArg, amount: String },
    /// Reverse a prior credit event by id.
    Refund { event_id: String, reason: String },
    /// Recompute one account's balance from its transaction history.
    Rebuild {
        account_id: String,
        /// Persist the recomputed balance if it disagrees with the stored one.
        #[arg(long)]
        apply: bool,
    },
    /// Run a one-off fast-band consistency sample.
    AuditFast {
        #[arg(long, default_value_t = FAST_AUDIT_SAMPLE_SIZE)]
        sample_size: usize,
    },
    /// Run a one-off full-table consistency sweep.
    AuditSlow {
        #[arg(long, default_value_t = SLOW_AUDIT_PAGE_SIZE)]
        page_size: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OwnerTypeArg {
    User,
    Agent,
    Platform,
    Developer,
}

impl From<OwnerTypeArg> for OwnerType {
    fn from(v: OwnerTypeArg) -> Self {
        match v {
            OwnerTypeArg::User => OwnerType::User,
            OwnerTypeArg::Agent => OwnerType::Agent,
            OwnerTypeArg::Platform => OwnerType::Platform,
            OwnerTypeArg::Developer => OwnerType::Developer,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CreditClassArg {
    Free,
    Reward,
    Permanent,
}

impl From<CreditClassArg> for CreditClass {
    fn from(v: CreditClassArg) -> Self {
        match v {
            CreditClassArg::Free => CreditClass::Free,
            CreditClassArg::Reward => CreditClass::Reward,
            CreditClassArg::Permanent => CreditClass::Permanent,
        }
    }
}

fn main() -> PlatformResult<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = PlatformConfig::from_env()?;
    let store = Arc::new(SqliteStore::open(&config.database_dsn)?);
    let ledger = Arc::new(Ledger::new(store.clone()));

    match cli.command {
        Command::Recharge { owner_id, owner_type, amount, class } => {
            let amount = Amount::from_str(&amount).map_err(|e| PlatformError::invalid(e.to_string()))?;
            let event = ledger.recharge(&owner_id, owner_type.into(), amount, class.into(), None)?;
            println!("recharged {amount} to {owner_id}: event {}", event.id);
        }
        Command::Reward { owner_id, owner_type, amount } => {
            let amount = Amount::from_str(&amount).map_err(|e| PlatformError::invalid(e.to_string()))?;
            let event = ledger.reward(&owner_id, owner_type.into(), amount, None)?;
            println!("rewarded {amount} to {owner_id}: event {}", event.id);
        }
        Command::Refund { event_id, reason } => {
            let event = ledger.refund(&event_id, &reason)?;
            println!("refunded event {event_id}: reversal event {}", event.id);
        }
        Command::Rebuild { account_id, apply } => {
            let report = ledger.rebuild_from_transactions(&account_id, apply)?;
            if report.matches {
                println!("account {account_id} is consistent: {:?}", report.stored);
            } else {
                println!(
                    "account {account_id} MISMATCH: stored={:?} computed={:?}{}",
                    report.stored,
                    report.computed,
                    if apply { " (applied)" } else { " (not applied, pass --apply to fix)" }
                );
            }
        }
        Command::AuditFast { sample_size } => {
            let (checker, _kv) = build_checker(store, ledger, &config);
            let results = checker.run_fast_audit(sample_size)?;
            print_results(&results);
        }
        Command::AuditSlow { page_size } => {
            let (checker, _kv) = build_checker(store, ledger, &config);
            let results = checker.run_slow_audit(page_size)?;
            print_results(&results);
        }
    }

    Ok(())
}

fn build_checker(store: Arc<SqliteStore>, ledger: Arc<Ledger>, config: &PlatformConfig) -> (ConsistencyChecker, Arc<dyn KvStore>) {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let checker = ConsistencyChecker::new(store, ledger, alert_sink_from_config(config), kv.clone(), error_reporter_from_config(config));
    (checker, kv)
}

fn print_results(results: &[agentry_platform::atoms::types::CheckResult]) {
    let failures = results.iter().filter(|r| !r.status).count();
    for r in results {
        println!("[{}] {} ({})", if r.status { "ok" } else { "FAIL" }, r.check_type, r.details);
    }
    println!("{failures}/{} checks failed", results.len());
}
