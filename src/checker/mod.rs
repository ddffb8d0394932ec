// ── Consistency Checker (§4.8) ────────────────────────────────────────────
// An independent, read-mostly auditor. Fast band samples a handful of
// accounts' balances often; slow band walks every account, plus the whole
// transaction table's cross-account invariants, less often. It never
// repairs anything itself — `rebuild_from_transactions(apply: true)` is an
// admin operation, not something a background auditor should do
// unattended — it only reports.
//
// Six invariants total (§4.3): one per-account ((a), in `check_account`)
// and five ledger-wide ones folded into a single full scan in
// `check_ledger_wide_invariants` — per-event credit=debit balance, orphan
// transactions, orphan events, a net-zero check across every two-sided
// event, and the global credit/debit/external-inflow conservation law.

use crate::atoms::decimal::Amount;
use crate::atoms::types::{CheckResult, CreditDebit, TransactionType};
use crate::ledger::Ledger;
use crate::scheduler::JobHandler;
use crate::store::{AccountRepo, EventRepo, KvStore, SqliteStore, TransactionRepo};
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::alerts::{AlertSink, ErrorReporter};
use crate::atoms::error::PlatformResult;

const CHECKER_HEARTBEAT_KEY: &str = "checker_heartbeat";

/// Transaction types with no debit counterpart anywhere in the ledger —
/// money entering the system rather than moving within it (§4.3 (f)).
const EXTERNAL_INFLOW_TX_TYPES: &[TransactionType] =
    &[TransactionType::Recharge, TransactionType::Reward, TransactionType::Refill, TransactionType::RechargeBonus, TransactionType::EventReward];

pub struct ConsistencyChecker {
    store: Arc<SqliteStore>,
    ledger: Arc<Ledger>,
    alerts: Arc<dyn AlertSink>,
    kv: Arc<dyn KvStore>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<SqliteStore>, ledger: Arc<Ledger>, alerts: Arc<dyn AlertSink>, kv: Arc<dyn KvStore>, error_reporter: Arc<dyn ErrorReporter>) -> Self {
        ConsistencyChecker { store, ledger, alerts, kv, error_reporter }
    }

    pub fn beat(&self) {
        self.kv.set_volatile(CHECKER_HEARTBEAT_KEY, "1", Duration::from_secs(crate::atoms::constants::HEARTBEAT_TTL_SECS as u64));
    }

    /// Heartbeat loop until `shutdown` is signalled, clearing this
    /// replica's heartbeat key on the way out (§1.B) rather than letting it
    /// linger until the TTL expires. The audit bands themselves run as
    /// scheduled jobs (`FastAuditJob`/`SlowAuditJob`) via the scheduler's own
    /// loop; this loop only keeps the checker's liveness marker current.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PlatformResult<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(crate::atoms::constants::CHECKER_HEARTBEAT_INTERVAL_SECS as u64));
        loop {
            tokio::select! {
                _ = interval.tick() => self.beat(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.kv.delete(CHECKER_HEARTBEAT_KEY);
        info!("[checker] heartbeat loop shut down, heartbeat cleared");
        Ok(())
    }

    /// Checks `sample_size` accounts, starting from the top of id order.
    /// Good enough for a frequent spot-check; the slow band covers what
    /// this one skips.
    pub fn run_fast_audit(&self, sample_size: usize) -> PlatformResult<Vec<CheckResult>> {
        let ids = self.store.with_txn(|txn| AccountRepo::page_ids(txn, None, sample_size))?;
        let results = ids.iter().map(|id| self.check_account(id)).collect::<PlatformResult<Vec<_>>>()?;
        self.alerts.send_check_summary("fast", &results);
        Ok(results)
    }

    /// Walks every account in cursor-paginated pages, never loading the
    /// whole account table into memory at once, then runs the five
    /// ledger-wide invariants over the full transaction table (§4.8, §4.3
    /// (b)-(f)).
    pub fn run_slow_audit(&self, page_size: usize) -> PlatformResult<Vec<CheckResult>> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let ids = self.store.with_txn(|txn| AccountRepo::page_ids(txn, cursor.as_deref(), page_size))?;
            if ids.is_empty() {
                break;
            }
            let full_page = ids.len() == page_size;
            for id in &ids {
                results.push(self.check_account(id)?);
            }
            cursor = ids.last().cloned();
            if !full_page {
                break;
            }
        }
        results.extend(self.check_ledger_wide_invariants(page_size)?);
        self.alerts.send_check_summary("slow", &results);
        Ok(results)
    }

    fn check_account(&self, account_id: &str) -> PlatformResult<CheckResult> {
        let report = self.ledger.rebuild_from_transactions(account_id, false)?;
        let computed_total = report.computed.total();
        let stored_total = report.stored.total();
        let difference = if report.matches {
            None
        } else if computed_total >= stored_total {
            Some(computed_total - stored_total)
        } else {
            Some(stored_total - computed_total)
        };
        if !report.matches {
            self.error_reporter.report(&crate::atoms::error::PlatformError::LedgerInconsistency(format!(
                "account {account_id}: computed {computed_total} stored {stored_total}"
            )));
        }
        Ok(CheckResult {
            check_type: "account_total_balance".to_string(),
            status: report.matches,
            details: format!("account {account_id}: computed {computed_total} stored {stored_total}"),
            difference,
            ts: Utc::now().to_rfc3339(),
        })
    }

    /// Single full scan of `credit_transactions`, cursor-paginated, folding
    /// in every ledger-wide invariant so the whole table is only read once
    /// per slow-band pass (§4.3 (b)-(f)):
    ///   (b) per-event credit total == debit total, for two-sided events
    ///   (c) no transaction references a nonexistent event (orphan tx)
    ///   (d) no event was written with zero transactions (orphan event)
    ///   (e) the sum of (credit - debit) across every two-sided event nets to zero
    ///   (f) total credits == total debits + total external-inflow credits
    fn check_ledger_wide_invariants(&self, page_size: usize) -> PlatformResult<Vec<CheckResult>> {
        let event_ids: HashSet<String> = self.store.with_txn(|txn| EventRepo::all_ids(txn))?.into_iter().collect();

        let mut per_event: HashMap<String, (Amount, Amount)> = HashMap::new();
        let mut referenced_events: HashSet<String> = HashSet::new();
        let mut orphan_tx_ids = Vec::new();
        let mut total_credit = Amount::ZERO;
        let mut total_debit = Amount::ZERO;
        let mut external_inflow = Amount::ZERO;

        let mut cursor: Option<String> = None;
        loop {
            let page = self.store.with_txn(|txn| TransactionRepo::page_all(txn, cursor.as_deref(), page_size))?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() == page_size;
            for tx in &page {
                referenced_events.insert(tx.event_id.clone());
                if !event_ids.contains(&tx.event_id) {
                    orphan_tx_ids.push(tx.id.clone());
                }
                let entry = per_event.entry(tx.event_id.clone()).or_insert((Amount::ZERO, Amount::ZERO));
                match tx.credit_debit {
                    CreditDebit::Credit => {
                        entry.0 = entry.0 + tx.change_amount;
                        total_credit = total_credit + tx.change_amount;
                        if EXTERNAL_INFLOW_TX_TYPES.contains(&tx.tx_type) {
                            external_inflow = external_inflow + tx.change_amount;
                        }
                    }
                    CreditDebit::Debit => {
                        entry.1 = entry.1 + tx.change_amount;
                        total_debit = total_debit + tx.change_amount;
                    }
                }
            }
            cursor = page.last().map(|t| t.id.clone());
            if !full_page {
                break;
            }
        }

        let now = Utc::now().to_rfc3339();
        let mut results = Vec::new();

        let orphan_events: Vec<&String> = event_ids.difference(&referenced_events).collect();

        let mut imbalanced = Vec::new();
        let mut net_two_sided = Amount::ZERO;
        for (event_id, (credit, debit)) in &per_event {
            if debit.is_zero() {
                continue; // single-sided credit event (recharge/reward/refill): no debit counterpart by design
            }
            net_two_sided = net_two_sided + (*credit - *debit);
            if *credit != *debit {
                imbalanced.push(event_id.clone());
            }
        }

        results.push(CheckResult {
            check_type: "event_credit_debit_balance".to_string(),
            status: imbalanced.is_empty(),
            details: if imbalanced.is_empty() { "all two-sided events balance".to_string() } else { format!("{} events imbalanced: {:?}", imbalanced.len(), imbalanced) },
            difference: None,
            ts: now.clone(),
        });

        results.push(CheckResult {
            check_type: "orphan_transactions".to_string(),
            status: orphan_tx_ids.is_empty(),
            details: if orphan_tx_ids.is_empty() { "no orphan transactions".to_string() } else { format!("{} transactions reference a missing event: {:?}", orphan_tx_ids.len(), orphan_tx_ids) },
            difference: None,
            ts: now.clone(),
        });

        results.push(CheckResult {
            check_type: "orphan_events".to_string(),
            status: orphan_events.is_empty(),
            details: if orphan_events.is_empty() { "no orphan events".to_string() } else { format!("{} events have zero transactions: {:?}", orphan_events.len(), orphan_events) },
            difference: None,
            ts: now.clone(),
        });

        results.push(CheckResult {
            check_type: "global_zero_sum".to_string(),
            status: net_two_sided.is_zero(),
            details: format!("net credit-minus-debit across two-sided events: {net_two_sided}"),
            difference: if net_two_sided.is_zero() { None } else { Some(net_two_sided) },
            ts: now.clone(),
        });

        let expected_credit = total_debit + external_inflow;
        let conserves = total_credit == expected_credit;
        results.push(CheckResult {
            check_type: "global_credit_debit_totals".to_string(),
            status: conserves,
            details: format!("total credit {total_credit} vs total debit {total_debit} + external inflow {external_inflow}"),
            difference: if conserves { None } else { Some(if total_credit > expected_credit { total_credit - expected_credit } else { expected_credit - total_credit }) },
            ts: now,
        });

        for r in &results {
            if !r.status {
                self.error_reporter.report(&crate::atoms::error::PlatformError::LedgerInconsistency(format!("{}: {}", r.check_type, r.details)));
            }
        }

        Ok(results)
    }
}

/// Scheduler job wrapper so the fast band can be wired onto the same
/// cron/interval/lock machinery the built-in ledger jobs use.
pub struct FastAuditJob {
    pub checker: Arc<ConsistencyChecker>,
    pub sample_size: usize,
}

#[async_trait]
impl JobHandler for FastAuditJob {
    async fn run(&self) -> PlatformResult<()> {
        let results = self.checker.run_fast_audit(self.sample_size)?;
        self.checker.beat();
        info!("[checker] fast audit checked {} accounts", results.len());
        Ok(())
    }
}

pub struct SlowAuditJob {
    pub checker: Arc<ConsistencyChecker>,
    pub page_size: usize,
}

#[async_trait]
impl JobHandler for SlowAuditJob {
    async fn run(&self) -> PlatformResult<()> {
        let results = self.checker.run_slow_audit(self.page_size)?;
        self.checker.beat();
        info!("[checker] slow audit checked {} accounts", results.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogErrorReporter;
    use crate::atoms::decimal::Amount;
    use crate::atoms::types::OwnerType;
    use crate::ledger::Ledger;
    use crate::store::{AccountRepo, MemoryKvStore};
    use std::str::FromStr;

    struct CapturingAlertSink {
        severities: std::sync::Mutex<Vec<crate::alerts::AlertSeverity>>,
    }

    impl AlertSink for CapturingAlertSink {
        fn send(&self, severity: crate::alerts::AlertSeverity, _summary: &str, _body: &str) {
            self.severities.lock().unwrap().push(severity);
        }
    }

    fn setup() -> (Arc<SqliteStore>, Arc<Ledger>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Arc::new(Ledger::new(store.clone()));
        (store, ledger)
    }

    #[test]
    fn fast_audit_passes_for_an_untouched_fresh_account() {
        let (store, ledger) = setup();
        store.with_txn(|txn| AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        let alerts = Arc::new(CapturingAlertSink { severities: std::sync::Mutex::new(vec![]) });
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let checker = ConsistencyChecker::new(store, ledger, alerts.clone(), kv, Arc::new(LogErrorReporter));

        let results = checker.run_fast_audit(10).unwrap();
        assert!(results.iter().all(|r| r.status));
        assert_eq!(*alerts.severities.lock().unwrap(), vec![crate::alerts::AlertSeverity::Info]);
    }

    #[test]
    fn corrupted_account_is_flagged_with_a_nonzero_difference() {
        let (store, ledger) = setup();
        store
            .with_txn(|txn| {
                let mut acct = AccountRepo::get_or_create(txn, "user-1", OwnerType::User)?;
                acct.credits = Amount::from_str("5.0000").unwrap();
                AccountRepo::save(txn, &acct)
            })
            .unwrap();
        let alerts = Arc::new(CapturingAlertSink { severities: std::sync::Mutex::new(vec![]) });
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let checker = ConsistencyChecker::new(store, ledger, alerts.clone(), kv, Arc::new(LogErrorReporter));

        let results = checker.run_fast_audit(10).unwrap();
        let finding = results.iter().find(|r| r.check_type == "account_total_balance").unwrap();
        assert!(!finding.status);
        assert_eq!(finding.difference, Some(Amount::from_str("5.0000").unwrap()));
        assert_eq!(*alerts.severities.lock().unwrap(), vec![crate::alerts::AlertSeverity::Critical]);
    }

    #[tokio::test]
    async fn fast_audit_job_runs_and_beats_the_checker_heartbeat() {
        let (store, ledger) = setup();
        store.with_txn(|txn| AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        let alerts = Arc::new(CapturingAlertSink { severities: std::sync::Mutex::new(vec![]) });
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let checker = Arc::new(ConsistencyChecker::new(store, ledger, alerts, kv.clone(), Arc::new(LogErrorReporter)));

        let job = FastAuditJob { checker: checker.clone(), sample_size: 10 };
        job.run().await.unwrap();

        assert!(kv.get(CHECKER_HEARTBEAT_KEY).is_some());
    }

    #[test]
    fn slow_audit_passes_ledger_wide_invariants_on_a_clean_ledger() {
        let (store, ledger) = setup();
        ledger.recharge("user-1", OwnerType::User, Amount::from_str("5.0000").unwrap(), crate::atoms::types::CreditClass::Permanent, None).unwrap();
        let agent = crate::atoms::types::Agent {
            id: "agent-1".into(),
            owner_id: "dev-1".into(),
            display_name: "a".into(),
            model: "m".into(),
            temperature: 0.5,
            memory_strategy: crate::atoms::types::MemoryStrategy::Trim,
            token_budget: 1000,
            skills: Default::default(),
            autonomous_tasks: vec![],
            fee_split: crate::atoms::types::FeeSplit { platform: 0.1, dev: 0.0, agent: 0.0 },
            system_prompt: String::new(),
            deleted: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        store.with_txn(|txn| crate::store::AgentRepo::insert(txn, &agent)).unwrap();
        ledger.debit_for_skill("user-1", OwnerType::User, &agent, "search", None, Amount::from_str("1.0000").unwrap(), None).unwrap();

        let alerts = Arc::new(CapturingAlertSink { severities: std::sync::Mutex::new(vec![]) });
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let checker = ConsistencyChecker::new(store, ledger, alerts, kv, Arc::new(LogErrorReporter));

        let results = checker.run_slow_audit(100).unwrap();
        for check_type in ["event_credit_debit_balance", "orphan_transactions", "orphan_events", "global_zero_sum", "global_credit_debit_totals"] {
            let finding = results.iter().find(|r| r.check_type == check_type).unwrap_or_else(|| panic!("missing {check_type}"));
            assert!(finding.status, "{check_type} failed: {}", finding.details);
        }
    }

    #[test]
    fn orphan_transaction_is_flagged_by_the_ledger_wide_sweep() {
        let (store, ledger) = setup();
        ledger.recharge("user-1", OwnerType::User, Amount::from_str("5.0000").unwrap(), crate::atoms::types::CreditClass::Permanent, None).unwrap();
        store
            .with_txn(|txn| {
                let account = AccountRepo::get_or_create(txn, "user-1", OwnerType::User)?;
                crate::store::TransactionRepo::insert(
                    txn,
                    &crate::atoms::types::CreditTransaction {
                        id: crate::atoms::ids::new_sortable_id(),
                        event_id: "nonexistent-event".into(),
                        account_id: account.id,
                        tx_type: crate::atoms::types::TransactionType::Adjustment,
                        credit_debit: crate::atoms::types::CreditDebit::Credit,
                        change_amount: Amount::from_str("1.0000").unwrap(),
                        free_amount: Amount::ZERO,
                        reward_amount: Amount::ZERO,
                        permanent_amount: Amount::from_str("1.0000").unwrap(),
                        credit_type: crate::atoms::types::CreditClassTag::Permanent,
                        created_at: String::new(),
                    },
                )
            })
            .unwrap();

        let alerts = Arc::new(CapturingAlertSink { severities: std::sync::Mutex::new(vec![]) });
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let checker = ConsistencyChecker::new(store, ledger, alerts, kv, Arc::new(LogErrorReporter));

        let results = checker.run_slow_audit(100).unwrap();
        let finding = results.iter().find(|r| r.check_type == "orphan_transactions").unwrap();
        assert!(!finding.status);
    }
}
