// ── Credit Ledger (§4.3) ─────────────────────────────────────────────────
// The hardest subsystem: double-entry bookkeeping across three credit
// classes (free, reward, permanent), with proportional fee-bucket splits
// that must reconcile to the gross amount at 4-decimal precision. Every
// public operation is one `SqliteStore::with_txn` call — the whole
// read-modify-write commits atomically or not at all, which is what makes
// "row lock" in the prose above mean something concrete here.

use crate::atoms::decimal::{Amount, ClassSplit};
use crate::atoms::error::{PlatformError, PlatformResult};
use crate::atoms::ids::new_sortable_id;
use crate::atoms::types::*;
use crate::store::{AccountRepo, EventRepo, SqliteStore, TransactionRepo};
use chrono::Utc;
use log::{info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Owner id for the platform's own fee-revenue account. A singleton row,
/// created lazily the first time a fee is collected.
pub const PLATFORM_OWNER_ID: &str = "platform";

pub struct Ledger {
    store: Arc<SqliteStore>,
}

pub struct RebuildReport {
    pub account_id: String,
    pub computed: ClassSplit,
    pub stored: ClassSplit,
    pub matches: bool,
}

impl Ledger {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Ledger { store }
    }

    /// Charge `gross` against `payer`, splitting into a base-cost credit to
    /// the agent and up to three fee credits, per the §4.3 decomposition
    /// algorithm. `idempotency_key`, when supplied, makes repeat calls with
    /// the same key return the original event instead of double-charging.
    pub fn debit_for_skill(
        &self,
        payer_owner_id: &str,
        payer_owner_type: OwnerType,
        agent: &Agent,
        skill_name: &str,
        chat_id: Option<&str>,
        gross: Amount,
        idempotency_key: Option<String>,
    ) -> PlatformResult<CreditEvent> {
        self.store.with_txn(|txn| {
            if let Some(key) = &idempotency_key {
                if let Some(existing) = EventRepo::find_by_idempotency_key(txn, key)? {
                    return Ok(existing);
                }
            }

            let mut payer = AccountRepo::get_or_create(txn, payer_owner_id, payer_owner_type)?;
            let draw = ClassSplit::draw_by_priority(gross, payer.free_credits, payer.reward_credits, payer.credits)
                .ok_or_else(|| PlatformError::InsufficientCredits {
                    required: gross.to_string(),
                    available: (payer.free_credits + payer.reward_credits + payer.credits).to_string(),
                })?;

            let fee_platform = gross.scale_by(Decimal::try_from(agent.fee_split.platform).unwrap_or_default());
            let fee_dev = gross.scale_by(Decimal::try_from(agent.fee_split.dev).unwrap_or_default());
            let fee_agent = gross.scale_by(Decimal::try_from(agent.fee_split.agent).unwrap_or_default());

            let plat_split = split_fee_bucket(fee_platform, gross, draw);
            let dev_split = split_fee_bucket(fee_dev, gross, draw);
            let agent_split = split_fee_bucket(fee_agent, gross, draw);

            let base_free = draw.free - plat_split.free - dev_split.free - agent_split.free;
            let base_reward = draw.reward - plat_split.reward - dev_split.reward - agent_split.reward;
            let base_permanent = draw.permanent - plat_split.permanent - dev_split.permanent - agent_split.permanent;
            let base_amount = gross - fee_platform - fee_dev - fee_agent;

            let event = CreditEvent {
                id: new_sortable_id(),
                event_type: CreditEventType::Pay,
                user_id: (payer_owner_type == OwnerType::User).then(|| payer_owner_id.to_string()),
                agent_id: Some(agent.id.clone()),
                chat_id: chat_id.map(str::to_string),
                skill_name: Some(skill_name.to_string()),
                free_amount: draw.free,
                reward_amount: draw.reward,
                permanent_amount: draw.permanent,
                total_amount: gross,
                base_free,
                base_reward,
                base_permanent,
                base_amount,
                fee_platform_free: plat_split.free,
                fee_platform_reward: plat_split.reward,
                fee_platform_permanent: plat_split.permanent,
                fee_platform_amount: fee_platform,
                fee_dev_free: dev_split.free,
                fee_dev_reward: dev_split.reward,
                fee_dev_permanent: dev_split.permanent,
                fee_dev_amount: fee_dev,
                fee_agent_free: agent_split.free,
                fee_agent_reward: agent_split.reward,
                fee_agent_permanent: agent_split.permanent,
                fee_agent_amount: fee_agent,
                idempotency_key: idempotency_key.clone(),
                created_at: String::new(),
            };
            EventRepo::insert(txn, &event)?;

            apply_debit(&mut payer, draw.free, draw.reward, draw.permanent);
            AccountRepo::save(txn, &payer)?;
            insert_tx(txn, &event.id, &payer.id, TransactionType::Pay, CreditDebit::Debit, draw)?;

            credit_account(txn, &event.id, &agent.id, OwnerType::Agent, TransactionType::ReceiveBasePay, ClassSplit { free: base_free, reward: base_reward, permanent: base_permanent })?;

            if !plat_split.total().is_zero() {
                credit_account(txn, &event.id, PLATFORM_OWNER_ID, OwnerType::Platform, TransactionType::ReceiveFeePlatform, plat_split)?;
            }
            if !dev_split.total().is_zero() {
                credit_account(txn, &event.id, &agent.owner_id, OwnerType::Developer, TransactionType::ReceiveFeeDev, dev_split)?;
            }
            if !agent_split.total().is_zero() {
                credit_account(txn, &event.id, &agent.id, OwnerType::Agent, TransactionType::ReceiveFeeAgent, agent_split)?;
            }

            EventRepo::get(txn, &event.id)
        })
    }

    /// Reverse every transaction of `event_id`. Idempotent via a derived
    /// `refund:{event_id}` key — a second call returns the first call's
    /// refund event without writing anything new.
    pub fn refund(&self, event_id: &str, _reason: &str) -> PlatformResult<CreditEvent> {
        self.store.with_txn(|txn| {
            let refund_key = format!("refund:{event_id}");
            if let Some(existing) = EventRepo::find_by_idempotency_key(txn, &refund_key)? {
                return Ok(existing);
            }

            let original = EventRepo::get(txn, event_id)?;
            let original_txs = TransactionRepo::list_by_event(txn, event_id)?;
            if original_txs.is_empty() {
                return Err(PlatformError::invalid(format!("event {event_id} has no transactions to refund")));
            }

            let refund_event = CreditEvent {
                id: new_sortable_id(),
                event_type: CreditEventType::Refund,
                idempotency_key: Some(refund_key),
                created_at: String::new(),
                ..original
            };
            EventRepo::insert(txn, &refund_event)?;

            for original_tx in &original_txs {
                let mut account = AccountRepo::get(txn, &original_tx.account_id)?;
                reverse_account_effect(&mut account, original_tx);
                AccountRepo::save(txn, &account)?;

                let reversed_debit = match original_tx.credit_debit {
                    CreditDebit::Debit => CreditDebit::Credit,
                    CreditDebit::Credit => CreditDebit::Debit,
                };
                TransactionRepo::insert(
                    txn,
                    &CreditTransaction {
                        id: new_sortable_id(),
                        event_id: refund_event.id.clone(),
                        account_id: original_tx.account_id.clone(),
                        tx_type: TransactionType::Refund,
                        credit_debit: reversed_debit,
                        change_amount: original_tx.change_amount,
                        free_amount: original_tx.free_amount,
                        reward_amount: original_tx.reward_amount,
                        permanent_amount: original_tx.permanent_amount,
                        credit_type: original_tx.credit_type,
                        created_at: String::new(),
                    },
                )?;
            }

            EventRepo::get(txn, &refund_event.id)
        })
    }

    /// Top up `owner`'s balance in a single credit class (§4.3 `recharge`).
    pub fn recharge(&self, owner_id: &str, owner_type: OwnerType, amount: Amount, class: CreditClass, idempotency_key: Option<String>) -> PlatformResult<CreditEvent> {
        self.single_sided_credit(owner_id, owner_type, amount, class, CreditEventType::Recharge, TransactionType::Recharge, idempotency_key)
    }

    /// Grant promotional reward credits (§4.3 `reward`). Always lands in
    /// the reward class — rewards never become permanent or free credits.
    pub fn reward(&self, owner_id: &str, owner_type: OwnerType, amount: Amount, idempotency_key: Option<String>) -> PlatformResult<CreditEvent> {
        self.single_sided_credit(owner_id, owner_type, amount, CreditClass::Reward, CreditEventType::Reward, TransactionType::Reward, idempotency_key)
    }

    fn single_sided_credit(
        &self,
        owner_id: &str,
        owner_type: OwnerType,
        amount: Amount,
        class: CreditClass,
        event_type: CreditEventType,
        tx_type: TransactionType,
        idempotency_key: Option<String>,
    ) -> PlatformResult<CreditEvent> {
        self.store.with_txn(|txn| {
            if let Some(key) = &idempotency_key {
                if let Some(existing) = EventRepo::find_by_idempotency_key(txn, key)? {
                    return Ok(existing);
                }
            }

            let split = class_split(class, amount);
            let event = CreditEvent {
                id: new_sortable_id(),
                event_type,
                user_id: (owner_type == OwnerType::User).then(|| owner_id.to_string()),
                agent_id: (owner_type == OwnerType::Agent).then(|| owner_id.to_string()),
                chat_id: None,
                skill_name: None,
                free_amount: split.free,
                reward_amount: split.reward,
                permanent_amount: split.permanent,
                total_amount: amount,
                base_free: split.free,
                base_reward: split.reward,
                base_permanent: split.permanent,
                base_amount: amount,
                fee_platform_free: Amount::ZERO,
                fee_platform_reward: Amount::ZERO,
                fee_platform_permanent: Amount::ZERO,
                fee_platform_amount: Amount::ZERO,
                fee_dev_free: Amount::ZERO,
                fee_dev_reward: Amount::ZERO,
                fee_dev_permanent: Amount::ZERO,
                fee_dev_amount: Amount::ZERO,
                fee_agent_free: Amount::ZERO,
                fee_agent_reward: Amount::ZERO,
                fee_agent_permanent: Amount::ZERO,
                fee_agent_amount: Amount::ZERO,
                idempotency_key,
                created_at: String::new(),
            };
            EventRepo::insert(txn, &event)?;
            credit_account(txn, &event.id, owner_id, owner_type, tx_type, split)?;
            EventRepo::get(txn, &event.id)
        })
    }

    /// For every user account below `ceiling`, top up free credits to
    /// `ceiling`. Idempotent within the current UTC hour — a second call
    /// in the same hour is a no-op for accounts already refilled.
    pub fn refill_free_credits(&self, ceiling: Amount) -> PlatformResult<Vec<CreditEvent>> {
        let account_ids = self.store.with_txn(|txn| AccountRepo::all_ids(txn))?;
        let hour_bucket = Utc::now().format("%Y%m%d%H").to_string();

        let mut events = Vec::new();
        for account_id in account_ids {
            let event = self.store.with_txn(|txn| -> PlatformResult<Option<CreditEvent>> {
                let account = AccountRepo::get(txn, &account_id)?;
                if account.owner_type != OwnerType::User || account.free_credits >= ceiling {
                    return Ok(None);
                }
                let key = format!("refill:{account_id}:{hour_bucket}");
                if EventRepo::find_by_idempotency_key(txn, &key)?.is_some() {
                    return Ok(None);
                }

                let top_up = ceiling - account.free_credits;
                let event = CreditEvent {
                    id: new_sortable_id(),
                    event_type: CreditEventType::Refill,
                    user_id: Some(account.owner_id.clone()),
                    agent_id: None,
                    chat_id: None,
                    skill_name: None,
                    free_amount: top_up,
                    reward_amount: Amount::ZERO,
                    permanent_amount: Amount::ZERO,
                    total_amount: top_up,
                    base_free: top_up,
                    base_reward: Amount::ZERO,
                    base_permanent: Amount::ZERO,
                    base_amount: top_up,
                    fee_platform_free: Amount::ZERO,
                    fee_platform_reward: Amount::ZERO,
                    fee_platform_permanent: Amount::ZERO,
                    fee_platform_amount: Amount::ZERO,
                    fee_dev_free: Amount::ZERO,
                    fee_dev_reward: Amount::ZERO,
                    fee_dev_permanent: Amount::ZERO,
                    fee_dev_amount: Amount::ZERO,
                    fee_agent_free: Amount::ZERO,
                    fee_agent_reward: Amount::ZERO,
                    fee_agent_permanent: Amount::ZERO,
                    fee_agent_amount: Amount::ZERO,
                    idempotency_key: Some(key),
                    created_at: String::new(),
                };
                EventRepo::insert(txn, &event)?;
                let mut account = account;
                apply_credit(&mut account, top_up, Amount::ZERO, Amount::ZERO);
                AccountRepo::save(txn, &account)?;
                insert_tx(txn, &event.id, &account.id, TransactionType::Refill, CreditDebit::Credit, ClassSplit { free: top_up, reward: Amount::ZERO, permanent: Amount::ZERO })?;
                Ok(Some(EventRepo::get(txn, &event.id)?))
            })?;
            if let Some(e) = event {
                events.push(e);
            }
        }
        info!("[ledger] refill_free_credits: {} accounts topped up (hour_bucket={hour_bucket})", events.len());
        Ok(events)
    }

    /// Recompute `(free, reward, permanent)` from the full transaction
    /// history and compare to the stored balances. With `apply == true`
    /// the stored balances are overwritten to match. Cursor pagination by
    /// primary key avoids offset drift on a growing table.
    pub fn rebuild_from_transactions(&self, account_id: &str, apply: bool) -> PlatformResult<RebuildReport> {
        self.store.with_txn(|txn| {
            let account = AccountRepo::get(txn, account_id)?;
            let mut computed = ClassSplit::default();
            let mut cursor: Option<String> = None;
            loop {
                let page = TransactionRepo::page_by_account(txn, account_id, cursor.as_deref(), crate::atoms::constants::SLOW_AUDIT_PAGE_SIZE)?;
                if page.is_empty() {
                    break;
                }
                for tx in &page {
                    let sign = match tx.credit_debit {
                        CreditDebit::Credit => 1,
                        CreditDebit::Debit => -1,
                    };
                    computed = ClassSplit {
                        free: computed.free + signed(tx.free_amount, sign),
                        reward: computed.reward + signed(tx.reward_amount, sign),
                        permanent: computed.permanent + signed(tx.permanent_amount, sign),
                    };
                }
                cursor = page.last().map(|t| t.id.clone());
            }

            let stored = ClassSplit { free: account.free_credits, reward: account.reward_credits, permanent: account.credits };
            let matches = computed == stored;
            if !matches {
                warn!("[ledger] rebuild mismatch for account {account_id}: stored={stored:?} computed={computed:?}");
            }
            if apply && !matches {
                let mut account = account;
                account.free_credits = computed.free;
                account.reward_credits = computed.reward;
                account.credits = computed.permanent;
                AccountRepo::save(txn, &account)?;
            }

            Ok(RebuildReport { account_id: account_id.to_string(), computed, stored, matches })
        })
    }
}

fn signed(amount: Amount, sign: i64) -> Amount {
    if sign < 0 {
        Amount::ZERO - amount
    } else {
        amount
    }
}

/// Split `bucket` (a fee share of `gross`) across the three classes in
/// proportion to the payer's per-class draw, remainder absorbed into the
/// permanent bucket (§4.3 step 2).
fn split_fee_bucket(bucket: Amount, gross: Amount, draw: ClassSplit) -> ClassSplit {
    if gross.is_zero() {
        return ClassSplit::default();
    }
    let free = draw.free.proportional_share(bucket, gross);
    let reward = draw.reward.proportional_share(bucket, gross);
    let permanent = bucket - free - reward;
    ClassSplit { free, reward, permanent }
}

fn class_split(class: CreditClass, amount: Amount) -> ClassSplit {
    match class {
        CreditClass::Free => ClassSplit { free: amount, reward: Amount::ZERO, permanent: Amount::ZERO },
        CreditClass::Reward => ClassSplit { free: Amount::ZERO, reward: amount, permanent: Amount::ZERO },
        CreditClass::Permanent => ClassSplit { free: Amount::ZERO, reward: Amount::ZERO, permanent: amount },
    }
}

fn apply_debit(account: &mut CreditAccount, free: Amount, reward: Amount, permanent: Amount) {
    account.free_credits = account.free_credits - free;
    account.reward_credits = account.reward_credits - reward;
    account.credits = account.credits - permanent;
    account.total_expense_free = account.total_expense_free + free;
    account.total_expense_reward = account.total_expense_reward + reward;
    account.total_expense_permanent = account.total_expense_permanent + permanent;
}

fn apply_credit(account: &mut CreditAccount, free: Amount, reward: Amount, permanent: Amount) {
    account.free_credits = account.free_credits + free;
    account.reward_credits = account.reward_credits + reward;
    account.credits = account.credits + permanent;
    account.total_income_free = account.total_income_free + free;
    account.total_income_reward = account.total_income_reward + reward;
    account.total_income_permanent = account.total_income_permanent + permanent;
}

/// Undo exactly the account-side effect of `original_tx` — the inverse of
/// whichever of `apply_debit`/`apply_credit` produced it. This is what
/// makes `recharge(x); refund(that)` restore all eight running totals,
/// not just the net balance.
fn reverse_account_effect(account: &mut CreditAccount, original_tx: &CreditTransaction) {
    match original_tx.credit_debit {
        CreditDebit::Debit => {
            account.free_credits = account.free_credits + original_tx.free_amount;
            account.reward_credits = account.reward_credits + original_tx.reward_amount;
            account.credits = account.credits + original_tx.permanent_amount;
            account.total_expense_free = account.total_expense_free - original_tx.free_amount;
            account.total_expense_reward = account.total_expense_reward - original_tx.reward_amount;
            account.total_expense_permanent = account.total_expense_permanent - original_tx.permanent_amount;
        }
        CreditDebit::Credit => {
            account.free_credits = account.free_credits - original_tx.free_amount;
            account.reward_credits = account.reward_credits - original_tx.reward_amount;
            account.credits = account.credits - original_tx.permanent_amount;
            account.total_income_free = account.total_income_free - original_tx.free_amount;
            account.total_income_reward = account.total_income_reward - original_tx.reward_amount;
            account.total_income_permanent = account.total_income_permanent - original_tx.permanent_amount;
        }
    }
}

fn class_tag(split: ClassSplit) -> CreditClassTag {
    match (split.free.is_zero(), split.reward.is_zero(), split.permanent.is_zero()) {
        (false, true, true) => CreditClassTag::Free,
        (true, false, true) => CreditClassTag::Reward,
        (true, true, false) => CreditClassTag::Permanent,
        _ => CreditClassTag::Mixed,
    }
}

fn insert_tx(txn: &rusqlite::Transaction, event_id: &str, account_id: &str, tx_type: TransactionType, credit_debit: CreditDebit, split: ClassSplit) -> PlatformResult<()> {
    TransactionRepo::insert(
        txn,
        &CreditTransaction {
            id: new_sortable_id(),
            event_id: event_id.to_string(),
            account_id: account_id.to_string(),
            tx_type,
            credit_debit,
            change_amount: split.total(),
            free_amount: split.free,
            reward_amount: split.reward,
            permanent_amount: split.permanent,
            credit_type: class_tag(split),
            created_at: String::new(),
        },
    )
}

fn credit_account(txn: &rusqlite::Transaction, event_id: &str, owner_id: &str, owner_type: OwnerType, tx_type: TransactionType, split: ClassSplit) -> PlatformResult<()> {
    let mut account = AccountRepo::get_or_create(txn, owner_id, owner_type)?;
    apply_credit(&mut account, split.free, split.reward, split.permanent);
    AccountRepo::save(txn, &account)?;
    insert_tx(txn, event_id, &account.id, tx_type, CreditDebit::Credit, split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::str::FromStr;

    fn amt(s: &str) -> Amount {
        Amount::from_str(s).unwrap()
    }

    fn seed_agent(ledger: &Ledger, fee_split: FeeSplit) -> Agent {
        let agent = Agent {
            id: new_sortable_id(),
            owner_id: "dev-1".into(),
            display_name: "test-agent".into(),
            model: "claude-test".into(),
            temperature: 0.7,
            memory_strategy: MemoryStrategy::Trim,
            token_budget: 8000,
            skills: Default::default(),
            autonomous_tasks: vec![],
            fee_split,
            system_prompt: String::new(),
            deleted: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        ledger.store.with_txn(|txn| crate::store::AgentRepo::insert(txn, &agent)).unwrap();
        agent
    }

    fn seed_payer_balance(ledger: &Ledger, owner_id: &str, free: Amount, reward: Amount, permanent: Amount) {
        ledger
            .store
            .with_txn(|txn| {
                let mut account = crate::store::AccountRepo::get_or_create(txn, owner_id, OwnerType::User)?;
                account.free_credits = free;
                account.reward_credits = reward;
                account.credits = permanent;
                crate::store::AccountRepo::save(txn, &account)
            })
            .unwrap();
    }

    #[test]
    fn scenario_1_fee_decomposition() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);
        let agent = seed_agent(&ledger, FeeSplit { platform: 0.10, dev: 0.05, agent: 0.0 });
        seed_payer_balance(&ledger, "user-1", amt("1.0000"), amt("2.0000"), amt("10.0000"));

        let event = ledger.debit_for_skill("user-1", OwnerType::User, &agent, "search", None, amt("4.0000"), None).unwrap();

        assert_eq!(event.free_amount, amt("1.0000"));
        assert_eq!(event.reward_amount, amt("2.0000"));
        assert_eq!(event.permanent_amount, amt("1.0000"));
        assert_eq!(event.fee_platform_amount, amt("0.4000"));
        assert_eq!(event.fee_platform_free, amt("0.1000"));
        assert_eq!(event.fee_platform_reward, amt("0.2000"));
        assert_eq!(event.fee_platform_permanent, amt("0.1000"));
        assert_eq!(event.base_amount, amt("3.4000"));

        let payer = ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        assert_eq!(payer.free_credits, amt("0.0000"));
        assert_eq!(payer.reward_credits, amt("0.0000"));
        assert_eq!(payer.credits, amt("9.0000"));
    }

    #[test]
    fn debiting_one_unit_over_balance_fails_and_writes_nothing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);
        let agent = seed_agent(&ledger, FeeSplit { platform: 0.0, dev: 0.0, agent: 0.0 });
        seed_payer_balance(&ledger, "user-1", amt("1.0000"), Amount::ZERO, Amount::ZERO);

        let err = ledger.debit_for_skill("user-1", OwnerType::User, &agent, "search", None, amt("1.0001"), None).unwrap_err();
        assert!(matches!(err, PlatformError::InsufficientCredits { .. }));

        let payer = ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        assert_eq!(payer.free_credits, amt("1.0000"));
    }

    #[test]
    fn debiting_exact_balance_succeeds_and_zeroes_account() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);
        let agent = seed_agent(&ledger, FeeSplit { platform: 0.0, dev: 0.0, agent: 0.0 });
        seed_payer_balance(&ledger, "user-1", amt("1.0000"), Amount::ZERO, Amount::ZERO);

        ledger.debit_for_skill("user-1", OwnerType::User, &agent, "search", None, amt("1.0000"), None).unwrap();
        let payer = ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        assert_eq!(payer.free_credits, amt("0.0000"));
    }

    #[test]
    fn recharge_then_refund_restores_totals_and_balance() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);

        let before = ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        let event = ledger.recharge("user-1", OwnerType::User, amt("5.0000"), CreditClass::Permanent, None).unwrap();
        ledger.refund(&event.id, "test refund").unwrap();

        let after = ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
        assert_eq!(after.credits, before.credits);
        assert_eq!(after.total_income_permanent, before.total_income_permanent);
    }

    #[test]
    fn refund_is_idempotent() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);
        let event = ledger.recharge("user-1", OwnerType::User, amt("5.0000"), CreditClass::Permanent, None).unwrap();

        let r1 = ledger.refund(&event.id, "x").unwrap();
        let r2 = ledger.refund(&event.id, "x").unwrap();
        let r3 = ledger.refund(&event.id, "x").unwrap();
        let r4 = ledger.refund(&event.id, "x").unwrap();
        assert_eq!(r1.id, r2.id);
        assert_eq!(r1.id, r3.id);
        assert_eq!(r1.id, r4.id);

        let txs = ledger.store.with_txn(|txn| TransactionRepo::list_by_event(txn, &r1.id)).unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[test]
    fn refill_free_credits_is_idempotent_within_the_same_hour() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);
        ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();

        let first = ledger.refill_free_credits(amt("10.0000")).unwrap();
        let second = ledger.refill_free_credits(amt("10.0000")).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[test]
    fn rebuild_from_transactions_matches_stored_balance() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store);
        ledger.recharge("user-1", OwnerType::User, amt("3.0000"), CreditClass::Permanent, None).unwrap();
        ledger.recharge("user-1", OwnerType::User, amt("2.0000"), CreditClass::Free, None).unwrap();

        let account_id = ledger.store.with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap().id;
        let report = ledger.rebuild_from_transactions(&account_id, false).unwrap();
        assert!(report.matches);
        assert_eq!(report.computed.permanent, amt("3.0000"));
        assert_eq!(report.computed.free, amt("2.0000"));
    }
}
