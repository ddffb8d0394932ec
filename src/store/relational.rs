// ── Relational store adapter (§4.2) ─────────────────────────────────────
// Backed by SQLite via rusqlite, guarded by a single connection mutex —
// the teacher's `SessionStore` pattern. SQLite has no real row-level
// locking; holding the connection mutex for the duration of a
// read-modify-write is the honest single-writer equivalent of
// `SELECT ... FOR UPDATE`, and is documented as such rather than
// papered over with a fictitious row-lock API.

use crate::atoms::decimal::Amount;
use crate::atoms::error::{PlatformError, PlatformResult};
use crate::atoms::types::*;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> PlatformResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;").ok();
        super::schema::run_migrations(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> PlatformResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        super::schema::run_migrations(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    /// Run `f` inside one exclusive-held connection + SQLite transaction.
    /// This is the "transactional session with row locks" primitive §4.2
    /// requires: the whole read-modify-write commits atomically, and no
    /// other caller observes a partial write (§5's "fee splits sum to
    /// gross" invariant — readers never see partial decompositions).
    pub fn with_txn<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> PlatformResult<T>) -> PlatformResult<T> {
        let mut conn = self.conn.lock();
        let txn = conn.transaction()?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }
}

// ── Credit accounts ───────────────────────────────────────────────────────

pub struct AccountRepo;

impl AccountRepo {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<CreditAccount> {
        let owner_type: String = row.get(2)?;
        Ok(CreditAccount {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            owner_type: parse_owner_type(&owner_type),
            free_credits: row.get::<_, String>(3)?.parse().unwrap_or_default(),
            reward_credits: row.get::<_, String>(4)?.parse().unwrap_or_default(),
            credits: row.get::<_, String>(5)?.parse().unwrap_or_default(),
            total_income_free: row.get::<_, String>(6)?.parse().unwrap_or_default(),
            total_income_reward: row.get::<_, String>(7)?.parse().unwrap_or_default(),
            total_income_permanent: row.get::<_, String>(8)?.parse().unwrap_or_default(),
            total_expense_free: row.get::<_, String>(9)?.parse().unwrap_or_default(),
            total_expense_reward: row.get::<_, String>(10)?.parse().unwrap_or_default(),
            total_expense_permanent: row.get::<_, String>(11)?.parse().unwrap_or_default(),
            updated_at: row.get(12)?,
        })
    }

    const COLUMNS: &'static str = "id, owner_id, owner_type, free_credits, reward_credits, credits, \
        total_income_free, total_income_reward, total_income_permanent, \
        total_expense_free, total_expense_reward, total_expense_permanent, updated_at";

    /// Fetch the account for `(owner_id, owner_type)`, creating a
    /// zero-balance row on first reference (§3 lifecycle: "created on
    /// first debit/credit referencing the owner").
    pub fn get_or_create(txn: &rusqlite::Transaction, owner_id: &str, owner_type: OwnerType) -> PlatformResult<CreditAccount> {
        let ty = owner_type_str(owner_type);
        let existing = txn.query_row(
            &format!("SELECT {} FROM credit_accounts WHERE owner_id = ?1 AND owner_type = ?2", Self::COLUMNS),
            params![owner_id, ty],
            Self::from_row,
        );
        match existing {
            Ok(acct) => Ok(acct),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                let id = crate::atoms::ids::new_sortable_id();
                txn.execute(
                    "INSERT INTO credit_accounts (id, owner_id, owner_type) VALUES (?1, ?2, ?3)",
                    params![id, owner_id, ty],
                )?;
                txn.query_row(
                    &format!("SELECT {} FROM credit_accounts WHERE id = ?1", Self::COLUMNS),
                    params![id],
                    Self::from_row,
                ).map_err(PlatformError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(txn: &rusqlite::Transaction, id: &str) -> PlatformResult<CreditAccount> {
        txn.query_row(
            &format!("SELECT {} FROM credit_accounts WHERE id = ?1", Self::COLUMNS),
            params![id],
            Self::from_row,
        ).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => PlatformError::not_found(format!("credit_account {id}")),
            e => e.into(),
        })
    }

    pub fn save(txn: &rusqlite::Transaction, acct: &CreditAccount) -> PlatformResult<()> {
        txn.execute(
            "UPDATE credit_accounts SET free_credits=?2, reward_credits=?3, credits=?4, \
             total_income_free=?5, total_income_reward=?6, total_income_permanent=?7, \
             total_expense_free=?8, total_expense_reward=?9, total_expense_permanent=?10, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id=?1",
            params![
                acct.id,
                acct.free_credits.to_string(),
                acct.reward_credits.to_string(),
                acct.credits.to_string(),
                acct.total_income_free.to_string(),
                acct.total_income_reward.to_string(),
                acct.total_income_permanent.to_string(),
                acct.total_expense_free.to_string(),
                acct.total_expense_reward.to_string(),
                acct.total_expense_permanent.to_string(),
            ],
        )?;
        Ok(())
    }

    /// List account ids in primary-key order starting after `cursor`
    /// (cursor pagination by primary key, §4.3, to avoid offset drift).
    pub fn page_ids(txn: &rusqlite::Transaction, cursor: Option<&str>, limit: usize) -> PlatformResult<Vec<String>> {
        let mut stmt = txn.prepare(
            "SELECT id FROM credit_accounts WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![cursor.unwrap_or(""), limit as i64], |r| r.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn all_ids(txn: &rusqlite::Transaction) -> PlatformResult<Vec<String>> {
        let mut stmt = txn.prepare("SELECT id FROM credit_accounts ORDER BY id")?;
        let ids = stmt.query_map([], |r| r.get::<_, String>(0))?.filter_map(|r| r.ok()).collect();
        Ok(ids)
    }
}

fn owner_type_str(t: OwnerType) -> &'static str {
    match t {
        OwnerType::User => "user",
        OwnerType::Agent => "agent",
        OwnerType::Platform => "platform",
        OwnerType::Developer => "developer",
    }
}

fn parse_owner_type(s: &str) -> OwnerType {
    match s {
        "agent" => OwnerType::Agent,
        "platform" => OwnerType::Platform,
        "developer" => OwnerType::Developer,
        _ => OwnerType::User,
    }
}

// ── Credit events & transactions ─────────────────────────────────────────

pub struct EventRepo;

impl EventRepo {
    pub fn insert(txn: &rusqlite::Transaction, e: &CreditEvent) -> PlatformResult<()> {
        txn.execute(
            "INSERT INTO credit_events (
                id, event_type, user_id, agent_id, chat_id, skill_name,
                free_amount, reward_amount, permanent_amount, total_amount,
                base_free, base_reward, base_permanent, base_amount,
                fee_platform_free, fee_platform_reward, fee_platform_permanent, fee_platform_amount,
                fee_dev_free, fee_dev_reward, fee_dev_permanent, fee_dev_amount,
                fee_agent_free, fee_agent_reward, fee_agent_permanent, fee_agent_amount,
                idempotency_key
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27)",
            params![
                e.id, event_type_str(e.event_type), e.user_id, e.agent_id, e.chat_id, e.skill_name,
                e.free_amount.to_string(), e.reward_amount.to_string(), e.permanent_amount.to_string(), e.total_amount.to_string(),
                e.base_free.to_string(), e.base_reward.to_string(), e.base_permanent.to_string(), e.base_amount.to_string(),
                e.fee_platform_free.to_string(), e.fee_platform_reward.to_string(), e.fee_platform_permanent.to_string(), e.fee_platform_amount.to_string(),
                e.fee_dev_free.to_string(), e.fee_dev_reward.to_string(), e.fee_dev_permanent.to_string(), e.fee_dev_amount.to_string(),
                e.fee_agent_free.to_string(), e.fee_agent_reward.to_string(), e.fee_agent_permanent.to_string(), e.fee_agent_amount.to_string(),
                e.idempotency_key,
            ],
        )?;
        Ok(())
    }

    pub fn get(txn: &rusqlite::Transaction, id: &str) -> PlatformResult<CreditEvent> {
        txn.query_row("SELECT * FROM credit_events WHERE id = ?1", params![id], Self::from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => PlatformError::not_found(format!("credit_event {id}")),
                e => e.into(),
            })
    }

    /// All event ids, for the checker's orphan-event sweep (§4.3 (c)).
    pub fn all_ids(txn: &rusqlite::Transaction) -> PlatformResult<Vec<String>> {
        let mut stmt = txn.prepare("SELECT id FROM credit_events ORDER BY id")?;
        let ids = stmt.query_map([], |r| r.get::<_, String>(0))?.filter_map(|r| r.ok()).collect();
        Ok(ids)
    }

    pub fn find_by_idempotency_key(txn: &rusqlite::Transaction, key: &str) -> PlatformResult<Option<CreditEvent>> {
        match txn.query_row("SELECT * FROM credit_events WHERE idempotency_key = ?1", params![key], Self::from_row) {
            Ok(e) => Ok(Some(e)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<CreditEvent> {
        let get_amt = |idx: &str| -> Amount {
            row.get::<_, String>(idx).ok().and_then(|s| s.parse().ok()).unwrap_or_default()
        };
        Ok(CreditEvent {
            id: row.get("id")?,
            event_type: parse_event_type(&row.get::<_, String>("event_type")?),
            user_id: row.get("user_id")?,
            agent_id: row.get("agent_id")?,
            chat_id: row.get("chat_id")?,
            skill_name: row.get("skill_name")?,
            free_amount: get_amt("free_amount"),
            reward_amount: get_amt("reward_amount"),
            permanent_amount: get_amt("permanent_amount"),
            total_amount: get_amt("total_amount"),
            base_free: get_amt("base_free"),
            base_reward: get_amt("base_reward"),
            base_permanent: get_amt("base_permanent"),
            base_amount: get_amt("base_amount"),
            fee_platform_free: get_amt("fee_platform_free"),
            fee_platform_reward: get_amt("fee_platform_reward"),
            fee_platform_permanent: get_amt("fee_platform_permanent"),
            fee_platform_amount: get_amt("fee_platform_amount"),
            fee_dev_free: get_amt("fee_dev_free"),
            fee_dev_reward: get_amt("fee_dev_reward"),
            fee_dev_permanent: get_amt("fee_dev_permanent"),
            fee_dev_amount: get_amt("fee_dev_amount"),
            fee_agent_free: get_amt("fee_agent_free"),
            fee_agent_reward: get_amt("fee_agent_reward"),
            fee_agent_permanent: get_amt("fee_agent_permanent"),
            fee_agent_amount: get_amt("fee_agent_amount"),
            idempotency_key: row.get("idempotency_key")?,
            created_at: row.get("created_at")?,
        })
    }
}

fn event_type_str(t: CreditEventType) -> &'static str {
    match t {
        CreditEventType::Pay => "pay",
        CreditEventType::Recharge => "recharge",
        CreditEventType::Refund => "refund",
        CreditEventType::Adjustment => "adjustment",
        CreditEventType::Refill => "refill",
        CreditEventType::Reward => "reward",
        CreditEventType::EventReward => "event_reward",
        CreditEventType::RechargeBonus => "recharge_bonus",
    }
}

fn parse_event_type(s: &str) -> CreditEventType {
    match s {
        "recharge" => CreditEventType::Recharge,
        "refund" => CreditEventType::Refund,
        "adjustment" => CreditEventType::Adjustment,
        "refill" => CreditEventType::Refill,
        "reward" => CreditEventType::Reward,
        "event_reward" => CreditEventType::EventReward,
        "recharge_bonus" => CreditEventType::RechargeBonus,
        _ => CreditEventType::Pay,
    }
}

pub struct TransactionRepo;

impl TransactionRepo {
    pub fn insert(txn: &rusqlite::Transaction, t: &CreditTransaction) -> PlatformResult<()> {
        txn.execute(
            "INSERT INTO credit_transactions (id, event_id, account_id, tx_type, credit_debit, \
             change_amount, free_amount, reward_amount, permanent_amount, credit_type) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                t.id, t.event_id, t.account_id, tx_type_str(t.tx_type), credit_debit_str(t.credit_debit),
                t.change_amount.to_string(), t.free_amount.to_string(), t.reward_amount.to_string(),
                t.permanent_amount.to_string(), credit_type_str(t.credit_type),
            ],
        )?;
        Ok(())
    }

    pub fn list_by_event(txn: &rusqlite::Transaction, event_id: &str) -> PlatformResult<Vec<CreditTransaction>> {
        let mut stmt = txn.prepare("SELECT * FROM credit_transactions WHERE event_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![event_id], Self::from_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    /// Cursor-paginated by primary key (§4.3 rebuild-from-transactions).
    pub fn page_by_account(txn: &rusqlite::Transaction, account_id: &str, cursor: Option<&str>, limit: usize) -> PlatformResult<Vec<CreditTransaction>> {
        let mut stmt = txn.prepare(
            "SELECT * FROM credit_transactions WHERE account_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![account_id, cursor.unwrap_or(""), limit as i64], Self::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn all_event_ids(txn: &rusqlite::Transaction) -> PlatformResult<Vec<String>> {
        let mut stmt = txn.prepare("SELECT DISTINCT event_id FROM credit_transactions")?;
        let ids = stmt.query_map([], |r| r.get::<_, String>(0))?.filter_map(|r| r.ok()).collect();
        Ok(ids)
    }

    /// Cursor-paginated over the whole table regardless of account, for the
    /// checker's slow-band ledger-wide invariants (§4.3 (c)-(f)).
    pub fn page_all(txn: &rusqlite::Transaction, cursor: Option<&str>, limit: usize) -> PlatformResult<Vec<CreditTransaction>> {
        let mut stmt = txn.prepare("SELECT * FROM credit_transactions WHERE id > ?1 ORDER BY id LIMIT ?2")?;
        let rows = stmt.query_map(params![cursor.unwrap_or(""), limit as i64], Self::from_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<CreditTransaction> {
        Ok(CreditTransaction {
            id: row.get("id")?,
            event_id: row.get("event_id")?,
            account_id: row.get("account_id")?,
            tx_type: parse_tx_type(&row.get::<_, String>("tx_type")?),
            credit_debit: if row.get::<_, String>("credit_debit")? == "credit" { CreditDebit::Credit } else { CreditDebit::Debit },
            change_amount: row.get::<_, String>("change_amount")?.parse().unwrap_or_default(),
            free_amount: row.get::<_, String>("free_amount")?.parse().unwrap_or_default(),
            reward_amount: row.get::<_, String>("reward_amount")?.parse().unwrap_or_default(),
            permanent_amount: row.get::<_, String>("permanent_amount")?.parse().unwrap_or_default(),
            credit_type: parse_credit_type(&row.get::<_, String>("credit_type")?),
            created_at: row.get("created_at")?,
        })
    }
}

fn tx_type_str(t: TransactionType) -> &'static str {
    match t {
        TransactionType::Pay => "pay",
        TransactionType::Recharge => "recharge",
        TransactionType::Refund => "refund",
        TransactionType::Adjustment => "adjustment",
        TransactionType::Refill => "refill",
        TransactionType::Reward => "reward",
        TransactionType::EventReward => "event_reward",
        TransactionType::RechargeBonus => "recharge_bonus",
        TransactionType::ReceiveBasePay => "receive_base_pay",
        TransactionType::ReceiveFeePlatform => "receive_fee_platform",
        TransactionType::ReceiveFeeDev => "receive_fee_dev",
        TransactionType::ReceiveFeeAgent => "receive_fee_agent",
    }
}

fn parse_tx_type(s: &str) -> TransactionType {
    match s {
        "recharge" => TransactionType::Recharge,
        "refund" => TransactionType::Refund,
        "adjustment" => TransactionType::Adjustment,
        "refill" => TransactionType::Refill,
        "reward" => TransactionType::Reward,
        "event_reward" => TransactionType::EventReward,
        "recharge_bonus" => TransactionType::RechargeBonus,
        "receive_base_pay" => TransactionType::ReceiveBasePay,
        "receive_fee_platform" => TransactionType::ReceiveFeePlatform,
        "receive_fee_dev" => TransactionType::ReceiveFeeDev,
        "receive_fee_agent" => TransactionType::ReceiveFeeAgent,
        _ => TransactionType::Pay,
    }
}

fn credit_debit_str(c: CreditDebit) -> &'static str {
    match c { CreditDebit::Credit => "credit", CreditDebit::Debit => "debit" }
}

fn credit_type_str(c: CreditClassTag) -> &'static str {
    match c {
        CreditClassTag::Free => "free",
        CreditClassTag::Reward => "reward",
        CreditClassTag::Permanent => "permanent",
        CreditClassTag::Mixed => "mixed",
    }
}

fn parse_credit_type(s: &str) -> CreditClassTag {
    match s {
        "free" => CreditClassTag::Free,
        "reward" => CreditClassTag::Reward,
        "permanent" => CreditClassTag::Permanent,
        _ => CreditClassTag::Mixed,
    }
}

// ── Chat threads & messages ──────────────────────────────────────────────

pub struct ChatRepo;

impl ChatRepo {
    pub fn get_or_create_thread(txn: &rusqlite::Transaction, agent_id: &str, user_id: &str) -> PlatformResult<ChatThread> {
        let existing = txn.query_row(
            "SELECT id, agent_id, user_id, rounds, summary, created_at, updated_at FROM chat_threads WHERE agent_id=?1 AND user_id=?2",
            params![agent_id, user_id],
            Self::thread_from_row,
        );
        match existing {
            Ok(t) => Ok(t),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                let id = crate::atoms::ids::new_sortable_id();
                txn.execute(
                    "INSERT INTO chat_threads (id, agent_id, user_id) VALUES (?1, ?2, ?3)",
                    params![id, agent_id, user_id],
                )?;
                txn.query_row(
                    "SELECT id, agent_id, user_id, rounds, summary, created_at, updated_at FROM chat_threads WHERE id=?1",
                    params![id],
                    Self::thread_from_row,
                ).map_err(PlatformError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_thread(txn: &rusqlite::Transaction, id: &str) -> PlatformResult<ChatThread> {
        txn.query_row(
            "SELECT id, agent_id, user_id, rounds, summary, created_at, updated_at FROM chat_threads WHERE id=?1",
            params![id],
            Self::thread_from_row,
        ).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => PlatformError::not_found(format!("chat_thread {id}")),
            e => e.into(),
        })
    }

    pub fn update_thread_summary(txn: &rusqlite::Transaction, id: &str, summary: &str, rounds: u64) -> PlatformResult<()> {
        txn.execute(
            "UPDATE chat_threads SET summary=?2, rounds=?3, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id=?1",
            params![id, summary, rounds as i64],
        )?;
        Ok(())
    }

    fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ChatThread> {
        Ok(ChatThread {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            user_id: row.get(2)?,
            rounds: row.get::<_, i64>(3)? as u64,
            summary: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn insert_message(txn: &rusqlite::Transaction, m: &ChatMessage) -> PlatformResult<()> {
        txn.execute(
            "INSERT INTO chat_messages (id, thread_id, author_type, content, attachments_json, skill_calls_json, \
             model, input_tokens, output_tokens, wall_clock_cost, credit_event_id, cold_start_cost) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                m.id, m.thread_id, author_type_str(m.author_type), m.content,
                serde_json::to_string(&m.attachments).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&m.skill_calls).unwrap_or_else(|_| "[]".into()),
                m.model, m.input_tokens as i64, m.output_tokens as i64,
                m.wall_clock_cost.to_string(), m.credit_event_id, m.cold_start_cost.to_string(),
            ],
        )?;
        Ok(())
    }

    /// `cursor=None` returns the newest `limit` messages in descending ID
    /// order; `has_more` is true iff there exists an earlier message (§8).
    pub fn page_messages(txn: &rusqlite::Transaction, thread_id: &str, cursor: Option<&str>, limit: usize) -> PlatformResult<(Vec<ChatMessage>, bool)> {
        let mut stmt = match cursor {
            None => txn.prepare("SELECT * FROM chat_messages WHERE thread_id=?1 ORDER BY id DESC LIMIT ?2")?,
            Some(_) => txn.prepare("SELECT * FROM chat_messages WHERE thread_id=?1 AND id < ?3 ORDER BY id DESC LIMIT ?2")?,
        };
        let fetch_limit = limit + 1;
        let rows: Vec<ChatMessage> = match cursor {
            None => stmt.query_map(params![thread_id, fetch_limit as i64], Self::message_from_row)?,
            Some(c) => stmt.query_map(params![thread_id, fetch_limit as i64, c], Self::message_from_row)?,
        }
        .filter_map(|r| r.ok())
        .collect();
        let has_more = rows.len() > limit;
        let mut page = rows;
        page.truncate(limit);
        Ok((page, has_more))
    }

    pub fn last_message(txn: &rusqlite::Transaction, thread_id: &str) -> PlatformResult<Option<ChatMessage>> {
        match txn.query_row(
            "SELECT * FROM chat_messages WHERE thread_id=?1 ORDER BY id DESC LIMIT 1",
            params![thread_id],
            Self::message_from_row,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_all_messages(txn: &rusqlite::Transaction, thread_id: &str) -> PlatformResult<Vec<ChatMessage>> {
        let mut stmt = txn.prepare("SELECT * FROM chat_messages WHERE thread_id=?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![thread_id], Self::message_from_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
        let attachments_json: String = row.get("attachments_json")?;
        let skill_calls_json: String = row.get("skill_calls_json")?;
        Ok(ChatMessage {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            author_type: parse_author_type(&row.get::<_, String>("author_type")?),
            content: row.get("content")?,
            attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
            skill_calls: serde_json::from_str(&skill_calls_json).unwrap_or_default(),
            model: row.get("model")?,
            input_tokens: row.get::<_, i64>("input_tokens")? as u64,
            output_tokens: row.get::<_, i64>("output_tokens")? as u64,
            wall_clock_cost: row.get::<_, String>("wall_clock_cost")?.parse().unwrap_or_default(),
            credit_event_id: row.get("credit_event_id")?,
            cold_start_cost: row.get::<_, String>("cold_start_cost")?.parse().unwrap_or_default(),
            created_at: row.get("created_at")?,
        })
    }
}

fn author_type_str(t: AuthorType) -> &'static str {
    match t {
        AuthorType::Api => "api",
        AuthorType::Agent => "agent",
        AuthorType::Skill => "skill",
        AuthorType::System => "system",
    }
}

fn parse_author_type(s: &str) -> AuthorType {
    match s {
        "agent" => AuthorType::Agent,
        "skill" => AuthorType::Skill,
        "system" => AuthorType::System,
        _ => AuthorType::Api,
    }
}

// ── Agents ───────────────────────────────────────────────────────────────

pub struct AgentRepo;

impl AgentRepo {
    pub fn insert(txn: &rusqlite::Transaction, a: &Agent) -> PlatformResult<()> {
        txn.execute(
            "INSERT INTO agents (id, owner_id, display_name, model, temperature, memory_strategy, \
             token_budget, skills_json, autonomous_tasks_json, fee_platform, fee_dev, fee_agent, system_prompt) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                a.id, a.owner_id, a.display_name, a.model, a.temperature,
                memory_strategy_str(a.memory_strategy), a.token_budget as i64,
                serde_json::to_string(&a.skills).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&a.autonomous_tasks).unwrap_or_else(|_| "[]".into()),
                a.fee_split.platform, a.fee_split.dev, a.fee_split.agent, a.system_prompt,
            ],
        )?;
        Ok(())
    }

    pub fn get(txn: &rusqlite::Transaction, id: &str) -> PlatformResult<Agent> {
        txn.query_row("SELECT * FROM agents WHERE id=?1 AND deleted=0", params![id], Self::from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => PlatformError::not_found(format!("agent {id}")),
                e => e.into(),
            })
    }

    pub fn save(txn: &rusqlite::Transaction, a: &Agent) -> PlatformResult<()> {
        txn.execute(
            "UPDATE agents SET display_name=?2, model=?3, temperature=?4, memory_strategy=?5, \
             token_budget=?6, skills_json=?7, autonomous_tasks_json=?8, fee_platform=?9, fee_dev=?10, \
             fee_agent=?11, system_prompt=?12, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id=?1",
            params![
                a.id, a.display_name, a.model, a.temperature, memory_strategy_str(a.memory_strategy),
                a.token_budget as i64, serde_json::to_string(&a.skills).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&a.autonomous_tasks).unwrap_or_else(|_| "[]".into()),
                a.fee_split.platform, a.fee_split.dev, a.fee_split.agent, a.system_prompt,
            ],
        )?;
        Ok(())
    }

    pub fn soft_delete(txn: &rusqlite::Transaction, id: &str) -> PlatformResult<()> {
        txn.execute("UPDATE agents SET deleted=1 WHERE id=?1", params![id])?;
        Ok(())
    }

    pub fn list_all_enabled(txn: &rusqlite::Transaction) -> PlatformResult<Vec<Agent>> {
        let mut stmt = txn.prepare("SELECT * FROM agents WHERE deleted=0")?;
        let rows = stmt.query_map([], Self::from_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
        let skills_json: String = row.get("skills_json")?;
        let tasks_json: String = row.get("autonomous_tasks_json")?;
        Ok(Agent {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            display_name: row.get("display_name")?,
            model: row.get("model")?,
            temperature: row.get("temperature")?,
            memory_strategy: parse_memory_strategy(&row.get::<_, String>("memory_strategy")?),
            token_budget: row.get::<_, i64>("token_budget")? as usize,
            skills: serde_json::from_str(&skills_json).unwrap_or_default(),
            autonomous_tasks: serde_json::from_str(&tasks_json).unwrap_or_default(),
            fee_split: FeeSplit {
                platform: row.get("fee_platform")?,
                dev: row.get("fee_dev")?,
                agent: row.get("fee_agent")?,
            },
            system_prompt: row.get("system_prompt")?,
            deleted: row.get::<_, i64>("deleted")? != 0,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

fn memory_strategy_str(m: MemoryStrategy) -> &'static str {
    match m { MemoryStrategy::Trim => "trim", MemoryStrategy::Summarize => "summarize" }
}

fn parse_memory_strategy(s: &str) -> MemoryStrategy {
    if s == "summarize" { MemoryStrategy::Summarize } else { MemoryStrategy::Trim }
}

// ── Scheduled jobs (durable job definitions; see also kv.rs for locks) ──

pub struct ScheduledJobRepo;

impl ScheduledJobRepo {
    pub fn upsert(txn: &rusqlite::Transaction, job: &ScheduledJob) -> PlatformResult<()> {
        txn.execute(
            "INSERT INTO scheduled_jobs (id, trigger_json, last_run_at, next_run_at, lock_owner, lock_expires_at) \
             VALUES (?1,?2,?3,?4,?5,?6) \
             ON CONFLICT(id) DO UPDATE SET trigger_json=?2, last_run_at=?3, next_run_at=?4, lock_owner=?5, lock_expires_at=?6",
            params![
                job.id,
                serde_json::to_string(&job.trigger).unwrap_or_default(),
                job.last_run_at, job.next_run_at, job.lock_owner, job.lock_expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(txn: &rusqlite::Transaction, id: &str) -> PlatformResult<Option<ScheduledJob>> {
        match txn.query_row("SELECT * FROM scheduled_jobs WHERE id=?1", params![id], Self::from_row) {
            Ok(j) => Ok(Some(j)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_all(txn: &rusqlite::Transaction) -> PlatformResult<Vec<ScheduledJob>> {
        let mut stmt = txn.prepare("SELECT * FROM scheduled_jobs")?;
        let rows = stmt.query_map([], Self::from_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
        let trigger_json: String = row.get("trigger_json")?;
        Ok(ScheduledJob {
            id: row.get("id")?,
            trigger: serde_json::from_str(&trigger_json).unwrap_or(JobTrigger::IntervalMinutes(60)),
            last_run_at: row.get("last_run_at")?,
            next_run_at: row.get("next_run_at")?,
            lock_owner: row.get("lock_owner")?,
            lock_expires_at: row.get("lock_expires_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_get_or_create_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (a, b) = store
            .with_txn(|txn| {
                let a = AccountRepo::get_or_create(txn, "user-1", OwnerType::User)?;
                let b = AccountRepo::get_or_create(txn, "user-1", OwnerType::User)?;
                Ok((a, b))
            })
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn message_pagination_newest_first_with_has_more() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .with_txn(|txn| {
                let thread = ChatRepo::get_or_create_thread(txn, "agent-1", "user-1")?;
                for i in 0..5 {
                    let msg = ChatMessage {
                        id: format!("{:020}", i),
                        thread_id: thread.id.clone(),
                        author_type: AuthorType::Api,
                        content: format!("msg{i}"),
                        attachments: vec![],
                        skill_calls: vec![],
                        model: None,
                        input_tokens: 0,
                        output_tokens: 0,
                        wall_clock_cost: Amount::ZERO,
                        credit_event_id: None,
                        cold_start_cost: Amount::ZERO,
                        created_at: String::new(),
                    };
                    ChatRepo::insert_message(txn, &msg)?;
                }
                let (page, has_more) = ChatRepo::page_messages(txn, &thread.id, None, 2)?;
                assert_eq!(page.len(), 2);
                assert!(has_more);
                assert_eq!(page[0].content, "msg4");
                Ok(())
            })
            .unwrap();
    }
}
