// Database schema and migrations for the relational store adapter.
// Called once by SqliteStore::open()/open_in_memory() before any other query.
// Adding a column: append an idempotent `ALTER TABLE ... ADD COLUMN` (errors
// are swallowed) at the end of run_migrations() — never rewrite existing SQL.

use crate::atoms::error::PlatformResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> PlatformResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            model TEXT NOT NULL,
            temperature REAL NOT NULL DEFAULT 0.7,
            memory_strategy TEXT NOT NULL DEFAULT 'trim',
            token_budget INTEGER NOT NULL DEFAULT 8000,
            skills_json TEXT NOT NULL DEFAULT '{}',
            autonomous_tasks_json TEXT NOT NULL DEFAULT '[]',
            fee_platform REAL NOT NULL DEFAULT 0,
            fee_dev REAL NOT NULL DEFAULT 0,
            fee_agent REAL NOT NULL DEFAULT 0,
            system_prompt TEXT NOT NULL DEFAULT '',
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS credit_accounts (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            owner_type TEXT NOT NULL,
            free_credits TEXT NOT NULL DEFAULT '0.0000',
            reward_credits TEXT NOT NULL DEFAULT '0.0000',
            credits TEXT NOT NULL DEFAULT '0.0000',
            total_income_free TEXT NOT NULL DEFAULT '0.0000',
            total_income_reward TEXT NOT NULL DEFAULT '0.0000',
            total_income_permanent TEXT NOT NULL DEFAULT '0.0000',
            total_expense_free TEXT NOT NULL DEFAULT '0.0000',
            total_expense_reward TEXT NOT NULL DEFAULT '0.0000',
            total_expense_permanent TEXT NOT NULL DEFAULT '0.0000',
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE (owner_id, owner_type)
        );

        CREATE TABLE IF NOT EXISTS credit_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            user_id TEXT,
            agent_id TEXT,
            chat_id TEXT,
            skill_name TEXT,
            free_amount TEXT NOT NULL,
            reward_amount TEXT NOT NULL,
            permanent_amount TEXT NOT NULL,
            total_amount TEXT NOT NULL,
            base_free TEXT NOT NULL,
            base_reward TEXT NOT NULL,
            base_permanent TEXT NOT NULL,
            base_amount TEXT NOT NULL,
            fee_platform_free TEXT NOT NULL,
            fee_platform_reward TEXT NOT NULL,
            fee_platform_permanent TEXT NOT NULL,
            fee_platform_amount TEXT NOT NULL,
            fee_dev_free TEXT NOT NULL,
            fee_dev_reward TEXT NOT NULL,
            fee_dev_permanent TEXT NOT NULL,
            fee_dev_amount TEXT NOT NULL,
            fee_agent_free TEXT NOT NULL,
            fee_agent_reward TEXT NOT NULL,
            fee_agent_permanent TEXT NOT NULL,
            fee_agent_amount TEXT NOT NULL,
            idempotency_key TEXT UNIQUE,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS credit_transactions (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES credit_events(id),
            account_id TEXT NOT NULL REFERENCES credit_accounts(id),
            tx_type TEXT NOT NULL,
            credit_debit TEXT NOT NULL,
            change_amount TEXT NOT NULL,
            free_amount TEXT NOT NULL,
            reward_amount TEXT NOT NULL,
            permanent_amount TEXT NOT NULL,
            credit_type TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX IF NOT EXISTS idx_credit_transactions_event ON credit_transactions(event_id);
        CREATE INDEX IF NOT EXISTS idx_credit_transactions_account ON credit_transactions(account_id, id);

        CREATE TABLE IF NOT EXISTS chat_threads (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            rounds INTEGER NOT NULL DEFAULT 0,
            summary TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE (agent_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL REFERENCES chat_threads(id),
            author_type TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            attachments_json TEXT NOT NULL DEFAULT '[]',
            skill_calls_json TEXT NOT NULL DEFAULT '[]',
            model TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            wall_clock_cost TEXT NOT NULL DEFAULT '0.0000',
            credit_event_id TEXT,
            cold_start_cost TEXT NOT NULL DEFAULT '0.0000',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_thread ON chat_messages(thread_id, id);

        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id TEXT PRIMARY KEY,
            trigger_json TEXT NOT NULL,
            last_run_at TEXT,
            next_run_at TEXT,
            lock_owner TEXT,
            lock_expires_at TEXT
        );
        ",
    )?;
    Ok(())
}
