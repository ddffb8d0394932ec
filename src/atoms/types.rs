// ── Atoms: Pure Data Types ───────────────────────────────────────────────
// Plain struct/enum definitions with no logic and no I/O.
// Re-exported from crate::atoms::types so `use crate::atoms::types::*`
// resolves the full domain vocabulary in one place.

use crate::atoms::decimal::Amount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Model / Provider wiring (ambient: the engine still has to call a real
//    model somewhere even though schema-driven agent generation and the
//    HTTP transport layer are out of scope) ──────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Google,
    Custom,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Custom => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text, concatenating text blocks and dropping
    /// images/documents — used by providers whose wire format wants a
    /// single string (Anthropic system prompt, plain-text fallbacks).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Truncate `s` to at most `max_bytes` bytes on a UTF-8 character
/// boundary, for safely logging/echoing untrusted provider error bodies.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlData },
    #[serde(rename = "document")]
    Document {
        mime_type: String,
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrlData {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta_text: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function_name: Option<String>,
    pub arguments_delta: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskComplexity {
    Simple,
    Complex,
}

// ── Agent & Autonomous Task (§3) ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    Trim,
    Summarize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateAccess {
    Disabled,
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyProvider {
    Platform,
    AgentOwner,
}

/// Per-skill entry in an agent's skill enablement map (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEnablement {
    pub enabled: bool,
    pub state_access: StateAccess,
    pub api_key_provider: ApiKeyProvider,
}

/// Either a fixed-interval or cron schedule; the two are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskSchedule {
    Minutes(u32),
    Cron(String),
}

/// An agent-owned scheduled prompt that re-enters the Execution Engine
/// without human input (§3, embedded in Agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub prompt: String,
    pub enabled: bool,
    pub schedule: TaskSchedule,
}

/// Agent fee percentages, each a fraction of gross (§4.3). Sum must be ≤ 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSplit {
    pub platform: f64,
    pub dev: f64,
    pub agent: f64,
}

impl FeeSplit {
    pub fn sum(&self) -> f64 {
        self.platform + self.dev + self.agent
    }
}

/// Configuration record for a user-defined agent (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub owner_id: String,
    pub display_name: String,
    pub model: String,
    pub temperature: f64,
    pub memory_strategy: MemoryStrategy,
    pub token_budget: usize,
    pub skills: HashMap<String, SkillEnablement>,
    pub autonomous_tasks: Vec<AutonomousTask>,
    pub fee_split: FeeSplit,
    pub system_prompt: String,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ── Credit Ledger data model (§3, §4.3) ──────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    User,
    Agent,
    Platform,
    Developer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditClass {
    Free,
    Reward,
    Permanent,
}

impl CreditClass {
    /// Draw order mandated by §9's resolved Open Question: free before
    /// reward before permanent. Single source of truth — every debit-path
    /// and fee-split computation iterates classes in this order.
    pub const fn priority_order() -> [CreditClass; 3] {
        [CreditClass::Free, CreditClass::Reward, CreditClass::Permanent]
    }
}

/// Per-owner balance record (§3). Created on first debit/credit, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    pub id: String,
    pub owner_id: String,
    pub owner_type: OwnerType,
    pub free_credits: Amount,
    pub reward_credits: Amount,
    pub credits: Amount, // permanent
    pub total_income_free: Amount,
    pub total_income_reward: Amount,
    pub total_income_permanent: Amount,
    pub total_expense_free: Amount,
    pub total_expense_reward: Amount,
    pub total_expense_permanent: Amount,
    pub updated_at: String,
}

impl CreditAccount {
    pub fn balance(&self, class: CreditClass) -> Amount {
        match class {
            CreditClass::Free => self.free_credits,
            CreditClass::Reward => self.reward_credits,
            CreditClass::Permanent => self.credits,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreditEventType {
    Pay,
    Recharge,
    Refund,
    Adjustment,
    Refill,
    Reward,
    EventReward,
    RechargeBonus,
}

/// One business-level charge or top-up (§3). Immutable once created;
/// owns 2-N CreditTransactions that together conserve value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEvent {
    pub id: String,
    pub event_type: CreditEventType,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub chat_id: Option<String>,
    pub skill_name: Option<String>,

    pub free_amount: Amount,
    pub reward_amount: Amount,
    pub permanent_amount: Amount,
    pub total_amount: Amount,

    pub base_free: Amount,
    pub base_reward: Amount,
    pub base_permanent: Amount,
    pub base_amount: Amount,

    pub fee_platform_free: Amount,
    pub fee_platform_reward: Amount,
    pub fee_platform_permanent: Amount,
    pub fee_platform_amount: Amount,

    pub fee_dev_free: Amount,
    pub fee_dev_reward: Amount,
    pub fee_dev_permanent: Amount,
    pub fee_dev_amount: Amount,

    pub fee_agent_free: Amount,
    pub fee_agent_reward: Amount,
    pub fee_agent_permanent: Amount,
    pub fee_agent_amount: Amount,

    pub idempotency_key: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreditDebit {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Pay,
    Recharge,
    Refund,
    Adjustment,
    Refill,
    Reward,
    EventReward,
    RechargeBonus,
    ReceiveBasePay,
    ReceiveFeePlatform,
    ReceiveFeeDev,
    ReceiveFeeAgent,
}

/// One signed delta against one CreditAccount, linked to one CreditEvent (§3).
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub event_id: String,
    pub account_id: String,
    pub tx_type: TransactionType,
    pub credit_debit: CreditDebit,
    pub change_amount: Amount,
    pub free_amount: Amount,
    pub reward_amount: Amount,
    pub permanent_amount: Amount,
    pub credit_type: CreditClassTag,
    pub created_at: String,
}

/// Which class an amount-carrying transaction is primarily denominated in,
/// used for reporting; the authoritative split is the three *_amount fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreditClassTag {
    Free,
    Reward,
    Permanent,
    Mixed,
}

// ── Chat (§3) ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: String,
    pub agent_id: String,
    pub user_id: String,
    pub rounds: u64,
    pub summary: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    Api,
    Agent,
    Skill,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Link { url: String },
    Image { url: String },
    File { url: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCallRecord {
    pub skill_name: String,
    pub arguments: serde_json::Value,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub thread_id: String,
    pub author_type: AuthorType,
    pub content: String,
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub skill_calls: Vec<SkillCallRecord>,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub wall_clock_cost: Amount,
    pub credit_event_id: Option<String>,
    pub cold_start_cost: Amount,
    pub created_at: String,
}

// ── Scheduler (§3, §4.7) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobTrigger {
    Cron(String),
    IntervalMinutes(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub trigger: JobTrigger,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<String>,
}

// ── Consistency Checker (§4.3, §4.8) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_type: String,
    pub status: bool,
    pub details: String,
    pub difference: Option<Amount>,
    pub ts: String,
}
