// ── Execution Engine (§4.6) ───────────────────────────────────────────────
// One state machine drives a single chat turn:
//
//   INIT -> LOAD_AGENT -> SHAPE_MEMORY -> MODEL_TURN
//             |-- tool_calls  -> PAYMENT_GATE -(ok)-> EXECUTE_TOOLS -> RECORD_TOOL_RESULTS -> MODEL_TURN
//             |                              -(fail)-> EMIT_INSUFFICIENT_CREDITS -> DONE
//             `-- final text  -> SETTLE -> DONE
//
// `execute` buffers every emitted ChatMessage and returns at DONE;
// `stream` forwards the same messages to a channel as they're produced.
// Both call the same inner loop so the two entry points can never drift.

use crate::alerts::ErrorReporter;
use crate::atoms::constants::{
    quota_key, COLD_START_WINDOW_SECS, DEFAULT_DAILY_MESSAGE_QUOTA, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_MONTHLY_MESSAGE_QUOTA, DEFAULT_TOOL_TIMEOUT_SECS, QUOTA_DAILY_TTL_SECS,
    QUOTA_MONTHLY_TTL_SECS, QUOTA_WINDOW_DAILY, QUOTA_WINDOW_MONTHLY,
};
use crate::atoms::decimal::Amount;
use crate::atoms::error::{PlatformError, PlatformResult};
use crate::atoms::ids::new_sortable_id;
use crate::atoms::types::*;
use crate::ledger::Ledger;
use crate::memory::{self, ShapedMemory};
use crate::providers::AnyProvider;
use crate::registry::pricing::PriceTable;
use crate::registry::SkillRegistry;
use crate::store::{ChatRepo, KvStore, SqliteStore};
use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cold start is amortized once per thread per hour; this is the flat cost
/// charged on the first settlement of each window (§9 Open Question, pinned).
const COLD_START_COST_STR: &str = "0.0010";

const PRIVATE_ARGUMENT_KEYS: &[&str] = &["api_key", "apikey", "secret", "token", "password"];

/// Supplied by the caller; invocation of a concrete skill (search, post a
/// message, query a chain...) lives outside this crate (§4.4).
#[async_trait]
pub trait SkillInvoker: Send + Sync {
    async fn invoke(&self, skill_name: &str, arguments: &Value) -> PlatformResult<String>;
}

pub struct ExecutionEngine {
    store: Arc<SqliteStore>,
    kv: Arc<dyn KvStore>,
    provider: AnyProvider,
    ledger: Ledger,
    registry: Arc<SkillRegistry>,
    prices: PriceTable,
    invoker: Arc<dyn SkillInvoker>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        kv: Arc<dyn KvStore>,
        provider: AnyProvider,
        registry: Arc<SkillRegistry>,
        prices: PriceTable,
        invoker: Arc<dyn SkillInvoker>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let ledger = Ledger::new(store.clone());
        ExecutionEngine { store, kv, provider, ledger, registry, prices, invoker, error_reporter }
    }

    /// Buffers every emitted message and returns once the turn reaches DONE.
    pub async fn execute(&self, agent: &Agent, thread_id: &str, user_message: &str) -> PlatformResult<Vec<ChatMessage>> {
        let mut out = Vec::new();
        self.run_turn(agent, thread_id, user_message, &mut |m| out.push(m)).await?;
        Ok(out.into_iter().map(sanitize_message).collect())
    }

    /// Forwards each emitted ChatMessage to the returned receiver as it is
    /// produced. Dropping the receiver aborts the current model turn but
    /// already-incurred costs are still settled (§4.6 Streaming).
    pub fn stream(self: Arc<Self>, agent: Agent, thread_id: String, user_message: String) -> mpsc::Receiver<PlatformResult<ChatMessage>> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let send_tx = tx.clone();
            let result = self
                .run_turn(&agent, &thread_id, &user_message, &mut |m| {
                    let _ = send_tx.try_send(Ok(sanitize_message(m)));
                })
                .await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    async fn run_turn(&self, agent: &Agent, thread_id: &str, user_message: &str, emit: &mut (dyn FnMut(ChatMessage) + Send)) -> PlatformResult<()> {
        let thread = self.store.with_txn(|txn| ChatRepo::get_thread(txn, thread_id))?;
        let payer_id = thread.user_id.clone();

        if let Err(e) = self.check_and_increment_quota(&agent.id) {
            let msg = self.persist_message(thread_id, AuthorType::System, e.to_string(), vec![], 0, 0, Amount::ZERO, None, Amount::ZERO)?;
            emit(msg);
            return Ok(());
        }

        let user_msg = self.persist_message(thread_id, AuthorType::Api, user_message.to_string(), vec![], 0, 0, Amount::ZERO, None, Amount::ZERO)?;
        emit(user_msg);

        let mut history = self.load_history(thread_id)?;
        let shaped = self.shape_memory(agent, &history);
        if let Some(summary) = &shaped.updated_summary {
            self.store.with_txn(|txn| ChatRepo::update_thread_summary(txn, thread_id, summary, history.len() as u64))?;
        }
        history = shaped.messages;

        for _round in 0..DEFAULT_MAX_TOOL_ROUNDS {
            let tools = self.tool_definitions(agent);
            let response = match self.provider.chat(&history, &tools, &agent.model, Some(agent.temperature)).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("[engine] model call failed for thread {thread_id}, retrying once: {e}");
                    match self.provider.chat(&history, &tools, &agent.model, Some(agent.temperature)).await {
                        Ok(chunks) => chunks,
                        Err(e2) => {
                            error!("[engine] model call failed twice for thread {thread_id}: {e2}");
                            self.error_reporter.report(&e2);
                            let msg = self.persist_message(thread_id, AuthorType::System, format!("Model error: {e2}"), vec![], 0, 0, Amount::ZERO, None, Amount::ZERO)?;
                            emit(msg);
                            return Ok(());
                        }
                    }
                }
            };

            let assistant_text: String = response.iter().filter_map(|c| c.delta_text.clone()).collect();
            let tool_calls = collapse_tool_call_deltas(&response);
            let usage = response.iter().rev().find_map(|c| c.usage.clone()).unwrap_or_default();

            if tool_calls.is_empty() {
                let msg = self.settle_and_persist(&payer_id, agent, thread_id, AuthorType::Agent, assistant_text, vec![], usage.input_tokens, usage.output_tokens)?;
                emit(msg);
                return Ok(());
            }

            // PAYMENT_GATE: advisory balance check before spending model/tool cost.
            if let Err(shortfall) = self.check_payment_gate(&payer_id, agent, &tool_calls) {
                let msg = self.persist_message(
                    thread_id,
                    AuthorType::System,
                    format!("Insufficient credits: need {shortfall} more to run the requested tools."),
                    vec![],
                    0,
                    0,
                    Amount::ZERO,
                    None,
                    Amount::ZERO,
                )?;
                emit(msg);
                return Ok(());
            }

            history.push(Message { role: Role::Assistant, content: MessageContent::Text(assistant_text.clone()), tool_calls: Some(tool_calls.clone()), tool_call_id: None, name: None });

            let mut skill_calls = Vec::new();
            for call in &tool_calls {
                let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                if let Err(e) = self.registry.validate_arguments(&call.function.name, &args) {
                    history.push(tool_result_message(call, &e.to_string()));
                    skill_calls.push(SkillCallRecord { skill_name: call.function.name.clone(), arguments: args, output: e.to_string(), success: false });
                    continue;
                }
                match tokio::time::timeout(Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS), self.invoker.invoke(&call.function.name, &args)).await {
                    Ok(Ok(output)) => {
                        history.push(tool_result_message(call, &output));
                        skill_calls.push(SkillCallRecord { skill_name: call.function.name.clone(), arguments: args, output, success: true });
                    }
                    Ok(Err(e)) => {
                        history.push(tool_result_message(call, &e.to_string()));
                        skill_calls.push(SkillCallRecord { skill_name: call.function.name.clone(), arguments: args, output: e.to_string(), success: false });
                    }
                    Err(_) => {
                        let notice = "skill interrupted: deadline exceeded".to_string();
                        history.push(tool_result_message(call, &notice));
                        skill_calls.push(SkillCallRecord { skill_name: call.function.name.clone(), arguments: args, output: notice, success: false });
                    }
                }
            }

            let msg = self.settle_and_persist(&payer_id, agent, thread_id, AuthorType::Agent, assistant_text, skill_calls, usage.input_tokens, usage.output_tokens)?;
            emit(msg);
        }

        warn!("[engine] thread {thread_id} exceeded {DEFAULT_MAX_TOOL_ROUNDS} tool rounds without finishing");
        Ok(())
    }

    fn tool_definitions(&self, _agent: &Agent) -> Vec<ToolDefinition> {
        // Concrete skill-to-ToolDefinition mapping is a caller/registry
        // wiring concern once a live SkillRegistry is populated.
        Vec::new()
    }

    /// PAYMENT_GATE (§4.6): advisory-only, no lock held — the authoritative
    /// check happens inside `Ledger::debit_for_skill` at settlement time.
    /// Billed against the thread's acting user, not the agent's owner —
    /// those differ whenever a developer's agent serves other users.
    fn check_payment_gate(&self, payer_id: &str, agent: &Agent, tool_calls: &[ToolCall]) -> Result<(), Amount> {
        let mut required = Amount::ZERO;
        for call in tool_calls {
            if let Ok(cost) = self.registry.cost_for(agent, &call.function.name) {
                required = required + cost.gross;
            }
        }
        if required.is_zero() {
            return Ok(());
        }
        let available = self
            .store
            .with_txn(|txn| crate::store::AccountRepo::get_or_create(txn, payer_id, OwnerType::User))
            .map(|a| a.free_credits + a.reward_credits + a.credits)
            .unwrap_or(Amount::ZERO);
        if available < required {
            return Err(required - available);
        }
        Ok(())
    }

    /// Quotas & Rate Limits (§4.9): read-check-before-execute against a
    /// per-agent daily and monthly message ceiling. Both counters increment
    /// unconditionally so the window's actual traffic is recorded even
    /// when this turn is about to be rejected; `QuotaWindowBoundaryJob`
    /// clears the keys at each window boundary rather than relying solely
    /// on TTL expiry, so a ceiling raised mid-window takes effect at once.
    fn check_and_increment_quota(&self, agent_id: &str) -> PlatformResult<()> {
        let daily = self.kv.incr_with_expiry(&quota_key(agent_id, QUOTA_WINDOW_DAILY), Duration::from_secs(QUOTA_DAILY_TTL_SECS));
        let monthly = self.kv.incr_with_expiry(&quota_key(agent_id, QUOTA_WINDOW_MONTHLY), Duration::from_secs(QUOTA_MONTHLY_TTL_SECS));
        if daily > DEFAULT_DAILY_MESSAGE_QUOTA {
            return Err(PlatformError::QuotaExceeded(format!("agent {agent_id} exceeded its daily message quota of {DEFAULT_DAILY_MESSAGE_QUOTA}")));
        }
        if monthly > DEFAULT_MONTHLY_MESSAGE_QUOTA {
            return Err(PlatformError::QuotaExceeded(format!("agent {agent_id} exceeded its monthly message quota of {DEFAULT_MONTHLY_MESSAGE_QUOTA}")));
        }
        Ok(())
    }

    /// SHAPE_MEMORY pre-model hook (§4.6).
    fn shape_memory(&self, agent: &Agent, history: &[Message]) -> ShapedMemory {
        let budget = agent.token_budget as u64;
        match agent.memory_strategy {
            MemoryStrategy::Trim => memory::trim(history, budget),
            MemoryStrategy::Summarize => memory::summarize(history, None, crate::atoms::constants::DEFAULT_SUMMARIZE_KEEP_RECENT, |_existing, folded| {
                format!("[summary of {} earlier messages]", folded.len())
            }),
        }
    }

    fn load_history(&self, thread_id: &str) -> PlatformResult<Vec<Message>> {
        let records = self.store.with_txn(|txn| ChatRepo::list_all_messages(txn, thread_id))?;
        Ok(records
            .iter()
            .map(|m| Message {
                role: match m.author_type {
                    AuthorType::Api => Role::User,
                    AuthorType::Agent => Role::Assistant,
                    AuthorType::Skill => Role::Tool,
                    AuthorType::System => Role::System,
                },
                content: MessageContent::Text(m.content.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            })
            .collect())
    }

    /// SETTLE: debit a skill per tool actually invoked plus a model-tokens
    /// debit, cold-start cost amortized once per thread per hour (§4.6).
    /// `payer_id` is the thread's acting user, never the agent's owner.
    #[allow(clippy::too_many_arguments)]
    fn settle_and_persist(
        &self,
        payer_id: &str,
        agent: &Agent,
        thread_id: &str,
        author_type: AuthorType,
        content: String,
        skill_calls: Vec<SkillCallRecord>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> PlatformResult<ChatMessage> {
        let cold_start_cost = self.charge_cold_start_if_due(thread_id);
        let mut last_event_id = None;

        for call in &skill_calls {
            if !call.success {
                continue;
            }
            if let Ok(cost) = self.registry.cost_for(agent, &call.skill_name) {
                match self.ledger.debit_for_skill(payer_id, OwnerType::User, agent, &call.skill_name, Some(thread_id), cost.gross, None) {
                    Ok(event) => last_event_id = Some(event.id),
                    Err(e) => {
                        warn!("[engine] settlement failed for skill {}: {e}", call.skill_name);
                        self.error_reporter.report(&e);
                    }
                }
            }
        }

        let model_cost = self.prices.model_turn_cost(&agent.model, input_tokens, output_tokens, cold_start_cost);
        if !model_cost.is_zero() {
            match self.ledger.debit_for_skill(payer_id, OwnerType::User, agent, "model_tokens", Some(thread_id), model_cost, None) {
                Ok(event) => last_event_id = Some(event.id),
                Err(e) => {
                    warn!("[engine] model-token settlement failed for thread {thread_id}: {e}");
                    self.error_reporter.report(&e);
                }
            }
        }

        self.persist_message(thread_id, author_type, content, skill_calls, input_tokens, output_tokens, model_cost, last_event_id, cold_start_cost)
    }

    /// First settlement in a chat thread's hourly window pays the flat
    /// cold-start cost; later settlements in the same window pay zero.
    fn charge_cold_start_if_due(&self, thread_id: &str) -> Amount {
        let key = format!("cold_start:{thread_id}");
        if self.kv.set_nx(&key, "1", Duration::from_secs(COLD_START_WINDOW_SECS as u64)) {
            Amount::from_str(COLD_START_COST_STR).unwrap_or(Amount::ZERO)
        } else {
            Amount::ZERO
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_message(
        &self,
        thread_id: &str,
        author_type: AuthorType,
        content: String,
        skill_calls: Vec<SkillCallRecord>,
        input_tokens: u64,
        output_tokens: u64,
        wall_clock_cost: Amount,
        credit_event_id: Option<String>,
        cold_start_cost: Amount,
    ) -> PlatformResult<ChatMessage> {
        let msg = ChatMessage {
            id: new_sortable_id(),
            thread_id: thread_id.to_string(),
            author_type,
            content,
            attachments: vec![],
            skill_calls,
            model: None,
            input_tokens,
            output_tokens,
            wall_clock_cost,
            credit_event_id,
            cold_start_cost,
            created_at: String::new(),
        };
        self.store.with_txn(|txn| ChatRepo::insert_message(txn, &msg))?;
        info!("[engine] persisted message {} in thread {thread_id}", msg.id);
        Ok(msg)
    }

    /// "Retry last" behavior (§4.6): if the last message is from the
    /// agent/system, re-emit the tail from the last user message forward
    /// with no new cost; if the last was a user message, re-execute it as
    /// a fresh request; if the last was an interrupted tool message, emit
    /// a system notice and stop.
    pub async fn retry_last(&self, agent: &Agent, thread_id: &str) -> PlatformResult<Vec<ChatMessage>> {
        let messages = self.store.with_txn(|txn| ChatRepo::list_all_messages(txn, thread_id))?;
        let last = match messages.last() {
            Some(m) => m,
            None => return Err(crate::atoms::error::PlatformError::invalid("cannot retry an empty thread")),
        };

        match last.author_type {
            AuthorType::Agent => {
                let last_user_idx = messages.iter().rposition(|m| m.author_type == AuthorType::Api).unwrap_or(0);
                Ok(messages[last_user_idx..].to_vec())
            }
            AuthorType::Api => self.execute(agent, thread_id, &last.content).await,
            AuthorType::Skill | AuthorType::System => {
                let notice = self.persist_message(thread_id, AuthorType::System, "Cannot retry: last turn was interrupted.".to_string(), vec![], 0, 0, Amount::ZERO, None, Amount::ZERO)?;
                Ok(vec![notice])
            }
        }
    }
}

fn collapse_tool_call_deltas(chunks: &[StreamChunk]) -> Vec<ToolCall> {
    use std::collections::BTreeMap;
    let mut by_index: BTreeMap<usize, (Option<String>, String, String)> = BTreeMap::new();
    for chunk in chunks {
        for delta in &chunk.tool_calls {
            let entry = by_index.entry(delta.index).or_insert((None, String::new(), String::new()));
            if let Some(id) = &delta.id {
                entry.0 = Some(id.clone());
            }
            if let Some(name) = &delta.function_name {
                entry.1 = name.clone();
            }
            if let Some(args) = &delta.arguments_delta {
                entry.2.push_str(args);
            }
        }
    }
    by_index
        .into_iter()
        .map(|(index, (id, name, args))| ToolCall {
            id: id.unwrap_or_else(|| format!("call_{index}")),
            call_type: "function".to_string(),
            function: FunctionCall { name, arguments: if args.is_empty() { "{}".to_string() } else { args } },
        })
        .collect()
}

fn tool_result_message(call: &ToolCall, output: &str) -> Message {
    Message { role: Role::Tool, content: MessageContent::Text(output.to_string()), tool_calls: None, tool_call_id: Some(call.id.clone()), name: Some(call.function.name.clone()) }
}

/// Privacy filter (§4.6): strips fields marked private from skill-call
/// arguments before a message leaves the engine.
fn sanitize_message(mut msg: ChatMessage) -> ChatMessage {
    for call in &mut msg.skill_calls {
        if let Value::Object(map) = &mut call.arguments {
            for key in PRIVATE_ARGUMENT_KEYS {
                map.remove(*key);
            }
        }
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ModelProvider;
    use crate::store::MemoryKvStore;

    struct StubProvider;

    #[async_trait]
    impl ModelProvider for StubProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Custom
        }
        async fn chat(&self, _messages: &[Message], _tools: &[ToolDefinition], _model: &str, _temperature: Option<f64>) -> PlatformResult<Vec<StreamChunk>> {
            Ok(vec![StreamChunk {
                delta_text: Some("hello there".to_string()),
                tool_calls: vec![],
                finish_reason: Some("stop".to_string()),
                usage: Some(TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 15 }),
                model: Some("stub".to_string()),
            }])
        }
    }

    struct StubInvoker;

    #[async_trait]
    impl SkillInvoker for StubInvoker {
        async fn invoke(&self, _skill_name: &str, _arguments: &Value) -> PlatformResult<String> {
            Ok("ok".to_string())
        }
    }

    fn test_agent() -> Agent {
        Agent {
            id: "agent-1".into(),
            owner_id: "user-1".into(),
            display_name: "test".into(),
            model: "stub".into(),
            temperature: 0.7,
            memory_strategy: MemoryStrategy::Trim,
            token_budget: 8000,
            skills: Default::default(),
            autonomous_tasks: vec![],
            fee_split: FeeSplit { platform: 0.0, dev: 0.0, agent: 0.0 },
            system_prompt: String::new(),
            deleted: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn test_engine() -> ExecutionEngine {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let provider = AnyProvider::from_boxed(Box::new(StubProvider));
        let registry = Arc::new(SkillRegistry::new());
        ExecutionEngine::new(store, kv, provider, registry, PriceTable::new(), Arc::new(StubInvoker), Arc::new(crate::alerts::LogErrorReporter))
    }

    #[tokio::test]
    async fn execute_with_no_tool_calls_returns_user_and_agent_messages() {
        let engine = test_engine();
        let agent = test_agent();
        let thread = engine.store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &agent.owner_id)).unwrap();

        let messages = engine.execute(&agent, &thread.id, "hi").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author_type, AuthorType::Api);
        assert_eq!(messages[1].author_type, AuthorType::Agent);
        assert_eq!(messages[1].content, "hello there");
    }

    #[tokio::test]
    async fn retry_after_agent_message_re_emits_tail_without_new_cost() {
        let engine = test_engine();
        let agent = test_agent();
        let thread = engine.store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &agent.owner_id)).unwrap();
        engine.execute(&agent, &thread.id, "hi").await.unwrap();

        let retried = engine.retry_last(&agent, &thread.id).await.unwrap();
        assert_eq!(retried.last().unwrap().content, "hello there");
    }

    #[tokio::test]
    async fn quota_exceeded_blocks_the_turn_with_a_system_message() {
        let engine = test_engine();
        let agent = test_agent();
        let thread = engine.store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &agent.owner_id)).unwrap();
        engine.kv.set_volatile(&quota_key(&agent.id, QUOTA_WINDOW_DAILY), &DEFAULT_DAILY_MESSAGE_QUOTA.to_string(), Duration::from_secs(QUOTA_DAILY_TTL_SECS));

        let messages = engine.execute(&agent, &thread.id, "hi").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].author_type, AuthorType::System);
        assert!(messages[0].content.contains("quota"));
    }

    #[test]
    fn sanitize_message_strips_private_argument_keys() {
        let msg = ChatMessage {
            id: "m1".into(),
            thread_id: "t1".into(),
            author_type: AuthorType::Agent,
            content: "done".into(),
            attachments: vec![],
            skill_calls: vec![SkillCallRecord { skill_name: "login".into(), arguments: serde_json::json!({"api_key": "secret-value", "query": "x"}), output: "ok".into(), success: true }],
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            wall_clock_cost: Amount::ZERO,
            credit_event_id: None,
            cold_start_cost: Amount::ZERO,
            created_at: String::new(),
        };
        let sanitized = sanitize_message(msg);
        let args = &sanitized.skill_calls[0].arguments;
        assert!(args.get("api_key").is_none());
        assert!(args.get("query").is_some());
    }
}
