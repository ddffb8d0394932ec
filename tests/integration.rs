// End-to-end scenarios spanning the ledger, execution engine, scheduler,
// and checker together — the per-module unit tests already cover fee
// decomposition, balance boundaries, refund/refill idempotence, rebuild
// correctness, and scheduler liveness in isolation; these exercise the
// seams between modules (§8 scenarios 2, 3, 5, plus thread pagination).

use agentry_platform::atoms::decimal::Amount;
use agentry_platform::atoms::types::*;
use agentry_platform::engine::{ExecutionEngine, SkillInvoker};
use agentry_platform::ledger::Ledger;
use agentry_platform::providers::{AnyProvider, ModelProvider};
use agentry_platform::registry::{SkillCapability, SkillDescriptor, SkillRegistry};
use agentry_platform::store::{AccountRepo, ChatRepo, MemoryKvStore, SqliteStore, TransactionRepo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

fn test_agent(fee_split: FeeSplit) -> Agent {
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
        fee_split,
        system_prompt: String::new(),
        deleted: false,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

fn no_fees() -> FeeSplit {
    FeeSplit { platform: 0.0, dev: 0.0, agent: 0.0 }
}

struct TextOnlyProvider;

#[async_trait]
impl ModelProvider for TextOnlyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }
    async fn chat(&self, _messages: &[Message], _tools: &[ToolDefinition], _model: &str, _temperature: Option<f64>) -> agentry_platform::PlatformResult<Vec<StreamChunk>> {
        Ok(vec![StreamChunk {
            delta_text: Some("hello there".to_string()),
            tool_calls: vec![],
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 15 }),
            model: Some("stub".to_string()),
        }])
    }
}

/// Proposes one `search` tool call on its first turn, then finishes with
/// plain text on the next — so a driven turn settles exactly once instead
/// of looping to `DEFAULT_MAX_TOOL_ROUNDS`.
struct OneToolCallProvider {
    calls: std::sync::atomic::AtomicUsize,
}

impl OneToolCallProvider {
    fn new() -> Self {
        OneToolCallProvider { calls: std::sync::atomic::AtomicUsize::new(0) }
    }
}

#[async_trait]
impl ModelProvider for OneToolCallProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }
    async fn chat(&self, _messages: &[Message], _tools: &[ToolDefinition], _model: &str, _temperature: Option<f64>) -> agentry_platform::PlatformResult<Vec<StreamChunk>> {
        let call_index = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call_index == 0 {
            Ok(vec![StreamChunk {
                delta_text: None,
                tool_calls: vec![ToolCallDelta { index: 0, id: Some("call_1".into()), function_name: Some("search".into()), arguments_delta: Some(r#"{"query":"rust"}"#.into()) }],
                finish_reason: Some("tool_calls".to_string()),
                usage: Some(TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 15 }),
                model: Some("stub".to_string()),
            }])
        } else {
            Ok(vec![StreamChunk {
                delta_text: Some("done".to_string()),
                tool_calls: vec![],
                finish_reason: Some("stop".to_string()),
                usage: Some(TokenUsage { input_tokens: 5, output_tokens: 2, total_tokens: 7 }),
                model: Some("stub".to_string()),
            }])
        }
    }
}

struct StubInvoker;

#[async_trait]
impl SkillInvoker for StubInvoker {
    async fn invoke(&self, _skill_name: &str, _arguments: &Value) -> agentry_platform::PlatformResult<String> {
        Ok("3 results".to_string())
    }
}

fn search_skill(price: &str) -> SkillDescriptor {
    SkillDescriptor {
        name: "search".into(),
        category: "retrieval".into(),
        price_tier: Amount::from_str(price).unwrap(),
        requires_agent_owner_key: false,
        states: vec!["query".into()],
        capabilities: vec![SkillCapability::Invocable],
        argument_schema: json!({"required": ["query"]}),
    }
}

fn engine_with(provider: Box<dyn ModelProvider>, registry: SkillRegistry, store: Arc<SqliteStore>) -> ExecutionEngine {
    let kv = Arc::new(MemoryKvStore::new());
    ExecutionEngine::new(
        store,
        kv,
        AnyProvider::from_boxed(provider),
        Arc::new(registry),
        agentry_platform::registry::pricing::PriceTable::new(),
        Arc::new(StubInvoker),
        Arc::new(agentry_platform::alerts::LogErrorReporter),
    )
}

// Scenario 2: payer balance below the cost of the requested tool call —
// the stream yields exactly one System message naming the shortfall, and
// no CreditTransaction is ever written.
#[tokio::test]
async fn insufficient_credits_blocks_the_turn_and_writes_no_transaction() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let agent = test_agent(no_fees());
    let account = store.with_txn(|txn| AccountRepo::get_or_create(txn, &agent.owner_id, OwnerType::User)).unwrap();
    store
        .with_txn(|txn| {
            let mut acct = account.clone();
            acct.free_credits = Amount::from_str("0.0010").unwrap();
            AccountRepo::save(txn, &acct)
        })
        .unwrap();

    let mut registry = SkillRegistry::new();
    registry.register(search_skill("0.0050"));
    let engine = engine_with(Box::new(OneToolCallProvider::new()), registry, store.clone());

    let thread = store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &agent.owner_id)).unwrap();
    let messages = engine.execute(&agent, &thread.id, "search for rust crates").await.unwrap();

    let system_messages: Vec<_> = messages.iter().filter(|m| m.author_type == AuthorType::System).collect();
    assert_eq!(system_messages.len(), 1);
    assert!(system_messages[0].content.contains("Insufficient credits"));
    assert!(system_messages[0].content.contains("0.0040"));

    let transactions = store.with_txn(|txn| TransactionRepo::page_by_account(txn, &account.id, None, 10)).unwrap();
    assert!(transactions.is_empty());
}

// Scenario 3: a thread ending on an Agent message retries by re-emitting
// the tail verbatim — no new ledger activity.
#[tokio::test]
async fn retry_after_agent_message_incurs_no_additional_charge() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let agent = test_agent(no_fees());
    let engine = engine_with(Box::new(TextOnlyProvider), SkillRegistry::new(), store.clone());
    let thread = store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &agent.owner_id)).unwrap();

    engine.execute(&agent, &thread.id, "hi").await.unwrap();
    let account = store.with_txn(|txn| AccountRepo::get_or_create(txn, &agent.owner_id, OwnerType::User)).unwrap();
    let transactions_before = store.with_txn(|txn| TransactionRepo::page_by_account(txn, &account.id, None, 50)).unwrap();

    let retried = engine.retry_last(&agent, &thread.id).await.unwrap();
    assert_eq!(retried.last().unwrap().content, "hello there");

    let transactions_after = store.with_txn(|txn| TransactionRepo::page_by_account(txn, &account.id, None, 50)).unwrap();
    assert_eq!(transactions_before.len(), transactions_after.len());
}

// Scenario 5: the same refund request submitted concurrently from several
// threads must settle on exactly one reversal.
#[test]
fn concurrent_refund_requests_are_idempotent() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ledger = Arc::new(Ledger::new(store.clone()));
    let event = ledger.recharge("user-1", OwnerType::User, Amount::from_str("5.0000").unwrap(), CreditClass::Permanent, None).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ledger = ledger.clone();
            let event_id = event.id.clone();
            std::thread::spawn(move || ledger.refund(&event_id, "duplicate client retry"))
        })
        .collect();
    let reversal_ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().unwrap().id).collect();
    assert!(reversal_ids.windows(2).all(|w| w[0] == w[1]));

    let account = store.with_txn(|txn| AccountRepo::get_or_create(txn, "user-1", OwnerType::User)).unwrap();
    assert_eq!(account.credits, Amount::ZERO);
    assert_eq!(account.free_credits, Amount::ZERO);
    assert_eq!(account.reward_credits, Amount::ZERO);
}

// Thread pagination: newest-first ordering and a correct has_more flag.
#[test]
fn thread_pagination_returns_newest_first_with_has_more() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let thread = store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, "agent-1", "user-1")).unwrap();
    for i in 0..5 {
        let msg = ChatMessage {
            id: format!("m{i:02}"),
            thread_id: thread.id.clone(),
            author_type: AuthorType::Api,
            content: format!("message {i}"),
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
        store.with_txn(|txn| ChatRepo::insert_message(txn, &msg)).unwrap();
    }

    let (page, has_more) = store.with_txn(|txn| ChatRepo::page_messages(txn, &thread.id, None, 2)).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, "m04");
    assert_eq!(page[1].id, "m03");
    assert!(has_more);

    let (last_page, has_more) = store.with_txn(|txn| ChatRepo::page_messages(txn, &thread.id, Some("m00"), 10)).unwrap();
    assert!(last_page.is_empty());
    assert!(!has_more);
}

// The acting user, not the agent's owner, is the payer: a thread created
// for a user distinct from the agent's owner debits that user's account.
#[tokio::test]
async fn thread_user_not_agent_owner_is_the_one_debited() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let agent = test_agent(no_fees());
    store
        .with_txn(|txn| {
            let mut acct = AccountRepo::get_or_create(txn, "renting-user", OwnerType::User)?;
            acct.credits = Amount::from_str("10.0000").unwrap();
            AccountRepo::save(txn, &acct)
        })
        .unwrap();

    let mut registry = SkillRegistry::new();
    registry.register(search_skill("0.0050"));
    let engine = engine_with(Box::new(OneToolCallProvider::new()), registry, store.clone());
    let thread = store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, "renting-user")).unwrap();
    assert_ne!(thread.user_id, agent.owner_id);

    let messages = engine.execute(&agent, &thread.id, "search for rust crates").await.unwrap();
    let agent_msg = messages.iter().find(|m| m.author_type == AuthorType::Agent).unwrap();
    assert!(agent_msg.skill_calls[0].success);

    let payer_account = store.with_txn(|txn| AccountRepo::get_or_create(txn, "renting-user", OwnerType::User)).unwrap();
    assert!(payer_account.credits < Amount::from_str("10.0000").unwrap());

    let owner_account = store.with_txn(|txn| AccountRepo::get_or_create(txn, &agent.owner_id, OwnerType::User)).unwrap();
    assert_eq!(owner_account.credits, Amount::ZERO);
}

// A full turn with one successful tool call settles a ledger debit and
// records the skill call on the persisted message.
#[tokio::test]
async fn successful_tool_call_settles_ledger_and_records_skill_call() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let agent = test_agent(no_fees());
    store
        .with_txn(|txn| {
            let mut acct = AccountRepo::get_or_create(txn, &agent.owner_id, OwnerType::User)?;
            acct.credits = Amount::from_str("10.0000").unwrap();
            AccountRepo::save(txn, &acct)
        })
        .unwrap();

    let mut registry = SkillRegistry::new();
    registry.register(search_skill("0.0050"));
    let engine = engine_with(Box::new(OneToolCallProvider::new()), registry, store.clone());
    let thread = store.with_txn(|txn| ChatRepo::get_or_create_thread(txn, &agent.id, &agent.owner_id)).unwrap();

    let messages = engine.execute(&agent, &thread.id, "search for rust crates").await.unwrap();
    let agent_msg = messages.iter().find(|m| m.author_type == AuthorType::Agent).unwrap();
    assert_eq!(agent_msg.skill_calls.len(), 1);
    assert!(agent_msg.skill_calls[0].success);
    assert_eq!(agent_msg.skill_calls[0].output, "3 results");

    let account = store.with_txn(|txn| AccountRepo::get_or_create(txn, &agent.owner_id, OwnerType::User)).unwrap();
    assert!(account.credits < Amount::from_str("10.0000").unwrap());
}
