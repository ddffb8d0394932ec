// Benchmarks the credit ledger's fee-decomposition hot path —
// `Ledger::debit_for_skill`'s class-priority draw plus three-bucket fee
// split — since that's the one ledger operation on the request path of
// every tool call the execution engine settles.

use agentry_platform::atoms::decimal::Amount;
use agentry_platform::atoms::types::{Agent, FeeSplit, MemoryStrategy, OwnerType};
use agentry_platform::ledger::Ledger;
use agentry_platform::store::{AccountRepo, SqliteStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::str::FromStr;
use std::sync::Arc;

fn bench_agent(fee_split: FeeSplit) -> Agent {
    Agent {
        id: "bench-agent".into(),
        owner_id: "bench-dev".into(),
        display_name: "bench".into(),
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

/// Funds `payer` with enough of each class that a bench iteration never
/// runs dry mid-run: free credits deplete fastest under priority draw, so
/// they get the largest top-up.
fn refund_payer(store: &SqliteStore, owner_id: &str) {
    store
        .with_txn(|txn| {
            let mut acct = AccountRepo::get_or_create(txn, owner_id, OwnerType::User)?;
            acct.free_credits = Amount::from_str("1000000.0000").unwrap();
            acct.reward_credits = Amount::from_str("1000000.0000").unwrap();
            acct.credits = Amount::from_str("1000000.0000").unwrap();
            AccountRepo::save(txn, &acct)
        })
        .unwrap();
}

fn debit_for_skill(c: &mut Criterion) {
    let mut group = c.benchmark_group("debit_for_skill");

    let splits = [
        ("no_fees", FeeSplit { platform: 0.0, dev: 0.0, agent: 0.0 }),
        ("platform_only", FeeSplit { platform: 0.2, dev: 0.0, agent: 0.0 }),
        ("three_way_split", FeeSplit { platform: 0.1, dev: 0.1, agent: 0.05 }),
    ];

    for (label, split) in splits {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Ledger::new(store.clone());
        let agent = bench_agent(split);
        refund_payer(&store, &agent.owner_id);

        group.bench_with_input(BenchmarkId::from_parameter(label), &agent, |b, agent| {
            b.iter(|| {
                refund_payer(&store, &agent.owner_id);
                let event = ledger
                    .debit_for_skill(
                        &agent.owner_id,
                        OwnerType::User,
                        agent,
                        "search",
                        None,
                        black_box(Amount::from_str("0.0050").unwrap()),
                        None,
                    )
                    .unwrap();
                black_box(event);
            });
        });
    }

    group.finish();
}

/// Idempotency lookups short-circuit the whole decomposition; worth
/// tracking separately so a regression there doesn't hide in the
/// full-charge numbers above.
fn debit_for_skill_idempotent_replay(c: &mut Criterion) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ledger = Ledger::new(store.clone());
    let agent = bench_agent(FeeSplit { platform: 0.1, dev: 0.1, agent: 0.05 });
    refund_payer(&store, &agent.owner_id);

    let key = "bench-idempotency-key".to_string();
    ledger
        .debit_for_skill(&agent.owner_id, OwnerType::User, &agent, "search", None, Amount::from_str("0.0050").unwrap(), Some(key.clone()))
        .unwrap();

    c.bench_function("debit_for_skill_idempotent_replay", |b| {
        b.iter(|| {
            let event = ledger
                .debit_for_skill(
                    &agent.owner_id,
                    OwnerType::User,
                    &agent,
                    "search",
                    None,
                    black_box(Amount::from_str("0.0050").unwrap()),
                    Some(key.clone()),
                )
                .unwrap();
            black_box(event);
        });
    });
}

criterion_group!(benches, debit_for_skill, debit_for_skill_idempotent_replay);
criterion_main!(benches);
