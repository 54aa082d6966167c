//! Benchmark suite for wallet operations and complete transfers
//!
//! Uses the divan benchmarking framework.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! ```
//!
//! Two groups are measured:
//! - Note selection over wallets of growing size
//! - Complete request-initiated transfers between in-process agents

use std::sync::Arc;
use std::time::Duration;

use divan::Bencher;
use rust_decimal::Decimal;
use tokio::runtime::Runtime;
use value_transfer::types::PartyState;
use value_transfer::{
    Agent, AgentConfig, AutoAccept, Did, InMemoryNetwork, Note, TransactionId, TransactionState,
};

const WITNESS: &str = "did:peer:witness";
const GETTER: &str = "did:peer:getter";
const GIVER: &str = "did:peer:giver";

fn main() {
    divan::main();
}

fn wallet(notes: usize) -> PartyState {
    let owner = Did::from(GIVER);
    PartyState::with_notes(
        (0..notes)
            .map(|i| Note::new(Decimal::new(i as i64 % 7 + 1, 0), owner.clone()))
            .collect(),
    )
}

/// Select and release notes covering half of the wallet's value
#[divan::bench(args = [10, 100, 1_000, 10_000])]
fn select_notes(bencher: Bencher, notes: usize) {
    let mut state = wallet(notes);
    let amount = state.balance() / Decimal::TWO;
    let tx = TransactionId::generate();

    bencher.bench_local(|| {
        let selected = state
            .select_notes(divan::black_box(amount), &tx)
            .expect("wallet covers amount");
        state.release(&tx);
        selected
    });
}

struct Network {
    runtime: Runtime,
    getter: Arc<Agent>,
}

fn start(runtime: &Runtime, network: &Arc<InMemoryNetwork>, config: AgentConfig) -> Arc<Agent> {
    let did = config.did.clone();
    let inbox = network.register(&did);
    let agent = Arc::new(Agent::new(config, network.channel(&did)).expect("valid config"));
    let _enter = runtime.enter();
    agent.spawn_inbox(inbox);
    agent
}

/// Witness, getter and an auto-accepting giver holding `notes` notes of 1000
fn network(notes: usize) -> Network {
    let runtime = Runtime::new().expect("tokio runtime");
    let network = InMemoryNetwork::new();
    start(&runtime, &network, AgentConfig::new(WITNESS).as_witness());
    let getter = start(
        &runtime,
        &network,
        AgentConfig::new(GETTER).with_witness(WITNESS),
    );
    let giver = start(
        &runtime,
        &network,
        AgentConfig {
            auto_accept_payment_request: AutoAccept::Always,
            ..AgentConfig::new(GIVER).with_witness(WITNESS)
        },
    );
    runtime.block_on(async {
        for _ in 0..notes {
            giver
                .issuer()
                .mint_cash(
                    Decimal::new(1_000, 0),
                    None,
                    true,
                    true,
                    Some(Duration::from_secs(10)),
                )
                .await
                .expect("mint sent");
        }
    });
    Network { runtime, getter }
}

/// One complete transfer of a single unit, from request to both receipts
#[divan::bench(sample_count = 50)]
fn request_to_completion(bencher: Bencher) {
    let Network { runtime, getter } = network(4);

    bencher.bench_local(|| {
        runtime.block_on(async {
            let (record, _) = getter
                .getter()
                .create_request(Decimal::ONE, None, Some(Did::from(GIVER)), None, None)
                .await
                .expect("request sent");
            let done = getter
                .wait_until_terminal(&record.id, Some(Duration::from_secs(10)))
                .await
                .expect("transfer finished");
            assert_eq!(done.state(), TransactionState::Completed);
        })
    });
}

/// Transfers started together, each waiting for its own completion
#[divan::bench(args = [4, 16, 64], sample_count = 20)]
fn concurrent_transfers(bencher: Bencher, transfers: usize) {
    let Network { runtime, getter } = network(transfers * 2);

    bencher.bench_local(|| {
        runtime.block_on(async {
            let pending = (0..transfers).map(|_| {
                let getter = Arc::clone(&getter);
                async move {
                    let (record, _) = getter
                        .getter()
                        .create_request(Decimal::ONE, None, Some(Did::from(GIVER)), None, None)
                        .await
                        .expect("request sent");
                    getter
                        .wait_until_terminal(&record.id, Some(Duration::from_secs(30)))
                        .await
                        .expect("transfer finished")
                }
            });
            futures::future::join_all(pending).await
        })
    });
}
