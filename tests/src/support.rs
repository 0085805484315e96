//! Shared fixtures for the integration tests.

use ns_01_consensus_context::{Context, ContextStore, Ed25519Signer, InMemoryContextStore};
use ns_02_task_scheduler::{MockNotary, SchedulerConfig, StateMachine};
use shared_types::{AccountId, NotaryId, NymId, RelationshipId};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route scheduler logs through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
        tracing::debug!("[ns-tests] tracing initialised");
    });
}

pub const NOTARY: &str = "notary-1";

pub fn alice() -> NymId {
    NymId::new("alice")
}

pub fn bob() -> NymId {
    NymId::new("bob")
}

pub fn notary_id() -> NotaryId {
    NotaryId::new(NOTARY)
}

pub fn signer() -> Arc<Ed25519Signer> {
    Arc::new(Ed25519Signer::from_seed([7u8; 32]))
}

/// One relationship wired to a mock notary, driven by hand.
pub struct Harness {
    pub notary: Arc<MockNotary>,
    pub machine: Arc<StateMachine>,
    pub context: Arc<Context>,
}

impl Harness {
    /// Alice, registered at a notary whose first number is `first_number`.
    pub fn new(config: SchedulerConfig, first_number: i64) -> Self {
        Self::with_store(config, first_number, Arc::new(InMemoryContextStore::new()))
    }

    pub fn with_store(
        config: SchedulerConfig,
        first_number: i64,
        store: Arc<dyn ContextStore>,
    ) -> Self {
        init_tracing();
        let notary = Arc::new(MockNotary::new(notary_id()).with_first_number(first_number));
        notary.register_nym(&alice());
        let context = Context::new(RelationshipId::new(alice(), notary_id()), signer(), store);
        let machine = Arc::new(StateMachine::new(
            Arc::clone(&context),
            notary.clone(),
            None,
            config,
        ));
        Self {
            notary,
            machine,
            context,
        }
    }

    /// Process until nothing is dispatched, bounded.
    pub async fn drive(&self) {
        for _ in 0..64 {
            if !self.machine.process().await {
                return;
            }
        }
    }
}

pub fn transfer(memo: &str) -> ns_02_task_scheduler::Task {
    ns_02_task_scheduler::Task::SendTransfer {
        source: AccountId::new("acct-alice"),
        destination: AccountId::new("acct-bob"),
        amount: 25,
        memo: memo.to_string(),
    }
}
