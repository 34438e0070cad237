//! DST tests for event-sourced agent state
//!
//! TigerStyle: Explicit fault scenarios, model-checked state.
//!
//! The invariants under test:
//! - State only changes after the store acknowledged the batch
//! - Replay (with or without snapshots) reproduces the confirmed state
//! - Concurrent writers are serialized by version; the loser conflicts
//! - Lost acknowledgements surface as a conflict on the next confirm

use arbor_core::agent::{Agent, AgentContext, AgentId};
use arbor_core::config::{ArborConfig, EventSourcingConfig};
use arbor_core::envelope::{Direction, Envelope, EnvelopeId, Event, EventPayload, PublishOptions};
use arbor_core::error::{Error, Result};
use arbor_core::handlers::HandlerTable;
use arbor_core::occ::Version;
use arbor_dst::{FaultConfig, FaultType, SimConfig, SimEnvironment, Simulation, StoreOperation};
use arbor_eventsourcing::{
    DomainEvent, EventSourced, EventSourcedCore, EventStore, EveryNVersions, NeverSnapshot,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Domain
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum AccountEvent {
    Deposited(u64),
    Withdrawn(u64),
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Deposited(_) => "account.deposited",
            AccountEvent::Withdrawn(_) => "account.withdrawn",
        }
    }
}

struct Account;

impl EventSourced for Account {
    type State = i64;
    type Event = AccountEvent;

    fn transition(balance: &i64, event: &AccountEvent) -> i64 {
        match event {
            AccountEvent::Deposited(n) => balance + *n as i64,
            AccountEvent::Withdrawn(n) => balance - *n as i64,
        }
    }
}

fn account_id() -> AgentId {
    AgentId::new("accounts", "acct-1").unwrap()
}

fn account(env: &SimEnvironment) -> EventSourcedCore<Account> {
    EventSourcedCore::new(account_id(), env.event_store(), &EventSourcingConfig::default())
        .unwrap()
        .with_snapshot_policy(NeverSnapshot)
}

fn random_event(env: &SimEnvironment) -> AccountEvent {
    let amount = env.rng.next_range(1, 500);
    if env.rng.next_bool(0.6) {
        AccountEvent::Deposited(amount)
    } else {
        AccountEvent::Withdrawn(amount)
    }
}

fn fold(events: &[AccountEvent]) -> i64 {
    events.iter().fold(0, |balance, e| Account::transition(&balance, e))
}

// =============================================================================
// Confirm
// =============================================================================

#[test]
fn test_dst_confirm_applies_batch_in_one_append() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let mut acct = account(&env);
        acct.replay().await?;

        acct.stage(AccountEvent::Deposited(100))?;
        acct.stage(AccountEvent::Withdrawn(30))?;
        assert_eq!(*acct.state(), 0, "staging must not touch state");

        let version = acct.confirm().await?;
        assert_eq!(version, Version::new(2));
        assert_eq!(*acct.state(), 70);
        assert!(acct.pending().is_empty());
        assert_eq!(env.store.append_calls(), 1);

        // Nothing staged: no round trip
        assert_eq!(acct.confirm().await?, Version::new(2));
        assert_eq!(env.store.append_calls(), 1);
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

#[test]
fn test_dst_write_failure_leaves_state_and_pending() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(
            FaultConfig::new(FaultType::StorageWriteFail, 1.0)
                .on(StoreOperation::Append)
                .max_triggers(1),
        )
        .run(|env| async move {
            let mut acct = account(&env);
            acct.replay().await?;
            acct.stage(AccountEvent::Deposited(10))?;

            let err = acct.confirm().await.unwrap_err();
            assert!(matches!(err, Error::StorageUnavailable { .. }));
            assert_eq!(*acct.state(), 0);
            assert_eq!(acct.version(), Version::INITIAL);
            assert_eq!(acct.pending(), &[AccountEvent::Deposited(10)]);

            // Retry with the same staged events
            assert_eq!(acct.confirm().await?, Version::new(1));
            assert_eq!(*acct.state(), 10);
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

#[test]
fn test_dst_hung_store_times_out() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(
            FaultConfig::new(FaultType::StorageHang, 1.0)
                .on(StoreOperation::Append)
                .max_triggers(1),
        )
        .run(|env| async move {
            let mut acct = account(&env);
            acct.replay().await?;
            acct.stage(AccountEvent::Deposited(5))?;

            let err = acct.confirm_with_timeout(50).await.unwrap_err();
            assert!(matches!(err, Error::OperationTimedOut { timeout_ms: 50, .. }));
            assert_eq!(acct.pending().len(), 1);
            assert_eq!(acct.version(), Version::INITIAL);

            assert_eq!(acct.confirm().await?, Version::new(1));
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

#[test]
fn test_dst_cancelled_confirm_keeps_pending() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(FaultConfig::new(FaultType::StorageHang, 1.0).on(StoreOperation::Append))
        .run(|env| async move {
            let mut acct = account(&env);
            acct.replay().await?;
            acct.stage(AccountEvent::Deposited(5))?;

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.cancel();
            });

            let err = acct.confirm_until(&cancel).await.unwrap_err();
            assert!(matches!(err, Error::OperationCancelled { .. }));
            assert_eq!(acct.pending().len(), 1);
            assert_eq!(env.store.inner().event_count(&account_id()).await, 0);
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// A lost acknowledgement is detected as a conflict and resolved by reload
#[test]
fn test_dst_lost_ack_conflicts_then_reloads() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(
            FaultConfig::new(FaultType::CrashAfterWrite, 1.0)
                .on(StoreOperation::Append)
                .max_triggers(1),
        )
        .run(|env| async move {
            let mut acct = account(&env);
            acct.replay().await?;
            acct.stage(AccountEvent::Deposited(40))?;

            assert!(acct.confirm().await.is_err());
            assert_eq!(*acct.state(), 0);
            assert_eq!(
                env.store.get_latest_version(&account_id()).await?,
                Version::new(1)
            );

            // The same batch again now conflicts
            let err = acct.confirm().await.unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(acct.pending().len(), 1);

            assert_eq!(acct.reload().await?, Version::new(1));
            assert_eq!(*acct.state(), 40);
            assert!(acct.pending().is_empty());
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

// =============================================================================
// Optimistic Concurrency
// =============================================================================

#[test]
fn test_dst_concurrent_confirms_exactly_one_wins() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(FaultConfig::new(
            FaultType::StorageLatency { min_ms: 1, max_ms: 5 },
            1.0,
        ))
        .run(|env| async move {
            const ROUNDS_COUNT: u64 = 10;

            let mut left = account(&env);
            let mut right = account(&env);
            let mut committed = Vec::new();

            for _ in 0..ROUNDS_COUNT {
                left.reload().await?;
                right.reload().await?;
                assert_eq!(left.version(), right.version());

                let left_event = random_event(&env);
                let right_event = random_event(&env);
                left.stage(left_event.clone())?;
                right.stage(right_event.clone())?;

                let (left_result, right_result) = tokio::join!(left.confirm(), right.confirm());
                match (left_result, right_result) {
                    (Ok(_), Err(e)) => {
                        assert!(e.is_conflict(), "loser must conflict, got {}", e);
                        assert_eq!(right.pending(), &[right_event]);
                        committed.push(left_event);
                    }
                    (Err(e), Ok(_)) => {
                        assert!(e.is_conflict(), "loser must conflict, got {}", e);
                        assert_eq!(left.pending(), &[left_event]);
                        committed.push(right_event);
                    }
                    (l, r) => panic!("expected exactly one winner, got {:?} / {:?}", l, r),
                }
            }

            let mut fresh = account(&env);
            fresh.replay().await?;
            assert_eq!(fresh.version(), Version::new(ROUNDS_COUNT));
            assert_eq!(*fresh.state(), fold(&committed));
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

// =============================================================================
// Replay and Snapshots
// =============================================================================

#[test]
fn test_dst_replay_is_deterministic() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let mut writer = account(&env);
        let mut history = Vec::new();

        for _ in 0..env.rng.next_range(5, 30) {
            let batch = env.rng.next_range(1, 8);
            for _ in 0..batch {
                let event = random_event(&env);
                writer.stage(event.clone())?;
                history.push(event);
            }
            writer.confirm().await?;
            assert_eq!(*writer.state(), fold(&history));
        }

        let expected_version = Version::new(history.len() as u64);
        assert_eq!(writer.version(), expected_version);

        // Small replay batches exercise paging
        let paged = EventSourcingConfig {
            replay_batch_size: 3,
            ..EventSourcingConfig::default()
        };
        for _ in 0..3 {
            let mut reader: EventSourcedCore<Account> =
                EventSourcedCore::new(account_id(), env.event_store(), &paged)?
                    .with_snapshot_policy(NeverSnapshot);
            assert_eq!(reader.replay().await?, expected_version);
            assert_eq!(*reader.state(), *writer.state());
        }
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

#[test]
fn test_dst_snapshot_replay_matches_full_replay() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let interval = env.rng.next_range(2, 10);
        let mut writer = account(&env).with_snapshot_policy(EveryNVersions(interval));
        let mut history = Vec::new();

        for _ in 0..40 {
            let event = random_event(&env);
            writer.stage(event.clone())?;
            history.push(event);
            writer.confirm().await?;
        }
        assert!(writer.snapshot_version() > Version::INITIAL);

        let snapshot = env
            .store
            .get_latest_snapshot(&account_id())
            .await?
            .expect("snapshot written");
        assert!(snapshot.version <= writer.version());

        let mut from_snapshot = account(&env);
        from_snapshot.replay().await?;
        assert_eq!(from_snapshot.snapshot_version(), snapshot.version);

        assert_eq!(from_snapshot.version(), writer.version());
        assert_eq!(*from_snapshot.state(), fold(&history));
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

#[test]
fn test_dst_failed_replay_leaves_state() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(
            FaultConfig::new(FaultType::StorageReadFail, 1.0)
                .on(StoreOperation::ReadEvents)
                .disabled(),
        )
        .run(|env| async move {
            let mut acct = account(&env);
            acct.stage(AccountEvent::Deposited(25))?;
            acct.confirm().await?;

            env.faults.set_enabled(&FaultType::StorageReadFail, true);
            let err = acct.replay().await.unwrap_err();
            assert!(matches!(err, Error::StorageUnavailable { .. }));
            assert_eq!(*acct.state(), 25);
            assert_eq!(acct.version(), Version::new(1));

            env.faults.set_enabled(&FaultType::StorageReadFail, false);
            assert_eq!(acct.replay().await?, Version::new(1));
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// Random storage faults never let state diverge from the confirmed history
#[test]
fn test_dst_chaos_state_matches_confirmed_history() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config)
        .with_fault(FaultConfig::new(FaultType::StorageWriteFail, 0.2))
        .with_fault(FaultConfig::new(FaultType::StorageReadFail, 0.2))
        .with_fault(FaultConfig::new(
            FaultType::StorageLatency { min_ms: 0, max_ms: 2 },
            0.1,
        ))
        .run(|env| async move {
            const OPERATIONS_COUNT: u32 = 50;
            const ATTEMPTS_COUNT_MAX: u32 = 200;

            let mut acct = account(&env).with_snapshot_policy(EveryNVersions(5));
            let mut confirmed = Vec::new();

            for _ in 0..OPERATIONS_COUNT {
                let event = random_event(&env);
                acct.stage(event.clone())?;

                let mut attempts = 0;
                loop {
                    attempts += 1;
                    assert!(attempts <= ATTEMPTS_COUNT_MAX, "confirm never succeeded");
                    let before = *acct.state();
                    match acct.confirm().await {
                        Ok(_) => break,
                        Err(e) => {
                            assert!(matches!(e, Error::StorageUnavailable { .. }), "{}", e);
                            assert_eq!(*acct.state(), before);
                        }
                    }
                }
                confirmed.push(event);
                assert_eq!(*acct.state(), fold(&confirmed));
            }

            env.faults.set_enabled(&FaultType::StorageWriteFail, false);
            env.faults.set_enabled(&FaultType::StorageReadFail, false);

            let mut fresh = account(&env);
            fresh.replay().await?;
            assert_eq!(fresh.version(), Version::new(OPERATIONS_COUNT as u64));
            assert_eq!(*fresh.state(), fold(&confirmed));
            Ok(())
        });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

// =============================================================================
// Event-Sourced Agent in the Hierarchy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deposit {
    amount: u64,
}

impl Event for Deposit {
    const TYPE_NAME: &'static str = "account.deposit";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BalanceChanged {
    balance: i64,
}

impl Event for BalanceChanged {
    const TYPE_NAME: &'static str = "account.balance_changed";
}

struct AccountAgent {
    store: Arc<dyn EventStore>,
}

#[async_trait]
impl Agent for AccountAgent {
    type State = Option<EventSourcedCore<Account>>;

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::<Self>::builder()
            .on::<Deposit, _>(|_, ctx, deposit| {
                Box::pin(async move {
                    let Some(core) = ctx.state.as_mut() else {
                        return Err(Error::internal("account not loaded"));
                    };
                    core.stage(AccountEvent::Deposited(deposit.amount))?;
                    core.confirm().await?;
                    let balance = *core.state();
                    ctx.publish(&BalanceChanged { balance }, Direction::Up)
                })
            })
            .build()
    }

    async fn on_activate(&self, ctx: &mut AgentContext<Self::State>) -> Result<()> {
        let mut core = EventSourcedCore::new(
            ctx.id.clone(),
            self.store.clone(),
            &EventSourcingConfig::default(),
        )?;
        core.replay().await?;
        ctx.state = Some(core);
        Ok(())
    }
}

struct Ledger;

impl Agent for Ledger {
    type State = Vec<i64>;

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::<Self>::builder()
            .on::<BalanceChanged, _>(|_, ctx, changed| {
                Box::pin(async move {
                    ctx.state.push(changed.balance);
                    Ok(())
                })
            })
            .build()
    }
}

#[test]
fn test_dst_event_sourced_agent_survives_reactivation() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let cancel = CancellationToken::new();
        let ledger_id = AgentId::new("ledgers", "main")?;

        let system = env.agent_system(ArborConfig::default())?;
        let ledger = system.spawn(ledger_id.clone(), Ledger);
        let acct = system.spawn(
            account_id(),
            AccountAgent {
                store: env.event_store(),
            },
        );
        system.link(&ledger, &acct).await?;
        ledger.activate(&cancel).await?;
        acct.activate(&cancel).await?;

        for amount in [10, 20, 30] {
            acct.handle_envelope(
                Some(&ledger_id),
                Envelope::new(
                    EnvelopeId::generate(env.rng_provider().as_ref()),
                    ledger_id.clone(),
                    EventPayload::pack(&Deposit { amount })?,
                    Direction::Down,
                    PublishOptions::new().with_max_hop_count(0),
                    env.now_ms(),
                ),
            )
            .await?;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ledger.with_state(|s| s.clone()).await, vec![10, 30, 60]);

        // A fresh shell over the same store picks up where the old one stopped
        acct.deactivate(&cancel).await?;
        let system = env.agent_system(ArborConfig::default())?;
        let revived = system.spawn(
            account_id(),
            AccountAgent {
                store: env.event_store(),
            },
        );
        revived.activate(&cancel).await?;
        let (balance, version) = revived
            .with_state(|core| {
                core.as_ref()
                    .map(|c| (*c.state(), c.version()))
                    .expect("account replayed on activation")
            })
            .await;
        assert_eq!(balance, 60);
        assert_eq!(version, Version::new(3));
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}
