//! DST tests for hierarchical event propagation
//!
//! TigerStyle: Deterministic topologies and envelope ids, explicit
//! delivery assertions.
//!
//! Every test asserts exactly-once delivery per agent and bounded hop
//! counts. Random topologies are derived from the simulation seed, so a
//! failure is reproducible with `DST_SEED`.

use arbor_core::agent::{Agent, AgentId};
use arbor_core::config::ArborConfig;
use arbor_core::envelope::{Direction, Envelope, EnvelopeId, Event, EventPayload, PublishOptions};
use arbor_core::error::Error;
use arbor_core::handlers::HandlerTable;
use arbor_dst::{SimConfig, Simulation};
use arbor_runtime::{AgentShell, AgentSystem, HandlerFaulted};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Agent
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl Event for Ping {
    const TYPE_NAME: &'static str = "dst.ping";
}

#[derive(Debug, Clone)]
struct Seen {
    event_type: String,
    envelope_id: EnvelopeId,
    hops: u32,
}

struct Recorder {
    faulty: bool,
}

impl Recorder {
    fn new() -> Self {
        Self { faulty: false }
    }

    fn faulty() -> Self {
        Self { faulty: true }
    }
}

impl Agent for Recorder {
    type State = Vec<Seen>;

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::<Self>::builder()
            .on_all(|agent, ctx, envelope| {
                Box::pin(async move {
                    ctx.state.push(Seen {
                        event_type: envelope.event_type().to_string(),
                        envelope_id: envelope.id.clone(),
                        hops: envelope.current_hop_count,
                    });
                    if agent.faulty && envelope.payload.is::<Ping>() {
                        return Err(Error::internal("injected handler fault"));
                    }
                    Ok(())
                })
            })
            .build()
    }
}

type Shell = Arc<AgentShell<Recorder>>;

fn agent(name: &str) -> AgentId {
    AgentId::new("dst", name).unwrap()
}

/// Let shell workers drain their inboxes
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn pings(shell: &Shell) -> Vec<Seen> {
    shell
        .with_state(|seen| {
            seen.iter()
                .filter(|s| s.event_type == Ping::TYPE_NAME)
                .cloned()
                .collect()
        })
        .await
}

/// A forest of recorder shells with parent indices
struct Tree {
    shells: Vec<Shell>,
    parents: Vec<Option<usize>>,
}

impl Tree {
    async fn build(
        system: &AgentSystem,
        parents: Vec<Option<usize>>,
        faulty: &[usize],
    ) -> arbor_core::Result<Self> {
        let shells: Vec<Shell> = (0..parents.len())
            .map(|i| {
                let recorder = if faulty.contains(&i) {
                    Recorder::faulty()
                } else {
                    Recorder::new()
                };
                system.spawn(agent(&format!("n{}", i)), recorder)
            })
            .collect();

        for (child, parent) in parents.iter().enumerate() {
            if let Some(parent) = parent {
                system.link(&shells[*parent], &shells[child]).await?;
            }
        }

        let cancel = CancellationToken::new();
        for shell in &shells {
            shell.activate(&cancel).await?;
        }

        Ok(Self { shells, parents })
    }

    fn children_of(&self, node: usize) -> Vec<usize> {
        (0..self.parents.len())
            .filter(|&i| self.parents[i] == Some(node))
            .collect()
    }

    fn descendants_of(&self, node: usize) -> HashSet<usize> {
        let mut found = HashSet::new();
        let mut frontier = vec![node];
        while let Some(next) = frontier.pop() {
            for child in self.children_of(next) {
                if found.insert(child) {
                    frontier.push(child);
                }
            }
        }
        found
    }

    fn depth_of(&self, mut node: usize) -> u32 {
        let mut depth = 0;
        while let Some(parent) = self.parents[node] {
            depth += 1;
            node = parent;
        }
        depth
    }

    /// Agents that must see an event published by `from` with `direction`
    fn expected_receivers(&self, from: usize, direction: Direction) -> HashSet<usize> {
        match direction {
            Direction::Up => match self.parents[from] {
                Some(parent) => {
                    let mut set: HashSet<usize> = self.children_of(parent).into_iter().collect();
                    set.insert(parent);
                    set.remove(&from);
                    set
                }
                None => HashSet::new(),
            },
            Direction::Down => self.descendants_of(from),
            Direction::Both => {
                let mut root = from;
                while let Some(parent) = self.parents[root] {
                    root = parent;
                }
                let mut set = self.descendants_of(root);
                set.insert(root);
                set.remove(&from);
                set
            }
        }
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// `Both` from a middle node reaches every other agent exactly once
#[test]
fn test_dst_both_from_middle_reaches_every_agent_once() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        //        n0
        //       /  \
        //     n1    n2
        //    /  \     \
        //  n3    n4    n5
        //  |
        //  n6
        let tree = Tree::build(
            &system,
            vec![None, Some(0), Some(0), Some(1), Some(1), Some(2), Some(3)],
            &[],
        )
        .await?;

        tree.shells[1].publish(&Ping { n: 1 }, Direction::Both).await?;
        settle().await;

        for (i, shell) in tree.shells.iter().enumerate() {
            let seen = pings(shell).await;
            if i == 1 {
                assert!(seen.is_empty(), "publisher must not see its own event");
                continue;
            }
            assert_eq!(seen.len(), 1, "n{} saw {} copies", i, seen.len());
            // Never more hops than the distance up to the root and back down
            assert!(seen[0].hops <= tree.depth_of(1) + tree.depth_of(i) + 1);
        }
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// `Up` from C1 reaches the parent and sibling C2 once and never returns to C1
#[test]
fn test_dst_up_reaches_parent_and_sibling_only() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        // p -> c1, c2; c2 -> g
        let tree = Tree::build(&system, vec![None, Some(0), Some(0), Some(2)], &[]).await?;

        tree.shells[1].publish(&Ping { n: 7 }, Direction::Up).await?;
        settle().await;

        assert_eq!(pings(&tree.shells[0]).await.len(), 1);
        assert_eq!(pings(&tree.shells[2]).await.len(), 1);
        assert!(pings(&tree.shells[1]).await.is_empty());
        // Up is terminal at the sibling
        assert!(pings(&tree.shells[3]).await.is_empty());

        // The publisher discarded its own copy from the parent stream
        assert!(tree.shells[1].stats().duplicate_count >= 1);
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// Random trees, publishers and directions match the routing table
#[test]
fn test_dst_random_trees_deliver_exactly_once() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        const ROUNDS_COUNT: u32 = 5;
        const NODES_COUNT_MAX: u64 = 12;

        let rng = env.fork_rng();
        for round in 0..ROUNDS_COUNT {
            let system = env.agent_system(ArborConfig::default())?;
            let nodes = rng.next_range(2, NODES_COUNT_MAX + 1) as usize;
            let parents: Vec<Option<usize>> = (0..nodes)
                .map(|i| if i == 0 { None } else { Some(rng.next_index(i)) })
                .collect();
            let tree = Tree::build(&system, parents, &[]).await?;

            let from = rng.next_index(nodes);
            let direction = *rng
                .choose(&[Direction::Up, Direction::Down, Direction::Both])
                .unwrap();
            let id = tree.shells[from]
                .publish(&Ping { n: round }, direction)
                .await?;
            settle().await;

            let expected = tree.expected_receivers(from, direction);
            for (i, shell) in tree.shells.iter().enumerate() {
                let seen = pings(shell).await;
                if expected.contains(&i) {
                    assert_eq!(
                        seen.len(),
                        1,
                        "round {}: n{} saw {} copies of {} from n{}",
                        round,
                        i,
                        seen.len(),
                        direction,
                        from
                    );
                    assert_eq!(seen[0].envelope_id, id);
                } else {
                    assert!(
                        seen.is_empty(),
                        "round {}: n{} should not see {} from n{}",
                        round,
                        i,
                        direction,
                        from
                    );
                }
            }
        }
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

// =============================================================================
// Hop Limits
// =============================================================================

/// `max_hop_count` dispatches at the limit and stops travelling there
#[test]
fn test_dst_max_hop_count_bounds_travel() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        // Chain n0 -> n1 -> ... -> n5
        let parents = (0..6).map(|i| if i == 0 { None } else { Some(i - 1) }).collect();
        let tree = Tree::build(&system, parents, &[]).await?;

        tree.shells[0]
            .publish_with(
                &Ping { n: 1 },
                Direction::Down,
                PublishOptions::new().with_max_hop_count(2),
            )
            .await?;
        settle().await;

        assert_eq!(pings(&tree.shells[1]).await[0].hops, 1);
        assert_eq!(pings(&tree.shells[2]).await[0].hops, 2);
        for shell in &tree.shells[3..] {
            assert!(pings(shell).await.is_empty());
        }
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// The router ceiling applies even without a per-envelope limit
#[test]
fn test_dst_hop_ceiling_bounds_travel() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let mut arbor = ArborConfig::default();
        arbor.router.hop_count_ceiling = 3;
        let system = env.agent_system(arbor)?;
        let parents = (0..6).map(|i| if i == 0 { None } else { Some(i - 1) }).collect();
        let tree = Tree::build(&system, parents, &[]).await?;

        tree.shells[0].publish(&Ping { n: 1 }, Direction::Down).await?;
        settle().await;

        for (i, shell) in tree.shells.iter().enumerate().skip(1) {
            let seen = pings(shell).await;
            if i <= 3 {
                assert_eq!(seen.len(), 1, "n{} should be within the ceiling", i);
                assert!(seen[0].hops <= 3);
            } else {
                assert!(seen.is_empty(), "n{} is past the ceiling", i);
            }
        }
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// `min_hop_count` suppresses dispatch on near agents but still forwards
#[test]
fn test_dst_min_hop_count_skips_near_agents() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        let parents = (0..4).map(|i| if i == 0 { None } else { Some(i - 1) }).collect();
        let tree = Tree::build(&system, parents, &[]).await?;

        tree.shells[0]
            .publish_with(
                &Ping { n: 1 },
                Direction::Down,
                PublishOptions::new().with_min_hop_count(2),
            )
            .await?;
        settle().await;

        assert!(pings(&tree.shells[1]).await.is_empty());
        assert_eq!(pings(&tree.shells[2]).await.len(), 1);
        assert_eq!(pings(&tree.shells[3]).await.len(), 1);
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

// =============================================================================
// Deduplication
// =============================================================================

/// Redelivering the same envelope is a no-op
#[test]
fn test_dst_redelivery_is_idempotent() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        let tree = Tree::build(&system, vec![None, Some(0)], &[]).await?;
        let parent = agent("n0");

        let envelope = Envelope::new(
            EnvelopeId::generate(env.rng_provider().as_ref()),
            parent.clone(),
            EventPayload::pack(&Ping { n: 9 })?,
            Direction::Down,
            // Dispatch only, so no forwarded copy echoes back on the own stream
            PublishOptions::new().with_max_hop_count(0),
            env.now_ms(),
        );

        let child = &tree.shells[1];
        child.handle_envelope(Some(&parent), envelope.clone()).await?;
        child.handle_envelope(Some(&parent), envelope.clone()).await?;

        // Still a duplicate after some time passes within the TTL
        env.advance_time_ms(1_000);
        child.handle_envelope(Some(&parent), envelope).await?;

        assert_eq!(pings(child).await.len(), 1);
        assert_eq!(child.stats().duplicate_count, 2);
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// Envelope ids follow the seed
#[test]
fn test_dst_envelope_ids_are_reproducible() {
    let seed = SimConfig::from_env_or_random().seed;

    let publish_once = || {
        Simulation::new(SimConfig::new(seed))
            .run(|env| async move {
                let system = env.agent_system(ArborConfig::default())?;
                let tree = Tree::build(&system, vec![None, Some(0)], &[]).await?;
                let id = tree.shells[0].publish(&Ping { n: 1 }, Direction::Down).await?;
                Ok(id)
            })
            .unwrap()
    };

    assert_eq!(publish_once(), publish_once());
}

// =============================================================================
// Hierarchy Changes
// =============================================================================

/// After re-parenting, the old parent's events no longer arrive
#[test]
fn test_dst_reparent_follows_new_parent_only() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        // root -> a, b; a -> c
        let tree = Tree::build(&system, vec![None, Some(0), Some(0), Some(1)], &[]).await?;
        let (a, b, c) = (&tree.shells[1], &tree.shells[2], &tree.shells[3]);

        system.unlink(a, c).await?;
        system.link(b, c).await?;
        assert_eq!(c.parent(), Some(agent("n2")));

        a.publish(&Ping { n: 1 }, Direction::Down).await?;
        b.publish(&Ping { n: 2 }, Direction::Down).await?;
        settle().await;

        let seen: Vec<u32> = c
            .with_state(|seen| seen.iter().map(|s| s.hops).collect())
            .await;
        assert_eq!(seen.len(), 1);
        assert!(a.children().is_empty());
        assert_eq!(b.children(), vec![agent("n3")]);
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

// =============================================================================
// Fault Isolation
// =============================================================================

/// A faulting handler neither stops forwarding nor its siblings
#[test]
fn test_dst_handler_fault_is_isolated() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        // p -> c1 (faulty), c2; c1 -> g
        let tree = Tree::build(&system, vec![None, Some(0), Some(0), Some(1)], &[1]).await?;

        tree.shells[0].publish(&Ping { n: 1 }, Direction::Down).await?;
        settle().await;

        assert_eq!(pings(&tree.shells[1]).await.len(), 1);
        assert_eq!(pings(&tree.shells[2]).await.len(), 1);
        assert_eq!(pings(&tree.shells[3]).await.len(), 1);
        assert_eq!(tree.shells[1].stats().fault_count, 1);
        assert!(tree.shells[1].is_active());

        let faults = tree.shells[0]
            .with_state(|seen| {
                seen.iter()
                    .filter(|s| s.event_type == HandlerFaulted::TYPE_NAME)
                    .count()
            })
            .await;
        assert_eq!(faults, 1);

        // The faulty agent keeps receiving
        tree.shells[0].publish(&Ping { n: 2 }, Direction::Down).await?;
        settle().await;
        assert_eq!(pings(&tree.shells[1]).await.len(), 2);
        assert_eq!(pings(&tree.shells[3]).await.len(), 2);
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}

/// Deactivated agents drop stream traffic; their subtree is cut off
#[test]
fn test_dst_deactivated_agent_drops_traffic() {
    let config = SimConfig::from_env_or_random();

    let result = Simulation::new(config).run(|env| async move {
        let system = env.agent_system(ArborConfig::default())?;
        let tree = Tree::build(&system, vec![None, Some(0), Some(1)], &[]).await?;
        let cancel = CancellationToken::new();

        tree.shells[1].deactivate(&cancel).await?;
        tree.shells[0].publish(&Ping { n: 1 }, Direction::Down).await?;
        settle().await;

        assert!(pings(&tree.shells[1]).await.is_empty());
        assert!(pings(&tree.shells[2]).await.is_empty());

        let err = tree.shells[1]
            .publish(&Ping { n: 2 }, Direction::Up)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotActive { .. }));
        Ok(())
    });

    assert!(result.is_ok(), "Simulation failed: {:?}", result.err());
}
