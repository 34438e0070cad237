//! Fault injection for deterministic testing
//!
//! TigerStyle: Explicit fault types, probabilistic injection.
//!
//! Faults target event store operations. Each fault kind only applies to
//! the operations it can affect (a write failure never fires on a read), so
//! trigger budgets are spent on operations where the fault is observable.

use crate::rng::DeterministicRng;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Operations
// =============================================================================

/// Event store operation consulted by [`FaultInjector::should_inject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Append,
    ReadEvents,
    ReadVersion,
    SaveSnapshot,
    ReadSnapshot,
}

impl StoreOperation {
    /// Every operation, in a stable order
    pub const ALL: [StoreOperation; 5] = [
        StoreOperation::Append,
        StoreOperation::ReadEvents,
        StoreOperation::ReadVersion,
        StoreOperation::SaveSnapshot,
        StoreOperation::ReadSnapshot,
    ];

    /// Name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Append => "event_store.append",
            StoreOperation::ReadEvents => "event_store.read_events",
            StoreOperation::ReadVersion => "event_store.read_version",
            StoreOperation::SaveSnapshot => "event_store.save_snapshot",
            StoreOperation::ReadSnapshot => "event_store.read_snapshot",
        }
    }

    /// Whether the operation mutates the store
    pub fn is_write(&self) -> bool {
        matches!(self, StoreOperation::Append | StoreOperation::SaveSnapshot)
    }

    fn index(&self) -> usize {
        match self {
            StoreOperation::Append => 0,
            StoreOperation::ReadEvents => 1,
            StoreOperation::ReadVersion => 2,
            StoreOperation::SaveSnapshot => 3,
            StoreOperation::ReadSnapshot => 4,
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Fault Types
// =============================================================================

/// Types of faults that can be injected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultType {
    /// Write is rejected, nothing stored
    StorageWriteFail,
    /// Read is rejected
    StorageReadFail,
    /// Operation is delayed
    StorageLatency { min_ms: u64, max_ms: u64 },
    /// Write is stored but the caller sees a failure (lost acknowledgement)
    CrashAfterWrite,
    /// Operation never completes
    StorageHang,
}

impl FaultType {
    /// Human-readable name for this fault type
    pub fn name(&self) -> &'static str {
        match self {
            FaultType::StorageWriteFail => "storage_write_fail",
            FaultType::StorageReadFail => "storage_read_fail",
            FaultType::StorageLatency { .. } => "storage_latency",
            FaultType::CrashAfterWrite => "crash_after_write",
            FaultType::StorageHang => "storage_hang",
        }
    }

    /// Whether this fault can affect `operation`
    pub fn applies_to(&self, operation: StoreOperation) -> bool {
        match self {
            FaultType::StorageWriteFail | FaultType::CrashAfterWrite => operation.is_write(),
            FaultType::StorageReadFail => !operation.is_write(),
            FaultType::StorageLatency { .. } | FaultType::StorageHang => true,
        }
    }

    fn same_kind(&self, other: &FaultType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

// =============================================================================
// Fault Configuration
// =============================================================================

/// One fault injection rule
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub fault_type: FaultType,
    /// Probability of injection per eligible operation, in [0, 1]
    pub probability: f64,
    /// Restrict to these operations (`None` = every applicable operation)
    pub operations: Option<Vec<StoreOperation>>,
    /// Eligible operations to let through before the first trigger
    pub skip_count: u64,
    /// Maximum number of triggers (`None` = unlimited)
    pub max_triggers: Option<u64>,
    /// Whether the rule starts enabled
    pub enabled: bool,
}

impl FaultConfig {
    /// Create a rule
    pub fn new(fault_type: FaultType, probability: f64) -> Self {
        debug_assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1]"
        );
        if let FaultType::StorageLatency { min_ms, max_ms } = &fault_type {
            debug_assert!(min_ms <= max_ms, "latency range is inverted");
        }

        Self {
            fault_type,
            probability,
            operations: None,
            skip_count: 0,
            max_triggers: None,
            enabled: true,
        }
    }

    /// Restrict to `operation` (call repeatedly to allow several)
    pub fn on(mut self, operation: StoreOperation) -> Self {
        debug_assert!(
            self.fault_type.applies_to(operation),
            "fault can never fire on this operation"
        );
        self.operations.get_or_insert_with(Vec::new).push(operation);
        self
    }

    /// Let the first `count` eligible operations through
    pub fn skip_first(mut self, count: u64) -> Self {
        self.skip_count = count;
        self
    }

    /// Trigger at most `max` times
    pub fn max_triggers(mut self, max: u64) -> Self {
        self.max_triggers = Some(max);
        self
    }

    /// Start disabled; see [`FaultInjector::set_enabled`]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn targets(&self, operation: StoreOperation) -> bool {
        self.fault_type.applies_to(operation)
            && self
                .operations
                .as_ref()
                .map_or(true, |ops| ops.contains(&operation))
    }
}

// =============================================================================
// Fault Injector
// =============================================================================

#[derive(Debug)]
struct Rule {
    config: FaultConfig,
    enabled: AtomicBool,
    eligible_count: AtomicU64,
    trigger_count: AtomicU64,
}

/// Decides, per store operation, which fault (if any) to inject
///
/// Rules are evaluated in registration order; the first that fires wins.
#[derive(Debug)]
pub struct FaultInjector {
    rules: Vec<Rule>,
    rng: DeterministicRng,
    operation_counts: [AtomicU64; 5],
}

impl FaultInjector {
    /// Create an injector with no rules
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rules: Vec::new(),
            rng,
            operation_counts: Default::default(),
        }
    }

    /// Add a rule
    pub fn register(&mut self, config: FaultConfig) {
        self.rules.push(Rule {
            enabled: AtomicBool::new(config.enabled),
            config,
            eligible_count: AtomicU64::new(0),
            trigger_count: AtomicU64::new(0),
        });
    }

    /// Enable or disable every rule of the same kind as `fault_type`
    pub fn set_enabled(&self, fault_type: &FaultType, enabled: bool) {
        for rule in &self.rules {
            if rule.config.fault_type.same_kind(fault_type) {
                rule.enabled.store(enabled, Ordering::SeqCst);
            }
        }
    }

    /// Fault to inject into `operation`, if any
    pub fn should_inject(&self, operation: StoreOperation) -> Option<FaultType> {
        self.operation_counts[operation.index()].fetch_add(1, Ordering::SeqCst);

        for rule in &self.rules {
            let config = &rule.config;
            if !rule.enabled.load(Ordering::SeqCst) || !config.targets(operation) {
                continue;
            }
            if rule.eligible_count.fetch_add(1, Ordering::SeqCst) < config.skip_count {
                continue;
            }
            let triggered = rule.trigger_count.load(Ordering::SeqCst);
            if matches!(config.max_triggers, Some(max) if triggered >= max) {
                continue;
            }
            if !self.rng.next_bool(config.probability) {
                continue;
            }

            rule.trigger_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                fault = config.fault_type.name(),
                operation = %operation,
                trigger = triggered + 1,
                "Injecting fault"
            );
            return Some(config.fault_type.clone());
        }

        None
    }

    /// Operations checked so far, across all kinds
    pub fn operation_count(&self) -> u64 {
        self.operation_counts
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }

    /// Times `operation` was checked
    pub fn count_for(&self, operation: StoreOperation) -> u64 {
        self.operation_counts[operation.index()].load(Ordering::SeqCst)
    }

    /// Per-rule statistics
    pub fn stats(&self) -> Vec<FaultStats> {
        self.rules
            .iter()
            .map(|rule| FaultStats {
                fault_type: rule.config.fault_type.name(),
                probability: rule.config.probability,
                trigger_count: rule.trigger_count.load(Ordering::SeqCst),
                enabled: rule.enabled.load(Ordering::SeqCst),
            })
            .collect()
    }
}

/// Statistics for one rule
#[derive(Debug, Clone)]
pub struct FaultStats {
    pub fault_type: &'static str,
    pub probability: f64,
    pub trigger_count: u64,
    pub enabled: bool,
}

/// Builder for a [`FaultInjector`]
pub struct FaultInjectorBuilder {
    rng: DeterministicRng,
    rules: Vec<FaultConfig>,
}

impl FaultInjectorBuilder {
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng,
            rules: Vec::new(),
        }
    }

    pub fn with_fault(mut self, config: FaultConfig) -> Self {
        self.rules.push(config);
        self
    }

    /// Fail reads and writes with the same probability
    pub fn with_storage_faults(self, probability: f64) -> Self {
        self.with_fault(FaultConfig::new(FaultType::StorageWriteFail, probability))
            .with_fault(FaultConfig::new(FaultType::StorageReadFail, probability))
    }

    pub fn build(self) -> FaultInjector {
        let mut injector = FaultInjector::new(self.rng);
        for config in self.rules {
            injector.register(config);
        }
        injector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector(rules: Vec<FaultConfig>) -> FaultInjector {
        rules
            .into_iter()
            .fold(FaultInjectorBuilder::new(DeterministicRng::new(42)), |b, r| {
                b.with_fault(r)
            })
            .build()
    }

    #[test]
    fn test_certain_fault_always_fires() {
        let injector = injector(vec![FaultConfig::new(FaultType::StorageWriteFail, 1.0)]);
        for _ in 0..10 {
            assert_eq!(
                injector.should_inject(StoreOperation::Append),
                Some(FaultType::StorageWriteFail)
            );
        }
    }

    #[test]
    fn test_zero_probability_never_fires() {
        let injector = injector(vec![FaultConfig::new(FaultType::StorageWriteFail, 0.0)]);
        for _ in 0..100 {
            assert!(injector.should_inject(StoreOperation::Append).is_none());
        }
    }

    #[test]
    fn test_faults_only_hit_applicable_operations() {
        let injector = injector(vec![
            FaultConfig::new(FaultType::StorageWriteFail, 1.0).max_triggers(1)
        ]);

        // Reads do not spend the budget
        assert!(injector.should_inject(StoreOperation::ReadEvents).is_none());
        assert!(injector.should_inject(StoreOperation::ReadSnapshot).is_none());
        assert!(injector.should_inject(StoreOperation::SaveSnapshot).is_some());
        assert!(injector.should_inject(StoreOperation::Append).is_none());
    }

    #[test]
    fn test_operation_filter() {
        let injector = injector(vec![
            FaultConfig::new(FaultType::StorageHang, 1.0).on(StoreOperation::Append)
        ]);
        assert!(injector.should_inject(StoreOperation::Append).is_some());
        assert!(injector.should_inject(StoreOperation::ReadEvents).is_none());
        assert_eq!(injector.count_for(StoreOperation::Append), 1);
        assert_eq!(injector.operation_count(), 2);
    }

    #[test]
    fn test_skip_first_and_max_triggers() {
        let injector = injector(vec![FaultConfig::new(FaultType::CrashAfterWrite, 1.0)
            .skip_first(1)
            .max_triggers(2)]);

        assert!(injector.should_inject(StoreOperation::Append).is_none());
        assert!(injector.should_inject(StoreOperation::Append).is_some());
        assert!(injector.should_inject(StoreOperation::Append).is_some());
        assert!(injector.should_inject(StoreOperation::Append).is_none());
        assert_eq!(injector.stats()[0].trigger_count, 2);
    }

    #[test]
    fn test_toggle_by_kind() {
        let injector = injector(vec![
            FaultConfig::new(FaultType::StorageLatency { min_ms: 1, max_ms: 2 }, 1.0).disabled(),
        ]);

        assert!(injector.should_inject(StoreOperation::ReadVersion).is_none());
        // Any latency range selects the same rules
        injector.set_enabled(&FaultType::StorageLatency { min_ms: 0, max_ms: 0 }, true);
        assert!(injector.should_inject(StoreOperation::ReadVersion).is_some());
        assert!(injector.stats()[0].enabled);
    }

    #[test]
    fn test_operation_names() {
        let writes: Vec<_> = StoreOperation::ALL.iter().filter(|op| op.is_write()).collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(StoreOperation::Append.to_string(), "event_store.append");
    }
}
