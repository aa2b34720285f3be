//! Per-pair relaunch cooldowns.
//!
//! After a child exits badly, the pair goes into cooldown so the reconcile
//! pass cannot hot-loop against a broken agent or an exhausted upstream.
//! Only the control loop touches the table.

use crate::registry::InstanceKey;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Why a pair is in cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownKind {
    /// A plain non-zero exit.
    Error,
    /// A detected quota/rate-limit exhaustion; the deadline came from the
    /// quota detector.
    Quota,
}

/// One active cooldown.
#[derive(Debug, Clone)]
pub struct CooldownEntry {
    pub deadline: Instant,
    pub reason: String,
    pub kind: CooldownKind,
}

/// Mapping from instance key to its active cooldown, if any.
#[derive(Debug)]
pub struct CooldownTable {
    entries: HashMap<InstanceKey, CooldownEntry>,
    default_cooldown: Duration,
    max_cooldown: Duration,
}

impl CooldownTable {
    pub fn new(default_seconds: u64, max_seconds: u64) -> Self {
        Self {
            entries: HashMap::new(),
            default_cooldown: Duration::from_secs(default_seconds),
            max_cooldown: Duration::from_secs(max_seconds),
        }
    }

    /// The active entry for `key`, if its deadline has not passed.
    /// Expired entries are removed lazily here.
    pub fn check(&mut self, key: &InstanceKey) -> Option<&CooldownEntry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.deadline <= Instant::now());
        if expired {
            debug!(%key, "cooldown expired");
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    /// Start an error-kind cooldown of the configured default length.
    pub fn set_error(&mut self, key: InstanceKey, reason: impl Into<String>) {
        let wait = self.default_cooldown.min(self.max_cooldown);
        self.entries.insert(
            key,
            CooldownEntry {
                deadline: Instant::now() + wait,
                reason: reason.into(),
                kind: CooldownKind::Error,
            },
        );
    }

    /// Start a quota-kind cooldown, clamped to the configured maximum.
    pub fn set_quota(&mut self, key: InstanceKey, seconds: u64, reason: impl Into<String>) {
        let wait = Duration::from_secs(seconds).min(self.max_cooldown);
        self.entries.insert(
            key,
            CooldownEntry {
                deadline: Instant::now() + wait,
                reason: reason.into(),
                kind: CooldownKind::Quota,
            },
        );
    }

    /// Remove any cooldown for `key`, expired or not.
    pub fn clear(&mut self, key: &InstanceKey) {
        self.entries.remove(key);
    }

    /// All entries whose deadline has not yet passed.
    pub fn active(&self) -> impl Iterator<Item = (&InstanceKey, &CooldownEntry)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.deadline > now)
    }

    /// Seconds until `key` may spawn again; zero when no cooldown is active.
    pub fn remaining_seconds(&self, key: &InstanceKey) -> f64 {
        self.entries
            .get(key)
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}
