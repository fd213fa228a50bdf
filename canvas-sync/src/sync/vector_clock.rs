//! Per-server counters for causal bookkeeping across gateway processes.
//!
//! Each process bumps only its own entry when it records an operation.
//! Entries learned from sibling processes are folded in with `merge`.
//! Comparison yields a partial order; nothing here resolves conflicts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Map of server id → number of operations that server recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the entry for `server_id` by one and return the new value.
    pub fn increment(&mut self, server_id: &str) -> u64 {
        let entry = self.0.entry(server_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Counter for `server_id` (0 when absent).
    pub fn get(&self, server_id: &str) -> u64 {
        self.0.get(server_id).copied().unwrap_or(0)
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (server, &count) in &other.0 {
            let entry = self.0.entry(server.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Compare two clocks under the usual happened-before relation.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for server in self.0.keys().chain(other.0.keys()) {
            match self.get(server).cmp(&other.get(server)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
